//! API key authentication
//!
//! A flat allowlist check against `AppConfig.auth.api_keys`, compared in
//! constant time (see SPEC_FULL.md §6).

use crate::utils::crypto::constant_time_eq;

/// Returns the matched key (used as the rate-limit identity) if `presented`
/// is in `allowlist`.
pub fn authenticate(allowlist: &[String], presented: &str) -> Option<String> {
    allowlist
        .iter()
        .find(|key| constant_time_eq(key, presented))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_allowlisted_key() {
        let allowlist = vec!["key-a".to_string(), "key-b".to_string()];
        assert_eq!(authenticate(&allowlist, "key-b"), Some("key-b".to_string()));
    }

    #[test]
    fn test_rejects_unknown_key() {
        let allowlist = vec!["key-a".to_string()];
        assert!(authenticate(&allowlist, "key-z").is_none());
    }

    #[test]
    fn test_empty_allowlist_rejects_everything() {
        assert!(authenticate(&[], "anything").is_none());
    }

    #[test]
    fn test_rejects_different_length_key() {
        let allowlist = vec!["key-a".to_string()];
        assert!(authenticate(&allowlist, "key-a-but-longer").is_none());
    }
}
