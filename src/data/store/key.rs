//! Store key builder
//!
//! Centralizes the keyspace shape from SPEC_FULL.md §6 so the exact prefix
//! strings live in one place.

pub struct StoreKey;

impl StoreKey {
    /// `session:<id>` — hash, session record
    pub fn session(id: &str) -> String {
        format!("session:{id}")
    }

    /// `stream:<id>` — stream, event log
    pub fn stream(id: &str) -> String {
        format!("stream:{id}")
    }

    /// `delivered:<id>` — set, delivered event ids
    pub fn delivered(id: &str) -> String {
        format!("delivered:{id}")
    }

    /// `cancel:<id>` — string, cancellation flag
    pub fn cancel(id: &str) -> String {
        format!("cancel:{id}")
    }

    /// `lock:<name>` — string, owner token
    pub fn lock(name: &str) -> String {
        format!("lock:{name}")
    }

    /// `rl:<ident>:<route>` — zset, sliding-window timestamps
    pub fn rate_limit(identifier: &str, route: &str) -> String {
        format!("rl:{identifier}:{route}")
    }

    /// Name of the consumer group for a session's event log. One group per
    /// session; consumers are short-lived per-connection identities within it.
    pub fn consumer_group(_session_id: &str) -> &'static str {
        "sse"
    }

    /// Scoped lock name for worker dispatch idempotency: `session:<id>:execute`.
    pub fn session_lock_name(session_id: &str, op: &str) -> String {
        format!("session:{session_id}:{op}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys() {
        assert_eq!(StoreKey::session("s1"), "session:s1");
        assert_eq!(StoreKey::stream("s1"), "stream:s1");
        assert_eq!(StoreKey::delivered("s1"), "delivered:s1");
        assert_eq!(StoreKey::cancel("s1"), "cancel:s1");
        assert_eq!(
            StoreKey::lock("session:s1:execute"),
            "lock:session:s1:execute"
        );
        assert_eq!(
            StoreKey::rate_limit("ip:1.2.3.4", "chat"),
            "rl:ip:1.2.3.4:chat"
        );
        assert_eq!(
            StoreKey::session_lock_name("s1", "execute"),
            "session:s1:execute"
        );
    }
}
