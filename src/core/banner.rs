//! Startup banner

use super::constants::APP_NAME;

fn is_all_interfaces(host: &str) -> bool {
    host == "0.0.0.0" || host == "::"
}

/// Print the startup banner with the listen address and the backends in use.
pub fn print_banner(host: &str, port: u16, store_backend: &str, auth_enabled: bool) {
    let display_host = if is_all_interfaces(host) { "localhost" } else { host };
    const W: usize = 16;

    println!();
    println!(
        "  \x1b[1m\x1b[36m{}\x1b[0m \x1b[90mv{}\x1b[0m",
        APP_NAME,
        env!("CARGO_PKG_VERSION")
    );
    println!();
    println!(
        "  \x1b[32m➜\x1b[0m  \x1b[1m{:<W$}\x1b[0m http://{}:{}",
        "Listening:", display_host, port
    );
    println!(
        "  \x1b[90m➜  {:<W$} {}\x1b[0m",
        "Store backend:", store_backend
    );
    println!(
        "  \x1b[90m➜  {:<W$} {}\x1b[0m",
        "Auth:",
        if auth_enabled { "enabled" } else { "disabled (no API_KEYS/JWT_SECRET)" }
    );
    if host == "127.0.0.1" || host == "localhost" {
        println!(
            "  \x1b[90m➜  {:<W$} use --host 0.0.0.0 to expose\x1b[0m",
            "Network:"
        );
    }
    println!();
}
