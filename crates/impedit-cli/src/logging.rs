use std::io::IsTerminal;

use tracing_subscriber::EnvFilter;

/// Filter directives for the stderr log, e.g. `IMPEDIT_LOG=debug`.
pub const LOG_ENV: &str = "IMPEDIT_LOG";

pub fn init() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    // Fails only if a subscriber is already installed.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(std::io::stderr().is_terminal())
        .try_init();
}
