use std::time::Duration;

/// Quiet period after the last watcher event before a batch is synced.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(300);

/// Recoverable diff failures are retried this many times.
pub const RETRY_ATTEMPTS: u32 = 5;
pub const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Environment variable that enables debug output like `--debug`.
pub const DEBUG_ENV: &str = "TANDEM_DEBUG";

/// Remote shell used to reach peers.
pub const SSH_BINARY: &str = "ssh";
