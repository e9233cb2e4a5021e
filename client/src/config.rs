use std::time::Duration;

pub const DEFAULT_QUIET_WINDOW_MS: u64 = 100;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 3;
pub const DEFAULT_CHANGE_BUFFER: usize = 256;
pub const DEFAULT_OUTBOUND_BUFFER: usize = 64;

/// Quiet window for coalescing outgoing token writes.
pub fn quiet_window() -> Duration {
    std::env::var("LANTERN_QUIET_WINDOW_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .map(Duration::from_millis)
        .unwrap_or_else(|| Duration::from_millis(DEFAULT_QUIET_WINDOW_MS))
}

pub fn http_timeout() -> Duration {
    std::env::var("LANTERN_HTTP_TIMEOUT_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .map(Duration::from_secs)
        .unwrap_or_else(|| Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS))
}

pub fn connect_timeout() -> Duration {
    std::env::var("LANTERN_CONNECT_TIMEOUT_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .map(Duration::from_secs)
        .unwrap_or_else(|| Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
}

/// Buffer size for snapshot-changed notifications.
pub fn change_buffer() -> usize {
    std::env::var("LANTERN_CHANGE_BUFFER")
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_CHANGE_BUFFER)
}

/// Buffer size for outbound push-channel events.
pub fn outbound_buffer() -> usize {
    std::env::var("LANTERN_OUTBOUND_BUFFER")
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_OUTBOUND_BUFFER)
}
