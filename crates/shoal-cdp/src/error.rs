use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CdpError {
    #[error("failed to connect to {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    #[error("CDP command {method} timed out after {duration:?}")]
    Timeout { method: String, duration: Duration },

    #[error("CDP protocol error: {detail}")]
    Protocol { detail: String },

    #[error("CDP error {code}: {message}")]
    Cdp { code: i64, message: String },

    /// The browser target behind this session is gone. Replay swallows this
    /// variant; the next membership rebuild removes the follower anyway.
    #[error("browser target closed")]
    TargetClosed,
}

impl CdpError {
    pub fn is_target_closed(&self) -> bool {
        matches!(self, CdpError::TargetClosed)
    }
}

/// Map a CDP-level error object onto the taxonomy. Chrome phrases
/// target-gone conditions several ways depending on version and timing.
pub fn classify_cdp_error(code: i64, message: &str) -> CdpError {
    const TARGET_GONE: [&str; 4] = [
        "Target closed",
        "Session closed",
        "Session with given id not found",
        "Inspected target navigated or closed",
    ];
    if TARGET_GONE.iter().any(|needle| message.contains(needle)) {
        return CdpError::TargetClosed;
    }
    CdpError::Cdp {
        code,
        message: message.to_string(),
    }
}
