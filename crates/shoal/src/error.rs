use thiserror::Error;

use crate::page::PageError;

/// Internal plumbing failures. These never escape `enable()`/`disable()`
/// directly; the manager folds them into an [`EnableOutcome`] reason.
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("relay hub error: {0}")]
    Relay(#[from] shoal_relay::RelayError),

    #[error("page error: {0}")]
    Page(#[from] PageError),

    #[error("socket error: {0}")]
    Socket(String),
}

/// Well-known reason strings returned to callers. Failures surface only
/// here and in `status-changed` notifications; there is no separate error
/// channel.
pub mod reason {
    /// No instance source has been wired in.
    pub const NOT_CONFIGURED: &str = "not-configured";
    /// Zero eligible live instances at rebuild time.
    pub const NO_PAGES: &str = "no-pages";
    /// The relay hub failed to start.
    pub const HUB_FAILED: &str = "hub-failed";
    /// The leader could not be wired (injection or socket failure).
    pub const LEADER_FAILED: &str = "leader-failed";
}

/// Synchronous result of `enable()`/`disable()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnableOutcome {
    pub success: bool,
    pub reason: Option<&'static str>,
}

impl EnableOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            reason: None,
        }
    }

    pub fn failed(reason: &'static str) -> Self {
        Self {
            success: false,
            reason: Some(reason),
        }
    }
}
