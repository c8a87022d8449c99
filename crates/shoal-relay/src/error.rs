use thiserror::Error;

/// Failures surfaced by [`crate::RelayHub::start`]. Per-connection send
/// failures are swallowed and logged instead; they never reach the caller.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to bind relay listener on {host}: {source}")]
    Bind {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("relay listener has no local address: {0}")]
    LocalAddr(#[source] std::io::Error),
}
