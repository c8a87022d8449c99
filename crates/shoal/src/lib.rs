//! Input mirroring across a fleet of browser instances.
//!
//! One leader instance is observed by an in-page capture script; every
//! pointer, wheel, keyboard, text and scroll action is normalized into an
//! [`shoal_proto::EventEnvelope`], relayed through the
//! [`shoal_relay::RelayHub`], and re-synthesized as low-level input on every
//! follower via its own input-dispatch session, regardless of each
//! follower's viewport size.
//!
//! The [`MirrorManager`] is the only entry point: wire an
//! [`InstanceSource`], call [`MirrorManager::enable`], and feed it
//! membership changes as instances open and close. There is no CLI or
//! standalone process; everything runs on the caller's tokio runtime.

pub mod capture;
pub mod cdp_page;
pub mod config;
pub mod error;
pub mod leader;
pub mod orchestrator;
pub mod page;
pub mod replay;

pub use capture::{capture_script, BRIDGE_FUNCTION};
pub use cdp_page::CdpPage;
pub use config::MirrorConfig;
pub use error::{reason, EnableOutcome, MirrorError};
pub use orchestrator::{InstanceFilter, InstanceSource, MirrorManager, MirrorStatus};
pub use page::{BridgeFn, CloseFn, PageError, PageEventHandle, PageHandle};
pub use replay::ReplayClient;
pub use shoal_proto::InstanceId;
