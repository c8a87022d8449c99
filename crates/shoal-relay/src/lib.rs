//! Relay hub for shoal mirroring sessions.
//!
//! The hub is a deliberately dumb fan-out: it accepts WebSocket connections
//! on one route, keeps a process-wide set of open sockets, and rebroadcasts
//! every inbound frame verbatim to every other socket. It never inspects
//! payloads and never partitions by room at the transport layer; envelopes
//! self-identify their room and recipients filter.

mod error;
mod hub;

pub use error::RelayError;
pub use hub::RelayHub;
