//! Chrome DevTools Protocol plumbing for the shoal mirror.
//!
//! Two layers:
//!
//! - [`client`]: a WebSocket JSON-RPC client with command/response
//!   correlation and an event broadcast, one per browser target.
//! - [`input`]: the per-follower input-dispatch session that turns replayed
//!   envelopes into `Input.dispatchMouseEvent` / `Input.dispatchTouchEvent` /
//!   `Input.dispatchKeyEvent` / `Input.insertText` calls, plus the viewport
//!   and scroll helpers the replay path needs.
//!
//! The target is addressed by its DevTools WebSocket URL
//! (`ws://127.0.0.1:{port}/devtools/page/{target_id}`), which the external
//! lifecycle manager resolves.

pub mod client;
pub mod error;
pub mod input;

pub use client::{CdpClient, CdpEvent, CdpResponse};
pub use error::CdpError;
pub use input::{
    CdpInputSession, InputDispatch, KeyPhase, MouseButton, MousePhase, TouchPhase, TouchPoint,
};
