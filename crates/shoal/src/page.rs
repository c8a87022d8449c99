//! Abstraction over one live browser page.
//!
//! The orchestrator never talks to a DevTools connection directly; it sees
//! pages through [`PageHandle`] so the wiring logic can be exercised with
//! in-process fakes. [`crate::cdp_page::CdpPage`] is the production
//! implementation.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use shoal_cdp::InputDispatch;
use thiserror::Error;

/// Callback invoked with the raw string a page-side binding was called with.
pub type BridgeFn = Arc<dyn Fn(String) + Send + Sync>;

/// Callback invoked once when the page goes away.
pub type CloseFn = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Error)]
pub enum PageError {
    #[error("page is closed")]
    Closed,

    #[error("evaluation failed: {0}")]
    Evaluation(String),

    #[error("transport failure: {0}")]
    Transport(String),
}

/// Detaches a registered callback when dropped. `detach()` may also be
/// called explicitly; doing both is harmless.
pub struct PageEventHandle {
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl PageEventHandle {
    pub fn new(detach: impl FnOnce() + Send + 'static) -> Self {
        Self {
            detach: Some(Box::new(detach)),
        }
    }

    /// A handle with nothing to tear down.
    pub fn noop() -> Self {
        Self { detach: None }
    }

    pub fn detach(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for PageEventHandle {
    fn drop(&mut self) {
        self.detach();
    }
}

/// One live browser page, as the orchestrator sees it.
#[async_trait]
pub trait PageHandle: Send + Sync {
    /// Evaluate a script in the page right now.
    async fn evaluate(&self, script: &str) -> Result<Value, PageError>;

    /// Register a script to run before anything else on every future
    /// navigation of this page.
    async fn evaluate_on_new_document(&self, script: &str) -> Result<(), PageError>;

    /// Expose a host function callable from page JavaScript under `name`.
    async fn expose_function(
        &self,
        name: &str,
        callback: BridgeFn,
    ) -> Result<PageEventHandle, PageError>;

    /// Register a callback fired once when the page closes.
    fn on_close(&self, callback: CloseFn) -> PageEventHandle;

    fn is_closed(&self) -> bool;

    /// Open (or reuse) the synthetic-input channel for this page.
    async fn input_session(&self) -> Result<Arc<dyn InputDispatch>, PageError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn handle_detaches_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = count.clone();
        let mut handle = PageEventHandle::new(move || {
            inner.fetch_add(1, Ordering::SeqCst);
        });
        handle.detach();
        handle.detach();
        drop(handle);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handle_detaches_on_drop() {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = count.clone();
        {
            let _handle = PageEventHandle::new(move || {
                inner.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn noop_handle_is_inert() {
        let mut handle = PageEventHandle::noop();
        handle.detach();
    }
}
