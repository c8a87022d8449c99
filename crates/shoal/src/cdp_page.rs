//! [`PageHandle`] implementation over a DevTools connection.
//!
//! One `CdpPage` per browser instance, addressed by its DevTools WebSocket
//! URL. Script injection rides on `Runtime.evaluate` and
//! `Page.addScriptToEvaluateOnNewDocument`; the capture bridge is a
//! `Runtime.addBinding` binding observed through `Runtime.bindingCalled`
//! events.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use serde_json::Value;
use shoal_cdp::{CdpClient, CdpError, CdpInputSession, InputDispatch};
use tokio::sync::broadcast;
use tracing::debug;

use crate::page::{BridgeFn, CloseFn, PageError, PageEventHandle, PageHandle};

const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct CdpPage {
    client: Arc<CdpClient>,
    session: OnceCell<Arc<CdpInputSession>>,
}

impl CdpPage {
    /// Attach to one page target and enable the domains the mirror needs.
    pub async fn connect(ws_url: &str) -> Result<Self, PageError> {
        let client = Arc::new(CdpClient::connect(ws_url).await.map_err(page_error)?);
        client.enable_domain("Page").await.map_err(page_error)?;
        client.enable_domain("Runtime").await.map_err(page_error)?;
        Ok(Self {
            client,
            session: OnceCell::new(),
        })
    }
}

#[async_trait]
impl PageHandle for CdpPage {
    async fn evaluate(&self, script: &str) -> Result<Value, PageError> {
        let result = self
            .client
            .send_command(
                "Runtime.evaluate",
                serde_json::json!({
                    "expression": script,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await
            .map_err(page_error)?;
        if let Some(details) = result.get("exceptionDetails") {
            let text = details
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or("unknown exception");
            return Err(PageError::Evaluation(text.to_string()));
        }
        Ok(result
            .get("result")
            .and_then(|r| r.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn evaluate_on_new_document(&self, script: &str) -> Result<(), PageError> {
        self.client
            .send_command(
                "Page.addScriptToEvaluateOnNewDocument",
                serde_json::json!({ "source": script }),
            )
            .await
            .map_err(page_error)?;
        Ok(())
    }

    async fn expose_function(
        &self,
        name: &str,
        callback: BridgeFn,
    ) -> Result<PageEventHandle, PageError> {
        self.client
            .send_command("Runtime.addBinding", serde_json::json!({ "name": name }))
            .await
            .map_err(page_error)?;

        let mut events = self.client.subscribe_events();
        let name = name.to_string();
        let task = tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    // Lag only skips events; the binding stream keeps going.
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if event.method != "Runtime.bindingCalled" {
                    continue;
                }
                let called = event.params.get("name").and_then(Value::as_str);
                if called != Some(name.as_str()) {
                    continue;
                }
                if let Some(payload) = event.params.get("payload").and_then(Value::as_str) {
                    callback(payload.to_string());
                }
            }
            debug!(binding = %name, "binding listener stopped");
        });
        Ok(PageEventHandle::new(move || task.abort()))
    }

    fn on_close(&self, callback: CloseFn) -> PageEventHandle {
        let client = self.client.clone();
        let mut events = self.client.subscribe_events();
        let task = tokio::spawn(async move {
            loop {
                if client.is_closed() {
                    break;
                }
                tokio::select! {
                    event = events.recv() => {
                        match event {
                            Ok(event) if event.method == "Inspector.detached" => break,
                            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    _ = tokio::time::sleep(CLOSE_POLL_INTERVAL) => {}
                }
            }
            callback();
        });
        PageEventHandle::new(move || task.abort())
    }

    fn is_closed(&self) -> bool {
        self.client.is_closed()
    }

    async fn input_session(&self) -> Result<Arc<dyn InputDispatch>, PageError> {
        if self.client.is_closed() {
            return Err(PageError::Closed);
        }
        let session = self
            .session
            .get_or_init(|| Arc::new(CdpInputSession::new(self.client.clone())))
            .clone();
        Ok(session)
    }
}

fn page_error(err: CdpError) -> PageError {
    if err.is_target_closed() {
        PageError::Closed
    } else {
        PageError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use std::sync::Mutex;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    /// Minimal DevTools stand-in: acks every command with an empty result
    /// and emits one `Runtime.bindingCalled` right after `Runtime.addBinding`.
    async fn spawn_fake_devtools() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let (mut tx, mut rx) = ws.split();
            while let Some(Ok(Message::Text(text))) = rx.next().await {
                let command: Value = serde_json::from_str(&text).unwrap();
                let id = command["id"].as_u64().unwrap();
                let ack = serde_json::json!({ "id": id, "result": {} });
                tx.send(Message::Text(ack.to_string())).await.unwrap();
                if command["method"] == "Runtime.addBinding" {
                    let name = command["params"]["name"].as_str().unwrap();
                    let event = serde_json::json!({
                        "method": "Runtime.bindingCalled",
                        "params": { "name": name, "payload": "{\"hello\":true}" }
                    });
                    tx.send(Message::Text(event.to_string())).await.unwrap();
                }
            }
        });
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn exposed_binding_delivers_payloads() {
        let url = spawn_fake_devtools().await;
        let page = CdpPage::connect(&url).await.unwrap();

        let received = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = received.clone();
        let _handle = page
            .expose_function(
                "testBridge",
                Arc::new(move |payload| {
                    sink.lock().unwrap().push(payload);
                }),
            )
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if !received.lock().unwrap().is_empty() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "binding never fired");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(received.lock().unwrap()[0], "{\"hello\":true}");
    }

    #[tokio::test]
    async fn new_document_scripts_are_acknowledged() {
        let url = spawn_fake_devtools().await;
        let page = CdpPage::connect(&url).await.unwrap();
        page.evaluate_on_new_document("window.__ready = true;")
            .await
            .unwrap();
        assert!(!page.is_closed());
    }
}
