//! WebSocket JSON-RPC client for one DevTools target.
//!
//! Commands go out with auto-incrementing ids and responses are correlated
//! back through oneshot channels. Protocol events fan out on a broadcast
//! channel because the mirror attaches more than one listener per page (the
//! bridge consumer and the close watcher).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::{classify_cdp_error, CdpError};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;
type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<CdpResponse>>>>;

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A protocol event pushed by the browser (e.g. `Runtime.bindingCalled`).
#[derive(Debug, Clone)]
pub struct CdpEvent {
    pub method: String,
    pub params: Value,
}

/// A correlated response to one command.
#[derive(Debug, Clone)]
pub struct CdpResponse {
    pub id: u64,
    pub result: Option<Value>,
    pub error: Option<CdpResponseError>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct CdpResponseError {
    pub code: i64,
    pub message: String,
}

#[derive(serde::Serialize)]
struct CdpCommand<'a> {
    id: u64,
    method: &'a str,
    params: Value,
}

/// Client for one DevTools WebSocket endpoint. Shared behind an `Arc`; the
/// write half is mutex-guarded, reads happen on a background task.
pub struct CdpClient {
    next_id: AtomicU64,
    pending: Pending,
    writer: Mutex<WsSink>,
    events: broadcast::Sender<CdpEvent>,
    closed: Arc<AtomicBool>,
    _reader: tokio::task::JoinHandle<()>,
}

impl CdpClient {
    pub async fn connect(ws_url: &str) -> Result<Self, CdpError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(ws_url).await.map_err(|e| {
            CdpError::ConnectionFailed {
                url: ws_url.to_string(),
                reason: e.to_string(),
            }
        })?;
        info!(url = ws_url, "devtools socket connected");

        let (writer, reader) = ws_stream.split();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let closed = Arc::new(AtomicBool::new(false));

        let reader_task = tokio::spawn(read_loop(
            reader,
            pending.clone(),
            events.clone(),
            closed.clone(),
        ));

        Ok(Self {
            next_id: AtomicU64::new(1),
            pending,
            writer: Mutex::new(writer),
            events,
            closed,
            _reader: reader_task,
        })
    }

    /// True once the socket dropped. Every later command fails with
    /// [`CdpError::TargetClosed`].
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Subscribe to protocol events. Slow subscribers lag (broadcast
    /// semantics) rather than backpressuring the reader.
    pub fn subscribe_events(&self) -> broadcast::Receiver<CdpEvent> {
        self.events.subscribe()
    }

    pub async fn send_command(&self, method: &str, params: Value) -> Result<Value, CdpError> {
        self.send_command_with_timeout(method, params, DEFAULT_COMMAND_TIMEOUT)
            .await
    }

    pub async fn send_command_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, CdpError> {
        if self.is_closed() {
            return Err(CdpError::TargetClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let json = serde_json::to_string(&CdpCommand { id, method, params }).map_err(|e| {
            CdpError::Protocol {
                detail: format!("failed to serialize command: {e}"),
            }
        })?;

        // Register before sending so a fast response cannot race the entry.
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        debug!(id, method, "sending CDP command");
        {
            let mut writer = self.writer.lock().await;
            if writer.send(Message::Text(json)).await.is_err() {
                self.pending.lock().await.remove(&id);
                return Err(CdpError::TargetClosed);
            }
        }

        let response = tokio::time::timeout(timeout, rx)
            .await
            .map_err(|_| CdpError::Timeout {
                method: method.to_string(),
                duration: timeout,
            })?
            .map_err(|_| CdpError::TargetClosed)?;

        if let Some(err) = response.error {
            return Err(classify_cdp_error(err.code, &err.message));
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Many CDP domains emit events only after an explicit enable.
    pub async fn enable_domain(&self, domain: &str) -> Result<(), CdpError> {
        self.send_command(&format!("{domain}.enable"), serde_json::json!({}))
            .await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut writer = self.writer.lock().await;
        let _ = writer.send(Message::Close(None)).await;
    }
}

async fn read_loop(
    mut reader: WsStream,
    pending: Pending,
    events: broadcast::Sender<CdpEvent>,
    closed: Arc<AtomicBool>,
) {
    while let Some(frame) = reader.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(err) => {
                warn!(error = %err, "devtools socket read error");
                break;
            }
        };

        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let json: Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "unparseable devtools frame dropped");
                continue;
            }
        };

        if let Some(response) = parse_response(&json) {
            let mut guard = pending.lock().await;
            if let Some(tx) = guard.remove(&response.id) {
                let _ = tx.send(response);
            } else {
                debug!(id = response.id, "response for unknown command id");
            }
        } else if let Some(event) = parse_event(&json) {
            // No subscribers is fine; the event is simply dropped.
            let _ = events.send(event);
        }
    }

    closed.store(true, Ordering::SeqCst);

    // Fail everything still in flight so callers observe the disconnect.
    let mut guard = pending.lock().await;
    for (id, tx) in guard.drain() {
        let _ = tx.send(CdpResponse {
            id,
            result: None,
            error: Some(CdpResponseError {
                code: -1,
                message: "Target closed".to_string(),
            }),
        });
    }
}

/// Frames with an `id` are responses to pending commands.
pub fn parse_response(json: &Value) -> Option<CdpResponse> {
    let id = json.get("id")?.as_u64()?;
    Some(CdpResponse {
        id,
        result: json.get("result").cloned(),
        error: json
            .get("error")
            .and_then(|e| serde_json::from_value(e.clone()).ok()),
    })
}

/// Frames with a `method` and no `id` are events.
pub fn parse_event(json: &Value) -> Option<CdpEvent> {
    if json.get("id").is_some() {
        return None;
    }
    Some(CdpEvent {
        method: json.get("method")?.as_str()?.to_string(),
        params: json.get("params").cloned().unwrap_or(Value::Null),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_frames_parse_with_result() {
        let json = serde_json::json!({
            "id": 3,
            "result": { "frameId": "abc" }
        });
        let response = parse_response(&json).unwrap();
        assert_eq!(response.id, 3);
        assert_eq!(response.result.unwrap()["frameId"], "abc");
        assert!(response.error.is_none());
    }

    #[test]
    fn response_frames_parse_with_error() {
        let json = serde_json::json!({
            "id": 4,
            "error": { "code": -32000, "message": "Target closed" }
        });
        let response = parse_response(&json).unwrap();
        let error = response.error.unwrap();
        assert_eq!(error.code, -32000);
        assert_eq!(error.message, "Target closed");
    }

    #[test]
    fn event_frames_parse_without_id() {
        let json = serde_json::json!({
            "method": "Runtime.bindingCalled",
            "params": { "name": "bridge", "payload": "{}" }
        });
        let event = parse_event(&json).unwrap();
        assert_eq!(event.method, "Runtime.bindingCalled");
        assert_eq!(event.params["name"], "bridge");
    }

    #[test]
    fn frames_with_an_id_are_never_events() {
        let json = serde_json::json!({ "id": 1, "method": "Page.navigate" });
        assert!(parse_event(&json).is_none());
    }

    #[test]
    fn events_without_method_are_dropped() {
        let json = serde_json::json!({ "params": { "x": 1 } });
        assert!(parse_event(&json).is_none());
    }
}
