use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use shoal_proto::{ConnectionQuery, HubInfo, MIRROR_PATH};

use crate::error::RelayError;

/// Registry of open sockets, keyed by a hub-local connection id. One writer
/// channel per socket so the broadcast loop never awaits a slow peer.
type Connections = Arc<DashMap<Uuid, mpsc::UnboundedSender<Message>>>;

#[derive(Clone)]
struct RelayState {
    conns: Connections,
}

struct Running {
    info: HubInfo,
    serve_task: tokio::task::JoinHandle<()>,
}

/// WebSocket relay that groups every connected socket into one broadcast set.
///
/// `start` is idempotent: the first call binds an ephemeral port on the
/// configured host and later calls return the cached connection info. `stop`
/// force-closes every socket and releases the listener; it is safe to call
/// when the hub was never started.
pub struct RelayHub {
    bind_host: String,
    running: Mutex<Option<Running>>,
    conns: Connections,
}

impl RelayHub {
    /// Hub bound to the loopback interface. There is no authentication
    /// layer, so anything else is opt-in via [`RelayHub::with_bind_host`].
    pub fn new() -> Self {
        Self::with_bind_host("127.0.0.1")
    }

    pub fn with_bind_host(host: impl Into<String>) -> Self {
        Self {
            bind_host: host.into(),
            running: Mutex::new(None),
            conns: Arc::new(DashMap::new()),
        }
    }

    /// Bind the listener and return its connection info. Calling again while
    /// already started returns the same info without binding a second socket.
    pub async fn start(&self) -> Result<HubInfo, RelayError> {
        let mut slot = self.running.lock().await;
        if let Some(running) = slot.as_ref() {
            return Ok(running.info.clone());
        }

        let listener = tokio::net::TcpListener::bind((self.bind_host.as_str(), 0))
            .await
            .map_err(|source| RelayError::Bind {
                host: self.bind_host.clone(),
                source,
            })?;
        let addr = listener.local_addr().map_err(RelayError::LocalAddr)?;

        let state = RelayState {
            conns: self.conns.clone(),
        };
        let app = Router::new()
            .route(MIRROR_PATH, get(ws_handler))
            .with_state(state);

        let serve_task = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                warn!(error = %err, "relay hub server exited with error");
            }
        });

        let info = HubInfo {
            host: self.bind_host.clone(),
            port: addr.port(),
            path: MIRROR_PATH.to_string(),
            url: format!("ws://{}:{}{}", self.bind_host, addr.port(), MIRROR_PATH),
        };
        info!(url = %info.url, "relay hub listening");

        *slot = Some(Running {
            info: info.clone(),
            serve_task,
        });
        Ok(info)
    }

    /// Connection info if the hub is currently running.
    pub async fn info(&self) -> Option<HubInfo> {
        self.running.lock().await.as_ref().map(|r| r.info.clone())
    }

    /// Force-close every open socket, then shut the listener down. A later
    /// `start` binds a fresh port.
    pub async fn stop(&self) {
        let mut slot = self.running.lock().await;
        let Some(running) = slot.take() else {
            return;
        };

        for entry in self.conns.iter() {
            let _ = entry.value().send(Message::Close(None));
        }
        self.conns.clear();
        running.serve_task.abort();
        info!(url = %running.info.url, "relay hub stopped");
    }

    /// Number of currently registered sockets (test/diagnostic hook).
    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }
}

impl Default for RelayHub {
    fn default() -> Self {
        Self::new()
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ConnectionQuery>,
    State(state): State<RelayState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, query, state))
}

async fn handle_socket(socket: WebSocket, query: ConnectionQuery, state: RelayState) {
    let conn_id = Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();

    // Writer task: one channel per socket so broadcasting is a non-blocking
    // channel send from the reader below.
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sender.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    state.conns.insert(conn_id, tx);
    debug!(
        conn = %conn_id,
        role = ?query.role,
        room = query.room.as_deref().unwrap_or(""),
        navigator = query.navigator_id.as_deref().unwrap_or(""),
        "relay connection registered"
    );

    while let Some(frame) = receiver.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(err) => {
                debug!(conn = %conn_id, error = %err, "relay socket read error");
                break;
            }
        };

        match msg {
            // Forward verbatim. Binary passthrough exists only for
            // forward-compatibility; the mirroring subsystem sends text.
            Message::Text(_) | Message::Binary(_) => {
                broadcast_except(&state.conns, conn_id, msg);
            }
            Message::Close(_) => break,
            // Axum answers pings on its own.
            _ => {}
        }
    }

    state.conns.remove(&conn_id);
    debug!(conn = %conn_id, "relay connection removed");

    writer.abort();
    let _ = writer.await;
}

/// Fan a frame out to every registered socket except the sender. Send
/// failures mean the peer is already tearing down; they are logged and
/// swallowed so one dead socket never disturbs the rest.
fn broadcast_except(conns: &Connections, sender_id: Uuid, msg: Message) {
    for entry in conns.iter() {
        if *entry.key() == sender_id {
            continue;
        }
        if entry.value().send(msg.clone()).is_err() {
            debug!(conn = %entry.key(), "dropping frame for disconnected peer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt as _, StreamExt as _};
    use shoal_proto::{InstanceId, Role};
    use std::time::Duration;
    use tokio_tungstenite::{connect_async, tungstenite};

    async fn connect(
        info: &HubInfo,
        role: Role,
        id: &str,
    ) -> tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    > {
        let url = info.connect_url(role, "shoal", &InstanceId::from(id));
        let (stream, _) = connect_async(&url).await.expect("connect to hub");
        stream
    }

    async fn recv_text(
        stream: &mut tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) -> Option<String> {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), stream.next())
                .await
                .ok()??;
            match frame.ok()? {
                tungstenite::Message::Text(text) => return Some(text),
                tungstenite::Message::Close(_) => return None,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn start_is_idempotent_under_concurrent_calls() {
        let hub = RelayHub::new();
        let (a, b) = tokio::join!(hub.start(), hub.start());
        let a = a.expect("first start");
        let b = b.expect("second start");
        assert_eq!(a.port, b.port);
        assert_eq!(a.url, b.url);
        hub.stop().await;
    }

    #[tokio::test]
    async fn frames_fan_out_to_every_other_socket() {
        let hub = RelayHub::new();
        let info = hub.start().await.expect("start hub");

        let mut leader = connect(&info, Role::Leader, "nav-leader").await;
        let mut f1 = connect(&info, Role::Follower, "nav-f1").await;
        let mut f2 = connect(&info, Role::Follower, "nav-f2").await;

        // Give the hub a moment to register all three sockets.
        tokio::time::timeout(Duration::from_secs(5), async {
            while hub.connection_count() < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("sockets registered");

        leader
            .send(tungstenite::Message::Text("hello followers".into()))
            .await
            .expect("send");

        assert_eq!(recv_text(&mut f1).await.as_deref(), Some("hello followers"));
        assert_eq!(recv_text(&mut f2).await.as_deref(), Some("hello followers"));

        // The sender must not hear its own frame back.
        let echo = tokio::time::timeout(Duration::from_millis(200), leader.next()).await;
        assert!(echo.is_err(), "sender received its own frame");

        hub.stop().await;
    }

    #[tokio::test]
    async fn binary_frames_pass_through_verbatim() {
        let hub = RelayHub::new();
        let info = hub.start().await.expect("start hub");

        let mut a = connect(&info, Role::Leader, "nav-a").await;
        let mut b = connect(&info, Role::Follower, "nav-b").await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while hub.connection_count() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("sockets registered");

        a.send(tungstenite::Message::Binary(vec![0, 159, 146, 150]))
            .await
            .expect("send binary");

        let frame = tokio::time::timeout(Duration::from_secs(5), b.next())
            .await
            .expect("frame in time")
            .expect("stream open")
            .expect("frame ok");
        assert_eq!(
            frame,
            tungstenite::Message::Binary(vec![0, 159, 146, 150])
        );

        hub.stop().await;
    }

    #[tokio::test]
    async fn disconnect_prunes_the_registry() {
        let hub = RelayHub::new();
        let info = hub.start().await.expect("start hub");

        let a = connect(&info, Role::Follower, "nav-a").await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while hub.connection_count() < 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("socket registered");

        drop(a);
        tokio::time::timeout(Duration::from_secs(5), async {
            while hub.connection_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("socket pruned");

        hub.stop().await;
    }

    #[tokio::test]
    async fn stop_without_start_is_a_no_op() {
        let hub = RelayHub::new();
        hub.stop().await;
        assert!(hub.info().await.is_none());
    }
}
