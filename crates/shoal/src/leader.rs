//! Leader-side socket plumbing.
//!
//! Capture envelopes arrive on the bridge callback before the leader socket
//! has necessarily finished connecting, so they land in an [`OutboundQueue`]
//! first. Once the socket opens the queue drains in arrival order and
//! subsequent pushes go straight through. The queue outlives individual
//! socket connections so nothing is lost across a reconnect.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use shoal_proto::{EventEnvelope, HubInfo, InstanceId, Role};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::error::MirrorError;
use crate::orchestrator::MirrorEvent;

/// FIFO buffer between the capture bridge and the leader socket.
pub struct OutboundQueue {
    pending: VecDeque<EventEnvelope>,
    sink: Option<mpsc::UnboundedSender<String>>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            sink: None,
        }
    }

    /// Queue or forward one envelope depending on socket readiness.
    pub fn push(&mut self, envelope: EventEnvelope) {
        match &self.sink {
            Some(sink) => match envelope.to_wire() {
                Ok(wire) => {
                    if sink.send(wire).is_err() {
                        self.sink = None;
                        self.pending.push_back(envelope);
                    }
                }
                Err(err) => warn!("dropping unserializable envelope: {err}"),
            },
            None => self.pending.push_back(envelope),
        }
    }

    /// The socket is open; flush everything queued so far, in order.
    pub fn mark_ready(&mut self, sink: mpsc::UnboundedSender<String>) {
        while let Some(envelope) = self.pending.pop_front() {
            match envelope.to_wire() {
                Ok(wire) => {
                    if sink.send(wire).is_err() {
                        self.pending.push_front(envelope);
                        return;
                    }
                }
                Err(err) => warn!("dropping unserializable envelope: {err}"),
            }
        }
        self.sink = Some(sink);
    }

    /// The socket went away; buffer again until the next `mark_ready`.
    pub fn mark_closed(&mut self) {
        self.sink = None;
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Cheap clone handed to the bridge closure; pushes into the shared queue.
#[derive(Clone)]
pub struct LeaderHandle {
    queue: Arc<Mutex<OutboundQueue>>,
}

impl LeaderHandle {
    pub fn push(&self, envelope: EventEnvelope) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push(envelope);
        }
    }
}

/// Owns the leader's WebSocket connection into the relay hub.
pub struct LeaderSession {
    room: String,
    instance_id: InstanceId,
    events: mpsc::UnboundedSender<MirrorEvent>,
    queue: Arc<Mutex<OutboundQueue>>,
    closed: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LeaderSession {
    pub fn new(
        room: String,
        instance_id: InstanceId,
        events: mpsc::UnboundedSender<MirrorEvent>,
    ) -> Self {
        Self {
            room,
            instance_id,
            events,
            queue: Arc::new(Mutex::new(OutboundQueue::new())),
            closed: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> LeaderHandle {
        LeaderHandle {
            queue: self.queue.clone(),
        }
    }

    /// Open (or reopen) the leader socket. The queue is shared across
    /// connections, so envelopes captured while disconnected flush once the
    /// new socket is up.
    pub async fn connect(&self, hub: &HubInfo) -> Result<(), MirrorError> {
        let url = hub.connect_url(Role::Leader, &self.room, &self.instance_id);
        let (stream, _) = connect_async(&url)
            .await
            .map_err(|err| MirrorError::Socket(format!("leader connect to {url}: {err}")))?;
        debug!(instance = %self.instance_id, "leader socket open");

        let (mut ws_tx, mut ws_rx) = stream.split();
        let (sink_tx, mut sink_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(wire) = sink_rx.recv().await {
                if ws_tx.send(Message::Text(wire)).await.is_err() {
                    break;
                }
            }
        });

        if let Ok(mut queue) = self.queue.lock() {
            queue.mark_ready(sink_tx);
        }

        let queue = self.queue.clone();
        let closed = self.closed.clone();
        let events = self.events.clone();
        let instance_id = self.instance_id.clone();
        let reader = tokio::spawn(async move {
            // The hub never sends the leader anything meaningful; this loop
            // exists to observe the close.
            while let Some(message) = ws_rx.next().await {
                match message {
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            if let Ok(mut queue) = queue.lock() {
                queue.mark_closed();
            }
            if !closed.load(Ordering::SeqCst) {
                debug!(instance = %instance_id, "leader socket closed");
                let _ = events.send(MirrorEvent::LeaderSocketClosed);
            }
        });

        if let Ok(mut task) = self.task.lock() {
            if let Some(previous) = task.replace(reader) {
                previous.abort();
            }
        }
        Ok(())
    }

    /// Stop the session for good; the closed-socket event is suppressed.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(mut queue) = self.queue.lock() {
            queue.mark_closed();
        }
        if let Ok(mut task) = self.task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

impl Drop for LeaderSession {
    fn drop(&mut self) {
        self.close();
    }
}
