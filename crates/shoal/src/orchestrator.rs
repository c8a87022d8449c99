//! Session orchestration.
//!
//! The [`MirrorManager`] owns the whole lifecycle: it starts the relay hub,
//! elects a leader among the live instances, injects the capture script,
//! wires followers and keeps all of that converged as instances open and
//! close. Membership changes arrive as [`MirrorEvent`]s on an internal
//! channel and are applied by a single background task, so rebuilds never
//! run concurrently.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use shoal_proto::{EventEnvelope, HubInfo, InstanceId};
use shoal_relay::RelayHub;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::capture::{capture_script, BRIDGE_FUNCTION};
use crate::config::MirrorConfig;
use crate::error::{reason, EnableOutcome, MirrorError};
use crate::leader::LeaderSession;
use crate::page::{PageEventHandle, PageHandle};
use crate::replay::ReplayClient;

/// Internal lifecycle notifications, applied serially by the manager task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorEvent {
    InstanceOpened(InstanceId),
    InstanceClosed(InstanceId),
    LeaderPageClosed,
    LeaderSocketClosed,
}

/// Snapshot of the session, published on every change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MirrorStatus {
    pub enabled: bool,
    pub leader_id: Option<InstanceId>,
    pub follower_ids: Vec<InstanceId>,
}

/// Where browser instances come from. Implemented by the embedding
/// application over whatever lifecycle manager it runs.
#[async_trait]
pub trait InstanceSource: Send + Sync {
    /// Identifiers of every instance currently alive, in a stable order.
    /// The first eligible entry becomes the leader.
    async fn live_instances(&self) -> Vec<InstanceId>;

    /// Resolve an identifier to a page handle, or `None` if it died since
    /// the listing.
    async fn resolve(&self, id: &InstanceId) -> Option<Arc<dyn PageHandle>>;
}

/// Optional predicate restricting which instances join the session.
pub type InstanceFilter = Arc<dyn Fn(&InstanceId) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Disabled,
    Enabling,
    Enabled,
    Disabling,
}

struct LeaderWiring {
    instance_id: InstanceId,
    page: Arc<dyn PageHandle>,
    session: Arc<LeaderSession>,
    bridge_handle: PageEventHandle,
    close_handle: PageEventHandle,
}

struct FollowerWiring {
    client: ReplayClient,
}

#[derive(Default)]
struct RoomState {
    leader: Option<LeaderWiring>,
    followers: HashMap<InstanceId, FollowerWiring>,
}

struct Inner {
    config: MirrorConfig,
    hub: RelayHub,
    source: RwLock<Option<Arc<dyn InstanceSource>>>,
    filter: RwLock<Option<InstanceFilter>>,
    phase: Mutex<Phase>,
    state: Mutex<RoomState>,
    /// Serializes rebuilds and leader-socket recovery against each other.
    rebuild_lock: Mutex<()>,
    status_tx: watch::Sender<MirrorStatus>,
    events_tx: mpsc::UnboundedSender<MirrorEvent>,
}

/// Entry point for embedding applications. Cheap to clone; all clones share
/// one session.
#[derive(Clone)]
pub struct MirrorManager {
    inner: Arc<Inner>,
}

impl MirrorManager {
    pub fn new(config: MirrorConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(MirrorStatus::default());
        let hub = RelayHub::with_bind_host(config.bind_host.clone());
        let inner = Arc::new(Inner {
            config,
            hub,
            source: RwLock::new(None),
            filter: RwLock::new(None),
            phase: Mutex::new(Phase::Disabled),
            state: Mutex::new(RoomState::default()),
            rebuild_lock: Mutex::new(()),
            status_tx,
            events_tx,
        });
        tokio::spawn(event_loop(inner.clone(), events_rx));
        Self { inner }
    }

    /// Wire in the instance source. Must happen before `enable`.
    pub async fn set_source(&self, source: Arc<dyn InstanceSource>) {
        *self.inner.source.write().await = Some(source);
    }

    /// Start mirroring. Idempotent: enabling an enabled session rebuilds
    /// against the current membership and returns success.
    pub async fn enable(&self, filter: Option<InstanceFilter>) -> EnableOutcome {
        if self.inner.source.read().await.is_none() {
            return EnableOutcome::failed(reason::NOT_CONFIGURED);
        }
        *self.inner.filter.write().await = filter;
        *self.inner.phase.lock().await = Phase::Enabling;

        if let Err(err) = self.inner.hub.start().await {
            warn!("relay hub failed to start: {err}");
            *self.inner.phase.lock().await = Phase::Disabled;
            self.inner.publish_status().await;
            return EnableOutcome::failed(reason::HUB_FAILED);
        }

        let _guard = self.inner.rebuild_lock.lock().await;
        match self.inner.rebuild_locked().await {
            Ok(true) => {
                *self.inner.phase.lock().await = Phase::Enabled;
                self.inner.publish_status().await;
                info!(room = %self.inner.config.room, "mirroring enabled");
                EnableOutcome::ok()
            }
            Ok(false) => {
                self.inner.teardown_wiring().await;
                self.inner.hub.stop().await;
                *self.inner.phase.lock().await = Phase::Disabled;
                self.inner.publish_status().await;
                EnableOutcome::failed(reason::NO_PAGES)
            }
            Err(err) => {
                warn!("enable failed while wiring the leader: {err}");
                self.inner.teardown_wiring().await;
                self.inner.hub.stop().await;
                *self.inner.phase.lock().await = Phase::Disabled;
                self.inner.publish_status().await;
                EnableOutcome::failed(reason::LEADER_FAILED)
            }
        }
    }

    /// Stop mirroring. Best-effort teardown; always reports success so
    /// callers can treat disable as fire-and-forget.
    pub async fn disable(&self) -> EnableOutcome {
        *self.inner.phase.lock().await = Phase::Disabling;
        let _guard = self.inner.rebuild_lock.lock().await;
        self.inner.teardown_wiring().await;
        self.inner.hub.stop().await;
        *self.inner.phase.lock().await = Phase::Disabled;
        self.inner.publish_status().await;
        info!(room = %self.inner.config.room, "mirroring disabled");
        EnableOutcome::ok()
    }

    pub fn status(&self) -> MirrorStatus {
        self.inner.status_tx.borrow().clone()
    }

    /// Watch the session status; a new value is published on every change.
    pub fn subscribe(&self) -> watch::Receiver<MirrorStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn notify_instance_opened(&self, id: InstanceId) {
        let _ = self.inner.events_tx.send(MirrorEvent::InstanceOpened(id));
    }

    pub fn notify_instance_closed(&self, id: InstanceId) {
        let _ = self.inner.events_tx.send(MirrorEvent::InstanceClosed(id));
    }
}

/// Which events matter in which phase. Membership changes only apply to an
/// enabled session, but a leader socket can drop inside the enabling window
/// (between the socket connect and the phase flip), so its close event must
/// not be discarded there; recovery re-checks the phase once it holds the
/// rebuild lock, after enabling has resolved either way.
fn wants_event(phase: Phase, event: &MirrorEvent) -> bool {
    match event {
        MirrorEvent::LeaderSocketClosed => {
            matches!(phase, Phase::Enabling | Phase::Enabled)
        }
        _ => phase == Phase::Enabled,
    }
}

async fn event_loop(inner: Arc<Inner>, mut events_rx: mpsc::UnboundedReceiver<MirrorEvent>) {
    while let Some(event) = events_rx.recv().await {
        let phase = *inner.phase.lock().await;
        if !wants_event(phase, &event) {
            debug!(?event, ?phase, "ignoring event in this phase");
            continue;
        }
        match event {
            MirrorEvent::InstanceOpened(_)
            | MirrorEvent::InstanceClosed(_)
            | MirrorEvent::LeaderPageClosed => {
                let _guard = inner.rebuild_lock.lock().await;
                if let Err(err) = inner.rebuild_locked().await {
                    warn!("rebuild after membership change failed: {err}");
                }
                inner.publish_status().await;
            }
            MirrorEvent::LeaderSocketClosed => {
                inner.recover_leader_socket().await;
            }
        }
    }
}

impl Inner {
    /// Converge the wiring onto the current membership. Returns `Ok(false)`
    /// when no eligible instances remain (and the wiring has been torn
    /// down). Callers hold `rebuild_lock`.
    async fn rebuild_locked(&self) -> Result<bool, MirrorError> {
        let Some(source) = self.source.read().await.clone() else {
            return Ok(false);
        };
        let filter = self.filter.read().await.clone();
        let live: Vec<InstanceId> = source
            .live_instances()
            .await
            .into_iter()
            .filter(|id| filter.as_ref().map_or(true, |f| f(id)))
            .collect();

        if live.is_empty() {
            self.teardown_wiring().await;
            return Ok(false);
        }

        let hub_info = match self.hub.info().await {
            Some(info) => info,
            None => self.hub.start().await?,
        };

        let mut state = self.state.lock().await;

        // Keep the current leader while it is still live and its page is
        // still open; otherwise elect the first live instance.
        let keep_leader = state.leader.as_ref().is_some_and(|leader| {
            live.contains(&leader.instance_id) && !leader.page.is_closed()
        });
        if !keep_leader {
            if let Some(old) = state.leader.take() {
                detach_leader(old);
            }
            let mut elected = None;
            for id in &live {
                if let Some(page) = source.resolve(id).await {
                    if !page.is_closed() {
                        elected = Some((id.clone(), page));
                        break;
                    }
                }
            }
            let Some((id, page)) = elected else {
                self.teardown_followers(&mut state).await;
                return Ok(false);
            };
            // A promoted follower must stop replaying before it captures.
            if let Some(follower) = state.followers.remove(&id) {
                follower.client.disconnect().await;
            }
            info!(leader = %id, "attaching leader");
            let wiring = self.attach_leader(id, page, &hub_info).await?;
            state.leader = Some(wiring);
        }

        let leader_id = state
            .leader
            .as_ref()
            .map(|l| l.instance_id.clone())
            .ok_or_else(|| MirrorError::Socket("leader missing after election".into()))?;

        // Follower diff: drop what left, add what arrived. Untouched
        // followers keep their socket and replay state.
        let stale: Vec<InstanceId> = state
            .followers
            .keys()
            .filter(|id| !live.contains(id) || **id == leader_id)
            .cloned()
            .collect();
        for id in stale {
            if let Some(follower) = state.followers.remove(&id) {
                debug!(follower = %id, "detaching follower");
                follower.client.disconnect().await;
            }
        }
        for id in &live {
            if *id == leader_id || state.followers.contains_key(id) {
                continue;
            }
            let Some(page) = source.resolve(id).await else {
                continue;
            };
            if page.is_closed() {
                continue;
            }
            match ReplayClient::connect(
                &hub_info,
                &self.config.room,
                id.clone(),
                page,
                self.config.viewport_cache_ttl,
            )
            .await
            {
                Ok(client) => {
                    debug!(follower = %id, "follower attached");
                    state.followers.insert(id.clone(), FollowerWiring { client });
                }
                Err(err) => warn!(follower = %id, "follower attach failed: {err}"),
            }
        }

        Ok(true)
    }

    /// Inject the capture script and open the leader socket. Order matters:
    /// the bridge must exist before the immediate evaluation runs, and the
    /// socket connects last so the init envelope drains from the queue.
    async fn attach_leader(
        &self,
        instance_id: InstanceId,
        page: Arc<dyn PageHandle>,
        hub_info: &HubInfo,
    ) -> Result<LeaderWiring, MirrorError> {
        let session = Arc::new(LeaderSession::new(
            self.config.room.clone(),
            instance_id.clone(),
            self.events_tx.clone(),
        ));
        let script = capture_script(&self.config.room, instance_id.as_str());

        page.evaluate_on_new_document(&script).await?;

        let handle = session.handle();
        let bridge_handle = page
            .expose_function(
                BRIDGE_FUNCTION,
                Arc::new(move |raw: String| match EventEnvelope::from_wire(&raw) {
                    Ok(envelope) => handle.push(envelope),
                    Err(err) => warn!("dropping malformed bridge payload: {err}"),
                }),
            )
            .await?;

        let events = self.events_tx.clone();
        let close_handle = page.on_close(Arc::new(move || {
            let _ = events.send(MirrorEvent::LeaderPageClosed);
        }));

        page.evaluate(&script).await?;
        session.connect(hub_info).await?;

        Ok(LeaderWiring {
            instance_id,
            page,
            session,
            bridge_handle,
            close_handle,
        })
    }

    /// Reopen the leader socket with bounded backoff, reusing the existing
    /// queue and bridge wiring. Falls back to a full rebuild when the
    /// retries are exhausted.
    async fn recover_leader_socket(&self) {
        let _guard = self.rebuild_lock.lock().await;
        if *self.phase.lock().await != Phase::Enabled {
            return;
        }

        let mut delay = self.config.leader_retry_base_delay;
        for attempt in 1..=self.config.leader_retry_max {
            tokio::time::sleep(delay).await;
            delay *= 2;

            let hub_info = match self.hub.info().await {
                Some(info) => info,
                None => match self.hub.start().await {
                    Ok(info) => info,
                    Err(err) => {
                        warn!(attempt, "hub restart failed during recovery: {err}");
                        continue;
                    }
                },
            };

            let session = {
                let state = self.state.lock().await;
                match state.leader.as_ref() {
                    Some(leader) if !leader.page.is_closed() => leader.session.clone(),
                    _ => break,
                }
            };
            match session.connect(&hub_info).await {
                Ok(()) => {
                    info!(attempt, "leader socket reopened");
                    return;
                }
                Err(err) => warn!(attempt, "leader socket reopen failed: {err}"),
            }
        }

        warn!("leader socket recovery exhausted, rebuilding");
        if let Err(err) = self.rebuild_locked().await {
            warn!("rebuild after failed recovery: {err}");
        }
        self.publish_status().await;
    }

    async fn teardown_wiring(&self) {
        let mut state = self.state.lock().await;
        if let Some(leader) = state.leader.take() {
            detach_leader(leader);
        }
        self.teardown_followers(&mut state).await;
    }

    async fn teardown_followers(&self, state: &mut RoomState) {
        for (id, follower) in state.followers.drain() {
            debug!(follower = %id, "detaching follower");
            follower.client.disconnect().await;
        }
    }

    async fn publish_status(&self) {
        let enabled = *self.phase.lock().await == Phase::Enabled;
        let state = self.state.lock().await;
        let mut follower_ids: Vec<InstanceId> = state.followers.keys().cloned().collect();
        follower_ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        let status = MirrorStatus {
            enabled,
            leader_id: state.leader.as_ref().map(|l| l.instance_id.clone()),
            follower_ids,
        };
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

fn detach_leader(mut wiring: LeaderWiring) {
    debug!(leader = %wiring.instance_id, "detaching leader");
    wiring.session.close();
    wiring.bridge_handle.detach();
    wiring.close_handle.detach();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leader_socket_close_is_handled_while_enabling() {
        let event = MirrorEvent::LeaderSocketClosed;
        assert!(wants_event(Phase::Enabling, &event));
        assert!(wants_event(Phase::Enabled, &event));
        assert!(!wants_event(Phase::Disabling, &event));
        assert!(!wants_event(Phase::Disabled, &event));
    }

    #[test]
    fn membership_events_only_apply_when_enabled() {
        let event = MirrorEvent::InstanceOpened(InstanceId::from("nav-1"));
        assert!(wants_event(Phase::Enabled, &event));
        assert!(!wants_event(Phase::Enabling, &event));
        assert!(!wants_event(Phase::Disabled, &event));

        let close = MirrorEvent::LeaderPageClosed;
        assert!(wants_event(Phase::Enabled, &close));
        assert!(!wants_event(Phase::Enabling, &close));
    }
}
