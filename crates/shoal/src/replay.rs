//! Follower-side replay.
//!
//! Each follower runs one [`ReplayClient`]: a WebSocket into the relay hub
//! plus a [`ReplayEngine`] that translates leader envelopes into synthetic
//! input on this follower's own page. Translation is stateful; the engine
//! tracks the touch sequence, the held-buttons mask and the last pointer
//! position so wheel events land where the pointer was.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use shoal_cdp::{
    CdpError, InputDispatch, KeyPhase, MouseButton, MousePhase, TouchPhase, TouchPoint,
};
use shoal_proto::{
    EventEnvelope, EventPayload, HubInfo, InstanceId, PointerKind, PointerPhase, Role,
    ViewportSize,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::error::MirrorError;
use crate::page::PageHandle;

/// Should this follower act on the given envelope?
///
/// Room and role are checked on the envelope itself rather than trusting the
/// relay; the relay already excludes the sender's own socket, but the
/// self-id check keeps a promoted leader from replaying its own backlog.
pub fn accepts(envelope: &EventEnvelope, room: &str, self_id: &InstanceId) -> bool {
    envelope.room == room && envelope.role == Role::Leader && envelope.instance_id != *self_id
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TouchState {
    Idle,
    Active,
}

/// Translates envelopes into dispatch calls for one follower page.
pub struct ReplayEngine {
    dispatch: Arc<dyn InputDispatch>,
    touch_state: TouchState,
    /// Last normalized pointer position seen, used to place wheel events.
    last_position: Option<(f64, f64)>,
    viewport_cache: Option<(ViewportSize, Instant)>,
    viewport_ttl: Duration,
}

impl ReplayEngine {
    pub fn new(dispatch: Arc<dyn InputDispatch>, viewport_ttl: Duration) -> Self {
        Self {
            dispatch,
            touch_state: TouchState::Idle,
            last_position: None,
            viewport_cache: None,
            viewport_ttl,
        }
    }

    /// Apply one accepted envelope. Target-gone failures are absorbed here
    /// (the page closed mid-replay; the orchestrator will prune it); other
    /// errors propagate for the caller to log.
    pub async fn apply(&mut self, envelope: &EventEnvelope) -> Result<(), CdpError> {
        match &envelope.payload {
            EventPayload::Pointer(p) => {
                let Some(viewport) = self.viewport().await? else {
                    return Ok(());
                };
                let (x, y) = viewport.project(p.normalized_x, p.normalized_y);
                self.last_position = Some((p.normalized_x, p.normalized_y));
                match p.pointer_type {
                    PointerKind::Mouse => {
                        let phase = match p.phase {
                            PointerPhase::Down => MousePhase::Pressed,
                            PointerPhase::Move => MousePhase::Moved,
                            PointerPhase::Up | PointerPhase::Cancel => MousePhase::Released,
                        };
                        let button = match p.phase {
                            PointerPhase::Move => MouseButton::None,
                            _ => MouseButton::from_dom_button(p.button),
                        };
                        absorb_target_closed(
                            self.dispatch
                                .mouse_event(phase, x, y, button, p.buttons_mask, p.modifiers)
                                .await,
                        )?;
                    }
                    PointerKind::Touch => {
                        let force = if p.pressure > 0.0 { p.pressure } else { 1.0 };
                        let point = TouchPoint {
                            x,
                            y,
                            id: p.pointer_id,
                            force,
                        };
                        self.apply_touch(p.phase, point).await?;
                    }
                }
            }
            EventPayload::Wheel(w) => {
                let Some(viewport) = self.viewport().await? else {
                    return Ok(());
                };
                let (nx, ny) = self.last_position.unwrap_or((w.normalized_x, w.normalized_y));
                let (x, y) = viewport.project(nx, ny);
                absorb_target_closed(
                    self.dispatch
                        .wheel_event(x, y, w.delta_x, w.delta_y, w.modifiers)
                        .await,
                )?;
            }
            EventPayload::KeyDown(k) => {
                absorb_target_closed(
                    self.dispatch
                        .key_event(KeyPhase::Down, &k.key, &k.code, k.repeat, k.modifiers)
                        .await,
                )?;
            }
            EventPayload::KeyUp(k) => {
                absorb_target_closed(
                    self.dispatch
                        .key_event(KeyPhase::Up, &k.key, &k.code, k.repeat, k.modifiers)
                        .await,
                )?;
            }
            EventPayload::InsertText(t) => {
                absorb_target_closed(self.dispatch.insert_text(&t.value).await)?;
            }
            EventPayload::Scroll(s) => {
                absorb_target_closed(self.dispatch.scroll_to(s.x, s.y).await)?;
            }
            EventPayload::Visibility(_) | EventPayload::Init(_) => {}
        }
        Ok(())
    }

    /// Touch sequences must stay well-formed even if the follower joined
    /// mid-gesture: a move while idle opens an implicit sequence, and an
    /// up or cancel while idle dispatches nothing at all.
    async fn apply_touch(&mut self, phase: PointerPhase, point: TouchPoint) -> Result<(), CdpError> {
        match (self.touch_state, phase) {
            (_, PointerPhase::Down) => {
                absorb_target_closed(
                    self.dispatch
                        .touch_event(TouchPhase::Start, vec![point])
                        .await,
                )?;
                self.touch_state = TouchState::Active;
            }
            (TouchState::Active, PointerPhase::Move) => {
                absorb_target_closed(
                    self.dispatch
                        .touch_event(TouchPhase::Move, vec![point])
                        .await,
                )?;
            }
            (TouchState::Idle, PointerPhase::Move) => {
                absorb_target_closed(
                    self.dispatch
                        .touch_event(TouchPhase::Start, vec![point])
                        .await,
                )?;
                absorb_target_closed(
                    self.dispatch
                        .touch_event(TouchPhase::Move, vec![point])
                        .await,
                )?;
                self.touch_state = TouchState::Active;
            }
            (TouchState::Active, PointerPhase::Up) => {
                absorb_target_closed(
                    self.dispatch.touch_event(TouchPhase::End, Vec::new()).await,
                )?;
                self.touch_state = TouchState::Idle;
            }
            (TouchState::Active, PointerPhase::Cancel) => {
                absorb_target_closed(
                    self.dispatch
                        .touch_event(TouchPhase::Cancel, Vec::new())
                        .await,
                )?;
                self.touch_state = TouchState::Idle;
            }
            (TouchState::Idle, PointerPhase::Up | PointerPhase::Cancel) => {}
        }
        Ok(())
    }

    /// This follower's viewport, re-measured at most once per TTL. Pointer
    /// streams run at display rate, so every event asking the page for its
    /// size would double the CDP traffic. `None` means the target is gone;
    /// the event is dropped like any other target-gone dispatch.
    async fn viewport(&mut self) -> Result<Option<ViewportSize>, CdpError> {
        if let Some((size, measured_at)) = self.viewport_cache {
            if measured_at.elapsed() < self.viewport_ttl {
                return Ok(Some(size));
            }
        }
        match self.dispatch.viewport().await {
            Ok(size) => {
                self.viewport_cache = Some((size, Instant::now()));
                Ok(Some(size))
            }
            Err(err) if err.is_target_closed() => {
                debug!("dropping event for closed target");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

fn absorb_target_closed(result: Result<(), CdpError>) -> Result<(), CdpError> {
    match result {
        Err(err) if err.is_target_closed() => {
            debug!("dropping event for closed target");
            Ok(())
        }
        other => other,
    }
}

/// One follower's connection to the relay hub.
pub struct ReplayClient {
    instance_id: InstanceId,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReplayClient {
    /// Connect to the hub as a follower and start replaying. The input
    /// session is opened lazily on the first accepted envelope, so followers
    /// that never receive traffic cost nothing beyond the socket.
    pub async fn connect(
        hub: &HubInfo,
        room: &str,
        instance_id: InstanceId,
        page: Arc<dyn PageHandle>,
        viewport_ttl: Duration,
    ) -> Result<Self, MirrorError> {
        let url = hub.connect_url(Role::Follower, room, &instance_id);
        let (stream, _) = connect_async(&url)
            .await
            .map_err(|err| MirrorError::Socket(format!("follower connect to {url}: {err}")))?;
        debug!(instance = %instance_id, "follower socket open");

        let room = room.to_string();
        let self_id = instance_id.clone();
        let task = tokio::spawn(async move {
            let (_, mut ws_rx) = stream.split();
            let mut engine: Option<ReplayEngine> = None;
            while let Some(message) = ws_rx.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let envelope = match EventEnvelope::from_wire(&text) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        warn!(instance = %self_id, "dropping malformed envelope: {err}");
                        continue;
                    }
                };
                if !accepts(&envelope, &room, &self_id) {
                    continue;
                }
                if engine.is_none() {
                    match page.input_session().await {
                        Ok(dispatch) => {
                            engine = Some(ReplayEngine::new(dispatch, viewport_ttl));
                        }
                        Err(err) => {
                            warn!(instance = %self_id, "input session unavailable: {err}");
                            break;
                        }
                    }
                }
                if let Some(engine) = engine.as_mut() {
                    if let Err(err) = engine.apply(&envelope).await {
                        warn!(instance = %self_id, "replay dispatch failed: {err}");
                    }
                }
            }
            debug!(instance = %self_id, "follower socket closed");
        });

        Ok(Self {
            instance_id,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// Tear the follower down. Safe to call more than once.
    pub async fn disconnect(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use shoal_proto::{
        PointerPayload, ScrollPosition, ViewportInfo, WheelPayload,
    };
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Mouse(MousePhase, f64, f64, u32),
        Touch(TouchPhase, usize),
        Key(KeyPhase, String),
        Wheel(f64, f64, f64, f64),
        InsertText(String),
        ScrollTo(f64, f64),
    }

    struct MockDispatch {
        calls: StdMutex<Vec<Call>>,
        viewport: ViewportSize,
        viewport_queries: AtomicUsize,
        fail_target_closed: AtomicBool,
    }

    impl MockDispatch {
        fn new(width: f64, height: f64) -> Arc<Self> {
            Arc::new(Self {
                calls: StdMutex::new(Vec::new()),
                viewport: ViewportSize::new(width, height),
                viewport_queries: AtomicUsize::new(0),
                fail_target_closed: AtomicBool::new(false),
            })
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: Call) -> Result<(), CdpError> {
            if self.fail_target_closed.load(Ordering::SeqCst) {
                return Err(CdpError::TargetClosed);
            }
            self.calls.lock().unwrap().push(call);
            Ok(())
        }
    }

    #[async_trait]
    impl InputDispatch for MockDispatch {
        async fn mouse_event(
            &self,
            phase: MousePhase,
            x: f64,
            y: f64,
            _button: MouseButton,
            buttons: u32,
            _modifiers: u32,
        ) -> Result<(), CdpError> {
            self.record(Call::Mouse(phase, x, y, buttons))
        }

        async fn touch_event(
            &self,
            phase: TouchPhase,
            points: Vec<TouchPoint>,
        ) -> Result<(), CdpError> {
            self.record(Call::Touch(phase, points.len()))
        }

        async fn key_event(
            &self,
            phase: KeyPhase,
            key: &str,
            _code: &str,
            _repeat: bool,
            _modifiers: u32,
        ) -> Result<(), CdpError> {
            self.record(Call::Key(phase, key.to_string()))
        }

        async fn wheel_event(
            &self,
            x: f64,
            y: f64,
            delta_x: f64,
            delta_y: f64,
            _modifiers: u32,
        ) -> Result<(), CdpError> {
            self.record(Call::Wheel(x, y, delta_x, delta_y))
        }

        async fn insert_text(&self, text: &str) -> Result<(), CdpError> {
            self.record(Call::InsertText(text.to_string()))
        }

        async fn scroll_to(&self, x: f64, y: f64) -> Result<(), CdpError> {
            self.record(Call::ScrollTo(x, y))
        }

        async fn viewport(&self) -> Result<ViewportSize, CdpError> {
            if self.fail_target_closed.load(Ordering::SeqCst) {
                return Err(CdpError::TargetClosed);
            }
            self.viewport_queries.fetch_add(1, Ordering::SeqCst);
            Ok(self.viewport)
        }
    }

    fn envelope(payload: EventPayload) -> EventEnvelope {
        EventEnvelope {
            role: Role::Leader,
            room: "shoal".to_string(),
            instance_id: InstanceId::from("nav-leader"),
            timestamp: 0.0,
            source_url: "https://example.test/".to_string(),
            is_top_frame: true,
            viewport: ViewportInfo {
                inner: ViewportSize::new(1000.0, 800.0),
                outer: ViewportSize::new(1000.0, 800.0),
                visual_viewport: None,
            },
            scroll_position: ScrollPosition { x: 0.0, y: 0.0 },
            payload,
        }
    }

    fn pointer(kind: PointerKind, phase: PointerPhase, nx: f64, ny: f64) -> EventEnvelope {
        envelope(EventPayload::Pointer(PointerPayload {
            pointer_type: kind,
            pointer_id: 1,
            phase,
            button: 0,
            buttons_mask: match phase {
                PointerPhase::Down | PointerPhase::Move => 1,
                _ => 0,
            },
            normalized_x: nx,
            normalized_y: ny,
            pixel_x: nx * 1000.0,
            pixel_y: ny * 800.0,
            pressure: 0.5,
            modifiers: 0,
        }))
    }

    #[tokio::test]
    async fn mouse_down_projects_into_follower_viewport() {
        let dispatch = MockDispatch::new(500.0, 400.0);
        let mut engine = ReplayEngine::new(dispatch.clone(), Duration::from_millis(250));

        engine
            .apply(&pointer(PointerKind::Mouse, PointerPhase::Down, 0.25, 0.5))
            .await
            .unwrap();

        assert_eq!(
            dispatch.calls(),
            vec![Call::Mouse(MousePhase::Pressed, 125.0, 200.0, 1)]
        );
    }

    #[tokio::test]
    async fn touch_sequence_walks_the_state_machine() {
        let dispatch = MockDispatch::new(500.0, 400.0);
        let mut engine = ReplayEngine::new(dispatch.clone(), Duration::from_millis(250));

        engine
            .apply(&pointer(PointerKind::Touch, PointerPhase::Down, 0.1, 0.1))
            .await
            .unwrap();
        engine
            .apply(&pointer(PointerKind::Touch, PointerPhase::Move, 0.2, 0.2))
            .await
            .unwrap();
        engine
            .apply(&pointer(PointerKind::Touch, PointerPhase::Up, 0.2, 0.2))
            .await
            .unwrap();

        assert_eq!(
            dispatch.calls(),
            vec![
                Call::Touch(TouchPhase::Start, 1),
                Call::Touch(TouchPhase::Move, 1),
                Call::Touch(TouchPhase::End, 0),
            ]
        );
    }

    #[tokio::test]
    async fn touch_move_while_idle_opens_implicit_sequence() {
        let dispatch = MockDispatch::new(500.0, 400.0);
        let mut engine = ReplayEngine::new(dispatch.clone(), Duration::from_millis(250));

        engine
            .apply(&pointer(PointerKind::Touch, PointerPhase::Move, 0.3, 0.3))
            .await
            .unwrap();

        assert_eq!(
            dispatch.calls(),
            vec![
                Call::Touch(TouchPhase::Start, 1),
                Call::Touch(TouchPhase::Move, 1),
            ]
        );
    }

    #[tokio::test]
    async fn touch_up_while_idle_dispatches_nothing() {
        let dispatch = MockDispatch::new(500.0, 400.0);
        let mut engine = ReplayEngine::new(dispatch.clone(), Duration::from_millis(250));

        engine
            .apply(&pointer(PointerKind::Touch, PointerPhase::Up, 0.3, 0.3))
            .await
            .unwrap();
        engine
            .apply(&pointer(PointerKind::Touch, PointerPhase::Cancel, 0.3, 0.3))
            .await
            .unwrap();

        assert!(dispatch.calls().is_empty());
    }

    #[tokio::test]
    async fn wheel_lands_at_last_pointer_position() {
        let dispatch = MockDispatch::new(500.0, 400.0);
        let mut engine = ReplayEngine::new(dispatch.clone(), Duration::from_millis(250));

        engine
            .apply(&pointer(PointerKind::Mouse, PointerPhase::Move, 0.5, 0.5))
            .await
            .unwrap();
        engine
            .apply(&envelope(EventPayload::Wheel(WheelPayload {
                normalized_x: 0.9,
                normalized_y: 0.9,
                delta_x: 0.0,
                delta_y: -120.0,
                modifiers: 0,
            })))
            .await
            .unwrap();

        let calls = dispatch.calls();
        assert_eq!(calls[1], Call::Wheel(250.0, 200.0, 0.0, -120.0));
    }

    #[tokio::test]
    async fn wheel_without_prior_pointer_uses_its_own_position() {
        let dispatch = MockDispatch::new(500.0, 400.0);
        let mut engine = ReplayEngine::new(dispatch.clone(), Duration::from_millis(250));

        engine
            .apply(&envelope(EventPayload::Wheel(WheelPayload {
                normalized_x: 0.5,
                normalized_y: 0.25,
                delta_x: 0.0,
                delta_y: 30.0,
                modifiers: 0,
            })))
            .await
            .unwrap();

        assert_eq!(dispatch.calls(), vec![Call::Wheel(250.0, 100.0, 0.0, 30.0)]);
    }

    #[tokio::test]
    async fn viewport_is_cached_within_ttl() {
        let dispatch = MockDispatch::new(500.0, 400.0);
        let mut engine = ReplayEngine::new(dispatch.clone(), Duration::from_secs(60));

        for _ in 0..5 {
            engine
                .apply(&pointer(PointerKind::Mouse, PointerPhase::Move, 0.5, 0.5))
                .await
                .unwrap();
        }

        assert_eq!(dispatch.viewport_queries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn viewport_refreshes_after_ttl() {
        let dispatch = MockDispatch::new(500.0, 400.0);
        let mut engine = ReplayEngine::new(dispatch.clone(), Duration::from_millis(0));

        engine
            .apply(&pointer(PointerKind::Mouse, PointerPhase::Move, 0.5, 0.5))
            .await
            .unwrap();
        engine
            .apply(&pointer(PointerKind::Mouse, PointerPhase::Move, 0.6, 0.6))
            .await
            .unwrap();

        assert_eq!(dispatch.viewport_queries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn target_closed_failures_are_absorbed() {
        let dispatch = MockDispatch::new(500.0, 400.0);
        let mut engine = ReplayEngine::new(dispatch.clone(), Duration::from_millis(250));
        dispatch.fail_target_closed.store(true, Ordering::SeqCst);

        engine
            .apply(&envelope(EventPayload::InsertText(
                shoal_proto::InsertTextPayload {
                    value: "hi".to_string(),
                    selection_start: None,
                    selection_end: None,
                },
            )))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn viewport_target_closed_drops_the_event() {
        let dispatch = MockDispatch::new(500.0, 400.0);
        let mut engine = ReplayEngine::new(dispatch.clone(), Duration::from_millis(250));
        dispatch.fail_target_closed.store(true, Ordering::SeqCst);

        engine
            .apply(&pointer(PointerKind::Mouse, PointerPhase::Down, 0.25, 0.5))
            .await
            .unwrap();
        engine
            .apply(&envelope(EventPayload::Wheel(WheelPayload {
                normalized_x: 0.5,
                normalized_y: 0.5,
                delta_x: 0.0,
                delta_y: 10.0,
                modifiers: 0,
            })))
            .await
            .unwrap();

        assert!(dispatch.calls().is_empty());
    }

    #[test]
    fn accepts_filters_room_role_and_self() {
        let env = envelope(EventPayload::Init(shoal_proto::InitPayload::default()));
        let self_id = InstanceId::from("nav-follower");
        assert!(accepts(&env, "shoal", &self_id));
        assert!(!accepts(&env, "other-room", &self_id));
        assert!(!accepts(&env, "shoal", &InstanceId::from("nav-leader")));

        let mut follower_env = env;
        follower_env.role = Role::Follower;
        assert!(!accepts(&follower_env, "shoal", &self_id));
    }
}
