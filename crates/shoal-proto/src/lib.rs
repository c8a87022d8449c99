//! Shared wire protocol for the shoal mirroring session.
//! Keeping this in a dedicated crate lets the relay, the replay clients and
//! the orchestrator agree on one envelope shape without pulling in heavier
//! runtime code.
//!
//! Envelope field names are camelCase on the wire because the leader-side
//! capture script builds them in page JavaScript; the serde attributes here
//! are the single source of truth for that contract.

use serde::{Deserialize, Serialize};

/// Route segment that distinguishes the mirroring endpoint from anything else
/// listening on the same host.
pub const MIRROR_PATH: &str = "/mirror/ws";

/// Room used when the caller does not ask for a specific one. A single
/// mirroring session per process only ever needs this.
pub const DEFAULT_ROOM: &str = "shoal";

/// CDP-compatible modifier bitmask, shared by the capture script and the
/// input-dispatch layer.
pub mod modifiers {
    pub const ALT: u32 = 1;
    pub const CTRL: u32 = 2;
    pub const META: u32 = 4;
    pub const SHIFT: u32 = 8;
}

/// Opaque identifier of one browser instance, assigned by the external
/// lifecycle manager.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Role a connection declares when it joins the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Leader,
    Follower,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Leader => "leader",
            Role::Follower => "follower",
        }
    }
}

/// Width/height pair in CSS pixels. Viewport measurements are fractional
/// (visualViewport reports sub-pixel sizes under zoom).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewportSize {
    pub width: f64,
    pub height: f64,
}

impl ViewportSize {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    /// Project a normalized [0,1] position into this viewport's pixel space.
    /// This is the whole cross-device replay contract: the emitting side
    /// divides by its viewport, the replaying side multiplies by its own.
    pub fn project(&self, normalized_x: f64, normalized_y: f64) -> (f64, f64) {
        (
            clamp_unit(normalized_x) * self.width,
            clamp_unit(normalized_y) * self.height,
        )
    }
}

/// The three viewport measurements the capture script reports. Only `inner`
/// is required for replay; the rest is context for tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewportInfo {
    pub inner: ViewportSize,
    pub outer: ViewportSize,
    #[serde(default)]
    pub visual_viewport: Option<ViewportSize>,
}

/// Absolute page scroll offsets in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScrollPosition {
    pub x: f64,
    pub y: f64,
}

/// One normalized input event on the wire. Serialized as a single compact
/// JSON object per socket message (never newline-delimited, never binary).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub role: Role,
    pub room: String,
    pub instance_id: InstanceId,
    /// Milliseconds since the Unix epoch, as reported by the emitting page.
    pub timestamp: f64,
    pub source_url: String,
    pub is_top_frame: bool,
    pub viewport: ViewportInfo,
    pub scroll_position: ScrollPosition,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl EventEnvelope {
    /// Serialize for the wire. `serde_json::to_string` is already compact,
    /// so the output contains no newlines.
    pub fn to_wire(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_wire(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

/// Type-specific payload, adjacently tagged the way the capture script emits
/// it: `{"type": "pointer", "payload": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum EventPayload {
    Pointer(PointerPayload),
    Wheel(WheelPayload),
    KeyDown(KeyPayload),
    KeyUp(KeyPayload),
    InsertText(InsertTextPayload),
    Scroll(ScrollPayload),
    Visibility(VisibilityPayload),
    Init(InitPayload),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointerKind {
    Mouse,
    Touch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointerPhase {
    Down,
    Move,
    Up,
    Cancel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointerPayload {
    pub pointer_type: PointerKind,
    pub pointer_id: i64,
    pub phase: PointerPhase,
    /// DOM button index: 0 left, 1 middle, 2 right.
    pub button: i32,
    /// DOM `buttons` bitmask, carried verbatim.
    pub buttons_mask: u32,
    /// Fraction of the emitting page's viewport, clamped to [0,1].
    pub normalized_x: f64,
    pub normalized_y: f64,
    /// Raw client coordinates on the emitting page, for diagnostics only.
    pub pixel_x: f64,
    pub pixel_y: f64,
    pub pressure: f64,
    pub modifiers: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WheelPayload {
    /// Pointer position at wheel time, normalized like pointer events.
    pub normalized_x: f64,
    pub normalized_y: f64,
    /// Delta magnitudes are never rescaled; only position is remapped.
    pub delta_x: f64,
    pub delta_y: f64,
    pub modifiers: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPayload {
    pub key: String,
    pub code: String,
    pub repeat: bool,
    pub modifiers: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertTextPayload {
    /// Full current value of the edited field, not an incremental diff.
    pub value: String,
    pub selection_start: Option<u32>,
    pub selection_end: Option<u32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScrollPayload {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisibilityPayload {
    pub state: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitPayload {}

/// Connection info handed out by the relay once it is listening.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubInfo {
    pub host: String,
    pub port: u16,
    pub path: String,
    /// Connectable socket URL, without query parameters.
    pub url: String,
}

impl HubInfo {
    /// Build the full connection URL for one participant. Instance ids are
    /// generated by the lifecycle manager and contain no characters that
    /// need escaping.
    pub fn connect_url(&self, role: Role, room: &str, instance_id: &InstanceId) -> String {
        format!(
            "{}?role={}&room={}&navigatorId={}",
            self.url,
            role.as_str(),
            room,
            instance_id
        )
    }
}

/// Query parameters every relay connection declares. The relay only logs
/// them; recipients filter on the envelope fields instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionQuery {
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub room: Option<String>,
    #[serde(rename = "navigatorId", default)]
    pub navigator_id: Option<String>,
}

/// Clamp a normalized coordinate into [0,1]. Pointer positions can land
/// outside the viewport during drags that leave the window.
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}
