//! Per-follower input-dispatch session.
//!
//! The trait is the seam the replay engine drives; the concrete
//! [`CdpInputSession`] issues `Input.*` commands over a shared [`CdpClient`].
//! Parameter construction is kept in pure builders so the exact protocol
//! shapes are unit-testable without a browser.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use shoal_proto::ViewportSize;

use crate::client::CdpClient;
use crate::error::CdpError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MousePhase {
    Pressed,
    Moved,
    Released,
}

impl MousePhase {
    pub fn cdp_type(&self) -> &'static str {
        match self {
            MousePhase::Pressed => "mousePressed",
            MousePhase::Moved => "mouseMoved",
            MousePhase::Released => "mouseReleased",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseButton {
    Left,
    Middle,
    Right,
    None,
}

impl MouseButton {
    /// Map a DOM `button` index (0/1/2) onto the CDP button name.
    pub fn from_dom_button(button: i32) -> Self {
        match button {
            0 => MouseButton::Left,
            1 => MouseButton::Middle,
            2 => MouseButton::Right,
            _ => MouseButton::None,
        }
    }

    pub fn cdp_name(&self) -> &'static str {
        match self {
            MouseButton::Left => "left",
            MouseButton::Middle => "middle",
            MouseButton::Right => "right",
            MouseButton::None => "none",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchPhase {
    Start,
    Move,
    End,
    Cancel,
}

impl TouchPhase {
    pub fn cdp_type(&self) -> &'static str {
        match self {
            TouchPhase::Start => "touchStart",
            TouchPhase::Move => "touchMove",
            TouchPhase::End => "touchEnd",
            TouchPhase::Cancel => "touchCancel",
        }
    }

    /// touchEnd and touchCancel must carry zero touch points; that is the
    /// contract of `Input.dispatchTouchEvent`.
    pub fn carries_points(&self) -> bool {
        matches!(self, TouchPhase::Start | TouchPhase::Move)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TouchPoint {
    pub x: f64,
    pub y: f64,
    pub id: i64,
    pub force: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPhase {
    Down,
    Up,
}

impl KeyPhase {
    pub fn cdp_type(&self) -> &'static str {
        match self {
            KeyPhase::Down => "keyDown",
            KeyPhase::Up => "keyUp",
        }
    }
}

/// Low-level synthetic input channel for one browser target. Exclusively
/// owned by that follower's replay client and reused across events.
#[async_trait]
pub trait InputDispatch: Send + Sync {
    async fn mouse_event(
        &self,
        phase: MousePhase,
        x: f64,
        y: f64,
        button: MouseButton,
        buttons: u32,
        modifiers: u32,
    ) -> Result<(), CdpError>;

    async fn touch_event(&self, phase: TouchPhase, points: Vec<TouchPoint>)
        -> Result<(), CdpError>;

    async fn key_event(
        &self,
        phase: KeyPhase,
        key: &str,
        code: &str,
        repeat: bool,
        modifiers: u32,
    ) -> Result<(), CdpError>;

    async fn wheel_event(
        &self,
        x: f64,
        y: f64,
        delta_x: f64,
        delta_y: f64,
        modifiers: u32,
    ) -> Result<(), CdpError>;

    async fn insert_text(&self, text: &str) -> Result<(), CdpError>;

    async fn scroll_to(&self, x: f64, y: f64) -> Result<(), CdpError>;

    async fn viewport(&self) -> Result<ViewportSize, CdpError>;
}

/// `InputDispatch` over a DevTools connection.
pub struct CdpInputSession {
    client: Arc<CdpClient>,
}

impl CdpInputSession {
    pub fn new(client: Arc<CdpClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl InputDispatch for CdpInputSession {
    async fn mouse_event(
        &self,
        phase: MousePhase,
        x: f64,
        y: f64,
        button: MouseButton,
        buttons: u32,
        modifiers: u32,
    ) -> Result<(), CdpError> {
        let params = mouse_params(phase, x, y, button, buttons, modifiers);
        self.client
            .send_command("Input.dispatchMouseEvent", params)
            .await?;
        Ok(())
    }

    async fn touch_event(
        &self,
        phase: TouchPhase,
        points: Vec<TouchPoint>,
    ) -> Result<(), CdpError> {
        let params = touch_params(phase, &points);
        self.client
            .send_command("Input.dispatchTouchEvent", params)
            .await?;
        Ok(())
    }

    async fn key_event(
        &self,
        phase: KeyPhase,
        key: &str,
        code: &str,
        repeat: bool,
        modifiers: u32,
    ) -> Result<(), CdpError> {
        let params = key_params(phase, key, code, repeat, modifiers);
        self.client
            .send_command("Input.dispatchKeyEvent", params)
            .await?;
        Ok(())
    }

    async fn wheel_event(
        &self,
        x: f64,
        y: f64,
        delta_x: f64,
        delta_y: f64,
        modifiers: u32,
    ) -> Result<(), CdpError> {
        let params = wheel_params(x, y, delta_x, delta_y, modifiers);
        self.client
            .send_command("Input.dispatchMouseEvent", params)
            .await?;
        Ok(())
    }

    async fn insert_text(&self, text: &str) -> Result<(), CdpError> {
        self.client
            .send_command("Input.insertText", serde_json::json!({ "text": text }))
            .await?;
        Ok(())
    }

    async fn scroll_to(&self, x: f64, y: f64) -> Result<(), CdpError> {
        self.client
            .send_command(
                "Runtime.evaluate",
                serde_json::json!({
                    "expression": scroll_expression(x, y),
                    "returnByValue": true,
                }),
            )
            .await?;
        Ok(())
    }

    async fn viewport(&self) -> Result<ViewportSize, CdpError> {
        let result = self
            .client
            .send_command(
                "Runtime.evaluate",
                serde_json::json!({
                    "expression": VIEWPORT_EXPRESSION,
                    "returnByValue": true,
                }),
            )
            .await?;
        parse_viewport(&result)
    }
}

/// JS that resolves this page's own visual viewport, falling back to the
/// window inner size.
pub const VIEWPORT_EXPRESSION: &str = "(() => { const v = window.visualViewport; \
     return { width: v ? v.width : window.innerWidth, \
              height: v ? v.height : window.innerHeight }; })()";

pub fn mouse_params(
    phase: MousePhase,
    x: f64,
    y: f64,
    button: MouseButton,
    buttons: u32,
    modifiers: u32,
) -> Value {
    let click_count = match phase {
        MousePhase::Pressed | MousePhase::Released => 1,
        MousePhase::Moved => 0,
    };
    serde_json::json!({
        "type": phase.cdp_type(),
        "x": x,
        "y": y,
        "button": button.cdp_name(),
        "buttons": buttons,
        "clickCount": click_count,
        "modifiers": modifiers,
    })
}

pub fn touch_params(phase: TouchPhase, points: &[TouchPoint]) -> Value {
    let touch_points: Vec<Value> = if phase.carries_points() {
        points
            .iter()
            .map(|p| {
                serde_json::json!({
                    "x": p.x,
                    "y": p.y,
                    "id": p.id,
                    "force": p.force,
                })
            })
            .collect()
    } else {
        Vec::new()
    };
    serde_json::json!({
        "type": phase.cdp_type(),
        "touchPoints": touch_points,
    })
}

pub fn key_params(phase: KeyPhase, key: &str, code: &str, repeat: bool, modifiers: u32) -> Value {
    serde_json::json!({
        "type": phase.cdp_type(),
        "key": key,
        "code": code,
        "autoRepeat": repeat,
        "modifiers": modifiers,
    })
}

pub fn wheel_params(x: f64, y: f64, delta_x: f64, delta_y: f64, modifiers: u32) -> Value {
    serde_json::json!({
        "type": "mouseWheel",
        "x": x,
        "y": y,
        "deltaX": delta_x,
        "deltaY": delta_y,
        "modifiers": modifiers,
    })
}

pub fn scroll_expression(x: f64, y: f64) -> String {
    format!("window.scrollTo({x}, {y})")
}

/// Pull a viewport size out of a `Runtime.evaluate` result.
pub fn parse_viewport(result: &Value) -> Result<ViewportSize, CdpError> {
    let value = result
        .get("result")
        .and_then(|r| r.get("value"))
        .ok_or_else(|| CdpError::Protocol {
            detail: "viewport evaluation returned no value".to_string(),
        })?;
    let width = value.get("width").and_then(Value::as_f64);
    let height = value.get("height").and_then(Value::as_f64);
    match (width, height) {
        (Some(width), Some(height)) if width > 0.0 && height > 0.0 => {
            Ok(ViewportSize::new(width, height))
        }
        _ => Err(CdpError::Protocol {
            detail: format!("viewport evaluation returned {value}"),
        }),
    }
}
