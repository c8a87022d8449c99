//! In-page capture script.
//!
//! The script is injected into the leader page (both as a new-document
//! script and immediately), observes user input with capture-phase
//! listeners, normalizes coordinates against the leader's own viewport and
//! hands each envelope to the exposed bridge function as a JSON string. It
//! never calls `preventDefault`; the leader page behaves exactly as if no
//! mirroring were active.

/// Name of the host binding the capture script reports through.
pub const BRIDGE_FUNCTION: &str = "__shoalBridge";

const CAPTURE_TEMPLATE: &str = r#"(() => {
  if (window.__shoalMirrorInstalled) { return; }
  window.__shoalMirrorInstalled = true;

  const ROOM = "@ROOM@";
  const INSTANCE = "@INSTANCE@";

  const clampUnit = (v) => Math.max(0, Math.min(1, v));

  const viewport = () => ({
    inner: { width: window.innerWidth, height: window.innerHeight },
    outer: { width: window.outerWidth, height: window.outerHeight },
    visualViewport: window.visualViewport
      ? { width: window.visualViewport.width, height: window.visualViewport.height }
      : null,
  });

  const send = (type, payload) => {
    const bridge = window["@BRIDGE@"];
    if (typeof bridge !== "function") { return; }
    bridge(JSON.stringify({
      role: "leader",
      room: ROOM,
      instanceId: INSTANCE,
      timestamp: Date.now(),
      sourceUrl: window.location.href,
      isTopFrame: window === window.top,
      viewport: viewport(),
      scrollPosition: { x: window.scrollX, y: window.scrollY },
      type,
      payload,
    }));
  };

  const normalized = (clientX, clientY) => ({
    x: clampUnit(clientX / Math.max(1, window.innerWidth)),
    y: clampUnit(clientY / Math.max(1, window.innerHeight)),
  });

  const modifierBits = (e) =>
    (e.altKey ? 1 : 0) | (e.ctrlKey ? 2 : 0) | (e.metaKey ? 4 : 0) | (e.shiftKey ? 8 : 0);

  const pointerPhase = { pointerdown: "down", pointermove: "move", pointerup: "up", pointercancel: "cancel" };
  for (const name of Object.keys(pointerPhase)) {
    window.addEventListener(name, (e) => {
      const n = normalized(e.clientX, e.clientY);
      send("pointer", {
        pointerType: e.pointerType === "touch" ? "touch" : "mouse",
        pointerId: e.pointerId,
        phase: pointerPhase[name],
        button: e.button,
        buttonsMask: e.buttons,
        normalizedX: n.x,
        normalizedY: n.y,
        pixelX: e.clientX,
        pixelY: e.clientY,
        pressure: e.pressure,
        modifiers: modifierBits(e),
      });
    }, { capture: true });
  }

  window.addEventListener("wheel", (e) => {
    const n = normalized(e.clientX, e.clientY);
    send("wheel", {
      normalizedX: n.x,
      normalizedY: n.y,
      deltaX: e.deltaX,
      deltaY: e.deltaY,
      modifiers: modifierBits(e),
    });
  }, { capture: true, passive: true });

  for (const name of ["keydown", "keyup"]) {
    window.addEventListener(name, (e) => {
      send(name === "keydown" ? "keyDown" : "keyUp", {
        key: e.key,
        code: e.code,
        repeat: e.repeat,
        modifiers: modifierBits(e),
      });
    }, { capture: true });
  }

  window.addEventListener("input", (e) => {
    const t = e.target;
    if (!t || typeof t.value !== "string") { return; }
    send("insertText", {
      value: t.value,
      selectionStart: typeof t.selectionStart === "number" ? t.selectionStart : null,
      selectionEnd: typeof t.selectionEnd === "number" ? t.selectionEnd : null,
    });
  }, { capture: true });

  window.addEventListener("scroll", () => {
    send("scroll", { x: window.scrollX, y: window.scrollY });
  }, { capture: true, passive: true });

  document.addEventListener("visibilitychange", () => {
    send("visibility", { state: document.visibilityState });
  });

  send("init", {});
})();"#;

/// Render the capture script for one leader instance.
pub fn capture_script(room: &str, instance_id: &str) -> String {
    CAPTURE_TEMPLATE
        .replace("@ROOM@", room)
        .replace("@INSTANCE@", instance_id)
        .replace("@BRIDGE@", BRIDGE_FUNCTION)
}
