//! Tools the model can call.
//!
//! Each tool is a variant of [`ToolCall`] with a typed argument struct. The
//! model only ever sees the descriptors; [`ToolCall::parse`] turns its JSON
//! back into a variant and [`dispatch`] runs the typed handler.

pub mod control;
pub mod elements;
pub mod keyboard;
pub mod mouse;
pub mod schema;
pub mod screen;
pub mod wait;

#[cfg(test)]
pub(crate) mod testing;

use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tracing::debug;

use crate::coords::{CoordinateState, Point};
use crate::desktop::Desktop;
use crate::error::CuaError;
use crate::session::CancelScope;

pub use control::Escalation;
pub use schema::{ParamKind, ParamSpec, ToolDescriptor};

// ========================= Call Parsing =========================

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "name", content = "args", rename_all = "snake_case")]
pub enum ToolCall {
    Screenshot(screen::ScreenshotArgs),
    Click(mouse::ClickArgs),
    Move(mouse::MoveArgs),
    Drag(mouse::DragArgs),
    Scroll(mouse::ScrollArgs),
    TypeText(keyboard::TypeTextArgs),
    KeyPress(keyboard::KeyPressArgs),
    Wait(wait::WaitArgs),
    FindElement(elements::FindElementArgs),
    CompleteTask(control::CompleteTaskArgs),
    NeedHelp(control::NeedHelpArgs),
}

pub const TOOL_NAMES: &[&str] = &[
    "screenshot",
    "click",
    "move",
    "drag",
    "scroll",
    "type_text",
    "key_press",
    "wait",
    "find_element",
    "complete_task",
    "need_help",
];

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ToolCallError {
    #[error("unknown tool: {0}")]
    Unknown(String),
    #[error("invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },
}

impl ToolCall {
    pub fn parse(name: &str, args: &Value) -> Result<ToolCall, ToolCallError> {
        if !TOOL_NAMES.contains(&name) {
            return Err(ToolCallError::Unknown(name.to_string()));
        }
        let args = if args.is_null() { json!({}) } else { args.clone() };
        serde_json::from_value(json!({ "name": name, "args": args })).map_err(|e| {
            ToolCallError::InvalidArguments { tool: name.to_string(), reason: e.to_string() }
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            ToolCall::Screenshot(_) => "screenshot",
            ToolCall::Click(_) => "click",
            ToolCall::Move(_) => "move",
            ToolCall::Drag(_) => "drag",
            ToolCall::Scroll(_) => "scroll",
            ToolCall::TypeText(_) => "type_text",
            ToolCall::KeyPress(_) => "key_press",
            ToolCall::Wait(_) => "wait",
            ToolCall::FindElement(_) => "find_element",
            ToolCall::CompleteTask(_) => "complete_task",
            ToolCall::NeedHelp(_) => "need_help",
        }
    }

    /// Salient arguments, stringified. Guardrails match sensitive patterns on this.
    pub fn target(&self) -> String {
        match self {
            ToolCall::Screenshot(a) => match &a.region {
                Some(r) => format!("region {}x{} at ({}, {})", r.w, r.h, r.x, r.y),
                None => format!("display {}", a.display_index.unwrap_or(0)),
            },
            ToolCall::Click(a) => format!("({}, {})", a.x, a.y),
            ToolCall::Move(a) => format!("({}, {})", a.x, a.y),
            ToolCall::Drag(a) => format!("({}, {}) -> ({}, {})", a.x, a.y, a.end_x, a.end_y),
            ToolCall::Scroll(a) => format!("({}, {}) by ({}, {})", a.x, a.y, a.delta_x, a.delta_y),
            ToolCall::TypeText(a) => a.text.clone(),
            ToolCall::KeyPress(a) => keyboard::combo_label(&a.key, &a.modifiers),
            ToolCall::Wait(a) => format!("{}ms", a.duration_ms),
            ToolCall::FindElement(a) => a.selector_label(),
            ToolCall::CompleteTask(a) => a.summary.clone(),
            ToolCall::NeedHelp(a) => a.reason.clone(),
        }
    }

    pub fn description(&self) -> String {
        match self {
            ToolCall::Screenshot(_) => "Take a screenshot".to_string(),
            ToolCall::Click(a) => {
                let kind = if a.double { "Double-click" } else { "Click" };
                let button = match a.button {
                    crate::desktop::MouseButton::Left => "",
                    crate::desktop::MouseButton::Right => " (right)",
                    crate::desktop::MouseButton::Middle => " (middle)",
                };
                format!("{kind}{button} at ({}, {})", a.x, a.y)
            }
            ToolCall::Move(a) => format!("Move pointer to ({}, {})", a.x, a.y),
            ToolCall::Drag(a) => {
                format!("Drag from ({}, {}) to ({}, {})", a.x, a.y, a.end_x, a.end_y)
            }
            ToolCall::Scroll(a) => format!("Scroll by ({}, {})", a.delta_x, a.delta_y),
            ToolCall::TypeText(a) => format!("Type {:?}", a.text),
            ToolCall::KeyPress(a) => {
                format!("Press {}", keyboard::combo_label(&a.key, &a.modifiers))
            }
            ToolCall::Wait(a) => format!("Wait {}ms", a.duration_ms),
            ToolCall::FindElement(a) => format!("Find element {}", a.selector_label()),
            ToolCall::CompleteTask(_) => "Complete task".to_string(),
            ToolCall::NeedHelp(_) => "Ask for help".to_string(),
        }
    }

    /// Raw args as recorded in task memory.
    pub fn args_json(&self) -> Value {
        match self {
            ToolCall::Screenshot(a) => {
                json!({ "display_index": a.display_index, "region": a.region })
            }
            ToolCall::Click(a) => {
                json!({ "x": a.x, "y": a.y, "button": a.button, "double": a.double })
            }
            ToolCall::Move(a) => json!({ "x": a.x, "y": a.y }),
            ToolCall::Drag(a) => json!({ "x": a.x, "y": a.y, "end_x": a.end_x, "end_y": a.end_y }),
            ToolCall::Scroll(a) => {
                json!({ "x": a.x, "y": a.y, "delta_x": a.delta_x, "delta_y": a.delta_y })
            }
            ToolCall::TypeText(a) => json!({ "text": a.text }),
            ToolCall::KeyPress(a) => json!({ "key": a.key, "modifiers": a.modifiers }),
            ToolCall::Wait(a) => json!({ "duration_ms": a.duration_ms }),
            ToolCall::FindElement(a) => json!({
                "role": a.role, "name": a.name, "name_contains": a.name_contains,
                "title": a.title, "max_results": a.max_results,
            }),
            ToolCall::CompleteTask(a) => json!({ "summary": a.summary }),
            ToolCall::NeedHelp(a) => {
                json!({ "reason": a.reason, "attempts_made": a.attempts_made })
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ToolCall::CompleteTask(_) | ToolCall::NeedHelp(_))
    }
}

/// Descriptors of every tool, in the order the prompt lists them.
pub fn descriptors() -> Vec<ToolDescriptor> {
    vec![
        screen::descriptor(),
        mouse::click_descriptor(),
        mouse::move_descriptor(),
        mouse::drag_descriptor(),
        mouse::scroll_descriptor(),
        keyboard::type_text_descriptor(),
        keyboard::key_press_descriptor(),
        wait::descriptor(),
        elements::descriptor(),
        control::complete_task_descriptor(),
        control::need_help_descriptor(),
    ]
}

// ========================= Outcomes =========================

/// Observation handed back to the model. Recoverable failures live here
/// with `success == false`; they are never raised.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolOutcome {
    pub success: bool,
    pub data: Map<String, Value>,
    pub error: Option<CuaError>,
    pub suggestion: Option<String>,
}

impl ToolOutcome {
    pub fn ok(data: Value) -> Self {
        let data = match data {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut m = Map::new();
                m.insert("result".into(), other);
                m
            }
        };
        Self { success: true, data, error: None, suggestion: None }
    }

    pub fn failure(error: CuaError, suggestion: Option<String>) -> Self {
        Self { success: false, data: Map::new(), error: Some(error), suggestion }
    }

    /// Wire form: `{success, ...data, error?, suggestion?}`.
    pub fn to_wire(&self) -> Value {
        let mut obj = self.data.clone();
        obj.insert("success".into(), Value::Bool(self.success));
        if let Some(e) = &self.error {
            obj.insert("error".into(), Value::String(e.to_string()));
        }
        if let Some(s) = &self.suggestion {
            obj.insert("suggestion".into(), Value::String(s.clone()));
        }
        Value::Object(obj)
    }

    /// Compact text for task memory. Images are left out.
    pub fn result_text(&self) -> String {
        if let Some(e) = &self.error {
            return e.to_string();
        }
        let mut obj = self.data.clone();
        if obj.remove("image_base64").is_some() {
            obj.insert("image".into(), Value::String("<omitted>".into()));
        }
        let text = Value::Object(obj).to_string();
        truncate(&text, 200)
    }
}

pub(crate) fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars).collect();
    out.push('…');
    out
}

/// Backend errors the model can work around become failure outcomes;
/// everything that ends the run is passed up.
pub(crate) fn recover(err: CuaError) -> Result<ToolOutcome, CuaError> {
    if err.aborts_run() {
        return Err(err);
    }
    let suggestion = match &err {
        CuaError::ElementNotFound(_) => Some(
            "Take a screenshot and check the element is visible, \
             or try find_element with a looser selector"
                .to_string(),
        ),
        CuaError::InvalidArguments(_) => {
            Some("Check the tool parameters and try again".to_string())
        }
        CuaError::InvalidRect => Some("Use a region with positive width and height".to_string()),
        _ => None,
    };
    Ok(ToolOutcome::failure(err, suggestion))
}

// ========================= Context & Dispatch =========================

/// Everything a handler may touch. Cloned per call.
#[derive(Clone)]
pub struct ToolContext {
    pub desktop: Arc<dyn Desktop>,
    pub scope: CancelScope,
    pub coords: Arc<RwLock<CoordinateState>>,
    pub escalation: Arc<Mutex<Option<Escalation>>>,
    pub screen_index: usize,
    pub max_screenshot_dim: u32,
    pub jpeg_quality: u8,
}

impl ToolContext {
    /// Seeds the coordinate state from the configured display when no
    /// screenshot has been taken yet.
    async fn ensure_coords(&self) -> Result<CoordinateState, CuaError> {
        let current = self.coords.read().map(|c| c.clone()).unwrap_or_default();
        if current.logical_screen_size.width > 0 {
            return Ok(current);
        }
        let displays = self.scope.run(self.desktop.displays()).await??;
        let display = displays
            .iter()
            .find(|d| d.index == self.screen_index)
            .or_else(|| displays.iter().find(|d| d.is_primary))
            .or_else(|| displays.first())
            .ok_or_else(|| CuaError::NotSupported("backend reports no displays".into()))?;
        let seeded = CoordinateState::for_display(display);
        let size = seeded.logical_screen_size;
        debug!(width = size.width, height = size.height, "seeded coordinate state");
        if let Ok(mut c) = self.coords.write() {
            *c = seeded.clone();
        }
        Ok(seeded)
    }

    pub async fn to_logical(&self, x: f64, y: f64) -> Result<Point, CuaError> {
        Ok(self.ensure_coords().await?.to_logical(x, y))
    }

    pub fn set_escalation(&self, e: Escalation) {
        if let Ok(mut slot) = self.escalation.lock() {
            *slot = Some(e);
        }
    }
}

/// Handler errors the model can work around come back as failure outcomes;
/// only run-ending conditions are returned as `Err`.
pub async fn dispatch(call: &ToolCall, ctx: &ToolContext) -> Result<ToolOutcome, CuaError> {
    ctx.scope.check()?;
    let result = match call {
        ToolCall::Screenshot(a) => screen::screenshot(a, ctx).await,
        ToolCall::Click(a) => mouse::click(a, ctx).await,
        ToolCall::Move(a) => mouse::move_to(a, ctx).await,
        ToolCall::Drag(a) => mouse::drag(a, ctx).await,
        ToolCall::Scroll(a) => mouse::scroll(a, ctx).await,
        ToolCall::TypeText(a) => keyboard::type_text(a, ctx).await,
        ToolCall::KeyPress(a) => keyboard::key_press(a, ctx).await,
        ToolCall::Wait(a) => wait::wait(a, ctx).await,
        ToolCall::FindElement(a) => elements::find_element(a, ctx).await,
        ToolCall::CompleteTask(a) => Ok(control::complete_task(a, ctx)),
        ToolCall::NeedHelp(a) => Ok(control::need_help(a, ctx)),
    };
    result.or_else(recover)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_descriptor_has_a_variant() {
        let names: Vec<&str> = descriptors().iter().map(|d| d.name).collect();
        assert_eq!(names, TOOL_NAMES);
    }

    #[test]
    fn parses_known_tools() {
        let call = ToolCall::parse("click", &json!({ "x": 10, "y": 20.5 })).unwrap();
        assert_eq!(call.name(), "click");
        assert_eq!(call.target(), "(10, 20.5)");

        let call = ToolCall::parse("screenshot", &Value::Null).unwrap();
        assert_eq!(call, ToolCall::Screenshot(screen::ScreenshotArgs::default()));

        let args = json!({ "key": "space", "modifiers": ["cmd"] });
        let call = ToolCall::parse("key_press", &args).unwrap();
        assert_eq!(call.target(), "cmd+space");
    }

    #[test]
    fn unknown_and_invalid_are_distinct() {
        assert_eq!(
            ToolCall::parse("launch_rocket", &json!({})),
            Err(ToolCallError::Unknown("launch_rocket".into()))
        );
        assert!(matches!(
            ToolCall::parse("click", &json!({ "x": "left" })),
            Err(ToolCallError::InvalidArguments { .. })
        ));
    }

    #[test]
    fn outcome_wire_shape() {
        let ok = ToolOutcome::ok(json!({ "elapsed_ms": 5 }));
        assert_eq!(ok.to_wire(), json!({ "success": true, "elapsed_ms": 5 }));

        let bad =
            ToolOutcome::failure(CuaError::ElementNotFound("OK".into()), Some("look again".into()));
        let wire = bad.to_wire();
        assert_eq!(wire["success"], false);
        assert_eq!(wire["error"], "element not found: OK");
        assert_eq!(wire["suggestion"], "look again");
    }

    #[test]
    fn result_text_hides_images() {
        let shot = ToolOutcome::ok(json!({ "image_base64": "AAAA", "width": 10 }));
        let text = shot.result_text();
        assert!(!text.contains("AAAA"));
        assert!(text.contains("<omitted>"));
    }

    #[tokio::test(start_paused = true)]
    async fn backend_errors_before_acting_are_observations() {
        let (ctx, desk) = super::testing::context(tokio_util::sync::CancellationToken::new());
        let gone = CuaError::Backend("display server went away".into());
        *desk.displays_error.lock().unwrap() = Some(gone.clone());
        let call = ToolCall::parse("click", &json!({ "x": 500, "y": 500 })).unwrap();
        let out = dispatch(&call, &ctx).await.unwrap();
        assert!(!out.success);
        assert_eq!(out.error, Some(gone));

        let denied = CuaError::PermissionDenied("screen recording".into());
        *desk.displays_error.lock().unwrap() = Some(denied.clone());
        assert_eq!(dispatch(&call, &ctx).await, Err(denied));
    }

    #[test]
    fn recover_splits_fatal_from_recoverable() {
        assert_eq!(recover(CuaError::Canceled), Err(CuaError::Canceled));
        assert!(recover(CuaError::PermissionDenied("accessibility".into())).is_err());
        let out = recover(CuaError::ElementNotFound("x".into())).unwrap();
        assert!(!out.success);
        assert!(out.suggestion.is_some());
    }
}
