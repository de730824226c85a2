use async_trait::async_trait;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::coords::{Display, Point};
use crate::error::CuaError;

// ========================= Backend Contract =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    #[default]
    Left,
    Right,
    Middle,
}

/// Capture region in logical units of the captured display.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    #[serde(alias = "width")]
    pub w: f64,
    #[serde(alias = "height")]
    pub h: f64,
}

impl Rect {
    pub fn validate(&self) -> Result<(), CuaError> {
        if self.w <= 0.0 || self.h <= 0.0 || !self.w.is_finite() || !self.h.is_finite() {
            return Err(CuaError::InvalidRect);
        }
        Ok(())
    }
}

/// Raw frame as captured, physical pixels.
#[derive(Clone, Debug)]
pub struct CapturedFrame {
    pub display: Display,
    pub image: DynamicImage,
}

/// Accessibility query. At least one selector must be set.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementQuery {
    pub role: Option<String>,
    pub name: Option<String>,
    pub name_contains: Option<String>,
    pub title: Option<String>,
    pub max_results: usize,
}

impl ElementQuery {
    pub fn has_selector(&self) -> bool {
        [&self.role, &self.name, &self.name_contains, &self.title]
            .iter()
            .any(|s| s.as_deref().is_some_and(|v| !v.trim().is_empty()))
    }

    /// Reference matcher backends can use on flat element lists.
    pub fn matches(&self, el: &UiElement) -> bool {
        let eq = |want: &Option<String>, have: &str| {
            want.as_deref()
                .map(str::trim)
                .map_or(true, |w| w.is_empty() || have.eq_ignore_ascii_case(w))
        };
        let contains = self.name_contains.as_deref().map(str::trim).map_or(true, |needle| {
            needle.is_empty() || el.name.to_lowercase().contains(&needle.to_lowercase())
        });
        eq(&self.role, &el.role)
            && eq(&self.name, &el.name)
            && eq(&self.title, &el.title)
            && contains
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ElementBounds {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Element reported by the accessibility backend. `id` is only meaningful
/// within the response that produced it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UiElement {
    pub id: String,
    pub role: String,
    pub name: String,
    pub title: String,
    pub value: String,
    pub bounds: ElementBounds,
    pub center_x: f64,
    pub center_y: f64,
    pub enabled: bool,
    pub focused: bool,
}

/// OS-level effects the tools are built on. Coordinates are logical units.
///
/// Implementations map permission problems to [`CuaError::PermissionDenied`]
/// and missing capabilities to [`CuaError::NotSupported`]; anything else the
/// model could work around should be another variant.
#[async_trait]
pub trait Desktop: Send + Sync {
    async fn displays(&self) -> Result<Vec<Display>, CuaError>;
    async fn capture(&self, display_index: usize) -> Result<CapturedFrame, CuaError>;

    async fn mouse_move(&self, to: Point) -> Result<(), CuaError>;
    async fn mouse_down(&self, button: MouseButton) -> Result<(), CuaError>;
    async fn mouse_up(&self, button: MouseButton) -> Result<(), CuaError>;
    async fn click(&self, at: Point, button: MouseButton) -> Result<(), CuaError>;
    async fn scroll(&self, at: Point, delta_x: i32, delta_y: i32) -> Result<(), CuaError>;

    /// Types text through a path that also works for secure input fields.
    async fn type_text(&self, text: &str) -> Result<(), CuaError>;
    /// Keys use the canonical names produced by `tools::keyboard::canonical_key`.
    async fn key_down(&self, key: &str) -> Result<(), CuaError>;
    async fn key_up(&self, key: &str) -> Result<(), CuaError>;
    async fn key_tap(&self, key: &str) -> Result<(), CuaError>;

    async fn find_elements(&self, query: &ElementQuery) -> Result<Vec<UiElement>, CuaError>;
}
