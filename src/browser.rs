//! [`Desktop`] backed by a Chromium page driven over CDP.
//!
//! The page viewport plays the role of a single display. Useful for headless
//! runs and for hosts without OS-level input permissions.

use async_trait::async_trait;
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, DispatchMouseEventParams, DispatchMouseEventType,
    InsertTextParams, MouseButton as CdpButton,
};
use chromiumoxide::page::{Page, ScreenshotParamsBuilder};
use futures::StreamExt;
use serde::Deserialize;
use std::fmt;
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::coords::{Display, Point};
use crate::desktop::{CapturedFrame, Desktop, ElementBounds, ElementQuery, MouseButton, UiElement};
use crate::error::CuaError;

#[derive(Clone, Debug)]
pub struct ChromiumConfig {
    pub headless: bool,
    pub width: u32,
    pub height: u32,
    pub scale_factor: f64,
    pub user_agent: Option<String>,
}

impl Default for ChromiumConfig {
    fn default() -> Self {
        Self { headless: true, width: 1280, height: 800, scale_factor: 1.0, user_agent: None }
    }
}

fn backend(what: &str, e: impl fmt::Display) -> CuaError {
    CuaError::Backend(format!("{what}: {e}"))
}

#[derive(Default)]
struct InputState {
    pointer: Point,
    buttons: Vec<MouseButton>,
    /// CDP modifier bitmask of keys currently held.
    modifiers: i64,
}

pub struct ChromiumDesktop {
    page: Page,
    _browser: OxideBrowser,
    config: ChromiumConfig,
    input: Mutex<InputState>,
}

impl ChromiumDesktop {
    pub async fn launch(cfg: ChromiumConfig) -> Result<Self, CuaError> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !cfg.headless {
            builder = builder.with_head();
        }
        // one profile per launch; a shared one trips Chromium's singleton lock
        let mut profile_dir = std::env::temp_dir();
        let profile = format!("desk-hands-profile-{}-{}", std::process::id(), nanoid::nanoid!(8));
        profile_dir.push(profile);
        std::fs::create_dir_all(&profile_dir).map_err(|e| backend("profile dir", e))?;
        builder = builder
            .user_data_dir(profile_dir)
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        let bcfg = builder.build().map_err(|e| backend("browser config", e))?;
        let (browser, mut handler) = OxideBrowser::launch(bcfg)
            .await
            .map_err(|e| backend("launch chromium", e))?;
        tokio::spawn(async move {
            while let Some(ev) = handler.next().await {
                if let Err(e) = ev {
                    debug!(error = %e, "cdp handler event error");
                }
            }
        });
        let page = browser.new_page("about:blank").await.map_err(|e| backend("new page", e))?;
        if let Some(ua) = &cfg.user_agent {
            page.set_user_agent(ua.as_str()).await.map_err(|e| backend("user agent", e))?;
        }
        let desktop = Self {
            page,
            _browser: browser,
            config: cfg,
            input: Mutex::new(InputState::default()),
        };
        desktop.apply_viewport().await?;
        Ok(desktop)
    }

    async fn apply_viewport(&self) -> Result<(), CuaError> {
        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(self.config.width as i64)
            .height(self.config.height as i64)
            .device_scale_factor(self.config.scale_factor)
            .mobile(false)
            .build()
            .map_err(|e| backend("viewport", e))?;
        self.page.execute(metrics).await.map_err(|e| backend("viewport", e))?;
        Ok(())
    }

    pub async fn goto(&self, url: &str) -> Result<(), CuaError> {
        self.page.goto(url).await.map_err(|e| backend("navigate", e))?;
        self.page.wait_for_navigation().await.map_err(|e| backend("navigate", e))?;
        Ok(())
    }

    pub async fn url(&self) -> Result<String, CuaError> {
        Ok(self.page.url().await.map_err(|e| backend("url", e))?.unwrap_or_default())
    }

    fn held_modifiers(&self) -> i64 {
        self.input.lock().map(|s| s.modifiers).unwrap_or(0)
    }

    async fn mouse_event(
        &self,
        kind: DispatchMouseEventType,
        at: Point,
        button: Option<MouseButton>,
        click_count: i64,
    ) -> Result<(), CuaError> {
        let mut cmd = DispatchMouseEventParams::builder()
            .r#type(kind)
            .x(at.x)
            .y(at.y)
            .modifiers(self.held_modifiers());
        if let Some(b) = button {
            cmd = cmd.button(cdp_button(b)).click_count(click_count);
        }
        let cmd = cmd.build().map_err(|e| backend("mouse event", e))?;
        self.page.execute(cmd).await.map_err(|e| backend("mouse event", e))?;
        Ok(())
    }

    async fn key_event(&self, kind: DispatchKeyEventType, key: &str) -> Result<(), CuaError> {
        let dom = dom_key(key)?;
        let held = self.held_modifiers();
        let mut cmd = DispatchKeyEventParams::builder()
            .r#type(kind.clone())
            .key(dom.key.clone())
            .code(dom.code.clone())
            .windows_virtual_key_code(dom.virtual_code)
            .modifiers(held);
        // with ctrl/cmd held the press is a shortcut, not text
        if kind == DispatchKeyEventType::KeyDown && held & (CTRL | META) == 0 {
            if let Some(text) = &dom.text {
                cmd = cmd.text(text.clone());
            }
        }
        let cmd = cmd.build().map_err(|e| backend("key event", e))?;
        self.page.execute(cmd).await.map_err(|e| backend("key event", e))?;
        Ok(())
    }

    fn display(&self) -> Display {
        Display {
            index: 0,
            x: 0,
            y: 0,
            width: self.config.width,
            height: self.config.height,
            scale_factor: self.config.scale_factor,
            is_primary: true,
        }
    }
}

fn cdp_button(b: MouseButton) -> CdpButton {
    match b {
        MouseButton::Left => CdpButton::Left,
        MouseButton::Right => CdpButton::Right,
        MouseButton::Middle => CdpButton::Middle,
    }
}

// ========================= Keys =========================

const ALT: i64 = 1;
const CTRL: i64 = 2;
const META: i64 = 4;
const SHIFT: i64 = 8;

fn modifier_bit(key: &str) -> i64 {
    match key {
        "alt" => ALT,
        "ctrl" => CTRL,
        "cmd" => META,
        "shift" => SHIFT,
        _ => 0,
    }
}

#[derive(Clone, Debug, PartialEq)]
struct DomKey {
    key: String,
    code: String,
    text: Option<String>,
    virtual_code: i64,
}

fn named(key: &str, code: &str, text: Option<&str>, virtual_code: i64) -> DomKey {
    DomKey { key: key.into(), code: code.into(), text: text.map(str::to_string), virtual_code }
}

/// `f1` through `f12` as their number.
fn function_key(name: &str) -> Option<i64> {
    let n: i64 = name.strip_prefix('f')?.parse().ok()?;
    (1..=12).contains(&n).then_some(n)
}

/// Maps a canonical key name onto DOM `key`/`code` values.
fn dom_key(canonical: &str) -> Result<DomKey, CuaError> {
    let dom = match canonical {
        "enter" => named("Enter", "Enter", Some("\r"), 13),
        "tab" => named("Tab", "Tab", None, 9),
        "escape" => named("Escape", "Escape", None, 27),
        "backspace" => named("Backspace", "Backspace", None, 8),
        "delete" => named("Delete", "Delete", None, 46),
        "space" => named(" ", "Space", Some(" "), 32),
        "up" => named("ArrowUp", "ArrowUp", None, 38),
        "down" => named("ArrowDown", "ArrowDown", None, 40),
        "left" => named("ArrowLeft", "ArrowLeft", None, 37),
        "right" => named("ArrowRight", "ArrowRight", None, 39),
        "home" => named("Home", "Home", None, 36),
        "end" => named("End", "End", None, 35),
        "pageup" => named("PageUp", "PageUp", None, 33),
        "pagedown" => named("PageDown", "PageDown", None, 34),
        "cmd" => named("Meta", "MetaLeft", None, 91),
        "ctrl" => named("Control", "ControlLeft", None, 17),
        "alt" => named("Alt", "AltLeft", None, 18),
        "shift" => named("Shift", "ShiftLeft", None, 16),
        f if function_key(f).is_some() => {
            let n = function_key(f).unwrap_or(1);
            let key = format!("F{n}");
            DomKey { code: key.clone(), key, text: None, virtual_code: 111 + n }
        }
        other => {
            let mut chars = other.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => {
                    let upper = c.to_ascii_uppercase();
                    let code = if c.is_ascii_alphabetic() {
                        format!("Key{upper}")
                    } else if c.is_ascii_digit() {
                        format!("Digit{c}")
                    } else {
                        String::new()
                    };
                    let virtual_code = if c.is_ascii_alphanumeric() { upper as i64 } else { 0 };
                    DomKey { key: c.to_string(), code, text: Some(c.to_string()), virtual_code }
                }
                _ => return Err(CuaError::InvalidArguments(format!("unknown key {other:?}"))),
            }
        }
    };
    Ok(dom)
}

// ========================= Accessibility =========================

/// Walks interactive DOM nodes and reports them in viewport coordinates.
const ELEMENTS_JS: &str = r#"
(() => {
  const implicit = (el) => {
    const tag = el.tagName.toLowerCase();
    if (tag === 'a') return 'link';
    if (tag === 'button') return 'button';
    if (tag === 'select') return 'combobox';
    if (tag === 'textarea') return 'textarea';
    if (tag === 'img') return 'image';
    if (tag === 'label') return 'label';
    if (/^h[1-6]$/.test(tag)) return 'heading';
    if (tag === 'input') {
      const t = (el.type || 'text').toLowerCase();
      if (t === 'password') return 'password';
      if (['button', 'submit', 'reset'].includes(t)) return 'button';
      if (['checkbox', 'radio'].includes(t)) return t;
      return 'textfield';
    }
    return tag;
  };
  const nodes = document.querySelectorAll(
    'a,button,input,select,textarea,img[alt],label,h1,h2,h3,[role],[tabindex]');
  const out = [];
  for (const el of nodes) {
    const r = el.getBoundingClientRect();
    if (r.width <= 0 || r.height <= 0) continue;
    const label = el.getAttribute('aria-label') || el.innerText || el.alt || el.placeholder || '';
    const name = label.trim().slice(0, 200);
    out.push({
      role: el.getAttribute('role') || implicit(el),
      name,
      title: el.title || '',
      value: typeof el.value === 'string' ? el.value : '',
      x: r.x, y: r.y, width: r.width, height: r.height,
      enabled: !el.disabled,
      focused: el === document.activeElement,
    });
  }
  return out;
})()
"#;

#[derive(Debug, Deserialize)]
struct RawElement {
    role: String,
    name: String,
    title: String,
    value: String,
    x: f64,
    y: f64,
    width: f64,
    height: f64,
    enabled: bool,
    focused: bool,
}

impl From<RawElement> for UiElement {
    fn from(r: RawElement) -> Self {
        UiElement {
            id: String::new(),
            role: r.role,
            name: r.name,
            title: r.title,
            value: r.value,
            center_x: r.x + r.width / 2.0,
            center_y: r.y + r.height / 2.0,
            bounds: ElementBounds { x: r.x, y: r.y, width: r.width, height: r.height },
            enabled: r.enabled,
            focused: r.focused,
        }
    }
}

// ========================= Desktop =========================

#[async_trait]
impl Desktop for ChromiumDesktop {
    async fn displays(&self) -> Result<Vec<Display>, CuaError> {
        Ok(vec![self.display()])
    }

    async fn capture(&self, display_index: usize) -> Result<CapturedFrame, CuaError> {
        if display_index != 0 {
            let msg = format!("display {display_index} does not exist");
            return Err(CuaError::InvalidArguments(msg));
        }
        let take =
            || async { self.page.screenshot(ScreenshotParamsBuilder::default().build()).await };
        let bytes = match take().await {
            Ok(bytes) => bytes,
            Err(e) if e.to_string().contains("0 width") || e.to_string().contains("0 height") => {
                // the viewport collapses when the window is minimized; force it and retry once
                warn!(error = %e, "empty viewport; resetting metrics");
                self.apply_viewport().await?;
                take().await.map_err(|e| backend("screenshot", e))?
            }
            Err(e) => return Err(backend("screenshot", e)),
        };
        let image = image::load_from_memory(&bytes).map_err(|e| backend("decode screenshot", e))?;
        Ok(CapturedFrame { display: self.display(), image })
    }

    async fn mouse_move(&self, to: Point) -> Result<(), CuaError> {
        let held = self.input.lock().ok().and_then(|s| s.buttons.last().copied());
        self.mouse_event(DispatchMouseEventType::MouseMoved, to, held, 0).await?;
        if let Ok(mut s) = self.input.lock() {
            s.pointer = to;
        }
        Ok(())
    }

    async fn mouse_down(&self, button: MouseButton) -> Result<(), CuaError> {
        let at = self.input.lock().map(|s| s.pointer).unwrap_or_default();
        self.mouse_event(DispatchMouseEventType::MousePressed, at, Some(button), 1).await?;
        if let Ok(mut s) = self.input.lock() {
            s.buttons.push(button);
        }
        Ok(())
    }

    async fn mouse_up(&self, button: MouseButton) -> Result<(), CuaError> {
        let at = self.input.lock().map(|s| s.pointer).unwrap_or_default();
        if let Ok(mut s) = self.input.lock() {
            s.buttons.retain(|b| *b != button);
        }
        self.mouse_event(DispatchMouseEventType::MouseReleased, at, Some(button), 1).await
    }

    async fn click(&self, at: Point, button: MouseButton) -> Result<(), CuaError> {
        self.mouse_move(at).await?;
        self.mouse_event(DispatchMouseEventType::MousePressed, at, Some(button), 1).await?;
        self.mouse_event(DispatchMouseEventType::MouseReleased, at, Some(button), 1).await
    }

    async fn scroll(&self, at: Point, delta_x: i32, delta_y: i32) -> Result<(), CuaError> {
        let cmd = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MouseWheel)
            .x(at.x)
            .y(at.y)
            .delta_x(delta_x as f64)
            .delta_y(delta_y as f64)
            .build()
            .map_err(|e| backend("scroll", e))?;
        self.page.execute(cmd).await.map_err(|e| backend("scroll", e))?;
        Ok(())
    }

    async fn type_text(&self, text: &str) -> Result<(), CuaError> {
        // insertText feeds the focused element directly, password inputs included
        self.page
            .execute(InsertTextParams::new(text))
            .await
            .map_err(|e| backend("insert text", e))?;
        Ok(())
    }

    async fn key_down(&self, key: &str) -> Result<(), CuaError> {
        self.key_event(DispatchKeyEventType::KeyDown, key).await?;
        if let Ok(mut s) = self.input.lock() {
            s.modifiers |= modifier_bit(key);
        }
        Ok(())
    }

    async fn key_up(&self, key: &str) -> Result<(), CuaError> {
        if let Ok(mut s) = self.input.lock() {
            s.modifiers &= !modifier_bit(key);
        }
        self.key_event(DispatchKeyEventType::KeyUp, key).await
    }

    async fn key_tap(&self, key: &str) -> Result<(), CuaError> {
        self.key_event(DispatchKeyEventType::KeyDown, key).await?;
        self.key_event(DispatchKeyEventType::KeyUp, key).await
    }

    async fn find_elements(&self, query: &ElementQuery) -> Result<Vec<UiElement>, CuaError> {
        let raw: Vec<RawElement> = self
            .page
            .evaluate(ELEMENTS_JS)
            .await
            .map_err(|e| backend("element query", e))?
            .into_value()
            .map_err(|e| backend("element query result", e))?;
        Ok(raw
            .into_iter()
            .map(UiElement::from)
            .filter(|el| query.matches(el))
            .take(query.max_results.max(1))
            .collect())
    }
}
