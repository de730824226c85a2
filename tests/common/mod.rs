#![allow(dead_code)]

use async_trait::async_trait;
use image::{DynamicImage, Rgba, RgbaImage};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use desk_hands::config::{Config, Options};
use desk_hands::coords::{Display, Point};
use desk_hands::desktop::{CapturedFrame, Desktop, ElementQuery, MouseButton, UiElement};
use desk_hands::guardrails::Guardrails;
use desk_hands::llm::{Model, ModelEvent, ModelRequest, ModelTurn, Part};
use desk_hands::session::{CancelScope, Session};
use desk_hands::CuaError;

// ===== Desktop =====

#[derive(Clone, Debug, PartialEq)]
pub enum Input {
    Move(Point),
    Down(MouseButton),
    Up(MouseButton),
    Click(Point, MouseButton),
    Scroll(Point, i32, i32),
    Type(String),
    KeyDown(String),
    KeyUp(String),
    KeyTap(String),
}

/// Single-display backend that records every input event.
pub struct RecordingDesktop {
    display: Display,
    inputs: Mutex<Vec<Input>>,
    captures: AtomicUsize,
    /// Returned by every `click` when set.
    pub click_error: Mutex<Option<CuaError>>,
    pub elements: Mutex<Vec<UiElement>>,
}

impl RecordingDesktop {
    pub fn new() -> Self {
        Self::with_display(1280, 800, 1.0)
    }

    pub fn with_display(width: u32, height: u32, scale_factor: f64) -> Self {
        Self {
            display: Display {
                index: 0,
                x: 0,
                y: 0,
                width,
                height,
                scale_factor,
                is_primary: true,
            },
            inputs: Mutex::new(Vec::new()),
            captures: AtomicUsize::new(0),
            click_error: Mutex::new(None),
            elements: Mutex::new(Vec::new()),
        }
    }

    pub fn inputs(&self) -> Vec<Input> {
        self.inputs.lock().unwrap().clone()
    }

    pub fn clicks(&self) -> Vec<Point> {
        self.inputs()
            .into_iter()
            .filter_map(|i| match i {
                Input::Click(p, _) => Some(p),
                _ => None,
            })
            .collect()
    }

    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }

    fn push(&self, input: Input) {
        self.inputs.lock().unwrap().push(input);
    }
}

#[async_trait]
impl Desktop for RecordingDesktop {
    async fn displays(&self) -> Result<Vec<Display>, CuaError> {
        Ok(vec![self.display.clone()])
    }

    async fn capture(&self, _display_index: usize) -> Result<CapturedFrame, CuaError> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        let w = (self.display.width as f64 * self.display.scale_factor).round() as u32;
        let h = (self.display.height as f64 * self.display.scale_factor).round() as u32;
        Ok(CapturedFrame {
            display: self.display.clone(),
            image: DynamicImage::ImageRgba8(RgbaImage::from_pixel(
                w,
                h,
                Rgba([240, 240, 240, 255]),
            )),
        })
    }

    async fn mouse_move(&self, to: Point) -> Result<(), CuaError> {
        self.push(Input::Move(to));
        Ok(())
    }

    async fn mouse_down(&self, button: MouseButton) -> Result<(), CuaError> {
        self.push(Input::Down(button));
        Ok(())
    }

    async fn mouse_up(&self, button: MouseButton) -> Result<(), CuaError> {
        self.push(Input::Up(button));
        Ok(())
    }

    async fn click(&self, at: Point, button: MouseButton) -> Result<(), CuaError> {
        if let Some(err) = self.click_error.lock().unwrap().clone() {
            return Err(err);
        }
        self.push(Input::Click(at, button));
        Ok(())
    }

    async fn scroll(&self, at: Point, delta_x: i32, delta_y: i32) -> Result<(), CuaError> {
        self.push(Input::Scroll(at, delta_x, delta_y));
        Ok(())
    }

    async fn type_text(&self, text: &str) -> Result<(), CuaError> {
        self.push(Input::Type(text.to_string()));
        Ok(())
    }

    async fn key_down(&self, key: &str) -> Result<(), CuaError> {
        self.push(Input::KeyDown(key.to_string()));
        Ok(())
    }

    async fn key_up(&self, key: &str) -> Result<(), CuaError> {
        self.push(Input::KeyUp(key.to_string()));
        Ok(())
    }

    async fn key_tap(&self, key: &str) -> Result<(), CuaError> {
        self.push(Input::KeyTap(key.to_string()));
        Ok(())
    }

    async fn find_elements(&self, query: &ElementQuery) -> Result<Vec<UiElement>, CuaError> {
        Ok(self.elements.lock().unwrap().iter().filter(|e| query.matches(e)).cloned().collect())
    }
}

// ===== Model =====

/// Replays a fixed list of turns, then fails with "script exhausted".
pub struct ScriptedModel {
    turns: Mutex<VecDeque<Result<ModelTurn, CuaError>>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new(turns: Vec<Result<ModelTurn, CuaError>>) -> Self {
        Self { turns: Mutex::new(turns.into()), requests: Mutex::new(Vec::new()) }
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn remaining(&self) -> usize {
        self.turns.lock().unwrap().len()
    }
}

#[async_trait]
impl Model for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn step(&self, request: &ModelRequest) -> Result<ModelTurn, CuaError> {
        self.requests.lock().unwrap().push(request.clone());
        self.turns
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(CuaError::Model("script exhausted".into())))
    }
}

pub fn call(name: &str, args: Value) -> Result<ModelTurn, CuaError> {
    let event = ModelEvent::ToolCall { name: name.into(), args, signature: None };
    Ok(ModelTurn { events: vec![event] })
}

pub fn say(text: &str) -> Result<ModelTurn, CuaError> {
    Ok(ModelTurn { events: vec![ModelEvent::Content(text.into())] })
}

pub fn has_image(request: &ModelRequest) -> bool {
    request.messages.iter().flat_map(|m| m.parts.iter()).any(|p| matches!(p, Part::Image { .. }))
}

// ===== Harness =====

pub fn config(opts: Options) -> Config {
    Config::resolve(opts, false).unwrap()
}

pub fn session(
    task: &str,
    cfg: Config,
    desktop: Arc<RecordingDesktop>,
    token: CancellationToken,
) -> Session {
    let scope = CancelScope::new(token, cfg.timeout);
    Session::new(task, cfg, scope, desktop)
}

pub fn guardrails(cfg: &Config) -> Guardrails {
    Guardrails::from_config(cfg).unwrap()
}

pub fn near(p: Point, x: f64, y: f64) -> bool {
    (p.x - x).abs() <= 1.0 && (p.y - y).abs() <= 1.0
}

pub const SHORT: Duration = Duration::from_millis(100);
