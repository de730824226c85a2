//! In-crate fake backend for tool unit tests.

use async_trait::async_trait;
use image::{DynamicImage, Rgba, RgbaImage};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::ToolContext;
use crate::coords::{CoordinateState, Display, Point};
use crate::desktop::{CapturedFrame, Desktop, ElementQuery, MouseButton, UiElement};
use crate::error::CuaError;
use crate::session::CancelScope;

#[derive(Clone, Debug, PartialEq)]
pub enum Recorded {
    Capture(usize),
    Move(Point),
    Down(MouseButton),
    Up(MouseButton),
    Click(Point, MouseButton),
    Scroll(Point, i32, i32),
    Type(String),
    KeyDown(String),
    KeyUp(String),
    KeyTap(String),
    Find(ElementQuery),
}

#[derive(Default)]
pub struct FakeDesktop {
    events: Mutex<Vec<Recorded>>,
    pub elements: Mutex<Vec<UiElement>>,
    /// Fails the event with this 0-based index.
    pub fail_on: Mutex<Option<(usize, CuaError)>>,
    /// Returned by `displays` when set.
    pub displays_error: Mutex<Option<CuaError>>,
}

impl FakeDesktop {
    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, e: Recorded) -> Result<(), CuaError> {
        let index = {
            let mut events = self.events.lock().unwrap();
            events.push(e);
            events.len() - 1
        };
        let mut fail = self.fail_on.lock().unwrap();
        match fail.take() {
            Some((at, err)) if at == index => Err(err),
            other => {
                *fail = other;
                Ok(())
            }
        }
    }
}

fn display() -> Display {
    Display { index: 0, x: 0, y: 0, width: 1280, height: 800, scale_factor: 1.0, is_primary: true }
}

#[async_trait]
impl Desktop for FakeDesktop {
    async fn displays(&self) -> Result<Vec<Display>, CuaError> {
        if let Some(err) = self.displays_error.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(vec![display()])
    }

    async fn capture(&self, display_index: usize) -> Result<CapturedFrame, CuaError> {
        self.record(Recorded::Capture(display_index))?;
        Ok(CapturedFrame {
            display: display(),
            image: DynamicImage::ImageRgba8(RgbaImage::from_pixel(
                1280,
                800,
                Rgba([255, 255, 255, 255]),
            )),
        })
    }

    async fn mouse_move(&self, to: Point) -> Result<(), CuaError> {
        self.record(Recorded::Move(to))
    }

    async fn mouse_down(&self, button: MouseButton) -> Result<(), CuaError> {
        self.record(Recorded::Down(button))
    }

    async fn mouse_up(&self, button: MouseButton) -> Result<(), CuaError> {
        self.record(Recorded::Up(button))
    }

    async fn click(&self, at: Point, button: MouseButton) -> Result<(), CuaError> {
        self.record(Recorded::Click(at, button))
    }

    async fn scroll(&self, at: Point, delta_x: i32, delta_y: i32) -> Result<(), CuaError> {
        self.record(Recorded::Scroll(at, delta_x, delta_y))
    }

    async fn type_text(&self, text: &str) -> Result<(), CuaError> {
        self.record(Recorded::Type(text.to_string()))
    }

    async fn key_down(&self, key: &str) -> Result<(), CuaError> {
        self.record(Recorded::KeyDown(key.to_string()))
    }

    async fn key_up(&self, key: &str) -> Result<(), CuaError> {
        self.record(Recorded::KeyUp(key.to_string()))
    }

    async fn key_tap(&self, key: &str) -> Result<(), CuaError> {
        self.record(Recorded::KeyTap(key.to_string()))
    }

    async fn find_elements(&self, query: &ElementQuery) -> Result<Vec<UiElement>, CuaError> {
        self.record(Recorded::Find(query.clone()))?;
        Ok(self.elements.lock().unwrap().iter().filter(|e| query.matches(e)).cloned().collect())
    }
}

pub fn context(token: CancellationToken) -> (ToolContext, Arc<FakeDesktop>) {
    let desk = Arc::new(FakeDesktop::default());
    let ctx = ToolContext {
        desktop: desk.clone(),
        scope: CancelScope::new(token, Duration::from_secs(60)),
        coords: Arc::new(RwLock::new(CoordinateState::default())),
        escalation: Arc::new(Mutex::new(None)),
        screen_index: 0,
        max_screenshot_dim: 1280,
        jpeg_quality: 60,
    };
    (ctx, desk)
}
