use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::coords::CoordinateState;
use crate::desktop::Desktop;
use crate::error::{ActionError, CuaError, TaskError};
use crate::memory::TaskMemory;
use crate::tools::control::Escalation;
use crate::tools::ToolContext;

// ========================= Cancellation =========================

/// Cancellation token plus deadline. Every suspension point of a run goes
/// through one of these so `stop()` and the task timeout are honored promptly.
#[derive(Clone, Debug)]
pub struct CancelScope {
    token: CancellationToken,
    deadline: Instant,
}

impl CancelScope {
    pub fn new(token: CancellationToken, timeout: Duration) -> Self {
        Self { token, deadline: Instant::now() + timeout }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Cancellation wins over the deadline when both apply.
    pub fn check(&self) -> Result<(), CuaError> {
        if self.token.is_cancelled() {
            return Err(CuaError::Canceled);
        }
        if Instant::now() >= self.deadline {
            return Err(CuaError::Timeout);
        }
        Ok(())
    }

    /// Drives `fut` unless the scope ends first.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, CuaError> {
        self.check()?;
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(CuaError::Canceled),
            _ = tokio::time::sleep_until(self.deadline) => Err(CuaError::Timeout),
            out = fut => Ok(out),
        }
    }

    pub async fn sleep(&self, d: Duration) -> Result<(), CuaError> {
        self.run(tokio::time::sleep(d)).await
    }
}

// ========================= Run Records =========================

/// One model-issued action.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Step {
    pub number: usize,
    pub action: String,
    pub description: String,
    pub target: String,
    pub success: bool,
    pub duration: Duration,
    pub error: Option<ActionError>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    pub summary: String,
    pub steps: Vec<Step>,
    pub duration: Duration,
    /// The model (or the stuck detector) handed control back to a human.
    pub needs_help: bool,
    pub error: Option<TaskError>,
}

impl TaskResult {
    pub fn failed_steps(&self) -> usize {
        self.steps.iter().filter(|s| !s.success).count()
    }
}

/// Emitted synchronously on the loop's task, in order.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    Thinking(String),
    Message(String),
    Step(Step),
}

pub type ProgressFn = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

// ========================= Session =========================

/// Per-run state. Created when a task is admitted, dropped when it returns.
pub struct Session {
    pub run_id: String,
    pub task: String,
    pub config: Config,
    pub scope: CancelScope,
    pub memory: Arc<TaskMemory>,
    desktop: Arc<dyn Desktop>,
    coords: Arc<RwLock<CoordinateState>>,
    escalation: Arc<Mutex<Option<Escalation>>>,
    step_counter: AtomicUsize,
}

impl Session {
    pub fn new(task: &str, config: Config, scope: CancelScope, desktop: Arc<dyn Desktop>) -> Self {
        Self {
            run_id: nanoid::nanoid!(),
            task: task.to_string(),
            memory: Arc::new(TaskMemory::new(task)),
            config,
            scope,
            desktop,
            coords: Arc::new(RwLock::new(CoordinateState::default())),
            escalation: Arc::new(Mutex::new(None)),
            step_counter: AtomicUsize::new(0),
        }
    }

    /// Next step number, starting at 1.
    pub fn next_step(&self) -> usize {
        self.step_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn steps_taken(&self) -> usize {
        self.step_counter.load(Ordering::SeqCst)
    }

    pub fn coordinates(&self) -> CoordinateState {
        self.coords.read().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn set_coordinates(&self, state: CoordinateState) {
        if let Ok(mut c) = self.coords.write() {
            *c = state;
        }
    }

    pub fn take_escalation(&self) -> Option<Escalation> {
        self.escalation.lock().ok().and_then(|mut e| e.take())
    }

    pub fn tool_context(&self) -> ToolContext {
        ToolContext {
            desktop: self.desktop.clone(),
            scope: self.scope.clone(),
            coords: self.coords.clone(),
            escalation: self.escalation.clone(),
            screen_index: self.config.screen_index,
            max_screenshot_dim: self.config.max_screenshot_dim,
            jpeg_quality: self.config.jpeg_quality,
        }
    }
}
