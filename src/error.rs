use serde::{Deserialize, Serialize};
use thiserror::Error;

// ========================= Error Taxonomy =========================

/// Closed set of failures surfaced by the agent. Each variant is its own
/// identity; callers match on it rather than on message text.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CuaError {
    #[error("no API key: set GOOGLE_API_KEY or GEMINI_API_KEY")]
    NoApiKey,
    #[error("task timed out")]
    Timeout,
    #[error("task canceled")]
    Canceled,
    #[error("maximum number of actions reached")]
    MaxActions,
    #[error("agent is already running a task")]
    AgentBusy,
    #[error("human takeover requested")]
    HumanTakeover,
    #[error("agent is stuck after repeated failures")]
    AgentStuck,
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("element not found: {0}")]
    ElementNotFound(String),
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("action blocked by safety policy: {0}")]
    SafetyBlock(String),
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("invalid rectangle: width and height must be positive")]
    InvalidRect,
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("model rate limited: {0}")]
    ModelRateLimited(String),
    #[error("model error: {0}")]
    Model(String),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("config error: {0}")]
    Config(String),
}

impl CuaError {
    /// Worth retrying after a pause or with different arguments.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CuaError::RateLimited | CuaError::ElementNotFound(_))
    }

    /// No point retrying the run; the caller must change something first.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CuaError::NoApiKey
                | CuaError::PermissionDenied(_)
                | CuaError::NotSupported(_)
                | CuaError::HumanTakeover
                | CuaError::Canceled
        )
    }

    /// Conditions that end the run instead of being reported back to the model.
    pub(crate) fn aborts_run(&self) -> bool {
        matches!(
            self,
            CuaError::Canceled
                | CuaError::Timeout
                | CuaError::PermissionDenied(_)
                | CuaError::NotSupported(_)
                | CuaError::HumanTakeover
        )
    }

    /// Upstream throttling shows up as text in provider errors.
    pub fn is_model_rate_limit(text: &str) -> bool {
        text.contains("429") || text.contains("RESOURCE_EXHAUSTED")
    }
}

/// Failure of a single step.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("step {step} ({action}: {description}): {source}")]
pub struct ActionError {
    pub action: String,
    pub description: String,
    pub step: usize,
    #[source]
    pub source: CuaError,
}

impl ActionError {
    pub fn new(
        action: impl Into<String>,
        description: impl Into<String>,
        step: usize,
        source: CuaError,
    ) -> Self {
        Self {
            action: action.into(),
            description: description.into(),
            step,
            source,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.source.is_retryable()
    }

    pub fn is_fatal(&self) -> bool {
        self.source.is_fatal()
    }
}

/// Failure of a whole task run.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("task {task:?} failed after {steps_total} steps ({steps_failed} failed): {source}")]
pub struct TaskError {
    pub task: String,
    pub steps_total: usize,
    pub steps_failed: usize,
    pub last_action: Option<String>,
    #[source]
    pub source: CuaError,
}

impl TaskError {
    pub fn is_retryable(&self) -> bool {
        self.source.is_retryable()
    }

    pub fn is_fatal(&self) -> bool {
        self.source.is_fatal()
    }

    /// Underlying taxonomy entry.
    pub fn kind(&self) -> &CuaError {
        &self.source
    }
}
