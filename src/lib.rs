//! Computer-use agent core: a model looks at the screen, calls tools, and the
//! loop executes them on a [`Desktop`] behind guardrails.

pub mod agent;
pub mod browser;
pub mod capture;
pub mod config;
pub mod coords;
pub mod desktop;
pub mod error;
pub mod guardrails;
pub mod llm;
pub mod memory;
pub mod prompt;
pub mod react;
pub mod session;
pub mod tools;

pub use agent::{Agent, AgentBuilder, ModelFactory};
pub use browser::{ChromiumConfig, ChromiumDesktop};
pub use config::{Config, LoopStrategy, ModelChoice, Options, SafetyLevel};
pub use desktop::Desktop;
pub use error::{ActionError, CuaError, TaskError};
pub use guardrails::{TakeoverEvent, TakeoverNotice, TakeoverResponse, TakeoverSource};
pub use llm::{GeminiClient, Model};
pub use session::{ProgressEvent, ProgressFn, Step, TaskResult};
