use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{Config, Options};
use crate::desktop::Desktop;
use crate::error::CuaError;
use crate::guardrails::{
    Guardrails, TakeoverEvent, TakeoverNotice, TakeoverResponse, TakeoverSource,
};
use crate::llm::{GeminiClient, Model};
use crate::react;
use crate::session::{CancelScope, ProgressFn, Session, TaskResult};

/// Builds the model client from the resolved configuration. Called at most
/// once per agent.
pub type ModelFactory = Arc<dyn Fn(&Config) -> Result<Arc<dyn Model>, CuaError> + Send + Sync>;

fn gemini_factory() -> ModelFactory {
    Arc::new(|cfg: &Config| {
        let client = GeminiClient::new(&cfg.api_key, cfg.model.model_id())?;
        Ok(Arc::new(client) as Arc<dyn Model>)
    })
}

// ========================= Agent Core =========================

/// Lazily built, shared by every run of one agent.
struct Engine {
    model: Arc<dyn Model>,
    guardrails: Arc<Guardrails>,
}

/// Public entry point: one task at a time on one desktop.
pub struct Agent {
    config: Config,
    desktop: Arc<dyn Desktop>,
    factory: ModelFactory,
    engine: OnceCell<Result<Arc<Engine>, CuaError>>,
    busy: AtomicBool,
    current: Mutex<Option<CancellationToken>>,
}

/// Clears the busy flag and the run's token however the run ends.
struct RunGuard<'a> {
    agent: &'a Agent,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut cur) = self.agent.current.lock() {
            *cur = None;
        }
        self.agent.busy.store(false, Ordering::SeqCst);
    }
}

impl Agent {
    /// Agent driving Gemini. Fails with [`CuaError::NoApiKey`] when neither
    /// the options nor the environment carry a key.
    pub fn new(options: Options, desktop: Arc<dyn Desktop>) -> Result<Self, CuaError> {
        Self::builder().options(options).desktop(desktop).build()
    }

    pub fn builder() -> AgentBuilder {
        AgentBuilder::default()
    }

    pub fn config(&self) -> Config {
        self.config.clone()
    }

    pub fn is_running(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Cancels the running task. No-op when idle.
    pub fn stop(&self) {
        if let Ok(cur) = self.current.lock() {
            if let Some(token) = cur.as_ref() {
                info!("stop requested");
                token.cancel();
            }
        }
    }

    pub async fn run(&self, task: &str) -> Result<TaskResult, CuaError> {
        self.execute(&CancellationToken::new(), task, None).await
    }

    pub async fn run_with_cancel(
        &self,
        token: &CancellationToken,
        task: &str,
    ) -> Result<TaskResult, CuaError> {
        self.execute(token, task, None).await
    }

    pub async fn run_with_progress(
        &self,
        task: &str,
        progress: ProgressFn,
    ) -> Result<TaskResult, CuaError> {
        self.execute(&CancellationToken::new(), task, Some(progress)).await
    }

    pub async fn run_with_progress_cancel(
        &self,
        token: &CancellationToken,
        task: &str,
        progress: ProgressFn,
    ) -> Result<TaskResult, CuaError> {
        self.execute(token, task, Some(progress)).await
    }

    /// Asks the running (or next) task to hand control back. Returns false
    /// when a request is already pending or no task has started yet.
    pub fn request_takeover(&self, reason: &str) -> bool {
        match self.engine.get() {
            Some(Ok(engine)) => {
                engine.guardrails.request_takeover(TakeoverSource::Programmatic, reason)
            }
            _ => false,
        }
    }

    pub fn respond_takeover(&self, response: TakeoverResponse) -> Option<TakeoverEvent> {
        match self.engine.get() {
            Some(Ok(engine)) => engine.guardrails.respond_takeover(response),
            _ => None,
        }
    }

    /// Takeover requests and resolutions, including handoffs the agent makes
    /// itself. Builds the engine if no task has run yet.
    pub async fn subscribe_takeovers(
        &self,
    ) -> Result<broadcast::Receiver<TakeoverNotice>, CuaError> {
        Ok(self.engine().await?.guardrails.subscribe())
    }

    pub async fn takeover_history(&self) -> Result<Vec<TakeoverEvent>, CuaError> {
        Ok(self.engine().await?.guardrails.takeover_history())
    }

    fn build_engine(&self) -> Result<Arc<Engine>, CuaError> {
        debug!(model = self.config.model.model_id(), "building model client and guardrails");
        let model = (self.factory)(&self.config)?;
        let guardrails = Arc::new(Guardrails::from_config(&self.config)?);
        Ok(Arc::new(Engine { model, guardrails }))
    }

    /// The first outcome, success or failure, is kept for the agent's lifetime.
    async fn engine(&self) -> Result<Arc<Engine>, CuaError> {
        self.engine.get_or_init(|| async { self.build_engine() }).await.clone()
    }

    fn admit(&self) -> Result<RunGuard<'_>, CuaError> {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| CuaError::AgentBusy)?;
        Ok(RunGuard { agent: self })
    }

    async fn execute(
        &self,
        parent: &CancellationToken,
        task: &str,
        progress: Option<ProgressFn>,
    ) -> Result<TaskResult, CuaError> {
        if task.trim().is_empty() {
            return Err(CuaError::InvalidArguments("task must not be empty".into()));
        }
        let _guard = self.admit()?;
        let engine = self.engine().await?;

        let token = parent.child_token();
        if let Ok(mut cur) = self.current.lock() {
            *cur = Some(token.clone());
        }
        engine.guardrails.begin_session();

        let scope = CancelScope::new(token, self.config.timeout);
        let session = Session::new(task, self.config.clone(), scope, self.desktop.clone());
        let model = engine.model.as_ref();
        Ok(react::run(&session, model, &engine.guardrails, progress.as_ref()).await)
    }
}

// ========================= Builder =========================

#[derive(Default)]
pub struct AgentBuilder {
    options: Option<Options>,
    desktop: Option<Arc<dyn Desktop>>,
    factory: Option<ModelFactory>,
}

impl AgentBuilder {
    pub fn options(mut self, options: Options) -> Self {
        self.options = Some(options);
        self
    }

    pub fn desktop(mut self, desktop: Arc<dyn Desktop>) -> Self {
        self.desktop = Some(desktop);
        self
    }

    /// Uses `model` instead of the Gemini client. No API key is required.
    pub fn model(self, model: Arc<dyn Model>) -> Self {
        self.model_factory(Arc::new(move |_: &Config| Ok(model.clone())))
    }

    pub fn model_factory(mut self, factory: ModelFactory) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn build(self) -> Result<Agent, CuaError> {
        let desktop = self
            .desktop
            .ok_or_else(|| CuaError::Config("agent needs a desktop backend".into()))?;
        let require_key = self.factory.is_none();
        let config = Config::resolve(self.options.unwrap_or_default(), require_key)?;
        Ok(Agent {
            config,
            desktop,
            factory: self.factory.unwrap_or_else(gemini_factory),
            engine: OnceCell::new(),
            busy: AtomicBool::new(false),
            current: Mutex::new(None),
        })
    }
}
