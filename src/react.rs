//! The reason → act → observe loop.
//!
//! One call to [`run`] drives one session to a [`TaskResult`]. Only model
//! tool calls become steps; the model gets at most `max_actions` turns.

use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::LoopStrategy;
use crate::error::{ActionError, CuaError, TaskError};
use crate::guardrails::{GuardrailError, Guardrails, TakeoverSource};
use crate::llm::{Conversation, Message, Model, ModelEvent, ModelRequest, ModelTurn};
use crate::memory::Observation;
use crate::prompt::{Platform, SystemPrompt};
use crate::session::{ProgressEvent, ProgressFn, Session, Step, TaskResult};
use crate::tools::{self, Escalation, ToolCall, ToolCallError, ToolDescriptor, ToolOutcome};

const NUDGE: &str =
    "Continue with exactly one tool call. Call complete_task when the task is done.";
const SCREEN_CAPTION: &str = "Current screen before your next action:";
const RATE_LIMIT_HINT: &str =
    "the model provider is rate limiting requests (429 / RESOURCE_EXHAUSTED); \
     wait a minute or use a model with more quota";

// ========================= Loop State =========================

/// How the run ended.
struct End {
    success: bool,
    summary: Option<String>,
    needs_help: bool,
    error: Option<CuaError>,
}

impl End {
    fn failed(error: CuaError) -> Self {
        let needs_help = matches!(error, CuaError::AgentStuck);
        Self { success: false, summary: None, needs_help, error: Some(error) }
    }
}

struct Runner<'a> {
    session: &'a Session,
    model: &'a dyn Model,
    guardrails: &'a Guardrails,
    progress: Option<&'a ProgressFn>,
    prompt: SystemPrompt,
    tools: Vec<ToolDescriptor>,
    convo: Conversation,
    steps: Vec<Step>,
    last_text: Option<String>,
    last_action: Option<String>,
}

pub async fn run(
    session: &Session,
    model: &dyn Model,
    guardrails: &Guardrails,
    progress: Option<&ProgressFn>,
) -> TaskResult {
    let tools = tools::descriptors();
    let mut runner = Runner {
        session,
        model,
        guardrails,
        progress,
        prompt: SystemPrompt::new(&Platform::current(), &tools),
        tools,
        convo: Conversation::new(&session.task),
        steps: Vec::new(),
        last_text: None,
        last_action: None,
    };
    let started = Instant::now();
    info!(run_id = %session.run_id, task = %session.task, model = model.name(), "task started");
    let end = runner.drive().await;
    runner.finish(end, started.elapsed())
}

fn is_unknown_tool_error(text: &str) -> bool {
    let t = text.to_lowercase();
    t.contains("unknown tool")
        || t.contains("malformed_function_call")
        || (t.contains("function") && t.contains("not found"))
}

impl<'a> Runner<'a> {
    fn emit(&self, event: ProgressEvent) {
        if let Some(cb) = self.progress {
            cb(&event);
        }
    }

    async fn drive(&mut self) -> End {
        let max_turns = self.session.config.max_actions;
        for turn_no in 0..max_turns {
            if let Err(e) = self.session.scope.check() {
                return End::failed(e);
            }
            if self.session.config.strategy == LoopStrategy::ObserveFirst {
                if let Err(e) = self.perceive().await {
                    return End::failed(e);
                }
            }

            let turn = match self.ask_model().await {
                Ok(Some(turn)) => turn,
                Ok(None) => continue,
                Err(e) => return End::failed(e),
            };
            debug!(turn = turn_no, events = turn.events.len(), "model responded");

            for event in &turn.events {
                match event {
                    ModelEvent::Thinking(t) => self.emit(ProgressEvent::Thinking(t.clone())),
                    ModelEvent::Content(t) => {
                        self.last_text = Some(t.clone());
                        self.emit(ProgressEvent::Message(t.clone()));
                    }
                    ModelEvent::ToolCall { .. } => {}
                }
            }
            self.convo.push(turn.to_message());

            let calls: Vec<(&String, &Value)> = turn
                .tool_calls()
                .filter_map(|e| match e {
                    ModelEvent::ToolCall { name, args, .. } => Some((name, args)),
                    _ => None,
                })
                .collect();
            if calls.len() > 1 {
                warn!(count = calls.len(), "model issued several tool calls; only the first runs");
            }
            let Some(&(name, args)) = calls.first() else {
                self.convo.push(Message::user_text(NUDGE));
                continue;
            };

            let call = match ToolCall::parse(name, args) {
                Ok(call) => Ok(call),
                Err(ToolCallError::Unknown(n)) => {
                    warn!(tool = %n, "model called an unknown tool");
                    let wire = ToolOutcome::failure(
                        CuaError::InvalidArguments(format!("unknown tool: {n}")),
                        Some(format!("Available tools: {}", tools::TOOL_NAMES.join(", "))),
                    )
                    .to_wire();
                    self.convo.push_observation(&n, wire);
                    continue;
                }
                Err(ToolCallError::InvalidArguments { tool, reason }) => Err((tool, reason)),
            };

            if let Some(end) = self.step(call, args).await {
                return end;
            }
        }
        End::failed(CuaError::MaxActions)
    }

    /// `Ok(None)` means the turn was spent without anything to act on.
    async fn ask_model(&mut self) -> Result<Option<ModelTurn>, CuaError> {
        let request = ModelRequest {
            system_prompt: self.prompt.render(&self.session.memory.to_prompt()),
            messages: self.convo.messages().to_vec(),
            tools: self.tools.clone(),
        };
        match self.session.scope.run(self.model.step(&request)).await? {
            Ok(turn) => Ok(Some(turn)),
            Err(CuaError::ModelRateLimited(text)) => {
                warn!(error = %text, "model rate limited");
                Err(CuaError::ModelRateLimited(RATE_LIMIT_HINT.to_string()))
            }
            Err(CuaError::Model(text)) if CuaError::is_model_rate_limit(&text) => {
                warn!(error = %text, "model rate limited");
                Err(CuaError::ModelRateLimited(RATE_LIMIT_HINT.to_string()))
            }
            Err(CuaError::Model(text)) if is_unknown_tool_error(&text) => {
                warn!(error = %text, "model referenced an unknown tool");
                self.convo.push(Message::user_text(format!(
                    "That tool does not exist. Use one of: {}.",
                    tools::TOOL_NAMES.join(", ")
                )));
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Perception screenshot for the observe-first strategy. Not a step.
    async fn perceive(&mut self) -> Result<(), CuaError> {
        let ctx = self.session.tool_context();
        let outcome = tools::dispatch(&ToolCall::Screenshot(Default::default()), &ctx).await?;
        match outcome.data.get("image_base64").and_then(|v| v.as_str()) {
            Some(img) if outcome.success => self.convo.push_screen(SCREEN_CAPTION, img.to_string()),
            _ => warn!(error = ?outcome.error, "perception screenshot failed"),
        }
        Ok(())
    }

    async fn validate(
        &self,
        call: &ToolCall,
        target: &str,
        description: &str,
    ) -> Result<Result<(), GuardrailError>, CuaError> {
        let name = call.name();
        match self.guardrails.validate_action(name, target, description) {
            Err(GuardrailError::RateLimited) => {
                let delay = self.guardrails.rate_limit_delay().max(Duration::from_millis(1));
                let wait_ms = delay.as_millis() as u64;
                info!(action = name, wait_ms, "rate limited; waiting for a slot");
                self.session.scope.sleep(delay).await?;
                Ok(self.guardrails.validate_action(name, target, description))
            }
            other => Ok(other),
        }
    }

    /// Runs one model-issued action. Returns `Some` when the run is over.
    async fn step(
        &mut self,
        call: Result<ToolCall, (String, String)>,
        raw_args: &Value,
    ) -> Option<End> {
        let number = self.session.next_step();
        let started = Instant::now();

        let call = match call {
            Ok(call) => call,
            Err((tool, reason)) => {
                warn!(step = number, tool = %tool, %reason, "invalid tool arguments");
                let err = CuaError::InvalidArguments(reason);
                let hint = Some("Check the tool parameters and try again".into());
                let outcome = ToolOutcome::failure(err, hint);
                let description = format!("Call {tool}");
                self.observe(number, &tool, "", &description, raw_args.clone(), outcome, started);
                return self.check_stuck();
            }
        };

        let name = call.name();
        let target = call.target();
        let description = call.description();
        self.last_action = Some(name.to_string());
        info!(step = number, action = name, target = %target, "executing step");

        let verdict = match self.validate(&call, &target, &description).await {
            Ok(v) => v,
            Err(e) => {
                self.push_failed_step(number, name, &target, &description, e.clone(), started);
                return Some(End::failed(e));
            }
        };
        match verdict {
            Ok(()) => {}
            Err(GuardrailError::TakeoverRequested) => {
                info!(step = number, "human takeover requested; stopping");
                let err = CuaError::HumanTakeover;
                self.push_failed_step(number, name, &target, &description, err, started);
                return Some(End::failed(CuaError::HumanTakeover));
            }
            Err(GuardrailError::ConsecutiveFailures(n)) => {
                warn!(step = number, failures = n, "too many consecutive failures");
                let err = CuaError::AgentStuck;
                self.push_failed_step(number, name, &target, &description, err, started);
                self.guardrails.record_handoff(
                    TakeoverSource::ConsecutiveFailures,
                    &format!("{n} consecutive failures"),
                );
                return Some(End::failed(CuaError::AgentStuck));
            }
            Err(denied) => {
                warn!(
                    step = number,
                    action = name,
                    reason = %denied,
                    "action denied by guardrails"
                );
                let suggestion = match &denied {
                    GuardrailError::SafetyBlock { .. } => {
                        "This action needs human approval. Find another way or call need_help."
                    }
                    _ => "Wait before acting again.",
                };
                self.session.memory.add_failed_pattern(&format!("{name} {target} (blocked)"));
                let outcome = ToolOutcome::failure(denied.into(), Some(suggestion.into()));
                let args = call.args_json();
                self.observe(number, name, &target, &description, args, outcome, started);
                return self.check_stuck();
            }
        }

        let ctx = self.session.tool_context();
        let outcome = match tools::dispatch(&call, &ctx).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(step = number, action = name, error = %e, "step aborted the run");
                self.guardrails.record_failure(name, &target, &e.to_string());
                self.push_failed_step(number, name, &target, &description, e.clone(), started);
                return Some(End::failed(e));
            }
        };
        if !outcome.success {
            self.session.memory.add_failed_pattern(&format!("{name} {target}"));
        } else {
            self.learn(&call, &outcome);
        }
        self.observe(number, name, &target, &description, call.args_json(), outcome, started);

        match self.session.take_escalation() {
            Some(Escalation::Completed { summary }) => {
                info!(step = number, summary = %summary, "task completed");
                return Some(End {
                    success: true,
                    summary: Some(summary),
                    needs_help: false,
                    error: None,
                });
            }
            Some(Escalation::NeedsHelp { reason, .. }) => {
                info!(step = number, reason = %reason, "model asked for help");
                self.guardrails.record_handoff(TakeoverSource::Programmatic, &reason);
                return Some(End {
                    success: false,
                    summary: Some(reason),
                    needs_help: true,
                    error: Some(CuaError::HumanTakeover),
                });
            }
            None => {}
        }
        self.check_stuck()
    }

    fn check_stuck(&self) -> Option<End> {
        if !self.session.memory.needs_help() {
            return None;
        }
        let fails = self.session.memory.consecutive_fails();
        warn!(failures = fails, "agent is stuck");
        self.guardrails.record_handoff(
            TakeoverSource::ConsecutiveFailures,
            &format!("{fails} consecutive failures"),
        );
        Some(End::failed(CuaError::AgentStuck))
    }

    /// Feeds facts from a successful outcome into memory.
    fn learn(&self, call: &ToolCall, outcome: &ToolOutcome) {
        let memory = &self.session.memory;
        match call {
            ToolCall::Screenshot(args) if args.region.is_none() => {
                let c = self.session.coordinates();
                let size = c.logical_screen_size;
                memory.set_key_fact("screen", &format!("{}x{}", size.width, size.height));
            }
            ToolCall::FindElement(_) => {
                let elements = outcome
                    .data
                    .get("elements")
                    .and_then(|v| v.as_array())
                    .cloned()
                    .unwrap_or_default();
                let field = |el: &Value, k: &str| {
                    el.get(k).and_then(|v| v.as_str()).unwrap_or("").to_lowercase()
                };
                let text_roles =
                    ["textfield", "text field", "textbox", "textarea", "combobox", "searchfield"];
                let obs = Observation {
                    visible_text: elements
                        .iter()
                        .map(|e| field(e, "name"))
                        .collect::<Vec<_>>()
                        .join(" "),
                    focused_role: elements
                        .iter()
                        .find(|e| e.get("focused").and_then(|v| v.as_bool()).unwrap_or(false))
                        .map(|e| field(e, "role")),
                    has_password_field: elements.iter().any(|e| {
                        let role = field(e, "role");
                        role.contains("secure") || role.contains("password")
                    }),
                    has_form_fields: elements
                        .iter()
                        .any(|e| text_roles.iter().any(|r| field(e, "role").contains(r))),
                };
                if let Some(role) = obs.focused_role.as_deref().filter(|r| !r.is_empty()) {
                    memory.set_key_fact("focused", role);
                }
                if let Some(phase) = memory.maybe_update_phase(&obs) {
                    debug!(phase = %phase, "phase changed");
                }
            }
            ToolCall::TypeText(args) => {
                // length only; the text may be a secret
                memory.set_key_fact("last_typed", &format!("{} chars", args.text.chars().count()));
            }
            _ => {}
        }
    }

    /// Records an executed (or denied) action everywhere it is tracked and
    /// answers the model's call.
    #[allow(clippy::too_many_arguments)]
    fn observe(
        &mut self,
        number: usize,
        name: &str,
        target: &str,
        description: &str,
        args: Value,
        outcome: ToolOutcome,
        started: Instant,
    ) {
        let duration = started.elapsed();
        let result_text = outcome.result_text();
        if outcome.success {
            self.guardrails.record_success(name, target);
        } else {
            self.guardrails.record_failure(name, target, &result_text);
        }
        self.session.memory.record_action(name, args, outcome.success, &result_text, duration);
        info!(
            step = number,
            action = name,
            success = outcome.success,
            elapsed_ms = duration.as_millis() as u64,
            "step finished"
        );

        let step = Step {
            number,
            action: name.to_string(),
            description: description.to_string(),
            target: target.to_string(),
            success: outcome.success,
            duration,
            error: outcome.error.clone().map(|e| ActionError::new(name, description, number, e)),
        };
        self.convo.push_observation(name, outcome.to_wire());
        self.steps.push(step.clone());
        self.emit(ProgressEvent::Step(step));
    }

    /// Step that ended the run before an observation could be produced.
    fn push_failed_step(
        &mut self,
        number: usize,
        name: &str,
        target: &str,
        description: &str,
        err: CuaError,
        started: Instant,
    ) {
        let step = Step {
            number,
            action: name.to_string(),
            description: description.to_string(),
            target: target.to_string(),
            success: false,
            duration: started.elapsed(),
            error: Some(ActionError::new(name, description, number, err)),
        };
        self.steps.push(step.clone());
        self.emit(ProgressEvent::Step(step));
    }

    fn finish(self, end: End, duration: Duration) -> TaskResult {
        let summary = end
            .summary
            .or(self.last_text)
            .unwrap_or_else(|| {
                let milestones = self.session.memory.milestones();
                if milestones.is_empty() {
                    format!("{} step(s) taken", self.steps.len())
                } else {
                    format!("Progress: {}", milestones.join("; "))
                }
            });
        let steps_failed = self.steps.iter().filter(|s| !s.success).count();
        let error = end.error.map(|source| TaskError {
            task: self.session.task.clone(),
            steps_total: self.steps.len(),
            steps_failed,
            last_action: self.last_action.clone(),
            source,
        });
        match &error {
            None => info!(run_id = %self.session.run_id, steps = self.steps.len(), "task finished"),
            Some(e) => warn!(
                run_id = %self.session.run_id,
                steps = self.steps.len(),
                error = %e.source,
                "task failed"
            ),
        }
        TaskResult {
            success: end.success,
            summary,
            steps: self.steps,
            duration,
            needs_help: end.needs_help,
            error,
        }
    }
}
