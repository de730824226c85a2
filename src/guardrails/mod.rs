//! Precondition checks run before every tool call.
//!
//! All mutable state sits behind one mutex: the rate window, the failure
//! streak, the paused flag, the takeover slot and the audit log. Checks run
//! in a fixed order and the first failing check wins:
//!
//! 1. a pending takeover pauses the agent
//! 2. a paused agent refuses everything
//! 3. too many consecutive failures
//! 4. the per-minute rate limit
//! 5. sensitive-pattern matching, depending on [`SafetyLevel`]
//!
//! Ending the task or handing it to a human is never pattern-matched: their
//! free text describes the blocker, it does not act on it.

pub mod audit;
pub mod patterns;
pub mod rate;
pub mod takeover;

use serde_json::json;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::{Config, SafetyLevel};
use crate::error::CuaError;

pub use audit::{AuditEntry, AuditLevel, AuditLog, AUDIT_CAPACITY};
pub use patterns::{PatternMatch, PatternSet, SensitivePattern, Severity};
pub use rate::{RateLimiter, SlidingWindow, RATE_WINDOW};
pub use takeover::{
    TakeoverEvent, TakeoverNotice, TakeoverResponse, TakeoverSource, MAX_TAKEOVER_HISTORY,
};

use takeover::TakeoverState;

/// Tools that end the run rather than touch the desktop.
const HANDOFF_ACTIONS: &[&str] = &["complete_task", "need_help"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GuardrailError {
    #[error("human takeover requested")]
    TakeoverRequested,
    #[error("{0} consecutive failures")]
    ConsecutiveFailures(usize),
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("blocked {severity:?}-level action: {label}")]
    SafetyBlock { label: String, severity: Severity },
}

impl From<GuardrailError> for CuaError {
    fn from(e: GuardrailError) -> Self {
        match e {
            GuardrailError::TakeoverRequested => CuaError::HumanTakeover,
            GuardrailError::ConsecutiveFailures(_) => CuaError::AgentStuck,
            GuardrailError::RateLimited => CuaError::RateLimited,
            GuardrailError::SafetyBlock { label, .. } => CuaError::SafetyBlock(label),
        }
    }
}

#[derive(Clone, Debug)]
pub struct GuardrailsConfig {
    pub safety_level: SafetyLevel,
    pub max_per_minute: usize,
    pub max_consecutive_failures: usize,
    pub escalate_blocked_actions: bool,
    pub patterns: PatternSet,
}

impl Default for GuardrailsConfig {
    fn default() -> Self {
        Self {
            safety_level: SafetyLevel::Normal,
            max_per_minute: crate::config::DEFAULT_RATE_LIMIT_PER_MINUTE as usize,
            max_consecutive_failures: crate::config::DEFAULT_MAX_CONSECUTIVE_FAILURES as usize,
            escalate_blocked_actions: false,
            patterns: PatternSet::default(),
        }
    }
}

impl GuardrailsConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            safety_level: cfg.safety_level,
            max_per_minute: cfg.rate_limit_per_minute as usize,
            max_consecutive_failures: cfg.max_consecutive_failures as usize,
            escalate_blocked_actions: cfg.escalate_blocked_actions,
            patterns: PatternSet::default(),
        }
    }
}

struct Inner {
    window: SlidingWindow,
    consecutive_failures: usize,
    paused: bool,
    takeover: TakeoverState,
    audit: AuditLog,
}

pub struct Guardrails {
    config: GuardrailsConfig,
    inner: Mutex<Inner>,
    notices: broadcast::Sender<TakeoverNotice>,
}

impl Guardrails {
    pub fn new(config: GuardrailsConfig, audit: AuditLog) -> Self {
        let (notices, _) = broadcast::channel(16);
        Self {
            inner: Mutex::new(Inner {
                window: SlidingWindow::new(config.max_per_minute),
                consecutive_failures: 0,
                paused: false,
                takeover: TakeoverState::default(),
                audit,
            }),
            config,
            notices,
        }
    }

    pub fn from_config(cfg: &Config) -> Result<Self, CuaError> {
        let mut config = GuardrailsConfig::from_config(cfg);
        if let Some(path) = &cfg.patterns_path {
            config.patterns = PatternSet::from_file(path)?;
            info!(path = %path.display(), "loaded sensitive patterns");
        }
        let audit = AuditLog::open(cfg.audit_log_path.as_deref())?;
        Ok(Self::new(config, audit))
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn safety_level(&self) -> SafetyLevel {
        self.config.safety_level
    }

    pub fn validate_action(
        &self,
        name: &str,
        target: &str,
        description: &str,
    ) -> Result<(), GuardrailError> {
        let mut escalate: Option<TakeoverEvent> = None;
        let verdict = {
            let mut inner = self.lock();
            let verdict = self.check(&mut inner, name, target, description);
            let entry = match &verdict {
                Ok(()) => AuditEntry::new(AuditLevel::Info, name, description, target, "allowed"),
                Err(e) => {
                    let level = match e {
                        GuardrailError::SafetyBlock { .. } => AuditLevel::Block,
                        _ => AuditLevel::Warn,
                    };
                    AuditEntry::new(level, name, description, target, "denied").with_error(e)
                }
            };
            inner.audit.append(entry);

            if let Err(GuardrailError::SafetyBlock { label, severity: Severity::Block }) = &verdict
            {
                if self.config.escalate_blocked_actions {
                    let reason = format!("{name}: {label}");
                    let event = TakeoverEvent::new(TakeoverSource::SensitiveAction, &reason);
                    if inner.takeover.request(event.clone()) {
                        escalate = Some(event);
                    }
                }
            }
            verdict
        };
        if let Some(event) = escalate {
            warn!(reason = %event.reason, "blocked action escalated to takeover");
            let _ = self.notices.send(TakeoverNotice::Requested(event));
        }
        verdict
    }

    fn check(
        &self,
        inner: &mut Inner,
        name: &str,
        target: &str,
        description: &str,
    ) -> Result<(), GuardrailError> {
        if inner.takeover.pending.is_some() {
            inner.paused = true;
            return Err(GuardrailError::TakeoverRequested);
        }
        if inner.paused {
            return Err(GuardrailError::TakeoverRequested);
        }
        if inner.consecutive_failures >= self.config.max_consecutive_failures {
            return Err(GuardrailError::ConsecutiveFailures(inner.consecutive_failures));
        }
        if !inner.window.try_admit(Instant::now()) {
            return Err(GuardrailError::RateLimited);
        }
        if self.config.safety_level == SafetyLevel::Minimal || HANDOFF_ACTIONS.contains(&name) {
            return Ok(());
        }
        if let Some(m) = self.config.patterns.highest(&[name, target, description]) {
            let blocks = match self.config.safety_level {
                SafetyLevel::Strict => true,
                SafetyLevel::Normal => m.severity == Severity::Block,
                SafetyLevel::Minimal => false,
            };
            if blocks {
                return Err(GuardrailError::SafetyBlock { label: m.label, severity: m.severity });
            }
        }
        Ok(())
    }

    /// Time until the rate window has room again.
    pub fn rate_limit_delay(&self) -> Duration {
        self.lock().window.until_free(Instant::now())
    }

    pub fn record_success(&self, name: &str, target: &str) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        inner.audit.append(AuditEntry::new(AuditLevel::Info, name, "", target, "success"));
    }

    pub fn record_failure(&self, name: &str, target: &str, error: &str) {
        let mut inner = self.lock();
        inner.consecutive_failures += 1;
        let streak = inner.consecutive_failures;
        inner.audit.append(
            AuditEntry::new(AuditLevel::Warn, name, "", target, "failure")
                .with_error(error)
                .with_metadata(json!({ "consecutive_failures": streak })),
        );
    }

    pub fn consecutive_failures(&self) -> usize {
        self.lock().consecutive_failures
    }

    /// Called when a run starts. A pending takeover survives; everything
    /// else about the previous run is forgotten.
    pub fn begin_session(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        if inner.takeover.pending.is_none() {
            inner.paused = false;
        }
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    /// Fills the takeover slot. Returns false when a request is already
    /// pending.
    pub fn request_takeover(&self, source: TakeoverSource, reason: &str) -> bool {
        let event = TakeoverEvent::new(source, reason);
        let accepted = {
            let mut inner = self.lock();
            let accepted = inner.takeover.request(event.clone());
            if accepted {
                inner.audit.append(
                    AuditEntry::new(AuditLevel::Warn, "takeover", reason, "", "requested")
                        .with_metadata(json!({ "source": source, "id": event.id })),
                );
            }
            accepted
        };
        if accepted {
            info!(source = ?source, reason, "takeover requested");
            let _ = self.notices.send(TakeoverNotice::Requested(event));
        }
        accepted
    }

    pub fn respond_takeover(&self, response: TakeoverResponse) -> Option<TakeoverEvent> {
        let resolved = {
            let mut inner = self.lock();
            let resolved = inner.takeover.resolve(response);
            match response {
                TakeoverResponse::Resume => inner.paused = false,
                TakeoverResponse::Retry => {
                    inner.paused = false;
                    inner.consecutive_failures = 0;
                }
                TakeoverResponse::Abort => inner.paused = true,
            }
            inner.audit.append(
                AuditEntry::new(AuditLevel::Info, "takeover", "", "", "responded")
                    .with_metadata(json!({ "response": response })),
            );
            resolved
        };
        if let Some(event) = &resolved {
            info!(response = ?response, id = %event.id, "takeover resolved");
            let _ = self.notices.send(TakeoverNotice::Resolved(event.clone()));
        }
        resolved
    }

    /// Records a handoff the agent made on its own (need_help, stuck run).
    /// It is resolved immediately and never pauses.
    pub fn record_handoff(&self, source: TakeoverSource, reason: &str) {
        let mut event = TakeoverEvent::new(source, reason);
        event.response = Some(TakeoverResponse::Abort);
        event.responded_at = Some(chrono::Utc::now());
        {
            let mut inner = self.lock();
            inner.takeover.remember(event.clone());
            inner.audit.append(
                AuditEntry::new(AuditLevel::Warn, "handoff", reason, "", "handed off")
                    .with_metadata(json!({ "source": source })),
            );
        }
        let _ = self.notices.send(TakeoverNotice::Resolved(event));
    }

    pub fn pending_takeover(&self) -> Option<TakeoverEvent> {
        self.lock().takeover.pending.clone()
    }

    pub fn takeover_history(&self) -> Vec<TakeoverEvent> {
        self.lock().takeover.history()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TakeoverNotice> {
        self.notices.subscribe()
    }

    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.lock().audit.entries()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guardrails(level: SafetyLevel) -> Guardrails {
        Guardrails::new(
            GuardrailsConfig { safety_level: level, ..Default::default() },
            AuditLog::in_memory(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn safety_levels_decide_what_blocks() {
        let strict = guardrails(SafetyLevel::Strict);
        assert!(matches!(
            strict.validate_action("type_text", "password123", "Type"),
            Err(GuardrailError::SafetyBlock { severity: Severity::Confirm, .. })
        ));

        let normal = guardrails(SafetyLevel::Normal);
        assert!(normal.validate_action("type_text", "password123", "Type").is_ok());
        assert!(matches!(
            normal.validate_action("type_text", "rm -rf /", "Type"),
            Err(GuardrailError::SafetyBlock { severity: Severity::Block, .. })
        ));

        let minimal = guardrails(SafetyLevel::Minimal);
        assert!(minimal.validate_action("type_text", "rm -rf /", "Type").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn handoffs_are_not_pattern_matched() {
        let strict = guardrails(SafetyLevel::Strict);
        let help = "the login form needs my password";
        assert!(strict.validate_action("need_help", help, "Ask for help").is_ok());
        let done = "asked to delete the old account";
        assert!(strict.validate_action("complete_task", done, "Finish").is_ok());
        let entries = strict.audit_entries();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.result == "allowed"));
        assert!(strict.validate_action("type_text", "my password", "Type").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn checks_run_in_order() {
        let g = Guardrails::new(
            GuardrailsConfig {
                safety_level: SafetyLevel::Strict,
                max_per_minute: 1,
                max_consecutive_failures: 2,
                ..Default::default()
            },
            AuditLog::in_memory(),
        );
        assert!(g.validate_action("click", "(1, 1)", "Click").is_ok());
        assert_eq!(g.validate_action("click", "(1, 1)", "Click"), Err(GuardrailError::RateLimited));

        g.record_failure("click", "(1, 1)", "not found");
        g.record_failure("click", "(1, 1)", "not found");
        assert_eq!(
            g.validate_action("click", "(1, 1)", "Click"),
            Err(GuardrailError::ConsecutiveFailures(2))
        );

        g.request_takeover(TakeoverSource::Programmatic, "operator");
        assert_eq!(
            g.validate_action("click", "(1, 1)", "Click"),
            Err(GuardrailError::TakeoverRequested)
        );
        assert!(g.is_paused());
    }

    #[tokio::test(start_paused = true)]
    async fn takeover_round_trip() {
        let g = guardrails(SafetyLevel::Normal);
        let mut rx = g.subscribe();
        assert!(g.request_takeover(TakeoverSource::Hotkey, "user pressed hotkey"));
        assert!(!g.request_takeover(TakeoverSource::Programmatic, "second"));
        assert!(matches!(
            rx.recv().await.unwrap(),
            TakeoverNotice::Requested(e) if e.source == TakeoverSource::Hotkey
        ));

        assert_eq!(g.validate_action("click", "", ""), Err(GuardrailError::TakeoverRequested));
        let resolved = g.respond_takeover(TakeoverResponse::Resume).unwrap();
        assert_eq!(resolved.response, Some(TakeoverResponse::Resume));
        assert!(!g.is_paused());
        assert!(g.validate_action("click", "", "").is_ok());
        assert_eq!(g.takeover_history().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_clears_failure_streak() {
        let g = guardrails(SafetyLevel::Normal);
        for _ in 0..5 {
            g.record_failure("click", "", "x");
        }
        g.request_takeover(TakeoverSource::ConsecutiveFailures, "stuck");
        g.respond_takeover(TakeoverResponse::Retry);
        assert_eq!(g.consecutive_failures(), 0);
        assert!(g.validate_action("click", "", "").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn escalation_fills_takeover_slot() {
        let g = Guardrails::new(
            GuardrailsConfig { escalate_blocked_actions: true, ..Default::default() },
            AuditLog::in_memory(),
        );
        assert!(g.validate_action("type_text", "drop table users", "").is_err());
        let pending = g.pending_takeover().unwrap();
        assert_eq!(pending.source, TakeoverSource::SensitiveAction);
    }

    #[tokio::test(start_paused = true)]
    async fn every_call_is_audited() {
        let g = guardrails(SafetyLevel::Strict);
        let _ = g.validate_action("click", "(1, 1)", "Click");
        let _ = g.validate_action("type_text", "password", "Type");
        g.record_success("click", "(1, 1)");
        g.record_failure("type_text", "password", "blocked");
        let levels: Vec<AuditLevel> = g.audit_entries().iter().map(|e| e.level).collect();
        assert_eq!(
            levels,
            vec![AuditLevel::Info, AuditLevel::Block, AuditLevel::Info, AuditLevel::Warn]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn pattern_file_replaces_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patterns.json");
        let json = r#"[{"pattern": "launch\s+rocket", "severity": "block", "label": "rocket"}]"#;
        std::fs::write(&path, json).unwrap();
        let opts = crate::config::Options {
            api_key: Some("k".into()),
            patterns_path: Some(path),
            ..Default::default()
        };
        let cfg = Config::resolve(opts, true).unwrap();
        let g = Guardrails::from_config(&cfg).unwrap();
        assert_eq!(
            g.validate_action("type_text", "launch  rocket", "Type"),
            Err(GuardrailError::SafetyBlock { label: "rocket".into(), severity: Severity::Block })
        );
        // the built-in set is gone
        assert!(g.validate_action("type_text", "rm -rf /", "Type").is_ok());

        let missing = Config { patterns_path: Some(dir.path().join("nope.json")), ..cfg };
        assert!(matches!(Guardrails::from_config(&missing).err(), Some(CuaError::Config(_))));
    }

    #[test]
    fn errors_map_into_taxonomy() {
        assert_eq!(CuaError::from(GuardrailError::TakeoverRequested), CuaError::HumanTakeover);
        assert_eq!(CuaError::from(GuardrailError::ConsecutiveFailures(5)), CuaError::AgentStuck);
        assert_eq!(
            CuaError::from(GuardrailError::SafetyBlock {
                label: "password".into(),
                severity: Severity::Confirm,
            }),
            CuaError::SafetyBlock("password".into())
        );
    }
}
