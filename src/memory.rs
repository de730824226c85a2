//! Bounded record of what happened in the current run, re-rendered into the
//! system prompt every turn so long tasks keep a small, stable context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::time::Instant;

pub const MAX_RECENT_ACTIONS: usize = 5;
pub const MAX_MILESTONES: usize = 20;
pub const MAX_FAILED_PATTERNS: usize = 10;
pub const STUCK_THRESHOLD: usize = 3;
pub const HELP_THRESHOLD: usize = 5;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    None,
    Navigation,
    FormFilling,
    Authentication,
    Search,
    Browsing,
    Confirmation,
    Checkout,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::None => "",
            Phase::Navigation => "navigation",
            Phase::FormFilling => "form_filling",
            Phase::Authentication => "authentication",
            Phase::Search => "search",
            Phase::Browsing => "browsing",
            Phase::Confirmation => "confirmation",
            Phase::Checkout => "checkout",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub step_number: usize,
    pub action_name: String,
    pub args: Value,
    pub success: bool,
    pub result_text: String,
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
}

/// What the loop could tell about the screen after an action.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Observation {
    pub visible_text: String,
    pub focused_role: Option<String>,
    pub has_password_field: bool,
    pub has_form_fields: bool,
}

/// Immutable copy of the memory at one instant.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MemorySnapshot {
    pub original_task: String,
    pub total_steps: usize,
    pub recent_actions: Vec<ActionRecord>,
    pub milestones: Vec<String>,
    pub phase: Phase,
    pub key_facts: Vec<(String, String)>,
    pub failed_patterns: Vec<String>,
    pub consecutive_fails: usize,
    pub duration: Duration,
}

#[derive(Default)]
struct State {
    total_steps: usize,
    recent: VecDeque<ActionRecord>,
    milestones: VecDeque<String>,
    /// Action name and count of the trailing milestone when it is a run of
    /// successes that later overflow can extend.
    open_run: Option<(String, usize)>,
    phase: Phase,
    key_facts: Vec<(String, String)>,
    failed_patterns: VecDeque<String>,
    consecutive_fails: usize,
}

impl State {
    fn push_milestone(&mut self, text: String) {
        self.milestones.push_back(text);
        while self.milestones.len() > MAX_MILESTONES {
            self.milestones.pop_front();
        }
    }

    /// Folds records evicted from the recent window into milestones.
    fn summarize(&mut self, evicted: Vec<ActionRecord>) {
        for rec in evicted {
            if !rec.success {
                self.open_run = None;
                self.push_milestone(format!("Attempted {} (failed)", rec.action_name));
                continue;
            }
            match self.open_run.take() {
                Some((name, count)) if name == rec.action_name => {
                    let count = count + 1;
                    if let Some(last) = self.milestones.back_mut() {
                        *last = run_milestone(&name, count);
                    }
                    self.open_run = Some((name, count));
                }
                _ => {
                    self.push_milestone(run_milestone(&rec.action_name, 1));
                    self.open_run = Some((rec.action_name, 1));
                }
            }
        }
    }
}

fn run_milestone(name: &str, count: usize) -> String {
    if count == 1 {
        format!("Completed {name}")
    } else {
        format!("Completed {name} x{count}")
    }
}

pub struct TaskMemory {
    original_task: String,
    started: Instant,
    state: RwLock<State>,
}

impl TaskMemory {
    pub fn new(task: &str) -> Self {
        Self {
            original_task: task.to_string(),
            started: Instant::now(),
            state: RwLock::new(State::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn original_task(&self) -> &str {
        &self.original_task
    }

    pub fn record_action(
        &self,
        name: &str,
        args: Value,
        success: bool,
        result: &str,
        duration: Duration,
    ) {
        let mut st = self.write();
        st.total_steps += 1;
        let record = ActionRecord {
            step_number: st.total_steps,
            action_name: name.to_string(),
            args,
            success,
            result_text: result.to_string(),
            duration,
            timestamp: Utc::now(),
        };
        st.recent.push_back(record);
        st.consecutive_fails = if success { 0 } else { st.consecutive_fails + 1 };

        if st.recent.len() > MAX_RECENT_ACTIONS {
            let excess = st.recent.len() - MAX_RECENT_ACTIONS;
            let evicted: Vec<ActionRecord> = st.recent.drain(..excess).collect();
            st.summarize(evicted);
        }
    }

    pub fn add_milestone(&self, text: &str) {
        let mut st = self.write();
        st.open_run = None;
        st.push_milestone(text.to_string());
    }

    pub fn phase(&self) -> Phase {
        self.read().phase
    }

    /// Moving to a new phase folds the outgoing phase's recent actions into
    /// one milestone and clears the window. Same phase is a no-op.
    pub fn set_phase(&self, phase: Phase) {
        let mut st = self.write();
        if st.phase == phase {
            return;
        }
        let outgoing = std::mem::take(&mut st.recent);
        if !outgoing.is_empty() {
            let label = if st.phase == Phase::None { "initial" } else { st.phase.as_str() };
            let mut names: Vec<&str> = Vec::new();
            for r in &outgoing {
                if !names.contains(&r.action_name.as_str()) {
                    names.push(&r.action_name);
                }
            }
            let failed = outgoing.iter().filter(|r| !r.success).count();
            let mut text = format!("{label}: {} action(s) ({})", outgoing.len(), names.join(", "));
            if failed > 0 {
                text.push_str(&format!(", {failed} failed"));
            }
            st.open_run = None;
            st.push_milestone(text);
        }
        st.phase = phase;
    }

    /// Infers the phase from what is on screen. Returns the new phase when
    /// it changed.
    pub fn maybe_update_phase(&self, obs: &Observation) -> Option<Phase> {
        let inferred = infer_phase(obs)?;
        if inferred == self.phase() {
            return None;
        }
        self.set_phase(inferred);
        Some(inferred)
    }

    pub fn set_key_fact(&self, key: &str, value: &str) {
        let mut st = self.write();
        match st.key_facts.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value.to_string(),
            None => st.key_facts.push((key.to_string(), value.to_string())),
        }
    }

    pub fn get_key_fact(&self, key: &str) -> Option<String> {
        self.read().key_facts.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
    }

    pub fn add_failed_pattern(&self, pattern: &str) {
        let mut st = self.write();
        if st.failed_patterns.iter().any(|p| p == pattern) {
            return;
        }
        st.failed_patterns.push_back(pattern.to_string());
        while st.failed_patterns.len() > MAX_FAILED_PATTERNS {
            st.failed_patterns.pop_front();
        }
    }

    pub fn has_failed_pattern(&self, pattern: &str) -> bool {
        self.read().failed_patterns.iter().any(|p| p == pattern)
    }

    pub fn consecutive_fails(&self) -> usize {
        self.read().consecutive_fails
    }

    pub fn is_stuck(&self) -> bool {
        self.consecutive_fails() >= STUCK_THRESHOLD
    }

    pub fn needs_help(&self) -> bool {
        self.consecutive_fails() >= HELP_THRESHOLD
    }

    pub fn duration(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn milestones(&self) -> Vec<String> {
        self.read().milestones.iter().cloned().collect()
    }

    pub fn summary(&self) -> MemorySnapshot {
        let st = self.read();
        MemorySnapshot {
            original_task: self.original_task.clone(),
            total_steps: st.total_steps,
            recent_actions: st.recent.iter().cloned().collect(),
            milestones: st.milestones.iter().cloned().collect(),
            phase: st.phase,
            key_facts: st.key_facts.clone(),
            failed_patterns: st.failed_patterns.iter().cloned().collect(),
            consecutive_fails: st.consecutive_fails,
            duration: self.started.elapsed(),
        }
    }

    pub fn to_prompt(&self) -> String {
        let st = self.read();
        let mut sections: Vec<String> = vec![format!("## Task\n{}", self.original_task)];

        if !st.milestones.is_empty() {
            let items: Vec<String> = st.milestones.iter().map(|m| format!("- {m}")).collect();
            sections.push(format!("## Accomplished\n{}", items.join("\n")));
        }

        if st.phase != Phase::None || !st.key_facts.is_empty() {
            let mut s = String::from("## Current Phase");
            if st.phase != Phase::None {
                s.push_str(&format!(": {}", st.phase));
            }
            for (k, v) in &st.key_facts {
                s.push_str(&format!("\n- {k}: {v}"));
            }
            sections.push(s);
        }

        if !st.recent.is_empty() {
            let lines: Vec<String> = st
                .recent
                .iter()
                .map(|r| {
                    let mark = if r.success { '✓' } else { '✗' };
                    format!(
                        "{mark} {}. {} {} -> {}",
                        r.step_number, r.action_name, r.args, r.result_text
                    )
                })
                .collect();
            sections.push(format!("## Recent Actions\n{}", lines.join("\n")));
        }

        if !st.failed_patterns.is_empty() {
            let items: Vec<String> = st.failed_patterns.iter().map(|p| format!("- {p}")).collect();
            sections.push(format!("## Known Issues (avoid repeating)\n{}", items.join("\n")));
        }

        if st.consecutive_fails >= HELP_THRESHOLD {
            sections.push(format!(
                "## Status\nNEEDS HELP: {} consecutive failures. \
                 Call need_help unless you have a genuinely new approach.",
                st.consecutive_fails
            ));
        } else if st.consecutive_fails >= STUCK_THRESHOLD {
            sections.push(format!(
                "## Status\nPOSSIBLY STUCK: {} consecutive failures. \
                 Take a screenshot and try a different approach.",
                st.consecutive_fails
            ));
        }

        sections.join("\n\n")
    }
}

const AUTH_WORDS: &[&str] =
    &["sign in", "log in", "login", "password", "sign up", "username", "two-factor"];
const CHECKOUT_WORDS: &[&str] =
    &["checkout", "check out", "cart", "payment", "billing", "place order"];
const CONFIRM_WORDS: &[&str] = &["are you sure", "confirm", "do you want to"];
const SEARCH_WORDS: &[&str] = &["search", "results for"];
const NAV_WORDS: &[&str] = &["http://", "https://", "www.", "address bar"];
const TEXT_ROLES: &[&str] = &["textfield", "text field", "textbox", "textarea", "combobox"];

fn infer_phase(obs: &Observation) -> Option<Phase> {
    let text = obs.visible_text.to_lowercase();
    let role = obs.focused_role.as_deref().unwrap_or("").to_lowercase();
    let any = |words: &[&str]| words.iter().any(|w| text.contains(w));

    if obs.has_password_field || any(AUTH_WORDS) {
        Some(Phase::Authentication)
    } else if any(CHECKOUT_WORDS) {
        Some(Phase::Checkout)
    } else if any(CONFIRM_WORDS) {
        Some(Phase::Confirmation)
    } else if role.contains("search") || any(SEARCH_WORDS) {
        Some(Phase::Search)
    } else if obs.has_form_fields || TEXT_ROLES.iter().any(|r| role.contains(r)) {
        Some(Phase::FormFilling)
    } else if role.contains("address") || any(NAV_WORDS) {
        Some(Phase::Navigation)
    } else if !text.trim().is_empty() {
        Some(Phase::Browsing)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(m: &TaskMemory, name: &str, ok: bool) {
        let result = if ok { "ok" } else { "boom" };
        m.record_action(name, json!({}), ok, result, Duration::from_millis(5));
    }

    #[test]
    fn windows_stay_bounded() {
        let m = TaskMemory::new("t");
        for i in 0..200 {
            record(&m, &format!("a{}", i % 7), i % 3 != 0);
            m.add_failed_pattern(&format!("p{i}"));
            let s = m.summary();
            assert!(s.recent_actions.len() <= MAX_RECENT_ACTIONS);
            assert!(s.milestones.len() <= MAX_MILESTONES);
            assert!(s.failed_patterns.len() <= MAX_FAILED_PATTERNS);
        }
        assert_eq!(m.summary().total_steps, 200);
    }

    #[test]
    fn consecutive_fails_track_outcomes() {
        let m = TaskMemory::new("t");
        record(&m, "click", false);
        record(&m, "click", false);
        assert_eq!(m.consecutive_fails(), 2);
        record(&m, "click", true);
        assert_eq!(m.consecutive_fails(), 0);
        for _ in 0..3 {
            record(&m, "click", false);
        }
        assert!(m.is_stuck() && !m.needs_help());
        record(&m, "click", false);
        record(&m, "click", false);
        assert!(m.needs_help());
    }

    #[test]
    fn overflow_collapses_runs_of_successes() {
        let m = TaskMemory::new("t");
        for _ in 0..3 {
            record(&m, "scroll", true);
        }
        record(&m, "click", false);
        for _ in 0..5 {
            record(&m, "wait", true);
        }
        // evicted: scroll x3, failed click
        assert_eq!(m.milestones(), vec!["Completed scroll x3", "Attempted click (failed)"]);
    }

    #[test]
    fn phase_change_summarizes_once() {
        let m = TaskMemory::new("t");
        record(&m, "click", true);
        record(&m, "type_text", false);
        m.set_phase(Phase::Search);
        m.set_phase(Phase::Search);
        let s = m.summary();
        assert_eq!(s.milestones, vec!["initial: 2 action(s) (click, type_text), 1 failed"]);
        assert!(s.recent_actions.is_empty());
        assert_eq!(s.phase, Phase::Search);
    }

    #[test]
    fn failed_patterns_dedupe() {
        let m = TaskMemory::new("t");
        m.add_failed_pattern("click OK button");
        m.add_failed_pattern("click OK button");
        assert_eq!(m.summary().failed_patterns.len(), 1);
        assert!(m.has_failed_pattern("click OK button"));
    }

    #[test]
    fn key_facts_overwrite_in_place() {
        let m = TaskMemory::new("t");
        m.set_key_fact("screen", "1512x982");
        m.set_key_fact("app", "Safari");
        m.set_key_fact("screen", "1280x800");
        assert_eq!(m.get_key_fact("screen").as_deref(), Some("1280x800"));
        assert_eq!(m.summary().key_facts[0].0, "screen");
        assert_eq!(m.get_key_fact("missing"), None);
    }

    #[test]
    fn phase_inference() {
        let m = TaskMemory::new("t");
        let obs = |text: &str| Observation { visible_text: text.into(), ..Default::default() };
        assert_eq!(m.maybe_update_phase(&obs("Enter your Password")), Some(Phase::Authentication));
        assert_eq!(m.maybe_update_phase(&obs("Sign in to continue")), None);
        assert_eq!(m.maybe_update_phase(&obs("Your cart (2 items)")), Some(Phase::Checkout));
        assert_eq!(m.maybe_update_phase(&obs("Are you sure?")), Some(Phase::Confirmation));
        assert_eq!(m.maybe_update_phase(&obs("Results for rust")), Some(Phase::Search));
        let form = Observation { has_form_fields: true, ..Default::default() };
        assert_eq!(m.maybe_update_phase(&form), Some(Phase::FormFilling));
        assert_eq!(m.maybe_update_phase(&obs("https://example.com")), Some(Phase::Navigation));
        assert_eq!(m.maybe_update_phase(&obs("Welcome to the docs")), Some(Phase::Browsing));
        assert_eq!(m.maybe_update_phase(&Observation::default()), None);
    }

    #[test]
    fn prompt_sections_in_order() {
        let m = TaskMemory::new("book a table");
        assert_eq!(m.to_prompt(), "## Task\nbook a table");

        m.add_milestone("Opened browser");
        m.set_phase(Phase::Search);
        m.set_key_fact("site", "opentable");
        record(&m, "click", true);
        m.add_failed_pattern("click Reserve at (10, 10)");
        for _ in 0..3 {
            record(&m, "click", false);
        }
        let p = m.to_prompt();
        let order = [
            "## Task",
            "## Accomplished",
            "## Current Phase: search",
            "## Recent Actions",
            "## Known Issues",
            "POSSIBLY STUCK",
        ];
        let idx: Vec<usize> = order
            .iter()
            .map(|s| p.find(s).unwrap_or_else(|| panic!("missing {s}")))
            .collect();
        assert!(idx.windows(2).all(|w| w[0] < w[1]), "{p}");
        assert!(p.contains('✓') && p.contains('✗'));

        record(&m, "click", false);
        record(&m, "click", false);
        let p = m.to_prompt();
        assert!(p.contains("NEEDS HELP"));
        assert!(!p.contains("POSSIBLY STUCK"));
    }
}
