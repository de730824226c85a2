//! Terminal tools. They have no desktop effect; they leave an escalation
//! in the session that the loop reads after dispatch.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::schema::{ParamKind, ParamSpec, ToolDescriptor};
use super::{ToolContext, ToolOutcome};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Escalation {
    Completed { summary: String },
    NeedsHelp { reason: String, attempts_made: Option<Value> },
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct CompleteTaskArgs {
    #[serde(default)]
    pub summary: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct NeedHelpArgs {
    #[serde(default)]
    pub reason: String,
    /// Count or list; models emit both.
    #[serde(default)]
    pub attempts_made: Option<Value>,
}

pub fn complete_task_descriptor() -> ToolDescriptor {
    ToolDescriptor::new(
        "complete_task",
        "Call once the task is verifiably done",
        vec![ParamSpec::required("summary", ParamKind::String, "What was accomplished")],
    )
}

pub fn need_help_descriptor() -> ToolDescriptor {
    ToolDescriptor::new(
        "need_help",
        "Hand control to the human when blocked, \
         e.g. by a login, captcha or a choice only they can make",
        vec![
            ParamSpec::required("reason", ParamKind::String, "Why you are blocked"),
            ParamSpec::optional(
                "attempts_made",
                ParamKind::Integer,
                "How many approaches you tried",
            ),
        ],
    )
}

pub fn complete_task(args: &CompleteTaskArgs, ctx: &ToolContext) -> ToolOutcome {
    ctx.set_escalation(Escalation::Completed { summary: args.summary.clone() });
    ToolOutcome::ok(json!({ "status": "completed", "summary": args.summary }))
}

pub fn need_help(args: &NeedHelpArgs, ctx: &ToolContext) -> ToolOutcome {
    ctx.set_escalation(Escalation::NeedsHelp {
        reason: args.reason.clone(),
        attempts_made: args.attempts_made.clone(),
    });
    ToolOutcome::ok(json!({ "status": "needs_help", "reason": args.reason }))
}
