use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use super::schema::{ParamKind, ParamSpec, ToolDescriptor};
use super::{recover, ToolContext, ToolOutcome};
use crate::error::CuaError;

pub const MAX_WAIT_MS: f64 = 30_000.0;

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct WaitArgs {
    pub duration_ms: f64,
}

pub fn descriptor() -> ToolDescriptor {
    ToolDescriptor::new(
        "wait",
        "Pause to let the UI settle, e.g. after opening an app or loading a page",
        vec![ParamSpec::required("duration_ms", ParamKind::Integer, "Milliseconds, 1 to 30000")],
    )
}

pub async fn wait(args: &WaitArgs, ctx: &ToolContext) -> Result<ToolOutcome, CuaError> {
    let ms = args.duration_ms;
    if !ms.is_finite() || ms < 1.0 || ms > MAX_WAIT_MS {
        return recover(CuaError::InvalidArguments(format!(
            "duration_ms must be between 1 and {MAX_WAIT_MS}, got {ms}"
        )));
    }
    let started = tokio::time::Instant::now();
    ctx.scope.sleep(Duration::from_millis(ms.round() as u64)).await?;
    Ok(ToolOutcome::ok(json!({ "waited_ms": started.elapsed().as_millis() as u64 })))
}
