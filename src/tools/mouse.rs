use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use super::schema::{ParamKind, ParamSpec, ToolDescriptor};
use super::{recover, ToolContext, ToolOutcome};
use crate::coords::Point;
use crate::desktop::MouseButton;
use crate::error::CuaError;

const DOUBLE_CLICK_GAP: Duration = Duration::from_millis(50);
const DRAG_STEPS: u32 = 10;
const DRAG_STEP_DELAY: Duration = Duration::from_millis(10);

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ClickArgs {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub button: MouseButton,
    #[serde(default)]
    pub double: bool,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct MoveArgs {
    pub x: f64,
    pub y: f64,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct DragArgs {
    pub x: f64,
    pub y: f64,
    pub end_x: f64,
    pub end_y: f64,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ScrollArgs {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub delta_x: f64,
    #[serde(default)]
    pub delta_y: f64,
}

fn xy() -> Vec<ParamSpec> {
    vec![
        ParamSpec::required(
            "x",
            ParamKind::Number,
            "X coordinate, normalized 0-1000 or screenshot pixels",
        ),
        ParamSpec::required(
            "y",
            ParamKind::Number,
            "Y coordinate, normalized 0-1000 or screenshot pixels",
        ),
    ]
}

pub fn click_descriptor() -> ToolDescriptor {
    let mut params = xy();
    params.push(
        ParamSpec::optional("button", ParamKind::String, "Mouse button")
            .with_default(json!("left"))
            .with_enum(&["left", "right", "middle"]),
    );
    params.push(
        ParamSpec::optional("double", ParamKind::Boolean, "Double-click")
            .with_default(json!(false)),
    );
    ToolDescriptor::new("click", "Click at a screen position", params)
}

pub fn move_descriptor() -> ToolDescriptor {
    ToolDescriptor::new("move", "Move the pointer without clicking", xy())
}

pub fn drag_descriptor() -> ToolDescriptor {
    let mut params = xy();
    params.push(ParamSpec::required("end_x", ParamKind::Number, "Destination X"));
    params.push(ParamSpec::required("end_y", ParamKind::Number, "Destination Y"));
    ToolDescriptor::new(
        "drag",
        "Press the left button at (x, y), move to (end_x, end_y), release",
        params,
    )
}

pub fn scroll_descriptor() -> ToolDescriptor {
    let mut params = xy();
    params.push(
        ParamSpec::optional("delta_x", ParamKind::Integer, "Horizontal lines, positive is right")
            .with_default(json!(0)),
    );
    params.push(
        ParamSpec::optional("delta_y", ParamKind::Integer, "Vertical lines, positive is down")
            .with_default(json!(0)),
    );
    ToolDescriptor::new("scroll", "Scroll at a screen position", params)
}

fn clicked(at: Point) -> ToolOutcome {
    ToolOutcome::ok(json!({ "screen_x": at.x, "screen_y": at.y }))
}

pub async fn click(args: &ClickArgs, ctx: &ToolContext) -> Result<ToolOutcome, CuaError> {
    let at = ctx.to_logical(args.x, args.y).await?;
    if let Err(e) = ctx.scope.run(ctx.desktop.click(at, args.button)).await? {
        return recover(e);
    }
    if args.double {
        ctx.scope.sleep(DOUBLE_CLICK_GAP).await?;
        if let Err(e) = ctx.scope.run(ctx.desktop.click(at, args.button)).await? {
            return recover(e);
        }
    }
    Ok(clicked(at))
}

pub async fn move_to(args: &MoveArgs, ctx: &ToolContext) -> Result<ToolOutcome, CuaError> {
    let at = ctx.to_logical(args.x, args.y).await?;
    match ctx.scope.run(ctx.desktop.mouse_move(at)).await? {
        Ok(()) => Ok(clicked(at)),
        Err(e) => recover(e),
    }
}

/// Interpolated drag. The button is released on every exit path once pressed.
pub async fn drag(args: &DragArgs, ctx: &ToolContext) -> Result<ToolOutcome, CuaError> {
    let from = ctx.to_logical(args.x, args.y).await?;
    let to = ctx.to_logical(args.end_x, args.end_y).await?;

    if let Err(e) = ctx.scope.run(ctx.desktop.mouse_move(from)).await? {
        return recover(e);
    }
    if let Err(e) = ctx.scope.run(ctx.desktop.mouse_down(MouseButton::Left)).await? {
        return recover(e);
    }

    let moved = interpolate(from, to, ctx).await;
    // Release even when the scope ended or a move failed mid-drag.
    let released = ctx.desktop.mouse_up(MouseButton::Left).await;
    if let Err(e) = moved.and(released) {
        return recover(e);
    }
    Ok(ToolOutcome::ok(json!({
        "from": { "x": from.x, "y": from.y },
        "to": { "x": to.x, "y": to.y },
    })))
}

async fn interpolate(from: Point, to: Point, ctx: &ToolContext) -> Result<(), CuaError> {
    for i in 1..=DRAG_STEPS {
        ctx.scope.check()?;
        let t = i as f64 / DRAG_STEPS as f64;
        let p = Point::new(from.x + (to.x - from.x) * t, from.y + (to.y - from.y) * t);
        ctx.scope.run(ctx.desktop.mouse_move(p)).await??;
        ctx.scope.sleep(DRAG_STEP_DELAY).await?;
    }
    Ok(())
}

pub async fn scroll(args: &ScrollArgs, ctx: &ToolContext) -> Result<ToolOutcome, CuaError> {
    let at = ctx.to_logical(args.x, args.y).await?;
    let (dx, dy) = (args.delta_x.round() as i32, args.delta_y.round() as i32);
    match ctx.scope.run(ctx.desktop.scroll(at, dx, dy)).await? {
        Ok(()) => Ok(ToolOutcome::ok(json!({
            "screen_x": at.x,
            "screen_y": at.y,
            "delta_x": dx,
            "delta_y": dy,
        }))),
        Err(e) => recover(e),
    }
}
