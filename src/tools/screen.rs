use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::schema::{ParamKind, ParamSpec, ToolDescriptor};
use super::{recover, ToolContext, ToolOutcome};
use crate::capture::encode_for_model;
use crate::desktop::Rect;
use crate::error::CuaError;

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct ScreenshotArgs {
    #[serde(default)]
    pub display_index: Option<usize>,
    #[serde(default)]
    pub region: Option<Rect>,
}

pub fn descriptor() -> ToolDescriptor {
    ToolDescriptor::new(
        "screenshot",
        "Capture the screen. Returns a JPEG image plus its width, height and scale_factor",
        vec![
            ParamSpec::optional("display_index", ParamKind::Integer, "Display to capture")
                .with_default(json!(0)),
            ParamSpec::optional("region", ParamKind::Object, "Capture only this rectangle")
                .with_properties(vec![
                    ParamSpec::required("x", ParamKind::Number, "Left edge"),
                    ParamSpec::required("y", ParamKind::Number, "Top edge"),
                    ParamSpec::required("width", ParamKind::Number, "Width, must be positive"),
                    ParamSpec::required("height", ParamKind::Number, "Height, must be positive"),
                ]),
        ],
    )
}

pub async fn screenshot(
    args: &ScreenshotArgs,
    ctx: &ToolContext,
) -> Result<ToolOutcome, CuaError> {
    if let Some(region) = &args.region {
        if let Err(e) = region.validate() {
            return recover(e);
        }
    }
    let display_index = args.display_index.unwrap_or(ctx.screen_index);
    let frame = match ctx.scope.run(ctx.desktop.capture(display_index)).await? {
        Ok(f) => f,
        Err(e) => return recover(e),
    };
    let region = args.region.as_ref();
    let shot = match encode_for_model(&frame, region, ctx.max_screenshot_dim, ctx.jpeg_quality) {
        Ok(s) => s,
        Err(e) => return recover(e),
    };

    // Region shots describe part of the screen only; the mapping stays put.
    if args.region.is_none() {
        if let Ok(mut coords) = ctx.coords.write() {
            *coords = shot.coordinates.clone();
        }
    }
    debug!(
        display = display_index,
        width = shot.width,
        height = shot.height,
        bytes = shot.bytes,
        "screenshot captured"
    );

    Ok(ToolOutcome::ok(json!({
        "image_base64": shot.image_base64,
        "width": shot.width,
        "height": shot.height,
        "scale_factor": shot.scale_factor,
        "display_index": display_index,
    })))
}
