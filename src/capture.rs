//! Screenshot pipeline: crop, downscale, JPEG-encode.
//!
//! JPEG at modest quality keeps vision-token usage low while UI text stays
//! legible; both knobs come from [`crate::Config`].

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;

use crate::coords::{effective_scale, CoordinateState, Size};
use crate::desktop::{CapturedFrame, Rect};
use crate::error::CuaError;

#[derive(Clone, Debug)]
pub struct EncodedShot {
    pub image_base64: String,
    pub width: u32,
    pub height: u32,
    /// Multiplier from emitted image pixels back to logical input units.
    pub scale_factor: f64,
    pub coordinates: CoordinateState,
    pub bytes: usize,
}

/// Largest-side-bounded size preserving aspect ratio. Never upscales.
pub fn fit_within(width: u32, height: u32, max_dim: u32) -> Size {
    let largest = width.max(height);
    if largest <= max_dim || largest == 0 {
        return Size::new(width, height);
    }
    let ratio = max_dim as f64 / largest as f64;
    Size::new(
        ((width as f64 * ratio).round() as u32).max(1),
        ((height as f64 * ratio).round() as u32).max(1),
    )
}

/// Crops a logical-unit region out of a physical frame.
fn crop_region(frame: &CapturedFrame, region: &Rect) -> Result<DynamicImage, CuaError> {
    region.validate()?;
    let scale = frame
        .display
        .infer_scale(frame.image.width(), frame.image.height());
    let (fw, fh) = (frame.image.width(), frame.image.height());
    let x = ((region.x * scale).round().max(0.0) as u32).min(fw.saturating_sub(1));
    let y = ((region.y * scale).round().max(0.0) as u32).min(fh.saturating_sub(1));
    let w = ((region.w * scale).round() as u32).clamp(1, fw - x);
    let h = ((region.h * scale).round() as u32).clamp(1, fh - y);
    Ok(frame.image.crop_imm(x, y, w, h))
}

fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, CuaError> {
    let rgb = img.to_rgb8();
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100))
        .encode_image(&rgb)
        .map_err(|e| CuaError::Backend(format!("jpeg encode: {e}")))?;
    Ok(buf)
}

/// Prepares a frame for the model. Full-display shots also produce the
/// coordinate state later tools read; region shots keep the full-display
/// geometry since they don't describe the whole screen.
pub fn encode_for_model(
    frame: &CapturedFrame,
    region: Option<&Rect>,
    max_dim: u32,
    quality: u8,
) -> Result<EncodedShot, CuaError> {
    if frame.image.width() == 0 || frame.image.height() == 0 {
        return Err(CuaError::Backend("empty frame".into()));
    }
    let physical = Size::new(frame.image.width(), frame.image.height());
    let source = match region {
        Some(r) => crop_region(frame, r)?,
        None => frame.image.clone(),
    };
    let source_width = source.width();
    let target = fit_within(source.width(), source.height(), max_dim);
    let resized = if target.width == source.width() && target.height == source.height() {
        source
    } else {
        source.resize_exact(target.width, target.height, FilterType::Triangle)
    };
    let jpeg = encode_jpeg(&resized, quality)?;

    let full_image = match region {
        None => target,
        Some(_) => fit_within(physical.width, physical.height, max_dim),
    };
    let coordinates = CoordinateState::from_capture(&frame.display, physical, full_image);
    let scale_factor = effective_scale(source_width, target.width, coordinates.display_scale);

    Ok(EncodedShot {
        bytes: jpeg.len(),
        image_base64: B64.encode(&jpeg),
        width: target.width,
        height: target.height,
        scale_factor,
        coordinates,
    })
}
