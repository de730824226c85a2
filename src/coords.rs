//! Model-space → screen-space coordinate conversion.
//!
//! The model sees a resized screenshot, so an emitted `(x, y)` can be either
//! a pixel of that image or a 0–1000 normalized position. The most recent
//! full-display screenshot fixes the facts needed to tell them apart.

use serde::{Deserialize, Serialize};

/// Upper bound of the normalized coordinate range.
pub const NORMALIZED_MAX: f64 = 1000.0;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Physical display as reported by the backend. Bounds are logical units.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Display {
    pub index: usize,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub scale_factor: f64,
    pub is_primary: bool,
}

impl Display {
    pub fn logical_size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    /// HiDPI factor from a capture's physical size; may be fractional.
    pub fn infer_scale(&self, physical_width: u32, physical_height: u32) -> f64 {
        if self.width == 0 || self.height == 0 {
            return 1.0;
        }
        let sx = physical_width as f64 / self.width as f64;
        let sy = physical_height as f64 / self.height as f64;
        let scale = if (sx - sy).abs() < 0.01 { sx } else { sx.max(sy) };
        if scale.is_finite() && scale > 0.0 {
            scale
        } else {
            1.0
        }
    }
}

/// How an emitted coordinate pair is read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoordSpace {
    Normalized,
    ImagePixels,
}

/// Facts set by the latest screenshot and read by every coordinate tool.
#[derive(Clone, Debug, PartialEq)]
pub struct CoordinateState {
    pub logical_screen_size: Size,
    pub image_size: Size,
    pub effective_scale: f64,
    pub display_scale: f64,
    pub origin: (i32, i32),
}

impl Default for CoordinateState {
    fn default() -> Self {
        Self {
            logical_screen_size: Size::new(0, 0),
            image_size: Size::new(0, 0),
            effective_scale: 1.0,
            display_scale: 1.0,
            origin: (0, 0),
        }
    }
}

impl CoordinateState {
    /// Builds the state after capturing `display` at `physical` size and
    /// resizing the frame to `image`.
    pub fn from_capture(display: &Display, physical: Size, image: Size) -> Self {
        let display_scale = display.infer_scale(physical.width, physical.height);
        let effective_scale = effective_scale(physical.width, image.width, display_scale);
        Self {
            logical_screen_size: display.logical_size(),
            image_size: image,
            effective_scale,
            display_scale,
            origin: (display.x, display.y),
        }
    }

    /// Seeds the state from a display before any screenshot was taken.
    pub fn for_display(display: &Display) -> Self {
        Self {
            logical_screen_size: display.logical_size(),
            image_size: Size::new(0, 0),
            effective_scale: 1.0,
            display_scale: display.scale_factor.max(f64::MIN_POSITIVE),
            origin: (display.x, display.y),
        }
    }

    pub fn classify(&self, x: f64, y: f64) -> CoordSpace {
        let iw = self.image_size.width as f64;
        let ih = self.image_size.height as f64;
        if x > NORMALIZED_MAX || y > NORMALIZED_MAX {
            CoordSpace::ImagePixels
        } else if x >= iw || y >= ih {
            CoordSpace::Normalized
        } else if (iw > NORMALIZED_MAX || ih > NORMALIZED_MAX)
            && x < NORMALIZED_MAX
            && y < NORMALIZED_MAX
        {
            CoordSpace::Normalized
        } else {
            CoordSpace::ImagePixels
        }
    }

    /// Converts a model coordinate to a logical, on-screen input point.
    /// Never fails: out-of-range input is clamped.
    pub fn to_logical(&self, x: f64, y: f64) -> Point {
        let screen = self.logical_screen_size;
        let (lx, ly) = match self.classify(x, y) {
            CoordSpace::Normalized => denormalize(x, y, screen),
            CoordSpace::ImagePixels => (
                clamp_axis((x * self.effective_scale).round(), screen.width),
                clamp_axis((y * self.effective_scale).round(), screen.height),
            ),
        };
        Point::new(lx + self.origin.0 as f64, ly + self.origin.1 as f64)
    }

    /// Inverse of [`to_logical`](Self::to_logical): the pair the model should
    /// emit to land on `p`. Normalized whenever the classifier would read a
    /// small pair that way, image pixels otherwise.
    pub fn from_logical(&self, p: Point) -> (f64, f64) {
        let lx = p.x - self.origin.0 as f64;
        let ly = p.y - self.origin.1 as f64;
        let image = self.image_size;
        let reads_normalized = image.width == 0
            || image.height == 0
            || image.width as f64 > NORMALIZED_MAX
            || image.height as f64 > NORMALIZED_MAX;
        if reads_normalized {
            let (nx, ny) = normalize(lx, ly, self.logical_screen_size);
            // 1000 itself is read as image pixels
            return (nx.min(NORMALIZED_MAX - 1.0), ny.min(NORMALIZED_MAX - 1.0));
        }
        let scale = if self.effective_scale > 0.0 { self.effective_scale } else { 1.0 };
        (
            clamp_axis((lx / scale).round(), image.width),
            clamp_axis((ly / scale).round(), image.height),
        )
    }

    pub fn to_physical(&self, x: f64, y: f64) -> Point {
        let logical = self.to_logical(x, y);
        logical_to_physical(logical, self.display_scale)
    }
}

/// `(original_physical_width / resized_image_width) / display_scale_factor`.
pub fn effective_scale(physical_width: u32, image_width: u32, display_scale: f64) -> f64 {
    if image_width == 0 || display_scale <= 0.0 {
        return 1.0;
    }
    (physical_width as f64 / image_width as f64) / display_scale
}

fn clamp_axis(v: f64, size: u32) -> f64 {
    let max = size.saturating_sub(1) as f64;
    if v.is_nan() {
        return 0.0;
    }
    v.clamp(0.0, max)
}

/// Normalized 0–1000 → logical pixels within `[0, size-1]`.
pub fn denormalize(x: f64, y: f64, screen: Size) -> (f64, f64) {
    (
        clamp_axis((x * screen.width as f64 / NORMALIZED_MAX).round(), screen.width),
        clamp_axis((y * screen.height as f64 / NORMALIZED_MAX).round(), screen.height),
    )
}

/// Logical pixels → normalized 0–1000.
pub fn normalize(x: f64, y: f64, screen: Size) -> (f64, f64) {
    let nx = if screen.width == 0 {
        0.0
    } else {
        (x * NORMALIZED_MAX / screen.width as f64).round()
    };
    let ny = if screen.height == 0 {
        0.0
    } else {
        (y * NORMALIZED_MAX / screen.height as f64).round()
    };
    (nx.clamp(0.0, NORMALIZED_MAX), ny.clamp(0.0, NORMALIZED_MAX))
}

pub fn logical_to_physical(p: Point, scale: f64) -> Point {
    Point::new(p.x * scale, p.y * scale)
}

pub fn physical_to_logical(p: Point, scale: f64) -> Point {
    if scale <= 0.0 {
        return p;
    }
    Point::new(p.x / scale, p.y / scale)
}
