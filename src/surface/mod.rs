// SPDX-License-Identifier: MPL-2.0

//! Presentation surfaces the player uploads frames into.
//!
//! The only geometry the player relies on is [`letterbox`]: a frame is scaled
//! uniformly to fit the destination and centered, with the margins left black.

mod canvas;
mod framebuffer;

pub use canvas::Canvas;
pub use framebuffer::Framebuffer;

use image::RgbaImage;

/// A pixel rectangle on a surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    #[must_use]
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Rectangle covering a whole surface of the given size.
    #[must_use]
    pub const fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Fit a `src` sized frame into `dst`, preserving aspect ratio.
///
/// Returns `None` when either side is empty.
#[must_use]
pub fn letterbox(src: (u32, u32), dst: Rect) -> Option<Rect> {
    let (w, h) = src;
    if w == 0 || h == 0 || dst.is_empty() {
        return None;
    }

    let scale =
        (f64::from(dst.width) / f64::from(w)).min(f64::from(dst.height) / f64::from(h));

    let width = ((f64::from(w) * scale).round() as u32).clamp(1, dst.width);
    let height = ((f64::from(h) * scale).round() as u32).clamp(1, dst.height);

    Some(Rect {
        x: dst.x + (dst.width - width) / 2,
        y: dst.y + (dst.height - height) / 2,
        width,
        height,
    })
}

/// Somewhere frames can be shown.
pub trait Surface {
    /// Drawable size in pixels.
    fn size(&self) -> (u32, u32);

    /// Show `frame` scaled into `region`; everything outside it is cleared.
    fn present(&mut self, frame: &RgbaImage, region: Rect) -> eyre::Result<()>;
}
