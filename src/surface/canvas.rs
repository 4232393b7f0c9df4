// SPDX-License-Identifier: MPL-2.0

//! In-memory RGBA surface.

use image::{Rgba, RgbaImage, imageops::FilterType};

use super::{Rect, Surface};

const BLACK: Rgba<u8> = Rgba([0, 0, 0, 255]);

/// Software composition target. Also backs [`super::Framebuffer`].
#[derive(Debug, Clone)]
pub struct Canvas {
    image: RgbaImage,
    frames_presented: u64,
}

impl Canvas {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            image: RgbaImage::from_pixel(width, height, BLACK),
            frames_presented: 0,
        }
    }

    /// The composed contents.
    #[must_use]
    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    #[must_use]
    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }
}

impl Surface for Canvas {
    fn size(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    fn present(&mut self, frame: &RgbaImage, region: Rect) -> eyre::Result<()> {
        let (width, height) = self.image.dimensions();
        if region.x + region.width > width || region.y + region.height > height {
            return Err(eyre::eyre!(
                "region {region:?} exceeds {width}x{height} canvas"
            ));
        }

        for pixel in self.image.pixels_mut() {
            *pixel = BLACK;
        }

        if region.is_empty() {
            self.frames_presented += 1;
            return Ok(());
        }

        if frame.dimensions() == (region.width, region.height) {
            image::imageops::replace(&mut self.image, frame, region.x.into(), region.y.into());
        } else {
            let scaled =
                image::imageops::resize(frame, region.width, region.height, FilterType::Triangle);
            image::imageops::replace(&mut self.image, &scaled, region.x.into(), region.y.into());
        }

        self.frames_presented += 1;
        Ok(())
    }
}
