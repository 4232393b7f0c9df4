// SPDX-License-Identifier: MPL-2.0

//! Linux fbdev output.
//!
//! Frames are composed on a [`Canvas`] and written to the device as
//! little-endian XRGB8888 rows at the device stride. Geometry comes from sysfs
//! (`/sys/class/graphics/fbN`), which avoids the fbdev ioctls.

use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
};

use eyre::WrapErr;
use image::RgbaImage;
use tracing::info;

use super::{Canvas, Rect, Surface};

#[derive(Debug)]
pub struct Framebuffer {
    device: File,
    path: PathBuf,
    canvas: Canvas,
    stride: usize,
    row: Vec<u8>,
}

impl Framebuffer {
    /// Open a framebuffer device such as `/dev/fb0`.
    pub fn open(path: &Path) -> eyre::Result<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| eyre::eyre!("not a framebuffer device: {}", path.display()))?;
        let sysfs = Path::new("/sys/class/graphics").join(name);

        let (width, height) = parse_pair(&read_attr(&sysfs, "virtual_size")?)
            .ok_or_else(|| eyre::eyre!("malformed virtual_size for {name}"))?;
        let bpp: u32 = read_attr(&sysfs, "bits_per_pixel")?
            .parse()
            .wrap_err("malformed bits_per_pixel")?;
        let stride: usize = read_attr(&sysfs, "stride")?
            .parse()
            .wrap_err("malformed stride")?;

        if bpp != 32 {
            return Err(eyre::eyre!("{name} is {bpp} bpp, only 32 bpp is supported"));
        }

        let device = OpenOptions::new()
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open {}", path.display()))?;

        info!(device = %path.display(), width, height, stride, "Opened framebuffer");

        Ok(Self {
            device,
            path: path.to_path_buf(),
            canvas: Canvas::new(width, height),
            stride,
            row: vec![0; width as usize * 4],
        })
    }

    fn flush(&mut self) -> eyre::Result<()> {
        let image = self.canvas.image();
        let width = image.width() as usize;

        for (y, pixels) in image.as_raw().chunks_exact(width * 4).enumerate() {
            xrgb8888_row(&mut self.row, pixels);
            self.device
                .write_all_at(&self.row, (y * self.stride) as u64)
                .wrap_err_with(|| format!("failed to write to {}", self.path.display()))?;
        }

        Ok(())
    }
}

impl Surface for Framebuffer {
    fn size(&self) -> (u32, u32) {
        self.canvas.size()
    }

    fn present(&mut self, frame: &RgbaImage, region: Rect) -> eyre::Result<()> {
        self.canvas.present(frame, region)?;
        self.flush()
    }
}

fn read_attr(dir: &Path, attr: &str) -> eyre::Result<String> {
    let path = dir.join(attr);
    let text = std::fs::read_to_string(&path)
        .wrap_err_with(|| format!("failed to read {}", path.display()))?;
    Ok(text.trim().to_string())
}

/// Parse sysfs `W,H` pairs.
fn parse_pair(text: &str) -> Option<(u32, u32)> {
    let (w, h) = text.split_once(',')?;
    Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
}

/// Convert one row of RGBA pixels to XRGB8888.
fn xrgb8888_row(out: &mut [u8], rgba: &[u8]) {
    for (dst, src) in out.chunks_exact_mut(4).zip(rgba.chunks_exact(4)) {
        let [r, g, b] = [src[0], src[1], src[2]];

        let r = u32::from(r) << 16;
        let g = u32::from(g) << 8;
        let b = u32::from(b);

        dst.copy_from_slice(&(r | g | b).to_le_bytes());
    }
}
