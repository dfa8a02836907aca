//! Pixel arena
//!
//! One RGBA8 buffer holds the whole image, stored row-major with pixel
//! `(x, y)` at byte `(y * side + x) * 4`. The byte stream seen by the rest
//! of the crate runs along the Hilbert curve: stream byte `b` is channel
//! `b % 4` of the pixel at curve index `b / 4`.

use crate::error::{PixelMapError, Result};
use crate::hilbert::HilbertCurve;
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

pub const BYTES_PER_PIXEL: usize = 4;

/// Shared handle to the single pixel arena
pub type SharedGrid = Arc<RwLock<PixelGrid>>;

#[derive(Debug, Clone)]
pub struct PixelGrid {
    curve: HilbertCurve,
    pixels: Vec<u8>,
}

impl PixelGrid {
    /// Blank (all-zero) grid
    pub fn new(grid_size: u32) -> Result<Self> {
        let curve = HilbertCurve::for_grid(grid_size)?;
        let len = curve.len() as usize * BYTES_PER_PIXEL;
        Ok(PixelGrid {
            curve,
            pixels: vec![0u8; len],
        })
    }

    /// Wrap an existing row-major RGBA buffer
    pub fn from_rgba(grid_size: u32, pixels: Vec<u8>) -> Result<Self> {
        let curve = HilbertCurve::for_grid(grid_size)?;
        let expected = curve.len() as usize * BYTES_PER_PIXEL;
        if pixels.len() != expected {
            return Err(PixelMapError::InvalidGrid(format!(
                "expected {} RGBA bytes for a {}x{} grid, got {}",
                expected,
                grid_size,
                grid_size,
                pixels.len()
            )));
        }
        Ok(PixelGrid { curve, pixels })
    }

    /// Load a square PNG (any color type, converted to RGBA8)
    pub fn load_png<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let image = image::open(path)?.to_rgba8();
        let (width, height) = image.dimensions();
        if width != height {
            return Err(PixelMapError::InvalidGrid(format!(
                "image {:?} is {}x{}, expected a square",
                path, width, height
            )));
        }
        debug!("Loaded {}x{} pixel grid from {:?}", width, height, path);
        Self::from_rgba(width, image.into_raw())
    }

    /// Write the grid as an RGBA8 PNG
    pub fn save_png<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let side = self.grid_size();
        let image = image::RgbaImage::from_raw(side, side, self.pixels.clone()).ok_or_else(|| {
            PixelMapError::InvalidGrid("pixel buffer does not match grid size".to_string())
        })?;
        image.save_with_format(path.as_ref(), image::ImageFormat::Png)?;
        debug!("Saved {}x{} pixel grid to {:?}", side, side, path.as_ref());
        Ok(())
    }

    pub fn grid_size(&self) -> u32 {
        self.curve.side()
    }

    pub fn curve(&self) -> &HilbertCurve {
        &self.curve
    }

    /// Length of the Hilbert byte stream
    pub fn stream_len(&self) -> u64 {
        self.pixels.len() as u64
    }

    /// Raw row-major RGBA bytes
    pub fn as_raw(&self) -> &[u8] {
        &self.pixels
    }

    pub fn into_raw(self) -> Vec<u8> {
        self.pixels
    }

    fn pixel_offset(&self, pixel_index: u64) -> Result<usize> {
        let (x, y) = self.curve.index_to_xy(pixel_index)?;
        Ok((y as usize * self.grid_size() as usize + x as usize) * BYTES_PER_PIXEL)
    }

    fn check_range(&self, start: u64, len: usize) -> Result<u64> {
        start
            .checked_add(len as u64)
            .filter(|&end| end <= self.stream_len())
            .ok_or_else(|| {
                PixelMapError::OutOfBounds(format!(
                    "stream range {}+{} exceeds {} bytes",
                    start,
                    len,
                    self.stream_len()
                ))
            })
    }

    /// Read `len` stream bytes starting at `start`
    pub fn read_stream(&self, start: u64, len: usize) -> Result<Vec<u8>> {
        let end = self.check_range(start, len)?;
        let mut out = Vec::with_capacity(len);
        let mut pos = start;
        while pos < end {
            let channel = (pos % BYTES_PER_PIXEL as u64) as usize;
            let take = ((BYTES_PER_PIXEL - channel) as u64).min(end - pos) as usize;
            let base = self.pixel_offset(pos / BYTES_PER_PIXEL as u64)? + channel;
            out.extend_from_slice(&self.pixels[base..base + take]);
            pos += take as u64;
        }
        Ok(out)
    }

    /// Write `data` into the stream starting at `start`
    pub fn write_stream(&mut self, start: u64, data: &[u8]) -> Result<()> {
        let end = self.check_range(start, data.len())?;
        let mut pos = start;
        let mut consumed = 0usize;
        while pos < end {
            let channel = (pos % BYTES_PER_PIXEL as u64) as usize;
            let take = ((BYTES_PER_PIXEL - channel) as u64).min(end - pos) as usize;
            let base = self.pixel_offset(pos / BYTES_PER_PIXEL as u64)? + channel;
            self.pixels[base..base + take].copy_from_slice(&data[consumed..consumed + take]);
            pos += take as u64;
            consumed += take;
        }
        Ok(())
    }

    /// Zero `len` stream bytes starting at `start`
    pub fn zero_stream(&mut self, start: u64, len: usize) -> Result<()> {
        self.write_stream(start, &vec![0u8; len])
    }

    pub fn into_shared(self) -> SharedGrid {
        Arc::new(RwLock::new(self))
    }
}
