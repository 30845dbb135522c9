// Texture decoding for GPU upload.
//
// Decoding is delegated to the `image` crate; this module only normalises
// the result to tightly packed RGBA8.

use anyhow::{Context, Result};
use std::path::Path;

/// Decoded RGBA8 pixels, rows top to bottom, no padding between rows
#[derive(Debug, Clone, PartialEq)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl TextureData {
    pub const BYTES_PER_PIXEL: u32 = 4;

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let image = image::open(path)
            .with_context(|| format!("Failed to decode texture {:?}", path))?
            .into_rgba8();
        let (width, height) = image.dimensions();

        log::info!("Loaded texture {}x{} from {:?}", width, height, path);

        Ok(Self {
            width,
            height,
            pixels: image.into_raw(),
        })
    }

    /// Two-tone checkerboard, `cell` pixels per square
    pub fn checkerboard(size: u32, cell: u32) -> Self {
        let cell = cell.max(1);
        let mut pixels = Vec::with_capacity((size * size * Self::BYTES_PER_PIXEL) as usize);
        for y in 0..size {
            for x in 0..size {
                let light = ((x / cell) + (y / cell)) % 2 == 0;
                let texel = if light {
                    [235, 235, 235, 255]
                } else {
                    [40, 40, 48, 255]
                };
                pixels.extend_from_slice(&texel);
            }
        }

        Self {
            width: size,
            height: size,
            pixels,
        }
    }

    /// Decode `path`, or fall back to a checkerboard when it is missing or
    /// unreadable.
    pub fn load_or_fallback<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match Self::from_file(path) {
            Ok(texture) => texture,
            Err(e) => {
                log::warn!("{:#}. Using a checkerboard texture instead.", e);
                Self::checkerboard(256, 32)
            }
        }
    }

    pub fn row_bytes(&self) -> usize {
        (self.width * Self::BYTES_PER_PIXEL) as usize
    }

    pub fn byte_len(&self) -> usize {
        self.row_bytes() * self.height as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkerboard_alternates_cells() {
        let tex = TextureData::checkerboard(8, 4);
        assert_eq!(tex.pixels.len(), tex.byte_len());
        assert_eq!(tex.row_bytes(), 32);

        let texel = |x: usize, y: usize| {
            let i = (y * 8 + x) * 4;
            &tex.pixels[i..i + 4]
        };
        assert_eq!(texel(0, 0), texel(3, 3));
        assert_ne!(texel(0, 0), texel(4, 0));
        assert_ne!(texel(0, 0), texel(0, 4));
        assert_eq!(texel(0, 0), texel(4, 4));
        assert!(tex.pixels.chunks(4).all(|p| p[3] == 255));
    }

    #[test]
    fn zero_cell_does_not_divide_by_zero() {
        let tex = TextureData::checkerboard(2, 0);
        assert_eq!(tex.pixels.len(), 16);
    }

    #[test]
    fn missing_file_falls_back() {
        let tex = TextureData::load_or_fallback("no/such/texture.png");
        assert_eq!((tex.width, tex.height), (256, 256));
        assert_eq!(tex.pixels.len(), 256 * 256 * 4);
    }

    #[test]
    fn decodes_png() {
        let dir = std::env::temp_dir().join(format!("cube-renderer-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("tiny.png");

        let img = image::RgbImage::from_fn(3, 2, |x, y| image::Rgb([x as u8 * 10, y as u8 * 10, 7]));
        img.save(&path).unwrap();

        let tex = TextureData::from_file(&path).unwrap();
        assert_eq!((tex.width, tex.height), (3, 2));
        // RGB input is expanded to RGBA with opaque alpha
        assert_eq!(&tex.pixels[4..8], &[10, 0, 7, 255]);

        std::fs::remove_dir_all(&dir).ok();
    }
}
