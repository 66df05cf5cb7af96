use std::sync::Arc;

use super::codec::FramebufferRegion;
use super::wire::PixelFormat;
use crate::error::ProtocolError;

/// Immutable view of the framebuffer at one point in time.
///
/// Snapshots share storage with the live buffer until the next write, which
/// copies first if any snapshot is still alive, so a reader never observes a
/// half-applied region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSnapshot {
    width: u16,
    height: u16,
    format: PixelFormat,
    pixels: Arc<Vec<u8>>,
}

impl FrameSnapshot {
    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    pub fn format(&self) -> &PixelFormat {
        &self.format
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixel(&self, x: u16, y: u16) -> Option<&[u8]> {
        pixel_at(&self.pixels, self.width, self.height, &self.format, x, y)
    }
}

#[derive(Debug, Clone)]
pub struct Framebuffer {
    width: u16,
    height: u16,
    format: PixelFormat,
    pixels: Arc<Vec<u8>>,
}

impl Framebuffer {
    /// Bytes needed to hold a `width`x`height` buffer in `format`.
    pub fn byte_len(width: u16, height: u16, format: &PixelFormat) -> usize {
        usize::from(width) * usize::from(height) * format.bytes_per_pixel()
    }

    /// Allocates a zeroed buffer of the advertised dimensions.
    pub fn new(width: u16, height: u16, format: PixelFormat) -> Self {
        let len = Self::byte_len(width, height, &format);
        Self {
            width,
            height,
            format,
            pixels: Arc::new(vec![0; len]),
        }
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    pub fn format(&self) -> &PixelFormat {
        &self.format
    }

    pub fn pixel(&self, x: u16, y: u16) -> Option<&[u8]> {
        pixel_at(&self.pixels, self.width, self.height, &self.format, x, y)
    }

    /// Copies `region` over the buffer. Nothing is written unless the whole
    /// rectangle fits and the payload matches its size.
    pub fn apply(&mut self, region: &FramebufferRegion) -> Result<(), ProtocolError> {
        self.check_bounds(region.x, region.y, region.width, region.height)?;

        let bpp = self.format.bytes_per_pixel();
        let row_len = usize::from(region.width) * bpp;
        let expected = row_len * usize::from(region.height);
        if region.pixels.len() != expected {
            return Err(ProtocolError::PixelPayload {
                expected,
                actual: region.pixels.len(),
            });
        }
        if expected == 0 {
            return Ok(());
        }

        let stride = usize::from(self.width) * bpp;
        let pixels = Arc::make_mut(&mut self.pixels);
        for (row, src) in region.pixels.chunks_exact(row_len).enumerate() {
            let start = (usize::from(region.y) + row) * stride + usize::from(region.x) * bpp;
            pixels[start..start + row_len].copy_from_slice(src);
        }
        Ok(())
    }

    /// Fails unless the rectangle lies entirely inside the buffer.
    pub fn check_bounds(&self, x: u16, y: u16, w: u16, h: u16) -> Result<(), ProtocolError> {
        if u32::from(x) + u32::from(w) > u32::from(self.width)
            || u32::from(y) + u32::from(h) > u32::from(self.height)
        {
            return Err(ProtocolError::RegionOutOfBounds {
                x,
                y,
                w,
                h,
                width: self.width,
                height: self.height,
            });
        }
        Ok(())
    }

    pub fn snapshot(&self) -> FrameSnapshot {
        FrameSnapshot {
            width: self.width,
            height: self.height,
            format: self.format,
            pixels: Arc::clone(&self.pixels),
        }
    }
}

fn pixel_at<'a>(
    pixels: &'a [u8],
    width: u16,
    height: u16,
    format: &PixelFormat,
    x: u16,
    y: u16,
) -> Option<&'a [u8]> {
    if x >= width || y >= height {
        return None;
    }
    let bpp = format.bytes_per_pixel();
    let start = (usize::from(y) * usize::from(width) + usize::from(x)) * bpp;
    pixels.get(start..start + bpp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::codec::ENCODING_RAW;

    fn solid(x: u16, y: u16, width: u16, height: u16, value: u8) -> FramebufferRegion {
        FramebufferRegion {
            x,
            y,
            width,
            height,
            encoding: ENCODING_RAW,
            pixels: vec![value; usize::from(width) * usize::from(height) * 4],
        }
    }

    /// Straightforward per-pixel model used to cross-check `apply`.
    fn reference(width: u16, height: u16, regions: &[FramebufferRegion]) -> Vec<u8> {
        let mut out = vec![0u8; usize::from(width) * usize::from(height) * 4];
        for region in regions {
            for ry in 0..region.height {
                for rx in 0..region.width {
                    let src = (usize::from(ry) * usize::from(region.width) + usize::from(rx)) * 4;
                    let dst = (usize::from(region.y + ry) * usize::from(width)
                        + usize::from(region.x + rx))
                        * 4;
                    out[dst..dst + 4].copy_from_slice(&region.pixels[src..src + 4]);
                }
            }
        }
        out
    }

    #[test]
    fn overlapping_regions_apply_in_arrival_order() {
        let regions = vec![
            solid(0, 0, 8, 6, 1),
            solid(2, 1, 4, 4, 2),
            solid(3, 3, 5, 3, 3),
            solid(0, 5, 8, 1, 4),
        ];
        let mut framebuffer = Framebuffer::new(8, 6, PixelFormat::RGB888);
        for region in &regions {
            framebuffer.apply(region).unwrap();
        }
        assert_eq!(framebuffer.snapshot().pixels(), &reference(8, 6, &regions)[..]);

        let mut reversed = Framebuffer::new(8, 6, PixelFormat::RGB888);
        for region in regions.iter().rev() {
            reversed.apply(region).unwrap();
        }
        assert_ne!(reversed.snapshot(), framebuffer.snapshot());
    }

    #[test]
    fn out_of_bounds_region_leaves_buffer_untouched() {
        let mut framebuffer = Framebuffer::new(4, 4, PixelFormat::RGB888);
        framebuffer.apply(&solid(0, 0, 4, 4, 7)).unwrap();
        let before = framebuffer.snapshot();

        for region in [solid(3, 0, 2, 1, 9), solid(0, 2, 1, 3, 9), solid(9, 9, 1, 1, 9)] {
            let err = framebuffer.apply(&region).unwrap_err();
            assert!(matches!(err, ProtocolError::RegionOutOfBounds { .. }));
        }
        assert_eq!(framebuffer.snapshot(), before);
    }

    #[test]
    fn coordinates_near_u16_max_do_not_overflow() {
        let mut framebuffer = Framebuffer::new(4, 4, PixelFormat::RGB888);
        let region = FramebufferRegion {
            x: u16::MAX,
            y: 0,
            width: 2,
            height: 1,
            encoding: ENCODING_RAW,
            pixels: vec![0; 8],
        };
        assert!(framebuffer.apply(&region).is_err());
    }

    #[test]
    fn bounds_check_matches_apply() {
        let framebuffer = Framebuffer::new(4, 4, PixelFormat::RGB888);
        assert!(framebuffer.check_bounds(0, 0, 4, 4).is_ok());
        assert!(framebuffer.check_bounds(3, 3, 1, 1).is_ok());
        assert_eq!(
            framebuffer.check_bounds(0, 0, u16::MAX, u16::MAX).unwrap_err(),
            ProtocolError::RegionOutOfBounds {
                x: 0,
                y: 0,
                w: u16::MAX,
                h: u16::MAX,
                width: 4,
                height: 4,
            }
        );
        assert_eq!(Framebuffer::byte_len(640, 480, &PixelFormat::RGB888), 640 * 480 * 4);
    }

    #[test]
    fn payload_size_mismatch_is_rejected() {
        let mut framebuffer = Framebuffer::new(4, 4, PixelFormat::RGB888);
        let mut region = solid(0, 0, 2, 2, 1);
        region.pixels.pop();
        assert_eq!(
            framebuffer.apply(&region).unwrap_err(),
            ProtocolError::PixelPayload {
                expected: 16,
                actual: 15,
            }
        );
    }

    #[test]
    fn snapshot_is_not_affected_by_later_writes() {
        let mut framebuffer = Framebuffer::new(2, 2, PixelFormat::RGB888);
        framebuffer.apply(&solid(0, 0, 2, 2, 1)).unwrap();
        let snapshot = framebuffer.snapshot();

        framebuffer.apply(&solid(0, 0, 1, 1, 5)).unwrap();

        assert_eq!(snapshot.pixel(0, 0), Some(&[1u8, 1, 1, 1][..]));
        assert_eq!(framebuffer.pixel(0, 0), Some(&[5u8, 5, 5, 5][..]));
        assert_eq!(snapshot.pixel(2, 0), None);
    }
}
