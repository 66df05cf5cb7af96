//! Rectangle decoders.
//!
//! The state machine never interprets pixel payloads itself; it looks up a
//! [`RectDecoder`] by encoding id and receives plain pixels in the
//! framebuffer's own format.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};

use super::wire::{EncodedRect, Payload, PixelFormat};
use crate::error::DecodeError;

pub const ENCODING_RAW: i32 = 0;
pub const ENCODING_RRE: i32 = 2;

/// A decoded update: row-major pixels covering exactly its rectangle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramebufferRegion {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
    pub encoding: i32,
    pub pixels: Vec<u8>,
}

pub trait RectDecoder: Send + Sync {
    fn encoding(&self) -> i32;

    fn decode(
        &self,
        rect: &EncodedRect,
        format: &PixelFormat,
    ) -> Result<FramebufferRegion, DecodeError>;
}

/// Encoding 0: pixels sent as-is.
pub struct RawDecoder;

impl RectDecoder for RawDecoder {
    fn encoding(&self) -> i32 {
        ENCODING_RAW
    }

    fn decode(
        &self,
        rect: &EncodedRect,
        format: &PixelFormat,
    ) -> Result<FramebufferRegion, DecodeError> {
        let expected = area(rect) * format.bytes_per_pixel();
        let mut payload = Payload(rect.data.clone());
        let pixels = payload.bytes(expected)?;
        payload.finish()?;
        Ok(region(rect, pixels.to_vec()))
    }
}

/// Encoding 2: a background colour plus solid subrectangles.
pub struct RreDecoder;

impl RectDecoder for RreDecoder {
    fn encoding(&self) -> i32 {
        ENCODING_RRE
    }

    fn decode(
        &self,
        rect: &EncodedRect,
        format: &PixelFormat,
    ) -> Result<FramebufferRegion, DecodeError> {
        let bpp = format.bytes_per_pixel();
        let mut payload = Payload(rect.data.clone());
        let count = payload.u32()?;
        let background = payload.bytes(bpp)?;

        let mut pixels = background.repeat(area(rect));
        let stride = usize::from(rect.width) * bpp;
        for _ in 0..count {
            let colour = payload.bytes(bpp)?;
            let sx = payload.u16()?;
            let sy = payload.u16()?;
            let sw = payload.u16()?;
            let sh = payload.u16()?;
            if u32::from(sx) + u32::from(sw) > u32::from(rect.width)
                || u32::from(sy) + u32::from(sh) > u32::from(rect.height)
            {
                return Err(DecodeError::SubrectOutOfBounds {
                    w: rect.width,
                    h: rect.height,
                });
            }
            let fill = colour.repeat(usize::from(sw));
            for row in usize::from(sy)..usize::from(sy) + usize::from(sh) {
                let start = row * stride + usize::from(sx) * bpp;
                pixels[start..start + fill.len()].copy_from_slice(&fill);
            }
        }
        payload.finish()?;
        Ok(region(rect, pixels))
    }
}

pub struct DecoderRegistry {
    decoders: HashMap<i32, Box<dyn RectDecoder>>,
}

impl DecoderRegistry {
    pub fn empty() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Replaces any decoder already registered for the same encoding.
    pub fn register(&mut self, decoder: Box<dyn RectDecoder>) {
        self.decoders.insert(decoder.encoding(), decoder);
    }

    pub fn decode(
        &self,
        rect: &EncodedRect,
        format: &PixelFormat,
    ) -> Result<FramebufferRegion, DecodeError> {
        self.decoders
            .get(&rect.encoding)
            .ok_or(DecodeError::UnsupportedEncoding(rect.encoding))?
            .decode(rect, format)
    }
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(RawDecoder));
        registry.register(Box::new(RreDecoder));
        registry
    }
}

impl std::fmt::Debug for DecoderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut encodings: Vec<_> = self.decoders.keys().collect();
        encodings.sort();
        f.debug_struct("DecoderRegistry")
            .field("encodings", &encodings)
            .finish()
    }
}

impl EncodedRect {
    pub fn raw(x: u16, y: u16, width: u16, height: u16, pixels: Vec<u8>) -> Self {
        Self {
            x,
            y,
            width,
            height,
            encoding: ENCODING_RAW,
            data: Bytes::from(pixels),
        }
    }

    /// Builds an RRE rectangle; subrects are `(pixel, x, y, w, h)` relative
    /// to the rectangle.
    pub fn rre(
        x: u16,
        y: u16,
        width: u16,
        height: u16,
        background: &[u8],
        subrects: &[(&[u8], u16, u16, u16, u16)],
    ) -> Self {
        let mut data = BytesMut::new();
        data.put_u32(subrects.len() as u32);
        data.extend_from_slice(background);
        for (pixel, sx, sy, sw, sh) in subrects {
            data.extend_from_slice(pixel);
            data.put_u16(*sx);
            data.put_u16(*sy);
            data.put_u16(*sw);
            data.put_u16(*sh);
        }
        Self {
            x,
            y,
            width,
            height,
            encoding: ENCODING_RRE,
            data: data.freeze(),
        }
    }
}

fn area(rect: &EncodedRect) -> usize {
    usize::from(rect.width) * usize::from(rect.height)
}

fn region(rect: &EncodedRect, pixels: Vec<u8>) -> FramebufferRegion {
    FramebufferRegion {
        x: rect.x,
        y: rect.y,
        width: rect.width,
        height: rect.height,
        encoding: rect.encoding,
        pixels,
    }
}
