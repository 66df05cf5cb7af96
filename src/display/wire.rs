//! Framing and message codec for the display channel.
//!
//! Every message is `kind: u8, length: u32, payload[length]`, big-endian.
//! The length prefix lets the reader skip any payload it cannot decode
//! without losing alignment with the following message.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{DecodeError, FrameError};

pub const HEADER_LEN: usize = 5;

pub const KIND_SERVER_INIT: u8 = 0x00;
pub const KIND_FRAMEBUFFER_UPDATE: u8 = 0x01;
pub const KIND_BELL: u8 = 0x02;
pub const KIND_SERVER_CLIPBOARD: u8 = 0x03;

pub const KIND_POINTER: u8 = 0x10;
pub const KIND_KEY: u8 = 0x11;
pub const KIND_CLIENT_CLIPBOARD: u8 = 0x12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelFormat {
    pub bits_per_pixel: u8,
    pub depth: u8,
    pub big_endian: bool,
    pub true_colour: bool,
    pub red_max: u16,
    pub green_max: u16,
    pub blue_max: u16,
    pub red_shift: u8,
    pub green_shift: u8,
    pub blue_shift: u8,
}

impl PixelFormat {
    /// 32-bit little-endian `xRGB`.
    pub const RGB888: Self = Self {
        bits_per_pixel: 32,
        depth: 24,
        big_endian: false,
        true_colour: true,
        red_max: 255,
        green_max: 255,
        blue_max: 255,
        red_shift: 16,
        green_shift: 8,
        blue_shift: 0,
    };

    pub fn bytes_per_pixel(&self) -> usize {
        usize::from(self.bits_per_pixel / 8)
    }

    pub fn is_supported(&self) -> bool {
        self.true_colour && matches!(self.bits_per_pixel, 8 | 16 | 32)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInit {
    pub width: u16,
    pub height: u16,
    pub format: PixelFormat,
    pub name: String,
}

/// A rectangle as sent by the server, pixels still in their wire encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedRect {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
    pub encoding: i32,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    ServerInit(ServerInit),
    FramebufferUpdate { sequence: u32, rects: Vec<EncodedRect> },
    Bell,
    Clipboard(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Pointer { button_mask: u8, x: u16, y: u16 },
    Key { down: bool, keysym: u32 },
    Clipboard(String),
}

/// A length-delimited frame whose payload has not been interpreted yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub kind: u8,
    pub payload: Bytes,
}

/// Reassembles frames from arbitrarily split byte chunks.
#[derive(Debug)]
pub struct FrameReader {
    buffer: BytesMut,
    max_frame_len: usize,
    skip: usize,
}

impl FrameReader {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_frame_len,
            skip: 0,
        }
    }

    pub fn push(&mut self, mut chunk: &[u8]) -> Vec<Result<RawFrame, FrameError>> {
        if self.skip > 0 {
            let skipped = self.skip.min(chunk.len());
            self.skip -= skipped;
            chunk = &chunk[skipped..];
        }
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while self.buffer.len() >= HEADER_LEN {
            let mut header = &self.buffer[..HEADER_LEN];
            let kind = header.get_u8();
            let len = header.get_u32() as usize;

            if len > self.max_frame_len {
                frames.push(Err(FrameError::Oversized {
                    len,
                    limit: self.max_frame_len,
                }));
                self.buffer.advance(HEADER_LEN);
                let available = len.min(self.buffer.len());
                self.buffer.advance(available);
                self.skip = len - available;
                continue;
            }

            if self.buffer.len() < HEADER_LEN + len {
                break;
            }
            self.buffer.advance(HEADER_LEN);
            let payload = self.buffer.split_to(len).freeze();
            frames.push(Ok(RawFrame { kind, payload }));
        }
        frames
    }

    /// Bytes held for a frame that has not fully arrived.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

pub fn decode_server_message(frame: RawFrame) -> Result<ServerMessage, DecodeError> {
    let mut payload = Payload(frame.payload);
    let message = match frame.kind {
        KIND_SERVER_INIT => {
            let width = payload.u16()?;
            let height = payload.u16()?;
            let format = payload.pixel_format()?;
            let name = payload.text()?;
            ServerMessage::ServerInit(ServerInit {
                width,
                height,
                format,
                name,
            })
        }
        KIND_FRAMEBUFFER_UPDATE => {
            let sequence = payload.u32()?;
            let count = payload.u16()?;
            let mut rects = Vec::with_capacity(usize::from(count));
            for _ in 0..count {
                let x = payload.u16()?;
                let y = payload.u16()?;
                let width = payload.u16()?;
                let height = payload.u16()?;
                let encoding = payload.i32()?;
                let len = payload.u32()? as usize;
                let data = payload.bytes(len)?;
                rects.push(EncodedRect {
                    x,
                    y,
                    width,
                    height,
                    encoding,
                    data,
                });
            }
            ServerMessage::FramebufferUpdate { sequence, rects }
        }
        KIND_BELL => ServerMessage::Bell,
        KIND_SERVER_CLIPBOARD => ServerMessage::Clipboard(payload.text()?),
        other => return Err(DecodeError::UnknownKind(other)),
    };
    payload.finish()?;
    Ok(message)
}

pub fn decode_client_message(frame: RawFrame) -> Result<ClientMessage, DecodeError> {
    let mut payload = Payload(frame.payload);
    let message = match frame.kind {
        KIND_POINTER => {
            let button_mask = payload.u8()?;
            let x = payload.u16()?;
            let y = payload.u16()?;
            ClientMessage::Pointer { button_mask, x, y }
        }
        KIND_KEY => {
            let down = payload.u8()? != 0;
            payload.bytes(2)?;
            let keysym = payload.u32()?;
            ClientMessage::Key { down, keysym }
        }
        KIND_CLIENT_CLIPBOARD => ClientMessage::Clipboard(payload.text()?),
        other => return Err(DecodeError::UnknownKind(other)),
    };
    payload.finish()?;
    Ok(message)
}

pub fn encode_server_message(message: &ServerMessage) -> Bytes {
    let mut payload = BytesMut::new();
    let kind = match message {
        ServerMessage::ServerInit(init) => {
            payload.put_u16(init.width);
            payload.put_u16(init.height);
            put_pixel_format(&mut payload, &init.format);
            put_text(&mut payload, &init.name);
            KIND_SERVER_INIT
        }
        ServerMessage::FramebufferUpdate { sequence, rects } => {
            payload.put_u32(*sequence);
            payload.put_u16(rects.len() as u16);
            for rect in rects {
                payload.put_u16(rect.x);
                payload.put_u16(rect.y);
                payload.put_u16(rect.width);
                payload.put_u16(rect.height);
                payload.put_i32(rect.encoding);
                payload.put_u32(rect.data.len() as u32);
                payload.extend_from_slice(&rect.data);
            }
            KIND_FRAMEBUFFER_UPDATE
        }
        ServerMessage::Bell => KIND_BELL,
        ServerMessage::Clipboard(text) => {
            put_text(&mut payload, text);
            KIND_SERVER_CLIPBOARD
        }
    };
    frame(kind, payload)
}

pub fn encode_client_message(message: &ClientMessage) -> Bytes {
    let mut payload = BytesMut::new();
    let kind = match message {
        ClientMessage::Pointer { button_mask, x, y } => {
            payload.put_u8(*button_mask);
            payload.put_u16(*x);
            payload.put_u16(*y);
            KIND_POINTER
        }
        ClientMessage::Key { down, keysym } => {
            payload.put_u8(u8::from(*down));
            payload.put_bytes(0, 2);
            payload.put_u32(*keysym);
            KIND_KEY
        }
        ClientMessage::Clipboard(text) => {
            put_text(&mut payload, text);
            KIND_CLIENT_CLIPBOARD
        }
    };
    frame(kind, payload)
}

fn frame(kind: u8, payload: BytesMut) -> Bytes {
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    out.put_u8(kind);
    out.put_u32(payload.len() as u32);
    out.extend_from_slice(&payload);
    out.freeze()
}

fn put_pixel_format(buf: &mut BytesMut, format: &PixelFormat) {
    buf.put_u8(format.bits_per_pixel);
    buf.put_u8(format.depth);
    buf.put_u8(u8::from(format.big_endian));
    buf.put_u8(u8::from(format.true_colour));
    buf.put_u16(format.red_max);
    buf.put_u16(format.green_max);
    buf.put_u16(format.blue_max);
    buf.put_u8(format.red_shift);
    buf.put_u8(format.green_shift);
    buf.put_u8(format.blue_shift);
    buf.put_bytes(0, 3);
}

fn put_text(buf: &mut BytesMut, text: &str) {
    buf.put_u32(text.len() as u32);
    buf.extend_from_slice(text.as_bytes());
}

/// Bounds-checked cursor over a frame payload.
pub(crate) struct Payload(pub(crate) Bytes);

impl Payload {
    fn need(&self, len: usize) -> Result<(), DecodeError> {
        match len.checked_sub(self.0.remaining()) {
            Some(missing) if missing > 0 => Err(DecodeError::Truncated { needed: missing }),
            _ => Ok(()),
        }
    }

    pub(crate) fn u8(&mut self) -> Result<u8, DecodeError> {
        self.need(1)?;
        Ok(self.0.get_u8())
    }

    pub(crate) fn u16(&mut self) -> Result<u16, DecodeError> {
        self.need(2)?;
        Ok(self.0.get_u16())
    }

    pub(crate) fn u32(&mut self) -> Result<u32, DecodeError> {
        self.need(4)?;
        Ok(self.0.get_u32())
    }

    pub(crate) fn i32(&mut self) -> Result<i32, DecodeError> {
        self.need(4)?;
        Ok(self.0.get_i32())
    }

    pub(crate) fn bytes(&mut self, len: usize) -> Result<Bytes, DecodeError> {
        self.need(len)?;
        Ok(self.0.split_to(len))
    }

    fn text(&mut self) -> Result<String, DecodeError> {
        let len = self.u32()? as usize;
        let raw = self.bytes(len)?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    fn pixel_format(&mut self) -> Result<PixelFormat, DecodeError> {
        let format = PixelFormat {
            bits_per_pixel: self.u8()?,
            depth: self.u8()?,
            big_endian: self.u8()? != 0,
            true_colour: self.u8()? != 0,
            red_max: self.u16()?,
            green_max: self.u16()?,
            blue_max: self.u16()?,
            red_shift: self.u8()?,
            green_shift: self.u8()?,
            blue_shift: self.u8()?,
        };
        self.bytes(3)?;
        Ok(format)
    }

    pub(crate) fn finish(self) -> Result<(), DecodeError> {
        match self.0.remaining() {
            0 => Ok(()),
            extra => Err(DecodeError::TrailingBytes(extra)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(reader: &mut FrameReader, bytes: &[u8]) -> Vec<RawFrame> {
        reader
            .push(bytes)
            .into_iter()
            .map(|frame| frame.unwrap())
            .collect()
    }

    #[test]
    fn server_init_survives_byte_by_byte_delivery() {
        let init = ServerMessage::ServerInit(ServerInit {
            width: 640,
            height: 480,
            format: PixelFormat::RGB888,
            name: "desktop".to_string(),
        });
        let encoded = encode_server_message(&init);

        let mut reader = FrameReader::new(1024);
        let mut frames = Vec::new();
        for byte in encoded.iter() {
            frames.extend(read_all(&mut reader, &[*byte]));
        }

        assert_eq!(frames.len(), 1);
        assert_eq!(reader.buffered(), 0);
        assert_eq!(decode_server_message(frames.remove(0)).unwrap(), init);
    }

    #[test]
    fn several_messages_in_one_chunk_keep_order() {
        let mut bytes = BytesMut::new();
        bytes.extend_from_slice(&encode_server_message(&ServerMessage::Bell));
        bytes.extend_from_slice(&encode_server_message(&ServerMessage::Clipboard(
            "copied".to_string(),
        )));
        bytes.extend_from_slice(&encode_server_message(&ServerMessage::Bell));

        let mut reader = FrameReader::new(1024);
        let messages: Vec<ServerMessage> = read_all(&mut reader, &bytes)
            .into_iter()
            .map(|frame| decode_server_message(frame).unwrap())
            .collect();

        assert_eq!(
            messages,
            vec![
                ServerMessage::Bell,
                ServerMessage::Clipboard("copied".to_string()),
                ServerMessage::Bell,
            ]
        );
    }

    #[test]
    fn oversized_frame_is_skipped_across_chunks() {
        let mut reader = FrameReader::new(8);
        let mut big = BytesMut::new();
        big.put_u8(KIND_SERVER_CLIPBOARD);
        big.put_u32(20);
        big.put_bytes(b'x', 12);

        let frames = reader.push(&big);
        assert_eq!(
            frames,
            vec![Err(FrameError::Oversized { len: 20, limit: 8 })]
        );

        let mut rest = BytesMut::new();
        rest.put_bytes(b'x', 8);
        rest.extend_from_slice(&encode_server_message(&ServerMessage::Bell));
        let frames = read_all(&mut reader, &rest);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, KIND_BELL);
    }

    #[test]
    fn truncated_update_payload_is_a_decode_error() {
        let mut payload = BytesMut::new();
        payload.put_u32(1);
        payload.put_u16(1);
        payload.put_u16(0);

        let err = decode_server_message(RawFrame {
            kind: KIND_FRAMEBUFFER_UPDATE,
            payload: payload.freeze(),
        })
        .unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { .. }));
    }

    #[test]
    fn unknown_kind_is_a_decode_error() {
        let err = decode_server_message(RawFrame {
            kind: 0x42,
            payload: Bytes::new(),
        })
        .unwrap_err();
        assert_eq!(err, DecodeError::UnknownKind(0x42));
    }

    #[test]
    fn key_event_layout() {
        let bytes = encode_client_message(&ClientMessage::Key {
            down: true,
            keysym: 0xff0d,
        });
        assert_eq!(&bytes[..], &[KIND_KEY, 0, 0, 0, 7, 1, 0, 0, 0, 0, 0xff, 0x0d]);
    }

    #[test]
    fn pointer_event_decodes() {
        let bytes = encode_client_message(&ClientMessage::Pointer {
            button_mask: 0b101,
            x: 12,
            y: 11,
        });
        let mut reader = FrameReader::new(64);
        let frame = read_all(&mut reader, &bytes).remove(0);
        assert_eq!(
            decode_client_message(frame).unwrap(),
            ClientMessage::Pointer {
                button_mask: 0b101,
                x: 12,
                y: 11,
            }
        );
    }
}
