use std::time::Duration;

use thiserror::Error;

/// Connection-level failures. Always retryable by the supervisor.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("no initial frame within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("stream ended before the exchange completed")]
    UnexpectedEof,
    #[error("channel closed")]
    Closed,
    #[error("invalid endpoint: {0}")]
    Endpoint(String),
}

/// A frame boundary could not be established; the frame is discarded.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("record is not valid utf-8")]
    InvalidUtf8,
    #[error("frame of {len} bytes exceeds limit of {limit}")]
    Oversized { len: usize, limit: usize },
}

/// The frame was well delimited but its payload is not a known event.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed event payload: {0}")]
    Malformed(String),
    #[error("event payload has no type")]
    MissingType,
    #[error("unknown event type `{0}`")]
    UnknownType(String),
    #[error("invalid `{kind}` event: {reason}")]
    InvalidEvent { kind: String, reason: String },
    #[error("unknown message kind {0:#04x}")]
    UnknownKind(u8),
    #[error("payload truncated: needed {needed} more bytes")]
    Truncated { needed: usize },
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
    #[error("unsupported rectangle encoding {0}")]
    UnsupportedEncoding(i32),
    #[error("subrectangle exceeds its {w}x{h} rectangle")]
    SubrectOutOfBounds { w: u16, h: u16 },
}

/// Structurally invalid sequence on the display channel.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("region {w}x{h}+{x}+{y} exceeds framebuffer {width}x{height}")]
    RegionOutOfBounds {
        x: u16,
        y: u16,
        w: u16,
        h: u16,
        width: u16,
        height: u16,
    },
    #[error("region carries {actual} pixel bytes, expected {expected}")]
    PixelPayload { expected: usize, actual: usize },
    #[error("update {got} arrived after update {last}")]
    OutOfOrder { last: u32, got: u32 },
    #[error("handshake failed: {0}")]
    Handshake(String),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("backoff multiplier must be at least 1.0, got {0}")]
    Multiplier(f64),
    #[error("backoff base delay must be non-zero")]
    ZeroBaseDelay,
    #[error("backoff max delay {max:?} is below base delay {base:?}")]
    MaxBelowBase { base: Duration, max: Duration },
    #[error("`{0}` must be non-zero")]
    Zero(&'static str),
}

/// Why one connection attempt ended. Every variant is retryable.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
