//! The seam between the runtime and whatever actually carries bytes.
//!
//! The runtime only ever sees a [`ByteStream`] per stream. Production
//! openers live in [`crate::client`]; tests plug in channels.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;

use crate::error::TransportError;

pub type SessionId = String;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextStreamRequest {
    pub session_id: SessionId,
    pub content: String,
    /// Zero for the first request of a turn. Anything higher asks the
    /// backend to resume the same turn after a transport failure.
    pub attempt: u32,
}

#[async_trait]
pub trait TextStreamOpener: Send + Sync {
    async fn open(&self, request: TextStreamRequest) -> Result<ByteStream, TransportError>;
}

/// Both halves of an open display socket. Dropping the channel releases it.
pub struct DisplayChannel {
    pub inbound: ByteStream,
    pub outbound: mpsc::Sender<Bytes>,
}

impl std::fmt::Debug for DisplayChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisplayChannel")
            .field("outbound_closed", &self.outbound.is_closed())
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait DisplaySocketOpener: Send + Sync {
    async fn open(&self, session_id: &SessionId) -> Result<DisplayChannel, TransportError>;
}
