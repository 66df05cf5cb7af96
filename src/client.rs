use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use reqwest::Client as HttpClient;
use reqwest::header::ACCEPT;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::error::TransportError;
use crate::protocol::{SendMessageRequest, SessionCreateResponse};
use crate::transport::{
    ByteStream, DisplayChannel, DisplaySocketOpener, SessionId, TextStreamOpener,
    TextStreamRequest,
};

const OUTBOUND_CAPACITY: usize = 64;

/// Opens agent response streams over HTTP.
#[derive(Debug, Clone)]
pub struct HttpTextStreamOpener {
    base_url: String,
    http: HttpClient,
}

impl HttpTextStreamOpener {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: normalize_base_url(base_url),
            http: HttpClient::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn create_session(&self) -> Result<SessionId, TransportError> {
        let response = self
            .http
            .post(format!("{}/sessions", self.base_url))
            .send()
            .await?;
        let response = check_status(response).await?;
        let body: SessionCreateResponse = response.json().await?;
        Ok(body.session_id)
    }
}

#[async_trait]
impl TextStreamOpener for HttpTextStreamOpener {
    async fn open(&self, request: TextStreamRequest) -> Result<ByteStream, TransportError> {
        let body = SendMessageRequest {
            content: request.content,
            attempt: request.attempt,
        };
        let response = self
            .http
            .post(format!(
                "{}/sessions/{}/chat",
                self.base_url, request.session_id
            ))
            .header(ACCEPT, "text/event-stream")
            .json(&body)
            .send()
            .await?;
        let response = check_status(response).await?;

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(TransportError::from));
        Ok(Box::pin(stream))
    }
}

/// Opens display sockets over websockets. Only binary messages carry
/// display frames.
#[derive(Debug, Clone)]
pub struct WsDisplayOpener {
    base_url: String,
}

impl WsDisplayOpener {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: normalize_base_url(base_url),
        }
    }

    fn display_url(&self, session_id: &str) -> Result<String, TransportError> {
        let base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else if self.base_url.starts_with("ws://") || self.base_url.starts_with("wss://") {
            self.base_url.clone()
        } else {
            return Err(TransportError::Endpoint(self.base_url.clone()));
        };
        Ok(format!("{base}/sessions/{session_id}/display"))
    }
}

#[async_trait]
impl DisplaySocketOpener for WsDisplayOpener {
    async fn open(&self, session_id: &SessionId) -> Result<DisplayChannel, TransportError> {
        let url = self.display_url(session_id)?;
        let (socket, _) = connect_async(url.as_str()).await?;
        let (mut sink, stream) = socket.split();

        let (outbound, mut pending) = mpsc::channel::<Bytes>(OUTBOUND_CAPACITY);
        tokio::spawn(async move {
            while let Some(frame) = pending.recv().await {
                if let Err(err) = sink.send(Message::Binary(frame.to_vec())).await {
                    tracing::debug!(error = %err, "display writer stopped");
                    return;
                }
            }
            // Every sender is gone: the runtime released the channel.
            let _ = sink.close().await;
        });

        let inbound = stream
            .take_while(|message| {
                futures::future::ready(!matches!(message, Ok(Message::Close(_))))
            })
            .filter_map(|message| async move {
                match message {
                    Ok(Message::Binary(data)) => Some(Ok(Bytes::from(data))),
                    Ok(_) => None,
                    Err(err) => Some(Err(TransportError::from(err))),
                }
            });

        Ok(DisplayChannel {
            inbound: Box::pin(inbound),
            outbound,
        })
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(TransportError::Status {
        status: status.as_u16(),
        body,
    })
}

fn normalize_base_url(value: &str) -> String {
    value.trim_end_matches('/').to_string()
}
