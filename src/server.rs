//! Mock backend for local development and end-to-end tests.
//!
//! Chat turns are scripted and the display is a synthetic desktop that
//! paints a gradient once and then moves a tile around.

use crate::display::wire::{
    self, ClientMessage, EncodedRect, FrameReader, PixelFormat, ServerInit, ServerMessage,
};
use crate::protocol::{SendMessageRequest, SessionCreateResponse, StepStatus, StreamEvent};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use uuid::Uuid;

const DESKTOP_WIDTH: u16 = 320;
const DESKTOP_HEIGHT: u16 = 240;
const TILE: u16 = 64;
const MAX_CLIENT_FRAME: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: String,
    /// Pause between two scripted chat events.
    pub event_interval: Duration,
    /// Pause between two framebuffer updates.
    pub frame_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:3001".to_string(),
            event_interval: Duration::from_millis(80),
            frame_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Default)]
struct SessionState {
    turns: u32,
    displays: u32,
}

struct ServerState {
    config: ServerConfig,
    sessions: Mutex<HashMap<String, SessionState>>,
}

type ServerResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

pub async fn run(config: ServerConfig) -> ServerResult<()> {
    let listener = TcpListener::bind(&config.listen).await?;
    serve(listener, config).await
}

pub async fn serve(listener: TcpListener, config: ServerConfig) -> ServerResult<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "mock backend listening");
    axum::serve(listener, router(config)).await?;
    Ok(())
}

pub fn router(config: ServerConfig) -> Router {
    let state = Arc::new(ServerState {
        config,
        sessions: Mutex::new(HashMap::new()),
    });

    Router::new()
        .route("/health", get(health))
        .route("/sessions", post(create_session))
        .route("/sessions/:id/chat", post(chat))
        .route("/sessions/:id/display", get(display))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "healthy"}))
}

async fn create_session(State(state): State<Arc<ServerState>>) -> Json<SessionCreateResponse> {
    let session_id = Uuid::new_v4().to_string();
    state
        .sessions
        .lock()
        .await
        .insert(session_id.clone(), SessionState::default());
    tracing::info!(session_id = %session_id, "session created");
    Json(SessionCreateResponse { session_id })
}

/// Streams a scripted turn. A resumed request only closes the turn, since
/// the client already holds everything sent before the drop.
async fn chat(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
    Json(payload): Json<SendMessageRequest>,
) -> impl IntoResponse {
    let turn = {
        let mut sessions = state.sessions.lock().await;
        let session = sessions.entry(session_id.clone()).or_default();
        session.turns += 1;
        session.turns
    };
    tracing::info!(
        session_id = %session_id,
        turn,
        attempt = payload.attempt,
        "chat request"
    );

    let step_id = format!("turn-{turn}");
    let events = if payload.attempt > 0 {
        vec![step_done(&step_id), StreamEvent::Done]
    } else {
        script(&payload.content, &step_id)
    };

    let interval = state.config.event_interval;
    let stream = futures::stream::iter(events).then(move |event| async move {
        tokio::time::sleep(interval).await;
        Event::default().json_data(&event)
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

fn script(content: &str, step_id: &str) -> Vec<StreamEvent> {
    let title: String = content.chars().take(40).collect();
    let reply = format!("Mock response to: {content}");

    let mut events = vec![
        StreamEvent::Title { content: title },
        StreamEvent::Plan {
            content: "1. Read the message\n2. Answer it".to_string(),
        },
        StreamEvent::Step {
            content: "Answering".to_string(),
            status: StepStatus::Running,
            id: Some(step_id.to_string()),
        },
        StreamEvent::Tool {
            content: "Looked up earlier messages".to_string(),
            tool: "history".to_string(),
            action: "search".to_string(),
        },
    ];
    events.extend(reply.split_inclusive(' ').map(StreamEvent::message));
    events.push(step_done(step_id));
    events.push(StreamEvent::Done);
    events
}

fn step_done(step_id: &str) -> StreamEvent {
    StreamEvent::Step {
        content: "Answering".to_string(),
        status: StepStatus::Completed,
        id: Some(step_id.to_string()),
    }
}

async fn display(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    let displays = {
        let mut sessions = state.sessions.lock().await;
        let session = sessions.entry(session_id.clone()).or_default();
        session.displays += 1;
        session.displays
    };
    tracing::info!(session_id = %session_id, displays, "display requested");
    let interval = state.config.frame_interval;
    upgrade.on_upgrade(move |socket| async move {
        if let Err(err) = play_display(socket, &session_id, interval).await {
            tracing::debug!(session_id = %session_id, error = %err, "display socket ended");
        }
    })
}

async fn play_display(socket: WebSocket, session_id: &str, interval: Duration) -> ServerResult<()> {
    let (mut sender, mut receiver) = socket.split();
    let init = ServerMessage::ServerInit(ServerInit {
        width: DESKTOP_WIDTH,
        height: DESKTOP_HEIGHT,
        format: PixelFormat::RGB888,
        name: format!("tether mock ({session_id})"),
    });
    sender.send(binary(&init)).await?;

    let mut reader = FrameReader::new(MAX_CLIENT_FRAME);
    let mut ticker = tokio::time::interval(interval);
    let mut sequence = 0u32;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sequence += 1;
                sender.send(binary(&frame(sequence))).await?;
                if sequence % 10 == 0 {
                    sender.send(binary(&ServerMessage::Bell)).await?;
                }
            }
            message = receiver.next() => {
                let data = match message {
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => return Err(err.into()),
                };
                for frame in reader.push(&data) {
                    let decoded = frame
                        .map_err(|err| err.to_string())
                        .and_then(|frame| {
                            wire::decode_client_message(frame).map_err(|err| err.to_string())
                        });
                    match decoded {
                        Ok(ClientMessage::Clipboard(text)) => {
                            tracing::info!(session_id, %text, "client clipboard");
                            sender.send(binary(&ServerMessage::Clipboard(text))).await?;
                        }
                        Ok(message) => tracing::debug!(session_id, ?message, "client input"),
                        Err(reason) => tracing::warn!(session_id, %reason, "bad client frame"),
                    }
                }
            }
        }
    }
}

fn binary(message: &ServerMessage) -> Message {
    Message::Binary(wire::encode_server_message(message).to_vec())
}

/// First update paints the whole desktop; later ones move a tile.
fn frame(sequence: u32) -> ServerMessage {
    let rect = if sequence == 1 {
        EncodedRect::raw(0, 0, DESKTOP_WIDTH, DESKTOP_HEIGHT, gradient())
    } else {
        let span_x = u32::from(DESKTOP_WIDTH - TILE);
        let span_y = u32::from(DESKTOP_HEIGHT - TILE);
        let x = (sequence.wrapping_mul(8) % span_x) as u16;
        let y = (sequence.wrapping_mul(4) % span_y) as u16;
        EncodedRect::rre(
            x,
            y,
            TILE,
            TILE,
            &[40, 40, 40, 0],
            &[(&[255, 160, 0, 0][..], TILE / 4, TILE / 4, TILE / 2, TILE / 2)],
        )
    };
    ServerMessage::FramebufferUpdate {
        sequence,
        rects: vec![rect],
    }
}

fn gradient() -> Vec<u8> {
    let len = usize::from(DESKTOP_WIDTH) * usize::from(DESKTOP_HEIGHT) * 4;
    let mut pixels = Vec::with_capacity(len);
    for y in 0..DESKTOP_HEIGHT {
        for x in 0..DESKTOP_WIDTH {
            let blue = (u32::from(x) * 255 / u32::from(DESKTOP_WIDTH)) as u8;
            let green = (u32::from(y) * 255 / u32::from(DESKTOP_HEIGHT)) as u8;
            pixels.extend_from_slice(&[blue, green, 96, 0]);
        }
    }
    pixels
}
