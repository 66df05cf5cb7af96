//! Session runtime: owns the text and display streams of every open session
//! and publishes what changes.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Notify, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_util::sync::CancellationToken;

use crate::client::{HttpTextStreamOpener, WsDisplayOpener};
use crate::config::RuntimeConfig;
use crate::display::wire::{self, FrameReader};
use crate::display::{
    ConnectionInfo, DecoderRegistry, DisplayConnection, DisplayEvent, DisplayState, FrameSnapshot,
    InputIntent, InputQueue, InputTranslator,
};
use crate::error::{ConfigError, FrameError, ProtocolError, StreamError, TransportError};
use crate::supervisor::{Lifecycle, Resume, Supervisor};
use crate::text::{SseFrame, SseFrameReader, Transcript, TranscriptChange, decode_frame};
use crate::transport::{
    ByteStream, DisplayChannel, DisplaySocketOpener, SessionId, TextStreamOpener,
    TextStreamRequest,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Text,
    Display,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TextStreamState {
    Idle,
    Connecting,
    Streaming,
    Backoff,
}

/// Everything the UI side can observe. Delivery is best effort: a receiver
/// that falls behind loses the oldest notifications, never state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    TranscriptChanged {
        session_id: SessionId,
        change: TranscriptChange,
    },
    TextStreamState {
        session_id: SessionId,
        state: TextStreamState,
        error: Option<String>,
        instance: u64,
    },
    DisplayStateChanged {
        session_id: SessionId,
        state: DisplayState,
        error: Option<String>,
        instance: u64,
    },
    FramebufferUpdated {
        session_id: SessionId,
        sequence: u32,
        applied: usize,
        dropped: usize,
    },
    RegionDropped {
        session_id: SessionId,
        sequence: u32,
        reason: String,
    },
    UpdateRejected {
        session_id: SessionId,
        reason: String,
    },
    RetryScheduled {
        session_id: SessionId,
        stream: StreamKind,
        attempt: u32,
        delay_ms: Option<u64>,
    },
    Bell {
        session_id: SessionId,
    },
    Clipboard {
        session_id: SessionId,
        text: String,
    },
}

pub type NotificationStream = Pin<Box<dyn Stream<Item = Notification> + Send>>;

#[derive(Debug, Clone, Serialize)]
pub struct DisplayStatus {
    pub state: DisplayState,
    pub last_error: Option<String>,
    pub dimensions: Option<(u16, u16)>,
    pub server_name: Option<String>,
    pub connection: Option<ConnectionInfo>,
    pub instance: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextStatus {
    pub state: TextStreamState,
    pub last_error: Option<String>,
    pub instance: u64,
}

/// Text stream lifecycle plus the error that last sent it into backoff.
#[derive(Debug)]
struct TextSlot {
    lifecycle: Lifecycle<TextStreamState>,
    last_error: Option<String>,
}

impl TextSlot {
    fn status(&self) -> TextStatus {
        TextStatus {
            state: self.lifecycle.state(),
            last_error: self.last_error.clone(),
            instance: self.lifecycle.instance(),
        }
    }
}

/// Display connection plus the lifecycle last published for it.
#[derive(Debug)]
struct DisplaySlot {
    connection: DisplayConnection,
    lifecycle: Lifecycle<DisplayState>,
}

impl DisplaySlot {
    fn status(&self) -> DisplayStatus {
        DisplayStatus {
            state: self.connection.state(),
            last_error: self.connection.last_error().map(str::to_string),
            dimensions: self.connection.dimensions(),
            server_name: self.connection.server_name().map(str::to_string),
            connection: self.connection.info().cloned(),
            instance: self.lifecycle.instance(),
        }
    }
}

struct SessionHandle {
    cancel: CancellationToken,
    transcript: Arc<Mutex<Transcript>>,
    text: Arc<Mutex<TextSlot>>,
    text_task: Option<JoinHandle<()>>,
    display: Arc<Mutex<DisplaySlot>>,
    input: Arc<InputQueue>,
    retry_now: Arc<Notify>,
    display_task: Option<(CancellationToken, JoinHandle<()>)>,
}

impl SessionHandle {
    fn display_running(&self) -> bool {
        self.display_task
            .as_ref()
            .is_some_and(|(_, task)| !task.is_finished())
    }

    fn stop_display(&mut self) {
        if let Some((cancel, task)) = self.display_task.take() {
            cancel.cancel();
            task.abort();
        }
    }
}

struct Inner {
    config: RuntimeConfig,
    text: Arc<dyn TextStreamOpener>,
    display: Arc<dyn DisplaySocketOpener>,
    sessions: Mutex<HashMap<SessionId, SessionHandle>>,
    notifications: broadcast::Sender<Notification>,
}

/// Cheap to clone; all clones drive the same sessions.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

impl Runtime {
    pub fn new(
        config: RuntimeConfig,
        text: Arc<dyn TextStreamOpener>,
        display: Arc<dyn DisplaySocketOpener>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let (notifications, _) = broadcast::channel(config.notification_capacity);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                text,
                display,
                sessions: Mutex::new(HashMap::new()),
                notifications,
            }),
        })
    }

    /// Runtime talking HTTP and websockets to `config.base_url`.
    pub fn connect(config: RuntimeConfig) -> Result<Self, ConfigError> {
        let text = Arc::new(HttpTextStreamOpener::new(&config.base_url));
        let display = Arc::new(WsDisplayOpener::new(&config.base_url));
        Self::new(config, text, display)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Starts the display stream for `session_id`. Opening a session that is
    /// already open does nothing.
    pub fn open_session(&self, session_id: impl Into<SessionId>) {
        let session_id = session_id.into();
        let mut sessions = self.inner.sessions.lock();
        if sessions.contains_key(&session_id) {
            return;
        }

        let input = Arc::new(InputQueue::new());
        let mut handle = SessionHandle {
            cancel: CancellationToken::new(),
            transcript: Arc::new(Mutex::new(Transcript::new(self.inner.config.step_policy))),
            text: Arc::new(Mutex::new(TextSlot {
                lifecycle: Lifecycle::new(TextStreamState::Idle),
                last_error: None,
            })),
            text_task: None,
            display: Arc::new(Mutex::new(DisplaySlot {
                connection: DisplayConnection::new(
                    DecoderRegistry::default(),
                    Arc::clone(&input),
                    self.inner.config.max_display_frame_len,
                ),
                lifecycle: Lifecycle::new(DisplayState::Disconnected),
            })),
            input,
            retry_now: Arc::new(Notify::new()),
            display_task: None,
        };
        self.spawn_display(&session_id, &mut handle);
        sessions.insert(session_id.clone(), handle);
        tracing::info!(session_id = %session_id, "session opened");
    }

    /// Stops both streams and forgets the session. Nothing runs for it once
    /// this returns.
    pub fn close_session(&self, session_id: &str) -> bool {
        let Some(mut handle) = self.inner.sessions.lock().remove(session_id) else {
            return false;
        };
        handle.cancel.cancel();
        handle.stop_display();
        if let Some(task) = handle.text_task.take() {
            task.abort();
        }
        handle.display.lock().connection.disconnect();
        tracing::info!(session_id, "session closed");
        true
    }

    pub fn is_open(&self, session_id: &str) -> bool {
        self.inner.sessions.lock().contains_key(session_id)
    }

    /// Records the user message and streams the response to it. Returns
    /// `false` if the session is not open or a response is still streaming.
    pub fn send_message(&self, session_id: &str, content: impl Into<String>) -> bool {
        let content = content.into();
        let mut sessions = self.inner.sessions.lock();
        let Some(handle) = sessions.get_mut(session_id) else {
            return false;
        };
        if handle.text_task.as_ref().is_some_and(|task| !task.is_finished()) {
            tracing::debug!(session_id, "response already in flight");
            return false;
        }

        let change = handle.transcript.lock().push_user_message(content.clone());
        self.inner.notify(Notification::TranscriptChanged {
            session_id: session_id.to_string(),
            change,
        });

        let task = TextTask {
            inner: Arc::clone(&self.inner),
            session_id: session_id.to_string(),
            content,
            transcript: Arc::clone(&handle.transcript),
            slot: Arc::clone(&handle.text),
            cancel: handle.cancel.child_token(),
        };
        handle.text_task = Some(tokio::spawn(task.run()));
        true
    }

    /// Queues input for the display. Dropped unless the display is connected.
    pub fn submit_input(&self, session_id: &str, intent: InputIntent) -> bool {
        let input = match self.inner.sessions.lock().get(session_id) {
            Some(handle) => Arc::clone(&handle.input),
            None => return false,
        };
        input.submit(intent)
    }

    /// Reconnects a display that is in `Error` or `Disconnected`. Cuts a
    /// pending backoff short, or starts a new display task if the last one
    /// was stopped.
    pub fn retry_display(&self, session_id: &str) -> bool {
        let mut sessions = self.inner.sessions.lock();
        let Some(handle) = sessions.get_mut(session_id) else {
            return false;
        };
        let state = handle.display.lock().connection.state();
        if !matches!(state, DisplayState::Error | DisplayState::Disconnected) {
            return false;
        }

        if handle.display_running() {
            handle.retry_now.notify_one();
        } else {
            self.spawn_display(session_id, handle);
        }
        tracing::info!(session_id, "manual display retry");
        true
    }

    /// Caller-initiated disconnect: no retry follows until
    /// [`retry_display`](Self::retry_display).
    pub fn disconnect_display(&self, session_id: &str) -> bool {
        let mut sessions = self.inner.sessions.lock();
        let Some(handle) = sessions.get_mut(session_id) else {
            return false;
        };
        handle.stop_display();

        let mut slot = handle.display.lock();
        slot.connection.disconnect();
        self.inner.publish_display(session_id, &mut slot);
        true
    }

    pub fn transcript(&self, session_id: &str) -> Option<Transcript> {
        let sessions = self.inner.sessions.lock();
        let handle = sessions.get(session_id)?;
        let transcript = handle.transcript.lock().clone();
        Some(transcript)
    }

    /// State of the response stream, readable whether or not the
    /// notifications for it were seen.
    pub fn text_status(&self, session_id: &str) -> Option<TextStatus> {
        let sessions = self.inner.sessions.lock();
        let handle = sessions.get(session_id)?;
        let status = handle.text.lock().status();
        Some(status)
    }

    pub fn display_status(&self, session_id: &str) -> Option<DisplayStatus> {
        let sessions = self.inner.sessions.lock();
        let handle = sessions.get(session_id)?;
        let status = handle.display.lock().status();
        Some(status)
    }

    /// Latest complete frame, if a handshake ever succeeded.
    pub fn framebuffer(&self, session_id: &str) -> Option<FrameSnapshot> {
        let sessions = self.inner.sessions.lock();
        let handle = sessions.get(session_id)?;
        let snapshot = handle.display.lock().connection.snapshot();
        snapshot
    }

    /// Notifications published from now on. Lagging subscribers skip what
    /// they missed.
    pub fn subscribe(&self) -> NotificationStream {
        let stream = BroadcastStream::new(self.inner.notifications.subscribe()).filter_map(
            |item| async move {
                match item {
                    Ok(notification) => Some(notification),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "notification subscriber lagging");
                        None
                    }
                }
            },
        );
        Box::pin(stream)
    }

    fn spawn_display(&self, session_id: &str, handle: &mut SessionHandle) {
        let cancel = handle.cancel.child_token();
        let task = DisplayTask {
            inner: Arc::clone(&self.inner),
            session_id: session_id.to_string(),
            slot: Arc::clone(&handle.display),
            input: Arc::clone(&handle.input),
            cancel: cancel.clone(),
            retry_now: Arc::clone(&handle.retry_now),
        };
        handle.display_task = Some((cancel, tokio::spawn(task.run())));
    }
}

impl Inner {
    fn notify(&self, notification: Notification) {
        // No subscribers is fine.
        let _ = self.notifications.send(notification);
    }

    fn publish_display(&self, session_id: &str, slot: &mut DisplaySlot) {
        let state = slot.connection.state();
        if let Some(transition) = slot.lifecycle.observe(state) {
            tracing::debug!(
                session_id,
                from = ?transition.from,
                to = ?transition.to,
                instance = transition.instance,
                "display state"
            );
            self.notify(Notification::DisplayStateChanged {
                session_id: session_id.to_string(),
                state,
                error: slot.connection.last_error().map(str::to_string),
                instance: transition.instance,
            });
        }
    }

    fn retry_scheduled(
        &self,
        session_id: &str,
        stream: StreamKind,
        attempt: u32,
        delay: Option<Duration>,
    ) {
        match delay {
            Some(delay) => tracing::info!(session_id, ?stream, attempt, ?delay, "retry scheduled"),
            None => tracing::info!(session_id, ?stream, "waiting for manual retry"),
        }
        self.notify(Notification::RetryScheduled {
            session_id: session_id.to_string(),
            stream,
            attempt,
            delay_ms: delay.map(|delay| u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)),
        });
    }
}

/// Streams one response into the transcript, reconnecting until `done`.
struct TextTask {
    inner: Arc<Inner>,
    session_id: SessionId,
    content: String,
    transcript: Arc<Mutex<Transcript>>,
    slot: Arc<Mutex<TextSlot>>,
    cancel: CancellationToken,
}

impl TextTask {
    async fn run(self) {
        let cancel = self.cancel.clone();
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(session_id = %self.session_id, "text stream cancelled");
            }
            _ = self.supervise() => {}
        }
    }

    async fn supervise(&self) {
        let mut supervisor = Supervisor::new(
            self.inner.config.backoff,
            true,
            self.cancel.clone(),
            Arc::new(Notify::new()),
        );
        let mut attempt = 0;
        loop {
            self.state(TextStreamState::Connecting, None);
            match self.stream_once(attempt, &mut supervisor).await {
                Ok(()) => {
                    self.state(TextStreamState::Idle, None);
                    return;
                }
                Err(err) => {
                    tracing::warn!(session_id = %self.session_id, error = %err, "text stream interrupted");
                    self.state(TextStreamState::Backoff, Some(err.to_string()));
                    let delay = supervisor.schedule();
                    attempt += 1;
                    self.inner
                        .retry_scheduled(&self.session_id, StreamKind::Text, attempt, delay);
                    if supervisor.wait(delay).await == Resume::Cancelled {
                        return;
                    }
                }
            }
        }
    }

    async fn stream_once(
        &self,
        attempt: u32,
        supervisor: &mut Supervisor,
    ) -> Result<(), TransportError> {
        let timeout = self.inner.config.handshake_timeout;
        let deadline = Instant::now() + timeout;
        let request = TextStreamRequest {
            session_id: self.session_id.clone(),
            content: self.content.clone(),
            attempt,
        };

        let mut stream: ByteStream =
            tokio::time::timeout_at(deadline, self.inner.text.open(request))
                .await
                .map_err(|_| TransportError::HandshakeTimeout(timeout))??;
        let first = tokio::time::timeout_at(deadline, stream.next())
            .await
            .map_err(|_| TransportError::HandshakeTimeout(timeout))?;

        self.state(TextStreamState::Streaming, None);
        supervisor.established();

        let mut reader = SseFrameReader::new(self.inner.config.max_text_frame_len);
        let mut next = first;
        loop {
            match next {
                Some(chunk) => {
                    let chunk = chunk?;
                    for frame in reader.push(&chunk) {
                        if self.apply(frame) {
                            return Ok(());
                        }
                    }
                }
                None => {
                    if let Some(frame) = reader.finish() {
                        if self.apply(frame) {
                            return Ok(());
                        }
                    }
                    return Err(TransportError::UnexpectedEof);
                }
            }
            next = stream.next().await;
        }
    }

    /// Folds one frame into the transcript. Returns `true` once the turn is
    /// closed.
    fn apply(&self, frame: Result<SseFrame, FrameError>) -> bool {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(session_id = %self.session_id, error = %err, "dropping text frame");
                return false;
            }
        };

        let change = {
            let mut transcript = self.transcript.lock();
            match decode_frame(&frame) {
                Ok(event) => transcript.apply(event),
                Err(err) => {
                    tracing::warn!(session_id = %self.session_id, error = %err, "undecodable stream event");
                    transcript.apply_decode_error(&err)
                }
            }
        };
        let closed = change == TranscriptChange::TurnClosed;
        self.inner.notify(Notification::TranscriptChanged {
            session_id: self.session_id.clone(),
            change,
        });
        closed
    }

    fn state(&self, state: TextStreamState, error: Option<String>) {
        let mut slot = self.slot.lock();
        match state {
            TextStreamState::Connecting => {
                slot.lifecycle.begin_attempt();
            }
            TextStreamState::Streaming => slot.last_error = None,
            TextStreamState::Backoff => slot.last_error = error,
            TextStreamState::Idle => {}
        }
        let Some(transition) = slot.lifecycle.observe(state) else {
            return;
        };
        tracing::debug!(
            session_id = %self.session_id,
            from = ?transition.from,
            to = ?transition.to,
            instance = transition.instance,
            "text stream state"
        );
        self.inner.notify(Notification::TextStreamState {
            session_id: self.session_id.clone(),
            state,
            error: slot.last_error.clone(),
            instance: transition.instance,
        });
    }
}

/// Keeps one session's display connected until cancelled.
struct DisplayTask {
    inner: Arc<Inner>,
    session_id: SessionId,
    slot: Arc<Mutex<DisplaySlot>>,
    input: Arc<InputQueue>,
    cancel: CancellationToken,
    retry_now: Arc<Notify>,
}

impl DisplayTask {
    async fn run(self) {
        let cancel = self.cancel.clone();
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(session_id = %self.session_id, "display task cancelled");
            }
            _ = self.supervise() => {}
        }
    }

    async fn supervise(&self) {
        let config = &self.inner.config;
        let mut supervisor = Supervisor::new(
            config.backoff,
            config.auto_retry,
            self.cancel.clone(),
            Arc::clone(&self.retry_now),
        );

        loop {
            let started = self.update(|slot| {
                let started = slot.connection.connect();
                if started {
                    slot.lifecycle.begin_attempt();
                }
                started
            });
            if started != Some(true) {
                return;
            }

            let result = self.connect_once(&mut supervisor).await;
            self.update(|slot| match result {
                Ok(()) => slot.connection.connection_lost(),
                Err(err) => {
                    tracing::warn!(session_id = %self.session_id, error = %err, "display connection failed");
                    slot.connection.fail(err);
                }
            });

            let delay = supervisor.schedule();
            self.inner.retry_scheduled(
                &self.session_id,
                StreamKind::Display,
                supervisor.attempt(),
                delay,
            );
            if supervisor.wait(delay).await == Resume::Cancelled {
                return;
            }
        }
    }

    /// One connection attempt. `Ok` means the server closed the socket.
    async fn connect_once(&self, supervisor: &mut Supervisor) -> Result<(), StreamError> {
        let timeout = self.inner.config.handshake_timeout;
        let deadline = Instant::now() + timeout;

        let DisplayChannel {
            mut inbound,
            outbound,
        } = tokio::time::timeout_at(deadline, self.inner.display.open(&self.session_id))
            .await
            .map_err(|_| TransportError::HandshakeTimeout(timeout))??;

        let mut reader = FrameReader::new(self.inner.config.max_display_frame_len);
        let mut translator = InputTranslator::new();
        let handshake = tokio::time::sleep_until(deadline);
        tokio::pin!(handshake);
        let mut connected = false;

        loop {
            tokio::select! {
                _ = &mut handshake, if !connected => {
                    return Err(TransportError::HandshakeTimeout(timeout).into());
                }
                chunk = inbound.next() => {
                    let Some(chunk) = chunk else {
                        return Ok(());
                    };
                    self.process(&mut reader, &chunk?)?;
                    if !connected && self.state() == Some(DisplayState::Connected) {
                        connected = true;
                        supervisor.established();
                    }
                }
                _ = self.input.ready(), if connected => {
                    self.flush(&mut translator, &outbound).await?;
                }
            }
        }
    }

    fn process(&self, reader: &mut FrameReader, chunk: &[u8]) -> Result<(), ProtocolError> {
        for frame in reader.push(chunk) {
            let frame = match frame {
                Ok(frame) => frame,
                Err(err) => {
                    tracing::warn!(session_id = %self.session_id, error = %err, "skipping display frame");
                    continue;
                }
            };
            let kind = frame.kind;
            let message = match wire::decode_server_message(frame) {
                Ok(message) => message,
                Err(err)
                    if kind == wire::KIND_SERVER_INIT
                        && self.state() == Some(DisplayState::Connecting) =>
                {
                    return Err(ProtocolError::Handshake(format!("bad server-init: {err}")));
                }
                Err(err) => {
                    tracing::warn!(session_id = %self.session_id, error = %err, "undecodable display message");
                    continue;
                }
            };

            let events = self
                .update(|slot| slot.connection.handle(message))
                .unwrap_or(Ok(Vec::new()))?;
            for event in events {
                self.publish(event);
            }
        }
        Ok(())
    }

    async fn flush(
        &self,
        translator: &mut InputTranslator,
        outbound: &mpsc::Sender<bytes::Bytes>,
    ) -> Result<(), TransportError> {
        for intent in self.input.drain() {
            for message in translator.translate(intent) {
                outbound
                    .send(wire::encode_client_message(&message))
                    .await
                    .map_err(|_| TransportError::Closed)?;
            }
        }
        Ok(())
    }

    fn publish(&self, event: DisplayEvent) {
        let session_id = self.session_id.clone();
        let notification = match event {
            // The state change itself is published by `update`.
            DisplayEvent::Connected { .. } => return,
            DisplayEvent::FramebufferUpdated {
                sequence,
                applied,
                dropped,
            } => Notification::FramebufferUpdated {
                session_id,
                sequence,
                applied,
                dropped,
            },
            DisplayEvent::RegionDropped { sequence, reason } => Notification::RegionDropped {
                session_id,
                sequence,
                reason,
            },
            DisplayEvent::UpdateRejected(err) => Notification::UpdateRejected {
                session_id,
                reason: err.to_string(),
            },
            DisplayEvent::Bell => Notification::Bell { session_id },
            DisplayEvent::Clipboard(text) => Notification::Clipboard { session_id, text },
        };
        self.inner.notify(notification);
    }

    fn state(&self) -> Option<DisplayState> {
        self.update(|slot| slot.connection.state())
    }

    /// Runs `f` against the slot and publishes any resulting transition.
    /// Does nothing once the task was cancelled, so a disconnect that raced
    /// with an in-flight message always wins.
    fn update<T>(&self, f: impl FnOnce(&mut DisplaySlot) -> T) -> Option<T> {
        let mut slot = self.slot.lock();
        if self.cancel.is_cancelled() {
            return None;
        }
        let out = f(&mut slot);
        self.inner.publish_display(&self.session_id, &mut slot);
        Some(out)
    }
}
