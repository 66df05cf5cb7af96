use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::codec::DecoderRegistry;
use super::framebuffer::{FrameSnapshot, Framebuffer};
use super::input::InputQueue;
use super::wire::{EncodedRect, ServerInit, ServerMessage};
use crate::error::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// What changed after one inbound message was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayEvent {
    Connected {
        width: u16,
        height: u16,
        name: String,
    },
    FramebufferUpdated {
        sequence: u32,
        applied: usize,
        dropped: usize,
    },
    RegionDropped {
        sequence: u32,
        reason: String,
    },
    UpdateRejected(ProtocolError),
    Bell,
    Clipboard(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub connected_at: DateTime<Utc>,
    pub messages: u64,
}

/// Display-side state for one session: connection state, the framebuffer
/// and the gate on pending input.
///
/// Only the display task mutates this; readers take [`FrameSnapshot`]s.
#[derive(Debug)]
pub struct DisplayConnection {
    state: DisplayState,
    last_error: Option<String>,
    framebuffer: Option<Framebuffer>,
    server_name: Option<String>,
    last_sequence: Option<u32>,
    info: Option<ConnectionInfo>,
    decoders: DecoderRegistry,
    input: Arc<InputQueue>,
    max_framebuffer_len: usize,
}

impl DisplayConnection {
    /// `max_framebuffer_len` bounds the pixel bytes a server-init may ask
    /// this side to allocate.
    pub fn new(
        decoders: DecoderRegistry,
        input: Arc<InputQueue>,
        max_framebuffer_len: usize,
    ) -> Self {
        Self {
            state: DisplayState::Disconnected,
            last_error: None,
            framebuffer: None,
            server_name: None,
            last_sequence: None,
            info: None,
            decoders,
            input,
            max_framebuffer_len,
        }
    }

    pub fn state(&self) -> DisplayState {
        self.state
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn dimensions(&self) -> Option<(u16, u16)> {
        self.framebuffer
            .as_ref()
            .map(|framebuffer| (framebuffer.width(), framebuffer.height()))
    }

    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    pub fn info(&self) -> Option<&ConnectionInfo> {
        self.info.as_ref()
    }

    pub fn snapshot(&self) -> Option<FrameSnapshot> {
        self.framebuffer.as_ref().map(Framebuffer::snapshot)
    }

    pub fn input(&self) -> &Arc<InputQueue> {
        &self.input
    }

    /// `Disconnected | Error -> Connecting`. Any other state is left alone
    /// and `false` is returned.
    pub fn connect(&mut self) -> bool {
        match self.state {
            DisplayState::Disconnected | DisplayState::Error => {
                self.state = DisplayState::Connecting;
                true
            }
            DisplayState::Connecting | DisplayState::Connected => false,
        }
    }

    /// Applies one inbound message.
    ///
    /// An `Err` means the attempt cannot continue (bad handshake) and the
    /// caller should [`fail`](Self::fail) the connection. Region and ordering
    /// problems are reported as events and the connection stays up.
    pub fn handle(&mut self, message: ServerMessage) -> Result<Vec<DisplayEvent>, ProtocolError> {
        if let Some(info) = self.info.as_mut() {
            info.messages += 1;
        }

        match (self.state, message) {
            (DisplayState::Connecting, ServerMessage::ServerInit(init)) => {
                let event = self.initialise(init)?;
                self.state = DisplayState::Connected;
                self.last_error = None;
                self.info = Some(ConnectionInfo {
                    connected_at: Utc::now(),
                    messages: 1,
                });
                self.input.open();
                Ok(vec![event])
            }
            (DisplayState::Connecting, other) => Err(ProtocolError::Handshake(format!(
                "expected server-init, got {}",
                message_name(&other)
            ))),
            (DisplayState::Connected, ServerMessage::ServerInit(init)) => {
                // Re-initialisation mid-session resizes the desktop.
                Ok(vec![self.initialise(init)?])
            }
            (DisplayState::Connected, ServerMessage::FramebufferUpdate { sequence, rects }) => {
                Ok(self.apply_update(sequence, rects))
            }
            (DisplayState::Connected, ServerMessage::Bell) => Ok(vec![DisplayEvent::Bell]),
            (DisplayState::Connected, ServerMessage::Clipboard(text)) => {
                Ok(vec![DisplayEvent::Clipboard(text)])
            }
            (DisplayState::Disconnected | DisplayState::Error, message) => {
                tracing::debug!(kind = message_name(&message), "ignoring message while not connected");
                Ok(Vec::new())
            }
        }
    }

    /// The socket closed without the caller asking. A connection that never
    /// finished its handshake counts as failed.
    pub fn connection_lost(&mut self) {
        match self.state {
            DisplayState::Connected => self.enter(DisplayState::Disconnected),
            DisplayState::Connecting => {
                self.fail("connection closed during handshake");
            }
            DisplayState::Disconnected | DisplayState::Error => {}
        }
    }

    /// Fatal error for the current attempt. The last frame stays visible.
    pub fn fail(&mut self, error: impl ToString) {
        self.last_error = Some(error.to_string());
        self.enter(DisplayState::Error);
    }

    /// Caller-initiated disconnect, valid from any state.
    pub fn disconnect(&mut self) {
        self.enter(DisplayState::Disconnected);
    }

    fn enter(&mut self, state: DisplayState) {
        self.state = state;
        self.info = None;
        self.input.close();
    }

    fn initialise(&mut self, init: ServerInit) -> Result<DisplayEvent, ProtocolError> {
        if init.width == 0 || init.height == 0 {
            return Err(ProtocolError::Handshake(format!(
                "invalid dimensions {}x{}",
                init.width, init.height
            )));
        }
        if !init.format.is_supported() {
            return Err(ProtocolError::Handshake(format!(
                "unsupported pixel format ({} bpp, true colour: {})",
                init.format.bits_per_pixel, init.format.true_colour
            )));
        }

        let len = Framebuffer::byte_len(init.width, init.height, &init.format);
        if len > self.max_framebuffer_len {
            return Err(ProtocolError::Handshake(format!(
                "{}x{} framebuffer needs {len} bytes, limit is {}",
                init.width, init.height, self.max_framebuffer_len
            )));
        }

        self.framebuffer = Some(Framebuffer::new(init.width, init.height, init.format));
        self.last_sequence = None;
        self.server_name = Some(init.name.clone());
        Ok(DisplayEvent::Connected {
            width: init.width,
            height: init.height,
            name: init.name,
        })
    }

    fn apply_update(
        &mut self,
        sequence: u32,
        rects: Vec<EncodedRect>,
    ) -> Vec<DisplayEvent> {
        if let Some(last) = self.last_sequence {
            if sequence <= last {
                let error = ProtocolError::OutOfOrder {
                    last,
                    got: sequence,
                };
                tracing::warn!(%error, "rejecting framebuffer update");
                return vec![DisplayEvent::UpdateRejected(error)];
            }
        }
        self.last_sequence = Some(sequence);

        let Some(framebuffer) = self.framebuffer.as_mut() else {
            return Vec::new();
        };
        let format = *framebuffer.format();

        let mut events = Vec::new();
        let mut applied = 0;
        for rect in rects {
            // Bounds first: decoders size their output from the declared rectangle.
            let result = framebuffer
                .check_bounds(rect.x, rect.y, rect.width, rect.height)
                .map_err(|err| err.to_string())
                .and_then(|()| {
                    self.decoders
                        .decode(&rect, &format)
                        .map_err(|err| err.to_string())
                })
                .and_then(|region| framebuffer.apply(&region).map_err(|err| err.to_string()));
            match result {
                Ok(()) => applied += 1,
                Err(reason) => {
                    tracing::warn!(sequence, x = rect.x, y = rect.y, %reason, "dropping region");
                    events.push(DisplayEvent::RegionDropped { sequence, reason });
                }
            }
        }

        let dropped = events.len();
        events.insert(
            0,
            DisplayEvent::FramebufferUpdated {
                sequence,
                applied,
                dropped,
            },
        );
        events
    }
}

fn message_name(message: &ServerMessage) -> &'static str {
    match message {
        ServerMessage::ServerInit(_) => "server-init",
        ServerMessage::FramebufferUpdate { .. } => "framebuffer-update",
        ServerMessage::Bell => "bell",
        ServerMessage::Clipboard(_) => "clipboard",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::display::codec::{ENCODING_RRE, FramebufferRegion, RectDecoder, RreDecoder};
    use crate::display::input::InputIntent;
    use crate::display::wire::PixelFormat;
    use crate::error::DecodeError;

    const LIMIT: usize = 32 * 1024 * 1024;

    fn connection() -> DisplayConnection {
        DisplayConnection::new(DecoderRegistry::default(), Arc::new(InputQueue::new()), LIMIT)
    }

    /// RRE decoder that counts how often it runs.
    struct CountingRre(Arc<AtomicUsize>);

    impl RectDecoder for CountingRre {
        fn encoding(&self) -> i32 {
            ENCODING_RRE
        }

        fn decode(
            &self,
            rect: &EncodedRect,
            format: &PixelFormat,
        ) -> Result<FramebufferRegion, DecodeError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            RreDecoder.decode(rect, format)
        }
    }

    fn init(width: u16, height: u16) -> ServerMessage {
        ServerMessage::ServerInit(ServerInit {
            width,
            height,
            format: PixelFormat::RGB888,
            name: "desk".to_string(),
        })
    }

    fn update(sequence: u32, rects: Vec<EncodedRect>) -> ServerMessage {
        ServerMessage::FramebufferUpdate { sequence, rects }
    }

    fn connected(width: u16, height: u16) -> DisplayConnection {
        let mut connection = connection();
        assert!(connection.connect());
        connection.handle(init(width, height)).unwrap();
        connection
    }

    #[test]
    fn handshake_connects_and_allocates_buffer() {
        let mut connection = connection();
        assert!(connection.connect());
        assert_eq!(connection.state(), DisplayState::Connecting);

        let events = connection.handle(init(640, 480)).unwrap();

        assert_eq!(connection.state(), DisplayState::Connected);
        assert_eq!(connection.dimensions(), Some((640, 480)));
        assert_eq!(
            events,
            vec![DisplayEvent::Connected {
                width: 640,
                height: 480,
                name: "desk".to_string(),
            }]
        );
        assert!(connection.input().is_accepting());
        assert_eq!(connection.snapshot().unwrap().pixels().len(), 640 * 480 * 4);
    }

    #[test]
    fn connect_is_only_valid_from_disconnected_or_error() {
        let mut connection = connected(4, 4);
        assert!(!connection.connect());
        assert_eq!(connection.state(), DisplayState::Connected);

        connection.fail("boom");
        assert!(connection.connect());
        assert!(!connection.connect());
    }

    #[test]
    fn bad_handshake_is_fatal_to_the_attempt() {
        let mut connection = connection();
        connection.connect();
        let err = connection.handle(init(0, 480)).unwrap_err();
        assert!(matches!(err, ProtocolError::Handshake(_)));

        let mut connection = self::connection();
        connection.connect();
        assert!(connection.handle(ServerMessage::Bell).is_err());
    }

    #[test]
    fn full_frame_then_close_retains_last_frame() {
        let mut connection = connected(640, 480);
        let pixels = vec![0xab; 640 * 480 * 4];
        connection
            .handle(update(1, vec![EncodedRect::raw(0, 0, 640, 480, pixels)]))
            .unwrap();

        connection.connection_lost();

        assert_eq!(connection.state(), DisplayState::Disconnected);
        let snapshot = connection.snapshot().unwrap();
        assert_eq!(snapshot.pixel(639, 479), Some(&[0xab; 4][..]));
        assert!(!connection.input().is_accepting());
    }

    #[test]
    fn out_of_bounds_region_is_dropped_and_connection_stays_up() {
        let mut connection = connected(4, 4);
        let events = connection
            .handle(update(
                1,
                vec![
                    EncodedRect::raw(0, 0, 1, 1, vec![1; 4]),
                    EncodedRect::raw(3, 3, 2, 2, vec![2; 16]),
                    EncodedRect::raw(1, 0, 1, 1, vec![3; 4]),
                ],
            ))
            .unwrap();

        assert_eq!(connection.state(), DisplayState::Connected);
        assert!(matches!(
            events[0],
            DisplayEvent::FramebufferUpdated {
                sequence: 1,
                applied: 2,
                dropped: 1,
            }
        ));
        assert!(matches!(events[1], DisplayEvent::RegionDropped { sequence: 1, .. }));
        let snapshot = connection.snapshot().unwrap();
        assert_eq!(snapshot.pixel(0, 0), Some(&[1; 4][..]));
        assert_eq!(snapshot.pixel(1, 0), Some(&[3; 4][..]));
        assert_eq!(snapshot.pixel(3, 3), Some(&[0; 4][..]));
    }

    #[test]
    fn oversized_region_is_dropped_before_decoding() {
        let decoded = Arc::new(AtomicUsize::new(0));
        let mut decoders = DecoderRegistry::default();
        decoders.register(Box::new(CountingRre(Arc::clone(&decoded))));
        let mut connection =
            DisplayConnection::new(decoders, Arc::new(InputQueue::new()), LIMIT);
        connection.connect();
        connection.handle(init(4, 4)).unwrap();

        let events = connection
            .handle(update(
                1,
                vec![
                    EncodedRect::rre(0, 0, u16::MAX, u16::MAX, &[1, 2, 3, 4], &[]),
                    EncodedRect::rre(0, 0, 2, 2, &[9, 9, 9, 9], &[]),
                ],
            ))
            .unwrap();

        assert_eq!(connection.state(), DisplayState::Connected);
        assert_eq!(decoded.load(Ordering::SeqCst), 1);
        assert!(matches!(
            events[0],
            DisplayEvent::FramebufferUpdated { applied: 1, dropped: 1, .. }
        ));
        let DisplayEvent::RegionDropped { reason, .. } = &events[1] else {
            panic!("expected a dropped region, got {:?}", events[1]);
        };
        assert!(reason.contains("exceeds framebuffer 4x4"), "{reason}");
        assert_eq!(connection.snapshot().unwrap().pixel(1, 1), Some(&[9; 4][..]));
    }

    #[test]
    fn server_init_above_size_limit_is_fatal() {
        let mut connection =
            DisplayConnection::new(DecoderRegistry::default(), Arc::new(InputQueue::new()), 1024);
        connection.connect();

        let err = connection.handle(init(u16::MAX, u16::MAX)).unwrap_err();
        assert!(matches!(err, ProtocolError::Handshake(_)));
        assert_eq!(connection.dimensions(), None);

        // 16x16 at four bytes per pixel fills the limit exactly.
        connection.handle(init(16, 16)).unwrap();
        assert_eq!(connection.state(), DisplayState::Connected);
    }

    #[test]
    fn stale_sequence_is_rejected_without_applying() {
        let mut connection = connected(2, 2);
        connection
            .handle(update(5, vec![EncodedRect::raw(0, 0, 1, 1, vec![5; 4])]))
            .unwrap();
        let events = connection
            .handle(update(4, vec![EncodedRect::raw(0, 0, 1, 1, vec![4; 4])]))
            .unwrap();

        assert_eq!(
            events,
            vec![DisplayEvent::UpdateRejected(ProtocolError::OutOfOrder {
                last: 5,
                got: 4,
            })]
        );
        assert_eq!(connection.snapshot().unwrap().pixel(0, 0), Some(&[5; 4][..]));
    }

    #[test]
    fn sequence_resets_on_new_handshake() {
        let mut connection = connected(2, 2);
        connection.handle(update(9, Vec::new())).unwrap();
        connection.connection_lost();
        connection.connect();
        connection.handle(init(2, 2)).unwrap();

        let events = connection.handle(update(1, Vec::new())).unwrap();
        assert!(matches!(events[0], DisplayEvent::FramebufferUpdated { sequence: 1, .. }));
    }

    #[test]
    fn unsupported_encoding_drops_only_that_region() {
        let mut connection = connected(2, 2);
        let mut odd = EncodedRect::raw(0, 0, 1, 1, vec![7; 4]);
        odd.encoding = 99;
        let events = connection
            .handle(update(1, vec![odd, EncodedRect::raw(1, 1, 1, 1, vec![8; 4])]))
            .unwrap();

        assert!(matches!(
            events[0],
            DisplayEvent::FramebufferUpdated { applied: 1, dropped: 1, .. }
        ));
        assert_eq!(connection.snapshot().unwrap().pixel(1, 1), Some(&[8; 4][..]));
    }

    #[test]
    fn disconnect_from_any_state_drops_pending_input() {
        let mut connection = connected(2, 2);
        connection
            .input()
            .submit(InputIntent::Key { code: 1, down: true });
        connection.disconnect();

        assert_eq!(connection.state(), DisplayState::Disconnected);
        assert!(connection.input().is_empty());
        assert!(!connection
            .input()
            .submit(InputIntent::PointerMove { x: 1, y: 1 }));

        let mut connecting = self::connection();
        connecting.connect();
        connecting.disconnect();
        assert_eq!(connecting.state(), DisplayState::Disconnected);
    }

    #[test]
    fn close_during_handshake_is_an_error() {
        let mut connection = connection();
        connection.connect();
        connection.connection_lost();
        assert_eq!(connection.state(), DisplayState::Error);
        assert!(connection.last_error().is_some());
    }

    #[test]
    fn counts_inbound_messages_for_live_connection() {
        let mut connection = connected(2, 2);
        connection.handle(ServerMessage::Bell).unwrap();
        connection.handle(ServerMessage::Bell).unwrap();
        assert_eq!(connection.info().unwrap().messages, 3);
    }
}
