use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use super::wire::ClientMessage;

/// Wheel notches encoded per scroll intent at most.
const MAX_SCROLL_STEPS: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointerButton {
    Left,
    Middle,
    Right,
}

impl PointerButton {
    fn mask(self) -> u8 {
        match self {
            PointerButton::Left => 1,
            PointerButton::Middle => 1 << 1,
            PointerButton::Right => 1 << 2,
        }
    }
}

/// A local action to forward to the remote display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputIntent {
    PointerMove {
        x: u16,
        y: u16,
    },
    PointerButton {
        x: u16,
        y: u16,
        button: PointerButton,
        down: bool,
    },
    Key {
        code: u32,
        down: bool,
    },
    Scroll {
        dx: i32,
        dy: i32,
    },
    Clipboard {
        text: String,
    },
}

#[derive(Debug, Default)]
struct QueueState {
    accepting: bool,
    pending: VecDeque<InputIntent>,
}

/// Pending input shared between the caller and the display task.
///
/// Intents are only accepted while the display is connected. A pointer move
/// replaces a pointer move still waiting at the back of the queue; every
/// other intent is kept in submission order.
#[derive(Debug, Default)]
pub struct InputQueue {
    state: Mutex<QueueState>,
    ready: Notify,
}

impl InputQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the intent was dropped because the display is
    /// not connected.
    pub fn submit(&self, intent: InputIntent) -> bool {
        {
            let mut state = self.state.lock();
            if !state.accepting {
                return false;
            }
            if matches!(intent, InputIntent::PointerMove { .. })
                && matches!(state.pending.back(), Some(InputIntent::PointerMove { .. }))
            {
                state.pending.pop_back();
            }
            state.pending.push_back(intent);
        }
        self.ready.notify_one();
        true
    }

    pub fn open(&self) {
        self.state.lock().accepting = true;
    }

    /// Stops accepting input and drops anything not yet flushed.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.accepting = false;
        state.pending.clear();
    }

    pub fn is_accepting(&self) -> bool {
        self.state.lock().accepting
    }

    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn drain(&self) -> Vec<InputIntent> {
        self.state.lock().pending.drain(..).collect()
    }

    /// Resolves once something was submitted since the last wake-up.
    pub async fn ready(&self) {
        self.ready.notified().await;
    }
}

/// Turns intents into wire messages, tracking the button mask and the last
/// pointer position the remote side has seen.
#[derive(Debug, Default)]
pub struct InputTranslator {
    button_mask: u8,
    x: u16,
    y: u16,
}

impl InputTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn translate(&mut self, intent: InputIntent) -> Vec<ClientMessage> {
        match intent {
            InputIntent::PointerMove { x, y } => {
                self.x = x;
                self.y = y;
                vec![self.pointer(self.button_mask)]
            }
            InputIntent::PointerButton { x, y, button, down } => {
                self.x = x;
                self.y = y;
                if down {
                    self.button_mask |= button.mask();
                } else {
                    self.button_mask &= !button.mask();
                }
                vec![self.pointer(self.button_mask)]
            }
            InputIntent::Key { code, down } => vec![ClientMessage::Key { down, keysym: code }],
            InputIntent::Scroll { dx, dy } => {
                let mut messages = Vec::new();
                // Wheel buttons 4/5 scroll up/down, 6/7 left/right.
                self.wheel(&mut messages, dy, 1 << 3, 1 << 4);
                self.wheel(&mut messages, dx, 1 << 5, 1 << 6);
                messages
            }
            InputIntent::Clipboard { text } => vec![ClientMessage::Clipboard(text)],
        }
    }

    fn wheel(&self, messages: &mut Vec<ClientMessage>, delta: i32, negative: u8, positive: u8) {
        let bit = if delta < 0 { negative } else { positive };
        for _ in 0..delta.unsigned_abs().min(MAX_SCROLL_STEPS) {
            messages.push(self.pointer(self.button_mask | bit));
            messages.push(self.pointer(self.button_mask));
        }
    }

    fn pointer(&self, button_mask: u8) -> ClientMessage {
        ClientMessage::Pointer {
            button_mask,
            x: self.x,
            y: self.y,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn moved(x: u16, y: u16) -> InputIntent {
        InputIntent::PointerMove { x, y }
    }

    fn key(code: u32, down: bool) -> InputIntent {
        InputIntent::Key { code, down }
    }

    #[test]
    fn rejects_input_while_not_accepting() {
        let queue = InputQueue::new();
        assert!(!queue.submit(moved(1, 1)));
        assert!(queue.is_empty());
    }

    #[test]
    fn consecutive_moves_coalesce_to_latest() {
        let queue = InputQueue::new();
        queue.open();
        assert!(queue.submit(moved(10, 10)));
        assert!(queue.submit(moved(12, 11)));
        assert_eq!(queue.drain(), vec![moved(12, 11)]);
    }

    #[test]
    fn other_intents_keep_order_and_are_never_coalesced() {
        let queue = InputQueue::new();
        queue.open();
        queue.submit(key(0x61, true));
        queue.submit(key(0x61, true));
        queue.submit(moved(1, 1));
        queue.submit(key(0x61, false));
        queue.submit(moved(2, 2));
        queue.submit(moved(3, 3));

        assert_eq!(
            queue.drain(),
            vec![
                key(0x61, true),
                key(0x61, true),
                moved(1, 1),
                key(0x61, false),
                moved(3, 3),
            ]
        );
    }

    #[test]
    fn close_drops_pending_input() {
        let queue = InputQueue::new();
        queue.open();
        queue.submit(key(1, true));
        queue.close();
        assert!(queue.is_empty());
        assert!(!queue.is_accepting());
    }

    #[tokio::test]
    async fn submit_wakes_waiting_flusher() {
        let queue = std::sync::Arc::new(InputQueue::new());
        queue.open();
        let waiter = {
            let queue = std::sync::Arc::clone(&queue);
            tokio::spawn(async move {
                queue.ready().await;
                queue.drain()
            })
        };
        queue.submit(moved(5, 5));
        assert_eq!(waiter.await.unwrap(), vec![moved(5, 5)]);
    }

    #[test]
    fn button_mask_accumulates_and_releases() {
        let mut translator = InputTranslator::new();
        let press = translator.translate(InputIntent::PointerButton {
            x: 4,
            y: 5,
            button: PointerButton::Left,
            down: true,
        });
        let drag = translator.translate(moved(6, 7));
        let release = translator.translate(InputIntent::PointerButton {
            x: 6,
            y: 7,
            button: PointerButton::Left,
            down: false,
        });

        assert_eq!(
            [press, drag, release].concat(),
            vec![
                ClientMessage::Pointer { button_mask: 1, x: 4, y: 5 },
                ClientMessage::Pointer { button_mask: 1, x: 6, y: 7 },
                ClientMessage::Pointer { button_mask: 0, x: 6, y: 7 },
            ]
        );
    }

    #[test]
    fn scroll_emits_press_release_pairs_at_pointer() {
        let mut translator = InputTranslator::new();
        translator.translate(moved(3, 3));
        let messages = translator.translate(InputIntent::Scroll { dx: 0, dy: -2 });

        let up = ClientMessage::Pointer { button_mask: 1 << 3, x: 3, y: 3 };
        let idle = ClientMessage::Pointer { button_mask: 0, x: 3, y: 3 };
        assert_eq!(messages, vec![up.clone(), idle.clone(), up, idle]);
    }

    #[test]
    fn huge_scroll_is_capped() {
        let mut translator = InputTranslator::new();
        let messages = translator.translate(InputIntent::Scroll { dx: 1000, dy: 0 });
        assert_eq!(messages.len(), 2 * MAX_SCROLL_STEPS as usize);
    }
}
