//! Remote display channel: binary framing, rectangle decoding, the local
//! framebuffer and the connection state machine.

mod codec;
mod framebuffer;
mod input;
mod state;
pub mod wire;

pub use codec::{
    DecoderRegistry, ENCODING_RAW, ENCODING_RRE, FramebufferRegion, RawDecoder, RectDecoder,
    RreDecoder,
};
pub use framebuffer::{FrameSnapshot, Framebuffer};
pub use input::{InputIntent, InputQueue, InputTranslator, PointerButton};
pub use state::{ConnectionInfo, DisplayConnection, DisplayEvent, DisplayState};
