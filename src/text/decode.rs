use serde_json::Value;

use super::sse::SseFrame;
use crate::error::DecodeError;
use crate::protocol::StreamEvent;

/// Maps one SSE record onto a [`StreamEvent`].
///
/// The `type` discriminator is checked before the typed decode so that an
/// unknown event kind and a known kind with a bad shape report differently.
pub fn decode_frame(frame: &SseFrame) -> Result<StreamEvent, DecodeError> {
    let value: Value = serde_json::from_str(&frame.data)
        .map_err(|err| DecodeError::Malformed(err.to_string()))?;

    let kind = match value.get("type") {
        Some(Value::String(kind)) => kind.clone(),
        Some(_) | None => return Err(DecodeError::MissingType),
    };

    if !StreamEvent::KNOWN_TYPES.contains(&kind.as_str()) {
        return Err(DecodeError::UnknownType(kind));
    }

    serde_json::from_value(value).map_err(|err| DecodeError::InvalidEvent {
        kind,
        reason: err.to_string(),
    })
}
