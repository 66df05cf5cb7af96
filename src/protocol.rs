use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionCreateResponse {
    pub session_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
    /// Non-zero when the client is resuming a turn it lost mid-stream.
    #[serde(default)]
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
}

/// One decoded record of the agent response stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Message {
        content: String,
    },
    Title {
        content: String,
    },
    Plan {
        content: String,
    },
    Step {
        content: String,
        status: StepStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Tool {
        content: String,
        tool: String,
        action: String,
    },
    Error {
        content: String,
    },
    Done,
}

impl StreamEvent {
    pub const KNOWN_TYPES: [&'static str; 7] =
        ["message", "title", "plan", "step", "tool", "error", "done"];

    pub fn message(content: impl Into<String>) -> Self {
        Self::Message {
            content: content.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn step_without_id_omits_field() {
        let event = StreamEvent::Step {
            content: "index repo".to_string(),
            status: StepStatus::Running,
            id: None,
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({"type": "step", "content": "index repo", "status": "running"})
        );
    }

    #[test]
    fn done_ignores_extra_fields() {
        let event: StreamEvent =
            serde_json::from_value(json!({"type": "done", "content": ""})).unwrap();
        assert_eq!(event, StreamEvent::Done);
    }
}
