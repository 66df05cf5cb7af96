use std::time::Duration;

use clap::Args;
use serde::Serialize;

use crate::error::ConfigError;
use crate::supervisor::{BackoffPolicy, Jitter};
use crate::text::StepPolicy;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:3001";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeConfig {
    pub base_url: String,
    /// Bound on opening a stream and receiving its first frame.
    pub handshake_timeout: Duration,
    pub backoff: BackoffPolicy,
    /// Reconnect on our own after a lost connection. When off, only a
    /// manual retry reconnects the display.
    pub auto_retry: bool,
    pub notification_capacity: usize,
    pub max_text_frame_len: usize,
    /// Largest display frame accepted, and the largest framebuffer a
    /// server-init may allocate.
    pub max_display_frame_len: usize,
    pub step_policy: StepPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            handshake_timeout: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
            auto_retry: true,
            notification_capacity: 256,
            max_text_frame_len: 1024 * 1024,
            max_display_frame_len: 32 * 1024 * 1024,
            step_policy: StepPolicy::UpdateById,
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.backoff.validate()?;
        if self.handshake_timeout.is_zero() {
            return Err(ConfigError::Zero("handshake_timeout"));
        }
        if self.notification_capacity == 0 {
            return Err(ConfigError::Zero("notification_capacity"));
        }
        if self.max_text_frame_len == 0 {
            return Err(ConfigError::Zero("max_text_frame_len"));
        }
        if self.max_display_frame_len == 0 {
            return Err(ConfigError::Zero("max_display_frame_len"));
        }
        Ok(())
    }
}

/// Connection flags shared by the client subcommands.
#[derive(Debug, Clone, Args)]
pub struct ConnectionArgs {
    /// Backend base URL
    #[arg(long, env = "TETHER_BASE_URL", default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    #[arg(long, env = "TETHER_HANDSHAKE_TIMEOUT_MS", default_value_t = 10_000)]
    pub handshake_timeout_ms: u64,

    #[arg(long, env = "TETHER_BACKOFF_BASE_MS", default_value_t = 250)]
    pub backoff_base_ms: u64,

    #[arg(long, env = "TETHER_BACKOFF_MULTIPLIER", default_value_t = 2.0)]
    pub backoff_multiplier: f64,

    #[arg(long, env = "TETHER_BACKOFF_MAX_MS", default_value_t = 30_000)]
    pub backoff_max_ms: u64,

    #[arg(long, env = "TETHER_BACKOFF_JITTER", value_enum, default_value_t = Jitter::None)]
    pub backoff_jitter: Jitter,

    /// Only reconnect when asked to
    #[arg(long, env = "TETHER_MANUAL_RETRY")]
    pub manual_retry: bool,

    #[arg(long, env = "TETHER_NOTIFICATION_CAPACITY", default_value_t = 256)]
    pub notification_capacity: usize,

    #[arg(long, env = "TETHER_MAX_TEXT_FRAME", default_value_t = 1024 * 1024)]
    pub max_text_frame_len: usize,

    #[arg(long, env = "TETHER_MAX_DISPLAY_FRAME", default_value_t = 32 * 1024 * 1024)]
    pub max_display_frame_len: usize,

    /// How repeated `step` events are folded into the transcript
    #[arg(long, env = "TETHER_STEP_POLICY", value_enum, default_value_t = StepPolicy::UpdateById)]
    pub step_policy: StepPolicy,
}

impl TryFrom<ConnectionArgs> for RuntimeConfig {
    type Error = ConfigError;

    fn try_from(args: ConnectionArgs) -> Result<Self, Self::Error> {
        let config = RuntimeConfig {
            base_url: args.base_url,
            handshake_timeout: Duration::from_millis(args.handshake_timeout_ms),
            backoff: BackoffPolicy {
                base_delay: Duration::from_millis(args.backoff_base_ms),
                multiplier: args.backoff_multiplier,
                max_delay: Duration::from_millis(args.backoff_max_ms),
                jitter: args.backoff_jitter,
            },
            auto_retry: !args.manual_retry,
            notification_capacity: args.notification_capacity,
            max_text_frame_len: args.max_text_frame_len,
            max_display_frame_len: args.max_display_frame_len,
            step_policy: args.step_policy,
        };
        config.validate()?;
        Ok(config)
    }
}
