//! Retry, backoff and lifecycle bookkeeping shared by the text and display
//! streams.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Jitter {
    /// Always wait the capped exponential delay.
    #[default]
    None,
    /// Wait a random delay in `[0, capped delay]`.
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter: Jitter,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: Jitter::None,
        }
    }
}

impl BackoffPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err(ConfigError::Multiplier(self.multiplier));
        }
        if self.base_delay.is_zero() {
            return Err(ConfigError::ZeroBaseDelay);
        }
        if self.max_delay < self.base_delay {
            return Err(ConfigError::MaxBelowBase {
                base: self.base_delay,
                max: self.max_delay,
            });
        }
        Ok(())
    }
}

/// Exponential delay sequence. Unbounded: it never runs out of attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// `min(base * multiplier^attempt, max)`, then jittered.
    pub fn next_delay(&mut self) -> Duration {
        let BackoffPolicy {
            base_delay,
            multiplier,
            max_delay,
            jitter,
        } = self.policy;

        let exponent = i32::try_from(self.attempt).unwrap_or(i32::MAX);
        let secs = base_delay.as_secs_f64() * multiplier.powi(exponent);
        let capped = Duration::try_from_secs_f64(secs)
            .map(|delay| delay.min(max_delay))
            .unwrap_or(max_delay);

        self.attempt = self.attempt.saturating_add(1);
        match jitter {
            Jitter::None => capped,
            Jitter::Full => {
                let ceiling = u64::try_from(capped.as_millis()).unwrap_or(u64::MAX);
                Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
            }
        }
    }
}

/// How a wait between attempts ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    Elapsed,
    RetryNow,
    Cancelled,
}

/// Drives the retry policy of one stream.
///
/// The stream's task asks for a delay after every lost connection and then
/// waits; a manual retry cuts the wait short and cancellation ends it for
/// good.
#[derive(Debug)]
pub struct Supervisor {
    backoff: Backoff,
    auto_retry: bool,
    cancel: CancellationToken,
    retry_now: Arc<Notify>,
}

impl Supervisor {
    pub fn new(
        policy: BackoffPolicy,
        auto_retry: bool,
        cancel: CancellationToken,
        retry_now: Arc<Notify>,
    ) -> Self {
        Self {
            backoff: Backoff::new(policy),
            auto_retry,
            cancel,
            retry_now,
        }
    }

    /// Number of the attempt about to start (0 for the first).
    pub fn attempt(&self) -> u32 {
        self.backoff.attempt()
    }

    /// A connection got far enough to count as established.
    pub fn established(&mut self) {
        self.backoff.reset();
    }

    /// The delay before the next attempt, or `None` when only a manual retry
    /// may reconnect.
    pub fn schedule(&mut self) -> Option<Duration> {
        self.auto_retry.then(|| self.backoff.next_delay())
    }

    pub async fn wait(&self, delay: Option<Duration>) -> Resume {
        let sleep = async {
            match delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Resume::Cancelled,
            _ = self.retry_now.notified() => Resume::RetryNow,
            _ = sleep => Resume::Elapsed,
        }
    }
}

/// One observed state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition<S> {
    pub from: S,
    pub to: S,
    pub instance: u64,
}

/// Remembers the last state published for a stream so that each actual
/// transition is reported exactly once.
#[derive(Debug, Clone)]
pub struct Lifecycle<S> {
    state: S,
    instance: u64,
}

impl<S: Copy + PartialEq> Lifecycle<S> {
    pub fn new(initial: S) -> Self {
        Self {
            state: initial,
            instance: 0,
        }
    }

    pub fn state(&self) -> S {
        self.state
    }

    /// Id of the current connection attempt; 0 before the first.
    pub fn instance(&self) -> u64 {
        self.instance
    }

    pub fn begin_attempt(&mut self) -> u64 {
        self.instance += 1;
        self.instance
    }

    pub fn observe(&mut self, state: S) -> Option<Transition<S>> {
        if state == self.state {
            return None;
        }
        let from = std::mem::replace(&mut self.state, state);
        tracing::debug!(instance = self.instance, "lifecycle transition");
        Some(Transition {
            from,
            to: state,
            instance: self.instance,
        })
    }
}
