//! Client runtime that keeps a session in sync with an agent response
//! stream and a remote display.

pub mod client;
pub mod config;
pub mod display;
pub mod error;
pub mod protocol;
pub mod runtime;
pub mod server;
pub mod supervisor;
pub mod text;
pub mod transport;

pub use config::RuntimeConfig;
pub use runtime::{DisplayStatus, Notification, Runtime, TextStatus};
