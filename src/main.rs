use std::collections::HashMap;
use std::error::Error;
use std::io::Write;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use tether::client::HttpTextStreamOpener;
use tether::config::{ConnectionArgs, RuntimeConfig};
use tether::runtime::{Notification, Runtime, TextStreamState};
use tether::server::{self, ServerConfig};
use tether::text::{Author, EntryKind, TranscriptChange};

type MainResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

#[derive(Parser)]
#[command(name = "tether", version, about = "Session runtime for agent chat and remote displays")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the mock backend
    Serve {
        #[arg(long, env = "TETHER_LISTEN", default_value = "127.0.0.1:3001")]
        listen: String,
        #[arg(long, default_value_t = 500)]
        frame_interval_ms: u64,
    },
    /// Send one message and print the response as it streams
    Chat {
        /// Existing session id; a new session is created when omitted
        #[arg(long)]
        session: Option<String>,
        message: String,
        #[command(flatten)]
        connection: ConnectionArgs,
    },
    /// Watch a session's remote display for a while
    Display {
        #[arg(long)]
        session: Option<String>,
        #[arg(long, default_value_t = 10)]
        seconds: u64,
        #[command(flatten)]
        connection: ConnectionArgs,
    },
}

#[tokio::main]
async fn main() -> MainResult<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tether=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Serve {
            listen,
            frame_interval_ms,
        } => {
            server::run(ServerConfig {
                listen,
                frame_interval: Duration::from_millis(frame_interval_ms),
                ..ServerConfig::default()
            })
            .await
        }
        Command::Chat {
            session,
            message,
            connection,
        } => chat(RuntimeConfig::try_from(connection)?, session, message).await,
        Command::Display {
            session,
            seconds,
            connection,
        } => {
            display(
                RuntimeConfig::try_from(connection)?,
                session,
                Duration::from_secs(seconds),
            )
            .await
        }
    }
}

async fn resolve_session(config: &RuntimeConfig, session: Option<String>) -> MainResult<String> {
    match session {
        Some(session) => Ok(session),
        None => Ok(HttpTextStreamOpener::new(&config.base_url)
            .create_session()
            .await?),
    }
}

async fn chat(config: RuntimeConfig, session: Option<String>, message: String) -> MainResult<()> {
    let session_id = resolve_session(&config, session).await?;
    let runtime = Runtime::connect(config)?;
    let mut notifications = runtime.subscribe();

    runtime.open_session(session_id.clone());
    runtime.send_message(&session_id, message);

    // Bytes of each entry already written to stdout.
    let mut printed: HashMap<Uuid, usize> = HashMap::new();
    let mut stdout = std::io::stdout();

    while let Some(notification) = notifications.next().await {
        match notification {
            Notification::TranscriptChanged { change, .. } => {
                let id = match change {
                    TranscriptChange::Appended { id } | TranscriptChange::Updated { id } => id,
                    TranscriptChange::TitleChanged { title } => {
                        println!("# {title}\n");
                        continue;
                    }
                    TranscriptChange::TurnClosed => {
                        println!();
                        break;
                    }
                };
                let Some(transcript) = runtime.transcript(&session_id) else {
                    break;
                };
                let Some(entry) = transcript.get(id) else {
                    continue;
                };
                if entry.author == Author::User {
                    continue;
                }

                let seen = printed.entry(id).or_insert(0);
                match entry.kind {
                    EntryKind::Message => {
                        write!(stdout, "{}", &entry.text[*seen..])?;
                        stdout.flush()?;
                    }
                    kind => {
                        let status = entry
                            .metadata
                            .status
                            .map(|status| format!(" ({status:?})"))
                            .unwrap_or_default();
                        println!("[{kind:?}{status}] {}", entry.text);
                    }
                }
                *seen = entry.text.len();
            }
            Notification::TextStreamState {
                state: TextStreamState::Backoff,
                error,
                ..
            } => {
                tracing::warn!(error = error.as_deref().unwrap_or("unknown"), "response interrupted, retrying");
            }
            _ => {}
        }
    }

    runtime.close_session(&session_id);
    Ok(())
}

async fn display(
    config: RuntimeConfig,
    session: Option<String>,
    duration: Duration,
) -> MainResult<()> {
    let session_id = resolve_session(&config, session).await?;
    let runtime = Runtime::connect(config)?;
    let mut notifications = runtime.subscribe();

    runtime.open_session(session_id.clone());
    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            notification = notifications.next() => {
                let Some(notification) = notification else {
                    break;
                };
                match notification {
                    Notification::DisplayStateChanged { state, error, instance, .. } => {
                        tracing::info!(?state, instance, error = error.as_deref().unwrap_or(""), "display state");
                    }
                    Notification::FramebufferUpdated { sequence, applied, dropped, .. } => {
                        tracing::info!(sequence, applied, dropped, "framebuffer updated");
                    }
                    Notification::RegionDropped { sequence, reason, .. } => {
                        tracing::warn!(sequence, %reason, "region dropped");
                    }
                    Notification::UpdateRejected { reason, .. } => {
                        tracing::warn!(%reason, "update rejected");
                    }
                    Notification::RetryScheduled { attempt, delay_ms, .. } => {
                        tracing::info!(attempt, ?delay_ms, "display retry scheduled");
                    }
                    Notification::Bell { .. } => tracing::info!("bell"),
                    Notification::Clipboard { text, .. } => tracing::info!(%text, "clipboard"),
                    _ => {}
                }
            }
        }
    }

    if let Some(status) = runtime.display_status(&session_id) {
        println!("{}", serde_json::to_string_pretty(&status)?);
    }
    runtime.close_session(&session_id);
    Ok(())
}
