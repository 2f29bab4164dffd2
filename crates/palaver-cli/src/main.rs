//! Palaver terminal host - composition root.
//!
//! Wires the widget runtime to a stdin/stdout conversation:
//! 1. Load configuration from TOML
//! 2. Open the SQLite session store
//! 3. Point every network port at one HTTP backend
//! 4. Start a `WidgetSession` and run a line-based REPL
//!
//! Auth commands inside the REPL:
//!   /auth <email|whatsapp> <destination>   request a one-time code
//!   /verify <code>                         verify the received code
//!   /status                                show auth and quota state
//!   /quit                                  exit

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use palaver_chat::{HttpBackend, SendOutcome, SessionDeps, WidgetSession};
use palaver_core::{AuthChannel, Sender, WidgetConfig};
use palaver_storage::{KeyValueStore, MemoryStore, SessionStore, SqliteStore};

mod cli;
mod host;

use cli::CliArgs;
use host::{NoMicrophone, SilentPlayer};

/// Expand ~ to home directory in a path string.
fn resolve_data_dir(data_dir: &str) -> PathBuf {
    if data_dir.starts_with("~/") || data_dir.starts_with("~\\") {
        #[cfg(target_os = "windows")]
        let home = std::env::var("USERPROFILE").unwrap_or_else(|_| ".".to_string());
        #[cfg(not(target_os = "windows"))]
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(&data_dir[2..])
    } else {
        PathBuf::from(data_dir)
    }
}

/// Open the durable session backend, degrading to in-memory when the
/// database cannot be opened. Session state then lasts only for this
/// process, but the conversation still works.
fn open_backend(db_path: &Path) -> Box<dyn KeyValueStore> {
    match SqliteStore::new(db_path) {
        Ok(sqlite) => {
            tracing::info!(path = %db_path.display(), "Session store opened");
            Box::new(sqlite)
        }
        Err(e) => {
            tracing::warn!(path = %db_path.display(), error = %e,
                "Session database unavailable, continuing in-memory");
            Box::new(MemoryStore::new())
        }
    }
}

fn parse_channel(word: &str) -> Option<AuthChannel> {
    match word {
        "email" => Some(AuthChannel::Email),
        "whatsapp" => Some(AuthChannel::Whatsapp),
        _ => None,
    }
}

/// Print any transcript entries past `seen` and return the new length.
fn print_new_messages(session: &WidgetSession, seen: usize) -> usize {
    let messages = session.transcript.messages();
    for message in &messages[seen..] {
        match message.sender {
            Sender::User => println!("you> {}", message.text),
            Sender::Bot => println!("bot> {}", message.text),
        }
    }
    messages.len()
}

async fn handle_command(session: &WidgetSession, line: &str) {
    let mut words = line.split_whitespace();
    match words.next() {
        Some("/auth") => {
            let channel = words.next().and_then(parse_channel);
            let destination = words.next();
            let (Some(channel), Some(destination)) = (channel, destination) else {
                println!("usage: /auth <email|whatsapp> <destination>");
                return;
            };
            match session.auth.request_code(channel, destination).await {
                Ok(()) => println!("Code sent to {} over {}.", destination, channel),
                Err(e) => println!("{}", e),
            }
        }
        Some("/verify") => {
            let Some(code) = words.next() else {
                println!("usage: /verify <code>");
                return;
            };
            match session.auth.verify_code(code).await {
                Ok(()) => println!("Verified. You can keep chatting."),
                Err(e) => println!("{}", e),
            }
        }
        Some("/status") => {
            let quota = session.dispatcher.quota();
            println!("auth:     {}", session.auth.state());
            println!("quota:    {}/{} free messages used", quota.used(), quota.limit());
            let cooldown = session.auth.resend_remaining_secs();
            if cooldown > 0 {
                println!("cooldown: {}s until a code can be resent", cooldown);
            }
        }
        _ => println!("commands: /auth, /verify, /status, /quit"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Config.
    let config_file = args.resolve_config_path();
    let mut config = WidgetConfig::load_or_default(&config_file);
    if let Some(base_url) = &args.base_url {
        config.api.base_url = base_url.clone();
    }
    if let Some(data_dir) = &args.data_dir {
        config.general.data_dir = data_dir.clone();
    }
    if let Some(level) = &args.log_level {
        config.general.log_level = level.clone();
    }

    // Tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.general.log_level)),
        )
        .init();
    tracing::info!("Starting Palaver v{}", env!("CARGO_PKG_VERSION"));

    // Storage.
    let data_dir = resolve_data_dir(&config.general.data_dir);
    let db_path = data_dir.join("palaver.db");
    let store = Arc::new(SessionStore::new(
        open_backend(&db_path),
        args.chatbot_id.clone(),
    ));

    // Backend and session.
    let backend = Arc::new(HttpBackend::new(&config.api)?);
    let deps = SessionDeps::over_http(
        backend,
        store,
        Arc::new(SilentPlayer),
        Arc::new(NoMicrophone),
    );
    let session = WidgetSession::start(
        deps,
        &config,
        &args.chatbot_id,
        args.greeting.as_deref(),
    )
    .await;

    let mut seen = print_new_messages(&session, 0);
    println!("(type a message, or /status, /auth, /verify, /quit)");

    // REPL.
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if line.starts_with('/') {
            handle_command(&session, line).await;
            seen = print_new_messages(&session, seen);
            continue;
        }

        match session.dispatcher.send(line).await {
            SendOutcome::GatedQuota | SendOutcome::GatedPending => {
                println!("Free messages used up. Authenticate with /auth to continue.");
            }
            SendOutcome::AuthDemanded => {
                println!("The server requires authentication. Use /auth to continue.");
            }
            SendOutcome::Delivered | SendOutcome::Failed | SendOutcome::Ignored => {}
        }
        seen = print_new_messages(&session, seen);
    }

    session.shutdown();
    Ok(())
}
