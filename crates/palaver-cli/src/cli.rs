//! CLI argument definitions for the terminal chat host.
//!
//! Uses `clap` with derive macros. Priority resolution: CLI args > env
//! vars > config file > defaults.

use clap::Parser;
use std::path::PathBuf;

/// Palaver, a terminal host for the chat widget runtime.
#[derive(Parser, Debug)]
#[command(name = "palaver", version, about)]
pub struct CliArgs {
    /// Chatbot to converse with.
    pub chatbot_id: String,

    /// Path to the configuration file.
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Backend base URL.
    #[arg(short = 'u', long = "base-url")]
    pub base_url: Option<String>,

    /// Data directory for the session database.
    #[arg(short = 'd', long = "data-dir")]
    pub data_dir: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level")]
    pub log_level: Option<String>,

    /// Greeting shown (and spoken) before the first message.
    #[arg(short = 'g', long = "greeting")]
    pub greeting: Option<String>,
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > PALAVER_CONFIG env var > ~/.palaver/config.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("PALAVER_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".palaver").join("config.toml");
    }
    #[cfg(not(target_os = "windows"))]
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".palaver").join("config.toml");
    }
    PathBuf::from("config.toml")
}
