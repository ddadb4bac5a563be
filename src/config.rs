use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

/// Command line options for the server.
#[derive(Parser, Debug, Default)]
pub struct Cli {
    /// Override bind address (host:port).
    #[arg(long)]
    pub bind: Option<String>,
    /// Override server port.
    #[arg(long)]
    pub port: Option<u16>,
    /// Enable or disable logging (true/false).
    #[arg(long)]
    pub logging: Option<bool>,
    /// Path to configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Runtime configuration resolved from file, env and CLI.
#[derive(Clone, Debug)]
pub struct Config {
    /// Address to bind the HTTP server to.
    pub bind: String,
    /// Base directory holding the SQLite database.
    pub data_dir: PathBuf,
    /// Upper bound on message/post content length in characters.
    pub max_content_len: usize,
    /// Page size used when a list request omits `limit`.
    pub default_page_size: usize,
    /// Minimum interval between relayed typing events per conversation.
    pub typing_debounce_ms: u64,
    /// Read notifications older than this many days are pruned.
    pub notification_keep_days: i64,
    /// Whether verbose logging is enabled.
    pub logging_enabled: bool,
}

#[derive(Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    server: FileServer,
    #[serde(default)]
    logging: FileLogging,
    #[serde(default)]
    limits: FileLimits,
}

#[derive(Deserialize)]
struct FileServer {
    #[serde(default = "default_port")]
    port: u16,
}

#[derive(Deserialize)]
struct FileLogging {
    #[serde(default = "default_logging")]
    enabled: bool,
}

#[derive(Deserialize)]
struct FileLimits {
    #[serde(default = "default_max_content_len")]
    max_content_len: usize,
    #[serde(default = "default_page_size")]
    default_page_size: usize,
    #[serde(default = "default_typing_debounce_ms")]
    typing_debounce_ms: u64,
    #[serde(default = "default_keep_days")]
    notification_keep_days: i64,
}

fn default_port() -> u16 {
    8790
}

fn default_logging() -> bool {
    true
}

fn default_max_content_len() -> usize {
    5000
}

fn default_page_size() -> usize {
    50
}

fn default_typing_debounce_ms() -> u64 {
    2000
}

fn default_keep_days() -> i64 {
    30
}

impl Default for FileServer {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

impl Default for FileLogging {
    fn default() -> Self {
        Self {
            enabled: default_logging(),
        }
    }
}

impl Default for FileLimits {
    fn default() -> Self {
        Self {
            max_content_len: default_max_content_len(),
            default_page_size: default_page_size(),
            typing_debounce_ms: default_typing_debounce_ms(),
            notification_keep_days: default_keep_days(),
        }
    }
}

impl Config {
    /// Resolve configuration with CLI > env > config file > defaults
    /// precedence.
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut port = default_port();
        let mut logging = default_logging();
        let mut limits = FileLimits::default();

        let config_path = cli
            .config
            .clone()
            .or_else(|| std::env::var("DEVCONNECT_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("config/devconnect.toml"));

        if let Ok(bytes) = fs::read(&config_path) {
            let contents = String::from_utf8_lossy(&bytes);
            let file_cfg: FileConfig = toml::from_str(&contents).context("invalid config file")?;
            port = file_cfg.server.port;
            logging = file_cfg.logging.enabled;
            limits = file_cfg.limits;
        }

        // environment overrides
        if let Ok(p) = std::env::var("DEVCONNECT_PORT") {
            if let Ok(p) = p.parse::<u16>() {
                port = p;
            }
        }
        if let Ok(l) = std::env::var("DEVCONNECT_LOGGING") {
            if let Ok(l) = l.parse::<bool>() {
                logging = l;
            }
        }

        // CLI overrides
        if let Some(p) = cli.port {
            port = p;
        }
        if let Some(l) = cli.logging {
            logging = l;
        }

        if !(1024..=65535).contains(&port) {
            anyhow::bail!("invalid_port");
        }

        let bind = if let Some(b) = &cli.bind {
            b.clone()
        } else if let Ok(b) = std::env::var("BIND") {
            b
        } else {
            format!("127.0.0.1:{}", port)
        };

        let data_dir = std::env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_dir());
        let max_content_len = std::env::var("MAX_CONTENT_LEN")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(limits.max_content_len);

        Ok(Self {
            bind,
            data_dir,
            max_content_len,
            default_page_size: limits.default_page_size,
            typing_debounce_ms: limits.typing_debounce_ms,
            notification_keep_days: limits.notification_keep_days,
            logging_enabled: logging,
        })
    }
}

/// Determine the default data directory for the server.
pub fn default_data_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        let mut p = PathBuf::from(home);
        p.push(".local/share/devconnect");
        p
    } else {
        PathBuf::from("./devconnect_data")
    }
}
