use std::env;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Deserialize;

use crate::types::Node;

const DEFAULT_SERVICE_PORT: u16 = 32191;
const DEFAULT_REST_PORT: u16 = 32192;

/// Top-level application configuration loaded from file + environment.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub node: NodeSection,
    pub cluster: ClusterSection,
    pub commit: CommitSection,
    pub logging: LoggingSection,
}

impl AppConfig {
    /// Load configuration from disk and environment.
    pub fn load() -> Result<Self> {
        let config_path = env::var("FATHOM_CONFIG").unwrap_or_else(|_| "config.toml".to_string());

        let mut builder = config::Config::builder();

        if Path::new(&config_path).exists() {
            builder = builder.add_source(config::File::from(PathBuf::from(&config_path)));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("FATHOM")
                .separator("_")
                .try_parsing(true),
        );

        let settings = builder.build()?;
        let mut config: Self = settings.try_deserialize()?;

        if config.node.server_address.trim().is_empty() {
            config.node.server_address = default_server_address();
        }

        if config.logging.level.trim().is_empty() {
            config.logging.level = "info".to_string();
        }

        Ok(config)
    }

    /// The identity this process announces to the cluster.
    pub fn local_node(&self) -> Node {
        Node {
            server_address: self.node.server_address.clone(),
            service_port: self.node.service_port,
            rest_port: self.node.rest_port,
            heartbeat: None,
        }
    }
}

fn default_server_address() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    pub server_address: String,
    pub service_port: u16,
    pub rest_port: u16,
    /// Root directory for node-local data (blob storage, engine data)
    pub data_path: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            server_address: default_server_address(),
            service_port: DEFAULT_SERVICE_PORT,
            rest_port: DEFAULT_REST_PORT,
            data_path: "./data".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    /// Deadline for a single dispatched remote call; expiry is surfaced as
    /// a remote execution failure for that shard.
    pub remote_timeout_secs: u64,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            remote_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CommitSection {
    /// Tick interval of the per-index commit timer
    pub tick_interval_ms: u64,
}

impl Default for CommitSection {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

/// Initialize the global tracing subscriber from the logging section.
pub fn init_tracing(logging: &LoggingSection) -> Result<()> {
    let level = if logging.level.trim().is_empty() {
        "info"
    } else {
        logging.level.as_str()
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    match logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).try_init(),
    }
    .map_err(|e| anyhow::anyhow!("failed to init tracing: {e}"))?;

    Ok(())
}
