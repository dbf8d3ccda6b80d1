use serde::Deserialize;
use std::path::Path;
use tracing::info;

/// Top-level configuration, loaded from guildmirror.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct MirrorConfig {
    pub server: ServerSection,
    pub database: DatabaseSection,
    pub audit: AuditSection,
    pub dispatcher: DispatcherSection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Address of the read-only HTTP API.
    pub web_address: String,
    /// Address of the newline-delimited JSON event feed.
    pub ingest_address: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            web_address: "0.0.0.0:8080".into(),
            ingest_address: "127.0.0.1:7070".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub url: String,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            url: "sqlite:guildmirror.db?mode=rwc".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AuditSection {
    /// When false, change notifications are discarded.
    pub enabled: bool,
    pub queue_capacity: usize,
}

impl Default for AuditSection {
    fn default() -> Self {
        Self {
            enabled: true,
            queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DispatcherSection {
    pub queue_capacity: usize,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            queue_capacity: 4096,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl MirrorConfig {
    /// Load config from a TOML file. Falls back to defaults if the file doesn't exist.
    /// Environment variables override TOML values.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let mut config = if Path::new(path).exists() {
            let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_string(),
                source,
            })?;
            Self::from_toml(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_string(),
                source,
            })?
        } else {
            info!("No config file found at {}, using defaults", path);
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Apply overrides from `lookup`, normally the process environment.
    /// Values that fail to parse are ignored.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("WEB_ADDRESS") {
            self.server.web_address = v;
        }
        if let Some(v) = lookup("INGEST_ADDRESS") {
            self.server.ingest_address = v;
        }
        if let Some(v) = lookup("DATABASE_URL") {
            self.database.url = v;
        }
        if let Some(v) = lookup("AUDIT_ENABLED")
            && let Some(enabled) = parse_bool(&v)
        {
            self.audit.enabled = enabled;
        }
        if let Some(v) = lookup("AUDIT_QUEUE_CAPACITY")
            && let Ok(capacity) = v.parse()
        {
            self.audit.queue_capacity = capacity;
        }
        if let Some(v) = lookup("DISPATCH_QUEUE_CAPACITY")
            && let Ok(capacity) = v.parse()
        {
            self.dispatcher.queue_capacity = capacity;
        }
    }
}
