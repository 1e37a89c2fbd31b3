use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const INBOX_LABEL: &str = "INBOX";
pub const INBOX_DESCRIPTION: &str = "Others";
pub const DEFAULT_BATCH_SIZE: NonZeroUsize = match NonZeroUsize::new(5) {
    Some(size) => size,
    None => panic!("default batch size must be non-zero"),
};
pub const DEFAULT_TRIGGER_INTERVAL_MINUTES: u32 = 10;
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing handler name; set `handler_name`")]
    MissingHandlerName,

    #[error("missing classifier API key; set `api_key` or TRIAGE_API_KEY")]
    MissingApiKey,

    #[error("missing label set; set `labels` to a list of {{label, description}}")]
    MissingLabels,

    #[error("invalid label descriptor at position {index}: {reason}")]
    InvalidLabel { index: usize, reason: String },

    #[error("read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0}")]
    Path(String),
}

/// A label the classifier may choose, with the description it is shown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelDescriptor {
    #[serde(rename = "label")]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

impl LabelDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }

    pub fn inbox() -> Self {
        Self::new(INBOX_LABEL, INBOX_DESCRIPTION)
    }

    pub fn is_inbox(&self) -> bool {
        self.name == INBOX_LABEL
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GmailSettings {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub refresh_token: Option<String>,
}

/// Configuration as written by the user, before defaults and checks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawConfig {
    pub handler_name: Option<String>,
    pub api_key: Option<String>,
    pub labels: Option<Vec<LabelDescriptor>>,
    pub batch_size: Option<usize>,
    pub trigger_interval_minutes: Option<u32>,
    pub model: Option<String>,
    #[serde(default)]
    pub gmail: Option<GmailSettings>,
}

impl RawConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let home = dirs::home_dir()
            .ok_or_else(|| ConfigError::Path("failed to determine home directory".to_string()))?;
        Ok(home.join(".triage").join("config.json"))
    }
}

/// Validated cycle configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriageConfig {
    pub handler_name: String,
    pub api_key: String,
    pub labels: Vec<LabelDescriptor>,
    pub batch_size: NonZeroUsize,
    pub trigger_interval_minutes: u32,
    pub model: String,
    pub gmail: GmailSettings,
}

impl TriageConfig {
    /// Checks required fields, applies defaults and appends the INBOX
    /// fallback label when the set lacks one. Zero counts as unset for both
    /// numeric fields.
    pub fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let handler_name = non_blank(raw.handler_name).ok_or(ConfigError::MissingHandlerName)?;
        let api_key = non_blank(raw.api_key).ok_or(ConfigError::MissingApiKey)?;
        let labels = normalize_labels(raw.labels.ok_or(ConfigError::MissingLabels)?)?;

        let batch_size = raw
            .batch_size
            .and_then(NonZeroUsize::new)
            .unwrap_or(DEFAULT_BATCH_SIZE);
        let trigger_interval_minutes = raw
            .trigger_interval_minutes
            .filter(|minutes| *minutes > 0)
            .unwrap_or(DEFAULT_TRIGGER_INTERVAL_MINUTES);
        let model = non_blank(raw.model).unwrap_or_else(|| DEFAULT_MODEL.to_string());

        Ok(Self {
            handler_name,
            api_key,
            labels,
            batch_size,
            trigger_interval_minutes,
            model,
            gmail: raw.gmail.unwrap_or_default(),
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn normalize_labels(
    mut labels: Vec<LabelDescriptor>,
) -> Result<Vec<LabelDescriptor>, ConfigError> {
    for (index, label) in labels.iter().enumerate() {
        if label.name.trim().is_empty() {
            return Err(ConfigError::InvalidLabel {
                index,
                reason: "label name is empty".to_string(),
            });
        }
    }

    if !labels.iter().any(LabelDescriptor::is_inbox) {
        labels.push(LabelDescriptor::inbox());
    }
    Ok(labels)
}
