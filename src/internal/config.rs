use serde::{Deserialize, Serialize};
use std::{env, fs, path::Path, time::Duration};

use crate::internal::governance::propagation::{DownstreamNode, PropagationMode};

const DEFAULT_CONFIG_PATH: &str = "config/registry.json";
const DEFAULT_BUILDER_URL: &str = "http://gramine-container:8008";
const DEFAULT_ANALYZER_URL: &str = "http://analysis-container:8009";

/// Public key registered for an organization.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct OrgEntry {
    pub id: String,
    pub public_key: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct RegistryConfig {
    pub listen_addr: String,
    pub builder_url: String,
    pub analyzer_url: String,
    /// Defaults to the builder and the analyzer when empty.
    pub downstream_nodes: Vec<DownstreamNode>,
    pub request_timeout_secs: u64,
    pub propagation_mode: PropagationMode,
    pub propagate_before_register: bool,
    /// `memory` or a `sqlite:` URL.
    pub ledger_url: String,
    pub organizations: Vec<OrgEntry>,
    pub max_clock_skew_secs: i64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:7800".to_string(),
            builder_url: DEFAULT_BUILDER_URL.to_string(),
            analyzer_url: DEFAULT_ANALYZER_URL.to_string(),
            downstream_nodes: Vec::new(),
            request_timeout_secs: 60,
            propagation_mode: PropagationMode::Sequential,
            propagate_before_register: true,
            ledger_url: "memory".to_string(),
            organizations: Vec::new(),
            max_clock_skew_secs: 300,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read registry config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid registry config JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl RegistryConfig {
    /// Loads `$DPR_CONFIG` (or the default path), falling back to defaults
    /// when the file is missing or unreadable, then applies env overrides.
    pub fn load() -> Self {
        let path = env::var("DPR_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = match Self::read(Path::new(&path)) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(%path, error = %e, "using default registry config");
                Self::default()
            }
        };
        config.apply_env();
        config
    }

    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn apply_env(&mut self) {
        if let Ok(addr) = env::var("DPR_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Ok(url) = env::var("DPR_BUILDER_URL") {
            self.builder_url = url;
        }
        if let Ok(url) = env::var("DPR_ANALYZER_URL") {
            self.analyzer_url = url;
        }
        if let Ok(url) = env::var("DPR_LEDGER_URL") {
            self.ledger_url = url;
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn propagation_targets(&self) -> Vec<DownstreamNode> {
        if !self.downstream_nodes.is_empty() {
            return self.downstream_nodes.clone();
        }
        vec![
            DownstreamNode {
                name: "builder".to_string(),
                url: self.builder_url.clone(),
            },
            DownstreamNode {
                name: "analyzer".to_string(),
                url: self.analyzer_url.clone(),
            },
        ]
    }
}
