//! Gateway configuration loaded from a YAML file.
//!
//! ```yaml
//! subgraphs:
//!   - name: accounts
//!     url: http://localhost:4001/graphql
//!   - name: reviews
//!     url: http://localhost:4002/graphql
//! poll_interval_ms: 10000
//! headers:
//!   mode: allow_list
//!   names: [authorization]
//! ```

use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use url::Url;

use crate::{
    error::ConfigurationError,
    header_policy::HeaderPolicy,
    subgraph_registry::{SubgraphDescriptor, SubgraphRegistry},
};

const DEFAULT_SUBGRAPH_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_MAX_FILE_SIZE: u64 = 10_000_000;
const DEFAULT_MAX_FILES: usize = 10;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Ordered list of federated subgraphs.
    pub subgraphs: Vec<SubgraphConfig>,
    /// Schema refresh interval. No refresh happens when absent.
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    /// Independent timeout applied to every subgraph request.
    #[serde(default = "default_subgraph_timeout_ms")]
    pub subgraph_timeout_ms: u64,
    #[serde(default)]
    pub headers: HeaderPolicyConfig,
    #[serde(default)]
    pub startup: StartupConfig,
    #[serde(default)]
    pub uploads: UploadConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubgraphConfig {
    pub name: String,
    pub url: Url,
}

/// Which inbound headers reach the subgraphs.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum HeaderPolicyConfig {
    /// Only listed names, or names matching one of the patterns, are forwarded.
    AllowList {
        #[serde(default)]
        names: Vec<String>,
        #[serde(default)]
        patterns: Vec<String>,
    },
    /// Everything is forwarded except the listed names.
    BlockList {
        #[serde(default)]
        names: Vec<String>,
    },
}

impl Default for HeaderPolicyConfig {
    fn default() -> Self {
        Self::AllowList {
            names: Vec::new(),
            patterns: Vec::new(),
        }
    }
}

/// Retry policy for the first, blocking composition.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StartupConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
        }
    }
}

impl StartupConfig {
    /// Delay before the attempt following `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let delay = self.initial_backoff_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UploadConfig {
    pub max_file_size: u64,
    pub max_files: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_files: DEFAULT_MAX_FILES,
        }
    }
}

fn default_subgraph_timeout_ms() -> u64 {
    DEFAULT_SUBGRAPH_TIMEOUT_MS
}

impl GatewayConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        tracing::debug!(path = %path.display(), "reading gateway configuration");

        let contents = fs::read_to_string(path).map_err(|source| ConfigurationError::Io {
            path: path.display().to_string(),
            source,
        })?;

        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigurationError> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        if self.poll_interval_ms == Some(0) {
            return Err(invalid("poll_interval_ms", "must be greater than zero"));
        }
        if self.subgraph_timeout_ms == 0 {
            return Err(invalid("subgraph_timeout_ms", "must be greater than zero"));
        }
        if self.startup.max_attempts == 0 {
            return Err(invalid("startup.max_attempts", "must be at least 1"));
        }
        if self.uploads.max_files == 0 {
            return Err(invalid("uploads.max_files", "must be at least 1"));
        }

        // Building these surfaces registry and policy problems at load time.
        self.registry()?;
        self.header_policy()?;

        Ok(())
    }

    pub fn registry(&self) -> Result<SubgraphRegistry, ConfigurationError> {
        SubgraphRegistry::new(
            self.subgraphs
                .iter()
                .map(|subgraph| {
                    SubgraphDescriptor::new(subgraph.name.clone(), subgraph.url.clone())
                })
                .collect(),
        )
    }

    pub fn header_policy(&self) -> Result<HeaderPolicy, ConfigurationError> {
        HeaderPolicy::from_config(&self.headers)
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval_ms.map(Duration::from_millis)
    }

    pub fn subgraph_timeout(&self) -> Duration {
        Duration::from_millis(self.subgraph_timeout_ms)
    }
}

fn invalid(setting: &'static str, reason: &str) -> ConfigurationError {
    ConfigurationError::InvalidSetting {
        setting,
        reason: reason.to_string(),
    }
}
