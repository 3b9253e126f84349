use std::{collections::HashSet, sync::Arc};

use url::Url;

use crate::error::ConfigurationError;

/// A federated subgraph: a unique name and the address it is served from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubgraphDescriptor {
    name: String,
    endpoint: Url,
}

impl SubgraphDescriptor {
    pub fn new(name: impl Into<String>, endpoint: Url) -> Self {
        SubgraphDescriptor {
            name: name.into(),
            endpoint,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

/// The static, ordered list of subgraphs the gateway federates.
#[derive(Clone, Debug)]
pub struct SubgraphRegistry {
    subgraphs: Vec<Arc<SubgraphDescriptor>>,
}

impl SubgraphRegistry {
    pub fn new(subgraphs: Vec<SubgraphDescriptor>) -> Result<Self, ConfigurationError> {
        if subgraphs.is_empty() {
            return Err(ConfigurationError::EmptyRegistry);
        }

        let mut seen = HashSet::new();

        for subgraph in &subgraphs {
            if subgraph.name.trim().is_empty() {
                return Err(ConfigurationError::InvalidSubgraph {
                    name: subgraph.name.clone(),
                    reason: "name must not be empty".to_string(),
                });
            }

            if !matches!(subgraph.endpoint.scheme(), "http" | "https") {
                return Err(ConfigurationError::InvalidSubgraph {
                    name: subgraph.name.clone(),
                    reason: format!("unsupported url scheme `{}`", subgraph.endpoint.scheme()),
                });
            }

            if !seen.insert(subgraph.name.as_str()) {
                return Err(ConfigurationError::DuplicateSubgraph(subgraph.name.clone()));
            }
        }

        Ok(SubgraphRegistry {
            subgraphs: subgraphs.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn list_subgraphs(&self) -> &[Arc<SubgraphDescriptor>] {
        &self.subgraphs
    }

    pub fn get(&self, name: &str) -> Option<&Arc<SubgraphDescriptor>> {
        self.subgraphs.iter().find(|subgraph| subgraph.name == name)
    }
}
