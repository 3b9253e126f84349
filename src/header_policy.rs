//! Decides which inbound client headers are copied onto subgraph requests.

use std::collections::BTreeSet;

use http::{HeaderMap, HeaderName, HeaderValue};
use regex::{Regex, RegexBuilder};

use crate::{config::HeaderPolicyConfig, error::ConfigurationError};

/// Connection-level headers; dropped in either mode.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "content-length",
    "content-type",
    "host",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderDecision {
    Forward,
    Drop,
}

#[derive(Debug, Clone)]
pub enum HeaderPolicy {
    AllowList(AllowList),
    BlockList(BTreeSet<String>),
}

#[derive(Debug, Clone, Default)]
pub struct AllowList {
    names: BTreeSet<String>,
    patterns: Vec<Regex>,
}

impl AllowList {
    pub fn is_allowed(&self, header_name: &str) -> bool {
        let name = header_name.to_ascii_lowercase();
        self.names.contains(&name) || self.patterns.iter().any(|pattern| pattern.is_match(&name))
    }
}

impl HeaderPolicy {
    pub fn allow_list<I, S>(names: I) -> Result<Self, ConfigurationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self::AllowList(AllowList {
            names: normalize_names(names)?,
            patterns: Vec::new(),
        }))
    }

    pub fn block_list<I, S>(names: I) -> Result<Self, ConfigurationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self::BlockList(normalize_names(names)?))
    }

    pub fn from_config(config: &HeaderPolicyConfig) -> Result<Self, ConfigurationError> {
        match config {
            HeaderPolicyConfig::AllowList { names, patterns } => {
                let patterns = patterns
                    .iter()
                    .map(|pattern| {
                        RegexBuilder::new(pattern)
                            .case_insensitive(true)
                            .build()
                            .map_err(|e| {
                                let cause = format!("pattern `{pattern}`: {e}");
                                ConfigurationError::InvalidPolicy(cause)
                            })
                    })
                    .collect::<Result<_, _>>()?;

                Ok(Self::AllowList(AllowList {
                    names: normalize_names(names)?,
                    patterns,
                }))
            }
            HeaderPolicyConfig::BlockList { names } => Self::block_list(names),
        }
    }

    /// Copies every forwardable inbound header onto `outbound`.
    ///
    /// Called once per subgraph request.
    pub fn apply(&self, inbound: &HeaderMap, outbound: &mut HeaderMap) {
        for (name, value) in inbound {
            if decide(name.as_str(), Some(value), self) == HeaderDecision::Forward {
                outbound.append(name.clone(), value.clone());
            }
        }

        if let Self::BlockList(blocked) = self {
            // Blocked names stay out even if something upstream already set them.
            for name in blocked {
                if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
                    outbound.remove(name);
                }
            }
        }
    }
}

/// Pure forwarding decision for a single header.
pub fn decide(
    header_name: &str,
    value: Option<&HeaderValue>,
    policy: &HeaderPolicy,
) -> HeaderDecision {
    let name = header_name.to_ascii_lowercase();

    if value.is_none() || HOP_BY_HOP.contains(&name.as_str()) {
        return HeaderDecision::Drop;
    }

    let forward = match policy {
        HeaderPolicy::AllowList(allow) => allow.is_allowed(&name),
        HeaderPolicy::BlockList(blocked) => !blocked.contains(&name),
    };

    if forward {
        HeaderDecision::Forward
    } else {
        HeaderDecision::Drop
    }
}

fn normalize_names<I, S>(names: I) -> Result<BTreeSet<String>, ConfigurationError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    names
        .into_iter()
        .map(|name| {
            let name = name.as_ref().trim().to_ascii_lowercase();
            match HeaderName::from_bytes(name.as_bytes()) {
                Ok(_) => Ok(name),
                Err(_) => Err(ConfigurationError::InvalidPolicy(format!(
                    "`{name}` is not a valid header name"
                ))),
            }
        })
        .collect()
}
