use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vellum_types::PartitionUri;

use crate::backend::AuthorityConnection;
use crate::error::AuthorityResult;

/// Parameters handed to a scheme module when it creates an authority.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorityConfig {
    pub parameters: BTreeMap<String, Value>,
}

impl AuthorityConfig {
    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn parameter(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key)
    }
}

/// A source of authority for every partition under one authority URI.
#[async_trait]
pub trait Authority: Send + Sync {
    /// `scheme://authority` this instance serves.
    fn authority_uri(&self) -> &str;

    /// Local authorities authorize their partitions' commands themselves.
    fn is_local(&self) -> bool {
        false
    }

    async fn connect_partition(&self, partition: &PartitionUri) -> AuthorityResult<Arc<dyn AuthorityConnection>>;
}

/// Factory for the authorities of one URI scheme.
pub trait SchemeModule: Send + Sync {
    fn scheme(&self) -> &str;

    /// Config used for authority URIs with no registered config.
    fn default_config(&self) -> AuthorityConfig {
        AuthorityConfig::default()
    }

    fn create_authority(&self, authority_uri: &str, config: &AuthorityConfig) -> AuthorityResult<Arc<dyn Authority>>;
}

/// Where a partition's truths come from.
#[derive(Clone)]
pub enum AuthorityRoute {
    Remote(Arc<dyn AuthorityConnection>),
    /// The partition is authoritative for itself.
    Local,
}

impl AuthorityRoute {
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local)
    }

    pub fn remote(&self) -> Option<&Arc<dyn AuthorityConnection>> {
        match self {
            Self::Remote(connection) => Some(connection),
            Self::Local => None,
        }
    }
}

impl fmt::Debug for AuthorityRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote(connection) => f
                .debug_tuple("Remote")
                .field(&connection.partition_uri().to_string())
                .finish(),
            Self::Local => f.write_str("Local"),
        }
    }
}
