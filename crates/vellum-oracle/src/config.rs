use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;
use vellum_scribe::{FinalizerConfig, RetrievalConfig, ScribeConfig};
use vellum_store::{FileStorage, InMemoryStorage, JournalConfig, LocalStorage};

use crate::error::OracleResult;

/// Configuration of an [`Oracle`](crate::Oracle) and its sessions.
///
/// Every section is optional in TOML; missing sections and fields use
/// their defaults.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub storage: StorageConfig,
    pub retrieval: RetrievalConfig,
    pub finalizers: FinalizerConfig,
    pub narration: NarrationConfig,
    pub followers: FollowerConfig,
}

/// Local storage of the partition logs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Keep speculative commands in memory only.
    pub transient: bool,
    /// Journal file of a [`FileStorage`]. Storage is in-memory when unset.
    pub journal: Option<PathBuf>,
    #[serde(flatten)]
    pub journal_config: JournalConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NarrationConfig {
    /// Default for [`NarrateOptions::require_latest_media_contents`](vellum_authority::NarrateOptions).
    pub require_latest_media_contents: bool,
    /// How far past the next expected event id a truth may be queued.
    pub max_truth_queue_ahead: u64,
}

impl Default for NarrationConfig {
    fn default() -> Self {
        Self {
            require_latest_media_contents: true,
            max_truth_queue_ahead: 4096,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FollowerConfig {
    /// Capacity of the follower broadcast channel of each session.
    pub channel_capacity: usize,
}

impl Default for FollowerConfig {
    fn default() -> Self {
        Self { channel_capacity: 256 }
    }
}

impl OracleConfig {
    pub fn from_toml_str(s: &str) -> OracleResult<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Configuration of the scribe behind the sessions.
    pub fn scribe_config(&self) -> ScribeConfig {
        ScribeConfig {
            transient: self.storage.transient,
            retrieval: self.retrieval.clone(),
        }
    }

    /// Open the configured local storage.
    pub fn open_storage(&self) -> OracleResult<Arc<dyn LocalStorage>> {
        match &self.storage.journal {
            Some(path) => {
                info!(path = %path.display(), "opening journal storage");
                Ok(Arc::new(FileStorage::open(path, self.storage.journal_config.clone())?))
            }
            None => Ok(Arc::new(InMemoryStorage::new())),
        }
    }
}
