use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::Compression;
use crate::error::{NodeStoreError, NodeStoreResult};
use crate::memory::MemoryBackend;
use crate::null::NullBackend;
use crate::redb_backend::RedbBackend;
use crate::traits::Backend;

/// Which backend engine to construct.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    Redb,
    None,
}

/// Node store settings.
///
/// ```toml
/// backend = "redb"
/// path = "/var/lib/ledger/nodes.redb"
/// compression = "zstd"
/// cache_size = 16384
/// cache_age_secs = 300
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeStoreConfig {
    pub backend: BackendKind,
    /// Database file; required by persistent backends.
    pub path: Option<PathBuf>,
    pub compression: Compression,
    /// Target number of decoded objects kept in memory.
    pub cache_size: usize,
    /// Idle time after which an unpinned cached object may be swept.
    pub cache_age_secs: u64,
}

impl Default for NodeStoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            path: None,
            compression: Compression::None,
            cache_size: 16384,
            cache_age_secs: 300,
        }
    }
}

impl NodeStoreConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(s: &str) -> NodeStoreResult<Self> {
        let config: Self = toml::from_str(s).map_err(|e| NodeStoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the settings describe a usable store.
    pub fn validate(&self) -> NodeStoreResult<()> {
        if self.backend == BackendKind::Redb && self.path.is_none() {
            return Err(NodeStoreError::Config(
                "the redb backend requires a path".to_string(),
            ));
        }
        Ok(())
    }

    pub fn cache_age(&self) -> Duration {
        Duration::from_secs(self.cache_age_secs)
    }
}

/// Construct the backend selected by `config`.
pub fn make_backend(config: &NodeStoreConfig) -> NodeStoreResult<Arc<dyn Backend>> {
    config.validate()?;
    let backend: Arc<dyn Backend> = match config.backend {
        BackendKind::Memory => Arc::new(MemoryBackend::new()),
        BackendKind::None => Arc::new(NullBackend),
        BackendKind::Redb => {
            let path = config
                .path
                .as_deref()
                .ok_or_else(|| NodeStoreError::Config("missing path".to_string()))?;
            Arc::new(RedbBackend::open(path, config.compression)?)
        }
    };
    Ok(backend)
}
