use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shamap_cache::TaggedCache;
use shamap_nodestore::{NodeDatabase, NodeObjectType, NodeStoreConfig, NodeStoreError};
use shamap_types::Hash256;
use tracing::{trace, warn};

use crate::error::{ShaMapError, ShaMapResult};
use crate::node::TreeNode;

/// Decoded tree nodes shared by every map of a family, keyed by node hash.
pub type TreeNodeCache = TaggedCache<Hash256, TreeNode>;

/// Settings for a [`Family`].
///
/// ```toml
/// tree_cache_size = 65536
/// tree_cache_age_secs = 60
///
/// [node_store]
/// backend = "redb"
/// path = "/var/lib/ledger/nodes.redb"
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FamilyConfig {
    pub node_store: NodeStoreConfig,
    pub tree_cache_size: usize,
    pub tree_cache_age_secs: u64,
}

impl Default for FamilyConfig {
    fn default() -> Self {
        Self {
            node_store: NodeStoreConfig::default(),
            tree_cache_size: 65536,
            tree_cache_age_secs: 60,
        }
    }
}

impl FamilyConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(s: &str) -> ShaMapResult<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| NodeStoreError::Config(e.to_string()))?;
        config.node_store.validate()?;
        Ok(config)
    }
}

/// The shared services behind a set of maps: the node database and the
/// tree-node cache.
///
/// Built once at startup and handed to every backed map. Cloning is cheap
/// and clones share both services.
#[derive(Clone, Debug)]
pub struct Family {
    db: Arc<NodeDatabase>,
    cache: Arc<TreeNodeCache>,
}

impl Family {
    pub fn new(db: Arc<NodeDatabase>, cache: Arc<TreeNodeCache>) -> Self {
        Self { db, cache }
    }

    /// Open the node store and create the cache described by `config`.
    pub fn open(config: &FamilyConfig) -> ShaMapResult<Self> {
        let db = NodeDatabase::open(&config.node_store)?;
        let cache = TreeNodeCache::new(
            "tree-nodes",
            config.tree_cache_size,
            Duration::from_secs(config.tree_cache_age_secs),
        );
        Ok(Self::new(Arc::new(db), Arc::new(cache)))
    }

    /// A family over an unbounded in-memory store.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(NodeDatabase::in_memory()),
            Arc::new(TreeNodeCache::new("tree-nodes", 0, Duration::from_secs(60))),
        )
    }

    pub fn db(&self) -> &Arc<NodeDatabase> {
        &self.db
    }

    pub fn tree_cache(&self) -> &Arc<TreeNodeCache> {
        &self.cache
    }

    /// Load the node with `hash`, from the cache or else from the store.
    ///
    /// Stored bytes must decode and hash back to `hash`; a mismatch is
    /// [`ShaMapError::CorruptNode`]. Returns `Ok(None)` if the store does
    /// not have the node.
    pub fn fetch_node(&self, hash: &Hash256) -> ShaMapResult<Option<Arc<TreeNode>>> {
        if let Some(node) = self.cache.fetch(hash) {
            return Ok(Some(node));
        }
        let Some(object) = self.db.fetch(hash)? else {
            return Ok(None);
        };
        let node = TreeNode::from_wire(&object.data)?;
        if node.hash() != *hash {
            warn!(expected = %hash, actual = %node.hash(), "stored node hash mismatch");
            return Err(ShaMapError::corrupt(format!(
                "stored node {} hashes to {}",
                hash,
                node.hash()
            )));
        }
        node.mark_written();
        trace!(hash = %hash.short_hex(), "tree node loaded");
        Ok(Some(self.cache.canonicalize(*hash, Arc::new(node))))
    }

    /// Persist a single node as `kind` and mark it written, so later
    /// flushes skip it.
    pub fn store_node(&self, node: &TreeNode, kind: NodeObjectType) -> ShaMapResult<()> {
        self.db.store(kind, node.hash(), node.to_wire().into())?;
        node.mark_written();
        Ok(())
    }

    /// Make `node` the shared instance for `hash` unless one is cached.
    pub fn canonicalize(&self, hash: Hash256, node: Arc<TreeNode>) -> Arc<TreeNode> {
        self.cache.canonicalize(hash, node)
    }

    /// Evict idle entries from both caches.
    pub fn sweep(&self) -> usize {
        self.cache.sweep() + self.db.sweep()
    }
}
