use std::path::{Path, PathBuf};

use redb::{Database, ReadableTable, TableDefinition};
use shamap_types::Hash256;
use tracing::{debug, info};

use crate::codec::{self, Compression};
use crate::error::{NodeStoreError, NodeStoreResult};
use crate::object::NodeObject;
use crate::traits::Backend;

/// Single table: node hash → encoded blob.
const NODES: TableDefinition<&[u8; 32], &[u8]> = TableDefinition::new("nodes");

const NAME: &str = "redb";

/// Persistent backend on top of the embedded redb B-tree engine.
///
/// Every `store_batch` is one write transaction, so a batch is either fully
/// durable or not written at all. Readers run against MVCC snapshots and
/// never block writers.
pub struct RedbBackend {
    db: Database,
    path: PathBuf,
    compression: Compression,
}

impl RedbBackend {
    /// Open (or create) a database file at `path`.
    pub fn open(path: &Path, compression: Compression) -> NodeStoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(|e| NodeStoreError::backend(NAME, e))?;

        // Create the table up front so read transactions can always open it.
        let tx = db.begin_write().map_err(|e| NodeStoreError::backend(NAME, e))?;
        tx.open_table(NODES)
            .map_err(|e| NodeStoreError::backend(NAME, e))?;
        tx.commit().map_err(|e| NodeStoreError::backend(NAME, e))?;

        info!(path = %path.display(), ?compression, "opened redb node store");
        Ok(Self {
            db,
            path: path.to_path_buf(),
            compression,
        })
    }

    /// Location of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_all(&self, batch: &[NodeObject]) -> NodeStoreResult<()> {
        let encoded = batch
            .iter()
            .map(|obj| codec::encode(obj, self.compression).map(|blob| (obj.hash, blob)))
            .collect::<NodeStoreResult<Vec<_>>>()?;

        let tx = self
            .db
            .begin_write()
            .map_err(|e| NodeStoreError::backend(NAME, e))?;
        {
            let mut table = tx
                .open_table(NODES)
                .map_err(|e| NodeStoreError::backend(NAME, e))?;
            for (hash, blob) in &encoded {
                table
                    .insert(hash.as_bytes(), blob.as_slice())
                    .map_err(|e| NodeStoreError::backend(NAME, e))?;
            }
        }
        tx.commit().map_err(|e| NodeStoreError::backend(NAME, e))?;
        Ok(())
    }
}

impl Backend for RedbBackend {
    fn name(&self) -> &str {
        NAME
    }

    fn fetch(&self, hash: &Hash256) -> NodeStoreResult<Option<NodeObject>> {
        let tx = self
            .db
            .begin_read()
            .map_err(|e| NodeStoreError::backend(NAME, e))?;
        let table = tx
            .open_table(NODES)
            .map_err(|e| NodeStoreError::backend(NAME, e))?;
        let guard = table
            .get(hash.as_bytes())
            .map_err(|e| NodeStoreError::backend(NAME, e))?;
        match guard {
            Some(blob) => codec::decode(*hash, blob.value()).map(Some),
            None => Ok(None),
        }
    }

    fn store(&self, object: &NodeObject) -> NodeStoreResult<()> {
        self.write_all(std::slice::from_ref(object))
    }

    fn store_batch(&self, batch: &[NodeObject]) -> NodeStoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.write_all(batch)?;
        debug!(count = batch.len(), "redb batch committed");
        Ok(())
    }

    fn exists(&self, hash: &Hash256) -> NodeStoreResult<bool> {
        let tx = self
            .db
            .begin_read()
            .map_err(|e| NodeStoreError::backend(NAME, e))?;
        let table = tx
            .open_table(NODES)
            .map_err(|e| NodeStoreError::backend(NAME, e))?;
        let found = table
            .get(hash.as_bytes())
            .map_err(|e| NodeStoreError::backend(NAME, e))?
            .is_some();
        Ok(found)
    }

    fn for_each(&self, f: &mut dyn FnMut(NodeObject)) -> NodeStoreResult<()> {
        let tx = self
            .db
            .begin_read()
            .map_err(|e| NodeStoreError::backend(NAME, e))?;
        let table = tx
            .open_table(NODES)
            .map_err(|e| NodeStoreError::backend(NAME, e))?;
        let range = table.iter().map_err(|e| NodeStoreError::backend(NAME, e))?;
        for entry in range {
            let (key, value) = entry.map_err(|e| NodeStoreError::backend(NAME, e))?;
            let hash = Hash256::from_hash(*key.value());
            f(codec::decode(hash, value.value())?);
        }
        Ok(())
    }
}

impl std::fmt::Debug for RedbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbBackend")
            .field("path", &self.path)
            .field("compression", &self.compression)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::NodeObjectType;

    fn make_object(n: u64) -> NodeObject {
        NodeObject::new(
            NodeObjectType::AccountNode,
            Hash256::from_low_u64(n),
            format!("node-{n}-payload-payload-payload").into_bytes(),
        )
    }

    fn open(dir: &tempfile::TempDir, compression: Compression) -> RedbBackend {
        RedbBackend::open(&dir.path().join("nodes.redb"), compression).unwrap()
    }

    #[test]
    fn store_and_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let backend = open(&dir, Compression::None);
        let obj = make_object(1);
        backend.store(&obj).unwrap();
        assert_eq!(backend.fetch(&obj.hash).unwrap(), Some(obj.clone()));
        assert!(backend.exists(&obj.hash).unwrap());
        assert!(!backend.exists(&Hash256::from_low_u64(2)).unwrap());
    }

    #[test]
    fn compressed_objects_read_back_identically() {
        let dir = tempfile::tempdir().unwrap();
        let backend = open(&dir, Compression::Zstd);
        let batch: Vec<NodeObject> = (0..20).map(make_object).collect();
        backend.store_batch(&batch).unwrap();
        for obj in &batch {
            assert_eq!(backend.fetch(&obj.hash).unwrap().as_ref(), Some(obj));
        }
    }

    #[test]
    fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let batch: Vec<NodeObject> = (0..5).map(make_object).collect();
        {
            let backend = open(&dir, Compression::None);
            backend.store_batch(&batch).unwrap();
        }
        let backend = open(&dir, Compression::None);
        let mut count = 0;
        backend
            .for_each(&mut |obj| {
                assert!(batch.contains(&obj));
                count += 1;
            })
            .unwrap();
        assert_eq!(count, 5);
    }

    #[test]
    fn empty_batch_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let backend = open(&dir, Compression::None);
        backend.store_batch(&[]).unwrap();
        let mut count = 0;
        backend.for_each(&mut |_| count += 1).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn name_is_redb() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(open(&dir, Compression::None).name(), "redb");
    }
}
