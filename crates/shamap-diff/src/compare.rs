//! Lockstep comparison of two maps.

use std::sync::Arc;

use shamap::{NodeId, ShaMap, ShaMapItem, TreeNode, BRANCH_FACTOR};
use shamap_types::Hash256;
use tracing::debug;

use crate::error::{DiffError, DiffResult};

/// The items that differ between an old and a new map.
///
/// Each list is in ascending key order.
#[derive(Clone, Debug, Default)]
pub struct MapDiff {
    /// Items only in the new map.
    pub added: Vec<Arc<ShaMapItem>>,
    /// Items only in the old map.
    pub removed: Vec<Arc<ShaMapItem>>,
    /// Keys present in both maps with different data.
    pub changed: Vec<ItemChange>,
}

impl MapDiff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the maps hold the same items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of differing keys.
    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len() + self.changed.len()
    }

    fn sort(&mut self) {
        self.added.sort_by(|a, b| a.key().cmp(b.key()));
        self.removed.sort_by(|a, b| a.key().cmp(b.key()));
        self.changed.sort_by(|a, b| a.key().cmp(b.key()));
    }
}

/// One key whose data differs between the two maps.
#[derive(Clone, Debug)]
pub struct ItemChange {
    pub old: Arc<ShaMapItem>,
    pub new: Arc<ShaMapItem>,
}

impl ItemChange {
    pub fn key(&self) -> &Hash256 {
        self.old.key()
    }
}

/// Compare `old` with `new`.
///
/// Loads nodes of either map on demand; a node that cannot be loaded fails
/// the comparison with [`DiffError::ShaMap`].
pub fn compare(old: &ShaMap, new: &ShaMap) -> DiffResult<MapDiff> {
    run(old, new, None)
}

/// Like [`compare`], but gives up with [`DiffError::TooManyDifferences`]
/// once more than `max` keys differ.
pub fn compare_bounded(old: &ShaMap, new: &ShaMap, max: usize) -> DiffResult<MapDiff> {
    run(old, new, Some(max))
}

fn run(old: &ShaMap, new: &ShaMap, limit: Option<usize>) -> DiffResult<MapDiff> {
    let mut walk = Walk {
        old,
        new,
        limit,
        diff: MapDiff::new(),
    };
    walk.nodes(old.root(), new.root(), &NodeId::root())?;
    let mut diff = walk.diff;
    diff.sort();
    debug!(
        added = diff.added.len(),
        removed = diff.removed.len(),
        changed = diff.changed.len(),
        "maps compared"
    );
    Ok(diff)
}

struct Walk<'a> {
    old: &'a ShaMap,
    new: &'a ShaMap,
    limit: Option<usize>,
    diff: MapDiff,
}

impl Walk<'_> {
    fn check_limit(&self) -> DiffResult<()> {
        match self.limit {
            Some(limit) if self.diff.len() > limit => Err(DiffError::TooManyDifferences { limit }),
            _ => Ok(()),
        }
    }

    fn added(&mut self, item: Arc<ShaMapItem>) -> DiffResult<()> {
        self.diff.added.push(item);
        self.check_limit()
    }

    fn removed(&mut self, item: Arc<ShaMapItem>) -> DiffResult<()> {
        self.diff.removed.push(item);
        self.check_limit()
    }

    /// Record `old` and `new`, which share a key, if their data differs.
    /// Leaves that differ only in kind are not a change of content.
    fn matched(&mut self, old: &Arc<ShaMapItem>, new: &Arc<ShaMapItem>) -> DiffResult<()> {
        if old.data() == new.data() {
            return Ok(());
        }
        self.diff.changed.push(ItemChange {
            old: Arc::clone(old),
            new: Arc::clone(new),
        });
        self.check_limit()
    }

    fn nodes(&mut self, old: &Arc<TreeNode>, new: &Arc<TreeNode>, id: &NodeId) -> DiffResult<()> {
        if old.hash() == new.hash() {
            return Ok(());
        }
        match (&**old, &**new) {
            (TreeNode::Leaf(a), TreeNode::Leaf(b)) => {
                if a.key() == b.key() {
                    self.matched(a.item(), b.item())
                } else {
                    self.removed(Arc::clone(a.item()))?;
                    self.added(Arc::clone(b.item()))
                }
            }
            (TreeNode::Inner(_), TreeNode::Leaf(b)) => {
                let items = self.old.leaves_below(old, id)?;
                self.leaf_against(items, b.item(), false)
            }
            (TreeNode::Leaf(a), TreeNode::Inner(_)) => {
                let items = self.new.leaves_below(new, id)?;
                self.leaf_against(items, a.item(), true)
            }
            (TreeNode::Inner(a), TreeNode::Inner(b)) => {
                for branch in 0..BRANCH_FACTOR as u8 {
                    if a.child_hash(branch) == b.child_hash(branch) {
                        continue;
                    }
                    let child_id = id.child(branch);
                    let old_child = self.old.child_node(a, id, branch)?;
                    let new_child = self.new.child_node(b, id, branch)?;
                    match (old_child, new_child) {
                        (Some(x), Some(y)) => self.nodes(&x, &y, &child_id)?,
                        (Some(x), None) => {
                            for item in self.old.leaves_below(&x, &child_id)? {
                                self.removed(item)?;
                            }
                        }
                        (None, Some(y)) => {
                            for item in self.new.leaves_below(&y, &child_id)? {
                                self.added(item)?;
                            }
                        }
                        (None, None) => {}
                    }
                }
                Ok(())
            }
        }
    }

    /// One side holds a subtree with `items`, the other a single leaf at
    /// the same position. `leaf_is_old` tells which side the leaf is on.
    fn leaf_against(
        &mut self,
        items: Vec<Arc<ShaMapItem>>,
        leaf: &Arc<ShaMapItem>,
        leaf_is_old: bool,
    ) -> DiffResult<()> {
        let mut found = false;
        for item in items {
            if item.key() == leaf.key() {
                found = true;
                if leaf_is_old {
                    self.matched(leaf, &item)?;
                } else {
                    self.matched(&item, leaf)?;
                }
            } else if leaf_is_old {
                self.added(item)?;
            } else {
                self.removed(item)?;
            }
        }
        if !found {
            if leaf_is_old {
                self.removed(Arc::clone(leaf))?;
            } else {
                self.added(Arc::clone(leaf))?;
            }
        }
        Ok(())
    }
}
