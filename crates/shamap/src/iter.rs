//! Ordered traversal and key navigation.

use std::sync::Arc;

use shamap_types::Hash256;

use crate::error::ShaMapResult;
use crate::item::ShaMapItem;
use crate::map::ShaMap;
use crate::node::{InnerNode, TreeNode, BRANCH_FACTOR};
use crate::node_id::NodeId;

struct Frame {
    node: Arc<TreeNode>,
    id: NodeId,
    next: u8,
}

/// Items of a map in ascending key order.
///
/// Nodes are loaded as the walk reaches them. A load failure is yielded
/// once and ends the iteration.
pub struct Iter<'a> {
    map: &'a ShaMap,
    stack: Vec<Frame>,
}

impl<'a> Iter<'a> {
    fn new(map: &'a ShaMap) -> Self {
        Self {
            map,
            stack: vec![Frame {
                node: Arc::clone(map.root()),
                id: NodeId::root(),
                next: 0,
            }],
        }
    }
}

impl Iterator for Iter<'_> {
    type Item = ShaMapResult<Arc<ShaMapItem>>;

    fn next(&mut self) -> Option<Self::Item> {
        let loader = self.map.loader();
        loop {
            let frame = self.stack.last_mut()?;
            let branch = frame.next;
            if branch as usize >= BRANCH_FACTOR {
                self.stack.pop();
                continue;
            }
            frame.next += 1;
            let TreeNode::Inner(inner) = &*frame.node else {
                self.stack.pop();
                continue;
            };
            let child = match loader.child(inner, &frame.id, branch) {
                Ok(Some(child)) => child,
                Ok(None) => continue,
                Err(e) => {
                    self.stack.clear();
                    return Some(Err(e));
                }
            };
            if let TreeNode::Leaf(leaf) = &*child {
                return Some(Ok(Arc::clone(leaf.item())));
            }
            let id = frame.id.child(branch);
            self.stack.push(Frame {
                node: child,
                id,
                next: 0,
            });
        }
    }
}

impl<'a> IntoIterator for &'a ShaMap {
    type Item = ShaMapResult<Arc<ShaMapItem>>;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl ShaMap {
    /// Walk every item in ascending key order. Each call starts a fresh
    /// walk.
    pub fn iter(&self) -> Iter<'_> {
        Iter::new(self)
    }

    /// The first item whose key is strictly greater than `key`.
    pub fn upper_bound(&self, key: &Hash256) -> ShaMapResult<Option<Arc<ShaMapItem>>> {
        self.first_above(self.root_inner(), &NodeId::root(), key)
    }

    /// The last item whose key is strictly less than `key`.
    pub fn lower_bound(&self, key: &Hash256) -> ShaMapResult<Option<Arc<ShaMapItem>>> {
        self.last_below(self.root_inner(), &NodeId::root(), key)
    }

    fn first_above(
        &self,
        inner: &InnerNode,
        id: &NodeId,
        key: &Hash256,
    ) -> ShaMapResult<Option<Arc<ShaMapItem>>> {
        let start = id.select_branch(key);
        for branch in start..BRANCH_FACTOR as u8 {
            let Some(child) = self.child_node(inner, id, branch)? else {
                continue;
            };
            let found = match &*child {
                TreeNode::Leaf(leaf) => (leaf.key() > key).then(|| Arc::clone(leaf.item())),
                TreeNode::Inner(child_inner) if branch == start => {
                    self.first_above(child_inner, &id.child(branch), key)?
                }
                TreeNode::Inner(child_inner) => self.edge_item(child_inner, &id.child(branch), true)?,
            };
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    fn last_below(
        &self,
        inner: &InnerNode,
        id: &NodeId,
        key: &Hash256,
    ) -> ShaMapResult<Option<Arc<ShaMapItem>>> {
        let start = id.select_branch(key);
        for branch in (0..=start).rev() {
            let Some(child) = self.child_node(inner, id, branch)? else {
                continue;
            };
            let found = match &*child {
                TreeNode::Leaf(leaf) => (leaf.key() < key).then(|| Arc::clone(leaf.item())),
                TreeNode::Inner(child_inner) if branch == start => {
                    self.last_below(child_inner, &id.child(branch), key)?
                }
                TreeNode::Inner(child_inner) => self.edge_item(child_inner, &id.child(branch), false)?,
            };
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    /// The smallest (`first`) or largest item below `inner`.
    fn edge_item(
        &self,
        inner: &InnerNode,
        id: &NodeId,
        first: bool,
    ) -> ShaMapResult<Option<Arc<ShaMapItem>>> {
        let branches: Vec<u8> = if first {
            (0..BRANCH_FACTOR as u8).collect()
        } else {
            (0..BRANCH_FACTOR as u8).rev().collect()
        };
        for branch in branches {
            let Some(child) = self.child_node(inner, id, branch)? else {
                continue;
            };
            return match &*child {
                TreeNode::Leaf(leaf) => Ok(Some(Arc::clone(leaf.item()))),
                TreeNode::Inner(child_inner) => self.edge_item(child_inner, &id.child(branch), first),
            };
        }
        Ok(None)
    }
}
