/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Parent to children edges between resources.

use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::handle::Handle;
use crate::handle::ResourceClass;

/// A handle qualified by its class.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    /// Class of the resource.
    pub class: ResourceClass,
    /// Handle within the class.
    pub handle: Handle,
}

impl ResourceKey {
    /// Qualifies `handle` with `class`.
    pub fn new(class: ResourceClass, handle: Handle) -> Self {
        Self { class, handle }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class, self.handle)
    }
}

/// What destroying a parent does to a live child.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgePolicy {
    /// The child's handle is invalidated together with the parent.
    Cascade,
    /// The parent's destroy fails with `ResourceBusy` while the child lives.
    Reject,
}

/// One ownership edge.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Edge {
    /// Owning resource.
    pub parent: ResourceKey,
    /// Owned resource.
    pub child: ResourceKey,
    /// Effect of destroying the parent.
    pub policy: EdgePolicy,
}

/// Index of ownership edges, keyed both ways.
#[derive(Debug, Default)]
pub struct OwnershipIndex {
    children: HashMap<ResourceKey, Vec<Edge>>,
    parents: HashMap<ResourceKey, Vec<ResourceKey>>,
}

impl OwnershipIndex {
    /// Records an edge. Linking the same edge twice is a no-op.
    pub fn link(&mut self, edge: Edge) {
        let children = self.children.entry(edge.parent).or_default();
        if children.contains(&edge) {
            return;
        }
        children.push(edge);
        self.parents.entry(edge.child).or_default().push(edge.parent);
    }

    /// Edges out of `parent`.
    pub fn children(&self, parent: ResourceKey) -> &[Edge] {
        self.children.get(&parent).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The owner of `child` within `class`, if any.
    pub fn parent_of(&self, child: ResourceKey, class: ResourceClass) -> Option<ResourceKey> {
        self.parents
            .get(&child)?
            .iter()
            .find(|parent| parent.class == class)
            .copied()
    }

    /// Every resource invalidated by destroying `root`, following cascade edges
    /// transitively. `root` itself is not included.
    pub fn cascade_closure(&self, root: ResourceKey) -> Vec<ResourceKey> {
        let mut seen = HashSet::from([root]);
        let mut closure = Vec::new();
        let mut pending = vec![root];
        while let Some(key) = pending.pop() {
            for edge in self.children(key) {
                if edge.policy == EdgePolicy::Cascade && seen.insert(edge.child) {
                    closure.push(edge.child);
                    pending.push(edge.child);
                }
            }
        }
        closure
    }

    /// Number of children that block destroying `root`: reject edges out of
    /// `root` or out of anything it cascades into, whose child would survive.
    pub fn blocking_children(&self, root: ResourceKey, closure: &[ResourceKey]) -> usize {
        let doomed: HashSet<_> = closure.iter().copied().chain([root]).collect();
        doomed
            .iter()
            .flat_map(|key| self.children(*key))
            .filter(|edge| edge.policy == EdgePolicy::Reject && !doomed.contains(&edge.child))
            .map(|edge| edge.child)
            .collect::<HashSet<_>>()
            .len()
    }

    /// Removes every edge touching `key` and returns them.
    pub fn detach(&mut self, key: ResourceKey) -> Vec<Edge> {
        let mut removed = Vec::new();
        if let Some(edges) = self.children.remove(&key) {
            for edge in &edges {
                if let Some(parents) = self.parents.get_mut(&edge.child) {
                    parents.retain(|parent| *parent != key);
                    if parents.is_empty() {
                        self.parents.remove(&edge.child);
                    }
                }
            }
            removed.extend(edges);
        }
        if let Some(parents) = self.parents.remove(&key) {
            for parent in parents {
                if let Some(edges) = self.children.get_mut(&parent) {
                    edges.retain(|edge| {
                        if edge.child == key {
                            removed.push(*edge);
                            false
                        } else {
                            true
                        }
                    });
                    if edges.is_empty() {
                        self.children.remove(&parent);
                    }
                }
            }
        }
        removed
    }

    /// Puts back edges returned by [`OwnershipIndex::detach`].
    pub fn reattach(&mut self, edges: Vec<Edge>) {
        for edge in edges {
            self.link(edge);
        }
    }

    /// Total number of edges.
    pub fn len(&self) -> usize {
        self.children.values().map(Vec::len).sum()
    }

    /// Whether no edges are recorded.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}
