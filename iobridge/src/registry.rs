/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Create and destroy orchestration across tables and ownership edges.
//!
//! Lock order is always the ownership index first, then class guards. Native
//! create and destroy calls run with no registry lock held.

use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use crate::config::HandleDiscipline;
use crate::config::RegistryConfig;
use crate::error::BridgeError;
use crate::handle::Handle;
use crate::handle::NativePtr;
use crate::handle::ResourceClass;
use crate::ownership::Edge;
use crate::ownership::EdgePolicy;
use crate::ownership::OwnershipIndex;
use crate::ownership::ResourceKey;
use crate::table::ErasedTable;
use crate::table::HandleTable;

/// A parent a new resource is linked to on creation.
pub struct Parent<'a> {
    table: &'a dyn ErasedTable,
    handle: Handle,
    policy: EdgePolicy,
}

impl<'a> Parent<'a> {
    /// The child is invalidated when this parent is destroyed.
    pub fn cascade(table: &'a dyn ErasedTable, handle: Handle) -> Self {
        Self {
            table,
            handle,
            policy: EdgePolicy::Cascade,
        }
    }

    /// This parent cannot be destroyed while the child lives.
    pub fn reject(table: &'a dyn ErasedTable, handle: Handle) -> Self {
        Self {
            table,
            handle,
            policy: EdgePolicy::Reject,
        }
    }

    fn key(&self) -> ResourceKey {
        ResourceKey::new(self.table.class(), self.handle)
    }
}

/// Coordinates handle tables and the ownership index of one dispatcher.
#[derive(Debug)]
pub struct Registry {
    discipline: HandleDiscipline,
    edges: Mutex<OwnershipIndex>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// A registry using the indirect discipline.
    pub fn new() -> Self {
        Self {
            discipline: HandleDiscipline::Indirect,
            edges: Mutex::new(OwnershipIndex::default()),
        }
    }

    /// A registry following `config`.
    ///
    /// # Safety
    ///
    /// If `config` selects [`HandleDiscipline::Direct`], handles are
    /// reinterpreted as pointers without validation. The caller guarantees
    /// that every handle passed back names a live object and that no handle is
    /// used concurrently with, or after, its destroy.
    pub unsafe fn with_config(config: &RegistryConfig) -> Self {
        tracing::info!("handle registry using {} discipline", config.discipline);
        Self {
            discipline: config.discipline,
            edges: Mutex::new(OwnershipIndex::default()),
        }
    }

    /// The discipline every table of this registry follows.
    pub fn discipline(&self) -> HandleDiscipline {
        self.discipline
    }

    /// Builds a table following the registry's discipline.
    pub fn table<T>(&self, class: ResourceClass) -> HandleTable<T> {
        match self.discipline {
            HandleDiscipline::Indirect => HandleTable::indirect(class),
            // SAFETY: a direct registry is only built by `with_config`, whose
            // caller accepted the direct discipline contract.
            HandleDiscipline::Direct => unsafe { HandleTable::direct(class) },
        }
    }

    fn edges(&self) -> MutexGuard<'_, OwnershipIndex> {
        self.edges.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Issues a handle for a freshly created native object and links it to its
    /// parents.
    ///
    /// `ptr` is `None` when the native create call returned null; no handle is
    /// issued then. If a parent was destroyed while the native object was being
    /// created, the object is handed to `discard` and the parent's `NotFound`
    /// is returned.
    pub fn adopt<T>(
        &self,
        table: &HandleTable<T>,
        ptr: Option<NativePtr<T>>,
        parents: &[Parent<'_>],
        discard: impl FnOnce(NativePtr<T>),
    ) -> Result<Handle, BridgeError> {
        let Some(ptr) = ptr else {
            tracing::warn!("native create of {} returned null", table.class());
            return Err(BridgeError::AllocationFailed {
                class: table.class(),
            });
        };
        if self.discipline == HandleDiscipline::Direct {
            return Ok(table.insert(ptr));
        }

        let mut edges = self.edges();
        if let Some(gone) = parents.iter().find(|p| !p.table.contains_handle(p.handle)) {
            let err = BridgeError::NotFound {
                class: gone.table.class(),
                handle: gone.handle,
            };
            drop(edges);
            tracing::warn!(
                "{} parent {} vanished during create, discarding new object",
                table.class(),
                gone.key()
            );
            discard(ptr);
            return Err(err);
        }
        let handle = table.insert(ptr);
        let child = ResourceKey::new(table.class(), handle);
        for parent in parents {
            edges.link(Edge {
                parent: parent.key(),
                child,
                policy: parent.policy,
            });
        }
        Ok(handle)
    }

    /// Destroys the resource named by `handle`.
    ///
    /// Under the indirect discipline the entry, and every entry it cascades
    /// into, is removed before `destroy` runs, so no concurrent lookup can
    /// return a pointer whose destroy is in flight. If `destroy` fails, all
    /// entries and edges are restored and the error returned. `dependents`
    /// must hold the table of every class the resource cascades into.
    ///
    /// Under the direct discipline `destroy` is the only authority.
    pub fn release<T>(
        &self,
        table: &HandleTable<T>,
        handle: Handle,
        dependents: &[&dyn ErasedTable],
        destroy: impl FnOnce(NativePtr<T>) -> Result<(), BridgeError>,
    ) -> Result<(), BridgeError> {
        if self.discipline == HandleDiscipline::Direct {
            return destroy(table.lookup(handle)?);
        }

        let root = ResourceKey::new(table.class(), handle);
        let (ptr, taken, detached) = {
            let mut edges = self.edges();
            let ptr = table.lookup(handle)?;
            let closure = edges.cascade_closure(root);
            let blocking = edges.blocking_children(root, &closure);
            if blocking > 0 {
                return Err(BridgeError::ResourceBusy {
                    class: root.class,
                    handle,
                    children: blocking,
                });
            }
            if let Some(missing) = closure
                .iter()
                .find(|key| !dependents.iter().any(|t| t.class() == key.class))
            {
                return Err(BridgeError::invalid(format!(
                    "no {} table supplied to release {}",
                    missing.class, root
                )));
            }

            let mut taken = Vec::with_capacity(closure.len());
            for key in &closure {
                for dependent in dependents.iter().filter(|t| t.class() == key.class) {
                    if let Some(child) = dependent.take_erased(key.handle) {
                        taken.push((*dependent, key.handle, child));
                    }
                }
            }
            table.remove(handle)?;
            let mut detached = edges.detach(root);
            for key in &closure {
                detached.extend(edges.detach(*key));
            }
            (ptr, taken, detached)
        };

        match destroy(ptr) {
            Ok(()) => {
                for (dependent, child, _) in &taken {
                    tracing::debug!("{} {} released with {}", dependent.class(), child, root);
                }
                Ok(())
            }
            Err(err) => {
                tracing::warn!("native destroy of {} failed: {}, restoring", root, err);
                let mut edges = self.edges();
                table.restore(handle, ptr);
                for (dependent, child, child_ptr) in taken {
                    dependent.put_erased(child, child_ptr);
                }
                edges.reattach(detached);
                Err(err)
            }
        }
    }

    /// The owner of `child` within `class`. Always `None` under the direct
    /// discipline, which keeps no edges.
    pub fn parent_of(&self, child: ResourceKey, class: ResourceClass) -> Option<Handle> {
        self.edges().parent_of(child, class).map(|key| key.handle)
    }

    /// Live children of `parent` within `class`.
    pub fn children_of(&self, parent: ResourceKey, class: ResourceClass) -> Vec<Handle> {
        self.edges()
            .children(parent)
            .iter()
            .filter(|edge| edge.child.class == class)
            .map(|edge| edge.child.handle)
            .collect()
    }

    /// Number of recorded ownership edges.
    pub fn edge_count(&self) -> usize {
        self.edges().len()
    }
}
