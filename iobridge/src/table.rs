/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Per-class handle tables.
//!
//! A table runs in one of two modes:
//! - indirect: handles come from a per-class counter and are never reissued,
//!   lookups of destroyed handles fail with `NotFound` even after the native
//!   allocator hands the same address to a new object.
//! - direct: the handle is the pointer, no map and no lock; the caller owns
//!   liveness.

use std::collections::HashMap;

use crate::boundary;
use crate::config::HandleDiscipline;
use crate::error::BridgeError;
use crate::guard::ClassGuard;
use crate::handle::Handle;
use crate::handle::NativePtr;
use crate::handle::ResourceClass;

/// Bits of an indirect handle below the class tag.
const SEQUENCE_BITS: u32 = 48;

/// Live entries of an indirect table.
struct Slots<T> {
    entries: HashMap<Handle, NativePtr<T>>,
    by_ptr: HashMap<NativePtr<T>, Handle>,
    // Next handle value: the class tag in the top bits, a sequence starting at
    // 1 below it. Values are never reissued.
    next: u64,
}

impl<T> Slots<T> {
    fn new(class: ResourceClass) -> Self {
        Self {
            entries: HashMap::new(),
            by_ptr: HashMap::new(),
            next: ((class as u64 + 1) << SEQUENCE_BITS) | 1,
        }
    }

    fn put(&mut self, handle: Handle, ptr: NativePtr<T>) {
        self.entries.insert(handle, ptr);
        self.by_ptr.insert(ptr, handle);
    }

    fn take(&mut self, handle: Handle) -> Option<NativePtr<T>> {
        let ptr = self.entries.remove(&handle)?;
        if self.by_ptr.get(&ptr) == Some(&handle) {
            self.by_ptr.remove(&ptr);
        }
        Some(ptr)
    }
}

enum Mode<T> {
    Indirect(ClassGuard<Slots<T>>),
    Direct,
}

/// Handle table for one resource class.
pub struct HandleTable<T> {
    class: ResourceClass,
    mode: Mode<T>,
}

impl<T> HandleTable<T> {
    /// Creates a locked indirection table.
    pub fn indirect(class: ResourceClass) -> Self {
        Self {
            class,
            mode: Mode::Indirect(ClassGuard::new(class, Slots::new(class))),
        }
    }

    /// Creates a direct pointer-as-handle table.
    ///
    /// # Safety
    ///
    /// Lookups reinterpret caller-supplied handles as pointers without any
    /// check. The caller guarantees every handle passed back names a live
    /// object and that no handle is used concurrently with its destroy.
    pub unsafe fn direct(class: ResourceClass) -> Self {
        Self {
            class,
            mode: Mode::Direct,
        }
    }

    /// The class this table serves.
    pub fn class(&self) -> ResourceClass {
        self.class
    }

    /// The discipline this table follows.
    pub fn discipline(&self) -> HandleDiscipline {
        match self.mode {
            Mode::Indirect(_) => HandleDiscipline::Indirect,
            Mode::Direct => HandleDiscipline::Direct,
        }
    }

    /// Issues the handle for `ptr`. Registering a pointer that is already live
    /// returns its existing handle.
    pub fn insert(&self, ptr: NativePtr<T>) -> Handle {
        let Mode::Indirect(guard) = &self.mode else {
            return boundary::handle_of(ptr);
        };
        let mut slots = guard.write();
        if let Some(existing) = slots.by_ptr.get(&ptr) {
            return *existing;
        }
        let handle = Handle::from_raw(slots.next);
        slots.next += 1;
        slots.put(handle, ptr);
        tracing::debug!("issued {} handle {}", self.class, handle);
        handle
    }

    /// Resolves a handle to its native pointer.
    pub fn lookup(&self, handle: Handle) -> Result<NativePtr<T>, BridgeError> {
        let found = match &self.mode {
            Mode::Indirect(guard) => guard.read().entries.get(&handle).copied(),
            // SAFETY: direct tables are only built through `HandleTable::direct`,
            // whose caller took on the liveness contract.
            Mode::Direct => unsafe { boundary::ptr_of(handle) },
        };
        found.ok_or_else(|| self.not_found(handle))
    }

    /// Returns the live handle for a pointer the native library handed back,
    /// such as the queue named by a completion event.
    pub fn handle_for(&self, ptr: NativePtr<T>) -> Result<Handle, BridgeError> {
        match &self.mode {
            Mode::Indirect(guard) => guard
                .read()
                .by_ptr
                .get(&ptr)
                .copied()
                .ok_or_else(|| self.not_found(boundary::handle_of(ptr))),
            Mode::Direct => Ok(boundary::handle_of(ptr)),
        }
    }

    /// Whether `handle` is live. Direct tables cannot tell and report any
    /// well-formed handle as live.
    pub fn contains(&self, handle: Handle) -> bool {
        match &self.mode {
            Mode::Indirect(guard) => guard.read().entries.contains_key(&handle),
            Mode::Direct => handle.is_valid(),
        }
    }

    /// Removes the entry so that no further lookup can return it.
    pub fn remove(&self, handle: Handle) -> Result<NativePtr<T>, BridgeError> {
        match &self.mode {
            Mode::Indirect(guard) => {
                let removed = guard.write().take(handle);
                match removed {
                    Some(ptr) => {
                        tracing::debug!("released {} handle {}", self.class, handle);
                        Ok(ptr)
                    }
                    None => Err(self.not_found(handle)),
                }
            }
            Mode::Direct => self.lookup(handle),
        }
    }

    /// Puts back an entry whose native destroy failed.
    pub fn restore(&self, handle: Handle, ptr: NativePtr<T>) {
        if let Mode::Indirect(guard) = &self.mode {
            guard.write().put(handle, ptr);
            tracing::debug!("restored {} handle {}", self.class, handle);
        }
    }

    /// Number of live entries. Always zero for direct tables.
    pub fn len(&self) -> usize {
        match &self.mode {
            Mode::Indirect(guard) => guard.read().entries.len(),
            Mode::Direct => 0,
        }
    }

    /// Whether the table holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the live handles, sorted.
    pub fn handles(&self) -> Vec<Handle> {
        match &self.mode {
            Mode::Indirect(guard) => {
                let mut handles: Vec<_> = guard.read().entries.keys().copied().collect();
                handles.sort();
                handles
            }
            Mode::Direct => Vec::new(),
        }
    }

    fn not_found(&self, handle: Handle) -> BridgeError {
        BridgeError::NotFound {
            class: self.class,
            handle,
        }
    }
}

impl<T> std::fmt::Debug for HandleTable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleTable")
            .field("class", &self.class)
            .field("discipline", &self.discipline())
            .field("len", &self.len())
            .finish()
    }
}

/// Type-erased view of a table, used where the registry mutates tables of
/// several classes at once (cascading destroys, parent checks).
pub trait ErasedTable {
    /// The class of the table.
    fn class(&self) -> ResourceClass;

    /// Whether `handle` is live.
    fn contains_handle(&self, handle: Handle) -> bool;

    /// Removes an entry, returning its pointer with the type erased.
    fn take_erased(&self, handle: Handle) -> Option<NativePtr<()>>;

    /// Reinserts an entry removed by [`ErasedTable::take_erased`].
    fn put_erased(&self, handle: Handle, ptr: NativePtr<()>);
}

impl<T> ErasedTable for HandleTable<T> {
    fn class(&self) -> ResourceClass {
        self.class
    }

    fn contains_handle(&self, handle: Handle) -> bool {
        self.contains(handle)
    }

    fn take_erased(&self, handle: Handle) -> Option<NativePtr<()>> {
        self.remove(handle).ok().map(NativePtr::cast)
    }

    fn put_erased(&self, handle: Handle, ptr: NativePtr<()>) {
        self.restore(handle, ptr.cast())
    }
}
