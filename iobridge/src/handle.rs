/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Handle, resource class, and native pointer primitives.

use std::fmt;
use std::hash::Hash;
use std::hash::Hasher;
use std::ptr::NonNull;

use serde::Deserialize;
use serde::Serialize;

/// Opaque 64-bit identifier a caller uses in place of a native pointer.
///
/// Handles are only minted by a [`crate::HandleTable`]. The value carries no
/// meaning to the caller beyond identity; [`Handle::INVALID`] (all bits set, the
/// `-1` of a signed boundary) is never issued.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize
)]
#[serde(transparent)]
pub struct Handle(u64);

impl Handle {
    /// The handle value reported where no resource is present.
    pub const INVALID: Handle = Handle(u64::MAX);

    /// Wraps a raw handle value received from a caller.
    pub const fn from_raw(raw: u64) -> Self {
        Handle(raw)
    }

    /// Returns the raw handle value.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Returns the handle in the signed form used by boundary callers, where
    /// [`Handle::INVALID`] reads as `-1`.
    pub const fn as_i64(self) -> i64 {
        self.0 as i64
    }

    /// Whether the handle could name a live resource at all.
    pub const fn is_valid(self) -> bool {
        self.0 != 0 && self.0 != u64::MAX
    }
}

impl From<i64> for Handle {
    fn from(raw: i64) -> Self {
        Handle(raw as u64)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Independent namespaces of handles. Every table belongs to exactly one class.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize
)]
pub enum ResourceClass {
    /// Connection manager event channel.
    EventChannel,
    /// Connection manager id.
    ConnectionId,
    /// Protection domain.
    ProtectionDomain,
    /// Opened device context.
    DeviceContext,
    /// Completion event channel.
    CompletionChannel,
    /// Completion queue.
    CompletionQueue,
    /// RDMA queue pair.
    QueuePair,
    /// Registered memory region.
    MemoryRegion,
    /// Attached NVMe controller.
    Controller,
    /// NVMe namespace.
    Namespace,
    /// NVMe I/O queue pair.
    NvmeQueuePair,
    /// NVMf target subsystem.
    Subsystem,
}

impl ResourceClass {
    /// Every resource class, RDMA side first.
    pub const ALL: [ResourceClass; 12] = [
        ResourceClass::EventChannel,
        ResourceClass::ConnectionId,
        ResourceClass::ProtectionDomain,
        ResourceClass::DeviceContext,
        ResourceClass::CompletionChannel,
        ResourceClass::CompletionQueue,
        ResourceClass::QueuePair,
        ResourceClass::MemoryRegion,
        ResourceClass::Controller,
        ResourceClass::Namespace,
        ResourceClass::NvmeQueuePair,
        ResourceClass::Subsystem,
    ];

    /// Short name used in logs and error messages.
    pub const fn name(self) -> &'static str {
        match self {
            ResourceClass::EventChannel => "event_channel",
            ResourceClass::ConnectionId => "cm_id",
            ResourceClass::ProtectionDomain => "pd",
            ResourceClass::DeviceContext => "context",
            ResourceClass::CompletionChannel => "comp_channel",
            ResourceClass::CompletionQueue => "cq",
            ResourceClass::QueuePair => "qp",
            ResourceClass::MemoryRegion => "mr",
            ResourceClass::Controller => "nvme_ctrlr",
            ResourceClass::Namespace => "nvme_ns",
            ResourceClass::NvmeQueuePair => "nvme_qpair",
            ResourceClass::Subsystem => "nvmf_subsystem",
        }
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A verified non-null pointer to a native object.
///
/// This is the only form in which native pointers travel through the
/// registry. It does not own the pointee; lifetimes are managed by the
/// native library and by explicit destroy calls.
pub struct NativePtr<T>(NonNull<T>);

impl<T> NativePtr<T> {
    /// Wraps a pointer returned by a native create call. Null yields `None`.
    pub fn new(ptr: *mut T) -> Option<Self> {
        NonNull::new(ptr).map(NativePtr)
    }

    /// Leaks a boxed object into a native pointer. Used by in-process providers.
    pub fn from_box(value: Box<T>) -> Self {
        NativePtr(NonNull::from(Box::leak(value)))
    }

    /// Points at an object owned elsewhere.
    pub fn from_ref(value: &T) -> Self {
        NativePtr(NonNull::from(value))
    }

    /// Returns the raw pointer.
    pub fn as_ptr(self) -> *mut T {
        self.0.as_ptr()
    }

    /// Reinterprets the pointee type.
    pub fn cast<U>(self) -> NativePtr<U> {
        NativePtr(self.0.cast())
    }

    /// Borrows the pointee.
    ///
    /// # Safety
    ///
    /// The pointee must be live and not mutably aliased for `'a`.
    pub unsafe fn as_ref<'a>(self) -> &'a T {
        // SAFETY: guaranteed by the caller.
        unsafe { self.0.as_ref() }
    }

    /// Reclaims a pointer produced by [`NativePtr::from_box`].
    ///
    /// # Safety
    ///
    /// The pointer must come from `from_box` and must not be used afterwards.
    pub unsafe fn into_box(self) -> Box<T> {
        // SAFETY: guaranteed by the caller.
        unsafe { Box::from_raw(self.0.as_ptr()) }
    }
}

impl<T> Clone for NativePtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for NativePtr<T> {}

impl<T> PartialEq for NativePtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<T> Eq for NativePtr<T> {}

impl<T> Hash for NativePtr<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state)
    }
}

impl<T> fmt::Debug for NativePtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativePtr({:p})", self.0.as_ptr())
    }
}

// SAFETY:
// A NativePtr is an address, never dereferenced by the registry. Native
// libraries hand these pointers between threads; any access to the pointee
// goes through an unsafe provider call whose contract covers thread safety.
unsafe impl<T> Send for NativePtr<T> {}

// SAFETY:
// See the `Send` impl above; sharing the address itself is always safe.
unsafe impl<T> Sync for NativePtr<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_handle_reads_as_minus_one() {
        assert_eq!(Handle::INVALID.as_i64(), -1);
        assert_eq!(Handle::from(-1i64), Handle::INVALID);
        assert!(!Handle::INVALID.is_valid());
        assert!(!Handle::from_raw(0).is_valid());
        assert!(Handle::from_raw(0x1000).is_valid());
    }

    #[test]
    fn test_native_ptr_null_is_rejected() {
        assert!(NativePtr::<u32>::new(std::ptr::null_mut()).is_none());
        let ptr = NativePtr::from_box(Box::new(7u32));
        // SAFETY: the box was just leaked and is reclaimed once.
        let value = unsafe { ptr.into_box() };
        assert_eq!(*value, 7);
    }

    #[test]
    fn test_class_names_are_distinct() {
        let mut names: Vec<_> = ResourceClass::ALL.iter().map(|c| c.name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), ResourceClass::ALL.len());
    }
}
