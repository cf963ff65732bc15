/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Pointer/integer reinterpretation.
//!
//! Every conversion between a native address and an integer in this workspace
//! goes through this module:
//! - direct-discipline handles derived from native object pointers,
//! - pointers recovered from handles under the direct discipline,
//! - buffer addresses exchanged with DMA-capable providers.

use crate::handle::Handle;
use crate::handle::NativePtr;

/// Returns the direct-discipline handle naming `ptr`: the pointer value
/// itself.
pub fn handle_of<T>(ptr: NativePtr<T>) -> Handle {
    Handle::from_raw(ptr.as_ptr() as usize as u64)
}

/// Reinterprets a handle as the pointer it was derived from.
///
/// # Safety
///
/// The handle must have been produced by [`handle_of`] for an object of type
/// `T` that is still live. Nothing here can verify that.
pub unsafe fn ptr_of<T>(handle: Handle) -> Option<NativePtr<T>> {
    if !handle.is_valid() {
        return None;
    }
    NativePtr::new(handle.raw() as usize as *mut T)
}

/// Returns the bus-visible address of a buffer, as posted in scatter/gather
/// entries and NVMe commands.
pub fn dma_addr<T>(ptr: *const T) -> u64 {
    ptr as usize as u64
}

/// Recovers a buffer pointer from an address produced by [`dma_addr`].
///
/// # Safety
///
/// Dereferencing the result is only valid while the original buffer is live.
pub unsafe fn dma_ptr(addr: u64) -> *mut u8 {
    addr as usize as *mut u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_round_trips_pointer() {
        let ptr = NativePtr::from_box(Box::new([0u8; 16]));
        let handle = handle_of(ptr);
        assert!(handle.is_valid());
        // SAFETY: the box is live until reclaimed below.
        let back = unsafe { ptr_of::<[u8; 16]>(handle) };
        assert_eq!(back, Some(ptr));
        // SAFETY: reclaimed exactly once.
        drop(unsafe { ptr.into_box() });
    }

    #[test]
    fn test_invalid_handle_has_no_pointer() {
        // SAFETY: never dereferenced.
        assert!(unsafe { ptr_of::<u8>(Handle::INVALID) }.is_none());
        // SAFETY: never dereferenced.
        assert!(unsafe { ptr_of::<u8>(Handle::from_raw(0)) }.is_none());
    }
}
