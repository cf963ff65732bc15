/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::time::Duration;

use nix::errno::Errno;

use crate::handle::Handle;
use crate::handle::ResourceClass;

/// Failures surfaced at the handle boundary.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// A required input was absent or malformed; no native call was made.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The handle does not name a live resource of the class.
    #[error("{class} handle {handle} not found")]
    NotFound {
        /// Class that was searched.
        class: ResourceClass,
        /// Handle that failed to resolve.
        handle: Handle,
    },

    /// The native create call returned no object.
    #[error("native allocation of {class} failed")]
    AllocationFailed {
        /// Class of the resource being created.
        class: ResourceClass,
    },

    /// The native call returned an error status, kept verbatim.
    #[error("{op} failed with native code {code}")]
    NativeCallFailed {
        /// Native function that failed.
        op: &'static str,
        /// Status returned by the native library.
        code: i32,
    },

    /// A bounded wait elapsed without an event or completion.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// A request exceeded a fixed capacity.
    #[error("capacity {capacity} exceeded: {requested} requested")]
    CapacityExceeded {
        /// Capacity available.
        capacity: usize,
        /// Amount requested.
        requested: usize,
    },

    /// The resource still owns live children that block its destroy.
    #[error("{class} handle {handle} still owns {children} live resources")]
    ResourceBusy {
        /// Class of the parent.
        class: ResourceClass,
        /// Parent handle.
        handle: Handle,
        /// Number of blocking children.
        children: usize,
    },
}

impl BridgeError {
    /// Builds an [`BridgeError::InvalidArgument`].
    pub fn invalid(reason: impl Into<String>) -> Self {
        BridgeError::InvalidArgument(reason.into())
    }

    /// Builds a [`BridgeError::NativeCallFailed`] from a native status.
    pub fn native(op: &'static str, code: i32) -> Self {
        BridgeError::NativeCallFailed { op, code }
    }

    /// Builds a [`BridgeError::NativeCallFailed`] from an errno.
    pub fn errno(op: &'static str, errno: Errno) -> Self {
        BridgeError::NativeCallFailed {
            op,
            code: -(errno as i32),
        }
    }

    /// Integer status for callers that speak negative errno codes.
    ///
    /// Native failures keep their original code.
    pub fn status_code(&self) -> i32 {
        match self {
            BridgeError::InvalidArgument(_) => -(Errno::EINVAL as i32),
            BridgeError::NotFound { .. } => -(Errno::ENOENT as i32),
            BridgeError::AllocationFailed { .. } => -(Errno::ENOMEM as i32),
            BridgeError::NativeCallFailed { code, .. } => *code,
            BridgeError::Timeout(_) => -(Errno::ETIMEDOUT as i32),
            BridgeError::CapacityExceeded { .. } => -(Errno::ENOSPC as i32),
            BridgeError::ResourceBusy { .. } => -(Errno::EBUSY as i32),
        }
    }
}

/// Converts a C-style status (negative on failure) into a result.
pub fn native_status(op: &'static str, code: i32) -> Result<i32, BridgeError> {
    if code < 0 {
        tracing::debug!("{} returned {}", op, code);
        Err(BridgeError::native(op, code))
    } else {
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_code_is_kept_verbatim() {
        let err = BridgeError::native("rdma_bind_addr", -98);
        assert_eq!(err.status_code(), -98);
        assert_eq!(native_status("rdma_listen", -22), Err(BridgeError::native("rdma_listen", -22)));
        assert_eq!(native_status("rdma_listen", 3), Ok(3));
    }

    #[test]
    fn test_status_codes() {
        let not_found = BridgeError::NotFound {
            class: ResourceClass::MemoryRegion,
            handle: Handle::from_raw(0x10),
        };
        assert_eq!(not_found.status_code(), -(Errno::ENOENT as i32));
        assert_eq!(
            BridgeError::Timeout(Duration::from_millis(5)).status_code(),
            -(Errno::ETIMEDOUT as i32)
        );
        assert_eq!(
            BridgeError::errno("ibv_destroy_cq", Errno::EBUSY).status_code(),
            -(Errno::EBUSY as i32)
        );
        assert!(not_found.to_string().contains("mr handle 0x10"));
    }
}
