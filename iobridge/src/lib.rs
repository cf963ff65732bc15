/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Handle registry for native I/O resources.
//!
//! Native libraries (RDMA verbs, the RDMA connection manager, NVMe drivers)
//! identify their objects by raw pointers. This crate turns those pointers into
//! opaque 64-bit [`Handle`]s that a caller on the other side of a language or
//! process boundary can hold, pass back, and destroy without ever touching the
//! pointer itself.
//!
//! Components:
//! - [`HandleTable`]: one table per resource class, guarded by a
//!   [`ClassGuard`] (reader/writer lock). Lookups take the read lock, create and
//!   destroy take the write lock for the table mutation only.
//! - [`OwnershipIndex`]: parent to children edges between resources of different
//!   classes (a queue pair belongs to its connection id, a memory region to its
//!   protection domain). Edges either cascade or reject the parent's destroy.
//! - [`Registry`]: ties tables and edges together. All creates go through
//!   [`Registry::adopt`] and all destroys through [`Registry::release`].
//! - [`boundary`]: the only module that reinterprets pointers as integers.
//!
//! Two handle disciplines exist, see [`HandleDiscipline`]. A registry picks one
//! at construction and every table it builds follows it.
//!
//! Some native libraries terminate the process on fatal misconfiguration during
//! initialization. That behavior is inherited from the library and cannot be
//! intercepted here.

pub mod boundary;
mod config;
mod error;
mod guard;
mod handle;
mod ownership;
mod registry;
mod table;

pub use config::HandleDiscipline;
pub use config::RegistryConfig;
pub use config::env_override;
pub use config::load_yaml;
pub use error::BridgeError;
pub use error::native_status;
pub use guard::ClassGuard;
pub use handle::Handle;
pub use handle::NativePtr;
pub use handle::ResourceClass;
pub use ownership::Edge;
pub use ownership::EdgePolicy;
pub use ownership::OwnershipIndex;
pub use ownership::ResourceKey;
pub use registry::Parent;
pub use registry::Registry;
pub use table::ErasedTable;
pub use table::HandleTable;
