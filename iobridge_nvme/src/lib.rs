/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! NVMe controllers, namespaces, queue pairs and fabrics subsystems behind
//! opaque handles.
//!
//! [`NvmeDispatcher`] wraps an [`NvmeProvider`]. Discovery writes controller
//! handles into a caller-supplied array and never overflows it. Block I/O is
//! correlated through [`IoCompletion`] records that report finished command
//! ids into a shared [`CompletionSink`].
//!
//! [`SoftNvme`] is an in-process driver for running the whole surface without
//! NVMe hardware.

mod completion;
mod config;
mod dispatcher;
mod nvme_primitives;
mod probe;
mod provider;
mod soft;
mod target;

pub use completion::*;
pub use config::*;
pub use dispatcher::*;
pub use nvme_primitives::*;
pub use probe::ProbeReport;
pub use provider::*;
pub use soft::*;

#[cfg(test)]
mod dispatcher_tests;
