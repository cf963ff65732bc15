/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! RDMA verbs and connection manager resources behind opaque handles.
//!
//! [`VerbsDispatcher`] wraps a [`VerbsProvider`] and exposes every verbs and
//! connection manager object (event channels, ids, protection domains,
//! completion channels and queues, queue pairs, memory regions) as an
//! [`iobridge::Handle`]. Connection manager events are delivered through a
//! bounded poll over the channel's descriptor and are always acknowledged.
//!
//! [`SoftVerbs`] is an in-process provider for running the whole surface
//! without RDMA hardware.

mod cm;
mod config;
mod dispatcher;
pub mod event_bridge;
mod provider;
pub mod sockaddr;
mod soft;
mod verbs;
mod verbs_primitives;

pub use config::*;
pub use dispatcher::*;
pub use provider::*;
pub use soft::*;
pub use verbs_primitives::*;

#[cfg(test)]
mod dispatcher_tests;
