/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The native verbs and connection manager surface.
//!
//! A provider wraps one verbs implementation (librdmacm plus libibverbs, or the
//! in-process [`crate::SoftVerbs`]). It speaks in native pointers only; handles
//! and ownership are the dispatcher's business.
//!
//! # Safety
//!
//! Every `unsafe` method takes native pointers that must have been produced by
//! the same provider and must still be live. The dispatcher guarantees this by
//! resolving pointers through its handle tables.

use std::net::SocketAddr;
use std::os::fd::RawFd;

use iobridge::BridgeError;
use iobridge::NativePtr;

use crate::verbs_primitives::AccessFlags;
use crate::verbs_primitives::ConnParam;
use crate::verbs_primitives::DeviceAttr;
use crate::verbs_primitives::MrKeys;
use crate::verbs_primitives::PortSpace;
use crate::verbs_primitives::QpAttr;
use crate::verbs_primitives::QpAttrMask;
use crate::verbs_primitives::QpCap;
use crate::verbs_primitives::QpType;
use crate::verbs_primitives::RawCmEvent;
use crate::verbs_primitives::RecvWr;
use crate::verbs_primitives::SendWr;
use crate::verbs_primitives::WorkCompletion;

/// Native verbs and connection manager calls.
///
/// Create calls return `None` where the native call returns null. All other
/// failures carry the native status verbatim in
/// [`BridgeError::NativeCallFailed`].
pub trait VerbsProvider: Send + Sync {
    /// `struct rdma_event_channel`
    type EventChannel;
    /// `struct rdma_cm_event`
    type CmEvent;
    /// `struct rdma_cm_id`
    type CmId;
    /// `struct ibv_context`
    type Context;
    /// `struct ibv_pd`
    type Pd;
    /// `struct ibv_comp_channel`
    type CompChannel;
    /// `struct ibv_cq`
    type Cq;
    /// `struct ibv_qp`
    type Qp;
    /// `struct ibv_mr`
    type Mr;

    /// Opens a connection manager event channel.
    fn create_event_channel(&self) -> Option<NativePtr<Self::EventChannel>>;

    /// Descriptor that becomes readable when an event is pending.
    unsafe fn event_channel_fd(&self, channel: NativePtr<Self::EventChannel>) -> RawFd;

    /// Fetches the next event. Only called once the descriptor is readable.
    unsafe fn get_cm_event(
        &self,
        channel: NativePtr<Self::EventChannel>,
    ) -> Result<NativePtr<Self::CmEvent>, BridgeError>;

    /// Reads the fields of a fetched event.
    unsafe fn decode_cm_event(&self, event: NativePtr<Self::CmEvent>) -> RawCmEvent<Self::CmId>;

    /// Releases a fetched event. The event must not be used afterwards.
    unsafe fn ack_cm_event(&self, event: NativePtr<Self::CmEvent>) -> Result<(), BridgeError>;

    /// Closes an event channel.
    unsafe fn destroy_event_channel(
        &self,
        channel: NativePtr<Self::EventChannel>,
    ) -> Result<(), BridgeError>;

    /// Creates a connection id reporting to `channel`.
    unsafe fn create_id(
        &self,
        channel: NativePtr<Self::EventChannel>,
        port_space: PortSpace,
    ) -> Option<NativePtr<Self::CmId>>;

    /// Binds an id to a local address. Port zero picks an ephemeral port.
    unsafe fn bind_addr(&self, id: NativePtr<Self::CmId>, addr: SocketAddr) -> Result<(), BridgeError>;

    /// Starts listening for connect requests on a bound id.
    unsafe fn listen(&self, id: NativePtr<Self::CmId>, backlog: i32) -> Result<(), BridgeError>;

    /// Resolves the destination address; completion is reported as an event.
    unsafe fn resolve_addr(
        &self,
        id: NativePtr<Self::CmId>,
        src: Option<SocketAddr>,
        dst: SocketAddr,
        timeout_ms: i32,
    ) -> Result<(), BridgeError>;

    /// Resolves the route to the destination; completion is reported as an
    /// event.
    unsafe fn resolve_route(&self, id: NativePtr<Self::CmId>, timeout_ms: i32) -> Result<(), BridgeError>;

    /// Sends a connect request.
    unsafe fn connect(&self, id: NativePtr<Self::CmId>, param: &ConnParam) -> Result<(), BridgeError>;

    /// Accepts a connect request received on `id`.
    unsafe fn accept(&self, id: NativePtr<Self::CmId>, param: &ConnParam) -> Result<(), BridgeError>;

    /// Disconnects an established connection. The id stays valid.
    unsafe fn disconnect(&self, id: NativePtr<Self::CmId>) -> Result<(), BridgeError>;

    /// Destroys an id. Any queue pair still attached to it is released too.
    unsafe fn destroy_id(&self, id: NativePtr<Self::CmId>) -> Result<(), BridgeError>;

    /// Destroys an id together with its queue pair.
    unsafe fn destroy_ep(&self, id: NativePtr<Self::CmId>) -> Result<(), BridgeError>;

    /// Local address of a bound id.
    unsafe fn local_addr(&self, id: NativePtr<Self::CmId>) -> Option<SocketAddr>;

    /// Peer address of a resolved or connected id.
    unsafe fn peer_addr(&self, id: NativePtr<Self::CmId>) -> Option<SocketAddr>;

    /// Device context the id is bound to, once bound or resolved.
    unsafe fn id_context(&self, id: NativePtr<Self::CmId>) -> Option<NativePtr<Self::Context>>;

    /// Command descriptor of a device context.
    unsafe fn context_fd(&self, context: NativePtr<Self::Context>) -> RawFd;

    /// Device attributes.
    unsafe fn query_device(&self, context: NativePtr<Self::Context>) -> Result<DeviceAttr, BridgeError>;

    /// Allocates a protection domain.
    unsafe fn alloc_pd(&self, context: NativePtr<Self::Context>) -> Option<NativePtr<Self::Pd>>;

    /// Native handle of a protection domain.
    unsafe fn pd_handle(&self, pd: NativePtr<Self::Pd>) -> u32;

    /// Deallocates a protection domain.
    unsafe fn dealloc_pd(&self, pd: NativePtr<Self::Pd>) -> Result<(), BridgeError>;

    /// Opens a completion channel.
    unsafe fn create_comp_channel(
        &self,
        context: NativePtr<Self::Context>,
    ) -> Option<NativePtr<Self::CompChannel>>;

    /// Descriptor that becomes readable when a completion event is pending.
    unsafe fn comp_channel_fd(&self, channel: NativePtr<Self::CompChannel>) -> RawFd;

    /// Fetches the next completion event and returns the queue it concerns.
    /// Only called once the descriptor is readable.
    unsafe fn get_cq_event(
        &self,
        channel: NativePtr<Self::CompChannel>,
    ) -> Result<NativePtr<Self::Cq>, BridgeError>;

    /// Closes a completion channel.
    unsafe fn destroy_comp_channel(
        &self,
        channel: NativePtr<Self::CompChannel>,
    ) -> Result<(), BridgeError>;

    /// Creates a completion queue, optionally reporting to `channel`.
    unsafe fn create_cq(
        &self,
        context: NativePtr<Self::Context>,
        channel: Option<NativePtr<Self::CompChannel>>,
        entries: u32,
        comp_vector: u32,
    ) -> Option<NativePtr<Self::Cq>>;

    /// Arms the queue to post one completion event for the next completion.
    unsafe fn req_notify_cq(&self, cq: NativePtr<Self::Cq>, solicited_only: bool) -> Result<(), BridgeError>;

    /// Acknowledges completion events fetched for `cq`.
    unsafe fn ack_cq_events(&self, cq: NativePtr<Self::Cq>, count: u32);

    /// Drains up to `out.len()` completions, oldest first.
    unsafe fn poll_cq(
        &self,
        cq: NativePtr<Self::Cq>,
        out: &mut [WorkCompletion],
    ) -> Result<usize, BridgeError>;

    /// Destroys a completion queue.
    unsafe fn destroy_cq(&self, cq: NativePtr<Self::Cq>) -> Result<(), BridgeError>;

    /// Creates a queue pair attached to `id`.
    #[allow(clippy::too_many_arguments)]
    unsafe fn create_qp(
        &self,
        id: NativePtr<Self::CmId>,
        pd: NativePtr<Self::Pd>,
        send_cq: NativePtr<Self::Cq>,
        recv_cq: NativePtr<Self::Cq>,
        qp_type: QpType,
        cap: &QpCap,
        sq_sig_all: bool,
    ) -> Option<NativePtr<Self::Qp>>;

    /// Queue pair number.
    unsafe fn qp_num(&self, qp: NativePtr<Self::Qp>) -> u32;

    /// `ibv_modify_qp`. Fields of `attr` outside `mask` are ignored.
    unsafe fn modify_qp(&self, qp: NativePtr<Self::Qp>, attr: &QpAttr, mask: QpAttrMask) -> Result<(), BridgeError>;

    /// `ibv_query_qp` of every field [`QpAttr`] carries.
    unsafe fn query_qp(&self, qp: NativePtr<Self::Qp>) -> QpAttr;

    /// Destroys the queue pair attached to `id`.
    unsafe fn destroy_qp(&self, id: NativePtr<Self::CmId>) -> Result<(), BridgeError>;

    /// Posts send work requests.
    unsafe fn post_send(&self, qp: NativePtr<Self::Qp>, wrs: &[SendWr]) -> Result<(), BridgeError>;

    /// Posts receive work requests.
    unsafe fn post_recv(&self, qp: NativePtr<Self::Qp>, wrs: &[RecvWr]) -> Result<(), BridgeError>;

    /// Registers `len` bytes at `addr`.
    ///
    /// The memory must stay valid until the region is deregistered.
    unsafe fn reg_mr(
        &self,
        pd: NativePtr<Self::Pd>,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> Option<NativePtr<Self::Mr>>;

    /// Keys of a registered region.
    unsafe fn mr_keys(&self, mr: NativePtr<Self::Mr>) -> MrKeys;

    /// Deregisters a region.
    unsafe fn dereg_mr(&self, mr: NativePtr<Self::Mr>) -> Result<(), BridgeError>;
}
