/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! # Soft Verbs
//!
//! An in-process verbs provider. One [`SoftVerbs`] is a fabric with a single
//! device; every id, queue pair, and memory region created through it can
//! reach every other. Event and completion channels are backed by eventfds,
//! so the dispatcher's poll-then-fetch path runs against real descriptors.
//!
//! Used to exercise the dispatcher without RDMA hardware.

mod cm;
mod device;
mod queue;

use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Mutex;
use std::sync::Weak;
use std::sync::atomic::AtomicU32;

use dashmap::DashMap;
use iobridge::BridgeError;
use iobridge::NativePtr;
use rand::SeedableRng;
use rand::rngs::SmallRng;

pub use self::cm::REJECT_CONSUMER;
pub use self::cm::REJECT_NO_LISTENER;
pub use self::cm::SoftCmEvent;
pub use self::cm::SoftCmId;
pub use self::cm::SoftEventChannel;
pub use self::device::SoftCompChannel;
pub use self::device::SoftContext;
pub use self::device::SoftCq;
pub use self::device::SoftMr;
pub use self::device::SoftPd;
pub use self::device::SoftQp;
pub use self::device::default_device_attr;
use self::cm::IdShared;
use self::cm::id_shared;
use self::device::Region;
use crate::provider::VerbsProvider;
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

/// In-process verbs fabric.
pub struct SoftVerbs {
    context: Box<SoftContext>,
    bound: DashMap<SocketAddr, Weak<IdShared>>,
    lkeys: DashMap<u32, Region>,
    rkeys: DashMap<u32, Region>,
    next_port: AtomicU32,
    next_qp_num: AtomicU32,
    next_pd: AtomicU32,
    next_registration: AtomicU32,
    rng: Mutex<SmallRng>,
}

impl SoftVerbs {
    /// A fabric whose device reports [`default_device_attr`].
    pub fn new() -> Result<Self, BridgeError> {
        Self::with_device_attr(default_device_attr())
    }

    /// A fabric whose device reports `attr`.
    pub fn with_device_attr(attr: DeviceAttr) -> Result<Self, BridgeError> {
        Ok(Self {
            context: Box::new(SoftContext::new(attr)?),
            bound: DashMap::new(),
            lkeys: DashMap::new(),
            rkeys: DashMap::new(),
            next_port: AtomicU32::new(0),
            next_qp_num: AtomicU32::new(0x100),
            next_pd: AtomicU32::new(1),
            next_registration: AtomicU32::new(1),
            rng: Mutex::new(SmallRng::from_entropy()),
        })
    }

    /// Number of registered memory regions.
    pub fn registered_regions(&self) -> usize {
        self.lkeys.len()
    }
}

impl VerbsProvider for SoftVerbs {
    type EventChannel = SoftEventChannel;
    type CmEvent = SoftCmEvent;
    type CmId = SoftCmId;
    type Context = SoftContext;
    type Pd = SoftPd;
    type CompChannel = SoftCompChannel;
    type Cq = SoftCq;
    type Qp = SoftQp;
    type Mr = SoftMr;

    fn create_event_channel(&self) -> Option<NativePtr<SoftEventChannel>> {
        self.open_event_channel()
    }

    unsafe fn event_channel_fd(&self, channel: NativePtr<SoftEventChannel>) -> RawFd {
        // SAFETY: trait contract.
        unsafe { channel.as_ref() }.events.raw_fd()
    }

    unsafe fn get_cm_event(
        &self,
        channel: NativePtr<SoftEventChannel>,
    ) -> Result<NativePtr<SoftCmEvent>, BridgeError> {
        // SAFETY: trait contract.
        unsafe { self.next_cm_event(channel) }
    }

    unsafe fn decode_cm_event(&self, event: NativePtr<SoftCmEvent>) -> RawCmEvent<SoftCmId> {
        // SAFETY: trait contract.
        unsafe { self.read_cm_event(event) }
    }

    unsafe fn ack_cm_event(&self, event: NativePtr<SoftCmEvent>) -> Result<(), BridgeError> {
        // SAFETY: trait contract.
        drop(unsafe { event.into_box() });
        Ok(())
    }

    unsafe fn destroy_event_channel(&self, channel: NativePtr<SoftEventChannel>) -> Result<(), BridgeError> {
        // SAFETY: trait contract.
        unsafe { self.close_event_channel(channel) };
        Ok(())
    }

    unsafe fn create_id(
        &self,
        channel: NativePtr<SoftEventChannel>,
        port_space: PortSpace,
    ) -> Option<NativePtr<SoftCmId>> {
        Some(self.new_id(channel, port_space))
    }

    unsafe fn bind_addr(&self, id: NativePtr<SoftCmId>, addr: SocketAddr) -> Result<(), BridgeError> {
        // SAFETY: trait contract.
        unsafe { self.bind(id, addr) }
    }

    unsafe fn listen(&self, id: NativePtr<SoftCmId>, backlog: i32) -> Result<(), BridgeError> {
        // SAFETY: trait contract.
        unsafe { self.start_listening(id, backlog) }
    }

    unsafe fn resolve_addr(
        &self,
        id: NativePtr<SoftCmId>,
        src: Option<SocketAddr>,
        dst: SocketAddr,
        _timeout_ms: i32,
    ) -> Result<(), BridgeError> {
        // SAFETY: trait contract.
        unsafe { self.start_resolve_addr(id, src, dst) }
    }

    unsafe fn resolve_route(&self, id: NativePtr<SoftCmId>, _timeout_ms: i32) -> Result<(), BridgeError> {
        // SAFETY: trait contract.
        unsafe { self.start_resolve_route(id) }
    }

    unsafe fn connect(&self, id: NativePtr<SoftCmId>, param: &ConnParam) -> Result<(), BridgeError> {
        // SAFETY: trait contract.
        unsafe { self.request_connection(id, param) }
    }

    unsafe fn accept(&self, id: NativePtr<SoftCmId>, param: &ConnParam) -> Result<(), BridgeError> {
        // SAFETY: trait contract.
        unsafe { self.accept_connection(id, param) }
    }

    unsafe fn disconnect(&self, id: NativePtr<SoftCmId>) -> Result<(), BridgeError> {
        // SAFETY: trait contract.
        unsafe { self.disconnect_id(id) }
    }

    unsafe fn destroy_id(&self, id: NativePtr<SoftCmId>) -> Result<(), BridgeError> {
        // SAFETY: trait contract.
        unsafe { self.free_id(id) };
        Ok(())
    }

    unsafe fn destroy_ep(&self, id: NativePtr<SoftCmId>) -> Result<(), BridgeError> {
        // SAFETY: trait contract; `free_id` takes the queue pair down too.
        unsafe { self.free_id(id) };
        Ok(())
    }

    unsafe fn local_addr(&self, id: NativePtr<SoftCmId>) -> Option<SocketAddr> {
        // SAFETY: trait contract.
        unsafe { self.id_addrs(id) }.0
    }

    unsafe fn peer_addr(&self, id: NativePtr<SoftCmId>) -> Option<SocketAddr> {
        // SAFETY: trait contract.
        unsafe { self.id_addrs(id) }.1
    }

    unsafe fn id_context(&self, id: NativePtr<SoftCmId>) -> Option<NativePtr<SoftContext>> {
        // SAFETY: trait contract.
        let on_device = unsafe { id_shared(id) }.state().on_device;
        on_device.then(|| NativePtr::from_ref(&*self.context))
    }

    unsafe fn context_fd(&self, context: NativePtr<SoftContext>) -> RawFd {
        // SAFETY: trait contract.
        unsafe { context.as_ref() }.fd()
    }

    unsafe fn query_device(&self, context: NativePtr<SoftContext>) -> Result<DeviceAttr, BridgeError> {
        // SAFETY: trait contract.
        Ok(unsafe { context.as_ref() }.attr())
    }

    unsafe fn alloc_pd(&self, _context: NativePtr<SoftContext>) -> Option<NativePtr<SoftPd>> {
        Some(self.new_pd())
    }

    unsafe fn pd_handle(&self, pd: NativePtr<SoftPd>) -> u32 {
        // SAFETY: trait contract.
        unsafe { pd.as_ref() }.handle
    }

    unsafe fn dealloc_pd(&self, pd: NativePtr<SoftPd>) -> Result<(), BridgeError> {
        // SAFETY: trait contract.
        drop(unsafe { pd.into_box() });
        Ok(())
    }

    unsafe fn create_comp_channel(&self, _context: NativePtr<SoftContext>) -> Option<NativePtr<SoftCompChannel>> {
        self.open_comp_channel()
    }

    unsafe fn comp_channel_fd(&self, channel: NativePtr<SoftCompChannel>) -> RawFd {
        // SAFETY: trait contract.
        unsafe { channel.as_ref() }.events.raw_fd()
    }

    unsafe fn get_cq_event(&self, channel: NativePtr<SoftCompChannel>) -> Result<NativePtr<SoftCq>, BridgeError> {
        // SAFETY: trait contract.
        unsafe { self.next_cq_event(channel) }
    }

    unsafe fn destroy_comp_channel(&self, channel: NativePtr<SoftCompChannel>) -> Result<(), BridgeError> {
        // SAFETY: trait contract.
        drop(unsafe { channel.into_box() });
        Ok(())
    }

    unsafe fn create_cq(
        &self,
        _context: NativePtr<SoftContext>,
        channel: Option<NativePtr<SoftCompChannel>>,
        entries: u32,
        _comp_vector: u32,
    ) -> Option<NativePtr<SoftCq>> {
        self.new_cq(channel, entries)
    }

    unsafe fn req_notify_cq(&self, cq: NativePtr<SoftCq>, _solicited_only: bool) -> Result<(), BridgeError> {
        // SAFETY: trait contract.
        unsafe { self.arm_cq(cq) };
        Ok(())
    }

    unsafe fn ack_cq_events(&self, cq: NativePtr<SoftCq>, count: u32) {
        // SAFETY: trait contract.
        unsafe { self.ack_cq(cq, count) }
    }

    unsafe fn poll_cq(&self, cq: NativePtr<SoftCq>, out: &mut [WorkCompletion]) -> Result<usize, BridgeError> {
        // SAFETY: trait contract.
        Ok(unsafe { self.drain_cq(cq, out) })
    }

    unsafe fn destroy_cq(&self, cq: NativePtr<SoftCq>) -> Result<(), BridgeError> {
        // SAFETY: trait contract.
        unsafe { self.free_cq(cq) }
    }

    #[allow(clippy::too_many_arguments)]
    unsafe fn create_qp(
        &self,
        id: NativePtr<SoftCmId>,
        pd: NativePtr<SoftPd>,
        send_cq: NativePtr<SoftCq>,
        recv_cq: NativePtr<SoftCq>,
        qp_type: QpType,
        cap: &QpCap,
        sq_sig_all: bool,
    ) -> Option<NativePtr<SoftQp>> {
        // SAFETY: trait contract.
        unsafe { self.new_qp(id, pd, send_cq, recv_cq, qp_type, cap, sq_sig_all) }
    }

    unsafe fn qp_num(&self, qp: NativePtr<SoftQp>) -> u32 {
        // SAFETY: trait contract.
        unsafe { self.qp_number(qp) }
    }

    unsafe fn modify_qp(&self, qp: NativePtr<SoftQp>, attr: &QpAttr, mask: QpAttrMask) -> Result<(), BridgeError> {
        // SAFETY: trait contract.
        unsafe { self.change_qp(qp, attr, mask) }
    }

    unsafe fn query_qp(&self, qp: NativePtr<SoftQp>) -> QpAttr {
        // SAFETY: trait contract.
        unsafe { self.qp_attr(qp) }
    }

    unsafe fn destroy_qp(&self, id: NativePtr<SoftCmId>) -> Result<(), BridgeError> {
        // SAFETY: trait contract.
        unsafe { self.free_id_qp(id) }
    }

    unsafe fn post_send(&self, qp: NativePtr<SoftQp>, wrs: &[SendWr]) -> Result<(), BridgeError> {
        // SAFETY: trait contract.
        unsafe { self.execute_sends(qp, wrs) }
    }

    unsafe fn post_recv(&self, qp: NativePtr<SoftQp>, wrs: &[RecvWr]) -> Result<(), BridgeError> {
        // SAFETY: trait contract.
        unsafe { self.queue_recv(qp, wrs) }
    }

    unsafe fn reg_mr(
        &self,
        pd: NativePtr<SoftPd>,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> Option<NativePtr<SoftMr>> {
        // SAFETY: trait contract.
        unsafe { self.register(pd, addr, len, access) }
    }

    unsafe fn mr_keys(&self, mr: NativePtr<SoftMr>) -> MrKeys {
        // SAFETY: trait contract.
        unsafe { self.keys_of(mr) }
    }

    unsafe fn dereg_mr(&self, mr: NativePtr<SoftMr>) -> Result<(), BridgeError> {
        // SAFETY: trait contract.
        unsafe { self.deregister(mr) };
        Ok(())
    }
}
