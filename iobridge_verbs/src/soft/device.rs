/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Device resources and the data path of the in-process fabric.
//!
//! Memory regions are indexed fabric-wide by key so that a peer's one-sided
//! operation can validate and reach the target buffer. Posted work requests
//! execute synchronously: by the time `post_send` returns, the bytes have
//! moved and both sides' completions are queued.

use std::collections::VecDeque;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::OnceLock;
use std::sync::PoisonError;
use std::sync::Weak;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use iobridge::BridgeError;
use iobridge::NativePtr;
use iobridge::boundary::dma_addr;
use iobridge::boundary::dma_ptr;
use nix::errno::Errno;
use nix::sys::eventfd::EfdFlags;
use nix::sys::eventfd::EventFd;
use rand::Rng;

use super::SoftVerbs;
use super::cm::SoftCmId;
use super::cm::id_shared;
use super::queue::EventQueue;
use crate::verbs_primitives::AccessFlags;
use crate::verbs_primitives::DeviceAttr;
use crate::verbs_primitives::MrKeys;
use crate::verbs_primitives::QpAttr;
use crate::verbs_primitives::QpAttrMask;
use crate::verbs_primitives::QpCap;
use crate::verbs_primitives::QpState;
use crate::verbs_primitives::QpType;
use crate::verbs_primitives::RecvWr;
use crate::verbs_primitives::SendWr;
use crate::verbs_primitives::Sge;
use crate::verbs_primitives::WcOpcode;
use crate::verbs_primitives::WcStatus;
use crate::verbs_primitives::WorkCompletion;
use crate::verbs_primitives::WrOpcode;

/// The single device of the fabric.
pub struct SoftContext {
    cmd: EventFd,
    attr: DeviceAttr,
}

impl SoftContext {
    pub(crate) fn new(attr: DeviceAttr) -> Result<Self, BridgeError> {
        let cmd = EventFd::from_flags(EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)
            .map_err(|e| BridgeError::errno("ibv_open_device", e))?;
        Ok(Self { cmd, attr })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.cmd.as_fd().as_raw_fd()
    }

    pub(crate) fn attr(&self) -> DeviceAttr {
        self.attr
    }
}

/// Attributes the fabric reports unless configured otherwise.
pub fn default_device_attr() -> DeviceAttr {
    DeviceAttr {
        max_qp_rd_atom: 16,
        max_qp_init_rd_atom: 16,
        max_qp: 1 << 16,
        max_cq: 1 << 16,
        max_cqe: (1 << 22) - 1,
        max_mr: 1 << 24,
        max_pd: 1 << 24,
        max_qp_wr: 32768,
        max_sge: 30,
    }
}

/// Protection domain.
pub struct SoftPd {
    pub(crate) handle: u32,
}

/// Completion channel.
pub struct SoftCompChannel {
    pub(crate) events: EventQueue<NativePtr<SoftCq>>,
}

/// Completion queue.
pub struct SoftCq {
    pub(crate) shared: Arc<CqShared>,
}

pub(crate) struct CqShared {
    capacity: usize,
    channel: Option<NativePtr<SoftCompChannel>>,
    this: OnceLock<NativePtr<SoftCq>>,
    state: Mutex<CqState>,
}

#[derive(Default)]
struct CqState {
    completions: VecDeque<WorkCompletion>,
    armed: bool,
    /// Events fetched from the channel and not yet acknowledged.
    unacked: u32,
    destroyed: bool,
}

impl CqShared {
    fn state(&self) -> MutexGuard<'_, CqState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a completion and, if armed, raises one event on the channel.
    fn complete(&self, wc: WorkCompletion) {
        let mut state = self.state();
        if state.destroyed {
            return;
        }
        if state.completions.len() >= self.capacity {
            tracing::error!(
                "completion queue overrun at {} entries, dropping wr_id {}",
                self.capacity,
                wc.wr_id
            );
            return;
        }
        state.completions.push_back(wc);
        if !state.armed {
            return;
        }
        if let (Some(channel), Some(this)) = (self.channel, self.this.get()) {
            state.armed = false;
            // SAFETY: a live queue keeps its channel alive, and `destroyed`
            // is checked under the lock held here.
            unsafe { channel.as_ref() }.events.push(*this);
        }
    }
}

/// Queue pair.
pub struct SoftQp {
    pub(crate) shared: Arc<QpShared>,
}

pub(crate) struct QpShared {
    qp_num: u32,
    qp_type: QpType,
    cap: QpCap,
    sq_sig_all: bool,
    pd: u32,
    send_cq: Arc<CqShared>,
    recv_cq: Arc<CqShared>,
    state: Mutex<QpInner>,
}

#[derive(Default)]
struct QpInner {
    attr: QpAttr,
    recv_queue: VecDeque<RecvWr>,
    peer: Weak<QpShared>,
    destroyed: bool,
}

impl QpShared {
    fn state(&self) -> MutexGuard<'_, QpInner> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn receives(&self) -> bool {
        let state = self.state();
        !state.destroyed && state.attr.qp_state.receives()
    }

    fn flush(&self, wrs: Vec<RecvWr>) {
        for wr in wrs {
            self.recv_cq
                .complete(self.recv_completion(wr.wr_id, WcStatus::WrFlushErr, 0));
        }
    }

    fn recv_completion(&self, wr_id: u64, status: WcStatus, src_qp: u32) -> WorkCompletion {
        WorkCompletion {
            wr_id,
            status,
            opcode: WcOpcode::Recv,
            qp_num: self.qp_num,
            src_qp,
            ..WorkCompletion::default()
        }
    }
}

/// Registered memory region.
pub struct SoftMr {
    keys: MrKeys,
}

/// A registered buffer as seen through either of its keys.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Region {
    addr: u64,
    len: usize,
    access: AccessFlags,
    pd: u32,
}

impl Region {
    fn covers(&self, addr: u64, len: usize) -> bool {
        let Some(end) = addr.checked_add(len as u64) else {
            return false;
        };
        addr >= self.addr && end <= self.addr + self.len as u64
    }
}

/// # Safety
///
/// `cq` must be live.
unsafe fn cq_shared<'a>(cq: NativePtr<SoftCq>) -> &'a Arc<CqShared> {
    // SAFETY: forwarded to our caller.
    unsafe { &cq.as_ref().shared }
}

/// # Safety
///
/// `qp` must be live.
unsafe fn qp_shared<'a>(qp: NativePtr<SoftQp>) -> &'a Arc<QpShared> {
    // SAFETY: forwarded to our caller.
    unsafe { &qp.as_ref().shared }
}

fn sge_total(sg_list: &[Sge]) -> usize {
    sg_list.iter().map(|sge| sge.length as usize).sum()
}

impl SoftVerbs {
    pub(crate) fn new_pd(&self) -> NativePtr<SoftPd> {
        let handle = self.next_pd.fetch_add(1, Ordering::Relaxed);
        NativePtr::from_box(Box::new(SoftPd { handle }))
    }

    pub(crate) fn open_comp_channel(&self) -> Option<NativePtr<SoftCompChannel>> {
        match EventQueue::new() {
            Ok(events) => Some(NativePtr::from_box(Box::new(SoftCompChannel { events }))),
            Err(err) => {
                tracing::error!("failed to open completion channel: {}", err);
                None
            }
        }
    }

    /// # Safety
    ///
    /// `channel` must be live.
    pub(crate) unsafe fn next_cq_event(
        &self,
        channel: NativePtr<SoftCompChannel>,
    ) -> Result<NativePtr<SoftCq>, BridgeError> {
        // SAFETY: forwarded to our caller.
        let cq = unsafe { channel.as_ref() }.events.pop()?;
        // SAFETY: destroying a queue strips its pending events first.
        unsafe { cq_shared(cq) }.state().unacked += 1;
        Ok(cq)
    }

    pub(crate) fn new_cq(
        &self,
        channel: Option<NativePtr<SoftCompChannel>>,
        entries: u32,
    ) -> Option<NativePtr<SoftCq>> {
        if entries == 0 || entries > self.context.attr().max_cqe {
            tracing::warn!("refusing completion queue of {} entries", entries);
            return None;
        }
        let shared = Arc::new(CqShared {
            capacity: entries as usize,
            channel,
            this: OnceLock::new(),
            state: Mutex::new(CqState::default()),
        });
        let ptr = NativePtr::from_box(Box::new(SoftCq {
            shared: shared.clone(),
        }));
        let _ = shared.this.set(ptr);
        Some(ptr)
    }

    /// # Safety
    ///
    /// `cq` must be live.
    pub(crate) unsafe fn arm_cq(&self, cq: NativePtr<SoftCq>) {
        // SAFETY: forwarded to our caller.
        unsafe { cq_shared(cq) }.state().armed = true;
    }

    /// # Safety
    ///
    /// `cq` must be live.
    pub(crate) unsafe fn ack_cq(&self, cq: NativePtr<SoftCq>, count: u32) {
        // SAFETY: forwarded to our caller.
        let mut state = unsafe { cq_shared(cq) }.state();
        state.unacked = state.unacked.saturating_sub(count);
    }

    /// # Safety
    ///
    /// `cq` must be live.
    pub(crate) unsafe fn drain_cq(&self, cq: NativePtr<SoftCq>, out: &mut [WorkCompletion]) -> usize {
        // SAFETY: forwarded to our caller.
        let mut state = unsafe { cq_shared(cq) }.state();
        let n = out.len().min(state.completions.len());
        for (slot, wc) in out.iter_mut().zip(state.completions.drain(..n)) {
            *slot = wc;
        }
        n
    }

    /// Fails with `EBUSY` while fetched events remain unacknowledged.
    ///
    /// # Safety
    ///
    /// `cq` must be live and unused by any queue pair.
    pub(crate) unsafe fn free_cq(&self, cq: NativePtr<SoftCq>) -> Result<(), BridgeError> {
        // SAFETY: forwarded to our caller.
        let shared = unsafe { cq_shared(cq) }.clone();
        {
            let mut state = shared.state();
            if state.unacked > 0 {
                tracing::warn!("completion queue has {} unacknowledged events", state.unacked);
                return Err(BridgeError::errno("ibv_destroy_cq", Errno::EBUSY));
            }
            state.destroyed = true;
        }
        if let Some(channel) = shared.channel {
            // SAFETY: the channel outlives the queues reporting to it.
            unsafe { channel.as_ref() }.events.remove_where(|queued| *queued == cq);
        }
        // SAFETY: forwarded to our caller.
        drop(unsafe { cq.into_box() });
        Ok(())
    }

    /// # Safety
    ///
    /// All pointers must be live.
    #[allow(clippy::too_many_arguments)]
    pub(crate) unsafe fn new_qp(
        &self,
        id: NativePtr<SoftCmId>,
        pd: NativePtr<SoftPd>,
        send_cq: NativePtr<SoftCq>,
        recv_cq: NativePtr<SoftCq>,
        qp_type: QpType,
        cap: &QpCap,
        sq_sig_all: bool,
    ) -> Option<NativePtr<SoftQp>> {
        let attr = self.context.attr();
        if cap.max_send_wr > attr.max_qp_wr
            || cap.max_recv_wr > attr.max_qp_wr
            || cap.max_send_sge > attr.max_sge
            || cap.max_recv_sge > attr.max_sge
        {
            tracing::warn!("queue pair capabilities {:?} exceed the device", cap);
            return None;
        }
        // SAFETY: forwarded to our caller.
        let id = unsafe { id_shared(id) };
        let mut id_state = id.state();
        if id_state.qp.is_some() || id_state.destroyed {
            return None;
        }
        let shared = Arc::new(QpShared {
            qp_num: self.next_qp_num.fetch_add(1, Ordering::Relaxed),
            qp_type,
            cap: *cap,
            sq_sig_all,
            // SAFETY: forwarded to our caller.
            pd: unsafe { pd.as_ref() }.handle,
            // SAFETY: forwarded to our caller.
            send_cq: unsafe { cq_shared(send_cq) }.clone(),
            // SAFETY: forwarded to our caller.
            recv_cq: unsafe { cq_shared(recv_cq) }.clone(),
            // Pairs created through the connection manager start out
            // initialized.
            state: Mutex::new(QpInner {
                attr: QpAttr {
                    qp_state: QpState::Init,
                    ..QpAttr::default()
                },
                ..QpInner::default()
            }),
        });
        tracing::debug!("created {:?} qp {}", shared.qp_type, shared.qp_num);
        let ptr = NativePtr::from_box(Box::new(SoftQp { shared }));
        id_state.qp = Some(ptr);
        let remote = if id_state.connected {
            id_state.remote.upgrade()
        } else {
            None
        };
        drop(id_state);
        // An established connection picks up the new pair right away.
        let remote_qp = remote.and_then(|remote| {
            let qp = remote.state().qp;
            qp
        });
        if let Some(remote_qp) = remote_qp {
            // SAFETY: both pairs are owned by live ids.
            unsafe { self.link_qps(ptr, remote_qp) };
        }
        Some(ptr)
    }

    /// # Safety
    ///
    /// `qp` must be live.
    pub(crate) unsafe fn qp_number(&self, qp: NativePtr<SoftQp>) -> u32 {
        // SAFETY: forwarded to our caller.
        unsafe { qp_shared(qp) }.qp_num
    }

    /// # Safety
    ///
    /// `id` must be live.
    pub(crate) unsafe fn free_id_qp(&self, id: NativePtr<SoftCmId>) -> Result<(), BridgeError> {
        // SAFETY: forwarded to our caller.
        let qp = unsafe { id_shared(id) }.state().qp.take();
        let qp = qp.ok_or_else(|| BridgeError::errno("rdma_destroy_qp", Errno::EINVAL))?;
        // SAFETY: taken from the id, owned by nobody else now.
        unsafe { self.free_qp(qp) };
        Ok(())
    }

    /// # Safety
    ///
    /// `qp` must be live, detached from its id, and is freed here.
    pub(crate) unsafe fn free_qp(&self, qp: NativePtr<SoftQp>) {
        // SAFETY: forwarded to our caller.
        let boxed = unsafe { qp.into_box() };
        let mut state = boxed.shared.state();
        state.destroyed = true;
        state.peer = Weak::new();
        state.recv_queue.clear();
    }

    /// # Safety
    ///
    /// Both pairs must be live.
    pub(crate) unsafe fn link_qps(&self, a: NativePtr<SoftQp>, b: NativePtr<SoftQp>) {
        // SAFETY: forwarded to our caller.
        let (a, b) = unsafe { (qp_shared(a), qp_shared(b)) };
        for (qp, peer) in [(a, b), (b, a)] {
            let mut state = qp.state();
            state.peer = Arc::downgrade(peer);
            state.attr.qp_state = QpState::Rts;
        }
        tracing::debug!("linked qp {} with qp {}", a.qp_num, b.qp_num);
    }

    /// Moves a pair out of the connected state into `Error`, flushing posted
    /// receives.
    ///
    /// # Safety
    ///
    /// `qp` must be live.
    pub(crate) unsafe fn unlink_qp(&self, qp: NativePtr<SoftQp>) {
        // SAFETY: forwarded to our caller.
        let shared = unsafe { qp_shared(qp) };
        let flushed: Vec<RecvWr> = {
            let mut state = shared.state();
            state.peer = Weak::new();
            state.attr.qp_state = QpState::Error;
            state.recv_queue.drain(..).collect()
        };
        shared.flush(flushed);
    }

    /// Applies the fields of `attr` selected by `mask`. Entering `Error`
    /// flushes posted receives; entering `Reset` discards them. Either one
    /// ends the connection.
    ///
    /// # Safety
    ///
    /// `qp` must be live.
    pub(crate) unsafe fn change_qp(
        &self,
        qp: NativePtr<SoftQp>,
        attr: &QpAttr,
        mask: QpAttrMask,
    ) -> Result<(), BridgeError> {
        // SAFETY: forwarded to our caller.
        let shared = unsafe { qp_shared(qp) };
        let flushed: Vec<RecvWr> = {
            let mut state = shared.state();
            let from = state.attr.qp_state;
            if mask.contains(QpAttrMask::STATE) && !from.can_move_to(attr.qp_state) {
                tracing::debug!("qp {} cannot move from {:?} to {:?}", shared.qp_num, from, attr.qp_state);
                return Err(BridgeError::errno("ibv_modify_qp", Errno::EINVAL));
            }
            if mask.contains(QpAttrMask::TIMEOUT) {
                state.attr.timeout = attr.timeout;
            }
            if mask.contains(QpAttrMask::RETRY_CNT) {
                state.attr.retry_cnt = attr.retry_cnt;
            }
            if mask.contains(QpAttrMask::RNR_RETRY) {
                state.attr.rnr_retry = attr.rnr_retry;
            }
            if mask.contains(QpAttrMask::MIN_RNR_TIMER) {
                state.attr.min_rnr_timer = attr.min_rnr_timer;
            }
            if !mask.contains(QpAttrMask::STATE) {
                return Ok(());
            }
            state.attr.qp_state = attr.qp_state;
            match attr.qp_state {
                QpState::Error => {
                    state.peer = Weak::new();
                    state.recv_queue.drain(..).collect()
                }
                QpState::Reset => {
                    state.peer = Weak::new();
                    state.recv_queue.clear();
                    Vec::new()
                }
                _ => Vec::new(),
            }
        };
        tracing::debug!("qp {} now {:?}", shared.qp_num, attr.qp_state);
        shared.flush(flushed);
        Ok(())
    }

    /// # Safety
    ///
    /// `qp` must be live.
    pub(crate) unsafe fn qp_attr(&self, qp: NativePtr<SoftQp>) -> QpAttr {
        // SAFETY: forwarded to our caller.
        unsafe { qp_shared(qp) }.state().attr
    }

    /// # Safety
    ///
    /// `qp` must be live.
    pub(crate) unsafe fn queue_recv(&self, qp: NativePtr<SoftQp>, wrs: &[RecvWr]) -> Result<(), BridgeError> {
        // SAFETY: forwarded to our caller.
        let shared = unsafe { qp_shared(qp) };
        let mut state = shared.state();
        if state.attr.qp_state == QpState::Reset {
            return Err(BridgeError::errno("ibv_post_recv", Errno::EINVAL));
        }
        if state.recv_queue.len() + wrs.len() > shared.cap.max_recv_wr as usize {
            return Err(BridgeError::errno("ibv_post_recv", Errno::ENOMEM));
        }
        if wrs.iter().any(|wr| wr.sg_list.len() > shared.cap.max_recv_sge as usize) {
            return Err(BridgeError::errno("ibv_post_recv", Errno::EINVAL));
        }
        state.recv_queue.extend(wrs.iter().cloned());
        Ok(())
    }

    /// # Safety
    ///
    /// `qp` must be live.
    pub(crate) unsafe fn execute_sends(&self, qp: NativePtr<SoftQp>, wrs: &[SendWr]) -> Result<(), BridgeError> {
        // SAFETY: forwarded to our caller.
        let shared = unsafe { qp_shared(qp) };
        if wrs.len() > shared.cap.max_send_wr as usize {
            return Err(BridgeError::errno("ibv_post_send", Errno::ENOMEM));
        }
        if wrs.iter().any(|wr| wr.sg_list.len() > shared.cap.max_send_sge as usize) {
            return Err(BridgeError::errno("ibv_post_send", Errno::EINVAL));
        }
        let peer = {
            let state = shared.state();
            if state.attr.qp_state != QpState::Rts {
                return Err(BridgeError::errno("ibv_post_send", Errno::EINVAL));
            }
            state.peer.upgrade()
        };
        let Some(peer) = peer else {
            return Err(BridgeError::errno("ibv_post_send", Errno::EINVAL));
        };
        for wr in wrs {
            let (status, byte_len) = if peer.receives() {
                self.execute_send(shared, &peer, wr)
            } else {
                (WcStatus::RetryExcErr, 0)
            };
            if status != WcStatus::Success {
                tracing::debug!("qp {} wr_id {} failed: {:?}", shared.qp_num, wr.wr_id, status);
            }
            if status != WcStatus::Success || wr.signaled || shared.sq_sig_all {
                shared.send_cq.complete(WorkCompletion {
                    wr_id: wr.wr_id,
                    status,
                    opcode: wr.opcode.into(),
                    byte_len,
                    qp_num: shared.qp_num,
                    ..WorkCompletion::default()
                });
            }
        }
        Ok(())
    }

    fn execute_send(&self, qp: &QpShared, peer: &QpShared, wr: &SendWr) -> (WcStatus, u32) {
        match wr.opcode {
            WrOpcode::Send | WrOpcode::SendWithImm => {
                let payload = match self.gather(qp.pd, &wr.sg_list) {
                    Ok(payload) => payload,
                    Err(status) => return (status, 0),
                };
                let imm = match wr.opcode {
                    WrOpcode::SendWithImm => wr.imm_data,
                    _ => None,
                };
                self.deliver_recv(qp, peer, &payload, imm)
            }
            WrOpcode::RdmaWrite | WrOpcode::RdmaWriteWithImm => {
                let payload = match self.gather(qp.pd, &wr.sg_list) {
                    Ok(payload) => payload,
                    Err(status) => return (status, 0),
                };
                if !self.remote_ok(peer.pd, wr.rkey, wr.remote_addr, payload.len(), AccessFlags::REMOTE_WRITE) {
                    return (WcStatus::RemAccessErr, 0);
                }
                // SAFETY: the remote region covers the range and stays
                // registered memory per `reg_mr`'s contract.
                unsafe {
                    std::ptr::copy(payload.as_ptr(), dma_ptr(wr.remote_addr), payload.len());
                }
                let len = payload.len() as u32;
                if wr.opcode == WrOpcode::RdmaWriteWithImm {
                    let Some(recv) = Self::take_recv(peer) else {
                        return (WcStatus::RnrRetryExcErr, 0);
                    };
                    peer.recv_cq.complete(WorkCompletion {
                        opcode: WcOpcode::RecvRdmaWithImm,
                        byte_len: len,
                        imm_data: wr.imm_data,
                        ..peer.recv_completion(recv.wr_id, WcStatus::Success, qp.qp_num)
                    });
                }
                (WcStatus::Success, len)
            }
            WrOpcode::RdmaRead => {
                let len = sge_total(&wr.sg_list);
                if !self.remote_ok(peer.pd, wr.rkey, wr.remote_addr, len, AccessFlags::REMOTE_READ) {
                    return (WcStatus::RemAccessErr, 0);
                }
                // SAFETY: the remote region covers the range.
                let data = unsafe { std::slice::from_raw_parts(dma_ptr(wr.remote_addr), len) }.to_vec();
                match self.scatter(qp.pd, &wr.sg_list, &data) {
                    Ok(()) => (WcStatus::Success, len as u32),
                    Err(status) => (status, 0),
                }
            }
        }
    }

    fn take_recv(peer: &QpShared) -> Option<RecvWr> {
        let mut state = peer.state();
        if state.destroyed {
            return None;
        }
        state.recv_queue.pop_front()
    }

    fn deliver_recv(&self, qp: &QpShared, peer: &QpShared, payload: &[u8], imm: Option<u32>) -> (WcStatus, u32) {
        let Some(recv) = Self::take_recv(peer) else {
            return (WcStatus::RnrRetryExcErr, 0);
        };
        if payload.len() > sge_total(&recv.sg_list) {
            peer.recv_cq
                .complete(peer.recv_completion(recv.wr_id, WcStatus::LocLenErr, qp.qp_num));
            return (WcStatus::RemInvReqErr, 0);
        }
        if let Err(status) = self.scatter(peer.pd, &recv.sg_list, payload) {
            peer.recv_cq
                .complete(peer.recv_completion(recv.wr_id, status, qp.qp_num));
            return (WcStatus::RemOpErr, 0);
        }
        let len = payload.len() as u32;
        peer.recv_cq.complete(WorkCompletion {
            byte_len: len,
            imm_data: imm,
            ..peer.recv_completion(recv.wr_id, WcStatus::Success, qp.qp_num)
        });
        (WcStatus::Success, len)
    }

    fn local_region(&self, pd: u32, sge: &Sge) -> Option<Region> {
        let region = *self.lkeys.get(&sge.lkey)?;
        (region.pd == pd && region.covers(sge.addr, sge.length as usize)).then_some(region)
    }

    fn remote_ok(&self, pd: u32, rkey: u32, addr: u64, len: usize, access: AccessFlags) -> bool {
        self.rkeys
            .get(&rkey)
            .is_some_and(|region| region.pd == pd && region.access.contains(access) && region.covers(addr, len))
    }

    fn gather(&self, pd: u32, sg_list: &[Sge]) -> Result<Vec<u8>, WcStatus> {
        let mut out = Vec::with_capacity(sge_total(sg_list));
        for sge in sg_list {
            if self.local_region(pd, sge).is_none() {
                return Err(WcStatus::LocProtErr);
            }
            // SAFETY: the region covers the entry.
            let bytes = unsafe { std::slice::from_raw_parts(dma_ptr(sge.addr), sge.length as usize) };
            out.extend_from_slice(bytes);
        }
        Ok(out)
    }

    fn scatter(&self, pd: u32, sg_list: &[Sge], mut data: &[u8]) -> Result<(), WcStatus> {
        for sge in sg_list {
            if data.is_empty() {
                break;
            }
            let region = self.local_region(pd, sge).ok_or(WcStatus::LocProtErr)?;
            if !region.access.contains(AccessFlags::LOCAL_WRITE) {
                return Err(WcStatus::LocProtErr);
            }
            let n = data.len().min(sge.length as usize);
            // SAFETY: the region covers the entry and is locally writable.
            unsafe { std::ptr::copy(data.as_ptr(), dma_ptr(sge.addr), n) };
            data = &data[n..];
        }
        Ok(())
    }

    fn issue_key(&self, map: &DashMap<u32, Region>, region: Region) -> u32 {
        loop {
            let key = self.rng.lock().unwrap_or_else(PoisonError::into_inner).gen::<u32>() | 0x100;
            if let Entry::Vacant(entry) = map.entry(key) {
                entry.insert(region);
                return key;
            }
        }
    }

    /// # Safety
    ///
    /// `pd` must be live; the buffer must stay valid until deregistered.
    pub(crate) unsafe fn register(
        &self,
        pd: NativePtr<SoftPd>,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> Option<NativePtr<SoftMr>> {
        if access.contains(AccessFlags::REMOTE_WRITE) && !access.contains(AccessFlags::LOCAL_WRITE) {
            tracing::warn!("remote write access requires local write access");
            return None;
        }
        let region = Region {
            addr: dma_addr(addr),
            len,
            access,
            // SAFETY: forwarded to our caller.
            pd: unsafe { pd.as_ref() }.handle,
        };
        let keys = MrKeys {
            lkey: self.issue_key(&self.lkeys, region),
            rkey: self.issue_key(&self.rkeys, region),
            registration: self.next_registration.fetch_add(1, Ordering::Relaxed),
        };
        Some(NativePtr::from_box(Box::new(SoftMr { keys })))
    }

    /// # Safety
    ///
    /// `mr` must be live.
    pub(crate) unsafe fn keys_of(&self, mr: NativePtr<SoftMr>) -> MrKeys {
        // SAFETY: forwarded to our caller.
        unsafe { mr.as_ref() }.keys
    }

    /// # Safety
    ///
    /// `mr` must be live and is freed here.
    pub(crate) unsafe fn deregister(&self, mr: NativePtr<SoftMr>) {
        // SAFETY: forwarded to our caller.
        let mr = unsafe { mr.into_box() };
        self.lkeys.remove(&mr.keys.lkey);
        self.rkeys.remove(&mr.keys.rkey);
    }
}
