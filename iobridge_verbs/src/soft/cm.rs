/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Connection management on the in-process fabric.
//!
//! A listener is found by its bound address (or the wildcard address with the
//! same port). Connecting creates the passive side's id immediately and
//! queues it on the listener's channel inside a `CONNECT_REQUEST`; accepting
//! links the two queue pairs and raises `ESTABLISHED` on both sides.

use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::OnceLock;
use std::sync::PoisonError;
use std::sync::Weak;
use std::sync::atomic::Ordering;

use dashmap::mapref::entry::Entry;
use iobridge::BridgeError;
use iobridge::NativePtr;
use nix::errno::Errno;

use super::SoftVerbs;
use super::device::SoftQp;
use super::queue::EventQueue;
use crate::verbs_primitives::CmEventKind;
use crate::verbs_primitives::ConnParam;
use crate::verbs_primitives::PortSpace;
use crate::verbs_primitives::RawCmEvent;

/// Reject status reported when nothing listens on the destination.
pub const REJECT_NO_LISTENER: i32 = 28;
/// Reject status reported when the listener's backlog is full or the passive
/// side went away before accepting.
pub const REJECT_CONSUMER: i32 = 14;

const DEFAULT_BACKLOG: usize = 128;
const EPHEMERAL_BASE: u32 = 32768;
const EPHEMERAL_SPAN: u32 = 28232;

/// Connection manager event channel.
pub struct SoftEventChannel {
    pub(crate) events: EventQueue<SoftCmEvent>,
}

/// A queued connection manager event.
#[derive(Debug)]
pub struct SoftCmEvent {
    kind: CmEventKind,
    status: i32,
    listen_id: Option<NativePtr<SoftCmId>>,
    id: Option<NativePtr<SoftCmId>>,
    private_data: Vec<u8>,
}

/// Connection id.
pub struct SoftCmId {
    pub(crate) shared: Arc<IdShared>,
}

pub(crate) struct IdShared {
    channel: NativePtr<SoftEventChannel>,
    port_space: PortSpace,
    this: OnceLock<NativePtr<SoftCmId>>,
    state: Mutex<IdState>,
}

#[derive(Default)]
pub(crate) struct IdState {
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
    pub(crate) on_device: bool,
    addr_resolved: bool,
    route_resolved: bool,
    /// Set once listening.
    backlog: Option<usize>,
    /// Connect requests queued but not yet accepted.
    pending: usize,
    /// The listener of a passive id that has not been accepted yet.
    listener: Weak<IdShared>,
    pub(crate) remote: Weak<IdShared>,
    pub(crate) connected: bool,
    pub(crate) qp: Option<NativePtr<SoftQp>>,
    pub(crate) destroyed: bool,
}

impl IdShared {
    fn new(channel: NativePtr<SoftEventChannel>, port_space: PortSpace, state: IdState) -> Arc<Self> {
        Arc::new(Self {
            channel,
            port_space,
            this: OnceLock::new(),
            state: Mutex::new(state),
        })
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, IdState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ptr(&self) -> Option<NativePtr<SoftCmId>> {
        self.this.get().copied()
    }

    /// Queues an event on this id's channel. Returns false, dropping the
    /// event, once the id is destroyed.
    fn deliver(
        &self,
        kind: CmEventKind,
        status: i32,
        listen_id: Option<NativePtr<SoftCmId>>,
        id: Option<NativePtr<SoftCmId>>,
        private_data: Vec<u8>,
    ) -> bool {
        let state = self.state();
        if state.destroyed {
            return false;
        }
        // SAFETY: a live id keeps its channel alive, and `destroyed` is only
        // set under the state lock held here.
        let channel = unsafe { self.channel.as_ref() };
        channel.events.push(SoftCmEvent {
            kind,
            status,
            listen_id,
            id,
            private_data,
        });
        true
    }

    /// Queues an event about this id itself.
    fn notify(&self, kind: CmEventKind, status: i32, private_data: Vec<u8>) -> bool {
        self.deliver(kind, status, None, self.ptr(), private_data)
    }
}

fn boxed_id(shared: Arc<IdShared>) -> NativePtr<SoftCmId> {
    let ptr = NativePtr::from_box(Box::new(SoftCmId {
        shared: shared.clone(),
    }));
    // Set exactly once, before the pointer escapes.
    let _ = shared.this.set(ptr);
    ptr
}

/// # Safety
///
/// `id` must be a live id of this provider.
pub(crate) unsafe fn id_shared<'a>(id: NativePtr<SoftCmId>) -> &'a Arc<IdShared> {
    // SAFETY: forwarded to our caller.
    unsafe { &id.as_ref().shared }
}

fn einval(op: &'static str) -> BridgeError {
    BridgeError::errno(op, Errno::EINVAL)
}

fn loopback_like(addr: &SocketAddr) -> IpAddr {
    match addr {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
    }
}

fn wildcard_like(addr: &SocketAddr) -> SocketAddr {
    let ip = match addr {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, addr.port())
}

impl SoftVerbs {
    fn ephemeral_port(&self) -> u16 {
        let n = self.next_port.fetch_add(1, Ordering::Relaxed);
        // Always below u16::MAX.
        (EPHEMERAL_BASE + n % EPHEMERAL_SPAN) as u16
    }

    pub(crate) fn open_event_channel(&self) -> Option<NativePtr<SoftEventChannel>> {
        match EventQueue::new() {
            Ok(events) => Some(NativePtr::from_box(Box::new(SoftEventChannel { events }))),
            Err(err) => {
                tracing::error!("failed to open event channel: {}", err);
                None
            }
        }
    }

    /// # Safety
    ///
    /// `channel` must be live and unused by any id.
    pub(crate) unsafe fn close_event_channel(&self, channel: NativePtr<SoftEventChannel>) {
        // SAFETY: forwarded to our caller.
        let channel = unsafe { channel.into_box() };
        for event in channel.events.drain() {
            if let (CmEventKind::ConnectRequest, Some(child)) = (event.kind, event.id) {
                // SAFETY: the passive id of an unfetched request was never
                // handed out.
                unsafe { self.free_id(child) };
            }
        }
        drop(channel);
    }

    /// # Safety
    ///
    /// `channel` must be live.
    pub(crate) unsafe fn next_cm_event(
        &self,
        channel: NativePtr<SoftEventChannel>,
    ) -> Result<NativePtr<SoftCmEvent>, BridgeError> {
        // SAFETY: forwarded to our caller.
        let event = unsafe { channel.as_ref() }.events.pop()?;
        Ok(NativePtr::from_box(Box::new(event)))
    }

    /// # Safety
    ///
    /// `event` must be fetched and not yet acknowledged.
    pub(crate) unsafe fn read_cm_event(&self, event: NativePtr<SoftCmEvent>) -> RawCmEvent<SoftCmId> {
        // SAFETY: forwarded to our caller.
        let event = unsafe { event.as_ref() };
        RawCmEvent {
            kind: event.kind,
            status: event.status,
            listen_id: event.listen_id,
            id: event.id,
            private_data: event.private_data.clone(),
        }
    }

    pub(crate) fn new_id(
        &self,
        channel: NativePtr<SoftEventChannel>,
        port_space: PortSpace,
    ) -> NativePtr<SoftCmId> {
        boxed_id(IdShared::new(channel, port_space, IdState::default()))
    }

    /// # Safety
    ///
    /// `id` must be live.
    pub(crate) unsafe fn bind(&self, id: NativePtr<SoftCmId>, addr: SocketAddr) -> Result<(), BridgeError> {
        // SAFETY: forwarded to our caller.
        let shared = unsafe { id_shared(id) };
        let mut state = shared.state();
        if state.local.is_some() {
            return Err(einval("rdma_bind_addr"));
        }
        let addr = if addr.port() == 0 {
            SocketAddr::new(addr.ip(), self.ephemeral_port())
        } else {
            addr
        };
        match self.bound.entry(addr) {
            Entry::Occupied(entry) if entry.get().strong_count() > 0 => {
                return Err(BridgeError::errno("rdma_bind_addr", Errno::EADDRINUSE));
            }
            Entry::Occupied(mut entry) => {
                entry.insert(Arc::downgrade(shared));
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::downgrade(shared));
            }
        }
        state.local = Some(addr);
        state.on_device = true;
        tracing::debug!("{:?} id bound to {}", shared.port_space, addr);
        Ok(())
    }

    /// # Safety
    ///
    /// `id` must be live.
    pub(crate) unsafe fn start_listening(&self, id: NativePtr<SoftCmId>, backlog: i32) -> Result<(), BridgeError> {
        // SAFETY: forwarded to our caller.
        let mut state = unsafe { id_shared(id) }.state();
        if state.local.is_none() {
            return Err(einval("rdma_listen"));
        }
        state.backlog = Some(match usize::try_from(backlog) {
            Ok(0) | Err(_) => DEFAULT_BACKLOG,
            Ok(n) => n,
        });
        Ok(())
    }

    /// # Safety
    ///
    /// `id` must be live.
    pub(crate) unsafe fn start_resolve_addr(
        &self,
        id: NativePtr<SoftCmId>,
        src: Option<SocketAddr>,
        dst: SocketAddr,
    ) -> Result<(), BridgeError> {
        // SAFETY: forwarded to our caller.
        let shared = unsafe { id_shared(id) };
        {
            let mut state = shared.state();
            if state.connected {
                return Err(einval("rdma_resolve_addr"));
            }
            if state.local.is_none() {
                let ip = src.map(|s| s.ip()).unwrap_or_else(|| loopback_like(&dst));
                let port = match src.map(|s| s.port()) {
                    Some(port) if port != 0 => port,
                    _ => self.ephemeral_port(),
                };
                state.local = Some(SocketAddr::new(ip, port));
            }
            state.peer = Some(dst);
            state.on_device = true;
            state.addr_resolved = true;
        }
        shared.notify(CmEventKind::AddrResolved, 0, Vec::new());
        Ok(())
    }

    /// # Safety
    ///
    /// `id` must be live.
    pub(crate) unsafe fn start_resolve_route(&self, id: NativePtr<SoftCmId>) -> Result<(), BridgeError> {
        // SAFETY: forwarded to our caller.
        let shared = unsafe { id_shared(id) };
        {
            let mut state = shared.state();
            if !state.addr_resolved {
                return Err(einval("rdma_resolve_route"));
            }
            state.route_resolved = true;
        }
        shared.notify(CmEventKind::RouteResolved, 0, Vec::new());
        Ok(())
    }

    fn find_listener(&self, dst: &SocketAddr) -> Option<Arc<IdShared>> {
        let exact = self.bound.get(dst).and_then(|entry| entry.upgrade());
        exact.or_else(|| {
            self.bound
                .get(&wildcard_like(dst))
                .and_then(|entry| entry.upgrade())
        })
    }

    /// # Safety
    ///
    /// `id` must be live.
    pub(crate) unsafe fn request_connection(
        &self,
        id: NativePtr<SoftCmId>,
        param: &ConnParam,
    ) -> Result<(), BridgeError> {
        // SAFETY: forwarded to our caller.
        let connector = unsafe { id_shared(id) };
        let (local, dst) = {
            let state = connector.state();
            if !state.route_resolved || state.connected || state.remote.strong_count() > 0 {
                return Err(einval("rdma_connect"));
            }
            match (state.local, state.peer) {
                (Some(local), Some(peer)) => (local, peer),
                _ => return Err(einval("rdma_connect")),
            }
        };

        let Some(listener) = self.find_listener(&dst) else {
            tracing::debug!("no listener on {}", dst);
            connector.notify(CmEventKind::Rejected, REJECT_NO_LISTENER, Vec::new());
            return Ok(());
        };
        let admitted = {
            let mut state = listener.state();
            match state.backlog {
                Some(backlog) if state.pending < backlog && !state.destroyed => {
                    state.pending += 1;
                    true
                }
                _ => false,
            }
        };
        if !admitted {
            tracing::debug!("listener on {} refused connection from {}", dst, local);
            connector.notify(CmEventKind::Rejected, REJECT_CONSUMER, Vec::new());
            return Ok(());
        }

        let child = IdShared::new(
            listener.channel,
            listener.port_space,
            IdState {
                local: Some(dst),
                peer: Some(local),
                on_device: true,
                addr_resolved: true,
                route_resolved: true,
                listener: Arc::downgrade(&listener),
                remote: Arc::downgrade(connector),
                ..IdState::default()
            },
        );
        let child_ptr = boxed_id(child.clone());
        connector.state().remote = Arc::downgrade(&child);
        if !listener.deliver(
            CmEventKind::ConnectRequest,
            0,
            listener.ptr(),
            Some(child_ptr),
            param.private_data.clone(),
        ) {
            // SAFETY: never published.
            unsafe { self.free_id(child_ptr) };
        }
        Ok(())
    }

    /// # Safety
    ///
    /// `id` must be live.
    pub(crate) unsafe fn accept_connection(
        &self,
        id: NativePtr<SoftCmId>,
        param: &ConnParam,
    ) -> Result<(), BridgeError> {
        // SAFETY: forwarded to our caller.
        let child = unsafe { id_shared(id) };
        let (remote, listener, qp) = {
            let mut state = child.state();
            if state.connected {
                return Err(einval("rdma_accept"));
            }
            let listener = std::mem::take(&mut state.listener);
            (state.remote.upgrade(), listener, state.qp)
        };
        if let Some(listener) = listener.upgrade() {
            let mut state = listener.state();
            state.pending = state.pending.saturating_sub(1);
        }
        let Some(remote) = remote else {
            return Err(BridgeError::errno("rdma_accept", Errno::ECONNRESET));
        };
        let remote_qp = remote.state().qp;
        if let (Some(a), Some(b)) = (qp, remote_qp) {
            // SAFETY: both ids are live and own their queue pairs.
            unsafe { self.link_qps(a, b) };
        }
        child.state().connected = true;
        remote.state().connected = true;
        child.notify(CmEventKind::Established, 0, Vec::new());
        remote.notify(CmEventKind::Established, 0, param.private_data.clone());
        Ok(())
    }

    /// # Safety
    ///
    /// `id` must be live.
    pub(crate) unsafe fn disconnect_id(&self, id: NativePtr<SoftCmId>) -> Result<(), BridgeError> {
        // SAFETY: forwarded to our caller.
        let shared = unsafe { id_shared(id) };
        let (remote, qp) = {
            let mut state = shared.state();
            if !state.connected {
                return Err(einval("rdma_disconnect"));
            }
            state.connected = false;
            (std::mem::take(&mut state.remote).upgrade(), state.qp)
        };
        if let Some(qp) = qp {
            // SAFETY: owned by a live id.
            unsafe { self.unlink_qp(qp) };
        }
        shared.notify(CmEventKind::Disconnected, 0, Vec::new());
        if let Some(remote) = remote {
            self.drop_remote(&remote);
        }
        Ok(())
    }

    /// Tears down the far end of a connection whose near end went away.
    fn drop_remote(&self, remote: &IdShared) {
        let (was_connected, qp) = {
            let mut state = remote.state();
            let was_connected = state.connected;
            state.connected = false;
            state.remote = Weak::new();
            (was_connected, state.qp)
        };
        if let Some(qp) = qp {
            // SAFETY: owned by `remote`, which is live while its state says
            // so; destroyed ids have already taken their queue pair.
            unsafe { self.unlink_qp(qp) };
        }
        if was_connected {
            remote.notify(CmEventKind::Disconnected, 0, Vec::new());
        }
    }

    /// Destroys an id, its queue pair, and any connect requests still queued
    /// for it.
    ///
    /// # Safety
    ///
    /// `id` must be live and is freed here.
    pub(crate) unsafe fn free_id(&self, id: NativePtr<SoftCmId>) {
        // SAFETY: forwarded to our caller.
        let boxed = unsafe { id.into_box() };
        let shared = boxed.shared.clone();
        let (local, connected, remote, listener, qp, listening) = {
            let mut state = shared.state();
            state.destroyed = true;
            (
                state.local,
                state.connected,
                std::mem::take(&mut state.remote).upgrade(),
                std::mem::take(&mut state.listener).upgrade(),
                state.qp.take(),
                state.backlog.is_some(),
            )
        };

        if let Some(local) = local {
            self.bound
                .remove_if(&local, |_, entry| std::ptr::eq(entry.as_ptr(), Arc::as_ptr(&shared)));
        }
        if let Some(listener) = &listener {
            let mut state = listener.state();
            state.pending = state.pending.saturating_sub(1);
        }
        if let Some(remote) = remote {
            if connected {
                self.drop_remote(&remote);
            } else if listener.is_some() {
                // Passive side went away before accepting.
                remote.state().remote = Weak::new();
                remote.notify(CmEventKind::Rejected, REJECT_CONSUMER, Vec::new());
            }
        }
        if let Some(qp) = qp {
            // SAFETY: taken from the id, so owned by nobody else now.
            unsafe { self.free_qp(qp) };
        }

        // SAFETY: the channel outlives its ids, including this one until the
        // end of this call.
        let channel = unsafe { shared.channel.as_ref() };
        let stale = channel
            .events
            .remove_where(|event| event.id == Some(id) || (listening && event.listen_id == Some(id)));
        for event in stale {
            if let (CmEventKind::ConnectRequest, Some(child)) = (event.kind, event.id) {
                if child != id {
                    // SAFETY: queued passive ids were never handed out.
                    unsafe { self.free_id(child) };
                }
            }
        }
        drop(boxed);
    }

    /// # Safety
    ///
    /// `id` must be live.
    pub(crate) unsafe fn id_addrs(&self, id: NativePtr<SoftCmId>) -> (Option<SocketAddr>, Option<SocketAddr>) {
        // SAFETY: forwarded to our caller.
        let state = unsafe { id_shared(id) }.state();
        (state.local, state.peer)
    }
}
