/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Connection manager operations of the [`VerbsDispatcher`].

use std::net::SocketAddr;
use std::time::Duration;

use iobridge::BridgeError;
use iobridge::Handle;
use iobridge::NativePtr;
use iobridge::Parent;
use nix::errno::Errno;

use crate::dispatcher::VerbsDispatcher;
use crate::event_bridge::EventAck;
use crate::event_bridge::arm_nonblocking;
use crate::event_bridge::wait_readable;
use crate::provider::VerbsProvider;
use crate::sockaddr::decode_sockaddr;
use crate::verbs_primitives::CmEvent;
use crate::verbs_primitives::CmEventKind;
use crate::verbs_primitives::ConnParam;
use crate::verbs_primitives::PortSpace;
use crate::verbs_primitives::RawCmEvent;

/// True for the status a non-blocking fetch returns when another poller took
/// the pending event first.
fn is_would_block(err: &BridgeError) -> bool {
    matches!(
        err,
        BridgeError::NativeCallFailed { code, .. } if *code == -(Errno::EAGAIN as i32)
    )
}

impl<P: VerbsProvider> VerbsDispatcher<P> {
    /// Opens an event channel whose descriptor is already non-blocking.
    pub fn create_event_channel(&self) -> Result<Handle, BridgeError> {
        let channel = self.provider.create_event_channel();
        if let Some(channel) = channel {
            // SAFETY: freshly created by the provider.
            let fd = unsafe { self.provider.event_channel_fd(channel) };
            if let Err(err) = arm_nonblocking(fd) {
                // SAFETY: never published, destroyed exactly once.
                if let Err(destroy_err) = unsafe { self.provider.destroy_event_channel(channel) } {
                    tracing::error!("failed to close unusable event channel: {}", destroy_err);
                }
                return Err(err);
            }
        }
        let handle = self.registry.adopt(&self.event_channels, channel, &[], |_| {})?;
        tracing::debug!("created event channel {}", handle);
        Ok(handle)
    }

    /// Closes an event channel. Rejected while connection ids still report to
    /// it.
    pub fn destroy_event_channel(&self, channel: Handle) -> Result<(), BridgeError> {
        self.registry.release(&self.event_channels, channel, &[], |ptr| {
            // SAFETY: the registry removed the entry; nobody else can reach it.
            unsafe { self.provider.destroy_event_channel(ptr) }
        })
    }

    /// Creates a connection id reporting to `channel`.
    pub fn create_id(&self, channel: Handle, port_space: PortSpace) -> Result<Handle, BridgeError> {
        let channel_ptr = self.event_channels.lookup(channel)?;
        // SAFETY: resolved through the table.
        let id = unsafe { self.provider.create_id(channel_ptr, port_space) };
        self.registry.adopt(
            &self.cm_ids,
            id,
            &[Parent::reject(&self.event_channels, channel)],
            |id| self.discard_id(id),
        )
    }

    /// Binds `id` to a local address. Port zero picks an ephemeral port.
    pub fn bind_addr(&self, id: Handle, addr: SocketAddr) -> Result<(), BridgeError> {
        let ptr = self.cm_ids.lookup(id)?;
        // SAFETY: resolved through the table.
        unsafe { self.provider.bind_addr(ptr, addr) }
    }

    /// [`Self::bind_addr`] from a raw `sockaddr` image.
    pub fn bind_addr_bytes(&self, id: Handle, addr: &[u8]) -> Result<(), BridgeError> {
        self.bind_addr(id, decode_sockaddr(addr)?)
    }

    /// Starts listening on a bound id.
    pub fn listen(&self, id: Handle, backlog: i32) -> Result<(), BridgeError> {
        let ptr = self.cm_ids.lookup(id)?;
        // SAFETY: resolved through the table.
        unsafe { self.provider.listen(ptr, backlog) }
    }

    /// Starts resolving `dst`. Completion arrives as an `ADDR_RESOLVED` or
    /// `ADDR_ERROR` event.
    pub fn resolve_addr(
        &self,
        id: Handle,
        src: Option<SocketAddr>,
        dst: SocketAddr,
    ) -> Result<(), BridgeError> {
        let ptr = self.cm_ids.lookup(id)?;
        // SAFETY: resolved through the table.
        unsafe {
            self.provider
                .resolve_addr(ptr, src, dst, self.config.resolve_timeout_ms)
        }
    }

    /// [`Self::resolve_addr`] from raw `sockaddr` images. An empty source
    /// leaves the source unspecified.
    pub fn resolve_addr_bytes(&self, id: Handle, src: &[u8], dst: &[u8]) -> Result<(), BridgeError> {
        let src = if src.is_empty() {
            None
        } else {
            Some(decode_sockaddr(src)?)
        };
        self.resolve_addr(id, src, decode_sockaddr(dst)?)
    }

    /// Starts resolving the route. Completion arrives as a `ROUTE_RESOLVED` or
    /// `ROUTE_ERROR` event.
    pub fn resolve_route(&self, id: Handle) -> Result<(), BridgeError> {
        let ptr = self.cm_ids.lookup(id)?;
        // SAFETY: resolved through the table.
        unsafe { self.provider.resolve_route(ptr, self.config.resolve_timeout_ms) }
    }

    /// Waits up to `timeout` for the next event on `channel`.
    ///
    /// Returns `Ok(None)` if nothing arrived in time. A fetched event is
    /// always acknowledged before this returns, whether translation succeeds
    /// or not. The connection id carried by a `CONNECT_REQUEST` is new; it is
    /// issued a handle here and belongs to the caller from then on.
    pub fn poll_cm_event(
        &self,
        channel: Handle,
        timeout: Duration,
    ) -> Result<Option<CmEvent>, BridgeError> {
        let channel_ptr = self.event_channels.lookup(channel)?;
        // SAFETY: resolved through the table.
        let fd = unsafe { self.provider.event_channel_fd(channel_ptr) };
        if !wait_readable(fd, timeout)? {
            return Ok(None);
        }
        // SAFETY: resolved through the table; the descriptor is non-blocking.
        let event = match unsafe { self.provider.get_cm_event(channel_ptr) } {
            Ok(event) => event,
            Err(err) if is_would_block(&err) => {
                tracing::debug!("event on channel {} taken by another poller", channel);
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        // SAFETY: just fetched, not acknowledged anywhere else.
        let ack = unsafe { EventAck::new(&self.provider, event) };
        // SAFETY: the event stays valid until `ack` drops.
        let raw = unsafe { self.provider.decode_cm_event(ack.event()) };
        self.translate_event(channel, raw).map(Some)
    }

    fn translate_event(
        &self,
        channel: Handle,
        raw: RawCmEvent<P::CmId>,
    ) -> Result<CmEvent, BridgeError> {
        let listen_id = raw.listen_id.and_then(|ptr| self.known_id(ptr));
        let id = match (raw.kind, raw.id) {
            (CmEventKind::ConnectRequest, Some(ptr)) => Some(self.registry.adopt(
                &self.cm_ids,
                Some(ptr),
                &[Parent::reject(&self.event_channels, channel)],
                |id| self.discard_id(id),
            )?),
            (_, Some(ptr)) => self.known_id(ptr),
            (_, None) => None,
        };
        tracing::debug!(
            "cm event {:?} status {} on channel {} for id {:?}",
            raw.kind,
            raw.status,
            channel,
            id
        );
        Ok(CmEvent {
            kind: raw.kind,
            status: raw.status,
            listen_id,
            id,
            private_data: raw.private_data,
        })
    }

    fn known_id(&self, ptr: NativePtr<P::CmId>) -> Option<Handle> {
        match self.cm_ids.handle_for(ptr) {
            Ok(handle) => Some(handle),
            Err(err) => {
                tracing::warn!("event names an id without a live handle: {}", err);
                None
            }
        }
    }

    /// Sends a connect request.
    ///
    /// Zero responder resources or initiator depth default to the device's
    /// `max_qp_rd_atom`; zero retry counts default to the configured ones.
    pub fn connect(&self, id: Handle, param: &ConnParam) -> Result<(), BridgeError> {
        let ptr = self.cm_ids.lookup(id)?;
        let param = self.conn_param(ptr, param)?;
        // SAFETY: resolved through the table.
        unsafe { self.provider.connect(ptr, &param) }
    }

    /// Accepts a connect request received on `id`, with the same defaulting as
    /// [`Self::connect`].
    pub fn accept(&self, id: Handle, param: &ConnParam) -> Result<(), BridgeError> {
        let ptr = self.cm_ids.lookup(id)?;
        let param = self.conn_param(ptr, param)?;
        // SAFETY: resolved through the table.
        unsafe { self.provider.accept(ptr, &param) }
    }

    fn conn_param(&self, id: NativePtr<P::CmId>, param: &ConnParam) -> Result<ConnParam, BridgeError> {
        if param.private_data.len() > self.config.max_private_data {
            return Err(BridgeError::CapacityExceeded {
                capacity: self.config.max_private_data,
                requested: param.private_data.len(),
            });
        }
        let mut resolved = param.clone();
        if resolved.responder_resources == 0 || resolved.initiator_depth == 0 {
            // SAFETY: `id` was resolved through the table by the caller.
            if let Some(context) = unsafe { self.provider.id_context(id) } {
                // SAFETY: the provider returned a live context.
                let attr = unsafe { self.provider.query_device(context)? };
                let depth = u8::try_from(attr.max_qp_rd_atom).unwrap_or(u8::MAX);
                if resolved.responder_resources == 0 {
                    resolved.responder_resources = depth;
                }
                if resolved.initiator_depth == 0 {
                    resolved.initiator_depth = depth;
                }
            }
        }
        if resolved.retry_count == 0 {
            resolved.retry_count = self.config.retry_count;
        }
        if resolved.rnr_retry_count == 0 {
            resolved.rnr_retry_count = self.config.rnr_retry_count;
        }
        Ok(resolved)
    }

    /// Disconnects an established connection. The handle stays valid until
    /// [`Self::destroy_cm_id`].
    pub fn disconnect(&self, id: Handle) -> Result<(), BridgeError> {
        let ptr = self.cm_ids.lookup(id)?;
        // SAFETY: resolved through the table.
        unsafe { self.provider.disconnect(ptr) }
    }

    /// Destroys a connection id. A queue pair created on it is destroyed with
    /// it and its handle becomes invalid.
    pub fn destroy_cm_id(&self, id: Handle) -> Result<(), BridgeError> {
        self.registry.release(&self.cm_ids, id, &[&self.qps], |ptr| {
            // SAFETY: the registry removed the entry and its queue pair.
            unsafe { self.provider.destroy_id(ptr) }
        })
    }

    /// Destroys a connection id and its queue pair in one native call.
    pub fn destroy_ep(&self, id: Handle) -> Result<(), BridgeError> {
        self.registry.release(&self.cm_ids, id, &[&self.qps], |ptr| {
            // SAFETY: the registry removed the entry and its queue pair.
            unsafe { self.provider.destroy_ep(ptr) }
        })
    }

    /// Local address of `id`, once bound.
    pub fn src_addr(&self, id: Handle) -> Result<Option<SocketAddr>, BridgeError> {
        let ptr = self.cm_ids.lookup(id)?;
        // SAFETY: resolved through the table.
        Ok(unsafe { self.provider.local_addr(ptr) })
    }

    /// Peer address of `id`, once resolved or connected.
    pub fn dst_addr(&self, id: Handle) -> Result<Option<SocketAddr>, BridgeError> {
        let ptr = self.cm_ids.lookup(id)?;
        // SAFETY: resolved through the table.
        Ok(unsafe { self.provider.peer_addr(ptr) })
    }
}
