/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Verbs operations of the [`VerbsDispatcher`]: device contexts, protection
//! domains, completion channels and queues, queue pairs, memory regions, and
//! the post and poll data path.

use std::os::fd::RawFd;
use std::time::Duration;

use iobridge::BridgeError;
use iobridge::HandleDiscipline;
use iobridge::Handle;
use iobridge::Parent;
use iobridge::ResourceClass;
use iobridge::ResourceKey;
use nix::errno::Errno;

use crate::dispatcher::VerbsDispatcher;
use crate::event_bridge::arm_nonblocking;
use crate::event_bridge::wait_readable;
use crate::provider::VerbsProvider;
use crate::verbs_primitives::AccessFlags;
use crate::verbs_primitives::DeviceAttr;
use crate::verbs_primitives::MemoryRegionInfo;
use crate::verbs_primitives::MrKeys;
use crate::verbs_primitives::QpAttr;
use crate::verbs_primitives::QpAttrMask;
use crate::verbs_primitives::QpInitAttr;
use crate::verbs_primitives::RecvWr;
use crate::verbs_primitives::SendWr;
use crate::verbs_primitives::Sge;
use crate::verbs_primitives::WorkCompletion;

impl<P: VerbsProvider> VerbsDispatcher<P> {
    /// Handle of the device context `id` is bound to.
    ///
    /// Contexts are shared by every id on the same device; repeated calls
    /// return the same handle. Fails with `InvalidArgument` if `id` is not yet
    /// bound or resolved.
    pub fn get_context(&self, id: Handle) -> Result<Handle, BridgeError> {
        let ptr = self.cm_ids.lookup(id)?;
        // SAFETY: resolved through the table.
        let context = unsafe { self.provider.id_context(ptr) }
            .ok_or_else(|| BridgeError::invalid(format!("cm id {} is not bound to a device", id)))?;
        self.registry.adopt(&self.contexts, Some(context), &[], |_| {})
    }

    /// Command descriptor of a device context.
    pub fn context_fd(&self, context: Handle) -> Result<RawFd, BridgeError> {
        let ptr = self.contexts.lookup(context)?;
        // SAFETY: resolved through the table.
        Ok(unsafe { self.provider.context_fd(ptr) })
    }

    /// Device attributes.
    pub fn query_device(&self, context: Handle) -> Result<DeviceAttr, BridgeError> {
        let ptr = self.contexts.lookup(context)?;
        // SAFETY: resolved through the table.
        unsafe { self.provider.query_device(ptr) }
    }

    /// Allocates a protection domain on `context`.
    pub fn alloc_pd(&self, context: Handle) -> Result<Handle, BridgeError> {
        let ctx = self.contexts.lookup(context)?;
        // SAFETY: resolved through the table.
        let pd = unsafe { self.provider.alloc_pd(ctx) };
        self.registry.adopt(&self.pds, pd, &[], |_| {})
    }

    /// Native handle number of a protection domain.
    pub fn pd_handle(&self, pd: Handle) -> Result<u32, BridgeError> {
        let ptr = self.pds.lookup(pd)?;
        // SAFETY: resolved through the table.
        Ok(unsafe { self.provider.pd_handle(ptr) })
    }

    /// Deallocates a protection domain. Rejected while memory regions or
    /// queue pairs still use it.
    pub fn dealloc_pd(&self, pd: Handle) -> Result<(), BridgeError> {
        self.registry.release(&self.pds, pd, &[], |ptr| {
            // SAFETY: the registry removed the entry.
            unsafe { self.provider.dealloc_pd(ptr) }
        })
    }

    /// Opens a completion channel whose descriptor is already non-blocking.
    pub fn create_comp_channel(&self, context: Handle) -> Result<Handle, BridgeError> {
        let ctx = self.contexts.lookup(context)?;
        // SAFETY: resolved through the table.
        let channel = unsafe { self.provider.create_comp_channel(ctx) };
        if let Some(channel) = channel {
            // SAFETY: freshly created by the provider.
            let fd = unsafe { self.provider.comp_channel_fd(channel) };
            if let Err(err) = arm_nonblocking(fd) {
                // SAFETY: never published, destroyed exactly once.
                if let Err(destroy_err) = unsafe { self.provider.destroy_comp_channel(channel) } {
                    tracing::error!("failed to close unusable completion channel: {}", destroy_err);
                }
                return Err(err);
            }
        }
        self.registry.adopt(&self.comp_channels, channel, &[], |_| {})
    }

    /// Closes a completion channel. Rejected while completion queues still
    /// report to it.
    pub fn destroy_comp_channel(&self, channel: Handle) -> Result<(), BridgeError> {
        self.registry.release(&self.comp_channels, channel, &[], |ptr| {
            // SAFETY: the registry removed the entry.
            unsafe { self.provider.destroy_comp_channel(ptr) }
        })
    }

    /// Waits up to `timeout` for a completion event on `channel` and returns
    /// the handle of the queue it concerns. The event must later be
    /// acknowledged with [`Self::ack_cq_events`].
    pub fn get_cq_event(&self, channel: Handle, timeout: Duration) -> Result<Option<Handle>, BridgeError> {
        let ptr = self.comp_channels.lookup(channel)?;
        // SAFETY: resolved through the table.
        let fd = unsafe { self.provider.comp_channel_fd(ptr) };
        if !wait_readable(fd, timeout)? {
            return Ok(None);
        }
        // SAFETY: resolved through the table; the descriptor is non-blocking.
        let cq = match unsafe { self.provider.get_cq_event(ptr) } {
            Ok(cq) => cq,
            Err(BridgeError::NativeCallFailed { code, .. }) if code == -(Errno::EAGAIN as i32) => {
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        self.cqs.handle_for(cq).map(Some)
    }

    /// Creates a completion queue of at least `entries` entries.
    pub fn create_cq(
        &self,
        context: Handle,
        channel: Option<Handle>,
        entries: u32,
        comp_vector: u32,
    ) -> Result<Handle, BridgeError> {
        let ctx = self.contexts.lookup(context)?;
        let channel_ptr = channel.map(|c| self.comp_channels.lookup(c)).transpose()?;
        // SAFETY: resolved through the tables.
        let cq = unsafe { self.provider.create_cq(ctx, channel_ptr, entries, comp_vector) };
        let parents: Vec<Parent<'_>> = channel
            .map(|c| Parent::reject(&self.comp_channels, c))
            .into_iter()
            .collect();
        self.registry.adopt(&self.cqs, cq, &parents, |cq| {
            // SAFETY: never published.
            if let Err(err) = unsafe { self.provider.destroy_cq(cq) } {
                tracing::error!("failed to discard orphaned cq: {}", err);
            }
        })
    }

    /// Arms `cq` to raise one event on its channel for the next completion.
    pub fn req_notify_cq(&self, cq: Handle, solicited_only: bool) -> Result<(), BridgeError> {
        let ptr = self.cqs.lookup(cq)?;
        // SAFETY: resolved through the table.
        unsafe { self.provider.req_notify_cq(ptr, solicited_only) }
    }

    /// Acknowledges `count` completion events received for `cq`.
    pub fn ack_cq_events(&self, cq: Handle, count: u32) -> Result<(), BridgeError> {
        let ptr = self.cqs.lookup(cq)?;
        // SAFETY: resolved through the table.
        unsafe { self.provider.ack_cq_events(ptr, count) };
        Ok(())
    }

    /// Drains up to `out.len()` completions, oldest first, and returns how
    /// many were written.
    pub fn poll_cq(&self, cq: Handle, out: &mut [WorkCompletion]) -> Result<usize, BridgeError> {
        let ptr = self.cqs.lookup(cq)?;
        // SAFETY: resolved through the table.
        unsafe { self.provider.poll_cq(ptr, out) }
    }

    /// Destroys a completion queue. Rejected while queue pairs still use it.
    pub fn destroy_cq(&self, cq: Handle) -> Result<(), BridgeError> {
        self.registry.release(&self.cqs, cq, &[], |ptr| {
            // SAFETY: the registry removed the entry.
            unsafe { self.provider.destroy_cq(ptr) }
        })
    }

    /// Creates a queue pair on connection id `id`.
    ///
    /// The queue pair is destroyed with the id; the protection domain and both
    /// completion queues cannot be destroyed while it lives.
    pub fn create_qp(&self, id: Handle, pd: Handle, attr: &QpInitAttr) -> Result<Handle, BridgeError> {
        let id_ptr = self.cm_ids.lookup(id)?;
        let pd_ptr = self.pds.lookup(pd)?;
        let send_cq = self.cqs.lookup(attr.send_cq)?;
        let recv_cq = self.cqs.lookup(attr.recv_cq)?;
        // SAFETY: resolved through the tables.
        let qp = unsafe {
            self.provider.create_qp(
                id_ptr,
                pd_ptr,
                send_cq,
                recv_cq,
                attr.qp_type,
                &attr.cap,
                attr.sq_sig_all,
            )
        };
        let handle = self.registry.adopt(
            &self.qps,
            qp,
            &[
                Parent::cascade(&self.cm_ids, id),
                Parent::reject(&self.pds, pd),
                Parent::reject(&self.cqs, attr.send_cq),
                Parent::reject(&self.cqs, attr.recv_cq),
            ],
            |_| {
                // A destroyed id already took its queue pair with it.
                if !self.cm_ids.contains(id) {
                    return;
                }
                // SAFETY: the id is live and still owns the unpublished queue
                // pair.
                if let Err(err) = unsafe { self.provider.destroy_qp(id_ptr) } {
                    tracing::error!("failed to discard orphaned qp: {}", err);
                }
            },
        )?;
        tracing::debug!("created qp {} on cm id {}", handle, id);
        Ok(handle)
    }

    /// Queue pair number.
    pub fn qp_num(&self, qp: Handle) -> Result<u32, BridgeError> {
        let ptr = self.qps.lookup(qp)?;
        // SAFETY: resolved through the table.
        Ok(unsafe { self.provider.qp_num(ptr) })
    }

    /// Modifies the fields of `attr` selected by `mask`. An empty mask, bits
    /// outside [`QpAttrMask::SUPPORTED`] and out-of-range values are rejected
    /// before the native call.
    pub fn modify_qp(&self, qp: Handle, attr: &QpAttr, mask: QpAttrMask) -> Result<(), BridgeError> {
        if mask.is_empty() || !QpAttrMask::SUPPORTED.contains(mask) {
            return Err(BridgeError::invalid(format!(
                "qp attribute mask {:#x} is empty or unsupported",
                mask.bits()
            )));
        }
        let out_of_range = (mask.contains(QpAttrMask::TIMEOUT) && attr.timeout > QpAttr::MAX_TIMEOUT)
            || (mask.contains(QpAttrMask::MIN_RNR_TIMER) && attr.min_rnr_timer > QpAttr::MAX_TIMEOUT)
            || (mask.contains(QpAttrMask::RETRY_CNT) && attr.retry_cnt > QpAttr::MAX_RETRY)
            || (mask.contains(QpAttrMask::RNR_RETRY) && attr.rnr_retry > QpAttr::MAX_RETRY);
        if out_of_range {
            return Err(BridgeError::invalid(format!("qp attributes out of range: {:?}", attr)));
        }
        let ptr = self.qps.lookup(qp)?;
        // SAFETY: resolved through the table.
        unsafe { self.provider.modify_qp(ptr, attr, mask) }
    }

    /// Current attributes of a queue pair.
    pub fn query_qp(&self, qp: Handle) -> Result<QpAttr, BridgeError> {
        let ptr = self.qps.lookup(qp)?;
        // SAFETY: resolved through the table.
        Ok(unsafe { self.provider.query_qp(ptr) })
    }

    /// Destroys the queue pair created on connection id `id`.
    ///
    /// Must not race [`Self::destroy_cm_id`] on the same id.
    pub fn destroy_qp(&self, id: Handle) -> Result<(), BridgeError> {
        let id_ptr = self.cm_ids.lookup(id)?;
        let destroy = || {
            // SAFETY: resolved through the table; the queue pair entry, if
            // tracked, is already removed.
            unsafe { self.provider.destroy_qp(id_ptr) }
        };
        match self.registry.discipline() {
            HandleDiscipline::Direct => destroy(),
            HandleDiscipline::Indirect => {
                let qp = self
                    .registry
                    .children_of(ResourceKey::new(ResourceClass::ConnectionId, id), ResourceClass::QueuePair)
                    .into_iter()
                    .next()
                    .ok_or_else(|| BridgeError::invalid(format!("cm id {} has no queue pair", id)))?;
                self.registry.release(&self.qps, qp, &[], |_| destroy())
            }
        }
    }

    /// Registers `len` bytes at `addr` with protection domain `pd`.
    ///
    /// # Safety
    ///
    /// `addr..addr + len` must stay valid memory until the region is
    /// deregistered.
    pub unsafe fn reg_mr(
        &self,
        pd: Handle,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> Result<MemoryRegionInfo, BridgeError> {
        if addr.is_null() {
            return Err(BridgeError::invalid("memory region address is null"));
        }
        let pd_ptr = self.pds.lookup(pd)?;
        // SAFETY: resolved through the table; the buffer is the caller's
        // promise.
        let mr = unsafe { self.provider.reg_mr(pd_ptr, addr, len, access) };
        let handle = self.registry.adopt(&self.mrs, mr, &[Parent::reject(&self.pds, pd)], |mr| {
            // SAFETY: never published.
            if let Err(err) = unsafe { self.provider.dereg_mr(mr) } {
                tracing::error!("failed to discard orphaned mr: {}", err);
            }
        })?;
        let keys = self.mr_keys(handle)?;
        Ok(MemoryRegionInfo {
            handle,
            lkey: keys.lkey,
            rkey: keys.rkey,
            registration: keys.registration,
        })
    }

    /// Keys of a registered region.
    pub fn mr_keys(&self, mr: Handle) -> Result<MrKeys, BridgeError> {
        let ptr = self.mrs.lookup(mr)?;
        // SAFETY: resolved through the table.
        Ok(unsafe { self.provider.mr_keys(ptr) })
    }

    /// Deregisters a memory region. Its keys are invalid afterwards.
    pub fn dereg_mr(&self, mr: Handle) -> Result<(), BridgeError> {
        self.registry.release(&self.mrs, mr, &[], |ptr| {
            // SAFETY: the registry removed the entry.
            unsafe { self.provider.dereg_mr(ptr) }
        })
    }

    /// Posts send work requests in order.
    pub fn post_send(&self, qp: Handle, wrs: &[SendWr]) -> Result<(), BridgeError> {
        for wr in wrs {
            self.check_sge(&wr.sg_list)?;
        }
        let ptr = self.qps.lookup(qp)?;
        // SAFETY: resolved through the table.
        unsafe { self.provider.post_send(ptr, wrs) }
    }

    /// Posts receive work requests in order.
    pub fn post_recv(&self, qp: Handle, wrs: &[RecvWr]) -> Result<(), BridgeError> {
        for wr in wrs {
            self.check_sge(&wr.sg_list)?;
        }
        let ptr = self.qps.lookup(qp)?;
        // SAFETY: resolved through the table.
        unsafe { self.provider.post_recv(ptr, wrs) }
    }

    fn check_sge(&self, sg_list: &[Sge]) -> Result<(), BridgeError> {
        if sg_list.len() > self.config.max_sge {
            return Err(BridgeError::CapacityExceeded {
                capacity: self.config.max_sge,
                requested: sg_list.len(),
            });
        }
        Ok(())
    }
}
