/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Soft controllers, namespaces, queue pairs and the command path.
//!
//! Commands are queued at submission and executed when the queue pair is
//! polled, so completion order is submission order. Namespace data lives in a
//! sparse per-namespace block store that outlives attachments: a controller
//! detached and probed again sees the same data, and so does a fabrics host
//! attached through a target subsystem.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use iobridge::BridgeError;
use iobridge::NativePtr;
use nix::errno::Errno;

use super::SoftNvme;
use crate::nvme_primitives::CompletionStatus;
use crate::nvme_primitives::ControllerData;
use crate::nvme_primitives::ControllerOptions;
use crate::nvme_primitives::IoDirection;
use crate::nvme_primitives::QpairOptions;
use crate::nvme_primitives::TransportId;
use crate::nvme_primitives::generic_status;
use crate::provider::CompletionCallback;

/// Shape of one soft namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceSpec {
    pub sector_size: u32,
    pub sectors: u64,
    pub active: bool,
    pub max_io_xfer_size: u32,
}

impl NamespaceSpec {
    /// An active namespace of `sectors` blocks of `sector_size` bytes.
    pub fn new(sector_size: u32, sectors: u64) -> Self {
        Self {
            sector_size,
            sectors,
            active: true,
            max_io_xfer_size: 128 * 1024,
        }
    }

    /// The same namespace, reported inactive.
    pub fn inactive(self) -> Self {
        Self {
            active: false,
            ..self
        }
    }
}

/// A local controller the soft driver can discover.
#[derive(Debug, Clone)]
pub struct ControllerSpec {
    /// `traddr` - PCI address the controller is found at.
    pub traddr: String,
    pub data: ControllerData,
    pub opts: ControllerOptions,
    pub namespaces: Vec<NamespaceSpec>,
}

impl ControllerSpec {
    /// A controller at `traddr` without namespaces.
    pub fn new(traddr: &str, serial: &str) -> Self {
        Self {
            traddr: traddr.to_string(),
            data: ControllerData {
                vid: 0x1b36,
                ssvid: 0x1af4,
                serial: serial.chars().take(20).collect(),
                model: String::from("iobridge soft controller"),
                firmware: String::from("1.0"),
                mdts: 5,
                cntlid: 0,
                version: 0x0001_0300,
            },
            opts: ControllerOptions::default(),
            namespaces: Vec::new(),
        }
    }

    pub fn with_namespace(mut self, ns: NamespaceSpec) -> Self {
        self.namespaces.push(ns);
        self
    }

    pub fn with_io_queues(mut self, num_io_queues: u32) -> Self {
        self.opts.num_io_queues = num_io_queues;
        self
    }
}

/// Sparse block store backing one namespace.
#[derive(Debug)]
pub(crate) struct Media {
    blocks: Mutex<HashMap<u64, Box<[u8]>>>,
}

impl Media {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            blocks: Mutex::new(HashMap::new()),
        })
    }

    fn blocks(&self) -> MutexGuard<'_, HashMap<u64, Box<[u8]>>> {
        self.blocks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub(crate) fn written(&self) -> usize {
        self.blocks().len()
    }
}

/// `struct spdk_nvme_ns`
#[derive(Debug)]
pub struct SoftNamespace {
    spec: NamespaceSpec,
    media: Arc<Media>,
}

impl SoftNamespace {
    pub(crate) fn size(&self) -> u64 {
        self.spec.sectors * u64::from(self.spec.sector_size)
    }

    pub(crate) fn spec(&self) -> &NamespaceSpec {
        &self.spec
    }

    /// Executes one command against the block store.
    ///
    /// # Safety
    ///
    /// `buf` must hold `count` blocks.
    unsafe fn execute(&self, buf: *mut u8, lba: u64, count: u32, direction: IoDirection) -> CompletionStatus {
        if !self.spec.active {
            return CompletionStatus::generic(generic_status::INVALID_NAMESPACE_OR_FORMAT);
        }
        if count == 0 {
            return CompletionStatus::generic(generic_status::INVALID_FIELD);
        }
        match lba.checked_add(u64::from(count)) {
            Some(end) if end <= self.spec.sectors => {}
            _ => return CompletionStatus::generic(generic_status::LBA_OUT_OF_RANGE),
        }
        let sector = self.spec.sector_size as usize;
        if count as usize * sector > self.spec.max_io_xfer_size as usize {
            return CompletionStatus::generic(generic_status::INVALID_FIELD);
        }

        let mut blocks = self.media.blocks();
        for i in 0..count as usize {
            // SAFETY: the caller guarantees `count` blocks at `buf`.
            let block = unsafe { std::slice::from_raw_parts_mut(buf.add(i * sector), sector) };
            let key = lba + i as u64;
            match direction {
                IoDirection::Write => {
                    blocks.insert(key, Box::from(&*block));
                }
                IoDirection::Read => match blocks.get(&key) {
                    Some(stored) => block.copy_from_slice(stored),
                    None => block.fill(0),
                },
            }
        }
        CompletionStatus::SUCCESS
    }
}

/// `struct spdk_nvme_ctrlr`
#[derive(Debug)]
pub struct SoftController {
    trid: TransportId,
    data: ControllerData,
    opts: ControllerOptions,
    namespaces: Vec<SoftNamespace>,
    qpairs: AtomicU32,
    exported: AtomicUsize,
}

impl SoftController {
    pub(crate) fn new(
        trid: TransportId,
        spec: &ControllerSpec,
        media: &[Arc<Media>],
        cntlid: u16,
    ) -> Box<Self> {
        let mut data = spec.data.clone();
        data.cntlid = cntlid;
        Box::new(Self {
            trid,
            data,
            opts: spec.opts.clone(),
            namespaces: spec
                .namespaces
                .iter()
                .zip(media)
                .map(|(ns, media)| SoftNamespace {
                    spec: *ns,
                    media: Arc::clone(media),
                })
                .collect(),
            qpairs: AtomicU32::new(0),
            exported: AtomicUsize::new(0),
        })
    }

    /// A fabrics host's view of this controller: same namespaces and data,
    /// new controller id.
    pub(crate) fn fabric_view(&self, trid: TransportId, cntlid: u16) -> Box<Self> {
        let mut data = self.data.clone();
        data.cntlid = cntlid;
        Box::new(Self {
            trid,
            data,
            opts: self.opts.clone(),
            namespaces: self
                .namespaces
                .iter()
                .map(|ns| SoftNamespace {
                    spec: ns.spec,
                    media: Arc::clone(&ns.media),
                })
                .collect(),
            qpairs: AtomicU32::new(0),
            exported: AtomicUsize::new(0),
        })
    }

    pub(crate) fn trid(&self) -> &TransportId {
        &self.trid
    }

    pub(crate) fn data(&self) -> &ControllerData {
        &self.data
    }

    pub(crate) fn opts(&self) -> &ControllerOptions {
        &self.opts
    }

    pub(crate) fn namespaces(&self) -> &[SoftNamespace] {
        &self.namespaces
    }

    pub(crate) fn export(&self) {
        self.exported.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unexport(&self) {
        self.exported.fetch_sub(1, Ordering::AcqRel);
    }

    fn owns(&self, ns: NativePtr<SoftNamespace>) -> bool {
        self.namespaces.iter().any(|own| std::ptr::eq(own, ns.as_ptr()))
    }
}

struct PendingIo {
    ns: NativePtr<SoftNamespace>,
    buf: usize,
    lba: u64,
    count: u32,
    direction: IoDirection,
    on_complete: CompletionCallback,
}

/// `struct spdk_nvme_qpair`
pub struct SoftQpair {
    ctrlr: NativePtr<SoftController>,
    opts: QpairOptions,
    pending: Mutex<VecDeque<PendingIo>>,
}

impl SoftQpair {
    fn pending(&self) -> MutexGuard<'_, VecDeque<PendingIo>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SoftNvme {
    pub(super) unsafe fn free_controller(&self, ctrlr: NativePtr<SoftController>) -> Result<(), BridgeError> {
        // SAFETY: the caller passes a live controller.
        let live = unsafe { ctrlr.as_ref() };
        if live.exported.load(Ordering::Acquire) > 0 {
            tracing::warn!("controller {} is exported by a subsystem", live.trid);
            return Err(BridgeError::errno("spdk_nvme_detach", Errno::EBUSY));
        }
        if live.qpairs.load(Ordering::Acquire) > 0 {
            return Err(BridgeError::errno("spdk_nvme_detach", Errno::EBUSY));
        }
        self.release_device(&live.trid);
        // SAFETY: created through `Box` by `probe`, freed exactly once.
        drop(unsafe { ctrlr.into_box() });
        Ok(())
    }

    pub(super) unsafe fn new_qpair(
        &self,
        ctrlr: NativePtr<SoftController>,
        opts: &QpairOptions,
    ) -> Option<NativePtr<SoftQpair>> {
        // SAFETY: the caller passes a live controller.
        let live = unsafe { ctrlr.as_ref() };
        let max = live.opts.num_io_queues;
        let reserved = live
            .qpairs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1));
        if reserved.is_err() {
            tracing::warn!("controller {} has no free I/O queues ({})", live.trid, max);
            return None;
        }
        let mut opts = *opts;
        opts.io_queue_size = opts.io_queue_size.min(live.opts.io_queue_size);
        Some(NativePtr::from_box(Box::new(SoftQpair {
            ctrlr,
            opts,
            pending: Mutex::new(VecDeque::new()),
        })))
    }

    pub(super) unsafe fn free_qpair(&self, qpair: NativePtr<SoftQpair>) -> Result<(), BridgeError> {
        // SAFETY: created through `Box` by `new_qpair`, freed exactly once.
        let qpair = unsafe { qpair.into_box() };
        let aborted: Vec<PendingIo> = qpair.pending().drain(..).collect();
        if !aborted.is_empty() {
            tracing::info!("aborting {} outstanding commands", aborted.len());
        }
        for io in aborted {
            (io.on_complete)(CompletionStatus::generic(generic_status::ABORTED_SQ_DELETION));
        }
        // SAFETY: a controller outlives its queue pairs.
        unsafe { qpair.ctrlr.as_ref() }
            .qpairs
            .fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub(super) unsafe fn submit(
        &self,
        ns: NativePtr<SoftNamespace>,
        qpair: NativePtr<SoftQpair>,
        buf: *mut u8,
        lba: u64,
        count: u32,
        direction: IoDirection,
        on_complete: CompletionCallback,
    ) -> Result<(), BridgeError> {
        // SAFETY: the caller passes live objects; a controller outlives its
        // queue pairs.
        let (qpair, ctrlr) = unsafe {
            let qpair = qpair.as_ref();
            (qpair, qpair.ctrlr.as_ref())
        };
        if !ctrlr.owns(ns) {
            return Err(BridgeError::errno("spdk_nvme_ns_cmd", Errno::EINVAL));
        }
        let mut pending = qpair.pending();
        if pending.len() >= qpair.opts.io_queue_requests as usize {
            return Err(BridgeError::errno("spdk_nvme_ns_cmd", Errno::ENOMEM));
        }
        pending.push_back(PendingIo {
            ns,
            buf: buf as usize,
            lba,
            count,
            direction,
            on_complete,
        });
        Ok(())
    }

    pub(super) unsafe fn complete(&self, qpair: NativePtr<SoftQpair>, max: u32) -> Result<usize, BridgeError> {
        // SAFETY: the caller passes a live queue pair.
        let qpair = unsafe { qpair.as_ref() };
        let batch: Vec<PendingIo> = {
            let mut pending = qpair.pending();
            let take = if max == 0 {
                pending.len()
            } else {
                pending.len().min(max as usize)
            };
            pending.drain(..take).collect()
        };
        let done = batch.len();
        for io in batch {
            // SAFETY: namespaces live as long as their controller, which
            // outlives the queue pair; the submitter guaranteed the buffer.
            let status = unsafe {
                io.ns
                    .as_ref()
                    .execute(io.buf as *mut u8, io.lba, io.count, io.direction)
            };
            (io.on_complete)(status);
        }
        Ok(done)
    }
}
