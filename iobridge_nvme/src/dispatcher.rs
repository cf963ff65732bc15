/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! # NVMe Dispatcher
//!
//! The boundary surface over an [`NvmeProvider`]. Controllers, namespaces,
//! I/O queue pairs and target subsystems are handed out as handles.
//!
//! Ownership edges:
//! - controller -> namespace: cascade. Detaching a controller invalidates its
//!   namespace handles.
//! - controller -> queue pair: reject. Queue pairs must be freed first.
//!
//! Target operations live in `target.rs`.

use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use iobridge::BridgeError;
use iobridge::Handle;
use iobridge::HandleTable;
use iobridge::NativePtr;
use iobridge::Parent;
use iobridge::Registry;
use iobridge::ResourceClass;
use iobridge::ResourceKey;
use iobridge::boundary::dma_addr;
use iobridge::boundary::dma_ptr;
use nix::errno::Errno;

use crate::completion::CompletionSink;
use crate::completion::IoCompletion;
use crate::config::NvmeConfig;
use crate::nvme_primitives::ControllerData;
use crate::nvme_primitives::ControllerOptions;
use crate::nvme_primitives::IoDirection;
use crate::nvme_primitives::QpairOptions;
use crate::nvme_primitives::TransportId;
use crate::nvme_primitives::TransportType;
use crate::probe::Attacher;
use crate::probe::ProbeReport;
use crate::provider::NvmeProvider;

/// Pause between completion polls in [`NvmeDispatcher::wait_for_completions`].
const POLL_INTERVAL: Duration = Duration::from_micros(50);

/// Handle-based NVMe driver and target surface.
pub struct NvmeDispatcher<P: NvmeProvider> {
    pub(crate) provider: P,
    pub(crate) config: NvmeConfig,
    pub(crate) registry: Registry,
    pub(crate) controllers: HandleTable<P::Controller>,
    pub(crate) namespaces: HandleTable<P::Namespace>,
    pub(crate) qpairs: HandleTable<P::Qpair>,
    pub(crate) subsystems: HandleTable<P::Subsystem>,
}

impl<P: NvmeProvider> NvmeDispatcher<P> {
    /// A dispatcher with default configuration and indirect handles.
    pub fn new(provider: P) -> Self {
        Self::build(provider, NvmeConfig::default(), Registry::new())
    }

    /// A dispatcher following `config`.
    ///
    /// # Safety
    ///
    /// See [`Registry::with_config`].
    pub unsafe fn with_config(provider: P, config: NvmeConfig) -> Self {
        // SAFETY: forwarded to our caller.
        let registry = unsafe { Registry::with_config(&config.registry) };
        Self::build(provider, config, registry)
    }

    fn build(provider: P, config: NvmeConfig, registry: Registry) -> Self {
        tracing::debug!("creating nvme dispatcher: {}", config);
        Self {
            controllers: registry.table(ResourceClass::Controller),
            namespaces: registry.table(ResourceClass::Namespace),
            qpairs: registry.table(ResourceClass::NvmeQueuePair),
            subsystems: registry.table(ResourceClass::Subsystem),
            provider,
            config,
            registry,
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn config(&self) -> &NvmeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Number of live handles in `class`. Zero under the direct discipline and
    /// for classes this dispatcher does not serve.
    pub fn live(&self, class: ResourceClass) -> usize {
        match class {
            ResourceClass::Controller => self.controllers.len(),
            ResourceClass::Namespace => self.namespaces.len(),
            ResourceClass::NvmeQueuePair => self.qpairs.len(),
            ResourceClass::Subsystem => self.subsystems.len(),
            _ => 0,
        }
    }

    /// Whether the driver supports `trtype`.
    pub fn transport_available(&self, trtype: TransportType) -> bool {
        self.provider.transport_available(trtype)
    }

    /// Attaches controllers matching `trid`, writing their handles into `out`.
    ///
    /// Never attaches more than `out.len()` controllers; the rest are counted
    /// in [`ProbeReport::declined`]. A native failure before any attach is an
    /// error. After an attach it is logged and the partial result returned.
    pub fn probe(&self, trid: &TransportId, out: &mut [Handle]) -> Result<ProbeReport, BridgeError> {
        let mut attacher = Attacher::new(&self.provider, &self.registry, &self.controllers, out);
        let result = self.provider.probe(trid, &mut attacher);
        let report = attacher.report();
        match result {
            Ok(()) => {}
            Err(err) if report.attached == 0 => return Err(err),
            Err(err) => {
                tracing::warn!(
                    "probe of {} failed after {} attaches: {}",
                    trid,
                    report.attached,
                    err
                );
            }
        }
        if report.truncated() {
            tracing::info!(
                "probe of {} declined {} controllers beyond capacity {}",
                trid,
                report.declined,
                report.attached
            );
        }
        Ok(report)
    }

    /// Probes with the configured capacity and returns the attached handles.
    pub fn probe_all(&self, trid: &TransportId) -> Result<Vec<Handle>, BridgeError> {
        let mut out = vec![Handle::INVALID; self.config.probe_capacity];
        let report = self.probe(trid, &mut out)?;
        out.truncate(report.attached);
        Ok(out)
    }

    /// Detaches a controller. Its namespace handles go with it; rejected
    /// while queue pairs are allocated on it.
    pub fn detach(&self, ctrlr: Handle) -> Result<(), BridgeError> {
        self.registry.release(&self.controllers, ctrlr, &[&self.namespaces], |ptr| {
            // SAFETY: the registry removed the entry.
            unsafe { self.provider.detach(ptr) }
        })
    }

    pub fn num_namespaces(&self, ctrlr: Handle) -> Result<u32, BridgeError> {
        let ptr = self.controllers.lookup(ctrlr)?;
        // SAFETY: resolved through the table.
        Ok(unsafe { self.provider.num_namespaces(ptr) })
    }

    /// Handle of namespace `nsid` (1-based). Repeated calls return the same
    /// handle.
    pub fn namespace(&self, ctrlr: Handle, nsid: u32) -> Result<Handle, BridgeError> {
        let ptr = self.controllers.lookup(ctrlr)?;
        // SAFETY: resolved through the table.
        let count = unsafe { self.provider.num_namespaces(ptr) };
        if nsid == 0 || nsid > count {
            return Err(BridgeError::invalid(format!(
                "controller {} has no namespace {} ({} namespaces)",
                ctrlr, nsid, count
            )));
        }
        // SAFETY: resolved through the table.
        let ns = unsafe { self.provider.namespace(ptr, nsid) };
        self.registry.adopt(
            &self.namespaces,
            ns,
            &[Parent::cascade(&self.controllers, ctrlr)],
            |_| {},
        )
    }

    pub fn controller_data(&self, ctrlr: Handle) -> Result<ControllerData, BridgeError> {
        let ptr = self.controllers.lookup(ctrlr)?;
        // SAFETY: resolved through the table.
        Ok(unsafe { self.provider.controller_data(ptr) })
    }

    pub fn controller_options(&self, ctrlr: Handle) -> Result<ControllerOptions, BridgeError> {
        let ptr = self.controllers.lookup(ctrlr)?;
        // SAFETY: resolved through the table.
        Ok(unsafe { self.provider.controller_options(ptr) })
    }

    pub fn process_admin_completions(&self, ctrlr: Handle) -> Result<usize, BridgeError> {
        let ptr = self.controllers.lookup(ctrlr)?;
        // SAFETY: resolved through the table.
        unsafe { self.provider.process_admin_completions(ptr) }
    }

    /// Allocates an I/O queue pair with the configured options.
    pub fn alloc_io_qpair(&self, ctrlr: Handle) -> Result<Handle, BridgeError> {
        let opts = self.config.qpair;
        self.alloc_io_qpair_with(ctrlr, &opts)
    }

    /// Allocates an I/O queue pair with explicit options.
    pub fn alloc_io_qpair_with(&self, ctrlr: Handle, opts: &QpairOptions) -> Result<Handle, BridgeError> {
        if opts.io_queue_requests == 0 {
            return Err(BridgeError::invalid("io_queue_requests must be positive"));
        }
        let ptr = self.controllers.lookup(ctrlr)?;
        // SAFETY: resolved through the table.
        let qpair = unsafe { self.provider.alloc_io_qpair(ptr, opts) };
        self.registry.adopt(
            &self.qpairs,
            qpair,
            &[Parent::reject(&self.controllers, ctrlr)],
            |qpair| self.discard_qpair(qpair),
        )
    }

    /// Frees an I/O queue pair. Outstanding commands complete with an abort
    /// status.
    pub fn free_io_qpair(&self, qpair: Handle) -> Result<(), BridgeError> {
        self.registry.release(&self.qpairs, qpair, &[], |ptr| {
            // SAFETY: the registry removed the entry.
            unsafe { self.provider.free_io_qpair(ptr) }
        })
    }

    fn discard_qpair(&self, qpair: NativePtr<P::Qpair>) {
        // SAFETY: created by the provider and never published.
        if let Err(err) = unsafe { self.provider.free_io_qpair(qpair) } {
            tracing::error!("failed to free orphaned queue pair: {}", err);
        }
    }

    pub fn ns_is_active(&self, ns: Handle) -> Result<bool, BridgeError> {
        let ptr = self.namespaces.lookup(ns)?;
        // SAFETY: resolved through the table.
        Ok(unsafe { self.provider.ns_is_active(ptr) })
    }

    /// Namespace size in bytes.
    pub fn ns_size(&self, ns: Handle) -> Result<u64, BridgeError> {
        let ptr = self.namespaces.lookup(ns)?;
        // SAFETY: resolved through the table.
        Ok(unsafe { self.provider.ns_size(ptr) })
    }

    pub fn ns_sector_size(&self, ns: Handle) -> Result<u32, BridgeError> {
        let ptr = self.namespaces.lookup(ns)?;
        // SAFETY: resolved through the table.
        Ok(unsafe { self.provider.ns_sector_size(ptr) })
    }

    pub fn ns_max_io_xfer_size(&self, ns: Handle) -> Result<u32, BridgeError> {
        let ptr = self.namespaces.lookup(ns)?;
        // SAFETY: resolved through the table.
        Ok(unsafe { self.provider.ns_max_io_xfer_size(ptr) })
    }

    /// Submits a read or write of `count` blocks at `lba` between namespace
    /// `ns` and the buffer at DMA address `buf`. `completion` receives the
    /// status when a later [`Self::qpair_process_completions`] runs the
    /// command; a submission error means it never will.
    ///
    /// # Safety
    ///
    /// `buf` must address at least `count` blocks of memory that stays valid,
    /// and is not otherwise accessed, until the command completes.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn ns_io_cmd(
        &self,
        ns: Handle,
        qpair: Handle,
        buf: u64,
        lba: u64,
        count: u32,
        completion: &Arc<IoCompletion>,
        direction: IoDirection,
    ) -> Result<(), BridgeError> {
        if buf == 0 {
            return Err(BridgeError::invalid("null I/O buffer"));
        }
        let ns_ptr = self.namespaces.lookup(ns)?;
        let qpair_ptr = self.qpairs.lookup(qpair)?;
        let ns_owner = self
            .registry
            .parent_of(ResourceKey::new(ResourceClass::Namespace, ns), ResourceClass::Controller);
        let qpair_owner = self.registry.parent_of(
            ResourceKey::new(ResourceClass::NvmeQueuePair, qpair),
            ResourceClass::Controller,
        );
        if ns_owner != qpair_owner {
            return Err(BridgeError::invalid(format!(
                "namespace {} and queue pair {} belong to different controllers",
                ns, qpair
            )));
        }

        completion.reset();
        let record = Arc::clone(completion);
        // SAFETY: the caller guarantees the buffer; handles were resolved
        // through the tables.
        let submitted = unsafe {
            self.provider.ns_io_cmd(
                ns_ptr,
                qpair_ptr,
                dma_ptr(buf),
                lba,
                count,
                direction,
                Box::new(move |status| record.complete(status)),
            )
        };
        if let Err(err) = &submitted {
            tracing::warn!(
                "{:?} of {} blocks at lba {} on namespace {} not submitted: {}",
                direction,
                count,
                lba,
                ns,
                err
            );
        }
        submitted
    }

    /// Runs up to `max` completions on `qpair`, all pending if `max` is zero.
    pub fn qpair_process_completions(&self, qpair: Handle, max: u32) -> Result<usize, BridgeError> {
        let ptr = self.qpairs.lookup(qpair)?;
        // SAFETY: resolved through the table.
        unsafe { self.provider.process_completions(ptr, max) }
    }

    /// Processes completions on `qpair` until `sink` holds `expected` ids.
    ///
    /// Returns the number of ids in the sink. Fails with `Timeout` if the
    /// deadline passes first, and with `CapacityExceeded` if `expected` can
    /// never fit in the sink.
    pub fn wait_for_completions(
        &self,
        qpair: Handle,
        sink: &CompletionSink,
        expected: usize,
        timeout: Duration,
    ) -> Result<usize, BridgeError> {
        if expected > sink.capacity() {
            return Err(BridgeError::CapacityExceeded {
                capacity: sink.capacity(),
                requested: expected,
            });
        }
        let deadline = Instant::now() + timeout;
        loop {
            self.qpair_process_completions(qpair, 0)?;
            let ready = sink.len();
            if ready >= expected {
                return Ok(ready);
            }
            if Instant::now() >= deadline {
                tracing::debug!(
                    "queue pair {}: {} of {} completions within {:?}",
                    qpair,
                    ready,
                    expected,
                    timeout
                );
                return Err(BridgeError::Timeout(timeout));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Allocates zeroed DMA-capable memory and returns its address.
    pub fn dma_malloc(&self, size: usize, align: usize) -> Result<u64, BridgeError> {
        if size == 0 {
            return Err(BridgeError::invalid("zero-sized DMA allocation"));
        }
        if !align.is_power_of_two() {
            return Err(BridgeError::invalid(format!(
                "DMA alignment {} is not a power of two",
                align
            )));
        }
        match self.provider.dma_malloc(size, align) {
            Some(ptr) => Ok(dma_addr(ptr.as_ptr())),
            None => {
                tracing::warn!("DMA allocation of {} bytes failed", size);
                Err(BridgeError::errno("dma_malloc", Errno::ENOMEM))
            }
        }
    }

    /// Frees memory returned by [`Self::dma_malloc`].
    ///
    /// # Safety
    ///
    /// `addr` must come from [`Self::dma_malloc`] on this dispatcher, must not
    /// have been freed, and no submitted command may still use it.
    pub unsafe fn dma_free(&self, addr: u64) -> Result<(), BridgeError> {
        // SAFETY: forwarded to our caller.
        let ptr = NativePtr::new(unsafe { dma_ptr(addr) })
            .ok_or_else(|| BridgeError::invalid("null DMA address"))?;
        // SAFETY: forwarded to our caller.
        unsafe { self.provider.dma_free(ptr) }
    }
}
