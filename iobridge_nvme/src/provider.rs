/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The native NVMe and NVMe over fabrics surface.
//!
//! A provider wraps one NVMe driver (SPDK, or the in-process
//! [`crate::SoftNvme`]). Like the verbs provider it speaks in native pointers;
//! the dispatcher owns handles and ownership edges.
//!
//! # Safety
//!
//! Every `unsafe` method takes native pointers that must have been produced by
//! the same provider and must still be live.

use iobridge::BridgeError;
use iobridge::NativePtr;

use crate::nvme_primitives::CompletionStatus;
use crate::nvme_primitives::ControllerData;
use crate::nvme_primitives::ControllerOptions;
use crate::nvme_primitives::IoDirection;
use crate::nvme_primitives::NvmfSubsystemMode;
use crate::nvme_primitives::NvmfSubtype;
use crate::nvme_primitives::QpairOptions;
use crate::nvme_primitives::TargetOptions;
use crate::nvme_primitives::TransportId;
use crate::nvme_primitives::TransportName;
use crate::nvme_primitives::TransportType;

/// Invoked by the provider's completion poller when a command finishes.
pub type CompletionCallback = Box<dyn FnOnce(CompletionStatus) + Send>;

/// The probe predicate and attach callback of one enumeration.
pub trait ProbeVisitor<C> {
    /// Whether to attach the controller found at `trid`.
    fn probe(&mut self, trid: &TransportId) -> bool;

    /// A controller accepted by [`ProbeVisitor::probe`] finished
    /// initialization. Ownership of `ctrlr` passes to the visitor.
    fn attach(&mut self, trid: &TransportId, ctrlr: NativePtr<C>);
}

/// Native NVMe driver calls.
///
/// Create calls return `None` where the native call returns null. All other
/// failures carry the native status verbatim.
pub trait NvmeProvider: Send + Sync {
    /// `struct spdk_nvme_ctrlr`
    type Controller;
    /// `struct spdk_nvme_ns`
    type Namespace;
    /// `struct spdk_nvme_qpair`
    type Qpair;
    /// `struct spdk_nvmf_subsystem`
    type Subsystem;

    /// Whether the driver was built with `trtype`.
    fn transport_available(&self, trtype: TransportType) -> bool;

    /// Enumerates controllers matching `trid`. For each one found, asks
    /// `visitor.probe` and, if accepted, initializes the controller and hands
    /// it to `visitor.attach`. Fails with the native status if enumeration
    /// itself fails; controllers attached before the failure stay attached.
    fn probe(
        &self,
        trid: &TransportId,
        visitor: &mut dyn ProbeVisitor<Self::Controller>,
    ) -> Result<(), BridgeError>;

    /// Detaches and frees a controller and its namespaces.
    unsafe fn detach(&self, ctrlr: NativePtr<Self::Controller>) -> Result<(), BridgeError>;

    /// Number of namespaces; valid ids are `1..=num_namespaces`.
    unsafe fn num_namespaces(&self, ctrlr: NativePtr<Self::Controller>) -> u32;

    /// Namespace `nsid`, owned by the controller.
    unsafe fn namespace(
        &self,
        ctrlr: NativePtr<Self::Controller>,
        nsid: u32,
    ) -> Option<NativePtr<Self::Namespace>>;

    unsafe fn controller_data(&self, ctrlr: NativePtr<Self::Controller>) -> ControllerData;

    unsafe fn controller_options(&self, ctrlr: NativePtr<Self::Controller>) -> ControllerOptions;

    /// Processes admin queue completions, returning how many finished.
    unsafe fn process_admin_completions(
        &self,
        ctrlr: NativePtr<Self::Controller>,
    ) -> Result<usize, BridgeError>;

    unsafe fn alloc_io_qpair(
        &self,
        ctrlr: NativePtr<Self::Controller>,
        opts: &QpairOptions,
    ) -> Option<NativePtr<Self::Qpair>>;

    /// Frees a queue pair. Outstanding commands are completed with an abort
    /// status before it returns.
    unsafe fn free_io_qpair(&self, qpair: NativePtr<Self::Qpair>) -> Result<(), BridgeError>;

    unsafe fn ns_is_active(&self, ns: NativePtr<Self::Namespace>) -> bool;

    /// Namespace size in bytes.
    unsafe fn ns_size(&self, ns: NativePtr<Self::Namespace>) -> u64;

    unsafe fn ns_sector_size(&self, ns: NativePtr<Self::Namespace>) -> u32;

    unsafe fn ns_max_io_xfer_size(&self, ns: NativePtr<Self::Namespace>) -> u32;

    /// Submits a read or write of `count` blocks at `lba`. On success
    /// `on_complete` runs exactly once from a later
    /// [`NvmeProvider::process_completions`] on the same queue pair. On
    /// failure it never runs.
    ///
    /// # Safety
    ///
    /// `buf` must hold `count` blocks and stay valid until the completion.
    #[allow(clippy::too_many_arguments)]
    unsafe fn ns_io_cmd(
        &self,
        ns: NativePtr<Self::Namespace>,
        qpair: NativePtr<Self::Qpair>,
        buf: *mut u8,
        lba: u64,
        count: u32,
        direction: IoDirection,
        on_complete: CompletionCallback,
    ) -> Result<(), BridgeError>;

    /// Runs completions of up to `max` commands, all pending if `max` is
    /// zero, in completion queue order. Returns how many ran.
    unsafe fn process_completions(
        &self,
        qpair: NativePtr<Self::Qpair>,
        max: u32,
    ) -> Result<usize, BridgeError>;

    /// Zeroed DMA-capable memory.
    fn dma_malloc(&self, size: usize, align: usize) -> Option<NativePtr<u8>>;

    /// Frees memory returned by [`NvmeProvider::dma_malloc`].
    unsafe fn dma_free(&self, buf: NativePtr<u8>) -> Result<(), BridgeError>;

    /// Initializes the fabrics target.
    fn target_init(&self, opts: &TargetOptions) -> Result<(), BridgeError>;

    /// Tears down the fabrics target.
    fn target_fini(&self) -> Result<(), BridgeError>;

    fn create_subsystem(
        &self,
        nqn: &str,
        subtype: NvmfSubtype,
        mode: NvmfSubsystemMode,
    ) -> Option<NativePtr<Self::Subsystem>>;

    unsafe fn delete_subsystem(&self, subsystem: NativePtr<Self::Subsystem>) -> Result<(), BridgeError>;

    unsafe fn subsystem_add_listener(
        &self,
        subsystem: NativePtr<Self::Subsystem>,
        transport: TransportName,
        address: &str,
        service_id: &str,
    ) -> Result<(), BridgeError>;

    /// Exports `ctrlr` through `subsystem`.
    unsafe fn subsystem_add_ctrlr(
        &self,
        subsystem: NativePtr<Self::Subsystem>,
        ctrlr: NativePtr<Self::Controller>,
        pci_address: &str,
    ) -> Result<(), BridgeError>;

    /// Services the subsystem, returning how many host connections were
    /// accepted since the last poll.
    unsafe fn subsystem_poll(&self, subsystem: NativePtr<Self::Subsystem>) -> Result<usize, BridgeError>;
}
