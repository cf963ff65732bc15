/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! In-process NVMe driver.
//!
//! [`SoftNvme`] discovers a fixed set of local controllers described by
//! [`ControllerSpec`]s, serves block I/O from memory, and runs a fabrics
//! target whose subsystems can be probed over the RDMA transport type. It
//! follows the native driver's contract closely enough to drive the
//! [`crate::NvmeDispatcher`] in tests.

mod controller;
mod target;

use std::alloc::Layout;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU16;
use std::sync::atomic::Ordering;

pub use controller::ControllerSpec;
pub use controller::NamespaceSpec;
pub use controller::SoftController;
pub use controller::SoftNamespace;
pub use controller::SoftQpair;
use controller::Media;
use dashmap::DashMap;
use iobridge::BridgeError;
use iobridge::NativePtr;
use nix::errno::Errno;
pub use target::SoftSubsystem;

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
use crate::provider::CompletionCallback;
use crate::provider::NvmeProvider;
use crate::provider::ProbeVisitor;

struct Device {
    spec: ControllerSpec,
    media: Vec<Arc<Media>>,
}

/// In-process NVMe driver and fabrics target.
pub struct SoftNvme {
    devices: Vec<Device>,
    transports: Vec<TransportType>,
    attached: Mutex<HashSet<String>>,
    next_cntlid: AtomicU16,
    probe_failure: Option<(usize, i32)>,
    dma: DashMap<usize, Layout>,
    target: Mutex<Option<TargetOptions>>,
    subsystems: DashMap<String, NativePtr<SoftSubsystem>>,
}

impl Default for SoftNvme {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftNvme {
    /// A driver with both transports and no local controllers.
    pub fn new() -> Self {
        Self {
            devices: Vec::new(),
            transports: vec![TransportType::Pcie, TransportType::Rdma],
            attached: Mutex::new(HashSet::new()),
            next_cntlid: AtomicU16::new(1),
            probe_failure: None,
            dma: DashMap::new(),
            target: Mutex::new(None),
            subsystems: DashMap::new(),
        }
    }

    /// Adds a discoverable local controller.
    pub fn with_controller(mut self, spec: ControllerSpec) -> Self {
        let media = spec.namespaces.iter().map(|_| Media::new()).collect();
        self.devices.push(Device { spec, media });
        self
    }

    /// Restricts the transports the driver was "built" with.
    pub fn with_transports(mut self, transports: &[TransportType]) -> Self {
        self.transports = transports.to_vec();
        self
    }

    /// Makes every local probe fail with `code` once `attaches` controllers
    /// have been attached by it.
    pub fn fail_probe_after(mut self, attaches: usize, code: i32) -> Self {
        self.probe_failure = Some((attaches, code));
        self
    }

    /// Outstanding DMA allocations.
    pub fn dma_allocations(&self) -> usize {
        self.dma.len()
    }

    fn target(&self) -> MutexGuard<'_, Option<TargetOptions>> {
        self.target.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn attached(&self) -> MutexGuard<'_, HashSet<String>> {
        self.attached.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_cntlid(&self) -> u16 {
        self.next_cntlid.fetch_add(1, Ordering::Relaxed)
    }

    fn release_device(&self, trid: &TransportId) {
        if trid.trtype == TransportType::Pcie {
            self.attached().remove(&trid.traddr);
        }
    }

    fn probe_local(
        &self,
        trid: &TransportId,
        visitor: &mut dyn ProbeVisitor<SoftController>,
    ) -> Result<(), BridgeError> {
        let mut accepted = Vec::new();
        {
            // Devices stay claimed from acceptance on, so concurrent probes
            // never attach one twice.
            let mut attached = self.attached();
            for device in &self.devices {
                let spec = &device.spec;
                if !(trid.traddr.is_empty() || trid.traddr == spec.traddr) || attached.contains(&spec.traddr) {
                    continue;
                }
                let found = TransportId::pcie(&spec.traddr)?;
                if visitor.probe(&found) {
                    attached.insert(spec.traddr.clone());
                    accepted.push((found, device));
                }
            }
        }

        for (done, (found, device)) in accepted.iter().enumerate() {
            if let Some((after, code)) = self.probe_failure {
                if done >= after {
                    let mut attached = self.attached();
                    for (unclaimed, _) in &accepted[done..] {
                        attached.remove(&unclaimed.traddr);
                    }
                    return Err(BridgeError::native("spdk_nvme_probe", code));
                }
            }
            let ctrlr = SoftController::new(found.clone(), &device.spec, &device.media, self.next_cntlid());
            visitor.attach(found, NativePtr::from_box(ctrlr));
        }
        Ok(())
    }

    fn probe_fabric(
        &self,
        trid: &TransportId,
        visitor: &mut dyn ProbeVisitor<SoftController>,
    ) -> Result<(), BridgeError> {
        let views = self.connect_fabric(trid, &mut |found: &TransportId| visitor.probe(found))?;
        for (found, view) in views {
            visitor.attach(&found, NativePtr::from_box(view));
        }
        Ok(())
    }
}

impl Drop for SoftNvme {
    fn drop(&mut self) {
        for entry in self.dma.iter() {
            tracing::warn!("freeing leaked DMA buffer {:#x}", entry.key());
            // SAFETY: allocated by `dma_malloc` with this layout.
            unsafe { std::alloc::dealloc(*entry.key() as *mut u8, *entry.value()) };
        }
        for entry in self.subsystems.iter() {
            // SAFETY: created through `Box` by `new_subsystem`; the driver is
            // going away.
            drop(unsafe { entry.value().into_box() });
        }
    }
}

impl NvmeProvider for SoftNvme {
    type Controller = SoftController;
    type Namespace = SoftNamespace;
    type Qpair = SoftQpair;
    type Subsystem = SoftSubsystem;

    fn transport_available(&self, trtype: TransportType) -> bool {
        self.transports.contains(&trtype)
    }

    fn probe(
        &self,
        trid: &TransportId,
        visitor: &mut dyn ProbeVisitor<SoftController>,
    ) -> Result<(), BridgeError> {
        if !self.transport_available(trid.trtype) {
            return Err(BridgeError::errno("spdk_nvme_probe", Errno::EOPNOTSUPP));
        }
        match trid.trtype {
            TransportType::Pcie => self.probe_local(trid, visitor),
            TransportType::Rdma => self.probe_fabric(trid, visitor),
        }
    }

    unsafe fn detach(&self, ctrlr: NativePtr<SoftController>) -> Result<(), BridgeError> {
        // SAFETY: forwarded to our caller.
        unsafe { self.free_controller(ctrlr) }
    }

    unsafe fn num_namespaces(&self, ctrlr: NativePtr<SoftController>) -> u32 {
        // SAFETY: the caller passes a live controller.
        unsafe { ctrlr.as_ref() }.namespaces().len() as u32
    }

    unsafe fn namespace(&self, ctrlr: NativePtr<SoftController>, nsid: u32) -> Option<NativePtr<SoftNamespace>> {
        // SAFETY: the caller passes a live controller.
        let namespaces = unsafe { ctrlr.as_ref() }.namespaces();
        let index = (nsid as usize).checked_sub(1)?;
        namespaces.get(index).map(NativePtr::from_ref)
    }

    unsafe fn controller_data(&self, ctrlr: NativePtr<SoftController>) -> ControllerData {
        // SAFETY: the caller passes a live controller.
        unsafe { ctrlr.as_ref() }.data().clone()
    }

    unsafe fn controller_options(&self, ctrlr: NativePtr<SoftController>) -> ControllerOptions {
        // SAFETY: the caller passes a live controller.
        unsafe { ctrlr.as_ref() }.opts().clone()
    }

    unsafe fn process_admin_completions(&self, _ctrlr: NativePtr<SoftController>) -> Result<usize, BridgeError> {
        Ok(0)
    }

    unsafe fn alloc_io_qpair(
        &self,
        ctrlr: NativePtr<SoftController>,
        opts: &QpairOptions,
    ) -> Option<NativePtr<SoftQpair>> {
        // SAFETY: forwarded to our caller.
        unsafe { self.new_qpair(ctrlr, opts) }
    }

    unsafe fn free_io_qpair(&self, qpair: NativePtr<SoftQpair>) -> Result<(), BridgeError> {
        // SAFETY: forwarded to our caller.
        unsafe { self.free_qpair(qpair) }
    }

    unsafe fn ns_is_active(&self, ns: NativePtr<SoftNamespace>) -> bool {
        // SAFETY: the caller passes a live namespace.
        unsafe { ns.as_ref() }.spec().active
    }

    unsafe fn ns_size(&self, ns: NativePtr<SoftNamespace>) -> u64 {
        // SAFETY: the caller passes a live namespace.
        unsafe { ns.as_ref() }.size()
    }

    unsafe fn ns_sector_size(&self, ns: NativePtr<SoftNamespace>) -> u32 {
        // SAFETY: the caller passes a live namespace.
        unsafe { ns.as_ref() }.spec().sector_size
    }

    unsafe fn ns_max_io_xfer_size(&self, ns: NativePtr<SoftNamespace>) -> u32 {
        // SAFETY: the caller passes a live namespace.
        unsafe { ns.as_ref() }.spec().max_io_xfer_size
    }

    #[allow(clippy::too_many_arguments)]
    unsafe fn ns_io_cmd(
        &self,
        ns: NativePtr<SoftNamespace>,
        qpair: NativePtr<SoftQpair>,
        buf: *mut u8,
        lba: u64,
        count: u32,
        direction: IoDirection,
        on_complete: CompletionCallback,
    ) -> Result<(), BridgeError> {
        // SAFETY: forwarded to our caller.
        unsafe { self.submit(ns, qpair, buf, lba, count, direction, on_complete) }
    }

    unsafe fn process_completions(&self, qpair: NativePtr<SoftQpair>, max: u32) -> Result<usize, BridgeError> {
        // SAFETY: forwarded to our caller.
        unsafe { self.complete(qpair, max) }
    }

    fn dma_malloc(&self, size: usize, align: usize) -> Option<NativePtr<u8>> {
        let layout = Layout::from_size_align(size, align).ok()?;
        if layout.size() == 0 {
            return None;
        }
        // SAFETY: the layout has a non-zero size.
        let ptr = NativePtr::new(unsafe { std::alloc::alloc_zeroed(layout) })?;
        self.dma.insert(ptr.as_ptr() as usize, layout);
        Some(ptr)
    }

    unsafe fn dma_free(&self, buf: NativePtr<u8>) -> Result<(), BridgeError> {
        let Some((addr, layout)) = self.dma.remove(&(buf.as_ptr() as usize)) else {
            tracing::warn!("free of unknown DMA buffer {:?}", buf);
            return Err(BridgeError::errno("spdk_dma_free", Errno::EINVAL));
        };
        // SAFETY: allocated by `dma_malloc` with this layout, removed from the
        // map so freed once.
        unsafe { std::alloc::dealloc(addr as *mut u8, layout) };
        Ok(())
    }

    fn target_init(&self, opts: &TargetOptions) -> Result<(), BridgeError> {
        self.init_target(opts)
    }

    fn target_fini(&self) -> Result<(), BridgeError> {
        self.fini_target()
    }

    fn create_subsystem(
        &self,
        nqn: &str,
        subtype: NvmfSubtype,
        mode: NvmfSubsystemMode,
    ) -> Option<NativePtr<SoftSubsystem>> {
        self.new_subsystem(nqn, subtype, mode)
    }

    unsafe fn delete_subsystem(&self, subsystem: NativePtr<SoftSubsystem>) -> Result<(), BridgeError> {
        // SAFETY: forwarded to our caller.
        unsafe { self.free_subsystem(subsystem) }
    }

    unsafe fn subsystem_add_listener(
        &self,
        subsystem: NativePtr<SoftSubsystem>,
        transport: TransportName,
        address: &str,
        service_id: &str,
    ) -> Result<(), BridgeError> {
        // SAFETY: forwarded to our caller.
        unsafe { self.add_listener(subsystem, transport, address, service_id) }
    }

    unsafe fn subsystem_add_ctrlr(
        &self,
        subsystem: NativePtr<SoftSubsystem>,
        ctrlr: NativePtr<SoftController>,
        pci_address: &str,
    ) -> Result<(), BridgeError> {
        // SAFETY: forwarded to our caller.
        unsafe { self.add_ctrlr(subsystem, ctrlr, pci_address) }
    }

    unsafe fn subsystem_poll(&self, subsystem: NativePtr<SoftSubsystem>) -> Result<usize, BridgeError> {
        // SAFETY: forwarded to our caller.
        unsafe { self.poll_subsystem(subsystem) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nvme_primitives::AddressFamily;

    /// Accepts the first controller offered.
    struct Collect(Vec<NativePtr<SoftController>>, usize);

    impl ProbeVisitor<SoftController> for Collect {
        fn probe(&mut self, _trid: &TransportId) -> bool {
            self.1 += 1;
            self.1 == 1
        }

        fn attach(&mut self, _trid: &TransportId, ctrlr: NativePtr<SoftController>) {
            self.0.push(ctrlr);
        }
    }

    fn driver() -> SoftNvme {
        SoftNvme::new()
            .with_controller(ControllerSpec::new("0000:01:00.0", "A").with_namespace(NamespaceSpec::new(512, 64)))
            .with_controller(ControllerSpec::new("0000:02:00.0", "B").with_namespace(NamespaceSpec::new(512, 64)))
    }

    #[test]
    fn test_attached_devices_are_not_probed_again() {
        let nvme = driver();
        let all = TransportId::pcie("").unwrap();
        let mut first = Collect(Vec::new(), 0);
        nvme.probe(&all, &mut first).unwrap();
        assert_eq!(first.0.len(), 1);

        let mut second = Collect(Vec::new(), 0);
        nvme.probe(&all, &mut second).unwrap();
        assert_eq!(second.0.len(), 1);
        // SAFETY: both came from this driver's probe.
        unsafe {
            assert_ne!(first.0[0].as_ref().trid(), second.0[0].as_ref().trid());
            nvme.detach(first.0[0]).unwrap();
            nvme.detach(second.0[0]).unwrap();
        }
        assert!(nvme.attached().is_empty());
    }

    #[test]
    fn test_unavailable_transport() {
        let nvme = driver().with_transports(&[TransportType::Pcie]);
        assert!(!nvme.transport_available(TransportType::Rdma));
        let trid = TransportId::rdma(AddressFamily::Ipv4, "10.0.0.1", "4420", "").unwrap();
        let err = nvme.probe(&trid, &mut Collect(Vec::new(), 0)).unwrap_err();
        assert_eq!(err, BridgeError::errno("spdk_nvme_probe", Errno::EOPNOTSUPP));
    }

    #[test]
    fn test_dma_layouts_are_tracked() {
        let nvme = SoftNvme::new();
        let buf = nvme.dma_malloc(4096, 4096).unwrap();
        assert_eq!(buf.as_ptr() as usize % 4096, 0);
        assert_eq!(nvme.dma_allocations(), 1);
        // SAFETY: allocated above.
        unsafe {
            assert!(std::slice::from_raw_parts(buf.as_ptr(), 4096).iter().all(|b| *b == 0));
            nvme.dma_free(buf).unwrap();
            assert!(nvme.dma_free(buf).is_err());
        }
        assert_eq!(nvme.dma_allocations(), 0);
        assert!(nvme.dma_malloc(64, 3).is_none());
    }

    #[test]
    fn test_completion_status_reaches_callback_in_order() {
        let nvme = driver();
        let mut visitor = Collect(Vec::new(), 0);
        nvme.probe(&TransportId::pcie("0000:01:00.0").unwrap(), &mut visitor).unwrap();
        let ctrlr = visitor.0[0];
        let seen = Arc::new(Mutex::new(Vec::new()));
        // SAFETY: all objects come from this driver and stay live.
        unsafe {
            let ns = nvme.namespace(ctrlr, 1).unwrap();
            let qpair = nvme.alloc_io_qpair(ctrlr, &QpairOptions::default()).unwrap();
            let mut buf = vec![0u8; 512];
            for (id, lba) in [(1, 0u64), (2, 64), (3, 1)] {
                let seen = Arc::clone(&seen);
                nvme.ns_io_cmd(
                    ns,
                    qpair,
                    buf.as_mut_ptr(),
                    lba,
                    1,
                    IoDirection::Read,
                    Box::new(move |status: CompletionStatus| seen.lock().unwrap().push((id, status.sc))),
                )
                .unwrap();
            }
            assert_eq!(nvme.process_completions(qpair, 2).unwrap(), 2);
            assert_eq!(nvme.process_completions(qpair, 0).unwrap(), 1);
            assert!(nvme.detach(ctrlr).is_err());
            nvme.free_io_qpair(qpair).unwrap();
            nvme.detach(ctrlr).unwrap();
        }
        assert_eq!(*seen.lock().unwrap(), vec![(1, 0), (2, 0x80), (3, 0)]);
    }
}
