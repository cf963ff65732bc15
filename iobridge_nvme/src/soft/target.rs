/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Soft fabrics target. Subsystems export local controllers; an RDMA probe
//! that names a listening subsystem attaches a fabrics view of each exported
//! controller and counts as a host connection.

use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use dashmap::mapref::entry::Entry;
use iobridge::BridgeError;
use iobridge::NativePtr;
use nix::errno::Errno;

use super::SoftController;
use super::SoftNvme;
use crate::nvme_primitives::NvmfSubsystemMode;
use crate::nvme_primitives::NvmfSubtype;
use crate::nvme_primitives::TargetOptions;
use crate::nvme_primitives::TransportId;
use crate::nvme_primitives::TransportName;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Listener {
    transport: TransportName,
    address: String,
    service_id: String,
}

#[derive(Debug, Default)]
struct SubsystemState {
    listeners: Vec<Listener>,
    ctrlrs: Vec<NativePtr<SoftController>>,
}

/// `struct spdk_nvmf_subsystem`
#[derive(Debug)]
pub struct SoftSubsystem {
    nqn: String,
    subtype: NvmfSubtype,
    mode: NvmfSubsystemMode,
    state: Mutex<SubsystemState>,
    connects: AtomicUsize,
}

impl SoftSubsystem {
    fn state(&self) -> MutexGuard<'_, SubsystemState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn nqn(&self) -> &str {
        &self.nqn
    }

    pub fn mode(&self) -> NvmfSubsystemMode {
        self.mode
    }

    fn listens_at(&self, trid: &TransportId) -> bool {
        self.state().listeners.iter().any(|l| {
            l.transport == TransportName::Rdma
                && l.address == trid.traddr
                && (trid.trsvcid.is_empty() || l.service_id == trid.trsvcid)
        })
    }
}

impl SoftNvme {
    pub(super) fn init_target(&self, opts: &TargetOptions) -> Result<(), BridgeError> {
        let mut target = self.target();
        if target.is_some() {
            return Err(BridgeError::errno("spdk_nvmf_tgt_init", Errno::EALREADY));
        }
        *target = Some(*opts);
        Ok(())
    }

    pub(super) fn fini_target(&self) -> Result<(), BridgeError> {
        let mut target = self.target();
        if target.is_none() {
            return Err(BridgeError::errno("spdk_nvmf_tgt_fini", Errno::EINVAL));
        }
        if !self.subsystems.is_empty() {
            return Err(BridgeError::errno("spdk_nvmf_tgt_fini", Errno::EBUSY));
        }
        *target = None;
        Ok(())
    }

    pub(super) fn new_subsystem(
        &self,
        nqn: &str,
        subtype: NvmfSubtype,
        mode: NvmfSubsystemMode,
    ) -> Option<NativePtr<SoftSubsystem>> {
        // Held so that `fini_target` cannot interleave.
        let target = self.target();
        if target.is_none() {
            tracing::warn!("cannot create subsystem {}: target not initialized", nqn);
            return None;
        }
        match self.subsystems.entry(nqn.to_string()) {
            Entry::Occupied(_) => {
                tracing::warn!("subsystem {} already exists", nqn);
                None
            }
            Entry::Vacant(slot) => {
                let subsystem = NativePtr::from_box(Box::new(SoftSubsystem {
                    nqn: nqn.to_string(),
                    subtype,
                    mode,
                    state: Mutex::new(SubsystemState::default()),
                    connects: AtomicUsize::new(0),
                }));
                slot.insert(subsystem);
                Some(subsystem)
            }
        }
    }

    pub(super) unsafe fn free_subsystem(&self, subsystem: NativePtr<SoftSubsystem>) -> Result<(), BridgeError> {
        // SAFETY: the caller passes a live subsystem.
        let nqn = unsafe { subsystem.as_ref() }.nqn.clone();
        self.subsystems.remove(&nqn);
        // SAFETY: created through `Box` by `new_subsystem` and no longer
        // reachable through the map.
        let subsystem = unsafe { subsystem.into_box() };
        for ctrlr in subsystem.state().ctrlrs.drain(..) {
            // SAFETY: exported controllers cannot be detached.
            unsafe { ctrlr.as_ref() }.unexport();
        }
        Ok(())
    }

    pub(super) unsafe fn add_listener(
        &self,
        subsystem: NativePtr<SoftSubsystem>,
        transport: TransportName,
        address: &str,
        service_id: &str,
    ) -> Result<(), BridgeError> {
        let listener = Listener {
            transport,
            address: address.to_string(),
            service_id: service_id.to_string(),
        };
        // SAFETY: the caller passes a live subsystem.
        let subsystem = unsafe { subsystem.as_ref() };
        let mut state = subsystem.state();
        if state.listeners.contains(&listener) {
            return Err(BridgeError::errno("spdk_nvmf_subsystem_add_listener", Errno::EEXIST));
        }
        tracing::info!(
            "subsystem {} listening on {} {}:{}",
            subsystem.nqn,
            transport.as_str(),
            address,
            service_id
        );
        state.listeners.push(listener);
        Ok(())
    }

    pub(super) unsafe fn add_ctrlr(
        &self,
        subsystem: NativePtr<SoftSubsystem>,
        ctrlr: NativePtr<SoftController>,
        pci_address: &str,
    ) -> Result<(), BridgeError> {
        // SAFETY: the caller passes a live subsystem.
        let subsystem = unsafe { subsystem.as_ref() };
        if subsystem.subtype == NvmfSubtype::Discovery {
            return Err(BridgeError::errno("spdk_nvmf_subsystem_add_ctrlr", Errno::EINVAL));
        }
        let mut state = subsystem.state();
        if state.ctrlrs.contains(&ctrlr) {
            return Err(BridgeError::errno("spdk_nvmf_subsystem_add_ctrlr", Errno::EEXIST));
        }
        // SAFETY: the caller passes a live controller.
        unsafe { ctrlr.as_ref() }.export();
        state.ctrlrs.push(ctrlr);
        tracing::debug!("subsystem {} exports controller at {}", subsystem.nqn, pci_address);
        Ok(())
    }

    pub(super) unsafe fn poll_subsystem(&self, subsystem: NativePtr<SoftSubsystem>) -> Result<usize, BridgeError> {
        // SAFETY: the caller passes a live subsystem.
        Ok(unsafe { subsystem.as_ref() }.connects.swap(0, Ordering::AcqRel))
    }

    /// Fabrics views of the controllers exported by every NVMe subsystem
    /// listening at `trid`, each tagged with its subsystem's qualified name.
    /// Each view counts as a connection to its subsystem. Fails with
    /// `ECONNREFUSED` if nothing listens there.
    pub(super) fn connect_fabric(
        &self,
        trid: &TransportId,
        accept: &mut dyn FnMut(&TransportId) -> bool,
    ) -> Result<Vec<(TransportId, Box<SoftController>)>, BridgeError> {
        let mut found = false;
        let mut views = Vec::new();
        for entry in self.subsystems.iter() {
            // SAFETY: subsystems are freed only after leaving the map, which
            // the iteration's shard lock prevents.
            let subsystem = unsafe { entry.value().as_ref() };
            if subsystem.subtype != NvmfSubtype::Nvme
                || !(trid.subnqn.is_empty() || trid.subnqn == subsystem.nqn)
                || !subsystem.listens_at(trid)
            {
                continue;
            }
            found = true;
            let ctrlrs = subsystem.state().ctrlrs.clone();
            for ctrlr in ctrlrs {
                let mut view_trid = trid.clone();
                view_trid.subnqn = subsystem.nqn.clone();
                if !accept(&view_trid) {
                    continue;
                }
                // SAFETY: exported controllers cannot be detached while the
                // subsystem holds them.
                let view = unsafe { ctrlr.as_ref() }.fabric_view(view_trid.clone(), self.next_cntlid());
                subsystem.connects.fetch_add(1, Ordering::AcqRel);
                views.push((view_trid, view));
            }
        }
        if !found {
            return Err(BridgeError::errno("spdk_nvme_probe", Errno::ECONNREFUSED));
        }
        Ok(views)
    }
}
