/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! NVMe over fabrics target operations of the [`NvmeDispatcher`].

use iobridge::BridgeError;
use iobridge::Handle;
use nix::errno::Errno;

use crate::dispatcher::NvmeDispatcher;
use crate::nvme_primitives::NvmfSubsystemMode;
use crate::nvme_primitives::NvmfSubtype;
use crate::nvme_primitives::TRADDR_MAX_LEN;
use crate::nvme_primitives::TRSVCID_MAX_LEN;
use crate::nvme_primitives::TargetOptions;
use crate::nvme_primitives::TransportName;
use crate::nvme_primitives::check_nqn;
use crate::provider::NvmeProvider;

impl<P: NvmeProvider> NvmeDispatcher<P> {
    /// Initializes the fabrics target.
    pub fn target_init(&self, opts: &TargetOptions) -> Result<(), BridgeError> {
        if opts.max_queue_depth == 0 || opts.max_conn_per_session == 0 {
            return Err(BridgeError::invalid(format!(
                "target needs a positive queue depth and connection count: {:?}",
                opts
            )));
        }
        self.provider.target_init(opts)?;
        tracing::info!("nvmf target initialized: {:?}", opts);
        Ok(())
    }

    /// Tears down the fabrics target. Subsystems must be deleted first;
    /// otherwise this fails with `EBUSY` and the target stays up. Direct
    /// tables track nothing, so under that discipline the check is left to
    /// the native call, which reports the same error.
    pub fn target_fini(&self) -> Result<(), BridgeError> {
        let live = self.subsystems.len();
        if live > 0 {
            tracing::warn!("nvmf target still has {} subsystems", live);
            return Err(BridgeError::errno("spdk_nvmf_tgt_fini", Errno::EBUSY));
        }
        self.provider.target_fini()
    }

    pub fn create_subsystem(
        &self,
        nqn: &str,
        subtype: NvmfSubtype,
        mode: NvmfSubsystemMode,
    ) -> Result<Handle, BridgeError> {
        check_nqn(nqn)?;
        let subsystem = self.provider.create_subsystem(nqn, subtype, mode);
        let handle = self.registry.adopt(&self.subsystems, subsystem, &[], |_| {})?;
        tracing::info!("created {:?} subsystem {} as {}", subtype, nqn, handle);
        Ok(handle)
    }

    pub fn delete_subsystem(&self, subsystem: Handle) -> Result<(), BridgeError> {
        self.registry.release(&self.subsystems, subsystem, &[], |ptr| {
            // SAFETY: the registry removed the entry.
            unsafe { self.provider.delete_subsystem(ptr) }
        })
    }

    /// Makes the subsystem reachable at `address:service_id`.
    pub fn subsystem_add_listener(
        &self,
        subsystem: Handle,
        transport: TransportName,
        address: &str,
        service_id: &str,
    ) -> Result<(), BridgeError> {
        if address.is_empty() || address.len() > TRADDR_MAX_LEN {
            return Err(BridgeError::invalid(format!("bad listen address {:?}", address)));
        }
        if service_id.len() > TRSVCID_MAX_LEN {
            return Err(BridgeError::invalid(format!("bad service id {:?}", service_id)));
        }
        let ptr = self.subsystems.lookup(subsystem)?;
        // SAFETY: resolved through the table.
        unsafe { self.provider.subsystem_add_listener(ptr, transport, address, service_id) }
    }

    /// Exports an attached controller through the subsystem.
    pub fn subsystem_add_ctrlr(
        &self,
        subsystem: Handle,
        ctrlr: Handle,
        pci_address: &str,
    ) -> Result<(), BridgeError> {
        let subsystem_ptr = self.subsystems.lookup(subsystem)?;
        let ctrlr_ptr = self.controllers.lookup(ctrlr)?;
        // SAFETY: both resolved through their tables.
        unsafe {
            self.provider
                .subsystem_add_ctrlr(subsystem_ptr, ctrlr_ptr, pci_address)
        }
    }

    /// Services the subsystem; returns host connections accepted since the
    /// last poll.
    pub fn subsystem_poll(&self, subsystem: Handle) -> Result<usize, BridgeError> {
        let ptr = self.subsystems.lookup(subsystem)?;
        // SAFETY: resolved through the table.
        unsafe { self.provider.subsystem_poll(ptr) }
    }
}
