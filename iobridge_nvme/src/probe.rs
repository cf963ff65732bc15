/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Bounded discovery: the probe predicate and attach callback that write
//! controller handles into a caller-supplied array.

use iobridge::Handle;
use iobridge::HandleTable;
use iobridge::NativePtr;
use iobridge::Registry;

use crate::nvme_primitives::TransportId;
use crate::provider::NvmeProvider;
use crate::provider::ProbeVisitor;

/// Outcome of a probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeReport {
    /// Controllers attached; their handles fill the first `attached` slots of
    /// the output array.
    pub attached: usize,
    /// Controllers found but declined because the output array was full.
    pub declined: usize,
}

impl ProbeReport {
    /// Whether more controllers were found than the output array could hold.
    pub fn truncated(&self) -> bool {
        self.declined > 0
    }
}

/// Accepts controllers while slots remain and registers each attached one.
pub(crate) struct Attacher<'a, P: NvmeProvider> {
    provider: &'a P,
    registry: &'a Registry,
    controllers: &'a HandleTable<P::Controller>,
    out: &'a mut [Handle],
    accepted: usize,
    report: ProbeReport,
}

impl<'a, P: NvmeProvider> Attacher<'a, P> {
    pub(crate) fn new(
        provider: &'a P,
        registry: &'a Registry,
        controllers: &'a HandleTable<P::Controller>,
        out: &'a mut [Handle],
    ) -> Self {
        Self {
            provider,
            registry,
            controllers,
            out,
            accepted: 0,
            report: ProbeReport::default(),
        }
    }

    pub(crate) fn report(&self) -> ProbeReport {
        self.report
    }

    fn discard(&self, ctrlr: NativePtr<P::Controller>) {
        // SAFETY: handed to us by the provider and never published.
        if let Err(err) = unsafe { self.provider.detach(ctrlr) } {
            tracing::error!("failed to detach surplus controller: {}", err);
        }
    }
}

impl<P: NvmeProvider> ProbeVisitor<P::Controller> for Attacher<'_, P> {
    fn probe(&mut self, trid: &TransportId) -> bool {
        // Attach callbacks may trail the probe callbacks, so slots are
        // reserved at acceptance.
        if self.accepted < self.out.len() {
            self.accepted += 1;
            tracing::debug!("probe accepted {}", trid);
            true
        } else {
            self.report.declined += 1;
            tracing::debug!("probe declined {}: output full", trid);
            false
        }
    }

    fn attach(&mut self, trid: &TransportId, ctrlr: NativePtr<P::Controller>) {
        if self.report.attached >= self.out.len() {
            tracing::error!("attach of {} without a free slot, detaching", trid);
            self.discard(ctrlr);
            return;
        }
        match self.registry.adopt(self.controllers, Some(ctrlr), &[], |_| {}) {
            Ok(handle) => {
                tracing::info!("attached controller {} at {}", handle, trid);
                self.out[self.report.attached] = handle;
                self.report.attached += 1;
            }
            Err(err) => {
                tracing::warn!("failed to register controller at {}: {}", trid, err);
                self.discard(ctrlr);
            }
        }
    }
}
