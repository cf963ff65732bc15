/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! # Verbs Dispatcher
//!
//! The boundary surface over a [`VerbsProvider`]. Every resource is created,
//! used, and destroyed by handle; native pointers never leave this crate.
//!
//! Ownership edges maintained by the dispatcher:
//! - connection id -> queue pair: cascade. Destroying the id invalidates the
//!   queue pair handle.
//! - protection domain -> queue pair, memory region: reject.
//! - completion queue -> queue pair: reject.
//! - completion channel -> completion queue: reject.
//! - event channel -> connection id: reject.
//!
//! Connection manager operations live in `cm.rs`, verbs operations in
//! `verbs.rs`.

use iobridge::HandleTable;
use iobridge::NativePtr;
use iobridge::Registry;
use iobridge::ResourceClass;

use crate::config::VerbsConfig;
use crate::provider::VerbsProvider;

/// Version of the boundary call set.
pub const INTERFACE_VERSION: i32 = 27;

/// Handle-based verbs and connection manager surface.
pub struct VerbsDispatcher<P: VerbsProvider> {
    pub(crate) provider: P,
    pub(crate) config: VerbsConfig,
    pub(crate) registry: Registry,
    pub(crate) event_channels: HandleTable<P::EventChannel>,
    pub(crate) cm_ids: HandleTable<P::CmId>,
    pub(crate) contexts: HandleTable<P::Context>,
    pub(crate) pds: HandleTable<P::Pd>,
    pub(crate) comp_channels: HandleTable<P::CompChannel>,
    pub(crate) cqs: HandleTable<P::Cq>,
    pub(crate) qps: HandleTable<P::Qp>,
    pub(crate) mrs: HandleTable<P::Mr>,
}

impl<P: VerbsProvider> VerbsDispatcher<P> {
    /// A dispatcher with default configuration and indirect handles.
    pub fn new(provider: P) -> Self {
        Self::build(provider, VerbsConfig::default(), Registry::new())
    }

    /// A dispatcher following `config`.
    ///
    /// # Safety
    ///
    /// See [`Registry::with_config`]: a direct handle discipline makes every
    /// handle-consuming call trust the handle blindly.
    pub unsafe fn with_config(provider: P, config: VerbsConfig) -> Self {
        // SAFETY: forwarded to our caller.
        let registry = unsafe { Registry::with_config(&config.registry) };
        Self::build(provider, config, registry)
    }

    fn build(provider: P, config: VerbsConfig, registry: Registry) -> Self {
        tracing::debug!("creating verbs dispatcher: {}", config);
        Self {
            event_channels: registry.table(ResourceClass::EventChannel),
            cm_ids: registry.table(ResourceClass::ConnectionId),
            contexts: registry.table(ResourceClass::DeviceContext),
            pds: registry.table(ResourceClass::ProtectionDomain),
            comp_channels: registry.table(ResourceClass::CompletionChannel),
            cqs: registry.table(ResourceClass::CompletionQueue),
            qps: registry.table(ResourceClass::QueuePair),
            mrs: registry.table(ResourceClass::MemoryRegion),
            provider,
            config,
            registry,
        }
    }

    /// The wrapped provider.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Active configuration.
    pub fn config(&self) -> &VerbsConfig {
        &self.config
    }

    /// The handle registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Version of the boundary call set.
    pub fn version(&self) -> i32 {
        INTERFACE_VERSION
    }

    /// Number of live handles in `class`. Zero under the direct discipline and
    /// for classes this dispatcher does not serve.
    pub fn live(&self, class: ResourceClass) -> usize {
        match class {
            ResourceClass::EventChannel => self.event_channels.len(),
            ResourceClass::ConnectionId => self.cm_ids.len(),
            ResourceClass::DeviceContext => self.contexts.len(),
            ResourceClass::ProtectionDomain => self.pds.len(),
            ResourceClass::CompletionChannel => self.comp_channels.len(),
            ResourceClass::CompletionQueue => self.cqs.len(),
            ResourceClass::QueuePair => self.qps.len(),
            ResourceClass::MemoryRegion => self.mrs.len(),
            _ => 0,
        }
    }

    /// Destroys an id the registry refused to adopt.
    pub(crate) fn discard_id(&self, id: NativePtr<P::CmId>) {
        // SAFETY: `id` was just created by the provider and never published.
        if let Err(err) = unsafe { self.provider.destroy_id(id) } {
            tracing::error!("failed to discard orphaned cm id: {}", err);
        }
    }
}
