//! The module containing [`GlobalState`], the singleton data structure
//! shared, read-mostly, across all processors.

use crate::{
    cache::HostCacheSnapshot, config::VmmConfig, hypercall::HypercallTable, smp::SyncBarrier,
};
use passvisor_core::mmio::MmioRegistry;

/// Identifies one vCPU (equivalently, given the 1:1 pass-through model, one
/// physical processor).
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub(crate) struct VCpuId(pub(crate) u32);

/// The singleton data structure used across all processors. Everything in
/// here is either read-only after `GlobalState::new`, or internally
/// synchronized (the MMIO registry is its own reader/writer lock; the sync
/// barrier is lock-free).
pub(crate) struct GlobalState {
    config: VmmConfig,
    number_of_cores: u32,
    mmio: MmioRegistry,
    host_cache: HostCacheSnapshot,
    sync_barrier: SyncBarrier,
    hypercalls: HypercallTable,
}

impl GlobalState {
    /// Builds the global state from the boundary configuration and the
    /// core count discovered via UEFI `MpServices` before boot services are
    /// exited.
    pub(crate) fn new(config: VmmConfig, number_of_cores: u32) -> Self {
        Self {
            config,
            number_of_cores,
            mmio: MmioRegistry::new(),
            host_cache: HostCacheSnapshot::capture(),
            sync_barrier: SyncBarrier::new(number_of_cores),
            hypercalls: HypercallTable::new(),
        }
    }

    pub(crate) const fn config(&self) -> &VmmConfig {
        &self.config
    }

    pub(crate) const fn number_of_cores(&self) -> u32 {
        self.number_of_cores
    }

    pub(crate) const fn mmio(&self) -> &MmioRegistry {
        &self.mmio
    }

    pub(crate) const fn host_cache(&self) -> &HostCacheSnapshot {
        &self.host_cache
    }

    pub(crate) const fn sync_barrier(&self) -> &SyncBarrier {
        &self.sync_barrier
    }

    pub(crate) const fn hypercalls(&self) -> &HypercallTable {
        &self.hypercalls
    }
}
