//! Kollect store: in-RAM mirrors, the change buffer, resync fan-out and the
//! context object that carries them into every task.

#![forbid(unsafe_code)]

mod buffer;
mod mirror;
mod resync;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use kollect_core::{ChangeRecord, ClusterInfo, ResourceKind};
use tracing::info;

pub use buffer::ChangeReportBuffer;
pub use mirror::{IdAllocator, ResourceMirror, SlotId};
pub use resync::{ResyncCoordinator, ResyncSignal};

/// Flag flipped once the first report cycle succeeds; read by a readiness probe.
#[derive(Debug, Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn mark_ready(&self) {
        if !self.0.swap(true, Ordering::AcqRel) {
            info!("agent ready");
        }
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Everything the watch loops and the sender share.
#[derive(Debug)]
pub struct CollectorContext {
    mirrors: [Mutex<ResourceMirror>; 6],
    pub buffer: ChangeReportBuffer,
    pub resync: ResyncCoordinator,
    pub cluster: ArcSwap<ClusterInfo>,
    pub readiness: Readiness,
}

impl Default for CollectorContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CollectorContext {
    pub fn new() -> Self {
        Self {
            mirrors: ResourceKind::ALL.map(|k| Mutex::new(ResourceMirror::new(k))),
            buffer: ChangeReportBuffer::new(),
            resync: ResyncCoordinator::new(),
            cluster: ArcSwap::from_pointee(ClusterInfo::default()),
            readiness: Readiness::default(),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Run `f` with exclusive access to the mirror of `kind`.
    /// Never hold the guard across an await point.
    pub fn with_mirror<R>(&self, kind: ResourceKind, f: impl FnOnce(&mut ResourceMirror) -> R) -> R {
        let mut guard = self.mirrors[kind as usize]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Created records for every live resource of every kind.
    pub fn baseline(&self) -> Vec<ChangeRecord> {
        let mut out = Vec::new();
        for kind in ResourceKind::ALL {
            let snaps = self.with_mirror(kind, |m| m.snapshots());
            out.extend(snaps.iter().map(ChangeRecord::created));
        }
        out
    }

    pub fn live_count(&self) -> usize {
        ResourceKind::ALL
            .iter()
            .map(|k| self.with_mirror(*k, |m| m.len()))
            .sum()
    }

    pub fn set_cluster_version(&self, version: String) {
        self.cluster.store(Arc::new(ClusterInfo { version }));
    }
}
