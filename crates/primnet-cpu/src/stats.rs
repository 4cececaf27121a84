use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// Engine statistics
//
// Every primitive descriptor and primitive handed out by the engine carries a
// LiveGuard. Cloning a guard counts a new live object, dropping it releases
// one, so the live counters fall back to zero once every graph that owned
// engine objects has been dropped, including graphs whose assembly failed
// half-way.

/// Snapshot of the engine's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Primitive descriptors created since the engine was built.
    pub descs_created: u64,
    /// Primitive descriptors still alive.
    pub descs_live: u64,
    /// Primitives (compute and reorder) created since the engine was built.
    pub primitives_created: u64,
    pub primitives_live: u64,
    /// Successful `execute` calls.
    pub executions: u64,
}

#[derive(Debug, Default)]
pub(crate) struct EngineStats {
    descs_created: AtomicU64,
    descs_live: AtomicU64,
    primitives_created: AtomicU64,
    primitives_live: AtomicU64,
    executions: AtomicU64,
}

impl EngineStats {
    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            descs_created: self.descs_created.load(Ordering::Relaxed),
            descs_live: self.descs_live.load(Ordering::Relaxed),
            primitives_created: self.primitives_created.load(Ordering::Relaxed),
            primitives_live: self.primitives_live.load(Ordering::Relaxed),
            executions: self.executions.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_execution(&self) {
        self.executions.fetch_add(1, Ordering::Relaxed);
    }

    fn counters(&self, kind: GuardKind) -> (&AtomicU64, &AtomicU64) {
        match kind {
            GuardKind::Desc => (&self.descs_created, &self.descs_live),
            GuardKind::Primitive => (&self.primitives_created, &self.primitives_live),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum GuardKind {
    Desc,
    Primitive,
}

/// Keeps one engine object counted as live.
#[derive(Debug)]
pub(crate) struct LiveGuard {
    stats: Arc<EngineStats>,
    kind: GuardKind,
}

impl LiveGuard {
    pub(crate) fn new(stats: &Arc<EngineStats>, kind: GuardKind) -> Self {
        let (created, live) = stats.counters(kind);
        created.fetch_add(1, Ordering::Relaxed);
        live.fetch_add(1, Ordering::Relaxed);
        LiveGuard {
            stats: Arc::clone(stats),
            kind,
        }
    }
}

impl Clone for LiveGuard {
    fn clone(&self) -> Self {
        let (_, live) = self.stats.counters(self.kind);
        live.fetch_add(1, Ordering::Relaxed);
        LiveGuard {
            stats: Arc::clone(&self.stats),
            kind: self.kind,
        }
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        let (_, live) = self.stats.counters(self.kind);
        live.fetch_sub(1, Ordering::Relaxed);
    }
}
