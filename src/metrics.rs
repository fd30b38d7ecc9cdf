use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct Metrics {
    sessions_started: Arc<AtomicU64>,
    sessions_completed: Arc<AtomicU64>,
    sessions_failed: Arc<AtomicU64>,
    entries_accepted: Arc<AtomicU64>,
    entries_rejected: Arc<AtomicU64>,
    signatures_applied: Arc<AtomicU64>,
    signatures_rejected: Arc<AtomicU64>,
    collaterals_charged: Arc<AtomicU64>,
    queues_seen: Arc<AtomicU64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_sessions_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sessions_completed(&self) {
        self.sessions_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sessions_failed(&self) {
        self.sessions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_entries_accepted(&self) {
        self.entries_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_entries_rejected(&self) {
        self.entries_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_signatures_applied(&self) {
        self.signatures_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_signatures_rejected(&self) {
        self.signatures_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_collaterals_charged(&self) {
        self.collaterals_charged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_queues_seen(&self) {
        self.queues_seen.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sessions_completed(&self) -> u64 {
        self.sessions_completed.load(Ordering::Relaxed)
    }

    pub fn sessions_failed(&self) -> u64 {
        self.sessions_failed.load(Ordering::Relaxed)
    }

    pub fn collaterals_charged(&self) -> u64 {
        self.collaterals_charged.load(Ordering::Relaxed)
    }

    pub fn report(&self) {
        tracing::info!(
            "Metrics: sessions={}/{}/{} entries={}/{} sigs={}/{} charged={} queues={}",
            self.sessions_started.load(Ordering::Relaxed),
            self.sessions_completed.load(Ordering::Relaxed),
            self.sessions_failed.load(Ordering::Relaxed),
            self.entries_accepted.load(Ordering::Relaxed),
            self.entries_rejected.load(Ordering::Relaxed),
            self.signatures_applied.load(Ordering::Relaxed),
            self.signatures_rejected.load(Ordering::Relaxed),
            self.collaterals_charged.load(Ordering::Relaxed),
            self.queues_seen.load(Ordering::Relaxed),
        );
    }
}
