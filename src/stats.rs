use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use sysinfo::System;

use crate::models::StatsPayload;

/// Process-wide counters shared by the dispatcher and the notification sinks.
pub struct ProcessStats {
    started: Instant,
    received: AtomicU64,
    published: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelCounters {
    pub received: u64,
    pub published: u64,
    pub errors: u64,
}

impl Default for ProcessStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            received: AtomicU64::new(0),
            published: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counters(&self) -> ChannelCounters {
        ChannelCounters {
            received: self.received.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn snapshot(&self, worker_count: usize) -> StatsPayload {
        StatsPayload {
            worker_count,
            memory_usage_bytes: resident_memory(),
            process_uptime: self.uptime_secs(),
        }
    }
}

/// Resident memory of this process in bytes, 0 when the platform can't tell.
fn resident_memory() -> u64 {
    let Ok(pid) = sysinfo::get_current_pid() else {
        return 0;
    };
    let mut system = System::new();
    if !system.refresh_process(pid) {
        return 0;
    }
    system.process(pid).map(|p| p.memory()).unwrap_or(0)
}
