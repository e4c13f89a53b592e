use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of [`DgcStats`], suitable for profiling/telemetry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DgcStatsSnapshot {
    pub layouts_created: u64,
    pub program_cache_hits: u64,
    pub program_cache_misses: u64,
    pub generations: u64,
    pub sequences_requested: u64,
    pub upload_bytes: u64,
}

/// Counters for the generator service.
///
/// Cheap to update from the recording thread and safe to read from another thread.
#[derive(Debug, Default)]
pub struct DgcStats {
    layouts_created: AtomicU64,
    program_cache_hits: AtomicU64,
    program_cache_misses: AtomicU64,
    generations: AtomicU64,
    sequences_requested: AtomicU64,
    upload_bytes: AtomicU64,
}

impl DgcStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_layouts_created(&self) {
        self.layouts_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_program_lookup(&self, hit: bool) {
        if hit {
            self.program_cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.program_cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_generation(&self, max_sequences: u32, upload_bytes: u64) {
        self.generations.fetch_add(1, Ordering::Relaxed);
        self.sequences_requested
            .fetch_add(u64::from(max_sequences), Ordering::Relaxed);
        self.upload_bytes.fetch_add(upload_bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DgcStatsSnapshot {
        DgcStatsSnapshot {
            layouts_created: self.layouts_created.load(Ordering::Relaxed),
            program_cache_hits: self.program_cache_hits.load(Ordering::Relaxed),
            program_cache_misses: self.program_cache_misses.load(Ordering::Relaxed),
            generations: self.generations.load(Ordering::Relaxed),
            sequences_requested: self.sequences_requested.load(Ordering::Relaxed),
            upload_bytes: self.upload_bytes.load(Ordering::Relaxed),
        }
    }
}
