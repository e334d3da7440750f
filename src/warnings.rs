//! Run-wide warning counter
//!
//! Warnings are never fatal; the total is reported in the kernel file so
//! downstream consumers can judge how much of the profile reconciled
//! cleanly with the IR.

use std::sync::atomic::{AtomicU64, Ordering};

static WARNINGS: AtomicU64 = AtomicU64::new(0);

/// Log a warning and count it toward the run total
pub fn note(msg: &str) {
    tracing::warn!("{msg}");
    WARNINGS.fetch_add(1, Ordering::Relaxed);
}

pub fn count() -> u64 {
    WARNINGS.load(Ordering::Relaxed)
}

pub fn reset() {
    WARNINGS.store(0, Ordering::Relaxed);
}
