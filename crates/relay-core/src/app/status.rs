//! Status - what the engine is doing right now.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

/// Snapshot returned by [`EngineHandle::status`](super::EngineHandle::status),
/// serializable for status output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatus {
    /// Tasks waiting in the priority queue.
    pub queued: usize,
    /// Tasks currently in a worker.
    pub processing: usize,
    /// Permits left for the consumers.
    pub available_workers: usize,
    /// Highest `processing` seen since start.
    pub peak_processing: usize,
}

/// Live counters shared by the workers.
#[derive(Debug, Default)]
pub(crate) struct Activity {
    processing: AtomicUsize,
    peak: AtomicUsize,
}

impl Activity {
    pub(crate) fn begin(&self) {
        let now = self.processing.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    pub(crate) fn end(&self) {
        self.processing.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn processing(&self) -> usize {
        self.processing.load(Ordering::SeqCst)
    }

    pub(crate) fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}
