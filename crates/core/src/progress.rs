//! Progress event streaming
//!
//! The pipeline emits structured begin/end events for each phase, snapshot
//! commits, and cache decisions to an observer supplied by the caller.
//! Event ids are globally monotonic for deterministic ordering in logs and
//! tests.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Global event ID counter for deterministic ordering
pub static EVENT_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    EVENT_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Progress events emitted by the pipeline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ProgressEvent {
    /// A phase is about to run
    #[serde(rename = "phase.begin")]
    PhaseBegin {
        id: u64,
        timestamp: u64,
        phase: String,
        index: usize,
    },
    /// A phase finished
    #[serde(rename = "phase.end")]
    PhaseEnd {
        id: u64,
        timestamp: u64,
        phase: String,
        duration_ms: u64,
        success: bool,
    },
    /// A snapshot image was committed
    #[serde(rename = "snapshot.created")]
    SnapshotCreated {
        id: u64,
        timestamp: u64,
        phase: String,
        image: String,
    },
    /// The target was already cached; no phases will run
    #[serde(rename = "cache.hit")]
    CacheHit {
        id: u64,
        timestamp: u64,
        image: String,
    },
    /// The pipeline resumes from a cached snapshot
    #[serde(rename = "cache.resume")]
    CacheResume {
        id: u64,
        timestamp: u64,
        image: String,
        start_phase: String,
    },
    /// Cleanup started
    #[serde(rename = "cleanup.begin")]
    CleanupBegin { id: u64, timestamp: u64 },
    /// Cleanup finished
    #[serde(rename = "cleanup.end")]
    CleanupEnd {
        id: u64,
        timestamp: u64,
        containers_removed: usize,
        images_removed: usize,
    },
}

impl ProgressEvent {
    pub fn phase_begin(phase: &str, index: usize) -> Self {
        Self::PhaseBegin {
            id: next_id(),
            timestamp: now_ms(),
            phase: phase.to_string(),
            index,
        }
    }

    pub fn phase_end(phase: &str, duration_ms: u64, success: bool) -> Self {
        Self::PhaseEnd {
            id: next_id(),
            timestamp: now_ms(),
            phase: phase.to_string(),
            duration_ms,
            success,
        }
    }

    pub fn snapshot_created(phase: &str, image: &str) -> Self {
        Self::SnapshotCreated {
            id: next_id(),
            timestamp: now_ms(),
            phase: phase.to_string(),
            image: image.to_string(),
        }
    }

    pub fn cache_hit(image: &str) -> Self {
        Self::CacheHit {
            id: next_id(),
            timestamp: now_ms(),
            image: image.to_string(),
        }
    }

    pub fn cache_resume(image: &str, start_phase: &str) -> Self {
        Self::CacheResume {
            id: next_id(),
            timestamp: now_ms(),
            image: image.to_string(),
            start_phase: start_phase.to_string(),
        }
    }

    pub fn cleanup_begin() -> Self {
        Self::CleanupBegin {
            id: next_id(),
            timestamp: now_ms(),
        }
    }

    pub fn cleanup_end(containers_removed: usize, images_removed: usize) -> Self {
        Self::CleanupEnd {
            id: next_id(),
            timestamp: now_ms(),
            containers_removed,
            images_removed,
        }
    }

    /// The event's monotonic id
    pub fn id(&self) -> u64 {
        match self {
            ProgressEvent::PhaseBegin { id, .. } => *id,
            ProgressEvent::PhaseEnd { id, .. } => *id,
            ProgressEvent::SnapshotCreated { id, .. } => *id,
            ProgressEvent::CacheHit { id, .. } => *id,
            ProgressEvent::CacheResume { id, .. } => *id,
            ProgressEvent::CleanupBegin { id, .. } => *id,
            ProgressEvent::CleanupEnd { id, .. } => *id,
        }
    }
}

/// Receives pipeline events
pub trait ProgressObserver: Send + Sync {
    fn on_event(&self, event: &ProgressEvent);
}

/// Observer that drops every event
#[derive(Debug, Default)]
pub struct NullObserver;

impl ProgressObserver for NullObserver {
    fn on_event(&self, _event: &ProgressEvent) {}
}

/// Observer that records events for assertions
#[derive(Debug, Default)]
pub struct CollectingObserver {
    events: Mutex<Vec<ProgressEvent>>,
}

impl CollectingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().expect("observer lock").clone()
    }
}

impl ProgressObserver for CollectingObserver {
    fn on_event(&self, event: &ProgressEvent) {
        self.events.lock().expect("observer lock").push(event.clone());
    }
}
