//! Engine commands and outbound events.
//!
//! Commands are the user-facing operations; events are what the host
//! surfaces back to users (chat lines, HUD updates). The bus is a
//! bounded channel drained by the host each tick. Publishing never
//! blocks; when the host falls behind, new events are dropped and
//! counted.

use crate::scanner::ScanSink;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use mirror_common::{BlockPos, UserId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Default event queue capacity.
pub const EVENT_QUEUE_DEPTH: usize = 256;

/// A user-issued engine operation.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCommand {
    /// Scan the cube around an origin for later replication.
    RequestScan {
        /// Center of the scan.
        origin: BlockPos,
        /// Cube radius in blocks.
        radius: u32,
    },
    /// Report replication progress for the session at an origin.
    RequestStatus {
        /// Scan origin identifying the session.
        origin: BlockPos,
    },
    /// Move the user into the replicated copy of their scan.
    RequestTransition {
        /// Scan origin identifying the session.
        origin: BlockPos,
    },
}

/// An engine occurrence the host should surface to users.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A replication session finished placing.
    ScanComplete {
        /// User whose session completed.
        user: UserId,
        /// Units the session processed.
        final_count: u32,
    },
    /// A scan failed before producing a session.
    ScanFailed {
        /// User whose scan failed.
        user: UserId,
        /// Human-readable failure reason.
        message: String,
    },
    /// Response to a status request.
    SnapshotStatus {
        /// User who asked.
        user: UserId,
        /// Whether any session exists for the given origin.
        has_snapshot: bool,
        /// Total units in the session.
        unit_count: u32,
        /// Whether placement has finished.
        complete: bool,
        /// Progress in `0..=100`.
        progress_percent: u8,
    },
    /// A profile transition finished.
    TransitionCompleted {
        /// User who moved.
        user: UserId,
        /// True when they are now in the target region.
        in_target: bool,
    },
    /// A command was rejected.
    Rejected {
        /// User whose command was rejected.
        user: UserId,
        /// Human-readable reason.
        reason: String,
    },
}

/// Bounded, non-blocking event queue between the engine and the host.
pub struct EventBus {
    tx: Sender<EngineEvent>,
    rx: Receiver<EngineEvent>,
    dropped: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_capacity(EVENT_QUEUE_DEPTH)
    }
}

impl EventBus {
    /// Creates a bus with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a bus with an explicit capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            dropped: AtomicU64::new(0),
        }
    }

    /// Publishes an event. Never blocks; a full queue drops the event.
    pub fn publish(&self, event: EngineEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {},
            Err(TrySendError::Full(event)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!("Event queue full, dropped {event:?} ({dropped} total)");
            },
            Err(TrySendError::Disconnected(_)) => {},
        }
    }

    /// Drains all queued events.
    #[must_use]
    pub fn drain(&self) -> Vec<EngineEvent> {
        self.rx.try_iter().collect()
    }

    /// Events dropped because the queue was full.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Adapts the event bus to the scanner's notification seam.
pub struct EventSink(
    /// Bus events are forwarded onto.
    pub Arc<EventBus>,
);

impl ScanSink for EventSink {
    fn scan_complete(&self, user: UserId, final_count: u32) {
        self.0.publish(EngineEvent::ScanComplete { user, final_count });
    }

    fn scan_failed(&self, user: UserId, message: &str) {
        self.0.publish(EngineEvent::ScanFailed {
            user,
            message: message.to_string(),
        });
    }
}
