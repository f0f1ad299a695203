//! Background region scanning.
//!
//! This module provides:
//! - RegionScanner: a single worker thread that walks the cube around
//!   a scan origin and sorts contents into placement candidates
//! - ScanRequest validation (radius bounds, source-region check)
//! - Supersede-on-new-scan cancellation via the session registry
//!
//! Scanning is the expensive half of replication. It runs off the tick
//! path; the scheduler drains whatever the worker has published.

use crate::policy::ContentPolicy;
use crate::session::{placement_anchor, SessionKey, SessionRegistry};
use crate::world::{BlockState, WorldError, WorldView};
use crossbeam_channel::{bounded, Receiver, Sender};
use dashmap::DashMap;
use mirror_common::{BlockPos, RegionId, UserId};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// How many cube offsets the worker walks between cancellation checks.
const CANCEL_CHECK_INTERVAL: usize = 4096;

/// Depth of the scan job queue. One job per user at a time in
/// practice; a small buffer absorbs bursts.
const JOB_QUEUE_DEPTH: usize = 16;

/// Errors that can occur when requesting or running a scan.
#[derive(Debug, Error)]
pub enum ScanError {
    /// Requested radius is outside the configured bounds.
    #[error("Scan radius {requested} outside allowed range {min}..={max}")]
    InvalidRadius {
        /// Radius the caller asked for.
        requested: u32,
        /// Smallest allowed radius.
        min: u32,
        /// Largest allowed radius.
        max: u32,
    },

    /// Scans cannot originate inside the target region.
    #[error("Cannot scan from inside the target region")]
    WrongRegion,

    /// The worker thread is gone.
    #[error("Scan worker unavailable")]
    WorkerUnavailable,

    /// The scan was superseded or cancelled mid-walk.
    #[error("Scan aborted: {0}")]
    Aborted(String),

    /// Reading the source region failed.
    #[error(transparent)]
    World(#[from] WorldError),
}

/// Result type for scan operations.
pub type ScanResult<T> = Result<T, ScanError>;

impl From<ScanError> for mirror_common::MirrorError {
    fn from(e: ScanError) -> Self {
        match e {
            ScanError::InvalidRadius { .. } | ScanError::WrongRegion => {
                Self::Validation(e.to_string())
            },
            ScanError::WorkerUnavailable | ScanError::Aborted(_) => {
                Self::ScanAborted(e.to_string())
            },
            ScanError::World(inner) => Self::World(inner.to_string()),
        }
    }
}

/// One block queued for placement.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Offset from the scan origin (and from the placement anchor).
    pub offset: BlockPos,
    /// Block state captured at scan time.
    pub state: BlockState,
}

/// Placement phase a session is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Draining the simple queue.
    PlacingSimple,
    /// Draining the complex queue.
    PlacingComplex,
    /// Both queues empty; return marker and links pending.
    Finalizing,
}

/// A scanned session ready for the scheduler to place.
pub struct PendingSession {
    /// Identity of the session.
    pub key: SessionKey,
    /// Source region the complex phase re-reads from.
    pub source: Arc<dyn WorldView>,
    /// Placement anchor in the target region.
    pub anchor: BlockPos,
    /// Plain blocks, placed from captured state.
    pub simple: VecDeque<Candidate>,
    /// Aux-data carriers, re-read from the source at placement time.
    pub complex: VecDeque<Candidate>,
    /// Total units this session reports progress against.
    pub total_units: u32,
    /// Units processed so far (placed, skipped, or failed).
    pub processed: u32,
    /// Current placement phase.
    pub phase: SessionPhase,
}

/// Receives scan lifecycle notifications.
pub trait ScanSink: Send + Sync {
    /// A session finished placing everything.
    fn scan_complete(&self, user: UserId, final_count: u32);
    /// A scan failed before producing a session.
    fn scan_failed(&self, user: UserId, message: &str);
}

/// A scan request as issued by a user.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    /// Requesting user.
    pub user: UserId,
    /// Region the user is standing in.
    pub caller_region: RegionId,
    /// Center of the cube to scan.
    pub origin: BlockPos,
    /// Cube radius in blocks.
    pub radius: u32,
}

struct ScanJob {
    key: SessionKey,
    radius: u32,
    anchor: BlockPos,
    source: Arc<dyn WorldView>,
}

/// Owns the scan worker thread and the queue of ready sessions.
pub struct RegionScanner {
    jobs: Option<Sender<ScanJob>>,
    worker: Option<JoinHandle<()>>,
    registry: Arc<SessionRegistry>,
    ready: Arc<DashMap<UserId, PendingSession>>,
    min_radius: u32,
    max_radius: u32,
    target_region: RegionId,
}

impl RegionScanner {
    /// Spawns the scan worker and returns the scanner handle.
    #[must_use]
    pub fn new(
        registry: Arc<SessionRegistry>,
        policy: Arc<ContentPolicy>,
        sink: Arc<dyn ScanSink>,
        min_radius: u32,
        max_radius: u32,
        target_region: RegionId,
    ) -> Self {
        let (tx, rx) = bounded::<ScanJob>(JOB_QUEUE_DEPTH);
        let ready: Arc<DashMap<UserId, PendingSession>> = Arc::new(DashMap::new());

        let worker = {
            let registry = Arc::clone(&registry);
            let ready = Arc::clone(&ready);
            std::thread::Builder::new()
                .name("region-scan".to_string())
                .spawn(move || worker_loop(&rx, &registry, &policy, &sink, &ready))
        };
        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!("Failed to spawn scan worker: {e}");
                None
            },
        };

        Self {
            jobs: Some(tx),
            worker,
            registry,
            ready,
            min_radius,
            max_radius,
            target_region,
        }
    }

    /// Validates and enqueues a scan, superseding any session the user
    /// already has. Returns the new session's key.
    pub fn start_scan(
        &self,
        request: &ScanRequest,
        source: Arc<dyn WorldView>,
    ) -> ScanResult<SessionKey> {
        if request.caller_region == self.target_region {
            return Err(ScanError::WrongRegion);
        }
        if request.radius < self.min_radius || request.radius > self.max_radius {
            return Err(ScanError::InvalidRadius {
                requested: request.radius,
                min: self.min_radius,
                max: self.max_radius,
            });
        }

        let key = SessionKey::new(request.user, request.caller_region.clone(), request.origin);

        // A new scan supersedes whatever the user had, whether it was
        // still scanning or mid-placement.
        if self.ready.remove(&request.user).is_some() {
            debug!("Dropped pending session for {} on new scan", request.user);
        }
        self.registry.set_active(key.clone());
        self.registry.reset_status(&key);

        let anchor = placement_anchor(request.user, request.origin);
        self.registry.set_placement_anchor(&key, anchor);

        let job = ScanJob {
            key: key.clone(),
            radius: request.radius,
            anchor,
            source,
        };
        let Some(jobs) = &self.jobs else {
            return Err(ScanError::WorkerUnavailable);
        };
        jobs.send(job).map_err(|_| ScanError::WorkerUnavailable)?;

        info!(
            "Queued scan for {} at {} radius {}",
            request.user, request.origin, request.radius
        );
        Ok(key)
    }

    /// Sessions the worker has finished scanning, keyed by user.
    #[must_use]
    pub fn ready_sessions(&self) -> &Arc<DashMap<UserId, PendingSession>> {
        &self.ready
    }

    /// Whether the worker is still scanning or has a session waiting
    /// for the given user.
    #[must_use]
    pub fn has_pending(&self, user: UserId) -> bool {
        self.ready.contains_key(&user)
    }
}

impl Drop for RegionScanner {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop.
        self.jobs.take();
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                error!("Scan worker panicked");
            }
        }
    }
}

fn worker_loop(
    rx: &Receiver<ScanJob>,
    registry: &SessionRegistry,
    policy: &ContentPolicy,
    sink: &Arc<dyn ScanSink>,
    ready: &DashMap<UserId, PendingSession>,
) {
    while let Ok(job) = rx.recv() {
        let user = job.key.user;
        match enumerate(&job, registry, policy) {
            Ok(session) => {
                // Publish only if this scan is still the active one.
                if registry.active_key(user).as_ref() == Some(&session.key) {
                    info!(
                        "Scan for {user} found {} simple + {} complex candidates",
                        session.simple.len(),
                        session.complex.len()
                    );
                    ready.insert(user, session);
                } else {
                    debug!("Discarding superseded scan result for {user}");
                }
            },
            Err(ScanError::Aborted(reason)) => {
                debug!("Scan for {user} aborted: {reason}");
            },
            Err(e) => {
                warn!("Scan for {user} failed: {e}");
                registry.clear_active(user);
                sink.scan_failed(user, &e.to_string());
            },
        }
    }
    debug!("Scan worker shutting down");
}

fn enumerate(
    job: &ScanJob,
    registry: &SessionRegistry,
    policy: &ContentPolicy,
) -> ScanResult<PendingSession> {
    let origin = job.key.origin;
    let mut simple = VecDeque::new();
    let mut complex = VecDeque::new();

    for (walked, offset) in BlockPos::cube_offsets(job.radius).enumerate() {
        if walked % CANCEL_CHECK_INTERVAL == 0
            && registry.active_key(job.key.user).as_ref() != Some(&job.key)
        {
            return Err(ScanError::Aborted("superseded by a newer scan".to_string()));
        }

        let pos = origin.offset_by(offset);
        if !job.source.is_loaded(pos) {
            continue;
        }
        let state = job.source.block_state(pos)?;
        if state.is_air() {
            continue;
        }

        let candidate = Candidate { offset, state };
        if job.source.has_aux_data(pos) {
            // Banned complex carriers are filtered again at placement
            // time; their aux payload may change between now and then.
            complex.push_back(candidate);
        } else if policy.is_banned(&candidate.state) {
            debug!("Skipping banned block {} at {pos}", candidate.state.id());
        } else {
            simple.push_back(candidate);
        }
    }

    let total_units = (simple.len() + complex.len()) as u32;
    registry.update_status(&job.key, 0, total_units);

    Ok(PendingSession {
        key: job.key.clone(),
        source: Arc::clone(&job.source),
        anchor: job.anchor,
        simple,
        complex,
        total_units,
        processed: 0,
        phase: SessionPhase::PlacingSimple,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::{MemoryRegion, WorldWriter};
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        completed: Mutex<Vec<(UserId, u32)>>,
        failed: Mutex<Vec<(UserId, String)>>,
    }

    impl ScanSink for RecordingSink {
        fn scan_complete(&self, user: UserId, final_count: u32) {
            self.completed.lock().push((user, final_count));
        }
        fn scan_failed(&self, user: UserId, message: &str) {
            self.failed.lock().push((user, message.to_string()));
        }
    }

    fn scanner(
        registry: &Arc<SessionRegistry>,
        banned: &[&str],
    ) -> (RegionScanner, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let policy = Arc::new(ContentPolicy::from_iter(
            banned.iter().map(|s| (*s).to_string()),
        ));
        let scanner = RegionScanner::new(
            Arc::clone(registry),
            policy,
            Arc::clone(&sink) as Arc<dyn ScanSink>,
            1,
            64,
            RegionId::new("mirror:sandbox"),
        );
        (scanner, sink)
    }

    fn request(user: u64, radius: u32) -> ScanRequest {
        ScanRequest {
            user: UserId::from_raw(user),
            caller_region: RegionId::new("overworld"),
            origin: BlockPos::new(0, 64, 0),
            radius,
        }
    }

    fn wait_for_ready(scanner: &RegionScanner, user: UserId) {
        for _ in 0..200 {
            if scanner.has_pending(user) {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("scan never produced a session");
    }

    #[test]
    fn test_radius_bounds_enforced() {
        let registry = Arc::new(SessionRegistry::new());
        let (scanner, _sink) = scanner(&registry, &[]);
        let source: Arc<dyn WorldView> = Arc::new(MemoryRegion::new());

        assert!(matches!(
            scanner.start_scan(&request(1, 0), Arc::clone(&source)),
            Err(ScanError::InvalidRadius { .. })
        ));
        assert!(matches!(
            scanner.start_scan(&request(1, 65), source),
            Err(ScanError::InvalidRadius { .. })
        ));
    }

    #[test]
    fn test_scan_from_target_region_rejected() {
        let registry = Arc::new(SessionRegistry::new());
        let (scanner, _sink) = scanner(&registry, &[]);
        let source: Arc<dyn WorldView> = Arc::new(MemoryRegion::new());

        let mut req = request(1, 4);
        req.caller_region = RegionId::new("mirror:sandbox");
        assert!(matches!(
            scanner.start_scan(&req, source),
            Err(ScanError::WrongRegion)
        ));
    }

    #[test]
    fn test_scan_sorts_simple_and_complex() {
        let registry = Arc::new(SessionRegistry::new());
        let (scanner, _sink) = scanner(&registry, &[]);

        let mut region = MemoryRegion::new();
        region.set_block(BlockPos::new(1, 64, 0), &BlockState::new("stone")).expect("set");
        region.set_block(BlockPos::new(0, 65, 0), &BlockState::new("dirt")).expect("set");
        region.set_block(BlockPos::new(0, 64, 1), &BlockState::new("chest")).expect("set");
        region
            .set_aux_data(
                BlockPos::new(0, 64, 1),
                crate::world::AuxData::new(
                    BlockPos::new(0, 64, 1),
                    serde_json::json!({"items": []}),
                ),
            )
            .expect("aux");
        let source: Arc<dyn WorldView> = Arc::new(region);

        let key = scanner.start_scan(&request(1, 2), source).expect("scan");
        wait_for_ready(&scanner, key.user);

        let session = scanner
            .ready_sessions()
            .remove(&key.user)
            .expect("session")
            .1;
        assert_eq!(session.simple.len(), 2);
        assert_eq!(session.complex.len(), 1);
        assert_eq!(session.total_units, 3);
        assert_eq!(
            registry.status(&key).expect("status").total_units,
            3
        );
    }

    #[test]
    fn test_banned_simple_blocks_excluded_from_total() {
        let registry = Arc::new(SessionRegistry::new());
        let (scanner, _sink) = scanner(&registry, &["ender_chest"]);

        let mut region = MemoryRegion::new();
        region.set_block(BlockPos::new(0, 65, 0), &BlockState::new("stone")).expect("set");
        region.set_block(BlockPos::new(0, 66, 0), &BlockState::new("ender_chest")).expect("set");
        let source: Arc<dyn WorldView> = Arc::new(region);

        let key = scanner.start_scan(&request(1, 2), source).expect("scan");
        wait_for_ready(&scanner, key.user);

        let session = scanner
            .ready_sessions()
            .remove(&key.user)
            .expect("session")
            .1;
        assert_eq!(session.total_units, 1);
        assert_eq!(session.simple.len(), 1);
        assert_eq!(session.simple[0].state.id(), "stone");
    }

    #[test]
    fn test_unloaded_positions_skipped() {
        let registry = Arc::new(SessionRegistry::new());
        let (scanner, _sink) = scanner(&registry, &[]);

        let mut region = MemoryRegion::new();
        region.set_block(BlockPos::new(0, 65, 0), &BlockState::new("stone")).expect("set");
        region.set_block(BlockPos::new(0, 66, 0), &BlockState::new("dirt")).expect("set");
        region.mark_unloaded(BlockPos::new(0, 66, 0));
        let source: Arc<dyn WorldView> = Arc::new(region);

        let key = scanner.start_scan(&request(1, 2), source).expect("scan");
        wait_for_ready(&scanner, key.user);

        let session = scanner
            .ready_sessions()
            .remove(&key.user)
            .expect("session")
            .1;
        assert_eq!(session.total_units, 1);
    }

    #[test]
    fn test_rescan_of_same_origin_resets_status() {
        let registry = Arc::new(SessionRegistry::new());
        let (scanner, _sink) = scanner(&registry, &[]);

        let mut region = MemoryRegion::new();
        region
            .set_block(BlockPos::new(0, 65, 0), &BlockState::new("stone"))
            .expect("set");
        region
            .set_block(BlockPos::new(0, 66, 0), &BlockState::new("dirt"))
            .expect("set");
        let source: Arc<dyn WorldView> = Arc::new(region);

        let key = scanner
            .start_scan(&request(1, 2), Arc::clone(&source))
            .expect("first scan");
        wait_for_ready(&scanner, key.user);
        registry.mark_complete(&key, 2);
        assert!(registry.status(&key).expect("status").complete);

        // Scanning the same origin again starts a fresh run; the old
        // run's completion must not leak into it.
        let rescan = scanner.start_scan(&request(1, 2), source).expect("rescan");
        assert_eq!(rescan, key);
        let status = registry.status(&key).expect("status");
        assert!(!status.complete);
        assert_eq!(status.current_progress, 0);
    }

    #[test]
    fn test_new_scan_supersedes_pending_session() {
        let registry = Arc::new(SessionRegistry::new());
        let (scanner, _sink) = scanner(&registry, &[]);

        let mut region = MemoryRegion::new();
        region.set_block(BlockPos::new(0, 65, 0), &BlockState::new("stone")).expect("set");
        let source: Arc<dyn WorldView> = Arc::new(region);

        let first = scanner
            .start_scan(&request(1, 2), Arc::clone(&source))
            .expect("first scan");
        wait_for_ready(&scanner, first.user);

        let mut req = request(1, 2);
        req.origin = BlockPos::new(100, 64, 0);
        let second = scanner.start_scan(&req, source).expect("second scan");
        assert_ne!(first, second);
        assert_eq!(registry.active_key(first.user), Some(second.clone()));
        wait_for_ready(&scanner, second.user);
        assert_eq!(
            scanner
                .ready_sessions()
                .get(&second.user)
                .expect("session")
                .key,
            second
        );
    }
}
