//! Per-tick replication placement.
//!
//! This module provides:
//! - ReplicationScheduler: drains ready sessions in bounded batches
//! - Two-phase ordering (all simple blocks, then all complex blocks)
//! - Finalization: progress mark, return marker, reverse link
//!
//! The scheduler never blocks. Each tick it places at most
//! `blocks_per_tick` simple and `complex_per_tick` complex candidates
//! per session, so placement load stays flat regardless of scan size.

use crate::policy::ContentPolicy;
use crate::scanner::{PendingSession, ScanSink, SessionPhase};
use crate::session::{SessionKey, SessionRegistry};
use crate::world::{BlockState, WorldWriter};
use dashmap::DashMap;
use mirror_common::UserId;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Block identifier placed at the anchor once a session finishes.
pub const RETURN_MARKER_ID: &str = "mirror:return_marker";

/// What one tick accomplished.
#[derive(Debug, Default)]
pub struct TickReport {
    /// Blocks placed this tick.
    pub placed: u32,
    /// Candidates dropped by policy or placement failure this tick.
    pub skipped: u32,
    /// Sessions that finished this tick.
    pub finalized: Vec<SessionKey>,
}

impl TickReport {
    /// Whether the tick did anything at all.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.placed == 0 && self.skipped == 0 && self.finalized.is_empty()
    }
}

/// Drains scanned sessions into the target region tick by tick.
pub struct ReplicationScheduler {
    registry: Arc<SessionRegistry>,
    policy: Arc<ContentPolicy>,
    sink: Arc<dyn ScanSink>,
    ready: Arc<DashMap<UserId, PendingSession>>,
    blocks_per_tick: usize,
    complex_per_tick: usize,
}

impl ReplicationScheduler {
    /// Creates a scheduler over the scanner's ready queue.
    #[must_use]
    pub fn new(
        registry: Arc<SessionRegistry>,
        policy: Arc<ContentPolicy>,
        sink: Arc<dyn ScanSink>,
        ready: Arc<DashMap<UserId, PendingSession>>,
        blocks_per_tick: usize,
        complex_per_tick: usize,
    ) -> Self {
        Self {
            registry,
            policy,
            sink,
            ready,
            blocks_per_tick,
            complex_per_tick,
        }
    }

    /// Advances every ready session by one tick's worth of placement.
    pub fn tick(&self, target: &mut dyn WorldWriter) -> TickReport {
        let mut report = TickReport::default();
        let users: Vec<UserId> = self.ready.iter().map(|entry| *entry.key()).collect();

        for user in users {
            let Some(mut entry) = self.ready.get_mut(&user) else {
                continue;
            };
            let session = entry.value_mut();

            // A session superseded mid-placement is dropped without
            // ceremony; the new scan owns the user now.
            if self.registry.active_key(user).as_ref() != Some(&session.key) {
                drop(entry);
                self.ready.remove(&user);
                debug!("Dropped superseded session for {user} mid-placement");
                continue;
            }

            self.advance(session, target, &mut report);
            let finished = session.phase == SessionPhase::Finalizing;
            if finished {
                let key = session.key.clone();
                let processed = session.processed;
                let anchor = session.anchor;
                drop(entry);
                self.ready.remove(&user);
                self.finalize(&key, processed, anchor, target);
                report.finalized.push(key);
            }
        }
        report
    }

    /// Whether a session is currently waiting or mid-placement.
    #[must_use]
    pub fn has_session(&self, user: UserId) -> bool {
        self.ready.contains_key(&user)
    }

    fn advance(
        &self,
        session: &mut PendingSession,
        target: &mut dyn WorldWriter,
        report: &mut TickReport,
    ) {
        if session.phase == SessionPhase::PlacingSimple {
            let mut budget = self.blocks_per_tick;
            while budget > 0 {
                let Some(candidate) = session.simple.pop_front() else {
                    session.phase = SessionPhase::PlacingComplex;
                    break;
                };
                budget -= 1;
                let pos = session.anchor.offset_by(candidate.offset);
                match target.set_block(pos, &candidate.state) {
                    Ok(()) => report.placed += 1,
                    Err(e) => {
                        warn!("Placement failed at {pos}: {e}");
                        report.skipped += 1;
                    },
                }
                // Every drained candidate counts toward progress, so
                // completion is reachable even with failures.
                session.processed += 1;
            }
            if session.phase == SessionPhase::PlacingSimple {
                self.publish_progress(session);
                return;
            }
        }

        if session.phase == SessionPhase::PlacingComplex {
            let mut budget = self.complex_per_tick;
            while budget > 0 {
                let Some(candidate) = session.complex.pop_front() else {
                    session.phase = SessionPhase::Finalizing;
                    break;
                };
                budget -= 1;
                session.processed += 1;
                match self.place_complex(session, &candidate.offset, target) {
                    Ok(true) => report.placed += 1,
                    Ok(false) => report.skipped += 1,
                    Err(e) => {
                        warn!("Complex placement failed: {e}");
                        report.skipped += 1;
                    },
                }
            }
        }
        self.publish_progress(session);
    }

    /// Places one complex candidate by re-reading the source. The
    /// block may have changed or vanished since the scan; current
    /// contents win. Returns false when the candidate was skipped.
    fn place_complex(
        &self,
        session: &mut PendingSession,
        offset: &mirror_common::BlockPos,
        target: &mut dyn WorldWriter,
    ) -> crate::world::WorldResult<bool> {
        let src = session.key.origin.offset_by(*offset);
        if !session.source.is_loaded(src) {
            return Ok(false);
        }
        let state = session.source.block_state(src)?;
        if state.is_air() || self.policy.is_banned(&state) {
            return Ok(false);
        }

        let dst = session.anchor.offset_by(*offset);
        target.set_block(dst, &state)?;
        if let Some(aux) = session.source.aux_data(src)? {
            target.set_aux_data(dst, aux.relocated(dst))?;
        }
        Ok(true)
    }

    fn publish_progress(&self, session: &PendingSession) {
        self.registry
            .update_status(&session.key, session.processed, session.total_units);
    }

    /// Marks the session complete, drops the return marker at the
    /// anchor, and links the marker back to the session. A failed
    /// marker placement is logged; the session still completes.
    fn finalize(
        &self,
        key: &SessionKey,
        processed: u32,
        anchor: mirror_common::BlockPos,
        target: &mut dyn WorldWriter,
    ) {
        self.registry.mark_complete(key, processed);

        if let Err(e) = target.set_block(anchor, &BlockState::new(RETURN_MARKER_ID)) {
            warn!("Could not place return marker at {anchor}: {e}");
        }
        self.registry.register_reverse_link(anchor, key.clone());

        info!("Finalized session {key} with {processed} units");
        self.sink.scan_complete(key.user, processed);
    }
}
