//! Session identity and shared replication state.
//!
//! This module provides:
//! - SessionKey: identity of one replication session
//! - BuildStatus: monotonic progress tracking
//! - SessionRegistry: the single source of truth for active sessions,
//!   anchors, reverse links, and per-user location state
//! - Deterministic placement anchor derivation
//!
//! All registry state lives behind one mutex. Contention is low (a
//! handful of users, tick-rate access) and a single lock keeps the
//! multi-map updates atomic with respect to each other.

use crate::profile::{GameMode, LocationState};
use ahash::AHashMap;
use mirror_common::{BlockPos, RegionId, UserId};
use parking_lot::Mutex;
use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use tracing::{debug, info, warn};

/// Height at which every placement anchor sits.
pub const ANCHOR_Y: i32 = 70;

/// Identity of one replication session.
///
/// Two sessions are the same iff the user, the source region, and the
/// scan origin all match. A new scan from a different origin is a
/// different session even for the same user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    /// User that requested the scan.
    pub user: UserId,
    /// Region the scan reads from.
    pub world: RegionId,
    /// Center of the scanned cube.
    pub origin: BlockPos,
}

impl SessionKey {
    /// Creates a session key.
    #[must_use]
    pub fn new(user: UserId, world: RegionId, origin: BlockPos) -> Self {
        Self {
            user,
            world,
            origin,
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.world, self.origin)
    }
}

/// Progress of one replication session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStatus {
    /// Units processed so far.
    pub current_progress: u32,
    /// Total units the session will process.
    pub total_units: u32,
    /// Whether the session has finished placing.
    pub complete: bool,
}

impl BuildStatus {
    /// Progress as a percentage in `0..=100`.
    #[must_use]
    pub fn progress_percent(&self) -> u8 {
        if self.total_units == 0 {
            return 0;
        }
        let pct = (u64::from(self.current_progress) * 100) / u64::from(self.total_units);
        pct.min(100) as u8
    }
}

/// Registry state in a serializable form.
///
/// Maps with struct keys are flattened to pair vectors so the aggregate
/// can round-trip through JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryState {
    /// Active session per user.
    pub active: Vec<(UserId, SessionKey)>,
    /// Status and anchor per session.
    pub sessions: Vec<(SessionKey, BuildStatus, Option<BlockPos>)>,
    /// Return-marker position to session key.
    pub reverse_links: Vec<(BlockPos, SessionKey)>,
    /// Game mode each user held before entering the target region.
    pub prior_modes: Vec<(UserId, GameMode)>,
    /// Whether each known user is currently in the target region.
    pub in_target: Vec<(UserId, bool)>,
}

#[derive(Debug, Clone, Default)]
struct SessionEntry {
    status: BuildStatus,
    anchor: Option<BlockPos>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    active: AHashMap<UserId, SessionKey>,
    sessions: AHashMap<SessionKey, SessionEntry>,
    reverse_links: AHashMap<BlockPos, SessionKey>,
    prior_modes: AHashMap<UserId, GameMode>,
    in_target: AHashMap<UserId, bool>,
}

/// Shared state for all replication sessions and user locations.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a session as the user's active one, superseding any
    /// previous active session for that user.
    pub fn set_active(&self, key: SessionKey) {
        let mut inner = self.inner.lock();
        if let Some(old) = inner.active.insert(key.user, key.clone()) {
            if old != key {
                debug!("Superseded session {old} with {key}");
            }
        }
    }

    /// Returns the user's active session key, if any.
    #[must_use]
    pub fn active_key(&self, user: UserId) -> Option<SessionKey> {
        self.inner.lock().active.get(&user).cloned()
    }

    /// Clears the user's active session.
    pub fn clear_active(&self, user: UserId) {
        self.inner.lock().active.remove(&user);
    }

    /// Returns the status for a session, creating a zeroed entry if
    /// the session is new.
    #[must_use]
    pub fn get_or_create_status(&self, key: &SessionKey) -> BuildStatus {
        let mut inner = self.inner.lock();
        inner.sessions.entry(key.clone()).or_default().status
    }

    /// Returns the status for a session without creating it.
    #[must_use]
    pub fn status(&self, key: &SessionKey) -> Option<BuildStatus> {
        self.inner.lock().sessions.get(key).map(|e| e.status)
    }

    /// Resets a session's entry to a fresh run. Progress monotonicity
    /// holds within one run; a superseding scan of the same key
    /// starts a new run from zero.
    pub fn reset_status(&self, key: &SessionKey) {
        self.inner
            .lock()
            .sessions
            .insert(key.clone(), SessionEntry::default());
    }

    /// Updates session progress. Progress never decreases and is
    /// clamped to the recorded total.
    pub fn update_status(&self, key: &SessionKey, progress: u32, total: u32) {
        let mut inner = self.inner.lock();
        let entry = inner.sessions.entry(key.clone()).or_default();
        if total > entry.status.total_units {
            entry.status.total_units = total;
        }
        let clamped = progress.min(entry.status.total_units);
        if clamped > entry.status.current_progress {
            entry.status.current_progress = clamped;
        }
        entry.status.complete =
            entry.status.total_units > 0 && entry.status.current_progress >= entry.status.total_units;
    }

    /// Marks a session complete with its final processed count.
    pub fn mark_complete(&self, key: &SessionKey, processed: u32) {
        let mut inner = self.inner.lock();
        let entry = inner.sessions.entry(key.clone()).or_default();
        if processed > entry.status.total_units {
            entry.status.total_units = processed;
        }
        entry.status.current_progress = entry.status.total_units;
        entry.status.complete = true;
        info!("Session {key} complete ({processed} units)");
    }

    /// Records the placement anchor for a session. Write-once: a
    /// second call with a different anchor is ignored with a warning.
    pub fn set_placement_anchor(&self, key: &SessionKey, anchor: BlockPos) {
        let mut inner = self.inner.lock();
        let entry = inner.sessions.entry(key.clone()).or_default();
        match entry.anchor {
            None => entry.anchor = Some(anchor),
            Some(existing) if existing != anchor => {
                warn!("Ignoring conflicting anchor {anchor} for {key} (kept {existing})");
            },
            Some(_) => {},
        }
    }

    /// Returns the placement anchor for a session, if recorded.
    #[must_use]
    pub fn placement_anchor(&self, key: &SessionKey) -> Option<BlockPos> {
        self.inner.lock().sessions.get(key).and_then(|e| e.anchor)
    }

    /// Registers a return-marker position pointing back at a session.
    pub fn register_reverse_link(&self, marker: BlockPos, key: SessionKey) {
        self.inner.lock().reverse_links.insert(marker, key);
    }

    /// Resolves a return-marker position to its session, if any.
    #[must_use]
    pub fn resolve_reverse_link(&self, marker: BlockPos) -> Option<SessionKey> {
        self.inner.lock().reverse_links.get(&marker).cloned()
    }

    /// Number of sessions the registry knows about.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// Drops all state.
    pub fn clear_all(&self) {
        let mut inner = self.inner.lock();
        inner.active.clear();
        inner.sessions.clear();
        inner.reverse_links.clear();
        inner.prior_modes.clear();
        inner.in_target.clear();
    }

    /// Exports the full registry state for persistence.
    #[must_use]
    pub fn export_state(&self) -> RegistryState {
        let inner = self.inner.lock();
        RegistryState {
            active: inner
                .active
                .iter()
                .map(|(u, k)| (*u, k.clone()))
                .collect(),
            sessions: inner
                .sessions
                .iter()
                .map(|(k, e)| (k.clone(), e.status, e.anchor))
                .collect(),
            reverse_links: inner
                .reverse_links
                .iter()
                .map(|(p, k)| (*p, k.clone()))
                .collect(),
            prior_modes: inner.prior_modes.iter().map(|(u, m)| (*u, *m)).collect(),
            in_target: inner.in_target.iter().map(|(u, f)| (*u, *f)).collect(),
        }
    }

    /// Replaces the registry contents with a previously exported state.
    pub fn import_state(&self, state: RegistryState) {
        let mut inner = self.inner.lock();
        inner.active = state.active.into_iter().collect();
        inner.sessions = state
            .sessions
            .into_iter()
            .map(|(k, status, anchor)| (k, SessionEntry { status, anchor }))
            .collect();
        inner.reverse_links = state.reverse_links.into_iter().collect();
        inner.prior_modes = state.prior_modes.into_iter().collect();
        inner.in_target = state.in_target.into_iter().collect();
        info!(
            "Imported registry state ({} sessions, {} users in target)",
            inner.sessions.len(),
            inner.in_target.values().filter(|f| **f).count()
        );
    }
}

impl LocationState for SessionRegistry {
    fn is_in_target(&self, user: UserId) -> bool {
        self.inner
            .lock()
            .in_target
            .get(&user)
            .copied()
            .unwrap_or(false)
    }

    fn set_in_target(&self, user: UserId, flag: bool) {
        self.inner.lock().in_target.insert(user, flag);
    }

    fn set_prior_mode(&self, user: UserId, mode: GameMode) {
        self.inner.lock().prior_modes.insert(user, mode);
    }

    fn take_prior_mode(&self, user: UserId) -> Option<GameMode> {
        self.inner.lock().prior_modes.remove(&user)
    }
}

/// Derives the deterministic placement anchor for a user and scan
/// origin. The same inputs always map to the same anchor, spread on a
/// 1000-block grid centered near the world origin at a fixed height.
#[must_use]
pub fn placement_anchor(user: UserId, origin: BlockPos) -> BlockPos {
    let mut hasher = FxHasher::default();
    user.raw().hash(&mut hasher);
    origin.x.hash(&mut hasher);
    origin.y.hash(&mut hasher);
    origin.z.hash(&mut hasher);
    let h = hasher.finish();

    let x = ((h % 100) as i32 - 50) * 1000;
    let z = (((h / 100) % 100) as i32 - 50) * 1000;
    BlockPos::new(x, ANCHOR_Y, z)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(user: u64, x: i32) -> SessionKey {
        SessionKey::new(
            UserId::from_raw(user),
            RegionId::new("overworld"),
            BlockPos::new(x, 64, 0),
        )
    }

    #[test]
    fn test_key_identity_includes_origin() {
        assert_eq!(key(1, 0), key(1, 0));
        assert_ne!(key(1, 0), key(1, 16));
        assert_ne!(key(1, 0), key(2, 0));
    }

    #[test]
    fn test_progress_is_monotonic_and_clamped() {
        let registry = SessionRegistry::new();
        let k = key(1, 0);

        registry.update_status(&k, 10, 100);
        registry.update_status(&k, 5, 100);
        assert_eq!(registry.status(&k).expect("status").current_progress, 10);

        registry.update_status(&k, 500, 100);
        let status = registry.status(&k).expect("status");
        assert_eq!(status.current_progress, 100);
        assert!(status.complete);
    }

    #[test]
    fn test_zero_total_never_completes() {
        let registry = SessionRegistry::new();
        let k = key(1, 0);

        registry.update_status(&k, 0, 0);
        let status = registry.status(&k).expect("status");
        assert!(!status.complete);
        assert_eq!(status.progress_percent(), 0);
    }

    #[test]
    fn test_reset_status_starts_a_fresh_run() {
        let registry = SessionRegistry::new();
        let k = key(1, 0);

        registry.mark_complete(&k, 10);
        assert!(registry.status(&k).expect("status").complete);

        registry.reset_status(&k);
        let status = registry.status(&k).expect("status");
        assert!(!status.complete);
        assert_eq!(status.current_progress, 0);
        assert_eq!(status.total_units, 0);

        // The new run's progress is not clamped by the old total.
        registry.update_status(&k, 3, 7);
        assert_eq!(registry.status(&k).expect("status").current_progress, 3);
    }

    #[test]
    fn test_set_active_supersedes() {
        let registry = SessionRegistry::new();
        let user = UserId::from_raw(1);

        registry.set_active(key(1, 0));
        registry.set_active(key(1, 16));
        assert_eq!(registry.active_key(user), Some(key(1, 16)));

        registry.clear_active(user);
        assert_eq!(registry.active_key(user), None);
    }

    #[test]
    fn test_anchor_is_write_once() {
        let registry = SessionRegistry::new();
        let k = key(1, 0);

        registry.set_placement_anchor(&k, BlockPos::new(1000, 70, 2000));
        registry.set_placement_anchor(&k, BlockPos::new(-4000, 70, 0));
        assert_eq!(
            registry.placement_anchor(&k),
            Some(BlockPos::new(1000, 70, 2000))
        );
    }

    #[test]
    fn test_reverse_link_roundtrip() {
        let registry = SessionRegistry::new();
        let k = key(1, 0);
        let marker = BlockPos::new(1000, 70, 2000);

        registry.register_reverse_link(marker, k.clone());
        assert_eq!(registry.resolve_reverse_link(marker), Some(k));
        assert_eq!(
            registry.resolve_reverse_link(BlockPos::new(0, 0, 0)),
            None
        );
    }

    #[test]
    fn test_export_import_roundtrip() {
        let registry = SessionRegistry::new();
        let k = key(1, 0);
        let user = UserId::from_raw(1);

        registry.set_active(k.clone());
        registry.update_status(&k, 50, 100);
        registry.set_placement_anchor(&k, BlockPos::new(1000, 70, 2000));
        registry.register_reverse_link(BlockPos::new(1000, 70, 2000), k.clone());
        registry.set_in_target(user, true);
        registry.set_prior_mode(user, GameMode::Survival);

        let state = registry.export_state();
        let encoded = serde_json::to_string(&state).expect("encode");
        let decoded: RegistryState = serde_json::from_str(&encoded).expect("decode");

        let restored = SessionRegistry::new();
        restored.import_state(decoded);

        assert_eq!(restored.active_key(user), Some(k.clone()));
        assert_eq!(
            restored.status(&k).expect("status").current_progress,
            50
        );
        assert_eq!(
            restored.placement_anchor(&k),
            Some(BlockPos::new(1000, 70, 2000))
        );
        assert!(restored.is_in_target(user));
        assert_eq!(restored.take_prior_mode(user), Some(GameMode::Survival));
    }

    #[test]
    fn test_clear_all_drops_everything() {
        let registry = SessionRegistry::new();
        let user = UserId::from_raw(1);

        registry.set_active(key(1, 0));
        registry.set_in_target(user, true);
        registry.clear_all();

        assert_eq!(registry.active_key(user), None);
        assert!(!registry.is_in_target(user));
        assert_eq!(registry.session_count(), 0);
    }

    proptest! {
        #[test]
        fn prop_anchor_is_deterministic(user in 1u64..u64::MAX, x in -30_000_000i32..30_000_000, y in -64i32..320, z in -30_000_000i32..30_000_000) {
            let uid = UserId::from_raw(user);
            let origin = BlockPos::new(x, y, z);
            let a = placement_anchor(uid, origin);
            let b = placement_anchor(uid, origin);
            prop_assert_eq!(a, b);
        }

        #[test]
        fn prop_anchor_on_grid(user in 1u64..u64::MAX, x in -1000i32..1000, z in -1000i32..1000) {
            let anchor = placement_anchor(UserId::from_raw(user), BlockPos::new(x, 64, z));
            prop_assert_eq!(anchor.y, ANCHOR_Y);
            prop_assert_eq!(anchor.x % 1000, 0);
            prop_assert_eq!(anchor.z % 1000, 0);
            prop_assert!((-50_000..=49_000).contains(&anchor.x));
            prop_assert!((-50_000..=49_000).contains(&anchor.z));
        }

        #[test]
        fn prop_progress_never_decreases(updates in proptest::collection::vec((0u32..200, 1u32..150), 1..20)) {
            let registry = SessionRegistry::new();
            let k = SessionKey::new(
                UserId::from_raw(1),
                RegionId::new("overworld"),
                BlockPos::new(0, 64, 0),
            );
            let mut last = 0;
            for (progress, total) in updates {
                registry.update_status(&k, progress, total);
                let now = registry.status(&k).expect("status").current_progress;
                prop_assert!(now >= last);
                last = now;
            }
        }
    }
}
