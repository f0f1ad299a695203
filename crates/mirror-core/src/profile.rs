//! Profile snapshots and source/target slot swapping.
//!
//! This module provides:
//! - ProfileSnapshot: everything restored on a slot swap
//! - ProfileSwapManager: the two-slot swap between the user's normal
//!   profile and their target-region profile
//! - Disconnect/reconnect handling driven by persisted location state
//!
//! A user has at most two persisted profiles: the source slot (their
//! life outside the target region) and the target slot (their life
//! inside it). Exactly one is live at a time; the other sits on disk.

use crate::snapshot::{SnapshotStore, StoreError};
use mirror_common::{BlockPos, ItemTypeId, RegionId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

/// Errors that can occur during profile swaps.
#[derive(Debug, Error)]
pub enum SwapError {
    /// Snapshot persistence failed.
    #[error("Snapshot store error: {0}")]
    Store(#[from] StoreError),

    /// The snapshot could not be applied to the live player.
    #[error("Failed to apply profile: {0}")]
    Apply(String),

    /// Live state and recorded state disagree in a way the swap
    /// cannot resolve.
    #[error("Inconsistent profile state: {0}")]
    Inconsistent(String),
}

/// Result type for profile operations.
pub type SwapResult<T> = Result<T, SwapError>;

impl From<SwapError> for mirror_common::MirrorError {
    fn from(e: SwapError) -> Self {
        match e {
            SwapError::Store(inner) => Self::Persistence(inner.to_string()),
            SwapError::Apply(msg) => Self::World(msg),
            SwapError::Inconsistent(msg) => Self::Inconsistent(msg),
        }
    }
}

/// Game mode a profile runs under.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GameMode {
    /// Normal play.
    #[default]
    Survival,
    /// Unrestricted building.
    Creative,
    /// Exploration without block changes.
    Adventure,
    /// Free-flying observer.
    Spectator,
}

/// The two persisted profile slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileSlot {
    /// The user's profile outside the target region.
    Source,
    /// The user's profile inside the target region.
    Target,
}

impl ProfileSlot {
    /// Store key for this slot and user.
    #[must_use]
    pub fn key(self, user: UserId) -> String {
        match self {
            Self::Source => format!("source.{}", user.raw()),
            Self::Target => format!("target.{}", user.raw()),
        }
    }

    /// The other slot.
    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Self::Source => Self::Target,
            Self::Target => Self::Source,
        }
    }
}

/// Vital statistics carried by a profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileStats {
    /// Current health.
    pub health: f32,
    /// Hunger level.
    pub hunger: u32,
    /// Accumulated experience.
    pub experience: u32,
}

impl Default for ProfileStats {
    fn default() -> Self {
        Self {
            health: 20.0,
            hunger: 20,
            experience: 0,
        }
    }
}

/// Item storage carried by a profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inventory {
    /// Item counts by type.
    pub items: HashMap<ItemTypeId, u32>,
    /// Maximum number of distinct item stacks.
    pub capacity: usize,
}

impl Default for Inventory {
    fn default() -> Self {
        Self {
            items: HashMap::new(),
            capacity: 36,
        }
    }
}

impl Inventory {
    /// True when no items are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Everything restored when a profile slot becomes live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    /// Vital statistics.
    pub stats: ProfileStats,
    /// Item storage.
    pub inventory: Inventory,
    /// Position the profile resumes at.
    pub position: BlockPos,
    /// Region the profile resumes in.
    pub region: RegionId,
    /// Game mode the profile resumes under. Recorded at save time so
    /// a restore never inherits the mode of the slot being left.
    pub intended_mode: GameMode,
}

/// Per-user location and mode flags the swap manager reads and writes.
///
/// Kept behind a trait so the swap logic does not depend on the full
/// session registry.
pub trait LocationState: Send + Sync {
    /// Whether the user is recorded as being in the target region.
    fn is_in_target(&self, user: UserId) -> bool;
    /// Records whether the user is in the target region.
    fn set_in_target(&self, user: UserId, flag: bool);
    /// Records the game mode held before entering the target region.
    fn set_prior_mode(&self, user: UserId, mode: GameMode);
    /// Removes and returns the recorded prior mode.
    fn take_prior_mode(&self, user: UserId) -> Option<GameMode>;
}

/// Live handle to a connected player.
pub trait PlayerHandle {
    /// The player's user id.
    fn user_id(&self) -> UserId;
    /// The region the player is currently in.
    fn current_region(&self) -> RegionId;
    /// Captures the player's live state as a snapshot.
    fn capture(&self) -> ProfileSnapshot;
    /// Applies a snapshot to the live player.
    fn apply(&mut self, snapshot: &ProfileSnapshot) -> SwapResult<()>;
}

/// Swaps user profiles between the source and target slots.
pub struct ProfileSwapManager {
    store: Arc<SnapshotStore>,
    location: Arc<dyn LocationState>,
    target_region: RegionId,
}

impl ProfileSwapManager {
    /// Creates a swap manager.
    #[must_use]
    pub fn new(
        store: Arc<SnapshotStore>,
        location: Arc<dyn LocationState>,
        target_region: RegionId,
    ) -> Self {
        Self {
            store,
            location,
            target_region,
        }
    }

    /// Moves a player into the target region: saves their live state
    /// into the source slot and makes the target slot live.
    pub fn enter_target(&self, player: &mut dyn PlayerHandle) -> SwapResult<()> {
        let user = player.user_id();
        if self.location.is_in_target(user) {
            return Err(SwapError::Inconsistent(format!(
                "{user} is already in the target region"
            )));
        }

        let mut live = player.capture();
        self.location.set_prior_mode(user, live.intended_mode);
        // The source slot always carries the source mode; the prior
        // mode map, not the slot tag, decides what to restore.
        live.intended_mode = GameMode::Survival;
        self.store.save(&ProfileSlot::Source.key(user), &live)?;

        let target = match self.load_or_init_target(user, &live) {
            Ok(target) => target,
            Err(e) => {
                warn!("Target slot unreadable for {user} after source save: {e}");
                self.recover(player, ProfileSlot::Source, user);
                return Err(e);
            },
        };
        if let Err(e) = player.apply(&target) {
            self.recover(player, ProfileSlot::Source, user);
            return Err(e);
        }

        self.location.set_in_target(user, true);
        info!("{user} entered {}", self.target_region);
        Ok(())
    }

    /// Moves a player back out of the target region: saves their live
    /// state into the target slot and makes the source slot live.
    pub fn return_to_source(&self, player: &mut dyn PlayerHandle) -> SwapResult<()> {
        let user = player.user_id();
        if !self.location.is_in_target(user) {
            return Err(SwapError::Inconsistent(format!(
                "{user} is not in the target region"
            )));
        }

        let mut live = player.capture();
        live.intended_mode = GameMode::Creative;
        self.store.save(&ProfileSlot::Target.key(user), &live)?;

        let mut source: ProfileSnapshot = match self.store.load(&ProfileSlot::Source.key(user)) {
            Ok(source) => source,
            Err(e) => {
                warn!("Source slot unreadable for {user} after target save: {e}");
                self.recover(player, ProfileSlot::Target, user);
                return Err(e.into());
            },
        };
        source.intended_mode = self
            .location
            .take_prior_mode(user)
            .unwrap_or(source.intended_mode);
        if let Err(e) = player.apply(&source) {
            self.recover(player, ProfileSlot::Target, user);
            return Err(e);
        }

        self.location.set_in_target(user, false);
        info!("{user} returned from {}", self.target_region);
        Ok(())
    }

    /// Persists the player's live state into whichever slot matches
    /// their recorded location.
    pub fn on_disconnect(&self, player: &dyn PlayerHandle) -> SwapResult<()> {
        let user = player.user_id();
        let mut live = player.capture();
        let slot = if self.location.is_in_target(user) {
            live.intended_mode = GameMode::Creative;
            ProfileSlot::Target
        } else {
            live.intended_mode = GameMode::Survival;
            ProfileSlot::Source
        };
        self.store.save(&slot.key(user), &live)?;
        info!("Saved {user} to {slot:?} slot on disconnect");
        Ok(())
    }

    /// Restores the player to whichever slot their persisted location
    /// flag names. The flag, not the live region, decides: a player
    /// whose live region disagrees with it is moved to match.
    pub fn on_reconnect(&self, player: &mut dyn PlayerHandle) -> SwapResult<()> {
        let user = player.user_id();
        let in_target = self.location.is_in_target(user);
        let live_in_target = player.current_region() == self.target_region;
        if in_target != live_in_target {
            warn!(
                "{user} reconnected in {} but is recorded {}; restoring recorded slot",
                player.current_region(),
                if in_target { "in target" } else { "in source" }
            );
        }

        let slot = if in_target {
            ProfileSlot::Target
        } else {
            ProfileSlot::Source
        };
        let snapshot = match self.store.load(&slot.key(user)) {
            Ok(snapshot) => snapshot,
            Err(StoreError::NotFound(_)) => {
                // First time we see this user in this slot. Their live
                // state becomes the slot's initial contents.
                let mut live = player.capture();
                live.intended_mode = if in_target {
                    GameMode::Creative
                } else {
                    GameMode::Survival
                };
                self.store.save(&slot.key(user), &live)?;
                live
            },
            Err(e) => return Err(e.into()),
        };
        player.apply(&snapshot)?;
        Ok(())
    }

    /// The region profiles enter on the target slot.
    #[must_use]
    pub fn target_region(&self) -> &RegionId {
        &self.target_region
    }

    fn load_or_init_target(
        &self,
        user: UserId,
        live: &ProfileSnapshot,
    ) -> SwapResult<ProfileSnapshot> {
        match self.store.load(&ProfileSlot::Target.key(user)) {
            Ok(snapshot) => Ok(snapshot),
            Err(StoreError::NotFound(_)) => {
                // First visit: the target slot starts as the user's
                // live profile, moved into the target region in
                // creative mode, then read back through the normal
                // load path.
                let snapshot = ProfileSnapshot {
                    region: self.target_region.clone(),
                    intended_mode: GameMode::Creative,
                    ..live.clone()
                };
                self.store.save(&ProfileSlot::Target.key(user), &snapshot)?;
                Ok(self.store.load(&ProfileSlot::Target.key(user))?)
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Rolls the live player back to the slot that was just saved,
    /// leaving them where they started instead of half-swapped.
    fn recover(&self, player: &mut dyn PlayerHandle, saved: ProfileSlot, user: UserId) {
        match self.store.load::<ProfileSnapshot>(&saved.key(user)) {
            Ok(snapshot) => {
                if let Err(e) = player.apply(&snapshot) {
                    error!("Rollback apply failed for {user}: {e}");
                } else {
                    warn!("Rolled {user} back to {saved:?} slot after failed swap");
                }
            },
            Err(e) => error!("Rollback load failed for {user}: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct TestLocation {
        in_target: Mutex<HashMap<UserId, bool>>,
        prior: Mutex<HashMap<UserId, GameMode>>,
    }

    impl LocationState for TestLocation {
        fn is_in_target(&self, user: UserId) -> bool {
            self.in_target.lock().get(&user).copied().unwrap_or(false)
        }
        fn set_in_target(&self, user: UserId, flag: bool) {
            self.in_target.lock().insert(user, flag);
        }
        fn set_prior_mode(&self, user: UserId, mode: GameMode) {
            self.prior.lock().insert(user, mode);
        }
        fn take_prior_mode(&self, user: UserId) -> Option<GameMode> {
            self.prior.lock().remove(&user)
        }
    }

    struct TestPlayer {
        user: UserId,
        snapshot: ProfileSnapshot,
        fail_apply: bool,
    }

    impl TestPlayer {
        fn new(user: u64) -> Self {
            Self {
                user: UserId::from_raw(user),
                snapshot: ProfileSnapshot {
                    stats: ProfileStats::default(),
                    inventory: Inventory::default(),
                    position: BlockPos::new(100, 64, -30),
                    region: RegionId::new("overworld"),
                    intended_mode: GameMode::Survival,
                },
                fail_apply: false,
            }
        }
    }

    impl PlayerHandle for TestPlayer {
        fn user_id(&self) -> UserId {
            self.user
        }
        fn current_region(&self) -> RegionId {
            self.snapshot.region.clone()
        }
        fn capture(&self) -> ProfileSnapshot {
            self.snapshot.clone()
        }
        fn apply(&mut self, snapshot: &ProfileSnapshot) -> SwapResult<()> {
            if self.fail_apply {
                return Err(SwapError::Apply("test failure".to_string()));
            }
            self.snapshot = snapshot.clone();
            Ok(())
        }
    }

    fn manager(dir: &std::path::Path) -> ProfileSwapManager {
        ProfileSwapManager::new(
            Arc::new(SnapshotStore::new(dir)),
            Arc::new(TestLocation::default()),
            RegionId::new("mirror:sandbox"),
        )
    }

    #[test]
    fn test_enter_and_return_roundtrip() {
        let dir = tempfile::tempdir().expect("temp dir");
        let swap = manager(dir.path());
        let mut player = TestPlayer::new(1);
        player.snapshot.inventory.items.insert(ItemTypeId::from_raw(7), 12);

        swap.enter_target(&mut player).expect("enter");
        assert_eq!(player.snapshot.region, RegionId::new("mirror:sandbox"));
        assert_eq!(player.snapshot.intended_mode, GameMode::Creative);
        // First visit seeds the target slot from the live profile.
        assert_eq!(
            player.snapshot.inventory.items.get(&ItemTypeId::from_raw(7)),
            Some(&12)
        );

        swap.return_to_source(&mut player).expect("return");
        assert_eq!(player.snapshot.region, RegionId::new("overworld"));
        assert_eq!(player.snapshot.intended_mode, GameMode::Survival);
        assert_eq!(
            player.snapshot.inventory.items.get(&ItemTypeId::from_raw(7)),
            Some(&12)
        );
    }

    #[test]
    fn test_source_slot_mode_is_forced() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = Arc::new(SnapshotStore::new(dir.path()));
        let swap = ProfileSwapManager::new(
            Arc::clone(&store),
            Arc::new(TestLocation::default()),
            RegionId::new("mirror:sandbox"),
        );
        let mut player = TestPlayer::new(1);
        player.snapshot.intended_mode = GameMode::Creative;

        swap.enter_target(&mut player).expect("enter");
        let source: ProfileSnapshot = store
            .load(&ProfileSlot::Source.key(player.user))
            .expect("source slot");
        // The slot tag never trusts the live object's mode.
        assert_eq!(source.intended_mode, GameMode::Survival);
    }

    #[test]
    fn test_target_synthesis_keeps_live_profile() {
        let dir = tempfile::tempdir().expect("temp dir");
        let swap = manager(dir.path());
        let mut player = TestPlayer::new(1);
        player
            .snapshot
            .inventory
            .items
            .insert(ItemTypeId::from_raw(7), 12);
        player.snapshot.stats.experience = 40;

        swap.enter_target(&mut player).expect("enter");
        assert_eq!(
            player.snapshot.inventory.items.get(&ItemTypeId::from_raw(7)),
            Some(&12)
        );
        assert_eq!(player.snapshot.stats.experience, 40);
        assert_eq!(player.snapshot.intended_mode, GameMode::Creative);
        assert_eq!(player.snapshot.region, RegionId::new("mirror:sandbox"));
    }

    #[test]
    fn test_unreadable_target_slot_aborts_enter() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = Arc::new(SnapshotStore::new(dir.path()));
        let location = Arc::new(TestLocation::default());
        let swap = ProfileSwapManager::new(
            Arc::clone(&store),
            location.clone(),
            RegionId::new("mirror:sandbox"),
        );
        let mut player = TestPlayer::new(1);
        let original = player.snapshot.clone();

        std::fs::write(
            dir.path().join(format!("{}.json", ProfileSlot::Target.key(player.user))),
            b"{not json",
        )
        .expect("corrupt target slot");

        assert!(matches!(
            swap.enter_target(&mut player),
            Err(SwapError::Store(_))
        ));
        // The swap rolled back: location flag never flipped and the
        // player kept their source-side state.
        assert!(!location.is_in_target(player.user));
        assert_eq!(player.snapshot.region, original.region);
        assert_eq!(player.snapshot.position, original.position);
    }

    #[test]
    fn test_target_slot_persists_between_visits() {
        let dir = tempfile::tempdir().expect("temp dir");
        let swap = manager(dir.path());
        let mut player = TestPlayer::new(1);

        swap.enter_target(&mut player).expect("first enter");
        player
            .snapshot
            .inventory
            .items
            .insert(ItemTypeId::from_raw(42), 3);
        swap.return_to_source(&mut player).expect("return");

        swap.enter_target(&mut player).expect("second enter");
        assert_eq!(
            player.snapshot.inventory.items.get(&ItemTypeId::from_raw(42)),
            Some(&3)
        );
    }

    #[test]
    fn test_double_enter_rejected() {
        let dir = tempfile::tempdir().expect("temp dir");
        let swap = manager(dir.path());
        let mut player = TestPlayer::new(1);

        swap.enter_target(&mut player).expect("enter");
        assert!(matches!(
            swap.enter_target(&mut player),
            Err(SwapError::Inconsistent(_))
        ));
    }

    #[test]
    fn test_return_without_enter_rejected() {
        let dir = tempfile::tempdir().expect("temp dir");
        let swap = manager(dir.path());
        let mut player = TestPlayer::new(1);

        assert!(matches!(
            swap.return_to_source(&mut player),
            Err(SwapError::Inconsistent(_))
        ));
    }

    #[test]
    fn test_failed_apply_rolls_back() {
        let dir = tempfile::tempdir().expect("temp dir");
        let swap = manager(dir.path());
        let mut player = TestPlayer::new(1);
        let original = player.snapshot.clone();
        player.fail_apply = true;

        assert!(swap.enter_target(&mut player).is_err());
        // Rollback also applies, which fails under fail_apply; the
        // player keeps whatever state they had.
        player.fail_apply = false;
        assert_eq!(player.snapshot, original);
        // Location flag never flipped.
        swap.enter_target(&mut player).expect("retry succeeds");
    }

    #[test]
    fn test_disconnect_saves_matching_slot() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = Arc::new(SnapshotStore::new(dir.path()));
        let location = Arc::new(TestLocation::default());
        let swap = ProfileSwapManager::new(
            Arc::clone(&store),
            location.clone(),
            RegionId::new("mirror:sandbox"),
        );
        let mut player = TestPlayer::new(1);

        swap.enter_target(&mut player).expect("enter");
        player.snapshot.stats.experience = 99;
        swap.on_disconnect(&player).expect("disconnect");

        let saved: ProfileSnapshot = store
            .load(&ProfileSlot::Target.key(player.user))
            .expect("target slot");
        assert_eq!(saved.stats.experience, 99);
        assert_eq!(saved.intended_mode, GameMode::Creative);
    }

    #[test]
    fn test_reconnect_trusts_persisted_flag() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = Arc::new(SnapshotStore::new(dir.path()));
        let location = Arc::new(TestLocation::default());
        let swap = ProfileSwapManager::new(
            Arc::clone(&store),
            location.clone(),
            RegionId::new("mirror:sandbox"),
        );
        let mut player = TestPlayer::new(1);

        swap.enter_target(&mut player).expect("enter");
        swap.on_disconnect(&player).expect("disconnect");

        // Simulate a restart that respawned the player in the source
        // region even though the flag says target.
        player.snapshot.region = RegionId::new("overworld");
        swap.on_reconnect(&mut player).expect("reconnect");
        assert_eq!(player.snapshot.region, RegionId::new("mirror:sandbox"));
        assert_eq!(player.snapshot.intended_mode, GameMode::Creative);
    }

    #[test]
    fn test_reconnect_unknown_user_seeds_source_slot() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = Arc::new(SnapshotStore::new(dir.path()));
        let swap = ProfileSwapManager::new(
            Arc::clone(&store),
            Arc::new(TestLocation::default()),
            RegionId::new("mirror:sandbox"),
        );
        let mut player = TestPlayer::new(5);

        swap.on_reconnect(&mut player).expect("reconnect");
        assert!(store.exists(&ProfileSlot::Source.key(player.user)));
        assert_eq!(player.snapshot.region, RegionId::new("overworld"));
    }
}
