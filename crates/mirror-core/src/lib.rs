//! Mirrorspace engine.
//!
//! Replicates user-selected regions of a source world into a shared
//! target region and migrates user profiles between the two. The
//! pipeline:
//!
//! 1. A scan walks the cube around an origin on a worker thread and
//!    sorts its contents into placement candidates.
//! 2. The scheduler places candidates in bounded per-tick batches at
//!    a deterministic anchor in the target region, simple blocks
//!    first, then aux-data carriers re-read from the source.
//! 3. Once placement finishes, the user can transition: their live
//!    profile is swapped with a per-region snapshot slot.
//!
//! Hosts embed [`Engine`] and drive it with [`Engine::tick`] plus the
//! command and connection hooks.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod command;
pub mod config;
pub mod engine;
pub mod policy;
pub mod profile;
pub mod scanner;
pub mod scheduler;
pub mod session;
pub mod snapshot;
pub mod world;

pub use command::{EngineCommand, EngineEvent, EventBus};
pub use config::EngineConfig;
pub use engine::Engine;
pub use policy::ContentPolicy;
pub use profile::{
    GameMode, PlayerHandle, ProfileSnapshot, ProfileSwapManager, SwapError,
};
pub use scanner::{RegionScanner, ScanError, ScanRequest};
pub use scheduler::{ReplicationScheduler, TickReport, RETURN_MARKER_ID};
pub use session::{placement_anchor, BuildStatus, SessionKey, SessionRegistry};
pub use snapshot::{SnapshotStore, StoreError};
pub use world::{AuxData, BlockState, MemoryRegion, WorldView, WorldWriter};

pub use mirror_common::{BlockPos, MirrorError, MirrorResult, RegionId, UserId};
