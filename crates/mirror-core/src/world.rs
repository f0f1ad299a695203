//! World content abstraction.
//!
//! The engine never owns world content; the host environment provides
//! it behind two narrow traits:
//! - [`WorldView`]: read-only access, safe to call from worker threads
//! - [`WorldWriter`]: mutation, simulation thread only
//!
//! [`MemoryRegion`] is an in-memory implementation of both, used by
//! tests and by hosts without a native world backend.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

use mirror_common::BlockPos;

/// Errors reading or writing world content.
#[derive(Debug, Error)]
pub enum WorldError {
    /// The position's chunk is not loaded.
    #[error("position {0} is not loaded")]
    Unloaded(BlockPos),

    /// The backing store failed to produce content.
    #[error("world backend error: {0}")]
    Backend(String),

    /// A block could not be placed.
    #[error("placement failed at {pos}: {reason}")]
    Placement {
        /// Target position of the failed placement.
        pos: BlockPos,
        /// Backend-provided reason.
        reason: String,
    },
}

/// Result type for world access.
pub type WorldResult<T> = Result<T, WorldError>;

/// Opaque block content state, identified by a host-defined id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockState {
    id: String,
}

impl BlockState {
    /// Identifier used for empty content.
    pub const AIR_ID: &'static str = "air";

    /// Creates a block state with the given identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// The empty block state.
    #[must_use]
    pub fn air() -> Self {
        Self::new(Self::AIR_ID)
    }

    /// Returns the content identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Checks whether this state is empty content.
    #[must_use]
    pub fn is_air(&self) -> bool {
        self.id == Self::AIR_ID
    }
}

/// Auxiliary structured data attached to a complex block (e.g. a
/// container's contents). The owning position is rewritten when the
/// data is replicated into the target region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuxData {
    /// Position the data belongs to.
    pub pos: BlockPos,
    /// Host-defined structured payload.
    pub payload: serde_json::Value,
}

impl AuxData {
    /// Creates auxiliary data owned by the given position.
    #[must_use]
    pub fn new(pos: BlockPos, payload: serde_json::Value) -> Self {
        Self { pos, payload }
    }

    /// Returns a copy with the owning position rewritten to `pos`.
    #[must_use]
    pub fn relocated(&self, pos: BlockPos) -> Self {
        Self {
            pos,
            payload: self.payload.clone(),
        }
    }
}

/// Read-only view of a region's content. Implementations must be
/// callable from worker threads.
pub trait WorldView: Send + Sync {
    /// Whether the position is currently loaded/available.
    fn is_loaded(&self, pos: BlockPos) -> bool;

    /// Reads the block state at a position. Empty content is
    /// [`BlockState::air`], not an error.
    fn block_state(&self, pos: BlockPos) -> WorldResult<BlockState>;

    /// Whether the position carries auxiliary structured data.
    fn has_aux_data(&self, pos: BlockPos) -> bool;

    /// Reads the auxiliary data at a position, if any.
    fn aux_data(&self, pos: BlockPos) -> WorldResult<Option<AuxData>>;
}

/// Mutating access to a region's content. Simulation thread only.
pub trait WorldWriter {
    /// Places a block state at a position.
    fn set_block(&mut self, pos: BlockPos, state: &BlockState) -> WorldResult<()>;

    /// Attaches auxiliary data to a position.
    fn set_aux_data(&mut self, pos: BlockPos, aux: AuxData) -> WorldResult<()>;
}

/// In-memory region used by tests and world-less hosts.
///
/// Every position is considered loaded unless explicitly marked
/// unloaded. Absent positions read as air.
#[derive(Debug, Default)]
pub struct MemoryRegion {
    blocks: AHashMap<BlockPos, BlockState>,
    aux: AHashMap<BlockPos, AuxData>,
    unloaded: HashSet<BlockPos>,
}

impl MemoryRegion {
    /// Creates an empty region.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a position as unloaded; reads of it are skipped by scans.
    pub fn mark_unloaded(&mut self, pos: BlockPos) {
        self.unloaded.insert(pos);
    }

    /// Number of non-air blocks stored.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Number of positions with auxiliary data.
    #[must_use]
    pub fn aux_count(&self) -> usize {
        self.aux.len()
    }

    /// Convenience direct read for assertions.
    #[must_use]
    pub fn get(&self, pos: BlockPos) -> Option<&BlockState> {
        self.blocks.get(&pos)
    }

    /// Convenience direct aux read for assertions.
    #[must_use]
    pub fn get_aux(&self, pos: BlockPos) -> Option<&AuxData> {
        self.aux.get(&pos)
    }

    /// Removes the block (and any aux data) at a position.
    pub fn clear_block(&mut self, pos: BlockPos) {
        self.blocks.remove(&pos);
        self.aux.remove(&pos);
    }
}

impl WorldView for MemoryRegion {
    fn is_loaded(&self, pos: BlockPos) -> bool {
        !self.unloaded.contains(&pos)
    }

    fn block_state(&self, pos: BlockPos) -> WorldResult<BlockState> {
        if !self.is_loaded(pos) {
            return Err(WorldError::Unloaded(pos));
        }
        Ok(self.blocks.get(&pos).cloned().unwrap_or_else(BlockState::air))
    }

    fn has_aux_data(&self, pos: BlockPos) -> bool {
        self.aux.contains_key(&pos)
    }

    fn aux_data(&self, pos: BlockPos) -> WorldResult<Option<AuxData>> {
        if !self.is_loaded(pos) {
            return Err(WorldError::Unloaded(pos));
        }
        Ok(self.aux.get(&pos).cloned())
    }
}

impl WorldWriter for MemoryRegion {
    fn set_block(&mut self, pos: BlockPos, state: &BlockState) -> WorldResult<()> {
        if !self.is_loaded(pos) {
            return Err(WorldError::Unloaded(pos));
        }
        if state.is_air() {
            self.clear_block(pos);
        } else {
            self.blocks.insert(pos, state.clone());
        }
        Ok(())
    }

    fn set_aux_data(&mut self, pos: BlockPos, aux: AuxData) -> WorldResult<()> {
        if !self.is_loaded(pos) {
            return Err(WorldError::Unloaded(pos));
        }
        self.aux.insert(pos, aux);
        Ok(())
    }
}
