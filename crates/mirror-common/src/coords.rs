//! Block coordinate types for source and target regions.

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// Absolute block position within a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Pod, Zeroable)]
#[repr(C)]
pub struct BlockPos {
    /// X coordinate
    pub x: i32,
    /// Y coordinate (vertical)
    pub y: i32,
    /// Z coordinate
    pub z: i32,
}

impl BlockPos {
    /// Position at the region origin.
    pub const ZERO: Self = Self::new(0, 0, 0);

    /// Creates a new block position.
    #[must_use]
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Returns this position offset by the given deltas.
    #[must_use]
    pub const fn offset(self, dx: i32, dy: i32, dz: i32) -> Self {
        Self::new(self.x + dx, self.y + dy, self.z + dz)
    }

    /// Returns this position offset by another position treated as a delta.
    #[must_use]
    pub const fn offset_by(self, delta: Self) -> Self {
        Self::new(self.x + delta.x, self.y + delta.y, self.z + delta.z)
    }

    /// Iterates every integer offset in the cube `±radius` around zero.
    ///
    /// Visits `(2 * radius + 1)^3` offsets in x-major order.
    pub fn cube_offsets(radius: u32) -> impl Iterator<Item = Self> {
        let r = radius as i32;
        (-r..=r).flat_map(move |x| {
            (-r..=r).flat_map(move |y| (-r..=r).map(move |z| Self::new(x, y, z)))
        })
    }
}

impl std::fmt::Display for BlockPos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Identifier for a named addressable region (world/dimension).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegionId(String);

impl RegionId {
    /// Creates a region identifier from a namespaced name.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RegionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
