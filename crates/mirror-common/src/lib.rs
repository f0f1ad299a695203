//! # Mirror Common
//!
//! Common types shared by the Mirrorspace engine crates:
//! - Block coordinate and region identifier types
//! - ID types (UserId, ItemTypeId)
//! - Shared error taxonomy

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod coords;
pub mod error;
pub mod ids;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::coords::*;
    pub use crate::error::*;
    pub use crate::ids::*;
}

pub use prelude::*;
