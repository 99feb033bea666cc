//! NAND partition broker with persistent bad block tracking.
//!
//! Sits between a raw NAND controller and higher-level storage consumers.
//! [`attach`] consumes the platform's partition map and bad-block
//! configuration blobs and spawns one [`Partition`] per map entry; each
//! partition presents the parent's command surface with block-local
//! addressing, plus bad-block queries backed by one shared
//! [`bbt::BadBlockStore`]. The store keeps its table in a reserved range
//! of erase blocks, redundantly and wear-aware, and recovers the newest
//! complete copy at startup.

pub mod bbt;
pub mod error;
pub mod metadata;
pub mod nand;
pub mod partition;

pub use error::{Error, Result};
pub use partition::{attach, Partition};
