//! The persistent bad block table (BBT).
//!
//! A contiguous range of reserved erase blocks is dedicated to the table.
//! Successive copies are appended within the active block at a fixed page
//! stride; each copy's pages carry an OOB header with a magic value, the
//! hosting block's erase count, and a generation number. Startup scans the
//! reserved range, picks the block holding the highest generation, and
//! walks it for the newest complete copy. Commits append a new generation,
//! rotating to the least-worn reserved block when the active one fills up
//! or fails, and demoting blocks that fail to program or erase.

pub mod header;
mod store;

pub use store::{BadBlockStore, BlockStatus, BLOCK_LIST_MAX};
