//! Storage engine: curve mapping, cluster I/O, allocation, and the
//! filesystem built on top of them

pub mod allocator;
pub mod cluster_store;
pub mod compression;
pub mod config;
pub mod error;
pub mod fs;
pub mod grid;
pub mod hilbert;
pub mod layout;
pub mod predictor;
pub mod prefetch;
pub mod superblock;
pub mod vat;
pub mod zone;

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the unix epoch, as a float
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
