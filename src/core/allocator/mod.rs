//! Cluster allocation strategies
//!
//! Free/used state for every 4KB cluster is tracked in a bitmap. Two
//! placement policies sit on top of it:
//! - Sequential: lowest free cluster index first
//! - Center-out: free cluster nearest the map center first

pub mod bitmap;
pub mod center_out;

pub use bitmap::ClusterBitmap;
pub use center_out::CenterOutAllocator;

use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Placement policy for newly allocated clusters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AllocationStrategy {
    #[default]
    Sequential,
    CenterOut,
}

/// Cluster allocator trait
///
/// Defines the interface for allocating and freeing clusters by linear
/// cluster index.
pub trait ClusterAllocator: Send + Sync {
    /// Allocate `count` clusters, all or nothing
    fn allocate(&mut self, count: usize) -> Result<Vec<u64>>;

    /// Mark a specific cluster as used
    ///
    /// Returns false when the cluster was already in use.
    fn reserve(&mut self, cluster: u64) -> Result<bool>;

    /// Free previously allocated clusters
    fn free(&mut self, clusters: &[u64]) -> Result<()>;

    fn is_allocated(&self, cluster: u64) -> bool;

    /// Calculate fragmentation score (0.0 = no fragmentation, higher = more fragmented)
    fn fragmentation_score(&self) -> f64;

    fn total_clusters(&self) -> usize;

    fn free_clusters(&self) -> usize;
}

/// Build the allocator for a strategy
///
/// `distance` maps a cluster index to its distance from the map center and
/// is only consulted by the center-out policy.
pub fn build_allocator<F>(
    strategy: AllocationStrategy,
    total_clusters: usize,
    distance: F,
) -> Box<dyn ClusterAllocator>
where
    F: Fn(u64) -> f64,
{
    match strategy {
        AllocationStrategy::Sequential => Box::new(ClusterBitmap::new(total_clusters)),
        AllocationStrategy::CenterOut => {
            Box::new(CenterOutAllocator::new(total_clusters, distance))
        }
    }
}
