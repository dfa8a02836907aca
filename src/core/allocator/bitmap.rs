//! Bitmap cluster allocator
//!
//! Each bit represents one 4KB cluster. Allocation always hands out the
//! lowest free index, which keeps files packed along the Hilbert curve.

use crate::allocator::ClusterAllocator;
use crate::error::{PixelMapError, Result};

/// Bitmap over cluster indices
///
/// Represents free/allocated state with bits:
/// - 0 = free cluster
/// - 1 = allocated cluster
#[derive(Debug, Clone)]
pub struct ClusterBitmap {
    /// Bitmap words (each word = 64 clusters)
    bitmap: Vec<u64>,

    /// Total number of clusters tracked
    total_clusters: usize,

    /// Number of free clusters available
    free_clusters: usize,
}

impl ClusterBitmap {
    pub fn new(total_clusters: usize) -> Self {
        let num_words = total_clusters.div_ceil(64);
        ClusterBitmap {
            bitmap: vec![0u64; num_words],
            total_clusters,
            free_clusters: total_clusters,
        }
    }

    fn check(&self, cluster: u64) -> Result<(usize, usize)> {
        if cluster >= self.total_clusters as u64 {
            return Err(PixelMapError::OutOfBounds(format!(
                "cluster {} beyond {} clusters",
                cluster, self.total_clusters
            )));
        }
        Ok(((cluster / 64) as usize, (cluster % 64) as usize))
    }

    /// Allocate the lowest `count` free clusters
    ///
    /// Clusters don't need to be contiguous.
    pub fn allocate_lowest(&mut self, count: usize) -> Result<Vec<u64>> {
        if count > self.free_clusters {
            return Err(PixelMapError::NoSpace {
                needed: count,
                available: self.free_clusters,
            });
        }

        let mut allocated = Vec::with_capacity(count);

        'outer: for (word_idx, word) in self.bitmap.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }

            for bit_idx in 0..64 {
                if allocated.len() == count {
                    break 'outer;
                }

                if (*word & (1u64 << bit_idx)) == 0 {
                    let cluster = (word_idx * 64 + bit_idx) as u64;
                    if cluster >= self.total_clusters as u64 {
                        break 'outer;
                    }

                    allocated.push(cluster);
                    *word |= 1u64 << bit_idx;
                }
            }
        }

        if allocated.len() != count {
            // Rollback allocations
            for &cluster in &allocated {
                self.clear(cluster);
            }
            return Err(PixelMapError::NoSpace {
                needed: count,
                available: self.free_clusters,
            });
        }

        self.free_clusters -= count;
        Ok(allocated)
    }

    /// Set one bit; returns false if it was already set
    pub fn mark(&mut self, cluster: u64) -> Result<bool> {
        let (word_idx, bit_idx) = self.check(cluster)?;
        if (self.bitmap[word_idx] & (1u64 << bit_idx)) != 0 {
            return Ok(false);
        }
        self.bitmap[word_idx] |= 1u64 << bit_idx;
        self.free_clusters -= 1;
        Ok(true)
    }

    fn clear(&mut self, cluster: u64) {
        let word_idx = (cluster / 64) as usize;
        let bit_idx = (cluster % 64) as usize;
        self.bitmap[word_idx] &= !(1u64 << bit_idx);
    }

    /// Free previously allocated clusters
    pub fn release(&mut self, clusters: &[u64]) -> Result<()> {
        for &cluster in clusters {
            let (word_idx, bit_idx) = self.check(cluster)?;

            if (self.bitmap[word_idx] & (1u64 << bit_idx)) == 0 {
                tracing::warn!("Double-free detected for cluster {}", cluster);
                continue;
            }

            self.bitmap[word_idx] &= !(1u64 << bit_idx);
            self.free_clusters += 1;
        }
        Ok(())
    }
}

impl ClusterAllocator for ClusterBitmap {
    fn allocate(&mut self, count: usize) -> Result<Vec<u64>> {
        self.allocate_lowest(count)
    }

    fn reserve(&mut self, cluster: u64) -> Result<bool> {
        self.mark(cluster)
    }

    fn free(&mut self, clusters: &[u64]) -> Result<()> {
        self.release(clusters)
    }

    fn is_allocated(&self, cluster: u64) -> bool {
        match self.check(cluster) {
            Ok((word_idx, bit_idx)) => (self.bitmap[word_idx] & (1u64 << bit_idx)) != 0,
            Err(_) => false,
        }
    }

    fn fragmentation_score(&self) -> f64 {
        if self.total_clusters == 0 {
            return 0.0;
        }

        // Count free/allocated transitions across the tracked range
        let mut transitions = 0usize;
        let mut prev_allocated = false;
        for cluster in 0..self.total_clusters as u64 {
            let allocated = self.is_allocated(cluster);
            if allocated != prev_allocated {
                transitions += 1;
            }
            prev_allocated = allocated;
        }

        transitions as f64 / self.total_clusters as f64
    }

    fn total_clusters(&self) -> usize {
        self.total_clusters
    }

    fn free_clusters(&self) -> usize {
        self.free_clusters
    }
}
