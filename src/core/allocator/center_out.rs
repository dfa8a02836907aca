//! Center-out placement
//!
//! Keeps a bitmap for bookkeeping plus a fixed visiting order of cluster
//! indices sorted by distance from the map center, so new data lands in
//! the hottest free cluster available.

use crate::allocator::{ClusterAllocator, ClusterBitmap};
use crate::error::{PixelMapError, Result};

pub struct CenterOutAllocator {
    bitmap: ClusterBitmap,
    order: Vec<u64>,
}

impl CenterOutAllocator {
    pub fn new<F>(total_clusters: usize, distance: F) -> Self
    where
        F: Fn(u64) -> f64,
    {
        let mut ranked: Vec<(f64, u64)> = (0..total_clusters as u64)
            .map(|cluster| (distance(cluster), cluster))
            .collect();
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        CenterOutAllocator {
            bitmap: ClusterBitmap::new(total_clusters),
            order: ranked.into_iter().map(|(_, cluster)| cluster).collect(),
        }
    }
}

impl ClusterAllocator for CenterOutAllocator {
    fn allocate(&mut self, count: usize) -> Result<Vec<u64>> {
        let available = self.bitmap.free_clusters();
        if count > available {
            return Err(PixelMapError::NoSpace {
                needed: count,
                available,
            });
        }

        let picked: Vec<u64> = self
            .order
            .iter()
            .copied()
            .filter(|&cluster| !self.bitmap.is_allocated(cluster))
            .take(count)
            .collect();

        for &cluster in &picked {
            self.bitmap.mark(cluster)?;
        }
        Ok(picked)
    }

    fn reserve(&mut self, cluster: u64) -> Result<bool> {
        self.bitmap.mark(cluster)
    }

    fn free(&mut self, clusters: &[u64]) -> Result<()> {
        self.bitmap.release(clusters)
    }

    fn is_allocated(&self, cluster: u64) -> bool {
        self.bitmap.is_allocated(cluster)
    }

    fn fragmentation_score(&self) -> f64 {
        self.bitmap.fragmentation_score()
    }

    fn total_clusters(&self) -> usize {
        self.bitmap.total_clusters()
    }

    fn free_clusters(&self) -> usize {
        self.bitmap.free_clusters()
    }
}
