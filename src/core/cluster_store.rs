//! Cluster-level access to the pixel arena
//!
//! A cluster is 4096 stream bytes (1024 pixels). Cluster `c` starts at curve
//! index `c * 1024`, so its identity on the grid is the pixel at that index.
//! Whole clusters are cached in an LRU keyed by that location.
//!
//! Sequencing: writers hold the grid write lock across both the pixel
//! update and the cache invalidation. Readers fill the cache while still
//! holding the grid read lock. Lock order is grid, then cache.

use crate::error::{PixelMapError, Result};
use crate::grid::SharedGrid;
use crate::hilbert::HilbertCurve;
use crate::layout::LegacyExtent;
use crate::superblock::{CLUSTER_SIZE, PIXELS_PER_CLUSTER};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Grid coordinate of a cluster's first pixel
///
/// Serialized as `[x, y]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "[u32; 2]", into = "[u32; 2]")]
pub struct ClusterLocation {
    pub x: u32,
    pub y: u32,
}

impl ClusterLocation {
    pub fn new(x: u32, y: u32) -> Self {
        ClusterLocation { x, y }
    }
}

impl From<[u32; 2]> for ClusterLocation {
    fn from(pair: [u32; 2]) -> Self {
        ClusterLocation {
            x: pair[0],
            y: pair[1],
        }
    }
}

impl From<ClusterLocation> for [u32; 2] {
    fn from(loc: ClusterLocation) -> Self {
        [loc.x, loc.y]
    }
}

/// Mapping between cluster indices and grid locations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterGeometry {
    curve: HilbertCurve,
    total_clusters: u64,
}

impl ClusterGeometry {
    pub fn new(grid_size: u32) -> Result<Self> {
        let curve = HilbertCurve::for_grid(grid_size)?;
        let total_clusters = curve.len() / PIXELS_PER_CLUSTER;
        if total_clusters == 0 {
            return Err(PixelMapError::InvalidGrid(format!(
                "{}x{} grid is smaller than one cluster",
                grid_size, grid_size
            )));
        }
        Ok(ClusterGeometry {
            curve,
            total_clusters,
        })
    }

    pub fn grid_size(&self) -> u32 {
        self.curve.side()
    }

    pub fn curve(&self) -> &HilbertCurve {
        &self.curve
    }

    pub fn total_clusters(&self) -> u64 {
        self.total_clusters
    }

    /// Location of cluster `index`
    pub fn location(&self, index: u64) -> Result<ClusterLocation> {
        if index >= self.total_clusters {
            return Err(PixelMapError::OutOfBounds(format!(
                "cluster {} beyond {} clusters",
                index, self.total_clusters
            )));
        }
        let (x, y) = self.curve.index_to_xy(index * PIXELS_PER_CLUSTER)?;
        Ok(ClusterLocation { x, y })
    }

    /// Cluster index of `loc`, or `None` if it is not a cluster start
    pub fn index(&self, loc: ClusterLocation) -> Option<u64> {
        let pixel = self.curve.xy_to_index(loc.x, loc.y).ok()?;
        (pixel % PIXELS_PER_CLUSTER == 0).then_some(pixel / PIXELS_PER_CLUSTER)
    }

    fn stream_offset(&self, loc: ClusterLocation) -> Result<u64> {
        self.index(loc)
            .map(|index| index * CLUSTER_SIZE as u64)
            .ok_or_else(|| {
                PixelMapError::OutOfBounds(format!(
                    "({}, {}) is not a cluster start",
                    loc.x, loc.y
                ))
            })
    }
}

/// Cluster cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub capacity: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

pub struct ClusterStore {
    grid: SharedGrid,
    geometry: ClusterGeometry,
    cache: Mutex<LruCache<ClusterLocation, Arc<[u8]>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ClusterStore {
    /// Create a store over `grid` with a cache of `cache_bytes`
    ///
    /// The cache holds at least one cluster.
    pub fn new(grid: SharedGrid, cache_bytes: usize) -> Result<Self> {
        let geometry = ClusterGeometry::new(grid.read().grid_size())?;
        let clusters = (cache_bytes / CLUSTER_SIZE).max(1);
        let capacity = NonZeroUsize::new(clusters).unwrap_or(NonZeroUsize::MIN);

        Ok(ClusterStore {
            grid,
            geometry,
            cache: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    pub fn geometry(&self) -> &ClusterGeometry {
        &self.geometry
    }

    pub fn grid(&self) -> &SharedGrid {
        &self.grid
    }

    /// Whole cluster contents, from cache when possible
    pub fn cluster(&self, loc: ClusterLocation) -> Result<Arc<[u8]>> {
        if let Some(hit) = self.cache.lock().get(&loc) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(hit));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let start = self.geometry.stream_offset(loc)?;
        let grid = self.grid.read();
        let bytes: Arc<[u8]> = grid.read_stream(start, CLUSTER_SIZE)?.into();
        self.cache.lock().put(loc, Arc::clone(&bytes));
        Ok(bytes)
    }

    /// Read `len` bytes at `offset` within one cluster
    pub fn read_cluster(&self, loc: ClusterLocation, offset: usize, len: usize) -> Result<Vec<u8>> {
        if offset.checked_add(len).map_or(true, |end| end > CLUSTER_SIZE) {
            return Err(PixelMapError::InvalidArgument(format!(
                "cluster range {}+{} exceeds {} bytes",
                offset, len, CLUSTER_SIZE
            )));
        }
        let cluster = self.cluster(loc)?;
        Ok(cluster[offset..offset + len].to_vec())
    }

    /// Write `data` at `offset` within one cluster and drop any cached copy
    pub fn write_cluster(&self, loc: ClusterLocation, data: &[u8], offset: usize) -> Result<()> {
        if offset
            .checked_add(data.len())
            .map_or(true, |end| end > CLUSTER_SIZE)
        {
            return Err(PixelMapError::InvalidArgument(format!(
                "cluster range {}+{} exceeds {} bytes",
                offset,
                data.len(),
                CLUSTER_SIZE
            )));
        }
        let start = self.geometry.stream_offset(loc)?;

        let mut grid = self.grid.write();
        grid.write_stream(start + offset as u64, data)?;
        self.cache.lock().pop(&loc);
        Ok(())
    }

    /// Clear a cluster to zeros
    pub fn zero_cluster(&self, loc: ClusterLocation) -> Result<()> {
        self.write_cluster(loc, &[0u8; CLUSTER_SIZE], 0)
    }

    /// Legacy flat read: no chain, just an offset into the stream
    pub fn read_linear(&self, extent: &LegacyExtent, offset: u64, len: usize) -> Result<Vec<u8>> {
        if offset >= extent.size {
            return Ok(Vec::new());
        }
        let grid = self.grid.read();
        let start = extent.start.saturating_add(offset);
        let end = extent
            .start
            .saturating_add(extent.size)
            .min(start.saturating_add(len as u64))
            .min(grid.stream_len());
        if start >= end {
            return Ok(Vec::new());
        }
        grid.read_stream(start, (end - start) as usize)
    }

    /// Raw stream read, bypassing the cache
    pub fn read_stream(&self, start: u64, len: usize) -> Result<Vec<u8>> {
        self.grid.read().read_stream(start, len)
    }

    /// Raw stream write; invalidates every cluster it touches
    pub fn write_stream(&self, start: u64, data: &[u8]) -> Result<()> {
        let mut grid = self.grid.write();
        grid.write_stream(start, data)?;

        if !data.is_empty() {
            let first = start / CLUSTER_SIZE as u64;
            let last = (start + data.len() as u64 - 1) / CLUSTER_SIZE as u64;
            let mut cache = self.cache.lock();
            for index in first..=last.min(self.geometry.total_clusters() - 1) {
                if let Ok(loc) = self.geometry.location(index) {
                    cache.pop(&loc);
                }
            }
        }
        Ok(())
    }

    pub fn invalidate(&self, loc: ClusterLocation) {
        self.cache.lock().pop(&loc);
    }

    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    pub fn cache_stats(&self) -> CacheStats {
        let cache = self.cache.lock();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: cache.len(),
            capacity: cache.cap().get(),
        }
    }
}
