//! Visual Allocation Table
//!
//! Maps file paths to ordered cluster chains. The VAT is the only owner of
//! chain identity: it allocates clusters (through a [`ClusterAllocator`]),
//! frees them, and renames chains in place. It also fixes the map center
//! every zone distance is measured from.

use crate::allocator::{build_allocator, AllocationStrategy, ClusterAllocator};
use crate::cluster_store::{ClusterGeometry, ClusterLocation};
use crate::error::{PixelMapError, Result};
use crate::superblock::CLUSTER_SIZE;
use std::collections::BTreeMap;
use std::ops::Range;
use tracing::debug;

/// Strip leading and trailing separators: "/docs/a.txt/" -> "docs/a.txt"
pub fn normalize_path(path: &str) -> &str {
    path.trim_matches('/')
}

pub struct VisualAllocationTable {
    geometry: ClusterGeometry,
    center: (u32, u32),
    strategy: AllocationStrategy,
    entries: BTreeMap<String, Vec<ClusterLocation>>,
    allocator: Box<dyn ClusterAllocator>,
}

impl VisualAllocationTable {
    pub fn new(geometry: ClusterGeometry, center: (u32, u32), strategy: AllocationStrategy) -> Self {
        let distance = |index: u64| match geometry.location(index) {
            Ok(loc) => euclidean(loc, center),
            Err(_) => f64::INFINITY,
        };
        let allocator = build_allocator(strategy, geometry.total_clusters() as usize, distance);

        VisualAllocationTable {
            geometry,
            center,
            strategy,
            entries: BTreeMap::new(),
            allocator,
        }
    }

    /// Table centered on the grid midpoint
    pub fn with_default_center(geometry: ClusterGeometry, strategy: AllocationStrategy) -> Self {
        let mid = geometry.grid_size() / 2;
        Self::new(geometry, (mid, mid), strategy)
    }

    pub fn geometry(&self) -> &ClusterGeometry {
        &self.geometry
    }

    pub fn center(&self) -> (u32, u32) {
        self.center
    }

    pub fn strategy(&self) -> AllocationStrategy {
        self.strategy
    }

    /// Mark clusters (superblock, VAT region) as permanently in use
    pub fn reserve(&mut self, clusters: Range<u64>) -> Result<()> {
        for cluster in clusters {
            self.allocator.reserve(cluster)?;
        }
        Ok(())
    }

    pub fn lookup(&self, path: &str) -> Option<&[ClusterLocation]> {
        self.entries.get(normalize_path(path)).map(Vec::as_slice)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(normalize_path(path))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<ClusterLocation>)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append enough clusters to cover `grow_by_bytes` more bytes
    ///
    /// A new path always receives at least one cluster. Returns the newly
    /// appended locations; on `NoSpace` nothing changes.
    pub fn allocate_sequential(
        &mut self,
        path: &str,
        grow_by_bytes: u64,
    ) -> Result<Vec<ClusterLocation>> {
        let key = normalize_path(path);
        let mut count = grow_by_bytes.div_ceil(CLUSTER_SIZE as u64) as usize;
        if count == 0 && !self.entries.contains_key(key) {
            count = 1;
        }
        if count == 0 {
            return Ok(Vec::new());
        }

        let indices = self.allocator.allocate(count)?;
        let mut locations = Vec::with_capacity(indices.len());
        for &index in &indices {
            match self.geometry.location(index) {
                Ok(loc) => locations.push(loc),
                Err(e) => {
                    self.allocator.free(&indices)?;
                    return Err(e);
                }
            }
        }

        debug!("Allocated {} clusters for {}", locations.len(), key);
        self.entries
            .entry(key.to_string())
            .or_default()
            .extend_from_slice(&locations);
        Ok(locations)
    }

    /// Keep the first `keep` clusters (at least one); returns the freed tail
    pub fn shrink(&mut self, path: &str, keep: usize) -> Result<Vec<ClusterLocation>> {
        let key = normalize_path(path);
        let chain = self
            .entries
            .get_mut(key)
            .ok_or_else(|| PixelMapError::NotFound(key.to_string()))?;

        let keep = keep.max(1);
        if chain.len() <= keep {
            return Ok(Vec::new());
        }
        let freed = chain.split_off(keep);
        self.release(&freed)?;
        Ok(freed)
    }

    /// Drop the entry and free its chain
    pub fn remove(&mut self, path: &str) -> Result<Vec<ClusterLocation>> {
        let key = normalize_path(path);
        let chain = self
            .entries
            .remove(key)
            .ok_or_else(|| PixelMapError::NotFound(key.to_string()))?;
        self.release(&chain)?;
        Ok(chain)
    }

    /// Move a chain to a new key
    pub fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        let (old, new) = (normalize_path(old), normalize_path(new));
        if !self.entries.contains_key(old) {
            return Err(PixelMapError::NotFound(old.to_string()));
        }
        if self.entries.contains_key(new) {
            return Err(PixelMapError::AlreadyExists(new.to_string()));
        }
        if let Some(chain) = self.entries.remove(old) {
            self.entries.insert(new.to_string(), chain);
        }
        Ok(())
    }

    /// Install a chain loaded from disk
    ///
    /// Locations that are not cluster starts are kept as-is and surface as
    /// broken hops on read. A cluster already owned by another chain is an
    /// error and leaves the table unchanged.
    pub fn insert_chain(&mut self, path: &str, chain: Vec<ClusterLocation>) -> Result<()> {
        let key = normalize_path(path);
        if chain.is_empty() {
            return Err(PixelMapError::CorruptMetadata(format!("empty chain for {}", key)));
        }
        if self.entries.contains_key(key) {
            return Err(PixelMapError::AlreadyExists(key.to_string()));
        }

        let mut claimed = Vec::new();
        for loc in &chain {
            let Some(index) = self.geometry.index(*loc) else {
                continue;
            };
            if !self.allocator.reserve(index)? {
                self.allocator.free(&claimed)?;
                return Err(PixelMapError::CorruptMetadata(format!(
                    "cluster ({}, {}) of {} is already in use",
                    loc.x, loc.y, key
                )));
            }
            claimed.push(index);
        }

        self.entries.insert(key.to_string(), chain);
        Ok(())
    }

    fn release(&mut self, chain: &[ClusterLocation]) -> Result<()> {
        let indices: Vec<u64> = chain
            .iter()
            .filter_map(|loc| self.geometry.index(*loc))
            .collect();
        self.allocator.free(&indices)
    }

    pub fn distance_from_center(&self, loc: ClusterLocation) -> f64 {
        euclidean(loc, self.center)
    }

    /// Sum of chain lengths
    pub fn used_clusters(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn free_clusters(&self) -> usize {
        self.allocator.free_clusters()
    }

    pub fn total_clusters(&self) -> usize {
        self.allocator.total_clusters()
    }

    pub fn fragmentation_score(&self) -> f64 {
        self.allocator.fragmentation_score()
    }

    /// Chains as stored in the VAT document
    pub fn chains(&self) -> BTreeMap<String, Vec<ClusterLocation>> {
        self.entries.clone()
    }
}

fn euclidean(loc: ClusterLocation, center: (u32, u32)) -> f64 {
    let dx = loc.x as f64 - center.0 as f64;
    let dy = loc.y as f64 - center.1 as f64;
    (dx * dx + dy * dy).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vat(grid_size: u32) -> VisualAllocationTable {
        let geometry = ClusterGeometry::new(grid_size).unwrap();
        VisualAllocationTable::with_default_center(geometry, AllocationStrategy::Sequential)
    }

    #[test]
    fn test_allocate_new_path_gets_one_cluster() {
        let mut vat = vat(128);
        let clusters = vat.allocate_sequential("/a.txt", 0).unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(vat.lookup("a.txt").unwrap(), clusters.as_slice());
        assert!(vat.allocate_sequential("a.txt", 0).unwrap().is_empty());
    }

    #[test]
    fn test_allocate_rounds_up() {
        let mut vat = vat(128);
        assert_eq!(vat.allocate_sequential("f", 10000).unwrap().len(), 3);
        assert_eq!(vat.allocate_sequential("f", 1).unwrap().len(), 1);
        assert_eq!(vat.lookup("f").unwrap().len(), 4);
    }

    #[test]
    fn test_never_reuses_clusters() {
        let mut vat = vat(128);
        vat.reserve(0..2).unwrap();
        let a = vat.allocate_sequential("a", 8192).unwrap();
        let b = vat.allocate_sequential("b", 8192).unwrap();
        assert!(a.iter().all(|loc| !b.contains(loc)));
        assert_eq!(vat.geometry().index(a[0]), Some(2));

        vat.remove("a").unwrap();
        let c = vat.allocate_sequential("c", 4096).unwrap();
        assert_eq!(c[0], a[0]);
    }

    #[test]
    fn test_no_space() {
        let mut vat = vat(64);
        vat.allocate_sequential("a", 3 * 4096).unwrap();
        let result = vat.allocate_sequential("b", 2 * 4096);
        assert!(matches!(result, Err(PixelMapError::NoSpace { .. })));
        assert!(!vat.contains("b"));
        assert_eq!(vat.free_clusters(), 1);
    }

    #[test]
    fn test_rename_semantics() {
        let mut vat = vat(128);
        vat.allocate_sequential("a", 1).unwrap();
        vat.allocate_sequential("b", 1).unwrap();

        assert!(matches!(
            vat.rename("a", "b"),
            Err(PixelMapError::AlreadyExists(_))
        ));
        assert!(matches!(
            vat.rename("missing", "c"),
            Err(PixelMapError::NotFound(_))
        ));

        let chain = vat.lookup("a").unwrap().to_vec();
        vat.rename("/a", "/c").unwrap();
        assert!(vat.lookup("a").is_none());
        assert_eq!(vat.lookup("c").unwrap(), chain.as_slice());
    }

    #[test]
    fn test_shrink_keeps_one() {
        let mut vat = vat(128);
        vat.allocate_sequential("f", 5 * 4096).unwrap();
        let before = vat.free_clusters();

        let freed = vat.shrink("f", 0).unwrap();
        assert_eq!(freed.len(), 4);
        assert_eq!(vat.lookup("f").unwrap().len(), 1);
        assert_eq!(vat.free_clusters(), before + 4);
    }

    #[test]
    fn test_insert_chain_conflict() {
        let mut vat = vat(128);
        let owned = vat.allocate_sequential("a", 1).unwrap();
        let result = vat.insert_chain("b", owned.clone());
        assert!(matches!(result, Err(PixelMapError::CorruptMetadata(_))));

        // Misaligned locations are tolerated
        vat.insert_chain("c", vec![ClusterLocation::new(1, 1)]).unwrap();
        assert!(vat.contains("c"));
    }

    #[test]
    fn test_distance_from_center() {
        let vat = vat(128);
        assert_eq!(vat.center(), (64, 64));
        assert_eq!(vat.distance_from_center(ClusterLocation::new(64, 64)), 0.0);
        assert_eq!(vat.distance_from_center(ClusterLocation::new(67, 68)), 5.0);
    }

    #[test]
    fn test_center_out_strategy() {
        let geometry = ClusterGeometry::new(256).unwrap();
        let mut vat = VisualAllocationTable::with_default_center(
            geometry,
            AllocationStrategy::CenterOut,
        );
        let first = vat.allocate_sequential("a", 1).unwrap()[0];
        let dist = vat.distance_from_center(first);

        for index in 0..geometry.total_clusters() {
            let loc = geometry.location(index).unwrap();
            assert!(vat.distance_from_center(loc) >= dist);
        }
    }
}
