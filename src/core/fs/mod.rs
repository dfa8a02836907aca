//! POSIX-style filesystem over the pixel map
//!
//! [`PixelMapFs`] ties the pieces together: the VAT decides which clusters
//! belong to a path, the cluster store moves bytes in and out of the pixel
//! arena, and the predictor, prefetcher and compression engine observe and
//! reshape traffic.
//!
//! Locking: the filesystem state (VAT, attributes, legacy table) sits behind
//! one reader-writer lock. Every other lock is a leaf taken after it: the
//! grid and cluster cache (inside the store), the compression engine, the
//! predictor (then the prefetcher, when both are needed), the handle table
//! and the access counters. Mutations bump the write generation while still
//! holding the state write lock.

pub mod handles;
pub mod worker;

pub use handles::{HandleTable, OpenFile};
pub use worker::{PrefetchCommand, PrefetchWorker};

use crate::cluster_store::{CacheStats, ClusterLocation, ClusterStore};
use crate::compression::{
    decode_frame_limited, CompressionEngine, CompressionStats, CompressionTable,
};
use crate::config::MountConfig;
use crate::error::{PixelMapError, Result};
use crate::grid::{PixelGrid, SharedGrid};
use crate::layout::{
    access_log_path, fresh_vat, load_layout, persist_layout, FileAttributes, LayoutSource,
    LegacyExtent, LegacyTable, MountedLayout, VatDocument, DEFAULT_FILE_MODE, VAT_FORMAT,
    VAT_VERSION,
};
use crate::predictor::{AccessPredictor, HistoryDocument, PredictorStats};
use crate::prefetch::{PrefetchStats, Prefetcher};
use crate::superblock::{Superblock, CLUSTER_SIZE};
use crate::unix_now;
use crate::vat::{normalize_path, VisualAllocationTable};
use crate::zone::{Zone, ZoneClassifier};
use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, warn};

static ZEROS: [u8; CLUSTER_SIZE] = [0u8; CLUSTER_SIZE];

const DIRECTORY_MODE: u32 = 0o755;
const LEGACY_FILE_MODE: u32 = 0o444;

/// Hilbert locality pairs sampled for [`FsStats`]
const LOCALITY_SAMPLES: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FileKind {
    File,
    Directory,
}

/// Attributes of one path, joined from the VAT and the attribute table
#[derive(Debug, Clone, PartialEq)]
pub struct FileInfo {
    pub name: String,
    pub kind: FileKind,
    pub size: u64,
    pub mode: u32,
    pub mtime: u64,
    pub first_cluster: Option<ClusterLocation>,
    pub chain: Vec<ClusterLocation>,
    pub zone: Option<Zone>,
    pub compressed: bool,
    pub legacy: bool,
}

impl FileInfo {
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    fn directory(name: &str) -> Self {
        FileInfo {
            name: name.to_string(),
            kind: FileKind::Directory,
            size: 0,
            mode: DIRECTORY_MODE,
            mtime: 0,
            first_cluster: None,
            chain: Vec::new(),
            zone: None,
            compressed: false,
            legacy: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileKind,
}

/// Capacity report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub files: usize,
    pub cluster_size: usize,
    pub total_clusters: usize,
    pub free_clusters: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FsStats {
    pub reads: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub fragmented_reads: u64,
    pub chain_hops: u64,
    pub broken_chains: u64,
    pub prefetch_hits: u64,
    pub open_handles: usize,
    pub cache: CacheStats,
    pub prefetch: PrefetchStats,
    pub compression: CompressionStats,
    pub predictor: PredictorStats,
    pub fragmentation: f64,
    pub hilbert_locality: f64,
}

#[derive(Default)]
struct FsCounters {
    reads: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    fragmented_reads: AtomicU64,
    chain_hops: AtomicU64,
    broken_chains: AtomicU64,
    prefetch_hits: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

/// How a path's bytes are located, resolved once per operation
enum AddressMode<'a> {
    Chained {
        chain: &'a [ClusterLocation],
        size: u64,
    },
    Linear(&'a LegacyExtent),
}

struct FsState {
    vat: VisualAllocationTable,
    attributes: BTreeMap<String, FileAttributes>,
    legacy: LegacyTable,
    source: LayoutSource,
}

impl FsState {
    fn resolve(&self, key: &str) -> Option<AddressMode<'_>> {
        if let Some(chain) = self.vat.lookup(key) {
            return Some(AddressMode::Chained {
                chain,
                size: self.size_of(key, chain.len()),
            });
        }
        self.legacy.get(key).map(AddressMode::Linear)
    }

    /// Recorded size, or the full chain when no attributes exist
    fn size_of(&self, key: &str, chain_len: usize) -> u64 {
        self.attributes
            .get(key)
            .map_or((chain_len * CLUSTER_SIZE) as u64, |a| a.size)
    }

    fn is_dir(&self, key: &str) -> bool {
        if key.is_empty() {
            return true;
        }
        let prefix = format!("{}/", key);
        self.vat.iter().any(|(name, _)| name.starts_with(&prefix))
            || self.legacy.iter().any(|e| e.name.starts_with(&prefix))
    }

    fn missing(&self, key: &str) -> PixelMapError {
        if self.is_dir(key) {
            PixelMapError::IsADirectory(display(key))
        } else {
            PixelMapError::NotFound(display(key))
        }
    }
}

fn display(key: &str) -> String {
    format!("/{}", key)
}

/// Bytes `[offset, offset + size)` of `data`, clamped to its length
fn slice_window(data: &[u8], offset: u64, size: usize) -> Vec<u8> {
    let start = (offset.min(data.len() as u64)) as usize;
    let end = start.saturating_add(size).min(data.len());
    data[start..end].to_vec()
}

pub struct PixelMapFs {
    config: MountConfig,
    image_path: Option<PathBuf>,
    store: ClusterStore,
    zones: ZoneClassifier,
    state: RwLock<FsState>,
    compression: Mutex<CompressionEngine>,
    predictor: Mutex<AccessPredictor>,
    prefetcher: Mutex<Prefetcher>,
    handles: Mutex<HandleTable>,
    access_counts: Mutex<AHashMap<String, u64>>,
    counters: FsCounters,
    dirty: AtomicBool,
    generation: AtomicU64,
}

impl std::fmt::Debug for PixelMapFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PixelMapFs")
            .field("config", &self.config)
            .field("image_path", &self.image_path)
            .finish_non_exhaustive()
    }
}

impl PixelMapFs {
    /// Format a blank in-memory image
    pub fn format(grid_size: u32, config: MountConfig) -> Result<Self> {
        let grid = PixelGrid::new(grid_size)?;
        let geometry = crate::cluster_store::ClusterGeometry::new(grid_size)?;
        let reserved = Superblock::new(grid_size, (grid_size / 2, grid_size / 2)).reserved_clusters();
        if geometry.total_clusters() <= reserved.end {
            return Err(PixelMapError::InvalidGrid(format!(
                "{}x{} grid has no room for data after {} reserved clusters",
                grid_size, grid_size, reserved.end
            )));
        }

        let layout = MountedLayout {
            source: LayoutSource::Embedded,
            vat: fresh_vat(geometry, config.allocation)?,
            attributes: BTreeMap::new(),
            compressed: BTreeMap::new(),
            legacy: LegacyTable::default(),
        };
        info!("Formatted {}x{} image", grid_size, grid_size);
        Self::from_parts(grid, layout, config, None, true)
    }

    /// Format a blank image and write it to `path`
    pub fn create_image<P: AsRef<Path>>(path: P, grid_size: u32, config: MountConfig) -> Result<Self> {
        let mut fs = Self::format(grid_size, config)?;
        fs.image_path = Some(path.as_ref().to_path_buf());
        fs.persist()?;
        Ok(fs)
    }

    /// Mount an image file
    pub fn mount<P: AsRef<Path>>(path: P, config: MountConfig) -> Result<Self> {
        let path = path.as_ref();
        config.validate()?;
        let grid = PixelGrid::load_png(path)?;
        let layout = load_layout(&grid, Some(path), config.allocation)?;
        info!("Mounted {:?} ({:?} layout)", path, layout.source);
        Self::from_parts(grid, layout, config, Some(path.to_path_buf()), false)
    }

    /// Mount an in-memory grid
    pub fn mount_grid(grid: PixelGrid, config: MountConfig) -> Result<Self> {
        config.validate()?;
        let layout = load_layout(&grid, None, config.allocation)?;
        Self::from_parts(grid, layout, config, None, false)
    }

    fn from_parts(
        grid: PixelGrid,
        layout: MountedLayout,
        config: MountConfig,
        image_path: Option<PathBuf>,
        dirty: bool,
    ) -> Result<Self> {
        config.validate()?;
        let zones = ZoneClassifier::new(config.zones);
        let store = ClusterStore::new(grid.into_shared(), config.cache_size_bytes)?;

        let mut compression = CompressionEngine::new(&config.compression, zones.cold_threshold());
        for (path, metadata) in layout.compressed {
            compression.restore(&path, metadata);
        }

        Ok(PixelMapFs {
            image_path,
            store,
            zones,
            state: RwLock::new(FsState {
                vat: layout.vat,
                attributes: layout.attributes,
                legacy: layout.legacy,
                source: layout.source,
            }),
            compression: Mutex::new(compression),
            predictor: Mutex::new(AccessPredictor::new(config.history_size)),
            prefetcher: Mutex::new(Prefetcher::new(
                config.prefetch.cache_size_bytes,
                config.prefetch.window_secs,
            )),
            handles: Mutex::new(HandleTable::new()),
            access_counts: Mutex::new(AHashMap::new()),
            counters: FsCounters::default(),
            dirty: AtomicBool::new(dirty),
            generation: AtomicU64::new(0),
            config,
        })
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    pub fn image_path(&self) -> Option<&Path> {
        self.image_path.as_deref()
    }

    pub fn grid(&self) -> &SharedGrid {
        self.store.grid()
    }

    pub fn layout_source(&self) -> LayoutSource {
        self.state.read().source
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Call with the state write lock held
    fn mark_dirty(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.dirty.store(true, Ordering::SeqCst);
    }

    fn ensure_writable(&self, state: &FsState, key: &str) -> Result<()> {
        if !self.config.read_write {
            return Err(PixelMapError::ReadOnly(format!(
                "{} (mounted read-only)",
                display(key)
            )));
        }
        if !state.legacy.is_empty() {
            return Err(PixelMapError::ReadOnly(format!(
                "{} (v1 image, migrate it first)",
                display(key)
            )));
        }
        Ok(())
    }

    pub fn getattr(&self, path: &str) -> Result<FileInfo> {
        let key = normalize_path(path);
        let state = self.state.read();

        match state.resolve(key) {
            Some(AddressMode::Chained { chain, size }) => {
                let attrs = state.attributes.get(key).copied().unwrap_or_default();
                let first_cluster = chain.first().copied();
                Ok(FileInfo {
                    name: key.to_string(),
                    kind: FileKind::File,
                    size,
                    mode: attrs.mode,
                    mtime: attrs.mtime,
                    first_cluster,
                    chain: chain.to_vec(),
                    zone: first_cluster
                        .map(|loc| self.zones.classify(state.vat.distance_from_center(loc))),
                    compressed: self.compression.lock().is_compressed(key),
                    legacy: false,
                })
            }
            Some(AddressMode::Linear(extent)) => Ok(FileInfo {
                name: key.to_string(),
                kind: FileKind::File,
                size: extent.size,
                mode: LEGACY_FILE_MODE,
                mtime: 0,
                first_cluster: None,
                chain: Vec::new(),
                zone: None,
                compressed: false,
                legacy: true,
            }),
            None if state.is_dir(key) => Ok(FileInfo::directory(key)),
            None => Err(PixelMapError::NotFound(display(key))),
        }
    }

    /// Zone of a file's first cluster
    pub fn zone_of(&self, path: &str) -> Result<Zone> {
        let info = self.getattr(path)?;
        info.zone
            .ok_or_else(|| PixelMapError::InvalidArgument(format!("{} has no cluster chain", display(&info.name))))
    }

    /// Immediate children of a directory, with `.` and `..` first
    pub fn readdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let key = normalize_path(path);
        let state = self.state.read();
        if !key.is_empty() && state.resolve(key).is_some() {
            return Err(PixelMapError::NotADirectory(display(key)));
        }

        let prefix = if key.is_empty() {
            String::new()
        } else {
            format!("{}/", key)
        };

        let mut children: BTreeMap<String, FileKind> = BTreeMap::new();
        let names = state
            .vat
            .iter()
            .map(|(name, _)| name.as_str())
            .chain(state.legacy.iter().map(|e| e.name.as_str()));
        for name in names {
            let Some(rest) = name.strip_prefix(prefix.as_str()) else {
                continue;
            };
            match rest.split_once('/') {
                Some((dir, _)) => {
                    children.insert(dir.to_string(), FileKind::Directory);
                }
                None => {
                    children.entry(rest.to_string()).or_insert(FileKind::File);
                }
            }
        }

        if !key.is_empty() && children.is_empty() {
            return Err(PixelMapError::NotFound(display(key)));
        }

        let mut entries = vec![
            DirEntry {
                name: ".".to_string(),
                kind: FileKind::Directory,
            },
            DirEntry {
                name: "..".to_string(),
                kind: FileKind::Directory,
            },
        ];
        entries.extend(
            children
                .into_iter()
                .map(|(name, kind)| DirEntry { name, kind }),
        );
        Ok(entries)
    }

    pub fn open(&self, path: &str, writable: bool) -> Result<u64> {
        let key = normalize_path(path);
        {
            let state = self.state.read();
            if state.resolve(key).is_none() {
                return Err(state.missing(key));
            }
            if writable {
                self.ensure_writable(&state, key)?;
            }
        }
        let fh = self.handles.lock().open(key, writable);
        debug!("Opened {} as handle {}", display(key), fh);
        Ok(fh)
    }

    pub fn release(&self, fh: u64) -> Result<()> {
        self.handles.lock().release(fh).map(|_| ())
    }

    /// Path behind an open handle
    pub fn handle_path(&self, fh: u64) -> Result<String> {
        Ok(self.handles.lock().get(fh)?.path.clone())
    }

    pub fn refcount(&self, path: &str) -> usize {
        self.handles.lock().refcount(normalize_path(path))
    }

    /// Read up to `size` bytes at `offset`
    ///
    /// A chain that ends early or hits an unreadable cluster yields the
    /// bytes collected before the break. It only fails if nothing at all
    /// could be read.
    pub fn read(&self, path: &str, size: usize, offset: u64) -> Result<Vec<u8>> {
        let key = normalize_path(path);

        let cached = self.prefetcher.lock().get(key);
        let data = match cached {
            Some(whole) => {
                bump(&self.counters.prefetch_hits, 1);
                slice_window(&whole, offset, size)
            }
            None => {
                let state = self.state.read();
                self.read_locked(&state, key, offset, size)?
            }
        };

        bump(&self.counters.reads, 1);
        bump(&self.counters.bytes_read, data.len() as u64);
        self.predictor.lock().record_access(key, unix_now());
        *self.access_counts.lock().entry(key.to_string()).or_insert(0) += 1;
        Ok(data)
    }

    fn read_locked(&self, state: &FsState, key: &str, offset: u64, size: usize) -> Result<Vec<u8>> {
        match state.resolve(key) {
            Some(AddressMode::Chained { chain, size: file_size }) => {
                if self.compression.lock().is_compressed(key) {
                    self.read_compressed(key, chain, offset, size)
                } else {
                    self.read_chained(key, chain, file_size, offset, size)
                }
            }
            Some(AddressMode::Linear(extent)) => self.store.read_linear(extent, offset, size),
            None => Err(state.missing(key)),
        }
    }

    fn read_chained(
        &self,
        key: &str,
        chain: &[ClusterLocation],
        file_size: u64,
        offset: u64,
        size: usize,
    ) -> Result<Vec<u8>> {
        if offset >= file_size || size == 0 {
            return Ok(Vec::new());
        }
        let end = file_size.min(offset.saturating_add(size as u64));
        let cluster_size = CLUSTER_SIZE as u64;
        let first = offset / cluster_size;
        let last = (end - 1) / cluster_size;
        if last > first {
            bump(&self.counters.fragmented_reads, 1);
        }

        let mut out = Vec::with_capacity((end - offset) as usize);
        let mut broken_at = None;
        for hop in first..=last {
            let Some(&loc) = chain.get(hop as usize) else {
                broken_at = Some(hop as usize);
                break;
            };
            let base = hop * cluster_size;
            let lo = (offset.max(base) - base) as usize;
            let hi = (end.min(base + cluster_size) - base) as usize;
            match self.store.read_cluster(loc, lo, hi - lo) {
                Ok(bytes) => out.extend_from_slice(&bytes),
                Err(PixelMapError::OutOfBounds(_)) => {
                    broken_at = Some(hop as usize);
                    break;
                }
                Err(e) => return Err(e),
            }
            bump(&self.counters.chain_hops, 1);
        }

        if let Some(hop) = broken_at {
            bump(&self.counters.broken_chains, 1);
            warn!(
                "Broken chain for {} at hop {}, returning {} bytes",
                display(key),
                hop,
                out.len()
            );
            if out.is_empty() {
                return Err(PixelMapError::BrokenChain {
                    path: display(key),
                    hop,
                });
            }
        }
        Ok(out)
    }

    fn read_compressed(
        &self,
        key: &str,
        chain: &[ClusterLocation],
        offset: u64,
        size: usize,
    ) -> Result<Vec<u8>> {
        let (buffered, frame_len, original_len) = {
            let engine = self.compression.lock();
            let (frame_len, original_len) = engine
                .metadata(key)
                .map_or((0, 0), |m| (m.compressed_size, m.original_size));
            (engine.buffer(key).map(<[u8]>::to_vec), frame_len, original_len)
        };
        let frame = match buffered {
            Some(frame) => frame,
            None => self.read_chained(key, chain, frame_len, 0, frame_len as usize)?,
        };
        let limit = usize::try_from(original_len).unwrap_or(usize::MAX);
        let data = decode_frame_limited(&frame, limit)?;
        Ok(slice_window(&data, offset, size))
    }

    /// Create an empty file
    pub fn create(&self, path: &str, mode: u32) -> Result<()> {
        let key = normalize_path(path);
        let mut state = self.state.write();
        self.ensure_writable(&state, key)?;
        self.create_locked(&mut state, key, mode)?;
        self.mark_dirty();
        debug!("Created {}", display(key));
        Ok(())
    }

    fn create_locked(&self, state: &mut FsState, key: &str, mode: u32) -> Result<()> {
        if key.is_empty()
            || state.vat.contains(key)
            || state.legacy.get(key).is_some()
            || state.is_dir(key)
        {
            return Err(PixelMapError::AlreadyExists(display(key)));
        }
        for (idx, _) in key.match_indices('/') {
            let parent = &key[..idx];
            if state.resolve(parent).is_some() {
                return Err(PixelMapError::NotADirectory(display(parent)));
            }
        }

        for loc in state.vat.allocate_sequential(key, 0)? {
            self.store.zero_cluster(loc)?;
        }
        state
            .attributes
            .insert(key.to_string(), FileAttributes::new(mode));
        self.compression.lock().forget(key);
        Ok(())
    }

    /// Write `data` at `offset`, creating and growing the file as needed
    pub fn write(&self, path: &str, data: &[u8], offset: u64) -> Result<usize> {
        let key = normalize_path(path);
        let mut state = self.state.write();
        self.ensure_writable(&state, key)?;

        if !state.vat.contains(key) {
            if state.is_dir(key) {
                return Err(PixelMapError::IsADirectory(display(key)));
            }
            self.create_locked(&mut state, key, DEFAULT_FILE_MODE)?;
        }
        if self.compression.lock().is_compressed(key) {
            self.inflate_locked(&mut state, key)?;
        }

        self.write_locked(&mut state, key, data, offset)?;

        let end = offset + data.len() as u64;
        let attrs = state.attributes.entry(key.to_string()).or_default();
        attrs.size = attrs.size.max(end);
        attrs.touch();

        self.mark_dirty();
        drop(state);

        self.prefetcher.lock().invalidate(key);
        bump(&self.counters.bytes_written, data.len() as u64);
        Ok(data.len())
    }

    /// Grow the chain to cover `offset + data.len()` and write through it
    fn write_locked(&self, state: &mut FsState, key: &str, data: &[u8], offset: u64) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let end = offset.checked_add(data.len() as u64).ok_or_else(|| {
            PixelMapError::InvalidArgument(format!("write past end of address space at {}", offset))
        })?;
        self.ensure_clusters(state, key, end)?;

        let chain = state
            .vat
            .lookup(key)
            .ok_or_else(|| PixelMapError::NotFound(display(key)))?;

        let mut written = 0usize;
        while written < data.len() {
            let pos = offset + written as u64;
            let hop = (pos / CLUSTER_SIZE as u64) as usize;
            let within = (pos % CLUSTER_SIZE as u64) as usize;
            let n = (CLUSTER_SIZE - within).min(data.len() - written);

            let broken = || PixelMapError::BrokenChain {
                path: display(key),
                hop,
            };
            let loc = chain.get(hop).ok_or_else(broken)?;
            match self
                .store
                .write_cluster(*loc, &data[written..written + n], within)
            {
                Err(PixelMapError::OutOfBounds(_)) => return Err(broken()),
                other => other?,
            }
            written += n;
        }
        Ok(())
    }

    /// Append zeroed clusters until the chain covers `len` bytes
    fn ensure_clusters(&self, state: &mut FsState, key: &str, len: u64) -> Result<()> {
        let needed = (len.div_ceil(CLUSTER_SIZE as u64) as usize).max(1);
        let have = state.vat.lookup(key).map_or(0, <[_]>::len);
        if needed > have {
            let grow = ((needed - have) * CLUSTER_SIZE) as u64;
            for loc in state.vat.allocate_sequential(key, grow)? {
                self.store.zero_cluster(loc)?;
            }
        }
        Ok(())
    }

    /// Zero the last cluster from `size` to its end
    fn zero_tail(&self, state: &FsState, key: &str, size: u64) -> Result<()> {
        let Some(chain) = state.vat.lookup(key) else {
            return Ok(());
        };
        let cluster_size = CLUSTER_SIZE as u64;
        let hop = if size == 0 { 0 } else { (size - 1) / cluster_size };
        let within = (size - hop * cluster_size) as usize;
        if within < CLUSTER_SIZE {
            if let Some(&loc) = chain.get(hop as usize) {
                self.store
                    .write_cluster(loc, &ZEROS[..CLUSTER_SIZE - within], within)?;
            }
        }
        Ok(())
    }

    /// Rewrite a compressed file as plain clusters
    fn inflate_locked(&self, state: &mut FsState, key: &str) -> Result<()> {
        let chain = state
            .vat
            .lookup(key)
            .map(<[_]>::to_vec)
            .ok_or_else(|| PixelMapError::NotFound(display(key)))?;
        let data = self.read_compressed(key, &chain, 0, usize::MAX)?;

        self.write_locked(state, key, &data, 0)?;
        self.zero_tail(state, key, data.len() as u64)?;
        self.compression.lock().forget(key);
        debug!("Inflated {} ({} bytes)", display(key), data.len());
        Ok(())
    }

    pub fn truncate(&self, path: &str, new_size: u64) -> Result<()> {
        let key = normalize_path(path);
        let mut state = self.state.write();
        self.ensure_writable(&state, key)?;
        if !state.vat.contains(key) {
            return Err(state.missing(key));
        }
        if self.compression.lock().is_compressed(key) {
            self.inflate_locked(&mut state, key)?;
        }

        let chain_len = state.vat.lookup(key).map_or(0, <[_]>::len);
        let old_size = state.size_of(key, chain_len);
        if new_size > old_size {
            self.ensure_clusters(&mut state, key, new_size)?;
        } else {
            let keep = (new_size.div_ceil(CLUSTER_SIZE as u64) as usize).max(1);
            for loc in state.vat.shrink(key, keep)? {
                self.store.invalidate(loc);
            }
            self.zero_tail(&state, key, new_size)?;
        }

        let attrs = state.attributes.entry(key.to_string()).or_default();
        attrs.size = new_size;
        attrs.touch();

        self.mark_dirty();
        drop(state);

        self.prefetcher.lock().invalidate(key);
        Ok(())
    }

    /// Remove a file and free its chain
    pub fn unlink(&self, path: &str) -> Result<()> {
        let key = normalize_path(path);
        let mut state = self.state.write();
        self.ensure_writable(&state, key)?;
        if !state.vat.contains(key) {
            return Err(state.missing(key));
        }

        for loc in state.vat.remove(key)? {
            self.store.invalidate(loc);
        }
        state.attributes.remove(key);
        self.compression.lock().forget(key);
        self.predictor.lock().forget(key);

        self.mark_dirty();
        drop(state);

        self.prefetcher.lock().invalidate(key);
        debug!("Unlinked {}", display(key));
        Ok(())
    }

    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        let (old, new) = (normalize_path(old), normalize_path(new));
        let mut state = self.state.write();
        self.ensure_writable(&state, old)?;
        if new.is_empty() {
            return Err(PixelMapError::InvalidArgument(
                "cannot rename onto the root directory".to_string(),
            ));
        }
        if !state.vat.contains(old) {
            return Err(state.missing(old));
        }
        if state.legacy.get(new).is_some() || state.is_dir(new) {
            return Err(PixelMapError::AlreadyExists(display(new)));
        }
        for (idx, _) in new.match_indices('/') {
            let parent = &new[..idx];
            if parent == old || state.resolve(parent).is_some() {
                return Err(PixelMapError::NotADirectory(display(parent)));
            }
        }

        state.vat.rename(old, new).map_err(|e| match e {
            PixelMapError::AlreadyExists(_) => PixelMapError::AlreadyExists(display(new)),
            PixelMapError::NotFound(_) => PixelMapError::NotFound(display(old)),
            other => other,
        })?;
        if let Some(attrs) = state.attributes.remove(old) {
            state.attributes.insert(new.to_string(), attrs);
        }
        self.compression.lock().rename(old, new);
        self.predictor.lock().rename(old, new);

        self.mark_dirty();
        drop(state);

        self.handles.lock().rename(old, new);
        let mut prefetcher = self.prefetcher.lock();
        prefetcher.invalidate(old);
        prefetcher.invalidate(new);
        debug!("Renamed {} -> {}", display(old), display(new));
        Ok(())
    }

    pub fn statfs(&self) -> StatFs {
        let state = self.state.read();
        let total_clusters = state.vat.total_clusters();
        let free_clusters = state.vat.free_clusters();
        StatFs {
            total_bytes: (total_clusters * CLUSTER_SIZE) as u64,
            used_bytes: (state.vat.used_clusters() * CLUSTER_SIZE) as u64,
            free_bytes: (free_clusters * CLUSTER_SIZE) as u64,
            files: state.vat.len() + state.legacy.len(),
            cluster_size: CLUSTER_SIZE,
            total_clusters,
            free_clusters,
        }
    }

    fn document(&self, state: &FsState) -> VatDocument {
        let center = state.vat.center();
        VatDocument {
            format: VAT_FORMAT.to_string(),
            version: VAT_VERSION.to_string(),
            grid_size: state.vat.geometry().grid_size(),
            center: [center.0, center.1],
            entries: state.vat.chains(),
            attributes: state.attributes.clone(),
            compressed: self.compression.lock().metadata_table(),
        }
    }

    fn persist(&self) -> Result<()> {
        let state = self.state.read();
        let doc = self.document(&state);
        let placement = persist_layout(&self.store, &doc, self.image_path.as_deref())?;
        if let Some(path) = &self.image_path {
            self.store.grid().read().save_png(path)?;
        }
        self.dirty.store(false, Ordering::SeqCst);
        info!(
            "Flushed {} entries ({:?} VAT)",
            doc.entries.len(),
            placement
        );
        Ok(())
    }

    /// Persist the superblock, VAT, and image if anything changed
    pub fn flush(&self) -> Result<()> {
        if !self.is_dirty() {
            return Ok(());
        }
        self.persist()
    }

    pub fn fsync(&self) -> Result<()> {
        self.flush()
    }

    /// Compress idle COLD files in place; returns how many were compressed
    pub fn compress_idle(&self, now: f64) -> Result<usize> {
        let mut state = self.state.write();
        self.ensure_writable(&state, "")?;

        let files: Vec<(String, f64, u64)> = state
            .vat
            .iter()
            .filter_map(|(path, chain)| {
                let first = chain.first()?;
                let mtime = state.attributes.get(path).map_or(0, |a| a.mtime);
                Some((path.clone(), state.vat.distance_from_center(*first), mtime))
            })
            .collect();

        let files: Vec<_> = {
            let handles = self.handles.lock();
            files
                .into_iter()
                .filter(|(path, _, _)| !handles.is_open(path))
                .collect()
        };
        let files: Vec<_> = {
            let predictor = self.predictor.lock();
            files
                .into_iter()
                .map(|(path, distance, mtime)| {
                    let last = predictor.last_access(&path).unwrap_or(mtime as f64);
                    (path, distance, now - last)
                })
                .collect()
        };
        let candidates: Vec<String> = {
            let engine = self.compression.lock();
            files
                .into_iter()
                .filter(|(path, distance, age)| {
                    !engine.is_compressed(path) && engine.should_compress(*distance, *age)
                })
                .map(|(path, _, _)| path)
                .collect()
        };

        let mut compressed = 0;
        for key in candidates {
            let Some(AddressMode::Chained { chain, size }) = state.resolve(&key) else {
                continue;
            };
            let data = self.read_chained(&key, chain, size, 0, size as usize)?;
            if (data.len() as u64) < size {
                continue;
            }

            let Some(frame) = self.compression.lock().compress(&key, &data)? else {
                continue;
            };
            self.write_locked(&mut state, &key, &frame, 0)?;
            let keep = frame.len().div_ceil(CLUSTER_SIZE);
            for loc in state.vat.shrink(&key, keep)? {
                self.store.invalidate(loc);
            }
            self.prefetcher.lock().invalidate(&key);
            compressed += 1;
        }

        if compressed > 0 {
            self.mark_dirty();
            info!("Compressed {} idle files", compressed);
        }
        Ok(compressed)
    }

    /// Move every v1 file into cluster chains; returns the file count
    pub fn migrate_legacy(&self) -> Result<usize> {
        let mut state = self.state.write();
        if !self.config.read_write {
            return Err(PixelMapError::ReadOnly(
                "migration needs a read-write mount".to_string(),
            ));
        }
        if state.legacy.is_empty() {
            return Ok(0);
        }

        // Everything is read before anything is written: new chains overlap the v1 layout
        let files = state
            .legacy
            .iter()
            .map(|extent| -> Result<(String, Vec<u8>)> {
                let data = self.store.read_linear(extent, 0, extent.size as usize)?;
                Ok((extent.name.clone(), data))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut vat = fresh_vat(*state.vat.geometry(), self.config.allocation)?;
        for (name, data) in &files {
            vat.allocate_sequential(name, data.len() as u64)?;
        }

        let mut attributes = BTreeMap::new();
        for (name, data) in &files {
            let chain = vat
                .lookup(name)
                .ok_or_else(|| PixelMapError::NotFound(display(name)))?;
            for (hop, loc) in chain.iter().enumerate() {
                let start = (hop * CLUSTER_SIZE).min(data.len());
                let end = (start + CLUSTER_SIZE).min(data.len());
                let mut cluster = vec![0u8; CLUSTER_SIZE];
                cluster[..end - start].copy_from_slice(&data[start..end]);
                self.store.write_cluster(*loc, &cluster, 0)?;
            }
            let mut attrs = FileAttributes::new(DEFAULT_FILE_MODE);
            attrs.size = data.len() as u64;
            attributes.insert(name.clone(), attrs);
        }

        state.vat = vat;
        state.attributes = attributes;
        state.legacy.clear();
        state.source = LayoutSource::Embedded;
        self.mark_dirty();
        drop(state);

        self.prefetcher.lock().clear();
        info!("Migrated {} v1 files into cluster chains", files.len());
        Ok(files.len())
    }

    /// One prefetch pass: forecast, load, and cache upcoming reads
    pub fn prefetch_tick(&self, now: f64) -> Result<usize> {
        let candidates = {
            let predictor = self.predictor.lock();
            self.prefetcher.lock().candidates(&*predictor, now)
        };
        if candidates.is_empty() {
            return Ok(0);
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let mut loaded = Vec::with_capacity(candidates.len());
        {
            let state = self.state.read();
            for (key, priority) in candidates {
                match self.read_locked(&state, &key, 0, usize::MAX) {
                    Ok(data) => loaded.push((key, data, priority)),
                    Err(e) => debug!("Prefetch of {} skipped: {}", display(&key), e),
                }
            }
        }

        let mut prefetcher = self.prefetcher.lock();
        // A write since loading may already have invalidated these paths
        if self.generation.load(Ordering::SeqCst) != generation {
            return Ok(0);
        }
        let mut scheduled = 0;
        for (key, data, priority) in loaded {
            if prefetcher.enqueue(&key, data, priority) {
                scheduled += 1;
            }
        }
        prefetcher.process_all();
        Ok(scheduled)
    }

    pub fn hot_files(&self, threshold: f64, now: f64) -> Vec<(String, f64)> {
        self.predictor.lock().get_hot_files(threshold, now)
    }

    pub fn export_access_history(&self) -> HistoryDocument {
        self.predictor.lock().export_history()
    }

    pub fn import_access_history(&self, doc: HistoryDocument) -> Result<usize> {
        self.predictor.lock().import_history(doc)
    }

    pub fn export_compression_table(&self) -> CompressionTable {
        self.compression.lock().export_table()
    }

    /// Read counts per path since mount
    pub fn access_counts(&self) -> BTreeMap<String, u64> {
        self.access_counts
            .lock()
            .iter()
            .map(|(path, count)| (path.clone(), *count))
            .collect()
    }

    pub fn stats(&self) -> FsStats {
        let fragmentation = self.state.read().vat.fragmentation_score();
        let curve = *self.store.geometry().curve();
        FsStats {
            reads: self.counters.reads.load(Ordering::Relaxed),
            bytes_read: self.counters.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.counters.bytes_written.load(Ordering::Relaxed),
            fragmented_reads: self.counters.fragmented_reads.load(Ordering::Relaxed),
            chain_hops: self.counters.chain_hops.load(Ordering::Relaxed),
            broken_chains: self.counters.broken_chains.load(Ordering::Relaxed),
            prefetch_hits: self.counters.prefetch_hits.load(Ordering::Relaxed),
            open_handles: self.handles.lock().len(),
            cache: self.store.cache_stats(),
            prefetch: self.prefetcher.lock().stats(),
            compression: self.compression.lock().statistics(),
            predictor: self.predictor.lock().statistics(),
            fragmentation,
            hilbert_locality: curve.locality_ratio(LOCALITY_SAMPLES),
        }
    }

    /// Unmount: flush pending changes and write the access log
    pub fn destroy(&self) -> Result<()> {
        if self.config.read_write {
            self.flush()?;
        }
        if let Some(path) = &self.image_path {
            let log = access_log_path(path);
            std::fs::write(&log, serde_json::to_vec_pretty(&self.access_counts())?)?;
            debug!("Wrote access log {:?}", log);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rw_fs() -> PixelMapFs {
        PixelMapFs::format(256, MountConfig::read_write()).unwrap()
    }

    #[test]
    fn test_create_write_read() {
        let fs = rw_fs();
        fs.create("/hello.txt", 0o600).unwrap();
        assert_eq!(fs.write("/hello.txt", b"hello world", 0).unwrap(), 11);
        assert_eq!(fs.read("/hello.txt", 100, 0).unwrap(), b"hello world");
        assert_eq!(fs.read("/hello.txt", 5, 6).unwrap(), b"world");

        let info = fs.getattr("/hello.txt").unwrap();
        assert_eq!(info.size, 11);
        assert_eq!(info.mode, 0o600);
        assert_eq!(info.chain.len(), 1);
    }

    #[test]
    fn test_create_existing() {
        let fs = rw_fs();
        fs.create("a", 0o644).unwrap();
        assert!(matches!(
            fs.create("/a", 0o644),
            Err(PixelMapError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_write_spanning_clusters() {
        let fs = rw_fs();
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        fs.write("/big.bin", &data, 0).unwrap();

        assert_eq!(fs.getattr("/big.bin").unwrap().chain.len(), 3);
        assert_eq!(fs.read("/big.bin", 20_000, 0).unwrap(), data);
        assert_eq!(fs.read("/big.bin", 100, 4090).unwrap(), &data[4090..4190]);
        assert!(fs.stats().fragmented_reads >= 1);
    }

    #[test]
    fn test_sparse_write_reads_zeros() {
        let fs = rw_fs();
        fs.write("/sparse", b"end", 5000).unwrap();
        let data = fs.read("/sparse", 10_000, 0).unwrap();
        assert_eq!(data.len(), 5003);
        assert!(data[..5000].iter().all(|&b| b == 0));
        assert_eq!(&data[5000..], b"end");
    }

    #[test]
    fn test_broken_chain_returns_prefix() {
        let fs = rw_fs();
        let data = vec![0xAB; 3 * CLUSTER_SIZE];
        fs.write("/f", &data, 0).unwrap();

        {
            let mut state = fs.state.write();
            let mut chain = state.vat.remove("f").unwrap();
            // Replace the middle hop with a location that is not a cluster start
            chain[1] = ClusterLocation::new(1, 1);
            state.vat.insert_chain("f", chain).unwrap();
        }

        let read = fs.read("/f", 3 * CLUSTER_SIZE, 0).unwrap();
        assert_eq!(read, vec![0xAB; CLUSTER_SIZE]);
        assert_eq!(fs.stats().broken_chains, 1);

        // Starting inside the broken hop produces nothing and fails
        assert!(matches!(
            fs.read("/f", 10, CLUSTER_SIZE as u64),
            Err(PixelMapError::BrokenChain { hop: 1, .. })
        ));
    }

    #[test]
    fn test_truncate_shrinks_and_zeroes() {
        let fs = rw_fs();
        fs.write("/t", &vec![7u8; 9000], 0).unwrap();
        let before = fs.statfs().free_clusters;

        fs.truncate("/t", 100).unwrap();
        assert_eq!(fs.getattr("/t").unwrap().chain.len(), 1);
        assert_eq!(fs.statfs().free_clusters, before + 2);

        // Growing again exposes zeros, not the old bytes
        fs.truncate("/t", 200).unwrap();
        let data = fs.read("/t", 1000, 0).unwrap();
        assert_eq!(data.len(), 200);
        assert!(data[..100].iter().all(|&b| b == 7));
        assert!(data[100..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_read_only_mount() {
        let fs = PixelMapFs::format(128, MountConfig::default()).unwrap();
        for result in [
            fs.create("/a", 0o644),
            fs.write("/a", b"x", 0).map(|_| ()),
            fs.unlink("/a"),
            fs.rename("/a", "/b"),
            fs.truncate("/a", 0),
        ] {
            match result {
                Err(e @ PixelMapError::ReadOnly(_)) => assert_eq!(e.errno(), libc::EROFS),
                other => panic!("expected ReadOnly, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_nested_directories() {
        let fs = rw_fs();
        fs.write("/docs/a.txt", b"a", 0).unwrap();
        fs.write("/docs/sub/b.txt", b"b", 0).unwrap();
        fs.write("/top.txt", b"t", 0).unwrap();

        let root: Vec<_> = fs.readdir("/").unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(root, vec![".", "..", "docs", "top.txt"]);

        let docs = fs.readdir("/docs").unwrap();
        assert_eq!(docs[2].name, "a.txt");
        assert_eq!(docs[3].name, "sub");
        assert_eq!(docs[3].kind, FileKind::Directory);

        assert!(fs.getattr("/docs").unwrap().is_dir());
        assert!(matches!(
            fs.readdir("/top.txt"),
            Err(PixelMapError::NotADirectory(_))
        ));
        assert!(matches!(
            fs.read("/docs", 1, 0),
            Err(PixelMapError::IsADirectory(_))
        ));
        assert!(matches!(
            fs.create("/top.txt/x", 0o644),
            Err(PixelMapError::NotADirectory(_))
        ));
    }

    #[test]
    fn test_open_release() {
        let fs = rw_fs();
        fs.create("/f", 0o644).unwrap();
        let a = fs.open("/f", false).unwrap();
        let b = fs.open("/f", true).unwrap();
        assert_eq!(fs.refcount("/f"), 2);
        fs.release(a).unwrap();
        fs.release(b).unwrap();
        assert_eq!(fs.refcount("/f"), 0);
        assert!(matches!(fs.release(b), Err(PixelMapError::BadHandle(_))));
        assert!(matches!(
            fs.open("/missing", false),
            Err(PixelMapError::NotFound(_))
        ));
    }

    #[test]
    fn test_no_space() {
        let fs = PixelMapFs::format(64, MountConfig::read_write()).unwrap();
        // 4 clusters total, 2 reserved
        fs.write("/a", &vec![1u8; 2 * CLUSTER_SIZE], 0).unwrap();
        let err = fs.write("/b", b"x", 0).unwrap_err();
        assert_eq!(err.errno(), libc::ENOSPC);
        // The mount keeps working
        assert_eq!(fs.read("/a", 4, 0).unwrap(), vec![1u8; 4]);
    }

    #[test]
    fn test_statfs() {
        let fs = rw_fs();
        let empty = fs.statfs();
        assert_eq!(empty.total_bytes, 256 * 256 * 4);
        assert_eq!(empty.used_bytes, 0);

        fs.write("/a", &vec![0u8; 5000], 0).unwrap();
        let stat = fs.statfs();
        assert_eq!(stat.used_bytes, 2 * CLUSTER_SIZE as u64);
        assert_eq!(stat.files, 1);
        assert_eq!(stat.free_clusters, empty.free_clusters - 2);
    }

    #[test]
    fn test_compress_idle_and_read_back() {
        let mut config = MountConfig::read_write();
        // Every cluster counts as cold
        config.zones.hot = 0.001;
        config.zones.warm = 0.002;
        config.zones.temperate = 0.003;
        config.zones.cool = 0.004;
        let fs = PixelMapFs::format(256, config).unwrap();

        let text: Vec<u8> = b"cold storage line\n".iter().copied().cycle().take(20_000).collect();
        fs.write("/archive.log", &text, 0).unwrap();
        let chain_before = fs.getattr("/archive.log").unwrap().chain.len();

        let later = unix_now() + 2.0 * 3600.0;
        assert_eq!(fs.compress_idle(later).unwrap(), 1);

        let info = fs.getattr("/archive.log").unwrap();
        assert!(info.compressed);
        assert_eq!(info.size, 20_000);
        assert!(info.chain.len() < chain_before);
        assert_eq!(fs.read("/archive.log", 100_000, 0).unwrap(), text);

        // Writing inflates it back to plain clusters
        fs.write("/archive.log", b"COLD", 0).unwrap();
        assert!(!fs.getattr("/archive.log").unwrap().compressed);
        let data = fs.read("/archive.log", 100_000, 0).unwrap();
        assert_eq!(&data[..4], b"COLD");
        assert_eq!(&data[4..], &text[4..]);
    }

    #[test]
    fn test_compress_idle_skips_hot_and_recent() {
        let fs = rw_fs();
        fs.write("/a", &vec![b'a'; 8192], 0).unwrap();
        // Default thresholds: a 256 grid never reaches the cold band
        assert_eq!(fs.compress_idle(unix_now() + 1e6).unwrap(), 0);
    }

    #[test]
    fn test_prefetch_tick_serves_reads() {
        let fs = rw_fs();
        fs.write("/p", b"prefetched", 0).unwrap();
        fs.read("/p", 100, 0).unwrap();
        fs.read("/p", 100, 0).unwrap();

        assert_eq!(fs.prefetch_tick(unix_now()).unwrap(), 1);
        assert_eq!(fs.read("/p", 4, 0).unwrap(), b"pref");
        assert_eq!(fs.stats().prefetch_hits, 1);

        // A write drops the prefetched copy
        fs.write("/p", b"PRE", 0).unwrap();
        assert_eq!(fs.read("/p", 4, 0).unwrap(), b"PREf");
        assert_eq!(fs.stats().prefetch_hits, 1);
    }

    #[test]
    fn test_flush_clears_dirty() {
        let fs = rw_fs();
        assert!(fs.is_dirty());
        fs.flush().unwrap();
        assert!(!fs.is_dirty());
        fs.write("/a", b"x", 0).unwrap();
        assert!(fs.is_dirty());
        fs.fsync().unwrap();
        assert!(!fs.is_dirty());
    }

    #[test]
    fn test_format_too_small() {
        assert!(matches!(
            PixelMapFs::format(32, MountConfig::default()),
            Err(PixelMapError::InvalidGrid(_))
        ));
    }
}
