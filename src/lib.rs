//! # PixelMap - Files Stored in the Pixels of an Image
//!
//! `pixelmap` keeps a filesystem inside a square RGBA image. Bytes are laid
//! along a Hilbert curve so that neighboring bytes stay neighboring pixels,
//! and files are chains of 4KB clusters recorded in a Visual Allocation
//! Table (VAT) embedded in the image itself.
//!
//! - **Locality-preserving layout** via a Hilbert curve
//! - **Temperature zones**: distance from the map center classifies data as
//!   HOT through COLD
//! - **Compression** of idle cold files (LZ4 or Zstandard)
//! - **Access prediction** and a prefetch cache fed by it
//! - **POSIX-style operations** with errno mapping for userspace mounts
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pixelmap::{PixelMap, Result};
//!
//! # fn main() -> Result<()> {
//! // A 1024x1024 image holds 4MB of clusters
//! let mut map = PixelMap::create("storage.png", 1024)?;
//!
//! map.write("documents/report.txt", b"Hello, World!")?;
//! let content = map.read("documents/report.txt")?;
//! let files = map.list("documents")?;
//!
//! // Changes are flushed into the PNG on drop
//! # Ok(())
//! # }
//! ```
//!
//! ## Advanced Usage
//!
//! ```rust,no_run
//! use pixelmap::{AllocationStrategy, PixelMapBuilder, Result};
//!
//! # fn main() -> Result<()> {
//! let map = PixelMapBuilder::new()
//!     .path("archive.png")
//!     .grid_size(2048)
//!     .allocation(AllocationStrategy::CenterOut)
//!     .with_prefetch_worker()
//!     .build()?;
//!
//! let fs = map.fs();
//! let fh = fs.open("/archive/2024.log", false)?;
//! let head = fs.read("/archive/2024.log", 512, 0)?;
//! fs.release(fh)?;
//! # Ok(())
//! # }
//! ```

pub mod core;

// Short crate:: paths for modules inside core
#[allow(unused_imports)]
pub(crate) use self::core::{
    allocator, cluster_store, compression, config, error, grid, hilbert, layout, predictor,
    prefetch, superblock, unix_now, vat, zone,
};

pub use crate::core::{
    allocator::AllocationStrategy,
    cluster_store::{CacheStats, ClusterGeometry, ClusterLocation, ClusterStore},
    compression::{CompressionEngine, CompressionMethod, CompressionMetadata},
    config::{CompressionSettings, MountConfig, PrefetchSettings},
    error::{PixelMapError, Result},
    fs::{DirEntry, FileInfo, FileKind, FsStats, PixelMapFs, PrefetchWorker, StatFs},
    grid::PixelGrid,
    hilbert::HilbertCurve,
    layout::{FileAttributes, LayoutSource, VatDocument},
    predictor::{AccessPredictor, HistoryDocument},
    prefetch::Prefetcher,
    superblock::{Superblock, CLUSTER_SIZE},
    vat::VisualAllocationTable,
    zone::{Zone, ZoneClassifier, ZoneThresholds},
};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Grid side used when none is given
pub const DEFAULT_GRID_SIZE: u32 = 1024;

/// High-level whole-file API over a [`PixelMapFs`]
///
/// Pending changes are flushed and the access log written when the map is
/// dropped.
///
/// # Examples
///
/// ```rust,no_run
/// use pixelmap::{PixelMap, Result};
///
/// # fn main() -> Result<()> {
/// let mut map = PixelMap::open("storage.png")?;
/// map.write("notes.txt", b"content")?;
/// assert!(map.exists("notes.txt"));
/// # Ok(())
/// # }
/// ```
pub struct PixelMap {
    fs: Arc<PixelMapFs>,
    worker: Option<PrefetchWorker>,
}

impl PixelMap {
    /// Create a new image of `grid_size` x `grid_size` pixels at `path`
    ///
    /// `grid_size` must be a power of two of at least 64.
    pub fn create<P: AsRef<Path>>(path: P, grid_size: u32) -> Result<Self> {
        info!("Creating pixel map {:?} ({}x{})", path.as_ref(), grid_size, grid_size);
        let fs = PixelMapFs::create_image(path, grid_size, MountConfig::read_write())?;
        Ok(PixelMap::from_fs(fs))
    }

    /// Open an existing image for reading and writing
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        info!("Opening pixel map {:?}", path.as_ref());
        let fs = PixelMapFs::mount(path, MountConfig::read_write())?;
        Ok(PixelMap::from_fs(fs))
    }

    /// Open an existing image without write access
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        let fs = PixelMapFs::mount(path, MountConfig::default())?;
        Ok(PixelMap::from_fs(fs))
    }

    /// Blank image that lives only in memory
    pub fn in_memory(grid_size: u32) -> Result<Self> {
        let fs = PixelMapFs::format(grid_size, MountConfig::read_write())?;
        Ok(PixelMap::from_fs(fs))
    }

    fn from_fs(fs: PixelMapFs) -> Self {
        PixelMap {
            fs: Arc::new(fs),
            worker: None,
        }
    }

    /// Replace the contents of `path`, creating it if needed
    pub fn write<P: AsRef<str>>(&mut self, path: P, content: &[u8]) -> Result<()> {
        let path = path.as_ref();
        debug!("Writing {} bytes to {}", content.len(), path);
        if self.exists(path) {
            self.fs.truncate(path, 0)?;
        }
        self.fs.write(path, content, 0)?;
        Ok(())
    }

    pub fn read<P: AsRef<str>>(&self, path: P) -> Result<Vec<u8>> {
        let path = path.as_ref();
        let info = self.fs.getattr(path)?;
        if info.is_dir() {
            return Err(PixelMapError::IsADirectory(path.to_string()));
        }
        self.fs.read(path, info.size as usize, 0)
    }

    pub fn delete<P: AsRef<str>>(&mut self, path: P) -> Result<()> {
        debug!("Deleting {}", path.as_ref());
        self.fs.unlink(path.as_ref())
    }

    pub fn rename<P: AsRef<str>, Q: AsRef<str>>(&mut self, from: P, to: Q) -> Result<()> {
        self.fs.rename(from.as_ref(), to.as_ref())
    }

    /// Names of the immediate children of a directory
    pub fn list<P: AsRef<str>>(&self, path: P) -> Result<Vec<String>> {
        Ok(self
            .fs
            .readdir(path.as_ref())?
            .into_iter()
            .filter(|entry| entry.name != "." && entry.name != "..")
            .map(|entry| entry.name)
            .collect())
    }

    pub fn exists<P: AsRef<str>>(&self, path: P) -> bool {
        self.fs.getattr(path.as_ref()).is_ok()
    }

    pub fn metadata<P: AsRef<str>>(&self, path: P) -> Result<FileInfo> {
        self.fs.getattr(path.as_ref())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.fs.flush()
    }

    pub fn statfs(&self) -> StatFs {
        self.fs.statfs()
    }

    pub fn stats(&self) -> FsStats {
        self.fs.stats()
    }

    /// Ask the prefetch workers (if any) to run a pass now
    pub fn prefetch(&self) -> Result<usize> {
        let now = unix_now();
        match &self.worker {
            Some(worker) if worker.tick(now) => Ok(0),
            _ => self.fs.prefetch_tick(now),
        }
    }

    /// The filesystem, for handle-level operations
    pub fn fs(&self) -> &Arc<PixelMapFs> {
        &self.fs
    }
}

impl Drop for PixelMap {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.shutdown();
        }
        if let Err(e) = self.fs.destroy() {
            warn!("Failed to close pixel map cleanly: {}", e);
        }
    }
}

/// Builder for customizing how a [`PixelMap`] is created or opened
///
/// An existing `path` is mounted; a missing one is created with
/// `grid_size`. Without a path the map lives in memory.
///
/// # Examples
///
/// ```rust,no_run
/// use pixelmap::PixelMapBuilder;
///
/// # fn main() -> pixelmap::Result<()> {
/// let map = PixelMapBuilder::new()
///     .path("data.png")
///     .grid_size(512)
///     .cache_size(4 * 1024 * 1024)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct PixelMapBuilder {
    path: Option<PathBuf>,
    grid_size: Option<u32>,
    config: MountConfig,
    prefetch_worker: bool,
}

impl PixelMapBuilder {
    pub fn new() -> Self {
        PixelMapBuilder {
            path: None,
            grid_size: None,
            config: MountConfig::read_write(),
            prefetch_worker: false,
        }
    }

    pub fn path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Side of a newly created image, in pixels
    pub fn grid_size(mut self, grid_size: u32) -> Self {
        self.grid_size = Some(grid_size);
        self
    }

    pub fn read_write(mut self, read_write: bool) -> Self {
        self.config.read_write = read_write;
        self
    }

    pub fn cache_size(mut self, bytes: usize) -> Self {
        self.config.cache_size_bytes = bytes;
        self
    }

    pub fn allocation(mut self, strategy: AllocationStrategy) -> Self {
        self.config.allocation = strategy;
        self
    }

    /// Replace the whole mount configuration
    pub fn config(mut self, config: MountConfig) -> Self {
        self.config = config;
        self
    }

    /// Run prefetch passes on background threads
    pub fn with_prefetch_worker(mut self) -> Self {
        self.prefetch_worker = true;
        self
    }

    pub fn build(self) -> Result<PixelMap> {
        let fs = match &self.path {
            Some(path) if path.exists() => {
                let fs = PixelMapFs::mount(path, self.config)?;
                if let Some(expected) = self.grid_size {
                    let actual = fs.grid().read().grid_size();
                    if actual != expected {
                        return Err(PixelMapError::InvalidGrid(format!(
                            "{:?} is {}x{}, not {}x{}",
                            path, actual, actual, expected, expected
                        )));
                    }
                }
                fs
            }
            Some(path) => PixelMapFs::create_image(
                path,
                self.grid_size.unwrap_or(DEFAULT_GRID_SIZE),
                self.config,
            )?,
            None => PixelMapFs::format(self.grid_size.unwrap_or(DEFAULT_GRID_SIZE), self.config)?,
        };

        let mut map = PixelMap::from_fs(fs);
        if self.prefetch_worker {
            map.worker = Some(PrefetchWorker::spawn(Arc::clone(&map.fs))?);
            debug!("Prefetch workers started");
        }
        Ok(map)
    }
}

impl Default for PixelMapBuilder {
    fn default() -> Self {
        Self::new()
    }
}
