//! On-disk layout: superblock, VAT document, sidecar, and v1 manifest
//!
//! Load order when mounting:
//! 1. Superblock in cluster 0 pointing at an embedded VAT document
//! 2. Sidecar `<image>.vat.json`
//! 3. v1 manifest found by scanning the stream tail for `{..."files"...}`
//!
//! Each failure is logged and the next source is tried. Only when all three
//! fail does loading return `CorruptMetadata`.

use crate::allocator::AllocationStrategy;
use crate::cluster_store::{ClusterGeometry, ClusterLocation, ClusterStore};
use crate::compression::CompressionMetadata;
use crate::error::{PixelMapError, Result};
use crate::grid::PixelGrid;
use crate::superblock::{Superblock, CLUSTER_SIZE};
use crate::vat::{normalize_path, VisualAllocationTable};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const VAT_FORMAT: &str = "visual-allocation-table-v2";
pub const VAT_VERSION: &str = "2.0";

/// Bytes at the end of the stream searched for a v1 manifest
pub const MANIFEST_SCAN_WINDOW: usize = 64 * 1024;

/// v1 images pack file data from this stream offset
pub const V1_DATA_OFFSET: u64 = CLUSTER_SIZE as u64;

pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Per-file attributes persisted beside the VAT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttributes {
    pub size: u64,
    #[serde(default = "default_mode")]
    pub mode: u32,
    #[serde(default)]
    pub mtime: u64,
}

fn default_mode() -> u32 {
    DEFAULT_FILE_MODE
}

impl Default for FileAttributes {
    fn default() -> Self {
        FileAttributes {
            size: 0,
            mode: DEFAULT_FILE_MODE,
            mtime: 0,
        }
    }
}

impl FileAttributes {
    pub fn new(mode: u32) -> Self {
        FileAttributes {
            size: 0,
            mode,
            mtime: unix_seconds(),
        }
    }

    pub fn touch(&mut self) {
        self.mtime = unix_seconds();
    }
}

fn unix_seconds() -> u64 {
    crate::unix_now() as u64
}

/// VAT document (v2)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VatDocument {
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub grid_size: u32,
    pub center: [u32; 2],
    pub entries: BTreeMap<String, Vec<ClusterLocation>>,
    #[serde(default)]
    pub attributes: BTreeMap<String, FileAttributes>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub compressed: BTreeMap<String, CompressionMetadata>,
}

fn default_format() -> String {
    VAT_FORMAT.to_string()
}

fn default_version() -> String {
    VAT_VERSION.to_string()
}

impl VatDocument {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let doc: VatDocument = serde_json::from_slice(bytes)
            .map_err(|e| PixelMapError::CorruptMetadata(format!("VAT document: {}", e)))?;
        if doc.format != VAT_FORMAT {
            return Err(PixelMapError::CorruptMetadata(format!(
                "unknown VAT format {:?}",
                doc.format
            )));
        }
        Ok(doc)
    }
}

/// One file in a v1 manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct V1FileEntry {
    pub name: String,
    pub size: u64,
    #[serde(default)]
    pub importance: f64,
    #[serde(default)]
    pub location: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct V1Manifest {
    pub files: Vec<V1FileEntry>,
}

/// Flat byte range of a v1 file
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyExtent {
    pub name: String,
    pub start: u64,
    pub size: u64,
    pub importance: f64,
}

/// Offset table for v1 files
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LegacyTable {
    extents: BTreeMap<String, LegacyExtent>,
}

impl LegacyTable {
    /// Files sit back to back from [`V1_DATA_OFFSET`] in manifest order
    ///
    /// Every extent must end inside a stream of `stream_len` bytes.
    pub fn from_manifest(manifest: &V1Manifest, stream_len: u64) -> Result<Self> {
        let mut extents = BTreeMap::new();
        let mut offset = V1_DATA_OFFSET;
        for file in &manifest.files {
            let end = offset
                .checked_add(file.size)
                .filter(|&end| end <= stream_len)
                .ok_or_else(|| {
                    PixelMapError::CorruptMetadata(format!(
                        "v1 file {:?} ({} bytes at {}) runs past the {}-byte stream",
                        file.name, file.size, offset, stream_len
                    ))
                })?;
            let key = normalize_path(&file.name).to_string();
            extents.insert(
                key.clone(),
                LegacyExtent {
                    name: key,
                    start: offset,
                    size: file.size,
                    importance: file.importance,
                },
            );
            offset = end;
        }
        Ok(LegacyTable { extents })
    }

    pub fn get(&self, path: &str) -> Option<&LegacyExtent> {
        self.extents.get(normalize_path(path))
    }

    pub fn iter(&self) -> impl Iterator<Item = &LegacyExtent> {
        self.extents.values()
    }

    pub fn len(&self) -> usize {
        self.extents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    pub fn clear(&mut self) {
        self.extents.clear();
    }
}

/// Where the mounted layout came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutSource {
    Embedded,
    Sidecar,
    LegacyV1,
}

pub struct MountedLayout {
    pub source: LayoutSource,
    pub vat: VisualAllocationTable,
    pub attributes: BTreeMap<String, FileAttributes>,
    pub compressed: BTreeMap<String, CompressionMetadata>,
    pub legacy: LegacyTable,
}

/// `<image>.vat.json`
pub fn sidecar_path(image: &Path) -> PathBuf {
    with_suffix(image, ".vat.json")
}

/// `<image>.access.json`
pub fn access_log_path(image: &Path) -> PathBuf {
    with_suffix(image, ".access.json")
}

fn with_suffix(image: &Path, suffix: &str) -> PathBuf {
    let mut name = image.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Empty table for a freshly formatted grid
pub fn fresh_vat(
    geometry: ClusterGeometry,
    strategy: AllocationStrategy,
) -> Result<VisualAllocationTable> {
    let mut vat = VisualAllocationTable::with_default_center(geometry, strategy);
    let superblock = Superblock::new(geometry.grid_size(), vat.center());
    vat.reserve(superblock.reserved_clusters())?;
    Ok(vat)
}

/// Build a table from a parsed VAT document
pub fn vat_from_document(
    doc: VatDocument,
    strategy: AllocationStrategy,
    source: LayoutSource,
) -> Result<MountedLayout> {
    let geometry = ClusterGeometry::new(doc.grid_size)?;
    let center = (doc.center[0], doc.center[1]);
    let mut vat = VisualAllocationTable::new(geometry, center, strategy);
    vat.reserve(Superblock::new(doc.grid_size, center).reserved_clusters())?;

    for (path, chain) in doc.entries {
        vat.insert_chain(&path, chain)?;
    }

    let attributes = doc
        .attributes
        .into_iter()
        .filter(|(path, _)| vat.contains(path))
        .collect();
    let compressed = doc
        .compressed
        .into_iter()
        .filter(|(path, _)| vat.contains(path))
        .collect();

    Ok(MountedLayout {
        source,
        vat,
        attributes,
        compressed,
        legacy: LegacyTable::default(),
    })
}

fn load_embedded(grid: &PixelGrid, strategy: AllocationStrategy) -> Result<MountedLayout> {
    let superblock = Superblock::from_bytes(&grid.read_stream(0, CLUSTER_SIZE)?)?;
    if superblock.grid_size != grid.grid_size() {
        return Err(PixelMapError::CorruptMetadata(format!(
            "superblock grid size {} does not match {}x{} image",
            superblock.grid_size,
            grid.grid_size(),
            grid.grid_size()
        )));
    }
    if superblock.vat_size == 0 {
        return Err(PixelMapError::CorruptMetadata(
            "VAT stored in sidecar".to_string(),
        ));
    }

    let range = superblock.vat_range();
    let bytes = grid.read_stream(range.start, (range.end - range.start) as usize)?;
    if crc32fast::hash(&bytes) != superblock.vat_crc {
        return Err(PixelMapError::CorruptMetadata(
            "embedded VAT checksum mismatch".to_string(),
        ));
    }

    vat_from_document(VatDocument::parse(&bytes)?, strategy, LayoutSource::Embedded)
}

fn load_sidecar(
    grid: &PixelGrid,
    image: Option<&Path>,
    strategy: AllocationStrategy,
) -> Result<MountedLayout> {
    let image = image.ok_or_else(|| {
        PixelMapError::CorruptMetadata("no image path for sidecar lookup".to_string())
    })?;
    let path = sidecar_path(image);
    let bytes = std::fs::read(&path)?;
    let doc = VatDocument::parse(&bytes)?;
    if doc.grid_size != grid.grid_size() {
        return Err(PixelMapError::CorruptMetadata(format!(
            "sidecar {:?} is for a {}x{} grid",
            path, doc.grid_size, doc.grid_size
        )));
    }
    vat_from_document(doc, strategy, LayoutSource::Sidecar)
}

/// Find the v1 manifest in the stream tail
///
/// Takes the last closing brace in the window, then walks backwards over
/// opening braces until a slice parses as an object with a `files` key.
pub fn scan_v1_manifest(grid: &PixelGrid) -> Result<V1Manifest> {
    let window = MANIFEST_SCAN_WINDOW.min(grid.stream_len() as usize);
    let start = grid.stream_len() - window as u64;
    let tail = grid.read_stream(start, window)?;

    let end = tail
        .iter()
        .rposition(|&b| b == b'}')
        .ok_or_else(|| PixelMapError::CorruptMetadata("no v1 manifest in image tail".to_string()))?;

    for open in (0..end).rev().filter(|&i| tail[i] == b'{') {
        let candidate = &tail[open..=end];
        let Ok(value) = serde_json::from_slice::<serde_json::Value>(candidate) else {
            continue;
        };
        if value.get("files").is_some() {
            return serde_json::from_value(value)
                .map_err(|e| PixelMapError::CorruptMetadata(format!("v1 manifest: {}", e)));
        }
    }

    Err(PixelMapError::CorruptMetadata(
        "no v1 manifest in image tail".to_string(),
    ))
}

fn load_legacy(grid: &PixelGrid, strategy: AllocationStrategy) -> Result<MountedLayout> {
    let manifest = scan_v1_manifest(grid)?;
    let legacy = LegacyTable::from_manifest(&manifest, grid.stream_len())?;
    let geometry = ClusterGeometry::new(grid.grid_size())?;
    Ok(MountedLayout {
        source: LayoutSource::LegacyV1,
        vat: fresh_vat(geometry, strategy)?,
        attributes: BTreeMap::new(),
        compressed: BTreeMap::new(),
        legacy,
    })
}

/// Load the layout of `grid`, trying each source in turn
pub fn load_layout(
    grid: &PixelGrid,
    image: Option<&Path>,
    strategy: AllocationStrategy,
) -> Result<MountedLayout> {
    let embedded_err = match load_embedded(grid, strategy) {
        Ok(layout) => {
            debug!("Loaded embedded VAT with {} entries", layout.vat.len());
            return Ok(layout);
        }
        Err(e) => e,
    };

    let sidecar_err = match load_sidecar(grid, image, strategy) {
        Ok(layout) => {
            info!("Loaded sidecar VAT with {} entries", layout.vat.len());
            return Ok(layout);
        }
        Err(e) => e,
    };

    warn!(
        "No v2 VAT ({}; sidecar: {}), falling back to v1 manifest",
        embedded_err, sidecar_err
    );

    match load_legacy(grid, strategy) {
        Ok(layout) => {
            info!("Mounted v1 image with {} files", layout.legacy.len());
            Ok(layout)
        }
        Err(legacy_err) => Err(PixelMapError::CorruptMetadata(format!(
            "no usable layout: embedded VAT: {}; sidecar: {}; v1 manifest: {}",
            embedded_err, sidecar_err, legacy_err
        ))),
    }
}

/// Where a persisted VAT document ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VatPlacement {
    Embedded,
    Sidecar,
}

/// Write the superblock and VAT document
///
/// The document goes into the embedded region when it fits, otherwise into
/// the sidecar next to `image`.
pub fn persist_layout(
    store: &ClusterStore,
    doc: &VatDocument,
    image: Option<&Path>,
) -> Result<VatPlacement> {
    let bytes = serde_json::to_vec(doc)?;
    let mut superblock = Superblock::new(doc.grid_size, (doc.center[0], doc.center[1]));

    let placement = if bytes.len() as u64 <= superblock.vat_capacity {
        superblock.vat_size = bytes.len() as u64;
        superblock.vat_crc = crc32fast::hash(&bytes);
        store.write_stream(superblock.vat_offset, &bytes)?;
        if let Some(image) = image {
            let sidecar = sidecar_path(image);
            if sidecar.exists() {
                std::fs::remove_file(&sidecar)?;
            }
        }
        VatPlacement::Embedded
    } else {
        let image = image.ok_or(PixelMapError::NoSpace {
            needed: bytes.len().div_ceil(CLUSTER_SIZE),
            available: (superblock.vat_capacity as usize) / CLUSTER_SIZE,
        })?;
        warn!(
            "VAT document ({} bytes) exceeds embedded region ({} bytes), writing sidecar",
            bytes.len(),
            superblock.vat_capacity
        );
        std::fs::write(sidecar_path(image), &bytes)?;
        VatPlacement::Sidecar
    };

    store.write_stream(0, &superblock.to_bytes())?;
    Ok(placement)
}

/// Build a v1 image: files packed from 4KB, manifest at the stream tail
pub fn build_v1_image(grid_size: u32, files: &[(&str, &[u8])]) -> Result<PixelGrid> {
    let mut grid = PixelGrid::new(grid_size)?;
    let manifest = V1Manifest {
        files: files
            .iter()
            .map(|(name, data)| V1FileEntry {
                name: name.to_string(),
                size: data.len() as u64,
                importance: 0.5,
                location: serde_json::Value::Null,
            })
            .collect(),
    };
    let manifest_bytes = serde_json::to_vec(&manifest)?;

    let data_len: u64 = files.iter().map(|(_, data)| data.len() as u64).sum();
    let manifest_start = grid
        .stream_len()
        .checked_sub(manifest_bytes.len() as u64)
        .filter(|&start| start >= V1_DATA_OFFSET + data_len)
        .ok_or(PixelMapError::NoSpace {
            needed: (V1_DATA_OFFSET + data_len + manifest_bytes.len() as u64)
                .div_ceil(CLUSTER_SIZE as u64) as usize,
            available: (grid.stream_len() / CLUSTER_SIZE as u64) as usize,
        })?;
    if manifest_bytes.len() > MANIFEST_SCAN_WINDOW {
        return Err(PixelMapError::InvalidArgument(format!(
            "v1 manifest of {} bytes exceeds scan window",
            manifest_bytes.len()
        )));
    }

    let mut offset = V1_DATA_OFFSET;
    for (_, data) in files {
        grid.write_stream(offset, data)?;
        offset += data.len() as u64;
    }
    grid.write_stream(manifest_start, &manifest_bytes)?;
    Ok(grid)
}
