//! Transparent compression for idle cold-zone files
//!
//! **Design**:
//! - Compression threshold: only payloads >= 512 bytes are considered
//! - Fallback: keep the data uncompressed if the frame is >= 90% of the input
//! - Frame: [method: u8][original_len: u32 LE][payload]
//! - Eligibility: idle longer than the access-age threshold AND in the COLD band

use crate::config::CompressionSettings;
use crate::error::{PixelMapError, Result};
use crate::unix_now;
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

pub const MIN_COMPRESS_SIZE: usize = 512;
pub const MAX_RATIO: f64 = 0.9;
pub const FRAME_HEADER_LEN: usize = 5;
pub const TABLE_VERSION: &str = "1.0";
pub const DEFAULT_ACCESS_AGE_THRESHOLD: f64 = 3600.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum CompressionMethod {
    /// LZ4 (fast, moderate ratio)
    Lz4 = 1,
    /// Zstd (slower, better ratio)
    Zstd = 2,
}

impl CompressionMethod {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(CompressionMethod::Lz4),
            2 => Some(CompressionMethod::Zstd),
            _ => None,
        }
    }
}

/// Per-path record of a compressed payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionMetadata {
    pub compressed: bool,
    pub original_size: u64,
    pub compressed_size: u64,
    pub algorithm: CompressionMethod,
    pub compressed_at: f64,
}

impl CompressionMetadata {
    pub fn ratio(&self) -> f64 {
        if self.original_size == 0 {
            1.0
        } else {
            self.compressed_size as f64 / self.original_size as f64
        }
    }
}

/// Encode a self-describing frame
pub fn encode_frame(data: &[u8], method: CompressionMethod, level: i32) -> Result<Vec<u8>> {
    let original_len = u32::try_from(data.len()).map_err(|_| {
        PixelMapError::InvalidArgument(format!("{} bytes is too large to frame", data.len()))
    })?;

    let payload = match method {
        CompressionMethod::Lz4 => lz4_flex::compress(data),
        CompressionMethod::Zstd => zstd::bulk::compress(data, level)
            .map_err(|e| PixelMapError::Compression(format!("Zstd compression failed: {}", e)))?,
    };

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.push(method as u8);
    frame.extend_from_slice(&original_len.to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode a frame produced by [`encode_frame`]
pub fn decode_frame(frame: &[u8]) -> Result<Vec<u8>> {
    decode_frame_limited(frame, u32::MAX as usize)
}

/// Decode a frame whose declared length must not exceed `max_len`
pub fn decode_frame_limited(frame: &[u8], max_len: usize) -> Result<Vec<u8>> {
    if frame.len() < FRAME_HEADER_LEN {
        return Err(PixelMapError::Compression(format!(
            "frame of {} bytes is shorter than its header",
            frame.len()
        )));
    }

    let method = CompressionMethod::from_u8(frame[0]).ok_or_else(|| {
        PixelMapError::Compression(format!("unknown compression method {}", frame[0]))
    })?;
    let original_len = u32::from_le_bytes([frame[1], frame[2], frame[3], frame[4]]) as usize;
    if original_len > max_len {
        return Err(PixelMapError::Compression(format!(
            "frame declares {} bytes, expected at most {}",
            original_len, max_len
        )));
    }
    let payload = &frame[FRAME_HEADER_LEN..];

    let data = match method {
        CompressionMethod::Lz4 => lz4_flex::decompress(payload, original_len)
            .map_err(|e| PixelMapError::Compression(format!("LZ4 decompression failed: {}", e)))?,
        CompressionMethod::Zstd => zstd::bulk::decompress(payload, original_len).map_err(|e| {
            PixelMapError::Compression(format!("Zstd decompression failed: {}", e))
        })?,
    };

    if data.len() != original_len {
        return Err(PixelMapError::Compression(format!(
            "decompressed {} bytes, frame declares {}",
            data.len(),
            original_len
        )));
    }
    Ok(data)
}

/// Persisted form of one table row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionTableEntry {
    #[serde(flatten)]
    pub metadata: CompressionMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
}

/// Versioned export document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionTable {
    pub version: String,
    pub exported_at: String,
    pub entries: BTreeMap<String, CompressionTableEntry>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CompressionStats {
    pub total_compressed: usize,
    pub original_bytes: u64,
    pub compressed_bytes: u64,
}

impl CompressionStats {
    pub fn ratio(&self) -> f64 {
        if self.original_bytes == 0 {
            1.0
        } else {
            self.compressed_bytes as f64 / self.original_bytes as f64
        }
    }
}

pub struct CompressionEngine {
    method: CompressionMethod,
    level: i32,
    access_age_threshold: f64,
    cold_threshold: f64,
    metadata: AHashMap<String, CompressionMetadata>,
    buffers: AHashMap<String, Vec<u8>>,
}

impl CompressionEngine {
    /// `cold_threshold` is the distance where the COLD zone begins
    pub fn new(settings: &CompressionSettings, cold_threshold: f64) -> Self {
        CompressionEngine {
            method: settings.method,
            level: settings.level,
            access_age_threshold: settings.access_age_threshold_secs,
            cold_threshold,
            metadata: AHashMap::new(),
            buffers: AHashMap::new(),
        }
    }

    /// Compress `data` for `path` if it is worth it
    ///
    /// Returns `None` for payloads under 512 bytes or when the frame would
    /// not shrink below 90% of the input.
    pub fn compress(&mut self, path: &str, data: &[u8]) -> Result<Option<Vec<u8>>> {
        if data.len() < MIN_COMPRESS_SIZE {
            return Ok(None);
        }

        let frame = encode_frame(data, self.method, self.level)?;
        if frame.len() as f64 >= data.len() as f64 * MAX_RATIO {
            debug!(
                "Skipping compression of {}: {} -> {} bytes",
                path,
                data.len(),
                frame.len()
            );
            return Ok(None);
        }

        debug!(
            "Compressed {} with {:?}: {} -> {} bytes",
            path,
            self.method,
            data.len(),
            frame.len()
        );
        self.metadata.insert(
            path.to_string(),
            CompressionMetadata {
                compressed: true,
                original_size: data.len() as u64,
                compressed_size: frame.len() as u64,
                algorithm: self.method,
                compressed_at: unix_now(),
            },
        );
        self.buffers.insert(path.to_string(), frame.clone());
        Ok(Some(frame))
    }

    pub fn decompress(&self, compressed: &[u8]) -> Result<Vec<u8>> {
        decode_frame(compressed)
    }

    /// Idle long enough and far enough from the center
    pub fn should_compress(&self, zone_distance: f64, access_age_seconds: f64) -> bool {
        access_age_seconds > self.access_age_threshold && zone_distance >= self.cold_threshold
    }

    pub fn is_compressed(&self, path: &str) -> bool {
        self.metadata.get(path).is_some_and(|m| m.compressed)
    }

    pub fn metadata(&self, path: &str) -> Option<&CompressionMetadata> {
        self.metadata.get(path)
    }

    /// In-memory frame for `path`, if still held
    pub fn buffer(&self, path: &str) -> Option<&[u8]> {
        self.buffers.get(path).map(Vec::as_slice)
    }

    /// Track metadata for a frame whose bytes live elsewhere
    pub fn restore(&mut self, path: &str, metadata: CompressionMetadata) {
        self.metadata.insert(path.to_string(), metadata);
    }

    pub fn forget(&mut self, path: &str) -> Option<CompressionMetadata> {
        self.buffers.remove(path);
        self.metadata.remove(path)
    }

    pub fn rename(&mut self, old: &str, new: &str) {
        if let Some(meta) = self.metadata.remove(old) {
            self.metadata.insert(new.to_string(), meta);
        }
        if let Some(buffer) = self.buffers.remove(old) {
            self.buffers.insert(new.to_string(), buffer);
        }
    }

    /// Metadata for every tracked path, sorted
    pub fn metadata_table(&self) -> BTreeMap<String, CompressionMetadata> {
        self.metadata
            .iter()
            .map(|(path, meta)| (path.clone(), meta.clone()))
            .collect()
    }

    pub fn export_table(&self) -> CompressionTable {
        let entries = self
            .metadata
            .iter()
            .map(|(path, meta)| {
                (
                    path.clone(),
                    CompressionTableEntry {
                        metadata: meta.clone(),
                        data: self.buffers.get(path).cloned(),
                    },
                )
            })
            .collect();

        CompressionTable {
            version: TABLE_VERSION.to_string(),
            exported_at: chrono::Utc::now().to_rfc3339(),
            entries,
        }
    }

    /// Merge an exported table; returns the number of rows imported
    pub fn import_table(&mut self, table: CompressionTable) -> Result<usize> {
        if table.version != TABLE_VERSION {
            return Err(PixelMapError::VersionMismatch {
                expected: TABLE_VERSION.to_string(),
                found: table.version,
            });
        }

        let count = table.entries.len();
        for (path, entry) in table.entries {
            if let Some(data) = entry.data {
                self.buffers.insert(path.clone(), data);
            }
            self.metadata.insert(path, entry.metadata);
        }
        Ok(count)
    }

    pub fn export_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.export_table())?)
    }

    pub fn import_json(&mut self, json: &str) -> Result<usize> {
        let table: CompressionTable = serde_json::from_str(json)?;
        self.import_table(table)
    }

    pub fn statistics(&self) -> CompressionStats {
        self.metadata
            .values()
            .filter(|m| m.compressed)
            .fold(CompressionStats::default(), |mut stats, meta| {
                stats.total_compressed += 1;
                stats.original_bytes += meta.original_size;
                stats.compressed_bytes += meta.compressed_size;
                stats
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> CompressionEngine {
        CompressionEngine::new(&CompressionSettings::default(), 1536.0)
    }

    fn text(len: usize) -> Vec<u8> {
        b"the quick brown fox jumps over the lazy dog "
            .iter()
            .copied()
            .cycle()
            .take(len)
            .collect()
    }

    #[test]
    fn test_small_payload_skipped() {
        let mut engine = engine();
        assert!(engine.compress("tiny", &[1u8; 10]).unwrap().is_none());
        assert!(!engine.is_compressed("tiny"));
    }

    #[test]
    fn test_roundtrip_zstd() {
        let mut engine = engine();
        let data = text(8192);
        let frame = engine.compress("doc.txt", &data).unwrap().unwrap();
        assert!(frame.len() < data.len());
        assert_eq!(engine.decompress(&frame).unwrap(), data);

        let meta = engine.metadata("doc.txt").unwrap();
        assert_eq!(meta.original_size, 8192);
        assert_eq!(meta.algorithm, CompressionMethod::Zstd);
        assert!(meta.ratio() < 0.9);
    }

    #[test]
    fn test_roundtrip_lz4() {
        let settings = CompressionSettings {
            method: CompressionMethod::Lz4,
            ..Default::default()
        };
        let mut engine = CompressionEngine::new(&settings, 1536.0);
        let data = text(4096);
        let frame = engine.compress("a", &data).unwrap().unwrap();
        assert_eq!(frame[0], CompressionMethod::Lz4 as u8);
        assert_eq!(decode_frame(&frame).unwrap(), data);
    }

    #[test]
    fn test_incompressible_skipped() {
        use rand::{RngCore, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut data = vec![0u8; 4096];
        rng.fill_bytes(&mut data);

        let mut engine = engine();
        assert!(engine.compress("noise", &data).unwrap().is_none());
    }

    #[test]
    fn test_should_compress() {
        let engine = engine();
        assert!(engine.should_compress(2000.0, 7200.0));
        assert!(!engine.should_compress(2000.0, 60.0));
        assert!(!engine.should_compress(10.0, 7200.0));
    }

    #[test]
    fn test_corrupt_frame() {
        assert!(decode_frame(&[9, 0, 0, 0, 0]).is_err());
        assert!(decode_frame(&[1, 2]).is_err());
    }

    #[test]
    fn test_declared_length_over_limit() {
        let data = text(4096);
        let frame = encode_frame(&data, CompressionMethod::Zstd, 3).unwrap();
        assert_eq!(decode_frame_limited(&frame, 4096).unwrap(), data);
        assert!(decode_frame_limited(&frame, 4095).is_err());

        // Header claims 4 GiB over a tiny payload
        let mut forged = frame.clone();
        forged[1..5].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            decode_frame_limited(&forged, 4096),
            Err(PixelMapError::Compression(_))
        ));
    }

    #[test]
    fn test_export_import() {
        let mut engine = engine();
        engine.compress("doc.txt", &text(2048)).unwrap();
        let json = engine.export_json().unwrap();

        let mut other = CompressionEngine::new(&CompressionSettings::default(), 1536.0);
        assert_eq!(other.import_json(&json).unwrap(), 1);
        assert!(other.is_compressed("doc.txt"));
        assert_eq!(
            other.decompress(other.buffer("doc.txt").unwrap()).unwrap(),
            text(2048)
        );
    }

    #[test]
    fn test_import_version_mismatch() {
        let mut engine = engine();
        let mut table = engine.export_table();
        table.version = "0.9".to_string();
        assert!(matches!(
            engine.import_table(table),
            Err(PixelMapError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_statistics() {
        let mut engine = engine();
        engine.compress("a", &text(4096)).unwrap();
        engine.compress("b", &text(8192)).unwrap();
        let stats = engine.statistics();
        assert_eq!(stats.total_compressed, 2);
        assert_eq!(stats.original_bytes, 12288);
        assert!(stats.ratio() < 0.5);
    }
}
