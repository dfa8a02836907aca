use crate::error::{PixelMapError, Result};
use std::ops::Range;

pub const SUPERBLOCK_MAGIC: [u8; 8] = *b"INFIN2\0\0";
pub const SUPERBLOCK_VERSION: u16 = 2;
pub const CLUSTER_SIZE: usize = 4096;
pub const PIXELS_PER_CLUSTER: u64 = (CLUSTER_SIZE / 4) as u64;
pub const MAX_VAT_CLUSTERS: u64 = 256;
/// Largest side a 16th-order curve covers
pub const MAX_GRID_SIZE: u32 = 1 << 16;

/// Encoded size of the fixed superblock fields
const ENCODED_LEN: usize = 8 + 2 + 4 + 4 + 4 + 4 + 8 + 8 + 8 + 4;

/// Number of clusters reserved for the embedded VAT
pub fn vat_clusters_for(total_clusters: u64) -> u64 {
    (total_clusters / 16).clamp(1, MAX_VAT_CLUSTERS)
}

/// Image superblock (cluster 0)
///
/// Lives in the first 4KB of the Hilbert byte stream. It records the
/// grid geometry, the map center, and where the embedded VAT document
/// sits in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    /// Magic number: "INFIN2\0\0"
    pub magic: [u8; 8],

    /// Format version (always 2)
    pub version: u16,

    /// Grid side length in pixels
    pub grid_size: u32,

    /// Cluster size in bytes (always 4096)
    pub cluster_size: u32,

    /// Zone reference point
    pub center_x: u32,
    pub center_y: u32,

    /// Stream offset of the embedded VAT region
    pub vat_offset: u64,

    /// Size of the embedded VAT region in bytes
    pub vat_capacity: u64,

    /// Length of the VAT document; 0 means it lives in the sidecar
    pub vat_size: u64,

    /// CRC32 of the VAT document bytes
    pub vat_crc: u32,
}

impl Superblock {
    pub fn new(grid_size: u32, center: (u32, u32)) -> Self {
        let total_clusters = (grid_size as u64 * grid_size as u64) / PIXELS_PER_CLUSTER;
        Superblock {
            magic: SUPERBLOCK_MAGIC,
            version: SUPERBLOCK_VERSION,
            grid_size,
            cluster_size: CLUSTER_SIZE as u32,
            center_x: center.0,
            center_y: center.1,
            vat_offset: CLUSTER_SIZE as u64,
            vat_capacity: vat_clusters_for(total_clusters) * CLUSTER_SIZE as u64,
            vat_size: 0,
            vat_crc: 0,
        }
    }

    pub fn center(&self) -> (u32, u32) {
        (self.center_x, self.center_y)
    }

    /// Cluster indices reserved by the superblock and the VAT region
    pub fn reserved_clusters(&self) -> Range<u64> {
        let vat_end = (self.vat_offset + self.vat_capacity) / CLUSTER_SIZE as u64;
        0..vat_end
    }

    /// Stream byte range of the VAT document
    pub fn vat_range(&self) -> Range<u64> {
        self.vat_offset..self.vat_offset + self.vat_size
    }

    /// Validate magic, version, and geometry
    pub fn validate(&self) -> Result<()> {
        if self.magic != SUPERBLOCK_MAGIC {
            return Err(PixelMapError::CorruptMetadata(
                "invalid superblock magic".to_string(),
            ));
        }

        if self.version != SUPERBLOCK_VERSION {
            return Err(PixelMapError::VersionMismatch {
                expected: SUPERBLOCK_VERSION.to_string(),
                found: self.version.to_string(),
            });
        }

        if self.cluster_size != CLUSTER_SIZE as u32 {
            return Err(PixelMapError::CorruptMetadata(format!(
                "unsupported cluster size {}",
                self.cluster_size
            )));
        }

        if !self.grid_size.is_power_of_two() || !(2..=MAX_GRID_SIZE).contains(&self.grid_size) {
            return Err(PixelMapError::CorruptMetadata(format!(
                "grid size {} is not a power of two",
                self.grid_size
            )));
        }

        if self.center_x >= self.grid_size || self.center_y >= self.grid_size {
            return Err(PixelMapError::CorruptMetadata(format!(
                "center ({}, {}) outside grid",
                self.center_x, self.center_y
            )));
        }

        let stream_len = self.grid_size as u64 * self.grid_size as u64 * 4;
        if self.vat_offset % CLUSTER_SIZE as u64 != 0
            || self
                .vat_offset
                .checked_add(self.vat_capacity)
                .map_or(true, |end| end > stream_len)
        {
            return Err(PixelMapError::CorruptMetadata(format!(
                "VAT region {}+{} outside stream of {} bytes",
                self.vat_offset, self.vat_capacity, stream_len
            )));
        }

        if self.vat_size > self.vat_capacity {
            return Err(PixelMapError::CorruptMetadata(format!(
                "VAT size {} exceeds region capacity {}",
                self.vat_size, self.vat_capacity
            )));
        }

        Ok(())
    }

    /// Serialize to one full cluster
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(CLUSTER_SIZE);

        bytes.extend_from_slice(&self.magic);
        bytes.extend_from_slice(&self.version.to_le_bytes());
        bytes.extend_from_slice(&self.grid_size.to_le_bytes());
        bytes.extend_from_slice(&self.cluster_size.to_le_bytes());
        bytes.extend_from_slice(&self.center_x.to_le_bytes());
        bytes.extend_from_slice(&self.center_y.to_le_bytes());
        bytes.extend_from_slice(&self.vat_offset.to_le_bytes());
        bytes.extend_from_slice(&self.vat_capacity.to_le_bytes());
        bytes.extend_from_slice(&self.vat_size.to_le_bytes());
        bytes.extend_from_slice(&self.vat_crc.to_le_bytes());

        // Pad to CLUSTER_SIZE
        bytes.resize(CLUSTER_SIZE, 0);

        bytes
    }

    /// Deserialize and validate
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < ENCODED_LEN {
            return Err(PixelMapError::CorruptMetadata(
                "insufficient bytes for superblock".to_string(),
            ));
        }

        let mut cursor = FieldCursor { bytes, offset: 0 };
        let mut magic = [0u8; 8];
        magic.copy_from_slice(cursor.take(8));

        let superblock = Superblock {
            magic,
            version: u16::from_le_bytes(cursor.array()),
            grid_size: u32::from_le_bytes(cursor.array()),
            cluster_size: u32::from_le_bytes(cursor.array()),
            center_x: u32::from_le_bytes(cursor.array()),
            center_y: u32::from_le_bytes(cursor.array()),
            vat_offset: u64::from_le_bytes(cursor.array()),
            vat_capacity: u64::from_le_bytes(cursor.array()),
            vat_size: u64::from_le_bytes(cursor.array()),
            vat_crc: u32::from_le_bytes(cursor.array()),
        };

        superblock.validate()?;

        Ok(superblock)
    }
}

/// Little-endian field reader over a length-checked buffer
struct FieldCursor<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> FieldCursor<'a> {
    fn take(&mut self, len: usize) -> &'a [u8] {
        let field = &self.bytes[self.offset..self.offset + len];
        self.offset += len;
        field
    }

    fn array<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_superblock_roundtrip() {
        let mut sb = Superblock::new(256, (128, 128));
        sb.vat_size = 321;
        sb.vat_crc = 0xDEADBEEF;

        let bytes = sb.to_bytes();
        assert_eq!(bytes.len(), CLUSTER_SIZE);
        assert_eq!(&bytes[..8], b"INFIN2\0\0");

        let parsed = Superblock::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, sb);
    }

    #[test]
    fn test_vat_region_sizing() {
        // 256x256 grid = 64 clusters -> 4 VAT clusters
        let sb = Superblock::new(256, (128, 128));
        assert_eq!(sb.vat_capacity, 4 * CLUSTER_SIZE as u64);
        assert_eq!(sb.reserved_clusters(), 0..5);

        assert_eq!(vat_clusters_for(4), 1);
        assert_eq!(vat_clusters_for(1 << 20), MAX_VAT_CLUSTERS);
    }

    #[test]
    fn test_invalid_magic() {
        let mut sb = Superblock::new(64, (32, 32));
        sb.magic = *b"INVALID!";
        assert!(matches!(
            sb.validate(),
            Err(PixelMapError::CorruptMetadata(_))
        ));
    }

    #[test]
    fn test_wrong_version() {
        let mut sb = Superblock::new(64, (32, 32));
        sb.version = 1;
        assert!(matches!(
            sb.validate(),
            Err(PixelMapError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_vat_region_overflow_rejected() {
        let mut sb = Superblock::new(64, (32, 32));
        sb.vat_offset = u64::MAX - 4095;
        assert!(matches!(
            Superblock::from_bytes(&sb.to_bytes()),
            Err(PixelMapError::CorruptMetadata(_))
        ));

        let mut sb = Superblock::new(64, (32, 32));
        sb.vat_capacity = u64::MAX;
        assert!(matches!(
            sb.validate(),
            Err(PixelMapError::CorruptMetadata(_))
        ));
    }

    #[test]
    fn test_oversized_grid_rejected() {
        let sb = Superblock::new(1 << 31, (0, 0));
        assert!(matches!(
            sb.validate(),
            Err(PixelMapError::CorruptMetadata(_))
        ));
    }

    #[test]
    fn test_blank_cluster_rejected() {
        assert!(Superblock::from_bytes(&[0u8; CLUSTER_SIZE]).is_err());
        assert!(Superblock::from_bytes(&[0u8; 10]).is_err());
    }
}
