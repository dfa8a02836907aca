use thiserror::Error;

#[derive(Error, Debug)]
pub enum PixelMapError {
    #[error("No such file: {0}")]
    NotFound(String),

    #[error("File already exists: {0}")]
    AlreadyExists(String),

    #[error("Read-only: {0}")]
    ReadOnly(String),

    #[error("Out of space: need {needed} clusters, {available} free")]
    NoSpace { needed: usize, available: usize },

    #[error("Broken cluster chain for {path} at hop {hop}")]
    BrokenChain { path: String, hop: usize },

    #[error("Corrupt metadata: {0}")]
    CorruptMetadata(String),

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: String, found: String },

    #[error("Invalid grid: {0}")]
    InvalidGrid(String),

    #[error("Coordinate or index out of bounds: {0}")]
    OutOfBounds(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Bad file handle: {0}")]
    BadHandle(u64),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

impl PixelMapError {
    /// POSIX errno reported to the filesystem host
    pub fn errno(&self) -> i32 {
        match self {
            PixelMapError::NotFound(_) => libc::ENOENT,
            PixelMapError::AlreadyExists(_) => libc::EEXIST,
            PixelMapError::ReadOnly(_) => libc::EROFS,
            PixelMapError::NoSpace { .. } => libc::ENOSPC,
            PixelMapError::NotADirectory(_) => libc::ENOTDIR,
            PixelMapError::IsADirectory(_) => libc::EISDIR,
            PixelMapError::BadHandle(_) => libc::EBADF,
            PixelMapError::InvalidArgument(_) | PixelMapError::VersionMismatch { .. } => {
                libc::EINVAL
            }
            _ => libc::EIO,
        }
    }
}

pub type Result<T> = std::result::Result<T, PixelMapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(PixelMapError::NotFound("a".into()).errno(), libc::ENOENT);
        assert_eq!(PixelMapError::AlreadyExists("a".into()).errno(), libc::EEXIST);
        assert_eq!(PixelMapError::ReadOnly("a".into()).errno(), libc::EROFS);
        assert_eq!(
            PixelMapError::NoSpace {
                needed: 2,
                available: 1
            }
            .errno(),
            libc::ENOSPC
        );
        assert_eq!(
            PixelMapError::BrokenChain {
                path: "a".into(),
                hop: 1
            }
            .errno(),
            libc::EIO
        );
        assert_eq!(PixelMapError::BadHandle(7).errno(), libc::EBADF);
    }
}
