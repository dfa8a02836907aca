//! Open-file bookkeeping
//!
//! Each `open` hands out a fresh handle and bumps the per-path reference
//! count. A path is closed again once its count drops to zero.

use crate::error::{PixelMapError, Result};
use ahash::AHashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenFile {
    pub path: String,
    pub writable: bool,
}

#[derive(Debug, Default)]
pub struct HandleTable {
    next: u64,
    handles: AHashMap<u64, OpenFile>,
    refcounts: AHashMap<String, usize>,
}

impl HandleTable {
    pub fn new() -> Self {
        HandleTable {
            next: 1,
            ..Default::default()
        }
    }

    pub fn open(&mut self, path: &str, writable: bool) -> u64 {
        let fh = self.next;
        self.next += 1;
        self.handles.insert(
            fh,
            OpenFile {
                path: path.to_string(),
                writable,
            },
        );
        *self.refcounts.entry(path.to_string()).or_insert(0) += 1;
        fh
    }

    pub fn release(&mut self, fh: u64) -> Result<OpenFile> {
        let file = self.handles.remove(&fh).ok_or(PixelMapError::BadHandle(fh))?;
        if let Some(count) = self.refcounts.get_mut(&file.path) {
            *count -= 1;
            if *count == 0 {
                self.refcounts.remove(&file.path);
            }
        }
        Ok(file)
    }

    pub fn get(&self, fh: u64) -> Result<&OpenFile> {
        self.handles.get(&fh).ok_or(PixelMapError::BadHandle(fh))
    }

    pub fn refcount(&self, path: &str) -> usize {
        self.refcounts.get(path).copied().unwrap_or(0)
    }

    pub fn is_open(&self, path: &str) -> bool {
        self.refcount(path) > 0
    }

    /// Follow a rename so open handles keep pointing at the file
    pub fn rename(&mut self, old: &str, new: &str) {
        if let Some(count) = self.refcounts.remove(old) {
            self.refcounts.insert(new.to_string(), count);
            for file in self.handles.values_mut().filter(|f| f.path == old) {
                file.path = new.to_string();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
