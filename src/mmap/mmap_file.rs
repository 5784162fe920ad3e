use memmap2::{Mmap, MmapOptions};
use std::fs::File;
use std::path::Path;
use crate::core::error::{Error, Result};

/// Memory-mapped index file for zero-copy reads
pub struct MmapFile {
    pub mmap: Mmap,
    pub len: usize,
}

impl MmapFile {
    /// Maps the whole file read-only; files shorter than `min_len` are rejected before mapping.
    pub fn open_read_only<P: AsRef<Path>>(path: P, min_len: usize) -> Result<Self> {
        let file = File::open(&path)?;
        let metadata = file.metadata()?;
        let len = metadata.len() as usize;
        if len < min_len {
            return Err(Error::corrupt(format!(
                "{}: file too short ({} bytes)",
                path.as_ref().display(),
                len
            )));
        }

        // Index files are immutable once finalized; nothing writes to a mapped file.
        let mmap = unsafe { MmapOptions::new().len(len).map(&file)? };

        Ok(MmapFile { mmap, len })
    }

    pub fn data(&self) -> &[u8] {
        &self.mmap[..]
    }
}
