use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;
use crate::core::error::Result;

pub const INDEX_EXTENSION: &str = "idx";

/// Directory holding index files (`{uuid}.idx`)
#[derive(Debug, Clone)]
pub struct IndexLayout {
    pub index_dir: PathBuf,
}

impl IndexLayout {
    pub fn new(index_dir: impl Into<PathBuf>) -> Result<Self> {
        let index_dir = index_dir.into();
        fs::create_dir_all(&index_dir)?;
        Ok(IndexLayout { index_dir })
    }

    /// Fresh, unused index file path.
    pub fn new_index_path(&self) -> PathBuf {
        self.index_dir
            .join(format!("{}.{}", Uuid::new_v4(), INDEX_EXTENSION))
    }

    /// Existing index files, sorted by name.
    pub fn index_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.index_dir)? {
            let path = entry?.path();
            if is_index_file(&path) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

pub fn is_index_file(path: &Path) -> bool {
    path.is_file() && path.extension().is_some_and(|ext| ext == INDEX_EXTENSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_distinct_index_paths() {
        let dir = tempfile::tempdir().unwrap();
        let layout = IndexLayout::new(dir.path().join("indexes")).unwrap();
        let a = layout.new_index_path();
        let b = layout.new_index_path();
        assert_ne!(a, b);
        assert_eq!(a.extension().unwrap(), "idx");

        fs::write(&a, b"x").unwrap();
        fs::write(layout.index_dir.join("notes.txt"), b"x").unwrap();
        assert_eq!(layout.index_files().unwrap(), vec![a]);
    }
}
