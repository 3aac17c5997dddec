//! Flat file store backing a node.
//!
//! Serves the plain files sitting directly in one directory. Requested
//! names are confined to that directory; anything that could point outside
//! it is treated as absent.

use mesh_core::{MeshError, MeshResult};
use std::path::PathBuf;

pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open a store rooted at `root`. The directory must already exist.
    pub fn open(root: impl Into<PathBuf>) -> MeshResult<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(MeshError::Other(format!(
                "cannot find directory: {}",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    /// Names of all plain files in the store, sorted.
    pub fn list(&self) -> MeshResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Ok(name) = entry.file_name().into_string() {
                    names.push(name);
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Size of `name` in bytes, or -1 if there is no such file.
    pub fn size(&self, name: &str) -> i64 {
        match self.resolve(name) {
            Some(path) => match std::fs::metadata(path) {
                Ok(meta) if meta.is_file() => meta.len() as i64,
                _ => -1,
            },
            None => -1,
        }
    }

    /// Content of `name`, or None if it is absent or unreadable.
    pub fn content(&self, name: &str) -> Option<String> {
        let path = self.resolve(name)?;
        std::fs::read_to_string(path).ok()
    }

    fn resolve(&self, name: &str) -> Option<PathBuf> {
        if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
            return None;
        }
        Some(self.root.join(name))
    }
}
