//! Data directory layout and environment configuration.

use std::path::{Path, PathBuf};

pub const GEOCODING_KEY_VAR: &str = "APEC_GEOCODING_KEY";

/// Maps the root data directory to the files each component owns.
#[derive(Debug, Clone)]
pub struct DataDirs {
    root: PathBuf,
}

impl DataDirs {
    pub fn new(root: impl Into<PathBuf>) -> DataDirs {
        DataDirs { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Offer store directory, holding `kv`.
    pub fn store(&self) -> PathBuf {
        self.root.join("offers")
    }

    /// Full-text index directory.
    pub fn index(&self) -> PathBuf {
        self.root.join("index")
    }

    /// Indexing queue directory, holding `kv`.
    pub fn queue(&self) -> PathBuf {
        self.root.join("queue")
    }

    /// Geocoder cache directory, holding `kv`.
    pub fn geocoder(&self) -> PathBuf {
        self.root.join("geocoder")
    }
}

/// The third-party geocoding key, from the environment.
pub fn geocoding_key() -> Option<String> {
    std::env::var(GEOCODING_KEY_VAR)
        .ok()
        .filter(|k| !k.is_empty())
}
