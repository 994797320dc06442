//! Cache of geocoding responses: raw bytes and decoded locations in two
//! parallel prefixes, written atomically.

use crate::error::{JobdeckError, Result};
use crate::kv::{kv_version, set_kv_version, KvDb};
use crate::location::{read_binary_location, write_binary_location, Location};
use std::path::Path;

pub const GEOCODER_VERSION: i64 = 2;

const RAW: &[u8] = b"c";
const POINTS: &[u8] = b"p";

pub struct Cache {
    db: KvDb,
}

impl Cache {
    pub fn open(dir: &Path) -> Result<Cache> {
        let path = dir.join("kv");
        let exists = path.is_file();
        let db = KvDb::open(&path, 0)?;
        let cache = Cache { db };
        if !exists {
            cache.set_version(GEOCODER_VERSION)?;
        }
        let version = cache.version()?;
        if version != GEOCODER_VERSION {
            return Err(JobdeckError::Config(format!(
                "please upgrade geocoder cache from {} to {}",
                version, GEOCODER_VERSION
            )));
        }
        Ok(cache)
    }

    pub fn path(&self) -> &Path {
        self.db.path()
    }

    pub fn version(&self) -> Result<i64> {
        kv_version(&self.db, RAW)
    }

    pub fn set_version(&self, version: i64) -> Result<()> {
        set_kv_version(&self.db, RAW, version)
    }

    /// Store a raw response and its decoded location. `None` records that
    /// the query cannot be resolved, so it is never retried remotely.
    pub fn put(&self, key: &str, data: &[u8], location: Option<&Location>) -> Result<()> {
        self.db.update(|tx| {
            tx.put(RAW, key.as_bytes(), data)?;
            let mut record = Vec::new();
            if let Some(loc) = location {
                write_binary_location(&mut record, loc);
            }
            tx.put(POINTS, key.as_bytes(), &record)
        })
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.db.view(|tx| tx.get(RAW, key.as_bytes()))
    }

    /// Look up a decoded location. The boolean distinguishes "cached as
    /// unresolvable" (`(None, true)`) from "not in cache" (`(None, false)`).
    pub fn get_location(&self, key: &str) -> Result<(Option<Location>, bool)> {
        self.db.view(|tx| {
            let data = match tx.get(POINTS, key.as_bytes())? {
                Some(d) => d,
                None => return Ok((None, false)),
            };
            if data.is_empty() {
                return Ok((None, true));
            }
            let (location, _) = read_binary_location(&data)?;
            Ok((Some(location), true))
        })
    }

    pub fn list(&self) -> Result<Vec<String>> {
        self.db.view(|tx| tx.list(RAW))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn cache_location_states() {
        let dir = TempDir::new().unwrap();
        let cache = Cache::open(dir.path()).unwrap();

        let loc = Location {
            city: "Paris".to_string(),
            county: "Paris".to_string(),
            state: "Ile-de-France".to_string(),
            country: "France".to_string(),
            post_code: String::new(),
            lat: 48.8565056,
            lon: 2.3521334,
        };
        cache.put("results-fr", b"{\"raw\":1}", Some(&loc)).unwrap();
        cache.put("noresult-fr", b"{\"raw\":2}", None).unwrap();

        let (got, found) = cache.get_location("results-fr").unwrap();
        assert!(found);
        assert_eq!(got.unwrap().city, "Paris");

        let (got, found) = cache.get_location("noresult-fr").unwrap();
        assert!(found);
        assert!(got.is_none());

        let (got, found) = cache.get_location("missing-fr").unwrap();
        assert!(!found);
        assert!(got.is_none());

        assert_eq!(
            cache.get("results-fr").unwrap().as_deref(),
            Some(&b"{\"raw\":1}"[..])
        );
        assert_eq!(
            cache.list().unwrap(),
            vec!["noresult-fr".to_string(), "results-fr".to_string()]
        );
    }

    #[test]
    fn version_is_stamped_on_creation() {
        let dir = TempDir::new().unwrap();
        let cache = Cache::open(dir.path()).unwrap();
        assert_eq!(cache.version().unwrap(), GEOCODER_VERSION);
    }
}
