//! # jobdeck
//!
//! Crawler, store and search engine for the APEC job board. Offers are
//! crawled from the remote HTTP API, persisted verbatim in an embedded
//! key/value store with a soft-deletion journal, and served through two
//! online indexes: a [Tantivy](https://github.com/quickwit-oss/tantivy)
//! full-text index and an in-memory R-tree over geocoded locations.
//!
//! The moving parts are deliberately independent: the store, the indexing
//! queue and the geocoder cache each own their database file, and the
//! indexers reconcile against the store with idempotent resets — both
//! indexes can always be rebuilt from the store alone.
//!
//! ```rust,no_run
//! use jobdeck::config::DataDirs;
//! use jobdeck::store::Store;
//!
//! # fn main() -> jobdeck::Result<()> {
//! let dirs = DataDirs::new("./data");
//! let store = Store::open(&dirs.store())?;
//! println!("{} offers stored", store.size()?);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod crawler;
pub mod error;
pub mod geocoder;
pub mod index;
pub mod indexer;
pub mod kv;
pub mod location;
pub mod offer;
pub mod query;
pub mod salary;
pub mod spatial;
pub mod store;
pub mod types;

pub use error::{JobdeckError, Result};
pub use types::DatedOffer;
