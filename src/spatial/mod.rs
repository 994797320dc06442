//! Spatial index over geocoded offers, and the worker keeping it in sync
//! with the store.

pub mod rtree;

use crate::error::Result;
use crate::geocoder::{cached_offer_location, Geocoder};
use crate::indexer::diff_ids;
use crate::offer::{convert_offer, decode_offer};
use crate::store::Store;
use crate::types::DatedOffer;
use chrono::{DateTime, Utc};
use rtree::{Rect, RTree, SpatialEntry, MAX_NODE_ENTRIES};
use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, oneshot};

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Offers are points; the index stores them as boxes of this tiny extent.
const LOC_EXTENT: f64 = 1e-6;

/// Convert a radius in metres around a point into a degree-sized query
/// rectangle, using the spherical-earth approximation.
fn geo_rect(lat: f64, lon: f64, radius: f64) -> Rect {
    let dlat = radius / (PI * EARTH_RADIUS_M) * 180.0;
    let r = EARTH_RADIUS_M * ((PI * lat) / 180.0).cos();
    let dlon = radius / (PI * r) * 180.0;
    Rect::new([lon - dlon, lat - dlat], [lon + dlon, lat + dlat])
}

struct Inner {
    tree: RTree,
    offers: HashMap<String, (Rect, DateTime<Utc>)>,
}

/// In-memory R-tree of offer locations behind a read-write latch:
/// `add`/`remove` exclusive, queries shared.
pub struct SpatialIndex {
    inner: RwLock<Inner>,
}

impl Default for SpatialIndex {
    fn default() -> SpatialIndex {
        SpatialIndex::new()
    }
}

impl SpatialIndex {
    pub fn new() -> SpatialIndex {
        SpatialIndex {
            inner: RwLock::new(Inner {
                tree: RTree::new(MAX_NODE_ENTRIES),
                offers: HashMap::new(),
            }),
        }
    }

    pub fn add(&self, id: &str, date: DateTime<Utc>, lat: f64, lon: f64) {
        let rect = Rect::new(
            [lon - LOC_EXTENT / 2.0, lat - LOC_EXTENT / 2.0],
            [lon + LOC_EXTENT / 2.0, lat + LOC_EXTENT / 2.0],
        );
        let mut inner = self.inner.write().unwrap();
        if let Some((old_rect, _)) = inner.offers.remove(id) {
            inner.tree.remove(id, &old_rect);
        }
        inner.tree.insert(SpatialEntry {
            id: id.to_string(),
            date,
            rect,
        });
        inner.offers.insert(id.to_string(), (rect, date));
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut inner = self.inner.write().unwrap();
        match inner.offers.remove(id) {
            Some((rect, _)) => inner.tree.remove(id, &rect),
            None => false,
        }
    }

    pub fn list(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap();
        inner.offers.keys().cloned().collect()
    }

    /// Every indexed offer with its date, for location-less queries.
    pub fn list_dated(&self) -> Vec<DatedOffer> {
        let inner = self.inner.read().unwrap();
        inner
            .offers
            .iter()
            .map(|(id, (_, date))| DatedOffer {
                date: date.to_rfc3339(),
                id: id.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().offers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All offers within `radius` metres of the point, by rectangle
    /// intersection.
    pub fn find_nearest(&self, lat: f64, lon: f64, radius: f64) -> Vec<DatedOffer> {
        let query = geo_rect(lat, lon, radius);
        let inner = self.inner.read().unwrap();
        inner
            .tree
            .search_intersect(&query)
            .into_iter()
            .map(|e| DatedOffer {
                date: e.date.to_rfc3339(),
                id: e.id,
            })
            .collect()
    }
}

/// Resolve the location of a stored offer through the geocoder cache only.
/// Returns the publication date and coordinates, or `None` when the offer is
/// missing, undecodable or not resolvable from cache.
pub fn get_offer_location(
    store: &Store,
    geocoder: &Geocoder,
    id: &str,
) -> Result<Option<(DateTime<Utc>, f64, f64)>> {
    let data = match store.get(id)? {
        Some(d) => d,
        None => return Ok(None),
    };
    let js = match decode_offer(&data) {
        Ok(js) => js,
        Err(e) => {
            tracing::warn!("skipping undecodable offer {}: {}", id, e);
            return Ok(None);
        }
    };
    let offer = match convert_offer(&js) {
        Ok(o) => o,
        Err(e) => {
            tracing::warn!("skipping unconvertible offer {}: {}", id, e);
            return Ok(None);
        }
    };
    match cached_offer_location(geocoder, &js)? {
        Some(location) => Ok(Some((offer.date, location.lat, location.lon))),
        None => Ok(None),
    }
}

/// Handle on the spatial indexing task. Mirrors the text indexer without a
/// durable queue: a reset rebuilds the pending set from a diff of id sets.
pub struct SpatialIndexer {
    reset_tx: mpsc::Sender<()>,
    stop_tx: mpsc::Sender<oneshot::Sender<()>>,
}

impl SpatialIndexer {
    pub fn new(store: Arc<Store>, index: Arc<SpatialIndex>, geocoder: Arc<Geocoder>) -> SpatialIndexer {
        let (reset_tx, reset_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        tokio::spawn(dispatch(store, index, geocoder, reset_rx, stop_rx));
        SpatialIndexer { reset_tx, stop_tx }
    }

    /// Request a reconciliation; coalesced with any pending request.
    pub fn sync(&self) {
        let _ = self.reset_tx.try_send(());
    }

    pub async fn close(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.stop_tx.send(ack_tx).await.is_ok() {
            let _ = ack_rx.await;
        }
    }
}

async fn dispatch(
    store: Arc<Store>,
    index: Arc<SpatialIndex>,
    geocoder: Arc<Geocoder>,
    mut reset_rx: mpsc::Receiver<()>,
    mut stop_rx: mpsc::Receiver<oneshot::Sender<()>>,
) {
    loop {
        tokio::select! {
            Some(ack) = stop_rx.recv() => {
                let _ = ack.send(());
                return;
            }
            Some(()) = reset_rx.recv() => {
                if let Err(e) = sync_index(&store, &index, &geocoder) {
                    tracing::error!("spatial indexer reset failed: {}", e);
                }
            }
            else => return,
        }
    }
}

fn sync_index(store: &Store, index: &SpatialIndex, geocoder: &Geocoder) -> Result<()> {
    let stored = store.list()?;
    let indexed = index.list();
    let (added, removed) = diff_ids(stored, indexed);
    tracing::info!("spatially indexing {}, removing {}", added.len(), removed.len());
    for id in removed {
        index.remove(&id);
    }
    for id in added {
        if let Some((date, lat, lon)) = get_offer_location(store, geocoder, &id)? {
            index.add(&id, date, lat, lon);
        }
    }
    tracing::info!("spatial indexation done, {} offers", index.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2016, 3, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn radius_queries() {
        let index = SpatialIndex::new();
        // Paris and Lyon.
        index.add("x", date(), 48.8566, 2.3522);
        index.add("y", date(), 45.75, 4.85);

        let ids = |offers: Vec<DatedOffer>| {
            let mut v: Vec<String> = offers.into_iter().map(|o| o.id).collect();
            v.sort();
            v
        };

        assert_eq!(ids(index.find_nearest(48.8566, 2.3522, 10_000.0)), vec!["x"]);
        assert_eq!(ids(index.find_nearest(48.8566, 2.3522, 50_000.0)), vec!["x"]);
        assert_eq!(
            ids(index.find_nearest(48.8566, 2.3522, 500_000.0)),
            vec!["x", "y"]
        );
    }

    #[test]
    fn tiny_epsilon_still_matches() {
        let index = SpatialIndex::new();
        index.add("x", date(), 48.8566, 2.3522);
        assert_eq!(index.find_nearest(48.8566, 2.3522, 1.0).len(), 1);
    }

    #[test]
    fn add_remove_list() {
        let index = SpatialIndex::new();
        index.add("a", date(), 48.0, 2.0);
        index.add("b", date(), 45.0, 4.0);
        // Re-adding replaces instead of duplicating.
        index.add("a", date(), 48.1, 2.1);
        assert_eq!(index.len(), 2);
        assert!(index.remove("a"));
        assert!(!index.remove("a"));
        assert_eq!(index.list(), vec!["b".to_string()]);
    }
}
