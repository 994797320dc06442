//! The offer store: raw offer payloads, the soft-deletion journal, the
//! per-offer location cache and the fingerprint age records, all on one
//! KV file.

use crate::error::{JobdeckError, Result};
use crate::kv::{kv_version, set_kv_version, uvarint_bytes, KvDb, Tx};
use crate::location::{read_binary_location, write_binary_location, Location};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

pub const STORE_VERSION: i64 = 3;

const OFFERS: &[u8] = b"o";
const DELETED: &[u8] = b"d";
const DELETED_KEYS: &[u8] = b"dk";
const LOCATIONS: &[u8] = b"l";
const DATES: &[u8] = b"dates";
const INITIAL_DATES: &[u8] = b"initialdates";

/// One soft deletion of an offer: the virtual id the payload was re-keyed
/// under, and when it happened.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeletedOffer {
    pub id: u64,
    pub date: String,
}

/// Offers should be deleted at most once per publication, but the remote
/// side is not under our control. Tolerate repeats by keeping a list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DeletedOffers {
    ids: Vec<DeletedOffer>,
}

/// One publication of a fingerprint: a live offer (`deleted_id == 0`) or a
/// soft-deleted one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OfferAge {
    pub id: String,
    #[serde(default)]
    pub deleted_id: u64,
    pub publication_date: DateTime<Utc>,
    #[serde(default)]
    pub deletion_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub initial_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct InitialDate {
    date: DateTime<Utc>,
    hash: String,
}

/// Derive initial publication dates for a fingerprint. Entries are walked in
/// publication order; a gap of more than seven days after the previous
/// deletion starts a new republication chain.
pub fn compute_initial_date(mut ages: Vec<OfferAge>) -> Vec<OfferAge> {
    let tolerance = Duration::days(7);
    ages.sort_by_key(|a| a.publication_date);
    let mut min_start: Option<DateTime<Utc>> = None;
    let mut updated: Vec<OfferAge> = Vec::with_capacity(ages.len());
    for (i, mut age) in ages.into_iter().enumerate() {
        if let Some(deletion) = age.deletion_date {
            if deletion < age.publication_date {
                age.deletion_date = Some(age.publication_date);
            }
        }
        if min_start.is_none() {
            min_start = Some(age.publication_date);
        } else if i > 0 {
            let prev = &updated[i - 1];
            if let Some(prev_deletion) = prev.deletion_date {
                if prev_deletion + tolerance < age.publication_date {
                    min_start = Some(age.publication_date);
                }
            }
        }
        age.initial_date = min_start;
        updated.push(age);
    }
    updated
}

fn get_json<T: serde::de::DeserializeOwned>(
    tx: &Tx,
    prefix: &[u8],
    key: &[u8],
) -> Result<Option<T>> {
    match tx.get(prefix, key)? {
        None => Ok(None),
        Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
    }
}

fn put_json<T: Serialize>(tx: &mut Tx, prefix: &[u8], key: &[u8], value: &T) -> Result<()> {
    let data = serde_json::to_vec(value)?;
    tx.put(prefix, key, &data)
}

pub struct Store {
    db: KvDb,
}

impl Store {
    /// Open or create the store under `dir`, creating the file and stamping
    /// the schema version on first use.
    pub fn open(dir: &Path) -> Result<Store> {
        let store = Store::upgrade(dir)?;
        let version = store.version()?;
        if version != STORE_VERSION {
            return Err(JobdeckError::Config(format!(
                "expected store version {}, got {}",
                STORE_VERSION, version
            )));
        }
        Ok(store)
    }

    /// Open the store without the strict version check, stamping new files.
    pub fn upgrade(dir: &Path) -> Result<Store> {
        let path = dir.join("kv");
        let exists = path.is_file();
        let db = KvDb::open(&path, 0)?;
        let store = Store { db };
        if !exists {
            store.set_version(STORE_VERSION)?;
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        self.db.path()
    }

    pub fn version(&self) -> Result<i64> {
        kv_version(&self.db, OFFERS)
    }

    pub fn set_version(&self, version: i64) -> Result<()> {
        set_kv_version(&self.db, OFFERS, version)
    }

    /// Store the raw payload of a live offer, invalidating any cached
    /// location in the same transaction.
    pub fn put(&self, id: &str, data: &[u8]) -> Result<()> {
        self.db.update(|tx| {
            tx.delete(LOCATIONS, id.as_bytes())?;
            tx.put(OFFERS, id.as_bytes(), data)
        })
    }

    pub fn get(&self, id: &str) -> Result<Option<Vec<u8>>> {
        self.db.view(|tx| tx.get(OFFERS, id.as_bytes()))
    }

    pub fn has(&self, id: &str) -> Result<bool> {
        self.db
            .view(|tx| Ok(tx.get(OFFERS, id.as_bytes())?.is_some()))
    }

    pub fn list(&self) -> Result<Vec<String>> {
        self.db.view(|tx| tx.list(OFFERS))
    }

    pub fn size(&self) -> Result<i64> {
        self.db.view(|tx| tx.size(OFFERS))
    }

    /// Soft-delete an offer: re-key its payload under a freshly allocated
    /// virtual id, journal the deletion, drop the cached location and the
    /// live record — atomically. Returns the virtual id, 0 for a no-op.
    pub fn delete(&self, id: &str, now: DateTime<Utc>) -> Result<u64> {
        self.db.update(|tx| {
            let key = id.as_bytes();
            let data = match tx.get(OFFERS, key)? {
                Some(d) => d,
                None => return Ok(0),
            };
            let deleted_id = tx.inc_seq(DELETED, 1)? as u64;
            tx.put(DELETED, &uvarint_bytes(deleted_id), &data)?;
            let mut journal: DeletedOffers =
                get_json(tx, DELETED_KEYS, key)?.unwrap_or_default();
            journal.ids.push(DeletedOffer {
                id: deleted_id,
                date: now.to_rfc3339(),
            });
            put_json(tx, DELETED_KEYS, key, &journal)?;
            tx.delete(LOCATIONS, key)?;
            tx.delete(OFFERS, key)?;
            Ok(deleted_id)
        })
    }

    pub fn list_deleted_ids(&self) -> Result<Vec<String>> {
        self.db.view(|tx| tx.list(DELETED_KEYS))
    }

    pub fn list_deleted_offers(&self, id: &str) -> Result<Vec<DeletedOffer>> {
        self.db.view(|tx| {
            let journal: Option<DeletedOffers> = get_json(tx, DELETED_KEYS, id.as_bytes())?;
            Ok(journal.map(|j| j.ids).unwrap_or_default())
        })
    }

    pub fn get_deleted(&self, deleted_id: u64) -> Result<Option<Vec<u8>>> {
        self.db
            .view(|tx| tx.get(DELETED, &uvarint_bytes(deleted_id)))
    }

    /// Cache the geocoding outcome for a live offer. `None` records an
    /// attempted-but-unresolvable lookup: the stamp is kept either way.
    pub fn put_location(
        &self,
        id: &str,
        location: Option<&Location>,
        date: DateTime<Utc>,
    ) -> Result<()> {
        self.db.update(|tx| {
            let key = id.as_bytes();
            if tx.get(OFFERS, key)?.is_none() {
                return Err(JobdeckError::NotFound(format!(
                    "cannot add location for unknown offer {}",
                    id
                )));
            }
            let mut record = Vec::new();
            if let Some(loc) = location {
                write_binary_location(&mut record, loc);
            }
            record.extend_from_slice(&date.timestamp().to_le_bytes());
            tx.put(LOCATIONS, key, &record)
        })
    }

    /// Read the cached geocoding outcome. An absent record means the offer
    /// was never geocoded; a stamp-only record means the lookup failed.
    pub fn get_location(&self, id: &str) -> Result<(Option<Location>, Option<DateTime<Utc>>)> {
        self.db.view(|tx| {
            let data = match tx.get(LOCATIONS, id.as_bytes())? {
                Some(d) => d,
                None => return Ok((None, None)),
            };
            if data.len() < 8 {
                return Err(JobdeckError::Decode(format!(
                    "invalid location record for {}",
                    id
                )));
            }
            let (location, stamp) = if data.len() == 8 {
                (None, &data[..])
            } else {
                let (loc, rest) = read_binary_location(&data)?;
                (Some(loc), rest)
            };
            if stamp.len() != 8 {
                return Err(JobdeckError::Decode(format!(
                    "invalid location stamp for {}",
                    id
                )));
            }
            let ts = i64::from_le_bytes(stamp.try_into().unwrap());
            let date = Utc
                .timestamp_opt(ts, 0)
                .single()
                .ok_or_else(|| JobdeckError::Decode(format!("invalid location stamp for {}", id)))?;
            Ok((location, Some(date)))
        })
    }

    /// Drop every cached location, forcing the next geocoding pass to start
    /// from scratch.
    pub fn delete_locations(&self) -> Result<()> {
        self.db.update(|tx| {
            for id in tx.list(LOCATIONS)? {
                tx.delete(LOCATIONS, id.as_bytes())?;
            }
            Ok(())
        })
    }

    fn get_offer_dates_tx(&self, tx: &Tx, hash: &str) -> Result<Vec<OfferAge>> {
        Ok(get_json(tx, DATES, hash.as_bytes())?.unwrap_or_default())
    }

    fn put_initial_date_tx(
        &self,
        tx: &mut Tx,
        offer_id: &str,
        hash: &str,
        date: DateTime<Utc>,
    ) -> Result<()> {
        put_json(
            tx,
            INITIAL_DATES,
            offer_id.as_bytes(),
            &InitialDate {
                date,
                hash: hash.to_string(),
            },
        )
    }

    /// Record one publication of a fingerprint, deduplicated by
    /// `(id, deleted_id)`, and refresh the per-offer initial-date pointers.
    pub fn put_offer_date(&self, hash: &str, age: OfferAge) -> Result<()> {
        self.db.update(|tx| {
            let ages = self.get_offer_dates_tx(tx, hash)?;
            // Initial dates of live offers before the update, to detect
            // pointers that must change or disappear.
            let mut before: HashMap<String, Option<DateTime<Utc>>> = HashMap::new();
            for a in &ages {
                if a.deleted_id != 0 {
                    continue;
                }
                before.insert(a.id.clone(), a.initial_date);
            }
            let mut kept: Vec<OfferAge> = ages
                .into_iter()
                .filter(|a| !(a.id == age.id && a.deleted_id == age.deleted_id))
                .collect();
            kept.push(age);
            let ages = compute_initial_date(kept);
            put_json(tx, DATES, hash.as_bytes(), &ages)?;
            for a in &ages {
                if a.deleted_id != 0 {
                    continue;
                }
                let previous = before.remove(&a.id).flatten();
                if let Some(initial) = a.initial_date {
                    if previous != Some(initial) {
                        self.put_initial_date_tx(tx, &a.id, hash, initial)?;
                    }
                }
            }
            for id in before.keys() {
                tx.delete(INITIAL_DATES, id.as_bytes())?;
            }
            Ok(())
        })
    }

    /// Replace all age records of a fingerprint at once, recomputing initial
    /// dates and rewriting the live pointers.
    pub fn put_offer_dates(&self, hash: &str, ages: Vec<OfferAge>) -> Result<()> {
        self.db.update(|tx| {
            let ages = compute_initial_date(ages);
            put_json(tx, DATES, hash.as_bytes(), &ages)?;
            for a in &ages {
                if a.deleted_id != 0 {
                    continue;
                }
                if let Some(initial) = a.initial_date {
                    self.put_initial_date_tx(tx, &a.id, hash, initial)?;
                }
            }
            Ok(())
        })
    }

    pub fn get_initial_date(&self, offer_id: &str) -> Result<Option<DateTime<Utc>>> {
        self.db.view(|tx| {
            let record: Option<InitialDate> = get_json(tx, INITIAL_DATES, offer_id.as_bytes())?;
            Ok(record.map(|r| r.date))
        })
    }

    /// Drop every age record and initial-date pointer, ahead of a rebuild.
    pub fn remove_initial_dates(&self) -> Result<()> {
        self.db.update(|tx| {
            for prefix in [DATES, INITIAL_DATES] {
                for key in tx.list(prefix)? {
                    tx.delete(prefix, key.as_bytes())?;
                }
            }
            Ok(())
        })
    }
}

/// Rebuild every fingerprint age record by walking the deleted then the
/// live offers. Returns the number of fingerprints tracked.
pub fn rebuild_offer_dates(store: &Store) -> Result<usize> {
    use crate::offer::{convert_offer, decode_offer, hash_offer};

    let mut groups: HashMap<String, Vec<OfferAge>> = HashMap::new();
    for id in store.list_deleted_ids()? {
        for deleted in store.list_deleted_offers(&id)? {
            let data = match store.get_deleted(deleted.id)? {
                Some(d) => d,
                None => continue,
            };
            let js = match decode_offer(&data) {
                Ok(js) => js,
                Err(e) => {
                    tracing::warn!("skipping deleted offer {}: {}", deleted.id, e);
                    continue;
                }
            };
            let offer = match convert_offer(&js) {
                Ok(o) => o,
                Err(e) => {
                    tracing::warn!("skipping deleted offer {}: {}", deleted.id, e);
                    continue;
                }
            };
            let deletion = match DateTime::parse_from_rfc3339(&deleted.date) {
                Ok(d) => d.with_timezone(&Utc),
                Err(e) => {
                    tracing::warn!("invalid deletion date for {}: {}", id, e);
                    continue;
                }
            };
            groups.entry(hash_offer(&js)).or_default().push(OfferAge {
                id: id.clone(),
                deleted_id: deleted.id,
                publication_date: offer.date,
                deletion_date: Some(deletion),
                initial_date: None,
            });
        }
    }
    for id in store.list()? {
        let data = match store.get(&id)? {
            Some(d) => d,
            None => continue,
        };
        let js = match decode_offer(&data) {
            Ok(js) => js,
            Err(e) => {
                tracing::warn!("skipping offer {}: {}", id, e);
                continue;
            }
        };
        let offer = match convert_offer(&js) {
            Ok(o) => o,
            Err(e) => {
                tracing::warn!("skipping offer {}: {}", id, e);
                continue;
            }
        };
        groups.entry(hash_offer(&js)).or_default().push(OfferAge {
            id: id.clone(),
            deleted_id: 0,
            publication_date: offer.date,
            deletion_date: None,
            initial_date: None,
        });
    }
    store.remove_initial_dates()?;
    let tracked = groups.len();
    for (hash, ages) in groups {
        store.put_offer_dates(&hash, ages)?;
    }
    Ok(tracked)
}
