//! Durable FIFO of indexing operations, on its own KV file.
//!
//! Entries are keyed by their varint-encoded sequence number; a persisted
//! cursor marks the oldest undeleted entry, so consumers survive restarts
//! without reindexing everything.

use crate::error::Result;
use crate::kv::{uvarint, uvarint_bytes, KvDb, Tx};
use serde::{Deserialize, Serialize};
use std::path::Path;

const QUEUED: &[u8] = b"q";
const MIN_SEQ: &[u8] = b"s";
const MIN_SEQ_KEY: &[u8] = b"m";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    Add,
    Remove,
}

/// A single indexing operation on one document. `seq` is assigned by
/// [`IndexQueue::queue_many`]; callers leave it zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Queued {
    #[serde(default)]
    pub seq: u64,
    pub id: String,
    pub op: Op,
}

impl Queued {
    pub fn add(id: &str) -> Queued {
        Queued {
            seq: 0,
            id: id.to_string(),
            op: Op::Add,
        }
    }

    pub fn remove(id: &str) -> Queued {
        Queued {
            seq: 0,
            id: id.to_string(),
            op: Op::Remove,
        }
    }
}

pub struct IndexQueue {
    db: KvDb,
}

fn get_min_seq(tx: &Tx) -> Result<Option<u64>> {
    let data = match tx.get(MIN_SEQ, MIN_SEQ_KEY)? {
        Some(d) => d,
        None => return Ok(None),
    };
    match uvarint(&data) {
        Some((seq, _)) if seq != 0 => Ok(Some(seq)),
        _ => Ok(None),
    }
}

fn put_min_seq(tx: &mut Tx, seq: u64) -> Result<()> {
    tx.put(MIN_SEQ, MIN_SEQ_KEY, &uvarint_bytes(seq))
}

impl IndexQueue {
    pub fn open(dir: &Path) -> Result<IndexQueue> {
        let db = KvDb::open(&dir.join("kv"), 0)?;
        Ok(IndexQueue { db })
    }

    pub fn path(&self) -> &Path {
        self.db.path()
    }

    /// Append operations in order, allocating one sequence per item. The
    /// consumer cursor is initialized on the very first insert.
    pub fn queue_many(&self, items: Vec<Queued>) -> Result<()> {
        self.db.update(|tx| {
            for (i, mut item) in items.into_iter().enumerate() {
                let seq = tx.inc_seq(QUEUED, 1)? as u64;
                item.seq = seq;
                if i == 0 && get_min_seq(tx)?.is_none() {
                    put_min_seq(tx, seq)?;
                }
                let data = serde_json::to_vec(&item)?;
                tx.put(QUEUED, &uvarint_bytes(seq), &data)?;
            }
            Ok(())
        })
    }

    /// Read up to `count` entries from the cursor, without consuming them.
    pub fn fetch_many(&self, count: usize) -> Result<Vec<Queued>> {
        self.db.view(|tx| {
            let mut queued = Vec::new();
            let mut seq = match get_min_seq(tx)? {
                Some(s) => s,
                None => return Ok(queued),
            };
            for _ in 0..count {
                let data = match tx.get(QUEUED, &uvarint_bytes(seq))? {
                    Some(d) => d,
                    None => break,
                };
                queued.push(serde_json::from_slice(&data)?);
                seq += 1;
            }
            Ok(queued)
        })
    }

    /// Consume up to `count` entries, advancing the cursor.
    pub fn delete_many(&self, count: usize) -> Result<()> {
        self.db.update(|tx| {
            let mut seq = match get_min_seq(tx)? {
                Some(s) => s,
                None => return Ok(()),
            };
            for _ in 0..count {
                let key = uvarint_bytes(seq);
                if tx.get(QUEUED, &key)?.is_none() {
                    break;
                }
                tx.delete(QUEUED, &key)?;
                seq += 1;
            }
            put_min_seq(tx, seq)
        })
    }

    pub fn size(&self) -> Result<i64> {
        self.db.view(|tx| {
            // The cursor record lives under its own prefix, so the bucket
            // count is exactly the number of queued entries.
            let queued = tx.size(QUEUED)?;
            Ok(queued)
        })
    }
}
