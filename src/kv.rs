//! Transactional key/value substrate shared by the offer store, the index
//! queue and the geocoder cache.
//!
//! Values are split into fixed-size chunks stored under composite keys:
//! `prefix | 0 | key | 0 | chunk-index`, where the chunk index is a varint
//! encoded in a fixed five-byte zone starting at 1. Every chunk but the last
//! is exactly `max_chunk` bytes long and carries `max_chunk - 1` payload
//! bytes; a zero-length value is a single zero-length chunk, distinguishable
//! from absence. Per-prefix sequence and size counters live beside the data
//! under `prefix-seq` and `prefix-n` keys, outside the chunk namespace.

use crate::error::{JobdeckError, Result};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

const TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("kv");

/// Default chunk size, sized to fit a database page with key overhead.
pub const MAX_CHUNK: usize = 65787;

const VARINT_ZONE: usize = 5;

/// Suffix identifying the first chunk of a value: the key separator followed
/// by varint(1) padded to the zone width.
const FIRST_CHUNK_SUFFIX: [u8; 6] = [0, 1, 0, 0, 0, 0];

pub(crate) fn put_uvarint(buf: &mut [u8], mut v: u64) -> usize {
    let mut i = 0;
    while v >= 0x80 {
        buf[i] = (v as u8) | 0x80;
        v >>= 7;
        i += 1;
    }
    buf[i] = v as u8;
    i + 1
}

pub(crate) fn uvarint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut v = 0u64;
    let mut shift = 0;
    for (i, &b) in buf.iter().enumerate() {
        if b < 0x80 {
            if i >= 10 {
                return None;
            }
            return Some((v | (u64::from(b) << shift), i + 1));
        }
        v |= u64::from(b & 0x7f) << shift;
        shift += 7;
        if shift >= 64 {
            return None;
        }
    }
    None
}

/// Encode a u64 as a plain varint, used to key deleted offers and queue
/// entries by sequence number.
pub(crate) fn uvarint_bytes(v: u64) -> Vec<u8> {
    let mut buf = [0u8; 10];
    let n = put_uvarint(&mut buf, v);
    buf[..n].to_vec()
}

/// Generator for the composite chunk keys of one logical value.
struct ChunkKeys {
    buf: Vec<u8>,
    prefix_len: usize,
    i: u32,
}

impl ChunkKeys {
    fn new(prefix: &[u8], key: &[u8]) -> ChunkKeys {
        let prefix_len = prefix.len() + 1 + key.len() + 1;
        let mut buf = vec![0u8; prefix_len + VARINT_ZONE];
        buf[..prefix.len()].copy_from_slice(prefix);
        buf[prefix.len() + 1..prefix.len() + 1 + key.len()].copy_from_slice(key);
        ChunkKeys {
            buf,
            prefix_len,
            i: 0,
        }
    }

    fn next(&mut self) -> Vec<u8> {
        self.i += 1;
        let zone = &mut self.buf[self.prefix_len..];
        zone.fill(0);
        put_uvarint(zone, u64::from(self.i));
        self.buf.clone()
    }
}

fn size_key(prefix: &[u8]) -> Vec<u8> {
    let mut k = prefix.to_vec();
    k.extend_from_slice(b"-n");
    k
}

fn seq_key(prefix: &[u8]) -> Vec<u8> {
    let mut k = prefix.to_vec();
    k.extend_from_slice(b"-seq");
    k
}

enum TxTable<'a> {
    Read(redb::ReadOnlyTable<&'static [u8], &'static [u8]>),
    Write(redb::Table<'a, &'static [u8], &'static [u8]>),
}

/// A transaction over one KV file. Obtained through [`KvDb::view`] (shared,
/// read-only) or [`KvDb::update`] (exclusive, committed on success).
pub struct Tx<'a> {
    table: TxTable<'a>,
    max_chunk: usize,
}

impl Tx<'_> {
    fn raw_get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let guard = match &self.table {
            TxTable::Read(t) => t.get(key)?,
            TxTable::Write(t) => t.get(key)?,
        };
        Ok(guard.map(|g| g.value().to_vec()))
    }

    fn raw_insert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        match &mut self.table {
            TxTable::Write(t) => {
                t.insert(key, value)?;
                Ok(())
            }
            TxTable::Read(_) => panic!("writing through a read-only transaction"),
        }
    }

    fn raw_remove(&mut self, key: &[u8]) -> Result<()> {
        match &mut self.table {
            TxTable::Write(t) => {
                t.remove(key)?;
                Ok(())
            }
            TxTable::Read(_) => panic!("deleting through a read-only transaction"),
        }
    }

    fn scan_keys(&self, lo: &[u8], hi: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut keys = Vec::new();
        match &self.table {
            TxTable::Read(t) => {
                for item in t.range::<&[u8]>(lo..hi)? {
                    let (k, _) = item?;
                    keys.push(k.value().to_vec());
                }
            }
            TxTable::Write(t) => {
                for item in t.range::<&[u8]>(lo..hi)? {
                    let (k, _) = item?;
                    keys.push(k.value().to_vec());
                }
            }
        }
        Ok(keys)
    }

    fn all_keys(&self) -> Result<Vec<Vec<u8>>> {
        let mut keys = Vec::new();
        match &self.table {
            TxTable::Read(t) => {
                for item in t.iter()? {
                    let (k, _) = item?;
                    keys.push(k.value().to_vec());
                }
            }
            TxTable::Write(t) => {
                for item in t.iter()? {
                    let (k, _) = item?;
                    keys.push(k.value().to_vec());
                }
            }
        }
        Ok(keys)
    }

    fn read_counter(&self, key: &[u8]) -> Result<i64> {
        match self.raw_get(key)? {
            Some(data) if data.len() == 8 => {
                let mut b = [0u8; 8];
                b.copy_from_slice(&data);
                Ok(i64::from_le_bytes(b))
            }
            _ => Ok(0),
        }
    }

    fn add_counter(&mut self, key: &[u8], delta: i64) -> Result<i64> {
        let value = self.read_counter(key)? + delta;
        self.raw_insert(key, &value.to_le_bytes())?;
        Ok(value)
    }

    /// Reassemble a chunked value. Returns `None` when the key is absent;
    /// an empty vector is a stored empty value.
    pub fn get(&self, prefix: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut keys = ChunkKeys::new(prefix, key);
        let mut value: Option<Vec<u8>> = None;
        loop {
            let k = keys.next();
            let data = match self.raw_get(&k)? {
                Some(d) => d,
                None => break,
            };
            let full = data.len() == self.max_chunk;
            match value.as_mut() {
                None => value = Some(data),
                Some(v) => v.extend_from_slice(&data),
            }
            if !full {
                break;
            }
            // Drop the sentinel byte closing a full chunk.
            let v = value.as_mut().unwrap();
            v.truncate(v.len() - 1);
        }
        Ok(value)
    }

    /// Store a value, replacing any previous chain. The previous chain is
    /// deleted first because it may be longer than the new one.
    pub fn put(&mut self, prefix: &[u8], key: &[u8], value: &[u8]) -> Result<()> {
        if matches!(self.table, TxTable::Read(_)) {
            panic!("writing through a read-only transaction");
        }
        self.delete(prefix, key)?;
        let mut keys = ChunkKeys::new(prefix, key);
        let mut rest = value;
        loop {
            if rest.len() >= self.max_chunk {
                let take = self.max_chunk - 1;
                let mut chunk = Vec::with_capacity(self.max_chunk);
                chunk.extend_from_slice(&rest[..take]);
                chunk.push(0);
                rest = &rest[take..];
                let k = keys.next();
                self.raw_insert(&k, &chunk)?;
            } else {
                let k = keys.next();
                self.raw_insert(&k, rest)?;
                break;
            }
        }
        self.add_counter(&size_key(prefix), 1)?;
        Ok(())
    }

    /// Delete a value chain. A no-op when the key is absent; the size
    /// counter is only decremented when a terminating chunk is removed.
    pub fn delete(&mut self, prefix: &[u8], key: &[u8]) -> Result<()> {
        if matches!(self.table, TxTable::Read(_)) {
            panic!("deleting through a read-only transaction");
        }
        let mut keys = ChunkKeys::new(prefix, key);
        loop {
            let k = keys.next();
            let data = match self.raw_get(&k)? {
                Some(d) => d,
                None => break,
            };
            self.raw_remove(&k)?;
            if data.len() < self.max_chunk {
                self.add_counter(&size_key(prefix), -1)?;
                break;
            }
        }
        Ok(())
    }

    /// List logical keys under a prefix in lexicographic order.
    pub fn list(&self, prefix: &[u8]) -> Result<Vec<String>> {
        let mut lo = prefix.to_vec();
        lo.push(0);
        let mut hi = prefix.to_vec();
        hi.push(1);
        let mut names = Vec::new();
        for k in self.scan_keys(&lo, &hi)? {
            if !k.ends_with(&FIRST_CHUNK_SUFFIX) {
                // Only the starting chunk names the value.
                continue;
            }
            let name = &k[lo.len()..k.len() - FIRST_CHUNK_SUFFIX.len()];
            names.push(String::from_utf8_lossy(name).into_owned());
        }
        Ok(names)
    }

    /// Increment the durable sequence counter of a prefix and return the new
    /// value. Sequences are strictly monotonic and never reused.
    pub fn inc_seq(&mut self, prefix: &[u8], delta: i64) -> Result<i64> {
        if matches!(self.table, TxTable::Read(_)) {
            panic!("incrementing a sequence through a read-only transaction");
        }
        self.add_counter(&seq_key(prefix), delta)
    }

    pub fn get_seq(&self, prefix: &[u8]) -> Result<i64> {
        self.read_counter(&seq_key(prefix))
    }

    /// Number of logical values under a prefix, maintained incrementally by
    /// `put`/`delete` and recomputable with [`Tx::update_size`].
    pub fn size(&self, prefix: &[u8]) -> Result<i64> {
        self.read_counter(&size_key(prefix))
    }

    /// Enumerate the distinct prefixes holding at least one value.
    pub fn list_prefixes(&self) -> Result<Vec<Vec<u8>>> {
        let mut prefixes: Vec<Vec<u8>> = Vec::new();
        for k in self.all_keys()? {
            let pos = match k.iter().position(|&b| b == 0) {
                Some(p) => p,
                None => continue,
            };
            if prefixes.last().map(|p| p.as_slice()) == Some(&k[..pos]) {
                continue;
            }
            prefixes.push(k[..pos].to_vec());
        }
        Ok(prefixes)
    }

    /// Recompute every per-prefix size counter from the stored first chunks.
    pub fn update_size(&mut self) -> Result<()> {
        if matches!(self.table, TxTable::Read(_)) {
            panic!("updating sizes through a read-only transaction");
        }
        for prefix in self.list_prefixes()? {
            let mut lo = prefix.clone();
            lo.push(0);
            let mut hi = prefix.clone();
            hi.push(1);
            let count = self
                .scan_keys(&lo, &hi)?
                .iter()
                .filter(|k| k.ends_with(&FIRST_CHUNK_SUFFIX))
                .count() as i64;
            self.raw_insert(&size_key(&prefix), &count.to_le_bytes())?;
        }
        Ok(())
    }
}

/// One KV file. A process-wide read-write latch serializes writers on top of
/// the underlying single-writer database.
pub struct KvDb {
    db: Database,
    lock: RwLock<()>,
    max_chunk: usize,
    path: PathBuf,
}

impl KvDb {
    /// Open or create the database at `path`. `max_chunk <= 1` selects the
    /// default chunk size.
    pub fn open(path: &Path, max_chunk: usize) -> Result<KvDb> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;
        let wtx = db.begin_write()?;
        {
            let _ = wtx.open_table(TABLE)?;
        }
        wtx.commit()?;
        let max_chunk = if max_chunk <= 1 { MAX_CHUNK } else { max_chunk };
        Ok(KvDb {
            db,
            lock: RwLock::new(()),
            max_chunk,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a read-only action over a consistent snapshot. Mutating calls on
    /// the transaction panic — that is a programmer error.
    pub fn view<T>(&self, action: impl FnOnce(&mut Tx) -> Result<T>) -> Result<T> {
        let _guard = self
            .lock
            .read()
            .map_err(|_| JobdeckError::Storage("kv latch poisoned".into()))?;
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(TABLE)?;
        let mut tx = Tx {
            table: TxTable::Read(table),
            max_chunk: self.max_chunk,
        };
        action(&mut tx)
    }

    /// Run a mutating action in a transaction, committed on `Ok` and rolled
    /// back on `Err` or panic.
    pub fn update<T>(&self, action: impl FnOnce(&mut Tx) -> Result<T>) -> Result<T> {
        let _guard = self
            .lock
            .write()
            .map_err(|_| JobdeckError::Storage("kv latch poisoned".into()))?;
        let wtx = self.db.begin_write()?;
        let result = {
            let table = wtx.open_table(TABLE)?;
            let mut tx = Tx {
                table: TxTable::Write(table),
                max_chunk: self.max_chunk,
            };
            action(&mut tx)
        };
        match result {
            Ok(value) => {
                wtx.commit()?;
                Ok(value)
            }
            Err(e) => {
                let _ = wtx.abort();
                Err(e)
            }
        }
    }
}

/// Read the schema version kept in a prefix sequence counter.
pub fn kv_version(db: &KvDb, prefix: &[u8]) -> Result<i64> {
    db.view(|tx| tx.get_seq(prefix))
}

/// Stamp a schema version, refusing downgrades.
pub fn set_kv_version(db: &KvDb, prefix: &[u8], version: i64) -> Result<()> {
    db.update(|tx| {
        let current = tx.get_seq(prefix)?;
        if current > version {
            return Err(JobdeckError::VersionDowngrade {
                current,
                requested: version,
            });
        }
        if current == version {
            return Ok(());
        }
        tx.inc_seq(prefix, version - current)?;
        Ok(())
    })
}
