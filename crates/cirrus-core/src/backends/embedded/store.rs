use std::io;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sled::{Batch, Db};

use super::lock::StoreLock;
use crate::context::RequestContext;
use crate::error::{BackendError, Result};
use crate::types::Document;

const FORMAT_VERSION: u32 = 2;

/// Keyspace prefixes inside a collection database.
const RECORDS: u8 = b'r';
const SORT_INDEX: u8 = b's';
const VERSION_KEY: &[u8] = b"m:version";

const REOPEN_INTERVAL: Duration = Duration::from_millis(10);

/// `(partition_key, sort_key)`.
pub type RecordId = (String, String);

/// Which records a scan visits.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexScan {
    /// Restrict to one partition key.
    pub partition: Option<String>,
    pub sort: SortMatch,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SortMatch {
    Eq(String),
    /// Half-open `[start, end)` range on the sort key.
    Range { start: String, end: String },
}

/// One collection's key/value database, `{collection}.db`.
///
/// Records live under `r | pk | sk`. A secondary keyspace `s | sk | pk` indexes
/// them by sort key, so collection and collection-group scans never touch
/// unrelated partitions. Both entries are written in one atomic batch.
///
/// Handles are cheap to clone. The process owns the store until the last
/// clone is dropped.
#[derive(Clone)]
pub struct CollectionStore {
    db: Db,
    writes: Arc<Mutex<()>>,
    _lock: Arc<StoreLock>,
}

type Entry = std::result::Result<(RecordId, Document), BackendError>;

impl CollectionStore {
    /// Open (or create) the database at `path`, waiting up to `timeout` for
    /// another owner to let go of it.
    pub fn open(path: &Path, timeout: Duration) -> std::result::Result<Self, BackendError> {
        let deadline = Instant::now() + timeout;
        let lock = StoreLock::acquire(&path.with_extension("lock"), timeout)?;
        let db = loop {
            match sled::Config::new().path(path).open() {
                Ok(db) => break db,
                // sled keeps its own file lock until a dropped handle finishes flushing.
                Err(sled::Error::Io(e))
                    if e.kind() == io::ErrorKind::Other && Instant::now() < deadline =>
                {
                    thread::sleep(REOPEN_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        };

        match db.get(VERSION_KEY)? {
            None => {
                db.insert(VERSION_KEY, &FORMAT_VERSION.to_be_bytes()[..])?;
            }
            Some(raw) => {
                let version = <[u8; 4]>::try_from(raw.as_ref())
                    .map(u32::from_be_bytes)
                    .map_err(|_| {
                        BackendError::Corrupt(format!("bad version entry in {}", path.display()))
                    })?;
                if version != FORMAT_VERSION {
                    return Err(BackendError::Corrupt(format!(
                        "unsupported format version {version} in {}",
                        path.display()
                    )));
                }
            }
        }

        Ok(Self {
            db,
            writes: Arc::new(Mutex::new(())),
            _lock: Arc::new(lock),
        })
    }

    pub fn len(&self) -> usize {
        self.db.scan_prefix([RECORDS]).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(
        &self,
        partition_key: &str,
        sort_key: &str,
    ) -> std::result::Result<Option<Document>, BackendError> {
        match self.db.get(record_key(partition_key, sort_key))? {
            Some(raw) => Ok(Some(rmp_serde::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Insert or replace a record. Nothing is written once `ctx` has expired.
    pub fn put(
        &self,
        ctx: &RequestContext,
        partition_key: &str,
        sort_key: &str,
        value: &Document,
    ) -> Result<()> {
        let bytes = rmp_serde::to_vec_named(value).map_err(BackendError::from)?;
        let mut batch = Batch::default();
        batch.insert(record_key(partition_key, sort_key), bytes);
        batch.insert(index_key(sort_key, partition_key), Vec::<u8>::new());

        let _guard = self.writes.lock();
        self.apply(ctx, batch)
    }

    /// Remove a record, returning whether it existed. Nothing is written once
    /// `ctx` has expired.
    pub fn remove(&self, ctx: &RequestContext, partition_key: &str, sort_key: &str) -> Result<bool> {
        let key = record_key(partition_key, sort_key);

        let _guard = self.writes.lock();
        if !self.db.contains_key(&key).map_err(BackendError::from)? {
            return Ok(false);
        }
        let mut batch = Batch::default();
        batch.remove(key);
        batch.remove(index_key(sort_key, partition_key));
        self.apply(ctx, batch)?;
        Ok(true)
    }

    fn apply(&self, ctx: &RequestContext, batch: Batch) -> Result<()> {
        ctx.check()?;
        self.db.apply_batch(batch).map_err(BackendError::from)?;
        self.db.flush().map_err(BackendError::from)?;
        Ok(())
    }

    /// Records selected by `scan`. Scans inside one partition come back in
    /// sort-key order, the others in `(sort_key, partition_key)` order.
    pub fn scan(&self, scan: &IndexScan) -> Box<dyn Iterator<Item = Entry> + '_> {
        match (&scan.partition, &scan.sort) {
            (Some(pk), SortMatch::Eq(sk)) => match self.get(pk, sk) {
                Ok(Some(doc)) => Box::new(std::iter::once(Ok(((pk.clone(), sk.clone()), doc)))),
                Ok(None) => Box::new(std::iter::empty()),
                Err(e) => Box::new(std::iter::once(Err(e))),
            },
            (Some(pk), SortMatch::Range { start, end }) => {
                if start >= end {
                    return Box::new(std::iter::empty());
                }
                let mut lo = vec![RECORDS];
                push_component(&mut lo, pk);
                let mut hi = lo.clone();
                push_escaped(&mut lo, start);
                push_escaped(&mut hi, end);
                Box::new(self.db.range(lo..hi).map(|item| {
                    let (key, value) = item?;
                    let id = split_key(&key[1..])?;
                    Ok((id, rmp_serde::from_slice(&value)?))
                }))
            }
            (None, SortMatch::Eq(sk)) => {
                let mut prefix = vec![SORT_INDEX];
                push_component(&mut prefix, sk);
                self.follow_index(self.db.scan_prefix(prefix))
            }
            (None, SortMatch::Range { start, end }) => {
                if start >= end {
                    return Box::new(std::iter::empty());
                }
                let mut lo = vec![SORT_INDEX];
                let mut hi = lo.clone();
                push_escaped(&mut lo, start);
                push_escaped(&mut hi, end);
                self.follow_index(self.db.range(lo..hi))
            }
        }
    }

    /// Resolve sort-index entries to their records.
    fn follow_index(&self, entries: sled::Iter) -> Box<dyn Iterator<Item = Entry> + '_> {
        Box::new(entries.filter_map(move |item| {
            let lookup = || -> std::result::Result<Option<(RecordId, Document)>, BackendError> {
                let (key, _) = item?;
                let (sk, pk) = split_key(&key[1..])?;
                Ok(self.get(&pk, &sk)?.map(|doc| ((pk, sk), doc)))
            };
            lookup().transpose()
        }))
    }
}

fn record_key(partition_key: &str, sort_key: &str) -> Vec<u8> {
    let mut key = vec![RECORDS];
    push_component(&mut key, partition_key);
    push_component(&mut key, sort_key);
    key
}

fn index_key(sort_key: &str, partition_key: &str) -> Vec<u8> {
    let mut key = vec![SORT_INDEX];
    push_component(&mut key, sort_key);
    push_component(&mut key, partition_key);
    key
}

/// Order-preserving escape: `0x00` becomes `0x00 0xff`.
fn push_escaped(buf: &mut Vec<u8>, s: &str) {
    for b in s.bytes() {
        buf.push(b);
        if b == 0 {
            buf.push(0xff);
        }
    }
}

/// Escaped string followed by the `0x00 0x00` terminator.
fn push_component(buf: &mut Vec<u8>, s: &str) {
    push_escaped(buf, s);
    buf.extend_from_slice(&[0, 0]);
}

/// Decode two consecutive components.
fn split_key(mut raw: &[u8]) -> std::result::Result<(String, String), BackendError> {
    let first = take_component(&mut raw)?;
    let second = take_component(&mut raw)?;
    Ok((first, second))
}

fn take_component(raw: &mut &[u8]) -> std::result::Result<String, BackendError> {
    let corrupt = || BackendError::Corrupt("malformed record key".to_string());
    let mut out = Vec::new();
    let mut i = 0;
    loop {
        match raw.get(i) {
            Some(0) => match raw.get(i + 1) {
                Some(0) => break,
                Some(0xff) => {
                    out.push(0);
                    i += 2;
                }
                _ => return Err(corrupt()),
            },
            Some(&b) => {
                out.push(b);
                i += 1;
            }
            None => return Err(corrupt()),
        }
    }
    *raw = &raw[i + 2..];
    String::from_utf8(out).map_err(|_| corrupt())
}
