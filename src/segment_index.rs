//! Time index over log segments
//!
//! Entry `i` describes segment `i` of every segment set of a log. The last
//! entry describes the segment currently being written and is rewritten in
//! place as records arrive. The whole index lives in memory; the file is only
//! written to.
//!
//! ```text
//! slot (33 bytes): timestamp:i64 min:i64 max:i64 records:u64 writing:u8
//! ```

use crate::codec::{CodecError, SlotReader, SlotWriter};
use crate::error::{Result, StoreError};
use crate::record_store::RecordStore;
use crate::types::Time;
use serde::{Deserialize, Serialize};
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};
use tracing::debug;

/// Encoded size of a [`SegmentIndexRecord`]
pub const INDEX_RECORD_SIZE: usize = 8 * 4 + 1;

/// Boundary record for one segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentIndexRecord {
    /// Timestamp of the last raw event appended to the segment
    pub timestamp: Time,
    /// Smallest raw-event timestamp in the segment
    pub min_timestamp: Time,
    /// Largest raw-event timestamp in the segment
    pub max_timestamp: Time,
    /// Raw events in the segment
    pub records: u64,
    /// True while the segment is still receiving appends
    pub writing: bool,
}

impl SegmentIndexRecord {
    /// Boundary for a freshly opened, empty segment
    pub fn open_segment() -> Self {
        SegmentIndexRecord {
            timestamp: 0,
            min_timestamp: Time::MAX,
            max_timestamp: Time::MIN,
            records: 0,
            writing: true,
        }
    }

    /// Account for one more raw event stamped `ts`
    pub fn observe(&mut self, ts: Time) {
        self.records += 1;
        self.timestamp = ts;
        self.min_timestamp = self.min_timestamp.min(ts);
        self.max_timestamp = self.max_timestamp.max(ts);
    }

    /// Whether any event of this segment can fall inside `[start, end]`
    pub fn overlaps(&self, start: Time, end: Time) -> bool {
        self.records > 0 && self.min_timestamp <= end && self.max_timestamp >= start
    }
}

fn encode(buf: &mut [u8], rec: &SegmentIndexRecord) -> std::result::Result<usize, CodecError> {
    let mut w = SlotWriter::new(buf);
    w.put_i64(rec.timestamp)?;
    w.put_i64(rec.min_timestamp)?;
    w.put_i64(rec.max_timestamp)?;
    w.put_u64(rec.records)?;
    w.put_u8(rec.writing as u8)?;
    Ok(w.position())
}

fn decode(buf: &[u8]) -> std::result::Result<SegmentIndexRecord, CodecError> {
    let mut r = SlotReader::new(buf);
    Ok(SegmentIndexRecord {
        timestamp: r.get_i64()?,
        min_timestamp: r.get_i64()?,
        max_timestamp: r.get_i64()?,
        records: r.get_u64()?,
        writing: r.get_u8()? != 0,
    })
}

/// Append-only list of [`SegmentIndexRecord`]s backed by a record file
#[derive(Debug)]
pub struct SegmentIndex {
    store: RecordStore,
    entries: RwLock<Vec<SegmentIndexRecord>>,
}

impl SegmentIndex {
    /// Open the index file and load every entry
    pub fn load(path: impl Into<PathBuf>, read_only: bool) -> Result<Self> {
        let store = RecordStore::open(path, INDEX_RECORD_SIZE, read_only)?;
        let n = store.records();
        let mut entries = Vec::with_capacity(n as usize);
        for i in 0..n {
            entries.push(store.read(i, decode)?);
        }
        debug!(path = %store.path().display(), entries = n, "loaded segment index");
        Ok(SegmentIndex {
            store,
            entries: RwLock::new(entries),
        })
    }

    fn entries(&self) -> std::sync::RwLockReadGuard<'_, Vec<SegmentIndexRecord>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn entries_mut(&self) -> std::sync::RwLockWriteGuard<'_, Vec<SegmentIndexRecord>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a new boundary and sync it to disk
    pub fn append(&self, rec: SegmentIndexRecord) -> Result<()> {
        let mut entries = self.entries_mut();
        self.store.append(|buf| encode(buf, &rec))?;
        self.store.sync()?;
        entries.push(rec);
        Ok(())
    }

    /// Rewrite the most recent entry in place
    pub fn update_last(&self, rec: SegmentIndexRecord) -> Result<()> {
        let mut entries = self.entries_mut();
        let last = entries.len().checked_sub(1).ok_or(StoreError::RecordOutOfRange {
            index: 0,
            records: 0,
        })?;
        self.store.write(last as u64, |buf| encode(buf, &rec))?;
        entries[last] = rec;
        Ok(())
    }

    /// Apply `f` to the most recent entry and persist the result
    pub fn modify_last<F: FnOnce(&mut SegmentIndexRecord)>(&self, f: F) -> Result<SegmentIndexRecord> {
        let mut entries = self.entries_mut();
        let last = entries.len().checked_sub(1).ok_or(StoreError::RecordOutOfRange {
            index: 0,
            records: 0,
        })?;
        let mut rec = entries[last];
        f(&mut rec);
        self.store.write(last as u64, |buf| encode(buf, &rec))?;
        entries[last] = rec;
        Ok(rec)
    }

    pub fn last(&self) -> Option<SegmentIndexRecord> {
        self.entries().last().copied()
    }

    pub fn get(&self, i: usize) -> Option<SegmentIndexRecord> {
        self.entries().get(i).copied()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every entry
    pub fn snapshot(&self) -> Vec<SegmentIndexRecord> {
        self.entries().clone()
    }

    /// Call `f` with the index of each segment that may hold events in
    /// `[start, end]`, in segment order, until it returns `Break`.
    ///
    /// Pruning is per segment; the caller filters individual records.
    pub fn walk<F>(&self, start: Time, end: Time, mut f: F) -> Result<()>
    where
        F: FnMut(usize) -> Result<ControlFlow<()>>,
    {
        let candidates: Vec<usize> = self
            .entries()
            .iter()
            .enumerate()
            .filter(|(_, rec)| rec.overlaps(start, end))
            .map(|(i, _)| i)
            .collect();
        for i in candidates {
            if f(i)?.is_break() {
                break;
            }
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.store.flush()
    }

    pub fn close(&self) -> Result<()> {
        self.store.close()
    }

    pub fn path(&self) -> &std::path::Path {
        self.store.path()
    }
}
