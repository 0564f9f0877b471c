//! Ordered set of rotating record-store segments
//!
//! ```text
//! seg 0 (ro)   seg 1 (ro)   seg 2 (rw)   <- appends go here
//! [0..120)     [120..250)   [250..)      <- global record positions
//! ```
//!
//! File names come from an injected naming function so the same type serves
//! raw events, call records and goroutine records.
//!
//! A plain set freezes a segment when it rotates. A *rewritable* set keeps
//! frozen segments writable, so a record addressed by its global position can
//! be updated in place after the segment it lives in has been rotated out.

use crate::error::{Result, StoreError};
use crate::record_store::RecordStore;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// Maps a segment index to its file path
pub type SegmentNamer = Box<dyn Fn(usize) -> PathBuf + Send + Sync>;

#[derive(Debug, Default)]
struct Segments {
    stores: Vec<Arc<RecordStore>>,
    closed: bool,
}

/// Append-only sequence of [`RecordStore`] segments
pub struct SegmentSet {
    namer: SegmentNamer,
    record_size: usize,
    read_only: bool,
    rewritable: bool,
    inner: RwLock<Segments>,
}

impl std::fmt::Debug for SegmentSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentSet")
            .field("record_size", &self.record_size)
            .field("read_only", &self.read_only)
            .field("rewritable", &self.rewritable)
            .field("segments", &self.len())
            .finish()
    }
}

impl SegmentSet {
    /// Open every existing segment, probing `namer(0)`, `namer(1)`, ...
    ///
    /// All segments but the last are read-only. If nothing exists yet and the
    /// set is writable, segment 0 is created.
    pub fn open(namer: SegmentNamer, record_size: usize, read_only: bool) -> Result<Self> {
        Self::open_with(namer, record_size, read_only, false)
    }

    /// Like [`open`](Self::open), but every segment stays writable
    pub fn open_rewritable(
        namer: SegmentNamer,
        record_size: usize,
        read_only: bool,
    ) -> Result<Self> {
        Self::open_with(namer, record_size, read_only, true)
    }

    fn open_with(
        namer: SegmentNamer,
        record_size: usize,
        read_only: bool,
        rewritable: bool,
    ) -> Result<Self> {
        let mut paths = Vec::new();
        loop {
            let path = namer(paths.len());
            if !path.exists() {
                break;
            }
            paths.push(path);
        }

        let mut stores = Vec::with_capacity(paths.len().max(1));
        let last = paths.len().saturating_sub(1);
        for (i, path) in paths.into_iter().enumerate() {
            let ro = read_only || (!rewritable && i < last);
            stores.push(Arc::new(RecordStore::open(path, record_size, ro)?));
        }
        if stores.is_empty() && !read_only {
            stores.push(Arc::new(RecordStore::open(namer(0), record_size, false)?));
        }
        debug!(segments = stores.len(), read_only, rewritable, "opened segment set");

        Ok(SegmentSet {
            namer,
            record_size,
            read_only,
            rewritable,
            inner: RwLock::new(Segments {
                stores,
                closed: false,
            }),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Segments> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_lock(&self) -> RwLockWriteGuard<'_, Segments> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_size(&self) -> usize {
        self.record_size
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Number of segments
    pub fn len(&self) -> usize {
        self.read().stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Segment `i`
    pub fn index(&self, i: usize) -> Result<Arc<RecordStore>> {
        let inner = self.read();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        inner
            .stores
            .get(i)
            .cloned()
            .ok_or(StoreError::SegmentOutOfRange {
                index: i,
                segments: inner.stores.len(),
            })
    }

    /// The segment currently receiving appends
    pub fn last(&self) -> Result<Arc<RecordStore>> {
        let inner = self.read();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        inner.stores.last().cloned().ok_or(StoreError::SegmentOutOfRange {
            index: 0,
            segments: 0,
        })
    }

    /// Append to the last segment, returning `(segment, slot)`
    pub fn append<F>(&self, encode: F) -> Result<(usize, u64)>
    where
        F: FnOnce(&mut [u8]) -> std::result::Result<usize, crate::codec::CodecError>,
    {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        let inner = self.read();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        let seg = inner.stores.len() - 1;
        let slot = inner.stores[seg].append(encode)?;
        Ok((seg, slot))
    }

    /// Encode the record at global position `global`, returning `(segment, slot)`
    ///
    /// A position inside an existing segment is rewritten in place; outside
    /// the last segment that needs a rewritable set. A position at or past
    /// the end lands in the last segment, leaving any skipped slots zeroed.
    pub fn write<F>(&self, global: u64, encode: F) -> Result<(usize, u64)>
    where
        F: FnOnce(&mut [u8]) -> std::result::Result<usize, crate::codec::CodecError>,
    {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        let inner = self.read();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        let last = inner.stores.len().checked_sub(1).ok_or(StoreError::SegmentOutOfRange {
            index: 0,
            segments: 0,
        })?;

        let mut base = 0;
        let mut seg = last;
        for (i, store) in inner.stores[..last].iter().enumerate() {
            let n = store.records();
            if global < base + n {
                seg = i;
                break;
            }
            base += n;
        }
        let slot = global - base;
        inner.stores[seg].write(slot, encode)?;
        Ok((seg, slot))
    }

    /// Freeze the last segment and start a new one
    ///
    /// In a rewritable set the old segment is only flushed.
    pub fn rotate(&self) -> Result<()> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        let mut inner = self.write_lock();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        if let Some(last) = inner.stores.last() {
            if self.rewritable {
                last.flush()?;
            } else {
                last.set_read_only()?;
            }
        }
        let next = inner.stores.len();
        let path = (self.namer)(next);
        let store = RecordStore::open(&path, self.record_size, false)?;
        inner.stores.push(Arc::new(store));
        info!(segment = next, path = %path.display(), "rotated segment");
        Ok(())
    }

    /// Total records across all segments
    pub fn records(&self) -> u64 {
        self.read().stores.iter().map(|s| s.records()).sum()
    }

    /// Record counts per segment
    pub fn counts(&self) -> Vec<u64> {
        self.read().stores.iter().map(|s| s.records()).collect()
    }

    /// Global position of the first slot of segment `seg`
    pub fn base(&self, seg: usize) -> u64 {
        self.read().stores.iter().take(seg).map(|s| s.records()).sum()
    }

    /// Map a global record position to `(segment, slot)`
    pub fn locate(&self, global: u64) -> Option<(usize, u64)> {
        let mut base = 0;
        for (i, store) in self.read().stores.iter().enumerate() {
            let n = store.records();
            if global < base + n {
                return Some((i, global - base));
            }
            base += n;
        }
        None
    }

    /// Flush every segment's pending writes
    pub fn flush(&self) -> Result<()> {
        let inner = self.read();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        for store in &inner.stores {
            store.flush()?;
        }
        Ok(())
    }

    /// Close every segment
    ///
    /// Keeps going after a failure and reports the first error.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.write_lock();
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;
        let mut first = None;
        for store in &inner.stores {
            if let Err(e) = store.close() {
                first.get_or_insert(e);
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Every path this set could have written, for removal
    pub fn paths(&self) -> Vec<PathBuf> {
        self.read()
            .stores
            .iter()
            .map(|s| s.path().to_path_buf())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CodecError, SlotReader, SlotWriter};
    use std::path::Path;
    use tempfile::TempDir;

    fn namer(dir: &Path) -> SegmentNamer {
        let dir = dir.to_path_buf();
        Box::new(move |i| dir.join(format!("seg.{}.log", i)))
    }

    fn put(v: u64) -> impl FnOnce(&mut [u8]) -> std::result::Result<usize, CodecError> {
        move |buf| {
            let mut w = SlotWriter::new(buf);
            w.put_u64(v)?;
            Ok(w.position())
        }
    }

    fn get(buf: &[u8]) -> std::result::Result<u64, CodecError> {
        SlotReader::new(buf).get_u64()
    }

    #[test]
    fn test_open_creates_first_segment() {
        let dir = TempDir::new().unwrap();
        let set = SegmentSet::open(namer(dir.path()), 8, false).unwrap();
        assert_eq!(set.len(), 1);
        assert!(dir.path().join("seg.0.log").exists());
    }

    #[test]
    fn test_read_only_open_of_empty_dir_has_no_segments() {
        let dir = TempDir::new().unwrap();
        let set = SegmentSet::open(namer(dir.path()), 8, true).unwrap();
        assert!(set.is_empty());
        assert!(matches!(set.append(put(1)), Err(StoreError::ReadOnly)));
        assert!(matches!(set.write(0, put(1)), Err(StoreError::ReadOnly)));
        assert!(matches!(set.rotate(), Err(StoreError::ReadOnly)));
    }

    #[test]
    fn test_rotation_keeps_records_addressable() {
        let dir = TempDir::new().unwrap();
        let set = SegmentSet::open(namer(dir.path()), 8, false).unwrap();

        for i in 0..5 {
            set.append(put(i)).unwrap();
        }
        set.rotate().unwrap();
        for i in 5..8 {
            assert_eq!(set.append(put(i)).unwrap().0, 1);
        }

        assert_eq!(set.counts(), vec![5, 3]);
        assert_eq!(set.records(), 8);
        for global in 0..8u64 {
            let (seg, slot) = set.locate(global).unwrap();
            assert_eq!(set.index(seg).unwrap().read(slot, get).unwrap(), global);
        }
        assert!(set.locate(8).is_none());
        assert!(set.index(0).unwrap().is_read_only());
    }

    #[test]
    fn test_reopen_probes_all_segments() {
        let dir = TempDir::new().unwrap();
        {
            let set = SegmentSet::open(namer(dir.path()), 8, false).unwrap();
            set.append(put(1)).unwrap();
            set.rotate().unwrap();
            set.append(put(2)).unwrap();
            set.rotate().unwrap();
            set.close().unwrap();
        }

        let set = SegmentSet::open(namer(dir.path()), 8, false).unwrap();
        assert_eq!(set.len(), 3);
        assert!(set.index(0).unwrap().is_read_only());
        assert!(set.index(1).unwrap().is_read_only());
        assert!(!set.last().unwrap().is_read_only());
        assert_eq!(set.counts(), vec![1, 1, 0]);
    }

    #[test]
    fn test_positional_write_rewrites_frozen_segment() {
        let dir = TempDir::new().unwrap();
        let set = SegmentSet::open_rewritable(namer(dir.path()), 8, false).unwrap();

        for i in 0..3 {
            assert_eq!(set.write(i, put(i)).unwrap(), (0, i));
        }
        set.rotate().unwrap();
        assert_eq!(set.write(3, put(3)).unwrap(), (1, 0));

        // Position 1 lives in the rotated-out segment
        assert_eq!(set.write(1, put(100)).unwrap(), (0, 1));
        assert_eq!(set.counts(), vec![3, 1]);
        assert_eq!(set.index(0).unwrap().read(1, get).unwrap(), 100);
        assert_eq!(set.base(1), 3);

        // Skipped positions stay zeroed in the last segment
        assert_eq!(set.write(6, put(6)).unwrap(), (1, 3));
        assert_eq!(set.counts(), vec![3, 4]);
        assert_eq!(set.index(1).unwrap().read(1, get).unwrap(), 0);
    }

    #[test]
    fn test_rewritable_reopen_keeps_segments_writable() {
        let dir = TempDir::new().unwrap();
        {
            let set = SegmentSet::open_rewritable(namer(dir.path()), 8, false).unwrap();
            set.write(0, put(1)).unwrap();
            set.rotate().unwrap();
            set.write(1, put(2)).unwrap();
            set.close().unwrap();
        }

        let set = SegmentSet::open_rewritable(namer(dir.path()), 8, false).unwrap();
        assert!(!set.index(0).unwrap().is_read_only());
        set.write(0, put(9)).unwrap();
        set.flush().unwrap();
        assert_eq!(set.index(0).unwrap().read(0, get).unwrap(), 9);
    }

    #[test]
    fn test_plain_set_refuses_rewrite_of_frozen_segment() {
        let dir = TempDir::new().unwrap();
        let set = SegmentSet::open(namer(dir.path()), 8, false).unwrap();
        set.write(0, put(1)).unwrap();
        set.rotate().unwrap();

        assert!(matches!(set.write(0, put(2)), Err(StoreError::ReadOnly)));
        assert_eq!(set.write(1, put(2)).unwrap(), (1, 0));
    }

    #[test]
    fn test_closed_set_refuses_work() {
        let dir = TempDir::new().unwrap();
        let set = SegmentSet::open(namer(dir.path()), 8, false).unwrap();
        set.close().unwrap();
        set.close().unwrap();

        assert!(matches!(set.append(put(1)), Err(StoreError::Closed)));
        assert!(matches!(set.rotate(), Err(StoreError::Closed)));
        assert!(matches!(set.index(0), Err(StoreError::Closed)));
    }
}
