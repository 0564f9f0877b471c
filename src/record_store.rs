//! Fixed-size record file
//!
//! A `RecordStore` is one binary file of equally sized slots. Slot `i` lives at
//! byte offset `i * record_size`. Records are encoded by a caller-supplied
//! closure, so the store never needs to know what it holds. The closure fills
//! a scratch slot that is copied into the write window only if encoding
//! succeeds; a failed rewrite leaves the slot's previous bytes in place.
//!
//! The record counter is an atomic so [`RecordStore::records`] never takes the
//! store lock; every other operation serializes on one mutex guarding the file
//! handle and both buffer windows.

use crate::buffer::{ReadWindow, WriteWindow, DEFAULT_WINDOW_SIZE};
use crate::codec::CodecError;
use crate::error::{Result, StoreError};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

#[derive(Debug)]
struct Inner {
    file: Option<File>,
    write: WriteWindow,
    read: ReadWindow,
    scratch: Vec<u8>,
    read_only: bool,
}

/// Binary file of fixed-size record slots
#[derive(Debug)]
pub struct RecordStore {
    path: PathBuf,
    record_size: usize,
    records: AtomicU64,
    closed: AtomicBool,
    inner: Mutex<Inner>,
}

impl RecordStore {
    /// Open (creating if writable and missing) the store at `path`
    ///
    /// The record count is derived from the file size; a trailing partial slot
    /// left by a crash is ignored and overwritten by the next append.
    pub fn open(path: impl Into<PathBuf>, record_size: usize, read_only: bool) -> Result<Self> {
        let path = path.into();
        let file = if read_only {
            File::open(&path)?
        } else {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?
        };
        let size = file.metadata()?.len();
        let records = size / record_size as u64;
        debug!(path = %path.display(), records, read_only, "opened record store");

        let window = DEFAULT_WINDOW_SIZE.max(record_size);
        Ok(RecordStore {
            record_size,
            records: AtomicU64::new(records),
            closed: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                file: Some(file),
                write: WriteWindow::new(window, records * record_size as u64),
                read: ReadWindow::new(window),
                scratch: vec![0; record_size],
                read_only,
            }),
            path,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_size(&self) -> usize {
        self.record_size
    }

    /// Number of records, including buffered ones (lock-free)
    pub fn records(&self) -> u64 {
        self.records.load(Ordering::Acquire)
    }

    pub fn is_read_only(&self) -> bool {
        self.lock().read_only
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Logical size in bytes, counting records still in the write window
    pub fn size(&self) -> u64 {
        self.records() * self.record_size as u64
    }

    /// Encode one record into slot `idx`
    ///
    /// `encode` receives a zeroed buffer of exactly `record_size` bytes and
    /// returns how many it used. Rewriting an existing slot is allowed.
    pub fn write<F>(&self, idx: u64, encode: F) -> Result<()>
    where
        F: FnOnce(&mut [u8]) -> std::result::Result<usize, CodecError>,
    {
        let mut inner = self.lock();
        self.write_slot(&mut inner, idx, encode)
    }

    /// Append a record and return its slot index
    pub fn append<F>(&self, encode: F) -> Result<u64>
    where
        F: FnOnce(&mut [u8]) -> std::result::Result<usize, CodecError>,
    {
        // Hold the lock across the count read so concurrent appends get
        // distinct slots.
        let mut inner = self.lock();
        let idx = self.records();
        self.write_slot(&mut inner, idx, encode)?;
        Ok(idx)
    }

    fn write_slot<F>(&self, inner: &mut Inner, idx: u64, encode: F) -> Result<()>
    where
        F: FnOnce(&mut [u8]) -> std::result::Result<usize, CodecError>,
    {
        let Inner {
            file,
            write,
            scratch,
            read_only,
            ..
        } = inner;
        let file = file.as_mut().ok_or(StoreError::Closed)?;
        if *read_only {
            return Err(StoreError::ReadOnly);
        }

        scratch.fill(0);
        encode(scratch.as_mut_slice()).map_err(|e| e.into_store_error(&self.path))?;

        let size = self.record_size;
        write.seek(file, idx * size as u64, size)?;
        write.slot_mut(size).copy_from_slice(&scratch[..]);
        write.commit(size);

        self.records.fetch_max(idx + 1, Ordering::AcqRel);
        Ok(())
    }

    /// Decode slot `idx`
    ///
    /// Pending writes are flushed first so the read observes them.
    pub fn read<T, F>(&self, idx: u64, decode: F) -> Result<T>
    where
        F: FnOnce(&[u8]) -> std::result::Result<T, CodecError>,
    {
        let records = self.records();
        if idx >= records {
            return Err(StoreError::RecordOutOfRange {
                index: idx,
                records,
            });
        }

        let mut inner = self.lock();
        let Inner {
            file, write, read, ..
        } = &mut *inner;
        let file = file.as_mut().ok_or(StoreError::Closed)?;
        if let Some((start, end)) = write.flush(file)? {
            read.invalidate(start, end);
        }

        let size = self.record_size;
        let bytes = read.read_at(file, idx * size as u64, size)?;
        decode(bytes).map_err(|e| e.into_store_error(&self.path))
    }

    /// Push buffered writes to the file
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.lock();
        let Inner {
            file, write, read, ..
        } = &mut *inner;
        let file = file.as_mut().ok_or(StoreError::Closed)?;
        if let Some((start, end)) = write.flush(file)? {
            read.invalidate(start, end);
        }
        Ok(())
    }

    /// Flush and fsync
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.lock();
        let Inner {
            file, write, read, ..
        } = &mut *inner;
        let file = file.as_mut().ok_or(StoreError::Closed)?;
        if let Some((start, end)) = write.flush(file)? {
            read.invalidate(start, end);
        }
        file.sync_data()?;
        Ok(())
    }

    /// Stop accepting writes, flushing what is buffered
    pub fn set_read_only(&self) -> Result<()> {
        let mut inner = self.lock();
        let Inner {
            file,
            write,
            read,
            read_only,
            ..
        } = &mut *inner;
        let file = file.as_mut().ok_or(StoreError::Closed)?;
        if let Some((start, end)) = write.flush(file)? {
            read.invalidate(start, end);
        }
        *read_only = true;
        Ok(())
    }

    /// Flush and release the file handle
    ///
    /// Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.lock();
        let Inner { file, write, .. } = &mut *inner;
        let Some(mut f) = file.take() else {
            return Ok(());
        };
        self.closed.store(true, Ordering::Release);
        write.flush(&mut f)?;
        debug!(path = %self.path.display(), records = self.records(), "closed record store");
        Ok(())
    }
}
