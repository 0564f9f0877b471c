//! Log orchestrator: one trace session on disk
//!
//! A [`Log`] ties together everything stored for one [`LogId`]:
//!
//! ```text
//!                   append_raw_event()
//!                          │
//!          ┌───────────────┼─────────────────┐
//!          ▼               ▼                 ▼
//!   raw segments     segment index     StateSimulator
//!   (.rawfunc.log)   (.index)                │ flush_state() (before rotation, at close)
//!                                            ▼
//!                              call segments + goroutine segments
//!                              (.func.log)     (.goroutine.log)
//!
//!   append_symbols() ──► SymbolTable ──► symbol delta file (.symbol)
//! ```
//!
//! All three segment sets and the index rotate together. Raw segment `i` and
//! index entry `i` describe the same period. Call and goroutine records live
//! at the global slot equal to their ID (call ID, GID): a call that is still
//! running when its segment rotates out is rewritten in place there once it
//! ends, so every call and goroutine is stored exactly once.
//!
//! # Locking
//!
//! - `inner` (RwLock): metadata, version, closed flag and the open components.
//!   Only `open`, `close` and `update_metadata` take the write side.
//! - `writer` (Mutex): raw-event ID assignment, index updates and state
//!   flushes. Never held while acquiring `inner`.
//! - `rotating` (Mutex + Condvar): at most one rotation runs; concurrent
//!   requests wait for it instead of rotating again.

use crate::codec::{
    decode_call_record, decode_call_record_into, decode_goroutine, decode_raw_event,
    decode_raw_event_into, encode_call_record, encode_goroutine, encode_raw_event, CodecError,
    CALL_RECORD_SIZE, GOROUTINE_SIZE, RAW_EVENT_SIZE,
};
use crate::config::Config;
use crate::dir_layout::DirLayout;
use crate::error::{Result, StoreError};
use crate::frame_pool::FramePoolConfig;
use crate::segment_index::{SegmentIndex, SegmentIndexRecord};
use crate::segment_set::{SegmentNamer, SegmentSet};
use crate::simulator::StateSimulator;
use crate::symbols::{FuncId, SymbolTable, SymbolsData};
use crate::symbols_file::{self, SymbolsWriter};
use crate::types::{
    now, CallId, CallRecord, Gid, GoroutineRecord, LogId, RawEvent, RawEventId, Time,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Callback run before the segments rotate
pub type BeforeRotate = Arc<dyn Fn() + Send + Sync>;

/// What exists on disk for a log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogStatus {
    /// Some but not all of the expected files exist
    Broken,
    /// Nothing has been written yet
    NotCreated,
    /// Every expected file exists
    Created,
}

impl fmt::Display for LogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            LogStatus::Broken => "broken",
            LogStatus::NotCreated => "not-created",
            LogStatus::Created => "created",
        })
    }
}

/// Per-item presentation settings kept for UIs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UiItemConfig {
    pub pinned: bool,
    pub masked: bool,
    pub comment: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct UiConfig {
    pub func_calls: BTreeMap<CallId, UiItemConfig>,
    pub funcs: BTreeMap<FuncId, UiItemConfig>,
    pub goroutines: BTreeMap<Gid, UiItemConfig>,
}

/// Mutable, versioned metadata of a log (`meta/<id>.meta.json`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogMetadata {
    /// Timestamp of the last raw event, or the creation time of an empty log
    pub timestamp: Time,
    pub ui: UiConfig,
}

/// Point-in-time description of a log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LogInfo {
    #[serde(rename = "log-id")]
    pub id: LogId,
    pub version: u64,
    pub metadata: LogMetadata,
    pub max_segment_size: u64,
    pub read_only: bool,
}

/// Components that exist only while the log is open
struct Parts {
    symbols: Arc<SymbolTable>,
    symbols_writer: Option<SymbolsWriter>,
    index: SegmentIndex,
    raw: SegmentSet,
    calls: SegmentSet,
    goroutines: SegmentSet,
}

struct Inner {
    metadata: LogMetadata,
    version: u64,
    closed: bool,
    parts: Option<Arc<Parts>>,
}

#[derive(Default)]
struct WriterState {
    next_raw_id: RawEventId,
    scratch: RawEvent,
}

/// One trace session: raw events, reconstructed records, symbols and index
pub struct Log {
    id: LogId,
    layout: DirLayout,
    max_segment_size: u64,
    read_only: bool,
    before_rotate: Mutex<Option<BeforeRotate>>,
    inner: RwLock<Inner>,
    writer: Mutex<WriterState>,
    rotating: Mutex<bool>,
    rotation_done: Condvar,
    simulator: Arc<StateSimulator>,
}

impl fmt::Debug for Log {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Log")
            .field("id", &self.id)
            .field("root", &self.layout.root())
            .field("max_segment_size", &self.max_segment_size)
            .field("read_only", &self.read_only)
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn remove_if_exists(path: &std::path::Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Decode every slot of `segments` of `set` into `item` and hand the ones
/// holding a record to `f`
///
/// `decode` gets the slot's global position and returns whether the slot
/// holds a record.
fn walk_segments<T, D, F>(
    set: &SegmentSet,
    segments: impl Iterator<Item = usize>,
    item: &mut T,
    decode: D,
    f: &mut F,
) -> Result<ControlFlow<()>>
where
    D: Fn(u64, &[u8], &mut T) -> std::result::Result<bool, CodecError>,
    F: FnMut(&T) -> Result<ControlFlow<()>>,
{
    for seg in segments {
        let store = set.index(seg)?;
        let base = set.base(seg);
        for slot in 0..store.records() {
            let present = store.read(slot, |buf| decode(base + slot, buf, item))?;
            if present && f(item)?.is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
    }
    Ok(ControlFlow::Continue(()))
}

fn decode_raw_slot(
    _: u64,
    buf: &[u8],
    ev: &mut RawEvent,
) -> std::result::Result<bool, CodecError> {
    decode_raw_event_into(buf, ev)?;
    Ok(true)
}

/// Call IDs equal slot positions; a zeroed slot past position 0 fails that check
fn decode_call_slot(
    pos: u64,
    buf: &[u8],
    rec: &mut CallRecord,
) -> std::result::Result<bool, CodecError> {
    decode_call_record_into(buf, rec)?;
    Ok(rec.id == pos)
}

fn decode_goroutine_slot(
    _: u64,
    buf: &[u8],
    g: &mut GoroutineRecord,
) -> std::result::Result<bool, CodecError> {
    Ok(match decode_goroutine(buf)? {
        Some(record) => {
            *g = record;
            true
        }
        None => false,
    })
}

/// Read the record at global position `global` of `set`
fn read_global<T>(
    set: &SegmentSet,
    global: u64,
    decode: impl FnOnce(&[u8]) -> std::result::Result<T, CodecError>,
) -> Result<T> {
    let (seg, slot) = set.locate(global).ok_or(StoreError::RecordOutOfRange {
        index: global,
        records: set.records(),
    })?;
    set.index(seg)?.read(slot, decode)
}

fn gid_slot(gid: Gid) -> Result<u64> {
    u64::try_from(gid).map_err(|_| StoreError::NegativeGid(gid))
}

impl Log {
    /// Create a handle for log `id` under `layout`
    ///
    /// Nothing is touched on disk until [`open`](Self::open).
    pub fn new(id: LogId, layout: DirLayout, config: &Config) -> Self {
        Log {
            id,
            layout,
            max_segment_size: config.max_segment_size,
            read_only: config.read_only,
            before_rotate: Mutex::new(None),
            inner: RwLock::new(Inner {
                metadata: LogMetadata::default(),
                version: 1,
                closed: false,
                parts: None,
            }),
            writer: Mutex::new(WriterState::default()),
            rotating: Mutex::new(false),
            rotation_done: Condvar::new(),
            simulator: Arc::new(StateSimulator::with_pool(FramePoolConfig::new(
                config.frame_pool_capacity,
            ))),
        }
    }

    pub fn id(&self) -> LogId {
        self.id
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn max_segment_size(&self) -> u64 {
        self.max_segment_size
    }

    /// Simulator fed by [`append_raw_event`](Self::append_raw_event)
    pub fn simulator(&self) -> Arc<StateSimulator> {
        Arc::clone(&self.simulator)
    }

    /// Install a callback run before every rotation, without any log lock held
    pub fn set_before_rotate<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *lock(&self.before_rotate) = Some(Arc::new(f));
    }

    fn namer(&self, file: fn(&DirLayout, &LogId, usize) -> PathBuf) -> SegmentNamer {
        let layout = self.layout.clone();
        let id = self.id;
        Box::new(move |n| file(&layout, &id, n))
    }

    /// Inspect which on-disk artifacts exist
    pub fn status(&self) -> LogStatus {
        let present = [
            self.layout.meta_file(&self.id),
            self.layout.call_record_file(&self.id, 0),
            self.layout.raw_event_file(&self.id, 0),
            self.layout.index_file(&self.id),
            self.layout.symbol_file(&self.id),
        ]
        .iter()
        .filter(|p| p.exists())
        .count();

        match present {
            0 => LogStatus::NotCreated,
            5 => LogStatus::Created,
            _ => LogStatus::Broken,
        }
    }

    /// Load or create every component of the log
    ///
    /// Calling `open` on an already open log is a no-op. A writable open of a
    /// new log creates all files, so the log is `Created` afterwards.
    pub fn open(&self) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.closed {
            return Err(StoreError::Closed);
        }
        if inner.parts.is_some() {
            return Ok(());
        }

        let status = self.status();
        match status {
            LogStatus::Broken => {
                warn!(log = %self.id, "refusing to open broken log");
                return Err(StoreError::Broken(self.id));
            }
            LogStatus::NotCreated if self.read_only => {
                return Err(StoreError::NotFound(self.id));
            }
            _ => {}
        }

        // Metadata
        let meta_path = self.layout.meta_file(&self.id);
        inner.metadata = if meta_path.exists() {
            serde_json::from_slice(&fs::read(&meta_path)?)?
        } else {
            LogMetadata {
                timestamp: now(),
                ..LogMetadata::default()
            }
        };

        // Symbols
        let symbol_path = self.layout.symbol_file(&self.id);
        let symbols = if self.read_only {
            symbols_file::load(&symbol_path)?
        } else {
            let table = SymbolTable::new();
            if symbol_path.exists() {
                symbols_file::load_into(&symbol_path, &table)?;
            }
            table
        };
        let symbols_writer = if self.read_only {
            None
        } else {
            Some(SymbolsWriter::open(&symbol_path)?)
        };

        // Index
        let index = SegmentIndex::load(self.layout.index_file(&self.id), self.read_only)?;
        if !self.read_only {
            if index.is_empty() {
                index.append(SegmentIndexRecord::open_segment())?;
            } else {
                index.modify_last(|r| r.writing = true)?;
            }
        }

        // Segments
        let raw = SegmentSet::open(
            self.namer(DirLayout::raw_event_file),
            RAW_EVENT_SIZE,
            self.read_only,
        )?;
        let calls = SegmentSet::open_rewritable(
            self.namer(DirLayout::call_record_file),
            CALL_RECORD_SIZE,
            self.read_only,
        )?;
        let goroutines = SegmentSet::open_rewritable(
            self.namer(DirLayout::goroutine_file),
            GOROUTINE_SIZE,
            self.read_only,
        )?;
        if raw.len() != index.len() {
            warn!(
                log = %self.id,
                segments = raw.len(),
                index_entries = index.len(),
                "segment count does not match index"
            );
        }

        let parts = Parts {
            symbols: Arc::new(symbols),
            symbols_writer,
            index,
            raw,
            calls,
            goroutines,
        };

        if !self.read_only {
            let mut w = lock(&self.writer);
            w.next_raw_id = parts.raw.records();
            // Call IDs are slot positions, so the next ID follows the last slot
            self.simulator.set_next_id(parts.calls.records());
            self.write_metadata(&inner.metadata)?;
        }

        info!(
            log = %self.id,
            segments = parts.raw.len(),
            raw_events = parts.raw.records(),
            read_only = self.read_only,
            "opened log"
        );
        inner.parts = Some(Arc::new(parts));
        Ok(())
    }

    fn write_metadata(&self, metadata: &LogMetadata) -> Result<()> {
        let path = self.layout.meta_file(&self.id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(metadata)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn parts(&self) -> Result<Arc<Parts>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        if inner.closed {
            return Err(StoreError::Closed);
        }
        inner.parts.clone().ok_or(StoreError::Closed)
    }

    fn writable_parts(&self) -> Result<Arc<Parts>> {
        let parts = self.parts()?;
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        Ok(parts)
    }

    pub fn is_closed(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
    }

    /// Store a raw event, index it and feed it to the simulator
    ///
    /// The event's `id` is ignored; the assigned ID is returned. Rotates the
    /// segments first when the current raw segment exceeds the size limit.
    ///
    /// # Errors
    ///
    /// A simulator error (such as an End with an unknown transaction) is
    /// returned after the event has been stored.
    pub fn append_raw_event(&self, event: &RawEvent) -> Result<RawEventId> {
        let parts = self.writable_parts()?;
        if self.max_segment_size > 0 && parts.raw.last()?.size() > self.max_segment_size {
            self.rotate()?;
        }

        let id = {
            let mut w = lock(&self.writer);
            let id = w.next_raw_id;
            w.scratch.clone_from_event(event);
            w.scratch.id = id;
            let scratch = &w.scratch;
            parts.raw.append(|buf| encode_raw_event(buf, scratch))?;
            w.next_raw_id += 1;
            parts.index.modify_last(|r| r.observe(event.timestamp))?;
            id
        };

        self.simulator.next(event)?;
        Ok(id)
    }

    /// Merge a symbol delta and persist the entries that were new
    ///
    /// Returns the persisted delta with this log's IDs. When the delta file
    /// cannot be written the table is left as it was, so the same delta can
    /// be retried.
    pub fn append_symbols(&self, delta: &SymbolsData) -> Result<SymbolsData> {
        let parts = self.writable_parts()?;
        parts.symbols.validate(delta)?;

        // The table stays locked until the delta is on disk, so deltas land in
        // the file in ID-assignment order.
        let added = parts.symbols.add_symbols_with(delta, |added| {
            match &parts.symbols_writer {
                Some(writer) => writer.append(added),
                None => Err(StoreError::ReadOnly),
            }
        })?;
        debug!(
            log = %self.id,
            functions = added.functions.len(),
            lines = added.lines.len(),
            "appended symbols"
        );
        Ok(added)
    }

    pub fn symbols(&self) -> Result<Arc<SymbolTable>> {
        Ok(Arc::clone(&self.parts()?.symbols))
    }

    /// Write the simulator's current state into the call and goroutine
    /// segments, then drop ended calls from the simulator
    ///
    /// Each call is written at the slot of its ID and each goroutine at the
    /// slot of its GID, replacing the earlier state of the same record.
    pub fn flush_state(&self) -> Result<()> {
        let parts = self.writable_parts()?;
        let mut w = lock(&self.writer);
        self.flush_state_locked(&parts, &mut w)
    }

    fn flush_state_locked(&self, parts: &Parts, _w: &mut WriterState) -> Result<()> {
        let mut result = Ok(());
        self.simulator.for_each_call(|call| {
            if result.is_ok() {
                result = parts
                    .calls
                    .write(call.id, |buf| encode_call_record(buf, call))
                    .map(|_| ());
            }
        });
        result?;

        for g in self.simulator.goroutines() {
            parts
                .goroutines
                .write(gid_slot(g.gid)?, |buf| encode_goroutine(buf, &g))?;
        }

        let cleared = self.simulator.clear();
        parts.calls.flush()?;
        parts.goroutines.flush()?;
        debug!(log = %self.id, cleared, open = self.simulator.len(), "flushed simulator state");
        Ok(())
    }

    /// Freeze the current segments and start new ones
    ///
    /// A request arriving while another rotation is running waits for it and
    /// returns without rotating a second time.
    pub fn rotate(&self) -> Result<()> {
        let parts = self.writable_parts()?;
        {
            let mut rotating = lock(&self.rotating);
            if *rotating {
                while *rotating {
                    rotating = self
                        .rotation_done
                        .wait(rotating)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                return Ok(());
            }
            *rotating = true;
        }

        let result = self.rotate_now(&parts);

        *lock(&self.rotating) = false;
        self.rotation_done.notify_all();
        result
    }

    fn rotate_now(&self, parts: &Parts) -> Result<()> {
        let callback = lock(&self.before_rotate).clone();
        if let Some(callback) = callback {
            callback();
        }

        let mut w = lock(&self.writer);
        self.flush_state_locked(parts, &mut w)?;

        parts.calls.rotate()?;
        parts.raw.rotate()?;
        parts.goroutines.rotate()?;
        parts.index.modify_last(|r| r.writing = false)?;
        parts.index.append(SegmentIndexRecord::open_segment())?;

        info!(log = %self.id, segment = parts.raw.len() - 1, "rotated log");
        Ok(())
    }

    /// Replace the metadata if `expected_version` is still current
    ///
    /// Returns the new version.
    ///
    /// # Errors
    ///
    /// [`StoreError::Conflict`] when another update won; re-read with
    /// [`log_info`](Self::log_info) and retry.
    pub fn update_metadata(&self, expected_version: u64, metadata: LogMetadata) -> Result<u64> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.closed {
            return Err(StoreError::Closed);
        }
        if inner.version != expected_version {
            return Err(StoreError::Conflict {
                expected: expected_version,
                current: inner.version,
            });
        }
        if !self.read_only && inner.parts.is_some() {
            self.write_metadata(&metadata)?;
        }
        inner.metadata = metadata;
        inner.version += 1;
        Ok(inner.version)
    }

    /// Snapshot of the log's identity, version and metadata
    pub fn log_info(&self) -> LogInfo {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        LogInfo {
            id: self.id,
            version: inner.version,
            metadata: inner.metadata.clone(),
            max_segment_size: self.max_segment_size,
            read_only: self.read_only,
        }
    }

    /// Copy of the segment index
    pub fn index_records(&self) -> Result<Vec<SegmentIndexRecord>> {
        Ok(self.parts()?.index.snapshot())
    }

    /// Number of raw events stored
    pub fn raw_event_count(&self) -> Result<u64> {
        Ok(self.parts()?.raw.records())
    }

    /// Read one raw event by ID
    pub fn raw_event(&self, id: RawEventId) -> Result<RawEvent> {
        read_global(&self.parts()?.raw, id, decode_raw_event)
    }

    /// Read one stored call record by ID
    ///
    /// Reflects the last [`flush_state`](Self::flush_state); calls started
    /// since then are only in the [simulator](Self::simulator).
    pub fn call_record(&self, id: CallId) -> Result<CallRecord> {
        let record = read_global(&self.parts()?.calls, id, decode_call_record)?;
        if record.id != id {
            return Err(StoreError::EmptySlot(id));
        }
        Ok(record)
    }

    /// Read the stored record of goroutine `gid`
    pub fn goroutine(&self, gid: Gid) -> Result<GoroutineRecord> {
        let slot = gid_slot(gid)?;
        read_global(&self.parts()?.goroutines, slot, decode_goroutine)?
            .ok_or(StoreError::EmptySlot(slot))
    }

    /// Stream the raw events stamped within `[start, end]`
    ///
    /// Segments are pruned through the index and visited in order; `f` can
    /// stop the search by returning `Break`.
    pub fn search<F>(&self, start: Time, end: Time, mut f: F) -> Result<()>
    where
        F: FnMut(&RawEvent) -> Result<ControlFlow<()>>,
    {
        let parts = self.parts()?;
        let mut event = RawEvent::default();
        parts.index.walk(start, end, |seg| {
            walk_segments(
                &parts.raw,
                std::iter::once(seg),
                &mut event,
                decode_raw_slot,
                &mut |ev: &RawEvent| {
                    if ev.timestamp < start || ev.timestamp > end {
                        return Ok(ControlFlow::Continue(()));
                    }
                    f(ev)
                },
            )
        })
    }

    /// Visit every stored raw event in ID order
    pub fn walk_raw_events<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&RawEvent) -> Result<ControlFlow<()>>,
    {
        let parts = self.parts()?;
        let mut event = RawEvent::default();
        walk_segments(
            &parts.raw,
            0..parts.raw.len(),
            &mut event,
            decode_raw_slot,
            &mut f,
        )?;
        Ok(())
    }

    /// Visit every stored call record in ID order
    pub fn walk_call_records<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&CallRecord) -> Result<ControlFlow<()>>,
    {
        let parts = self.parts()?;
        let mut record = CallRecord::default();
        walk_segments(
            &parts.calls,
            0..parts.calls.len(),
            &mut record,
            decode_call_slot,
            &mut f,
        )?;
        Ok(())
    }

    /// Visit the goroutine records of segment `segment`
    pub fn walk_goroutine_segment<F>(&self, segment: usize, mut f: F) -> Result<()>
    where
        F: FnMut(&GoroutineRecord) -> Result<ControlFlow<()>>,
    {
        let parts = self.parts()?;
        let mut record = GoroutineRecord::default();
        walk_segments(
            &parts.goroutines,
            std::iter::once(segment),
            &mut record,
            decode_goroutine_slot,
            &mut f,
        )?;
        Ok(())
    }

    /// Visit every stored goroutine record in GID order
    pub fn walk_goroutines<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&GoroutineRecord) -> Result<ControlFlow<()>>,
    {
        let segments = self.parts()?.goroutines.len();
        for seg in 0..segments {
            let mut stopped = false;
            self.walk_goroutine_segment(seg, |g| {
                let flow = f(g)?;
                stopped = flow.is_break();
                Ok(flow)
            })?;
            if stopped {
                break;
            }
        }
        Ok(())
    }

    /// Flush state and close every component
    ///
    /// Every component is closed even if an earlier one fails; the first error
    /// is returned. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;
        let Some(parts) = inner.parts.take() else {
            return Ok(());
        };

        let mut first: Option<StoreError> = None;
        let mut keep = |r: Result<()>| {
            if let Err(e) = r {
                first.get_or_insert(e);
            }
        };

        if !self.read_only {
            let mut w = lock(&self.writer);
            keep(self.flush_state_locked(&parts, &mut w));
            keep(parts.index.modify_last(|r| r.writing = false).map(|_| ()));
            if let Some(last) = parts.index.last() {
                if last.records > 0 {
                    inner.metadata.timestamp = last.timestamp;
                }
            }
            keep(self.write_metadata(&inner.metadata));
        }

        keep(parts.calls.close());
        keep(parts.raw.close());
        keep(parts.goroutines.close());
        keep(parts.index.close());
        if let Some(writer) = &parts.symbols_writer {
            keep(writer.close());
        }
        info!(log = %self.id, "closed log");

        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Close the log and delete all of its files
    pub fn remove(&self) -> Result<()> {
        let closed = self.close();

        let mut first = closed.err();
        let mut keep = |r: io::Result<()>| {
            if let Err(e) = r {
                first.get_or_insert(StoreError::Io(e));
            }
        };

        keep(remove_if_exists(&self.layout.meta_file(&self.id)));
        keep(remove_if_exists(&self.layout.symbol_file(&self.id)));
        keep(remove_if_exists(&self.layout.index_file(&self.id)));
        let files: [fn(&DirLayout, &LogId, usize) -> PathBuf; 3] = [
            DirLayout::raw_event_file,
            DirLayout::call_record_file,
            DirLayout::goroutine_file,
        ];
        for file in files {
            let mut n = 0;
            loop {
                let path = file(&self.layout, &self.id, n);
                if !path.exists() {
                    break;
                }
                keep(fs::remove_file(&path));
                n += 1;
            }
        }
        info!(log = %self.id, "removed log");

        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup(max_segment_size: u64) -> (TempDir, Log) {
        let dir = TempDir::new().unwrap();
        let layout = DirLayout::new(dir.path());
        layout.init().unwrap();
        let config = Config {
            max_segment_size,
            ..Config::with_root(dir.path())
        };
        let log = Log::new(LogId([9; 16]), layout, &config);
        (dir, log)
    }

    #[test]
    fn test_status_lifecycle() {
        let (_dir, log) = setup(0);
        assert_eq!(log.status(), LogStatus::NotCreated);
        log.open().unwrap();
        assert_eq!(log.status(), LogStatus::Created);
        log.close().unwrap();
        assert_eq!(log.status(), LogStatus::Created);
    }

    #[test]
    fn test_partial_files_are_broken() {
        let (dir, log) = setup(0);
        let layout = DirLayout::new(dir.path());
        fs::write(layout.meta_file(&log.id()), "{}").unwrap();

        assert_eq!(log.status(), LogStatus::Broken);
        assert!(matches!(log.open(), Err(StoreError::Broken(_))));
    }

    #[test]
    fn test_operations_after_close_fail() {
        let (_dir, log) = setup(0);
        log.open().unwrap();
        log.close().unwrap();
        log.close().unwrap();

        assert!(log.is_closed());
        assert!(matches!(
            log.append_raw_event(&RawEvent::start(1, 0, 1, vec![])),
            Err(StoreError::Closed)
        ));
        assert!(matches!(log.raw_event(0), Err(StoreError::Closed)));
        assert!(matches!(log.open(), Err(StoreError::Closed)));
    }

    #[test]
    fn test_update_metadata_conflict() {
        let (_dir, log) = setup(0);
        log.open().unwrap();

        let info = log.log_info();
        assert_eq!(info.version, 1);
        let mut meta = info.metadata.clone();
        meta.ui.goroutines.insert(
            1,
            UiItemConfig {
                pinned: true,
                ..UiItemConfig::default()
            },
        );
        assert_eq!(log.update_metadata(info.version, meta.clone()).unwrap(), 2);

        // Stale version
        let err = log.update_metadata(info.version, meta).unwrap_err();
        assert!(err.is_conflict());
        assert!(log.log_info().metadata.ui.goroutines[&1].pinned);
    }

    #[test]
    fn test_append_assigns_dense_ids() {
        let (_dir, log) = setup(0);
        log.open().unwrap();
        for tx in 0..5u64 {
            let id = log
                .append_raw_event(&RawEvent::start(tx as Time, 0, tx, vec![tx]))
                .unwrap();
            assert_eq!(id, tx);
        }
        assert_eq!(log.raw_event_count().unwrap(), 5);
        assert_eq!(log.raw_event(3).unwrap().frames, vec![3]);
        assert_eq!(log.index_records().unwrap()[0].records, 5);
    }

    #[test]
    fn test_symbols_survive_failed_append_and_retry() {
        let (dir, log) = setup(0);
        log.open().unwrap();
        let delta = SymbolsData {
            modules: vec![crate::symbols::Module {
                id: 0,
                name: String::new(),
                min_pc: 0x1000,
                max_pc: 0x2000,
            }],
            functions: vec![crate::symbols::Function {
                id: 0,
                entry: 0x1000,
                name: "main.main".to_string(),
            }],
            ..SymbolsData::default()
        };

        // Make the delta file unwritable
        let parts = log.parts().unwrap();
        parts.symbols_writer.as_ref().unwrap().close().unwrap();
        assert!(matches!(log.append_symbols(&delta), Err(StoreError::Closed)));
        assert_eq!(log.symbols().unwrap().functions_len(), 0);
        drop(parts);
        log.close().unwrap();

        let config = Config::with_root(dir.path());
        let log = Log::new(LogId([9; 16]), DirLayout::new(dir.path()), &config);
        log.open().unwrap();
        assert_eq!(log.symbols().unwrap().functions_len(), 0);
        let added = log.append_symbols(&delta).unwrap();
        assert_eq!(added.functions.len(), 1);
        log.close().unwrap();

        let read_only = Config {
            read_only: true,
            ..Config::with_root(dir.path())
        };
        let log = Log::new(LogId([9; 16]), DirLayout::new(dir.path()), &read_only);
        log.open().unwrap();
        assert_eq!(log.symbols().unwrap().func_name(0x1010), "main.main");
    }

    #[test]
    fn test_negative_gid_cannot_be_flushed() {
        let (_dir, log) = setup(0);
        log.open().unwrap();
        log.append_raw_event(&RawEvent::start(1, -4, 1, vec![]))
            .unwrap();

        assert!(matches!(log.flush_state(), Err(StoreError::NegativeGid(-4))));
        assert!(matches!(log.goroutine(-4), Err(StoreError::NegativeGid(-4))));
    }

    #[test]
    fn test_unflushed_call_is_not_stored_yet() {
        let (_dir, log) = setup(0);
        log.open().unwrap();
        log.append_raw_event(&RawEvent::start(1, 0, 1, vec![]))
            .unwrap();
        assert!(matches!(
            log.call_record(0),
            Err(StoreError::RecordOutOfRange { index: 0, records: 0 })
        ));

        log.flush_state().unwrap();
        let call = log.call_record(0).unwrap();
        assert_eq!((call.start_time, call.end_time), (1, None));
    }

    #[test]
    fn test_log_info_json_keys() {
        let (_dir, log) = setup(1024);
        let json = serde_json::to_value(log.log_info()).unwrap();
        assert_eq!(json["log-id"], "09".repeat(16));
        assert_eq!(json["max-segment-size"], 1024);
        assert_eq!(json["read-only"], false);
        assert!(json["metadata"]["ui"]["func-calls"].is_object());
    }
}
