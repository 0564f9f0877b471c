//! Call-stack reconstruction from raw Start/End events
//!
//! The simulator replays the event stream of every goroutine and keeps:
//!
//! ```text
//! stacks:     gid  -> innermost open call (None when the stack is empty)
//! txids:      txid -> call id of the open call it started
//! calls:      id   -> CallRecord (open and not-yet-cleared ended calls)
//! goroutines: gid  -> GoroutineRecord
//! ```
//!
//! Nesting is inferred purely from event order per goroutine. Events of
//! different goroutines may interleave freely.
//!
//! The simulator has no disk knowledge; [`crate::log::Log`] persists its
//! snapshots.

use crate::error::{Result, StoreError};
use crate::frame_pool::{FramePool, FramePoolConfig, PoolStats};
use crate::types::{CallId, CallRecord, Gid, GoroutineRecord, LogId, RawEvent, Tag, Time, TxId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::warn;

#[derive(Default)]
struct SimState {
    next_id: CallId,
    stacks: HashMap<Gid, Option<CallId>>,
    txids: HashMap<TxId, CallId>,
    calls: HashMap<CallId, CallRecord>,
    goroutines: HashMap<Gid, GoroutineRecord>,
    pool: FramePool,
}

impl SimState {
    fn start(&mut self, ev: &RawEvent) -> CallId {
        let seen = self.goroutines.contains_key(&ev.gid);
        let parent_id = if seen {
            self.stacks.get(&ev.gid).copied().flatten()
        } else {
            None
        };

        let id = self.next_id;
        self.next_id += 1;

        let frames = self.pool.acquire_copy(&ev.frames);
        self.calls.insert(
            id,
            CallRecord {
                id,
                start_time: ev.timestamp,
                end_time: None,
                parent_id,
                frames,
                gid: ev.gid,
            },
        );
        self.txids.insert(ev.txid, id);
        self.stacks.insert(ev.gid, Some(id));

        if parent_id.is_none() {
            if seen {
                self.revive_goroutine(ev.gid);
            } else {
                self.goroutines.insert(
                    ev.gid,
                    GoroutineRecord {
                        gid: ev.gid,
                        start_time: ev.timestamp,
                        end_time: None,
                    },
                );
            }
        }
        id
    }

    /// A goroutine whose stack ran empty was assumed finished. A new
    /// outermost Start shows it is still running, so its end is forgotten.
    ///
    /// Goroutine termination is inferred, never observed; this rule is a
    /// heuristic and may mark a goroutine alive that the runtime reused.
    fn revive_goroutine(&mut self, gid: Gid) {
        if let Some(g) = self.goroutines.get_mut(&gid) {
            g.end_time = None;
        }
    }

    fn end(&mut self, ev: &RawEvent) -> Result<CallId> {
        if !self.goroutines.contains_key(&ev.gid) {
            return Err(StoreError::UnknownTransaction(ev.txid));
        }
        let id = self
            .txids
            .remove(&ev.txid)
            .ok_or(StoreError::UnknownTransaction(ev.txid))?;
        let call = self
            .calls
            .get_mut(&id)
            .ok_or(StoreError::UnknownTransaction(ev.txid))?;

        call.end_time = Some(ev.timestamp);
        let parent_id = call.parent_id;
        let top = self.stacks.get(&ev.gid).copied().flatten();
        if top != Some(id) {
            warn!(
                gid = ev.gid,
                txid = ev.txid,
                call = id,
                top = ?top,
                "end event for a call that is not the innermost open call"
            );
        }
        self.stacks.insert(ev.gid, parent_id);

        if parent_id.is_none() {
            if let Some(g) = self.goroutines.get_mut(&ev.gid) {
                g.end_time = Some(ev.timestamp);
            }
        }
        Ok(id)
    }
}

/// In-memory state machine turning [`RawEvent`]s into [`CallRecord`]s and
/// [`GoroutineRecord`]s
pub struct StateSimulator {
    inner: RwLock<SimState>,
}

impl Default for StateSimulator {
    fn default() -> Self {
        StateSimulator::new()
    }
}

impl std::fmt::Debug for StateSimulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.read();
        f.debug_struct("StateSimulator")
            .field("next_id", &state.next_id)
            .field("calls", &state.calls.len())
            .field("goroutines", &state.goroutines.len())
            .finish()
    }
}

impl StateSimulator {
    pub fn new() -> Self {
        StateSimulator::with_pool(FramePoolConfig::default())
    }

    /// Create a simulator whose frame buffers come from a pool with `config`
    pub fn with_pool(config: FramePoolConfig) -> Self {
        StateSimulator {
            inner: RwLock::new(SimState {
                pool: FramePool::new(config),
                ..SimState::default()
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, SimState> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SimState> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply one event and return the ID of the call it started or ended
    ///
    /// The event's frames are copied; the caller may reuse `event`.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownTransaction`] for an End whose transaction has no
    /// open call. The simulator state is unchanged in that case.
    pub fn next(&self, event: &RawEvent) -> Result<CallId> {
        let mut state = self.write();
        match event.tag {
            Tag::Start => Ok(state.start(event)),
            Tag::End => state.end(event),
        }
    }

    /// Owned copies of every tracked call, ordered by ID
    pub fn call_records(&self) -> Vec<CallRecord> {
        let state = self.read();
        let mut out: Vec<CallRecord> = state.calls.values().cloned().collect();
        out.sort_by_key(|c| c.id);
        out
    }

    /// Visit every tracked call without copying, ordered by ID
    ///
    /// The borrowed records are only valid inside `f`; frames must be copied
    /// before they are kept.
    pub fn for_each_call<F: FnMut(&CallRecord)>(&self, mut f: F) {
        let state = self.read();
        let mut ids: Vec<CallId> = state.calls.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            if let Some(call) = state.calls.get(&id) {
                f(call);
            }
        }
    }

    /// Copies of every goroutine record, ordered by goroutine ID
    pub fn goroutines(&self) -> Vec<GoroutineRecord> {
        let state = self.read();
        let mut out: Vec<GoroutineRecord> = state.goroutines.values().copied().collect();
        out.sort_by_key(|g| g.gid);
        out
    }

    pub fn call(&self, id: CallId) -> Option<CallRecord> {
        self.read().calls.get(&id).cloned()
    }

    pub fn goroutine(&self, gid: Gid) -> Option<GoroutineRecord> {
        self.read().goroutines.get(&gid).copied()
    }

    /// Drop every ended call and recycle its frame buffer
    ///
    /// Open calls are never dropped. Returns how many calls were removed.
    pub fn clear(&self) -> usize {
        let mut state = self.write();
        let ended: Vec<CallId> = state
            .calls
            .iter()
            .filter(|(_, c)| c.is_ended())
            .map(|(&id, _)| id)
            .collect();
        for id in &ended {
            if let Some(call) = state.calls.remove(id) {
                state.pool.release(call.frames);
            }
        }
        ended.len()
    }

    /// Number of calls currently tracked
    pub fn len(&self) -> usize {
        self.read().calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls still waiting for their End event
    pub fn open_calls(&self) -> usize {
        self.read().txids.len()
    }

    pub fn next_id(&self) -> CallId {
        self.read().next_id
    }

    /// Continue numbering calls from `id`, used when resuming a stored log
    pub fn set_next_id(&self, id: CallId) {
        self.write().next_id = id;
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.read().pool.stats()
    }

    /// Earliest start among the tracked calls
    pub fn oldest_start(&self) -> Option<Time> {
        self.read().calls.values().map(|c| c.start_time).min()
    }
}

/// Registry of one simulator per log
#[derive(Debug, Default)]
pub struct SimulatorStore {
    sims: Mutex<HashMap<LogId, Arc<StateSimulator>>>,
}

impl SimulatorStore {
    pub fn new() -> Self {
        SimulatorStore::default()
    }

    pub fn get(&self, id: &LogId) -> Option<Arc<StateSimulator>> {
        self.sims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Register a new simulator for `id`
    pub fn create(&self, id: LogId) -> Result<Arc<StateSimulator>> {
        let mut sims = self.sims.lock().unwrap_or_else(PoisonError::into_inner);
        if sims.contains_key(&id) {
            return Err(StoreError::AlreadyExists(id));
        }
        let sim = Arc::new(StateSimulator::new());
        sims.insert(id, Arc::clone(&sim));
        Ok(sim)
    }

    pub fn remove(&self, id: &LogId) -> Option<Arc<StateSimulator>> {
        self.sims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }
}
