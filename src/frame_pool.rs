/// Free-list of frame buffers for the ingestion path
///
/// Every Start event carries a stack of program counters. The simulator copies
/// those frames into a buffer it owns; when a finished call is cleared the
/// buffer goes back to this pool instead of the allocator.
///
/// Contract: a buffer handed out by [`FramePool::acquire`] is exclusively owned
/// until it is passed to [`FramePool::release`]. Anything that borrows a pooled
/// buffer (for example a simulator snapshot callback) must copy the frames
/// before it retains them past the next `next()`/`clear()` call.
use crate::types::{Pc, MAX_STACK_SIZE};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Configuration for the frame pool
#[derive(Debug, Clone)]
pub struct FramePoolConfig {
    /// Number of buffers kept on the free list
    pub capacity: usize,
    /// Whether pooling is enabled
    pub enabled: bool,
}

impl Default for FramePoolConfig {
    fn default() -> Self {
        FramePoolConfig {
            capacity: 1024,
            enabled: true,
        }
    }
}

impl FramePoolConfig {
    /// Create a new pool configuration
    pub fn new(capacity: usize) -> Self {
        FramePoolConfig {
            capacity,
            enabled: true,
        }
    }

    /// Disable pooling (for debugging)
    pub fn disabled() -> Self {
        FramePoolConfig {
            capacity: 0,
            enabled: false,
        }
    }
}

/// Pool of reusable `Vec<Pc>` buffers
pub struct FramePool {
    free: Vec<Vec<Pc>>,
    config: FramePoolConfig,
    allocated: AtomicUsize,
    acquired: AtomicUsize,
}

impl FramePool {
    /// Create a new frame pool with the given configuration
    pub fn new(config: FramePoolConfig) -> Self {
        // Buffers are grown lazily; only the free-list slots are reserved.
        let free = Vec::with_capacity(config.capacity);
        FramePool {
            free,
            config,
            allocated: AtomicUsize::new(0),
            acquired: AtomicUsize::new(0),
        }
    }

    /// Acquire an empty buffer
    ///
    /// Falls back to a fresh allocation when the free list is empty or pooling
    /// is disabled.
    pub fn acquire(&mut self) -> Vec<Pc> {
        self.acquired.fetch_add(1, Ordering::Relaxed);

        if self.config.enabled {
            if let Some(mut frames) = self.free.pop() {
                frames.clear();
                return frames;
            }
        }
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Vec::new()
    }

    /// Acquire a buffer holding a copy of `frames`
    pub fn acquire_copy(&mut self, frames: &[Pc]) -> Vec<Pc> {
        let mut buf = self.acquire();
        buf.extend_from_slice(&frames[..frames.len().min(MAX_STACK_SIZE)]);
        buf
    }

    /// Release a buffer back to the pool
    ///
    /// Buffers beyond the configured capacity are dropped.
    pub fn release(&mut self, frames: Vec<Pc>) {
        if !self.config.enabled {
            return;
        }
        if self.free.len() < self.config.capacity {
            self.free.push(frames);
        }
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.config.capacity,
            available: self.free.len(),
            allocated: self.allocated.load(Ordering::Relaxed),
            acquired: self.acquired.load(Ordering::Relaxed),
            enabled: self.config.enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Buffers currently on the free list
    pub fn available(&self) -> usize {
        self.free.len()
    }
}

impl Default for FramePool {
    fn default() -> Self {
        FramePool::new(FramePoolConfig::default())
    }
}

/// Pool statistics
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Free-list capacity
    pub capacity: usize,
    /// Buffers on the free list
    pub available: usize,
    /// Buffers obtained from the allocator
    pub allocated: usize,
    /// Total acquire operations
    pub acquired: usize,
    /// Whether pooling is enabled
    pub enabled: bool,
}

impl PoolStats {
    /// Percentage of acquires served from the free list
    pub fn hit_rate(&self) -> f64 {
        if self.acquired == 0 {
            return 0.0;
        }
        let hits = self.acquired.saturating_sub(self.allocated);
        (hits as f64 / self.acquired as f64) * 100.0
    }
}
