//! Seekable read and write windows over a record file
//!
//! Both windows cache one contiguous byte range of the file:
//!
//! ```text
//! file:   |----------|==========window==========|-------------|
//!         0          pos                        pos+len
//! ```
//!
//! A seek that lands inside the cached span reuses it. Only a seek outside the
//! span (or a write that would overflow the window) drops it, flushing first in
//! the write case. Mostly-sequential appends with occasional in-place rewrites
//! of recent slots therefore never touch the disk until the window fills.

use std::io::{self, Read, Seek, SeekFrom, Write};

/// Default window size in bytes
pub const DEFAULT_WINDOW_SIZE: usize = 64 * 1024;

/// Dirty-byte window for the write path
#[derive(Debug)]
pub struct WriteWindow {
    buf: Vec<u8>,
    /// File offset of `buf[0]`
    pos: u64,
    /// Number of dirty bytes in `buf`
    len: usize,
    /// Write position inside `buf`
    cursor: usize,
}

impl WriteWindow {
    /// Create a window of `capacity` bytes positioned at `pos`
    pub fn new(capacity: usize, pos: u64) -> Self {
        WriteWindow {
            buf: vec![0; capacity],
            pos,
            len: 0,
            cursor: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes waiting to be flushed
    pub fn pending(&self) -> usize {
        self.len
    }

    /// File offset one past the last dirty byte
    pub fn end(&self) -> u64 {
        self.pos + self.len as u64
    }

    /// Position the cursor at file offset `target` for a write of `n` bytes.
    ///
    /// Reuses the window when `target` is inside (or directly after) the dirty
    /// span and the write still fits; flushes into `file` otherwise.
    pub fn seek<W: Write + Seek>(&mut self, file: &mut W, target: u64, n: usize) -> io::Result<()> {
        let inside = target >= self.pos && target <= self.end();
        if inside && (target - self.pos) as usize + n <= self.buf.len() {
            self.cursor = (target - self.pos) as usize;
            return Ok(());
        }
        self.flush(file)?;
        self.pos = target;
        self.cursor = 0;
        if n > self.buf.len() {
            self.buf.resize(n, 0);
        }
        Ok(())
    }

    /// Mutable view of the next `n` bytes at the cursor
    ///
    /// The caller must have called [`seek`](Self::seek) with the same `n`.
    pub fn slot_mut(&mut self, n: usize) -> &mut [u8] {
        let start = self.cursor;
        &mut self.buf[start..start + n]
    }

    /// Mark `n` bytes at the cursor as written and advance past them
    pub fn commit(&mut self, n: usize) {
        self.cursor += n;
        self.len = self.len.max(self.cursor);
    }

    /// Write the dirty span to `file`
    ///
    /// Returns the flushed file range, or `None` if nothing was pending.
    pub fn flush<W: Write + Seek>(&mut self, file: &mut W) -> io::Result<Option<(u64, u64)>> {
        if self.len == 0 {
            return Ok(None);
        }
        let range = (self.pos, self.end());
        file.seek(SeekFrom::Start(self.pos))?;
        file.write_all(&self.buf[..self.len])?;
        file.flush()?;
        self.pos += self.cursor as u64;
        self.len = 0;
        self.cursor = 0;
        Ok(Some(range))
    }
}

/// Clean-byte window for the read path
#[derive(Debug)]
pub struct ReadWindow {
    buf: Vec<u8>,
    pos: u64,
    len: usize,
}

impl ReadWindow {
    pub fn new(capacity: usize) -> Self {
        ReadWindow {
            buf: vec![0; capacity],
            pos: 0,
            len: 0,
        }
    }

    fn contains(&self, offset: u64, n: usize) -> bool {
        offset >= self.pos && offset + n as u64 <= self.pos + self.len as u64
    }

    /// Return `n` bytes starting at `offset`, refilling from `file` only when
    /// the range is not already cached.
    pub fn read_at<R: Read + Seek>(&mut self, file: &mut R, offset: u64, n: usize) -> io::Result<&[u8]> {
        if !self.contains(offset, n) {
            if n > self.buf.len() {
                self.buf.resize(n, 0);
            }
            file.seek(SeekFrom::Start(offset))?;
            let mut filled = 0;
            while filled < self.buf.len() {
                match file.read(&mut self.buf[filled..]) {
                    Ok(0) => break,
                    Ok(k) => filled += k,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
            self.pos = offset;
            self.len = filled;
            if filled < n {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("short read at offset {}: {} of {} bytes", offset, filled, n),
                ));
            }
        }
        let start = (offset - self.pos) as usize;
        Ok(&self.buf[start..start + n])
    }

    /// Drop the cached span if it overlaps `[start, end)`
    pub fn invalidate(&mut self, start: u64, end: u64) {
        let cached_end = self.pos + self.len as u64;
        if self.len > 0 && start < cached_end && self.pos < end {
            self.len = 0;
        }
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}
