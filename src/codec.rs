//! Fixed-width slot encoding for stored records
//!
//! All integers are little-endian. Every record kind has a constant slot size so
//! that slot `i` of a segment lives at byte offset `i * SIZE`.
//!
//! ```text
//! RawEvent   (8229 bytes)  id:u64 tag:u8 timestamp:i64 gid:i64 txid:u64 nframes:u32 frames:[u64; 1024]
//! CallRecord (8236 bytes)  id:u64 start:i64 end:i64 parent:u64 gid:i64 nframes:u32 frames:[u64; 1024]
//! Goroutine  (25 bytes)    written:u8 gid:i64 start:i64 end:i64
//! ```
//!
//! `end == -1` means "not ended", `parent == u64::MAX` means "no parent".
//! Goroutine slots are addressed by GID, so a zero `written` byte marks a slot
//! no goroutine has been stored in.
//! Bytes after the last frame are zero-filled by the store.

use crate::error::StoreError;
use crate::types::{
    CallRecord, GoroutineRecord, RawEvent, Tag, MAX_STACK_SIZE, NOT_ENDED, NO_PARENT,
};
use std::path::Path;
use thiserror::Error;

/// Slot size of an encoded [`RawEvent`]
pub const RAW_EVENT_SIZE: usize = 8 + 1 + 8 + 8 + 8 + 4 + 8 * MAX_STACK_SIZE;

/// Slot size of an encoded [`CallRecord`]
pub const CALL_RECORD_SIZE: usize = 8 + 8 + 8 + 8 + 8 + 4 + 8 * MAX_STACK_SIZE;

/// Slot size of an encoded [`GoroutineRecord`]
pub const GOROUTINE_SIZE: usize = 1 + 8 * 3;

/// Errors raised while encoding or decoding a slot
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("unknown event tag {0}")]
    UnknownTag(u8),

    #[error("frame count {0} exceeds the slot capacity")]
    TooManyFrames(usize),

    #[error("slot is truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
}

impl CodecError {
    /// Attach the file the slot belongs to.
    pub fn into_store_error(self, path: &Path) -> StoreError {
        match self {
            CodecError::TooManyFrames(depth) => StoreError::StackTooDeep {
                depth,
                max: MAX_STACK_SIZE,
            },
            other => StoreError::corrupt(path, other.to_string()),
        }
    }
}

/// Cursor writing primitives into a slot buffer
pub struct SlotWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> SlotWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        SlotWriter { buf, pos: 0 }
    }

    fn put(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        let end = self.pos + bytes.len();
        if end > self.buf.len() {
            return Err(CodecError::Truncated {
                need: end,
                have: self.buf.len(),
            });
        }
        self.buf[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }

    pub fn put_u8(&mut self, v: u8) -> Result<(), CodecError> {
        self.put(&[v])
    }

    pub fn put_u32(&mut self, v: u32) -> Result<(), CodecError> {
        self.put(&v.to_le_bytes())
    }

    pub fn put_u64(&mut self, v: u64) -> Result<(), CodecError> {
        self.put(&v.to_le_bytes())
    }

    pub fn put_i64(&mut self, v: i64) -> Result<(), CodecError> {
        self.put(&v.to_le_bytes())
    }

    /// Bytes written so far
    pub fn position(&self) -> usize {
        self.pos
    }
}

/// Cursor reading primitives out of a slot buffer
pub struct SlotReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> SlotReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        SlotReader { buf, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let end = self.pos + N;
        if end > self.buf.len() {
            return Err(CodecError::Truncated {
                need: end,
                have: self.buf.len(),
            });
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..end]);
        self.pos = end;
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take::<1>()?[0])
    }

    pub fn get_u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    pub fn get_u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_le_bytes(self.take()?))
    }

    pub fn get_i64(&mut self) -> Result<i64, CodecError> {
        Ok(i64::from_le_bytes(self.take()?))
    }
}

fn put_frames(w: &mut SlotWriter<'_>, frames: &[u64]) -> Result<(), CodecError> {
    if frames.len() > MAX_STACK_SIZE {
        return Err(CodecError::TooManyFrames(frames.len()));
    }
    w.put_u32(frames.len() as u32)?;
    for pc in frames {
        w.put_u64(*pc)?;
    }
    Ok(())
}

fn get_frames(r: &mut SlotReader<'_>, frames: &mut Vec<u64>) -> Result<(), CodecError> {
    let n = r.get_u32()? as usize;
    if n > MAX_STACK_SIZE {
        return Err(CodecError::TooManyFrames(n));
    }
    frames.clear();
    frames.reserve(n);
    for _ in 0..n {
        frames.push(r.get_u64()?);
    }
    Ok(())
}

fn encode_end(end: Option<i64>) -> i64 {
    end.unwrap_or(NOT_ENDED)
}

fn decode_end(raw: i64) -> Option<i64> {
    if raw == NOT_ENDED {
        None
    } else {
        Some(raw)
    }
}

pub fn encode_raw_event(buf: &mut [u8], ev: &RawEvent) -> Result<usize, CodecError> {
    let mut w = SlotWriter::new(buf);
    w.put_u64(ev.id)?;
    w.put_u8(ev.tag.as_u8())?;
    w.put_i64(ev.timestamp)?;
    w.put_i64(ev.gid)?;
    w.put_u64(ev.txid)?;
    put_frames(&mut w, &ev.frames)?;
    Ok(w.position())
}

/// Decode into an existing event, reusing its frame buffer.
pub fn decode_raw_event_into(buf: &[u8], ev: &mut RawEvent) -> Result<(), CodecError> {
    let mut r = SlotReader::new(buf);
    ev.id = r.get_u64()?;
    let tag = r.get_u8()?;
    ev.tag = Tag::from_u8(tag).ok_or(CodecError::UnknownTag(tag))?;
    ev.timestamp = r.get_i64()?;
    ev.gid = r.get_i64()?;
    ev.txid = r.get_u64()?;
    get_frames(&mut r, &mut ev.frames)
}

pub fn decode_raw_event(buf: &[u8]) -> Result<RawEvent, CodecError> {
    let mut ev = RawEvent::default();
    decode_raw_event_into(buf, &mut ev)?;
    Ok(ev)
}

pub fn encode_call_record(buf: &mut [u8], rec: &CallRecord) -> Result<usize, CodecError> {
    let mut w = SlotWriter::new(buf);
    w.put_u64(rec.id)?;
    w.put_i64(rec.start_time)?;
    w.put_i64(encode_end(rec.end_time))?;
    w.put_u64(rec.parent_id.unwrap_or(NO_PARENT))?;
    w.put_i64(rec.gid)?;
    put_frames(&mut w, &rec.frames)?;
    Ok(w.position())
}

/// Decode into an existing record, reusing its frame buffer.
pub fn decode_call_record_into(buf: &[u8], rec: &mut CallRecord) -> Result<(), CodecError> {
    let mut r = SlotReader::new(buf);
    rec.id = r.get_u64()?;
    rec.start_time = r.get_i64()?;
    rec.end_time = decode_end(r.get_i64()?);
    let parent = r.get_u64()?;
    rec.parent_id = (parent != NO_PARENT).then_some(parent);
    rec.gid = r.get_i64()?;
    get_frames(&mut r, &mut rec.frames)
}

pub fn decode_call_record(buf: &[u8]) -> Result<CallRecord, CodecError> {
    let mut rec = CallRecord::default();
    decode_call_record_into(buf, &mut rec)?;
    Ok(rec)
}

pub fn encode_goroutine(buf: &mut [u8], g: &GoroutineRecord) -> Result<usize, CodecError> {
    let mut w = SlotWriter::new(buf);
    w.put_u8(1)?;
    w.put_i64(g.gid)?;
    w.put_i64(g.start_time)?;
    w.put_i64(encode_end(g.end_time))?;
    Ok(w.position())
}

/// Decode a goroutine slot; `None` for a slot that was never written
pub fn decode_goroutine(buf: &[u8]) -> Result<Option<GoroutineRecord>, CodecError> {
    let mut r = SlotReader::new(buf);
    if r.get_u8()? == 0 {
        return Ok(None);
    }
    Ok(Some(GoroutineRecord {
        gid: r.get_i64()?,
        start_time: r.get_i64()?,
        end_time: decode_end(r.get_i64()?),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_event_roundtrip() {
        let ev = RawEvent {
            id: 42,
            tag: Tag::End,
            timestamp: 1_700_000_000_000_000_000,
            frames: vec![0x401000, 0x401020, 0x402000],
            gid: 7,
            txid: 0xdead_beef,
        };
        let mut buf = vec![0u8; RAW_EVENT_SIZE];
        let n = encode_raw_event(&mut buf, &ev).unwrap();
        assert_eq!(n, 8 + 1 + 8 + 8 + 8 + 4 + 3 * 8);
        assert_eq!(decode_raw_event(&buf).unwrap(), ev);
    }

    #[test]
    fn test_call_record_sentinels() {
        let open = CallRecord {
            id: 3,
            start_time: 10,
            end_time: None,
            parent_id: None,
            frames: vec![],
            gid: -1,
        };
        let mut buf = vec![0u8; CALL_RECORD_SIZE];
        encode_call_record(&mut buf, &open).unwrap();
        assert_eq!(&buf[16..24], &NOT_ENDED.to_le_bytes());
        assert_eq!(&buf[24..32], &NO_PARENT.to_le_bytes());
        assert_eq!(decode_call_record(&buf).unwrap(), open);

        let closed = CallRecord {
            end_time: Some(20),
            parent_id: Some(0),
            ..open
        };
        encode_call_record(&mut buf, &closed).unwrap();
        assert_eq!(decode_call_record(&buf).unwrap(), closed);
    }

    #[test]
    fn test_goroutine_roundtrip() {
        let g = GoroutineRecord {
            gid: 12,
            start_time: 1,
            end_time: Some(4),
        };
        let mut buf = [0u8; GOROUTINE_SIZE];
        assert_eq!(decode_goroutine(&buf).unwrap(), None);
        assert_eq!(encode_goroutine(&mut buf, &g).unwrap(), GOROUTINE_SIZE);
        assert_eq!(decode_goroutine(&buf).unwrap(), Some(g));
    }

    #[test]
    fn test_too_many_frames_is_rejected() {
        let ev = RawEvent {
            frames: vec![1; MAX_STACK_SIZE + 1],
            ..RawEvent::default()
        };
        let mut buf = vec![0u8; RAW_EVENT_SIZE];
        assert_eq!(
            encode_raw_event(&mut buf, &ev),
            Err(CodecError::TooManyFrames(MAX_STACK_SIZE + 1))
        );
    }

    #[test]
    fn test_full_stack_fits_exactly() {
        let ev = RawEvent {
            frames: (0..MAX_STACK_SIZE as u64).collect(),
            ..RawEvent::default()
        };
        let mut buf = vec![0u8; RAW_EVENT_SIZE];
        assert_eq!(encode_raw_event(&mut buf, &ev).unwrap(), RAW_EVENT_SIZE);
        assert_eq!(decode_raw_event(&buf).unwrap(), ev);
    }

    #[test]
    fn test_unknown_tag_is_corrupt() {
        let mut buf = vec![0u8; RAW_EVENT_SIZE];
        buf[8] = 9;
        assert_eq!(decode_raw_event(&buf), Err(CodecError::UnknownTag(9)));
        let err = CodecError::UnknownTag(9).into_store_error(Path::new("x.log"));
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[test]
    fn test_zeroed_slot_decodes_as_empty_start() {
        let buf = vec![0u8; RAW_EVENT_SIZE];
        let ev = decode_raw_event(&buf).unwrap();
        assert_eq!(ev.tag, Tag::Start);
        assert!(ev.frames.is_empty());
    }
}
