//! Core data model shared by the simulator and the storage engine
//!
//! ```text
//! RawEvent (wire input)         CallRecord (reconstructed)      GoroutineRecord
//! ├─ id                         ├─ id                           ├─ gid
//! ├─ tag: Start | End           ├─ start_time                   ├─ start_time
//! ├─ timestamp                  ├─ end_time: Option<Time>       └─ end_time: Option<Time>
//! ├─ frames: [pc; ≤1024]        ├─ parent_id: Option<CallId>
//! ├─ gid                        ├─ frames
//! └─ txid                       └─ gid
//! ```
//!
//! `None` in `end_time` is the "not ended yet" state. On disk it is encoded as
//! [`NOT_ENDED`]; in memory it is always an `Option`.

use crate::error::StoreError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Goroutine ID
pub type Gid = i64;
/// Transaction ID pairing a Start event with its End event
pub type TxId = u64;
/// ID of a reconstructed [`CallRecord`]
pub type CallId = u64;
/// ID of a stored [`RawEvent`]
pub type RawEventId = u64;
/// Program counter of one stack frame
pub type Pc = u64;
/// Nanoseconds since the UNIX epoch
pub type Time = i64;

/// Sentinel used on disk for "not ended yet"
pub const NOT_ENDED: Time = -1;

/// Sentinel used on disk for "no parent call"
pub const NO_PARENT: u64 = u64::MAX;

/// Maximum number of frames stored per event
pub const MAX_STACK_SIZE: usize = 1024;

/// Kind of a raw event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tag {
    /// A function was entered
    Start,
    /// A function returned
    End,
}

impl Tag {
    pub fn as_u8(self) -> u8 {
        match self {
            Tag::Start => 0,
            Tag::End => 1,
        }
    }

    pub fn from_u8(value: u8) -> Option<Tag> {
        match value {
            0 => Some(Tag::Start),
            1 => Some(Tag::End),
            _ => None,
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Tag::Start => "start",
            Tag::End => "end",
        })
    }
}

/// One function-enter or function-exit event emitted by the instrumented program
///
/// `frames[0]` is the current frame, `frames[1]` its caller, and so on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    pub id: RawEventId,
    pub tag: Tag,
    pub timestamp: Time,
    pub frames: Vec<Pc>,
    pub gid: Gid,
    pub txid: TxId,
}

impl RawEvent {
    /// Create a Start event
    pub fn start(timestamp: Time, gid: Gid, txid: TxId, frames: Vec<Pc>) -> Self {
        RawEvent {
            id: 0,
            tag: Tag::Start,
            timestamp,
            frames,
            gid,
            txid,
        }
    }

    /// Create an End event
    pub fn end(timestamp: Time, gid: Gid, txid: TxId, frames: Vec<Pc>) -> Self {
        RawEvent {
            id: 0,
            tag: Tag::End,
            timestamp,
            frames,
            gid,
            txid,
        }
    }

    /// Copy `other` into `self`, reusing the frame buffer.
    pub fn clone_from_event(&mut self, other: &RawEvent) {
        self.id = other.id;
        self.tag = other.tag;
        self.timestamp = other.timestamp;
        self.frames.clear();
        self.frames.extend_from_slice(&other.frames);
        self.gid = other.gid;
        self.txid = other.txid;
    }
}

impl Default for RawEvent {
    fn default() -> Self {
        RawEvent {
            id: 0,
            tag: Tag::Start,
            timestamp: 0,
            frames: Vec::new(),
            gid: 0,
            txid: 0,
        }
    }
}

/// One reconstructed function call
///
/// Immutable once `end_time` is set.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: CallId,
    pub start_time: Time,
    pub end_time: Option<Time>,
    pub parent_id: Option<CallId>,
    pub frames: Vec<Pc>,
    pub gid: Gid,
}

impl CallRecord {
    pub fn is_ended(&self) -> bool {
        self.end_time.is_some()
    }

    /// Copy `other` into `self`, reusing the frame buffer.
    pub fn clone_from_record(&mut self, other: &CallRecord) {
        self.id = other.id;
        self.start_time = other.start_time;
        self.end_time = other.end_time;
        self.parent_id = other.parent_id;
        self.frames.clear();
        self.frames.extend_from_slice(&other.frames);
        self.gid = other.gid;
    }
}

/// Lifetime of one goroutine as inferred from its events
///
/// `end_time` may go back to `None` if the goroutine is seen again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GoroutineRecord {
    pub gid: Gid,
    pub start_time: Time,
    pub end_time: Option<Time>,
}

impl GoroutineRecord {
    pub fn is_ended(&self) -> bool {
        self.end_time.is_some()
    }
}

/// 16-byte random identifier naming one trace session
///
/// Displayed, parsed and serialized as 32 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct LogId(pub [u8; 16]);

impl LogId {
    /// Generate a new random ID
    pub fn random() -> Self {
        LogId(rand::random())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, StoreError> {
        let bytes = hex::decode(s).map_err(|_| StoreError::InvalidLogId(s.to_string()))?;
        let id: [u8; 16] = bytes
            .try_into()
            .map_err(|_| StoreError::InvalidLogId(s.to_string()))?;
        Ok(LogId(id))
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogId({})", self.to_hex())
    }
}

impl FromStr for LogId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LogId::from_hex(s)
    }
}

impl Serialize for LogId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for LogId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        LogId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Current wall-clock time in nanoseconds
pub fn now() -> Time {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as Time)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_id_hex_roundtrip() {
        let id = LogId([
            0x4b, 0xf9, 0x2f, 0x3c, 0x7b, 0x64, 0x4b, 0xf9, 0x2f, 0x3c, 0x7b, 0x64, 0x4b, 0xf9,
            0x2f, 0x3c,
        ]);
        assert_eq!(id.to_hex(), "4bf92f3c7b644bf92f3c7b644bf92f3c");
        assert_eq!(id.to_hex().parse::<LogId>().unwrap(), id);
    }

    #[test]
    fn test_log_id_rejects_bad_input() {
        assert!(LogId::from_hex("abc").is_err());
        assert!(LogId::from_hex("zz".repeat(16).as_str()).is_err());
        assert!(LogId::from_hex(&"00".repeat(17)).is_err());
    }

    #[test]
    fn test_log_id_json_is_hex_string() {
        let id = LogId([0xab; 16]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(16)));
        let back: LogId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_random_log_ids_differ() {
        assert_ne!(LogId::random(), LogId::random());
    }

    #[test]
    fn test_tag_u8_mapping() {
        assert_eq!(Tag::from_u8(Tag::Start.as_u8()), Some(Tag::Start));
        assert_eq!(Tag::from_u8(Tag::End.as_u8()), Some(Tag::End));
        assert_eq!(Tag::from_u8(7), None);
    }

    #[test]
    fn test_clone_from_event_reuses_buffer() {
        let mut dst = RawEvent {
            frames: Vec::with_capacity(64),
            ..RawEvent::default()
        };
        let capacity = dst.frames.capacity();
        let src = RawEvent::start(5, 2, 9, vec![1, 2, 3]);
        dst.clone_from_event(&src);
        assert_eq!(dst, src);
        assert_eq!(dst.frames.capacity(), capacity);
    }
}
