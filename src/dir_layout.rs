//! On-disk layout of a trace-store root
//!
//! ```text
//! <root>/
//! ├── info.json                          format version
//! ├── meta/<id>.meta.json                LogMetadata per log
//! └── data/
//!     ├── <id>.<n>.rawfunc.log           raw events, segment n
//!     ├── <id>.<n>.func.log              call records, segment n
//!     ├── <id>.<n>.goroutine.log         goroutine records, segment n
//!     ├── <id>.symbol                    symbol deltas (JSON lines)
//!     └── <id>.index                     segment index
//! ```

use crate::error::{Result, StoreError};
use crate::types::LogId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Major format version; stores with a different major version are refused
pub const MAJOR_VERSION: u64 = 1;
/// Minor format version; differences are tolerated
pub const MINOR_VERSION: u64 = 0;

const META_SUFFIX: &str = ".meta.json";

/// Contents of `info.json`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Info {
    pub major_version: u64,
    pub minor_version: u64,
}

impl Info {
    pub fn current() -> Self {
        Info {
            major_version: MAJOR_VERSION,
            minor_version: MINOR_VERSION,
        }
    }

    pub fn is_compatible(&self) -> bool {
        self.major_version == MAJOR_VERSION
    }
}

/// Path scheme of a trace-store root directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirLayout {
    root: PathBuf,
}

impl DirLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirLayout { root: root.into() }
    }

    /// Create the directory tree and write or check `info.json`
    pub fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;

        let info_path = self.info_file();
        if info_path.exists() {
            let info: Info = serde_json::from_slice(&fs::read(&info_path)?)?;
            if !info.is_compatible() {
                return Err(StoreError::Incompatible {
                    found_major: info.major_version,
                    found_minor: info.minor_version,
                    supported_major: MAJOR_VERSION,
                });
            }
        } else {
            fs::write(&info_path, serde_json::to_vec(&Info::current())?)?;
            info!(root = %self.root.display(), "initialized trace store");
        }

        fs::create_dir_all(self.meta_dir())?;
        fs::create_dir_all(self.data_dir())?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn info_file(&self) -> PathBuf {
        self.root.join("info.json")
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.root.join("meta")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn meta_file(&self, id: &LogId) -> PathBuf {
        self.meta_dir().join(format!("{}{}", id, META_SUFFIX))
    }

    pub fn raw_event_file(&self, id: &LogId, n: usize) -> PathBuf {
        self.data_dir().join(format!("{}.{}.rawfunc.log", id, n))
    }

    pub fn call_record_file(&self, id: &LogId, n: usize) -> PathBuf {
        self.data_dir().join(format!("{}.{}.func.log", id, n))
    }

    pub fn goroutine_file(&self, id: &LogId, n: usize) -> PathBuf {
        self.data_dir().join(format!("{}.{}.goroutine.log", id, n))
    }

    pub fn symbol_file(&self, id: &LogId) -> PathBuf {
        self.data_dir().join(format!("{}.symbol", id))
    }

    pub fn index_file(&self, id: &LogId) -> PathBuf {
        self.data_dir().join(format!("{}.index", id))
    }

    /// Parse the log ID out of a metadata file name
    ///
    /// Returns `None` for anything that is not `<32 hex chars>.meta.json`.
    pub fn log_id_from_meta_file_name(name: &str) -> Option<LogId> {
        let hex = name.strip_suffix(META_SUFFIX)?;
        LogId::from_hex(hex).ok()
    }

    /// IDs of every log with a metadata file, sorted
    pub fn log_ids(&self) -> Result<Vec<LogId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(self.meta_dir())? {
            let entry = entry?;
            if let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(DirLayout::log_id_from_meta_file_name)
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}
