//! Append-only symbol delta file
//!
//! Each line is one JSON-encoded [`SymbolsData`] delta carrying canonical IDs.
//! Replaying every line into a keep-ID [`SymbolTable`] rebuilds the table.

use crate::error::{Result, StoreError};
use crate::symbols::{SymbolTable, SymbolsData};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

/// Appends symbol deltas to a file
#[derive(Debug)]
pub struct SymbolsWriter {
    path: PathBuf,
    out: Mutex<Option<BufWriter<File>>>,
}

impl SymbolsWriter {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(SymbolsWriter {
            path,
            out: Mutex::new(Some(BufWriter::new(file))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one delta as a line and flush it
    ///
    /// Empty deltas are skipped.
    pub fn append(&self, delta: &SymbolsData) -> Result<()> {
        if delta.is_empty() {
            return Ok(());
        }
        let mut guard = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        let out = guard.as_mut().ok_or(StoreError::Closed)?;
        serde_json::to_writer(&mut *out, delta)?;
        out.write_all(b"\n")?;
        out.flush()?;
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        let mut guard = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut out) = guard.take() {
            out.flush()?;
        }
        Ok(())
    }
}

/// Rebuild a symbol table from the delta file at `path`
///
/// A final line cut short by a crash is dropped with a warning; any other
/// unparsable line, or a delta whose IDs do not fit the table, is reported as
/// corruption.
pub fn load(path: &Path) -> Result<SymbolTable> {
    let table = SymbolTable::with_keep_id();
    load_into(path, &table)?;
    Ok(table)
}

/// Replay the delta file at `path` into `table`
///
/// Deltas are written in ID-assignment order, so replaying them into an empty
/// table that assigns its own IDs reproduces the stored IDs.
pub fn load_into(path: &Path, table: &SymbolTable) -> Result<()> {
    let reader = BufReader::new(File::open(path)?);
    let mut lines = reader.lines().peekable();
    let mut deltas = 0usize;

    while let Some(line) = lines.next() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<SymbolsData>(&line) {
            Ok(delta) => {
                table
                    .add_symbols(&delta)
                    .map_err(|e| StoreError::corrupt(path, e.to_string()))?;
                deltas += 1;
            }
            Err(e) if lines.peek().is_none() => {
                warn!(path = %path.display(), error = %e, "dropping truncated symbol delta");
            }
            Err(e) => return Err(StoreError::corrupt(path, e.to_string())),
        }
    }
    debug!(path = %path.display(), deltas, functions = table.functions_len(), "loaded symbols");
    Ok(())
}
