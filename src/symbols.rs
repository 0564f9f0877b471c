//! Interned symbol table for modules, functions, source files and lines
//!
//! The table is append-only. Every entry gets a stable integer ID that the
//! rest of the store uses instead of strings:
//!
//! | Entity     | Dedup key              | ID type    |
//! |------------|------------------------|------------|
//! | `Module`   | (name, min_pc, max_pc) | `ModuleId` |
//! | `SourceFile` | path                 | `FileId`   |
//! | `Function` | name                   | `FuncId`   |
//! | `Line`     | pc                     | `LineId`   |
//!
//! IDs are assigned densely from 0 unless the table is in *keep-ID* mode, which
//! is used when merging a table whose IDs are already canonical (e.g. replaying
//! the on-disk symbol deltas of a log).
//!
//! PC lookups return the last entry whose start is `<= pc` inside the module
//! covering `pc`, scanning entries in ID order. Producers must therefore add
//! functions and lines in ascending PC order per module.
//!
//! The table holds no file handle; persisting deltas is the caller's job
//! (see [`crate::symbols_file`]).

use crate::error::{Result, StoreError};
use crate::types::Pc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

pub type ModuleId = u64;
pub type FileId = u64;
pub type FuncId = u64;
pub type LineId = u64;

/// A loaded module covering the PC range `[min_pc, max_pc]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    #[serde(default)]
    pub id: ModuleId,
    /// May be empty for the main module
    pub name: String,
    pub min_pc: Pc,
    pub max_pc: Pc,
}

/// A source file path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    #[serde(default)]
    pub id: FileId,
    pub path: String,
}

/// A function and its entry point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    #[serde(default)]
    pub id: FuncId,
    pub entry: Pc,
    /// Fully qualified name, e.g. `github.com/user/app.main`
    pub name: String,
}

/// Mapping from a PC to a position in the source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Line {
    #[serde(default)]
    pub id: LineId,
    pub pc: Pc,
    pub file_id: FileId,
    pub line: u32,
}

/// Plain-data form of a symbol table or of a delta of one
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolsData {
    #[serde(default)]
    pub files: Vec<SourceFile>,
    #[serde(default)]
    pub modules: Vec<Module>,
    #[serde(default)]
    pub functions: Vec<Function>,
    #[serde(default)]
    pub lines: Vec<Line>,
}

impl SymbolsData {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
            && self.modules.is_empty()
            && self.functions.is_empty()
            && self.lines.is_empty()
    }

    /// Check that every entry is well formed
    ///
    /// File references are checked by [`SymbolTable::validate`], which also
    /// knows the files already interned.
    pub fn validate(&self) -> Result<()> {
        for f in &self.files {
            if f.path.is_empty() {
                return Err(StoreError::InvalidSymbols(format!(
                    "file {} has an empty path",
                    f.id
                )));
            }
        }
        for m in &self.modules {
            if m.min_pc == 0 || m.max_pc == 0 || m.min_pc >= m.max_pc {
                return Err(StoreError::InvalidSymbols(format!(
                    "module {:?} has an invalid pc range [{:#x}, {:#x}]",
                    m.name, m.min_pc, m.max_pc
                )));
            }
        }
        for f in &self.functions {
            if f.name.is_empty() {
                return Err(StoreError::InvalidSymbols(format!(
                    "function at {:#x} has an empty name",
                    f.entry
                )));
            }
            if f.entry == 0 {
                return Err(StoreError::InvalidSymbols(format!(
                    "function {} has entry pc 0",
                    f.name
                )));
            }
        }
        for l in &self.lines {
            if l.pc == 0 || l.line == 0 {
                return Err(StoreError::InvalidSymbols(format!(
                    "line {} has pc {:#x} and line number {}",
                    l.id, l.pc, l.line
                )));
            }
        }
        Ok(())
    }
}

/// Dense ID-indexed storage. `None` marks a hole left by keep-ID inserts.
#[derive(Debug)]
struct Slots<T> {
    items: Vec<Option<T>>,
    len: usize,
}

impl<T> Default for Slots<T> {
    fn default() -> Self {
        Slots {
            items: Vec::new(),
            len: 0,
        }
    }
}

impl<T> Slots<T> {
    fn next_id(&self) -> u64 {
        self.items.len() as u64
    }

    /// Slot index for `id`, which must be free and lie within `slack` slots
    /// past the current end
    fn check_id(&self, kind: &str, id: u64, slack: usize) -> Result<usize> {
        let limit = self.items.len().saturating_add(slack);
        match usize::try_from(id) {
            Ok(idx) if idx < limit => {
                if matches!(self.items.get(idx), Some(Some(_))) {
                    return Err(StoreError::InvalidSymbols(format!(
                        "{} id {} is already in use",
                        kind, id
                    )));
                }
                Ok(idx)
            }
            _ => Err(StoreError::InvalidSymbols(format!(
                "{} id {} is out of range (next id is {})",
                kind,
                id,
                self.items.len()
            ))),
        }
    }

    fn put(&mut self, idx: usize, item: T) {
        if idx >= self.items.len() {
            self.items.resize_with(idx + 1, || None);
        }
        if self.items[idx].is_none() {
            self.len += 1;
        }
        self.items[idx] = Some(item);
    }

    fn remove(&mut self, id: u64) -> Option<T> {
        let idx = usize::try_from(id).ok()?;
        let item = self.items.get_mut(idx)?.take()?;
        self.len -= 1;
        while matches!(self.items.last(), Some(None)) {
            self.items.pop();
        }
        Some(item)
    }

    fn get(&self, id: u64) -> Option<&T> {
        self.items.get(id as usize).and_then(Option::as_ref)
    }

    fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter().flatten()
    }
}

#[derive(Debug, Default)]
struct TableInner {
    modules: Slots<Module>,
    files: Slots<SourceFile>,
    functions: Slots<Function>,
    lines: Slots<Line>,

    module_keys: HashMap<(String, Pc, Pc), ModuleId>,
    file_paths: HashMap<String, FileId>,
    func_names: HashMap<String, FuncId>,
    line_pcs: HashMap<Pc, LineId>,
}

// `slack` bounds how far past the current end a keep-ID insert may land.
impl TableInner {
    fn add_module(
        &mut self,
        mut m: Module,
        keep_id: bool,
        slack: usize,
    ) -> Result<(ModuleId, bool)> {
        let key = (m.name.clone(), m.min_pc, m.max_pc);
        if let Some(&id) = self.module_keys.get(&key) {
            return Ok((id, false));
        }
        if !keep_id {
            m.id = self.modules.next_id();
        }
        let idx = self.modules.check_id("module", m.id, slack)?;
        let id = m.id;
        self.modules.put(idx, m);
        self.module_keys.insert(key, id);
        Ok((id, true))
    }

    fn add_file(
        &mut self,
        mut f: SourceFile,
        keep_id: bool,
        slack: usize,
    ) -> Result<(FileId, bool)> {
        if let Some(&id) = self.file_paths.get(&f.path) {
            return Ok((id, false));
        }
        if !keep_id {
            f.id = self.files.next_id();
        }
        let idx = self.files.check_id("file", f.id, slack)?;
        let id = f.id;
        self.file_paths.insert(f.path.clone(), id);
        self.files.put(idx, f);
        Ok((id, true))
    }

    fn add_function(
        &mut self,
        mut f: Function,
        keep_id: bool,
        slack: usize,
    ) -> Result<(FuncId, bool)> {
        if let Some(&id) = self.func_names.get(&f.name) {
            return Ok((id, false));
        }
        if !keep_id {
            f.id = self.functions.next_id();
        }
        let idx = self.functions.check_id("function", f.id, slack)?;
        let id = f.id;
        self.func_names.insert(f.name.clone(), id);
        self.functions.put(idx, f);
        Ok((id, true))
    }

    fn add_line(
        &mut self,
        mut l: Line,
        keep_id: bool,
        slack: usize,
    ) -> Result<(LineId, bool)> {
        if let Some(&id) = self.line_pcs.get(&l.pc) {
            return Ok((id, false));
        }
        if !keep_id {
            l.id = self.lines.next_id();
        }
        let idx = self.lines.check_id("line", l.id, slack)?;
        let id = l.id;
        self.line_pcs.insert(l.pc, id);
        self.lines.put(idx, l);
        Ok((id, true))
    }

    /// Merge `delta`, recording every new entry in `added`
    fn merge(
        &mut self,
        delta: &SymbolsData,
        keep_id: bool,
        added: &mut SymbolsData,
    ) -> Result<()> {
        let mut file_map: HashMap<FileId, FileId> = HashMap::new();

        for f in &delta.files {
            let (id, is_new) = self.add_file(f.clone(), keep_id, delta.files.len())?;
            file_map.insert(f.id, id);
            if is_new {
                added.files.push(SourceFile {
                    id,
                    path: f.path.clone(),
                });
            }
        }
        for m in &delta.modules {
            let (id, is_new) = self.add_module(m.clone(), keep_id, delta.modules.len())?;
            if is_new {
                added.modules.push(Module { id, ..m.clone() });
            }
        }
        for f in &delta.functions {
            let (id, is_new) = self.add_function(f.clone(), keep_id, delta.functions.len())?;
            if is_new {
                added.functions.push(Function { id, ..f.clone() });
            }
        }
        for l in &delta.lines {
            let file_id = file_map.get(&l.file_id).copied().unwrap_or(l.file_id);
            let line = Line {
                file_id,
                ..l.clone()
            };
            let (id, is_new) = self.add_line(line.clone(), keep_id, delta.lines.len())?;
            if is_new {
                added.lines.push(Line { id, ..line });
            }
        }
        Ok(())
    }

    /// Drop the entries of `added` again
    fn rollback(&mut self, added: &SymbolsData) {
        for f in &added.files {
            if let Some(f) = self.files.remove(f.id) {
                self.file_paths.remove(&f.path);
            }
        }
        for m in &added.modules {
            if let Some(m) = self.modules.remove(m.id) {
                self.module_keys.remove(&(m.name, m.min_pc, m.max_pc));
            }
        }
        for f in &added.functions {
            if let Some(f) = self.functions.remove(f.id) {
                self.func_names.remove(&f.name);
            }
        }
        for l in &added.lines {
            if let Some(l) = self.lines.remove(l.id) {
                self.line_pcs.remove(&l.pc);
            }
        }
    }

    fn module_at(&self, pc: Pc) -> Option<&Module> {
        self.modules
            .iter()
            .find(|m| m.min_pc <= pc && pc <= m.max_pc)
    }

    /// Last entry with `start(entry) <= pc` inside the module covering `pc`.
    fn last_at_or_before<'a, T>(
        &self,
        entries: impl Iterator<Item = &'a T>,
        pc: Pc,
        start: impl Fn(&T) -> Pc,
    ) -> Option<&'a T>
    where
        T: 'a,
    {
        let module = self.module_at(pc)?;
        let mut found = None;
        for entry in entries {
            let s = start(entry);
            if s < module.min_pc {
                continue;
            }
            if s > module.max_pc || s > pc {
                break;
            }
            found = Some(entry);
        }
        found
    }
}

/// Thread-safe, append-only symbol table
///
/// All `add_*` calls are serialized by one write lock; lookups share the read
/// side.
#[derive(Debug, Default)]
pub struct SymbolTable {
    keep_id: bool,
    inner: RwLock<TableInner>,
}

impl SymbolTable {
    /// Create an empty table that assigns its own IDs
    pub fn new() -> Self {
        SymbolTable::default()
    }

    /// Create an empty table that trusts the IDs carried by incoming entries
    pub fn with_keep_id() -> Self {
        SymbolTable {
            keep_id: true,
            inner: RwLock::default(),
        }
    }

    pub fn keeps_ids(&self) -> bool {
        self.keep_id
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, TableInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, TableInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_module(&self, module: Module) -> Result<(ModuleId, bool)> {
        self.write().add_module(module, self.keep_id, 1)
    }

    pub fn add_file(&self, file: SourceFile) -> Result<(FileId, bool)> {
        self.write().add_file(file, self.keep_id, 1)
    }

    /// Intern a function by name
    ///
    /// Returns the function's ID and whether it was newly added. In keep-ID
    /// mode the carried ID must be free and at most the next dense ID.
    pub fn add_function(&self, function: Function) -> Result<(FuncId, bool)> {
        self.write().add_function(function, self.keep_id, 1)
    }

    /// Intern a line by PC
    ///
    /// Returns the line's ID and whether it was newly added.
    pub fn add_line(&self, line: Line) -> Result<(LineId, bool)> {
        self.write().add_line(line, self.keep_id, 1)
    }

    /// Merge a delta and return the entries that were newly added, carrying
    /// the IDs this table assigned to them.
    ///
    /// File IDs referenced by incoming lines are translated to this table's
    /// file IDs, so the returned delta is self-consistent and can be written
    /// to disk and replayed in keep-ID mode.
    ///
    /// # Errors
    ///
    /// In keep-ID mode, [`StoreError::InvalidSymbols`] for an entry whose ID
    /// is taken or lies further past the end than the delta has entries of
    /// its kind. Nothing is merged in that case.
    pub fn add_symbols(&self, delta: &SymbolsData) -> Result<SymbolsData> {
        self.add_symbols_with(delta, |_| Ok(()))
    }

    /// Like [`add_symbols`](Self::add_symbols), but hands the new entries to
    /// `persist` while the table is still locked
    ///
    /// If `persist` fails the merge is undone, so a retry of the same delta
    /// reports the same entries as new.
    pub fn add_symbols_with<F>(&self, delta: &SymbolsData, persist: F) -> Result<SymbolsData>
    where
        F: FnOnce(&SymbolsData) -> Result<()>,
    {
        let mut inner = self.write();
        let mut added = SymbolsData::default();
        let result = inner
            .merge(delta, self.keep_id, &mut added)
            .and_then(|()| persist(&added));
        match result {
            Ok(()) => Ok(added),
            Err(e) => {
                inner.rollback(&added);
                Err(e)
            }
        }
    }

    /// Validate `delta` and check that its lines reference files carried by the
    /// delta itself or already interned here.
    pub fn validate(&self, delta: &SymbolsData) -> Result<()> {
        delta.validate()?;
        let inner = self.read();
        for l in &delta.lines {
            let known = delta.files.iter().any(|f| f.id == l.file_id)
                || inner.files.get(l.file_id).is_some();
            if !known {
                return Err(StoreError::InvalidSymbols(format!(
                    "line at {:#x} references unknown file {}",
                    l.pc, l.file_id
                )));
            }
        }
        Ok(())
    }

    /// Module whose PC range covers `pc`
    pub fn module_at(&self, pc: Pc) -> Option<Module> {
        self.read().module_at(pc).cloned()
    }

    /// Function containing `pc`
    pub fn function_at(&self, pc: Pc) -> Option<Function> {
        let inner = self.read();
        inner
            .last_at_or_before(inner.functions.iter(), pc, |f| f.entry)
            .cloned()
    }

    /// Source line for `pc`
    pub fn line_at(&self, pc: Pc) -> Option<Line> {
        let inner = self.read();
        inner
            .last_at_or_before(inner.lines.iter(), pc, |l| l.pc)
            .cloned()
    }

    pub fn function(&self, id: FuncId) -> Option<Function> {
        self.read().functions.get(id).cloned()
    }

    pub fn line(&self, id: LineId) -> Option<Line> {
        self.read().lines.get(id).cloned()
    }

    pub fn file(&self, id: FileId) -> Option<SourceFile> {
        self.read().files.get(id).cloned()
    }

    pub fn function_id(&self, name: &str) -> Option<FuncId> {
        self.read().func_names.get(name).copied()
    }

    /// Function name for `pc`, or `"?"`
    pub fn func_name(&self, pc: Pc) -> String {
        self.function_at(pc)
            .map(|f| f.name)
            .unwrap_or_else(|| "?".to_string())
    }

    /// Package path of the function at `pc`
    ///
    /// `github.com/user/app/pkg.(*T).Method` becomes `github.com/user/app/pkg`.
    pub fn module_name(&self, pc: Pc) -> String {
        let name = self.func_name(pc);
        let (dir, last) = match name.rfind('/') {
            Some(i) => (&name[..=i], &name[i + 1..]),
            None => ("", name.as_str()),
        };
        let pkg = last.split('.').next().unwrap_or(last);
        format!("{}{}", dir, pkg)
    }

    /// `"path:line"` for `pc`, with `?` for unknown parts
    pub fn file_line(&self, pc: Pc) -> String {
        let inner = self.read();
        match inner.last_at_or_before(inner.lines.iter(), pc, |l| l.pc) {
            Some(line) => {
                let path = inner
                    .files
                    .get(line.file_id)
                    .map(|f| f.path.as_str())
                    .unwrap_or("?");
                format!("{}:{}", path, line.line)
            }
            None => "?:?".to_string(),
        }
    }

    pub fn functions_len(&self) -> usize {
        self.read().functions.len
    }

    pub fn lines_len(&self) -> usize {
        self.read().lines.len
    }

    pub fn files_len(&self) -> usize {
        self.read().files.len
    }

    pub fn modules_len(&self) -> usize {
        self.read().modules.len
    }

    /// Copy of the whole table
    pub fn snapshot(&self) -> SymbolsData {
        let inner = self.read();
        SymbolsData {
            files: inner.files.iter().cloned().collect(),
            modules: inner.modules.iter().cloned().collect(),
            functions: inner.functions.iter().cloned().collect(),
            lines: inner.lines.iter().cloned().collect(),
        }
    }
}
