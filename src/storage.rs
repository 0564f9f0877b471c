//! Trace-store root: creates, finds and removes logs
//!
//! One `Storage` owns one root directory. Log handles are cached, so every
//! caller asking for the same ID shares one [`Log`].

use crate::config::Config;
use crate::dir_layout::DirLayout;
use crate::error::{Result, StoreError};
use crate::log::{Log, LogStatus};
use crate::types::LogId;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::info;

/// Manager of every log under one root directory
#[derive(Debug)]
pub struct Storage {
    layout: DirLayout,
    config: Config,
    logs: RwLock<HashMap<LogId, Arc<Log>>>,
}

impl Storage {
    pub fn new(config: Config) -> Self {
        Storage {
            layout: DirLayout::new(&config.root),
            config,
            logs: RwLock::new(HashMap::new()),
        }
    }

    /// Create the root directory tree, or check the format version of an
    /// existing one
    pub fn init(&self) -> Result<()> {
        if self.config.read_only {
            if !self.layout.info_file().exists() {
                return Err(StoreError::corrupt(
                    self.layout.info_file(),
                    "trace store is not initialized",
                ));
            }
            return Ok(());
        }
        self.layout.init()
    }

    pub fn layout(&self) -> &DirLayout {
        &self.layout
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Create and open a log with a fresh random ID
    pub fn new_log(&self) -> Result<Arc<Log>> {
        if self.config.read_only {
            return Err(StoreError::ReadOnly);
        }
        let mut logs = self.logs.write().unwrap_or_else(PoisonError::into_inner);
        let id = loop {
            let id = LogId::random();
            if !logs.contains_key(&id) && !self.layout.meta_file(&id).exists() {
                break id;
            }
        };
        let log = Arc::new(Log::new(id, self.layout.clone(), &self.config));
        log.open()?;
        logs.insert(id, Arc::clone(&log));
        info!(log = %id, "created log");
        Ok(log)
    }

    /// Open (or return the cached handle of) an existing log
    pub fn log(&self, id: LogId) -> Result<Arc<Log>> {
        if let Some(log) = self
            .logs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
        {
            return Ok(Arc::clone(log));
        }

        let mut logs = self.logs.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(log) = logs.get(&id) {
            return Ok(Arc::clone(log));
        }
        let log = Log::new(id, self.layout.clone(), &self.config);
        if log.status() == LogStatus::NotCreated {
            return Err(StoreError::NotFound(id));
        }
        log.open()?;
        let log = Arc::new(log);
        logs.insert(id, Arc::clone(&log));
        Ok(log)
    }

    /// IDs of every log in the root, sorted
    pub fn log_ids(&self) -> Result<Vec<LogId>> {
        self.layout.log_ids()
    }

    /// Status of a log without opening it
    pub fn status(&self, id: LogId) -> LogStatus {
        Log::new(id, self.layout.clone(), &self.config).status()
    }

    /// Open every log in the root
    pub fn logs(&self) -> Result<Vec<Arc<Log>>> {
        self.log_ids()?.into_iter().map(|id| self.log(id)).collect()
    }

    /// Close and delete a log
    pub fn remove(&self, id: LogId) -> Result<()> {
        if self.config.read_only {
            return Err(StoreError::ReadOnly);
        }
        let cached = self
            .logs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        let log = match cached {
            Some(log) => log,
            None => {
                let log = Log::new(id, self.layout.clone(), &self.config);
                if log.status() == LogStatus::NotCreated {
                    return Err(StoreError::NotFound(id));
                }
                Arc::new(log)
            }
        };
        log.remove()
    }

    /// Close every cached log, returning the first error
    pub fn close(&self) -> Result<()> {
        let logs: Vec<Arc<Log>> = self
            .logs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, log)| log)
            .collect();
        let mut first = None;
        for log in logs {
            if let Err(e) = log.close() {
                first.get_or_insert(e);
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
