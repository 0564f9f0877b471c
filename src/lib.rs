//! Calltrace - event-sourced trace store for function-call tracers
//!
//! This library ingests raw function enter/exit events from an instrumented
//! program, reconstructs per-goroutine call stacks from them, and persists
//! events, reconstructed records and symbols in rotating fixed-slot segment
//! files that stay searchable by time while being written.
//!
//! Entry points: [`storage::Storage`] for a store root and [`log::Log`] for
//! one trace session.

pub mod buffer;
pub mod cli;
pub mod codec;
pub mod config;
pub mod dir_layout;
pub mod error;
pub mod frame_pool; // Reusable frame buffers for the ingestion path
pub mod log;
pub mod record_store;
pub mod segment_index;
pub mod segment_set;
pub mod simulator;
pub mod storage;
pub mod symbols;
pub mod symbols_file;
pub mod types;

pub use error::{Result, StoreError};
