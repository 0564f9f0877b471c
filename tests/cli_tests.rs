//! Integration tests for the `calltrace log` inspection commands
#![allow(deprecated)] // suppress assert_cmd::Command::cargo_bin deprecation in tests

use calltrace::config::Config;
use calltrace::storage::Storage;
use calltrace::symbols::{Function, Module, SymbolsData};
use calltrace::types::{LogId, RawEvent};
use predicates::prelude::*;
use tempfile::TempDir;

/// Build a store holding one log with two nested calls and a symbol
fn populated_store() -> (TempDir, LogId) {
    let dir = TempDir::new().unwrap();
    let storage = Storage::new(Config::with_root(dir.path()));
    storage.init().unwrap();
    let log = storage.new_log().unwrap();

    log.append_symbols(&SymbolsData {
        modules: vec![Module {
            id: 0,
            name: String::new(),
            min_pc: 0x1000,
            max_pc: 0x2000,
        }],
        functions: vec![
            Function {
                id: 0,
                entry: 0x1000,
                name: "main.main".to_string(),
            },
            Function {
                id: 0,
                entry: 0x1100,
                name: "main.work".to_string(),
            },
        ],
        ..SymbolsData::default()
    })
    .unwrap();

    log.append_raw_event(&RawEvent::start(1, 0, 1, vec![0x1010]))
        .unwrap();
    log.append_raw_event(&RawEvent::start(2, 0, 2, vec![0x1110, 0x1010]))
        .unwrap();
    log.append_raw_event(&RawEvent::end(3, 0, 2, vec![0x1110, 0x1010]))
        .unwrap();
    log.append_raw_event(&RawEvent::end(4, 0, 1, vec![0x1010]))
        .unwrap();

    let id = log.id();
    storage.close().unwrap();
    (dir, id)
}

fn calltrace(dir: &TempDir) -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("calltrace");
    cmd.env_remove("CALLTRACE_ROOT")
        .env_remove("CALLTRACE_MAX_SEGMENT_SIZE")
        .arg("--root")
        .arg(dir.path());
    cmd
}

#[test]
fn test_ls_lists_created_log() {
    let (dir, id) = populated_store();

    calltrace(&dir)
        .args(["log", "ls"])
        .assert()
        .success()
        .stdout(predicate::str::contains(id.to_hex()))
        .stdout(predicate::str::contains("created"));
}

#[test]
fn test_ls_json_reports_counts() {
    let (dir, id) = populated_store();

    let output = calltrace(&dir)
        .args(["--format", "json", "log", "ls"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    let line = stdout.lines().next().unwrap();
    let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
    assert_eq!(parsed["id"], id.to_hex());
    assert_eq!(parsed["status"], "created");
    assert_eq!(parsed["raw_events"], 4);
    assert_eq!(parsed["segments"], 1);
}

#[test]
fn test_ls_on_uninitialized_root_fails() {
    let dir = TempDir::new().unwrap();

    calltrace(&dir)
        .args(["log", "ls"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to open trace store"));
}

#[test]
fn test_info_shows_index_and_symbols() {
    let (dir, id) = populated_store();

    calltrace(&dir)
        .args(["log", "info", &id.to_hex()])
        .assert()
        .success()
        .stdout(predicate::str::contains("log-id:"))
        .stdout(predicate::str::contains("raw events:       4"))
        .stdout(predicate::str::contains("2 functions"))
        .stdout(predicate::str::contains("records=4"))
        .stdout(predicate::str::contains("[1, 4]"));
}

#[test]
fn test_cat_prints_raw_events_in_order() {
    let (dir, id) = populated_store();

    let output = calltrace(&dir)
        .args(["log", "cat", &id.to_hex()])
        .output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 4);
    assert!(lines[0].starts_with("0  start"));
    assert!(lines[3].starts_with("3  end"));
    assert!(lines[1].contains("0x1110 <- 0x1010"));
}

#[test]
fn test_cat_time_window() {
    let (dir, id) = populated_store();

    let output = calltrace(&dir)
        .args(["--format", "json", "log", "cat", &id.to_hex()])
        .args(["--start", "2", "--end", "3"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    let timestamps: Vec<i64> = stdout
        .lines()
        .map(|l| {
            let v: serde_json::Value = serde_json::from_str(l).unwrap();
            v["timestamp"].as_i64().unwrap()
        })
        .collect();
    assert_eq!(timestamps, vec![2, 3]);
}

#[test]
fn test_cat_calls_with_symbols() {
    let (dir, id) = populated_store();

    calltrace(&dir)
        .args(["log", "cat", &id.to_hex(), "--calls", "--symbols"])
        .assert()
        .success()
        .stdout(predicate::str::contains("main.work"))
        .stdout(predicate::str::contains("parent=-"))
        .stdout(predicate::str::contains("end=4"));
}

#[test]
fn test_cat_goroutines() {
    let (dir, id) = populated_store();

    calltrace(&dir)
        .args(["log", "cat", &id.to_hex(), "--goroutines"])
        .assert()
        .success()
        .stdout(predicate::str::contains("gid=0  start=1  end=4"));
}

#[test]
fn test_cat_unknown_log_fails() {
    let (dir, _) = populated_store();

    calltrace(&dir)
        .args(["log", "cat", "00000000000000000000000000000000"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));
}

#[test]
fn test_invalid_log_id_is_rejected() {
    let (dir, _) = populated_store();

    calltrace(&dir)
        .args(["log", "info", "not-hex"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid log id"));
}

#[test]
fn test_rm_deletes_log() {
    let (dir, id) = populated_store();

    calltrace(&dir)
        .args(["log", "rm", &id.to_hex()])
        .assert()
        .success()
        .stdout(predicate::str::contains("removed"));

    calltrace(&dir)
        .args(["log", "ls"])
        .assert()
        .success()
        .stdout(predicate::str::contains(id.to_hex()).not());
}
