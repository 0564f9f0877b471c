//! Call-stack reconstruction scenarios for the state simulator
//!
//! # Test Coverage
//!
//! - Nested calls on one goroutine
//! - Interleaved goroutines
//! - Deep nesting with interval containment
//! - Endless functions surviving `clear()`
//! - Concurrent producer and snapshot reader

use calltrace::simulator::StateSimulator;
use calltrace::types::{CallRecord, GoroutineRecord, RawEvent};
use std::sync::Arc;
use std::thread;

fn by_start(mut calls: Vec<CallRecord>) -> Vec<CallRecord> {
    calls.sort_by_key(|c| c.start_time);
    calls
}

#[test]
fn test_nested_calls_on_one_goroutine() {
    let sim = StateSimulator::new();
    let (a, b) = (1, 2);

    sim.next(&RawEvent::start(1, 0, a, vec![0x10])).unwrap();
    sim.next(&RawEvent::start(2, 0, b, vec![0x20, 0x10])).unwrap();
    sim.next(&RawEvent::end(3, 0, b, vec![0x20, 0x10])).unwrap();
    sim.next(&RawEvent::end(4, 0, a, vec![0x10])).unwrap();

    let calls = by_start(sim.call_records());
    assert_eq!(calls.len(), 2);

    let outer = &calls[0];
    let inner = &calls[1];
    assert_eq!(outer.start_time, 1);
    assert_eq!(outer.end_time, Some(4));
    assert_eq!(outer.parent_id, None);
    assert_eq!(inner.start_time, 2);
    assert_eq!(inner.end_time, Some(3));
    assert_eq!(inner.parent_id, Some(outer.id));

    assert_eq!(
        sim.goroutines(),
        vec![GoroutineRecord {
            gid: 0,
            start_time: 1,
            end_time: Some(4)
        }]
    );
}

#[test]
fn test_interleaved_goroutines_are_independent() {
    let sim = StateSimulator::new();

    sim.next(&RawEvent::start(1, 1, 10, vec![])).unwrap();
    sim.next(&RawEvent::end(2, 1, 10, vec![])).unwrap();
    sim.next(&RawEvent::start(3, 2, 20, vec![])).unwrap();
    sim.next(&RawEvent::end(4, 2, 20, vec![])).unwrap();

    let goroutines = sim.goroutines();
    assert_eq!(
        goroutines,
        vec![
            GoroutineRecord {
                gid: 1,
                start_time: 1,
                end_time: Some(2)
            },
            GoroutineRecord {
                gid: 2,
                start_time: 3,
                end_time: Some(4)
            },
        ]
    );
    assert!(sim.call_records().iter().all(|c| c.parent_id.is_none()));
}

#[test]
fn test_truly_interleaved_events_keep_separate_stacks() {
    let sim = StateSimulator::new();

    let a = sim.next(&RawEvent::start(1, 1, 1, vec![])).unwrap();
    let b = sim.next(&RawEvent::start(2, 2, 2, vec![])).unwrap();
    let a2 = sim.next(&RawEvent::start(3, 1, 3, vec![])).unwrap();
    let b2 = sim.next(&RawEvent::start(4, 2, 4, vec![])).unwrap();

    assert_eq!(sim.call(a2).unwrap().parent_id, Some(a));
    assert_eq!(sim.call(b2).unwrap().parent_id, Some(b));
}

#[test]
fn test_deep_nesting_parent_chain_and_containment() {
    let sim = StateSimulator::new();
    let depth = 50u64;

    for i in 0..depth {
        sim.next(&RawEvent::start(i as i64, 7, i, vec![i])).unwrap();
    }
    for i in (0..depth).rev() {
        sim.next(&RawEvent::end(1000 - i as i64, 7, i, vec![i]))
            .unwrap();
    }

    let calls = sim.call_records();
    assert_eq!(calls.len(), depth as usize);

    // Walk from the innermost call up to the root
    let innermost = calls.iter().max_by_key(|c| c.start_time).unwrap();
    let mut chain = 1;
    let mut current = innermost;
    while let Some(parent_id) = current.parent_id {
        let parent = calls.iter().find(|c| c.id == parent_id).unwrap();
        assert!(parent.start_time <= current.start_time);
        assert!(current.end_time.unwrap() <= parent.end_time.unwrap());
        current = parent;
        chain += 1;
    }
    assert_eq!(chain, depth);
}

#[test]
fn test_endless_function_survives_clear() {
    let sim = StateSimulator::new();

    // main never returns
    let main = sim.next(&RawEvent::start(1, 0, 1, vec![0x1])).unwrap();
    for tx in 2..10 {
        sim.next(&RawEvent::start(tx as i64 * 10, 0, tx, vec![0x2]))
            .unwrap();
        sim.next(&RawEvent::end(tx as i64 * 10 + 5, 0, tx, vec![0x2]))
            .unwrap();
    }

    let snapshot = sim.call_records();
    let endless = snapshot.iter().find(|c| c.id == main).unwrap();
    assert_eq!(endless.end_time, None);

    assert_eq!(sim.clear(), 8);
    let remaining = sim.call_records();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, main);
    assert_eq!(sim.goroutine(0).unwrap().end_time, None);
}

#[test]
fn test_snapshot_copies_are_independent_of_later_events() {
    let sim = StateSimulator::new();
    let id = sim.next(&RawEvent::start(1, 0, 1, vec![1, 2, 3])).unwrap();
    let snapshot = sim.call_records();

    sim.next(&RawEvent::end(2, 0, 1, vec![])).unwrap();
    sim.clear();
    // Recycled buffers must not leak into the snapshot
    sim.next(&RawEvent::start(3, 0, 2, vec![9])).unwrap();

    assert_eq!(snapshot[0].id, id);
    assert_eq!(snapshot[0].frames, vec![1, 2, 3]);
    assert_eq!(snapshot[0].end_time, None);
}

#[test]
fn test_concurrent_producer_and_snapshot_reader() {
    let sim = Arc::new(StateSimulator::new());

    let producer = {
        let sim = Arc::clone(&sim);
        thread::spawn(move || {
            for tx in 0..2000u64 {
                let gid = (tx % 8) as i64;
                sim.next(&RawEvent::start(tx as i64, gid, tx, vec![tx]))
                    .unwrap();
                sim.next(&RawEvent::end(tx as i64 + 1, gid, tx, vec![tx]))
                    .unwrap();
                if tx % 100 == 0 {
                    sim.clear();
                }
            }
        })
    };

    let reader = {
        let sim = Arc::clone(&sim);
        thread::spawn(move || {
            for _ in 0..200 {
                for call in sim.call_records() {
                    if let Some(end) = call.end_time {
                        assert!(call.start_time <= end);
                    }
                }
                let _ = sim.goroutines();
            }
        })
    };

    producer.join().unwrap();
    reader.join().unwrap();

    assert_eq!(sim.open_calls(), 0);
    assert_eq!(sim.goroutines().len(), 8);
    assert_eq!(sim.next_id(), 2000);
}
