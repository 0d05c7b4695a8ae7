//! Regression tests for the reference index workload: a handful of rows
//! indexed by a non-unique column, queried through an exclusive range scan,
//! single-threaded and under concurrent duplicate inserts.

#![expect(clippy::unwrap_used, reason = "fail fast in tests")]

mod common;

use std::sync::Arc;
use std::thread;

use blinktree::{BLinkTree, PayloadRef};

/// A caller-side record; the tree indexes column `b` and stores the row's
/// address as the payload.
#[derive(Debug, PartialEq, Eq)]
struct Row {
    a: i32,
    b: i64,
}

const ROWS: [Row; 6] = [
    Row { a: 1000, b: 20 },
    Row { a: 1000, b: 31 },
    Row { a: 500, b: 75 },
    Row { a: 2000, b: 31 },
    Row { a: 2000, b: 16 },
    Row { a: 4500, b: 50 },
];

fn index_rows(tree: &BLinkTree, rows: &[Row]) {
    for row in rows {
        tree.insert(row.b, PayloadRef::from_addr(row));
    }
}

fn scanned_keys(tree: &BLinkTree, min: i64, max: i64) -> Vec<i64> {
    let mut out = Vec::new();
    tree.scan_range(min, max, &mut out);
    out.iter()
        .map(|p| unsafe { &*(p.get() as *const Row) }.b)
        .collect()
}

#[test]
fn range_scan_returns_exact_keys_in_order() {
    common::init_tracing();
    let tree = BLinkTree::new();
    index_rows(&tree, &ROWS);

    // Strictly-exclusive bounds: 75 is excluded because 75 >= 51, and the
    // duplicate 31s both appear.
    assert_eq!(scanned_keys(&tree, 10, 51), vec![16, 20, 31, 31, 50]);
}

#[test]
fn point_search_resolves_rows() {
    common::init_tracing();
    let tree = BLinkTree::new();
    index_rows(&tree, &ROWS);

    let hit = tree.get(16).unwrap();
    let row: &Row = unsafe { &*(hit.get() as *const Row) };
    assert_eq!(row.a, 2000);

    assert!(tree.get(75).is_some());
    assert!(tree.get(99).is_none());
}

#[test]
fn concurrent_duplicate_inserts_all_survive() {
    common::init_tracing();
    let tree = Arc::new(BLinkTree::new());

    // Three threads index the same six-row batch into one shared tree.
    let batches: Vec<&'static [Row; 6]> = vec![&ROWS, &ROWS, &ROWS];
    let handles: Vec<_> = batches
        .into_iter()
        .map(|batch| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || index_rows(&tree, batch))
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    // Five of the six keys fall inside the range, once per batch.
    let keys = scanned_keys(&tree, 10, 51);
    assert_eq!(keys.len(), 15);
    let mut sorted = keys.clone();
    sorted.sort_unstable();
    assert_eq!(keys, sorted, "range output must be ascending");
    assert_eq!(keys.iter().filter(|&&k| k == 31).count(), 6);
}

#[test]
fn delete_peels_duplicates_one_at_a_time() {
    common::init_tracing();
    let tree = BLinkTree::new();
    index_rows(&tree, &ROWS);

    assert_eq!(scanned_keys(&tree, 10, 51), vec![16, 20, 31, 31, 50]);

    assert!(tree.remove(31));
    assert_eq!(
        scanned_keys(&tree, 10, 51),
        vec![16, 20, 31, 50],
        "exactly one 31 must go"
    );

    assert!(tree.remove(31));
    assert_eq!(scanned_keys(&tree, 10, 51), vec![16, 20, 50]);

    assert!(!tree.remove(31), "no third duplicate exists");
}
