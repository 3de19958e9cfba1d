mod common;

use std::sync::Barrier;
use std::thread;

use common::*;
use gridtx_common::{EntryVersion, Key, Value};
use gridtx_transaction::{CommitOutcome, CoordinatorError};

#[test]
fn test_later_prepare_of_stale_read_fails() {
    let cluster = three_nodes(test_config());
    let a = cluster.node("a").unwrap();
    let c = cluster.node("c").unwrap();

    let t0 = a.begin().unwrap();
    a.write(&t0, "k", "v0").unwrap();
    assert_eq!(a.commit(&t0).unwrap(), CommitOutcome::Committed);

    let t1 = a.begin().unwrap();
    let t2 = c.begin().unwrap();
    assert_eq!(a.read(&t1, "k").unwrap(), Some(Value::from("v0")));
    assert_eq!(c.read(&t2, "k").unwrap(), Some(Value::from("v0")));

    a.write(&t1, "k", "v1").unwrap();
    c.write(&t2, "k", "v2").unwrap();
    assert_eq!(a.commit(&t1).unwrap(), CommitOutcome::Committed);

    let err = c.commit(&t2).unwrap_err();
    assert!(
        matches!(&err, CoordinatorError::WriteSkew { key, .. } if key == &Key::from("k")),
        "{err:?}"
    );

    for owner in ["b", "c"] {
        let container = cluster.node(owner).unwrap().container();
        assert_eq!(container.value(&Key::from("k")), Some(Value::from("v1")));
        assert_eq!(container.version(&Key::from("k")), Some(EntryVersion::new(1, 2)));
    }
    assert!(cluster.node("a").unwrap().container().is_empty());
    for node in cluster.nodes() {
        assert_eq!(node.table().local_tx_count(), 0);
        assert_eq!(node.table().remote_tx_count(), 0);
        assert!(node.table().key_dependencies().is_empty());
    }
}

#[test]
fn test_concurrent_creates_of_absent_key_conflict() {
    let cluster = three_nodes(test_config());
    let a = cluster.node("a").unwrap();
    let c = cluster.node("c").unwrap();

    let t1 = a.begin().unwrap();
    let t2 = c.begin().unwrap();
    assert_eq!(a.read(&t1, "k").unwrap(), None);
    assert_eq!(c.read(&t2, "k").unwrap(), None);

    a.write(&t1, "k", "v1").unwrap();
    c.write(&t2, "k", "v2").unwrap();
    assert_eq!(a.commit(&t1).unwrap(), CommitOutcome::Committed);

    let err = c.commit(&t2).unwrap_err();
    assert!(
        matches!(&err, CoordinatorError::WriteSkew { key, .. } if key == &Key::from("k")),
        "{err:?}"
    );
    for owner in ["b", "c"] {
        let container = cluster.node(owner).unwrap().container();
        assert_eq!(container.value(&Key::from("k")), Some(Value::from("v1")));
        assert_eq!(container.version(&Key::from("k")), Some(EntryVersion::new(1, 1)));
    }
}

#[test]
fn test_disjoint_writes_do_not_conflict() {
    let cluster = three_nodes(test_config());
    let a = cluster.node("a").unwrap();
    let b = cluster.node("b").unwrap();

    let t1 = a.begin().unwrap();
    a.write(&t1, "k", "v1").unwrap();
    let t2 = b.begin().unwrap();
    b.write(&t2, "other", "x").unwrap();
    assert_eq!(a.commit(&t1).unwrap(), CommitOutcome::Committed);
    assert_eq!(b.commit(&t2).unwrap(), CommitOutcome::Committed);

    // `other` has no assigned owners, every member stores it.
    for node in cluster.nodes() {
        assert_eq!(node.container().value(&Key::from("other")), Some(Value::from("x")));
    }
}

#[test]
fn test_concurrent_conflicting_prepares() {
    let cluster = three_nodes(test_config());
    let a = cluster.node("a").unwrap();
    let c = cluster.node("c").unwrap();

    let seed = a.begin().unwrap();
    a.write(&seed, "k", "seed").unwrap();
    a.commit(&seed).unwrap();

    for round in 0..20 {
        let barrier = Barrier::new(2);
        let (first, second) = thread::scope(|s| {
            let run = |node: &gridtx_test::Node, value: String| {
                let tx = node.begin().unwrap();
                node.read(&tx, "k").unwrap();
                node.write(&tx, "k", value.clone()).unwrap();
                barrier.wait();
                node.commit(&tx).map(|_| value)
            };
            let first = s.spawn(move || run(a, format!("a-{round}")));
            let second = s.spawn(move || run(c, format!("c-{round}")));
            (first.join().unwrap(), second.join().unwrap())
        });

        let winners: Vec<String> = [first, second].into_iter().filter_map(Result::ok).collect();
        assert_eq!(winners.len(), 1, "round {round}");
        let expected = Value::from(winners[0].clone());
        for owner in ["b", "c"] {
            let container = cluster.node(owner).unwrap().container();
            assert_eq!(container.value(&Key::from("k")), Some(expected.clone()));
        }
    }

    let versions: Vec<_> = ["b", "c"]
        .iter()
        .map(|owner| cluster.node(owner).unwrap().container().version(&Key::from("k")))
        .collect();
    assert_eq!(versions[0], versions[1]);
    assert_eq!(versions[0], Some(EntryVersion::new(1, 21)));
}
