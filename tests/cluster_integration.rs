//! Cluster integration tests
//!
//! Drives multiple simulated nodes over a totally ordered message bus and
//! checks convergence, ownership transfer, and checkpoint state transfer.

#[allow(dead_code)]
mod common;

use common::{lock, lock_wait, unlock, ClusterBuilder, MemSnapshotStore};
use plockd::checkpoint::{self, SnapshotError};
use plockd::types::OwnerState;

// =============================================================================
// Convergence (ownership disabled)
// =============================================================================

#[test]
fn test_replicated_ops_converge() {
    let mut cluster = ClusterBuilder::new(3).build();

    cluster.node(1).submit_local(lock(1, 10, 0, 99, true));
    cluster.node(2).submit_local(lock(2, 10, 200, 299, false));
    cluster.node(3).submit_local(lock(3, 10, 250, 350, false));
    cluster.node(2).submit_local(lock(2, 11, 0, 9, true));
    cluster.pump();

    cluster.node(1).submit_local(unlock(1, 10, 0, 49));
    cluster.node(3).submit_local(lock(3, 11, 100, 199, true));
    cluster.node(2).submit_local(unlock(2, 10, 200, 299));
    cluster.pump();

    cluster.assert_converged();
    // shared ranges from different owners coexist
    let r = cluster.node(1).resource(10).unwrap();
    assert!(r.locks.iter().any(|po| po.node == 3));
    assert!(r.locks.iter().any(|po| po.node == 1 && po.start == 50));
}

#[test]
fn test_shrink_then_release_serves_waiter() {
    // lock [0,99] ex by node 1; lock [200,299] sh by node 2; then node 2
    // waits on [50,149] ex. Releasing [0,49] shrinks node 1's lock but the
    // waiter stays blocked; releasing [50,99] frees it.
    let mut cluster = ClusterBuilder::new(2).build();

    cluster.node(1).submit_local(lock(1, 9, 0, 99, true));
    cluster.node(2).submit_local(lock(2, 9, 200, 299, false));
    cluster.pump();

    cluster.node(2).submit_local(lock_wait(2, 9, 50, 149, true));
    cluster.pump();
    for id in 1..=2 {
        assert_eq!(cluster.node(id).resource(9).unwrap().waiters.len(), 1);
    }

    cluster.node(1).submit_local(unlock(1, 9, 0, 49));
    cluster.pump();
    let r = cluster.node(1).resource(9).unwrap();
    assert!(r.locks.iter().any(|po| po.node == 1 && po.start == 50 && po.end == 99));
    assert_eq!(r.waiters.len(), 1);

    cluster.node(1).submit_local(unlock(1, 9, 50, 99));
    cluster.pump();

    cluster.assert_converged();
    let r = cluster.node(2).resource(9).unwrap();
    assert!(r.waiters.is_empty());
    assert!(r
        .locks
        .iter()
        .any(|po| po.node == 2 && po.start == 50 && po.end == 149 && po.exclusive));

    // the waiter's grant produced exactly one more local result on node 2
    let results = cluster.nodes[1].results.0.lock().unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|rec| rec.rv == 0));
}

#[test]
fn test_would_block_without_wait() {
    let mut cluster = ClusterBuilder::new(2).build();

    cluster.node(1).submit_local(lock(1, 9, 0, 99, true));
    cluster.pump();

    cluster.node(2).submit_local(lock(2, 9, 0, 9, true));
    cluster.pump();

    let results = cluster.nodes[1].results.0.lock().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].rv, -libc::EAGAIN);
}

// =============================================================================
// Ownership protocol
// =============================================================================

#[test]
fn test_ownership_mutual_exclusion() {
    let mut cluster = ClusterBuilder::new(2).ownership(true).build();

    // both nodes race for the same resource
    cluster.node(1).submit_local(lock(1, 42, 0, 9, true));
    cluster.node(2).submit_local(lock(2, 42, 100, 109, true));

    // at every point in the totally ordered delivery, at most one node may
    // believe it owns the resource
    while cluster.step() {
        assert!(cluster.self_owner_count(42) <= 1);
    }

    // the loser's announcement forced the winner to relinquish; both locks
    // ended up replicated everywhere
    cluster.assert_converged();
    for id in 1..=2 {
        let r = cluster.node(id).resource(42).unwrap();
        assert_eq!(r.locks.len(), 2);
        assert!(r.owner.is_unowned());
    }
}

#[test]
fn test_owner_applies_locally_without_messages() {
    let mut cluster = ClusterBuilder::new(2).ownership(true).build();

    cluster.node(1).submit_local(lock(1, 42, 0, 9, true));
    assert_eq!(cluster.pump(), 1); // just the ownership announcement
    assert_eq!(
        cluster.node(1).resource(42).unwrap().owner,
        OwnerState::Owned(1)
    );

    // the cheap path: further local ops are silent
    cluster.node(1).submit_local(lock(1, 42, 20, 29, true));
    cluster.node(1).submit_local(unlock(1, 42, 0, 9));
    assert_eq!(cluster.pump(), 0);

    assert_eq!(cluster.node(1).resource(42).unwrap().locks.len(), 1);
    // the owned state is not replicated
    assert!(cluster.node(2).resource(42).unwrap().locks.is_empty());
}

#[test]
fn test_ownership_handover_syncs_state() {
    let mut cluster = ClusterBuilder::new(2).ownership(true).build();

    cluster.node(1).submit_local(lock(1, 42, 0, 99, true));
    cluster.pump();
    assert_eq!(
        cluster.node(1).resource(42).unwrap().owner,
        OwnerState::Owned(1)
    );

    // node 2 needs the resource; node 1 must sync its lock over
    cluster.node(2).submit_local(lock(2, 42, 200, 299, true));
    cluster.pump();

    cluster.assert_converged();
    for id in 1..=2 {
        let r = cluster.node(id).resource(42).unwrap();
        assert!(r.owner.is_unowned());
        assert_eq!(r.locks.len(), 2);
        assert!(r.locks.iter().any(|po| po.node == 1 && po.end == 99));
        assert!(r.locks.iter().any(|po| po.node == 2 && po.end == 299));
    }
}

#[test]
fn test_drop_handshake_frees_resource_everywhere() {
    let mut cluster = ClusterBuilder::new(2).ownership(true).build();

    cluster.node(1).submit_local(lock(1, 42, 0, 9, true));
    cluster.pump();
    cluster.node(1).submit_local(unlock(1, 42, 0, 9));
    cluster.pump();

    // sweep 1: relinquish the idle owned resource
    let now = std::time::Instant::now();
    cluster.node(1).drop_sweep(now);
    cluster.pump();
    assert_eq!(
        cluster.node(1).resource(42).unwrap().owner,
        OwnerState::Unowned { acked: true }
    );

    // sweep 2: the acknowledged unowned resource gets a drop broadcast
    cluster.node(1).drop_sweep(std::time::Instant::now());
    cluster.pump();
    for id in 1..=2 {
        assert!(cluster.node(id).resource(42).is_none());
    }
}

#[test]
fn test_get_probe_never_broadcast() {
    let mut cluster = ClusterBuilder::new(2).ownership(true).build();

    cluster.node(1).submit_local(lock(1, 42, 0, 9, true));
    cluster.pump();

    let probe = plockd::types::LockOp {
        kind: plockd::types::OpKind::Get,
        ..lock(1, 42, 0, 9, true)
    };
    cluster.node(1).submit_local(probe);
    assert_eq!(cluster.pump(), 0);
}

// =============================================================================
// Checkpoint state transfer
// =============================================================================

#[tokio::test]
async fn test_checkpoint_roundtrip() {
    let mut cluster = ClusterBuilder::new(2).build();

    cluster.node(1).submit_local(lock(1, 10, 0, 99, true));
    cluster.node(2).submit_local(lock(2, 10, 200, 299, false));
    cluster.node(2).submit_local(lock(2, 11, 0, 9, false));
    cluster.pump();
    cluster.node(2).submit_local(lock_wait(2, 10, 0, 9, true));
    cluster.pump();

    let store = MemSnapshotStore::default();
    let sections = checkpoint::pack_group(cluster.node(1));
    checkpoint::store_locks(&store, "plock.gfs0", &sections)
        .await
        .unwrap();

    let resources = checkpoint::retrieve_locks(&store, "plock.gfs0", false, true)
        .await
        .unwrap();
    assert_eq!(resources.len(), cluster.node(1).resource_count());

    for restored in &resources {
        let orig = cluster.node(1).resource(restored.number).unwrap();
        let orig_locks: Vec<_> = orig
            .locks
            .iter()
            .map(|po| (po.start, po.end, po.exclusive, po.node, po.owner))
            .collect();
        let back_locks: Vec<_> = restored
            .locks
            .iter()
            .map(|po| (po.start, po.end, po.exclusive, po.node, po.owner))
            .collect();
        assert_eq!(orig_locks, back_locks);

        let orig_waiters: Vec<_> = orig.waiters.iter().map(|w| w.op).collect();
        let back_waiters: Vec<_> = restored.waiters.iter().map(|w| w.op).collect();
        assert_eq!(orig_waiters, back_waiters);
    }

    // the new master unlinked the checkpoint after reading it
    assert!(matches!(
        checkpoint::retrieve_locks(&store, "plock.gfs0", false, false).await,
        Err(SnapshotError::Missing)
    ));
}

#[tokio::test]
async fn test_checkpoint_replaces_prior_one() {
    let store = MemSnapshotStore::default();

    let sections = vec![("r1.0".to_string(), vec![0u8; 40])];
    checkpoint::store_locks(&store, "plock.gfs0", &sections)
        .await
        .unwrap();

    // a second store for the next joiner replaces the first wholesale
    let sections = vec![("r2.0".to_string(), vec![0u8; 80])];
    checkpoint::store_locks(&store, "plock.gfs0", &sections)
        .await
        .unwrap();

    let resources = checkpoint::retrieve_locks(&store, "plock.gfs0", true, false)
        .await
        .unwrap();
    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0].number, 2);
}

// =============================================================================
// Wire sanity under the sim bus
// =============================================================================

#[test]
fn test_handover_messages_survive_the_bus() {
    // the sim bus encodes and decodes every frame, so a full ownership
    // handover exercises the plock, own, and sync codecs end to end
    let mut cluster = ClusterBuilder::new(3).ownership(true).build();

    cluster.node(1).submit_local(lock(1, 1, 0, 9, true));
    cluster.pump();
    cluster.node(2).submit_local(lock_wait(2, 1, 0, 9, true));
    cluster.pump();
    cluster.assert_converged();

    // the contended range is held by node 1 with node 2 queued, everywhere
    for id in 1..=3 {
        let r = cluster.node(id).resource(1).unwrap();
        assert_eq!(r.locks.len(), 1);
        assert_eq!(r.locks[0].node, 1);
        assert_eq!(r.waiters.len(), 1);
    }
}
