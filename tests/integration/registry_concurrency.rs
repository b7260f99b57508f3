#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use pendel::config::PendelConfig;
use pendel::storage::Registry;
use pendel::types::{BackendId, PendelError, RelFileNodePendingDelete, Result, Xid};
use rustc_hash::FxHashSet;

const BACKENDS: u32 = 8;
const ROUNDS: u32 = 200;

fn rel_for(backend: u32, round: u32) -> u32 {
    backend * 1_000_000 + round
}

#[test]
fn backends_add_and_remove_concurrently() -> Result<()> {
    let registry = Registry::new(&PendelConfig::compact(BACKENDS as usize, 4096))?;
    // Backends plus the observing main thread.
    let barrier = Arc::new(Barrier::new(BACKENDS as usize + 1));
    let mut handles = Vec::new();

    for id in 0..BACKENDS {
        let registry = Arc::clone(&registry);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || -> Result<Vec<u32>> {
            let backend = registry.attach(BackendId(id))?;
            barrier.wait();
            let mut kept = Vec::new();
            let mut tokens = Vec::new();
            for round in 0..ROUNDS {
                let rel = rel_for(id, round);
                let token = backend.add(RelFileNodePendingDelete::new(1, 1, rel), Xid(100 + id))?;
                if round % 3 == 0 {
                    kept.push(rel);
                    tokens.push(token);
                } else {
                    backend.remove(token);
                }
            }
            assert_eq!(backend.pending_len(), kept.len());
            barrier.wait();
            barrier.wait();
            for token in tokens {
                backend.remove(token);
            }
            Ok(kept)
        }));
    }

    barrier.wait();
    barrier.wait();
    let expected_total = (BACKENDS * ROUNDS.div_ceil(3)) as usize;
    assert_eq!(registry.nodes_in_use(), expected_total);
    let snapshot = registry.dump()?.expect("entries");
    assert_eq!(snapshot.len(), expected_total);
    let seen: FxHashSet<(u32, u32)> = snapshot
        .iter()
        .map(|entry| (entry.relnode.node.rel, entry.xid.0))
        .collect();
    assert_eq!(seen.len(), expected_total);
    for id in 0..BACKENDS {
        assert!(seen.contains(&(rel_for(id, 0), 100 + id)));
        assert!(!seen.contains(&(rel_for(id, 1), 100 + id)));
    }
    barrier.wait();

    for handle in handles {
        let kept = handle.join().expect("backend thread")?;
        assert_eq!(kept.len(), ROUNDS.div_ceil(3) as usize);
    }
    assert_eq!(registry.nodes_in_use(), 0);
    assert!(registry.dump()?.is_none());
    Ok(())
}

#[test]
fn dump_runs_while_backends_mutate() -> Result<()> {
    let registry = Registry::new(&PendelConfig::compact(4, 1024))?;
    let stop = Arc::new(AtomicBool::new(false));
    let mut workers = Vec::new();

    for id in 0..4u32 {
        let registry = Arc::clone(&registry);
        let stop = Arc::clone(&stop);
        workers.push(thread::spawn(move || -> Result<()> {
            let backend = registry.attach(BackendId(id))?;
            let mut round = 0u32;
            while !stop.load(Ordering::Acquire) {
                let token = backend.add(
                    RelFileNodePendingDelete::new(1, id, round),
                    Xid(1000 + round),
                )?;
                backend.remove(token);
                round = round.wrapping_add(1);
            }
            Ok(())
        }));
    }

    for _ in 0..500 {
        if let Some(snapshot) = registry.dump()? {
            assert!(snapshot.len() <= 4);
            for entry in snapshot.iter() {
                assert!(entry.xid.is_valid());
            }
        }
    }
    stop.store(true, Ordering::Release);
    for worker in workers {
        worker.join().expect("worker thread")?;
    }
    assert_eq!(registry.nodes_in_use(), 0);
    Ok(())
}

#[test]
fn shared_arena_exhaustion_is_reported_per_backend() -> Result<()> {
    let registry = Registry::new(&PendelConfig::compact(2, 3))?;
    let a = registry.attach(BackendId(0))?;
    let b = registry.attach(BackendId(1))?;
    let t1 = a.add(RelFileNodePendingDelete::new(1, 1, 1), Xid(10))?;
    let t2 = a.add(RelFileNodePendingDelete::new(1, 1, 2), Xid(10))?;
    let t3 = b.add(RelFileNodePendingDelete::new(1, 1, 3), Xid(20))?;

    match b.add(RelFileNodePendingDelete::new(1, 1, 4), Xid(20)) {
        Err(PendelError::OutOfMemory { backend, capacity }) => {
            assert_eq!(backend, BackendId(1));
            assert_eq!(capacity, 3);
        }
        other => panic!("expected out of memory, got {other:?}"),
    }

    // Removing from one backend frees capacity for the other.
    a.remove(t1);
    let t4 = b.add(RelFileNodePendingDelete::new(1, 1, 4), Xid(20))?;
    assert_eq!(b.pending_len(), 2);
    assert_eq!(a.pending_len(), 1);

    a.remove(t2);
    b.remove(t3);
    b.remove(t4);
    Ok(())
}
