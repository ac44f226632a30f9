#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::thread;

use bucketgc::types::gen_after;
use bucketgc::{
    CounterGcMetrics, DeviceId, DeviceLayout, ExtentPtr, Filesystem, FsOptions, GcOptions, Key,
    MemAllocator, MemTreeStore, PassKind, Pos, Result, TreeBuilder, TreeId, TreeStore,
};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("bucketgc=warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

struct Harness {
    store: Arc<MemTreeStore>,
    fs: Arc<Filesystem>,
    metrics: Arc<CounterGcMetrics>,
}

fn harness(keys: Vec<Key>, gc: GcOptions) -> Result<Harness> {
    let store = Arc::new(MemTreeStore::new());
    TreeBuilder::new(TreeId::Extents)
        .node_buckets(DeviceId(0), 60, 0)
        .leaf(keys)
        .build(&store)?;
    let metrics = Arc::new(CounterGcMetrics::default());
    let fs = FsOptions::new(store.clone(), Arc::new(MemAllocator::new()))
        .name("gens")
        .device(DeviceLayout::new(DeviceId(0), 64, 128))
        .gc(gc)
        .metrics(metrics.clone())
        .build()?;
    Ok(Harness { store, fs, metrics })
}

fn dirty_and_cached(offset: u64) -> Key {
    Key::extent(
        Pos::new(1, offset),
        8,
        [
            ExtentPtr::dirty(DeviceId(0), 4, 0),
            ExtentPtr::cached(DeviceId(0), 5, 0),
        ],
    )
}

#[test]
fn conflicting_commits_are_retried() -> Result<()> {
    init_tracing();
    let h = harness(vec![dirty_and_cached(8)], GcOptions::default())?;
    h.fs.buckets().update_live(DeviceId(0), 5, |b| b.mark.gen = 40)?;
    h.store.inject_commit_conflicts(3);

    let stats = h.fs.run_generation_gc()?;
    assert_eq!(stats.kind, Some(PassKind::Generation));
    assert_eq!(stats.keys_rewritten, 1);
    let stored = h
        .store
        .lookup_key(TreeId::Extents, Pos::new(1, 8))
        .expect("key");
    assert_eq!(stored.ptrs().len(), 1);
    assert!(!stored.ptrs()[0].cached);
    assert_eq!(h.fs.buckets().live(DeviceId(0), 5)?.oldest_gen, 40);
    assert_eq!(h.metrics.keys_rewritten.load(Ordering::Relaxed), 1);
    assert_eq!(h.metrics.generation_passes.load(Ordering::Relaxed), 1);
    Ok(())
}

#[test]
fn key_is_skipped_once_retries_run_out() -> Result<()> {
    init_tracing();
    let gc = GcOptions {
        gens_max_commit_retries: 2,
        ..GcOptions::default()
    };
    let h = harness(vec![dirty_and_cached(8), dirty_and_cached(16)], gc)?;
    h.fs.buckets().update_live(DeviceId(0), 5, |b| b.mark.gen = 40)?;
    h.store.inject_commit_conflicts(6);

    let stats = h.fs.run_generation_gc()?;
    assert_eq!(stats.keys_rewritten, 0);
    assert_eq!(h.fs.buckets().live(DeviceId(0), 5)?.oldest_gen, 0);
    assert_eq!(h.store.leaf_keys(TreeId::Extents)[0].ptrs().len(), 2);

    h.store.inject_commit_conflicts(0);
    let stats = h.fs.run_generation_gc()?;
    assert_eq!(stats.keys_rewritten, 2);
    assert_eq!(h.fs.buckets().live(DeviceId(0), 5)?.oldest_gen, 40);
    assert_eq!(h.fs.gc_count(), 2);
    Ok(())
}

#[test]
fn oldest_gen_follows_wrapped_generations() -> Result<()> {
    init_tracing();
    let key = Key::extent(Pos::new(1, 8), 8, [ExtentPtr::dirty(DeviceId(0), 4, 250)]);
    let h = harness(vec![key], GcOptions::default())?;
    h.fs.buckets().update_live(DeviceId(0), 4, |b| b.mark.gen = 2)?;

    let stats = h.fs.run_generation_gc()?;
    assert_eq!(stats.keys_rewritten, 0);
    let bucket = h.fs.buckets().live(DeviceId(0), 4)?;
    assert_eq!(bucket.mark.gen, 2);
    assert_eq!(bucket.oldest_gen, 250);
    Ok(())
}

#[test]
fn usage_is_left_alone() -> Result<()> {
    init_tracing();
    let h = harness(vec![dirty_and_cached(8)], GcOptions::default())?;
    let before = h.fs.usage().live();
    h.fs.run_generation_gc()?;
    assert_eq!(h.fs.usage().live(), before);
    assert_eq!(h.fs.buckets().live(DeviceId(0), 4)?.mark.dirty_sectors, 0);
    assert!(h.fs.issues().is_empty());
    Ok(())
}

#[test]
fn shutdown_stops_the_pass() -> Result<()> {
    init_tracing();
    let h = harness(vec![dirty_and_cached(8)], GcOptions::default())?;
    h.fs.begin_shutdown();
    assert!(matches!(
        h.fs.run_generation_gc(),
        Err(bucketgc::GcError::Shutdown)
    ));
    assert_eq!(h.fs.gc_count(), 0);
    Ok(())
}

#[test]
fn runs_serialize_with_full_passes() -> Result<()> {
    init_tracing();
    let h = harness(
        (1..=8).map(|i| dirty_and_cached(i * 8)).collect(),
        GcOptions {
            rebuild_replicas: true,
            ..GcOptions::default()
        },
    )?;
    let workers: Vec<_> = (0..2)
        .map(|i| {
            let fs = h.fs.clone();
            thread::spawn(move || -> Result<()> {
                for _ in 0..5 {
                    if i == 0 {
                        fs.run_generation_gc()?;
                    } else {
                        fs.run_full_gc(false)?;
                    }
                }
                Ok(())
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker panicked")?;
    }
    assert_eq!(h.fs.gc_count(), 10);
    assert_eq!(h.metrics.full_passes.load(Ordering::Relaxed), 5);
    assert_eq!(h.metrics.generation_passes.load(Ordering::Relaxed), 5);
    assert_eq!(h.fs.buckets().live(DeviceId(0), 4)?.mark.dirty_sectors, 64);
    Ok(())
}

#[test]
fn concurrent_generation_passes_never_overshoot() -> Result<()> {
    init_tracing();
    let key = Key::extent(Pos::new(1, 8), 8, [ExtentPtr::dirty(DeviceId(0), 4, 3)]);
    let h = harness(vec![key], GcOptions::default())?;
    h.fs.buckets().update_live(DeviceId(0), 4, |b| b.mark.gen = 5)?;

    let done = Arc::new(AtomicBool::new(false));
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let fs = h.fs.clone();
            thread::spawn(move || -> Result<()> {
                for _ in 0..20 {
                    fs.run_generation_gc()?;
                }
                Ok(())
            })
        })
        .collect();
    let watcher = {
        let fs = h.fs.clone();
        let done = done.clone();
        thread::spawn(move || -> Result<()> {
            while !done.load(Ordering::Acquire) {
                let oldest = fs.buckets().live(DeviceId(0), 4)?.oldest_gen;
                assert_eq!(gen_after(oldest, 3), 0, "oldest_gen {oldest} passed a live pointer");
            }
            Ok(())
        })
    };
    for worker in workers {
        worker.join().expect("worker panicked")?;
    }
    done.store(true, Ordering::Release);
    watcher.join().expect("watcher panicked")?;

    assert_eq!(h.fs.gc_count(), 80);
    assert_eq!(h.fs.buckets().live(DeviceId(0), 4)?.oldest_gen, 3);
    Ok(())
}
