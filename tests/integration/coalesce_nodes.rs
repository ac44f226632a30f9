#![allow(missing_docs)]

use std::ops::Range;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Once};

use bucketgc::types::{POS_MAX, POS_MIN};
use bucketgc::{
    CounterGcMetrics, DeviceId, DeviceLayout, ExtentPtr, Filesystem, FsOptions, GcError,
    GcOptions, Key, MemAllocator, MemTreeStore, Pos, ReserveClass, Result, TreeBuilder, TreeId,
};
use proptest::prelude::*;
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
    alloc: Arc<MemAllocator>,
    fs: Arc<Filesystem>,
    metrics: Arc<CounterGcMetrics>,
}

/// Leaf `i` of `sizes` gets `sizes[i]` consecutive 8-sector extents.
fn leaves(sizes: &[usize]) -> Vec<Vec<Key>> {
    let mut next = 0u64;
    sizes
        .iter()
        .map(|&n| {
            (0..n)
                .map(|_| {
                    let key = Key::extent(
                        Pos::new(1, (next + 1) * 8),
                        8,
                        [ExtentPtr::dirty(DeviceId(0), next, 0)],
                    );
                    next += 1;
                    key
                })
                .collect()
        })
        .collect()
}

fn harness(sizes: &[usize], node_u64s: usize) -> Result<Harness> {
    harness_with_free(sizes, node_u64s, 150..250)
}

fn harness_with_free(sizes: &[usize], node_u64s: usize, free: Range<u64>) -> Result<Harness> {
    let store = Arc::new(MemTreeStore::new());
    let mut builder = TreeBuilder::new(TreeId::Extents).node_buckets(DeviceId(0), 100, 0);
    for leaf in leaves(sizes) {
        builder = builder.leaf(leaf);
    }
    builder.build(&store)?;

    let alloc = Arc::new(MemAllocator::new());
    for bucket in free {
        alloc.push_free(ReserveClass::Btree, DeviceId(0), bucket);
    }
    let metrics = Arc::new(CounterGcMetrics::default());
    let gc = GcOptions {
        node_u64s,
        rebuild_replicas: true,
        ..GcOptions::default()
    };
    let fs = FsOptions::new(store.clone(), alloc.clone())
        .name("coalesce")
        .device(DeviceLayout::new(DeviceId(0), 256, 128))
        .gc(gc)
        .metrics(metrics.clone())
        .build()?;
    Ok(Harness {
        store,
        alloc,
        fs,
        metrics,
    })
}

#[test]
fn three_sparse_leaves_become_two() -> Result<()> {
    init_tracing();
    // the first two leaves fit one node on their own
    let h = harness(&[4, 4, 4], 48)?;
    let before = h.store.leaf_keys(TreeId::Extents);

    let stats = h.fs.coalesce_all_trees()?;

    assert_eq!(stats.nodes_merged_away, 1);
    let after = h.store.nodes_at_level(TreeId::Extents, 0);
    assert_eq!(after.len(), 2);
    assert_eq!(after[0].read().keys.len(), 8);
    assert_eq!(after[1].read().keys.len(), 4);
    assert_eq!(h.store.leaf_keys(TreeId::Extents), before);
    assert!(h.store.topology_errors(TreeId::Extents).is_empty());
    assert_eq!(h.metrics.nodes_merged_away.load(Ordering::Relaxed), 1);
    assert_eq!(h.metrics.coalesce_sweeps.load(Ordering::Relaxed), 1);
    assert_eq!(h.alloc.free_count(), 99);
    Ok(())
}

#[test]
fn three_leaves_repack_into_two_filled_from_the_right() -> Result<()> {
    init_tracing();
    let h = harness(&[6, 6, 1], 48)?;
    let before = h.store.leaf_keys(TreeId::Extents);
    let old = h.store.nodes_at_level(TreeId::Extents, 0);
    let writes = h.store.writes();

    let stats = h.fs.coalesce_all_trees()?;

    assert_eq!(stats.nodes_merged_away, 1);
    assert!(old.iter().all(|node| node.is_freed()));
    let after = h.store.nodes_at_level(TreeId::Extents, 0);
    let sizes: Vec<usize> = after.iter().map(|node| node.read().keys.len()).collect();
    assert_eq!(sizes, vec![5, 8]);
    assert_eq!(h.store.leaf_keys(TreeId::Extents), before);

    let (left, right) = (after[0].read(), after[1].read());
    assert_eq!((left.min_key, left.max_key), (POS_MIN, Pos::new(1, 40)));
    assert_eq!((right.min_key, right.max_key), (Pos::new(1, 41), POS_MAX));
    let root = h.store.nodes_at_level(TreeId::Extents, 1);
    let bounds: Vec<_> = root[0]
        .read()
        .keys
        .iter()
        .map(|key| (key.child_min(), key.pos))
        .collect();
    assert_eq!(
        bounds,
        vec![
            (Some(POS_MIN), Pos::new(1, 40)),
            (Some(Pos::new(1, 41)), POS_MAX),
        ]
    );
    assert!(h.store.topology_errors(TreeId::Extents).is_empty());

    assert_eq!(h.store.writes(), writes + 2);
    assert_eq!(h.alloc.free_count(), 98);
    for bucket in [150, 151] {
        let used = h.fs.buckets().live(DeviceId(0), bucket)?;
        assert_eq!(used.mark.dirty_sectors, h.fs.options().btree_node_sectors);
    }
    Ok(())
}

#[test]
fn failed_allocation_releases_built_replacements() -> Result<()> {
    init_tracing();
    let h = harness_with_free(&[6, 6, 1], 48, 150..151)?;
    let before = h.store.leaf_keys(TreeId::Extents);
    let nodes = h.store.node_count();
    let writes = h.store.writes();

    let err = h.fs.coalesce_all_trees().unwrap_err();
    assert!(matches!(err, GcError::ResourceExhausted(_)));

    // one replacement was built and written before the second allocation failed
    assert_eq!(h.store.writes(), writes + 1);
    assert_eq!(h.store.node_count(), nodes);
    assert_eq!(h.alloc.free_count(), 1);
    let bucket = h.fs.buckets().live(DeviceId(0), 150)?;
    assert!(bucket.mark.owned_by_allocator);
    assert_eq!(bucket.mark.dirty_sectors, 0);
    assert_eq!(h.store.nodes_at_level(TreeId::Extents, 0).len(), 3);
    assert_eq!(h.store.leaf_keys(TreeId::Extents), before);
    assert!(h.store.topology_errors(TreeId::Extents).is_empty());
    Ok(())
}

#[test]
fn live_accounting_follows_merges() -> Result<()> {
    init_tracing();
    let h = harness(&[2, 2, 2, 2], 256)?;
    h.fs.run_full_gc(true)?;

    h.fs.coalesce_all_trees()?;
    assert_eq!(h.store.nodes_at_level(TreeId::Extents, 0).len(), 1);

    let stats = h.fs.run_full_gc(false)?;
    assert_eq!(stats.corrections, 0);
    let old_leaf = h.fs.buckets().live(DeviceId(0), 100)?;
    assert_eq!(old_leaf.mark.dirty_sectors, 0);
    // 150 and 151 held the intermediate merges
    for bucket in [150, 151] {
        let freed = h.fs.buckets().live(DeviceId(0), bucket)?;
        assert_eq!(freed.mark.dirty_sectors, 0);
        assert!(!freed.mark.owned_by_allocator);
    }
    let new_leaf = h.fs.buckets().live(DeviceId(0), 152)?;
    assert_eq!(new_leaf.mark.dirty_sectors, h.fs.options().btree_node_sectors);
    Ok(())
}

#[test]
fn shutdown_aborts_the_sweep() -> Result<()> {
    init_tracing();
    let h = harness(&[2, 2, 2], 256)?;
    h.fs.begin_shutdown();

    let err = h.fs.coalesce_all_trees().unwrap_err();
    assert!(matches!(err, GcError::Shutdown));
    assert_eq!(h.store.nodes_at_level(TreeId::Extents, 0).len(), 3);
    assert_eq!(h.alloc.free_count(), 100);
    Ok(())
}

#[test]
fn exhausted_allocator_leaves_the_tree_intact() -> Result<()> {
    init_tracing();
    let store = Arc::new(MemTreeStore::new());
    let mut builder = TreeBuilder::new(TreeId::Extents).node_buckets(DeviceId(0), 100, 0);
    for leaf in leaves(&[2, 2]) {
        builder = builder.leaf(leaf);
    }
    builder.build(&store)?;
    let fs = FsOptions::new(store.clone(), Arc::new(MemAllocator::new()))
        .device(DeviceLayout::new(DeviceId(0), 256, 128))
        .build()?;

    let err = fs.coalesce_all_trees().unwrap_err();
    assert!(matches!(err, GcError::ResourceExhausted(_)));
    assert_eq!(store.nodes_at_level(TreeId::Extents, 0).len(), 2);
    assert!(store.topology_errors(TreeId::Extents).is_empty());
    Ok(())
}

fn sweep(sizes: &[usize], node_u64s: usize) -> Result<(Vec<Key>, Vec<Key>, usize, usize, usize)> {
    let h = harness(sizes, node_u64s)?;
    let before = h.store.leaf_keys(TreeId::Extents);
    let nodes_before = h.store.nodes_at_level(TreeId::Extents, 0).len();
    h.fs.coalesce_all_trees()?;
    let after = h.store.leaf_keys(TreeId::Extents);
    let nodes_after = h.store.nodes_at_level(TreeId::Extents, 0).len();
    let errors = h.store.topology_errors(TreeId::Extents).len();
    Ok((before, after, nodes_before, nodes_after, errors))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn coalescing_preserves_every_key(
        sizes in prop::collection::vec(1usize..6, 2..9),
        node_u64s in prop::sample::select(vec![32usize, 64, 256]),
    ) {
        init_tracing();
        let outcome = sweep(&sizes, node_u64s);
        prop_assert!(outcome.is_ok(), "sweep failed: {:?}", outcome.as_ref().err());
        let Ok((before, after, nodes_before, nodes_after, errors)) = outcome else {
            return Ok(());
        };
        prop_assert_eq!(before, after);
        prop_assert!(nodes_after <= nodes_before);
        prop_assert_eq!(errors, 0);
    }
}
