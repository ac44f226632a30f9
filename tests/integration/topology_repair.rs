#![allow(missing_docs)]

use std::sync::{Arc, Once};

use bucketgc::tree::mem::BuiltTree;
use bucketgc::types::{POS_MAX, POS_MIN};
use bucketgc::{
    DeviceId, DeviceLayout, ExtentPtr, Filesystem, FsOptions, GcOptions, IssueKind, Key, KeyValue,
    MemAllocator, MemTreeStore, Pos, Result, TreeBuilder, TreeId,
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

fn extent(offset: u64, bucket: u64) -> Key {
    Key::extent(
        Pos::new(1, offset),
        8,
        [ExtentPtr::dirty(DeviceId(0), bucket, 0)],
    )
}

fn three_leaves(store: &MemTreeStore) -> Result<BuiltTree> {
    TreeBuilder::new(TreeId::Extents)
        .node_buckets(DeviceId(0), 60, 0)
        .leaf(vec![extent(8, 1), extent(16, 2)])
        .leaf(vec![extent(24, 3)])
        .leaf(vec![extent(32, 4)])
        .build(store)
}

fn open(store: Arc<MemTreeStore>) -> Result<Arc<Filesystem>> {
    let gc = GcOptions {
        rebuild_replicas: true,
        ..GcOptions::default()
    };
    FsOptions::new(store, Arc::new(MemAllocator::new()))
        .name("topology")
        .device(DeviceLayout::new(DeviceId(0), 64, 128))
        .gc(gc)
        .build()
}

fn root_keys(store: &MemTreeStore, built: &BuiltTree) -> Vec<Key> {
    store
        .node(built.root)
        .map(|root| root.read().keys.clone())
        .unwrap_or_default()
}

#[test]
fn gap_between_siblings_is_closed() -> Result<()> {
    init_tracing();
    let store = Arc::new(MemTreeStore::new());
    let built = three_leaves(&store)?;
    let root = store.node(built.root).expect("root");
    root.modify(|n| {
        if let KeyValue::BtreePtr { min_key, .. } = &mut n.keys[1].value {
            *min_key = Pos::new(1, 20);
        }
    });
    assert!(!store.topology_errors(TreeId::Extents).is_empty());
    let fs = open(store.clone())?;

    let stats = fs.run_full_gc(true)?;
    assert_eq!(stats.restarts, 0);
    assert_eq!(fs.issues().of_kind(IssueKind::Topology).len(), 1);

    store.apply_pending(fs.pending())?;
    assert!(store.topology_errors(TreeId::Extents).is_empty());
    let keys = root_keys(&store, &built);
    assert_eq!(keys.len(), 3);
    assert_eq!(keys[1].child_min(), Some(Pos::new(1, 17)));
    Ok(())
}

#[test]
fn overlapping_siblings_are_trimmed() -> Result<()> {
    init_tracing();
    let store = Arc::new(MemTreeStore::new());
    let built = three_leaves(&store)?;
    let root = store.node(built.root).expect("root");
    root.modify(|n| {
        if let KeyValue::BtreePtr { min_key, .. } = &mut n.keys[2].value {
            *min_key = Pos::new(1, 10);
        }
    });
    let fs = open(store.clone())?;

    fs.run_full_gc(true)?;
    assert_eq!(fs.issues().of_kind(IssueKind::Topology).len(), 1);

    store.apply_pending(fs.pending())?;
    assert!(store.topology_errors(TreeId::Extents).is_empty());
    assert_eq!(
        root_keys(&store, &built)[2].child_min(),
        Some(Pos::new(1, 25))
    );
    assert_eq!(store.leaf_keys(TreeId::Extents).len(), 4);
    Ok(())
}

#[test]
fn short_last_child_is_extended_to_the_parent_max() -> Result<()> {
    init_tracing();
    let store = Arc::new(MemTreeStore::new());
    let built = three_leaves(&store)?;
    let root = store.node(built.root).expect("root");
    root.modify(|n| n.keys[2].pos = Pos::new(5, 0));
    assert!(!store.topology_errors(TreeId::Extents).is_empty());
    let fs = open(store.clone())?;

    fs.run_full_gc(true)?;
    assert_eq!(fs.issues().of_kind(IssueKind::Topology).len(), 1);
    assert_eq!(
        fs.pending().get(TreeId::Extents, 1, Pos::new(5, 0)),
        Some(None)
    );

    store.apply_pending(fs.pending())?;
    assert!(store.topology_errors(TreeId::Extents).is_empty());
    let keys = root_keys(&store, &built);
    assert_eq!(keys.len(), 3);
    assert_eq!(keys[2].pos, POS_MAX);
    Ok(())
}

#[test]
fn unreadable_child_is_dropped_and_the_gap_closed() -> Result<()> {
    init_tracing();
    let store = Arc::new(MemTreeStore::new());
    let built = TreeBuilder::new(TreeId::Extents)
        .node_buckets(DeviceId(0), 60, 0)
        .leaf(vec![extent(8, 1), extent(16, 2)])
        .leaf(vec![extent(24, 3)])
        .build(&store)?;
    store.set_unreadable(built.levels[0][0]);
    let fs = open(store.clone())?;

    let stats = fs.run_full_gc(true)?;
    assert_eq!(stats.restarts, 1);
    assert_eq!(fs.issues().of_kind(IssueKind::UnreadableNode).len(), 1);
    assert_eq!(fs.issues().of_kind(IssueKind::Topology).len(), 1);
    assert_eq!(fs.buckets().live(DeviceId(0), 1)?.mark.dirty_sectors, 0);
    assert_eq!(fs.buckets().live(DeviceId(0), 3)?.mark.dirty_sectors, 8);

    store.apply_pending(fs.pending())?;
    assert!(store.topology_errors(TreeId::Extents).is_empty());
    let keys = root_keys(&store, &built);
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].child_min(), Some(POS_MIN));
    let offsets: Vec<u64> = store
        .leaf_keys(TreeId::Extents)
        .iter()
        .map(|k| k.pos.offset)
        .collect();
    assert_eq!(offsets, vec![24]);
    Ok(())
}

#[test]
fn later_passes_still_check_topology() -> Result<()> {
    init_tracing();
    let store = Arc::new(MemTreeStore::new());
    let built = three_leaves(&store)?;
    let fs = open(store.clone())?;
    fs.run_full_gc(true)?;
    assert!(fs.issues().of_kind(IssueKind::Topology).is_empty());

    let root = store.node(built.root).expect("root");
    root.modify(|n| {
        if let KeyValue::BtreePtr { min_key, .. } = &mut n.keys[1].value {
            *min_key = Pos::new(1, 20);
        }
    });
    fs.run_full_gc(false)?;
    assert_eq!(fs.issues().of_kind(IssueKind::Topology).len(), 1);
    store.apply_pending(fs.pending())?;
    assert!(store.topology_errors(TreeId::Extents).is_empty());
    Ok(())
}
