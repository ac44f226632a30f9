#![allow(missing_docs)]

use std::sync::{Arc, Once};

use bucketgc::bucket::stripe::Stripe;
use bucketgc::tree::Ptrs;
use bucketgc::{
    DeviceId, DeviceLayout, ExtentPtr, Filesystem, FsOptions, GcError, GcOptions, GcPhase,
    IssueKind, Key, KeyValue, MemAllocator, MemTreeStore, Pos, ReserveClass, Result, Severity,
    StripeIdx, TreeBuilder, TreeId,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
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

fn extent(offset: u64, ptrs: impl IntoIterator<Item = ExtentPtr>) -> Key {
    Key::extent(Pos::new(1, offset), 8, ptrs)
}

fn dirty(bucket: u64, gen: u8) -> ExtentPtr {
    ExtentPtr::dirty(DeviceId(0), bucket, gen)
}

fn open(store: Arc<MemTreeStore>) -> Result<Arc<Filesystem>> {
    let gc = GcOptions {
        rebuild_replicas: true,
        ..GcOptions::default()
    };
    FsOptions::new(store, Arc::new(MemAllocator::new()))
        .name("full-gc")
        .device(DeviceLayout::new(DeviceId(0), 64, 128))
        .gc(gc)
        .build()
}

fn healthy_extents(store: &MemTreeStore) -> Result<()> {
    TreeBuilder::new(TreeId::Extents)
        .node_buckets(DeviceId(0), 60, 0)
        .leaf(vec![extent(8, [dirty(1, 0)]), extent(16, [dirty(2, 0)])])
        .leaf(vec![extent(24, [dirty(3, 0), ExtentPtr::cached(DeviceId(0), 4, 0)])])
        .build(store)?;
    Ok(())
}

#[test]
fn stale_dirty_pointer_is_dropped() -> Result<()> {
    init_tracing();
    let store = Arc::new(MemTreeStore::new());
    TreeBuilder::new(TreeId::Extents)
        .node_buckets(DeviceId(0), 60, 0)
        .leaf(vec![extent(8, [dirty(5, 3)]), extent(16, [dirty(6, 0)])])
        .leaf(vec![extent(24, [dirty(7, 0)])])
        .build(&store)?;
    let fs = open(store.clone())?;
    fs.buckets().update_live(DeviceId(0), 5, |b| b.mark.gen = 5)?;

    fs.run_full_gc(true)?;

    let stale = fs.issues().of_kind(IssueKind::StaleDirtyPtr);
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].severity, Severity::Repairable);
    assert_eq!(fs.pending().get(TreeId::Extents, 0, Pos::new(1, 8)), Some(None));
    let bucket = fs.buckets().live(DeviceId(0), 5)?;
    assert_eq!(bucket.mark.gen, 5);
    assert_eq!(bucket.mark.dirty_sectors, 0);
    assert_eq!(fs.buckets().live(DeviceId(0), 6)?.mark.dirty_sectors, 8);

    store.apply_pending(fs.pending())?;
    let offsets: Vec<u64> = store
        .leaf_keys(TreeId::Extents)
        .iter()
        .map(|k| k.pos.offset)
        .collect();
    assert_eq!(offsets, vec![16, 24]);
    Ok(())
}

#[test]
fn second_pass_finds_nothing_to_correct() -> Result<()> {
    init_tracing();
    let store = Arc::new(MemTreeStore::new());
    healthy_extents(&store)?;
    let fs = open(store)?;

    let first = fs.run_full_gc(true)?;
    assert!(first.corrections > 0);
    assert!(fs.need_alloc_write());
    let usage = fs.usage().live();
    assert_eq!(usage.fs.data, 16);
    assert_eq!(usage.fs.cached, 8);
    assert_eq!(usage.fs.hidden, 16);
    assert_eq!(usage.fs.btree, 3 * i64::from(fs.options().btree_node_sectors));

    let second = fs.run_full_gc(false)?;
    assert_eq!(second.corrections, 0);
    assert_eq!(second.restarts, 0);
    assert_eq!(fs.usage().live(), usage);
    assert_eq!(fs.gc_count(), 2);
    assert_eq!(fs.gc_pos().phase, GcPhase::NotRunning);
    assert!(!fs.buckets().shadow_allocated());
    Ok(())
}

#[test]
fn generation_conflicts_hit_the_retry_bound() -> Result<()> {
    init_tracing();
    let store = Arc::new(MemTreeStore::new());
    let cached = |offset, gen| extent(offset, [ExtentPtr::cached(DeviceId(0), 7, gen)]);
    TreeBuilder::new(TreeId::Extents)
        .node_buckets(DeviceId(0), 60, 0)
        .leaf(vec![cached(8, 0), cached(16, 86), cached(24, 172)])
        .build(&store)?;
    let fs = open(store)?;

    let err = fs.run_full_gc(true).unwrap_err();
    assert!(matches!(err, GcError::RetryBoundExceeded { restarts: 2 }));
    assert!(!fs.issues().of_kind(IssueKind::FutureGen).is_empty());
    assert!(!fs.buckets().shadow_allocated());
    assert_eq!(fs.gc_count(), 3);
    Ok(())
}

#[test]
fn stale_root_pointer_is_fatal() -> Result<()> {
    init_tracing();
    let store = Arc::new(MemTreeStore::new());
    let built = TreeBuilder::new(TreeId::Extents)
        .node_buckets(DeviceId(0), 60, 0)
        .leaf(vec![extent(8, [dirty(1, 0)])])
        .leaf(vec![extent(16, [dirty(2, 0)])])
        .build(&store)?;
    let fs = open(store)?;
    let root_bucket = built.next_bucket - 1;
    fs.buckets()
        .update_live(DeviceId(0), root_bucket, |b| b.mark.gen = 3)?;

    let err = fs.run_full_gc(true).unwrap_err();
    assert!(matches!(err, GcError::StructuralConflict(_)));
    let fatal = fs.issues().of_kind(IssueKind::RootRepair);
    assert_eq!(fatal.len(), 1);
    assert_eq!(fatal[0].severity, Severity::Fatal);
    assert!(fs.last_gc_stats().is_none());
    assert_eq!(fs.buckets().live(DeviceId(0), 1)?.mark.dirty_sectors, 0);
    Ok(())
}

fn stripe_key(idx: u64, nr_redundant: u8) -> Key {
    let ptrs: Ptrs = (20..23).map(|b| dirty(b, 0)).collect();
    Key::new(
        Pos::new(0, idx),
        0,
        KeyValue::Stripe {
            algorithm: 0,
            nr_blocks: 3,
            nr_redundant,
            sectors: 64,
            ptrs,
        },
    )
}

#[test]
fn stripe_shape_mismatch_aborts_before_reconciling() -> Result<()> {
    init_tracing();
    let store = Arc::new(MemTreeStore::new());
    TreeBuilder::new(TreeId::Stripes)
        .node_buckets(DeviceId(0), 50, 0)
        .leaf(vec![stripe_key(1, 1)])
        .build(&store)?;
    healthy_extents(&store)?;
    let fs = open(store)?;
    fs.stripes().insert_live(StripeIdx(1), Stripe::new(64, 0, 3, 2));

    let err = fs.run_full_gc(true).unwrap_err();
    assert!(matches!(err, GcError::StripeShapeMismatch { idx: StripeIdx(1) }));
    assert_eq!(fs.issues().of_kind(IssueKind::StripeShape).len(), 1);
    assert!(fs.issues().of_kind(IssueKind::BucketMismatch).is_empty());
    assert_eq!(fs.buckets().live(DeviceId(0), 22)?.mark.dirty_sectors, 0);
    assert_eq!(fs.stripes().live(StripeIdx(1)).map(|s| s.nr_redundant), Some(2));
    Ok(())
}

#[test]
fn stripe_block_counts_are_recomputed() -> Result<()> {
    init_tracing();
    let store = Arc::new(MemTreeStore::new());
    TreeBuilder::new(TreeId::Stripes)
        .node_buckets(DeviceId(0), 50, 0)
        .leaf(vec![stripe_key(1, 1)])
        .build(&store)?;
    TreeBuilder::new(TreeId::Extents)
        .node_buckets(DeviceId(0), 60, 0)
        .leaf(vec![extent(8, [dirty(20, 0).in_stripe(StripeIdx(1), 0)])])
        .build(&store)?;
    let fs = open(store)?;
    fs.stripes().insert_live(StripeIdx(1), Stripe::new(64, 0, 3, 1));

    fs.run_full_gc(true)?;

    let stripe = fs.stripes().live(StripeIdx(1)).expect("stripe");
    assert_eq!(stripe.block_sectors, vec![8, 0, 0]);
    assert_eq!(stripe.blocks_nonempty, 1);
    let parity = fs.buckets().live(DeviceId(0), 22)?;
    assert_eq!(parity.mark.stripe, Some(StripeIdx(1)));
    assert_eq!(parity.mark.dirty_sectors, 64);
    assert_eq!(fs.buckets().live(DeviceId(0), 20)?.mark.dirty_sectors, 8);
    Ok(())
}

#[test]
fn dead_stripe_reference_is_stripped() -> Result<()> {
    init_tracing();
    let store = Arc::new(MemTreeStore::new());
    TreeBuilder::new(TreeId::Extents)
        .node_buckets(DeviceId(0), 60, 0)
        .leaf(vec![extent(8, [dirty(20, 0).in_stripe(StripeIdx(9), 0)])])
        .build(&store)?;
    let fs = open(store)?;

    fs.run_full_gc(true)?;

    assert_eq!(fs.issues().of_kind(IssueKind::DeadStripe).len(), 1);
    let staged = fs
        .pending()
        .get(TreeId::Extents, 0, Pos::new(1, 8))
        .flatten()
        .expect("rewritten key");
    assert_eq!(staged.ptrs().len(), 1);
    assert_eq!(staged.ptrs()[0].stripe, None);
    Ok(())
}

#[test]
fn unregistered_replicas_are_reported_once() -> Result<()> {
    init_tracing();
    let store = Arc::new(MemTreeStore::new());
    healthy_extents(&store)?;
    let fs = FsOptions::new(store, Arc::new(MemAllocator::new()))
        .device(DeviceLayout::new(DeviceId(0), 64, 128))
        .build()?;
    let issues = fs.issues().subscribe();

    fs.run_full_gc(true)?;
    let first = fs.issues().of_kind(IssueKind::ReplicasMissing).len();
    assert!(first > 0);
    assert!(issues.try_iter().any(|i| i.kind == IssueKind::ReplicasMissing));

    fs.run_full_gc(true)?;
    assert_eq!(fs.issues().of_kind(IssueKind::ReplicasMissing).len(), first);
    Ok(())
}

#[test]
fn key_versions_beyond_the_counter_bump_it() -> Result<()> {
    init_tracing();
    let store = Arc::new(MemTreeStore::new());
    TreeBuilder::new(TreeId::Extents)
        .node_buckets(DeviceId(0), 60, 0)
        .leaf(vec![extent(8, [dirty(1, 0)]).with_version(42)])
        .build(&store)?;
    let fs = open(store)?;
    fs.bump_key_version(10);

    fs.run_full_gc(true)?;
    assert_eq!(fs.key_version(), 42);
    assert_eq!(fs.issues().of_kind(IssueKind::KeyVersion).len(), 1);
    Ok(())
}

#[test]
fn allocator_buckets_are_marked_owned() -> Result<()> {
    init_tracing();
    let store = Arc::new(MemTreeStore::new());
    healthy_extents(&store)?;
    let alloc = Arc::new(MemAllocator::new());
    alloc.push_free_inc(DeviceId(0), 30);
    alloc.push_free(ReserveClass::Btree, DeviceId(0), 31);
    alloc.open_bucket(DeviceId(0), 32, 0);
    let closed = alloc.open_bucket(DeviceId(0), 33, 0);
    alloc.close_bucket(closed);
    let fs = FsOptions::new(store, alloc)
        .device(DeviceLayout::new(DeviceId(0), 64, 128))
        .build()?;

    fs.run_full_gc(true)?;
    for bucket in [30, 31, 32] {
        assert!(fs.buckets().live(DeviceId(0), bucket)?.mark.owned_by_allocator);
    }
    assert!(!fs.buckets().live(DeviceId(0), 33)?.mark.owned_by_allocator);
    Ok(())
}

#[test]
fn random_workload_settles_after_one_pass() -> Result<()> {
    init_tracing();
    let mut rng = ChaCha8Rng::seed_from_u64(0x6763);
    let store = Arc::new(MemTreeStore::new());
    let mut builder = TreeBuilder::new(TreeId::Extents).node_buckets(DeviceId(0), 200, 0);
    let mut offset = 0u64;
    let mut expected_data = 0i64;
    let mut expected_cached = 0i64;
    for _ in 0..rng.gen_range(4..12) {
        let mut keys = Vec::new();
        for _ in 0..rng.gen_range(1..8) {
            let size: u32 = rng.gen_range(1..16);
            offset += u64::from(size);
            let first = rng.gen_range(1..75);
            let mut ptrs = vec![dirty(first, 0)];
            if rng.gen_bool(0.3) {
                ptrs.push(dirty(first + 75, 0));
            }
            if rng.gen_bool(0.2) {
                ptrs.push(ExtentPtr::cached(DeviceId(0), 160, 0));
                expected_cached += i64::from(size);
            }
            expected_data += i64::from(size) * ptrs.iter().filter(|p| !p.cached).count() as i64;
            keys.push(Key::extent(Pos::new(1, offset), size, ptrs));
        }
        builder = builder.leaf(keys);
    }
    builder.build(&store)?;
    let fs = FsOptions::new(store, Arc::new(MemAllocator::new()))
        .device(DeviceLayout::new(DeviceId(0), 256, 128))
        .gc(GcOptions {
            rebuild_replicas: true,
            ..GcOptions::default()
        })
        .build()?;

    fs.run_full_gc(true)?;
    let usage = fs.usage().live();
    assert_eq!(usage.fs.data, expected_data);
    assert_eq!(usage.fs.cached, expected_cached);
    assert!(fs.pending().is_empty());

    assert_eq!(fs.run_full_gc(false)?.corrections, 0);
    assert_eq!(fs.run_full_gc(true)?.corrections, 0);
    Ok(())
}
