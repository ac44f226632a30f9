#![allow(missing_docs)]

use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

use bucketgc::{
    DeviceId, DeviceLayout, ExtentPtr, Filesystem, FsOptions, GcOptions, Key, MemAllocator,
    MemTreeStore, PassKind, Pos, Result, TreeBuilder, TreeId,
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

fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    f()
}

fn open(gc: GcOptions) -> Result<Arc<Filesystem>> {
    let store = Arc::new(MemTreeStore::new());
    TreeBuilder::new(TreeId::Extents)
        .node_buckets(DeviceId(0), 12, 0)
        .leaf(vec![Key::extent(
            Pos::new(1, 8),
            8,
            [ExtentPtr::dirty(DeviceId(0), 2, 0)],
        )])
        .build(&store)?;
    FsOptions::new(store, Arc::new(MemAllocator::new()))
        .name("sched")
        .device(DeviceLayout::new(DeviceId(0), 16, 128))
        .gc(gc)
        .build()
}

#[test]
fn kick_wakes_the_loop() -> Result<()> {
    init_tracing();
    let fs = open(GcOptions {
        periodic: false,
        ..GcOptions::default()
    })?;
    fs.start_background_scheduler()?;

    fs.kick_gc();
    assert!(wait_until(Duration::from_secs(5), || fs.gc_count() >= 1));
    let stats = fs.last_gc_stats().expect("stats");
    assert_eq!(stats.kind, Some(PassKind::Generation));

    fs.stop_background_scheduler();
    Ok(())
}

#[test]
fn io_clock_triggers_a_periodic_pass() -> Result<()> {
    init_tracing();
    let fs = open(GcOptions {
        periodic: true,
        poll_interval_ms: 10,
        ..GcOptions::default()
    })?;
    fs.start_background_scheduler()?;

    // 16 buckets of 128 sectors, divided by 16
    fs.advance_io_clock(64);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(fs.gc_count(), 0);

    fs.advance_io_clock(64);
    assert!(wait_until(Duration::from_secs(5), || fs.gc_count() >= 1));

    fs.stop_background_scheduler();
    Ok(())
}

#[test]
fn no_trigger_means_no_pass() -> Result<()> {
    init_tracing();
    let fs = open(GcOptions {
        periodic: false,
        poll_interval_ms: 5,
        ..GcOptions::default()
    })?;
    fs.start_background_scheduler()?;
    fs.advance_io_clock(1 << 20);
    thread::sleep(Duration::from_millis(60));
    assert_eq!(fs.gc_count(), 0);
    fs.stop_background_scheduler();
    Ok(())
}

#[test]
fn stop_interrupts_a_long_wait() -> Result<()> {
    init_tracing();
    let fs = open(GcOptions {
        poll_interval_ms: 60_000,
        ..GcOptions::default()
    })?;
    fs.start_background_scheduler()?;
    thread::sleep(Duration::from_millis(20));

    let started = Instant::now();
    fs.stop_background_scheduler();
    assert!(started.elapsed() < Duration::from_secs(5));

    fs.start_background_scheduler()?;
    fs.kick_gc();
    assert!(wait_until(Duration::from_secs(5), || fs.gc_count() >= 1));
    fs.stop_background_scheduler();
    Ok(())
}

#[test]
fn shutdown_ends_the_loop() -> Result<()> {
    init_tracing();
    let fs = open(GcOptions {
        periodic: false,
        poll_interval_ms: 5,
        ..GcOptions::default()
    })?;
    fs.start_background_scheduler()?;
    fs.begin_shutdown();
    fs.kick_gc();
    thread::sleep(Duration::from_millis(40));
    assert_eq!(fs.gc_count(), 0);
    fs.stop_background_scheduler();
    Ok(())
}
