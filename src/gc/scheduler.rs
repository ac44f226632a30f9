//! Background loop running the generation-only pass.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread;

use tracing::{debug, error, info};

use crate::fs::{Filesystem, SchedulerSignal};
use crate::types::{GcError, Result};

#[derive(Debug, Clone, Copy)]
struct Marks {
    kick: u64,
    io: u64,
}

impl Filesystem {
    /// Starts the background thread.
    ///
    /// It wakes when [`Filesystem::kick_gc`] is called, when the I/O clock
    /// has advanced by `capacity / periodic_divisor` sectors since the last
    /// run (if periodic wakeups are enabled), or when asked to stop.
    pub fn start_background_scheduler(self: &Arc<Self>) -> Result<()> {
        let mut handle = self.scheduler_handle.lock();
        if handle.is_some() {
            return Err(GcError::Invalid("background scheduler already running"));
        }
        self.scheduler.state.lock().stop = false;
        // taken here so a kick right after start is not folded into the baseline
        let since = self.marks();
        let fs = Arc::downgrade(self);
        let signal = Arc::clone(&self.scheduler);
        let spawned = thread::Builder::new()
            .name(format!("gc/{}", self.name))
            .spawn(move || scheduler_loop(fs, signal, since))?;
        *handle = Some(spawned);
        info!(name = %self.name, "gc.scheduler.started");
        Ok(())
    }

    /// Stops the background thread and waits for it to exit.
    ///
    /// A pass already running finishes first. Safe to call when no thread runs.
    pub fn stop_background_scheduler(&self) {
        {
            let mut state = self.scheduler.state.lock();
            state.stop = true;
            self.scheduler.wakeup.notify_all();
        }
        let Some(handle) = self.scheduler_handle.lock().take() else {
            return;
        };
        // the last reference can be dropped by the loop itself
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            error!(name = %self.name, "gc.scheduler.panicked");
            return;
        }
        info!(name = %self.name, "gc.scheduler.stopped");
    }

    fn gc_due(&self, since: Marks) -> Option<&'static str> {
        if self.kick.load(Ordering::Acquire) != since.kick {
            return Some("kick");
        }
        if self.opts.periodic {
            let interval = (self.buckets.capacity_sectors() / self.opts.periodic_divisor).max(1);
            if self.io_clock.reached(since.io.saturating_add(interval)) {
                return Some("io_clock");
            }
        }
        None
    }

    fn marks(&self) -> Marks {
        Marks {
            kick: self.kick.load(Ordering::Acquire),
            io: self.io_clock.now(),
        }
    }
}

fn scheduler_loop(fs: Weak<Filesystem>, signal: Arc<SchedulerSignal>, mut since: Marks) {
    loop {
        let Some(reason) = wait_for_work(&fs, &signal, since) else {
            debug!("gc.scheduler.exit");
            return;
        };
        let Some(fs) = fs.upgrade() else {
            return;
        };
        since = fs.marks();
        debug!(name = %fs.name, reason, "gc.scheduler.wake");
        match fs.run_generation_gc() {
            Ok(_) => {}
            Err(GcError::Shutdown) => {
                debug!(name = %fs.name, "gc.scheduler.shutdown");
                return;
            }
            Err(err) => error!(name = %fs.name, %err, "gc.scheduler.error"),
        }
    }
}

/// Blocks until a pass is due; `None` when the loop must exit.
///
/// The filesystem reference is never held across the wait, so dropping the
/// last handle elsewhere stops the loop.
fn wait_for_work(
    fs: &Weak<Filesystem>,
    signal: &SchedulerSignal,
    since: Marks,
) -> Option<&'static str> {
    loop {
        let (due, poll) = {
            let fs = fs.upgrade()?;
            if fs.stopping() {
                return None;
            }
            (fs.gc_due(since), fs.opts.poll_interval())
        };
        let mut state = signal.state.lock();
        if state.stop {
            return None;
        }
        if due.is_some() {
            return due;
        }
        signal.wakeup.wait_for(&mut state, poll);
        if state.stop {
            return None;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use crate::alloc::MemAllocator;
    use crate::bucket::DeviceLayout;
    use crate::fs::FsOptions;
    use crate::tree::mem::MemTreeStore;
    use crate::types::{DeviceId, GcError, Result};

    fn wait_until(mut f: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn double_start_is_rejected() -> Result<()> {
        let fs = FsOptions::new(Arc::new(MemTreeStore::new()), Arc::new(MemAllocator::new()))
            .device(DeviceLayout::new(DeviceId(0), 16, 128))
            .build()?;
        fs.start_background_scheduler()?;
        assert!(matches!(
            fs.start_background_scheduler(),
            Err(GcError::Invalid(_))
        ));
        fs.kick_gc();
        assert!(wait_until(|| fs.gc_count() >= 1));
        fs.stop_background_scheduler();
        fs.stop_background_scheduler();
        Ok(())
    }

    #[test]
    fn dropping_the_filesystem_stops_the_loop() -> Result<()> {
        let fs = FsOptions::new(Arc::new(MemTreeStore::new()), Arc::new(MemAllocator::new()))
            .device(DeviceLayout::new(DeviceId(0), 16, 128))
            .build()?;
        fs.start_background_scheduler()?;
        let weak = Arc::downgrade(&fs);
        drop(fs);
        assert!(wait_until(|| weak.upgrade().is_none()));
        Ok(())
    }
}
