//! Mark-and-sweep reclamation and the background collector thread.
//!
//! Marking is done eagerly by the scope stack, so a collection cycle is only
//! the sweep: every slot that is still bound but no longer marked gives its
//! block back to the arena. A sweep that leaves free space fragmented past
//! the configured threshold finishes with a compaction.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, info};
use parking_lot::{Condvar, Mutex};

use crate::{Arena, HandleTable, compactor::compact, memory::Shared};

/// Outcome of one collection cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub reclaimed_handles: usize,
    pub reclaimed_words: usize,
    pub compacted: bool,
}

/// Totals across every cycle a [`crate::Memory`] has run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub cycles: usize,
    pub reclaimed_handles: usize,
    pub reclaimed_words: usize,
    pub compactions: usize,
}

impl GcStats {
    pub fn record(&mut self, report: SweepReport) {
        self.cycles += 1;
        self.reclaimed_handles += report.reclaimed_handles;
        self.reclaimed_words += report.reclaimed_words;
        self.compactions += report.compacted as usize;
    }
}

/// Frees one bound slot and its block. Returns the words given back.
pub fn reclaim(table: &mut HandleTable, arena: &mut Arena, index: usize) -> usize {
    let word = table.free(index);
    arena.release(word)
}

/// Reclaims every bound but unmarked slot. Never compacts.
pub fn sweep(table: &mut HandleTable, arena: &mut Arena) -> SweepReport {
    let garbage: Vec<usize> = table
        .slots()
        .filter(|(_, slot)| slot.is_garbage())
        .map(|(index, _)| index)
        .collect();

    let mut report = SweepReport::default();
    for index in garbage {
        report.reclaimed_words += reclaim(table, arena, index);
        report.reclaimed_handles += 1;
    }
    report
}

/// A full cycle: sweep, then compact if free space is fragmented at least
/// `threshold` (see [`crate::arena::FreeStats::fragmentation`]).
pub fn collect(table: &mut HandleTable, arena: &mut Arena, threshold: f64) -> SweepReport {
    let mut report = sweep(table, arena);

    let free = arena.free_stats();
    let fragmentation = free.fragmentation();
    if free.biggest_words < free.total_words && fragmentation >= threshold {
        compact(table, arena);
        report.compacted = true;
    }

    debug!(
        "gc: reclaimed {} handles / {} words, fragmentation {:.3}{}",
        report.reclaimed_handles,
        report.reclaimed_words,
        fragmentation,
        if report.compacted { ", compacted" } else { "" }
    );
    report
}

// ── Background collector ──────────────────────────────────────────────

#[derive(Debug, Default)]
struct Signal {
    requested: Mutex<bool>,
    wake: Condvar,
    should_stop: AtomicBool,
}

/// Dedicated thread that runs a collection every `period`, or sooner when
/// asked to. Dropping it stops and joins the thread; a cycle in progress
/// always finishes first.
#[derive(Debug)]
pub struct Collector {
    signal: Arc<Signal>,
    handle: Option<JoinHandle<()>>,
}

impl Collector {
    pub(crate) fn spawn(shared: Arc<Shared>, period: Duration) -> std::io::Result<Self> {
        let signal = Arc::new(Signal::default());
        let thread_signal = Arc::clone(&signal);
        let handle = thread::Builder::new()
            .name("memlab-gc".to_string())
            .spawn(move || collector_loop(shared, thread_signal, period))?;

        info!("collector: started with period {period:?}");
        Ok(Self {
            signal,
            handle: Some(handle),
        })
    }

    /// Wakes the collector for an immediate cycle.
    pub fn request(&self) {
        *self.signal.requested.lock() = true;
        self.signal.wake.notify_one();
    }

    pub fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.signal.should_stop.store(true, Ordering::Release);
        {
            let _guard = self.signal.requested.lock();
            self.signal.wake.notify_one();
        }
        let _ = handle.join();
        info!("collector: stopped");
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn collector_loop(shared: Arc<Shared>, signal: Arc<Signal>, period: Duration) {
    loop {
        if signal.should_stop.load(Ordering::Acquire) {
            break;
        }

        {
            let mut requested = signal.requested.lock();
            if !*requested && !signal.should_stop.load(Ordering::Acquire) {
                let _ = signal.wake.wait_for(&mut requested, period);
            }
            *requested = false;
        }

        if signal.should_stop.load(Ordering::Acquire) {
            break;
        }
        shared.collect();
    }
}
