//! Per-CPU counters for the invocation hot path.
//!
//! Threads are spread over one cache-padded slot per logical CPU so concurrent
//! invocations of the same program do not contend on a shared cache line.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use once_cell::sync::Lazy;
use sysinfo::System;

static CPU_COUNT: Lazy<usize> = Lazy::new(|| {
    let mut system = System::new();
    system.refresh_cpu();
    system.cpus().len().max(1)
});

static NEXT_SLOT: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static SLOT: Cell<Option<usize>> = const { Cell::new(None) };
}

#[inline]
pub fn cpu_count() -> usize {
    *CPU_COUNT
}

/// Slot assigned to the calling thread.
#[inline]
pub fn current_slot() -> usize {
    SLOT.with(|slot| {
        slot.get().unwrap_or_else(|| {
            let idx = NEXT_SLOT.fetch_add(1, Ordering::Relaxed) % cpu_count();
            slot.set(Some(idx));
            idx
        })
    })
}

pub struct PerCpu<T> {
    slots: Box<[CachePadded<T>]>,
}

impl<T: Default> PerCpu<T> {
    pub fn new() -> Self {
        Self {
            slots: (0..cpu_count())
                .map(|_| CachePadded::new(T::default()))
                .collect(),
        }
    }
}

impl<T: Default> Default for PerCpu<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PerCpu<T> {
    #[inline]
    pub fn local(&self) -> &T {
        &self.slots[current_slot() % self.slots.len()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().map(|slot| &**slot)
    }
}

#[derive(Default)]
pub struct ProgramStats {
    cnt: AtomicU64,
    nsecs: AtomicU64,
    misses: AtomicU64,
}

/// Totals over every slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub cnt: u64,
    pub nsecs: u64,
    pub misses: u64,
}

impl PerCpu<ProgramStats> {
    #[inline]
    pub fn record_run(&self, nsecs: u64) {
        let local = self.local();
        local.cnt.fetch_add(1, Ordering::Relaxed);
        local.nsecs.fetch_add(nsecs, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_miss(&self) {
        self.local().misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.iter().fold(StatsSnapshot::default(), |acc, slot| StatsSnapshot {
            cnt: acc.cnt + slot.cnt.load(Ordering::Relaxed),
            nsecs: acc.nsecs + slot.nsecs.load(Ordering::Relaxed),
            misses: acc.misses + slot.misses.load(Ordering::Relaxed),
        })
    }
}

impl PerCpu<AtomicUsize> {
    pub fn total(&self) -> usize {
        self.iter().map(|slot| slot.load(Ordering::Relaxed)).sum()
    }
}

/// Marks the calling slot as executing a program until dropped.
pub struct ActiveGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> ActiveGuard<'a> {
    #[inline]
    pub fn enter(active: &'a PerCpu<AtomicUsize>) -> Self {
        let counter = active.local();
        counter.fetch_add(1, Ordering::Relaxed);
        Self { counter }
    }
}

impl Drop for ActiveGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}
