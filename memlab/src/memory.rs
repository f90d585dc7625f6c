//! The typed value API.
//!
//! [`Memory`] ties the arena, the handle table and the scope stack together
//! behind three coarse locks. Whenever a path needs both the table and the
//! arena it takes the table first. The scope stack is never held while
//! either of the other two is being acquired.

use std::{sync::Arc, time::Duration};

use log::{debug, warn};
use parking_lot::Mutex;

use crate::{
    Arena, BlockInfo, Collector, GcStats, Handle, HandleTable, MemError, Result, Scalar,
    ScopeStack, Shape, SweepReport, ValueType,
    arena::{MAX_BLOCK_WORDS, WORD_SIZE, usable_words_for},
    collector, compactor,
    table::Location,
};

// ── Settings ──────────────────────────────────────────────────────────

/// Configuration for a [`Memory`]. Fixed once the memory is created.
#[derive(Debug, Clone)]
pub struct MemorySettings {
    /// Payload bytes the arena can hold when it is empty. Not resizable.
    pub arena_size: usize,
    /// Fragmentation (0.0 - 1.0] at or above which a collection ends with a
    /// compaction. Fragmentation is `1 - biggest_free / total_free`.
    pub compact_threshold: f64,
    /// Wake period of the background collector. `None` runs no collector
    /// thread; collection then only happens on request or on allocation
    /// failure.
    pub gc_period: Option<Duration>,
    /// Maximum number of simultaneously bound handles.
    pub handle_capacity: usize,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            arena_size: 1024 * 1024,                   // 1 MB
            compact_threshold: 0.5,                    // 50%
            gc_period: Some(Duration::from_millis(10)), // 10 ms
            handle_capacity: 1 << 16,
        }
    }
}

impl MemorySettings {
    #[inline]
    pub fn validate(&self) -> std::result::Result<(), &'static str> {
        if self.arena_size == 0 {
            return Err("arena_size must be > 0");
        }
        if usable_words_for(self.arena_size) > MAX_BLOCK_WORDS {
            return Err("arena_size too large for a block tag");
        }
        if !(self.compact_threshold > 0.0 && self.compact_threshold <= 1.0) {
            return Err("compact_threshold must be in (0.0, 1.0]");
        }
        if self.gc_period.is_some_and(|p| p.is_zero()) {
            return Err("gc_period must be > 0");
        }
        if self.handle_capacity == 0 {
            return Err("handle_capacity must be > 0");
        }
        if self.handle_capacity >= crate::table::NO_SLOT as usize {
            return Err("handle_capacity too large");
        }
        Ok(())
    }
}

// ── Shared state ──────────────────────────────────────────────────────

#[derive(Debug)]
pub(crate) struct Shared {
    settings: MemorySettings,
    table: Mutex<HandleTable>,
    arena: Mutex<Arena>,
    scopes: Mutex<ScopeStack>,
    gc: Mutex<GcStats>,
}

impl Shared {
    /// One collection cycle with both structures locked.
    pub(crate) fn collect(&self) -> SweepReport {
        let mut table = self.table.lock();
        let mut arena = self.arena.lock();
        let report = collector::collect(&mut table, &mut arena, self.settings.compact_threshold);
        self.gc.lock().record(report);
        report
    }
}

/// Snapshot of a [`Memory`]'s occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    pub live_handles: usize,
    /// Words between the two sentinels, tags included.
    pub total_words: usize,
    pub free_words: usize,
    pub free_blocks: usize,
    pub biggest_free_words: usize,
    pub open_scopes: usize,
    /// Handles recorded in open scopes, waiting to be unmarked.
    pub tracked_handles: usize,
    pub gc: GcStats,
}

// ── Memory ────────────────────────────────────────────────────────────

/// A managed arena of typed scalar and array values.
///
/// `Memory` is `Send + Sync`; share it between threads behind an `Arc`.
#[derive(Debug)]
pub struct Memory {
    shared: Arc<Shared>,
    collector: Option<Collector>,
}

impl Memory {
    pub fn new(settings: MemorySettings) -> Result<Self> {
        settings.validate().map_err(MemError::InvalidSettings)?;

        let shared = Arc::new(Shared {
            table: Mutex::new(HandleTable::new(settings.handle_capacity)),
            arena: Mutex::new(Arena::new(settings.arena_size)),
            scopes: Mutex::new(ScopeStack::new()),
            gc: Mutex::new(GcStats::default()),
            settings,
        });

        let collector = match shared.settings.gc_period {
            Some(period) => Some(
                Collector::spawn(Arc::clone(&shared), period)
                    .map_err(|_| MemError::InvalidSettings("could not spawn collector"))?,
            ),
            None => None,
        };

        debug!(
            "memory: {} bytes, {} handles",
            shared.settings.arena_size, shared.settings.handle_capacity
        );
        Ok(Self { shared, collector })
    }

    /// A memory of `arena_size` bytes with no background collector.
    pub fn with_size(arena_size: usize) -> Result<Self> {
        Self::new(MemorySettings {
            arena_size,
            gc_period: None,
            ..Default::default()
        })
    }

    pub fn settings(&self) -> &MemorySettings {
        &self.shared.settings
    }

    // ── creation ──

    pub fn create_var(&self, ty: ValueType) -> Result<Handle> {
        self.create(Shape::Scalar(ty))
    }

    pub fn create_arr(&self, ty: ValueType, width: usize) -> Result<Handle> {
        self.create(Shape::Array { ty, width })
    }

    fn create(&self, shape: Shape) -> Result<Handle> {
        // a width whose byte size overflows can never be satisfied
        let bytes = shape.bytes().ok_or(MemError::OutOfMemory)?;

        let handle = {
            let mut table = self.shared.table.lock();
            let mut arena = self.shared.arena.lock();

            if !table.has_room() {
                warn!("memory: handle table full, collecting and retrying");
                self.recover(&mut table, &mut arena);
                if !table.has_room() {
                    return Err(MemError::HandleTableFull);
                }
            }

            let word = match arena.reserve(bytes) {
                Ok(word) => word,
                Err(MemError::OutOfMemory) => {
                    warn!("memory: no room for {bytes} bytes, collecting and retrying");
                    self.recover(&mut table, &mut arena);
                    arena.reserve(bytes)?
                }
                Err(err) => return Err(err),
            };

            table.alloc(word, 0, shape)?
        };

        self.shared.scopes.lock().track(handle);
        Ok(handle)
    }

    /// Last resort before failing an allocation: sweep, then compact
    /// whenever free space is split at all.
    fn recover(&self, table: &mut HandleTable, arena: &mut Arena) {
        let mut report = collector::sweep(table, arena);
        if arena.free_blocks() > 1 {
            compactor::compact(table, arena);
            report.compacted = true;
        }
        self.shared.gc.lock().record(report);
    }

    // ── access ──

    /// Resolves `handle` and runs `f` on its payload with both locks held,
    /// so the block cannot move underneath it.
    fn with_payload<T>(
        &self,
        handle: Handle,
        f: impl FnOnce(Location, &mut [u32]) -> Result<T>,
    ) -> Result<T> {
        let table = self.shared.table.lock();
        let location = table.resolve(handle)?;
        let mut arena = self.shared.arena.lock();
        let payload = arena.payload_mut(location.word);
        let skip = location.offset / WORD_SIZE;
        f(location, &mut payload[skip..])
    }

    pub fn get_var(&self, handle: Handle, ty: ValueType) -> Result<Scalar> {
        self.with_payload(handle, |location, payload| {
            if location.shape != Shape::Scalar(ty) {
                return Err(MemError::TypeMismatch);
            }
            Ok(Scalar::from_word(ty, payload[0]))
        })
    }

    pub fn assign_var(&self, handle: Handle, value: Scalar) -> Result<()> {
        self.with_payload(handle, |location, payload| {
            if location.shape != Shape::Scalar(value.ty()) {
                return Err(MemError::TypeMismatch);
            }
            payload[0] = value.to_word();
            Ok(())
        })
    }

    pub fn get_elem(&self, handle: Handle, ty: ValueType, idx: usize) -> Result<Scalar> {
        self.with_payload(handle, |location, payload| {
            check_element(location.shape, ty, idx)?;
            let (word, offset) = ty.locate(idx);
            Ok(Scalar::unpack_from(ty, payload[word], offset))
        })
    }

    pub fn assign_elem(&self, handle: Handle, idx: usize, value: Scalar) -> Result<()> {
        self.with_payload(handle, |location, payload| {
            let ty = value.ty();
            check_element(location.shape, ty, idx)?;
            let (word, offset) = ty.locate(idx);
            payload[word] = value.pack_into(payload[word], offset);
            Ok(())
        })
    }

    /// Writes `values` to elements `0..values.len()`.
    ///
    /// Nothing is written unless every value has the array's element type
    /// and the slice fits.
    pub fn assign_arr(&self, handle: Handle, values: &[Scalar]) -> Result<()> {
        self.with_payload(handle, |location, payload| {
            let Shape::Array { ty, width } = location.shape else {
                return Err(MemError::TypeMismatch);
            };
            if values.iter().any(|v| v.ty() != ty) {
                return Err(MemError::TypeMismatch);
            }
            if values.len() > width {
                return Err(MemError::IndexOutOfBounds);
            }
            for (idx, value) in values.iter().enumerate() {
                let (word, offset) = ty.locate(idx);
                payload[word] = value.pack_into(payload[word], offset);
            }
            Ok(())
        })
    }

    pub fn shape(&self, handle: Handle) -> Result<Shape> {
        Ok(self.shared.table.lock().resolve(handle)?.shape)
    }

    /// Element count of an array handle.
    pub fn width(&self, handle: Handle) -> Result<usize> {
        match self.shape(handle)? {
            Shape::Array { width, .. } => Ok(width),
            Shape::Scalar(_) => Err(MemError::TypeMismatch),
        }
    }

    /// Bound, marked, and not yet freed.
    pub fn is_live(&self, handle: Handle) -> bool {
        self.shared.table.lock().is_live(handle)
    }

    // ── release ──

    /// Frees a value right away instead of waiting for a sweep.
    ///
    /// Works on values whose scope already ended but which have not been
    /// swept yet. Freeing twice is an [`MemError::InvalidHandle`].
    pub fn free_elem(&self, handle: Handle) -> Result<()> {
        let mut table = self.shared.table.lock();
        if table.slot_of(handle).is_none() {
            return Err(MemError::InvalidHandle);
        }
        let mut arena = self.shared.arena.lock();
        collector::reclaim(&mut table, &mut arena, handle.index());
        Ok(())
    }

    // ── scopes ──

    pub fn init_scope(&self) {
        self.shared.scopes.lock().open();
    }

    /// Unmarks every value created since the matching `init_scope`.
    /// Reclaiming them is left to the collector.
    pub fn end_scope(&self) -> Result<()> {
        let popped = self.shared.scopes.lock().close()?;
        let mut table = self.shared.table.lock();
        for handle in popped {
            table.unmark(handle);
        }
        Ok(())
    }

    /// Opens a scope that ends when the guard is dropped.
    ///
    /// Every `init_scope` made while the guard is alive must be ended before
    /// it drops; debug builds assert this.
    pub fn scope(&self) -> ScopeGuard<'_> {
        let depth = {
            let mut scopes = self.shared.scopes.lock();
            scopes.open();
            scopes.depth()
        };
        ScopeGuard {
            memory: self,
            depth,
        }
    }

    // ── collection ──

    /// Runs one collection cycle on the calling thread.
    pub fn gc_run(&self) -> SweepReport {
        self.shared.collect()
    }

    /// Wakes the background collector. Returns false if there is none.
    pub fn gc_activate(&self) -> bool {
        match &self.collector {
            Some(collector) => {
                collector.request();
                true
            }
            None => false,
        }
    }

    /// Compacts the arena unconditionally. Returns the blocks moved.
    pub fn compact(&self) -> usize {
        let mut table = self.shared.table.lock();
        let mut arena = self.shared.arena.lock();
        compactor::compact(&mut table, &mut arena)
    }

    // ── introspection ──

    pub fn stats(&self) -> MemoryStats {
        let (open_scopes, tracked_handles) = {
            let scopes = self.shared.scopes.lock();
            (scopes.depth(), scopes.tracked())
        };
        let table = self.shared.table.lock();
        let arena = self.shared.arena.lock();
        let free = arena.free_stats();
        MemoryStats {
            live_handles: table.live(),
            total_words: arena.usable_words(),
            free_words: free.total_words,
            free_blocks: free.blocks,
            biggest_free_words: free.biggest_words,
            open_scopes,
            tracked_handles,
            gc: *self.shared.gc.lock(),
        }
    }

    /// Every block between the sentinels, in address order.
    pub fn layout(&self) -> Vec<BlockInfo> {
        self.shared.arena.lock().blocks().collect()
    }

    /// Header word a handle currently resolves to. Changes with compaction.
    pub fn block_of(&self, handle: Handle) -> Result<usize> {
        Ok(self.shared.table.lock().resolve(handle)?.word)
    }

    /// Checks the arena's boundary tags.
    pub fn verify(&self) -> std::result::Result<(), &'static str> {
        self.shared.arena.lock().verify()
    }
}

fn check_element(shape: Shape, ty: ValueType, idx: usize) -> Result<()> {
    match shape {
        Shape::Array { ty: stored, width } if stored == ty => {
            if idx < width {
                Ok(())
            } else {
                Err(MemError::IndexOutOfBounds)
            }
        }
        _ => Err(MemError::TypeMismatch),
    }
}

/// Ends its scope on drop. See [`Memory::scope`].
#[must_use = "the scope ends as soon as the guard is dropped"]
pub struct ScopeGuard<'a> {
    memory: &'a Memory,
    /// Scope depth right after the guard's own `init_scope`.
    depth: usize,
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        let depth = self.memory.shared.scopes.lock().depth();
        debug_assert!(
            std::thread::panicking() || depth == self.depth,
            "scope guard at depth {} dropped with {} scopes open: an inner scope was never ended",
            self.depth,
            depth
        );
        // the guard opened a scope, so there is always one to close
        let _ = self.memory.end_scope();
    }
}
