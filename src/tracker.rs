//! The access-tracking engine.
//!
//! [`MemoryTracker`] registers memory regions for page-granularity access
//! tracking. For each region it allocates a dual-mapped trackable block,
//! hands the protection-locked primary address back to the consumer, and
//! resolves the protection faults that accesses through it raise. Dirty
//! pages accumulate in pre-reserved sets until the consumer drains them
//! with [`MemoryTracker::for_each_written_cpu_page`] and
//! [`MemoryTracker::reset_cpu_read_pages`].
//!
//! Every public operation blocks the trap signals and takes the engine
//! spin lock for its whole critical section; the fault entry point, which
//! runs with the signal already masked by the kernel, takes the plain
//! lock. See the [`crate::sync`] module docs for why this split is what
//! makes the lock safe.

use core::{alloc::Layout, cell::UnsafeCell, cmp::min, ptr};
use std::{alloc, collections::BTreeMap};

use hashbrown::HashMap;

use crate::{
    align::{align_down, align_up},
    dirty::DirtyPageTable,
    os::{FaultHandler, Protection, TrackableBlock, TrapProvider},
    simd::copy_with_cache,
    sync::{SignalBlocker, SpinLock, SpinLockGuard},
    Error,
};

/// Cache snapshots are allocated with this alignment so the diff copy can
/// run over full 16-byte lanes.
const CACHE_ALIGNMENT: usize = 16;

/// A memory region registered for tracking, keyed by the page-aligned
/// base of its primary (device-visible) mapping.
#[derive(Debug, Clone, Copy)]
struct TrackedRange {
    /// The size the consumer asked to track.
    len: usize,
    /// `len` rounded up to the page size; the size of the mappings.
    aligned_len: usize,
    /// Base of the original, device-visible memory this range mirrors.
    device_base: usize,
}

/// The three per-range addresses a page is reconciled through. Same key
/// as the [`TrackedRange`]; all three are `aligned_len` bytes with a
/// fixed offset relationship for the lifetime of the range.
struct Mapping {
    /// The device-visible memory the consumer originally handed in.
    device: *mut u8,
    /// The always-writable secondary alias of the primary mapping.
    writable: *mut u8,
    /// Private snapshot for word-level diffing. Never exposed.
    cache: *mut u8,
    cache_layout: Layout,
}

#[derive(Default)]
struct TrackerState {
    /// Tracked regions by primary base address.
    ranges: BTreeMap<usize, TrackedRange>,
    /// Reconciliation addresses by primary base address.
    mappings: BTreeMap<usize, Mapping>,
    /// Current protection per page of every tracked range.
    status: HashMap<usize, Protection>,
    /// Pages written since the last write drain.
    written_pages: DirtyPageTable,
    /// Pages read since the last read drain.
    read_pages: DirtyPageTable,
    /// How often a fault found its requested bit already granted and had
    /// to fall back to the corrective escalation.
    corrective_faults: u64,
}

/// Tracks CPU accesses to registered memory regions by protection fault.
///
/// Construction installs the provider's process-wide trap handler;
/// dropping the tracker untracks everything and uninstalls it. The
/// tracker is boxed so the address registered with the provider stays
/// stable for its whole lifetime.
pub struct MemoryTracker<P: TrapProvider> {
    provider: P,
    page_size: usize,
    /// Guards `state`. Non-reentrant; see the module docs.
    lock: SpinLock,
    state: UnsafeCell<TrackerState>,
}

// All access to `state` is serialized by `lock` (with the trap signals
// blocked outside the fault path), so sharing the tracker across the
// threads that fault on it is sound.
unsafe impl<P: TrapProvider + Send> Send for MemoryTracker<P> {}
unsafe impl<P: TrapProvider + Sync> Sync for MemoryTracker<P> {}

impl<P: TrapProvider> MemoryTracker<P> {
    /// Creates a tracker over `provider` and installs its trap handler.
    ///
    /// Fails if the provider reports an unusable page size or if another
    /// tracker already owns the process trap slot.
    pub fn new(provider: P) -> Result<Box<Self>, Error>
    where
        P: 'static,
    {
        let page_size = provider.page_size();
        if page_size == 0 || !page_size.is_power_of_two() {
            return Err(Error::illegal_argument(format!(
                "provider page size {page_size} is not a power of two"
            )));
        }
        let mut tracker = Box::new(Self {
            provider,
            page_size,
            lock: SpinLock::new(),
            state: UnsafeCell::new(TrackerState::default()),
        });
        let handler: *mut dyn FaultHandler = &mut *tracker;
        // # Safety
        // The box gives the handler a stable address; `Drop` uninstalls
        // before the box is freed.
        unsafe {
            tracker.provider.install(handler)?;
        }
        Ok(tracker)
    }

    /// The platform page size, the granularity of all tracking.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Registers the region at `*memory` of `size` bytes for tracking and
    /// replaces `*memory` with the protection-locked address all further
    /// accesses must go through.
    ///
    /// A zero `size` or an address already inside a tracked range is
    /// ignored. On success, every page of the region starts with no
    /// access permitted, so the next touch of any page faults.
    pub fn track_mapped_memory(&self, memory: &mut *mut u8, size: usize) -> Result<(), Error> {
        self.signal_safe(|state| self.track_impl(state, memory, size))
    }

    /// Stops tracking the range whose primary base is `memory`.
    ///
    /// Returns `false` if no tracked range is registered at that address.
    /// Pending dirty records for the range are discarded.
    pub fn untrack_mapped_memory(&self, memory: *mut u8, _size: usize) -> bool {
        self.signal_safe(|state| self.untrack_impl(state, memory as usize))
    }

    /// Untracks every remaining range; used at shutdown.
    ///
    /// Teardown is the caller's responsibility to serialize against
    /// application threads still touching the ranges.
    pub fn untrack_all_mapped_memory(&self) {
        self.signal_safe(|state| {
            let bases: Vec<usize> = state.mappings.keys().copied().collect();
            for base in bases {
                let _ = self.untrack_impl(state, base);
            }
        });
    }

    /// Drains the write-dirty set.
    ///
    /// For every written page, re-arms its write protection, invokes
    /// `callback(page_address, cpu_writable_address)`, and propagates the
    /// changed words into the device-visible memory through the cache
    /// diff. The page faults again on the next write.
    pub fn for_each_written_cpu_page(
        &self,
        mut callback: impl FnMut(*mut u8, *mut u8),
    ) -> Result<(), Error> {
        self.signal_safe(|state| self.drain_written_impl(state, &mut callback))
    }

    /// Drains the read-dirty set, revoking the read bit of every recorded
    /// page so it faults again on the next read. No content moves; reads
    /// need no reconciliation.
    pub fn reset_cpu_read_pages(&self) -> Result<(), Error> {
        self.signal_safe(|state| self.reset_read_impl(state))
    }

    /// The fault entry point. Plain-lock protected only: the trap context
    /// already masks the signal on this thread, and blocking it again
    /// here is neither possible nor needed.
    ///
    /// Returns `false` for faults this tracker does not claim; the caller
    /// must forward those to whatever handler existed before.
    pub fn handle_segfault(&self, fault_addr: *mut u8, access: Protection) -> bool {
        self.locked(|state| self.handle_segfault_impl(state, fault_addr as usize, access))
    }

    /// How often the corrective escalation of the fault path has fired.
    ///
    /// Nonzero values mean the page status table and the hardware
    /// protection state disagreed; see `handle_segfault_impl`.
    #[must_use]
    pub fn corrective_fault_count(&self) -> u64 {
        self.signal_safe(|state| state.corrective_faults)
    }

    /// Runs `f` on the bookkeeping with the trap signals blocked for this
    /// thread and the engine lock held. Applied uniformly to every public
    /// operation except the fault entry point.
    fn signal_safe<R>(&self, f: impl FnOnce(&mut TrackerState) -> R) -> R {
        let _blocked = SignalBlocker::new(self.provider.trap_signals());
        let _guard = SpinLockGuard::new(&self.lock);
        // # Safety
        // The spin lock serializes all access to the state.
        f(unsafe { &mut *self.state.get() })
    }

    /// Runs `f` on the bookkeeping with only the engine lock held.
    fn locked<R>(&self, f: impl FnOnce(&mut TrackerState) -> R) -> R {
        let _guard = SpinLockGuard::new(&self.lock);
        // # Safety
        // The spin lock serializes all access to the state.
        f(unsafe { &mut *self.state.get() })
    }

    /// The closest tracked range starting at or below `addr`, if `addr`
    /// falls inside it. `page_aligned` widens the containment check to
    /// the page-aligned span of the range, which is what the fault path
    /// wants; the track path checks against the logical size.
    fn find_range(
        ranges: &BTreeMap<usize, TrackedRange>,
        addr: usize,
        page_aligned: bool,
    ) -> Option<(usize, TrackedRange)> {
        let (&base, range) = ranges.range(..=addr).next_back()?;
        let len = if page_aligned {
            range.aligned_len
        } else {
            range.len
        };
        (addr < base.saturating_add(len)).then_some((base, *range))
    }

    fn track_impl(
        &self,
        state: &mut TrackerState,
        memory: &mut *mut u8,
        size: usize,
    ) -> Result<(), Error> {
        let start = *memory;
        if size == 0 || start.is_null() {
            return Ok(());
        }
        if Self::find_range(&state.ranges, start as usize, false).is_some() {
            return Ok(());
        }

        let Some(aligned_len) = align_up(size, self.page_size) else {
            return Err(Error::illegal_argument(format!(
                "range of {size} bytes overflows the address space"
            )));
        };
        let num_pages = aligned_len / self.page_size;

        let block = self.provider.allocate_trackable(aligned_len)?;
        debug_assert_eq!(block.primary as usize % self.page_size, 0);

        let cache_layout = Layout::from_size_align(aligned_len, CACHE_ALIGNMENT)
            .map_err(|err| Error::illegal_argument(format!("bad cache layout: {err}")))?;
        // # Safety
        // `aligned_len` is nonzero here; the block is freed again if the
        // allocation fails.
        let cache = unsafe { alloc::alloc_zeroed(cache_layout) };
        if cache.is_null() {
            unsafe {
                let _ = self.provider.free_trackable(block);
            }
            return Err(Error::unknown("cache snapshot allocation failed"));
        }

        // Seed the mirror and the cache with the device content. The
        // primary mapping is still unprotected at this point.
        unsafe {
            ptr::copy_nonoverlapping(start, block.secondary, size);
            ptr::copy_nonoverlapping(start, cache, size);
        }

        state.written_pages.reserve(num_pages);
        state.read_pages.reserve(num_pages);

        let base = block.primary as usize;
        state.ranges.insert(
            base,
            TrackedRange {
                len: size,
                aligned_len,
                device_base: start as usize,
            },
        );
        state.mappings.insert(
            base,
            Mapping {
                device: start,
                writable: block.secondary,
                cache,
                cache_layout,
            },
        );
        for page in (base..base + aligned_len).step_by(self.page_size) {
            state.status.insert(page, Protection::None);
        }

        // Lock the whole region; the next touch of any page faults.
        if let Err(err) = unsafe { self.provider.protect(block.primary, aligned_len, Protection::None) }
        {
            state.ranges.remove(&base);
            state.mappings.remove(&base);
            for page in (base..base + aligned_len).step_by(self.page_size) {
                state.status.remove(&page);
            }
            state.written_pages.recollect_if_possible(num_pages);
            state.read_pages.recollect_if_possible(num_pages);
            unsafe {
                let _ = self.provider.free_trackable(block);
                alloc::dealloc(cache, cache_layout);
            }
            return Err(err);
        }

        log::debug!(
            "tracking {size} bytes at {start:?} through mirror {:?} ({num_pages} pages)",
            block.primary
        );
        *memory = block.primary;
        Ok(())
    }

    fn untrack_impl(&self, state: &mut TrackerState, base: usize) -> bool {
        let Some(mapping) = state.mappings.remove(&base) else {
            return false;
        };
        let Some(range) = state.ranges.remove(&base) else {
            debug_assert!(false, "mapping without a range at {base:#x}");
            return false;
        };
        let num_pages = range.aligned_len / self.page_size;

        // Discard pending dirty records for the range before its pages go
        // away, then give the capacity back.
        let _ = state
            .written_pages
            .dump_and_clear_in_range(base, range.aligned_len);
        let _ = state
            .read_pages
            .dump_and_clear_in_range(base, range.aligned_len);
        state.written_pages.recollect_if_possible(num_pages);
        state.read_pages.recollect_if_possible(num_pages);

        for page in (base..base + range.aligned_len).step_by(self.page_size) {
            state.status.remove(&page);
        }

        // # Safety
        // The block was allocated by this provider at track time; nothing
        // references it anymore.
        unsafe {
            if let Err(err) = self.provider.free_trackable(TrackableBlock {
                primary: base as *mut u8,
                secondary: mapping.writable,
                size: range.aligned_len,
            }) {
                log::warn!("failed to free trackable block at {base:#x}: {err}");
            }
            alloc::dealloc(mapping.cache, mapping.cache_layout);
        }

        log::debug!("untracked {} bytes at {base:#x}", range.len);
        true
    }

    fn drain_written_impl(
        &self,
        state: &mut TrackerState,
        callback: &mut dyn FnMut(*mut u8, *mut u8),
    ) -> Result<(), Error> {
        let mut first_error = None;
        for page in state.written_pages.dump_and_clear_all() {
            let Some((base, range)) = Self::find_range(&state.ranges, page, true) else {
                debug_assert!(false, "dirty record for untracked page {page:#x}");
                continue;
            };
            let Some(mapping) = state.mappings.get(&base) else {
                continue;
            };
            let Some(protection) = state.status.get_mut(&page) else {
                continue;
            };

            let offset = page - base;
            let new_protection = *protection ^ Protection::Write;

            // Re-arm before the content is consumed: a write racing with
            // this drain faults and lands in the next cycle instead of
            // being lost. If the re-arm fails, the record is put back
            // (its slot is still reserved) and the page is reconciled on
            // a later drain; dropping it here would leave the write bit
            // granted with content that never propagates.
            // # Safety
            // `page` is a live tracked page; the reconciliation addresses
            // share the range's offset relationship, and the copy length
            // is clamped to the logical end of the range.
            if let Err(err) =
                unsafe { self.provider.protect(page as *mut u8, self.page_size, new_protection) }
            {
                let recorded = state.written_pages.record(page);
                debug_assert!(recorded);
                first_error.get_or_insert(err);
                continue;
            }
            *protection = new_protection;

            unsafe {
                let writable = mapping.writable.add(offset);
                callback(page as *mut u8, writable);

                let len = min(self.page_size, range.len - offset);
                copy_with_cache(
                    mapping.device.add(offset),
                    writable,
                    mapping.cache.add(offset),
                    len,
                );
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn reset_read_impl(&self, state: &mut TrackerState) -> Result<(), Error> {
        let mut first_error = None;
        for page in state.read_pages.dump_and_clear_all() {
            let Some(protection) = state.status.get_mut(&page) else {
                debug_assert!(false, "dirty record for untracked page {page:#x}");
                continue;
            };
            let new_protection = *protection ^ Protection::Read;
            // Same recovery as the write drain: a page whose re-arm
            // fails keeps its record.
            // # Safety
            // `page` is a live tracked page.
            if let Err(err) =
                unsafe { self.provider.protect(page as *mut u8, self.page_size, new_protection) }
            {
                let recorded = state.read_pages.record(page);
                debug_assert!(recorded);
                first_error.get_or_insert(err);
                continue;
            }
            *protection = new_protection;
        }
        first_error.map_or(Ok(()), Err)
    }

    fn handle_segfault_impl(
        &self,
        state: &mut TrackerState,
        fault_addr: usize,
        mut access: Protection,
    ) -> bool {
        // 1. Not inside any tracked range: not ours.
        let Some((base, range)) = Self::find_range(&state.ranges, fault_addr, true) else {
            return false;
        };

        let page = align_down(fault_addr, self.page_size);
        let Some(&current) = state.status.get(&page) else {
            return false;
        };

        // 2. A fault on a fully permissive page should be unreachable;
        // never swallow it, it is some other class of memory error.
        if current == Protection::ReadWrite {
            return false;
        }

        // 3. The requested bit is already granted: the bookkeeping and
        // the hardware state drifted apart. Grant whatever is missing
        // instead, and count the event.
        if current.intersects(access) {
            access = Protection::ReadWrite ^ current;
            state.corrective_faults += 1;
        }

        let Some(mapping) = state.mappings.get(&base) else {
            return false;
        };
        let offset = page - base;

        let granted = access | current;
        // # Safety
        // `page` is a live tracked page; addresses and clamping as in the
        // drain path. No allocation happens on this path: the dirty sets
        // were pre-reserved at track time, and `protect_in_trap` reports
        // failure without building an error.
        unsafe {
            if !self
                .provider
                .protect_in_trap(page as *mut u8, self.page_size, granted)
            {
                return false;
            }
        }
        if let Some(protection) = state.status.get_mut(&page) {
            *protection = granted;
        }

        let newly_granted = granted ^ current;
        if newly_granted.contains(Protection::Read) {
            debug_assert!(
                !state.read_pages.has(page),
                "read fault for a page already recorded as read"
            );
            if !state.read_pages.record(page) {
                return false;
            }
            // The CPU is about to read the page for the first time since
            // the last reset: make its copy match the device content.
            unsafe {
                let len = min(self.page_size, range.len - offset);
                copy_with_cache(
                    mapping.writable.add(offset),
                    mapping.device.add(offset),
                    mapping.cache.add(offset),
                    len,
                );
            }
        }
        if newly_granted.contains(Protection::Write) {
            debug_assert!(
                !state.written_pages.has(page),
                "write fault for a page already recorded as written"
            );
            if !state.written_pages.record(page) {
                return false;
            }
        }

        true
    }

    #[cfg(test)]
    fn page_status(&self, page: usize) -> Option<Protection> {
        self.signal_safe(|state| state.status.get(&page).copied())
    }

    #[cfg(test)]
    fn dirty_counts(&self) -> (usize, usize) {
        self.signal_safe(|state| (state.read_pages.len(), state.written_pages.len()))
    }

    #[cfg(test)]
    fn is_fully_empty(&self) -> bool {
        self.signal_safe(|state| {
            state.ranges.is_empty()
                && state.mappings.is_empty()
                && state.status.is_empty()
                && state.written_pages.is_empty()
                && state.read_pages.is_empty()
        })
    }
}

impl<P: TrapProvider> FaultHandler for MemoryTracker<P> {
    unsafe fn on_fault(&mut self, fault_addr: *mut u8, access: Protection) -> bool {
        self.handle_segfault(fault_addr, access)
    }
}

impl<P: TrapProvider> Drop for MemoryTracker<P> {
    fn drop(&mut self) {
        self.untrack_all_mapped_memory();
        // # Safety
        // The handler registered at construction dies with us; no tracked
        // range is left that could still fault.
        unsafe {
            if let Err(err) = self.provider.uninstall() {
                log::warn!("failed to uninstall the trap handler: {err}");
            }
        }
    }
}

impl<P: TrapProvider> core::fmt::Debug for MemoryTracker<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemoryTracker")
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}
