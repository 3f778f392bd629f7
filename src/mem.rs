//! Big Buffer memory management.
//!
//! A single fixed region backs every large allocation in the firmware.
//! Temporary allocations (capture rings, scratch pages) grow upward from the
//! bottom of the region; long-lived allocations (mode state that survives a
//! capture) grow downward from the top, limited to the last 8 KiB.
//!
//! Region layout, high addresses first:
//!
//! ```text
//! ( high )  end of region          -> first byte past the Big Buffer
//! ( ...  )  long-lived allocations
//! ( v--^ )  high watermark         -> first byte past the unallocated gap
//! ( ...  )  unallocated
//! ( v--^ )  low watermark          -> first unused byte
//! ( ...  )  temporary allocations
//! ( low  )  start of region       -> 32 KiB aligned
//! ```
//!
//! Every allocation is tagged with its [`Owner`] and returned as a typed
//! handle; the temporary/long-lived split lives in the type system so a
//! handle cannot be freed through the wrong path. Owner tags are still
//! re-checked on free because a stale tag is the cheapest symptom of a
//! corrupted caller.

use core::ptr::NonNull;

use static_assertions::const_assert;

/// Temporary window, sized for the logic analyzer capture ring.
pub const TEMPORARY_BUFFER_SIZE: usize = 128 * 1024;
/// Long-lived window at the top of the region.
pub const LONG_LIVED_BUFFER_SIZE: usize = 8 * 1024;
/// Total backing region size.
pub const BIG_BUFFER_SIZE: usize = TEMPORARY_BUFFER_SIZE + LONG_LIVED_BUFFER_SIZE;
/// Region alignment required by the DMA ring addressing.
pub const BIG_BUFFER_ALIGNMENT: usize = 32 * 1024;
/// Capacity of the allocation tracking table.
pub const MAX_ALLOCATIONS: usize = 32;

// The capture DMA requires a 128 KiB contiguous ring on a 32 KiB boundary.
const_assert!(TEMPORARY_BUFFER_SIZE >= 128 * 1024);
const_assert!(BIG_BUFFER_ALIGNMENT >= 32 * 1024);

/// Fill byte written over the whole region on initialization.
const INIT_FILL: u8 = 0xAA;

/// Backing storage for a [`BigBuffer`]. The embedder places one instance in
/// a static; the alignment attribute satisfies the DMA ring constraint.
#[repr(align(32768))]
pub struct BigBufferRegion(pub(crate) [u8; BIG_BUFFER_SIZE]);

impl BigBufferRegion {
    pub const fn new() -> Self {
        BigBufferRegion([0; BIG_BUFFER_SIZE])
    }
}

impl Default for BigBufferRegion {
    fn default() -> Self {
        Self::new()
    }
}

/// Allocation owner tags. A closed set with stable values; extensions append
/// only.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u16)]
pub enum Owner {
    None = 0,
    Scope = 1,
    La = 2,
    DiskFormat = 3,
    SelfTest = 4,
}

/// Kind marker carried by allocation handles.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum Kind {
    Temporary,
    LongLived,
}

/// Live entry of the tracking table.
#[derive(Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AllocationRecord {
    pub offset: usize,
    pub size: usize,
    pub alignment: usize,
    pub owner: Owner,
    pub long_lived: bool,
}

/// Snapshot of the general allocator state, for diagnostics.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Statistics {
    pub total_size: usize,
    pub low_watermark: usize,
    pub high_watermark: usize,
    pub long_lived_limit: usize,
    pub temporary_allocations: u16,
    pub long_lived_allocations: u16,
}

/// Invariant violation flags, one bit per broken rule.
mod invariant {
    pub const WATERMARKS_CROSSED: u16 = 0x0008;
    pub const LOW_WATERMARK_TOO_HIGH: u16 = 0x0020;
    pub const HIGH_WATERMARK_TOO_LOW: u16 = 0x0040;
    pub const HIGH_WATERMARK_TOO_HIGH: u16 = 0x0080;
    pub const LOW_WATERMARK_AT_ZERO_TEMP_ALLOCS: u16 = 0x0100;
    pub const HIGH_WATERMARK_WITH_NO_ALLOCS: u16 = 0x0200;
    pub const COUNTER_TABLE_MISMATCH: u16 = 0x0400;
}

/// Handle to a temporary allocation. Freeing consumes the handle; dropping
/// it without freeing leaks the region until the next full reset, which the
/// invariant checks will surface.
#[derive(Debug)]
pub struct TempAllocation {
    ptr: NonNull<u8>,
    offset: usize,
    len: usize,
    owner: Owner,
}

/// Handle to a long-lived allocation.
#[derive(Debug)]
pub struct LongLivedAllocation {
    ptr: NonNull<u8>,
    offset: usize,
    len: usize,
    owner: Owner,
}

macro_rules! impl_allocation_accessors {
    ($name:ident) => {
        impl $name {
            #[inline]
            pub fn len(&self) -> usize {
                self.len
            }

            #[inline]
            pub fn is_empty(&self) -> bool {
                self.len == 0
            }

            /// Byte offset of the allocation within the Big Buffer region.
            #[inline]
            pub fn offset(&self) -> usize {
                self.offset
            }

            #[inline]
            pub fn owner(&self) -> Owner {
                self.owner
            }

            #[inline]
            pub fn as_slice(&self) -> &[u8] {
                // Safety: the allocator hands out disjoint [offset, offset+len)
                // windows and the handle is the unique owner of this window.
                unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
            }

            #[inline]
            pub fn as_mut_slice(&mut self) -> &mut [u8] {
                // Safety: see as_slice; &mut self guarantees unique access.
                unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
            }

            /// Raw base pointer, for handing the window to a DMA engine.
            #[inline]
            pub fn as_ptr(&self) -> *mut u8 {
                self.ptr.as_ptr()
            }
        }
    };
}

impl_allocation_accessors!(TempAllocation);
impl_allocation_accessors!(LongLivedAllocation);

/// Dual-ended bump allocator over one fixed, aligned region.
///
/// No growth, no compaction: a free only reclaims space once no other live
/// allocation of the same kind extends past it. Callers that need
/// reclamation must free in reverse allocation order.
pub struct BigBuffer {
    base: NonNull<u8>,
    total_size: usize,
    /// First unused byte offset above the temporary allocations.
    low_watermark: usize,
    /// First byte offset of the lowest long-lived allocation.
    high_watermark: usize,
    /// Lowest offset a long-lived allocation may occupy.
    long_lived_limit: usize,
    temp_count: u16,
    long_lived_count: u16,
    table: [Option<AllocationRecord>; MAX_ALLOCATIONS],
}

impl BigBuffer {
    /// Takes exclusive ownership of the backing region and paints it with
    /// the init fill pattern.
    pub fn new(region: &'static mut BigBufferRegion) -> Self {
        region.0.fill(INIT_FILL);
        let base = NonNull::new(region.0.as_mut_ptr()).unwrap();
        log::info!(
            "big buffer at {:p}, size {}, long-lived window {}",
            base,
            BIG_BUFFER_SIZE,
            LONG_LIVED_BUFFER_SIZE
        );
        let buffer = BigBuffer {
            base,
            total_size: BIG_BUFFER_SIZE,
            low_watermark: 0,
            high_watermark: BIG_BUFFER_SIZE,
            long_lived_limit: BIG_BUFFER_SIZE - LONG_LIVED_BUFFER_SIZE,
            temp_count: 0,
            long_lived_count: 0,
            table: [None; MAX_ALLOCATIONS],
        };
        buffer.check_invariants();
        buffer
    }

    fn failed_invariants(&self) -> u16 {
        let mut flags = 0u16;
        if self.low_watermark > self.total_size {
            flags |= invariant::LOW_WATERMARK_TOO_HIGH;
        }
        if self.high_watermark < self.long_lived_limit {
            flags |= invariant::HIGH_WATERMARK_TOO_LOW;
        }
        if self.high_watermark > self.total_size {
            flags |= invariant::HIGH_WATERMARK_TOO_HIGH;
        }
        if self.low_watermark > self.high_watermark {
            flags |= invariant::WATERMARKS_CROSSED;
        }
        if self.temp_count == 0 && self.low_watermark != 0 {
            flags |= invariant::LOW_WATERMARK_AT_ZERO_TEMP_ALLOCS;
        }
        if self.temp_count == 0 && self.long_lived_count == 0 && self.high_watermark != self.total_size
        {
            flags |= invariant::HIGH_WATERMARK_WITH_NO_ALLOCS;
        }
        let live = self.table.iter().flatten().count();
        if live != (self.temp_count + self.long_lived_count) as usize {
            flags |= invariant::COUNTER_TABLE_MISMATCH;
        }
        flags
    }

    /// Runs on every API entry and exit. A violation here means allocator
    /// state corruption, which is never recoverable.
    #[track_caller]
    fn check_invariants(&self) {
        let flags = self.failed_invariants();
        if flags != 0 {
            log::error!(
                "big buffer invariant failed: {flags:#06x} (low {}, high {}, temp {}, long {})",
                self.low_watermark,
                self.high_watermark,
                self.temp_count,
                self.long_lived_count,
            );
            panic!("big buffer invariant failed: {flags:#06x}");
        }
    }

    #[inline]
    fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    fn find_unused_entry(&self) -> usize {
        // Successful allocations are bounded by MAX_ALLOCATIONS, so a free
        // slot always exists at this point.
        self.table
            .iter()
            .position(Option::is_none)
            .expect("allocation table full past the count check")
    }

    fn validate_request(&self, size: usize, alignment: usize) -> Option<usize> {
        if !alignment.is_power_of_two() && alignment != 0 {
            log::error!("big buffer: alignment {alignment} is not a power of 2");
            debug_assert!(false, "alignment must be a power of 2");
            return None;
        }
        // Fix up the common API error of passing zero alignment.
        let alignment = if alignment == 0 { 1 } else { alignment };
        if alignment > TEMPORARY_BUFFER_SIZE {
            log::warn!("big buffer: required alignment {alignment} too large");
            return None;
        }
        if (self.temp_count + self.long_lived_count) as usize >= MAX_ALLOCATIONS {
            log::warn!("big buffer: too many allocations");
            return None;
        }
        if size == 0 {
            log::warn!("big buffer: refusing zero-byte allocation");
            return None;
        }
        Some(alignment)
    }

    fn record(&mut self, offset: usize, size: usize, alignment: usize, owner: Owner, long: bool) {
        let idx = self.find_unused_entry();
        self.table[idx] = Some(AllocationRecord {
            offset,
            size,
            alignment,
            owner,
            long_lived: long,
        });
    }

    /// Zeroes and hands out the window; the unsafe block is the single place
    /// raw region memory turns into a handle.
    fn make_handle(&mut self, offset: usize, len: usize) -> NonNull<u8> {
        // Safety: offset+len lie inside the region (watermark arithmetic)
        // and no other live handle overlaps [offset, offset+len) because the
        // window was carved from the unallocated gap between the watermarks.
        unsafe {
            let ptr = self.base.as_ptr().add(offset);
            core::ptr::write_bytes(ptr, 0, len);
            NonNull::new_unchecked(ptr)
        }
    }

    /// Allocates from the temporary (bottom) end of the region.
    ///
    /// Returns `None` if the alignment is invalid, the tracking table is
    /// full, `size` is zero, or the gap between the watermarks cannot fit
    /// the aligned request.
    pub fn alloc_temporary(
        &mut self,
        size: usize,
        alignment: usize,
        owner: Owner,
    ) -> Option<TempAllocation> {
        self.check_invariants();
        let alignment = self.validate_request(size, alignment)?;

        if size > self.high_watermark - self.low_watermark {
            log::warn!(
                "big buffer: requested {size} bytes > {} available",
                self.high_watermark - self.low_watermark
            );
            return None;
        }

        // Alignment applies to absolute addresses, not region offsets.
        let mask = alignment - 1;
        let mut addr = self.base_addr() + self.low_watermark;
        if addr & mask != 0 {
            addr = (addr + alignment) & !mask;
            let offset = addr - self.base_addr();
            if self.high_watermark < offset || self.high_watermark - offset < size {
                log::warn!("big buffer: insufficient space due to alignment requirement");
                return None;
            }
        }
        let offset = addr - self.base_addr();

        self.low_watermark = offset + size;
        self.temp_count += 1;
        self.record(offset, size, alignment, owner, false);
        let ptr = self.make_handle(offset, size);

        self.check_invariants();
        Some(TempAllocation {
            ptr,
            offset,
            len: size,
            owner,
        })
    }

    /// Allocates from the long-lived (top) end of the region.
    ///
    /// Long-lived allocations never extend below the low watermark and are
    /// limited to the top 8 KiB unless the temporary side is shorter.
    pub fn alloc_long_lived(
        &mut self,
        size: usize,
        alignment: usize,
        owner: Owner,
    ) -> Option<LongLivedAllocation> {
        self.check_invariants();
        let alignment = self.validate_request(size, alignment)?;

        let lower_limit = self.long_lived_limit.max(self.low_watermark);
        if size > self.high_watermark - lower_limit {
            log::warn!(
                "big buffer: requested {size} bytes > {} long-lived bytes available",
                self.high_watermark - lower_limit
            );
            return None;
        }

        let mask = alignment - 1;
        // Align the start downward toward the lower limit.
        let mut addr = self.base_addr() + self.high_watermark - size;
        addr &= !mask;
        let offset = addr - self.base_addr();
        if offset < lower_limit {
            log::warn!("big buffer: insufficient long-lived space due to alignment requirement");
            return None;
        }

        self.high_watermark = offset;
        self.long_lived_count += 1;
        self.record(offset, size, alignment, owner, true);
        let ptr = self.make_handle(offset, size);

        self.check_invariants();
        Some(LongLivedAllocation {
            ptr,
            offset,
            len: size,
            owner,
        })
    }

    /// Locates the table entry for a freed handle and validates the caller.
    /// An owner or kind mismatch is allocator corruption and therefore
    /// fatal.
    fn release_entry(&mut self, offset: usize, owner: Owner, kind: Kind) {
        let entry = self
            .table
            .iter_mut()
            .find(|slot| slot.is_some_and(|record| record.offset == offset));
        let Some(slot) = entry else {
            panic!("big buffer: freed pointer was not allocated (offset {offset})");
        };
        let record = slot.unwrap();
        if record.owner != owner {
            log::error!(
                "big buffer: owner tag mismatch at offset {offset}: allocated by {:?}, freed by {:?}",
                record.owner,
                owner
            );
            panic!("big buffer: owner tag mismatch");
        }
        match kind {
            Kind::Temporary if record.long_lived => {
                panic!("big buffer: freeing a long-lived allocation as temporary")
            }
            Kind::LongLived if !record.long_lived => {
                panic!("big buffer: freeing a temporary allocation as long-lived")
            }
            _ => {}
        }

        // Clear first so the watermark rescan below no longer sees it.
        *slot = None;
        match kind {
            Kind::Temporary => {
                self.temp_count -= 1;
                self.low_watermark = self.determine_low_watermark();
            }
            Kind::LongLived => {
                self.long_lived_count -= 1;
                self.high_watermark = self.determine_high_watermark();
            }
        }
    }

    /// Highest end offset over the live temporary entries; never derived
    /// from tracking order.
    fn determine_low_watermark(&self) -> usize {
        self.table
            .iter()
            .flatten()
            .filter(|record| !record.long_lived)
            .map(|record| record.offset + record.size)
            .max()
            .unwrap_or(0)
    }

    /// Lowest start offset over the live long-lived entries.
    fn determine_high_watermark(&self) -> usize {
        self.table
            .iter()
            .flatten()
            .filter(|record| record.long_lived)
            .map(|record| record.offset)
            .min()
            .unwrap_or(self.total_size)
    }

    /// Frees a temporary allocation. The owner must match the tag recorded
    /// at allocation time.
    pub fn free_temporary(&mut self, allocation: TempAllocation, owner: Owner) {
        self.check_invariants();
        self.release_entry(allocation.offset, owner, Kind::Temporary);
        self.check_invariants();
    }

    /// Frees a long-lived allocation.
    pub fn free_long_lived(&mut self, allocation: LongLivedAllocation, owner: Owner) {
        self.check_invariants();
        self.release_entry(allocation.offset, owner, Kind::LongLived);
        self.check_invariants();
    }

    /// `free(NULL)` call shape for optional handles; `None` is a no-op.
    pub fn free_temporary_opt(&mut self, allocation: Option<TempAllocation>, owner: Owner) {
        if let Some(allocation) = allocation {
            self.free_temporary(allocation, owner);
        }
    }

    /// Largest temporary allocation that could currently succeed at the
    /// given alignment, 0 if none.
    pub fn available_temporary(&self, alignment: usize) -> usize {
        self.check_invariants();
        let alignment = if alignment == 0 { 1 } else { alignment };
        if !alignment.is_power_of_two() {
            debug_assert!(false, "alignment must be a power of 2");
            return 0;
        }
        let mask = alignment - 1;
        let aligned_low = (self.base_addr() + self.low_watermark + mask) & !mask;
        let aligned_low = aligned_low - self.base_addr();
        if aligned_low >= self.high_watermark {
            return 0;
        }
        self.high_watermark - aligned_low
    }

    /// Largest long-lived allocation that could currently succeed.
    pub fn available_long_lived(&self, alignment: usize) -> usize {
        self.check_invariants();
        let alignment = if alignment == 0 { 1 } else { alignment };
        if !alignment.is_power_of_two() {
            debug_assert!(false, "alignment must be a power of 2");
            return 0;
        }
        let mask = alignment - 1;
        let lower = self.long_lived_limit.max(self.low_watermark);
        let aligned_lower = (self.base_addr() + lower + mask) & !mask;
        let aligned_lower = aligned_lower - self.base_addr();
        if aligned_lower >= self.high_watermark {
            return 0;
        }
        self.high_watermark - aligned_lower
    }

    /// Asserts that no temporary allocations are outstanding. Strongly
    /// recommended before a mode change; a dangling capture ring at that
    /// point is a bug that is essentially impossible to debug later.
    pub fn verify_no_temporary_allocations(&self) {
        self.check_invariants();
        assert!(
            self.temp_count == 0,
            "{} temporary allocations outstanding across a reset boundary",
            self.temp_count
        );
    }

    pub fn statistics(&self) -> Statistics {
        self.check_invariants();
        Statistics {
            total_size: self.total_size,
            low_watermark: self.low_watermark,
            high_watermark: self.high_watermark,
            long_lived_limit: self.long_lived_limit,
            temporary_allocations: self.temp_count,
            long_lived_allocations: self.long_lived_count,
        }
    }

    /// Live tracking entries, address sorted, for the diagnostics display.
    pub fn detailed_statistics(&self) -> heapless::Vec<AllocationRecord, MAX_ALLOCATIONS> {
        self.check_invariants();
        let mut live: heapless::Vec<AllocationRecord, MAX_ALLOCATIONS> =
            self.table.iter().flatten().copied().collect();
        live.sort_unstable_by_key(|record| record.offset);
        live
    }
}

/// Exercises the allocator against its own invariants. Run from the
/// self-test command; all allocations use the [`Owner::SelfTest`] tag and
/// are released before returning.
pub fn self_test(buffer: &mut BigBuffer) -> bool {
    let before = buffer.statistics();

    let Some(a) = buffer.alloc_temporary(4096, 4, Owner::SelfTest) else {
        return false;
    };
    let Some(b) = buffer.alloc_temporary(512, 32, Owner::SelfTest) else {
        buffer.free_temporary(a, Owner::SelfTest);
        return false;
    };
    let Some(c) = buffer.alloc_long_lived(1024, 8, Owner::SelfTest) else {
        buffer.free_temporary(b, Owner::SelfTest);
        buffer.free_temporary(a, Owner::SelfTest);
        return false;
    };

    let zeroed = a.as_slice().iter().all(|&byte| byte == 0)
        && b.as_slice().iter().all(|&byte| byte == 0)
        && c.as_slice().iter().all(|&byte| byte == 0);

    // Free out of order on purpose: the low watermark may only fall once the
    // highest temporary goes away.
    buffer.free_temporary(a, Owner::SelfTest);
    let mid = buffer.statistics();
    buffer.free_temporary(b, Owner::SelfTest);
    buffer.free_long_lived(c, Owner::SelfTest);

    let after = buffer.statistics();
    zeroed && mid.temporary_allocations == 1 && before == after
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_buffer() -> BigBuffer {
        BigBuffer::new(Box::leak(Box::new(BigBufferRegion::new())))
    }

    #[test]
    fn fresh_buffer_has_full_windows() {
        let buffer = fresh_buffer();
        let stats = buffer.statistics();
        assert_eq!(stats.low_watermark, 0);
        assert_eq!(stats.high_watermark, BIG_BUFFER_SIZE);
        assert_eq!(buffer.available_temporary(1), BIG_BUFFER_SIZE);
        assert_eq!(buffer.available_long_lived(1), LONG_LIVED_BUFFER_SIZE);
    }

    #[test]
    fn temporary_allocation_is_aligned_and_zeroed() {
        let mut buffer = fresh_buffer();
        // Misalign the low watermark first.
        let pad = buffer.alloc_temporary(3, 1, Owner::SelfTest).unwrap();
        for alignment in [1usize, 4, 64, 4096] {
            let alloc = buffer
                .alloc_temporary(100, alignment, Owner::SelfTest)
                .unwrap();
            assert_eq!(alloc.as_ptr() as usize % alignment, 0);
            assert!(alloc.as_slice().iter().all(|&byte| byte == 0));
            buffer.free_temporary(alloc, Owner::SelfTest);
        }
        buffer.free_temporary(pad, Owner::SelfTest);
    }

    #[test]
    fn rejects_zero_size_bad_alignment_and_exhaustion() {
        let mut buffer = fresh_buffer();
        assert!(buffer.alloc_temporary(0, 1, Owner::Scope).is_none());
        assert!(
            buffer
                .alloc_temporary(64, 2 * TEMPORARY_BUFFER_SIZE, Owner::Scope)
                .is_none()
        );
        assert!(
            buffer
                .alloc_temporary(BIG_BUFFER_SIZE + 1, 1, Owner::Scope)
                .is_none()
        );
    }

    #[test]
    fn tracking_table_capacity_is_enforced() {
        let mut buffer = fresh_buffer();
        let mut held = Vec::new();
        for _ in 0..MAX_ALLOCATIONS {
            held.push(buffer.alloc_temporary(16, 1, Owner::Scope).unwrap());
        }
        assert!(buffer.alloc_temporary(16, 1, Owner::Scope).is_none());
        assert!(buffer.alloc_long_lived(16, 1, Owner::Scope).is_none());
        for alloc in held {
            buffer.free_temporary(alloc, Owner::Scope);
        }
        assert_eq!(buffer.statistics().temporary_allocations, 0);
    }

    #[test]
    fn long_lived_never_crosses_the_low_watermark() {
        let mut buffer = fresh_buffer();
        // Push the low watermark into the long-lived window.
        let big = buffer
            .alloc_temporary(BIG_BUFFER_SIZE - 1024, 1, Owner::La)
            .unwrap();
        assert!(buffer.alloc_long_lived(2048, 1, Owner::Scope).is_none());
        let small = buffer.alloc_long_lived(1024, 1, Owner::Scope).unwrap();
        buffer.free_long_lived(small, Owner::Scope);
        buffer.free_temporary(big, Owner::La);
    }

    #[test]
    fn free_in_any_order_restores_the_watermarks() {
        let mut buffer = fresh_buffer();
        let a = buffer.alloc_temporary(1000, 1, Owner::Scope).unwrap();
        let b = buffer.alloc_temporary(2000, 1, Owner::Scope).unwrap();
        let c = buffer.alloc_long_lived(100, 1, Owner::Scope).unwrap();
        let d = buffer.alloc_long_lived(200, 1, Owner::Scope).unwrap();

        // Freeing the lower temporary alone reclaims nothing.
        let high_mark = buffer.statistics().low_watermark;
        buffer.free_temporary(a, Owner::Scope);
        assert_eq!(buffer.statistics().low_watermark, high_mark);

        buffer.free_long_lived(c, Owner::Scope);
        buffer.free_temporary(b, Owner::Scope);
        buffer.free_long_lived(d, Owner::Scope);
        let stats = buffer.statistics();
        assert_eq!(stats.low_watermark, 0);
        assert_eq!(stats.high_watermark, BIG_BUFFER_SIZE);
        assert_eq!(buffer.available_long_lived(1), LONG_LIVED_BUFFER_SIZE);
    }

    #[test]
    fn table_count_matches_kind_counters_through_random_churn() {
        let mut buffer = fresh_buffer();
        let mut temps = Vec::new();
        let mut longs = Vec::new();
        // Deterministic pseudo-random interleave of the four operations.
        let mut state = 0x2F6E2B1u32;
        for _ in 0..500 {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            match state >> 29 {
                0 | 1 | 2 => {
                    if let Some(alloc) =
                        buffer.alloc_temporary(1 + (state as usize & 0x3FF), 4, Owner::SelfTest)
                    {
                        temps.push(alloc);
                    }
                }
                3 | 4 => {
                    if let Some(alloc) =
                        buffer.alloc_long_lived(1 + (state as usize & 0xFF), 2, Owner::SelfTest)
                    {
                        longs.push(alloc);
                    }
                }
                5 | 6 => {
                    if !temps.is_empty() {
                        let alloc = temps.swap_remove(state as usize % temps.len());
                        buffer.free_temporary(alloc, Owner::SelfTest);
                    }
                }
                _ => {
                    if !longs.is_empty() {
                        let alloc = longs.swap_remove(state as usize % longs.len());
                        buffer.free_long_lived(alloc, Owner::SelfTest);
                    }
                }
            }
            let stats = buffer.statistics();
            let live = buffer.detailed_statistics().len();
            assert_eq!(
                live,
                (stats.temporary_allocations + stats.long_lived_allocations) as usize
            );
        }
        for alloc in temps {
            buffer.free_temporary(alloc, Owner::SelfTest);
        }
        for alloc in longs {
            buffer.free_long_lived(alloc, Owner::SelfTest);
        }
        buffer.verify_no_temporary_allocations();
    }

    #[test]
    #[should_panic(expected = "owner tag mismatch")]
    fn owner_mismatch_on_free_is_fatal() {
        let mut buffer = fresh_buffer();
        let alloc = buffer.alloc_temporary(64, 1, Owner::La).unwrap();
        buffer.free_temporary(alloc, Owner::Scope);
    }

    #[test]
    fn self_test_passes_on_a_fresh_buffer() {
        let mut buffer = fresh_buffer();
        assert!(self_test(&mut buffer));
        buffer.verify_no_temporary_allocations();
    }
}
