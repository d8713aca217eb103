//! The emulated address space: an ordered collection of mapped ranges with
//! permission tracking and access fast paths.

use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    fmt,
    rc::Rc,
};

use crate::{
    align_down_to_page,
    log::{log_error, log_event},
    range::{CodeVersion, MappedRange, Scalar},
    round_up_to_page, WordSize, PAGE_BITS, PAGE_SIZE,
};

/// Slots in each direct-mapped range cache. Must be a power of two.
const RANGE_CACHE_SIZE: usize = 256;

/// A small direct-mapped cache of page address to owning range, with a
/// single "last used" slot checked first.
///
/// Consecutive accesses (sequential instruction fetch, string operations)
/// hit the last-used slot; scattered accesses across a bounded working set
/// hit the indexed slots. The cache holds plain `Rc` handles and is cleared
/// wholesale whenever the range list changes, so a populated slot can never
/// point at a range that has been replaced.
struct RangeCache {
    slots: Box<[Option<Rc<MappedRange>>]>,
    last: Option<Rc<MappedRange>>,
}

impl RangeCache {
    fn new() -> Self {
        RangeCache {
            slots: vec![None; RANGE_CACHE_SIZE].into_boxed_slice(),
            last: None,
        }
    }

    fn index(page_addr: u64) -> usize {
        ((page_addr >> PAGE_BITS) as usize) & (RANGE_CACHE_SIZE - 1)
    }

    fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.last = None;
    }

    fn lookup(&mut self, page_addr: u64) -> Option<Rc<MappedRange>> {
        if let Some(r) = &self.last {
            if r.contains(page_addr) {
                return Some(Rc::clone(r));
            }
        }
        if let Some(r) = &self.slots[Self::index(page_addr)] {
            if r.contains(page_addr) {
                let r = Rc::clone(r);
                self.last = Some(Rc::clone(&r));
                return Some(r);
            }
        }
        None
    }

    fn insert(&mut self, page_addr: u64, range: &Rc<MappedRange>) {
        self.last = Some(Rc::clone(range));
        self.slots[Self::index(page_addr)] = Some(Rc::clone(range));
    }
}

/// A page-granular model of a guest process's virtual address space.
///
/// The range list partitions the full address range: unmapped spans are
/// represented by invalid tombstone ranges, never by absence, which keeps
/// hole scanning and removal a single ordered walk. The three permission
/// sets and the two page lookup maps are rebuilt from scratch after every
/// structural change; they are never patched incrementally.
pub struct AddressSpace {
    word_size: WordSize,
    addr_mask: u64,
    /// Whether writes to executable pages invalidate code versions and
    /// trace-head markers (self-modifying-code tracking).
    version_code: bool,
    /// All ranges, valid and invalid, sorted by base address after every
    /// structural change.
    maps: Vec<Rc<MappedRange>>,
    /// The full-span invalid sentinel returned for lookup misses.
    invalid: Rc<MappedRange>,
    page_is_readable: HashSet<u64>,
    page_is_writable: HashSet<u64>,
    page_is_executable: HashSet<u64>,
    /// Page -> range, for every page with at least one permission bit.
    page_to_map: HashMap<u64, Rc<MappedRange>>,
    /// Page -> range, restricted to writable-and-not-executable pages. A
    /// write that misses here is either unmapped or needs the
    /// code-version-invalidation slow path.
    wnx_page_to_map: HashMap<u64, Rc<MappedRange>>,
    range_cache: RefCell<RangeCache>,
    wnx_range_cache: RefCell<RangeCache>,
    /// Addresses marked as trace heads; cleared wholesale on
    /// self-modification.
    trace_heads: HashSet<u64>,
    /// Lowest mapped address, `u64::MAX` when nothing is mapped.
    min_addr: u64,
    /// Limit address of the heap snapshot page, for brk emulation.
    pub(crate) initial_program_break: u64,
    is_dead: bool,
}

impl AddressSpace {
    pub fn new(word_size: WordSize, version_code: bool) -> AddressSpace {
        let addr_mask = word_size.addr_mask();
        let invalid = MappedRange::create_invalid(0, addr_mask);
        let mut space = AddressSpace {
            word_size,
            addr_mask,
            version_code,
            maps: vec![Rc::clone(&invalid)],
            invalid,
            page_is_readable: HashSet::new(),
            page_is_writable: HashSet::new(),
            page_is_executable: HashSet::new(),
            page_to_map: HashMap::new(),
            wnx_page_to_map: HashMap::new(),
            range_cache: RefCell::new(RangeCache::new()),
            wnx_range_cache: RefCell::new(RangeCache::new()),
            trace_heads: HashSet::new(),
            min_addr: u64::MAX,
            initial_program_break: 0,
            is_dead: false,
        };
        space.rebuild_page_maps();
        space
    }

    /// A copy-on-write style fork: the new space deep-copies every valid
    /// range (independent backing storage) and duplicates permissions and
    /// trace-head markers by value. After this, the two spaces share
    /// nothing and need no further coordination.
    pub fn fork(&self) -> AddressSpace {
        let maps = self
            .maps
            .iter()
            .map(|r| {
                if r.is_valid() {
                    r.clone_storage()
                } else {
                    Rc::clone(r)
                }
            })
            .collect();
        let mut space = AddressSpace {
            word_size: self.word_size,
            addr_mask: self.addr_mask,
            version_code: self.version_code,
            maps,
            invalid: Rc::clone(&self.invalid),
            page_is_readable: self.page_is_readable.clone(),
            page_is_writable: self.page_is_writable.clone(),
            page_is_executable: self.page_is_executable.clone(),
            page_to_map: HashMap::new(),
            wnx_page_to_map: HashMap::new(),
            range_cache: RefCell::new(RangeCache::new()),
            wnx_range_cache: RefCell::new(RangeCache::new()),
            trace_heads: self.trace_heads.clone(),
            min_addr: self.min_addr,
            initial_program_break: self.initial_program_break,
            is_dead: self.is_dead,
        };
        space.rebuild_page_maps();
        space
    }

    /// Release all storage and mark this space dead. Subsequent mutating
    /// operations log an error and return failure.
    pub fn kill(&mut self) {
        self.maps.clear();
        self.page_to_map.clear();
        self.wnx_page_to_map.clear();
        self.page_is_readable.clear();
        self.page_is_writable.clear();
        self.page_is_executable.clear();
        self.trace_heads.clear();
        self.range_cache.borrow_mut().clear();
        self.wnx_range_cache.borrow_mut().clear();
        self.is_dead = true;
    }

    pub fn is_dead(&self) -> bool {
        self.is_dead
    }

    pub fn mark_as_trace_head(&mut self, pc: u64) {
        self.trace_heads.insert(pc);
    }

    pub fn is_marked_trace_head(&self, pc: u64) -> bool {
        self.trace_heads.contains(&pc)
    }

    /// Forget every trace-head marker, forcing future decodes to rediscover
    /// traces (used after self-modification invalidation).
    pub fn clear_trace_heads(&mut self) {
        self.trace_heads.clear();
    }

    pub fn can_read(&self, addr: u64) -> bool {
        self.page_is_readable
            .contains(&align_down_to_page(addr & self.addr_mask))
    }

    pub fn can_write(&self, addr: u64) -> bool {
        self.page_is_writable
            .contains(&align_down_to_page(addr & self.addr_mask))
    }

    pub fn can_execute(&self, addr: u64) -> bool {
        self.page_is_executable
            .contains(&align_down_to_page(addr & self.addr_mask))
    }

    fn can_write_aligned(&self, page_addr: u64) -> bool {
        self.page_is_writable.contains(&page_addr)
    }

    fn can_execute_aligned(&self, page_addr: u64) -> bool {
        self.page_is_executable.contains(&page_addr)
    }

    /// Map `[base, base + size)` (page-rounded) with the given provenance
    /// name and file offset, replacing any overlapped mappings. The new
    /// span is granted read+write (never execute) permission; callers
    /// adjust via [AddressSpace::set_permissions].
    ///
    /// Returns the new range, or `None` if the space is dead or `base`
    /// does not fit the address mask.
    pub fn create_map(
        &mut self,
        base: u64,
        size: u64,
        name: &str,
        offset: u64,
    ) -> Option<Rc<MappedRange>> {
        let base = align_down_to_page(base);
        let limit = base.saturating_add(round_up_to_page(size)).min(self.addr_mask);

        if self.is_dead {
            log_error(&format!(
                "trying to map range [{base:x}, {limit:x}) in dead address space"
            ));
            return None;
        }

        if base & self.addr_mask != base {
            log_error(&format!(
                "base address {base:x} cannot fit into mask {:x}; \
                 mapping a 64-bit address into a 32-bit address space?",
                self.addr_mask
            ));
            return None;
        }

        log_event(&format!("mapping range [{base:x}, {limit:x})"));

        let new_map = MappedRange::create(base, limit, name, offset);
        let old_len = self.maps.len();
        self.maps = remove_range(&self.maps, base, limit);
        if self.maps.len() < old_len {
            log_event(&format!(
                "new map [{base:x}, {limit:x}) overlapped with {} existing maps",
                old_len - self.maps.len()
            ));
        }
        self.maps.push(Rc::clone(&new_map));
        self.set_permissions(base, limit - base, true, true, false);
        Some(new_map)
    }

    /// [AddressSpace::create_map], discarding the handle.
    pub fn add_map(&mut self, base: u64, size: u64, name: &str, offset: u64) {
        self.create_map(base, size, name, offset);
    }

    /// Unmap `[base, base + size)` (page-rounded): overlapped mappings are
    /// replaced by an invalid tombstone and all permissions over the span
    /// are cleared.
    pub fn remove_map(&mut self, base: u64, size: u64) {
        let base = align_down_to_page(base);
        let limit = base.saturating_add(round_up_to_page(size)).min(self.addr_mask);

        if self.is_dead {
            log_error(&format!(
                "trying to unmap range [{base:x}, {limit:x}) in dead address space"
            ));
            return;
        }

        if base & self.addr_mask != base {
            log_error(&format!(
                "base address {base:x} cannot fit into mask {:x}; \
                 unmapping a 64-bit address from a 32-bit address space?",
                self.addr_mask
            ));
            return;
        }

        log_event(&format!("unmapping range [{base:x}, {limit:x})"));

        let tombstone = MappedRange::create_invalid(base, limit);
        self.maps = remove_range(&self.maps, base, limit);
        self.maps.push(tombstone);
        self.set_permissions(base, limit - base, false, false, false);
    }

    /// Set the permissions of every page in `[base, base + size)`
    /// (page-rounded), then rebuild the page lookup maps.
    pub fn set_permissions(
        &mut self,
        base: u64,
        size: u64,
        can_read: bool,
        can_write: bool,
        can_exec: bool,
    ) {
        if self.is_dead {
            log_error(&format!(
                "trying to set permissions at {base:x} in dead address space"
            ));
            return;
        }
        let base = align_down_to_page(base);
        let limit = base.saturating_add(round_up_to_page(size));
        let mut addr = base;
        while addr < limit {
            if can_read {
                self.page_is_readable.insert(addr);
            } else {
                self.page_is_readable.remove(&addr);
            }
            if can_write {
                self.page_is_writable.insert(addr);
            } else {
                self.page_is_writable.remove(&addr);
            }
            if can_exec {
                self.page_is_executable.insert(addr);
            } else {
                self.page_is_executable.remove(&addr);
            }
            let Some(next) = addr.checked_add(PAGE_SIZE) else {
                break;
            };
            addr = next;
        }
        self.rebuild_page_maps();
    }

    /// Returns `true` if `addr` is mapped with any permission.
    pub fn is_mapped(&self, addr: u64) -> bool {
        if self.is_dead {
            return false;
        }
        self.page_to_map
            .contains_key(&align_down_to_page(addr & self.addr_mask))
    }

    /// Find the highest-addressed hole of at least `size` bytes within
    /// `[min, max)`: the returned base places the allocation at the top of
    /// that hole (last-fit from the top). Returns `None` if no gap is large
    /// enough or `size` is zero.
    pub fn find_hole(&self, min: u64, max: u64, size: u64) -> Option<u64> {
        if size == 0 {
            return None;
        }
        let min = align_down_to_page(min);
        let max = align_down_to_page(max);
        if min >= max {
            return None;
        }
        let size = round_up_to_page(size);
        if size > max - min {
            return None;
        }

        // Invalid tombstones bracket the valid ranges, so a gap is either
        // the interior of a tombstone or the space between two consecutive
        // valid ranges.
        let mut it = self.maps.iter().rev().peekable();
        while let Some(range_high) = it.next() {
            let (high_base, low_limit) = if !range_high.is_valid() {
                (range_high.limit_address(), range_high.base_address())
            } else if let Some(range_low) = it.peek() {
                (range_high.base_address(), range_low.limit_address())
            } else {
                break;
            };

            if high_base < min {
                break;
            }
            debug_assert!(low_limit <= high_base);
            if low_limit >= max {
                continue;
            }

            let alloc_max = max.min(high_base);
            let alloc_min = min.max(low_limit);
            if alloc_max - alloc_min < size {
                continue;
            }
            let hole = alloc_max - size;
            debug_assert!(hole >= alloc_min);
            return Some(hole);
        }
        None
    }

    /// Read `out.len()` bytes starting at `addr`. The request is split at
    /// page boundaries; the owning range is resolved once per page. Fails
    /// at the first unreadable byte; bytes before the failure have already
    /// been copied into `out`.
    pub fn try_read(&self, addr: u64, out: &mut [u8]) -> bool {
        let mut addr = addr & self.addr_mask;
        let Some(end_addr) = addr.checked_add(out.len() as u64) else {
            return false;
        };
        let mut i = 0;
        let mut page_addr = align_down_to_page(addr);
        while page_addr < end_addr {
            let range = self.find_range_aligned(page_addr);
            let next_end = end_addr.min(page_addr.saturating_add(PAGE_SIZE));
            while addr < next_end {
                match range.read(addr) {
                    Some(byte) => out[i] = byte,
                    None => return false,
                }
                i += 1;
                addr += 1;
            }
            let Some(next) = page_addr.checked_add(PAGE_SIZE) else {
                break;
            };
            page_addr = next;
        }
        true
    }

    /// Write `bytes` starting at `addr`. Fails at the first unwritable
    /// page; writes to earlier pages remain visible (best-effort, no
    /// rollback). Callers needing atomicity must pre-check with
    /// [AddressSpace::can_write] over the span.
    ///
    /// With code versioning enabled, a write landing on an executable page
    /// invalidates the owning range's code version and clears every
    /// trace-head marker in the space.
    pub fn try_write(&mut self, addr: u64, bytes: &[u8]) -> bool {
        let mut addr = addr & self.addr_mask;
        let Some(end_addr) = addr.checked_add(bytes.len() as u64) else {
            return false;
        };
        let mut i = 0;
        let mut page_addr = align_down_to_page(addr);
        while page_addr < end_addr {
            if !self.can_write_aligned(page_addr) {
                return false;
            }
            let range = self.find_range_aligned(page_addr);
            if self.version_code && self.can_execute_aligned(page_addr) {
                range.invalidate_code_version();
                self.trace_heads.clear();
            }
            let next_end = end_addr.min(page_addr.saturating_add(PAGE_SIZE));
            while addr < next_end {
                if !range.write(addr, bytes[i]) {
                    return false;
                }
                i += 1;
                addr += 1;
            }
            let Some(next) = page_addr.checked_add(PAGE_SIZE) else {
                break;
            };
            page_addr = next;
        }
        true
    }

    pub fn try_read_u8(&self, addr: u64) -> Option<u8> {
        let addr = addr & self.addr_mask;
        self.find_range(addr).read(addr)
    }

    pub fn try_write_u8(&mut self, addr: u64, val: u8) -> bool {
        let masked = addr & self.addr_mask;
        // A hit in the WNX lookup means the page is writable and not
        // executable, so the permission check and the self-modification
        // path can both be skipped.
        if self.find_wnx_range(masked).write(masked, val) {
            return true;
        }
        self.try_write(masked, &[val])
    }

    fn try_read_scalar<T: Scalar>(&self, addr: u64) -> Option<T> {
        let addr = addr & self.addr_mask;
        if let Some(val) = self.find_range(addr).read_scalar::<T>(addr) {
            return Some(val);
        }
        // Straddles a page boundary or missed the lookup: generic path.
        let mut buf = [0u8; 8];
        if self.try_read(addr, &mut buf[..T::LEN]) {
            Some(T::from_le(&buf[..T::LEN]))
        } else {
            None
        }
    }

    fn try_write_scalar<T: Scalar>(&mut self, addr: u64, val: T) -> bool {
        let masked = addr & self.addr_mask;
        if self.find_wnx_range(masked).write_scalar(masked, val) {
            return true;
        }
        let mut buf = [0u8; 8];
        val.write_le(&mut buf[..T::LEN]);
        self.try_write(masked, &buf[..T::LEN])
    }

    pub fn try_read_u16(&self, addr: u64) -> Option<u16> {
        self.try_read_scalar(addr)
    }

    pub fn try_read_u32(&self, addr: u64) -> Option<u32> {
        self.try_read_scalar(addr)
    }

    pub fn try_read_u64(&self, addr: u64) -> Option<u64> {
        self.try_read_scalar(addr)
    }

    pub fn try_read_f32(&self, addr: u64) -> Option<f32> {
        self.try_read_scalar(addr)
    }

    pub fn try_read_f64(&self, addr: u64) -> Option<f64> {
        self.try_read_scalar(addr)
    }

    pub fn try_write_u16(&mut self, addr: u64, val: u16) -> bool {
        self.try_write_scalar(addr, val)
    }

    pub fn try_write_u32(&mut self, addr: u64, val: u32) -> bool {
        self.try_write_scalar(addr, val)
    }

    pub fn try_write_u64(&mut self, addr: u64, val: u64) -> bool {
        self.try_write_scalar(addr, val)
    }

    pub fn try_write_f32(&mut self, addr: u64, val: f32) -> bool {
        self.try_write_scalar(addr, val)
    }

    pub fn try_write_f64(&mut self, addr: u64, val: f64) -> bool {
        self.try_write_scalar(addr, val)
    }

    /// Read a byte for instruction decoding: fails unless the byte is both
    /// readable through its range and on an executable page.
    pub fn try_read_executable(&self, pc: u64) -> Option<u8> {
        let addr = pc & self.addr_mask;
        let page_addr = align_down_to_page(addr);
        let byte = self.find_range_aligned(page_addr).read(addr)?;
        if self.can_execute_aligned(page_addr) {
            Some(byte)
        } else {
            None
        }
    }

    /// The host address backing guest address `addr`, for reading, or
    /// `None` if `addr` is unmapped. Valid until the next structural
    /// change.
    pub fn to_read_only_ptr(&self, addr: u64) -> Option<*const u8> {
        let addr = addr & self.addr_mask;
        self.find_range(addr).to_read_only_ptr(addr)
    }

    /// The host address backing guest address `addr`, for writing. Writes
    /// through the pointer bypass self-modifying-code detection.
    pub fn to_read_write_ptr(&self, addr: u64) -> Option<*mut u8> {
        let addr = addr & self.addr_mask;
        self.find_range(addr).to_read_write_ptr(addr)
    }

    /// The code version associated with `pc`, or 0 when code versioning is
    /// disabled.
    pub fn compute_code_version(&self, pc: u64) -> CodeVersion {
        if self.version_code {
            let addr = pc & self.addr_mask;
            self.find_range(addr).compute_code_version()
        } else {
            0
        }
    }

    /// Lowest mapped address, `u64::MAX` when nothing is mapped.
    pub fn min_addr(&self) -> u64 {
        self.min_addr
    }

    /// Limit address of the heap snapshot page, for brk emulation. Zero if
    /// no heap page has been added.
    pub fn initial_program_break(&self) -> u64 {
        self.initial_program_break
    }

    /// Log the current memory maps, one line per valid range, at event
    /// verbosity.
    pub fn log_maps(&self) {
        log_event("memory maps:");
        for range in self.maps.iter().filter(|r| r.is_valid()) {
            log_event(&self.render_map_line(range));
        }
    }

    fn render_map_line(&self, range: &MappedRange) -> String {
        let width = self.word_size.hex_digits();
        let mut line = format!(
            "  [{:0width$x}, {:0width$x})",
            range.base_address(),
            range.limit_address(),
        );
        if let Some(ptr) = range.to_read_only_ptr(range.base_address()) {
            line.push_str(&format!(" at {ptr:p}"));
        }
        if !range.name().is_empty() {
            line.push_str(&format!(" from {}", range.name()));
            if range.offset() != 0 {
                line.push_str(&format!(" (offset {:x})", range.offset()));
            }
        }
        line
    }

    /// Clear both lookup maps and both pointer caches, re-sort the range
    /// list, recompute `min_addr`, and repopulate the lookup maps from the
    /// permission sets. Called after every structural or permission change;
    /// consistency is restored wholesale, never patched.
    fn rebuild_page_maps(&mut self) {
        self.page_to_map.clear();
        self.wnx_page_to_map.clear();
        self.range_cache.borrow_mut().clear();
        self.wnx_range_cache.borrow_mut().clear();

        self.maps.sort_by_key(|m| m.base_address());
        self.min_addr = u64::MAX;

        for map in &self.maps {
            if !map.is_valid() {
                continue;
            }
            let base = map.base_address();
            let limit = map.limit_address();
            self.min_addr = self.min_addr.min(base);
            let mut addr = base;
            while addr < limit {
                let can_read = self.page_is_readable.contains(&addr);
                let can_write = self.page_is_writable.contains(&addr);
                let can_exec = self.page_is_executable.contains(&addr);
                if can_read || can_write || can_exec {
                    self.page_to_map.insert(addr, Rc::clone(map));
                }
                if can_write && !can_exec {
                    self.wnx_page_to_map.insert(addr, Rc::clone(map));
                }
                let Some(next) = addr.checked_add(PAGE_SIZE) else {
                    break;
                };
                addr = next;
            }
        }
    }

    fn find_range(&self, addr: u64) -> Rc<MappedRange> {
        self.find_range_aligned(align_down_to_page(addr))
    }

    fn find_range_aligned(&self, page_addr: u64) -> Rc<MappedRange> {
        let mut cache = self.range_cache.borrow_mut();
        if let Some(range) = cache.lookup(page_addr) {
            return range;
        }
        if let Some(range) = self.page_to_map.get(&page_addr) {
            cache.insert(page_addr, range);
            return Rc::clone(range);
        }
        Rc::clone(&self.invalid)
    }

    fn find_wnx_range(&self, addr: u64) -> Rc<MappedRange> {
        self.find_wnx_range_aligned(align_down_to_page(addr))
    }

    fn find_wnx_range_aligned(&self, page_addr: u64) -> Rc<MappedRange> {
        let mut cache = self.wnx_range_cache.borrow_mut();
        if let Some(range) = cache.lookup(page_addr) {
            return range;
        }
        if let Some(range) = self.wnx_page_to_map.get(&page_addr) {
            cache.insert(page_addr, range);
            return Rc::clone(range);
        }
        Rc::clone(&self.invalid)
    }
}

/// One line per valid range, in address order, in the same format as
/// [AddressSpace::log_maps].
impl fmt::Display for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for range in self.maps.iter().filter(|r| r.is_valid()) {
            writeln!(f, "{}", self.render_map_line(range))?;
        }
        Ok(())
    }
}

/// Rebuild `ranges` so that none of the survivors overlap `[base, limit)`.
///
/// Each existing range is classified by its interval relation to the target
/// and contributes zero, one or two surviving fragments. Input order is
/// preserved within each branch; the caller re-sorts afterward.
fn remove_range(ranges: &[Rc<MappedRange>], base: u64, limit: u64) -> Vec<Rc<MappedRange>> {
    let mut new_ranges = Vec::with_capacity(ranges.len() + 1);
    for map in ranges {
        let map_base = map.base_address();
        let map_limit = map.limit_address();
        if map_limit <= base || map_base >= limit {
            // No overlap.
            new_ranges.push(Rc::clone(map));
        } else if map_base >= base && map_limit <= limit {
            // Fully swallowed by the target: dropped.
        } else if map_base < base && map_limit > limit {
            // Target strictly inside: split into prefix and suffix.
            new_ranges.push(map.copy(map_base, base));
            new_ranges.push(map.copy(limit, map_limit));
        } else if map_base == base {
            // Target is a prefix of this range: keep the suffix.
            new_ranges.push(map.copy(limit, map_limit));
        } else {
            // Target is a suffix of this range: keep the prefix.
            new_ranges.push(map.copy(map_base, base));
        }
    }
    new_ranges
}

#[cfg(test)]
mod test {
    use super::*;

    fn space64() -> AddressSpace {
        AddressSpace::new(WordSize::Bits64, false)
    }

    /// The sorted range list must tile the whole address range, with no two
    /// valid ranges overlapping.
    fn check_partition(space: &AddressSpace) {
        assert!(!space.maps.is_empty());
        assert_eq!(space.maps[0].base_address(), 0);
        for pair in space.maps.windows(2) {
            assert_eq!(
                pair[0].limit_address(),
                pair[1].base_address(),
                "gap or overlap between [{:x}, {:x}) and [{:x}, {:x})",
                pair[0].base_address(),
                pair[0].limit_address(),
                pair[1].base_address(),
                pair[1].limit_address(),
            );
        }
        assert_eq!(
            space.maps.last().unwrap().limit_address(),
            space.addr_mask
        );
    }

    #[test]
    fn mapping_partition_invariant() {
        let mut space = space64();
        check_partition(&space);
        space.add_map(0x1000, 0x4000, "[heap]", 0);
        check_partition(&space);
        space.add_map(0x3000, 0x2000, "", 0);
        check_partition(&space);
        space.remove_map(0x2000, 0x1000);
        check_partition(&space);
        space.remove_map(0, 0x100000);
        check_partition(&space);
        assert!(!space.is_mapped(0x1000));
    }

    #[test]
    fn split_yields_prefix_and_suffix() {
        let mut space = space64();
        space.add_map(0x1000, 0x4000, "lib.so", 0x100);
        space.remove_map(0x2000, 0x1000);

        let valid: Vec<_> = space.maps.iter().filter(|m| m.is_valid()).collect();
        assert_eq!(valid.len(), 2);
        assert_eq!(
            (valid[0].base_address(), valid[0].limit_address()),
            (0x1000, 0x2000)
        );
        assert_eq!(
            (valid[1].base_address(), valid[1].limit_address()),
            (0x3000, 0x5000)
        );
        assert_eq!(valid[0].name(), "lib.so");
        assert_eq!(valid[0].offset(), 0x100);
        assert_eq!(valid[1].name(), "lib.so");
        assert_eq!(valid[1].offset(), 0x100 + 0x2000);

        assert!(space.is_mapped(0x1000));
        assert!(!space.is_mapped(0x2000));
        assert!(space.is_mapped(0x3000));
        assert!(space.is_mapped(0x4000));
        assert!(!space.is_mapped(0x5000));
    }

    #[test]
    fn overlapping_map_replaces() {
        let mut space = space64();
        space.add_map(0x1000, 0x2000, "a", 0);
        assert!(space.try_write_u8(0x1500, 0xaa));
        assert!(space.try_write_u8(0x2500, 0xbb));
        space.add_map(0x1000, 0x1000, "b", 0);
        check_partition(&space);
        // The overlapped page was replaced by fresh zeroed storage; the
        // surviving suffix keeps its contents.
        assert_eq!(space.try_read_u8(0x1500), Some(0));
        assert_eq!(space.try_read_u8(0x2500), Some(0xbb));
    }

    #[test]
    fn permissions_and_caches_agree() {
        let mut space = space64();
        space.add_map(0x1000, 0x3000, "", 0);
        // Default permissions are read+write, never execute.
        assert!(space.can_read(0x1000));
        assert!(space.can_write(0x1000));
        assert!(!space.can_execute(0x1000));

        space.set_permissions(0x2000, 0x1000, true, false, true);
        assert!(space.can_read(0x2345));
        assert!(!space.can_write(0x2345));
        assert!(space.can_execute(0x2345));

        // WNX map holds exactly the writable-not-executable pages.
        assert!(space.wnx_page_to_map.contains_key(&0x1000));
        assert!(!space.wnx_page_to_map.contains_key(&0x2000));
        assert!(space.wnx_page_to_map.contains_key(&0x3000));

        // No permissions at all: the page drops out of both lookup maps.
        space.set_permissions(0x3000, 0x1000, false, false, false);
        assert!(!space.is_mapped(0x3000));
        assert!(!space.page_to_map.contains_key(&0x3000));
    }

    #[test]
    fn scalar_round_trips() {
        let mut space = space64();
        space.add_map(0x1000, 0x2000, "", 0);
        assert!(space.try_write_u16(0x1000, 0x1234));
        assert_eq!(space.try_read_u16(0x1000), Some(0x1234));
        assert!(space.try_write_u32(0x1ffc, 0xdead_beef));
        assert_eq!(space.try_read_u32(0x1ffc), Some(0xdead_beef));
        assert!(space.try_write_u64(0x1100, u64::MAX - 3));
        assert_eq!(space.try_read_u64(0x1100), Some(u64::MAX - 3));
        assert!(space.try_write_f64(0x1200, 2.5));
        assert_eq!(space.try_read_f64(0x1200), Some(2.5));
        assert!(space.try_write_f32(0x1204, -0.5));
        assert_eq!(space.try_read_f32(0x1204), Some(-0.5));
    }

    #[test]
    fn scalar_across_page_boundary() {
        let mut space = space64();
        space.add_map(0x1000, 0x2000, "", 0);
        space.add_map(0x2000, 0x1000, "", 0);
        // 0x1ffe..0x2002 spans two independently-created ranges; only the
        // byte-wise fallback path can satisfy it.
        assert!(space.try_write_u32(0x1ffe, 0xcafe_f00d));
        assert_eq!(space.try_read_u32(0x1ffe), Some(0xcafe_f00d));
        assert_eq!(space.try_read_u8(0x1ffe), Some(0x0d));
        assert_eq!(space.try_read_u8(0x2001), Some(0xca));
    }

    #[test]
    fn reads_never_cross_unmapped_gaps() {
        let mut space = space64();
        space.add_map(0x1000, 0x1000, "", 0);
        space.add_map(0x3000, 0x1000, "", 0);
        let mut buf = [0u8; 4];
        // [0x1ffe, 0x2002) crosses into the unmapped page at 0x2000.
        assert!(!space.try_read(0x1ffe, &mut buf));
        assert_eq!(space.try_read_u32(0x1ffe), None);
        // Fully inside a mapped page still works.
        assert!(space.try_read(0x1ff0, &mut buf));
    }

    #[test]
    fn bulk_write_partial_failure_is_visible() {
        let mut space = space64();
        space.add_map(0x1000, 0x1000, "", 0);
        // Second page is unmapped: the call fails, but the first four bytes
        // were written before the failing page was reached (best-effort
        // semantics, documented on try_write).
        assert!(!space.try_write(0x1ffc, &[1, 2, 3, 4, 5, 6, 7, 8]));
        assert_eq!(space.try_read_u32(0x1ffc), Some(u32::from_le_bytes([1, 2, 3, 4])));
    }

    #[test]
    fn find_hole_prefers_highest_gap() {
        let mut space = space64();
        space.add_map(0x10000, 0x1000, "", 0);
        space.add_map(0x20000, 0x1000, "", 0);
        // Holes below 0x10000, in (0x11000..0x20000), and above 0x21000.
        // Last-fit from the top within [0x8000, 0x20000).
        let hole = space.find_hole(0x8000, 0x20000, 0x2000).unwrap();
        assert_eq!(hole, 0x20000 - 0x2000);
        // Constrained to below the first map.
        let hole = space.find_hole(0x8000, 0x10000, 0x2000).unwrap();
        assert_eq!(hole, 0x10000 - 0x2000);
        // Hole bigger than the window.
        assert_eq!(space.find_hole(0x8000, 0x9000, 0x2000), None);
        // Zero size never succeeds.
        assert_eq!(space.find_hole(0x8000, 0x20000, 0), None);
    }

    #[test]
    fn find_hole_fits_between_adjacent_maps() {
        let mut space = space64();
        space.add_map(0x10000, 0x1000, "", 0);
        space.add_map(0x13000, 0x1000, "", 0);
        let hole = space.find_hole(0x10000, 0x14000, 0x1000).unwrap();
        assert_eq!(hole, 0x12000);
        assert_eq!(space.find_hole(0x10000, 0x14000, 0x3000), None);
    }

    #[test]
    fn top_page_is_mappable_and_accessible() {
        let mut space = space64();
        let base = align_down_to_page(u64::MAX);
        space.add_map(base, PAGE_SIZE, "", 0);
        assert!(space.is_mapped(base));

        assert!(space.try_write_u8(u64::MAX - 1, 0xab));
        assert_eq!(space.try_read_u8(u64::MAX - 1), Some(0xab));

        // A bulk access ending at the very top of the address space.
        let mut buf = [0u8; 4];
        assert!(space.try_read(u64::MAX - 4, &mut buf));
        assert_eq!(buf[3], 0xab);
        // One that would run past the top fails without wrapping around.
        assert!(!space.try_read(u64::MAX - 2, &mut buf));

        space.set_permissions(base, PAGE_SIZE, true, false, true);
        assert!(space.can_execute(u64::MAX - 1));
        assert_eq!(space.try_read_executable(u64::MAX - 1), Some(0xab));
    }

    #[test]
    fn narrow_address_space_rejects_wide_addresses() {
        let mut space = AddressSpace::new(WordSize::Bits32, false);
        assert!(space.create_map(0x1_0000_0000, 0x1000, "", 0).is_none());
        assert!(!space.is_mapped(0x1_0000_0000));
        // In-mask mapping works, and accesses mask their addresses.
        space.add_map(0x1000, 0x1000, "", 0);
        assert!(space.try_write_u8(0x1_0000_1000, 0x5a));
        assert_eq!(space.try_read_u8(0x1000), Some(0x5a));
    }

    #[test]
    fn dead_space_refuses_everything() {
        let mut space = space64();
        space.add_map(0x1000, 0x1000, "", 0);
        space.kill();
        assert!(space.is_dead());
        assert!(space.create_map(0x1000, 0x1000, "", 0).is_none());
        assert!(!space.is_mapped(0x1000));
        assert_eq!(space.try_read_u8(0x1000), None);
        assert!(!space.try_write_u8(0x1000, 1));
    }

    #[test]
    fn fork_is_independent() {
        let mut parent = space64();
        parent.add_map(0x1000, 0x1000, "[stack]", 0);
        parent.mark_as_trace_head(0x1000);
        assert!(parent.try_write_u8(0x1100, 0x42));

        let mut child = parent.fork();
        assert_eq!(child.try_read_u8(0x1100), Some(0x42));
        assert!(child.is_marked_trace_head(0x1000));

        assert!(child.try_write_u8(0x1100, 0x43));
        assert_eq!(parent.try_read_u8(0x1100), Some(0x42));

        child.remove_map(0x1000, 0x1000);
        assert!(parent.is_mapped(0x1000));
        assert!(!child.is_mapped(0x1000));
    }

    #[test]
    fn self_modification_clears_trace_heads() {
        let mut space = AddressSpace::new(WordSize::Bits64, true);
        space.add_map(0x1000, 0x1000, "", 0);
        space.set_permissions(0x1000, 0x1000, true, true, true);
        let v1 = space.compute_code_version(0x1000);
        space.mark_as_trace_head(0x1000);

        assert!(space.try_write_u8(0x1010, 0x90));
        assert!(!space.is_marked_trace_head(0x1000));
        let v2 = space.compute_code_version(0x1000);
        assert_ne!(v1, v2);
    }

    #[test]
    fn versioning_disabled_keeps_trace_heads() {
        let mut space = space64();
        space.add_map(0x1000, 0x1000, "", 0);
        space.set_permissions(0x1000, 0x1000, true, true, true);
        space.mark_as_trace_head(0x1000);
        assert!(space.try_write_u8(0x1010, 0x90));
        assert!(space.is_marked_trace_head(0x1000));
        assert_eq!(space.compute_code_version(0x1000), 0);
    }

    #[test]
    fn executable_reads_respect_permissions() {
        let mut space = space64();
        space.add_map(0x1000, 0x2000, "", 0);
        assert!(space.try_write_u8(0x1000, 0xc3));
        space.set_permissions(0x1000, 0x1000, true, false, true);
        assert_eq!(space.try_read_executable(0x1000), Some(0xc3));
        // Second page is readable but not executable.
        assert_eq!(space.try_read_executable(0x2000), None);
        // Unmapped.
        assert_eq!(space.try_read_executable(0x5000), None);
    }

    #[test]
    fn repeated_lookups_hit_the_caches() {
        let mut space = space64();
        space.add_map(0x1000, 0x4000, "", 0);
        // Warm the caches, then mutate through them repeatedly.
        for i in 0..64u64 {
            assert!(space.try_write_u8(0x1000 + i, i as u8));
        }
        for i in 0..64u64 {
            assert_eq!(space.try_read_u8(0x1000 + i), Some(i as u8));
        }
        // A structural change must drop cached ranges: the old storage is
        // gone and reads see the replacement mapping.
        space.add_map(0x1000, 0x1000, "", 0);
        assert_eq!(space.try_read_u8(0x1010), Some(0));
    }

    #[test]
    fn maps_dump_lists_valid_ranges() {
        let mut space = AddressSpace::new(WordSize::Bits32, false);
        space.add_map(0x1000, 0x1000, "lib.so", 0x40);
        space.add_map(0x8000, 0x1000, "", 0);
        let dump = space.to_string();
        let lines: Vec<_> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("  [00001000, 00002000)"));
        assert!(lines[0].ends_with("from lib.so (offset 40)"));
        assert!(lines[1].starts_with("  [00008000, 00009000)"));
    }

    #[test]
    fn pointer_projection() {
        let mut space = space64();
        space.add_map(0x1000, 0x1000, "", 0);
        assert!(space.try_write_u8(0x1800, 0x77));
        let ptr = space.to_read_only_ptr(0x1800).unwrap();
        assert_eq!(unsafe { *ptr }, 0x77);
        let ptr = space.to_read_write_ptr(0x1801).unwrap();
        unsafe { *ptr = 0x88 };
        assert_eq!(space.try_read_u8(0x1801), Some(0x88));
        assert!(space.to_read_only_ptr(0x5000).is_none());
    }
}
