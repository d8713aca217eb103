//! Mapped ranges: the owned, contiguous spans an address space is built from.

use std::{
    cell::{Cell, RefCell},
    mem,
    rc::Rc,
};
use xxhash_rust::xxh3::xxh3_64;

use crate::align_down_to_page;

/// A value distinguishing successive contents of a range.
///
/// When code versioning is enabled, the version of a range is invalidated
/// whenever a write lands on one of its currently-executable pages, so that
/// cached translations of the old bytes can be detected as stale.
pub type CodeVersion = u64;

/// A contiguous, page-aligned span of backing storage with uniform
/// provenance.
///
/// A range's identity (base, limit, name, file offset) is independent of the
/// permissions of its pages; permissions live in the owning [AddressSpace]
/// (crate::AddressSpace). Ranges are handed around as `Rc` handles: the range
/// list and both page lookup caches of an address space reference the same
/// allocation.
///
/// The *invalid* range is a sentinel covering a caller-supplied span, used as
/// the lookup result for unmapped addresses. All accesses against it fail.
pub struct MappedRange {
    base: u64,
    limit: u64,
    /// Origin label: the backing file, a pseudo-name like `[heap]`, or empty.
    name: Rc<str>,
    offset: u64,
    /// `None` for the invalid sentinel.
    backing: Option<Backing>,
    /// Lazily computed content hash; `None` after invalidation.
    code_version: Cell<Option<CodeVersion>>,
}

/// Backing storage, shared between the fragments of a split mapping.
///
/// When a mapping operation bisects an existing range, the surviving prefix
/// and suffix fragments keep a handle to the parent's buffer rather than
/// copying it; `buf_base` records the guest address of the buffer's first
/// byte so fragments can index into the middle of it.
struct Backing {
    buf: Rc<RefCell<Box<[u8]>>>,
    buf_base: u64,
}

impl MappedRange {
    /// Create a valid range covering `[base, limit)` with zeroed backing
    /// storage.
    pub fn create(base: u64, limit: u64, name: &str, offset: u64) -> Rc<MappedRange> {
        debug_assert!(base <= limit);
        let size = usize::try_from(limit - base).unwrap();
        Rc::new(MappedRange {
            base,
            limit,
            name: Rc::from(name),
            offset,
            backing: Some(Backing {
                buf: Rc::new(RefCell::new(vec![0u8; size].into_boxed_slice())),
                buf_base: base,
            }),
            code_version: Cell::new(None),
        })
    }

    /// Create the invalid sentinel covering `[base, limit)`.
    pub fn create_invalid(base: u64, limit: u64) -> Rc<MappedRange> {
        Rc::new(MappedRange {
            base,
            limit,
            name: Rc::from(""),
            offset: 0,
            backing: None,
            code_version: Cell::new(None),
        })
    }

    pub fn is_valid(&self) -> bool {
        self.backing.is_some()
    }

    pub fn base_address(&self) -> u64 {
        self.base
    }

    pub fn limit_address(&self) -> u64 {
        self.limit
    }

    pub fn size(&self) -> u64 {
        self.limit - self.base
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Returns `true` if `addr` falls within `[base, limit)`.
    pub fn contains(&self, addr: u64) -> bool {
        self.base <= addr && addr < self.limit
    }

    /// Read the byte at guest address `addr`, or `None` if `addr` is outside
    /// this range or the range is invalid.
    pub fn read(&self, addr: u64) -> Option<u8> {
        let backing = self.backing.as_ref()?;
        if !self.contains(addr) {
            return None;
        }
        let i = (addr - backing.buf_base) as usize;
        Some(backing.buf.borrow()[i])
    }

    /// Write the byte at guest address `addr`. Returns `false` if `addr` is
    /// outside this range or the range is invalid.
    pub fn write(&self, addr: u64, byte: u8) -> bool {
        let Some(backing) = self.backing.as_ref() else {
            return false;
        };
        if !self.contains(addr) {
            return false;
        }
        let i = (addr - backing.buf_base) as usize;
        backing.buf.borrow_mut()[i] = byte;
        true
    }

    /// Single-page scalar read fast path: succeeds only when the whole value
    /// lies inside this range and does not straddle a page boundary.
    pub(crate) fn read_scalar<T: Scalar>(&self, addr: u64) -> Option<T> {
        let backing = self.backing.as_ref()?;
        let end = addr.checked_add(T::LEN as u64 - 1)?;
        if addr < self.base || end >= self.limit {
            return None;
        }
        if align_down_to_page(addr) != align_down_to_page(end) {
            return None;
        }
        let buf = backing.buf.borrow();
        let i = (addr - backing.buf_base) as usize;
        Some(T::from_le(&buf[i..i + T::LEN]))
    }

    /// Single-page scalar write fast path; see [MappedRange::read_scalar].
    pub(crate) fn write_scalar<T: Scalar>(&self, addr: u64, val: T) -> bool {
        let Some(backing) = self.backing.as_ref() else {
            return false;
        };
        let Some(end) = addr.checked_add(T::LEN as u64 - 1) else {
            return false;
        };
        if addr < self.base || end >= self.limit {
            return false;
        }
        if align_down_to_page(addr) != align_down_to_page(end) {
            return false;
        }
        let mut buf = backing.buf.borrow_mut();
        let i = (addr - backing.buf_base) as usize;
        val.write_le(&mut buf[i..i + T::LEN]);
        true
    }

    /// The host address of the byte backing guest address `addr`, for reading.
    ///
    /// The pointer is valid until the next operation that restructures the
    /// owning address space (mapping, unmapping, killing).
    pub fn to_read_only_ptr(&self, addr: u64) -> Option<*const u8> {
        let backing = self.backing.as_ref()?;
        if !self.contains(addr) {
            return None;
        }
        let i = (addr - backing.buf_base) as usize;
        Some(unsafe { backing.buf.borrow().as_ptr().add(i) })
    }

    /// The host address of the byte backing guest address `addr`, for writing.
    ///
    /// Same validity contract as [MappedRange::to_read_only_ptr]. Writing
    /// through the pointer bypasses self-modifying-code detection.
    pub fn to_read_write_ptr(&self, addr: u64) -> Option<*mut u8> {
        let backing = self.backing.as_ref()?;
        if !self.contains(addr) {
            return None;
        }
        let i = (addr - backing.buf_base) as usize;
        Some(unsafe { backing.buf.borrow_mut().as_mut_ptr().add(i) })
    }

    /// The code version of this range: a hash of its current contents,
    /// cached until [MappedRange::invalidate_code_version] is called.
    ///
    /// The invalid sentinel always reports version 0.
    pub fn compute_code_version(&self) -> CodeVersion {
        let Some(backing) = self.backing.as_ref() else {
            return 0;
        };
        if let Some(version) = self.code_version.get() {
            return version;
        }
        let buf = backing.buf.borrow();
        let start = (self.base - backing.buf_base) as usize;
        let end = (self.limit - backing.buf_base) as usize;
        let version = xxh3_64(&buf[start..end]);
        self.code_version.set(Some(version));
        version
    }

    /// Drop the cached code version so the next query rehashes the contents.
    pub fn invalidate_code_version(&self) {
        self.code_version.set(None);
    }

    /// A view over the sub-interval `[new_base, new_limit)` of this range.
    ///
    /// Used when a mapping operation splits an existing range: the surviving
    /// fragments share the parent's backing storage (no new allocation) and
    /// keep its name, with the file offset advanced to match the covered
    /// sub-span. Copying the invalid sentinel yields a smaller sentinel.
    pub fn copy(&self, new_base: u64, new_limit: u64) -> Rc<MappedRange> {
        let Some(backing) = self.backing.as_ref() else {
            return MappedRange::create_invalid(new_base, new_limit);
        };
        debug_assert!(self.base <= new_base && new_limit <= self.limit);
        Rc::new(MappedRange {
            base: new_base,
            limit: new_limit,
            name: Rc::clone(&self.name),
            offset: self.offset + (new_base - self.base),
            backing: Some(Backing {
                buf: Rc::clone(&backing.buf),
                buf_base: backing.buf_base,
            }),
            code_version: Cell::new(None),
        })
    }

    /// An independent deep copy of this range: same contents, separate
    /// backing storage. This is the building block of copy-on-write address
    /// space forking.
    pub fn clone_storage(&self) -> Rc<MappedRange> {
        let Some(backing) = self.backing.as_ref() else {
            return MappedRange::create_invalid(self.base, self.limit);
        };
        let buf = backing.buf.borrow();
        let start = (self.base - backing.buf_base) as usize;
        let end = (self.limit - backing.buf_base) as usize;
        Rc::new(MappedRange {
            base: self.base,
            limit: self.limit,
            name: Rc::clone(&self.name),
            offset: self.offset,
            backing: Some(Backing {
                buf: Rc::new(RefCell::new(buf[start..end].to_vec().into_boxed_slice())),
                buf_base: self.base,
            }),
            code_version: Cell::new(self.code_version.get()),
        })
    }
}

/// Fixed-width values with a defined little-endian guest representation.
pub(crate) trait Scalar: Copy {
    const LEN: usize;
    fn from_le(bytes: &[u8]) -> Self;
    fn write_le(self, out: &mut [u8]);
}

macro_rules! impl_scalar {
    ($ty: ident) => {
        impl Scalar for $ty {
            const LEN: usize = mem::size_of::<$ty>();

            fn from_le(bytes: &[u8]) -> Self {
                let mut arr = [0u8; mem::size_of::<$ty>()];
                arr.copy_from_slice(bytes);
                $ty::from_le_bytes(arr)
            }

            fn write_le(self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_le_bytes());
            }
        }
    };
}

impl_scalar!(u16);
impl_scalar!(u32);
impl_scalar!(u64);
impl_scalar!(f32);
impl_scalar!(f64);
