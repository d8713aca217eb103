//! Snapshot page descriptions: the input surface an external snapshot
//! parser uses to populate an [AddressSpace].
//!
//! The snapshot file format itself is out of scope; this module only
//! defines the per-page-range description handed over after parsing, the
//! provenance-name derivation, and the loader seam through which
//! file-backed bytes are pulled in.

use std::{io, path::PathBuf};
use thiserror::Error;

use crate::{log::log_event, space::AddressSpace};

/// What a snapshotted page range was backing in the original process.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageKind {
    Stack,
    Heap,
    VVar,
    VDso,
    VSysCall,
    FileBacked,
    Anonymous,
    /// Anonymous and known to be all zeroes: no bytes are loaded.
    AnonymousZero,
}

/// One page range of a snapshot.
#[derive(Clone, Debug)]
pub struct PageRange {
    pub kind: PageKind,
    pub base: u64,
    pub limit: u64,
    pub can_read: bool,
    pub can_write: bool,
    pub can_exec: bool,
    /// Present for file-backed ranges.
    pub file_path: Option<PathBuf>,
    pub file_offset: Option<u64>,
}

impl PageRange {
    /// The provenance name recorded on the mapped range: a pseudo-name for
    /// kernel-provided ranges, the backing file path for file-backed
    /// ranges, empty for anonymous ones.
    pub fn name(&self) -> Result<String, SnapshotError> {
        match self.kind {
            PageKind::Stack => Ok("[stack]".to_owned()),
            PageKind::Heap => Ok("[heap]".to_owned()),
            PageKind::VVar => Ok("[vvar]".to_owned()),
            PageKind::VDso => Ok("[vdso]".to_owned()),
            PageKind::VSysCall => Ok("[vsyscall]".to_owned()),
            PageKind::FileBacked => match &self.file_path {
                Some(path) => Ok(path.to_string_lossy().into_owned()),
                None => Err(SnapshotError::MissingFilePath {
                    base: self.base,
                    limit: self.limit,
                }),
            },
            PageKind::Anonymous | PageKind::AnonymousZero => Ok(String::new()),
        }
    }
}

/// The external byte source for snapshot pages that aren't known-zero.
pub trait PageLoader {
    /// Fill `dst` (sized to the page range) with the range's snapshotted
    /// contents.
    fn load(&mut self, page: &PageRange, dst: &mut [u8]) -> Result<(), SnapshotError>;
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("file-backed page range [{base:x}, {limit:x}) has no file path")]
    MissingFilePath { base: u64, limit: u64 },
    #[error("page range [{base:x}, {limit:x}) was rejected by the address space")]
    Rejected { base: u64, limit: u64 },
    #[error("failed to load page range contents: {0}")]
    Io(#[from] io::Error),
}

impl AddressSpace {
    /// Map a snapshot page range into this space: create the mapping with
    /// its provenance name, pull in the backing bytes through `loader`
    /// (skipped for [PageKind::AnonymousZero]), then apply the snapshotted
    /// permissions. A heap range additionally records the initial program
    /// break.
    pub fn add_snapshot_map(
        &mut self,
        page: &PageRange,
        loader: &mut dyn PageLoader,
    ) -> Result<(), SnapshotError> {
        let name = page.name()?;
        let size = page.limit - page.base;
        let offset = page.file_offset.unwrap_or(0);

        let Some(map) = self.create_map(page.base, size, &name, offset) else {
            return Err(SnapshotError::Rejected {
                base: page.base,
                limit: page.limit,
            });
        };

        if page.kind == PageKind::Heap {
            self.initial_program_break = map.limit_address();
            log_event(&format!(
                "initial program break at {:x}",
                self.initial_program_break
            ));
        }

        if page.kind != PageKind::AnonymousZero {
            let mut bytes = vec![0u8; usize::try_from(size).unwrap()];
            loader.load(page, &mut bytes)?;
            // Freshly created maps are read+write and cannot trip the
            // self-modification path. The write only comes up short when
            // the mapping was clamped at the top of the address mask.
            let complete = self.try_write(page.base, &bytes);
            debug_assert!(
                complete,
                "snapshot bytes for [{:x}, {:x}) were not fully written",
                page.base, page.limit
            );
        }

        self.set_permissions(page.base, size, page.can_read, page.can_write, page.can_exec);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::WordSize;

    /// Fills every page with its index, starting from 1.
    struct PatternLoader;

    impl PageLoader for PatternLoader {
        fn load(&mut self, _page: &PageRange, dst: &mut [u8]) -> Result<(), SnapshotError> {
            for (i, byte) in dst.iter_mut().enumerate() {
                *byte = (i % 251) as u8;
            }
            Ok(())
        }
    }

    fn page(kind: PageKind, base: u64, limit: u64) -> PageRange {
        PageRange {
            kind,
            base,
            limit,
            can_read: true,
            can_write: false,
            can_exec: false,
            file_path: None,
            file_offset: None,
        }
    }

    #[test]
    fn kind_names() {
        assert_eq!(page(PageKind::Stack, 0, 0x1000).name().unwrap(), "[stack]");
        assert_eq!(page(PageKind::Heap, 0, 0x1000).name().unwrap(), "[heap]");
        assert_eq!(page(PageKind::VDso, 0, 0x1000).name().unwrap(), "[vdso]");
        assert_eq!(page(PageKind::Anonymous, 0, 0x1000).name().unwrap(), "");
        let mut file = page(PageKind::FileBacked, 0, 0x1000);
        assert!(matches!(
            file.name(),
            Err(SnapshotError::MissingFilePath { .. })
        ));
        file.file_path = Some(PathBuf::from("/lib/libc.so.6"));
        assert_eq!(file.name().unwrap(), "/lib/libc.so.6");
    }

    #[test]
    fn snapshot_map_loads_bytes_and_permissions() {
        let mut space = AddressSpace::new(WordSize::Bits64, false);
        let mut desc = page(PageKind::FileBacked, 0x400000, 0x402000);
        desc.file_path = Some(PathBuf::from("/bin/true"));
        desc.file_offset = Some(0x1000);
        desc.can_exec = true;
        space.add_snapshot_map(&desc, &mut PatternLoader).unwrap();

        assert_eq!(space.try_read_u8(0x400000), Some(0));
        assert_eq!(space.try_read_u8(0x400005), Some(5));
        assert!(space.can_read(0x400000));
        assert!(!space.can_write(0x400000));
        assert!(space.can_execute(0x400000));
        assert_eq!(space.try_read_executable(0x401000), Some((0x1000 % 251) as u8));
    }

    #[test]
    fn heap_records_program_break() {
        let mut space = AddressSpace::new(WordSize::Bits64, false);
        let mut desc = page(PageKind::Heap, 0x600000, 0x603000);
        desc.can_write = true;
        space.add_snapshot_map(&desc, &mut PatternLoader).unwrap();
        assert_eq!(space.initial_program_break(), 0x603000);
    }

    #[test]
    fn anonymous_zero_skips_the_loader() {
        struct FailingLoader;
        impl PageLoader for FailingLoader {
            fn load(&mut self, _: &PageRange, _: &mut [u8]) -> Result<(), SnapshotError> {
                panic!("anonymous-zero ranges must not be loaded");
            }
        }
        let mut space = AddressSpace::new(WordSize::Bits64, false);
        let desc = page(PageKind::AnonymousZero, 0x700000, 0x701000);
        space.add_snapshot_map(&desc, &mut FailingLoader).unwrap();
        assert_eq!(space.try_read_u8(0x700800), Some(0));
    }

    #[test]
    #[should_panic(expected = "not fully written")]
    fn clamped_snapshot_range_fails_loudly() {
        // The range runs past the 32-bit address mask, so the created map
        // is one byte short of the described limit and the byte load
        // cannot complete.
        let mut space = AddressSpace::new(WordSize::Bits32, false);
        let desc = page(PageKind::Anonymous, 0xffff_f000, 0x1_0000_0000);
        let _ = space.add_snapshot_map(&desc, &mut PatternLoader);
    }

    #[test]
    fn dead_space_rejects_snapshot_maps() {
        let mut space = AddressSpace::new(WordSize::Bits64, false);
        space.kill();
        let desc = page(PageKind::Anonymous, 0x1000, 0x2000);
        assert!(matches!(
            space.add_snapshot_map(&desc, &mut PatternLoader),
            Err(SnapshotError::Rejected { .. })
        ));
    }
}
