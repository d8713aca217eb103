//! Decoded traces and their identity hashes.

use std::collections::BTreeMap;
use xxhash_rust::xxh3::Xxh3;

use guestmem::CodeVersion;

use crate::arch::Instruction;

/// Identifies one version of one trace: the entry address paired with a
/// fingerprint of the trace's instruction bytes. Two traces at the same
/// address with different ids indicate the code was modified in between.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub struct TraceId {
    /// The entry program counter of the trace.
    pub pc: u64,
    /// A hash of the concatenation of all instruction bytes, in address
    /// order, seeded with a discriminator derived from the trace's shape.
    pub code_hash: u64,
}

/// A single-entry group of decoded instructions, explored until control
/// flow leaves via an indirect transfer, return, call target or
/// undecodable byte.
pub struct DecodedTrace {
    /// The entry program counter.
    pub pc: u64,
    /// The code version of the entry's range at decode time.
    pub code_version: CodeVersion,
    pub id: TraceId,
    /// Every decoded instruction, keyed and iterated by address. Decode
    /// failures appear as [InstCategory::Invalid](crate::InstCategory)
    /// placeholders.
    pub insts: BTreeMap<u64, Instruction>,
}

impl DecodedTrace {
    pub(crate) fn new(pc: u64, code_version: CodeVersion) -> DecodedTrace {
        DecodedTrace {
            pc,
            code_version,
            id: TraceId { pc, code_hash: 0 },
            insts: BTreeMap::new(),
        }
    }

    /// A finished trace must contain an instruction at its own entry
    /// address; a violation indicates a decoder bug, not bad input.
    pub fn contains_entry(&self) -> bool {
        self.insts.contains_key(&self.pc)
    }

    /// Compute this trace's [TraceId] from its instruction bytes.
    ///
    /// The hash seed folds in the minimum address, maximum address and
    /// instruction count, cheaply separating differently-shaped traces
    /// whose byte hashes would otherwise collide.
    pub(crate) fn finalize_id(&mut self) {
        let (min_pc, max_pc) = match (self.insts.first_key_value(), self.insts.last_key_value()) {
            (Some((min, _)), Some((max, _))) => (*min, *max),
            _ => (1, 1),
        };
        let seed = min_pc
            .wrapping_mul(max_pc)
            .wrapping_mul(self.insts.len() as u64);
        let mut hasher = Xxh3::with_seed(seed);
        for inst in self.insts.values() {
            hasher.update(&inst.bytes);
        }
        self.id = TraceId {
            pc: self.pc,
            code_hash: hasher.digest(),
        };
    }
}
