//! The architecture-decoder interface.
//!
//! The instruction set itself is an external collaborator: trace discovery
//! only needs to fetch bytes, ask the architecture to decode them, and
//! classify the result by control-flow category.

use thiserror::Error;

/// The control-flow category of a decoded instruction.
///
/// This is a closed set: successor expansion in the decoder matches on it
/// exhaustively, so a new category must extend that table deliberately
/// rather than falling through silently.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InstCategory {
    /// The bytes did not decode to an instruction.
    Invalid,
    /// Decoded, but executing it is an architectural error.
    Error,
    Normal,
    NoOp,
    DirectJump,
    IndirectJump,
    DirectFunctionCall,
    IndirectFunctionCall,
    ConditionalBranch,
    FunctionReturn,
    AsyncHyperCall,
    ConditionalAsyncHyperCall,
}

/// A decoded instruction, as reported by an [Arch] implementation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Instruction {
    /// The program counter this instruction was decoded at.
    pub pc: u64,
    /// The raw instruction bytes.
    pub bytes: Vec<u8>,
    pub category: InstCategory,
    /// The fall-through address (`pc` + instruction length).
    pub next_pc: u64,
    /// The target address when a direct branch/call/jump is taken.
    pub branch_taken_pc: u64,
    /// The address executed when a conditional transfer is not taken.
    pub branch_not_taken_pc: u64,
}

impl Instruction {
    /// A placeholder recorded when decoding fails, so downstream consumers
    /// can see exactly where decoding stopped.
    pub fn invalid(pc: u64, bytes: Vec<u8>) -> Instruction {
        Instruction {
            pc,
            bytes,
            category: InstCategory::Invalid,
            next_pc: pc,
            branch_taken_pc: pc,
            branch_not_taken_pc: pc,
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("no instruction encoding matches the {0} bytes at {1:x}")]
    Undecodable(usize, u64),
    #[error("{0}")]
    Other(String),
}

/// An instruction set architecture, as seen by the trace decoder.
pub trait Arch {
    /// The length in bytes of the longest instruction encoding. Trace
    /// discovery fetches this many bytes (or as many executable bytes as
    /// are available) before each decode.
    fn max_inst_len(&self) -> usize;

    /// Decode the instruction at `pc` from `bytes` (at most
    /// [Arch::max_inst_len] of them; fewer when a page boundary cut the
    /// fetch short).
    fn decode(&self, pc: u64, bytes: &[u8]) -> Result<Instruction, DecodeError>;
}
