//! Work-list-driven recursive disassembly: discovering the traces a code
//! generator will translate.
//!
//! Starting from an entry program counter, the decoder walks an emulated
//! [AddressSpace] byte-by-byte through an external [Arch] decoder and
//! groups the reachable instructions into *traces*: single-entry,
//! multi-exit regions explored until control flow leaves via an indirect
//! transfer, a return, a call, or an undecodable byte. Call targets seed
//! further traces; trace heads are memoized in the address space so each
//! is discovered at most once per address-space generation.

#![allow(clippy::new_without_default)]

mod arch;
mod trace;

pub use arch::{Arch, DecodeError, InstCategory, Instruction};
pub use trace::{DecodedTrace, TraceId};

use std::collections::BTreeSet;

use guestmem::{
    log::{log_event, log_warning},
    AddressSpace,
};

/// Pending addresses, processed lowest-first so output is deterministic.
type WorkList = BTreeSet<u64>;

/// Recursively decode the traces reachable from `entry_pc`.
///
/// Addresses already marked as trace heads in `space` are skipped, making
/// repeated discovery idempotent until the markers are cleared (e.g. by a
/// write to executable memory with code versioning enabled). A decode
/// failure records an invalid placeholder instruction and stops expansion
/// along that path only; it never aborts the overall decode.
pub fn decode_traces(arch: &dyn Arch, space: &mut AddressSpace, entry_pc: u64) -> Vec<DecodedTrace> {
    let mut traces = Vec::new();
    let mut trace_list = WorkList::new();
    let mut work_list = WorkList::new();

    log_event(&format!(
        "recursively decoding machine code, beginning at {entry_pc:x}"
    ));

    trace_list.insert(entry_pc);

    while let Some(trace_pc) = trace_list.pop_first() {
        if space.is_marked_trace_head(trace_pc) {
            continue;
        }
        space.mark_as_trace_head(trace_pc);

        debug_assert!(work_list.is_empty());
        work_list.insert(trace_pc);

        let mut trace = DecodedTrace::new(trace_pc, space.compute_code_version(trace_pc));

        while let Some(pc) = work_list.pop_first() {
            if trace.insts.contains_key(&pc) {
                continue;
            }

            let bytes = read_inst_bytes(arch, space, pc);
            match arch.decode(pc, &bytes) {
                Ok(inst) => {
                    add_successors_to_work_list(&inst, &mut work_list);
                    add_successors_to_trace_list(&inst, &mut trace_list);
                    trace.insts.insert(pc, inst);
                }
                Err(e) => {
                    log_warning(&format!("cannot decode instruction at {pc:x}: {e}"));
                    trace.insts.insert(pc, Instruction::invalid(pc, bytes));
                }
            }
        }

        trace.finalize_id();

        log_event(&format!(
            "decoded {} instructions starting from {:x}",
            trace.insts.len(),
            trace.pc
        ));

        debug_assert!(
            trace.contains_entry(),
            "trace at {:x} does not contain an instruction at its entry address",
            trace.pc
        );
        if !trace.contains_entry() {
            log_warning(&format!(
                "trace at {:x} does not contain an instruction at its entry address",
                trace.pc
            ));
        }

        traces.push(trace);
    }

    traces
}

/// Fetch up to [Arch::max_inst_len] bytes at `pc`, stopping early at the
/// first byte that isn't both mapped and executable.
fn read_inst_bytes(arch: &dyn Arch, space: &AddressSpace, pc: u64) -> Vec<u8> {
    let max_len = arch.max_inst_len();
    let mut bytes = Vec::with_capacity(max_len);
    for i in 0..max_len as u64 {
        // Wraps at the top of the address space; the read fails there.
        let byte_pc = pc.wrapping_add(i);
        match space.try_read_executable(byte_pc) {
            Some(byte) => bytes.push(byte),
            None => {
                log_warning(&format!(
                    "stopping decode at non-executable byte {byte_pc:x}"
                ));
                break;
            }
        }
    }
    bytes
}

/// Enqueue the successor addresses that belong to the *current* trace.
///
/// Calls do not extend the trace past the call (the callee is a separate
/// trace) but do continue the caller's fall-through; indirect transfers,
/// returns and hypercalls end the path.
fn add_successors_to_work_list(inst: &Instruction, work_list: &mut WorkList) {
    match inst.category {
        InstCategory::Invalid
        | InstCategory::Error
        | InstCategory::IndirectJump
        | InstCategory::FunctionReturn
        | InstCategory::AsyncHyperCall => {}

        InstCategory::IndirectFunctionCall | InstCategory::DirectFunctionCall => {
            work_list.insert(inst.branch_not_taken_pc);
        }

        InstCategory::Normal | InstCategory::NoOp => {
            work_list.insert(inst.next_pc);
        }

        InstCategory::ConditionalAsyncHyperCall => {
            work_list.insert(inst.branch_not_taken_pc);
        }

        InstCategory::DirectJump => {
            work_list.insert(inst.branch_taken_pc);
        }

        InstCategory::ConditionalBranch => {
            work_list.insert(inst.branch_taken_pc);
            work_list.insert(inst.next_pc);
        }
    }
}

/// Enqueue control-flow targets that potentially represent future traces:
/// only direct call targets, and only when the target isn't simply the
/// fall-through.
fn add_successors_to_trace_list(inst: &Instruction, trace_list: &mut WorkList) {
    if inst.category == InstCategory::DirectFunctionCall
        && inst.branch_taken_pc != inst.branch_not_taken_pc
    {
        trace_list.insert(inst.branch_taken_pc);
    }
}
