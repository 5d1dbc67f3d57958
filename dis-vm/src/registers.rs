//! Per-thread registers (§3 "Registers", §4.D operand decoding).

use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use dis_types::{Pc, INVALID_PC};

use crate::frame::Stack;
use crate::heap::Pointer;
use crate::module::ModRef;
use crate::rendezvous::RequestMutex;
use crate::tool::ToolController;

/// Exactly one of these at a time (§3 "Thread state").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Queued, waiting for a worker to pick it up.
    Ready,
    /// Currently executing on a worker.
    Running,
    /// Parked inside `alt`/`nbalt` awaiting a channel.
    BlockedInAlt,
    /// Parked on a channel send.
    BlockedSending,
    /// Parked on a channel receive.
    BlockedReceiving,
    /// Suspended by a tool.
    Debug,
    /// Running a built-in native function to completion; not "running" for
    /// scheduler quantum accounting.
    Release,
    /// Reached `exit`; about to be removed.
    Exiting,
    /// `ret` with an empty stack; about to be removed.
    EmptyStack,
    /// An uncaught error terminated the thread.
    Broken,
}

/// Per-step debugger trap flags (§4.E).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrapFlags {
    /// Set by a tool to single-step: cleared and a `trap` event fired after
    /// the next instruction.
    pub instruction: bool,
}

/// A decoded operand address: `None` when the instruction's addressing mode
/// left this slot absent, otherwise a raw pointer into the current frame,
/// MP, or an immediate scratch word (§4.D).
pub type OperandAddr = Pointer;

/// The per-thread register file.
pub struct Registers {
    /// Program counter of the instruction currently executing.
    pub pc: Pc,
    /// Program counter the engine will jump to after this instruction,
    /// unless the handler overwrites it (branches, calls, returns).
    pub next_pc: Pc,
    /// This thread's frame stack.
    pub stack: Stack,
    /// The module reference currently executing.
    pub module: Option<Arc<ModRef>>,
    /// Base pointer into the current module reference's MP allocation.
    pub mp_base: Pointer,
    /// Source operand address, written by the address decoder.
    pub src: OperandAddr,
    /// Middle operand address, written by the address decoder.
    pub mid: OperandAddr,
    /// Destination operand address, written by the address decoder.
    pub dest: OperandAddr,
    /// Current thread state.
    pub state: ThreadState,
    /// Instructions remaining in the current scheduling quantum.
    pub quantum_remaining: u32,
    /// Debugger trap flags.
    pub trap_flags: TrapFlags,
    /// Atomic slot for the installed tool dispatcher; null when no tool is
    /// loaded, letting the engine's fast path skip the slow tool-check
    /// branch with one relaxed load (§4.I).
    tool_dispatch: AtomicPtr<ToolController>,
    /// Private request-mutex, shared across every channel this thread may
    /// concurrently be waiting on via `alt` (§4.F, §5, §9).
    pub request_mutex: Arc<RequestMutex>,
    /// Scratch words the address decoder writes immediate-mode operand
    /// values into, so `src`/`mid`/`dest` can point at them uniformly with
    /// frame- and MP-relative operands.
    imm_src: i32,
    imm_mid: i32,
    imm_dest: i32,
}

impl Registers {
    /// A fresh register file with an empty stack and no module loaded.
    pub fn new() -> Registers {
        Registers {
            pc: INVALID_PC,
            next_pc: INVALID_PC,
            stack: Stack::new(),
            module: None,
            mp_base: None,
            src: None,
            mid: None,
            dest: None,
            state: ThreadState::Ready,
            quantum_remaining: 0,
            trap_flags: TrapFlags::default(),
            tool_dispatch: AtomicPtr::new(std::ptr::null_mut()),
            request_mutex: Arc::new(RequestMutex::new()),
            imm_src: 0,
            imm_mid: 0,
            imm_dest: 0,
        }
    }

    /// Pointer to the immediate-mode scratch word for `src`.
    pub fn imm_src_ptr(&mut self) -> NonNull<u8> {
        NonNull::new(&mut self.imm_src as *mut i32 as *mut u8).unwrap()
    }

    /// Pointer to the immediate-mode scratch word for `mid`.
    pub fn imm_mid_ptr(&mut self) -> NonNull<u8> {
        NonNull::new(&mut self.imm_mid as *mut i32 as *mut u8).unwrap()
    }

    /// Pointer to the immediate-mode scratch word for `dest`.
    pub fn imm_dest_ptr(&mut self) -> NonNull<u8> {
        NonNull::new(&mut self.imm_dest as *mut i32 as *mut u8).unwrap()
    }

    /// Reads the installed tool dispatcher, if any, with a single relaxed
    /// load.
    pub fn tool_dispatch(&self) -> Option<Arc<ToolController>> {
        let raw = self.tool_dispatch.load(Ordering::Relaxed);
        if raw.is_null() {
            None
        } else {
            let arc = unsafe { Arc::from_raw(raw) };
            let clone = Arc::clone(&arc);
            std::mem::forget(arc); // the atomic slot still owns the original reference
            Some(clone)
        }
    }

    /// Installs a tool dispatcher, replacing (and dropping) whatever was
    /// there before.
    pub fn set_tool_dispatch(&mut self, tool: Option<Arc<ToolController>>) {
        let new_raw = tool.map_or(std::ptr::null_mut(), Arc::into_raw) as *mut ToolController;
        let old_raw = self.tool_dispatch.swap(new_raw, Ordering::Relaxed);
        if !old_raw.is_null() {
            drop(unsafe { Arc::from_raw(old_raw) });
        }
    }
}

impl Default for Registers {
    fn default() -> Registers {
        Registers::new()
    }
}

// `Registers` holds raw heap pointers (`src`/`mid`/`dest`/`mp_base`), but
// those address process-wide allocations valid from any OS thread; the
// scheduler's per-thread ownership mutex is what actually guarantees
// exclusive access to a given `Registers` at a time; moving the whole
// register file to a different worker between quanta is sound.
unsafe impl Send for Registers {}

impl Drop for Registers {
    fn drop(&mut self) {
        self.set_tool_dispatch(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_registers_have_no_tool_dispatch() {
        let regs = Registers::new();
        assert!(regs.tool_dispatch().is_none());
    }

    #[test]
    fn immediate_scratch_pointers_are_distinct() {
        let mut regs = Registers::new();
        let src = regs.imm_src_ptr();
        let mid = regs.imm_mid_ptr();
        assert_ne!(src.as_ptr(), mid.as_ptr());
    }
}
