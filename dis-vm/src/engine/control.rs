//! Control-flow and frame opcodes: `frame`/`mframe`, `call`/`mcall`,
//! `ret`, `jmp`/`goto`, `spawn`/`mspawn`, `exit`, `load` (§4.C/§4.D).
//!
//! Thread spawning and module loading need state the engine doesn't own
//! itself (a thread table, a resolver, a module cache); callers pass in a
//! small [`Scheduling`] trait object for those two opcode families rather
//! than threading the whole scheduler through every other handler.

use std::sync::Arc;

use dis_asm::PanicReason;
use dis_types::Pc;

use crate::frame::FrameId;
use crate::heap::header::TypeDescriptor;
use crate::module::{ModRef, Module};
use crate::registers::Registers;

/// Host hooks needed by `spawn`/`mspawn`/`load`, implemented by the
/// scheduler.
pub trait Scheduling {
    /// Spawns a new thread at `entry_pc` in `module`, with a freshly
    /// allocated frame of `frame_type`, returning the new thread's id.
    fn spawn_thread(&mut self, module: Arc<ModRef>, entry_pc: Pc, frame_type: Arc<TypeDescriptor>) -> u32;

    /// Loads and links a module by path, returning a fresh `ModRef`
    /// (caching the underlying [`Module`] across load sites is the
    /// implementation's concern, not this trait's).
    fn load_module(&mut self, path: &str) -> Result<Arc<ModRef>, PanicReason>;
}

/// `frame`/`mframe`: allocates a new, inactive frame of `type_desc`,
/// writing its id-as-pointer to `dest` for a later `call`/`spawn` to
/// activate. Unlike a heap allocation this isn't refcounted — frames are
/// owned by the stack they're allocated on.
pub fn frame(regs: &mut Registers, type_desc: Arc<TypeDescriptor>) -> Result<FrameId, PanicReason> {
    regs.stack.alloc_frame(type_desc)
}

/// `call`/`mcall`: activates a previously allocated frame atop the current
/// one, recording the return pc, and jumps to `entry_pc`. When `callee_module`
/// is `Some`, this is a cross-module call: the current module/MP are saved
/// in the frame header and restored on `ret`.
pub fn call(
    regs: &mut Registers,
    frame_id: FrameId,
    entry_pc: Pc,
    callee_module: Option<Arc<ModRef>>,
) -> Result<(), PanicReason> {
    let return_pc = regs.next_pc;
    let prev_module = if callee_module.is_some() {
        regs.module.clone()
    } else {
        None
    };
    regs.stack.push_frame(frame_id, return_pc, prev_module);
    if let Some(m) = callee_module {
        regs.mp_base = m.mp;
        regs.module = Some(m);
    }
    regs.next_pc = entry_pc;
    Ok(())
}

/// `ret`: pops the current frame, restoring the caller's pc and (if this
/// was a module-boundary call) its module/MP. Transitions to
/// `EmptyStack` when the popped frame was the thread's last one.
pub fn ret(regs: &mut Registers) -> Result<(), PanicReason> {
    let (prev_pc, prev_module) = regs.stack.pop_frame().ok_or(PanicReason::OutOfRangeMemory)?;
    if let Some(m) = prev_module {
        regs.mp_base = m.mp;
        regs.module = Some(m);
    }
    regs.next_pc = prev_pc;
    if regs.stack.peek_frame().is_none() {
        regs.state = crate::registers::ThreadState::EmptyStack;
    }
    Ok(())
}

/// `jmp`/`goto`: an unconditional jump to `target_pc`.
pub fn jmp(regs: &mut Registers, target_pc: Pc) -> Result<(), PanicReason> {
    regs.next_pc = target_pc;
    Ok(())
}

/// `spawn`/`mspawn`: spawns a new thread running `entry_pc` in `module`
/// with a fresh frame of `frame_type`, writing the new thread's id to
/// `dest` as a plain word.
pub fn spawn(
    regs: &mut Registers,
    host: &mut dyn Scheduling,
    module: Arc<ModRef>,
    entry_pc: Pc,
    frame_type: Arc<TypeDescriptor>,
) -> Result<(), PanicReason> {
    let dest = regs.dest.ok_or(PanicReason::OutOfRangeMemory)?;
    let id = host.spawn_thread(module, entry_pc, frame_type);
    unsafe { (dest.as_ptr() as *mut i32).write_unaligned(id as i32) };
    Ok(())
}

/// `exit`: the thread terminates unconditionally, discarding its stack.
/// The reference runtime tears down remaining frames without running
/// their destructors' observable side effects beyond refcount release,
/// which `Stack`'s `Drop` already performs when the thread itself is
/// dropped by the scheduler.
pub fn exit(regs: &mut Registers) {
    regs.state = crate::registers::ThreadState::Exiting;
}

/// `load`: resolves and links a module by path, writing the resulting
/// module-reference pointer to `dest`. A failed load raises
/// `ModuleException` rather than aborting the thread outright (callers
/// usually wrap `load` in an exception handler).
///
/// Module references aren't bitmap-traced heap values the way records and
/// arrays are (same reasoning as [`crate::thread::Thread`] and
/// `Registers::tool_dispatch`): `dest` holds a raw `Arc<ModRef>` pointer
/// that this function manages directly, dropping whatever reference
/// previously occupied the slot.
pub fn load(regs: &mut Registers, host: &mut dyn Scheduling, path: &str) -> Result<(), PanicReason> {
    let dest = regs.dest.ok_or(PanicReason::OutOfRangeMemory)?;
    let modref = host.load_module(path).map_err(|_| PanicReason::ModuleException)?;
    let new_ptr = Arc::into_raw(modref) as *mut ModRef;
    unsafe {
        let slot = dest.as_ptr() as *mut *mut ModRef;
        let old = slot.read_unaligned();
        slot.write_unaligned(new_ptr);
        if !old.is_null() {
            drop(Arc::from_raw(old as *const ModRef));
        }
    }
    Ok(())
}
