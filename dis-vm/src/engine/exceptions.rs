//! `raise` and exception unwinding (§4.E, §6).
//!
//! On `raise`, walks frames outward from the current pc looking for a
//! [`HandlerEntry`] whose `[begin_pc, end_pc)` covers it, in the module
//! owning each frame; a named-case or wildcard match reinitializes that
//! frame (discarding the ones popped past) and resumes at the target pc.
//! No match at all breaks the thread (`UnhandledUserException`).

use std::sync::Arc;

use dis_types::Pc;

use crate::heap::{self, header::TypeDescriptor, Pointer};
use crate::module::{HandlerEntry, Module};
use crate::registers::{Registers, ThreadState};

/// Finds the first handler in `module` covering `pc`.
fn find_handler(module: &Module, pc: Pc) -> Option<&HandlerEntry> {
    module.handlers.iter().find(|h| pc >= h.begin_pc && pc < h.end_pc)
}

/// Resolves a handler's target pc for a raised exception named
/// `exception_name`: a named case wins over the wildcard; neither matching
/// means this handler doesn't cover the exception and the search should
/// continue outward.
fn resolve_target(handler: &HandlerEntry, exception_name: &str) -> Option<Pc> {
    handler
        .named_cases
        .iter()
        .find(|(name, _)| name == exception_name)
        .map(|(_, pc)| *pc)
        .or(handler.wildcard_pc)
}

/// `raise`: unwinds `regs`'s stack looking for a handler covering each
/// frame's saved pc (outermost search is against the *current* pc for the
/// top frame, then each popped frame's `prev_pc`), reinitializing the
/// matching frame's payload per `type_desc_index` and writing the raised
/// value's identity at `exception_offset`. Returns `Ok(())` having set
/// `regs.next_pc` to the handler target on a match; on no match at all,
/// transitions the thread to `Broken` and returns the original
/// `PanicReason`/exception name as an error for the caller to log.
pub fn raise(
    regs: &mut Registers,
    current_module: Arc<Module>,
    exception_name: &str,
) -> Result<(), String> {
    let mut pc = regs.pc;
    let mut module = current_module;

    loop {
        if let Some(handler) = find_handler(&module, pc) {
            if let Some(target) = resolve_target(handler, exception_name) {
                reinit_current_frame(regs, &module, handler, exception_name);
                regs.next_pc = target;
                return Ok(());
            }
        }

        let Some((prev_pc, prev_module)) = regs.stack.pop_frame() else {
            regs.state = ThreadState::Broken;
            return Err(format!("unhandled exception: {exception_name}"));
        };
        pc = prev_pc;
        if let Some(m) = prev_module {
            regs.mp_base = m.mp;
            module = Arc::clone(&m.module);
            regs.module = Some(m);
        }
        if regs.stack.peek_frame().is_none() {
            regs.state = ThreadState::Broken;
            return Err(format!("unhandled exception: {exception_name}"));
        }
    }
}

/// Reinitializes the frame a matched handler runs in: zero-fills it fresh
/// (per `type_desc_index`, or leaves the existing frame payload untouched
/// when the handler names no reinit type) and writes the raised
/// exception's decremented prior value at `exception_offset`, per §4.E's
/// "decrement the previous occupant before writing" rule — the same
/// overwrite discipline `movp` and friends already follow.
fn reinit_current_frame(regs: &mut Registers, module: &Module, handler: &HandlerEntry, exception_name: &str) {
    let Some(frame_id) = regs.stack.peek_frame() else { return };
    if handler.type_desc_index >= 0 {
        if let Some(_td) = module.types.get(handler.type_desc_index as usize) {
            let payload = regs.stack.payload_ptr(frame_id);
            let type_desc = regs.stack.type_desc(frame_id);
            zero_frame_payload(payload, type_desc);
        }
    }
    if handler.exception_offset >= 0 {
        write_exception_slot(regs.stack.payload_ptr(frame_id), handler.exception_offset as usize, exception_name);
    }
}

fn zero_frame_payload(payload: *mut u8, type_desc: &Arc<TypeDescriptor>) {
    for offset in type_desc.pointer_offsets() {
        unsafe {
            let field = payload.add(offset) as *mut Pointer;
            heap::dec(field.read());
            field.write(None);
        }
    }
}

fn write_exception_slot(payload: *mut u8, offset: usize, exception_name: &str) {
    let new_ptr = crate::heap::string::alloc_str(exception_name, crate::heap::Colour::White);
    unsafe {
        let field = payload.add(offset) as *mut Pointer;
        heap::dec(field.read());
        field.write(Some(new_ptr));
    }
}
