//! Address decoding: resolves an instruction's addressing-mode byte and
//! operand values into raw pointers on `src`/`mid`/`dest`, using the
//! current frame and MP base (§4.D).

use dis_asm::{AddrMode, Instruction, MidAddrMode, Operand, PanicReason};

use crate::registers::Registers;

fn resolve_single(
    mode: AddrMode,
    operand: Operand,
    regs: &mut Registers,
    frame_ptr: *mut u8,
    imm: impl FnOnce(&mut Registers) -> std::ptr::NonNull<u8>,
) -> Result<Option<std::ptr::NonNull<u8>>, PanicReason> {
    match mode {
        AddrMode::None => Ok(None),
        AddrMode::Immediate => {
            let value = operand.register1().ok_or(PanicReason::OutOfRangeMemory)?;
            let ptr = imm(regs);
            unsafe {
                (ptr.as_ptr() as *mut i32).write_unaligned(value);
            }
            Ok(Some(ptr))
        }
        AddrMode::OffsetIndirectFp => {
            let offset = operand.register1().ok_or(PanicReason::OutOfRangeMemory)?;
            Ok(Some(offset_ptr(frame_ptr, offset)))
        }
        AddrMode::OffsetIndirectMp => {
            let mp = regs.mp_base.ok_or(PanicReason::DereferenceNil)?;
            let offset = operand.register1().ok_or(PanicReason::OutOfRangeMemory)?;
            Ok(Some(offset_ptr(mp.as_ptr(), offset)))
        }
        AddrMode::OffsetDoubleIndirectFp => {
            let outer = operand.register1().ok_or(PanicReason::OutOfRangeMemory)?;
            let inner = operand.register2().ok_or(PanicReason::OutOfRangeMemory)?;
            let base = offset_ptr(frame_ptr, outer);
            let indirected = unsafe { (base.as_ptr() as *const *mut u8).read_unaligned() };
            if indirected.is_null() {
                return Err(PanicReason::DereferenceNil);
            }
            Ok(Some(offset_ptr(indirected, inner)))
        }
        AddrMode::OffsetDoubleIndirectMp => {
            let mp = regs.mp_base.ok_or(PanicReason::DereferenceNil)?;
            let outer = operand.register1().ok_or(PanicReason::OutOfRangeMemory)?;
            let inner = operand.register2().ok_or(PanicReason::OutOfRangeMemory)?;
            let base = offset_ptr(mp.as_ptr(), outer);
            let indirected = unsafe { (base.as_ptr() as *const *mut u8).read_unaligned() };
            if indirected.is_null() {
                return Err(PanicReason::DereferenceNil);
            }
            Ok(Some(offset_ptr(indirected, inner)))
        }
        AddrMode::Reserved1 | AddrMode::Reserved2 => Err(PanicReason::TypeViolation),
    }
}

fn offset_ptr(base: *mut u8, word_offset: i32) -> std::ptr::NonNull<u8> {
    let byte_offset = word_offset as isize * crate::consts::WORD_SIZE as isize;
    unsafe { std::ptr::NonNull::new_unchecked(base.offset(byte_offset)) }
}

/// Decodes `instr`'s mid/src/dest operands against the current thread
/// state, populating `regs.mid`/`regs.src`/`regs.dest`. `frame_ptr` is the
/// current frame's payload base (or null if no frame is active, which is
/// only valid for instructions with no frame-relative operand).
pub fn decode_operands(instr: &Instruction, regs: &mut Registers, frame_ptr: *mut u8) -> Result<(), PanicReason> {
    regs.mid = match instr.addr.mid {
        MidAddrMode::None => None,
        MidAddrMode::SmallImmediate => {
            let value = instr.mid.register1().ok_or(PanicReason::OutOfRangeMemory)?;
            let ptr = regs.imm_mid_ptr();
            unsafe {
                (ptr.as_ptr() as *mut i32).write_unaligned(value);
            }
            Some(ptr)
        }
        MidAddrMode::SmallOffsetIndirectFp => {
            let offset = instr.mid.register1().ok_or(PanicReason::OutOfRangeMemory)?;
            Some(offset_ptr(frame_ptr, offset))
        }
        MidAddrMode::SmallOffsetIndirectMp => {
            let mp = regs.mp_base.ok_or(PanicReason::DereferenceNil)?;
            let offset = instr.mid.register1().ok_or(PanicReason::OutOfRangeMemory)?;
            Some(offset_ptr(mp.as_ptr(), offset))
        }
    };

    regs.src = resolve_single(instr.addr.src, instr.src, regs, frame_ptr, Registers::imm_src_ptr)?;
    regs.dest = resolve_single(instr.addr.dest, instr.dest, regs, frame_ptr, Registers::imm_dest_ptr)?;
    Ok(())
}
