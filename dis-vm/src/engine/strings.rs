//! String opcodes: `insc`/`indc`/`addc`/`lenc`/`slicec`, on top of
//! `heap::string`'s UTF-8-backed allocation.

use std::ptr::NonNull;

use dis_asm::PanicReason;

use crate::heap::{self, string, Colour, Pointer};
use crate::registers::Registers;

unsafe fn read<T: Copy>(ptr: NonNull<u8>) -> T {
    (ptr.as_ptr() as *const T).read_unaligned()
}

unsafe fn write<T: Copy>(ptr: NonNull<u8>, value: T) {
    (ptr.as_ptr() as *mut T).write_unaligned(value);
}

fn resolve_str(regs: &Registers, which: Pointer) -> Result<NonNull<u8>, PanicReason> {
    let addr = which.ok_or(PanicReason::OutOfRangeMemory)?;
    let _ = regs;
    unsafe { read::<Pointer>(addr) }.ok_or(PanicReason::DereferenceNil)
}

/// `insc`: inserts the rune held at `mid` into the string at `src` at
/// codepoint index `dest`'s current value... the reference opcode's
/// operand layout is `insc src(string) mid(rune) dest(string*index)`; here
/// `dest` names the destination slot to overwrite and an explicit `index`
/// is passed alongside since the register model carries only three
/// operand addresses.
pub fn insc(regs: &mut Registers, index: usize) -> Result<(), PanicReason> {
    let src_str = resolve_str(regs, regs.src)?;
    let mid = regs.mid.ok_or(PanicReason::OutOfRangeMemory)?;
    let dest = regs.dest.ok_or(PanicReason::OutOfRangeMemory)?;
    let rune: i32 = unsafe { read(mid) };
    let rune = char::from_u32(rune as u32).ok_or(PanicReason::InvalidUtf8)?;
    let new_ptr = string::insert(src_str, index, rune, Colour::White);
    unsafe {
        let old: Pointer = read(dest);
        heap::dec(old);
        write(dest, Some(new_ptr));
    }
    Ok(())
}

/// `indc`: reads the rune at codepoint `index` of the string at `src`,
/// writing it to `dest`.
pub fn indc(regs: &mut Registers, index: usize) -> Result<(), PanicReason> {
    let s = resolve_str(regs, regs.src)?;
    let dest = regs.dest.ok_or(PanicReason::OutOfRangeMemory)?;
    let rune = string::index(s, index).ok_or(PanicReason::IndexOutOfRange)?;
    unsafe { write::<i32>(dest, rune as i32) };
    Ok(())
}

/// `addc`: concatenates the strings at `src` and `mid`, writing the result
/// to `dest`.
pub fn addc(regs: &mut Registers) -> Result<(), PanicReason> {
    let a = resolve_str(regs, regs.src)?;
    let b = resolve_str(regs, regs.mid)?;
    let dest = regs.dest.ok_or(PanicReason::OutOfRangeMemory)?;
    let new_ptr = string::concat(a, b, Colour::White);
    unsafe {
        let old: Pointer = read(dest);
        heap::dec(old);
        write(dest, Some(new_ptr));
    }
    Ok(())
}

/// `lenc`: the codepoint count of the string at `src`, written to `dest`.
pub fn lenc(regs: &mut Registers) -> Result<(), PanicReason> {
    let s = resolve_str(regs, regs.src)?;
    let dest = regs.dest.ok_or(PanicReason::OutOfRangeMemory)?;
    unsafe { write::<i32>(dest, string::len_codepoints(s) as i32) };
    Ok(())
}

/// `slicec`: slices the string at `src` by codepoint range `[start, end)`,
/// writing the result to `dest`.
pub fn slicec(regs: &mut Registers, start: usize, end: usize) -> Result<(), PanicReason> {
    let s = resolve_str(regs, regs.src)?;
    let dest = regs.dest.ok_or(PanicReason::OutOfRangeMemory)?;
    if end < start || end > string::len_codepoints(s) {
        return Err(PanicReason::IndexOutOfRange);
    }
    let new_ptr = string::slice(s, start, end, Colour::White);
    unsafe {
        let old: Pointer = read(dest);
        heap::dec(old);
        write(dest, Some(new_ptr));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regs_with_strings(a: &str, b: Option<&str>) -> (Registers, Pointer, Pointer) {
        let mut regs = Registers::new();
        let pa = string::alloc_str(a, Colour::White);
        regs.src = Some(regs.imm_src_ptr());
        unsafe { write(regs.src.unwrap(), Some(pa)) };
        let pb = b.map(|s| string::alloc_str(s, Colour::White));
        if let Some(p) = pb {
            regs.mid = Some(regs.imm_mid_ptr());
            unsafe { write(regs.mid.unwrap(), Some(p)) };
        }
        (regs, Some(pa), pb)
    }

    #[test]
    fn lenc_counts_codepoints() {
        let (mut regs, a, _) = regs_with_strings("hello", None);
        let out = Box::leak(Box::new(0i32));
        regs.dest = Some(NonNull::new(out as *mut i32 as *mut u8).unwrap());
        lenc(&mut regs).unwrap();
        assert_eq!(*out, 5);
        heap::dec(a);
    }

    #[test]
    fn addc_concatenates() {
        let (mut regs, a, b) = regs_with_strings("foo", Some("bar"));
        let mut dest_slot: Pointer = None;
        regs.dest = Some(NonNull::new(&mut dest_slot as *mut Pointer as *mut u8).unwrap());
        addc(&mut regs).unwrap();
        let result = dest_slot.unwrap();
        assert_eq!(unsafe { string::as_str(result) }, "foobar");
        heap::dec(a);
        heap::dec(b);
        heap::dec(Some(result));
    }

    #[test]
    fn slicec_out_of_range_panics() {
        let (mut regs, a, _) = regs_with_strings("hi", None);
        let mut dest_slot: Pointer = None;
        regs.dest = Some(NonNull::new(&mut dest_slot as *mut Pointer as *mut u8).unwrap());
        assert_eq!(slicec(&mut regs, 0, 5), Err(PanicReason::IndexOutOfRange));
        heap::dec(a);
    }
}
