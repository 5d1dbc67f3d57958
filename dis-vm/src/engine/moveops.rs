//! Scalar moves, conversions, `lea`, and `new*`/`newc*` allocation opcodes.

use std::ptr::NonNull;

use dis_asm::PanicReason;

use crate::heap::{self, array, header::TypeDescriptor, list, string, Colour, Pointer};
use crate::registers::Registers;

unsafe fn read<T: Copy>(ptr: NonNull<u8>) -> T {
    (ptr.as_ptr() as *const T).read_unaligned()
}

unsafe fn write<T: Copy>(ptr: NonNull<u8>, value: T) {
    (ptr.as_ptr() as *mut T).write_unaligned(value);
}

fn src_dest(regs: &Registers) -> Result<(NonNull<u8>, NonNull<u8>), PanicReason> {
    Ok((
        regs.src.ok_or(PanicReason::OutOfRangeMemory)?,
        regs.dest.ok_or(PanicReason::OutOfRangeMemory)?,
    ))
}

macro_rules! movw {
    ($name:ident, $ty:ty) => {
        /// Moves one `$ty` value from `src` to `dest`.
        pub fn $name(regs: &mut Registers) -> Result<(), PanicReason> {
            let (src, dest) = src_dest(regs)?;
            unsafe { write::<$ty>(dest, read::<$ty>(src)) };
            Ok(())
        }
    };
}

movw!(movb, u8);
movw!(movw, i32);
movw!(movf, f64);
movw!(movl, i64);

/// Moves a pointer, releasing whatever `dest` previously held and taking a
/// fresh reference to the moved value (§4.D).
pub fn movp(regs: &mut Registers) -> Result<(), PanicReason> {
    let (src, dest) = src_dest(regs)?;
    unsafe {
        let value: Pointer = read(src);
        heap::inc(value);
        let old: Pointer = read(dest);
        heap::dec(old);
        write(dest, value);
    }
    Ok(())
}

/// Moves a value described by a type descriptor pointer carried in `mid`,
/// bumping/releasing refcounts of any embedded pointer fields per the
/// descriptor's bitmap (`movm`). `movmp` is the same operation with the
/// type descriptor resolved through a module's type-fixup table rather
/// than addressed directly; both collapse to this handler once `mid`
/// already names the resolved descriptor (a disclosed simplification: the
/// fixup indirection itself belongs to module loading, already resolved by
/// the time the engine runs).
pub fn movm(regs: &mut Registers, type_desc: &std::sync::Arc<TypeDescriptor>) -> Result<(), PanicReason> {
    let (src, dest) = src_dest(regs)?;
    unsafe {
        for offset in type_desc.pointer_offsets() {
            let old: Pointer = read(NonNull::new_unchecked(dest.as_ptr().add(offset)));
            heap::dec(old);
        }
        std::ptr::copy(src.as_ptr(), dest.as_ptr(), type_desc.size_in_bytes);
        for offset in type_desc.pointer_offsets() {
            let moved: Pointer = read(NonNull::new_unchecked(dest.as_ptr().add(offset)));
            heap::inc(moved);
        }
    }
    Ok(())
}

/// `movmp` is `movm` with its type descriptor resolved via fixup; see
/// [`movm`]'s doc comment.
pub use movm as movmp;

/// Loads a frame- or module-relative address into `dest` as a plain
/// pointer value (`lea`), with no refcount effect — the value is an
/// address, not an owned reference.
pub fn lea(regs: &mut Registers) -> Result<(), PanicReason> {
    let src = regs.src.ok_or(PanicReason::OutOfRangeMemory)?;
    let dest = regs.dest.ok_or(PanicReason::OutOfRangeMemory)?;
    unsafe { write(dest, Some(src)) };
    Ok(())
}

macro_rules! cvt_num {
    ($name:ident, $from:ty, $to:ty) => {
        /// Converts `src` from `$from` to `$to`, writing the result to `dest`.
        pub fn $name(regs: &mut Registers) -> Result<(), PanicReason> {
            let (src, dest) = src_dest(regs)?;
            unsafe { write::<$to>(dest, read::<$from>(src) as $to) };
            Ok(())
        }
    };
}

cvt_num!(cvtbw, u8, i32);
cvt_num!(cvtwb, i32, u8);
cvt_num!(cvtfw, f64, i32);
cvt_num!(cvtwf, i32, f64);
cvt_num!(cvtlf, i64, f64);
cvt_num!(cvtfl, f64, i64);
cvt_num!(cvtlw, i64, i32);
cvt_num!(cvtwl, i32, i64);
cvt_num!(cvtrf, f32, f64);
cvt_num!(cvtfr, f64, f32);

/// Converts a `word` to a `short` (16-bit), truncating (`cvtws`).
pub fn cvtws(regs: &mut Registers) -> Result<(), PanicReason> {
    let (src, dest) = src_dest(regs)?;
    unsafe { write::<i16>(dest, read::<i32>(src) as i16) };
    Ok(())
}

/// Converts a `short` to a `word`, sign-extending (`cvtsw`).
pub fn cvtsw(regs: &mut Registers) -> Result<(), PanicReason> {
    let (src, dest) = src_dest(regs)?;
    unsafe { write::<i32>(dest, read::<i16>(src) as i32) };
    Ok(())
}

/// Converts a single codepoint array (`src`) to a string (`cvtac`),
/// releasing whatever string previously lived at `dest`.
pub fn cvtac(regs: &mut Registers, len: usize) -> Result<(), PanicReason> {
    let src = regs.src.ok_or(PanicReason::OutOfRangeMemory)?;
    let dest = regs.dest.ok_or(PanicReason::OutOfRangeMemory)?;
    let runes = unsafe { std::slice::from_raw_parts(src.as_ptr() as *const i32, len) };
    let s: String = runes.iter().filter_map(|&r| char::from_u32(r as u32)).collect();
    let new_ptr = string::alloc_str(&s, Colour::White);
    unsafe {
        let old: Pointer = read(dest);
        heap::dec(old);
        write(dest, Some(new_ptr));
    }
    Ok(())
}

/// Converts a string (`src`) to a codepoint array written starting at
/// `dest` (`cvtca`); the caller must ensure `dest` has room for every
/// codepoint in the string.
pub fn cvtca(regs: &mut Registers) -> Result<usize, PanicReason> {
    let src = regs.src.ok_or(PanicReason::OutOfRangeMemory)?;
    let dest = regs.dest.ok_or(PanicReason::OutOfRangeMemory)?;
    let ptr = unsafe { read::<Pointer>(src) }.ok_or(PanicReason::DereferenceNil)?;
    let s = unsafe { string::as_str(ptr) };
    let mut count = 0;
    unsafe {
        for (i, c) in s.chars().enumerate() {
            write::<i32>(NonNull::new_unchecked(dest.as_ptr().add(i * 4)), c as i32);
            count = i + 1;
        }
    }
    Ok(count)
}

/// `cvtwc`/`cvtcw`: a string holding the decimal text form of a word, and
/// back.
pub fn cvtwc(regs: &mut Registers) -> Result<(), PanicReason> {
    let src = regs.src.ok_or(PanicReason::OutOfRangeMemory)?;
    let dest = regs.dest.ok_or(PanicReason::OutOfRangeMemory)?;
    let value: i32 = unsafe { read(src) };
    let new_ptr = string::alloc_str(&value.to_string(), Colour::White);
    unsafe {
        let old: Pointer = read(dest);
        heap::dec(old);
        write(dest, Some(new_ptr));
    }
    Ok(())
}

/// See [`cvtwc`].
pub fn cvtcw(regs: &mut Registers) -> Result<(), PanicReason> {
    let src = regs.src.ok_or(PanicReason::OutOfRangeMemory)?;
    let dest = regs.dest.ok_or(PanicReason::OutOfRangeMemory)?;
    let ptr = unsafe { read::<Pointer>(src) }.ok_or(PanicReason::DereferenceNil)?;
    let s = unsafe { string::as_str(ptr) };
    let value: i32 = s.trim().parse().map_err(|_| PanicReason::TypeViolation)?;
    unsafe { write(dest, value) };
    Ok(())
}

/// `cvtfc`/`cvtcf`: a string holding the decimal text form of a real, and
/// back.
pub fn cvtfc(regs: &mut Registers) -> Result<(), PanicReason> {
    let src = regs.src.ok_or(PanicReason::OutOfRangeMemory)?;
    let dest = regs.dest.ok_or(PanicReason::OutOfRangeMemory)?;
    let value: f64 = unsafe { read(src) };
    let new_ptr = string::alloc_str(&value.to_string(), Colour::White);
    unsafe {
        let old: Pointer = read(dest);
        heap::dec(old);
        write(dest, Some(new_ptr));
    }
    Ok(())
}

/// See [`cvtfc`].
pub fn cvtcf(regs: &mut Registers) -> Result<(), PanicReason> {
    let src = regs.src.ok_or(PanicReason::OutOfRangeMemory)?;
    let dest = regs.dest.ok_or(PanicReason::OutOfRangeMemory)?;
    let ptr = unsafe { read::<Pointer>(src) }.ok_or(PanicReason::DereferenceNil)?;
    let s = unsafe { string::as_str(ptr) };
    let value: f64 = s.trim().parse().map_err(|_| PanicReason::TypeViolation)?;
    unsafe { write(dest, value) };
    Ok(())
}

/// `cvtlc`/`cvtcl`: a string holding the decimal text form of a big, and
/// back.
pub fn cvtlc(regs: &mut Registers) -> Result<(), PanicReason> {
    let src = regs.src.ok_or(PanicReason::OutOfRangeMemory)?;
    let dest = regs.dest.ok_or(PanicReason::OutOfRangeMemory)?;
    let value: i64 = unsafe { read(src) };
    let new_ptr = string::alloc_str(&value.to_string(), Colour::White);
    unsafe {
        let old: Pointer = read(dest);
        heap::dec(old);
        write(dest, Some(new_ptr));
    }
    Ok(())
}

/// See [`cvtlc`].
pub fn cvtcl(regs: &mut Registers) -> Result<(), PanicReason> {
    let src = regs.src.ok_or(PanicReason::OutOfRangeMemory)?;
    let dest = regs.dest.ok_or(PanicReason::OutOfRangeMemory)?;
    let ptr = unsafe { read::<Pointer>(src) }.ok_or(PanicReason::DereferenceNil)?;
    let s = unsafe { string::as_str(ptr) };
    let value: i64 = s.trim().parse().map_err(|_| PanicReason::TypeViolation)?;
    unsafe { write(dest, value) };
    Ok(())
}

/// Allocates a plain record (`new`/`newz`), writing its pointer to `dest`.
pub fn new(regs: &mut Registers, type_desc: std::sync::Arc<TypeDescriptor>) -> Result<(), PanicReason> {
    let dest = regs.dest.ok_or(PanicReason::OutOfRangeMemory)?;
    let ptr = heap::allocate(type_desc, Colour::White);
    unsafe {
        let old: Pointer = read(dest);
        heap::dec(old);
        write(dest, Some(ptr));
    }
    Ok(())
}

/// Allocates an array (`newa`/`newaz`/`mnewz`), `mid` carrying the element
/// count.
pub fn newa(regs: &mut Registers, element_td: &std::sync::Arc<TypeDescriptor>) -> Result<(), PanicReason> {
    let mid = regs.mid.ok_or(PanicReason::OutOfRangeMemory)?;
    let dest = regs.dest.ok_or(PanicReason::OutOfRangeMemory)?;
    let count: i32 = unsafe { read(mid) };
    if count < 0 {
        return Err(PanicReason::IndexOutOfRange);
    }
    let ptr = array::alloc_array(element_td, count as usize, Colour::White);
    unsafe {
        let old: Pointer = read(dest);
        heap::dec(old);
        write(dest, Some(ptr));
    }
    Ok(())
}

/// Conses a value onto a list (`cons*`), `src` the head value's address,
/// `dest` the existing tail pointer to read then overwrite with the new
/// cell.
pub fn cons(regs: &mut Registers, head_size: usize, head_is_pointer: bool) -> Result<(), PanicReason> {
    let src = regs.src.ok_or(PanicReason::OutOfRangeMemory)?;
    let dest = regs.dest.ok_or(PanicReason::OutOfRangeMemory)?;
    let head_bytes = unsafe { std::slice::from_raw_parts(src.as_ptr(), head_size) };
    if head_is_pointer {
        let p: Pointer = unsafe { read(src) };
        heap::inc(p);
    }
    let tail: Pointer = unsafe { read(dest) };
    let cell = list::cons(head_bytes, tail, head_is_pointer, Colour::White);
    unsafe { write(dest, Some(cell)) };
    Ok(())
}

/// Reads a list cell's head into `dest` (`head*`).
pub fn head(regs: &mut Registers, head_size: usize) -> Result<(), PanicReason> {
    let src = regs.src.ok_or(PanicReason::OutOfRangeMemory)?;
    let dest = regs.dest.ok_or(PanicReason::OutOfRangeMemory)?;
    let cell: Pointer = unsafe { read(src) };
    let cell = cell.ok_or(PanicReason::DereferenceNil)?;
    let bytes = list::head(cell);
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), dest.as_ptr(), head_size);
    }
    Ok(())
}

/// Reads a list cell's tail into `dest` (`tail`), taking a fresh reference.
pub fn tail(regs: &mut Registers) -> Result<(), PanicReason> {
    let src = regs.src.ok_or(PanicReason::OutOfRangeMemory)?;
    let dest = regs.dest.ok_or(PanicReason::OutOfRangeMemory)?;
    let cell: Pointer = unsafe { read(src) };
    let cell = cell.ok_or(PanicReason::DereferenceNil)?;
    let tail = list::tail(cell);
    heap::inc(tail);
    unsafe {
        let old: Pointer = read(dest);
        heap::dec(old);
        write(dest, tail);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regs_with(src: i32, dest: i32) -> (Registers, Box<i32>, Box<i32>) {
        let mut regs = Registers::new();
        let mut s = Box::new(src);
        let mut d = Box::new(dest);
        regs.src = Some(NonNull::new(s.as_mut() as *mut i32 as *mut u8).unwrap());
        regs.dest = Some(NonNull::new(d.as_mut() as *mut i32 as *mut u8).unwrap());
        (regs, s, d)
    }

    #[test]
    fn movw_copies_a_word() {
        let (mut regs, _s, d) = regs_with(42, 0);
        movw(&mut regs).unwrap();
        assert_eq!(*d, 42);
    }

    #[test]
    fn cvtwf_widens_to_real() {
        let mut regs = Registers::new();
        let mut s = Box::new(7i32);
        let mut d = Box::new(0f64);
        regs.src = Some(NonNull::new(s.as_mut() as *mut i32 as *mut u8).unwrap());
        regs.dest = Some(NonNull::new(d.as_mut() as *mut f64 as *mut u8).unwrap());
        cvtwf(&mut regs).unwrap();
        assert_eq!(*d, 7.0);
    }

    #[test]
    fn cons_head_tail_round_trip() {
        let mut regs = Registers::new();
        let mut value = Box::new(9i32);
        let mut tail_slot: Pointer = None;
        regs.src = Some(NonNull::new(value.as_mut() as *mut i32 as *mut u8).unwrap());
        regs.dest = Some(NonNull::new(&mut tail_slot as *mut Pointer as *mut u8).unwrap());
        cons(&mut regs, 4, false).unwrap();
        let cell = tail_slot.unwrap();

        let mut head_out = 0i32;
        let mut cell_slot: Pointer = Some(cell);
        regs.src = Some(NonNull::new(&mut cell_slot as *mut Pointer as *mut u8).unwrap());
        regs.dest = Some(NonNull::new(&mut head_out as *mut i32 as *mut u8).unwrap());
        head(&mut regs, 4).unwrap();
        assert_eq!(head_out, 9);

        heap::dec(Some(cell));
    }
}
