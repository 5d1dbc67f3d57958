//! Array index/length/slice opcodes (`indx`/`indb`/`indw`/`indf`/`indl`/
//! `lena`/`slicea`/`slicela`) on top of `heap::array`.

use std::ptr::NonNull;

use dis_asm::PanicReason;

use crate::heap::{self, array, header::TypeDescriptor, Colour, Pointer};
use crate::registers::Registers;

unsafe fn read<T: Copy>(ptr: NonNull<u8>) -> T {
    (ptr.as_ptr() as *const T).read_unaligned()
}

unsafe fn write<T: Copy>(ptr: NonNull<u8>, value: T) {
    (ptr.as_ptr() as *mut T).write_unaligned(value);
}

fn array_and_index(regs: &Registers) -> Result<(NonNull<u8>, usize), PanicReason> {
    let src = regs.src.ok_or(PanicReason::OutOfRangeMemory)?;
    let mid = regs.mid.ok_or(PanicReason::OutOfRangeMemory)?;
    let arr = unsafe { read::<Pointer>(src) }.ok_or(PanicReason::DereferenceNil)?;
    let index: i32 = unsafe { read(mid) };
    if index < 0 {
        return Err(PanicReason::IndexOutOfRange);
    }
    Ok((arr, index as usize))
}

/// `indx`: computes the address of `arr[index]`, writing it to `dest` as a
/// raw pointer (no refcount effect — the following instruction typically
/// indexes or moves through it).
pub fn indx(regs: &mut Registers, element_size: usize) -> Result<(), PanicReason> {
    let (arr, index) = array_and_index(regs)?;
    let dest = regs.dest.ok_or(PanicReason::OutOfRangeMemory)?;
    if index >= array::len(arr, element_size) {
        return Err(PanicReason::IndexOutOfRange);
    }
    let elem_addr = unsafe { NonNull::new_unchecked(arr.as_ptr().add(array::element_offset(index, element_size))) };
    unsafe { write(dest, Some(elem_addr)) };
    Ok(())
}

macro_rules! indexed_read {
    ($name:ident, $ty:ty) => {
        /// Reads one `$ty` element by index, writing it to `dest`.
        pub fn $name(regs: &mut Registers) -> Result<(), PanicReason> {
            let (arr, index) = array_and_index(regs)?;
            let dest = regs.dest.ok_or(PanicReason::OutOfRangeMemory)?;
            let size = std::mem::size_of::<$ty>();
            if index >= array::len(arr, size) {
                return Err(PanicReason::IndexOutOfRange);
            }
            unsafe {
                let elem = NonNull::new_unchecked(arr.as_ptr().add(array::element_offset(index, size)));
                write::<$ty>(dest, read::<$ty>(elem));
            }
            Ok(())
        }
    };
}

indexed_read!(indb, u8);
indexed_read!(indw, i32);
indexed_read!(indf, f64);
indexed_read!(indl, i64);

/// `lena`: the element count of the array at `src`, written to `dest`.
pub fn lena(regs: &mut Registers, element_size: usize) -> Result<(), PanicReason> {
    let src = regs.src.ok_or(PanicReason::OutOfRangeMemory)?;
    let dest = regs.dest.ok_or(PanicReason::OutOfRangeMemory)?;
    let arr = unsafe { read::<Pointer>(src) }.ok_or(PanicReason::DereferenceNil)?;
    unsafe { write::<i32>(dest, array::len(arr, element_size) as i32) };
    Ok(())
}

/// `slicea`: a reference-counted slice of the array at `src`, sharing the
/// reference runtime's actual-element storage (a sliced array just
/// reinterprets a range of the original's payload, so the reference
/// runtime keeps the original alive via a nested-array indirection). This
/// implementation copies the range into a fresh array instead, since the
/// heap model here has no nested-array representation; the observable
/// difference is that mutations through a slice no longer alias the
/// original (disclosed simplification, see `DESIGN.md`).
pub fn slicea(
    regs: &mut Registers,
    element_td: &std::sync::Arc<TypeDescriptor>,
    start: usize,
    end: usize,
) -> Result<(), PanicReason> {
    let src = regs.src.ok_or(PanicReason::OutOfRangeMemory)?;
    let dest = regs.dest.ok_or(PanicReason::OutOfRangeMemory)?;
    let arr = unsafe { read::<Pointer>(src) }.ok_or(PanicReason::DereferenceNil)?;
    let element_size = element_td.size_in_bytes;
    if end < start || end > array::len(arr, element_size) {
        return Err(PanicReason::IndexOutOfRange);
    }
    let new_arr = array::alloc_array(element_td, end - start, Colour::White);
    array::copy_elements(arr, start, new_arr, 0, element_size, end - start);
    if !element_td.pointer_bitmap.is_empty() {
        heap::enum_pointer_fields(new_arr, heap::inc);
    }
    unsafe {
        let old: Pointer = read(dest);
        heap::dec(old);
        write(dest, Some(new_arr));
    }
    Ok(())
}

/// `slicela`: slices a list by element range, producing a fresh list over
/// the same range of cells (copying cells rather than sharing them, for
/// the same reason [`slicea`] copies).
pub fn slicela(regs: &mut Registers, start: usize, end: usize) -> Result<(), PanicReason> {
    use crate::heap::list;
    let src = regs.src.ok_or(PanicReason::OutOfRangeMemory)?;
    let dest = regs.dest.ok_or(PanicReason::OutOfRangeMemory)?;
    let head: Pointer = unsafe { read(src) };
    if end < start {
        return Err(PanicReason::IndexOutOfRange);
    }
    let mut cursor = head;
    let mut collected = Vec::new();
    for i in 0..end {
        let Some(cell) = cursor else {
            return Err(PanicReason::IndexOutOfRange);
        };
        if i >= start {
            collected.push(list::head(cell));
        }
        cursor = list::tail(cell);
    }
    let mut new_tail: Pointer = None;
    for bytes in collected.into_iter().rev() {
        new_tail = Some(list::cons(&bytes, new_tail, false, Colour::White));
    }
    unsafe {
        let old: Pointer = read(dest);
        heap::dec(old);
        write(dest, new_tail);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::header::TypeDescriptor;

    #[test]
    fn indw_reads_element_by_index() {
        let td = TypeDescriptor::plain(4);
        let arr = array::alloc_array(&td, 3, Colour::White);
        unsafe { (arr.as_ptr().add(4) as *mut i32).write(99) };

        let mut regs = Registers::new();
        let mut arr_slot: Pointer = Some(arr);
        regs.src = Some(NonNull::new(&mut arr_slot as *mut Pointer as *mut u8).unwrap());
        regs.mid = Some(regs.imm_mid_ptr());
        unsafe { write::<i32>(regs.mid.unwrap(), 1) };
        let out = Box::leak(Box::new(0i32));
        regs.dest = Some(NonNull::new(out as *mut i32 as *mut u8).unwrap());

        indw(&mut regs).unwrap();
        assert_eq!(*out, 99);
        heap::dec(Some(arr));
    }

    #[test]
    fn indw_out_of_range_panics() {
        let td = TypeDescriptor::plain(4);
        let arr = array::alloc_array(&td, 1, Colour::White);
        let mut regs = Registers::new();
        let mut arr_slot: Pointer = Some(arr);
        regs.src = Some(NonNull::new(&mut arr_slot as *mut Pointer as *mut u8).unwrap());
        regs.mid = Some(regs.imm_mid_ptr());
        unsafe { write::<i32>(regs.mid.unwrap(), 5) };
        let out = Box::leak(Box::new(0i32));
        regs.dest = Some(NonNull::new(out as *mut i32 as *mut u8).unwrap());
        assert_eq!(indw(&mut regs), Err(PanicReason::IndexOutOfRange));
        heap::dec(Some(arr));
    }
}
