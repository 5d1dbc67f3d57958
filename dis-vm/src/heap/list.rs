//! Dis lists: singly-linked chains of cons cells.
//!
//! A cell is an ordinary two-word [`TypeDescriptor`]-typed allocation
//! (`head`, `tail`), so it reuses the generic refcount/GC machinery exactly
//! like a user-defined record — no list-specific tracing code is needed.

use std::ptr::NonNull;
use std::sync::Arc;

use super::{allocate, Colour, Pointer, TypeDescriptor};

const WORD: usize = std::mem::size_of::<usize>();

/// Builds the type descriptor for a cons cell whose head slot holds a
/// pointer (`consp`/`consm`/`consmp`) or a plain value (`consb`/`consw`/
/// `consf`/`consl`).
pub fn cons_cell_type_desc(head_is_pointer: bool) -> Arc<TypeDescriptor> {
    let bitmap = if head_is_pointer {
        // bit 0: head is a pointer. bit 1: tail is always a pointer.
        vec![0xc0]
    } else {
        vec![0x40]
    };
    Arc::new(TypeDescriptor {
        size_in_bytes: WORD * 2,
        pointer_bitmap: bitmap,
        finalizer: None,
    })
}

/// Conses a new cell onto `tail`, copying `head_bytes` into the head slot
/// verbatim (the engine decides whether those bytes are a `Pointer` to
/// `inc`, per the opcode family used).
pub fn cons(head_bytes: &[u8], tail: Pointer, head_is_pointer: bool, colour: Colour) -> NonNull<u8> {
    let td = cons_cell_type_desc(head_is_pointer);
    let cell = allocate(td, colour);
    unsafe {
        std::ptr::copy_nonoverlapping(head_bytes.as_ptr(), cell.as_ptr(), head_bytes.len());
        (cell.as_ptr().add(WORD) as *mut Pointer).write(tail);
    }
    cell
}

/// Reads the head slot's raw bytes (always one word wide).
pub fn head(cell: NonNull<u8>) -> [u8; WORD] {
    unsafe {
        let mut buf = [0u8; WORD];
        std::ptr::copy_nonoverlapping(cell.as_ptr(), buf.as_mut_ptr(), WORD);
        buf
    }
}

/// Reads the tail pointer.
pub fn tail(cell: NonNull<u8>) -> Pointer {
    unsafe { (cell.as_ptr().add(WORD) as *const Pointer).read() }
}

/// Length of the list starting at `head`, following tail pointers.
pub fn len(mut head: Pointer) -> usize {
    let mut count = 0;
    while let Some(cell) = head {
        count += 1;
        head = tail(cell);
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::dec;

    #[test]
    fn cons_and_walk() {
        let word_bytes = 7i32.to_ne_bytes();
        let mut buf = [0u8; WORD];
        buf[..4].copy_from_slice(&word_bytes);
        let c1 = cons(&buf, None, false, Colour::White);
        let c2 = cons(&buf, Some(c1), false, Colour::White);

        assert_eq!(len(Some(c2)), 2);
        assert_eq!(tail(c2), Some(c1));
        assert_eq!(tail(c1), None);

        dec(Some(c2));
        dec(Some(c1));
    }
}
