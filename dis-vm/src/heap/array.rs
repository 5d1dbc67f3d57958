//! Dis arrays: fixed-length, element-typed, contiguous allocations.
//!
//! An array's [`TypeDescriptor`] is built once at allocation time by tiling
//! the element type's own pointer bitmap across `len` elements, so the
//! generic refcount/GC walk in [`super`] needs no array-specific case.

use std::ptr::NonNull;
use std::sync::Arc;

use super::{allocate, Colour, TypeDescriptor};

/// Builds the type descriptor for an array of `len` elements of
/// `element_td`.
pub fn array_type_desc(element_td: &Arc<TypeDescriptor>, len: usize) -> Arc<TypeDescriptor> {
    let elem_size = element_td.size_in_bytes;
    let total_size = elem_size * len;

    if element_td.pointer_bitmap.is_empty() {
        return TypeDescriptor::plain(total_size);
    }

    let bits_per_elem = elem_size / std::mem::size_of::<usize>();
    let mut bitmap = vec![0u8; (bits_per_elem * len).div_ceil(8)];
    for i in 0..len {
        for bit in 0..bits_per_elem {
            let elem_byte = bit / 8;
            let elem_mask = 0x80u8 >> (bit % 8);
            if element_td.pointer_bitmap.get(elem_byte).copied().unwrap_or(0) & elem_mask != 0 {
                let global_bit = i * bits_per_elem + bit;
                bitmap[global_bit / 8] |= 0x80u8 >> (global_bit % 8);
            }
        }
    }

    Arc::new(TypeDescriptor {
        size_in_bytes: total_size,
        pointer_bitmap: bitmap,
        finalizer: None,
    })
}

/// Allocates a zero-filled array. `newaz`/`newa` share this; the reference
/// runtime's distinction between them is about whether the caller also
/// wants the slots explicitly re-zeroed post-construction, moot here since
/// [`allocate`] already zero-fills.
pub fn alloc_array(
    element_td: &Arc<TypeDescriptor>,
    len: usize,
    colour: Colour,
) -> NonNull<u8> {
    allocate(array_type_desc(element_td, len), colour)
}

/// Number of elements, derived from the array's own byte size and the
/// element size passed by the caller (the element type isn't retrievable
/// from the array's tiled descriptor alone).
pub fn len(ptr: NonNull<u8>, element_size: usize) -> usize {
    let td = super::type_desc_of(ptr);
    td.size_in_bytes / element_size
}

/// Byte offset of element `index`.
pub fn element_offset(index: usize, element_size: usize) -> usize {
    index * element_size
}

/// Copies `count` elements from `src` (at `src_offset`) into `dest` (at
/// `dest_offset`), both measured in elements, bumping refcounts of any
/// pointer-typed elements moved into `dest`'s surviving slots... note: the
/// engine layer is responsible for the surrounding refcount bookkeeping of
/// overwritten destination slots; this just moves bytes.
pub fn copy_elements(
    src: NonNull<u8>,
    src_offset: usize,
    dest: NonNull<u8>,
    dest_offset: usize,
    element_size: usize,
    count: usize,
) {
    unsafe {
        let src_ptr = src.as_ptr().add(src_offset * element_size);
        let dest_ptr = dest.as_ptr().add(dest_offset * element_size);
        std::ptr::copy(src_ptr, dest_ptr, count * element_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::dec;

    #[test]
    fn plain_element_array_has_no_bitmap() {
        let byte_td = TypeDescriptor::plain(1);
        let td = array_type_desc(&byte_td, 10);
        assert!(td.pointer_bitmap.is_empty());
        assert_eq!(td.size_in_bytes, 10);
    }

    #[test]
    fn pointer_element_array_tiles_bitmap() {
        let word = std::mem::size_of::<usize>();
        let ptr_td = Arc::new(TypeDescriptor {
            size_in_bytes: word,
            pointer_bitmap: vec![0x80],
            finalizer: None,
        });
        let td = array_type_desc(&ptr_td, 9);
        let offsets: Vec<usize> = td.pointer_offsets().collect();
        assert_eq!(offsets, (0..9).map(|i| i * word).collect::<Vec<_>>());
    }

    #[test]
    fn alloc_and_index_roundtrip() {
        let byte_td = TypeDescriptor::plain(1);
        let ptr = alloc_array(&byte_td, 4, Colour::White);
        assert_eq!(len(ptr, 1), 4);
        dec(Some(ptr));
    }
}
