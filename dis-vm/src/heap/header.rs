//! Allocation header and type descriptor: the shared layout underlying
//! every heap-allocated Dis value.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

/// Epoch colour used by the tricolour collector, also the "reachable and
/// scanned" marker for the current epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumIter)]
pub enum Colour {
    /// Not yet visited this epoch.
    White,
    /// Reached but its own pointer fields not yet scanned.
    Grey,
    /// Reached and fully scanned.
    Black,
}

/// Static, per-type layout information: size, which words hold pointers,
/// and an optional finalizer run before the payload is freed.
///
/// One descriptor is built per module type-section entry and shared (via
/// `Arc`) across every allocation of that type.
pub struct TypeDescriptor {
    /// Size of the payload in bytes, word-aligned.
    pub size_in_bytes: usize,
    /// MSB-first bitmap: bit `i` of byte `i / 8` set means the pointer-sized
    /// word at byte offset `i * size_of::<usize>()` in the payload holds a
    /// heap pointer. Walked eight words (one byte) at a time by
    /// `enum_pointer_fields`.
    pub pointer_bitmap: Vec<u8>,
    /// Run immediately before the payload's pointer fields are released,
    /// for types (channels, open file handles) with non-heap resources.
    pub finalizer: Option<fn(*mut u8)>,
}

impl TypeDescriptor {
    /// A descriptor for a type with no embedded pointers and no finalizer.
    pub fn plain(size_in_bytes: usize) -> Arc<TypeDescriptor> {
        Arc::new(TypeDescriptor {
            size_in_bytes,
            pointer_bitmap: Vec::new(),
            finalizer: None,
        })
    }

    /// Iterates the byte offsets of every pointer-typed word in the
    /// payload, MSB-first within each bitmap byte, eight words at a time.
    pub fn pointer_offsets(&self) -> impl Iterator<Item = usize> + '_ {
        let word_size = std::mem::size_of::<usize>();
        self.pointer_bitmap.iter().enumerate().flat_map(move |(byte_idx, &bits)| {
            (0..8).filter_map(move |bit| {
                let mask = 0x80u8 >> bit;
                if bits & mask != 0 {
                    Some((byte_idx * 8 + bit) * word_size)
                } else {
                    None
                }
            })
        })
    }
}

/// The header immediately preceding every heap allocation's payload.
///
/// Recovered from a payload pointer by a fixed negative offset
/// (`size_of::<AllocHeader>()`), never carried alongside the pointer.
#[repr(C)]
pub struct AllocHeader {
    pub(crate) type_desc: Arc<TypeDescriptor>,
    pub(crate) refcount: AtomicUsize,
    pub(crate) colour: AtomicU8,
}

impl AllocHeader {
    pub(crate) fn new(type_desc: Arc<TypeDescriptor>, colour: Colour) -> AllocHeader {
        AllocHeader {
            type_desc,
            refcount: AtomicUsize::new(1),
            colour: AtomicU8::new(colour as u8),
        }
    }

    pub(crate) fn colour(&self) -> Colour {
        match self.colour.load(Ordering::Relaxed) {
            0 => Colour::White,
            1 => Colour::Grey,
            _ => Colour::Black,
        }
    }

    pub(crate) fn set_colour(&self, colour: Colour) {
        self.colour.store(colour as u8, Ordering::Relaxed);
    }

    pub(crate) fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Relaxed)
    }
}
