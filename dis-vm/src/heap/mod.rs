//! Typed, reference-counted heap.
//!
//! Every allocation is a payload preceded by an [`AllocHeader`]; the header
//! is never carried alongside a pointer, only recovered from it by
//! subtracting `size_of::<AllocHeader>()`. This mirrors the reference
//! runtime's `vm_alloc_t` base-class layout, where the allocation header
//! lives immediately before the typed payload `this` points at.
//!
//! Safety is maintained by a single choke point: every pointer that enters
//! or leaves this module is a payload pointer produced by [`allocate`] (or
//! `None`, the nil value), and every payload pointer's header is written by
//! [`allocate`] before the pointer is handed out. Callers never construct a
//! payload pointer themselves.

pub mod array;
pub mod channel;
pub mod header;
pub mod list;
pub mod string;

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub use header::{AllocHeader, Colour, TypeDescriptor};

/// Handle to a heap-allocated Dis value. `None` is the Dis `nil` pointer.
pub type Pointer = Option<NonNull<u8>>;

/// Allocations with a non-empty pointer bitmap, tracked for the GC's sweep
/// phase (§4.H: "objects that contain no pointers are not tracked and rely
/// purely on refcounting"). A flat, lock-guarded `Vec` of addresses is the
/// simplest faithful rendition; an intrusive list would avoid the linear
/// `untrack` scan but isn't warranted at this scale (see `DESIGN.md`).
static TRACKED: parking_lot::Mutex<Vec<usize>> = parking_lot::Mutex::new(Vec::new());

fn track(ptr: NonNull<u8>, type_desc: &TypeDescriptor) {
    if !type_desc.pointer_bitmap.is_empty() {
        TRACKED.lock().push(ptr.as_ptr() as usize);
    }
}

fn untrack(ptr: NonNull<u8>) {
    let addr = ptr.as_ptr() as usize;
    TRACKED.lock().retain(|&a| a != addr);
}

/// Snapshots every currently tracked (pointer-bearing) allocation, for the
/// collector's sweep phase.
pub fn tracked_allocations() -> Vec<NonNull<u8>> {
    TRACKED
        .lock()
        .iter()
        .map(|&a| NonNull::new(a as *mut u8).expect("tracked address is never null"))
        .collect()
}

/// Whether `ptr` is still a live tracked allocation. The collector's sweep
/// re-checks this before dereferencing each candidate: freeing one member
/// of an unreachable cycle can recursively free others via their embedded
/// pointers (§4.H's "recursive decrements of embedded pointers"), so a
/// snapshot taken at the start of sweep may contain addresses already
/// freed by the time sweep reaches them.
pub(crate) fn is_tracked(ptr: NonNull<u8>) -> bool {
    TRACKED.lock().contains(&(ptr.as_ptr() as usize))
}

/// The nil pointer.
pub const fn nil() -> Pointer {
    None
}

fn layout_for(size_in_bytes: usize) -> (Layout, usize) {
    let header_size = std::mem::size_of::<AllocHeader>();
    let align = std::mem::align_of::<AllocHeader>().max(std::mem::align_of::<usize>());
    let total = header_size + size_in_bytes;
    (Layout::from_size_align(total, align).expect("allocation too large"), header_size)
}

/// Recovers the header preceding a payload pointer.
///
/// # Safety
/// `payload` must have been returned by [`allocate`] (directly, or via
/// [`copy`]) and not yet freed by [`dec`].
unsafe fn header_of(payload: NonNull<u8>) -> *mut AllocHeader {
    let header_size = std::mem::size_of::<AllocHeader>();
    payload.as_ptr().sub(header_size) as *mut AllocHeader
}

/// Allocates a zero-filled payload of the given type, with refcount one.
///
/// Out-of-memory is treated as a fatal system error, matching the reference
/// runtime's `calloc_memory` contract: there is no recoverable path for it.
pub fn allocate(type_desc: Arc<TypeDescriptor>, colour: Colour) -> NonNull<u8> {
    let (layout, header_size) = layout_for(type_desc.size_in_bytes);
    unsafe {
        let base = alloc_zeroed(layout);
        if base.is_null() {
            handle_alloc_error(layout);
        }
        (base as *mut AllocHeader).write(AllocHeader::new(Arc::clone(&type_desc), colour));
        let ptr = NonNull::new_unchecked(base.add(header_size));
        track(ptr, &type_desc);
        ptr
    }
}

/// Increments an allocation's refcount. A no-op on nil.
pub fn inc(ptr: Pointer) {
    if let Some(p) = ptr {
        unsafe {
            (*header_of(p)).refcount.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Decrements an allocation's refcount, freeing it (and recursively
/// decrementing every embedded pointer field) when it reaches zero. A
/// no-op on nil.
pub fn dec(ptr: Pointer) {
    let Some(p) = ptr else { return };
    unsafe {
        let header = header_of(p);
        if (*header).refcount.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        destroy(p);
    }
}

/// Runs typed destruction on a payload whose refcount has just reached
/// zero: walks its pointer bitmap decrementing every embedded pointer,
/// invokes the finalizer, then frees the raw memory.
///
/// # Safety
/// `ptr` must be the sole remaining reference; callers must not touch it
/// afterward.
unsafe fn destroy(ptr: NonNull<u8>) {
    let header = header_of(ptr);
    let type_desc = Arc::clone(&(*header).type_desc);
    untrack(ptr);

    for offset in type_desc.pointer_offsets() {
        let field = ptr.as_ptr().add(offset) as *mut Pointer;
        dec(field.read());
    }

    if let Some(finalizer) = type_desc.finalizer {
        finalizer(ptr.as_ptr());
    }

    let header_size = std::mem::size_of::<AllocHeader>();
    let (layout, _) = layout_for(type_desc.size_in_bytes);
    let base = ptr.as_ptr().sub(header_size);
    std::ptr::drop_in_place(base as *mut AllocHeader);
    dealloc(base, layout);
}

/// Bitcopies the payload into a fresh allocation of a refcount of one, then
/// increments the refcount of every pointer field it embeds (since both
/// copies now reference them).
pub fn copy(ptr: NonNull<u8>) -> NonNull<u8> {
    unsafe {
        let header = header_of(ptr);
        let type_desc = Arc::clone(&(*header).type_desc);
        let new_ptr = allocate(Arc::clone(&type_desc), (*header).colour());
        std::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), type_desc.size_in_bytes);

        for offset in type_desc.pointer_offsets() {
            let field = new_ptr.as_ptr().add(offset) as *mut Pointer;
            inc(field.read());
        }

        new_ptr
    }
}

/// Invokes `f` with every non-nil pointer field embedded in `ptr`'s
/// payload, per its type descriptor's bitmap. The single choke-point for
/// refcount maintenance and GC tracing referenced by the root scanner.
pub fn enum_pointer_fields(ptr: NonNull<u8>, mut f: impl FnMut(Pointer)) {
    unsafe {
        let header = header_of(ptr);
        let type_desc = &(*header).type_desc;
        for offset in type_desc.pointer_offsets() {
            let field = ptr.as_ptr().add(offset) as *mut Pointer;
            f(field.read());
        }
    }
}

/// Reads the type descriptor of an allocation.
pub fn type_desc_of(ptr: NonNull<u8>) -> Arc<TypeDescriptor> {
    unsafe { Arc::clone(&(*header_of(ptr)).type_desc) }
}

/// Reads the current refcount of an allocation. Test/debug use only.
pub fn refcount_of(ptr: NonNull<u8>) -> usize {
    unsafe { (*header_of(ptr)).refcount() }
}

/// Reads the GC colour of an allocation.
pub fn colour_of(ptr: NonNull<u8>) -> Colour {
    unsafe { (*header_of(ptr)).colour() }
}

/// Sets the GC colour of an allocation.
pub fn set_colour(ptr: NonNull<u8>, colour: Colour) {
    unsafe { (*header_of(ptr)).set_colour(colour) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pointer_free_allocations_are_not_tracked() {
        let td = TypeDescriptor::plain(16);
        let before = tracked_allocations().len();
        let ptr = allocate(td, Colour::White);
        assert_eq!(tracked_allocations().len(), before);
        dec(Some(ptr));
    }

    #[test]
    fn pointer_bearing_allocations_are_tracked_until_freed() {
        let td = Arc::new(TypeDescriptor {
            size_in_bytes: std::mem::size_of::<usize>(),
            pointer_bitmap: vec![0x80],
            finalizer: None,
        });
        let before = tracked_allocations().len();
        let ptr = allocate(td, Colour::White);
        assert_eq!(tracked_allocations().len(), before + 1);
        assert!(tracked_allocations().contains(&ptr));
        dec(Some(ptr));
        assert_eq!(tracked_allocations().len(), before);
    }

    #[test]
    fn fresh_allocation_is_zero_filled_with_refcount_one() {
        let td = TypeDescriptor::plain(16);
        let ptr = allocate(td, Colour::White);
        assert_eq!(refcount_of(ptr), 1);
        unsafe {
            let slice = std::slice::from_raw_parts(ptr.as_ptr(), 16);
            assert!(slice.iter().all(|&b| b == 0));
        }
        dec(Some(ptr));
    }

    #[test]
    fn copy_increments_embedded_pointer_refcounts() {
        let word_size = std::mem::size_of::<usize>();
        let inner_td = TypeDescriptor::plain(word_size);
        let inner = allocate(Arc::clone(&inner_td), Colour::White);

        let mut bitmap = vec![0u8; 1];
        bitmap[0] = 0x80; // first word is a pointer
        let outer_td = Arc::new(TypeDescriptor {
            size_in_bytes: word_size,
            pointer_bitmap: bitmap,
            finalizer: None,
        });
        let outer = allocate(Arc::clone(&outer_td), Colour::White);
        unsafe {
            (outer.as_ptr() as *mut Pointer).write(Some(inner));
        }
        inc(Some(inner)); // outer now owns a reference too

        assert_eq!(refcount_of(inner), 2);
        let copied = copy(outer);
        assert_eq!(refcount_of(inner), 3);

        dec(Some(outer));
        dec(Some(copied));
        assert_eq!(refcount_of(inner), 1);
        dec(Some(inner));
    }

    #[test]
    fn dec_to_zero_frees_and_runs_finalizer() {
        use std::sync::atomic::AtomicBool;
        static RAN: AtomicBool = AtomicBool::new(false);
        fn finalizer(_: *mut u8) {
            RAN.store(true, Ordering::SeqCst);
        }

        let td = Arc::new(TypeDescriptor {
            size_in_bytes: 8,
            pointer_bitmap: Vec::new(),
            finalizer: Some(finalizer),
        });
        let ptr = allocate(td, Colour::White);
        dec(Some(ptr));
        assert!(RAN.load(Ordering::SeqCst));
    }
}
