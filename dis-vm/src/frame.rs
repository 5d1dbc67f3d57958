//! Paged frame stack (§4.C).
//!
//! §9's design note on the "previous-module-reference" slot sanctions
//! representing it, and the rest of a frame's fixed header, as ordinary
//! Rust fields rather than raw bytes at a fixed offset: "represent as
//! `Option<ModRef>` on each frame and rely on the pop path to restore
//! thread registers." This module follows that note for all four header
//! words (previous pc, previous frame pointer, previous module reference,
//! reserved), and reserves raw, bump-allocated stack-page bytes only for
//! the frame's own typed payload.

use std::sync::Arc;

use dis_asm::PanicReason;
use dis_types::Pc;

use crate::consts::STACK_PAGE_SIZE;
use crate::heap::{self, header::TypeDescriptor, Pointer};
use crate::module::ModRef;

/// Index of a frame within a [`Stack`]'s lifetime. Stable across pushes;
/// reused only after the stack has been fully unwound past it (frames are
/// never recycled while still reachable).
pub type FrameId = usize;

struct Page {
    bytes: Box<[u8]>,
    used: usize,
}

impl Page {
    fn new() -> Page {
        Page {
            bytes: vec![0u8; STACK_PAGE_SIZE].into_boxed_slice(),
            used: 0,
        }
    }
}

/// One activation record: fixed header fields plus a typed, bitmap-traced
/// payload living in a stack page.
pub struct Frame {
    /// Program counter to resume at in the caller, once this frame pops.
    pub prev_pc: Pc,
    /// The frame this one was pushed on top of, or `None` at the stack
    /// root.
    pub prev_fp: Option<FrameId>,
    /// Set only when this frame represents a module-boundary call; restores
    /// the thread's current module reference and MP base on pop.
    pub prev_module_ref: Option<Arc<ModRef>>,
    type_desc: Arc<TypeDescriptor>,
    page_index: usize,
    byte_offset: usize,
}

/// Paged, singly-linked (newest to oldest) activation-record stack for one
/// thread.
pub struct Stack {
    pages: Vec<Page>,
    frames: Vec<Frame>,
    top: Option<FrameId>,
}

impl Stack {
    /// A fresh stack with one empty page.
    pub fn new() -> Stack {
        Stack {
            pages: vec![Page::new()],
            frames: Vec::new(),
            top: None,
        }
    }

    /// Reserves space for a frame of `type_desc`'s size, zero-filled, but
    /// does not make it the current frame. Returns `StackFrameTooLarge` if
    /// the frame cannot fit even in an empty page.
    pub fn alloc_frame(&mut self, type_desc: Arc<TypeDescriptor>) -> Result<FrameId, PanicReason> {
        let size = type_desc.size_in_bytes;
        if size > STACK_PAGE_SIZE {
            return Err(PanicReason::StackFrameTooLarge);
        }

        let current = self.pages.last().unwrap();
        if current.used + size > STACK_PAGE_SIZE {
            self.pages.push(Page::new());
        }

        let page_index = self.pages.len() - 1;
        let page = &mut self.pages[page_index];
        let byte_offset = page.used;
        page.used += size;

        let id = self.frames.len();
        self.frames.push(Frame {
            prev_pc: dis_types::INVALID_PC,
            prev_fp: None,
            prev_module_ref: None,
            type_desc,
            page_index,
            byte_offset,
        });
        Ok(id)
    }

    /// Raw pointer to the frame's typed payload, valid until the frame (or
    /// an older one) is popped.
    pub fn payload_ptr(&self, id: FrameId) -> *mut u8 {
        let frame = &self.frames[id];
        unsafe { self.pages[frame.page_index].bytes.as_ptr().add(frame.byte_offset) as *mut u8 }
    }

    /// The type descriptor governing a frame's payload.
    pub fn type_desc(&self, id: FrameId) -> &Arc<TypeDescriptor> {
        &self.frames[id].type_desc
    }

    /// Activates a previously allocated frame: records the caller's pc and
    /// (optionally) its module reference, links it above the current top.
    pub fn push_frame(&mut self, id: FrameId, prev_pc: Pc, prev_module_ref: Option<Arc<ModRef>>) {
        self.frames[id].prev_pc = prev_pc;
        self.frames[id].prev_fp = self.top;
        self.frames[id].prev_module_ref = prev_module_ref;
        self.top = Some(id);
    }

    /// The currently active frame, if any.
    pub fn peek_frame(&self) -> Option<FrameId> {
        self.top
    }

    /// Iterates active frame ids from the top of the stack down to the
    /// root, for the collector's root scan (§4.H) — frames already popped
    /// remain in `self.frames` (their ids are never reused) but are no
    /// longer reachable through `prev_fp` and so aren't visited.
    pub fn active_frames(&self) -> impl Iterator<Item = FrameId> + '_ {
        let mut next = self.top;
        std::iter::from_fn(move || {
            let id = next?;
            next = self.frames[id].prev_fp;
            Some(id)
        })
    }

    /// A frame's previous-module-reference, if this is a module-boundary
    /// call's frame — one of the collector's root sources.
    pub fn prev_module_ref(&self, id: FrameId) -> Option<&Arc<ModRef>> {
        self.frames[id].prev_module_ref.as_ref()
    }

    /// Releases the top frame, decrementing refcounts of every embedded
    /// pointer field (per its type descriptor's bitmap) and dropping the
    /// owning page if the new top lives on an earlier one. Returns the
    /// popped frame's header fields (`prev_pc`, `prev_module_ref`) for the
    /// caller to restore thread registers from.
    pub fn pop_frame(&mut self) -> Option<(Pc, Option<Arc<ModRef>>)> {
        let id = self.top?;
        let frame_page = self.frames[id].page_index;

        {
            let payload = self.payload_ptr(id);
            let type_desc = Arc::clone(&self.frames[id].type_desc);
            for offset in type_desc.pointer_offsets() {
                unsafe {
                    let field = payload.add(offset) as *mut Pointer;
                    heap::dec(field.read());
                }
            }
        }

        let prev_pc = self.frames[id].prev_pc;
        let prev_module_ref = self.frames[id].prev_module_ref.take();
        self.top = self.frames[id].prev_fp;

        let new_top_page = self.top.map(|t| self.frames[t].page_index);
        if new_top_page != Some(frame_page) && frame_page == self.pages.len() - 1 {
            self.pages.pop();
        }

        Some((prev_pc, prev_module_ref))
    }
}

impl Default for Stack {
    fn default() -> Stack {
        Stack::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_td(size: usize) -> Arc<TypeDescriptor> {
        Arc::new(TypeDescriptor {
            size_in_bytes: size,
            pointer_bitmap: Vec::new(),
            finalizer: None,
        })
    }

    #[test]
    fn alloc_push_pop_round_trip() {
        let mut stack = Stack::new();
        let f1 = stack.alloc_frame(plain_td(16)).unwrap();
        stack.push_frame(f1, 0, None);
        assert_eq!(stack.peek_frame(), Some(f1));

        let f2 = stack.alloc_frame(plain_td(16)).unwrap();
        stack.push_frame(f2, 5, None);
        assert_eq!(stack.peek_frame(), Some(f2));

        let (prev_pc, _) = stack.pop_frame().unwrap();
        assert_eq!(prev_pc, 0);
        assert_eq!(stack.peek_frame(), Some(f1));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut stack = Stack::new();
        assert_eq!(
            stack.alloc_frame(plain_td(STACK_PAGE_SIZE + 1)),
            Err(PanicReason::StackFrameTooLarge)
        );
    }

    #[test]
    fn payload_is_zero_filled() {
        let mut stack = Stack::new();
        let f = stack.alloc_frame(plain_td(8)).unwrap();
        let ptr = stack.payload_ptr(f);
        let slice = unsafe { std::slice::from_raw_parts(ptr, 8) };
        assert!(slice.iter().all(|&b| b == 0));
    }

    #[test]
    fn crossing_a_page_boundary_allocates_a_new_page() {
        let mut stack = Stack::new();
        let big = STACK_PAGE_SIZE - 8;
        let f1 = stack.alloc_frame(plain_td(big)).unwrap();
        stack.push_frame(f1, 0, None);
        assert_eq!(stack.pages.len(), 1);

        let f2 = stack.alloc_frame(plain_td(big)).unwrap();
        stack.push_frame(f2, 0, None);
        assert_eq!(stack.pages.len(), 2);

        stack.pop_frame();
        assert_eq!(stack.pages.len(), 1);
    }
}
