//! VM-wide tunable constants.

use core::mem;

use dis_types::DisWord;

/// Size of a stack page, in bytes. Frames bump-allocate within a page;
/// a frame that would exceed this triggers a new page.
pub const STACK_PAGE_SIZE: usize = 4096;

/// Fixed header words at the start of every frame: previous PC, previous
/// frame pointer, previous module reference, one reserved word.
pub const FRAME_HEADER_WORDS: usize = 4;

/// Length of a word, in bytes.
pub const WORD_SIZE: usize = mem::size_of::<DisWord>();

/// Maximum allowed type-section bitmap length, in bytes (§6).
pub const MAX_BITMAP_LENGTH: usize = 128 * 1024;

/// Depth of the data-section array-base stack (§4.B).
pub const DATA_SECTION_STACK_DEPTH: usize = 4;

/// Magic number for an unsigned module.
pub const MAGIC_UNSIGNED: u32 = 819_248;

/// Magic number for a signed module.
pub const MAGIC_SIGNED: u32 = 923_426;

/// `has_import` flag bit in the header's runtime-flags field.
pub const RUNTIME_FLAG_HAS_IMPORT: u32 = 1 << 6;

/// `has_handler` flag bit in the header's runtime-flags field.
pub const RUNTIME_FLAG_HAS_HANDLER: u32 = 1 << 5;

/// Obsolete deprecated-import flag; modules carrying it are rejected.
pub const RUNTIME_FLAG_HAS_IMPORT_DEPRECATED: u32 = 1 << 4;

/// Sentinel PC/type-index value meaning "none" in the module header and
/// handler section.
pub const NONE_INDEX: i32 = -1;

/// Default worker thread count.
pub const DEFAULT_WORKER_THREADS: usize = 1;

/// Default instruction quantum per scheduling slice.
pub const DEFAULT_QUANTUM: u32 = 5000;

/// Low bits of the GC epoch counter checked by workers to decide whether a
/// collection is due.
pub const GC_EPOCH_MASK: u64 = 0xff;
