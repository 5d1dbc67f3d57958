//! Data-section bytecode: a tiny stack machine that seeds a module's MP
//! template with its literal values (§4.B, §6).

use std::sync::Arc;

use dis_asm::{read_operand, read_word};

use crate::consts::DATA_SECTION_STACK_DEPTH;
use crate::error::ModuleLoadError;
use crate::heap::{self, array, header::TypeDescriptor, string, Pointer};

/// One decoded data-section item, as laid out in §6.
#[derive(Debug, Clone)]
pub enum DataOp {
    /// `count` raw bytes at `offset`.
    Bit8 { offset: i32, bytes: Vec<u8> },
    /// `count` 32-bit words at `offset`.
    Bit32 { offset: i32, words: Vec<i32> },
    /// A UTF-8 byte string at `offset` (a string pointer is written there).
    Utf8 { offset: i32, bytes: Vec<u8> },
    /// `count` 64-bit values (reals or bigs; both are two words wide) at
    /// `offset`. Whether to interpret the bits as `f64` or `i64` depends on
    /// whether this was a `4` (`real64`) or `8` (`bit64`) item; both are
    /// stored as raw 8-byte buffers here and written verbatim.
    Bit64 { offset: i32, segments: Vec<[u8; 8]> },
    /// Allocates an array of `element_count` elements of `element_type` and
    /// writes its pointer at `offset`.
    Array {
        offset: i32,
        element_type: i32,
        element_count: i32,
    },
    /// Pushes the current base, then rebases into the array pointer
    /// currently stored at `offset`, at `array_index`.
    SetArray { offset: i32, array_index: i32 },
    /// Pops the base stack, restoring the previous base.
    RestoreLoadAddress,
}

/// Decodes the raw data-section bytes captured by the module reader into a
/// sequence of [`DataOp`]s.
pub fn decode(bytes: &[u8]) -> Result<Vec<DataOp>, ModuleLoadError> {
    let mut ops = Vec::new();
    let mut pos = 0usize;
    loop {
        let code = *bytes
            .get(pos)
            .ok_or_else(|| ModuleLoadError::new("truncated data section"))?;
        pos += 1;
        if code == 0 {
            break;
        }
        let item_type = (code & 0xf0) >> 4;
        let mut count = (code & 0x0f) as i32;
        if count == 0 {
            let (c, n) = read_operand(&bytes[pos..]).map_err(|_| ModuleLoadError::new("bad data item count"))?;
            pos += n;
            count = c;
        }
        let (offset, n) = read_operand(&bytes[pos..]).map_err(|_| ModuleLoadError::new("bad data item offset"))?;
        pos += n;

        match item_type {
            1 => {
                let len = count.max(0) as usize;
                let slice = bytes
                    .get(pos..pos + len)
                    .ok_or_else(|| ModuleLoadError::new("truncated bit8 data"))?;
                pos += len;
                ops.push(DataOp::Bit8 {
                    offset,
                    bytes: slice.to_vec(),
                });
            }
            2 => {
                let mut words = Vec::with_capacity(count.max(0) as usize);
                for _ in 0..count.max(0) {
                    let (w, n) = read_word(&bytes[pos..]).map_err(|_| ModuleLoadError::new("truncated bit32 data"))?;
                    pos += n;
                    words.push(w);
                }
                ops.push(DataOp::Bit32 { offset, words });
            }
            3 => {
                let len = count.max(0) as usize;
                let slice = bytes
                    .get(pos..pos + len)
                    .ok_or_else(|| ModuleLoadError::new("truncated utf8 data"))?;
                pos += len;
                ops.push(DataOp::Utf8 {
                    offset,
                    bytes: slice.to_vec(),
                });
            }
            4 | 8 => {
                let mut segments = Vec::with_capacity(count.max(0) as usize);
                for _ in 0..count.max(0) {
                    let (hi, n1) = read_word(&bytes[pos..]).map_err(|_| ModuleLoadError::new("truncated 8-byte segment"))?;
                    pos += n1;
                    let (lo, n2) = read_word(&bytes[pos..]).map_err(|_| ModuleLoadError::new("truncated 8-byte segment"))?;
                    pos += n2;
                    let mut seg = [0u8; 8];
                    seg[0..4].copy_from_slice(&hi.to_be_bytes());
                    seg[4..8].copy_from_slice(&lo.to_be_bytes());
                    segments.push(seg);
                }
                ops.push(DataOp::Bit64 { offset, segments });
            }
            5 => {
                let (element_type, n1) = read_word(&bytes[pos..]).map_err(|_| ModuleLoadError::new("truncated array item"))?;
                pos += n1;
                let (element_count, n2) = read_word(&bytes[pos..]).map_err(|_| ModuleLoadError::new("truncated array item"))?;
                pos += n2;
                ops.push(DataOp::Array {
                    offset,
                    element_type,
                    element_count,
                });
            }
            6 => {
                let (array_index, n1) = read_word(&bytes[pos..]).map_err(|_| ModuleLoadError::new("truncated set-array item"))?;
                pos += n1;
                ops.push(DataOp::SetArray { offset, array_index });
            }
            7 => ops.push(DataOp::RestoreLoadAddress),
            _ => return Err(ModuleLoadError::new("unknown data item type")),
        }
    }
    Ok(ops)
}

/// Executes decoded data-section ops against the module's MP template,
/// using `type_descs` (already built `Arc<TypeDescriptor>`s, indexed by
/// type number) to allocate array literals.
///
/// # Safety
/// `mp` must be a payload pointer at least as large as the module's
/// declared `data_size`, and every offset named by the ops must fall
/// within it (validated already by the reader's dry-run pass, but not
/// re-checked here beyond a bounds assertion).
pub fn run_data_section(
    mp: *mut u8,
    mp_len: usize,
    ops: &[DataOp],
    type_descs: &[std::sync::Arc<TypeDescriptor>],
) -> Result<(), ModuleLoadError> {
    let mut base_stack: Vec<*mut u8> = Vec::with_capacity(DATA_SECTION_STACK_DEPTH);
    let mut base = mp;
    // `set_array` always immediately follows the `array` item whose literal
    // it indexes into (the data-section grammar never interleaves other
    // items between them), so tracking the most recently created array's
    // element stride here is sufficient without storing per-allocation
    // element size on the array itself.
    let mut last_array_element_size: Option<usize> = None;

    let check = |offset: i32, len: usize| -> Result<usize, ModuleLoadError> {
        if offset < 0 {
            return Err(ModuleLoadError::new("negative data offset"));
        }
        let offset = offset as usize;
        if offset + len > mp_len {
            return Err(ModuleLoadError::new("data offset out of range"));
        }
        Ok(offset)
    };

    for op in ops {
        match op {
            DataOp::Bit8 { offset, bytes } => {
                let off = check(*offset, bytes.len())?;
                unsafe {
                    std::ptr::copy_nonoverlapping(bytes.as_ptr(), base.add(off), bytes.len());
                }
            }
            DataOp::Bit32 { offset, words } => {
                let off = check(*offset, words.len() * 4)?;
                unsafe {
                    for (i, w) in words.iter().enumerate() {
                        (base.add(off + i * 4) as *mut i32).write_unaligned(*w);
                    }
                }
            }
            DataOp::Utf8 { offset, bytes } => {
                let off = check(*offset, std::mem::size_of::<Pointer>())?;
                let s = String::from_utf8_lossy(bytes);
                let ptr = string::alloc_str(&s, heap::Colour::White);
                unsafe {
                    (base.add(off) as *mut Pointer).write(Some(ptr));
                }
            }
            DataOp::Bit64 { offset, segments } => {
                let off = check(*offset, segments.len() * 8)?;
                unsafe {
                    for (i, seg) in segments.iter().enumerate() {
                        std::ptr::copy_nonoverlapping(seg.as_ptr(), base.add(off + i * 8), 8);
                    }
                }
            }
            DataOp::Array {
                offset,
                element_type,
                element_count,
            } => {
                let off = check(*offset, std::mem::size_of::<Pointer>())?;
                let element_td = type_descs
                    .get(*element_type as usize)
                    .ok_or_else(|| ModuleLoadError::new("array literal: invalid element type"))?;
                let ptr = array::alloc_array(element_td, element_count.max(0) as usize, heap::Colour::White);
                unsafe {
                    (base.add(off) as *mut Pointer).write(Some(ptr));
                }
                last_array_element_size = Some(element_td.size_in_bytes);
            }
            DataOp::SetArray { offset, array_index } => {
                let off = check(*offset, std::mem::size_of::<Pointer>())?;
                let array_ptr = unsafe { (base.add(off) as *const Pointer).read() }
                    .ok_or_else(|| ModuleLoadError::new("set-array: nil array pointer"))?;
                let element_size = last_array_element_size
                    .ok_or_else(|| ModuleLoadError::new("set-array: no preceding array literal"))?;
                let index = *array_index;
                if index < 0 {
                    return Err(ModuleLoadError::new("set-array: negative index"));
                }
                if base_stack.len() >= DATA_SECTION_STACK_DEPTH {
                    return Err(ModuleLoadError::new("data section array-base stack overflow"));
                }
                base_stack.push(base);
                base = unsafe { array_ptr.as_ptr().add(index as usize * element_size) };
            }
            DataOp::RestoreLoadAddress => {
                base = base_stack
                    .pop()
                    .ok_or_else(|| ModuleLoadError::new("data section array-base stack underflow"))?;
            }
        }
    }
    Ok(())
}
