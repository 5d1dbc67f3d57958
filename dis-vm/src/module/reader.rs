//! Parses a module binary (§6) into a [`ParsedModule`].

use dis_asm::{read_operand, read_word, Instruction};

use crate::consts::{
    MAGIC_SIGNED, MAGIC_UNSIGNED, MAX_BITMAP_LENGTH, NONE_INDEX, RUNTIME_FLAG_HAS_IMPORT_DEPRECATED,
};
use crate::error::ModuleLoadError;

use super::format::{ExportEntry, HandlerEntry, ImportEntry, ModuleHeader, ParsedModule, TypeEntry};

/// A forward-only cursor over a module's bytes.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Cursor<'a> {
        Cursor { bytes, pos: 0 }
    }

    fn remaining(&self) -> &'a [u8] {
        &self.bytes[self.pos..]
    }

    fn operand(&mut self, what: &str) -> Result<i32, ModuleLoadError> {
        let (value, consumed) =
            read_operand(self.remaining()).map_err(|_| ModuleLoadError::new(format!("failed to read {what}")))?;
        self.pos += consumed;
        Ok(value)
    }

    fn word(&mut self, what: &str) -> Result<i32, ModuleLoadError> {
        let (value, consumed) =
            read_word(self.remaining()).map_err(|_| ModuleLoadError::new(format!("failed to read {what}")))?;
        self.pos += consumed;
        Ok(value)
    }

    fn byte(&mut self, what: &str) -> Result<u8, ModuleLoadError> {
        let b = *self
            .bytes
            .get(self.pos)
            .ok_or_else(|| ModuleLoadError::new(format!("failed to read {what}")))?;
        self.pos += 1;
        Ok(b)
    }

    fn bytes(&mut self, len: usize, what: &str) -> Result<Vec<u8>, ModuleLoadError> {
        let slice = self
            .bytes
            .get(self.pos..self.pos + len)
            .ok_or_else(|| ModuleLoadError::new(format!("failed to read {what}")))?;
        self.pos += len;
        Ok(slice.to_vec())
    }

    fn cstring(&mut self, what: &str) -> Result<String, ModuleLoadError> {
        let start = self.pos;
        loop {
            let b = self.byte(what)?;
            if b == 0 {
                break;
            }
        }
        Ok(String::from_utf8_lossy(&self.bytes[start..self.pos - 1]).into_owned())
    }
}

fn read_header(cursor: &mut Cursor) -> Result<ModuleHeader, ModuleLoadError> {
    let magic = cursor.operand("magic number")?;
    let signed_module = match magic {
        m if m == MAGIC_UNSIGNED as i32 => false,
        m if m == MAGIC_SIGNED as i32 => true,
        _ => return Err(ModuleLoadError::new("unrecognized magic number")),
    };

    let signature = if signed_module {
        let len = cursor.operand("signature length")?;
        if len < 0 {
            return Err(ModuleLoadError::new("negative signature length"));
        }
        cursor.bytes(len as usize, "signature bytes")?
    } else {
        Vec::new()
    };

    let runtime_flags = cursor.operand("runtime flags")?;
    if runtime_flags & RUNTIME_FLAG_HAS_IMPORT_DEPRECATED as i32 != 0 {
        return Err(ModuleLoadError::new("obsolete deprecated-import flag set"));
    }

    let stack_extent = cursor.operand("stack extent")?;
    let code_size = cursor.operand("code size")?;
    let data_size = cursor.operand("data size")?;
    let type_size = cursor.operand("type size")?;
    let export_size = cursor.operand("export size")?;
    let entry_pc = cursor.operand("entry pc")?;
    let entry_type = cursor.operand("entry type")?;

    Ok(ModuleHeader {
        signed_module,
        signature,
        runtime_flags,
        stack_extent,
        code_size,
        data_size,
        type_size,
        export_size,
        entry_pc,
        entry_type,
    })
}

fn read_code_section(cursor: &mut Cursor, header: &ModuleHeader) -> Result<Vec<Instruction>, ModuleLoadError> {
    let count = header.code_size.max(0) as usize;
    let mut code = Vec::with_capacity(count);
    for _ in 0..count {
        let (instr, consumed) =
            Instruction::decode(cursor.remaining()).map_err(|e| ModuleLoadError::new(format!("bad instruction: {e}")))?;
        cursor.pos += consumed;
        code.push(instr);
    }
    if header.entry_pc != NONE_INDEX && header.entry_pc as usize >= code.len() {
        return Err(ModuleLoadError::new("entry pc outside code section"));
    }
    Ok(code)
}

fn read_type_section(cursor: &mut Cursor, header: &ModuleHeader) -> Result<Vec<TypeEntry>, ModuleLoadError> {
    let count = header.type_size.max(0) as usize;
    let mut types = vec![
        TypeEntry {
            size_in_bytes: 0,
            pointer_bitmap: Vec::new(),
        };
        count
    ];
    for _ in 0..count {
        let number = cursor.operand("type descriptor number")?;
        let size = cursor.operand("type size")?;
        let bitmap_len = cursor.operand("type pointer count")?;
        if bitmap_len < 0 || bitmap_len as usize > MAX_BITMAP_LENGTH {
            return Err(ModuleLoadError::new("type bitmap length out of range"));
        }
        let bitmap = if bitmap_len == 0 {
            Vec::new()
        } else {
            cursor.bytes(bitmap_len as usize, "type pointer bitmap")?
        };
        let index = number as usize;
        if index >= types.len() {
            return Err(ModuleLoadError::new("type descriptor number out of range"));
        }
        types[index] = TypeEntry {
            size_in_bytes: size.max(0) as usize,
            pointer_bitmap: bitmap,
        };
    }
    Ok(types)
}

fn read_data_section(cursor: &mut Cursor, header: &ModuleHeader) -> Result<Vec<u8>, ModuleLoadError> {
    // The data section's own bytecode length isn't separately declared; it
    // runs until a zero terminator byte (§6, §4.B), so this just captures
    // the raw stream for `module::data::run_data_section` to interpret
    // against a freshly allocated MP template of `header.data_size` bytes.
    let start = cursor.pos;
    loop {
        let code = cursor.byte("data item code")?;
        if code == 0 {
            break;
        }
        let item_type = (code & 0xf0) >> 4;
        let mut count = (code & 0x0f) as i32;
        if count == 0 {
            count = cursor.operand("long item count")?;
        }
        let _byte_offset = cursor.operand("data item offset")?;
        match item_type {
            1 => {
                cursor.bytes(count.max(0) as usize, "bit8 data")?;
            }
            2 => {
                for _ in 0..count.max(0) {
                    cursor.word("bit32 data")?;
                }
            }
            3 => {
                cursor.bytes(count.max(0) as usize, "utf8 data")?;
            }
            4 | 8 => {
                for _ in 0..count.max(0) {
                    cursor.word("8-byte segment (hi)")?;
                    cursor.word("8-byte segment (lo)")?;
                }
            }
            5 => {
                cursor.word("array element type")?;
                cursor.word("array element count")?;
            }
            6 => {
                cursor.word("set-array index")?;
            }
            7 => {}
            _ => return Err(ModuleLoadError::new("unknown data item type")),
        }
    }
    Ok(cursor.bytes[start..cursor.pos].to_vec())
}

fn read_export_section(cursor: &mut Cursor, header: &ModuleHeader) -> Result<Vec<ExportEntry>, ModuleLoadError> {
    let count = header.export_size.max(0) as usize;
    let mut exports = Vec::with_capacity(count);
    for _ in 0..count {
        let pc = cursor.operand("export pc")?;
        let frame_type = cursor.operand("export frame type")?;
        let signature = cursor.word("export signature")? as u32;
        let name = cursor.cstring("export name")?;
        exports.push(ExportEntry {
            pc,
            frame_type,
            signature,
            name,
        });
    }
    Ok(exports)
}

fn read_import_section(cursor: &mut Cursor, header: &ModuleHeader) -> Result<Vec<ImportEntry>, ModuleLoadError> {
    if !header.has_import() {
        return Ok(Vec::new());
    }
    let module_count = cursor.operand("import module count")?;
    let mut imports = Vec::with_capacity(module_count.max(0) as usize);
    for _ in 0..module_count.max(0) {
        let function_count = cursor.operand("import function count")?;
        let mut functions = Vec::with_capacity(function_count.max(0) as usize);
        for _ in 0..function_count.max(0) {
            let signature = cursor.word("import signature")? as u32;
            let name = cursor.cstring("import name")?;
            functions.push((signature, name));
        }
        imports.push(ImportEntry { functions });
    }
    let terminator = cursor.byte("import section terminator")?;
    if terminator != 0 {
        return Err(ModuleLoadError::new("missing import section terminator"));
    }
    Ok(imports)
}

fn read_handler_section(cursor: &mut Cursor, header: &ModuleHeader) -> Result<Vec<HandlerEntry>, ModuleLoadError> {
    if !header.has_handler() {
        return Ok(Vec::new());
    }
    let handler_count = cursor.operand("handler count")?;
    let mut handlers = Vec::with_capacity(handler_count.max(0) as usize);
    for _ in 0..handler_count.max(0) {
        let exception_offset = cursor.operand("handler exception offset")?;
        let begin_pc = cursor.operand("handler begin pc")?;
        let end_pc = cursor.operand("handler end pc")?;
        let type_desc_index = cursor.operand("handler type desc index")?;
        let packed = cursor.operand("handler packed case word")? as u32;
        let named_case_count = (packed >> 16) as usize;
        let total_case_count = (packed & 0xffff) as usize;
        if named_case_count > total_case_count {
            return Err(ModuleLoadError::new("handler named case count exceeds total"));
        }

        let mut named_cases = Vec::with_capacity(named_case_count);
        for _ in 0..named_case_count {
            let name = cursor.cstring("handler case name")?;
            let pc = cursor.operand("handler case pc")?;
            named_cases.push((name, pc));
        }
        let wildcard_pc = if total_case_count > named_case_count {
            Some(cursor.operand("handler wildcard pc")?)
        } else {
            None
        };
        handlers.push(HandlerEntry {
            exception_offset,
            begin_pc,
            end_pc,
            type_desc_index,
            named_cases,
            wildcard_pc,
        });
    }
    let terminator = cursor.byte("handler section terminator")?;
    if terminator != 0 {
        return Err(ModuleLoadError::new("missing handler section terminator"));
    }
    Ok(handlers)
}

/// Parses an entire module binary into its unlinked, section-by-section
/// form.
pub fn parse(bytes: &[u8]) -> Result<ParsedModule, ModuleLoadError> {
    let mut cursor = Cursor::new(bytes);
    let header = read_header(&mut cursor)?;
    let code = read_code_section(&mut cursor, &header)?;
    let types = read_type_section(&mut cursor, &header)?;
    let data_section = read_data_section(&mut cursor, &header)?;
    let module_name = cursor.cstring("module name")?;
    let exports = read_export_section(&mut cursor, &header)?;
    let imports = read_import_section(&mut cursor, &header)?;
    let handlers = read_handler_section(&mut cursor, &header)?;

    Ok(ParsedModule {
        header,
        code,
        types,
        data_section,
        module_name,
        exports,
        imports,
        handlers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dis_asm::write_operand;

    fn encode_header(entry_pc: i32, entry_type: i32, code_size: i32) -> Vec<u8> {
        let mut out = Vec::new();
        write_operand(crate::consts::MAGIC_UNSIGNED as i32, &mut out);
        write_operand(0, &mut out); // runtime flags
        write_operand(4096, &mut out); // stack extent
        write_operand(code_size, &mut out); // code size
        write_operand(0, &mut out); // data size
        write_operand(0, &mut out); // type size
        write_operand(0, &mut out); // export size
        write_operand(entry_pc, &mut out);
        write_operand(entry_type, &mut out);
        out
    }

    #[test]
    fn header_round_trips_through_parse() {
        let mut bytes = encode_header(-1, -1, 0);
        bytes.push(0); // module name terminator
        let parsed = parse(&bytes).unwrap();
        assert_eq!(parsed.header.entry_pc, -1);
        assert_eq!(parsed.header.code_size, 0);
        assert_eq!(parsed.module_name, "");
    }

    #[test]
    fn deprecated_import_flag_is_rejected() {
        let mut out = Vec::new();
        write_operand(crate::consts::MAGIC_UNSIGNED as i32, &mut out);
        write_operand(RUNTIME_FLAG_HAS_IMPORT_DEPRECATED as i32, &mut out);
        assert!(parse(&out).is_err());
    }

    #[test]
    fn unknown_magic_is_rejected() {
        let mut out = Vec::new();
        write_operand(12345, &mut out);
        assert!(parse(&out).is_err());
    }
}
