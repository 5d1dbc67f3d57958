//! Links a [`ParsedModule`] into a runnable [`Module`] and, per load site,
//! a [`ModRef`] with its own MP copy and resolved import table.

use std::sync::Arc;

use dis_types::Pc;

use crate::error::ModuleLoadError;
use crate::heap::{self, header::TypeDescriptor, Pointer};
use crate::resolver::{ModuleResolver, ResolveError, SELF_SENTINEL};

use super::data::{self, DataOp};
use super::format::{ExportEntry, HandlerEntry, ParsedModule};
use super::reader;

/// The fully linked, shared form of a loaded module: code, type table,
/// exports, handlers, and a reusable MP template. Held behind an `Arc` and
/// shared by every [`ModRef`] that loads it.
pub struct Module {
    /// The module's declared name.
    pub name: String,
    /// Decoded instructions, indexed by pc.
    pub code: Vec<dis_asm::Instruction>,
    /// Type descriptors, indexed by type number.
    pub types: Vec<Arc<TypeDescriptor>>,
    /// Exported functions.
    pub exports: Vec<ExportEntry>,
    /// Exception handlers.
    pub handlers: Vec<HandlerEntry>,
    /// Entry program counter, or `None`.
    pub entry_pc: Option<Pc>,
    /// Type-section index of the entry frame, or `None`.
    pub entry_type: Option<i32>,
    /// Size of the MP template, in bytes.
    pub data_size: usize,
    /// Decoded data-section ops, re-run against each fresh MP copy.
    pub(crate) data_ops: Vec<DataOp>,
    /// Declared import function lists, in declaration order — matched
    /// against a loaded foreign module's exports at `ModRef` construction.
    pub imports: Vec<super::format::ImportEntry>,
}

impl Module {
    /// Parses and links raw module bytes.
    pub fn parse(bytes: &[u8]) -> Result<Module, ModuleLoadError> {
        let parsed: ParsedModule = reader::parse(bytes)?;
        Self::from_parsed(parsed)
    }

    fn from_parsed(parsed: ParsedModule) -> Result<Module, ModuleLoadError> {
        let types: Vec<Arc<TypeDescriptor>> = parsed
            .types
            .iter()
            .map(|t| {
                Arc::new(TypeDescriptor {
                    size_in_bytes: t.size_in_bytes,
                    pointer_bitmap: t.pointer_bitmap.clone(),
                    finalizer: None,
                })
            })
            .collect();

        let data_ops = data::decode(&parsed.data_section)?;

        let data_size = if parsed.header.data_size > 0 {
            let vm_module_type = types
                .first()
                .ok_or_else(|| ModuleLoadError::new("module has data but no type-0 descriptor"))?;
            if vm_module_type.size_in_bytes != parsed.header.data_size as usize {
                return Err(ModuleLoadError::new("type 0 size does not match declared data size"));
            }
            vm_module_type.size_in_bytes
        } else {
            0
        };

        Ok(Module {
            name: parsed.module_name,
            code: parsed.code,
            types,
            exports: parsed.exports,
            handlers: parsed.handlers,
            entry_pc: (parsed.header.entry_pc >= 0).then_some(parsed.header.entry_pc),
            entry_type: (parsed.header.entry_type >= 0).then_some(parsed.header.entry_type),
            data_size,
            data_ops,
            imports: parsed.imports,
        })
    }

    /// Looks up an export by name (the loader's tiebreaker when multiple
    /// exports share a signature hash).
    pub fn find_export(&self, signature: u32, name: &str) -> Option<&ExportEntry> {
        self.exports
            .iter()
            .find(|e| e.signature == signature && e.name == name)
    }
}

/// One resolved foreign-function entry in a `ModRef`'s import table.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedImport {
    /// Entry pc in the foreign module.
    pub entry_pc: Pc,
    /// Frame type index in the foreign module.
    pub frame_type_index: i32,
}

/// A per-load-site instance of a [`Module`]: a shared reference to the
/// linked module plus a fresh MP copy and resolved import table.
pub struct ModRef {
    /// The shared, linked module.
    pub module: Arc<Module>,
    /// This load site's own MP allocation (`None` for built-in modules with
    /// no data section).
    pub mp: Pointer,
    /// Resolved imports, one entry per foreign function, in declaration
    /// order matching `module.imports`.
    pub resolved_imports: Vec<ResolvedImport>,
}

// `mp` is a raw heap pointer into a process-wide allocation; a `ModRef` is
// immutable after construction (only the MP's pointed-to bytes mutate,
// under the same refcounting discipline as any other heap value), so
// sharing it read-only across threads via `Arc<ModRef>` is sound.
unsafe impl Send for ModRef {}
unsafe impl Sync for ModRef {}

impl ModRef {
    /// Builds a module reference with a fresh MP copy, resolving its
    /// imports against already-loaded foreign modules (by signature+name
    /// match against their export tables).
    pub fn new(module: Arc<Module>, foreign_modules: &[Arc<Module>]) -> Result<ModRef, ModuleLoadError> {
        let mp = if module.data_size > 0 {
            let td = Arc::new(TypeDescriptor {
                size_in_bytes: module.data_size,
                pointer_bitmap: module
                    .types
                    .first()
                    .map(|t| t.pointer_bitmap.clone())
                    .unwrap_or_default(),
                finalizer: None,
            });
            let ptr = heap::allocate(td, heap::Colour::White);
            data::run_data_section(ptr.as_ptr(), module.data_size, &module.data_ops, &module.types)?;
            Some(ptr)
        } else {
            None
        };

        let mut resolved_imports = Vec::new();
        for (import_list, foreign) in module.imports.iter().zip(foreign_modules.iter()) {
            for (signature, name) in &import_list.functions {
                let export = foreign
                    .find_export(*signature, name)
                    .ok_or_else(|| ModuleLoadError::new(format!("unresolved import {name}")))?;
                resolved_imports.push(ResolvedImport {
                    entry_pc: export.pc,
                    frame_type_index: export.frame_type,
                });
            }
        }

        Ok(ModRef {
            module,
            mp,
            resolved_imports,
        })
    }
}

/// Loads a module by path through a resolver chain, honoring the `$self`
/// sentinel (the entry module currently being constructed).
pub fn load_module_bytes<R: ModuleResolver<Error = ResolveError>>(
    resolver: &R,
    path: &str,
    self_bytes: Option<&[u8]>,
) -> Result<Vec<u8>, ModuleLoadError> {
    if path == SELF_SENTINEL {
        return self_bytes
            .map(|b| b.to_vec())
            .ok_or_else(|| ModuleLoadError::new("$self requested outside a load context"));
    }
    resolver
        .resolve(path)
        .map_err(|e| ModuleLoadError::new(format!("failed to resolve {path}: {e:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dis_asm::write_operand;

    fn minimal_module_bytes(name: &str) -> Vec<u8> {
        let mut out = Vec::new();
        write_operand(crate::consts::MAGIC_UNSIGNED as i32, &mut out);
        write_operand(0, &mut out); // runtime flags
        write_operand(4096, &mut out); // stack extent
        write_operand(0, &mut out); // code size
        write_operand(0, &mut out); // data size
        write_operand(0, &mut out); // type size
        write_operand(0, &mut out); // export size
        write_operand(-1, &mut out); // entry pc
        write_operand(-1, &mut out); // entry type
        out.push(0); // data section terminator
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        out
    }

    #[test]
    fn parses_and_links_a_minimal_module() {
        let bytes = minimal_module_bytes("test");
        let module = Module::parse(&bytes).unwrap();
        assert_eq!(module.name, "test");
        assert_eq!(module.entry_pc, None);
        assert!(module.code.is_empty());
    }

    #[test]
    fn mod_ref_has_no_mp_when_data_size_is_zero() {
        let bytes = minimal_module_bytes("test");
        let module = Arc::new(Module::parse(&bytes).unwrap());
        let modref = ModRef::new(module, &[]).unwrap();
        assert!(modref.mp.is_none());
    }
}
