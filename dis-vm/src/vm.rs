//! Top-level VM façade: configuration, resolver/tool wiring, and the
//! entry-module load-and-run sequence (§4.A, §4.B, §4.G).

use std::sync::Arc;

use crate::consts::{DEFAULT_QUANTUM, DEFAULT_WORKER_THREADS};
use crate::error::ModuleLoadError;
use crate::heap::header::TypeDescriptor;
use crate::module::ModRef;
use crate::resolver::{ModuleResolver, ResolveError};
use crate::scheduler::{Scheduler, ThreadId};
use crate::tool::ToolController;

/// Tunable VM parameters (§4.G "worker count", "quantum"; §4.H "GC
/// disabled" for embedding contexts that manage memory externally).
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Number of OS worker threads running the scheduler.
    pub worker_threads: usize,
    /// Instructions run per thread per scheduling turn.
    pub quantum: u32,
    /// Whether the tricolour collector runs at all; `false` leaks cycles
    /// (and never reclaims pointer-bearing allocations at all, since those
    /// rely on the collector, not refcounting, to break cycles) but is
    /// useful for embedding contexts with their own memory budget.
    pub gc_enabled: bool,
    /// Seed for the `alt`-fairness LCG (§4.F).
    pub seed: u32,
}

impl Default for VmConfig {
    fn default() -> VmConfig {
        VmConfig {
            worker_threads: DEFAULT_WORKER_THREADS,
            quantum: DEFAULT_QUANTUM,
            gc_enabled: true,
            seed: 0x2545_f491,
        }
    }
}

/// A Dis virtual machine instance: owns the scheduler and the resolver/tool
/// configuration applied before threads start running.
pub struct Vm {
    scheduler: Arc<Scheduler>,
    config: VmConfig,
}

impl Vm {
    /// A VM with no modules loaded and no resolvers registered yet.
    pub fn new(config: VmConfig) -> Vm {
        let scheduler = Scheduler::new(config.quantum, config.seed, config.gc_enabled);
        Vm { scheduler, config }
    }

    /// Appends a module resolver to the chain `load` and the entry load
    /// consult, in registration order.
    pub fn register_resolver(&self, resolver: impl ModuleResolver<Error = ResolveError> + Send + Sync + 'static) {
        self.scheduler.add_resolver(resolver);
    }

    /// Installs a tool (debugger/profiler) controller, replacing any
    /// previously installed one.
    pub fn install_tool(&self, tool: Arc<ToolController>) {
        self.scheduler.set_tool(Some(tool));
    }

    /// Loads `path` as the entry module and spawns its first thread at the
    /// module's declared entry point. Returns the new thread's id.
    pub fn load_and_spawn(&self, path: &str) -> Result<ThreadId, ModuleLoadError> {
        let module = self.scheduler.load_module(path)?;
        let entry_pc = module
            .entry_pc
            .ok_or_else(|| ModuleLoadError::new(format!("{path} has no entry point")))?;
        let entry_type = module
            .entry_type
            .ok_or_else(|| ModuleLoadError::new(format!("{path} has no entry frame type")))?;
        let frame_type = module
            .types
            .get(entry_type as usize)
            .cloned()
            .unwrap_or_else(|| TypeDescriptor::plain(0));

        let modref = Arc::new(ModRef::new(Arc::clone(&module), &[])?);
        Ok(self.scheduler.spawn_initial(modref, entry_pc, frame_type))
    }

    /// Runs every runnable thread to completion (or deadlock), across
    /// `config.worker_threads` OS workers. Blocks until no thread remains.
    pub fn run_to_completion(&self) {
        self.scheduler.run(self.config.worker_threads);
    }

    /// Deadlocked threads (id and cause) left over from the most recent
    /// [`Vm::run_to_completion`], empty if every thread ran to completion.
    pub fn deadlock_report(&self) -> Vec<(ThreadId, String)> {
        self.scheduler.deadlock_report()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::ModuleResolver as _;
    use dis_asm::{write_operand, AddrCode, AddrMode, Instruction, MidAddrMode, Opcode, Operand};

    struct StaticResolver(Vec<u8>);
    impl ModuleResolver for StaticResolver {
        type Error = ResolveError;
        fn resolve(&self, _path: &str) -> Result<Vec<u8>, ResolveError> {
            Ok(self.0.clone())
        }
    }

    fn exit_only_module(name: &str) -> Vec<u8> {
        let mut code = Vec::new();
        Instruction {
            opcode: Opcode::Exit,
            addr: AddrCode {
                mid: MidAddrMode::None,
                src: AddrMode::None,
                dest: AddrMode::None,
            },
            mid: Operand::Absent,
            src: Operand::Absent,
            dest: Operand::Absent,
        }
        .encode(&mut code);

        let mut out = Vec::new();
        write_operand(crate::consts::MAGIC_UNSIGNED as i32, &mut out);
        write_operand(0, &mut out); // runtime flags
        write_operand(4096, &mut out); // stack extent
        write_operand(1, &mut out); // code size (instruction count)
        write_operand(0, &mut out); // data size
        write_operand(1, &mut out); // type size
        write_operand(0, &mut out); // export size
        write_operand(0, &mut out); // entry pc
        write_operand(0, &mut out); // entry type
        out.extend_from_slice(&code);
        write_operand(0, &mut out); // type 0: number
        write_operand(0, &mut out); // type 0: size
        write_operand(0, &mut out); // type 0: bitmap length
        out.push(0); // data section terminator
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        out
    }

    #[test]
    fn load_and_run_an_entry_module_that_exits_immediately() {
        let bytes = exit_only_module("entry");
        let vm = Vm::new(VmConfig {
            worker_threads: 1,
            gc_enabled: false,
            ..VmConfig::default()
        });
        vm.register_resolver(StaticResolver(bytes));
        vm.load_and_spawn("entry.dis").unwrap();
        vm.run_to_completion();
        assert!(vm.deadlock_report().is_empty());
    }
}
