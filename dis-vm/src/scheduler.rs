//! Multi-worker thread scheduler (§4.G).
//!
//! Threads move between four places: a ready FIFO, a blocked set (parked on
//! a channel op that would block), a running slot (one per active worker,
//! tracked only by count), and the thread table itself, which every thread
//! lives in from spawn to retirement. A thread's own `Mutex<Thread>` is the
//! "ownership mutex" mentioned in the design note below `SchedulerHandle`:
//! whichever worker holds it is the only one allowed to touch that
//! thread's registers, and the collector leans on the same lock for its
//! stop-the-world pause.
//!
//! Blocked channel ops are retried by polling rather than by a wakeup
//! callback (§4.F, and `engine::channels`'s module doc): when the ready
//! queue runs dry and no worker is running, every blocked thread is swept
//! back onto the ready queue for one more quantum. A thread whose op still
//! can't complete returns to the blocked set immediately. Two consecutive
//! sweeps that produce the exact same blocked set with no intervening
//! progress are declared a deadlock.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use dis_asm::PanicReason;
use dis_types::Pc;

use crate::engine::{self, control, ExecContext};
use crate::error::ModuleLoadError;
use crate::gc;
use crate::heap::header::TypeDescriptor;
use crate::module::{load_module_bytes, ModRef, Module};
use crate::registers::ThreadState;
use crate::rendezvous::Lcg;
use crate::resolver::{ModuleResolver, ResolveError, ResolverChain};
use crate::thread::Thread;
use crate::tool::{EventContext, ToolController, ToolEvent};

/// Thread ids assigned by a scheduler are unique for its lifetime, never
/// reused even after a thread retires.
pub type ThreadId = u32;

/// Coordinates every runnable thread across `worker_threads` OS workers: a
/// ready FIFO, a blocked set, the shared module cache and resolver chain,
/// and the GC epoch/barrier.
pub struct Scheduler {
    threads: Mutex<HashMap<ThreadId, Arc<Mutex<Thread>>>>,
    ready: Mutex<VecDeque<ThreadId>>,
    blocked: Mutex<HashSet<ThreadId>>,
    running: AtomicUsize,
    next_thread_id: AtomicU32,
    shutting_down: AtomicBool,
    wait_lock: Mutex<()>,
    ready_cv: Condvar,
    /// Bumped whenever a quantum does anything other than immediately
    /// re-block on the same pending op; the deadlock check's progress
    /// witness.
    progress: AtomicU64,
    last_blocked_snapshot: Mutex<Option<(Vec<ThreadId>, u64)>>,
    deadlocked: Mutex<Vec<(ThreadId, String)>>,

    quantum: u32,
    resolver: Mutex<ResolverChain>,
    module_cache: Mutex<HashMap<String, Arc<Module>>>,
    self_bytes: Mutex<Option<Vec<u8>>>,
    lcg: Mutex<Lcg>,
    tool: Mutex<Option<Arc<ToolController>>>,

    gc_enabled: bool,
    gc_epoch: gc::Epoch,
    gc_lock: Mutex<()>,
    quanta_run: AtomicU64,
}

impl Scheduler {
    /// A scheduler with no threads yet, an empty module cache, and the
    /// given per-quantum instruction budget and `alt`-fairness seed.
    pub fn new(quantum: u32, seed: u32, gc_enabled: bool) -> Arc<Scheduler> {
        Arc::new(Scheduler {
            threads: Mutex::new(HashMap::new()),
            ready: Mutex::new(VecDeque::new()),
            blocked: Mutex::new(HashSet::new()),
            running: AtomicUsize::new(0),
            next_thread_id: AtomicU32::new(1),
            shutting_down: AtomicBool::new(false),
            wait_lock: Mutex::new(()),
            ready_cv: Condvar::new(),
            progress: AtomicU64::new(0),
            last_blocked_snapshot: Mutex::new(None),
            deadlocked: Mutex::new(Vec::new()),
            quantum,
            resolver: Mutex::new(ResolverChain::new()),
            module_cache: Mutex::new(HashMap::new()),
            self_bytes: Mutex::new(None),
            lcg: Mutex::new(Lcg::new(seed)),
            tool: Mutex::new(None),
            gc_enabled,
            gc_epoch: gc::Epoch::new(),
            gc_lock: Mutex::new(()),
            quanta_run: AtomicU64::new(0),
        })
    }

    /// Appends a resolver to the chain consulted by `load` and by initial
    /// module loads. Must be called before [`Scheduler::run`] starts.
    pub fn add_resolver(&self, resolver: impl ModuleResolver<Error = ResolveError> + Send + Sync + 'static) {
        self.resolver.lock().push(resolver);
    }

    /// Installs (or replaces) the tool controller every thread's engine
    /// step checks for breakpoints and suspension.
    pub fn set_tool(&self, tool: Option<Arc<ToolController>>) {
        *self.tool.lock() = tool;
    }

    /// Remembers the entry module's own bytes, so a later `load("$self")`
    /// from any thread can still resolve it.
    pub fn set_self_bytes(&self, bytes: Vec<u8>) {
        *self.self_bytes.lock() = Some(bytes);
    }

    /// Finds or parses-and-links the module at `path`, for the VM's
    /// initial load.
    pub fn load_module(&self, path: &str) -> Result<Arc<Module>, ModuleLoadError> {
        if let Some(m) = self.module_cache.lock().get(path) {
            return Ok(Arc::clone(m));
        }
        let self_bytes = self.self_bytes.lock().clone();
        let bytes = load_module_bytes(&*self.resolver.lock(), path, self_bytes.as_deref())?;
        let module = Arc::new(Module::parse(&bytes)?);
        self.module_cache.lock().insert(path.to_string(), Arc::clone(&module));
        Ok(module)
    }

    /// Spawns the VM's first thread, already `ready`, at `entry_pc` in
    /// `module` with a fresh frame of `frame_type`.
    pub fn spawn_initial(&self, module: Arc<ModRef>, entry_pc: Pc, frame_type: Arc<TypeDescriptor>) -> ThreadId {
        self.spawn_thread_impl(0, module, entry_pc, frame_type)
    }

    fn spawn_thread_impl(&self, parent_id: ThreadId, module: Arc<ModRef>, entry_pc: Pc, frame_type: Arc<TypeDescriptor>) -> ThreadId {
        let id = self.next_thread_id.fetch_add(1, Ordering::SeqCst);
        let mut thread = Thread::new(id, parent_id);
        thread.registers.mp_base = module.mp;
        thread.registers.module = Some(Arc::clone(&module));
        match thread.registers.stack.alloc_frame(frame_type) {
            Ok(frame_id) => {
                thread.registers.stack.push_frame(frame_id, entry_pc, None);
                thread.registers.pc = entry_pc;
                thread.registers.next_pc = entry_pc;
            }
            Err(_) => thread.mark_broken("spawn: entry frame too large for a stack page"),
        }

        let runnable = !thread.is_terminal();
        self.threads.lock().insert(id, Arc::new(Mutex::new(thread)));
        self.progress.fetch_add(1, Ordering::SeqCst);

        if let Some(tool) = self.tool.lock().clone() {
            tool.fire(
                ToolEvent::ThreadBegin,
                &EventContext {
                    thread_id: Some(id),
                    ..Default::default()
                },
            );
        }

        if runnable {
            self.ready.lock().push_back(id);
            self.ready_cv.notify_all();
        } else {
            self.threads.lock().remove(&id);
        }
        id
    }

    fn load_module_impl(&self, path: &str) -> Result<Arc<ModRef>, PanicReason> {
        let module = self.load_module(path).map_err(|_| PanicReason::ModuleException)?;
        // Imports declared by a module loaded mid-run can't be resolved
        // here: `load` only has a path, not the already-loaded foreign
        // `Module`s its import table names (see `DESIGN.md`). Modules with
        // no imports link fine; anything else fails to resolve.
        ModRef::new(module, &[]).map(Arc::new).map_err(|_| PanicReason::ModuleException)
    }

    /// Runs every ready thread to completion (or deadlock) across
    /// `worker_count` OS worker threads, blocking until none remain.
    pub fn run(self: &Arc<Self>, worker_count: usize) {
        let workers: Vec<_> = (0..worker_count.max(1))
            .map(|i| {
                let scheduler = Arc::clone(self);
                std::thread::Builder::new()
                    .name(format!("dis-worker-{i}"))
                    .spawn(move || scheduler.worker_loop())
                    .expect("failed to spawn VM worker thread")
            })
            .collect();
        for w in workers {
            let _ = w.join();
        }
    }

    /// Unresolved deadlock causes recorded by the most recent [`run`],
    /// cleared at the start of each run.
    pub fn deadlock_report(&self) -> Vec<(ThreadId, String)> {
        self.deadlocked.lock().clone()
    }

    fn worker_loop(self: Arc<Self>) {
        while let Some(id) = self.next_ready() {
            self.run_quantum(id);
        }
    }

    /// Pops the next thread to run, sweeping the blocked set back onto the
    /// ready queue when nothing else is runnable, and declaring a deadlock
    /// (marking every blocked thread broken) when a sweep makes no
    /// progress twice in a row.
    fn next_ready(&self) -> Option<ThreadId> {
        loop {
            if let Some(id) = self.ready.lock().pop_front() {
                return Some(id);
            }
            if self.shutting_down.load(Ordering::SeqCst) {
                return None;
            }
            if self.running.load(Ordering::SeqCst) == 0 {
                let total = self.threads.lock().len();
                if total == 0 {
                    self.shutting_down.store(true, Ordering::SeqCst);
                    self.ready_cv.notify_all();
                    return None;
                }

                let mut blocked_ids: Vec<ThreadId> = self.blocked.lock().iter().copied().collect();
                blocked_ids.sort_unstable();

                if blocked_ids.len() == total && !blocked_ids.is_empty() {
                    let progress_now = self.progress.load(Ordering::SeqCst);
                    let mut last = self.last_blocked_snapshot.lock();
                    if last.as_ref() == Some(&(blocked_ids.clone(), progress_now)) {
                        drop(last);
                        self.declare_deadlock(&blocked_ids);
                        self.shutting_down.store(true, Ordering::SeqCst);
                        self.ready_cv.notify_all();
                        return None;
                    }
                    *last = Some((blocked_ids.clone(), progress_now));
                }

                if !blocked_ids.is_empty() {
                    let mut blocked = self.blocked.lock();
                    let mut ready = self.ready.lock();
                    ready.extend(blocked.drain());
                    drop(blocked);
                    drop(ready);
                    self.ready_cv.notify_all();
                    continue;
                }
            }

            let mut guard = self.wait_lock.lock();
            self.ready_cv.wait_for(&mut guard, Duration::from_millis(5));
        }
    }

    fn declare_deadlock(&self, thread_ids: &[ThreadId]) {
        tracing::error!(threads = ?thread_ids, "scheduler deadlock: no blocked thread can make progress");
        let mut report = self.deadlocked.lock();
        let mut threads = self.threads.lock();
        for &id in thread_ids {
            if let Some(t) = threads.remove(&id) {
                let mut t = t.lock();
                t.mark_broken("deadlock: no channel counterpart will ever become available");
                report.push((id, t.broken_error.clone().unwrap_or_default()));
            }
        }
        self.blocked.lock().clear();
    }

    /// Runs one thread for up to `self.quantum` instructions, or until it
    /// blocks, terminates, or breaks, then files it onto the ready queue,
    /// the blocked set, or removes it, as appropriate.
    fn run_quantum(&self, thread_id: ThreadId) {
        let Some(thread_arc) = self.threads.lock().get(&thread_id).cloned() else {
            return;
        };
        self.running.fetch_add(1, Ordering::SeqCst);

        let mut thread = thread_arc.lock();
        thread.registers.state = ThreadState::Running;
        thread.registers.quantum_remaining = self.quantum;

        let tool = self.tool.lock().clone();
        let mut lcg = self.lcg.lock();
        let mut progressed = false;
        let mut broke: Option<String> = None;

        while thread.registers.quantum_remaining > 0 {
            let Some(module) = thread.registers.module.clone() else {
                broke = Some("thread has no module loaded".to_string());
                break;
            };
            let mut handle = SchedulerHandle {
                scheduler: self,
                current_thread_id: thread_id,
            };
            let mut ctx = ExecContext {
                module: &module.module,
                host: &mut handle,
                lcg: &mut lcg,
                tool: tool.clone(),
            };
            match engine::step(&mut thread.registers, &mut ctx) {
                Ok(engine::StepOutcome::Continue) => {
                    progressed = true;
                    thread.registers.quantum_remaining = thread.registers.quantum_remaining.saturating_sub(1);
                }
                Ok(engine::StepOutcome::Blocked) => break,
                Ok(engine::StepOutcome::Terminal) => break,
                Err(e) => {
                    broke = Some(e);
                    break;
                }
            }
        }
        drop(lcg);

        if let Some(cause) = broke {
            thread.mark_broken(cause);
        }
        let final_state = thread.registers.state;
        let broken_cause = (final_state == ThreadState::Broken).then(|| thread.broken_error.clone().unwrap_or_default());
        drop(thread);

        self.running.fetch_sub(1, Ordering::SeqCst);
        if progressed {
            self.progress.fetch_add(1, Ordering::SeqCst);
        }

        match final_state {
            ThreadState::Exiting | ThreadState::EmptyStack => self.retire(thread_id, None, &tool),
            ThreadState::Broken => self.retire(thread_id, broken_cause, &tool),
            ThreadState::BlockedSending | ThreadState::BlockedReceiving | ThreadState::BlockedInAlt => {
                self.blocked.lock().insert(thread_id);
            }
            _ => {
                self.ready.lock().push_back(thread_id);
            }
        }
        self.ready_cv.notify_all();
        self.maybe_collect();
    }

    fn retire(&self, thread_id: ThreadId, cause: Option<String>, tool: &Option<Arc<ToolController>>) {
        self.threads.lock().remove(&thread_id);
        self.blocked.lock().remove(&thread_id);
        self.progress.fetch_add(1, Ordering::SeqCst);
        if let Some(tool) = tool {
            let event = if cause.is_some() { ToolEvent::ThreadBroken } else { ToolEvent::ThreadEnd };
            tool.fire(
                event,
                &EventContext {
                    thread_id: Some(thread_id),
                    message: cause,
                    ..Default::default()
                },
            );
        }
    }

    /// Runs a collection every [`crate::consts::GC_EPOCH_MASK`] quanta,
    /// unless disabled. The stop-the-world pause is just locking every
    /// thread's own ownership mutex: a worker mid-quantum holds its
    /// thread's lock until the quantum ends, so the collector locking all
    /// of them is already sufficient quiescence, without a separate
    /// suspend flag (see `DESIGN.md`).
    fn maybe_collect(&self) {
        if !self.gc_enabled {
            return;
        }
        let n = self.quanta_run.fetch_add(1, Ordering::SeqCst) + 1;
        if n & crate::consts::GC_EPOCH_MASK != 0 {
            return;
        }
        let Some(_guard) = self.gc_lock.try_lock() else {
            return; // another worker is already collecting this epoch
        };
        let thread_arcs: Vec<Arc<Mutex<Thread>>> = self.threads.lock().values().cloned().collect();
        let mut guards: Vec<_> = thread_arcs.iter().map(|t| t.lock()).collect();
        let regs = guards.iter_mut().map(|g| &mut g.registers);
        gc::collect(regs, &self.gc_epoch);
    }
}

/// A `Scheduling` implementor bound to whichever thread is currently
/// running its quantum. `Scheduling`'s methods take `&mut self`, but the
/// `Scheduler` itself is shared across workers via `Arc` and mutated only
/// through its internal locks, so this handle is just a thin, freshly
/// built wrapper per `engine::step` call — it owns no state of its own
/// beyond which thread is asking.
struct SchedulerHandle<'a> {
    scheduler: &'a Scheduler,
    current_thread_id: ThreadId,
}

impl<'a> control::Scheduling for SchedulerHandle<'a> {
    fn spawn_thread(&mut self, module: Arc<ModRef>, entry_pc: Pc, frame_type: Arc<TypeDescriptor>) -> u32 {
        self.scheduler.spawn_thread_impl(self.current_thread_id, module, entry_pc, frame_type)
    }

    fn load_module(&mut self, path: &str) -> Result<Arc<ModRef>, PanicReason> {
        self.scheduler.load_module_impl(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::header::TypeDescriptor;
    use dis_asm::{write_operand, AddrCode, AddrMode, Instruction, MidAddrMode, Opcode, Operand};

    fn minimal_module_bytes(name: &str, instr_count: usize, code: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        write_operand(crate::consts::MAGIC_UNSIGNED as i32, &mut out);
        write_operand(0, &mut out);
        write_operand(4096, &mut out);
        write_operand(instr_count as i32, &mut out); // code size (instruction count)
        write_operand(0, &mut out);
        write_operand(0, &mut out);
        write_operand(0, &mut out);
        write_operand(0, &mut out);
        write_operand(-1, &mut out);
        out.extend_from_slice(code);
        out.push(0); // data section terminator
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        out
    }

    #[test]
    fn spawn_initial_enqueues_a_ready_thread() {
        // `exit` is the only instruction this thread runs; the scheduler
        // should retire it without ever touching the blocked set.
        let mut code = Vec::new();
        let instr = Instruction {
            opcode: Opcode::Exit,
            addr: AddrCode {
                mid: MidAddrMode::None,
                src: AddrMode::None,
                dest: AddrMode::None,
            },
            mid: Operand::Absent,
            src: Operand::Absent,
            dest: Operand::Absent,
        };
        instr.encode(&mut code);
        let bytes = minimal_module_bytes("m", 1, &code);
        let module = Arc::new(Module::parse(&bytes).unwrap());
        let modref = Arc::new(ModRef::new(module, &[]).unwrap());

        let scheduler = Scheduler::new(100, 1, false);
        let td = TypeDescriptor::plain(0);
        let id = scheduler.spawn_initial(modref, 0, td);
        assert_eq!(scheduler.ready.lock().len(), 1);
        assert!(scheduler.threads.lock().contains_key(&id));

        scheduler.run(1);
        assert!(scheduler.threads.lock().is_empty());
        assert!(scheduler.deadlock_report().is_empty());
    }
}
