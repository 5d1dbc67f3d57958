//! Tool (debugger/profiler) dispatch (§4.I).
//!
//! A loaded tool subscribes to VM events and may set breakpoints and
//! suspend/resume every thread. Breakpoints are implemented as a
//! `(module_name, pc)` side table consulted by the engine before each
//! instruction, rather than physically patching the opcode stream: our
//! module code is a decoded `Vec<Instruction>` shared read-only via `Arc`
//! across every `ModRef` of that module, so mutating it in place to splice
//! in a synthetic `brkpt` would require interior mutability shared across
//! threads for a cold path. The side table gives the same externally
//! visible behaviour (documented in `DESIGN.md`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use dis_types::Pc;

/// Events a tool may subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
pub enum ToolEvent {
    ModuleVmLoad,
    ModuleThreadLoad,
    ThreadBegin,
    ThreadEnd,
    ThreadBroken,
    ExceptionRaised,
    ExceptionUnhandled,
    Breakpoint,
    Trap,
}

/// The payload handed to a subscriber's callback. Fields are populated per
/// event kind; irrelevant ones are left `None`.
#[derive(Debug, Clone, Default)]
pub struct EventContext {
    pub thread_id: Option<u32>,
    pub module_name: Option<String>,
    pub pc: Option<Pc>,
    pub message: Option<String>,
}

/// Opaque handle returned by [`ToolController::subscribe`], used to cancel
/// the subscription later.
pub type SubscriptionId = u64;

struct Subscription {
    id: SubscriptionId,
    event: ToolEvent,
    callback: Box<dyn Fn(&EventContext) + Send + Sync>,
}

/// Reinstated opcode byte and the subscription that requested the
/// breakpoint, so `clear_breakpoint` can report who owned it.
struct BreakpointSlot {
    original_opcode: u8,
    owner: SubscriptionId,
}

/// The controller interface a loaded tool is handed (§4.I). Shared via
/// `Arc` between the tool and every thread's [`crate::registers::Registers`]
/// dispatcher slot.
pub struct ToolController {
    subscriptions: Mutex<Vec<Subscription>>,
    next_id: AtomicU64,
    breakpoints: Mutex<HashMap<(String, Pc), BreakpointSlot>>,
    suspend_requested: AtomicBool,
    parked_count: AtomicUsize,
    resume_condvar: Condvar,
    resume_lock: Mutex<()>,
}

impl ToolController {
    /// A controller with no subscriptions and no breakpoints.
    pub fn new() -> Arc<ToolController> {
        Arc::new(ToolController {
            subscriptions: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            breakpoints: Mutex::new(HashMap::new()),
            suspend_requested: AtomicBool::new(false),
            parked_count: AtomicUsize::new(0),
            resume_condvar: Condvar::new(),
            resume_lock: Mutex::new(()),
        })
    }

    /// Registers a callback for `event`, returning a cookie to unsubscribe
    /// with later.
    pub fn subscribe(&self, event: ToolEvent, callback: impl Fn(&EventContext) + Send + Sync + 'static) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscriptions.lock().push(Subscription {
            id,
            event,
            callback: Box::new(callback),
        });
        id
    }

    /// Removes a subscription. A no-op if the cookie is unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscriptions.lock().retain(|s| s.id != id);
    }

    /// Invokes every subscriber registered for `event`.
    pub fn fire(&self, event: ToolEvent, ctx: &EventContext) {
        for sub in self.subscriptions.lock().iter() {
            if sub.event == event {
                (sub.callback)(ctx);
            }
        }
    }

    /// Records a breakpoint at `(module_name, pc)`, remembering
    /// `original_opcode` so it can be restored on clear. Returns `false`
    /// (no-op) if a breakpoint is already set there.
    pub fn set_breakpoint(&self, owner: SubscriptionId, module_name: &str, pc: Pc, original_opcode: u8) -> bool {
        let mut bps = self.breakpoints.lock();
        let key = (module_name.to_string(), pc);
        if bps.contains_key(&key) {
            return false;
        }
        bps.insert(key, BreakpointSlot { original_opcode, owner });
        true
    }

    /// Removes a breakpoint, returning the opcode byte that was shadowed so
    /// the caller can treat it as the "real" instruction again. `None` if
    /// nothing was set there.
    pub fn clear_breakpoint(&self, module_name: &str, pc: Pc) -> Option<u8> {
        self.breakpoints
            .lock()
            .remove(&(module_name.to_string(), pc))
            .map(|slot| slot.original_opcode)
    }

    /// Whether execution at `(module_name, pc)` should fire a `breakpoint`
    /// event instead of running the real instruction.
    pub fn has_breakpoint(&self, module_name: &str, pc: Pc) -> bool {
        self.breakpoints.lock().contains_key(&(module_name.to_string(), pc))
    }

    /// Requests that every thread suspend at its next instruction boundary.
    /// Blocks until `runnable_count` threads (every scheduler-runnable
    /// thread except the caller) have parked.
    pub fn suspend_all(&self, runnable_count: usize) {
        self.suspend_requested.store(true, Ordering::SeqCst);
        let mut guard = self.resume_lock.lock();
        while self.parked_count.load(Ordering::SeqCst) < runnable_count {
            self.resume_condvar.wait(&mut guard);
        }
    }

    /// Clears the suspension flag and wakes every parked thread.
    pub fn resume_all(&self) {
        self.suspend_requested.store(false, Ordering::SeqCst);
        let _guard = self.resume_lock.lock();
        self.resume_condvar.notify_all();
    }

    /// Called by a worker thread at an instruction boundary. Parks until
    /// the suspension flag clears, if set.
    pub fn park_if_suspended(&self) {
        if !self.suspend_requested.load(Ordering::SeqCst) {
            return;
        }
        self.parked_count.fetch_add(1, Ordering::SeqCst);
        self.resume_condvar.notify_all();
        let mut guard = self.resume_lock.lock();
        while self.suspend_requested.load(Ordering::SeqCst) {
            self.resume_condvar.wait(&mut guard);
        }
        self.parked_count.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for ToolController {
    fn default() -> Self {
        unreachable!("use ToolController::new(), which returns an Arc")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as Counter;

    #[test]
    fn subscribe_and_fire_invokes_only_matching_event() {
        let tool = ToolController::new();
        let hits = Arc::new(Counter::new(0));
        let hits2 = Arc::clone(&hits);
        tool.subscribe(ToolEvent::ThreadBegin, move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        tool.fire(ToolEvent::ThreadEnd, &EventContext::default());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        tool.fire(ToolEvent::ThreadBegin, &EventContext::default());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_stops_future_events() {
        let tool = ToolController::new();
        let hits = Arc::new(Counter::new(0));
        let hits2 = Arc::clone(&hits);
        let id = tool.subscribe(ToolEvent::Trap, move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        tool.unsubscribe(id);
        tool.fire(ToolEvent::Trap, &EventContext::default());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn breakpoint_set_clear_round_trips_original_opcode() {
        let tool = ToolController::new();
        assert!(tool.set_breakpoint(1, "mod", 10, 0x42));
        assert!(tool.has_breakpoint("mod", 10));
        assert!(!tool.set_breakpoint(2, "mod", 10, 0x99));
        assert_eq!(tool.clear_breakpoint("mod", 10), Some(0x42));
        assert!(!tool.has_breakpoint("mod", 10));
    }
}
