//! VM threads: identity plus a register file, owned one-at-a-time by a
//! scheduler worker (§3 "Thread", §4.E, §4.G).

use crate::registers::{Registers, ThreadState};

/// A VM thread's identity and register file.
///
/// Unlike most Dis values this is not a heap [`crate::heap::Alloc`]: its
/// `Registers` holds non-bitmap-traceable Rust state (the frame stack's
/// pages, an `Arc<ModRef>`, an atomic tool pointer) that cannot be
/// expressed as a flat, type-descriptor-walked payload. This mirrors the
/// same adaptation `frame.rs` makes for a frame's header words — native
/// Rust fields where the reference runtime uses an untyped allocation.
pub struct Thread {
    /// Globally unique thread id, assigned at spawn.
    pub id: u32,
    /// The thread that spawned this one, or its own id for the first
    /// thread of a VM run.
    pub parent_id: u32,
    /// The thread's register file.
    pub registers: Registers,
    /// Set when the thread reaches `broken`: the unhandled exception id (or
    /// system error message) that killed it.
    pub broken_error: Option<String>,
}

impl Thread {
    /// A freshly spawned thread, `ready` to run.
    pub fn new(id: u32, parent_id: u32) -> Thread {
        Thread {
            id,
            parent_id,
            registers: Registers::new(),
            broken_error: None,
        }
    }

    /// Current thread state.
    pub fn state(&self) -> ThreadState {
        self.registers.state
    }

    /// Transitions to `broken`, recording the cause. Idempotent: the first
    /// cause recorded wins.
    pub fn mark_broken(&mut self, cause: impl Into<String>) {
        if self.broken_error.is_none() {
            self.broken_error = Some(cause.into());
        }
        self.registers.state = ThreadState::Broken;
    }

    /// Whether this thread has reached a terminal state the scheduler
    /// should remove it for (§4.E).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.registers.state,
            ThreadState::Exiting | ThreadState::EmptyStack | ThreadState::Broken
        )
    }

    /// Whether this thread belongs in the scheduler's blocked set.
    pub fn is_blocked(&self) -> bool {
        matches!(
            self.registers.state,
            ThreadState::BlockedInAlt | ThreadState::BlockedSending | ThreadState::BlockedReceiving
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_thread_is_ready() {
        let t = Thread::new(1, 1);
        assert_eq!(t.state(), ThreadState::Ready);
        assert!(!t.is_terminal());
        assert!(!t.is_blocked());
    }

    #[test]
    fn mark_broken_keeps_the_first_cause() {
        let mut t = Thread::new(2, 1);
        t.mark_broken("divide by zero");
        t.mark_broken("second cause ignored");
        assert_eq!(t.broken_error.as_deref(), Some("divide by zero"));
        assert!(t.is_terminal());
    }

    #[test]
    fn blocked_states_are_recognised() {
        let mut t = Thread::new(3, 1);
        t.registers.state = ThreadState::BlockedReceiving;
        assert!(t.is_blocked());
        assert!(!t.is_terminal());
    }
}
