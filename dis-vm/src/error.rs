//! Runtime and module-load error types, plus stack backtrace rendering.

use dis_asm::PanicReason;
use dis_types::Pc;

/// A malformed module. Carries a one-line diagnostic, per §4.B's "any
/// malformed field produces a module-reader error carrying a one-line
/// diagnostic."
#[derive(Debug, Clone, thiserror::Error)]
#[error("module load error: {0}")]
pub struct ModuleLoadError(pub String);

impl ModuleLoadError {
    /// Builds a diagnostic from a `format!`-style message.
    pub fn new(message: impl Into<String>) -> Self {
        ModuleLoadError(message.into())
    }
}

/// An error raised while executing one instruction.
///
/// `Recoverable` becomes a Limbo exception raise (§4.E); `Halt` is fatal to
/// the whole VM (§7's `system_exception` row). `Resolver` carries a failure
/// from the module resolver chain (§4.B's `load` opcode), generic over the
/// resolver's own error type exactly as the loader's resolver trait is.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError<E> {
    /// A well-formed panic that the bytecode can catch with a handler.
    #[error("recoverable panic: {0}")]
    Recoverable(PanicReason),
    /// A panic that halts the owning thread or the whole VM.
    #[error("fatal panic: {0}")]
    Halt(PanicReason),
    /// The module resolver chain failed to resolve or read a module.
    #[error("module resolution failed: {0:?}")]
    Resolver(E),
}

impl<E> RuntimeError<E> {
    /// True if the bytecode may catch this with a handler.
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Recoverable(_))
    }

    /// True if this must halt the owning thread (or the VM).
    pub const fn must_halt(&self) -> bool {
        !self.is_recoverable()
    }

    /// The panic reason, when this carries one.
    pub const fn panic_reason(&self) -> Option<&PanicReason> {
        match self {
            Self::Recoverable(r) | Self::Halt(r) => Some(r),
            Self::Resolver(_) => None,
        }
    }
}

impl<E> From<PanicReason> for RuntimeError<E> {
    fn from(reason: PanicReason) -> Self {
        Self::Recoverable(reason)
    }
}

/// Top-level error returned from module loading and thread execution.
#[derive(Debug, thiserror::Error)]
pub enum InterpreterError<E> {
    /// An instruction-level runtime error.
    #[error(transparent)]
    Runtime(#[from] RuntimeError<E>),
    /// A module failed to parse.
    #[error(transparent)]
    ModuleLoad(#[from] ModuleLoadError),
}

impl<E> InterpreterError<E> {
    /// The panic reason, when this wraps one.
    pub fn panic_reason(&self) -> Option<&PanicReason> {
        match self {
            Self::Runtime(e) => e.panic_reason(),
            Self::ModuleLoad(_) => None,
        }
    }
}

/// One recorded frame in a backtrace: the module it was executing in, and
/// the program counter at the point of capture.
#[derive(Debug, Clone)]
pub struct BacktraceFrame {
    /// Module name, as recorded in its module-name section.
    pub module_name: String,
    /// Program counter within that module at the time of capture.
    pub pc: Pc,
}

/// A captured stack trace, innermost frame first. Rendered per §7: "a stack
/// trace (module name + pc per frame) to stderr".
#[derive(Debug, Clone, Default)]
pub struct Backtrace {
    /// Frames from the faulting frame outward to the root.
    pub frames: Vec<BacktraceFrame>,
}

impl Backtrace {
    /// An empty backtrace.
    pub fn new() -> Backtrace {
        Backtrace::default()
    }

    /// Appends a frame, innermost-first.
    pub fn push(&mut self, module_name: impl Into<String>, pc: Pc) {
        self.frames.push(BacktraceFrame {
            module_name: module_name.into(),
            pc,
        });
    }
}

impl std::fmt::Display for Backtrace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for frame in &self.frames {
            writeln!(f, "  {} pc={}", frame.module_name, frame.pc)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backtrace_renders_one_line_per_frame() {
        let mut bt = Backtrace::new();
        bt.push("main", 10);
        bt.push("lib", 42);
        let rendered = bt.to_string();
        assert!(rendered.contains("main pc=10"));
        assert!(rendered.contains("lib pc=42"));
    }

    #[test]
    fn runtime_error_distinguishes_recoverable_from_halt() {
        let recoverable: RuntimeError<()> = RuntimeError::Recoverable(PanicReason::DivideByZero);
        assert!(recoverable.is_recoverable());
        let halt: RuntimeError<()> = RuntimeError::Halt(PanicReason::SystemException);
        assert!(halt.must_halt());
    }
}
