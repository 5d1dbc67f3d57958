use core::fmt;

/// The reason a thread transitioned to the `broken` state, or a module
/// failed to load.
///
/// Mirrors the reference VM's built-in exception identifiers and internal
/// fault kinds. `message()` gives the exact user-visible text the reference
/// runtime raises as a Limbo exception for the reasons that originate from
/// bytecode execution; reasons with no such text are VM-internal failures
/// that never reach Limbo as a named exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
#[non_exhaustive]
pub enum PanicReason {
    /// The byte does not map to any known reason.
    UnknownPanicReason = 0x00,
    /// Integer division or modulus by zero.
    DivideByZero = 0x01,
    /// A string operation produced or consumed invalid UTF-8.
    InvalidUtf8 = 0x02,
    /// Dereference of a nil pointer.
    DereferenceNil = 0x03,
    /// Copy or move attempted between incompatible type descriptors.
    TypeViolation = 0x04,
    /// A slice or typed copy fell outside the bounds of its source or
    /// destination.
    OutOfRangeMemory = 0x05,
    /// An array or string index fell outside `0..len`.
    IndexOutOfRange = 0x06,
    /// The module loader rejected a malformed module.
    ///
    /// Fatal to the load operation; does not break a running thread.
    ModuleException = 0x07,
    /// `raise` found no handler covering the faulting pc.
    ///
    /// Fatal to the thread; transitions it to `broken`.
    UnhandledUserException = 0x08,
    /// An internal VM invariant was violated.
    ///
    /// Fatal to the VM; never caused by bytecode alone.
    SystemException = 0x09,
    /// Requested stack frame does not fit within one stack page.
    StackFrameTooLarge = 0x0a,
    /// `alt` / `nbalt` referenced a channel array index out of range.
    InvalidAltChannel = 0x0b,
    /// A built-in module function received arguments of the wrong shape.
    InvalidNativeCall = 0x0c,
    /// `movpc` or `self` was executed; the reference implementation never
    /// completed these opcodes and this runtime does not invent semantics
    /// for them.
    NotImplemented = 0x0d,
}

impl PanicReason {
    /// The exact Limbo exception text the reference runtime raises for
    /// reasons that originate from bytecode execution. `None` for reasons
    /// that are purely internal to the VM.
    pub fn message(self) -> Option<&'static str> {
        use PanicReason::*;
        match self {
            DivideByZero => Some("Divide by 0"),
            InvalidUtf8 => Some("Invalid UTF-8 string"),
            DereferenceNil => Some("Dereference of nil value"),
            TypeViolation => Some("Inconsistent types in operation"),
            OutOfRangeMemory => Some("Out of range access"),
            IndexOutOfRange => Some("Index out of range"),
            _ => None,
        }
    }
}

impl fmt::Display for PanicReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{msg}"),
            None => write!(f, "{self:?}"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for PanicReason {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytecode_reasons_carry_limbo_text() {
        assert_eq!(PanicReason::DivideByZero.message(), Some("Divide by 0"));
        assert_eq!(PanicReason::SystemException.message(), None);
    }
}
