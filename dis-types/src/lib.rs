//! Atomic value types of the Dis virtual machine.
//!
//! Collects the scalar types the bytecode operates over, shared by
//! [`dis-asm`](https://docs.rs/dis-asm) (which encodes them) and
//! `dis-vm` (which interprets them), kept dependency-free so neither
//! downstream crate has to pull in the other just to name a register
//! width.

#![warn(missing_docs)]

/// An 8-bit value, the Dis `byte` primitive type.
pub type DisByte = u8;

/// A 16-bit signed value, the Dis `short word` (`big`-adjacent small integer).
pub type DisShort = i16;

/// A 32-bit signed value, the Dis `word` primitive type. Also the unit in
/// which operand-encoded integers and instruction addresses are expressed.
pub type DisWord = i32;

/// A 64-bit signed value, the Dis `big` primitive type.
pub type DisBig = i64;

/// A 32-bit IEEE float, the Dis `short real` primitive type.
pub type DisShortReal = f32;

/// A 64-bit IEEE float, the Dis `real` primitive type.
pub type DisReal = f64;

/// A single Unicode scalar value, the Dis `rune` primitive type.
pub type DisRune = char;

/// An index into a module's code section.
pub type Pc = i32;

/// Sentinel `pc` value meaning "no entry point" / "no previous frame".
pub const INVALID_PC: Pc = -1;

/// Sentinel type-descriptor index meaning "no handler reinitialization type".
pub const NO_TYPE_DESC: i32 = -1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_sizes_match_spec() {
        assert_eq!(core::mem::size_of::<DisWord>(), 4);
        assert_eq!(core::mem::size_of::<DisBig>(), 8);
        assert_eq!(core::mem::size_of::<DisShort>(), 2);
    }
}
