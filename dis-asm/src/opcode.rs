//! Instruction opcodes of the Dis virtual machine.

use core::fmt;

/// A single Dis VM instruction code.
///
/// Discriminants match the reference `opcode_t` enumeration exactly: bytecode
/// written against one is readable by the other without translation. The
/// family groupings below follow how the engine's handler table is laid out
/// rather than strict discriminant order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
#[non_exhaustive]
pub enum Opcode {
    /// Reserved; never emitted by a valid module.
    Invalid = 0x00,

    /// Block on the first ready case of a multi-channel select.
    ///
    /// #### Execution
    /// Evaluates the alt statement's channel array (`src`) against its case
    /// table (`mid`), permuting candidate order with the thread's LCG state.
    /// See the channel rendezvous design for the full algorithm.
    Alt,
    /// Non-blocking variant of [`Opcode::Alt`]; falls through to the table's
    /// default case instead of blocking when nothing is ready.
    Nbalt,
    /// Unconditional jump to an immediate pc.
    Goto,
    /// Call a function in the current module, pushing a new frame.
    Call,
    /// Allocate (but do not activate) a frame of the type named by `mid`.
    Frame,
    /// Spawn a new thread executing the function at `src` with frame `mid`.
    Spawn,
    /// Runtime-only marker opcode; reserved, not encodable from source.
    Runt,
    /// Resolve and link a module, producing a new module reference.
    Load,
    /// Call into a built-in module's native function directly.
    Mcall,
    /// Spawn a thread whose entry point lives in an imported module.
    Mspawn,
    /// Allocate a frame described by an imported module's export table.
    Mframe,
    /// Pop the current frame and resume the caller.
    ///
    /// #### Execution
    /// With an empty stack this ends the thread (`empty_stack` state)
    /// instead of faulting.
    Ret,
    /// Jump through a jump table indexed by the `src` register.
    Jmp,
    /// Dispatch on a `word` value via an ordered range table.
    Casew,
    /// Terminate the thread immediately.
    Exit,
    /// Allocate a value of the type named by `mid`.
    New,
    /// Allocate an array of the element type named by `mid`.
    Newa,
    /// Allocate a channel of `byte` element type.
    Newcb,
    /// Allocate a channel of `word` element type.
    Newcw,
    /// Allocate a channel of `real` element type.
    Newcf,
    /// Allocate a channel of pointer element type.
    Newcp,
    /// Allocate a channel whose elements are arbitrary Dis values.
    Newcm,
    /// Allocate a channel whose elements are arbitrary Dis values, buffered.
    Newcmp,
    /// Rendezvous send on a channel. See §4.F.
    Send,
    /// Rendezvous receive on a channel. See §4.F.
    Recv,
    /// Cons a `byte` onto a list.
    Consb,
    /// Cons a `word` onto a list.
    Consw,
    /// Cons a pointer onto a list.
    Consp,
    /// Cons a `real` onto a list.
    Consf,
    /// Cons an arbitrary Dis value onto a list.
    Consm,
    /// Cons an arbitrary Dis value onto a list, typed-fixup variant.
    Consmp = 0x1f,
    /// Read the `byte` head of a list.
    Headb,
    /// Read the `word` head of a list.
    Headw,
    /// Read the pointer head of a list.
    Headp,
    /// Read the `real` head of a list.
    Headf,
    /// Read the arbitrary-value head of a list.
    Headm,
    /// Read the arbitrary-value head of a list, typed-fixup variant.
    Headmp,
    /// Read the tail of a list.
    Tail,
    /// Load the effective address of an operand, without dereferencing.
    Lea,
    /// Index an array, producing the element's address.
    Indx,
    /// Move a pointer, adjusting refcounts on source and destination.
    Movp,
    /// Move a value using a type descriptor's memmove-with-fixup semantics.
    Movm,
    /// Move a value using a type descriptor, pointer-fixup variant.
    Movmp,
    /// Move a `byte`.
    Movb,
    /// Move a `word`.
    Movw,
    /// Move a `real`.
    Movf,
    /// Convert `byte` to `word`.
    Cvtbw,
    /// Convert `word` to `byte`, truncating.
    Cvtwb,
    /// Convert `real` to `word`, truncating toward zero.
    Cvtfw,
    /// Convert `word` to `real`.
    Cvtwf,
    /// Convert a character (rune) to an ASCII-promoted string.
    Cvtca,
    /// Convert an ASCII array to a string.
    Cvtac,
    /// Convert `word` to a one-rune string.
    Cvtwc,
    /// Convert a one-rune string to `word`.
    Cvtcw,
    /// Convert `real` to a decimal string.
    Cvtfc,
    /// Convert a decimal string to `real`.
    Cvtcf,
    /// Add two `byte` values.
    Addb,
    /// Add two `word` values.
    Addw,
    /// Add two `real` values.
    Addf,
    /// Subtract two `byte` values.
    Subb,
    /// Subtract two `word` values.
    Subw,
    /// Subtract two `real` values.
    Subf,
    /// Multiply two `byte` values.
    Mulb = 0x3f,
    /// Multiply two `word` values.
    Mulw,
    /// Multiply two `real` values.
    Mulf,
    /// Divide two `byte` values. Raises `divide_by_zero` on a zero divisor.
    Divb,
    /// Divide two `word` values. Raises `divide_by_zero` on a zero divisor.
    Divw,
    /// Divide two `real` values. IEEE semantics; never raises.
    Divf,
    /// Modulus of two `word` values. Raises `divide_by_zero` on a zero
    /// divisor.
    Modw,
    /// Modulus of two `byte` values. Raises `divide_by_zero` on a zero
    /// divisor.
    Modb,
    /// Bitwise AND of two `byte` values.
    Andb,
    /// Bitwise AND of two `word` values.
    Andw,
    /// Bitwise OR of two `byte` values.
    Orb,
    /// Bitwise OR of two `word` values.
    Orw,
    /// Bitwise XOR of two `byte` values.
    Xorb,
    /// Bitwise XOR of two `word` values.
    Xorw,
    /// Left shift of a `byte` value.
    Shlb,
    /// Left shift of a `word` value.
    Shlw,
    /// Arithmetic right shift of a `byte` value.
    Shrb,
    /// Arithmetic right shift of a `word` value.
    Shrw,
    /// Insert a rune into a string at a codepoint index.
    ///
    /// #### Execution
    /// Inserting beyond the string's `max_ascii` threshold widens the
    /// representation to the rune form.
    Insc,
    /// Index a string at a codepoint index, producing a rune.
    Indc,
    /// Concatenate two strings.
    ///
    /// #### Execution
    /// If the destination aliases the mid operand with refcount 1, appends
    /// in place; otherwise constructs a fresh string.
    Addc,
    /// Length of a string, in codepoints.
    Lenc,
    /// Length of an array, in elements.
    Lena,
    /// Length of a list.
    Lenl,
    /// Branch if two `byte` values are equal.
    Beqb,
    /// Branch if two `byte` values are not equal.
    Bneb,
    /// Branch if a `byte` value is less than another.
    Bltb,
    /// Branch if a `byte` value is less than or equal to another.
    Bleb,
    /// Branch if a `byte` value is greater than another.
    Bgtb,
    /// Branch if a `byte` value is greater than or equal to another.
    Bgeb,
    /// Branch if two `word` values are equal.
    Beqw,
    /// Branch if two `word` values are not equal.
    Bnew,
    /// Branch if a `word` value is less than another.
    Bltw = 0x5f,
    /// Branch if a `word` value is less than or equal to another.
    Blew,
    /// Branch if a `word` value is greater than another.
    Bgtw,
    /// Branch if a `word` value is greater than or equal to another.
    Bgew,
    /// Branch if two `real` values are equal.
    Beqf,
    /// Branch if two `real` values are not equal.
    Bnef,
    /// Branch if a `real` value is less than another.
    Bltf,
    /// Branch if a `real` value is less than or equal to another.
    Blef,
    /// Branch if a `real` value is greater than another.
    Bgtf,
    /// Branch if a `real` value is greater than or equal to another.
    Bgef,
    /// Branch if two strings compare equal (lexicographic over codepoints).
    Beqc,
    /// Branch if two strings compare not equal.
    Bnec,
    /// Branch if a string compares less than another.
    Bltc,
    /// Branch if a string compares less than or equal to another.
    Blec,
    /// Branch if a string compares greater than another.
    Bgtc,
    /// Branch if a string compares greater than or equal to another.
    Bgec,
    /// Slice an array by reference.
    Slicea,
    /// Copy one array's contents into another at an offset.
    ///
    /// #### Execution
    /// Element types of source and destination arrays must match; mismatch
    /// raises `type_violation`.
    Slicela,
    /// Slice a string, copying the codepoint range.
    Slicec,
    /// Index a `word` array, producing the element's address.
    Indw,
    /// Index a `real` array, producing the element's address.
    Indf,
    /// Index a `byte` array, producing the element's address.
    Indb,
    /// Negate a `real` value.
    Negf,
    /// Move a `big` (64-bit integer) value.
    Movl,
    /// Add two `big` values.
    Addl,
    /// Subtract two `big` values.
    Subl,
    /// Divide two `big` values. Raises `divide_by_zero` on a zero divisor.
    Divl,
    /// Modulus of two `big` values. Raises `divide_by_zero` on a zero
    /// divisor.
    Modl,
    /// Multiply two `big` values.
    Mull,
    /// Bitwise AND of two `big` values.
    Andl,
    /// Bitwise OR of two `big` values.
    Orl,
    /// Bitwise XOR of two `big` values.
    Xorl,
    /// Left shift of a `big` value.
    Shll = 0x7f,
    /// Arithmetic right shift of a `big` value.
    Shrl,
    /// Branch if two `big` values are not equal.
    Bnel,
    /// Branch if a `big` value is less than another.
    Bltl,
    /// Branch if a `big` value is less than or equal to another.
    Blel,
    /// Branch if a `big` value is greater than another.
    Bgtl,
    /// Branch if a `big` value is greater than or equal to another.
    Bgel,
    /// Branch if two `big` values are equal.
    Beql,
    /// Convert `big` to `real`.
    Cvtlf,
    /// Convert `real` to `big`, truncating toward zero.
    Cvtfl,
    /// Convert `big` to `word`, truncating.
    Cvtlw,
    /// Convert `word` to `big`.
    Cvtwl,
    /// Convert `big` to a decimal string.
    Cvtlc,
    /// Convert a decimal string to `big`.
    Cvtcl,
    /// Read the `big` head of a list.
    Headl,
    /// Cons a `big` onto a list.
    Consl,
    /// Allocate a channel of `big` element type.
    Newcl,
    /// Dispatch on a string value via an ordered range table.
    ///
    /// #### Execution
    /// Each table entry compares against a `(low, high)` string pair;
    /// lookup exits early once lexicographic ordering rules out the rest of
    /// the table.
    Casec,
    /// Index a `big` array, producing the element's address.
    Indl,
    /// Decode-only: reserved, not implemented by the execution engine.
    Movpc,
    /// Three-way comparison between two typed values.
    Tcmp,
    /// Allocate and zero-fill a value of the type named by `mid`.
    Mnewz,
    /// Convert fixed-point `real` representation to `real`.
    Cvtrf,
    /// Convert `real` to fixed-point `real` representation.
    Cvtfr,
    /// Convert `word` to a string, radix-qualified.
    Cvtws,
    /// Convert a string to `word`, radix-qualified.
    Cvtsw,
    /// Logical (not arithmetic) right shift of a `word` value.
    Lsrw,
    /// Logical (not arithmetic) right shift of a `big` value.
    Lsrl,
    /// Unused; reserved discriminant kept for binary compatibility.
    Eclr,
    /// Allocate and zero-fill a value of the type named by `mid`.
    Newz,
    /// Allocate and zero-fill an array of the element type named by `mid`.
    Newaz,
    /// Raise an exception. See §4.E.
    Raise,
    /// Dispatch on a `big` value via an ordered range table.
    Casel,
    /// Fixed-point multiply with a power-of-two scale.
    Mulx,
    /// Fixed-point divide with a power-of-two scale.
    Divx,
    /// Fixed-point conversion with a power-of-two scale.
    Cvtxx,
    /// [`Opcode::Mulx`] with a residual scale for non-power-of-two
    /// denominators.
    Mulx0,
    /// [`Opcode::Divx`] with a residual scale for non-power-of-two
    /// denominators.
    Divx0,
    /// [`Opcode::Cvtxx`] with a residual scale for non-power-of-two
    /// denominators.
    Cvtxx0,
    /// Variant of [`Opcode::Mulx`] reading its scale from a third scratch
    /// slot.
    Mulx1,
    /// Variant of [`Opcode::Divx`] reading its scale from a third scratch
    /// slot.
    Divx1,
    /// Variant of [`Opcode::Cvtxx`] reading its scale from a third scratch
    /// slot.
    Cvtxx1,
    /// Convert `real` to fixed-point, explicit scale operand.
    Cvtfx,
    /// Convert fixed-point to `real`, explicit scale operand.
    Cvtxf,
    /// Exponentiate two `word` values.
    Expw,
    /// Exponentiate two `big` values.
    Expl,
    /// Exponentiate two `real` values.
    Expf,
    /// Decode-only: reserved, not implemented by the execution engine.
    Self_,

    /// Synthetic opcode patched over a breakpointed instruction.
    ///
    /// #### Execution
    /// Not part of the reference encoding; assigned a discriminant above
    /// [`Opcode::Self_`] since it never appears in a module's code section
    /// on disk. The original opcode byte is recovered from the tool
    /// dispatcher's side-table keyed by `(module, pc)`.
    Brkpt = 0xfe,
}

impl Opcode {
    /// Lowest valid discriminant.
    pub const FIRST: Opcode = Opcode::Invalid;
    /// Highest discriminant produced by the reference encoding (excludes the
    /// synthetic [`Opcode::Brkpt`]).
    pub const LAST: Opcode = Opcode::Self_;

    /// Decodes a raw opcode byte, rejecting values with no assigned variant.
    pub fn from_byte(b: u8) -> Option<Opcode> {
        use strum::IntoEnumIterator;
        Opcode::iter().find(|op| *op as u8 == b)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_discriminants_match_reference_layout() {
        assert_eq!(Opcode::Invalid as u8, 0x00);
        assert_eq!(Opcode::Consmp as u8, 0x1f);
        assert_eq!(Opcode::Mulb as u8, 0x3f);
        assert_eq!(Opcode::Bltw as u8, 0x5f);
        assert_eq!(Opcode::Shll as u8, 0x7f);
    }

    #[test]
    fn from_byte_roundtrips_every_variant() {
        use strum::IntoEnumIterator;
        for op in Opcode::iter() {
            assert_eq!(Opcode::from_byte(op as u8), Some(op));
        }
    }

    #[test]
    fn from_byte_rejects_unassigned_codes() {
        assert!((Opcode::Self_ as u8) < 0xb5);
        assert_eq!(Opcode::from_byte(0xb5), None);
    }
}
