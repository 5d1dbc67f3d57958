//! Decoded, addressable form of a single Dis instruction.

use crate::addr::{AddrCode, AddrMode, MidAddrMode};
use crate::opcode::Opcode;
use crate::operand::{read_operand, write_operand, TruncatedOperand};

/// One operand slot as read from the code section: a single register/offset
/// value, or a double-indirect pair `(outer, inner)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    /// Operand absent for this instruction.
    Absent,
    /// A single offset, immediate, or small-immediate value.
    Single(i32),
    /// A double-indirect offset: `(outer offset from MP/FP, inner offset)`.
    Double(i32, i32),
}

impl Operand {
    /// The primary (outer) register value, if present.
    pub fn register1(self) -> Option<i32> {
        match self {
            Operand::Absent => None,
            Operand::Single(r) => Some(r),
            Operand::Double(r, _) => Some(r),
        }
    }

    /// The secondary (inner) register value, for double-indirect operands.
    pub fn register2(self) -> Option<i32> {
        match self {
            Operand::Double(_, r) => Some(r),
            _ => None,
        }
    }
}

/// A fully decoded instruction: opcode, addressing modes, and operand
/// values, as they appear in a module's code section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Instruction {
    /// The operation to perform.
    pub opcode: Opcode,
    /// Addressing modes for the three operand slots.
    pub addr: AddrCode,
    /// Middle operand.
    pub mid: Operand,
    /// Source operand.
    pub src: Operand,
    /// Destination operand.
    pub dest: Operand,
}

/// Why decoding an instruction from a byte stream failed.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    /// The byte stream ended before a complete instruction could be read.
    #[error("truncated instruction")]
    Truncated,
    /// The opcode byte did not name a known opcode.
    #[error("unknown opcode byte {0:#04x}")]
    UnknownOpcode(u8),
}

impl From<TruncatedOperand> for DecodeError {
    fn from(_: TruncatedOperand) -> Self {
        DecodeError::Truncated
    }
}

impl Instruction {
    /// Decodes one instruction starting at `bytes[0]`, returning it and the
    /// number of bytes consumed.
    pub fn decode(bytes: &[u8]) -> Result<(Instruction, usize), DecodeError> {
        let &op_byte = bytes.first().ok_or(DecodeError::Truncated)?;
        let opcode = Opcode::from_byte(op_byte).ok_or(DecodeError::UnknownOpcode(op_byte))?;
        let &addr_byte = bytes.get(1).ok_or(DecodeError::Truncated)?;
        let addr = AddrCode::decode(addr_byte);

        let mut cursor = 2usize;

        let mid = if addr.mid == MidAddrMode::None {
            Operand::Absent
        } else {
            let (v, n) = read_operand(&bytes[cursor..])?;
            cursor += n;
            Operand::Single(v)
        };

        let src = read_operand_slot(addr.src, bytes, &mut cursor)?;
        let dest = read_operand_slot(addr.dest, bytes, &mut cursor)?;

        Ok((
            Instruction {
                opcode,
                addr,
                mid,
                src,
                dest,
            },
            cursor,
        ))
    }

    /// Encodes the instruction back to its wire form, appending to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.opcode as u8);
        out.push(self.addr.encode());
        if let Some(r) = self.mid.register1() {
            write_operand(r, out);
        }
        write_operand_slot(self.src, out);
        write_operand_slot(self.dest, out);
    }
}

fn read_operand_slot(
    mode: AddrMode,
    bytes: &[u8],
    cursor: &mut usize,
) -> Result<Operand, DecodeError> {
    if mode == AddrMode::None {
        return Ok(Operand::Absent);
    }

    let (r1, n) = read_operand(&bytes[*cursor..])?;
    *cursor += n;

    if mode.is_double_indirect() {
        let (r2, n2) = read_operand(&bytes[*cursor..])?;
        *cursor += n2;
        Ok(Operand::Double(r1, r2))
    } else {
        Ok(Operand::Single(r1))
    }
}

fn write_operand_slot(operand: Operand, out: &mut Vec<u8>) {
    match operand {
        Operand::Absent => {}
        Operand::Single(r) => write_operand(r, out),
        Operand::Double(r1, r2) => {
            write_operand(r1, out);
            write_operand(r2, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::MidAddrMode;

    #[test]
    fn decode_encode_roundtrip_simple_move() {
        let addr = AddrCode {
            mid: MidAddrMode::None,
            src: AddrMode::Immediate,
            dest: AddrMode::OffsetIndirectFp,
        };
        let instr = Instruction {
            opcode: Opcode::Movw,
            addr,
            mid: Operand::Absent,
            src: Operand::Single(42),
            dest: Operand::Single(8),
        };

        let mut bytes = Vec::new();
        instr.encode(&mut bytes);
        let (decoded, consumed) = Instruction::decode(&bytes).unwrap();
        assert_eq!(decoded, instr);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn decode_encode_roundtrip_double_indirect() {
        let addr = AddrCode {
            mid: MidAddrMode::SmallImmediate,
            src: AddrMode::OffsetDoubleIndirectMp,
            dest: AddrMode::None,
        };
        let instr = Instruction {
            opcode: Opcode::Indx,
            addr,
            mid: Operand::Single(3),
            src: Operand::Double(100, -7),
            dest: Operand::Absent,
        };

        let mut bytes = Vec::new();
        instr.encode(&mut bytes);
        let (decoded, consumed) = Instruction::decode(&bytes).unwrap();
        assert_eq!(decoded, instr);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn unknown_opcode_byte_rejected() {
        let bytes = [0xb5u8, 0x00];
        assert_eq!(
            Instruction::decode(&bytes),
            Err(DecodeError::UnknownOpcode(0xb5))
        );
    }
}
