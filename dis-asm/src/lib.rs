//! Instruction encoding for the Dis virtual machine: opcodes, addressing
//! modes, operand varints, and the panic-reason vocabulary shared between
//! the module loader and the execution engine.

#![warn(missing_docs)]

mod addr;
mod instruction;
mod opcode;
mod operand;
mod panic_reason;

pub use addr::{AddrCode, AddrMode, MidAddrMode};
pub use instruction::{DecodeError, Instruction, Operand};
pub use opcode::Opcode;
pub use operand::{read_operand, read_word, write_operand, write_word, TruncatedOperand};
pub use panic_reason::PanicReason;
