use dis_asm::{AddrCode, AddrMode, Instruction, MidAddrMode, Opcode, Operand};

#[test]
fn a_short_function_prologue_round_trips() {
    // frame <type>; movp (fp) -> (fp)  -- a plausible two-instruction prologue.
    let frame = Instruction {
        opcode: Opcode::Frame,
        addr: AddrCode {
            mid: MidAddrMode::SmallImmediate,
            src: AddrMode::None,
            dest: AddrMode::None,
        },
        mid: Operand::Single(2),
        src: Operand::Absent,
        dest: Operand::Absent,
    };
    let movp = Instruction {
        opcode: Opcode::Movp,
        addr: AddrCode {
            mid: MidAddrMode::None,
            src: AddrMode::OffsetIndirectFp,
            dest: AddrMode::OffsetIndirectFp,
        },
        mid: Operand::Absent,
        src: Operand::Single(16),
        dest: Operand::Single(24),
    };

    let mut code = Vec::new();
    frame.encode(&mut code);
    movp.encode(&mut code);

    let (decoded_frame, n1) = Instruction::decode(&code).unwrap();
    assert_eq!(decoded_frame, frame);
    let (decoded_movp, n2) = Instruction::decode(&code[n1..]).unwrap();
    assert_eq!(decoded_movp, movp);
    assert_eq!(n1 + n2, code.len());
}

#[test]
fn opcode_checkpoints_cover_every_family() {
    for op in [
        Opcode::Alt,
        Opcode::Send,
        Opcode::Recv,
        Opcode::Raise,
        Opcode::Casew,
        Opcode::Casec,
        Opcode::Casel,
        Opcode::Mulx,
        Opcode::Mulx0,
        Opcode::Mulx1,
        Opcode::Load,
        Opcode::Mcall,
        Opcode::Brkpt,
    ] {
        assert_eq!(Opcode::from_byte(op as u8), Some(op));
    }
}
