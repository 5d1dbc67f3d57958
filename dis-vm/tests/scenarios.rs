//! End-to-end scenarios driving the engine directly against hand-assembled
//! modules: construct a tiny binary with `dis-asm`'s encoders, parse and
//! link it, then step the engine to completion and inspect the result.
//! Mirrors the "construct then exercise" shape of the unit tests already
//! living alongside each engine module, just wired end to end.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dis_asm::{write_operand, AddrCode, AddrMode, Instruction, MidAddrMode, Opcode, Operand, PanicReason};

use dis_vm::engine::control::Scheduling;
use dis_vm::engine::{self, ExecContext, StepOutcome};
use dis_vm::frame::FrameId;
use dis_vm::gc::{self, Epoch};
use dis_vm::heap::{self, channel, header::TypeDescriptor, string, Colour, Pointer};
use dis_vm::module::{ModRef, Module};
use dis_vm::registers::{Registers, ThreadState};
use dis_vm::rendezvous::Lcg;
use dis_vm::tool::{EventContext, ToolController, ToolEvent};

/// A `Scheduling` host for scenarios with no `spawn`/`load` opcodes.
struct NoHost;
impl Scheduling for NoHost {
    fn spawn_thread(&mut self, _module: Arc<ModRef>, _entry_pc: dis_types::Pc, _frame_type: Arc<TypeDescriptor>) -> u32 {
        panic!("scenario does not spawn threads")
    }
    fn load_module(&mut self, _path: &str) -> Result<Arc<ModRef>, PanicReason> {
        panic!("scenario does not load modules")
    }
}

fn no_operand() -> (AddrCode, Operand, Operand, Operand) {
    (
        AddrCode {
            mid: MidAddrMode::None,
            src: AddrMode::None,
            dest: AddrMode::None,
        },
        Operand::Absent,
        Operand::Absent,
        Operand::Absent,
    )
}

fn encode(out: &mut Vec<u8>, opcode: Opcode, addr: AddrCode, mid: Operand, src: Operand, dest: Operand) {
    Instruction { opcode, addr, mid, src, dest }.encode(out);
}

/// Header + code (no types, no data, no exports, no imports, no handlers).
fn bare_module(name: &str, code: &[u8], instr_count: usize) -> Vec<u8> {
    assembled_module(name, code, instr_count, 0, &[], false)
}

/// Same as [`bare_module`] but with a handler section appended.
fn assembled_module(
    name: &str,
    code: &[u8],
    instr_count: usize,
    type_count: usize,
    handlers: &[u8],
    has_handlers: bool,
) -> Vec<u8> {
    let mut out = Vec::new();
    write_operand(dis_vm::consts::MAGIC_UNSIGNED as i32, &mut out);
    let flags = if has_handlers { dis_vm::consts::RUNTIME_FLAG_HAS_HANDLER as i32 } else { 0 };
    write_operand(flags, &mut out); // runtime flags
    write_operand(4096, &mut out); // stack extent
    write_operand(instr_count as i32, &mut out); // code size (instruction count)
    write_operand(0, &mut out); // data size
    write_operand(type_count as i32, &mut out); // type size
    write_operand(0, &mut out); // export size
    write_operand(-1, &mut out); // entry pc
    write_operand(-1, &mut out); // entry type
    out.extend_from_slice(code);
    // no type entries (type_count is always 0 in these scenarios)
    out.push(0); // data section terminator
    out.extend_from_slice(name.as_bytes());
    out.push(0);
    // export section: 0 entries, nothing to write
    // import section: has_import() is false, nothing to write
    if has_handlers {
        out.extend_from_slice(handlers);
    }
    out
}

fn link(bytes: &[u8]) -> Arc<ModRef> {
    let module = Arc::new(Module::parse(bytes).unwrap());
    Arc::new(ModRef::new(module, &[]).unwrap())
}

/// Builds a fresh register file with one active frame of `frame_size`
/// bytes, positioned at `entry_pc` in `modref`, mirroring
/// `Scheduler::spawn_thread_impl`'s setup.
fn harness(modref: &Arc<ModRef>, frame_size: usize, entry_pc: dis_types::Pc) -> (Registers, FrameId) {
    let mut regs = Registers::new();
    regs.mp_base = modref.mp;
    regs.module = Some(Arc::clone(modref));
    let frame_id = regs.stack.alloc_frame(TypeDescriptor::plain(frame_size)).unwrap();
    regs.stack.push_frame(frame_id, entry_pc, None);
    regs.pc = entry_pc;
    regs.next_pc = entry_pc;
    (regs, frame_id)
}

fn step_to_terminal(regs: &mut Registers, modref: &Arc<ModRef>, host: &mut dyn Scheduling) {
    let mut lcg = Lcg::new(1);
    loop {
        let mut ctx = ExecContext {
            module: &modref.module,
            host: &mut *host,
            lcg: &mut lcg,
            tool: None,
        };
        match engine::step(regs, &mut ctx).unwrap() {
            StepOutcome::Continue => continue,
            StepOutcome::Terminal => break,
            StepOutcome::Blocked => panic!("unexpected block at pc {}", regs.pc),
        }
    }
}

fn word_offset(payload: *mut u8, word: i32) -> *mut u8 {
    unsafe { payload.offset(word as isize * dis_vm::consts::WORD_SIZE as isize) }
}

/// Integer add: two immediate loads, one `addw`, then `exit`; the result
/// frame slot must hold the sum.
#[test]
fn integer_add_scenario() {
    let mut code = Vec::new();
    // movw $3 -> fp[0]
    encode(
        &mut code,
        Opcode::Movw,
        AddrCode { mid: MidAddrMode::None, src: AddrMode::Immediate, dest: AddrMode::OffsetIndirectFp },
        Operand::Absent,
        Operand::Single(3),
        Operand::Single(0),
    );
    // movw $4 -> fp[1]
    encode(
        &mut code,
        Opcode::Movw,
        AddrCode { mid: MidAddrMode::None, src: AddrMode::Immediate, dest: AddrMode::OffsetIndirectFp },
        Operand::Absent,
        Operand::Single(4),
        Operand::Single(1),
    );
    // addw fp[0], fp[1] -> fp[2]
    encode(
        &mut code,
        Opcode::Addw,
        AddrCode { mid: MidAddrMode::SmallOffsetIndirectFp, src: AddrMode::OffsetIndirectFp, dest: AddrMode::OffsetIndirectFp },
        Operand::Single(0),
        Operand::Single(1),
        Operand::Single(2),
    );
    let (addr, mid, src, dest) = no_operand();
    encode(&mut code, Opcode::Exit, addr, mid, src, dest);

    let bytes = bare_module("addtest", &code, 4);
    let modref = link(&bytes);
    let (mut regs, frame_id) = harness(&modref, 12, 0);
    let mut host = NoHost;
    step_to_terminal(&mut regs, &modref, &mut host);

    let payload = regs.stack.payload_ptr(frame_id);
    let result: i32 = unsafe { (word_offset(payload, 2) as *const i32).read_unaligned() };
    assert_eq!(result, 7);
}

/// Channel handshake: a receiver blocks on an empty rendezvous channel,
/// then unblocks once a sender's value lands.
#[test]
fn channel_handshake_scenario() {
    let mut sender_code = Vec::new();
    encode(
        &mut sender_code,
        Opcode::Send,
        AddrCode { mid: MidAddrMode::None, src: AddrMode::OffsetIndirectFp, dest: AddrMode::OffsetIndirectFp },
        Operand::Absent,
        Operand::Single(0),
        Operand::Single(2),
    );
    let (addr, mid, src, dest) = no_operand();
    encode(&mut sender_code, Opcode::Exit, addr, mid, src, dest);
    let sender_bytes = bare_module("sender", &sender_code, 2);

    let mut recv_code = Vec::new();
    encode(
        &mut recv_code,
        Opcode::Recv,
        AddrCode { mid: MidAddrMode::None, src: AddrMode::OffsetIndirectFp, dest: AddrMode::OffsetIndirectFp },
        Operand::Absent,
        Operand::Single(0),
        Operand::Single(2),
    );
    let (addr, mid, src, dest) = no_operand();
    encode(&mut recv_code, Opcode::Exit, addr, mid, src, dest);
    let recv_bytes = bare_module("receiver", &recv_code, 2);

    let sender_ref = link(&sender_bytes);
    let recv_ref = link(&recv_bytes);

    let chan = channel::alloc_channel(4, false, 0, Colour::White);

    // Frame layout: word0 (8 bytes) channel pointer, word2 (4 bytes) value.
    let (mut send_regs, send_frame) = harness(&sender_ref, 12, 0);
    let (mut recv_regs, recv_frame) = harness(&recv_ref, 12, 0);

    unsafe {
        let sp = send_regs.stack.payload_ptr(send_frame);
        (word_offset(sp, 0) as *mut Pointer).write_unaligned(Some(chan));
        (word_offset(sp, 2) as *mut i32).write_unaligned(77);

        let rp = recv_regs.stack.payload_ptr(recv_frame);
        (word_offset(rp, 0) as *mut Pointer).write_unaligned(Some(chan));
        (word_offset(rp, 2) as *mut i32).write_unaligned(0);
    }

    let mut lcg = Lcg::new(1);
    let mut host = NoHost;

    // The receiver runs first against an empty channel and blocks.
    {
        let mut ctx = ExecContext { module: &recv_ref.module, host: &mut host, lcg: &mut lcg, tool: None };
        let outcome = engine::step(&mut recv_regs, &mut ctx).unwrap();
        assert_eq!(outcome, StepOutcome::Blocked);
        assert_eq!(recv_regs.state, ThreadState::BlockedReceiving);
    }

    // The sender completes its send unconditionally (rendezvous capacity 0
    // hands the value straight to the channel's waiting-sender slot).
    step_to_terminal(&mut send_regs, &sender_ref, &mut host);

    // Retrying the receiver's blocked `recv` now finds the value.
    recv_regs.pc = 0; // retry the same instruction, as the scheduler would
    recv_regs.state = ThreadState::Running;
    {
        let mut ctx = ExecContext { module: &recv_ref.module, host: &mut host, lcg: &mut lcg, tool: None };
        let outcome = engine::step(&mut recv_regs, &mut ctx).unwrap();
        assert_eq!(outcome, StepOutcome::Continue);
    }
    step_to_terminal(&mut recv_regs, &recv_ref, &mut host);

    let rp = recv_regs.stack.payload_ptr(recv_frame);
    let received: i32 = unsafe { (word_offset(rp, 2) as *const i32).read_unaligned() };
    assert_eq!(received, 77);

    heap::dec(Some(chan));
}

/// Exception unwind: `raise` inside a handler's `[begin_pc, end_pc)` jumps
/// to the handler's wildcard target instead of terminating the thread.
#[test]
fn exception_unwind_scenario() {
    let mut code = Vec::new();
    // pc0: raise *fp[0]
    encode(
        &mut code,
        Opcode::Raise,
        AddrCode { mid: MidAddrMode::None, src: AddrMode::OffsetIndirectFp, dest: AddrMode::None },
        Operand::Absent,
        Operand::Single(0),
        Operand::Absent,
    );
    // pc1: exit (dead code if the raise is caught)
    let (addr, mid, src, dest) = no_operand();
    encode(&mut code, Opcode::Exit, addr, mid, src, dest);
    // pc2: movw $1 -> fp[2] (the handler's landing pad)
    encode(
        &mut code,
        Opcode::Movw,
        AddrCode { mid: MidAddrMode::None, src: AddrMode::Immediate, dest: AddrMode::OffsetIndirectFp },
        Operand::Absent,
        Operand::Single(1),
        Operand::Single(2),
    );
    // pc3: exit
    let (addr, mid, src, dest) = no_operand();
    encode(&mut code, Opcode::Exit, addr, mid, src, dest);

    // One handler covering [0, 1) with a wildcard target of pc 2.
    let mut handler_bytes = Vec::new();
    write_operand(1, &mut handler_bytes); // handler count
    write_operand(-1, &mut handler_bytes); // exception_offset (unused)
    write_operand(0, &mut handler_bytes); // begin_pc
    write_operand(1, &mut handler_bytes); // end_pc
    write_operand(-1, &mut handler_bytes); // type_desc_index (no reinit)
    write_operand(1, &mut handler_bytes); // packed: 0 named cases, 1 total
    write_operand(2, &mut handler_bytes); // wildcard target pc

    let bytes = assembled_module("catcher", &code, 4, 0, &handler_bytes, true);
    let modref = link(&bytes);
    let (mut regs, frame_id) = harness(&modref, 12, 0);

    unsafe {
        let payload = regs.stack.payload_ptr(frame_id);
        let name = string::alloc_str("Oops", Colour::White);
        (word_offset(payload, 0) as *mut Pointer).write_unaligned(Some(name));
    }

    let mut host = NoHost;
    let mut lcg = Lcg::new(1);

    {
        let mut ctx = ExecContext { module: &modref.module, host: &mut host, lcg: &mut lcg, tool: None };
        let outcome = engine::step(&mut regs, &mut ctx).unwrap();
        assert_eq!(outcome, StepOutcome::Continue, "a caught raise keeps the thread running");
        assert_eq!(regs.pc, 2);
    }

    step_to_terminal(&mut regs, &modref, &mut host);

    let payload = regs.stack.payload_ptr(frame_id);
    let marker: i32 = unsafe { (word_offset(payload, 2) as *const i32).read_unaligned() };
    assert_eq!(marker, 1, "the handler's landing pad ran");
}

/// `nbalt` with no ready case falls through to its literal default target
/// instead of blocking.
#[test]
fn alt_non_blocking_scenario() {
    let mut code = Vec::new();
    // pc0: nbalt *fp[0] -> default pc 2
    encode(
        &mut code,
        Opcode::Nbalt,
        AddrCode { mid: MidAddrMode::None, src: AddrMode::OffsetIndirectFp, dest: AddrMode::Immediate },
        Operand::Absent,
        Operand::Single(0),
        Operand::Single(2),
    );
    let (addr, mid, src, dest) = no_operand();
    encode(&mut code, Opcode::Exit, addr, mid, src, dest); // pc1, dead
    // pc2: movw $1 -> fp[6] (the fallback landing pad)
    encode(
        &mut code,
        Opcode::Movw,
        AddrCode { mid: MidAddrMode::None, src: AddrMode::Immediate, dest: AddrMode::OffsetIndirectFp },
        Operand::Absent,
        Operand::Single(1),
        Operand::Single(6),
    );
    let (addr, mid, src, dest) = no_operand();
    encode(&mut code, Opcode::Exit, addr, mid, src, dest); // pc3

    let bytes = bare_module("altest", &code, 4);
    let modref = link(&bytes);
    // Table: send_count(4) + recv_count(4) + one case (channel 8B + data 8B) = 24B,
    // landing pad marker at word 6 (byte 24).
    let (mut regs, frame_id) = harness(&modref, 28, 0);

    let chan = channel::alloc_channel(4, false, 1, Colour::White); // empty, nothing to receive
    let spare = Box::leak(Box::new(0i32)) as *mut i32 as *mut u8;

    unsafe {
        let payload = regs.stack.payload_ptr(frame_id);
        (payload as *mut i32).write_unaligned(0); // send_count
        (payload.add(4) as *mut i32).write_unaligned(1); // recv_count
        (payload.add(8) as *mut Pointer).write_unaligned(Some(chan));
        (payload.add(16) as *mut Pointer).write_unaligned(NonNull::new(spare));
    }

    let mut host = NoHost;
    step_to_terminal(&mut regs, &modref, &mut host);

    let payload = regs.stack.payload_ptr(frame_id);
    let marker: i32 = unsafe { (word_offset(payload, 6) as *const i32).read_unaligned() };
    assert_eq!(marker, 1, "nbalt fell through to its default target");

    heap::dec(Some(chan));
}

/// A pointer cycle unreachable from any thread's roots is reclaimed by the
/// tricolour collector, not by refcounting alone.
#[test]
fn gc_reclaims_cycles_scenario() {
    static FREED: AtomicUsize = AtomicUsize::new(0);
    fn finalizer(_: *mut u8) {
        FREED.fetch_add(1, Ordering::SeqCst);
    }
    FREED.store(0, Ordering::SeqCst);

    let td = Arc::new(TypeDescriptor {
        size_in_bytes: std::mem::size_of::<usize>(),
        pointer_bitmap: vec![0x80],
        finalizer: Some(finalizer),
    });
    let a = heap::allocate(Arc::clone(&td), Colour::White);
    let b = heap::allocate(Arc::clone(&td), Colour::White);
    unsafe {
        (a.as_ptr() as *mut Pointer).write(Some(b));
        (b.as_ptr() as *mut Pointer).write(Some(a));
    }
    heap::inc(Some(b));
    heap::inc(Some(a));
    // Each now has refcount 2 (its own allocation plus the other's pointer
    // field) and neither is reachable from any thread.

    let mut stub = Registers::new();
    let epoch = Epoch::new();
    for _ in 0..6 {
        gc::collect(std::iter::once(&mut stub), &epoch);
    }

    assert_eq!(FREED.load(Ordering::SeqCst), 2);
}

/// A breakpoint fires the subscribed tool callback before the instruction
/// at that pc still runs to completion.
#[test]
fn breakpoint_scenario() {
    let mut code = Vec::new();
    encode(
        &mut code,
        Opcode::Movw,
        AddrCode { mid: MidAddrMode::None, src: AddrMode::Immediate, dest: AddrMode::OffsetIndirectFp },
        Operand::Absent,
        Operand::Single(9),
        Operand::Single(0),
    );
    let (addr, mid, src, dest) = no_operand();
    encode(&mut code, Opcode::Exit, addr, mid, src, dest);

    let bytes = bare_module("dbgtest", &code, 2);
    let modref = link(&bytes);
    let (mut regs, frame_id) = harness(&modref, 4, 0);

    let tool = ToolController::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let hits2 = Arc::clone(&hits);
    let sub = tool.subscribe(ToolEvent::Breakpoint, move |ctx: &EventContext| {
        assert_eq!(ctx.pc, Some(0));
        hits2.fetch_add(1, Ordering::SeqCst);
    });
    assert!(tool.set_breakpoint(sub, "dbgtest", 0, Opcode::Movw as u8));

    let mut host = NoHost;
    let mut lcg = Lcg::new(1);
    {
        let mut ctx = ExecContext {
            module: &modref.module,
            host: &mut host,
            lcg: &mut lcg,
            tool: Some(Arc::clone(&tool)),
        };
        let outcome = engine::step(&mut regs, &mut ctx).unwrap();
        assert_eq!(outcome, StepOutcome::Continue, "the breakpointed instruction still executes");
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let payload = regs.stack.payload_ptr(frame_id);
    let value: i32 = unsafe { (payload as *const i32).read_unaligned() };
    assert_eq!(value, 9, "movw ran despite the breakpoint");

    step_to_terminal(&mut regs, &modref, &mut host);
}
