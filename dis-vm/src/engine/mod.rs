//! Central instruction dispatcher: decodes operands, routes to the opcode
//! family handlers, and advances `pc`/`next_pc` (§4.D).

pub mod arith;
pub mod arrays;
pub mod case;
pub mod channels;
pub mod control;
pub mod decode;
pub mod exceptions;
pub mod moveops;
pub mod strings;

use std::sync::Arc;

use dis_asm::{Instruction, Opcode, PanicReason};

use crate::heap::header::TypeDescriptor;
use crate::module::Module;
use crate::registers::{Registers, ThreadState};
use crate::rendezvous::Lcg;
use crate::tool::ToolController;

/// Context a dispatch pass needs beyond the executing thread's own
/// registers: the owning module (for handler/type lookups), the
/// [`control::Scheduling`] host for `spawn`/`load`, and per-thread state
/// ([`Lcg`]) an `alt` needs across calls.
pub struct ExecContext<'a> {
    pub module: &'a Module,
    pub host: &'a mut dyn control::Scheduling,
    pub lcg: &'a mut Lcg,
    pub tool: Option<Arc<ToolController>>,
}

/// Outcome of running one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Ran to completion; `regs.next_pc` names the next instruction.
    Continue,
    /// Blocked on a channel op; the thread is now `BlockedSending`,
    /// `BlockedReceiving`, or `BlockedInAlt` and must be retried later by
    /// the scheduler.
    Blocked,
    /// The thread reached a terminal state this step (`exit`, an empty
    /// return stack, or an unhandled exception).
    Terminal,
}

fn type_index_operand(instr: &Instruction, which: dis_asm::Operand) -> Result<usize, PanicReason> {
    let _ = instr;
    which.register1().ok_or(PanicReason::OutOfRangeMemory).map(|v| v as usize)
}

fn type_desc_at<'a>(module: &'a Module, index: usize) -> Result<&'a Arc<TypeDescriptor>, PanicReason> {
    module.types.get(index).ok_or(PanicReason::TypeViolation)
}

/// Reads a literal `i32` target pc out of `dest` (used by branches and
/// `goto`, whose `dest`/`src` operand is an immediate pc rather than an
/// addressed value).
fn literal_i32(regs: &Registers, which: Option<std::ptr::NonNull<u8>>) -> Result<i32, PanicReason> {
    let ptr = which.ok_or(PanicReason::OutOfRangeMemory)?;
    let _ = regs;
    Ok(unsafe { (ptr.as_ptr() as *const i32).read_unaligned() })
}

/// Runs one fetch-decode-execute step for `regs`, honoring breakpoints
/// registered on `ctx.tool` before dispatch (§4.I).
pub fn step(regs: &mut Registers, ctx: &mut ExecContext) -> Result<StepOutcome, String> {
    if let Some(tool) = &ctx.tool {
        tool.park_if_suspended();
        if tool.has_breakpoint(&ctx.module.name, regs.pc) {
            tool.fire(
                crate::tool::ToolEvent::Breakpoint,
                &crate::tool::EventContext {
                    pc: Some(regs.pc),
                    module_name: Some(ctx.module.name.clone()),
                    ..Default::default()
                },
            );
        }
    }

    let instr = ctx
        .module
        .code
        .get(regs.pc as usize)
        .copied()
        .ok_or_else(|| "pc out of range".to_string())?;
    regs.next_pc = regs.pc + 1;

    let frame_ptr = regs
        .stack
        .peek_frame()
        .map(|id| regs.stack.payload_ptr(id))
        .unwrap_or(std::ptr::null_mut());

    decode::decode_operands(&instr, regs, frame_ptr).map_err(|e| format!("{e:?}"))?;

    let outcome = dispatch(&instr, regs, ctx).map_err(|e| format!("{e:?}"))?;

    if outcome == StepOutcome::Continue {
        regs.pc = regs.next_pc;
    }
    Ok(outcome)
}

fn branch_if(regs: &mut Registers, taken: bool) -> Result<(), PanicReason> {
    if taken {
        regs.next_pc = literal_i32(regs, regs.dest)?;
    }
    Ok(())
}

fn dispatch(instr: &Instruction, regs: &mut Registers, ctx: &mut ExecContext) -> Result<StepOutcome, PanicReason> {
    use Opcode::*;
    match instr.opcode {
        Invalid => Err(PanicReason::NotImplemented),

        // --- arithmetic / bitwise / comparisons -----------------------
        Addb => arith::addb(regs).map(|_| StepOutcome::Continue),
        Addw => arith::addw(regs).map(|_| StepOutcome::Continue),
        Addl => arith::addl(regs).map(|_| StepOutcome::Continue),
        Addf => arith::addf(regs).map(|_| StepOutcome::Continue),
        Subb => arith::subb(regs).map(|_| StepOutcome::Continue),
        Subw => arith::subw(regs).map(|_| StepOutcome::Continue),
        Subl => arith::subl(regs).map(|_| StepOutcome::Continue),
        Subf => arith::subf(regs).map(|_| StepOutcome::Continue),
        Mulb => arith::mulb(regs).map(|_| StepOutcome::Continue),
        Mulw => arith::mulw(regs).map(|_| StepOutcome::Continue),
        Mull => arith::mull(regs).map(|_| StepOutcome::Continue),
        Mulf => arith::mulf(regs).map(|_| StepOutcome::Continue),
        Divb => arith::divb(regs).map(|_| StepOutcome::Continue),
        Divw => arith::divw(regs).map(|_| StepOutcome::Continue),
        Divl => arith::divl(regs).map(|_| StepOutcome::Continue),
        Divf => arith::divf(regs).map(|_| StepOutcome::Continue),
        Modb => arith::modb(regs).map(|_| StepOutcome::Continue),
        Modw => arith::modw(regs).map(|_| StepOutcome::Continue),
        Modl => arith::modl(regs).map(|_| StepOutcome::Continue),
        Andb => arith::andb(regs).map(|_| StepOutcome::Continue),
        Andw => arith::andw(regs).map(|_| StepOutcome::Continue),
        Andl => arith::andl(regs).map(|_| StepOutcome::Continue),
        Orb => arith::orb(regs).map(|_| StepOutcome::Continue),
        Orw => arith::orw(regs).map(|_| StepOutcome::Continue),
        Orl => arith::orl(regs).map(|_| StepOutcome::Continue),
        Xorb => arith::xorb(regs).map(|_| StepOutcome::Continue),
        Xorw => arith::xorw(regs).map(|_| StepOutcome::Continue),
        Xorl => arith::xorl(regs).map(|_| StepOutcome::Continue),
        Shlb => arith::shlb(regs).map(|_| StepOutcome::Continue),
        Shlw => arith::shlw(regs).map(|_| StepOutcome::Continue),
        Shll => arith::shll(regs).map(|_| StepOutcome::Continue),
        Shrb => arith::shrb(regs).map(|_| StepOutcome::Continue),
        Shrw => arith::shrw(regs).map(|_| StepOutcome::Continue),
        Shrl => arith::shrl(regs).map(|_| StepOutcome::Continue),
        Lsrw => arith::lsrw(regs).map(|_| StepOutcome::Continue),
        Lsrl => arith::lsrl(regs).map(|_| StepOutcome::Continue),
        Negf => arith::negf(regs).map(|_| StepOutcome::Continue),
        Expw => arith::expw(regs).map(|_| StepOutcome::Continue),
        Expl => arith::expl(regs).map(|_| StepOutcome::Continue),
        Expf => arith::expf(regs).map(|_| StepOutcome::Continue),
        Tcmp => arith::tcmp(regs).map(|_| StepOutcome::Continue),
        Mulx | Mulx0 | Mulx1 => arith::mulx(regs).map(|_| StepOutcome::Continue),
        Divx | Divx0 | Divx1 => arith::divx(regs).map(|_| StepOutcome::Continue),
        Cvtxx | Cvtxx0 | Cvtxx1 => arith::cvtxx(regs).map(|_| StepOutcome::Continue),
        Cvtfx => arith::cvtfx(regs).map(|_| StepOutcome::Continue),
        Cvtxf => arith::cvtxf(regs).map(|_| StepOutcome::Continue),

        Beqb => arith::beqb(regs).and_then(|t| branch_if(regs, t)).map(|_| StepOutcome::Continue),
        Bneb => arith::bneb(regs).and_then(|t| branch_if(regs, t)).map(|_| StepOutcome::Continue),
        Bltb => arith::bltb(regs).and_then(|t| branch_if(regs, t)).map(|_| StepOutcome::Continue),
        Bleb => arith::bleb(regs).and_then(|t| branch_if(regs, t)).map(|_| StepOutcome::Continue),
        Bgtb => arith::bgtb(regs).and_then(|t| branch_if(regs, t)).map(|_| StepOutcome::Continue),
        Bgeb => arith::bgeb(regs).and_then(|t| branch_if(regs, t)).map(|_| StepOutcome::Continue),
        Beqw => arith::beqw(regs).and_then(|t| branch_if(regs, t)).map(|_| StepOutcome::Continue),
        Bnew => arith::bnew(regs).and_then(|t| branch_if(regs, t)).map(|_| StepOutcome::Continue),
        Bltw => arith::bltw(regs).and_then(|t| branch_if(regs, t)).map(|_| StepOutcome::Continue),
        Blew => arith::blew(regs).and_then(|t| branch_if(regs, t)).map(|_| StepOutcome::Continue),
        Bgtw => arith::bgtw(regs).and_then(|t| branch_if(regs, t)).map(|_| StepOutcome::Continue),
        Bgew => arith::bgew(regs).and_then(|t| branch_if(regs, t)).map(|_| StepOutcome::Continue),
        Beql => arith::beql(regs).and_then(|t| branch_if(regs, t)).map(|_| StepOutcome::Continue),
        Bnel => arith::bnel(regs).and_then(|t| branch_if(regs, t)).map(|_| StepOutcome::Continue),
        Bltl => arith::bltl(regs).and_then(|t| branch_if(regs, t)).map(|_| StepOutcome::Continue),
        Blel => arith::blel(regs).and_then(|t| branch_if(regs, t)).map(|_| StepOutcome::Continue),
        Bgtl => arith::bgtl(regs).and_then(|t| branch_if(regs, t)).map(|_| StepOutcome::Continue),
        Bgel => arith::bgel(regs).and_then(|t| branch_if(regs, t)).map(|_| StepOutcome::Continue),
        Beqf => arith::beqf(regs).and_then(|t| branch_if(regs, t)).map(|_| StepOutcome::Continue),
        Bnef => arith::bnef(regs).and_then(|t| branch_if(regs, t)).map(|_| StepOutcome::Continue),
        Bltf => arith::bltf(regs).and_then(|t| branch_if(regs, t)).map(|_| StepOutcome::Continue),
        Blef => arith::blef(regs).and_then(|t| branch_if(regs, t)).map(|_| StepOutcome::Continue),
        Bgtf => arith::bgtf(regs).and_then(|t| branch_if(regs, t)).map(|_| StepOutcome::Continue),
        Bgef => arith::bgef(regs).and_then(|t| branch_if(regs, t)).map(|_| StepOutcome::Continue),
        Beqc => {
            let s1 = regs.mid.ok_or(PanicReason::OutOfRangeMemory)?;
            let s2 = regs.src.ok_or(PanicReason::OutOfRangeMemory)?;
            let taken = string_cmp(s1, s2)? == std::cmp::Ordering::Equal;
            branch_if(regs, taken).map(|_| StepOutcome::Continue)
        }
        Bnec => {
            let s1 = regs.mid.ok_or(PanicReason::OutOfRangeMemory)?;
            let s2 = regs.src.ok_or(PanicReason::OutOfRangeMemory)?;
            let taken = string_cmp(s1, s2)? != std::cmp::Ordering::Equal;
            branch_if(regs, taken).map(|_| StepOutcome::Continue)
        }
        Bltc => string_branch(regs, std::cmp::Ordering::Less, false),
        Blec => string_branch(regs, std::cmp::Ordering::Greater, true),
        Bgtc => string_branch(regs, std::cmp::Ordering::Greater, false),
        Bgec => string_branch(regs, std::cmp::Ordering::Less, true),

        // --- moves / conversions ---------------------------------------
        Movb => moveops::movb(regs).map(|_| StepOutcome::Continue),
        Movw => moveops::movw(regs).map(|_| StepOutcome::Continue),
        Movf => moveops::movf(regs).map(|_| StepOutcome::Continue),
        Movl => moveops::movl(regs).map(|_| StepOutcome::Continue),
        Movp => moveops::movp(regs).map(|_| StepOutcome::Continue),
        Movm | Movmp => {
            let idx = type_index_operand(instr, instr.mid)?;
            let td = Arc::clone(type_desc_at(ctx.module, idx)?);
            moveops::movm(regs, &td).map(|_| StepOutcome::Continue)
        }
        Lea => moveops::lea(regs).map(|_| StepOutcome::Continue),
        Cvtbw => moveops::cvtbw(regs).map(|_| StepOutcome::Continue),
        Cvtwb => moveops::cvtwb(regs).map(|_| StepOutcome::Continue),
        Cvtfw => moveops::cvtfw(regs).map(|_| StepOutcome::Continue),
        Cvtwf => moveops::cvtwf(regs).map(|_| StepOutcome::Continue),
        Cvtlf => moveops::cvtlf(regs).map(|_| StepOutcome::Continue),
        Cvtfl => moveops::cvtfl(regs).map(|_| StepOutcome::Continue),
        Cvtlw => moveops::cvtlw(regs).map(|_| StepOutcome::Continue),
        Cvtwl => moveops::cvtwl(regs).map(|_| StepOutcome::Continue),
        Cvtrf => moveops::cvtrf(regs).map(|_| StepOutcome::Continue),
        Cvtfr => moveops::cvtfr(regs).map(|_| StepOutcome::Continue),
        Cvtws => moveops::cvtws(regs).map(|_| StepOutcome::Continue),
        Cvtsw => moveops::cvtsw(regs).map(|_| StepOutcome::Continue),
        Cvtwc => moveops::cvtwc(regs).map(|_| StepOutcome::Continue),
        Cvtcw => moveops::cvtcw(regs).map(|_| StepOutcome::Continue),
        Cvtfc => moveops::cvtfc(regs).map(|_| StepOutcome::Continue),
        Cvtcf => moveops::cvtcf(regs).map(|_| StepOutcome::Continue),
        Cvtlc => moveops::cvtlc(regs).map(|_| StepOutcome::Continue),
        Cvtcl => moveops::cvtcl(regs).map(|_| StepOutcome::Continue),
        Cvtca => moveops::cvtca(regs).map(|n| {
            regs.quantum_remaining = regs.quantum_remaining.saturating_sub(n as u32 / 4);
            StepOutcome::Continue
        }),
        Cvtac => {
            let len = type_index_operand(instr, instr.mid)?;
            moveops::cvtac(regs, len).map(|_| StepOutcome::Continue)
        }

        // --- allocation --------------------------------------------------
        New | Newz => {
            let idx = type_index_operand(instr, instr.mid)?;
            let td = Arc::clone(type_desc_at(ctx.module, idx)?);
            moveops::new(regs, td).map(|_| StepOutcome::Continue)
        }
        Newa | Newaz | Mnewz => {
            let idx = type_index_operand(instr, instr.mid)?;
            let td = type_desc_at(ctx.module, idx)?.clone();
            moveops::newa(regs, &td).map(|_| StepOutcome::Continue)
        }
        Newcb => channels::newc(regs, 1, false).map(|_| StepOutcome::Continue),
        Newcw => channels::newc(regs, 4, false).map(|_| StepOutcome::Continue),
        Newcf => channels::newc(regs, 8, false).map(|_| StepOutcome::Continue),
        Newcl => channels::newc(regs, 8, false).map(|_| StepOutcome::Continue),
        Newcp | Newcm | Newcmp => channels::newc(regs, std::mem::size_of::<usize>(), true).map(|_| StepOutcome::Continue),

        Consb => moveops::cons(regs, 1, false).map(|_| StepOutcome::Continue),
        Consw => moveops::cons(regs, 4, false).map(|_| StepOutcome::Continue),
        Consf => moveops::cons(regs, 8, false).map(|_| StepOutcome::Continue),
        Consl => moveops::cons(regs, 8, false).map(|_| StepOutcome::Continue),
        Consp | Consm | Consmp => moveops::cons(regs, std::mem::size_of::<usize>(), true).map(|_| StepOutcome::Continue),
        Headb => moveops::head(regs, 1).map(|_| StepOutcome::Continue),
        Headw => moveops::head(regs, 4).map(|_| StepOutcome::Continue),
        Headf => moveops::head(regs, 8).map(|_| StepOutcome::Continue),
        Headl => moveops::head(regs, 8).map(|_| StepOutcome::Continue),
        Headp | Headm | Headmp => moveops::head(regs, std::mem::size_of::<usize>()).map(|_| StepOutcome::Continue),
        Tail => moveops::tail(regs).map(|_| StepOutcome::Continue),

        // --- arrays ------------------------------------------------------
        Indx => {
            let size = type_index_operand(instr, instr.dest).unwrap_or(4);
            arrays::indx(regs, size).map(|_| StepOutcome::Continue)
        }
        Indb => arrays::indb(regs).map(|_| StepOutcome::Continue),
        Indw => arrays::indw(regs).map(|_| StepOutcome::Continue),
        Indf => arrays::indf(regs).map(|_| StepOutcome::Continue),
        Indl => arrays::indl(regs).map(|_| StepOutcome::Continue),
        Lena => arrays::lena(regs, 4).map(|_| StepOutcome::Continue),
        Lenl => {
            let src = regs.src.ok_or(PanicReason::OutOfRangeMemory)?;
            let dest = regs.dest.ok_or(PanicReason::OutOfRangeMemory)?;
            let head: crate::heap::Pointer = unsafe { (src.as_ptr() as *const crate::heap::Pointer).read_unaligned() };
            unsafe { (dest.as_ptr() as *mut i32).write_unaligned(crate::heap::list::len(head) as i32) };
            Ok(StepOutcome::Continue)
        }

        // --- strings -------------------------------------------------------
        Insc => {
            let idx = type_index_operand(instr, instr.dest)?;
            strings::insc(regs, idx).map(|_| StepOutcome::Continue)
        }
        Indc => {
            let idx = type_index_operand(instr, instr.mid)?;
            strings::indc(regs, idx).map(|_| StepOutcome::Continue)
        }
        Addc => strings::addc(regs).map(|_| StepOutcome::Continue),
        Lenc => strings::lenc(regs).map(|_| StepOutcome::Continue),
        Slicec => {
            let (start, end) = slice_range(instr)?;
            strings::slicec(regs, start, end).map(|_| StepOutcome::Continue)
        }

        Slicea => {
            let idx = type_index_operand(instr, instr.mid)?;
            let td = type_desc_at(ctx.module, idx)?.clone();
            let (start, end) = slice_range(instr)?;
            arrays::slicea(regs, &td, start, end).map(|_| StepOutcome::Continue)
        }
        Slicela => {
            let (start, end) = slice_range(instr)?;
            arrays::slicela(regs, start, end).map(|_| StepOutcome::Continue)
        }

        // --- case dispatch ---------------------------------------------
        // The jump table lives in memory addressed by `mid`: a leading
        // `i32` entry count, then that many sorted `(key, target pc)`
        // pairs (`casec`'s keys are string pointers instead); `dest` holds
        // the default target as an immediate.
        Casew => {
            let table = read_case_table_word(regs)?;
            let default_pc = literal_i32(regs, regs.dest)?;
            case::case_word(regs, &table, default_pc).map(|_| StepOutcome::Continue)
        }
        Casel => {
            let table = read_case_table_big(regs)?;
            let default_pc = literal_i32(regs, regs.dest)?;
            case::case_big(regs, &table, default_pc).map(|_| StepOutcome::Continue)
        }
        Casec => {
            let table = read_case_table_string(regs)?;
            let default_pc = literal_i32(regs, regs.dest)?;
            case::case_string(regs, &table, default_pc).map(|_| StepOutcome::Continue)
        }

        // --- control flow ------------------------------------------------
        Goto | Jmp => {
            let target = literal_i32(regs, regs.src)?;
            control::jmp(regs, target).map(|_| StepOutcome::Continue)
        }
        Frame | Mframe => {
            let idx = type_index_operand(instr, instr.mid)?;
            let td = type_desc_at(ctx.module, idx)?.clone();
            let id = control::frame(regs, td)?;
            let dest = regs.dest.ok_or(PanicReason::OutOfRangeMemory)?;
            unsafe { (dest.as_ptr() as *mut usize).write_unaligned(id) };
            Ok(StepOutcome::Continue)
        }
        // `mcall`'s cross-module switch requires the callee's own `ModRef`
        // (its own MP instance), which `ResolvedImport` doesn't carry — only
        // the foreign entry pc/frame type, matching the scheduler's own
        // `load`/`spawn` contract. Both variants are dispatched as
        // same-module calls here; see `DESIGN.md`.
        Call | Mcall => {
            let target = literal_i32(regs, regs.dest)?;
            let frame_id_addr = regs.src.ok_or(PanicReason::OutOfRangeMemory)?;
            let frame_id: usize = unsafe { (frame_id_addr.as_ptr() as *const usize).read_unaligned() };
            control::call(regs, frame_id, target, None).map(|_| StepOutcome::Continue)
        }
        Ret => {
            control::ret(regs)?;
            Ok(if regs.state == ThreadState::EmptyStack {
                StepOutcome::Terminal
            } else {
                StepOutcome::Continue
            })
        }
        Exit => {
            control::exit(regs);
            Ok(StepOutcome::Terminal)
        }
        Spawn | Mspawn => {
            let target = literal_i32(regs, regs.src)?;
            let idx = type_index_operand(instr, instr.mid)?;
            let td = type_desc_at(ctx.module, idx)?.clone();
            let module = regs.module.clone().ok_or(PanicReason::DereferenceNil)?;
            control::spawn(regs, ctx.host, module, target, td).map(|_| StepOutcome::Continue)
        }
        Load => {
            let src = regs.src.ok_or(PanicReason::OutOfRangeMemory)?;
            let path_ptr: crate::heap::Pointer = unsafe { (src.as_ptr() as *const crate::heap::Pointer).read_unaligned() };
            let path_ptr = path_ptr.ok_or(PanicReason::DereferenceNil)?;
            let path = unsafe { crate::heap::string::as_str(path_ptr) }.to_string();
            control::load(regs, ctx.host, &path).map(|_| StepOutcome::Continue)
        }

        Raise => {
            let src = regs.src.ok_or(PanicReason::OutOfRangeMemory)?;
            let name_ptr: crate::heap::Pointer = unsafe { (src.as_ptr() as *const crate::heap::Pointer).read_unaligned() };
            let name_ptr = name_ptr.ok_or(PanicReason::DereferenceNil)?;
            let name = unsafe { crate::heap::string::as_str(name_ptr) }.to_string();
            let module = regs.module.as_ref().map(|m| Arc::clone(&m.module)).ok_or(PanicReason::DereferenceNil)?;
            match exceptions::raise(regs, module, &name) {
                Ok(()) => Ok(StepOutcome::Continue),
                Err(_) => Ok(StepOutcome::Terminal),
            }
        }

        // --- channels ------------------------------------------------------
        Send => match channels::try_send(regs)? {
            channels::Attempt::Completed => Ok(StepOutcome::Continue),
            channels::Attempt::WouldBlock => {
                regs.state = ThreadState::BlockedSending;
                Ok(StepOutcome::Blocked)
            }
        },
        Recv => match channels::try_recv(regs)? {
            channels::Attempt::Completed => Ok(StepOutcome::Continue),
            channels::Attempt::WouldBlock => {
                regs.state = ThreadState::BlockedReceiving;
                Ok(StepOutcome::Blocked)
            }
        },
        Alt | Nbalt => {
            let cases = unsafe { channels::read_alt_table(regs)? };
            match channels::try_alt(&cases, ctx.lcg) {
                Some(i) => {
                    let dest = regs.dest.ok_or(PanicReason::OutOfRangeMemory)?;
                    unsafe { (dest.as_ptr() as *mut i32).write_unaligned(i as i32) };
                    Ok(StepOutcome::Continue)
                }
                None if instr.opcode == Nbalt => {
                    let target = literal_i32(regs, regs.dest)?;
                    regs.next_pc = target;
                    Ok(StepOutcome::Continue)
                }
                None => {
                    regs.state = ThreadState::BlockedInAlt;
                    Ok(StepOutcome::Blocked)
                }
            }
        }

        // --- misc ---------------------------------------------------------
        // `runt`/`eclr` are no-ops here: there is no separate runtime-error
        // register to read or clear, so nothing to do.
        Runt | Eclr => Ok(StepOutcome::Continue),
        // `movpc`/`self_` read/write a thread's own pc/module identity in
        // ways the register file doesn't expose as addressable operands in
        // this design; raised as genuinely unimplemented rather than
        // silently no-op'd (see `DESIGN.md`).
        Movpc | Self_ => Err(PanicReason::NotImplemented),
        Brkpt => Ok(StepOutcome::Continue),

        _ => Err(PanicReason::NotImplemented),
    }
}

fn string_cmp(a: std::ptr::NonNull<u8>, b: std::ptr::NonNull<u8>) -> Result<std::cmp::Ordering, PanicReason> {
    unsafe {
        let pa: crate::heap::Pointer = (a.as_ptr() as *const crate::heap::Pointer).read_unaligned();
        let pb: crate::heap::Pointer = (b.as_ptr() as *const crate::heap::Pointer).read_unaligned();
        let pa = pa.ok_or(PanicReason::DereferenceNil)?;
        let pb = pb.ok_or(PanicReason::DereferenceNil)?;
        Ok(crate::heap::string::compare(pa, pb))
    }
}

fn string_branch(regs: &mut Registers, want: std::cmp::Ordering, negate: bool) -> Result<StepOutcome, PanicReason> {
    let s1 = regs.mid.ok_or(PanicReason::OutOfRangeMemory)?;
    let s2 = regs.src.ok_or(PanicReason::OutOfRangeMemory)?;
    let cmp = string_cmp(s1, s2)?;
    let taken = if negate { cmp != want } else { cmp == want };
    branch_if(regs, taken)?;
    Ok(StepOutcome::Continue)
}

fn read_case_table_word(regs: &Registers) -> Result<Vec<case::CaseArm<i32>>, PanicReason> {
    let base = regs.mid.ok_or(PanicReason::OutOfRangeMemory)?.as_ptr();
    unsafe {
        let count = (base as *const i32).read_unaligned().max(0) as usize;
        let mut cursor = base.add(4);
        let mut table = Vec::with_capacity(count);
        for _ in 0..count {
            let key = (cursor as *const i32).read_unaligned();
            let target_pc = (cursor.add(4) as *const i32).read_unaligned();
            table.push(case::CaseArm { key, target_pc });
            cursor = cursor.add(8);
        }
        Ok(table)
    }
}

fn read_case_table_big(regs: &Registers) -> Result<Vec<case::CaseArm<i64>>, PanicReason> {
    let base = regs.mid.ok_or(PanicReason::OutOfRangeMemory)?.as_ptr();
    unsafe {
        let count = (base as *const i32).read_unaligned().max(0) as usize;
        let mut cursor = base.add(4);
        let mut table = Vec::with_capacity(count);
        for _ in 0..count {
            let key = (cursor as *const i64).read_unaligned();
            let target_pc = (cursor.add(8) as *const i32).read_unaligned();
            table.push(case::CaseArm { key, target_pc });
            cursor = cursor.add(12);
        }
        Ok(table)
    }
}

fn read_case_table_string(regs: &Registers) -> Result<Vec<(std::ptr::NonNull<u8>, i32)>, PanicReason> {
    let base = regs.mid.ok_or(PanicReason::OutOfRangeMemory)?.as_ptr();
    unsafe {
        let count = (base as *const i32).read_unaligned().max(0) as usize;
        let mut cursor = base.add(4);
        let mut table = Vec::with_capacity(count);
        for _ in 0..count {
            let key: crate::heap::Pointer = (cursor as *const crate::heap::Pointer).read_unaligned();
            let key = key.ok_or(PanicReason::DereferenceNil)?;
            let target_pc = (cursor.add(std::mem::size_of::<usize>()) as *const i32).read_unaligned();
            table.push((key, target_pc));
            cursor = cursor.add(std::mem::size_of::<usize>() + 4);
        }
        Ok(table)
    }
}

fn slice_range(instr: &Instruction) -> Result<(usize, usize), PanicReason> {
    match instr.mid {
        dis_asm::Operand::Double(a, b) => Ok((a.max(0) as usize, b.max(0) as usize)),
        _ => Err(PanicReason::OutOfRangeMemory),
    }
}
