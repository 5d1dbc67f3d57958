//! `send` / `recv` / `alt` / `nbalt` and channel allocation (§4.F).
//!
//! The reference design services a blocked request through a completion
//! callback fired by whichever side later unblocks it. Here, a blocked
//! thread instead re-attempts its pending op every time the scheduler
//! revisits the blocked set (`scheduler.rs`); each attempt is a single,
//! channel-lock-guarded [`crate::heap::channel::try_send`] /
//! [`try_receive`](crate::heap::channel::try_receive) call, which is
//! already atomic with respect to every other thread touching that
//! channel, so no request-mutex is load-bearing for correctness — only
//! useful as an explicit "still waiting?" flag an `alt` can inspect. This
//! polling design is recorded as a deliberate simplification in
//! `DESIGN.md`.

use std::ptr::NonNull;

use dis_asm::PanicReason;

use crate::heap::{self, channel, Colour, Pointer};
use crate::registers::Registers;
use crate::rendezvous::Lcg;

unsafe fn read_ptr(addr: NonNull<u8>) -> Pointer {
    (addr.as_ptr() as *const Pointer).read_unaligned()
}

unsafe fn write_ptr(addr: NonNull<u8>, value: Pointer) {
    (addr.as_ptr() as *mut Pointer).write_unaligned(value);
}

fn channel_ptr(regs: &Registers) -> Result<NonNull<u8>, PanicReason> {
    let addr = regs.src.ok_or(PanicReason::OutOfRangeMemory)?;
    unsafe { read_ptr(addr) }.ok_or(PanicReason::DereferenceNil)
}

/// Allocates a new channel, writing its pointer to `dest`. `mid` carries
/// the buffer capacity (`0` for a synchronous rendezvous channel).
pub fn newc(regs: &mut Registers, element_size: usize, element_is_pointer: bool) -> Result<(), PanicReason> {
    let mid = regs.mid.ok_or(PanicReason::OutOfRangeMemory)?;
    let dest = regs.dest.ok_or(PanicReason::OutOfRangeMemory)?;
    let capacity = unsafe { (mid.as_ptr() as *const i32).read_unaligned() };
    let ptr = channel::alloc_channel(element_size, element_is_pointer, capacity.max(0) as usize, Colour::White);
    unsafe {
        let old = read_ptr(dest);
        heap::dec(old);
        write_ptr(dest, Some(ptr));
    }
    Ok(())
}

/// Copies one element out of `value_addr`, bumping its refcount first if
/// the channel carries pointer-typed elements (the channel's buffered copy
/// and the sender's own variable are now both live references).
fn snapshot_element(value_addr: NonNull<u8>, element_size: usize, element_is_pointer: bool) -> Vec<u8> {
    let mut bytes = vec![0u8; element_size];
    unsafe {
        std::ptr::copy_nonoverlapping(value_addr.as_ptr(), bytes.as_mut_ptr(), element_size);
    }
    if element_is_pointer {
        let p = unsafe { (bytes.as_ptr() as *const Pointer).read() };
        heap::inc(p);
    }
    bytes
}

/// Writes a received element into `dest_addr`, decrementing whatever
/// pointer previously lived there if the channel carries pointer-typed
/// elements (symmetric with `movp`'s overwrite semantics).
fn deliver_element(dest_addr: NonNull<u8>, bytes: &[u8], element_is_pointer: bool) {
    unsafe {
        if element_is_pointer {
            let old = read_ptr(dest_addr);
            heap::dec(old);
        }
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), dest_addr.as_ptr(), bytes.len());
    }
}

/// Outcome of attempting a blocking channel op this quantum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    /// The transfer completed; execution continues to the next instruction.
    Completed,
    /// No counterpart was ready; the caller should block the thread.
    WouldBlock,
}

/// Attempts `send dest_value <- *src_channel`. `dest` names the value's
/// address.
pub fn try_send(regs: &Registers) -> Result<Attempt, PanicReason> {
    let chan = channel_ptr(regs)?;
    let value_addr = regs.dest.ok_or(PanicReason::OutOfRangeMemory)?;
    let size = channel::element_size(chan);
    let is_ptr = channel::element_is_pointer(chan);
    let bytes = snapshot_element(value_addr, size, is_ptr);
    if channel::try_send(chan, &bytes) {
        Ok(Attempt::Completed)
    } else {
        if is_ptr {
            let p = unsafe { (bytes.as_ptr() as *const Pointer).read() };
            heap::dec(p); // undo the speculative inc; retried fresh next attempt
        }
        Ok(Attempt::WouldBlock)
    }
}

/// Attempts `recv *dest_value <- src_channel`.
pub fn try_recv(regs: &Registers) -> Result<Attempt, PanicReason> {
    let chan = channel_ptr(regs)?;
    let dest_addr = regs.dest.ok_or(PanicReason::OutOfRangeMemory)?;
    let is_ptr = channel::element_is_pointer(chan);
    match channel::try_receive(chan) {
        Some(bytes) => {
            deliver_element(dest_addr, &bytes, is_ptr);
            Ok(Attempt::Completed)
        }
        None => Ok(Attempt::WouldBlock),
    }
}

/// One channel candidate in an `alt`/`nbalt` table: a channel pointer plus
/// the data address (the value to send, or the destination to receive
/// into) and whether it is a send (`true`) or receive (`false`) case.
pub struct AltCase {
    pub channel: NonNull<u8>,
    pub data_addr: NonNull<u8>,
    pub is_send: bool,
}

/// Reads `send_count`, `recv_count`, and the `(channel, data) *
/// (send_count + recv_count)` table laid out at `regs.src` (§4.F).
///
/// # Safety
/// `regs.src` must point at a live alt table of the documented shape.
pub unsafe fn read_alt_table(regs: &Registers) -> Result<Vec<AltCase>, PanicReason> {
    let base = regs.src.ok_or(PanicReason::OutOfRangeMemory)?.as_ptr();
    let word = crate::consts::WORD_SIZE;
    let ptr_size = std::mem::size_of::<Pointer>();
    let send_count = (base as *const i32).read_unaligned().max(0) as usize;
    let recv_count = (base.add(word) as *const i32).read_unaligned().max(0) as usize;
    let mut cases = Vec::with_capacity(send_count + recv_count);
    let mut cursor = base.add(word * 2);
    for i in 0..(send_count + recv_count) {
        let channel_ptr = (cursor as *const Pointer).read_unaligned().ok_or(PanicReason::DereferenceNil)?;
        let data_ptr = (cursor.add(ptr_size) as *const Pointer)
            .read_unaligned()
            .ok_or(PanicReason::DereferenceNil)?;
        cases.push(AltCase {
            channel: channel_ptr,
            data_addr: data_ptr,
            is_send: i < send_count,
        });
        cursor = cursor.add(ptr_size * 2);
    }
    Ok(cases)
}

fn attempt_case(case: &AltCase) -> bool {
    if case.is_send {
        let size = channel::element_size(case.channel);
        let is_ptr = channel::element_is_pointer(case.channel);
        let bytes = snapshot_element(case.data_addr, size, is_ptr);
        let ok = channel::try_send(case.channel, &bytes);
        if !ok && is_ptr {
            let p = unsafe { (bytes.as_ptr() as *const Pointer).read() };
            heap::dec(p);
        }
        ok
    } else {
        let is_ptr = channel::element_is_pointer(case.channel);
        match channel::try_receive(case.channel) {
            Some(bytes) => {
                deliver_element(case.data_addr, &bytes, is_ptr);
                true
            }
            None => false,
        }
    }
}

/// Visits `cases` in a pseudo-random permutation, returning the index of
/// the first one that completes synchronously.
pub fn try_alt(cases: &[AltCase], lcg: &mut Lcg) -> Option<usize> {
    for i in lcg.permutation(cases.len()) {
        if attempt_case(&cases[i]) {
            return Some(i);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::dec;

    #[test]
    fn newc_allocates_and_writes_pointer() {
        let mut regs = Registers::new();
        let mid = regs.imm_mid_ptr();
        unsafe { (mid.as_ptr() as *mut i32).write(2) };
        regs.mid = Some(mid);
        let storage = Box::leak(Box::new(0usize));
        let dest = NonNull::new(storage as *mut usize as *mut u8).unwrap();
        regs.dest = Some(dest);
        newc(&mut regs, 4, false).unwrap();
        let chan = unsafe { read_ptr(dest) }.unwrap();
        assert_eq!(channel::element_size(chan), 4);
        dec(Some(chan));
    }

    #[test]
    fn send_then_recv_round_trip() {
        let chan = channel::alloc_channel(4, false, 1, Colour::White);
        let mut send_regs = Registers::new();
        let chan_slot = Box::leak(Box::new(Some(chan)));
        send_regs.src = Some(NonNull::new(chan_slot as *mut Pointer as *mut u8).unwrap());
        let value_slot = Box::leak(Box::new(99i32));
        send_regs.dest = Some(NonNull::new(value_slot as *mut i32 as *mut u8).unwrap());
        assert_eq!(try_send(&send_regs).unwrap(), Attempt::Completed);

        let mut recv_regs = Registers::new();
        recv_regs.src = Some(NonNull::new(chan_slot as *mut Pointer as *mut u8).unwrap());
        let recv_slot = Box::leak(Box::new(0i32));
        recv_regs.dest = Some(NonNull::new(recv_slot as *mut i32 as *mut u8).unwrap());
        assert_eq!(try_recv(&recv_regs).unwrap(), Attempt::Completed);
        assert_eq!(*recv_slot, 99);

        dec(Some(chan));
    }
}
