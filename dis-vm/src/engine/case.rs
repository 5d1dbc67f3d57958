//! `case`/`casel`/`casec`: jump-table dispatch on a scalar value.
//!
//! The reference runtime's case tables are sorted by key and searched with
//! a direct-index fast path plus binary-search fallback; the distinction
//! is a speed optimisation with no behavioral difference, so this
//! implementation always binary-searches a sorted table (§4.D).

use std::ptr::NonNull;

use dis_asm::PanicReason;

use crate::heap::{string, Pointer};
use crate::registers::Registers;

/// One `(key, target_pc)` entry. Tables passed to [`case_word`]/[`case_big`]
/// must be sorted ascending by key; [`case_string`]'s table pairs a string
/// pointer with a target.
pub struct CaseArm<K> {
    pub key: K,
    pub target_pc: i32,
}

fn binary_search<K: Ord + Copy>(table: &[CaseArm<K>], value: K) -> Option<i32> {
    table
        .binary_search_by_key(&value, |arm| arm.key)
        .ok()
        .map(|i| table[i].target_pc)
}

/// `casew`/`casel`: looks up `value` (read from `src`) in `table`, setting
/// `regs.next_pc` to the matching arm's target, or to `default_pc` if none
/// matches.
pub fn case_word(regs: &mut Registers, table: &[CaseArm<i32>], default_pc: i32) -> Result<(), PanicReason> {
    let src = regs.src.ok_or(PanicReason::OutOfRangeMemory)?;
    let value: i32 = unsafe { (src.as_ptr() as *const i32).read_unaligned() };
    regs.next_pc = binary_search(table, value).unwrap_or(default_pc);
    Ok(())
}

/// See [`case_word`]; `big`-keyed variant (`casel`).
pub fn case_big(regs: &mut Registers, table: &[CaseArm<i64>], default_pc: i32) -> Result<(), PanicReason> {
    let src = regs.src.ok_or(PanicReason::OutOfRangeMemory)?;
    let value: i64 = unsafe { (src.as_ptr() as *const i64).read_unaligned() };
    regs.next_pc = binary_search(table, value).unwrap_or(default_pc);
    Ok(())
}

/// `casec`: looks up the string at `src` in `table` by codepoint-order
/// comparison (linear, since string comparison isn't a cheap sort key to
/// pre-index without interning).
pub fn case_string(regs: &mut Registers, table: &[(NonNull<u8>, i32)], default_pc: i32) -> Result<(), PanicReason> {
    let src = regs.src.ok_or(PanicReason::OutOfRangeMemory)?;
    let value: Pointer = unsafe { (src.as_ptr() as *const Pointer).read_unaligned() };
    let value = value.ok_or(PanicReason::DereferenceNil)?;
    for (key, target) in table {
        if string::compare(value, *key) == std::cmp::Ordering::Equal {
            regs.next_pc = *target;
            return Ok(());
        }
    }
    regs.next_pc = default_pc;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_word_finds_matching_arm() {
        let table = [
            CaseArm { key: 1, target_pc: 10 },
            CaseArm { key: 5, target_pc: 50 },
        ];
        let mut regs = Registers::new();
        let v = Box::leak(Box::new(5i32));
        regs.src = Some(NonNull::new(v as *mut i32 as *mut u8).unwrap());
        case_word(&mut regs, &table, 99).unwrap();
        assert_eq!(regs.next_pc, 50);
    }

    #[test]
    fn case_word_falls_back_to_default() {
        let table = [CaseArm { key: 1, target_pc: 10 }];
        let mut regs = Registers::new();
        let v = Box::leak(Box::new(2i32));
        regs.src = Some(NonNull::new(v as *mut i32 as *mut u8).unwrap());
        case_word(&mut regs, &table, 99).unwrap();
        assert_eq!(regs.next_pc, 99);
    }
}
