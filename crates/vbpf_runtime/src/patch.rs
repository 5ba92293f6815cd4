//! Instruction splicing with branch relocation.
//!
//! Every relative branch is re-targeted so it keeps landing on the same logical
//! instruction after instructions are inserted or removed. Growth is checked in a
//! probing pass over the untouched program first; the program is only modified once
//! every relocated offset is known to fit its encoding.

use vbpf_insn::Insn;
use vbpf_insn::opcode::{self, CALL, EXIT, JA, JMP, JMP32, PSEUDO_CALL, TAIL_CALL};

use crate::program::Program;
use crate::{Result, RuntimeError};

/// The operand holding a relative branch distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Off,
    Imm,
}

fn branch_field(insn: &Insn) -> Option<Field> {
    if insn.is_pseudo_func() {
        return Some(Field::Imm);
    }
    let class = insn.class();
    if class != JMP && class != JMP32 {
        return None;
    }
    match opcode::op(insn.code) {
        EXIT => None,
        CALL if insn.src() == PSEUDO_CALL => Some(Field::Imm),
        CALL => None,
        TAIL_CALL if class == JMP => None,
        JA if class == JMP32 => Some(Field::Imm),
        _ => Some(Field::Off),
    }
}

/// Region `[pos, end_old)` of the old image became `[pos, end_new)`.
#[derive(Debug, Clone, Copy)]
struct Splice {
    pos: i64,
    end_old: i64,
    end_new: i64,
}

impl Splice {
    fn new(pos: usize, end_old: usize, end_new: usize) -> Self {
        Self {
            pos: pos as i64,
            end_old: end_old as i64,
            end_new: end_new as i64,
        }
    }

    /// Branch distance of the instruction at post-splice index `curr`.
    fn relocate(&self, curr: i64, value: i64) -> i64 {
        let delta = self.end_new - self.end_old;
        let target = curr + value + 1;
        if curr < self.pos && target >= self.end_old {
            value + delta
        } else if curr >= self.end_new && target < self.end_new {
            value - delta
        } else {
            value
        }
    }
}

fn fits(field: Field, value: i64) -> bool {
    match field {
        Field::Off => i16::try_from(value).is_ok(),
        Field::Imm => i32::try_from(value).is_ok(),
    }
}

fn current(insn: &Insn, field: Field) -> i64 {
    match field {
        Field::Off => i64::from(insn.off),
        Field::Imm => i64::from(insn.imm),
    }
}

/// Checks every branch of the unpatched `insns` against the splice of one instruction
/// at `pos` by `end_new - pos` instructions.
fn probe(insns: &[Insn], splice: Splice) -> Result<()> {
    let delta = splice.end_new - splice.end_old;
    for (idx, insn) in insns.iter().enumerate() {
        let read = idx as i64;
        if read >= splice.pos && read < splice.end_old {
            continue;
        }
        let Some(field) = branch_field(insn) else {
            continue;
        };
        let curr = if read < splice.pos { read } else { read + delta };
        if !fits(field, splice.relocate(curr, current(insn, field))) {
            return Err(RuntimeError::OutOfRange { insn: idx });
        }
    }
    Ok(())
}

/// Rewrites branches of the already spliced `insns`.
fn apply(insns: &mut [Insn], splice: Splice) {
    for (idx, insn) in insns.iter_mut().enumerate() {
        let curr = idx as i64;
        if curr >= splice.pos && curr < splice.end_new {
            continue;
        }
        let Some(field) = branch_field(insn) else {
            continue;
        };
        let value = splice.relocate(curr, current(insn, field));
        debug_assert!(fits(field, value), "unprobed relocation at {idx}");
        match field {
            Field::Off => insn.off = value as i16,
            Field::Imm => insn.imm = value as i32,
        }
    }
}

fn ensure_writable(prog: &Program) -> Result<()> {
    if prog.is_locked() {
        return Err(RuntimeError::InvalidState(
            "program is locked read-only".to_string(),
        ));
    }
    Ok(())
}

/// Replaces the instruction at `off` with `replacement`.
///
/// Branches outside the replaced slot are relocated, as are line info and sub-program
/// starts. Branches inside `replacement` are taken as written. On error the program is
/// left as it was.
pub fn patch(prog: &mut Program, off: usize, replacement: &[Insn]) -> Result<()> {
    let len = prog.len();
    if off >= len || replacement.is_empty() {
        return Err(RuntimeError::OutOfRange { insn: off });
    }
    ensure_writable(prog)?;
    if let [single] = replacement {
        prog.insns_mut()[off] = *single;
        return Ok(());
    }

    let end_new = off + replacement.len();
    let splice = Splice::new(off, off + 1, end_new);
    probe(prog.insns(), splice)?;
    let delta = u32::try_from(replacement.len() - 1)
        .map_err(|_| RuntimeError::OutOfRange { insn: off })?;
    if prog.aux().is_some_and(|aux| !aux.can_adjust(off, delta)) {
        return Err(RuntimeError::OutOfRange { insn: off });
    }

    prog.set_len(len + delta as usize)?;
    let insns = prog.insns_mut();
    insns.copy_within(off + 1..len, end_new);
    insns[off..end_new].copy_from_slice(replacement);
    apply(insns, splice);
    if let Some(aux) = prog.aux_mut() {
        aux.adjust_after_patch(off, delta);
    }
    Ok(())
}

/// Removes `cnt` instructions starting at `off`.
///
/// Shrinking can only shorten branch distances, so no probing is needed.
pub fn remove(prog: &mut Program, off: usize, cnt: usize) -> Result<()> {
    let len = prog.len();
    let end = off
        .checked_add(cnt)
        .filter(|end| *end <= len)
        .ok_or(RuntimeError::OutOfRange { insn: off })?;
    ensure_writable(prog)?;
    if cnt == 0 {
        return Ok(());
    }

    prog.insns_mut().copy_within(end..len, off);
    prog.set_len(len - cnt)?;
    apply(prog.insns_mut(), Splice::new(off, end, off));
    if let Some(aux) = prog.aux_mut() {
        aux.adjust_after_remove(off, cnt);
    }
    Ok(())
}
