//! Constant blinding.
//!
//! Every user-supplied immediate is rebuilt in the scratch register as
//! `(imm ^ mask) ^ mask` with a fresh mask per instruction, and the original operation
//! is re-issued in register form. Only the masked value ever appears in the rewritten
//! stream.

use tracing::{debug, warn};
use vbpf_insn::opcode::{
    self, ADD, ALU, ALU64, AND, DIV, DW, IMM, JEQ, JGE, JGT, JLE, JLT, JMP, JMP32, JNE, JSET,
    JSGE, JSGT, JSLE, JSLT, K, LD, LSH, MEM, MOD, MOV, MUL, OR, ST, SUB, X, XOR,
};
use vbpf_insn::{AX, Insn, Reg, alu32_imm, alu64_imm, alu64_reg, mov32_imm, mov64_imm, mov64_reg};
use vbpf_jit::RandomSource;

use crate::patch::patch;
use crate::program::Program;
use crate::Result;

const BLINDED_ALU_OPS: [u8; 9] = [ADD, SUB, AND, OR, XOR, MUL, MOV, DIV, MOD];
const BLINDED_JMP_OPS: [u8; 11] = [JEQ, JNE, JGT, JLT, JGE, JLE, JSGT, JSLT, JSGE, JSLE, JSET];

fn reg_form(code: u8) -> u8 {
    opcode::class(code) | opcode::op(code) | X
}

fn with_src(insn: Insn, code: u8, src: Reg) -> Insn {
    Insn::new(code, insn.dst(), src, insn.off, 0)
}

/// Rewrites one instruction. `ld64` holds the original two halves of the 64-bit load
/// the instruction belongs to, if any.
fn blind_insn(from: &Insn, ld64: Option<&[Insn; 2]>, mask: u32) -> Vec<Insn> {
    if from.dst() == AX || from.src() == AX {
        return Vec::new();
    }
    let code = from.code;
    let class = opcode::class(code);
    let op = opcode::op(code);
    let masked = (mask as i32) ^ from.imm;
    let mask = mask as i32;

    if from.imm == 0 && (code == ALU | MOV | K || code == ALU64 | MOV | K) {
        return vec![alu64_reg(XOR, from.dst(), from.dst())];
    }

    let is_k = opcode::source(code) == K;
    match class {
        ALU if is_k && BLINDED_ALU_OPS.contains(&op) => vec![
            mov32_imm(AX, masked),
            alu32_imm(XOR, AX, mask),
            with_src(*from, reg_form(code), AX),
        ],
        ALU64 if is_k && BLINDED_ALU_OPS.contains(&op) => vec![
            mov64_imm(AX, masked),
            alu64_imm(XOR, AX, mask),
            with_src(*from, reg_form(code), AX),
        ],
        JMP | JMP32 if is_k && BLINDED_JMP_OPS.contains(&op) => {
            // The branch moves two slots down.
            let off = if from.off < 0 { from.off - 2 } else { from.off };
            let (load, unmask) = if class == JMP {
                (mov64_imm(AX, masked), alu64_imm(XOR, AX, mask))
            } else {
                (mov32_imm(AX, masked), alu32_imm(XOR, AX, mask))
            };
            vec![
                load,
                unmask,
                Insn::new(reg_form(code), from.dst(), AX, off, 0),
            ]
        }
        ST if opcode::mode(code) == MEM => vec![
            mov64_imm(AX, masked),
            alu64_imm(XOR, AX, mask),
            Insn::new(
                opcode::STX | MEM | opcode::size(code),
                from.dst(),
                AX,
                from.off,
                0,
            ),
        ],
        LD if code == LD | DW | IMM => match ld64 {
            Some([lo, hi]) => vec![
                mov64_imm(AX, mask ^ hi.imm),
                alu64_imm(XOR, AX, mask),
                alu64_imm(LSH, AX, 32),
                mov64_reg(lo.dst(), AX),
            ],
            None => Vec::new(),
        },
        LD if code == 0 => match ld64 {
            Some([lo, _]) => vec![
                mov32_imm(AX, mask ^ lo.imm),
                alu32_imm(XOR, AX, mask),
                alu64_reg(OR, lo.dst(), AX),
            ],
            None => Vec::new(),
        },
        _ => Vec::new(),
    }
}

fn blind_insns(prog: &mut Program, rng: &dyn RandomSource) -> Result<()> {
    let mut ld64: Option<[Insn; 2]> = None;
    let mut idx = 0;
    while idx < prog.len() {
        let insns = prog.insns();
        let insn = insns[idx];
        if insn.is_pseudo_func() {
            idx += 2;
            continue;
        }
        // The second half is rewritten from the original pair after the first half
        // has already been replaced.
        let pending = if insn.is_ld_imm64() {
            ld64 = insns.get(idx + 1).filter(|next| next.code == 0).map(|next| [insn, *next]);
            ld64
        } else if insn.code == 0 {
            ld64.take()
        } else {
            None
        };
        let rewritten = blind_insn(&insn, pending.as_ref(), rng.next_u32());
        if rewritten.is_empty() {
            idx += 1;
            continue;
        }
        patch(prog, idx, &rewritten)?;
        idx += rewritten.len();
    }
    Ok(())
}

/// Returns a blinded copy of `prog`, or `None` when blinding was not requested or has
/// already happened.
///
/// The copy takes over the aux block. If a rewrite fails the block is handed back to
/// `prog` before the error is returned.
pub fn blind(prog: &mut Program, rng: &dyn RandomSource) -> Result<Option<Program>> {
    if !prog.flags().blinding_requested || prog.is_blinded() {
        return Ok(None);
    }
    let mut clone = prog.clone_for_rewrite()?;
    match blind_insns(&mut clone, rng) {
        Ok(()) => {
            clone.mark_blinded();
            debug!(
                id = clone.id(),
                before = prog.len(),
                after = clone.len(),
                "constants blinded"
            );
            Ok(Some(clone))
        }
        Err(err) => {
            warn!(id = clone.id(), %err, "constant blinding failed");
            clone.release_other(prog);
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::ProgType;
    use crate::RuntimeError;
    use vbpf_insn::opcode::W;
    use vbpf_insn::{R0, R1, R10, exit, ja, jmp_imm, jmp32_imm, ld_func, ld_imm64, st_mem};

    struct FixedRandom(u32);

    impl RandomSource for FixedRandom {
        fn next_u32(&self) -> u32 {
            self.0
        }
    }

    fn requested(insns: &[Insn]) -> Program {
        let mut prog = Program::load(insns, ProgType::SocketFilter).unwrap();
        prog.request_blinding();
        prog
    }

    #[test]
    fn test_not_requested_or_already_blinded() {
        let mut plain = Program::load(&[mov64_imm(R0, 5), exit()], ProgType::Unspec).unwrap();
        assert!(blind(&mut plain, &FixedRandom(1)).unwrap().is_none());

        let mut prog = requested(&[mov64_imm(R0, 5), exit()]);
        let mut blinded = blind(&mut prog, &FixedRandom(1)).unwrap().unwrap();
        assert!(blinded.is_blinded());
        assert!(blind(&mut blinded, &FixedRandom(1)).unwrap().is_none());
    }

    #[test]
    fn test_literals_never_survive() {
        let secret = 0x1234_5678;
        let mut insns = vec![mov64_imm(R0, secret), alu64_imm(ADD, R0, secret)];
        insns.extend(ld_imm64(R1, 0x1234_5678_1234_5678));
        insns.extend([st_mem(W, R10, -8, secret), exit()]);
        let mut prog = requested(&insns);
        let blinded = blind(&mut prog, &FixedRandom(0xdead_beef)).unwrap().unwrap();
        assert!(blinded.insns().iter().all(|insn| insn.imm != secret));
        assert!(blinded.insns().iter().any(|insn| insn.dst() == AX));
    }

    #[test]
    fn test_alu_sequence() {
        let mut prog = requested(&[alu32_imm(ADD, R0, 7), exit()]);
        let blinded = blind(&mut prog, &FixedRandom(0xf0)).unwrap().unwrap();
        assert_eq!(
            &blinded.insns()[..3],
            &[
                mov32_imm(AX, 0xf0 ^ 7),
                alu32_imm(XOR, AX, 0xf0),
                Insn::new(ALU | ADD | X, R0, AX, 0, 0),
            ]
        );
    }

    #[test]
    fn test_zero_move_becomes_xor() {
        let mut prog = requested(&[mov64_imm(R1, 0), exit()]);
        let blinded = blind(&mut prog, &FixedRandom(3)).unwrap().unwrap();
        assert_eq!(blinded.insns(), &[alu64_reg(XOR, R1, R1), exit()]);
    }

    #[test]
    fn test_backward_branch_keeps_target() {
        let mut prog = requested(&[
            mov64_imm(R0, 1),
            alu64_imm(ADD, R0, 1),
            jmp_imm(JNE, R0, 10, -2),
            exit(),
        ]);
        let blinded = blind(&mut prog, &FixedRandom(9)).unwrap().unwrap();
        let insns = blinded.insns();
        // mov(3) add(3) jne(3) exit
        assert_eq!(insns.len(), 10);
        let jump = &insns[8];
        assert_eq!(jump.code, JMP | JNE | X);
        // Lands on the first instruction of the blinded add.
        assert_eq!(8 + i64::from(jump.off) + 1, 3);
    }

    #[test]
    fn test_jmp32_uses_alu32_scratch() {
        let mut prog = requested(&[jmp32_imm(JEQ, R0, -1, 0), exit()]);
        let blinded = blind(&mut prog, &FixedRandom(5)).unwrap().unwrap();
        assert_eq!(opcode::class(blinded.insns()[0].code), ALU);
        assert_eq!(blinded.insns()[2].code, JMP32 | JEQ | X);
    }

    #[test]
    fn test_scratch_and_subprog_addresses_untouched() {
        let mut insns = vec![mov64_imm(AX, 77)];
        insns.extend(ld_func(R1, 0));
        insns.push(exit());
        let mut prog = requested(&insns);
        let blinded = blind(&mut prog, &FixedRandom(5)).unwrap().unwrap();
        assert_eq!(blinded.insns(), insns.as_slice());
    }

    #[test]
    fn test_failure_returns_aux_to_original() {
        let mut prog = requested(&[
            ja(i16::MAX - 2),
            mov64_imm(R0, 1),
            mov64_imm(R0, 2),
            exit(),
        ]);
        prog.aux_mut().unwrap().name = "victim".to_string();
        let err = blind(&mut prog, &FixedRandom(1)).unwrap_err();
        assert!(matches!(err, RuntimeError::OutOfRange { .. }));
        assert_eq!(prog.name(), "victim");
        assert!(!prog.is_blinded());
        assert_eq!(prog.len(), 4);
    }
}
