//! JIT backends.
//!
//! A backend takes a program and either hands it back with native code installed
//! through [`Program::set_jited`] or returns it untouched, in which case the runtime
//! binds the interpreter.

use std::sync::Arc;

use tracing::{debug, warn};
use vbpf_insn::opcode::{
    self, ADD, ALU, ALU64, AND, ARSH, EXIT, JMP, K, LSH, MOV, NEG, OR, RSH, SUB, X, XOR,
};
use vbpf_insn::{AX, Insn, R0, Reg};
use vbpf_jit::{JitBinary, JitBudget, PackAllocator, RandomSource};

use crate::program::Program;

/// What a backend may allocate from while compiling.
pub struct JitContext<'a> {
    pub allocator: &'a Arc<PackAllocator>,
    pub budget: &'a Arc<JitBudget>,
    pub rng: &'a dyn RandomSource,
}

pub trait JitBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns `prog` with native code installed, or unchanged to request interpretation.
    fn compile(&self, prog: Program, ctx: &JitContext<'_>) -> Program;
}

/// Straight-line x86-64 code for programs that only do register arithmetic on R0 and
/// the scratch register and end in a single exit.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinearX64Backend;

/// Hardware register for `reg`: R0 lives in rax, the scratch register in rcx.
const fn hw_reg(reg: Reg) -> Option<u8> {
    match reg {
        R0 => Some(0),
        AX => Some(1),
        _ => None,
    }
}

const fn alu_ext(op: u8) -> Option<u8> {
    match op {
        ADD => Some(0),
        OR => Some(1),
        AND => Some(4),
        SUB => Some(5),
        XOR => Some(6),
        _ => None,
    }
}

const fn shift_ext(op: u8) -> Option<u8> {
    match op {
        LSH => Some(4),
        RSH => Some(5),
        ARSH => Some(7),
        _ => None,
    }
}

const fn alu_reg_opcode(op: u8) -> Option<u8> {
    match op {
        ADD => Some(0x01),
        OR => Some(0x09),
        AND => Some(0x21),
        SUB => Some(0x29),
        XOR => Some(0x31),
        MOV => Some(0x89),
        _ => None,
    }
}

fn emit_insn(out: &mut Vec<u8>, insn: &Insn) -> Option<()> {
    let class = insn.class();
    if class != ALU && class != ALU64 {
        return None;
    }
    let wide = class == ALU64;
    let op = opcode::op(insn.code);
    let dst = hw_reg(insn.dst())?;
    let rex = |out: &mut Vec<u8>| {
        if wide {
            out.push(0x48);
        }
    };

    if op == NEG {
        rex(out);
        out.extend([0xf7, 0xc0 | (3 << 3) | dst]);
        return Some(());
    }
    if insn.off != 0 {
        return None;
    }
    if opcode::source(insn.code) == X {
        let src = hw_reg(insn.src())?;
        let opc = alu_reg_opcode(op)?;
        rex(out);
        out.extend([opc, 0xc0 | (src << 3) | dst]);
        return Some(());
    }
    debug_assert_eq!(opcode::source(insn.code), K);

    let imm = insn.imm.to_le_bytes();
    if op == MOV {
        if wide {
            out.extend([0x48, 0xc7, 0xc0 | dst]);
        } else {
            out.push(0xb8 + dst);
        }
        out.extend(imm);
    } else if let Some(ext) = shift_ext(op) {
        let mask = if wide { 63 } else { 31 };
        rex(out);
        out.extend([0xc1, 0xc0 | (ext << 3) | dst, (insn.imm & mask) as u8]);
    } else {
        let ext = alu_ext(op)?;
        rex(out);
        out.extend([0x81, 0xc0 | (ext << 3) | dst]);
        out.extend(imm);
    }
    Some(())
}

/// Machine code for `insns`, if every instruction is supported.
pub fn emit_linear(insns: &[Insn]) -> Option<Vec<u8>> {
    let (last, body) = insns.split_last()?;
    if last.code != JMP | EXIT {
        return None;
    }
    let mut out = Vec::with_capacity(insns.len() * 7 + 1);
    for insn in body {
        emit_insn(&mut out, insn)?;
    }
    // ret: R0 is already in rax.
    out.push(0xc3);
    Some(out)
}

impl JitBackend for LinearX64Backend {
    fn name(&self) -> &'static str {
        "linear-x86_64"
    }

    fn compile(&self, mut prog: Program, ctx: &JitContext<'_>) -> Program {
        if !cfg!(target_arch = "x86_64") {
            return prog;
        }
        let Some(code) = emit_linear(prog.insns()) else {
            debug!(id = prog.id(), "program outside the linear subset");
            return prog;
        };
        let image = JitBinary::alloc(ctx.allocator, ctx.budget, code.len(), 1, ctx.rng)
            .and_then(|mut binary| {
                binary.image_mut().copy_from_slice(&code);
                binary.finalize()
            });
        match image {
            Ok(image) => {
                debug!(id = prog.id(), bytes = code.len(), "program compiled");
                prog.set_jited(image);
            }
            Err(err) => warn!(id = prog.id(), %err, "JIT image allocation failed"),
        }
        prog
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{Entry, ProgType};
    use vbpf_config::PackConfig;
    use vbpf_insn::{R1, alu32_imm, alu64_imm, alu64_reg, exit, ja, mov64_imm, mov64_reg};
    use vbpf_jit::HashRandom;

    #[test]
    fn test_emit_encodings() {
        assert_eq!(
            emit_linear(&[mov64_imm(R0, 42), exit()]).unwrap(),
            vec![0x48, 0xc7, 0xc0, 42, 0, 0, 0, 0xc3]
        );
        assert_eq!(
            emit_linear(&[
                mov64_imm(AX, 1),
                alu64_imm(XOR, AX, 3),
                mov64_reg(R0, AX),
                alu32_imm(LSH, R0, 33),
                exit()
            ])
            .unwrap(),
            vec![
                0x48, 0xc7, 0xc1, 1, 0, 0, 0, // mov rcx, 1
                0x48, 0x81, 0xf1, 3, 0, 0, 0, // xor rcx, 3
                0x48, 0x89, 0xc8, // mov rax, rcx
                0xc1, 0xe0, 1, // shl eax, 1
                0xc3,
            ]
        );
    }

    #[test]
    fn test_unsupported_programs_rejected() {
        assert!(emit_linear(&[]).is_none());
        assert!(emit_linear(&[mov64_imm(R0, 1)]).is_none());
        assert!(emit_linear(&[mov64_imm(R1, 1), exit()]).is_none());
        assert!(emit_linear(&[ja(0), exit()]).is_none());
        assert!(emit_linear(&[alu64_reg(vbpf_insn::opcode::MUL, R0, AX), exit()]).is_none());
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_compiled_program_runs() {
        let allocator = Arc::new(PackAllocator::new(&PackConfig::default()));
        let budget = Arc::new(JitBudget::new(0));
        let rng = HashRandom::new();
        let ctx = JitContext {
            allocator: &allocator,
            budget: &budget,
            rng: &rng,
        };
        let prog = Program::load(
            &[mov64_imm(R0, 40), alu64_imm(ADD, R0, 2), exit()],
            ProgType::Unspec,
        )
        .unwrap();
        let prog = LinearX64Backend.compile(prog, &ctx);
        assert!(prog.is_jited());
        let Entry::Jited { func, .. } = prog.entry() else {
            panic!("expected native entry");
        };
        // SAFETY: the image was emitted for the `JitFunc` signature and ignores both arguments.
        let ret = unsafe { func(std::ptr::null_mut(), prog.insns().as_ptr()) };
        assert_eq!(ret, 42);
    }
}
