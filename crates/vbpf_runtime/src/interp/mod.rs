//! Instruction interpreter.
//!
//! Each instruction is decoded by a single `match` on its opcode byte that yields a
//! [`Step`]. The loop applies it: advance, branch, enter or leave a sub-program, or
//! switch to a tail-call target. Instructions the verifier would have rejected (unknown
//! opcodes, non-probing accesses outside the stack and context, unknown helpers) abort
//! with a panic.

pub mod helpers;
pub mod memory;

use std::ops::Deref;
use std::sync::Arc;

use vbpf_config::InterpreterConfig;
use vbpf_insn::opcode::{
    self, ADD, ALU, ALU64, AND, ARSH, ATOMIC, CALL, CMPXCHG, DIV, DW, END, EXIT, FETCH, JA, JEQ,
    JGE, JGT, JLE, JLT, JMP, JMP32, JNE, JSET, JSGE, JSGT, JSLE, JSLT, LD, LDX, LSH, MEM, MEMSX,
    MOD, MOV, MUL, NEG, NOSPEC, OR, PROBE_MEM, PROBE_MEMSX, PSEUDO_CALL, RSH, ST, STX, SUB,
    TAIL_CALL, TO_BE, X, XCHG, XOR,
};
use vbpf_insn::{Insn, R0, R1, R2, R3, R6, R10, REG_COUNT};

pub use helpers::{HelperCtx, HelperFn, HelperTable};
pub use memory::{CTX_BASE, Memory, STACK_TOP};

use crate::program::{MAX_STACK, Program};

/// Outcome of one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Next,
    /// Relative to the following instruction.
    Jump(i64),
    Exit,
    /// Absolute index of a sub-program in the current program.
    Call(usize),
    TailCall,
}

#[derive(Clone)]
enum ProgRef<'p> {
    Root(&'p Program),
    Owned(Arc<Program>),
}

impl Deref for ProgRef<'_> {
    type Target = Program;

    fn deref(&self) -> &Program {
        match self {
            Self::Root(prog) => prog,
            Self::Owned(prog) => prog,
        }
    }
}

/// Caller state saved across a program-local call.
struct Frame<'p> {
    prog: ProgRef<'p>,
    ret_pc: usize,
    callee_saved: [u64; 4],
    fp: u64,
    bottom: u64,
}

struct Vm<'c> {
    regs: [u64; REG_COUNT],
    mem: Memory<'c>,
    cookie: u64,
    tail_calls: u32,
}

pub struct Interpreter {
    max_tail_calls: u32,
    max_call_frames: usize,
    helpers: Arc<HelperTable>,
}

impl Interpreter {
    pub fn new(config: &InterpreterConfig, helpers: Arc<HelperTable>) -> Self {
        Self {
            max_tail_calls: config.max_tail_calls,
            max_call_frames: config.max_call_frames.max(1),
            helpers,
        }
    }

    pub fn helpers(&self) -> &HelperTable {
        &self.helpers
    }

    /// Runs `prog` with a root frame of `stack_size` bytes and returns R0.
    ///
    /// Sub-program frames are mapped below the root frame as calls reach them.
    pub fn execute(&self, prog: &Program, stack_size: u32, ctx: &mut [u8], cookie: u64) -> u64 {
        let mem = Memory::new(stack_size as usize, ctx);
        let top = mem.stack_top();
        let mut vm = Vm {
            regs: [0; REG_COUNT],
            mem,
            cookie,
            tail_calls: 0,
        };
        vm.regs[R1 as usize] = CTX_BASE;
        vm.regs[R10 as usize] = top;

        let mut current = ProgRef::Root(prog);
        let mut frames: Vec<Frame<'_>> = Vec::new();
        let mut bottom = top - u64::from(stack_size);
        let mut pc = 0_usize;
        loop {
            let insns = current.insns();
            let Some(&insn) = insns.get(pc) else {
                panic!("program {} fell off its end at {pc}", current.id());
            };
            match self.step(&mut vm, insns, pc, insn) {
                Step::Next => pc += 1,
                Step::Jump(off) => pc = relative(pc, off),
                Step::Exit => match frames.pop() {
                    None => return vm.regs[R0 as usize],
                    Some(frame) => {
                        vm.regs[R6 as usize..=R6 as usize + 3].copy_from_slice(&frame.callee_saved);
                        vm.regs[R10 as usize] = frame.fp;
                        bottom = frame.bottom;
                        current = frame.prog;
                        pc = frame.ret_pc;
                    }
                },
                Step::Call(target) => {
                    if frames.len() + 1 >= self.max_call_frames {
                        panic!("call depth exceeds {} frames", self.max_call_frames);
                    }
                    let depth = current
                        .aux()
                        .and_then(|aux| aux.subprog_stack_depth(target))
                        .unwrap_or(MAX_STACK)
                        .min(MAX_STACK);
                    let mut callee_saved = [0; 4];
                    callee_saved.copy_from_slice(&vm.regs[R6 as usize..=R6 as usize + 3]);
                    frames.push(Frame {
                        prog: current.clone(),
                        ret_pc: pc + 1,
                        callee_saved,
                        fp: vm.regs[R10 as usize],
                        bottom,
                    });
                    vm.regs[R10 as usize] = bottom;
                    bottom -= u64::from(depth);
                    vm.mem.grow_stack(bottom);
                    pc = target;
                }
                Step::TailCall => match self.tail_call_target(&mut vm, &current) {
                    Some(next) => {
                        current = ProgRef::Owned(next);
                        pc = 0;
                    }
                    None => pc += 1,
                },
            }
        }
    }

    fn tail_call_target(&self, vm: &mut Vm<'_>, current: &Program) -> Option<Arc<Program>> {
        let map = current.aux()?.map_by_handle(vm.regs[R2 as usize])?;
        let array = map.as_prog_array()?;
        let index = vm.regs[R3 as usize] as u32;
        if index >= array.max_entries() || vm.tail_calls >= self.max_tail_calls {
            return None;
        }
        vm.tail_calls += 1;
        array.lookup(index)
    }

    fn step(&self, vm: &mut Vm<'_>, insns: &[Insn], pc: usize, insn: Insn) -> Step {
        let dst = insn.dst() as usize;
        let src = insn.src() as usize;
        let code = insn.code;
        let op = opcode::op(code);
        let regs = &mut vm.regs;

        match opcode::class(code) {
            ALU64 if op == END => {
                regs[dst] = bswap(regs[dst], insn.imm);
                Step::Next
            }
            ALU if op == END => {
                regs[dst] = if opcode::source(code) == TO_BE {
                    to_be(regs[dst], insn.imm)
                } else {
                    to_le(regs[dst], insn.imm)
                };
                Step::Next
            }
            ALU64 => {
                let operand = if opcode::source(code) == X {
                    regs[src]
                } else {
                    insn.imm as i64 as u64
                };
                regs[dst] = alu64(op, insn.off, regs[dst], operand, code);
                Step::Next
            }
            ALU => {
                let operand = if opcode::source(code) == X {
                    regs[src] as u32
                } else {
                    insn.imm as u32
                };
                regs[dst] = u64::from(alu32(op, insn.off, regs[dst] as u32, operand, code));
                Step::Next
            }
            JMP => match op {
                JA => Step::Jump(i64::from(insn.off)),
                EXIT => Step::Exit,
                TAIL_CALL => Step::TailCall,
                CALL if insn.src() == PSEUDO_CALL => Step::Call(relative(pc, i64::from(insn.imm))),
                CALL => {
                    let helper = self
                        .helpers
                        .get(insn.imm)
                        .unwrap_or_else(|| panic!("unknown helper {}", insn.imm));
                    let args = [regs[1], regs[2], regs[3], regs[4], regs[5]];
                    let mut ctx = HelperCtx {
                        mem: &mut vm.mem,
                        cookie: vm.cookie,
                    };
                    vm.regs[R0 as usize] = helper(&mut ctx, args);
                    Step::Next
                }
                _ => {
                    let (a, b) = if opcode::source(code) == X {
                        (regs[dst], regs[src])
                    } else {
                        (regs[dst], insn.imm as i64 as u64)
                    };
                    branch(cond(op, a, b, a as i64, b as i64, code), insn.off)
                }
            },
            JMP32 => match op {
                JA => Step::Jump(i64::from(insn.imm)),
                _ => {
                    let a = regs[dst] as u32;
                    let b = if opcode::source(code) == X {
                        regs[src] as u32
                    } else {
                        insn.imm as u32
                    };
                    let hit = cond(
                        op,
                        u64::from(a),
                        u64::from(b),
                        i64::from(a as i32),
                        i64::from(b as i32),
                        code,
                    );
                    branch(hit, insn.off)
                }
            },
            LD if code == LD | DW => {
                let Some(hi) = insns.get(pc + 1) else {
                    panic!("truncated 64-bit load at {pc}");
                };
                regs[dst] = if insn.is_pseudo_func() {
                    relative(pc, i64::from(insn.imm)) as u64
                } else {
                    u64::from(insn.imm as u32) | (u64::from(hi.imm as u32) << 32)
                };
                Step::Jump(1)
            }
            LDX => {
                let addr = regs[src].wrapping_add(insn.off as i64 as u64);
                let size = opcode::size_bytes(code);
                regs[dst] = match opcode::mode(code) {
                    MEM => vm.mem.load(addr, size).unwrap_or_else(|| fault("read", addr, size)),
                    MEMSX => sign_extend(
                        vm.mem.load(addr, size).unwrap_or_else(|| fault("read", addr, size)),
                        size,
                    ),
                    PROBE_MEM => vm.mem.load(addr, size).unwrap_or(0),
                    PROBE_MEMSX => vm.mem.load(addr, size).map_or(0, |v| sign_extend(v, size)),
                    _ => unknown(code),
                };
                Step::Next
            }
            ST => match opcode::mode(code) {
                MEM => {
                    let addr = regs[dst].wrapping_add(insn.off as i64 as u64);
                    let size = opcode::size_bytes(code);
                    vm.mem
                        .store(addr, size, insn.imm as i64 as u64)
                        .unwrap_or_else(|| fault("write", addr, size));
                    Step::Next
                }
                NOSPEC => Step::Next,
                _ => unknown(code),
            },
            STX => {
                let addr = regs[dst].wrapping_add(insn.off as i64 as u64);
                let size = opcode::size_bytes(code);
                match opcode::mode(code) {
                    MEM => vm
                        .mem
                        .store(addr, size, regs[src])
                        .unwrap_or_else(|| fault("write", addr, size)),
                    ATOMIC if size == 4 || size == 8 => atomic(vm, insn, addr, size),
                    _ => unknown(code),
                }
                Step::Next
            }
            _ => unknown(code),
        }
    }
}

fn atomic(vm: &mut Vm<'_>, insn: Insn, addr: u64, size: usize) {
    let src = insn.src() as usize;
    let mask = if size == 4 { u64::from(u32::MAX) } else { u64::MAX };
    let old = vm
        .mem
        .load(addr, size)
        .unwrap_or_else(|| fault("atomic access", addr, size));
    let operand = vm.regs[src] & mask;
    match insn.imm {
        XCHG => {
            vm.mem.store(addr, size, operand);
            vm.regs[src] = old;
        }
        CMPXCHG => {
            if old == vm.regs[R0 as usize] & mask {
                vm.mem.store(addr, size, operand);
            }
            vm.regs[R0 as usize] = old;
        }
        imm => {
            let new = match (imm & !FETCH) as u8 {
                ADD => old.wrapping_add(operand),
                OR => old | operand,
                AND => old & operand,
                XOR => old ^ operand,
                _ => panic!("unknown atomic operation {imm:#x}"),
            };
            vm.mem.store(addr, size, new & mask);
            if imm & FETCH != 0 {
                vm.regs[src] = old;
            }
        }
    }
}

#[inline]
fn relative(pc: usize, off: i64) -> usize {
    let target = pc as i64 + off + 1;
    usize::try_from(target).unwrap_or_else(|_| panic!("branch at {pc} to {target}"))
}

#[inline]
fn branch(taken: bool, off: i16) -> Step {
    if taken {
        Step::Jump(i64::from(off))
    } else {
        Step::Next
    }
}

#[inline]
fn cond(op: u8, a: u64, b: u64, sa: i64, sb: i64, code: u8) -> bool {
    match op {
        JEQ => a == b,
        JNE => a != b,
        JGT => a > b,
        JGE => a >= b,
        JLT => a < b,
        JLE => a <= b,
        JSET => a & b != 0,
        JSGT => sa > sb,
        JSGE => sa >= sb,
        JSLT => sa < sb,
        JSLE => sa <= sb,
        _ => unknown(code),
    }
}

/// 64-bit arithmetic. `off == 1` selects signed division; on `MOV` it is the
/// sign-extension width.
#[inline]
fn alu64(op: u8, off: i16, dst: u64, src: u64, code: u8) -> u64 {
    match op {
        ADD => dst.wrapping_add(src),
        SUB => dst.wrapping_sub(src),
        MUL => dst.wrapping_mul(src),
        DIV if src == 0 => 0,
        DIV if off == 1 => (dst as i64).wrapping_div(src as i64) as u64,
        DIV => dst / src,
        MOD if src == 0 => dst,
        MOD if off == 1 => (dst as i64).wrapping_rem(src as i64) as u64,
        MOD => dst % src,
        OR => dst | src,
        AND => dst & src,
        XOR => dst ^ src,
        LSH => dst << (src & 63),
        RSH => dst >> (src & 63),
        ARSH => ((dst as i64) >> (src & 63)) as u64,
        NEG => (dst as i64).wrapping_neg() as u64,
        MOV => match off {
            8 => src as i8 as i64 as u64,
            16 => src as i16 as i64 as u64,
            32 => src as i32 as i64 as u64,
            _ => src,
        },
        _ => unknown(code),
    }
}

#[inline]
fn alu32(op: u8, off: i16, dst: u32, src: u32, code: u8) -> u32 {
    match op {
        ADD => dst.wrapping_add(src),
        SUB => dst.wrapping_sub(src),
        MUL => dst.wrapping_mul(src),
        DIV if src == 0 => 0,
        DIV if off == 1 => (dst as i32).wrapping_div(src as i32) as u32,
        DIV => dst / src,
        MOD if src == 0 => dst,
        MOD if off == 1 => (dst as i32).wrapping_rem(src as i32) as u32,
        MOD => dst % src,
        OR => dst | src,
        AND => dst & src,
        XOR => dst ^ src,
        LSH => dst << (src & 31),
        RSH => dst >> (src & 31),
        ARSH => ((dst as i32) >> (src & 31)) as u32,
        NEG => (dst as i32).wrapping_neg() as u32,
        MOV => match off {
            8 => src as i8 as i32 as u32,
            16 => src as i16 as i32 as u32,
            _ => src,
        },
        _ => unknown(code),
    }
}

fn to_le(value: u64, bits: i32) -> u64 {
    match bits {
        16 => u64::from((value as u16).to_le()),
        32 => u64::from((value as u32).to_le()),
        64 => value.to_le(),
        _ => panic!("invalid byte-swap width {bits}"),
    }
}

fn to_be(value: u64, bits: i32) -> u64 {
    match bits {
        16 => u64::from((value as u16).to_be()),
        32 => u64::from((value as u32).to_be()),
        64 => value.to_be(),
        _ => panic!("invalid byte-swap width {bits}"),
    }
}

fn bswap(value: u64, bits: i32) -> u64 {
    match bits {
        16 => u64::from((value as u16).swap_bytes()),
        32 => u64::from((value as u32).swap_bytes()),
        64 => value.swap_bytes(),
        _ => panic!("invalid byte-swap width {bits}"),
    }
}

fn sign_extend(value: u64, size: usize) -> u64 {
    match size {
        1 => value as i8 as i64 as u64,
        2 => value as i16 as i64 as u64,
        4 => value as i32 as i64 as u64,
        _ => value,
    }
}

#[cold]
fn fault(kind: &str, addr: u64, size: usize) -> ! {
    panic!("invalid {kind} of {size} bytes at {addr:#x}")
}

#[cold]
fn unknown(code: u8) -> ! {
    panic!("unknown opcode {code:#04x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::{Map, ProgArrayMap};
    use crate::prog_aux::Subprog;
    use crate::program::ProgType;
    use vbpf_insn::opcode::{B, H, TO_LE, W};
    use vbpf_insn::{
        R7, alu32_imm, alu32_reg, alu64_imm, alu64_reg, atomic, call_helper, call_pseudo,
        endian, exit, ja, ja32, jmp32_imm, jmp_imm, jmp_reg, ld_imm64, ld_map, ldx_mem,
        ldx_memsx, ldx_probe, mov32_imm, mov64_imm, mov64_reg, movsx64_reg, nospec, sdiv64_reg,
        smod64_reg, st_mem, stx_mem, tail_call,
    };

    fn interpreter() -> Interpreter {
        Interpreter::new(
            &InterpreterConfig::default(),
            Arc::new(HelperTable::default()),
        )
    }

    fn run_ctx(insns: &[Insn], ctx: &mut [u8]) -> u64 {
        let prog = Program::load(insns, ProgType::Unspec).unwrap();
        interpreter().execute(&prog, MAX_STACK, ctx, 0)
    }

    fn run(insns: &[Insn]) -> u64 {
        run_ctx(insns, &mut [])
    }

    #[test]
    fn test_alu_basics() {
        assert_eq!(run(&[mov64_imm(R0, 6), alu64_imm(MUL, R0, 7), exit()]), 42);
        assert_eq!(run(&[mov64_imm(R0, -1), exit()]), u64::MAX);
        // 32-bit results are zero-extended.
        assert_eq!(run(&[mov64_imm(R0, -1), alu32_imm(ADD, R0, 1), exit()]), 0);
        assert_eq!(run(&[mov32_imm(R0, -1), exit()]), 0xffff_ffff);
        assert_eq!(
            run(&[mov64_imm(R0, -16), alu64_imm(ARSH, R0, 2), exit()]),
            -4_i64 as u64
        );
        assert_eq!(run(&[mov64_imm(R0, 1), alu64_imm(LSH, R0, 65), exit()]), 2);
        assert_eq!(run(&[mov64_imm(R0, 5), alu64_imm(NEG, R0, 0), exit()]), -5_i64 as u64);
    }

    #[test]
    fn test_division_by_zero_is_defined() {
        let zero = |op: u8, signed: bool, wide: bool| {
            let mut div = if wide {
                alu64_reg(op, R0, R1)
            } else {
                alu32_reg(op, R0, R1)
            };
            div.off = i16::from(signed);
            let mut insns = ld_imm64(R0, 0x1_0000_0007).to_vec();
            insns.extend([mov64_imm(R1, 0), div, exit()]);
            run(&insns)
        };
        for signed in [false, true] {
            assert_eq!(zero(DIV, signed, true), 0);
            assert_eq!(zero(DIV, signed, false), 0);
            assert_eq!(zero(MOD, signed, true), 0x1_0000_0007);
            assert_eq!(zero(MOD, signed, false), 7);
        }
    }

    #[test]
    fn test_signed_division() {
        assert_eq!(
            run(&[mov64_imm(R0, -7), mov64_imm(R1, 2), sdiv64_reg(R0, R1), exit()]),
            -3_i64 as u64
        );
        assert_eq!(
            run(&[mov64_imm(R0, -7), mov64_imm(R1, 2), smod64_reg(R0, R1), exit()]),
            -1_i64 as u64
        );
        let mut insns = ld_imm64(R0, i64::MIN as u64).to_vec();
        insns.extend([mov64_imm(R1, -1), sdiv64_reg(R0, R1), exit()]);
        assert_eq!(run(&insns), i64::MIN as u64);
    }

    #[test]
    fn test_sign_extension_and_byte_swap() {
        assert_eq!(
            run(&[mov64_imm(R1, 0x80), movsx64_reg(R0, R1, 8), exit()]),
            -128_i64 as u64
        );
        assert_eq!(
            run(&[mov64_imm(R0, 0x1234), endian(ALU, TO_BE, R0, 16), exit()]),
            u64::from(0x1234_u16.to_be())
        );
        assert_eq!(
            run(&[mov64_imm(R0, 0x1_2345), endian(ALU, TO_LE, R0, 16), exit()]),
            0x2345
        );
        assert_eq!(
            run(&[mov64_imm(R0, 0x1234), endian(ALU64, TO_LE, R0, 16), exit()]),
            0x3412
        );
    }

    #[test]
    fn test_jumps() {
        // Count down from 5.
        let insns = [
            mov64_imm(R0, 0),
            mov64_imm(R1, 5),
            alu64_imm(ADD, R0, 2),
            alu64_imm(SUB, R1, 1),
            jmp_imm(JNE, R1, 0, -3),
            exit(),
        ];
        assert_eq!(run(&insns), 10);
        assert_eq!(
            run(&[mov64_imm(R0, 1), ja(1), mov64_imm(R0, 2), exit()]),
            1
        );
        assert_eq!(
            run(&[mov64_imm(R0, 1), ja32(1), mov64_imm(R0, 2), exit()]),
            1
        );
        // Only the low halves are compared.
        let mut insns = ld_imm64(R1, 0xffff_ffff_0000_0003).to_vec();
        insns.extend([
            mov64_imm(R0, 0),
            jmp32_imm(JEQ, R1, 3, 1),
            exit(),
            mov64_imm(R0, 1),
            exit(),
        ]);
        assert_eq!(run(&insns), 1);
        assert_eq!(
            run(&[
                mov64_imm(R0, -1),
                mov64_imm(R1, 1),
                jmp_reg(JSLT, R0, R1, 1),
                mov64_imm(R0, 7),
                exit()
            ]),
            u64::MAX
        );
    }

    #[test]
    fn test_stack_and_context() {
        let insns = [
            st_mem(DW, R10, -8, 40),
            ldx_mem(DW, R0, R10, -8),
            ldx_mem(B, R2, R1, 0),
            alu64_reg(ADD, R0, R2),
            stx_mem(H, R1, R0, 2),
            exit(),
        ];
        let mut ctx = [2_u8, 0, 0, 0];
        assert_eq!(run_ctx(&insns, &mut ctx), 42);
        assert_eq!(ctx, [2, 0, 42, 0]);

        let insns = [
            st_mem(B, R10, -1, 0xff),
            ldx_memsx(B, R0, R10, -1),
            nospec(),
            exit(),
        ];
        assert_eq!(run(&insns), u64::MAX);
    }

    #[test]
    fn test_probe_load_never_faults() {
        let insns = [mov64_imm(R1, 0x10), ldx_probe(DW, R0, R1, 0), exit()];
        assert_eq!(run(&insns), 0);
    }

    #[test]
    #[should_panic(expected = "invalid read")]
    fn test_plain_load_outside_regions_panics() {
        run(&[mov64_imm(R1, 0x10), ldx_mem(DW, R0, R1, 0), exit()]);
    }

    #[test]
    #[should_panic(expected = "unknown opcode")]
    fn test_unknown_opcode_panics() {
        run(&[Insn::new(0xff, 0, 0, 0, 0), exit()]);
    }

    #[test]
    fn test_atomics() {
        let insns = [
            st_mem(DW, R10, -8, 10),
            mov64_imm(R1, 5),
            atomic(DW, i32::from(ADD) | FETCH, R10, R1, -8),
            ldx_mem(DW, R0, R10, -8),
            alu64_reg(MUL, R0, R1),
            exit(),
        ];
        // old value 10 fetched into R1, memory holds 15.
        assert_eq!(run(&insns), 150);

        let insns = [
            st_mem(W, R10, -4, 3),
            mov64_imm(R0, 3),
            mov64_imm(R1, 9),
            atomic(W, CMPXCHG, R10, R1, -4),
            ldx_mem(W, R2, R10, -4),
            mov64_imm(R1, 1),
            atomic(W, XCHG, R10, R1, -4),
            alu64_reg(ADD, R0, R1),
            alu64_reg(ADD, R0, R2),
            exit(),
        ];
        // R0 = old 3, R1 = swapped-out 9, R2 = 9.
        assert_eq!(run(&insns), 21);
    }

    #[test]
    fn test_helper_receives_cookie() {
        let prog = Program::load(
            &[call_helper(helpers::HELPER_GET_ATTACH_COOKIE), exit()],
            ProgType::Unspec,
        )
        .unwrap();
        assert_eq!(interpreter().execute(&prog, 32, &mut [], 99), 99);
    }

    #[test]
    fn test_subprogram_call_preserves_callee_saved() {
        let insns = [
            mov64_imm(R6, 4),
            mov64_imm(R1, 10),
            call_pseudo(3),
            alu64_reg(ADD, R0, R6),
            exit(),
            exit(),
            // subprog at 6
            mov64_imm(R6, 100),
            st_mem(DW, R10, -8, 1),
            ldx_mem(DW, R7, R10, -8),
            mov64_reg(R0, R1),
            alu64_reg(ADD, R0, R7),
            exit(),
        ];
        let mut prog = Program::load(&insns, ProgType::Unspec).unwrap();
        prog.aux_mut().unwrap().subprogs = vec![Subprog {
            start: 6,
            stack_depth: 8,
        }];
        assert_eq!(interpreter().execute(&prog, 32, &mut [], 0), 15);
    }

    #[test]
    #[should_panic(expected = "invalid write")]
    fn test_root_frame_is_exactly_stack_size() {
        let prog = Program::load(
            &[st_mem(DW, R10, -32, 1), st_mem(DW, R10, -40, 1), exit()],
            ProgType::Unspec,
        )
        .unwrap();
        interpreter().execute(&prog, 32, &mut [], 0);
    }

    #[test]
    fn test_subprogram_frame_mapped_on_call() {
        let insns = [
            call_pseudo(2),
            alu64_imm(ADD, R0, 1),
            exit(),
            // subprog at 3
            st_mem(DW, R10, -512, 41),
            ldx_mem(DW, R0, R10, -512),
            exit(),
        ];
        let mut prog = Program::load(&insns, ProgType::Unspec).unwrap();
        prog.aux_mut().unwrap().subprogs = vec![Subprog {
            start: 3,
            stack_depth: 512,
        }];
        assert_eq!(interpreter().execute(&prog, 32, &mut [], 0), 42);
    }

    #[test]
    #[should_panic(expected = "call depth")]
    fn test_runaway_recursion_panics() {
        run(&[call_pseudo(-1), exit()]);
    }

    fn tail_target(value: i32) -> Arc<Program> {
        let mut prog = Program::load(&[mov64_imm(R0, value), exit()], ProgType::Unspec).unwrap();
        prog.lock_readonly().unwrap();
        Arc::new(prog)
    }

    #[test]
    fn test_tail_call_switches_or_falls_through() {
        let map = Arc::new(ProgArrayMap::new(1, 4));
        map.update(2, tail_target(77)).unwrap();
        let caller = |index: i32| {
            let mut insns = ld_map(R2, 0).to_vec();
            insns.extend([mov64_imm(R3, index), tail_call(), mov64_imm(R0, 1), exit()]);
            let prog = Program::load(&insns, ProgType::Unspec).unwrap();
            prog.aux().unwrap().add_used_map(Arc::clone(&map) as Arc<dyn Map>);
            interpreter().execute(&prog, MAX_STACK, &mut [], 0)
        };
        assert_eq!(caller(2), 77);
        assert_eq!(caller(1), 1);
        assert_eq!(caller(4), 1);
    }
}
