use std::sync::Arc;

use vbpf::config::InterpreterConfig;
use vbpf::insn::opcode::{ADD, DW, JGT, XOR};
use vbpf::insn::{
    AX, Insn, R0, R1, R2, R10, alu64_imm, alu64_reg, exit, jmp_imm, ld_imm64, ldx_mem,
    mov64_imm, st_mem,
};
use vbpf::jit::HashRandom;
use vbpf::runtime::interp::{HelperTable, Interpreter};
use vbpf::runtime::blind;
use vbpf::{ProgType, Program};

fn source() -> Vec<Insn> {
    let mut insns = vec![mov64_imm(R0, 3)];
    insns.extend(ld_imm64(R1, 0x1122_3344_5566_7788));
    insns.extend([
        st_mem(DW, R10, -8, 0x55),
        ldx_mem(DW, R2, R10, -8),
        alu64_reg(ADD, R0, R2),
        jmp_imm(JGT, R0, 50, 1),
        mov64_imm(R0, 0),
        alu64_reg(XOR, R0, R1),
        alu64_imm(ADD, R0, 0x0bad_f00d),
        exit(),
    ]);
    insns
}

fn execute(prog: &Program) -> u64 {
    Interpreter::new(
        &InterpreterConfig::default(),
        Arc::new(HelperTable::default()),
    )
    .execute(prog, 32, &mut [], 0)
}

#[test]
fn test_blinded_program_is_equivalent() {
    let mut original = Program::load(&source(), ProgType::SocketFilter).unwrap();
    original.set_stack_depth(8);
    original.request_blinding();
    let expected = execute(&original);
    assert_eq!(expected, (88 ^ 0x1122_3344_5566_7788) + 0x0bad_f00d);

    let rng = HashRandom::new();
    for _ in 0..8 {
        let mut prog = Program::load(&source(), ProgType::SocketFilter).unwrap();
        prog.request_blinding();
        let blinded = blind(&mut prog, &rng).unwrap().unwrap();
        assert_eq!(execute(&blinded), expected);
        assert!(blinded.insns().iter().any(|insn| insn.dst() == AX));
        for literal in [0x55, 0x0bad_f00d, 0x5566_7788, 0x1122_3344] {
            assert!(blinded.insns().iter().all(|insn| insn.imm != literal));
        }
    }
}

#[test]
fn test_blinding_is_idempotent() {
    let rng = HashRandom::new();
    let mut prog = Program::load(&source(), ProgType::SocketFilter).unwrap();
    prog.aux_mut().unwrap().name = "hardened".to_string();
    prog.request_blinding();

    let mut blinded = blind(&mut prog, &rng).unwrap().unwrap();
    assert!(blinded.is_blinded());
    assert_eq!(blinded.name(), "hardened");
    assert!(prog.aux().is_none());

    let before = blinded.insns().to_vec();
    assert!(blind(&mut blinded, &rng).unwrap().is_none());
    assert_eq!(blinded.insns(), before.as_slice());
}
