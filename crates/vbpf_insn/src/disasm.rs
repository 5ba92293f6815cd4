use std::fmt;

use crate::insn::Insn;
use crate::opcode::*;

fn alu_name(o: u8) -> &'static str {
    match o {
        ADD => "add",
        SUB => "sub",
        MUL => "mul",
        DIV => "div",
        OR => "or",
        AND => "and",
        LSH => "lsh",
        RSH => "rsh",
        NEG => "neg",
        MOD => "mod",
        XOR => "xor",
        MOV => "mov",
        ARSH => "arsh",
        END => "end",
        _ => "alu?",
    }
}

fn jmp_name(o: u8) -> &'static str {
    match o {
        JA => "ja",
        JEQ => "jeq",
        JGT => "jgt",
        JGE => "jge",
        JSET => "jset",
        JNE => "jne",
        JSGT => "jsgt",
        JSGE => "jsge",
        CALL => "call",
        EXIT => "exit",
        JLT => "jlt",
        JLE => "jle",
        JSLT => "jslt",
        JSLE => "jsle",
        TAIL_CALL => "tail_call",
        _ => "jmp?",
    }
}

fn size_name(code: u8) -> &'static str {
    match size(code) {
        W => "w",
        H => "h",
        B => "b",
        _ => "dw",
    }
}

fn atomic_name(imm: i32) -> &'static str {
    match imm {
        XCHG => "xchg",
        CMPXCHG => "cmpxchg",
        _ => match (imm & !FETCH) as u8 {
            ADD => "add",
            OR => "or",
            AND => "and",
            XOR => "xor",
            _ => "atomic?",
        },
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (dst, src, code) = (self.dst(), self.src(), self.code);
        match class(code) {
            ALU | ALU64 => {
                let width = if class(code) == ALU64 { 64 } else { 32 };
                let name = alu_name(op(code));
                match op(code) {
                    NEG => write!(f, "{name}{width} r{dst}"),
                    END if class(code) == ALU64 => write!(f, "bswap{} r{dst}", self.imm),
                    END => {
                        let order = if source(code) == TO_BE { "be" } else { "le" };
                        write!(f, "{order}{} r{dst}", self.imm)
                    }
                    _ if source(code) == X => {
                        let sign = if self.off != 0 && matches!(op(code), DIV | MOD) {
                            "s"
                        } else {
                            ""
                        };
                        if op(code) == MOV && self.off != 0 {
                            write!(f, "movsx{width}_{} r{dst}, r{src}", self.off)
                        } else {
                            write!(f, "{sign}{name}{width} r{dst}, r{src}")
                        }
                    }
                    _ => write!(f, "{name}{width} r{dst}, {}", self.imm),
                }
            }
            JMP | JMP32 => {
                let suffix = if class(code) == JMP32 { "32" } else { "" };
                let name = jmp_name(op(code));
                match op(code) {
                    JA if class(code) == JMP32 => write!(f, "ja32 {:+}", self.imm),
                    JA => write!(f, "ja {:+}", self.off),
                    EXIT => f.write_str("exit"),
                    TAIL_CALL => f.write_str("tail_call"),
                    CALL if src == PSEUDO_CALL => write!(f, "call pc{:+}", self.imm),
                    CALL => write!(f, "call #{}", self.imm),
                    _ if source(code) == X => {
                        write!(f, "{name}{suffix} r{dst}, r{src}, {:+}", self.off)
                    }
                    _ => write!(f, "{name}{suffix} r{dst}, {}, {:+}", self.imm, self.off),
                }
            }
            LD if self.is_pseudo_func() => write!(f, "lddw r{dst}, func pc{:+}", self.imm),
            LD => write!(f, "lddw r{dst}, lo {:#x}", self.imm as u32),
            LDX => {
                let kind = match mode(code) {
                    MEMSX => "ldxs",
                    PROBE_MEM => "ldx_probe",
                    PROBE_MEMSX => "ldxs_probe",
                    _ => "ldx",
                };
                write!(
                    f,
                    "{kind}{} r{dst}, [r{src}{:+}]",
                    size_name(code),
                    self.off
                )
            }
            ST if mode(code) == NOSPEC => f.write_str("nospec"),
            ST => write!(
                f,
                "st{} [r{dst}{:+}], {}",
                size_name(code),
                self.off,
                self.imm
            ),
            STX if mode(code) == ATOMIC => {
                let fetch = if self.imm & FETCH != 0 && !matches!(self.imm, XCHG | CMPXCHG) {
                    "_fetch"
                } else {
                    ""
                };
                write!(
                    f,
                    "atomic{} {}{fetch} [r{dst}{:+}], r{src}",
                    size_name(code),
                    atomic_name(self.imm),
                    self.off
                )
            }
            STX => write!(
                f,
                "stx{} [r{dst}{:+}], r{src}",
                size_name(code),
                self.off
            ),
            _ => write!(f, "<unknown {code:#04x}>"),
        }
    }
}

/// Renders a stream, folding both halves of a 64-bit immediate load into one line.
pub fn disassemble(insns: &[Insn]) -> Vec<String> {
    let mut lines = Vec::with_capacity(insns.len());
    let mut idx = 0;
    while idx < insns.len() {
        let insn = insns[idx];
        if insn.is_ld_imm64() && !insn.is_pseudo_func() && idx + 1 < insns.len() {
            let value = u64::from(insn.imm as u32) | (u64::from(insns[idx + 1].imm as u32) << 32);
            lines.push(format!("{idx:4}: lddw r{}, {value:#x}", insn.dst()));
            idx += 2;
            continue;
        }
        lines.push(format!("{idx:4}: {insn}"));
        idx += 1;
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insn::*;

    #[test]
    fn test_display() {
        assert_eq!(alu64_imm(ADD, 1, 5).to_string(), "add64 r1, 5");
        assert_eq!(alu32_reg(XOR, 2, 3).to_string(), "xor32 r2, r3");
        assert_eq!(jmp_imm(JEQ, 1, 0, -2).to_string(), "jeq r1, 0, -2");
        assert_eq!(ldx_mem(DW, 0, 10, -8).to_string(), "ldxdw r0, [r10-8]");
        assert_eq!(call_helper(3).to_string(), "call #3");
        assert_eq!(exit().to_string(), "exit");
    }

    #[test]
    fn test_disassemble_folds_wide_loads() {
        let [lo, hi] = ld_imm64(1, 0xdead_beef_0000_0001);
        let lines = disassemble(&[lo, hi, exit()]);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("lddw r1, 0xdeadbeef00000001"));
        assert!(lines[1].starts_with("   2:"));
    }
}
