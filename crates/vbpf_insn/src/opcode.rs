//! Opcode byte layout.
//!
//! The low three bits select the instruction class. For arithmetic and jump classes the
//! high nibble is the operation and bit 3 the operand source; for load/store classes
//! bits 3-4 are the access size and the top three bits the addressing mode.

// Classes
pub const LD: u8 = 0x00;
pub const LDX: u8 = 0x01;
pub const ST: u8 = 0x02;
pub const STX: u8 = 0x03;
pub const ALU: u8 = 0x04;
pub const JMP: u8 = 0x05;
pub const JMP32: u8 = 0x06;
pub const ALU64: u8 = 0x07;

// Sizes
pub const W: u8 = 0x00;
pub const H: u8 = 0x08;
pub const B: u8 = 0x10;
pub const DW: u8 = 0x18;

// Modes
pub const IMM: u8 = 0x00;
pub const MEM: u8 = 0x60;
pub const MEMSX: u8 = 0x80;
pub const ATOMIC: u8 = 0xc0;
/// Fault-tolerant load, rewritten in by the loader for untrusted pointers.
pub const PROBE_MEM: u8 = 0x20;
pub const PROBE_MEMSX: u8 = 0x40;
/// Speculation barrier, only valid with the `ST` class.
pub const NOSPEC: u8 = 0xc0;

// Sources
pub const K: u8 = 0x00;
pub const X: u8 = 0x08;

// Arithmetic operations
pub const ADD: u8 = 0x00;
pub const SUB: u8 = 0x10;
pub const MUL: u8 = 0x20;
pub const DIV: u8 = 0x30;
pub const OR: u8 = 0x40;
pub const AND: u8 = 0x50;
pub const LSH: u8 = 0x60;
pub const RSH: u8 = 0x70;
pub const NEG: u8 = 0x80;
pub const MOD: u8 = 0x90;
pub const XOR: u8 = 0xa0;
pub const MOV: u8 = 0xb0;
pub const ARSH: u8 = 0xc0;
pub const END: u8 = 0xd0;

pub const TO_LE: u8 = 0x00;
pub const TO_BE: u8 = 0x08;

// Jump operations
pub const JA: u8 = 0x00;
pub const JEQ: u8 = 0x10;
pub const JGT: u8 = 0x20;
pub const JGE: u8 = 0x30;
pub const JSET: u8 = 0x40;
pub const JNE: u8 = 0x50;
pub const JSGT: u8 = 0x60;
pub const JSGE: u8 = 0x70;
pub const CALL: u8 = 0x80;
pub const EXIT: u8 = 0x90;
pub const JLT: u8 = 0xa0;
pub const JLE: u8 = 0xb0;
pub const JSLT: u8 = 0xc0;
pub const JSLE: u8 = 0xd0;
/// Runtime-internal: bounded jump into another program of a program-holding map.
pub const TAIL_CALL: u8 = 0xf0;

// Atomic operations, carried in the immediate of `STX|ATOMIC`
pub const FETCH: i32 = 0x01;
pub const XCHG: i32 = 0xe0 | FETCH;
pub const CMPXCHG: i32 = 0xf0 | FETCH;

// Source register markers
pub const PSEUDO_CALL: u8 = 1;
pub const PSEUDO_FUNC: u8 = 4;

#[inline]
pub const fn class(code: u8) -> u8 {
    code & 0x07
}

#[inline]
pub const fn op(code: u8) -> u8 {
    code & 0xf0
}

#[inline]
pub const fn source(code: u8) -> u8 {
    code & 0x08
}

#[inline]
pub const fn size(code: u8) -> u8 {
    code & 0x18
}

#[inline]
pub const fn mode(code: u8) -> u8 {
    code & 0xe0
}

#[inline]
pub const fn size_bytes(code: u8) -> usize {
    match size(code) {
        W => 4,
        H => 2,
        B => 1,
        _ => 8,
    }
}

#[inline]
pub const fn is_alu(code: u8) -> bool {
    matches!(class(code), ALU | ALU64)
}

#[inline]
pub const fn is_jmp(code: u8) -> bool {
    matches!(class(code), JMP | JMP32)
}

const fn is_cond_jump(o: u8) -> bool {
    matches!(
        o,
        JEQ | JGT | JGE | JSET | JNE | JSGT | JSGE | JLT | JLE | JSLT | JSLE
    )
}

/// Whether `code` has an entry in the interpreter's dispatch table.
pub const fn is_known_opcode(code: u8) -> bool {
    let o = op(code);
    match class(code) {
        ALU | ALU64 => match o {
            NEG => source(code) == K,
            END => class(code) == ALU || source(code) == TO_LE,
            ADD | SUB | MUL | DIV | OR | AND | LSH | RSH | MOD | XOR | MOV | ARSH => true,
            _ => false,
        },
        JMP => match o {
            JA | CALL | EXIT | TAIL_CALL => source(code) == K,
            _ => is_cond_jump(o),
        },
        JMP32 => match o {
            JA => source(code) == K,
            _ => is_cond_jump(o),
        },
        LD => code == LD | DW | IMM,
        LDX => match mode(code) {
            MEM | PROBE_MEM => true,
            MEMSX | PROBE_MEMSX => size(code) != DW,
            _ => false,
        },
        ST => match mode(code) {
            MEM => true,
            NOSPEC => size(code) == W,
            _ => false,
        },
        STX => match mode(code) {
            MEM => true,
            ATOMIC => matches!(size(code), W | DW),
            _ => false,
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_opcodes() {
        assert!(is_known_opcode(ALU64 | ADD | K));
        assert!(is_known_opcode(JMP | EXIT));
        assert!(is_known_opcode(JMP | TAIL_CALL));
        assert!(is_known_opcode(LD | DW | IMM));
        assert!(is_known_opcode(ST | NOSPEC));
        assert!(is_known_opcode(LDX | PROBE_MEM | DW));
    }

    #[test]
    fn test_unknown_opcodes() {
        assert!(!is_known_opcode(0xff));
        assert!(!is_known_opcode(ALU64 | END | TO_BE));
        assert!(!is_known_opcode(ALU | NEG | X));
        assert!(!is_known_opcode(JMP32 | CALL));
        assert!(!is_known_opcode(LDX | MEMSX | DW));
        assert!(!is_known_opcode(LD | W | IMM));
    }
}
