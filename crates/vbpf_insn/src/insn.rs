use serde::{Deserialize, Serialize};

use crate::opcode::*;
use crate::{DecodeError, Reg};

/// Size in bytes of one encoded instruction.
pub const INSN_SIZE: usize = 8;

/// Upper 32 bits of every map handle loaded with [`ld_map`]; the low bits carry the index
/// into the program's resource list.
pub const MAP_HANDLE_BASE: u64 = 0x5f4d_4150_0000_0000;

/// A fixed-width instruction.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Insn {
    pub code: u8,
    /// Destination register in the low nibble, source register in the high nibble.
    pub regs: u8,
    pub off: i16,
    pub imm: i32,
}

impl Insn {
    #[inline]
    pub const fn new(code: u8, dst: Reg, src: Reg, off: i16, imm: i32) -> Self {
        Self {
            code,
            regs: (dst & 0x0f) | (src << 4),
            off,
            imm,
        }
    }

    #[inline]
    pub const fn dst(&self) -> Reg {
        self.regs & 0x0f
    }

    #[inline]
    pub const fn src(&self) -> Reg {
        self.regs >> 4
    }

    #[inline]
    pub fn set_dst(&mut self, dst: Reg) {
        self.regs = (self.regs & 0xf0) | (dst & 0x0f);
    }

    #[inline]
    pub fn set_src(&mut self, src: Reg) {
        self.regs = (self.regs & 0x0f) | (src << 4);
    }

    #[inline]
    pub const fn class(&self) -> u8 {
        class(self.code)
    }

    /// First half of a two-slot 64-bit immediate load.
    #[inline]
    pub const fn is_ld_imm64(&self) -> bool {
        self.code == LD | DW | IMM
    }

    /// Program-local call whose immediate is a relative instruction offset.
    #[inline]
    pub const fn is_pseudo_call(&self) -> bool {
        self.code == JMP | CALL && self.src() == PSEUDO_CALL
    }

    /// 64-bit load of a sub-program address, relative to the next instruction.
    #[inline]
    pub const fn is_pseudo_func(&self) -> bool {
        self.is_ld_imm64() && self.src() == PSEUDO_FUNC
    }

    /// Helper call dispatched by immediate id.
    #[inline]
    pub const fn is_helper_call(&self) -> bool {
        self.code == JMP | CALL && self.src() == 0
    }

    pub const fn to_bytes(self) -> [u8; INSN_SIZE] {
        let off = self.off.to_le_bytes();
        let imm = self.imm.to_le_bytes();
        [
            self.code, self.regs, off[0], off[1], imm[0], imm[1], imm[2], imm[3],
        ]
    }

    pub const fn from_bytes(bytes: [u8; INSN_SIZE]) -> Self {
        Self {
            code: bytes[0],
            regs: bytes[1],
            off: i16::from_le_bytes([bytes[2], bytes[3]]),
            imm: i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }
}

/// Decodes a little-endian instruction stream.
pub fn decode_stream(bytes: &[u8]) -> Result<Vec<Insn>, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    if bytes.len() % INSN_SIZE != 0 {
        return Err(DecodeError::TrailingBytes {
            len: bytes.len(),
            trailing: bytes.len() % INSN_SIZE,
        });
    }
    let mut insns = Vec::with_capacity(bytes.len() / INSN_SIZE);
    for chunk in bytes.chunks_exact(INSN_SIZE) {
        let mut raw = [0_u8; INSN_SIZE];
        raw.copy_from_slice(chunk);
        insns.push(Insn::from_bytes(raw));
    }
    Ok(insns)
}

pub fn encode_stream(insns: &[Insn]) -> Vec<u8> {
    insns.iter().flat_map(|insn| insn.to_bytes()).collect()
}

// Builders

#[inline]
pub const fn alu64_imm(op: u8, dst: Reg, imm: i32) -> Insn {
    Insn::new(ALU64 | op | K, dst, 0, 0, imm)
}

#[inline]
pub const fn alu64_reg(op: u8, dst: Reg, src: Reg) -> Insn {
    Insn::new(ALU64 | op | X, dst, src, 0, 0)
}

#[inline]
pub const fn alu32_imm(op: u8, dst: Reg, imm: i32) -> Insn {
    Insn::new(ALU | op | K, dst, 0, 0, imm)
}

#[inline]
pub const fn alu32_reg(op: u8, dst: Reg, src: Reg) -> Insn {
    Insn::new(ALU | op | X, dst, src, 0, 0)
}

#[inline]
pub const fn mov64_imm(dst: Reg, imm: i32) -> Insn {
    alu64_imm(MOV, dst, imm)
}

#[inline]
pub const fn mov64_reg(dst: Reg, src: Reg) -> Insn {
    alu64_reg(MOV, dst, src)
}

#[inline]
pub const fn mov32_imm(dst: Reg, imm: i32) -> Insn {
    alu32_imm(MOV, dst, imm)
}

#[inline]
pub const fn mov32_reg(dst: Reg, src: Reg) -> Insn {
    alu32_reg(MOV, dst, src)
}

/// Signed 64-bit division (`off == 1` selects the signed variant).
#[inline]
pub const fn sdiv64_reg(dst: Reg, src: Reg) -> Insn {
    Insn::new(ALU64 | DIV | X, dst, src, 1, 0)
}

#[inline]
pub const fn smod64_reg(dst: Reg, src: Reg) -> Insn {
    Insn::new(ALU64 | MOD | X, dst, src, 1, 0)
}

/// Sign-extending move from the low `bits` (8, 16 or 32) of `src`.
#[inline]
pub const fn movsx64_reg(dst: Reg, src: Reg, bits: i16) -> Insn {
    Insn::new(ALU64 | MOV | X, dst, src, bits, 0)
}

#[inline]
pub const fn endian(class: u8, order: u8, dst: Reg, bits: i32) -> Insn {
    Insn::new(class | END | order, dst, 0, 0, bits)
}

#[inline]
pub const fn ja(off: i16) -> Insn {
    Insn::new(JMP | JA, 0, 0, off, 0)
}

/// Unconditional jump with a 32-bit offset carried in the immediate.
#[inline]
pub const fn ja32(off: i32) -> Insn {
    Insn::new(JMP32 | JA, 0, 0, 0, off)
}

#[inline]
pub const fn jmp_imm(op: u8, dst: Reg, imm: i32, off: i16) -> Insn {
    Insn::new(JMP | op | K, dst, 0, off, imm)
}

#[inline]
pub const fn jmp_reg(op: u8, dst: Reg, src: Reg, off: i16) -> Insn {
    Insn::new(JMP | op | X, dst, src, off, 0)
}

#[inline]
pub const fn jmp32_imm(op: u8, dst: Reg, imm: i32, off: i16) -> Insn {
    Insn::new(JMP32 | op | K, dst, 0, off, imm)
}

#[inline]
pub const fn jmp32_reg(op: u8, dst: Reg, src: Reg, off: i16) -> Insn {
    Insn::new(JMP32 | op | X, dst, src, off, 0)
}

#[inline]
pub const fn call_helper(id: i32) -> Insn {
    Insn::new(JMP | CALL, 0, 0, 0, id)
}

/// Call of the sub-program starting `rel + 1` instructions after this one.
#[inline]
pub const fn call_pseudo(rel: i32) -> Insn {
    Insn::new(JMP | CALL, 0, PSEUDO_CALL, 0, rel)
}

#[inline]
pub const fn tail_call() -> Insn {
    Insn::new(JMP | TAIL_CALL, 0, 0, 0, 0)
}

#[inline]
pub const fn exit() -> Insn {
    Insn::new(JMP | EXIT, 0, 0, 0, 0)
}

#[inline]
pub const fn ld_imm64_raw(dst: Reg, src: Reg, value: u64) -> [Insn; 2] {
    [
        Insn::new(LD | DW | IMM, dst, src, 0, value as u32 as i32),
        Insn::new(0, 0, 0, 0, (value >> 32) as u32 as i32),
    ]
}

#[inline]
pub const fn ld_imm64(dst: Reg, value: u64) -> [Insn; 2] {
    ld_imm64_raw(dst, 0, value)
}

/// Loads the handle of entry `index` of the program's resource list.
#[inline]
pub const fn ld_map(dst: Reg, index: u32) -> [Insn; 2] {
    ld_imm64(dst, MAP_HANDLE_BASE | index as u64)
}

/// Loads the address of the sub-program starting `rel + 1` instructions after this one.
#[inline]
pub const fn ld_func(dst: Reg, rel: i32) -> [Insn; 2] {
    [
        Insn::new(LD | DW | IMM, dst, PSEUDO_FUNC, 0, rel),
        Insn::new(0, 0, 0, 0, 0),
    ]
}

#[inline]
pub const fn ldx_mem(size: u8, dst: Reg, src: Reg, off: i16) -> Insn {
    Insn::new(LDX | MEM | size, dst, src, off, 0)
}

#[inline]
pub const fn ldx_memsx(size: u8, dst: Reg, src: Reg, off: i16) -> Insn {
    Insn::new(LDX | MEMSX | size, dst, src, off, 0)
}

#[inline]
pub const fn ldx_probe(size: u8, dst: Reg, src: Reg, off: i16) -> Insn {
    Insn::new(LDX | PROBE_MEM | size, dst, src, off, 0)
}

#[inline]
pub const fn stx_mem(size: u8, dst: Reg, src: Reg, off: i16) -> Insn {
    Insn::new(STX | MEM | size, dst, src, off, 0)
}

#[inline]
pub const fn st_mem(size: u8, dst: Reg, off: i16, imm: i32) -> Insn {
    Insn::new(ST | MEM | size, dst, 0, off, imm)
}

#[inline]
pub const fn atomic(size: u8, op: i32, dst: Reg, src: Reg, off: i16) -> Insn {
    Insn::new(STX | ATOMIC | size, dst, src, off, op)
}

#[inline]
pub const fn nospec() -> Insn {
    Insn::new(ST | NOSPEC, 0, 0, 0, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{R1, R2, R10};

    #[test]
    fn test_register_nibbles() {
        let mut insn = alu64_reg(ADD, R1, R10);
        assert_eq!(insn.dst(), R1);
        assert_eq!(insn.src(), R10);
        insn.set_src(R2);
        insn.set_dst(R10);
        assert_eq!((insn.dst(), insn.src()), (R10, R2));
    }

    #[test]
    fn test_wire_layout() {
        let insn = jmp_imm(JEQ, R1, -2, -3);
        assert_eq!(
            insn.to_bytes(),
            [0x15, 0x01, 0xfd, 0xff, 0xfe, 0xff, 0xff, 0xff]
        );
        assert_eq!(Insn::from_bytes(insn.to_bytes()), insn);
    }

    #[test]
    fn test_decode_stream_rejects_partial_instruction() {
        let mut bytes = encode_stream(&[mov64_imm(0, 1), exit()]);
        assert_eq!(decode_stream(&bytes).map(|v| v.len()), Ok(2));
        bytes.push(0);
        assert_eq!(
            decode_stream(&bytes),
            Err(DecodeError::TrailingBytes {
                len: 17,
                trailing: 1
            })
        );
        assert_eq!(decode_stream(&[]), Err(DecodeError::Empty));
    }

    #[test]
    fn test_ld_imm64_halves() {
        let [lo, hi] = ld_imm64(R1, 0x1122_3344_5566_7788);
        assert!(lo.is_ld_imm64());
        assert_eq!(lo.imm as u32, 0x5566_7788);
        assert_eq!(hi.imm as u32, 0x1122_3344);
        assert_eq!(hi.code, 0);

        let [map, _] = ld_map(R2, 3);
        assert_eq!(map.imm, 3);
        assert!(!map.is_pseudo_func());
        assert!(ld_func(R2, 4)[0].is_pseudo_func());
    }

    #[test]
    fn test_call_kinds() {
        assert!(call_helper(7).is_helper_call());
        assert!(call_pseudo(3).is_pseudo_call());
        assert!(!call_pseudo(3).is_helper_call());
    }
}
