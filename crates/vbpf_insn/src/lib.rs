//! Fixed-width instruction encoding shared by the interpreter, the patcher and the
//! constant blinder.

pub mod disasm;
pub mod insn;
pub mod opcode;

pub use disasm::disassemble;
pub use insn::*;

/// Register index, 0..=11.
pub type Reg = u8;

pub const R0: Reg = 0;
pub const R1: Reg = 1;
pub const R2: Reg = 2;
pub const R3: Reg = 3;
pub const R4: Reg = 4;
pub const R5: Reg = 5;
pub const R6: Reg = 6;
pub const R7: Reg = 7;
pub const R8: Reg = 8;
pub const R9: Reg = 9;
/// Read-only frame pointer.
pub const R10: Reg = 10;
/// Scratch register reserved for runtime rewrites; never produced by the loader.
pub const AX: Reg = 11;

pub const REG_COUNT: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("empty instruction stream")]
    Empty,

    #[error("stream of {len} bytes ends with {trailing} bytes of a partial instruction")]
    TrailingBytes { len: usize, trailing: usize },
}
