//! vbpf: an in-process runtime for sandboxed register-machine bytecode.
//!
//! The pieces live in the `crates/` members and are re-exported here:
//! instruction encoding, the executable pack allocator, the symbol directory and the
//! program runtime.

pub mod cli;

pub use vbpf_config as config;
pub use vbpf_insn as insn;
pub use vbpf_jit as jit;
pub use vbpf_runtime as runtime;
pub use vbpf_symbol as symbol;

pub use vbpf_config::RuntimeConfig;
pub use vbpf_runtime::{
    Entry, ProgArray, ProgArrayCell, ProgArrayMap, ProgType, Program, Result, Runtime,
    RuntimeError,
};
