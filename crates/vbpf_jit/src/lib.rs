//! Executable memory for JIT output: pack allocation, image staging and accounting.

pub mod arch;
pub mod binary;
pub mod budget;
pub mod pack;
pub mod platform;
pub mod random;

pub use arch::{ArchHooks, HostArch};
pub use binary::{JitBinary, JitImage};
pub use budget::JitBudget;
pub use pack::{CodeRegion, PackAllocator};
pub use random::{HashRandom, RandomSource};

#[derive(Debug, thiserror::Error)]
pub enum JitError {
    #[error("cannot map {size} bytes of executable memory")]
    OutOfMemory { size: usize },

    #[error("cannot map executable text: {0}")]
    Protection(#[from] std::io::Error),

    #[error("no executable mapping contains {addr:#x}")]
    UnknownRegion { addr: usize },

    #[error("JIT budget exceeded: {requested} bytes requested, {used} of {limit} in use")]
    BudgetExceeded {
        requested: usize,
        used: usize,
        limit: usize,
    },
}

pub type Result<T> = std::result::Result<T, JitError>;
