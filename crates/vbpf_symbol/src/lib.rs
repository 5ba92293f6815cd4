pub mod registry;
pub mod symbol;

pub use registry::SymbolDirectory;
pub use symbol::SymbolEntry;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SymbolError {
    #[error("symbol {name} overlaps existing symbol {existing}")]
    Overlap { name: String, existing: String },

    #[error("no symbol starts at {start:#x}")]
    Unknown { start: u64 },

    #[error("symbol range {start:#x}..={end:#x} is empty")]
    EmptyRange { start: u64, end: u64 },
}

pub type Result<T> = std::result::Result<T, SymbolError>;
