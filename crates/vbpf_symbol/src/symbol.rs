//! Symbol entries attributed to executable address ranges.

use core::fmt::{Display, Formatter, Result};

/// A named, end-inclusive address range.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SymbolEntry {
    pub name: String,
    pub start: u64,
    pub end: u64,
    /// Set for program images, clear for auxiliary prefix symbols.
    pub is_prog: bool,
    pub prog_id: Option<u32>,
}

impl SymbolEntry {
    pub fn program(name: impl Into<String>, start: u64, end: u64, prog_id: u32) -> Self {
        Self {
            name: name.into(),
            start,
            end,
            is_prog: true,
            prog_id: Some(prog_id),
        }
    }

    pub fn auxiliary(name: impl Into<String>, start: u64, end: u64) -> Self {
        Self {
            name: name.into(),
            start,
            end,
            is_prog: false,
            prog_id: None,
        }
    }

    /// Symbol name of a program image: `bpf_prog_<tag>` with an optional `_<name>` suffix.
    pub fn program_name(tag: &[u8; 8], name: &str) -> String {
        use core::fmt::Write;

        let mut out = String::with_capacity(9 + 16 + 1 + name.len());
        out.push_str("bpf_prog_");
        for byte in tag {
            let _ = write!(out, "{byte:02x}");
        }
        if !name.is_empty() {
            out.push('_');
            out.push_str(name);
        }
        out
    }

    #[inline]
    pub const fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr <= self.end
    }

    #[inline]
    pub const fn size(&self) -> u64 {
        self.end - self.start
    }

    #[inline]
    pub const fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start <= end && start <= self.end
    }
}

impl Display for SymbolEntry {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{:#018x}-{:#018x} {}", self.start, self.end, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_program_name() {
        let tag = [0xde, 0xad, 0xbe, 0xef, 0, 1, 2, 3];
        assert_eq!(
            SymbolEntry::program_name(&tag, "filter"),
            "bpf_prog_deadbeef00010203_filter"
        );
        assert_eq!(
            SymbolEntry::program_name(&tag, ""),
            "bpf_prog_deadbeef00010203"
        );
    }

    #[test]
    fn test_end_inclusive_contains() {
        let entry = SymbolEntry::auxiliary("bpf_prog_trampoline", 0x1000, 0x1040);
        assert!(entry.contains(0x1000));
        assert!(entry.contains(0x1040));
        assert!(!entry.contains(0x1041));
        assert!(!entry.contains(0x0fff));
    }
}
