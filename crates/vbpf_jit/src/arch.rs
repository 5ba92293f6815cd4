//! Architecture hooks used by the pack allocator.

#[cfg(any(target_arch = "x86_64", target_arch = "x86"))]
const TRAP: &[u8] = &[0xcc];
#[cfg(target_arch = "aarch64")]
const TRAP: &[u8] = &[0x00, 0x7d, 0x20, 0xd4];
#[cfg(not(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64")))]
const TRAP: &[u8] = &[0x00];

/// Operations on executable text that differ per architecture.
///
/// Text is written through a writable alias; `exec` is where the same bytes are fetched
/// as instructions.
pub trait ArchHooks: Send + Sync {
    /// Byte pattern that faults when executed.
    fn trap_pattern(&self) -> &'static [u8];

    fn fill_trap(&self, dst: &mut [u8]) {
        let pattern = self.trap_pattern();
        for (idx, byte) in dst.iter_mut().enumerate() {
            *byte = pattern[idx % pattern.len()];
        }
    }

    /// Makes instruction fetch at `exec..exec + len` observe bytes written through the alias.
    fn sync_text(&self, exec: usize, len: usize);

    /// Copies `src` into the alias `dst` backing `exec`.
    fn text_copy(&self, dst: &mut [u8], exec: usize, src: &[u8]) {
        dst.copy_from_slice(src);
        self.sync_text(exec, src.len());
    }

    /// Overwrites freed text with the trap pattern so stale branches fault.
    fn invalidate(&self, dst: &mut [u8], exec: usize) {
        self.fill_trap(dst);
        self.sync_text(exec, dst.len());
    }
}

/// Hooks for the architecture this process runs on.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostArch;

impl ArchHooks for HostArch {
    fn trap_pattern(&self) -> &'static [u8] {
        TRAP
    }

    #[cfg(target_arch = "aarch64")]
    fn sync_text(&self, exec: usize, len: usize) {
        unsafe extern "C" {
            fn __clear_cache(start: *mut libc::c_char, end: *mut libc::c_char);
        }
        // SAFETY: the range lies inside a live executable mapping.
        unsafe { __clear_cache(exec as *mut libc::c_char, (exec + len) as *mut libc::c_char) }
    }

    // Coherent instruction caches; ordering the alias stores is enough.
    #[cfg(not(target_arch = "aarch64"))]
    fn sync_text(&self, _exec: usize, _len: usize) {
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{DualMapping, PAGE_SIZE};

    #[test]
    fn test_fill_trap_repeats_pattern() {
        let mut buf = [0x55_u8; 9];
        HostArch.fill_trap(&mut buf);
        let pattern = HostArch.trap_pattern();
        for (idx, byte) in buf.iter().enumerate() {
            assert_eq!(*byte, pattern[idx % pattern.len()]);
        }
    }

    #[test]
    fn test_text_copy_and_invalidate_through_alias() {
        let mut text = DualMapping::new(PAGE_SIZE).unwrap();
        let exec = text.addr() + 100;
        HostArch.text_copy(text.alias_mut(100, 3), exec, &[1, 2, 3]);
        assert_eq!(&text.text()[100..103], &[1, 2, 3]);
        HostArch.invalidate(text.alias_mut(100, 3), exec);
        assert_eq!(text.text()[100], HostArch.trap_pattern()[0]);
    }
}
