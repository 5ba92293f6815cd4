//! Host page mapping primitives.
//!
//! JIT text lives in a shared memory object mapped twice: read-execute where code runs
//! and read-write where the allocator writes it. Neither view is ever writable and
//! executable at once, and the executable view never changes protection.

use std::fs::File;
use std::io;

use memmap2::{Mmap, MmapMut, MmapOptions};

pub const PAGE_SIZE: usize = 4096;

#[inline]
pub const fn round_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn shared_object(len: usize) -> io::Result<File> {
    use std::os::fd::FromRawFd;

    // SAFETY: the name is NUL terminated and the flags are valid for memfd_create.
    let fd = unsafe { libc::memfd_create(c"vbpf-text".as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `fd` was just created and nothing else owns it.
    let file = unsafe { File::from_raw_fd(fd) };
    file.set_len(len as u64)?;
    Ok(file)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn shared_object(len: usize) -> io::Result<File> {
    let file = tempfile::tempfile()?;
    file.set_len(len as u64)?;
    Ok(file)
}

/// Executable text plus a writable alias of the same pages.
#[derive(Debug)]
pub struct DualMapping {
    exec: Mmap,
    write: MmapMut,
}

impl DualMapping {
    /// Maps `len` bytes (a multiple of [`PAGE_SIZE`]) twice over one zeroed object.
    pub fn new(len: usize) -> io::Result<Self> {
        let file = shared_object(len)?;
        // SAFETY: the object is private to this pair of mappings and is never resized.
        let write = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        // SAFETY: as above.
        let exec = unsafe { MmapOptions::new().len(len).map_exec(&file)? };
        Ok(Self { exec, write })
    }

    /// Address of the executable view.
    #[inline]
    pub fn addr(&self) -> usize {
        self.exec.as_ptr() as usize
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.exec.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.exec.is_empty()
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.addr() && addr < self.addr() + self.len()
    }

    /// Read-only view of the executable text.
    #[inline]
    pub fn text(&self) -> &[u8] {
        &self.exec
    }

    /// Writable alias of `offset..offset + len` of the executable view.
    #[inline]
    pub fn alias_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        &mut self.write[offset..offset + len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(1, 64), 64);
        assert_eq!(round_up(64, 64), 64);
        assert_eq!(round_up(PAGE_SIZE + 1, PAGE_SIZE), 2 * PAGE_SIZE);
    }

    #[test]
    fn test_alias_writes_show_in_exec_view() {
        let mut text = DualMapping::new(2 * PAGE_SIZE).unwrap();
        assert_eq!(text.len(), 2 * PAGE_SIZE);
        assert!(text.text().iter().all(|&byte| byte == 0));
        text.alias_mut(PAGE_SIZE - 2, 4).copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(&text.text()[PAGE_SIZE - 2..PAGE_SIZE + 2], &[1, 2, 3, 4]);
        assert!(text.contains(text.addr() + PAGE_SIZE));
        assert!(!text.contains(text.addr() + 2 * PAGE_SIZE));
    }
}
