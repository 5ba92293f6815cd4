//! Executable page-pack allocator.
//!
//! Small JIT images are carved out of large read-execute packs in fixed-size chunks
//! tracked by a bitmap. Requests larger than a pack get a dedicated mapping. Every
//! mapping has a separate writable alias kept private to the allocator, so text handed
//! out here is never writable; callers stage code in a shadow buffer and copy it in
//! through [`PackAllocator::text_copy`].

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};
use vbpf_config::PackConfig;

use crate::arch::{ArchHooks, HostArch};
use crate::platform::{DualMapping, PAGE_SIZE, round_up};
use crate::{JitError, Result};

/// A read-execute range returned by [`PackAllocator::alloc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodeRegion {
    addr: usize,
    len: usize,
}

impl CodeRegion {
    #[inline]
    pub const fn addr(&self) -> usize {
        self.addr
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub const fn end(&self) -> usize {
        self.addr + self.len
    }

    #[inline]
    pub const fn as_ptr(&self) -> *const u8 {
        self.addr as *const u8
    }
}

struct Pack {
    text: DualMapping,
    bitmap: Vec<u64>,
    used: usize,
}

impl Pack {
    #[inline]
    fn base(&self) -> usize {
        self.text.addr()
    }

    fn bit(&self, idx: usize) -> bool {
        self.bitmap[idx / 64] & (1 << (idx % 64)) != 0
    }

    fn all_set(&self, start: usize, count: usize) -> bool {
        start + count <= self.bitmap.len() * 64 && (start..start + count).all(|idx| self.bit(idx))
    }

    fn set_range(&mut self, start: usize, count: usize, value: bool) {
        for idx in start..start + count {
            let (word, mask) = (idx / 64, 1_u64 << (idx % 64));
            if value {
                self.bitmap[word] |= mask;
            } else {
                self.bitmap[word] &= !mask;
            }
        }
        if value {
            self.used += count;
        } else {
            self.used -= count;
        }
    }

    /// First run of `count` clear bits among the first `total`.
    fn find_zero_area(&self, total: usize, count: usize) -> Option<usize> {
        let mut start = 0;
        let mut run = 0;
        for idx in 0..total {
            if self.bit(idx) {
                start = idx + 1;
                run = 0;
            } else {
                run += 1;
                if run == count {
                    return Some(start);
                }
            }
        }
        None
    }
}

#[derive(Default)]
struct PackState {
    packs: Vec<Pack>,
    /// Oversized allocations keyed by executable address.
    dedicated: BTreeMap<usize, DualMapping>,
}

impl PackState {
    fn text_mut(&mut self, addr: usize) -> Option<&mut DualMapping> {
        if let Some(pack) = self.packs.iter_mut().find(|pack| pack.text.contains(addr)) {
            return Some(&mut pack.text);
        }
        self.dedicated
            .range_mut(..=addr)
            .next_back()
            .map(|(_, text)| text)
            .filter(|text| text.contains(addr))
    }
}

pub struct PackAllocator {
    arch: Arc<dyn ArchHooks>,
    pack_size: usize,
    chunk_size: usize,
    state: Mutex<PackState>,
}

impl PackAllocator {
    pub fn new(config: &PackConfig) -> Self {
        Self::with_arch(config, Arc::new(HostArch))
    }

    pub fn with_arch(config: &PackConfig, arch: Arc<dyn ArchHooks>) -> Self {
        Self {
            arch,
            pack_size: config.pack_size,
            chunk_size: config.chunk_size,
            state: Mutex::new(PackState::default()),
        }
    }

    #[inline]
    pub fn arch(&self) -> &dyn ArchHooks {
        &*self.arch
    }

    #[inline]
    pub const fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    #[inline]
    pub const fn pack_size(&self) -> usize {
        self.pack_size
    }

    #[inline]
    fn chunks_per_pack(&self) -> usize {
        self.pack_size / self.chunk_size
    }

    fn map_trapped(&self, len: usize) -> Result<DualMapping> {
        let mut text = DualMapping::new(len).map_err(|err| {
            if err.kind() == std::io::ErrorKind::OutOfMemory {
                JitError::OutOfMemory { size: len }
            } else {
                JitError::Protection(err)
            }
        })?;
        let addr = text.addr();
        self.arch.invalidate(text.alias_mut(0, len), addr);
        Ok(text)
    }

    /// Reserves `size` bytes of read-execute memory, rounded up to the chunk size.
    pub fn alloc(&self, size: usize) -> Result<CodeRegion> {
        let size = round_up(size.max(1), self.chunk_size);

        if size > self.pack_size {
            let len = round_up(size, PAGE_SIZE);
            let text = self.map_trapped(len)?;
            let addr = text.addr();
            self.state.lock().dedicated.insert(addr, text);
            debug!(addr, len, "dedicated executable mapping created");
            return Ok(CodeRegion { addr, len: size });
        }

        let count = size / self.chunk_size;
        let total = self.chunks_per_pack();
        let mut state = self.state.lock();

        for pack in &mut state.packs {
            if let Some(pos) = pack.find_zero_area(total, count) {
                pack.set_range(pos, count, true);
                return Ok(CodeRegion {
                    addr: pack.base() + pos * self.chunk_size,
                    len: size,
                });
            }
        }

        let mut pack = Pack {
            text: self.map_trapped(self.pack_size)?,
            bitmap: vec![0; total.div_ceil(64)],
            used: 0,
        };
        pack.set_range(0, count, true);
        let base = pack.base();
        state.packs.push(pack);
        debug!(
            base,
            pack_size = self.pack_size,
            packs = state.packs.len(),
            "executable pack created"
        );
        Ok(CodeRegion { addr: base, len: size })
    }

    /// Returns a region to its pack, unmapping the pack once it is empty.
    ///
    /// Freeing a region that is not currently allocated is logged and ignored.
    pub fn free(&self, region: CodeRegion) {
        let mut state = self.state.lock();

        if let Some(idx) = state
            .packs
            .iter()
            .position(|pack| pack.text.contains(region.addr))
        {
            let pack = &mut state.packs[idx];
            let offset = region.addr - pack.base();
            let (pos, count) = (offset / self.chunk_size, region.len / self.chunk_size);
            if !pack.all_set(pos, count) {
                warn!(
                    addr = region.addr,
                    len = region.len,
                    "free of text that is not allocated"
                );
                return;
            }
            self.arch
                .invalidate(pack.text.alias_mut(offset, region.len), region.addr);
            pack.set_range(pos, count, false);
            if pack.used == 0 {
                let pack = state.packs.swap_remove(idx);
                debug!(base = pack.base(), "executable pack released");
            }
            return;
        }

        if let Some(text) = state.dedicated.remove(&region.addr) {
            debug!(addr = region.addr, len = text.len(), "dedicated executable mapping released");
            return;
        }

        warn!(addr = region.addr, len = region.len, "free of address no pack owns");
    }

    /// Copies `bytes` to `region.addr() + offset` through the writable alias.
    pub fn text_copy(&self, region: CodeRegion, offset: usize, bytes: &[u8]) -> Result<()> {
        assert!(
            offset + bytes.len() <= region.len,
            "text copy past the end of its region"
        );
        let exec = region.addr + offset;
        let mut state = self.state.lock();
        let text = state
            .text_mut(region.addr)
            .ok_or(JitError::UnknownRegion { addr: region.addr })?;
        let at = exec - text.addr();
        self.arch.text_copy(text.alias_mut(at, bytes.len()), exec, bytes);
        Ok(())
    }

    pub fn pack_count(&self) -> usize {
        self.state.lock().packs.len()
    }

    pub fn dedicated_count(&self) -> usize {
        self.state.lock().dedicated.len()
    }

    /// Number of chunks currently handed out across all packs.
    pub fn live_chunks(&self) -> usize {
        self.state.lock().packs.iter().map(|pack| pack.used).sum()
    }

    pub fn owns(&self, addr: usize) -> bool {
        self.state.lock().text_mut(addr).is_some()
    }
}

impl Drop for PackAllocator {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.packs.is_empty() || !state.dedicated.is_empty() {
            debug!(
                packs = state.packs.len(),
                dedicated = state.dedicated.len(),
                "releasing executable memory still held at teardown"
            );
        }
    }
}
