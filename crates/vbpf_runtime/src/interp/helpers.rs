//! Helper functions callable from programs by id.

use std::time::Instant;

use ahash::AHashMap;
use once_cell::sync::Lazy;

use super::memory::Memory;

pub const HELPER_KTIME_GET_NS: i32 = 5;
pub const HELPER_PROBE_READ: i32 = 113;
pub const HELPER_GET_ATTACH_COOKIE: i32 = 174;

const EFAULT: u64 = -14_i64 as u64;

static START: Lazy<Instant> = Lazy::new(Instant::now);

/// What a helper can reach while it runs.
pub struct HelperCtx<'m, 'c> {
    pub mem: &'m mut Memory<'c>,
    pub cookie: u64,
}

/// Receives R1 to R5 and returns the new R0.
pub type HelperFn = fn(&mut HelperCtx<'_, '_>, [u64; 5]) -> u64;

pub struct HelperTable {
    helpers: AHashMap<i32, HelperFn>,
}

impl Default for HelperTable {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl HelperTable {
    pub fn new() -> Self {
        Self {
            helpers: AHashMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut table = Self::new();
        table.register(HELPER_KTIME_GET_NS, ktime_get_ns);
        table.register(HELPER_PROBE_READ, probe_read);
        table.register(HELPER_GET_ATTACH_COOKIE, get_attach_cookie);
        table
    }

    /// Installs `helper` under `id`, returning the one it replaced.
    pub fn register(&mut self, id: i32, helper: HelperFn) -> Option<HelperFn> {
        self.helpers.insert(id, helper)
    }

    #[inline]
    pub fn get(&self, id: i32) -> Option<HelperFn> {
        self.helpers.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.helpers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.helpers.is_empty()
    }
}

fn ktime_get_ns(_: &mut HelperCtx<'_, '_>, _: [u64; 5]) -> u64 {
    u64::try_from(START.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

/// `probe_read(dst, size, src)`: copies or zero-fills `dst`.
fn probe_read(ctx: &mut HelperCtx<'_, '_>, [dst, size, src, ..]: [u64; 5]) -> u64 {
    let size = size as usize;
    if ctx.mem.read_bytes(dst, size).is_none() {
        return EFAULT;
    }
    match ctx.mem.read_bytes(src, size).map(<[u8]>::to_vec) {
        Some(bytes) => {
            let _ = ctx.mem.write_bytes(dst, &bytes);
            0
        }
        None => {
            if let Some(out) = ctx.mem.bytes_mut(dst, size) {
                out.fill(0);
            }
            EFAULT
        }
    }
}

fn get_attach_cookie(ctx: &mut HelperCtx<'_, '_>, _: [u64; 5]) -> u64 {
    ctx.cookie
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::memory::{CTX_BASE, STACK_TOP};

    #[test]
    fn test_builtins_registered() {
        let table = HelperTable::default();
        assert_eq!(table.len(), 3);
        assert!(table.get(HELPER_PROBE_READ).is_some());
        assert!(table.get(1).is_none());
        assert!(HelperTable::new().is_empty());
    }

    #[test]
    fn test_probe_read_copies_or_zeroes() {
        let mut ctx_buf = [7_u8; 4];
        let mut mem = Memory::new(8, &mut ctx_buf);
        let mut ctx = HelperCtx { mem: &mut mem, cookie: 0 };
        let slot = STACK_TOP - 8;
        assert_eq!(probe_read(&mut ctx, [slot, 4, CTX_BASE, 0, 0]), 0);
        assert_eq!(ctx.mem.load(slot, 4), Some(0x0707_0707));

        assert_eq!(probe_read(&mut ctx, [slot, 4, 0x10, 0, 0]), EFAULT);
        assert_eq!(ctx.mem.load(slot, 4), Some(0));
        assert_eq!(probe_read(&mut ctx, [0x10, 4, CTX_BASE, 0, 0]), EFAULT);
    }

    #[test]
    fn test_register_replaces() {
        fn answer(_: &mut HelperCtx<'_, '_>, _: [u64; 5]) -> u64 {
            42
        }
        let mut table = HelperTable::new();
        assert!(table.register(1, answer).is_none());
        assert!(table.register(1, answer).is_some());
        let mut empty: [u8; 0] = [];
        let mut mem = Memory::new(0, &mut empty);
        let helper = table.get(1).unwrap();
        assert_eq!(helper(&mut HelperCtx { mem: &mut mem, cookie: 0 }, [0; 5]), 42);
    }
}
