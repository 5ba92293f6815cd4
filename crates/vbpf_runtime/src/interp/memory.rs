//! Address space seen by interpreted programs.
//!
//! Programs never get host pointers. The stack arena hangs below a fixed virtual top and
//! the context buffer sits at a fixed base; every access is bounds-checked against them.
//! The arena starts at the root frame size and only grows when a sub-program call needs
//! a frame below it.

/// Virtual address one past the highest stack byte; the root frame pointer.
pub const STACK_TOP: u64 = 0x0000_7f00_0100_0000;

/// Virtual address of the context buffer, passed in R1.
pub const CTX_BASE: u64 = 0x0000_6000_0000_0000;

pub struct Memory<'a> {
    stack: Vec<u8>,
    ctx: &'a mut [u8],
}

fn offset_in(base: u64, region_len: usize, addr: u64, len: usize) -> Option<usize> {
    let offset = addr.checked_sub(base)?;
    let end = offset.checked_add(len as u64)?;
    (end <= region_len as u64).then_some(offset as usize)
}

impl<'a> Memory<'a> {
    pub fn new(stack_len: usize, ctx: &'a mut [u8]) -> Self {
        Self {
            stack: vec![0; stack_len],
            ctx,
        }
    }

    #[inline]
    pub const fn stack_top(&self) -> u64 {
        STACK_TOP
    }

    /// Lowest mapped stack address.
    #[inline]
    pub fn stack_bottom(&self) -> u64 {
        STACK_TOP - self.stack.len() as u64
    }

    #[inline]
    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    /// Extends the arena downwards so that `low` is mapped. Existing bytes keep their
    /// addresses.
    pub fn grow_stack(&mut self, low: u64) {
        let bottom = self.stack_bottom();
        if low < bottom {
            let extra = (bottom - low) as usize;
            self.stack.splice(0..0, std::iter::repeat_n(0, extra));
        }
    }

    pub fn read_bytes(&self, addr: u64, len: usize) -> Option<&[u8]> {
        if let Some(off) = offset_in(self.stack_bottom(), self.stack.len(), addr, len) {
            return Some(&self.stack[off..off + len]);
        }
        let off = offset_in(CTX_BASE, self.ctx.len(), addr, len)?;
        Some(&self.ctx[off..off + len])
    }

    pub fn bytes_mut(&mut self, addr: u64, len: usize) -> Option<&mut [u8]> {
        if let Some(off) = offset_in(self.stack_bottom(), self.stack.len(), addr, len) {
            return Some(&mut self.stack[off..off + len]);
        }
        let off = offset_in(CTX_BASE, self.ctx.len(), addr, len)?;
        Some(&mut self.ctx[off..off + len])
    }

    pub fn write_bytes(&mut self, addr: u64, bytes: &[u8]) -> Option<()> {
        self.bytes_mut(addr, bytes.len())?.copy_from_slice(bytes);
        Some(())
    }

    /// Little-endian load of `size` bytes, zero-extended.
    #[inline]
    pub fn load(&self, addr: u64, size: usize) -> Option<u64> {
        let bytes = self.read_bytes(addr, size)?;
        let mut raw = [0_u8; 8];
        raw[..size].copy_from_slice(bytes);
        Some(u64::from_le_bytes(raw))
    }

    /// Little-endian store of the low `size` bytes of `value`.
    #[inline]
    pub fn store(&mut self, addr: u64, size: usize, value: u64) -> Option<()> {
        self.write_bytes(addr, &value.to_le_bytes()[..size])
    }
}
