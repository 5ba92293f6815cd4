//! Staging and publication of a single JIT image.

use std::sync::Arc;

use crate::budget::JitBudget;
use crate::pack::{CodeRegion, PackAllocator};
use crate::random::RandomSource;
use crate::Result;

/// Bytes reserved in front of every image for the randomised hole.
const HOLE_RESERVE: usize = 16;

/// A charged region that returns itself to the allocator and the budget on drop.
struct Reservation {
    region: CodeRegion,
    allocator: Arc<PackAllocator>,
    budget: Arc<JitBudget>,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.allocator.free(self.region);
        self.budget.uncharge(self.region.len());
    }
}

/// An image being written: a read-execute reservation plus a writable shadow of it.
pub struct JitBinary {
    reservation: Reservation,
    shadow: Vec<u8>,
    start: usize,
    len: usize,
}

impl JitBinary {
    /// Reserves space for `proglen` bytes of code starting at a random
    /// `alignment`-aligned offset inside the first chunk.
    pub fn alloc(
        allocator: &Arc<PackAllocator>,
        budget: &Arc<JitBudget>,
        proglen: usize,
        alignment: usize,
        rng: &dyn RandomSource,
    ) -> Result<Self> {
        assert!(
            alignment.is_power_of_two(),
            "image alignment must be a power of two"
        );
        let chunk = allocator.chunk_size();
        let size = (proglen + HOLE_RESERVE).div_ceil(chunk) * chunk;

        budget.charge(size)?;
        let region = match allocator.alloc(size) {
            Ok(region) => region,
            Err(err) => {
                budget.uncharge(size);
                return Err(err);
            }
        };
        let reservation = Reservation {
            region,
            allocator: Arc::clone(allocator),
            budget: Arc::clone(budget),
        };

        let hole = (region.len() - proglen).min(chunk);
        let start = rng.below(u32::try_from(hole).unwrap_or(u32::MAX)) as usize & !(alignment - 1);

        let mut shadow = vec![0; region.len()];
        allocator.arch().fill_trap(&mut shadow);

        Ok(Self {
            reservation,
            shadow,
            start,
            len: proglen,
        })
    }

    /// Writable view of the image bytes.
    #[inline]
    pub fn image_mut(&mut self) -> &mut [u8] {
        &mut self.shadow[self.start..self.start + self.len]
    }

    /// Address the image will execute from once finalized.
    #[inline]
    pub const fn entry(&self) -> usize {
        self.reservation.region.addr() + self.start
    }

    /// Copies the shadow into the read-execute region.
    pub fn finalize(self) -> Result<JitImage> {
        let region = self.reservation.region;
        self.reservation
            .allocator
            .text_copy(region, 0, &self.shadow)?;
        Ok(JitImage {
            reservation: self.reservation,
            start: self.start,
            len: self.len,
        })
    }
}

/// Published, immutable machine code.
pub struct JitImage {
    reservation: Reservation,
    start: usize,
    len: usize,
}

impl JitImage {
    #[inline]
    pub const fn entry(&self) -> usize {
        self.reservation.region.addr() + self.start
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Inclusive address range of the code, as attributed by symbol lookups.
    #[inline]
    pub const fn range(&self) -> (u64, u64) {
        let start = self.entry() as u64;
        (start, start + self.len as u64)
    }

    #[inline]
    pub const fn region(&self) -> CodeRegion {
        self.reservation.region
    }

    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the reservation keeps the mapping alive and it is never written again.
        unsafe { std::slice::from_raw_parts(self.entry() as *const u8, self.len) }
    }

    /// # Safety
    /// The code at the entry point must be valid for the signature `F`.
    #[inline]
    pub unsafe fn as_fn<F: Copy>(&self) -> F {
        debug_assert_eq!(
            std::mem::size_of::<F>(),
            std::mem::size_of::<*const ()>(),
            "F must be a function pointer"
        );
        let ptr = self.entry() as *const u8;
        unsafe { std::mem::transmute_copy(&ptr) }
    }
}

impl std::fmt::Debug for JitImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitImage")
            .field("entry", &format_args!("{:#x}", self.entry()))
            .field("len", &self.len)
            .finish()
    }
}

impl std::fmt::Debug for JitBinary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitBinary")
            .field("region", &self.reservation.region)
            .field("start", &self.start)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}
