//! Program objects and their lifecycle.
//!
//! A program owns a page-granular instruction image, an optional aux block, an entry
//! point and per-CPU bookkeeping. It is built writable, optionally rewritten, then
//! locked read-only by [`crate::Runtime::finalize_runtime`]. Dropping a finalized
//! program hands its memory, code and symbols to the runtime's release worker.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_channel::Sender;
use memmap2::{Mmap, MmapMut};
use sha1::{Digest, Sha1};
use vbpf_insn::opcode::{JMP, TAIL_CALL};
use vbpf_insn::{INSN_SIZE, Insn};
use vbpf_jit::JitImage;

use crate::prog_aux::ProgramAux;
use crate::release::{Message, Retired};
use crate::stats::{ActiveGuard, PerCpu, ProgramStats, StatsSnapshot};
use crate::{Result, RuntimeError};

pub const PAGE_SIZE: usize = vbpf_config::PAGE_SIZE;

/// Largest stack frame a program may declare.
pub const MAX_STACK: u32 = 512;

/// Granularity of the interpreter's stack-size ladder.
pub const STACK_BUCKET: u32 = 32;

pub type JitFunc = unsafe extern "C" fn(ctx: *mut u8, insns: *const Insn) -> u64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ProgType {
    #[default]
    Unspec,
    SocketFilter,
    Kprobe,
    Tracing,
    Xdp,
    CgroupSkb,
}

pub(crate) enum InsnImage {
    Writable(MmapMut),
    ReadOnly(Mmap),
    Empty,
}

impl InsnImage {
    fn bytes(&self) -> &[u8] {
        match self {
            Self::Writable(map) => &map[..],
            Self::ReadOnly(map) => &map[..],
            Self::Empty => &[],
        }
    }
}

/// How an invocation reaches the program's code.
pub enum Entry {
    Unset,
    /// Interpreted with a stack frame of `stack_size` bytes.
    Interpreter { stack_size: u32 },
    Jited { image: JitImage, func: JitFunc },
    /// Placeholder for deleted program-array slots; returns 1.
    Sentinel,
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unset => f.write_str("Unset"),
            Self::Interpreter { stack_size } => write!(f, "Interpreter({stack_size})"),
            Self::Jited { image, .. } => write!(f, "Jited({image:?})"),
            Self::Sentinel => f.write_str("Sentinel"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgramFlags {
    pub jit_requested: bool,
    pub blinding_requested: bool,
    pub blinded: bool,
    pub jited: bool,
    pub locked: bool,
}

pub struct Program {
    image: InsnImage,
    len: usize,
    tag: [u8; 8],
    prog_type: ProgType,
    stack_depth: u32,
    flags: ProgramFlags,
    aux: Option<Box<ProgramAux>>,
    entry: Entry,
    stats: PerCpu<ProgramStats>,
    active: PerCpu<AtomicUsize>,
    stats_enabled: AtomicBool,
    release: Option<Sender<Message>>,
}

fn map_pages(size: usize) -> Result<MmapMut> {
    let len = size.max(1).div_ceil(PAGE_SIZE) * PAGE_SIZE;
    MmapMut::map_anon(len)
        .map_err(|err| RuntimeError::OutOfMemory(format!("program image of {len} bytes: {err}")))
}

impl Program {
    /// Creates an empty program with room for `size` bytes of instructions, rounded up to
    /// whole pages.
    pub fn allocate(size: usize) -> Result<Self> {
        Ok(Self::with_image(InsnImage::Writable(map_pages(size)?)))
    }

    /// Allocates a program holding `insns` with a fresh aux block.
    pub fn load(insns: &[Insn], prog_type: ProgType) -> Result<Self> {
        let mut prog = Self::allocate(insns.len() * INSN_SIZE)?;
        prog.push(insns)?;
        prog.prog_type = prog_type;
        prog.aux = Some(Box::default());
        Ok(prog)
    }

    pub(crate) fn sentinel() -> Self {
        let mut prog = Self::with_image(InsnImage::Empty);
        prog.entry = Entry::Sentinel;
        prog.flags.locked = true;
        prog
    }

    fn with_image(image: InsnImage) -> Self {
        Self {
            image,
            len: 0,
            tag: [0; 8],
            prog_type: ProgType::default(),
            stack_depth: 0,
            flags: ProgramFlags::default(),
            aux: None,
            entry: Entry::Unset,
            stats: PerCpu::new(),
            active: PerCpu::new(),
            stats_enabled: AtomicBool::new(false),
            release: None,
        }
    }

    // Instruction image

    #[inline]
    pub fn insns(&self) -> &[Insn] {
        &self.raw_insns()[..self.len]
    }

    fn raw_insns(&self) -> &[Insn] {
        let bytes = self.image.bytes();
        // SAFETY: the image is page aligned, `Insn` is a plain 8-byte `repr(C)` struct and
        // every bit pattern is a valid instruction.
        unsafe { std::slice::from_raw_parts(bytes.as_ptr().cast(), bytes.len() / INSN_SIZE) }
    }

    /// Whole writable image, including unused capacity.
    pub(crate) fn raw_insns_mut(&mut self) -> &mut [Insn] {
        let InsnImage::Writable(map) = &mut self.image else {
            panic!("instruction image of a locked program written");
        };
        let len = map.len() / INSN_SIZE;
        // SAFETY: as in `raw_insns`, and the mapping is exclusively borrowed.
        unsafe { std::slice::from_raw_parts_mut(map.as_mut_ptr().cast(), len) }
    }

    #[inline]
    pub fn insns_mut(&mut self) -> &mut [Insn] {
        let len = self.len;
        &mut self.raw_insns_mut()[..len]
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Instruction slots available without growing.
    pub fn capacity(&self) -> usize {
        self.image.bytes().len() / INSN_SIZE
    }

    pub fn pages(&self) -> usize {
        self.image.bytes().len() / PAGE_SIZE
    }

    /// Appends instructions, growing the image when needed.
    pub fn push(&mut self, insns: &[Insn]) -> Result<()> {
        let start = self.len;
        self.set_len(start + insns.len())?;
        self.raw_insns_mut()[start..start + insns.len()].copy_from_slice(insns);
        Ok(())
    }

    /// Resizes to `len` instructions, growing the image when needed.
    pub(crate) fn set_len(&mut self, len: usize) -> Result<()> {
        if self.flags.locked {
            return Err(RuntimeError::InvalidState(
                "program is locked read-only".to_string(),
            ));
        }
        if len > self.capacity() {
            self.grow_in_place(len * INSN_SIZE)?;
        }
        self.len = len;
        Ok(())
    }

    /// Returns a program with room for at least `size` bytes, reusing the current image
    /// when it is already large enough.
    pub fn grow(mut self, size: usize) -> Result<Self> {
        self.grow_in_place(size)?;
        Ok(self)
    }

    pub(crate) fn grow_in_place(&mut self, size: usize) -> Result<()> {
        if size <= self.image.bytes().len() {
            return Ok(());
        }
        let mut map = map_pages(size)?;
        let used = self.len * INSN_SIZE;
        map[..used].copy_from_slice(&self.image.bytes()[..used]);
        self.image = InsnImage::Writable(map);
        Ok(())
    }

    /// Makes the instruction image read-only.
    pub fn lock_readonly(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.image, InsnImage::Empty) {
            InsnImage::Writable(map) => {
                self.image = InsnImage::ReadOnly(map.make_read_only()?);
            }
            other => self.image = other,
        }
        self.flags.locked = true;
        Ok(())
    }

    /// Fresh writable copy carrying this program's aux block.
    pub(crate) fn clone_for_rewrite(&mut self) -> Result<Self> {
        let mut clone = Self::allocate(self.image.bytes().len())?;
        clone.push(self.insns())?;
        clone.tag = self.tag;
        clone.prog_type = self.prog_type;
        clone.stack_depth = self.stack_depth;
        clone.flags = ProgramFlags {
            locked: false,
            jited: false,
            ..self.flags
        };
        clone.aux = self.aux.take();
        Ok(clone)
    }

    /// Discards this program after handing its aux block back to `original`.
    pub fn release_other(mut self, original: &mut Self) {
        original.aux = self.aux.take();
    }

    // Identity

    /// SHA-1 of the instruction stream, truncated to 8 bytes.
    pub fn calc_tag(&mut self) {
        let mut hasher = Sha1::new();
        for insn in self.insns() {
            hasher.update(insn.to_bytes());
        }
        let digest = hasher.finalize();
        self.tag.copy_from_slice(&digest[..8]);
    }

    #[inline]
    pub const fn tag(&self) -> &[u8; 8] {
        &self.tag
    }

    pub fn tag_hex(&self) -> String {
        self.tag.iter().map(|byte| format!("{byte:02x}")).collect()
    }

    pub fn id(&self) -> u32 {
        self.aux.as_ref().map_or(0, |aux| aux.id)
    }

    pub fn name(&self) -> &str {
        self.aux.as_ref().map_or("", |aux| aux.name.as_str())
    }

    #[inline]
    pub const fn prog_type(&self) -> ProgType {
        self.prog_type
    }

    pub fn set_prog_type(&mut self, prog_type: ProgType) {
        self.prog_type = prog_type;
    }

    #[inline]
    pub const fn stack_depth(&self) -> u32 {
        self.stack_depth
    }

    pub fn set_stack_depth(&mut self, depth: u32) {
        self.stack_depth = depth;
    }

    // Aux

    pub fn aux(&self) -> Option<&ProgramAux> {
        self.aux.as_deref()
    }

    pub fn aux_mut(&mut self) -> Option<&mut ProgramAux> {
        self.aux.as_deref_mut()
    }

    pub fn take_aux(&mut self) -> Option<Box<ProgramAux>> {
        self.aux.take()
    }

    pub fn install_aux(&mut self, aux: Box<ProgramAux>) {
        self.aux = Some(aux);
    }

    // Flags

    #[inline]
    pub const fn flags(&self) -> ProgramFlags {
        self.flags
    }

    #[inline]
    pub const fn is_locked(&self) -> bool {
        self.flags.locked
    }

    #[inline]
    pub const fn is_jited(&self) -> bool {
        self.flags.jited
    }

    #[inline]
    pub const fn is_blinded(&self) -> bool {
        self.flags.blinded
    }

    pub fn request_jit(&mut self) {
        self.flags.jit_requested = true;
    }

    pub fn request_blinding(&mut self) {
        self.flags.blinding_requested = true;
    }

    pub(crate) fn mark_blinded(&mut self) {
        self.flags.blinded = true;
    }

    pub fn has_tail_call(&self) -> bool {
        self.insns().iter().any(|insn| insn.code == JMP | TAIL_CALL)
    }

    // Entry

    #[inline]
    pub const fn entry(&self) -> &Entry {
        &self.entry
    }

    /// Publishes native code produced by a JIT backend.
    pub fn set_jited(&mut self, image: JitImage) {
        // SAFETY: backends emit code following the `JitFunc` calling convention.
        let func: JitFunc = unsafe { image.as_fn() };
        self.entry = Entry::Jited { image, func };
        self.flags.jited = true;
    }

    /// Binds the interpreter, picking the smallest stack bucket that fits.
    pub(crate) fn select_interpreter(&mut self) -> Result<()> {
        if self.stack_depth > MAX_STACK {
            return Err(RuntimeError::Unsupported(format!(
                "stack depth {} exceeds {MAX_STACK} bytes",
                self.stack_depth
            )));
        }
        let stack_size = if self.has_tail_call() {
            MAX_STACK
        } else {
            self.stack_depth.max(1).div_ceil(STACK_BUCKET) * STACK_BUCKET
        };
        self.entry = Entry::Interpreter { stack_size };
        Ok(())
    }

    pub(crate) fn attach_release(&mut self, sender: Sender<Message>) {
        self.release = Some(sender);
    }

    /// Makes the next drop tear down inline; used on the release worker itself.
    pub(crate) fn detach_release(&mut self) {
        self.release = None;
    }

    // Statistics

    pub fn set_stats_enabled(&self, enabled: bool) {
        self.stats_enabled.store(enabled, Ordering::Relaxed);
    }

    #[inline]
    pub fn stats_enabled(&self) -> bool {
        self.stats_enabled.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn record_run(&self, nsecs: u64) {
        self.stats.record_run(nsecs);
    }

    pub(crate) fn record_miss(&self) {
        self.stats.record_miss();
    }

    pub(crate) fn enter(&self) -> ActiveGuard<'_> {
        ActiveGuard::enter(&self.active)
    }

    /// Invocations currently executing on any thread.
    pub fn active_count(&self) -> usize {
        self.active.total()
    }
}

impl Drop for Program {
    fn drop(&mut self) {
        let Some(sender) = self.release.take() else {
            return;
        };
        let retired = Retired {
            id: self.id(),
            aux: self.aux.take(),
            entry: std::mem::replace(&mut self.entry, Entry::Unset),
            image: std::mem::replace(&mut self.image, InsnImage::Empty),
        };
        // Once the worker is gone the parts are dropped right here.
        let _ = sender.send(Message::Retire(retired));
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("len", &self.len)
            .field("tag", &self.tag_hex())
            .field("flags", &self.flags)
            .field("entry", &self.entry)
            .finish_non_exhaustive()
    }
}
