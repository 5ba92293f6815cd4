//! Copy-on-write program arrays.
//!
//! An array is built once and then only read. Membership changes build a new array
//! with [`ProgArray::copy_with`]; the one in-place edit allowed is swapping a slot's
//! program for the sentinel (or another program), which readers observe atomically.

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::debug;
use vbpf_utils::RcuCell;

use crate::program::Program;
use crate::runtime::Runtime;
use crate::{Result, RuntimeError};

static SENTINEL: Lazy<Arc<Program>> = Lazy::new(|| Arc::new(Program::sentinel()));

/// The shared placeholder for deleted slots. Running it returns 1.
pub fn sentinel() -> Arc<Program> {
    Arc::clone(&SENTINEL)
}

#[inline]
pub fn is_sentinel(prog: &Arc<Program>) -> bool {
    Arc::ptr_eq(prog, &SENTINEL)
}

pub struct ProgArrayItem {
    prog: RcuCell<Arc<Program>>,
    cookie: u64,
}

impl ProgArrayItem {
    fn new(prog: Arc<Program>, cookie: u64) -> Self {
        Self {
            prog: RcuCell::new(prog),
            cookie,
        }
    }

    #[inline]
    pub fn prog(&self) -> Arc<Program> {
        self.prog.load()
    }

    #[inline]
    pub const fn cookie(&self) -> u64 {
        self.cookie
    }

    fn is_live(&self) -> bool {
        self.prog.read(|prog| !is_sentinel(prog))
    }

    fn holds(&self, target: &Arc<Program>) -> bool {
        self.prog.read(|prog| Arc::ptr_eq(prog, target))
    }
}

#[derive(Default)]
pub struct ProgArray {
    items: Box<[ProgArrayItem]>,
}

impl ProgArray {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds the successor of `old` without touching it.
    ///
    /// Sentinel slots and `exclude` are dropped, surviving entries keep their order and
    /// `include` goes last.
    pub fn copy_with(
        old: Option<&ProgArray>,
        exclude: Option<&Arc<Program>>,
        include: Option<(Arc<Program>, u64)>,
    ) -> Result<ProgArray> {
        let mut survivors = Vec::new();
        let mut found_exclude = false;
        for item in old.map(|array| &*array.items).unwrap_or_default() {
            let prog = item.prog();
            if is_sentinel(&prog) {
                continue;
            }
            if exclude.is_some_and(|target| Arc::ptr_eq(target, &prog)) {
                found_exclude = true;
                continue;
            }
            if let Some((candidate, _)) = &include {
                if Arc::ptr_eq(candidate, &prog) {
                    return Err(RuntimeError::AlreadyExists(prog.id()));
                }
            }
            survivors.push(ProgArrayItem::new(prog, item.cookie));
        }
        if let Some(target) = exclude {
            if !found_exclude {
                return Err(RuntimeError::NotFound(format!("program {}", target.id())));
            }
        }
        if let Some((prog, cookie)) = include {
            survivors.push(ProgArrayItem::new(prog, cookie));
        }
        Ok(ProgArray {
            items: survivors.into_boxed_slice(),
        })
    }

    /// Replaces `target` with the sentinel in place.
    pub fn mark_deleted(&self, target: &Arc<Program>) -> Result<()> {
        let item = self
            .items
            .iter()
            .find(|item| item.holds(target))
            .ok_or_else(|| RuntimeError::NotFound(format!("program {}", target.id())))?;
        item.prog.replace(sentinel());
        Ok(())
    }

    /// Number of live entries.
    pub fn length(&self) -> usize {
        self.items.iter().filter(|item| item.is_live()).count()
    }

    pub fn is_empty(&self) -> bool {
        !self.items.iter().any(ProgArrayItem::is_live)
    }

    /// Slots including sentinels.
    pub fn items(&self) -> &[ProgArrayItem] {
        &self.items
    }

    /// Up to `request` live program ids, and whether more were left out.
    pub fn ids(&self, request: usize) -> (Vec<u32>, bool) {
        let mut ids = Vec::with_capacity(request.min(self.items.len()));
        let mut more = false;
        for item in &*self.items {
            let prog = item.prog();
            if is_sentinel(&prog) {
                continue;
            }
            if ids.len() == request {
                more = true;
                break;
            }
            ids.push(prog.id());
        }
        (ids, more)
    }

    /// Replaces the program at live position `index`.
    pub fn update_at(&self, index: usize, prog: Arc<Program>) -> Result<()> {
        self.live_item(index)?.prog.replace(prog);
        Ok(())
    }

    /// Turns the program at live position `index` into the sentinel.
    pub fn delete_at(&self, index: usize) -> Result<()> {
        self.live_item(index)?.prog.replace(sentinel());
        Ok(())
    }

    fn live_item(&self, index: usize) -> Result<&ProgArrayItem> {
        self.items
            .iter()
            .filter(|item| item.is_live())
            .nth(index)
            .ok_or_else(|| RuntimeError::NotFound(format!("live slot {index}")))
    }

    /// Runs every slot in order with its cookie. Sentinels return 1.
    pub fn run_all(&self, runtime: &Runtime, ctx: &mut [u8]) -> Result<Vec<u64>> {
        self.items
            .iter()
            .map(|item| runtime.run_with_cookie(&item.prog(), ctx, item.cookie))
            .collect()
    }
}

impl std::fmt::Debug for ProgArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.items.iter().map(|item| {
                let prog = item.prog();
                (prog.id(), item.cookie, is_sentinel(&prog))
            }))
            .finish()
    }
}

/// An attachment point: the published array plus a writer lock.
pub struct ProgArrayCell {
    current: RcuCell<Arc<ProgArray>>,
    writer: Mutex<()>,
}

impl Default for ProgArrayCell {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgArrayCell {
    pub fn new() -> Self {
        Self {
            current: RcuCell::new(Arc::new(ProgArray::empty())),
            writer: Mutex::new(()),
        }
    }

    /// The current generation. Lock-free.
    #[inline]
    pub fn load(&self) -> Arc<ProgArray> {
        self.current.load()
    }

    pub fn attach(&self, prog: Arc<Program>, cookie: u64) -> Result<()> {
        let _writer = self.writer.lock();
        let id = prog.id();
        let next = ProgArray::copy_with(Some(&self.current.load()), None, Some((prog, cookie)))?;
        self.current.replace(Arc::new(next));
        debug!(id, cookie, "program attached");
        Ok(())
    }

    pub fn detach(&self, prog: &Arc<Program>) -> Result<()> {
        let _writer = self.writer.lock();
        let next = ProgArray::copy_with(Some(&self.current.load()), Some(prog), None)?;
        self.current.replace(Arc::new(next));
        debug!(id = prog.id(), "program detached");
        Ok(())
    }

    pub fn run_all(&self, runtime: &Runtime, ctx: &mut [u8]) -> Result<Vec<u64>> {
        self.load().run_all(runtime, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::ProgType;
    use vbpf_insn::{exit, mov64_imm};

    fn prog(id: u32) -> Arc<Program> {
        let mut prog = Program::load(&[mov64_imm(0, id as i32), exit()], ProgType::Kprobe).unwrap();
        prog.aux_mut().unwrap().id = id;
        prog.lock_readonly().unwrap();
        Arc::new(prog)
    }

    fn array_of(progs: &[Arc<Program>]) -> ProgArray {
        progs.iter().fold(ProgArray::empty(), |array, prog| {
            ProgArray::copy_with(Some(&array), None, Some((Arc::clone(prog), 0))).unwrap()
        })
    }

    #[test]
    fn test_copy_with_preserves_order() {
        let progs: Vec<_> = (1..=4).map(prog).collect();
        let array = array_of(&progs);
        assert_eq!(array.ids(10), (vec![1, 2, 3, 4], false));

        let next = ProgArray::copy_with(Some(&array), Some(&progs[1]), None).unwrap();
        assert_eq!(next.ids(10), (vec![1, 3, 4], false));
        // The old generation is untouched.
        assert_eq!(array.length(), 4);
    }

    #[test]
    fn test_copy_with_membership_errors() {
        let progs: Vec<_> = (1..=2).map(prog).collect();
        let array = array_of(&progs[..1]);
        assert!(matches!(
            ProgArray::copy_with(Some(&array), None, Some((Arc::clone(&progs[0]), 7))),
            Err(RuntimeError::AlreadyExists(1))
        ));
        assert!(matches!(
            ProgArray::copy_with(Some(&array), Some(&progs[1]), None),
            Err(RuntimeError::NotFound(_))
        ));
        assert!(matches!(
            ProgArray::copy_with(None, Some(&progs[1]), None),
            Err(RuntimeError::NotFound(_))
        ));
    }

    #[test]
    fn test_mark_deleted_then_compact() {
        let progs: Vec<_> = (1..=3).map(prog).collect();
        let array = array_of(&progs);
        array.mark_deleted(&progs[0]).unwrap();
        assert_eq!(array.items().len(), 3);
        assert_eq!(array.length(), 2);
        assert!(array.mark_deleted(&progs[0]).is_err());

        let compacted = ProgArray::copy_with(Some(&array), None, None).unwrap();
        assert_eq!(compacted.items().len(), 2);
        assert_eq!(compacted.ids(10).0, vec![2, 3]);
    }

    #[test]
    fn test_positional_updates_skip_sentinels() {
        let progs: Vec<_> = (1..=3).map(prog).collect();
        let array = array_of(&progs);
        array.delete_at(0).unwrap();
        array.update_at(0, prog(9)).unwrap();
        assert_eq!(array.ids(10).0, vec![9, 3]);
        assert!(matches!(array.delete_at(2), Err(RuntimeError::NotFound(_))));
    }

    #[test]
    fn test_ids_reports_truncation() {
        let array = array_of(&(1..=3).map(prog).collect::<Vec<_>>());
        assert_eq!(array.ids(2), (vec![1, 2], true));
        assert_eq!(array.ids(3), (vec![1, 2, 3], false));
        assert!(!array.is_empty());
        assert!(ProgArray::empty().is_empty());
    }

    #[test]
    fn test_cell_readers_see_whole_generations() {
        let cell = ProgArrayCell::new();
        let progs: Vec<_> = (1..=16).map(prog).collect();
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..500 {
                        let ids = cell.load().ids(usize::MAX).0;
                        // Attachments happen in id order, so every generation is a prefix.
                        assert!(ids.iter().enumerate().all(|(i, id)| *id == i as u32 + 1));
                    }
                });
            }
            for prog in &progs {
                cell.attach(Arc::clone(prog), 0).unwrap();
            }
        });
        assert_eq!(cell.load().length(), 16);
        cell.detach(&progs[0]).unwrap();
        assert!(cell.detach(&progs[0]).is_err());
    }
}
