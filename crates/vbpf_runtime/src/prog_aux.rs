//! Out-of-line program metadata.
//!
//! An aux block belongs to exactly one program at a time. Rewrites that produce a new
//! program move it across explicitly with [`crate::Program::take_aux`] and
//! [`crate::Program::install_aux`]; the block never points back at its owner.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;
use vbpf_insn::MAP_HANDLE_BASE;
use vbpf_symbol::SymbolDirectory;
use vbpf_utils::RcuCell;

use crate::map::{Map, MapType};
use crate::{Result, RuntimeError};

pub const MAX_POKE_DESCRIPTORS: usize = 1024;

/// Maps an instruction to a source location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineInfo {
    pub insn_off: u32,
    pub line: u32,
    pub col: u32,
}

/// A function inside a multi-function program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subprog {
    pub start: usize,
    pub stack_depth: u32,
}

/// A JIT call site that jumps straight into a slot of a program-holding map.
#[derive(Clone)]
pub struct PokeDescriptor {
    pub map: Arc<dyn Map>,
    pub key: u32,
    pub insn_idx: usize,
}

/// Unregisters a program's symbol when dropped.
pub struct KsymGuard {
    symbols: Arc<SymbolDirectory>,
    start: u64,
}

impl KsymGuard {
    pub const fn new(symbols: Arc<SymbolDirectory>, start: u64) -> Self {
        Self { symbols, start }
    }
}

impl Drop for KsymGuard {
    fn drop(&mut self) {
        if let Err(err) = self.symbols.unregister(self.start) {
            warn!(start = self.start, %err, "program symbol already gone");
        }
    }
}

pub struct ProgramAux {
    pub name: String,
    pub id: u32,
    used_maps: RcuCell<Vec<Arc<dyn Map>>>,
    used_maps_lock: Mutex<()>,
    pub linfo: Vec<LineInfo>,
    poke_tab: Vec<PokeDescriptor>,
    pub subprogs: Vec<Subprog>,
    pub xdp_has_frags: bool,
    ksym: Option<KsymGuard>,
}

impl Default for ProgramAux {
    fn default() -> Self {
        Self::new("")
    }
}

impl ProgramAux {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: 0,
            used_maps: RcuCell::new(Vec::new()),
            used_maps_lock: Mutex::new(()),
            linfo: Vec::new(),
            poke_tab: Vec::new(),
            subprogs: Vec::new(),
            xdp_has_frags: false,
            ksym: None,
        }
    }

    /// Adds `map` to the resource list and returns the handle programs load it by.
    pub fn add_used_map(&self, map: Arc<dyn Map>) -> u64 {
        let _writer = self.used_maps_lock.lock();
        let mut index = 0;
        self.used_maps.update(|maps| {
            index = maps.len();
            let mut next = maps.clone();
            next.push(Arc::clone(&map));
            next
        });
        MAP_HANDLE_BASE | index as u64
    }

    /// Resolves a handle loaded by the program. Lock-free.
    pub fn map_by_handle(&self, handle: u64) -> Option<Arc<dyn Map>> {
        if handle & !0xffff_ffff != MAP_HANDLE_BASE {
            return None;
        }
        let index = (handle & 0xffff_ffff) as usize;
        self.used_maps.read(|maps| maps.get(index).cloned())
    }

    pub fn used_maps(&self) -> Vec<Arc<dyn Map>> {
        self.used_maps.load()
    }

    pub fn add_poke_descriptor(&mut self, desc: PokeDescriptor) -> Result<usize> {
        if self.poke_tab.len() >= MAX_POKE_DESCRIPTORS {
            return Err(RuntimeError::Unsupported(format!(
                "more than {MAX_POKE_DESCRIPTORS} tail-call patch sites"
            )));
        }
        if desc.map.map_type() != MapType::ProgArray {
            return Err(RuntimeError::Incompatible {
                map_id: desc.map.id(),
                reason: "patch sites must target a program array".to_string(),
            });
        }
        self.poke_tab.push(desc);
        Ok(self.poke_tab.len() - 1)
    }

    pub fn poke_descriptors(&self) -> &[PokeDescriptor] {
        &self.poke_tab
    }

    /// Stack depth of the sub-program starting at `start`.
    pub fn subprog_stack_depth(&self, start: usize) -> Option<u32> {
        self.subprogs
            .iter()
            .find(|subprog| subprog.start == start)
            .map(|subprog| subprog.stack_depth)
    }

    pub(crate) fn set_ksym(&mut self, guard: KsymGuard) {
        self.ksym = Some(guard);
    }

    pub fn has_ksym(&self) -> bool {
        self.ksym.is_some()
    }

    /// Shifts line info and sub-program starts after `off` by `delta` instructions.
    pub(crate) fn adjust_after_patch(&mut self, off: usize, delta: u32) {
        for linfo in &mut self.linfo {
            if linfo.insn_off as usize > off {
                linfo.insn_off += delta;
            }
        }
        for subprog in &mut self.subprogs {
            if subprog.start > off {
                subprog.start += delta as usize;
            }
        }
    }

    /// Whether shifting by `delta` after `off` keeps every line-info offset encodable.
    pub(crate) fn can_adjust(&self, off: usize, delta: u32) -> bool {
        self.linfo
            .iter()
            .filter(|linfo| linfo.insn_off as usize > off)
            .all(|linfo| linfo.insn_off.checked_add(delta).is_some())
    }

    /// Mirrors a removal of `cnt` instructions at `off`: entries past the range move
    /// down, entries inside it collapse onto `off`.
    pub(crate) fn adjust_after_remove(&mut self, off: usize, cnt: usize) {
        let end = off + cnt;
        let shift = |pos: usize| {
            if pos >= end {
                pos - cnt
            } else if pos > off {
                off
            } else {
                pos
            }
        };
        for linfo in &mut self.linfo {
            linfo.insn_off = shift(linfo.insn_off as usize) as u32;
        }
        for subprog in &mut self.subprogs {
            subprog.start = shift(subprog.start);
        }
    }
}

impl std::fmt::Debug for ProgramAux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgramAux")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("used_maps", &self.used_maps.read(Vec::len))
            .field("linfo", &self.linfo.len())
            .field("subprogs", &self.subprogs)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::ProgArrayMap;

    #[test]
    fn test_map_handles_resolve() {
        let aux = ProgramAux::new("p");
        let map: Arc<dyn Map> = Arc::new(ProgArrayMap::new(7, 4));
        let handle = aux.add_used_map(Arc::clone(&map));
        assert_eq!(handle, MAP_HANDLE_BASE);
        assert_eq!(aux.map_by_handle(handle).unwrap().id(), 7);
        assert!(aux.map_by_handle(MAP_HANDLE_BASE | 1).is_none());
        assert!(aux.map_by_handle(42).is_none());
    }

    #[test]
    fn test_poke_table_limits() {
        let mut aux = ProgramAux::new("p");
        let map: Arc<dyn Map> = Arc::new(ProgArrayMap::new(1, 1));
        for idx in 0..MAX_POKE_DESCRIPTORS {
            aux.add_poke_descriptor(PokeDescriptor {
                map: Arc::clone(&map),
                key: 0,
                insn_idx: idx,
            })
            .unwrap();
        }
        let overflow = aux.add_poke_descriptor(PokeDescriptor {
            map,
            key: 0,
            insn_idx: 0,
        });
        assert!(matches!(overflow, Err(RuntimeError::Unsupported(_))));
    }

    #[test]
    fn test_adjust_after_patch_and_remove() {
        let mut aux = ProgramAux::new("p");
        aux.linfo = vec![
            LineInfo { insn_off: 0, line: 1, col: 0 },
            LineInfo { insn_off: 3, line: 2, col: 0 },
            LineInfo { insn_off: 5, line: 3, col: 0 },
        ];
        aux.subprogs = vec![Subprog { start: 5, stack_depth: 16 }];

        aux.adjust_after_patch(3, 2);
        let offs: Vec<u32> = aux.linfo.iter().map(|l| l.insn_off).collect();
        assert_eq!(offs, vec![0, 3, 7]);
        assert_eq!(aux.subprog_stack_depth(7), Some(16));

        aux.adjust_after_remove(2, 3);
        let offs: Vec<u32> = aux.linfo.iter().map(|l| l.insn_off).collect();
        assert_eq!(offs, vec![0, 2, 4]);
        assert_eq!(aux.subprogs[0].start, 4);
    }
}
