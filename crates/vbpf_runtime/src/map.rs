//! Resources referenced by programs, and the program-holding map used by tail calls.

use std::any::Any;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;
use vbpf_utils::RcuCell;

use crate::program::{ProgType, Program};
use crate::{Result, RuntimeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapType {
    Array,
    Hash,
    ProgArray,
}

/// A resource a program refers to by handle.
pub trait Map: Any + Send + Sync {
    fn id(&self) -> u32;

    fn map_type(&self) -> MapType;

    fn as_prog_array(&self) -> Option<&ProgArrayMap> {
        None
    }
}

/// Properties every program stored in one program-holding map must share.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapOwner {
    pub prog_type: ProgType,
    pub jited: bool,
    pub xdp_has_frags: bool,
}

impl MapOwner {
    fn of(prog: &Program) -> Self {
        Self {
            prog_type: prog.prog_type(),
            jited: prog.is_jited(),
            xdp_has_frags: prog.aux().is_some_and(|aux| aux.xdp_has_frags),
        }
    }
}

/// Fixed-size table of programs, indexed by tail calls.
///
/// Slot reads are lock-free; updates publish a whole slot value at once.
pub struct ProgArrayMap {
    id: u32,
    slots: Box<[RcuCell<Option<Arc<Program>>>]>,
    owner: Mutex<Option<MapOwner>>,
    update_lock: Mutex<()>,
}

impl ProgArrayMap {
    pub fn new(id: u32, max_entries: u32) -> Self {
        Self {
            id,
            slots: (0..max_entries).map(|_| RcuCell::new(None)).collect(),
            owner: Mutex::new(None),
            update_lock: Mutex::new(()),
        }
    }

    #[inline]
    pub fn max_entries(&self) -> u32 {
        self.slots.len() as u32
    }

    /// The program in slot `index`, if any.
    #[inline]
    pub fn lookup(&self, index: u32) -> Option<Arc<Program>> {
        self.slots.get(index as usize)?.load()
    }

    pub fn owner(&self) -> Option<MapOwner> {
        *self.owner.lock()
    }

    /// Fixes the owner metadata on first use and checks `prog` against it afterwards.
    pub fn check_compatible(&self, prog: &Program) -> Result<()> {
        let candidate = MapOwner::of(prog);
        let mut owner = self.owner.lock();
        match *owner {
            None => {
                *owner = Some(candidate);
                Ok(())
            }
            Some(existing) if existing == candidate => Ok(()),
            Some(existing) => Err(RuntimeError::Incompatible {
                map_id: self.id,
                reason: format!("expected {existing:?}, program is {candidate:?}"),
            }),
        }
    }

    /// Stores `prog` in slot `index`, returning the previous occupant.
    pub fn update(&self, index: u32, prog: Arc<Program>) -> Result<Option<Arc<Program>>> {
        let slot = self.slot(index)?;
        if !prog.is_locked() {
            return Err(RuntimeError::InvalidState(format!(
                "program {} is not finalized",
                prog.id()
            )));
        }
        self.check_compatible(&prog)?;
        let _writer = self.update_lock.lock();
        let previous = slot.load();
        slot.replace(Some(prog));
        debug!(map = self.id, index, "program array slot updated");
        Ok(previous)
    }

    /// Empties slot `index`, returning the previous occupant.
    pub fn delete(&self, index: u32) -> Result<Option<Arc<Program>>> {
        let slot = self.slot(index)?;
        let _writer = self.update_lock.lock();
        let previous = slot.load();
        if previous.is_none() {
            return Err(RuntimeError::NotFound(format!(
                "slot {index} of map {}",
                self.id
            )));
        }
        slot.replace(None);
        Ok(previous)
    }

    pub fn clear(&self) {
        let _writer = self.update_lock.lock();
        for slot in &*self.slots {
            slot.replace(None);
        }
    }

    fn slot(&self, index: u32) -> Result<&RcuCell<Option<Arc<Program>>>> {
        self.slots.get(index as usize).ok_or_else(|| {
            RuntimeError::NotFound(format!(
                "slot {index} of map {} with {} entries",
                self.id,
                self.slots.len()
            ))
        })
    }
}

impl Map for ProgArrayMap {
    fn id(&self) -> u32 {
        self.id
    }

    fn map_type(&self) -> MapType {
        MapType::ProgArray
    }

    fn as_prog_array(&self) -> Option<&ProgArrayMap> {
        Some(self)
    }
}
