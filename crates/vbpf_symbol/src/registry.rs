use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;
use vbpf_utils::RcuCell;

use crate::symbol::SymbolEntry;
use crate::{Result, SymbolError};

/// One published view of the directory.
#[derive(Default)]
struct Generation {
    /// Registration order, for enumeration.
    list: Vec<Arc<SymbolEntry>>,
    /// Keyed by start address, for range search.
    tree: BTreeMap<u64, Arc<SymbolEntry>>,
}

impl Generation {
    fn find(&self, addr: u64) -> Option<&Arc<SymbolEntry>> {
        self.tree
            .range(..=addr)
            .next_back()
            .map(|(_, entry)| entry)
            .filter(|entry| entry.contains(addr))
    }

    fn overlapping(&self, start: u64, end: u64) -> Option<&Arc<SymbolEntry>> {
        self.tree
            .range(..=end)
            .next_back()
            .map(|(_, entry)| entry)
            .filter(|entry| entry.overlaps(start, end))
    }
}

/// Address-range to name directory.
///
/// Lookups read whichever generation is published and take no lock. Registration and
/// removal serialise on a writer mutex, build the next generation off to the side and
/// publish it with one atomic swap.
pub struct SymbolDirectory {
    current: RcuCell<Generation>,
    writer: Mutex<()>,
}

impl Default for SymbolDirectory {
    fn default() -> Self {
        Self {
            current: RcuCell::new(Generation::default()),
            writer: Mutex::new(()),
        }
    }
}

impl SymbolDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, entry: SymbolEntry) -> Result<Arc<SymbolEntry>> {
        if entry.end < entry.start {
            return Err(SymbolError::EmptyRange {
                start: entry.start,
                end: entry.end,
            });
        }
        let entry = Arc::new(entry);
        let _writer = self.writer.lock();

        let next = self.current.read(|current| {
            if let Some(existing) = current.overlapping(entry.start, entry.end) {
                return Err(SymbolError::Overlap {
                    name: entry.name.clone(),
                    existing: existing.name.clone(),
                });
            }
            let mut list = current.list.clone();
            list.push(Arc::clone(&entry));
            let mut tree = current.tree.clone();
            tree.insert(entry.start, Arc::clone(&entry));
            Ok(Generation { list, tree })
        })?;

        self.current.replace(next);
        debug!(name = %entry.name, start = entry.start, end = entry.end, "symbol registered");
        Ok(entry)
    }

    /// Removes the entry starting at `start`.
    pub fn unregister(&self, start: u64) -> Result<Arc<SymbolEntry>> {
        let _writer = self.writer.lock();

        let (next, removed) = self.current.read(|current| {
            let removed = current
                .tree
                .get(&start)
                .cloned()
                .ok_or(SymbolError::Unknown { start })?;
            let list = current
                .list
                .iter()
                .filter(|entry| !Arc::ptr_eq(entry, &removed))
                .cloned()
                .collect();
            let mut tree = current.tree.clone();
            tree.remove(&start);
            Ok::<_, SymbolError>((Generation { list, tree }, removed))
        })?;

        self.current.replace(next);
        debug!(name = %removed.name, start, "symbol unregistered");
        Ok(removed)
    }

    /// Entry whose range contains `addr` (end-inclusive).
    pub fn find(&self, addr: u64) -> Option<Arc<SymbolEntry>> {
        self.current.read(|current| current.find(addr).cloned())
    }

    /// Name, size and offset into the symbol for `addr`.
    pub fn address_lookup(&self, addr: u64) -> Option<(String, u64, u64)> {
        self.current.read(|current| {
            current
                .find(addr)
                .map(|entry| (entry.name.clone(), entry.size(), addr - entry.start))
        })
    }

    pub fn is_text_address(&self, addr: u64) -> bool {
        self.current.read(|current| current.find(addr).is_some())
    }

    /// Id of the program whose image contains `addr`.
    pub fn find_program(&self, addr: u64) -> Option<u32> {
        self.current.read(|current| {
            current
                .find(addr)
                .filter(|entry| entry.is_prog)
                .and_then(|entry| entry.prog_id)
        })
    }

    /// Entry at `index` in registration order.
    pub fn kallsym(&self, index: usize) -> Option<Arc<SymbolEntry>> {
        self.current.read(|current| current.list.get(index).cloned())
    }

    pub fn len(&self) -> usize {
        self.current.read(|current| current.list.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
