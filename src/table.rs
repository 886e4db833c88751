//! The mapping table and the PC resolution algorithm.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::elf;
use crate::maps::{self, MapEntry, MapError};
use crate::source::{MapSource, ProcSelfMaps};

/// A resolved instruction pointer: the owning module and the file-relative
/// offset to look symbols up with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPc {
    /// backing file of the containing mapping, empty for anonymous regions
    pub name: String,
    /// file offset of the containing mapping
    pub offset: usize,
    /// file offset at which the module's ELF image actually starts; nonzero
    /// only when the bias was borrowed from a split read-only sibling
    pub elf_start_offset: usize,
    /// `pc - start + offset + load_bias`
    pub rel_pc: usize,
}

struct Inner {
    entries: BTreeMap<usize, MapEntry>,
    source: Box<dyn MapSource>,
}

impl Inner {
    fn refresh(&mut self) -> Result<(), MapError> {
        let text = self
            .source
            .read_maps()
            .map_err(|source| MapError::Source { source })?;
        // Parse everything before inserting anything, so a malformed line
        // leaves the table exactly as it was.
        let parsed = maps::parse_maps(&text)?;
        for entry in parsed {
            // An already-known start address keeps its existing entry; its
            // cached ELF state survives the refresh.
            self.entries.entry(entry.start).or_insert(entry);
        }
        debug!(entries = self.entries.len(), "refreshed memory maps");
        Ok(())
    }

    /// Floor lookup: the entry with the greatest `start <= pc`, if `pc` is
    /// inside its range.
    fn find(&self, pc: usize) -> Option<usize> {
        self.entries
            .range(..=pc)
            .next_back()
            .and_then(|(start, entry)| (pc < entry.end).then_some(*start))
    }
}

/// Ordered table of the process's memory mappings, refreshed on lookup miss.
///
/// All lookups and refreshes serialize behind one lock, so concurrent
/// unwinder threads never observe a partially-initialized entry.
pub struct MapTable {
    inner: Mutex<Inner>,
}

impl Default for MapTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MapTable {
    /// A table over the current process, backed by `/proc/self/maps`.
    pub fn new() -> Self {
        Self::with_source(ProcSelfMaps)
    }

    pub fn with_source(source: impl MapSource + 'static) -> Self {
        MapTable {
            inner: Mutex::new(Inner {
                entries: BTreeMap::new(),
                source: Box::new(source),
            }),
        }
    }

    /// Reads the maps source and merges new regions into the table. Useful
    /// to warm the table before a crash handler needs it.
    pub fn refresh(&self) -> Result<(), MapError> {
        self.inner.lock().refresh()
    }

    /// Resolves a PC to its containing mapping and file-relative offset.
    ///
    /// A miss triggers at most one refresh of the table, to pick up regions
    /// mapped after the table was last read. Returns `None` if the PC is in
    /// no known region even after that.
    pub fn resolve(&self, pc: usize) -> Option<ResolvedPc> {
        let mut inner = self.inner.lock();

        let mut key = inner.find(pc);
        if key.is_none() {
            if let Err(err) = inner.refresh() {
                warn!("memory map refresh failed: {err}");
            }
            key = inner.find(pc);
        }
        let key = key?;

        let entry = inner.entries.get_mut(&key)?;
        entry.ensure_parsed();
        let start = entry.start;
        let offset = entry.offset;
        let name = entry.name.clone();
        let bias = entry.load_bias();
        let valid = entry.is_valid_elf();
        let elf_start_offset = entry.elf_start_offset;

        // A read-execute mapping of a split pair does not start with the ELF
        // header; its bias has to come from the read-only sibling just below
        // it, which does.
        if !valid {
            if let Some(resolved) = resolve_via_sibling(&mut inner, pc, key) {
                return Some(resolved);
            }
        }

        Some(ResolvedPc {
            name,
            offset,
            elf_start_offset,
            rel_pc: rel_pc(pc, start, offset, bias),
        })
    }
}

/// Attributes the PC through the immediate predecessor mapping, if the pair
/// looks like the loader's split r--/r-x layout of one file.
fn resolve_via_sibling(inner: &mut Inner, pc: usize, key: usize) -> Option<ResolvedPc> {
    let (start, offset, name) = {
        let entry = inner.entries.get(&key)?;
        (entry.start, entry.offset, entry.name.clone())
    };

    let prev_key = inner.entries.range(..key).next_back().map(|(k, _)| *k)?;
    {
        let prev = inner.entries.get(&prev_key)?;
        if !prev.is_read || prev.is_exec || prev.offset >= offset || prev.name != name {
            return None;
        }
    }

    let prev = inner.entries.get_mut(&prev_key)?;
    prev.ensure_parsed();
    if !prev.is_valid_elf() {
        return None;
    }
    let prev_offset = prev.offset;
    // Match the executable mapping's own file offset against the sibling's
    // program headers, so the bias belongs to the segment being resolved.
    let bias = elf::read_load_bias_for(prev, offset);

    let entry = inner.entries.get_mut(&key)?;
    entry.elf_start_offset = prev_offset;

    Some(ResolvedPc {
        name,
        offset,
        elf_start_offset: prev_offset,
        rel_pc: rel_pc(pc, start, offset, bias),
    })
}

fn rel_pc(pc: usize, start: usize, offset: usize, bias: usize) -> usize {
    pc.wrapping_sub(start)
        .wrapping_add(offset)
        .wrapping_add(bias)
}
