//! Acquisition seam for the memory-map text.

use std::fs;
use std::io;

/// Provides the line-oriented maps text for the current process. The table
/// only ever consumes text through this trait, so tests (or embedders that
/// snapshot maps themselves) can supply their own.
pub trait MapSource: Send {
    fn read_maps(&self) -> io::Result<String>;
}

/// Reads `/proc/self/maps`.
pub struct ProcSelfMaps;

impl MapSource for ProcSelfMaps {
    fn read_maps(&self) -> io::Result<String> {
        fs::read_to_string("/proc/self/maps")
    }
}
