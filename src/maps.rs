//! Parsing of the kernel's per-process memory map into [`MapEntry`] records.
//!
//! Example of a `/proc/self/maps` entry:
//! 563b0178b000-563b01807000 r--p 00000000 00:40 3659174697971092           /home/myuser/code/ayatest/target/debug/ayatest
//! 563b01807000-563b01c4b000 r-xp 0007c000 00:40 3659174697971092           /home/myuser/code/ayatest/target/debug/ayatest
//! 7f38911ff000-7f38913ff000 rw-p 00000000 00:00 0
//! 7f3892fbc000-7f3892fbd000 r--p 00000000 08:20 42625                      /usr/lib/x86_64-linux-gnu/ld-2.31.so
//! 7f3892fbd000-7f3892fe0000 r-xp 00001000 08:20 42625                      /usr/lib/x86_64-linux-gnu/ld-2.31.so

use std::io;

use thiserror::Error;

use crate::elf;

/// Lazy ELF parse state of a mapping. Transitions from `Unparsed` to
/// `Parsed` exactly once, under the table lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ElfState {
    Unparsed,
    Parsed { valid: bool, load_bias: usize },
}

/// One contiguous region of the process address space.
#[derive(Debug)]
pub struct MapEntry {
    /// avma range, `start < end`
    pub start: usize,
    pub end: usize,
    /// offset into the backing file at which this region begins
    pub offset: usize,
    pub is_read: bool,
    pub is_exec: bool,
    /// backing file path, empty for anonymous regions
    pub name: String,
    /// file offset of the read-only sibling this entry borrowed its load
    /// bias from, for split r--/r-x mapping pairs
    pub elf_start_offset: usize,
    pub(crate) elf: ElfState,
}

impl MapEntry {
    /// Validates the region as an ELF image and computes its load bias, once.
    /// Subsequent calls are no-ops.
    pub(crate) fn ensure_parsed(&mut self) {
        if let ElfState::Parsed { .. } = self.elf {
            return;
        }
        let valid = elf::valid_elf(self);
        let load_bias = if valid { elf::read_load_bias(self) } else { 0 };
        self.elf = ElfState::Parsed { valid, load_bias };
    }

    pub(crate) fn is_valid_elf(&self) -> bool {
        matches!(self.elf, ElfState::Parsed { valid: true, .. })
    }

    pub(crate) fn load_bias(&self) -> usize {
        match self.elf {
            ElfState::Parsed { load_bias, .. } => load_bias,
            ElfState::Unparsed => 0,
        }
    }
}

/// Error type for reading and parsing the process memory map
#[derive(Debug, Error)]
pub enum MapError {
    /// The maps source could not be read at all
    #[error("Can not read memory maps")]
    Source {
        #[source]
        source: io::Error,
    },
    /// Failed to parse the address range of a line
    #[error("Can not parse address: Line: {line}")]
    InvalidAddress {
        /// The line which could not be parsed
        line: String,
    },
    /// Failed to parse the permission string of a line
    #[error("Can not parse permissions: Line: {line}")]
    InvalidPermissions {
        /// The line which could not be parsed
        line: String,
    },
    /// Failed to parse the file offset of a line
    #[error("Can not parse offset: Line: {line}")]
    InvalidOffset {
        /// The line which could not be parsed
        line: String,
    },
    /// Failed to parse device data of a line
    #[error("Can not parse device: Line: {line}")]
    InvalidDevice {
        /// The line which could not be parsed
        line: String,
    },
    /// Failed to parse inode data of a line
    #[error("Can not parse inode: Line: {line}")]
    InvalidInode {
        /// The line which could not be parsed
        line: String,
    },
}

fn parse_line(line: &str) -> Result<MapEntry, MapError> {
    let mut parts = line.splitn(6, ' ');
    let address = parts
        .next()
        .ok_or_else(|| MapError::InvalidAddress { line: line.to_owned() })?;
    let mut address_parts = address.split('-');
    let start = address_parts
        .next()
        .and_then(|o| usize::from_str_radix(o, 16).ok())
        .ok_or_else(|| MapError::InvalidAddress { line: line.to_owned() })?;
    let end = address_parts
        .next()
        .and_then(|o| usize::from_str_radix(o, 16).ok())
        .ok_or_else(|| MapError::InvalidAddress { line: line.to_owned() })?;
    if start >= end {
        return Err(MapError::InvalidAddress { line: line.to_owned() });
    }
    let perms = parts
        .next()
        .filter(|p| p.len() >= 3)
        .ok_or_else(|| MapError::InvalidPermissions { line: line.to_owned() })?;
    let offset = parts
        .next()
        .and_then(|o| usize::from_str_radix(o, 16).ok())
        .ok_or_else(|| MapError::InvalidOffset { line: line.to_owned() })?;
    let _dev = parts
        .next()
        .ok_or_else(|| MapError::InvalidDevice { line: line.to_owned() })?;
    let _inode = parts
        .next()
        .ok_or_else(|| MapError::InvalidInode { line: line.to_owned() })?;
    let name = parts.next().unwrap_or("").trim().to_owned();

    // Only 'r' in position 0 and 'x' in position 2 are interpreted.
    let is_read = perms.as_bytes()[0] == b'r';
    let is_exec = perms.as_bytes()[2] == b'x';

    // An unreadable region can never be validated as an ELF image, so it is
    // settled up front with a zero load bias.
    let elf = if is_read {
        ElfState::Unparsed
    } else {
        ElfState::Parsed { valid: false, load_bias: 0 }
    };

    Ok(MapEntry {
        start,
        end,
        offset,
        is_read,
        is_exec,
        name,
        elf_start_offset: 0,
        elf,
    })
}

/// Parses a whole maps text. Any malformed line fails the whole parse and
/// nothing is returned, so a caller never commits a partial refresh.
pub(crate) fn parse_maps(text: &str) -> Result<Vec<MapEntry>, MapError> {
    text.lines().map(parse_line).collect()
}
