//! Bounds-checked ELF header inspection over a live mapping.
//!
//! The image being walked belongs to the running process and is only
//! partially trusted: it may be truncated, corrupted, or unreadable past the
//! mapping's end. Every field access goes through [`read_field`], which is
//! the single gate deciding whether a raw memory read is safe to perform.

use crate::maps::MapEntry;

pub(crate) type ElfHalf = u16;
pub(crate) type ElfWord = u32;

#[cfg(target_pointer_width = "64")]
mod layout {
    pub type ElfOff = u64;
    pub type ElfAddr = u64;

    pub const EHDR_PHOFF: usize = 0x20;
    pub const EHDR_PHNUM: usize = 0x38;
    pub const PHDR_SIZE: usize = 0x38;
    pub const PHDR_TYPE: usize = 0x00;
    pub const PHDR_OFFSET: usize = 0x08;
    pub const PHDR_VADDR: usize = 0x10;
}

#[cfg(target_pointer_width = "32")]
mod layout {
    pub type ElfOff = u32;
    pub type ElfAddr = u32;

    pub const EHDR_PHOFF: usize = 0x1c;
    pub const EHDR_PHNUM: usize = 0x2c;
    pub const PHDR_SIZE: usize = 0x20;
    pub const PHDR_TYPE: usize = 0x00;
    pub const PHDR_OFFSET: usize = 0x04;
    pub const PHDR_VADDR: usize = 0x08;
}

pub(crate) use layout::*;

pub(crate) const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
pub(crate) const PT_LOAD: ElfWord = 1;

/// Reads a `T`-sized field at `addr`, but only if the entry is readable, the
/// whole of `[addr, addr + size)` lies inside `[entry.start, entry.end)`
/// without wrapping, and `addr` is aligned to the field size. Anything else
/// is a denied read, never an attempted one.
pub(crate) fn read_field<T: Copy>(entry: &MapEntry, addr: usize) -> Option<T> {
    let size = std::mem::size_of::<T>();
    if !entry.is_read || addr < entry.start {
        return None;
    }
    let read_end = addr.checked_add(size)?;
    if read_end > entry.end {
        return None;
    }
    if addr & (size - 1) != 0 {
        return None;
    }
    // Safety: the range is readable process memory (inside a mapping the
    // kernel reported as readable) and addr is aligned for T.
    Some(unsafe { (addr as *const T).read() })
}

/// Whether the mapping starts with the ELF magic. A pure byte comparison
/// over a bounds-checked range; no header interpretation happens here.
pub(crate) fn valid_elf(entry: &MapEntry) -> bool {
    match read_field::<u32>(entry, entry.start) {
        Some(word) => word == ElfWord::from_ne_bytes(ELF_MAGIC),
        None => false,
    }
}

fn load_bias(entry: &MapEntry, file_offset: usize) -> Option<usize> {
    let base = entry.start;
    let phnum = read_field::<ElfHalf>(entry, base.checked_add(EHDR_PHNUM)?)?;
    let phoff = read_field::<ElfOff>(entry, base.checked_add(EHDR_PHOFF)?)?;

    let mut addr = base.checked_add(phoff as usize)?;
    for _ in 0..phnum {
        let p_type = read_field::<ElfWord>(entry, addr.checked_add(PHDR_TYPE)?)?;
        let p_offset = read_field::<ElfOff>(entry, addr.checked_add(PHDR_OFFSET)?)?;
        // The loadable segment whose file offset equals the mapping's file
        // offset is the one the mapping was created from.
        if p_type == PT_LOAD && p_offset as usize == file_offset {
            let p_vaddr = read_field::<ElfAddr>(entry, addr.checked_add(PHDR_VADDR)?)?;
            return Some(p_vaddr as usize);
        }
        addr = addr.checked_add(PHDR_SIZE)?;
    }
    None
}

/// Walks the program headers of a validated image and returns the virtual
/// address of the loadable segment backing this mapping. Any denied read or
/// missing match degrades to a zero bias.
pub(crate) fn read_load_bias(entry: &MapEntry) -> usize {
    load_bias(entry, entry.offset).unwrap_or(0)
}

/// Same walk, but matching the file offset of a sibling mapping. Used when
/// a split r-x mapping recovers its bias through the r-- mapping that holds
/// the header.
pub(crate) fn read_load_bias_for(entry: &MapEntry, file_offset: usize) -> usize {
    load_bias(entry, file_offset).unwrap_or(0)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::maps::ElfState;

    /// A fake in-process image: word-aligned backing storage whose live
    /// address range stands in for a mapping, so the gated reads exercise
    /// real memory.
    pub(crate) struct FakeImage {
        buf: Vec<u64>,
    }

    impl FakeImage {
        pub(crate) fn new(size: usize) -> Self {
            assert_eq!(size % 8, 0);
            FakeImage { buf: vec![0; size / 8] }
        }

        pub(crate) fn base(&self) -> usize {
            self.buf.as_ptr() as usize
        }

        pub(crate) fn len(&self) -> usize {
            self.buf.len() * 8
        }

        pub(crate) fn write(&mut self, off: usize, bytes: &[u8]) {
            let buf = unsafe {
                std::slice::from_raw_parts_mut(self.buf.as_mut_ptr() as *mut u8, self.len())
            };
            buf[off..off + bytes.len()].copy_from_slice(bytes);
        }

        /// Writes an ELF header declaring `phnum` program headers at `phoff`.
        pub(crate) fn write_ehdr(&mut self, phoff: usize, phnum: u16) {
            self.write(0, &ELF_MAGIC);
            self.write(EHDR_PHOFF, &(phoff as ElfOff).to_ne_bytes());
            self.write(EHDR_PHNUM, &phnum.to_ne_bytes());
        }

        pub(crate) fn write_phdr(&mut self, phoff: usize, idx: usize, p_type: u32, p_offset: usize, p_vaddr: usize) {
            let at = phoff + idx * PHDR_SIZE;
            self.write(at + PHDR_TYPE, &p_type.to_ne_bytes());
            self.write(at + PHDR_OFFSET, &(p_offset as ElfOff).to_ne_bytes());
            self.write(at + PHDR_VADDR, &(p_vaddr as ElfAddr).to_ne_bytes());
        }

        pub(crate) fn entry(&self, file_offset: usize) -> MapEntry {
            MapEntry {
                start: self.base(),
                end: self.base() + self.len(),
                offset: file_offset,
                is_read: true,
                is_exec: false,
                name: "/lib/fake.so".to_owned(),
                elf_start_offset: 0,
                elf: ElfState::Unparsed,
            }
        }
    }

    #[test]
    fn read_gate_denies_out_of_range_and_misaligned() {
        let img = FakeImage::new(0x100);
        let entry = img.entry(0);

        // below the region
        assert!(read_field::<u32>(&entry, entry.start.wrapping_sub(4)).is_none());
        // crosses the end
        assert!(read_field::<u64>(&entry, entry.end - 4).is_none());
        // at the very end
        assert!(read_field::<u8>(&entry, entry.end).is_none());
        // misaligned
        assert!(read_field::<u64>(&entry, entry.start + 4).is_none());
        assert!(read_field::<u16>(&entry, entry.start + 1).is_none());
        // in range and aligned
        assert!(read_field::<u64>(&entry, entry.start).is_some());
        assert!(read_field::<u32>(&entry, entry.end - 4).is_some());
    }

    #[test]
    fn read_gate_denies_unreadable_entry() {
        let img = FakeImage::new(0x100);
        let mut entry = img.entry(0);
        entry.is_read = false;
        assert!(read_field::<u32>(&entry, entry.start).is_none());
    }

    #[test]
    fn wrong_magic_is_never_valid() {
        let mut img = FakeImage::new(0x100);
        img.write(0, b"\x7fELG");
        let mut entry = img.entry(0);
        assert!(!valid_elf(&entry));

        entry.ensure_parsed();
        assert_eq!(entry.elf, ElfState::Parsed { valid: false, load_bias: 0 });
    }

    #[test]
    fn bias_comes_from_first_matching_load_segment() {
        let phoff = 0x40;
        let mut img = FakeImage::new(0x400);
        img.write_ehdr(phoff, 3);
        // a note segment, a PT_LOAD with a non-matching offset, then the match
        img.write_phdr(phoff, 0, 4, 0x0, 0xdead);
        img.write_phdr(phoff, 1, PT_LOAD, 0x5000, 0xbeef);
        img.write_phdr(phoff, 2, PT_LOAD, 0x1000, 0x401000);

        let entry = img.entry(0x1000);
        assert!(valid_elf(&entry));
        assert_eq!(read_load_bias(&entry), 0x401000);
    }

    #[test]
    fn scan_stops_at_first_match() {
        let phoff = 0x40;
        let mut img = FakeImage::new(0x400);
        img.write_ehdr(phoff, 2);
        img.write_phdr(phoff, 0, PT_LOAD, 0x1000, 0x111000);
        img.write_phdr(phoff, 1, PT_LOAD, 0x1000, 0x222000);

        let entry = img.entry(0x1000);
        assert_eq!(read_load_bias(&entry), 0x111000);
    }

    #[test]
    fn no_matching_segment_means_zero_bias() {
        let phoff = 0x40;
        let mut img = FakeImage::new(0x400);
        img.write_ehdr(phoff, 1);
        img.write_phdr(phoff, 0, PT_LOAD, 0x5000, 0xbeef);

        let entry = img.entry(0x1000);
        assert_eq!(read_load_bias(&entry), 0);
    }

    #[test]
    fn truncated_phdr_table_means_zero_bias() {
        // header declares more phdrs than fit in the mapping; the walk runs
        // off the end, the gate denies the read, and the bias degrades to 0
        let mut img = FakeImage::new(0x100);
        img.write_ehdr(0x40, 64);
        img.write_phdr(0x40, 0, 4, 0, 0);

        let entry = img.entry(0x1000);
        assert_eq!(read_load_bias(&entry), 0);
    }

    #[test]
    fn phoff_outside_mapping_means_zero_bias() {
        let mut img = FakeImage::new(0x100);
        img.write_ehdr(0x100000, 1);

        let entry = img.entry(0);
        assert_eq!(read_load_bias(&entry), 0);
    }
}
