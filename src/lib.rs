//! Resolves a raw instruction pointer, sampled while unwinding a live
//! process, into the memory mapping that contains it plus the file-relative
//! offset usable for symbol lookup ("offset 0x1234 into libfoo.so").
//!
//! The table is built from the process's own memory map and the load bias of
//! each mapped ELF image is recovered by walking its program headers directly
//! in memory, with every access bounds- and alignment-checked so that a
//! corrupted or hostile image can never fault the caller. Split
//! read-only/read-execute mapping pairs produced by modern loaders are
//! recognized and attributed to the read-only sibling that holds the header.

mod elf;
pub mod maps;
pub mod source;
pub mod table;

pub use maps::{MapEntry, MapError};
pub use source::{MapSource, ProcSelfMaps};
pub use table::{MapTable, ResolvedPc};
