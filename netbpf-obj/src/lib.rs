//! Parsing, validation and relocation of network BPF ELF relocatable
//! objects.
//!
//! A BPF object carries its maps and programs in well-known sections:
//!
//! - `license` - NUL-terminated license string (mandatory);
//! - `bpfloader_min_ver` / `bpfloader_max_ver` - little-endian u32 loader
//!   version gates;
//! - `maps` - an array of fixed-size [`MapDef`] records, one per map
//!   symbol;
//! - `progs` - an array of fixed-size [`ProgDef`] records, one per
//!   `<program>_def` symbol;
//! - one program section per BPF program, named by a recognized prefix
//!   (`cgroupskb/`, `xdp/`, ...), optionally followed by a `.rel<section>`
//!   companion holding map-fd relocations.
//!
//! This crate is purely in-memory: it decodes those sections, pairs
//! programs with their definitions and rewrites `LD_IMM_DW` immediates
//! once map file descriptors are known. Talking to the kernel is the
//! loader's job.

pub mod elf;
pub mod generated;
pub mod maps;
pub mod programs;
pub mod relocation;
#[cfg(test)]
pub(crate) mod test_utils;

pub use elf::{ElfFile, ParseError};
pub use maps::{MapDef, MAP_DEF_SIZE};
pub use programs::{read_code_sections, section_type, CodeSection, ProgDef, PROG_DEF_SIZE};
pub use relocation::apply_map_relocations;

/// The loadability gates shared by map and program definitions.
///
/// Kernel and loader version ranges are half-open: `[min, max)`. Any
/// matching build-flavor or architecture ignore skips the definition.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Constraints {
    pub bpfloader_min_ver: u32,
    pub bpfloader_max_ver: u32,
    pub min_kver: u32,
    pub max_kver: u32,
    pub ignore_on_arm32: bool,
    pub ignore_on_aarch64: bool,
    pub ignore_on_x86_32: bool,
    pub ignore_on_x86_64: bool,
    pub ignore_on_riscv64: bool,
    pub ignore_on_eng: bool,
    pub ignore_on_user: bool,
    pub ignore_on_userdebug: bool,
}
