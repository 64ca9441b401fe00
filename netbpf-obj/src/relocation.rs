//! Map file-descriptor relocation.
//!
//! Programs reference maps through `LD_IMM_DW` (16-byte wide load)
//! instructions whose immediate is patched at load time with the kernel
//! file descriptor of the map named by the relocation's symbol. Only the
//! `imm` and `src_reg` fields of the first 8-byte half are touched.

use std::os::fd::RawFd;

use log::{error, warn};
use object::elf::Rel64;
use object::{pod, LittleEndian as LE};

use crate::{
    elf::{ElfFile, ParseError},
    generated::{BPF_DW, BPF_IMM, BPF_LD, BPF_PSEUDO_MAP_FD},
    programs::CodeSection,
};

pub(crate) const INS_SIZE: usize = 8;

/// Walks every code section's `.rel` companion and patches map references
/// with the descriptors in `map_fds`.
///
/// `map_fds` is indexed like the `maps` section symbols (sorted by
/// `st_value`); a `None` slot - a map skipped by the compatibility gate -
/// patches an invalid descriptor, mirroring the fact that any program
/// still referencing it is expected to be skipped as well.
pub fn apply_map_relocations(
    elf: &ElfFile<'_>,
    map_fds: &[Option<RawFd>],
    sections: &mut [CodeSection],
) -> Result<(), ParseError> {
    let map_names = match elf.section_symbol_names("maps", None) {
        Ok(names) => names,
        Err(ParseError::SectionNotFound { .. }) => return Ok(()),
        Err(e) => return Err(e),
    };

    for cs in sections.iter_mut() {
        let Some(rel_data) = cs.rel_data.as_deref() else {
            continue;
        };
        let count = rel_data.len() / size_of::<Rel64<LE>>();
        let (rels, _) = pod::slice_from_bytes::<Rel64<LE>>(rel_data, count)
            .map_err(|()| ParseError::MissizedSection {
                name: format!(".rel{}", cs.name),
                size: rel_data.len(),
                entry_size: size_of::<Rel64<LE>>(),
            })?;

        for rel in rels {
            let sym_index = (rel.r_info.get(LE) >> 32) as usize;
            let sym_name = elf.symbol_name_by_index(sym_index)?;
            let Some(map_index) = map_names.iter().position(|n| *n == sym_name) else {
                continue;
            };
            let fd = map_fds
                .get(map_index)
                .copied()
                .flatten()
                .unwrap_or(-1);
            apply_relocation(&mut cs.data, rel.r_offset.get(LE), fd);
        }
    }
    Ok(())
}

fn apply_relocation(data: &mut [u8], offset: u64, fd: RawFd) {
    let offset = offset as usize;
    if offset % INS_SIZE != 0 {
        warn!("misaligned relocation offset {offset}");
        return;
    }
    let Some(insn) = data.get_mut(offset..offset + INS_SIZE) else {
        warn!("relocation offset {offset} outside program");
        return;
    };
    if insn[0] != BPF_LD | BPF_IMM | BPF_DW {
        error!(
            "invalid relo for insn {}: code {:#x}",
            offset / INS_SIZE,
            insn[0]
        );
        return;
    }
    insn[1] = (insn[1] & 0x0f) | (BPF_PSEUDO_MAP_FD << 4);
    insn[4..8].copy_from_slice(&fd.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use object::elf::{SHT_PROGBITS, STT_OBJECT};

    use super::*;
    use crate::generated::{bpf_attach_type, bpf_prog_type};
    use crate::test_utils::ElfBuilder;

    const LD_IMM_DW: u8 = BPF_LD | BPF_IMM | BPF_DW;

    fn rel_entry(offset: u64, sym_index: u64) -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf[..8].copy_from_slice(&offset.to_le_bytes());
        // r_info: symbol in the high 32 bits, type (R_BPF_64_64 = 1) low
        buf[8..16].copy_from_slice(&((sym_index << 32) | 1).to_le_bytes());
        buf
    }

    fn code_section(data: Vec<u8>, rel_data: Vec<u8>) -> CodeSection {
        CodeSection {
            prog_type: bpf_prog_type::BPF_PROG_TYPE_CGROUP_SKB,
            attach_type: Some(bpf_attach_type::BPF_CGROUP_INET_INGRESS),
            name: "ingress_stats".into(),
            data,
            rel_data: Some(rel_data),
            prog_def: None,
        }
    }

    /// Object with two map symbols; symtab order differs from st_value
    /// order so the test catches index confusion between the two.
    fn reloc_object() -> Vec<u8> {
        let mut builder = ElfBuilder::new();
        let maps = builder.section("maps", SHT_PROGBITS, &[0u8; 256]);
        builder.symbol("map_late", maps, STT_OBJECT, 128); // symtab index 0
        builder.symbol("map_early", maps, STT_OBJECT, 0); // symtab index 1
        builder.build()
    }

    #[test]
    fn test_patches_imm_and_src_reg_only() {
        let image = reloc_object();
        let elf = ElfFile::parse(&image).unwrap();

        let mut insns = vec![0u8; 32];
        insns[0] = LD_IMM_DW;
        insns[1] = 0x01; // dst_reg = r1
        insns[2..4].copy_from_slice(&7i16.to_le_bytes()); // off, untouched
        let mut cs = [code_section(insns, rel_entry(0, 1).to_vec())];

        // sorted-by-st_value order: [map_early, map_late]
        let fds = [Some(42), Some(77)];
        apply_map_relocations(&elf, &fds, &mut cs).unwrap();

        let data = &cs[0].data;
        assert_eq!(data[0], LD_IMM_DW);
        assert_eq!(data[1], 0x01 | (BPF_PSEUDO_MAP_FD << 4));
        assert_eq!(i16::from_le_bytes(data[2..4].try_into().unwrap()), 7);
        // symtab index 1 is map_early, which sorted to fd slot 0
        assert_eq!(i32::from_le_bytes(data[4..8].try_into().unwrap()), 42);
        // the second half of the wide load and the next insn are untouched
        assert!(data[8..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_second_map_gets_its_own_fd() {
        let image = reloc_object();
        let elf = ElfFile::parse(&image).unwrap();

        let mut insns = vec![0u8; 24];
        insns[0] = LD_IMM_DW;
        let mut cs = [code_section(insns, rel_entry(0, 0).to_vec())];

        let fds = [Some(42), Some(77)];
        apply_map_relocations(&elf, &fds, &mut cs).unwrap();

        // symtab index 0 is map_late, which sorted to fd slot 1
        let data = &cs[0].data;
        assert_eq!(i32::from_le_bytes(data[4..8].try_into().unwrap()), 77);
    }

    #[test]
    fn test_non_wide_load_is_skipped() {
        let image = reloc_object();
        let elf = ElfFile::parse(&image).unwrap();

        let mut insns = vec![0u8; 16];
        insns[0] = 0xb7; // MOV64_IMM
        insns[1] = 0x02;
        let before = insns.clone();
        let mut cs = [code_section(insns, rel_entry(0, 1).to_vec())];

        apply_map_relocations(&elf, &[Some(42), Some(77)], &mut cs).unwrap();
        assert_eq!(cs[0].data, before);
    }

    #[test]
    fn test_misaligned_and_out_of_range_offsets_are_skipped() {
        let image = reloc_object();
        let elf = ElfFile::parse(&image).unwrap();

        let mut insns = vec![0u8; 16];
        insns[0] = LD_IMM_DW;
        let before = insns.clone();
        let mut rels = rel_entry(4, 1).to_vec();
        rels.extend_from_slice(&rel_entry(1024, 1));
        let mut cs = [code_section(insns, rels)];

        apply_map_relocations(&elf, &[Some(42), Some(77)], &mut cs).unwrap();
        assert_eq!(cs[0].data, before);
    }

    #[test]
    fn test_skipped_map_patches_invalid_fd() {
        let image = reloc_object();
        let elf = ElfFile::parse(&image).unwrap();

        let mut insns = vec![0u8; 16];
        insns[0] = LD_IMM_DW;
        let mut cs = [code_section(insns, rel_entry(0, 1).to_vec())];

        apply_map_relocations(&elf, &[None, Some(77)], &mut cs).unwrap();
        let data = &cs[0].data;
        assert_eq!(i32::from_le_bytes(data[4..8].try_into().unwrap()), -1);
    }

    #[test]
    fn test_unknown_symbol_index_is_an_error() {
        let image = reloc_object();
        let elf = ElfFile::parse(&image).unwrap();

        let mut insns = vec![0u8; 16];
        insns[0] = LD_IMM_DW;
        let mut cs = [code_section(insns, rel_entry(0, 9).to_vec())];

        assert!(apply_map_relocations(&elf, &[Some(42), Some(77)], &mut cs).is_err());
    }

    #[test]
    fn test_no_maps_section_is_a_no_op() {
        let builder = ElfBuilder::new();
        let image = builder.build();
        let elf = ElfFile::parse(&image).unwrap();

        let mut insns = vec![0u8; 16];
        insns[0] = LD_IMM_DW;
        let before = insns.clone();
        let mut cs = [code_section(insns, rel_entry(0, 0).to_vec())];
        apply_map_relocations(&elf, &[], &mut cs).unwrap();
        assert_eq!(cs[0].data, before);
    }
}
