//! Builder for synthetic ELF images used by the unit tests.

use object::elf::{SHT_REL, SHT_STRTAB, SHT_SYMTAB};

struct Section {
    name_off: u32,
    sh_type: u32,
    data: Vec<u8>,
}

struct Symbol {
    name_off: u32,
    info: u8,
    shndx: u16,
    value: u64,
}

/// Assembles a minimal but valid 64-bit LE relocatable ELF image.
///
/// All strings (section and symbol names) share one table, which is also
/// installed as the section header string table - the same layout the
/// reader assumes for the objects it consumes.
pub(crate) struct ElfBuilder {
    strings: Vec<u8>,
    sections: Vec<Section>,
    symbols: Vec<Symbol>,
}

impl ElfBuilder {
    pub(crate) fn new() -> Self {
        Self {
            strings: vec![0],
            sections: vec![Section {
                name_off: 0,
                sh_type: 0,
                data: Vec::new(),
            }],
            symbols: Vec::new(),
        }
    }

    fn add_string(&mut self, s: &str) -> u32 {
        let off = self.strings.len() as u32;
        self.strings.extend_from_slice(s.as_bytes());
        self.strings.push(0);
        off
    }

    /// Appends a section and returns its index.
    pub(crate) fn section(&mut self, name: &str, sh_type: u32, data: &[u8]) -> usize {
        let name_off = self.add_string(name);
        self.sections.push(Section {
            name_off,
            sh_type,
            data: data.to_vec(),
        });
        self.sections.len() - 1
    }

    /// Appends a symbol living in the given section.
    pub(crate) fn symbol(&mut self, name: &str, section: usize, st_type: u8, value: u64) {
        let name_off = self.add_string(name);
        self.symbols.push(Symbol {
            name_off,
            info: st_type & 0x0f,
            shndx: section as u16,
            value,
        });
    }

    pub(crate) fn build(mut self) -> Vec<u8> {
        let mut symtab = Vec::new();
        for sym in &self.symbols {
            symtab.extend_from_slice(&sym.name_off.to_le_bytes());
            symtab.push(sym.info);
            symtab.push(0); // st_other
            symtab.extend_from_slice(&sym.shndx.to_le_bytes());
            symtab.extend_from_slice(&sym.value.to_le_bytes());
            symtab.extend_from_slice(&0u64.to_le_bytes()); // st_size
        }
        let symtab_name = self.add_string(".symtab");
        self.sections.push(Section {
            name_off: symtab_name,
            sh_type: SHT_SYMTAB,
            data: symtab,
        });

        let strtab_name = self.add_string(".strtab");
        let shstrndx = self.sections.len() as u16;
        self.sections.push(Section {
            name_off: strtab_name,
            sh_type: SHT_STRTAB,
            data: self.strings.clone(),
        });

        const EHSIZE: usize = 64;
        const SHENTSIZE: usize = 64;

        let mut out = vec![0u8; EHSIZE];
        let mut offsets = Vec::with_capacity(self.sections.len());
        for section in &self.sections {
            while out.len() % 8 != 0 {
                out.push(0);
            }
            offsets.push(out.len() as u64);
            out.extend_from_slice(&section.data);
        }
        while out.len() % 8 != 0 {
            out.push(0);
        }
        let shoff = out.len() as u64;

        for (i, section) in self.sections.iter().enumerate() {
            if i == 0 {
                out.extend_from_slice(&[0u8; SHENTSIZE]);
                continue;
            }
            let entsize: u64 = match section.sh_type {
                SHT_SYMTAB => 24,
                SHT_REL => 16,
                _ => 0,
            };
            out.extend_from_slice(&section.name_off.to_le_bytes());
            out.extend_from_slice(&section.sh_type.to_le_bytes());
            out.extend_from_slice(&0u64.to_le_bytes()); // sh_flags
            out.extend_from_slice(&0u64.to_le_bytes()); // sh_addr
            out.extend_from_slice(&offsets[i].to_le_bytes()); // sh_offset
            out.extend_from_slice(&(section.data.len() as u64).to_le_bytes()); // sh_size
            out.extend_from_slice(&0u32.to_le_bytes()); // sh_link
            out.extend_from_slice(&0u32.to_le_bytes()); // sh_info
            out.extend_from_slice(&8u64.to_le_bytes()); // sh_addralign
            out.extend_from_slice(&entsize.to_le_bytes()); // sh_entsize
        }

        // ELF header
        out[0..4].copy_from_slice(b"\x7fELF");
        out[4] = 2; // ELFCLASS64
        out[5] = 1; // ELFDATA2LSB
        out[6] = 1; // EV_CURRENT
        out[16..18].copy_from_slice(&1u16.to_le_bytes()); // e_type = ET_REL
        out[18..20].copy_from_slice(&247u16.to_le_bytes()); // e_machine = EM_BPF
        out[20..24].copy_from_slice(&1u32.to_le_bytes()); // e_version
        out[40..48].copy_from_slice(&shoff.to_le_bytes()); // e_shoff
        out[52..54].copy_from_slice(&(EHSIZE as u16).to_le_bytes()); // e_ehsize
        out[58..60].copy_from_slice(&(SHENTSIZE as u16).to_le_bytes()); // e_shentsize
        out[60..62].copy_from_slice(&(self.sections.len() as u16).to_le_bytes()); // e_shnum
        out[62..64].copy_from_slice(&shstrndx.to_le_bytes()); // e_shstrndx

        out
    }
}
