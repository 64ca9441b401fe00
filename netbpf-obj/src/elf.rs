//! Random-access decoding of 64-bit little-endian ELF relocatable objects.
//!
//! BPF objects are small enough to slurp into memory, so the reader borrows
//! a byte buffer and hands out sub-slices. Every access is bounds-checked
//! against the file and the owning section; nothing is assumed about input
//! beyond the fixed-size headers.

use log::debug;
use object::elf::{FileHeader64, SectionHeader64, Sym64, ELFCLASS64, ELFDATA2LSB, SHT_NOBITS, SHT_SYMTAB};
use object::{pod, LittleEndian as LE};
use thiserror::Error;

/// The error type returned when decoding an object file fails.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("file too short for an ELF header")]
    FileHeader,

    #[error("not a little-endian ELF64 object")]
    UnsupportedFormat,

    #[error("section header table escapes the file")]
    SectionTable,

    #[error("section index {index} out of bounds")]
    SectionIndex { index: usize },

    #[error("section `{name}` not found")]
    SectionNotFound { name: String },

    #[error("no section of type {sh_type} found")]
    SectionTypeNotFound { sh_type: u32 },

    #[error("section `{section}` data escapes the file")]
    SectionOutOfBounds { section: usize },

    #[error("section `{name}` too short: {size} bytes")]
    SectionTooShort { name: String, size: usize },

    #[error("section `{name}` size {size} is not a multiple of {entry_size}")]
    MissizedSection {
        name: String,
        size: usize,
        entry_size: usize,
    },

    #[error("malformed string at offset {offset}")]
    BadString { offset: usize },

    #[error("symbol index {index} out of bounds")]
    SymbolIndex { index: usize },

    #[error("section `{name}` has no function symbol")]
    MissingFunctionSymbol { name: String },

    #[error("section `{name}`: {symbols} symbols for {defs} definitions")]
    DefCountMismatch {
        name: String,
        symbols: usize,
        defs: usize,
    },
}

/// A parsed view over one ELF relocatable object.
#[derive(Debug)]
pub struct ElfFile<'data> {
    data: &'data [u8],
    sections: &'data [SectionHeader64<LE>],
    shstrtab: &'data [u8],
}

impl<'data> ElfFile<'data> {
    /// Decodes the ELF and section headers. Section payloads are read lazily.
    pub fn parse(data: &'data [u8]) -> Result<Self, ParseError> {
        let (header, _) =
            pod::from_bytes::<FileHeader64<LE>>(data).map_err(|()| ParseError::FileHeader)?;
        let ident = &header.e_ident;
        if ident.magic != *b"\x7fELF"
            || ident.class != ELFCLASS64
            || ident.data != ELFDATA2LSB
        {
            return Err(ParseError::UnsupportedFormat);
        }

        let shentsize = header.e_shentsize.get(LE) as usize;
        if shentsize != size_of::<SectionHeader64<LE>>() {
            return Err(ParseError::SectionTable);
        }
        let shoff = header.e_shoff.get(LE) as usize;
        let shnum = header.e_shnum.get(LE) as usize;
        let end = shnum
            .checked_mul(shentsize)
            .and_then(|len| shoff.checked_add(len))
            .ok_or(ParseError::SectionTable)?;
        let table = data.get(shoff..end).ok_or(ParseError::SectionTable)?;
        let (sections, _) = pod::slice_from_bytes::<SectionHeader64<LE>>(table, shnum)
            .map_err(|()| ParseError::SectionTable)?;

        let mut elf = Self {
            data,
            sections,
            shstrtab: &[],
        };
        elf.shstrtab = elf.section_data(header.e_shstrndx.get(LE) as usize)?;
        Ok(elf)
    }

    /// Number of section headers, including the null entry.
    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    /// The raw bytes of the section at `index`.
    pub fn section_data(&self, index: usize) -> Result<&'data [u8], ParseError> {
        let shdr = self
            .sections
            .get(index)
            .ok_or(ParseError::SectionIndex { index })?;
        if shdr.sh_type.get(LE) == SHT_NOBITS {
            return Ok(&[]);
        }
        let offset = shdr.sh_offset.get(LE) as usize;
        let size = shdr.sh_size.get(LE) as usize;
        offset
            .checked_add(size)
            .and_then(|end| self.data.get(offset..end))
            .ok_or(ParseError::SectionOutOfBounds { section: index })
    }

    /// Resolves a NUL-terminated string from the section header string
    /// table. Both section names and symbol names live there in the objects
    /// this loader consumes.
    pub fn string_at(&self, offset: usize) -> Result<&'data str, ParseError> {
        let tail = self
            .shstrtab
            .get(offset..)
            .ok_or(ParseError::BadString { offset })?;
        let nul = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or(ParseError::BadString { offset })?;
        std::str::from_utf8(&tail[..nul]).map_err(|_| ParseError::BadString { offset })
    }

    /// The whole section header string table.
    pub fn section_header_strtab(&self) -> &'data [u8] {
        self.shstrtab
    }

    /// Name of the section at `index`.
    pub fn section_name(&self, index: usize) -> Result<&'data str, ParseError> {
        let shdr = self
            .sections
            .get(index)
            .ok_or(ParseError::SectionIndex { index })?;
        self.string_at(shdr.sh_name.get(LE) as usize)
    }

    /// Index of the first section whose name is exactly `name`.
    pub fn section_index_by_name(&self, name: &str) -> Option<usize> {
        self.sections.iter().position(|shdr| {
            self.string_at(shdr.sh_name.get(LE) as usize)
                .map(|n| n == name)
                .unwrap_or(false)
        })
    }

    /// The bytes of the first section named `name`.
    pub fn section_by_name(&self, name: &str) -> Result<&'data [u8], ParseError> {
        let index = self
            .section_index_by_name(name)
            .ok_or_else(|| ParseError::SectionNotFound { name: name.into() })?;
        self.section_data(index)
    }

    /// The bytes of the first section with the given `sh_type`.
    pub fn section_by_type(&self, sh_type: u32) -> Result<&'data [u8], ParseError> {
        let index = self
            .sections
            .iter()
            .position(|shdr| shdr.sh_type.get(LE) == sh_type)
            .ok_or(ParseError::SectionTypeNotFound { sh_type })?;
        self.section_data(index)
    }

    /// Decodes the first 4 bytes of the named section as a little-endian
    /// u32. The section is usually padded out beyond that by alignment.
    pub fn section_u32(&self, name: &str) -> Result<u32, ParseError> {
        let data = self.section_by_name(name)?;
        let bytes: [u8; 4] =
            data.get(..4)
                .and_then(|b| b.try_into().ok())
                .ok_or_else(|| ParseError::SectionTooShort {
                    name: name.into(),
                    size: data.len(),
                })?;
        let value = u32::from_le_bytes(bytes);
        debug!("section {name} value is {value} [{value:#x}]");
        Ok(value)
    }

    /// The symbol table, optionally stable-sorted by `st_value`.
    pub fn symbols(&self, sorted: bool) -> Result<Vec<Sym64<LE>>, ParseError> {
        let data = self.section_by_type(SHT_SYMTAB)?;
        let entry_size = size_of::<Sym64<LE>>();
        if data.len() % entry_size != 0 {
            return Err(ParseError::MissizedSection {
                name: ".symtab".into(),
                size: data.len(),
                entry_size,
            });
        }
        let count = data.len() / entry_size;
        let (symbols, _) = pod::slice_from_bytes::<Sym64<LE>>(data, count)
            .map_err(|()| ParseError::MissizedSection {
                name: ".symtab".into(),
                size: data.len(),
                entry_size,
            })?;
        let mut symbols = symbols.to_vec();
        if sorted {
            symbols.sort_by_key(|sym| sym.st_value.get(LE));
        }
        Ok(symbols)
    }

    /// The name of the symbol at `index`, in raw (unsorted) table order.
    pub fn symbol_name_by_index(&self, index: usize) -> Result<&'data str, ParseError> {
        let symbols = self.symbols(false)?;
        let sym = symbols
            .get(index)
            .ok_or(ParseError::SymbolIndex { index })?;
        self.string_at(sym.st_name.get(LE) as usize)
    }

    /// Names of all symbols living in the named section, in `st_value`
    /// order, optionally restricted to one `STT_*` symbol type.
    pub fn section_symbol_names(
        &self,
        section_name: &str,
        symbol_type: Option<u8>,
    ) -> Result<Vec<&'data str>, ParseError> {
        let section_index = self.section_index_by_name(section_name).ok_or_else(|| {
            ParseError::SectionNotFound {
                name: section_name.into(),
            }
        })?;
        let mut names = Vec::new();
        for sym in self.symbols(true)? {
            if let Some(ty) = symbol_type {
                if sym.st_info & 0x0f != ty {
                    continue;
                }
            }
            if sym.st_shndx.get(LE) as usize == section_index {
                names.push(self.string_at(sym.st_name.get(LE) as usize)?);
            }
        }
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use object::elf::{SHT_PROGBITS, STT_FUNC, STT_OBJECT};

    use super::*;
    use crate::test_utils::ElfBuilder;

    #[test]
    fn test_rejects_short_file() {
        assert_matches!(ElfFile::parse(&[0x7f, b'E']), Err(ParseError::FileHeader));
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut image = ElfBuilder::new().build();
        image[0] = 0;
        assert_matches!(ElfFile::parse(&image), Err(ParseError::UnsupportedFormat));
    }

    #[test]
    fn test_rejects_32bit_class() {
        let mut image = ElfBuilder::new().build();
        image[4] = 1; // ELFCLASS32
        assert_matches!(ElfFile::parse(&image), Err(ParseError::UnsupportedFormat));
    }

    #[test]
    fn test_section_by_name_returns_exact_bytes() {
        let mut builder = ElfBuilder::new();
        builder.section("license", SHT_PROGBITS, b"Apache 2.0\0");
        builder.section("maps", SHT_PROGBITS, &[1, 2, 3, 4]);
        let image = builder.build();

        let elf = ElfFile::parse(&image).unwrap();
        assert_eq!(elf.section_by_name("license").unwrap(), b"Apache 2.0\0");
        assert_eq!(elf.section_by_name("maps").unwrap(), &[1, 2, 3, 4]);
        assert_matches!(
            elf.section_by_name("progs"),
            Err(ParseError::SectionNotFound { name }) if name == "progs"
        );
    }

    #[test]
    fn test_first_section_wins_on_duplicate_names() {
        let mut builder = ElfBuilder::new();
        builder.section("dup", SHT_PROGBITS, b"first");
        builder.section("dup", SHT_PROGBITS, b"second");
        let image = builder.build();

        let elf = ElfFile::parse(&image).unwrap();
        assert_eq!(elf.section_by_name("dup").unwrap(), b"first");
        assert_eq!(elf.section_index_by_name("dup"), Some(1));
    }

    #[test]
    fn test_section_u32_decodes_little_endian() {
        let mut builder = ElfBuilder::new();
        builder.section(
            "bpfloader_min_ver",
            SHT_PROGBITS,
            &[0x2a, 0x00, 0x00, 0x00, 0xff, 0xff, 0xff, 0xff],
        );
        builder.section("short", SHT_PROGBITS, &[1, 2]);
        let image = builder.build();

        let elf = ElfFile::parse(&image).unwrap();
        assert_eq!(elf.section_u32("bpfloader_min_ver").unwrap(), 42);
        assert_matches!(
            elf.section_u32("short"),
            Err(ParseError::SectionTooShort { size: 2, .. })
        );
        assert_matches!(
            elf.section_u32("absent"),
            Err(ParseError::SectionNotFound { .. })
        );
    }

    #[test]
    fn test_symbols_sorted_by_value() {
        let mut builder = ElfBuilder::new();
        let maps = builder.section("maps", SHT_PROGBITS, &[0; 256]);
        builder.symbol("map_b", maps, STT_OBJECT, 128);
        builder.symbol("map_a", maps, STT_OBJECT, 0);
        let image = builder.build();

        let elf = ElfFile::parse(&image).unwrap();
        let names = elf.section_symbol_names("maps", None).unwrap();
        assert_eq!(names, vec!["map_a", "map_b"]);

        // raw order is preserved for by-index lookups
        assert_eq!(elf.symbol_name_by_index(0).unwrap(), "map_b");
        assert_eq!(elf.symbol_name_by_index(1).unwrap(), "map_a");
        assert_matches!(
            elf.symbol_name_by_index(7),
            Err(ParseError::SymbolIndex { index: 7 })
        );
    }

    #[test]
    fn test_section_symbol_names_filters_by_type() {
        let mut builder = ElfBuilder::new();
        let progs = builder.section("cgroupskb/foo", SHT_PROGBITS, &[0; 16]);
        builder.symbol("foo", progs, STT_FUNC, 0);
        builder.symbol("foo_data", progs, STT_OBJECT, 8);
        let image = builder.build();

        let elf = ElfFile::parse(&image).unwrap();
        let funcs = elf
            .section_symbol_names("cgroupskb/foo", Some(STT_FUNC))
            .unwrap();
        assert_eq!(funcs, vec!["foo"]);
        let all = elf.section_symbol_names("cgroupskb/foo", None).unwrap();
        assert_eq!(all, vec!["foo", "foo_data"]);
    }

    #[test]
    fn test_section_by_type_finds_symtab() {
        let mut builder = ElfBuilder::new();
        let maps = builder.section("maps", SHT_PROGBITS, &[0; 8]);
        builder.symbol("m", maps, STT_OBJECT, 0);
        let image = builder.build();

        let elf = ElfFile::parse(&image).unwrap();
        let symtab = elf.section_by_type(SHT_SYMTAB).unwrap();
        assert_eq!(symtab.len(), size_of::<Sym64<LE>>());
        assert_matches!(
            elf.section_by_type(0x6fff_ffff),
            Err(ParseError::SectionTypeNotFound { .. })
        );
    }

    #[test]
    fn test_truncated_section_payload() {
        let mut builder = ElfBuilder::new();
        builder.section("license", SHT_PROGBITS, b"GPL\0");
        let mut image = builder.build();
        // Grow the recorded size of section 1 past the end of the file.
        let elf = ElfFile::parse(&image).unwrap();
        drop(elf);
        let shoff = u64::from_le_bytes(image[40..48].try_into().unwrap()) as usize;
        let sh_size_off = shoff + 64 + 32; // section 1, sh_size field
        image[sh_size_off..sh_size_off + 8].copy_from_slice(&u64::MAX.to_le_bytes());
        let elf = ElfFile::parse(&image).unwrap();
        assert_matches!(
            elf.section_by_name("license"),
            Err(ParseError::SectionOutOfBounds { section: 1 })
        );
    }
}
