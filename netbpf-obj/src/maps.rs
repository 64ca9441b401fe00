//! Map definitions embedded in the `maps` section.

use crate::{elf::ParseError, Constraints};

/// On-disk size of one [`MapDef`] record.
pub const MAP_DEF_SIZE: usize = 128;

/// One map definition, as laid out in the `maps` section.
///
/// The record is little-endian with fixed offsets; `selinux_context` and
/// `pin_subdir` are NUL-padded fixed-width strings. `zero` is a reserved
/// field that must be zero - a non-zero value means the object was built
/// against an incompatible definition layout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapDef {
    pub map_type: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub map_flags: u32,
    pub zero: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
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
    pub shared: bool,
    pub selinux_context: [u8; 32],
    pub pin_subdir: [u8; 32],
}

impl MapDef {
    /// Decodes the whole `maps` section. The section size must be an exact
    /// multiple of [`MAP_DEF_SIZE`].
    pub fn parse_section(data: &[u8]) -> Result<Vec<Self>, ParseError> {
        if data.len() % MAP_DEF_SIZE != 0 {
            return Err(ParseError::MissizedSection {
                name: "maps".into(),
                size: data.len(),
                entry_size: MAP_DEF_SIZE,
            });
        }
        Ok(data.chunks_exact(MAP_DEF_SIZE).map(Self::parse).collect())
    }

    fn parse(buf: &[u8]) -> Self {
        Self {
            map_type: read_u32(buf, 0),
            key_size: read_u32(buf, 4),
            value_size: read_u32(buf, 8),
            max_entries: read_u32(buf, 12),
            map_flags: read_u32(buf, 16),
            zero: read_u32(buf, 20),
            uid: read_u32(buf, 24),
            gid: read_u32(buf, 28),
            mode: read_u32(buf, 32),
            bpfloader_min_ver: read_u32(buf, 36),
            bpfloader_max_ver: read_u32(buf, 40),
            min_kver: read_u32(buf, 44),
            max_kver: read_u32(buf, 48),
            ignore_on_arm32: buf[52] != 0,
            ignore_on_aarch64: buf[53] != 0,
            ignore_on_x86_32: buf[54] != 0,
            ignore_on_x86_64: buf[55] != 0,
            ignore_on_riscv64: buf[56] != 0,
            ignore_on_eng: buf[57] != 0,
            ignore_on_user: buf[58] != 0,
            ignore_on_userdebug: buf[59] != 0,
            shared: buf[60] != 0,
            selinux_context: buf[64..96].try_into().unwrap(),
            pin_subdir: buf[96..128].try_into().unwrap(),
        }
    }

    pub fn constraints(&self) -> Constraints {
        Constraints {
            bpfloader_min_ver: self.bpfloader_min_ver,
            bpfloader_max_ver: self.bpfloader_max_ver,
            min_kver: self.min_kver,
            max_kver: self.max_kver,
            ignore_on_arm32: self.ignore_on_arm32,
            ignore_on_aarch64: self.ignore_on_aarch64,
            ignore_on_x86_32: self.ignore_on_x86_32,
            ignore_on_x86_64: self.ignore_on_x86_64,
            ignore_on_riscv64: self.ignore_on_riscv64,
            ignore_on_eng: self.ignore_on_eng,
            ignore_on_user: self.ignore_on_user,
            ignore_on_userdebug: self.ignore_on_userdebug,
        }
    }
}

pub(crate) fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

#[cfg(test)]
pub(crate) mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::generated::bpf_map_type::*;

    /// Serializes a minimal hash-map definition the way the build toolchain
    /// emits it.
    pub(crate) fn map_def_bytes(def: &MapDef) -> Vec<u8> {
        let mut buf = vec![0u8; MAP_DEF_SIZE];
        buf[0..4].copy_from_slice(&def.map_type.to_le_bytes());
        buf[4..8].copy_from_slice(&def.key_size.to_le_bytes());
        buf[8..12].copy_from_slice(&def.value_size.to_le_bytes());
        buf[12..16].copy_from_slice(&def.max_entries.to_le_bytes());
        buf[16..20].copy_from_slice(&def.map_flags.to_le_bytes());
        buf[20..24].copy_from_slice(&def.zero.to_le_bytes());
        buf[24..28].copy_from_slice(&def.uid.to_le_bytes());
        buf[28..32].copy_from_slice(&def.gid.to_le_bytes());
        buf[32..36].copy_from_slice(&def.mode.to_le_bytes());
        buf[36..40].copy_from_slice(&def.bpfloader_min_ver.to_le_bytes());
        buf[40..44].copy_from_slice(&def.bpfloader_max_ver.to_le_bytes());
        buf[44..48].copy_from_slice(&def.min_kver.to_le_bytes());
        buf[48..52].copy_from_slice(&def.max_kver.to_le_bytes());
        buf[52] = def.ignore_on_arm32 as u8;
        buf[53] = def.ignore_on_aarch64 as u8;
        buf[54] = def.ignore_on_x86_32 as u8;
        buf[55] = def.ignore_on_x86_64 as u8;
        buf[56] = def.ignore_on_riscv64 as u8;
        buf[57] = def.ignore_on_eng as u8;
        buf[58] = def.ignore_on_user as u8;
        buf[59] = def.ignore_on_userdebug as u8;
        buf[60] = def.shared as u8;
        buf[64..96].copy_from_slice(&def.selinux_context);
        buf[96..128].copy_from_slice(&def.pin_subdir);
        buf
    }

    pub(crate) fn sample_map_def() -> MapDef {
        let mut selinux_context = [0u8; 32];
        selinux_context[..17].copy_from_slice(b"fs_bpf_net_shared");
        MapDef {
            map_type: BPF_MAP_TYPE_HASH as u32,
            key_size: 4,
            value_size: 8,
            max_entries: 64,
            map_flags: 0,
            zero: 0,
            uid: 0,
            gid: 3003,
            mode: 0o640,
            bpfloader_min_ver: 42,
            bpfloader_max_ver: 0x7fff_ffff,
            min_kver: 0,
            max_kver: 0xffff_ffff,
            ignore_on_arm32: false,
            ignore_on_aarch64: false,
            ignore_on_x86_32: false,
            ignore_on_x86_64: true,
            ignore_on_riscv64: false,
            ignore_on_eng: false,
            ignore_on_user: true,
            ignore_on_userdebug: false,
            shared: false,
            selinux_context,
            pin_subdir: [0u8; 32],
        }
    }

    #[test]
    fn test_parse_roundtrip() {
        let def = sample_map_def();
        let parsed = MapDef::parse_section(&map_def_bytes(&def)).unwrap();
        assert_eq!(parsed, vec![def]);
    }

    #[test]
    fn test_parse_multiple() {
        let a = sample_map_def();
        let b = MapDef {
            map_type: BPF_MAP_TYPE_RINGBUF as u32,
            shared: true,
            ..sample_map_def()
        };
        let mut data = map_def_bytes(&a);
        data.extend_from_slice(&map_def_bytes(&b));
        let parsed = MapDef::parse_section(&data).unwrap();
        assert_eq!(parsed, vec![a, b]);
    }

    #[test]
    fn test_missized_section_rejected() {
        let mut data = map_def_bytes(&sample_map_def());
        data.pop();
        assert_matches!(
            MapDef::parse_section(&data),
            Err(ParseError::MissizedSection {
                size: 127,
                entry_size: MAP_DEF_SIZE,
                ..
            })
        );
    }

    #[test]
    fn test_constraints_view() {
        let def = sample_map_def();
        let c = def.constraints();
        assert_eq!(c.bpfloader_min_ver, 42);
        assert_eq!(c.bpfloader_max_ver, 0x7fff_ffff);
        assert!(c.ignore_on_user);
        assert!(c.ignore_on_x86_64);
        assert!(!c.ignore_on_eng);
    }
}
