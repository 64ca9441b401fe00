//! Program definitions, section classification and code-section reading.

use log::debug;
use object::elf::STT_FUNC;

use crate::{
    elf::{ElfFile, ParseError},
    generated::{bpf_attach_type, bpf_prog_type},
    maps::read_u32,
    Constraints,
};

/// On-disk size of one [`ProgDef`] record.
pub const PROG_DEF_SIZE: usize = 100;

/// One program definition from the `progs` section, bound to a program by
/// symbol name: the definition for program symbol `foo` is named `foo_def`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProgDef {
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
    pub uid: u32,
    pub gid: u32,
    /// A failed `BPF_PROG_LOAD` of an optional program is only a warning.
    pub optional: bool,
    pub selinux_context: [u8; 32],
    pub pin_subdir: [u8; 32],
}

impl ProgDef {
    /// Decodes the whole `progs` section. The section size must be an
    /// exact multiple of [`PROG_DEF_SIZE`].
    pub fn parse_section(data: &[u8]) -> Result<Vec<Self>, ParseError> {
        if data.len() % PROG_DEF_SIZE != 0 {
            return Err(ParseError::MissizedSection {
                name: "progs".into(),
                size: data.len(),
                entry_size: PROG_DEF_SIZE,
            });
        }
        Ok(data.chunks_exact(PROG_DEF_SIZE).map(Self::parse).collect())
    }

    fn parse(buf: &[u8]) -> Self {
        Self {
            bpfloader_min_ver: read_u32(buf, 0),
            bpfloader_max_ver: read_u32(buf, 4),
            min_kver: read_u32(buf, 8),
            max_kver: read_u32(buf, 12),
            ignore_on_arm32: buf[16] != 0,
            ignore_on_aarch64: buf[17] != 0,
            ignore_on_x86_32: buf[18] != 0,
            ignore_on_x86_64: buf[19] != 0,
            ignore_on_riscv64: buf[20] != 0,
            ignore_on_eng: buf[21] != 0,
            ignore_on_user: buf[22] != 0,
            ignore_on_userdebug: buf[23] != 0,
            uid: read_u32(buf, 24),
            gid: read_u32(buf, 28),
            optional: buf[32] != 0,
            selinux_context: buf[36..68].try_into().unwrap(),
            pin_subdir: buf[68..100].try_into().unwrap(),
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

/// Maps a section-name prefix to a program type and, where the kernel
/// needs one, an expected attach type.
pub struct SectionType {
    pub prefix: &'static str,
    pub prog_type: bpf_prog_type,
    pub attach_type: Option<bpf_attach_type>,
}

use crate::generated::bpf_attach_type::*;
use crate::generated::bpf_prog_type::*;

/// Section prefixes understood by the loader; first match wins. Program
/// sections are named `<prefix><name-of-program>`. Anything else is not a
/// program section and is skipped.
///
/// Tracing-flavored types (kprobe, perf_event, tracepoint) are deliberately
/// absent: they are too unstable an ABI to ship from updatable code.
pub const SECTION_NAME_TYPES: &[SectionType] = &[
    section("bind4/", BPF_PROG_TYPE_CGROUP_SOCK_ADDR, Some(BPF_CGROUP_INET4_BIND)),
    section("bind6/", BPF_PROG_TYPE_CGROUP_SOCK_ADDR, Some(BPF_CGROUP_INET6_BIND)),
    section("cgroupskb/", BPF_PROG_TYPE_CGROUP_SKB, None),
    section("cgroupsock/", BPF_PROG_TYPE_CGROUP_SOCK, None),
    section("cgroupsockcreate/", BPF_PROG_TYPE_CGROUP_SOCK, Some(BPF_CGROUP_INET_SOCK_CREATE)),
    section("cgroupsockrelease/", BPF_PROG_TYPE_CGROUP_SOCK, Some(BPF_CGROUP_INET_SOCK_RELEASE)),
    section("connect4/", BPF_PROG_TYPE_CGROUP_SOCK_ADDR, Some(BPF_CGROUP_INET4_CONNECT)),
    section("connect6/", BPF_PROG_TYPE_CGROUP_SOCK_ADDR, Some(BPF_CGROUP_INET6_CONNECT)),
    section("egress/", BPF_PROG_TYPE_CGROUP_SKB, Some(BPF_CGROUP_INET_EGRESS)),
    section("getsockopt/", BPF_PROG_TYPE_CGROUP_SOCKOPT, Some(BPF_CGROUP_GETSOCKOPT)),
    section("ingress/", BPF_PROG_TYPE_CGROUP_SKB, Some(BPF_CGROUP_INET_INGRESS)),
    section("postbind4/", BPF_PROG_TYPE_CGROUP_SOCK, Some(BPF_CGROUP_INET4_POST_BIND)),
    section("postbind6/", BPF_PROG_TYPE_CGROUP_SOCK, Some(BPF_CGROUP_INET6_POST_BIND)),
    section("recvmsg4/", BPF_PROG_TYPE_CGROUP_SOCK_ADDR, Some(BPF_CGROUP_UDP4_RECVMSG)),
    section("recvmsg6/", BPF_PROG_TYPE_CGROUP_SOCK_ADDR, Some(BPF_CGROUP_UDP6_RECVMSG)),
    section("schedact/", BPF_PROG_TYPE_SCHED_ACT, None),
    section("schedcls/", BPF_PROG_TYPE_SCHED_CLS, None),
    section("sendmsg4/", BPF_PROG_TYPE_CGROUP_SOCK_ADDR, Some(BPF_CGROUP_UDP4_SENDMSG)),
    section("sendmsg6/", BPF_PROG_TYPE_CGROUP_SOCK_ADDR, Some(BPF_CGROUP_UDP6_SENDMSG)),
    section("setsockopt/", BPF_PROG_TYPE_CGROUP_SOCKOPT, Some(BPF_CGROUP_SETSOCKOPT)),
    section("skfilter/", BPF_PROG_TYPE_SOCKET_FILTER, None),
    section("sockops/", BPF_PROG_TYPE_SOCK_OPS, Some(BPF_CGROUP_SOCK_OPS)),
    section("sysctl", BPF_PROG_TYPE_CGROUP_SYSCTL, Some(BPF_CGROUP_SYSCTL)),
    section("xdp/", BPF_PROG_TYPE_XDP, None),
];

const fn section(
    prefix: &'static str,
    prog_type: bpf_prog_type,
    attach_type: Option<bpf_attach_type>,
) -> SectionType {
    SectionType {
        prefix,
        prog_type,
        attach_type,
    }
}

/// Classifies a section name; returns `None` for non-program sections.
pub fn section_type(name: &str) -> Option<&'static SectionType> {
    SECTION_NAME_TYPES
        .iter()
        .find(|st| name.starts_with(st.prefix))
}

/// One program section pulled out of the object, ready for relocation and
/// loading.
#[derive(Clone, Debug)]
pub struct CodeSection {
    pub prog_type: bpf_prog_type,
    pub attach_type: Option<bpf_attach_type>,
    /// Section name with `/` replaced by `_`.
    pub name: String,
    /// Raw instruction stream, a multiple of 8 bytes.
    pub data: Vec<u8>,
    /// The companion `.rel<section>` payload, when present.
    pub rel_data: Option<Vec<u8>>,
    pub prog_def: Option<ProgDef>,
}

/// Collects all program sections in ELF section order. A relocation
/// section only counts as a companion when it immediately follows its
/// program section, which is how the toolchain emits these objects.
pub fn read_code_sections(elf: &ElfFile<'_>) -> Result<Vec<CodeSection>, ParseError> {
    let prog_defs = ProgDef::parse_section(elf.section_by_name("progs")?)?;
    let def_names = elf.section_symbol_names("progs", None)?;
    if def_names.len() != prog_defs.len() {
        return Err(ParseError::DefCountMismatch {
            name: "progs".into(),
            symbols: def_names.len(),
            defs: prog_defs.len(),
        });
    }

    let mut sections = Vec::new();
    for i in 0..elf.section_count() {
        let name = match elf.section_name(i) {
            Ok(name) => name,
            Err(_) => continue,
        };
        let Some(st) = section_type(name) else {
            continue;
        };
        let data = elf.section_data(i)?;
        if data.is_empty() {
            continue;
        }
        debug!("loaded code section {i} ({name})");

        let func_names = elf.section_symbol_names(name, Some(STT_FUNC))?;
        let func = func_names
            .first()
            .ok_or_else(|| ParseError::MissingFunctionSymbol { name: name.into() })?;
        let def_name = format!("{func}_def");
        let prog_def = def_names
            .iter()
            .position(|n| *n == def_name)
            .map(|j| prog_defs[j]);

        let rel_name = format!(".rel{name}");
        let rel_data = match i + 1 < elf.section_count() {
            true => match elf.section_name(i + 1) {
                Ok(next) if next == rel_name => Some(elf.section_data(i + 1)?.to_vec()),
                _ => None,
            },
            false => None,
        };

        sections.push(CodeSection {
            prog_type: st.prog_type,
            attach_type: st.attach_type,
            name: name.replace('/', "_"),
            data: data.to_vec(),
            rel_data,
            prog_def,
        });
    }
    Ok(sections)
}
