//! One-shot probes of the runtime environment, and the compatibility gate
//! deciding which definitions to load.

use std::ffi::CStr;
use std::fmt;
use std::mem;

use netbpf_obj::Constraints;

use crate::properties::{get_int_property, get_property};

/// Version of the mainline network loader lineage; the effective version
/// grows with the platform release and privileges, see
/// [`RuntimeContext::bpfloader_version`].
pub const BPFLOADER_MAINLINE_VERSION: u32 = 42;

// Android SDK levels the loader changes behavior on.
pub const API_LEVEL_T: u32 = 33;
pub const API_LEVEL_U: u32 = 34;
pub const API_LEVEL_V: u32 = 35;

/// Packs a kernel version for comparison against `min_kver`/`max_kver`
/// gates. Each component is clamped to its 8-bit field.
pub const fn kver(major: u32, minor: u32, sub: u32) -> u32 {
    let major = if major > 0xff { 0xff } else { major };
    let minor = if minor > 0xff { 0xff } else { minor };
    let sub = if sub > 0xff { 0xff } else { sub };
    (major << 16) | (minor << 8) | sub
}

/// CPU architecture class; bit-width is tracked separately.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arch {
    Arm,
    X86,
    RiscV,
}

/// The Android build flavor from `ro.build.type`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildType {
    Eng,
    User,
    Userdebug,
    Unknown(String),
}

impl BuildType {
    fn from_property(value: &str) -> Self {
        match value {
            "eng" => Self::Eng,
            "user" => Self::User,
            "userdebug" => Self::Userdebug,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for BuildType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eng => f.write_str("eng"),
            Self::User => f.write_str("user"),
            Self::Userdebug => f.write_str("userdebug"),
            Self::Unknown(other) => f.write_str(other),
        }
    }
}

/// Immutable snapshot of everything load policy depends on, sampled once
/// at startup and passed down the pipeline.
#[derive(Clone, Debug)]
pub struct RuntimeContext {
    kernel_version: u32,
    kernel_64bit: bool,
    userspace_64bit: bool,
    arch: Arch,
    build_type: BuildType,
    device_api_level: u32,
    effective_api_level: u32,
    first_api_level: u32,
    running_as_root: bool,
    page_size: u32,
    is_tv: bool,
    is_wear: bool,
}

impl RuntimeContext {
    pub fn detect() -> Self {
        let kernel_version = uncached_kernel_version()
            .unwrap_or_else(|| crate::bug!("unable to determine the kernel version"));

        let userspace_64bit = cfg!(target_pointer_width = "64");
        // a 64-bit userspace requires a 64-bit kernel
        let kernel_64bit = userspace_64bit || kernel_is_64bit();

        let arch = if cfg!(any(target_arch = "arm", target_arch = "aarch64")) {
            Arch::Arm
        } else if cfg!(any(target_arch = "x86", target_arch = "x86_64")) {
            Arch::X86
        } else if cfg!(target_arch = "riscv64") {
            Arch::RiscV
        } else {
            crate::bug!("unsupported architecture");
        };

        // Released devices carry the codename REL; anything else is an
        // unreleased branch whose api level is effectively one higher.
        let unreleased = get_property("ro.build.version.codename", "REL") != "REL";
        let device_api_level = get_int_property("ro.build.version.sdk", 0) as u32;
        let effective_api_level = device_api_level + unreleased as u32;
        let first_api_level =
            get_int_property("ro.board.first_api_level", effective_api_level as i64) as u32;

        let has_gsm = !get_property("gsm.current.phone-type", "").is_empty();
        let is_tv = !has_gsm && get_property("ro.oem.key1", "").starts_with("ATV00");
        let is_wear = get_int_property("ro.cw_build.wear_sdk.version", 0) > 0
            || get_property("ro.build.characteristics", "")
                .split(',')
                .any(|c| c == "watch");

        Self {
            kernel_version,
            kernel_64bit,
            userspace_64bit,
            arch,
            build_type: BuildType::from_property(&get_property("ro.build.type", "unknown")),
            device_api_level,
            effective_api_level,
            first_api_level,
            running_as_root: unsafe { libc::getuid() } == 0,
            page_size: unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u32,
            is_tv,
            is_wear,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_test(
        kernel_version: u32,
        arch: Arch,
        kernel_64bit: bool,
        userspace_64bit: bool,
        build_type: BuildType,
    ) -> Self {
        Self {
            kernel_version,
            kernel_64bit,
            userspace_64bit,
            arch,
            build_type,
            device_api_level: 34,
            effective_api_level: 34,
            first_api_level: 34,
            running_as_root: true,
            page_size: 4096,
            is_tv: false,
            is_wear: false,
        }
    }

    pub fn kernel_version(&self) -> u32 {
        self.kernel_version
    }

    pub fn is_at_least_kernel_version(&self, major: u32, minor: u32, sub: u32) -> bool {
        self.kernel_version >= kver(major, minor, sub)
    }

    pub fn is_kernel_version(&self, major: u32, minor: u32) -> bool {
        self.is_at_least_kernel_version(major, minor, 0)
            && !self.is_at_least_kernel_version(major, minor + 1, 0)
    }

    /// Whether the running kernel is one of the LTS series Android ships.
    pub fn is_lts_kernel(&self) -> bool {
        [
            (4, 4),   // minimum for Android R
            (4, 9),   // minimum for Android S & T
            (4, 14),  // minimum for Android U
            (4, 19),  // minimum for Android V
            (5, 4),   // first supported in Android R
            (5, 10),  // first supported in Android S
            (5, 15),  // first supported in Android T
            (6, 1),   // first supported in Android U
            (6, 6),   // first supported in Android V
        ]
        .iter()
        .any(|&(major, minor)| self.is_kernel_version(major, minor))
    }

    pub fn is_kernel_64bit(&self) -> bool {
        self.kernel_64bit
    }

    pub fn is_kernel_32bit(&self) -> bool {
        !self.kernel_64bit
    }

    pub fn is_userspace_64bit(&self) -> bool {
        self.userspace_64bit
    }

    pub fn is_userspace_32bit(&self) -> bool {
        !self.userspace_64bit
    }

    pub fn is_arm(&self) -> bool {
        self.arch == Arch::Arm
    }

    pub fn is_x86(&self) -> bool {
        self.arch == Arch::X86
    }

    pub fn is_riscv(&self) -> bool {
        self.arch == Arch::RiscV
    }

    pub fn describe_arch(&self) -> &'static str {
        if self.userspace_64bit {
            match self.arch {
                Arch::Arm => "64-on-aarch64",
                Arch::X86 => "64-on-x86-64",
                Arch::RiscV => "64-on-riscv64",
            }
        } else if self.kernel_64bit {
            match self.arch {
                Arch::Arm => "32-on-aarch64",
                _ => "32-on-x86-64",
            }
        } else {
            match self.arch {
                Arch::Arm => "32-on-arm32",
                _ => "32-on-x86-32",
            }
        }
    }

    pub fn build_type(&self) -> &BuildType {
        &self.build_type
    }

    pub fn is_eng(&self) -> bool {
        self.build_type == BuildType::Eng
    }

    pub fn is_user(&self) -> bool {
        self.build_type == BuildType::User
    }

    pub fn is_userdebug(&self) -> bool {
        self.build_type == BuildType::Userdebug
    }

    pub fn device_api_level(&self) -> u32 {
        self.device_api_level
    }

    pub fn effective_api_level(&self) -> u32 {
        self.effective_api_level
    }

    pub fn first_api_level(&self) -> u32 {
        self.first_api_level
    }

    pub fn is_at_least_t(&self) -> bool {
        self.effective_api_level >= API_LEVEL_T
    }

    pub fn is_at_least_u(&self) -> bool {
        self.effective_api_level >= API_LEVEL_U
    }

    pub fn is_at_least_v(&self) -> bool {
        self.effective_api_level >= API_LEVEL_V
    }

    pub fn is_at_least_w(&self) -> bool {
        self.effective_api_level > API_LEVEL_V
    }

    pub fn running_as_root(&self) -> bool {
        self.running_as_root
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn is_tv(&self) -> bool {
        self.is_tv
    }

    pub fn is_wear(&self) -> bool {
        self.is_wear
    }

    /// The loader version grows by one per platform milestone it runs on,
    /// plus one when running as root.
    pub fn bpfloader_version(&self) -> u32 {
        let mut version = BPFLOADER_MAINLINE_VERSION; // [42]
        if self.is_at_least_t() {
            version += 1; // [43]
        }
        if self.is_at_least_u() {
            version += 1; // [44]
        }
        if self.running_as_root {
            version += 1; // [45]
        }
        if self.is_at_least_v() {
            version += 1; // [46]
        }
        if self.is_at_least_w() {
            version += 1; // [47]
        }
        version
    }
}

fn uncached_kernel_version() -> Option<u32> {
    let mut buf = unsafe { mem::zeroed::<libc::utsname>() };
    if unsafe { libc::uname(&mut buf) } != 0 {
        return None;
    }
    let release = unsafe { CStr::from_ptr(buf.release.as_ptr()) };
    parse_kernel_release(release.to_str().ok()?)
}

/// Parses the leading `major[.minor[.sub]]` of a `uname -r` string; digits
/// stop at the first non-digit, so `5.15.110-android13-4` yields
/// (5, 15, 110).
fn parse_kernel_release(release: &str) -> Option<u32> {
    fn leading_number(s: &str) -> (Option<u32>, &str) {
        let end = s
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(s.len());
        match s[..end].parse() {
            Ok(value) => (Some(value), &s[end..]),
            Err(_) => (None, s),
        }
    }

    let (major, rest) = leading_number(release);
    let major = major?;
    let (minor, sub) = match rest.strip_prefix('.') {
        Some(rest) => {
            let (minor, rest) = leading_number(rest);
            let minor = minor.unwrap_or(0);
            let sub = rest
                .strip_prefix('.')
                .and_then(|rest| leading_number(rest).0)
                .unwrap_or(0);
            (minor, sub)
        }
        None => (0, 0),
    };
    Some(kver(major, minor, sub))
}

/// When userspace is 32-bit the kernel may still be 64-bit: flip to the
/// native personality, look at `uname -m`, and flip back.
fn kernel_is_64bit() -> bool {
    const PER_MASK: libc::c_ulong = 0x00ff;
    const PER_LINUX: libc::c_ulong = 0;

    let previous = unsafe { libc::personality(0xffffffff) };
    if previous == -1 {
        return false;
    }
    let native = (previous as libc::c_ulong & !PER_MASK) | PER_LINUX;
    if unsafe { libc::personality(native) } != previous {
        return false;
    }
    let mut buf = unsafe { mem::zeroed::<libc::utsname>() };
    let ret = unsafe { libc::uname(&mut buf) };
    unsafe { libc::personality(previous as libc::c_ulong) };
    if ret != 0 {
        return false;
    }
    let machine = unsafe { CStr::from_ptr(buf.machine.as_ptr()) };
    machine.to_bytes().windows(2).any(|w| w == b"64")
}

/// Why the compatibility gate skipped a definition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SkipReason {
    LoaderTooOld { min: u32 },
    LoaderTooNew { max: u32 },
    KernelTooOld { min: u32 },
    KernelTooNew { max: u32 },
    IgnoredOnBuild,
    IgnoredOnArch,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoaderTooOld { min } => write!(f, "requires bpfloader min ver {min:#07x}"),
            Self::LoaderTooNew { max } => write!(f, "requires bpfloader max ver {max:#07x}"),
            Self::KernelTooOld { min } => write!(f, "requires kernel version >= {min:#x}"),
            Self::KernelTooNew { max } => write!(f, "requires kernel version < {max:#x}"),
            Self::IgnoredOnBuild => f.write_str("is ignored on this build type"),
            Self::IgnoredOnArch => f.write_str("is ignored on this architecture"),
        }
    }
}

/// The compatibility gate. Pure: everything it needs is in the context
/// snapshot and the definition's constraints. Version ranges are
/// `[min, max)`.
pub fn skip_reason(
    ctx: &RuntimeContext,
    loader_version: u32,
    c: &Constraints,
) -> Option<SkipReason> {
    if loader_version < c.bpfloader_min_ver {
        return Some(SkipReason::LoaderTooOld {
            min: c.bpfloader_min_ver,
        });
    }
    if loader_version >= c.bpfloader_max_ver {
        return Some(SkipReason::LoaderTooNew {
            max: c.bpfloader_max_ver,
        });
    }
    if ctx.kernel_version() < c.min_kver {
        return Some(SkipReason::KernelTooOld { min: c.min_kver });
    }
    if ctx.kernel_version() >= c.max_kver {
        return Some(SkipReason::KernelTooNew { max: c.max_kver });
    }
    if (c.ignore_on_eng && ctx.is_eng())
        || (c.ignore_on_user && ctx.is_user())
        || (c.ignore_on_userdebug && ctx.is_userdebug())
    {
        return Some(SkipReason::IgnoredOnBuild);
    }
    if (ctx.is_arm() && ctx.is_kernel_32bit() && c.ignore_on_arm32)
        || (ctx.is_arm() && ctx.is_kernel_64bit() && c.ignore_on_aarch64)
        || (ctx.is_x86() && ctx.is_kernel_32bit() && c.ignore_on_x86_32)
        || (ctx.is_x86() && ctx.is_kernel_64bit() && c.ignore_on_x86_64)
        || (ctx.is_riscv() && c.ignore_on_riscv64)
    {
        return Some(SkipReason::IgnoredOnArch);
    }
    None
}
