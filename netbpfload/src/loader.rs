//! Directory scanning, startup preconditions and the per-object load
//! pipeline.

use std::error::Error;
use std::ffi::CStr;
use std::fs;
use std::os::fd::{AsFd as _, AsRawFd as _, RawFd};
use std::path::Path;
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};
use netbpf_obj::generated::{bpf_map_type, BPF_ANY};
use netbpf_obj::{apply_map_relocations, read_code_sections, ElfFile, ParseError};

use crate::domain::BPF_FS_PATH;
use crate::env::{BuildType, RuntimeContext, BPFLOADER_MAINLINE_VERSION};
use crate::errors::LoadError;
use crate::util::{c_path, path_exists};
use crate::{maps, programs, sys};

/// A scanned source directory and the default pin prefix for the objects
/// found in it.
pub struct Location {
    pub dir: &'static str,
    pub prefix: &'static str,
}

/// Object sources, all inside the tethering mainline module.
pub const LOCATIONS: &[Location] = &[
    // S+: tether offload (network_stack)
    Location {
        dir: "/apex/com.android.tethering/etc/bpf/",
        prefix: "tethering/",
    },
    // T+: shared with netd & system server; netutils_wrapper (for
    // iptables xt_bpf) has access to the programs
    Location {
        dir: "/apex/com.android.tethering/etc/bpf/netd_shared/",
        prefix: "netd_shared/",
    },
    // T+: netd has read only access, netutils_wrapper none
    Location {
        dir: "/apex/com.android.tethering/etc/bpf/netd_readonly/",
        prefix: "netd_readonly/",
    },
    // T+: shared with system server
    Location {
        dir: "/apex/com.android.tethering/etc/bpf/net_shared/",
        prefix: "net_shared/",
    },
    // T+: not shared, just network_stack
    Location {
        dir: "/apex/com.android.tethering/etc/bpf/net_private/",
        prefix: "net_private/",
    },
];

/// Runs the whole load: preconditions, kernel knobs, pin directories, all
/// locations, the post-load self test and the completion sentinel. Returns
/// the process exit code: 0 on success, 1 on a precondition violation, 2
/// when objects failed to load.
pub fn run(ctx: &RuntimeContext) -> u8 {
    let loader_version = ctx.bpfloader_version();
    info!(
        "netbpfload v0.{loader_version} api:{}/{} kver:{:07x} ({}) uid:{}",
        ctx.device_api_level(),
        ctx.effective_api_level(),
        ctx.kernel_version(),
        ctx.describe_arch(),
        unsafe { libc::getuid() },
    );

    if let Some(code) = check_preconditions(ctx) {
        return code;
    }
    if let Some(code) = write_kernel_knobs(ctx) {
        return code;
    }

    // Pin subdirectories must exist before any object load, or pinning and
    // renaming into them fails with ENOENT.
    for location in LOCATIONS {
        if !create_sysfs_bpf_subdir(location.prefix) {
            return 1;
        }
    }
    // No objects ship for fs_bpf_loader; the subdirectory exists purely to
    // trigger its genfscon rule.
    if !create_sysfs_bpf_subdir("loader") {
        return 1;
    }

    for location in LOCATIONS {
        if let Err(e) = load_all_objects(ctx, loader_version, location) {
            error!(
                "=== CRITICAL FAILURE LOADING BPF PROGRAMS FROM {} ===",
                location.dir
            );
            log_error_chain("last failure was", &e);
            error!("If this triggers reliably, you're probably missing kernel options or patches.");
            error!("--- DO NOT EXPECT SYSTEM TO BOOT SUCCESSFULLY ---");
            // leave time for a bug report to capture the kernel log
            thread::sleep(Duration::from_secs(20));
            return 2;
        }
    }

    if !kernel_array_map_self_test() {
        return 1;
    }

    // flag completion for downstream consumers waiting on mainline progs
    if !create_sysfs_bpf_subdir("netd_shared/mainline_done") {
        return 1;
    }

    info!("done.");
    0
}

fn check_preconditions(ctx: &RuntimeContext) -> Option<u8> {
    // last shipped in U QPR2 beta1 / first shipped in U QPR2 beta~2
    let has_platform_bpfloader_rc = path_exists("/system/etc/init/bpfloader.rc");
    let has_platform_netbpfload_rc = path_exists("/system/etc/init/netbpfload.rc");
    if !has_platform_bpfloader_rc && !has_platform_netbpfload_rc {
        error!("Unable to find platform's bpfloader & netbpfload init scripts.");
        return Some(1);
    }
    if has_platform_bpfloader_rc && has_platform_netbpfload_rc {
        error!("Platform has *both* bpfloader & netbpfload init scripts.");
        return Some(1);
    }

    if !ctx.is_at_least_t() {
        error!("Impossible - not reachable on Android <T.");
        return Some(1);
    }
    if !ctx.is_at_least_kernel_version(4, 9, 0) {
        error!("Android T requires kernel 4.9.");
        return Some(1);
    }
    if ctx.is_at_least_u() && !ctx.is_at_least_kernel_version(4, 14, 0) {
        error!("Android U requires kernel 4.14.");
        return Some(1);
    }
    if ctx.is_at_least_v() && !ctx.is_at_least_kernel_version(4, 19, 0) {
        error!("Android V requires kernel 4.19.");
        return Some(1);
    }

    if ctx.is_at_least_v() && ctx.is_kernel_32bit() && ctx.is_at_least_kernel_version(5, 16, 0) {
        error!("Android V+ platform with 32 bit kernel version >= 5.16.0 is unsupported");
        if !ctx.is_tv() {
            return Some(1);
        }
    }
    // 6.6 is the highest series Android V supports, so 6.7+ is next-release
    // territory with no 32-bit support at all
    if ctx.is_kernel_32bit() && ctx.is_at_least_kernel_version(6, 7, 0) {
        error!("Android platform with 32 bit kernel version >= 6.7.0 is unsupported");
        return Some(1);
    }
    // known ABI layout issues, particularly wrt. bpf and ipsec/xfrm
    if ctx.is_at_least_v() && ctx.is_kernel_32bit() && ctx.is_x86() {
        error!("Android V requires X86 kernel to be 64-bit.");
        if !ctx.is_tv() {
            return Some(1);
        }
    }

    if ctx.is_at_least_v() {
        let mut bad = false;
        if !ctx.is_lts_kernel() {
            warn!("Android V only supports LTS kernels.");
            bad = true;
        }
        for &(major, minor, sub) in &[
            (4, 19, 236),
            (5, 4, 186),
            (5, 10, 199),
            (5, 15, 136),
            (6, 1, 57),
            (6, 6, 0),
        ] {
            if ctx.is_kernel_version(major, minor)
                && !ctx.is_at_least_kernel_version(major, minor, sub)
            {
                warn!("Android V requires {major}.{minor} kernel to be {major}.{minor}.{sub}+.");
                bad = true;
            }
        }
        if bad {
            error!("Unsupported kernel version ({:07x}).", ctx.kernel_version());
        }
    }

    // 32-bit userspace talking to 64-bit-only kernel interfaces is on its
    // way out; a few device classes remain exempt for now
    if ctx.is_userspace_32bit() && ctx.is_at_least_kernel_version(6, 2, 0) {
        if ctx.is_tv() {
            warn!("[TV] 32-bit userspace unsupported on 6.2+ kernels.");
        } else if ctx.is_wear() && ctx.is_arm() {
            warn!("[Arm Wear] 32-bit userspace unsupported on 6.2+ kernels.");
        } else if ctx.first_api_level() <= crate::env::API_LEVEL_T && ctx.is_arm() {
            warn!("[Arm KernelUpRev] 32-bit userspace unsupported on 6.2+ kernels.");
        } else if ctx.is_arm() {
            error!(
                "[Arm] 64-bit userspace required on 6.2+ kernels ({}).",
                ctx.first_api_level()
            );
            return Some(1);
        } else {
            error!("[x86] 64-bit userspace required on 6.2+ kernels.");
            return Some(1);
        }
    }
    if ctx.is_userspace_32bit() && ctx.is_at_least_kernel_version(6, 7, 0) {
        error!("64-bit userspace required on 6.7+ kernels.");
        return Some(1);
    }

    if let BuildType::Unknown(other) = ctx.build_type() {
        error!("Failed to determine the build type: got {other}, want 'eng', 'user', or 'userdebug'");
        return Some(1);
    }

    None
}

fn write_kernel_knobs(ctx: &RuntimeContext) -> Option<u8> {
    if ctx.running_as_root() {
        // 5.16-rc1 flipped the default to disabled-but-changeable; we need
        // it enabled. Known to fail on some 4.19 kernels, which default to
        // enabled anyway, hence the version-gated escalation.
        if !write_proc_sys_file("/proc/sys/kernel/unprivileged_bpf_disabled", "0\n")
            && ctx.is_at_least_kernel_version(5, 13, 0)
        {
            return Some(1);
        }
    }
    if ctx.is_at_least_u() {
        // on 64-bit kernels the JIT is likely force-enabled already via
        // BPF_JIT_ALWAYS_ON; these writes need CAP_NET_ADMIN sepolicy
        // which only exists on U+
        if !write_proc_sys_file("/proc/sys/net/core/bpf_jit_enable", "1\n") {
            return Some(1);
        }
        if !write_proc_sys_file("/proc/sys/net/core/bpf_jit_kallsyms", "1\n") {
            return Some(1);
        }
    }
    None
}

/// The trailing newline matches `echo value > /proc/sys/...`, which is how
/// these interfaces get exercised by hand.
fn write_proc_sys_file(path: &str, value: &str) -> bool {
    match fs::write(path, value) {
        Ok(()) => true,
        Err(e) => {
            error!("write {path}: {e}");
            false
        }
    }
}

fn create_sysfs_bpf_subdir(prefix: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    let path = format!("{BPF_FS_PATH}{prefix}");
    let c = c_path(&path);
    let prev_umask = unsafe { libc::umask(0) };
    let ret = unsafe { libc::mkdir(c.as_ptr(), 0o1777) };
    let err = std::io::Error::last_os_error();
    unsafe { libc::umask(prev_umask) };
    if ret != 0 && err.raw_os_error() != Some(libc::EEXIST) {
        error!("Failed to create directory {path}: {err}");
        return false;
    }
    true
}

/// Loads every `.o` in one location, continuing past failures; the worst
/// failure is returned once the directory is exhausted.
fn load_all_objects(
    ctx: &RuntimeContext,
    loader_version: u32,
    location: &Location,
) -> Result<(), LoadError> {
    let entries = match fs::read_dir(location.dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(()), // nothing shipped for this location
    };
    let mut result = Ok(());
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().map(|e| e == "o") != Some(true) {
            continue;
        }
        match load_object(ctx, &path, location.prefix, loader_version) {
            Ok(()) => debug!("Loaded object: {}", path.display()),
            Err(e) => {
                log_error_chain(&format!("Failed to load object: {}", path.display()), &e);
                result = Err(e);
            }
        }
    }
    result
}

/// The per-object pipeline: license, loader-version gate, maps,
/// relocations, programs.
fn load_object(
    ctx: &RuntimeContext,
    path: &Path,
    prefix: &str,
    loader_version: u32,
) -> Result<(), LoadError> {
    let data = fs::read(path).map_err(|e| LoadError::Os {
        op: "read",
        path: path.display().to_string(),
        io_error: e,
    })?;
    let elf = ElfFile::parse(&data)?;

    let license_bytes = elf.section_by_name("license")?;
    let license = CStr::from_bytes_until_nul(license_bytes).map_err(|_| LoadError::BadLicense)?;
    debug!(
        "Loading ELF object {} with license {}",
        path.display(),
        license.to_string_lossy()
    );

    let min_ver = elf.section_u32("bpfloader_min_ver")?;
    let max_ver = elf.section_u32("bpfloader_max_ver")?;
    if loader_version < min_ver {
        debug!(
            "BpfLoader version {loader_version:#07x} ignoring ELF object {} with min ver {min_ver:#07x}",
            path.display()
        );
        return Ok(());
    }
    if loader_version >= max_ver {
        debug!(
            "BpfLoader version {loader_version:#07x} ignoring ELF object {} with max ver {max_ver:#07x}",
            path.display()
        );
        return Ok(());
    }
    debug!(
        "BpfLoader version {loader_version:#07x} processing ELF object {} with ver [{min_ver:#07x},{max_ver:#07x})",
        path.display()
    );

    let map_fds = maps::create_maps(ctx, &elf, path, prefix, loader_version)?;

    let mut sections = match read_code_sections(&elf) {
        Ok(sections) => sections,
        // a maps-only object is fine for anything built against the
        // mainline loader lineage
        Err(ParseError::SectionNotFound { ref name })
            if name == "progs" && min_ver >= BPFLOADER_MAINLINE_VERSION =>
        {
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let raw_fds: Vec<Option<RawFd>> = map_fds
        .iter()
        .map(|fd| fd.as_ref().map(|fd| fd.as_raw_fd()))
        .collect();
    apply_map_relocations(&elf, &raw_fds, &mut sections)?;

    programs::load_code_sections(ctx, &sections, license, path, prefix, loader_version)?;
    Ok(())
}

/// A kernel that cannot write into index 1 of a fresh 2-element array map
/// is too broken to run anything; better to find out now.
fn kernel_array_map_self_test() -> bool {
    let key: u32 = 1;
    let value: u32 = 123;
    let fd = match sys::bpf_create_map(None, bpf_map_type::BPF_MAP_TYPE_ARRAY as u32, 4, 4, 2, 0) {
        Ok(fd) => fd,
        Err(e) => {
            error!("Kernel self test: unable to create a 2 element array map: {e}");
            return false;
        }
    };
    if let Err(e) = sys::bpf_map_update_elem(fd.as_fd(), &key, &value, BPF_ANY) {
        error!("Critical kernel bug - failure to write into index 1 of 2 element bpf map array: {e}");
        return false;
    }
    true
}

fn log_error_chain(context: &str, e: &dyn Error) {
    error!("{context}: {e}");
    let mut source = e.source();
    while let Some(s) = source {
        error!("  caused by: {s}");
        source = s.source();
    }
}
