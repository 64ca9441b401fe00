//! Map creation, reuse, validation and pinning.

use std::fs;
use std::os::fd::{AsFd as _, BorrowedFd, OwnedFd};
use std::os::unix::fs::{chown, PermissionsExt as _};
use std::path::Path;

use log::{debug, error, info};
use netbpf_obj::generated::bpf_map_type::*;
use netbpf_obj::generated::{BPF_F_NO_PREALLOC, BPF_F_RDONLY_PROG};
use netbpf_obj::{ElfFile, MapDef, ParseError};

use crate::domain::{self, Domain};
use crate::env::{skip_reason, RuntimeContext};
use crate::errors::LoadError;
use crate::sys::{self, InfoError};
use crate::util::{c_path, path_exists, rename_noreplace};

/// Creates (or reuses) every map the object declares, in `maps`-section
/// symbol order, and returns one fd slot per definition. Skipped maps
/// leave an empty slot so slot indices keep lining up with symbol order
/// for the relocator.
pub(crate) fn create_maps(
    ctx: &RuntimeContext,
    elf: &ElfFile<'_>,
    object_path: &Path,
    prefix: &str,
    loader_version: u32,
) -> Result<Vec<Option<OwnedFd>>, LoadError> {
    let defs = match elf.section_by_name("maps") {
        Ok(data) => MapDef::parse_section(data)?,
        Err(ParseError::SectionNotFound { .. }) => return Ok(Vec::new()), // no maps to create
        Err(e) => return Err(e.into()),
    };
    let names = elf.section_symbol_names("maps", None)?;
    if names.len() != defs.len() {
        return Err(ParseError::DefCountMismatch {
            name: "maps".into(),
            symbols: names.len(),
            defs: defs.len(),
        }
        .into());
    }
    let obj_name = domain::object_name(object_path);

    let mut fds = Vec::with_capacity(defs.len());
    for (def, &name) in defs.iter().zip(names.iter()) {
        if def.zero != 0 {
            crate::bug!("map {name} has a corrupt definition");
        }
        if let Some(reason) = skip_reason(ctx, loader_version, &def.constraints()) {
            debug!("skipping map {name} which {reason}");
            fds.push(None);
            continue;
        }

        let map_type = substituted_map_type(ctx, def.map_type);
        let max_entries = effective_max_entries(map_type, def.max_entries, ctx.page_size());
        let map_flags = effective_map_flags(map_type, def.map_flags);

        let selinux_context = Domain::from_selinux_context(&def.selinux_context)
            .unwrap_or_else(|e| crate::bug!("map {name}: {e}"));
        let pin_subdir = Domain::from_pin_subdir(&def.pin_subdir)
            .unwrap_or_else(|e| crate::bug!("map {name}: {e}"));

        let pin_path = domain::map_pin_path(pin_subdir, prefix, &obj_name, name, def.shared);
        let reuse = path_exists(&pin_path);
        let fd = if reuse {
            debug!("reusing map {name} pinned at {pin_path}");
            sys::map_retrieve_ro(&c_path(&pin_path))?
        } else {
            // the kernel accepts a map name starting with 4.15
            let map_name = ctx
                .is_at_least_kernel_version(4, 15, 0)
                .then(|| c_path(name));
            sys::bpf_create_map(
                map_name.as_deref(),
                map_type,
                def.key_size,
                def.value_size,
                max_entries,
                map_flags,
            )?
        };

        // Reuse requires the pinned map to match the declared shape. The
        // checks run on freshly created maps too: that also catches a
        // shared map declared twice with different shapes.
        if !map_matches(ctx, fd.as_fd(), name, map_type, def, max_entries, map_flags) {
            return Err(LoadError::NotUnique {
                name: name.to_string(),
                path: pin_path,
            });
        }

        if !reuse {
            if selinux_context.specified() {
                // Pin in the directory whose genfscon rule carries the
                // wanted context, then move into place; the rename is what
                // labels the inode.
                let tmp_path = domain::map_tmp_pin_path(selinux_context, &obj_name, name);
                sys::bpf_pin_object(fd.as_fd(), &c_path(&tmp_path))?;
                rename_noreplace(&tmp_path, &pin_path)?;
            } else {
                sys::bpf_pin_object(fd.as_fd(), &c_path(&pin_path))?;
            }
            fs::set_permissions(&pin_path, fs::Permissions::from_mode(def.mode)).map_err(|e| {
                LoadError::Os {
                    op: "chmod",
                    path: pin_path.clone(),
                    io_error: e,
                }
            })?;
            chown(&pin_path, Some(def.uid), Some(def.gid)).map_err(|e| LoadError::Os {
                op: "chown",
                path: pin_path.clone(),
                io_error: e,
            })?;
        }

        match sys::bpf_get_fd_map_id(fd.as_fd()) {
            Ok(id) => info!("map {pin_path} id {id}"),
            Err(e) => {
                if ctx.is_at_least_kernel_version(4, 14, 0) {
                    error!("bpf_get_fd_map_id of {name}: {e}");
                }
            }
        }

        fds.push(Some(fd));
    }
    Ok(fds)
}

/// DEVMAP (4.14+) and DEVMAP_HASH (5.4+) have userspace-ABI-compatible
/// stand-ins on older kernels. Programs that truly need the real type
/// also need bpf_redirect_map(), which those kernels lack, so such
/// programs must carry a matching `min_kver` anyway.
fn substituted_map_type(ctx: &RuntimeContext, map_type: u32) -> u32 {
    if map_type == BPF_MAP_TYPE_DEVMAP as u32 && !ctx.is_at_least_kernel_version(4, 14, 0) {
        return BPF_MAP_TYPE_ARRAY as u32;
    }
    if map_type == BPF_MAP_TYPE_DEVMAP_HASH as u32 && !ctx.is_at_least_kernel_version(5, 4, 0) {
        return BPF_MAP_TYPE_HASH as u32;
    }
    map_type
}

/// Ringbuf sizes must be a multiple of the page size. `max_entries` is
/// required to be a power of two, so rounding it up to one page is
/// sufficient.
fn effective_max_entries(map_type: u32, max_entries: u32, page_size: u32) -> u32 {
    if map_type == BPF_MAP_TYPE_RINGBUF as u32 && max_entries < page_size {
        page_size
    } else {
        max_entries
    }
}

fn effective_map_flags(map_type: u32, map_flags: u32) -> u32 {
    let mut flags = map_flags;
    // devmaps are readonly from the program side
    if map_type == BPF_MAP_TYPE_DEVMAP as u32 || map_type == BPF_MAP_TYPE_DEVMAP_HASH as u32 {
        flags |= BPF_F_RDONLY_PROG;
    }
    if map_type == BPF_MAP_TYPE_LPM_TRIE as u32 {
        flags |= BPF_F_NO_PREALLOC;
    }
    flags
}

/// Compares the kernel's view of the map with the (post-substitution,
/// post-adjustment) declared shape. On pre-4.14 kernels there is no
/// OBJ_GET_INFO_BY_FD, so the map is assumed to match; newer devices give
/// nearly equivalent coverage for the misconfigurations this catches.
fn map_matches(
    ctx: &RuntimeContext,
    fd: BorrowedFd<'_>,
    name: &str,
    map_type: u32,
    def: &MapDef,
    max_entries: u32,
    map_flags: u32,
) -> bool {
    if !ctx.is_at_least_kernel_version(4, 14, 0) {
        return true;
    }

    fn check(
        found: Result<u32, InfoError>,
        want: u32,
        what: &str,
        name: &str,
    ) -> bool {
        match found {
            Ok(got) if got == want => true,
            Ok(got) => {
                error!("map {name} {what} mismatch: desired/found: {want}/{got}");
                false
            }
            // a kernel too old to report the field cannot be checked on it
            Err(InfoError::Unsupported) => true,
            Err(e) => {
                error!("map {name}: unable to read {what}: {e}");
                false
            }
        }
    }

    check(sys::bpf_get_fd_map_type(fd), map_type, "type", name)
        && check(sys::bpf_get_fd_key_size(fd), def.key_size, "key size", name)
        && check(
            sys::bpf_get_fd_value_size(fd),
            def.value_size,
            "value size",
            name,
        )
        && check(
            sys::bpf_get_fd_max_entries(fd),
            max_entries,
            "max entries",
            name,
        )
        && check(sys::bpf_get_fd_map_flags(fd), map_flags, "flags", name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{kver, Arch, BuildType};

    fn ctx(kernel_version: u32) -> RuntimeContext {
        RuntimeContext::for_test(kernel_version, Arch::Arm, true, true, BuildType::User)
    }

    #[test]
    fn test_devmap_substitution_on_old_kernels() {
        let old = ctx(kver(4, 9, 0));
        assert_eq!(
            substituted_map_type(&old, BPF_MAP_TYPE_DEVMAP as u32),
            BPF_MAP_TYPE_ARRAY as u32
        );
        assert_eq!(
            substituted_map_type(&old, BPF_MAP_TYPE_DEVMAP_HASH as u32),
            BPF_MAP_TYPE_HASH as u32
        );

        let mid = ctx(kver(4, 19, 0));
        assert_eq!(
            substituted_map_type(&mid, BPF_MAP_TYPE_DEVMAP as u32),
            BPF_MAP_TYPE_DEVMAP as u32
        );
        assert_eq!(
            substituted_map_type(&mid, BPF_MAP_TYPE_DEVMAP_HASH as u32),
            BPF_MAP_TYPE_HASH as u32
        );

        let new = ctx(kver(5, 4, 0));
        assert_eq!(
            substituted_map_type(&new, BPF_MAP_TYPE_DEVMAP_HASH as u32),
            BPF_MAP_TYPE_DEVMAP_HASH as u32
        );
        // other types pass through untouched
        assert_eq!(
            substituted_map_type(&old, BPF_MAP_TYPE_HASH as u32),
            BPF_MAP_TYPE_HASH as u32
        );
    }

    #[test]
    fn test_ringbuf_entries_round_up_to_page_size() {
        let ringbuf = BPF_MAP_TYPE_RINGBUF as u32;
        assert_eq!(effective_max_entries(ringbuf, 16, 4096), 4096);
        assert_eq!(effective_max_entries(ringbuf, 4096, 4096), 4096);
        assert_eq!(effective_max_entries(ringbuf, 16384, 4096), 16384);
        // only ringbufs are adjusted
        assert_eq!(
            effective_max_entries(BPF_MAP_TYPE_HASH as u32, 16, 4096),
            16
        );
    }

    #[test]
    fn test_effective_map_flags() {
        assert_eq!(
            effective_map_flags(BPF_MAP_TYPE_DEVMAP as u32, 0),
            BPF_F_RDONLY_PROG
        );
        assert_eq!(
            effective_map_flags(BPF_MAP_TYPE_DEVMAP_HASH as u32, 0x10),
            0x10 | BPF_F_RDONLY_PROG
        );
        assert_eq!(
            effective_map_flags(BPF_MAP_TYPE_LPM_TRIE as u32, 0),
            BPF_F_NO_PREALLOC
        );
        assert_eq!(effective_map_flags(BPF_MAP_TYPE_HASH as u32, 0x10), 0x10);
    }
}
