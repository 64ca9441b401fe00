//! SELinux domains and pin-path construction.
//!
//! Objects may tag each map and program with a `selinux_context` and a
//! `pin_subdir`. Both decode to the same [`Domain`] enumeration, because a
//! SELinux context can only be assigned by creating the pin inside a
//! directory that a `genfscon` rule labels with the wanted context, then
//! renaming it to its final location - so every context the loader knows
//! corresponds 1:1 to a subdirectory of the BPF filesystem.

use std::path::Path;

use thiserror::Error;

/// Root of the BPF filesystem.
pub const BPF_FS_PATH: &str = "/sys/fs/bpf/";

/// Every SELinux context / pin subdirectory pair the loader knows about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Domain {
    /// Use the default for the pin location.
    Unspecified,
    /// (S+) fs_bpf_tethering     /sys/fs/bpf/tethering
    Tethering,
    /// (T+) fs_bpf_net_private   /sys/fs/bpf/net_private
    NetPrivate,
    /// (T+) fs_bpf_net_shared    /sys/fs/bpf/net_shared
    NetShared,
    /// (T+) fs_bpf_netd_readonly /sys/fs/bpf/netd_readonly
    NetdReadonly,
    /// (T+) fs_bpf_netd_shared   /sys/fs/bpf/netd_shared
    NetdShared,
    /// (U+) fs_bpf_loader        /sys/fs/bpf/loader
    Loader,
}

/// An unrecognized `selinux_context` or `pin_subdir` value. Objects ship
/// with the loader, so callers treat this as a build bug and abort.
#[derive(Debug, Error)]
#[error("unrecognized {field} `{value}`")]
pub struct UnknownDomain {
    field: &'static str,
    value: String,
}

impl Domain {
    pub const ALL: [Domain; 7] = [
        Domain::Unspecified,
        Domain::Tethering,
        Domain::NetPrivate,
        Domain::NetShared,
        Domain::NetdReadonly,
        Domain::NetdShared,
        Domain::Loader,
    ];

    pub fn specified(self) -> bool {
        self != Domain::Unspecified
    }

    pub fn selinux_context(self) -> &'static str {
        match self {
            Domain::Unspecified => "",
            Domain::Tethering => "fs_bpf_tethering",
            Domain::NetPrivate => "fs_bpf_net_private",
            Domain::NetShared => "fs_bpf_net_shared",
            Domain::NetdReadonly => "fs_bpf_netd_readonly",
            Domain::NetdShared => "fs_bpf_netd_shared",
            Domain::Loader => "fs_bpf_loader",
        }
    }

    /// Subdirectory name, with trailing slash, under [`BPF_FS_PATH`].
    pub fn pin_subdir(self) -> &'static str {
        match self {
            Domain::Unspecified => "",
            Domain::Tethering => "tethering/",
            Domain::NetPrivate => "net_private/",
            Domain::NetShared => "net_shared/",
            Domain::NetdReadonly => "netd_readonly/",
            Domain::NetdShared => "netd_shared/",
            Domain::Loader => "loader/",
        }
    }

    /// Decodes the NUL-padded `selinux_context` field of a definition.
    pub fn from_selinux_context(field: &[u8; 32]) -> Result<Domain, UnknownDomain> {
        let value = decode_field(field);
        Domain::ALL
            .into_iter()
            .find(|d| d.selinux_context() == value)
            .ok_or(UnknownDomain {
                field: "selinux_context",
                value,
            })
    }

    /// Decodes the NUL-padded `pin_subdir` field of a definition. The
    /// on-disk value has no trailing slash.
    pub fn from_pin_subdir(field: &[u8; 32]) -> Result<Domain, UnknownDomain> {
        let value = decode_field(field);
        Domain::ALL
            .into_iter()
            .find(|d| d.pin_subdir().trim_end_matches('/') == value)
            .ok_or(UnknownDomain {
                field: "pin_subdir",
                value,
            })
    }
}

fn decode_field(field: &[u8; 32]) -> String {
    let len = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..len]).into_owned()
}

/// The pin subdirectory of `d`, or `fallback` when unspecified.
pub fn pin_subdir_or(d: Domain, fallback: &str) -> &str {
    match d {
        Domain::Unspecified => fallback,
        d => d.pin_subdir(),
    }
}

/// The object name of a `.o` path: basename with the extension stripped,
/// then any `@...` suffix stripped. The suffix allows shipping duplicate
/// objects selected by loader version.
pub fn object_name(path: &Path) -> String {
    let file = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = match file.rfind('.') {
        Some(i) => &file[..i],
        None => &file[..],
    };
    match stem.rfind('@') {
        Some(i) => stem[..i].to_string(),
        None => stem.to_string(),
    }
}

/// Strips the `@...` or `$...` suffix used to ship duplicate programs
/// selected by loader or kernel version.
pub fn canonical_prog_name(name: &str) -> &str {
    let name = match name.rfind('$') {
        Some(i) => &name[..i],
        None => name,
    };
    match name.rfind('@') {
        Some(i) => &name[..i],
        None => name,
    }
}

/// `/sys/fs/bpf/<subdir|prefix>map_<obj>_<map>`; maps shared across
/// objects drop the object name.
pub fn map_pin_path(
    pin_subdir: Domain,
    prefix: &str,
    obj_name: &str,
    map_name: &str,
    shared: bool,
) -> String {
    let obj = if shared { "" } else { obj_name };
    format!(
        "{BPF_FS_PATH}{}map_{obj}_{map_name}",
        pin_subdir_or(pin_subdir, prefix)
    )
}

/// Staging path used to label a map via pin-then-rename.
pub fn map_tmp_pin_path(selinux_context: Domain, obj_name: &str, map_name: &str) -> String {
    format!(
        "{BPF_FS_PATH}{}tmp_map_{obj_name}_{map_name}",
        selinux_context.pin_subdir()
    )
}

/// `/sys/fs/bpf/<subdir|prefix>prog_<obj>_<prog>`.
pub fn prog_pin_path(pin_subdir: Domain, prefix: &str, obj_name: &str, prog_name: &str) -> String {
    format!(
        "{BPF_FS_PATH}{}prog_{obj_name}_{prog_name}",
        pin_subdir_or(pin_subdir, prefix)
    )
}

/// Staging path used to label a program via pin-then-rename.
pub fn prog_tmp_pin_path(selinux_context: Domain, obj_name: &str, prog_name: &str) -> String {
    format!(
        "{BPF_FS_PATH}{}tmp_prog_{obj_name}_{prog_name}",
        selinux_context.pin_subdir()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(s: &str) -> [u8; 32] {
        let mut buf = [0u8; 32];
        buf[..s.len()].copy_from_slice(s.as_bytes());
        buf
    }

    #[test]
    fn test_domain_tables_are_total_and_distinct() {
        for d in Domain::ALL {
            assert_eq!(Domain::from_selinux_context(&field(d.selinux_context())).unwrap(), d);
            assert_eq!(
                Domain::from_pin_subdir(&field(d.pin_subdir().trim_end_matches('/'))).unwrap(),
                d
            );
            if d.specified() {
                assert!(d.selinux_context().starts_with("fs_bpf_"));
                assert!(d.pin_subdir().ends_with('/'));
                // everything must fit the 32-byte NUL-terminated field
                assert!(d.selinux_context().len() < 32);
                assert!(d.pin_subdir().len() < 32);
            }
        }
    }

    #[test]
    fn test_unknown_domain_is_an_error() {
        assert!(Domain::from_selinux_context(&field("fs_bpf_bogus")).is_err());
        assert!(Domain::from_pin_subdir(&field("bogus")).is_err());
        // an unspecified (all-NUL) field decodes to Unspecified
        assert_eq!(
            Domain::from_selinux_context(&[0u8; 32]).unwrap(),
            Domain::Unspecified
        );
    }

    #[test]
    fn test_object_name() {
        assert_eq!(object_name(Path::new("/apex/etc/bpf/offload.o")), "offload");
        assert_eq!(object_name(Path::new("offload@btf.o")), "offload");
        assert_eq!(object_name(Path::new("netd.o")), "netd");
    }

    #[test]
    fn test_canonical_prog_name() {
        assert_eq!(canonical_prog_name("cgroupskb_ingress_stats"), "cgroupskb_ingress_stats");
        assert_eq!(canonical_prog_name("schedcls_tether$4_14"), "schedcls_tether");
        assert_eq!(canonical_prog_name("xdp_filter@v2"), "xdp_filter");
    }

    #[test]
    fn test_map_pin_path_composition() {
        let path = map_pin_path(Domain::Unspecified, "tethering/", "foo", "m", false);
        assert_eq!(path, "/sys/fs/bpf/tethering/map_foo_m");

        // shared maps drop the object name
        let shared = map_pin_path(Domain::Unspecified, "tethering/", "foo", "m", true);
        assert_eq!(shared, "/sys/fs/bpf/tethering/map__m");

        // an explicit pin_subdir overrides the location prefix
        let netd = map_pin_path(Domain::NetdShared, "tethering/", "foo", "m", false);
        assert_eq!(netd, "/sys/fs/bpf/netd_shared/map_foo_m");
    }

    #[test]
    fn test_tmp_pin_paths_use_the_selinux_subdir() {
        assert_eq!(
            map_tmp_pin_path(Domain::NetShared, "foo", "m"),
            "/sys/fs/bpf/net_shared/tmp_map_foo_m"
        );
        assert_eq!(
            prog_tmp_pin_path(Domain::Tethering, "foo", "cgroupskb_bar"),
            "/sys/fs/bpf/tethering/tmp_prog_foo_cgroupskb_bar"
        );
    }

    #[test]
    fn test_prog_pin_path_composition() {
        assert_eq!(
            prog_pin_path(Domain::Unspecified, "tethering/", "foo", "cgroupskb_bar"),
            "/sys/fs/bpf/tethering/prog_foo_cgroupskb_bar"
        );
    }
}
