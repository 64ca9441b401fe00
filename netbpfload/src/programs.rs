//! Program loading, verifier-log handling and pinning.

use std::borrow::Cow;
use std::ffi::CStr;
use std::fs;
use std::os::fd::AsFd as _;
use std::os::unix::fs::{chown, PermissionsExt as _};
use std::path::Path;

use log::{debug, error, info, warn};
use netbpf_obj::CodeSection;

use crate::domain::{self, Domain};
use crate::env::{skip_reason, RuntimeContext};
use crate::errors::LoadError;
use crate::sys;
use crate::util::{c_path, path_exists, rename_noreplace};

/// 1 MiB: enough for any verifier complaint worth reading.
const LOG_BUF_SIZE: usize = 1 << 20;

/// Loads and pins every code section, in section order. Sections whose
/// definition is gated out are skipped; optional programs that fail the
/// verifier are logged and skipped; anything else failing is fatal for the
/// object.
pub(crate) fn load_code_sections(
    ctx: &RuntimeContext,
    sections: &[CodeSection],
    license: &CStr,
    object_path: &Path,
    prefix: &str,
    loader_version: u32,
) -> Result<(), LoadError> {
    let obj_name = domain::object_name(object_path);

    for cs in sections {
        let Some(def) = cs.prog_def.as_ref() else {
            error!("program {} has no definition; bad object build?", cs.name);
            return Err(LoadError::MissingProgramDef {
                name: cs.name.clone(),
            });
        };
        if let Some(reason) = skip_reason(ctx, loader_version, &def.constraints()) {
            debug!("skipping program {} which {reason}", cs.name);
            continue;
        }

        let selinux_context = Domain::from_selinux_context(&def.selinux_context)
            .unwrap_or_else(|e| crate::bug!("program {}: {e}", cs.name));
        let pin_subdir = Domain::from_pin_subdir(&def.pin_subdir)
            .unwrap_or_else(|e| crate::bug!("program {}: {e}", cs.name));

        let pin_name = domain::canonical_prog_name(&cs.name);
        let pin_path = domain::prog_pin_path(pin_subdir, prefix, &obj_name, pin_name);

        let reuse = path_exists(&pin_path);
        let fd = if reuse {
            debug!("reusing program pinned at {pin_path}");
            sys::retrieve_program(&c_path(&pin_path))?
        } else {
            let mut log_buf = vec![0u8; LOG_BUF_SIZE];
            let prog_name = ctx
                .is_at_least_kernel_version(4, 15, 0)
                .then(|| c_path(&cs.name));
            let loaded = sys::bpf_prog_load(
                prog_name.as_deref(),
                cs.prog_type,
                cs.attach_type,
                &cs.data,
                license,
                ctx.kernel_version(),
                &mut log_buf,
            );
            match loaded {
                Ok(fd) => {
                    debug!(
                        "BPF_PROG_LOAD of {} returned '{}'",
                        cs.name,
                        verifier_log_summary(&log_buf)
                    );
                    fd
                }
                Err(e) => {
                    dump_verifier_log(&cs.name, &log_buf);
                    if def.optional {
                        warn!("failed program {} is marked optional - continuing...", cs.name);
                        continue;
                    }
                    error!("non-optional program {} failed to load", cs.name);
                    return Err(LoadError::ProgLoad {
                        name: cs.name.clone(),
                        io_error: e.io_error,
                    });
                }
            }
        };

        if !reuse {
            if selinux_context.specified() {
                let tmp_path = domain::prog_tmp_pin_path(selinux_context, &obj_name, pin_name);
                sys::bpf_pin_object(fd.as_fd(), &c_path(&tmp_path))?;
                rename_noreplace(&tmp_path, &pin_path)?;
            } else {
                sys::bpf_pin_object(fd.as_fd(), &c_path(&pin_path))?;
            }
            fs::set_permissions(&pin_path, fs::Permissions::from_mode(0o440)).map_err(|e| {
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

        match sys::bpf_get_fd_prog_id(fd.as_fd()) {
            Ok(id) => info!("prog {pin_path} id {id}"),
            Err(e) => error!("bpf_get_fd_prog_id of {}: {e}", cs.name),
        }
    }
    Ok(())
}

/// The kernel NUL-terminates the log; everything after the first NUL is
/// stale buffer content.
fn verifier_log(log_buf: &[u8]) -> Cow<'_, str> {
    let end = log_buf.iter().position(|&b| b == 0).unwrap_or(log_buf.len());
    String::from_utf8_lossy(&log_buf[..end])
}

fn verifier_log_summary(log_buf: &[u8]) -> String {
    let log = verifier_log(log_buf);
    let log = log.trim_end_matches('\n');
    if log.contains('\n') {
        "{multiline}".to_string()
    } else {
        log.to_string()
    }
}

fn dump_verifier_log(name: &str, log_buf: &[u8]) {
    let log = verifier_log(log_buf);
    let log = log.trim_end_matches('\n');
    if log.is_empty() {
        return;
    }
    warn!("BPF_PROG_LOAD {name} - BEGIN log_buf contents:");
    for line in log.lines() {
        warn!("{line}");
    }
    warn!("BPF_PROG_LOAD {name} - END log_buf contents.");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verifier_log_stops_at_nul() {
        let mut buf = vec![0u8; 32];
        buf[..12].copy_from_slice(b"processed 4\n");
        buf[13] = b'x'; // stale garbage beyond the NUL
        assert_eq!(verifier_log(&buf), "processed 4\n");
        assert_eq!(verifier_log_summary(&buf), "processed 4");
    }

    #[test]
    fn test_verifier_log_summary_multiline() {
        let mut buf = vec![0u8; 32];
        buf[..10].copy_from_slice(b"line\nline\n");
        assert_eq!(verifier_log_summary(&buf), "{multiline}");
    }

    #[test]
    fn test_verifier_log_without_nul() {
        let buf = b"full buffer".to_vec();
        assert_eq!(verifier_log(&buf), "full buffer");
    }
}
