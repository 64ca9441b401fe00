//! Small filesystem helpers shared by the managers and the orchestrator.

use std::ffi::CString;
use std::fs;
use std::io;

use crate::errors::LoadError;

/// Existence probe for pin paths. Anything other than a clean yes/no means
/// permissions (likely sepolicy) are broken, which no amount of retrying
/// will fix.
pub(crate) fn path_exists(path: &str) -> bool {
    match fs::metadata(path) {
        Ok(_) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => crate::bug!("access {path}: {e}"),
    }
}

pub(crate) fn c_path(path: &str) -> CString {
    // pin paths are assembled from fixed prefixes and ELF identifiers,
    // neither of which can contain NUL
    match CString::new(path) {
        Ok(c) => c,
        Err(_) => crate::bug!("path contains NUL: {path}"),
    }
}

/// `renameat2(RENAME_NOREPLACE)`: atomically moves a staged pin to its
/// final path, refusing to clobber an existing pin.
pub(crate) fn rename_noreplace(from: &str, to: &str) -> Result<(), LoadError> {
    let from_c = c_path(from);
    let to_c = c_path(to);
    let ret = unsafe {
        libc::renameat2(
            libc::AT_FDCWD,
            from_c.as_ptr(),
            libc::AT_FDCWD,
            to_c.as_ptr(),
            libc::RENAME_NOREPLACE,
        )
    };
    if ret != 0 {
        return Err(LoadError::Os {
            op: "rename",
            path: to.to_string(),
            io_error: io::Error::last_os_error(),
        });
    }
    Ok(())
}
