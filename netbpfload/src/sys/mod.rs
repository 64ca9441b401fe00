//! Typed wrappers over the `bpf(2)` system call multiplexer.

mod bpf;

use std::io;
use std::mem;
use std::os::fd::{FromRawFd as _, OwnedFd, RawFd};

pub use bpf::*;
use netbpf_obj::generated::{bpf_attr, bpf_cmd};
use thiserror::Error;

/// A failed kernel call, tagged with the operation that issued it.
#[derive(Debug, Error)]
#[error("`{call}` failed")]
pub struct SyscallError {
    /// The name of the syscall that failed.
    pub call: &'static str,
    /// The [`io::Error`] returned by the syscall.
    #[source]
    pub io_error: io::Error,
}

pub(crate) type SysResult<T> = Result<T, SyscallError>;

fn sys_bpf(cmd: bpf_cmd, attr: &mut bpf_attr) -> Result<i64, io::Error> {
    // The kernel zero-checks every byte of bpf_attr beyond the struct the
    // command consumes (E2BIG otherwise); callers hand us zeroed storage.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_bpf,
            cmd as libc::c_int,
            attr as *mut bpf_attr,
            mem::size_of::<bpf_attr>(),
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as i64)
}

/// # Safety
///
/// Only for commands documented to return a new file descriptor.
unsafe fn fd_sys_bpf(cmd: bpf_cmd, attr: &mut bpf_attr) -> Result<OwnedFd, io::Error> {
    let fd = sys_bpf(cmd, attr)?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
}
