//! One function per `bpf(2)` command, shaped the way the loader and its
//! downstream map consumers call them.

use std::cmp;
use std::ffi::CStr;
use std::io;
use std::mem::{self, offset_of, MaybeUninit};
use std::os::fd::{AsFd as _, AsRawFd as _, BorrowedFd, OwnedFd};

use libc::{EINVAL, ENOENT};
use netbpf_obj::generated::{
    bpf_attach_type, bpf_attr, bpf_cmd, bpf_map_info, bpf_prog_info, bpf_prog_type,
    BPF_F_RDONLY, BPF_F_WRONLY, BPF_OBJ_NAME_LEN,
};
use thiserror::Error;

use super::{fd_sys_bpf, sys_bpf, SysResult, SyscallError};

fn copy_obj_name(dst: &mut [u8; BPF_OBJ_NAME_LEN], name: &CStr) {
    // 16 bytes max and must stay NUL terminated
    let len = cmp::min(name.to_bytes().len(), BPF_OBJ_NAME_LEN - 1);
    dst[..len].copy_from_slice(&name.to_bytes()[..len]);
}

pub fn bpf_create_map(
    name: Option<&CStr>,
    map_type: u32,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    map_flags: u32,
) -> SysResult<OwnedFd> {
    let mut attr = unsafe { mem::zeroed::<bpf_attr>() };
    let u = unsafe { &mut attr.map_create };
    u.map_type = map_type;
    u.key_size = key_size;
    u.value_size = value_size;
    u.max_entries = max_entries;
    u.map_flags = map_flags;
    if let Some(name) = name {
        copy_obj_name(&mut u.map_name, name);
    }
    // SAFETY: BPF_MAP_CREATE returns a new file descriptor.
    unsafe { fd_sys_bpf(bpf_cmd::BPF_MAP_CREATE, &mut attr) }.map_err(|io_error| SyscallError {
        call: "bpf_map_create",
        io_error,
    })
}

/// Creates an ARRAY_OF_MAPS or HASH_OF_MAPS map; `inner_map_fd` is a
/// template for the shape of the maps the new map will hold.
pub fn bpf_create_outer_map(
    name: Option<&CStr>,
    map_type: u32,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    map_flags: u32,
    inner_map_fd: BorrowedFd<'_>,
) -> SysResult<OwnedFd> {
    let mut attr = unsafe { mem::zeroed::<bpf_attr>() };
    let u = unsafe { &mut attr.map_create };
    u.map_type = map_type;
    u.key_size = key_size;
    u.value_size = value_size;
    u.max_entries = max_entries;
    u.map_flags = map_flags;
    u.inner_map_fd = inner_map_fd.as_raw_fd() as u32;
    if let Some(name) = name {
        copy_obj_name(&mut u.map_name, name);
    }
    // SAFETY: BPF_MAP_CREATE returns a new file descriptor.
    unsafe { fd_sys_bpf(bpf_cmd::BPF_MAP_CREATE, &mut attr) }.map_err(|io_error| SyscallError {
        call: "bpf_map_create",
        io_error,
    })
}

pub fn bpf_map_update_elem<K, V>(
    fd: BorrowedFd<'_>,
    key: &K,
    value: &V,
    flags: u64,
) -> SysResult<()> {
    let mut attr = unsafe { mem::zeroed::<bpf_attr>() };
    let u = unsafe { &mut attr.map_elem };
    u.map_fd = fd.as_raw_fd() as u32;
    u.key = key as *const K as u64;
    u.value = value as *const V as u64;
    u.flags = flags;
    sys_bpf(bpf_cmd::BPF_MAP_UPDATE_ELEM, &mut attr)
        .map(|_| ())
        .map_err(|io_error| SyscallError {
            call: "bpf_map_update_elem",
            io_error,
        })
}

/// Returns `None` when the key is not present.
pub fn bpf_map_lookup_elem<K, V: Copy>(fd: BorrowedFd<'_>, key: &K) -> SysResult<Option<V>> {
    let mut value = MaybeUninit::<V>::uninit();
    let mut attr = unsafe { mem::zeroed::<bpf_attr>() };
    let u = unsafe { &mut attr.map_elem };
    u.map_fd = fd.as_raw_fd() as u32;
    u.key = key as *const K as u64;
    u.value = value.as_mut_ptr() as u64;
    match sys_bpf(bpf_cmd::BPF_MAP_LOOKUP_ELEM, &mut attr) {
        Ok(_) => Ok(Some(unsafe { value.assume_init() })),
        Err(io_error) if io_error.raw_os_error() == Some(ENOENT) => Ok(None),
        Err(io_error) => Err(SyscallError {
            call: "bpf_map_lookup_elem",
            io_error,
        }),
    }
}

pub fn bpf_map_delete_elem<K>(fd: BorrowedFd<'_>, key: &K) -> SysResult<()> {
    let mut attr = unsafe { mem::zeroed::<bpf_attr>() };
    let u = unsafe { &mut attr.map_elem };
    u.map_fd = fd.as_raw_fd() as u32;
    u.key = key as *const K as u64;
    sys_bpf(bpf_cmd::BPF_MAP_DELETE_ELEM, &mut attr)
        .map(|_| ())
        .map_err(|io_error| SyscallError {
            call: "bpf_map_delete_elem",
            io_error,
        })
}

/// Iteration step; `None` as `key` starts from the beginning and `None` as
/// result means the end of the map was reached.
pub fn bpf_map_get_next_key<K: Copy>(
    fd: BorrowedFd<'_>,
    key: Option<&K>,
) -> SysResult<Option<K>> {
    let mut next_key = MaybeUninit::<K>::uninit();
    let mut attr = unsafe { mem::zeroed::<bpf_attr>() };
    let u = unsafe { &mut attr.map_elem };
    u.map_fd = fd.as_raw_fd() as u32;
    if let Some(key) = key {
        u.key = key as *const K as u64;
    }
    u.value = next_key.as_mut_ptr() as u64;
    match sys_bpf(bpf_cmd::BPF_MAP_GET_NEXT_KEY, &mut attr) {
        Ok(_) => Ok(Some(unsafe { next_key.assume_init() })),
        Err(io_error) if io_error.raw_os_error() == Some(ENOENT) => Ok(None),
        Err(io_error) => Err(SyscallError {
            call: "bpf_map_get_next_key",
            io_error,
        }),
    }
}

/// Pins `fd` into the BPF filesystem at `path`. The fd stays valid.
pub fn bpf_pin_object(fd: BorrowedFd<'_>, path: &CStr) -> SysResult<()> {
    let mut attr = unsafe { mem::zeroed::<bpf_attr>() };
    let u = unsafe { &mut attr.obj };
    u.pathname = path.as_ptr() as u64;
    u.bpf_fd = fd.as_raw_fd() as u32;
    sys_bpf(bpf_cmd::BPF_OBJ_PIN, &mut attr)
        .map(|_| ())
        .map_err(|io_error| SyscallError {
            call: "bpf_obj_pin",
            io_error,
        })
}

/// Retrieves a previously pinned object. `file_flags` is 0 for read-write
/// access, or `BPF_F_RDONLY` / `BPF_F_WRONLY`.
pub fn bpf_get_object(path: &CStr, file_flags: u32) -> SysResult<OwnedFd> {
    let mut attr = unsafe { mem::zeroed::<bpf_attr>() };
    let u = unsafe { &mut attr.obj };
    u.pathname = path.as_ptr() as u64;
    u.file_flags = file_flags;
    // SAFETY: BPF_OBJ_GET returns a new file descriptor.
    unsafe { fd_sys_bpf(bpf_cmd::BPF_OBJ_GET, &mut attr) }.map_err(|io_error| SyscallError {
        call: "bpf_obj_get",
        io_error,
    })
}

pub(crate) fn bpf_prog_load(
    name: Option<&CStr>,
    prog_type: bpf_prog_type,
    expected_attach_type: Option<bpf_attach_type>,
    insns: &[u8],
    license: &CStr,
    kern_version: u32,
    log_buf: &mut [u8],
) -> SysResult<OwnedFd> {
    let mut attr = unsafe { mem::zeroed::<bpf_attr>() };
    let u = unsafe { &mut attr.prog_load };
    u.prog_type = prog_type as u32;
    if let Some(attach_type) = expected_attach_type {
        u.expected_attach_type = attach_type as u32;
    }
    u.insns = insns.as_ptr() as u64;
    u.insn_cnt = (insns.len() / 8) as u32;
    u.license = license.as_ptr() as u64;
    u.kern_version = kern_version;
    if !log_buf.is_empty() {
        u.log_level = 1;
        u.log_buf = log_buf.as_mut_ptr() as u64;
        u.log_size = log_buf.len() as u32;
    }
    if let Some(name) = name {
        copy_obj_name(&mut u.prog_name, name);
    }
    // SAFETY: BPF_PROG_LOAD returns a new file descriptor.
    unsafe { fd_sys_bpf(bpf_cmd::BPF_PROG_LOAD, &mut attr) }.map_err(|io_error| SyscallError {
        call: "bpf_prog_load",
        io_error,
    })
}

pub fn bpf_prog_attach(
    prog_fd: BorrowedFd<'_>,
    target_fd: BorrowedFd<'_>,
    attach_type: bpf_attach_type,
    flags: u32,
) -> SysResult<()> {
    let mut attr = unsafe { mem::zeroed::<bpf_attr>() };
    let u = unsafe { &mut attr.prog_attach };
    u.target_fd = target_fd.as_raw_fd() as u32;
    u.attach_bpf_fd = prog_fd.as_raw_fd() as u32;
    u.attach_type = attach_type as u32;
    u.attach_flags = flags;
    sys_bpf(bpf_cmd::BPF_PROG_ATTACH, &mut attr)
        .map(|_| ())
        .map_err(|io_error| SyscallError {
            call: "bpf_prog_attach",
            io_error,
        })
}

pub fn bpf_prog_detach(target_fd: BorrowedFd<'_>, attach_type: bpf_attach_type) -> SysResult<()> {
    let mut attr = unsafe { mem::zeroed::<bpf_attr>() };
    let u = unsafe { &mut attr.prog_attach };
    u.target_fd = target_fd.as_raw_fd() as u32;
    u.attach_type = attach_type as u32;
    sys_bpf(bpf_cmd::BPF_PROG_DETACH, &mut attr)
        .map(|_| ())
        .map_err(|io_error| SyscallError {
            call: "bpf_prog_detach",
            io_error,
        })
}

/// Returns the id of the program attached at `target_fd` for
/// `attach_type`, or `None` when nothing is attached. The kernel never
/// hands out id zero.
pub fn bpf_prog_query(
    target_fd: BorrowedFd<'_>,
    attach_type: bpf_attach_type,
) -> SysResult<Option<u32>> {
    let mut prog_id: u32 = 0;
    let mut attr = unsafe { mem::zeroed::<bpf_attr>() };
    let u = unsafe { &mut attr.query };
    u.target_fd = target_fd.as_raw_fd() as u32;
    u.attach_type = attach_type as u32;
    u.prog_ids = &mut prog_id as *mut u32 as u64;
    u.prog_cnt = 1;
    sys_bpf(bpf_cmd::BPF_PROG_QUERY, &mut attr).map_err(|io_error| SyscallError {
        call: "bpf_prog_query",
        io_error,
    })?;
    if unsafe { attr.query.prog_cnt } == 0 {
        return Ok(None);
    }
    Ok(Some(prog_id))
}

/// Runs a program against `data_in` (4.12+). Returns the program's return
/// value.
pub fn bpf_prog_run(prog_fd: BorrowedFd<'_>, data_in: &[u8]) -> SysResult<u32> {
    let mut attr = unsafe { mem::zeroed::<bpf_attr>() };
    let u = unsafe { &mut attr.test };
    u.prog_fd = prog_fd.as_raw_fd() as u32;
    u.data_size_in = data_in.len() as u32;
    u.data_in = data_in.as_ptr() as u64;
    sys_bpf(bpf_cmd::BPF_PROG_RUN, &mut attr).map_err(|io_error| SyscallError {
        call: "bpf_prog_run",
        io_error,
    })?;
    Ok(unsafe { attr.test.retval })
}

/// The error type returned when reading object info back from a fd.
#[derive(Debug, Error)]
pub enum InfoError {
    #[error("bpf_obj_get_info_by_fd failed")]
    Syscall(#[source] io::Error),

    /// The running kernel's info struct is too old to contain the field.
    #[error("field not reported by this kernel")]
    Unsupported,
}

fn bpf_obj_get_info_by_fd<T: Copy>(fd: BorrowedFd<'_>) -> Result<(T, usize), io::Error> {
    let mut info = unsafe { mem::zeroed::<T>() };
    let mut attr = unsafe { mem::zeroed::<bpf_attr>() };
    let u = unsafe { &mut attr.info };
    u.bpf_fd = fd.as_raw_fd() as u32;
    u.info_len = mem::size_of::<T>() as u32;
    u.info = &mut info as *mut T as u64;
    sys_bpf(bpf_cmd::BPF_OBJ_GET_INFO_BY_FD, &mut attr)?;
    // The kernel reports how much of the struct it actually knows about;
    // fields beyond that are unsupported, not zero.
    Ok((info, unsafe { attr.info.info_len } as usize))
}

fn map_info_field(
    fd: BorrowedFd<'_>,
    field_end: usize,
    get: impl FnOnce(&bpf_map_info) -> u32,
) -> Result<u32, InfoError> {
    let (info, info_len) = bpf_obj_get_info_by_fd::<bpf_map_info>(fd).map_err(InfoError::Syscall)?;
    if info_len < field_end {
        return Err(InfoError::Unsupported);
    }
    Ok(get(&info))
}

pub fn bpf_get_fd_map_type(fd: BorrowedFd<'_>) -> Result<u32, InfoError> {
    map_info_field(fd, offset_of!(bpf_map_info, type_) + 4, |i| i.type_)
}

pub fn bpf_get_fd_map_id(fd: BorrowedFd<'_>) -> Result<u32, InfoError> {
    map_info_field(fd, offset_of!(bpf_map_info, id) + 4, |i| i.id)
}

pub fn bpf_get_fd_key_size(fd: BorrowedFd<'_>) -> Result<u32, InfoError> {
    map_info_field(fd, offset_of!(bpf_map_info, key_size) + 4, |i| i.key_size)
}

pub fn bpf_get_fd_value_size(fd: BorrowedFd<'_>) -> Result<u32, InfoError> {
    map_info_field(fd, offset_of!(bpf_map_info, value_size) + 4, |i| i.value_size)
}

pub fn bpf_get_fd_max_entries(fd: BorrowedFd<'_>) -> Result<u32, InfoError> {
    map_info_field(fd, offset_of!(bpf_map_info, max_entries) + 4, |i| {
        i.max_entries
    })
}

pub fn bpf_get_fd_map_flags(fd: BorrowedFd<'_>) -> Result<u32, InfoError> {
    map_info_field(fd, offset_of!(bpf_map_info, map_flags) + 4, |i| i.map_flags)
}

pub fn bpf_get_fd_prog_id(fd: BorrowedFd<'_>) -> Result<u32, InfoError> {
    let (info, info_len) =
        bpf_obj_get_info_by_fd::<bpf_prog_info>(fd).map_err(InfoError::Syscall)?;
    if info_len < offset_of!(bpf_prog_info, id) + 4 {
        return Err(InfoError::Unsupported);
    }
    Ok(info.id)
}

/// Decorates a pinned-map fd with an advisory OFD lock keyed by the map's
/// kernel id. The lock lives exactly as long as the fd.
fn bpf_lock(fd: OwnedFd, l_type: libc::c_short) -> SysResult<OwnedFd> {
    let map_id = match bpf_get_fd_map_id(fd.as_fd()) {
        Ok(0) => crate::bug!("kernel handed out map id 0"),
        Ok(id) => id,
        // map ids need a 4.14+ kernel; nothing to key the lock on
        Err(InfoError::Syscall(e)) if e.raw_os_error() == Some(EINVAL) => return Ok(fd),
        Err(e) => crate::bug!("unable to read map id for locking: {e}"),
    };
    let lock = libc::flock {
        l_type,
        l_whence: libc::SEEK_SET as libc::c_short,
        l_start: map_id as libc::off_t,
        l_len: 1,
        l_pid: 0,
    };
    if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_OFD_SETLK, &lock) } != 0 {
        // most likely EAGAIN: someone else holds a conflicting lock
        return Err(SyscallError {
            call: "fcntl(F_OFD_SETLK)",
            io_error: io::Error::last_os_error(),
        });
    }
    Ok(fd)
}

pub fn map_retrieve_lockless_rw(path: &CStr) -> SysResult<OwnedFd> {
    bpf_get_object(path, 0)
}

pub fn map_retrieve_rw(path: &CStr) -> SysResult<OwnedFd> {
    bpf_lock(map_retrieve_lockless_rw(path)?, libc::F_RDLCK as libc::c_short)
}

pub fn map_retrieve_exclusive_rw(path: &CStr) -> SysResult<OwnedFd> {
    bpf_lock(map_retrieve_lockless_rw(path)?, libc::F_WRLCK as libc::c_short)
}

pub fn map_retrieve_ro(path: &CStr) -> SysResult<OwnedFd> {
    bpf_get_object(path, BPF_F_RDONLY)
}

/// A shared lock cannot be taken on a write-only fd, so this grabs an
/// exclusive one.
pub fn map_retrieve_wo(path: &CStr) -> SysResult<OwnedFd> {
    bpf_lock(bpf_get_object(path, BPF_F_WRONLY)?, libc::F_WRLCK as libc::c_short)
}

pub fn retrieve_program(path: &CStr) -> SysResult<OwnedFd> {
    bpf_get_object(path, BPF_F_RDONLY)
}
