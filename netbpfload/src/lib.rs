//! Userspace loader for network eBPF objects.
//!
//! The loader scans known directories for `.o` files, parses each object
//! with [`netbpf_obj`], creates or reuses the kernel maps it declares,
//! patches map descriptors into the programs, loads the programs and pins
//! everything into the BPF filesystem under `/sys/fs/bpf/` with the
//! declared ownership and mode. It runs once per boot, synchronously and
//! single-threaded; the BPF filesystem is the only state it leaves behind.
//!
//! Whether a given map or program is loaded at all is decided by a
//! compatibility matrix over the loader version, the kernel version, the
//! build flavor and the CPU architecture; see [`env`].

pub mod domain;
pub mod env;
pub mod errors;
pub mod loader;
pub mod properties;
pub mod sys;

mod maps;
mod programs;
mod util;

pub use errors::LoadError;

/// Logs and aborts for conditions that cannot arise from valid inputs:
/// unknown domains, corrupt definition records, an undeterminable kernel
/// version. The objects this loader consumes ship in the same artifact as
/// the loader itself, so these indicate a build or sepolicy bug, not bad
/// input.
#[macro_export]
macro_rules! bug {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        std::process::abort();
    }};
}
