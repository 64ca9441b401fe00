//! Loader error types.

use std::io;

use thiserror::Error;

use crate::sys::SyscallError;

/// A fatal error while loading one object. The orchestrator records the
/// failure for the location and keeps going; optional-program load
/// failures never surface here.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to parse object")]
    Parse(#[from] netbpf_obj::ParseError),

    #[error(transparent)]
    Syscall(#[from] SyscallError),

    /// A pre-existing pinned map does not have the declared shape. Loading
    /// more of the object would wire programs to the wrong map.
    #[error("map `{name}` does not match the map pinned at `{path}`")]
    NotUnique { name: String, path: String },

    #[error("object has a malformed `license` section")]
    BadLicense,

    #[error("program `{name}` has no program definition")]
    MissingProgramDef { name: String },

    #[error("BPF_PROG_LOAD of `{name}` failed")]
    ProgLoad {
        name: String,
        #[source]
        io_error: io::Error,
    },

    #[error("{op} `{path}` failed")]
    Os {
        op: &'static str,
        path: String,
        #[source]
        io_error: io::Error,
    },
}
