//! Shared data model for the corewalk crates.
//!
//! This crate holds the pieces that both the symbol side and the unwinding
//! side of crash analysis need to agree on: CPU register contexts for the
//! supported architectures, the [`Module`] lookup interface and the
//! [`ModuleList`] address-range index, and the read-only [`StackMemory`]
//! view over a captured stack range.

pub mod context;
pub mod memory;
pub mod module;

pub use crate::context::{
    Arm64RegisterNumbers, ArmRegisterNumbers, Context, ContextValidity, CpuContext,
    MipsRegisterNumbers, PpcRegisterNumbers, RawContext, SparcRegisterNumbers, CONTEXT_AMD64,
    CONTEXT_ARM, CONTEXT_ARM64, CONTEXT_MIPS, CONTEXT_PPC, CONTEXT_SPARC, CONTEXT_X86,
};
pub use crate::memory::StackMemory;
pub use crate::module::{Module, ModuleInfo, ModuleList};

/// Like `PathBuf::file_name`, but works on Windows and POSIX style paths.
pub fn basename(f: &str) -> &str {
    match f.rfind(|c| c == '/' || c == '\\') {
        None => f,
        Some(index) => &f[(index + 1)..],
    }
}
