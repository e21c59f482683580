use std::io;
use std::path::PathBuf;

use c8jit_core::{RomError, StackError};

/// Fatal conditions the dispatcher cannot recover from. Everything the JIT
/// *can* recover from (self-modifying code, exhausted regions, unresolved
/// jump targets) is a yield code, not an error.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to read ROM {path}")]
    RomRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Rom(#[from] RomError),
    #[error("executable memory allocation failed")]
    CodeAlloc(#[from] io::Error),
    #[error(transparent)]
    Stack(#[from] StackError),
    #[error("emitted code wrote an out-of-range yield tag {0}")]
    BadYieldTag(u32),
    #[error("indirect-jump yield carried a non-0xB opcode 0x{0:04X}")]
    BadIndirectOpcode(u16),
    #[error("stack-jump yield carried an unexpected opcode 0x{0:04X}")]
    BadStackOpcode(u16),
}
