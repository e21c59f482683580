//! Host-side machinery of the recompiler: the executable memory arena, the
//! x86-64 instruction emitter, the entry/exit trampoline, the code cache and
//! the jump table.

pub mod cache;
pub mod emitter;
pub mod exec_buffer;
pub mod jump_table;
pub mod trampoline;

pub use cache::{CacheRegion, CodeCache, MAX_CACHE_SZ, MAX_OPCODE_HOST_BYTES};
pub use exec_buffer::ExecBuffer;
pub use jump_table::JumpTable;
pub use trampoline::Trampoline;
