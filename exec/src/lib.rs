//! The dispatcher: owns the guest state, the code cache and the jump table,
//! runs recompiled regions through the trampoline and services the yield
//! records they write back.

pub mod engine;
pub mod error;

pub use engine::Engine;
pub use error::EngineError;
