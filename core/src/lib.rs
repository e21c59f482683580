//! Guest-visible state and shared contracts for the CHIP-8 recompiler.
//!
//! Everything emitted host code is allowed to touch lives in [`VmEnv`], a
//! single `#[repr(C)]` struct addressed from generated code as fixed offsets
//! off the env base register. The dispatcher, translator and encoder crates
//! all build on the offsets exported here.

pub mod stack;
pub mod state;
pub mod timers;

pub use stack::{CallStack, StackError, STACK_DEPTH};
pub use state::{
    RomError, VmEnv, YieldCode, FONTSET, GFX_HEIGHT, GFX_WIDTH,
    MAX_JUMP_TARGETS, MEM_SIZE, NUM_KEYS, NUM_REGS, START_PC,
};
pub use timers::Timers;
