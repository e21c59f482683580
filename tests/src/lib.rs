//! Test suite for the c8jit workspace.
//!
//! Unit-level coverage for the backend (arena, encoder, cache, jump table,
//! trampoline), the translator and the fallback interpreter, plus
//! end-to-end ROM scenarios that execute recompiled code on the host.

#[cfg(test)]
mod backend;
#[cfg(test)]
mod core;
#[cfg(test)]
mod frontend;
