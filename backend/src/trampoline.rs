use std::io;

use c8jit_core::VmEnv;
use log::debug;

use crate::emitter::{
    emit_jmp_env, emit_mov_rr64, emit_pop, emit_push, emit_ret, Reg,
};
use crate::exec_buffer::ExecBuffer;

/// Callee-saved registers the prologue preserves, in push order. RBP is
/// among them because the recompiled code claims it as the env base.
const CALLEE_SAVED: [Reg; 6] =
    [Reg::Rbp, Reg::Rbx, Reg::R12, Reg::R13, Reg::R14, Reg::R15];

/// Host entry/exit stub for recompiled code.
///
/// One small executable buffer, emitted once, containing three routines:
///
/// - **prologue** (the call target): saves callee-saved registers, loads
///   RBP with the env pointer argument and jumps through the env's resume
///   cell into whichever cache region is current;
/// - **epilogue**: restores registers and returns to the dispatcher. Every
///   yield sequence and every region tail jumps here through the env's
///   epilogue cell;
/// - **return-address helper**: `pop rax; push rax; ret` — returns its own
///   return address in RAX, which is how emitted code learns the host
///   address of its next instruction when writing the resume cell.
pub struct Trampoline {
    buf: ExecBuffer,
    epilogue_offset: usize,
    helper_offset: usize,
}

impl Trampoline {
    pub fn new() -> io::Result<Self> {
        let mut buf = ExecBuffer::new(64)?;

        // Prologue.
        for &reg in CALLEE_SAVED.iter() {
            emit_push(&mut buf, reg);
        }
        emit_mov_rr64(&mut buf, Reg::Rbp, Reg::Rdi);
        emit_jmp_env(&mut buf, VmEnv::off_resume_addr());

        // Epilogue.
        let epilogue_offset = buf.offset();
        for &reg in CALLEE_SAVED.iter().rev() {
            emit_pop(&mut buf, reg);
        }
        emit_ret(&mut buf);

        // Return-address helper.
        let helper_offset = buf.offset();
        emit_pop(&mut buf, Reg::Rax);
        emit_push(&mut buf, Reg::Rax);
        emit_ret(&mut buf);

        debug!(
            "trampoline at {:p}, epilogue +0x{:x}, helper +0x{:x}",
            buf.base_ptr(),
            epilogue_offset,
            helper_offset
        );

        Ok(Self {
            buf,
            epilogue_offset,
            helper_offset,
        })
    }

    /// Write the trampoline's fixed addresses into the env cells emitted
    /// code jumps and calls through.
    pub fn install(&self, env: &mut VmEnv) {
        env.epilogue_addr = self.buf.ptr_at(self.epilogue_offset) as u64;
        env.retaddr_helper = self.buf.ptr_at(self.helper_offset) as u64;
    }

    /// Run recompiled code from the env's resume address until it yields.
    ///
    /// # Safety
    /// `env.resume_addr` must point into a valid cache region (or its
    /// tail), and every cell emitted code addresses must live at the env
    /// offsets it was compiled against — both are invariants the dispatcher
    /// maintains between calls.
    pub unsafe fn enter(&self, env: *mut VmEnv) {
        let entry: unsafe extern "C" fn(*mut VmEnv) =
            std::mem::transmute(self.buf.base_ptr());
        entry(env);
    }
}
