use c8jit_backend::emitter::{
    emit_arith_mi8, emit_arith_ri32, emit_arith_ri8, emit_arith_rm8,
    emit_arith_rr16, emit_arith_rr64, emit_arith_rr8, emit_div_r8,
    emit_inc_r64, emit_jcc32, emit_jcc8, emit_jmp_env, emit_ld8,
    emit_ld8_ptr, emit_ldzx16, emit_ldzx8, emit_lea_env, emit_mov_ri8,
    emit_mul_r8, emit_rdtsc, emit_shift1_r8, emit_shift_ri32, emit_st16,
    emit_st8, emit_st8_ptr, emit_st_imm16, emit_st_imm8, emit_yield,
    ArithOp, Cond, Reg, ShiftOp,
};
use c8jit_backend::{CodeCache, ExecBuffer, JumpTable, MAX_OPCODE_HOST_BYTES};
use c8jit_core::{VmEnv, YieldCode, MEM_SIZE, START_PC};
use log::{debug, warn};

/// Translator cycles a conditional skip waits before its displacement is
/// patched; by then the skipped opcode has been lowered into the region.
const SKIP_PATCH_DELAY: u8 = 2;

/// Lowers one block of guest opcodes into the currently selected cache
/// region.
///
/// A block runs from the current guest PC to the first terminating opcode
/// (jump, indirect jump, call or return), or earlier when the region runs
/// low on space or the PC leaves the ROM. Every lowered opcode advances the
/// region's guest end PC and the host cursor.
pub struct Translator<'a> {
    env: &'a mut VmEnv,
    cache: &'a mut CodeCache,
    jumps: &'a mut JumpTable,
    rom_end: u16,
    trace: bool,
    block_finished: bool,
}

impl<'a> Translator<'a> {
    pub fn new(
        env: &'a mut VmEnv,
        cache: &'a mut CodeCache,
        jumps: &'a mut JumpTable,
        rom_end: u16,
        trace: bool,
    ) -> Self {
        Self {
            env,
            cache,
            jumps,
            rom_end,
            trace,
            block_finished: false,
        }
    }

    /// Translate opcodes starting at the current guest PC until the block
    /// terminates. Returns the number of opcodes lowered.
    pub fn translate_block(&mut self) -> u64 {
        self.block_finished = false;
        let mut cycles = 0u64;

        while !self.block_finished {
            let pc = self.env.pc;

            // Never step past the loaded ROM; an odd PC would decode a
            // shifted stream, so it ends the block the same way.
            if pc > self.rom_end
                || pc as usize + 1 >= MEM_SIZE
                || pc & 1 != 0
            {
                warn!(
                    "guest PC 0x{pc:04X} left the ROM, resetting to 0x{START_PC:04X}"
                );
                self.env.pc = START_PC;
                break;
            }

            // Leave headroom for the widest lowering plus the dispatcher's
            // out-of-code splice; the NOP run into the tail handles the rest.
            if self.cache.current().code_space_left() < MAX_OPCODE_HOST_BYTES {
                debug!(
                    "region 0x{:04X} low on space, ending block at 0x{pc:04X}",
                    self.cache.current().start_pc()
                );
                break;
            }

            let opcode = u16::from_be_bytes([
                self.env.mem[pc as usize],
                self.env.mem[pc as usize + 1],
            ]);

            if self.trace {
                let buf = self.cache.current_mut().buf_mut();
                emit_yield(buf, YieldCode::Debug, Some(opcode), Some(pc));
            }

            self.translate_op(opcode, pc);
            self.cache.set_end_pc_current(pc);
            if !self.block_finished {
                self.env.pc = pc + 2;
            }

            self.jumps.tick_conditionals(self.cache);
            cycles += 1;
        }

        cycles
    }

    fn translate_op(&mut self, opcode: u16, pc: u16) {
        let x = ((opcode >> 8) & 0xF) as u8;
        let y = ((opcode >> 4) & 0xF) as u8;
        let nn = (opcode & 0xFF) as u8;
        let nnn = opcode & 0x0FFF;

        match opcode & 0xF000 {
            0x0000 => match opcode {
                // Clear screen runs on the fallback interpreter.
                0x00E0 => self.yield_only(YieldCode::UseInterpreter, opcode),
                0x00EE => self.op_ret(opcode),
                // RCA 1802 calls have no translation; skip them.
                _ => warn!("RCA call 0x{opcode:04X} at 0x{pc:04X}, skipping"),
            },
            0x1000 => self.op_jp(nnn),
            0x2000 => self.op_call(opcode, pc),
            0x3000 => self.op_skip_imm(x, nn, Cond::E, pc),
            0x4000 => self.op_skip_imm(x, nn, Cond::Ne, pc),
            0x5000 if opcode & 0xF == 0 => {
                self.op_skip_reg(x, y, Cond::E, pc)
            }
            0x6000 => self.op_ld_imm(x, nn),
            0x7000 => self.op_add_imm(x, nn),
            0x8000 => self.op_alu(opcode, x, y, pc),
            0x9000 if opcode & 0xF == 0 => {
                self.op_skip_reg(x, y, Cond::Ne, pc)
            }
            0xA000 => self.op_ld_i(nnn),
            0xB000 => self.op_jp_v0(opcode),
            0xC000 => self.op_rnd(x, nn),
            // Sprite drawing runs on the fallback interpreter.
            0xD000 => self.yield_only(YieldCode::UseInterpreter, opcode),
            0xE000 => match opcode & 0xFF {
                0x9E => self.op_skip_key(x, 1, pc),
                0xA1 => self.op_skip_key(x, 0, pc),
                _ => warn!("unknown opcode 0x{opcode:04X} at 0x{pc:04X}, skipping"),
            },
            0xF000 => self.op_misc(opcode, x, pc),
            _ => warn!("unknown opcode 0x{opcode:04X} at 0x{pc:04X}, skipping"),
        }
    }

    // -- Control transfers --

    /// 0x1NNN: direct jump through the target's jump-table cell.
    fn op_jp(&mut self, nnn: u16) {
        let entry = self.jumps.intern(nnn);
        let buf = self.cache.current_mut().buf_mut();
        emit_yield(buf, YieldCode::PrepareForJump, Some(nnn), None);
        emit_jmp_env(buf, VmEnv::off_jump_target(entry));
        self.block_finished = true;
    }

    /// 0x2NNN: call; the dispatcher pushes the return PC and resolves the
    /// stack-jump cell before the indirect jump runs.
    fn op_call(&mut self, opcode: u16, pc: u16) {
        let buf = self.cache.current_mut().buf_mut();
        emit_yield(
            buf,
            YieldCode::PrepareForStackJump,
            Some(opcode),
            Some(pc + 2),
        );
        emit_jmp_env(buf, VmEnv::off_stack_target());
        self.block_finished = true;
    }

    /// 0x00EE: return; the dispatcher pops and resolves the stack-jump cell.
    fn op_ret(&mut self, opcode: u16) {
        let buf = self.cache.current_mut().buf_mut();
        emit_yield(buf, YieldCode::PrepareForStackJump, Some(opcode), None);
        emit_jmp_env(buf, VmEnv::off_stack_target());
        self.block_finished = true;
    }

    /// 0xBNNN: indirect jump through the cell the dispatcher resolves from
    /// NNN + V0 at run time.
    fn op_jp_v0(&mut self, opcode: u16) {
        let buf = self.cache.current_mut().buf_mut();
        emit_yield(
            buf,
            YieldCode::PrepareForIndirectJump,
            Some(opcode),
            None,
        );
        emit_jmp_env(buf, VmEnv::off_indirect_target());
        self.block_finished = true;
    }

    // -- Conditional skips --

    /// Emit the long conditional jump with a placeholder displacement and
    /// register it for delayed patching.
    fn emit_skip(&mut self, cond: Cond, site_pc: u16) {
        let region = self.cache.current_mut();
        let region_base = region.base_ptr() as usize;
        let buf = region.buf_mut();
        emit_jcc32(buf, cond, 0);
        let slot_offset = buf.offset() - 4;
        self.jumps.record_conditional(
            site_pc,
            site_pc + 4,
            SKIP_PATCH_DELAY,
            region_base,
            slot_offset,
        );
    }

    /// 0x3XNN / 0x4XNN: skip when V[X] compares (un)equal to NN.
    fn op_skip_imm(&mut self, x: u8, nn: u8, cond: Cond, pc: u16) {
        let buf = self.cache.current_mut().buf_mut();
        emit_ld8(buf, Reg::Rax, VmEnv::off_v(x));
        emit_arith_ri8(buf, ArithOp::Cmp, Reg::Rax, nn);
        self.emit_skip(cond, pc);
    }

    /// 0x5XY0 / 0x9XY0: skip when V[X] compares (un)equal to V[Y].
    fn op_skip_reg(&mut self, x: u8, y: u8, cond: Cond, pc: u16) {
        let buf = self.cache.current_mut().buf_mut();
        emit_ld8(buf, Reg::Rax, VmEnv::off_v(x));
        emit_ld8(buf, Reg::Rcx, VmEnv::off_v(y));
        emit_arith_rr8(buf, ArithOp::Cmp, Reg::Rax, Reg::Rcx);
        self.emit_skip(cond, pc);
    }

    /// 0xEX9E / 0xEXA1: skip on keypad state. The key index is masked to
    /// the 16-key range before the array is read.
    fn op_skip_key(&mut self, x: u8, pressed: u8, pc: u16) {
        let buf = self.cache.current_mut().buf_mut();
        emit_ldzx8(buf, Reg::Rcx, VmEnv::off_v(x));
        emit_arith_ri32(buf, ArithOp::And, Reg::Rcx, 0xF);
        emit_lea_env(buf, Reg::Rax, VmEnv::off_keys());
        emit_arith_rr64(buf, ArithOp::Add, Reg::Rax, Reg::Rcx);
        emit_ld8_ptr(buf, Reg::Rdx, Reg::Rax);
        emit_arith_ri8(buf, ArithOp::Cmp, Reg::Rdx, pressed);
        self.emit_skip(Cond::E, pc);
    }

    // -- Register moves and ALU --

    /// 0x6XNN
    fn op_ld_imm(&mut self, x: u8, nn: u8) {
        let buf = self.cache.current_mut().buf_mut();
        emit_st_imm8(buf, VmEnv::off_v(x), nn);
    }

    /// 0x7XNN (no flag update, modulo 256)
    fn op_add_imm(&mut self, x: u8, nn: u8) {
        let buf = self.cache.current_mut().buf_mut();
        emit_arith_mi8(buf, ArithOp::Add, VmEnv::off_v(x), nn);
    }

    /// Write `value` to VF only when carry is set, by jumping over the
    /// store on not-carry.
    fn emit_vf_on_carry(&mut self, value: u8) {
        let buf = self.cache.current_mut().buf_mut();
        let jcc_at = buf.offset();
        emit_jcc8(buf, Cond::Ae, 0);
        emit_st_imm8(buf, VmEnv::off_v(0xF), value);
        let rel = buf.offset() - (jcc_at + 2);
        buf.patch_u8(jcc_at + 1, rel as u8);
    }

    /// 0x8XY0..7, 0x8XYE
    fn op_alu(&mut self, opcode: u16, x: u8, y: u8, pc: u16) {
        match opcode & 0xF {
            0x0 => {
                let buf = self.cache.current_mut().buf_mut();
                emit_ld8(buf, Reg::Rax, VmEnv::off_v(y));
                emit_st8(buf, VmEnv::off_v(x), Reg::Rax);
            }
            op @ (0x1 | 0x2 | 0x3) => {
                let alu = match op {
                    0x1 => ArithOp::Or,
                    0x2 => ArithOp::And,
                    _ => ArithOp::Xor,
                };
                let buf = self.cache.current_mut().buf_mut();
                emit_ld8(buf, Reg::Rax, VmEnv::off_v(x));
                emit_arith_rm8(buf, alu, Reg::Rax, VmEnv::off_v(y));
                emit_st8(buf, VmEnv::off_v(x), Reg::Rax);
            }
            0x4 => {
                // VF = 1 on carry, else 0; the flag is pre-cleared so the
                // conditional store only has to handle the event case.
                let buf = self.cache.current_mut().buf_mut();
                emit_st_imm8(buf, VmEnv::off_v(0xF), 0);
                emit_ld8(buf, Reg::Rax, VmEnv::off_v(x));
                emit_arith_rm8(buf, ArithOp::Add, Reg::Rax, VmEnv::off_v(y));
                emit_st8(buf, VmEnv::off_v(x), Reg::Rax);
                self.emit_vf_on_carry(1);
            }
            0x5 => {
                // VF = 0 on borrow, else 1.
                let buf = self.cache.current_mut().buf_mut();
                emit_st_imm8(buf, VmEnv::off_v(0xF), 1);
                emit_ld8(buf, Reg::Rax, VmEnv::off_v(x));
                emit_arith_rm8(buf, ArithOp::Sub, Reg::Rax, VmEnv::off_v(y));
                emit_st8(buf, VmEnv::off_v(x), Reg::Rax);
                self.emit_vf_on_carry(0);
            }
            0x6 => {
                // VF = bit shifted out, then V[X] >>= 1.
                let buf = self.cache.current_mut().buf_mut();
                emit_st_imm8(buf, VmEnv::off_v(0xF), 0);
                emit_ld8(buf, Reg::Rax, VmEnv::off_v(x));
                emit_shift1_r8(buf, ShiftOp::Shr, Reg::Rax);
                emit_st8(buf, VmEnv::off_v(x), Reg::Rax);
                self.emit_vf_on_carry(1);
            }
            0x7 => {
                let buf = self.cache.current_mut().buf_mut();
                emit_st_imm8(buf, VmEnv::off_v(0xF), 1);
                emit_ld8(buf, Reg::Rax, VmEnv::off_v(y));
                emit_arith_rm8(buf, ArithOp::Sub, Reg::Rax, VmEnv::off_v(x));
                emit_st8(buf, VmEnv::off_v(x), Reg::Rax);
                self.emit_vf_on_carry(0);
            }
            0xE => {
                let buf = self.cache.current_mut().buf_mut();
                emit_st_imm8(buf, VmEnv::off_v(0xF), 0);
                emit_ld8(buf, Reg::Rax, VmEnv::off_v(x));
                emit_shift1_r8(buf, ShiftOp::Shl, Reg::Rax);
                emit_st8(buf, VmEnv::off_v(x), Reg::Rax);
                self.emit_vf_on_carry(1);
            }
            _ => warn!("unknown opcode 0x{opcode:04X} at 0x{pc:04X}, skipping"),
        }
    }

    /// 0xANNN
    fn op_ld_i(&mut self, nnn: u16) {
        let buf = self.cache.current_mut().buf_mut();
        emit_st_imm16(buf, VmEnv::off_i(), nnn);
    }

    /// 0xCXNN: the timestamp counter stands in for a PRNG.
    fn op_rnd(&mut self, x: u8, nn: u8) {
        let buf = self.cache.current_mut().buf_mut();
        emit_rdtsc(buf);
        emit_arith_ri8(buf, ArithOp::And, Reg::Rax, nn);
        emit_st8(buf, VmEnv::off_v(x), Reg::Rax);
    }

    // -- 0xFXxx --

    fn op_misc(&mut self, opcode: u16, x: u8, pc: u16) {
        match opcode & 0xFF {
            // Timer transfers happen host-side in the dispatcher.
            0x07 | 0x15 | 0x18 => {
                self.yield_only(YieldCode::UpdateTimers, opcode)
            }
            0x0A => {
                // Wait for a key, then copy the dispatcher's answer into
                // V[X].
                let buf = self.cache.current_mut().buf_mut();
                emit_yield(
                    buf,
                    YieldCode::WaitForKeypress,
                    Some(opcode),
                    None,
                );
                emit_ld8(buf, Reg::Rax, VmEnv::off_key_pressed());
                emit_st8(buf, VmEnv::off_v(x), Reg::Rax);
            }
            0x1E => {
                // I += V[X], 16-bit, VF untouched.
                let buf = self.cache.current_mut().buf_mut();
                emit_ldzx16(buf, Reg::Rax, VmEnv::off_i());
                emit_ldzx8(buf, Reg::Rcx, VmEnv::off_v(x));
                emit_arith_rr16(buf, ArithOp::Add, Reg::Rax, Reg::Rcx);
                emit_st16(buf, VmEnv::off_i(), Reg::Rax);
            }
            0x29 => {
                // Font glyphs are 5 bytes tall starting at address 0.
                let buf = self.cache.current_mut().buf_mut();
                emit_ld8(buf, Reg::Rax, VmEnv::off_v(x));
                emit_mov_ri8(buf, Reg::Rcx, 5);
                emit_mul_r8(buf, Reg::Rcx);
                emit_st16(buf, VmEnv::off_i(), Reg::Rax);
            }
            0x33 => self.op_bcd(opcode, x),
            0x55 => self.op_store_regs(opcode, x),
            0x65 => self.op_load_regs(x),
            _ => warn!("unknown opcode 0x{opcode:04X} at 0x{pc:04X}, skipping"),
        }
    }

    /// Load RDX with the host address of guest memory at I (masked to the
    /// 12-bit guest address space).
    fn emit_mem_at_i(buf: &mut ExecBuffer, ptr: Reg, idx: Reg) {
        emit_lea_env(buf, ptr, VmEnv::off_mem());
        emit_ldzx16(buf, idx, VmEnv::off_i());
        emit_arith_ri32(buf, ArithOp::And, idx, 0xFFF);
        emit_arith_rr64(buf, ArithOp::Add, ptr, idx);
    }

    /// 0xFX33: BCD of V[X] into memory[I..=I+2]. The self-modifying-code
    /// yield runs before the stores so the dispatcher can invalidate any
    /// region covering the written addresses first.
    fn op_bcd(&mut self, opcode: u16, x: u8) {
        let buf = self.cache.current_mut().buf_mut();
        emit_yield(buf, YieldCode::SelfModifyingCode, Some(opcode), None);
        Self::emit_mem_at_i(buf, Reg::Rdx, Reg::Rax);
        // AX = V[X]; divide by 100, then by 10, shifting the remainder
        // down from AH each time.
        emit_ldzx8(buf, Reg::Rax, VmEnv::off_v(x));
        emit_mov_ri8(buf, Reg::Rcx, 100);
        emit_div_r8(buf, Reg::Rcx);
        emit_st8_ptr(buf, Reg::Rdx, Reg::Rax);
        emit_inc_r64(buf, Reg::Rdx);
        emit_shift_ri32(buf, ShiftOp::Shr, Reg::Rax, 8);
        emit_mov_ri8(buf, Reg::Rcx, 10);
        emit_div_r8(buf, Reg::Rcx);
        emit_st8_ptr(buf, Reg::Rdx, Reg::Rax);
        emit_inc_r64(buf, Reg::Rdx);
        emit_shift_ri32(buf, ShiftOp::Shr, Reg::Rax, 8);
        emit_st8_ptr(buf, Reg::Rdx, Reg::Rax);
    }

    /// 0xFX55: copy V[0..=X] to memory[I..]. Self-modifying by definition,
    /// so the yield precedes the copy loop.
    fn op_store_regs(&mut self, opcode: u16, x: u8) {
        let buf = self.cache.current_mut().buf_mut();
        emit_yield(buf, YieldCode::SelfModifyingCode, Some(opcode), None);
        Self::emit_mem_at_i(buf, Reg::Rax, Reg::Rcx);
        emit_lea_env(buf, Reg::Rdx, VmEnv::off_v(0));
        emit_lea_env(buf, Reg::Rcx, VmEnv::off_v(x) + 1);
        let loop_start = buf.offset();
        emit_ld8_ptr(buf, Reg::R8, Reg::Rdx);
        emit_st8_ptr(buf, Reg::Rax, Reg::R8);
        emit_inc_r64(buf, Reg::Rax);
        emit_inc_r64(buf, Reg::Rdx);
        emit_arith_rr64(buf, ArithOp::Cmp, Reg::Rdx, Reg::Rcx);
        let rel = loop_start as i64 - (buf.offset() as i64 + 2);
        emit_jcc8(buf, Cond::Ne, rel as i8);
    }

    /// 0xFX65: copy memory[I..] into V[0..=X].
    fn op_load_regs(&mut self, x: u8) {
        let buf = self.cache.current_mut().buf_mut();
        Self::emit_mem_at_i(buf, Reg::Rax, Reg::Rcx);
        emit_lea_env(buf, Reg::Rdx, VmEnv::off_v(0));
        emit_lea_env(buf, Reg::Rcx, VmEnv::off_v(x) + 1);
        let loop_start = buf.offset();
        emit_ld8_ptr(buf, Reg::R8, Reg::Rax);
        emit_st8_ptr(buf, Reg::Rdx, Reg::R8);
        emit_inc_r64(buf, Reg::Rax);
        emit_inc_r64(buf, Reg::Rdx);
        emit_arith_rr64(buf, ArithOp::Cmp, Reg::Rdx, Reg::Rcx);
        let rel = loop_start as i64 - (buf.offset() as i64 + 2);
        emit_jcc8(buf, Cond::Ne, rel as i8);
    }

    /// Opcodes whose whole effect happens in the dispatcher: emit the yield
    /// and nothing else.
    fn yield_only(&mut self, code: YieldCode, opcode: u16) {
        let buf = self.cache.current_mut().buf_mut();
        emit_yield(buf, code, Some(opcode), None);
    }
}
