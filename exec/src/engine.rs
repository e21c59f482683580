use std::fs;
use std::path::Path;

use c8jit_backend::emitter::{emit_jmp_env, emit_yield, REGION_TAIL_SIZE};
use c8jit_backend::{CodeCache, JumpTable, Trampoline, MAX_CACHE_SZ};
use c8jit_core::{CallStack, Timers, VmEnv, YieldCode, START_PC};
use c8jit_frontend::{Interpreter, Translator};
use log::{debug, trace, warn};

use crate::error::EngineError;

/// The dispatcher. Owns every moving part of the recompiler and drives the
/// execute → yield → service loop.
pub struct Engine {
    env: Box<VmEnv>,
    cache: CodeCache,
    jumps: JumpTable,
    stack: CallStack,
    timers: Timers,
    trampoline: Trampoline,
    interpreter: Interpreter,
    rom_end: u16,
    translate_cycles: u64,
    trace: bool,
}

impl Engine {
    /// Build an engine from a ROM file on disk.
    pub fn initialise<P: AsRef<Path>>(rom_path: P) -> Result<Self, EngineError> {
        let path = rom_path.as_ref();
        let rom = fs::read(path).map_err(|source| EngineError::RomRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::with_rom(&rom)
    }

    /// Build an engine from an in-memory ROM image.
    ///
    /// Resets the guest, loads font and ROM, builds the trampoline,
    /// allocates and selects the first cache region at 0x200, points the
    /// resume cell at it and translates the first block.
    pub fn with_rom(rom: &[u8]) -> Result<Self, EngineError> {
        let mut env = VmEnv::boxed();
        let rom_end = env.load_rom(rom)?;

        let trampoline = Trampoline::new()?;
        trampoline.install(&mut env);

        let mut engine = Self {
            env,
            cache: CodeCache::new(),
            jumps: JumpTable::new(),
            stack: CallStack::new(),
            timers: Timers::new(),
            trampoline,
            interpreter: Interpreter::new(),
            rom_end,
            translate_cycles: 0,
            trace: false,
        };

        let first = engine.cache.allocate(START_PC)?;
        engine.cache.select(first);
        engine.env.resume_addr =
            engine.cache.region(first).base_ptr() as u64;
        engine.jumps.intern(START_PC);
        engine
            .jumps
            .fill_pending(&mut engine.cache, &mut engine.env)?;
        engine.run_translator();

        Ok(engine)
    }

    /// Emit DEBUG yields ahead of every translated opcode.
    pub fn set_trace(&mut self, trace: bool) {
        self.trace = trace;
    }

    /// Run until a fatal error. All recoverable conditions are consumed
    /// internally.
    pub fn emulation_loop(&mut self) -> Result<(), EngineError> {
        loop {
            self.step()?;
        }
    }

    /// One dispatch round: enter the current region through the trampoline,
    /// then service the yield it wrote back.
    pub fn step(&mut self) -> Result<(), EngineError> {
        // SAFETY: the resume cell points into a valid region (or its tail)
        // by construction — it is only written by the yield macro, by the
        // out-of-code handler, and at initialisation — and the env box is
        // never moved.
        unsafe {
            self.trampoline.enter(&mut *self.env);
        }

        let raw = self.env.yield_code;
        let code =
            YieldCode::from_raw(raw).ok_or(EngineError::BadYieldTag(raw))?;
        trace!(
            "yield {code:?}, param1 0x{:04X}, param2 0x{:04X}",
            self.env.yield_param1,
            self.env.yield_param2
        );

        match code {
            YieldCode::PrepareForJump => self.prepare_for_jump()?,
            YieldCode::UseInterpreter => {
                let opcode = self.env.yield_param1;
                self.interpreter.execute(&mut self.env, opcode);
            }
            YieldCode::OutOfCode => self.out_of_code(),
            YieldCode::PrepareForIndirectJump => {
                self.prepare_for_indirect_jump()?
            }
            YieldCode::SelfModifyingCode => self.self_modifying_code(),
            YieldCode::Debug => debug!(
                "debug yield: opcode 0x{:04X} at guest PC 0x{:04X}",
                self.env.yield_param1, self.env.yield_param2
            ),
            YieldCode::WaitForKeypress => self.wait_for_keypress(),
            YieldCode::PrepareForStackJump => self.prepare_for_stack_jump()?,
            YieldCode::UpdateTimers => self.update_timers(),
        }

        Ok(())
    }

    /// Translate a block into the currently selected region, starting at
    /// the current guest PC.
    fn run_translator(&mut self) {
        let cycles = Translator::new(
            &mut self.env,
            &mut self.cache,
            &mut self.jumps,
            self.rom_end,
            self.trace,
        )
        .translate_block();
        self.translate_cycles += cycles;
        debug!(
            "translated {cycles} opcodes into region 0x{:04X}..0x{:04X}",
            self.cache.current().start_pc(),
            self.cache.current().end_pc()
        );
    }

    /// Resolve a filled jump entry's host target to its region, translating
    /// the region first if it is still empty, so the indirect jump after
    /// the yield lands on real code.
    fn materialise_jump_target(
        &mut self,
        target_pc: u16,
    ) -> Result<u64, EngineError> {
        let entry = self.jumps.intern(target_pc);
        self.jumps.fill_pending(&mut self.cache, &mut self.env)?;
        let host = self.env.jump_targets[entry];
        let region_idx = self
            .cache
            .find_by_host_addr(host as usize)
            .expect("filled jump entry points outside the cache");
        if self.cache.region(region_idx).is_empty() {
            self.cache.select(region_idx);
            self.env.pc = self.cache.region(region_idx).start_pc();
            self.run_translator();
        }
        Ok(host)
    }

    /// PREPARE_FOR_JUMP: param1 names the guest target. After this returns,
    /// the trampoline resumes at the indirect jump emitted right after the
    /// yield, which goes through the entry's (now valid) target cell.
    fn prepare_for_jump(&mut self) -> Result<(), EngineError> {
        self.cache
            .sweep_invalid(self.env.resume_addr, &mut self.jumps);
        let target_pc = self.env.yield_param1;
        self.materialise_jump_target(target_pc)?;
        Ok(())
    }

    /// OUT_OF_CODE: execution drained through a region's NOP run into its
    /// tail. Splice a jump to the next guest opcode onto the region's
    /// cursor and resume there.
    fn out_of_code(&mut self) {
        let host = self.env.yield_host_param as usize;
        let region_idx = self
            .cache
            .find_by_host_addr(host)
            .expect("out-of-code yield from an unknown region");

        self.env.resume_addr =
            self.cache.region(region_idx).cursor_ptr() as u64;
        self.cache.select(region_idx);

        let next_pc = self.cache.region(region_idx).end_pc().wrapping_add(2);
        let entry = self.jumps.intern(next_pc);
        let region = self.cache.region_mut(region_idx);
        let buf = region.buf_mut();
        emit_yield(buf, YieldCode::PrepareForJump, Some(next_pc), None);
        emit_jmp_env(buf, VmEnv::off_jump_target(entry));
        assert!(
            region.cursor() <= MAX_CACHE_SZ - REGION_TAIL_SIZE,
            "out-of-code splice overran the region tail"
        );
        debug!(
            "spliced region 0x{:04X}.. to continue at 0x{next_pc:04X}",
            region.start_pc()
        );
    }

    /// PREPARE_FOR_INDIRECT_JUMP: param1 is the 0xBNNN opcode; the target
    /// is NNN + V0, resolved into the indirect-jump cell.
    fn prepare_for_indirect_jump(&mut self) -> Result<(), EngineError> {
        self.cache
            .sweep_invalid(self.env.resume_addr, &mut self.jumps);
        let opcode = self.env.yield_param1;
        if opcode & 0xF000 != 0xB000 {
            return Err(EngineError::BadIndirectOpcode(opcode));
        }
        let target_pc =
            (opcode & 0x0FFF).wrapping_add(self.env.v[0] as u16);
        let region_idx = self.cache.get_writable_by_start(target_pc)?;
        self.env.indirect_target =
            self.cache.region(region_idx).base_ptr() as u64;
        if self.cache.region(region_idx).is_empty() {
            self.cache.select(region_idx);
            self.env.pc = self.cache.region(region_idx).start_pc();
            self.run_translator();
        }
        Ok(())
    }

    /// SELF_MODIFYING_CODE: invalidate every region covering the guest
    /// addresses the store sequence after the yield is about to write. The
    /// writing region survives (the resume pointer is inside it), so the
    /// store itself still runs; the stale targets are swept before they are
    /// next entered.
    fn self_modifying_code(&mut self) {
        let opcode = self.env.yield_param1;
        let i = self.env.i;
        match opcode & 0xF0FF {
            0xF033 => {
                for k in 0..3 {
                    self.cache.mark_invalid_containing(i.wrapping_add(k));
                }
            }
            0xF055 => {
                let x = (opcode >> 8) & 0xF;
                for k in 0..=x {
                    self.cache.mark_invalid_containing(i.wrapping_add(k));
                }
            }
            _ => warn!(
                "self-modifying-code yield for unexpected opcode 0x{opcode:04X}"
            ),
        }
    }

    /// WAIT_FOR_KEYPRESS: one scan over the keypad; the first pressed key
    /// lands in the cell the emitted code copies into V[X].
    fn wait_for_keypress(&mut self) {
        if let Some(k) = self.env.keys.iter().position(|&k| k != 0) {
            self.env.key_pressed = k as u8;
        }
    }

    /// PREPARE_FOR_STACK_JUMP: push-and-jump for calls, pop-and-jump for
    /// returns; either way the resolved host target lands in the stack-jump
    /// cell the emitted indirect jump reads.
    fn prepare_for_stack_jump(&mut self) -> Result<(), EngineError> {
        self.cache
            .sweep_invalid(self.env.resume_addr, &mut self.jumps);
        let opcode = self.env.yield_param1;
        let target_pc = match opcode & 0xF000 {
            0x2000 => {
                let return_pc = self.env.yield_param2;
                self.stack.push(return_pc)?;
                opcode & 0x0FFF
            }
            0x0000 => self.stack.pop()?,
            _ => return Err(EngineError::BadStackOpcode(opcode)),
        };
        let host = self.materialise_jump_target(target_pc)?;
        self.env.stack_target = host;
        Ok(())
    }

    /// UPDATE_TIMERS: fold elapsed wall time into the timers, then apply
    /// the register transfer the opcode asked for.
    fn update_timers(&mut self) {
        self.timers.tick(&mut self.env);
        let opcode = self.env.yield_param1;
        let x = ((opcode >> 8) & 0xF) as usize;
        match opcode & 0xF0FF {
            0xF007 => self.env.v[x] = self.env.delay_timer,
            0xF015 => self.env.delay_timer = self.env.v[x],
            0xF018 => self.env.sound_timer = self.env.v[x],
            _ => warn!(
                "timer yield for unexpected opcode 0x{opcode:04X}"
            ),
        }
    }

    // -- Embedder surface --

    pub fn env(&self) -> &VmEnv {
        &self.env
    }

    pub fn env_mut(&mut self) -> &mut VmEnv {
        &mut self.env
    }

    pub fn cache(&self) -> &CodeCache {
        &self.cache
    }

    pub fn jumps(&self) -> &JumpTable {
        &self.jumps
    }

    pub fn stack(&self) -> &CallStack {
        &self.stack
    }

    pub fn rom_end(&self) -> u16 {
        self.rom_end
    }

    pub fn translate_cycles(&self) -> u64 {
        self.translate_cycles
    }

    /// Press or release a keypad key.
    pub fn set_key(&mut self, key: usize, pressed: bool) {
        self.env.keys[key] = pressed as u8;
    }

    /// Whether the framebuffer changed since the last call.
    pub fn take_draw_flag(&mut self) -> bool {
        std::mem::take(&mut self.interpreter.draw_flag)
    }
}
