use std::mem::offset_of;

use log::info;

/// Guest address space: 4 KiB linear memory.
pub const MEM_SIZE: usize = 4096;
/// Guest programs load and start at 0x200.
pub const START_PC: u16 = 0x200;
/// Data registers V0-VF.
pub const NUM_REGS: usize = 16;
/// Keypad size.
pub const NUM_KEYS: usize = 16;
/// Framebuffer dimensions.
pub const GFX_WIDTH: usize = 64;
pub const GFX_HEIGHT: usize = 32;
/// Capacity of the permanent jump table's target-cell array.
pub const MAX_JUMP_TARGETS: usize = 1024;

/// Built-in hex font, 5 bytes per glyph, loaded at guest address 0.
pub const FONTSET: [u8; 80] = [
    0xF0, 0x90, 0x90, 0x90, 0xF0, // 0
    0x20, 0x60, 0x20, 0x20, 0x70, // 1
    0xF0, 0x10, 0xF0, 0x80, 0xF0, // 2
    0xF0, 0x10, 0xF0, 0x10, 0xF0, // 3
    0x90, 0x90, 0xF0, 0x10, 0x10, // 4
    0xF0, 0x80, 0xF0, 0x10, 0xF0, // 5
    0xF0, 0x80, 0xF0, 0x90, 0xF0, // 6
    0xF0, 0x10, 0x20, 0x40, 0x40, // 7
    0xF0, 0x90, 0xF0, 0x90, 0xF0, // 8
    0xF0, 0x90, 0xF0, 0x10, 0xF0, // 9
    0xF0, 0x90, 0xF0, 0x90, 0x90, // A
    0xE0, 0x90, 0xE0, 0x90, 0xE0, // B
    0xF0, 0x80, 0x80, 0x80, 0xF0, // C
    0xE0, 0x90, 0x90, 0x90, 0xE0, // D
    0xF0, 0x80, 0xF0, 0x80, 0xF0, // E
    0xF0, 0x80, 0xF0, 0x80, 0x80, // F
];

/// Status codes emitted code writes to [`VmEnv::yield_code`] before
/// transferring back to the trampoline. The numeric values are part of the
/// contract between generated code and the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum YieldCode {
    PrepareForJump = 0,
    UseInterpreter = 1,
    OutOfCode = 2,
    PrepareForIndirectJump = 3,
    SelfModifyingCode = 4,
    Debug = 5,
    WaitForKeypress = 6,
    PrepareForStackJump = 7,
    UpdateTimers = 8,
}

impl YieldCode {
    /// Decode a raw status word written by emitted code.
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::PrepareForJump,
            1 => Self::UseInterpreter,
            2 => Self::OutOfCode,
            3 => Self::PrepareForIndirectJump,
            4 => Self::SelfModifyingCode,
            5 => Self::Debug,
            6 => Self::WaitForKeypress,
            7 => Self::PrepareForStackJump,
            8 => Self::UpdateTimers,
            _ => return None,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RomError {
    #[error("ROM is {size} bytes, larger than the {max}-byte guest window")]
    TooLarge { size: usize, max: usize },
    #[error("ROM is empty")]
    Empty,
}

/// Complete guest-visible machine state plus the cells shared with emitted
/// host code.
///
/// The struct is `#[repr(C)]` and lives in a `Box` that is never reallocated
/// for the lifetime of the engine: generated code addresses every field as
/// `[env_base + offset]`, where the trampoline prologue loads the env base
/// register once per entry. The `off_*` helpers below are the single source
/// of truth for those offsets.
#[repr(C)]
pub struct VmEnv {
    /// Guest memory: font at 0, program at 0x200.
    pub mem: [u8; MEM_SIZE],
    /// 64x32 monochrome framebuffer, one byte per pixel.
    pub gfx: [u8; GFX_WIDTH * GFX_HEIGHT],
    /// Data registers V0-VF.
    pub v: [u8; NUM_REGS],
    /// Index register.
    pub i: u16,
    /// Guest program counter. While translating this doubles as the
    /// translation cursor.
    pub pc: u16,
    pub delay_timer: u8,
    pub sound_timer: u8,
    /// Keypad state, 1 = pressed.
    pub keys: [u8; NUM_KEYS],
    /// Result cell for the wait-for-key yield; emitted code copies it into
    /// V[X] after the dispatcher services the yield.
    pub key_pressed: u8,

    // Yield record, written by emitted code, read once per dispatch round.
    pub yield_code: u32,
    pub yield_param1: u16,
    pub yield_param2: u16,
    pub yield_host_param: u64,

    /// Host address the trampoline indirects through on entry.
    pub resume_addr: u64,
    /// Host address of the trampoline epilogue; every yield jumps through
    /// this cell.
    pub epilogue_addr: u64,
    /// Host address of the trampoline's return-address helper.
    pub retaddr_helper: u64,
    /// Target cell for stack jumps (calls and returns).
    pub stack_target: u64,
    /// Target cell for 0xBNNN indirect jumps.
    pub indirect_target: u64,
    /// Target cells of the permanent jump table; a branch site emitted for
    /// jump entry `n` indirects through `jump_targets[n]` forever.
    pub jump_targets: [u64; MAX_JUMP_TARGETS],
}

impl VmEnv {
    /// Allocate a zeroed env with the font installed and PC at 0x200.
    pub fn boxed() -> Box<Self> {
        let mut env = Box::new(Self {
            mem: [0; MEM_SIZE],
            gfx: [0; GFX_WIDTH * GFX_HEIGHT],
            v: [0; NUM_REGS],
            i: 0,
            pc: START_PC,
            delay_timer: 0,
            sound_timer: 0,
            keys: [0; NUM_KEYS],
            key_pressed: 0,
            yield_code: 0,
            yield_param1: 0,
            yield_param2: 0,
            yield_host_param: 0,
            resume_addr: 0,
            epilogue_addr: 0,
            retaddr_helper: 0,
            stack_target: 0,
            indirect_target: 0,
            jump_targets: [0; MAX_JUMP_TARGETS],
        });
        env.mem[..FONTSET.len()].copy_from_slice(&FONTSET);
        env
    }

    /// Copy a ROM image to 0x200 and return the first guest address past it.
    pub fn load_rom(&mut self, rom: &[u8]) -> Result<u16, RomError> {
        let max = MEM_SIZE - START_PC as usize;
        if rom.is_empty() {
            return Err(RomError::Empty);
        }
        if rom.len() > max {
            return Err(RomError::TooLarge {
                size: rom.len(),
                max,
            });
        }
        let start = START_PC as usize;
        self.mem[start..start + rom.len()].copy_from_slice(rom);
        let rom_end = START_PC + rom.len() as u16;
        info!("loaded {} byte ROM, guest range 0x200..0x{rom_end:04X}", rom.len());
        Ok(rom_end)
    }

    // -- Offsets of the cells generated code addresses --
    //
    // All fit comfortably in an i32 displacement; the largest
    // (`jump_targets`' tail) is below 16 KiB.

    pub const fn off_mem() -> i32 {
        offset_of!(VmEnv, mem) as i32
    }

    pub const fn off_v(x: u8) -> i32 {
        (offset_of!(VmEnv, v) + x as usize) as i32
    }

    pub const fn off_i() -> i32 {
        offset_of!(VmEnv, i) as i32
    }

    pub const fn off_keys() -> i32 {
        offset_of!(VmEnv, keys) as i32
    }

    pub const fn off_key_pressed() -> i32 {
        offset_of!(VmEnv, key_pressed) as i32
    }

    pub const fn off_yield_code() -> i32 {
        offset_of!(VmEnv, yield_code) as i32
    }

    pub const fn off_yield_param1() -> i32 {
        offset_of!(VmEnv, yield_param1) as i32
    }

    pub const fn off_yield_param2() -> i32 {
        offset_of!(VmEnv, yield_param2) as i32
    }

    pub const fn off_yield_host_param() -> i32 {
        offset_of!(VmEnv, yield_host_param) as i32
    }

    pub const fn off_resume_addr() -> i32 {
        offset_of!(VmEnv, resume_addr) as i32
    }

    pub const fn off_epilogue_addr() -> i32 {
        offset_of!(VmEnv, epilogue_addr) as i32
    }

    pub const fn off_retaddr_helper() -> i32 {
        offset_of!(VmEnv, retaddr_helper) as i32
    }

    pub const fn off_stack_target() -> i32 {
        offset_of!(VmEnv, stack_target) as i32
    }

    pub const fn off_indirect_target() -> i32 {
        offset_of!(VmEnv, indirect_target) as i32
    }

    pub const fn off_jump_target(index: usize) -> i32 {
        (offset_of!(VmEnv, jump_targets) + index * 8) as i32
    }
}
