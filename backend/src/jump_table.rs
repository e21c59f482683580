use std::io;

use c8jit_core::{VmEnv, MAX_JUMP_TARGETS};
use log::{debug, warn};

use crate::cache::CodeCache;

/// A guest branch target. The host address itself lives in
/// `VmEnv::jump_targets[index]` so that every branch site emitted against
/// this entry can keep indirecting through the same cell no matter how often
/// the target region is reallocated.
#[derive(Debug)]
pub struct JumpEntry {
    pub pc: u16,
    /// Whether the env cell currently holds the base of a valid region.
    pub filled: bool,
}

/// A conditional-skip site whose 32-bit displacement is still a
/// placeholder. Patched a fixed number of translator cycles after emission,
/// by which point the skipped opcode has been lowered into the same region.
#[derive(Debug)]
struct CondEntry {
    site_pc: u16,
    resume_pc: u16,
    cycles_remaining: u8,
    /// Base address of the region holding the placeholder; re-looked-up at
    /// patch time so a swept region is detected instead of written through.
    region_base: usize,
    /// Offset of the 4-byte displacement slot inside that region.
    slot_offset: usize,
}

/// Branch-target bookkeeping: permanent entries for every guest PC that is
/// a jump target, plus the short-lived list of conditional skips awaiting
/// their displacement.
#[derive(Default)]
pub struct JumpTable {
    entries: Vec<JumpEntry>,
    cond: Vec<CondEntry>,
}

impl JumpTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[JumpEntry] {
        &self.entries
    }

    /// Entry index for a guest target PC, creating an unfilled entry on
    /// first sight. The index is stable for the lifetime of the engine.
    pub fn intern(&mut self, pc: u16) -> usize {
        if let Some(idx) = self.entries.iter().position(|e| e.pc == pc) {
            return idx;
        }
        assert!(
            self.entries.len() < MAX_JUMP_TARGETS,
            "jump table full"
        );
        self.entries.push(JumpEntry { pc, filled: false });
        self.entries.len() - 1
    }

    /// Resolve every unfilled entry: look up or allocate the region starting
    /// at the entry's PC and publish its base address in the env cell.
    /// Freshly allocated regions are empty and will raise OUT_OF_CODE on
    /// first entry, which is what drives their translation.
    pub fn fill_pending(
        &mut self,
        cache: &mut CodeCache,
        env: &mut VmEnv,
    ) -> io::Result<()> {
        for (idx, entry) in self.entries.iter_mut().enumerate() {
            if entry.filled {
                continue;
            }
            let region_idx = cache.get_writable_by_start(entry.pc)?;
            let base = cache.region(region_idx).base_ptr() as u64;
            env.jump_targets[idx] = base;
            entry.filled = true;
            debug!(
                "jump[{idx}] -> 0x{:04X} filled with {base:#x}",
                entry.pc
            );
        }
        Ok(())
    }

    /// Forget the resolution of every entry targeting the region that
    /// starts at `start_pc` (called when that region is freed). The entries
    /// re-resolve on the next `fill_pending` before execution resumes.
    pub fn clear_filled_for(&mut self, start_pc: u16) {
        for entry in self.entries.iter_mut() {
            if entry.pc == start_pc && entry.filled {
                entry.filled = false;
            }
        }
    }

    // -- Conditional skips --

    /// Register a freshly emitted conditional skip whose displacement slot
    /// awaits patching.
    pub fn record_conditional(
        &mut self,
        site_pc: u16,
        resume_pc: u16,
        cycles: u8,
        region_base: usize,
        slot_offset: usize,
    ) {
        self.cond.push(CondEntry {
            site_pc,
            resume_pc,
            cycles_remaining: cycles,
            region_base,
            slot_offset,
        });
    }

    pub fn pending_conditionals(&self) -> usize {
        self.cond.len()
    }

    /// One translator cycle has passed: age every pending skip, and patch
    /// those that are due.
    ///
    /// When an entry hits zero the recording region's cursor sits exactly
    /// where the code for `resume_pc` begins (one opcode has been lowered
    /// since the skip site), so the displacement is `cursor - (slot + 4)`.
    /// If the block terminated early the cursor points at the NOP run
    /// instead; a taken skip then drains into the tail and the out-of-code
    /// splice carries it to `end_pc + 2`, which is the same resume PC.
    pub fn tick_conditionals(&mut self, cache: &mut CodeCache) {
        self.cond.retain_mut(|entry| {
            entry.cycles_remaining -= 1;
            if entry.cycles_remaining > 0 {
                return true;
            }
            match cache.find_by_host_addr(entry.region_base) {
                Some(region_idx) => {
                    let region = cache.region_mut(region_idx);
                    let disp = region.cursor() as i64
                        - (entry.slot_offset as i64 + 4);
                    debug!(
                        "skip at 0x{:04X} -> 0x{:04X} patched, disp {disp}",
                        entry.site_pc, entry.resume_pc
                    );
                    region
                        .buf_mut()
                        .patch_u32(entry.slot_offset, disp as i32 as u32);
                }
                None => warn!(
                    "skip at 0x{:04X} dropped: its region was swept",
                    entry.site_pc
                ),
            }
            false
        });
    }
}
