use std::io;

use log::{debug, info};

use crate::emitter::{emit_region_tail, REGION_TAIL_SIZE};
use crate::exec_buffer::ExecBuffer;
use crate::jump_table::JumpTable;

/// Fixed capacity of every cache region's host-code buffer.
pub const MAX_CACHE_SZ: usize = 4096;

/// Headroom the translator keeps between the write cursor and the tail: an
/// upper bound on the host bytes one lowered opcode can take, with room for
/// the dispatcher's out-of-code splice on top.
pub const MAX_OPCODE_HOST_BYTES: usize = 192;

/// Regions are pre-filled with NOP so control falling off the translated
/// bytes drains into the out-of-code tail.
const FILL_BYTE: u8 = 0x90;

/// Sentinel for a region whose start PC has not been pinned yet.
const UNSET_PC: u16 = 0xFFFF;

/// One contiguous guest PC range and the host code translated for it.
pub struct CacheRegion {
    start_pc: u16,
    /// Guest PC of the last translated opcode, inclusive. Equals
    /// `start_pc` until the first opcode lands.
    end_pc: u16,
    invalid: bool,
    buf: ExecBuffer,
}

impl CacheRegion {
    fn new(start_pc: u16) -> io::Result<Self> {
        let mut buf = ExecBuffer::new(MAX_CACHE_SZ)?;
        assert_eq!(buf.capacity(), MAX_CACHE_SZ);
        buf.fill(FILL_BYTE);
        let base = buf.base_ptr();
        buf.set_offset(MAX_CACHE_SZ - REGION_TAIL_SIZE);
        emit_region_tail(&mut buf, start_pc, base);
        buf.set_offset(0);
        Ok(Self {
            start_pc,
            end_pc: start_pc,
            invalid: false,
            buf,
        })
    }

    pub fn start_pc(&self) -> u16 {
        self.start_pc
    }

    pub fn end_pc(&self) -> u16 {
        self.end_pc
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid
    }

    pub fn base_ptr(&self) -> *const u8 {
        self.buf.base_ptr()
    }

    /// Offset of the next free host byte.
    pub fn cursor(&self) -> usize {
        self.buf.offset()
    }

    /// Host address of the next free byte.
    pub fn cursor_ptr(&self) -> *const u8 {
        self.buf.ptr_at(self.buf.offset())
    }

    /// Nothing has been translated into this region yet.
    pub fn is_empty(&self) -> bool {
        self.buf.offset() == 0
    }

    pub fn buf(&self) -> &ExecBuffer {
        &self.buf
    }

    pub fn buf_mut(&mut self) -> &mut ExecBuffer {
        &mut self.buf
    }

    pub fn contains_pc(&self, pc: u16) -> bool {
        self.start_pc <= pc && pc <= self.end_pc
    }

    /// Whether a host address lies within the written part of the buffer.
    pub fn contains_host(&self, addr: usize) -> bool {
        let base = self.buf.base_ptr() as usize;
        base <= addr && addr <= base + self.buf.offset()
    }

    /// Bytes still available for translated code before the tail.
    pub fn code_space_left(&self) -> usize {
        (MAX_CACHE_SZ - REGION_TAIL_SIZE).saturating_sub(self.buf.offset())
    }

    /// Record the guest PC of the opcode just translated; pins a
    /// sentinel-uninitialised start on first use.
    pub fn set_end_pc(&mut self, pc: u16) {
        if self.start_pc == UNSET_PC {
            self.start_pc = pc;
        }
        self.end_pc = pc;
        assert!(
            self.buf.offset() <= MAX_CACHE_SZ - REGION_TAIL_SIZE,
            "translated code overran the region tail"
        );
    }
}

/// The code cache: every live region, plus the cursor of the one currently
/// selected for translation.
#[derive(Default)]
pub struct CodeCache {
    regions: Vec<CacheRegion>,
    selected: Option<usize>,
}

impl CodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn regions(&self) -> &[CacheRegion] {
        &self.regions
    }

    /// Index of the first valid region whose guest range contains `pc`.
    pub fn find_by_guest_pc(&self, pc: u16) -> Option<usize> {
        self.regions
            .iter()
            .position(|r| !r.invalid && r.contains_pc(pc))
    }

    /// Stricter lookup requiring guest-instruction alignment on entry:
    /// the region must *start* at `pc`.
    pub fn find_by_start_guest_pc(&self, pc: u16) -> Option<usize> {
        self.regions
            .iter()
            .position(|r| !r.invalid && r.start_pc == pc)
    }

    /// Region whose written buffer contains the host address.
    pub fn find_by_host_addr(&self, addr: usize) -> Option<usize> {
        self.regions.iter().position(|r| r.contains_host(addr))
    }

    /// Allocate a fresh region starting at `start_pc`: NOP-filled buffer
    /// with the out-of-code tail pre-written. Allocation failure is fatal
    /// to the caller; there is no recovery path once the guest needs code.
    pub fn allocate(&mut self, start_pc: u16) -> io::Result<usize> {
        let region = CacheRegion::new(start_pc)?;
        info!(
            "cache[{}] allocated at {:p}, guest start 0x{start_pc:04X}",
            self.regions.len(),
            region.base_ptr()
        );
        self.regions.push(region);
        Ok(self.regions.len() - 1)
    }

    /// Lookup-or-allocate by exact start PC. Never invalidates.
    pub fn get_writable_by_start(&mut self, start_pc: u16) -> io::Result<usize> {
        match self.find_by_start_guest_pc(start_pc) {
            Some(idx) => Ok(idx),
            None => self.allocate(start_pc),
        }
    }

    /// Make a region the current one for the translator.
    pub fn select(&mut self, index: usize) {
        assert!(index < self.regions.len());
        self.selected = Some(index);
    }

    pub fn selected(&self) -> Option<usize> {
        self.selected
    }

    pub fn region(&self, index: usize) -> &CacheRegion {
        &self.regions[index]
    }

    pub fn region_mut(&mut self, index: usize) -> &mut CacheRegion {
        &mut self.regions[index]
    }

    /// The currently selected region. Panics if none is selected, which
    /// would mean the dispatcher asked for translation without a target.
    pub fn current(&self) -> &CacheRegion {
        let idx = self.selected.expect("no cache region selected");
        &self.regions[idx]
    }

    pub fn current_mut(&mut self) -> &mut CacheRegion {
        let idx = self.selected.expect("no cache region selected");
        &mut self.regions[idx]
    }

    /// Record the guest PC just translated into the current region.
    pub fn set_end_pc_current(&mut self, pc: u16) {
        self.current_mut().set_end_pc(pc);
    }

    /// Mark every valid region whose guest range contains `pc` invalid.
    pub fn mark_invalid_containing(&mut self, pc: u16) {
        for (i, r) in self.regions.iter_mut().enumerate() {
            if !r.invalid && r.contains_pc(pc) {
                debug!(
                    "cache[{i}] (0x{:04X}..0x{:04X}) invalidated by write to 0x{pc:04X}",
                    r.start_pc, r.end_pc
                );
                r.invalid = true;
            }
        }
    }

    /// Free every invalid region that does not contain the resume pointer.
    ///
    /// For each dropped region the jump table forgets any filled entry that
    /// pointed at it, so the next `fill_pending` re-resolves those targets.
    /// Only ever called at yield boundaries; emitted code is never running
    /// while regions are freed.
    pub fn sweep_invalid(&mut self, resume_addr: u64, jumps: &mut JumpTable) {
        let mut i = 0;
        while i < self.regions.len() {
            let keep = {
                let r = &self.regions[i];
                !r.invalid || r.contains_host(resume_addr as usize)
            };
            if keep {
                i += 1;
                continue;
            }
            let r = self.regions.remove(i);
            info!(
                "cache[{i}] (0x{:04X}..0x{:04X}) swept",
                r.start_pc(),
                r.end_pc()
            );
            jumps.clear_filled_for(r.start_pc());
            match self.selected {
                Some(s) if s > i => self.selected = Some(s - 1),
                Some(s) if s == i => self.selected = None,
                _ => {}
            }
            // Re-check the entry that slid into slot i.
        }
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}
