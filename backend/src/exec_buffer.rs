use std::io;
use std::ptr::NonNull;
use std::slice;

/// A fixed-capacity span of read+write+execute memory.
///
/// Each cache region (and the trampoline) owns one of these. The capacity
/// is chosen at creation and never grows; running out of room is the
/// region's out-of-code condition, not a reallocation trigger. Writes and
/// execution strictly alternate — the translator appends between dispatch
/// rounds, the guest runs the bytes afterwards — so a permanently RWX
/// mapping is sound and no permission flipping is needed.
///
/// Internally the mapping is handled as a byte slice; only the mmap/munmap
/// pair and the slice construction touch raw pointers.
pub struct ExecBuffer {
    base: NonNull<u8>,
    len: usize,
    cursor: usize,
}

// SAFETY: the mapping belongs to this value alone.
unsafe impl Send for ExecBuffer {}

impl ExecBuffer {
    /// Map `capacity` bytes (rounded up to whole pages) of anonymous
    /// executable memory.
    pub fn new(capacity: usize) -> io::Result<Self> {
        let len = capacity.next_multiple_of(page_size());

        // SAFETY: anonymous private mapping; no file descriptor involved.
        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let Some(base) = NonNull::new(raw.cast::<u8>()) else {
            return Err(io::Error::last_os_error());
        };

        Ok(Self {
            base,
            len,
            cursor: 0,
        })
    }

    /// The whole mapping as a byte slice.
    fn bytes(&self) -> &[u8] {
        // SAFETY: the mapping is `len` bytes and outlives this borrow.
        unsafe { slice::from_raw_parts(self.base.as_ptr(), self.len) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in `bytes`, and `&mut self` makes the access unique.
        unsafe { slice::from_raw_parts_mut(self.base.as_ptr(), self.len) }
    }

    /// Offset of the next byte an emit would write.
    #[inline]
    pub fn offset(&self) -> usize {
        self.cursor
    }

    /// Size of the mapping in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.len
    }

    /// Host address of the first byte.
    #[inline]
    pub fn base_ptr(&self) -> *const u8 {
        self.base.as_ptr()
    }

    /// Host address `offset` bytes in. One-past-the-end is allowed.
    #[inline]
    pub fn ptr_at(&self, offset: usize) -> *const u8 {
        self.bytes()[offset..].as_ptr()
    }

    /// Move the write cursor, e.g. to lay down a tail at a fixed position
    /// and then return to appending code.
    #[inline]
    pub fn set_offset(&mut self, offset: usize) {
        assert!(offset <= self.len);
        self.cursor = offset;
    }

    /// Overwrite the whole mapping with one byte; the cursor stays put.
    pub fn fill(&mut self, val: u8) {
        self.bytes_mut().fill(val);
    }

    // -- Emit methods --

    /// Append raw instruction bytes at the cursor.
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        let start = self.cursor;
        let end = start + bytes.len();
        assert!(end <= self.len, "emitted past the end of the buffer");
        self.bytes_mut()[start..end].copy_from_slice(bytes);
        self.cursor = end;
    }

    #[inline]
    pub fn emit_u8(&mut self, val: u8) {
        self.emit_bytes(&[val]);
    }

    #[inline]
    pub fn emit_u16(&mut self, val: u16) {
        self.emit_bytes(&val.to_le_bytes());
    }

    #[inline]
    pub fn emit_u32(&mut self, val: u32) {
        self.emit_bytes(&val.to_le_bytes());
    }

    #[inline]
    pub fn emit_u64(&mut self, val: u64) {
        self.emit_bytes(&val.to_le_bytes());
    }

    // -- Patching and inspection --

    /// Rewrite one byte, leaving the cursor alone (short-branch targets).
    #[inline]
    pub fn patch_u8(&mut self, offset: usize, val: u8) {
        self.bytes_mut()[offset] = val;
    }

    /// Rewrite a 32-bit slot in place (long-branch displacements).
    #[inline]
    pub fn patch_u32(&mut self, offset: usize, val: u32) {
        self.bytes_mut()[offset..offset + 4]
            .copy_from_slice(&val.to_le_bytes());
    }

    /// Read back a 32-bit slot.
    #[inline]
    pub fn read_u32(&self, offset: usize) -> u32 {
        let slot: [u8; 4] = self.bytes()[offset..offset + 4]
            .try_into()
            .expect("slot is four bytes");
        u32::from_le_bytes(slot)
    }

    /// Everything emitted so far.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes()[..self.cursor]
    }

    /// An arbitrary range of the mapping, e.g. a pre-positioned tail.
    pub fn slice_at(&self, offset: usize, len: usize) -> &[u8] {
        &self.bytes()[offset..offset + len]
    }
}

impl Drop for ExecBuffer {
    fn drop(&mut self) {
        // SAFETY: unmapping the exact span this value mapped.
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.len);
        }
    }
}

fn page_size() -> usize {
    // SAFETY: no preconditions.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}
