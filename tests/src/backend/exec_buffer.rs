use c8jit_backend::ExecBuffer;

#[test]
fn test_emit_and_read() {
    let mut buf = ExecBuffer::new(4096).unwrap();
    buf.emit_u8(0x90);
    buf.emit_u32(0xDEADBEEF);
    assert_eq!(buf.offset(), 5);
    assert_eq!(buf.as_slice()[0], 0x90);
    assert_eq!(buf.read_u32(1), 0xDEADBEEF);
}

#[test]
fn test_patch() {
    let mut buf = ExecBuffer::new(4096).unwrap();
    buf.emit_u32(0);
    buf.patch_u32(0, 0x12345678);
    assert_eq!(buf.read_u32(0), 0x12345678);
    buf.patch_u8(3, 0xAA);
    assert_eq!(buf.read_u32(0), 0xAA345678);
}

#[test]
fn test_fill_and_set_offset() {
    let mut buf = ExecBuffer::new(4096).unwrap();
    buf.fill(0x90);
    assert!(buf.slice_at(0, buf.capacity()).iter().all(|&b| b == 0x90));

    buf.set_offset(100);
    buf.emit_u16(0x1234);
    assert_eq!(buf.offset(), 102);
    assert_eq!(buf.slice_at(100, 2), &[0x34, 0x12]);

    buf.set_offset(0);
    assert_eq!(buf.offset(), 0);
}

#[test]
fn test_capacity_is_page_rounded() {
    let buf = ExecBuffer::new(100).unwrap();
    assert!(buf.capacity() >= 100);
    assert_eq!(buf.capacity() % 4096, 0);
}
