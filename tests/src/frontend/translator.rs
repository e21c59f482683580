use c8jit_backend::{CodeCache, JumpTable};
use c8jit_core::{VmEnv, START_PC};
use c8jit_frontend::Translator;

fn setup(rom: &[u8]) -> (Box<VmEnv>, CodeCache, JumpTable, u16) {
    let mut env = VmEnv::boxed();
    let rom_end = env.load_rom(rom).unwrap();
    let mut cache = CodeCache::new();
    let idx = cache.allocate(START_PC).unwrap();
    cache.select(idx);
    (env, cache, JumpTable::new(), rom_end)
}

fn translate(
    env: &mut VmEnv,
    cache: &mut CodeCache,
    jumps: &mut JumpTable,
    rom_end: u16,
) -> u64 {
    Translator::new(env, cache, jumps, rom_end, false).translate_block()
}

#[test]
fn test_straightline_block_grows_cursor_per_opcode() {
    let (mut env, mut cache, mut jumps, rom_end) = setup(&[0x6A, 0x05]);
    translate(&mut env, &mut cache, &mut jumps, rom_end);
    let one_op = cache.region(0).cursor();
    assert!(one_op > 0);

    let (mut env, mut cache, mut jumps, rom_end) =
        setup(&[0x6A, 0x05, 0x6B, 0x02]);
    translate(&mut env, &mut cache, &mut jumps, rom_end);
    let two_ops = cache.region(0).cursor();
    assert!(two_ops > one_op);
}

#[test]
fn test_block_runs_to_rom_end_and_resets_pc() {
    let (mut env, mut cache, mut jumps, rom_end) =
        setup(&[0x6A, 0x05, 0x6B, 0x02, 0x8A, 0xB4]);
    translate(&mut env, &mut cache, &mut jumps, rom_end);

    // The trailing zero word decodes as an RCA call and is skipped; the
    // driver then resets the PC rather than walking off the ROM.
    assert_eq!(env.pc, START_PC);
    assert_eq!(cache.region(0).start_pc(), 0x200);
    assert_eq!(cache.region(0).end_pc(), 0x206);
}

#[test]
fn test_jump_terminates_block_and_interns_target() {
    let (mut env, mut cache, mut jumps, rom_end) = setup(&[0x12, 0x08]);
    let cycles = translate(&mut env, &mut cache, &mut jumps, rom_end);

    assert_eq!(cycles, 1);
    // Terminators do not advance the guest PC; the dispatcher moves it
    // when it selects the jump target.
    assert_eq!(env.pc, 0x200);
    assert_eq!(cache.region(0).end_pc(), 0x200);
    assert!(cache.region(0).cursor() > 0);

    assert_eq!(jumps.entries().len(), 1);
    assert_eq!(jumps.entries()[0].pc, 0x208);
    assert!(!jumps.entries()[0].filled);
}

#[test]
fn test_call_and_return_terminate_blocks() {
    let (mut env, mut cache, mut jumps, rom_end) = setup(&[0x22, 0x08]);
    assert_eq!(translate(&mut env, &mut cache, &mut jumps, rom_end), 1);

    let (mut env, mut cache, mut jumps, rom_end) = setup(&[0x00, 0xEE]);
    assert_eq!(translate(&mut env, &mut cache, &mut jumps, rom_end), 1);

    let (mut env, mut cache, mut jumps, rom_end) = setup(&[0xB2, 0x02]);
    assert_eq!(translate(&mut env, &mut cache, &mut jumps, rom_end), 1);
}

#[test]
fn test_conditional_skip_is_patched_within_block() {
    let (mut env, mut cache, mut jumps, rom_end) =
        setup(&[0x30, 0x05, 0x12, 0x00]);
    translate(&mut env, &mut cache, &mut jumps, rom_end);

    assert_eq!(jumps.pending_conditionals(), 0);

    // Find the long JE and check its displacement was patched to land past
    // the jump lowering that follows.
    let region = cache.region(0);
    let code = region.buf().slice_at(0, region.cursor());
    let je_at = code
        .windows(2)
        .position(|w| w == [0x0F, 0x84])
        .expect("no long JE in block");
    let disp = u32::from_le_bytes(code[je_at + 2..je_at + 6].try_into().unwrap());
    assert_eq!(je_at + 6 + disp as usize, region.cursor());
}

#[test]
fn test_unknown_opcode_emits_nothing_and_skips() {
    let (mut env, mut cache, mut jumps, rom_end) = setup(&[0xFF, 0xFF]);
    translate(&mut env, &mut cache, &mut jumps, rom_end);
    assert_eq!(cache.region(0).cursor(), 0);
    assert_eq!(env.pc, START_PC);
}

#[test]
fn test_translation_is_deterministic() {
    let rom = [0x6A, 0x05, 0x6B, 0x02, 0x8A, 0xB4, 0x30, 0x07, 0x12, 0x00];

    let (mut env, mut cache, mut jumps, rom_end) = setup(&rom);
    translate(&mut env, &mut cache, &mut jumps, rom_end);
    let first = (
        cache.region(0).start_pc(),
        cache.region(0).end_pc(),
        cache.region(0).cursor(),
    );

    let (mut env, mut cache, mut jumps, rom_end) = setup(&rom);
    translate(&mut env, &mut cache, &mut jumps, rom_end);
    let second = (
        cache.region(0).start_pc(),
        cache.region(0).end_pc(),
        cache.region(0).cursor(),
    );

    assert_eq!(first, second);
}

#[test]
fn test_odd_pc_stops_block_without_emitting() {
    let (mut env, mut cache, mut jumps, rom_end) = setup(&[0x6A, 0x05]);
    env.pc = 0x201;
    let cycles = translate(&mut env, &mut cache, &mut jumps, rom_end);
    assert_eq!(cycles, 0);
    assert_eq!(env.pc, START_PC);
    assert_eq!(cache.region(0).cursor(), 0);
}

#[test]
fn test_pc_past_rom_resets() {
    let (mut env, mut cache, mut jumps, rom_end) = setup(&[0x6A, 0x05]);
    env.pc = rom_end + 2;
    let cycles = translate(&mut env, &mut cache, &mut jumps, rom_end);
    assert_eq!(cycles, 0);
    assert_eq!(env.pc, START_PC);
}

#[test]
fn test_low_space_ends_block_before_the_tail() {
    use c8jit_backend::MAX_OPCODE_HOST_BYTES;

    let (mut env, mut cache, mut jumps, rom_end) = setup(&[0x6A, 0x05]);

    // Eat the region's headroom down to just under the per-opcode reserve.
    while cache.current().code_space_left() >= MAX_OPCODE_HOST_BYTES {
        cache.current_mut().buf_mut().emit_u8(0x90);
    }
    let cursor_before = cache.current().cursor();

    let cycles = translate(&mut env, &mut cache, &mut jumps, rom_end);
    assert_eq!(cycles, 0);
    assert_eq!(cache.current().cursor(), cursor_before);
    // The guest PC is untouched; the block simply defers to the tail.
    assert_eq!(env.pc, 0x200);
}
