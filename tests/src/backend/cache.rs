use c8jit_backend::emitter::REGION_TAIL_SIZE;
use c8jit_backend::{CodeCache, JumpTable, MAX_CACHE_SZ, MAX_OPCODE_HOST_BYTES};
use c8jit_core::{VmEnv, YieldCode};

#[test]
fn test_allocate_prefills_nop_and_tail() {
    let mut cache = CodeCache::new();
    let idx = cache.allocate(0x200).unwrap();
    let region = cache.region(idx);

    assert_eq!(region.start_pc(), 0x200);
    assert_eq!(region.end_pc(), 0x200);
    assert_eq!(region.cursor(), 0);
    assert!(!region.is_invalid());
    assert!(region.is_empty());

    // NOP carpet up to the tail.
    let code_area = region
        .buf()
        .slice_at(0, MAX_CACHE_SZ - REGION_TAIL_SIZE);
    assert!(code_area.iter().all(|&b| b == 0x90));

    // The tail is an OUT_OF_CODE yield naming this region.
    let tail = region
        .buf()
        .slice_at(MAX_CACHE_SZ - REGION_TAIL_SIZE, REGION_TAIL_SIZE);
    assert_eq!(tail[0], 0xC7);
    assert_eq!(
        u32::from_le_bytes(tail[6..10].try_into().unwrap()),
        YieldCode::OutOfCode as u32
    );
    let base_imm = u64::from_le_bytes(tail[21..29].try_into().unwrap());
    assert_eq!(base_imm, region.base_ptr() as u64);
}

#[test]
fn test_lookups() {
    let mut cache = CodeCache::new();
    let a = cache.allocate(0x200).unwrap();
    let b = cache.allocate(0x300).unwrap();

    cache.select(a);
    cache.set_end_pc_current(0x204);
    cache.select(b);
    cache.set_end_pc_current(0x302);

    assert_eq!(cache.find_by_guest_pc(0x200), Some(a));
    assert_eq!(cache.find_by_guest_pc(0x204), Some(a));
    assert_eq!(cache.find_by_guest_pc(0x206), None);
    assert_eq!(cache.find_by_guest_pc(0x300), Some(b));

    assert_eq!(cache.find_by_start_guest_pc(0x200), Some(a));
    assert_eq!(cache.find_by_start_guest_pc(0x204), None);

    let addr = cache.region(a).base_ptr() as usize;
    assert_eq!(cache.find_by_host_addr(addr), Some(a));
    assert_eq!(
        cache.find_by_host_addr(cache.region(b).base_ptr() as usize),
        Some(b)
    );
}

#[test]
fn test_invalid_regions_are_skipped_by_guest_lookups() {
    let mut cache = CodeCache::new();
    let a = cache.allocate(0x200).unwrap();
    cache.select(a);
    cache.set_end_pc_current(0x210);

    cache.mark_invalid_containing(0x208);
    assert!(cache.region(a).is_invalid());
    assert_eq!(cache.find_by_guest_pc(0x208), None);
    assert_eq!(cache.find_by_start_guest_pc(0x200), None);
}

#[test]
fn test_get_writable_reuses_existing_start() {
    let mut cache = CodeCache::new();
    let a = cache.get_writable_by_start(0x200).unwrap();
    let again = cache.get_writable_by_start(0x200).unwrap();
    assert_eq!(a, again);
    assert_eq!(cache.len(), 1);

    let b = cache.get_writable_by_start(0x300).unwrap();
    assert_ne!(a, b);
    assert_eq!(cache.len(), 2);
}

#[test]
fn test_sweep_frees_invalid_and_clears_jump_fills() {
    let mut env = VmEnv::boxed();
    let mut cache = CodeCache::new();
    let mut jumps = JumpTable::new();

    let a = cache.allocate(0x200).unwrap();
    let b = cache.allocate(0x300).unwrap();
    cache.select(a);
    cache.set_end_pc_current(0x204);
    cache.select(b);
    cache.set_end_pc_current(0x304);

    let entry = jumps.intern(0x200);
    jumps.fill_pending(&mut cache, &mut env).unwrap();
    assert!(jumps.entries()[entry].filled);

    // Resume sits in region B; invalidating A must free it and unfill the
    // entry that pointed at it.
    let resume = cache.region(b).base_ptr() as u64;
    cache.mark_invalid_containing(0x202);
    cache.sweep_invalid(resume, &mut jumps);

    assert_eq!(cache.len(), 1);
    assert_eq!(cache.find_by_start_guest_pc(0x300), Some(0));
    assert!(!jumps.entries()[entry].filled);
    // B slid to index 0 and stays selected.
    assert_eq!(cache.selected(), Some(0));
}

#[test]
fn test_sweep_spares_region_holding_resume() {
    let mut cache = CodeCache::new();
    let mut jumps = JumpTable::new();

    let a = cache.allocate(0x200).unwrap();
    cache.select(a);
    cache.set_end_pc_current(0x202);
    cache.mark_invalid_containing(0x200);

    let resume = cache.region(a).base_ptr() as u64;
    cache.sweep_invalid(resume, &mut jumps);

    // Still there: the resume pointer lives inside it.
    assert_eq!(cache.len(), 1);
    assert!(cache.region(0).is_invalid());

    // Once the resume pointer moves on, the sweep reclaims it.
    cache.sweep_invalid(0, &mut jumps);
    assert!(cache.is_empty());
    assert_eq!(cache.selected(), None);
}

#[test]
fn test_sweep_adjusts_selected_index() {
    let mut cache = CodeCache::new();
    let mut jumps = JumpTable::new();

    let a = cache.allocate(0x200).unwrap();
    let b = cache.allocate(0x300).unwrap();
    let c = cache.allocate(0x400).unwrap();
    cache.select(c);

    cache.select(a);
    cache.set_end_pc_current(0x202);
    cache.select(c);

    cache.mark_invalid_containing(0x200);
    let resume = cache.region(b).base_ptr() as u64;
    cache.sweep_invalid(resume, &mut jumps);

    // A dropped; C's index shifted down by one.
    assert_eq!(cache.len(), 2);
    assert_eq!(cache.selected(), Some(1));
    assert_eq!(cache.current().start_pc(), 0x400);
}

#[test]
fn test_code_space_accounting() {
    let mut cache = CodeCache::new();
    let a = cache.allocate(0x200).unwrap();
    cache.select(a);

    let space = cache.current().code_space_left();
    assert_eq!(space, MAX_CACHE_SZ - REGION_TAIL_SIZE);
    assert!(space > MAX_OPCODE_HOST_BYTES);

    cache.current_mut().buf_mut().emit_u32(0);
    assert_eq!(cache.current().code_space_left(), space - 4);
}
