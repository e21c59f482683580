use c8jit_core::{VmEnv, GFX_WIDTH};
use c8jit_frontend::Interpreter;

#[test]
fn test_clear_screen() {
    let mut env = VmEnv::boxed();
    let mut interp = Interpreter::new();
    env.gfx.fill(1);

    interp.execute(&mut env, 0x00E0);
    assert!(env.gfx.iter().all(|&p| p == 0));
    assert!(interp.draw_flag);
}

#[test]
fn test_draw_sprite_and_collision() {
    let mut env = VmEnv::boxed();
    let mut interp = Interpreter::new();

    // One row, all eight pixels set, drawn at (8, 4).
    env.i = 0x300;
    env.mem[0x300] = 0xFF;
    env.v[0] = 8;
    env.v[1] = 4;

    interp.execute(&mut env, 0xD011);
    assert_eq!(env.v[0xF], 0);
    for col in 0..8 {
        assert_eq!(env.gfx[4 * GFX_WIDTH + 8 + col], 1);
    }

    // XOR semantics: drawing the same sprite again erases it and reports
    // the collision.
    interp.execute(&mut env, 0xD011);
    assert_eq!(env.v[0xF], 1);
    for col in 0..8 {
        assert_eq!(env.gfx[4 * GFX_WIDTH + 8 + col], 0);
    }
}

#[test]
fn test_draw_wraps_at_screen_edge() {
    let mut env = VmEnv::boxed();
    let mut interp = Interpreter::new();

    env.i = 0x300;
    env.mem[0x300] = 0xFF;
    env.v[0] = (GFX_WIDTH - 2) as u8;
    env.v[1] = 0;

    interp.execute(&mut env, 0xD011);
    assert_eq!(env.gfx[GFX_WIDTH - 2], 1);
    assert_eq!(env.gfx[GFX_WIDTH - 1], 1);
    // The remaining six pixels wrap to the left edge.
    for x in 0..6 {
        assert_eq!(env.gfx[x], 1);
    }
}

#[test]
fn test_unhandled_opcode_is_ignored() {
    let mut env = VmEnv::boxed();
    let mut interp = Interpreter::new();
    interp.execute(&mut env, 0x8123);
    assert!(!interp.draw_flag);
}
