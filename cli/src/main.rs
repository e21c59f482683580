use std::path::PathBuf;

use anyhow::Context;
use c8jit_core::{GFX_HEIGHT, GFX_WIDTH};
use clap::Parser;
use log::info;

use c8jit_exec::Engine;

/// CHIP-8 dynamic recompiler.
#[derive(Parser)]
#[command(name = "c8jit", version, about)]
struct Args {
    /// ROM image to run.
    rom: PathBuf,

    /// Stop after this many dispatch rounds instead of running forever.
    #[arg(long)]
    cycles: Option<u64>,

    /// Emit a DEBUG yield before every translated opcode.
    #[arg(long)]
    trace: bool,

    /// Dump the framebuffer as text after every draw.
    #[arg(long)]
    render: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut engine = Engine::initialise(&args.rom)
        .with_context(|| format!("starting {}", args.rom.display()))?;
    engine.set_trace(args.trace);
    info!("running {}", args.rom.display());

    match args.cycles {
        // Rendering needs a look at the draw flag after every dispatch
        // round, so any rendering run takes the per-step loop below even
        // without a cycle limit.
        None if !args.render => engine.emulation_loop()?,
        limit => {
            let mut steps = 0u64;
            loop {
                engine.step()?;
                if args.render && engine.take_draw_flag() {
                    render_text(&engine);
                }
                steps += 1;
                if limit.is_some_and(|n| steps >= n) {
                    break;
                }
            }
            info!(
                "stopped after {steps} dispatch rounds, {} translator cycles",
                engine.translate_cycles()
            );
        }
    }

    Ok(())
}

/// Crude terminal rendering of the 64x32 framebuffer.
fn render_text(engine: &Engine) {
    let gfx = &engine.env().gfx;
    let mut out = String::with_capacity((GFX_WIDTH + 1) * GFX_HEIGHT);
    for y in 0..GFX_HEIGHT {
        for x in 0..GFX_WIDTH {
            out.push(if gfx[y * GFX_WIDTH + x] != 0 { '#' } else { ' ' });
        }
        out.push('\n');
    }
    print!("{out}");
}
