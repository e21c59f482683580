use std::time::{Duration, Instant};

use crate::state::VmEnv;

/// Period of one timer decrement: the guest timers decay at 60 Hz.
const TICK: Duration = Duration::from_nanos(16_666_667);

/// Wall-clock driver for the delay and sound timers.
///
/// The recompiled code never touches the timers directly; every 0xFX07/15/18
/// opcode yields to the dispatcher, which applies the register transfer and
/// then calls [`Timers::tick`] to fold in however much wall time has passed.
#[derive(Debug)]
pub struct Timers {
    last: Instant,
}

impl Timers {
    pub fn new() -> Self {
        Self {
            last: Instant::now(),
        }
    }

    /// Decrement the env timers by the number of whole 60 Hz periods that
    /// elapsed since the previous call.
    pub fn tick(&mut self, env: &mut VmEnv) {
        let elapsed = self.last.elapsed();
        let ticks = (elapsed.as_nanos() / TICK.as_nanos()) as u32;
        if ticks == 0 {
            return;
        }
        env.delay_timer = env.delay_timer.saturating_sub(ticks.min(255) as u8);
        env.sound_timer = env.sound_timer.saturating_sub(ticks.min(255) as u8);
        self.last += TICK * ticks;
    }
}

impl Default for Timers {
    fn default() -> Self {
        Self::new()
    }
}
