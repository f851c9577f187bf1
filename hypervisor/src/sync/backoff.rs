//! Exponential backoff for busy-wait loops.

use crate::config::MAX_BACKOFF_SPINS;

/// Doubling spin delay, capped at [`MAX_BACKOFF_SPINS`] pause instructions per round.
#[derive(Debug)]
pub struct Backoff {
    spins: u32,
}

impl Backoff {
    pub const fn new() -> Self {
        Self { spins: 1 }
    }

    /// Number of pause instructions the next call to [`Backoff::spin`] will execute.
    pub const fn current(&self) -> u32 {
        self.spins
    }

    /// Pauses for the current delay, then doubles it up to the ceiling.
    pub fn spin(&mut self) {
        for _ in 0..self.spins {
            core::hint::spin_loop();
        }

        self.spins = (self.spins << 1).min(MAX_BACKOFF_SPINS);
    }

    pub fn reset(&mut self) {
        self.spins = 1;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
