//! Frozen time and scripted randomness.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use covenant_core::clock::Clock;
use covenant_core::rng::DeterministicRng;

/// Always reports the wrapped instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Draws the bottom of every range: `min` and `0.0`. Retry jitter drawn from
/// it is always zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockRng;

impl DeterministicRng for MockRng {
    fn next_u32_range(&mut self, min: u32, _max: u32) -> u32 {
        min
    }

    fn next_f64(&mut self) -> f64 {
        0.0
    }
}

/// Replays a script of draws.
///
/// Integer draws are clamped into the requested range. Fraction draws read
/// the next value as a percentage, so `50` yields `0.5`.
///
/// # Panics
///
/// Drawing past the end of the script panics.
#[derive(Debug)]
pub struct SequenceRng {
    script: VecDeque<u32>,
}

impl SequenceRng {
    #[must_use]
    pub fn new(values: Vec<u32>) -> Self {
        Self {
            script: values.into(),
        }
    }

    fn draw(&mut self) -> u32 {
        self.script
            .pop_front()
            .expect("SequenceRng script exhausted")
    }
}

impl DeterministicRng for SequenceRng {
    fn next_u32_range(&mut self, min: u32, max: u32) -> u32 {
        self.draw().clamp(min, max.max(min))
    }

    fn next_f64(&mut self) -> f64 {
        f64::from(self.draw().min(99)) / 100.0
    }
}
