//! Time source for everything that stamps records.

use chrono::{DateTime, Utc};

/// Source of the current UTC time.
///
/// Events, snapshots, checkpoints and saga and transaction records are
/// stamped through a `Clock` instead of `Utc::now()`, so tests can freeze
/// time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Reads the wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
