//! Wall-clock source for the handlers' timed decisions.
//!
//! Wait synthesis and suspension wake delays measure "now" as a wall-clock
//! base plus the tokio clock's elapsed time. In production that is real UTC
//! (and immune to wall-clock steps); under a paused test clock it follows
//! `tokio::time::advance`, so timer scenarios replay instantly and
//! deterministically.

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// UTC clock anchored to the tokio clock.
#[derive(Debug, Clone)]
pub struct WallClock {
    wall_base: DateTime<Utc>,
    instant_base: Instant,
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl WallClock {
    /// Captures the current wall time and tokio instant as the base.
    #[must_use]
    pub fn new() -> Self {
        Self {
            wall_base: Utc::now(),
            instant_base: Instant::now(),
        }
    }

    /// The base wall time plus the tokio clock's elapsed time since
    /// construction.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = self.instant_base.elapsed();
        self.wall_base
            + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn follows_the_paused_tokio_clock() {
        let clock = WallClock::new();
        let before = clock.now();

        tokio::time::advance(Duration::from_secs(90)).await;

        let after = clock.now();
        assert!((after - before).num_seconds() >= 90);
    }

    #[tokio::test(start_paused = true)]
    async fn stands_still_while_paused() {
        let clock = WallClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!((b - a).num_milliseconds() < 5);
    }
}
