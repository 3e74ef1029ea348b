// Time abstraction for the supervisor loop.
//
// Production and tests share the same implementation: both run on Tokio's
// timer wheel, and tests get determinism by pausing it
// (`#[tokio::test(start_paused = true)]` + `tokio::time::advance`) rather
// than swapping in a hand-rolled fake. See DESIGN.md for why a second,
// bespoke test clock isn't needed here.

use std::time::Duration;

use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Monotonic time source injected into the [`Supervisor`](crate::supervisor::Supervisor).
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;

    /// A repeating tick stream whose first tick fires `period` after this call,
    /// not immediately.
    fn ticker(&self, period: Duration) -> Ticker;
}

pub struct Ticker(Interval);

impl Ticker {
    pub async fn tick(&mut self) -> Instant {
        self.0.tick().await
    }
}

#[derive(Clone, Copy, Default)]
pub struct RealClock;

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn ticker(&self, period: Duration) -> Ticker {
        let mut interval = interval_at(Instant::now() + period, period);
        // Never build up a backlog of missed ticks: a slow or delayed poll
        // should shift the schedule forward, not fire repeatedly until the
        // loop catches up (which would starve the supervisor's other
        // select! branches behind a run of instantly-ready ticks).
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Ticker(interval)
    }
}
