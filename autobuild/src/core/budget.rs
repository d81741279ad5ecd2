//! Deadline helpers for bounded polling.

use std::time::{Duration, Instant};

/// Time left until `deadline`, or `None` once it has passed.
pub fn remaining(deadline: Instant) -> Option<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .filter(|left| !left.is_zero())
}

/// Sleep interval for one poll step: the poll interval, capped by what is left.
pub fn next_poll(deadline: Instant, poll_interval: Duration) -> Option<Duration> {
    remaining(deadline).map(|left| left.min(poll_interval))
}
