// THEORY:
// The program worker is a plain blocking thread, so cancellation cannot rely on an async
// executor waking it. Every wait in the worker is therefore sliced into short polls of a
// shared `CancellationToken`; a stop request is observed within one poll interval no
// matter how long the nominal wait is.
//
// `TickTimer` paces the loop. When a tick overruns, the missed ticks are dropped rather
// than replayed back to back, so a slow command never causes a burst of catch-up ticks.

use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Seconds as a `Duration`. `None` for negative, NaN or out-of-range values.
pub fn duration_from_secs(seconds: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(seconds).ok()
}

/// Sleeps for `duration`, waking every `poll` to check `token`.
/// Returns `true` if the full duration elapsed, `false` if cancelled first.
/// A duration past the clock's range only ends by cancellation.
pub fn sleep_cancellable(duration: Duration, token: &CancellationToken, poll: Duration) -> bool {
    let deadline = Instant::now().checked_add(duration);
    let poll = poll.max(Duration::from_millis(1));
    loop {
        if token.is_cancelled() {
            return false;
        }
        let Some(deadline) = deadline else {
            std::thread::sleep(poll);
            continue;
        };
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(poll));
    }
}

/// Best-effort fixed-rate pacing.
#[derive(Debug)]
pub struct TickTimer {
    interval: Duration,
    next: Instant,
    skipped: u64,
}

impl TickTimer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now(),
            skipped: 0,
        }
    }

    /// Blocks until the next tick is due. Returns `false` if cancelled while waiting.
    pub fn wait(&mut self, token: &CancellationToken, poll: Duration) -> bool {
        let now = Instant::now();
        if self.next > now && !sleep_cancellable(self.next - now, token, poll) {
            return false;
        }
        let now = Instant::now();
        self.next += self.interval;
        if self.next <= now {
            let behind = (now - self.next).as_nanos();
            let interval = self.interval.as_nanos().max(1);
            let missed = (behind / interval + 1) as u64;
            self.skipped += missed;
            self.next = now + self.interval;
        }
        !token.is_cancelled()
    }

    /// Total ticks dropped because the loop fell behind.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}
