//! Countdown state machine: `Idle → Armed → ShuttingDown → Finished`.
//!
//! The machine itself holds no timers; the coordinator feeds it elapsed ticks
//! and acts on the transitions it reports.

use std::time::Duration;

const MINUTE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownState {
    Idle,
    Armed,
    ShuttingDown,
    Finished,
}

impl CountdownState {
    pub fn as_str(self) -> &'static str {
        match self {
            CountdownState::Idle => "idle",
            CountdownState::Armed => "armed",
            CountdownState::ShuttingDown => "shutting down",
            CountdownState::Finished => "finished",
        }
    }
}

/// Result of a `start` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arming {
    /// A fresh countdown was armed.
    Armed,
    /// A running countdown was replaced; carries what was left on it.
    Rearmed { superseded_remaining: Duration },
    /// The shutdown sequence already began; the request had no effect.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tick {
    /// The countdown moved; `previous` is the value before this tick.
    Counting {
        previous: Duration,
        remaining: Duration,
    },
    /// Remaining time reached zero.
    Elapsed,
    /// The tick belongs to a superseded or finished countdown.
    Stale,
}

#[derive(Debug)]
pub(crate) struct Countdown {
    state: CountdownState,
    requested: Duration,
    remaining: Duration,
    tick: Duration,
    epoch: u64,
}

impl Countdown {
    pub(crate) fn new(tick: Duration) -> Self {
        Self {
            state: CountdownState::Idle,
            requested: Duration::ZERO,
            remaining: Duration::ZERO,
            tick: tick.max(Duration::from_millis(1)),
            epoch: 0,
        }
    }

    pub(crate) fn state(&self) -> CountdownState {
        self.state
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn requested(&self) -> Duration {
        self.requested
    }

    pub(crate) fn remaining(&self) -> Duration {
        match self.state {
            CountdownState::Armed => self.remaining,
            _ => Duration::ZERO,
        }
    }

    pub(crate) fn arm(&mut self, delay: Duration) -> Arming {
        let arming = match self.state {
            CountdownState::Idle => Arming::Armed,
            CountdownState::Armed => Arming::Rearmed {
                superseded_remaining: self.remaining,
            },
            CountdownState::ShuttingDown | CountdownState::Finished => return Arming::Ignored,
        };

        self.epoch += 1;
        self.requested = delay;
        self.remaining = delay;
        self.state = CountdownState::Armed;
        arming
    }

    /// Wait before the first tick, chosen so later ticks land on whole multiples
    /// of the tick length and the last one lands exactly on zero.
    pub(crate) fn first_wait(&self) -> Duration {
        let tick_nanos = self.tick.as_nanos();
        let remainder = self.remaining.as_nanos() % tick_nanos;
        if self.remaining.is_zero() {
            Duration::ZERO
        } else if remainder == 0 {
            self.tick
        } else {
            Duration::from_nanos(remainder as u64)
        }
    }

    pub(crate) fn tick_length(&self) -> Duration {
        self.tick
    }

    pub(crate) fn on_tick(&mut self, epoch: u64, elapsed: Duration) -> Tick {
        if epoch != self.epoch || self.state != CountdownState::Armed {
            return Tick::Stale;
        }

        let previous = self.remaining;
        self.remaining = self.remaining.saturating_sub(elapsed);
        if self.remaining.is_zero() {
            Tick::Elapsed
        } else {
            Tick::Counting {
                previous,
                remaining: self.remaining,
            }
        }
    }

    /// `Armed → ShuttingDown`; false when the epoch is stale or the sequence
    /// already began.
    pub(crate) fn begin_shutdown(&mut self, epoch: u64) -> bool {
        if epoch != self.epoch || self.state != CountdownState::Armed {
            return false;
        }
        self.state = CountdownState::ShuttingDown;
        self.remaining = Duration::ZERO;
        true
    }

    /// `ShuttingDown → Finished`.
    pub(crate) fn finish(&mut self) {
        if self.state == CountdownState::ShuttingDown {
            self.state = CountdownState::Finished;
            self.remaining = Duration::ZERO;
        }
    }

    /// `Armed → Idle`, returning what was left on the countdown.
    pub(crate) fn disarm(&mut self) -> Option<Duration> {
        if self.state != CountdownState::Armed {
            return None;
        }
        let remaining = self.remaining;
        self.epoch += 1;
        self.state = CountdownState::Idle;
        self.remaining = Duration::ZERO;
        Some(remaining)
    }
}

/// Round up to whole seconds, the unit remaining time is surfaced in.
pub(crate) fn whole_seconds(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 { secs.saturating_add(1) } else { secs }
}

fn whole_minutes(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    let minutes = secs / MINUTE.as_secs();
    if secs % MINUTE.as_secs() != 0 || duration.subsec_nanos() > 0 {
        minutes + 1
    } else {
        minutes
    }
}

/// Minutes to announce when a tick crosses a whole-minute boundary, if any.
///
/// A notice goes out on every multiple of `interval_mins` and on every minute
/// inside the final `final_mins`.
pub(crate) fn warning_due(
    previous: Duration,
    remaining: Duration,
    interval_mins: u64,
    final_mins: u64,
) -> Option<u64> {
    let before = whole_minutes(previous);
    let now = whole_minutes(remaining);
    if now == 0 || now >= before {
        return None;
    }
    if now <= final_mins || (interval_mins > 0 && now % interval_mins == 0) {
        Some(now)
    } else {
        None
    }
}

/// Minutes announced when a countdown is first armed.
pub(crate) fn announced_minutes(delay: Duration) -> u64 {
    whole_minutes(delay).max(1)
}
