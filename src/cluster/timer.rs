// src/cluster/timer.rs
use rand::Rng;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Interval {
    Fixed(Duration),
    /// Redrawn uniformly from `min..=max` every time the timer is armed.
    Random { min: Duration, max: Duration },
}

/// A restartable deadline.
///
/// The timer does not schedule anything by itself. The owner asks for the
/// `deadline()` and calls `fire(now)` once the deadline passes, which keeps
/// firing on the same task as message handling. Dropping a timer cancels it.
#[derive(Debug, Clone)]
pub struct Timer {
    interval: Interval,
    repeating: bool,
    deadline: Option<Instant>,
}

impl Timer {
    pub fn fixed(interval: Duration) -> Self {
        Timer {
            interval: Interval::Fixed(interval),
            repeating: false,
            deadline: None,
        }
    }

    pub fn randomized(min: Duration, max: Duration) -> Self {
        Timer {
            interval: Interval::Random { min, max },
            repeating: false,
            deadline: None,
        }
    }

    /// Re-arms itself every time it fires.
    pub fn repeating(mut self) -> Self {
        self.repeating = true;
        self
    }

    pub fn start(&mut self, now: Instant) {
        self.deadline = Some(now + self.next_interval());
    }

    pub fn stop(&mut self) {
        self.deadline = None;
    }

    pub fn reset(&mut self, now: Instant) {
        self.stop();
        self.start(now);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Returns true if the deadline has passed. A one-shot timer disarms,
    /// a repeating one re-arms from `now`.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                if self.repeating {
                    self.start(now);
                } else {
                    self.stop();
                }
                true
            }
            _ => false,
        }
    }

    fn next_interval(&self) -> Duration {
        match self.interval {
            Interval::Fixed(interval) => interval,
            Interval::Random { min, max } => {
                let (min, max) = (min.as_millis() as u64, max.as_millis() as u64);
                Duration::from_millis(rand::thread_rng().gen_range(min..=max))
            }
        }
    }
}
