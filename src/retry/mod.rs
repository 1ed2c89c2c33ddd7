//! Bounded exponential backoff with jitter.
//!
//! A [`RetryPolicy`] describes the schedule; a [`RetryContext`] tracks one
//! retry loop against an absolute deadline. The attempt counter and the
//! deadline are independent: a loop ends when the deadline passes, however
//! few attempts it has made.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;

/// Backoff schedule shared by readiness polling and install retries.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    min_interval: Duration,
    max_interval: Duration,
    multiplier: u32,
    jitter_percent: u32,
    timeout: Duration,
    seed: Option<u64>,
}

impl RetryPolicy {
    /// Creates a policy that doubles from `min_interval` up to
    /// `max_interval` with 20% jitter, giving up after `timeout`.
    #[must_use]
    pub const fn new(min_interval: Duration, max_interval: Duration, timeout: Duration) -> Self {
        Self {
            min_interval,
            max_interval,
            multiplier: 2,
            jitter_percent: 20,
            timeout,
            seed: None,
        }
    }

    /// Sets the growth factor applied after every attempt.
    #[must_use]
    pub const fn with_multiplier(mut self, multiplier: u32) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Sets the jitter spread as a percentage of the base interval.
    #[must_use]
    pub const fn with_jitter_percent(mut self, percent: u32) -> Self {
        self.jitter_percent = percent;
        self
    }

    /// Replaces the overall deadline.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Seeds the jitter source so schedules are reproducible.
    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Overall deadline measured from [`RetryPolicy::start`].
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Interval before jitter for the given zero-based attempt.
    #[must_use]
    pub fn base_interval(&self, attempt: u32) -> Duration {
        let min = millis(self.min_interval);
        let max = millis(self.max_interval).max(min);
        let factor = u64::from(self.multiplier.max(1)).saturating_pow(attempt);
        Duration::from_millis(min.saturating_mul(factor).min(max))
    }

    /// Jittered interval for `attempt`, never above the maximum interval.
    #[must_use]
    pub fn interval<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = millis(self.base_interval(attempt));
        let spread = base
            .saturating_mul(u64::from(self.jitter_percent.min(100)))
            .checked_div(100)
            .unwrap_or(0);
        let offset = if spread == 0 {
            0
        } else {
            rng.random_range(0..=spread.saturating_mul(2))
        };
        let jittered = base.saturating_sub(spread).saturating_add(offset);
        Duration::from_millis(jittered).min(self.max_interval.max(self.min_interval))
    }

    /// Starts a retry loop now.
    #[must_use]
    pub fn start(&self) -> RetryContext {
        self.start_at(Instant::now())
    }

    /// Starts a retry loop at `now`.
    #[must_use]
    pub fn start_at(&self, now: Instant) -> RetryContext {
        let rng = self
            .seed
            .map_or_else(|| StdRng::from_rng(&mut rand::rng()), StdRng::seed_from_u64);
        RetryContext {
            policy: self.clone(),
            attempt: 0,
            started: now,
            deadline: now + self.timeout,
            last_backoff: Duration::ZERO,
            rng,
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Decision returned by [`RetryContext::next_at`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Backoff {
    /// Sleep for the given duration, then try again.
    Wait(Duration),
    /// The deadline has passed; stop retrying.
    Exhausted,
}

/// Progress of one retry loop.
#[derive(Clone, Debug)]
pub struct RetryContext {
    policy: RetryPolicy,
    attempt: u32,
    started: Instant,
    deadline: Instant,
    last_backoff: Duration,
    rng: StdRng,
}

impl RetryContext {
    /// Number of backoffs handed out so far.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Instant the loop started.
    #[must_use]
    pub const fn started(&self) -> Instant {
        self.started
    }

    /// Absolute deadline of the loop.
    #[must_use]
    pub const fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Most recent backoff handed out.
    #[must_use]
    pub const fn last_backoff(&self) -> Duration {
        self.last_backoff
    }

    /// Tightens the deadline to `deadline` when that is earlier.
    #[must_use]
    pub fn bounded_by(mut self, deadline: Instant) -> Self {
        self.deadline = self.deadline.min(deadline);
        self
    }

    /// Time spent in the loop as of `now`.
    #[must_use]
    pub fn elapsed_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started)
    }

    /// Decides what to do after a failed attempt observed at `now`.
    ///
    /// The returned wait never extends past the deadline.
    pub fn next_at(&mut self, now: Instant) -> Backoff {
        if now >= self.deadline {
            return Backoff::Exhausted;
        }
        let remaining = self.deadline.saturating_duration_since(now);
        let wait = self
            .policy
            .interval(self.attempt, &mut self.rng)
            .min(remaining);
        self.attempt = self.attempt.saturating_add(1);
        self.last_backoff = wait;
        Backoff::Wait(wait)
    }

    /// Sleeps for the next backoff. Returns `false` once the deadline has
    /// passed.
    pub async fn wait(&mut self) -> bool {
        match self.next_at(Instant::now()) {
            Backoff::Wait(delay) => {
                tokio::time::sleep(delay).await;
                true
            }
            Backoff::Exhausted => false,
        }
    }
}
