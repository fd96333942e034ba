//! Tick timing
//!
//! The loop runs a fixed step but never sub-steps: when an iteration overruns,
//! the next delta stretches to the measured elapsed time instead.

use std::collections::VecDeque;
use std::time::Duration;

/// Delta handed to the next iteration
pub fn next_delta(target: Duration, previous_elapsed: Duration) -> Duration {
    target.max(previous_elapsed)
}

/// Time left to sleep after an iteration that took `elapsed`
pub fn sleep_budget(target: Duration, elapsed: Duration) -> Duration {
    target.saturating_sub(elapsed)
}

/// Load levels derived from recent tick work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickHealth {
    /// Work fits comfortably inside the tick
    Healthy,
    /// Work uses most of the tick
    Strained,
    /// Work exceeds the tick; deltas are stretching
    Overloaded,
}

/// Rolling window of tick work durations for one lobby
#[derive(Debug)]
pub struct TickMonitor {
    samples: VecDeque<Duration>,
    max_samples: usize,
    target: Duration,
    /// Fraction of the budget above which the loop counts as strained
    strained_threshold: f32,
    health: TickHealth,
}

impl TickMonitor {
    pub fn new(target: Duration) -> Self {
        Self {
            samples: VecDeque::with_capacity(120),
            max_samples: 120,
            target,
            strained_threshold: 0.7,
            health: TickHealth::Healthy,
        }
    }

    /// Record one iteration's work time. Returns the health if it changed.
    pub fn record(&mut self, work: Duration) -> Option<TickHealth> {
        self.samples.push_back(work);
        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }

        if self.samples.len() < 10 {
            // Not enough data yet
            return None;
        }

        let usage = self.budget_usage();
        let health = if usage >= 1.0 {
            TickHealth::Overloaded
        } else if usage >= self.strained_threshold {
            TickHealth::Strained
        } else {
            TickHealth::Healthy
        };

        if health == self.health {
            None
        } else {
            self.health = health;
            Some(health)
        }
    }

    pub fn average(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let sum: Duration = self.samples.iter().sum();
        sum / self.samples.len() as u32
    }

    /// 95th percentile work time
    pub fn p95(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let mut sorted: Vec<_> = self.samples.iter().copied().collect();
        sorted.sort();
        let idx = (sorted.len() as f32 * 0.95) as usize;
        sorted.get(idx.min(sorted.len() - 1)).copied().unwrap_or(Duration::ZERO)
    }

    /// Average work as a fraction of the target tick
    pub fn budget_usage(&self) -> f32 {
        self.average().as_secs_f32() / self.target.as_secs_f32().max(f32::EPSILON)
    }

    pub fn health(&self) -> TickHealth {
        self.health
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}
