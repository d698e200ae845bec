//! Service quality: the global feedback controller and per-table levels.
//!
//! DESIGN
//! ======
//! The global level rises and falls with the average client round-trip delay
//! measured over each stats tick. Single noisy ticks are ignored: a change
//! needs several consecutive ticks on the same side of a threshold, except
//! for severe delay, which drops two levels at once. With few connections the
//! server is never the bottleneck, so the level is pinned to the maximum.
//!
//! The global scale has a few levels above the top of [`QUALITY_LEVELS`];
//! tables subtract `floor(log2(subscribers + 1))` from the global level, so a
//! crowded table degrades first while small tables stay at full quality.

use crate::config::{QUALITY_LEVELS, QualityConfig};

/// Level a table with `subscribers` members runs at.
#[must_use]
pub fn local_quality(global: usize, subscribers: usize) -> usize {
    let decrease = subscribers.saturating_add(1).ilog2() as usize;
    global.saturating_sub(decrease).min(QUALITY_LEVELS.len() - 1)
}

/// Hysteresis controller for the global quality level.
#[derive(Debug, Clone)]
pub struct QualityController {
    config: QualityConfig,
    level: usize,
    slow_ticks: u32,
    fast_ticks: u32,
}

impl QualityController {
    #[must_use]
    pub fn new(config: QualityConfig) -> Self {
        Self { level: config.max_global(), config, slow_ticks: 0, fast_ticks: 0 }
    }

    #[must_use]
    pub fn level(&self) -> usize {
        self.level
    }

    /// Feed one tick. Returns the new level if it changed.
    pub fn tick(&mut self, connections: usize, average_delay: Option<f64>) -> Option<usize> {
        if !self.config.enabled {
            return None;
        }
        let previous = self.level;
        let max = self.config.max_global();

        if connections <= self.config.connection_threshold {
            self.level = max;
            self.slow_ticks = 0;
            self.fast_ticks = 0;
        } else if let Some(delay) = average_delay {
            if delay > self.config.double_decrease_threshold {
                self.level = self.level.saturating_sub(2);
                self.slow_ticks = 0;
                self.fast_ticks = 0;
            } else if delay > self.config.decrease_threshold {
                self.fast_ticks = 0;
                self.slow_ticks += 1;
                if self.slow_ticks >= self.config.decrease_insensitivity {
                    self.level = self.level.saturating_sub(1);
                    self.slow_ticks = 0;
                }
            } else if delay < self.config.increase_threshold {
                self.slow_ticks = 0;
                self.fast_ticks += 1;
                if self.fast_ticks >= self.config.increase_insensitivity {
                    self.level = (self.level + 1).min(max);
                    self.fast_ticks = 0;
                }
            } else {
                self.slow_ticks = 0;
                self.fast_ticks = 0;
            }
        }

        (self.level != previous).then_some(self.level)
    }
}

#[cfg(test)]
#[path = "quality_test.rs"]
mod tests;
