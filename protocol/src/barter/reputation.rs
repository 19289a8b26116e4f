//! Per-user reputation. Purely additive; entries are never removed.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reputation {
    pub total: u64,
    pub count: u64,
    pub average: f64,
}

impl Reputation {
    /// Adds one event worth `points`.
    pub fn record(&mut self, points: u64) {
        self.total = self.total.saturating_add(points);
        self.count += 1;
        self.average = self.total as f64 / self.count as f64;
    }

    /// Replaces an earlier event worth `old` with one worth `new`.
    pub fn revise(&mut self, old: u64, new: u64) {
        if self.count == 0 {
            self.record(new);
            return;
        }
        self.total = self.total.saturating_sub(old).saturating_add(new);
        self.average = self.total as f64 / self.count as f64;
    }
}
