//! Validator registry and stake-weighted producer selection.
//!
//! Selection runs independently on every node with local randomness, so it
//! does not produce agreement by itself. Nodes that draw themselves mine;
//! competing tips are reconciled afterwards by [`super::fork_choice`].

use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Validator id → stake. Stakes only ever grow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorRegistry {
    stakes: BTreeMap<String, u64>,
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises `validator`'s stake by `amount`, registering it if unknown.
    /// Returns the new stake.
    pub fn add_stake(&mut self, validator: &str, amount: u64) -> u64 {
        let stake = self.stakes.entry(validator.to_string()).or_insert(0);
        *stake = stake.saturating_add(amount);
        *stake
    }

    pub fn stake_of(&self, validator: &str) -> u64 {
        self.stakes.get(validator).copied().unwrap_or(0)
    }

    pub fn total_stake(&self) -> u64 {
        self.stakes
            .values()
            .fold(0u64, |acc, s| acc.saturating_add(*s))
    }

    pub fn len(&self) -> usize {
        self.stakes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stakes.is_empty()
    }

    /// `(validator, stake)` pairs in id order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.stakes.iter().map(|(v, s)| (v.as_str(), *s))
    }

    /// Draws a validator with probability proportional to its stake.
    ///
    /// `None` when no validator holds any stake.
    pub fn select<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&str> {
        let total = self.total_stake();
        if total == 0 {
            return None;
        }
        let mut ticket = rng.gen_range(0..total);
        for (validator, stake) in &self.stakes {
            if ticket < *stake {
                return Some(validator.as_str());
            }
            ticket -= stake;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn stake_accumulates() {
        let mut reg = ValidatorRegistry::new();
        assert_eq!(reg.add_stake("a", 10), 10);
        assert_eq!(reg.add_stake("a", 5), 15);
        assert_eq!(reg.stake_of("a"), 15);
        assert_eq!(reg.stake_of("b"), 0);
        assert_eq!(reg.total_stake(), 15);
    }

    #[test]
    fn empty_registry_selects_nobody() {
        let reg = ValidatorRegistry::new();
        let mut rng = StdRng::seed_from_u64(1);
        assert!(reg.select(&mut rng).is_none());

        let mut zero = ValidatorRegistry::new();
        zero.add_stake("idle", 0);
        assert!(zero.select(&mut rng).is_none());
    }

    #[test]
    fn single_validator_always_selected() {
        let mut reg = ValidatorRegistry::new();
        reg.add_stake("solo", 3);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            assert_eq!(reg.select(&mut rng), Some("solo"));
        }
    }

    #[test]
    fn zero_stake_validator_never_selected() {
        let mut reg = ValidatorRegistry::new();
        reg.add_stake("idle", 0);
        reg.add_stake("busy", 1);
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..200 {
            assert_eq!(reg.select(&mut rng), Some("busy"));
        }
    }

    #[test]
    fn selection_is_proportional_to_stake() {
        let mut reg = ValidatorRegistry::new();
        reg.add_stake("heavy", 90);
        reg.add_stake("light", 10);
        let mut rng = StdRng::seed_from_u64(2024);
        let draws = 20_000;
        let heavy = (0..draws)
            .filter(|_| reg.select(&mut rng) == Some("heavy"))
            .count();
        let ratio = heavy as f64 / draws as f64;
        assert!((0.87..0.93).contains(&ratio), "ratio was {ratio}");
    }
}
