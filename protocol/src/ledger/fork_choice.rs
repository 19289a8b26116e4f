//! Deterministic chain selection.
//!
//! Given the local chain and a fully validated candidate, the winner is
//! decided by, in order:
//!
//! 1. total producer stake (higher wins)
//! 2. length (longer wins)
//! 3. timestamp of the last block (earlier wins)
//! 4. otherwise the current chain stays
//!
//! Stake is read from the `STAKE` transactions each chain carries, never
//! from the local registry, so every node weighs a given chain the same.

use std::cmp::Ordering;
use std::collections::HashSet;

use super::block::Block;
use super::transaction::TransactionKind;
use super::validators::ValidatorRegistry;

/// Outcome of comparing the local chain with a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkChoice {
    KeepCurrent,
    AdoptCandidate,
}

/// The registry implied by the `STAKE` transactions recorded in `chain`.
pub fn stake_table(chain: &[Block]) -> ValidatorRegistry {
    let mut registry = ValidatorRegistry::new();
    let mut seen = HashSet::new();
    for block in chain {
        let Ok(txs) = block.decompressed_transactions() else {
            continue;
        };
        for tx in txs {
            if tx.kind != TransactionKind::Stake || !seen.insert(tx.digest()) {
                continue;
            }
            if let (Some(validator), Some(amount)) = (tx.from.as_deref(), tx.amount()) {
                registry.add_stake(validator, amount);
            }
        }
    }
    registry
}

/// Sum over blocks of the chain-recorded stake of each block's producer.
pub fn chain_weight(chain: &[Block]) -> u64 {
    let registry = stake_table(chain);
    chain
        .iter()
        .filter_map(|b| b.validator.as_deref())
        .fold(0u64, |acc, v| acc.saturating_add(registry.stake_of(v)))
}

pub fn choose(current: &[Block], candidate: &[Block]) -> ForkChoice {
    let by_weight = chain_weight(candidate).cmp(&chain_weight(current));
    let by_length = candidate.len().cmp(&current.len());
    // Earlier last block wins, so compare in reverse.
    let by_timestamp = last_timestamp(current).cmp(&last_timestamp(candidate));

    match by_weight.then(by_length).then(by_timestamp) {
        Ordering::Greater => ForkChoice::AdoptCandidate,
        Ordering::Less | Ordering::Equal => ForkChoice::KeepCurrent,
    }
}

fn last_timestamp(chain: &[Block]) -> i64 {
    chain.last().map(|b| b.timestamp).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Transaction;

    /// Genesis, then one block per producer. `big` stakes 100 and `small`
    /// stakes 1 in the first block of every chain built here.
    fn chain(producers: &[&str], last_ts: i64) -> Vec<Block> {
        let mut blocks = vec![Block::genesis()];
        for (i, p) in producers.iter().enumerate() {
            let txs = if i == 0 {
                vec![Transaction::stake("big", 100), Transaction::stake("small", 1)]
            } else {
                vec![]
            };
            let next = Block::new(blocks.last().unwrap(), txs, Some(p.to_string())).unwrap();
            blocks.push(next);
        }
        if let Some(last) = blocks.last_mut() {
            last.timestamp = last_ts;
        }
        blocks
    }

    #[test]
    fn heavier_chain_wins_even_if_shorter() {
        let current = chain(&["small", "small", "small"], 10);
        let candidate = chain(&["big"], 10);
        assert_eq!(choose(&current, &candidate), ForkChoice::AdoptCandidate);
        assert_eq!(choose(&candidate, &current), ForkChoice::KeepCurrent);
    }

    #[test]
    fn longer_chain_breaks_weight_tie() {
        let current = chain(&["small", "unknown"], 10);
        let candidate = chain(&["small", "unknown", "unknown"], 10);
        assert_eq!(choose(&current, &candidate), ForkChoice::AdoptCandidate);
    }

    #[test]
    fn earlier_tip_breaks_length_tie() {
        let current = chain(&["small"], 2_000);
        let candidate = chain(&["small"], 1_000);
        assert_eq!(choose(&current, &candidate), ForkChoice::AdoptCandidate);
        assert_eq!(choose(&candidate, &current), ForkChoice::KeepCurrent);
    }

    #[test]
    fn full_tie_keeps_current() {
        let current = chain(&["small"], 1_000);
        let candidate = chain(&["small"], 1_000);
        assert_eq!(choose(&current, &candidate), ForkChoice::KeepCurrent);
    }

    #[test]
    fn choice_is_deterministic() {
        let a = chain(&["big", "small"], 5);
        let b = chain(&["small", "big"], 6);
        let first = choose(&a, &b);
        for _ in 0..10 {
            assert_eq!(choose(&a, &b), first);
        }
    }

    #[test]
    fn weight_ignores_unknown_producers() {
        assert_eq!(chain_weight(&chain(&["ghost", "big"], 1)), 100);
        assert_eq!(chain_weight(&[Block::genesis()]), 0);
    }

    #[test]
    fn stake_recorded_elsewhere_does_not_count() {
        // The producer staked, but not in this chain.
        let bare = Block::new(&Block::genesis(), vec![], Some("big".into())).unwrap();
        assert_eq!(chain_weight(&[Block::genesis(), bare]), 0);
    }

    #[test]
    fn compressed_blocks_keep_their_stake() {
        let mut blocks = chain(&["big", "big"], 1);
        assert!(blocks[1].compress().unwrap());
        assert_eq!(stake_table(&blocks).stake_of("big"), 100);
        assert_eq!(chain_weight(&blocks), 200);
    }
}
