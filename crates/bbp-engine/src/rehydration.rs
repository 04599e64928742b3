//! Rehydration candidates and their ordering.

use std::cmp::Ordering;
use std::fmt;

use bbp_types::SequenceNumbers;

/// A range of deltas on one medium that can be replayed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RehydrationSet {
    /// Position of the medium in the engine.
    pub slot: usize,
    pub medium: String,
    pub sequence: SequenceNumbers,
}

impl RehydrationSet {
    /// Replay order: newest timestamp first, then medium name, then the
    /// longer chain first.
    pub fn replay_order(&self, other: &Self) -> Ordering {
        other
            .sequence
            .timestamp
            .cmp(&self.sequence.timestamp)
            .then_with(|| self.medium.cmp(&other.medium))
            .then_with(|| other.sequence.current.cmp(&self.sequence.current))
            .then_with(|| self.sequence.first.cmp(&other.sequence.first))
    }
}

impl fmt::Display for RehydrationSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.medium, self.sequence)
    }
}

pub fn sort_for_replay(sets: &mut [RehydrationSet]) {
    sets.sort_by(RehydrationSet::replay_order);
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn set(medium: &str, first: u32, current: u32, ts: i64) -> RehydrationSet {
        RehydrationSet {
            slot: 0,
            medium: medium.into(),
            sequence: SequenceNumbers::new(first, current, ts),
        }
    }

    #[test]
    fn newest_first_then_name() {
        let mut sets = vec![
            set("b", 0, 1, 100),
            set("a", 5, 9, 300),
            set("b", 3, 4, 300),
            set("a", 0, 1, 200),
        ];
        sort_for_replay(&mut sets);
        let order: Vec<_> = sets.iter().map(|s| (s.medium.as_str(), s.sequence.timestamp)).collect();
        assert_eq!(order, vec![("a", 300), ("b", 300), ("a", 200), ("b", 100)]);
    }

    #[test]
    fn live_chain_precedes_its_archive_on_a_tie() {
        let mut sets = vec![set("P", 4, 5, 100), set("P", 4, 9, 100)];
        sort_for_replay(&mut sets);
        assert_eq!(sets[0].sequence.current, 9);
    }

    proptest! {
        #[test]
        fn ordering_is_total_and_newest_first(
            raw in proptest::collection::vec((0u8..3, 0u32..20, 1u32..5, 0i64..50), 0..30)
        ) {
            let mut sets: Vec<_> = raw
                .iter()
                .map(|&(m, first, len, ts)| set(["x", "y", "z"][m as usize], first, first + len, ts))
                .collect();
            sort_for_replay(&mut sets);
            for pair in sets.windows(2) {
                prop_assert!(pair[0].sequence.timestamp >= pair[1].sequence.timestamp);
                prop_assert_ne!(pair[0].replay_order(&pair[1]), Ordering::Greater);
                prop_assert_eq!(pair[0].replay_order(&pair[1]), pair[1].replay_order(&pair[0]).reverse());
            }
        }
    }
}
