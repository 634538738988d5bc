//! Per-pair outcome counts.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::judgment::Outcome;

/// Outcome counts for one unordered pair `(i, j)`, `i < j`.
///
/// `wins_a` counts trials won by item `i`. `requested` is the number of
/// trials attempted; `valid() <= requested` always holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairTally {
    pub i: usize,
    pub j: usize,
    pub wins_a: u32,
    pub wins_b: u32,
    pub ties: u32,
    pub requested: u32,
}

impl PairTally {
    pub fn new(i: usize, j: usize, requested: u32) -> Self {
        Self {
            i,
            j,
            requested,
            ..Self::default()
        }
    }

    pub fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::A => self.wins_a += 1,
            Outcome::B => self.wins_b += 1,
            Outcome::Tie => self.ties += 1,
        }
    }

    pub fn valid(&self) -> u32 {
        self.wins_a + self.wins_b + self.ties
    }

    pub fn dropped(&self) -> u32 {
        self.requested.saturating_sub(self.valid())
    }

    /// Same counts with the orientation swapped.
    fn flipped(self) -> Self {
        Self {
            i: self.j,
            j: self.i,
            wins_a: self.wins_b,
            wins_b: self.wins_a,
            ties: self.ties,
            requested: self.requested,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TallyError {
    #[error("pair ({i}, {j}) is out of range for {n_items} items")]
    OutOfRange { i: usize, j: usize, n_items: usize },
    #[error("pair ({0}, {0}) compares an item with itself")]
    SelfPair(usize),
    #[error("pair ({i}, {j}) has {valid} valid outcomes but only {requested} requested trials")]
    Overfull {
        i: usize,
        j: usize,
        valid: u32,
        requested: u32,
    },
    #[error("pair ({i}, {j}) appears more than once")]
    DuplicatePair { i: usize, j: usize },
}

/// Tallies for every sampled pair over an `n_items` catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "TallyFile", try_from = "TallyFile")]
pub struct TallyTable {
    n_items: usize,
    pairs: BTreeMap<(usize, usize), PairTally>,
}

#[derive(Serialize, Deserialize)]
struct TallyFile {
    n_items: usize,
    pairs: Vec<PairTally>,
}

impl From<TallyTable> for TallyFile {
    fn from(table: TallyTable) -> Self {
        Self {
            n_items: table.n_items,
            pairs: table.pairs.into_values().collect(),
        }
    }
}

impl TryFrom<TallyFile> for TallyTable {
    type Error = TallyError;

    fn try_from(file: TallyFile) -> Result<Self, Self::Error> {
        let mut table = TallyTable::new(file.n_items);
        for tally in file.pairs {
            table.insert(tally)?;
        }
        Ok(table)
    }
}

impl TallyTable {
    pub fn new(n_items: usize) -> Self {
        Self {
            n_items,
            pairs: BTreeMap::new(),
        }
    }

    pub fn n_items(&self) -> usize {
        self.n_items
    }

    /// Add the tally for a pair not yet in the table, canonicalising
    /// orientation. `(i, j)` and `(j, i)` are the same pair.
    pub fn insert(&mut self, tally: PairTally) -> Result<(), TallyError> {
        let tally = if tally.i > tally.j { tally.flipped() } else { tally };
        if tally.i == tally.j {
            return Err(TallyError::SelfPair(tally.i));
        }
        if tally.j >= self.n_items {
            return Err(TallyError::OutOfRange {
                i: tally.i,
                j: tally.j,
                n_items: self.n_items,
            });
        }
        if tally.valid() > tally.requested {
            return Err(TallyError::Overfull {
                i: tally.i,
                j: tally.j,
                valid: tally.valid(),
                requested: tally.requested,
            });
        }
        match self.pairs.entry((tally.i, tally.j)) {
            Entry::Occupied(_) => Err(TallyError::DuplicatePair {
                i: tally.i,
                j: tally.j,
            }),
            Entry::Vacant(slot) => {
                slot.insert(tally);
                Ok(())
            }
        }
    }

    pub fn get(&self, i: usize, j: usize) -> Option<&PairTally> {
        let key = if i < j { (i, j) } else { (j, i) };
        self.pairs.get(&key)
    }

    pub fn contains(&self, i: usize, j: usize) -> bool {
        self.get(i, j).is_some()
    }

    /// Tallies in canonical `(i, j)` order.
    pub fn iter(&self) -> impl Iterator<Item = &PairTally> {
        self.pairs.values()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn total_valid(&self) -> u64 {
        self.pairs.values().map(|t| t.valid() as u64).sum()
    }

    pub fn total_requested(&self) -> u64 {
        self.pairs.values().map(|t| t.requested as u64).sum()
    }

    /// Valid trials involving each item.
    pub fn item_trials(&self) -> Vec<u64> {
        let mut counts = vec![0u64; self.n_items];
        for tally in self.pairs.values() {
            let valid = tally.valid() as u64;
            counts[tally.i] += valid;
            counts[tally.j] += valid;
        }
        counts
    }

    /// Number of distinct pairs with at least one valid trial, per item.
    pub fn item_degrees(&self) -> Vec<usize> {
        let mut degrees = vec![0usize; self.n_items];
        for tally in self.pairs.values().filter(|t| t.valid() > 0) {
            degrees[tally.i] += 1;
            degrees[tally.j] += 1;
        }
        degrees
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reversed_pairs_are_canonicalised() {
        let mut table = TallyTable::new(3);
        table
            .insert(PairTally {
                i: 2,
                j: 0,
                wins_a: 3,
                wins_b: 1,
                ties: 0,
                requested: 5,
            })
            .unwrap();
        let t = table.get(0, 2).unwrap();
        assert_eq!((t.i, t.j, t.wins_a, t.wins_b), (0, 2, 1, 3));
        assert_eq!(t.dropped(), 1);
    }

    #[test]
    fn second_tally_for_a_pair_is_rejected() {
        let mut table = TallyTable::new(2);
        let mut first = PairTally::new(0, 1, 2);
        first.record(Outcome::A);
        first.record(Outcome::Tie);
        table.insert(first).unwrap();
        let mut second = PairTally::new(1, 0, 2);
        second.record(Outcome::B);
        assert_eq!(
            table.insert(second),
            Err(TallyError::DuplicatePair { i: 0, j: 1 })
        );
        let t = table.get(1, 0).unwrap();
        assert_eq!((t.wins_a, t.wins_b, t.ties, t.requested), (1, 0, 1, 2));
        assert_eq!(table.item_trials(), vec![2, 2]);
    }

    #[test]
    fn invalid_tallies_are_rejected() {
        let mut table = TallyTable::new(2);
        assert_eq!(
            table.insert(PairTally::new(1, 1, 1)),
            Err(TallyError::SelfPair(1))
        );
        assert!(matches!(
            table.insert(PairTally::new(0, 2, 1)),
            Err(TallyError::OutOfRange { .. })
        ));
        let mut over = PairTally::new(0, 1, 1);
        over.record(Outcome::A);
        over.record(Outcome::A);
        assert!(matches!(table.insert(over), Err(TallyError::Overfull { .. })));
    }

    #[test]
    fn json_roundtrip_validates() {
        let raw = r#"{"n_items": 2, "pairs": [{"i": 0, "j": 1, "wins_a": 9, "wins_b": 0, "ties": 0, "requested": 3}]}"#;
        assert!(serde_json::from_str::<TallyTable>(raw).is_err());
    }

    #[test]
    fn json_listing_a_pair_in_both_orientations_is_rejected() {
        let raw = r#"{"n_items": 2, "pairs": [
            {"i": 0, "j": 1, "wins_a": 5, "wins_b": 0, "ties": 0, "requested": 5},
            {"i": 1, "j": 0, "wins_a": 0, "wins_b": 5, "ties": 0, "requested": 5}
        ]}"#;
        let err = serde_json::from_str::<TallyTable>(raw).unwrap_err();
        assert!(err.to_string().contains("more than once"), "{err}");
    }
}
