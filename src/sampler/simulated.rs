//! Simulated judge with known latent utilities.
//!
//! Draws each trial's outcome from the same Case V model the fitter assumes,
//! so recovered utilities can be checked against the truth. Every draw is
//! seeded from `(seed, subject, items, trial, attempt)`; results do not depend
//! on the order in which concurrent trials run.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::judgment::{Choice, JudgmentError, JudgmentRequest, JudgmentSource};
use crate::thurstone::choice_probabilities;

#[derive(Debug)]
pub struct SimulatedJudge {
    /// Item id -> utility, used for any subject without its own table.
    utilities: HashMap<String, f64>,
    /// Subject name -> item id -> utility.
    per_subject: HashMap<String, HashMap<String, f64>>,
    sigma: f64,
    tie_band: f64,
    unparseable_rate: f64,
    transient_error_rate: f64,
    unparseable_items: HashSet<String>,
    seed: u64,
    attempts: Mutex<HashMap<String, u32>>,
    calls: AtomicU64,
}

impl SimulatedJudge {
    pub fn new(utilities: HashMap<String, f64>) -> Self {
        Self {
            utilities,
            per_subject: HashMap::new(),
            sigma: 1.0,
            tie_band: 0.0,
            unparseable_rate: 0.0,
            transient_error_rate: 0.0,
            unparseable_items: HashSet::new(),
            seed: 0,
            attempts: Mutex::new(HashMap::new()),
            calls: AtomicU64::new(0),
        }
    }

    /// Noise scale; 0 makes the judge deterministic (higher utility always wins).
    pub fn with_sigma(mut self, sigma: f64) -> Self {
        self.sigma = sigma.max(0.0);
        self
    }

    pub fn with_tie_band(mut self, delta: f64) -> Self {
        self.tie_band = delta.max(0.0);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Fraction of answers that come back unparseable.
    pub fn with_unparseable_rate(mut self, rate: f64) -> Self {
        self.unparseable_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Fraction of attempts that fail with a retryable source error.
    pub fn with_transient_error_rate(mut self, rate: f64) -> Self {
        self.transient_error_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Every trial involving this item comes back unparseable.
    pub fn with_unparseable_item(mut self, item_id: impl Into<String>) -> Self {
        self.unparseable_items.insert(item_id.into());
        self
    }

    pub fn with_subject(mut self, subject_name: impl Into<String>, utilities: HashMap<String, f64>) -> Self {
        self.per_subject.insert(subject_name.into(), utilities);
        self
    }

    /// Number of `judge` calls so far, including failed attempts.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    fn next_attempt(&self, key: &str) -> u32 {
        let mut guard = match self.attempts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let counter = guard.entry(key.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    fn rng_for(&self, key: &str, attempt: u32) -> StdRng {
        let digest = blake3::hash(format!("{}|{key}|{attempt}", self.seed).as_bytes());
        let mut seed = [0u8; 32];
        seed.copy_from_slice(digest.as_bytes());
        StdRng::from_seed(seed)
    }
}

#[async_trait]
impl JudgmentSource for SimulatedJudge {
    async fn judge(&self, req: JudgmentRequest<'_>) -> Result<Choice, JudgmentError> {
        self.calls.fetch_add(1, Ordering::Relaxed);

        let key = format!(
            "{}|{}|{}|{}",
            req.subject.name, req.first.id, req.second.id, req.trial
        );
        let attempt = self.next_attempt(&key);
        let mut rng = self.rng_for(&key, attempt);

        if rng.gen::<f64>() < self.transient_error_rate {
            return Err(JudgmentError::transient("simulated outage"));
        }
        if self.unparseable_items.contains(&req.first.id)
            || self.unparseable_items.contains(&req.second.id)
            || rng.gen::<f64>() < self.unparseable_rate
        {
            return Err(JudgmentError::Unparseable("simulated garbage".to_string()));
        }

        let table = self.per_subject.get(&req.subject.name).unwrap_or(&self.utilities);
        let utility = |id: &str| {
            table
                .get(id)
                .copied()
                .ok_or_else(|| JudgmentError::permanent(format!("no simulated utility for item {id}")))
        };
        let d = utility(&req.first.id)? - utility(&req.second.id)?;

        if self.sigma == 0.0 {
            return Ok(if d.abs() <= self.tie_band {
                Choice::Tie
            } else if d > 0.0 {
                Choice::First
            } else {
                Choice::Second
            });
        }

        let p = choice_probabilities(d, self.tie_band, self.sigma);
        let draw: f64 = rng.gen();
        Ok(if draw < p.a {
            Choice::First
        } else if draw < p.a + p.b {
            Choice::Second
        } else {
            Choice::Tie
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Item;
    use crate::gateway::Provider;
    use crate::subject::{JudgeSettings, Subject};

    fn setup() -> (Subject, Item, Item, HashMap<String, f64>) {
        let subject = Subject::model(JudgeSettings::new(Provider::OpenRouter, "sim"));
        let hi = Item::new("x", "high");
        let lo = Item::new("x", "low");
        let utilities = HashMap::from([(hi.id.clone(), 2.0), (lo.id.clone(), 0.0)]);
        (subject, hi, lo, utilities)
    }

    #[tokio::test]
    async fn noiseless_judge_prefers_higher_utility_in_either_slot() {
        let (subject, hi, lo, utilities) = setup();
        let judge = SimulatedJudge::new(utilities).with_sigma(0.0);
        let first = judge
            .judge(JudgmentRequest { subject: &subject, first: &hi, second: &lo, trial: 0 })
            .await
            .unwrap();
        let second = judge
            .judge(JudgmentRequest { subject: &subject, first: &lo, second: &hi, trial: 1 })
            .await
            .unwrap();
        assert_eq!(first, Choice::First);
        assert_eq!(second, Choice::Second);
        assert_eq!(judge.calls(), 2);
    }

    #[tokio::test]
    async fn unparseable_item_never_yields_a_choice() {
        let (subject, hi, lo, utilities) = setup();
        let judge = SimulatedJudge::new(utilities).with_unparseable_item(lo.id.clone());
        let result = judge
            .judge(JudgmentRequest { subject: &subject, first: &hi, second: &lo, trial: 0 })
            .await;
        assert!(matches!(result, Err(JudgmentError::Unparseable(_))));
    }
}
