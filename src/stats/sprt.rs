//! Sequential probability ratio test on trinomial game results.
//!
//! The log-likelihood ratio uses the generalized SPRT approximation
//! `LLR = N (s1 - s0) (2s - s0 - s1) / (2 var)` where `s` and `var` are the empirical mean and
//! variance of the per-game score, and `s0`/`s1` the expected scores under the two hypotheses.

use std::{fmt, str::FromStr};

use anyhow::bail;
use serde::{Deserialize, Serialize};

use super::elo::{bayeselo_to_elo, drawelo, logistic_score, regularize};
use crate::model::Stats;

/// How the hypothesis bounds `elo0` / `elo1` are interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EloModel {
    BayesElo,
    #[default]
    #[serde(rename = "logistic")]
    Logistic,
    #[serde(rename = "normalized")]
    Normalized,
}

impl FromStr for EloModel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "BayesElo" => EloModel::BayesElo,
            "logistic" => EloModel::Logistic,
            "normalized" => EloModel::Normalized,
            other => bail!("Unknown Elo model: {other}"),
        })
    }
}

impl fmt::Display for EloModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EloModel::BayesElo => "BayesElo",
            EloModel::Logistic => "logistic",
            EloModel::Normalized => "normalized",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SprtDecision {
    /// H1 accepted: the new variant is at least `elo1` stronger.
    Accepted,
    /// H0 accepted.
    Rejected,
}

/// Parameters and current state of the test attached to a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SprtState {
    pub elo0: f64,
    pub elo1: f64,
    pub alpha: f64,
    pub beta: f64,
    pub elo_model: EloModel,
    /// Game pairs per batch: the test is only evaluated at batch boundaries.
    pub batch_size: u32,
    pub llr: f64,
    pub state: Option<SprtDecision>,
    #[serde(default)]
    pub evaluated_batches: u64,
}

impl SprtState {
    pub fn new(
        elo0: f64,
        elo1: f64,
        alpha: f64,
        beta: f64,
        elo_model: EloModel,
        batch_size: u32,
    ) -> SprtState {
        SprtState {
            elo0,
            elo1,
            alpha,
            beta,
            elo_model,
            batch_size,
            llr: 0.0,
            state: None,
            evaluated_batches: 0,
        }
    }

    pub fn lower_bound(&self) -> f64 {
        (self.beta / (1.0 - self.alpha)).ln()
    }

    pub fn upper_bound(&self) -> f64 {
        ((1.0 - self.beta) / self.alpha).ln()
    }

    /// Games per batch.
    pub fn batch_games(&self) -> u32 {
        2 * self.batch_size.max(1)
    }

    /// Pure evaluation of the test on `results`.
    pub fn evaluate(&self, results: &Stats) -> (f64, Option<SprtDecision>) {
        let llr = llr(self.elo0, self.elo1, self.elo_model, results);
        let decision = if llr >= self.upper_bound() {
            Some(SprtDecision::Accepted)
        } else if llr <= self.lower_bound() {
            Some(SprtDecision::Rejected)
        } else {
            None
        };
        (llr, decision)
    }

    /// Feed the cumulative results of the run. The test is evaluated only when a new batch
    /// boundary is crossed, and a decision, once taken, sticks.
    pub fn update(&mut self, results: &Stats) -> Option<SprtDecision> {
        if self.state.is_some() {
            return self.state;
        }
        let games = u64::from(results.games());
        let batch = u64::from(self.batch_games());
        if games == 0 || games % batch != 0 || games / batch <= self.evaluated_batches {
            return None;
        }
        self.evaluated_batches = games / batch;
        let (llr, decision) = self.evaluate(results);
        self.llr = llr;
        self.state = decision;
        decision
    }

    /// Recompute from scratch, without batch gating. Used after results were purged.
    pub fn reevaluate(&mut self, results: &Stats) -> Option<SprtDecision> {
        let (llr, decision) = self.evaluate(results);
        self.llr = llr;
        self.state = decision;
        self.evaluated_batches = u64::from(results.games()) / u64::from(self.batch_games());
        decision
    }

    /// Forget the decision so that a revived run keeps testing.
    pub fn reset_decision(&mut self) {
        self.state = None;
        self.evaluated_batches = 0;
    }
}

/// Log-likelihood ratio of H1 (`elo1`) against H0 (`elo0`). Zero when no game was played.
pub fn llr(elo0: f64, elo1: f64, model: EloModel, results: &Stats) -> f64 {
    if results.games() == 0 {
        return 0.0;
    }
    let sample = regularize([
        f64::from(results.losses),
        f64::from(results.draws),
        f64::from(results.wins),
    ]);
    let n: f64 = sample.iter().sum();
    let scores = [0.0, 0.5, 1.0];
    let mean: f64 = sample.iter().zip(scores).map(|(c, s)| c / n * s).sum();
    let variance: f64 = sample
        .iter()
        .zip(scores)
        .map(|(c, s)| c / n * (s - mean).powi(2))
        .sum();

    let (s0, s1) = match model {
        EloModel::Logistic => (logistic_score(elo0), logistic_score(elo1)),
        EloModel::BayesElo => {
            let draw_elo = drawelo(sample);
            (
                logistic_score(bayeselo_to_elo(elo0, draw_elo)),
                logistic_score(bayeselo_to_elo(elo1, draw_elo)),
            )
        }
        EloModel::Normalized => {
            let scale = 800.0 / std::f64::consts::LN_10;
            let deviation = variance.sqrt();
            (
                0.5 + elo0 / scale * deviation,
                0.5 + elo1 / scale * deviation,
            )
        }
    };
    n * (s1 - s0) * (2.0 * mean - s0 - s1) / variance / 2.0
}

#[cfg(test)]
mod sprt_tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-3
    }

    fn sprt(model: EloModel) -> SprtState {
        SprtState::new(0.0, 5.0, 0.05, 0.05, model, 4)
    }

    #[test]
    fn test_bounds() {
        let state = sprt(EloModel::Logistic);
        assert!(close(state.lower_bound(), -2.944_438_979_166_44));
        assert!(close(state.upper_bound(), 2.944_438_979_166_44));
    }

    #[test]
    fn test_llr_values() {
        let results = Stats::new(400, 350, 250);
        assert!(close(llr(0.0, 5.0, EloModel::Logistic, &results), 0.8240));
        assert!(close(llr(0.0, 5.0, EloModel::Normalized, &results), 0.7287));
        assert!(close(llr(0.0, 5.0, EloModel::BayesElo, &results), 0.7804));
        assert!(close(
            llr(0.0, 5.0, EloModel::Logistic, &Stats::new(350, 400, 250)),
            -1.1011
        ));
        assert_eq!(llr(0.0, 5.0, EloModel::Logistic, &Stats::default()), 0.0);
    }

    #[test]
    fn test_llr_increases_with_wins() {
        let mut previous = f64::NEG_INFINITY;
        for wins in (0..1200).step_by(7) {
            let value = llr(0.0, 5.0, EloModel::Logistic, &Stats::new(wins, 350, 250));
            assert!(value >= previous - 1e-9);
            previous = value;
        }
    }

    #[test]
    fn test_evaluate_is_pure() {
        let state = sprt(EloModel::Normalized);
        let results = Stats::new(1600, 1400, 1000);
        assert_eq!(state.evaluate(&results), state.evaluate(&results));
    }

    #[test]
    fn test_update_accepts_at_batch_boundary() {
        let mut state = sprt(EloModel::Logistic);
        // 4001 games is not a batch boundary
        assert_eq!(state.update(&Stats::new(1601, 1400, 1000)), None);
        assert_eq!(state.llr, 0.0);

        assert_eq!(
            state.update(&Stats::new(1600, 1400, 1000)),
            Some(SprtDecision::Accepted)
        );
        assert!(close(state.llr, 3.2962));
        // sticky
        assert_eq!(
            state.update(&Stats::new(1600, 2400, 1000)),
            Some(SprtDecision::Accepted)
        );
    }

    #[test]
    fn test_update_rejects() {
        let mut state = sprt(EloModel::Logistic);
        assert_eq!(state.update(&Stats::new(350, 400, 250)), None);
        assert!(close(state.llr, -1.1011));
        assert_eq!(
            state.update(&Stats::new(1050, 1200, 750)),
            Some(SprtDecision::Rejected)
        );
    }

    #[test]
    fn test_reevaluate_clears_decision() {
        let mut state = sprt(EloModel::Logistic);
        state.update(&Stats::new(1600, 1400, 1000));
        assert_eq!(state.reevaluate(&Stats::new(400, 350, 250)), None);
        assert!(close(state.llr, 0.8240));
    }

    #[test]
    fn test_model_parsing() {
        assert_eq!("BayesElo".parse::<EloModel>().unwrap(), EloModel::BayesElo);
        assert!("elo".parse::<EloModel>().is_err());
    }
}
