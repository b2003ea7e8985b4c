//! Elo conversions shared by the SPRT and the run summaries.

use serde::{Deserialize, Serialize};

use super::chi2::normal_cdf;
use crate::model::Stats;

/// Two-sided 95% quantile of the standard normal distribution.
const Z_95: f64 = 1.959_963_984_540_054;

/// Expected score of a player `elo` points stronger, logistic model.
pub fn logistic_score(elo: f64) -> f64 {
    1.0 / (1.0 + 10f64.powf(-elo / 400.0))
}

/// Inverse of [`logistic_score`], with the score clamped away from 0 and 1.
pub fn elo_from_score(score: f64) -> f64 {
    let score = score.clamp(1e-3, 1.0 - 1e-3);
    -400.0 * (1.0 / score - 1.0).log10()
}

/// Win, draw and loss probabilities under the BayesElo model.
pub fn bayeselo_to_probabilities(elo: f64, drawelo: f64) -> (f64, f64, f64) {
    let win = 1.0 / (1.0 + 10f64.powf((-elo + drawelo) / 400.0));
    let loss = 1.0 / (1.0 + 10f64.powf((elo + drawelo) / 400.0));
    (win, 1.0 - win - loss, loss)
}

/// Logistic Elo equivalent of a BayesElo difference.
pub fn bayeselo_to_elo(elo: f64, drawelo: f64) -> f64 {
    let (win, draw, _) = bayeselo_to_probabilities(elo, drawelo);
    elo_from_score(win + 0.5 * draw)
}

/// Drawelo estimated from a regularized `[losses, draws, wins]` sample.
pub fn drawelo(results: [f64; 3]) -> f64 {
    let [losses, draws, wins] = regularize(results);
    let n = losses + draws + wins;
    let (l, w) = (losses / n, wins / n);
    200.0 * ((1.0 - l) / l * (1.0 - w) / w).log10()
}

/// Replace empty cells so that logs and variances stay finite.
pub(crate) fn regularize(results: [f64; 3]) -> [f64; 3] {
    results.map(|x| if x == 0.0 { 1e-3 } else { x })
}

/// Point estimate, 95% margin and likelihood of superiority of a result set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EloEstimate {
    pub elo: f64,
    pub margin: f64,
    pub los: f64,
}

/// `None` when no game was played.
pub fn estimate(stats: &Stats) -> Option<EloEstimate> {
    let n = f64::from(stats.games());
    if n == 0.0 {
        return None;
    }
    let w = f64::from(stats.wins) / n;
    let l = f64::from(stats.losses) / n;
    let d = f64::from(stats.draws) / n;
    let mu = w + d / 2.0;
    let deviation =
        (w * (1.0 - mu).powi(2) + l * (0.0 - mu).powi(2) + d * (0.5 - mu).powi(2)).sqrt()
            / n.sqrt();
    let low = elo_from_score(mu - Z_95 * deviation);
    let high = elo_from_score(mu + Z_95 * deviation);

    let decisive = f64::from(stats.wins + stats.losses);
    let los = if decisive == 0.0 {
        0.5
    } else {
        normal_cdf((f64::from(stats.wins) - f64::from(stats.losses)) / decisive.sqrt())
    };
    Some(EloEstimate {
        elo: elo_from_score(mu),
        margin: (high - low) / 2.0,
        los,
    })
}

#[cfg(test)]
mod elo_tests {
    use super::*;

    #[test]
    fn test_logistic_round_trip() {
        assert!((logistic_score(0.0) - 0.5).abs() < 1e-12);
        assert!((elo_from_score(logistic_score(35.0)) - 35.0).abs() < 1e-9);
    }

    #[test]
    fn test_estimate() {
        assert_eq!(estimate(&Stats::default()), None);

        let even = estimate(&Stats::new(100, 100, 200)).unwrap();
        assert!(even.elo.abs() < 1e-9);
        assert!(even.margin > 0.0);
        assert!((even.los - 0.5).abs() < 1e-9);

        let winning = estimate(&Stats::new(300, 200, 500)).unwrap();
        assert!(winning.elo > 0.0);
        assert!(winning.elo - winning.margin > 0.0);
        assert!(winning.los > 0.99);
    }

    #[test]
    fn test_bayeselo_probabilities_sum_to_one() {
        let (w, d, l) = bayeselo_to_probabilities(20.0, 250.0);
        assert!((w + d + l - 1.0).abs() < 1e-12);
        assert!(w > l);
    }
}
