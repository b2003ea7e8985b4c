//! Simultaneous perturbation stochastic approximation.
//!
//! Each task batch plays the new variant with parameters `theta + c_k * flip` against
//! `theta - c_k * flip`; the win/loss difference is then used as a gradient estimate to move
//! `theta`. Gains follow the usual schedules `c_k = c / k^gamma` and `a_k = a / (A + k)^alpha`.

use anyhow::{bail, Context};
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Clipping {
    /// Clamp to `[min, max]`.
    #[default]
    Old,
    /// Never move more than half the distance to the bound ahead.
    Careful,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rounding {
    #[default]
    Deterministic,
    Randomized,
}

impl std::str::FromStr for Clipping {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "old" => Ok(Clipping::Old),
            "careful" => Ok(Clipping::Careful),
            other => bail!("Unknown clipping method: {other}"),
        }
    }
}

impl std::str::FromStr for Rounding {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deterministic" => Ok(Rounding::Deterministic),
            "randomized" => Ok(Rounding::Randomized),
            other => bail!("Unknown rounding method: {other}"),
        }
    }
}

/// One tuned parameter with its derived gains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpsaParam {
    pub name: String,
    pub start: f64,
    pub min: f64,
    pub max: f64,
    pub c_end: f64,
    pub r_end: f64,
    pub c: f64,
    pub a_end: f64,
    pub a: f64,
    /// Current estimate, never rounded.
    pub theta: f64,
}

/// SPSA state of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpsaRun {
    #[serde(rename = "A")]
    pub a_offset: f64,
    pub alpha: f64,
    pub gamma: f64,
    pub iter: u64,
    pub num_iter: u64,
    pub clipping: Clipping,
    pub rounding: Rounding,
    pub raw_params: String,
    pub params: Vec<SpsaParam>,
}

/// Per-parameter gains and direction drawn for one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamPerturbation {
    pub c_k: f64,
    pub r: f64,
    pub flip: i8,
}

/// Stored in the task between `request_spsa` and the next `update_task`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Perturbation {
    pub k: u64,
    pub params: Vec<ParamPerturbation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamValue {
    pub name: String,
    pub value: f64,
}

/// Parameter values sent to the worker: white plays `theta + c_k`, black `theta - c_k`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpsaBatch {
    pub w_params: Vec<ParamValue>,
    pub b_params: Vec<ParamValue>,
}

/// Parse `name,start,min,max,c_end,r_end` lines and derive the gains of each parameter.
pub fn parse_params(
    raw: &str,
    a_offset: f64,
    alpha: f64,
    gamma: f64,
    num_iter: u64,
) -> anyhow::Result<Vec<SpsaParam>> {
    let mut params = vec![];
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let chunks: Vec<&str> = line.split(',').map(str::trim).collect();
        if chunks.len() != 6 {
            bail!("the line {line:?} does not have 6 entries");
        }
        let mut numbers = [0.0; 5];
        for (slot, chunk) in numbers.iter_mut().zip(&chunks[1..]) {
            *slot = chunk
                .parse()
                .with_context(|| format!("invalid number {chunk:?} in line {line:?}"))?;
        }
        let [start, min, max, c_end, r_end] = numbers;
        if !(min <= start && start <= max) {
            bail!("parameter {} must satisfy min <= start <= max", chunks[0]);
        }
        if c_end <= 0.0 {
            bail!("parameter {} must have a positive c_end", chunks[0]);
        }
        let num_iter = num_iter as f64;
        let c = c_end * num_iter.powf(gamma);
        let a_end = r_end * c_end * c_end;
        params.push(SpsaParam {
            name: chunks[0].to_string(),
            start,
            min,
            max,
            c_end,
            r_end,
            c,
            a_end,
            a: a_end * (a_offset + num_iter).powf(alpha),
            theta: start,
        });
    }
    Ok(params)
}

/// Move `param.theta` by `increment`, respecting the bounds.
pub fn clip(param: &SpsaParam, increment: f64, clipping: Clipping) -> f64 {
    let theta = param.theta;
    match clipping {
        Clipping::Old => (theta + increment).clamp(param.min, param.max),
        Clipping::Careful => {
            let room = if increment > 0.0 {
                param.max - theta
            } else {
                theta - param.min
            };
            theta + increment.abs().min(room.max(0.0) / 2.0).copysign(increment)
        }
    }
}

pub fn round<R: Rng>(value: f64, rounding: Rounding, rng: &mut R) -> f64 {
    match rounding {
        Rounding::Deterministic => value.round(),
        Rounding::Randomized => (value + rng.random::<f64>()).floor(),
    }
}

impl SpsaRun {
    pub fn new(
        a_offset: f64,
        alpha: f64,
        gamma: f64,
        num_iter: u64,
        clipping: Clipping,
        rounding: Rounding,
        raw_params: &str,
    ) -> anyhow::Result<SpsaRun> {
        let params = parse_params(raw_params, a_offset, alpha, gamma, num_iter)?;
        if params.is_empty() {
            bail!("Number of params must be > 0");
        }
        Ok(SpsaRun {
            a_offset,
            alpha,
            gamma,
            iter: 0,
            num_iter,
            clipping,
            rounding,
            raw_params: raw_params.to_string(),
            params,
        })
    }

    pub fn is_finished(&self) -> bool {
        self.iter >= self.num_iter
    }

    /// Current estimate of each parameter.
    pub fn theta(&self) -> Vec<ParamValue> {
        self.params
            .iter()
            .map(|p| ParamValue {
                name: p.name.clone(),
                value: p.theta,
            })
            .collect()
    }

    /// Draw the perturbation for the next batch. Reported values are clipped, then rounded.
    pub fn perturb<R: Rng>(&self, rng: &mut R) -> (Perturbation, SpsaBatch) {
        let k = self.iter + 1;
        let kf = k as f64;
        let mut perturbation = Perturbation {
            k,
            params: Vec::with_capacity(self.params.len()),
        };
        let mut batch = SpsaBatch {
            w_params: vec![],
            b_params: vec![],
        };
        for param in &self.params {
            let c_k = param.c / kf.powf(self.gamma);
            let r = param.a / (self.a_offset + kf).powf(self.alpha) / (c_k * c_k);
            let flip: i8 = if rng.random::<bool>() { 1 } else { -1 };
            let shift = c_k * f64::from(flip);
            batch.w_params.push(ParamValue {
                name: param.name.clone(),
                value: round(clip(param, shift, self.clipping), self.rounding, rng),
            });
            batch.b_params.push(ParamValue {
                name: param.name.clone(),
                value: round(clip(param, -shift, self.clipping), self.rounding, rng),
            });
            perturbation.params.push(ParamPerturbation { c_k, r, flip });
        }
        (perturbation, batch)
    }

    /// Move theta along the measured gradient and account `games / 2` iterations.
    pub fn apply_result(&mut self, perturbation: &Perturbation, wins: u32, losses: u32, games: u32) {
        let result = f64::from(wins) - f64::from(losses);
        for (param, drawn) in self.params.iter_mut().zip(&perturbation.params) {
            let increment = drawn.r * drawn.c_k * result * f64::from(drawn.flip);
            param.theta = clip(param, increment, self.clipping);
        }
        self.iter = (self.iter + u64::from(games / 2)).min(self.num_iter);
    }
}

#[cfg(test)]
mod spsa_tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    const RAW: &str = "Tempo,100,0,200,10,0.0020\n\n  Aggr, 50, 40, 60, 4, 0.0020 \n";

    fn run(clipping: Clipping) -> SpsaRun {
        SpsaRun::new(
            5000.0,
            0.602,
            0.101,
            100,
            clipping,
            Rounding::Deterministic,
            RAW,
        )
        .unwrap()
    }

    #[test]
    fn test_parse_derives_gains() {
        let spsa = run(Clipping::Old);
        assert_eq!(spsa.params.len(), 2);
        let tempo = &spsa.params[0];
        assert_eq!(tempo.name, "Tempo");
        assert!((tempo.c - 10.0 * 100f64.powf(0.101)).abs() < 1e-9);
        assert!((tempo.a_end - 0.2).abs() < 1e-12);
        assert!((tempo.a - 0.2 * 5100f64.powf(0.602)).abs() < 1e-9);
        assert_eq!(tempo.theta, 100.0);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_params("a,1,2,3", 0.0, 0.6, 0.1, 10).is_err());
        assert!(parse_params("a,1,0,2,x,1", 0.0, 0.6, 0.1, 10).is_err());
        assert!(parse_params("a,5,0,2,1,1", 0.0, 0.6, 0.1, 10).is_err());
        assert!(SpsaRun::new(0.0, 0.6, 0.1, 10, Clipping::Old, Rounding::Deterministic, "\n").is_err());
    }

    #[test]
    fn test_clipping() {
        let mut spsa = run(Clipping::Old);
        let aggr = &mut spsa.params[1];
        aggr.theta = 58.0;
        assert_eq!(clip(aggr, 5.0, Clipping::Old), 60.0);
        // half the distance to max
        assert_eq!(clip(aggr, 5.0, Clipping::Careful), 59.0);
        assert_eq!(clip(aggr, -1.0, Clipping::Careful), 57.0);
        aggr.theta = 60.0;
        assert_eq!(clip(aggr, 5.0, Clipping::Careful), 60.0);
        assert_eq!(clip(aggr, -5.0, Clipping::Careful), 55.0);
        // leaving a bound is still limited by the bound ahead
        aggr.theta = 40.0;
        assert_eq!(clip(aggr, 30.0, Clipping::Careful), 50.0);
        assert_eq!(clip(aggr, 30.0, Clipping::Old), 60.0);
        assert_eq!(clip(aggr, -5.0, Clipping::Careful), 40.0);
    }

    #[test]
    fn test_rounding() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(round(2.5, Rounding::Deterministic, &mut rng), 3.0);
        assert_eq!(round(-2.5, Rounding::Deterministic, &mut rng), -3.0);
        for _ in 0..100 {
            let value = round(2.25, Rounding::Randomized, &mut rng);
            assert!(value == 2.0 || value == 3.0);
        }
    }

    #[test]
    fn test_perturbation_values_are_rounded_and_bounded() {
        let spsa = run(Clipping::Old);
        let mut rng = StdRng::seed_from_u64(42);
        let (perturbation, batch) = spsa.perturb(&mut rng);
        assert_eq!(perturbation.k, 1);
        for ((w, b), param) in batch.w_params.iter().zip(&batch.b_params).zip(&spsa.params) {
            assert_eq!(w.value, w.value.round());
            assert!(w.value >= param.min && w.value <= param.max);
            assert!(b.value >= param.min && b.value <= param.max);
        }
    }

    #[test]
    fn test_apply_result_moves_towards_winner() {
        let mut spsa = run(Clipping::Old);
        let mut rng = StdRng::seed_from_u64(1);
        let (perturbation, _) = spsa.perturb(&mut rng);
        let flip = f64::from(perturbation.params[0].flip);
        spsa.apply_result(&perturbation, 10, 2, 16);
        let moved = spsa.params[0].theta - 100.0;
        assert!(moved * flip > 0.0);
        // theta is not rounded
        assert_ne!(spsa.params[0].theta, spsa.params[0].theta.round());
        assert_eq!(spsa.iter, 8);
    }

    #[test]
    fn test_iterations_are_capped() {
        let mut spsa = run(Clipping::Careful);
        let mut rng = StdRng::seed_from_u64(3);
        while !spsa.is_finished() {
            let (perturbation, _) = spsa.perturb(&mut rng);
            spsa.apply_result(&perturbation, 3, 3, 64);
        }
        assert_eq!(spsa.iter, 100);
        let (perturbation, _) = spsa.perturb(&mut rng);
        spsa.apply_result(&perturbation, 1, 0, 64);
        assert_eq!(spsa.iter, 100);
    }
}
