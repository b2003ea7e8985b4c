//! Incomplete gamma function and the chi-square test of independence used by purge.

use std::collections::BTreeMap;

const EPS: f64 = 3.0e-14;
const FPMIN: f64 = 1.0e-300;
const MAX_ITERATIONS: usize = 500;

/// Natural logarithm of the gamma function (Lanczos approximation), `x > 0`.
pub fn ln_gamma(x: f64) -> f64 {
    const COEFFICIENTS: [f64; 6] = [
        76.180_091_729_471_46,
        -86.505_320_329_416_77,
        24.014_098_240_830_91,
        -1.231_739_572_450_155,
        0.120_865_097_386_617_9e-2,
        -0.539_523_938_495_3e-5,
    ];
    let mut y = x;
    let tmp = x + 5.5;
    let tmp = tmp - (x + 0.5) * tmp.ln();
    let mut series = 1.000_000_000_190_015;
    for c in COEFFICIENTS {
        y += 1.0;
        series += c / y;
    }
    -tmp + (2.506_628_274_631_000_5 * series / x).ln()
}

/// Regularized lower incomplete gamma function `P(a, x)`.
pub fn gamma_p(a: f64, x: f64) -> f64 {
    if x <= 0.0 || a <= 0.0 {
        return 0.0;
    }
    if x < a + 1.0 {
        gamma_series(a, x)
    } else {
        1.0 - gamma_continued_fraction(a, x)
    }
}

/// Regularized upper incomplete gamma function `Q(a, x) = 1 - P(a, x)`.
pub fn gamma_q(a: f64, x: f64) -> f64 {
    if x <= 0.0 || a <= 0.0 {
        return 1.0;
    }
    if x < a + 1.0 {
        1.0 - gamma_series(a, x)
    } else {
        gamma_continued_fraction(a, x)
    }
}

fn gamma_series(a: f64, x: f64) -> f64 {
    let mut ap = a;
    let mut delta = 1.0 / a;
    let mut sum = delta;
    for _ in 0..MAX_ITERATIONS {
        ap += 1.0;
        delta *= x / ap;
        sum += delta;
        if delta.abs() < sum.abs() * EPS {
            break;
        }
    }
    sum * (-x + a * x.ln() - ln_gamma(a)).exp()
}

// Modified Lentz evaluation of Q(a, x).
fn gamma_continued_fraction(a: f64, x: f64) -> f64 {
    let mut b = x + 1.0 - a;
    let mut c = 1.0 / FPMIN;
    let mut d = 1.0 / b;
    let mut h = d;
    for i in 1..MAX_ITERATIONS {
        let i = i as f64;
        let an = -i * (i - a);
        b += 2.0;
        d = an * d + b;
        if d.abs() < FPMIN {
            d = FPMIN;
        }
        c = b + an / c;
        if c.abs() < FPMIN {
            c = FPMIN;
        }
        d = 1.0 / d;
        let delta = d * c;
        h *= delta;
        if (delta - 1.0).abs() < EPS {
            break;
        }
    }
    (-x + a * x.ln() - ln_gamma(a)).exp() * h
}

/// Survival function of the chi-square distribution.
pub fn chi2_sf(chi2: f64, dof: f64) -> f64 {
    gamma_q(dof / 2.0, chi2 / 2.0)
}

pub fn erf(x: f64) -> f64 {
    let value = gamma_p(0.5, x * x);
    if x < 0.0 {
        -value
    } else {
        value
    }
}

/// Standard normal cumulative distribution.
pub fn normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

/// Result of [`independence_test`].
#[derive(Debug, Clone, PartialEq)]
pub struct Chi2Report {
    pub chi2: f64,
    pub dof: f64,
    pub p: f64,
    /// Largest absolute adjusted residual of each row.
    pub residuals: BTreeMap<String, f64>,
}

impl Chi2Report {
    /// Row with the largest residual.
    pub fn worst(&self) -> Option<(&str, f64)> {
        self.residuals
            .iter()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(key, residual)| (key.as_str(), *residual))
    }
}

/// Pearson chi-square test of independence on a table of `[wins, losses, draws]` rows.
///
/// Empty rows and columns are ignored. With fewer than two usable rows or columns, the
/// table carries no evidence: `p = 1` and every residual is zero.
pub fn independence_test(table: &BTreeMap<String, [f64; 3]>) -> Chi2Report {
    let rows: Vec<(&String, &[f64; 3])> = table
        .iter()
        .filter(|(_, row)| row.iter().sum::<f64>() > 0.0)
        .collect();
    let mut column_sums = [0.0; 3];
    for (_, row) in &rows {
        for (sum, value) in column_sums.iter_mut().zip(row.iter()) {
            *sum += value;
        }
    }
    let columns: Vec<usize> = (0..3).filter(|&j| column_sums[j] > 0.0).collect();
    let total: f64 = column_sums.iter().sum();

    if rows.len() < 2 || columns.len() < 2 {
        return Chi2Report {
            chi2: 0.0,
            dof: 0.0,
            p: 1.0,
            residuals: rows.iter().map(|(key, _)| ((*key).clone(), 0.0)).collect(),
        };
    }

    let mut chi2 = 0.0;
    let mut residuals = BTreeMap::new();
    for (key, row) in &rows {
        let row_sum: f64 = row.iter().sum();
        let mut worst: f64 = 0.0;
        for &j in &columns {
            let expected = row_sum * column_sums[j] / total;
            let diff = row[j] - expected;
            chi2 += diff * diff / expected;
            let scale = expected * (1.0 - row_sum / total) * (1.0 - column_sums[j] / total);
            if scale > 0.0 {
                worst = worst.max((diff / scale.sqrt()).abs());
            }
        }
        residuals.insert((*key).clone(), worst);
    }
    let dof = ((rows.len() - 1) * (columns.len() - 1)) as f64;
    Chi2Report {
        chi2,
        dof,
        p: chi2_sf(chi2, dof),
        residuals,
    }
}
