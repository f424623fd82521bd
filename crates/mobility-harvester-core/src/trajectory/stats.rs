//! Small statistics toolkit for trip splitting and merging.

use std::f64::consts::PI;

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Population z-scores. `None` when the values have no spread.
pub fn z_scores(values: &[f64]) -> Option<Vec<f64>> {
    let m = mean(values)?;
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    let std = variance.sqrt();
    if !std.is_finite() || std <= f64::EPSILON * m.abs().max(1.0) {
        return None;
    }
    Some(values.iter().map(|v| (v - m) / std).collect())
}

/// Ordinary least-squares fit of `y = intercept + slope * x`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
    pub n: usize,
    pub x_mean: f64,
    /// Σ(x - x̄)²
    pub sxx: f64,
    /// Residual standard error, `sqrt(SSR / (n - 2))`.
    pub residual_se: f64,
}

impl LinearFit {
    /// Needs at least three points and some spread in `x`.
    pub fn fit(xs: &[f64], ys: &[f64]) -> Option<Self> {
        let n = xs.len();
        if n != ys.len() || n < 3 {
            return None;
        }
        let x_mean = mean(xs)?;
        let y_mean = mean(ys)?;
        let sxx: f64 = xs.iter().map(|x| (x - x_mean).powi(2)).sum();
        if sxx <= 0.0 {
            return None;
        }
        let sxy: f64 = xs
            .iter()
            .zip(ys)
            .map(|(x, y)| (x - x_mean) * (y - y_mean))
            .sum();
        let slope = sxy / sxx;
        let intercept = y_mean - slope * x_mean;
        let ssr: f64 = xs
            .iter()
            .zip(ys)
            .map(|(x, y)| (y - (intercept + slope * x)).powi(2))
            .sum();
        Some(Self {
            slope,
            intercept,
            n,
            x_mean,
            sxx,
            residual_se: (ssr / (n - 2) as f64).sqrt(),
        })
    }

    pub fn predict(&self, x: f64) -> f64 {
        self.intercept + self.slope * x
    }

    /// Half-width of the two-sided prediction interval at `x` for a new
    /// observation, at the given confidence level.
    pub fn prediction_half_width(&self, x: f64, confidence: f64) -> f64 {
        let df = (self.n - 2) as f64;
        let t = student_t_quantile((1.0 + confidence) / 2.0, df);
        let n = self.n as f64;
        t * self.residual_se * (1.0 + 1.0 / n + (x - self.x_mean).powi(2) / self.sxx).sqrt()
    }
}

const LANCZOS_G: f64 = 7.0;
const LANCZOS: [f64; 9] = [
    0.999_999_999_999_809_9,
    676.520_368_121_885_1,
    -1_259.139_216_722_402_8,
    771.323_428_777_653_1,
    -176.615_029_162_140_6,
    12.507_343_278_686_905,
    -0.138_571_095_265_720_12,
    9.984_369_578_019_572e-6,
    1.505_632_735_149_311_6e-7,
];

pub fn ln_gamma(x: f64) -> f64 {
    if x < 0.5 {
        // Reflection.
        return (PI / (PI * x).sin()).ln() - ln_gamma(1.0 - x);
    }
    let x = x - 1.0;
    let t = x + LANCZOS_G + 0.5;
    let series = LANCZOS
        .iter()
        .enumerate()
        .skip(1)
        .fold(LANCZOS[0], |acc, (i, c)| acc + c / (x + i as f64));
    0.5 * (2.0 * PI).ln() + (x + 0.5) * t.ln() - t + series.ln()
}

/// Continued fraction for the incomplete beta function (modified Lentz).
fn beta_continued_fraction(a: f64, b: f64, x: f64) -> f64 {
    const MAX_ITERATIONS: usize = 300;
    const EPS: f64 = 3e-14;
    const TINY: f64 = 1e-300;

    let guard = |v: f64| if v.abs() < TINY { TINY } else { v };
    let qab = a + b;
    let qap = a + 1.0;
    let qam = a - 1.0;
    let mut c = 1.0;
    let mut d = 1.0 / guard(1.0 - qab * x / qap);
    let mut h = d;

    for m in 1..=MAX_ITERATIONS {
        let m = m as f64;
        let m2 = 2.0 * m;

        let aa = m * (b - m) * x / ((qam + m2) * (a + m2));
        d = 1.0 / guard(1.0 + aa * d);
        c = guard(1.0 + aa / c);
        h *= d * c;

        let aa = -(a + m) * (qab + m) * x / ((a + m2) * (qap + m2));
        d = 1.0 / guard(1.0 + aa * d);
        c = guard(1.0 + aa / c);
        let delta = d * c;
        h *= delta;

        if (delta - 1.0).abs() < EPS {
            break;
        }
    }
    h
}

/// Regularized incomplete beta function `I_x(a, b)`.
pub fn incomplete_beta(a: f64, b: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }
    let ln_front =
        ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b) + a * x.ln() + b * (1.0 - x).ln();
    let front = ln_front.exp();
    if x < (a + 1.0) / (a + b + 2.0) {
        front * beta_continued_fraction(a, b, x) / a
    } else {
        1.0 - front * beta_continued_fraction(b, a, 1.0 - x) / b
    }
}

/// CDF of Student's t distribution with `df` degrees of freedom.
pub fn student_t_cdf(t: f64, df: f64) -> f64 {
    let tail = 0.5 * incomplete_beta(df / 2.0, 0.5, df / (df + t * t));
    if t >= 0.0 {
        1.0 - tail
    } else {
        tail
    }
}

/// Inverse CDF of Student's t distribution, by bisection.
pub fn student_t_quantile(p: f64, df: f64) -> f64 {
    if !(0.0..=1.0).contains(&p) || df <= 0.0 || p.is_nan() {
        return f64::NAN;
    }
    if p == 0.5 {
        return 0.0;
    }
    if p < 0.5 {
        return -student_t_quantile(1.0 - p, df);
    }
    if p == 1.0 {
        return f64::INFINITY;
    }

    let mut lo = 0.0;
    let mut hi = 1.0;
    while student_t_cdf(hi, df) < p && hi < 1e12 {
        lo = hi;
        hi *= 2.0;
    }
    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        if student_t_cdf(mid, df) < p {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo < 1e-12 {
            break;
        }
    }
    0.5 * (lo + hi)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() < tol
    }

    #[test]
    fn test_ln_gamma_matches_factorials() {
        assert!(close(ln_gamma(1.0), 0.0, 1e-10));
        assert!(close(ln_gamma(5.0), 24f64.ln(), 1e-10));
        assert!(close(ln_gamma(0.5), PI.sqrt().ln(), 1e-10));
        assert!(close(ln_gamma(10.0), 362_880f64.ln(), 1e-9));
        assert!(close(ln_gamma(2.5), (0.75 * PI.sqrt()).ln(), 1e-10));
    }

    #[test]
    fn test_t_quantiles() {
        // Closed forms for one and two degrees of freedom.
        assert!(close(student_t_quantile(0.875, 1.0), 2.414_213_56, 1e-6));
        assert!(close(student_t_quantile(0.875, 2.0), 1.603_567_45, 1e-6));
        assert!(close(student_t_quantile(0.875, 1000.0), 1.150_3, 2e-3));
        assert!(close(student_t_quantile(0.125, 1.0), -2.414_213_56, 1e-6));
        assert_eq!(student_t_quantile(0.5, 4.0), 0.0);
    }

    #[test]
    fn test_t_quantiles_match_tables() {
        // (p, df, t) from standard Student-t tables, three decimals.
        let table = [
            (0.90, 1.0, 3.078),
            (0.90, 2.0, 1.886),
            (0.90, 5.0, 1.476),
            (0.90, 10.0, 1.372),
            (0.90, 30.0, 1.310),
            (0.95, 1.0, 6.314),
            (0.95, 5.0, 2.015),
            (0.95, 10.0, 1.812),
            (0.95, 30.0, 1.697),
            (0.975, 1.0, 12.706),
            (0.975, 5.0, 2.571),
            (0.975, 10.0, 2.228),
            (0.975, 30.0, 2.042),
            (0.995, 5.0, 4.032),
            (0.995, 10.0, 3.169),
        ];
        for (p, df, t) in table {
            let q = student_t_quantile(p, df);
            assert!(close(q, t, 1e-3), "p={p} df={df}: {q} vs {t}");
            assert!(close(student_t_cdf(q, df), p, 1e-7), "cdf(quantile) p={p} df={df}");
        }
    }

    #[test]
    fn test_t_cdf_is_symmetric() {
        for t in [0.3, 1.0, 2.5] {
            let sum = student_t_cdf(t, 5.0) + student_t_cdf(-t, 5.0);
            assert!(close(sum, 1.0, 1e-12));
        }
    }

    #[test]
    fn test_z_scores() {
        let z = z_scores(&[1.0, 2.0, 3.0]).unwrap();
        let expected = 1.0 / (2.0f64 / 3.0).sqrt();
        assert!(close(z[0], -expected, 1e-12));
        assert!(close(z[1], 0.0, 1e-12));
        assert!(close(z[2], expected, 1e-12));
        assert!(z_scores(&[4.0, 4.0, 4.0]).is_none());
        assert!(z_scores(&[]).is_none());
    }

    #[test]
    fn test_linear_fit_and_prediction_interval() {
        let xs = [0.0, 1.0, 2.0, 3.0];
        let ys = [1.0, 3.1, 4.9, 7.0];
        let fit = LinearFit::fit(&xs, &ys).unwrap();
        assert!(close(fit.slope, 1.98, 1e-9));
        assert!(close(fit.predict(4.0), 8.95, 1e-9));

        let near = fit.prediction_half_width(1.5, 0.75);
        let far = fit.prediction_half_width(10.0, 0.75);
        assert!(near > 0.0);
        assert!(far > near);

        assert!(LinearFit::fit(&[1.0, 2.0], &[1.0, 2.0]).is_none());
        assert!(LinearFit::fit(&[1.0, 1.0, 1.0], &[1.0, 2.0, 3.0]).is_none());
    }
}
