//! Log-normal fitting of dissimilarity-score distributions.
//!
//! The overlap strategy scores every trial by its summed dissimilarity to
//! the other trials, normalises the scores by their maximum, and fits a
//! log-normal PDF to their 50-bin histogram by damped least squares
//! (method-of-moments initialisation). The acceptance threshold is derived
//! in closed form from the fitted parameters; the formula is kept exactly
//! as historically used:
//!
//! ```text
//! thresh     = exp(μ)                  (median switch)
//!              exp(μ + σ²/2)           (mean switch)
//! thresh_std = thresh + 2·sqrt((exp(σ²) − 1)·exp(2μ + σ²))
//! ```
//!
//! A trial passes when its normalised score is strictly below `thresh_std`.

use tracing::debug;

/// Number of histogram bins used for the fit.
pub const HISTOGRAM_BINS: usize = 50;

/// Which central-tendency estimate anchors the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThresholdKind {
    /// `thresh = exp(μ)` — the distribution median. The default.
    #[default]
    Median,
    /// `thresh = exp(μ + σ²/2)` — the distribution mean.
    Mean,
}

/// Fitted log-normal parameters plus the histogram they were fitted to.
#[derive(Debug, Clone)]
pub struct LognormFit {
    /// Location parameter of the log-normal.
    pub mu: f64,
    /// Scale parameter of the log-normal (σ > 0).
    pub sigma: f64,
    /// Histogram sample abscissae (bin edges shifted by half a step).
    pub centers: Vec<f64>,
    /// Normalised histogram density at each abscissa.
    pub density: Vec<f64>,
}

/// Outcome of thresholding one chunk's score vector.
#[derive(Debug, Clone)]
pub struct ThresholdOutcome {
    /// Indices of the trials whose normalised score fell below the gate.
    pub selected: Vec<usize>,
    /// Max-normalised scores, index-aligned with the input.
    pub normalized: Vec<f64>,
    /// The fitted distribution.
    pub fit: LognormFit,
    /// The `thresh_std` gate the scores were compared against.
    pub threshold: f64,
}

/// The log-normal probability density at `y` (expects `y > 0`).
pub fn log_norm_pdf(y: f64, mu: f64, sigma: f64) -> f64 {
    let ln_y = y.ln();
    1.0 / ((2.0 * std::f64::consts::PI).sqrt() * sigma * y)
        * (-(ln_y - mu).powi(2) / (2.0 * sigma * sigma)).exp()
}

/// Fit a log-normal to `values` via its histogram.
///
/// Mirrors the historical procedure: 50-bin histogram, density normalised
/// to unit area, abscissae at `edge − step/2` with a leading zero-density
/// point, then a damped Gauss-Newton least-squares fit of
/// [`log_norm_pdf`] to the `(abscissa, density)` pairs (non-positive
/// abscissae are skipped). The starting point is the method-of-moments
/// estimate from the log of the positive values; if the iteration fails to
/// improve or turns non-finite, that estimate is returned unchanged.
pub fn lognorm_fitting(values: &[f64], bins: usize) -> LognormFit {
    let (centers, density) = histogram_density(values, bins);

    let (mu0, sigma0) = moments_estimate(values);
    let (mu, sigma) = match least_squares_fit(&centers, &density, mu0, sigma0) {
        Some(params) => params,
        None => {
            debug!("log-normal least-squares fit did not converge; keeping moments estimate");
            (mu0, sigma0)
        }
    };

    LognormFit { mu, sigma, centers, density }
}

/// Normalise `scores` by their maximum, fit a log-normal, and select the
/// trials below the closed-form `thresh_std` gate.
///
/// A degenerate all-zero score vector (every trial identical to every
/// other) selects everything.
pub fn lognorm_thresholding(scores: &[f64], kind: ThresholdKind) -> ThresholdOutcome {
    let max = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !(max > 0.0) {
        debug!("degenerate zero dissimilarity scores; selecting all trials");
        return ThresholdOutcome {
            selected: (0..scores.len()).collect(),
            normalized: vec![0.0; scores.len()],
            fit: LognormFit { mu: 0.0, sigma: 1.0, centers: Vec::new(), density: Vec::new() },
            threshold: f64::INFINITY,
        };
    }

    let normalized: Vec<f64> = scores.iter().map(|s| s / max).collect();
    let fit = lognorm_fitting(&normalized, HISTOGRAM_BINS);

    let (mu, sigma) = (fit.mu, fit.sigma);
    let thresh = match kind {
        ThresholdKind::Median => mu.exp(),
        ThresholdKind::Mean => (mu + sigma * sigma / 2.0).exp(),
    };
    let spread = ((sigma * sigma).exp() - 1.0) * (mu + mu + sigma * sigma).exp();
    let threshold = thresh + 2.0 * spread.sqrt();

    let selected = normalized
        .iter()
        .enumerate()
        .filter(|(_, &v)| v < threshold)
        .map(|(i, _)| i)
        .collect();

    ThresholdOutcome { selected, normalized, fit, threshold }
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

/// Histogram of `values` normalised to unit area, sampled the historical
/// way: abscissae are the bin edges shifted left by half a step and the
/// density vector gains a leading zero so both have `bins + 1` entries.
fn histogram_density(values: &[f64], bins: usize) -> (Vec<f64>, Vec<f64>) {
    let mut lo = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let mut hi = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !lo.is_finite() || !hi.is_finite() {
        lo = 0.0;
        hi = 1.0;
    }
    if hi - lo < f64::EPSILON {
        lo -= 0.5;
        hi += 0.5;
    }
    let step = (hi - lo) / bins as f64;

    let mut counts = vec![0usize; bins];
    for &v in values {
        if !v.is_finite() {
            continue;
        }
        let mut idx = ((v - lo) / step) as usize;
        if idx >= bins {
            idx = bins - 1;
        }
        counts[idx] += 1;
    }

    let total: usize = counts.iter().sum();
    let norm = total as f64 * step;

    let mut centers = Vec::with_capacity(bins + 1);
    let mut density = Vec::with_capacity(bins + 1);
    density.push(0.0);
    for i in 0..=bins {
        centers.push(lo + i as f64 * step - 0.5 * step);
    }
    for &c in &counts {
        density.push(c as f64 / norm);
    }
    (centers, density)
}

/// Method-of-moments (μ, σ) estimate from the log of the positive values.
fn moments_estimate(values: &[f64]) -> (f64, f64) {
    let logs: Vec<f64> = values
        .iter()
        .filter(|v| **v > 0.0 && v.is_finite())
        .map(|v| v.ln())
        .collect();
    if logs.is_empty() {
        return (0.0, 1.0);
    }
    let mean = logs.iter().sum::<f64>() / logs.len() as f64;
    let var = logs.iter().map(|l| (l - mean).powi(2)).sum::<f64>() / logs.len() as f64;
    (mean, var.sqrt().max(0.05))
}

/// Damped Gauss-Newton least squares of [`log_norm_pdf`] over the
/// `(x, y)` pairs with `x > 0`. Returns `None` when the iteration cannot
/// improve on the starting point.
fn least_squares_fit(xs: &[f64], ys: &[f64], mu0: f64, sigma0: f64) -> Option<(f64, f64)> {
    let points: Vec<(f64, f64)> = xs
        .iter()
        .zip(ys.iter())
        .filter(|(x, _)| **x > 0.0)
        .map(|(&x, &y)| (x, y))
        .collect();
    if points.len() < 3 {
        return None;
    }

    let sse = |mu: f64, sigma: f64| -> f64 {
        points
            .iter()
            .map(|&(x, y)| {
                let r = y - log_norm_pdf(x, mu, sigma);
                r * r
            })
            .sum()
    };

    let mut mu = mu0;
    let mut sigma = sigma0;
    let mut lambda = 1e-3;
    let mut best = sse(mu, sigma);

    for _ in 0..100 {
        // Normal equations of the 2-parameter Jacobian.
        let (mut jtj00, mut jtj01, mut jtj11) = (0.0, 0.0, 0.0);
        let (mut jtr0, mut jtr1) = (0.0, 0.0);
        for &(x, y) in &points {
            let f = log_norm_pdf(x, mu, sigma);
            let ln_x = x.ln();
            let d_mu = f * (ln_x - mu) / (sigma * sigma);
            let d_sigma = f * ((ln_x - mu).powi(2) / sigma.powi(3) - 1.0 / sigma);
            let r = y - f;
            jtj00 += d_mu * d_mu;
            jtj01 += d_mu * d_sigma;
            jtj11 += d_sigma * d_sigma;
            jtr0 += d_mu * r;
            jtr1 += d_sigma * r;
        }

        // Solve (JᵀJ + λ·diag) δ = Jᵀr.
        let a00 = jtj00 + lambda * jtj00.max(1e-12);
        let a11 = jtj11 + lambda * jtj11.max(1e-12);
        let det = a00 * a11 - jtj01 * jtj01;
        if !det.is_finite() || det.abs() < 1e-300 {
            break;
        }
        let d_mu = (jtr0 * a11 - jtr1 * jtj01) / det;
        let d_sigma = (jtr1 * a00 - jtr0 * jtj01) / det;

        let new_mu = mu + d_mu;
        let new_sigma = sigma + d_sigma;
        if !new_mu.is_finite() || !new_sigma.is_finite() || new_sigma <= 1e-6 {
            lambda *= 10.0;
            if lambda > 1e9 {
                break;
            }
            continue;
        }

        let new_sse = sse(new_mu, new_sigma);
        if new_sse < best {
            mu = new_mu;
            sigma = new_sigma;
            lambda = (lambda / 10.0).max(1e-12);
            if (best - new_sse).abs() < 1e-14 {
                best = new_sse;
                break;
            }
            best = new_sse;
        } else {
            lambda *= 10.0;
            if lambda > 1e9 {
                break;
            }
        }
    }

    if mu.is_finite() && sigma.is_finite() && sigma > 0.0 {
        Some((mu, sigma))
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
