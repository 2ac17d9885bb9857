//! Trial detection strategies.
//!
//! Every strategy consumes a matrix of shape `[n_trials, n_frames]` — one
//! ROI time-course row per trial — and produces a 0/1 mask over its rows:
//! 1 = selected, 0 = rejected.
//!
//! - [`overlap_strategy`]: chunked pairwise-dissimilarity scoring gated by
//!   a fitted log-normal threshold ([`crate::lognorm`]);
//! - [`roi_strategy`]: per-frame outlier voting on the detrended rows;
//! - [`statistical_strategy`]: standard-deviation percentile window.
//!
//! Dispatch is deterministic and never fails the pipeline: a chunk count
//! that does not divide the frame count degrades the overlap strategy to
//! the ROI strategy with a warning (see [`resolve`]).

use ndarray::{s, Array1, Array2, ArrayView1, Axis};
use tracing::warn;

use crate::config::{ChunkPolicy, Strategy};
use crate::error::StrategyError;
use crate::lognorm::{lognorm_thresholding, ThresholdKind, ThresholdOutcome};

/// Percentile window of the majority-vote chunk gate.
const MAJORITY_GATE: (f64, f64) = (25.0, 75.0);

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Resolve the strategy that will actually run.
///
/// The overlap variants require `n_frames % chunks == 0`; when that fails
/// the dispatch degrades to [`Strategy::Roi`] rather than erroring, so a
/// misconfigured chunk count can never abort a multi-hour session run.
pub fn resolve(strategy: Strategy, n_frames: usize, chunks: usize) -> Strategy {
    if strategy.is_chunked() && n_frames % chunks != 0 {
        warn!(
            "{n_frames} frames cannot be split into {chunks} equal chunks; \
             falling back to the roi strategy"
        );
        return Strategy::Roi;
    }
    strategy
}

// ---------------------------------------------------------------------------
// Overlap strategy
// ---------------------------------------------------------------------------

/// Pairwise dissimilarity measure between two chunk segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlapLoss {
    /// Mean absolute difference.
    Mae,
    /// Mean squared difference.
    Mse,
}

impl OverlapLoss {
    /// The loss implied by a chunked [`Strategy`], if any.
    pub fn from_strategy(strategy: Strategy) -> Option<Self> {
        match strategy {
            Strategy::Mae => Some(OverlapLoss::Mae),
            Strategy::Mse => Some(OverlapLoss::Mse),
            _ => None,
        }
    }

    fn between(&self, a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> f64 {
        let n = a.len() as f64;
        match self {
            OverlapLoss::Mae => {
                a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).sum::<f64>() / n
            }
            OverlapLoss::Mse => {
                a.iter()
                    .zip(b.iter())
                    .map(|(x, y)| (x - y) * (x - y))
                    .sum::<f64>()
                    / n
            }
        }
    }
}

/// Outcome of one overlap-strategy run.
#[derive(Debug, Clone)]
pub struct OverlapOutcome {
    /// 0/1 selection mask over the input rows.
    pub mask: Vec<u8>,
    /// Per-chunk threshold diagnostics (log-normal fits and gates); empty
    /// for the majority-vote policy, which uses percentile gates instead.
    pub chunk_fits: Vec<ThresholdOutcome>,
}

/// Chunked-overlap autoselection.
///
/// Each trial row is split into `n_chunks` equal segments. Per chunk, an
/// `n×n` pairwise dissimilarity matrix is built with `loss` and summed per
/// trial into one dissimilarity score. The acceptance policy then decides:
///
/// - [`ChunkPolicy::Intersection`]: a trial must pass the log-normal
///   `thresh_std` gate in **every** chunk;
/// - [`ChunkPolicy::MajorityVote`]: a trial must fall inside the
///   25–75-percentile score window in at least half of the chunks.
///
/// With `n_chunks = 1` this degenerates to a single global ranking — the
/// variant used for the blank-trial pass.
///
/// # Panics
///
/// Panics when `n_chunks` does not divide the frame count; dispatch through
/// [`resolve`] guarantees it does.
pub fn overlap_strategy(
    matrix: &Array2<f64>,
    n_chunks: usize,
    loss: OverlapLoss,
    policy: ChunkPolicy,
) -> Result<OverlapOutcome, StrategyError> {
    let (n_trials, n_frames) = matrix.dim();
    if n_trials == 0 || n_frames == 0 {
        return Err(StrategyError::EmptyMatrix);
    }
    assert!(
        n_chunks >= 1 && n_frames % n_chunks == 0,
        "{n_frames} frames do not split into {n_chunks} chunks"
    );
    let seg = n_frames / n_chunks;

    // Per chunk: summed pairwise dissimilarity of every trial to the rest.
    let mut chunk_scores: Vec<Vec<f64>> = Vec::with_capacity(n_chunks);
    for c in 0..n_chunks {
        let lo = c * seg;
        let hi = lo + seg;
        let mut scores = vec![0.0; n_trials];
        for i in 0..n_trials {
            let a = matrix.slice(s![i, lo..hi]);
            let mut sum = 0.0;
            for j in 0..n_trials {
                let b = matrix.slice(s![j, lo..hi]);
                sum += loss.between(a, b);
            }
            scores[i] = sum;
        }
        chunk_scores.push(scores);
    }

    let mut mask = vec![0u8; n_trials];
    let mut chunk_fits = Vec::new();
    match policy {
        ChunkPolicy::Intersection => {
            let mut passes = vec![0usize; n_trials];
            for scores in &chunk_scores {
                let outcome = lognorm_thresholding(scores, ThresholdKind::Median);
                for &i in &outcome.selected {
                    passes[i] += 1;
                }
                chunk_fits.push(outcome);
            }
            for (i, &p) in passes.iter().enumerate() {
                if p == n_chunks {
                    mask[i] = 1;
                }
            }
        }
        ChunkPolicy::MajorityVote => {
            let (bottom, up) = MAJORITY_GATE;
            let mut votes = vec![0usize; n_trials];
            for scores in &chunk_scores {
                let pb = percentile(scores, bottom);
                let pu = percentile(scores, up);
                for (i, &sc) in scores.iter().enumerate() {
                    if sc > pb && sc < pu {
                        votes[i] += 1;
                    }
                }
            }
            for (i, &v) in votes.iter().enumerate() {
                if 2 * v >= n_chunks {
                    mask[i] = 1;
                }
            }
        }
    }

    Ok(OverlapOutcome { mask, chunk_fits })
}

// ---------------------------------------------------------------------------
// ROI strategy
// ---------------------------------------------------------------------------

/// Per-frame tolerance voting.
///
/// Each row is linearly detrended (NaNs zeroed first); a frame of a trial
/// is flagged when its deviation from the cross-trial mean at that frame
/// exceeds `tolerance` times the standard error of that mean. A trial is
/// selected iff its flagged-frame count is strictly below half of the
/// post-stimulus frame count `(n_frames − zero_frames) / 2`.
pub fn roi_strategy(matrix: &Array2<f64>, tolerance: f64, zero_frames: usize) -> Vec<u8> {
    let (n_trials, n_frames) = matrix.dim();
    if n_trials == 0 {
        return Vec::new();
    }

    let mut detrended = Array2::zeros((n_trials, n_frames));
    for (i, row) in matrix.axis_iter(Axis(0)).enumerate() {
        let clean = row.mapv(|v| if v.is_finite() { v } else { 0.0 });
        detrended.row_mut(i).assign(&detrend_linear(clean.view()));
    }

    let mean = detrended.mean_axis(Axis(0)).expect("n_trials >= 1");
    let sem = detrended.std_axis(Axis(0), 0.0) / (n_trials as f64).sqrt();

    let budget = n_frames.saturating_sub(zero_frames) as f64 / 2.0;
    let mut mask = vec![0u8; n_trials];
    for i in 0..n_trials {
        let mut flagged = 0usize;
        for f in 0..n_frames {
            if (detrended[[i, f]] - mean[f]).abs() > tolerance * sem[f] {
                flagged += 1;
            }
        }
        if (flagged as f64) < budget {
            mask[i] = 1;
        }
    }
    mask
}

// ---------------------------------------------------------------------------
// Statistical strategy
// ---------------------------------------------------------------------------

/// Standard-deviation quartile window.
///
/// Computes every trial's standard deviation across frames and selects the
/// trials whose deviation lies strictly between the `bottom` and `up`
/// percentiles of the cross-trial distribution — rejecting both the
/// anomalously flat and the anomalously noisy.
pub fn statistical_strategy(matrix: &Array2<f64>, up: f64, bottom: f64) -> Vec<u8> {
    let (n_trials, _) = matrix.dim();
    if n_trials == 0 {
        return Vec::new();
    }

    let stds: Vec<f64> = matrix
        .axis_iter(Axis(0))
        .map(|row| row.std(0.0))
        .collect();
    let pb = percentile(&stds, bottom);
    let pu = percentile(&stds, up);

    stds.iter()
        .map(|&s| u8::from(s > pb && s < pu))
        .collect()
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Linear-interpolation percentile (the numpy default): `q` in `[0, 100]`.
pub fn percentile(values: &[f64], q: f64) -> f64 {
    assert!(!values.is_empty(), "percentile of an empty slice");
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = q.clamp(0.0, 100.0) / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        sorted[lo] + (rank - lo as f64) * (sorted[hi] - sorted[lo])
    }
}

/// Remove the least-squares straight line from a signal.
pub fn detrend_linear(signal: ArrayView1<'_, f64>) -> Array1<f64> {
    let n = signal.len();
    if n < 2 {
        return Array1::zeros(n);
    }
    let nf = n as f64;
    let (mut sx, mut sy, mut sxx, mut sxy) = (0.0, 0.0, 0.0, 0.0);
    for (i, &y) in signal.iter().enumerate() {
        let x = i as f64;
        sx += x;
        sy += y;
        sxx += x * x;
        sxy += x * y;
    }
    let denom = nf * sxx - sx * sx;
    let slope = if denom.abs() < 1e-300 {
        0.0
    } else {
        (nf * sxy - sx * sy) / denom
    };
    let intercept = (sy - slope * sx) / nf;
    Array1::from_iter(
        signal
            .iter()
            .enumerate()
            .map(|(i, &y)| y - (intercept + slope * i as f64)),
    )
}

/// Remove a least-squares second-order polynomial trend, with the abscissa
/// normalised to `[0, 1]`. NaNs are zeroed before fitting.
pub fn detrend_quadratic(signal: ArrayView1<'_, f64>) -> Array1<f64> {
    let n = signal.len();
    if n < 3 {
        return detrend_linear(signal);
    }
    let xs: Vec<f64> = (0..n).map(|i| i as f64 / (n - 1) as f64).collect();
    let ys: Vec<f64> = signal
        .iter()
        .map(|&v| if v.is_finite() { v } else { 0.0 })
        .collect();

    // Normal equations for y = c0 + c1·x + c2·x².
    let mut s = [0.0f64; 5]; // Σ x^k for k = 0..4
    let mut t = [0.0f64; 3]; // Σ y·x^k for k = 0..2
    for (&x, &y) in xs.iter().zip(ys.iter()) {
        let x2 = x * x;
        s[0] += 1.0;
        s[1] += x;
        s[2] += x2;
        s[3] += x2 * x;
        s[4] += x2 * x2;
        t[0] += y;
        t[1] += y * x;
        t[2] += y * x2;
    }
    let a = [[s[0], s[1], s[2]], [s[1], s[2], s[3]], [s[2], s[3], s[4]]];
    let c = match solve3(a, t) {
        Some(c) => c,
        None => return detrend_linear(signal),
    };

    Array1::from_iter(
        xs.iter()
            .zip(ys.iter())
            .map(|(&x, &y)| y - (c[0] + c[1] * x + c[2] * x * x)),
    )
}

/// Solve a 3×3 linear system by Gaussian elimination with partial pivoting.
fn solve3(mut a: [[f64; 3]; 3], mut b: [f64; 3]) -> Option<[f64; 3]> {
    for col in 0..3 {
        let pivot = (col..3).max_by(|&i, &j| {
            a[i][col]
                .abs()
                .partial_cmp(&a[j][col].abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        if a[pivot][col].abs() < 1e-300 {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in (col + 1)..3 {
            let f = a[row][col] / a[col][col];
            for k in col..3 {
                a[row][k] -= f * a[col][k];
            }
            b[row] -= f * b[col];
        }
    }
    let mut x = [0.0f64; 3];
    for row in (0..3).rev() {
        let mut acc = b[row];
        for k in (row + 1)..3 {
            acc -= a[row][k] * x[k];
        }
        x[row] = acc / a[row][row];
    }
    Some(x)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// Matrix of `n` near-identical sinusoidal rows plus `outliers` rows
    /// with a large post-onset step.
    fn trial_matrix(n: usize, outliers: usize, n_frames: usize) -> Array2<f64> {
        Array2::from_shape_fn((n + outliers, n_frames), |(i, t)| {
            let base = (t as f64 * 0.2).sin() * 0.01 + i as f64 * 1e-5;
            if i >= n && t >= n_frames / 2 {
                base + 5.0
            } else {
                base
            }
        })
    }

    #[test]
    fn resolve_falls_back_on_chunk_mismatch() {
        assert_eq!(resolve(Strategy::Mae, 70, 4), Strategy::Roi);
        assert_eq!(resolve(Strategy::Mse, 70, 5), Strategy::Mse);
        assert_eq!(resolve(Strategy::Mae, 70, 7), Strategy::Mae);
        assert_eq!(resolve(Strategy::Statistical, 70, 4), Strategy::Statistical);
    }

    #[test]
    fn overlap_excludes_the_planted_outlier() {
        let m = trial_matrix(9, 1, 70);
        let out = overlap_strategy(&m, 1, OverlapLoss::Mae, ChunkPolicy::Intersection).unwrap();
        assert_eq!(out.mask.len(), 10);
        assert_eq!(out.mask[9], 0, "outlier row survived");
        assert!(out.mask[..9].iter().all(|&v| v == 1), "an inlier was dropped");
    }

    #[test]
    fn overlap_mse_matches_mae_on_clean_outlier() {
        let m = trial_matrix(9, 1, 70);
        let mae = overlap_strategy(&m, 1, OverlapLoss::Mae, ChunkPolicy::Intersection).unwrap();
        let mse = overlap_strategy(&m, 1, OverlapLoss::Mse, ChunkPolicy::Intersection).unwrap();
        assert_eq!(mae.mask[9], 0);
        assert_eq!(mse.mask[9], 0);
    }

    #[test]
    fn overlap_chunked_intersection_requires_every_chunk() {
        let m = trial_matrix(9, 1, 70);
        let out = overlap_strategy(&m, 7, OverlapLoss::Mae, ChunkPolicy::Intersection).unwrap();
        // The outlier deviates only in late chunks, but intersection still
        // rejects it.
        assert_eq!(out.mask[9], 0);
        assert_eq!(out.chunk_fits.len(), 7);
    }

    #[test]
    fn overlap_majority_vote_produces_binary_mask() {
        let m = trial_matrix(10, 2, 70);
        let out = overlap_strategy(&m, 7, OverlapLoss::Mae, ChunkPolicy::MajorityVote).unwrap();
        assert_eq!(out.mask.len(), 12);
        assert!(out.mask.iter().all(|&v| v <= 1));
        assert!(out.chunk_fits.is_empty());
    }

    #[test]
    fn overlap_rejects_empty_matrix() {
        let m = Array2::<f64>::zeros((0, 70));
        assert!(matches!(
            overlap_strategy(&m, 1, OverlapLoss::Mae, ChunkPolicy::Intersection),
            Err(StrategyError::EmptyMatrix)
        ));
    }

    #[test]
    fn roi_strategy_is_idempotent() {
        let m = trial_matrix(8, 2, 70);
        let a = roi_strategy(&m, 20.0, 20);
        let b = roi_strategy(&m, 20.0, 20);
        assert_eq!(a, b);
    }

    #[test]
    fn roi_strategy_is_monotone_in_tolerance() {
        let m = trial_matrix(8, 2, 70);
        let mut previous = 0usize;
        for tol in [0.5, 1.0, 2.0, 5.0, 20.0, 100.0] {
            let selected: usize = roi_strategy(&m, tol, 20)
                .iter()
                .map(|&v| v as usize)
                .sum();
            assert!(
                selected >= previous,
                "selection count decreased at tolerance {tol}"
            );
            previous = selected;
        }
    }

    #[test]
    fn roi_strategy_drops_the_step_outlier() {
        // With 10 trials the standard error already absorbs most of a lone
        // outlier, so a tight tolerance is needed to see the rejection.
        let m = trial_matrix(9, 1, 70);
        let mask = roi_strategy(&m, 2.0, 20);
        assert_eq!(mask[9], 0);
        assert!(mask[..9].iter().all(|&v| v == 1));
    }

    #[test]
    fn roi_strategy_survives_nan_rows() {
        let mut m = trial_matrix(6, 0, 40);
        m[[2, 5]] = f64::NAN;
        let mask = roi_strategy(&m, 20.0, 10);
        assert_eq!(mask.len(), 6);
    }

    #[test]
    fn statistical_selection_respects_the_window_fraction() {
        // 20 rows with spread-out standard deviations: the 25–75 window can
        // keep at most half of them.
        let m = Array2::from_shape_fn((20, 50), |(i, t)| {
            (t as f64 * 0.3).sin() * (i as f64 + 1.0)
        });
        let mask = statistical_strategy(&m, 75.0, 25.0);
        let selected: usize = mask.iter().map(|&v| v as usize).sum();
        assert!(selected <= 10, "selected {selected} of 20 with a 50% window");
        assert!(selected > 0);
    }

    #[test]
    fn statistical_rejects_flat_and_noisy_extremes() {
        let m = Array2::from_shape_fn((10, 50), |(i, t)| {
            match i {
                0 => 0.0,                                  // dead flat
                9 => (t as f64 * 1.7).sin() * 100.0,       // wild
                _ => (t as f64 * 0.3).sin() * (1.0 + i as f64 * 0.01),
            }
        });
        let mask = statistical_strategy(&m, 75.0, 25.0);
        assert_eq!(mask[0], 0);
        assert_eq!(mask[9], 0);
    }

    #[test]
    fn percentile_matches_linear_interpolation() {
        let v = vec![1.0, 2.0, 3.0, 4.0];
        assert_abs_diff_eq!(percentile(&v, 0.0), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(percentile(&v, 100.0), 4.0, epsilon = 1e-12);
        assert_abs_diff_eq!(percentile(&v, 50.0), 2.5, epsilon = 1e-12);
        assert_abs_diff_eq!(percentile(&v, 25.0), 1.75, epsilon = 1e-12);
    }

    #[test]
    fn linear_detrend_removes_a_line() {
        let line = Array1::from_iter((0..50).map(|i| 3.0 + 0.5 * i as f64));
        let out = detrend_linear(line.view());
        for &v in out.iter() {
            assert_abs_diff_eq!(v, 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn quadratic_detrend_removes_a_parabola() {
        let n = 50;
        let parab = Array1::from_iter(
            (0..n).map(|i| {
                let x = i as f64 / (n - 1) as f64;
                1.0 - 2.0 * x + 4.0 * x * x
            }),
        );
        let out = detrend_quadratic(parab.view());
        for &v in out.iter() {
            assert_abs_diff_eq!(v, 0.0, epsilon = 1e-9);
        }
    }
}
