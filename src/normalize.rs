//! Trial normalization: ΔF/F0, ROI time courses, and z-score maps.
//!
//! The raw cube of a trial (`[frames, height, width]`) is normalised
//! against its own pre-stimulus baseline — the mean of the first
//! `zero_frames` frames, per pixel. Three mutually exclusive formulas are
//! selected by the deblanking mode; see [`deltaf_up_fzero`].

use ndarray::{s, Array1, Array2, Array3, Axis};

/// Absolute ΔF/F0 magnitude above which a pixel value is treated as
/// corrupted and clamped to zero.
pub const DEFAULT_OUTLIER_THRESHOLD: f64 = 1000.0;

/// Division guard for the z-score standard-error denominator.
const ZETA_EPS: f64 = 1e-8;

// ---------------------------------------------------------------------------
// ΔF/F0
// ---------------------------------------------------------------------------

/// Compute the ΔF/F0 cube of one trial.
///
/// `mean_zero` is the per-pixel mean of frames `[0, n_zero)`. The formula
/// is selected by `(deblank, blank_baseline)`:
///
/// 1. `deblank` and no baseline yet: `raw / mean_zero` — the ratio-form
///    pass used while the blank baseline itself is being computed;
/// 2. `deblank` with a baseline: `(raw / mean_zero) / baseline − 1`;
/// 3. no `deblank`: `raw / mean_zero − 1`.
///
/// Any resulting value with absolute magnitude above `outlier_thresh` is
/// clamped to exactly 0 — a corrupted pixel, not an error.
///
/// Pure function; the input cube is untouched.
///
/// # Panics
///
/// Panics if `n_zero` is outside `[1, frames)` or, in formula 2, if the
/// baseline's shape differs from the trial's.
pub fn deltaf_up_fzero(
    raw: &Array3<f64>,
    n_zero: usize,
    deblank: bool,
    blank_baseline: Option<&Array3<f64>>,
    outlier_thresh: f64,
) -> Array3<f64> {
    let n_frames = raw.shape()[0];
    assert!(
        n_zero >= 1 && n_zero < n_frames,
        "zero_frames must be in [1, {n_frames}), got {n_zero}"
    );

    let mean_zero: Array2<f64> = raw
        .slice(s![..n_zero, .., ..])
        .mean_axis(Axis(0))
        .expect("n_zero >= 1");

    let mut df = match (deblank, blank_baseline) {
        (true, None) => raw / &mean_zero,
        (true, Some(blank)) => {
            assert_eq!(
                blank.shape(),
                raw.shape(),
                "blank baseline shape must match the trial cube"
            );
            (raw / &mean_zero) / blank - 1.0
        }
        (false, _) => raw / &mean_zero - 1.0,
    };

    df.mapv_inplace(|v| if v.abs() > outlier_thresh { 0.0 } else { v });
    df
}

// ---------------------------------------------------------------------------
// ROI mask + time course
// ---------------------------------------------------------------------------

/// Fixed boolean region of interest over a frame.
///
/// Built once per session from the (binned) frame dimensions and reused
/// across all trials; it only changes when the spatial binning does.
#[derive(Debug, Clone)]
pub struct RoiMask {
    mask: Array2<bool>,
    in_roi: usize,
}

impl RoiMask {
    /// Circular region inscribed in the frame: pixels within
    /// `min(height, width) / 2` of the frame centre.
    pub fn circular(height: usize, width: usize) -> Self {
        let radius = (height.min(width) as f64) / 2.0;
        Self::from_radii(height, width, 0.0, radius)
    }

    /// Annular region between `inner_radius` and the inscribed radius.
    pub fn annular(height: usize, width: usize, inner_radius: f64) -> Self {
        let outer = (height.min(width) as f64) / 2.0;
        Self::from_radii(height, width, inner_radius, outer)
    }

    fn from_radii(height: usize, width: usize, inner: f64, outer: f64) -> Self {
        let cy = (height as f64 - 1.0) / 2.0;
        let cx = (width as f64 - 1.0) / 2.0;
        let mask = Array2::from_shape_fn((height, width), |(y, x)| {
            let d = ((y as f64 - cy).powi(2) + (x as f64 - cx).powi(2)).sqrt();
            d >= inner && d <= outer
        });
        let in_roi = mask.iter().filter(|&&m| m).count();
        RoiMask { mask, in_roi }
    }

    /// The underlying boolean mask (`true` = inside the ROI).
    pub fn mask(&self) -> &Array2<bool> {
        &self.mask
    }

    /// Number of pixels inside the ROI.
    pub fn len(&self) -> usize {
        self.in_roi
    }

    /// `true` when no pixel falls inside the ROI.
    pub fn is_empty(&self) -> bool {
        self.in_roi == 0
    }
}

/// Collapse a ΔF/F0 cube to one scalar per frame: the mean over the
/// in-mask pixels of each frame.
///
/// # Panics
///
/// Panics if the mask geometry differs from the cube's frames or the mask
/// is empty.
pub fn time_course_signal(cube: &Array3<f64>, roi: &RoiMask) -> Array1<f64> {
    let (n_frames, height, width) = cube.dim();
    assert_eq!(
        roi.mask().dim(),
        (height, width),
        "ROI mask geometry must match the frames"
    );
    assert!(!roi.is_empty(), "ROI mask selects no pixels");

    let mut out = Array1::zeros(n_frames);
    for (t, frame) in cube.axis_iter(Axis(0)).enumerate() {
        let mut sum = 0.0;
        for ((y, x), &inside) in roi.mask().indexed_iter() {
            if inside {
                sum += frame[[y, x]];
            }
        }
        out[t] = sum / roi.len() as f64;
    }
    out
}

// ---------------------------------------------------------------------------
// z-score
// ---------------------------------------------------------------------------

/// Per-pixel z-score of a condition cube against a baseline.
///
/// With `blank = None` the baseline is the condition's own pre-stimulus
/// window (`[0, zero_frames)`); otherwise it is the supplied blank cube.
/// The standard error divides the frame-axis standard deviation by the
/// square root of the *full* frame count of the cube that provided it.
/// Division is epsilon-guarded. Diagnostic output only — autoselection
/// never consumes it.
pub fn zeta_score(
    cond: &Array3<f64>,
    blank: Option<&Array3<f64>>,
    zero_frames: usize,
) -> Array3<f64> {
    let (mean, stderr) = match blank {
        None => {
            let window = cond.slice(s![..zero_frames, .., ..]);
            let mean = window.mean_axis(Axis(0)).expect("zero_frames >= 1");
            let std = window.std_axis(Axis(0), 0.0);
            let stderr = std / (cond.shape()[0] as f64).sqrt();
            (mean, stderr)
        }
        Some(blank) => {
            let mean = blank.mean_axis(Axis(0)).expect("blank cube has frames");
            let std = blank.std_axis(Axis(0), 0.0);
            let stderr = std / (blank.shape()[0] as f64).sqrt();
            (mean, stderr)
        }
    };
    (cond - &mean) / (stderr + ZETA_EPS)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
