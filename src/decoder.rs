//! Trial decoding seam.
//!
//! Parsing the raw binary trial format and binning its frames is the job of
//! an external collaborator; the pipeline only depends on the
//! [`TrialDecoder`] trait defined here. One concrete implementation ships
//! with the crate: [`SyntheticDecoder`], a fully-deterministic analytic
//! generator used by the test suite and the CLI dry-run mode.
//! **It never uses random data** — every value is computed from the trial
//! filename alone, making runs perfectly reproducible across platforms.

use ndarray::Array3;
use std::collections::HashMap;
use std::path::Path;

use crate::catalog::parse_trial_name;
use crate::error::DecodeError;

// ---------------------------------------------------------------------------
// TrialHeader / DecodedTrial
// ---------------------------------------------------------------------------

/// Shape metadata shared by every trial of a batch.
///
/// The first trial of a batch establishes the header; subsequent decodes of
/// the same batch receive it so they can skip re-deriving the geometry and
/// must match it exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrialHeader {
    /// Number of frames per stimulus presentation (after temporal binning).
    pub n_frames: usize,
    /// Frame height in pixels (after spatial binning).
    pub height: usize,
    /// Frame width in pixels (after spatial binning).
    pub width: usize,
}

impl TrialHeader {
    /// Shape as `[frames, height, width]`.
    pub fn shape(&self) -> [usize; 3] {
        [self.n_frames, self.height, self.width]
    }
}

/// One decoded trial: the binned raw cube plus its metadata.
#[derive(Debug, Clone)]
pub struct DecodedTrial {
    /// Raw binned signal, shape `[frames, height, width]`.
    pub raw: Array3<f64>,
    /// Geometry of this trial.
    pub header: TrialHeader,
    /// Condition id parsed from the trial filename.
    pub condition_id: u32,
}

// ---------------------------------------------------------------------------
// TrialDecoder trait
// ---------------------------------------------------------------------------

/// Common interface for trial-file decoders.
///
/// Implementations must be `Send + Sync` so a decoder can be shared across
/// threads without additional synchronisation.
pub trait TrialDecoder: Send + Sync {
    /// Decode the trial at `path`, applying the given binning factors.
    ///
    /// `zero_frames` is forwarded so implementations that precompute
    /// baseline statistics during decoding can do so; `shared` carries the
    /// batch header established by the batch's first trial, or `None` for
    /// the first trial itself.
    ///
    /// # Errors
    ///
    /// Any error aborts the whole batch — a partially-decoded trial must
    /// never reach the session arrays.
    fn decode(
        &self,
        path: &Path,
        spatial_bin: usize,
        temporal_bin: usize,
        zero_frames: usize,
        shared: Option<&TrialHeader>,
    ) -> Result<DecodedTrial, DecodeError>;

    /// Human-readable name for logging and progress display.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// SyntheticDecoder
// ---------------------------------------------------------------------------

/// Shape perturbations that can be injected into individual synthetic
/// trials, keyed by filename. Used to plant known outliers in tests.
#[derive(Debug, Clone, Copy)]
pub enum TrialAnomaly {
    /// Multiply every frame from `frame` onwards by `factor`, producing a
    /// step in the normalised time course. A gain applied to *all* frames
    /// would cancel against the trial's own pre-stimulus mean.
    ScaleFrom {
        /// First affected frame index.
        frame: usize,
        /// Multiplicative factor.
        factor: f64,
    },
}

/// Fully-deterministic trial decoder backed by an analytic signal model.
///
/// Every pixel value is computed from the trial filename (hashed with
/// FNV-1a), the frame index, and the pixel index. The base model is a
/// resting light level with a small sinusoidal modulation:
///
/// ```text
/// v(t, y, x) = 1000 + 50 · sin(2π · (seed/1000 + 0.1·t + 0.01·(y·W + x)))
/// ```
///
/// Spatial and temporal binning divide the configured native geometry, as a
/// real decoder would.
#[derive(Debug, Clone)]
pub struct SyntheticDecoder {
    native_frames: usize,
    native_height: usize,
    native_width: usize,
    anomalies: HashMap<String, TrialAnomaly>,
}

impl SyntheticDecoder {
    /// Create a decoder producing `native_frames × native_height ×
    /// native_width` cubes before binning.
    pub fn new(native_frames: usize, native_height: usize, native_width: usize) -> Self {
        SyntheticDecoder {
            native_frames,
            native_height,
            native_width,
            anomalies: HashMap::new(),
        }
    }

    /// Inject an anomaly into the trial with the given filename.
    pub fn with_anomaly(mut self, file_name: &str, anomaly: TrialAnomaly) -> Self {
        self.anomalies.insert(file_name.to_string(), anomaly);
        self
    }

    /// Deterministic per-trial seed in `[0, 1)` derived from the filename.
    fn seed_fraction(file_name: &str) -> f64 {
        (fnv1a(file_name.as_bytes()) % 1000) as f64 / 1000.0
    }
}

impl TrialDecoder for SyntheticDecoder {
    fn decode(
        &self,
        path: &Path,
        spatial_bin: usize,
        temporal_bin: usize,
        _zero_frames: usize,
        shared: Option<&TrialHeader>,
    ) -> Result<DecodedTrial, DecodeError> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| DecodeError::invalid_data(path, "path has no filename"))?;
        let trial = parse_trial_name(file_name)
            .map_err(|e| DecodeError::invalid_data(path, e.to_string()))?;

        let n_frames = self.native_frames / temporal_bin;
        let height = self.native_height / spatial_bin;
        let width = self.native_width / spatial_bin;
        if n_frames == 0 || height == 0 || width == 0 {
            return Err(DecodeError::invalid_data(
                path,
                format!("binning {spatial_bin}x/{temporal_bin}x collapses the geometry"),
            ));
        }
        let header = TrialHeader { n_frames, height, width };
        if let Some(expected) = shared {
            if *expected != header {
                return Err(DecodeError::HeaderMismatch {
                    path: path.to_path_buf(),
                    expected: expected.shape(),
                    actual: header.shape(),
                });
            }
        }

        let seed = Self::seed_fraction(file_name);
        let mut raw = Array3::from_shape_fn((n_frames, height, width), |(t, y, x)| {
            let phase = 2.0
                * std::f64::consts::PI
                * (seed + 0.1 * t as f64 + 0.01 * (y * width + x) as f64);
            1000.0 + 50.0 * phase.sin()
        });

        if let Some(&TrialAnomaly::ScaleFrom { frame, factor }) = self.anomalies.get(file_name) {
            for t in frame.min(n_frames)..n_frames {
                raw.index_axis_mut(ndarray::Axis(0), t).mapv_inplace(|v| v * factor);
            }
        }

        Ok(DecodedTrial {
            raw,
            header,
            condition_id: trial.condition_id,
        })
    }

    fn name(&self) -> &str {
        "SyntheticDecoder"
    }
}

/// 64-bit FNV-1a hash. Used instead of `std`'s default hasher because that
/// one is randomly keyed per process and would break reproducibility.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
