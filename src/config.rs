//! Session configuration for the VSDI autoselection pipeline.
//!
//! [`SessionConfig`] is the single source of truth for all binning factors,
//! autoselection parameters, and pipeline switches used throughout a run.
//! It is serializable via [`serde`] so it can be stored to / restored from
//! JSON files alongside the session's derivatives.
//!
//! # Example
//!
//! ```rust
//! use vsdi_autoselect::config::{SessionConfig, Strategy};
//!
//! let cfg = SessionConfig::default();
//! cfg.validate().expect("default config is valid");
//!
//! assert_eq!(cfg.spatial_bin, 3);
//! assert_eq!(cfg.zero_frames, 20);
//! assert_eq!(cfg.strategy, Strategy::Mae);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

/// The trial autoselection strategy.
///
/// Dispatch is resolved once at configuration time; the historical
/// free-string spellings are accepted by the [`FromStr`] implementation and
/// collapse into this closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Chunked-overlap strategy with mean absolute difference dissimilarity.
    Mae,
    /// Chunked-overlap strategy with mean squared difference dissimilarity.
    Mse,
    /// Per-frame tolerance voting on the detrended ROI time courses.
    Roi,
    /// Standard-deviation quartile window across trials.
    Statistical,
}

impl Strategy {
    /// `true` for the chunk-based overlap variants (`mae` / `mse`).
    pub fn is_chunked(&self) -> bool {
        matches!(self, Strategy::Mae | Strategy::Mse)
    }
}

impl FromStr for Strategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mae" => Ok(Strategy::Mae),
            "mse" => Ok(Strategy::Mse),
            "roi" | "roi_signals" | "ROI" => Ok(Strategy::Roi),
            "statistic" | "statistical" | "quartiles" => Ok(Strategy::Statistical),
            other => Err(ConfigError::UnknownStrategy { name: other.to_string() }),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::Mae => "mae",
            Strategy::Mse => "mse",
            Strategy::Roi => "roi",
            Strategy::Statistical => "statistical",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// ChunkPolicy
// ---------------------------------------------------------------------------

/// Acceptance policy across chunks for the overlap strategy.
///
/// Two policies coexisted historically; both are legitimate and the choice
/// is a configuration decision, not a silent pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkPolicy {
    /// A trial is accepted only if it passes the log-normal gate in *every*
    /// chunk. The stricter, later revision; the default.
    #[default]
    Intersection,
    /// A trial is accepted if it falls inside the `[bottom, up]` percentile
    /// window of the dissimilarity scores in at least half of the chunks.
    MajorityVote,
}

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

/// Complete configuration for one VSDI session run.
///
/// All fields have documented defaults that match the historical CLI
/// defaults. Use [`SessionConfig::default()`] as a starting point, then
/// override individual fields as needed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    // -----------------------------------------------------------------------
    // Session location
    // -----------------------------------------------------------------------
    /// Path of the session directory. Trials live under
    /// `<session_path>/rawdata/`, condition labels under
    /// `<session_path>/metadata/labelConds.txt`.
    pub session_path: PathBuf,

    // -----------------------------------------------------------------------
    // Binning / framing
    // -----------------------------------------------------------------------
    /// Spatial binning factor applied by the decoder. Default: **3**.
    pub spatial_bin: usize,

    /// Temporal binning factor applied by the decoder. Default: **1**.
    pub temporal_bin: usize,

    /// Number of pre-stimulus frames used as the F0 baseline. Default: **20**.
    pub zero_frames: usize,

    // -----------------------------------------------------------------------
    // Autoselection
    // -----------------------------------------------------------------------
    /// Outlier tolerance for the ROI strategy, in units of the
    /// standard error of the cross-trial mean. Default: **20.0**.
    pub tolerance: f64,

    /// Number of temporal chunks for the overlap strategy. Default: **1**.
    pub chunks: usize,

    /// The configured autoselection strategy. Default: [`Strategy::Mae`].
    pub strategy: Strategy,

    /// Cross-chunk acceptance policy for the overlap strategy.
    /// Default: [`ChunkPolicy::Intersection`].
    pub chunk_policy: ChunkPolicy,

    // -----------------------------------------------------------------------
    // Switches
    // -----------------------------------------------------------------------
    /// Motion-correction switch. Currently inert; kept for configuration
    /// compatibility. Default: **false**.
    pub mov_switch: bool,

    /// Normalize every non-blank trial against the averaged blank-condition
    /// baseline. Default: **false**.
    pub deblank: bool,

    /// Store raw binned cubes and skip ΔF/F0 entirely. Default: **false**.
    pub raw_mode: bool,

    // -----------------------------------------------------------------------
    // Condition filter
    // -----------------------------------------------------------------------
    /// Condition ids to load; `None` means all conditions found in the
    /// session. The blank condition is always included when `deblank` is on.
    pub condition_ids: Option<Vec<u32>>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            session_path: PathBuf::new(),
            spatial_bin: 3,
            temporal_bin: 1,
            zero_frames: 20,
            tolerance: 20.0,
            chunks: 1,
            strategy: Strategy::Mae,
            chunk_policy: ChunkPolicy::Intersection,
            mov_switch: false,
            deblank: false,
            raw_mode: false,
            condition_ids: None,
        }
    }
}

impl SessionConfig {
    /// Load a [`SessionConfig`] from a JSON file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::FileRead`] if the file cannot be opened,
    /// [`ConfigError::ParseError`] if the JSON is malformed, and any
    /// validation error for incoherent field values.
    pub fn from_json(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: SessionConfig =
            serde_json::from_str(&contents).map_err(|source| ConfigError::ParseError {
                path: path.to_path_buf(),
                source,
            })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize this configuration to pretty-printed JSON and write it to
    /// `path`, creating parent directories if necessary.
    pub fn to_json(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::FileRead {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::invalid_value("(serialization)", e.to_string()))?;
        std::fs::write(path, json).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    /// Validate all fields and return an error describing the first problem
    /// found, or `Ok(())` if the configuration is coherent.
    ///
    /// # Validated invariants
    ///
    /// - `spatial_bin`, `temporal_bin`, `zero_frames` must be strictly
    ///   positive.
    /// - `tolerance` must be finite and non-negative.
    /// - `chunks` must be at least 1.
    /// - Explicit condition ids must be 1-based (no zero id).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.spatial_bin == 0 {
            return Err(ConfigError::invalid_value("spatial_bin", "must be > 0"));
        }
        if self.temporal_bin == 0 {
            return Err(ConfigError::invalid_value("temporal_bin", "must be > 0"));
        }
        if self.zero_frames == 0 {
            return Err(ConfigError::invalid_value("zero_frames", "must be > 0"));
        }
        if !self.tolerance.is_finite() || self.tolerance < 0.0 {
            return Err(ConfigError::invalid_value(
                "tolerance",
                "must be finite and >= 0",
            ));
        }
        if self.chunks == 0 {
            return Err(ConfigError::invalid_value("chunks", "must be >= 1"));
        }
        if let Some(ids) = &self.condition_ids {
            if ids.iter().any(|&id| id == 0) {
                return Err(ConfigError::invalid_value(
                    "condition_ids",
                    "condition ids are 1-based; 0 is not a valid id",
                ));
            }
        }
        Ok(())
    }

    /// Derived folder name encoding the active configuration, so that
    /// artifacts produced under different settings never collide.
    ///
    /// The strategy-dependent segment carries the chunk count for the
    /// overlap variants and the tolerance for the ROI strategy.
    pub fn derived_folder_name(&self) -> String {
        let strat_depend = match self.strategy {
            Strategy::Mae | Strategy::Mse => {
                format!("_strategy{}_n_chunk{}", self.strategy, self.chunks)
            }
            Strategy::Roi => format!("_strategy{}_tol{}", self.strategy, self.tolerance),
            Strategy::Statistical => format!("_strategy{}", self.strategy),
        };
        format!(
            "spcbin{}_timebin{}_zerofrms{}{}_mov{}_deblank{}",
            self.spatial_bin,
            self.temporal_bin,
            self.zero_frames,
            strat_depend,
            self.mov_switch,
            self.deblank,
        )
    }

    /// Directory where this run's artifacts belong:
    /// `<session_path>/derivatives/<derived_folder_name>`.
    pub fn derivatives_dir(&self) -> PathBuf {
        self.session_path
            .join("derivatives")
            .join(self.derived_folder_name())
    }

    /// Path of the session's raw-data directory.
    pub fn rawdata_dir(&self) -> PathBuf {
        self.session_path.join("rawdata")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_is_valid() {
        let cfg = SessionConfig::default();
        cfg.validate().expect("default config should be valid");
    }

    #[test]
    fn json_round_trip() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("config.json");

        let mut original = SessionConfig::default();
        original.strategy = Strategy::Roi;
        original.tolerance = 12.5;
        original.condition_ids = Some(vec![1, 2]);
        original.to_json(&path).expect("serialization should succeed");

        let loaded = SessionConfig::from_json(&path).expect("deserialization should succeed");
        assert_eq!(loaded.strategy, Strategy::Roi);
        assert_eq!(loaded.condition_ids, Some(vec![1, 2]));
        assert!((loaded.tolerance - 12.5).abs() < 1e-12);
    }

    #[test]
    fn zero_bin_values_are_invalid() {
        let mut cfg = SessionConfig::default();
        cfg.spatial_bin = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = SessionConfig::default();
        cfg.temporal_bin = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = SessionConfig::default();
        cfg.zero_frames = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_condition_id_is_invalid() {
        let mut cfg = SessionConfig::default();
        cfg.condition_ids = Some(vec![0, 1]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn strategy_aliases_parse() {
        assert_eq!("mae".parse::<Strategy>().unwrap(), Strategy::Mae);
        assert_eq!("mse".parse::<Strategy>().unwrap(), Strategy::Mse);
        assert_eq!("roi".parse::<Strategy>().unwrap(), Strategy::Roi);
        assert_eq!("roi_signals".parse::<Strategy>().unwrap(), Strategy::Roi);
        assert_eq!("ROI".parse::<Strategy>().unwrap(), Strategy::Roi);
        assert_eq!("statistic".parse::<Strategy>().unwrap(), Strategy::Statistical);
        assert_eq!("statistical".parse::<Strategy>().unwrap(), Strategy::Statistical);
        assert_eq!("quartiles".parse::<Strategy>().unwrap(), Strategy::Statistical);
    }

    #[test]
    fn unknown_strategy_is_fatal() {
        let err = "kmeans".parse::<Strategy>().unwrap_err();
        assert!(err.to_string().contains("kmeans"));
    }

    #[test]
    fn folder_name_encodes_strategy_parameters() {
        let mut cfg = SessionConfig::default();
        cfg.strategy = Strategy::Mae;
        cfg.chunks = 5;
        assert_eq!(
            cfg.derived_folder_name(),
            "spcbin3_timebin1_zerofrms20_strategymae_n_chunk5_movfalse_deblankfalse"
        );

        cfg.strategy = Strategy::Roi;
        cfg.tolerance = 20.0;
        assert!(cfg.derived_folder_name().contains("_strategyroi_tol20"));
    }
}
