//! Error types for the VSDI autoselection pipeline.
//!
//! This module is the single source of truth for all error types in the
//! crate. Every module that produces an error imports its error type from
//! here rather than defining it inline, keeping the error hierarchy
//! centralised and consistent.
//!
//! ## Hierarchy
//!
//! ```text
//! SessionError (top-level)
//! ├── ConfigError    (configuration validation / file loading)
//! ├── CatalogError   (trial discovery, filename grammar, labels)
//! ├── DecodeError    (trial file decoding, raised by TrialDecoder impls)
//! └── StrategyError  (detection strategy preconditions)
//! ```

use std::path::PathBuf;
use thiserror::Error;

// ---------------------------------------------------------------------------
// SessionResult
// ---------------------------------------------------------------------------

/// Convenient `Result` alias used by orchestration-level functions.
pub type SessionResult<T> = Result<T, SessionError>;

// ---------------------------------------------------------------------------
// SessionError — top-level aggregator
// ---------------------------------------------------------------------------

/// Top-level error type for the VSDI autoselection pipeline.
///
/// Orchestration-level functions ([`crate::session::Session`] methods)
/// return `SessionResult<T>`. Lower-level functions in [`crate::config`],
/// [`crate::catalog`] and [`crate::strategy`] return their own
/// module-specific error types which are automatically coerced into
/// `SessionError` via [`From`].
#[derive(Debug, Error)]
pub enum SessionError {
    /// A configuration validation or loading error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A trial catalog construction error.
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// A trial decode failure. Decode failures abort the whole batch:
    /// a partially-read trial must never be folded into the session arrays.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// A detection strategy could not run on the loaded data.
    #[error("Strategy error: {0}")]
    Strategy(#[from] StrategyError),

    /// An operation was requested in a session state that cannot serve it.
    #[error("Invalid session state: {reason}")]
    InvalidState {
        /// Why the operation cannot run in the current state.
        reason: String,
    },

    /// The `.npy` export of the time-course matrix failed.
    #[error("Cannot write time courses to `{path}`: {message}")]
    Export {
        /// Destination path.
        path: PathBuf,
        /// Underlying error description.
        message: String,
    },
}

impl SessionError {
    /// Construct a [`SessionError::InvalidState`].
    pub fn invalid_state<S: Into<String>>(reason: S) -> Self {
        SessionError::InvalidState { reason: reason.into() }
    }

    /// Construct a [`SessionError::Export`].
    pub fn export<S: Into<String>>(path: impl Into<PathBuf>, message: S) -> Self {
        SessionError::Export { path: path.into(), message: message.into() }
    }
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Errors produced when loading or validating a [`SessionConfig`].
///
/// Configuration errors are always fatal and reported before any trial is
/// loaded.
///
/// [`SessionConfig`]: crate::config::SessionConfig
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field has an invalid value.
    #[error("Invalid value for `{field}`: {reason}")]
    InvalidValue {
        /// Name of the field.
        field: &'static str,
        /// Human-readable reason.
        reason: String,
    },

    /// The strategy name is not one of the recognised spellings.
    #[error(
        "Unknown strategy `{name}`: choose between mse/mae, roi/roi_signals/ROI, \
         statistic/statistical/quartiles"
    )]
    UnknownStrategy {
        /// The rejected name.
        name: String,
    },

    /// A configuration file could not be read from disk.
    #[error("Cannot read config file `{path}`: {source}")]
    FileRead {
        /// Path that was being read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A configuration file contains malformed JSON.
    #[error("Cannot parse config file `{path}`: {source}")]
    ParseError {
        /// Path that was being parsed.
        path: PathBuf,
        /// Underlying JSON parse error.
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    /// Construct a [`ConfigError::InvalidValue`].
    pub fn invalid_value<S: Into<String>>(field: &'static str, reason: S) -> Self {
        ConfigError::InvalidValue { field, reason: reason.into() }
    }
}

// ---------------------------------------------------------------------------
// CatalogError
// ---------------------------------------------------------------------------

/// Errors produced while building the trial catalog.
///
/// Filename grammar violations fail fast here, at catalog-build time, so
/// malformed names never reach the numeric pipeline.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The session's raw-data directory does not exist.
    #[error("Raw-data directory not found: `{path}`")]
    RawDataNotFound {
        /// The missing directory.
        path: PathBuf,
    },

    /// A trial filename does not match the `vsd_C<id>` / timestamp grammar.
    #[error("Malformed trial filename `{name}`: {reason}")]
    MalformedName {
        /// The offending filename.
        name: String,
        /// What part of the grammar failed.
        reason: String,
    },

    /// The session contains no trial files for the requested conditions.
    #[error("No trials found in `{path}` for condition ids {requested:?}")]
    NoTrials {
        /// Raw-data directory that was scanned.
        path: PathBuf,
        /// Condition ids that were requested.
        requested: Vec<u32>,
    },

    /// A low-level I/O error while scanning the session directory.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CatalogError {
    /// Construct a [`CatalogError::MalformedName`].
    pub fn malformed<S: Into<String>, R: Into<String>>(name: S, reason: R) -> Self {
        CatalogError::MalformedName { name: name.into(), reason: reason.into() }
    }
}

// ---------------------------------------------------------------------------
// DecodeError
// ---------------------------------------------------------------------------

/// Errors raised by [`TrialDecoder`] implementations.
///
/// [`TrialDecoder`]: crate::decoder::TrialDecoder
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The trial file could not be read.
    #[error("Cannot read trial file `{path}`: {source}")]
    Io {
        /// Path being read when the error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file was read but its contents are not a valid trial recording.
    #[error("Invalid trial data in `{path}`: {message}")]
    InvalidData {
        /// Path of the malformed file.
        path: PathBuf,
        /// Description of the problem.
        message: String,
    },

    /// The trial's dimensions disagree with the batch's shared header.
    #[error(
        "Header mismatch in `{path}`: trial is {actual:?}, batch expects {expected:?}"
    )]
    HeaderMismatch {
        /// Path of the offending trial.
        path: PathBuf,
        /// Shape declared by the shared header `[frames, height, width]`.
        expected: [usize; 3],
        /// Shape found in this trial.
        actual: [usize; 3],
    },
}

impl DecodeError {
    /// Construct a [`DecodeError::InvalidData`].
    pub fn invalid_data<S: Into<String>>(path: impl Into<PathBuf>, msg: S) -> Self {
        DecodeError::InvalidData { path: path.into(), message: msg.into() }
    }
}

// ---------------------------------------------------------------------------
// StrategyError
// ---------------------------------------------------------------------------

/// Errors produced by the detection strategies.
///
/// Note that a chunk/frame-count mismatch is *not* an error: dispatch
/// degrades to the ROI strategy instead (see [`crate::strategy::resolve`]).
#[derive(Debug, Error)]
pub enum StrategyError {
    /// The time-course matrix is empty.
    #[error("Cannot autoselect over an empty trial matrix")]
    EmptyMatrix,

    /// Trials have inconsistent frame counts.
    #[error("Trial rows have inconsistent lengths: {first} vs {other}")]
    RaggedMatrix {
        /// Length of the first row.
        first: usize,
        /// The first disagreeing length.
        other: usize,
    },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_render_with_context() {
        let e = CatalogError::malformed("foo.BLK", "missing vsd_C token");
        assert!(e.to_string().contains("foo.BLK"));
        assert!(e.to_string().contains("vsd_C"));

        let e = ConfigError::invalid_value("spatial_bin", "must be > 0");
        assert!(e.to_string().contains("spatial_bin"));
    }

    #[test]
    fn lower_level_errors_coerce_into_session_error() {
        fn run() -> SessionResult<()> {
            Err(ConfigError::invalid_value("zero_frames", "must be > 0"))?;
            Ok(())
        }
        assert!(matches!(run(), Err(SessionError::Config(_))));
    }
}
