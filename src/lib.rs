//! # VSDI session signal extraction & trial autoselection
//!
//! This crate processes voltage-sensitive-dye imaging (VSDI) recording
//! sessions: a directory of binary trial files grouped by experimental
//! condition. Per trial it extracts a region-of-interest time course and a
//! normalised ΔF/F0 stack from the raw binned frames, and automatically
//! decides whether the trial is a usable sample or a noisy outlier to be
//! excluded from downstream averaging.
//!
//! ## Architecture
//!
//! ```text
//! SessionConfig ──► Session ──► selection mask / ΔF stacks / time courses
//!       │              │
//!       │         TrialCatalog (filename grammar, labels, blank id)
//!       │              │
//!       │         TrialDecoder (external BLK decoder | SyntheticDecoder)
//!       │              │
//!       │         normalize::deltaf_up_fzero ─► strategy::{overlap,roi,statistical}
//!       │                                            │
//!       └──► strategy::resolve                  lognorm fitting
//! ```
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use vsdi_autoselect::config::{SessionConfig, Strategy};
//! use vsdi_autoselect::decoder::SyntheticDecoder;
//! use vsdi_autoselect::session::Session;
//!
//! let mut config = SessionConfig::default();
//! config.session_path = "/data/sessions/exp07".into();
//! config.deblank = true;
//! config.strategy = Strategy::Mae;
//! config.validate().expect("config is valid");
//!
//! let mut session = Session::new(config).expect("catalog builds");
//! let decoder = SyntheticDecoder::new(70, 180, 180);
//! session.load(&decoder).expect("trials load");
//! let mask = session.autoselect().expect("strategy runs");
//! println!("{} trials selected", mask.iter().filter(|&&m| m == 1).count());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod catalog;
pub mod config;
pub mod decoder;
pub mod error;
pub mod lognorm;
pub mod normalize;
pub mod session;
pub mod strategy;

// Convenient re-exports at the crate root.
pub use catalog::{TrialCatalog, TrialFile};
pub use config::{ChunkPolicy, SessionConfig, Strategy};
pub use decoder::{DecodedTrial, SyntheticDecoder, TrialDecoder, TrialHeader};
pub use error::{SessionError, SessionResult};
pub use normalize::{deltaf_up_fzero, time_course_signal, zeta_score, RoiMask};
pub use session::{BlankBaseline, Session, SessionState};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
