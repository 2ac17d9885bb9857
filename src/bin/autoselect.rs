//! `autoselect` binary — entry point for the VSDI autoselection pipeline.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin autoselect -- --path /data/sessions/exp07
//! cargo run --bin autoselect -- --path /data/sessions/exp07 --strategy roi --tol 12
//! ```

use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

use vsdi_autoselect::config::{SessionConfig, Strategy};
use vsdi_autoselect::decoder::SyntheticDecoder;
use vsdi_autoselect::session::Session;

/// Command-line arguments for the autoselection binary.
#[derive(Parser, Debug)]
#[command(
    name = "autoselect",
    version,
    about = "VSDI trial autoselection pipeline",
    long_about = None
)]
struct Args {
    /// The session path (trials under `<path>/rawdata/`).
    #[arg(long = "path", value_name = "DIR")]
    path_session: PathBuf,

    /// The spatial bin value.
    #[arg(long = "s-bin", default_value_t = 3)]
    spatial_bin: usize,

    /// The time bin value.
    #[arg(long = "t-bin", default_value_t = 1)]
    temporal_bin: usize,

    /// The first frames considered zero (pre-stimulus).
    #[arg(long = "zero", default_value_t = 20)]
    zero_frames: usize,

    /// Tolerance value for the ROI autoselection strategy.
    #[arg(long = "tol", default_value_t = 20.0)]
    tolerance: f64,

    /// Motion-correction switch (currently inert).
    #[arg(long = "mov", default_value_t = false)]
    mov_switch: bool,

    /// Normalize against the averaged blank condition.
    #[arg(long = "dblnk", default_value_t = false)]
    deblank: bool,

    /// Store raw binned cubes and skip ΔF/F0 entirely.
    #[arg(long = "raw", default_value_t = false)]
    raw_mode: bool,

    /// Conditions to analyze; repeat for several ids. All conditions when
    /// omitted.
    #[arg(long = "cid", value_name = "ID")]
    conditions_id: Vec<u32>,

    /// Number of chunks for the overlap autoselection strategies.
    #[arg(long = "chunks", default_value_t = 1)]
    chunks: usize,

    /// Strategy for the autoselection: mse/mae, roi, statistical.
    #[arg(long = "strategy", default_value = "mae")]
    strategy: String,

    /// Write the stacked time courses next to the session derivatives.
    #[arg(long = "save-tc", default_value_t = true)]
    save_time_courses: bool,

    /// Frames per trial of the built-in synthetic decoder.
    ///
    /// The binary ships with the deterministic synthetic decoder only; a
    /// real BLK decoder plugs in through the library's `TrialDecoder`
    /// trait.
    #[arg(long = "synthetic-frames", default_value_t = 70)]
    synthetic_frames: usize,

    /// Native frame height of the synthetic decoder.
    #[arg(long = "synthetic-height", default_value_t = 180)]
    synthetic_height: usize,

    /// Native frame width of the synthetic decoder.
    #[arg(long = "synthetic-width", default_value_t = 180)]
    synthetic_width: usize,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() {
    let args = Args::parse();

    let log_level_filter = args
        .log_level
        .parse::<tracing_subscriber::filter::LevelFilter>()
        .unwrap_or(tracing_subscriber::filter::LevelFilter::INFO);
    tracing_subscriber::fmt()
        .with_max_level(log_level_filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    info!("VSDI autoselection pipeline v{}", vsdi_autoselect::VERSION);

    let strategy = match args.strategy.parse::<Strategy>() {
        Ok(s) => s,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let config = SessionConfig {
        session_path: args.path_session,
        spatial_bin: args.spatial_bin,
        temporal_bin: args.temporal_bin,
        zero_frames: args.zero_frames,
        tolerance: args.tolerance,
        chunks: args.chunks,
        strategy,
        mov_switch: args.mov_switch,
        deblank: args.deblank,
        raw_mode: args.raw_mode,
        condition_ids: if args.conditions_id.is_empty() {
            None
        } else {
            Some(args.conditions_id.clone())
        },
        ..SessionConfig::default()
    };

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {e}");
        std::process::exit(1);
    }

    info!("Configuration validated successfully");
    info!("  session     : {}", config.session_path.display());
    info!("  spatial bin : {}", config.spatial_bin);
    info!("  temporal bin: {}", config.temporal_bin);
    info!("  zero frames : {}", config.zero_frames);
    info!("  strategy    : {}", config.strategy);
    info!("  chunks      : {}", config.chunks);
    info!("  deblank     : {}", config.deblank);

    let mut session = match Session::new(config) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to open session: {e}");
            std::process::exit(1);
        }
    };

    let decoder = SyntheticDecoder::new(
        args.synthetic_frames,
        args.synthetic_height,
        args.synthetic_width,
    );

    if let Err(e) = session.load(&decoder) {
        error!("Trial loading failed: {e}");
        std::process::exit(1);
    }
    info!("{} trials loaded", session.selected_trials().len());

    if args.raw_mode {
        info!(
            "Raw mode: {} cubes stored; no autoselection",
            session.raw_stacks().len()
        );
        return;
    }

    let kept = match session.autoselect() {
        Ok(mask) => mask.iter().filter(|&&m| m == 1).count(),
        Err(e) => {
            error!("Autoselection failed: {e}");
            std::process::exit(1);
        }
    };
    info!(
        "{kept}/{} non-blank trials selected",
        session.selected_trials().len() - session.blank_trial_count()
    );

    if args.save_time_courses {
        let out_dir = session.config().derivatives_dir();
        if let Err(e) = std::fs::create_dir_all(&out_dir) {
            error!("Cannot create {}: {e}", out_dir.display());
            std::process::exit(1);
        }
        let out = out_dir.join("time_courses.npy");
        if let Err(e) = session.save_time_courses(&out) {
            error!("{e}");
            std::process::exit(1);
        }
    }
}
