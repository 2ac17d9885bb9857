//! End-to-end pipeline tests over synthetic sessions on a temp directory.

use std::fs;
use std::path::Path;
use tempfile::{tempdir, TempDir};

use vsdi_autoselect::decoder::TrialAnomaly;
use vsdi_autoselect::{
    Session, SessionConfig, SessionState, Strategy, SyntheticDecoder, TrialCatalog,
};

/// Build a session directory with `per_cond` trials per condition id and a
/// label file naming the last condition "blank".
fn fake_session(conds: &[u32], per_cond: usize, with_labels: bool) -> TempDir {
    let tmp = tempdir().unwrap();
    let raw = tmp.path().join("rawdata");
    fs::create_dir_all(&raw).unwrap();
    let mut second = 0usize;
    for &c in conds {
        for k in 0..per_cond {
            let name = format!(
                "exp07_sess_020322_12{:02}{:02}_vsd_C{c:02}E{k:02}B00.BLK",
                second / 60,
                second % 60
            );
            fs::write(raw.join(name), b"").unwrap();
            second += 1;
        }
    }
    if with_labels {
        fs::create_dir_all(tmp.path().join("metadata")).unwrap();
        let mut labels: Vec<String> = (1..conds.len() as u32)
            .map(|c| format!("grating {c}"))
            .collect();
        labels.push("blank".to_string());
        fs::write(
            tmp.path().join("metadata/labelConds.txt"),
            labels.join("\n"),
        )
        .unwrap();
    }
    tmp
}

fn config_for(path: &Path) -> SessionConfig {
    let mut cfg = SessionConfig::default();
    cfg.session_path = path.to_path_buf();
    cfg.zero_frames = 20;
    cfg
}

#[test]
fn chunked_mae_pipeline_with_deblank() {
    let dir = fake_session(&[1, 2, 3], 10, true);
    let mut cfg = config_for(dir.path());
    cfg.deblank = true;
    cfg.strategy = Strategy::Mae;
    cfg.chunks = 7; // 70 frames / 7 chunks

    let mut session = Session::new(cfg).unwrap();
    assert_eq!(session.blank_condition_id(), 3);

    let decoder = SyntheticDecoder::new(70, 60, 60);
    session.load(&decoder).unwrap();
    let mask = session.autoselect().unwrap().to_vec();

    assert_eq!(mask.len(), 20);
    assert!(mask.iter().all(|&v| v <= 1));
    assert_eq!(session.selection_mask().len(), 30);
    assert_eq!(session.state(), SessionState::Autoselected);
    assert!(session.blank_baseline().is_some());

    let matrix = session.time_course_matrix().unwrap();
    assert_eq!(matrix.dim(), (30, 70));
}

#[test]
fn planted_condition_outlier_is_rejected() {
    let dir = fake_session(&[1, 2], 10, true);
    let outlier_name = {
        let cat = TrialCatalog::build(dir.path()).unwrap();
        cat.trials_for(1)[4].file_name.clone()
    };

    let mut cfg = config_for(dir.path());
    cfg.deblank = true;
    cfg.strategy = Strategy::Mae;
    cfg.chunks = 1;
    let mut session = Session::new(cfg).unwrap();

    let decoder = SyntheticDecoder::new(70, 60, 60).with_anomaly(
        &outlier_name,
        TrialAnomaly::ScaleFrom { frame: 30, factor: 50.0 },
    );
    session.load(&decoder).unwrap();
    session.autoselect().unwrap();

    let row = session
        .selected_trials()
        .iter()
        .position(|t| t.file_name == outlier_name)
        .unwrap();
    assert_eq!(session.selection_mask()[row], 0, "planted outlier survived");

    // The other condition-1 trials stay in.
    let kept_cond1 = session
        .selected_trials()
        .iter()
        .enumerate()
        .filter(|(i, t)| t.condition_id == 1 && session.selection_mask()[*i] == 1)
        .count();
    assert_eq!(kept_cond1, 9);
}

#[test]
fn incremental_and_batch_loading_agree() {
    let dir = fake_session(&[1, 2], 6, false);
    let decoder = SyntheticDecoder::new(70, 60, 60);

    let mut batch = Session::new(config_for(dir.path())).unwrap();
    batch.load(&decoder).unwrap();

    let mut step = Session::new(config_for(dir.path())).unwrap();
    step.load_conditions(&decoder, &[1]).unwrap();
    step.load_conditions(&decoder, &[2]).unwrap();
    // A third call must be a no-op.
    step.load_conditions(&decoder, &[1, 2]).unwrap();

    assert_eq!(batch.trial_conditions(), step.trial_conditions());
    assert_eq!(
        batch.selected_trials().len(),
        step.selected_trials().len()
    );
    for (a, b) in batch
        .time_course_signals()
        .iter()
        .zip(step.time_course_signals())
    {
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-12);
        }
    }
}

#[test]
fn condition_filter_restricts_loading_and_keeps_blank() {
    let dir = fake_session(&[1, 2, 3], 4, true);
    let mut cfg = config_for(dir.path());
    cfg.deblank = true;
    cfg.condition_ids = Some(vec![1]); // blank (3) must be pulled in

    let mut session = Session::new(cfg).unwrap();
    assert_eq!(session.requested_condition_ids(), &[1, 3]);

    let decoder = SyntheticDecoder::new(70, 60, 60);
    session.load(&decoder).unwrap();
    assert_eq!(session.selected_trials().len(), 8);
    assert!(session
        .trial_conditions()
        .iter()
        .all(|&c| c == 1 || c == 3));
}

#[test]
fn derivatives_artifacts_land_in_the_derived_folder() {
    let dir = fake_session(&[1, 2], 3, false);
    let mut cfg = config_for(dir.path());
    cfg.strategy = Strategy::Roi;
    cfg.tolerance = 15.0;
    let folder = cfg.derived_folder_name();
    assert!(folder.contains("_strategyroi_tol15"));

    let mut session = Session::new(cfg).unwrap();
    let decoder = SyntheticDecoder::new(70, 60, 60);
    session.load(&decoder).unwrap();
    session.autoselect().unwrap();

    let out_dir = session.config().derivatives_dir();
    fs::create_dir_all(&out_dir).unwrap();
    let out = out_dir.join("time_courses.npy");
    session.save_time_courses(&out).unwrap();
    assert!(out.exists());
    assert!(out.to_string_lossy().contains(&folder));
}

#[test]
fn raw_mode_skips_normalization_entirely() {
    let dir = fake_session(&[1, 2], 4, false);
    let mut cfg = config_for(dir.path());
    cfg.raw_mode = true;
    let mut session = Session::new(cfg).unwrap();

    let decoder = SyntheticDecoder::new(70, 60, 60);
    session.load(&decoder).unwrap();

    assert_eq!(session.raw_stacks().len(), 8);
    assert!(session.delta_f_stacks().is_empty());
    assert!(session.time_course_signals().is_empty());
    // Raw values sit at the synthetic resting light level, not around 0.
    assert!(session.raw_stacks()[0][[0, 0, 0]] > 900.0);
}

#[test]
fn decode_failure_aborts_the_whole_batch() {
    let dir = fake_session(&[1, 2], 3, false);
    // A decoder whose geometry collapses under the configured binning
    // fails on the very first trial.
    let mut cfg = config_for(dir.path());
    cfg.spatial_bin = 100;
    let mut session = Session::new(cfg).unwrap();
    let decoder = SyntheticDecoder::new(70, 60, 60);

    assert!(session.load(&decoder).is_err());
    assert!(session.selected_trials().is_empty(), "partial batch was kept");
}

#[test]
fn statistical_pipeline_respects_the_window_bound() {
    let dir = fake_session(&[1, 2], 12, false);
    let mut cfg = config_for(dir.path());
    cfg.strategy = Strategy::Statistical;
    let mut session = Session::new(cfg).unwrap();

    let decoder = SyntheticDecoder::new(70, 60, 60);
    session.load(&decoder).unwrap();
    let mask = session.autoselect().unwrap();

    let kept: usize = mask.iter().map(|&v| v as usize).sum();
    // 25–75 window: at most half (plus rounding slack).
    assert!(kept <= mask.len() / 2 + 1, "kept {kept} of {}", mask.len());
}
