//! Session aggregation: trial loading, blank-baseline computation, and
//! autoselection orchestration.
//!
//! A [`Session`] owns every per-trial array produced during an analysis
//! run and is the only code allowed to mutate them. Loading is append-only
//! and idempotent per condition id; the index-alignment invariant between
//! `selected_trials`, `trial_conditions`, `time_course_signals` and
//! `delta_f_stacks` holds at every public call boundary.
//!
//! ## Lifecycle
//!
//! ```text
//! Configured ──(deblank)──► BlankLoaded ──► ConditionsLoaded ──► Autoselected
//!      └────────(no deblank)───────────────────────┘
//! ```
//!
//! The blank pass always runs the overlap strategy with a single chunk and
//! the mean-absolute loss, whatever the configured strategy: the baseline
//! that every other trial is normalised against must itself be robust to a
//! stray outlier blank.

use ndarray::{Array1, Array2, Array3};
use ndarray_npy::WriteNpyExt;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::catalog::{TrialCatalog, TrialFile};
use crate::config::{SessionConfig, Strategy};
use crate::decoder::{TrialDecoder, TrialHeader};
use crate::error::{CatalogError, SessionError, SessionResult, StrategyError};
use crate::normalize::{deltaf_up_fzero, time_course_signal, RoiMask, DEFAULT_OUTLIER_THRESHOLD};
use crate::strategy::{
    overlap_strategy, resolve, roi_strategy, statistical_strategy, OverlapLoss,
};

/// Percentile window of the statistical strategy.
const STATISTICAL_GATE: (f64, f64) = (25.0, 75.0);

// ---------------------------------------------------------------------------
// BlankBaseline / SessionState
// ---------------------------------------------------------------------------

/// The averaged blank-condition signal used to normalise every non-blank
/// trial when deblanking is enabled.
#[derive(Debug, Clone)]
pub struct BlankBaseline {
    /// Averaged F/F0 cube over the selected blank trials, `[frames, H, W]`.
    ///
    /// Kept in ratio form (the `−1` term is *not* removed): this is the
    /// divisor of the deblank formula.
    pub delta_f: Array3<f64>,
    /// Averaged centered time course over the selected blank trials.
    pub time_course: Array1<f64>,
}

/// Progress of a session through its pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Config validated, catalog built, nothing decoded yet.
    Configured,
    /// Blank trials loaded and the baseline computed.
    BlankLoaded,
    /// Non-blank trials (or raw cubes) loaded.
    ConditionsLoaded,
    /// The selection mask covers every loaded trial.
    Autoselected,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One VSDI recording session: trial catalog, accumulated per-trial
/// signals, and the autoselection outcome.
pub struct Session {
    config: SessionConfig,
    catalog: TrialCatalog,
    /// Resolved condition filter, sorted; includes the blank id whenever
    /// deblanking is enabled.
    requested_ids: Vec<u32>,
    blank_id: u32,

    selected_trials: Vec<TrialFile>,
    trial_conditions: Vec<u32>,
    time_course_signals: Vec<Array1<f64>>,
    delta_f_stacks: Vec<Array3<f64>>,
    raw_stacks: Vec<Array3<f64>>,
    /// Full selection mask: blank rows first, then the non-blank rows.
    selection_mask: Vec<u8>,
    /// Mask of the blank rows, fixed by the blank pass.
    blank_mask: Vec<u8>,
    blank_baseline: Option<BlankBaseline>,
    blank_trial_count: usize,

    loaded_condition_ids: BTreeSet<u32>,
    shared_header: Option<TrialHeader>,
    roi: Option<RoiMask>,
    state: SessionState,
}

impl Session {
    /// Validate `config`, scan the session directory, and resolve the
    /// condition filter and blank id.
    ///
    /// No trial is decoded here; loading happens in [`Session::load`].
    pub fn new(config: SessionConfig) -> SessionResult<Self> {
        config.validate()?;
        let catalog = TrialCatalog::build(&config.session_path)?;
        let blank_id = catalog.blank_condition_id();

        let requested_ids = match &config.condition_ids {
            None => catalog.condition_ids(),
            Some(ids) => {
                let present: BTreeSet<u32> = catalog.condition_ids().into_iter().collect();
                let mut set: BTreeSet<u32> = ids.iter().copied().collect();
                for id in &set {
                    if !present.contains(id) {
                        warn!("Requested condition {id} has no trials in this session");
                    }
                }
                if config.deblank {
                    set.insert(blank_id);
                }
                set.into_iter().collect()
            }
        };
        info!(
            "Session configured: conditions {:?}, blank id {}, strategy {}",
            requested_ids, blank_id, config.strategy
        );

        Ok(Session {
            config,
            catalog,
            requested_ids,
            blank_id,
            selected_trials: Vec::new(),
            trial_conditions: Vec::new(),
            time_course_signals: Vec::new(),
            delta_f_stacks: Vec::new(),
            raw_stacks: Vec::new(),
            selection_mask: Vec::new(),
            blank_mask: Vec::new(),
            blank_baseline: None,
            blank_trial_count: 0,
            loaded_condition_ids: BTreeSet::new(),
            shared_header: None,
            roi: None,
            state: SessionState::Configured,
        })
    }

    // -----------------------------------------------------------------------
    // Loading
    // -----------------------------------------------------------------------

    /// Load every requested condition through `decoder`.
    ///
    /// With deblanking enabled the blank condition is loaded first (once)
    /// and turned into the [`BlankBaseline`]; already loaded conditions are
    /// skipped, so calling this repeatedly appends nothing twice.
    pub fn load(&mut self, decoder: &dyn TrialDecoder) -> SessionResult<()> {
        let ids: Vec<u32> = self.requested_ids.clone();
        self.load_conditions(decoder, &ids)
    }

    /// Load the intersection of `ids` with the requested conditions,
    /// appending to the session arrays. Idempotent per condition id.
    pub fn load_conditions(
        &mut self,
        decoder: &dyn TrialDecoder,
        ids: &[u32],
    ) -> SessionResult<()> {
        if self.config.raw_mode {
            return self.load_raw(decoder, ids);
        }

        if self.config.deblank && self.blank_baseline.is_none() {
            self.load_blank(decoder)?;
        }

        let mut appended = false;
        for &id in ids {
            if id == self.blank_id && self.config.deblank {
                continue; // folded in by the blank pass
            }
            if !self.requested_ids.contains(&id) {
                warn!("Condition {id} is outside the requested set; skipping");
                continue;
            }
            if self.loaded_condition_ids.contains(&id) {
                debug!("Condition {id} already loaded; skipping");
                continue;
            }

            let trials: Vec<TrialFile> = self
                .catalog
                .trials_for(id)
                .into_iter()
                .cloned()
                .collect();
            if trials.is_empty() {
                warn!("Condition {id} has no trials; skipping");
                continue;
            }

            info!("Trials loading starts: condition {id}, {} trials", trials.len());
            let deblank = self.config.deblank;
            let baseline = self.blank_baseline.as_ref().map(|b| b.delta_f.clone());
            let (signals, stacks) = self.extract_signals(decoder, &trials, deblank, baseline.as_ref())?;

            for (trial, (tc, df)) in trials.into_iter().zip(signals.into_iter().zip(stacks)) {
                self.selected_trials.push(trial);
                self.trial_conditions.push(id);
                self.time_course_signals.push(tc);
                self.delta_f_stacks.push(df);
            }
            self.loaded_condition_ids.insert(id);
            appended = true;
        }

        if self.selected_trials.is_empty() {
            return Err(SessionError::Catalog(CatalogError::NoTrials {
                path: self.config.rawdata_dir(),
                requested: self.requested_ids.clone(),
            }));
        }
        if appended || self.state == SessionState::Configured {
            self.state = if self.loaded_condition_ids.len() > usize::from(self.config.deblank) {
                SessionState::ConditionsLoaded
            } else {
                SessionState::BlankLoaded
            };
        }
        Ok(())
    }

    /// Blank pass: decode all blank trials, normalise them in ratio form,
    /// exclude outliers with the single-chunk overlap strategy, and average
    /// the survivors into the baseline.
    fn load_blank(&mut self, decoder: &dyn TrialDecoder) -> SessionResult<()> {
        let trials: Vec<TrialFile> = self
            .catalog
            .trials_for(self.blank_id)
            .into_iter()
            .cloned()
            .collect();
        if trials.is_empty() {
            return Err(SessionError::Catalog(CatalogError::NoTrials {
                path: self.config.rawdata_dir(),
                requested: vec![self.blank_id],
            }));
        }

        info!("Blank trials loading starts: {} trials", trials.len());
        // Ratio-form pass: deblank requested, but no baseline exists yet.
        let (signals, stacks) = self.extract_signals(decoder, &trials, true, None)?;

        let n_frames = signals[0].len();
        let mut matrix = Array2::zeros((signals.len(), n_frames));
        for (i, sig) in signals.iter().enumerate() {
            matrix.row_mut(i).assign(sig);
        }
        let outcome = overlap_strategy(
            &matrix,
            1,
            OverlapLoss::Mae,
            crate::config::ChunkPolicy::Intersection,
        )?;
        let mut kept: Vec<usize> = outcome
            .mask
            .iter()
            .enumerate()
            .filter(|(_, &m)| m == 1)
            .map(|(i, _)| i)
            .collect();
        if kept.is_empty() {
            warn!("Blank autoselection rejected every trial; averaging over all of them");
            kept = (0..signals.len()).collect();
        }
        info!("{}/{} blank trials kept for the baseline", kept.len(), signals.len());

        // Average the survivors. The divisor cube stays in ratio form; the
        // stored per-trial arrays are centered like every other trial.
        let mut df_sum: Array3<f64> = Array3::zeros(stacks[0].raw_dim());
        let mut tc_sum: Array1<f64> = Array1::zeros(n_frames);
        for &i in &kept {
            df_sum += &stacks[i];
            tc_sum += &(&signals[i] - 1.0);
        }
        let k = kept.len() as f64;
        let baseline = BlankBaseline {
            delta_f: df_sum / k,
            time_course: tc_sum / k,
        };

        for (trial, (tc, df)) in trials.into_iter().zip(signals.into_iter().zip(stacks)) {
            self.selected_trials.push(trial);
            self.trial_conditions.push(self.blank_id);
            self.time_course_signals.push(tc - 1.0);
            self.delta_f_stacks.push(df - 1.0);
        }
        self.blank_trial_count = self.selected_trials.len();
        self.blank_mask = outcome.mask;
        self.blank_baseline = Some(baseline);
        self.loaded_condition_ids.insert(self.blank_id);
        self.state = SessionState::BlankLoaded;
        Ok(())
    }

    /// Raw-mode loading: store the binned cubes as-is, no ΔF/F0 and no
    /// time course.
    fn load_raw(&mut self, decoder: &dyn TrialDecoder, ids: &[u32]) -> SessionResult<()> {
        for &id in ids {
            if !self.requested_ids.contains(&id) || self.loaded_condition_ids.contains(&id) {
                continue;
            }
            let trials: Vec<TrialFile> = self
                .catalog
                .trials_for(id)
                .into_iter()
                .cloned()
                .collect();
            if trials.is_empty() {
                continue;
            }
            info!("Raw loading: condition {id}, {} trials", trials.len());
            for (i, trial) in trials.iter().enumerate() {
                let decoded = self.decode_one(decoder, trial)?;
                info!("Trial {}/{} loaded ({})", i + 1, trials.len(), trial.file_name);
                self.selected_trials.push(trial.clone());
                self.trial_conditions.push(id);
                self.raw_stacks.push(decoded);
            }
            self.loaded_condition_ids.insert(id);
        }
        if self.selected_trials.is_empty() {
            return Err(SessionError::Catalog(CatalogError::NoTrials {
                path: self.config.rawdata_dir(),
                requested: self.requested_ids.clone(),
            }));
        }
        self.state = SessionState::ConditionsLoaded;
        Ok(())
    }

    /// Decode one trial, establishing or checking the shared batch header
    /// and the ROI mask.
    fn decode_one(
        &mut self,
        decoder: &dyn TrialDecoder,
        trial: &TrialFile,
    ) -> SessionResult<Array3<f64>> {
        let path = self.config.rawdata_dir().join(&trial.file_name);
        let decoded = decoder.decode(
            &path,
            self.config.spatial_bin,
            self.config.temporal_bin,
            self.config.zero_frames,
            self.shared_header.as_ref(),
        )?;
        if self.shared_header.is_none() {
            info!(
                "Batch header: {} frames, {}×{} px",
                decoded.header.n_frames, decoded.header.height, decoded.header.width
            );
            self.roi = Some(RoiMask::circular(decoded.header.height, decoded.header.width));
            self.shared_header = Some(decoded.header);
        }
        Ok(decoded.raw)
    }

    /// Decode and normalise a batch of trials sequentially, returning the
    /// per-trial time courses and ΔF/F0 cubes. A decode failure aborts the
    /// whole batch.
    fn extract_signals(
        &mut self,
        decoder: &dyn TrialDecoder,
        trials: &[TrialFile],
        deblank: bool,
        baseline: Option<&Array3<f64>>,
    ) -> SessionResult<(Vec<Array1<f64>>, Vec<Array3<f64>>)> {
        debug!(
            "extract: deblank={deblank}, baseline={}",
            if baseline.is_some() { "present" } else { "absent" }
        );
        let mut signals = Vec::with_capacity(trials.len());
        let mut stacks = Vec::with_capacity(trials.len());
        for (i, trial) in trials.iter().enumerate() {
            let raw = self.decode_one(decoder, trial)?;
            let df = deltaf_up_fzero(
                &raw,
                self.config.zero_frames,
                deblank,
                baseline,
                DEFAULT_OUTLIER_THRESHOLD,
            );
            let roi = self.roi.as_ref().expect("mask built by first decode");
            signals.push(time_course_signal(&df, roi));
            stacks.push(df);
            info!("Trial {}/{} loaded ({})", i + 1, trials.len(), trial.file_name);
        }
        Ok((signals, stacks))
    }

    // -----------------------------------------------------------------------
    // Autoselection
    // -----------------------------------------------------------------------

    /// Run the configured detection strategy over the loaded non-blank
    /// trials and rebuild the session's selection mask.
    ///
    /// Blank rows keep the mask assigned by the blank pass and are never
    /// re-evaluated. Returns the non-blank portion of the mask.
    pub fn autoselect(&mut self) -> SessionResult<&[u8]> {
        if self.config.raw_mode {
            return Err(SessionError::invalid_state(
                "raw mode stores no time courses to autoselect",
            ));
        }
        let n_total = self.time_course_signals.len();
        let n_eval = n_total - self.blank_trial_count;
        if n_eval == 0 {
            return Err(SessionError::invalid_state(
                "no non-blank trials loaded yet",
            ));
        }
        let n_frames = self
            .shared_header
            .as_ref()
            .map(|h| h.n_frames)
            .expect("header set by loading");

        let effective = resolve(self.config.strategy, n_frames, self.config.chunks);
        if effective != self.config.strategy {
            info!(
                "Strategy {} resolved to {} for this session",
                self.config.strategy, effective
            );
        }

        let matrix = self
            .time_course_matrix()
            .expect("non-empty after loading");
        let mut mask = vec![0u8; n_eval];
        match effective {
            Strategy::Mae | Strategy::Mse => {
                let loss = OverlapLoss::from_strategy(effective).expect("chunked strategy");
                let conds: BTreeSet<u32> = self
                    .trial_conditions
                    .iter()
                    .copied()
                    .filter(|&c| c != self.blank_id)
                    .collect();
                for c in conds {
                    let rows: Vec<usize> = self
                        .trial_conditions
                        .iter()
                        .enumerate()
                        .filter(|(_, &cc)| cc == c)
                        .map(|(i, _)| i)
                        .collect();
                    info!("Autoselection for condition {c} ({} trials)", rows.len());
                    let mut sub = Array2::zeros((rows.len(), n_frames));
                    for (k, &r) in rows.iter().enumerate() {
                        sub.row_mut(k).assign(&matrix.row(r));
                    }
                    let outcome = overlap_strategy(
                        &sub,
                        self.config.chunks,
                        loss,
                        self.config.chunk_policy,
                    )?;
                    for (k, &r) in rows.iter().enumerate() {
                        mask[r - self.blank_trial_count] = outcome.mask[k];
                    }
                }
            }
            Strategy::Roi => {
                let sub = matrix.slice(ndarray::s![self.blank_trial_count.., ..]);
                mask = roi_strategy(
                    &sub.to_owned(),
                    self.config.tolerance,
                    self.config.zero_frames,
                );
            }
            Strategy::Statistical => {
                let sub = matrix.slice(ndarray::s![self.blank_trial_count.., ..]);
                let (bottom, up) = STATISTICAL_GATE;
                mask = statistical_strategy(&sub.to_owned(), up, bottom);
            }
        }

        self.selection_mask = self
            .blank_mask
            .iter()
            .copied()
            .chain(mask.iter().copied())
            .collect();
        let kept: usize = self.selection_mask.iter().map(|&v| v as usize).sum();
        info!("{kept}/{} trials have been selected", self.selection_mask.len());
        self.state = SessionState::Autoselected;
        Ok(&self.selection_mask[self.blank_trial_count..])
    }

    // -----------------------------------------------------------------------
    // Read-only accessors
    // -----------------------------------------------------------------------

    /// The session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The trial catalog (all trials discovered, not only the loaded ones).
    pub fn catalog(&self) -> &TrialCatalog {
        &self.catalog
    }

    /// Current pipeline state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The blank condition id.
    pub fn blank_condition_id(&self) -> u32 {
        self.blank_id
    }

    /// The resolved condition filter.
    pub fn requested_condition_ids(&self) -> &[u32] {
        &self.requested_ids
    }

    /// Loaded trials, index-aligned with every other per-trial accessor.
    pub fn selected_trials(&self) -> &[TrialFile] {
        &self.selected_trials
    }

    /// Condition id of each loaded trial.
    pub fn trial_conditions(&self) -> &[u32] {
        &self.trial_conditions
    }

    /// ROI time course of each loaded trial (centered ΔF/F0 form).
    pub fn time_course_signals(&self) -> &[Array1<f64>] {
        &self.time_course_signals
    }

    /// ΔF/F0 cube of each loaded trial.
    pub fn delta_f_stacks(&self) -> &[Array3<f64>] {
        &self.delta_f_stacks
    }

    /// Raw binned cubes (raw mode only).
    pub fn raw_stacks(&self) -> &[Array3<f64>] {
        &self.raw_stacks
    }

    /// Full 0/1 selection mask over the loaded trials (blank rows first).
    /// Empty until [`Session::autoselect`] has run.
    pub fn selection_mask(&self) -> &[u8] {
        &self.selection_mask
    }

    /// Number of blank trials at the front of the per-trial arrays.
    pub fn blank_trial_count(&self) -> usize {
        self.blank_trial_count
    }

    /// The 0/1 mask assigned to the blank rows by the blank pass.
    pub fn blank_selection_mask(&self) -> &[u8] {
        &self.blank_mask
    }

    /// The averaged blank baseline, when deblanking is enabled and loaded.
    pub fn blank_baseline(&self) -> Option<&BlankBaseline> {
        self.blank_baseline.as_ref()
    }

    /// Frame count shared by every loaded trial, once known.
    pub fn n_frames(&self) -> Option<usize> {
        self.shared_header.as_ref().map(|h| h.n_frames)
    }

    /// The loaded time courses stacked into `[n_trials, n_frames]`.
    pub fn time_course_matrix(&self) -> Option<Array2<f64>> {
        let n_frames = self.n_frames()?;
        if self.time_course_signals.is_empty() {
            return None;
        }
        let mut m = Array2::zeros((self.time_course_signals.len(), n_frames));
        for (i, sig) in self.time_course_signals.iter().enumerate() {
            m.row_mut(i).assign(sig);
        }
        Some(m)
    }

    /// Mean time course and mean ΔF/F0 cube over the *selected* trials of
    /// one condition. `None` before autoselection or when the condition has
    /// no selected trial.
    pub fn averaged_signal(&self, condition_id: u32) -> Option<(Array1<f64>, Array3<f64>)> {
        if self.selection_mask.len() != self.selected_trials.len() {
            return None;
        }
        let rows: Vec<usize> = (0..self.selected_trials.len())
            .filter(|&i| {
                self.trial_conditions[i] == condition_id && self.selection_mask[i] == 1
            })
            .collect();
        if rows.is_empty() {
            return None;
        }
        let mut tc = Array1::zeros(self.time_course_signals[rows[0]].len());
        let mut df = Array3::zeros(self.delta_f_stacks[rows[0]].raw_dim());
        for &r in &rows {
            tc += &self.time_course_signals[r];
            df += &self.delta_f_stacks[r];
        }
        let k = rows.len() as f64;
        Some((tc / k, df / k))
    }

    /// Write the stacked time-course matrix to `path` as a `.npy` file.
    pub fn save_time_courses(&self, path: &Path) -> SessionResult<()> {
        let matrix = self.time_course_matrix().ok_or_else(|| {
            SessionError::from(StrategyError::EmptyMatrix)
        })?;
        let file = std::fs::File::create(path)
            .map_err(|e| SessionError::export(path, e.to_string()))?;
        matrix
            .write_npy(file)
            .map_err(|e| SessionError::export(path, e.to_string()))?;
        info!("Time courses written to {}", path.display());
        Ok(())
    }

    /// Mean of each loaded cube's in-mask pixels is already available as
    /// the time course; this exposes the ROI mask itself for collaborators.
    pub fn roi_mask(&self) -> Option<&RoiMask> {
        self.roi.as_ref()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("requested_ids", &self.requested_ids)
            .field("blank_id", &self.blank_id)
            .field("loaded_trials", &self.selected_trials.len())
            .field("blank_trial_count", &self.blank_trial_count)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::SyntheticDecoder;
    use ndarray::Axis;
    use std::fs;
    use tempfile::{tempdir, TempDir};

    /// Build a session directory with `per_cond` trials for each condition
    /// id, timestamps spaced one second apart.
    fn fake_session(conds: &[u32], per_cond: usize) -> TempDir {
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
        tmp
    }

    fn base_config(path: &Path) -> SessionConfig {
        let mut cfg = SessionConfig::default();
        cfg.session_path = path.to_path_buf();
        cfg.zero_frames = 20;
        cfg
    }

    #[test]
    fn arrays_stay_index_aligned_through_loading() {
        let dir = fake_session(&[1, 2, 3], 4);
        let mut cfg = base_config(dir.path());
        cfg.deblank = true;
        let mut session = Session::new(cfg).unwrap();
        assert_eq!(session.state(), SessionState::Configured);

        let decoder = SyntheticDecoder::new(70, 60, 60);
        session.load(&decoder).unwrap();

        let n = session.selected_trials().len();
        assert_eq!(n, 12);
        assert_eq!(session.trial_conditions().len(), n);
        assert_eq!(session.time_course_signals().len(), n);
        assert_eq!(session.delta_f_stacks().len(), n);
        // Blank (id 3) rows come first.
        assert_eq!(session.blank_trial_count(), 4);
        assert!(session.trial_conditions()[..4].iter().all(|&c| c == 3));
        assert_eq!(session.state(), SessionState::ConditionsLoaded);
    }

    #[test]
    fn loading_is_idempotent_per_condition() {
        let dir = fake_session(&[1, 2], 3);
        let mut session = Session::new(base_config(dir.path())).unwrap();
        let decoder = SyntheticDecoder::new(70, 60, 60);

        session.load(&decoder).unwrap();
        let n = session.selected_trials().len();
        session.load(&decoder).unwrap();
        assert_eq!(session.selected_trials().len(), n, "reload duplicated trials");
    }

    #[test]
    fn incremental_load_matches_batch_load() {
        let dir = fake_session(&[1, 2], 5);
        let decoder = SyntheticDecoder::new(70, 60, 60);

        let mut batch = Session::new(base_config(dir.path())).unwrap();
        batch.load(&decoder).unwrap();

        let mut incremental = Session::new(base_config(dir.path())).unwrap();
        incremental.load_conditions(&decoder, &[1]).unwrap();
        incremental.load_conditions(&decoder, &[2]).unwrap();

        assert_eq!(batch.trial_conditions(), incremental.trial_conditions());
        for (a, b) in batch
            .time_course_signals()
            .iter()
            .zip(incremental.time_course_signals())
        {
            assert_eq!(a.len(), b.len());
            for (x, y) in a.iter().zip(b.iter()) {
                assert!((x - y).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn roi_scenario_masks_only_non_blank_trials() {
        // 3 conditions, id 3 = blank, 10 trials each, roi strategy.
        let dir = fake_session(&[1, 2, 3], 10);
        let mut cfg = base_config(dir.path());
        cfg.deblank = true;
        cfg.strategy = Strategy::Roi;
        cfg.tolerance = 20.0;
        let mut session = Session::new(cfg).unwrap();

        let decoder = SyntheticDecoder::new(70, 60, 60);
        session.load(&decoder).unwrap();
        let mask = session.autoselect().unwrap().to_vec();

        assert_eq!(mask.len(), 20, "two non-blank conditions × 10 trials");
        assert!(mask.iter().all(|&v| v <= 1));
        assert!(session.blank_baseline().is_some());
        assert_eq!(session.selection_mask().len(), 30);
        assert_eq!(session.state(), SessionState::Autoselected);
    }

    #[test]
    fn blank_outlier_is_excluded_from_the_baseline() {
        let dir = fake_session(&[1, 2], 10);
        // Make condition 2 the blank (no labels → highest id).
        let outlier_name = {
            // Second trial of the blank condition.
            let cat = TrialCatalog::build(dir.path()).unwrap();
            cat.trials_for(2)[1].file_name.clone()
        };
        let mut cfg = base_config(dir.path());
        cfg.deblank = true;
        let mut session = Session::new(cfg).unwrap();
        assert_eq!(session.blank_condition_id(), 2);

        let decoder = SyntheticDecoder::new(70, 60, 60).with_anomaly(
            &outlier_name,
            crate::decoder::TrialAnomaly::ScaleFrom { frame: 30, factor: 100.0 },
        );
        session.load(&decoder).unwrap();

        // The blank mask flags exactly the planted outlier.
        let blank_rows = session.blank_trial_count();
        assert_eq!(blank_rows, 10);
        let blank_mask = session.blank_selection_mask();
        let rejected: Vec<usize> = blank_mask
            .iter()
            .enumerate()
            .filter(|(_, &m)| m == 0)
            .map(|(i, _)| i)
            .collect();
        let outlier_row = session
            .selected_trials()
            .iter()
            .position(|t| t.file_name == outlier_name)
            .unwrap();
        assert_eq!(rejected, vec![outlier_row]);

        // And the baseline stays near the clean ratio level (≈ 1.0), far
        // from the 100× contamination.
        let baseline = session.blank_baseline().unwrap();
        let late_mean = baseline
            .delta_f
            .index_axis(Axis(0), 50)
            .mean()
            .unwrap();
        assert!(
            (late_mean - 1.0).abs() < 0.5,
            "baseline contaminated: late-frame mean {late_mean}"
        );
    }

    #[test]
    fn autoselect_before_loading_is_an_error() {
        let dir = fake_session(&[1, 2], 2);
        let mut session = Session::new(base_config(dir.path())).unwrap();
        assert!(matches!(
            session.autoselect(),
            Err(SessionError::InvalidState { .. })
        ));
    }

    #[test]
    fn raw_mode_stores_cubes_and_rejects_autoselect() {
        let dir = fake_session(&[1, 2], 3);
        let mut cfg = base_config(dir.path());
        cfg.raw_mode = true;
        let mut session = Session::new(cfg).unwrap();
        let decoder = SyntheticDecoder::new(70, 60, 60);
        session.load(&decoder).unwrap();

        assert_eq!(session.raw_stacks().len(), 6);
        assert!(session.time_course_signals().is_empty());
        assert!(matches!(
            session.autoselect(),
            Err(SessionError::InvalidState { .. })
        ));
    }

    #[test]
    fn statistical_strategy_runs_through_the_session() {
        let dir = fake_session(&[1, 2], 8);
        let mut cfg = base_config(dir.path());
        cfg.strategy = Strategy::Statistical;
        let mut session = Session::new(cfg).unwrap();
        let decoder = SyntheticDecoder::new(70, 60, 60);
        session.load(&decoder).unwrap();
        let mask = session.autoselect().unwrap();
        assert_eq!(mask.len(), 16);
        assert!(mask.iter().all(|&v| v <= 1));
    }

    #[test]
    fn chunk_mismatch_falls_back_to_roi_inside_the_session() {
        // 70 frames, 4 chunks: not a divisor. Must not error.
        let dir = fake_session(&[1, 2], 5);
        let mut cfg = base_config(dir.path());
        cfg.strategy = Strategy::Mae;
        cfg.chunks = 4;
        let mut session = Session::new(cfg).unwrap();
        let decoder = SyntheticDecoder::new(70, 60, 60);
        session.load(&decoder).unwrap();
        let mask = session.autoselect().unwrap();
        assert_eq!(mask.len(), 10);
    }

    #[test]
    fn averaged_signal_covers_selected_trials_only() {
        let dir = fake_session(&[1, 2], 6);
        let mut cfg = base_config(dir.path());
        cfg.strategy = Strategy::Roi;
        let mut session = Session::new(cfg).unwrap();
        let decoder = SyntheticDecoder::new(70, 60, 60);
        session.load(&decoder).unwrap();
        session.autoselect().unwrap();

        let (tc, df) = session.averaged_signal(1).expect("condition 1 has trials");
        assert_eq!(tc.len(), 70);
        assert_eq!(df.shape()[0], 70);
        assert!(session.averaged_signal(99).is_none());
    }

    #[test]
    fn save_time_courses_writes_npy(){
        let dir = fake_session(&[1, 2], 3);
        let mut session = Session::new(base_config(dir.path())).unwrap();
        let decoder = SyntheticDecoder::new(70, 60, 60);
        session.load(&decoder).unwrap();

        let out = dir.path().join("time_courses.npy");
        session.save_time_courses(&out).unwrap();
        assert!(out.exists());
        assert!(fs::metadata(&out).unwrap().len() > 0);
    }
}
