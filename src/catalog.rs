//! Trial catalog: discovery and indexing of a session's trial files.
//!
//! A session directory holds one binary trial file per stimulus
//! presentation under `rawdata/`. Each filename embeds two pieces of
//! metadata that the whole pipeline depends on:
//!
//! - the **condition id**, the 2-digit integer following the `vsd_C` token
//!   (`..._vsd_C03...` → condition 3);
//! - the **acquisition timestamp**, underscore-delimited tokens 2 and 3
//!   (`<a>_<b>_<ddmmyy>_<HHMMSS>_...`), which defines the trial ordering.
//!
//! Both are parsed once, at catalog-build time, into a typed [`TrialFile`]
//! record; a malformed name fails the build immediately rather than leaking
//! `None`s into the numeric code.
//!
//! Condition labels come from `metadata/labelConds.txt` (one label per
//! line, line number = condition id). A missing label file is not an error:
//! synthetic `"Condition <id>"` labels are generated instead.

use chrono::NaiveDateTime;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::info;

use crate::error::CatalogError;

/// Location of the condition label file, relative to the session path.
const LABEL_CONDS_PATH: &str = "metadata/labelConds.txt";

/// Filename extension of trial files.
const TRIAL_EXTENSION: &str = ".BLK";

// ---------------------------------------------------------------------------
// TrialFile
// ---------------------------------------------------------------------------

/// A single trial file, with the metadata parsed from its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialFile {
    /// Bare filename (no directory components).
    pub file_name: String,
    /// 1-based condition id from the `vsd_C` token.
    pub condition_id: u32,
    /// Acquisition timestamp from the date/time tokens.
    pub timestamp: NaiveDateTime,
}

/// Parse the condition id and acquisition timestamp out of a trial
/// filename.
///
/// # Errors
///
/// Returns [`CatalogError::MalformedName`] when the `vsd_C` token is
/// absent, the condition digits do not parse, or the date/time tokens are
/// missing or invalid.
pub fn parse_trial_name(name: &str) -> Result<TrialFile, CatalogError> {
    // Condition id: the two digits after "vsd_C".
    let after = name
        .split("vsd_C")
        .nth(1)
        .ok_or_else(|| CatalogError::malformed(name, "missing `vsd_C` token"))?;
    if after.len() < 2 {
        return Err(CatalogError::malformed(
            name,
            "fewer than 2 characters after `vsd_C`",
        ));
    }
    let condition_id: u32 = after[0..2]
        .parse()
        .map_err(|_| CatalogError::malformed(name, "condition digits do not parse"))?;
    if condition_id == 0 {
        return Err(CatalogError::malformed(name, "condition id 0 is reserved"));
    }

    // Timestamp: tokens 2 (ddmmyy) and 3 (HHMMSS).
    let tokens: Vec<&str> = name.split('_').collect();
    if tokens.len() < 4 {
        return Err(CatalogError::malformed(
            name,
            "fewer than 4 underscore-delimited tokens",
        ));
    }
    let stamp = format!("{}{}", tokens[2], tokens[3]);
    let timestamp = NaiveDateTime::parse_from_str(&stamp, "%d%m%y%H%M%S")
        .map_err(|e| CatalogError::malformed(name, format!("bad date/time tokens: {e}")))?;

    Ok(TrialFile {
        file_name: name.to_string(),
        condition_id,
        timestamp,
    })
}

// ---------------------------------------------------------------------------
// TrialCatalog
// ---------------------------------------------------------------------------

/// The resolved trial and condition inventory of one session.
#[derive(Debug, Clone)]
pub struct TrialCatalog {
    /// All trials found under `rawdata/`, sorted by acquisition timestamp.
    trials: Vec<TrialFile>,
    /// Condition labels; index = condition id − 1.
    condition_names: Vec<String>,
    /// The condition id reserved for blank (no-stimulus) trials.
    blank_condition_id: u32,
}

impl TrialCatalog {
    /// Scan `session_path/rawdata/` and build the catalog.
    ///
    /// Trials are sorted by the timestamp embedded in their filename (ties
    /// broken by name for a stable order). Labels are read from
    /// `metadata/labelConds.txt` when present.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::RawDataNotFound`] when the raw-data
    /// directory does not exist and [`CatalogError::MalformedName`] for the
    /// first filename violating the grammar.
    pub fn build(session_path: &Path) -> Result<Self, CatalogError> {
        let rawdata = session_path.join("rawdata");
        if !rawdata.is_dir() {
            return Err(CatalogError::RawDataNotFound { path: rawdata });
        }

        let mut trials = Vec::new();
        for entry in std::fs::read_dir(&rawdata)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(TRIAL_EXTENSION) {
                continue;
            }
            trials.push(parse_trial_name(&name)?);
        }
        trials.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.file_name.cmp(&b.file_name))
        });

        let present_ids: BTreeSet<u32> = trials.iter().map(|t| t.condition_id).collect();
        let condition_names = load_condition_names(session_path, &present_ids);
        let blank_condition_id = resolve_blank_id(&condition_names, &present_ids);
        info!(
            "Catalog: {} trials, {} conditions, blank id {}",
            trials.len(),
            present_ids.len(),
            blank_condition_id
        );

        Ok(TrialCatalog {
            trials,
            condition_names,
            blank_condition_id,
        })
    }

    /// All trials, sorted by acquisition timestamp.
    pub fn trials(&self) -> &[TrialFile] {
        &self.trials
    }

    /// Condition labels; index = condition id − 1.
    pub fn condition_names(&self) -> &[String] {
        &self.condition_names
    }

    /// The label of one condition, if the id is in range.
    pub fn label_for(&self, condition_id: u32) -> Option<&str> {
        let idx = (condition_id as usize).checked_sub(1)?;
        self.condition_names.get(idx).map(String::as_str)
    }

    /// The blank (no-stimulus) condition id.
    pub fn blank_condition_id(&self) -> u32 {
        self.blank_condition_id
    }

    /// Sorted unique condition ids present in the session.
    pub fn condition_ids(&self) -> Vec<u32> {
        let set: BTreeSet<u32> = self.trials.iter().map(|t| t.condition_id).collect();
        set.into_iter().collect()
    }

    /// Trials of one condition, in catalog (timestamp) order.
    pub fn trials_for(&self, condition_id: u32) -> Vec<&TrialFile> {
        self.trials
            .iter()
            .filter(|t| t.condition_id == condition_id)
            .collect()
    }
}

/// Read `metadata/labelConds.txt` (one label per line, line = id − 1), or
/// synthesize `"Condition <id>"` labels for ids `1..=max_present` when the
/// file is absent, so the index = id − 1 invariant holds either way.
fn load_condition_names(session_path: &Path, present_ids: &BTreeSet<u32>) -> Vec<String> {
    let label_path = session_path.join(LABEL_CONDS_PATH);
    match std::fs::read_to_string(&label_path) {
        Ok(contents) => contents
            .lines()
            .map(|l| l.trim_end().to_string())
            .filter(|l| !l.is_empty())
            .collect(),
        Err(_) => {
            info!(
                "No label file at {}; generating synthetic condition names",
                label_path.display()
            );
            let max_id = present_ids.iter().max().copied().unwrap_or(0);
            (1..=max_id).map(|c| format!("Condition {c}")).collect()
        }
    }
}

/// The 1-based position of the first label containing `"blank"`, or the
/// highest condition id present when no such label exists.
fn resolve_blank_id(condition_names: &[String], present_ids: &BTreeSet<u32>) -> u32 {
    match condition_names
        .iter()
        .position(|n| n.contains("blank"))
    {
        Some(idx) => {
            let id = idx as u32 + 1;
            info!("Blank id: {id}");
            id
        }
        None => {
            let id = present_ids
                .iter()
                .max()
                .copied()
                .unwrap_or(condition_names.len() as u32);
            info!("No blank label found; defaulting to last condition, id {id}");
            id
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
