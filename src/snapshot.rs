//! Stage artifact recorder.
//!
//! Every pipeline stage hands its full structured output to the recorder,
//! which writes it once to `<root>/<run_id>/<NN>_<stage>.json`. Stage files
//! contain no timestamps or run identifiers so two runs over the same input
//! and configuration can be compared byte for byte; run metadata lives in
//! `manifest.json`. Nothing in the pipeline reads these files back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{Result, RedubError};
use crate::run::RunContext;

pub const SCHEMA_VERSION: u32 = 1;
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Segmentation,
    VoiceProfiles,
    Translation,
    Synthesis,
    Reconciliation,
    Timeline,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Segmentation,
        Stage::VoiceProfiles,
        Stage::Translation,
        Stage::Synthesis,
        Stage::Reconciliation,
        Stage::Timeline,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Segmentation => "segmentation",
            Self::VoiceProfiles => "voice_profiles",
            Self::Translation => "translation",
            Self::Synthesis => "synthesis",
            Self::Reconciliation => "reconciliation",
            Self::Timeline => "timeline",
        }
    }

    pub fn file_name(&self) -> String {
        let ordinal = Self::ALL.iter().position(|s| s == self).unwrap_or(0) + 1;
        format!("{:02}_{}.json", ordinal, self.name())
    }
}

#[derive(Serialize)]
struct StageDocument<'a, T: Serialize> {
    schema_version: u32,
    stage: &'static str,
    items: &'a T,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub input: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stages: Vec<String>,
}

/// Writes per-stage snapshots for a run.
#[derive(Debug, Clone)]
pub struct StageArtifactRecorder {
    root: Option<PathBuf>,
}

impl StageArtifactRecorder {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: Some(root.as_ref().to_path_buf()),
        }
    }

    /// Recorder that accepts and drops every snapshot
    pub fn disabled() -> Self {
        Self { root: None }
    }

    pub fn run_dir(&self, ctx: &RunContext) -> Option<PathBuf> {
        self.root.as_ref().map(|root| root.join(&ctx.run_id))
    }

    /// Serialise one stage's output. Each stage may be recorded once per run.
    pub fn record<T: Serialize>(&self, ctx: &RunContext, stage: Stage, items: &T) -> Result<Option<PathBuf>> {
        let Some(run_dir) = self.run_dir(ctx) else {
            return Ok(None);
        };
        std::fs::create_dir_all(&run_dir)?;

        let document = StageDocument {
            schema_version: SCHEMA_VERSION,
            stage: stage.name(),
            items,
        };
        let mut content = serde_json::to_string_pretty(&document)?;
        content.push('\n');

        let path = run_dir.join(stage.file_name());
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                RedubError::Snapshot(format!(
                    "Stage '{}' already recorded or not writable at {}: {}",
                    stage.name(),
                    path.display(),
                    e
                ))
            })?;
        file.write_all(content.as_bytes())?;

        debug!("Recorded {} snapshot: {}", stage.name(), path.display());
        Ok(Some(path))
    }

    /// Write the run manifest listing every recorded stage file.
    pub fn finish(&self, ctx: &RunContext) -> Result<Option<PathBuf>> {
        let Some(run_dir) = self.run_dir(ctx) else {
            return Ok(None);
        };
        std::fs::create_dir_all(&run_dir)?;

        let stages = stage_files(&run_dir)?
            .values()
            .filter_map(|path| pathdiff::diff_paths(path, &run_dir))
            .map(|p| p.display().to_string())
            .collect();

        let manifest = RunManifest {
            run_id: ctx.run_id.clone(),
            input: ctx.input.display().to_string(),
            started_at: ctx.started_at,
            finished_at: Utc::now(),
            stages,
        };

        let path = run_dir.join(MANIFEST_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(&manifest)?)?;
        info!("Snapshots for run {} written to {}", ctx.run_id, run_dir.display());
        Ok(Some(path))
    }

    /// Remove everything recorded for a run that did not complete.
    pub fn discard(&self, ctx: &RunContext) {
        if let Some(run_dir) = self.run_dir(ctx) {
            if run_dir.exists() {
                if let Err(e) = std::fs::remove_dir_all(&run_dir) {
                    warn!("Failed to remove snapshots of run {}: {}", ctx.run_id, e);
                }
            }
        }
    }
}

/// A difference between two recorded runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SnapshotDifference {
    MissingInRight { file: String },
    MissingInLeft { file: String },
    Changed { file: String, pointer: String },
}

impl std::fmt::Display for SnapshotDifference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingInRight { file } => write!(f, "{}: only in left run", file),
            Self::MissingInLeft { file } => write!(f, "{}: only in right run", file),
            Self::Changed { file, pointer } => write!(f, "{}: differs at '{}'", file, pointer),
        }
    }
}

fn stage_files(dir: &Path) -> Result<BTreeMap<String, PathBuf>> {
    if !dir.is_dir() {
        return Err(RedubError::Snapshot(format!("Not a snapshot directory: {}", dir.display())));
    }

    let mut files = BTreeMap::new();
    for entry in WalkDir::new(dir).max_depth(1).into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
            continue;
        };
        if entry.file_type().is_file() && name.ends_with(".json") && name != MANIFEST_FILE {
            files.insert(name, path.to_path_buf());
        }
    }
    Ok(files)
}

/// JSON pointer of the first difference between two values, if any.
fn first_difference(left: &Value, right: &Value, pointer: &str) -> Option<String> {
    match (left, right) {
        (Value::Object(l), Value::Object(r)) => {
            for (key, lv) in l {
                let child = format!("{}/{}", pointer, key);
                match r.get(key) {
                    Some(rv) => {
                        if let Some(found) = first_difference(lv, rv, &child) {
                            return Some(found);
                        }
                    }
                    None => return Some(child),
                }
            }
            r.keys()
                .find(|key| !l.contains_key(*key))
                .map(|key| format!("{}/{}", pointer, key))
        }
        (Value::Array(l), Value::Array(r)) => {
            for (idx, (lv, rv)) in l.iter().zip(r.iter()).enumerate() {
                if let Some(found) = first_difference(lv, rv, &format!("{}/{}", pointer, idx)) {
                    return Some(found);
                }
            }
            if l.len() != r.len() {
                Some(format!("{}/{}", pointer, l.len().min(r.len())))
            } else {
                None
            }
        }
        _ if left == right => None,
        _ => Some(if pointer.is_empty() { "/".to_string() } else { pointer.to_string() }),
    }
}

/// Compare the stage snapshots of two run directories.
pub fn diff_runs<P: AsRef<Path>, Q: AsRef<Path>>(left: P, right: Q) -> Result<Vec<SnapshotDifference>> {
    let left_files = stage_files(left.as_ref())?;
    let right_files = stage_files(right.as_ref())?;
    let mut differences = Vec::new();

    for (name, left_path) in &left_files {
        let Some(right_path) = right_files.get(name) else {
            differences.push(SnapshotDifference::MissingInRight { file: name.clone() });
            continue;
        };

        let left_bytes = std::fs::read(left_path)?;
        let right_bytes = std::fs::read(right_path)?;
        if left_bytes == right_bytes {
            continue;
        }

        let left_value: Value = serde_json::from_slice(&left_bytes)?;
        let right_value: Value = serde_json::from_slice(&right_bytes)?;
        let pointer = first_difference(&left_value, &right_value, "").unwrap_or_else(|| "/".to_string());
        differences.push(SnapshotDifference::Changed {
            file: name.clone(),
            pointer,
        });
    }

    for name in right_files.keys() {
        if !left_files.contains_key(name) {
            differences.push(SnapshotDifference::MissingInLeft { file: name.clone() });
        }
    }

    Ok(differences)
}
