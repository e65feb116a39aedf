//! Checkpoint and resume artifacts.
//!
//! Two JSON files per run:
//!
//! ```text
//! <model_path>    { header, model: <mapped potential> }          read by the engine
//! <resume_path>   { header, state: <controller counters>, model } read by `resume`
//! ```
//!
//! Both are written to a hidden sibling temporary file, flushed and synced, then renamed
//! over the target, so readers only ever see a complete artifact.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::errors::CheckpointError;
use crate::learner::controller::ControllerState;

/// Artifact format version.
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointHeader {
    pub format_version: u32,
    /// Free-form producer tag, e.g. the model type.
    pub source: String,
    pub run_id: Uuid,
    pub revision: u64,
    pub dft_calls: u64,
    /// RFC 3339 timestamp.
    pub created_at: String,
}

impl CheckpointHeader {
    pub fn new(source: &str, state: &ControllerState) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            source: source.to_string(),
            run_id: state.run_id,
            revision: state.revision,
            dft_calls: state.dft_calls,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint<A> {
    pub header: CheckpointHeader,
    pub model: A,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeState<M> {
    pub header: CheckpointHeader,
    pub state: ControllerState,
    pub model: M,
}

#[derive(Serialize)]
struct ResumeRef<'a, M> {
    header: CheckpointHeader,
    state: &'a ControllerState,
    model: &'a M,
}

/// Sibling temporary path used while writing `path`.
pub fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "checkpoint".to_string());
    path.with_file_name(format!(".{}.tmp", name))
}

/// Writes `bytes` to `path` through a temporary file and an atomic rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CheckpointError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| CheckpointError::io(parent, e))?;
    }
    let tmp = temp_path(path);

    let result = (|| -> std::io::Result<()> {
        let file = File::create(&tmp)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(bytes)?;
        writer.flush()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    result.map_err(|e| {
        let _ = fs::remove_file(&tmp);
        CheckpointError::io(path, e)
    })
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, CheckpointError> {
    let file = File::open(path).map_err(|e| CheckpointError::io(path, e))?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

fn check_version(header: &CheckpointHeader) -> Result<(), CheckpointError> {
    if header.format_version != FORMAT_VERSION {
        return Err(CheckpointError::Format(format!(
            "format version {} (supported: {})",
            header.format_version, FORMAT_VERSION
        )));
    }
    Ok(())
}

/// Owns the artifact paths of one run.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    model_path: PathBuf,
    resume_path: Option<PathBuf>,
}

impl CheckpointManager {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            resume_path: None,
        }
    }

    pub fn with_resume_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.resume_path = Some(path.into());
        self
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub fn resume_path(&self) -> Option<&Path> {
        self.resume_path.as_deref()
    }

    pub fn save_model<A: Serialize>(&self, header: CheckpointHeader, model: &A) -> Result<&Path, CheckpointError> {
        let checkpoint = Checkpoint { header, model };
        let bytes = serde_json::to_vec(&checkpoint)?;
        write_atomic(&self.model_path, &bytes)?;
        Ok(&self.model_path)
    }

    /// Writes the resume artifact if a resume path is configured.
    pub fn save_resume<M: Serialize>(
        &self,
        header: CheckpointHeader,
        state: &ControllerState,
        model: &M,
    ) -> Result<Option<&Path>, CheckpointError> {
        let Some(path) = self.resume_path.as_deref() else {
            return Ok(None);
        };
        let resume = ResumeRef { header, state, model };
        let bytes = serde_json::to_vec(&resume)?;
        write_atomic(path, &bytes)?;
        Ok(Some(path))
    }

    pub fn load_model<A: DeserializeOwned>(path: &Path) -> Result<Checkpoint<A>, CheckpointError> {
        let checkpoint: Checkpoint<A> = read_json(path)?;
        check_version(&checkpoint.header)?;
        Ok(checkpoint)
    }

    pub fn load_resume<M: DeserializeOwned>(path: &Path) -> Result<ResumeState<M>, CheckpointError> {
        let resume: ResumeState<M> = read_json(path)?;
        check_version(&resume.header)?;
        if resume.header.run_id != resume.state.run_id {
            return Err(CheckpointError::Format("run id in header and state differ".into()));
        }
        Ok(resume)
    }
}
