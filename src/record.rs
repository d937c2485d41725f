use crate::energy_group::ZoneReading;
use crate::role::LaunchMode;
use crate::utils::errors::{RecordError, Result};
use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const STEP_INFO_FILE: &str = "step_info";
pub const TOTALS_FILE: &str = "totalled_data";

/// Written once by rank 0 before the task runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepMetadata {
    pub job_id: u64,
    pub step_id: u64,
    pub task: String,
    #[serde(rename = "parallel_cmd")]
    pub launch_mode: LaunchMode,
    pub num_procs: u32,
}

/// Everything one rank measured. Its file doubles as the rank's completion
/// signal, so it is only ever published whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessEnergyRecord {
    pub node: String,
    pub num_cores: u32,
    pub job_id: u64,
    pub step_id: u64,
    pub proc_id: u32,
    pub cpus_per_task: u32,
    pub zones: Vec<ZoneReading>,
}

/// Paths of one step's artifacts: `<root>/<job_id>/<step_id>/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepLayout {
    dir: PathBuf,
}

impl StepLayout {
    pub fn job_dir(root: &Path, job_id: u64) -> PathBuf {
        root.join(job_id.to_string())
    }

    pub fn new(root: &Path, job_id: u64, step_id: u64) -> Self {
        Self {
            dir: Self::job_dir(root, job_id).join(step_id.to_string()),
        }
    }

    #[cfg(test)]
    pub fn from_dir(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[cfg(test)]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_path(&self, proc_id: u32) -> PathBuf {
        self.dir.join(proc_id.to_string())
    }

    pub fn step_info_path(&self) -> PathBuf {
        self.dir.join(STEP_INFO_FILE)
    }

    pub fn totals_path(&self) -> PathBuf {
        self.dir.join(TOTALS_FILE)
    }

    pub fn create(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(|source| RecordError::Directory {
            path: self.dir.clone(),
            source,
        })
    }

    /// Ranks whose records are present, in ascending order.
    pub fn reported_ranks(&self) -> Result<Vec<u32>> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| RecordError::io(&self.dir, e))?;
        let mut ranks = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| RecordError::io(&self.dir, e))?;
            if let Some(rank) = entry.file_name().to_str().and_then(parse_rank) {
                ranks.push(rank);
            }
        }
        ranks.sort_unstable();
        Ok(ranks)
    }
}

/// Record files are named by the canonical decimal form of their rank.
pub fn parse_rank(name: &str) -> Option<u32> {
    let rank: u32 = name.parse().ok()?;
    (rank.to_string() == name).then_some(rank)
}

/// Serializes into a hidden sibling file and renames it into place, so readers
/// see either nothing or the complete document.
pub fn write_atomically<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staging = path.with_file_name(format!(".{}.tmp", file_name));

    let encoded = serde_json::to_vec_pretty(value).map_err(|source| RecordError::Serialization {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::write(&staging, encoded).map_err(|e| RecordError::io(&staging, e))?;
    std::fs::rename(&staging, path).map_err(|e| RecordError::io(path, e))?;
    debug!("Wrote {}", path.display());
    Ok(())
}

pub fn read_document<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = std::fs::read(path).map_err(|e| RecordError::io(path, e))?;
    serde_json::from_slice(&bytes).map_err(|source| RecordError::Serialization {
        path: path.to_path_buf(),
        source,
    })
}
