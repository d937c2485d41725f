use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("not running as part of a Slurm job step ({0}); launch with srun or mpiexec")]
    NotInJob(String),
    #[error("environment variable '{name}' has invalid value '{value}'")]
    InvalidVariable { name: String, value: String },
    #[error("cannot scan energy zones under '{}': {reason}", .path.display())]
    Scan { path: PathBuf, reason: String },
    #[error("cannot read energy counter of zone '{}': {reason}", .path.display())]
    Sample { path: PathBuf, reason: String },
    #[error("error while creating directory {} - {source}", .path.display())]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("task {command} failed ({reason})")]
    TaskFailure { command: String, reason: String },
    #[error("timeout waiting for processes to complete ({reported} of {expected} reported after {waited:?})")]
    BarrierTimeout {
        reported: usize,
        expected: usize,
        waited: Duration,
    },
    #[error("energy counter of zone '{zone}' on {node} went backwards ({start} -> {finish}); counter wraparound is not supported")]
    CounterRegression {
        node: String,
        zone: String,
        start: u64,
        finish: u64,
    },
    #[error("no task provided")]
    EmptyTask,
    #[error("Sysinfo error: {0}")]
    SysinfoError(String),
    #[error("I/O error at '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot encode or decode '{}': {source}", .path.display())]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid process record: {0}")]
    InvalidRecord(String),
    #[error("{source}")]
    InProcess {
        proc_id: u32,
        #[source]
        source: Box<RecordError>,
    },
}

impl RecordError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn sample(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Sample {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn not_in_job(reason: impl Into<String>) -> Self {
        Self::NotInJob(reason.into())
    }

    /// Annotate the error with the rank of the process it happened in.
    /// Already annotated errors are left as they are.
    pub fn in_process(self, proc_id: u32) -> Self {
        match self {
            annotated @ Self::InProcess { .. } => annotated,
            other => Self::InProcess {
                proc_id,
                source: Box::new(other),
            },
        }
    }

    /// Rank recorded by `in_process`, if any.
    pub fn proc_id(&self) -> Option<u32> {
        match self {
            Self::InProcess { proc_id, .. } => Some(*proc_id),
            _ => None,
        }
    }

    /// The underlying error with any rank annotation stripped.
    pub fn root(&self) -> &RecordError {
        match self {
            Self::InProcess { source, .. } => source.root(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, RecordError>;
