use crate::role::{JobEnvironment, find_job_id};
use crate::utils::errors::RecordError;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::process::Command;

/// Something able to abort a whole job, not just this process.
#[async_trait]
pub trait JobCanceller: Send + Sync {
    async fn cancel(&self, job_id: u64) -> std::io::Result<()>;
}

/// Aborts the job through Slurm's `scancel`.
pub struct Scancel;

#[async_trait]
impl JobCanceller for Scancel {
    async fn cancel(&self, job_id: u64) -> std::io::Result<()> {
        let output = Command::new("scancel").arg(job_id.to_string()).output().await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(std::io::Error::other(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

/// The error a process exits with once its job has been told to stop.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct FatalError {
    pub message: String,
    #[source]
    pub source: RecordError,
}

/// Requests cancellation of the surrounding job, if it can be identified, and
/// turns `err` into the fatal error to exit with. Never fails itself: a job id
/// that cannot be found or a cancellation that does not go through is logged
/// and otherwise ignored.
pub async fn abort_job(env: &JobEnvironment, canceller: &dyn JobCanceller, err: RecordError) -> FatalError {
    match find_job_id(env) {
        Some(job_id) => match canceller.cancel(job_id).await {
            Ok(()) => info!("Requested cancellation of job {}", job_id),
            Err(cancel_err) => warn!("Could not cancel job {}: {}", job_id, cancel_err),
        },
        None => warn!("No job id available, cannot cancel the job"),
    }

    let message = match err.proc_id() {
        Some(proc_id) => format!("Record Job Energy error in process {} - {}", proc_id, err),
        None => format!("Record Job Energy error - {}", err),
    };
    error!("{}", message);
    debug!("Underlying cause: {:?}", err.root());
    FatalError {
        message,
        source: err,
    }
}
