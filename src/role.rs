use crate::record::STEP_INFO_FILE;
use crate::utils::errors::{RecordError, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

/// Snapshot of the launcher-provided environment, taken once at startup.
#[derive(Debug, Clone, Default)]
pub struct JobEnvironment {
    vars: HashMap<String, String>,
}

impl JobEnvironment {
    pub fn from_process() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// `Ok(None)` when unset, an error when set to something unparsable.
    pub fn parse<T: FromStr>(&self, name: &str) -> Result<Option<T>> {
        match self.get(name) {
            None => Ok(None),
            Some(value) => value.trim().parse().map(Some).map_err(|_| RecordError::InvalidVariable {
                name: name.to_string(),
                value: value.to_string(),
            }),
        }
    }

    fn require<T: FromStr>(&self, name: &str) -> Result<T> {
        self.parse(name)?
            .ok_or_else(|| RecordError::not_in_job(format!("environment variable '{}' not found", name)))
    }
}

/// Parallel launch convention the process was started under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LaunchMode {
    #[serde(rename = "srun")]
    Srun,
    #[serde(rename = "intel_mpi")]
    Pmi,
    #[serde(rename = "open_mpi")]
    OpenMpi,
}

struct Convention {
    mode: LaunchMode,
    rank: &'static str,
    size: &'static str,
    /// Variable whose presence selects the convention, if not the rank itself
    marker: Option<&'static str>,
}

/// Checked in order; the first convention whose signal is present wins.
const CONVENTIONS: [Convention; 3] = [
    Convention {
        mode: LaunchMode::Pmi,
        rank: "PMI_RANK",
        size: "PMI_SIZE",
        marker: None,
    },
    Convention {
        mode: LaunchMode::OpenMpi,
        rank: "OMPI_COMM_WORLD_RANK",
        size: "OMPI_COMM_WORLD_SIZE",
        marker: None,
    },
    // a step id distinguishes srun from a bare sbatch allocation
    Convention {
        mode: LaunchMode::Srun,
        rank: "SLURM_PROCID",
        size: "SLURM_NTASKS",
        marker: Some("SLURM_STEP_ID"),
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Role {
    pub proc_id: u32,
    pub num_procs: u32,
    pub launch_mode: LaunchMode,
}

impl Role {
    /// Rank 0 coordinates the step: it writes step metadata, waits for its
    /// peers and aggregates their records.
    pub fn is_coordinator(&self) -> bool {
        self.proc_id == 0
    }
}

pub fn resolve_role(env: &JobEnvironment) -> Result<Role> {
    for convention in &CONVENTIONS {
        let signal = convention.marker.unwrap_or(convention.rank);
        if env.get(signal).is_none() {
            continue;
        }
        let proc_id: u32 = env.require(convention.rank)?;
        let num_procs: u32 = env.require(convention.size)?;
        if proc_id >= num_procs {
            return Err(RecordError::InvalidVariable {
                name: convention.rank.to_string(),
                value: proc_id.to_string(),
            });
        }
        debug!(
            "Resolved rank {} of {} under {:?}",
            proc_id, num_procs, convention.mode
        );
        return Ok(Role {
            proc_id,
            num_procs,
            launch_mode: convention.mode,
        });
    }
    Err(RecordError::not_in_job("no rank information found"))
}

/// Best-effort job id lookup, also used on the error path.
pub fn find_job_id(env: &JobEnvironment) -> Option<u64> {
    ["SLURM_JOB_ID", "SLURM_JOBID"]
        .iter()
        .find_map(|name| env.get(name)?.trim().parse().ok())
}

pub fn resolve_job_id(env: &JobEnvironment) -> Result<u64> {
    match env.parse("SLURM_JOB_ID")? {
        Some(job_id) => Ok(job_id),
        None => env.require("SLURM_JOBID"),
    }
}

/// Under OpenMPI the root process of mpiexec may not receive the step id, so
/// it is inferred from the number of steps already started for the job. A step
/// counts once its rank 0 has written step metadata; directories created by
/// peers of the current step do not. Two steps of one job starting at the same
/// moment can race here.
pub fn resolve_step_id(env: &JobEnvironment, mode: LaunchMode, job_dir: &Path) -> Result<u64> {
    if let Some(step_id) = env.parse("SLURM_STEP_ID")? {
        return Ok(step_id);
    }
    if mode != LaunchMode::OpenMpi {
        return Err(RecordError::not_in_job("environment variable 'SLURM_STEP_ID' not found"));
    }

    let entries = match std::fs::read_dir(job_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(RecordError::io(job_dir, err)),
    };
    let mut steps = 0;
    for entry in entries {
        let entry = entry.map_err(|e| RecordError::io(job_dir, e))?;
        if entry.path().join(STEP_INFO_FILE).is_file() {
            steps += 1;
        }
    }
    warn!(
        "SLURM_STEP_ID not set, inferred step {} from {}",
        steps,
        job_dir.display()
    );
    Ok(steps)
}

/// Cores allocated to this process; Slurm calls them CPUs.
pub fn resolve_cpus_per_task(env: &JobEnvironment) -> Result<u32> {
    Ok(env.parse("SLURM_CPUS_PER_TASK")?.unwrap_or(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pmi_takes_priority() {
        let env = JobEnvironment::from_pairs([
            ("PMI_RANK", "2"),
            ("PMI_SIZE", "4"),
            ("OMPI_COMM_WORLD_RANK", "1"),
            ("OMPI_COMM_WORLD_SIZE", "8"),
            ("SLURM_STEP_ID", "0"),
            ("SLURM_PROCID", "3"),
            ("SLURM_NTASKS", "16"),
        ]);
        let role = resolve_role(&env).unwrap();
        assert_eq!(
            role,
            Role {
                proc_id: 2,
                num_procs: 4,
                launch_mode: LaunchMode::Pmi
            }
        );
        assert!(!role.is_coordinator());
    }

    #[test]
    fn test_openmpi_before_srun() {
        let env = JobEnvironment::from_pairs([
            ("OMPI_COMM_WORLD_RANK", "0"),
            ("OMPI_COMM_WORLD_SIZE", "8"),
            ("SLURM_STEP_ID", "0"),
            ("SLURM_PROCID", "3"),
            ("SLURM_NTASKS", "16"),
        ]);
        let role = resolve_role(&env).unwrap();
        assert_eq!(role.launch_mode, LaunchMode::OpenMpi);
        assert!(role.is_coordinator());
    }

    #[test]
    fn test_srun_requires_step_id() {
        let env = JobEnvironment::from_pairs([("SLURM_PROCID", "0"), ("SLURM_NTASKS", "2")]);
        assert!(matches!(resolve_role(&env), Err(RecordError::NotInJob(_))));

        let env = JobEnvironment::from_pairs([
            ("SLURM_STEP_ID", "5"),
            ("SLURM_PROCID", "1"),
            ("SLURM_NTASKS", "2"),
        ]);
        let role = resolve_role(&env).unwrap();
        assert_eq!((role.proc_id, role.num_procs, role.launch_mode), (1, 2, LaunchMode::Srun));
    }

    #[test]
    fn test_missing_size_is_not_in_job() {
        let env = JobEnvironment::from_pairs([("PMI_RANK", "0")]);
        match resolve_role(&env) {
            Err(RecordError::NotInJob(msg)) => assert!(msg.contains("PMI_SIZE")),
            other => panic!("Expected NotInJob, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_environment_is_not_in_job() {
        assert!(matches!(
            resolve_role(&JobEnvironment::default()),
            Err(RecordError::NotInJob(_))
        ));
    }

    #[test]
    fn test_garbage_rank_is_invalid() {
        let env = JobEnvironment::from_pairs([("PMI_RANK", "first"), ("PMI_SIZE", "2")]);
        assert!(matches!(resolve_role(&env), Err(RecordError::InvalidVariable { .. })));

        let env = JobEnvironment::from_pairs([("PMI_RANK", "2"), ("PMI_SIZE", "2")]);
        assert!(matches!(resolve_role(&env), Err(RecordError::InvalidVariable { .. })));
    }

    #[test]
    fn test_job_id_fallback() {
        let env = JobEnvironment::from_pairs([("SLURM_JOBID", "77")]);
        assert_eq!(resolve_job_id(&env).unwrap(), 77);
        assert_eq!(find_job_id(&env), Some(77));

        let env = JobEnvironment::from_pairs([("SLURM_JOB_ID", "12"), ("SLURM_JOBID", "77")]);
        assert_eq!(resolve_job_id(&env).unwrap(), 12);

        let env = JobEnvironment::default();
        assert!(matches!(resolve_job_id(&env), Err(RecordError::NotInJob(_))));
        assert_eq!(find_job_id(&env), None);
    }

    #[test]
    fn test_step_id_from_environment() {
        let dir = tempfile::tempdir().unwrap();
        let env = JobEnvironment::from_pairs([("SLURM_STEP_ID", "3")]);
        assert_eq!(resolve_step_id(&env, LaunchMode::Pmi, dir.path()).unwrap(), 3);
    }

    #[test]
    fn test_step_id_inferred_under_openmpi() {
        let dir = tempfile::tempdir().unwrap();
        let job_dir = dir.path().join("1234");
        let env = JobEnvironment::default();
        assert_eq!(resolve_step_id(&env, LaunchMode::OpenMpi, &job_dir).unwrap(), 0);

        for step in ["0", "1"] {
            std::fs::create_dir_all(job_dir.join(step)).unwrap();
            std::fs::write(job_dir.join(step).join(STEP_INFO_FILE), "{}").unwrap();
        }
        std::fs::write(job_dir.join("notes"), "stray file").unwrap();
        assert_eq!(resolve_step_id(&env, LaunchMode::OpenMpi, &job_dir).unwrap(), 2);

        // a peer of the next step got here first
        std::fs::create_dir_all(job_dir.join("2")).unwrap();
        std::fs::write(job_dir.join("2").join("1"), "{}").unwrap();
        assert_eq!(resolve_step_id(&env, LaunchMode::OpenMpi, &job_dir).unwrap(), 2);
    }

    #[test]
    fn test_step_id_not_inferred_under_pmi() {
        let dir = tempfile::tempdir().unwrap();
        let env = JobEnvironment::default();
        assert!(matches!(
            resolve_step_id(&env, LaunchMode::Pmi, dir.path()),
            Err(RecordError::NotInJob(_))
        ));
    }

    #[test]
    fn test_cpus_per_task_defaults_to_one() {
        assert_eq!(resolve_cpus_per_task(&JobEnvironment::default()).unwrap(), 1);
        let env = JobEnvironment::from_pairs([("SLURM_CPUS_PER_TASK", "8")]);
        assert_eq!(resolve_cpus_per_task(&env).unwrap(), 8);
    }

    #[test]
    fn test_launch_mode_keeps_historical_names() {
        assert_eq!(serde_json::to_string(&LaunchMode::Pmi).unwrap(), "\"intel_mpi\"");
        assert_eq!(serde_json::to_string(&LaunchMode::OpenMpi).unwrap(), "\"open_mpi\"");
        assert_eq!(serde_json::to_string(&LaunchMode::Srun).unwrap(), "\"srun\"");
    }
}
