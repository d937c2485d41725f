use crate::aggregate::{GlobalAggregate, aggregate_step};
use crate::barrier::CompletionBarrier;
use crate::collectors::Powercap;
use crate::config::{Invocation, help_text, parse_args};
use crate::energy_group::{EnergyGroup, Zone};
use crate::record::{ProcessEnergyRecord, StepLayout, StepMetadata, write_atomically};
use crate::role::{
    JobEnvironment, Role, resolve_cpus_per_task, resolve_job_id, resolve_role, resolve_step_id,
};
use crate::task::run_task;
use crate::utils::errors::{RecordError, Result};
use crate::utils::psutils::{HostInfo, collect_host_info};
use itertools::Itertools;
use log::{debug, info};
use tokio::io::{AsyncWrite, AsyncWriteExt};

#[derive(Debug)]
pub enum Outcome {
    /// Usage was requested; nothing was measured
    Help,
    /// This rank's record is written; rank 0 takes it from here
    Reported,
    /// Rank 0 collected every record and wrote the report
    Aggregated(GlobalAggregate),
}

/// Everything one rank needs to know about the step it takes part in.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub role: Role,
    pub job_id: u64,
    pub step_id: u64,
    pub layout: StepLayout,
    pub host: HostInfo,
    pub cpus_per_task: u32,
    pub invocation: Invocation,
}

impl StepContext {
    pub fn resolve(env: &JobEnvironment, role: Role, invocation: Invocation) -> Result<Self> {
        let job_id = resolve_job_id(env)?;
        let root = &invocation.options.directory;
        let step_id = resolve_step_id(env, role.launch_mode, &StepLayout::job_dir(root, job_id))?;
        if invocation.task.is_empty() {
            return Err(RecordError::EmptyTask);
        }
        Ok(Self {
            role,
            job_id,
            step_id,
            layout: StepLayout::new(root, job_id, step_id),
            host: collect_host_info()?,
            cpus_per_task: resolve_cpus_per_task(env)?,
            invocation,
        })
    }

    pub fn step_metadata(&self) -> StepMetadata {
        StepMetadata {
            job_id: self.job_id,
            step_id: self.step_id,
            task: self.invocation.command_line(),
            launch_mode: self.role.launch_mode,
            num_procs: self.role.num_procs,
        }
    }
}

pub async fn run<S, W>(args: &[S], env: &JobEnvironment, out: &mut W) -> Result<Outcome>
where
    S: AsRef<str>,
    W: AsyncWrite + Unpin,
{
    run_invocation(parse_args(args), env, out).await
}

/// Errors past role resolution carry this process's rank.
pub async fn run_invocation<W>(invocation: Invocation, env: &JobEnvironment, out: &mut W) -> Result<Outcome>
where
    W: AsyncWrite + Unpin,
{
    let role = resolve_role(env)?;
    if invocation.options.help {
        if role.is_coordinator() {
            emit(out, &help_text()).await.map_err(|e| e.in_process(role.proc_id))?;
        }
        return Ok(Outcome::Help);
    }

    let context = StepContext::resolve(env, role, invocation).map_err(|e| e.in_process(role.proc_id))?;
    run_step(&context, out)
        .await
        .map_err(|e| e.in_process(role.proc_id))
}

async fn run_step<W>(context: &StepContext, out: &mut W) -> Result<Outcome>
where
    W: AsyncWrite + Unpin,
{
    let role = context.role;
    let options = &context.invocation.options;
    // peers create the step directory only when publishing their record
    if role.is_coordinator() {
        context.layout.create()?;
        write_atomically(&context.layout.step_info_path(), &context.step_metadata())?;
    }

    let mut group = EnergyGroup::new(Powercap::new(Some(options.powercap_root.clone())));
    group.commence().await?;
    debug!("Measuring zones: {}", group.zones().map(Zone::display_name).join(", "));
    run_task(&context.invocation.task, out).await?;
    let zones = group.conclude().await?;

    let record = ProcessEnergyRecord {
        node: context.host.node.clone(),
        num_cores: context.host.num_cores,
        job_id: context.job_id,
        step_id: context.step_id,
        proc_id: role.proc_id,
        cpus_per_task: context.cpus_per_task,
        zones,
    };
    if !role.is_coordinator() {
        context.layout.create()?;
    }
    write_atomically(&context.layout.record_path(role.proc_id), &record)?;

    if !role.is_coordinator() {
        let marker = format!(
            "record-job-energy: process {} of {} finished\n",
            role.proc_id, role.num_procs
        );
        emit(out, &marker).await?;
        return Ok(Outcome::Reported);
    }

    info!(
        "Waiting up to {:?} for {} processes",
        options.timeout, role.num_procs
    );
    CompletionBarrier::new(&context.layout, role.num_procs, options.timeout, options.poll_interval)
        .wait()
        .await?;
    let aggregate = aggregate_step(&context.layout, context.step_metadata())?;
    write_atomically(&context.layout.totals_path(), &aggregate)?;
    Ok(Outcome::Aggregated(aggregate))
}

async fn emit<W: AsyncWrite + Unpin>(out: &mut W, text: &str) -> Result<()> {
    out.write_all(text.as_bytes())
        .await
        .map_err(|e| RecordError::io("<stdout>", e))?;
    out.flush().await.map_err(|e| RecordError::io("<stdout>", e))
}
