//! Combines every rank's record into one per-node energy report.
//!
//! A process is charged `cpus_per_task / num_cores` of each zone's energy on
//! its node. This assumes every core draws the same power and ignores idle and
//! background draw, so it is an attribution model rather than a measurement.
//!
//! Contributions are rounded to 7 decimal places of a joule and accumulated as
//! integer multiples of that step, which keeps sums exact and independent of
//! the order records are read in.

use crate::energy_group::ZoneReading;
use crate::record::{ProcessEnergyRecord, StepLayout, StepMetadata, read_document};
use crate::utils::errors::{RecordError, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const UNITS: &str = "Joules";
/// Accumulation steps per joule (7 decimal places).
pub const STEPS_PER_JOULE: f64 = 1e7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeReport {
    pub num_cores: u32,
    pub num_procs: u32,
    pub cores_used: u32,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
    pub zones: BTreeMap<String, f64>,
    pub node_total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalAggregate {
    pub total: f64,
    pub units: String,
    pub nodes: BTreeMap<String, NodeReport>,
    pub step_info: StepMetadata,
}

#[derive(Debug, Default)]
struct NodeAccumulator {
    num_cores: u32,
    num_procs: u32,
    cores_used: u32,
    start_time: Option<DateTime<Utc>>,
    finish_time: Option<DateTime<Utc>>,
    zones: BTreeMap<String, i64>,
    total: i64,
}

impl NodeAccumulator {
    fn into_report(self) -> NodeReport {
        NodeReport {
            num_cores: self.num_cores,
            num_procs: self.num_procs,
            cores_used: self.cores_used,
            start_time: self.start_time,
            finish_time: self.finish_time,
            zones: self
                .zones
                .into_iter()
                .map(|(name, steps)| (name, to_joules(steps)))
                .collect(),
            node_total: to_joules(self.total),
        }
    }
}

/// Share of a node's energy charged to one process.
pub fn node_proportion(cpus_per_task: u32, num_cores: u32) -> Result<f64> {
    if num_cores == 0 {
        return Err(RecordError::InvalidRecord("node reports zero cores".to_string()));
    }
    Ok(f64::from(cpus_per_task) / f64::from(num_cores))
}

/// One zone's contribution in accumulation steps. A counter that went
/// backwards (wraparound or reset) is rejected rather than producing negative
/// energy.
pub fn contribution_steps(node: &str, reading: &ZoneReading, proportion: f64) -> Result<i64> {
    let (start, finish) = (reading.start.energy, reading.finish.energy);
    if finish < start {
        return Err(RecordError::CounterRegression {
            node: node.to_string(),
            zone: reading.zone.display_name(),
            start,
            finish,
        });
    }
    if reading.start.unit != reading.finish.unit {
        return Err(RecordError::InvalidRecord(format!(
            "zone '{}' sampled in mixed units",
            reading.zone.display_name()
        )));
    }
    let joules = (finish - start) as f64 / reading.start.unit.per_joule();
    Ok((joules * proportion * STEPS_PER_JOULE).round() as i64)
}

fn to_joules(steps: i64) -> f64 {
    steps as f64 / STEPS_PER_JOULE
}

#[derive(Debug, Default)]
pub struct Aggregator {
    nodes: BTreeMap<String, NodeAccumulator>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, record: &ProcessEnergyRecord) -> Result<()> {
        let proportion = node_proportion(record.cpus_per_task, record.num_cores)?;
        // validate before touching the accumulator
        let contributions = record
            .zones
            .iter()
            .map(|reading| {
                contribution_steps(&record.node, reading, proportion)
                    .map(|steps| (reading.zone.display_name(), steps))
            })
            .collect::<Result<Vec<_>>>()?;

        let node = self.nodes.entry(record.node.clone()).or_default();
        node.num_cores = record.num_cores;
        node.num_procs += 1;
        node.cores_used += record.cpus_per_task;
        for (name, steps) in contributions {
            *node.zones.entry(name).or_default() += steps;
            node.total += steps;
        }
        for reading in &record.zones {
            if node.start_time.is_none_or(|t| reading.start.time < t) {
                node.start_time = Some(reading.start.time);
            }
            if node.finish_time.is_none_or(|t| reading.finish.time > t) {
                node.finish_time = Some(reading.finish.time);
            }
        }
        debug!(
            "Added process {} on {} with proportion {}",
            record.proc_id, record.node, proportion
        );
        Ok(())
    }

    /// The global total is summed over nodes in name order, so it equals the
    /// sum of the reported node totals exactly.
    pub fn finish(self, step_info: StepMetadata) -> GlobalAggregate {
        let nodes: BTreeMap<String, NodeReport> = self
            .nodes
            .into_iter()
            .map(|(name, node)| (name, node.into_report()))
            .collect();
        let total = nodes.values().map(|node| node.node_total).sum();
        GlobalAggregate {
            total,
            units: UNITS.to_string(),
            nodes,
            step_info,
        }
    }
}

/// Reads the record of every rank of the step. Files left behind by ranks
/// outside the step are skipped, and a record naming another job, step or rank
/// than its file is rejected.
pub fn load_records(layout: &StepLayout, step_info: &StepMetadata) -> Result<Vec<ProcessEnergyRecord>> {
    let mut records = Vec::new();
    for rank in layout.reported_ranks()? {
        if rank >= step_info.num_procs {
            warn!(
                "Skipping stale record of rank {} in a step of {} processes",
                rank, step_info.num_procs
            );
            continue;
        }
        let record: ProcessEnergyRecord = read_document(&layout.record_path(rank))?;
        if (record.job_id, record.step_id, record.proc_id) != (step_info.job_id, step_info.step_id, rank) {
            return Err(RecordError::InvalidRecord(format!(
                "file of rank {} holds job {} step {} rank {}, expected job {} step {}",
                rank, record.job_id, record.step_id, record.proc_id, step_info.job_id, step_info.step_id
            )));
        }
        records.push(record);
    }
    Ok(records)
}

pub fn aggregate_step(layout: &StepLayout, step_info: StepMetadata) -> Result<GlobalAggregate> {
    let records = load_records(layout, &step_info)?;
    let mut aggregator = Aggregator::new();
    for record in &records {
        aggregator.add(record)?;
    }
    let aggregate = aggregator.finish(step_info);
    info!(
        "Aggregated {} records from {} nodes: {} {}",
        records.len(),
        aggregate.nodes.len(),
        aggregate.total,
        aggregate.units
    );
    Ok(aggregate)
}
