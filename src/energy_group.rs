use crate::utils::errors::{RecordError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Separator between name components in a zone's display name.
pub const ZONE_NAME_SEPARATOR: &str = "-->";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnergyUnit {
    #[serde(rename = "uj")]
    Microjoules,
    #[serde(rename = "j")]
    Joules,
}

impl EnergyUnit {
    /// Counter increments per joule
    pub fn per_joule(self) -> f64 {
        match self {
            EnergyUnit::Microjoules => 1_000_000.0,
            EnergyUnit::Joules => 1.0,
        }
    }
}

/// A measurement point in the energy topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    pub path: PathBuf,
    /// Label chain from the topology root down to this zone, outermost first
    pub name: Vec<String>,
}

impl Zone {
    pub fn display_name(&self) -> String {
        self.name.iter().join(ZONE_NAME_SEPARATOR)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnergySample {
    pub time: DateTime<Utc>,
    pub energy: u64,
    pub unit: EnergyUnit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Start,
    Finish,
}

impl Phase {
    fn label(self) -> &'static str {
        match self {
            Phase::Start => "start",
            Phase::Finish => "finish",
        }
    }
}

/// A zone together with the readings taken around the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneReading {
    #[serde(flatten)]
    pub zone: Zone,
    #[serde(rename = "starting_energy")]
    pub start: EnergySample,
    #[serde(rename = "finishing_energy")]
    pub finish: EnergySample,
}

#[derive(Debug, Clone)]
struct SampledZone {
    zone: Zone,
    start: Option<EnergySample>,
    finish: Option<EnergySample>,
}

/// Generic energy group: the zones of one node plus their readings.
/// # Type Parameters
/// * `T` - An energy collector type that implements `EnergyCollector`
pub struct EnergyGroup<T: EnergyCollector> {
    zones: Vec<SampledZone>,
    energy_collector: T,
}

impl<T: EnergyCollector> EnergyGroup<T> {
    pub fn new(collector: T) -> Self {
        Self {
            zones: Vec::new(),
            energy_collector: collector,
        }
    }

    pub fn zones(&self) -> impl Iterator<Item = &Zone> {
        self.zones.iter().map(|sampled| &sampled.zone)
    }

    /// Replace the tracked zones with a fresh scan. Previous readings are dropped.
    pub async fn scan(&mut self) -> Result<usize> {
        let zones = self.energy_collector.discover_zones().await?;
        info!("Discovered {} energy zones", zones.len());
        self.zones = zones
            .into_iter()
            .map(|zone| SampledZone {
                zone,
                start: None,
                finish: None,
            })
            .collect();
        Ok(self.zones.len())
    }

    /// Read every zone's counter and file the reading under `phase`.
    pub async fn read_energy(&mut self, phase: Phase) -> Result<()> {
        for sampled in self.zones.iter_mut() {
            let sample = self.energy_collector.read_zone(&sampled.zone).await?;
            debug!(
                "{} reading of {}: {} {:?}",
                phase.label(),
                sampled.zone.display_name(),
                sample.energy,
                sample.unit
            );
            match phase {
                Phase::Start => sampled.start = Some(sample),
                Phase::Finish => sampled.finish = Some(sample),
            }
        }
        Ok(())
    }

    /// Scan the topology and take the starting readings.
    pub async fn commence(&mut self) -> Result<()> {
        if !self.energy_collector.is_available() {
            info!("Energy collector reports no zones on this system");
        }
        self.scan().await?;
        self.read_energy(Phase::Start).await
    }

    /// Take the finishing readings and hand back the completed pairs.
    pub async fn conclude(&mut self) -> Result<Vec<ZoneReading>> {
        self.read_energy(Phase::Finish).await?;
        self.readings()
    }

    pub fn readings(&self) -> Result<Vec<ZoneReading>> {
        self.zones
            .iter()
            .map(|sampled| {
                let missing = |phase: Phase| {
                    RecordError::sample(&sampled.zone.path, format!("no {} reading", phase.label()))
                };
                Ok(ZoneReading {
                    zone: sampled.zone.clone(),
                    start: sampled.start.clone().ok_or_else(|| missing(Phase::Start))?,
                    finish: sampled.finish.clone().ok_or_else(|| missing(Phase::Finish))?,
                })
            })
            .collect()
    }
}

#[async_trait]
pub trait EnergyCollector: Send + Sync {
    /// Enumerate the zones this collector can measure
    async fn discover_zones(&self) -> Result<Vec<Zone>>;

    /// Read the current counter of one zone
    async fn read_zone(&self, zone: &Zone) -> Result<EnergySample>;

    /// Check if this collector has anything to measure on the system
    fn is_available(&self) -> bool;
}
