use crate::energy_group::{EnergyCollector, EnergySample, EnergyUnit, Zone};
use crate::utils::errors::{RecordError, Result};
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, warn};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const POWERCAP_ROOT_DIR: &str = "/sys/devices/virtual/powercap";
/// Cumulative energy counter, in microjoules.
pub const COUNTER_FILE: &str = "energy_uj";
/// Optional human-readable label of a zone.
pub const LABEL_FILE: &str = "name";

/// Reads zones exposed by the Linux powercap framework.
pub struct Powercap {
    pub root: PathBuf,
}

impl Powercap {
    pub fn new(root: Option<PathBuf>) -> Self {
        let root = root.unwrap_or_else(|| PathBuf::from(POWERCAP_ROOT_DIR));
        Self { root }
    }
}

impl Default for Powercap {
    fn default() -> Self {
        Self {
            root: PathBuf::from(POWERCAP_ROOT_DIR),
        }
    }
}

#[async_trait]
impl EnergyCollector for Powercap {
    async fn discover_zones(&self) -> Result<Vec<Zone>> {
        scan_zones(&self.root)
    }

    async fn read_zone(&self, zone: &Zone) -> Result<EnergySample> {
        let counter = zone.path.join(COUNTER_FILE);
        let contents = tokio::fs::read_to_string(&counter)
            .await
            .map_err(|e| RecordError::sample(&zone.path, e))?;
        let energy = first_line(&contents)
            .parse::<u64>()
            .map_err(|e| RecordError::sample(&zone.path, format!("unparsable counter value: {}", e)))?;
        Ok(EnergySample {
            time: Utc::now(),
            energy,
            unit: EnergyUnit::Microjoules,
        })
    }

    fn is_available(&self) -> bool {
        self.root.is_dir()
    }
}

/// Finds every directory under `root` holding an energy counter and names it
/// by the chain of labels leading to it. Symbolic links are not followed.
pub fn scan_zones(root: &Path) -> Result<Vec<Zone>> {
    let metadata = std::fs::metadata(root).map_err(|e| RecordError::Scan {
        path: root.to_path_buf(),
        reason: e.to_string(),
    })?;
    if !metadata.is_dir() {
        return Err(RecordError::Scan {
            path: root.to_path_buf(),
            reason: "not a directory".to_string(),
        });
    }

    let mut zone_dirs = BTreeSet::new();
    for entry in WalkDir::new(root) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!("Skipping unreadable entry under {}: {}", root.display(), err);
                continue;
            }
        };
        if entry.file_type().is_file() && entry.file_name() == COUNTER_FILE {
            if let Some(dir) = entry.path().parent() {
                zone_dirs.insert(dir.to_path_buf());
            }
        }
    }

    let mut zones: Vec<Zone> = zone_dirs
        .into_iter()
        .map(|path| Zone {
            name: zone_name(root, &path),
            path,
        })
        .collect();
    disambiguate(root, &mut zones);
    debug!("Found {} zones under {}", zones.len(), root.display());
    Ok(zones)
}

/// The root's direct child contributes its directory name; every level below
/// it contributes its label file, if it has one.
fn zone_name(root: &Path, dir: &Path) -> Vec<String> {
    let relative = dir.strip_prefix(root).unwrap_or(dir);
    let mut components = relative.components();
    let Some(top) = components.next() else {
        return vec![basename(root)];
    };

    let mut current = root.join(top);
    let mut name = vec![top.as_os_str().to_string_lossy().into_owned()];
    for component in components {
        current.push(component);
        if let Some(label) = read_label(&current) {
            name.push(label);
        }
    }
    name
}

fn read_label(dir: &Path) -> Option<String> {
    let contents = std::fs::read_to_string(dir.join(LABEL_FILE)).ok()?;
    let label = first_line(&contents);
    (!label.is_empty()).then(|| label.to_string())
}

/// Zones sharing a label chain get their leaf suffixed with their path below
/// the root, which is unique.
fn disambiguate(root: &Path, zones: &mut [Zone]) {
    let mut counts: HashMap<Vec<String>, usize> = HashMap::new();
    for zone in zones.iter() {
        *counts.entry(zone.name.clone()).or_default() += 1;
    }
    for zone in zones.iter_mut() {
        if counts.get(&zone.name).copied().unwrap_or(0) < 2 {
            continue;
        }
        let relative = zone.path.strip_prefix(root).unwrap_or(&zone.path);
        let suffix = if relative.as_os_str().is_empty() {
            basename(root)
        } else {
            relative.to_string_lossy().into_owned()
        };
        if let Some(leaf) = zone.name.last_mut() {
            *leaf = format!("{}[{}]", leaf, suffix);
        }
    }
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn first_line(contents: &str) -> &str {
    contents.lines().next().unwrap_or("").trim()
}

#[cfg(test)]
pub(crate) fn write_zone(root: &Path, relative: &str, label: Option<&str>, energy: u64) {
    let dir = root.join(relative);
    std::fs::create_dir_all(&dir).unwrap();
    if let Some(label) = label {
        std::fs::write(dir.join(LABEL_FILE), format!("{}\n", label)).unwrap();
    }
    write_counter(root, relative, energy);
}

#[cfg(test)]
pub(crate) fn write_counter(root: &Path, relative: &str, energy: u64) {
    std::fs::write(root.join(relative).join(COUNTER_FILE), format!("{}\n", energy)).unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(zones: &[Zone]) -> Vec<String> {
        zones.iter().map(|z| z.display_name()).collect()
    }

    #[test]
    fn test_names_run_root_to_leaf() {
        let root = tempfile::tempdir().unwrap();
        write_zone(root.path(), "intel-rapl/intel-rapl:0", Some("package-0"), 1);
        write_zone(root.path(), "intel-rapl/intel-rapl:0/intel-rapl:0:0", Some("core"), 2);
        write_zone(root.path(), "intel-rapl/intel-rapl:0/intel-rapl:0:1", Some("uncore"), 3);
        write_zone(root.path(), "intel-rapl/intel-rapl:1", Some("package-1"), 4);

        let zones = scan_zones(root.path()).unwrap();
        assert_eq!(
            names(&zones),
            vec![
                "intel-rapl-->package-0",
                "intel-rapl-->package-0-->core",
                "intel-rapl-->package-0-->uncore",
                "intel-rapl-->package-1",
            ]
        );
        assert_eq!(zones[1].path, root.path().join("intel-rapl/intel-rapl:0/intel-rapl:0:0"));
    }

    #[test]
    fn test_unlabeled_zone_is_named_after_top_directory() {
        let root = tempfile::tempdir().unwrap();
        write_zone(root.path(), "dtpm/cpu", None, 7);

        let zones = scan_zones(root.path()).unwrap();
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].name, vec!["dtpm".to_string()]);
    }

    #[test]
    fn test_top_directory_label_is_not_used() {
        let root = tempfile::tempdir().unwrap();
        write_zone(root.path(), "intel-rapl", Some("ignored"), 7);

        let zones = scan_zones(root.path()).unwrap();
        assert_eq!(zones[0].name, vec!["intel-rapl".to_string()]);
    }

    #[test]
    fn test_colliding_names_are_made_unique() {
        let root = tempfile::tempdir().unwrap();
        write_zone(root.path(), "intel-rapl/intel-rapl:0", Some("package-0"), 1);
        // a child without its own label inherits its parent's chain
        write_zone(root.path(), "intel-rapl/intel-rapl:0/intel-rapl:0:0", None, 2);
        write_zone(root.path(), "intel-rapl/intel-rapl:1", Some("dram"), 3);

        let zones = scan_zones(root.path()).unwrap();
        let mut all = names(&zones);
        assert_eq!(all[0], "intel-rapl-->package-0[intel-rapl/intel-rapl:0]");
        assert_eq!(all[1], "intel-rapl-->package-0[intel-rapl/intel-rapl:0/intel-rapl:0:0]");
        assert_eq!(all[2], "intel-rapl-->dram");
        all.sort();
        all.dedup();
        assert_eq!(all.len(), zones.len());
    }

    #[test]
    fn test_directories_without_counter_are_skipped() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("intel-rapl/intel-rapl:0")).unwrap();
        std::fs::write(root.path().join("intel-rapl/intel-rapl:0/name"), "package-0\n").unwrap();
        std::fs::write(root.path().join("intel-rapl/intel-rapl:0/max_energy_range_uj"), "5\n").unwrap();

        assert!(scan_zones(root.path()).unwrap().is_empty());
    }

    #[test]
    fn test_missing_root_is_a_scan_error() {
        let root = tempfile::tempdir().unwrap();
        let missing = root.path().join("absent");
        assert!(matches!(scan_zones(&missing), Err(RecordError::Scan { .. })));
    }

    #[test]
    fn test_file_root_is_a_scan_error() {
        let root = tempfile::tempdir().unwrap();
        let file = root.path().join("plain");
        std::fs::write(&file, "x").unwrap();
        match scan_zones(&file) {
            Err(RecordError::Scan { reason, .. }) => assert_eq!(reason, "not a directory"),
            other => panic!("Expected Scan error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_zone_takes_first_trimmed_line() {
        let root = tempfile::tempdir().unwrap();
        write_zone(root.path(), "intel-rapl/intel-rapl:0", Some("package-0"), 0);
        std::fs::write(root.path().join("intel-rapl/intel-rapl:0/energy_uj"), "  4242 \nrubbish\n").unwrap();

        let collector = Powercap::new(Some(root.path().to_path_buf()));
        let zones = collector.discover_zones().await.unwrap();
        let sample = collector.read_zone(&zones[0]).await.unwrap();
        assert_eq!(sample.energy, 4242);
        assert_eq!(sample.unit, EnergyUnit::Microjoules);
    }

    #[tokio::test]
    async fn test_read_zone_rejects_garbage() {
        let root = tempfile::tempdir().unwrap();
        write_zone(root.path(), "intel-rapl/intel-rapl:0", None, 0);
        std::fs::write(root.path().join("intel-rapl/intel-rapl:0/energy_uj"), "n/a\n").unwrap();

        let collector = Powercap::new(Some(root.path().to_path_buf()));
        let zones = collector.discover_zones().await.unwrap();
        assert!(matches!(collector.read_zone(&zones[0]).await, Err(RecordError::Sample { .. })));
    }

    #[test]
    fn test_availability() {
        let root = tempfile::tempdir().unwrap();
        assert!(Powercap::new(Some(root.path().to_path_buf())).is_available());
        assert!(!Powercap::new(Some(root.path().join("nope"))).is_available());
    }
}
