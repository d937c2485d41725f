use sysinfo::{CpuRefreshKind, RefreshKind, System};
use crate::utils::errors::{RecordError, Result};

/// Identity of the machine this process runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub node: String,
    /// Logical cores as seen by the OS, not the launcher's view of the
    /// allocation. Launchers may mask cores, which would skew attribution.
    pub num_cores: u32,
}

/// Collects the host name and the logical core count of this node.
pub fn collect_host_info() -> Result<HostInfo> {
    let node = System::host_name()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| RecordError::SysinfoError("host name unavailable".to_string()))?;

    let system = System::new_with_specifics(
        RefreshKind::nothing().with_cpu(CpuRefreshKind::nothing()),
    );
    let num_cores = system.cpus().len() as u32;
    if num_cores == 0 {
        return Err(RecordError::SysinfoError("no logical cores reported".to_string()));
    }

    Ok(HostInfo { node, num_cores })
}
