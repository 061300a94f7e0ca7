use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

/// Tunables for the preview server subsystem.
///
/// The defaults match production; tests shrink the timeouts and move the
/// port range and state file out of the way.
#[derive(Debug, Clone)]
pub struct PreviewConfig {
    /// Upper bound on concurrently running preview servers.
    pub max_active_servers: usize,
    /// Idle window after which the reaper stops a server.
    pub idle_timeout: Duration,
    /// How often the idle reaper scans the pool.
    pub reaper_interval: Duration,
    /// Inclusive port range scanned during allocation.
    pub port_range: (u16, u16),
    /// Interface every listener binds to. Loopback only.
    pub bind_address: IpAddr,
    /// How long `start` waits for a listener before tearing down.
    pub start_timeout: Duration,
    /// Location of the persisted project -> port document. The host app
    /// points this at its settings directory.
    pub port_map_path: PathBuf,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            max_active_servers: 10,
            idle_timeout: Duration::from_secs(5 * 60),
            reaper_interval: Duration::from_secs(60),
            port_range: (3000, 4000),
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            start_timeout: Duration::from_secs(5),
            port_map_path: std::env::temp_dir().join("workbench-preview-ports.json"),
        }
    }
}
