use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::net::{IpAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use super::error::PreviewServerError;

/// Hands out preview ports, preferring the port a project used last time so
/// generated URLs stay stable across app restarts.
///
/// The project -> port mapping is persisted as a single JSON document and
/// rewritten synchronously after each mutation. A missing file reads as
/// empty. Mappings are retained after `release` and never aged out.
pub struct PortManager {
    path: PathBuf,
    range: (u16, u16),
    bind_address: IpAddr,
    state: Mutex<PortState>,
}

#[derive(Debug, Default)]
struct PortState {
    ports: BTreeMap<String, u16>,
    /// Port -> owning project, for ports backing a running server.
    in_use: HashMap<u16, String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PortFile {
    ports: BTreeMap<String, u16>,
}

impl PortManager {
    #[must_use]
    pub fn load(path: PathBuf, range: (u16, u16), bind_address: IpAddr) -> Self {
        let ports = load_ports(&path).unwrap_or_default();
        Self {
            path,
            range,
            bind_address,
            state: Mutex::new(PortState {
                ports,
                in_use: HashMap::new(),
            }),
        }
    }

    /// Pick a port for `project_id`.
    ///
    /// The persisted port wins when it still binds on loopback; otherwise
    /// the range is scanned in ascending order and the new choice is
    /// persisted. A failed probe bind means another process holds the port
    /// and is a retry signal, not an error. Calling `allocate` again for a
    /// project that already holds its port returns the same port.
    pub fn allocate(&self, project_id: &str) -> Result<u16, PreviewServerError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(&port) = state.ports.get(project_id) {
            match state.in_use.get(&port) {
                Some(owner) if owner == project_id => return Ok(port),
                Some(_) => {}
                None => {
                    if self.probe(port) {
                        state.in_use.insert(port, project_id.to_string());
                        return Ok(port);
                    }
                }
            }
        }
        let (low, high) = self.range;
        for port in low..=high {
            if state.in_use.contains_key(&port) || !self.probe(port) {
                continue;
            }
            state.ports.insert(project_id.to_string(), port);
            self.persist(&state.ports);
            state.in_use.insert(port, project_id.to_string());
            return Ok(port);
        }
        Err(PreviewServerError::NoPortAvailable { low, high })
    }

    /// Marks the project's port as free for other servers while retaining
    /// the mapping, so the next `allocate` reuses the same port.
    pub fn release(&self, project_id: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.in_use.retain(|_, owner| owner != project_id);
    }

    /// Pure read of the persisted mapping.
    #[must_use]
    pub fn lookup(&self, project_id: &str) -> Option<u16> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.ports.get(project_id).copied()
    }

    /// Drops all mappings. Intended for tests.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.ports.clear();
        state.in_use.clear();
        self.persist(&state.ports);
    }

    /// Rewrites the persisted document. Called by the manager on shutdown.
    pub fn flush(&self) {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.persist(&state.ports);
    }

    fn persist(&self, ports: &BTreeMap<String, u16>) {
        if let Err(err) = save_ports(&self.path, ports) {
            tracing::warn!(path = %self.path.display(), "failed to persist port mapping: {err}");
        }
    }

    fn probe(&self, port: u16) -> bool {
        TcpListener::bind((self.bind_address, port)).is_ok()
    }
}

fn load_ports(path: &Path) -> io::Result<BTreeMap<String, u16>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let data = fs::read_to_string(path)?;
    let file: PortFile = serde_json::from_str(&data).unwrap_or_default();
    Ok(file.ports)
}

fn save_ports(path: &Path, ports: &BTreeMap<String, u16>) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = PortFile {
        ports: ports.clone(),
    };
    let data = serde_json::to_vec_pretty(&file).unwrap_or_default();
    fs::write(path, data)
}
