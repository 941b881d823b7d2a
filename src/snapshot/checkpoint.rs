//! Checkpoint capture and reinstatement.
//!
//! The structured records here are what a snapshot needs to restore
//! sockets, threads, registers, and file-descriptor table entries on a
//! compatible host. Capture is behind the [`CheckpointEngine`] trait:
//! the Linux engine reads `/proc`, tests use an in-memory engine with
//! scripted state.

use crate::capsule::Capsule;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Captured State Records
// =============================================================================

/// One network interface inside the capsule's namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceState {
    pub name: String,
    pub addresses: Vec<String>,
    pub up: bool,
}

/// One tracked connection 5-tuple and its kernel state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub protocol: String,
    pub local: String,
    pub remote: String,
    pub state: String,
}

/// Captured network state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkState {
    pub interfaces: Vec<InterfaceState>,
    pub routes: Vec<String>,
    pub connections: Vec<ConnectionState>,
}

/// Per-thread register file at capture time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadState {
    pub tid: u32,
    pub stack_pointer: u64,
    pub instruction_pointer: u64,
    #[serde(default)]
    pub registers: BTreeMap<String, u64>,
}

/// One open file descriptor table entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FdEntry {
    pub fd: i32,
    pub target: String,
}

/// One process in the capsule's tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub ppid: u32,
    pub command: String,
    pub threads: Vec<ThreadState>,
    pub fds: Vec<FdEntry>,
}

/// Captured process-tree state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessState {
    pub processes: Vec<ProcessRecord>,
}

// =============================================================================
// Engine Seam
// =============================================================================

/// Captures and reinstates runtime state for snapshots.
///
/// Capture runs while the capsule is frozen, so the records are
/// mutually consistent.
#[async_trait]
pub trait CheckpointEngine: Send + Sync {
    /// Dumps the capsule's memory image.
    async fn capture_memory(&self, capsule: &Capsule) -> Result<Vec<u8>>;

    /// Captures interfaces, routes, and connections.
    async fn capture_network(&self, capsule: &Capsule) -> Result<NetworkState>;

    /// Captures the process tree with threads and fd tables.
    async fn capture_processes(&self, capsule: &Capsule) -> Result<ProcessState>;

    /// Reinstates captured state into a restored capsule.
    ///
    /// Best effort by contract: a host that cannot reinstate a record
    /// reports `RestoreFailed` rather than guessing.
    async fn reinstate(
        &self,
        capsule: &Capsule,
        memory: &[u8],
        network: &NetworkState,
        processes: &ProcessState,
    ) -> Result<()>;
}

// =============================================================================
// Linux /proc Engine
// =============================================================================

/// Engine reading capture state from `/proc`.
///
/// Memory capture walks `/proc/<pid>/maps` and reads writable private
/// regions through `/proc/<pid>/mem`; thread registers come from the
/// per-task stat fields. Reinstatement of registers requires kernel
/// checkpoint support and is reported as unavailable here.
pub struct ProcCheckpointEngine {
    /// Cap on the captured memory image.
    pub max_image_bytes: u64,
}

impl ProcCheckpointEngine {
    pub fn new() -> Self {
        Self {
            max_image_bytes: crate::constants::MAX_MEMORY_IMAGE_SIZE,
        }
    }
}

impl Default for ProcCheckpointEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CheckpointEngine for ProcCheckpointEngine {
    async fn capture_memory(&self, capsule: &Capsule) -> Result<Vec<u8>> {
        let pid = require_pid(capsule)?;
        let max = self.max_image_bytes;
        tokio::task::spawn_blocking(move || sys::dump_memory(pid, max))
            .await
            .map_err(|e| Error::SnapshotFailed {
                capsule: pid.to_string(),
                reason: format!("memory capture task aborted: {e}"),
            })?
    }

    async fn capture_network(&self, capsule: &Capsule) -> Result<NetworkState> {
        let pid = require_pid(capsule)?;
        tokio::task::spawn_blocking(move || sys::read_network_state(pid))
            .await
            .map_err(|e| Error::SnapshotFailed {
                capsule: pid.to_string(),
                reason: format!("network capture task aborted: {e}"),
            })?
    }

    async fn capture_processes(&self, capsule: &Capsule) -> Result<ProcessState> {
        let pid = require_pid(capsule)?;
        tokio::task::spawn_blocking(move || sys::read_process_state(pid))
            .await
            .map_err(|e| Error::SnapshotFailed {
                capsule: pid.to_string(),
                reason: format!("process capture task aborted: {e}"),
            })?
    }

    async fn reinstate(
        &self,
        capsule: &Capsule,
        _memory: &[u8],
        _network: &NetworkState,
        _processes: &ProcessState,
    ) -> Result<()> {
        // Register/socket reinstatement needs kernel checkpoint
        // support; without it the restored capsule restarts from its
        // entrypoint with the snapshot's filesystem.
        Err(Error::RestoreFailed {
            capsule: capsule.id.to_string(),
            reason: "kernel checkpoint restore not available on this host".to_string(),
        })
    }
}

fn require_pid(capsule: &Capsule) -> Result<u32> {
    capsule.pid.ok_or_else(|| Error::SnapshotFailed {
        capsule: capsule.id.to_string(),
        reason: "capsule has no running init process".to_string(),
    })
}

// =============================================================================
// In-Memory Engine (tests, migrations within one process)
// =============================================================================

/// Engine with scripted state; capture returns what `state` holds and
/// reinstatement records what it was asked to restore.
#[derive(Default)]
pub struct InMemoryCheckpointEngine {
    pub memory: std::sync::Mutex<Vec<u8>>,
    pub network: std::sync::Mutex<NetworkState>,
    pub processes: std::sync::Mutex<ProcessState>,
    pub reinstated: std::sync::Mutex<Vec<String>>,
}

impl InMemoryCheckpointEngine {
    pub fn with_memory(memory: Vec<u8>) -> Self {
        let engine = Self::default();
        *engine.memory.lock().expect("engine lock poisoned") = memory;
        engine
    }
}

#[async_trait]
impl CheckpointEngine for InMemoryCheckpointEngine {
    async fn capture_memory(&self, _capsule: &Capsule) -> Result<Vec<u8>> {
        Ok(self.memory.lock().expect("engine lock poisoned").clone())
    }

    async fn capture_network(&self, _capsule: &Capsule) -> Result<NetworkState> {
        Ok(self.network.lock().expect("engine lock poisoned").clone())
    }

    async fn capture_processes(&self, _capsule: &Capsule) -> Result<ProcessState> {
        Ok(self.processes.lock().expect("engine lock poisoned").clone())
    }

    async fn reinstate(
        &self,
        capsule: &Capsule,
        _memory: &[u8],
        _network: &NetworkState,
        _processes: &ProcessState,
    ) -> Result<()> {
        self.reinstated
            .lock()
            .expect("engine lock poisoned")
            .push(capsule.id.to_string());
        Ok(())
    }
}

// =============================================================================
// Linux /proc Readers
// =============================================================================

#[cfg(target_os = "linux")]
mod sys {
    use super::*;
    use std::fs;
    use std::io::{Read, Seek, SeekFrom};

    /// Dumps writable private regions via `/proc/<pid>/mem`.
    pub fn dump_memory(pid: u32, max_bytes: u64) -> Result<Vec<u8>> {
        let maps = fs::read_to_string(format!("/proc/{pid}/maps")).map_err(|e| Error::SnapshotFailed {
            capsule: pid.to_string(),
            reason: format!("read maps: {e}"),
        })?;
        let mut mem = fs::File::open(format!("/proc/{pid}/mem")).map_err(|e| Error::SnapshotFailed {
            capsule: pid.to_string(),
            reason: format!("open mem: {e}"),
        })?;

        let mut image = Vec::new();
        for line in maps.lines() {
            let mut fields = line.split_whitespace();
            let Some(range) = fields.next() else { continue };
            let Some(perms) = fields.next() else { continue };
            // Only writable private anonymous-ish regions carry state
            // worth dumping; file-backed read-only pages re-map.
            if !perms.starts_with("rw") || perms.ends_with('s') {
                continue;
            }
            let Some((start, end)) = range.split_once('-') else { continue };
            let (Ok(start), Ok(end)) = (u64::from_str_radix(start, 16), u64::from_str_radix(end, 16))
            else {
                continue;
            };
            let len = end.saturating_sub(start);
            if image.len() as u64 + len > max_bytes {
                return Err(Error::SnapshotFailed {
                    capsule: pid.to_string(),
                    reason: format!("memory image exceeds {max_bytes} bytes"),
                });
            }

            // Record region header so restore knows the layout.
            image.extend_from_slice(format!("REGION {start:x} {end:x}\n").as_bytes());
            let mut buf = vec![0u8; len as usize];
            if mem.seek(SeekFrom::Start(start)).is_ok() && mem.read_exact(&mut buf).is_ok() {
                image.extend_from_slice(&buf);
            } else {
                // Unreadable region (guard pages): length of zeros
                // keeps offsets stable.
                image.extend_from_slice(&vec![0u8; len as usize]);
            }
        }
        Ok(image)
    }

    /// Reads interfaces/routes/connections from the capsule's netns
    /// view of `/proc/<pid>/net`.
    pub fn read_network_state(pid: u32) -> Result<NetworkState> {
        let mut state = NetworkState::default();

        if let Ok(dev) = fs::read_to_string(format!("/proc/{pid}/net/dev")) {
            for line in dev.lines().skip(2) {
                if let Some((name, _)) = line.split_once(':') {
                    state.interfaces.push(InterfaceState {
                        name: name.trim().to_string(),
                        addresses: Vec::new(),
                        up: true,
                    });
                }
            }
        }
        if let Ok(route) = fs::read_to_string(format!("/proc/{pid}/net/route")) {
            for line in route.lines().skip(1) {
                state.routes.push(line.split_whitespace().collect::<Vec<_>>().join(" "));
            }
        }
        if let Ok(tcp) = fs::read_to_string(format!("/proc/{pid}/net/tcp")) {
            for line in tcp.lines().skip(1) {
                let fields: Vec<&str> = line.split_whitespace().collect();
                if fields.len() >= 4 {
                    state.connections.push(ConnectionState {
                        protocol: "tcp".to_string(),
                        local: fields[1].to_string(),
                        remote: fields[2].to_string(),
                        state: fields[3].to_string(),
                    });
                }
            }
        }
        Ok(state)
    }

    /// Walks the process tree rooted at `pid` via `/proc`.
    pub fn read_process_state(root_pid: u32) -> Result<ProcessState> {
        let mut state = ProcessState::default();
        let mut pending = vec![root_pid];

        while let Some(pid) = pending.pop() {
            let Some(record) = read_process(pid) else { continue };
            // Children found through /proc/<pid>/task/<pid>/children.
            if let Ok(children) = fs::read_to_string(format!("/proc/{pid}/task/{pid}/children")) {
                pending.extend(children.split_whitespace().filter_map(|c| c.parse::<u32>().ok()));
            }
            state.processes.push(record);
        }

        if state.processes.is_empty() {
            return Err(Error::SnapshotFailed {
                capsule: root_pid.to_string(),
                reason: "process tree vanished during capture".to_string(),
            });
        }
        Ok(state)
    }

    fn read_process(pid: u32) -> Option<ProcessRecord> {
        let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
        let command = stat.split('(').nth(1)?.split(')').next()?.to_string();
        let after_comm = stat.rsplit(") ").next()?;
        let fields: Vec<&str> = after_comm.split_whitespace().collect();
        let ppid = fields.get(1).and_then(|f| f.parse().ok()).unwrap_or(0);

        let mut threads = Vec::new();
        if let Ok(tasks) = fs::read_dir(format!("/proc/{pid}/task")) {
            for task in tasks.flatten() {
                let Some(tid) = task.file_name().to_str().and_then(|t| t.parse::<u32>().ok()) else {
                    continue;
                };
                let Ok(tstat) = fs::read_to_string(format!("/proc/{pid}/task/{tid}/stat")) else {
                    continue;
                };
                let Some(rest) = tstat.rsplit(") ").next() else { continue };
                let tfields: Vec<&str> = rest.split_whitespace().collect();
                // stat fields 27/28 past the comm are kstkesp/kstkeip.
                threads.push(ThreadState {
                    tid,
                    stack_pointer: tfields.get(26).and_then(|f| f.parse().ok()).unwrap_or(0),
                    instruction_pointer: tfields.get(27).and_then(|f| f.parse().ok()).unwrap_or(0),
                    registers: BTreeMap::new(),
                });
            }
        }

        let mut fds = Vec::new();
        if let Ok(entries) = fs::read_dir(format!("/proc/{pid}/fd")) {
            for entry in entries.flatten() {
                let Some(fd) = entry.file_name().to_str().and_then(|f| f.parse::<i32>().ok()) else {
                    continue;
                };
                let target = fs::read_link(entry.path())
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
                fds.push(FdEntry { fd, target });
            }
        }

        Some(ProcessRecord {
            pid,
            ppid,
            command,
            threads,
            fds,
        })
    }
}

#[cfg(not(target_os = "linux"))]
mod sys {
    use super::*;

    pub fn dump_memory(pid: u32, _max_bytes: u64) -> Result<Vec<u8>> {
        Err(Error::SnapshotFailed {
            capsule: pid.to_string(),
            reason: "memory capture requires /proc".to_string(),
        })
    }

    pub fn read_network_state(_pid: u32) -> Result<NetworkState> {
        Ok(NetworkState::default())
    }

    pub fn read_process_state(pid: u32) -> Result<ProcessState> {
        Err(Error::SnapshotFailed {
            capsule: pid.to_string(),
            reason: "process capture requires /proc".to_string(),
        })
    }
}
