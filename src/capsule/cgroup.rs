//! Cgroup v2 control for capsules.
//!
//! Each capsule gets a directory under `<root>/strato.slice/<id>` with
//! `memory.max`, `cpu.max`, and `pids.max` written from its resource
//! limits. The controller also drives the freezer for pause/resume and
//! `cgroup.kill` for hard teardown.
//!
//! Only the capsule's controller mutates these files.

use crate::capsule::config::ResourceLimits;
use crate::capsule::state::CapsuleId;
use crate::constants::{CGROUP_ROOT, CGROUP_SUBTREE};
use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// CPU period used for `cpu.max` quota computation (microseconds).
const CPU_PERIOD_USEC: u64 = 100_000;

/// Handle on one capsule's cgroup directory.
#[derive(Debug, Clone)]
pub struct CgroupController {
    path: PathBuf,
}

impl CgroupController {
    /// Creates the cgroup for a capsule under the default hierarchy.
    pub fn create(id: &CapsuleId, limits: &ResourceLimits) -> Result<Self> {
        Self::create_under(Path::new(CGROUP_ROOT), id, limits)
    }

    /// Creates the cgroup under an explicit hierarchy root.
    ///
    /// Tests point this at a scratch directory; the file protocol is
    /// identical.
    pub fn create_under(root: &Path, id: &CapsuleId, limits: &ResourceLimits) -> Result<Self> {
        let path = root.join(CGROUP_SUBTREE).join(id.as_str());
        fs::create_dir_all(&path).map_err(|e| Error::CgroupCreationFailed {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        let controller = Self { path };
        controller.apply_limits(limits)?;
        debug!(capsule = %id.short(), path = %controller.path.display(), "cgroup created");
        Ok(controller)
    }

    /// Reattaches to an existing cgroup directory.
    pub fn attach(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes resource caps into the controller files.
    pub fn apply_limits(&self, limits: &ResourceLimits) -> Result<()> {
        // memory.max of zero would make the cgroup unschedulable;
        // config validation rejects it before we get here.
        self.write_file("memory.max", &limits.memory_bytes.to_string())?;

        let quota = (limits.cpu_cores * CPU_PERIOD_USEC as f64) as u64;
        self.write_file("cpu.max", &format!("{quota} {CPU_PERIOD_USEC}"))?;
        self.write_file("pids.max", &limits.pids_max.to_string())?;
        Ok(())
    }

    /// Moves a process into the cgroup.
    pub fn add_process(&self, pid: u32) -> Result<()> {
        self.write_file("cgroup.procs", &pid.to_string())
    }

    /// Lists member pids. Missing file reads as empty (already removed).
    pub fn procs(&self) -> Vec<u32> {
        fs::read_to_string(self.path.join("cgroup.procs"))
            .map(|s| s.lines().filter_map(|l| l.trim().parse().ok()).collect())
            .unwrap_or_default()
    }

    /// Freezes every process in the cgroup (SIGSTOP semantics).
    pub fn freeze(&self) -> Result<()> {
        self.write_file("cgroup.freeze", "1")
    }

    /// Thaws a frozen cgroup.
    pub fn thaw(&self) -> Result<()> {
        self.write_file("cgroup.freeze", "0")
    }

    /// Kills every member process via the kernel, bypassing signals.
    pub fn kill_all(&self) -> Result<()> {
        self.write_file("cgroup.kill", "1")
    }

    /// Removes the cgroup directory. The kernel refuses while members
    /// remain, so teardown kills first.
    pub fn remove(&self) -> Result<()> {
        match fs::remove_dir(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "cgroup removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "cgroup removal failed");
                Err(Error::CgroupCreationFailed {
                    path: self.path.clone(),
                    reason: format!("removal failed: {e}"),
                })
            }
        }
    }

    fn write_file(&self, name: &str, value: &str) -> Result<()> {
        let file = self.path.join(name);
        fs::write(&file, value).map_err(|e| Error::CgroupCreationFailed {
            path: file,
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn creates_and_writes_limit_files() {
        let root = TempDir::new().unwrap();
        let id = CapsuleId::generate();
        let limits = ResourceLimits {
            cpu_cores: 2.0,
            memory_bytes: 512 * 1024 * 1024,
            storage_bytes: 0,
            pids_max: 128,
        };
        let cg = CgroupController::create_under(root.path(), &id, &limits).unwrap();

        let mem = fs::read_to_string(cg.path().join("memory.max")).unwrap();
        assert_eq!(mem, (512u64 * 1024 * 1024).to_string());
        let cpu = fs::read_to_string(cg.path().join("cpu.max")).unwrap();
        assert_eq!(cpu, "200000 100000");
        let pids = fs::read_to_string(cg.path().join("pids.max")).unwrap();
        assert_eq!(pids, "128");
    }

    #[test]
    fn freeze_thaw_protocol() {
        let root = TempDir::new().unwrap();
        let id = CapsuleId::generate();
        let cg = CgroupController::create_under(root.path(), &id, &ResourceLimits::default()).unwrap();

        cg.freeze().unwrap();
        assert_eq!(fs::read_to_string(cg.path().join("cgroup.freeze")).unwrap(), "1");
        cg.thaw().unwrap();
        assert_eq!(fs::read_to_string(cg.path().join("cgroup.freeze")).unwrap(), "0");
    }

    #[test]
    fn remove_missing_cgroup_is_ok() {
        let root = TempDir::new().unwrap();
        let id = CapsuleId::generate();
        let cg = CgroupController::create_under(root.path(), &id, &ResourceLimits::default()).unwrap();
        // Empty scratch cgroup contains only files we wrote.
        for f in ["memory.max", "cpu.max", "pids.max"] {
            let _ = fs::remove_file(cg.path().join(f));
        }
        cg.remove().unwrap();
        cg.remove().unwrap();
    }
}
