//! Capsule lifecycle operations.
//!
//! The runtime owns every kernel object a capsule needs — namespaces,
//! mounts, cgroup files — for the capsule's lifetime and guarantees
//! release on every exit path. The cluster never holds a capsule
//! directly; it addresses capsules by id through this table.
//!
//! ## Create Flow
//!
//! 1. Allocate a random URL-safe id.
//! 2. Prepare a private directory tree and extract image layers into
//!    the rootfs.
//! 3. Create a cgroup v2 directory and apply resource caps.
//! 4. On `start`, fork a child that unshares PID/NET/MOUNT/UTS (and
//!    USER when rootless), sets the hostname, mounts `/proc`, `/sys`,
//!    and `/dev/pts`, chroots into the rootfs, and execs the
//!    entrypoint with sanitized argv and env.
//!
//! Partial failures unwind: a create that dies after cgroup setup
//! removes the cgroup and the directory tree before returning.
//!
//! ## Rootless Mode
//!
//! With `rootless`, a user namespace maps the outside uid to root
//! inside. Operations that still need privileges fail with
//! `PermissionDenied` rather than degrading silently, so the
//! orchestrator can back off.

use crate::capsule::cgroup::CgroupController;
use crate::capsule::config::CapsuleConfig;
use crate::capsule::rootfs::extract_layers;
use crate::capsule::state::{Capsule, CapsuleId, CapsuleState};
use crate::constants::{CAPSULES_DIR, DEFAULT_STOP_GRACE};
use crate::error::{Error, Result};
use crate::image::ImageManifest;
use crate::store::ContentStore;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of an `exec` inside a running capsule.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

struct CapsuleRecord {
    capsule: Capsule,
    config: CapsuleConfig,
    manifest: ImageManifest,
    cgroup: Option<CgroupController>,
}

/// Host-local capsule runtime.
///
/// Thread-safe; the capsule table is behind a lock and iteration
/// copies ids so no lock is held across I/O or process waits.
pub struct CapsuleRuntime {
    store: Arc<ContentStore>,
    state_root: PathBuf,
    cgroup_root: PathBuf,
    capsules: RwLock<HashMap<CapsuleId, CapsuleRecord>>,
    /// Host ports claimed by live capsules.
    claimed_ports: Mutex<HashSet<u16>>,
    /// Device path → (exclusive, claim count).
    device_claims: Mutex<HashMap<PathBuf, (bool, usize)>>,
}

impl CapsuleRuntime {
    /// Creates a runtime storing capsule state under the store root.
    pub fn new(store: Arc<ContentStore>) -> Result<Self> {
        let state_root = store.root().join(CAPSULES_DIR);
        Self::with_roots(store, state_root, PathBuf::from(crate::constants::CGROUP_ROOT))
    }

    /// Creates a runtime with explicit state and cgroup roots (tests).
    pub fn with_roots(
        store: Arc<ContentStore>,
        state_root: PathBuf,
        cgroup_root: PathBuf,
    ) -> Result<Self> {
        fs::create_dir_all(&state_root).map_err(|e| Error::StorageError {
            path: state_root.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            store,
            state_root,
            cgroup_root,
            capsules: RwLock::new(HashMap::new()),
            claimed_ports: Mutex::new(HashSet::new()),
            device_claims: Mutex::new(HashMap::new()),
        })
    }

    /// Directory tree of one capsule.
    pub fn capsule_dir(&self, id: &CapsuleId) -> PathBuf {
        self.state_root.join(id.as_str())
    }

    /// Creates a capsule from a config and a materialized image.
    ///
    /// On any failure after partial setup, everything created so far
    /// (directories, extracted rootfs, cgroup) is released before the
    /// error propagates.
    pub fn create(&self, config: CapsuleConfig, manifest: &ImageManifest) -> Result<CapsuleId> {
        self.create_with_id(CapsuleId::generate(), config, manifest)
    }

    /// Creates a capsule under a caller-chosen id (snapshot restore).
    pub fn create_with_id(
        &self,
        id: CapsuleId,
        config: CapsuleConfig,
        manifest: &ImageManifest,
    ) -> Result<CapsuleId> {
        config.validate()?;

        self.claim_ports(&config)?;
        if let Err(e) = self.claim_devices(&config) {
            self.release_ports(&config);
            return Err(e);
        }

        let dir = self.capsule_dir(&id);
        let rootfs = dir.join("rootfs");

        let setup = (|| -> Result<CgroupController> {
            extract_layers(&manifest.layers, &rootfs, &self.store)?;
            CgroupController::create_under(&self.cgroup_root, &id, &config.resources)
        })();

        let cgroup = match setup {
            Ok(cgroup) => cgroup,
            Err(e) => {
                // Unwind partial setup; nothing attributable to the
                // capsule may survive a failed create.
                let _ = fs::remove_dir_all(&dir);
                self.release_ports(&config);
                self.release_devices(&config);
                return Err(e);
            }
        };

        let hostname = config.hostname.clone().unwrap_or_else(|| id.to_string());
        let capsule = Capsule {
            id: id.clone(),
            hostname,
            rootfs,
            working_dir: config.working_dir.clone(),
            user: config.user.clone(),
            env: config.env.clone(),
            mounts: config
                .mounts
                .iter()
                .map(|m| (m.source.clone(), m.target.clone()))
                .collect(),
            cgroup_path: Some(cgroup.path().to_path_buf()),
            pid: None,
            state: CapsuleState::Created,
        };

        info!(capsule = %id.short(), name = %config.name, "capsule created");
        self.capsules.write().expect("capsule table lock poisoned").insert(
            id.clone(),
            CapsuleRecord {
                capsule,
                config,
                manifest: manifest.clone(),
                cgroup: Some(cgroup),
            },
        );
        Ok(id)
    }

    /// Starts a created capsule and returns the init pid.
    pub async fn start(&self, id: &CapsuleId) -> Result<u32> {
        let (capsule, config) = {
            let mut table = self.capsules.write().expect("capsule table lock poisoned");
            let record = table
                .get_mut(id)
                .ok_or_else(|| Error::InvalidConfiguration(format!("unknown capsule {id}")))?;
            self.transition(&mut record.capsule, CapsuleState::Starting)?;
            (record.capsule.clone(), record.config.clone())
        };

        let spawn = {
            let capsule = capsule.clone();
            let config = config.clone();
            tokio::task::spawn_blocking(move || sys::spawn_capsule(&capsule, &config))
        };
        let outcome = spawn.await.map_err(|e| Error::ExecFailed {
            id: id.to_string(),
            reason: format!("spawn task aborted: {e}"),
        })?;

        match outcome {
            Ok(pid) => {
                let mut table = self.capsules.write().expect("capsule table lock poisoned");
                if let Some(record) = table.get_mut(id) {
                    if let Some(cgroup) = &record.cgroup {
                        // Best effort: the child also races to place itself.
                        let _ = cgroup.add_process(pid);
                    }
                    record.capsule.pid = Some(pid);
                    self.transition(&mut record.capsule, CapsuleState::Running)?;
                }
                info!(capsule = %id.short(), pid, "capsule running");
                Ok(pid)
            }
            Err(e) => {
                self.fail_and_unwind(id);
                Err(e)
            }
        }
    }

    /// Stops a capsule: SIGTERM, wait up to `grace`, then SIGKILL.
    ///
    /// After return no child process remains, the cgroup directory is
    /// removed, and the capsule's ports are released.
    pub async fn stop(&self, id: &CapsuleId, grace: Option<Duration>) -> Result<()> {
        let grace = grace.unwrap_or(DEFAULT_STOP_GRACE);
        let pid = {
            let mut table = self.capsules.write().expect("capsule table lock poisoned");
            let record = table
                .get_mut(id)
                .ok_or_else(|| Error::InvalidConfiguration(format!("unknown capsule {id}")))?;
            if !record.capsule.state.is_live() {
                debug!(capsule = %id.short(), "stop on non-live capsule is a no-op");
                return Ok(());
            }
            self.transition(&mut record.capsule, CapsuleState::Stopping)?;
            record.capsule.pid
        };

        if let Some(pid) = pid {
            let terminated = {
                let grace = grace;
                tokio::task::spawn_blocking(move || sys::terminate_gracefully(pid, grace))
                    .await
                    .map_err(|e| Error::ExecFailed {
                        id: id.to_string(),
                        reason: format!("stop task aborted: {e}"),
                    })?
            };
            if let Err(e) = terminated {
                warn!(capsule = %id.short(), error = %e, "graceful stop failed, killing cgroup");
            }
        }

        let mut table = self.capsules.write().expect("capsule table lock poisoned");
        if let Some(record) = table.get_mut(id) {
            if let Some(cgroup) = record.cgroup.take() {
                let _ = cgroup.kill_all();
                let _ = cgroup.remove();
            }
            record.capsule.pid = None;
            record.capsule.cgroup_path = None;
            self.transition(&mut record.capsule, CapsuleState::Stopped)?;
            self.release_ports(&record.config);
            self.release_devices(&record.config);
            info!(capsule = %id.short(), "capsule stopped");
        }
        Ok(())
    }

    /// Restart: stop with `grace`, then create-and-start semantics on
    /// the retained rootfs.
    pub async fn restart(&self, id: &CapsuleId, grace: Option<Duration>) -> Result<u32> {
        self.stop(id, grace).await?;
        let (config, manifest) = {
            let table = self.capsules.read().expect("capsule table lock poisoned");
            let record = table
                .get(id)
                .ok_or_else(|| Error::InvalidConfiguration(format!("unknown capsule {id}")))?;
            (record.config.clone(), record.manifest.clone())
        };
        self.remove(id)?;
        let new_id = self.create_with_id(id.clone(), config, &manifest)?;
        self.start(&new_id).await
    }

    /// Pauses a running capsule via the cgroup freezer.
    pub fn pause(&self, id: &CapsuleId) -> Result<()> {
        let mut table = self.capsules.write().expect("capsule table lock poisoned");
        let record = table
            .get_mut(id)
            .ok_or_else(|| Error::InvalidConfiguration(format!("unknown capsule {id}")))?;
        let cgroup = record
            .cgroup
            .as_ref()
            .ok_or_else(|| Error::InvalidConfiguration(format!("capsule {id} has no cgroup")))?;
        cgroup.freeze()?;
        self.transition(&mut record.capsule, CapsuleState::Paused)
    }

    /// Resumes a paused capsule.
    pub fn resume(&self, id: &CapsuleId) -> Result<()> {
        let mut table = self.capsules.write().expect("capsule table lock poisoned");
        let record = table
            .get_mut(id)
            .ok_or_else(|| Error::InvalidConfiguration(format!("unknown capsule {id}")))?;
        let cgroup = record
            .cgroup
            .as_ref()
            .ok_or_else(|| Error::InvalidConfiguration(format!("capsule {id} has no cgroup")))?;
        cgroup.thaw()?;
        self.transition(&mut record.capsule, CapsuleState::Running)
    }

    /// Runs a command inside an existing capsule's namespaces.
    pub async fn exec(&self, id: &CapsuleId, command: Vec<String>) -> Result<ExecOutcome> {
        let pid = {
            let table = self.capsules.read().expect("capsule table lock poisoned");
            let record = table
                .get(id)
                .ok_or_else(|| Error::InvalidConfiguration(format!("unknown capsule {id}")))?;
            record.capsule.pid.ok_or_else(|| Error::ExecFailed {
                id: id.to_string(),
                reason: "capsule has no running init process".to_string(),
            })?
        };

        let id_str = id.to_string();
        tokio::task::spawn_blocking(move || sys::exec_in_namespaces(pid, &command, &id_str))
            .await
            .map_err(|e| Error::ExecFailed {
                id: id.to_string(),
                reason: format!("exec task aborted: {e}"),
            })?
    }

    /// Removes a stopped capsule's state from disk and the table.
    pub fn remove(&self, id: &CapsuleId) -> Result<()> {
        let mut table = self.capsules.write().expect("capsule table lock poisoned");
        if let Some(record) = table.get(id) {
            if record.capsule.state.is_live() {
                return Err(Error::InvalidConfiguration(format!(
                    "capsule {id} is {}; stop it first",
                    record.capsule.state
                )));
            }
            let _ = fs::remove_dir_all(self.capsule_dir(id));
            if let Some(record) = table.remove(id) {
                if let Some(cgroup) = record.cgroup {
                    let _ = cgroup.remove();
                }
                self.release_ports(&record.config);
                self.release_devices(&record.config);
            }
            debug!(capsule = %id.short(), "capsule removed");
        }
        Ok(())
    }

    /// Snapshot view of one capsule.
    pub fn inspect(&self, id: &CapsuleId) -> Option<Capsule> {
        self.capsules
            .read()
            .expect("capsule table lock poisoned")
            .get(id)
            .map(|r| r.capsule.clone())
    }

    /// Stored config for a capsule (migration re-creates from it).
    pub fn config_of(&self, id: &CapsuleId) -> Option<(CapsuleConfig, ImageManifest)> {
        self.capsules
            .read()
            .expect("capsule table lock poisoned")
            .get(id)
            .map(|r| (r.config.clone(), r.manifest.clone()))
    }

    /// Ids of all known capsules (copied, no lock held afterwards).
    pub fn list(&self) -> Vec<CapsuleId> {
        self.capsules
            .read()
            .expect("capsule table lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Cgroup controller of a capsule, for freezer-based migration.
    pub(crate) fn cgroup_of(&self, id: &CapsuleId) -> Option<CgroupController> {
        self.capsules
            .read()
            .expect("capsule table lock poisoned")
            .get(id)
            .and_then(|r| r.cgroup.clone())
    }

    fn transition(&self, capsule: &mut Capsule, next: CapsuleState) -> Result<()> {
        if !capsule.state.can_transition(next) {
            return Err(Error::InvalidConfiguration(format!(
                "capsule {} cannot go {} -> {next}",
                capsule.id, capsule.state
            )));
        }
        debug!(capsule = %capsule.id.short(), from = %capsule.state, to = %next, "state transition");
        capsule.state = next;
        Ok(())
    }

    /// Marks a capsule failed and releases its kernel objects.
    fn fail_and_unwind(&self, id: &CapsuleId) {
        let mut table = self.capsules.write().expect("capsule table lock poisoned");
        if let Some(record) = table.get_mut(id) {
            if let Some(cgroup) = record.cgroup.take() {
                let _ = cgroup.kill_all();
                let _ = cgroup.remove();
            }
            record.capsule.pid = None;
            record.capsule.cgroup_path = None;
            record.capsule.state = CapsuleState::Failed;
            self.release_ports(&record.config);
            self.release_devices(&record.config);
            warn!(capsule = %id.short(), "capsule failed, kernel objects released");
        }
    }

    fn claim_ports(&self, config: &CapsuleConfig) -> Result<()> {
        let mut claimed = self.claimed_ports.lock().expect("port set lock poisoned");
        for mapping in &config.ports {
            if claimed.contains(&mapping.host) {
                return Err(Error::InvalidConfiguration(format!(
                    "host port {} already in use",
                    mapping.host
                )));
            }
        }
        for mapping in &config.ports {
            claimed.insert(mapping.host);
        }
        Ok(())
    }

    fn release_ports(&self, config: &CapsuleConfig) {
        let mut claimed = self.claimed_ports.lock().expect("port set lock poisoned");
        for mapping in &config.ports {
            claimed.remove(&mapping.host);
        }
    }

    fn claim_devices(&self, config: &CapsuleConfig) -> Result<()> {
        let mut claims = self.device_claims.lock().expect("device claims lock poisoned");
        for device in &config.devices {
            match claims.get(&device.path) {
                Some((true, _)) => {
                    return Err(Error::InvalidConfiguration(format!(
                        "device {} is exclusively attached",
                        device.path.display()
                    )));
                }
                Some((false, _)) if !device.shared => {
                    return Err(Error::InvalidConfiguration(format!(
                        "device {} is shared elsewhere; exclusive attach denied",
                        device.path.display()
                    )));
                }
                _ => {}
            }
        }
        for device in &config.devices {
            let entry = claims.entry(device.path.clone()).or_insert((!device.shared, 0));
            entry.1 += 1;
        }
        Ok(())
    }

    fn release_devices(&self, config: &CapsuleConfig) {
        let mut claims = self.device_claims.lock().expect("device claims lock poisoned");
        for device in &config.devices {
            if let Some(entry) = claims.get_mut(&device.path) {
                entry.1 = entry.1.saturating_sub(1);
                if entry.1 == 0 {
                    claims.remove(&device.path);
                }
            }
        }
    }
}

// =============================================================================
// Linux Process Layer
// =============================================================================

#[cfg(target_os = "linux")]
mod sys {
    use super::*;
    use nix::mount::{MsFlags, mount};
    use nix::sched::{CloneFlags, unshare};
    use nix::sys::signal::{Signal, kill};
    use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
    use nix::unistd::{ForkResult, Pid, chdir, chroot, execvp, fork, getgid, getuid, sethostname};
    use std::ffi::CString;
    use std::io::Write;
    use std::os::unix::fs::MetadataExt;
    use std::time::Instant;

    /// Forks and sets up the capsule's namespaces in the child.
    ///
    /// The child performs: unshare, hostname, bind mounts, pseudo
    /// filesystems, chroot, chdir, exec. Any child-side failure exits
    /// 127 and is reported by the parent as a spawn failure.
    pub fn spawn_capsule(capsule: &Capsule, config: &CapsuleConfig) -> Result<u32> {
        // SAFETY: the child only calls exec-or-exit after fork; the
        // parent side touches no shared state before returning.
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                // Give the child a beat to fail fast on unshare errors.
                std::thread::sleep(Duration::from_millis(20));
                match waitpid(child, Some(WaitPidFlag::WNOHANG)) {
                    Ok(WaitStatus::Exited(_, code)) if code != 0 => Err(Error::NamespaceCreationFailed {
                        id: capsule.id.to_string(),
                        reason: format!("capsule init exited {code} during setup"),
                    }),
                    _ => Ok(child.as_raw() as u32),
                }
            }
            Ok(ForkResult::Child) => {
                let code = match child_setup(capsule, config) {
                    Ok(never) => match never {},
                    Err(_) => 127,
                };
                unsafe { libc::_exit(code) }
            }
            Err(e) => Err(Error::NamespaceCreationFailed {
                id: capsule.id.to_string(),
                reason: format!("fork: {e}"),
            }),
        }
    }

    /// Child-side setup; returns only on error.
    fn child_setup(capsule: &Capsule, config: &CapsuleConfig) -> Result<std::convert::Infallible> {
        let mut flags = CloneFlags::CLONE_NEWPID
            | CloneFlags::CLONE_NEWNET
            | CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWUTS;
        if config.rootless {
            flags |= CloneFlags::CLONE_NEWUSER;
        }

        unshare(flags).map_err(|e| {
            if e == nix::errno::Errno::EPERM {
                Error::PermissionDenied(format!("unshare requires privileges: {e}"))
            } else {
                Error::NamespaceCreationFailed {
                    id: capsule.id.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;

        if config.rootless {
            write_id_maps()?;
        }

        sethostname(&capsule.hostname).map_err(|e| Error::NamespaceCreationFailed {
            id: capsule.id.to_string(),
            reason: format!("sethostname: {e}"),
        })?;

        // Make mount changes private to this namespace before anything
        // else; otherwise binds would leak back to the host.
        mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_REC | MsFlags::MS_PRIVATE,
            None::<&str>,
        )
        .map_err(|e| Error::MountFailed {
            target: "/".to_string(),
            reason: e.to_string(),
        })?;

        for (source, target) in &capsule.mounts {
            let dest = capsule
                .rootfs
                .join(target.strip_prefix("/").unwrap_or(target.as_path()));
            std::fs::create_dir_all(&dest).ok();
            mount(
                Some(source.as_path()),
                &dest,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REC,
                None::<&str>,
            )
            .map_err(|e| Error::MountFailed {
                target: target.display().to_string(),
                reason: e.to_string(),
            })?;
        }

        mount_pseudo(&capsule.rootfs, "proc", "proc")?;
        mount_pseudo(&capsule.rootfs, "sys", "sysfs")?;
        mount_pseudo(&capsule.rootfs, "dev/pts", "devpts")?;

        chroot(&capsule.rootfs).map_err(|e| Error::NamespaceCreationFailed {
            id: capsule.id.to_string(),
            reason: format!("chroot: {e}"),
        })?;
        chdir(&capsule.working_dir).map_err(|e| Error::NamespaceCreationFailed {
            id: capsule.id.to_string(),
            reason: format!("chdir: {e}"),
        })?;

        let argv: Vec<CString> = config
            .command
            .iter()
            .filter_map(|a| CString::new(a.as_str()).ok())
            .collect();
        if argv.is_empty() {
            return Err(Error::ExecFailed {
                id: capsule.id.to_string(),
                reason: "empty argv after sanitization".to_string(),
            });
        }

        // Sanitized env: only what the config declares, plus hostname.
        let inherited: Vec<String> = std::env::vars().map(|(key, _)| key).collect();
        for key in inherited {
            if !capsule.env.contains_key(&key) {
                unsafe { std::env::remove_var(&key) };
            }
        }
        for (key, value) in &capsule.env {
            unsafe { std::env::set_var(key, value) };
        }
        unsafe { std::env::set_var("HOSTNAME", &capsule.hostname) };

        execvp(&argv[0], &argv).map_err(|e| Error::ExecFailed {
            id: capsule.id.to_string(),
            reason: format!("execvp: {e}"),
        })?;
        unreachable!("execvp returned without error")
    }

    fn mount_pseudo(rootfs: &Path, rel: &str, fstype: &str) -> Result<()> {
        let target = rootfs.join(rel);
        std::fs::create_dir_all(&target).ok();
        mount(
            Some(fstype),
            &target,
            Some(fstype),
            MsFlags::empty(),
            None::<&str>,
        )
        .map_err(|e| Error::MountFailed {
            target: format!("/{rel}"),
            reason: e.to_string(),
        })
    }

    /// Maps the outside identity to root inside a fresh user namespace.
    fn write_id_maps() -> Result<()> {
        let uid = getuid().as_raw();
        let gid = getgid().as_raw();

        let write = |path: &str, content: String| -> std::io::Result<()> {
            let mut f = std::fs::OpenOptions::new().write(true).open(path)?;
            f.write_all(content.as_bytes())
        };

        write("/proc/self/uid_map", format!("0 {uid} 1\n"))
            .map_err(|e| Error::PermissionDenied(format!("uid_map: {e}")))?;
        // setgroups must be denied before an unprivileged gid_map write.
        write("/proc/self/setgroups", "deny\n".to_string())
            .map_err(|e| Error::PermissionDenied(format!("setgroups: {e}")))?;
        write("/proc/self/gid_map", format!("0 {gid} 1\n"))
            .map_err(|e| Error::PermissionDenied(format!("gid_map: {e}")))?;
        Ok(())
    }

    /// SIGTERM, poll until exit or `grace` elapses, then SIGKILL.
    pub fn terminate_gracefully(pid: u32, grace: Duration) -> Result<()> {
        let target = Pid::from_raw(pid as i32);
        match kill(target, Signal::SIGTERM) {
            Ok(()) => {}
            Err(nix::errno::Errno::ESRCH) => return Ok(()),
            Err(e) => {
                return Err(Error::ExecFailed {
                    id: pid.to_string(),
                    reason: format!("SIGTERM: {e}"),
                });
            }
        }

        let deadline = Instant::now() + grace;
        loop {
            match waitpid(target, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {}
                // Exited, reaped elsewhere, or never ours: done.
                _ => return Ok(()),
            }
            if Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        let _ = kill(target, Signal::SIGKILL);
        let _ = waitpid(target, None);
        Ok(())
    }

    /// Joins the target's namespaces and runs a command to completion.
    pub fn exec_in_namespaces(pid: u32, command: &[String], capsule_id: &str) -> Result<ExecOutcome> {
        use std::process::Command;

        // Entering via /proc/<pid>/ns keeps this file free of raw fds.
        let ns_dir = PathBuf::from(format!("/proc/{pid}/ns"));
        if std::fs::metadata(&ns_dir).map(|m| m.ino()).is_err() {
            return Err(Error::ExecFailed {
                id: capsule_id.to_string(),
                reason: format!("init process {pid} has no namespace directory"),
            });
        }

        let output = Command::new("nsenter")
            .arg(format!("--target={pid}"))
            .args(["--mount", "--uts", "--net", "--pid", "--root"])
            .arg("--")
            .args(command)
            .output()
            .map_err(|e| Error::ExecFailed {
                id: capsule_id.to_string(),
                reason: format!("nsenter: {e}"),
            })?;

        Ok(ExecOutcome {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

// =============================================================================
// Non-Linux Stub
// =============================================================================

#[cfg(not(target_os = "linux"))]
mod sys {
    use super::*;

    pub fn spawn_capsule(capsule: &Capsule, _config: &CapsuleConfig) -> Result<u32> {
        Err(Error::NamespaceCreationFailed {
            id: capsule.id.to_string(),
            reason: "linux namespaces unavailable on this platform".to_string(),
        })
    }

    pub fn terminate_gracefully(_pid: u32, _grace: Duration) -> Result<()> {
        Ok(())
    }

    pub fn exec_in_namespaces(_pid: u32, _command: &[String], capsule_id: &str) -> Result<ExecOutcome> {
        Err(Error::ExecFailed {
            id: capsule_id.to_string(),
            reason: "exec requires linux namespaces".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::ObjectKind;
    use tempfile::TempDir;

    fn runtime_with_manifest() -> (TempDir, CapsuleRuntime, ImageManifest) {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(ContentStore::open(temp.path().join("store")).unwrap());
        let config_digest = store.put(b"{}", ObjectKind::Config).unwrap();
        let manifest_digest = store.put(b"{\"layers\":[]}", ObjectKind::Manifest).unwrap();
        let manifest = ImageManifest {
            name: "base".to_string(),
            tag: "test".to_string(),
            digest: manifest_digest,
            layers: Vec::new(),
            config_digest,
        };
        let runtime = CapsuleRuntime::with_roots(
            store,
            temp.path().join("capsules"),
            temp.path().join("cgroup"),
        )
        .unwrap();
        (temp, runtime, manifest)
    }

    #[test]
    fn create_allocates_dir_and_cgroup() {
        let (_temp, runtime, manifest) = runtime_with_manifest();
        let config = CapsuleConfig::new("web", vec!["/bin/sh".to_string()]);
        let id = runtime.create(config, &manifest).unwrap();

        let capsule = runtime.inspect(&id).unwrap();
        assert_eq!(capsule.state, CapsuleState::Created);
        assert_eq!(capsule.hostname, id.to_string());
        assert!(capsule.cgroup_path.as_ref().unwrap().exists());
        assert!(runtime.capsule_dir(&id).join("rootfs").exists());
    }

    #[test]
    fn duplicate_host_port_is_rejected_and_released_on_failure() {
        let (_temp, runtime, manifest) = runtime_with_manifest();
        let mut a = CapsuleConfig::new("a", vec!["/bin/sh".to_string()]);
        a.ports = vec![crate::capsule::PortMapping { host: 8080, capsule: 80 }];
        let mut b = CapsuleConfig::new("b", vec!["/bin/sh".to_string()]);
        b.ports = vec![crate::capsule::PortMapping { host: 8080, capsule: 80 }];

        let id = runtime.create(a, &manifest).unwrap();
        assert!(runtime.create(b.clone(), &manifest).is_err());

        // Removing the holder frees the port for the next create.
        runtime.remove(&id).unwrap();
        runtime.create(b, &manifest).unwrap();
    }

    #[test]
    fn exclusive_device_conflicts() {
        let (_temp, runtime, manifest) = runtime_with_manifest();
        let mut a = CapsuleConfig::new("a", vec!["/bin/sh".to_string()]);
        a.devices = vec![crate::capsule::DeviceSpec {
            path: PathBuf::from("/dev/fb0"),
            shared: false,
        }];
        let mut b = CapsuleConfig::new("b", vec!["/bin/sh".to_string()]);
        b.devices = a.devices.clone();

        runtime.create(a, &manifest).unwrap();
        assert!(runtime.create(b, &manifest).is_err());
    }

    #[test]
    fn shared_device_allows_concurrent_attach() {
        let (_temp, runtime, manifest) = runtime_with_manifest();
        let device = crate::capsule::DeviceSpec {
            path: PathBuf::from("/dev/dri/renderD128"),
            shared: true,
        };
        let mut a = CapsuleConfig::new("a", vec!["/bin/sh".to_string()]);
        a.devices = vec![device.clone()];
        let mut b = CapsuleConfig::new("b", vec!["/bin/sh".to_string()]);
        b.devices = vec![device];

        runtime.create(a, &manifest).unwrap();
        runtime.create(b, &manifest).unwrap();
    }

    #[test]
    fn remove_refuses_live_states() {
        let (_temp, runtime, manifest) = runtime_with_manifest();
        let config = CapsuleConfig::new("web", vec!["/bin/sh".to_string()]);
        let id = runtime.create(config, &manifest).unwrap();
        // Created is not live; removal is allowed.
        runtime.remove(&id).unwrap();
        assert!(runtime.inspect(&id).is_none());
    }
}
