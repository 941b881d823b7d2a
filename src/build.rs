//! # Build Cache & Reproducible Builder
//!
//! Maps a deterministic fingerprint of a build's inputs to a stored
//! output manifest, so an unchanged build never re-executes.
//!
//! ## Fingerprinting
//!
//! The fingerprint hashes a canonical serialization of the spec: name,
//! version, command, target system, input digests sorted by printable
//! form, and environment keys sorted lexicographically with their
//! values. Input ordering and env declaration order do not affect the
//! fingerprint.
//!
//! ## Build Protocol
//!
//! 1. Fingerprint the spec and consult the cache; a hit loads the
//!    output manifest from the content store and returns its outputs.
//! 2. On a miss, materialize an isolated build directory: inputs
//!    copied in under their role names, environment pruned to the
//!    allow-list of deterministic base variables (POSIX locale, UTC,
//!    fixed `PATH`, `HOME` set to the build directory) with the
//!    spec's env overlaid on top.
//! 3. Execute the command inside fresh PID and mount namespaces, the
//!    same discipline the capsule runtime applies at start. A host
//!    that refuses `unshare` gets a warning and an unsandboxed run,
//!    so rootless callers can decide whether to accept the result.
//!    Non-zero exit is `BuildFailed`.
//! 4. Collect declared outputs into the content store and write a
//!    `BUILD_OUTPUTS_v1` manifest blob; cache its digest under the
//!    fingerprint.
//!
//! ## Reproducibility
//!
//! For specs marked reproducible, a validation pass re-executes the
//! build in a second fresh directory and compares output digest sets;
//! any difference is `NonDeterministic`. The pass is controlled by
//! [`BuildOptions::verify_reproducible`].

use crate::constants::{BUILD_ENV_ALLOWLIST, BUILD_OUTPUTS_HEADER, BUILD_PATH, BUILD_TIMEOUT, BUILDS_DIR};
use crate::digest::{Digest, ObjectKind};
use crate::error::{Error, Result};
use crate::store::ContentStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

// =============================================================================
// Build Spec
// =============================================================================

/// One declared build input: a content-store object bound to a role
/// name inside the build directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInput {
    /// File name the input is materialized under.
    pub role: String,
    /// Content digest of the input bytes.
    pub digest: Digest,
    /// Kind recorded when the input was stored.
    pub kind: ObjectKind,
}

/// One declared build output, collected by path after the command runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDecl {
    /// Path of the output relative to the build directory.
    pub name: String,
    /// Kind to store the output under.
    pub kind: ObjectKind,
}

/// A deterministic build description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSpec {
    pub name: String,
    pub version: String,
    /// Inputs; order is irrelevant to the fingerprint.
    pub inputs: Vec<BuildInput>,
    /// Outputs in declaration order.
    pub outputs: Vec<OutputDecl>,
    /// Shell command executed in the build directory.
    pub command: String,
    /// Environment overlay; keys must be unique.
    pub env: BTreeMap<String, String>,
    /// Target system tag (e.g. `x86_64-linux`).
    pub target_system: String,
    /// Whether equal fingerprints must produce equal outputs.
    pub reproducible: bool,
}

impl BuildSpec {
    /// Validates structural requirements before fingerprinting.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidBuildSpec {
                name: self.name.clone(),
                reason: "empty name".to_string(),
            });
        }
        if self.command.trim().is_empty() {
            return Err(Error::InvalidBuildSpec {
                name: self.name.clone(),
                reason: "empty command".to_string(),
            });
        }
        if self.outputs.is_empty() {
            return Err(Error::InvalidBuildSpec {
                name: self.name.clone(),
                reason: "no declared outputs".to_string(),
            });
        }
        for input in &self.inputs {
            if input.role.contains('/') || input.role.contains("..") {
                return Err(Error::InvalidBuildSpec {
                    name: self.name.clone(),
                    reason: format!("input role '{}' must be a bare file name", input.role),
                });
            }
        }
        for output in &self.outputs {
            if Path::new(&output.name).is_absolute() || output.name.contains("..") {
                return Err(Error::InvalidBuildSpec {
                    name: self.name.clone(),
                    reason: format!("output path '{}' escapes the build directory", output.name),
                });
            }
        }
        Ok(())
    }

    /// Computes the canonical input fingerprint.
    ///
    /// Two specs that differ only in input declaration order or env
    /// declaration order produce the same fingerprint.
    pub fn fingerprint(&self) -> Digest {
        let mut hasher = Sha256::new();
        hasher.update(b"strato-build-v1\n");
        hasher.update(self.name.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.version.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.command.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.target_system.as_bytes());
        hasher.update(b"\n");

        let mut digests: Vec<String> = self.inputs.iter().map(|i| i.digest.to_string()).collect();
        digests.sort();
        for d in digests {
            hasher.update(d.as_bytes());
            hasher.update(b"\n");
        }

        // BTreeMap iterates keys lexicographically.
        for (key, value) in &self.env {
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(b"\n");
        }

        let hash = hasher.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&hash);
        // Round-trip through printable form to stay a plain Digest.
        format!("sha256:{}", hex::encode(bytes))
            .parse()
            .expect("fingerprint is a well-formed digest")
    }
}

// =============================================================================
// Build Cache
// =============================================================================

/// Cache record mapping an input fingerprint to an output manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildCacheEntry {
    pub input_fingerprint: Digest,
    /// Digest of the `BUILD_OUTPUTS_v1` manifest in the content store.
    pub output_digest: Digest,
    pub taken_at: DateTime<Utc>,
    pub build_ms: u64,
    pub success: bool,
}

/// In-process build cache keyed by input fingerprint.
///
/// Repeated inserts for the same fingerprint overwrite only when the
/// incoming entry is successful; a failed build never clobbers a good
/// cached result.
#[derive(Default)]
pub struct BuildCache {
    entries: RwLock<HashMap<Digest, BuildCacheEntry>>,
}

impl BuildCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up an entry; only successful entries count as hits.
    pub fn lookup(&self, fingerprint: &Digest) -> Option<BuildCacheEntry> {
        self.entries
            .read()
            .expect("build cache lock poisoned")
            .get(fingerprint)
            .filter(|e| e.success)
            .cloned()
    }

    /// Inserts an entry under the idempotence rule.
    pub fn insert(&self, entry: BuildCacheEntry) {
        let mut entries = self.entries.write().expect("build cache lock poisoned");
        match entries.get(&entry.input_fingerprint) {
            Some(_) if !entry.success => {
                debug!(fingerprint = %entry.input_fingerprint, "failed build does not overwrite cache");
            }
            _ => {
                entries.insert(entry.input_fingerprint, entry);
            }
        }
    }

    /// Number of cached fingerprints.
    pub fn len(&self) -> usize {
        self.entries.read().expect("build cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Builder
// =============================================================================

/// A collected build output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOutput {
    pub name: String,
    pub digest: Digest,
    pub kind: ObjectKind,
    pub size: u64,
}

/// Result of a completed (or cache-satisfied) build.
#[derive(Debug, Clone)]
pub struct BuildResult {
    /// Digest of the output manifest blob.
    pub manifest_digest: Digest,
    pub outputs: Vec<BuildOutput>,
    /// True when satisfied from cache without executing.
    pub cached: bool,
    pub build_ms: u64,
}

/// Knobs for a build run.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Re-execute reproducible builds and compare output digests.
    pub verify_reproducible: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            verify_reproducible: true,
        }
    }
}

/// Executes build specs against a content store with caching.
pub struct Builder {
    store: Arc<ContentStore>,
    cache: Arc<BuildCache>,
    workspace_root: PathBuf,
}

impl Builder {
    /// Creates a builder whose workspaces live under the store root.
    pub fn new(store: Arc<ContentStore>, cache: Arc<BuildCache>) -> Result<Self> {
        let workspace_root = store.root().join(BUILDS_DIR);
        fs::create_dir_all(&workspace_root).map_err(|e| Error::StorageError {
            path: workspace_root.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            store,
            cache,
            workspace_root,
        })
    }

    /// Builds a spec, consulting the cache first.
    pub async fn build(&self, spec: &BuildSpec) -> Result<BuildResult> {
        self.build_with_options(spec, &BuildOptions::default()).await
    }

    /// Builds a spec with explicit options.
    pub async fn build_with_options(
        &self,
        spec: &BuildSpec,
        options: &BuildOptions,
    ) -> Result<BuildResult> {
        spec.validate()?;
        let fingerprint = spec.fingerprint();

        if let Some(entry) = self.cache.lookup(&fingerprint) {
            debug!(name = %spec.name, %fingerprint, "build cache hit");
            let outputs = self.load_output_manifest(&entry.output_digest)?;
            return Ok(BuildResult {
                manifest_digest: entry.output_digest,
                outputs,
                cached: true,
                build_ms: 0,
            });
        }

        // Inputs must resolve before any side effect.
        for input in &spec.inputs {
            if !self.store.contains(&input.digest) {
                return Err(Error::DependencyNotFound {
                    digest: input.digest.to_string(),
                });
            }
        }

        info!(name = %spec.name, %fingerprint, "build cache miss, executing");
        let started = Instant::now();
        let outputs = self.execute_pass(spec).await?;

        if spec.reproducible && options.verify_reproducible {
            let replay = self.execute_pass(spec).await?;
            for (first, second) in outputs.iter().zip(replay.iter()) {
                if first.digest != second.digest {
                    warn!(
                        name = %spec.name,
                        output = %first.name,
                        first = %first.digest,
                        second = %second.digest,
                        "reproducibility validation failed"
                    );
                    return Err(Error::NonDeterministic {
                        name: spec.name.clone(),
                        output: first.name.clone(),
                    });
                }
            }
        }

        let build_ms = started.elapsed().as_millis() as u64;
        let manifest_digest = self.store_output_manifest(spec, &outputs)?;

        self.cache.insert(BuildCacheEntry {
            input_fingerprint: fingerprint,
            output_digest: manifest_digest,
            taken_at: Utc::now(),
            build_ms,
            success: true,
        });

        info!(name = %spec.name, %manifest_digest, build_ms, "build complete");
        Ok(BuildResult {
            manifest_digest,
            outputs,
            cached: false,
            build_ms,
        })
    }

    /// Runs one full materialize-execute-collect pass in a fresh dir.
    async fn execute_pass(&self, spec: &BuildSpec) -> Result<Vec<BuildOutput>> {
        let build_dir = self
            .workspace_root
            .join(format!("{}-{}", spec.name, Uuid::new_v4().simple()));
        fs::create_dir_all(&build_dir).map_err(|e| Error::StorageError {
            path: build_dir.clone(),
            reason: e.to_string(),
        })?;

        let result = self.run_in_dir(spec, &build_dir).await;
        // The workspace is scratch either way.
        let _ = fs::remove_dir_all(&build_dir);
        result
    }

    async fn run_in_dir(&self, spec: &BuildSpec, build_dir: &Path) -> Result<Vec<BuildOutput>> {
        for input in &spec.inputs {
            let data = self.store.get(&input.digest)?;
            let dest = build_dir.join(&input.role);
            fs::write(&dest, data).map_err(|e| Error::StorageError {
                path: dest,
                reason: e.to_string(),
            })?;
        }

        // Deterministic base environment, pruned to the allow-list;
        // the spec's env wins on overlap.
        let mut env = base_build_env(build_dir);
        for (key, value) in &spec.env {
            env.insert(key.clone(), value.clone());
        }

        let output = match self.execute_command(spec, build_dir, &env, true).await {
            Err(Error::PermissionDenied(reason)) => {
                // Rootless hosts cannot unshare; the caller decides
                // whether an unsandboxed result is acceptable.
                warn!(name = %spec.name, %reason, "build sandbox unavailable, running unsandboxed");
                self.execute_command(spec, build_dir, &env, false).await?
            }
            other => other?,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::BuildFailed {
                name: spec.name.clone(),
                reason: format!(
                    "command exited {}: {}",
                    output.status.code().unwrap_or(-1),
                    stderr.trim()
                ),
            });
        }

        let mut outputs = Vec::with_capacity(spec.outputs.len());
        for decl in &spec.outputs {
            let path = build_dir.join(&decl.name);
            let data = fs::read(&path).map_err(|_| {
                Error::ValidationFailed(format!("declared output '{}' was not produced", decl.name))
            })?;
            let digest = self.store.put(&data, decl.kind)?;
            outputs.push(BuildOutput {
                name: decl.name.clone(),
                digest,
                kind: decl.kind,
                size: data.len() as u64,
            });
        }
        Ok(outputs)
    }

    /// Spawns the build command, sandboxed when `sandboxed` is set.
    ///
    /// A sandboxed spawn that the kernel rejects for lack of
    /// privileges is reported as `PermissionDenied` so the caller can
    /// back off to an unsandboxed run.
    async fn execute_command(
        &self,
        spec: &BuildSpec,
        build_dir: &Path,
        env: &BTreeMap<String, String>,
        sandboxed: bool,
    ) -> Result<std::process::Output> {
        let mut command = tokio::process::Command::new("/bin/sh");
        if sandboxed {
            // The PID namespace only covers children of the unshared
            // process, and its first child is the namespace init: if
            // that child exited, no further forks would succeed. The
            // extra shell layer (forced to fork by the compound
            // command) makes an inner shell the init, alive for the
            // whole script.
            command.args(["-c", r#"/bin/sh -c "$1"; exit $?"#, "sh", spec.command.as_str()]);
            isolate(&mut command);
        } else {
            command.arg("-c").arg(&spec.command);
        }
        command.current_dir(build_dir).env_clear().envs(env);

        tokio::time::timeout(BUILD_TIMEOUT, command.output())
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("build {}", spec.name),
                duration: BUILD_TIMEOUT,
            })?
            .map_err(|e| {
                if sandboxed && e.kind() == std::io::ErrorKind::PermissionDenied {
                    Error::PermissionDenied(format!("unshare for build sandbox: {e}"))
                } else {
                    Error::BuildFailed {
                        name: spec.name.clone(),
                        reason: format!("failed to spawn: {e}"),
                    }
                }
            })
    }

    /// Writes the `BUILD_OUTPUTS_v1` manifest blob for a completed build.
    fn store_output_manifest(&self, spec: &BuildSpec, outputs: &[BuildOutput]) -> Result<Digest> {
        let mut text = String::new();
        text.push_str(BUILD_OUTPUTS_HEADER);
        text.push('\n');
        text.push_str(&format!("build:{}\n", spec.name));
        text.push_str(&format!("version:{}\n", spec.version));
        text.push_str(&format!("system:{}\n", spec.target_system));
        for output in outputs {
            text.push_str(&format!("{}:{}\n", output.name, output.digest));
        }
        self.store.put(text.as_bytes(), ObjectKind::Manifest)
    }

    /// Parses a `BUILD_OUTPUTS_v1` manifest back into outputs.
    fn load_output_manifest(&self, digest: &Digest) -> Result<Vec<BuildOutput>> {
        let data = self.store.get(digest)?;
        let text = String::from_utf8_lossy(&data);
        let mut lines = text.lines();
        if lines.next() != Some(BUILD_OUTPUTS_HEADER) {
            return Err(Error::ValidationFailed(format!(
                "object {digest} is not a build-output manifest"
            )));
        }

        let mut outputs = Vec::new();
        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            if matches!(name, "build" | "version" | "system") {
                continue;
            }
            let out_digest: Digest = value.parse()?;
            let size = self
                .store
                .stat(&out_digest)
                .map(|info| info.size)
                .unwrap_or_default();
            outputs.push(BuildOutput {
                name: name.to_string(),
                digest: out_digest,
                kind: ObjectKind::Build,
                size,
            });
        }
        Ok(outputs)
    }
}

/// The deterministic base environment: only allow-listed keys exist,
/// each bound to its fixed value.
fn base_build_env(build_dir: &Path) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    for key in BUILD_ENV_ALLOWLIST {
        let value = match *key {
            "PATH" => BUILD_PATH.to_string(),
            "HOME" => build_dir.display().to_string(),
            "LANG" | "LC_ALL" => "C".to_string(),
            "TZ" => "UTC".to_string(),
            "SOURCE_DATE_EPOCH" => "0".to_string(),
            _ => continue,
        };
        env.insert((*key).to_string(), value);
    }
    env
}

// =============================================================================
// Build Sandbox
// =============================================================================

/// Arms the command with fresh PID and mount namespaces.
///
/// Same namespace discipline as capsule startup, minus the rootfs
/// swap: mount changes cannot leak back to the host, and the build
/// script runs under a namespace-local init (see `execute_command`)
/// that cannot see host processes' descendants.
#[cfg(target_os = "linux")]
fn isolate(command: &mut tokio::process::Command) {
    // SAFETY: the hook runs post-fork pre-exec and only issues raw
    // syscalls; no allocation or locking happens in the child.
    unsafe {
        command.pre_exec(|| {
            if libc::unshare(libc::CLONE_NEWNS | libc::CLONE_NEWPID) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            // Keep mount changes private to the build.
            let rc = libc::mount(
                std::ptr::null(),
                c"/".as_ptr(),
                std::ptr::null(),
                libc::MS_REC | libc::MS_PRIVATE,
                std::ptr::null(),
            );
            if rc != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(target_os = "linux"))]
fn isolate(_command: &mut tokio::process::Command) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_with_env(pairs: &[(&str, &str)]) -> BuildSpec {
        BuildSpec {
            name: "demo".to_string(),
            version: "1.0".to_string(),
            inputs: Vec::new(),
            outputs: vec![OutputDecl {
                name: "out".to_string(),
                kind: ObjectKind::Build,
            }],
            command: "true".to_string(),
            env: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            target_system: "x86_64-linux".to_string(),
            reproducible: true,
        }
    }

    #[test]
    fn fingerprint_ignores_env_declaration_order() {
        let a = spec_with_env(&[("A", "1"), ("B", "2")]);
        let b = spec_with_env(&[("B", "2"), ("A", "1")]);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_ignores_input_order() {
        let d1 = Digest::of_bytes(b"one");
        let d2 = Digest::of_bytes(b"two");
        let mut a = spec_with_env(&[]);
        a.inputs = vec![
            BuildInput {
                role: "x".to_string(),
                digest: d1,
                kind: ObjectKind::Build,
            },
            BuildInput {
                role: "y".to_string(),
                digest: d2,
                kind: ObjectKind::Build,
            },
        ];
        let mut b = a.clone();
        b.inputs.reverse();
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_changes_with_command() {
        let a = spec_with_env(&[]);
        let mut b = a.clone();
        b.command = "false".to_string();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn failed_entry_does_not_overwrite_success() {
        let cache = BuildCache::new();
        let fp = Digest::of_bytes(b"fp");
        let out = Digest::of_bytes(b"out");
        cache.insert(BuildCacheEntry {
            input_fingerprint: fp,
            output_digest: out,
            taken_at: Utc::now(),
            build_ms: 10,
            success: true,
        });
        cache.insert(BuildCacheEntry {
            input_fingerprint: fp,
            output_digest: Digest::of_bytes(b"bad"),
            taken_at: Utc::now(),
            build_ms: 5,
            success: false,
        });
        assert_eq!(cache.lookup(&fp).unwrap().output_digest, out);
    }

    #[test]
    fn validate_rejects_escaping_outputs() {
        let mut spec = spec_with_env(&[]);
        spec.outputs = vec![OutputDecl {
            name: "../escape".to_string(),
            kind: ObjectKind::Build,
        }];
        assert!(spec.validate().is_err());
    }
}
