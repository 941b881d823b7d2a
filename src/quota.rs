//! # Quota Manager
//!
//! Enforces resource caps across scopes (user, namespace, cluster,
//! node). A check inspects every quota attached to the scope and fails
//! with `QuotaExceeded` if any hard limit would be violated; crossing
//! a soft threshold emits a warning but allows the allocation.
//!
//! Allocation is atomic across all applicable quotas: either every
//! quota is debited or none is. Each quota record serializes its own
//! allocate/deallocate; multi-quota allocation locks records in
//! deterministic order (by quota name) so two concurrent allocations
//! touching overlapping quota sets cannot deadlock.
//!
//! Deallocation is total: returning more than was allocated clamps the
//! usage at zero instead of underflowing.
//!
//! A scope without any quota attached is simply unenforced — missing
//! quotas are absent, not infinite, so nothing is tracked for them.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

// =============================================================================
// Types
// =============================================================================

/// Resource dimension a quota can cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// CPU cores.
    Cpu,
    /// Memory, GiB.
    Memory,
    /// Storage, GiB.
    Storage,
    /// Network bandwidth, Mbps.
    Bandwidth,
    /// Concurrent capsules.
    Capsules,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::Cpu => "cpu",
            ResourceKind::Memory => "memory",
            ResourceKind::Storage => "storage",
            ResourceKind::Bandwidth => "bandwidth",
            ResourceKind::Capsules => "capsules",
        };
        f.write_str(s)
    }
}

/// Scope a quota binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaScope {
    User,
    Namespace,
    Cluster,
    Node,
}

/// Per-resource limit within a quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimit {
    pub hard: u64,
    pub used: u64,
    /// Warning threshold; crossing it is allowed but reported.
    pub soft: Option<u64>,
}

impl QuotaLimit {
    pub fn hard(hard: u64) -> Self {
        Self {
            hard,
            used: 0,
            soft: None,
        }
    }

    pub fn with_soft(hard: u64, soft: u64) -> Self {
        Self {
            hard,
            used: 0,
            soft: Some(soft),
        }
    }
}

/// A quota record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quota {
    pub name: String,
    pub scope: QuotaScope,
    pub scope_id: String,
    pub limits: BTreeMap<ResourceKind, QuotaLimit>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Soft-threshold crossing reported by check/allocate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaWarning {
    pub quota: String,
    pub resource: ResourceKind,
    pub used_after: u64,
    pub soft: u64,
}

// =============================================================================
// Manager
// =============================================================================

/// Process-wide quota index.
///
/// The index maps names to individually locked quota records; the
/// scope index is rebuilt on insert/remove. Lifecycle is bound to the
/// orchestrator (created at `up`, dropped at `down`).
pub struct QuotaManager {
    quotas: RwLock<HashMap<String, Arc<Mutex<Quota>>>>,
}

impl QuotaManager {
    /// Empty manager with no quotas.
    pub fn new() -> Self {
        Self {
            quotas: RwLock::new(HashMap::new()),
        }
    }

    /// Manager with the default cluster/namespace/user quotas.
    pub fn with_defaults() -> Self {
        let manager = Self::new();
        let defaults = [
            ("cluster-default", QuotaScope::Cluster, 1024, 4096, 16384),
            ("namespace-default", QuotaScope::Namespace, 256, 1024, 4096),
            ("user-default", QuotaScope::User, 64, 256, 1024),
        ];
        for (name, scope, cpu, memory, storage) in defaults {
            let mut limits = BTreeMap::new();
            limits.insert(ResourceKind::Cpu, QuotaLimit::with_soft(cpu, cpu * 8 / 10));
            limits.insert(ResourceKind::Memory, QuotaLimit::with_soft(memory, memory * 8 / 10));
            limits.insert(ResourceKind::Storage, QuotaLimit::hard(storage));
            manager
                .create(name, scope, "default", limits)
                .expect("default quotas are well-formed");
        }
        manager
    }

    /// Creates a quota.
    pub fn create(
        &self,
        name: &str,
        scope: QuotaScope,
        scope_id: &str,
        limits: BTreeMap<ResourceKind, QuotaLimit>,
    ) -> Result<()> {
        if name.is_empty() {
            return Err(Error::InvalidQuotaSpec("empty quota name".to_string()));
        }
        for (resource, limit) in &limits {
            if limit.used > limit.hard {
                return Err(Error::InvalidQuotaSpec(format!(
                    "{resource} used {} exceeds hard {}",
                    limit.used, limit.hard
                )));
            }
            if let Some(soft) = limit.soft
                && soft > limit.hard
            {
                return Err(Error::InvalidQuotaSpec(format!(
                    "{resource} soft {soft} exceeds hard {}",
                    limit.hard
                )));
            }
        }

        let now = Utc::now();
        let quota = Quota {
            name: name.to_string(),
            scope,
            scope_id: scope_id.to_string(),
            limits,
            created_at: now,
            updated_at: now,
        };
        self.quotas
            .write()
            .expect("quota index lock poisoned")
            .insert(name.to_string(), Arc::new(Mutex::new(quota)));
        info!(quota = name, ?scope, scope_id, "quota created");
        Ok(())
    }

    /// Removes a quota by name.
    pub fn remove(&self, name: &str) -> Result<()> {
        self.quotas
            .write()
            .expect("quota index lock poisoned")
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::QuotaNotFound(name.to_string()))
    }

    /// Snapshot of a quota record.
    pub fn get(&self, name: &str) -> Result<Quota> {
        let quotas = self.quotas.read().expect("quota index lock poisoned");
        let quota = quotas
            .get(name)
            .ok_or_else(|| Error::QuotaNotFound(name.to_string()))?;
        Ok(quota.lock().expect("quota record lock poisoned").clone())
    }

    /// Quotas applicable to a scope, sorted by name for lock ordering.
    fn applicable(&self, scopes: &[(QuotaScope, &str)]) -> Vec<(String, Arc<Mutex<Quota>>)> {
        let quotas = self.quotas.read().expect("quota index lock poisoned");
        let mut matched: Vec<(String, Arc<Mutex<Quota>>)> = quotas
            .iter()
            .filter(|(_, q)| {
                let q = q.lock().expect("quota record lock poisoned");
                scopes.iter().any(|(scope, id)| q.scope == *scope && q.scope_id == *id)
            })
            .map(|(name, q)| (name.clone(), Arc::clone(q)))
            .collect();
        matched.sort_by(|a, b| a.0.cmp(&b.0));
        matched
    }

    /// Checks whether `amount` of `resource` fits under every quota of
    /// the scope. Returns soft-threshold warnings; hard violations are
    /// `QuotaExceeded`.
    pub fn check(
        &self,
        scope: QuotaScope,
        scope_id: &str,
        resource: ResourceKind,
        amount: u64,
    ) -> Result<Vec<QuotaWarning>> {
        self.check_many(&[(scope, scope_id)], resource, amount)
    }

    /// Multi-scope variant of [`check`](Self::check).
    pub fn check_many(
        &self,
        scopes: &[(QuotaScope, &str)],
        resource: ResourceKind,
        amount: u64,
    ) -> Result<Vec<QuotaWarning>> {
        let mut warnings = Vec::new();
        for (name, record) in self.applicable(scopes) {
            let quota = record.lock().expect("quota record lock poisoned");
            if let Some(limit) = quota.limits.get(&resource) {
                let after = limit.used.saturating_add(amount);
                if after > limit.hard {
                    return Err(Error::QuotaExceeded {
                        quota: name,
                        resource: resource.to_string(),
                        requested: amount,
                        limit: limit.hard,
                    });
                }
                if let Some(soft) = limit.soft
                    && after > soft
                {
                    warnings.push(QuotaWarning {
                        quota: name.clone(),
                        resource,
                        used_after: after,
                        soft,
                    });
                }
            }
        }
        for warning in &warnings {
            warn!(
                quota = %warning.quota,
                resource = %warning.resource,
                used_after = warning.used_after,
                soft = warning.soft,
                "soft quota threshold crossed"
            );
        }
        Ok(warnings)
    }

    /// Atomically debits `amount` of `resource` from every quota of
    /// the scope: all are debited or none.
    pub fn allocate(
        &self,
        scope: QuotaScope,
        scope_id: &str,
        resource: ResourceKind,
        amount: u64,
    ) -> Result<Vec<QuotaWarning>> {
        self.allocate_many(&[(scope, scope_id)], resource, amount)
    }

    /// Multi-scope atomic allocation.
    ///
    /// Applicable records are locked in name order and held across the
    /// check and the debit, so the `used ≤ hard` invariant is never
    /// observable as violated.
    pub fn allocate_many(
        &self,
        scopes: &[(QuotaScope, &str)],
        resource: ResourceKind,
        amount: u64,
    ) -> Result<Vec<QuotaWarning>> {
        let applicable = self.applicable(scopes);
        // Name-sorted lock acquisition prevents deadlock against any
        // concurrent allocation over an overlapping quota set.
        let mut guards: Vec<(String, std::sync::MutexGuard<'_, Quota>)> = applicable
            .iter()
            .map(|(name, record)| (name.clone(), record.lock().expect("quota record lock poisoned")))
            .collect();

        let mut warnings = Vec::new();
        for (name, guard) in &guards {
            if let Some(limit) = guard.limits.get(&resource) {
                let after = limit.used.saturating_add(amount);
                if after > limit.hard {
                    return Err(Error::QuotaExceeded {
                        quota: name.clone(),
                        resource: resource.to_string(),
                        requested: amount,
                        limit: limit.hard,
                    });
                }
                if let Some(soft) = limit.soft
                    && after > soft
                {
                    warnings.push(QuotaWarning {
                        quota: name.clone(),
                        resource,
                        used_after: after,
                        soft,
                    });
                }
            }
        }

        for (name, guard) in &mut guards {
            let Some(limit) = guard.limits.get_mut(&resource) else {
                continue;
            };
            limit.used += amount;
            let used = limit.used;
            guard.updated_at = Utc::now();
            debug!(quota = %name, resource = %resource, amount, used, "allocated");
        }

        for warning in &warnings {
            warn!(
                quota = %warning.quota,
                resource = %warning.resource,
                used_after = warning.used_after,
                soft = warning.soft,
                "soft quota threshold crossed"
            );
        }
        Ok(warnings)
    }

    /// Returns `amount` of `resource` to the scope's quotas.
    ///
    /// Total: never fails; an over-return clamps usage at zero.
    pub fn deallocate(&self, scope: QuotaScope, scope_id: &str, resource: ResourceKind, amount: u64) {
        self.deallocate_many(&[(scope, scope_id)], resource, amount);
    }

    /// Multi-scope deallocation.
    pub fn deallocate_many(&self, scopes: &[(QuotaScope, &str)], resource: ResourceKind, amount: u64) {
        for (name, record) in self.applicable(scopes) {
            let mut quota = record.lock().expect("quota record lock poisoned");
            let Some(limit) = quota.limits.get_mut(&resource) else {
                continue;
            };
            limit.used = limit.used.saturating_sub(amount);
            let used = limit.used;
            quota.updated_at = Utc::now();
            debug!(quota = %name, resource = %resource, amount, used, "deallocated");
        }
    }
}

impl Default for QuotaManager {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu_quota(manager: &QuotaManager, name: &str, scope_id: &str, hard: u64) {
        let mut limits = BTreeMap::new();
        limits.insert(ResourceKind::Cpu, QuotaLimit::hard(hard));
        manager.create(name, QuotaScope::User, scope_id, limits).unwrap();
    }

    #[test]
    fn allocation_respects_hard_limit() {
        let manager = QuotaManager::new();
        cpu_quota(&manager, "user-default", "default", 16);

        manager
            .allocate(QuotaScope::User, "default", ResourceKind::Cpu, 12)
            .unwrap();
        let err = manager
            .allocate(QuotaScope::User, "default", ResourceKind::Cpu, 6)
            .unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded { .. }));

        // Failed allocation left usage untouched.
        let quota = manager.get("user-default").unwrap();
        assert_eq!(quota.limits[&ResourceKind::Cpu].used, 12);
    }

    #[test]
    fn deallocate_clamps_at_zero() {
        let manager = QuotaManager::new();
        cpu_quota(&manager, "q", "alice", 10);
        manager
            .allocate(QuotaScope::User, "alice", ResourceKind::Cpu, 4)
            .unwrap();
        manager.deallocate(QuotaScope::User, "alice", ResourceKind::Cpu, 100);
        let quota = manager.get("q").unwrap();
        assert_eq!(quota.limits[&ResourceKind::Cpu].used, 0);
    }

    #[test]
    fn soft_threshold_warns_but_allows() {
        let manager = QuotaManager::new();
        let mut limits = BTreeMap::new();
        limits.insert(ResourceKind::Memory, QuotaLimit::with_soft(100, 50));
        manager
            .create("mem", QuotaScope::Namespace, "team", limits)
            .unwrap();

        let warnings = manager
            .allocate(QuotaScope::Namespace, "team", ResourceKind::Memory, 60)
            .unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].used_after, 60);
    }

    #[test]
    fn multi_scope_allocation_is_all_or_nothing() {
        let manager = QuotaManager::new();
        cpu_quota(&manager, "a-user", "alice", 100);
        let mut limits = BTreeMap::new();
        limits.insert(ResourceKind::Cpu, QuotaLimit::hard(5));
        manager
            .create("b-namespace", QuotaScope::Namespace, "team", limits)
            .unwrap();

        let err = manager
            .allocate_many(
                &[(QuotaScope::User, "alice"), (QuotaScope::Namespace, "team")],
                ResourceKind::Cpu,
                10,
            )
            .unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded { .. }));

        // Neither quota was debited.
        assert_eq!(manager.get("a-user").unwrap().limits[&ResourceKind::Cpu].used, 0);
        assert_eq!(
            manager.get("b-namespace").unwrap().limits[&ResourceKind::Cpu].used,
            0
        );
    }

    #[test]
    fn absent_quota_is_unenforced() {
        let manager = QuotaManager::new();
        // No quota for this scope: check and allocate pass vacuously.
        assert!(
            manager
                .check(QuotaScope::User, "ghost", ResourceKind::Cpu, 1_000_000)
                .unwrap()
                .is_empty()
        );
        manager
            .allocate(QuotaScope::User, "ghost", ResourceKind::Cpu, 1_000_000)
            .unwrap();
    }

    #[test]
    fn defaults_cover_three_scopes() {
        let manager = QuotaManager::with_defaults();
        assert!(manager.get("cluster-default").is_ok());
        assert!(manager.get("namespace-default").is_ok());
        assert!(manager.get("user-default").is_ok());
    }

    #[test]
    fn invalid_quota_specs_are_rejected() {
        let manager = QuotaManager::new();
        let mut limits = BTreeMap::new();
        limits.insert(
            ResourceKind::Cpu,
            QuotaLimit {
                hard: 10,
                used: 0,
                soft: Some(20),
            },
        );
        assert!(matches!(
            manager.create("bad", QuotaScope::User, "x", limits),
            Err(Error::InvalidQuotaSpec(_))
        ));
    }
}
