//! Access control: per-user policies, role ceilings and script ownership.
//!
//! Policies are looked up on every request and never cached. Anything other
//! than an explicit grant is a denial.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::error::SecurityError;
use crate::events::{AuditDecision, AuditEvent, EventRegistry, SandboxEvent};
use crate::limits::ResourceLimits;
use crate::loader::check_reference;
use crate::request::ScriptRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Trader,
    Developer,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Trader => "trader",
            Role::Developer => "developer",
            Role::Admin => "admin",
        }
    }

    /// Permissions a policy gets when it does not list its own.
    pub fn default_permissions(&self) -> BTreeSet<Permission> {
        let permissions: &[Permission] = match self {
            Role::Viewer => &[Permission::ViewScripts],
            Role::Trader => &[Permission::ViewScripts, Permission::ExecuteScripts],
            Role::Developer => &[
                Permission::ViewScripts,
                Permission::ExecuteScripts,
                Permission::ShareScripts,
            ],
            Role::Admin => &Permission::ALL,
        };
        permissions.iter().copied().collect()
    }

    /// Resource ceilings a policy gets when it does not carry its own.
    pub fn default_ceilings(&self) -> ResourceLimits {
        match self {
            Role::Viewer => ResourceLimits::default(),
            Role::Trader => ResourceLimits {
                memory_mb: 256,
                cpu_seconds: 10,
                wall_seconds: 30,
                max_open_files: 128,
                max_threads: 8,
                max_child_processes: 2,
                stack_mb: 16,
            },
            Role::Developer | Role::Admin => ResourceLimits::default_ceilings(),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ViewScripts,
    ExecuteScripts,
    ShareScripts,
    ManagePolicies,
}

impl Permission {
    pub const ALL: [Permission; 4] = [
        Permission::ViewScripts,
        Permission::ExecuteScripts,
        Permission::ShareScripts,
        Permission::ManagePolicies,
    ];
}

/// Access policy of one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPolicy {
    pub user_id: String,
    pub role: Role,
    /// Empty means the role's defaults.
    #[serde(default)]
    pub permissions: BTreeSet<Permission>,
    /// Absent means the role's defaults.
    #[serde(default)]
    pub ceilings: Option<ResourceLimits>,
    #[serde(default)]
    pub shared_scripts: Vec<ScriptRef>,
}

impl AccessPolicy {
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
            permissions: BTreeSet::new(),
            ceilings: None,
            shared_scripts: Vec::new(),
        }
    }

    pub fn with_shared(mut self, script_ref: impl Into<ScriptRef>) -> Self {
        self.shared_scripts.push(script_ref.into());
        self
    }

    pub fn with_ceilings(mut self, ceilings: ResourceLimits) -> Self {
        self.ceilings = Some(ceilings);
        self
    }

    pub fn effective_permissions(&self) -> BTreeSet<Permission> {
        if self.permissions.is_empty() {
            self.role.default_permissions()
        } else {
            self.permissions.clone()
        }
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.effective_permissions().contains(&permission)
    }

    pub fn effective_ceilings(&self) -> ResourceLimits {
        self.ceilings.unwrap_or_else(|| self.role.default_ceilings())
    }

    /// Owner of `user_id/...`, explicitly shared, or admin. References that
    /// are not plain relative paths are never accessible, to anyone.
    pub fn can_access(&self, script_ref: &ScriptRef) -> bool {
        if check_reference(script_ref.as_str()).is_err() {
            return false;
        }
        if self.role == Role::Admin {
            return true;
        }
        let owned = script_ref
            .as_str()
            .strip_prefix(self.user_id.as_str())
            .is_some_and(|rest| rest.starts_with('/') && rest.len() > 1);
        owned || self.shared_scripts.contains(script_ref)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PolicyLookupError {
    #[error("Policy store unavailable: {message}")]
    Unavailable { message: String },
}

/// Source of access policies.
#[async_trait]
pub trait PolicyProvider: Send + Sync {
    async fn policy_for(&self, user_id: &str) -> Result<Option<AccessPolicy>, PolicyLookupError>;
}

/// Policy store backed by a concurrent map.
#[derive(Debug, Default)]
pub struct InMemoryPolicyProvider {
    policies: DashMap<String, AccessPolicy>,
}

impl InMemoryPolicyProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_policies(policies: impl IntoIterator<Item = AccessPolicy>) -> Self {
        let provider = Self::new();
        for policy in policies {
            provider.upsert(policy);
        }
        provider
    }

    pub fn upsert(&self, policy: AccessPolicy) {
        self.policies.insert(policy.user_id.clone(), policy);
    }

    pub fn remove(&self, user_id: &str) -> Option<AccessPolicy> {
        self.policies.remove(user_id).map(|(_, policy)| policy)
    }
}

#[async_trait]
impl PolicyProvider for InMemoryPolicyProvider {
    async fn policy_for(&self, user_id: &str) -> Result<Option<AccessPolicy>, PolicyLookupError> {
        Ok(self.policies.get(user_id).map(|entry| entry.value().clone()))
    }
}

/// Makes and audits access decisions.
pub struct AccessController {
    provider: Arc<dyn PolicyProvider>,
    events: Arc<EventRegistry>,
}

impl AccessController {
    pub fn new(provider: Arc<dyn PolicyProvider>, events: Arc<EventRegistry>) -> Self {
        Self { provider, events }
    }

    /// Grants or denies `user_id` running `script_ref` with `limits`.
    /// Every outcome emits an [`AuditEvent`].
    pub async fn authorize(
        &self,
        user_id: &str,
        script_ref: &ScriptRef,
        limits: &ResourceLimits,
    ) -> Result<AccessPolicy, SecurityError> {
        match self.decide(user_id, script_ref, limits).await {
            Ok(policy) => {
                self.audit(user_id, script_ref, AuditDecision::Granted, format!("role {}", policy.role));
                Ok(policy)
            }
            Err(reason) => {
                self.audit(user_id, script_ref, AuditDecision::Denied, reason.clone());
                Err(SecurityError::access_denied(reason))
            }
        }
    }

    async fn decide(
        &self,
        user_id: &str,
        script_ref: &ScriptRef,
        limits: &ResourceLimits,
    ) -> Result<AccessPolicy, String> {
        let policy = match self.provider.policy_for(user_id).await {
            Ok(Some(policy)) => policy,
            Ok(None) => return Err("no access policy for user".to_string()),
            Err(e) => {
                debug!(%user_id, error = %e, "policy lookup failed");
                return Err("access policy lookup failed".to_string());
            }
        };
        if policy.user_id != user_id {
            return Err("access policy does not belong to user".to_string());
        }
        if !policy.has_permission(Permission::ExecuteScripts) {
            return Err(format!("role {} may not execute scripts", policy.role));
        }
        if let Err(e) = check_reference(script_ref.as_str()) {
            return Err(format!("script reference rejected: {e}"));
        }
        if !policy.can_access(script_ref) {
            return Err("script is neither owned by nor shared with the user".to_string());
        }
        if let Some((field, value, ceiling)) = limits.first_excess(&policy.effective_ceilings()) {
            return Err(format!(
                "limit `{field}` = {value} exceeds the {} ceiling {ceiling}",
                policy.role
            ));
        }
        Ok(policy)
    }

    fn audit(&self, user_id: &str, script_ref: &ScriptRef, decision: AuditDecision, reason: String) {
        self.events.emit(SandboxEvent::Audit(AuditEvent::new(
            user_id,
            script_ref.clone(),
            decision,
            reason,
        )));
    }
}

impl fmt::Debug for AccessController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessController").finish_non_exhaustive()
    }
}
