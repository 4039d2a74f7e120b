//! Persistence collaborators for the control plane.
//!
//! One trait per concern, united under the `Store` supertrait so call sites
//! can hold a single `Arc<dyn Store>`. Two backends: an in-memory store for
//! tests and the mock backend, and PostgreSQL behind the `postgres` feature.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;
use crate::orchestrator::ResourceLimits;

/// Tenant lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Pending,
    Provisioning,
    Active,
    Failed,
}

impl TenantStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Provisioning => "provisioning",
            Self::Active => "active",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "provisioning" => Some(Self::Provisioning),
            "active" => Some(Self::Active),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A tenant and its provisioning bookkeeping.
///
/// `provisioning_step`, `provisioning_progress`, and `provisioning_message`
/// are live status surfaced to dashboards while the pipeline runs;
/// `provisioning_failed_reason` survives terminal failure for diagnosis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub status: TenantStatus,
    pub container_id: Option<String>,
    pub container_url: Option<String>,
    pub resource_limits: ResourceLimits,
    pub provisioning_step: Option<String>,
    pub provisioning_progress: u8,
    pub provisioning_attempt: u32,
    pub provisioning_message: Option<String>,
    pub provisioning_started_at: Option<DateTime<Utc>>,
    pub provisioning_failed_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Tenant {
    /// A freshly registered tenant, ready for the provisioning queue.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            status: TenantStatus::Pending,
            container_id: None,
            container_url: None,
            resource_limits: ResourceLimits::default(),
            provisioning_step: None,
            provisioning_progress: 0,
            provisioning_attempt: 0,
            provisioning_message: None,
            provisioning_started_at: None,
            provisioning_failed_reason: None,
            created_at: Utc::now(),
        }
    }
}

/// An agent living inside a tenant's runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub model: String,
    pub channels: Vec<String>,
    pub allowed_tools: Vec<String>,
    pub sandbox_profile: String,
}

/// An installable capability. Core skills are installed on every agent
/// during provisioning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Skill {
    pub id: Uuid,
    pub name: String,
    pub core: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// Operator-facing alert payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAlert {
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    pub tenant_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    pub tenant_id: Option<Uuid>,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
}

/// Tenant records and their provisioning bookkeeping.
#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn insert_tenant(&self, tenant: &Tenant) -> Result<(), StoreError>;

    async fn get_tenant(&self, id: Uuid) -> Result<Option<Tenant>, StoreError>;

    async fn list_tenants_by_status(
        &self,
        status: TenantStatus,
    ) -> Result<Vec<Tenant>, StoreError>;

    /// Start (or restart) a provisioning attempt: status becomes
    /// `provisioning`, progress resets to zero, the step and message clear.
    async fn begin_provisioning_attempt(
        &self,
        id: Uuid,
        attempt: u32,
    ) -> Result<(), StoreError>;

    /// Record entry into a pipeline step.
    async fn update_provisioning(
        &self,
        id: Uuid,
        step: &str,
        progress: u8,
        message: &str,
    ) -> Result<(), StoreError>;

    /// Bump progress within the current step.
    async fn set_provisioning_progress(&self, id: Uuid, progress: u8) -> Result<(), StoreError>;

    /// Persist the container handle as soon as creation succeeds, so the
    /// container is never orphaned by a later step failing.
    async fn set_container_handle(
        &self,
        id: Uuid,
        container_id: &str,
        container_url: &str,
    ) -> Result<(), StoreError>;

    /// Record the failure reason for an attempt that will be retried.
    async fn record_provisioning_failure(&self, id: Uuid, reason: &str) -> Result<(), StoreError>;

    /// Terminal success: status `active`, progress 100.
    async fn mark_active(&self, id: Uuid) -> Result<(), StoreError>;

    /// Terminal failure: status `failed`, reason preserved.
    async fn mark_failed(&self, id: Uuid, reason: &str) -> Result<(), StoreError>;

    /// Container URLs of every tenant that currently holds one. The port
    /// allocator derives the occupied set from these.
    async fn occupied_container_urls(&self) -> Result<Vec<String>, StoreError>;
}

#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn insert_agent(&self, agent: &Agent) -> Result<(), StoreError>;

    async fn list_agents(&self, tenant_id: Uuid) -> Result<Vec<Agent>, StoreError>;
}

#[async_trait]
pub trait SkillStore: Send + Sync {
    async fn insert_skill(&self, skill: &Skill) -> Result<(), StoreError>;

    async fn list_core_skills(&self) -> Result<Vec<Skill>, StoreError>;

    /// Record a skill installation on an agent. Append-only; callers that
    /// re-run installation will insert duplicate rows.
    async fn install_agent_skill(&self, agent_id: Uuid, skill_id: Uuid) -> Result<(), StoreError>;

    /// Distinct skills installed on any of the tenant's agents.
    async fn installed_skills(&self, tenant_id: Uuid) -> Result<Vec<Skill>, StoreError>;

    /// Raw installation rows for an agent, duplicates included.
    async fn agent_skill_rows(&self, agent_id: Uuid) -> Result<Vec<Uuid>, StoreError>;
}

#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn create_alert(&self, alert: NewAlert) -> Result<Alert, StoreError>;

    async fn list_alerts(&self, tenant_id: Option<Uuid>) -> Result<Vec<Alert>, StoreError>;
}

/// Unified persistence handle.
#[async_trait]
pub trait Store: TenantStore + AgentStore + SkillStore + AlertStore {
    /// Create tables and indexes if they do not exist.
    async fn ensure_schema(&self) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_status_round_trips_through_strings() {
        for status in [
            TenantStatus::Pending,
            TenantStatus::Provisioning,
            TenantStatus::Active,
            TenantStatus::Failed,
        ] {
            assert_eq!(TenantStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TenantStatus::parse("suspended"), None);
    }

    #[test]
    fn new_tenants_start_pending_with_zero_progress() {
        let tenant = Tenant::new("acme");
        assert_eq!(tenant.status, TenantStatus::Pending);
        assert_eq!(tenant.provisioning_progress, 0);
        assert_eq!(tenant.provisioning_attempt, 0);
        assert!(tenant.container_id.is_none());
    }
}
