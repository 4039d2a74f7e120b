//! Container orchestration for tenant agent runtimes.
//!
//! One contract, three backends: a standalone Docker engine, a Kubernetes
//! cluster, and an in-memory mock for tests and local development. The
//! backend is chosen once at process start from configuration and injected
//! everywhere as `Arc<dyn ContainerOrchestrator>`; business logic never
//! branches on the backend kind.

pub mod docker;
pub mod kubernetes;
pub mod mock;
pub mod naming;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{Config, OrchestratorBackend};
use crate::error::OrchestratorError;
use crate::secrets::SecretsManager;

/// Lifecycle state of a tenant container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Creating,
    Running,
    Stopped,
    Failed,
    Unknown,
}

/// Health of a tenant container, orthogonal to lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerHealth {
    Healthy,
    Degraded,
    Down,
    Unknown,
}

/// Point-in-time status of a tenant container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub state: ContainerState,
    pub health: ContainerHealth,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_seconds: Option<u64>,
}

impl ContainerStatus {
    pub fn is_healthy(&self) -> bool {
        self.state == ContainerState::Running && self.health == ContainerHealth::Healthy
    }
}

/// Ephemeral result of `create`. The caller persists `id`/`url` onto the
/// tenant record; the persisted copy is the sole source of truth for every
/// subsequent lifecycle call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerHandle {
    pub id: String,
    pub url: String,
    pub host_port: u16,
}

/// Per-tenant resource limits, as stored on the tenant record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    pub cpu_cores: f64,
    pub memory_mb: u64,
    pub disk_gb: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_cores: 1.0,
            memory_mb: 1024,
            disk_gb: 10,
        }
    }
}

/// Everything a backend needs to create a tenant runtime container.
#[derive(Debug, Clone)]
pub struct ContainerCreateOptions {
    pub tenant_id: Uuid,
    /// Image override; `None` uses the configured runtime image.
    pub image: Option<String>,
    /// Name override; `None` uses the canonical tenant-scoped name.
    pub name: Option<String>,
    pub environment: HashMap<String, String>,
    pub resource_limits: ResourceLimits,
    pub network_name: String,
    pub host_port: u16,
    pub container_port: u16,
}

/// Payload for `update_config`. At least one field is expected to be set.
#[derive(Debug, Clone, Default)]
pub struct ContainerConfigUpdate {
    /// New runtime configuration document (the fixed-schema JSON the
    /// container parses).
    pub runtime_config: Option<serde_json::Value>,
    /// Replacement environment variables.
    pub environment: Option<HashMap<String, String>>,
}

/// Lifecycle contract over a tenant's runtime container.
///
/// Every method fails loudly: a failed `create` never returns a handle, and
/// errors propagate unchanged so the provisioning pipeline's failure path is
/// authoritative. `update_config` applies the new configuration artifact
/// first and then restarts, so callers must tolerate a brief unavailability
/// window after it returns.
#[async_trait]
pub trait ContainerOrchestrator: Send + Sync {
    async fn create(
        &self,
        opts: ContainerCreateOptions,
    ) -> Result<ContainerHandle, OrchestratorError>;

    /// Remove the container and its tenant-scoped resources. Terminal: the
    /// handle is invalid afterwards.
    async fn delete(&self, id: &str) -> Result<(), OrchestratorError>;

    async fn restart(&self, id: &str) -> Result<(), OrchestratorError>;

    async fn stop(&self, id: &str) -> Result<(), OrchestratorError>;

    async fn get_status(&self, id: &str) -> Result<ContainerStatus, OrchestratorError>;

    async fn get_logs(
        &self,
        id: &str,
        tail_lines: Option<u32>,
        since_seconds: Option<i64>,
    ) -> Result<String, OrchestratorError>;

    async fn update_config(
        &self,
        id: &str,
        update: ContainerConfigUpdate,
    ) -> Result<(), OrchestratorError>;
}

/// Resolve the configured backend once, at startup.
///
/// Docker and Kubernetes backends run a reachability preflight here so a dead
/// engine fails the process at boot instead of mid-pipeline.
pub async fn build_orchestrator(
    config: &Config,
    secrets: Arc<SecretsManager>,
) -> Result<Arc<dyn ContainerOrchestrator>, OrchestratorError> {
    match config.backend {
        OrchestratorBackend::Mock => Ok(Arc::new(mock::MockOrchestrator::new())),
        OrchestratorBackend::Docker => Ok(Arc::new(
            docker::DockerOrchestrator::connect(config, secrets).await?,
        )),
        OrchestratorBackend::Kubernetes => Ok(Arc::new(
            kubernetes::KubernetesOrchestrator::connect(config, secrets).await?,
        )),
    }
}
