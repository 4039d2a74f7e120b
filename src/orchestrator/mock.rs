//! In-memory orchestrator backend.
//!
//! Implements the full lifecycle state machine without touching a container
//! engine. Selected via `ORCHESTRATOR_BACKEND=mock` for local development and
//! used directly by the integration tests, which also rely on the failure
//! injection knobs to drive retry and terminal-failure paths.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::{
    ContainerConfigUpdate, ContainerCreateOptions, ContainerHandle, ContainerHealth,
    ContainerOrchestrator, ContainerState, ContainerStatus, naming,
};
use crate::error::OrchestratorError;

struct MockContainer {
    handle: ContainerHandle,
    state: ContainerState,
    health: ContainerHealth,
    started_at: Option<DateTime<Utc>>,
    environment: HashMap<String, String>,
    runtime_config: Option<serde_json::Value>,
    logs: Vec<String>,
}

#[derive(Default)]
pub struct MockOrchestrator {
    containers: Mutex<HashMap<String, MockContainer>>,
    /// Number of upcoming `create` calls that should fail.
    fail_next_creates: AtomicU32,
    /// Number of upcoming `get_status` calls that should report unhealthy.
    unhealthy_polls: AtomicU32,
}

impl MockOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls to `create` fail with an engine error.
    pub fn fail_next_creates(&self, n: u32) {
        self.fail_next_creates.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` status polls report a degraded container.
    pub fn report_unhealthy_for(&self, n: u32) {
        self.unhealthy_polls.store(n, Ordering::SeqCst);
    }

    pub fn set_health(&self, id: &str, health: ContainerHealth) {
        let mut containers = self.containers.lock().unwrap();
        if let Some(c) = containers.get_mut(id) {
            c.health = health;
        }
    }

    pub fn container_count(&self) -> usize {
        self.containers.lock().unwrap().len()
    }

    pub fn runtime_config(&self, id: &str) -> Option<serde_json::Value> {
        let containers = self.containers.lock().unwrap();
        containers.get(id).and_then(|c| c.runtime_config.clone())
    }

    pub fn environment(&self, id: &str) -> Option<HashMap<String, String>> {
        let containers = self.containers.lock().unwrap();
        containers.get(id).map(|c| c.environment.clone())
    }

    fn take_budget(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ContainerOrchestrator for MockOrchestrator {
    async fn create(
        &self,
        opts: ContainerCreateOptions,
    ) -> Result<ContainerHandle, OrchestratorError> {
        if Self::take_budget(&self.fail_next_creates) {
            return Err(OrchestratorError::CreateFailed {
                tenant_id: opts.tenant_id.to_string(),
                reason: "injected create failure".to_string(),
            });
        }

        let name = opts
            .name
            .unwrap_or_else(|| naming::container_name(opts.tenant_id));
        let handle = ContainerHandle {
            id: name.clone(),
            url: format!("http://127.0.0.1:{}", opts.host_port),
            host_port: opts.host_port,
        };
        debug!(container = %name, port = opts.host_port, "mock container created");

        let mut containers = self.containers.lock().unwrap();
        containers.insert(
            name,
            MockContainer {
                handle: handle.clone(),
                state: ContainerState::Running,
                health: ContainerHealth::Healthy,
                started_at: Some(Utc::now()),
                environment: opts.environment,
                runtime_config: None,
                logs: vec!["agent runtime started".to_string()],
            },
        );
        Ok(handle)
    }

    async fn delete(&self, id: &str) -> Result<(), OrchestratorError> {
        let mut containers = self.containers.lock().unwrap();
        containers
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| OrchestratorError::NotFound { id: id.to_string() })
    }

    async fn restart(&self, id: &str) -> Result<(), OrchestratorError> {
        let mut containers = self.containers.lock().unwrap();
        let container = containers
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotFound { id: id.to_string() })?;
        container.state = ContainerState::Running;
        container.health = ContainerHealth::Healthy;
        container.started_at = Some(Utc::now());
        container.logs.push("agent runtime restarted".to_string());
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<(), OrchestratorError> {
        let mut containers = self.containers.lock().unwrap();
        let container = containers
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotFound { id: id.to_string() })?;
        container.state = ContainerState::Stopped;
        container.health = ContainerHealth::Down;
        container.started_at = None;
        Ok(())
    }

    async fn get_status(&self, id: &str) -> Result<ContainerStatus, OrchestratorError> {
        let containers = self.containers.lock().unwrap();
        let container = containers
            .get(id)
            .ok_or_else(|| OrchestratorError::NotFound { id: id.to_string() })?;

        let health = if container.state == ContainerState::Running
            && Self::take_budget(&self.unhealthy_polls)
        {
            ContainerHealth::Degraded
        } else {
            container.health
        };
        let uptime = container
            .started_at
            .map(|t| (Utc::now() - t).num_seconds().max(0) as u64);
        Ok(ContainerStatus {
            state: container.state,
            health,
            started_at: container.started_at,
            uptime_seconds: uptime,
        })
    }

    async fn get_logs(
        &self,
        id: &str,
        tail_lines: Option<u32>,
        _since_seconds: Option<i64>,
    ) -> Result<String, OrchestratorError> {
        let containers = self.containers.lock().unwrap();
        let container = containers
            .get(id)
            .ok_or_else(|| OrchestratorError::NotFound { id: id.to_string() })?;
        let lines: Vec<&str> = match tail_lines {
            Some(n) => {
                let skip = container.logs.len().saturating_sub(n as usize);
                container.logs[skip..].iter().map(String::as_str).collect()
            }
            None => container.logs.iter().map(String::as_str).collect(),
        };
        Ok(lines.join("\n"))
    }

    async fn update_config(
        &self,
        id: &str,
        update: ContainerConfigUpdate,
    ) -> Result<(), OrchestratorError> {
        let mut containers = self.containers.lock().unwrap();
        let container = containers
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotFound { id: id.to_string() })?;
        if let Some(doc) = update.runtime_config {
            container.runtime_config = Some(doc);
        }
        if let Some(env) = update.environment {
            container.environment = env;
        }
        // Config updates restart the runtime, mirroring the real backends.
        container.state = ContainerState::Running;
        container.health = ContainerHealth::Healthy;
        container.started_at = Some(Utc::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use uuid::Uuid;

    use super::*;
    use crate::orchestrator::ResourceLimits;

    fn opts(tenant_id: Uuid, port: u16) -> ContainerCreateOptions {
        ContainerCreateOptions {
            tenant_id,
            image: None,
            name: None,
            environment: HashMap::new(),
            resource_limits: ResourceLimits::default(),
            network_name: naming::network_name(tenant_id),
            host_port: port,
            container_port: crate::DEFAULT_CONTAINER_PORT,
        }
    }

    #[tokio::test]
    async fn create_then_status_reports_running_healthy() {
        let orch = MockOrchestrator::new();
        let tenant = Uuid::new_v4();
        let handle = orch.create(opts(tenant, 19001)).await.unwrap();
        assert_eq!(handle.url, "http://127.0.0.1:19001");

        let status = orch.get_status(&handle.id).await.unwrap();
        assert!(status.is_healthy());
        assert!(status.uptime_seconds.is_some());
    }

    #[tokio::test]
    async fn stop_transitions_to_stopped_down() {
        let orch = MockOrchestrator::new();
        let handle = orch.create(opts(Uuid::new_v4(), 19002)).await.unwrap();
        orch.stop(&handle.id).await.unwrap();

        let status = orch.get_status(&handle.id).await.unwrap();
        assert_eq!(status.state, ContainerState::Stopped);
        assert_eq!(status.health, ContainerHealth::Down);
        assert!(status.uptime_seconds.is_none());

        orch.restart(&handle.id).await.unwrap();
        assert!(orch.get_status(&handle.id).await.unwrap().is_healthy());
    }

    #[tokio::test]
    async fn delete_is_terminal() {
        let orch = MockOrchestrator::new();
        let handle = orch.create(opts(Uuid::new_v4(), 19003)).await.unwrap();
        orch.delete(&handle.id).await.unwrap();
        assert!(matches!(
            orch.get_status(&handle.id).await,
            Err(OrchestratorError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn injected_create_failures_are_consumed_in_order() {
        let orch = MockOrchestrator::new();
        orch.fail_next_creates(2);
        assert!(orch.create(opts(Uuid::new_v4(), 19004)).await.is_err());
        assert!(orch.create(opts(Uuid::new_v4(), 19005)).await.is_err());
        assert!(orch.create(opts(Uuid::new_v4(), 19006)).await.is_ok());
    }

    #[tokio::test]
    async fn unhealthy_polls_decay_back_to_healthy() {
        let orch = MockOrchestrator::new();
        let handle = orch.create(opts(Uuid::new_v4(), 19007)).await.unwrap();
        orch.report_unhealthy_for(1);
        let first = orch.get_status(&handle.id).await.unwrap();
        assert_eq!(first.health, ContainerHealth::Degraded);
        let second = orch.get_status(&handle.id).await.unwrap();
        assert_eq!(second.health, ContainerHealth::Healthy);
    }

    #[tokio::test]
    async fn update_config_stores_document_and_restarts() {
        let orch = MockOrchestrator::new();
        let handle = orch.create(opts(Uuid::new_v4(), 19008)).await.unwrap();
        orch.stop(&handle.id).await.unwrap();
        orch.update_config(
            &handle.id,
            ContainerConfigUpdate {
                runtime_config: Some(serde_json::json!({"version": "v1"})),
                environment: None,
            },
        )
        .await
        .unwrap();
        assert!(orch.get_status(&handle.id).await.unwrap().is_healthy());
        assert_eq!(
            orch.runtime_config(&handle.id).unwrap()["version"],
            "v1"
        );
    }
}
