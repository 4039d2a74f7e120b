//! The five-step provisioning pipeline.
//!
//! Each step persists its start before executing and its end progress after,
//! so dashboards always see a monotonically increasing progress number within
//! an attempt. Failures retry the whole pipeline from the top (steps are
//! idempotent enough to tolerate that); once the attempt budget is spent, or
//! the error is one a retry cannot fix, the tenant is marked failed and
//! exactly one critical alert goes out.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::ports::PortAllocator;
use super::runtime_config;
use crate::config::Config;
use crate::error::{Error, ProvisioningError, Result};
use crate::orchestrator::{
    ContainerConfigUpdate, ContainerCreateOptions, ContainerOrchestrator, naming,
};
use crate::secrets::SecretsManager;
use crate::store::{AlertSeverity, NewAlert, Store, Tenant};

/// Pipeline steps, in execution order. Progress windows partition 0..100.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningStep {
    CreatingNamespace,
    SpinningUp,
    Configuring,
    InstallingSkills,
    HealthCheck,
}

impl ProvisioningStep {
    pub const SEQUENCE: [Self; 5] = [
        Self::CreatingNamespace,
        Self::SpinningUp,
        Self::Configuring,
        Self::InstallingSkills,
        Self::HealthCheck,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreatingNamespace => "creating_namespace",
            Self::SpinningUp => "spinning_up",
            Self::Configuring => "configuring",
            Self::InstallingSkills => "installing_skills",
            Self::HealthCheck => "health_check",
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::CreatingNamespace => "Creating isolated workspace",
            Self::SpinningUp => "Starting agent runtime",
            Self::Configuring => "Applying runtime configuration",
            Self::InstallingSkills => "Installing core skills",
            Self::HealthCheck => "Waiting for runtime to become healthy",
        }
    }

    pub fn progress_range(self) -> (u8, u8) {
        match self {
            Self::CreatingNamespace => (0, 20),
            Self::SpinningUp => (20, 40),
            Self::Configuring => (40, 60),
            Self::InstallingSkills => (60, 80),
            Self::HealthCheck => (80, 100),
        }
    }
}

enum FailureDisposition {
    /// Re-run the whole pipeline as the given attempt number.
    Retry(u32),
    /// Tenant marked failed, alert raised.
    Terminal,
    /// Tenant record is gone; nothing left to update.
    Abort,
}

pub struct Pipeline {
    store: Arc<dyn Store>,
    orchestrator: Arc<dyn ContainerOrchestrator>,
    secrets: Arc<SecretsManager>,
    allocator: PortAllocator,
    config: Config,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn Store>,
        orchestrator: Arc<dyn ContainerOrchestrator>,
        secrets: Arc<SecretsManager>,
        allocator: PortAllocator,
        config: Config,
    ) -> Self {
        Self {
            store,
            orchestrator,
            secrets,
            allocator,
            config,
        }
    }

    /// Provision the tenant end to end, retrying on transient failure.
    ///
    /// The attempt counter persisted on the tenant is authoritative: it
    /// starts at zero, increments once per retry, and retries stop when it
    /// reaches the configured maximum.
    pub async fn run(&self, tenant_id: Uuid) -> Result<()> {
        let tenant = self.load_tenant(tenant_id).await?;
        self.store
            .begin_provisioning_attempt(tenant_id, tenant.provisioning_attempt)
            .await
            .map_err(Error::from)?;

        loop {
            match self.run_attempt(tenant_id).await {
                Ok(()) => {
                    self.store
                        .mark_active(tenant_id)
                        .await
                        .map_err(Error::from)?;
                    info!(tenant = %tenant_id, "tenant provisioned");
                    return Ok(());
                }
                Err(err) => match self.handle_failure(tenant_id, &err).await {
                    FailureDisposition::Retry(attempt) => {
                        self.store
                            .begin_provisioning_attempt(tenant_id, attempt)
                            .await
                            .map_err(Error::from)?;
                    }
                    FailureDisposition::Terminal | FailureDisposition::Abort => return Err(err),
                },
            }
        }
    }

    async fn run_attempt(&self, tenant_id: Uuid) -> Result<()> {
        for step in ProvisioningStep::SEQUENCE {
            let (start, end) = step.progress_range();
            self.store
                .update_provisioning(tenant_id, step.as_str(), start, step.message())
                .await
                .map_err(Error::from)?;
            debug!(tenant = %tenant_id, step = step.as_str(), "provisioning step started");

            match step {
                ProvisioningStep::CreatingNamespace => self.prepare_workspace(tenant_id)?,
                ProvisioningStep::SpinningUp => self.spin_up(tenant_id).await?,
                ProvisioningStep::Configuring => self.push_runtime_config(tenant_id).await?,
                ProvisioningStep::InstallingSkills => self.install_core_skills(tenant_id).await?,
                ProvisioningStep::HealthCheck => self.await_healthy(tenant_id).await?,
            }

            self.store
                .set_provisioning_progress(tenant_id, end)
                .await
                .map_err(Error::from)?;
        }
        Ok(())
    }

    /// Derive the tenant's secrets up front so a missing or malformed master
    /// key fails the pipeline in its first step, before any container exists.
    fn prepare_workspace(&self, tenant_id: Uuid) -> Result<()> {
        let tenant = tenant_id.to_string();
        self.secrets
            .derive_age_keypair(&tenant)
            .map_err(Error::from)?;
        let _ = self.secrets.gateway_token(&tenant);
        Ok(())
    }

    /// Allocate a port, create the container, and persist the handle
    /// immediately so a later step failing cannot orphan it.
    async fn spin_up(&self, tenant_id: Uuid) -> Result<()> {
        let tenant = self.load_tenant(tenant_id).await?;
        let tenant_key = tenant_id.to_string();
        let host_port = self.allocator.allocate(&tenant_key).await?;

        let environment = std::collections::HashMap::from([(
            "AEGIS_GATEWAY_TOKEN".to_string(),
            self.secrets.gateway_token(&tenant_key),
        )]);
        let handle = self
            .orchestrator
            .create(ContainerCreateOptions {
                tenant_id,
                image: None,
                name: None,
                environment,
                resource_limits: tenant.resource_limits,
                network_name: naming::network_name(tenant_id),
                host_port,
                container_port: self.config.container_port,
            })
            .await
            .map_err(Error::from)?;

        self.store
            .set_container_handle(tenant_id, &handle.id, &handle.url)
            .await
            .map_err(Error::from)?;
        info!(tenant = %tenant_id, container = %handle.id, port = host_port, "runtime container up");
        Ok(())
    }

    /// Regenerate the runtime configuration document and push it. The
    /// runtime restarts as part of the push.
    async fn push_runtime_config(&self, tenant_id: Uuid) -> Result<()> {
        let tenant = self.load_tenant(tenant_id).await?;
        let container_id = require_container(&tenant, ProvisioningStep::Configuring)?;

        let agents = self
            .store
            .list_agents(tenant_id)
            .await
            .map_err(Error::from)?;
        let skills = self.store.list_core_skills().await.map_err(Error::from)?;
        let tenant_key = tenant_id.to_string();
        let document = runtime_config::generate(
            &tenant,
            &agents,
            &skills,
            self.secrets.gateway_token(&tenant_key),
            self.secrets.hook_token(&tenant_key),
            self.config.container_port,
        );
        let document = serde_json::to_value(&document).map_err(|e| {
            Error::from(ProvisioningError::StepFailed {
                step: ProvisioningStep::Configuring.as_str().to_string(),
                reason: e.to_string(),
            })
        })?;

        self.orchestrator
            .update_config(
                &container_id,
                ContainerConfigUpdate {
                    runtime_config: Some(document),
                    environment: None,
                },
            )
            .await
            .map_err(Error::from)
    }

    /// Install every core skill on every agent. Installation rows are
    /// append-only, so re-running this step inserts additional rows.
    async fn install_core_skills(&self, tenant_id: Uuid) -> Result<()> {
        let agents = self
            .store
            .list_agents(tenant_id)
            .await
            .map_err(Error::from)?;
        let skills = self.store.list_core_skills().await.map_err(Error::from)?;
        for agent in &agents {
            for skill in &skills {
                self.store
                    .install_agent_skill(agent.id, skill.id)
                    .await
                    .map_err(Error::from)?;
            }
        }
        debug!(
            tenant = %tenant_id,
            agents = agents.len(),
            skills = skills.len(),
            "core skills installed"
        );
        Ok(())
    }

    /// Poll container status until it reports running and healthy. Bounded:
    /// after the configured number of polls the attempt fails.
    async fn await_healthy(&self, tenant_id: Uuid) -> Result<()> {
        let tenant = self.load_tenant(tenant_id).await?;
        let container_id = require_container(&tenant, ProvisioningStep::HealthCheck)?;
        let attempts = self.config.provisioning.health_check_attempts;
        let interval = Duration::from_secs(self.config.provisioning.health_check_interval_secs);

        for attempt in 1..=attempts {
            match self.orchestrator.get_status(&container_id).await {
                Ok(status) if status.is_healthy() => {
                    debug!(tenant = %tenant_id, polls = attempt, "runtime healthy");
                    return Ok(());
                }
                Ok(status) => {
                    debug!(
                        tenant = %tenant_id,
                        state = ?status.state,
                        health = ?status.health,
                        "runtime not healthy yet"
                    );
                }
                Err(err) => {
                    debug!(tenant = %tenant_id, error = %err, "status poll failed");
                }
            }
            if attempt < attempts {
                tokio::time::sleep(interval).await;
            }
        }
        Err(ProvisioningError::HealthCheckFailed { attempts }.into())
    }

    /// Decide between retry and terminal failure, and perform the terminal
    /// bookkeeping. A tenant that vanished mid-failure is logged and left
    /// alone; this path never raises further.
    async fn handle_failure(&self, tenant_id: Uuid, err: &Error) -> FailureDisposition {
        let tenant = match self.store.get_tenant(tenant_id).await {
            Ok(Some(tenant)) => tenant,
            Ok(None) => {
                warn!(tenant = %tenant_id, "tenant disappeared during failure handling");
                return FailureDisposition::Abort;
            }
            Err(store_err) => {
                error!(tenant = %tenant_id, error = %store_err, "failed to load tenant during failure handling");
                return FailureDisposition::Abort;
            }
        };

        let reason = err.to_string();
        let attempt = tenant.provisioning_attempt;
        if err.is_retryable() && attempt < self.config.provisioning.max_retries {
            if let Err(store_err) = self
                .store
                .record_provisioning_failure(tenant_id, &reason)
                .await
            {
                error!(tenant = %tenant_id, error = %store_err, "failed to record attempt failure");
            }
            warn!(
                tenant = %tenant_id,
                attempt,
                error = %reason,
                "provisioning attempt failed; retrying"
            );
            return FailureDisposition::Retry(attempt + 1);
        }

        if let Err(store_err) = self.store.mark_failed(tenant_id, &reason).await {
            error!(tenant = %tenant_id, error = %store_err, "failed to mark tenant failed");
        }
        if let Err(store_err) = self
            .store
            .create_alert(NewAlert {
                severity: AlertSeverity::Critical,
                title: "Tenant provisioning failed".to_string(),
                message: format!("Tenant {tenant_id} failed after {} attempts: {reason}", attempt + 1),
                tenant_id: Some(tenant_id),
            })
            .await
        {
            error!(tenant = %tenant_id, error = %store_err, "failed to raise provisioning alert");
        }
        error!(tenant = %tenant_id, attempt, error = %reason, "provisioning failed terminally");
        FailureDisposition::Terminal
    }

    async fn load_tenant(&self, tenant_id: Uuid) -> Result<Tenant> {
        self.store
            .get_tenant(tenant_id)
            .await
            .map_err(Error::from)?
            .ok_or_else(|| {
                ProvisioningError::TenantNotFound {
                    id: tenant_id.to_string(),
                }
                .into()
            })
    }
}

fn require_container(tenant: &Tenant, step: ProvisioningStep) -> Result<String> {
    tenant.container_id.clone().ok_or_else(|| {
        ProvisioningError::StepFailed {
            step: step.as_str().to_string(),
            reason: "tenant has no container handle".to_string(),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_windows_partition_the_progress_scale() {
        let mut expected_start = 0;
        for step in ProvisioningStep::SEQUENCE {
            let (start, end) = step.progress_range();
            assert_eq!(start, expected_start, "{} start", step.as_str());
            assert!(end > start);
            expected_start = end;
        }
        assert_eq!(expected_start, 100);
    }

    #[test]
    fn step_names_are_stable() {
        let names: Vec<&str> = ProvisioningStep::SEQUENCE
            .iter()
            .map(|s| s.as_str())
            .collect();
        assert_eq!(
            names,
            vec![
                "creating_namespace",
                "spinning_up",
                "configuring",
                "installing_skills",
                "health_check"
            ]
        );
    }
}
