//! End-to-end provisioning tests over the in-memory backends.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use uuid::Uuid;

use aegis_control::config::{
    Config, DockerConfig, Environment, KubernetesConfig, OrchestratorBackend, PortsConfig,
    ProvisioningConfig, SecretsConfig,
};
use aegis_control::error::StoreError;
use aegis_control::orchestrator::ContainerOrchestrator;
use aegis_control::orchestrator::mock::MockOrchestrator;
use aegis_control::provision::{Pipeline, PortAllocator, ProvisioningService};
use aegis_control::secrets::SecretsManager;
use aegis_control::store::memory::MemoryStore;
use aegis_control::store::{
    Agent, AgentStore, Alert, AlertStore, NewAlert, Skill, SkillStore, Store, Tenant, TenantStatus,
    TenantStore,
};

fn test_config(base_port: u16, range: u16) -> Config {
    Config {
        backend: OrchestratorBackend::Mock,
        image: "aegis/agent-runtime:test".to_string(),
        container_port: 18789,
        docker: DockerConfig::default(),
        kubernetes: KubernetesConfig {
            enabled: false,
            context: None,
            service_domain: "svc.cluster.local".to_string(),
        },
        ports: PortsConfig { base_port, range },
        provisioning: ProvisioningConfig {
            max_retries: 3,
            health_check_attempts: 2,
            health_check_interval_secs: 0,
            api_call_timeout_secs: 5,
        },
        secrets: SecretsConfig {
            master_key: None,
            environment: Environment::Test,
        },
    }
}

struct Harness {
    store: Arc<RecordingStore>,
    orchestrator: Arc<MockOrchestrator>,
    secrets: Arc<SecretsManager>,
    pipeline: Pipeline,
}

fn harness(config: Config) -> Harness {
    let store = Arc::new(RecordingStore::new());
    let orchestrator = Arc::new(MockOrchestrator::new());
    let secrets = Arc::new(SecretsManager::from_key([7u8; 32]));
    let allocator = PortAllocator::new(
        store.clone() as Arc<dyn TenantStore>,
        &config.ports,
    );
    let pipeline = Pipeline::new(
        store.clone() as Arc<dyn Store>,
        orchestrator.clone(),
        secrets.clone(),
        allocator,
        config,
    );
    Harness {
        store,
        orchestrator,
        secrets,
        pipeline,
    }
}

async fn seed_tenant(store: &RecordingStore, agents: usize, core_skills: usize) -> Tenant {
    let tenant = Tenant::new("acme");
    store.insert_tenant(&tenant).await.unwrap();
    for i in 0..agents {
        store
            .insert_agent(&Agent {
                id: Uuid::new_v4(),
                tenant_id: tenant.id,
                name: format!("agent-{i}"),
                model: "claude-sonnet-4".to_string(),
                channels: vec!["slack".to_string()],
                allowed_tools: vec!["web_search".to_string()],
                sandbox_profile: "restricted".to_string(),
            })
            .await
            .unwrap();
    }
    for i in 0..core_skills {
        store
            .insert_skill(&Skill {
                id: Uuid::new_v4(),
                name: format!("skill-{i}"),
                core: true,
            })
            .await
            .unwrap();
    }
    tenant
}

#[tokio::test]
async fn pipeline_provisions_tenant_end_to_end() {
    let h = harness(test_config(19000, 10));
    let tenant = seed_tenant(&h.store, 2, 3).await;

    h.pipeline.run(tenant.id).await.unwrap();

    let done = h.store.get_tenant(tenant.id).await.unwrap().unwrap();
    assert_eq!(done.status, TenantStatus::Active);
    assert_eq!(done.provisioning_progress, 100);
    assert_eq!(done.provisioning_step.as_deref(), Some("completed"));
    assert_eq!(done.provisioning_attempt, 0);
    assert!(done.provisioning_started_at.is_some());
    assert!(done.provisioning_failed_reason.is_none());

    // Container handle persisted, host port inside the configured window.
    let url = done.container_url.unwrap();
    let port: u16 = url.rsplit(':').next().unwrap().parse().unwrap();
    assert!((19000..19010).contains(&port));
    let container_id = done.container_id.unwrap();

    // Gateway token reached the container environment and verifies.
    let env = h.orchestrator.environment(&container_id).unwrap();
    let token = &env["AEGIS_GATEWAY_TOKEN"];
    assert!(h.secrets.verify_gateway_token(&tenant.id.to_string(), token));

    // Runtime config document was pushed with every agent in it.
    let doc = h.orchestrator.runtime_config(&container_id).unwrap();
    assert_eq!(doc["tenant_id"], tenant.id.to_string());
    assert_eq!(doc["agents"].as_array().unwrap().len(), 2);
    assert_eq!(doc["skills"].as_array().unwrap().len(), 3);
    assert_eq!(doc["gateway"]["auth_token"], *token);

    // A provisioned runtime serves its recent log tail.
    let logs = h
        .orchestrator
        .get_logs(&container_id, Some(10), None)
        .await
        .unwrap();
    assert!(!logs.is_empty());

    // Every agent got every core skill.
    for agent in h.store.list_agents(tenant.id).await.unwrap() {
        assert_eq!(h.store.agent_skill_rows(agent.id).await.unwrap().len(), 3);
    }

    // No alerts on the happy path.
    assert!(h.store.list_alerts(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn progress_is_non_decreasing_and_walks_all_steps() {
    let h = harness(test_config(19000, 10));
    let tenant = seed_tenant(&h.store, 1, 1).await;

    h.pipeline.run(tenant.id).await.unwrap();

    let events = h.store.events();
    let steps: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            StoreEvent::Step { step, .. } => Some(step.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(
        steps,
        vec![
            "creating_namespace",
            "spinning_up",
            "configuring",
            "installing_skills",
            "health_check"
        ]
    );

    let mut last = 0i32;
    for event in &events {
        let progress = match event {
            StoreEvent::Attempt { .. } => continue,
            StoreEvent::Step { progress, .. } | StoreEvent::Progress(progress) => *progress as i32,
        };
        assert!(progress >= last, "progress regressed: {progress} < {last}");
        last = progress;
    }
    assert_eq!(last, 100);
}

#[tokio::test]
async fn transient_create_failure_retries_whole_pipeline() {
    let h = harness(test_config(19000, 10));
    let tenant = seed_tenant(&h.store, 1, 1).await;
    h.orchestrator.fail_next_creates(1);

    h.pipeline.run(tenant.id).await.unwrap();

    let done = h.store.get_tenant(tenant.id).await.unwrap().unwrap();
    assert_eq!(done.status, TenantStatus::Active);
    assert_eq!(done.provisioning_attempt, 1);
    assert!(done.provisioning_failed_reason.is_none());
    assert!(h.store.list_alerts(None).await.unwrap().is_empty());

    // The failed attempt left nothing behind; only the retry's container
    // exists, under the tenant's stable name.
    assert_eq!(h.orchestrator.container_count(), 1);

    // The first attempt died before installation, so only the retry
    // inserted rows.
    let agent = &h.store.list_agents(tenant.id).await.unwrap()[0];
    assert_eq!(h.store.agent_skill_rows(agent.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn exhausted_retries_fail_terminally_with_one_alert() {
    let h = harness(test_config(19000, 10));
    let tenant = seed_tenant(&h.store, 1, 1).await;
    // One initial run plus max_retries retries, all failing.
    h.orchestrator.fail_next_creates(4);

    let err = h.pipeline.run(tenant.id).await.unwrap_err();

    let done = h.store.get_tenant(tenant.id).await.unwrap().unwrap();
    assert_eq!(done.status, TenantStatus::Failed);
    assert_eq!(done.provisioning_step.as_deref(), Some("failed"));
    assert_eq!(done.provisioning_attempt, 3);
    // Failed reason is the last error's message.
    assert_eq!(done.provisioning_failed_reason.unwrap(), err.to_string());

    let alerts = h.store.list_alerts(Some(tenant.id)).await.unwrap();
    assert_eq!(alerts.len(), 1, "exactly one alert per terminal failure");
    assert_eq!(
        alerts[0].severity,
        aegis_control::store::AlertSeverity::Critical
    );
    assert!(alerts[0].message.contains("4 attempts"));
}

#[tokio::test]
async fn port_capacity_exhaustion_is_terminal_without_retries() {
    let h = harness(test_config(19000, 1));
    // Occupy the only port in the window.
    let squatter = {
        let mut t = Tenant::new("squatter");
        t.container_url = Some("http://127.0.0.1:19000".to_string());
        t
    };
    h.store.insert_tenant(&squatter).await.unwrap();
    let tenant = seed_tenant(&h.store, 1, 1).await;

    h.pipeline.run(tenant.id).await.unwrap_err();

    let done = h.store.get_tenant(tenant.id).await.unwrap().unwrap();
    assert_eq!(done.status, TenantStatus::Failed);
    // Non-retryable: no retry attempts were burned.
    assert_eq!(done.provisioning_attempt, 0);
    assert_eq!(h.store.list_alerts(Some(tenant.id)).await.unwrap().len(), 1);
    // No container was ever created.
    assert_eq!(h.orchestrator.container_count(), 0);
}

#[tokio::test]
async fn unhealthy_runtime_fails_attempt_then_recovers_on_retry() {
    let h = harness(test_config(19000, 10));
    let tenant = seed_tenant(&h.store, 1, 1).await;
    // Enough unhealthy polls to burn the first attempt's budget exactly.
    h.orchestrator.report_unhealthy_for(2);

    h.pipeline.run(tenant.id).await.unwrap();

    let done = h.store.get_tenant(tenant.id).await.unwrap().unwrap();
    assert_eq!(done.status, TenantStatus::Active);
    assert_eq!(done.provisioning_attempt, 1);
}

#[tokio::test]
async fn duplicate_submissions_are_rejected_while_in_flight() {
    let h = harness(test_config(19000, 10));
    let tenant = seed_tenant(&h.store, 1, 1).await;
    let store = h.store.clone();

    let service = ProvisioningService::new(h.pipeline);
    assert!(service.submit(tenant.id));
    assert!(!service.submit(tenant.id), "second submission must be rejected");

    while service.is_inflight(tenant.id) {
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    let done = store.get_tenant(tenant.id).await.unwrap().unwrap();
    assert_eq!(done.status, TenantStatus::Active);
    // Once the run finishes, a new submission is accepted again.
    assert!(service.submit(tenant.id));
}

// ---------------------------------------------------------------------------
// Recording store: delegates to MemoryStore and keeps an ordered log of the
// provisioning status writes, so tests can assert on progress ordering.

#[derive(Debug, Clone)]
enum StoreEvent {
    Attempt { attempt: u32 },
    Step { step: String, progress: u8 },
    Progress(u8),
}

struct RecordingStore {
    inner: MemoryStore,
    events: Mutex<Vec<StoreEvent>>,
}

impl RecordingStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            events: Mutex::new(Vec::new()),
        }
    }

    fn events(&self) -> Vec<StoreEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl TenantStore for RecordingStore {
    async fn insert_tenant(&self, tenant: &Tenant) -> Result<(), StoreError> {
        self.inner.insert_tenant(tenant).await
    }

    async fn get_tenant(&self, id: Uuid) -> Result<Option<Tenant>, StoreError> {
        self.inner.get_tenant(id).await
    }

    async fn list_tenants_by_status(
        &self,
        status: TenantStatus,
    ) -> Result<Vec<Tenant>, StoreError> {
        self.inner.list_tenants_by_status(status).await
    }

    async fn begin_provisioning_attempt(&self, id: Uuid, attempt: u32) -> Result<(), StoreError> {
        self.events
            .lock()
            .unwrap()
            .push(StoreEvent::Attempt { attempt });
        self.inner.begin_provisioning_attempt(id, attempt).await
    }

    async fn update_provisioning(
        &self,
        id: Uuid,
        step: &str,
        progress: u8,
        message: &str,
    ) -> Result<(), StoreError> {
        self.events.lock().unwrap().push(StoreEvent::Step {
            step: step.to_string(),
            progress,
        });
        self.inner.update_provisioning(id, step, progress, message).await
    }

    async fn set_provisioning_progress(&self, id: Uuid, progress: u8) -> Result<(), StoreError> {
        self.events
            .lock()
            .unwrap()
            .push(StoreEvent::Progress(progress));
        self.inner.set_provisioning_progress(id, progress).await
    }

    async fn set_container_handle(
        &self,
        id: Uuid,
        container_id: &str,
        container_url: &str,
    ) -> Result<(), StoreError> {
        self.inner
            .set_container_handle(id, container_id, container_url)
            .await
    }

    async fn record_provisioning_failure(&self, id: Uuid, reason: &str) -> Result<(), StoreError> {
        self.inner.record_provisioning_failure(id, reason).await
    }

    async fn mark_active(&self, id: Uuid) -> Result<(), StoreError> {
        self.inner.mark_active(id).await
    }

    async fn mark_failed(&self, id: Uuid, reason: &str) -> Result<(), StoreError> {
        self.inner.mark_failed(id, reason).await
    }

    async fn occupied_container_urls(&self) -> Result<Vec<String>, StoreError> {
        self.inner.occupied_container_urls().await
    }
}

#[async_trait]
impl AgentStore for RecordingStore {
    async fn insert_agent(&self, agent: &Agent) -> Result<(), StoreError> {
        self.inner.insert_agent(agent).await
    }

    async fn list_agents(&self, tenant_id: Uuid) -> Result<Vec<Agent>, StoreError> {
        self.inner.list_agents(tenant_id).await
    }
}

#[async_trait]
impl SkillStore for RecordingStore {
    async fn insert_skill(&self, skill: &Skill) -> Result<(), StoreError> {
        self.inner.insert_skill(skill).await
    }

    async fn list_core_skills(&self) -> Result<Vec<Skill>, StoreError> {
        self.inner.list_core_skills().await
    }

    async fn install_agent_skill(&self, agent_id: Uuid, skill_id: Uuid) -> Result<(), StoreError> {
        self.inner.install_agent_skill(agent_id, skill_id).await
    }

    async fn installed_skills(&self, tenant_id: Uuid) -> Result<Vec<Skill>, StoreError> {
        self.inner.installed_skills(tenant_id).await
    }

    async fn agent_skill_rows(&self, agent_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        self.inner.agent_skill_rows(agent_id).await
    }
}

#[async_trait]
impl AlertStore for RecordingStore {
    async fn create_alert(&self, alert: NewAlert) -> Result<Alert, StoreError> {
        self.inner.create_alert(alert).await
    }

    async fn list_alerts(&self, tenant_id: Option<Uuid>) -> Result<Vec<Alert>, StoreError> {
        self.inner.list_alerts(tenant_id).await
    }
}

#[async_trait]
impl Store for RecordingStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.inner.ensure_schema().await
    }
}
