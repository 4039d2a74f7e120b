//! In-memory store backend.
//!
//! Backs the integration tests and the mock orchestrator path. State lives
//! in `RwLock`-guarded maps; every method clones out so callers never hold
//! the locks.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{
    Agent, Alert, AlertStore, AgentStore, NewAlert, Skill, SkillStore, Store, Tenant, TenantStatus,
    TenantStore,
};
use crate::error::StoreError;

#[derive(Default)]
pub struct MemoryStore {
    tenants: RwLock<HashMap<Uuid, Tenant>>,
    agents: RwLock<Vec<Agent>>,
    skills: RwLock<Vec<Skill>>,
    agent_skills: RwLock<Vec<(Uuid, Uuid)>>,
    alerts: RwLock<Vec<Alert>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_tenant<F>(&self, id: Uuid, mutate: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Tenant),
    {
        let mut tenants = self.tenants.write().unwrap();
        let tenant = tenants.get_mut(&id).ok_or_else(|| StoreError::NotFound {
            entity: "tenant".to_string(),
            id: id.to_string(),
        })?;
        mutate(tenant);
        Ok(())
    }
}

#[async_trait]
impl TenantStore for MemoryStore {
    async fn insert_tenant(&self, tenant: &Tenant) -> Result<(), StoreError> {
        let mut tenants = self.tenants.write().unwrap();
        tenants.insert(tenant.id, tenant.clone());
        Ok(())
    }

    async fn get_tenant(&self, id: Uuid) -> Result<Option<Tenant>, StoreError> {
        Ok(self.tenants.read().unwrap().get(&id).cloned())
    }

    async fn list_tenants_by_status(
        &self,
        status: TenantStatus,
    ) -> Result<Vec<Tenant>, StoreError> {
        let tenants = self.tenants.read().unwrap();
        let mut matching: Vec<Tenant> = tenants
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|t| t.created_at);
        Ok(matching)
    }

    async fn begin_provisioning_attempt(&self, id: Uuid, attempt: u32) -> Result<(), StoreError> {
        self.with_tenant(id, |t| {
            t.status = TenantStatus::Provisioning;
            t.provisioning_attempt = attempt;
            t.provisioning_step = None;
            t.provisioning_progress = 0;
            t.provisioning_message = None;
            t.provisioning_started_at = Some(Utc::now());
        })
    }

    async fn update_provisioning(
        &self,
        id: Uuid,
        step: &str,
        progress: u8,
        message: &str,
    ) -> Result<(), StoreError> {
        self.with_tenant(id, |t| {
            t.provisioning_step = Some(step.to_string());
            t.provisioning_progress = progress;
            t.provisioning_message = Some(message.to_string());
        })
    }

    async fn set_provisioning_progress(&self, id: Uuid, progress: u8) -> Result<(), StoreError> {
        self.with_tenant(id, |t| t.provisioning_progress = progress)
    }

    async fn set_container_handle(
        &self,
        id: Uuid,
        container_id: &str,
        container_url: &str,
    ) -> Result<(), StoreError> {
        self.with_tenant(id, |t| {
            t.container_id = Some(container_id.to_string());
            t.container_url = Some(container_url.to_string());
        })
    }

    async fn record_provisioning_failure(&self, id: Uuid, reason: &str) -> Result<(), StoreError> {
        self.with_tenant(id, |t| {
            t.provisioning_failed_reason = Some(reason.to_string());
        })
    }

    async fn mark_active(&self, id: Uuid) -> Result<(), StoreError> {
        self.with_tenant(id, |t| {
            t.status = TenantStatus::Active;
            t.provisioning_step = Some("completed".to_string());
            t.provisioning_progress = 100;
            t.provisioning_failed_reason = None;
        })
    }

    async fn mark_failed(&self, id: Uuid, reason: &str) -> Result<(), StoreError> {
        self.with_tenant(id, |t| {
            t.status = TenantStatus::Failed;
            t.provisioning_step = Some("failed".to_string());
            t.provisioning_failed_reason = Some(reason.to_string());
        })
    }

    async fn occupied_container_urls(&self) -> Result<Vec<String>, StoreError> {
        let tenants = self.tenants.read().unwrap();
        Ok(tenants
            .values()
            .filter_map(|t| t.container_url.clone())
            .collect())
    }
}

#[async_trait]
impl AgentStore for MemoryStore {
    async fn insert_agent(&self, agent: &Agent) -> Result<(), StoreError> {
        self.agents.write().unwrap().push(agent.clone());
        Ok(())
    }

    async fn list_agents(&self, tenant_id: Uuid) -> Result<Vec<Agent>, StoreError> {
        Ok(self
            .agents
            .read()
            .unwrap()
            .iter()
            .filter(|a| a.tenant_id == tenant_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SkillStore for MemoryStore {
    async fn insert_skill(&self, skill: &Skill) -> Result<(), StoreError> {
        self.skills.write().unwrap().push(skill.clone());
        Ok(())
    }

    async fn list_core_skills(&self) -> Result<Vec<Skill>, StoreError> {
        Ok(self
            .skills
            .read()
            .unwrap()
            .iter()
            .filter(|s| s.core)
            .cloned()
            .collect())
    }

    async fn install_agent_skill(&self, agent_id: Uuid, skill_id: Uuid) -> Result<(), StoreError> {
        self.agent_skills.write().unwrap().push((agent_id, skill_id));
        Ok(())
    }

    async fn installed_skills(&self, tenant_id: Uuid) -> Result<Vec<Skill>, StoreError> {
        let agent_ids: Vec<Uuid> = self
            .agents
            .read()
            .unwrap()
            .iter()
            .filter(|a| a.tenant_id == tenant_id)
            .map(|a| a.id)
            .collect();
        let installed: Vec<Uuid> = self
            .agent_skills
            .read()
            .unwrap()
            .iter()
            .filter(|(agent_id, _)| agent_ids.contains(agent_id))
            .map(|(_, skill_id)| *skill_id)
            .collect();

        let skills = self.skills.read().unwrap();
        let mut result: Vec<Skill> = skills
            .iter()
            .filter(|s| installed.contains(&s.id))
            .cloned()
            .collect();
        result.dedup_by_key(|s| s.id);
        Ok(result)
    }

    async fn agent_skill_rows(&self, agent_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        Ok(self
            .agent_skills
            .read()
            .unwrap()
            .iter()
            .filter(|(a, _)| *a == agent_id)
            .map(|(_, s)| *s)
            .collect())
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn create_alert(&self, alert: NewAlert) -> Result<Alert, StoreError> {
        let record = Alert {
            id: Uuid::new_v4(),
            severity: alert.severity,
            title: alert.title,
            message: alert.message,
            tenant_id: alert.tenant_id,
            resolved: false,
            created_at: Utc::now(),
        };
        self.alerts.write().unwrap().push(record.clone());
        Ok(record)
    }

    async fn list_alerts(&self, tenant_id: Option<Uuid>) -> Result<Vec<Alert>, StoreError> {
        Ok(self
            .alerts
            .read()
            .unwrap()
            .iter()
            .filter(|a| tenant_id.is_none() || a.tenant_id == tenant_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
