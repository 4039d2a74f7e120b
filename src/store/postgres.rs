//! PostgreSQL store backend.

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::{NoTls, Row};
use uuid::Uuid;

use super::{
    Agent, Alert, AlertSeverity, AlertStore, AgentStore, NewAlert, Skill, SkillStore, Store,
    Tenant, TenantStatus, TenantStore,
};
use crate::error::StoreError;
use crate::orchestrator::ResourceLimits;

pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    /// Build a pooled store from a connection URL.
    pub fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pg_config: tokio_postgres::Config = database_url.parse()?;
        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager).max_size(16).build()?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> Pool {
        self.pool.clone()
    }

    fn tenant_from_row(row: &Row) -> Result<Tenant, StoreError> {
        let status_raw: String = row.get("status");
        let status = TenantStatus::parse(&status_raw).ok_or_else(|| {
            StoreError::Serialization(format!("unknown tenant status: {status_raw}"))
        })?;
        let limits: serde_json::Value = row.get("resource_limits");
        let resource_limits: ResourceLimits = serde_json::from_value(limits)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        Ok(Tenant {
            id: row.get("id"),
            name: row.get("name"),
            status,
            container_id: row.get("container_id"),
            container_url: row.get("container_url"),
            resource_limits,
            provisioning_step: row.get("provisioning_step"),
            provisioning_progress: row.get::<_, i16>("provisioning_progress") as u8,
            provisioning_attempt: row.get::<_, i32>("provisioning_attempt") as u32,
            provisioning_message: row.get("provisioning_message"),
            provisioning_started_at: row.get("provisioning_started_at"),
            provisioning_failed_reason: row.get("provisioning_failed_reason"),
            created_at: row.get("created_at"),
        })
    }

    fn agent_from_row(row: &Row) -> Result<Agent, StoreError> {
        let channels: serde_json::Value = row.get("channels");
        let allowed_tools: serde_json::Value = row.get("allowed_tools");
        Ok(Agent {
            id: row.get("id"),
            tenant_id: row.get("tenant_id"),
            name: row.get("name"),
            model: row.get("model"),
            channels: serde_json::from_value(channels)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            allowed_tools: serde_json::from_value(allowed_tools)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            sandbox_profile: row.get("sandbox_profile"),
        })
    }

    fn skill_from_row(row: &Row) -> Skill {
        Skill {
            id: row.get("id"),
            name: row.get("name"),
            core: row.get("core"),
        }
    }

    fn alert_from_row(row: &Row) -> Result<Alert, StoreError> {
        let severity_raw: String = row.get("severity");
        let severity = match severity_raw.as_str() {
            "info" => AlertSeverity::Info,
            "warning" => AlertSeverity::Warning,
            "critical" => AlertSeverity::Critical,
            other => {
                return Err(StoreError::Serialization(format!(
                    "unknown alert severity: {other}"
                )));
            }
        };
        Ok(Alert {
            id: row.get("id"),
            severity,
            title: row.get("title"),
            message: row.get("message"),
            tenant_id: row.get("tenant_id"),
            resolved: row.get("resolved"),
            created_at: row.get("created_at"),
        })
    }
}

#[async_trait]
impl TenantStore for PgStore {
    async fn insert_tenant(&self, tenant: &Tenant) -> Result<(), StoreError> {
        let conn = self.pool.get().await?;
        let limits = serde_json::to_value(tenant.resource_limits)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        conn.execute(
            "INSERT INTO tenants (
                id, name, status, container_id, container_url, resource_limits,
                provisioning_step, provisioning_progress, provisioning_attempt,
                provisioning_message, provisioning_started_at,
                provisioning_failed_reason, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (id) DO NOTHING",
            &[
                &tenant.id,
                &tenant.name,
                &tenant.status.as_str(),
                &tenant.container_id,
                &tenant.container_url,
                &limits,
                &tenant.provisioning_step,
                &(tenant.provisioning_progress as i16),
                &(tenant.provisioning_attempt as i32),
                &tenant.provisioning_message,
                &tenant.provisioning_started_at,
                &tenant.provisioning_failed_reason,
                &tenant.created_at,
            ],
        )
        .await?;
        Ok(())
    }

    async fn get_tenant(&self, id: Uuid) -> Result<Option<Tenant>, StoreError> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt("SELECT * FROM tenants WHERE id = $1", &[&id])
            .await?;
        row.as_ref().map(Self::tenant_from_row).transpose()
    }

    async fn list_tenants_by_status(
        &self,
        status: TenantStatus,
    ) -> Result<Vec<Tenant>, StoreError> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                "SELECT * FROM tenants WHERE status = $1 ORDER BY created_at",
                &[&status.as_str()],
            )
            .await?;
        rows.iter().map(Self::tenant_from_row).collect()
    }

    async fn begin_provisioning_attempt(&self, id: Uuid, attempt: u32) -> Result<(), StoreError> {
        let conn = self.pool.get().await?;
        let updated = conn
            .execute(
                "UPDATE tenants SET
                    status = 'provisioning',
                    provisioning_attempt = $2,
                    provisioning_step = NULL,
                    provisioning_progress = 0,
                    provisioning_message = NULL,
                    provisioning_started_at = NOW()
                 WHERE id = $1",
                &[&id, &(attempt as i32)],
            )
            .await?;
        require_row(updated, "tenant", id)
    }

    async fn update_provisioning(
        &self,
        id: Uuid,
        step: &str,
        progress: u8,
        message: &str,
    ) -> Result<(), StoreError> {
        let conn = self.pool.get().await?;
        let updated = conn
            .execute(
                "UPDATE tenants SET
                    provisioning_step = $2,
                    provisioning_progress = $3,
                    provisioning_message = $4
                 WHERE id = $1",
                &[&id, &step, &(progress as i16), &message],
            )
            .await?;
        require_row(updated, "tenant", id)
    }

    async fn set_provisioning_progress(&self, id: Uuid, progress: u8) -> Result<(), StoreError> {
        let conn = self.pool.get().await?;
        let updated = conn
            .execute(
                "UPDATE tenants SET provisioning_progress = $2 WHERE id = $1",
                &[&id, &(progress as i16)],
            )
            .await?;
        require_row(updated, "tenant", id)
    }

    async fn set_container_handle(
        &self,
        id: Uuid,
        container_id: &str,
        container_url: &str,
    ) -> Result<(), StoreError> {
        let conn = self.pool.get().await?;
        let updated = conn
            .execute(
                "UPDATE tenants SET container_id = $2, container_url = $3 WHERE id = $1",
                &[&id, &container_id, &container_url],
            )
            .await?;
        require_row(updated, "tenant", id)
    }

    async fn record_provisioning_failure(&self, id: Uuid, reason: &str) -> Result<(), StoreError> {
        let conn = self.pool.get().await?;
        let updated = conn
            .execute(
                "UPDATE tenants SET provisioning_failed_reason = $2 WHERE id = $1",
                &[&id, &reason],
            )
            .await?;
        require_row(updated, "tenant", id)
    }

    async fn mark_active(&self, id: Uuid) -> Result<(), StoreError> {
        let conn = self.pool.get().await?;
        let updated = conn
            .execute(
                "UPDATE tenants SET
                    status = 'active',
                    provisioning_step = 'completed',
                    provisioning_progress = 100,
                    provisioning_failed_reason = NULL
                 WHERE id = $1",
                &[&id],
            )
            .await?;
        require_row(updated, "tenant", id)
    }

    async fn mark_failed(&self, id: Uuid, reason: &str) -> Result<(), StoreError> {
        let conn = self.pool.get().await?;
        let updated = conn
            .execute(
                "UPDATE tenants SET
                    status = 'failed',
                    provisioning_step = 'failed',
                    provisioning_failed_reason = $2
                 WHERE id = $1",
                &[&id, &reason],
            )
            .await?;
        require_row(updated, "tenant", id)
    }

    async fn occupied_container_urls(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                "SELECT container_url FROM tenants WHERE container_url IS NOT NULL",
                &[],
            )
            .await?;
        Ok(rows.iter().map(|r| r.get("container_url")).collect())
    }
}

#[async_trait]
impl AgentStore for PgStore {
    async fn insert_agent(&self, agent: &Agent) -> Result<(), StoreError> {
        let conn = self.pool.get().await?;
        let channels = serde_json::to_value(&agent.channels)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let allowed_tools = serde_json::to_value(&agent.allowed_tools)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        conn.execute(
            "INSERT INTO agents (id, tenant_id, name, model, channels, allowed_tools, sandbox_profile)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (id) DO NOTHING",
            &[
                &agent.id,
                &agent.tenant_id,
                &agent.name,
                &agent.model,
                &channels,
                &allowed_tools,
                &agent.sandbox_profile,
            ],
        )
        .await?;
        Ok(())
    }

    async fn list_agents(&self, tenant_id: Uuid) -> Result<Vec<Agent>, StoreError> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                "SELECT * FROM agents WHERE tenant_id = $1 ORDER BY name",
                &[&tenant_id],
            )
            .await?;
        rows.iter().map(Self::agent_from_row).collect()
    }
}

#[async_trait]
impl SkillStore for PgStore {
    async fn insert_skill(&self, skill: &Skill) -> Result<(), StoreError> {
        let conn = self.pool.get().await?;
        conn.execute(
            "INSERT INTO skills (id, name, core) VALUES ($1, $2, $3)
             ON CONFLICT (id) DO NOTHING",
            &[&skill.id, &skill.name, &skill.core],
        )
        .await?;
        Ok(())
    }

    async fn list_core_skills(&self) -> Result<Vec<Skill>, StoreError> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query("SELECT * FROM skills WHERE core ORDER BY name", &[])
            .await?;
        Ok(rows.iter().map(Self::skill_from_row).collect())
    }

    // Deliberately no uniqueness constraint: installation rows are
    // append-only and re-runs insert duplicates.
    async fn install_agent_skill(&self, agent_id: Uuid, skill_id: Uuid) -> Result<(), StoreError> {
        let conn = self.pool.get().await?;
        conn.execute(
            "INSERT INTO agent_skills (agent_id, skill_id) VALUES ($1, $2)",
            &[&agent_id, &skill_id],
        )
        .await?;
        Ok(())
    }

    async fn installed_skills(&self, tenant_id: Uuid) -> Result<Vec<Skill>, StoreError> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                "SELECT DISTINCT s.id, s.name, s.core
                 FROM skills s
                 JOIN agent_skills ags ON ags.skill_id = s.id
                 JOIN agents a ON a.id = ags.agent_id
                 WHERE a.tenant_id = $1
                 ORDER BY s.name",
                &[&tenant_id],
            )
            .await?;
        Ok(rows.iter().map(Self::skill_from_row).collect())
    }

    async fn agent_skill_rows(&self, agent_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                "SELECT skill_id FROM agent_skills WHERE agent_id = $1",
                &[&agent_id],
            )
            .await?;
        Ok(rows.iter().map(|r| r.get("skill_id")).collect())
    }
}

#[async_trait]
impl AlertStore for PgStore {
    async fn create_alert(&self, alert: NewAlert) -> Result<Alert, StoreError> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_one(
                "INSERT INTO alerts (id, severity, title, message, tenant_id, resolved, created_at)
                 VALUES ($1, $2, $3, $4, $5, FALSE, NOW())
                 RETURNING *",
                &[
                    &Uuid::new_v4(),
                    &alert.severity.as_str(),
                    &alert.title,
                    &alert.message,
                    &alert.tenant_id,
                ],
            )
            .await?;
        Self::alert_from_row(&row)
    }

    async fn list_alerts(&self, tenant_id: Option<Uuid>) -> Result<Vec<Alert>, StoreError> {
        let conn = self.pool.get().await?;
        let rows = match tenant_id {
            Some(id) => {
                conn.query(
                    "SELECT * FROM alerts WHERE tenant_id = $1 ORDER BY created_at DESC",
                    &[&id],
                )
                .await?
            }
            None => {
                conn.query("SELECT * FROM alerts ORDER BY created_at DESC", &[])
                    .await?
            }
        };
        rows.iter().map(Self::alert_from_row).collect()
    }
}

#[async_trait]
impl Store for PgStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        let conn = self.pool.get().await?;
        conn.batch_execute(
            r#"
            CREATE TABLE IF NOT EXISTS tenants (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                container_id TEXT,
                container_url TEXT,
                resource_limits JSONB NOT NULL DEFAULT '{}'::jsonb,
                provisioning_step TEXT,
                provisioning_progress SMALLINT NOT NULL DEFAULT 0,
                provisioning_attempt INT NOT NULL DEFAULT 0,
                provisioning_message TEXT,
                provisioning_started_at TIMESTAMPTZ,
                provisioning_failed_reason TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            CREATE INDEX IF NOT EXISTS idx_tenants_status ON tenants(status);

            CREATE TABLE IF NOT EXISTS agents (
                id UUID PRIMARY KEY,
                tenant_id UUID NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                model TEXT NOT NULL,
                channels JSONB NOT NULL DEFAULT '[]'::jsonb,
                allowed_tools JSONB NOT NULL DEFAULT '[]'::jsonb,
                sandbox_profile TEXT NOT NULL DEFAULT 'restricted'
            );
            CREATE INDEX IF NOT EXISTS idx_agents_tenant ON agents(tenant_id);

            CREATE TABLE IF NOT EXISTS skills (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL,
                core BOOLEAN NOT NULL DEFAULT FALSE
            );

            CREATE TABLE IF NOT EXISTS agent_skills (
                agent_id UUID NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
                skill_id UUID NOT NULL REFERENCES skills(id) ON DELETE CASCADE,
                installed_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            CREATE INDEX IF NOT EXISTS idx_agent_skills_agent ON agent_skills(agent_id);

            CREATE TABLE IF NOT EXISTS alerts (
                id UUID PRIMARY KEY,
                severity TEXT NOT NULL,
                title TEXT NOT NULL,
                message TEXT NOT NULL,
                tenant_id UUID,
                resolved BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            CREATE INDEX IF NOT EXISTS idx_alerts_tenant ON alerts(tenant_id);
            "#,
        )
        .await?;
        Ok(())
    }
}

fn require_row(updated: u64, entity: &str, id: Uuid) -> Result<(), StoreError> {
    if updated == 0 {
        Err(StoreError::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        })
    } else {
        Ok(())
    }
}
