//! Generator for the runtime configuration document.
//!
//! Produces the fixed-schema JSON the agent runtime parses on boot: gateway
//! binding and auth, per-agent policy, channel bindings, the inter-agent
//! messaging allowlist, installed skills, and log redaction patterns. The
//! document is regenerated from the store on every push, never edited in
//! place.

use serde::Serialize;

use crate::store::{Agent, Skill, Tenant};

pub const CONFIG_VERSION: &str = "v1";

/// Patterns the runtime must redact from its logs. Secrets injected by the
/// control plane all match one of these.
const REDACT_PATTERNS: &[&str] = &[
    r"AGE-SECRET-KEY-1[A-Z0-9]+",
    r"hook:[A-Za-z0-9_-]{16,}",
    r"(?i)(api[_-]?key|token|secret)\s*[=:]\s*\S+",
];

#[derive(Debug, Serialize)]
pub struct RuntimeConfig {
    pub version: &'static str,
    pub tenant_id: String,
    pub gateway: GatewaySection,
    pub agents: Vec<AgentPolicy>,
    pub messaging: MessagingSection,
    pub skills: Vec<String>,
    pub logging: LoggingSection,
}

#[derive(Debug, Serialize)]
pub struct GatewaySection {
    /// The gateway binds inside the container; the port mapping or Service
    /// is the only way in.
    pub bind: &'static str,
    pub port: u16,
    pub auth_token: String,
    pub hook_token: String,
}

#[derive(Debug, Serialize)]
pub struct AgentPolicy {
    pub id: String,
    pub name: String,
    pub model: String,
    pub channels: Vec<String>,
    pub tools: ToolPolicy,
    pub sandbox: SandboxPolicy,
}

#[derive(Debug, Serialize)]
pub struct ToolPolicy {
    pub allowed: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct SandboxPolicy {
    pub profile: String,
}

#[derive(Debug, Serialize)]
pub struct MessagingSection {
    /// Agent ids allowed to message each other. Scoped to the tenant; the
    /// runtime rejects anything not listed here.
    pub allow: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct LoggingSection {
    pub redact: Vec<String>,
}

/// Assemble the document for one tenant from its persisted state.
pub fn generate(
    tenant: &Tenant,
    agents: &[Agent],
    skills: &[Skill],
    gateway_token: String,
    hook_token: String,
    container_port: u16,
) -> RuntimeConfig {
    let mut skill_names: Vec<String> = skills.iter().map(|s| s.name.clone()).collect();
    skill_names.sort();
    skill_names.dedup();

    RuntimeConfig {
        version: CONFIG_VERSION,
        tenant_id: tenant.id.to_string(),
        gateway: GatewaySection {
            bind: "0.0.0.0",
            port: container_port,
            auth_token: gateway_token,
            hook_token,
        },
        agents: agents
            .iter()
            .map(|agent| AgentPolicy {
                id: agent.id.to_string(),
                name: agent.name.clone(),
                model: agent.model.clone(),
                channels: agent.channels.clone(),
                tools: ToolPolicy {
                    allowed: agent.allowed_tools.clone(),
                },
                sandbox: SandboxPolicy {
                    profile: agent.sandbox_profile.clone(),
                },
            })
            .collect(),
        messaging: MessagingSection {
            allow: agents.iter().map(|a| a.id.to_string()).collect(),
        },
        skills: skill_names,
        logging: LoggingSection {
            redact: REDACT_PATTERNS.iter().map(|p| p.to_string()).collect(),
        },
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::store::Tenant;

    fn agent(tenant_id: Uuid, name: &str) -> Agent {
        Agent {
            id: Uuid::new_v4(),
            tenant_id,
            name: name.to_string(),
            model: "claude-sonnet-4".to_string(),
            channels: vec!["slack".to_string()],
            allowed_tools: vec!["web_search".to_string()],
            sandbox_profile: "restricted".to_string(),
        }
    }

    #[test]
    fn document_covers_every_agent() {
        let tenant = Tenant::new("acme");
        let agents = vec![agent(tenant.id, "support"), agent(tenant.id, "triage")];
        let config = generate(
            &tenant,
            &agents,
            &[],
            "gw-token".to_string(),
            "hook:token".to_string(),
            18789,
        );

        assert_eq!(config.version, "v1");
        assert_eq!(config.agents.len(), 2);
        assert_eq!(config.messaging.allow.len(), 2);
        assert_eq!(config.gateway.port, 18789);
        assert_eq!(config.gateway.bind, "0.0.0.0");
    }

    #[test]
    fn skills_are_sorted_and_deduplicated() {
        let tenant = Tenant::new("acme");
        let mk = |name: &str| Skill {
            id: Uuid::new_v4(),
            name: name.to_string(),
            core: true,
        };
        let skills = vec![mk("search"), mk("memory"), mk("search")];
        let config = generate(
            &tenant,
            &[],
            &skills,
            String::new(),
            String::new(),
            18789,
        );
        assert_eq!(config.skills, vec!["memory", "search"]);
    }

    #[test]
    fn redaction_patterns_cover_injected_secrets() {
        let tenant = Tenant::new("acme");
        let config = generate(&tenant, &[], &[], String::new(), String::new(), 18789);
        let doc = serde_json::to_value(&config).unwrap();
        let patterns = doc["logging"]["redact"].as_array().unwrap();
        assert!(!patterns.is_empty());
        assert!(
            patterns
                .iter()
                .any(|p| p.as_str().unwrap().contains("AGE-SECRET-KEY-1"))
        );
    }

    #[test]
    fn serializes_with_stable_field_names() {
        let tenant = Tenant::new("acme");
        let agents = vec![agent(tenant.id, "support")];
        let config = generate(
            &tenant,
            &agents,
            &[],
            "gw".to_string(),
            "hook:x".to_string(),
            18789,
        );
        let doc = serde_json::to_value(&config).unwrap();
        assert_eq!(doc["tenant_id"], tenant.id.to_string());
        assert_eq!(doc["gateway"]["auth_token"], "gw");
        assert_eq!(doc["agents"][0]["tools"]["allowed"][0], "web_search");
        assert_eq!(doc["agents"][0]["sandbox"]["profile"], "restricted");
    }
}
