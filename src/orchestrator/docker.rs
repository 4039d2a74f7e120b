//! Docker backend: one hardened container per tenant on a standalone engine.
//!
//! Every tenant gets a dedicated bridge network and a container with a
//! read-only root filesystem. Mutable runtime state (config document, age
//! identity) lives on a tmpfs mount and is injected post-start via archive
//! upload; the gateway token reaches the runtime through its environment.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bollard::container::{
    Config as BollardConfig, CreateContainerOptions, InspectContainerOptions, LogsOptions,
    RemoveContainerOptions, RestartContainerOptions, StartContainerOptions, StopContainerOptions,
    UploadToContainerOptions,
};
use bollard::models::{
    ContainerStateStatusEnum, HealthConfig, HealthStatusEnum, HostConfig, PortBinding, PortMap,
};
use bollard::network::CreateNetworkOptions;
use bollard::{API_DEFAULT_VERSION, ClientVersion, Docker};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    ContainerConfigUpdate, ContainerCreateOptions, ContainerHandle, ContainerHealth,
    ContainerOrchestrator, ContainerState, ContainerStatus, naming,
};
use crate::config::Config;
use crate::error::OrchestratorError;
use crate::secrets::{AgeKeypair, SecretsManager};

const CONNECT_TIMEOUT_SECS: u64 = 10;
const STOP_GRACE_SECS: i64 = 10;

pub struct DockerOrchestrator {
    docker: Docker,
    secrets: Arc<SecretsManager>,
    image: String,
    container_port: u16,
    call_timeout: Duration,
}

impl DockerOrchestrator {
    /// Connect to the engine and ping it, so a dead daemon fails at startup.
    pub async fn connect(
        config: &Config,
        secrets: Arc<SecretsManager>,
    ) -> Result<Self, OrchestratorError> {
        let version = match &config.docker.api_version {
            Some(raw) => parse_client_version(raw)?,
            None => API_DEFAULT_VERSION.clone(),
        };
        let docker = match &config.docker.host {
            Some(host) if host.starts_with("tcp://") || host.starts_with("http") => {
                Docker::connect_with_http(host, CONNECT_TIMEOUT_SECS, &version)?
            }
            Some(host) => Docker::connect_with_unix(host, CONNECT_TIMEOUT_SECS, &version)?,
            None => Docker::connect_with_local_defaults()?,
        };
        docker.ping().await?;
        info!(host = config.docker.host.as_deref().unwrap_or("local"), "connected to docker engine");

        Ok(Self {
            docker,
            secrets,
            image: config.image.clone(),
            container_port: config.container_port,
            call_timeout: Duration::from_secs(config.provisioning.api_call_timeout_secs),
        })
    }

    async fn timeboxed<T, F>(&self, op: &str, fut: F) -> Result<T, OrchestratorError>
    where
        F: std::future::Future<Output = Result<T, OrchestratorError>>,
    {
        tokio::time::timeout(self.call_timeout, fut)
            .await
            .map_err(|_| OrchestratorError::Timeout {
                op: op.to_string(),
                secs: self.call_timeout.as_secs(),
            })?
    }

    /// Create the tenant network if it does not exist. Labeled, so tenant
    /// footprints stay discoverable from the engine alone.
    async fn ensure_network(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<(), OrchestratorError> {
        let networks = self.docker.list_networks::<String>(None).await?;
        let exists = networks
            .iter()
            .any(|n| n.name.as_deref() == Some(name));
        if exists {
            debug!(network = %name, "tenant network already exists");
            return Ok(());
        }

        self.docker
            .create_network(CreateNetworkOptions {
                name: name.to_string(),
                driver: "bridge".to_string(),
                labels: labels.clone(),
                ..Default::default()
            })
            .await?;
        info!(network = %name, "created tenant network");
        Ok(())
    }

    /// Upload files into the container's tmpfs-backed runtime directory.
    async fn upload_runtime_files(
        &self,
        container_id: &str,
        files: &[(&str, Vec<u8>)],
    ) -> Result<(), OrchestratorError> {
        let archive = build_tar(files).map_err(|e| OrchestratorError::Engine {
            reason: format!("failed to build archive: {e}"),
        })?;
        self.docker
            .upload_to_container(
                container_id,
                Some(UploadToContainerOptions {
                    path: naming::RUNTIME_DIR.to_string(),
                    ..Default::default()
                }),
                archive.into(),
            )
            .await?;
        Ok(())
    }

    /// Start a freshly created container and inject the age identity onto
    /// its tmpfs mount. The identity only ever exists on that mount.
    async fn start_and_seed(
        &self,
        container_id: &str,
        tenant_id: Uuid,
    ) -> Result<(), OrchestratorError> {
        self.timeboxed("start_container", async {
            self.docker
                .start_container::<String>(container_id, None::<StartContainerOptions<String>>)
                .await
                .map_err(Into::into)
        })
        .await?;

        let keypair = self
            .secrets
            .derive_age_keypair(&tenant_id.to_string())
            .map_err(|e| OrchestratorError::CreateFailed {
                tenant_id: tenant_id.to_string(),
                reason: format!("age key derivation failed: {e}"),
            })?;
        let key_file = render_identity_file(&keypair);
        self.timeboxed(
            "upload_age_key",
            self.upload_runtime_files(container_id, &[(naming::AGE_KEY_SUBPATH, key_file)]),
        )
        .await
    }
}

#[async_trait::async_trait]
impl ContainerOrchestrator for DockerOrchestrator {
    async fn create(
        &self,
        opts: ContainerCreateOptions,
    ) -> Result<ContainerHandle, OrchestratorError> {
        let tenant_id = opts.tenant_id;
        let name = opts
            .name
            .clone()
            .unwrap_or_else(|| naming::container_name(tenant_id));
        let image = opts.image.clone().unwrap_or_else(|| self.image.clone());
        let labels = naming::tenant_labels(tenant_id);

        self.timeboxed("create_network", self.ensure_network(&opts.network_name, &labels))
            .await?;

        let port_key = format!("{}/tcp", opts.container_port);
        let mut port_bindings = PortMap::new();
        port_bindings.insert(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some(opts.host_port.to_string()),
            }]),
        );
        let exposed_ports = HashMap::from([(port_key, HashMap::new())]);

        let mut env: Vec<String> = opts
            .environment
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        env.push(format!("AEGIS_GATEWAY_PORT={}", opts.container_port));

        let host_config = HostConfig {
            network_mode: Some(opts.network_name.clone()),
            port_bindings: Some(port_bindings),
            readonly_rootfs: Some(true),
            tmpfs: Some(HashMap::from([
                (naming::RUNTIME_DIR.to_string(), "rw,size=16m".to_string()),
                ("/tmp".to_string(), "rw,size=64m".to_string()),
                ("/workspace".to_string(), "rw,size=256m".to_string()),
            ])),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            nano_cpus: Some((opts.resource_limits.cpu_cores * 1_000_000_000.0) as i64),
            memory: Some((opts.resource_limits.memory_mb * 1024 * 1024) as i64),
            ..Default::default()
        };

        let container_config = BollardConfig::<String> {
            image: Some(image),
            env: Some(env),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            healthcheck: Some(HealthConfig {
                test: Some(vec![
                    "CMD-SHELL".to_string(),
                    format!(
                        "curl -fsS http://127.0.0.1:{}/health || exit 1",
                        opts.container_port
                    ),
                ]),
                interval: Some(10_000_000_000),
                timeout: Some(5_000_000_000),
                retries: Some(3),
                start_period: Some(15_000_000_000),
                ..Default::default()
            }),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .timeboxed("create_container", async {
                self.docker
                    .create_container(
                        Some(CreateContainerOptions {
                            name: name.clone(),
                            platform: None,
                        }),
                        container_config,
                    )
                    .await
                    .map_err(|e| OrchestratorError::CreateFailed {
                        tenant_id: tenant_id.to_string(),
                        reason: e.to_string(),
                    })
            })
            .await?;

        // A half-created container left behind here would keep its name and
        // make every retry collide on create_container.
        if let Err(err) = self.start_and_seed(&created.id, tenant_id).await {
            if let Err(cleanup_err) = self
                .docker
                .remove_container(
                    &created.id,
                    Some(RemoveContainerOptions {
                        force: true,
                        v: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                warn!(
                    container = %created.id,
                    error = %cleanup_err,
                    "failed to remove half-created container"
                );
            }
            return Err(err);
        }

        info!(
            container = %name,
            tenant = %tenant_id,
            port = opts.host_port,
            "tenant container started"
        );
        Ok(ContainerHandle {
            id: created.id,
            url: format!("http://127.0.0.1:{}", opts.host_port),
            host_port: opts.host_port,
        })
    }

    async fn delete(&self, id: &str) -> Result<(), OrchestratorError> {
        self.timeboxed("remove_container", async {
            self.docker
                .remove_container(
                    id,
                    Some(RemoveContainerOptions {
                        force: true,
                        v: true,
                        ..Default::default()
                    }),
                )
                .await
                .map_err(Into::into)
        })
        .await
    }

    async fn restart(&self, id: &str) -> Result<(), OrchestratorError> {
        self.timeboxed("restart_container", async {
            self.docker
                .restart_container(id, Some(RestartContainerOptions { t: STOP_GRACE_SECS as isize }))
                .await
                .map_err(Into::into)
        })
        .await
    }

    async fn stop(&self, id: &str) -> Result<(), OrchestratorError> {
        self.timeboxed("stop_container", async {
            self.docker
                .stop_container(id, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
                .await
                .map_err(Into::into)
        })
        .await
    }

    async fn get_status(&self, id: &str) -> Result<ContainerStatus, OrchestratorError> {
        let inspect = self
            .timeboxed("inspect_container", async {
                self.docker
                    .inspect_container(id, None::<InspectContainerOptions>)
                    .await
                    .map_err(|e| match e {
                        bollard::errors::Error::DockerResponseServerError {
                            status_code: 404,
                            ..
                        } => OrchestratorError::NotFound { id: id.to_string() },
                        other => other.into(),
                    })
            })
            .await?;

        let engine_state = inspect.state.as_ref();
        let status = engine_state.and_then(|s| s.status);
        let health = engine_state
            .and_then(|s| s.health.as_ref())
            .and_then(|h| h.status);

        let (state, health) = match status {
            Some(ContainerStateStatusEnum::RUNNING) => {
                let health = match health {
                    Some(HealthStatusEnum::HEALTHY) => ContainerHealth::Healthy,
                    Some(HealthStatusEnum::UNHEALTHY) => ContainerHealth::Degraded,
                    _ => ContainerHealth::Unknown,
                };
                (ContainerState::Running, health)
            }
            Some(ContainerStateStatusEnum::CREATED)
            | Some(ContainerStateStatusEnum::RESTARTING) => {
                (ContainerState::Creating, ContainerHealth::Unknown)
            }
            Some(ContainerStateStatusEnum::DEAD) => (ContainerState::Failed, ContainerHealth::Down),
            Some(_) => (ContainerState::Stopped, ContainerHealth::Down),
            None => (ContainerState::Unknown, ContainerHealth::Unknown),
        };

        let started_at = engine_state
            .and_then(|s| s.started_at.as_deref())
            .and_then(parse_engine_time)
            .filter(|_| state == ContainerState::Running);
        let uptime_seconds =
            started_at.map(|t| (Utc::now() - t).num_seconds().max(0) as u64);

        Ok(ContainerStatus {
            state,
            health,
            started_at,
            uptime_seconds,
        })
    }

    async fn get_logs(
        &self,
        id: &str,
        tail_lines: Option<u32>,
        since_seconds: Option<i64>,
    ) -> Result<String, OrchestratorError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail_lines
                .map(|n| n.to_string())
                .unwrap_or_else(|| "all".to_string()),
            since: since_seconds
                .map(|s| Utc::now().timestamp() - s)
                .unwrap_or(0),
            ..Default::default()
        };
        let chunks: Vec<_> = self
            .timeboxed("container_logs", async {
                self.docker
                    .logs(id, Some(options))
                    .try_collect()
                    .await
                    .map_err(Into::into)
            })
            .await?;
        Ok(chunks
            .into_iter()
            .map(|chunk| chunk.to_string())
            .collect::<Vec<_>>()
            .join(""))
    }

    /// Write the new artifacts onto the tmpfs mount, then restart so the
    /// runtime re-reads them. Environment replacement is expressed through
    /// the artifact as well; a Docker container's env is immutable.
    async fn update_config(
        &self,
        id: &str,
        update: ContainerConfigUpdate,
    ) -> Result<(), OrchestratorError> {
        let mut files: Vec<(&str, Vec<u8>)> = Vec::new();
        if let Some(doc) = &update.runtime_config {
            let body = serde_json::to_vec_pretty(doc).map_err(|e| OrchestratorError::Engine {
                reason: format!("failed to serialize runtime config: {e}"),
            })?;
            files.push((naming::CONFIG_SUBPATH, body));
        }
        if let Some(env) = &update.environment {
            let body =
                serde_json::to_vec_pretty(env).map_err(|e| OrchestratorError::Engine {
                    reason: format!("failed to serialize environment: {e}"),
                })?;
            files.push(("config/environment.json", body));
        }
        if files.is_empty() {
            warn!(container = %id, "update_config called with an empty update");
            return Ok(());
        }

        self.timeboxed("upload_config", self.upload_runtime_files(id, &files))
            .await?;
        self.restart(id).await
    }
}

fn parse_client_version(raw: &str) -> Result<ClientVersion, OrchestratorError> {
    let mut parts = raw.splitn(2, '.');
    let major = parts.next().and_then(|p| p.parse().ok());
    let minor = parts.next().and_then(|p| p.parse().ok());
    match (major, minor) {
        (Some(major_version), Some(minor_version)) => Ok(ClientVersion {
            major_version,
            minor_version,
        }),
        _ => Err(OrchestratorError::Engine {
            reason: format!("invalid docker api version: {raw}"),
        }),
    }
}

fn parse_engine_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Render the identity in the age-keygen key-file format the runtime expects.
fn render_identity_file(keypair: &AgeKeypair) -> Vec<u8> {
    format!(
        "# created: {}\n# public key: {}\n{}\n",
        Utc::now().to_rfc3339(),
        keypair.public,
        keypair.private
    )
    .into_bytes()
}

/// Build an in-memory tar archive of `(relative path, contents)` entries.
fn build_tar(files: &[(&str, Vec<u8>)]) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o600);
        header.set_mtime(Utc::now().timestamp() as u64);
        header.set_cksum();
        builder.append_data(&mut header, path, contents.as_slice())?;
    }
    builder.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::SecretsManager;

    #[test]
    fn client_version_parses_major_minor() {
        let v = parse_client_version("1.44").unwrap();
        assert_eq!(v.major_version, 1);
        assert_eq!(v.minor_version, 44);
        assert!(parse_client_version("latest").is_err());
    }

    #[test]
    fn engine_timestamps_parse_to_utc() {
        let t = parse_engine_time("2026-08-29T10:00:00.123456789Z").unwrap();
        assert_eq!(t.timezone(), Utc);
        assert!(parse_engine_time("0001-01-01T00:00:00Z").is_some());
        assert!(parse_engine_time("not-a-time").is_none());
    }

    #[test]
    fn identity_file_has_keygen_layout() {
        let secrets = SecretsManager::from_key([7u8; 32]);
        let keypair = secrets.derive_age_keypair("tenant-a").unwrap();
        let rendered = String::from_utf8(render_identity_file(&keypair)).unwrap();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("# created: "));
        assert!(lines[1].starts_with("# public key: age1"));
        assert!(lines[2].starts_with("AGE-SECRET-KEY-1"));
    }

    #[test]
    fn tar_archive_contains_all_entries() {
        let archive = build_tar(&[
            ("age/key.txt", b"identity".to_vec()),
            ("config/runtime.json", b"{}".to_vec()),
        ])
        .unwrap();

        let mut reader = tar::Archive::new(archive.as_slice());
        let paths: Vec<String> = reader
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert_eq!(paths, vec!["age/key.txt", "config/runtime.json"]);
    }
}
