//! Kubernetes backend: one namespace per tenant, one single-replica
//! Deployment inside it.
//!
//! Tenant isolation comes from the namespace boundary plus a default-deny
//! ingress policy on the runtime pod.
//! Tokens and the age identity live in Secrets mounted read-only; the runtime
//! configuration document lives in a ConfigMap whose content hash is injected
//! as an env var so config pushes roll the pods.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, EnvVar, Namespace, Pod, Secret, Service};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams};
use kube::config::KubeConfigOptions;
use kube::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    ContainerConfigUpdate, ContainerCreateOptions, ContainerHandle, ContainerHealth,
    ContainerOrchestrator, ContainerState, ContainerStatus, naming,
};
use crate::config::Config;
use crate::error::OrchestratorError;
use crate::secrets::SecretsManager;

const RUNTIME_CONTAINER_NAME: &str = "agent-runtime";
const CONFIG_HASH_ENV: &str = "AEGIS_CONFIG_SHA256";
const RESTARTED_AT_ANNOTATION: &str = "aegis.control/restarted-at";

pub struct KubernetesOrchestrator {
    client: Client,
    secrets: Arc<SecretsManager>,
    enabled: bool,
    image: String,
    container_port: u16,
    service_domain: String,
    call_timeout: Duration,
}

impl KubernetesOrchestrator {
    pub async fn connect(
        config: &Config,
        secrets: Arc<SecretsManager>,
    ) -> Result<Self, OrchestratorError> {
        let client = match &config.kubernetes.context {
            Some(context) => {
                let kube_config = kube::Config::from_kubeconfig(&KubeConfigOptions {
                    context: Some(context.clone()),
                    ..Default::default()
                })
                .await
                .map_err(|e| OrchestratorError::Cluster {
                    reason: format!("failed to load kubeconfig context {context}: {e}"),
                })?;
                Client::try_from(kube_config)?
            }
            None => Client::try_default()
                .await
                .map_err(|e| OrchestratorError::Cluster {
                    reason: format!("failed to build cluster client: {e}"),
                })?,
        };
        let orchestrator = Self {
            client,
            secrets,
            enabled: config.kubernetes.enabled,
            image: config.image.clone(),
            container_port: config.container_port,
            service_domain: config.kubernetes.service_domain.clone(),
            call_timeout: Duration::from_secs(config.provisioning.api_call_timeout_secs),
        };
        orchestrator.ensure_enabled()?;
        orchestrator.client.apiserver_version().await?;
        info!(domain = %orchestrator.service_domain, "connected to kubernetes cluster");
        Ok(orchestrator)
    }

    /// Fail closed when the backend was constructed but never enabled.
    fn ensure_enabled(&self) -> Result<(), OrchestratorError> {
        if self.enabled {
            Ok(())
        } else {
            Err(OrchestratorError::BackendDisabled {
                backend: "kubernetes".to_string(),
            })
        }
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

    async fn ensure_namespace(&self, namespace: &str, tenant_id: Uuid) -> Result<(), OrchestratorError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.get(namespace).await {
            Ok(_) => {
                debug!(namespace = %namespace, "tenant namespace already exists");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                let ns: Namespace = from_spec(json!({
                    "apiVersion": "v1",
                    "kind": "Namespace",
                    "metadata": {
                        "name": namespace,
                        "labels": naming::tenant_labels(tenant_id),
                    }
                }))?;
                api.create(&PostParams::default(), &ns).await?;
                info!(namespace = %namespace, "created tenant namespace");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Create the resource, or replace it wholesale when it already exists.
    async fn create_or_replace<K>(&self, api: &Api<K>, name: &str, resource: K) -> Result<(), OrchestratorError>
    where
        K: Clone + std::fmt::Debug + Serialize + DeserializeOwned,
    {
        match api.create(&PostParams::default(), &resource).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                api.replace(name, &PostParams::default(), &resource).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn deployment_spec(&self, opts: &ContainerCreateOptions, name: &str) -> Result<Deployment, OrchestratorError> {
        let mut env: Vec<serde_json::Value> = opts
            .environment
            .iter()
            .map(|(k, v)| json!({"name": k, "value": v}))
            .collect();
        env.push(json!({
            "name": "AEGIS_GATEWAY_PORT",
            "value": opts.container_port.to_string(),
        }));

        let cpu = format!("{}m", (opts.resource_limits.cpu_cores * 1000.0) as u64);
        let memory = format!("{}Mi", opts.resource_limits.memory_mb);
        let image = opts.image.as_deref().unwrap_or(&self.image);

        from_spec(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": name,
                "labels": naming::tenant_labels(opts.tenant_id),
            },
            "spec": {
                "replicas": 1,
                "selector": { "matchLabels": { "app": name } },
                "template": {
                    "metadata": {
                        "labels": { "app": name },
                    },
                    "spec": {
                        "containers": [{
                            "name": RUNTIME_CONTAINER_NAME,
                            "image": image,
                            "ports": [{ "containerPort": opts.container_port }],
                            "env": env,
                            "envFrom": [{
                                "secretRef": { "name": naming::RUNTIME_SECRET_NAME }
                            }],
                            "resources": {
                                "requests": { "cpu": cpu, "memory": memory },
                                "limits": { "cpu": cpu, "memory": memory },
                            },
                            "readinessProbe": {
                                "httpGet": { "path": "/health", "port": opts.container_port },
                                "initialDelaySeconds": 5,
                                "periodSeconds": 10,
                            },
                            "securityContext": {
                                "allowPrivilegeEscalation": false,
                                "readOnlyRootFilesystem": false,
                                "capabilities": { "drop": ["ALL"] },
                            },
                            "volumeMounts": [
                                {
                                    "name": "runtime-config",
                                    "mountPath": format!("{}/config", naming::RUNTIME_DIR),
                                    "readOnly": true,
                                },
                                {
                                    "name": "age-key",
                                    "mountPath": format!("{}/age", naming::RUNTIME_DIR),
                                    "readOnly": true,
                                },
                            ],
                        }],
                        "volumes": [
                            {
                                "name": "runtime-config",
                                "configMap": { "name": naming::RUNTIME_CONFIG_NAME },
                            },
                            {
                                "name": "age-key",
                                "secret": {
                                    "secretName": naming::AGE_KEY_SECRET_NAME,
                                    "defaultMode": 0o400,
                                },
                            },
                        ],
                    },
                },
            },
        }))
    }

    fn split_id<'a>(&self, id: &'a str) -> Result<(&'a str, &'a str), OrchestratorError> {
        id.split_once('/')
            .filter(|(ns, name)| !ns.is_empty() && !name.is_empty())
            .ok_or_else(|| OrchestratorError::InvalidState {
                id: id.to_string(),
                state: "id is not in namespace/name form".to_string(),
            })
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn get_deployment(&self, id: &str) -> Result<(Api<Deployment>, String, Deployment), OrchestratorError> {
        let (namespace, name) = self.split_id(id)?;
        let api = self.deployments(namespace);
        let deployment = api.get(name).await.map_err(|e| match e {
            kube::Error::Api(ae) if ae.code == 404 => {
                OrchestratorError::NotFound { id: id.to_string() }
            }
            other => other.into(),
        })?;
        Ok((api, name.to_string(), deployment))
    }

    /// Set replicas and stamp the restart annotation on the pod template.
    async fn set_replicas(&self, id: &str, replicas: i32, roll: bool) -> Result<(), OrchestratorError> {
        let (api, name, mut deployment) = self.get_deployment(id).await?;
        if let Some(spec) = deployment.spec.as_mut() {
            spec.replicas = Some(replicas);
            if roll {
                let annotations = spec
                    .template
                    .metadata
                    .get_or_insert_with(Default::default)
                    .annotations
                    .get_or_insert_with(BTreeMap::new);
                annotations.insert(RESTARTED_AT_ANNOTATION.to_string(), Utc::now().to_rfc3339());
            }
        }
        api.replace(&name, &PostParams::default(), &deployment)
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ContainerOrchestrator for KubernetesOrchestrator {
    async fn create(
        &self,
        opts: ContainerCreateOptions,
    ) -> Result<ContainerHandle, OrchestratorError> {
        self.ensure_enabled()?;
        let tenant_id = opts.tenant_id;
        let namespace = naming::namespace_name(tenant_id);
        let name = opts
            .name
            .clone()
            .unwrap_or_else(|| naming::container_name(tenant_id));

        self.timeboxed("ensure_namespace", self.ensure_namespace(&namespace, tenant_id))
            .await?;

        let tenant = tenant_id.to_string();
        let secrets_api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);

        // Token secret, consumed as env by the runtime pod.
        let runtime_secret: Secret = from_spec(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": { "name": naming::RUNTIME_SECRET_NAME },
            "type": "Opaque",
            "stringData": {
                "AEGIS_GATEWAY_TOKEN": self.secrets.gateway_token(&tenant),
                "AEGIS_HOOK_TOKEN": self.secrets.hook_token(&tenant),
            }
        }))?;
        self.timeboxed(
            "upsert_runtime_secret",
            self.create_or_replace(&secrets_api, naming::RUNTIME_SECRET_NAME, runtime_secret),
        )
        .await?;

        // Age identity, mounted read-only at a fixed path.
        let keypair = self
            .secrets
            .derive_age_keypair(&tenant)
            .map_err(|e| OrchestratorError::CreateFailed {
                tenant_id: tenant.clone(),
                reason: format!("age key derivation failed: {e}"),
            })?;
        let age_secret: Secret = from_spec(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": { "name": naming::AGE_KEY_SECRET_NAME },
            "type": "Opaque",
            "stringData": {
                "key.txt": format!(
                    "# public key: {}\n{}\n",
                    keypair.public, keypair.private
                ),
            }
        }))?;
        self.timeboxed(
            "upsert_age_key_secret",
            self.create_or_replace(&secrets_api, naming::AGE_KEY_SECRET_NAME, age_secret),
        )
        .await?;

        // Placeholder config document so the volume mounts; the pipeline
        // pushes the real one through update_config.
        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), &namespace);
        let config_map: ConfigMap = from_spec(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": naming::RUNTIME_CONFIG_NAME },
            "data": { "runtime.json": "{}" }
        }))?;
        self.timeboxed(
            "upsert_runtime_config",
            self.create_or_replace(&config_maps, naming::RUNTIME_CONFIG_NAME, config_map),
        )
        .await?;

        let deployment = self.deployment_spec(&opts, &name)?;
        self.timeboxed(
            "upsert_deployment",
            self.create_or_replace(&self.deployments(&namespace), &name, deployment),
        )
        .await?;

        let services: Api<Service> = Api::namespaced(self.client.clone(), &namespace);
        let service: Service = from_spec(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": { "name": name },
            "spec": {
                "type": "ClusterIP",
                "selector": { "app": name },
                "ports": [{
                    "port": opts.container_port,
                    "targetPort": opts.container_port,
                    "protocol": "TCP",
                }],
            }
        }))?;
        self.timeboxed("upsert_service", self.create_or_replace(&services, &name, service))
            .await?;

        let policies: Api<NetworkPolicy> = Api::namespaced(self.client.clone(), &namespace);
        let policy = isolation_policy(&name)?;
        self.timeboxed(
            "upsert_network_policy",
            self.create_or_replace(&policies, &format!("{name}-isolation"), policy),
        )
        .await?;

        info!(namespace = %namespace, deployment = %name, tenant = %tenant, "tenant deployment applied");
        Ok(ContainerHandle {
            id: format!("{namespace}/{name}"),
            url: format!(
                "http://{name}.{namespace}.{}:{}",
                self.service_domain, opts.container_port
            ),
            host_port: opts.host_port,
        })
    }

    /// Deleting the namespace tears down the tenant's entire footprint.
    async fn delete(&self, id: &str) -> Result<(), OrchestratorError> {
        self.ensure_enabled()?;
        let (namespace, _) = self.split_id(id)?;
        let api: Api<Namespace> = Api::all(self.client.clone());
        self.timeboxed("delete_namespace", async {
            match api.delete(namespace, &DeleteParams::default()).await {
                Ok(_) => Ok(()),
                Err(kube::Error::Api(ae)) if ae.code == 404 => {
                    Err(OrchestratorError::NotFound { id: id.to_string() })
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn restart(&self, id: &str) -> Result<(), OrchestratorError> {
        self.ensure_enabled()?;
        self.timeboxed("restart_deployment", self.set_replicas(id, 1, true))
            .await
    }

    async fn stop(&self, id: &str) -> Result<(), OrchestratorError> {
        self.ensure_enabled()?;
        self.timeboxed("scale_to_zero", self.set_replicas(id, 0, false))
            .await
    }

    async fn get_status(&self, id: &str) -> Result<ContainerStatus, OrchestratorError> {
        self.ensure_enabled()?;
        let (_, _, deployment) = self
            .timeboxed("get_deployment", self.get_deployment(id))
            .await?;

        let desired = deployment
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(0);
        let status = deployment.status.as_ref();
        let available = status.and_then(|s| s.available_replicas).unwrap_or(0);
        let ready = status.and_then(|s| s.ready_replicas).unwrap_or(0);

        let (state, health) = replica_status(desired, available, ready);

        let started_at = deployment
            .metadata
            .creation_timestamp
            .as_ref()
            .map(|t| t.0)
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

    /// Logs of the most recently created pod behind the deployment.
    async fn get_logs(
        &self,
        id: &str,
        tail_lines: Option<u32>,
        since_seconds: Option<i64>,
    ) -> Result<String, OrchestratorError> {
        self.ensure_enabled()?;
        let (namespace, name) = self.split_id(id)?;
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);

        self.timeboxed("pod_logs", async {
            let list = pods
                .list(&ListParams::default().labels(&format!("app={name}")))
                .await?;
            let newest = list
                .items
                .into_iter()
                .max_by_key(|p| p.metadata.creation_timestamp.as_ref().map(|t| t.0))
                .ok_or_else(|| OrchestratorError::NotFound { id: id.to_string() })?;
            let pod_name = newest
                .metadata
                .name
                .ok_or_else(|| OrchestratorError::NotFound { id: id.to_string() })?;

            let params = LogParams {
                container: Some(RUNTIME_CONTAINER_NAME.to_string()),
                tail_lines: tail_lines.map(i64::from),
                since_seconds,
                ..Default::default()
            };
            pods.logs(&pod_name, &params).await.map_err(Into::into)
        })
        .await
    }

    /// Push the new document into the ConfigMap, then roll the deployment by
    /// bumping a content-hash env var on the pod template.
    async fn update_config(
        &self,
        id: &str,
        update: ContainerConfigUpdate,
    ) -> Result<(), OrchestratorError> {
        self.ensure_enabled()?;
        let (namespace, _) = self.split_id(id)?;

        let mut config_hash = None;
        if let Some(doc) = &update.runtime_config {
            let body = serde_json::to_string_pretty(doc).map_err(|e| {
                OrchestratorError::Cluster {
                    reason: format!("failed to serialize runtime config: {e}"),
                }
            })?;
            config_hash = Some(hex::encode(Sha256::digest(body.as_bytes())));

            let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
            let config_map: ConfigMap = from_spec(json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": { "name": naming::RUNTIME_CONFIG_NAME },
                "data": { "runtime.json": body }
            }))?;
            self.timeboxed(
                "upsert_runtime_config",
                self.create_or_replace(&config_maps, naming::RUNTIME_CONFIG_NAME, config_map),
            )
            .await?;
        }

        let (api, deployment_name, mut deployment) = self.get_deployment(id).await?;
        if let Some(spec) = deployment.spec.as_mut() {
            if let Some(pod_spec) = spec.template.spec.as_mut()
                && let Some(container) = pod_spec
                    .containers
                    .iter_mut()
                    .find(|c| c.name == RUNTIME_CONTAINER_NAME)
            {
                let env = container.env.get_or_insert_with(Vec::new);
                if let Some(new_env) = &update.environment {
                    env.retain(|e| e.name == CONFIG_HASH_ENV || !new_env.contains_key(&e.name));
                    for (k, v) in new_env {
                        env.push(EnvVar {
                            name: k.clone(),
                            value: Some(v.clone()),
                            ..Default::default()
                        });
                    }
                }
                if let Some(hash) = &config_hash {
                    env.retain(|e| e.name != CONFIG_HASH_ENV);
                    env.push(EnvVar {
                        name: CONFIG_HASH_ENV.to_string(),
                        value: Some(hash.clone()),
                        ..Default::default()
                    });
                }
            }
            let annotations = spec
                .template
                .metadata
                .get_or_insert_with(Default::default)
                .annotations
                .get_or_insert_with(BTreeMap::new);
            annotations.insert(RESTARTED_AT_ANNOTATION.to_string(), Utc::now().to_rfc3339());
        }

        self.timeboxed("roll_deployment", async {
            api.replace(&deployment_name, &PostParams::default(), &deployment)
                .await
                .map_err(Into::into)
                .map(|_| ())
        })
        .await
    }
}

/// Map deployment replica counts to a container state and health.
///
/// Health is inferred from replicas only; the cluster backend has no
/// engine-native healthcheck to consult.
fn replica_status(desired: i32, available: i32, ready: i32) -> (ContainerState, ContainerHealth) {
    if desired == 0 {
        (ContainerState::Stopped, ContainerHealth::Down)
    } else if available > 0 && ready >= desired {
        (ContainerState::Running, ContainerHealth::Healthy)
    } else if available > 0 {
        (ContainerState::Running, ContainerHealth::Degraded)
    } else {
        (ContainerState::Creating, ContainerHealth::Unknown)
    }
}

/// Default-deny ingress policy on the runtime pod. No ingress rules at all;
/// kubelet probes are exempt from network policy, so the readiness probe
/// still works.
fn isolation_policy(name: &str) -> Result<NetworkPolicy, OrchestratorError> {
    from_spec(json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "NetworkPolicy",
        "metadata": { "name": format!("{name}-isolation") },
        "spec": {
            "podSelector": { "matchLabels": { "app": name } },
            "policyTypes": ["Ingress"],
        }
    }))
}

/// Build a typed resource from its JSON manifest form.
fn from_spec<K: DeserializeOwned>(value: serde_json::Value) -> Result<K, OrchestratorError> {
    serde_json::from_value(value).map_err(|e| OrchestratorError::Cluster {
        reason: format!("invalid resource manifest: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::orchestrator::ResourceLimits;

    fn create_opts() -> ContainerCreateOptions {
        ContainerCreateOptions {
            tenant_id: Uuid::new_v4(),
            image: None,
            name: None,
            environment: HashMap::from([("LOG_LEVEL".to_string(), "info".to_string())]),
            resource_limits: ResourceLimits {
                cpu_cores: 0.5,
                memory_mb: 512,
                disk_gb: 5,
            },
            network_name: String::new(),
            host_port: 19000,
            container_port: crate::DEFAULT_CONTAINER_PORT,
        }
    }

    #[test]
    fn deployment_spec_is_single_replica_with_limits() {
        let json = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "aegis-tenant-x" },
            "spec": {
                "replicas": 1,
                "selector": { "matchLabels": { "app": "aegis-tenant-x" } },
                "template": {
                    "metadata": { "labels": { "app": "aegis-tenant-x" } },
                    "spec": { "containers": [{ "name": "agent-runtime", "image": "img" }] },
                },
            },
        });
        let deployment: Deployment = from_spec(json).unwrap();
        assert_eq!(deployment.spec.as_ref().unwrap().replicas, Some(1));
    }

    #[test]
    fn manifest_round_trips_through_typed_resources() {
        let opts = create_opts();
        let cpu = format!("{}m", (opts.resource_limits.cpu_cores * 1000.0) as u64);
        assert_eq!(cpu, "500m");

        let ns: Namespace = from_spec(json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {
                "name": naming::namespace_name(opts.tenant_id),
                "labels": naming::tenant_labels(opts.tenant_id),
            }
        }))
        .unwrap();
        assert_eq!(
            ns.metadata.name.unwrap(),
            naming::namespace_name(opts.tenant_id)
        );
    }

    #[test]
    fn isolation_policy_denies_all_ingress() {
        let policy = isolation_policy("aegis-tenant-x").unwrap();
        let spec = policy.spec.unwrap();
        assert_eq!(spec.policy_types, Some(vec!["Ingress".to_string()]));
        assert!(spec.ingress.is_none(), "no ingress rules may be allowed");
        assert_eq!(
            spec.pod_selector.match_labels.unwrap()["app"],
            "aegis-tenant-x"
        );
    }

    #[test]
    fn replica_counts_map_to_state_and_health() {
        let table = [
            // (desired, available, ready) -> (state, health)
            (0, 0, 0, ContainerState::Stopped, ContainerHealth::Down),
            (1, 1, 1, ContainerState::Running, ContainerHealth::Healthy),
            (1, 1, 0, ContainerState::Running, ContainerHealth::Degraded),
            (1, 0, 0, ContainerState::Creating, ContainerHealth::Unknown),
            // Scaled to zero wins even with stale status counts.
            (0, 1, 1, ContainerState::Stopped, ContainerHealth::Down),
        ];
        for (desired, available, ready, state, health) in table {
            assert_eq!(
                replica_status(desired, available, ready),
                (state, health),
                "desired={desired} available={available} ready={ready}"
            );
        }
    }

    #[test]
    fn malformed_ids_are_rejected() {
        let bad = ["aegis-tenant-x", "/name", "ns/", ""];
        for id in bad {
            assert!(
                id.split_once('/')
                    .filter(|(ns, name)| !ns.is_empty() && !name.is_empty())
                    .is_none(),
                "{id} should be rejected"
            );
        }
        assert_eq!(
            "tenant-ns/runtime".split_once('/'),
            Some(("tenant-ns", "runtime"))
        );
    }
}
