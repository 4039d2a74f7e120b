//! Configuration for the control plane.
//!
//! Everything is resolved once at startup from env vars (loaded via dotenvy
//! early in `main`). Runtime code receives the resolved `Config` by value and
//! never re-reads the environment, so the orchestrator backend choice and the
//! master key are fixed for the life of the process.

pub(crate) mod helpers;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Which container-orchestrator backend to run. Selected once at process
/// start, never per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorBackend {
    Mock,
    Docker,
    Kubernetes,
}

impl OrchestratorBackend {
    pub(crate) fn parse(value: &str, key: &str) -> Result<Self, ConfigError> {
        match helpers::normalize_variant(value).as_str() {
            "mock" => Ok(Self::Mock),
            "docker" => Ok(Self::Docker),
            "kubernetes" | "k8s" => Ok(Self::Kubernetes),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected 'mock', 'docker', or 'kubernetes', got '{value}'"),
            }),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mock => "mock",
            Self::Docker => "docker",
            Self::Kubernetes => "kubernetes",
        }
    }
}

/// Deployment environment. Controls whether a missing master key is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Test,
    Production,
}

impl Environment {
    fn parse(value: &str, key: &str) -> Result<Self, ConfigError> {
        match helpers::normalize_variant(value).as_str() {
            "development" | "dev" | "local" => Ok(Self::Development),
            "test" => Ok(Self::Test),
            "production" | "prod" => Ok(Self::Production),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected 'development', 'test', or 'production', got '{value}'"),
            }),
        }
    }

    /// Development and test may run without a configured master key.
    pub fn allows_derived_dev_key(self) -> bool {
        matches!(self, Self::Development | Self::Test)
    }
}

/// Docker engine connection settings.
#[derive(Debug, Clone, Default)]
pub struct DockerConfig {
    /// Engine host (`tcp://...` or `unix://...`). `None` uses local defaults.
    pub host: Option<String>,
    /// Negotiated API version pin, e.g. "1.44". `None` uses the crate default.
    pub api_version: Option<String>,
}

/// Kubernetes cluster settings.
#[derive(Debug, Clone)]
pub struct KubernetesConfig {
    /// Explicit enable flag. When false and no in-cluster signals are present,
    /// every backend call fails before any network I/O.
    pub enabled: bool,
    /// kubeconfig context override.
    pub context: Option<String>,
    /// Cluster-internal service DNS suffix.
    pub service_domain: String,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            context: None,
            service_domain: "svc.cluster.local".to_string(),
        }
    }
}

/// Exclusive host-port allocation window.
#[derive(Debug, Clone, Copy)]
pub struct PortsConfig {
    pub base_port: u16,
    pub range: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            base_port: 19000,
            range: 1000,
        }
    }
}

/// Pipeline retry and health-poll tuning.
#[derive(Debug, Clone, Copy)]
pub struct ProvisioningConfig {
    /// Retry ceiling: the pipeline runs at most `max_retries + 1` times.
    pub max_retries: u32,
    pub health_check_attempts: u32,
    pub health_check_interval_secs: u64,
    /// Timebox for each external container/cluster API call.
    pub api_call_timeout_secs: u64,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            health_check_attempts: 30,
            health_check_interval_secs: 5,
            api_call_timeout_secs: 15,
        }
    }
}

/// Secrets subsystem settings.
#[derive(Debug, Clone)]
pub struct SecretsConfig {
    /// Master key material: 64 hex chars, 32-byte base64, or an arbitrary
    /// string that gets SHA-256 hashed to 32 bytes.
    pub master_key: Option<SecretString>,
    pub environment: Environment,
}

/// Main configuration for the control plane.
#[derive(Debug, Clone)]
pub struct Config {
    pub backend: OrchestratorBackend,
    /// Agent-runtime image reference used for every tenant container.
    pub image: String,
    /// Port the runtime listens on inside its container.
    pub container_port: u16,
    pub docker: DockerConfig,
    pub kubernetes: KubernetesConfig,
    pub ports: PortsConfig,
    pub provisioning: ProvisioningConfig,
    pub secrets: SecretsConfig,
}

impl Config {
    /// Resolve configuration from the environment.
    pub fn resolve() -> Result<Self, ConfigError> {
        let backend = match helpers::optional_env("ORCHESTRATOR_BACKEND")? {
            Some(value) => OrchestratorBackend::parse(&value, "ORCHESTRATOR_BACKEND")?,
            None => OrchestratorBackend::Mock,
        };

        let environment = match helpers::optional_env("AEGIS_ENV")? {
            Some(value) => Environment::parse(&value, "AEGIS_ENV")?,
            None => Environment::Development,
        };

        let image = helpers::optional_env("CONTAINER_IMAGE")?
            .unwrap_or_else(|| "aegis/agent-runtime:latest".to_string());
        let container_port =
            helpers::parsed_env("CONTAINER_PORT")?.unwrap_or(crate::DEFAULT_CONTAINER_PORT);

        let docker = DockerConfig {
            host: helpers::optional_env("DOCKER_HOST")?,
            api_version: helpers::optional_env("DOCKER_API_VERSION")?,
        };

        let kubernetes = KubernetesConfig {
            enabled: helpers::parsed_env("KUBERNETES_ENABLED")?.unwrap_or(false),
            context: helpers::optional_env("KUBE_CONTEXT")?,
            service_domain: helpers::optional_env("KUBE_SERVICE_DOMAIN")?
                .unwrap_or_else(|| "svc.cluster.local".to_string()),
        };

        let ports_default = PortsConfig::default();
        let ports = PortsConfig {
            base_port: helpers::parsed_env("BASE_PORT")?.unwrap_or(ports_default.base_port),
            range: helpers::parsed_env("PORT_RANGE")?.unwrap_or(ports_default.range),
        };
        if ports.range == 0 {
            return Err(ConfigError::InvalidValue {
                key: "PORT_RANGE".to_string(),
                message: "port range must be at least 1".to_string(),
            });
        }

        let prov_default = ProvisioningConfig::default();
        let provisioning = ProvisioningConfig {
            max_retries: helpers::parsed_env("PROVISION_MAX_RETRIES")?
                .unwrap_or(prov_default.max_retries),
            health_check_attempts: helpers::parsed_env("HEALTH_CHECK_ATTEMPTS")?
                .unwrap_or(prov_default.health_check_attempts),
            health_check_interval_secs: helpers::parsed_env("HEALTH_CHECK_INTERVAL_SECS")?
                .unwrap_or(prov_default.health_check_interval_secs),
            api_call_timeout_secs: helpers::parsed_env("API_CALL_TIMEOUT_SECS")?
                .unwrap_or(prov_default.api_call_timeout_secs),
        };

        let secrets = SecretsConfig {
            master_key: helpers::optional_env("SECRETS_MASTER_KEY")?.map(SecretString::from),
            environment,
        };

        Ok(Self {
            backend,
            image,
            container_port,
            docker,
            kubernetes,
            ports,
            provisioning,
            secrets,
        })
    }
}
