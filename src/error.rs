//! Error types for the control plane.

/// Top-level error type for the control plane.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Secrets error: {0}")]
    Secrets(#[from] SecretsError),

    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("Provisioning error: {0}")]
    Provisioning(#[from] ProvisioningError),
}

impl Error {
    /// Whether the provisioning pipeline may retry after this error.
    ///
    /// Configuration problems, malformed secrets, a disabled backend, and an
    /// exhausted port range are deterministic: re-running the pipeline cannot
    /// fix them, so they go straight to the terminal failure path. Everything
    /// else is treated as transient infrastructure trouble.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Config(_) | Self::Secrets(_) => false,
            Self::Orchestrator(OrchestratorError::BackendDisabled { .. }) => false,
            Self::Provisioning(ProvisioningError::CapacityExhausted { .. }) => false,
            _ => true,
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Environment variable {0} is not valid unicode")]
    NonUnicodeEnvVar(String),
}

/// Persistence-collaborator errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[cfg(feature = "postgres")]
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[cfg(feature = "postgres")]
    #[error("Pool build error: {0}")]
    PoolBuild(#[from] deadpool_postgres::BuildError),

    #[cfg(feature = "postgres")]
    #[error("Pool runtime error: {0}")]
    PoolRuntime(#[from] deadpool_postgres::PoolError),
}

/// Secrets-manager errors. Decryption failures never carry partial plaintext.
#[derive(Debug, thiserror::Error)]
pub enum SecretsError {
    #[error("Malformed ciphertext: {0}")]
    MalformedCiphertext(String),

    #[error("Decryption failed: authentication tag mismatch")]
    AuthenticationFailed,

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Invalid key encoding: {0}")]
    InvalidEncoding(String),
}

/// Container-orchestrator errors (both backends propagate these unchanged).
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Backend {backend} is not enabled on this control plane")]
    BackendDisabled { backend: String },

    #[error("Container creation failed for tenant {tenant_id}: {reason}")]
    CreateFailed { tenant_id: String, reason: String },

    #[error("Container not found: {id}")]
    NotFound { id: String },

    #[error("Container {id} is in unexpected state: {state}")]
    InvalidState { id: String, state: String },

    #[error("Container engine error: {reason}")]
    Engine { reason: String },

    #[error("Cluster API error: {reason}")]
    Cluster { reason: String },

    #[error("Operation {op} timed out after {secs}s")]
    Timeout { op: String, secs: u64 },
}

impl From<bollard::errors::Error> for OrchestratorError {
    fn from(err: bollard::errors::Error) -> Self {
        Self::Engine {
            reason: err.to_string(),
        }
    }
}

impl From<kube::Error> for OrchestratorError {
    fn from(err: kube::Error) -> Self {
        Self::Cluster {
            reason: err.to_string(),
        }
    }
}

/// Provisioning-pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum ProvisioningError {
    #[error("No free port in range [{base_port}, {base_port}+{range}): all {range} ports occupied")]
    CapacityExhausted { base_port: u16, range: u16 },

    #[error("Container did not become healthy after {attempts} checks")]
    HealthCheckFailed { attempts: u32 },

    #[error("Tenant {id} not found")]
    TenantNotFound { id: String },

    #[error("Step {step} failed: {reason}")]
    StepFailed { step: String, reason: String },
}

/// Result type alias for the control plane.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_errors_are_not_retryable() {
        let err = Error::from(ProvisioningError::CapacityExhausted {
            base_port: 19000,
            range: 10,
        });
        assert!(!err.is_retryable());
    }

    #[test]
    fn disabled_backend_is_not_retryable() {
        let err = Error::from(OrchestratorError::BackendDisabled {
            backend: "kubernetes".to_string(),
        });
        assert!(!err.is_retryable());
    }

    #[test]
    fn engine_failures_are_retryable() {
        let err = Error::from(OrchestratorError::Engine {
            reason: "socket closed".to_string(),
        });
        assert!(err.is_retryable());

        let err = Error::from(ProvisioningError::HealthCheckFailed { attempts: 30 });
        assert!(err.is_retryable());
    }

    #[test]
    fn malformed_secrets_are_not_retryable() {
        let err = Error::from(SecretsError::AuthenticationFailed);
        assert!(!err.is_retryable());
    }
}
