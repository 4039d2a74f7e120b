//! Canonical names, labels, and in-container paths for tenant resources.
//!
//! Both real backends derive every resource name from the tenant id through
//! these helpers, so a tenant's footprint is discoverable (and cleanly
//! deletable) from the id alone.

use std::collections::HashMap;

use uuid::Uuid;

/// Label marking a resource as managed by this control plane.
pub const LABEL_MANAGED_BY: &str = "aegis.control/managed-by";
pub const MANAGED_BY_VALUE: &str = "aegis-control";
/// Label carrying the owning tenant id.
pub const LABEL_TENANT: &str = "aegis.control/tenant";

/// Directory inside the runtime container holding mutable runtime state.
/// On Docker this is a tmpfs mount so the root filesystem can stay read-only.
pub const RUNTIME_DIR: &str = "/etc/aegis";
/// Age identity file, relative to [`RUNTIME_DIR`].
pub const AGE_KEY_SUBPATH: &str = "age/key.txt";
/// Runtime configuration document, relative to [`RUNTIME_DIR`].
pub const CONFIG_SUBPATH: &str = "config/runtime.json";

/// Kubernetes Secret holding the gateway and hook tokens.
pub const RUNTIME_SECRET_NAME: &str = "aegis-runtime-secrets";
/// Kubernetes Secret holding the tenant's age identity.
pub const AGE_KEY_SECRET_NAME: &str = "aegis-age-key";
/// Kubernetes ConfigMap holding the runtime configuration document.
pub const RUNTIME_CONFIG_NAME: &str = "aegis-runtime-config";

pub fn container_name(tenant_id: Uuid) -> String {
    format!("aegis-tenant-{tenant_id}")
}

pub fn network_name(tenant_id: Uuid) -> String {
    format!("aegis-net-{tenant_id}")
}

pub fn namespace_name(tenant_id: Uuid) -> String {
    format!("aegis-tenant-{tenant_id}")
}

pub fn tenant_labels(tenant_id: Uuid) -> HashMap<String, String> {
    HashMap::from([
        (LABEL_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string()),
        (LABEL_TENANT.to_string(), tenant_id.to_string()),
    ])
}
