//! Tenant provisioning: port allocation, runtime configuration, and the
//! pipeline that drives a tenant from `pending` to `active`.

pub mod pipeline;
pub mod ports;
pub mod runtime_config;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};
use uuid::Uuid;

pub use pipeline::{Pipeline, ProvisioningStep};
pub use ports::PortAllocator;

/// Single-flight provisioning front end.
///
/// At most one pipeline run per tenant is in flight at a time; duplicate
/// submissions while a run is active are rejected. Different tenants run
/// concurrently, so one tenant's health polling never delays another's.
#[derive(Clone)]
pub struct ProvisioningService {
    pipeline: Arc<Pipeline>,
    inflight: Arc<Mutex<HashSet<Uuid>>>,
}

impl ProvisioningService {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            inflight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Submit a tenant for provisioning. Returns `false` when a run for the
    /// tenant is already in flight.
    pub fn submit(&self, tenant_id: Uuid) -> bool {
        {
            let mut inflight = self.inflight.lock().unwrap();
            if !inflight.insert(tenant_id) {
                warn!(tenant = %tenant_id, "provisioning already in flight; submission ignored");
                return false;
            }
        }

        let pipeline = Arc::clone(&self.pipeline);
        let inflight = Arc::clone(&self.inflight);
        tokio::spawn(async move {
            info!(tenant = %tenant_id, "provisioning started");
            if let Err(err) = pipeline.run(tenant_id).await {
                // Terminal bookkeeping already happened inside the pipeline.
                warn!(tenant = %tenant_id, error = %err, "provisioning ended in failure");
            }
            inflight.lock().unwrap().remove(&tenant_id);
        });
        true
    }

    /// Run the pipeline inline. Used by the one-shot CLI path; the
    /// single-flight guard applies here too.
    pub async fn run_blocking(&self, tenant_id: Uuid) -> crate::error::Result<()> {
        if !self.inflight.lock().unwrap().insert(tenant_id) {
            warn!(tenant = %tenant_id, "provisioning already in flight; submission ignored");
            return Ok(());
        }
        let result = self.pipeline.run(tenant_id).await;
        self.inflight.lock().unwrap().remove(&tenant_id);
        result
    }

    pub fn is_inflight(&self, tenant_id: Uuid) -> bool {
        self.inflight.lock().unwrap().contains(&tenant_id)
    }
}
