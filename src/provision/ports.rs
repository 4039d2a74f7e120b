//! Deterministic host-port allocation for Docker-backed tenants.
//!
//! The tenant id hashes to a preferred port inside the configured window;
//! linear probing (with wraparound) walks past ports already held by other
//! tenants. Determinism keeps re-provisioning sticky: a tenant that retries
//! lands back on its old port unless someone claimed it in between.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;
use url::Url;

use crate::config::PortsConfig;
use crate::error::ProvisioningError;
use crate::store::TenantStore;

pub struct PortAllocator {
    store: Arc<dyn TenantStore>,
    base_port: u16,
    range: u16,
}

impl PortAllocator {
    pub fn new(store: Arc<dyn TenantStore>, ports: &PortsConfig) -> Self {
        Self {
            store,
            base_port: ports.base_port,
            range: ports.range,
        }
    }

    /// Pick a free host port for the tenant.
    ///
    /// The occupied set is read from persisted container URLs at call time,
    /// so a port is only considered taken while some tenant record still
    /// points at it.
    pub async fn allocate(&self, tenant_id: &str) -> Result<u16, ProvisioningError> {
        let urls = self
            .store
            .occupied_container_urls()
            .await
            .map_err(|e| ProvisioningError::StepFailed {
                step: "spinning_up".to_string(),
                reason: format!("failed to read occupied ports: {e}"),
            })?;
        let occupied: HashSet<u16> = urls.iter().filter_map(|u| extract_port(u)).collect();
        let port = probe(tenant_id, &occupied, self.base_port, self.range)?;
        debug!(tenant = %tenant_id, port, "allocated host port");
        Ok(port)
    }
}

/// Multiplicative string hash over the tenant id bytes.
fn tenant_hash(tenant_id: &str) -> u32 {
    tenant_id
        .bytes()
        .fold(0u32, |h, b| h.wrapping_mul(31).wrapping_add(b as u32))
}

/// Seed at `base + hash % range`, then probe linearly with wraparound.
fn probe(
    tenant_id: &str,
    occupied: &HashSet<u16>,
    base_port: u16,
    range: u16,
) -> Result<u16, ProvisioningError> {
    let seed = tenant_hash(tenant_id) % range as u32;
    for offset in 0..range as u32 {
        let slot = (seed + offset) % range as u32;
        // Windows reaching past the end of the port space lose their tail
        // slots rather than wrapping into low ports.
        let Ok(candidate) = u16::try_from(base_port as u32 + slot) else {
            continue;
        };
        if !occupied.contains(&candidate) {
            return Ok(candidate);
        }
    }
    Err(ProvisioningError::CapacityExhausted { base_port, range })
}

fn extract_port(url: &str) -> Option<u16> {
    Url::parse(url).ok()?.port()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_is_deterministic() {
        let occupied = HashSet::new();
        let a = probe("tenant-a", &occupied, 19000, 1000).unwrap();
        let b = probe("tenant-a", &occupied, 19000, 1000).unwrap();
        assert_eq!(a, b);
        assert!((19000..20000).contains(&a));
    }

    #[test]
    fn probing_skips_occupied_ports() {
        let preferred = probe("tenant-a", &HashSet::new(), 19000, 1000).unwrap();
        let occupied = HashSet::from([preferred]);
        let next = probe("tenant-a", &occupied, 19000, 1000).unwrap();
        assert_ne!(next, preferred);
        // Linear probe: the very next slot, modulo the window.
        let expected = if preferred == 19999 { 19000 } else { preferred + 1 };
        assert_eq!(next, expected);
    }

    #[test]
    fn probe_wraps_around_the_window() {
        // Occupy everything except the slot just before the seed, forcing a
        // full wrap.
        let base = 19000u16;
        let range = 10u16;
        let seed_port = probe("tenant-w", &HashSet::new(), base, range).unwrap();
        let free = if seed_port == base {
            base + range - 1
        } else {
            seed_port - 1
        };
        let occupied: HashSet<u16> = (base..base + range).filter(|p| *p != free).collect();
        assert_eq!(probe("tenant-w", &occupied, base, range).unwrap(), free);
    }

    #[test]
    fn full_window_reports_capacity_exhausted() {
        let base = 19000u16;
        let range = 10u16;
        let occupied: HashSet<u16> = (base..base + range).collect();
        let err = probe("tenant-x", &occupied, base, range).unwrap_err();
        assert!(matches!(
            err,
            ProvisioningError::CapacityExhausted {
                base_port: 19000,
                range: 10
            }
        ));
    }

    #[test]
    fn ports_come_from_persisted_urls_only() {
        assert_eq!(extract_port("http://127.0.0.1:19042"), Some(19042));
        assert_eq!(
            extract_port("http://runtime.tenant-ns.svc.cluster.local:18789"),
            Some(18789)
        );
        assert_eq!(extract_port("http://example.com"), None);
        assert_eq!(extract_port("not a url"), None);
    }

    #[test]
    fn window_past_end_of_port_space_never_overflows() {
        // Only 65535 itself is addressable; the slot past it is skipped.
        assert_eq!(probe("", &HashSet::new(), 65535, 2).unwrap(), 65535);
        let occupied = HashSet::from([65535u16]);
        let err = probe("", &occupied, 65535, 2).unwrap_err();
        assert!(matches!(err, ProvisioningError::CapacityExhausted { .. }));
    }

    #[test]
    fn hash_matches_reference_values() {
        // h = h * 31 + byte, wrapping at u32.
        assert_eq!(tenant_hash(""), 0);
        assert_eq!(tenant_hash("a"), 97);
        assert_eq!(tenant_hash("ab"), 97 * 31 + 98);
    }
}
