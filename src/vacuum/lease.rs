use tracing::debug;

use crate::constants::vacuum::LEASE_TTL;
use crate::ring::{Ring, RingError};

/// Take or renew the lease at `key` for `hostname`
///
/// Succeeds when the key is absent or already names this host; a lease held
/// by another host is left alone and `false` is returned.
pub async fn claim_lease(ring: &Ring, key: &str, hostname: &str) -> Result<bool, RingError> {
    if let Some(owner) = ring.get(key).await?
        && owner != hostname.as_bytes()
    {
        debug!(
            "Lease {} belongs to {}",
            key,
            String::from_utf8_lossy(&owner)
        );
        return Ok(false);
    }
    ring.set(key, hostname.as_bytes()).await?;
    ring.expire(key, LEASE_TTL).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{BackendDescriptor, MemoryConnector};
    use crate::types::MaxFailures;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_lease_ownership() {
        let connector = MemoryConnector::new();
        let ring = Ring::connect(
            &[BackendDescriptor::memory("lease")],
            Arc::new(connector.clone()),
            MaxFailures::DEFAULT,
        )
        .await
        .unwrap();

        assert!(claim_lease(&ring, "dw.vacuum.full.1", "alpha").await.unwrap());
        // Renewal by the owner
        assert!(claim_lease(&ring, "dw.vacuum.full.1", "alpha").await.unwrap());
        assert!(!claim_lease(&ring, "dw.vacuum.full.1", "beta").await.unwrap());

        let ttl = connector.store("lease").ttl("dw.vacuum.full.1").unwrap();
        assert!(ttl > LEASE_TTL - Duration::from_secs(2) && ttl <= LEASE_TTL);
        assert_eq!(
            ring.get("dw.vacuum.full.1").await.unwrap(),
            Some(b"alpha".to_vec())
        );
    }
}
