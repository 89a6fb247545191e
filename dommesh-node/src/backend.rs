//! Backend construction from configuration.

use std::sync::Arc;

use tracing::info;

use dommesh_engine::MockCluster;

use crate::config::{BackendConfig, BackendKind};

/// Build the in-memory cluster and load the configured domains into it.
pub fn seed_mock_cluster(config: &BackendConfig) -> Arc<MockCluster> {
    let BackendKind::Mock = config.kind;
    let cluster = Arc::new(MockCluster::new());

    for domain in &config.domains {
        for placement in &domain.placements {
            cluster.seed(&placement.host, &domain.name, domain.snapshot(placement));
        }
        info!(
            domain = %domain.name,
            placements = domain.placements.len(),
            devices = domain.devices.len(),
            "Seeded mock domain"
        );
    }

    cluster
}
