//! Shared fixture: one in-process hub, a primary, and secondaries wired
//! through it.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use replikv_engine::instance::InstanceRegistry;
use replikv_local_store::LocalStoreSettings;
use replikv_primitives::ids::PartitionedReplicaId;
use replikv_replica::store::ReplicatedStore;
use replikv_replica::ReplicatedStoreSettings;
use replikv_test_utils::{ReplicationHub, TestTransport};

pub struct Fixture {
    pub hub: Arc<ReplicationHub>,
    pub registry: Arc<InstanceRegistry>,
}

impl Fixture {
    pub fn new() -> Self {
        init_tracing();
        Self {
            hub: ReplicationHub::new().into_arc(),
            registry: InstanceRegistry::init(32),
        }
    }

    pub fn settings() -> ReplicatedStoreSettings {
        ReplicatedStoreSettings {
            commit_batching_period: Duration::from_millis(30),
            transaction_drain_timeout: Duration::from_secs(60),
            ..Default::default()
        }
    }

    pub async fn open_replica(
        &self,
        root: &Path,
        replica_id: u64,
        settings: ReplicatedStoreSettings,
    ) -> (Arc<ReplicatedStore>, Arc<TestTransport>) {
        let transport = TestTransport::new(self.hub.clone());
        let store = ReplicatedStore::open(
            root,
            PartitionedReplicaId::new("part0", replica_id),
            settings,
            LocalStoreSettings::default(),
            transport.clone(),
            self.registry.clone(),
            None,
            None,
        )
        .await
        .unwrap();
        (store, transport)
    }

    pub async fn open_primary(
        &self,
        root: &Path,
        replica_id: u64,
    ) -> (Arc<ReplicatedStore>, Arc<TestTransport>) {
        let (store, transport) = self
            .open_replica(root, replica_id, Self::settings())
            .await;
        store.change_to_primary().await.unwrap();
        (store, transport)
    }
}

fn init_tracing() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// Polls `cond` until it holds or the timeout expires.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}
