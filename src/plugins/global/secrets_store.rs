use async_trait::async_trait;

use crate::converter::{config::Storage, Config, GlobalPlugin};
use crate::error::Result;
use crate::storage::STORAGE_MODULE;
use crate::store::Store;

/// Points the proxy's certificate engine at the cluster-backed store in this
/// pod's namespace.
pub struct SecretsStorePlugin;

#[async_trait]
impl GlobalPlugin for SecretsStorePlugin {
    async fn global_handler(&mut self, config: &mut Config, store: &Store) -> Result<()> {
        config.storage = Storage {
            module: STORAGE_MODULE.to_string(),
            namespace: store.current_pod.namespace.clone(),
            lease_id: store.options.lease_id.clone(),
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Options, PodInfo};

    #[tokio::test]
    async fn sets_the_storage_reference() {
        let store = Store::new(
            Options {
                lease_id: "lease-1".to_string(),
                ..Default::default()
            },
            "",
            PodInfo {
                namespace: "edge".to_string(),
                ..Default::default()
            },
            None,
        );

        let mut config = Config::new();
        SecretsStorePlugin
            .global_handler(&mut config, &store)
            .await
            .unwrap();

        assert_eq!(config.storage.module, "secret_store");
        assert_eq!(config.storage.namespace, "edge");
        assert_eq!(config.storage.lease_id, "lease-1");
    }
}
