//! The reconciliation engine: watchers feed a rate-limited queue, a single
//! consumer converges the proxy on the latest desired config, and a periodic
//! tick keeps Ingress statuses in sync.

mod actions;
mod diagnostics;
mod handlers;
mod queue;
mod status;

pub use actions::{Action, ResourceEvent};
pub use diagnostics::Diagnostics;
pub use handlers::QueuedEventHandlers;
pub use queue::{Keyed, RateLimitingQueue};
pub use status::needs_status_update;

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::Api;
use kube::Client;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::converter::Converter;
use crate::error::Result;
use crate::k8s::is_controlled_ingress;
use crate::plugins::default_plugins;
use crate::proxy::ProxyServer;
use crate::storage::SecretStorage;
use crate::store::{Options, PodInfo, Store};

/// How often ingress status addresses are re-synced.
const SYNC_INTERVAL: Duration = Duration::from_secs(30);

pub type ActionQueue = RateLimitingQueue<Action>;

/// The ingress controller: owns the store, the assembler and the last
/// applied proxy config. All mutation happens on its consumer task.
pub struct Controller {
    client: Client,
    pub(crate) store: Store,
    queue: Arc<ActionQueue>,
    converter: Converter,
    proxy: Box<dyn ProxyServer>,
    storage: SecretStorage,
    last_applied: Option<Vec<u8>>,
    cancel: CancellationToken,
}

impl Controller {
    pub fn new(
        client: Client,
        options: Options,
        config_namespace: &str,
        pod: PodInfo,
        proxy: Box<dyn ProxyServer>,
        storage: SecretStorage,
        cancel: CancellationToken,
    ) -> Self {
        let converter = Converter::new(default_plugins(), &options.plugins_order);
        let store = Store::new(options, config_namespace, pod, Some(client.clone()));
        Controller {
            client,
            store,
            queue: RateLimitingQueue::new(),
            converter,
            proxy,
            storage,
            last_applied: None,
            cancel,
        }
    }

    /// Runs until the stop signal: starts the watchers, waits for every
    /// initial cache sync, then drains the queue. The in-flight action
    /// finishes before shutdown proceeds.
    pub async fn run(&mut self) {
        let ready = self.spawn_watchers();
        for rx in ready {
            let _ = rx.await;
        }
        info!("initial cache sync complete, starting the reconciler");

        self.spawn_status_ticker();

        loop {
            let action = tokio::select! {
                _ = self.cancel.cancelled() => break,
                action = self.queue.pop() => action,
            };
            let Some(action) = action else { break };
            self.process_next_item(action).await;
        }

        self.shutdown().await;
    }

    fn spawn_watchers(&self) -> Vec<oneshot::Receiver<()>> {
        let mut ready = Vec::new();
        let watch_namespace = self.store.options.watch_namespace.clone();

        {
            let (tx, rx) = oneshot::channel();
            ready.push(rx);
            let options = self.store.options.clone();
            let handlers =
                QueuedEventHandlers::new(Arc::clone(&self.queue), Action::IngressChanged)
                    .with_filter(move |ing: &Ingress| is_controlled_ingress(&options, ing))
                    .with_ready(tx);
            let api: Api<Ingress> = namespaced_or_all(&self.client, &watch_namespace);
            tokio::spawn(handlers.run(api, self.cancel.clone()));
        }

        {
            let (tx, rx) = oneshot::channel();
            ready.push(rx);
            let handlers =
                QueuedEventHandlers::new(Arc::clone(&self.queue), Action::ServiceChanged)
                    .with_ready(tx);
            let api: Api<Service> = namespaced_or_all(&self.client, &watch_namespace);
            tokio::spawn(handlers.run(api, self.cancel.clone()));
        }

        {
            let (tx, rx) = oneshot::channel();
            ready.push(rx);
            let handlers =
                QueuedEventHandlers::new(Arc::clone(&self.queue), Action::EndpointSliceChanged)
                    .with_ready(tx);
            let api: Api<EndpointSlice> = namespaced_or_all(&self.client, &watch_namespace);
            tokio::spawn(handlers.run(api, self.cancel.clone()));
        }

        {
            let (tx, rx) = oneshot::channel();
            ready.push(rx);
            // Only metadata ever reaches the store; certificate bytes are
            // fetched on demand by the TLS plugin.
            let handlers =
                QueuedEventHandlers::new(Arc::clone(&self.queue), Action::SecretChanged)
                    .with_transform(|mut secret: Secret| {
                        secret.data = None;
                        secret.string_data = None;
                        secret
                    })
                    .with_ready(tx);
            let api: Api<Secret> = namespaced_or_all(&self.client, &watch_namespace);
            tokio::spawn(handlers.run(api, self.cancel.clone()));
        }

        if !self.store.options.config_map_name.is_empty() {
            let (tx, rx) = oneshot::channel();
            ready.push(rx);
            let name = self.store.options.config_map_name.clone();
            let handlers =
                QueuedEventHandlers::new(Arc::clone(&self.queue), Action::LoadConfigMap)
                    .with_filter(move |cm: &ConfigMap| {
                        cm.metadata.name.as_deref() == Some(name.as_str())
                    })
                    .with_ready(tx);
            let api: Api<ConfigMap> =
                Api::namespaced(self.client.clone(), &self.store.config_namespace);
            tokio::spawn(handlers.run(api, self.cancel.clone()));
        }

        ready
    }

    fn spawn_status_ticker(&self) {
        let queue = Arc::clone(&self.queue);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SYNC_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => queue.add(Action::SyncStatus),
                    _ = cancel.cancelled() => return,
                }
            }
        });
    }

    /// One queue item: apply it to the store, then converge the proxy.
    /// Failures log, keep the last applied config and rely on the queue's
    /// backoff; they are never fatal for the loop.
    async fn process_next_item(&mut self, action: Action) {
        let key = action.key();
        if let Err(e) = action.handle(self).await {
            warn!(action = key, error = %e, "action failed, will retry");
            Arc::clone(&self.queue).requeue(action);
            return;
        }
        self.queue.forget(&key);

        if let Err(e) = self.reload_proxy().await {
            error!(error = %e, "could not reload the proxy");
            Arc::clone(&self.queue).requeue(action);
        }
    }

    async fn reload_proxy(&mut self) -> Result<()> {
        reload(
            &mut self.converter,
            &self.store,
            &mut self.last_applied,
            self.proxy.as_ref(),
        )
        .await
    }

    pub(crate) async fn sync_status(&self) -> Result<()> {
        status::sync_status(&self.store, &self.client, &self.cancel).await
    }

    async fn shutdown(&mut self) {
        info!("stopping ingress controller");
        self.queue.shut_down();

        // Record the removal in the external source of truth before the
        // proxy goes away.
        status::update_ingress_statuses(
            &self.client,
            &[],
            &self.store.ingresses(),
            &CancellationToken::new(),
        )
        .await;

        if let Err(e) = self.proxy.stop().await {
            error!(error = %e, "failed to stop the proxy");
        }
        self.storage.release_all().await;
    }
}

/// Assembles a fresh config and submits it iff it differs byte-for-byte from
/// the last applied one. On any error the last applied config stays in
/// place.
pub async fn reload(
    converter: &mut Converter,
    store: &Store,
    last_applied: &mut Option<Vec<u8>>,
    proxy: &dyn ProxyServer,
) -> Result<()> {
    let config = converter.convert(store).await?;
    let bytes = serde_json::to_vec(&config)?;

    if last_applied.as_deref() == Some(bytes.as_slice()) {
        debug!("proxy config did not change, skipping reload");
        return Ok(());
    }

    debug!(bytes = bytes.len(), "reloading proxy with new config");
    proxy.load(&bytes).await?;
    *last_applied = Some(bytes);
    Ok(())
}

fn namespaced_or_all<T>(client: &Client, namespace: &str) -> Api<T>
where
    T: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    T::DynamicType: Default,
{
    if namespace.is_empty() {
        Api::all(client.clone())
    } else {
        Api::namespaced(client.clone(), namespace)
    }
}
