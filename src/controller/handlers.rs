use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;

use futures::{pin_mut, StreamExt};
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use kube::ResourceExt;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::actions::{Action, ResourceEvent};
use super::queue::RateLimitingQueue;

/// Typed event dispatch from one watcher stream into the action queue.
///
/// Keeps the last seen state of every object so that updates crossing the
/// filter boundary become synthetic add/delete events: downstream handlers
/// only ever see consistent transitions. A re-list prunes objects that
/// vanished while the watch was broken.
pub struct QueuedEventHandlers<T> {
    queue: Arc<RateLimitingQueue<Action>>,
    to_action: fn(ResourceEvent<T>) -> Action,
    filter: Option<Box<dyn Fn(&T) -> bool + Send>>,
    transform: Option<fn(T) -> T>,
    last_seen: HashMap<String, T>,
    in_init: bool,
    init_seen: HashSet<String>,
    ready: Option<oneshot::Sender<()>>,
}

impl<T> QueuedEventHandlers<T>
where
    T: kube::Resource + Clone,
{
    pub fn new(
        queue: Arc<RateLimitingQueue<Action>>,
        to_action: fn(ResourceEvent<T>) -> Action,
    ) -> Self {
        QueuedEventHandlers {
            queue,
            to_action,
            filter: None,
            transform: None,
            last_seen: HashMap::new(),
            in_init: false,
            init_seen: HashSet::new(),
            ready: None,
        }
    }

    /// Only events passing the filter reach the queue; transitions in or out
    /// are rewritten as add/delete.
    pub fn with_filter(mut self, filter: impl Fn(&T) -> bool + Send + 'static) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }

    /// Applied to every object before it is cached or enqueued (e.g.
    /// stripping secret data).
    pub fn with_transform(mut self, transform: fn(T) -> T) -> Self {
        self.transform = Some(transform);
        self
    }

    /// Signalled once, after the initial listing is fully delivered.
    pub fn with_ready(mut self, ready: oneshot::Sender<()>) -> Self {
        self.ready = Some(ready);
        self
    }

    fn passes(&self, obj: &T) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(obj))
    }

    fn object_key(obj: &T) -> String {
        format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
    }

    fn enqueue(&self, event: ResourceEvent<T>) {
        self.queue.add((self.to_action)(event));
    }

    fn apply(&mut self, obj: T) {
        let obj = match self.transform {
            Some(transform) => transform(obj),
            None => obj,
        };
        let key = Self::object_key(&obj);
        if self.in_init {
            self.init_seen.insert(key.clone());
        }

        let old = self.last_seen.insert(key, obj.clone());
        let old_in = old.as_ref().is_some_and(|o| self.passes(o));
        let new_in = self.passes(&obj);

        match (old_in, new_in) {
            (true, true) => self.enqueue(ResourceEvent::Updated(obj)),
            (false, true) => self.enqueue(ResourceEvent::Added(obj)),
            // Left the filter: downstream must forget the old object.
            (true, false) => {
                if let Some(old) = old {
                    self.enqueue(ResourceEvent::Deleted(old));
                }
            }
            (false, false) => {}
        }
    }

    fn delete(&mut self, obj: T) {
        let obj = match self.transform {
            Some(transform) => transform(obj),
            None => obj,
        };
        let key = Self::object_key(&obj);
        self.last_seen.remove(&key);
        if self.passes(&obj) {
            self.enqueue(ResourceEvent::Deleted(obj));
        }
    }

    fn begin_init(&mut self) {
        self.in_init = true;
        self.init_seen.clear();
    }

    /// Ends a (re-)list: objects that were cached but not re-listed are gone.
    fn finish_init(&mut self) {
        if !self.in_init {
            return;
        }
        self.in_init = false;

        let vanished: Vec<String> = self
            .last_seen
            .keys()
            .filter(|key| !self.init_seen.contains(*key))
            .cloned()
            .collect();
        for key in vanished {
            if let Some(old) = self.last_seen.remove(&key) {
                if self.passes(&old) {
                    self.enqueue(ResourceEvent::Deleted(old));
                }
            }
        }
        self.init_seen.clear();

        if let Some(ready) = self.ready.take() {
            let _ = ready.send(());
        }
    }
}

impl<T> QueuedEventHandlers<T>
where
    T: kube::Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    T::DynamicType: Default + Clone + std::hash::Hash + Eq,
{
    /// Drives the watcher stream until cancelled.
    pub async fn run(mut self, api: Api<T>, cancel: CancellationToken) {
        let kind = T::kind(&T::DynamicType::default()).into_owned();
        info!(kind, "starting watcher");

        let stream = watcher::watcher(api, watcher::Config::default());
        pin_mut!(stream);

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return,
                event = stream.next() => match event {
                    Some(event) => event,
                    None => return,
                },
            };

            match event {
                Ok(Event::Init) => {
                    debug!(kind, "watcher (re)listing");
                    self.begin_init();
                }
                Ok(Event::InitApply(obj)) | Ok(Event::Apply(obj)) => self.apply(obj),
                Ok(Event::Delete(obj)) => self.delete(obj),
                Ok(Event::InitDone) => {
                    debug!(kind, "watcher initial sync complete");
                    self.finish_init();
                }
                Err(e) => {
                    warn!(kind, error = %e, "watcher error");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::api::networking::v1::{Ingress, IngressSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    fn ingress(name: &str, class: Option<&str>) -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                ingress_class_name: class.map(|c| c.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn handlers(
        queue: Arc<RateLimitingQueue<Action>>,
    ) -> QueuedEventHandlers<Ingress> {
        QueuedEventHandlers::new(queue, Action::IngressChanged)
            .with_filter(|ing: &Ingress| {
                ing.spec
                    .as_ref()
                    .and_then(|s| s.ingress_class_name.as_deref())
                    == Some("rudder")
            })
    }

    async fn next_event(queue: &RateLimitingQueue<Action>) -> ResourceEvent<Ingress> {
        match queue.pop().await {
            Some(Action::IngressChanged(event)) => event,
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[tokio::test]
    async fn add_then_update_classification() {
        let queue = RateLimitingQueue::new();
        let mut h = handlers(Arc::clone(&queue));

        h.apply(ingress("web", Some("rudder")));
        assert!(matches!(next_event(&queue).await, ResourceEvent::Added(_)));

        h.apply(ingress("web", Some("rudder")));
        assert!(matches!(next_event(&queue).await, ResourceEvent::Updated(_)));

        h.delete(ingress("web", Some("rudder")));
        assert!(matches!(next_event(&queue).await, ResourceEvent::Deleted(_)));
    }

    #[tokio::test]
    async fn events_outside_the_filter_are_dropped() {
        let queue = RateLimitingQueue::new();
        let mut h = handlers(Arc::clone(&queue));

        h.apply(ingress("other", Some("nginx")));
        h.apply(ingress("other", Some("nginx")));
        h.delete(ingress("other", Some("nginx")));

        // Nothing reached the queue: a probe item pops first.
        queue.add(Action::SyncStatus);
        assert!(matches!(queue.pop().await, Some(Action::SyncStatus)));
    }

    #[tokio::test]
    async fn filter_transitions_become_synthetic_add_and_delete() {
        let queue = RateLimitingQueue::new();
        let mut h = handlers(Arc::clone(&queue));

        // Enters the filter on update: synthetic add.
        h.apply(ingress("web", Some("nginx")));
        h.apply(ingress("web", Some("rudder")));
        assert!(matches!(next_event(&queue).await, ResourceEvent::Added(_)));

        // Leaves the filter on update: synthetic delete carrying the old
        // object.
        h.apply(ingress("web", Some("nginx")));
        match next_event(&queue).await {
            ResourceEvent::Deleted(old) => {
                let class = old.spec.unwrap().ingress_class_name.unwrap();
                assert_eq!(class, "rudder");
            }
            other => panic!("expected delete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn relist_prunes_vanished_objects() {
        let queue = RateLimitingQueue::new();
        let mut h = handlers(Arc::clone(&queue));

        h.begin_init();
        h.apply(ingress("kept", Some("rudder")));
        h.apply(ingress("dropped", Some("rudder")));
        h.finish_init();
        // Drain the two adds.
        next_event(&queue).await;
        next_event(&queue).await;

        // Second list no longer carries "dropped".
        h.begin_init();
        h.apply(ingress("kept", Some("rudder")));
        h.finish_init();

        // One update for "kept", then a synthetic delete for "dropped".
        assert!(matches!(next_event(&queue).await, ResourceEvent::Updated(_)));
        match next_event(&queue).await {
            ResourceEvent::Deleted(old) => {
                assert_eq!(old.metadata.name.as_deref(), Some("dropped"));
            }
            other => panic!("expected delete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ready_fires_once_after_first_sync() {
        let queue = RateLimitingQueue::new();
        let (tx, rx) = oneshot::channel();
        let mut h = handlers(Arc::clone(&queue)).with_ready(tx);

        h.begin_init();
        h.finish_init();
        assert!(rx.await.is_ok());

        // A second list must not panic on the consumed sender.
        h.begin_init();
        h.finish_init();
    }

    #[tokio::test]
    async fn transform_strips_secret_data_before_caching() {
        let queue: Arc<RateLimitingQueue<Action>> = RateLimitingQueue::new();
        let mut h = QueuedEventHandlers::new(Arc::clone(&queue), Action::SecretChanged)
            .with_transform(|mut secret: Secret| {
                secret.data = None;
                secret.string_data = None;
                secret
            });

        let mut data = BTreeMap::new();
        data.insert("tls.crt".to_string(), ByteString(b"cert".to_vec()));
        h.apply(Secret {
            metadata: ObjectMeta {
                name: Some("tls".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        });

        match queue.pop().await {
            Some(Action::SecretChanged(event)) => {
                assert!(event.resource().data.is_none());
            }
            other => panic!("unexpected action {other:?}"),
        }
    }
}
