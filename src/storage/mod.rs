//! Cluster-backed certificate storage for the proxy runtime.
//!
//! Each key maps to one Secret in this pod's namespace, labeled for
//! discovery; locks are Leases with a reserved prefix so multiple controller
//! replicas can safely share certificate issuance.

mod lease;

pub use lease::{decide, LeaseDecision};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams};
use kube::Client;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Module id the generated proxy config points its storage at.
pub const STORAGE_MODULE: &str = "secret_store";

const KEY_PREFIX: &str = "rudder.ingress--";
const LEASE_PREFIX: &str = "rudder-lock-";
const MANAGER_LABEL: &str = "manager=rudder";

const LEASE_DURATION: Duration = Duration::from_secs(5);
const LEASE_RENEW_INTERVAL: Duration = Duration::from_secs(2);
const LEASE_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("lock is held by {0} and has not yet expired")]
    LockHeld(String),

    /// The lease disappeared while we thought we were holding it.
    #[error("lock has been released")]
    LockReleased,

    #[error("shutting down")]
    Cancelled,

    #[error(transparent)]
    Api(#[from] kube::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    pub key: String,
    pub modified: Option<DateTime<Utc>>,
    pub size: u64,
}

/// Strips characters the platform's name alphabet cannot carry; runs of
/// escaped characters collapse into one `.`.
fn clean_key(key: &str, prefix: &str) -> String {
    let mut out = String::from(prefix);
    let mut escaped = false;
    for c in key.chars() {
        if c.is_ascii_alphanumeric() || c == '-' {
            out.push(c);
            escaped = false;
        } else if !escaped {
            out.push('.');
            escaped = true;
        }
    }
    out
}

/// Content-addressed key/value store over cluster Secrets, with lease-based
/// distributed locking.
#[derive(Clone)]
pub struct SecretStorage {
    client: Client,
    namespace: String,
    lease_id: String,
    held_locks: Arc<Mutex<HashMap<String, CancellationToken>>>,
    shutdown: CancellationToken,
}

impl SecretStorage {
    pub fn new(client: Client, namespace: &str, lease_id: &str) -> Self {
        SecretStorage {
            client,
            namespace: namespace.to_string(),
            lease_id: lease_id.to_string(),
            held_locks: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    fn secrets(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn leases(&self) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn labels() -> std::collections::BTreeMap<String, String> {
        let (key, value) = MANAGER_LABEL.split_once('=').unwrap_or(("manager", ""));
        std::collections::BTreeMap::from([(key.to_string(), value.to_string())])
    }

    /// True iff a secret with the exact cleaned name is listed.
    ///
    /// An earlier revision of this store answered the inverted question;
    /// these are the corrected semantics.
    pub async fn exists(&self, key: &str) -> bool {
        let name = clean_key(key, KEY_PREFIX);
        debug!(name = key, "finding secret");
        let params = ListParams::default().fields(&format!("metadata.name={name}"));
        match self.secrets().list(&params).await {
            Ok(list) => list
                .items
                .iter()
                .any(|s| s.metadata.name.as_deref() == Some(name.as_str())),
            Err(_) => false,
        }
    }

    /// Returns the bytes stored at `key`.
    pub async fn load(&self, key: &str) -> Result<Vec<u8>> {
        let name = clean_key(key, KEY_PREFIX);
        debug!(name = key, "loading secret");
        let secret = self
            .secrets()
            .get(&name)
            .await
            .map_err(|e| not_found_as(e, key))?;
        Ok(secret
            .data
            .and_then(|mut data| data.remove("value"))
            .map(|value| value.0)
            .unwrap_or_default())
    }

    /// Saves `value` at `key`, creating or updating the backing secret.
    pub async fn store(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let name = clean_key(key, KEY_PREFIX);
        let api = self.secrets();
        let data =
            std::collections::BTreeMap::from([("value".to_string(), ByteString(value))]);

        match api.get_opt(&name).await? {
            Some(mut existing) => {
                debug!(name = key, "updating secret");
                existing.data = Some(data);
                existing.metadata.labels = Some(Self::labels());
                api.replace(&name, &PostParams::default(), &existing).await?;
            }
            None => {
                debug!(name = key, "creating secret");
                let secret = Secret {
                    metadata: ObjectMeta {
                        name: Some(name.clone()),
                        namespace: Some(self.namespace.clone()),
                        labels: Some(Self::labels()),
                        ..Default::default()
                    },
                    data: Some(data),
                    ..Default::default()
                };
                api.create(&PostParams::default(), &secret).await?;
            }
        }
        Ok(())
    }

    /// Deletes the value at `key`. Deleting a missing key is not an error.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let name = clean_key(key, KEY_PREFIX);
        debug!(name = key, "deleting secret");
        match self.secrets().delete(&name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Lists stored keys under `prefix`, internal prefix stripped.
    pub async fn list(&self, prefix: &str, _recursive: bool) -> Result<Vec<String>> {
        debug!(name = prefix, "listing secrets");
        let params = ListParams::default().labels(MANAGER_LABEL);
        let cleaned_prefix = clean_key(prefix, KEY_PREFIX);

        let mut keys = Vec::new();
        for secret in self.secrets().list(&params).await?.items {
            let Some(name) = secret.metadata.name else {
                continue;
            };
            if name.starts_with(&cleaned_prefix) {
                keys.push(name.trim_start_matches(KEY_PREFIX).to_string());
            }
        }
        Ok(keys)
    }

    /// Size and modification time for `key`.
    pub async fn stat(&self, key: &str) -> Result<KeyInfo> {
        let name = clean_key(key, KEY_PREFIX);
        debug!(name = key, "stat secret");
        let secret = self
            .secrets()
            .get(&name)
            .await
            .map_err(|e| not_found_as(e, key))?;
        Ok(KeyInfo {
            key: key.to_string(),
            modified: secret.metadata.creation_timestamp.map(|t| t.0),
            size: secret
                .data
                .as_ref()
                .and_then(|data| data.get("value"))
                .map(|v| v.0.len() as u64)
                .unwrap_or(0),
        })
    }

    /// Acquires the distributed lock for `key`, blocking until the current
    /// holder releases it or its lease expires. On success a keep-alive task
    /// renews the lease until `unlock` or shutdown.
    pub async fn lock(&self, key: &str) -> Result<()> {
        let lease_name = clean_key(key, LEASE_PREFIX);
        loop {
            match self.try_acquire_or_renew(&lease_name, false).await {
                Ok(()) => {
                    let token = self.shutdown.child_token();
                    self.held_locks
                        .lock()
                        .expect("lock registry poisoned")
                        .insert(lease_name.clone(), token.clone());

                    let keeper = self.clone();
                    let name = lease_name.clone();
                    tokio::spawn(async move { keeper.keep_lock_updated(name, token).await });
                    return Ok(());
                }
                Err(StorageError::LockHeld(holder)) => {
                    debug!(key, holder, "lock busy, polling");
                }
                Err(e) => {
                    debug!(key, error = %e, "lock attempt failed, polling");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(LEASE_POLL_INTERVAL) => {}
                _ = self.shutdown.cancelled() => return Err(StorageError::Cancelled),
            }
        }
    }

    async fn keep_lock_updated(&self, lease_name: String, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(LEASE_RENEW_INTERVAL) => {}
                _ = token.cancelled() => return,
            }
            if self.try_acquire_or_renew(&lease_name, true).await.is_err() {
                return;
            }
        }
    }

    /// One acquisition attempt. `should_exist` marks renewal calls, where a
    /// missing lease means the lock was released underneath us.
    async fn try_acquire_or_renew(&self, lease_name: &str, should_exist: bool) -> Result<()> {
        let api = self.leases();
        let now = Utc::now();

        let Some(mut lease) = api.get_opt(lease_name).await? else {
            if should_exist {
                return Err(StorageError::LockReleased);
            }
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(lease_name.to_string()),
                    namespace: Some(self.namespace.clone()),
                    ..Default::default()
                },
                spec: Some(new_spec(&self.lease_id, now, now, 0)),
            };
            api.create(&PostParams::default(), &lease).await?;
            return Ok(());
        };

        let current = lease.spec.take().unwrap_or_default();
        match decide(&current, &self.lease_id, now) {
            LeaseDecision::Refuse { holder } => Err(StorageError::LockHeld(holder)),
            LeaseDecision::Renew {
                acquire,
                transitions,
            } => {
                // The resourceVersion from the read guards the update.
                lease.spec = Some(new_spec(&self.lease_id, acquire, now, transitions));
                api.replace(lease_name, &PostParams::default(), &lease).await?;
                Ok(())
            }
        }
    }

    /// Releases the lock for `key`: stops the keep-alive and deletes the
    /// lease object.
    pub async fn unlock(&self, key: &str) -> Result<()> {
        let lease_name = clean_key(key, LEASE_PREFIX);
        if let Some(token) = self
            .held_locks
            .lock()
            .expect("lock registry poisoned")
            .remove(&lease_name)
        {
            token.cancel();
        }
        match self
            .leases()
            .delete(&lease_name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Drops every lock this instance still holds. Called at shutdown; a
    /// crash instead leaves leases to expire after their duration.
    pub async fn release_all(&self) {
        self.shutdown.cancel();
        let held: Vec<String> = self
            .held_locks
            .lock()
            .expect("lock registry poisoned")
            .drain()
            .map(|(name, token)| {
                token.cancel();
                name
            })
            .collect();

        for lease_name in held {
            let _ = self
                .leases()
                .delete(&lease_name, &DeleteParams::default())
                .await;
        }
    }
}

fn new_spec(
    holder: &str,
    acquire: DateTime<Utc>,
    renew: DateTime<Utc>,
    transitions: i32,
) -> LeaseSpec {
    LeaseSpec {
        holder_identity: Some(holder.to_string()),
        lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
        acquire_time: Some(MicroTime(acquire)),
        renew_time: Some(MicroTime(renew)),
        lease_transitions: Some(transitions),
        ..Default::default()
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

fn not_found_as(err: kube::Error, key: &str) -> StorageError {
    if is_not_found(&err) {
        StorageError::NotFound(key.to_string())
    } else {
        StorageError::Api(err)
    }
}
