use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use serde_json::json;
use tracing::info;

use crate::converter::{Config, GlobalPlugin};
use crate::error::{Error, Result};
use crate::store::Store;

/// Environment variable naming a writable directory for staged certificates.
const RUNTIME_DIRECTORY: &str = "RUNTIME_DIRECTORY";

/// Materializes user-provided TLS secrets onto disk for the proxy's
/// certificate loader, so the cert subsystem never needs cluster access.
///
/// State survives across assemblies: the staging directory and the observed
/// resourceVersion of every secret already on disk. The plugin is invoked far
/// more often than secrets change, so it touches the disk only for new,
/// changed or dereferenced secrets.
pub struct TlsPlugin {
    staging: Option<Staging>,
    secret_versions: BTreeMap<String, String>,
}

enum Staging {
    Runtime(PathBuf),
    Temp(tempfile::TempDir),
}

impl Staging {
    fn path(&self) -> &Path {
        match self {
            Staging::Runtime(path) => path,
            Staging::Temp(dir) => dir.path(),
        }
    }
}

impl TlsPlugin {
    pub fn new() -> Self {
        TlsPlugin {
            staging: None,
            secret_versions: BTreeMap::new(),
        }
    }

    /// The staging directory, created on first use.
    fn staging_dir(&mut self) -> Result<&Path> {
        if self.staging.is_none() {
            let staging = match env::var(RUNTIME_DIRECTORY) {
                Ok(root) if !root.is_empty() => {
                    let path = PathBuf::from(root).join("certs");
                    fs::create_dir_all(&path)?;
                    Staging::Runtime(path)
                }
                _ => Staging::Temp(tempfile::tempdir()?),
            };
            self.staging = Some(staging);
        }
        Ok(self
            .staging
            .as_ref()
            .map(Staging::path)
            .unwrap_or(Path::new("")))
    }

    fn secret_path(&mut self, name: &str) -> Result<PathBuf> {
        let file = format!("{}.pem", sanitize_file_name(name));
        Ok(self.staging_dir()?.join(file))
    }
}

#[async_trait]
impl GlobalPlugin for TlsPlugin {
    async fn global_handler(&mut self, config: &mut Config, store: &Store) -> Result<()> {
        let mut hosts: Vec<String> = Vec::new();
        let mut secret_refs: Vec<String> = Vec::new();

        // Hosts and secret references subject to user-provided certs.
        for ingress in store.ingresses() {
            let namespace = ingress.metadata.namespace.as_deref().unwrap_or("");
            let tls_blocks = ingress
                .spec
                .as_ref()
                .and_then(|spec| spec.tls.as_ref())
                .into_iter()
                .flatten();
            for block in tls_blocks {
                let Some(secret_name) = block.secret_name.as_deref() else {
                    continue;
                };
                for host in block.hosts.iter().flatten() {
                    if !hosts.contains(host) {
                        hosts.push(host.clone());
                    }
                    let secret_ref = format!("{namespace}/{secret_name}");
                    if !secret_refs.contains(&secret_ref) {
                        secret_refs.push(secret_ref);
                    }
                }
            }
        }

        // Evict staged secrets that are dereferenced or stale per the cache.
        let tracked: Vec<(String, String)> = self
            .secret_versions
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (name, version) in tracked {
            let mut keep = secret_refs.contains(&name);
            if keep {
                if let Some(meta) = store.secret_meta(&name) {
                    if meta.metadata.resource_version.as_deref() != Some(version.as_str()) {
                        keep = false;
                    }
                }
            } else {
                info!(secret = name, "TLS secret dereferenced");
            }

            if !keep {
                self.secret_versions.remove(&name);
                let path = self.secret_path(&name)?;
                if let Err(e) = fs::remove_file(&path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        return Err(e.into());
                    }
                }
            }
        }

        // Fetch missing secrets from the cluster; the local cache holds only
        // metadata.
        if let Some(client) = store.client.clone() {
            for name in &secret_refs {
                if self.secret_versions.contains_key(name) {
                    continue;
                }
                info!(secret = name, "TLS secret updated");

                let (namespace, secret_name) = name.split_once('/').ok_or_else(|| {
                    Error::parse("secretName", name, "expected namespace/name")
                })?;
                let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
                let secret = api.get(secret_name).await?;

                let mut content = Vec::new();
                for value in secret.data.iter().flat_map(|data| data.values()) {
                    content.extend_from_slice(&value.0);
                }

                let path = self.secret_path(name)?;
                write_secret_file(&path, &content)?;
                self.secret_versions
                    .insert(name.clone(), secret.metadata.resource_version.unwrap_or_default());
            }
        }

        if !hosts.is_empty() {
            let staging = self.staging_dir()?.to_string_lossy().into_owned();
            config
                .tls_app_mut()
                .certificates
                .insert("load_folders".to_string(), json!([staging]));
            // These hosts bring their own certs; auto-HTTPS must not manage
            // them.
            config.http_server_mut().automatic_https.skip_certificates = hosts;
        }
        Ok(())
    }
}

/// Atomic replace with owner-only permissions.
fn write_secret_file(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    let mut staged = tempfile::NamedTempFile::new_in(dir)?;
    staged.write_all(content)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(staged.path(), fs::Permissions::from_mode(0o600))?;
    }
    staged
        .persist(path)
        .map_err(|e| Error::Io(e.error))?;
    Ok(())
}

/// Keeps letters, digits, hyphen and underscore; everything else becomes
/// `__`.
fn sanitize_file_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
            out.push(c);
        } else {
            out.push_str("__");
        }
    }
    out
}
