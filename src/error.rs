use thiserror::Error;

/// Controller error taxonomy.
///
/// Every variant that originates from a cluster object carries its
/// coordinates so callers can log without re-deriving them.
#[derive(Error, Debug)]
pub enum Error {
    /// The cluster API (or the proxy admin endpoint) refused or failed a
    /// request. Retried through the queue's backoff.
    #[error("transient API error: {0}")]
    TransientApi(#[from] kube::Error),

    /// A user configured something this controller cannot express. The
    /// offending resource is skipped; the rest of the config still applies.
    #[error("{namespace}/{name}: {message}")]
    Semantic {
        namespace: String,
        name: String,
        message: String,
    },

    /// A value could not be parsed (annotation, ConfigMap entry, CIDR).
    #[error("invalid {field} {value:?}: {message}")]
    Parse {
        field: String,
        value: String,
        message: String,
    },

    /// Two pieces of configuration contradict each other.
    #[error("{0}")]
    Conflict(String),

    #[error("proxy reload failed: {0}")]
    ProxyReload(String),

    /// Unrecoverable process-start failure (missing POD env, no client).
    #[error("{0}")]
    Bootstrap(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn semantic(namespace: &str, name: &str, message: impl Into<String>) -> Self {
        Error::Semantic {
            namespace: namespace.to_string(),
            name: name.to_string(),
            message: message.into(),
        }
    }

    pub fn parse(field: &str, value: &str, message: impl Into<String>) -> Self {
        Error::Parse {
            field: field.to_string(),
            value: value.to_string(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
