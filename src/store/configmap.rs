use std::time::Duration;

use k8s_openapi::api::core::v1::ConfigMap;
use tracing::warn;

use crate::error::{Error, Result};

/// Global options set through the controller's ConfigMap.
///
/// Keys are decoded case-sensitively by an explicit per-key parser; unknown
/// keys are logged and skipped so a typo never takes the controller down.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigMapOptions {
    pub debug: bool,
    pub acme_ca: String,
    pub acme_eab_key_id: String,
    pub acme_eab_mac_key: String,
    pub email: String,
    pub experimental_smart_sort: bool,
    pub proxy_protocol: bool,
    pub metrics: bool,
    pub on_demand_tls: bool,
    pub on_demand_rate_limit_interval: Option<Duration>,
    pub on_demand_rate_limit_burst: Option<u32>,
    pub on_demand_ask: String,
    pub ocsp_check_interval: Option<Duration>,
}

/// Parses a Go-style duration string ("30s", "1h5m", "250ms").
pub fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value).map_err(|e| Error::parse(field, value, e.to_string()))
}

fn parse_bool(field: &str, value: &str) -> Result<bool> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" | "" => Ok(false),
        other => Err(Error::parse(field, other, "expected a boolean")),
    }
}

fn parse_u32(field: &str, value: &str) -> Result<u32> {
    value
        .parse::<u32>()
        .map_err(|e| Error::parse(field, value, e.to_string()))
}

/// Decodes the controller ConfigMap into [`ConfigMapOptions`].
///
/// An unparseable value fails the whole parse; the previous options stay in
/// effect and the queue retries the action.
pub fn parse_config_map(cm: &ConfigMap) -> Result<ConfigMapOptions> {
    let mut opts = ConfigMapOptions::default();
    let Some(data) = cm.data.as_ref() else {
        return Ok(opts);
    };

    for (key, value) in data {
        match key.as_str() {
            "debug" => opts.debug = parse_bool(key, value)?,
            "acmeCA" => opts.acme_ca = value.clone(),
            "acmeEABKeyId" => opts.acme_eab_key_id = value.clone(),
            "acmeEABMacKey" => opts.acme_eab_mac_key = value.clone(),
            "email" => opts.email = value.clone(),
            "experimentalSmartSort" => opts.experimental_smart_sort = parse_bool(key, value)?,
            "proxyProtocol" => opts.proxy_protocol = parse_bool(key, value)?,
            "metrics" => opts.metrics = parse_bool(key, value)?,
            "onDemandTLS" => opts.on_demand_tls = parse_bool(key, value)?,
            "onDemandRateLimitInterval" => {
                opts.on_demand_rate_limit_interval = Some(parse_duration(key, value)?)
            }
            "onDemandRateLimitBurst" => {
                opts.on_demand_rate_limit_burst = Some(parse_u32(key, value)?)
            }
            "onDemandAsk" => opts.on_demand_ask = value.clone(),
            "ocspCheckInterval" => opts.ocsp_check_interval = Some(parse_duration(key, value)?),
            other => {
                warn!(key = other, "ignoring unknown key in controller ConfigMap");
            }
        }
    }

    Ok(opts)
}
