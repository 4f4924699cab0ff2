use std::collections::BTreeMap;

/// Runtime information about the pod running this controller.
///
/// The labels are matched against Service selectors to discover which
/// Services front this controller, which in turn yields the addresses
/// published into Ingress statuses.
#[derive(Debug, Clone, Default)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
}
