//! Istio routing resources for generated charts.

use serde_json::{json, Value as Json};

pub const DEFAULT_HOSTNAME_SUFFIX: &str = "svc.cluster.local";
pub const DEFAULT_GATEWAY: &str = "public-gateway.istio-system";
/// Pseudo-gateway addressing in-mesh traffic.
pub const MESH_GATEWAY: &str = "mesh";
const NETWORKING_API: &str = "networking.istio.io/v1alpha3";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IstioMesh {
    /// Suffix of public hosts: `<service>.<namespace>.<suffix>`.
    pub hostname_suffix: String,
    pub gateway: String,
}

impl Default for IstioMesh {
    fn default() -> Self {
        Self { hostname_suffix: DEFAULT_HOSTNAME_SUFFIX.to_string(), gateway: DEFAULT_GATEWAY.to_string() }
    }
}

impl IstioMesh {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            hostname_suffix: std::env::var("STAGEHAND_INGRESS_HOSTNAME_SUFFIX").ok().filter(|s| !s.is_empty()).unwrap_or(d.hostname_suffix),
            gateway: std::env::var("STAGEHAND_INGRESS_GATEWAY").ok().filter(|s| !s.is_empty()).unwrap_or(d.gateway),
        }
    }

    /// In-cluster FQDN of a service.
    pub fn cluster_host(service: &str, namespace: &str) -> String {
        format!("{}.{}.{}", service, namespace, DEFAULT_HOSTNAME_SUFFIX)
    }

    pub fn public_host(&self, service: &str, namespace: &str) -> String {
        format!("{}.{}.{}", service, namespace, self.hostname_suffix)
    }

    pub fn destination_rule(&self, name: &str, namespace: &str, host: &str) -> Json {
        json!({
            "apiVersion": NETWORKING_API,
            "kind": "DestinationRule",
            "metadata": { "name": name, "namespace": namespace },
            "spec": { "host": host },
        })
    }

    /// One HTTP route splitting traffic across `routes` (host, weight).
    pub fn virtual_service(&self, name: &str, namespace: &str, hosts: &[String], routes: &[(String, u32)]) -> Json {
        let destinations: Vec<Json> =
            routes.iter().map(|(host, weight)| json!({ "destination": { "host": host }, "weight": weight })).collect();
        json!({
            "apiVersion": NETWORKING_API,
            "kind": "VirtualService",
            "metadata": { "name": name, "namespace": namespace },
            "spec": {
                "hosts": hosts,
                "gateways": [self.gateway, MESH_GATEWAY],
                "http": [ { "route": destinations } ],
            },
        })
    }
}
