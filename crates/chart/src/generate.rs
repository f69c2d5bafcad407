//! Managed chart generation.
//!
//! Duplicate charts run two tracks side by side: the user's own workload is
//! the canary track, the generated `-primary` copy is the primary track, and
//! a VirtualService initially sends all traffic to primary. Mesh charts keep
//! the single workload and wrap it in a weighted route.

use anyhow::{anyhow, bail, Result};
use metrics::counter;
use serde_json::{json, Map, Value as Json};
use stagehand_core::naming::{chart_name, namespace_for};
use stagehand_core::DeploymentStrategy;
use tracing::debug;

use crate::mesh::IstioMesh;
use crate::render::parse_manifest;
use crate::Chart;

pub const PRIMARY_SUFFIX: &str = "-primary";
pub const CANARY_SUFFIX: &str = "-canary";
pub const GENERATED_CHART_VERSION: &str = "0.1.0";

/// Workload kinds that own pods through `spec.template` and get a primary copy.
const POD_CONTROLLERS: [&str; 3] = ["Deployment", "StatefulSet", "DaemonSet"];

fn managed_chart(service: &str, strategy: DeploymentStrategy) -> Chart {
    let mut chart = Chart::new(chart_name(service, true), GENERATED_CHART_VERSION);
    chart.metadata.description = Some(format!("Managed chart of {} ({} deployment)", service, strategy));
    chart.values = json!({ "strategy": strategy.as_str() });
    chart
}

/// Placeholder managed chart with reserved track slots and no routing yet.
pub fn generate_empty_chart(service: &str, strategy: DeploymentStrategy) -> Chart {
    let mut chart = managed_chart(service, strategy);
    let tracks: &[&str] = match strategy {
        DeploymentStrategy::Duplicate => &["primary", "canary"],
        DeploymentStrategy::Direct => &["primary"],
    };
    chart.values["tracks"] = json!(tracks);
    counter!("chart_generated_total", 1u64, "strategy" => "empty");
    chart
}

/// A managed chart without templates has nothing routed yet.
pub fn is_generated_chart_empty(chart: &Chart) -> bool { chart.templates.is_empty() }

/// Dispatch on the strategy of the stage.
pub fn generate_managed_chart(
    strategy: DeploymentStrategy,
    manifest: &str,
    project: &str,
    stage: &str,
    service: &str,
    mesh: &IstioMesh,
) -> Result<Chart> {
    match strategy {
        DeploymentStrategy::Duplicate => generate_duplicate_managed_chart(manifest, project, stage, service, mesh),
        DeploymentStrategy::Direct => generate_mesh_chart(manifest, project, stage, service, mesh),
    }
}

/// Two-track chart. Only meaningful for [`DeploymentStrategy::Duplicate`].
pub fn generate_duplicate_managed_chart(
    manifest: &str,
    project: &str,
    stage: &str,
    service: &str,
    mesh: &IstioMesh,
) -> Result<Chart> {
    let objects = parse_manifest(manifest)?;
    let ns = namespace_for(project, stage);
    let mut chart = managed_chart(service, DeploymentStrategy::Duplicate);

    // Pod labels of every primary copy, checked against the primary selectors below.
    let mut primary_pods: Vec<Map<String, Json>> = Vec::new();
    for obj in &objects {
        let Some(kind) = kind_of(obj).filter(|k| POD_CONTROLLERS.contains(k)) else { continue };
        let primary = format!("{}{}", name_of(obj)?, PRIMARY_SUFFIX);
        let copy = primary_workload(obj, &primary);
        if let Some(Json::Object(labels)) = copy.pointer("/spec/template/metadata/labels") {
            primary_pods.push(labels.clone());
        }
        chart.add_object(format!("{}-{}.yaml", primary, kind.to_ascii_lowercase()), &copy)?;
    }
    if primary_pods.is_empty() {
        bail!("manifest of {} contains no workload to duplicate", service);
    }

    let mut routed = 0usize;
    for obj in objects.iter().filter(|o| kind_of(o) == Some("Service")) {
        let name = name_of(obj)?;
        let canary = format!("{}{}", name, CANARY_SUFFIX);
        let primary = format!("{}{}", name, PRIMARY_SUFFIX);
        let canary_host = IstioMesh::cluster_host(&canary, &ns);
        let primary_host = IstioMesh::cluster_host(&primary, &ns);

        let primary_svc = track_service(obj, &primary, Some(PRIMARY_SUFFIX));
        match primary_svc.pointer("/spec/selector") {
            Some(Json::Object(sel)) if !sel.is_empty() && primary_pods.iter().any(|pods| selects(sel, pods)) => {}
            _ => bail!("service {} selects no duplicated workload", name),
        }

        chart.add_object(format!("{}-service.yaml", canary), &track_service(obj, &canary, None))?;
        chart.add_object(format!("{}-service.yaml", primary), &primary_svc)?;
        chart.add_object(format!("{}-destinationrule.yaml", canary), &mesh.destination_rule(&canary, &ns, &canary_host))?;
        chart.add_object(format!("{}-destinationrule.yaml", primary), &mesh.destination_rule(&primary, &ns, &primary_host))?;
        let hosts = [mesh.public_host(name, &ns), name.to_string()];
        let vs = mesh.virtual_service(name, &ns, &hosts, &[(primary_host, 100), (canary_host, 0)]);
        chart.add_object(format!("{}-virtualservice.yaml", name), &vs)?;
        routed += 1;
    }
    if routed == 0 {
        bail!("manifest of {} contains no Service to route", service);
    }
    counter!("chart_generated_total", 1u64, "strategy" => "duplicate");
    debug!(%service, %stage, templates = chart.templates.len(), "duplicate chart generated");
    Ok(chart)
}

/// Weighted routing around the single workload.
pub fn generate_mesh_chart(manifest: &str, project: &str, stage: &str, service: &str, mesh: &IstioMesh) -> Result<Chart> {
    let objects = parse_manifest(manifest)?;
    let ns = namespace_for(project, stage);
    let mut chart = managed_chart(service, DeploymentStrategy::Direct);
    let mut routed = 0usize;

    for obj in objects.iter().filter(|o| kind_of(o) == Some("Service")) {
        let name = name_of(obj)?;
        let host = IstioMesh::cluster_host(name, &ns);
        chart.add_object(format!("{}-destinationrule.yaml", name), &mesh.destination_rule(name, &ns, &host))?;
        let hosts = [mesh.public_host(name, &ns), name.to_string()];
        chart.add_object(format!("{}-virtualservice.yaml", name), &mesh.virtual_service(name, &ns, &hosts, &[(host, 100)]))?;
        routed += 1;
    }
    if routed == 0 {
        bail!("manifest of {} contains no Service to route", service);
    }
    counter!("chart_generated_total", 1u64, "strategy" => "direct");
    debug!(%service, %stage, templates = chart.templates.len(), "mesh chart generated");
    Ok(chart)
}

fn kind_of(obj: &Json) -> Option<&str> { obj.get("kind").and_then(|k| k.as_str()) }

fn name_of(obj: &Json) -> Result<&str> {
    obj.get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(|n| n.as_str())
        .ok_or_else(|| anyhow!("{} without metadata.name", kind_of(obj).unwrap_or("object")))
}

/// Metadata of a generated copy: new name, user labels and annotations.
fn fresh_metadata(obj: &Json, name: &str) -> Json {
    let mut meta = Map::new();
    meta.insert("name".into(), Json::String(name.to_string()));
    for key in ["labels", "annotations"] {
        if let Some(v) = obj.get("metadata").and_then(|m| m.get(key)) {
            meta.insert(key.into(), v.clone());
        }
    }
    Json::Object(meta)
}

fn suffix_values(labels: Option<&mut Json>, suffix: &str) {
    if let Some(Json::Object(map)) = labels {
        for v in map.values_mut() {
            if let Json::String(s) = v {
                s.push_str(suffix);
            }
        }
    }
}

fn track_service(obj: &Json, name: &str, selector_suffix: Option<&str>) -> Json {
    let mut svc = obj.clone();
    svc["metadata"] = fresh_metadata(obj, name);
    if let Some(Json::Object(spec)) = svc.get_mut("spec") {
        spec.remove("clusterIP");
        spec.remove("clusterIPs");
        if let Some(suffix) = selector_suffix {
            suffix_values(spec.get_mut("selector"), suffix);
        }
    }
    if let Some(o) = svc.as_object_mut() {
        o.remove("status");
    }
    svc
}

fn selects(selector: &Map<String, Json>, labels: &Map<String, Json>) -> bool {
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

fn primary_workload(obj: &Json, name: &str) -> Json {
    let mut deploy = obj.clone();
    deploy["metadata"] = fresh_metadata(obj, name);
    if let Some(spec) = deploy.get_mut("spec") {
        if let Some(Json::String(svc)) = spec.get_mut("serviceName") {
            svc.push_str(PRIMARY_SUFFIX);
        }
        suffix_values(spec.get_mut("selector").and_then(|s| s.get_mut("matchLabels")), PRIMARY_SUFFIX);
        suffix_values(
            spec.get_mut("template").and_then(|t| t.get_mut("metadata")).and_then(|m| m.get_mut("labels")),
            PRIMARY_SUFFIX,
        );
    }
    if let Some(o) = deploy.as_object_mut() {
        o.remove("status");
    }
    deploy
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"---
apiVersion: v1
kind: Service
metadata:
  name: cart
  namespace: default
  labels:
    app: cart
spec:
  clusterIP: 10.0.0.7
  selector:
    app: cart
  ports:
  - port: 80
    targetPort: 8080
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: cart
  uid: abc
spec:
  replicas: 1
  selector:
    matchLabels:
      app: cart
  template:
    metadata:
      labels:
        app: cart
    spec:
      containers:
      - name: cart
        image: shop/cart:1.0
"#;

    fn objects(chart: &Chart) -> Vec<Json> {
        chart.templates.iter().flat_map(|t| parse_manifest(&t.data).unwrap()).collect()
    }

    fn find<'a>(objs: &'a [Json], kind: &str, name: &str) -> &'a Json {
        objs.iter().find(|o| o["kind"] == kind && o["metadata"]["name"] == name).unwrap_or_else(|| panic!("{kind}/{name} missing"))
    }

    #[test]
    fn duplicate_chart_has_two_tracks_defaulting_to_primary() {
        let chart = generate_duplicate_managed_chart(MANIFEST, "shop", "staging", "cart", &IstioMesh::default()).unwrap();
        assert_eq!(chart.name(), "cart-generated");
        let objs = objects(&chart);

        let primary = find(&objs, "Service", "cart-primary");
        let canary = find(&objs, "Service", "cart-canary");
        assert_eq!(primary["spec"]["selector"]["app"], "cart-primary");
        assert_eq!(canary["spec"]["selector"]["app"], "cart");
        assert!(primary["spec"].get("clusterIP").is_none());
        assert!(primary["metadata"].get("namespace").is_none());

        find(&objs, "DestinationRule", "cart-primary");
        find(&objs, "DestinationRule", "cart-canary");

        let vs = find(&objs, "VirtualService", "cart");
        assert_eq!(vs["spec"]["hosts"], json!(["cart.shop-staging.svc.cluster.local", "cart"]));
        let route = &vs["spec"]["http"][0]["route"];
        assert_eq!(route[0]["destination"]["host"], "cart-primary.shop-staging.svc.cluster.local");
        assert_eq!(route[0]["weight"], 100);
        assert_eq!(route[1]["destination"]["host"], "cart-canary.shop-staging.svc.cluster.local");
        assert_eq!(route[1]["weight"], 0);

        let deploy = find(&objs, "Deployment", "cart-primary");
        assert_eq!(deploy["spec"]["selector"]["matchLabels"]["app"], "cart-primary");
        assert_eq!(deploy["spec"]["template"]["metadata"]["labels"]["app"], "cart-primary");
        assert!(deploy["metadata"].get("uid").is_none());
        assert_eq!(deploy["spec"]["template"]["spec"]["containers"][0]["image"], "shop/cart:1.0");
    }

    #[test]
    fn mesh_chart_routes_everything_to_the_single_workload() {
        let chart = generate_mesh_chart(MANIFEST, "shop", "dev", "cart", &IstioMesh::default()).unwrap();
        let objs = objects(&chart);
        assert!(objs.iter().all(|o| o["kind"] != "Deployment"));
        assert_eq!(find(&objs, "DestinationRule", "cart")["spec"]["host"], "cart.shop-dev.svc.cluster.local");

        let route = find(&objs, "VirtualService", "cart")["spec"]["http"][0]["route"].as_array().unwrap().clone();
        assert_eq!(route.len(), 1);
        let total: u64 = route.iter().map(|r| r["weight"].as_u64().unwrap()).sum();
        assert_eq!(total, 100);
        assert_eq!(route[0]["destination"]["host"], "cart.shop-dev.svc.cluster.local");
    }

    #[test]
    fn public_host_follows_mesh_config() {
        let mesh = IstioMesh { hostname_suffix: "10.0.0.1.nip.io".into(), gateway: "edge".into() };
        let chart = generate_mesh_chart(MANIFEST, "shop", "dev", "cart", &mesh).unwrap();
        let vs = find(&objects(&chart), "VirtualService", "cart").clone();
        assert_eq!(vs["spec"]["hosts"][0], "cart.shop-dev.10.0.0.1.nip.io");
        assert_eq!(vs["spec"]["gateways"], json!(["edge", "mesh"]));
    }

    #[test]
    fn manifest_without_service_is_rejected() {
        let manifest = "kind: ConfigMap\nmetadata:\n  name: cfg\n";
        let mesh = IstioMesh::default();
        assert!(generate_mesh_chart(manifest, "shop", "dev", "cart", &mesh).is_err());
        assert!(generate_duplicate_managed_chart(manifest, "shop", "dev", "cart", &mesh).is_err());
    }

    const SERVICE_ONLY: &str = "apiVersion: v1\nkind: Service\nmetadata:\n  name: cart\nspec:\n  selector:\n    app: cart\n";

    #[test]
    fn duplicate_chart_needs_a_primary_workload_behind_every_service() {
        let mesh = IstioMesh::default();
        let err = generate_duplicate_managed_chart(SERVICE_ONLY, "shop", "staging", "cart", &mesh).unwrap_err();
        assert!(err.to_string().contains("no workload to duplicate"), "{err}");

        let job = format!("{SERVICE_ONLY}---\napiVersion: batch/v1\nkind: Job\nmetadata:\n  name: cart\nspec:\n  template:\n    metadata:\n      labels:\n        app: cart\n");
        assert!(generate_duplicate_managed_chart(&job, "shop", "staging", "cart", &mesh).is_err());

        let other = MANIFEST.replace("  selector:\n    app: cart\n  ports", "  selector:\n    app: billing\n  ports");
        let err = generate_duplicate_managed_chart(&other, "shop", "staging", "cart", &mesh).unwrap_err();
        assert!(err.to_string().contains("selects no duplicated workload"), "{err}");
    }

    #[test]
    fn statefulset_gets_a_primary_copy() {
        let manifest = format!(
            "{SERVICE_ONLY}---\napiVersion: apps/v1\nkind: StatefulSet\nmetadata:\n  name: cart\nspec:\n  serviceName: cart\n  selector:\n    matchLabels:\n      app: cart\n  template:\n    metadata:\n      labels:\n        app: cart\n    spec:\n      containers:\n      - name: cart\n        image: shop/cart:1.0\n"
        );
        let chart = generate_duplicate_managed_chart(&manifest, "shop", "staging", "cart", &IstioMesh::default()).unwrap();
        let objs = objects(&chart);
        let sts = find(&objs, "StatefulSet", "cart-primary");
        assert_eq!(sts["spec"]["serviceName"], "cart-primary");
        assert_eq!(sts["spec"]["template"]["metadata"]["labels"]["app"], "cart-primary");
        assert_eq!(find(&objs, "Service", "cart-primary")["spec"]["selector"]["app"], "cart-primary");
        assert!(chart.template("cart-primary-statefulset.yaml").is_some());
    }

    #[test]
    fn empty_chart_reserves_tracks() {
        let dup = generate_empty_chart("cart", DeploymentStrategy::Duplicate);
        assert!(is_generated_chart_empty(&dup));
        assert_eq!(dup.values["tracks"], json!(["primary", "canary"]));
        let direct = generate_empty_chart("cart", DeploymentStrategy::Direct);
        assert_eq!(direct.values["tracks"], json!(["primary"]));
        assert_eq!(direct.values["strategy"], "direct");
        assert_eq!(direct.name(), "cart-generated");
    }

    #[test]
    fn dispatch_follows_strategy() {
        let mesh = IstioMesh::default();
        let dup = generate_managed_chart(DeploymentStrategy::Duplicate, MANIFEST, "shop", "dev", "cart", &mesh).unwrap();
        assert!(dup.template("cart-primary-deployment.yaml").is_some());
        let direct = generate_managed_chart(DeploymentStrategy::Direct, MANIFEST, "shop", "dev", "cart", &mesh).unwrap();
        assert!(direct.template("cart-primary-deployment.yaml").is_none());
        assert!(!is_generated_chart_empty(&direct));
    }
}
