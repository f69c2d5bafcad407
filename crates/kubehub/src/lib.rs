//! Stagehand kubehub – cluster client and the access-review / namespace
//! primitives onboarding relies on.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use k8s_openapi::api::authorization::v1::{ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec};
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Api, Patch, PatchParams, PostParams},
    Client,
};
use stagehand_core::naming::MESH_INJECTION_LABEL;
use stagehand_core::{AccessReview, NamespaceApi};
use tokio::sync::OnceCell;
use tracing::{debug, info};

pub mod labels {
    //! Labels stagehand puts on objects it creates.

    /// `app.kubernetes.io/managed-by` marks namespaces created by stagehand.
    pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
    pub const MANAGED_BY_VALUE: &str = "stagehand";
}

static CLIENT: OnceCell<Client> = OnceCell::const_new();

/// Shared client built from the default kubeconfig / in-cluster config.
pub async fn get_kube_client() -> Result<Client> {
    let client = CLIENT
        .get_or_try_init(|| async { Client::try_default().await.context("building kube client from default config") })
        .await?;
    Ok(client.clone())
}

/// Cluster handle implementing the onboarding collaborator traits.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self { Self { client } }

    pub async fn connect() -> Result<Self> { Ok(Self::new(get_kube_client().await?)) }
}

/// Any verb on any resource of any group, cluster-wide.
fn wildcard_review() -> SelfSubjectAccessReview {
    let ra = ResourceAttributes {
        group: Some("*".to_string()),
        resource: Some("*".to_string()),
        verb: Some("*".to_string()),
        ..Default::default()
    };
    SelfSubjectAccessReview {
        spec: SelfSubjectAccessReviewSpec { resource_attributes: Some(ra), ..Default::default() },
        ..Default::default()
    }
}

fn new_namespace(name: &str) -> Namespace {
    let mut labels = BTreeMap::new();
    labels.insert(labels::MANAGED_BY.to_string(), labels::MANAGED_BY_VALUE.to_string());
    Namespace {
        metadata: ObjectMeta { name: Some(name.to_string()), labels: Some(labels), ..Default::default() },
        ..Default::default()
    }
}

fn has_mesh_injection(ns: &Namespace) -> bool {
    let (key, value) = MESH_INJECTION_LABEL;
    ns.metadata.labels.as_ref().and_then(|l| l.get(key)).map(|v| v == value).unwrap_or(false)
}

fn mesh_injection_patch() -> serde_json::Value {
    let (key, value) = MESH_INJECTION_LABEL;
    serde_json::json!({ "metadata": { "labels": { key: value } } })
}

#[async_trait::async_trait]
impl AccessReview for KubeCluster {
    async fn can_manage_namespaces(&self) -> Result<bool> {
        let api: Api<SelfSubjectAccessReview> = Api::all(self.client.clone());
        let created = api.create(&PostParams::default(), &wildcard_review()).await.context("creating SelfSubjectAccessReview")?;
        let allowed = created.status.map(|s| s.allowed).unwrap_or(false);
        debug!(allowed, "self review for namespace management");
        Ok(allowed)
    }
}

#[async_trait::async_trait]
impl NamespaceApi for KubeCluster {
    async fn ensure_namespace(&self, name: &str) -> Result<bool> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        if api.get_opt(name).await.with_context(|| format!("getting namespace {}", name))?.is_some() {
            return Ok(false);
        }
        match api.create(&PostParams::default(), &new_namespace(name)).await {
            Ok(_) => {
                info!(namespace = %name, "namespace created");
                Ok(true)
            }
            // Lost a creation race; the namespace exists now.
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(anyhow!("creating namespace {}: {}", name, e)),
        }
    }

    async fn label_for_mesh_injection(&self, name: &str) -> Result<bool> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = api
            .get_opt(name)
            .await
            .with_context(|| format!("getting namespace {}", name))?
            .ok_or_else(|| anyhow!("namespace {} not found", name))?;
        if has_mesh_injection(&ns) {
            return Ok(false);
        }
        api.patch(name, &PatchParams::default(), &Patch::Merge(&mesh_injection_patch()))
            .await
            .with_context(|| format!("labelling namespace {} for mesh injection", name))?;
        info!(namespace = %name, "mesh injection enabled");
        Ok(true)
    }
}
