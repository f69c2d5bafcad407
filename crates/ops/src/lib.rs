//! Stagehand ops: the capability gate and namespace management used by
//! chart-based onboarding. Cluster calls go through the collaborator traits;
//! this layer adds logging, metrics and the mapping into `OnboardError`.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use metrics::{counter, histogram};
use stagehand_core::error::chain;
use stagehand_core::naming::namespace_for;
use stagehand_core::{AccessReview, NamespaceApi, OnboardError, OnboardResult, Stage};
use stagehand_kubehub::KubeCluster;
use tracing::{error, info, warn};

/// Asks the cluster whether stagehand may manage namespaces cluster-wide.
#[derive(Clone)]
pub struct CapabilityChecker {
    review: Arc<dyn AccessReview>,
}

impl CapabilityChecker {
    pub fn new(review: Arc<dyn AccessReview>) -> Self { Self { review } }

    /// One self review, no retries. Transport failures are distinct from a
    /// "not allowed" answer.
    pub async fn has_admin_rights(&self) -> OnboardResult<bool> {
        let started = Instant::now();
        match self.review.can_manage_namespaces().await {
            Ok(allowed) => {
                info!(allowed, took_ms = %started.elapsed().as_millis(), "capability check");
                Ok(allowed)
            }
            Err(e) => {
                error!(error = %chain(&e), "capability check failed");
                Err(OnboardError::CapabilityCheck(chain(&e)))
            }
        }
    }

    pub async fn require_admin_rights(&self) -> OnboardResult<()> {
        if self.has_admin_rights().await? {
            Ok(())
        } else {
            warn!("insufficient rights to manage namespaces");
            Err(OnboardError::InsufficientRights)
        }
    }
}

/// Creates stage namespaces and switches on mesh sidecar injection.
#[derive(Clone)]
pub struct NamespaceManager {
    api: Arc<dyn NamespaceApi>,
}

impl NamespaceManager {
    pub fn new(api: Arc<dyn NamespaceApi>) -> Self { Self { api } }

    /// Ensure `<project>-<stage>` exists for every stage, in order. The first
    /// failure stops the loop; namespaces created before it stay. Returns how
    /// many namespaces this call created.
    pub async fn init_namespaces(&self, project: &str, stages: &[Stage]) -> OnboardResult<usize> {
        let started = Instant::now();
        let mut created = 0usize;
        for stage in stages {
            let namespace = namespace_for(project, &stage.name);
            match self.api.ensure_namespace(&namespace).await {
                Ok(true) => {
                    counter!("namespace_created_total", 1u64);
                    created += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    error!(%namespace, error = %chain(&e), "namespace init failed");
                    return Err(OnboardError::NamespaceInit { namespace, message: chain(&e) });
                }
            }
        }
        info!(%project, stages = stages.len(), created, took_ms = %started.elapsed().as_millis(), "namespaces ready");
        Ok(created)
    }

    /// Label the stage namespace for sidecar injection. Re-applying is a no-op.
    pub async fn inject_istio(&self, project: &str, stage: &str) -> OnboardResult<bool> {
        let namespace = namespace_for(project, stage);
        match self.api.label_for_mesh_injection(&namespace).await {
            Ok(changed) => {
                if changed {
                    counter!("mesh_injection_total", 1u64);
                }
                info!(%namespace, changed, "mesh injection ensured");
                Ok(changed)
            }
            Err(e) => {
                error!(%namespace, error = %chain(&e), "mesh injection failed");
                Err(OnboardError::MeshInjection { namespace, message: chain(&e) })
            }
        }
    }
}

/// Both ops over one shared cluster connection.
pub async fn connect() -> Result<(CapabilityChecker, NamespaceManager)> {
    let started = Instant::now();
    let cluster = Arc::new(KubeCluster::connect().await?);
    histogram!("kube_connect_ms", started.elapsed().as_secs_f64() * 1000.0);
    Ok((CapabilityChecker::new(cluster.clone()), NamespaceManager::new(cluster)))
}
