//! Stagehand core types: onboarding requests, stages, resource keys and the
//! collaborator traits the orchestrator talks to.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

pub mod error;
pub mod naming;
pub mod strategy;

pub use error::{ErrorClass, OnboardError, OnboardResult};
pub use strategy::{resolve, DeploymentStrategy, StrategyMap, StrategyResolutionPolicy, WILDCARD};

/// A named environment slot of a project. `position` follows the project's
/// stage topology; callers keep the listed order and never re-sort.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Stage {
    pub name: String,
    pub position: u32,
}

impl Stage {
    pub fn new(name: impl Into<String>, position: u32) -> Self {
        Self { name: name.into(), position }
    }
}

/// One request to onboard a service into every stage of a project.
#[derive(Debug, Clone, Default)]
pub struct OnboardingRequest {
    pub project: String,
    /// May be empty until the validator resolves it from the chart.
    pub service: String,
    /// Raw chart archive bytes (gzip'd tar).
    pub helm_chart: Option<Vec<u8>>,
    pub deployment_strategies: StrategyMap,
}

impl OnboardingRequest {
    pub fn new(project: impl Into<String>, service: impl Into<String>) -> Self {
        Self { project: project.into(), service: service.into(), ..Default::default() }
    }

    pub fn with_chart(mut self, chart: Vec<u8>) -> Self {
        self.helm_chart = Some(chart);
        self
    }

    pub fn with_strategy(mut self, key: impl Into<String>, strategy: DeploymentStrategy) -> Self {
        self.deployment_strategies.insert(key, strategy);
        self
    }

    /// An empty archive counts as no chart.
    pub fn has_chart(&self) -> bool {
        self.helm_chart.as_ref().map_or(false, |c| !c.is_empty())
    }
}

// ---- config storage ----

/// Address of a stored resource. Stage-level resources carry no service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub project: String,
    pub stage: String,
    pub service: Option<String>,
    pub uri: String,
}

impl ResourceKey {
    pub fn stage(project: &str, stage: &str, uri: &str) -> Self {
        Self { project: project.to_string(), stage: stage.to_string(), service: None, uri: uri.to_string() }
    }

    pub fn service(project: &str, stage: &str, service: &str, uri: &str) -> Self {
        Self {
            project: project.to_string(),
            stage: stage.to_string(),
            service: Some(service.to_string()),
            uri: uri.to_string(),
        }
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.service {
            Some(svc) => write!(f, "{}/{}/{}/{}", self.project, self.stage, svc, self.uri),
            None => write!(f, "{}/{}/{}", self.project, self.stage, self.uri),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resource {
    pub content: Vec<u8>,
    /// Monotonic per key, starting at 1 on first write.
    pub revision: u64,
}

/// Write guard evaluated atomically by the store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Precondition {
    /// Last write wins.
    Any,
    /// Only create; fail if the key exists.
    Absent,
    /// Only replace the given revision.
    Revision(u64),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("revision conflict on {key}: expected {expected:?}, found {found:?}")]
    Conflict { key: String, expected: Precondition, found: Option<u64> },
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool { matches!(self, StoreError::Conflict { .. }) }
}

// ---- collaborators ----

/// Project stage topology and per-stage service registry.
#[async_trait::async_trait]
pub trait StageCatalogue: Send + Sync {
    /// Stages in topology order. Unknown projects are an error; a known
    /// project without stages yields an empty list.
    async fn list_stages(&self, project: &str) -> anyhow::Result<Vec<Stage>>;

    /// Register a service in a stage. Registering twice is a no-op.
    async fn create_service_in_stage(&self, project: &str, stage: &str, service: &str) -> anyhow::Result<()>;
}

/// Versioned blob storage used for charts and umbrella manifests.
#[async_trait::async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get_resource(&self, key: &ResourceKey) -> anyhow::Result<Option<Resource>>;

    /// Write `content` if `precondition` holds; returns the new revision.
    async fn put_resource(&self, key: &ResourceKey, content: &[u8], precondition: Precondition) -> Result<u64, StoreError>;
}

/// Pre-existing per-stage strategy definitions (shipyard).
#[async_trait::async_trait]
pub trait StrategySource: Send + Sync {
    async fn strategy_for(&self, project: &str, stage: &str) -> anyhow::Result<Option<DeploymentStrategy>>;
}

/// Cluster access-control self review.
#[async_trait::async_trait]
pub trait AccessReview: Send + Sync {
    async fn can_manage_namespaces(&self) -> anyhow::Result<bool>;
}

/// Cluster namespace primitives.
#[async_trait::async_trait]
pub trait NamespaceApi: Send + Sync {
    /// Create the namespace if absent. Returns true when it was created.
    async fn ensure_namespace(&self, name: &str) -> anyhow::Result<bool>;

    /// Enable sidecar injection. Returns true when the label changed.
    async fn label_for_mesh_injection(&self, name: &str) -> anyhow::Result<bool>;
}

pub mod prelude {
    pub use super::{
        AccessReview, DeploymentStrategy, NamespaceApi, OnboardError, OnboardResult, OnboardingRequest, Precondition,
        Resource, ResourceKey, ResourceStore, Stage, StageCatalogue, StoreError, StrategyMap, StrategySource,
    };
}
