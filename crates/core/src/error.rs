//! Onboarding error taxonomy, suitable for transport back to the caller.

use serde::{Deserialize, Serialize};

/// Reported when the self review comes back "not allowed".
pub const INSUFFICIENT_RIGHTS_MSG: &str = "Cannot onboard service because stagehand has insufficient RBAC rights.\n\
     Reason: the execution plane for continuous delivery is not installed; \
     install it with cluster-wide namespace management rights and retry.";

#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum OnboardError {
    #[error("invalid service name: {0}")]
    InvalidName(String),
    #[error("chart has to contain exactly one Kubernetes service, but it contains {found}")]
    InvalidChartShape { found: usize },
    #[error("provided service name \"{requested}\" does not match Kubernetes service name \"{chart}\"")]
    NameMismatch { requested: String, chart: String },
    #[error("invalid chart: {0}")]
    InvalidChart(String),
    #[error("capability check failed: {0}")]
    CapabilityCheck(String),
    #[error("{}", INSUFFICIENT_RIGHTS_MSG)]
    InsufficientRights,
    #[error("namespace {namespace}: {message}")]
    NamespaceInit { namespace: String, message: String },
    #[error("mesh injection for namespace {namespace}: {message}")]
    MeshInjection { namespace: String, message: String },
    #[error("generating chart {chart}: {message}")]
    ChartGeneration { chart: String, message: String },
    #[error("packaging chart {chart}: {message}")]
    ChartPackaging { chart: String, message: String },
    #[error("storing chart {chart} in stage {stage}: {message}")]
    ChartStorage { chart: String, stage: String, message: String },
    #[error("umbrella chart of stage {stage}: {message}")]
    UmbrellaChart { stage: String, message: String },
    #[error("stage catalogue: {0}")]
    StageCatalogue(String),
    #[error("cannot onboard service because no stage is available in project {project}")]
    NoStagesAvailable { project: String },
}

pub type OnboardResult<T> = Result<T, OnboardError>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorClass {
    /// Defect in the request; reported verbatim, never retried.
    UserInput,
    /// Boundary failure; re-invoking the onboarding may succeed.
    Infrastructure,
    /// Needs operator action (installation or project setup).
    Fatal,
}

impl OnboardError {
    pub fn class(&self) -> ErrorClass {
        use OnboardError::*;
        match self {
            InvalidName(_) | InvalidChartShape { .. } | NameMismatch { .. } | InvalidChart(_) => ErrorClass::UserInput,
            InsufficientRights | NoStagesAvailable { .. } => ErrorClass::Fatal,
            CapabilityCheck(_)
            | NamespaceInit { .. }
            | MeshInjection { .. }
            | ChartGeneration { .. }
            | ChartPackaging { .. }
            | ChartStorage { .. }
            | UmbrellaChart { .. }
            | StageCatalogue(_) => ErrorClass::Infrastructure,
        }
    }

    pub fn is_retryable(&self) -> bool { self.class() == ErrorClass::Infrastructure }
}

/// Render an error with its whole context chain on one line.
pub fn chain(e: &anyhow::Error) -> String { format!("{:#}", e) }
