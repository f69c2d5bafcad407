//! Stagehand onboarding API (in-process).
//!
//! Frontends depend on [`OnboardApi`]; [`Onboarder`] is the in-process
//! implementation wiring the validator, the capability gate, namespace
//! management, chart generation and the umbrella chart manager together.

#![forbid(unsafe_code)]

pub mod completion;
pub mod onboard;
pub mod validate;

pub use completion::{ChannelCompletionSink, Completion, CompletionSink, LogCompletionSink};
pub use onboard::{Collaborators, ManagedChartMode, OnboardState, OnboardSummary, Onboarder, OnboarderOptions, StageSummary};
pub use stagehand_chart::is_generated_chart_empty;
pub use validate::{check_and_set_service_name, validate_request};

use stagehand_chart::Chart;
use stagehand_core::{DeploymentStrategy, OnboardResult, OnboardingRequest};

/// Produced entry points.
#[async_trait::async_trait]
pub trait OnboardApi: Send + Sync {
    /// Onboard a service into every stage of its project.
    async fn onboard(&self, request: OnboardingRequest) -> OnboardResult<OnboardSummary>;

    /// Regenerate and store the managed chart of an already onboarded
    /// service from its rendered manifest.
    async fn onboard_generated_service(
        &self,
        manifest: &str,
        project: &str,
        stage: &str,
        service: &str,
        strategy: DeploymentStrategy,
    ) -> OnboardResult<Chart>;
}

#[async_trait::async_trait]
impl OnboardApi for Onboarder {
    async fn onboard(&self, request: OnboardingRequest) -> OnboardResult<OnboardSummary> { Onboarder::onboard(self, request).await }

    async fn onboard_generated_service(
        &self,
        manifest: &str,
        project: &str,
        stage: &str,
        service: &str,
        strategy: DeploymentStrategy,
    ) -> OnboardResult<Chart> {
        Onboarder::onboard_generated_service(self, manifest, project, stage, service, strategy).await
    }
}
