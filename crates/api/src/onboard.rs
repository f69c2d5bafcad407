//! The onboarding orchestrator.

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use stagehand_chart::{generate_empty_chart, generate_managed_chart, Chart, ChartTooling, IstioMesh, RenderedChart};
use stagehand_core::error::chain;
use stagehand_core::naming::{chart_name, chart_uri};
use stagehand_core::strategy::resolve_all;
use stagehand_core::{
    DeploymentStrategy, OnboardError, OnboardResult, OnboardingRequest, Precondition, ResourceKey, ResourceStore, Stage,
    StageCatalogue, StrategyResolutionPolicy, StrategySource,
};
use stagehand_ops::{CapabilityChecker, NamespaceManager};
use stagehand_umbrella::UmbrellaChartManager;
use tracing::{debug, error, info, warn};

use crate::completion::{CompletionGuard, CompletionSink};
use crate::validate::validate_request;

/// What onboarding stores as the managed chart of a stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManagedChartMode {
    /// Generate the strategy-specific chart from the rendered user chart.
    #[default]
    Generate,
    /// Store an empty placeholder; generation happens later through
    /// [`Onboarder::onboard_generated_service`].
    Deferred,
}

#[derive(Debug, Clone, Default)]
pub struct OnboarderOptions {
    pub strategy_policy: StrategyResolutionPolicy,
    pub managed_chart_mode: ManagedChartMode,
    pub mesh: IstioMesh,
}

/// Everything the orchestrator talks to.
pub struct Collaborators {
    pub catalogue: Arc<dyn StageCatalogue>,
    pub store: Arc<dyn ResourceStore>,
    /// Shadow strategy definitions, consulted under `ShadowFallback`.
    pub strategies: Option<Arc<dyn StrategySource>>,
    pub capability: CapabilityChecker,
    pub namespaces: NamespaceManager,
    pub umbrella: Arc<UmbrellaChartManager>,
    pub tooling: Arc<dyn ChartTooling>,
    pub completion: Arc<dyn CompletionSink>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum OnboardState {
    Validating,
    CheckingCapability,
    InitializingNamespaces,
    EnsuringUmbrellaRoot,
    OnboardingStage { index: usize, stage: String },
    Done,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSummary {
    pub stage: String,
    pub strategy: DeploymentStrategy,
    /// Charts stored for the service in this stage.
    pub charts: Vec<String>,
    pub mesh_injected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnboardSummary {
    pub project: String,
    pub service: String,
    pub stages: Vec<StageSummary>,
    pub trail: Vec<OnboardState>,
}

pub struct Onboarder {
    collab: Collaborators,
    options: OnboarderOptions,
}

impl Onboarder {
    pub fn new(collab: Collaborators, options: OnboarderOptions) -> Self { Self { collab, options } }

    pub fn options(&self) -> &OnboarderOptions { &self.options }

    /// Onboard a service into every stage of its project, in stage order.
    /// The first failing step aborts the request; nothing is rolled back and
    /// re-running the same request is safe.
    pub async fn onboard(&self, mut request: OnboardingRequest) -> OnboardResult<OnboardSummary> {
        let started = Instant::now();
        counter!("onboard_attempts", 1u64);
        let mut guard = CompletionGuard::new(self.collab.completion.clone(), &request.project, &request.service);
        let mut trail = Vec::new();
        info!(project = %request.project, service = %request.service, chart = request.has_chart(), "onboarding start");

        let result = self.run(&mut request, &mut trail).await;
        guard.set_service(&request.service);
        histogram!("onboard_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
        match result {
            Ok(stages) => {
                trail.push(OnboardState::Done);
                guard.succeed();
                counter!("onboard_ok", 1u64);
                info!(project = %request.project, service = %request.service, stages = stages.len(), took_ms = %started.elapsed().as_millis(), "onboarding ok");
                Ok(OnboardSummary { project: request.project, service: request.service, stages, trail })
            }
            Err(e) => {
                trail.push(OnboardState::Aborted);
                counter!("onboard_err", 1u64, "class" => format!("{:?}", e.class()));
                error!(project = %request.project, service = %request.service, error = %e, trail = ?trail, took_ms = %started.elapsed().as_millis(), "onboarding aborted");
                Err(e)
            }
        }
    }

    async fn run(&self, request: &mut OnboardingRequest, trail: &mut Vec<OnboardState>) -> OnboardResult<Vec<StageSummary>> {
        trail.push(OnboardState::Validating);
        let rendered = validate_request(request, self.collab.tooling.as_ref())?;
        let project = request.project.clone();
        let service = request.service.clone();

        let stages = self.collab.catalogue.list_stages(&project).await.map_err(|e| {
            error!(%project, error = %chain(&e), "listing stages failed");
            OnboardError::StageCatalogue(chain(&e))
        })?;
        if stages.is_empty() {
            return Err(OnboardError::NoStagesAvailable { project });
        }
        let strategies = resolve_all(
            &project,
            &stages,
            &request.deployment_strategies,
            self.options.strategy_policy,
            self.collab.strategies.as_deref(),
        )
        .await
        .map_err(|e| OnboardError::StageCatalogue(chain(&e)))?;
        debug!(%project, ?strategies, "strategies resolved");

        let chart = match (&rendered, request.helm_chart.as_deref()) {
            (Some(r), Some(bytes)) => Some((r, bytes)),
            _ => None,
        };
        if chart.is_some() {
            trail.push(OnboardState::CheckingCapability);
            self.collab.capability.require_admin_rights().await?;
            trail.push(OnboardState::InitializingNamespaces);
            self.collab.namespaces.init_namespaces(&project, &stages).await?;
            trail.push(OnboardState::EnsuringUmbrellaRoot);
            self.ensure_umbrella_root(&project, &stages).await?;
        }

        let mut summaries = Vec::with_capacity(stages.len());
        for (index, stage) in stages.iter().enumerate() {
            trail.push(OnboardState::OnboardingStage { index, stage: stage.name.clone() });
            let strategy = strategies.get(&stage.name).copied().unwrap_or_default();
            summaries.push(self.onboard_stage(&project, &service, stage, strategy, chart).await?);
        }
        Ok(summaries)
    }

    async fn ensure_umbrella_root(&self, project: &str, stages: &[Stage]) -> OnboardResult<()> {
        let umbrella = &self.collab.umbrella;
        let all = umbrella.is_umbrella_chart_available_in_all_stages(project, stages).await.map_err(|e| umbrella_err("*", e))?;
        if !all {
            let seeded = umbrella.init_umbrella_chart(project, stages).await.map_err(|e| umbrella_err("*", e))?;
            info!(%project, seeded, "umbrella charts ensured");
        }
        Ok(())
    }

    async fn onboard_stage(
        &self,
        project: &str,
        service: &str,
        stage: &Stage,
        strategy: DeploymentStrategy,
        chart: Option<(&RenderedChart, &[u8])>,
    ) -> OnboardResult<StageSummary> {
        let started = Instant::now();
        self.collab.catalogue.create_service_in_stage(project, &stage.name, service).await.map_err(|e| {
            error!(%project, stage = %stage.name, %service, error = %chain(&e), "creating service failed");
            OnboardError::StageCatalogue(format!("creating service {} in stage {}: {}", service, stage.name, chain(&e)))
        })?;

        let mut summary = StageSummary { stage: stage.name.clone(), strategy, charts: Vec::new(), mesh_injected: false };
        let Some((rendered, bytes)) = chart else {
            info!(%project, stage = %stage.name, %service, "service registered without chart");
            return Ok(summary);
        };

        let user_chart = chart_name(service, false);
        self.store_chart(project, &stage.name, service, &user_chart, bytes).await?;
        self.add_to_umbrella(project, &stage.name, &user_chart).await?;

        let managed = match self.options.managed_chart_mode {
            ManagedChartMode::Generate => self.generate(strategy, &rendered.manifest, project, &stage.name, service)?,
            ManagedChartMode::Deferred => generate_empty_chart(service, strategy),
        };
        let packaged = self.package(&managed)?;
        self.store_chart(project, &stage.name, service, managed.name(), &packaged).await?;
        self.add_to_umbrella(project, &stage.name, managed.name()).await?;
        summary.charts = vec![user_chart, managed.name().to_string()];

        if strategy == DeploymentStrategy::Duplicate {
            self.collab.namespaces.inject_istio(project, &stage.name).await?;
            summary.mesh_injected = true;
        }
        info!(%project, stage = %stage.name, %service, %strategy, took_ms = %started.elapsed().as_millis(), "stage onboarded");
        Ok(summary)
    }

    /// Re-generate, package and store the managed chart of an onboarded
    /// service from a rendered manifest.
    pub async fn onboard_generated_service(
        &self,
        manifest: &str,
        project: &str,
        stage: &str,
        service: &str,
        strategy: DeploymentStrategy,
    ) -> OnboardResult<Chart> {
        let chart = self.generate(strategy, manifest, project, stage, service)?;
        let packaged = self.package(&chart)?;
        self.store_chart(project, stage, service, chart.name(), &packaged).await?;
        info!(%project, %stage, %service, %strategy, chart = %chart.name(), "managed chart regenerated");
        Ok(chart)
    }

    fn generate(&self, strategy: DeploymentStrategy, manifest: &str, project: &str, stage: &str, service: &str) -> OnboardResult<Chart> {
        generate_managed_chart(strategy, manifest, project, stage, service, &self.options.mesh).map_err(|e| {
            error!(%project, %stage, %service, error = %chain(&e), "chart generation failed");
            OnboardError::ChartGeneration { chart: chart_name(service, true), message: chain(&e) }
        })
    }

    fn package(&self, chart: &Chart) -> OnboardResult<Vec<u8>> {
        self.collab.tooling.package_chart(chart).map_err(|e| {
            error!(chart = %chart.name(), error = %chain(&e), "chart packaging failed");
            OnboardError::ChartPackaging { chart: chart.name().to_string(), message: chain(&e) }
        })
    }

    async fn store_chart(&self, project: &str, stage: &str, service: &str, chart: &str, bytes: &[u8]) -> OnboardResult<()> {
        let key = ResourceKey::service(project, stage, service, &chart_uri(chart));
        match self.collab.store.put_resource(&key, bytes, Precondition::Any).await {
            Ok(revision) => {
                debug!(%key, revision, bytes = bytes.len(), "chart stored");
                Ok(())
            }
            Err(e) => {
                error!(%key, error = %format!("{:#}", e), "storing chart failed");
                Err(OnboardError::ChartStorage { chart: chart.to_string(), stage: stage.to_string(), message: format!("{:#}", e) })
            }
        }
    }

    async fn add_to_umbrella(&self, project: &str, stage: &str, chart: &str) -> OnboardResult<()> {
        self.collab.umbrella.add_chart_in_umbrella_values(project, chart, stage).await.map(|_| ()).map_err(|e| umbrella_err(stage, e))
    }
}

fn umbrella_err(stage: &str, e: anyhow::Error) -> OnboardError {
    warn!(%stage, error = %chain(&e), "umbrella chart update failed");
    OnboardError::UmbrellaChart { stage: stage.to_string(), message: chain(&e) }
}
