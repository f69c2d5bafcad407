//! Recording fakes for the onboarding collaborators.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use stagehand_api::{Collaborators, Completion, CompletionSink, Onboarder, OnboarderOptions};
use stagehand_chart::{package_chart, Chart, ChartTooling, LocalTooling, RenderedChart};
use stagehand_core::{
    AccessReview, DeploymentStrategy, NamespaceApi, Precondition, Resource, ResourceKey, ResourceStore, Stage, StageCatalogue,
    StoreError, StrategySource,
};
use stagehand_ops::{CapabilityChecker, NamespaceManager};
use stagehand_umbrella::UmbrellaChartManager;

pub const PROJECT: &str = "shop";

pub struct Catalogue {
    pub stages: Vec<Stage>,
    pub created: Mutex<Vec<(String, String)>>,
    pub fail_create_in: Option<String>,
}

#[async_trait::async_trait]
impl StageCatalogue for Catalogue {
    async fn list_stages(&self, project: &str) -> Result<Vec<Stage>> {
        if project != PROJECT {
            return Err(anyhow!("project not found: {project}"));
        }
        Ok(self.stages.clone())
    }

    async fn create_service_in_stage(&self, _project: &str, stage: &str, service: &str) -> Result<()> {
        if self.fail_create_in.as_deref() == Some(stage) {
            return Err(anyhow!("catalogue unavailable"));
        }
        self.created.lock().unwrap().push((stage.to_string(), service.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct MemStore {
    data: Mutex<BTreeMap<ResourceKey, Resource>>,
    pub writes: Mutex<Vec<ResourceKey>>,
    /// Puts matching this predicate fail with a backend error.
    pub fail_puts: Mutex<Option<fn(&ResourceKey, Precondition) -> bool>>,
}

impl MemStore {
    pub fn get(&self, key: &ResourceKey) -> Option<Resource> { self.data.lock().unwrap().get(key).cloned() }

    /// Writes at service scope, i.e. chart uploads.
    pub fn chart_writes(&self) -> Vec<ResourceKey> {
        self.writes.lock().unwrap().iter().filter(|k| k.service.is_some()).cloned().collect()
    }

    pub fn fail_puts_when(&self, pred: fn(&ResourceKey, Precondition) -> bool) { *self.fail_puts.lock().unwrap() = Some(pred); }

    pub fn writes_in(&self, stage: &str) -> usize { self.writes.lock().unwrap().iter().filter(|k| k.stage == stage).count() }

    pub fn chart(&self, stage: &str, service: &str, chart: &str) -> Option<Vec<u8>> {
        self.get(&ResourceKey::service(PROJECT, stage, service, &format!("helm/{chart}.tgz"))).map(|r| r.content)
    }
}

#[async_trait::async_trait]
impl ResourceStore for MemStore {
    async fn get_resource(&self, key: &ResourceKey) -> Result<Option<Resource>> { Ok(self.get(key)) }

    async fn put_resource(&self, key: &ResourceKey, content: &[u8], precondition: Precondition) -> Result<u64, StoreError> {
        if self.fail_puts.lock().unwrap().is_some_and(|fail| fail(key, precondition)) {
            return Err(StoreError::Backend(anyhow!("disk full")));
        }
        let mut data = self.data.lock().unwrap();
        let found = data.get(key).map(|r| r.revision);
        let ok = match precondition {
            Precondition::Any => true,
            Precondition::Absent => found.is_none(),
            Precondition::Revision(n) => found == Some(n),
        };
        if !ok {
            return Err(StoreError::Conflict { key: key.to_string(), expected: precondition, found });
        }
        let revision = found.unwrap_or(0) + 1;
        data.insert(key.clone(), Resource { content: content.to_vec(), revision });
        self.writes.lock().unwrap().push(key.clone());
        Ok(revision)
    }
}

#[derive(Default)]
pub struct Namespaces {
    existing: Mutex<BTreeSet<String>>,
    pub ensured: Mutex<Vec<String>>,
    pub labelled: Mutex<Vec<String>>,
    pub fail_ensure: Mutex<Option<String>>,
    pub fail_label: Mutex<Option<String>>,
}

impl Namespaces {
    pub fn call_count(&self) -> usize { self.ensured.lock().unwrap().len() + self.labelled.lock().unwrap().len() }
}

#[async_trait::async_trait]
impl NamespaceApi for Namespaces {
    async fn ensure_namespace(&self, name: &str) -> Result<bool> {
        if self.fail_ensure.lock().unwrap().as_deref() == Some(name) {
            return Err(anyhow!("namespaces is forbidden"));
        }
        self.ensured.lock().unwrap().push(name.to_string());
        Ok(self.existing.lock().unwrap().insert(name.to_string()))
    }

    async fn label_for_mesh_injection(&self, name: &str) -> Result<bool> {
        if !self.existing.lock().unwrap().contains(name) {
            return Err(anyhow!("namespace {name} not found"));
        }
        if self.fail_label.lock().unwrap().as_deref() == Some(name) {
            return Err(anyhow!("patch rejected by admission webhook"));
        }
        self.labelled.lock().unwrap().push(name.to_string());
        Ok(true)
    }
}

pub struct Review {
    pub answer: Result<bool, String>,
    pub calls: AtomicUsize,
}

#[async_trait::async_trait]
impl AccessReview for Review {
    async fn can_manage_namespaces(&self) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer.clone().map_err(|e| anyhow!(e))
    }
}

#[derive(Default)]
pub struct Completions(pub Mutex<Vec<Completion>>);

impl Completions {
    pub fn all(&self) -> Vec<Completion> { self.0.lock().unwrap().clone() }
}

impl CompletionSink for Completions {
    fn done(&self, completion: Completion) { self.0.lock().unwrap().push(completion); }
}

pub struct Shadow(pub BTreeMap<String, DeploymentStrategy>);

#[async_trait::async_trait]
impl StrategySource for Shadow {
    async fn strategy_for(&self, _project: &str, stage: &str) -> Result<Option<DeploymentStrategy>> { Ok(self.0.get(stage).copied()) }
}

/// Renders like [`LocalTooling`] but cannot package.
pub struct BrokenPackaging(pub LocalTooling);

impl ChartTooling for BrokenPackaging {
    fn render_workloads(&self, chart: &[u8]) -> Result<RenderedChart> { self.0.render_workloads(chart) }

    fn package_chart(&self, _chart: &Chart) -> Result<Vec<u8>> { Err(anyhow!("archive writer closed")) }
}

pub struct Setup {
    pub stages: Vec<&'static str>,
    pub allowed: Result<bool, String>,
    pub options: OnboarderOptions,
    pub fail_create_in: Option<&'static str>,
    pub shadow: Option<Shadow>,
    pub broken_packaging: bool,
}

impl Default for Setup {
    fn default() -> Self {
        Self { stages: vec!["dev", "staging"], allowed: Ok(true), options: OnboarderOptions::default(), fail_create_in: None, shadow: None, broken_packaging: false }
    }
}

pub struct Harness {
    pub onboarder: Onboarder,
    pub catalogue: Arc<Catalogue>,
    pub store: Arc<MemStore>,
    pub namespaces: Arc<Namespaces>,
    pub review: Arc<Review>,
    pub completions: Arc<Completions>,
    pub umbrella: Arc<UmbrellaChartManager>,
}

impl Harness {
    pub fn created(&self) -> Vec<(String, String)> { self.catalogue.created.lock().unwrap().clone() }

    pub fn labelled(&self) -> Vec<String> { self.namespaces.labelled.lock().unwrap().clone() }

    pub async fn members(&self, stage: &str) -> Vec<String> { self.umbrella.members(PROJECT, stage).await.unwrap().into_iter().collect() }
}

impl Setup {
    pub fn build(self) -> Harness {
        let catalogue = Arc::new(Catalogue {
            stages: self.stages.iter().enumerate().map(|(i, s)| Stage::new(*s, i as u32)).collect(),
            created: Mutex::new(Vec::new()),
            fail_create_in: self.fail_create_in.map(str::to_string),
        });
        let store = Arc::new(MemStore::default());
        let namespaces = Arc::new(Namespaces::default());
        let review = Arc::new(Review { answer: self.allowed, calls: AtomicUsize::new(0) });
        let completions = Arc::new(Completions::default());
        let umbrella = Arc::new(UmbrellaChartManager::new(store.clone()));
        let collab = Collaborators {
            catalogue: catalogue.clone(),
            store: store.clone(),
            strategies: self.shadow.map(|s| Arc::new(s) as Arc<dyn StrategySource>),
            capability: CapabilityChecker::new(review.clone()),
            namespaces: NamespaceManager::new(namespaces.clone()),
            umbrella: umbrella.clone(),
            tooling: if self.broken_packaging {
                Arc::new(BrokenPackaging(LocalTooling::default())) as Arc<dyn ChartTooling>
            } else {
                Arc::new(LocalTooling::default())
            },
            completion: completions.clone(),
        };
        Harness { onboarder: Onboarder::new(collab, self.options), catalogue, store, namespaces, review, completions, umbrella }
    }
}

/// A packaged user chart with one Service per name and a Deployment for the
/// first one.
pub fn chart_archive(services: &[&str]) -> Vec<u8> {
    let main = services.first().copied().unwrap_or("cart");
    let mut chart = Chart::new(main, "0.1.0");
    chart.values = serde_json::json!({ "image": "shop/app:1" });
    for svc in services {
        chart.add_template(
            format!("{svc}-service.yaml"),
            format!("apiVersion: v1\nkind: Service\nmetadata:\n  name: {svc}\nspec:\n  selector:\n    app: {svc}\n  ports:\n  - port: 80\n"),
        );
    }
    chart.add_template(
        "deployment.yaml",
        format!(
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: {main}\nspec:\n  selector:\n    matchLabels:\n      app: {main}\n  template:\n    metadata:\n      labels:\n        app: {main}\n    spec:\n      containers:\n      - name: {main}\n        image: {{{{ .Values.image }}}}\n"
        ),
    );
    package_chart(&chart).unwrap()
}
