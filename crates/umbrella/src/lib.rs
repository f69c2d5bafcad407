//! Stagehand umbrella – the per-(project, stage) aggregate chart that
//! references every onboarded chart.
//!
//! Stored at stage scope as `helm/Chart.yaml`, `helm/requirements.yaml` and
//! `helm/values.yaml`. Membership lives in `values.yaml`: one top-level key
//! per chart, `{ enabled: true }`.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use metrics::counter;
use rustc_hash::FxHashMap;
use serde_json::{json, Map, Value as Json};
use stagehand_core::{Precondition, ResourceKey, ResourceStore, Stage};
use tracing::{debug, info};

pub const CHART_YAML_URI: &str = "helm/Chart.yaml";
pub const REQUIREMENTS_URI: &str = "helm/requirements.yaml";
pub const VALUES_URI: &str = "helm/values.yaml";
pub const DEFAULT_MAX_RETRIES: usize = 16;

/// Compare-and-swap attempts per update before giving up.
pub fn max_retries() -> usize {
    std::env::var("STAGEHAND_UMBRELLA_MAX_RETRIES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(DEFAULT_MAX_RETRIES)
}

type StageLock = Arc<tokio::sync::Mutex<()>>;

pub struct UmbrellaChartManager {
    store: Arc<dyn ResourceStore>,
    locks: Mutex<FxHashMap<(String, String), StageLock>>,
    max_retries: usize,
}

impl UmbrellaChartManager {
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self { store, locks: Mutex::new(FxHashMap::default()), max_retries: max_retries() }
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    fn lock_for(&self, project: &str, stage: &str) -> StageLock {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry((project.to_string(), stage.to_string())).or_default().clone()
    }

    /// True iff every stage already carries an umbrella `Chart.yaml`.
    pub async fn is_umbrella_chart_available_in_all_stages(&self, project: &str, stages: &[Stage]) -> Result<bool> {
        for stage in stages {
            let key = ResourceKey::stage(project, &stage.name, CHART_YAML_URI);
            let found = self.store.get_resource(&key).await.with_context(|| format!("reading {}", key))?;
            if found.is_none() {
                debug!(%project, stage = %stage.name, "umbrella chart missing");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Seed an empty umbrella chart in every stage that lacks one. Existing
    /// files are never overwritten; losing a creation race is fine. Returns the
    /// number of stages seeded by this call.
    pub async fn init_umbrella_chart(&self, project: &str, stages: &[Stage]) -> Result<usize> {
        let mut seeded = 0usize;
        for stage in stages {
            // Chart.yaml goes last: its presence marks a complete umbrella.
            let files = [
                (VALUES_URI, "{}\n".to_string()),
                (REQUIREMENTS_URI, "dependencies: []\n".to_string()),
                (CHART_YAML_URI, umbrella_chart_yaml(project, &stage.name)),
            ];
            let mut created_chart = false;
            for (uri, content) in files {
                let key = ResourceKey::stage(project, &stage.name, uri);
                match self.store.put_resource(&key, content.as_bytes(), Precondition::Absent).await {
                    Ok(_) => created_chart = uri == CHART_YAML_URI,
                    Err(e) if e.is_conflict() => debug!(%key, "umbrella file already present"),
                    Err(e) => return Err(anyhow::Error::from(e).context(format!("seeding {}", key))),
                }
            }
            if created_chart {
                seeded += 1;
                info!(%project, stage = %stage.name, "umbrella chart initialized");
            }
        }
        Ok(seeded)
    }

    /// Ensure `chart` is a member of the stage's umbrella. Returns true when
    /// this call added it; an existing member is a no-op.
    pub async fn add_chart_in_umbrella_values(&self, project: &str, chart: &str, stage: &str) -> Result<bool> {
        let lock = self.lock_for(project, stage);
        let _guard = lock.lock().await;
        let key = ResourceKey::stage(project, stage, VALUES_URI);

        for attempt in 0..=self.max_retries {
            let current = self
                .store
                .get_resource(&key)
                .await
                .with_context(|| format!("reading {}", key))?
                .ok_or_else(|| anyhow!("umbrella chart of stage {} is not initialized", stage))?;
            let mut values = parse_values(&current.content).with_context(|| format!("parsing {}", key))?;
            if is_enabled(&values, chart) {
                counter!("umbrella_add_noop_total", 1u64);
                debug!(%project, %stage, %chart, "chart already in umbrella");
                return Ok(false);
            }
            values.insert(chart.to_string(), json!({ "enabled": true }));
            let content = serde_yaml::to_string(&values).context("serializing umbrella values")?;
            match self.store.put_resource(&key, content.as_bytes(), Precondition::Revision(current.revision)).await {
                Ok(revision) => {
                    counter!("umbrella_add_total", 1u64);
                    info!(%project, %stage, %chart, revision, "chart added to umbrella");
                    return Ok(true);
                }
                Err(e) if e.is_conflict() => {
                    counter!("umbrella_cas_conflict_total", 1u64);
                    debug!(%project, %stage, %chart, attempt, "umbrella values changed concurrently, retrying");
                }
                Err(e) => return Err(anyhow::Error::from(e).context(format!("writing {}", key))),
            }
        }
        bail!("umbrella values of stage {} kept changing; gave up after {} retries", stage, self.max_retries)
    }

    /// Enabled chart names of a stage's umbrella.
    pub async fn members(&self, project: &str, stage: &str) -> Result<BTreeSet<String>> {
        let key = ResourceKey::stage(project, stage, VALUES_URI);
        let Some(current) = self.store.get_resource(&key).await.with_context(|| format!("reading {}", key))? else {
            return Ok(BTreeSet::new());
        };
        let values = parse_values(&current.content).with_context(|| format!("parsing {}", key))?;
        Ok(values.keys().filter(|k| is_enabled(&values, k)).cloned().collect())
    }
}

fn umbrella_chart_yaml(project: &str, stage: &str) -> String {
    format!(
        "apiVersion: v1\nname: {stage}\nversion: 0.1.0\ndescription: Umbrella chart of stage {stage} in project {project}\n"
    )
}

fn parse_values(content: &[u8]) -> Result<Map<String, Json>> {
    let yaml: serde_yaml::Value = serde_yaml::from_slice(content)?;
    match serde_json::to_value(yaml)? {
        Json::Null => Ok(Map::new()),
        Json::Object(map) => Ok(map),
        other => bail!("umbrella values must be a mapping, found {}", other),
    }
}

fn is_enabled(values: &Map<String, Json>, chart: &str) -> bool {
    values.get(chart).and_then(|v| v.get("enabled")).and_then(Json::as_bool).unwrap_or(false)
}
