//! Stagehand chart – chart model, archive load/package, minimal template
//! rendering and the managed chart generator.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub mod archive;
pub mod generate;
pub mod mesh;
pub mod render;

pub use archive::{load_chart, package_chart};
pub use generate::{
    generate_duplicate_managed_chart, generate_empty_chart, generate_managed_chart, generate_mesh_chart,
    is_generated_chart_empty,
};
pub use mesh::IstioMesh;
pub use render::{parse_manifest, render_chart, RenderedChart, Workload, DEFAULT_NAMESPACE};

pub const DEFAULT_MAX_CHART_BYTES: usize = 5 * 1024 * 1024;

/// Upper bound on a user chart archive, compressed and expanded.
pub fn max_chart_bytes() -> usize {
    std::env::var("STAGEHAND_MAX_CHART_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(DEFAULT_MAX_CHART_BYTES)
}

fn default_api_version() -> String { "v1".to_string() }

/// `Chart.yaml`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChartMetadata {
    #[serde(rename = "apiVersion", default = "default_api_version")]
    pub api_version: String,
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    /// Path below `templates/`.
    pub name: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Chart {
    pub metadata: ChartMetadata,
    pub values: Json,
    pub templates: Vec<Template>,
}

impl Chart {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            metadata: ChartMetadata {
                api_version: default_api_version(),
                name: name.into(),
                version: version.into(),
                description: None,
            },
            values: Json::Object(Default::default()),
            templates: Vec::new(),
        }
    }

    pub fn name(&self) -> &str { &self.metadata.name }

    pub fn add_template(&mut self, name: impl Into<String>, data: impl Into<String>) {
        self.templates.push(Template { name: name.into(), data: data.into() });
    }

    /// Serialize a manifest object as a static template.
    pub fn add_object(&mut self, file: impl Into<String>, obj: &Json) -> Result<()> {
        let file = file.into();
        let yaml = serde_yaml::to_string(obj).with_context(|| format!("serializing template {}", file))?;
        self.add_template(file, yaml);
        Ok(())
    }

    pub fn template(&self, name: &str) -> Option<&Template> { self.templates.iter().find(|t| t.name == name) }
}

/// Templating and packaging seam used by the validator and the orchestrator.
pub trait ChartTooling: Send + Sync {
    /// Load and render a chart archive, listing the objects it produces.
    fn render_workloads(&self, archive: &[u8]) -> Result<RenderedChart>;

    fn package_chart(&self, chart: &Chart) -> Result<Vec<u8>>;
}

/// In-process tooling: tar.gz archives plus the minimal renderer.
#[derive(Debug, Clone)]
pub struct LocalTooling {
    pub max_chart_bytes: usize,
}

impl Default for LocalTooling {
    fn default() -> Self { Self { max_chart_bytes: DEFAULT_MAX_CHART_BYTES } }
}

impl LocalTooling {
    pub fn from_env() -> Self { Self { max_chart_bytes: max_chart_bytes() } }
}

impl ChartTooling for LocalTooling {
    fn render_workloads(&self, archive: &[u8]) -> Result<RenderedChart> {
        let chart = load_chart(archive, self.max_chart_bytes)?;
        let release = chart.name().to_string();
        render_chart(&chart, &release, DEFAULT_NAMESPACE)
    }

    fn package_chart(&self, chart: &Chart) -> Result<Vec<u8>> { package_chart(chart) }
}
