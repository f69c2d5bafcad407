//! Deployment strategies and their per-stage resolution.
//!
//! Precedence is fixed: explicit stage entry, then the `*` wildcard, then
//! the shadow definitions (only under [`StrategyResolutionPolicy::ShadowFallback`]),
//! then [`DeploymentStrategy::Direct`].

use std::collections::BTreeMap;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::{Stage, StrategySource};

/// Strategy-map key that applies to every stage without an explicit entry.
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStrategy {
    /// Single track; traffic handled by plain mesh routing.
    #[default]
    Direct,
    /// Two parallel tracks enabling atomic cutover.
    #[serde(alias = "blue_green_service", alias = "blue_green")]
    Duplicate,
}

impl DeploymentStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStrategy::Direct => "direct",
            DeploymentStrategy::Duplicate => "duplicate",
        }
    }
}

impl std::fmt::Display for DeploymentStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(DeploymentStrategy::Direct),
            "duplicate" | "blue_green_service" | "blue_green" => Ok(DeploymentStrategy::Duplicate),
            other => Err(anyhow!("unknown deployment strategy: {} (expect direct or duplicate)", other)),
        }
    }
}

/// Strategies keyed by stage name or [`WILDCARD`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct StrategyMap(BTreeMap<String, DeploymentStrategy>);

impl StrategyMap {
    pub fn new() -> Self { Self::default() }

    pub fn insert(&mut self, key: impl Into<String>, strategy: DeploymentStrategy) {
        self.0.insert(key.into(), strategy);
    }

    pub fn explicit(&self, stage: &str) -> Option<DeploymentStrategy> {
        if stage == WILDCARD { return None; }
        self.0.get(stage).copied()
    }

    pub fn wildcard(&self) -> Option<DeploymentStrategy> { self.0.get(WILDCARD).copied() }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub fn iter(&self) -> impl Iterator<Item = (&str, DeploymentStrategy)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Parse `stage=strategy` / `*=strategy` assignments.
    pub fn parse_assignments<'a>(items: impl IntoIterator<Item = &'a str>) -> Result<Self> {
        let mut map = Self::new();
        for item in items {
            let (key, value) = item
                .split_once('=')
                .ok_or_else(|| anyhow!("invalid strategy assignment: {} (expect stage=strategy)", item))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(anyhow!("invalid strategy assignment: {} (empty stage)", item));
            }
            let strategy = value.parse::<DeploymentStrategy>().with_context(|| format!("parsing {}", item))?;
            map.insert(key, strategy);
        }
        Ok(map)
    }
}

impl FromIterator<(String, DeploymentStrategy)> for StrategyMap {
    fn from_iter<T: IntoIterator<Item = (String, DeploymentStrategy)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// How stages without a request-provided strategy are resolved. Chosen by the
/// caller when building the orchestrator.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum StrategyResolutionPolicy {
    /// Explicit entry, wildcard, then the default.
    #[default]
    RequestOnly,
    /// Like `RequestOnly`, but consult the shadow definitions before
    /// falling back to the default.
    ShadowFallback,
}

/// Resolve one stage. `fallback` is the shadow definition, if any was looked up.
pub fn resolve(stage: &str, map: &StrategyMap, fallback: Option<DeploymentStrategy>) -> DeploymentStrategy {
    map.explicit(stage).or_else(|| map.wildcard()).or(fallback).unwrap_or_default()
}

/// Resolve every stage. The source is queried only for stages the request
/// leaves open and only under `ShadowFallback`.
pub async fn resolve_all(
    project: &str,
    stages: &[Stage],
    map: &StrategyMap,
    policy: StrategyResolutionPolicy,
    source: Option<&dyn StrategySource>,
) -> Result<BTreeMap<String, DeploymentStrategy>> {
    let mut out = BTreeMap::new();
    for stage in stages {
        let open = map.explicit(&stage.name).is_none() && map.wildcard().is_none();
        let fallback = match (policy, source) {
            (StrategyResolutionPolicy::ShadowFallback, Some(src)) if open => src
                .strategy_for(project, &stage.name)
                .await
                .with_context(|| format!("reading shadow strategy for stage {}", stage.name))?,
            _ => None,
        };
        out.insert(stage.name.clone(), resolve(&stage.name, map, fallback));
    }
    Ok(out)
}
