//! Minimal template rendering.
//!
//! Supported actions: `.Values.<path>`, `.Chart.Name`, `.Chart.Version`,
//! `.Release.Name`, `.Release.Namespace` and `/* comments */`, each with
//! optional `{{-` / `-}}` whitespace trimming. Anything else is rejected.
//! Partials (`_*.tpl`) and `NOTES.txt` never produce manifest output.

use anyhow::{anyhow, bail, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::Chart;

/// Namespace used when rendering outside of a stage.
pub const DEFAULT_NAMESPACE: &str = "default";

static ACTION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\{\{(-\s)?\s*(.*?)\s*(\s-)?\}\}").unwrap());

/// Kind and name of one rendered object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct RenderedChart {
    pub chart: Chart,
    /// Multi-document YAML.
    pub manifest: String,
    pub workloads: Vec<Workload>,
}

impl RenderedChart {
    /// Network-exposing workloads (kind `Service`).
    pub fn services(&self) -> impl Iterator<Item = &Workload> { self.workloads.iter().filter(|w| w.kind == "Service") }
}

struct Scope<'a> {
    chart: &'a Chart,
    release: &'a str,
    namespace: &'a str,
}

fn is_manifest_template(name: &str) -> bool {
    let file = name.rsplit('/').next().unwrap_or(name);
    !(file.starts_with('_') || file == "NOTES.txt")
}

pub fn render_chart(chart: &Chart, release: &str, namespace: &str) -> Result<RenderedChart> {
    let scope = Scope { chart, release, namespace };
    let mut docs = Vec::new();
    for t in chart.templates.iter().filter(|t| is_manifest_template(&t.name)) {
        let out = render_template(&t.data, &scope).with_context(|| format!("rendering template {}", t.name))?;
        if !out.trim().is_empty() {
            docs.push(format!("---\n# Source: {}/templates/{}\n{}\n", chart.name(), t.name, out.trim_end()));
        }
    }
    let manifest = docs.concat();
    let workloads = parse_manifest(&manifest)?.iter().filter_map(workload_of).collect();
    Ok(RenderedChart { chart: chart.clone(), manifest, workloads })
}

fn render_template(src: &str, scope: &Scope<'_>) -> Result<String> {
    let mut out = String::with_capacity(src.len());
    let mut last = 0usize;
    let mut trim_next = false;
    for caps in ACTION_RE.captures_iter(src) {
        let whole = caps.get(0).ok_or_else(|| anyhow!("empty action match"))?;
        let mut literal = &src[last..whole.start()];
        if trim_next {
            literal = literal.trim_start();
        }
        if caps.get(1).is_some() {
            literal = literal.trim_end();
        }
        out.push_str(literal);
        let expr = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        out.push_str(&evaluate(expr, scope)?);
        trim_next = caps.get(3).is_some();
        last = whole.end();
    }
    let tail = &src[last..];
    if tail.contains("{{") {
        bail!("unterminated template action");
    }
    out.push_str(if trim_next { tail.trim_start() } else { tail });
    Ok(out)
}

fn evaluate(expr: &str, scope: &Scope<'_>) -> Result<String> {
    if expr.starts_with("/*") && expr.ends_with("*/") {
        return Ok(String::new());
    }
    match expr {
        ".Chart.Name" => return Ok(scope.chart.metadata.name.clone()),
        ".Chart.Version" => return Ok(scope.chart.metadata.version.clone()),
        ".Release.Name" => return Ok(scope.release.to_string()),
        ".Release.Namespace" => return Ok(scope.namespace.to_string()),
        ".Values" => return scalar(&scope.chart.values),
        _ => {}
    }
    let path = expr.strip_prefix(".Values.").ok_or_else(|| anyhow!("unsupported template action {{{{ {} }}}}", expr))?;
    let mut cur = &scope.chart.values;
    for seg in path.split('.') {
        if seg.is_empty() {
            bail!("malformed values path {}", expr);
        }
        match cur.get(seg) {
            Some(v) => cur = v,
            // Missing values render empty.
            None => return Ok(String::new()),
        }
    }
    scalar(cur)
}

fn scalar(v: &Json) -> Result<String> {
    Ok(match v {
        Json::Null => String::new(),
        Json::String(s) => s.clone(),
        Json::Bool(b) => b.to_string(),
        Json::Number(n) => n.to_string(),
        other => serde_json::to_string(other).context("rendering structured value")?,
    })
}

/// Split a multi-document YAML manifest into JSON objects, skipping empty
/// documents.
pub fn parse_manifest(manifest: &str) -> Result<Vec<Json>> {
    let mut out = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(manifest) {
        let v = serde_yaml::Value::deserialize(doc).context("parsing rendered manifest")?;
        if v.is_null() {
            continue;
        }
        out.push(serde_json::to_value(v).context("converting manifest document to JSON")?);
    }
    Ok(out)
}

fn workload_of(obj: &Json) -> Option<Workload> {
    let kind = obj.get("kind")?.as_str()?;
    let name = obj.get("metadata")?.get("name")?.as_str()?;
    Some(Workload { kind: kind.to_string(), name: name.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chart() -> Chart {
        let mut c = Chart::new("cart", "1.0.0");
        c.values = serde_json::json!({ "image": { "tag": "v3" }, "replicas": 2, "debug": false });
        c
    }

    fn scope(chart: &Chart) -> Scope<'_> { Scope { chart, release: "cart", namespace: "shop-dev" } }

    #[test]
    fn substitutes_supported_actions() {
        let c = chart();
        let out = render_template(
            "{{ .Chart.Name }}:{{ .Values.image.tag }} x{{.Values.replicas}} {{ .Values.debug }} {{ .Release.Namespace }} {{ .Values.nope }}.",
            &scope(&c),
        )
        .unwrap();
        assert_eq!(out, "cart:v3 x2 false shop-dev .");
    }

    #[test]
    fn trim_markers_eat_whitespace() {
        let c = chart();
        let out = render_template("a  \n  {{- .Chart.Version -}}  \n  b", &scope(&c)).unwrap();
        assert_eq!(out, "a1.0.0b");
        let out = render_template("a {{/* note */}}b", &scope(&c)).unwrap();
        assert_eq!(out, "a b");
    }

    #[test]
    fn control_flow_is_rejected() {
        let c = chart();
        let err = render_template("{{ if .Values.debug }}x{{ end }}", &scope(&c)).unwrap_err();
        assert!(err.to_string().contains("unsupported template action"));
        assert!(render_template("{{ .Values.image", &scope(&c)).is_err());
    }

    #[test]
    fn renders_manifest_and_lists_workloads() {
        let mut c = chart();
        c.add_template("svc.yaml", "apiVersion: v1\nkind: Service\nmetadata:\n  name: {{ .Release.Name }}\n");
        c.add_template(
            "deploy.yaml",
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: cart\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cart-cfg\n",
        );
        c.add_template("_helpers.tpl", "{{ define \"x\" }}{{ end }}");
        c.add_template("NOTES.txt", "{{ .Release.Name }} installed");
        let r = render_chart(&c, "cart", DEFAULT_NAMESPACE).unwrap();
        let kinds: Vec<_> = r.workloads.iter().map(|w| w.kind.as_str()).collect();
        assert_eq!(kinds, vec!["Service", "Deployment", "ConfigMap"]);
        assert_eq!(r.services().count(), 1);
        assert!(r.manifest.contains("# Source: cart/templates/svc.yaml"));
    }

    #[test]
    fn empty_documents_are_skipped() {
        let docs = parse_manifest("---\n# only a comment\n---\nkind: Service\nmetadata:\n  name: a\n---\n").unwrap();
        assert_eq!(docs.len(), 1);
    }
}
