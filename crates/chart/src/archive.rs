//! Chart archives: `<chart>/Chart.yaml`, `<chart>/values.yaml` and
//! `<chart>/templates/*` in a gzip'd tar.

use std::io::Read;

use anyhow::{anyhow, bail, Context, Result};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde_json::Value as Json;
use tracing::debug;

use crate::{Chart, ChartMetadata, Template};

const TEMPLATES_DIR: &str = "templates/";

/// Load a chart archive. Sub-charts and files outside the known layout are
/// ignored.
pub fn load_chart(bytes: &[u8], max_bytes: usize) -> Result<Chart> {
    if bytes.len() > max_bytes {
        bail!("chart archive too large ({} > {} bytes)", bytes.len(), max_bytes);
    }
    let mut archive = tar::Archive::new(GzDecoder::new(bytes));
    let mut metadata: Option<ChartMetadata> = None;
    let mut values: Option<Json> = None;
    let mut templates = Vec::new();
    let mut expanded = 0usize;

    for entry in archive.entries().context("reading chart archive")? {
        let mut entry = entry.context("reading chart archive entry")?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path().context("chart archive entry path")?.to_string_lossy().replace('\\', "/");
        let rel = match path.split_once('/') {
            Some((_, rel)) => rel.to_string(),
            None => continue,
        };

        let remaining = max_bytes.saturating_sub(expanded);
        let mut buf = Vec::new();
        entry.by_ref().take(remaining as u64 + 1).read_to_end(&mut buf).with_context(|| format!("reading {}", path))?;
        expanded += buf.len();
        if expanded > max_bytes {
            bail!("chart archive too large when expanded (> {} bytes)", max_bytes);
        }

        match rel.as_str() {
            "Chart.yaml" => {
                metadata = Some(serde_yaml::from_slice(&buf).with_context(|| format!("parsing {}", path))?);
            }
            "values.yaml" => {
                let v: serde_yaml::Value = serde_yaml::from_slice(&buf).with_context(|| format!("parsing {}", path))?;
                values = Some(serde_json::to_value(v).context("converting values to JSON")?);
            }
            t if t.starts_with(TEMPLATES_DIR) => {
                let data = String::from_utf8(buf).map_err(|_| anyhow!("template {} is not UTF-8", path))?;
                templates.push(Template { name: t[TEMPLATES_DIR.len()..].to_string(), data });
            }
            _ => {}
        }
    }

    let metadata = metadata.ok_or_else(|| anyhow!("chart archive has no Chart.yaml"))?;
    templates.sort_by(|a, b| a.name.cmp(&b.name));
    let values = match values {
        Some(Json::Null) | None => Json::Object(Default::default()),
        Some(v) => v,
    };
    debug!(chart = %metadata.name, templates = templates.len(), bytes = bytes.len(), "chart loaded");
    Ok(Chart { metadata, values, templates })
}

/// Package a chart. Output is byte-for-byte stable for equal charts.
pub fn package_chart(chart: &Chart) -> Result<Vec<u8>> {
    let root = chart.name();
    if root.is_empty() {
        bail!("chart has no name");
    }
    let mut files: Vec<(String, Vec<u8>)> = Vec::with_capacity(chart.templates.len() + 2);
    files.push((format!("{}/Chart.yaml", root), serde_yaml::to_string(&chart.metadata).context("serializing Chart.yaml")?.into_bytes()));
    files.push((format!("{}/values.yaml", root), serde_yaml::to_string(&chart.values).context("serializing values.yaml")?.into_bytes()));
    let mut templates: Vec<&Template> = chart.templates.iter().collect();
    templates.sort_by(|a, b| a.name.cmp(&b.name));
    for t in templates {
        files.push((format!("{}/{}{}", root, TEMPLATES_DIR, t.name), t.data.clone().into_bytes()));
    }

    let mut out = Vec::new();
    {
        let encoder = GzEncoder::new(&mut out, Compression::default());
        let mut tar = tar::Builder::new(encoder);
        for (path, data) in &files {
            let mut header = tar::Header::new_gnu();
            header.set_path(path).with_context(|| format!("setting archive path {}", path))?;
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(0);
            header.set_cksum();
            tar.append(&header, &data[..]).with_context(|| format!("appending {}", path))?;
        }
        let encoder = tar.into_inner().context("finishing chart archive")?;
        encoder.finish().context("finishing chart compression")?;
    }
    debug!(chart = %root, bytes = out.len(), "chart packaged");
    Ok(out)
}
