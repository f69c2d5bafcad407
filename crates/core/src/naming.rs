//! Name rules shared by the validator, the chart generator and storage.

/// Suffix of the orchestrator-generated chart of a service.
pub const GENERATED_CHART_SUFFIX: &str = "-generated";

/// Label that turns on mesh sidecar injection for a namespace.
pub const MESH_INJECTION_LABEL: (&str, &str) = ("istio-injection", "enabled");

/// A service name usable as a single directory segment: ASCII letters,
/// digits, `.`, `_`, `-`; never `.` or `..`.
pub fn is_valid_directory_name(name: &str) -> bool {
    if name.is_empty() || name == "." || name == ".." || name.len() > 255 {
        return false;
    }
    name.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
}

/// A name usable as a cluster object name: starts with a lowercase letter,
/// then lowercase letters, digits and hyphens.
pub fn is_valid_entity_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Execution namespace of a stage.
pub fn namespace_for(project: &str, stage: &str) -> String {
    format!("{}-{}", project, stage)
}

/// Chart name of a service: the user chart keeps the service name, the
/// managed chart gets the generated suffix.
pub fn chart_name(service: &str, generated: bool) -> String {
    if generated { format!("{}{}", service, GENERATED_CHART_SUFFIX) } else { service.to_string() }
}

/// Storage uri of a packaged chart (service scope).
pub fn chart_uri(chart_name: &str) -> String {
    format!("helm/{}.tgz", chart_name)
}
