//! Service name validation.

use stagehand_chart::{ChartTooling, RenderedChart};
use stagehand_core::error::chain;
use stagehand_core::naming::{is_valid_directory_name, is_valid_entity_name};
use stagehand_core::{OnboardError, OnboardResult, OnboardingRequest};

/// Check the request's service name and, when a chart is supplied, reconcile
/// it with the chart's single Service. An empty request name is taken from
/// the chart; two different names are an error.
pub fn check_and_set_service_name(request: &mut OnboardingRequest, rendered: Option<&RenderedChart>) -> OnboardResult<()> {
    let Some(rendered) = rendered else {
        if !is_valid_directory_name(&request.service) {
            return Err(OnboardError::InvalidName(format!(
                "service name {:?} must be non-empty and contain only letters, digits, '.', '_' and '-'",
                request.service
            )));
        }
        return Ok(());
    };

    let services: Vec<_> = rendered.services().collect();
    if services.len() != 1 {
        return Err(OnboardError::InvalidChartShape { found: services.len() });
    }
    let chart_service = &services[0].name;
    if !is_valid_entity_name(chart_service) || !is_valid_directory_name(chart_service) {
        return Err(OnboardError::InvalidName(format!(
            "Kubernetes service name {:?} must start with a lowercase letter and contain only lowercase letters, digits and '-'",
            chart_service
        )));
    }
    if request.service.is_empty() {
        request.service = chart_service.clone();
    } else if &request.service != chart_service {
        return Err(OnboardError::NameMismatch { requested: request.service.clone(), chart: chart_service.clone() });
    }
    Ok(())
}

/// Render the request's chart (if any) and validate the service name against
/// it. The rendering is returned for chart generation.
pub fn validate_request(request: &mut OnboardingRequest, tooling: &dyn ChartTooling) -> OnboardResult<Option<RenderedChart>> {
    let rendered = match request.helm_chart.as_deref() {
        Some(bytes) if !bytes.is_empty() => {
            Some(tooling.render_workloads(bytes).map_err(|e| OnboardError::InvalidChart(chain(&e)))?)
        }
        _ => None,
    };
    check_and_set_service_name(request, rendered.as_ref())?;
    Ok(rendered)
}
