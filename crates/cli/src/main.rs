use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use stagehand_api::{
    Collaborators, LogCompletionSink, ManagedChartMode, OnboardApi, OnboardSummary, Onboarder, OnboarderOptions,
};
use stagehand_chart::{ChartTooling, IstioMesh, LocalTooling};
use stagehand_core::{
    AccessReview, DeploymentStrategy, NamespaceApi, OnboardingRequest, StageCatalogue, StrategyMap, StrategyResolutionPolicy,
    WILDCARD,
};
use stagehand_ops::{CapabilityChecker, NamespaceManager};
use stagehand_persist::{SqliteStore, StageDef};
use stagehand_umbrella::UmbrellaChartManager;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "stagehandctl", version, about = "Stagehand CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage projects in the config store
    Project {
        #[command(subcommand)]
        command: ProjectCommands,
    },
    /// List the stages of a project in topology order
    Stages { project: String },
    /// Onboard a service into every stage of a project
    Onboard {
        #[arg(long)]
        project: String,
        /// Service name; taken from the chart when omitted
        #[arg(long, default_value = "")]
        service: String,
        /// Path to the chart archive (.tgz)
        #[arg(long)]
        chart: Option<PathBuf>,
        /// Strategy per stage, e.g. "staging=duplicate" or "*=direct"
        #[arg(long = "strategy")]
        strategies: Vec<String>,
        /// Fall back to the project's stage strategies for stages left open
        #[arg(long = "shadow-strategies", action = ArgAction::SetTrue)]
        shadow_strategies: bool,
        /// Store placeholder managed charts instead of generating them
        #[arg(long, action = ArgAction::SetTrue)]
        deferred: bool,
    },
    /// Regenerate the managed chart of an onboarded service from a rendered manifest
    Generate {
        #[arg(long)]
        project: String,
        #[arg(long)]
        stage: String,
        #[arg(long)]
        service: String,
        #[arg(long)]
        strategy: String,
        /// Multi-document YAML manifest
        #[arg(long)]
        manifest: PathBuf,
    },
    /// Show the charts referenced by a stage's umbrella chart
    Umbrella {
        #[arg(long)]
        project: String,
        #[arg(long)]
        stage: String,
    },
}

#[derive(Subcommand, Debug)]
enum ProjectCommands {
    /// Create a project with its stages (in order)
    Create {
        name: String,
        #[arg(long = "stage", required = true)]
        stages: Vec<String>,
        /// Shipyard strategy per stage, e.g. "prod=blue_green_service"
        #[arg(long = "strategy")]
        strategies: Vec<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("STAGEHAND_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("STAGEHAND_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid STAGEHAND_METRICS_ADDR; expected host:port");
        }
    }
}

/// Stand-in for the cluster when the command never needs it.
struct Disconnected;

#[async_trait::async_trait]
impl AccessReview for Disconnected {
    async fn can_manage_namespaces(&self) -> Result<bool> { Err(anyhow!("not connected to a cluster")) }
}

#[async_trait::async_trait]
impl NamespaceApi for Disconnected {
    async fn ensure_namespace(&self, _name: &str) -> Result<bool> { Err(anyhow!("not connected to a cluster")) }

    async fn label_for_mesh_injection(&self, _name: &str) -> Result<bool> { Err(anyhow!("not connected to a cluster")) }
}

async fn build_onboarder(store: Arc<SqliteStore>, needs_cluster: bool, options: OnboarderOptions) -> Result<Onboarder> {
    let (capability, namespaces) = if needs_cluster {
        stagehand_ops::connect().await.context("connecting to the cluster")?
    } else {
        let offline = Arc::new(Disconnected);
        (CapabilityChecker::new(offline.clone()), NamespaceManager::new(offline))
    };
    let collab = Collaborators {
        catalogue: store.clone(),
        store: store.clone(),
        strategies: Some(store.clone()),
        capability,
        namespaces,
        umbrella: Arc::new(UmbrellaChartManager::new(store)),
        tooling: Arc::new(LocalTooling::from_env()),
        completion: Arc::new(LogCompletionSink),
    };
    Ok(Onboarder::new(collab, options))
}

/// Stage definitions of a new project: explicit entries first, then `*`.
/// Keys naming no listed stage are rejected.
fn stage_defs(stages: &[String], map: &StrategyMap) -> Result<Vec<StageDef>> {
    if let Some((key, _)) = map.iter().find(|(k, _)| *k != WILDCARD && !stages.iter().any(|s| s == k)) {
        bail!("strategy given for unknown stage {} (stages: {})", key, stages.join(", "));
    }
    Ok(stages
        .iter()
        .map(|s| match map.explicit(s).or_else(|| map.wildcard()) {
            Some(strategy) => StageDef::new(s.as_str()).with_strategy(strategy),
            None => StageDef::new(s.as_str()),
        })
        .collect())
}

fn print_summary(summary: &OnboardSummary, output: Output) -> Result<()> {
    match output {
        Output::Human => {
            println!("onboarded {} into project {}", summary.service, summary.project);
            println!("STAGE        STRATEGY   MESH  CHARTS");
            for s in &summary.stages {
                let charts = if s.charts.is_empty() { "-".to_string() } else { s.charts.join(",") };
                println!("{:<12} {:<10} {:<5} {}", s.stage, s.strategy, if s.mesh_injected { "yes" } else { "no" }, charts);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(summary)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let store = Arc::new(SqliteStore::open_default()?);

    match cli.command {
        Commands::Project { command: ProjectCommands::Create { name, stages, strategies } } => {
            let map = StrategyMap::parse_assignments(strategies.iter().map(String::as_str))?;
            let defs = stage_defs(&stages, &map)?;
            store.create_project(&name, &defs)?;
            info!(project = %name, stages = defs.len(), "project created");
            match cli.output {
                Output::Human => println!("created project {} with stages {}", name, stages.join(", ")),
                Output::Json => println!("{}", serde_json::json!({ "project": name, "stages": stages })),
            }
        }
        Commands::Stages { project } => {
            let stages = store.list_stages(&project).await?;
            match cli.output {
                Output::Human => {
                    for s in &stages {
                        println!("{:>3}  {}", s.position, s.name);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&stages)?),
            }
        }
        Commands::Onboard { project, service, chart, strategies, shadow_strategies, deferred } => {
            let mut request = OnboardingRequest::new(project, service);
            request.deployment_strategies = StrategyMap::parse_assignments(strategies.iter().map(String::as_str))?;
            if let Some(path) = &chart {
                let bytes = std::fs::read(path).with_context(|| format!("reading chart {}", path.display()))?;
                request = request.with_chart(bytes);
            }
            let options = OnboarderOptions {
                strategy_policy: if shadow_strategies {
                    StrategyResolutionPolicy::ShadowFallback
                } else {
                    StrategyResolutionPolicy::RequestOnly
                },
                managed_chart_mode: if deferred { ManagedChartMode::Deferred } else { ManagedChartMode::Generate },
                mesh: IstioMesh::from_env(),
            };
            let onboarder = build_onboarder(store, request.has_chart(), options).await?;
            let api: &dyn OnboardApi = &onboarder;
            match api.onboard(request).await {
                Ok(summary) => print_summary(&summary, cli.output)?,
                Err(e) => {
                    error!(error = %e, class = ?e.class(), "onboard failed");
                    match cli.output {
                        Output::Human => eprintln!("onboard error: {}", e),
                        Output::Json => println!("{}", serde_json::json!({ "error": e, "retryable": e.is_retryable() })),
                    }
                    std::process::exit(1);
                }
            }
        }
        Commands::Generate { project, stage, service, strategy, manifest } => {
            let strategy = DeploymentStrategy::from_str(&strategy)?;
            let manifest =
                std::fs::read_to_string(&manifest).with_context(|| format!("reading manifest {}", manifest.display()))?;
            let options = OnboarderOptions { mesh: IstioMesh::from_env(), ..Default::default() };
            let onboarder = build_onboarder(store, false, options).await?;
            let chart = onboarder.onboard_generated_service(&manifest, &project, &stage, &service, strategy).await?;
            let size = LocalTooling::from_env().package_chart(&chart)?.len();
            match cli.output {
                Output::Human => {
                    println!("stored {} ({} bytes) for {} in stage {}", chart.name(), size, service, stage);
                    for t in &chart.templates {
                        println!("  templates/{}", t.name);
                    }
                }
                Output::Json => {
                    let templates: Vec<&str> = chart.templates.iter().map(|t| t.name.as_str()).collect();
                    println!("{}", serde_json::json!({ "chart": chart.name(), "bytes": size, "templates": templates }));
                }
            }
        }
        Commands::Umbrella { project, stage } => {
            let members = UmbrellaChartManager::new(store).members(&project, &stage).await?;
            match cli.output {
                Output::Human => {
                    if members.is_empty() {
                        println!("no charts in umbrella of stage {}", stage);
                    }
                    for m in &members {
                        println!("{}", m);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&members)?),
            }
        }
    }
    Ok(())
}
