use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use rigger_api::{spawn_worker, Dispatcher, KubeDeployer, SharedToken, WorkerStatus};
use rigger_apply::{ReconcileReport, Reconciler, NAMESPACE_PARAM};
use rigger_core::{AppDef, ConditionStatus, NameValue};
use rigger_kubehub::KubeResourceApi;
use rigger_ops::RetryPolicy;
use tokio::signal;
use tracing::{error, info, warn};

const AVAILABLE: &str = "Available";

#[derive(Parser, Debug)]
#[command(name = "riggerctl", version, about = "Rigger CLI")]
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
    /// Deploy every component of an app definition
    Apply {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        /// Directory holding `<component>.yaml` manifests (default: the definition's appDir)
        #[arg(long = "manifests")]
        manifests: Option<PathBuf>,
        /// Write the definition back with its status and without literal secrets
        #[arg(long = "write-back", action = ArgAction::SetTrue)]
        write_back: bool,
    },
    /// Remove every component of an app definition, last first
    Delete {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        #[arg(long = "manifests")]
        manifests: Option<PathBuf>,
    },
    /// Create-if-absent / delete-if-present for raw multi-document YAML
    Resources {
        #[command(subcommand)]
        action: ResourcesAction,
    },
    /// Write a copy of a definition with literal secrets stripped
    Snapshot {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        #[arg(long = "out")]
        out: PathBuf,
    },
    /// Inspect secrets of a definition
    Secret {
        #[command(subcommand)]
        action: SecretAction,
    },
}

#[derive(Subcommand, Debug)]
enum ResourcesAction {
    Apply {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        /// Namespace for documents that omit one
        #[arg(long = "ns")]
        namespace: Option<String>,
    },
    Delete {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        #[arg(long = "ns")]
        namespace: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum SecretAction {
    /// Check that a secret resolves
    Get {
        name: String,
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        /// Print the resolved value
        #[arg(long = "show", action = ArgAction::SetTrue)]
        show: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("RIGGER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("RIGGER_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid RIGGER_METRICS_ADDR; expected host:port");
        }
    }
}

async fn reconciler() -> Result<Reconciler> {
    let api = KubeResourceApi::connect().await?;
    Ok(Reconciler::new(Arc::new(api)))
}

fn deployer(reconciler: Reconciler, manifests: Option<PathBuf>) -> KubeDeployer {
    let d = KubeDeployer::new(reconciler, RetryPolicy::from_env());
    match manifests {
        Some(dir) => d.with_manifest_dir(dir),
        None => d,
    }
}

fn print_report(output: Output, verb: &str, report: &ReconcileReport) -> Result<()> {
    match output {
        Output::Human => println!("{}: created={} deleted={} skipped={}", verb, report.created, report.deleted, report.skipped),
        Output::Json => println!("{}", serde_json::to_string_pretty(report)?),
    }
    Ok(())
}

async fn run_apply(output: Output, file: &Path, manifests: Option<PathBuf>, write_back: bool) -> Result<()> {
    let def = AppDef::load(file)?;
    info!(deployment = %def.name(), components = def.spec.components.len(), "loaded app definition");
    let handler = Arc::new(deployer(reconciler().await?, manifests));
    let (dispatcher, rx) = Dispatcher::new(def.clone(), Arc::new(SharedToken::new()));
    let mut worker = spawn_worker(rx, handler);

    let accepted = dispatcher.create_deployment(def).await?;
    let status: WorkerStatus = tokio::select! {
        s = worker.wait_for(1) => s.ok_or_else(|| anyhow!("deployment worker exited before finishing"))?,
        _ = signal::ctrl_c() => {
            warn!("interrupted; in-flight deployment abandoned");
            return Err(anyhow!("interrupted"));
        }
    };
    drop(dispatcher);
    worker.join().await?;

    let outcome = status.last.ok_or_else(|| anyhow!("deployment finished without an outcome"))?;
    match output {
        Output::Human => match &outcome.error {
            None => println!("deployed {} in {}ms", outcome.name, outcome.elapsed_ms),
            Some(e) => println!("deployment {} failed after {}ms: {}", outcome.name, outcome.elapsed_ms, e),
        },
        Output::Json => println!("{}", serde_json::to_string_pretty(&outcome)?),
    }

    if write_back {
        let mut snap = accepted;
        match &outcome.error {
            None => snap.set_condition(AVAILABLE, ConditionStatus::True, "Deployed", "all components applied"),
            Some(e) => snap.set_condition(AVAILABLE, ConditionStatus::False, "DeploymentFailed", e),
        }
        snap.write_snapshot(file)?;
    }
    match outcome.error {
        None => Ok(()),
        Some(e) => Err(anyhow!(e)),
    }
}

async fn run_delete(output: Output, file: &Path, manifests: Option<PathBuf>) -> Result<()> {
    let def = AppDef::load(file)?;
    let report = deployer(reconciler().await?, manifests).teardown(&def).await?;
    print_report(output, "deleted", &report)
}

fn ns_params(namespace: Option<String>) -> Vec<NameValue> {
    namespace.map(|ns| vec![NameValue::new(NAMESPACE_PARAM, ns)]).unwrap_or_default()
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let res = match cli.command {
        Commands::Apply { file, manifests, write_back } => run_apply(cli.output, &file, manifests, write_back).await,
        Commands::Delete { file, manifests } => run_delete(cli.output, &file, manifests).await,
        Commands::Resources { action } => match action {
            ResourcesAction::Apply { file, namespace } => {
                let report = reconciler().await?.apply_file(&file, &ns_params(namespace)).await?;
                print_report(cli.output, "applied", &report)
            }
            ResourcesAction::Delete { file, namespace } => {
                let report = reconciler().await?.delete_file(&file, &ns_params(namespace)).await?;
                print_report(cli.output, "deleted", &report)
            }
        },
        Commands::Snapshot { file, out } => {
            let def = AppDef::load(&file)?;
            def.write_snapshot(&out)?;
            match cli.output {
                Output::Human => println!("wrote {}", out.display()),
                Output::Json => println!("{}", serde_json::json!({ "path": out.display().to_string() })),
            }
            Ok(())
        }
        Commands::Secret { action: SecretAction::Get { name, file, show } } => {
            let def = AppDef::load(&file)?;
            let value = def.get_secret(&name).with_context(|| format!("resolving secret {}", name))?;
            match cli.output {
                Output::Human if show => println!("{}", value),
                Output::Human => println!("secret {} resolves ({} chars)", name, value.chars().count()),
                Output::Json => {
                    let mut out = serde_json::json!({ "name": name, "resolved": !value.is_empty() });
                    if show {
                        out["value"] = serde_json::Value::String(value);
                    }
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
            }
            Ok(())
        }
    };
    if let Err(e) = &res {
        error!(error = %format!("{:#}", e), "command failed");
    }
    res
}
