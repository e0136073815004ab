use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use keel_apply::{
    ApplyOutcome, ApplyRequest, DeleteOutcome, DiffReport, ReleaseConfig, ReleaseEngine, ReleaseSelector,
    ReleaseStatus, ResourceState,
};
use keel_core::{ChangeEntry, ModuleRef, ReleaseError};
use keel_kubehub::KubeCluster;
use keel_persist::SecretStore;
use keel_render::{load_values, ManifestDirRenderer};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Keel: apply modules to Kubernetes as tracked releases")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Release namespace; also holds the inventory record
    #[arg(short = 'n', long = "ns", global = true, env = "KEEL_NAMESPACE", default_value = "default")]
    namespace: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Args, Debug)]
struct ModuleArgs {
    /// Module directory of YAML/JSON manifests
    module: PathBuf,
    /// Module version recorded in the change history
    #[arg(long = "module-version")]
    module_version: Option<String>,
    /// YAML or JSON file with values substituted into `${...}` placeholders
    #[arg(short = 'f', long = "values")]
    values: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Render a module, apply it, prune what it no longer renders, record the change
    Apply {
        release: String,
        #[command(flatten)]
        module: ModuleArgs,
        /// Accept an empty render and prune everything the release tracks
        #[arg(long = "allow-empty", action = ArgAction::SetTrue)]
        allow_empty: bool,
        /// Take over objects labelled as owned by another release
        #[arg(long = "force", action = ArgAction::SetTrue)]
        force: bool,
        /// Leave stale resources in the cluster and stop tracking them
        #[arg(long = "no-prune", action = ArgAction::SetTrue)]
        no_prune: bool,
        /// Allow pruning Namespace objects
        #[arg(long = "prune-namespaces", action = ArgAction::SetTrue)]
        prune_namespaces: bool,
        /// Change entries kept in the inventory
        #[arg(long = "max-history")]
        max_history: Option<usize>,
    },
    /// Show what an apply would add, modify or orphan
    Diff {
        release: String,
        #[command(flatten)]
        module: ModuleArgs,
    },
    /// Delete every tracked resource, then the inventory record
    Delete {
        release: String,
        #[arg(long = "release-id")]
        release_id: Option<String>,
        /// Also delete tracked Namespace objects
        #[arg(long = "prune-namespaces", action = ArgAction::SetTrue)]
        prune_namespaces: bool,
    },
    /// Current change and per-resource state
    Status {
        release: String,
        #[arg(long = "release-id")]
        release_id: Option<String>,
    },
    /// Recorded changes, most recent first
    History {
        release: String,
        #[arg(long = "release-id")]
        release_id: Option<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEEL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
        }
    }
}

/// Token cancelled on the first Ctrl-C; in-flight calls are abandoned, nothing is rolled back.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling");
            child.cancel();
        }
    });
    token
}

async fn engine(namespace: &str, config: &ReleaseConfig) -> Result<ReleaseEngine> {
    let client = keel_kubehub::get_kube_client().await?;
    let cluster = Arc::new(KubeCluster::new(client.clone(), &config.field_manager));
    let store = Arc::new(SecretStore::new(client));
    let renderer = Arc::new(ManifestDirRenderer::new(namespace));
    Ok(ReleaseEngine::new(renderer, cluster, store))
}

fn request(release: &str, namespace: &str, args: &ModuleArgs) -> Result<ApplyRequest> {
    let name = args
        .module
        .file_name()
        .and_then(|n| n.to_str())
        .map(String::from)
        .with_context(|| format!("module path {} has no directory name", args.module.display()))?;
    Ok(ApplyRequest {
        release: ReleaseSelector::new(release, namespace),
        module: ModuleRef {
            name,
            path: args.module.to_string_lossy().into_owned(),
            version: args.module_version.clone(),
        },
        values: load_values(args.values.as_deref())?,
    })
}

/// First `n` bytes of `s`, or all of it when `n` is past the end or inside a character.
fn abbrev(s: &str, n: usize) -> &str {
    s.get(..n).unwrap_or(s)
}

fn short(change_id: &str) -> &str {
    abbrev(change_id, 12)
}

fn emit<T: Serialize>(output: Output, value: &T, human: impl FnOnce(&T)) -> Result<()> {
    match output {
        Output::Human => human(value),
        Output::Json => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

fn print_apply(out: &ApplyOutcome) {
    let verb = if out.first_apply { "installed" } else if out.unchanged { "unchanged" } else { "upgraded" };
    println!("release {}/{} {} (change {})", out.namespace, out.name, verb, short(&out.change_id));
    println!(
        "  applied {}, adopted {}, pruned {}, released {}",
        out.applied.len(),
        out.adopted.len(),
        out.pruned.len(),
        out.released.len()
    );
    for id in &out.adopted {
        println!("  adopted  {}", id);
    }
    for id in &out.pruned {
        println!("  pruned   {}", id);
    }
    for id in &out.released {
        println!("  released {}", id);
    }
}

fn print_diff(report: &DiffReport) {
    if !report.deployed {
        println!("release {}/{} is not deployed", report.namespace, report.name);
    } else if report.up_to_date {
        println!("release {}/{} is at change {}", report.namespace, report.name, short(&report.change_id));
    }
    for id in &report.added {
        println!("+ {}", id);
    }
    for m in &report.modified {
        println!("~ {} (adds {}, updates {}, removes {})", m.identity, m.summary.adds, m.summary.updates, m.summary.removes);
    }
    for e in &report.orphaned {
        println!("- {}", e.identity);
    }
    if !report.has_changes() {
        println!("no changes");
    }
}

fn print_delete(out: &DeleteOutcome) {
    println!("release {}/{} deleted", out.namespace, out.name);
    for id in &out.deleted {
        println!("  deleted  {}", id);
    }
    for id in &out.released {
        println!("  released {}", id);
    }
    if !out.already_gone.is_empty() {
        println!("  {} resource(s) were already gone", out.already_gone.len());
    }
}

fn print_status(status: &ReleaseStatus) {
    let m = &status.metadata;
    println!("release {}/{} module {} {}", m.namespace, m.name, m.module, status.module_version.as_deref().unwrap_or("-"));
    println!(
        "  change {}  applied {}  history {}",
        status.change_id.as_deref().map(short).unwrap_or("-"),
        status.last_applied.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into()),
        status.history
    );
    println!("{:<12} {:<48} STATE", "COMPONENT", "RESOURCE");
    for r in &status.resources {
        let state = match r.state {
            ResourceState::Live => "live",
            ResourceState::Terminating => "terminating",
            ResourceState::Missing => "missing",
        };
        println!("{:<12} {:<48} {}", r.entry.component, r.entry.identity.to_string(), state);
    }
}

#[allow(clippy::ptr_arg)]
fn print_history(history: &Vec<ChangeEntry>) {
    println!("{:<14} {:<26} {:<20} {:<10} RESOURCES", "CHANGE", "TIMESTAMP", "DIGEST", "VERSION");
    for c in history {
        println!(
            "{:<14} {:<26} {:<20} {:<10} {}",
            short(&c.change_id),
            c.timestamp.to_rfc3339(),
            abbrev(&c.digest, 19),
            c.source.module.version.as_deref().unwrap_or("-"),
            c.entries.len()
        );
    }
}

async fn run(cli: Cli, cancel: &CancellationToken) -> Result<()> {
    let ns = cli.namespace.as_str();
    let mut config = ReleaseConfig::from_env();
    match cli.command {
        Commands::Apply { release, module, allow_empty, force, no_prune, prune_namespaces, max_history } => {
            config.allow_empty = allow_empty;
            config.force = force;
            config.prune = config.prune && !no_prune;
            config.prune_namespaces |= prune_namespaces;
            if let Some(n) = max_history {
                config.max_history = n.max(1);
            }
            let req = request(&release, ns, &module)?;
            info!(release = %release, ns = %ns, module = %req.module.path, "apply invoked");
            let out = engine(ns, &config).await?.apply_release(&req, &config, cancel).await?;
            emit(cli.output, &out, print_apply)
        }
        Commands::Diff { release, module } => {
            let req = request(&release, ns, &module)?;
            info!(release = %release, ns = %ns, "diff invoked");
            let report = engine(ns, &config).await?.diff_release(&req, &config, cancel).await?;
            emit(cli.output, &report, print_diff)
        }
        Commands::Delete { release, release_id, prune_namespaces } => {
            config.prune_namespaces |= prune_namespaces;
            let sel = ReleaseSelector::new(&release, ns).with_release_id(release_id);
            info!(release = %release, ns = %ns, "delete invoked");
            let out = engine(ns, &config).await?.delete_release(&sel, &config, cancel).await?;
            emit(cli.output, &out, print_delete)
        }
        Commands::Status { release, release_id } => {
            let sel = ReleaseSelector::new(&release, ns).with_release_id(release_id);
            let status = engine(ns, &config).await?.status_release(&sel, &config, cancel).await?;
            emit(cli.output, &status, print_status)
        }
        Commands::History { release, release_id } => {
            let sel = ReleaseSelector::new(&release, ns).with_release_id(release_id);
            let history = engine(ns, &config).await?.release_history(&sel, cancel).await?;
            emit(cli.output, &history, print_history)
        }
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cancel = cancel_on_ctrl_c();

    if let Err(e) = run(cli, &cancel).await {
        let code = e.downcast_ref::<ReleaseError>().map(ReleaseError::exit_code).unwrap_or(1);
        eprintln!("error: {:#}", e);
        std::process::exit(code);
    }
}
