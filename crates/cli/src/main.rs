use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use kanso_core::{EventSink, ResourceKind, SecretIndex, Settings, TenantResolver};
use kanso_dispatch::{Dispatcher, DispatcherConfig, Normalizer};
use kanso_kubehub::{start_notifier, start_secret_watcher, Cluster, KubeCluster, NamespaceCache};
use kanso_persist::SqliteStore;
use kanso_reconcile::{spawn_sweeper, Reconciler, ReconcilerConfig, StoreSecretIndex};
use kanso_schema::{
    GitOpsDeployment, GitOpsDeploymentManagedEnvironment, GitOpsDeploymentRepositoryCredential, GitOpsDeploymentSyncRun,
};

#[derive(Parser, Debug)]
#[command(name = "kansoctl", version, about = "Kanso managed-GitOps control plane")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// SQLite database path
    #[arg(long = "db", global = true, env = "KANSO_DB_PATH")]
    db_path: Option<String>,

    /// Namespace owned by the sync engine
    #[arg(long = "engine-namespace", global = true, env = "KANSO_ENGINE_NAMESPACE")]
    engine_namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the control plane until interrupted
    Run {
        /// Only watch this namespace (default: all)
        #[arg(long = "watch-ns", env = "KANSO_WATCH_NAMESPACE")]
        watch_namespace: Option<String>,
        /// Concurrent reconciliation workers
        #[arg(long = "workers", env = "KANSO_MAX_WORKERS")]
        workers: Option<usize>,
    },
    /// Print the CustomResourceDefinitions as YAML
    Crds,
    /// List API object to database entity mappings
    Mappings,
    /// Finish cleanup of entities whose API objects are gone, then exit
    Sweep,
}

fn init_tracing() {
    let env = std::env::var("KANSO_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics(addr: Option<&str>) {
    let Some(addr) = addr else { return };
    match addr.parse::<std::net::SocketAddr>() {
        Ok(sock) => match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock).install() {
            Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
            Err(e) => warn!(error = %e, "failed to install metrics exporter"),
        },
        Err(_) => warn!(addr = %addr, "invalid KANSO_METRICS_ADDR; expected host:port"),
    }
}

fn settings(cli: &Cli) -> Settings {
    let mut s = Settings::from_env();
    if let Some(p) = &cli.db_path {
        s.db_path = p.clone();
    }
    if let Some(ns) = &cli.engine_namespace {
        s.engine_namespace = ns.clone();
    }
    s
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut settings = settings(&cli);

    match cli.command {
        Commands::Crds => {
            print!("{}", kanso_schema::crds_yaml()?);
        }
        Commands::Mappings => {
            let store = SqliteStore::open(&settings.db_path)?;
            let mappings = store.list_mappings()?;
            match cli.output {
                Output::Human => {
                    for m in &mappings {
                        println!(
                            "{}/{} • {} • {} {}",
                            m.namespace, m.name, m.api_resource_type, m.db_relation_type, m.db_relation_key
                        );
                    }
                    if mappings.is_empty() {
                        println!("no mappings");
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&mappings)?),
            }
        }
        Commands::Sweep => {
            let store = Arc::new(SqliteStore::open(&settings.db_path)?);
            let cluster: Arc<dyn Cluster> = Arc::new(KubeCluster::try_default().await?);
            let reconciler = Reconciler::new(store, cluster, ReconcilerConfig::from_settings(&settings));
            let n = reconciler.sweep().await?;
            match cli.output {
                Output::Human => println!("purged {n} entities"),
                Output::Json => println!("{}", serde_json::json!({ "purged": n })),
            }
        }
        Commands::Run { watch_namespace, workers } => {
            if watch_namespace.is_some() {
                settings.watch_namespace = watch_namespace;
            }
            if let Some(w) = workers {
                settings.max_workers = w.max(1);
            }
            init_metrics(settings.metrics_addr.as_deref());
            run(settings).await?;
        }
    }
    Ok(())
}

async fn run(settings: Settings) -> Result<()> {
    info!(db = %settings.db_path, engine_ns = %settings.engine_namespace, watch_ns = ?settings.watch_namespace, "starting control plane");
    let store = Arc::new(SqliteStore::open(&settings.db_path)?);
    let kube = KubeCluster::try_default().await?;
    let client = kube.client();
    let cluster: Arc<dyn Cluster> = Arc::new(kube);
    let tenants: Arc<dyn TenantResolver> = Arc::new(NamespaceCache::start(client.clone()).await?);

    let reconciler = Arc::new(Reconciler::new(store.clone(), cluster, ReconcilerConfig::from_settings(&settings)));
    let dispatcher = Dispatcher::new(DispatcherConfig::from_settings(&settings), reconciler.clone());
    let sink: Arc<dyn EventSink> = Arc::new(Normalizer::new(tenants, dispatcher.clone()));
    let index: Arc<dyn SecretIndex> = Arc::new(StoreSecretIndex::new(store));

    let ns = settings.watch_namespace.clone();
    let mut watchers = vec![
        tokio::spawn(start_notifier::<GitOpsDeployment>(client.clone(), ResourceKind::Deployment, ns.clone(), sink.clone())),
        tokio::spawn(start_notifier::<GitOpsDeploymentManagedEnvironment>(
            client.clone(),
            ResourceKind::ManagedEnvironment,
            ns.clone(),
            sink.clone(),
        )),
        tokio::spawn(start_notifier::<GitOpsDeploymentRepositoryCredential>(
            client.clone(),
            ResourceKind::RepositoryCredential,
            ns.clone(),
            sink.clone(),
        )),
        tokio::spawn(start_notifier::<GitOpsDeploymentSyncRun>(client.clone(), ResourceKind::SyncRun, ns.clone(), sink.clone())),
    ];
    watchers.push(tokio::spawn(start_secret_watcher(client, ns, index, sink)));

    let cancel = CancellationToken::new();
    let sweeper = spawn_sweeper(reconciler, Duration::from_secs(settings.gc_interval_secs), cancel.clone());

    signal::ctrl_c().await?;
    info!("interrupt received; shutting down");
    for w in &watchers {
        w.abort();
    }
    cancel.cancel();
    dispatcher.shutdown().await;
    if let Err(e) = sweeper.await {
        error!(error = %e, "sweeper task failed");
    }
    let dead = dispatcher.dead_letters();
    if !dead.is_empty() {
        warn!(count = dead.len(), "events dead-lettered during this run");
    }
    info!("stopped");
    Ok(())
}
