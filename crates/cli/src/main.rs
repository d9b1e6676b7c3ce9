#![forbid(unsafe_code)]

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use kmirror_core::{LabelSelector, ListOptions, MirrorConfig, ObjectKey};
use kmirror_informer::{ResourceEventHandler, SharedInformer};
use kmirror_kubehub::KubeSource;
use kube::core::DynamicObject;
use kube::ResourceExt;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kmirrorctl", version, about = "Mirror a Kubernetes kind in memory and print it")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Label selector, e.g. "app=web,tier in (a,b),!legacy"
    #[arg(short = 'l', long = "selector", global = true)]
    selector: Option<String>,

    /// Field selector passed through to the API server
    #[arg(long = "fields", global = true)]
    fields: Option<String>,

    /// Full resync period in seconds (0 disables; overrides KMIRROR_RESYNC_SECS)
    #[arg(long = "resync-secs", global = true)]
    resync_secs: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Wait for the initial sync and print the mirrored objects
    Ls {
        /// GVK key, e.g. "v1/ConfigMap" or "cert-manager.io/v1/Certificate"
        gvk: String,
    },
    /// Stream +/~/- lines for changes until Ctrl-C
    Watch {
        /// GVK key, e.g. "v1/ConfigMap" or "cert-manager.io/v1/Certificate"
        gvk: String,
    },
}

fn init_tracing() {
    let env = std::env::var("KMIRROR_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KMIRROR_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KMIRROR_METRICS_ADDR; expected host:port");
        }
    }
}

fn key_of(obj: &DynamicObject) -> String {
    ObjectKey::for_object(obj).map(|k| k.to_string()).unwrap_or_else(|_| obj.name_any())
}

fn rv_of(obj: &DynamicObject) -> String { obj.resource_version().unwrap_or_default() }

/// Prints each notification as a line on stdout.
struct Printer {
    output: Output,
}

impl Printer {
    fn emit(&self, kind: &str, obj: &DynamicObject, human: String) {
        match self.output {
            Output::Human => println!("{}", human),
            Output::Json => println!("{}", serde_json::json!({ "type": kind, "object": obj })),
        }
    }
}

#[async_trait]
impl ResourceEventHandler<DynamicObject> for Printer {
    async fn on_add(&self, obj: Arc<DynamicObject>) -> anyhow::Result<()> {
        self.emit("add", &obj, format!("+ {} ({})", key_of(&obj), rv_of(&obj)));
        Ok(())
    }

    async fn on_update(&self, old: Arc<DynamicObject>, new: Arc<DynamicObject>) -> anyhow::Result<()> {
        self.emit("update", &new, format!("~ {} ({} -> {})", key_of(&new), rv_of(&old), rv_of(&new)));
        Ok(())
    }

    async fn on_delete(&self, obj: Arc<DynamicObject>, final_state_unknown: bool) -> anyhow::Result<()> {
        let note = if final_state_unknown { " (missed; last known state)" } else { "" };
        self.emit("delete", &obj, format!("- {}{}", key_of(&obj), note));
        Ok(())
    }
}

/// Keeps the pipeline connected without printing anything.
struct Hold;

#[async_trait]
impl ResourceEventHandler<DynamicObject> for Hold {
    async fn on_add(&self, _obj: Arc<DynamicObject>) -> anyhow::Result<()> { Ok(()) }
    async fn on_update(&self, _old: Arc<DynamicObject>, _new: Arc<DynamicObject>) -> anyhow::Result<()> { Ok(()) }
    async fn on_delete(&self, _obj: Arc<DynamicObject>, _fsu: bool) -> anyhow::Result<()> { Ok(()) }
}

type Informer = SharedInformer<DynamicObject, KubeSource<DynamicObject>>;

async fn build_informer(cli: &Cli, gvk: &str) -> Result<Informer> {
    let client = kube::Client::try_default().await.context("kube client")?;
    let (source, namespaced) = KubeSource::for_gvk(client, gvk).await?;

    let mut options = ListOptions::default();
    match cli.namespace.as_deref() {
        Some(ns) if namespaced => options = options.namespace(ns),
        Some(ns) => warn!(gvk = %gvk, ns = %ns, "kind is cluster-scoped; ignoring --ns"),
        None => {}
    }
    if let Some(sel) = cli.selector.as_deref() {
        let sel = LabelSelector::from_str(sel)?;
        options = options.labels(&sel);
    }
    if let Some(fields) = cli.fields.as_deref() {
        options = options.fields(fields);
    }

    let mut config = MirrorConfig::from_env();
    if let Some(secs) = cli.resync_secs {
        config = config.with_resync(Duration::from_secs(secs));
    }
    info!(gvk = %gvk, ns = ?options.namespace, labels = ?options.label_selector, namespaced, "mirroring");
    Ok(SharedInformer::new(Arc::new(source), options, config))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Ls { gvk } => {
            let informer = build_informer(&cli, gvk).await?;
            let sub = informer.subscribe(Hold).await?;
            tokio::select! {
                r = informer.wait_for_sync() => r?,
                _ = signal::ctrl_c() => {
                    info!("Ctrl-C received before sync");
                    informer.shutdown().await;
                    return Ok(());
                }
            }
            let mut items = informer.lister().list();
            items.sort_by_key(|o| key_of(o));
            match cli.output {
                Output::Human => {
                    for o in items.iter() {
                        println!("{}  {}", key_of(o), rv_of(o));
                    }
                    eprintln!("{} objects @ rv {}", items.len(), informer.last_sync_resource_version().unwrap_or_default());
                }
                Output::Json => {
                    let objs: Vec<&DynamicObject> = items.iter().map(|o| o.as_ref()).collect();
                    println!("{}", serde_json::to_string_pretty(&objs)?);
                }
            }
            sub.unsubscribe().await;
            informer.shutdown().await;
        }
        Commands::Watch { gvk } => {
            let informer = build_informer(&cli, gvk).await?;
            let sub = informer.subscribe(Printer { output: cli.output }).await?;
            signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            info!("Ctrl-C received; shutting down");
            sub.unsubscribe().await;
            informer.shutdown().await;
        }
    }
    Ok(())
}
