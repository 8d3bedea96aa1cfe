use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use console_api::kinds;
use console_api::{
    ApplicationsState, ApplicationsView, Detail, DetailView, InstancesView, ListView, SubscriptionManager, ViewHandle,
    ViewState,
};
use console_core::{ConsoleConfig, IndexedCollection, Resource, ViewContext};
use console_join::BS_NAME;
use console_kubehub::KubeDataService;
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "consolectl", version, about = "Console CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Project to scope calls to
    #[arg(long = "project", global = true)]
    project: Option<String>,

    /// Namespace override (defaults to the project)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover served resource kinds (incl. CRDs)
    Kinds,
    /// One-shot list of a resource kind, e.g. "applications"
    Ls { kind: String },
    /// Show one object and keep it live until Ctrl-C with --follow
    Get {
        kind: String,
        name: String,
        #[arg(long = "follow")]
        follow: bool,
    },
    /// Watch a resource kind and reprint on every change
    Watch { kind: String },
    /// Backing service instances with their owning backing service
    Instances {
        #[arg(long = "follow")]
        follow: bool,
    },
    /// Applications and the routes pointing at them
    Apps {
        #[arg(long = "follow")]
        follow: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("CONSOLE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics(cfg: &ConsoleConfig) {
    let Some(addr) = cfg.metrics_addr.as_deref() else { return };
    match addr.parse::<std::net::SocketAddr>() {
        Ok(sock) => match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock).install() {
            Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
            Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
        },
        Err(_) => tracing::warn!(addr = %addr, "invalid CONSOLE_METRICS_ADDR; expected host:port"),
    }
}

/// Age column text, coarsest two units. Unknown creation times render as `-`.
fn render_age(creation_ts: i64, now: DateTime<Utc>) -> String {
    let Some(created) = DateTime::from_timestamp(creation_ts, 0).filter(|_| creation_ts > 0) else {
        return "-".to_string();
    };
    let age = (now - created).max(chrono::Duration::zero());
    match (age.num_days(), age.num_hours() % 24, age.num_minutes() % 60) {
        (d, h, _) if d > 0 => format!("{d}d{h}h"),
        (_, h, m) if h > 0 => format!("{h}h{m}m"),
        (_, _, m) if m > 0 => format!("{m}m"),
        _ => format!("{}s", age.num_seconds()),
    }
}

/// Only instances carry the joined backing service label.
fn shows_backing_service(kind: &str) -> bool {
    kind == kinds::BACKING_SERVICE_INSTANCES
}

fn print_alerts<T>(st: &ViewState<T>) {
    for (name, alert) in st.alerts.iter() {
        match alert.details.as_deref() {
            Some(d) => eprintln!("[{:?}] {}: {} ({})", alert.kind, name, alert.message, d),
            None => eprintln!("[{:?}] {}: {}", alert.kind, name, alert.message),
        }
    }
}

fn print_collection(out: Output, items: &IndexedCollection, with_service: bool) -> Result<()> {
    match out {
        Output::Human => {
            if items.is_empty() { return Ok(()); }
            let now = Utc::now();
            if with_service {
                println!("{:<32} {:<24} AGE", "NAME", "BACKING SERVICE");
            } else {
                println!("{:<32} AGE", "NAME");
            }
            for (name, res) in items.iter() {
                let age = render_age(res.creation_ts(), now);
                if with_service {
                    println!("{:<32} {:<24} {}", name, res.derived(BS_NAME).unwrap_or("-"), age);
                } else {
                    println!("{:<32} {}", name, age);
                }
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(items)?),
    }
    Ok(())
}

fn print_list(out: Output, st: &ViewState<IndexedCollection>, with_service: bool) -> Result<()> {
    print_alerts(st);
    if st.data.is_empty() && out == Output::Human {
        println!("{}", st.empty_message);
    }
    print_collection(out, &st.data, with_service)
}

fn print_apps(out: Output, st: &ViewState<ApplicationsState>) -> Result<()> {
    print_alerts(st);
    match out {
        Output::Human => {
            if st.data.apps.is_empty() {
                println!("{}", st.empty_message);
            }
            let now = Utc::now();
            for (name, app) in st.data.apps.iter() {
                let routes = st.data.routes_by_app.get(name).map(|r| r.keys().collect::<Vec<_>>().join(",")).unwrap_or_default();
                println!("{:<32} {:<8} routes={}", name, render_age(app.creation_ts(), now), if routes.is_empty() { "-" } else { &routes });
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&st.data)?),
    }
    Ok(())
}

fn print_detail(out: Output, st: &ViewState<Detail>) -> Result<()> {
    print_alerts(st);
    match (out, st.data.resource.as_ref()) {
        (Output::Json, _) => println!("{}", serde_json::to_string_pretty(&st.data)?),
        (Output::Human, Some(res)) => print_resource(res)?,
        (Output::Human, None) => {}
    }
    Ok(())
}

/// One-shot listing. A failed list is reported and returned so the exit status is non-zero.
async fn ls(mgr: &SubscriptionManager, kind: &str, ctx: &ViewContext, out: Output) -> Result<()> {
    info!(kind = %kind, ns = ?ctx.scope(), "ls invoked");
    match mgr.list(kind, ctx).await {
        Ok(items) => print_collection(out, &items, shows_backing_service(kind)),
        Err(e) => {
            error!(error = %e, kind = %kind, "list failed");
            Err(anyhow::Error::new(e).context(format!("The {} list could not be loaded", kinds::label(kind))))
        }
    }
}

fn print_resource(res: &Resource) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&res.raw)?);
    for (k, v) in res.derived.iter() {
        println!("# {k}: {v}");
    }
    Ok(())
}

/// Render the first loaded state, then every later epoch when following.
async fn show<T, F>(state: &ViewHandle<T>, follow: bool, mut render: F) -> Result<()>
where
    F: FnMut(&ViewState<T>) -> Result<()>,
{
    let st = tokio::select! {
        st = state.wait_until(|s| s.loaded) => st,
        _ = signal::ctrl_c() => return Ok(()),
    };
    render(&st)?;
    if !follow {
        return Ok(());
    }
    let mut rx = state.subscribe_epoch();
    let _ = rx.borrow_and_update();
    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() { break; }
                println!("---");
                render(&state.current())?;
            }
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; shutting down");
                break;
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cfg = ConsoleConfig::from_env().context("reading CONSOLE_* configuration")?;
    init_metrics(&cfg);
    let cli = Cli::parse();

    let ctx = ViewContext { project: cli.project.clone(), namespace: cli.namespace.clone() };
    let svc = Arc::new(KubeDataService::try_default().await?);
    let mgr = SubscriptionManager::with_capacity(svc.clone(), cfg.queue_cap);

    match cli.command {
        Commands::Kinds => {
            let resources = console_kubehub::discover(svc.client()).await?;
            match cli.output {
                Output::Human => {
                    for r in resources {
                        let scope = if r.namespaced { "namespaced" } else { "cluster" };
                        println!("{:<28} {} • {}", r.plural, r.gvk_key(), scope);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&resources)?),
            }
        }
        Commands::Ls { kind } => ls(&mgr, &kind, &ctx, cli.output).await?,
        Commands::Get { kind, name, follow } => {
            let view = if kind == kinds::APPLICATIONS {
                DetailView::application(&mgr, &name, &ctx).await
            } else {
                DetailView::activate(&mgr, &kind, &name, &ctx).await
            };
            show(view.state(), follow, |st| print_detail(cli.output, st)).await?;
            view.teardown();
        }
        Commands::Watch { kind } => {
            let view = ListView::activate(&mgr, &kind, &ctx).await?;
            let with_service = shows_backing_service(&kind);
            show(view.state(), true, |st| print_list(cli.output, st, with_service)).await?;
            view.teardown();
        }
        Commands::Instances { follow } => {
            let view = InstancesView::activate(&mgr, &ctx, &cfg.catalog_namespace).await?;
            show(view.state(), follow, |st| print_list(cli.output, st, true)).await?;
            view.teardown();
        }
        Commands::Apps { follow } => {
            let view = ApplicationsView::activate(&mgr, &ctx, None).await?;
            show(view.state(), follow, |st| print_apps(cli.output, st)).await?;
            view.teardown();
        }
    }
    Ok(())
}
