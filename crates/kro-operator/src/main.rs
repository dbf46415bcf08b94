//! kro controller entry point

use anyhow::{Context, Result};
use clap::Parser;
use kro_operator::client::{ClientFactory, FIELD_MANAGER};
use kro_operator::config::KroConfig;
use kro_operator::crd::ResourceGraphDefinition;
use kro_operator::leader::{self, LeaderConfig};
use kro_operator::registry::ControllerRegistry;
use kro_operator::rgd_controller::{run_rgd_controller, RgdContext, RgdMetrics};
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;

/// kro: compose Kubernetes APIs from resource graphs
#[derive(Parser, Debug)]
#[command(name = "kro")]
#[command(about = "Kubernetes controller synthesizing APIs from ResourceGraphDefinitions")]
#[command(version)]
struct Args {
    /// Allow deleting a synthesized CRD that still has instances
    #[arg(long, env = "KRO_ALLOW_CRD_DELETION", default_value = "false")]
    allow_crd_deletion: bool,

    /// Sustained API request rate
    #[arg(long, env = "KRO_CLIENT_QPS", default_value = "100")]
    client_qps: u32,

    /// Burst allowance for API requests
    #[arg(long, env = "KRO_CLIENT_BURST", default_value = "150")]
    client_burst: u32,

    /// Enable Lease-based leader election
    #[arg(long, env = "KRO_ENABLE_LEADER_ELECTION", default_value = "false")]
    enable_leader_election: bool,

    /// Namespace for the leader-election Lease
    #[arg(long, env = "KRO_LEADER_ELECTION_NAMESPACE", default_value = "kro-system")]
    leader_election_namespace: String,

    /// Prometheus metrics address
    #[arg(long, env = "KRO_METRICS_BIND_ADDRESS", default_value = "0.0.0.0:8078")]
    metrics_bind_address: SocketAddr,

    /// Liveness/readiness probe address
    #[arg(long, env = "KRO_HEALTH_PROBE_BIND_ADDRESS", default_value = "0.0.0.0:8079")]
    health_probe_bind_address: SocketAddr,

    /// Workers for the ResourceGraphDefinition controller
    #[arg(long, env = "KRO_RGD_CONCURRENT_RECONCILES", default_value = "1")]
    resource_graph_definition_concurrent_reconciles: u16,

    /// Workers per dynamic controller
    #[arg(long, env = "KRO_DYNAMIC_CONCURRENT_RECONCILES", default_value = "1")]
    dynamic_controller_concurrent_reconciles: u16,

    /// Periodic instance resync, in seconds
    #[arg(long, env = "KRO_DYNAMIC_RESYNC_PERIOD", default_value = "36000")]
    dynamic_controller_default_resync_period: u64,

    /// Retry cap before an instance is marked Failed
    #[arg(long, env = "KRO_DYNAMIC_QUEUE_MAX_RETRIES", default_value = "20")]
    dynamic_controller_default_queue_max_retries: u32,

    /// Drain budget for dynamic controllers on shutdown, in seconds
    #[arg(long, env = "KRO_DYNAMIC_SHUTDOWN_TIMEOUT", default_value = "60")]
    dynamic_controller_default_shutdown_timeout: u64,

    /// Log verbosity, 0 (quietest) to 5 (loudest)
    #[arg(long, env = "KRO_LOG_LEVEL", default_value = "3")]
    log_level: u8,

    /// Enable JSON log format
    #[arg(long, env = "KRO_LOG_JSON", default_value = "false")]
    log_json: bool,

    /// Print the ResourceGraphDefinition CRD YAML and exit
    #[arg(long)]
    print_crd: bool,
}

impl Args {
    fn to_config(&self) -> KroConfig {
        KroConfig {
            allow_crd_deletion: self.allow_crd_deletion,
            client_qps: self.client_qps,
            client_burst: self.client_burst,
            rgd_concurrent_reconciles: self.resource_graph_definition_concurrent_reconciles,
            dynamic_concurrent_reconciles: self.dynamic_controller_concurrent_reconciles,
            dynamic_resync_period: self.dynamic_controller_default_resync_period,
            dynamic_queue_max_retries: self.dynamic_controller_default_queue_max_retries,
            dynamic_shutdown_timeout: self.dynamic_controller_default_shutdown_timeout,
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crd {
        print_crd()?;
        return Ok(());
    }

    init_logging(&args);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting kro controller"
    );

    let metrics_addr = args.metrics_bind_address;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_addr).await {
            error!(error = %e, "metrics server failed");
        }
    });

    let health_addr = args.health_probe_bind_address;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_addr).await {
            error!(error = %e, "health server failed");
        }
    });

    let kube_config = kube::Config::infer()
        .await
        .context("inferring Kubernetes client configuration")?;
    let client = Client::try_from(kube_config.clone())
        .context("building Kubernetes client")?;

    if args.enable_leader_election {
        let leader_config = LeaderConfig {
            namespace: args.leader_election_namespace.clone(),
            ..Default::default()
        };
        info!(namespace = %leader_config.namespace, "waiting for leadership");
        leader::acquire(&client, &leader_config)
            .await
            .context("acquiring leadership")?;

        let hold_client = client.clone();
        tokio::spawn(async move {
            let err = leader::hold(&hold_client, &leader_config).await;
            error!(error = %err, "leadership lost, exiting");
            std::process::exit(1);
        });
    }

    ensure_rgd_crd(&client)
        .await
        .context("registering the ResourceGraphDefinition CRD")?;

    let config = Arc::new(args.to_config());
    let factory = Arc::new(ClientFactory::new(kube_config, client, &config));
    let registry = ControllerRegistry::new();

    // one shutdown path for signals and Fatal reports from workers
    let fatal = Arc::new(tokio::sync::Notify::new());
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let fatal_listener = fatal.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown_signal() => {
                info!("shutdown signal received, draining controllers");
            }
            _ = fatal_listener.notified() => {
                error!("fatal error reported by a worker, draining controllers");
            }
        }
        let _ = shutdown_tx.send(true);
    });

    let ctx = Arc::new(RgdContext {
        factory,
        registry: registry.clone(),
        config: config.clone(),
        metrics: RgdMetrics::new(),
        error_counts: dashmap::DashMap::new(),
        fatal,
    });

    run_rgd_controller(ctx, shutdown_rx)
        .await
        .context("RGD controller failed")?;

    // RGD controller drained; stop every dynamic controller within budget
    registry.shutdown_all(config.shutdown_timeout()).await;
    info!("kro controller stopped");

    Ok(())
}

/// Map the numeric verbosity knob onto tracing levels.
fn level_for(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 | 3 => Level::INFO,
        4 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

fn init_logging(args: &Args) {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level_for(args.log_level))
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true);

    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "installing SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Server-side apply kro's own CRD so a bare cluster can run the operator
/// without a manifest step.
async fn ensure_rgd_crd(client: &Client) -> Result<()> {
    use kube::CustomResourceExt;
    let crd = ResourceGraphDefinition::crd();
    let api: Api<k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition> =
        Api::all(client.clone());
    api.patch(
        "resourcegraphdefinitions.kro.run",
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(&crd),
    )
    .await?;
    info!("ResourceGraphDefinition CRD is registered");
    Ok(())
}

/// Start the Prometheus metrics server
async fn start_metrics_server(addr: SocketAddr) -> Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    info!(address = %addr, "starting metrics server");

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("installing Prometheus exporter")?;

    std::future::pending::<()>().await;
    Ok(())
}

/// Start the liveness/readiness probe server
async fn start_health_server(addr: SocketAddr) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    info!(address = %addr, "starting health server");

    let listener = TcpListener::bind(addr)
        .await
        .context("binding health server")?;

    loop {
        let (mut socket, _) = listener.accept().await?;
        tokio::spawn(async move {
            let mut buf = [0; 1024];
            if socket.read(&mut buf).await.is_ok() {
                let response = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK";
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
    }
}

/// Print the RGD CRD YAML for installation
fn print_crd() -> Result<()> {
    use kube::CustomResourceExt;
    let crd = ResourceGraphDefinition::crd();
    let yaml = serde_yaml::to_string(&crd)?;
    println!("{}", yaml);
    Ok(())
}
