use anyhow::Context;
use clap::Parser;
use portgate::cli::Args;
use portgate::client::{ClientConfig, UpstreamClient};
use portgate::config::{locate_manifest, Config};
use portgate::error::{ExitStatus, Result};
use portgate::forward::{self, ForwardingSupervisor, KubectlForwarder};
use portgate::hosts;
use portgate::proxy::{service_url, ProxyServer};
use portgate::routes::RouteTable;
use portgate::shutdown::{LifecycleState, ShutdownCoordinator, ShutdownTrigger, SignalListener};
use portgate::tls;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

/// Everything resolved from the manifest before any channel starts
struct Prepared {
    manifest: PathBuf,
    config: Config,
    listen_addr: SocketAddr,
    routes: Arc<RouteTable>,
    client: UpstreamClient,
    tls_acceptor: Option<TlsAcceptor>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.log_directive())),
        )
        .init();

    let prepared = match prepare(&args) {
        Ok(prepared) => prepared,
        Err(e) => {
            error!(error = ?e, "Failed to load configuration");
            return ExitStatus::ConfigFailure.into();
        }
    };

    info!(path = %prepared.manifest.display(), "Configuration loaded");
    print_startup_banner(&prepared);

    let mut signals = match SignalListener::new() {
        Ok(signals) => Some(signals),
        Err(e) => {
            warn!(error = %e, "Failed to install signal handlers");
            None
        }
    };

    let supervisor = Arc::new(ForwardingSupervisor::new(
        KubectlForwarder::new(prepared.config.startup.kubectl.clone()),
        prepared.config.startup.shutdown_grace_period(),
    ));
    let coordinator = Arc::new(ShutdownCoordinator::new(Arc::clone(&supervisor)));

    let trigger = tokio::select! {
        result = start_and_serve(&prepared, &args, &supervisor, coordinator.subscribe()) => {
            match result {
                Ok(()) => ShutdownTrigger::Completed,
                Err(e) if e.exit_status() == ExitStatus::StartupFailure => {
                    ShutdownTrigger::StartupFailure(e.to_string())
                }
                Err(e) => ShutdownTrigger::RuntimeFailure(e.to_string()),
            }
        }
        name = next_signal(&mut signals) => ShutdownTrigger::Signal(name),
    };

    // Repeated signals during teardown join the shutdown already running
    if let Some(mut signals) = signals {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            loop {
                let name = signals.recv().await;
                coordinator.shutdown(ShutdownTrigger::Signal(name)).await;
            }
        });
    }

    let status = coordinator
        .shutdown(trigger.clone())
        .await
        .unwrap_or_else(|| trigger.exit_status());

    info!(code = status.code(), "Exiting");
    status.into()
}

/// Load the manifest and build everything that can fail as configuration
fn prepare(args: &Args) -> anyhow::Result<Prepared> {
    let cwd = std::env::current_dir().context("cannot determine working directory")?;
    let home = dirs_next::home_dir();
    let manifest = locate_manifest(args.manifest.clone(), &cwd, home.as_deref())?;

    let mut config = Config::load(&manifest)
        .with_context(|| format!("failed to load manifest {}", manifest.display()))?;
    args.apply(&mut config);

    let listen_addr = config.listen_addr()?;

    let routes = RouteTable::build(&config.services).map_err(|e| anyhow::anyhow!(e))?;

    let client = UpstreamClient::new(ClientConfig {
        insecure: config.insecure,
        request_timeout: config.request_timeout(),
    })
    .context("failed to build upstream TLS configuration")?;

    let hostnames = service_hostnames(&config);
    let tls_acceptor = tls::acceptor(&config.tls, &hostnames)?;

    Ok(Prepared {
        manifest,
        config,
        listen_addr,
        routes: Arc::new(routes),
        client,
        tls_acceptor,
    })
}

/// Start forwarding channels, update the hosts file, wait for readiness and
/// serve until the lifecycle leaves `Running`.
async fn start_and_serve(
    prepared: &Prepared,
    args: &Args,
    supervisor: &ForwardingSupervisor,
    shutdown_rx: watch::Receiver<LifecycleState>,
) -> Result<()> {
    let config = &prepared.config;
    let started = supervisor.start_all(&config.services)?;
    info!(count = started, "Forwarding channels started");

    let hostnames = service_hostnames(config);
    if args.no_hosts {
        info!("Hosts file changes disabled");
    } else {
        let added = hosts::ensure_mapped(hosts::system_path(), &hostnames)?;
        info!(added, "Hosts file entries checked");
    }

    let tls_enabled = prepared.tls_acceptor.is_some();
    for hostname in &hostnames {
        info!(
            url = %service_url(hostname, tls_enabled, prepared.listen_addr.port()),
            "Redirecting requests"
        );
    }

    if config.insecure {
        warn!("Certificate verification disabled for https upstreams");
    }

    forward::wait_ready(&config.services, &config.startup).await;

    let listener = ProxyServer::bind(prepared.listen_addr).await?;

    let mut server = ProxyServer::new(
        Arc::clone(&prepared.routes),
        prepared.client.clone(),
        shutdown_rx,
    );
    if let Some(acceptor) = prepared.tls_acceptor.clone() {
        server = server.with_tls(acceptor);
    }

    server.serve(listener).await
}

async fn next_signal(signals: &mut Option<SignalListener>) -> &'static str {
    match signals {
        Some(signals) => signals.recv().await,
        None => std::future::pending().await,
    }
}

fn service_hostnames(config: &Config) -> Vec<String> {
    config.services.iter().map(|s| s.name.clone()).collect()
}

fn print_startup_banner(prepared: &Prepared) {
    let config = &prepared.config;
    info!(
        listen = %prepared.listen_addr,
        tls = prepared.tls_acceptor.is_some(),
        insecure = config.insecure,
        request_timeout_secs = config.request_timeout_secs,
        "Proxy settings"
    );
    info!(
        readiness = ?config.startup.readiness,
        settle_delay_ms = config.startup.settle_delay_ms,
        probe_timeout_secs = config.startup.probe_timeout_secs,
        shutdown_grace_period_secs = config.startup.shutdown_grace_period_secs,
        kubectl = %config.startup.kubectl,
        "Startup settings"
    );
    info!(
        service_count = config.services.len(),
        routes = ?prepared.routes.hostnames().collect::<Vec<_>>(),
        "Configured services"
    );
    if prepared.routes.is_empty() {
        warn!("No services configured, every request will be answered with 502");
    }
}
