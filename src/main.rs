use anyhow::{Context, Result};
use clap::Parser;
use paqet::cli::{Cli, Commands};
use paqet::config::{AppConfig, Role};
use paqet::{client, diag, forward, server, shutdown, socks};
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config } => run(&config).await,
        Commands::Status {
            config,
            pprof,
            json,
            timeout,
        } => status(&config, pprof.as_deref(), json, Duration::from_secs(timeout)).await,
    }
}

async fn run(config_path: &str) -> Result<()> {
    let cfg = AppConfig::load_from_file(config_path).context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(cfg.log.level.as_filter())
        .with_target(false)
        .init();
    info!("paqet v{}", env!("CARGO_PKG_VERSION"));

    let cancel = CancellationToken::new();
    shutdown::install_signal_handler(cancel.clone());
    initialize_diag(&cfg, &cancel);

    match cfg.role {
        Role::Client => run_client(cfg, cancel).await,
        Role::Server => {
            let srv = server::Server::new(cfg, cancel);
            srv.start().await.map_err(Into::into)
        }
    }
}

async fn run_client(cfg: AppConfig, cancel: CancellationToken) -> Result<()> {
    let forward_cfg = cfg.forward.clone();
    let socks_cfg = cfg.socks.clone();
    let client = client::Client::start(cfg, cancel.clone())?;

    let tracker = TaskTracker::new();
    for rule in &forward_cfg.tcp {
        let listen: SocketAddr = rule.listen.parse().context("invalid forward listen addr")?;
        let fwd = Arc::new(forward::Forward::new(
            client.clone(),
            listen,
            rule.target.clone(),
            cancel.clone(),
            tracker.clone(),
        ));
        tracker.spawn(async move {
            if let Err(e) = fwd.listen_tcp().await {
                error!("TCP forwarder exited: {}", e);
            }
        });
    }
    for rule in &forward_cfg.udp {
        let listen: SocketAddr = rule.listen.parse().context("invalid forward listen addr")?;
        let fwd = Arc::new(forward::Forward::new(
            client.clone(),
            listen,
            rule.target.clone(),
            cancel.clone(),
            tracker.clone(),
        ));
        tracker.spawn(async move { fwd.listen_udp().await });
    }
    if let Some(listen) = &socks_cfg.listen {
        let listen: SocketAddr = listen.parse().context("invalid socks listen addr")?;
        let srv = Arc::new(socks::SocksServer::new(
            client.clone(),
            listen,
            cancel.clone(),
            tracker.clone(),
        ));
        tracker.spawn(async move {
            if let Err(e) = srv.run().await {
                error!("SOCKS5 proxy exited: {}", e);
            }
        });
    }

    cancel.cancelled().await;
    let drained = shutdown::ShutdownWait::new(tracker)
        .wait(Duration::from_secs(10))
        .await;
    let client_drained = client.wait_shutdown(Duration::from_secs(10)).await;
    if !drained || !client_drained {
        error!("shutdown timed out waiting for tasks to drain");
    }
    Ok(())
}

fn initialize_diag(cfg: &AppConfig, cancel: &CancellationToken) {
    diag::enable(cfg.debug.diag);
    if !cfg.debug.diag {
        return;
    }

    let key_id = if cfg.transport.kcp.key.is_empty() {
        String::new()
    } else {
        // a short fingerprint of the shared secret, safe to display
        let sum = Sha256::digest(cfg.transport.kcp.key.as_bytes());
        sum[..8].iter().map(|b| format!("{:02x}", b)).collect()
    };
    diag::set_config(diag::ConfigInfo {
        role: cfg.role.to_string(),
        interface: cfg.network.interface.clone(),
        dscp: 46,
        ipv4_addr: cfg
            .network
            .ipv4
            .as_ref()
            .map(|g| g.addr.to_string())
            .unwrap_or_default(),
        ipv6_addr: cfg
            .network
            .ipv6
            .as_ref()
            .map(|g| g.addr.to_string())
            .unwrap_or_default(),
        server_addr: if cfg.role == Role::Client {
            cfg.server.addr.clone()
        } else {
            String::new()
        },
        listen_addr: if cfg.role == Role::Server {
            cfg.listen.addr.clone()
        } else {
            String::new()
        },
        pprof: cfg.debug.pprof.clone().unwrap_or_default(),
        guard: cfg.transport.kcp.guard_enabled(),
        conns: cfg.transport.conn,
        key_id,
    });

    if let Some(pprof) = &cfg.debug.pprof {
        if let Ok(addr) = pprof.parse::<SocketAddr>() {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = diag::http::serve(addr, cancel).await {
                    error!("diagnostics endpoint failed: {}", e);
                }
            });
        }
    }
}

async fn status(
    config_path: &str,
    pprof_override: Option<&str>,
    json: bool,
    timeout: Duration,
) -> Result<()> {
    let (addr, diag_enabled) = resolve_debug_addr(config_path, pprof_override)?;

    let path = if json {
        diag::http::STATUS_PATH
    } else {
        diag::http::TEXT_PATH
    };
    let body = diag::http::fetch(addr, path, timeout).await.map_err(|e| {
        if !diag_enabled {
            e.context("debug endpoints appear to be disabled; set debug.diag and debug.pprof in the config and restart")
        } else {
            e
        }
    })?;
    print!("{}", body);
    Ok(())
}

fn resolve_debug_addr(
    config_path: &str,
    pprof_override: Option<&str>,
) -> Result<(SocketAddr, bool)> {
    if let Some(pprof) = pprof_override {
        return Ok((pprof.parse().context("invalid --pprof address")?, true));
    }

    let mut addr = None;
    let mut diag_enabled = false;
    if std::path::Path::new(config_path).exists() {
        let cfg = AppConfig::load_from_file(config_path)?;
        addr = cfg.debug.pprof.clone();
        diag_enabled = cfg.debug.diag;
    }

    let addr = addr.unwrap_or_else(|| "127.0.0.1:6060".to_string());
    Ok((addr.parse().context("invalid debug address")?, diag_enabled))
}
