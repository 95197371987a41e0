use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{sync::watch, task::JoinSet};

use crate::ktunnel::{
    admin, config, logging, net, telemetry,
    tunnel::{
        exposed::{ExposedOptions, ExposedServer},
        protected::{ProtectedHost, ProtectedOptions},
        tls,
    },
};

pub async fn run(config_path: Option<PathBuf>, overrides: config::Overrides) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let created = config::ensure_config_file(&resolved.path)?;

    let cfg = config::load_config_with(&resolved.path, &overrides)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    if created {
        tracing::warn!(
            path = %resolved.path.display(),
            source = %resolved.source,
            "config: created new config file"
        );
    }

    let role = if cfg.is_exposed() { "exposed" } else { "protected" };
    tracing::info!(
        config = %resolved.path.display(),
        role,
        listen_addr = %cfg.tunnel.listen_addr,
        max_tunnels = cfg.tunnel.max_tunnels,
        admin_addr = %cfg.admin_addr,
        "ktunnel: starting"
    );

    let prom = Arc::new(telemetry::init_prometheus()?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    let registry = if cfg.is_exposed() {
        let acceptor = tls::acceptor(&cfg.tls.cert_file, &cfg.tls.key_file)?;
        let server = Arc::new(ExposedServer::new(exposed_options(&cfg)));
        let registry = server.registry();

        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { server.listen_and_serve(acceptor, shutdown).await });
        registry
    } else {
        let connector = tls::connector(cfg.tls.insecure_skip_verify, &cfg.tls.ca_file)?;
        let host = Arc::new(ProtectedHost::new(protected_options(&cfg))?);
        let registry = host.registry();
        tracing::info!(exposed = %cfg.exposed_addr(), "protected: connecting to exposed host");

        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { host.run(connector, shutdown).await });
        registry
    };

    if !cfg.admin_addr.is_empty() {
        let admin_addr = net::normalize_bind_addr(&cfg.admin_addr);
        let addr: SocketAddr = admin_addr
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;

        let admin_state = admin::AdminState {
            prom: prom.clone(),
            role,
            registry,
        };

        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, admin_state, shutdown).await });
    }

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or unexpected task termination.
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        let _ = shutdown_tx.send(true);
                        return Err(err);
                    }
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }
    let _ = shutdown_tx.send(true);

    // Drain tasks: exit as soon as they complete; only enforce a timeout if something hangs.
    let drain = async { while tasks.join_next().await.is_some() {} };

    let drain_timeout = Duration::from_secs(5);
    if tokio::time::timeout(drain_timeout, drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

fn exposed_options(cfg: &config::Config) -> ExposedOptions {
    let t = &cfg.tunnel;
    ExposedOptions {
        listen_addr: t.listen_addr.clone(),
        forward_addr: t.forward_addr.clone(),
        target: t.target.clone(),
        secrets: t.secrets.clone(),
        max_tunnels: t.max_tunnels,
        timeout: t.timeout,
        connect_timeout: t.connect_timeout,
        ping_interval: t.ping_interval,
    }
}

fn protected_options(cfg: &config::Config) -> ProtectedOptions {
    let t = &cfg.tunnel;
    ProtectedOptions {
        exposed_addr: cfg.exposed_addr(),
        server_name: cfg.tls.server_name.clone(),
        // Only the first secret is used to log in.
        secret: t.secrets.first().cloned().unwrap_or_default(),
        max_tunnels: t.max_tunnels,
        timeout: t.timeout,
        connect_timeout: t.connect_timeout,
        ping_interval: t.ping_interval,
    }
}

async fn shutdown_signal() {
    // Ctrl-C works cross-platform.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
