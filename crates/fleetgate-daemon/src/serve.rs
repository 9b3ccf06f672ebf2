//! `serve` subcommand: wires storage, both servers, and the daemons, then
//! runs until SIGTERM/SIGINT with a bounded drain.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use fleetgate_core::db::Db;
use fleetgate_core::fs::FsHandle;
use fleetgate_core::store::gateway::GatewayStore;
use fleetgate_core::store::operator::OperatorStore;
use fleetgate_core::store::users::UserStore;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use crate::api::{self, ApiState};
use crate::auth::LocalProvider;
use crate::daemons::{DaemonOptions, Daemons};
use crate::gateway::{self, GatewayState};
use crate::tls;

/// Outstanding requests get this long to finish once shutdown begins.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(60);

pub async fn run(data_dir: &Path, ui_port: u16, gateway_port: u16) -> Result<()> {
    let fs = FsHandle::new(data_dir).context("failed to load filesystem")?;
    let db = Db::open(&fs.config.db_file()).context("failed to load database")?;

    let gateway_store = Arc::new(GatewayStore::new(db.clone(), fs.clone()));
    let operator_store = Arc::new(OperatorStore::new(db.clone(), fs.clone()));
    let users = Arc::new(
        UserStore::new(db, fs.clone()).context("failed to load user storage (run auth-init)")?,
    );

    let auth_config = fs.auth.auth_config().context("failed to get auth config")?;
    if auth_config.auth_type != "local" {
        bail!(
            "no provider found with configured type `{}` (run auth-init)",
            auth_config.auth_type
        );
    }
    let provider = Arc::new(LocalProvider::new(Arc::clone(&users), &auth_config));

    let api_router = api::router(ApiState::new(
        Arc::clone(&operator_store),
        provider.clone(),
    ))
    .merge(provider.router());
    let gateway_router = gateway::router(GatewayState {
        store: gateway_store,
    });

    let tls_config = Arc::new(
        tls::load_server_config(&fs.certs).context("failed to load gateway TLS config")?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut daemons = Daemons::new(
        Arc::clone(&operator_store),
        Some(users),
        DaemonOptions::default(),
    );
    daemons.start();

    let api_listener = TcpListener::bind(("0.0.0.0", ui_port))
        .await
        .with_context(|| format!("failed to bind operator API port {ui_port}"))?;
    info!(server = "rest-api", addr = %api_listener.local_addr()?, "server started");
    let mut api_shutdown = shutdown_rx.clone();
    let api_task = tokio::spawn(async move {
        let result = axum::serve(
            api_listener,
            api_router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = api_shutdown.changed().await;
        })
        .await;
        if let Err(e) = result {
            error!(error = %e, "operator API server failed");
        }
    });

    let gateway_listener = TcpListener::bind(("0.0.0.0", gateway_port))
        .await
        .with_context(|| format!("failed to bind gateway port {gateway_port}"))?;
    info!(server = "gateway-api", addr = %gateway_listener.local_addr()?, "server started");
    let gateway_task = tokio::spawn(tls::serve_mtls(
        gateway_listener,
        tls_config,
        gateway_router,
        shutdown_rx,
    ));

    wait_for_signal().await;
    info!("shutting down");
    let _ = shutdown_tx.send(true);

    let drain = async {
        let _ = api_task.await;
        let _ = gateway_task.await;
    };
    if tokio::time::timeout(SHUTDOWN_DRAIN, drain).await.is_err() {
        error!("shutdown drain timed out; aborting remaining connections");
    }
    daemons.shutdown().await;
    Ok(())
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!(error = %e, "unable to install SIGTERM handler");
            // Fall back to ctrl-c only.
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = term.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}
