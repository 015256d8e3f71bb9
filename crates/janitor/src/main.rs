//! Keppel janitor binary: runs the maintenance loops and serves metrics.

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use clap::Parser;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use keppel_core::config::AppConfig;
use keppel_core::federation::new_federation_driver;
use keppel_core::{Auditor, LogAuditor, NullAuditor};
use keppel_janitor::{metrics, run_task_loop, HttpPeerClient, Janitor, TrivialScanner};
use keppel_metadata::repos::PeerRepo;
use keppel_processor::HttpReplicationClient;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Keppel - multi-tenant container image registry (janitor component)
#[derive(Parser, Debug)]
#[command(name = "keppel-janitor")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "KEPPEL_CONFIG", default_value = "config/keppel.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("keppel-janitor v{}", env!("CARGO_PKG_VERSION"));

    let mut figment = Figment::new();
    if std::path::Path::new(&args.config).exists() {
        tracing::info!(config_path = %args.config, "loading configuration from file");
        figment = figment.merge(Toml::file(&args.config));
    }
    let config: AppConfig = figment
        .merge(Env::prefixed("KEPPEL_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    metrics::register_metrics();

    let db = keppel_metadata::from_config(&config.database)
        .await
        .context("failed to initialize metadata store")?;
    let storage = keppel_storage::from_config(&config.storage)
        .await
        .context("failed to initialize storage")?;
    let federation_driver = new_federation_driver(&config.drivers.federation, &config)
        .context("failed to initialize federation driver")?;
    let auditor: Arc<dyn Auditor> = match config.drivers.audit.as_str() {
        "null" => Arc::new(NullAuditor),
        _ => Arc::new(LogAuditor),
    };

    // register statically configured peers
    for peer in &config.peers {
        db.ensure_peer(peer).await?;
    }

    let call_timeout = config.janitor.external_call_timeout();
    let replication_client = Arc::new(HttpReplicationClient::new(call_timeout)?);
    let peer_client = Arc::new(HttpPeerClient::new(call_timeout).map_err(anyhow::Error::msg)?);
    let our_hostname = config.api_public_hostname.clone();

    let janitor = Arc::new(Janitor::new(
        db,
        storage,
        federation_driver,
        Arc::new(TrivialScanner),
        auditor,
    ));

    let cancel = CancellationToken::new();
    let poll = config.janitor.poll_interval();
    let mut handles = Vec::new();

    {
        let j = janitor.clone();
        handles.push(tokio::spawn(run_task_loop(
            "blob_mount_sweep",
            poll,
            cancel.clone(),
            move || {
                let j = j.clone();
                async move { j.sweep_blob_mounts_in_next_repo().await }
            },
        )));
    }
    {
        let j = janitor.clone();
        handles.push(tokio::spawn(run_task_loop(
            "blob_sweep",
            poll,
            cancel.clone(),
            move || {
                let j = j.clone();
                async move { j.sweep_blobs_in_next_account().await }
            },
        )));
    }
    {
        let j = janitor.clone();
        handles.push(tokio::spawn(run_task_loop(
            "storage_sweep",
            poll,
            cancel.clone(),
            move || {
                let j = j.clone();
                async move { j.sweep_storage_in_next_account().await }
            },
        )));
    }
    {
        let j = janitor.clone();
        handles.push(tokio::spawn(run_task_loop(
            "manifest_validation",
            poll,
            cancel.clone(),
            move || {
                let j = j.clone();
                async move { j.validate_next_manifest().await }
            },
        )));
    }
    {
        let j = janitor.clone();
        handles.push(tokio::spawn(run_task_loop(
            "manifest_gc",
            poll,
            cancel.clone(),
            move || {
                let j = j.clone();
                async move { j.collect_garbage_in_next_repo().await }
            },
        )));
    }
    {
        let j = janitor.clone();
        handles.push(tokio::spawn(run_task_loop(
            "vuln_check",
            poll,
            cancel.clone(),
            move || {
                let j = j.clone();
                async move { j.check_vulnerabilities_for_next_manifest().await }
            },
        )));
    }
    {
        let j = janitor.clone();
        handles.push(tokio::spawn(run_task_loop(
            "federation_announcement",
            poll,
            cancel.clone(),
            move || {
                let j = j.clone();
                async move { j.announce_next_account_to_federation().await }
            },
        )));
    }
    {
        let j = janitor.clone();
        let client = replication_client.clone();
        handles.push(tokio::spawn(run_task_loop(
            "manifest_sync",
            poll,
            cancel.clone(),
            move || {
                let j = j.clone();
                let client = client.clone();
                async move { j.sync_manifests_in_next_repo(&*client).await }
            },
        )));
    }
    if !config.peers.is_empty() {
        let j = janitor.clone();
        let client = peer_client.clone();
        let hostname = our_hostname.clone();
        handles.push(tokio::spawn(run_task_loop(
            "peering",
            poll,
            cancel.clone(),
            move || {
                let j = j.clone();
                let client = client.clone();
                let hostname = hostname.clone();
                async move { j.issue_password_for_next_peer(&*client, &hostname).await }
            },
        )));
    }

    // metrics and health endpoint
    let app = Router::new()
        .route("/metrics", get(|| async { metrics::gather() }))
        .route("/healthz", get(|| async { "ok" }));
    let listener = tokio::net::TcpListener::bind(&config.janitor.listen)
        .await
        .with_context(|| format!("could not bind {}", config.janitor.listen))?;
    tracing::info!("serving metrics on {}", config.janitor.listen);

    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutting down");
    cancel.cancel();

    for handle in handles {
        let _ = handle.await;
    }
    server.await??;
    Ok(())
}
