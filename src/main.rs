use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser as _;
use tokio::sync::watch;
use tracing::{info, warn};

use natsgate::config::Config;
use natsgate::identity::watch::{KubeProfileSource, ServiceAccountWatcher, WatchConfig};
use natsgate::identity::IdentityCache;
use natsgate::keyset::{KeySetResolver, RefreshOutcome};
use natsgate::service::creds::load_signing_key;
use natsgate::service::{AuthCalloutService, Authorizer};
use natsgate::token::TokenValidator;

fn init_tracing(config: &Config) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_new(&config.log_level)
        .with_context(|| format!("invalid log level {:?}", config.log_level))?;
    if config.log_json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    init_tracing(&config)?;
    info!(version = env!("CARGO_PKG_VERSION"), "starting natsgate");

    // Misconfiguration is fatal before we touch the network.
    let key_set_source = config.key_set_source()?;
    let signing_key = Arc::new(
        load_signing_key(&config.broker_credentials_file)
            .context("loading response signing key")?,
    );

    let resolver = Arc::new(KeySetResolver::new(
        key_set_source,
        config.keyset_min_refresh_gap,
        config.keyset_fetch_timeout,
    ));
    if resolver.prime().await != RefreshOutcome::Refreshed {
        warn!("initial key set fetch failed; token validation will retry on demand");
    }

    let kube_client = kube::Client::try_default()
        .await
        .context("building platform client")?;

    let mut cache = IdentityCache::new();
    if config.cache_read_through {
        cache = cache.with_source(Arc::new(KubeProfileSource::new(
            kube_client.clone(),
            config.cache_annotation_prefix.clone(),
        )));
    }
    let cache = Arc::new(cache);

    let validator = Arc::new(TokenValidator::new(
        Arc::clone(&resolver),
        config.issuer_expected_issuer.clone(),
        config.issuer_expected_audience.clone(),
    ));
    let authorizer = Arc::new(Authorizer::new(
        validator,
        Arc::clone(&cache),
        Arc::clone(&signing_key),
        config.broker_account.clone(),
        config.token_ttl,
    ));

    let service = Arc::new(
        AuthCalloutService::connect(&config.broker_url, &signing_key, authorizer)
            .await
            .context("connecting to broker")?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let watcher = ServiceAccountWatcher::new(
        kube_client,
        Arc::clone(&cache),
        WatchConfig {
            namespace: config.watch_namespace(),
            annotation_prefix: config.cache_annotation_prefix.clone(),
            reconcile_interval: config.cache_cleanup_interval,
        },
    );
    let watch_task = tokio::spawn(watcher.run(shutdown_rx.clone()));
    let refresh_task = tokio::spawn(
        Arc::clone(&resolver).run(config.keyset_refresh_interval, shutdown_rx.clone()),
    );
    tokio::spawn(shutdown_signal(shutdown_tx.clone()));

    let result = service.run(shutdown_rx).await;

    // If the service loop ended on its own, take the background tasks down too.
    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(watch_task, refresh_task);
    info!("shutdown complete");
    result
}

#[cfg(unix)]
async fn shutdown_signal(shutdown: watch::Sender<bool>) {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
                _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
            }
        }
        Err(err) => {
            warn!(error = %err, "cannot install SIGTERM handler, falling back to ctrl-c");
            let _ = tokio::signal::ctrl_c().await;
            info!("interrupt received, shutting down");
        }
    }
    let _ = shutdown.send(true);
}

#[cfg(not(unix))]
async fn shutdown_signal(shutdown: watch::Sender<bool>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("interrupt received, shutting down");
    let _ = shutdown.send(true);
}
