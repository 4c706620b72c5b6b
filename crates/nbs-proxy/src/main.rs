//! NBS Proxy - offline cache in front of the app server.
//!
//! Serves the app through the cache orchestrator so pages and assets keep
//! working while the upstream server is unreachable.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use nbs_common::{init_logging, LogConfig, LogFormat, ProxyConfig};
use nbs_proxy::{
    build_loader, build_orchestrator, build_storage, expire_idle_clients, parse_origin,
    record_activations, start_server, AppState, RegistrationStore,
};
use nbs_sw::{Fetcher, ServiceWorkerContainer};
use tokio::sync::oneshot;
use tracing::{info, warn, Level};

#[derive(Parser, Debug)]
#[command(name = "nbs-proxy")]
#[command(about = "Offline caching proxy for the NBS web app")]
struct Args {
    /// Configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on (overrides the config file)
    #[arg(short, long)]
    listen: Option<String>,

    /// Public origin the browser sees
    #[arg(long)]
    origin: Option<String>,

    /// App server to forward requests to
    #[arg(long)]
    upstream: Option<String>,

    /// Cache version tag to register
    #[arg(long = "cache-version")]
    cache_version: Option<String>,

    /// Directory for cached responses
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Keep caches in memory only
    #[arg(long)]
    memory: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Log format: pretty, compact or json
    #[arg(long)]
    log_format: Option<String>,
}

impl Args {
    fn into_config(self) -> Result<ProxyConfig> {
        let mut config = match &self.config {
            Some(path) => ProxyConfig::load(path)?,
            None => ProxyConfig::default(),
        };

        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(origin) = self.origin {
            config.origin = origin;
        }
        if let Some(upstream) = self.upstream {
            config.upstream = upstream;
        }
        if let Some(version) = self.cache_version {
            config.cache.version = version;
        }
        if let Some(dir) = self.cache_dir {
            config.cache.dir = dir;
        }
        if self.memory {
            config.cache.persistent = false;
        }
        if self.debug {
            config.log.level = "debug".to_string();
        }
        if let Some(format) = self.log_format {
            config.log.format = format;
        }

        config.validate()?;
        Ok(config)
    }
}

fn log_config(config: &ProxyConfig) -> Result<LogConfig> {
    let level: Level = config
        .log
        .level
        .parse()
        .with_context(|| format!("invalid log level '{}'", config.log.level))?;
    let format: LogFormat = config.log.format.parse()?;

    let mut log = if level >= Level::DEBUG {
        LogConfig::debug()
    } else {
        LogConfig::default()
    };
    log.level = level;
    log = log.with_format(format);
    if let Some(filter) = &config.log.filter {
        log = log.with_filter(filter.clone());
    }
    Ok(log)
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Args::parse().into_config()?;
    init_logging(log_config(&config)?);

    info!(
        origin = %config.origin,
        upstream = %config.upstream,
        version = %config.cache.version,
        "Starting NBS proxy"
    );

    let origin = parse_origin(&config.origin)?;
    let loader = Arc::new(build_loader(&config, &origin)?);
    let storage = build_storage(&config).await?;
    if config.cache.persistent {
        info!("Cache directory: {}", config.cache.dir.display());
    }

    let scope = origin.join("/").context("origin cannot be a scope")?;
    let (container, events) = ServiceWorkerContainer::new(scope);
    let container = Arc::new(container);

    let store = RegistrationStore::new(config.registration_file(), config.cache.prefix.clone());
    let recorded = if config.cache.persistent {
        match store.load().await {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable registration record");
                None
            }
        }
    } else {
        None
    };
    tokio::spawn(record_activations(events, store));

    // Adopt the version that was active last time so its caches serve
    // immediately, then install the configured one alongside it.
    if let Some(record) = recorded {
        let fetcher: Arc<dyn Fetcher> = loader.clone();
        match build_orchestrator(&config, &origin, &record.version, &storage, fetcher) {
            Ok(orchestrator) => {
                if let Err(e) = container.restore_active(Arc::new(orchestrator)).await {
                    warn!(version = %record.version, error = %e, "Could not restore active version");
                }
            }
            Err(e) => warn!(version = %record.version, error = %e, "Recorded version is unusable"),
        }
    }

    let state = Arc::new(AppState {
        config: config.clone(),
        origin,
        container: Arc::clone(&container),
        loader,
        storage,
    });

    if let Err(e) = state.register_version(&config.cache.version).await {
        warn!(version = %config.cache.version, error = %e, "Registration failed; serving without it");
    }

    if config.client_idle_secs > 0 {
        let max_idle = Duration::from_secs(config.client_idle_secs);
        tokio::spawn(expire_idle_clients(Arc::clone(&container), max_idle));
    }

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (addr, server) = start_server(Arc::clone(&state), &config.listen, async {
        let _ = shutdown_rx.await;
    })
    .await?;

    info!("NBS proxy running on {}", addr);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");

    let _ = shutdown_tx.send(());
    container.shutdown().await;
    if let Err(e) = server.await {
        warn!(error = %e, "Server task ended abnormally");
    }

    Ok(())
}
