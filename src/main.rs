use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::clock::{Clock, SystemClock};
use tollgate::config::{LogFormat, TollgateConfig};
use tollgate::error::TollgateError;
use tollgate::http::{router, Gate, StaticTokenAuthenticator};
use tollgate::ratelimit::{
    BackendKind, DistributedRateLimiter, LocalRateLimiter, RateLimitBackend,
};

/// Rate limiting gate for transactional HTTP APIs.
#[derive(Parser, Debug)]
#[command(name = "tollgate", version, about)]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Counter store to use, overriding the configuration
    #[arg(long)]
    backend: Option<BackendKind>,

    /// HTTP listen address, overriding the configuration
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    /// Log output format, overriding the configuration
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = TollgateConfig::load(args.config.as_deref())?;
    if let Some(backend) = args.backend {
        config.rate_limiting.backend = backend;
    }
    if let Some(addr) = args.http_addr {
        config.server.http_addr = addr;
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }

    init_tracing(&config);

    info!("Starting Tollgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Unknown or invalid policies stop start-up here
    let policies = config.policy_registry()?;
    for policy in policies.iter() {
        info!(
            policy = policy.name(),
            limit = policy.limit(),
            window_ms = policy.window_ms(),
            "Rate limit policy loaded"
        );
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let mut local = None;
    let backend: Arc<dyn RateLimitBackend> = match config.rate_limiting.backend {
        BackendKind::Local => {
            let limiter = Arc::new(LocalRateLimiter::with_sweeper(
                clock.clone(),
                config.rate_limiting.sweep_interval(),
            ));
            local = Some(limiter.clone());
            limiter
        }
        BackendKind::Distributed => Arc::new(DistributedRateLimiter::from_settings(
            &config.rate_limiting.redis,
            clock.clone(),
        )),
    };
    info!(backend = %backend.kind(), "Rate limiter initialized");

    let authenticator = Arc::new(StaticTokenAuthenticator::from_config(&config.auth));
    let gate = Gate::new(backend, authenticator, clock);
    let app = router(&gate, &policies);

    let listener = tokio::net::TcpListener::bind(config.server.http_addr).await?;
    info!(addr = %config.server.http_addr, "Starting HTTP server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| TollgateError::Server(e.to_string()))?;

    if let Some(local) = local {
        local.destroy();
    }

    info!("Tollgate stopped");
    Ok(())
}

fn init_tracing(config: &TollgateConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match config.logging.format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
