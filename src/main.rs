use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context as _;
use groq_gate::auth::ApiKeys;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8082";
const DEFAULT_API_KEYS_FILE: &str = "api-keys.yaml";

fn env_string(name: &str) -> Option<String> {
    let value = std::env::var(name).ok()?;
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn env_parse<T>(name: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    let Some(raw) = env_string(name) else {
        return Ok(None);
    };
    raw.parse::<T>()
        .map(Some)
        .map_err(|e| anyhow::anyhow!("invalid value for {name}: {raw:?}: {e}"))
}

fn config_from_env() -> anyhow::Result<groq_gate::AppConfig> {
    let mut cfg = groq_gate::AppConfig::default();

    cfg.upstream_api_key = env_string("GROQ_API_KEY");
    if let Some(url) = env_string("UPSTREAM_BASE_URL") {
        cfg.upstream_base_url = url;
    }
    if let Some(ms) = env_parse::<u64>("UPSTREAM_CONNECT_TIMEOUT_MS")? {
        cfg.upstream_connect_timeout = Duration::from_millis(ms);
    }
    if let Some(value) = env_parse::<usize>("MAX_REQUEST_BYTES")? {
        cfg.max_request_bytes = value;
    }

    if let Some(rps) = env_parse::<f64>("RATE_LIMIT_RPS")? {
        cfg.rate_limit.requests_per_second = rps;
    }
    if let Some(burst) = env_parse::<u32>("RATE_LIMIT_BURST")? {
        cfg.rate_limit.burst = burst;
    }
    if let Some(secs) = env_parse::<u64>("RATE_LIMIT_IDLE_SECS")? {
        cfg.rate_limit.idle_expiry = Duration::from_secs(secs);
    }
    if let Some(secs) = env_parse::<u64>("RATE_LIMIT_SWEEP_SECS")? {
        cfg.rate_limit.sweep_interval = Duration::from_secs(secs);
    }

    Ok(cfg)
}

fn listen_addr_from_env() -> anyhow::Result<SocketAddr> {
    if let Some(addr) = env_parse::<SocketAddr>("LISTEN_ADDR")? {
        return Ok(addr);
    }
    if let Some(port) = env_parse::<u16>("PORT")? {
        return Ok(SocketAddr::from(([0, 0, 0, 0], port)));
    }
    Ok(DEFAULT_LISTEN_ADDR.parse()?)
}

/// Loads caller keys; an absent default file leaves auth off.
fn api_keys_from_env() -> anyhow::Result<Option<ApiKeys>> {
    let explicit = env_string("API_KEYS_FILE").map(PathBuf::from);
    let path = explicit
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_API_KEYS_FILE));

    if explicit.is_none() && !path.exists() {
        return Ok(None);
    }

    let keys = ApiKeys::load(&path)
        .with_context(|| format!("loading API keys from {}", path.display()))?;
    Ok(Some(keys))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let dotenv = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    if let Err(err) = dotenv {
        tracing::info!(error = %err, ".env not loaded; using process environment");
    }

    let cfg = config_from_env()?;
    let listen = listen_addr_from_env()?;

    if cfg.upstream_api_key.is_none() {
        tracing::warn!("GROQ_API_KEY is not set; chat requests will fail");
    }
    tracing::info!(
        requests_per_second = cfg.rate_limit.requests_per_second,
        burst = cfg.rate_limit.burst,
        idle_expiry_secs = cfg.rate_limit.idle_expiry.as_secs(),
        sweep_interval_secs = cfg.rate_limit.sweep_interval.as_secs(),
        "rate limiting enabled"
    );

    let mut state = groq_gate::AppState::new(cfg)?;
    match api_keys_from_env()? {
        Some(keys) => {
            tracing::info!(keys = keys.len(), "API key authentication enabled");
            state = state.with_api_keys(keys);
        }
        None => {
            tracing::warn!("no API key file found; authentication disabled");
        }
    }

    let sweeper = state.limiters().spawn_sweeper();
    let app = groq_gate::app(state);

    let listener = TcpListener::bind(listen).await?;
    tracing::info!(%listen, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.shutdown().await;
    Ok(())
}
