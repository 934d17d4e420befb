use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand};
use eyre::{Result, WrapErr};
use serde::Serialize;

use coinproxy::{
    config::Config,
    server::ServerConfig,
    upstream::{CoinGeckoClient, UpstreamSettings, DEFAULT_API_KEY_HEADER, DEFAULT_BASE_URL},
    AssetCatalog, CachePolicy, ProxyCache, ProxyDispatcher,
};

#[derive(Parser)]
#[command(
    name = "coinproxy",
    about = "Caching proxy for crypto spot prices and price history."
)]
struct Cli {
    /// Path to the TOML config file (default: ~/.config/coinproxy/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Address to bind to
        #[arg(long)]
        bind: Option<String>,

        /// Rate limit in requests per minute per IP (0 = no limit)
        #[arg(long)]
        rate_limit: Option<u32>,

        /// Upstream API root
        #[arg(long)]
        upstream_url: Option<String>,

        /// Fail instead of serving expired entries when the upstream is down
        #[arg(long, default_value_t = false)]
        no_stale: bool,

        /// Let concurrent misses each fetch upstream
        #[arg(long, default_value_t = false)]
        no_coalesce: bool,
    },

    /// Run one pipeline against the live provider and print the result
    Fetch {
        #[command(subcommand)]
        query: FetchQuery,
    },

    /// Show the tracked asset catalog
    Assets,
}

#[derive(Subcommand)]
enum FetchQuery {
    /// Current USD prices for every tracked asset
    Prices,
    /// Fixed 7-day chart of the chart asset
    Chart,
    /// Price history for one asset
    History {
        /// Provider asset id (e.g. bitcoin)
        #[arg(long)]
        id: String,

        /// Range in days (default: 7)
        #[arg(long)]
        days: Option<String>,
    },
}

/// Fetch result for JSON output
#[derive(Serialize)]
struct FetchResult<T: Serialize> {
    query: &'static str,
    cache: &'static str,
    data: T,
    timestamp: String,
}

/// Merge the config file over built-in defaults.
fn server_config(cfg: Config) -> Result<ServerConfig> {
    let defaults = ServerConfig::default();
    let default_policy = CachePolicy::default();

    let bind_addr = match cfg.bind {
        Some(bind) => bind
            .parse()
            .wrap_err_with(|| format!("Invalid bind address: {}", bind))?,
        None => defaults.bind_addr,
    };

    let policy = CachePolicy {
        snapshot_ttl: cfg
            .snapshot_ttl_seconds
            .map(Duration::from_secs)
            .unwrap_or(default_policy.snapshot_ttl),
        series_ttl: cfg
            .series_ttl_seconds
            .map(Duration::from_secs)
            .unwrap_or(default_policy.series_ttl),
        serve_stale_on_error: cfg
            .serve_stale_on_error
            .unwrap_or(default_policy.serve_stale_on_error),
        coalesce: cfg.coalesce_requests.unwrap_or(default_policy.coalesce),
        upstream_timeout: cfg
            .upstream_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(default_policy.upstream_timeout),
        upstream_retries: cfg
            .upstream_retries
            .unwrap_or(default_policy.upstream_retries),
        retry_backoff: cfg
            .retry_backoff_ms
            .map(Duration::from_millis)
            .unwrap_or(default_policy.retry_backoff),
        reachability_ttl: cfg
            .reachability_ttl_seconds
            .map(Duration::from_secs)
            .unwrap_or(default_policy.reachability_ttl),
    };

    let upstream = UpstreamSettings {
        base_url: cfg
            .upstream_base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        api_key: cfg.upstream_api_key,
        api_key_header: cfg
            .upstream_api_key_header
            .unwrap_or_else(|| DEFAULT_API_KEY_HEADER.to_string()),
        timeout: policy.upstream_timeout,
    };

    Ok(ServerConfig {
        bind_addr,
        rate_limit_rpm: cfg.rate_limit_rpm.unwrap_or(defaults.rate_limit_rpm),
        allowed_origins: cfg.allowed_origins,
        api_keys: cfg.api_keys,
        upstream,
        policy,
        catalog: cfg
            .tracked_assets
            .map(AssetCatalog::new)
            .unwrap_or(defaults.catalog),
        chart_asset: cfg.chart_asset.unwrap_or(defaults.chart_asset),
        cache_max_entries: cfg.cache_max_entries.unwrap_or(defaults.cache_max_entries),
    })
}

fn load_config(path: Option<PathBuf>) -> Config {
    match path {
        Some(path) => Config::load_from(&path),
        None => Config::load(),
    }
}

fn cmd_serve(
    cfg: Config,
    bind: Option<String>,
    rate_limit: Option<u32>,
    upstream_url: Option<String>,
    no_stale: bool,
    no_coalesce: bool,
) -> Result<()> {
    let mut config = server_config(cfg)?;

    if let Some(bind) = bind {
        config.bind_addr = bind
            .parse()
            .wrap_err_with(|| format!("Invalid bind address: {}", bind))?;
    }
    if let Some(rpm) = rate_limit {
        config.rate_limit_rpm = rpm;
    }
    if let Some(url) = upstream_url {
        config.upstream.base_url = url;
    }
    if no_stale {
        config.policy.serve_stale_on_error = false;
    }
    if no_coalesce {
        config.policy.coalesce = false;
    }

    tracing::info!("starting coinproxy server");
    tracing::info!(
        assets = config.catalog.len(),
        chart_asset = %config.chart_asset,
        upstream = %config.upstream.base_url,
        "catalog configured"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(coinproxy::server::run_server(config))?;

    Ok(())
}

fn cmd_fetch(cfg: Config, query: FetchQuery) -> Result<()> {
    let config = server_config(cfg)?;
    config.validate()?;

    let dispatcher = ProxyDispatcher::new(
        Arc::new(CoinGeckoClient::new(config.upstream.clone())?),
        Arc::new(ProxyCache::new(config.cache_max_entries)),
        config.catalog.clone(),
        config.chart_asset.clone(),
        config.policy.clone(),
    );

    let rt = tokio::runtime::Runtime::new()?;
    let timestamp = Utc::now().to_rfc3339();
    let output = rt.block_on(async {
        match query {
            FetchQuery::Prices => {
                let served = dispatcher.current_prices().await?;
                serde_json::to_string_pretty(&FetchResult {
                    query: "current_prices",
                    cache: served.status.as_str(),
                    data: served.payload.as_slice(),
                    timestamp,
                })
                .map_err(eyre::Report::from)
            }
            FetchQuery::Chart => {
                let served = dispatcher.chart().await?;
                serde_json::to_string_pretty(&FetchResult {
                    query: "chart",
                    cache: served.status.as_str(),
                    data: served.payload.as_slice(),
                    timestamp,
                })
                .map_err(eyre::Report::from)
            }
            FetchQuery::History { id, days } => {
                let served = dispatcher
                    .price_history(Some(&id), days.as_deref())
                    .await?;
                serde_json::to_string_pretty(&FetchResult {
                    query: "price_history",
                    cache: served.status.as_str(),
                    data: served.payload.as_slice(),
                    timestamp,
                })
                .map_err(eyre::Report::from)
            }
        }
    })?;

    println!("{}", output);
    Ok(())
}

fn cmd_assets(cfg: Config) -> Result<()> {
    let config = server_config(cfg)?;

    println!("Tracked Assets");
    println!("==============");
    for asset in config.catalog.assets() {
        let marker = if asset.id == config.chart_asset {
            "  (chart)"
        } else {
            ""
        };
        println!("{:<6} {}{}", asset.symbol, asset.id, marker);
    }
    println!();
    println!("Snapshot TTL:   {}s", config.policy.snapshot_ttl.as_secs());
    println!("Series TTL:     {}s", config.policy.series_ttl.as_secs());
    println!("Stale fallback: {}", config.policy.serve_stale_on_error);
    println!("Coalescing:     {}", config.policy.coalesce);

    Ok(())
}

fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("coinproxy=info,tower_http=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = load_config(cli.config);

    let result = match cli.command {
        Commands::Serve {
            bind,
            rate_limit,
            upstream_url,
            no_stale,
            no_coalesce,
        } => cmd_serve(cfg, bind, rate_limit, upstream_url, no_stale, no_coalesce),
        Commands::Fetch { query } => cmd_fetch(cfg, query),
        Commands::Assets => cmd_assets(cfg),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:?}");
        std::process::exit(1);
    }
}
