use anyhow::Context;
use clap::{Parser, ValueEnum};
use headless_proxy::config::Config;
use headless_proxy::session::chromium::ChromiumFactory;
use headless_proxy::ProxyServer;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "headless-proxy", version, about)]
struct Args {
    /// YAML configuration file
    #[arg(short, long, env = "HEADLESS_PROXY_CONFIG")]
    config: Option<String>,

    /// Listen port, overrides the configuration file
    #[arg(short, long, env = "HEADLESS_PROXY_PORT")]
    port: Option<u16>,

    /// Upstream base URL, overrides the configuration file
    #[arg(short, long, env = "HEADLESS_PROXY_UPSTREAM")]
    upstream: Option<String>,

    #[arg(long, value_enum, default_value = "text", env = "HEADLESS_PROXY_LOG_FORMAT")]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(args: &Args) -> Result<Config, anyhow::Error> {
    let mut config = match (&args.config, &args.upstream) {
        (Some(path), _) => Config::from_file(path)
            .with_context(|| format!("Failed to load configuration from {path}"))?,
        (None, Some(upstream)) => Config::for_upstream(upstream.clone()),
        (None, None) => anyhow::bail!("either --config or --upstream is required"),
    };
    if let Some(upstream) = &args.upstream {
        config.proxy.upstream = upstream.clone();
    }
    if let Some(port) = args.port {
        config.listen.port = port;
    }
    config.validate()?;
    Ok(config)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let config = load_config(&args)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.listen.worker_threads())
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        info!(
            "Starting headless-proxy {} ({} workers)",
            env!("CARGO_PKG_VERSION"),
            config.listen.worker_threads()
        );
        let factory = Arc::new(ChromiumFactory::new(config.engine.clone()));
        let server = ProxyServer::new(config, factory)?;
        server.run(shutdown_signal()).await
    })
}
