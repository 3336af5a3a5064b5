use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _};
use clap::Parser;
use log::info;
use tokio::signal;

use pacgate::config::Config;
use pacgate::credentials::Credentials;
use pacgate::logging;
use pacgate::pac::PacEvaluator;
use pacgate::router::Router;
use pacgate::server::{ProxyServer, ServerSettings};

#[derive(Parser)]
#[clap(
    version,
    about = "PAC-driven local forwarding proxy with an authenticated upstream"
)]
struct Args {
    #[clap(short, long, value_name = "FILE", help = "Configuration file path (JSON)")]
    config: Option<String>,

    #[clap(short, long, value_name = "ADDR", help = "Listen address (e.g., 127.0.0.1:44380)")]
    listen: Option<String>,

    #[clap(long, value_name = "URL", help = "Upstream proxy URL (e.g., http://proxy.corp:3128)")]
    proxy_url: Option<String>,

    #[clap(long, value_name = "USERNAME", help = "Username for upstream proxy authentication")]
    proxy_username: Option<String>,

    #[clap(long, value_name = "PASSWORD", help = "Password for upstream proxy authentication")]
    proxy_password: Option<String>,

    #[clap(long, value_name = "FILE", help = "PAC script path for per-request routing")]
    pac_file: Option<String>,

    #[clap(long, value_name = "LEVEL", help = "Log level (trace, debug, info, warn, error)")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path).with_context(|| format!("loading {path}"))?,
        None => Config::default(),
    };
    if let Some(listen) = args.listen {
        config.serve.listen_addr = listen;
    }
    if let Some(url) = args.proxy_url {
        config.proxy.url = url;
    }
    if let Some(username) = args.proxy_username {
        config.proxy.username = username;
    }
    if let Some(password) = args.proxy_password {
        config.proxy.password = password;
    }
    if let Some(pac) = args.pac_file {
        config.serve.pac_file_path = Some(pac.into());
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    logging::init(&config.log_level);

    if config.proxy.url.is_empty() {
        bail!("no upstream proxy configured; set proxy.url in the config file or pass --proxy-url");
    }
    let credentials = Credentials::new(
        &config.proxy.url,
        &config.proxy.username,
        &config.proxy.password,
    )?;

    let pac = config
        .serve
        .pac_file_path
        .as_deref()
        .and_then(PacEvaluator::from_file);
    info!("Proxy: {} / User: {}", config.proxy.url, config.proxy.username);
    match &config.serve.pac_file_path {
        Some(path) if pac.is_some() => info!("Pac: [{}]", path.display()),
        _ => info!("Pac ignore. Always use proxy."),
    }

    let router = Arc::new(Router::new(
        credentials,
        pac,
        Duration::from_secs(config.timeouts.connect_secs),
    ));
    let settings = ServerSettings {
        listen_addr: config.serve.listen_addr.clone(),
        idle_timeout: Duration::from_secs(config.timeouts.idle_secs),
        shutdown_grace: Duration::from_secs(config.timeouts.shutdown_grace_secs),
    };
    let server = ProxyServer::new(settings, router);
    server.start().await?;

    signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received");
    server.stop().await;
    Ok(())
}
