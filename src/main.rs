use clap::Parser;
use log::{error, info, warn};
use relay_proxy::config::{Config, LogFormat, LogLevel, ProxyMode};
use relay_proxy::logging::{self, CustomLogger};
use relay_proxy::server::ProxyFactory;
use std::path::Path;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[clap(
    version = "0.1.0",
    about = "Non-blocking HTTP forward/reverse proxy that streams upstream responses back to the caller"
)]
struct Args {
    #[clap(short, long, value_name = "MODE", help = "Proxy mode: forward or reverse")]
    mode: Option<String>,

    #[clap(short, long, value_name = "ADDR", help = "Listen address (e.g., 127.0.0.1:8080)")]
    listen: Option<String>,

    #[clap(short, long, value_name = "URL", help = "Target URL for reverse proxy (e.g., http://backend:3000)")]
    target: Option<String>,

    #[clap(long, value_name = "URL", help = "Forward mode origin for origin-form requests (e.g., http://localhost:80)")]
    default_upstream: Option<String>,

    #[clap(short, long, value_name = "FILE", help = "Configuration file path")]
    config: Option<String>,

    #[clap(long, value_name = "FILE", help = "Generate a sample configuration file")]
    generate_config: Option<String>,

    #[clap(long, value_name = "SECONDS", help = "Upstream connect timeout in seconds")]
    connect_timeout: Option<u64>,

    #[clap(long, value_name = "SECONDS", help = "Time allowed for the upstream response head")]
    response_timeout: Option<u64>,

    #[clap(long, value_name = "SECONDS", help = "Time allowed between two upstream body chunks")]
    read_timeout: Option<u64>,

    #[clap(long, value_name = "NUM", help = "Maximum upstream connections in total")]
    max_connections: Option<usize>,

    #[clap(long, value_name = "NUM", help = "Maximum upstream connections per route")]
    max_connections_per_route: Option<usize>,

    #[clap(long, value_name = "NUM", help = "Maximum idle connections kept per route")]
    pool_max_idle: Option<usize>,

    #[clap(long, help = "Forward the caller's Host header instead of the upstream authority")]
    preserve_host: bool,

    #[clap(long, help = "Do not add X-Forwarded-* headers")]
    no_forwarded_headers: bool,

    #[clap(long, help = "Reverse mode: drop the request path and keep only the query string")]
    no_forward_path: bool,

    #[clap(long, value_name = "NAME", help = "Additional header never copied in either direction (repeatable)")]
    exclude_header: Vec<String>,

    #[clap(long, value_name = "LEVEL", help = "Log level when no logging section is configured: trace, debug, info, warn, error")]
    log_level: Option<String>,

    #[clap(long, value_name = "FORMAT", help = "Log format when no logging section is configured: text or json")]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Some(config_file) = args.generate_config {
        generate_sample_config(&config_file)?;
        println!("Sample configuration file generated: {}", config_file);
        return Ok(());
    }

    let config = if let Some(config_file) = &args.config {
        if !Path::new(config_file).exists() {
            return Err(format!("Configuration file not found: {}", config_file).into());
        }
        Config::from_file(config_file)?
    } else {
        create_config_from_args(&args)?
    };

    match config.logging.clone() {
        Some(logging_config) => CustomLogger::init(logging_config)?,
        None => {
            let level = args.log_level.as_deref().map(str::parse::<LogLevel>).transpose()?;
            let format = args.log_format.as_deref().map(str::parse::<LogFormat>).transpose()?;
            logging::init_fallback(level.unwrap_or_default(), format.unwrap_or_default())?;
        }
    }

    config.validate()?;

    info!("Starting proxy server...");
    let shutdown = CancellationToken::new();
    let proxy = ProxyFactory::create_proxy(config, shutdown.clone())?;

    let mut server_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!("Server error: {}", e);
        }
    });

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
            shutdown.cancel();
            if tokio::time::timeout(Duration::from_secs(10), &mut server_handle).await.is_err() {
                warn!("Server did not stop within 10s");
            }
        }
        result = &mut server_handle => {
            if let Err(e) = result {
                error!("Server task error: {}", e);
            }
        }
    }

    info!("Proxy server stopped");
    Ok(())
}

fn generate_sample_config(file_path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let path = Path::new(file_path);
    let config = match path.extension().and_then(|s| s.to_str()) {
        Some("forward") | Some("fwd") => Config {
            mode: ProxyMode::Forward,
            default_upstream: Some("http://localhost:80".to_string()),
            ..Config::default()
        },
        _ => Config {
            mode: ProxyMode::Reverse,
            reverse_proxy_target: Some("http://backend.example.com:3000".to_string()),
            ..Config::default()
        },
    };
    config.to_file(file_path)
}

fn create_config_from_args(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    let mode = match args.mode.as_deref().unwrap_or("forward") {
        "forward" => ProxyMode::Forward,
        "reverse" => ProxyMode::Reverse,
        _ => return Err("Invalid mode. Use 'forward' or 'reverse'".into()),
    };

    let listen_addr = args.listen.as_deref().unwrap_or("127.0.0.1:8080").parse()?;

    let mut config = Config {
        mode,
        listen_addr,
        reverse_proxy_target: args.target.clone(),
        forward_path: !args.no_forward_path,
        default_upstream: args.default_upstream.clone(),
        excluded_headers: args.exclude_header.clone(),
        ..Config::default()
    };

    config.request.preserve_host_header = args.preserve_host;
    config.request.forwarded_headers = !args.no_forwarded_headers;

    if let Some(max) = args.max_connections {
        config.pool.max_total_connections = max;
    }
    if let Some(max) = args.max_connections_per_route {
        config.pool.max_connections_per_route = max;
    }
    if let Some(max_idle) = args.pool_max_idle {
        config.pool.max_idle_per_route = max_idle;
    }

    if let Some(secs) = args.connect_timeout {
        config.timeouts.connect_timeout_secs = secs;
    }
    if let Some(secs) = args.response_timeout {
        config.timeouts.response_timeout_secs = secs;
    }
    if let Some(secs) = args.read_timeout {
        config.timeouts.read_timeout_secs = secs;
    }

    Ok(config)
}
