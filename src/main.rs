use anyhow::{Context, bail};
use bifrost_relay::config::Config;
use bifrost_relay::events::{EventKind, ProxyEvent};
use bifrost_relay::options::Target;
use bifrost_relay::proxy::ProxyServer;
use clap::Parser;
use log::{debug, error, info, warn};
use std::path::Path;
use std::sync::Arc;
use tokio::signal;

#[derive(Parser)]
#[clap(
    version,
    about = "Reverse proxy for HTTP and WebSocket traffic with header, path and redirect rewriting"
)]
struct Args {
    #[clap(short, long, value_name = "ADDR", help = "Listen address (e.g., 127.0.0.1:8080)")]
    listen: Option<String>,

    #[clap(short, long, value_name = "URL", help = "Upstream target URL (e.g., http://backend:3000)")]
    target: Option<String>,

    #[clap(short, long, value_name = "URL", help = "Upstream that receives a copy of every request")]
    forward: Option<String>,

    #[clap(short, long, value_name = "FILE", help = "Configuration file path")]
    config: Option<String>,

    #[clap(long, help = "Proxy WebSocket upgrades")]
    ws: bool,

    #[clap(long, help = "Add x-forwarded-* headers")]
    xfwd: bool,

    #[clap(long, help = "Rewrite the host header to the target's host")]
    change_origin: bool,

    #[clap(long, help = "Follow upstream redirects instead of returning them")]
    follow_redirects: bool,

    #[clap(long, help = "Verify upstream TLS certificates (default)", overrides_with = "insecure")]
    secure: bool,

    #[clap(long, help = "Accept any upstream TLS certificate", overrides_with = "secure")]
    insecure: bool,

    #[clap(long, value_name = "FILE", help = "Generate a sample configuration file")]
    generate_config: Option<String>,

    #[clap(long, value_name = "FILE", help = "Private key file path for HTTPS")]
    private_key: Option<String>,

    #[clap(long, value_name = "FILE", help = "Certificate file path for HTTPS")]
    certificate: Option<String>,

    #[clap(long, value_name = "BYTES", help = "Maximum HTTP header size in bytes")]
    max_header_size: Option<usize>,

    #[clap(long, help = "Disable upstream connection pooling (no-pool mode)")]
    no_connection_pool: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Some(config_file) = args.generate_config {
        generate_sample_config(&config_file)?;
        println!("Sample configuration file generated: {}", config_file);
        return Ok(());
    }

    let mut config = match &args.config {
        Some(config_file) => {
            if !Path::new(config_file).exists() {
                bail!("Configuration file not found: {}", config_file);
            }
            Config::from_file(config_file)?
        }
        None => Config::default(),
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log_level().to_string()),
    )
    .init();

    apply_args(&mut config, &args)?;

    let validation = config.validate();
    for warning in &validation.warnings {
        warn!("{}", warning);
    }
    if !validation.is_valid() {
        for problem in &validation.errors {
            error!("{}", problem);
        }
        bail!("Invalid configuration ({} errors)", validation.errors.len());
    }

    let options = config
        .to_proxy_options()
        .context("Failed to prepare proxy options")?;

    let mut proxy = ProxyServer::new(options);
    proxy.on(EventKind::Error, |event| {
        if let ProxyEvent::Error { error, request } = event {
            error!("Proxy error for {} {}: {}", request.method, request.uri, error);
        }
    });
    proxy.on(EventKind::End, |event| {
        if let ProxyEvent::End { request, status } = event {
            debug!("{} {} -> {}", request.method, request.uri, status);
        }
    });
    proxy.on(EventKind::Close, |event| {
        if let ProxyEvent::Close { upstream, .. } = event {
            debug!("WebSocket relay to {} closed", upstream.origin);
        }
    });

    info!("Starting proxy server...");
    let proxy = Arc::new(proxy);
    let server_handle = tokio::spawn(
        proxy.listen_with(config.listen_addr, config.max_header_size),
    );

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
        result = server_handle => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
    }

    info!("Proxy server stopped");
    Ok(())
}

/// Command line flags win over the configuration file.
fn apply_args(config: &mut Config, args: &Args) -> anyhow::Result<()> {
    if let Some(listen) = &args.listen {
        config.listen_addr = listen
            .parse()
            .with_context(|| format!("Invalid listen address: {}", listen))?;
    }
    if let Some(target) = &args.target {
        config.proxy.target = Some(Target::from(target.as_str()));
    }
    if let Some(forward) = &args.forward {
        config.proxy.forward = Some(Target::from(forward.as_str()));
    }
    if args.ws {
        config.proxy.ws = Some(true);
    }
    if args.xfwd {
        config.proxy.xfwd = Some(true);
    }
    if args.change_origin {
        config.proxy.change_origin = Some(true);
    }
    if args.follow_redirects {
        config.proxy.follow_redirects = Some(true);
    }
    if args.secure {
        config.proxy.secure = Some(true);
    }
    if args.insecure {
        config.proxy.secure = Some(false);
    }
    if args.private_key.is_some() {
        config.private_key = args.private_key.clone();
    }
    if args.certificate.is_some() {
        config.certificate = args.certificate.clone();
    }
    if let Some(max_header_size) = args.max_header_size {
        config.max_header_size = max_header_size;
    }
    if args.no_connection_pool {
        config.connection_pool_enabled = Some(false);
    }
    Ok(())
}

fn generate_sample_config(file_path: &str) -> anyhow::Result<()> {
    let sample = r#"{
  "listen_addr": "127.0.0.1:8080",
  "max_header_size": 16384,
  "connection_pool_enabled": true,
  "pool": {
    "pool_max_idle_per_host": 10,
    "pool_idle_timeout_secs": 90
  },
  "logging": {
    "level": "info"
  },
  "proxy": {
    "target": "http://backend.example.com:3000",
    "ws": true,
    "xfwd": true,
    "change_origin": false,
    "auto_rewrite": true,
    "cookie_domain_rewrite": {
      "backend.example.com": "example.com"
    },
    "proxy_timeout": 30000,
    "follow_redirects": false
  }
}"#;

    std::fs::write(file_path, sample)
        .with_context(|| format!("Failed to write {}", file_path))?;
    Ok(())
}
