use clap::Parser;
use mitmproxy_core::config::{Config, ProxyMode};
use mitmproxy_core::server::MitmproxyServer;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "mitmproxy-core")]
#[command(about = "An intercepting HTTP/1 and HTTP/2 proxy")]
struct Cli {
    #[arg(short = 'H', long)]
    listen_host: Option<String>,

    #[arg(short, long)]
    listen_port: Option<u16>,

    /// Configuration file (JSON, TOML or YAML).
    #[arg(short, long)]
    config: Option<String>,

    /// Hold flows matching this filter expression, e.g. "~m POST".
    #[arg(short, long)]
    intercept: Option<String>,

    #[arg(short, long, value_enum)]
    mode: Option<Mode>,

    /// host:port to forward to in reverse mode.
    #[arg(short, long)]
    reverse_target: Option<String>,

    /// Append completed flows to this file.
    #[arg(short = 'w', long)]
    save_stream_file: Option<String>,

    #[arg(short, long)]
    verbose: bool,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum Mode {
    Regular,
    Reverse,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting mitmproxy-core");

    let mut config = match cli.config {
        Some(path) => Config::from_file(&path)?,
        None => {
            let defaults = Config::default();
            let path = defaults.default_config_file();
            if std::path::Path::new(&path).exists() {
                info!("Loading configuration from {}", path);
                Config::from_file(&path)?
            } else {
                defaults
            }
        }
    };

    if let Some(host) = cli.listen_host {
        config.listen_host = host;
    }
    if let Some(port) = cli.listen_port {
        config.listen_port = port;
    }
    if let Some(intercept) = cli.intercept {
        config.intercept = Some(intercept);
    }
    if let Some(mode) = cli.mode {
        config.mode = match mode {
            Mode::Regular => ProxyMode::Regular,
            Mode::Reverse => ProxyMode::Reverse,
        };
    }
    if let Some(target) = cli.reverse_target {
        config.reverse_target = Some(target);
    }
    if let Some(path) = cli.save_stream_file {
        config.save_stream_file = Some(path);
    }

    let server = MitmproxyServer::new(config).await?;
    server.run().await?;

    Ok(())
}
