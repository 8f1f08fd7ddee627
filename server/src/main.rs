use clap::Parser;
use phoenix_core::config::Config;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "phoenix-server", about = "Local AI agent server")]
struct Cli {
    /// Port for the WebSocket event channel. Overrides SERVER_PORT.
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> anyhow::Result<()> {
    // A checked-in .env behaves like configuration; real env vars win.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.server_port = port;
    }

    let default_filter = if config.debug_mode { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(phoenix_server::run(config))
}
