use {
    clap::Parser,
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use arc_config::GatewayConfig;

#[derive(Parser)]
#[command(name = "arc", about = "arc — realtime messaging gateway")]
struct Cli {
    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, default_value_t = false)]
    json_logs: bool,

    /// Listen address (overrides ARC_HTTP_ADDR).
    #[arg(long)]
    addr: Option<String>,

    /// SQLite database url (overrides ARC_DB_URL).
    #[arg(long)]
    db: Option<String>,

    /// Dev mode: anonymous sessions and public-room auto-creation.
    #[arg(long, default_value_t = false, env = "ARC_DEV")]
    dev: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli)?;

    let mut config = GatewayConfig::from_env();
    if let Some(addr) = cli.addr {
        config.http_addr = addr;
    }
    if let Some(db) = cli.db {
        config.db_url = db;
    }
    if cli.dev {
        config.dev_allow_anon = true;
    }

    info!(
        addr = %config.http_addr,
        db = %config.db_url,
        dev = config.dev_allow_anon,
        "starting arc gateway"
    );
    arc_gateway::server::run(config).await
}

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .try_init()?;
    }
    Ok(())
}
