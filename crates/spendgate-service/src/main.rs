use clap::{Parser, ValueEnum};
use spendgate_core::LedgerStorageConfig;
use spendgate_service::{build_router, ServiceConfig, ServiceState};
use std::collections::HashMap;
use std::net::SocketAddr;
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LedgerStorageMode {
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Parser)]
#[command(name = "spendgated", version, about = "Purchase authorization REST service")]
struct Cli {
    /// REST socket address to bind, e.g. 127.0.0.1:8097
    #[arg(long, default_value = "127.0.0.1:8097")]
    listen: SocketAddr,
    /// Bearer token to user mapping, `token:user`. Repeatable.
    #[arg(long = "api-token", value_name = "TOKEN:USER")]
    api_tokens: Vec<String>,
    /// Ledger persistence backend. `auto` picks postgres when a database url is configured.
    #[arg(long, value_enum, default_value_t = LedgerStorageMode::Auto, env = "SPENDGATE_LEDGER_STORAGE")]
    ledger_storage: LedgerStorageMode,
    /// PostgreSQL url for wallet ledger persistence.
    #[arg(long, env = "SPENDGATE_LEDGER_DATABASE_URL")]
    ledger_database_url: Option<String>,
    /// Max PostgreSQL pool connections for ledger persistence.
    #[arg(long, default_value_t = 5, env = "SPENDGATE_LEDGER_PG_MAX_CONNECTIONS")]
    ledger_pg_max_connections: u32,
    /// Funded-session lifetime before the auto-drain timer fires.
    #[arg(long, default_value_t = 600, env = "SPENDGATE_FUNDING_TIMEOUT_SECS")]
    funding_timeout_secs: i64,
    /// Purchase-count velocity window, in days.
    #[arg(long, default_value_t = 7, env = "SPENDGATE_VELOCITY_WINDOW_DAYS")]
    velocity_window_days: i64,
}

fn resolve_ledger_storage(cli: &Cli) -> anyhow::Result<LedgerStorageConfig> {
    let resolved_url = cli
        .ledger_database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());

    let storage = match cli.ledger_storage {
        LedgerStorageMode::Memory => LedgerStorageConfig::Memory,
        LedgerStorageMode::Postgres => {
            let database_url = resolved_url.ok_or_else(|| {
                anyhow::anyhow!(
                    "ledger_storage=postgres requires --ledger-database-url or DATABASE_URL"
                )
            })?;
            LedgerStorageConfig::postgres(database_url, cli.ledger_pg_max_connections)
        }
        LedgerStorageMode::Auto => {
            if let Some(database_url) = resolved_url {
                LedgerStorageConfig::postgres(database_url, cli.ledger_pg_max_connections)
            } else {
                LedgerStorageConfig::Memory
            }
        }
    };

    Ok(storage)
}

fn resolve_api_tokens(cli: &Cli) -> anyhow::Result<HashMap<String, String>> {
    if cli.api_tokens.is_empty() {
        return Ok(ServiceConfig::default().api_tokens);
    }

    let mut tokens = HashMap::new();
    for pair in &cli.api_tokens {
        let (token, user) = pair.split_once(':').ok_or_else(|| {
            anyhow::anyhow!("invalid --api-token '{pair}'; expected TOKEN:USER")
        })?;
        if token.is_empty() || user.is_empty() {
            anyhow::bail!("invalid --api-token '{pair}'; token and user must be non-empty");
        }
        tokens.insert(token.to_string(), user.to_string());
    }
    Ok(tokens)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "spendgate_service=info,info".to_string()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = ServiceConfig {
        ledger_storage: resolve_ledger_storage(&cli)?,
        api_tokens: resolve_api_tokens(&cli)?,
        ..ServiceConfig::default()
    };
    config.engine.funding_timeout_secs = cli.funding_timeout_secs;
    config.engine.velocity_window_days = cli.velocity_window_days;

    let state = ServiceState::bootstrap(config).await?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!("spendgate-service listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
