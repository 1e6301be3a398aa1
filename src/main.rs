use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bitcoin::Network;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};

use btc_ledger_tally::chain::{BlockCypherClient, ChainClient, EsploraClient};
use btc_ledger_tally::config::{mask_secret, parse_network, EngineConfig, PgConfig};
use btc_ledger_tally::ledger::TallyOptions;
use btc_ledger_tally::runtime::IngestDriver;
use btc_ledger_tally::service::LedgerService;
use btc_ledger_tally::setup_store;
use btc_ledger_tally::signature::BitcoinMessageVerifier;

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Provider {
    Esplora,
    Blockcypher,
}

#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    #[arg(long, env = "NETWORK_TYPE", default_value = "testnet", value_parser = parse_network)]
    network: Network,

    /// Default confirmation depth.
    #[arg(long, env = "EXPECTED_CONFIRMATIONS", default_value_t = 6)]
    confirmations: u32,

    #[arg(long, env = "POSTGRES_HOST")]
    postgres_host: Option<String>,

    #[arg(long, env = "POSTGRES_PORT")]
    postgres_port: Option<u16>,

    #[arg(long, env = "POSTGRES_DB")]
    postgres_db: Option<String>,

    #[arg(long, env = "POSTGRES_USER")]
    postgres_user: Option<String>,

    #[arg(long, env = "POSTGRES_PASSWORD", hide_env_values = true)]
    postgres_password: Option<String>,

    #[arg(long, env = "POSTGRES_SSL")]
    postgres_ssl: bool,

    #[arg(long, value_enum, default_value_t = Provider::Esplora)]
    provider: Provider,

    /// Overrides the provider's public endpoint for the network.
    #[arg(long)]
    chain_api_url: Option<String>,

    #[arg(long, env = "BLOCKCYPHER_TOKEN", hide_env_values = true)]
    blockcypher_token: Option<String>,

    #[arg(long, default_value_t = 30)]
    request_timeout_secs: u64,

    #[arg(long, default_value_t = 30)]
    poll_interval_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the ledger tables.
    Migrate,
    /// Follow the chain until Ctrl-C.
    Ingest,
    /// Print the tally between two addresses as JSON.
    Tally {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        max_most_recent: Option<usize>,
        /// RFC 3339, exclusive.
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        #[arg(long)]
        tally_only: bool,
        #[arg(long)]
        include_refunds: bool,
        #[arg(long, default_value_t = 0)]
        confirmations: u32,
    },
    /// Check a signed message; `--message` is base64.
    Verify {
        #[arg(long)]
        address: String,
        #[arg(long)]
        signature: String,
        #[arg(long)]
        message: String,
        #[arg(long)]
        skip_ledger: bool,
    },
    /// Print the health report as JSON.
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = EngineConfig {
        network: args.network,
        confirmations: args.confirmations,
        request_timeout: Duration::from_secs(args.request_timeout_secs),
        poll_interval: Duration::from_secs(args.poll_interval_secs),
        ..EngineConfig::default()
    }
    .validate()?;

    let pg = PgConfig::from_parts(
        args.postgres_host.clone(),
        args.postgres_port,
        args.postgres_db.clone(),
        args.postgres_user.clone(),
        args.postgres_password.clone(),
        args.postgres_ssl,
    )?;

    log::info!("[MAIN] engine config: {:?}", config);
    log::info!("[MAIN] postgres config: {:?}", pg);
    log::info!(
        "[MAIN] provider: {:?} url={:?} token={:?}",
        args.provider,
        args.chain_api_url,
        args.blockcypher_token.as_deref().map(mask_secret)
    );

    let store = Arc::new(setup_store(&pg, &config).await?);

    if let Command::Migrate = args.command {
        println!("[MAIN] schema up to date");
        return Ok(());
    }

    let chain = build_chain(&args, &config)?;

    match args.command {
        Command::Migrate => {}

        Command::Ingest => {
            let driver = IngestDriver::new(store, chain, config);
            driver
                .run_forever(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        log::error!("[MAIN] cannot listen for Ctrl-C: {}", e);
                    }
                })
                .await;
        }

        Command::Tally {
            from,
            to,
            max_most_recent,
            since,
            tally_only,
            include_refunds,
            confirmations,
        } => {
            let service = build_service(store, chain, config);
            let opts = TallyOptions {
                max_most_recent,
                since,
                tally_only,
                include_refunds,
                confirmations,
            };
            let result = service.get_transactions(&from, &to, &opts).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }

        Command::Verify {
            address,
            signature,
            message,
            skip_ledger,
        } => {
            let service = build_service(store, chain, config);
            service
                .is_signature_valid(&signature, &message, &address, skip_ledger)
                .await?;
            println!("{}", serde_json::json!({ "valid": true }));
        }

        Command::Health => {
            let service = build_service(store, chain, config);
            let report = service.get_health().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.healthy {
                anyhow::bail!("ledger is unhealthy");
            }
        }
    }

    Ok(())
}

fn build_chain(args: &Args, config: &EngineConfig) -> Result<Arc<dyn ChainClient>> {
    let timeout = config.request_timeout;
    let chain: Arc<dyn ChainClient> = match args.provider {
        Provider::Esplora => {
            let url = match &args.chain_api_url {
                Some(url) => url.clone(),
                None => EsploraClient::default_url(config.network)?.to_string(),
            };
            Arc::new(EsploraClient::new(url, timeout)?)
        }
        Provider::Blockcypher => {
            let url = match &args.chain_api_url {
                Some(url) => url.clone(),
                None => BlockCypherClient::default_url(config.network)?,
            };
            Arc::new(BlockCypherClient::new(url, args.blockcypher_token.clone(), timeout)?)
        }
    };
    Ok(chain)
}

fn build_service<S>(store: Arc<S>, chain: Arc<dyn ChainClient>, config: EngineConfig) -> LedgerService<S, dyn ChainClient>
where
    S: btc_ledger_tally::ledger::LedgerStore,
{
    let verifier = Arc::new(BitcoinMessageVerifier::new(config.network));
    LedgerService::new(store, chain, verifier, config)
}
