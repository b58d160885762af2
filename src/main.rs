use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use xrpl_market_data::api::{self, ApiState};
use xrpl_market_data::config::Settings;
use xrpl_market_data::engine::table::{sort_rows, BarRow, MarketTable};
use xrpl_market_data::engine::types::AssetPair;
use xrpl_market_data::market_data::adapters::retry::RetryPolicy;
use xrpl_market_data::market_data::adapters::xrpl::{HttpTransport, XrplClient};
use xrpl_market_data::market_data::adapters::LedgerSource;
use xrpl_market_data::market_data::export;
use xrpl_market_data::market_data::normaliser::NormaliseError;
use xrpl_market_data::market_data::reserves;
use xrpl_market_data::market_data::scanner::{ScanState, Scanner};
use xrpl_market_data::persist::{CheckpointStore, SledStore};
use xrpl_market_data::telemetry;

#[derive(Parser, Debug)]
#[command(name = "xrpl-market-data", version, about = "Builds OHLCV market bars from XRP Ledger history")]
struct Cli {
    /// Directory holding default.toml / local.toml
    #[arg(long, default_value = "config")]
    config_dir: PathBuf,

    /// Overrides `rpc_endpoint_url`
    #[arg(long)]
    endpoint: Option<String>,

    /// Overrides `store_path`
    #[arg(long)]
    store: Option<PathBuf>,

    /// Overrides `bucket_width_seconds`
    #[arg(long)]
    bucket_width: Option<i64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan ledgers from the stored cursor and build bars
    Scan {
        #[arg(long)]
        start: Option<u32>,
        #[arg(long)]
        end: Option<u32>,
        /// Serve the read-only API on this address while scanning
        #[arg(long)]
        serve: Option<SocketAddr>,
    },
    /// Write stored bars to CSV
    Export {
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        pair: Option<String>,
        #[arg(long)]
        closed_only: bool,
    },
    /// Fetch one account's history (e.g. an AMM pool) and write its events to CSV
    Trades {
        #[arg(long)]
        account: String,
        #[arg(long)]
        min: Option<u32>,
        #[arg(long)]
        max: Option<u32>,
        #[arg(long)]
        out: PathBuf,
        /// Also write the bar table built from the events
        #[arg(long)]
        bars: Option<PathBuf>,
        /// Also write the pool's post-trade reserves (account must be an AMM pool)
        #[arg(long)]
        reserves: Option<PathBuf>,
        /// Minimum seconds between kept reserve samples; 0 keeps all
        #[arg(long, default_value_t = 0)]
        sample_interval: i64,
        #[arg(long, default_value_t = 200)]
        page_limit: u32,
    },
    /// Print the latest validated ledger index
    Latest,
}

fn build_client(settings: &Settings) -> anyhow::Result<XrplClient<HttpTransport>> {
    let transport = HttpTransport::new(&settings.rpc_endpoint_url, settings.request_timeout(), settings.classifier())?;
    let policy: RetryPolicy = settings.retry_policy();
    info!(
        endpoint = %settings.rpc_endpoint_url,
        max_retries = policy.max_retries,
        "Configured XRPL client"
    );
    Ok(XrplClient::new(transport, policy))
}

/// Resolves once `true` is sent. Never resolves if the sender goes away first.
async fn shutdown_signal(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn scan(settings: Settings, serve: Option<SocketAddr>) -> anyhow::Result<()> {
    let client = Arc::new(build_client(&settings)?);
    let store = SledStore::open(&settings.store_path)
        .with_context(|| format!("opening store at {}", settings.store_path.display()))?;
    let reader = store.clone();
    let table = MarketTable::new(settings.bucket_width_seconds)?;
    let mut scanner = Scanner::new(client, store, settings.normaliser()?, table, settings.scanner_config())?;
    scanner.resume().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, finishing the current ledger");
            let _ = shutdown_tx.send(true);
        }
    });

    let server = match serve {
        Some(addr) => {
            let app = api::router(ApiState::new(scanner.subscribe(), Arc::new(reader)));
            let listener = tokio::net::TcpListener::bind(addr).await?;
            info!(%addr, "API listening");
            let stop = shutdown_signal(shutdown_rx.clone());
            Some(tokio::spawn(async move { axum::serve(listener, app).with_graceful_shutdown(stop).await }))
        }
        None => None,
    };

    let report = scanner.run(shutdown_signal(shutdown_rx)).await;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if let Some(server) = server {
        if !report.is_stalled() {
            info!("Scan finished, API keeps serving until Ctrl-C");
        }
        server.await??;
    }
    if let ScanState::Stalled { index, reason } = &report.state {
        bail!("scan stalled at ledger {}: {}", index, reason);
    }
    Ok(())
}

async fn export_bars(settings: &Settings, out: PathBuf, pair: Option<String>, closed_only: bool) -> anyhow::Result<()> {
    let pair: Option<AssetPair> = pair.map(|p| p.parse()).transpose()?;
    let store = SledStore::open(&settings.store_path)?;

    let mut rows: Vec<BarRow> = store
        .closed_bars(pair.as_ref())
        .await?
        .into_iter()
        .map(BarRow::closed)
        .collect();
    if !closed_only {
        if let Some(checkpoint) = store.load_checkpoint().await? {
            rows.extend(
                checkpoint
                    .open_bars
                    .into_iter()
                    .filter(|bar| pair.as_ref().map_or(true, |p| &bar.pair == p))
                    .map(BarRow::open),
            );
        }
    }
    sort_rows(&mut rows);

    let written = export::write_bars_file(&out, &rows)?;
    info!(written, out = %out.display(), "Exported bars");
    Ok(())
}

struct TradesOutput {
    events: PathBuf,
    bars: Option<PathBuf>,
    reserves: Option<PathBuf>,
    sample_interval: i64,
}

fn skip(error: &NormaliseError) {
    match error {
        NormaliseError::AmountOutOfRange { .. } => warn!(error = %error, "Skipping transaction with out-of-range amount"),
        NormaliseError::MalformedTransaction { .. } => warn!(error = %error, "Skipping malformed transaction"),
    }
}

async fn trades(
    settings: &Settings,
    account: &str,
    range: (Option<u32>, Option<u32>),
    output: TradesOutput,
    page_limit: u32,
) -> anyhow::Result<()> {
    if output.sample_interval < 0 {
        bail!("--sample-interval must be >= 0, got {}", output.sample_interval);
    }
    let client = build_client(settings)?;
    let normaliser = settings.normaliser()?;
    let raw = client.account_transactions(account, range.0, range.1, page_limit).await?;

    let mut events = Vec::new();
    let mut samples = Vec::new();
    for tx in raw {
        if output.reserves.is_some() {
            match normaliser.reserve_sample(&tx) {
                Ok(Some(sample)) if sample.pool == account => samples.push(sample),
                Ok(_) => {}
                Err(e) => skip(&e),
            }
        }
        match normaliser.normalize(tx) {
            Ok(Some(event)) => events.push(event),
            Ok(None) => {}
            Err(e) => skip(&e),
        }
    }
    let out = output.events;
    let bars = output.bars;
    events.sort_by_key(|e| (e.ledger_index, e.timestamp));
    let written = export::write_events_file(&out, &events)?;
    info!(account, written, out = %out.display(), "Exported events");

    if let Some(path) = bars {
        let mut table = MarketTable::new(settings.bucket_width_seconds)?;
        for event in events.iter().filter(|e| settings.bar_tx_types.contains(&e.tx_type)) {
            table.ingest(event)?;
        }
        let mut rows: Vec<BarRow> = table.drain_closed().into_iter().map(BarRow::closed).collect();
        rows.extend(table.open_rows());
        sort_rows(&mut rows);
        let written = export::write_bars_file(&path, &rows)?;
        info!(written, out = %path.display(), "Exported bars");
    }

    if let Some(path) = output.reserves {
        samples.sort_by_key(|s| (s.ledger_index, s.timestamp));
        let total = samples.len();
        let kept = reserves::thin(samples, chrono::Duration::seconds(output.sample_interval));
        let written = export::write_reserves_file(&path, &kept)?;
        info!(account, total, written, out = %path.display(), "Exported pool reserves");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut settings = Settings::load_from(&cli.config_dir)?;
    if let Some(endpoint) = cli.endpoint {
        settings.rpc_endpoint_url = endpoint;
    }
    if let Some(store) = cli.store {
        settings.store_path = store;
    }
    if let Some(width) = cli.bucket_width {
        settings.bucket_width_seconds = width;
    }
    if let Command::Scan { start, end, .. } = &cli.command {
        settings.start_ledger_index = start.or(settings.start_ledger_index);
        settings.end_ledger_index = end.or(settings.end_ledger_index);
    }
    settings.validate()?;

    telemetry::init_tracing(&settings.log_filter);
    telemetry::init_metrics()?;

    match cli.command {
        Command::Scan { serve, .. } => scan(settings, serve).await,
        Command::Export { out, pair, closed_only } => export_bars(&settings, out, pair, closed_only).await,
        Command::Trades { account, min, max, out, bars, reserves, sample_interval, page_limit } => {
            let output = TradesOutput { events: out, bars, reserves, sample_interval };
            trades(&settings, &account, (min, max), output, page_limit).await
        }
        Command::Latest => {
            let client = build_client(&settings)?;
            println!("{}", client.latest_validated_index().await?);
            Ok(())
        }
    }
}
