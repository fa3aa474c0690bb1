//! Ratekeeper CLI
//!
//! Converts amounts, syncs recent rates and manages manual rates against a
//! JSON rate file.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{Duration, NaiveDate};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ratekeeper_common::{Clock, CurrencyCode, CurrencyPair, SystemClock};
use ratekeeper_fx::{
    ConversionEngine, ConversionRequest, ExchangeRate, FxConfig, JsonFileRateRepository, RateKey,
    RateStore, SourcePriority,
};

/// Ratekeeper exchange rate CLI
#[derive(Parser, Debug)]
#[command(name = "ratekeeper")]
#[command(about = "Historical exchange rate resolution and conversion")]
struct Args {
    /// Rate file to read and update
    #[arg(long, default_value = "rates.json", global = true)]
    store: PathBuf,

    /// JSON configuration file; environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert an amount on a date
    Convert {
        #[arg(long)]
        amount: Decimal,
        #[arg(long)]
        from: CurrencyCode,
        #[arg(long)]
        to: CurrencyCode,
        /// Defaults to today (UTC)
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Fail instead of using the nearest stored rate
        #[arg(long)]
        no_fallback: bool,
        /// Return the unconverted amount when no rate exists
        #[arg(long)]
        allow_degraded: bool,
    },
    /// Fetch and store rates for recent dates
    Sync {
        /// Pairs such as USD:EUR,ILS:EUR
        #[arg(long, value_delimiter = ',', required = true)]
        pairs: Vec<CurrencyPair>,
        /// How many days back from today; defaults to, and is capped at, the freshness window
        #[arg(long)]
        days: Option<u32>,
    },
    /// Store a manual rate that outranks provider rates
    SetRate {
        #[arg(long)]
        from: CurrencyCode,
        #[arg(long)]
        to: CurrencyCode,
        #[arg(long)]
        date: NaiveDate,
        #[arg(long)]
        rate: Decimal,
    },
    /// Show the stored (or inverse-derived) rate for a date
    Show {
        #[arg(long)]
        from: CurrencyCode,
        #[arg(long)]
        to: CurrencyCode,
        #[arg(long)]
        date: NaiveDate,
    },
}

fn init_logging(json: bool) {
    let registry = tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
    ));
    let layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    if json {
        registry.with(layer.json()).init();
    } else {
        registry.with(layer).init();
    }
}

/// Keys for every pair on each of the `days` dates before `today`, plus today.
///
/// Dates that fall outside the calendar are dropped rather than wrapping.
fn sync_keys(pairs: &[CurrencyPair], today: NaiveDate, days: u32) -> Vec<RateKey> {
    pairs
        .iter()
        .flat_map(|pair| {
            (0..=days)
                .map_while(move |back| today.checked_sub_signed(Duration::days(i64::from(back))))
                .map(move |date| RateKey::new(pair.base.clone(), pair.quote.clone(), date))
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.json_logs);

    let config = match FxConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return Err(anyhow::anyhow!("Configuration error: {}", e));
        }
    };

    let repo = JsonFileRateRepository::open(&args.store)
        .with_context(|| format!("opening rate file {}", args.store.display()))?;
    let store = Arc::new(RateStore::new(Arc::new(repo)));

    // Ctrl+C aborts in-flight fetches; resolution then falls back to stored rates.
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; cancelling provider calls");
            on_signal.cancel();
        }
    });

    match args.command {
        Command::Convert {
            amount,
            from,
            to,
            date,
            no_fallback,
            allow_degraded,
        } => {
            let engine = ConversionEngine::from_config(config, store)?;
            let request = ConversionRequest::builder()
                .amount(amount)
                .from_currency(from)
                .to_currency(to)
                .on(date.unwrap_or_else(|| SystemClock.today()))
                .allow_fallback(!no_fallback)
                .allow_degraded(allow_degraded)
                .build()
                .context("incomplete conversion request")?;

            let result = engine.convert_with_cancel(request, &cancel).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Sync { pairs, days } => {
            // Older dates are outside the freshness window and would be skipped anyway.
            let window = config.recent_date_threshold_days;
            let days = match days {
                Some(requested) if requested > window => {
                    warn!(requested, window, "Capping sync to the freshness window");
                    window
                }
                Some(requested) => requested,
                None => window,
            };
            let engine = ConversionEngine::from_config(config, store)?;
            let today = SystemClock.today();

            let keys = sync_keys(&pairs, today, days);

            info!(pairs = pairs.len(), days, keys = keys.len(), "Syncing recent rates");
            let report = engine.scheduler().run(keys, &cancel).await;
            println!("{}", serde_json::to_string_pretty(&report)?);

            let stats = engine.stats().await?;
            info!(
                records = stats.store_records,
                in_flight = stats.provider.in_flight,
                "Sync complete"
            );
        }
        Command::SetRate { from, to, date, rate } => {
            config.supported_currencies.ensure(&from)?;
            config.supported_currencies.ensure(&to)?;

            let record = ExchangeRate::new(from, to, date, rate, "manual", SourcePriority::MANUAL);
            let outcome = store.store(record).await?;
            println!("{:?}", outcome);
        }
        Command::Show { from, to, date } => match store.lookup_exact(&from, &to, date).await? {
            Some(rate) => println!("{}", serde_json::to_string_pretty(&rate)?),
            None => println!("No rate stored for {}/{} on {}", from, to, date),
        },
    }

    Ok(())
}
