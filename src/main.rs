use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveTime;
use clap::Parser;
use rust_decimal::Decimal;

use straddlebot::broker::{Broker, PaperBroker, ZerodhaBroker};
use straddlebot::config::Credentials;
use straddlebot::engine::{Engine, EngineConfig};
use straddlebot::history::HistoryStore;
use straddlebot::models::{Interval, ProductType};
use straddlebot::notify::{LogNotifier, Notifier, TelegramNotifier};
use straddlebot::strategy::short_straddle::underlying_quote_symbol;
use straddlebot::strategy::{nse_holidays_2025, ShortStraddle, StrategyConfig};

#[derive(Parser, Debug)]
#[command(
    name = "straddlebot",
    about = "Short straddle position monitor for Indian F&O"
)]
struct Cli {
    /// Broker backend (currently: zerodha)
    #[arg(long, default_value = "zerodha")]
    broker: String,

    /// Underlying index symbol
    #[arg(long, default_value = "BANKNIFTY")]
    symbol: String,

    /// Derivatives exchange for the option legs
    #[arg(long, default_value = "NFO")]
    exchange: String,

    #[arg(long, default_value_t = 1)]
    lots: i64,

    #[arg(long, default_value_t = 15)]
    lot_size: i64,

    /// Strike offset from ATM in points
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    strike_points: i64,

    /// Entry time, HH:MM exchange-local
    #[arg(long, default_value = "09:20")]
    entry_time: String,

    /// Exit time, HH:MM exchange-local
    #[arg(long, default_value = "15:15")]
    exit_time: String,

    /// Maximum loss in rupees before square-off
    #[arg(long, default_value = "5000")]
    stop_loss: Decimal,

    /// Profit target in rupees
    #[arg(long, default_value = "3000")]
    target: Decimal,

    /// Product type (MIS/NRML)
    #[arg(long, default_value = "MIS")]
    product: ProductType,

    /// Prefetch recent daily candles into the cache before starting
    #[arg(long)]
    fetch_history: bool,

    #[arg(long, default_value_t = 30)]
    history_days: i64,

    /// Simulate order execution; market data stays live
    #[arg(long)]
    paper_trading: bool,

    /// Seconds between monitoring cycles
    #[arg(long, default_value_t = 30)]
    cycle_interval: u64,

    /// SQLite file for the historical data cache
    #[arg(long, default_value = "data/historical.db")]
    db_path: String,

    /// Disable Telegram and log notifications instead
    #[arg(long)]
    no_telegram: bool,
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "straddlebot=info".into()),
        )
        .init();
}

fn parse_time(raw: &str) -> anyhow::Result<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .with_context(|| format!("invalid time {raw:?}, expected HH:MM"))
}

fn build_broker(cli: &Cli) -> anyhow::Result<Arc<dyn Broker>> {
    if cli.broker != "zerodha" {
        anyhow::bail!("unsupported broker {:?} (supported: zerodha)", cli.broker);
    }

    let credentials = Credentials::from_env("ZERODHA")?;
    let zerodha = ZerodhaBroker::new(&credentials);

    if cli.paper_trading {
        tracing::info!("paper trading enabled, orders will be simulated");
        Ok(Arc::new(PaperBroker::new(zerodha)))
    } else {
        Ok(Arc::new(zerodha))
    }
}

fn build_notifier(cli: &Cli) -> anyhow::Result<Arc<dyn Notifier>> {
    if cli.no_telegram {
        return Ok(Arc::new(LogNotifier));
    }

    match TelegramNotifier::from_env()? {
        Some(telegram) => Ok(Arc::new(telegram)),
        None => {
            tracing::info!("telegram credentials not set, notifications go to the log");
            Ok(Arc::new(LogNotifier))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();

    let config = StrategyConfig {
        strategy_name: format!("{}_short_straddle", cli.symbol.to_lowercase()),
        symbol: cli.symbol.clone(),
        exchange: cli.exchange.clone(),
        underlying_exchange: "NSE".to_string(),
        lot_size: cli.lot_size,
        lots: cli.lots,
        strike_points: cli.strike_points,
        entry_time: parse_time(&cli.entry_time)?,
        exit_time: parse_time(&cli.exit_time)?,
        stop_loss: cli.stop_loss,
        target: cli.target,
        product: cli.product,
        confirm_polls: 5,
        holidays: nse_holidays_2025(),
    };
    config.validate()?;

    let notifier = build_notifier(&cli)?;
    let broker = build_broker(&cli)?;

    let profile = broker.get_profile().await;
    match profile {
        Ok(profile) => tracing::info!(user = %profile.user_id, broker = %profile.broker, "connected"),
        Err(e) => tracing::warn!(error = %e, "profile check failed, continuing"),
    }

    let mut strategy = ShortStraddle::new(broker.clone(), notifier.clone(), config);

    if cli.fetch_history {
        let store = Arc::new(HistoryStore::connect(&cli.db_path).await?);
        let to = chrono::Local::now().naive_local();
        let from = to - chrono::Duration::days(cli.history_days);
        let underlying = underlying_quote_symbol(&cli.symbol);

        let candles = store
            .fetch_and_store(
                broker.as_ref(),
                underlying,
                "NSE",
                Interval::Day,
                from,
                to,
                false,
            )
            .await?;
        tracing::info!(count = candles.len(), days = cli.history_days, "historical candles ready");

        strategy = strategy.with_history(store);
    }

    let mut engine = Engine::new(
        Box::new(strategy),
        notifier,
        EngineConfig {
            cycle_interval: Duration::from_secs(cli.cycle_interval),
            ..Default::default()
        },
    );

    let stop = engine.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("ctrl-c received, stopping after current cycle");
            stop.store(true, Ordering::Relaxed);
        }
    });

    let outcome = engine.run().await?;
    tracing::info!(?outcome, "straddlebot done");

    Ok(())
}
