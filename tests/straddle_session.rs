use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use straddlebot::broker::{Broker, PaperBroker};
use straddlebot::engine::{Engine, EngineConfig};
use straddlebot::models::{
    Candle, Interval, Margins, Order, OrderRequest, Position, Profile, Quote,
};
use straddlebot::notify::LogNotifier;
use straddlebot::strategy::{
    Clock, ExitTrigger, SessionOutcome, ShortStraddle, StrategyConfig, StrategyState,
};
use straddlebot::{Error, Result};
use tokio_test::assert_ok;

const CALL: &str = "BANKNIFTY25JAN48100CE";
const PUT: &str = "BANKNIFTY25JAN48100PE";

struct FixedClock(Mutex<NaiveDateTime>);

impl FixedClock {
    fn at(datetime: &str) -> Arc<Self> {
        Arc::new(Self(Mutex::new(parse_dt(datetime))))
    }

    fn set(&self, datetime: &str) {
        *self.0.lock().unwrap() = parse_dt(datetime);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        *self.0.lock().unwrap()
    }
}

fn parse_dt(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
}

/// Live-quote stand-in: a mutable price board, nothing else.
struct PriceBoard {
    prices: Mutex<HashMap<String, Decimal>>,
}

impl PriceBoard {
    fn new() -> Self {
        Self {
            prices: Mutex::new(HashMap::new()),
        }
    }

    fn set(&self, symbol: &str, price: Decimal) {
        self.prices
            .lock()
            .unwrap()
            .insert(symbol.to_string(), price);
    }
}

#[async_trait]
impl Broker for PriceBoard {
    fn name(&self) -> &str {
        "priceboard"
    }

    async fn get_quote(&self, symbol: &str, exchange: &str) -> Result<Quote> {
        let price = self
            .prices
            .lock()
            .unwrap()
            .get(symbol)
            .copied()
            .ok_or_else(|| Error::broker_call(format!("no quote for {symbol}")))?;
        Ok(Quote {
            symbol: symbol.to_string(),
            exchange: exchange.to_string(),
            last_price: price,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 0,
            oi: 0,
            timestamp: None,
        })
    }

    async fn get_positions(&self) -> Result<Vec<Position>> {
        Ok(Vec::new())
    }

    async fn place_order(&self, _order: &OrderRequest) -> Result<String> {
        Err(Error::broker_call("price board cannot trade"))
    }

    async fn get_order(&self, _order_id: &str) -> Result<Order> {
        Err(Error::broker_call("price board has no orders"))
    }

    async fn get_historical_data(
        &self,
        _symbol: &str,
        _exchange: &str,
        _from_date: NaiveDateTime,
        _to_date: NaiveDateTime,
        _interval: Interval,
    ) -> Result<Vec<Candle>> {
        Ok(Vec::new())
    }

    async fn get_margins(&self) -> Result<Margins> {
        Err(Error::broker_call("price board has no account"))
    }

    async fn get_profile(&self) -> Result<Profile> {
        Err(Error::broker_call("price board has no account"))
    }
}

fn session_fixture(
    clock: Arc<FixedClock>,
) -> (Arc<PaperBroker<PriceBoard>>, Engine) {
    let board = PriceBoard::new();
    board.set("NIFTY BANK", dec!(48123.45));
    board.set(CALL, dec!(192.75));
    board.set(PUT, dec!(192.75));

    let paper = Arc::new(PaperBroker::new(board));
    let notifier = Arc::new(LogNotifier);

    let config = StrategyConfig {
        entry_time: NaiveTime::from_hms_opt(9, 20, 0).unwrap(),
        exit_time: NaiveTime::from_hms_opt(15, 15, 0).unwrap(),
        stop_loss: dec!(5000),
        target: dec!(3000),
        ..Default::default()
    };
    config.validate().unwrap();

    let strategy =
        ShortStraddle::new(paper.clone(), notifier.clone(), config).with_clock(clock);

    let engine = Engine::new(
        Box::new(strategy),
        notifier,
        EngineConfig {
            cycle_interval: std::time::Duration::from_millis(1),
            max_consecutive_failures: 3,
        },
    );

    (paper, engine)
}

fn board(paper: &PaperBroker<PriceBoard>) -> &PriceBoard {
    paper.market_data()
}

#[tokio::test]
async fn test_full_session_stop_loss_path() {
    // Tuesday 2025-01-07; BANKNIFTY weekly expiry Wed 2025-01-08
    let clock = FixedClock::at("2025-01-07 09:19:00");
    let (paper, mut engine) = session_fixture(clock.clone());

    // Before entry time nothing happens
    assert!(!engine.step().await.unwrap());
    assert_eq!(engine.state(), &StrategyState::Waiting);
    assert!(paper.get_positions().await.unwrap().is_empty());

    // Entry time: both legs sold at 192.75
    clock.set("2025-01-07 09:20:00");
    assert!(!engine.step().await.unwrap());
    let StrategyState::Entered { legs } = engine.state() else {
        panic!("expected Entered, got {:?}", engine.state());
    };
    assert_eq!(legs.len(), 2);
    assert_eq!(
        legs[0].entry_price + legs[1].entry_price,
        dec!(385.50)
    );

    let positions = paper.get_positions().await.unwrap();
    assert_eq!(positions.len(), 2);
    assert!(positions.iter().all(|p| p.quantity == -15));

    // Quiet cycles change nothing
    clock.set("2025-01-07 10:00:00");
    assert!(!engine.step().await.unwrap());
    assert!(matches!(engine.state(), StrategyState::Entered { .. }));

    // Premium blows out: combined 750.00 against 385.50 entered.
    // P&L = (385.50 - 750.00) x 15 = -5467.50 <= -5000
    board(&paper).set(CALL, dec!(400.00));
    board(&paper).set(PUT, dec!(350.00));
    clock.set("2025-01-07 11:30:00");

    assert!(!engine.step().await.unwrap());
    let StrategyState::Exiting { trigger, pnl, .. } = engine.state() else {
        panic!("expected Exiting, got {:?}", engine.state());
    };
    assert_eq!(*trigger, ExitTrigger::StopLoss);
    assert_eq!(*pnl, dec!(-5467.50));

    // Square-off buys already filled in the paper book
    let positions = paper.get_positions().await.unwrap();
    assert!(positions.iter().all(|p| p.quantity == 0));

    // Confirmation poll completes the session
    assert!(engine.step().await.unwrap());
    assert_eq!(
        engine.state(),
        &StrategyState::Done {
            outcome: SessionOutcome::SquaredOff {
                trigger: ExitTrigger::StopLoss,
                pnl: dec!(-5467.50),
            }
        }
    );
    assert_eq!(paper.realized_pnl(), dec!(-5467.50));

    // DONE is terminal: no further broker activity, book unchanged
    assert!(engine.step().await.unwrap());
    assert_eq!(paper.realized_pnl(), dec!(-5467.50));
}

#[tokio::test]
async fn test_full_session_target_path() {
    let clock = FixedClock::at("2025-01-07 09:20:00");
    let (paper, mut engine) = session_fixture(clock.clone());

    assert!(!engine.step().await.unwrap());
    assert!(matches!(engine.state(), StrategyState::Entered { .. }));

    // Premium decays to 180.00 combined:
    // P&L = (385.50 - 180.00) x 15 = 3082.50 >= 3000
    board(&paper).set(CALL, dec!(100.00));
    board(&paper).set(PUT, dec!(80.00));
    clock.set("2025-01-07 14:00:00");

    assert!(!engine.step().await.unwrap());
    assert!(matches!(
        engine.state(),
        StrategyState::Exiting {
            trigger: ExitTrigger::Target,
            ..
        }
    ));

    assert!(engine.step().await.unwrap());
    assert_eq!(paper.realized_pnl(), dec!(3082.50));
}

#[tokio::test]
async fn test_full_session_forced_exit_at_exit_time() {
    let clock = FixedClock::at("2025-01-07 09:20:00");
    let (paper, mut engine) = session_fixture(clock.clone());

    assert!(!engine.step().await.unwrap());

    // Small drift either way, no threshold breached all day
    board(&paper).set(CALL, dec!(190.00));
    board(&paper).set(PUT, dec!(185.00));
    clock.set("2025-01-07 15:15:00");

    assert!(!engine.step().await.unwrap());
    assert!(matches!(
        engine.state(),
        StrategyState::Exiting {
            trigger: ExitTrigger::ExitTime,
            ..
        }
    ));

    assert!(engine.step().await.unwrap());
    // (385.50 - 375.00) x 15 = 157.50
    assert_eq!(paper.realized_pnl(), dec!(157.50));

    let outcome = tokio_test::assert_ok!(match engine.state() {
        StrategyState::Done { outcome } => Ok::<_, Error>(outcome.clone()),
        other => Err(Error::broker_call(format!("not done: {other:?}"))),
    });
    assert!(matches!(
        outcome,
        SessionOutcome::SquaredOff {
            trigger: ExitTrigger::ExitTime,
            ..
        }
    ));
}
