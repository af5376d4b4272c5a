// Trading strategy module
pub mod short_straddle;

pub use short_straddle::ShortStraddle;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;

use crate::error::Error;
use crate::models::{ProductType, TransactionType};
use crate::Result;

/// Wall-clock source, injectable so tests can replay whole sessions
/// without real delays.
pub trait Clock: Send + Sync {
    /// Exchange-local wall time.
    fn now(&self) -> NaiveDateTime;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }
}

/// One leg of the session's position, as recorded at entry.
///
/// Advisory mirror only; the broker's live positions are authoritative.
#[derive(Debug, Clone, PartialEq)]
pub struct Leg {
    pub symbol: String,
    pub exchange: String,
    pub transaction_type: TransactionType,
    pub quantity: i64,
    pub entry_price: Decimal,
    pub order_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitTrigger {
    StopLoss,
    Target,
    ExitTime,
}

/// Why a session reached DONE.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    /// All legs squared off and confirmed.
    SquaredOff { trigger: ExitTrigger, pnl: Decimal },
    /// Square-off placed but fills never confirmed within the poll budget.
    ConfirmUnresolved { trigger: ExitTrigger, pnl: Decimal },
    /// Exit time passed while still waiting to enter.
    EntryWindowExpired,
    /// External stop signal.
    Stopped,
}

/// Session state machine. An owned value passed to and returned from
/// each cycle; entry happens at most once and exit at most once per
/// session regardless of how many cycles observe the trigger.
#[derive(Debug, Clone, PartialEq)]
pub enum StrategyState {
    Waiting,
    Entered {
        legs: Vec<Leg>,
    },
    Exiting {
        order_ids: Vec<String>,
        polls_left: u32,
        trigger: ExitTrigger,
        pnl: Decimal,
    },
    Done {
        outcome: SessionOutcome,
    },
}

impl StrategyState {
    pub fn is_done(&self) -> bool {
        matches!(self, StrategyState::Done { .. })
    }
}

/// A polled trading strategy.
///
/// `run_cycle` must not mutate broker state on error paths: the caller
/// keeps the previous state whenever `Err` is returned.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    async fn run_cycle(&mut self, state: &StrategyState) -> Result<StrategyState>;
}

/// Configuration for a straddle session.
#[derive(Debug, Clone)]
pub struct StrategyConfig {
    pub strategy_name: String,
    /// Underlying index symbol, e.g. BANKNIFTY.
    pub symbol: String,
    /// Derivatives exchange the option legs trade on.
    pub exchange: String,
    /// Exchange the underlying index is quoted on.
    pub underlying_exchange: String,
    pub lot_size: i64,
    pub lots: i64,
    /// Strike offset from ATM in points; positive for ITM, negative for OTM.
    pub strike_points: i64,
    pub entry_time: NaiveTime,
    pub exit_time: NaiveTime,
    /// Loss limit in account currency; breached when session P&L <= -stop_loss.
    pub stop_loss: Decimal,
    /// Profit limit in account currency; breached when session P&L >= target.
    pub target: Decimal,
    pub product: ProductType,
    /// Square-off fill confirmation polls before giving up.
    pub confirm_polls: u32,
    pub holidays: Vec<NaiveDate>,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            strategy_name: "short_straddle".to_string(),
            symbol: "BANKNIFTY".to_string(),
            exchange: "NFO".to_string(),
            underlying_exchange: "NSE".to_string(),
            lot_size: 15,
            lots: 1,
            strike_points: 0,
            entry_time: NaiveTime::from_hms_opt(9, 20, 0).unwrap(),
            exit_time: NaiveTime::from_hms_opt(15, 15, 0).unwrap(),
            stop_loss: Decimal::from(5000),
            target: Decimal::from(3000),
            product: ProductType::Mis,
            confirm_polls: 5,
            holidays: nse_holidays_2025(),
        }
    }
}

impl StrategyConfig {
    pub fn quantity(&self) -> i64 {
        self.lots * self.lot_size
    }

    /// Fatal at startup if parameters are unusable.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.symbol.trim().is_empty() {
            problems.push("symbol is empty".to_string());
        }
        if self.lots <= 0 {
            problems.push(format!("lots must be positive, got {}", self.lots));
        }
        if self.lot_size <= 0 {
            problems.push(format!("lot_size must be positive, got {}", self.lot_size));
        }
        if self.stop_loss <= Decimal::ZERO {
            problems.push(format!("stop_loss must be positive, got {}", self.stop_loss));
        }
        if self.target <= Decimal::ZERO {
            problems.push(format!("target must be positive, got {}", self.target));
        }
        if self.entry_time >= self.exit_time {
            problems.push(format!(
                "entry_time {} must precede exit_time {}",
                self.entry_time, self.exit_time
            ));
        }
        if self.confirm_polls == 0 {
            problems.push("confirm_polls must be at least 1".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(problems.join("; ")))
        }
    }
}

/// NSE trading holidays for calendar year 2025.
pub fn nse_holidays_2025() -> Vec<NaiveDate> {
    [
        (2025, 1, 26),
        (2025, 3, 14),
        (2025, 3, 31),
        (2025, 4, 11),
        (2025, 4, 14),
        (2025, 4, 18),
        (2025, 5, 1),
        (2025, 8, 15),
        (2025, 10, 2),
        (2025, 10, 31),
        (2025, 11, 15),
        (2025, 12, 25),
    ]
    .iter()
    .filter_map(|&(y, m, d)| NaiveDate::from_ymd_opt(y, m, d))
    .collect()
}
