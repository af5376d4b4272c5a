use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Candle interval, using the wire names brokers expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    Minute,
    FiveMinute,
    FifteenMinute,
    Day,
    Week,
}

impl Interval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::Minute => "minute",
            Interval::FiveMinute => "5minute",
            Interval::FifteenMinute => "15minute",
            Interval::Day => "day",
            Interval::Week => "week",
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "minute" => Ok(Interval::Minute),
            "5minute" => Ok(Interval::FiveMinute),
            "15minute" => Ok(Interval::FifteenMinute),
            "day" => Ok(Interval::Day),
            "week" => Ok(Interval::Week),
            other => Err(format!("unknown interval: {other}")),
        }
    }
}

/// One OHLC candle. Uniquely identified by
/// (symbol, exchange, interval, timestamp); immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub exchange: String,
    pub interval: Interval,
    pub timestamp: NaiveDateTime,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: i64,
    /// Open interest, zero for non-derivatives.
    pub oi: i64,
}

/// Record of a date range already retrieved from the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRecord {
    pub symbol: String,
    pub exchange: String,
    pub interval: Interval,
    pub from_date: NaiveDateTime,
    pub to_date: NaiveDateTime,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionType {
    Buy,
    Sell,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Buy => "BUY",
            TransactionType::Sell => "SELL",
        }
    }

    /// The side that offsets this one when squaring off.
    pub fn opposite(&self) -> TransactionType {
        match self {
            TransactionType::Buy => TransactionType::Sell,
            TransactionType::Sell => TransactionType::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    StopLossMarket,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::StopLossMarket => "SL-M",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProductType {
    /// Intraday
    Mis,
    /// Carry-forward
    Nrml,
    /// Cash and carry
    Cnc,
}

impl ProductType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductType::Mis => "MIS",
            ProductType::Nrml => "NRML",
            ProductType::Cnc => "CNC",
        }
    }
}

impl FromStr for ProductType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "MIS" => Ok(ProductType::Mis),
            "NRML" => Ok(ProductType::Nrml),
            "CNC" => Ok(ProductType::Cnc),
            other => Err(format!("unknown product type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Open,
    Complete,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    /// Map a broker status string onto the standardized set.
    pub fn parse(s: &str) -> OrderStatus {
        match s.to_uppercase().as_str() {
            "COMPLETE" => OrderStatus::Complete,
            "OPEN" => OrderStatus::Open,
            "CANCELLED" => OrderStatus::Cancelled,
            "REJECTED" => OrderStatus::Rejected,
            _ => OrderStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Complete | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }
}

/// Quote snapshot for a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub exchange: String,
    pub last_price: Decimal,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: i64,
    pub oi: i64,
    pub timestamp: Option<NaiveDateTime>,
}

/// Broker-owned position mirror, refreshed every cycle.
///
/// The broker's live response is authoritative; values held here are
/// advisory and only used to detect transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub exchange: String,
    pub product: ProductType,
    /// Net quantity; negative means short.
    pub quantity: i64,
    pub average_price: Decimal,
    pub last_price: Decimal,
    /// Broker-reported P&L.
    pub pnl: Decimal,
}

impl Position {
    /// Exact mark-to-market in the account currency.
    ///
    /// Short: (entry - current) x |qty|. Long: (current - entry) x qty.
    pub fn mtm(&self) -> Decimal {
        let qty = Decimal::from(self.quantity.abs());
        if self.quantity < 0 {
            (self.average_price - self.last_price) * qty
        } else {
            (self.last_price - self.average_price) * qty
        }
    }

    pub fn is_open(&self) -> bool {
        self.quantity != 0
    }
}

/// Order parameters accepted by every broker adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub exchange: String,
    pub transaction_type: TransactionType,
    pub quantity: i64,
    pub order_type: OrderType,
    pub price: Option<Decimal>,
    pub product: ProductType,
    pub trigger_price: Option<Decimal>,
}

impl OrderRequest {
    pub fn market(
        symbol: impl Into<String>,
        exchange: impl Into<String>,
        transaction_type: TransactionType,
        quantity: i64,
        product: ProductType,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            exchange: exchange.into(),
            transaction_type,
            quantity,
            order_type: OrderType::Market,
            price: None,
            product,
            trigger_price: None,
        }
    }
}

/// Order state as reported by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub status: OrderStatus,
    pub filled_quantity: i64,
    pub average_price: Decimal,
}

/// Account margin summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Margins {
    pub available_cash: Decimal,
    pub used_margin: Decimal,
    pub total_margin: Decimal,
}

/// Account profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: String,
    pub user_name: String,
    pub email: Option<String>,
    pub broker: String,
}
