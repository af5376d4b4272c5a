// Broker capability interface and adapters
pub mod paper;
pub mod zerodha;

pub use paper::PaperBroker;
pub use zerodha::ZerodhaBroker;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use rust_decimal::Decimal;

use crate::models::{Candle, Interval, Margins, Order, OrderRequest, Position, Profile, Quote};
use crate::Result;

/// Capability set the trading core consumes.
///
/// The core never depends on a specific broker's wire format - one
/// adapter per broker implements this trait.
#[async_trait]
pub trait Broker: Send + Sync {
    fn name(&self) -> &str;

    async fn get_quote(&self, symbol: &str, exchange: &str) -> Result<Quote>;

    /// Last traded price, from the full quote.
    async fn get_ltp(&self, symbol: &str, exchange: &str) -> Result<Decimal> {
        Ok(self.get_quote(symbol, exchange).await?.last_price)
    }

    async fn get_positions(&self) -> Result<Vec<Position>>;

    /// Place an order and return the broker order id.
    async fn place_order(&self, order: &OrderRequest) -> Result<String>;

    async fn get_order(&self, order_id: &str) -> Result<Order>;

    async fn get_historical_data(
        &self,
        symbol: &str,
        exchange: &str,
        from_date: NaiveDateTime,
        to_date: NaiveDateTime,
        interval: Interval,
    ) -> Result<Vec<Candle>>;

    async fn get_margins(&self) -> Result<Margins>;

    async fn get_profile(&self) -> Result<Profile>;
}
