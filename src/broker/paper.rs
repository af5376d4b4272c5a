use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use uuid::Uuid;

use super::Broker;
use crate::error::Error;
use crate::models::{
    Candle, Interval, Margins, Order, OrderRequest, OrderStatus, Position, Profile, ProductType,
    Quote, TransactionType,
};
use crate::Result;

#[derive(Debug, Clone)]
struct PaperPosition {
    exchange: String,
    product: ProductType,
    quantity: i64,
    average_price: Decimal,
    last_price: Decimal,
    realized_pnl: Decimal,
}

/// Simulated order execution over a real market-data source.
///
/// Market data calls delegate to the wrapped broker; orders fill
/// immediately at the live quote and feed a local position book. No
/// request ever reaches the real order endpoints.
pub struct PaperBroker<B> {
    inner: B,
    book: Mutex<HashMap<String, PaperPosition>>,
    orders: Mutex<HashMap<String, Order>>,
}

impl<B: Broker> PaperBroker<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            book: Mutex::new(HashMap::new()),
            orders: Mutex::new(HashMap::new()),
        }
    }

    /// The wrapped market-data source.
    pub fn market_data(&self) -> &B {
        &self.inner
    }

    /// Total realized P&L across all simulated positions.
    pub fn realized_pnl(&self) -> Decimal {
        let book = self.book.lock().unwrap();
        book.values().map(|p| p.realized_pnl).sum()
    }

    fn apply_fill(&self, order: &OrderRequest, fill_price: Decimal) {
        let signed = match order.transaction_type {
            TransactionType::Buy => order.quantity,
            TransactionType::Sell => -order.quantity,
        };

        let mut book = self.book.lock().unwrap();
        let entry = book
            .entry(order.symbol.clone())
            .or_insert_with(|| PaperPosition {
                exchange: order.exchange.clone(),
                product: order.product,
                quantity: 0,
                average_price: Decimal::ZERO,
                last_price: fill_price,
                realized_pnl: Decimal::ZERO,
            });

        entry.last_price = fill_price;

        if entry.quantity == 0 || entry.quantity.signum() == signed.signum() {
            // Opening or adding: weighted average entry price
            let old_abs = Decimal::from(entry.quantity.abs());
            let new_abs = Decimal::from(signed.abs());
            entry.average_price = if entry.quantity == 0 {
                fill_price
            } else {
                (entry.average_price * old_abs + fill_price * new_abs) / (old_abs + new_abs)
            };
            entry.quantity += signed;
            return;
        }

        // Reducing or closing: realize P&L on the closed portion
        let closed = signed.abs().min(entry.quantity.abs());
        let closed_qty = Decimal::from(closed);
        let per_unit = if entry.quantity < 0 {
            entry.average_price - fill_price
        } else {
            fill_price - entry.average_price
        };
        entry.realized_pnl += per_unit * closed_qty;
        entry.quantity += signed;

        if entry.quantity == 0 {
            entry.average_price = Decimal::ZERO;
        } else if entry.quantity.signum() == signed.signum() {
            // Crossed through flat; remainder opens a fresh position
            entry.average_price = fill_price;
        }
    }
}

#[async_trait]
impl<B: Broker> Broker for PaperBroker<B> {
    fn name(&self) -> &str {
        "paper"
    }

    async fn get_quote(&self, symbol: &str, exchange: &str) -> Result<Quote> {
        self.inner.get_quote(symbol, exchange).await
    }

    async fn get_positions(&self) -> Result<Vec<Position>> {
        // Refresh marks before reporting, without holding the lock across awaits
        let symbols: Vec<(String, String)> = {
            let book = self.book.lock().unwrap();
            book.iter()
                .map(|(symbol, p)| (symbol.clone(), p.exchange.clone()))
                .collect()
        };

        let mut marks = HashMap::new();
        for (symbol, exchange) in symbols {
            if let Ok(ltp) = self.inner.get_ltp(&symbol, &exchange).await {
                marks.insert(symbol, ltp);
            }
        }

        let mut book = self.book.lock().unwrap();
        Ok(book
            .iter_mut()
            .map(|(symbol, p)| {
                if let Some(&ltp) = marks.get(symbol) {
                    p.last_price = ltp;
                }
                let mut position = Position {
                    symbol: symbol.clone(),
                    exchange: p.exchange.clone(),
                    product: p.product,
                    quantity: p.quantity,
                    average_price: p.average_price,
                    last_price: p.last_price,
                    pnl: p.realized_pnl,
                };
                position.pnl += position.mtm();
                position
            })
            .collect())
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<String> {
        let fill_price = match order.price {
            Some(limit) => limit,
            None => self.inner.get_ltp(&order.symbol, &order.exchange).await?,
        };

        self.apply_fill(order, fill_price);

        let order_id = format!("PAPER-{}", Uuid::new_v4());
        self.orders.lock().unwrap().insert(
            order_id.clone(),
            Order {
                order_id: order_id.clone(),
                status: OrderStatus::Complete,
                filled_quantity: order.quantity,
                average_price: fill_price,
            },
        );

        tracing::info!(
            symbol = %order.symbol,
            side = order.transaction_type.as_str(),
            quantity = order.quantity,
            fill = %fill_price,
            %order_id,
            "[paper] order filled"
        );

        Ok(order_id)
    }

    async fn get_order(&self, order_id: &str) -> Result<Order> {
        self.orders
            .lock()
            .unwrap()
            .get(order_id)
            .cloned()
            .ok_or_else(|| Error::broker_call(format!("unknown paper order {order_id}")))
    }

    async fn get_historical_data(
        &self,
        symbol: &str,
        exchange: &str,
        from_date: NaiveDateTime,
        to_date: NaiveDateTime,
        interval: Interval,
    ) -> Result<Vec<Candle>> {
        self.inner
            .get_historical_data(symbol, exchange, from_date, to_date, interval)
            .await
    }

    async fn get_margins(&self) -> Result<Margins> {
        self.inner.get_margins().await
    }

    async fn get_profile(&self) -> Result<Profile> {
        self.inner.get_profile().await
    }
}
