use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::str::FromStr;

use super::Broker;
use crate::config::Credentials;
use crate::error::Error;
use crate::models::{
    Candle, Interval, Margins, Order, OrderRequest, OrderStatus, Position, Profile, ProductType,
    Quote,
};
use crate::Result;

const KITE_BASE_URL: &str = "https://api.kite.trade";
const KITE_VERSION: &str = "3";

/// Zerodha Kite Connect v3 REST adapter.
///
/// Historical data requires the numeric instrument token of the symbol;
/// tokens for the common index underlyings ship as defaults, anything
/// else is supplied via [`ZerodhaBroker::with_instrument_tokens`].
pub struct ZerodhaBroker {
    client: Client,
    base_url: String,
    api_key: String,
    access_token: String,
    instrument_tokens: HashMap<String, u64>,
}

/// Instrument tokens for the index underlyings the strategies quote.
fn default_index_tokens() -> HashMap<String, u64> {
    HashMap::from([
        ("NSE:NIFTY 50".to_string(), 256265),
        ("NSE:NIFTY BANK".to_string(), 260105),
    ])
}

#[derive(Debug, Deserialize)]
struct KiteEnvelope<T> {
    status: String,
    data: Option<T>,
    message: Option<String>,
    #[serde(default)]
    error_type: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct KiteOhlc {
    #[serde(default)]
    open: Decimal,
    #[serde(default)]
    high: Decimal,
    #[serde(default)]
    low: Decimal,
    #[serde(default)]
    close: Decimal,
}

#[derive(Debug, Deserialize)]
struct KiteQuote {
    last_price: Decimal,
    #[serde(default)]
    volume: i64,
    #[serde(default)]
    oi: i64,
    #[serde(default)]
    ohlc: KiteOhlc,
}

#[derive(Debug, Deserialize)]
struct KitePositions {
    net: Vec<KitePosition>,
}

#[derive(Debug, Deserialize)]
struct KitePosition {
    tradingsymbol: String,
    exchange: String,
    product: String,
    quantity: i64,
    average_price: Decimal,
    last_price: Decimal,
    #[serde(default)]
    pnl: Decimal,
}

#[derive(Debug, Deserialize)]
struct KiteOrderId {
    order_id: String,
}

#[derive(Debug, Deserialize)]
struct KiteOrderEntry {
    order_id: String,
    status: String,
    #[serde(default)]
    filled_quantity: i64,
    #[serde(default)]
    average_price: Decimal,
}

#[derive(Debug, Deserialize)]
struct KiteCandles {
    candles: Vec<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct KiteMargins {
    equity: KiteSegmentMargin,
}

#[derive(Debug, Deserialize)]
struct KiteSegmentMargin {
    #[serde(default)]
    net: Decimal,
    available: KiteAvailable,
    utilised: KiteUtilised,
}

#[derive(Debug, Deserialize)]
struct KiteAvailable {
    #[serde(default)]
    cash: Decimal,
}

#[derive(Debug, Deserialize)]
struct KiteUtilised {
    #[serde(default)]
    debits: Decimal,
}

#[derive(Debug, Deserialize)]
struct KiteProfile {
    user_id: String,
    user_name: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    broker: Option<String>,
}

impl ZerodhaBroker {
    pub fn new(credentials: &Credentials) -> Self {
        Self {
            client: Client::new(),
            base_url: KITE_BASE_URL.to_string(),
            api_key: credentials.api_key.clone(),
            access_token: credentials.access_token.clone(),
            instrument_tokens: default_index_tokens(),
        }
    }

    /// Override the API host (tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Register symbol -> instrument token mappings for historical data.
    /// Keys are `EXCHANGE:SYMBOL`.
    pub fn with_instrument_tokens(mut self, tokens: HashMap<String, u64>) -> Self {
        self.instrument_tokens.extend(tokens);
        self
    }

    fn auth_header(&self) -> String {
        format!("token {}:{}", self.api_key, self.access_token)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .query(query)
            .header("X-Kite-Version", KITE_VERSION)
            .header("Authorization", self.auth_header())
            .send()
            .await?;

        let envelope: KiteEnvelope<T> = response.json().await?;
        Self::unwrap_envelope(envelope)
    }

    fn unwrap_envelope<T>(envelope: KiteEnvelope<T>) -> Result<T> {
        match envelope.data {
            Some(data) if envelope.status == "success" => Ok(data),
            _ => Err(Error::BrokerCall(format!(
                "{}: {}",
                envelope.error_type.as_deref().unwrap_or("ApiError"),
                envelope
                    .message
                    .as_deref()
                    .unwrap_or("unexpected broker response")
            ))),
        }
    }

    fn instrument_token(&self, symbol: &str, exchange: &str) -> Result<u64> {
        let key = format!("{exchange}:{symbol}");
        self.instrument_tokens
            .get(&key)
            .copied()
            .ok_or_else(|| Error::broker_call(format!("no instrument token registered for {key}")))
    }

    fn parse_candle(
        symbol: &str,
        exchange: &str,
        interval: Interval,
        row: &[serde_json::Value],
    ) -> Result<Candle> {
        if row.len() < 6 {
            return Err(Error::broker_call("malformed candle row from broker"));
        }

        let timestamp_str = row[0]
            .as_str()
            .ok_or_else(|| Error::broker_call("candle timestamp is not a string"))?;
        // Kite returns ISO timestamps with a zone offset, e.g. 2024-01-01T09:15:00+0530
        let timestamp = DateTime::parse_from_str(timestamp_str, "%Y-%m-%dT%H:%M:%S%z")
            .map(|dt| dt.naive_local())
            .or_else(|_| {
                NaiveDateTime::parse_from_str(timestamp_str, "%Y-%m-%dT%H:%M:%S")
            })
            .map_err(|e| Error::broker_call(format!("bad candle timestamp {timestamp_str}: {e}")))?;

        Ok(Candle {
            symbol: symbol.to_string(),
            exchange: exchange.to_string(),
            interval,
            timestamp,
            open: json_decimal(&row[1])?,
            high: json_decimal(&row[2])?,
            low: json_decimal(&row[3])?,
            close: json_decimal(&row[4])?,
            volume: row[5].as_i64().unwrap_or(0),
            oi: row.get(6).and_then(|v| v.as_i64()).unwrap_or(0),
        })
    }
}

fn json_decimal(value: &serde_json::Value) -> Result<Decimal> {
    match value {
        serde_json::Value::Number(n) => Decimal::from_str(&n.to_string())
            .map_err(|e| Error::broker_call(format!("bad price {n}: {e}"))),
        other => Err(Error::broker_call(format!("expected number, got {other}"))),
    }
}

fn parse_product(s: &str) -> ProductType {
    s.parse().unwrap_or(ProductType::Mis)
}

#[async_trait]
impl Broker for ZerodhaBroker {
    fn name(&self) -> &str {
        "zerodha"
    }

    async fn get_quote(&self, symbol: &str, exchange: &str) -> Result<Quote> {
        let key = format!("{exchange}:{symbol}");
        let data: HashMap<String, KiteQuote> =
            self.get_json("/quote", &[("i", key.as_str())]).await?;

        let quote = data
            .get(&key)
            .ok_or_else(|| Error::broker_call(format!("no quote returned for {key}")))?;

        Ok(Quote {
            symbol: symbol.to_string(),
            exchange: exchange.to_string(),
            last_price: quote.last_price,
            open: quote.ohlc.open,
            high: quote.ohlc.high,
            low: quote.ohlc.low,
            close: quote.ohlc.close,
            volume: quote.volume,
            oi: quote.oi,
            timestamp: None,
        })
    }

    async fn get_positions(&self) -> Result<Vec<Position>> {
        let data: KitePositions = self.get_json("/portfolio/positions", &[]).await?;

        Ok(data
            .net
            .into_iter()
            .map(|p| Position {
                symbol: p.tradingsymbol,
                exchange: p.exchange,
                product: parse_product(&p.product),
                quantity: p.quantity,
                average_price: p.average_price,
                last_price: p.last_price,
                pnl: p.pnl,
            })
            .collect())
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<String> {
        let quantity = order.quantity.to_string();
        let mut params = vec![
            ("tradingsymbol", order.symbol.as_str()),
            ("exchange", order.exchange.as_str()),
            ("transaction_type", order.transaction_type.as_str()),
            ("order_type", order.order_type.as_str()),
            ("quantity", quantity.as_str()),
            ("product", order.product.as_str()),
            ("validity", "DAY"),
        ];

        let price = order.price.map(|p| p.to_string());
        if let Some(ref p) = price {
            params.push(("price", p));
        }
        let trigger = order.trigger_price.map(|p| p.to_string());
        if let Some(ref t) = trigger {
            params.push(("trigger_price", t));
        }

        let response = self
            .client
            .post(format!("{}/orders/regular", self.base_url))
            .header("X-Kite-Version", KITE_VERSION)
            .header("Authorization", self.auth_header())
            .form(&params)
            .send()
            .await?;

        let envelope: KiteEnvelope<KiteOrderId> = response.json().await?;
        match envelope.data {
            Some(data) if envelope.status == "success" => {
                tracing::info!(
                    symbol = %order.symbol,
                    side = order.transaction_type.as_str(),
                    quantity = order.quantity,
                    order_id = %data.order_id,
                    "order placed"
                );
                Ok(data.order_id)
            }
            _ => Err(Error::OrderRejected(
                envelope
                    .message
                    .unwrap_or_else(|| "order refused without message".to_string()),
            )),
        }
    }

    async fn get_order(&self, order_id: &str) -> Result<Order> {
        // The endpoint returns the full status history; the last entry is current.
        let entries: Vec<KiteOrderEntry> =
            self.get_json(&format!("/orders/{order_id}"), &[]).await?;

        let last = entries
            .last()
            .ok_or_else(|| Error::broker_call(format!("no history for order {order_id}")))?;

        Ok(Order {
            order_id: last.order_id.clone(),
            status: OrderStatus::parse(&last.status),
            filled_quantity: last.filled_quantity,
            average_price: last.average_price,
        })
    }

    async fn get_historical_data(
        &self,
        symbol: &str,
        exchange: &str,
        from_date: NaiveDateTime,
        to_date: NaiveDateTime,
        interval: Interval,
    ) -> Result<Vec<Candle>> {
        let token = self.instrument_token(symbol, exchange)?;
        let from = from_date.format("%Y-%m-%d %H:%M:%S").to_string();
        let to = to_date.format("%Y-%m-%d %H:%M:%S").to_string();

        let data: KiteCandles = self
            .get_json(
                &format!("/instruments/historical/{token}/{}", interval.as_str()),
                &[("from", from.as_str()), ("to", to.as_str()), ("oi", "1")],
            )
            .await?;

        data.candles
            .iter()
            .map(|row| Self::parse_candle(symbol, exchange, interval, row))
            .collect()
    }

    async fn get_margins(&self) -> Result<Margins> {
        let data: KiteMargins = self.get_json("/user/margins", &[]).await?;

        Ok(Margins {
            available_cash: data.equity.available.cash,
            used_margin: data.equity.utilised.debits,
            total_margin: data.equity.net,
        })
    }

    async fn get_profile(&self) -> Result<Profile> {
        let data: KiteProfile = self.get_json("/user/profile", &[]).await?;

        Ok(Profile {
            user_id: data.user_id,
            user_name: data.user_name,
            email: data.email,
            broker: data.broker.unwrap_or_else(|| "ZERODHA".to_string()),
        })
    }
}
