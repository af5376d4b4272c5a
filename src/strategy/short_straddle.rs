use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use super::{
    Clock, ExitTrigger, Leg, SessionOutcome, Strategy, StrategyConfig, StrategyState, SystemClock,
};
use crate::broker::Broker;
use crate::history::HistoryStore;
use crate::models::{Interval, OrderRequest, OrderStatus, Position, TransactionType};
use crate::notify::{emit, Event, EventKind, Notifier};
use crate::Result;

/// Quote symbol of the index underlying an option series.
pub fn underlying_quote_symbol(symbol: &str) -> &str {
    match symbol.to_uppercase().as_str() {
        "BANKNIFTY" => "NIFTY BANK",
        "NIFTY" | "NIFTY50" => "NIFTY 50",
        "FINNIFTY" => "NIFTY FIN SERVICE",
        _ => symbol,
    }
}

/// Sell the ATM call and put at entry time, square off on stop-loss,
/// target, or exit time.
pub struct ShortStraddle {
    broker: Arc<dyn Broker>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    history: Option<Arc<HistoryStore>>,
    config: StrategyConfig,
}

impl ShortStraddle {
    pub fn new(
        broker: Arc<dyn Broker>,
        notifier: Arc<dyn Notifier>,
        config: StrategyConfig,
    ) -> Self {
        Self {
            broker,
            notifier,
            clock: Arc::new(SystemClock),
            history: None,
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Attach the candle cache used for the session's reference candle.
    pub fn with_history(mut self, history: Arc<HistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    fn strike_interval(&self) -> i64 {
        match self.config.symbol.to_uppercase().as_str() {
            "BANKNIFTY" | "SENSEX" => 100,
            "NIFTY" | "NIFTY50" | "FINNIFTY" => 50,
            _ => 100,
        }
    }

    fn atm_strike(&self, ltp: Decimal) -> i64 {
        let interval = Decimal::from(self.strike_interval());
        let strike = ((ltp / interval).round() * interval)
            .to_i64()
            .unwrap_or_default();
        strike + self.config.strike_points
    }

    /// Nearest weekly expiry for the configured symbol, rolled back over
    /// holidays. BANKNIFTY and FINNIFTY expire Wednesday, NIFTY Thursday;
    /// everything else uses the monthly last-Thursday expiry.
    fn expiry_date(&self, today: NaiveDate) -> NaiveDate {
        let wd = today.weekday().num_days_from_monday() as i64;

        let mut expiry = match self.config.symbol.to_uppercase().as_str() {
            "BANKNIFTY" | "FINNIFTY" => {
                if wd < 2 {
                    today + Duration::days(2 - wd)
                } else if wd == 2 {
                    today
                } else {
                    today + Duration::days(9 - wd)
                }
            }
            "NIFTY" | "NIFTY50" => {
                if wd < 3 {
                    today + Duration::days(3 - wd)
                } else if wd == 3 {
                    today
                } else {
                    today + Duration::days(10 - wd)
                }
            }
            _ => {
                let first_of_next = if today.month() == 12 {
                    NaiveDate::from_ymd_opt(today.year() + 1, 1, 1)
                } else {
                    NaiveDate::from_ymd_opt(today.year(), today.month() + 1, 1)
                }
                .unwrap_or(today);
                let last_day = first_of_next - Duration::days(1);
                let back = (last_day.weekday().num_days_from_monday() as i64 + 7 - 3) % 7;
                last_day - Duration::days(back)
            }
        };

        while self.config.holidays.contains(&expiry) {
            expiry = expiry - Duration::days(1);
        }

        expiry
    }

    /// NSE-format option symbol: SYMBOL + YY + MON + STRIKE + CE/PE.
    fn option_symbol(&self, expiry: NaiveDate, strike: i64, option_type: &str) -> String {
        format!(
            "{}{}{}{}{}",
            self.config.symbol.to_uppercase(),
            expiry.format("%y"),
            expiry.format("%b").to_string().to_uppercase(),
            strike,
            option_type
        )
    }

    fn is_market_holiday(&self, date: NaiveDate) -> bool {
        date.weekday().num_days_from_monday() >= 5 || self.config.holidays.contains(&date)
    }

    fn market_open(&self, now: NaiveDateTime) -> bool {
        if self.is_market_holiday(now.date()) {
            return false;
        }
        let open = NaiveTime::from_hms_opt(9, 15, 0).unwrap();
        let close = NaiveTime::from_hms_opt(15, 30, 0).unwrap();
        now.time() >= open && now.time() <= close
    }

    /// Aggregate session P&L from the broker's live positions.
    fn session_pnl(&self, legs: &[Leg], positions: &[Position]) -> Decimal {
        legs.iter()
            .filter_map(|leg| positions.iter().find(|p| p.symbol == leg.symbol))
            .map(|p| p.mtm())
            .sum()
    }

    async fn place_leg(
        &self,
        symbol: &str,
        transaction_type: TransactionType,
        quantity: i64,
    ) -> Result<Leg> {
        let order = OrderRequest::market(
            symbol,
            &self.config.exchange,
            transaction_type,
            quantity,
            self.config.product,
        );
        let order_id = self.broker.place_order(&order).await?;

        // Prefer the traded average price; fall back to the quote.
        let entry_price = match self.broker.get_order(&order_id).await {
            Ok(o) if o.average_price > Decimal::ZERO => o.average_price,
            _ => {
                self.broker
                    .get_quote(symbol, &self.config.exchange)
                    .await?
                    .last_price
            }
        };

        emit(
            self.notifier.as_ref(),
            Event::new(EventKind::OrderPlaced)
                .with("symbol", symbol)
                .with("side", transaction_type.as_str())
                .with("quantity", quantity)
                .with("price", entry_price)
                .with("order_id", &order_id),
        )
        .await;

        Ok(Leg {
            symbol: symbol.to_string(),
            exchange: self.config.exchange.clone(),
            transaction_type,
            quantity,
            entry_price,
            order_id,
        })
    }

    async fn try_enter(&self, now: NaiveDateTime) -> Result<StrategyState> {
        if let Some(history) = &self.history {
            match history
                .latest_candle(
                    &self.config.symbol,
                    &self.config.underlying_exchange,
                    Interval::Day,
                )
                .await
            {
                Ok(Some(candle)) => {
                    tracing::info!(prev_close = %candle.close, as_of = %candle.timestamp, "reference candle");
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "reference candle lookup failed"),
            }
        }

        let underlying = underlying_quote_symbol(&self.config.symbol);
        let ltp = self
            .broker
            .get_ltp(underlying, &self.config.underlying_exchange)
            .await?;

        let strike = self.atm_strike(ltp);
        let expiry = self.expiry_date(now.date());
        let call_symbol = self.option_symbol(expiry, strike, "CE");
        let put_symbol = self.option_symbol(expiry, strike, "PE");
        let quantity = self.config.quantity();

        tracing::info!(
            %ltp,
            strike,
            %expiry,
            call = %call_symbol,
            put = %put_symbol,
            quantity,
            "entry conditions met, selling straddle"
        );

        let call_leg = match self
            .place_leg(&call_symbol, TransactionType::Sell, quantity)
            .await
        {
            Ok(leg) => leg,
            Err(e) => {
                tracing::error!(error = %e, symbol = %call_symbol, "entry order failed");
                emit(
                    self.notifier.as_ref(),
                    Event::new(EventKind::OrderRejected)
                        .with("symbol", &call_symbol)
                        .with("error", &e),
                )
                .await;
                return Ok(StrategyState::Waiting);
            }
        };

        let put_leg = match self
            .place_leg(&put_symbol, TransactionType::Sell, quantity)
            .await
        {
            Ok(leg) => leg,
            Err(e) => {
                // One-legged straddle: unwind the call so a retry next
                // cycle cannot double it.
                tracing::error!(error = %e, symbol = %put_symbol, "second leg failed, unwinding first");
                if let Err(unwind) = self
                    .place_leg(&call_symbol, TransactionType::Buy, quantity)
                    .await
                {
                    tracing::error!(error = %unwind, symbol = %call_symbol, "unwind failed, manual intervention required");
                    emit(
                        self.notifier.as_ref(),
                        Event::new(EventKind::Fatal)
                            .with("symbol", &call_symbol)
                            .with("error", &unwind)
                            .with("action", "unwind of lone entry leg failed"),
                    )
                    .await;
                }
                emit(
                    self.notifier.as_ref(),
                    Event::new(EventKind::OrderRejected)
                        .with("symbol", &put_symbol)
                        .with("error", &e),
                )
                .await;
                return Ok(StrategyState::Waiting);
            }
        };

        let combined_premium = call_leg.entry_price + put_leg.entry_price;
        emit(
            self.notifier.as_ref(),
            Event::new(EventKind::PositionOpened)
                .with("call", &call_leg.symbol)
                .with("call_price", call_leg.entry_price)
                .with("put", &put_leg.symbol)
                .with("put_price", put_leg.entry_price)
                .with("combined_premium", combined_premium)
                .with("quantity", quantity),
        )
        .await;

        Ok(StrategyState::Entered {
            legs: vec![call_leg, put_leg],
        })
    }

    async fn monitor(&self, now: NaiveDateTime, legs: &[Leg]) -> Result<StrategyState> {
        let positions = self.broker.get_positions().await?;
        let pnl = self.session_pnl(legs, &positions);
        tracing::debug!(%pnl, "mark to market");

        // Capital preservation first: stop-loss wins when both print in
        // the same cycle. Thresholds are inclusive.
        let trigger = if pnl <= -self.config.stop_loss {
            Some(ExitTrigger::StopLoss)
        } else if pnl >= self.config.target {
            Some(ExitTrigger::Target)
        } else if now.time() >= self.config.exit_time {
            Some(ExitTrigger::ExitTime)
        } else {
            None
        };

        let Some(trigger) = trigger else {
            return Ok(StrategyState::Entered {
                legs: legs.to_vec(),
            });
        };

        let (kind, reason) = match trigger {
            ExitTrigger::StopLoss => (EventKind::StopLossHit, "stop loss breached"),
            ExitTrigger::Target => (EventKind::TargetHit, "target reached"),
            ExitTrigger::ExitTime => (EventKind::Info, "exit time reached"),
        };
        tracing::warn!(%pnl, reason, "squaring off");
        emit(
            self.notifier.as_ref(),
            Event::new(kind).with("pnl", pnl).with("reason", reason),
        )
        .await;

        match self.square_off(legs, &positions).await {
            Ok(order_ids) => Ok(StrategyState::Exiting {
                order_ids,
                polls_left: self.config.confirm_polls,
                trigger,
                pnl,
            }),
            Err(e) => {
                // State must not advance on a failed exit order; flat
                // legs are skipped when the next cycle retries.
                tracing::error!(error = %e, "square-off failed, will retry next cycle");
                emit(
                    self.notifier.as_ref(),
                    Event::new(EventKind::OrderRejected)
                        .with("action", "square-off")
                        .with("error", &e),
                )
                .await;
                Ok(StrategyState::Entered {
                    legs: legs.to_vec(),
                })
            }
        }
    }

    /// Offsetting market orders for every session leg the broker still
    /// reports open.
    async fn square_off(&self, legs: &[Leg], positions: &[Position]) -> Result<Vec<String>> {
        let mut order_ids = Vec::new();

        for leg in legs {
            let Some(position) = positions
                .iter()
                .find(|p| p.symbol == leg.symbol && p.is_open())
            else {
                continue;
            };

            let transaction_type = if position.quantity < 0 {
                TransactionType::Buy
            } else {
                TransactionType::Sell
            };
            let order = OrderRequest::market(
                &position.symbol,
                &position.exchange,
                transaction_type,
                position.quantity.abs(),
                position.product,
            );
            let order_id = self.broker.place_order(&order).await?;
            tracing::info!(symbol = %position.symbol, %order_id, "square-off placed");
            order_ids.push(order_id);
        }

        Ok(order_ids)
    }

    async fn confirm_exit(
        &self,
        order_ids: &[String],
        polls_left: u32,
        trigger: ExitTrigger,
        pnl: Decimal,
    ) -> Result<StrategyState> {
        let mut all_filled = true;
        for order_id in order_ids {
            let order = self.broker.get_order(order_id).await?;
            if order.status != OrderStatus::Complete {
                tracing::debug!(%order_id, status = ?order.status, "square-off not yet filled");
                all_filled = false;
            }
        }

        if all_filled {
            let outcome = SessionOutcome::SquaredOff { trigger, pnl };
            emit(
                self.notifier.as_ref(),
                Event::new(EventKind::PositionClosed)
                    .with("pnl", pnl)
                    .with("trigger", format!("{trigger:?}")),
            )
            .await;
            return Ok(StrategyState::Done { outcome });
        }

        if polls_left <= 1 {
            tracing::error!("square-off fills unconfirmed after poll budget");
            emit(
                self.notifier.as_ref(),
                Event::new(EventKind::Error)
                    .with("error", "square-off fill confirmation exhausted")
                    .with("orders", order_ids.join(",")),
            )
            .await;
            return Ok(StrategyState::Done {
                outcome: SessionOutcome::ConfirmUnresolved { trigger, pnl },
            });
        }

        Ok(StrategyState::Exiting {
            order_ids: order_ids.to_vec(),
            polls_left: polls_left - 1,
            trigger,
            pnl,
        })
    }
}

#[async_trait]
impl Strategy for ShortStraddle {
    fn name(&self) -> &str {
        &self.config.strategy_name
    }

    async fn run_cycle(&mut self, state: &StrategyState) -> Result<StrategyState> {
        let now = self.clock.now();

        match state {
            StrategyState::Waiting => {
                if now.time() >= self.config.exit_time {
                    tracing::info!("exit time passed with no entry, session over");
                    emit(
                        self.notifier.as_ref(),
                        Event::new(EventKind::Info).with("message", "entry window expired"),
                    )
                    .await;
                    return Ok(StrategyState::Done {
                        outcome: SessionOutcome::EntryWindowExpired,
                    });
                }
                if now.time() < self.config.entry_time {
                    return Ok(StrategyState::Waiting);
                }
                if !self.market_open(now) {
                    tracing::debug!("market closed or holiday, not entering");
                    return Ok(StrategyState::Waiting);
                }
                self.try_enter(now).await
            }
            StrategyState::Entered { legs } => self.monitor(now, legs).await,
            StrategyState::Exiting {
                order_ids,
                polls_left,
                trigger,
                pnl,
            } => {
                self.confirm_exit(order_ids, *polls_left, *trigger, *pnl)
                    .await
            }
            StrategyState::Done { outcome } => Ok(StrategyState::Done {
                outcome: outcome.clone(),
            }),
        }
    }
}
