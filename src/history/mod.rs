use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{Duration, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use crate::broker::Broker;
use crate::error::Error;
use crate::models::{Candle, FetchRecord, Interval};
use crate::Result;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS historical_data (
        symbol    TEXT NOT NULL,
        exchange  TEXT NOT NULL,
        interval  TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        open      TEXT NOT NULL,
        high      TEXT NOT NULL,
        low       TEXT NOT NULL,
        close     TEXT NOT NULL,
        volume    INTEGER NOT NULL,
        oi        INTEGER NOT NULL DEFAULT 0,
        fetched_at TEXT NOT NULL,
        PRIMARY KEY (symbol, exchange, interval, timestamp)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS fetch_metadata (
        id        INTEGER PRIMARY KEY AUTOINCREMENT,
        symbol    TEXT NOT NULL,
        exchange  TEXT NOT NULL,
        interval  TEXT NOT NULL,
        from_date TEXT NOT NULL,
        to_date   TEXT NOT NULL,
        records_count INTEGER NOT NULL DEFAULT 0,
        fetched_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_fetch_metadata_lookup
    ON fetch_metadata (symbol, exchange, interval)
    "#,
];

/// Inclusive datetime range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub from: NaiveDateTime,
    pub to: NaiveDateTime,
}

/// Cache statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub total_candles: i64,
    pub unique_symbols: i64,
    pub fetch_records: i64,
}

/// SQLite-backed historical data cache.
///
/// Candle insertion is idempotent on (symbol, exchange, interval,
/// timestamp); fetch_metadata tracks which ranges have already been
/// retrieved so covered requests are served without a broker call.
pub struct HistoryStore {
    pool: SqlitePool,
}

impl HistoryStore {
    /// Open (creating if missing) the cache database and its tables.
    ///
    /// Accepts a plain file path or a `sqlite:` URL such as
    /// `sqlite::memory:`.
    pub async fn connect(path: &str) -> Result<Self> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite://{path}")
        };

        let options = SqliteConnectOptions::from_str(&url)
            .map_err(Error::CacheWrite)?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(Error::CacheWrite)?;

        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(Error::CacheWrite)?;
        }

        tracing::info!(db = %path, "historical data cache ready");

        Ok(Self { pool })
    }

    /// Return candles for `[from, to]`, fetching only what the cache is
    /// missing.
    ///
    /// When existing fetch records fully cover the range and
    /// `force_refresh` is false, no broker call is made. Broker failures
    /// surface to the caller and never leave a fetch record behind for
    /// the failed range.
    pub async fn fetch_and_store(
        &self,
        broker: &dyn Broker,
        symbol: &str,
        exchange: &str,
        interval: Interval,
        from: NaiveDateTime,
        to: NaiveDateTime,
        force_refresh: bool,
    ) -> Result<Vec<Candle>> {
        let requested = DateRange { from, to };

        let missing = if force_refresh {
            vec![requested]
        } else {
            let covered = self
                .covered_ranges(symbol, exchange, interval, requested)
                .await?;
            missing_ranges(requested, &covered)
        };

        if missing.is_empty() {
            tracing::debug!(symbol, exchange, %interval, "range fully cached, serving from store");
            return self.load_candles(symbol, exchange, interval, from, to).await;
        }

        let mut fetched = Vec::new();
        for gap in &missing {
            tracing::info!(
                symbol,
                exchange,
                %interval,
                from = %gap.from,
                to = %gap.to,
                "fetching missing range from {}",
                broker.name()
            );

            let candles = broker
                .get_historical_data(symbol, exchange, gap.from, gap.to, interval)
                .await?;

            match self.store_candles(&candles).await {
                Ok(inserted) => {
                    let record = FetchRecord {
                        symbol: symbol.to_string(),
                        exchange: exchange.to_string(),
                        interval,
                        from_date: gap.from,
                        to_date: gap.to,
                        fetched_at: Utc::now(),
                    };
                    match self.record_fetch(&record, candles.len() as i64).await {
                        Ok(()) => {
                            tracing::info!(fetched = candles.len(), inserted, "range cached")
                        }
                        Err(e) => tracing::error!(error = %e, "failed to record fetched range"),
                    }
                }
                Err(e) => {
                    // Candles are still returned below; the range stays
                    // unmarked so the next request re-fetches it.
                    tracing::error!(error = %e, "failed to persist candles, range not marked as fetched");
                }
            }

            fetched.extend(candles);
        }

        // Union of cached and freshly fetched, ascending by timestamp.
        let cached = match self.load_candles(symbol, exchange, interval, from, to).await {
            Ok(candles) => candles,
            Err(e) => {
                tracing::warn!(error = %e, "cache read failed, returning fetched candles only");
                Vec::new()
            }
        };

        let mut merged: BTreeMap<NaiveDateTime, Candle> =
            cached.into_iter().map(|c| (c.timestamp, c)).collect();
        for candle in fetched {
            if candle.timestamp >= from && candle.timestamp <= to {
                merged.insert(candle.timestamp, candle);
            }
        }

        Ok(merged.into_values().collect())
    }

    /// Merged coverage from fetch records overlapping `requested`.
    async fn covered_ranges(
        &self,
        symbol: &str,
        exchange: &str,
        interval: Interval,
        requested: DateRange,
    ) -> Result<Vec<DateRange>> {
        let rows = sqlx::query(
            r#"
            SELECT from_date, to_date
            FROM fetch_metadata
            WHERE symbol = ? AND exchange = ? AND interval = ?
              AND NOT (to_date < ? OR from_date > ?)
            ORDER BY from_date ASC
            "#,
        )
        .bind(symbol)
        .bind(exchange)
        .bind(interval.as_str())
        .bind(requested.from)
        .bind(requested.to)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::CacheRead)?;

        let ranges = rows
            .iter()
            .map(|row| DateRange {
                from: row.get("from_date"),
                to: row.get("to_date"),
            })
            .collect();

        Ok(merge_ranges(ranges))
    }

    /// Idempotent candle insertion; returns the number of new rows.
    pub async fn store_candles(&self, candles: &[Candle]) -> Result<u64> {
        if candles.is_empty() {
            return Ok(0);
        }

        let fetched_at = Utc::now();
        let mut tx = self.pool.begin().await.map_err(Error::CacheWrite)?;
        let mut inserted = 0;

        for candle in candles {
            let result = sqlx::query(
                r#"
                INSERT INTO historical_data
                    (symbol, exchange, interval, timestamp,
                     open, high, low, close, volume, oi, fetched_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (symbol, exchange, interval, timestamp) DO NOTHING
                "#,
            )
            .bind(&candle.symbol)
            .bind(&candle.exchange)
            .bind(candle.interval.as_str())
            .bind(candle.timestamp)
            .bind(candle.open.to_string())
            .bind(candle.high.to_string())
            .bind(candle.low.to_string())
            .bind(candle.close.to_string())
            .bind(candle.volume)
            .bind(candle.oi)
            .bind(fetched_at)
            .execute(&mut *tx)
            .await
            .map_err(Error::CacheWrite)?;

            inserted += result.rows_affected();
        }

        tx.commit().await.map_err(Error::CacheWrite)?;
        Ok(inserted)
    }

    async fn record_fetch(&self, record: &FetchRecord, records_count: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO fetch_metadata
                (symbol, exchange, interval, from_date, to_date, records_count, fetched_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.symbol)
        .bind(&record.exchange)
        .bind(record.interval.as_str())
        .bind(record.from_date)
        .bind(record.to_date)
        .bind(records_count)
        .bind(record.fetched_at)
        .execute(&self.pool)
        .await
        .map_err(Error::CacheWrite)?;

        Ok(())
    }

    /// Candles in `[from, to]` ordered by timestamp ascending.
    pub async fn load_candles(
        &self,
        symbol: &str,
        exchange: &str,
        interval: Interval,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Result<Vec<Candle>> {
        let rows = sqlx::query(
            r#"
            SELECT symbol, exchange, interval, timestamp,
                   open, high, low, close, volume, oi
            FROM historical_data
            WHERE symbol = ? AND exchange = ? AND interval = ?
              AND timestamp >= ? AND timestamp <= ?
            ORDER BY timestamp ASC
            "#,
        )
        .bind(symbol)
        .bind(exchange)
        .bind(interval.as_str())
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::CacheRead)?;

        rows.iter().map(row_to_candle).collect()
    }

    /// Most recent stored candle for the series, if any.
    pub async fn latest_candle(
        &self,
        symbol: &str,
        exchange: &str,
        interval: Interval,
    ) -> Result<Option<Candle>> {
        let row = sqlx::query(
            r#"
            SELECT symbol, exchange, interval, timestamp,
                   open, high, low, close, volume, oi
            FROM historical_data
            WHERE symbol = ? AND exchange = ? AND interval = ?
            ORDER BY timestamp DESC
            LIMIT 1
            "#,
        )
        .bind(symbol)
        .bind(exchange)
        .bind(interval.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::CacheRead)?;

        row.as_ref().map(row_to_candle).transpose()
    }

    /// Delete matching candles and fetch records. Omitted filters mean
    /// "all".
    pub async fn clear_cache(
        &self,
        symbol: Option<&str>,
        exchange: Option<&str>,
    ) -> Result<u64> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM historical_data
            WHERE (?1 IS NULL OR symbol = ?1) AND (?2 IS NULL OR exchange = ?2)
            "#,
        )
        .bind(symbol)
        .bind(exchange)
        .execute(&self.pool)
        .await
        .map_err(Error::CacheWrite)?;

        sqlx::query(
            r#"
            DELETE FROM fetch_metadata
            WHERE (?1 IS NULL OR symbol = ?1) AND (?2 IS NULL OR exchange = ?2)
            "#,
        )
        .bind(symbol)
        .bind(exchange)
        .execute(&self.pool)
        .await
        .map_err(Error::CacheWrite)?;

        tracing::info!(
            symbol = symbol.unwrap_or("*"),
            exchange = exchange.unwrap_or("*"),
            rows = deleted.rows_affected(),
            "cache cleared"
        );

        Ok(deleted.rows_affected())
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        let row = sqlx::query(
            r#"
            SELECT (SELECT COUNT(*) FROM historical_data) AS total_candles,
                   (SELECT COUNT(DISTINCT symbol) FROM historical_data) AS unique_symbols,
                   (SELECT COUNT(*) FROM fetch_metadata) AS fetch_records
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Error::CacheRead)?;

        Ok(CacheStats {
            total_candles: row.get("total_candles"),
            unique_symbols: row.get("unique_symbols"),
            fetch_records: row.get("fetch_records"),
        })
    }
}

fn row_to_candle(row: &SqliteRow) -> Result<Candle> {
    Ok(Candle {
        symbol: row.get("symbol"),
        exchange: row.get("exchange"),
        interval: parse_column::<Interval>(row, "interval")?,
        timestamp: row.get("timestamp"),
        open: parse_column::<Decimal>(row, "open")?,
        high: parse_column::<Decimal>(row, "high")?,
        low: parse_column::<Decimal>(row, "low")?,
        close: parse_column::<Decimal>(row, "close")?,
        volume: row.get("volume"),
        oi: row.get("oi"),
    })
}

fn parse_column<T>(row: &SqliteRow, column: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row.get(column);
    raw.parse::<T>().map_err(|e| {
        Error::CacheRead(sqlx::Error::Decode(
            format!("column {column}: {e}").into(),
        ))
    })
}

/// Collapse overlapping ranges. Input must be sorted by `from`.
fn merge_ranges(ranges: Vec<DateRange>) -> Vec<DateRange> {
    let mut merged: Vec<DateRange> = Vec::with_capacity(ranges.len());

    for range in ranges {
        match merged.last_mut() {
            Some(last) if range.from <= last.to + Duration::seconds(1) => {
                if range.to > last.to {
                    last.to = range.to;
                }
            }
            _ => merged.push(range),
        }
    }

    merged
}

/// Sub-ranges of `requested` not covered by `covered` (sorted, merged).
fn missing_ranges(requested: DateRange, covered: &[DateRange]) -> Vec<DateRange> {
    let mut gaps = Vec::new();
    let mut cursor = requested.from;

    for range in covered {
        if range.to < cursor {
            continue;
        }
        if range.from > requested.to {
            break;
        }
        if range.from > cursor {
            gaps.push(DateRange {
                from: cursor,
                to: range.from - Duration::seconds(1),
            });
        }
        cursor = range.to + Duration::seconds(1);
        if cursor > requested.to {
            return gaps;
        }
    }

    if cursor <= requested.to {
        gaps.push(DateRange {
            from: cursor,
            to: requested.to,
        });
    }

    gaps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Margins, Order, OrderRequest, Position, Profile, Quote};
    use async_trait::async_trait;
    use chrono::{NaiveDate, NaiveDateTime};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn ts(date: &str) -> NaiveDateTime {
        NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn range(from: &str, to: &str) -> DateRange {
        DateRange {
            from: ts(from),
            to: ts(to),
        }
    }

    /// Broker stub that fabricates one daily candle per midnight in the
    /// requested range, counting every network call.
    struct FakeFeed {
        calls: AtomicUsize,
        fail: AtomicBool,
        empty: AtomicBool,
    }

    impl FakeFeed {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
                empty: AtomicBool::new(false),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Broker for FakeFeed {
        fn name(&self) -> &str {
            "fake"
        }

        async fn get_quote(&self, _symbol: &str, _exchange: &str) -> Result<Quote> {
            Err(Error::broker_call("not a quote source"))
        }

        async fn get_positions(&self) -> Result<Vec<Position>> {
            Ok(Vec::new())
        }

        async fn place_order(&self, _order: &OrderRequest) -> Result<String> {
            Err(Error::broker_call("not an order source"))
        }

        async fn get_order(&self, _order_id: &str) -> Result<Order> {
            Err(Error::broker_call("not an order source"))
        }

        async fn get_historical_data(
            &self,
            symbol: &str,
            exchange: &str,
            from_date: NaiveDateTime,
            to_date: NaiveDateTime,
            interval: Interval,
        ) -> Result<Vec<Candle>> {
            self.calls.fetch_add(1, Ordering::SeqCst);

            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::broker_call("simulated outage"));
            }
            if self.empty.load(Ordering::SeqCst) {
                return Ok(Vec::new());
            }

            let mut day = from_date.date();
            if from_date.time() > chrono::NaiveTime::MIN {
                day = day.succ_opt().unwrap();
            }

            let mut candles = Vec::new();
            while day <= to_date.date() {
                let timestamp = day.and_hms_opt(0, 0, 0).unwrap();
                if timestamp <= to_date {
                    candles.push(Candle {
                        symbol: symbol.to_string(),
                        exchange: exchange.to_string(),
                        interval,
                        timestamp,
                        open: Decimal::new(1000, 1),
                        high: Decimal::new(1050, 1),
                        low: Decimal::new(990, 1),
                        close: Decimal::new(1020, 1),
                        volume: 1000,
                        oi: 0,
                    });
                }
                day = day.succ_opt().unwrap();
            }

            Ok(candles)
        }

        async fn get_margins(&self) -> Result<Margins> {
            Err(Error::broker_call("not an account source"))
        }

        async fn get_profile(&self) -> Result<Profile> {
            Err(Error::broker_call("not an account source"))
        }
    }

    async fn memory_store() -> HistoryStore {
        HistoryStore::connect("sqlite::memory:").await.unwrap()
    }

    #[test]
    fn test_missing_ranges_uncovered() {
        let requested = range("2024-01-01", "2024-01-10");
        assert_eq!(missing_ranges(requested, &[]), vec![requested]);
    }

    #[test]
    fn test_missing_ranges_fully_covered() {
        let requested = range("2024-01-03", "2024-01-05");
        let covered = [range("2024-01-01", "2024-01-10")];
        assert!(missing_ranges(requested, &covered).is_empty());
    }

    #[test]
    fn test_missing_ranges_tail_gap() {
        let requested = range("2024-01-03", "2024-01-08");
        let covered = [range("2024-01-01", "2024-01-05")];
        let gaps = missing_ranges(requested, &covered);

        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].from, ts("2024-01-05") + Duration::seconds(1));
        assert_eq!(gaps[0].to, ts("2024-01-08"));
    }

    #[test]
    fn test_missing_ranges_hole_in_middle() {
        let requested = range("2024-01-01", "2024-01-10");
        let covered = [range("2024-01-01", "2024-01-03"), range("2024-01-07", "2024-01-10")];
        let gaps = missing_ranges(requested, &covered);

        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].from, ts("2024-01-03") + Duration::seconds(1));
        assert_eq!(gaps[0].to, ts("2024-01-07") - Duration::seconds(1));
    }

    #[test]
    fn test_merge_overlapping_ranges() {
        let merged = merge_ranges(vec![
            range("2024-01-01", "2024-01-05"),
            range("2024-01-03", "2024-01-08"),
            range("2024-01-20", "2024-01-25"),
        ]);

        assert_eq!(
            merged,
            vec![range("2024-01-01", "2024-01-08"), range("2024-01-20", "2024-01-25")]
        );
    }

    #[tokio::test]
    async fn test_storing_same_candle_twice_is_idempotent() {
        let store = memory_store().await;
        let candle = Candle {
            symbol: "BANKNIFTY".to_string(),
            exchange: "NSE".to_string(),
            interval: Interval::Day,
            timestamp: ts("2024-01-01"),
            open: Decimal::new(1000, 1),
            high: Decimal::new(1050, 1),
            low: Decimal::new(990, 1),
            close: Decimal::new(1020, 1),
            volume: 1000,
            oi: 0,
        };

        assert_eq!(store.store_candles(&[candle.clone()]).await.unwrap(), 1);
        assert_eq!(store.store_candles(&[candle.clone()]).await.unwrap(), 0);

        let loaded = store
            .load_candles("BANKNIFTY", "NSE", Interval::Day, ts("2024-01-01"), ts("2024-01-02"))
            .await
            .unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0], candle);
    }

    #[tokio::test]
    async fn test_fetch_then_refetch_uses_cache() {
        let store = memory_store().await;
        let feed = FakeFeed::new();

        let candles = store
            .fetch_and_store(
                &feed,
                "BANKNIFTY",
                "NSE",
                Interval::Day,
                ts("2024-01-01"),
                ts("2024-01-10"),
                false,
            )
            .await
            .unwrap();

        assert_eq!(candles.len(), 10);
        assert_eq!(feed.calls(), 1);
        assert_eq!(store.stats().await.unwrap().fetch_records, 1);

        // Same range again: served from the store, zero broker calls
        let again = store
            .fetch_and_store(
                &feed,
                "BANKNIFTY",
                "NSE",
                Interval::Day,
                ts("2024-01-01"),
                ts("2024-01-10"),
                false,
            )
            .await
            .unwrap();

        assert_eq!(again, candles);
        assert_eq!(feed.calls(), 1);
    }

    #[tokio::test]
    async fn test_subrange_of_fetched_range_is_free() {
        let store = memory_store().await;
        let feed = FakeFeed::new();

        store
            .fetch_and_store(
                &feed,
                "BANKNIFTY",
                "NSE",
                Interval::Day,
                ts("2024-01-01"),
                ts("2024-01-10"),
                false,
            )
            .await
            .unwrap();
        assert_eq!(feed.calls(), 1);

        let subset = store
            .fetch_and_store(
                &feed,
                "BANKNIFTY",
                "NSE",
                Interval::Day,
                ts("2024-01-03"),
                ts("2024-01-07"),
                false,
            )
            .await
            .unwrap();

        assert_eq!(subset.len(), 5);
        assert_eq!(feed.calls(), 1);
    }

    #[tokio::test]
    async fn test_overlapping_request_fetches_only_the_gap() {
        let store = memory_store().await;
        let feed = FakeFeed::new();

        store
            .fetch_and_store(
                &feed,
                "BANKNIFTY",
                "NSE",
                Interval::Day,
                ts("2024-01-01"),
                ts("2024-01-05"),
                false,
            )
            .await
            .unwrap();

        let widened = store
            .fetch_and_store(
                &feed,
                "BANKNIFTY",
                "NSE",
                Interval::Day,
                ts("2024-01-03"),
                ts("2024-01-08"),
                false,
            )
            .await
            .unwrap();

        // One original call plus one for the Jan 6-8 gap
        assert_eq!(feed.calls(), 2);
        assert_eq!(widened.len(), 6); // Jan 3 through Jan 8

        // Whole widened span is now covered
        store
            .fetch_and_store(
                &feed,
                "BANKNIFTY",
                "NSE",
                Interval::Day,
                ts("2024-01-01"),
                ts("2024-01-08"),
                false,
            )
            .await
            .unwrap();
        assert_eq!(feed.calls(), 2);
    }

    #[tokio::test]
    async fn test_force_refresh_refetches_without_duplicating() {
        let store = memory_store().await;
        let feed = FakeFeed::new();

        store
            .fetch_and_store(
                &feed,
                "BANKNIFTY",
                "NSE",
                Interval::Day,
                ts("2024-01-01"),
                ts("2024-01-05"),
                false,
            )
            .await
            .unwrap();

        let refreshed = store
            .fetch_and_store(
                &feed,
                "BANKNIFTY",
                "NSE",
                Interval::Day,
                ts("2024-01-01"),
                ts("2024-01-05"),
                true,
            )
            .await
            .unwrap();

        assert_eq!(feed.calls(), 2);
        assert_eq!(refreshed.len(), 5);
        assert_eq!(store.stats().await.unwrap().total_candles, 5);
    }

    #[tokio::test]
    async fn test_broker_failure_does_not_poison_cache() {
        let store = memory_store().await;
        let feed = FakeFeed::new();
        feed.fail.store(true, Ordering::SeqCst);

        let result = store
            .fetch_and_store(
                &feed,
                "BANKNIFTY",
                "NSE",
                Interval::Day,
                ts("2024-01-01"),
                ts("2024-01-05"),
                false,
            )
            .await;
        assert!(result.is_err());
        assert_eq!(store.stats().await.unwrap().fetch_records, 0);

        // Once the outage clears the range is fetched for real
        feed.fail.store(false, Ordering::SeqCst);
        let candles = store
            .fetch_and_store(
                &feed,
                "BANKNIFTY",
                "NSE",
                Interval::Day,
                ts("2024-01-01"),
                ts("2024-01-05"),
                false,
            )
            .await
            .unwrap();
        assert_eq!(candles.len(), 5);
        assert_eq!(feed.calls(), 2);
    }

    #[tokio::test]
    async fn test_empty_fetch_still_marks_range() {
        let store = memory_store().await;
        let feed = FakeFeed::new();
        feed.empty.store(true, Ordering::SeqCst);

        let candles = store
            .fetch_and_store(
                &feed,
                "BANKNIFTY",
                "NSE",
                Interval::Day,
                ts("2024-01-06"),
                ts("2024-01-07"),
                false,
            )
            .await
            .unwrap();
        assert!(candles.is_empty());
        assert_eq!(feed.calls(), 1);

        // A market-holiday range that returned nothing is not re-fetched
        store
            .fetch_and_store(
                &feed,
                "BANKNIFTY",
                "NSE",
                Interval::Day,
                ts("2024-01-06"),
                ts("2024-01-07"),
                false,
            )
            .await
            .unwrap();
        assert_eq!(feed.calls(), 1);
    }

    #[tokio::test]
    async fn test_clear_cache_filters() {
        let store = memory_store().await;
        let feed = FakeFeed::new();

        for symbol in ["BANKNIFTY", "NIFTY"] {
            store
                .fetch_and_store(
                    &feed,
                    symbol,
                    "NSE",
                    Interval::Day,
                    ts("2024-01-01"),
                    ts("2024-01-05"),
                    false,
                )
                .await
                .unwrap();
        }
        assert_eq!(store.stats().await.unwrap().total_candles, 10);

        store.clear_cache(Some("BANKNIFTY"), None).await.unwrap();
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_candles, 5);
        assert_eq!(stats.unique_symbols, 1);
        assert_eq!(stats.fetch_records, 1);

        store.clear_cache(None, None).await.unwrap();
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_candles, 0);
        assert_eq!(stats.fetch_records, 0);
    }

    #[tokio::test]
    async fn test_latest_candle() {
        let store = memory_store().await;
        let feed = FakeFeed::new();

        assert!(store
            .latest_candle("BANKNIFTY", "NSE", Interval::Day)
            .await
            .unwrap()
            .is_none());

        store
            .fetch_and_store(
                &feed,
                "BANKNIFTY",
                "NSE",
                Interval::Day,
                ts("2024-01-01"),
                ts("2024-01-05"),
                false,
            )
            .await
            .unwrap();

        let latest = store
            .latest_candle("BANKNIFTY", "NSE", Interval::Day)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.timestamp, ts("2024-01-05"));
    }
}
