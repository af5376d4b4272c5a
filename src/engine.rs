use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::notify::{emit, Event, EventKind, Notifier};
use crate::strategy::{SessionOutcome, Strategy, StrategyState};
use crate::Result;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Sleep between cycles; cadence is best effort, not hard real-time.
    pub cycle_interval: Duration,
    /// Broker failures tolerated back to back before the loop aborts.
    pub max_consecutive_failures: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cycle_interval: Duration::from_secs(30),
            max_consecutive_failures: 10,
        }
    }
}

/// Single-threaded cooperative polling driver.
///
/// Owns the session's state value and adopts the strategy's returned
/// state only on `Ok`; a failed cycle is logged, notified, and skipped.
/// An external stop flag is checked once per iteration, never
/// mid-broker-call.
pub struct Engine {
    strategy: Box<dyn Strategy>,
    notifier: Arc<dyn Notifier>,
    config: EngineConfig,
    stop: Arc<AtomicBool>,
    state: StrategyState,
    consecutive_failures: u32,
}

impl Engine {
    pub fn new(
        strategy: Box<dyn Strategy>,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
    ) -> Self {
        Self {
            strategy,
            notifier,
            config,
            stop: Arc::new(AtomicBool::new(false)),
            state: StrategyState::Waiting,
            consecutive_failures: 0,
        }
    }

    /// Flag checked at the top of every iteration.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn state(&self) -> &StrategyState {
        &self.state
    }

    /// Run one cycle. Returns `Ok(true)` once the session is done.
    ///
    /// After `max_consecutive_failures` failed cycles in a row the error
    /// escalates: a FATAL notification goes out and the error returns to
    /// the caller instead of looping un-monitored.
    pub async fn step(&mut self) -> Result<bool> {
        match self.strategy.run_cycle(&self.state).await {
            Ok(next) => {
                self.consecutive_failures = 0;
                if next != self.state {
                    tracing::info!(from = ?self.state, to = ?next, "state transition");
                }
                self.state = next;
                Ok(self.state.is_done())
            }
            Err(e) => {
                self.consecutive_failures += 1;
                tracing::warn!(
                    error = %e,
                    failures = self.consecutive_failures,
                    "cycle failed, state unchanged"
                );
                emit(
                    self.notifier.as_ref(),
                    Event::new(EventKind::Error)
                        .with("error", &e)
                        .with("consecutive_failures", self.consecutive_failures),
                )
                .await;

                if self.consecutive_failures >= self.config.max_consecutive_failures {
                    emit(
                        self.notifier.as_ref(),
                        Event::new(EventKind::Fatal)
                            .with("error", &e)
                            .with("message", "monitoring lost, aborting loop"),
                    )
                    .await;
                    return Err(e);
                }

                Ok(false)
            }
        }
    }

    pub async fn run(&mut self) -> Result<SessionOutcome> {
        tracing::info!(
            strategy = %self.strategy.name(),
            interval = ?self.config.cycle_interval,
            "monitor loop starting"
        );

        loop {
            if self.stop.load(Ordering::Relaxed) {
                tracing::info!("stop requested, leaving loop");
                emit(
                    self.notifier.as_ref(),
                    Event::new(EventKind::Info).with("message", "strategy stopped"),
                )
                .await;
                return Ok(SessionOutcome::Stopped);
            }

            if self.step().await? {
                if let StrategyState::Done { outcome } = &self.state {
                    tracing::info!(?outcome, "session finished");
                    return Ok(outcome.clone());
                }
            }

            tokio::time::sleep(self.config.cycle_interval).await;
        }
    }
}
