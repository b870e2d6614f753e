use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use flowscope_core::config::Config;
use flowscope_core::error::FlowscopeError;
use flowscope_core::query::{CollectorPhase, CollectorStatus};
use flowscope_core::time::{Clock, to_chrono};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::analyze::Analyzer;
use crate::backend::{TraceBackend, TraceQuery};

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub poll_interval: Duration,
    /// How far each window reaches back before the last successful poll.
    pub overlap_window: Duration,
    /// Window length of the very first poll.
    pub initial_lookback: Duration,
    pub query_timeout: Duration,
    pub shutdown_grace: Duration,
    pub service: Option<String>,
    pub limit: usize,
}

impl CollectorConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            poll_interval: cfg.poll_interval,
            overlap_window: cfg.overlap_window,
            initial_lookback: cfg.initial_lookback,
            query_timeout: cfg.backend_timeout,
            shutdown_grace: cfg.shutdown_grace,
            service: cfg.backend_service.clone(),
            limit: cfg.backend_limit,
        }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// A collection was already running.
    Skipped,
    Collected {
        traces: usize,
        inserted: usize,
        duplicates: usize,
        rejected: usize,
    },
    Failed,
}

struct State {
    phase: CollectorPhase,
    last_success: Option<DateTime<Utc>>,
    status: CollectorStatus,
}

/// Returns the collector to Idle when a collection ends, including when
/// its future is dropped mid-flight.
pub struct CollectingGuard {
    state: Arc<Mutex<State>>,
}

impl Drop for CollectingGuard {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.phase = CollectorPhase::Idle;
        }
    }
}

/// Polls a trace backend on a fixed interval and feeds new traces through
/// the analyzer. At most one collection runs at a time.
#[derive(Clone)]
pub struct Collector {
    backend: Arc<dyn TraceBackend>,
    analyzer: Analyzer,
    clock: Arc<dyn Clock>,
    cfg: CollectorConfig,
    state: Arc<Mutex<State>>,
}

impl Collector {
    pub fn new(
        backend: Arc<dyn TraceBackend>,
        analyzer: Analyzer,
        clock: Arc<dyn Clock>,
        cfg: CollectorConfig,
    ) -> Self {
        let status = CollectorStatus {
            backend: backend.endpoint().to_string(),
            ..CollectorStatus::default()
        };
        Self {
            backend,
            analyzer,
            clock,
            cfg,
            state: Arc::new(Mutex::new(State {
                phase: CollectorPhase::Idle,
                last_success: None,
                status,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("collector state poisoned")
    }

    pub fn status(&self) -> CollectorStatus {
        let state = self.state();
        CollectorStatus {
            phase: state.phase,
            last_success: state.last_success,
            ..state.status.clone()
        }
    }

    /// Moves Idle to Collecting. `None` means a collection is in progress and
    /// this tick is skipped.
    pub fn try_begin(&self) -> Option<CollectingGuard> {
        let mut state = self.state();
        if state.phase == CollectorPhase::Collecting {
            state.status.skipped_ticks += 1;
            return None;
        }
        state.phase = CollectorPhase::Collecting;
        state.status.ticks += 1;
        Some(CollectingGuard {
            state: Arc::clone(&self.state),
        })
    }

    pub async fn tick(&self) -> TickOutcome {
        match self.try_begin() {
            Some(guard) => self.collect(guard).await,
            None => {
                debug!("previous collection still running, tick skipped");
                TickOutcome::Skipped
            }
        }
    }

    async fn collect(&self, _guard: CollectingGuard) -> TickOutcome {
        let now = self.clock.now();
        let query = TraceQuery {
            start: self.window_start(now),
            end: now,
            service: self.cfg.service.clone(),
            limit: self.cfg.limit,
        };

        let result = tokio::time::timeout(self.cfg.query_timeout, self.backend.query_traces(&query))
            .await
            .unwrap_or(Err(FlowscopeError::Timeout(self.cfg.query_timeout)));
        let traces = match result {
            Ok(traces) => traces,
            Err(err) => {
                warn!(
                    endpoint = %self.backend.endpoint(),
                    tick = %now.to_rfc3339(),
                    error = %err,
                    "trace backend poll failed; retrying next tick"
                );
                let mut state = self.state();
                state.status.failures += 1;
                state.status.consecutive_failures += 1;
                state.status.last_error = Some(err.to_string());
                state.status.last_error_at = Some(now);
                return TickOutcome::Failed;
            }
        };

        let (mut inserted, mut duplicates, mut rejected) = (0, 0, 0);
        for raw in &traces {
            match self.analyzer.analyze(raw) {
                Ok(outcome) if outcome.inserted => inserted += 1,
                Ok(_) => duplicates += 1,
                Err(err) => {
                    rejected += 1;
                    warn!(
                        trace_id = raw.trace_id.as_deref().unwrap_or("-"),
                        error = %err,
                        "trace skipped"
                    );
                }
            }
        }

        {
            let mut state = self.state();
            state.last_success = Some(now);
            state.status.consecutive_failures = 0;
            state.status.flows_ingested += inserted as u64;
        }
        info!(
            tick = %now.to_rfc3339(),
            window_start = %query.start.to_rfc3339(),
            traces = traces.len(),
            inserted,
            duplicates,
            "collection finished"
        );
        TickOutcome::Collected {
            traces: traces.len(),
            inserted,
            duplicates,
            rejected,
        }
    }

    fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let last_success = self.state().last_success;
        let (anchor, reach) = match last_success {
            Some(last) => (last, self.cfg.overlap_window),
            None => (now, self.cfg.initial_lookback),
        };
        match to_chrono(reach) {
            Ok(reach) => anchor - reach,
            Err(_) => DateTime::<Utc>::MIN_UTC,
        }
    }

    /// Runs until `shutdown` flips to true. An in-flight collection gets
    /// `shutdown_grace` to finish before it is cancelled.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.cfg.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut in_flight: Option<JoinHandle<TickOutcome>> = None;
        info!(
            endpoint = %self.backend.endpoint(),
            interval = ?self.cfg.poll_interval,
            "trace collector started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.try_begin() {
                        Some(guard) => {
                            let collector = self.clone();
                            in_flight = Some(tokio::spawn(async move { collector.collect(guard).await }));
                        }
                        None => debug!("previous collection still running, tick skipped"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let Some(mut handle) = in_flight.take()
            && !handle.is_finished()
        {
            if tokio::time::timeout(self.cfg.shutdown_grace, &mut handle)
                .await
                .is_err()
            {
                handle.abort();
                warn!(grace = ?self.cfg.shutdown_grace, "in-flight collection cancelled at shutdown");
            }
        }
        info!("trace collector stopped");
    }
}
