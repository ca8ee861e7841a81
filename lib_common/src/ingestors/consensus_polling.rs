//! # Consensus Polling Ingestor
//!
//! The top-level driver of the monitor. On a fixed interval it fetches one raw
//! round through a `RoundSource`, reconciles it into a `RoundSnapshot`, diffs it
//! against the last broadcast snapshot and hands the resulting patch to the
//! `Dispatcher`.
//!
//! ## Key Design Principles:
//! - **Exclusive state**: the previous snapshot and the sequence counter are
//!   plain fields of `ConsensusPoller`. Nothing else can read or mutate them;
//!   the diff engine receives them by reference.
//! - **Explicit phases**: every cycle walks
//!   `Idle -> Fetching -> Aggregating -> Diffing -> Broadcasting -> Idle`.
//!   A fetch or aggregation failure returns straight to `Idle` with the
//!   previous snapshot untouched and nothing broadcast.
//! - **No overlap**: cycles run one at a time on a `tokio::time::interval`
//!   with `MissedTickBehavior::Skip`, so an overrunning cycle makes the loop
//!   skip ticks instead of queueing them.
//! - **Never gives up**: failures are counted in `PollStats` and the next tick
//!   is the retry. Upstream recovery is outside this process' control.
//! - **Partial failures skip the cycle**: a round whose validator half or
//!   round half is missing is not mixed with stale data.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};

use crate::core::aggregator::{aggregate, AggregationError};
use crate::core::diff::diff;
use crate::core::dispatcher::Dispatcher;
use crate::core::snapshot::{ParticipationMetric, RoundSnapshot};
use crate::core::source::{FetchError, RoundSource};

/// Where the poll loop currently is within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollPhase {
    /// Waiting for the next tick.
    Idle,
    /// Querying the upstream sources.
    Fetching,
    /// Reconciling the raw pair.
    Aggregating,
    /// Comparing with the previous snapshot.
    Diffing,
    /// Queuing the patch to clients.
    Broadcasting,
}

impl PollPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PollPhase::Fetching,
            2 => PollPhase::Aggregating,
            3 => PollPhase::Diffing,
            4 => PollPhase::Broadcasting,
            _ => PollPhase::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            PollPhase::Idle => 0,
            PollPhase::Fetching => 1,
            PollPhase::Aggregating => 2,
            PollPhase::Diffing => 3,
            PollPhase::Broadcasting => 4,
        }
    }
}

impl fmt::Display for PollPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PollPhase::Idle => "idle",
            PollPhase::Fetching => "fetching",
            PollPhase::Aggregating => "aggregating",
            PollPhase::Diffing => "diffing",
            PollPhase::Broadcasting => "broadcasting",
        };
        f.write_str(name)
    }
}

/// What one cycle ended with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A non-empty patch was handed to the hub.
    Broadcast {
        /// Sequence number assigned to the patch.
        seq: u64,
        /// Clients it was queued to.
        delivered: usize,
        /// Clients dropped during the fan-out.
        dropped: usize,
    },
    /// The new snapshot is identical on the wire; nothing was sent.
    Unchanged,
    /// The upstream fetch failed; the cycle was skipped.
    FetchFailed(FetchError),
    /// The raw pair was inconsistent; the cycle was skipped.
    AggregationFailed(AggregationError),
}

/// Counters shared with the status endpoint.
#[derive(Debug, Default)]
pub struct PollStats {
    phase: AtomicU8,
    cycles: AtomicU64,
    broadcasts: AtomicU64,
    fetch_failures: AtomicU64,
    aggregation_failures: AtomicU64,
    consecutive_failures: AtomicU64,
    last_seq: AtomicU64,
    last_height: AtomicU64,
    online: AtomicBool,
}

/// Point-in-time copy of `PollStats`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollStatsSnapshot {
    /// Current phase.
    pub phase: PollPhase,
    /// Completed cycles, successful or not.
    pub cycles: u64,
    /// Cycles that broadcast a patch.
    pub broadcasts: u64,
    /// Cycles skipped because of a fetch failure.
    pub fetch_failures: u64,
    /// Cycles skipped because of an aggregation failure.
    pub aggregation_failures: u64,
    /// Failures since the last successful cycle.
    pub consecutive_failures: u64,
    /// Sequence number of the last broadcast.
    pub last_seq: u64,
    /// Height of the last accepted snapshot.
    pub last_height: u64,
    /// Whether the last fetch succeeded.
    pub online: bool,
}

impl PollStats {
    /// The current phase.
    pub fn phase(&self) -> PollPhase {
        PollPhase::from_u8(self.phase.load(Ordering::Relaxed))
    }

    fn set_phase(&self, phase: PollPhase) {
        self.phase.store(phase.as_u8(), Ordering::Relaxed);
        tracing::trace!(%phase, "poll phase");
    }

    /// Copies every counter.
    pub fn snapshot(&self) -> PollStatsSnapshot {
        PollStatsSnapshot {
            phase: self.phase(),
            cycles: self.cycles.load(Ordering::Relaxed),
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            aggregation_failures: self.aggregation_failures.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            last_seq: self.last_seq.load(Ordering::Relaxed),
            last_height: self.last_height.load(Ordering::Relaxed),
            online: self.online.load(Ordering::Relaxed),
        }
    }
}

/// Poll loop settings.
#[derive(Debug, Clone, Copy)]
pub struct PollerConfig {
    /// Fixed tick period.
    pub poll_interval: Duration,
    /// How participation percentages are computed.
    pub metric: ParticipationMetric,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            metric: ParticipationMetric::VotingPower,
        }
    }
}

/// The poll loop.
pub struct ConsensusPoller<S> {
    source: S,
    dispatcher: Arc<Dispatcher>,
    config: PollerConfig,
    stats: Arc<PollStats>,
    /// Last snapshot accepted; what the next diff is computed against.
    previous: Option<RoundSnapshot>,
    seq: u64,
    /// `None` until the first fetch completed either way.
    online: Option<bool>,
}

impl<S: RoundSource> ConsensusPoller<S> {
    /// Creates an idle poller.
    pub fn new(source: S, dispatcher: Arc<Dispatcher>, config: PollerConfig) -> Self {
        Self {
            source,
            dispatcher,
            config,
            stats: Arc::new(PollStats::default()),
            previous: None,
            seq: 0,
            online: None,
        }
    }

    /// Counters, shareable with other tasks.
    pub fn stats(&self) -> Arc<PollStats> {
        Arc::clone(&self.stats)
    }

    /// The current phase.
    pub fn phase(&self) -> PollPhase {
        self.stats.phase()
    }

    /// The last accepted snapshot.
    pub fn previous(&self) -> Option<&RoundSnapshot> {
        self.previous.as_ref()
    }

    fn set_online(&mut self, online: bool) {
        if self.online == Some(online) {
            return;
        }
        self.online = Some(online);
        self.stats.online.store(online, Ordering::Relaxed);
        if online {
            tracing::info!("Node is online");
        } else {
            tracing::warn!("Node is offline");
        }
    }

    fn record_failure(&self) -> u64 {
        self.stats.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Runs exactly one cycle.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        let outcome = self.cycle().await;
        self.stats.set_phase(PollPhase::Idle);
        self.stats.cycles.fetch_add(1, Ordering::Relaxed);
        outcome
    }

    async fn cycle(&mut self) -> CycleOutcome {
        self.stats.set_phase(PollPhase::Fetching);
        let raw = match self.source.fetch_round().await {
            Ok(raw) => raw,
            Err(e) => {
                self.set_online(false);
                self.stats.fetch_failures.fetch_add(1, Ordering::Relaxed);
                let consecutive = self.record_failure();
                tracing::warn!(error = %e, consecutive, "fetch failed, skipping cycle");
                return CycleOutcome::FetchFailed(e);
            }
        };
        self.set_online(true);

        self.stats.set_phase(PollPhase::Aggregating);
        let previous_roster = self.previous.as_ref().map(|s| &s.roster);
        let snapshot = match aggregate(&raw, previous_roster, self.config.metric) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.stats.aggregation_failures.fetch_add(1, Ordering::Relaxed);
                let consecutive = self.record_failure();
                tracing::warn!(error = %e, consecutive, "inconsistent round data, skipping cycle");
                return CycleOutcome::AggregationFailed(e);
            }
        };
        self.stats.consecutive_failures.store(0, Ordering::Relaxed);

        if let Some(previous) = &self.previous {
            if snapshot.height < previous.height {
                tracing::warn!(
                    previous = previous.height,
                    current = snapshot.height,
                    "height went backwards, node was probably reset"
                );
            }
        }
        self.stats.last_height.store(snapshot.height, Ordering::Relaxed);

        self.stats.set_phase(PollPhase::Diffing);
        let patch = diff(self.previous.as_ref(), &snapshot);
        if patch.is_empty() {
            self.previous = Some(snapshot);
            return CycleOutcome::Unchanged;
        }

        self.stats.set_phase(PollPhase::Broadcasting);
        self.seq += 1;
        let seq = self.seq;
        tracing::debug!(seq, keys = ?patch.keys(), height = snapshot.height, "broadcasting patch");
        let report = self.dispatcher.broadcast(seq, &patch, &snapshot).await;
        self.previous = Some(snapshot);
        self.stats.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.stats.last_seq.store(seq, Ordering::Relaxed);

        CycleOutcome::Broadcast {
            seq,
            delivered: report.delivered,
            dropped: report.dropped,
        }
    }

    /// Ticks until `shutdown` fires.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(
            interval_ms = self.config.poll_interval.as_millis() as u64,
            metric = %self.config.metric,
            "consensus poller started"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Consensus poller received shutdown signal.");
                    break;
                }
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
            }
        }
    }
}
