//! # Data Ingestors Module
//!
//! Long-running tasks that pull data from an upstream and push it into the
//! core pipeline.
//!
//! ## Contained Modules:
//! - **`consensus_polling`**: The fixed-interval poll loop driving the
//!   consensus monitor: fetch, aggregate, diff, broadcast.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// The fixed-interval consensus poll loop.
pub mod consensus_polling;

// --- Public API Re-exports ---
pub use consensus_polling::{
    ConsensusPoller, CycleOutcome, PollPhase, PollStats, PollStatsSnapshot, PollerConfig,
};
