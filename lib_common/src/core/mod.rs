//! # Core Engine Module
//!
//! The source-agnostic pipeline of the consensus monitor. Nothing in here knows
//! how data is fetched or how clients are connected; it turns raw upstream pairs
//! into canonical snapshots, snapshots into patches, and patches into frames
//! queued to every client.
//!
//! ## Core Components:
//!
//! - **`snapshot`**: Raw upstream types and the immutable `RoundSnapshot`.
//!
//! - **`aggregator`**: Reconciles a validator set and a round state into one
//!   index-aligned snapshot, or rejects the pair.
//!
//! - **`diff`**: Minimal field-level `Patch` between two snapshots.
//!
//! - **`dispatcher`**: The broadcast hub. Serializes each patch once and queues
//!   it to all registered clients, dropping the ones that cannot keep up.
//!
//! - **`source`**: The `RoundSource` trait the poll loop fetches through.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Reconciliation of raw upstream data into snapshots.
pub mod aggregator;
/// Field-level differences between snapshots.
pub mod diff;
/// The broadcast hub fanning patches out to clients.
pub mod dispatcher;
/// Raw and canonical state types.
pub mod snapshot;
/// The upstream fetch seam.
pub mod source;

// --- Public API Re-exports ---
pub use aggregator::{aggregate, percentage, AggregationError, VoteKind};
pub use diff::{diff, DataSources, Patch};
pub use dispatcher::{BroadcastReport, ClientId, Dispatcher, DispatcherConfig, Frame};
pub use snapshot::{
    ParticipationMetric, RawRound, RawValidator, RoundSnapshot, RoundStateData, ValidatorInfo,
    ValidatorSetData,
};
pub use source::{FetchError, RoundSource, UpstreamSource};
