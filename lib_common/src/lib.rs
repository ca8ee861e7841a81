//! # lib_common
//!
//! Shared building blocks of the consensus monitor, gated by cargo features so
//! that each binary only compiles what it uses:
//!
//! - `retrieve`: the generic HTTP `ApiClient`.
//! - `core`: snapshot model, aggregator, diff engine, broadcast hub and the
//!   `RoundSource` seam.
//! - `cosmos`: `CosmosClient`, the Cosmos SDK / CometBFT implementation of
//!   `RoundSource`.
//! - `ingestors`: the consensus poll loop.
//! - `loggers`: `tracing` subscriber setup.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

#[cfg(feature = "core")]
pub mod core;
#[cfg(feature = "cosmos")]
pub mod cosmos;
#[cfg(feature = "ingestors")]
pub mod ingestors;
#[cfg(feature = "loggers")]
pub mod loggers;
#[cfg(feature = "retrieve")]
pub mod retrieve;
