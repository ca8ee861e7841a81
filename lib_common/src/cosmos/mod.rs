//! # Cosmos Node Integration Module
//!
//! Everything that knows how a Cosmos SDK / CometBFT node exposes its
//! validator set and consensus state.
//!
//! ## Contained Modules:
//!
//! - **`apicall`**: `CosmosClient`, the production `RoundSource`. Queries the
//!   REST API and the RPC concurrently with per-source deadlines and keeps a
//!   cached pubkey → moniker map.
//!
//! - **`model`**: Serde shapes of the node responses and parsers for the
//!   `height/round/step` and vote strings of `/consensus_state`.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// HTTP client for a Cosmos node implementing `RoundSource`.
pub mod apicall;
/// Response models and string parsers.
pub mod model;

pub use apicall::CosmosClient;
pub use model::MalformedResponse;
