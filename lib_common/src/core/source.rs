//! # Round Source
//!
//! The seam between the poll loop and whatever produces raw consensus data.
//! Production code plugs in `cosmos::apicall::CosmosClient`; tests plug in
//! scripted doubles.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::snapshot::RawRound;

/// One of the two independent upstream data sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamSource {
    /// Validator identities and voting power.
    Validators,
    /// Current consensus round and votes.
    Round,
}

impl fmt::Display for UpstreamSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamSource::Validators => f.write_str("validator"),
            UpstreamSource::Round => f.write_str("round"),
        }
    }
}

/// A fetch cycle that did not yield a complete raw pair.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Exactly one of the two sources failed.
    #[error("{failed} source failed: {reason}")]
    Partial {
        /// Source that failed.
        failed: UpstreamSource,
        /// Transport, timeout or decoding failure description.
        reason: String,
    },

    /// Both sources failed.
    #[error("both sources failed (validator: {validators}; round: {round})")]
    Total {
        /// Failure of the validator source.
        validators: String,
        /// Failure of the round source.
        round: String,
    },
}

impl FetchError {
    /// Combines the outcome of the two halves of a fetch.
    pub fn from_halves<V, R>(
        validators: Result<V, String>,
        round: Result<R, String>,
    ) -> Result<(V, R), FetchError> {
        match (validators, round) {
            (Ok(v), Ok(r)) => Ok((v, r)),
            (Err(reason), Ok(_)) => Err(FetchError::Partial {
                failed: UpstreamSource::Validators,
                reason,
            }),
            (Ok(_), Err(reason)) => Err(FetchError::Partial {
                failed: UpstreamSource::Round,
                reason,
            }),
            (Err(validators), Err(round)) => Err(FetchError::Total { validators, round }),
        }
    }

    /// True when neither source answered.
    pub fn is_total(&self) -> bool {
        matches!(self, FetchError::Total { .. })
    }
}

/// Produces one raw validator/round pair per call.
///
/// Implementations must not retry internally and must bound the time spent in
/// each source.
#[async_trait]
pub trait RoundSource: Send + Sync {
    /// Queries both sources once.
    async fn fetch_round(&self) -> Result<RawRound, FetchError>;
}
