//! # Round Aggregator
//!
//! Merges the two halves of a `RawRound` into one canonical `RoundSnapshot`.
//!
//! ## Reconciliation rules
//!
//! 1.  **Stable roster order**: validators are sorted by voting power
//!     (descending), then by moniker, then by address. The position in that
//!     order is the validator's index for both vote lists. Upstream ordering is
//!     never trusted.
//! 2.  **Identity alignment**: vote entries only carry a 12-character address
//!     prefix, so votes are matched against roster members by that prefix,
//!     never by their position in the raw response.
//! 3.  **Fail closed**: a vote from an identity that is not in the roster means
//!     the two responses describe different validator sets. The whole cycle is
//!     rejected with an `AggregationError` and the caller keeps its previous
//!     snapshot.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;

use crate::core::snapshot::{
    ParticipationMetric, RawRound, RawValidator, RoundSnapshot, ValidatorInfo,
};

/// Number of address characters a CometBFT vote string carries.
pub const VOTE_ADDRESS_PREFIX_LEN: usize = 12;

/// Largest accepted distance between the roster height and the round height.
///
/// The two sources are queried concurrently, so one or two blocks may be
/// committed between the responses.
pub const MAX_HEIGHT_SKEW: u64 = 2;

/// Which vote list an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteKind {
    /// First voting phase.
    Prevote,
    /// Second voting phase.
    Precommit,
}

impl std::fmt::Display for VoteKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VoteKind::Prevote => f.write_str("prevote"),
            VoteKind::Precommit => f.write_str("precommit"),
        }
    }
}

/// The raw pair cannot be reconciled into one snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AggregationError {
    /// The validator source returned no active validators.
    #[error("validator set is empty")]
    EmptyRoster,

    /// The same consensus address appears twice in the validator set.
    #[error("validator {address} appears more than once in the validator set")]
    DuplicateValidator {
        /// Offending address.
        address: String,
    },

    /// Two roster members share the address prefix votes are reported by,
    /// so their votes cannot be told apart.
    #[error("validators {first} and {second} share the vote prefix {prefix}")]
    AmbiguousVotePrefix {
        /// The shared prefix.
        prefix: String,
        /// Earlier roster member.
        first: String,
        /// Later roster member.
        second: String,
    },

    /// A vote was cast by an identity that is not part of the roster.
    #[error("{kind} from {address} does not match any validator in the roster")]
    UnknownVoter {
        /// Vote list the identity was found in.
        kind: VoteKind,
        /// Address prefix as reported by the round source.
        address: String,
    },

    /// The two sources describe heights too far apart to belong together.
    #[error("validator set height {roster_height} and round height {round_height} are too far apart")]
    HeightMismatch {
        /// Height of the validator set.
        roster_height: u64,
        /// Height of the consensus round.
        round_height: u64,
    },
}

/// Reconciles a raw upstream pair into a snapshot.
///
/// `previous_roster` is the roster of the last snapshot, if any. When the new
/// roster is identical, its allocation is reused so that later comparisons
/// short-circuit on pointer equality.
pub fn aggregate(
    raw: &RawRound,
    previous_roster: Option<&Arc<[ValidatorInfo]>>,
    metric: ParticipationMetric,
) -> Result<RoundSnapshot, AggregationError> {
    let roster_height = raw.validators.height;
    let round_height = raw.round.height;
    if roster_height.abs_diff(round_height) > MAX_HEIGHT_SKEW {
        return Err(AggregationError::HeightMismatch {
            roster_height,
            round_height,
        });
    }

    let roster = build_roster(&raw.validators.validators)?;
    let roster: Arc<[ValidatorInfo]> = match previous_roster {
        Some(prev) if prev[..] == roster[..] => Arc::clone(prev),
        _ => roster.into(),
    };

    let by_prefix = prefix_index(&roster)?;
    let prevotes = align_votes(&raw.round.prevotes, &by_prefix, roster.len(), VoteKind::Prevote)?;
    let precommits =
        align_votes(&raw.round.precommits, &by_prefix, roster.len(), VoteKind::Precommit)?;

    let prevote_power = participating_power(&roster, &prevotes);
    let precommit_power = participating_power(&roster, &precommits);

    Ok(RoundSnapshot {
        height: round_height,
        round: raw.round.round,
        version: raw.round.version.clone(),
        prevote_percentage: participation(&roster, &prevotes, prevote_power, metric),
        precommit_percentage: participation(&roster, &precommits, precommit_power, metric),
        prevote_power,
        precommit_power,
        prevotes,
        precommits,
        roster,
        metric,
    })
}

/// Sorts the raw validators into canonical order and assigns indices.
fn build_roster(validators: &[RawValidator]) -> Result<Vec<ValidatorInfo>, AggregationError> {
    if validators.is_empty() {
        return Err(AggregationError::EmptyRoster);
    }

    let mut seen = HashSet::with_capacity(validators.len());
    for v in validators {
        if !seen.insert(v.address.to_ascii_uppercase()) {
            return Err(AggregationError::DuplicateValidator {
                address: v.address.clone(),
            });
        }
    }

    let mut sorted: Vec<&RawValidator> = validators.iter().collect();
    sorted.sort_by(|a, b| {
        b.voting_power
            .cmp(&a.voting_power)
            .then_with(|| a.moniker.cmp(&b.moniker))
            .then_with(|| a.address.cmp(&b.address))
    });

    Ok(sorted
        .into_iter()
        .enumerate()
        .map(|(index, v)| ValidatorInfo {
            index,
            address: v.address.clone(),
            moniker: v.moniker.clone(),
            voting_power: v.voting_power,
        })
        .collect())
}

fn vote_key(address: &str) -> String {
    address
        .chars()
        .take(VOTE_ADDRESS_PREFIX_LEN)
        .collect::<String>()
        .to_ascii_uppercase()
}

/// Maps each roster member's vote prefix to its index.
fn prefix_index(roster: &[ValidatorInfo]) -> Result<HashMap<String, usize>, AggregationError> {
    let mut by_prefix: HashMap<String, usize> = HashMap::with_capacity(roster.len());
    for v in roster {
        let prefix = vote_key(&v.address);
        if let Some(&other) = by_prefix.get(&prefix) {
            return Err(AggregationError::AmbiguousVotePrefix {
                prefix,
                first: roster[other].address.clone(),
                second: v.address.clone(),
            });
        }
        by_prefix.insert(prefix, v.index);
    }
    Ok(by_prefix)
}

fn align_votes(
    voters: &[String],
    by_prefix: &HashMap<String, usize>,
    roster_len: usize,
    kind: VoteKind,
) -> Result<Vec<bool>, AggregationError> {
    let mut flags = vec![false; roster_len];
    for voter in voters {
        match by_prefix.get(&vote_key(voter)) {
            Some(&index) => flags[index] = true,
            None => {
                return Err(AggregationError::UnknownVoter {
                    kind,
                    address: voter.clone(),
                })
            }
        }
    }
    Ok(flags)
}

fn participating_power(roster: &[ValidatorInfo], flags: &[bool]) -> u64 {
    roster
        .iter()
        .zip(flags)
        .filter(|(_, voted)| **voted)
        .map(|(v, _)| v.voting_power)
        .sum()
}

fn participation(
    roster: &[ValidatorInfo],
    flags: &[bool],
    participating_power: u64,
    metric: ParticipationMetric,
) -> u8 {
    match metric {
        ParticipationMetric::VotingPower => {
            let total: u64 = roster.iter().map(|v| v.voting_power).sum();
            percentage(participating_power, total)
        }
        ParticipationMetric::Count => {
            let voted = flags.iter().filter(|&&voted| voted).count() as u64;
            percentage(voted, roster.len() as u64)
        }
    }
}

/// `round(100 * part / total)`, half away from zero, clamped to 0..=100.
///
/// Integer arithmetic on u128 keeps voting power sums exact.
pub fn percentage(part: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let part = u128::from(part.min(total));
    let total = u128::from(total);
    let rounded = (200 * part + total) / (2 * total);
    rounded.min(100) as u8
}
