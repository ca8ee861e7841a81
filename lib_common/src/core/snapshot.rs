//! # Round Snapshot Model
//!
//! Data structures shared by every stage of the consensus monitor pipeline.
//!
//! Two families of types live here:
//!
//! - **Raw upstream data** (`RawValidator`, `ValidatorSetData`,
//!   `RoundStateData`, `RawRound`): exactly what the upstream client was able
//!   to parse out of the node, with no ordering or consistency guarantees.
//! - **Canonical state** (`ValidatorInfo`, `RoundSnapshot`): the reconciled,
//!   index-aligned view produced by the aggregator. A `RoundSnapshot` is built
//!   from scratch on every poll cycle and never mutated afterwards, so an
//!   older snapshot can be kept around for diffing without any locking.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// One member of the active validator set as reported upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawValidator {
    /// Hex consensus address (40 characters on CometBFT chains).
    pub address: String,
    /// Display name from the staking module, or the address when unknown.
    pub moniker: String,
    /// Voting power at `ValidatorSetData::height`.
    pub voting_power: u64,
}

/// Output of the validator / voting-power source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorSetData {
    /// Block height the validator set was read at.
    pub height: u64,
    /// Active validators in whatever order the node returned them.
    pub validators: Vec<RawValidator>,
}

/// Output of the consensus-round source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundStateData {
    /// Height currently being decided.
    pub height: u64,
    /// Round within that height.
    pub round: u32,
    /// Round step name (`RoundStepPrevote`, ...). Informational only.
    pub step: String,
    /// Version string of the node's application.
    pub version: String,
    /// Address prefixes of the validators that prevoted.
    pub prevotes: Vec<String>,
    /// Address prefixes of the validators that precommitted.
    pub precommits: Vec<String>,
}

/// A raw pair returned by one successful `fetch_round`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRound {
    /// Validator / voting-power half.
    pub validators: ValidatorSetData,
    /// Consensus-round half.
    pub round: RoundStateData,
}

/// Which quantity the participation percentages are computed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParticipationMetric {
    /// Share of the total voting power that voted.
    #[default]
    VotingPower,
    /// Share of the validators that voted, regardless of weight.
    Count,
}

impl fmt::Display for ParticipationMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParticipationMetric::VotingPower => f.write_str("voting-power"),
            ParticipationMetric::Count => f.write_str("count"),
        }
    }
}

impl std::str::FromStr for ParticipationMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "voting-power" | "voting_power" | "power" => Ok(ParticipationMetric::VotingPower),
            "count" => Ok(ParticipationMetric::Count),
            other => Err(format!("unknown participation metric '{}'", other)),
        }
    }
}

/// A validator placed in the canonical roster order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorInfo {
    /// 0-based position, shared by the prevote and precommit lists.
    pub index: usize,
    /// Full hex consensus address.
    pub address: String,
    /// Display name.
    pub moniker: String,
    /// Voting power.
    pub voting_power: u64,
}

/// The reconciled state of one poll cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundSnapshot {
    /// Height being decided.
    pub height: u64,
    /// Round within `height`.
    pub round: u32,
    /// Node application version.
    pub version: String,
    /// Canonical roster; shared between snapshots while it does not change.
    pub roster: Arc<[ValidatorInfo]>,
    /// One flag per roster index.
    pub prevotes: Vec<bool>,
    /// One flag per roster index.
    pub precommits: Vec<bool>,
    /// Prevote participation, 0..=100.
    pub prevote_percentage: u8,
    /// Precommit participation, 0..=100.
    pub precommit_percentage: u8,
    /// Sum of the voting power of every prevoting validator.
    pub prevote_power: u64,
    /// Sum of the voting power of every precommitting validator.
    pub precommit_power: u64,
    /// Metric the percentages were computed with.
    pub metric: ParticipationMetric,
}

impl RoundSnapshot {
    /// Display names in roster order.
    pub fn monikers(&self) -> Vec<String> {
        self.roster.iter().map(|v| v.moniker.clone()).collect()
    }

    /// Total voting power of the roster.
    pub fn total_power(&self) -> u64 {
        self.roster.iter().map(|v| v.voting_power).sum()
    }

    /// True when `other` has the same members in the same order.
    ///
    /// Index-aligned vote lists are only comparable between snapshots whose
    /// rosters agree on this.
    pub fn same_roster_order(&self, other: &RoundSnapshot) -> bool {
        Arc::ptr_eq(&self.roster, &other.roster)
            || (self.roster.len() == other.roster.len()
                && self
                    .roster
                    .iter()
                    .zip(other.roster.iter())
                    .all(|(a, b)| a.address == b.address))
    }
}

/// Encodes vote flags the way display clients expect them (`1` voted, `0` not).
pub fn flags_to_list(flags: &[bool]) -> Vec<u8> {
    flags.iter().map(|&voted| u8::from(voted)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator(index: usize, address: &str, power: u64) -> ValidatorInfo {
        ValidatorInfo {
            index,
            address: address.to_string(),
            moniker: address.to_lowercase(),
            voting_power: power,
        }
    }

    fn snapshot(roster: Vec<ValidatorInfo>) -> RoundSnapshot {
        let n = roster.len();
        RoundSnapshot {
            height: 1,
            round: 0,
            version: "v1".into(),
            roster: roster.into(),
            prevotes: vec![false; n],
            precommits: vec![false; n],
            prevote_percentage: 0,
            precommit_percentage: 0,
            prevote_power: 0,
            precommit_power: 0,
            metric: ParticipationMetric::VotingPower,
        }
    }

    #[test]
    fn roster_order_compares_addresses_not_allocations() {
        let a = snapshot(vec![validator(0, "AA", 10), validator(1, "BB", 5)]);
        let b = snapshot(vec![validator(0, "AA", 12), validator(1, "BB", 5)]);
        let c = snapshot(vec![validator(0, "BB", 10), validator(1, "AA", 5)]);

        assert!(a.same_roster_order(&b));
        assert!(!a.same_roster_order(&c));
        assert_eq!(a.total_power(), 15);
        assert_eq!(a.monikers(), vec!["aa".to_string(), "bb".to_string()]);
    }

    #[test]
    fn metric_parses_from_cli_spellings() {
        assert_eq!("count".parse::<ParticipationMetric>(), Ok(ParticipationMetric::Count));
        assert_eq!(
            "Voting-Power".parse::<ParticipationMetric>(),
            Ok(ParticipationMetric::VotingPower)
        );
        assert!("stake".parse::<ParticipationMetric>().is_err());
        assert_eq!(flags_to_list(&[true, false, true]), vec![1, 0, 1]);
    }
}
