//! # Cosmos Node Response Model
//!
//! Serde shapes of the Cosmos SDK REST and CometBFT RPC responses the monitor
//! reads, plus parsers for the stringly-typed parts of `/consensus_state`.
//!
//! Only the fields that are actually used are declared; everything else in the
//! node's responses is ignored.

use serde::{Deserialize, Deserializer};
use thiserror::Error;

/// A response body that could not be interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedResponse {
    /// A vote entry is neither `nil-Vote` nor `Vote{<idx>:<address> ...}`.
    #[error("unparseable vote entry '{0}'")]
    Vote(String),
    /// `height/round/step` does not hold three numbers.
    #[error("unparseable height/round/step '{0}'")]
    HeightRoundStep(String),
    /// `height_vote_set` has no entries.
    #[error("consensus state has an empty height_vote_set")]
    EmptyVoteSet,
}

/// CometBFT RPC JSON-RPC envelope.
#[derive(Debug, Deserialize)]
pub struct RpcEnvelope<T> {
    /// Method result.
    pub result: T,
}

/// Nodes emit 64-bit integers as strings; some fields appear as numbers.
fn u64_from_str_or_num<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Num(u64),
        Str(String),
    }

    match Repr::deserialize(deserializer)? {
        Repr::Num(n) => Ok(n),
        Repr::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

// --- Cosmos SDK staking API ---

/// `GET /cosmos/staking/v1beta1/validators`
#[derive(Debug, Deserialize)]
pub struct StakingValidatorsPage {
    /// Validators of this page.
    pub validators: Vec<StakingValidator>,
    /// Pagination cursor.
    #[serde(default)]
    pub pagination: Option<Pagination>,
}

/// One validator as known to the staking module.
#[derive(Debug, Deserialize)]
pub struct StakingValidator {
    /// Consensus public key.
    pub consensus_pubkey: ConsensusPubkey,
    /// Human readable metadata.
    pub description: Description,
}

/// Consensus public key in its `Any` JSON form.
#[derive(Debug, Deserialize)]
pub struct ConsensusPubkey {
    /// Base64 key bytes.
    pub key: String,
}

/// Validator description.
#[derive(Debug, Deserialize)]
pub struct Description {
    /// Display name.
    #[serde(default)]
    pub moniker: String,
}

/// Cosmos SDK page cursor.
#[derive(Debug, Deserialize)]
pub struct Pagination {
    /// Opaque key of the next page; absent or null on the last page.
    #[serde(default)]
    pub next_key: Option<String>,
}

// --- CometBFT RPC ---

/// `GET /validators` result.
#[derive(Debug, Deserialize)]
pub struct RpcValidatorsPage {
    /// Height the set was read at.
    #[serde(deserialize_with = "u64_from_str_or_num")]
    pub block_height: u64,
    /// Validators of this page.
    pub validators: Vec<RpcValidator>,
    /// Entries in this page.
    #[serde(deserialize_with = "u64_from_str_or_num")]
    pub count: u64,
    /// Entries in the whole set.
    #[serde(deserialize_with = "u64_from_str_or_num")]
    pub total: u64,
}

/// One member of the active set.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcValidator {
    /// Hex consensus address.
    pub address: String,
    /// Consensus public key.
    pub pub_key: RpcPubKey,
    /// Voting power.
    #[serde(deserialize_with = "u64_from_str_or_num")]
    pub voting_power: u64,
}

/// Amino JSON public key.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcPubKey {
    /// Base64 key bytes, same encoding as `ConsensusPubkey::key`.
    pub value: String,
}

/// `GET /abci_info` result.
#[derive(Debug, Deserialize)]
pub struct AbciInfo {
    /// Application info.
    pub response: AbciInfoResponse,
}

/// Application info.
#[derive(Debug, Deserialize)]
pub struct AbciInfoResponse {
    /// Application version string.
    #[serde(default)]
    pub version: String,
}

/// `GET /consensus_state` result.
#[derive(Debug, Deserialize)]
pub struct ConsensusStateResult {
    /// Round state summary.
    pub round_state: ConsensusRoundState,
}

/// Round state summary.
#[derive(Debug, Deserialize)]
pub struct ConsensusRoundState {
    /// `"<height>/<round>/<step>"`.
    #[serde(rename = "height/round/step")]
    pub height_round_step: String,
    /// Vote sets of every round seen at this height.
    #[serde(default)]
    pub height_vote_set: Vec<RoundVoteSet>,
}

/// Votes of one round.
#[derive(Debug, Deserialize)]
pub struct RoundVoteSet {
    /// Round number.
    #[serde(deserialize_with = "u64_from_str_or_num")]
    pub round: u64,
    /// One entry per validator, `nil-Vote` when absent.
    #[serde(default)]
    pub prevotes: Vec<String>,
    /// One entry per validator, `nil-Vote` when absent.
    #[serde(default)]
    pub precommits: Vec<String>,
}

impl ConsensusRoundState {
    /// The vote set of `round`, or the latest one when the node has not
    /// created it yet.
    pub fn votes_for(&self, round: u32) -> Result<&RoundVoteSet, MalformedResponse> {
        self.height_vote_set
            .iter()
            .find(|set| set.round == u64::from(round))
            .or_else(|| self.height_vote_set.last())
            .ok_or(MalformedResponse::EmptyVoteSet)
    }
}

/// Decoded `height/round/step`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeightRoundStep {
    /// Height being decided.
    pub height: u64,
    /// Round.
    pub round: u32,
    /// Step name, e.g. `RoundStepPrevote`.
    pub step: String,
}

/// Parses `"<height>/<round>/<step>"` where step is the numeric CometBFT step.
pub fn parse_height_round_step(raw: &str) -> Result<HeightRoundStep, MalformedResponse> {
    let bad = || MalformedResponse::HeightRoundStep(raw.to_string());
    let mut parts = raw.trim().split('/');
    let (Some(h), Some(r), Some(s), None) = (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(bad());
    };
    let height = h.parse().map_err(|_| bad())?;
    let round = r.parse().map_err(|_| bad())?;
    let step: u8 = s.parse().map_err(|_| bad())?;
    Ok(HeightRoundStep {
        height,
        round,
        step: step_name(step),
    })
}

fn step_name(step: u8) -> String {
    let name = match step {
        1 => "RoundStepNewHeight",
        2 => "RoundStepNewRound",
        3 => "RoundStepPropose",
        4 => "RoundStepPrevote",
        5 => "RoundStepPrevoteWait",
        6 => "RoundStepPrecommit",
        7 => "RoundStepPrecommitWait",
        8 => "RoundStepCommit",
        other => return format!("RoundStep({})", other),
    };
    name.to_string()
}

/// Extracts the voter's address prefix from one vote entry.
///
/// `nil-Vote` yields `None`. Otherwise the entry must look like
/// `Vote{<idx>:<hex address prefix> <height>/<round>/<type> ...}`.
pub fn parse_vote(entry: &str) -> Result<Option<String>, MalformedResponse> {
    let entry = entry.trim();
    if entry == "nil-Vote" {
        return Ok(None);
    }
    let bad = || MalformedResponse::Vote(entry.to_string());

    let body = entry.strip_prefix("Vote{").ok_or_else(bad)?;
    let (index, rest) = body.split_once(':').ok_or_else(bad)?;
    if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return Err(bad());
    }
    let address = rest.split(' ').next().unwrap_or_default();
    if address.is_empty() || !address.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(bad());
    }
    Ok(Some(address.to_string()))
}

/// Address prefixes of every non-nil entry of `entries`.
pub fn parse_votes(entries: &[String]) -> Result<Vec<String>, MalformedResponse> {
    let mut voters = Vec::with_capacity(entries.len());
    for entry in entries {
        if let Some(address) = parse_vote(entry)? {
            voters.push(address);
        }
    }
    Ok(voters)
}
