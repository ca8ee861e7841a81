//! # Diff Engine
//!
//! Computes the minimal `Patch` between the last broadcast snapshot and the
//! current one.
//!
//! A `Patch` is a typed, optional-field structure. It only becomes the sparse
//! key/value JSON object that display clients consume when it is serialized at
//! the broadcast boundary (`skip_serializing_if = "Option::is_none"`), so the
//! engine itself never deals with dynamic maps.
//!
//! ## Rules
//!
//! - Scalars are included when they differ.
//! - Lists are compared element-wise and sent whole when any element differs;
//!   clients redraw the full list anyway.
//! - When the roster order changes, `monikers`, `pv_list` and `pc_list` are
//!   always sent together: a partial list patch would be applied to the wrong
//!   indices.
//! - No previous snapshot means a full patch.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use serde::{Deserialize, Serialize};

use crate::core::snapshot::{flags_to_list, RoundSnapshot};

/// Upstream endpoints advertised to display clients on connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSources {
    /// REST API base URL.
    pub api: String,
    /// RPC base URL.
    pub rpc: String,
}

/// A sparse update message. Field names are the wire keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    /// Node application version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Height being decided.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u64>,
    /// Display names in roster order.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monikers: Option<Vec<String>>,
    /// Prevote participation, 0..=100.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pv_percentage: Option<u8>,
    /// Voting power that prevoted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pv_voting_power: Option<u64>,
    /// Prevote flags in roster order.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pv_list: Option<Vec<u8>>,
    /// Precommit participation, 0..=100.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pc_percentage: Option<u8>,
    /// Voting power that precommitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pc_voting_power: Option<u64>,
    /// Precommit flags in roster order.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pc_list: Option<Vec<u8>>,
    /// Only ever set on the welcome message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_sources: Option<DataSources>,
}

impl Patch {
    /// Every field of `snapshot`.
    pub fn full(snapshot: &RoundSnapshot) -> Self {
        Patch {
            version: Some(snapshot.version.clone()),
            height: Some(snapshot.height),
            monikers: Some(snapshot.monikers()),
            pv_percentage: Some(snapshot.prevote_percentage),
            pv_voting_power: Some(snapshot.prevote_power),
            pv_list: Some(flags_to_list(&snapshot.prevotes)),
            pc_percentage: Some(snapshot.precommit_percentage),
            pc_voting_power: Some(snapshot.precommit_power),
            pc_list: Some(flags_to_list(&snapshot.precommits)),
            data_sources: None,
        }
    }

    /// Attaches the upstream endpoints (welcome message).
    pub fn with_data_sources(mut self, sources: DataSources) -> Self {
        self.data_sources = Some(sources);
        self
    }

    /// True when no field is set; such a patch is never broadcast.
    pub fn is_empty(&self) -> bool {
        self.keys().is_empty()
    }

    /// Wire keys present in this patch, in wire order.
    pub fn keys(&self) -> Vec<&'static str> {
        let present = [
            ("version", self.version.is_some()),
            ("height", self.height.is_some()),
            ("monikers", self.monikers.is_some()),
            ("pv_percentage", self.pv_percentage.is_some()),
            ("pv_voting_power", self.pv_voting_power.is_some()),
            ("pv_list", self.pv_list.is_some()),
            ("pc_percentage", self.pc_percentage.is_some()),
            ("pc_voting_power", self.pc_voting_power.is_some()),
            ("pc_list", self.pc_list.is_some()),
            ("data_sources", self.data_sources.is_some()),
        ];
        present
            .into_iter()
            .filter_map(|(key, set)| set.then_some(key))
            .collect()
    }

    /// Serializes into the sparse JSON object pushed to clients.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

fn changed<T: PartialEq + Clone>(old: &T, new: &T) -> Option<T> {
    (old != new).then(|| new.clone())
}

/// Field-by-field difference from `previous` to `current`.
pub fn diff(previous: Option<&RoundSnapshot>, current: &RoundSnapshot) -> Patch {
    let Some(previous) = previous else {
        return Patch::full(current);
    };

    let mut patch = Patch {
        version: changed(&previous.version, &current.version),
        height: changed(&previous.height, &current.height),
        pv_percentage: changed(&previous.prevote_percentage, &current.prevote_percentage),
        pv_voting_power: changed(&previous.prevote_power, &current.prevote_power),
        pc_percentage: changed(&previous.precommit_percentage, &current.precommit_percentage),
        pc_voting_power: changed(&previous.precommit_power, &current.precommit_power),
        ..Patch::default()
    };

    if !previous.same_roster_order(current) {
        patch.monikers = Some(current.monikers());
        patch.pv_list = Some(flags_to_list(&current.prevotes));
        patch.pc_list = Some(flags_to_list(&current.precommits));
        return patch;
    }

    let old_monikers = previous.roster.iter().map(|v| &v.moniker);
    if !old_monikers.eq(current.roster.iter().map(|v| &v.moniker)) {
        patch.monikers = Some(current.monikers());
    }
    if previous.prevotes != current.prevotes {
        patch.pv_list = Some(flags_to_list(&current.prevotes));
    }
    if previous.precommits != current.precommits {
        patch.pc_list = Some(flags_to_list(&current.precommits));
    }
    patch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::snapshot::{ParticipationMetric, ValidatorInfo};
    use std::sync::Arc;

    fn roster(names: &[&str]) -> Arc<[ValidatorInfo]> {
        names
            .iter()
            .enumerate()
            .map(|(index, name)| ValidatorInfo {
                index,
                address: name.to_uppercase(),
                moniker: name.to_string(),
                voting_power: 10,
            })
            .collect::<Vec<_>>()
            .into()
    }

    fn snapshot(names: &[&str]) -> RoundSnapshot {
        RoundSnapshot {
            height: 500,
            round: 0,
            version: "v1.0.0".into(),
            roster: roster(names),
            prevotes: vec![true; names.len()],
            precommits: vec![false; names.len()],
            prevote_percentage: 100,
            precommit_percentage: 0,
            prevote_power: 10 * names.len() as u64,
            precommit_power: 0,
            metric: ParticipationMetric::VotingPower,
        }
    }

    #[test]
    fn identical_snapshots_produce_empty_patch() {
        let s = snapshot(&["a", "b"]);
        let patch = diff(Some(&s), &s.clone());
        assert!(patch.is_empty());
        assert_eq!(patch.to_json().unwrap(), "{}");
    }

    #[test]
    fn height_only_change() {
        let s1 = snapshot(&["a", "b"]);
        let mut s2 = s1.clone();
        s2.height = 501;

        let patch = diff(Some(&s1), &s2);
        assert_eq!(
            patch,
            Patch {
                height: Some(501),
                ..Patch::default()
            }
        );
        assert_eq!(patch.to_json().unwrap(), r#"{"height":501}"#);
    }

    #[test]
    fn first_snapshot_is_full() {
        let s = snapshot(&["a", "b"]);
        let patch = diff(None, &s);
        assert_eq!(
            patch.keys(),
            vec![
                "version",
                "height",
                "monikers",
                "pv_percentage",
                "pv_voting_power",
                "pv_list",
                "pc_percentage",
                "pc_voting_power",
                "pc_list"
            ]
        );
        assert_eq!(patch.pv_list, Some(vec![1, 1]));
    }

    #[test]
    fn roster_change_forces_roster_and_both_lists() {
        let s1 = snapshot(&["a", "b"]);
        // Same votes and tallies, different order.
        let s2 = RoundSnapshot {
            roster: roster(&["b", "a"]),
            ..s1.clone()
        };

        let patch = diff(Some(&s1), &s2);
        assert_eq!(patch.monikers, Some(vec!["b".to_string(), "a".to_string()]));
        assert_eq!(patch.pv_list, Some(vec![1, 1]));
        assert_eq!(patch.pc_list, Some(vec![0, 0]));
        assert_eq!(patch.height, None);

        let s3 = snapshot(&["a", "b", "c"]);
        let grown = diff(Some(&s1), &s3);
        assert!(grown.monikers.is_some() && grown.pv_list.is_some() && grown.pc_list.is_some());
    }

    #[test]
    fn single_vote_change_sends_only_that_list() {
        let s1 = snapshot(&["a", "b"]);
        let mut s2 = s1.clone();
        s2.precommits[1] = true;
        s2.precommit_power = 10;
        s2.precommit_percentage = 50;

        let patch = diff(Some(&s1), &s2);
        assert_eq!(patch.keys(), vec!["pc_percentage", "pc_voting_power", "pc_list"]);
        assert_eq!(patch.pc_list, Some(vec![0, 1]));
    }

    #[test]
    fn welcome_carries_data_sources() {
        let sources = DataSources {
            api: "http://api:1317".into(),
            rpc: "http://rpc:26657".into(),
        };
        let welcome = Patch::default().with_data_sources(sources);
        assert_eq!(
            welcome.to_json().unwrap(),
            r#"{"data_sources":{"api":"http://api:1317","rpc":"http://rpc:26657"}}"#
        );
    }
}
