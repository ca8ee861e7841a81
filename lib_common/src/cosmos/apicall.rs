//! # Cosmos Node Client
//!
//! `CosmosClient` is the production `RoundSource`. One fetch queries two
//! independent halves concurrently, each under its own deadline:
//!
//! - **validator half**: the active set from RPC `/validators` (all pages),
//!   with monikers resolved through the staking API. The pubkey → moniker map
//!   is cached. When the active set holds a key the cache has not seen, the
//!   staking walk is started as a background task; until it lands, unknown
//!   validators are shown by address. The walk never counts against a cycle's
//!   deadline.
//! - **round half**: RPC `/consensus_state` and `/abci_info`.
//!
//! The client never retries; the next poll cycle is the retry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;

use crate::core::diff::DataSources;
use crate::core::snapshot::{RawRound, RawValidator, RoundStateData, ValidatorSetData};
use crate::core::source::{FetchError, RoundSource};
use crate::cosmos::model::{
    parse_height_round_step, parse_votes, AbciInfo, ConsensusStateResult, RpcEnvelope,
    RpcValidator, RpcValidatorsPage, StakingValidatorsPage,
};
use crate::retrieve::ky_http::{ApiClient, ApiClientOptions};

const STAKING_VALIDATORS_PATH: &str = "cosmos/staking/v1beta1/validators";
const RPC_VALIDATORS_PATH: &str = "validators";
const RPC_ABCI_INFO_PATH: &str = "abci_info";
const RPC_CONSENSUS_STATE_PATH: &str = "consensus_state";

/// Page size requested from RPC `/validators` (the CometBFT maximum).
const RPC_PER_PAGE: u64 = 100;
/// Safety bound for both paginated walks.
const MAX_PAGES: usize = 100;
/// Minimum spacing of moniker refreshes triggered by unknown keys.
const MONIKER_REFRESH_COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Default)]
struct MonikerCache {
    by_pubkey: HashMap<String, String>,
    /// Start of the last refresh attempt.
    refreshed_at: Option<Instant>,
    refreshing: bool,
}

impl MonikerCache {
    fn needs_refresh(&self, active: &[RpcValidator]) -> bool {
        if self.refreshing {
            return false;
        }
        match self.refreshed_at {
            None => true,
            Some(at) => {
                at.elapsed() >= MONIKER_REFRESH_COOLDOWN
                    && active.iter().any(|v| !self.by_pubkey.contains_key(&v.pub_key.value))
            }
        }
    }
}

type SharedMonikers = Arc<Mutex<MonikerCache>>;

fn lock_cache(cache: &Mutex<MonikerCache>) -> MutexGuard<'_, MonikerCache> {
    cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Client for one Cosmos node (REST API + CometBFT RPC).
pub struct CosmosClient {
    api: ApiClient,
    rpc: ApiClient,
    sources: DataSources,
    request_timeout: Duration,
    monikers: SharedMonikers,
}

impl CosmosClient {
    /// Creates a client for the given REST API and RPC base URLs.
    ///
    /// `request_timeout` bounds each half of a fetch.
    pub fn new(api_url: &str, rpc_url: &str, request_timeout: Duration) -> anyhow::Result<Self> {
        let options = ApiClientOptions {
            timeout: request_timeout,
            max_retries: 0,
        };
        Ok(Self {
            api: ApiClient::new(api_url, options).context("invalid API URL")?,
            rpc: ApiClient::new(rpc_url, options).context("invalid RPC URL")?,
            sources: DataSources {
                api: api_url.to_string(),
                rpc: rpc_url.to_string(),
            },
            request_timeout,
            monikers: Arc::new(Mutex::new(MonikerCache::default())),
        })
    }

    /// The endpoints advertised to display clients.
    pub fn data_sources(&self) -> DataSources {
        self.sources.clone()
    }

    /// Walks every page of the staking validator list.
    pub async fn fetch_staking_monikers(&self) -> anyhow::Result<HashMap<String, String>> {
        walk_staking_monikers(&self.api).await
    }

    /// Loads the moniker map and waits for it, outside any cycle deadline.
    ///
    /// Returns the number of known monikers.
    pub async fn load_monikers(&self) -> anyhow::Result<usize> {
        let monikers = walk_staking_monikers(&self.api).await?;
        let count = monikers.len();
        let mut cache = lock_cache(&self.monikers);
        cache.by_pubkey = monikers;
        cache.refreshed_at = Some(Instant::now());
        Ok(count)
    }

    /// Starts a background staking walk if the active set needs one.
    fn schedule_moniker_refresh(&self, active: &[RpcValidator]) {
        {
            let mut cache = lock_cache(&self.monikers);
            if !cache.needs_refresh(active) {
                return;
            }
            cache.refreshing = true;
            cache.refreshed_at = Some(Instant::now());
        }

        let api = self.api.clone();
        let cache = Arc::clone(&self.monikers);
        tokio::spawn(async move {
            let result = walk_staking_monikers(&api).await;
            let mut cache = lock_cache(&cache);
            cache.refreshing = false;
            match result {
                Ok(monikers) => {
                    tracing::info!(validators = monikers.len(), "moniker map refreshed");
                    cache.by_pubkey = monikers;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "moniker refresh failed, unknown validators shown by address");
                }
            }
        });
    }

    /// Walks every page of the active validator set.
    ///
    /// Returns the height of the first page with all members.
    pub async fn fetch_active_set(&self) -> anyhow::Result<(u64, Vec<RpcValidator>)> {
        let mut validators = Vec::new();
        let mut height = None;
        let mut read = 0u64;

        for page in 1..=MAX_PAGES {
            let query = [("page", page.to_string()), ("per_page", RPC_PER_PAGE.to_string())];
            let body: RpcEnvelope<RpcValidatorsPage> = self
                .rpc
                .get(RPC_VALIDATORS_PATH, &query)
                .await?
                .into_data()
                .context("active validator set")?;
            let result = body.result;

            height.get_or_insert(result.block_height);
            read += result.count;
            let empty = result.validators.is_empty();
            validators.extend(result.validators);

            if read >= result.total || empty {
                return Ok((height.unwrap_or_default(), validators));
            }
        }
        anyhow::bail!("active validator set: more than {} pages", MAX_PAGES)
    }

    /// Validator / voting-power half.
    pub async fn fetch_validator_set(&self) -> anyhow::Result<ValidatorSetData> {
        let (height, active) = self.fetch_active_set().await?;

        self.schedule_moniker_refresh(&active);

        let cache = lock_cache(&self.monikers);
        let validators = active
            .into_iter()
            .map(|v| RawValidator {
                moniker: cache
                    .by_pubkey
                    .get(&v.pub_key.value)
                    .filter(|m| !m.is_empty())
                    .cloned()
                    .unwrap_or_else(|| v.address.clone()),
                address: v.address,
                voting_power: v.voting_power,
            })
            .collect();

        Ok(ValidatorSetData { height, validators })
    }

    /// Application version reported by `/abci_info`.
    pub async fn fetch_version(&self) -> anyhow::Result<String> {
        let body: RpcEnvelope<AbciInfo> = self
            .rpc
            .get(RPC_ABCI_INFO_PATH, &[])
            .await?
            .into_data()
            .context("abci_info")?;
        Ok(body.result.response.version)
    }

    /// Consensus-round half.
    pub async fn fetch_round_state(&self) -> anyhow::Result<RoundStateData> {
        let consensus = async {
            let body: RpcEnvelope<ConsensusStateResult> = self
                .rpc
                .get(RPC_CONSENSUS_STATE_PATH, &[])
                .await?
                .into_data()
                .context("consensus_state")?;
            anyhow::Ok(body.result.round_state)
        };
        let (state, version) = tokio::try_join!(consensus, self.fetch_version())?;

        let hrs = parse_height_round_step(&state.height_round_step)?;
        let votes = state.votes_for(hrs.round)?;
        Ok(RoundStateData {
            height: hrs.height,
            round: hrs.round,
            step: hrs.step,
            version,
            prevotes: parse_votes(&votes.prevotes)?,
            precommits: parse_votes(&votes.precommits)?,
        })
    }
}

async fn walk_staking_monikers(api: &ApiClient) -> anyhow::Result<HashMap<String, String>> {
    let mut monikers = HashMap::new();
    let mut next_key: Option<String> = None;

    for _ in 0..MAX_PAGES {
        let query: Vec<(&str, String)> = match &next_key {
            Some(key) => vec![("pagination.key", key.clone())],
            None => Vec::new(),
        };
        let page: StakingValidatorsPage = api
            .get(STAKING_VALIDATORS_PATH, &query)
            .await?
            .into_data()
            .context("staking validators")?;

        for validator in page.validators {
            monikers.insert(validator.consensus_pubkey.key, validator.description.moniker);
        }

        next_key = page
            .pagination
            .and_then(|p| p.next_key)
            .filter(|key| !key.is_empty());
        if next_key.is_none() {
            return Ok(monikers);
        }
    }
    anyhow::bail!("staking validators: more than {} pages", MAX_PAGES)
}

async fn bounded<T>(
    limit: Duration,
    fut: impl std::future::Future<Output = anyhow::Result<T>>,
) -> Result<T, String> {
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(_) => Err(format!("timed out after {:?}", limit)),
    }
}

#[async_trait]
impl RoundSource for CosmosClient {
    async fn fetch_round(&self) -> Result<RawRound, FetchError> {
        let (validators, round) = tokio::join!(
            bounded(self.request_timeout, self.fetch_validator_set()),
            bounded(self.request_timeout, self.fetch_round_state()),
        );
        let (validators, round) = FetchError::from_halves(validators, round)?;
        Ok(RawRound { validators, round })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::source::UpstreamSource;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Canned answer of the mock node.
    #[derive(Clone)]
    enum Reply {
        Json(String),
        Status(&'static str),
        Slow(Duration, String),
        Hang,
    }

    /// A minimal HTTP server answering by request target (path + query).
    struct MockNode {
        base: String,
        staking_hits: Arc<AtomicUsize>,
    }

    impl MockNode {
        fn start(routes: Vec<(&'static str, Reply)>) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let base = format!("http://{}", listener.local_addr().unwrap());
            let staking_hits = Arc::new(AtomicUsize::new(0));
            let hits = Arc::clone(&staking_hits);
            let routes = Arc::new(routes);

            std::thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(mut stream) = stream else { break };
                    let routes = Arc::clone(&routes);
                    let hits = Arc::clone(&hits);
                    std::thread::spawn(move || {
                        let mut buf = [0u8; 8192];
                        let n = stream.read(&mut buf).unwrap_or(0);
                        let request = String::from_utf8_lossy(&buf[..n]).to_string();
                        let target = request.split(' ').nth(1).unwrap_or("/").to_string();
                        if target.starts_with("/cosmos/staking") {
                            hits.fetch_add(1, Ordering::SeqCst);
                        }

                        // Longest matching prefix wins.
                        let reply = routes
                            .iter()
                            .filter(|(prefix, _)| target.starts_with(prefix))
                            .max_by_key(|(prefix, _)| prefix.len())
                            .map(|(_, reply)| reply.clone())
                            .unwrap_or(Reply::Status("404 Not Found"));

                        let (status, body) = match reply {
                            Reply::Json(body) => ("200 OK", body),
                            Reply::Status(status) => (status, String::from("error")),
                            Reply::Slow(delay, body) => {
                                std::thread::sleep(delay);
                                ("200 OK", body)
                            }
                            Reply::Hang => {
                                std::thread::sleep(Duration::from_secs(3));
                                return;
                            }
                        };
                        let response = format!(
                            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            status,
                            body.len(),
                            body
                        );
                        let _ = stream.write_all(response.as_bytes());
                    });
                }
            });

            Self { base, staking_hits }
        }
    }

    fn staking_page(entries: &[(&str, &str)], next_key: Option<&str>) -> String {
        let validators: Vec<serde_json::Value> = entries
            .iter()
            .map(|(key, moniker)| {
                serde_json::json!({
                    "operator_address": "cosmosvaloper1",
                    "consensus_pubkey": {"@type": "/cosmos.crypto.ed25519.PubKey", "key": key},
                    "description": {"moniker": moniker}
                })
            })
            .collect();
        serde_json::json!({
            "validators": validators,
            "pagination": {"next_key": next_key, "total": "0"}
        })
        .to_string()
    }

    fn rpc_validators(height: u64, entries: &[(&str, &str, u64)], total: usize) -> String {
        let validators: Vec<serde_json::Value> = entries
            .iter()
            .map(|(address, key, power)| {
                serde_json::json!({
                    "address": address,
                    "pub_key": {"type": "tendermint/PubKeyEd25519", "value": key},
                    "voting_power": power.to_string(),
                    "proposer_priority": "0"
                })
            })
            .collect();
        serde_json::json!({
            "jsonrpc": "2.0", "id": -1,
            "result": {
                "block_height": height.to_string(),
                "validators": validators,
                "count": entries.len().to_string(),
                "total": total.to_string()
            }
        })
        .to_string()
    }

    fn consensus_state(hrs: &str, prevotes: &[&str], precommits: &[&str]) -> String {
        serde_json::json!({
            "jsonrpc": "2.0", "id": -1,
            "result": {"round_state": {
                "height/round/step": hrs,
                "height_vote_set": [{
                    "round": 0,
                    "prevotes": prevotes,
                    "prevotes_bit_array": "BA{2:xx} 150/150 = 1.00",
                    "precommits": precommits,
                    "precommits_bit_array": "BA{2:__} 0/150 = 0.00"
                }]
            }}
        })
        .to_string()
    }

    fn abci_info(version: &str) -> String {
        serde_json::json!({
            "jsonrpc": "2.0", "id": -1,
            "result": {"response": {"data": "gaia", "version": version, "last_block_height": "500"}}
        })
        .to_string()
    }

    const ADDR_A: &str = "AAAAAAAAAAAA1111111111111111111111111111";
    const ADDR_B: &str = "BBBBBBBBBBBB2222222222222222222222222222";

    fn healthy_routes() -> Vec<(&'static str, Reply)> {
        vec![
            (
                "/cosmos/staking/v1beta1/validators",
                Reply::Json(staking_page(&[("keyA", "alpha")], Some("cGFnZTI="))),
            ),
            (
                "/cosmos/staking/v1beta1/validators?pagination.key=",
                Reply::Json(staking_page(&[("keyB", "beta")], None)),
            ),
            (
                "/validators?page=1",
                Reply::Json(rpc_validators(500, &[(ADDR_A, "keyA", 100)], 2)),
            ),
            (
                "/validators?page=2",
                Reply::Json(rpc_validators(500, &[(ADDR_B, "keyB", 50)], 2)),
            ),
            (
                "/consensus_state",
                Reply::Json(consensus_state(
                    "500/0/4",
                    &["Vote{0:AAAAAAAAAAAA 500/00/SIGNED_MSG_TYPE_PREVOTE(Prevote) 1A2B3C4D5E6F @ 2024-01-01T00:00:00Z}", "nil-Vote"],
                    &["nil-Vote", "nil-Vote"],
                )),
            ),
            ("/abci_info", Reply::Json(abci_info("v15.2.0"))),
        ]
    }

    #[tokio::test]
    async fn fetches_and_joins_both_halves() {
        let node = MockNode::start(healthy_routes());
        let client = CosmosClient::new(&node.base, &node.base, Duration::from_secs(5)).unwrap();
        assert_eq!(client.load_monikers().await.unwrap(), 2);

        let raw = client.fetch_round().await.unwrap();
        assert_eq!(raw.validators.height, 500);
        assert_eq!(
            raw.validators.validators,
            vec![
                RawValidator {
                    address: ADDR_A.into(),
                    moniker: "alpha".into(),
                    voting_power: 100
                },
                RawValidator {
                    address: ADDR_B.into(),
                    moniker: "beta".into(),
                    voting_power: 50
                },
            ]
        );
        assert_eq!(raw.round.height, 500);
        assert_eq!(raw.round.step, "RoundStepPrevote");
        assert_eq!(raw.round.version, "v15.2.0");
        assert_eq!(raw.round.prevotes, vec!["AAAAAAAAAAAA".to_string()]);
        assert!(raw.round.precommits.is_empty());

        // Both staking pages were read once; fetches use the cache.
        assert_eq!(node.staking_hits.load(Ordering::SeqCst), 2);
        client.fetch_round().await.unwrap();
        assert_eq!(node.staking_hits.load(Ordering::SeqCst), 2);

        assert_eq!(client.data_sources().api, node.base);
    }

    #[tokio::test]
    async fn unknown_moniker_falls_back_to_address() {
        let mut routes = healthy_routes();
        routes[0].1 = Reply::Json(staking_page(&[("keyA", "alpha")], None));
        let node = MockNode::start(routes);
        let client = CosmosClient::new(&node.base, &node.base, Duration::from_secs(5)).unwrap();
        client.load_monikers().await.unwrap();

        let set = client.fetch_validator_set().await.unwrap();
        assert_eq!(set.validators[0].moniker, "alpha");
        assert_eq!(set.validators[1].moniker, ADDR_B);
    }

    #[tokio::test]
    async fn slow_moniker_walk_runs_outside_the_cycle_deadline() {
        // Two staking pages of 300 ms each: together longer than the 400 ms deadline.
        let mut routes = healthy_routes();
        for (path, reply) in routes.iter_mut() {
            if path.starts_with("/cosmos/staking") {
                if let Reply::Json(body) = reply.clone() {
                    *reply = Reply::Slow(Duration::from_millis(300), body);
                }
            }
        }
        let node = MockNode::start(routes);
        let client =
            CosmosClient::new(&node.base, &node.base, Duration::from_millis(400)).unwrap();

        let first = client.fetch_round().await.unwrap();
        let monikers: Vec<&str> = first
            .validators
            .validators
            .iter()
            .map(|v| v.moniker.as_str())
            .collect();
        assert_eq!(monikers, vec![ADDR_A, ADDR_B]);

        // Cycles during the walk neither fail nor start a second walk.
        let during = client.fetch_round().await.unwrap();
        assert_eq!(during.validators.validators.len(), 2);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(node.staking_hits.load(Ordering::SeqCst), 2);

        let after = client.fetch_round().await.unwrap();
        let monikers: Vec<&str> = after
            .validators
            .validators
            .iter()
            .map(|v| v.moniker.as_str())
            .collect();
        assert_eq!(monikers, vec!["alpha", "beta"]);
        assert_eq!(node.staking_hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn round_failure_is_partial() {
        let mut routes = healthy_routes();
        routes.retain(|(path, _)| *path != "/consensus_state");
        routes.push(("/consensus_state", Reply::Status("500 Internal Server Error")));
        let node = MockNode::start(routes);
        let client = CosmosClient::new(&node.base, &node.base, Duration::from_secs(5)).unwrap();

        match client.fetch_round().await.unwrap_err() {
            FetchError::Partial { failed, reason } => {
                assert_eq!(failed, UpstreamSource::Round);
                assert!(reason.contains("500"), "{}", reason);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn malformed_vote_is_a_fetch_error() {
        let mut routes = healthy_routes();
        routes.retain(|(path, _)| *path != "/consensus_state");
        routes.push((
            "/consensus_state",
            Reply::Json(consensus_state("500/0/4", &["Vote{zz}"], &[])),
        ));
        let node = MockNode::start(routes);
        let client = CosmosClient::new(&node.base, &node.base, Duration::from_secs(5)).unwrap();

        let err = client.fetch_round().await.unwrap_err();
        assert!(matches!(err, FetchError::Partial { failed: UpstreamSource::Round, .. }));
        assert!(err.to_string().contains("unparseable vote"), "{}", err);
    }

    #[tokio::test]
    async fn slow_source_times_out_independently() {
        let mut routes = healthy_routes();
        routes.retain(|(path, _)| *path != "/consensus_state");
        routes.push(("/consensus_state", Reply::Hang));
        let node = MockNode::start(routes);
        let client = CosmosClient::new(&node.base, &node.base, Duration::from_millis(300)).unwrap();

        let started = Instant::now();
        let err = client.fetch_round().await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(err, FetchError::Partial { failed: UpstreamSource::Round, .. }));
    }

    #[tokio::test]
    async fn unreachable_node_is_total_failure() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let base = format!("http://127.0.0.1:{}", port);
        let client = CosmosClient::new(&base, &base, Duration::from_secs(2)).unwrap();

        assert!(client.fetch_round().await.unwrap_err().is_total());
    }
}
