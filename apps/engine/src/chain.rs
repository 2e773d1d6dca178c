use crate::config::{ChainConfig, ChainMode};
use crate::errors::PermanentChainError;
use crate::metrics::EngineTelemetry;
use crate::types::{ProposalData, parse_u256_dec, unix_now};
use alloy::network::EthereumWallet;
use alloy::primitives::{Address, B256, U256, keccak256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::Filter;
use alloy::signers::Signer;
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::SolEvent;
use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;
use url::Url;

alloy::sol! {
    struct OracleEventView {
        bytes32 eventId;
        string description;
        uint256 resolutionTime;
        uint8 status;
        bytes32 outcomeHash;
        uint256 rewardPool;
        bool settled;
    }

    #[sol(rpc)]
    interface IOracleRegistry {
        function getEvent(bytes32 eventId) external view returns (OracleEventView memory);
        event EventCreated(bytes32 indexed eventId, string description, uint256 resolutionTime);
    }

    #[sol(rpc)]
    interface IProposalManager {
        function submitProposal(bytes32 eventId, bytes32 proposalId, bytes32 outcomeHash, bytes outcome, uint256 confidenceScore, string evidenceURI) external payable;
        function finalizeProposal(bytes32 proposalId) external;
        event ProposalSubmitted(bytes32 indexed proposalId, bytes32 indexed eventId, bytes32 outcomeHash, uint256 bondAmount, uint256 livenessExpiry);
        event ProposalFinalized(bytes32 indexed proposalId, bytes32 outcomeHash);
    }

    #[sol(rpc)]
    interface IStakingManager {
        function settleEvent(bytes32 eventId) external;
        event EventSettled(bytes32 indexed eventId, uint256 rewardPool);
    }
}

#[derive(Debug, Clone)]
pub struct SubmittedProposal {
    pub proposal_id: B256,
    pub tx_hash: B256,
    pub submitted_at: i64,
    pub liveness_expiry: i64,
}

#[derive(Debug, Clone)]
pub struct ChainEventView {
    pub event_id: B256,
    pub description: String,
    pub resolution_time: i64,
    pub status: u8,
    pub reward_pool: U256,
    pub settled: bool,
}

#[derive(Debug, Clone)]
pub enum IndexedEvent {
    EventCreated {
        event_id: B256,
        description: String,
        resolution_time: i64,
    },
    ProposalSubmitted {
        proposal_id: B256,
        event_id: B256,
        liveness_expiry: i64,
    },
    ProposalFinalized {
        proposal_id: B256,
    },
}

#[derive(Debug, Clone)]
pub struct IndexedLog {
    pub block_number: u64,
    pub log_index: u64,
    pub tx_hash: B256,
    pub event: IndexedEvent,
}

pub fn event_id_bytes(event_id: &str) -> B256 {
    keccak256(event_id.as_bytes())
}

pub fn derive_proposal_id(event_id: B256, submitted_at: i64) -> B256 {
    let mut buf = Vec::with_capacity(40);
    buf.extend_from_slice(event_id.as_slice());
    buf.extend_from_slice(&submitted_at.to_be_bytes());
    keccak256(&buf)
}

pub struct ChainClient {
    inner: ChainClientInner,
    telemetry: EngineTelemetry,
}

enum ChainClientInner {
    Rpc(RpcChain),
    Mock(MockChain),
}

struct RpcChain {
    provider: DynProvider,
    oracle_registry: Address,
    proposal_manager: Address,
    staking_manager: Address,
    liveness_window_secs: i64,
    // Single wallet, single nonce stream: write-path calls are serialized.
    tx_lock: tokio::sync::Mutex<()>,
}

impl ChainClient {
    /// One-shot init: connect the provider, authenticate the wallet, bind the
    /// three contracts by logical name. A failure here is fatal to startup.
    pub async fn connect(cfg: &ChainConfig, telemetry: EngineTelemetry) -> Result<Self> {
        match cfg.mode {
            ChainMode::Mock => Ok(Self {
                inner: ChainClientInner::Mock(MockChain::new(cfg.liveness_window_secs)),
                telemetry,
            }),
            ChainMode::Rpc => {
                let url: Url = cfg.rpc_url.parse().context("parse BNB_RPC_URL")?;
                let base_provider = DynProvider::new(ProviderBuilder::new().connect_http(url.clone()));

                let discovered = base_provider.get_chain_id().await.context("eth_chainId")?;
                let chain_id = match cfg.chain_id {
                    Some(expected) => {
                        if discovered != expected {
                            anyhow::bail!(
                                "CHAIN_ID mismatch: configured={expected} rpc={discovered}"
                            );
                        }
                        expected
                    }
                    None => discovered,
                };

                let signer = PrivateKeySigner::from_slice(&cfg.private_key)
                    .context("invalid PRIVATE_KEY")?
                    .with_chain_id(Some(chain_id));
                let wallet = EthereumWallet::from(signer);
                let provider =
                    DynProvider::new(ProviderBuilder::new().wallet(wallet).connect_http(url));

                Ok(Self {
                    inner: ChainClientInner::Rpc(RpcChain {
                        provider,
                        oracle_registry: cfg.oracle_registry.context("ORACLE_REGISTRY_ADDRESS")?,
                        proposal_manager: cfg.proposal_manager.context("PROPOSAL_MANAGER_ADDRESS")?,
                        staking_manager: cfg.staking_manager.context("STAKING_MANAGER_ADDRESS")?,
                        liveness_window_secs: cfg.liveness_window_secs,
                        tx_lock: tokio::sync::Mutex::new(()),
                    }),
                    telemetry,
                })
            }
        }
    }

    pub fn new_mock(liveness_window_secs: i64, telemetry: EngineTelemetry) -> Self {
        Self {
            inner: ChainClientInner::Mock(MockChain::new(liveness_window_secs)),
            telemetry,
        }
    }

    pub fn mock(&self) -> Option<&MockChain> {
        match &self.inner {
            ChainClientInner::Mock(m) => Some(m),
            ChainClientInner::Rpc(_) => None,
        }
    }

    pub async fn submit_proposal(
        &self,
        event_id: &str,
        data: &ProposalData,
    ) -> Result<SubmittedProposal> {
        let started = Instant::now();
        let res = match &self.inner {
            ChainClientInner::Rpc(c) => c.submit_proposal(event_id, data).await,
            ChainClientInner::Mock(m) => m.submit_proposal(event_id, data),
        };
        self.telemetry
            .chain_rpc("submit_proposal", res.is_ok(), ms_since(started));
        res
    }

    pub async fn finalize_proposal(&self, proposal_id: B256) -> Result<B256> {
        let started = Instant::now();
        let res = match &self.inner {
            ChainClientInner::Rpc(c) => c.finalize_proposal(proposal_id).await,
            ChainClientInner::Mock(m) => m.finalize_proposal(proposal_id),
        };
        self.telemetry
            .chain_rpc("finalize_proposal", res.is_ok(), ms_since(started));
        res
    }

    pub async fn settle_event(&self, event_id: &str) -> Result<B256> {
        let started = Instant::now();
        let res = match &self.inner {
            ChainClientInner::Rpc(c) => c.settle_event(event_id).await,
            ChainClientInner::Mock(m) => m.settle_event(event_id),
        };
        self.telemetry
            .chain_rpc("settle_event", res.is_ok(), ms_since(started));
        res
    }

    pub async fn get_event(&self, event_id: &str) -> Result<ChainEventView> {
        let started = Instant::now();
        let res = match &self.inner {
            ChainClientInner::Rpc(c) => c.get_event(event_id).await,
            ChainClientInner::Mock(m) => m.get_event(event_id),
        };
        self.telemetry
            .chain_rpc("get_event", res.is_ok(), ms_since(started));
        res
    }

    pub async fn block_number(&self) -> Result<u64> {
        match &self.inner {
            ChainClientInner::Rpc(c) => c.provider.get_block_number().await.context("eth_blockNumber"),
            ChainClientInner::Mock(m) => Ok(m.head()),
        }
    }

    pub async fn logs_in_range(&self, from_block: u64, to_block: u64) -> Result<Vec<IndexedLog>> {
        match &self.inner {
            ChainClientInner::Rpc(c) => c.logs_in_range(from_block, to_block).await,
            ChainClientInner::Mock(m) => Ok(m.logs_in_range(from_block, to_block)),
        }
    }
}

impl RpcChain {
    async fn submit_proposal(&self, event_id: &str, data: &ProposalData) -> Result<SubmittedProposal> {
        let bond = parse_u256_dec(&data.bond_amount).context("parse bondAmount")?;
        let outcome_bytes = serde_json::to_vec(&data.outcome).context("serialize outcome")?;
        let outcome_hash = keccak256(&outcome_bytes);
        let submitted_at = unix_now();
        let eid = event_id_bytes(event_id);
        let proposal_id = derive_proposal_id(eid, submitted_at);

        let _guard = self.tx_lock.lock().await;
        let manager = IProposalManager::new(self.proposal_manager, self.provider.clone());
        let pending = manager
            .submitProposal(
                eid,
                proposal_id,
                outcome_hash,
                outcome_bytes.into(),
                U256::from(data.confidence_score),
                data.evidence_uri.clone().unwrap_or_default(),
            )
            .value(bond)
            .send()
            .await
            .map_err(|e| classify_chain_err("ProposalManager.submitProposal", e.into()))?;
        let receipt = pending
            .get_receipt()
            .await
            .context("submitProposal receipt")?;
        if !receipt.status() {
            return Err(PermanentChainError(format!(
                "submitProposal reverted: tx={:#x}",
                receipt.transaction_hash
            ))
            .into());
        }

        // The contract's emitted expiry is authoritative; local clock
        // arithmetic is only the decode-failure fallback.
        let liveness_expiry = receipt
            .inner
            .logs()
            .iter()
            .find_map(|log| {
                log.log_decode::<IProposalManager::ProposalSubmitted>()
                    .ok()
                    .and_then(|decoded| i64::try_from(decoded.inner.data.livenessExpiry).ok())
            })
            .unwrap_or(submitted_at + self.liveness_window_secs);

        Ok(SubmittedProposal {
            proposal_id,
            tx_hash: receipt.transaction_hash,
            submitted_at,
            liveness_expiry,
        })
    }

    async fn finalize_proposal(&self, proposal_id: B256) -> Result<B256> {
        let _guard = self.tx_lock.lock().await;
        let manager = IProposalManager::new(self.proposal_manager, self.provider.clone());
        let pending = manager
            .finalizeProposal(proposal_id)
            .send()
            .await
            .map_err(|e| classify_chain_err("ProposalManager.finalizeProposal", e.into()))?;
        let receipt = pending
            .get_receipt()
            .await
            .context("finalizeProposal receipt")?;
        if !receipt.status() {
            return Err(PermanentChainError(format!(
                "finalizeProposal reverted: tx={:#x}",
                receipt.transaction_hash
            ))
            .into());
        }
        Ok(receipt.transaction_hash)
    }

    async fn settle_event(&self, event_id: &str) -> Result<B256> {
        let eid = event_id_bytes(event_id);
        let _guard = self.tx_lock.lock().await;
        let staking = IStakingManager::new(self.staking_manager, self.provider.clone());
        let pending = staking
            .settleEvent(eid)
            .send()
            .await
            .map_err(|e| classify_chain_err("StakingManager.settleEvent", e.into()))?;
        let receipt = pending.get_receipt().await.context("settleEvent receipt")?;
        if !receipt.status() {
            return Err(PermanentChainError(format!(
                "settleEvent reverted: tx={:#x}",
                receipt.transaction_hash
            ))
            .into());
        }
        Ok(receipt.transaction_hash)
    }

    async fn get_event(&self, event_id: &str) -> Result<ChainEventView> {
        let registry = IOracleRegistry::new(self.oracle_registry, self.provider.clone());
        let view = registry
            .getEvent(event_id_bytes(event_id))
            .call()
            .await
            .context("OracleRegistry.getEvent")?;
        Ok(ChainEventView {
            event_id: view.eventId,
            description: view.description,
            resolution_time: i64::try_from(view.resolutionTime).unwrap_or(i64::MAX),
            status: view.status,
            reward_pool: view.rewardPool,
            settled: view.settled,
        })
    }

    async fn logs_in_range(&self, from_block: u64, to_block: u64) -> Result<Vec<IndexedLog>> {
        let filter = Filter::new()
            .address(vec![self.oracle_registry, self.proposal_manager])
            .from_block(from_block)
            .to_block(to_block);
        let raw = self
            .provider
            .get_logs(&filter)
            .await
            .context("eth_getLogs")?;

        let mut out = Vec::with_capacity(raw.len());
        for log in raw {
            let Some(topic0) = log.topic0().copied() else {
                continue;
            };
            let event = if topic0 == IOracleRegistry::EventCreated::SIGNATURE_HASH {
                let decoded = log
                    .log_decode::<IOracleRegistry::EventCreated>()
                    .map_err(|e| anyhow::anyhow!("EventCreated decode failed: {e}"))?;
                let ev = decoded.inner.data;
                IndexedEvent::EventCreated {
                    event_id: ev.eventId,
                    description: ev.description,
                    resolution_time: i64::try_from(ev.resolutionTime).unwrap_or(i64::MAX),
                }
            } else if topic0 == IProposalManager::ProposalSubmitted::SIGNATURE_HASH {
                let decoded = log
                    .log_decode::<IProposalManager::ProposalSubmitted>()
                    .map_err(|e| anyhow::anyhow!("ProposalSubmitted decode failed: {e}"))?;
                let ev = decoded.inner.data;
                IndexedEvent::ProposalSubmitted {
                    proposal_id: ev.proposalId,
                    event_id: ev.eventId,
                    liveness_expiry: i64::try_from(ev.livenessExpiry).unwrap_or(i64::MAX),
                }
            } else if topic0 == IProposalManager::ProposalFinalized::SIGNATURE_HASH {
                let decoded = log
                    .log_decode::<IProposalManager::ProposalFinalized>()
                    .map_err(|e| anyhow::anyhow!("ProposalFinalized decode failed: {e}"))?;
                IndexedEvent::ProposalFinalized {
                    proposal_id: decoded.inner.data.proposalId,
                }
            } else {
                continue;
            };

            out.push(IndexedLog {
                block_number: log.block_number.context("log missing blockNumber")?,
                log_index: log.log_index.context("log missing logIndex")?,
                tx_hash: log.transaction_hash.context("log missing transactionHash")?,
                event,
            });
        }
        out.sort_by_key(|l| (l.block_number, l.log_index));
        Ok(out)
    }
}

fn ms_since(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn classify_chain_err(op: &'static str, err: anyhow::Error) -> anyhow::Error {
    let msg = err.to_string().to_lowercase();
    if looks_like_revert(&msg) {
        PermanentChainError(format!("{op}: {err}")).into()
    } else {
        err.context(op)
    }
}

fn looks_like_revert(msg: &str) -> bool {
    msg.contains("revert")
        || msg.contains("insufficient funds")
        || msg.contains("insufficient bond")
        || msg.contains("invalid opcode")
        || msg.contains("out of gas")
}

pub fn looks_like_transient(err: &anyhow::Error) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains("timeout")
        || msg.contains("timed out")
        || msg.contains("deadline")
        || msg.contains("too many requests")
        || msg.contains("rate limit")
        || msg.contains("429")
        || msg.contains("bad gateway")
        || msg.contains("service unavailable")
        || msg.contains("502")
        || msg.contains("503")
        || msg.contains("504")
        || msg.contains("connection reset")
        || msg.contains("connection closed")
        || msg.contains("connection refused")
        || msg.contains("broken pipe")
        || msg.contains("nonce too low")
        || msg.contains("temporarily unavailable")
}

/// In-memory chain backend. Keeps the adapter's idempotency contract
/// (duplicate finalize/settle calls succeed) so orchestration paths can be
/// exercised without an RPC endpoint.
pub struct MockChain {
    liveness_window_secs: i64,
    state: std::sync::Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    head_block: u64,
    next_tx: u64,
    proposals: HashMap<B256, MockProposal>,
    settled: HashSet<B256>,
    logs: Vec<IndexedLog>,
    fail_next: VecDeque<String>,
}

#[derive(Debug, Clone)]
pub struct MockProposal {
    pub event_id: B256,
    pub bond: U256,
    pub liveness_expiry: i64,
    pub finalized: bool,
}

impl MockChain {
    fn new(liveness_window_secs: i64) -> Self {
        Self {
            liveness_window_secs,
            state: std::sync::Mutex::new(MockState::default()),
        }
    }

    fn next_tx_hash(state: &mut MockState) -> B256 {
        state.next_tx += 1;
        keccak256(state.next_tx.to_be_bytes())
    }

    fn take_injected_failure(state: &mut MockState) -> Option<anyhow::Error> {
        state.fail_next.pop_front().map(|msg| {
            if looks_like_revert(&msg.to_lowercase()) {
                PermanentChainError(msg).into()
            } else {
                anyhow::anyhow!(msg)
            }
        })
    }

    fn submit_proposal(&self, event_id: &str, data: &ProposalData) -> Result<SubmittedProposal> {
        let bond = parse_u256_dec(&data.bond_amount).context("parse bondAmount")?;
        let mut state = self.state.lock().expect("mock chain lock");
        if let Some(err) = Self::take_injected_failure(&mut state) {
            return Err(err);
        }

        let submitted_at = unix_now();
        let eid = event_id_bytes(event_id);
        let proposal_id = derive_proposal_id(eid, submitted_at);
        let liveness_expiry = submitted_at + self.liveness_window_secs;
        state.proposals.insert(
            proposal_id,
            MockProposal {
                event_id: eid,
                bond,
                liveness_expiry,
                finalized: false,
            },
        );
        let tx_hash = Self::next_tx_hash(&mut state);
        Ok(SubmittedProposal {
            proposal_id,
            tx_hash,
            submitted_at,
            liveness_expiry,
        })
    }

    fn finalize_proposal(&self, proposal_id: B256) -> Result<B256> {
        let mut state = self.state.lock().expect("mock chain lock");
        if let Some(err) = Self::take_injected_failure(&mut state) {
            return Err(err);
        }
        let Some(proposal) = state.proposals.get_mut(&proposal_id) else {
            return Err(PermanentChainError(format!(
                "finalizeProposal reverted: unknown proposal {proposal_id:#x}"
            ))
            .into());
        };
        proposal.finalized = true;
        Ok(Self::next_tx_hash(&mut state))
    }

    fn settle_event(&self, event_id: &str) -> Result<B256> {
        let mut state = self.state.lock().expect("mock chain lock");
        if let Some(err) = Self::take_injected_failure(&mut state) {
            return Err(err);
        }
        let eid = event_id_bytes(event_id);
        state.settled.insert(eid);
        Ok(Self::next_tx_hash(&mut state))
    }

    fn get_event(&self, event_id: &str) -> Result<ChainEventView> {
        let state = self.state.lock().expect("mock chain lock");
        let eid = event_id_bytes(event_id);
        Ok(ChainEventView {
            event_id: eid,
            description: String::new(),
            resolution_time: 0,
            status: 0,
            reward_pool: U256::ZERO,
            settled: state.settled.contains(&eid),
        })
    }

    fn head(&self) -> u64 {
        self.state.lock().expect("mock chain lock").head_block
    }

    fn logs_in_range(&self, from_block: u64, to_block: u64) -> Vec<IndexedLog> {
        let state = self.state.lock().expect("mock chain lock");
        let mut out: Vec<IndexedLog> = state
            .logs
            .iter()
            .filter(|l| l.block_number >= from_block && l.block_number <= to_block)
            .cloned()
            .collect();
        out.sort_by_key(|l| (l.block_number, l.log_index));
        out
    }

    pub fn set_head(&self, head: u64) {
        self.state.lock().expect("mock chain lock").head_block = head;
    }

    pub fn push_log(&self, log: IndexedLog) {
        self.state.lock().expect("mock chain lock").logs.push(log);
    }

    pub fn fail_next_with(&self, msg: &str) {
        self.state
            .lock()
            .expect("mock chain lock")
            .fail_next
            .push_back(msg.to_string());
    }

    pub fn proposal(&self, proposal_id: B256) -> Option<MockProposal> {
        self.state
            .lock()
            .expect("mock chain lock")
            .proposals
            .get(&proposal_id)
            .cloned()
    }

    pub fn is_finalized(&self, proposal_id: B256) -> bool {
        self.proposal(proposal_id).map(|p| p.finalized).unwrap_or(false)
    }

    pub fn is_settled(&self, event_id: &str) -> bool {
        self.state
            .lock()
            .expect("mock chain lock")
            .settled
            .contains(&event_id_bytes(event_id))
    }

    pub fn tx_count(&self) -> u64 {
        self.state.lock().expect("mock chain lock").next_tx
    }
}
