use alloy::primitives::{B256, U256};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionState {
    Created,
    Detecting,
    EvidenceGathering,
    Proposing,
    Liveness,
    Monitoring,
    Disputed,
    Arbitration,
    Resolved,
    Settled,
}

impl ResolutionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Detecting => "detecting",
            Self::EvidenceGathering => "evidence_gathering",
            Self::Proposing => "proposing",
            Self::Liveness => "liveness",
            Self::Monitoring => "monitoring",
            Self::Disputed => "disputed",
            Self::Arbitration => "arbitration",
            Self::Resolved => "resolved",
            Self::Settled => "settled",
        }
    }

    pub fn parse(v: &str) -> Result<Self> {
        match v {
            "created" => Ok(Self::Created),
            "detecting" => Ok(Self::Detecting),
            "evidence_gathering" => Ok(Self::EvidenceGathering),
            "proposing" => Ok(Self::Proposing),
            "liveness" => Ok(Self::Liveness),
            "monitoring" => Ok(Self::Monitoring),
            "disputed" => Ok(Self::Disputed),
            "arbitration" => Ok(Self::Arbitration),
            "resolved" => Ok(Self::Resolved),
            "settled" => Ok(Self::Settled),
            other => anyhow::bail!("unknown resolution state: {other}"),
        }
    }
}

impl std::fmt::Display for ResolutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Liveness,
    Disputed,
    Finalized,
}

impl ProposalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Liveness => "liveness",
            Self::Disputed => "disputed",
            Self::Finalized => "finalized",
        }
    }
}

/// Event record as served by the event-manager peer. The peer owns the
/// canonical copy; the engine only caches a read-through snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub event_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub resolution_time: i64,
    pub status: ResolutionState,
    #[serde(default)]
    pub outcome_hash: Option<String>,
    #[serde(default)]
    pub outcome: Option<String>,
    #[serde(default)]
    pub confidence_score: Option<u64>,
    #[serde(default)]
    pub proposer: Option<String>,
    #[serde(default)]
    pub dispute_count: u64,
    #[serde(default, rename = "evidenceURI")]
    pub evidence_uri: Option<String>,
    #[serde(default)]
    pub reward_pool: Option<String>,
    #[serde(default)]
    pub settled: bool,
}

/// Proposal record mirrored by the proposal peer from the proposal-manager
/// contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalRecord {
    pub proposal_id: String,
    pub event_id: String,
    #[serde(default)]
    pub outcome_hash: Option<String>,
    #[serde(default)]
    pub outcome: Option<String>,
    #[serde(default)]
    pub confidence_score: Option<u64>,
    #[serde(default, rename = "evidenceURI")]
    pub evidence_uri: Option<String>,
    pub bond_amount: String,
    pub submitted_at: i64,
    pub liveness_expiry: i64,
    #[serde(default)]
    pub finalized_at: Option<i64>,
    pub status: ProposalStatus,
    #[serde(default)]
    pub challenge_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisputeRecord {
    pub dispute_id: String,
    pub proposal_id: String,
    #[serde(default)]
    pub resolved: bool,
}

/// Candidate outcome handed in by the detection subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalData {
    pub outcome: serde_json::Value,
    #[serde(default)]
    pub confidence_score: u64,
    #[serde(default, rename = "evidenceURI")]
    pub evidence_uri: Option<String>,
    pub bond_amount: String,
}

/// The data a transition guard sees. Fetched before the transition is
/// requested so guards stay pure.
#[derive(Debug, Clone)]
pub enum Subject {
    Event(EventRecord),
    Proposal {
        proposal: ProposalRecord,
        event: EventRecord,
    },
}

#[derive(Debug, Clone)]
pub struct TransitionContext {
    pub subject: Subject,
    pub now: i64,
    pub open_disputes: u64,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl TransitionContext {
    pub fn for_event(event: EventRecord, now: i64) -> Self {
        Self {
            subject: Subject::Event(event),
            now,
            open_disputes: 0,
            metadata: HashMap::new(),
        }
    }

    pub fn for_proposal(
        proposal: ProposalRecord,
        event: EventRecord,
        now: i64,
        open_disputes: u64,
    ) -> Self {
        Self {
            subject: Subject::Proposal { proposal, event },
            now,
            open_disputes,
            metadata: HashMap::new(),
        }
    }

    pub fn event(&self) -> &EventRecord {
        match &self.subject {
            Subject::Event(event) => event,
            Subject::Proposal { event, .. } => event,
        }
    }

    pub fn proposal(&self) -> Option<&ProposalRecord> {
        match &self.subject {
            Subject::Event(_) => None,
            Subject::Proposal { proposal, .. } => Some(proposal),
        }
    }
}

pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

pub fn parse_b256(s: &str) -> Result<B256> {
    let trimmed = s.trim();
    let s = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    let bytes = hex::decode(s).context("decode hex b256")?;
    if bytes.len() != 32 {
        anyhow::bail!("expected 32-byte hex, got {}", bytes.len());
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(B256::from(out))
}

pub fn b256_hex(v: B256) -> String {
    format!("0x{}", hex::encode(v.as_slice()))
}

pub fn parse_u256_dec(s: &str) -> Result<U256> {
    let s = s.trim();
    U256::from_str_radix(s, 10).context("parse u256 decimal")
}
