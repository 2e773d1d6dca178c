use crate::config::PeerConfig;
use crate::metrics::EngineTelemetry;
use crate::types::{DisputeRecord, EventRecord, ProposalRecord, ResolutionState, unix_now};
use anyhow::{Context, Result};
use reqwest::Client;
use serde::Serialize;
use std::time::Instant;

/// Normalized `EventCreated` record the indexer ships to the event-manager.
/// The peer dedups by `(eventId, transactionHash)`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainEventIngest {
    pub event_id: String,
    pub description: String,
    pub resolution_time: i64,
    pub block_number: u64,
    pub transaction_hash: String,
}

#[derive(Clone)]
pub struct PeerClients {
    pub event_manager: EventManagerClient,
    pub proposal: ProposalClient,
    pub dispute: DisputeClient,
    pub reward: RewardClient,
    pub notification: NotificationClient,
}

impl PeerClients {
    pub fn new(cfg: &PeerConfig, telemetry: EngineTelemetry) -> Self {
        let http = Client::builder()
            .timeout(cfg.timeout)
            .build()
            .expect("reqwest");
        Self {
            event_manager: EventManagerClient {
                base_url: trim_base(&cfg.event_manager_url),
                http: http.clone(),
                telemetry: telemetry.clone(),
            },
            proposal: ProposalClient {
                base_url: trim_base(&cfg.proposal_service_url),
                http: http.clone(),
                telemetry: telemetry.clone(),
            },
            dispute: DisputeClient {
                base_url: trim_base(&cfg.dispute_service_url),
                http: http.clone(),
                telemetry: telemetry.clone(),
            },
            reward: RewardClient {
                base_url: trim_base(&cfg.reward_service_url),
                http: http.clone(),
                telemetry: telemetry.clone(),
            },
            notification: NotificationClient {
                base_url: trim_base(&cfg.notification_service_url),
                http,
                telemetry,
            },
        }
    }
}

fn trim_base(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

#[derive(Clone)]
pub struct EventManagerClient {
    base_url: String,
    http: Client,
    telemetry: EngineTelemetry,
}

impl EventManagerClient {
    pub async fn get_event(&self, event_id: &str) -> Result<EventRecord> {
        let url = format!("{}/events/{event_id}", self.base_url);
        let started = Instant::now();
        let resp = self.http.get(&url).send().await;
        let ok = resp
            .as_ref()
            .map(|r| r.status().is_success())
            .unwrap_or(false);
        self.telemetry
            .peer_http("get_event", ok, ms_since(started));
        let resp = resp.context("GET /events/{id}")?;
        if !resp.status().is_success() {
            anyhow::bail!("event-manager GET /events/{event_id} failed: {}", resp.status());
        }
        resp.json().await.context("decode event")
    }

    /// Conditional state write: the peer applies `status := new WHERE status
    /// = expected`, serializing concurrent drivers. A mismatch comes back as
    /// a conflict status and surfaces here.
    pub async fn update_status(
        &self,
        event_id: &str,
        status: ResolutionState,
        expected: ResolutionState,
    ) -> Result<()> {
        let url = format!("{}/events/{event_id}", self.base_url);
        let body = serde_json::json!({
            "status": status,
            "expectedStatus": expected,
            "updatedAt": unix_now(),
        });
        let started = Instant::now();
        let resp = self.http.patch(&url).json(&body).send().await;
        let ok = resp
            .as_ref()
            .map(|r| r.status().is_success())
            .unwrap_or(false);
        self.telemetry
            .peer_http("patch_event", ok, ms_since(started));
        let resp = resp.context("PATCH /events/{id}")?;
        if !resp.status().is_success() {
            anyhow::bail!(
                "event-manager PATCH /events/{event_id} ({} -> {}) failed: {}",
                expected,
                status,
                resp.status()
            );
        }
        Ok(())
    }

    pub async fn ingest_chain_event(&self, record: &ChainEventIngest) -> Result<()> {
        let url = format!("{}/events/blockchain", self.base_url);
        let started = Instant::now();
        let resp = self.http.post(&url).json(record).send().await;
        let ok = resp
            .as_ref()
            .map(|r| r.status().is_success())
            .unwrap_or(false);
        self.telemetry
            .peer_http("ingest_chain_event", ok, ms_since(started));
        let resp = resp.context("POST /events/blockchain")?;
        if !resp.status().is_success() {
            anyhow::bail!("event-manager POST /events/blockchain failed: {}", resp.status());
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct ProposalClient {
    base_url: String,
    http: Client,
    telemetry: EngineTelemetry,
}

impl ProposalClient {
    pub async fn get_proposal(&self, proposal_id: &str) -> Result<ProposalRecord> {
        let url = format!("{}/proposals/{proposal_id}", self.base_url);
        let started = Instant::now();
        let resp = self.http.get(&url).send().await;
        let ok = resp
            .as_ref()
            .map(|r| r.status().is_success())
            .unwrap_or(false);
        self.telemetry
            .peer_http("get_proposal", ok, ms_since(started));
        let resp = resp.context("GET /proposals/{id}")?;
        if !resp.status().is_success() {
            anyhow::bail!(
                "proposal service GET /proposals/{proposal_id} failed: {}",
                resp.status()
            );
        }
        resp.json().await.context("decode proposal")
    }
}

#[derive(Clone)]
pub struct DisputeClient {
    base_url: String,
    http: Client,
    telemetry: EngineTelemetry,
}

impl DisputeClient {
    pub async fn disputes_for(&self, proposal_id: &str) -> Result<Vec<DisputeRecord>> {
        let url = format!("{}/disputes?proposalId={proposal_id}", self.base_url);
        let started = Instant::now();
        let resp = self.http.get(&url).send().await;
        let ok = resp
            .as_ref()
            .map(|r| r.status().is_success())
            .unwrap_or(false);
        self.telemetry
            .peer_http("get_disputes", ok, ms_since(started));
        let resp = resp.context("GET /disputes")?;
        if !resp.status().is_success() {
            anyhow::bail!("dispute service GET /disputes failed: {}", resp.status());
        }
        resp.json().await.context("decode disputes")
    }

    pub async fn open_disputes(&self, proposal_id: &str) -> Result<u64> {
        let disputes = self.disputes_for(proposal_id).await?;
        Ok(disputes.iter().filter(|d| !d.resolved).count() as u64)
    }
}

#[derive(Clone)]
pub struct RewardClient {
    base_url: String,
    http: Client,
    telemetry: EngineTelemetry,
}

impl RewardClient {
    pub async fn distribute(&self, event_id: &str) -> Result<()> {
        let url = format!("{}/distribute", self.base_url);
        let body = serde_json::json!({ "eventId": event_id });
        let started = Instant::now();
        let resp = self.http.post(&url).json(&body).send().await;
        let ok = resp
            .as_ref()
            .map(|r| r.status().is_success())
            .unwrap_or(false);
        self.telemetry
            .peer_http("distribute_rewards", ok, ms_since(started));
        let resp = resp.context("POST /distribute")?;
        if !resp.status().is_success() {
            anyhow::bail!("reward service POST /distribute failed: {}", resp.status());
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct NotificationClient {
    base_url: String,
    http: Client,
    telemetry: EngineTelemetry,
}

impl NotificationClient {
    pub async fn notify_arbitrators(
        &self,
        proposal_id: &str,
        dispute_data: &serde_json::Value,
    ) -> Result<()> {
        let url = format!("{}/notify-arbitrators", self.base_url);
        let body = serde_json::json!({
            "proposalId": proposal_id,
            "disputeData": dispute_data,
        });
        let started = Instant::now();
        let resp = self.http.post(&url).json(&body).send().await;
        let ok = resp
            .as_ref()
            .map(|r| r.status().is_success())
            .unwrap_or(false);
        self.telemetry
            .peer_http("notify_arbitrators", ok, ms_since(started));
        let resp = resp.context("POST /notify-arbitrators")?;
        if !resp.status().is_success() {
            anyhow::bail!(
                "notification service POST /notify-arbitrators failed: {}",
                resp.status()
            );
        }
        Ok(())
    }
}

fn ms_since(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
