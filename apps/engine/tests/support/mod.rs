use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use engine::{
    cache::Cache,
    chain::ChainClient,
    config::{JobsConfig, PeerConfig},
    metrics::EngineTelemetry,
    orchestrator::Orchestrator,
    peers::PeerClients,
    scheduler::Scheduler,
    types::{DisputeRecord, EventRecord, ProposalRecord, ProposalStatus, ResolutionState},
};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// In-process stand-ins for the five peer services, sharing one listener.
#[derive(Default)]
pub struct StubPeers {
    events: Mutex<HashMap<String, EventRecord>>,
    proposals: Mutex<HashMap<String, ProposalRecord>>,
    disputes: Mutex<Vec<DisputeRecord>>,
    ingested: Mutex<Vec<serde_json::Value>>,
    ingest_keys: Mutex<HashSet<(String, String)>>,
    notifications: Mutex<Vec<serde_json::Value>>,
    rewards: Mutex<Vec<String>>,
    patches: Mutex<Vec<(String, String, String)>>,
    pub fail_rewards: AtomicBool,
    pub fail_notifications: AtomicBool,
}

impl StubPeers {
    pub fn insert_event(&self, event: EventRecord) {
        self.events
            .lock()
            .unwrap()
            .insert(event.event_id.clone(), event);
    }

    pub fn insert_proposal(&self, proposal: ProposalRecord) {
        self.proposals
            .lock()
            .unwrap()
            .insert(proposal.proposal_id.clone(), proposal);
    }

    pub fn set_event_status(&self, event_id: &str, status: ResolutionState) {
        if let Some(ev) = self.events.lock().unwrap().get_mut(event_id) {
            ev.status = status;
        }
    }

    pub fn add_open_dispute(&self, proposal_id: &str) {
        let mut disputes = self.disputes.lock().unwrap();
        let dispute_id = format!("d-{}", disputes.len() + 1);
        disputes.push(DisputeRecord {
            dispute_id,
            proposal_id: proposal_id.to_string(),
            resolved: false,
        });
    }

    pub fn event(&self, event_id: &str) -> Option<EventRecord> {
        self.events.lock().unwrap().get(event_id).cloned()
    }

    pub fn event_status(&self, event_id: &str) -> Option<ResolutionState> {
        self.event(event_id).map(|e| e.status)
    }

    pub fn ingested(&self) -> Vec<serde_json::Value> {
        self.ingested.lock().unwrap().clone()
    }

    pub fn notifications(&self) -> Vec<serde_json::Value> {
        self.notifications.lock().unwrap().clone()
    }

    pub fn rewards(&self) -> Vec<String> {
        self.rewards.lock().unwrap().clone()
    }

    pub fn patches(&self) -> Vec<(String, String, String)> {
        self.patches.lock().unwrap().clone()
    }
}

pub fn make_event(event_id: &str, status: ResolutionState) -> EventRecord {
    EventRecord {
        event_id: event_id.to_string(),
        description: format!("test event {event_id}"),
        resolution_time: 1_700_000_000,
        status,
        outcome_hash: None,
        outcome: None,
        confidence_score: None,
        proposer: None,
        dispute_count: 0,
        evidence_uri: None,
        reward_pool: Some("1000000000000000000".to_string()),
        settled: false,
    }
}

pub fn make_proposal(
    proposal_id: &str,
    event_id: &str,
    liveness_expiry: i64,
    status: ProposalStatus,
) -> ProposalRecord {
    ProposalRecord {
        proposal_id: proposal_id.to_string(),
        event_id: event_id.to_string(),
        outcome_hash: None,
        outcome: None,
        confidence_score: Some(90),
        evidence_uri: None,
        bond_amount: "1000000000000000000".to_string(),
        submitted_at: liveness_expiry - 7_200,
        liveness_expiry,
        finalized_at: None,
        status,
        challenge_count: 0,
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PatchBody {
    status: ResolutionState,
    expected_status: ResolutionState,
    #[serde(default)]
    #[allow(dead_code)]
    updated_at: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DisputeQuery {
    proposal_id: Option<String>,
}

async fn get_event(
    State(stub): State<Arc<StubPeers>>,
    Path(id): Path<String>,
) -> Result<Json<EventRecord>, StatusCode> {
    stub.event(&id).map(Json).ok_or(StatusCode::NOT_FOUND)
}

async fn patch_event(
    State(stub): State<Arc<StubPeers>>,
    Path(id): Path<String>,
    Json(body): Json<PatchBody>,
) -> StatusCode {
    let mut events = stub.events.lock().unwrap();
    match events.get_mut(&id) {
        Some(ev) if ev.status == body.expected_status => {
            ev.status = body.status;
            if body.status == ResolutionState::Settled {
                ev.settled = true;
            }
            stub.patches.lock().unwrap().push((
                id.clone(),
                body.expected_status.as_str().to_string(),
                body.status.as_str().to_string(),
            ));
            StatusCode::OK
        }
        Some(_) => StatusCode::CONFLICT,
        None => StatusCode::NOT_FOUND,
    }
}

async fn ingest_event(
    State(stub): State<Arc<StubPeers>>,
    Json(body): Json<serde_json::Value>,
) -> StatusCode {
    let event_id = body
        .get("eventId")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let tx_hash = body
        .get("transactionHash")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    if stub
        .ingest_keys
        .lock()
        .unwrap()
        .insert((event_id, tx_hash))
    {
        stub.ingested.lock().unwrap().push(body);
    }
    StatusCode::OK
}

async fn get_proposal(
    State(stub): State<Arc<StubPeers>>,
    Path(id): Path<String>,
) -> Result<Json<ProposalRecord>, StatusCode> {
    stub.proposals
        .lock()
        .unwrap()
        .get(&id)
        .cloned()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn get_disputes(
    State(stub): State<Arc<StubPeers>>,
    Query(query): Query<DisputeQuery>,
) -> Json<Vec<DisputeRecord>> {
    let disputes = stub.disputes.lock().unwrap();
    let rows = disputes
        .iter()
        .filter(|d| match &query.proposal_id {
            Some(pid) => &d.proposal_id == pid,
            None => true,
        })
        .cloned()
        .collect();
    Json(rows)
}

async fn distribute(
    State(stub): State<Arc<StubPeers>>,
    Json(body): Json<serde_json::Value>,
) -> StatusCode {
    if stub.fail_rewards.load(Ordering::SeqCst) {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    if let Some(event_id) = body.get("eventId").and_then(|v| v.as_str()) {
        stub.rewards.lock().unwrap().push(event_id.to_string());
    }
    StatusCode::OK
}

async fn notify(
    State(stub): State<Arc<StubPeers>>,
    Json(body): Json<serde_json::Value>,
) -> StatusCode {
    if stub.fail_notifications.load(Ordering::SeqCst) {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    stub.notifications.lock().unwrap().push(body);
    StatusCode::OK
}

fn stub_router(stub: Arc<StubPeers>) -> Router {
    Router::new()
        .route("/events/{id}", get(get_event).patch(patch_event))
        .route("/events/blockchain", post(ingest_event))
        .route("/proposals/{id}", get(get_proposal))
        .route("/disputes", get(get_disputes))
        .route("/distribute", post(distribute))
        .route("/notify-arbitrators", post(notify))
        .with_state(stub)
}

pub struct Harness {
    pub stub: Arc<StubPeers>,
    pub cache: Arc<Cache>,
    pub chain: Arc<ChainClient>,
    pub scheduler: Arc<Scheduler>,
    pub orchestrator: Arc<Orchestrator>,
    pub peers: PeerClients,
    pub telemetry: EngineTelemetry,
    pub shutdown: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Full engine wiring against the mock chain and stub peers, with the
/// scheduler workers running. Liveness/settlement timing is compressed so
/// scenarios play out in wall-clock seconds.
pub async fn start_harness(liveness_window_secs: i64, settlement_delay_ms: u64) -> Harness {
    let stub = Arc::new(StubPeers::default());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub listener");
    let addr = listener.local_addr().expect("stub addr");
    {
        let router = stub_router(Arc::clone(&stub));
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve stubs");
        });
    }
    let base = format!("http://{addr}");

    let telemetry = EngineTelemetry::new();
    let cache = Arc::new(Cache::new());
    let chain = Arc::new(ChainClient::new_mock(liveness_window_secs, telemetry.clone()));
    let scheduler = Arc::new(Scheduler::new(
        Duration::from_millis(25),
        8,
        telemetry.clone(),
    ));
    let peers = PeerClients::new(
        &PeerConfig {
            event_manager_url: base.clone(),
            proposal_service_url: base.clone(),
            dispute_service_url: base.clone(),
            reward_service_url: base.clone(),
            notification_service_url: base,
            timeout: Duration::from_secs(5),
        },
        telemetry.clone(),
    );
    let jobs = JobsConfig {
        settlement_delay: Duration::from_millis(settlement_delay_ms),
        // Wide retry budget with short backoff: the strict expiry check can
        // bounce a few times around the second boundary.
        liveness_attempts: 10,
        liveness_backoff: Duration::from_millis(100),
        settlement_attempts: 5,
        settlement_backoff: Duration::from_millis(100),
        scheduler_tick: Duration::from_millis(25),
        queue_concurrency: 8,
    };
    let orchestrator = Orchestrator::new(
        Arc::clone(&cache),
        Arc::clone(&chain),
        Arc::clone(&scheduler),
        peers.clone(),
        jobs,
        Duration::from_secs(300),
        telemetry.clone(),
    );
    orchestrator.register_handlers().await;

    let shutdown = CancellationToken::new();
    tokio::spawn(Arc::clone(&scheduler).run(shutdown.clone()));

    Harness {
        stub,
        cache,
        chain,
        scheduler,
        orchestrator,
        peers,
        telemetry,
        shutdown,
    }
}

pub async fn wait_until<F>(timeout: Duration, what: &str, mut check: F)
where
    F: AsyncFnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {timeout:?}: {what}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
