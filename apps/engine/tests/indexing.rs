mod support;

use engine::chain::{IndexedEvent, IndexedLog, event_id_bytes};
use engine::config::IndexerConfig;
use engine::indexer::Indexer;
use engine::scheduler::{JobState, LIVENESS_QUEUE};
use engine::types::{ProposalStatus, ResolutionState, b256_hex, unix_now};
use std::sync::Arc;
use std::time::Duration;
use support::{Harness, make_event, make_proposal, start_harness, wait_until};

fn created_log(block_number: u64, event: &str, tx: &str) -> IndexedLog {
    IndexedLog {
        block_number,
        log_index: 0,
        tx_hash: event_id_bytes(tx),
        event: IndexedEvent::EventCreated {
            event_id: event_id_bytes(event),
            description: format!("chain event {event}"),
            resolution_time: 1_700_000_000,
        },
    }
}

fn spawn_indexer(h: &Harness, poll_ms: u64) {
    let indexer = Indexer::new(
        Arc::clone(&h.chain),
        Arc::clone(&h.orchestrator),
        h.peers.event_manager.clone(),
        IndexerConfig {
            poll_interval: Duration::from_millis(poll_ms),
            replay_blocks: 100,
        },
        h.telemetry.clone(),
    );
    let shutdown = h.shutdown.clone();
    tokio::spawn(indexer.run(shutdown));
}

#[tokio::test]
async fn cold_start_replays_a_bounded_window_and_follows_the_head() {
    let h = start_harness(60, 100).await;
    let mock = h.chain.mock().unwrap();

    mock.set_head(1000);
    mock.push_log(created_log(950, "chain-evt-a", "tx-a"));
    mock.push_log(created_log(999, "chain-evt-b", "tx-b"));
    // Older than the replay window: never picked up.
    mock.push_log(created_log(800, "chain-evt-old", "tx-old"));

    spawn_indexer(&h, 50);

    wait_until(Duration::from_secs(5), "bounded replay ingested", async || {
        h.stub.ingested().len() == 2
    })
    .await;

    // The head advances; only the new range is processed.
    mock.push_log(created_log(1002, "chain-evt-c", "tx-c"));
    mock.set_head(1003);
    wait_until(Duration::from_secs(5), "tail range ingested", async || {
        h.stub.ingested().len() == 3
    })
    .await;

    // A second engine instance re-reads the same window; the peer's
    // (eventId, transactionHash) dedup keeps the set stable.
    spawn_indexer(&h, 50);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(h.stub.ingested().len(), 3);

    let ids: Vec<String> = h
        .stub
        .ingested()
        .iter()
        .map(|v| v["eventId"].as_str().unwrap().to_string())
        .collect();
    assert!(ids.contains(&b256_hex(event_id_bytes("chain-evt-a"))));
    assert!(!ids.contains(&b256_hex(event_id_bytes("chain-evt-old"))));
}

#[tokio::test]
async fn proposal_submitted_log_repairs_a_lost_state_write() {
    let h = start_harness(60, 100).await;
    let mock = h.chain.mock().unwrap();

    // The engine crashed between submitProposal and the LIVENESS write: the
    // event is still PROPOSING, the proposal exists on-chain and in the
    // proposal service mirror.
    h.stub
        .insert_event(make_event("evt-9", ResolutionState::Proposing));
    let pid_bytes = event_id_bytes("proposal-nine");
    let pid = b256_hex(pid_bytes);
    let expiry = unix_now() + 60;
    h.stub
        .insert_proposal(make_proposal(&pid, "evt-9", expiry, ProposalStatus::Liveness));

    mock.set_head(500);
    mock.push_log(IndexedLog {
        block_number: 450,
        log_index: 0,
        tx_hash: event_id_bytes("tx-repair"),
        event: IndexedEvent::ProposalSubmitted {
            proposal_id: pid_bytes,
            event_id: event_id_bytes("evt-9"),
            liveness_expiry: expiry,
        },
    });

    spawn_indexer(&h, 50);

    wait_until(Duration::from_secs(5), "event pulled into liveness", async || {
        h.stub.event_status("evt-9") == Some(ResolutionState::Liveness)
    })
    .await;

    let jobs = h
        .scheduler
        .scan(LIVENESS_QUEUE, &[JobState::Delayed, JobState::Waiting])
        .await;
    assert_eq!(jobs.len(), 1, "repair arms exactly one timer");
    assert_eq!(
        jobs[0].payload.get("proposalId").and_then(|v| v.as_str()),
        Some(pid.as_str())
    );

    // Re-observing the same log (fresh instance, same window) does not
    // double-arm the timer.
    spawn_indexer(&h, 50);
    tokio::time::sleep(Duration::from_millis(400)).await;
    let jobs = h
        .scheduler
        .scan(LIVENESS_QUEUE, &[JobState::Delayed, JobState::Waiting])
        .await;
    assert_eq!(jobs.len(), 1);
}

#[tokio::test]
async fn proposal_finalized_log_drives_the_event_to_settlement() {
    let h = start_harness(60, 100).await;
    let mock = h.chain.mock().unwrap();

    // Finalization landed on-chain but the engine missed it.
    h.stub
        .insert_event(make_event("evt-10", ResolutionState::Liveness));
    let pid_bytes = event_id_bytes("proposal-ten");
    let pid = b256_hex(pid_bytes);
    let mut proposal = make_proposal(&pid, "evt-10", unix_now() - 100, ProposalStatus::Finalized);
    proposal.finalized_at = Some(unix_now() - 50);
    h.stub.insert_proposal(proposal);

    mock.set_head(700);
    mock.push_log(IndexedLog {
        block_number: 650,
        log_index: 0,
        tx_hash: event_id_bytes("tx-finalized"),
        event: IndexedEvent::ProposalFinalized {
            proposal_id: pid_bytes,
        },
    });

    spawn_indexer(&h, 50);

    wait_until(Duration::from_secs(10), "event settled via repair", async || {
        h.stub.event_status("evt-10") == Some(ResolutionState::Settled)
    })
    .await;
    assert!(mock.is_settled("evt-10"));
}
