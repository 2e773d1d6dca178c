use crate::cache::{self, Cache};
use crate::chain::ChainClient;
use crate::config::JobsConfig;
use crate::errors::{GuardFailed, PreconditionNotMet};
use crate::metrics::EngineTelemetry;
use crate::peers::PeerClients;
use crate::scheduler::{
    JOB_BATCH_SETTLEMENT, JOB_CHECK_LIVENESS, JOB_SETTLE_EVENT, JobHandler, JobOpts, JobState,
    LIVENESS_QUEUE, SETTLEMENT_QUEUE, Scheduler,
};
use crate::transitions;
use crate::types::{
    EventRecord, ProposalData, ProposalRecord, ProposalStatus, ResolutionState, TransitionContext,
    b256_hex, parse_b256, unix_now,
};
use anyhow::{Context, Result};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub successful: u32,
    pub failed: u32,
}

/// Drives events through the resolution lifecycle. Invoked concurrently by
/// HTTP handlers, queue workers and the indexer; per-event serialization is
/// delegated to the transition table plus the event-manager's conditional
/// write.
pub struct Orchestrator {
    cache: Arc<Cache>,
    chain: Arc<ChainClient>,
    scheduler: Arc<Scheduler>,
    peers: PeerClients,
    jobs: JobsConfig,
    event_ttl: Duration,
    // Cancellation token per proposal: checked in the finalize guard as
    // defence in depth against queue-removal lag.
    liveness_cancels: Mutex<HashMap<String, CancellationToken>>,
    telemetry: EngineTelemetry,
}

impl Orchestrator {
    pub fn new(
        cache: Arc<Cache>,
        chain: Arc<ChainClient>,
        scheduler: Arc<Scheduler>,
        peers: PeerClients,
        jobs: JobsConfig,
        event_ttl: Duration,
        telemetry: EngineTelemetry,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache,
            chain,
            scheduler,
            peers,
            jobs,
            event_ttl,
            liveness_cancels: Mutex::new(HashMap::new()),
            telemetry,
        })
    }

    /// Queue handlers, registered once at the composition root.
    pub async fn register_handlers(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let check_liveness: JobHandler = Arc::new(move |payload| {
            let this = Arc::clone(&this);
            Box::pin(async move {
                let proposal_id = payload
                    .get("proposalId")
                    .and_then(|v| v.as_str())
                    .context("check-liveness payload missing proposalId")?
                    .to_string();
                this.finalize_proposal(&proposal_id).await
            })
        });
        self.scheduler
            .register(LIVENESS_QUEUE, JOB_CHECK_LIVENESS, check_liveness)
            .await;

        let this = Arc::clone(self);
        let settle: JobHandler = Arc::new(move |payload| {
            let this = Arc::clone(&this);
            Box::pin(async move {
                let event_id = payload
                    .get("eventId")
                    .and_then(|v| v.as_str())
                    .context("settle-event payload missing eventId")?
                    .to_string();
                this.settle_event(&event_id).await
            })
        });
        self.scheduler
            .register(SETTLEMENT_QUEUE, JOB_SETTLE_EVENT, settle)
            .await;

        let this = Arc::clone(self);
        let settle_batch: JobHandler = Arc::new(move |payload| {
            let this = Arc::clone(&this);
            Box::pin(async move {
                let event_ids: Vec<String> = serde_json::from_value(
                    payload
                        .get("eventIds")
                        .cloned()
                        .context("batch-settlement payload missing eventIds")?,
                )
                .context("decode eventIds")?;
                let report = this.settle_batch(event_ids).await;
                tracing::info!(
                    successful = report.successful,
                    failed = report.failed,
                    "batch settlement finished"
                );
                Ok(())
            })
        });
        self.scheduler
            .register(SETTLEMENT_QUEUE, JOB_BATCH_SETTLEMENT, settle_batch)
            .await;
    }

    pub async fn fetch_event(&self, event_id: &str) -> Result<EventRecord> {
        let key = cache::event_key(event_id);
        if let Some(raw) = self.cache.get(&key).await
            && let Ok(event) = serde_json::from_str::<EventRecord>(&raw)
        {
            self.telemetry.cache_hit("event");
            return Ok(event);
        }
        self.telemetry.cache_miss("event");
        let event = self.peers.event_manager.get_event(event_id).await?;
        if let Ok(raw) = serde_json::to_string(&event) {
            self.cache.set(&key, raw, self.event_ttl).await;
        }
        Ok(event)
    }

    pub async fn fetch_proposal(&self, proposal_id: &str) -> Result<ProposalRecord> {
        // The cache key embeds the event id, so a cold lookup scans the
        // proposal's own prefix.
        let pattern = format!("proposal:{proposal_id}:*");
        if let Some(key) = self.cache.keys(&pattern).await.into_iter().next()
            && let Some(raw) = self.cache.get(&key).await
            && let Ok(proposal) = serde_json::from_str::<ProposalRecord>(&raw)
        {
            self.telemetry.cache_hit("proposal");
            return Ok(proposal);
        }
        self.telemetry.cache_miss("proposal");
        let proposal = self.peers.proposal.get_proposal(proposal_id).await?;
        if let Ok(raw) = serde_json::to_string(&proposal) {
            self.cache
                .set(
                    &cache::proposal_key(&proposal.proposal_id, &proposal.event_id),
                    raw,
                    self.event_ttl,
                )
                .await;
        }
        Ok(proposal)
    }

    /// Table check, edge guard, conditional write, cache invalidation.
    /// Actions with side effects run at the call sites around this.
    async fn apply_transition(&self, ctx: &TransitionContext, to: ResolutionState) -> Result<()> {
        let from = ctx.event().status;
        if let Err(err) = transitions::check(from, to) {
            self.telemetry.transition_rejected(from.as_str(), to.as_str());
            return Err(err);
        }
        if let Some(guard) = transitions::edge_guard(from, to)
            && !guard(ctx)
        {
            self.telemetry.transition_rejected(from.as_str(), to.as_str());
            return Err(GuardFailed(format!(
                "guard rejected {from} -> {to} for event {}",
                ctx.event().event_id
            ))
            .into());
        }

        let event_id = &ctx.event().event_id;
        if let Err(err) = self
            .peers
            .event_manager
            .update_status(event_id, to, from)
            .await
        {
            // A conflict means another driver won the conditional write; drop
            // our copy so the next read sees theirs.
            self.cache.delete(&cache::event_key(event_id)).await;
            return Err(err);
        }
        self.cache.delete(&cache::event_key(event_id)).await;
        self.telemetry.transition(from.as_str(), to.as_str());
        tracing::info!(event_id = %event_id, from = from.as_str(), to = to.as_str(), "state transition");
        Ok(())
    }

    /// Submit the candidate outcome on-chain, arm the liveness timer, move
    /// the event into LIVENESS. A failure between submission and the state
    /// write leaves chain and engine diverged; the indexer repairs that.
    pub async fn initiate_proposal(
        &self,
        event_id: &str,
        data: &ProposalData,
    ) -> Result<String> {
        let event = self.fetch_event(event_id).await?;

        let submitted = self.chain.submit_proposal(event_id, data).await?;
        let proposal_id = b256_hex(submitted.proposal_id);
        tracing::info!(
            event_id,
            proposal_id = %proposal_id,
            tx = %b256_hex(submitted.tx_hash),
            liveness_expiry = submitted.liveness_expiry,
            "proposal submitted"
        );

        self.arm_liveness(&proposal_id, event_id, submitted.liveness_expiry)
            .await;

        let ctx = TransitionContext::for_event(event, unix_now());
        self.apply_transition(&ctx, ResolutionState::Liveness).await?;
        Ok(proposal_id)
    }

    /// Schedules the liveness check for a proposal. Deduplicated: at most
    /// one live job per proposal id.
    pub async fn arm_liveness(&self, proposal_id: &str, event_id: &str, liveness_expiry: i64) {
        {
            let mut cancels = self.liveness_cancels.lock().await;
            let token = cancels
                .entry(proposal_id.to_string())
                .or_insert_with(CancellationToken::new);
            if token.is_cancelled() {
                *token = CancellationToken::new();
            }
        }
        self.scheduler
            .enqueue(
                LIVENESS_QUEUE,
                JOB_CHECK_LIVENESS,
                json!({
                    "proposalId": proposal_id,
                    "eventId": event_id,
                    "livenessExpiry": liveness_expiry,
                }),
                JobOpts {
                    delay: liveness_delay(unix_now(), liveness_expiry),
                    attempts: self.jobs.liveness_attempts,
                    backoff_base: self.jobs.liveness_backoff,
                    dedup_key: Some(format!("liveness:{proposal_id}")),
                },
            )
            .await;
    }

    /// Idempotent: cancels the proposal's token and removes any queued (not
    /// yet executing) liveness jobs. An already-running check cannot be
    /// removed, but it fails the finalize guard.
    pub async fn pause_liveness_monitoring(&self, proposal_id: &str) {
        {
            let cancels = self.liveness_cancels.lock().await;
            if let Some(token) = cancels.get(proposal_id) {
                token.cancel();
            }
        }
        let queued = self
            .scheduler
            .scan(LIVENESS_QUEUE, &[JobState::Delayed, JobState::Waiting])
            .await;
        for job in queued {
            if job.payload.get("proposalId").and_then(|v| v.as_str()) == Some(proposal_id) {
                self.scheduler.remove(job.job_id).await;
            }
        }
    }

    /// A dispute landed for a pending proposal. The timer teardown must
    /// complete before this returns, or a stale check could race the
    /// arbitration hand-off.
    pub async fn handle_dispute_detected(
        &self,
        proposal_id: &str,
        dispute_data: serde_json::Value,
    ) -> Result<()> {
        let proposal = self.fetch_proposal(proposal_id).await?;
        let event = self.fetch_event(&proposal.event_id).await?;

        let ctx = TransitionContext::for_proposal(proposal.clone(), event, unix_now(), 0);
        self.apply_transition(&ctx, ResolutionState::Disputed).await?;
        self.telemetry.dispute_detected();

        // Arbitration notification is a side channel; dispute handling
        // stays live even when it is down.
        if let Err(err) = self
            .peers
            .notification
            .notify_arbitrators(proposal_id, &dispute_data)
            .await
        {
            tracing::warn!(proposal_id, err = %err, "arbitrator notification failed; continuing");
        }

        self.pause_liveness_monitoring(proposal_id).await;
        self.cache
            .delete(&cache::proposal_key(proposal_id, &proposal.event_id))
            .await;
        tracing::info!(proposal_id, event_id = %proposal.event_id, "dispute handled");
        Ok(())
    }

    /// Liveness job body. Re-reads disputes and the cancellation token at
    /// execution time; the queue removal in `handle_dispute_detected`
    /// shrinks the race window, this gate closes it.
    pub async fn finalize_proposal(&self, proposal_id: &str) -> Result<()> {
        let proposal = self.fetch_proposal(proposal_id).await?;

        match proposal.status {
            ProposalStatus::Finalized => {
                // Already locked on-chain (crash recovery or indexer repair);
                // just re-drive the event state.
                return self.ensure_resolved(&proposal).await;
            }
            ProposalStatus::Disputed => {
                return Err(GuardFailed(format!(
                    "proposal {proposal_id} is disputed"
                ))
                .into());
            }
            ProposalStatus::Liveness => {}
        }

        let now = unix_now();
        if now <= proposal.liveness_expiry {
            return Err(PreconditionNotMet(format!(
                "liveness window open until {} (now {now})",
                proposal.liveness_expiry
            ))
            .into());
        }

        let cancelled = {
            let cancels = self.liveness_cancels.lock().await;
            cancels
                .get(proposal_id)
                .map(|t| t.is_cancelled())
                .unwrap_or(false)
        };
        if cancelled {
            return Err(GuardFailed(format!(
                "liveness monitoring cancelled for proposal {proposal_id}"
            ))
            .into());
        }

        let open_disputes = self.peers.dispute.open_disputes(proposal_id).await?;
        if open_disputes > 0 {
            return Err(GuardFailed(format!(
                "proposal {proposal_id} has {open_disputes} open dispute(s)"
            ))
            .into());
        }

        let tx = self
            .chain
            .finalize_proposal(parse_b256(proposal_id)?)
            .await?;
        self.telemetry.finalized();
        tracing::info!(proposal_id, tx = %b256_hex(tx), "proposal finalized");

        // The peer's mirror now carries finalizedAt; drop the stale copy.
        self.cache
            .delete(&cache::proposal_key(proposal_id, &proposal.event_id))
            .await;
        self.liveness_cancels.lock().await.remove(proposal_id);

        self.ensure_resolved(&proposal).await
    }

    /// Move the event to RESOLVED (if it is not already) and schedule its
    /// settlement. Idempotent via the settlement dedup key.
    async fn ensure_resolved(&self, proposal: &ProposalRecord) -> Result<()> {
        let event = self.fetch_event(&proposal.event_id).await?;
        match event.status {
            ResolutionState::Resolved => {}
            ResolutionState::Settled => return Ok(()),
            _ => {
                let ctx = TransitionContext::for_proposal(
                    proposal.clone(),
                    event,
                    unix_now(),
                    0,
                );
                self.apply_transition(&ctx, ResolutionState::Resolved).await?;
            }
        }
        self.schedule_settlement(&proposal.event_id).await;
        Ok(())
    }

    pub async fn schedule_settlement(&self, event_id: &str) {
        self.scheduler
            .enqueue(
                SETTLEMENT_QUEUE,
                JOB_SETTLE_EVENT,
                json!({ "eventId": event_id }),
                JobOpts {
                    delay: self.jobs.settlement_delay,
                    attempts: self.jobs.settlement_attempts,
                    backoff_base: self.jobs.settlement_backoff,
                    dedup_key: Some(format!("settle:{event_id}")),
                },
            )
            .await;
    }

    /// Settlement job body.
    pub async fn settle_event(&self, event_id: &str) -> Result<()> {
        let event = self.fetch_event(event_id).await?;
        match event.status {
            ResolutionState::Resolved => {}
            ResolutionState::Settled => {
                // Replayed job after a crash; just make sure the cache is clean.
                self.purge_event_cache(event_id).await;
                return Ok(());
            }
            other => {
                return Err(PreconditionNotMet(format!(
                    "event {event_id} not resolved (status={other})"
                ))
                .into());
            }
        }

        let tx = self.chain.settle_event(event_id).await?;
        self.telemetry.settled();
        tracing::info!(event_id, tx = %b256_hex(tx), "event settled on-chain");

        // Rewards are eventually reconcilable; never fail settlement on them.
        if let Err(err) = self.peers.reward.distribute(event_id).await {
            tracing::warn!(event_id, err = %err, "reward distribution failed; continuing");
        }

        let ctx = TransitionContext::for_event(event, unix_now());
        self.apply_transition(&ctx, ResolutionState::Settled).await?;
        self.purge_event_cache(event_id).await;
        Ok(())
    }

    async fn purge_event_cache(&self, event_id: &str) {
        self.cache.delete(&cache::event_key(event_id)).await;
        for key in self.cache.keys(&cache::proposal_pattern(event_id)).await {
            self.cache.delete(&key).await;
        }
    }

    /// Replay the authoritative state: used on crash recovery and external
    /// pokes. Safe to call repeatedly; every branch deduplicates.
    pub async fn process_event(&self, event_id: &str) -> Result<ResolutionState> {
        let event = self.fetch_event(event_id).await?;
        match event.status {
            ResolutionState::Liveness => {
                let queued = self
                    .scheduler
                    .scan(
                        LIVENESS_QUEUE,
                        &[JobState::Delayed, JobState::Waiting, JobState::Active],
                    )
                    .await;
                let armed = queued
                    .iter()
                    .any(|j| j.payload.get("eventId").and_then(|v| v.as_str()) == Some(event_id));
                if !armed {
                    let keys = self.cache.keys(&cache::proposal_pattern(event_id)).await;
                    match keys.first().and_then(|k| proposal_id_from_key(k)) {
                        Some(pid) => {
                            let proposal = self.fetch_proposal(pid).await?;
                            self.arm_liveness(
                                &proposal.proposal_id,
                                event_id,
                                proposal.liveness_expiry,
                            )
                            .await;
                        }
                        None => tracing::warn!(
                            event_id,
                            "liveness event has no discoverable proposal; awaiting indexer repair"
                        ),
                    }
                }
            }
            ResolutionState::Disputed => {
                // Make sure no stale timers survived a crash.
                let queued = self
                    .scheduler
                    .scan(LIVENESS_QUEUE, &[JobState::Delayed, JobState::Waiting])
                    .await;
                for job in queued {
                    if job.payload.get("eventId").and_then(|v| v.as_str()) == Some(event_id)
                        && let Some(pid) = job.payload.get("proposalId").and_then(|v| v.as_str())
                    {
                        self.pause_liveness_monitoring(pid).await;
                    }
                }
            }
            ResolutionState::Resolved => {
                self.schedule_settlement(event_id).await;
            }
            ResolutionState::Settled => {
                self.purge_event_cache(event_id).await;
            }
            _ => {}
        }
        Ok(event.status)
    }

    /// Indexer repair: a proposal observed on-chain. Re-arms monitoring and
    /// pulls a PROPOSING event into LIVENESS when the state write was lost
    /// between submission and PATCH. Log-only on failure so a sick peer
    /// cannot wedge the indexer's watermark.
    pub async fn handle_chain_proposal_submitted(
        &self,
        proposal_id: &str,
        event_id_hint: &str,
        liveness_expiry: i64,
    ) {
        match self.fetch_proposal(proposal_id).await {
            Ok(proposal) => {
                self.arm_liveness(&proposal.proposal_id, &proposal.event_id, proposal.liveness_expiry)
                    .await;
                match self.fetch_event(&proposal.event_id).await {
                    Ok(event) if event.status == ResolutionState::Proposing => {
                        let ctx = TransitionContext::for_event(event, unix_now());
                        if let Err(err) = self.apply_transition(&ctx, ResolutionState::Liveness).await
                        {
                            tracing::warn!(
                                proposal_id,
                                event_id = %proposal.event_id,
                                err = %err,
                                "repair transition to liveness failed"
                            );
                        }
                    }
                    Ok(_) => {}
                    Err(err) => tracing::warn!(
                        proposal_id,
                        err = %err,
                        "repair could not fetch event; will retry on next observation"
                    ),
                }
            }
            Err(err) => {
                // The mirror has not caught up; arm with what the log gave us
                // so the liveness check still fires.
                tracing::warn!(
                    proposal_id,
                    err = %err,
                    "proposal mirror unavailable; arming from chain log"
                );
                self.arm_liveness(proposal_id, event_id_hint, liveness_expiry)
                    .await;
            }
        }
    }

    /// Indexer repair: a finalization observed on-chain that the engine may
    /// have missed. Idempotent via `ensure_resolved`.
    pub async fn handle_chain_proposal_finalized(&self, proposal_id: &str) {
        match self.fetch_proposal(proposal_id).await {
            Ok(proposal) => {
                if let Err(err) = self.ensure_resolved(&proposal).await {
                    tracing::warn!(
                        proposal_id,
                        err = %err,
                        "repair after chain finalization failed"
                    );
                }
            }
            Err(err) => tracing::warn!(
                proposal_id,
                err = %err,
                "proposal mirror unavailable for finalization repair"
            ),
        }
    }

    /// Settles a batch concurrently; partial failure is reported, never
    /// propagated.
    pub async fn settle_batch(self: &Arc<Self>, event_ids: Vec<String>) -> BatchReport {
        let mut set = JoinSet::new();
        for event_id in event_ids {
            let this = Arc::clone(self);
            set.spawn(async move {
                let res = this.settle_event(&event_id).await;
                if let Err(err) = &res {
                    tracing::warn!(event_id = %event_id, err = %err, "batch settlement entry failed");
                }
                res.is_ok()
            });
        }

        let mut report = BatchReport {
            successful: 0,
            failed: 0,
        };
        while let Some(res) = set.join_next().await {
            match res {
                Ok(true) => report.successful += 1,
                Ok(false) => report.failed += 1,
                Err(_) => report.failed += 1,
            }
        }
        report
    }
}

fn liveness_delay(now: i64, liveness_expiry: i64) -> Duration {
    Duration::from_secs(u64::try_from(liveness_expiry - now).unwrap_or(0))
}

fn proposal_id_from_key(key: &str) -> Option<&str> {
    key.split(':').nth(1).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::{liveness_delay, proposal_id_from_key};
    use std::time::Duration;

    #[test]
    fn liveness_delay_clamps_expired_windows_to_zero() {
        assert_eq!(liveness_delay(100, 90), Duration::ZERO);
        assert_eq!(liveness_delay(100, 100), Duration::ZERO);
        assert_eq!(liveness_delay(100, 7_300), Duration::from_secs(7_200));
    }

    #[test]
    fn proposal_id_is_extracted_from_cache_keys() {
        assert_eq!(
            proposal_id_from_key("proposal:0xabc:evt-1"),
            Some("0xabc")
        );
        assert_eq!(proposal_id_from_key("proposal::evt-1"), None);
        assert_eq!(proposal_id_from_key("event"), None);
    }
}
