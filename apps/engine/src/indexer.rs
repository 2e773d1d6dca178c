use crate::chain::{ChainClient, IndexedEvent, IndexedLog};
use crate::config::IndexerConfig;
use crate::metrics::EngineTelemetry;
use crate::orchestrator::Orchestrator;
use crate::peers::{ChainEventIngest, EventManagerClient};
use crate::types::b256_hex;
use anyhow::Result;
use std::sync::Arc;
use std::time::Instant;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Polls the chain for contract logs and feeds them back into the engine:
/// `EventCreated` is shipped to the event-manager (which dedups by
/// `(eventId, transactionHash)`), proposal-stream logs re-drive the
/// orchestrator after a divergence between chain and engine state.
pub struct Indexer {
    chain: Arc<ChainClient>,
    orchestrator: Arc<Orchestrator>,
    event_manager: EventManagerClient,
    cfg: IndexerConfig,
    telemetry: EngineTelemetry,
}

impl Indexer {
    pub fn new(
        chain: Arc<ChainClient>,
        orchestrator: Arc<Orchestrator>,
        event_manager: EventManagerClient,
        cfg: IndexerConfig,
        telemetry: EngineTelemetry,
    ) -> Self {
        Self {
            chain,
            orchestrator,
            event_manager,
            cfg,
            telemetry,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let mut ticker = time::interval(self.cfg.poll_interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        let mut last_indexed: Option<u64> = None;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            if let Err(err) = self.tick(&mut last_indexed).await {
                self.telemetry.indexer_error("tick");
                warn!(err = %err, "indexer tick failed; range will be reprocessed");
            }
        }
    }

    async fn tick(&self, last_indexed: &mut Option<u64>) -> Result<()> {
        let head = self.chain.block_number().await?;

        let watermark = match *last_indexed {
            Some(v) => v,
            None => {
                let seed = seed_block(head, self.cfg.replay_blocks);
                info!(head, seed, "indexer cold start; bounded replay");
                *last_indexed = Some(seed);
                seed
            }
        };

        let Some((from, to)) = next_range(watermark, head) else {
            return Ok(());
        };

        let started = Instant::now();
        let logs = self.chain.logs_in_range(from, to).await?;
        let count = logs.len();
        for log in logs {
            self.process_log(log).await?;
        }

        // Advance only after the whole batch landed; a partial failure above
        // re-processes the range next tick and the peer dedups.
        *last_indexed = Some(to);
        self.telemetry.indexer_range(
            count as u64,
            u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        );
        if count > 0 {
            info!(from, to, logs = count, "indexer range processed");
        }
        Ok(())
    }

    async fn process_log(&self, log: IndexedLog) -> Result<()> {
        match log.event {
            IndexedEvent::EventCreated {
                event_id,
                description,
                resolution_time,
            } => {
                let record = ChainEventIngest {
                    event_id: b256_hex(event_id),
                    description,
                    resolution_time,
                    block_number: log.block_number,
                    transaction_hash: b256_hex(log.tx_hash),
                };
                self.event_manager.ingest_chain_event(&record).await
            }
            IndexedEvent::ProposalSubmitted {
                proposal_id,
                event_id,
                liveness_expiry,
            } => {
                self.orchestrator
                    .handle_chain_proposal_submitted(
                        &b256_hex(proposal_id),
                        &b256_hex(event_id),
                        liveness_expiry,
                    )
                    .await;
                Ok(())
            }
            IndexedEvent::ProposalFinalized { proposal_id } => {
                self.orchestrator
                    .handle_chain_proposal_finalized(&b256_hex(proposal_id))
                    .await;
                Ok(())
            }
        }
    }
}

fn seed_block(head: u64, replay_blocks: u64) -> u64 {
    head.saturating_sub(replay_blocks)
}

fn next_range(last_indexed: u64, head: u64) -> Option<(u64, u64)> {
    let from = last_indexed.saturating_add(1);
    (head >= from).then_some((from, head))
}

#[cfg(test)]
mod tests {
    use super::{next_range, seed_block};

    #[test]
    fn cold_start_seed_is_bounded_and_never_underflows() {
        assert_eq!(seed_block(1000, 100), 900);
        assert_eq!(seed_block(40, 100), 0);
    }

    #[test]
    fn ranges_advance_without_gaps_or_overlap() {
        assert_eq!(next_range(900, 1000), Some((901, 1000)));
        assert_eq!(next_range(1000, 1000), None);
        assert_eq!(next_range(1000, 1003), Some((1001, 1003)));
        assert_eq!(next_range(0, 0), None);
    }
}
