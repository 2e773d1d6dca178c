use anyhow::{Context, Result};
use engine::{
    cache::Cache, chain::ChainClient, config, indexer::Indexer, metrics::EngineTelemetry,
    orchestrator::Orchestrator, peers::PeerClients, scheduler::Scheduler,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cfg = config::load_config()?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("resolution engine starting");
    tracing::info!(
        node_env = %cfg.node_env,
        chain_mode = ?cfg.chain.mode,
        event_manager = %cfg.peers.event_manager_url,
        redis = %format!("{}:{}", cfg.cache.redis_host, cfg.cache.redis_port),
        postgres = %format!("{}:{}/{}", cfg.database.host, cfg.database.port, cfg.database.name),
        "config loaded"
    );

    let telemetry = EngineTelemetry::new();
    let cache = Arc::new(Cache::new());
    let chain = Arc::new(ChainClient::connect(&cfg.chain, telemetry.clone()).await?);
    let scheduler = Arc::new(Scheduler::new(
        cfg.jobs.scheduler_tick,
        cfg.jobs.queue_concurrency,
        telemetry.clone(),
    ));
    let peers = PeerClients::new(&cfg.peers, telemetry.clone());
    let orchestrator = Orchestrator::new(
        cache,
        Arc::clone(&chain),
        Arc::clone(&scheduler),
        peers.clone(),
        cfg.jobs.clone(),
        cfg.cache.event_ttl,
        telemetry.clone(),
    );
    orchestrator.register_handlers().await;

    let shutdown = CancellationToken::new();
    let mut join_set: tokio::task::JoinSet<Result<()>> = tokio::task::JoinSet::new();
    {
        let scheduler = Arc::clone(&scheduler);
        let shutdown = shutdown.clone();
        join_set.spawn(async move { scheduler.run(shutdown).await });
    }
    {
        let indexer = Indexer::new(
            Arc::clone(&chain),
            Arc::clone(&orchestrator),
            peers.event_manager.clone(),
            cfg.indexer.clone(),
            telemetry.clone(),
        );
        let shutdown = shutdown.clone();
        join_set.spawn(async move { indexer.run(shutdown).await });
    }

    tracing::info!("resolution engine started");

    let mut fatal: Option<anyhow::Error> = None;
    tokio::select! {
        res = shutdown_signal() => {
            res?;
            tracing::info!("shutdown requested");
        },
        res = join_set.join_next() => {
            if let Some(res) = res {
                let res = res.context("engine task panicked")?;
                match res {
                    Ok(()) => fatal = Some(anyhow::anyhow!("engine task exited unexpectedly")),
                    Err(e) => fatal = Some(e.context("engine task failed")),
                }
            }
        }
    }

    shutdown.cancel();

    while let Some(res) = join_set.join_next().await {
        let res = res.context("engine task panicked")?;
        if let Err(e) = res {
            fatal.get_or_insert_with(|| e.context("engine task failed"));
        }
    }

    fatal.map_or(Ok(()), Err)
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("ctrl-c")?;
        Ok(())
    }
}
