use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram},
};
use std::sync::Arc;

#[derive(Clone)]
pub struct EngineTelemetry {
    inner: Arc<Inner>,
}

struct Inner {
    transitions_total: Counter<u64>,
    transition_rejections_total: Counter<u64>,
    jobs_total: Counter<u64>,
    job_retries_total: Counter<u64>,
    job_failures_total: Counter<u64>,
    chain_txs_total: Counter<u64>,
    chain_tx_errors_total: Counter<u64>,
    peer_http_errors_total: Counter<u64>,
    disputes_total: Counter<u64>,
    finalizations_total: Counter<u64>,
    settlements_total: Counter<u64>,
    indexer_logs_total: Counter<u64>,
    indexer_errors_total: Counter<u64>,
    cache_hits_total: Counter<u64>,
    cache_misses_total: Counter<u64>,

    job_ms: Histogram<u64>,
    chain_rpc_ms: Histogram<u64>,
    peer_http_ms: Histogram<u64>,
    indexer_range_ms: Histogram<u64>,
}

impl EngineTelemetry {
    pub fn new() -> Self {
        let meter = global::meter("resolution-engine");

        let transitions_total = meter
            .u64_counter("engine.transitions_total")
            .with_description("Total accepted state transitions")
            .build();
        let transition_rejections_total = meter
            .u64_counter("engine.transition_rejections_total")
            .with_description("Total transitions rejected by the table or a guard")
            .build();
        let jobs_total = meter
            .u64_counter("engine.jobs_total")
            .with_description("Total job executions")
            .build();
        let job_retries_total = meter
            .u64_counter("engine.job_retries_total")
            .with_description("Total job attempts rescheduled with backoff")
            .build();
        let job_failures_total = meter
            .u64_counter("engine.job_failures_total")
            .with_description("Total jobs marked failed after exhausting retries")
            .build();
        let chain_txs_total = meter
            .u64_counter("engine.chain_txs_total")
            .with_description("Total chain transactions submitted")
            .build();
        let chain_tx_errors_total = meter
            .u64_counter("engine.chain_tx_errors_total")
            .with_description("Total chain transaction errors")
            .build();
        let peer_http_errors_total = meter
            .u64_counter("engine.peer_http_errors_total")
            .with_description("Total peer HTTP request errors")
            .build();
        let disputes_total = meter
            .u64_counter("engine.disputes_total")
            .with_description("Total disputes handled")
            .build();
        let finalizations_total = meter
            .u64_counter("engine.finalizations_total")
            .with_description("Total proposals finalized on-chain")
            .build();
        let settlements_total = meter
            .u64_counter("engine.settlements_total")
            .with_description("Total events settled on-chain")
            .build();
        let indexer_logs_total = meter
            .u64_counter("engine.indexer_logs_total")
            .with_description("Total contract logs ingested by the indexer")
            .build();
        let indexer_errors_total = meter
            .u64_counter("engine.indexer_errors_total")
            .with_description("Total indexer tick errors")
            .build();
        let cache_hits_total = meter
            .u64_counter("engine.cache_hits_total")
            .with_description("Total read-through cache hits")
            .build();
        let cache_misses_total = meter
            .u64_counter("engine.cache_misses_total")
            .with_description("Total read-through cache misses")
            .build();

        let job_ms = meter
            .u64_histogram("engine.job_ms")
            .with_description("Job execution latency in milliseconds")
            .build();
        let chain_rpc_ms = meter
            .u64_histogram("engine.chain_rpc_ms")
            .with_description("Chain operation latency in milliseconds")
            .build();
        let peer_http_ms = meter
            .u64_histogram("engine.peer_http_ms")
            .with_description("Peer HTTP latency in milliseconds")
            .build();
        let indexer_range_ms = meter
            .u64_histogram("engine.indexer_range_ms")
            .with_description("Indexer block-range processing latency in milliseconds")
            .build();

        Self {
            inner: Arc::new(Inner {
                transitions_total,
                transition_rejections_total,
                jobs_total,
                job_retries_total,
                job_failures_total,
                chain_txs_total,
                chain_tx_errors_total,
                peer_http_errors_total,
                disputes_total,
                finalizations_total,
                settlements_total,
                indexer_logs_total,
                indexer_errors_total,
                cache_hits_total,
                cache_misses_total,
                job_ms,
                chain_rpc_ms,
                peer_http_ms,
                indexer_range_ms,
            }),
        }
    }

    pub fn transition(&self, from: &'static str, to: &'static str) {
        self.inner.transitions_total.add(
            1,
            &[KeyValue::new("from", from), KeyValue::new("to", to)],
        );
    }

    pub fn transition_rejected(&self, from: &'static str, to: &'static str) {
        self.inner.transition_rejections_total.add(
            1,
            &[KeyValue::new("from", from), KeyValue::new("to", to)],
        );
    }

    pub fn job_ok(&self, queue: &str, ms: u64) {
        let attrs = [KeyValue::new("queue", queue.to_string())];
        self.inner.jobs_total.add(1, &attrs);
        self.inner.job_ms.record(ms, &attrs);
    }

    pub fn job_retry(&self, queue: &str) {
        self.inner
            .job_retries_total
            .add(1, &[KeyValue::new("queue", queue.to_string())]);
    }

    pub fn job_failed(&self, queue: &str) {
        self.inner
            .job_failures_total
            .add(1, &[KeyValue::new("queue", queue.to_string())]);
    }

    pub fn chain_rpc(&self, op: &'static str, ok: bool, ms: u64) {
        let attrs = [KeyValue::new("op", op)];
        self.inner.chain_txs_total.add(1, &attrs);
        if !ok {
            self.inner.chain_tx_errors_total.add(1, &attrs);
        }
        self.inner.chain_rpc_ms.record(ms, &attrs);
    }

    pub fn peer_http(&self, op: &'static str, ok: bool, ms: u64) {
        let attrs = [KeyValue::new("op", op)];
        if !ok {
            self.inner.peer_http_errors_total.add(1, &attrs);
        }
        self.inner.peer_http_ms.record(ms, &attrs);
    }

    pub fn dispute_detected(&self) {
        self.inner.disputes_total.add(1, &[]);
    }

    pub fn finalized(&self) {
        self.inner.finalizations_total.add(1, &[]);
    }

    pub fn settled(&self) {
        self.inner.settlements_total.add(1, &[]);
    }

    pub fn indexer_range(&self, logs: u64, ms: u64) {
        self.inner.indexer_logs_total.add(logs, &[]);
        self.inner.indexer_range_ms.record(ms, &[]);
    }

    pub fn indexer_error(&self, op: &'static str) {
        self.inner
            .indexer_errors_total
            .add(1, &[KeyValue::new("op", op)]);
    }

    pub fn cache_hit(&self, namespace: &'static str) {
        self.inner
            .cache_hits_total
            .add(1, &[KeyValue::new("namespace", namespace)]);
    }

    pub fn cache_miss(&self, namespace: &'static str) {
        self.inner
            .cache_misses_total
            .add(1, &[KeyValue::new("namespace", namespace)]);
    }
}

impl Default for EngineTelemetry {
    fn default() -> Self {
        Self::new()
    }
}
