use crate::error::RpcErrorKind;
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram},
};
use std::sync::Arc;

#[derive(Clone)]
pub struct ScannerTelemetry {
    inner: Arc<Inner>,
}

struct Inner {
    chunks_total: Counter<u64>,
    chunk_errors_total: Counter<u64>,
    events_decoded_total: Counter<u64>,
    blocks_merged_total: Counter<u64>,
    endpoint_stops_total: Counter<u64>,

    get_logs_ms: Histogram<u64>,
    chunk_blocks: Histogram<u64>,
}

impl ScannerTelemetry {
    pub fn new() -> Self {
        let meter = global::meter("scanner");

        let chunks_total = meter
            .u64_counter("scanner.chunks_total")
            .with_description("Total chunks fetched and decoded")
            .build();
        let chunk_errors_total = meter
            .u64_counter("scanner.chunk_errors_total")
            .with_description("Total chunk failures partitioned by classified kind")
            .build();
        let events_decoded_total = meter
            .u64_counter("scanner.events_decoded_total")
            .with_description("Total events decoded against the schema tables")
            .build();
        let blocks_merged_total = meter
            .u64_counter("scanner.blocks_merged_total")
            .with_description("Total blocks merged past the store watermark")
            .build();
        let endpoint_stops_total = meter
            .u64_counter("scanner.endpoint_stops_total")
            .with_description("Total endpoints stopped over the failure budget")
            .build();

        let get_logs_ms = meter
            .u64_histogram("scanner.get_logs_ms")
            .with_description("eth_getLogs latency per chunk")
            .build();
        let chunk_blocks = meter
            .u64_histogram("scanner.chunk_blocks")
            .with_description("Block span of completed chunks")
            .build();

        Self {
            inner: Arc::new(Inner {
                chunks_total,
                chunk_errors_total,
                events_decoded_total,
                blocks_merged_total,
                endpoint_stops_total,
                get_logs_ms,
                chunk_blocks,
            }),
        }
    }

    pub fn chunk_ok(&self, blocks: u64, events: u64, ms: u64) {
        self.inner.chunks_total.add(1, &[]);
        self.inner.events_decoded_total.add(events, &[]);
        self.inner.get_logs_ms.record(ms, &[]);
        self.inner.chunk_blocks.record(blocks, &[]);
    }

    pub fn chunk_error(&self, kind: RpcErrorKind) {
        self.inner
            .chunk_errors_total
            .add(1, &[KeyValue::new("kind", kind.as_str())]);
    }

    pub fn blocks_merged(&self, blocks: u64) {
        if blocks > 0 {
            self.inner.blocks_merged_total.add(blocks, &[]);
        }
    }

    pub fn endpoint_stopped(&self) {
        self.inner.endpoint_stops_total.add(1, &[]);
    }
}

impl Default for ScannerTelemetry {
    fn default() -> Self {
        Self::new()
    }
}
