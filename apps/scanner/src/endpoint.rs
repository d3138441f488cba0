use crate::config::EndpointConfig;
use crate::decode::{self, Decoder};
use crate::dispatcher::Dispatcher;
use crate::error::{RpcErrorKind, classify};
use crate::provider::Provider;
use crate::telemetry::ScannerTelemetry;
use crate::types::{BlockRange, ChunkResult, Phase};
use alloy::primitives::U256;
use alloy::transports::TransportError;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Past this many unclassified failures the endpoint hands its queued jobs
/// back to the dispatcher so healthier endpoints can cover them.
pub const FAIL_RETURN_THRESHOLD: u32 = 10;
/// Past this many the endpoint stops entirely.
pub const FAIL_STOP_THRESHOLD: u32 = 20;

const RATE_LIMIT_BACKOFF: Duration = Duration::from_millis(250);
const TAKE_JOB_POLL: Duration = Duration::from_millis(100);

/// Channels shared with the controller and the other endpoint workers.
pub struct EndpointCtx {
    pub dispatcher: Arc<Dispatcher>,
    pub results: mpsc::Sender<ChunkResult>,
    pub phase: watch::Receiver<Phase>,
    /// Next block to tail in live mode; shared so concurrent live endpoints
    /// advance a single frontier instead of re-scanning each other's blocks.
    pub live_cursor: Arc<AtomicU64>,
    pub shutdown: CancellationToken,
    pub telemetry: ScannerTelemetry,
}

/// One provider URL plus its adaptive chunker and local FIFO job queue.
/// Endpoints never share mutable state with each other; everything crosses
/// through `EndpointCtx`.
pub struct Endpoint {
    label: String,
    provider: Arc<dyn Provider>,
    decoder: Arc<Decoder>,
    chunk_size: u64,
    max_chunk_size: u64,
    events_target: f64,
    poll_interval: Duration,
    fixed_active: bool,
    live_active: bool,
    fail_count: u32,
    jobs: VecDeque<BlockRange>,
}

impl Endpoint {
    pub fn new(cfg: &EndpointConfig, provider: Arc<dyn Provider>, decoder: Arc<Decoder>) -> Self {
        let max_chunk_size = cfg.max_chunk_size.max(1);
        Self {
            label: label_of(&cfg.url),
            provider,
            decoder,
            chunk_size: cfg.start_chunk_size.clamp(1, max_chunk_size),
            max_chunk_size,
            events_target: cfg.events_target.max(1) as f64,
            poll_interval: cfg.poll_interval,
            fixed_active: cfg.fixed,
            live_active: cfg.live,
            fail_count: 0,
            jobs: VecDeque::new(),
        }
    }

    pub async fn run(mut self, mut ctx: EndpointCtx) -> anyhow::Result<()> {
        info!(
            endpoint = %self.label,
            chunk = self.chunk_size,
            max_chunk = self.max_chunk_size,
            "endpoint worker starting"
        );
        loop {
            if ctx.shutdown.is_cancelled() {
                self.drain_jobs(&ctx);
                return Ok(());
            }
            let phase = *ctx.phase.borrow_and_update();
            let keep_running = match phase {
                Phase::Stopped => {
                    self.drain_jobs(&ctx);
                    return Ok(());
                }
                Phase::Fixed if self.fixed_active => self.fixed_cycle(&mut ctx).await,
                Phase::Live { start } if self.live_active => self.live_loop(start, &mut ctx).await,
                _ => self.wait_phase(&mut ctx).await,
            };
            if !keep_running {
                self.drain_jobs(&ctx);
                info!(endpoint = %self.label, "endpoint worker stopped");
                return Ok(());
            }
        }
    }

    async fn wait_phase(&mut self, ctx: &mut EndpointCtx) -> bool {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => true,
            res = ctx.phase.changed() => res.is_ok(),
        }
    }

    /// One step of the bounded scan: pull a job when the queue is empty,
    /// serve the head of the queue, retune on the outcome.
    async fn fixed_cycle(&mut self, ctx: &mut EndpointCtx) -> bool {
        if self.jobs.is_empty() {
            match ctx.dispatcher.take_job(self.chunk_size) {
                Some(job) => self.jobs.push_back(job),
                None => {
                    tokio::select! {
                        _ = ctx.shutdown.cancelled() => {}
                        _ = ctx.phase.changed() => {}
                        _ = sleep(TAKE_JOB_POLL) => {}
                    }
                    return true;
                }
            }
        }
        let Some(job) = self.jobs.pop_front() else {
            return true;
        };

        let filter = self
            .decoder
            .filter_template()
            .from_block(job.from)
            .to_block(job.to);
        let started = Instant::now();
        match self.provider.get_logs(&filter).await {
            Ok(logs) => {
                let events = self.decoder.decode_all(&logs);
                let count = events.len() as u64;
                ctx.telemetry
                    .chunk_ok(job.len(), count, started.elapsed().as_millis() as u64);
                debug!(endpoint = %self.label, range = %job, events = count, "chunk complete");
                let chunk = ChunkResult {
                    range: job,
                    blocks: decode::group_events(events),
                };
                if ctx.results.send(chunk).await.is_err() {
                    return false;
                }
                self.throttle(count, job.len());
                true
            }
            Err(err) => self.recover(job, &err, ctx).await,
        }
    }

    async fn recover(&mut self, job: BlockRange, err: &TransportError, ctx: &EndpointCtx) -> bool {
        let kind = classify(err);
        ctx.telemetry.chunk_error(kind);
        if kind == RpcErrorKind::Other {
            warn!(endpoint = %self.label, range = %job, err = %err, "unclassified rpc error");
        } else {
            debug!(
                endpoint = %self.label,
                range = %job,
                kind = kind.as_str(),
                err = %err,
                "chunk failed"
            );
        }

        self.apply_error(job, kind);
        if kind == RpcErrorKind::RateLimited {
            sleep(RATE_LIMIT_BACKOFF).await;
        }

        if self.fail_count >= FAIL_STOP_THRESHOLD {
            warn!(
                endpoint = %self.label,
                fails = self.fail_count,
                "failure budget exhausted, stopping endpoint"
            );
            ctx.telemetry.endpoint_stopped();
            return false;
        }
        if self.fail_count >= FAIL_RETURN_THRESHOLD && !self.jobs.is_empty() {
            warn!(
                endpoint = %self.label,
                fails = self.fail_count,
                "failure budget reached, returning queued jobs"
            );
            self.drain_jobs(ctx);
        }
        true
    }

    /// The deterministic reaction to a classified failure. Splits preserve
    /// left-to-right block order at the head of the queue.
    fn apply_error(&mut self, job: BlockRange, kind: RpcErrorKind) {
        match kind {
            RpcErrorKind::RateLimited => self.jobs.push_front(job),
            RpcErrorKind::RangeTooWide { max_blocks } => {
                match max_blocks {
                    Some(max) => {
                        self.max_chunk_size = max.max(1);
                        let parts = job.len().div_ceil(self.max_chunk_size);
                        self.split_job(job, parts);
                    }
                    None => {
                        self.max_chunk_size = (self.max_chunk_size * 95 / 100).max(1);
                        self.split_job(job, 2);
                    }
                }
                self.chunk_size = self.chunk_size.min(self.max_chunk_size);
                info!(
                    endpoint = %self.label,
                    max_chunk = self.max_chunk_size,
                    "block range too wide, window capped"
                );
            }
            RpcErrorKind::SuggestedRange { blocks } => {
                let parts = self.chunk_size.div_ceil(blocks.max(1)).max(1);
                debug!(
                    endpoint = %self.label,
                    suggested = blocks,
                    parts,
                    "server suggested a narrower range"
                );
                self.split_job(job, parts);
            }
            RpcErrorKind::ResponseTooLarge => {
                self.events_target = (self.events_target * 0.95).max(1.0);
                self.split_job(job, 2);
            }
            RpcErrorKind::InvalidParams | RpcErrorKind::Timeout => self.split_job(job, 2),
            RpcErrorKind::Other => {
                self.split_job(job, 2);
                self.fail_count += 1;
            }
        }
    }

    fn split_job(&mut self, job: BlockRange, parts: u64) {
        let pieces = job.split(parts);
        let part_len = pieces.first().map_or(1, BlockRange::len);
        self.chunk_size = part_len.clamp(1, self.max_chunk_size);
        for piece in pieces.into_iter().rev() {
            self.jobs.push_front(piece);
        }
        debug!(
            endpoint = %self.label,
            range = %job,
            parts = parts.max(1),
            chunk = self.chunk_size,
            "job split"
        );
    }

    /// Success-path retune: aim the next window at `events_target` events.
    /// Zero events carry no signal, the window stays.
    fn throttle(&mut self, events: u64, block_span: u64) {
        if events == 0 {
            return;
        }
        let multiplier = (self.events_target / events as f64).ceil().max(1.0) as u64;
        self.chunk_size = multiplier
            .saturating_mul(block_span)
            .clamp(1, self.max_chunk_size);
        debug!(
            endpoint = %self.label,
            events,
            blocks = block_span,
            chunk = self.chunk_size,
            "window retuned"
        );
    }

    fn drain_jobs(&mut self, ctx: &EndpointCtx) {
        while let Some(job) = self.jobs.pop_back() {
            ctx.dispatcher.return_job(job);
        }
    }

    async fn live_loop(&mut self, start: u64, ctx: &mut EndpointCtx) -> bool {
        info!(
            endpoint = %self.label,
            from = start,
            poll_secs = self.poll_interval.as_secs(),
            "live scan starting"
        );
        let mut filter_id = None;
        if self.provider.supports_filters() {
            let filter = self.decoder.filter_template().from_block(start);
            match self.provider.new_filter(&filter).await {
                Ok(id) => filter_id = Some(id),
                Err(err) => warn!(
                    endpoint = %self.label,
                    err = %err,
                    "filter install failed, falling back to range polling"
                ),
            }
        }

        loop {
            if ctx.shutdown.is_cancelled() {
                return true;
            }
            match *ctx.phase.borrow() {
                Phase::Live { .. } => {}
                _ => return true,
            }

            let result = match filter_id {
                Some(id) => self.poll_filter(id, ctx).await,
                None => self.poll_range(ctx).await,
            };
            if let Err(err) = result {
                let kind = classify(&err);
                ctx.telemetry.chunk_error(kind);
                warn!(endpoint = %self.label, kind = kind.as_str(), err = %err, "live poll failed");
                if kind == RpcErrorKind::RateLimited {
                    sleep(RATE_LIMIT_BACKOFF).await;
                }
                if kind == RpcErrorKind::Other {
                    self.fail_count += 1;
                    if self.fail_count >= FAIL_STOP_THRESHOLD {
                        warn!(
                            endpoint = %self.label,
                            fails = self.fail_count,
                            "failure budget exhausted, leaving live scan"
                        );
                        ctx.telemetry.endpoint_stopped();
                        return false;
                    }
                }
            }

            tokio::select! {
                _ = ctx.shutdown.cancelled() => return true,
                res = ctx.phase.changed() => { if res.is_err() { return true; } }
                _ = sleep(self.poll_interval) => {}
            }
        }
    }

    /// Live over a stateless transport: bounded `get_logs` windows walking
    /// the shared frontier up to the head.
    async fn poll_range(&mut self, ctx: &EndpointCtx) -> Result<(), TransportError> {
        let next = ctx.live_cursor.load(Ordering::Acquire);
        let head = self.provider.block_number().await?;
        if head < next {
            return Ok(());
        }
        let to = head.min(next.saturating_add(self.max_chunk_size - 1));
        let range = BlockRange::new(next, to);
        let filter = self
            .decoder
            .filter_template()
            .from_block(range.from)
            .to_block(range.to);
        let logs = self.provider.get_logs(&filter).await?;
        let events = self.decoder.decode_all(&logs);
        let count = events.len() as u64;
        let chunk = ChunkResult {
            range,
            blocks: decode::group_events(events),
        };
        if ctx.results.send(chunk).await.is_ok() {
            ctx.live_cursor.fetch_max(range.to + 1, Ordering::AcqRel);
            debug!(endpoint = %self.label, range = %range, events = count, "live chunk emitted");
        }
        Ok(())
    }

    /// Live over a stateful transport: drain the server-side filter the
    /// provider only reports new entries from. A drained filter confirms
    /// coverage up to the head, so every successful poll emits a chunk and
    /// advances the frontier even when nothing matched.
    async fn poll_filter(&mut self, id: U256, ctx: &EndpointCtx) -> Result<(), TransportError> {
        let logs = self.provider.filter_changes(id).await?;
        let head = self.provider.block_number().await?;
        let next = ctx.live_cursor.load(Ordering::Acquire);
        let fresh: Vec<_> = logs
            .into_iter()
            .filter(|log| log.block_number.is_some_and(|b| b >= next))
            .collect();
        let hi = fresh
            .iter()
            .filter_map(|log| log.block_number)
            .max()
            .map_or(head, |top| top.max(head));
        if hi < next {
            return Ok(());
        }
        let range = BlockRange::new(next, hi);
        let events = self.decoder.decode_all(&fresh);
        let count = events.len() as u64;
        let chunk = ChunkResult {
            range,
            blocks: decode::group_events(events),
        };
        if ctx.results.send(chunk).await.is_ok() {
            ctx.live_cursor.fetch_max(range.to + 1, Ordering::AcqRel);
            debug!(endpoint = %self.label, range = %range, events = count, "live chunk emitted");
        }
        Ok(())
    }
}

fn label_of(url: &str) -> String {
    match url.split_once("://") {
        Some((_, rest)) => rest
            .split('/')
            .find(|part| !part.is_empty())
            .unwrap_or(rest)
            .to_string(),
        None => url.to_string(),
    }
}
