use crate::abi;
use crate::config::{AppConfig, BlockTag, EndpointConfig, ScanConfig};
use crate::decode::{Decoder, ScanMode};
use crate::dispatcher::Dispatcher;
use crate::endpoint::{Endpoint, EndpointCtx};
use crate::provider::{Provider, RpcProvider};
use crate::store::{FileStore, Store};
use crate::telemetry::ScannerTelemetry;
use crate::types::{BlockRange, ChunkResult, EventMap, Phase};
use anyhow::{Context, Result, bail};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const RESULT_QUEUE_DEPTH: usize = 256;
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub type EventCallback = Box<dyn FnMut(&EventMap) + Send + Sync>;

/// Drives the scan phases: bounded scan over the missing sub-ranges, then,
/// when the end is "latest", catch-up rounds until within the live threshold
/// and the live tail.
pub struct Scanner {
    scan: ScanConfig,
    endpoints: Vec<EndpointConfig>,
    providers: Vec<Arc<dyn Provider>>,
    decoder: Arc<Decoder>,
    store: Box<dyn Store>,
    telemetry: ScannerTelemetry,
    callback: Option<EventCallback>,
    store_results: bool,
}

/// Per-scan channels: created when endpoints are spawned, torn down when the
/// terminal phase is signalled.
struct Session {
    dispatcher: Arc<Dispatcher>,
    phase: watch::Sender<Phase>,
    results: mpsc::Receiver<ChunkResult>,
    live_cursor: Arc<AtomicU64>,
    tasks: JoinSet<Result<()>>,
}

impl Scanner {
    /// Builds the scanner from a loaded config: parses the ABI directory,
    /// connects every endpoint, opens the file store.
    pub async fn from_config(cfg: &AppConfig) -> Result<Self> {
        let abis = abi::load_abis(&cfg.abi_dir())?;
        let tables = abi::build_tables(&abis, &cfg.scan.contracts, &cfg.scan.events)?;
        let decoder = Decoder::new(cfg.scan.mode, tables);
        let mut providers: Vec<Arc<dyn Provider>> = Vec::with_capacity(cfg.endpoints.len());
        for endpoint in &cfg.endpoints {
            providers.push(Arc::new(RpcProvider::connect(&endpoint.url).await?));
        }
        let store = FileStore::open(
            &cfg.storage.directory,
            cfg.storage.max_entries,
            cfg.storage.save_interval,
        )?;
        Self::new(
            cfg.scan.clone(),
            cfg.endpoints.clone(),
            providers,
            decoder,
            Box::new(store),
        )
    }

    pub fn new(
        scan: ScanConfig,
        endpoints: Vec<EndpointConfig>,
        providers: Vec<Arc<dyn Provider>>,
        decoder: Decoder,
        store: Box<dyn Store>,
    ) -> Result<Self> {
        if endpoints.is_empty() {
            bail!("no rpc endpoints configured");
        }
        if endpoints.len() != providers.len() {
            bail!("endpoint and provider counts differ");
        }
        if decoder.schema_count() == 0 {
            match decoder.mode() {
                ScanMode::AnyEvent => bail!("no event schemas for the configured contracts"),
                ScanMode::AnyContract => bail!("no event schemas for the configured event names"),
            }
        }
        Ok(Self {
            scan,
            endpoints,
            providers,
            decoder: Arc::new(decoder),
            store,
            telemetry: ScannerTelemetry::new(),
            callback: None,
            store_results: true,
        })
    }

    /// Receives every live-tail chunk in the nested block→tx→address shape.
    pub fn on_events(&mut self, callback: impl FnMut(&EventMap) + Send + Sync + 'static) {
        self.callback = Some(Box::new(callback));
    }

    /// Whether live-tail chunks are also merged into the store.
    pub fn store_results(&mut self, on: bool) {
        self.store_results = on;
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    /// Scans the configured range.
    pub async fn run(&mut self, shutdown: &CancellationToken) -> Result<u64> {
        let (start, end) = (self.scan.start_block, self.scan.end_block);
        self.scan_blocks(start, end, shutdown).await
    }

    /// Scans `[start, end]`, resolving keywords against the chain head once.
    /// Returns the stored watermark; with an integer end this is `>= end`
    /// unless interrupted.
    pub async fn scan_blocks(
        &mut self,
        start: BlockTag,
        end: BlockTag,
        shutdown: &CancellationToken,
    ) -> Result<u64> {
        let head = self.block_number().await?;
        let start_block = match start {
            BlockTag::Number(n) => n,
            BlockTag::Current => head,
            BlockTag::Latest => bail!("start block cannot be \"latest\""),
        };
        if start_block > head {
            self.store.save()?;
            bail!("start block {start_block} is beyond the chain head {head}");
        }

        let mut session = self.start_session(shutdown);
        let outcome = self
            .drive(start_block, end, head, &mut session, shutdown)
            .await;

        session.phase.send_replace(Phase::Stopped);
        session.results.close();
        let joined = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while let Some(res) = session.tasks.join_next().await {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => warn!(err = %err, "endpoint task failed"),
                    Err(err) => warn!(err = %err, "endpoint task panicked"),
                }
            }
        })
        .await;
        if joined.is_err() {
            warn!("endpoint tasks still running at teardown, abandoning them");
        }

        self.store.save()?;
        outcome?;
        Ok(self.store.latest().unwrap_or(0))
    }

    fn start_session(&self, shutdown: &CancellationToken) -> Session {
        let dispatcher = Arc::new(Dispatcher::new());
        let (phase_tx, phase_rx) = watch::channel(Phase::Idle);
        let (results_tx, results_rx) = mpsc::channel(RESULT_QUEUE_DEPTH);
        let live_cursor = Arc::new(AtomicU64::new(0));
        let mut tasks = JoinSet::new();
        for (cfg, provider) in self.endpoints.iter().zip(&self.providers) {
            let endpoint = Endpoint::new(cfg, provider.clone(), self.decoder.clone());
            let ctx = EndpointCtx {
                dispatcher: dispatcher.clone(),
                results: results_tx.clone(),
                phase: phase_rx.clone(),
                live_cursor: live_cursor.clone(),
                shutdown: shutdown.clone(),
                telemetry: self.telemetry.clone(),
            };
            tasks.spawn(endpoint.run(ctx));
        }
        Session {
            dispatcher,
            phase: phase_tx,
            results: results_rx,
            live_cursor,
            tasks,
        }
    }

    async fn drive(
        &mut self,
        start: u64,
        end: BlockTag,
        head: u64,
        session: &mut Session,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        match end {
            BlockTag::Number(end_block) => {
                if end_block < start {
                    bail!("end block {end_block} precedes start block {start}");
                }
                self.scan_missing(start, end_block, session, shutdown).await
            }
            BlockTag::Current => self.scan_missing(start, head, session, shutdown).await,
            BlockTag::Latest => {
                let mut head = head;
                loop {
                    self.scan_missing(start, head, session, shutdown).await?;
                    if shutdown.is_cancelled() {
                        return Ok(());
                    }
                    head = self.block_number().await?;
                    let stored = self.store.latest().unwrap_or(0);
                    if head.saturating_sub(stored) <= self.scan.live_threshold {
                        info!(stored, head, "close enough to the head, entering live scan");
                        break;
                    }
                    debug!(stored, head, "head moved during the scan, catching up");
                }
                self.live_tail(session, shutdown).await
            }
        }
    }

    async fn scan_missing(
        &mut self,
        from: u64,
        to: u64,
        session: &mut Session,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let missing = self.store.check_missing(from, to)?;
        if missing.is_empty() {
            // Nothing to fetch; resume the watermark from existing coverage.
            self.store.setup(from)?;
            debug!(from, to, "range already covered");
            return Ok(());
        }
        for range in missing {
            if shutdown.is_cancelled() {
                return Ok(());
            }
            self.store.setup(range.from)?;
            self.scan_fixed(range, session, shutdown).await?;
        }
        Ok(())
    }

    async fn scan_fixed(
        &mut self,
        range: BlockRange,
        session: &mut Session,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        info!(range = %range, blocks = range.len(), "fixed scan starting");
        let started = Instant::now();
        session.dispatcher.add_range(range.from, range.to);
        session.phase.send_replace(Phase::Fixed);
        let mut progress = Progress::new(range);

        while self.store.latest().is_none_or(|latest| latest < range.to) {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("scan interrupted, saving");
                    return Ok(());
                }
                maybe = session.results.recv() => {
                    let Some(chunk) = maybe else {
                        bail!("all endpoints stopped before the scan completed");
                    };
                    let top = chunk.range.to;
                    let merged = self.store.process(chunk)?;
                    self.telemetry.blocks_merged(merged);
                    progress.report(top, self.store.latest(), session.dispatcher.remaining_blocks());
                }
                joined = session.tasks.join_next(), if !session.tasks.is_empty() => {
                    match joined {
                        Some(Ok(Ok(()))) => warn!("endpoint exited during the fixed scan"),
                        Some(Ok(Err(err))) => warn!(err = %err, "endpoint failed during the fixed scan"),
                        Some(Err(err)) => warn!(err = %err, "endpoint task panicked"),
                        None => {}
                    }
                }
            }
        }

        session.phase.send_replace(Phase::Idle);
        let elapsed = started.elapsed().as_secs_f64().max(f64::EPSILON);
        info!(
            range = %range,
            elapsed_secs = elapsed,
            blocks_per_sec = range.len() as f64 / elapsed,
            "fixed scan complete"
        );
        Ok(())
    }

    async fn live_tail(&mut self, session: &mut Session, shutdown: &CancellationToken) -> Result<()> {
        let start = self.store.latest().map_or(0, |latest| latest + 1);
        session.live_cursor.store(start, Ordering::Release);
        session.phase.send_replace(Phase::Live { start });
        info!(from = start, "live tail running");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                maybe = session.results.recv() => {
                    let Some(chunk) = maybe else {
                        bail!("all endpoints stopped during the live scan");
                    };
                    if let Some(callback) = self.callback.as_mut() {
                        callback(&chunk.blocks);
                    }
                    if self.store_results {
                        let top = chunk.range.to;
                        let merged = self.store.process(chunk)?;
                        self.telemetry.blocks_merged(merged);
                        if merged > 0 {
                            debug!(stored = top, "live chunk merged");
                        }
                    }
                }
            }
        }
    }

    async fn block_number(&self) -> Result<u64> {
        let provider = self.providers.first().context("no endpoints configured")?;
        provider.block_number().await.context("eth_blockNumber")
    }
}

struct Progress {
    range: BlockRange,
    started: Instant,
    last_report: Instant,
}

impl Progress {
    fn new(range: BlockRange) -> Self {
        let now = Instant::now();
        Self {
            range,
            started: now,
            last_report: now,
        }
    }

    fn report(&mut self, current: u64, latest: Option<u64>, remaining: u64) {
        if self.last_report.elapsed() < PROGRESS_INTERVAL {
            return;
        }
        self.last_report = Instant::now();
        let stored = latest.unwrap_or(0);
        let done = (stored + 1).saturating_sub(self.range.from);
        let elapsed = self.started.elapsed().as_secs_f64().max(0.1);
        let rate = done as f64 / elapsed;
        let eta_secs = if rate > 0.0 {
            (self.range.len().saturating_sub(done) as f64 / rate) as u64
        } else {
            0
        };
        info!(
            stage = "backfill",
            current_block = current,
            stored,
            remaining_blocks = remaining,
            blocks_per_sec = rate,
            eta_secs,
            "progress"
        );
    }
}
