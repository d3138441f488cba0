//! End-to-end scan scenarios against scripted providers.

use alloy::eips::BlockNumberOrTag;
use alloy::primitives::{Address, B256, Bytes, LogData, U256, keccak256};
use alloy::rpc::json_rpc::ErrorPayload;
use alloy::rpc::types::{Filter, Log};
use alloy::transports::{RpcError, TransportError};
use async_trait::async_trait;
use scanner::abi::build_tables;
use scanner::config::{BlockTag, EndpointConfig, ScanConfig};
use scanner::decode::{Decoder, ScanMode};
use scanner::provider::{Provider, RpcResult};
use scanner::store::{FileStore, Store};
use scanner::types::EventMap;
use scanner::Scanner;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const CONTRACT: Address = Address::repeat_byte(0x11);

fn transfer_signature() -> B256 {
    keccak256("Transfer(address,address,uint256)")
}

fn erc20_decoder() -> Decoder {
    let abi = serde_json::from_str(
        r#"[{
            "type": "event",
            "name": "Transfer",
            "anonymous": false,
            "inputs": [
                {"name": "from", "type": "address", "indexed": true},
                {"name": "to", "type": "address", "indexed": true},
                {"name": "value", "type": "uint256", "indexed": false}
            ]
        }]"#,
    )
    .expect("valid abi");
    let mut abis = HashMap::new();
    abis.insert("erc20".to_string(), abi);
    let tables = build_tables(
        &abis,
        &[(CONTRACT, "erc20".to_string())],
        &["Transfer".to_string()],
    )
    .expect("tables");
    Decoder::new(ScanMode::AnyEvent, tables)
}

fn transfer_log(block: u64, index: u64, value: u64) -> Log {
    let topics = vec![
        transfer_signature(),
        B256::left_padding_from(Address::repeat_byte(0x22).as_slice()),
        B256::left_padding_from(Address::repeat_byte(0x33).as_slice()),
    ];
    let data = U256::from(value).to_be_bytes::<32>().to_vec();
    Log {
        inner: alloy::primitives::Log {
            address: CONTRACT,
            data: LogData::new_unchecked(topics, Bytes::from(data)),
        },
        block_hash: None,
        block_number: Some(block),
        block_timestamp: None,
        transaction_hash: Some(B256::repeat_byte(0xab)),
        transaction_index: Some(0),
        log_index: Some(index),
        removed: false,
    }
}

#[derive(Default)]
struct FakeProvider {
    head: AtomicU64,
    logs: Mutex<Vec<Log>>,
    /// Reject spans wider than this with a range-too-wide error.
    range_limit: Option<u64>,
    /// Fail every `get_logs` with this message.
    fail_message: Option<String>,
    delay: Duration,
    /// Advertise server-side filter state, as a websocket transport would.
    stateful: bool,
    get_logs_calls: AtomicU64,
    served_spans: Mutex<Vec<(u64, u64)>>,
    new_filter_calls: AtomicU64,
    filter_changes_calls: AtomicU64,
    /// Logs already handed out through `filter_changes`.
    filter_cursor: Mutex<usize>,
}

impl FakeProvider {
    fn new(head: u64) -> Self {
        Self {
            head: AtomicU64::new(head),
            ..Self::default()
        }
    }

    fn with_logs(self, logs: Vec<Log>) -> Self {
        *self.logs.lock().expect("lock") = logs;
        self
    }

    fn with_range_limit(mut self, limit: u64) -> Self {
        self.range_limit = Some(limit);
        self
    }

    fn with_failure(mut self, message: &str) -> Self {
        self.fail_message = Some(message.to_string());
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn with_filters(mut self) -> Self {
        self.stateful = true;
        self
    }

    fn push_log(&self, log: Log) {
        self.logs.lock().expect("lock").push(log);
    }

    fn calls(&self) -> u64 {
        self.get_logs_calls.load(Ordering::SeqCst)
    }

    fn spans(&self) -> Vec<(u64, u64)> {
        self.served_spans.lock().expect("lock").clone()
    }
}

fn rpc_err(message: &str) -> TransportError {
    RpcError::ErrorResp(ErrorPayload {
        code: -32000,
        message: message.to_string().into(),
        data: None,
    })
}

fn span_of(filter: &Filter) -> (u64, u64) {
    let bound = |b: Option<&BlockNumberOrTag>| b.and_then(BlockNumberOrTag::as_number);
    let from = bound(filter.block_option.get_from_block()).expect("numeric fromBlock");
    let to = bound(filter.block_option.get_to_block()).expect("numeric toBlock");
    (from, to)
}

#[async_trait]
impl Provider for FakeProvider {
    async fn get_logs(&self, filter: &Filter) -> RpcResult<Vec<Log>> {
        self.get_logs_calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(message) = &self.fail_message {
            return Err(rpc_err(message));
        }
        let (from, to) = span_of(filter);
        if let Some(limit) = self.range_limit {
            if to - from + 1 > limit {
                return Err(rpc_err(&format!("block range is too wide; max {limit}")));
            }
        }
        self.served_spans.lock().expect("lock").push((from, to));
        Ok(self
            .logs
            .lock()
            .expect("lock")
            .iter()
            .filter(|log| log.block_number.is_some_and(|b| from <= b && b <= to))
            .cloned()
            .collect())
    }

    async fn block_number(&self) -> RpcResult<u64> {
        Ok(self.head.load(Ordering::SeqCst))
    }

    fn supports_filters(&self) -> bool {
        self.stateful
    }

    async fn new_filter(&self, _filter: &Filter) -> RpcResult<U256> {
        self.new_filter_calls.fetch_add(1, Ordering::SeqCst);
        *self.filter_cursor.lock().expect("lock") = self.logs.lock().expect("lock").len();
        Ok(U256::from(1))
    }

    async fn filter_changes(&self, _id: U256) -> RpcResult<Vec<Log>> {
        self.filter_changes_calls.fetch_add(1, Ordering::SeqCst);
        let logs = self.logs.lock().expect("lock");
        let mut cursor = self.filter_cursor.lock().expect("lock");
        let fresh = logs[*cursor..].to_vec();
        *cursor = logs.len();
        Ok(fresh)
    }
}

fn endpoint_cfg(start_chunk: u64, max_chunk: u64) -> EndpointConfig {
    EndpointConfig {
        url: "https://rpc.example.com".to_string(),
        max_chunk_size: max_chunk,
        start_chunk_size: start_chunk,
        events_target: 5000,
        poll_interval: Duration::from_millis(50),
        fixed: true,
        live: true,
    }
}

fn scan_cfg(start: BlockTag, end: BlockTag, live_threshold: u64) -> ScanConfig {
    ScanConfig {
        start_block: start,
        end_block: end,
        mode: ScanMode::AnyEvent,
        contracts: vec![(CONTRACT, "erc20".to_string())],
        events: vec!["Transfer".to_string()],
        live_threshold,
    }
}

fn file_store(dir: &Path) -> Box<dyn Store> {
    Box::new(FileStore::open(dir, 10_000, Duration::from_secs(3600)).expect("open store"))
}

fn count_events(map: &EventMap) -> usize {
    map.values()
        .flat_map(|txs| txs.values())
        .flat_map(|addrs| addrs.values())
        .map(|events| events.len())
        .sum()
}

#[tokio::test(flavor = "multi_thread")]
async fn bounded_scan_stores_every_event() {
    let dir = tempfile::tempdir().expect("tempdir");
    let provider = Arc::new(FakeProvider::new(200).with_logs(vec![
        transfer_log(120, 0, 1),
        transfer_log(150, 0, 2),
        transfer_log(180, 0, 3),
    ]));

    let mut scanner = Scanner::new(
        scan_cfg(BlockTag::Number(100), BlockTag::Number(200), 5),
        vec![endpoint_cfg(2000, 100_000)],
        vec![provider.clone()],
        erc20_decoder(),
        file_store(dir.path()),
    )
    .expect("scanner");

    let latest = scanner.run(&CancellationToken::new()).await.expect("scan");
    assert_eq!(latest, 200);

    let events = scanner.store().get_events(100, 200).expect("events");
    assert_eq!(count_events(&events), 3);
    assert!(events.contains_key(&120));
    assert!(events.contains_key(&150));
    assert!(events.contains_key(&180));
    assert!(
        dir.path().join("100.200.json").exists(),
        "store file named after the covered range"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn second_run_resumes_without_refetching() {
    let dir = tempfile::tempdir().expect("tempdir");
    let logs = vec![transfer_log(120, 0, 1), transfer_log(180, 0, 2)];

    let first = Arc::new(FakeProvider::new(200).with_logs(logs.clone()));
    let mut scanner = Scanner::new(
        scan_cfg(BlockTag::Number(100), BlockTag::Number(200), 5),
        vec![endpoint_cfg(2000, 100_000)],
        vec![first],
        erc20_decoder(),
        file_store(dir.path()),
    )
    .expect("scanner");
    let latest = scanner.run(&CancellationToken::new()).await.expect("scan");
    assert_eq!(latest, 200);
    drop(scanner);

    let second = Arc::new(FakeProvider::new(200).with_logs(logs));
    let mut scanner = Scanner::new(
        scan_cfg(BlockTag::Number(100), BlockTag::Number(200), 5),
        vec![endpoint_cfg(2000, 100_000)],
        vec![second.clone()],
        erc20_decoder(),
        file_store(dir.path()),
    )
    .expect("scanner");
    let latest = scanner.run(&CancellationToken::new()).await.expect("rescan");

    assert_eq!(latest, 200);
    assert_eq!(second.calls(), 0, "covered range is not refetched");
    let events = scanner.store().get_events(100, 200).expect("events");
    assert_eq!(count_events(&events), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn range_too_wide_recovery_caps_the_window() {
    let dir = tempfile::tempdir().expect("tempdir");
    let provider = Arc::new(FakeProvider::new(9999).with_range_limit(5000));

    let mut scanner = Scanner::new(
        scan_cfg(BlockTag::Number(0), BlockTag::Number(9999), 5),
        vec![endpoint_cfg(10_000, 100_000)],
        vec![provider.clone()],
        erc20_decoder(),
        file_store(dir.path()),
    )
    .expect("scanner");

    let latest = scanner.run(&CancellationToken::new()).await.expect("scan");
    assert_eq!(latest, 9999);

    let spans = provider.spans();
    assert!(!spans.is_empty());
    for (from, to) in &spans {
        assert!(to - from + 1 <= 5000, "served span {from}-{to} over the cap");
    }
    let covered: u64 = spans.iter().map(|(from, to)| to - from + 1).sum();
    assert_eq!(covered, 10_000, "split jobs cover the range exactly once");
}

#[tokio::test(flavor = "multi_thread")]
async fn two_endpoints_share_the_range() {
    let dir = tempfile::tempdir().expect("tempdir");
    let fast = Arc::new(FakeProvider::new(999).with_delay(Duration::from_millis(10)));
    let slow = Arc::new(FakeProvider::new(999).with_delay(Duration::from_millis(30)));

    let mut scanner = Scanner::new(
        scan_cfg(BlockTag::Number(0), BlockTag::Number(999), 5),
        vec![endpoint_cfg(100, 100), endpoint_cfg(200, 200)],
        vec![fast.clone(), slow.clone()],
        erc20_decoder(),
        file_store(dir.path()),
    )
    .expect("scanner");

    let latest = scanner.run(&CancellationToken::new()).await.expect("scan");
    assert_eq!(latest, 999);
    assert!(fast.calls() >= 1, "fast endpoint contributed");
    assert!(slow.calls() >= 1, "slow endpoint contributed");
    assert!(
        scanner.store().check_missing(0, 999).expect("missing").is_empty(),
        "no gaps after a two-endpoint scan"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn live_tail_picks_up_new_blocks() {
    let dir = tempfile::tempdir().expect("tempdir");
    let provider = Arc::new(FakeProvider::new(1000));

    let mut scanner = Scanner::new(
        scan_cfg(BlockTag::Number(990), BlockTag::Latest, 5),
        vec![endpoint_cfg(2000, 100_000)],
        vec![provider.clone()],
        erc20_decoder(),
        file_store(dir.path()),
    )
    .expect("scanner");

    let seen: Arc<Mutex<Vec<EventMap>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        scanner.on_events(move |events| {
            seen.lock().expect("lock").push(events.clone());
        });
    }

    let shutdown = CancellationToken::new();
    let handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { scanner.run(&shutdown).await })
    };

    // Let the bounded scan finish and the live tail start.
    tokio::time::sleep(Duration::from_millis(500)).await;
    provider.push_log(transfer_log(1002, 0, 7));
    provider.head.store(1002, Ordering::SeqCst);

    let mut live_block = None;
    for _ in 0..100 {
        if let Some(block) = seen
            .lock()
            .expect("lock")
            .iter()
            .flat_map(|map| map.keys())
            .find(|block| **block == 1002)
            .copied()
        {
            live_block = Some(block);
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(live_block, Some(1002), "live tail delivered block 1002");

    shutdown.cancel();
    let latest = handle.await.expect("join").expect("scan");
    assert!(latest >= 1002);

    let reopened = FileStore::open(dir.path(), 10_000, Duration::from_secs(3600)).expect("open");
    let events = reopened.get_events(990, 1002).expect("events");
    assert!(events.contains_key(&1002), "live event persisted");
}

#[tokio::test(flavor = "multi_thread")]
async fn live_filter_advances_on_quiet_polls_and_delivers_matches() {
    let dir = tempfile::tempdir().expect("tempdir");

    // First session: the head moves but no log ever matches. Every drained
    // filter poll must still advance the watermark.
    let quiet = Arc::new(FakeProvider::new(1000).with_filters());
    let mut scanner = Scanner::new(
        scan_cfg(BlockTag::Number(990), BlockTag::Latest, 5),
        vec![endpoint_cfg(2000, 100_000)],
        vec![quiet.clone()],
        erc20_decoder(),
        file_store(dir.path()),
    )
    .expect("scanner");

    let shutdown = CancellationToken::new();
    let handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { scanner.run(&shutdown).await })
    };

    tokio::time::sleep(Duration::from_millis(500)).await;
    quiet.head.store(1002, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(600)).await;

    shutdown.cancel();
    let latest = handle.await.expect("join").expect("scan");
    assert!(
        latest >= 1002,
        "quiet filter polls advanced the watermark, got {latest}"
    );
    assert_eq!(quiet.calls(), 1, "live mode never fell back to get_logs");
    assert_eq!(quiet.new_filter_calls.load(Ordering::SeqCst), 1);
    assert!(quiet.filter_changes_calls.load(Ordering::SeqCst) >= 2);

    // Second session, same store: a matching log arrives through the filter.
    let matching = Arc::new(
        FakeProvider::new(1004)
            .with_filters()
            .with_logs(vec![transfer_log(1004, 0, 4)]),
    );
    let mut scanner = Scanner::new(
        scan_cfg(BlockTag::Number(990), BlockTag::Latest, 5),
        vec![endpoint_cfg(2000, 100_000)],
        vec![matching.clone()],
        erc20_decoder(),
        file_store(dir.path()),
    )
    .expect("scanner");

    let seen: Arc<Mutex<Vec<EventMap>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        scanner.on_events(move |events| {
            seen.lock().expect("lock").push(events.clone());
        });
    }

    let shutdown = CancellationToken::new();
    let handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { scanner.run(&shutdown).await })
    };

    tokio::time::sleep(Duration::from_millis(500)).await;
    matching.push_log(transfer_log(1006, 0, 6));
    matching.head.store(1006, Ordering::SeqCst);

    let mut delivered = false;
    for _ in 0..100 {
        if seen
            .lock()
            .expect("lock")
            .iter()
            .any(|map| map.contains_key(&1006))
        {
            delivered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(delivered, "filter poll delivered the matching log");

    shutdown.cancel();
    let latest = handle.await.expect("join").expect("scan");
    assert!(latest >= 1006);
    assert_eq!(matching.calls(), 1, "live mode never fell back to get_logs");

    let reopened = FileStore::open(dir.path(), 10_000, Duration::from_secs(3600)).expect("open");
    let events = reopened.get_events(990, 1006).expect("events");
    assert!(events.contains_key(&1006), "filter-delivered event persisted");
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_endpoint_stops_and_the_other_finishes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let broken = Arc::new(FakeProvider::new(99).with_failure("strange endpoint failure"));
    let healthy = Arc::new(FakeProvider::new(99));

    let mut scanner = Scanner::new(
        scan_cfg(BlockTag::Number(0), BlockTag::Number(99), 5),
        vec![endpoint_cfg(10, 10), endpoint_cfg(10, 10)],
        vec![broken.clone(), healthy.clone()],
        erc20_decoder(),
        file_store(dir.path()),
    )
    .expect("scanner");

    let latest = scanner.run(&CancellationToken::new()).await.expect("scan");
    assert_eq!(latest, 99, "healthy endpoint covered the whole range");
    assert!(
        broken.calls() <= 20,
        "broken endpoint stopped at the failure budget, saw {} calls",
        broken.calls()
    );
    assert!(healthy.calls() >= 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn scan_fails_when_every_endpoint_is_broken() {
    let dir = tempfile::tempdir().expect("tempdir");
    let broken = Arc::new(FakeProvider::new(99).with_failure("strange endpoint failure"));

    let mut scanner = Scanner::new(
        scan_cfg(BlockTag::Number(0), BlockTag::Number(99), 5),
        vec![endpoint_cfg(10, 10)],
        vec![broken],
        erc20_decoder(),
        file_store(dir.path()),
    )
    .expect("scanner");

    let err = scanner.run(&CancellationToken::new()).await.unwrap_err();
    assert!(err.to_string().contains("all endpoints stopped"));
}

#[tokio::test(flavor = "multi_thread")]
async fn start_beyond_head_is_fatal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let provider = Arc::new(FakeProvider::new(100));

    let mut scanner = Scanner::new(
        scan_cfg(BlockTag::Number(500), BlockTag::Number(600), 5),
        vec![endpoint_cfg(10, 10)],
        vec![provider],
        erc20_decoder(),
        file_store(dir.path()),
    )
    .expect("scanner");

    let err = scanner.run(&CancellationToken::new()).await.unwrap_err();
    assert!(err.to_string().contains("beyond the chain head"));
}
