use crate::decode::ScanMode;
use crate::provider::is_supported_url;
use alloy::primitives::Address;
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A block bound as configured: a number, or a keyword resolved at scan time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Number(u64),
    /// Resolved once via `blockNumber()` when the scan starts.
    Current,
    /// Keep following the head: bounded scan, then live tail.
    Latest,
}

#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub start_block: BlockTag,
    pub end_block: BlockTag,
    pub mode: ScanMode,
    /// Contract address → ABI file stem under `ABIs/`.
    pub contracts: Vec<(Address, String)>,
    /// Event names considered in `AnyContract` mode.
    pub events: Vec<String>,
    /// Maximum head lag, in blocks, at which live tailing takes over.
    pub live_threshold: u64,
}

#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub url: String,
    pub max_chunk_size: u64,
    pub start_chunk_size: u64,
    /// Target decoded events per chunk; drives the adaptive window.
    pub events_target: u64,
    pub poll_interval: Duration,
    pub fixed: bool,
    pub live: bool,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub directory: PathBuf,
    pub max_entries: usize,
    pub save_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub config_dir: PathBuf,
    pub scan: ScanConfig,
    pub endpoints: Vec<EndpointConfig>,
    pub storage: StorageConfig,
}

impl AppConfig {
    pub fn abi_dir(&self) -> PathBuf {
        self.config_dir.join("ABIs")
    }
}

#[derive(Debug, Deserialize)]
struct ProcessEnv {
    config_dir: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConfig {
    scan: RawScan,
    rpcs: Vec<RawRpc>,
    #[serde(default)]
    rpc_override: Option<RawRpcOverride>,
    #[serde(default)]
    storage: RawStorage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawScan {
    start_block: RawBlockTag,
    end_block: RawBlockTag,
    mode: RawMode,
    #[serde(default)]
    contracts: BTreeMap<String, String>,
    #[serde(default)]
    events: Vec<String>,
    live_threshold: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawBlockTag {
    Number(u64),
    Named(String),
}

#[derive(Debug, Deserialize, Clone, Copy)]
enum RawMode {
    #[serde(alias = "anyEvent", alias = "ANYEVENT")]
    AnyEvent,
    #[serde(alias = "anyContract", alias = "ANYCONTRACT")]
    AnyContract,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
enum RawActiveState {
    #[serde(alias = "fixed")]
    Fixed,
    #[serde(alias = "live")]
    Live,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRpc {
    url: String,
    max_chunk_size: Option<u64>,
    start_chunk_size: Option<u64>,
    events_target: Option<u64>,
    poll_interval_secs: Option<u64>,
    active_states: Option<Vec<RawActiveState>>,
}

/// Optional per-key override applied on top of every rpc entry.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRpcOverride {
    max_chunk_size: Option<u64>,
    start_chunk_size: Option<u64>,
    events_target: Option<u64>,
    poll_interval_secs: Option<u64>,
    active_states: Option<Vec<RawActiveState>>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RawStorage {
    directory: Option<String>,
    max_entries: Option<usize>,
    save_interval_secs: Option<u64>,
}

/// Loads `SCANNER_CONFIG_DIR/config.json`.
pub fn load() -> Result<AppConfig> {
    let env: ProcessEnv = envy::prefixed("SCANNER_")
        .from_env()
        .context("load SCANNER_* env config")?;
    load_from(Path::new(&env.config_dir))
}

pub fn load_from(dir: &Path) -> Result<AppConfig> {
    let path = dir.join("config.json");
    let text =
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let raw: RawConfig =
        serde_json::from_str(&text).with_context(|| format!("parse {}", path.display()))?;
    resolve(dir, raw)
}

fn resolve(dir: &Path, raw: RawConfig) -> Result<AppConfig> {
    if raw.rpcs.is_empty() {
        bail!("no rpc endpoints configured");
    }

    let start_block = block_tag(&raw.scan.start_block).context("scan.startBlock")?;
    if start_block == BlockTag::Latest {
        bail!("scan.startBlock cannot be \"latest\"");
    }
    let end_block = block_tag(&raw.scan.end_block).context("scan.endBlock")?;

    let mode = match raw.scan.mode {
        RawMode::AnyEvent => ScanMode::AnyEvent,
        RawMode::AnyContract => ScanMode::AnyContract,
    };

    let mut contracts = Vec::with_capacity(raw.scan.contracts.len());
    for (address, abi_name) in &raw.scan.contracts {
        let address = address
            .parse::<Address>()
            .with_context(|| format!("invalid contract address {address}"))?;
        contracts.push((address, abi_name.clone()));
    }
    if contracts.is_empty() {
        bail!("scan.contracts must name at least one contract (the ABI tables are built from it)");
    }
    if mode == ScanMode::AnyContract && raw.scan.events.is_empty() {
        bail!("anyContract mode needs at least one event name");
    }

    let overrides = raw.rpc_override;
    let mut endpoints = Vec::with_capacity(raw.rpcs.len());
    for rpc in raw.rpcs {
        if !is_supported_url(&rpc.url) {
            bail!("rpc url must start with ws(s)://, http(s):// or '/': {}", rpc.url);
        }
        let pick_u64 = |field: Option<u64>, over: Option<u64>, default: u64| {
            over.or(field).unwrap_or(default)
        };
        let max_chunk_size = pick_u64(
            rpc.max_chunk_size,
            overrides.as_ref().and_then(|o| o.max_chunk_size),
            DEFAULT_MAX_CHUNK_SIZE,
        )
        .max(1);
        let start_chunk_size = pick_u64(
            rpc.start_chunk_size,
            overrides.as_ref().and_then(|o| o.start_chunk_size),
            DEFAULT_START_CHUNK_SIZE,
        )
        .clamp(1, max_chunk_size);
        let events_target = pick_u64(
            rpc.events_target,
            overrides.as_ref().and_then(|o| o.events_target),
            DEFAULT_EVENTS_TARGET,
        )
        .max(1);
        let poll_interval = Duration::from_secs(
            pick_u64(
                rpc.poll_interval_secs,
                overrides.as_ref().and_then(|o| o.poll_interval_secs),
                DEFAULT_POLL_INTERVAL_SECS,
            )
            .max(1),
        );
        let states = overrides
            .as_ref()
            .and_then(|o| o.active_states.clone())
            .or(rpc.active_states)
            .unwrap_or_else(|| vec![RawActiveState::Fixed, RawActiveState::Live]);

        endpoints.push(EndpointConfig {
            url: rpc.url,
            max_chunk_size,
            start_chunk_size,
            events_target,
            poll_interval,
            fixed: states.contains(&RawActiveState::Fixed),
            live: states.contains(&RawActiveState::Live),
        });
    }

    let storage = StorageConfig {
        directory: match raw.storage.directory {
            Some(ref p) if Path::new(p).is_absolute() => PathBuf::from(p),
            Some(p) => dir.join(p),
            None => dir.join(DEFAULT_STORE_DIR),
        },
        max_entries: raw.storage.max_entries.unwrap_or(DEFAULT_MAX_ENTRIES).max(1),
        save_interval: Duration::from_secs(
            raw.storage
                .save_interval_secs
                .unwrap_or(DEFAULT_SAVE_INTERVAL_SECS)
                .max(1),
        ),
    };

    Ok(AppConfig {
        config_dir: dir.to_path_buf(),
        scan: ScanConfig {
            start_block,
            end_block,
            mode,
            contracts,
            events: raw.scan.events,
            live_threshold: raw.scan.live_threshold.unwrap_or(DEFAULT_LIVE_THRESHOLD),
        },
        endpoints,
        storage,
    })
}

fn block_tag(raw: &RawBlockTag) -> Result<BlockTag> {
    match raw {
        RawBlockTag::Number(n) => Ok(BlockTag::Number(*n)),
        RawBlockTag::Named(name) => match name.trim().to_lowercase().as_str() {
            "current" => Ok(BlockTag::Current),
            "latest" => Ok(BlockTag::Latest),
            other => bail!("invalid block tag {other:?} (expected a number, \"current\" or \"latest\")"),
        },
    }
}

const DEFAULT_MAX_CHUNK_SIZE: u64 = 100_000;
const DEFAULT_START_CHUNK_SIZE: u64 = 2_000;
const DEFAULT_EVENTS_TARGET: u64 = 5_000;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 2;
const DEFAULT_LIVE_THRESHOLD: u64 = 100;
const DEFAULT_STORE_DIR: &str = "output";
const DEFAULT_MAX_ENTRIES: usize = 100_000;
const DEFAULT_SAVE_INTERVAL_SECS: u64 = 60;

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Result<AppConfig> {
        let raw: RawConfig = serde_json::from_str(json).expect("valid json");
        resolve(Path::new("/cfg"), raw)
    }

    const BASE: &str = r#"{
        "scan": {
            "startBlock": 100,
            "endBlock": "latest",
            "mode": "anyEvent",
            "contracts": {"0x1111111111111111111111111111111111111111": "erc20"}
        },
        "rpcs": [{"url": "https://rpc.example.com"}]
    }"#;

    #[test]
    fn defaults_are_applied() {
        let cfg = parse(BASE).expect("config");
        assert_eq!(cfg.scan.start_block, BlockTag::Number(100));
        assert_eq!(cfg.scan.end_block, BlockTag::Latest);
        assert_eq!(cfg.scan.live_threshold, DEFAULT_LIVE_THRESHOLD);
        let ep = &cfg.endpoints[0];
        assert_eq!(ep.max_chunk_size, DEFAULT_MAX_CHUNK_SIZE);
        assert_eq!(ep.start_chunk_size, DEFAULT_START_CHUNK_SIZE);
        assert!(ep.fixed && ep.live);
        assert_eq!(cfg.storage.directory, PathBuf::from("/cfg/output"));
    }

    #[test]
    fn rpc_override_wins_over_entries() {
        let cfg = parse(
            r#"{
                "scan": {
                    "startBlock": "current",
                    "endBlock": 500,
                    "mode": "anyEvent",
                    "contracts": {"0x1111111111111111111111111111111111111111": "erc20"}
                },
                "rpcs": [
                    {"url": "https://a.example.com", "maxChunkSize": 9000},
                    {"url": "https://b.example.com"}
                ],
                "rpcOverride": {"maxChunkSize": 1234, "activeStates": ["Fixed"]}
            }"#,
        )
        .expect("config");
        for ep in &cfg.endpoints {
            assert_eq!(ep.max_chunk_size, 1234);
            assert!(ep.fixed && !ep.live);
        }
    }

    #[test]
    fn start_chunk_is_clamped_to_max() {
        let cfg = parse(
            r#"{
                "scan": {
                    "startBlock": 0,
                    "endBlock": 10,
                    "mode": "anyEvent",
                    "contracts": {"0x1111111111111111111111111111111111111111": "erc20"}
                },
                "rpcs": [{"url": "https://a.example.com", "maxChunkSize": 100, "startChunkSize": 5000}]
            }"#,
        )
        .expect("config");
        assert_eq!(cfg.endpoints[0].start_chunk_size, 100);
    }

    #[test]
    fn rejects_empty_rpcs() {
        let err = parse(
            r#"{
                "scan": {"startBlock": 0, "endBlock": 10, "mode": "anyEvent",
                         "contracts": {"0x1111111111111111111111111111111111111111": "erc20"}},
                "rpcs": []
            }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("no rpc endpoints"));
    }

    #[test]
    fn rejects_any_event_without_contracts() {
        let err = parse(
            r#"{
                "scan": {"startBlock": 0, "endBlock": 10, "mode": "anyEvent"},
                "rpcs": [{"url": "https://a.example.com"}]
            }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("at least one contract"));
    }

    #[test]
    fn rejects_any_contract_without_events() {
        let err = parse(
            r#"{
                "scan": {"startBlock": 0, "endBlock": 10, "mode": "anyContract",
                         "contracts": {"0x1111111111111111111111111111111111111111": "erc20"}},
                "rpcs": [{"url": "https://a.example.com"}]
            }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("at least one event name"));
    }

    #[test]
    fn rejects_latest_start_block() {
        let err = parse(
            r#"{
                "scan": {"startBlock": "latest", "endBlock": 10, "mode": "anyEvent",
                         "contracts": {"0x1111111111111111111111111111111111111111": "erc20"}},
                "rpcs": [{"url": "https://a.example.com"}]
            }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("startBlock"));
    }

    #[test]
    fn rejects_unknown_url_scheme() {
        let err = parse(
            r#"{
                "scan": {"startBlock": 0, "endBlock": 10, "mode": "anyEvent",
                         "contracts": {"0x1111111111111111111111111111111111111111": "erc20"}},
                "rpcs": [{"url": "ftp://a.example.com"}]
            }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("rpc url"));
    }
}
