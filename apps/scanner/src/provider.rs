use alloy::primitives::U256;
use alloy::providers::{DynProvider, Provider as AlloyProvider, ProviderBuilder};
use alloy::rpc::types::{Filter, Log};
use alloy::transports::{TransportError, TransportErrorKind};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

pub type RpcResult<T> = Result<T, TransportError>;

/// The read-side capability the scan engine runs against. A closed method
/// set; the wire transport behind it is chosen by the URL scheme.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn get_logs(&self, filter: &Filter) -> RpcResult<Vec<Log>>;
    async fn block_number(&self) -> RpcResult<u64>;

    /// Whether the transport holds server-side filter state; live mode
    /// installs a log filter there instead of polling bounded ranges.
    fn supports_filters(&self) -> bool {
        false
    }
    async fn new_filter(&self, filter: &Filter) -> RpcResult<U256>;
    async fn filter_changes(&self, id: U256) -> RpcResult<Vec<Log>>;
}

const CALL_TIMEOUT: Duration = Duration::from_secs(30);

pub fn is_supported_url(url: &str) -> bool {
    url.starts_with("wss://")
        || url.starts_with("ws://")
        || url.starts_with("https://")
        || url.starts_with("http://")
        || url.starts_with('/')
}

/// JSON-RPC provider over http(s), websocket or an ipc socket path.
pub struct RpcProvider {
    inner: DynProvider,
    url: String,
    stateful: bool,
}

impl RpcProvider {
    pub async fn connect(url: &str) -> Result<Self> {
        if !is_supported_url(url) {
            bail!("rpc url must start with ws(s)://, http(s):// or '/': {url}");
        }
        let stateful = !url.starts_with("http");
        let inner = ProviderBuilder::new()
            .connect(url)
            .await
            .with_context(|| format!("connect rpc endpoint {url}"))?
            .erased();
        Ok(Self {
            inner,
            url: url.to_string(),
            stateful,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn bounded<T>(&self, fut: impl Future<Output = RpcResult<T>> + Send) -> RpcResult<T> {
        match timeout(CALL_TIMEOUT, fut).await {
            Ok(res) => res,
            Err(_) => Err(TransportErrorKind::custom_str("request timed out")),
        }
    }
}

#[async_trait]
impl Provider for RpcProvider {
    async fn get_logs(&self, filter: &Filter) -> RpcResult<Vec<Log>> {
        self.bounded(self.inner.get_logs(filter)).await
    }

    async fn block_number(&self) -> RpcResult<u64> {
        self.bounded(self.inner.get_block_number()).await
    }

    fn supports_filters(&self) -> bool {
        self.stateful
    }

    async fn new_filter(&self, filter: &Filter) -> RpcResult<U256> {
        self.bounded(self.inner.new_filter(filter)).await
    }

    async fn filter_changes(&self, id: U256) -> RpcResult<Vec<Log>> {
        self.bounded(self.inner.get_filter_changes::<Log>(id)).await
    }
}
