//! Parallel EVM event scanner.
//!
//! Partitions a block range across heterogeneous JSON-RPC endpoints, adapts
//! each endpoint's `eth_getLogs` window to its observed limits, decodes the
//! returned logs against configured ABI schemas and merges the out-of-order
//! results into a gap-free, append-only file store keyed by block height.
//! When configured to follow the head it switches from bounded scanning to a
//! live tail once the watermark is close enough.

pub mod abi;
pub mod config;
pub mod decode;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod provider;
pub mod scanner;
pub mod store;
pub mod telemetry;
pub mod types;

pub use config::{AppConfig, BlockTag, EndpointConfig, ScanConfig, StorageConfig};
pub use decode::{Decoder, ScanMode};
pub use provider::{Provider, RpcProvider};
pub use scanner::Scanner;
pub use store::{FileStore, Store};
pub use types::{BlockRange, ChunkResult, EventMap, Phase};
