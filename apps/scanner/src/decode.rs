use crate::abi::{EventSchema, SchemaTables};
use crate::types::{DecodedEvent, EventArgs, EventMap};
use alloy::dyn_abi::{DynSolValue, EventExt};
use alloy::rpc::types::{Filter, Log};
use serde_json::Value;
use tracing::warn;

/// How logs are filtered upstream and how a schema is resolved for each log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Filter by the configured address set, accept any topic; resolve via
    /// `(address, topic0)`.
    AnyEvent,
    /// Filter by the configured topic set across all addresses; resolve via
    /// `(topic0, topic count)`.
    AnyContract,
}

/// Pure lookup + ABI decode against the startup schema tables.
pub struct Decoder {
    mode: ScanMode,
    tables: SchemaTables,
}

impl Decoder {
    pub fn new(mode: ScanMode, tables: SchemaTables) -> Self {
        Self { mode, tables }
    }

    pub fn mode(&self) -> ScanMode {
        self.mode
    }

    /// Number of schemas resolvable in the configured mode. Zero means no
    /// log can ever decode, a configuration error.
    pub fn schema_count(&self) -> usize {
        match self.mode {
            ScanMode::AnyEvent => self.tables.contracts.values().map(|e| e.len()).sum(),
            ScanMode::AnyContract => self.tables.lookups.values().map(|e| e.len()).sum(),
        }
    }

    /// The filter every job starts from; the endpoint fills in the block
    /// bounds per chunk.
    pub fn filter_template(&self) -> Filter {
        match self.mode {
            ScanMode::AnyEvent => {
                let addresses: Vec<_> = self.tables.contracts.keys().copied().collect();
                Filter::new().address(addresses)
            }
            ScanMode::AnyContract => {
                let signatures: Vec<_> = self.tables.lookups.keys().copied().collect();
                Filter::new().event_signature(signatures)
            }
        }
    }

    fn schema_for(&self, log: &Log) -> Option<&EventSchema> {
        let topics = log.inner.data.topics();
        let topic0 = topics.first()?;
        match self.mode {
            ScanMode::AnyEvent => self.tables.contracts.get(&log.inner.address)?.get(topic0),
            ScanMode::AnyContract => self.tables.lookups.get(topic0)?.get(&topics.len()),
        }
    }

    /// Decodes one raw log. A schema miss is a silent drop; a malformed
    /// payload is dropped with a warning.
    pub fn decode(&self, log: &Log) -> Option<DecodedEvent> {
        let schema = self.schema_for(log)?;
        let topics = log.inner.data.topics();
        let decoded = match schema
            .event
            .decode_log_parts(topics.iter().copied(), &log.inner.data.data)
        {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(
                    event = schema.name(),
                    block = log.block_number,
                    err = %err,
                    "dropping undecodable log"
                );
                return None;
            }
        };

        let mut indexed = decoded.indexed.into_iter();
        let mut body = decoded.body.into_iter();
        let mut args = EventArgs::new();
        for param in &schema.event.inputs {
            let value = if param.indexed {
                indexed.next()?
            } else {
                body.next()?
            };
            args.insert(param.name.clone(), sol_value_to_json(&value));
        }

        Some(DecodedEvent {
            block_number: log.block_number?,
            tx_hash: log.transaction_hash?,
            address: log.inner.address,
            log_index: log.log_index?,
            name: schema.name().to_string(),
            args,
        })
    }

    pub fn decode_all(&self, logs: &[Log]) -> Vec<DecodedEvent> {
        logs.iter().filter_map(|log| self.decode(log)).collect()
    }
}

/// Renders a decoded value the way chain values are persisted: addresses
/// checksummed, integers as decimal strings, byte blobs 0x-hex.
pub fn sol_value_to_json(value: &DynSolValue) -> Value {
    match value {
        DynSolValue::Bool(b) => Value::Bool(*b),
        DynSolValue::Address(a) => Value::String(a.to_checksum(None)),
        DynSolValue::Uint(u, _) => Value::String(u.to_string()),
        DynSolValue::Int(i, _) => Value::String(i.to_string()),
        DynSolValue::String(s) => Value::String(s.clone()),
        DynSolValue::Bytes(b) => Value::String(format!("0x{}", hex::encode(b))),
        DynSolValue::FixedBytes(word, size) => {
            Value::String(format!("0x{}", hex::encode(&word.as_slice()[..*size])))
        }
        DynSolValue::Function(f) => Value::String(format!("0x{}", hex::encode(f.as_slice()))),
        DynSolValue::Array(items) | DynSolValue::FixedArray(items) | DynSolValue::Tuple(items) => {
            Value::Array(items.iter().map(sol_value_to_json).collect())
        }
        DynSolValue::CustomStruct {
            prop_names, tuple, ..
        } => Value::Object(
            prop_names
                .iter()
                .cloned()
                .zip(tuple.iter().map(sol_value_to_json))
                .collect(),
        ),
    }
}

/// Groups decoded events into the nested
/// `{block → {tx → {address → {"<name> <logIndex>" → args}}}}` shape the
/// store persists.
pub fn group_events(events: Vec<DecodedEvent>) -> EventMap {
    let mut out = EventMap::new();
    for event in events {
        out.entry(event.block_number)
            .or_default()
            .entry(format!("0x{}", hex::encode(event.tx_hash)))
            .or_default()
            .entry(event.address.to_checksum(None))
            .or_default()
            .insert(
                format!("{} {}", event.name, event.log_index),
                Value::Object(event.args),
            );
    }
    out
}
