use alloy::json_abi::{Event, JsonAbi};
use alloy::primitives::{Address, B256};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// One event schema: the ABI entry plus the derived lookup keys.
#[derive(Debug, Clone)]
pub struct EventSchema {
    pub event: Event,
    pub signature: B256,
    /// Indexed-argument count + 1 (for topic0). Disambiguates overloaded
    /// signatures that differ only in indexed-ness.
    pub topic_count: usize,
}

impl EventSchema {
    pub fn new(event: Event) -> Self {
        let signature = event.selector();
        let topic_count = event.inputs.iter().filter(|p| p.indexed).count() + 1;
        Self {
            event,
            signature,
            topic_count,
        }
    }

    pub fn name(&self) -> &str {
        &self.event.name
    }
}

/// contract address → topic0 → schema. Drives `AnyEvent` resolution.
pub type ContractTable = HashMap<Address, HashMap<B256, EventSchema>>;

/// topic0 → topic count → schema. Drives `AnyContract` resolution.
pub type EventLookup = HashMap<B256, HashMap<usize, EventSchema>>;

/// Built once at startup, read-only afterwards.
#[derive(Debug, Default)]
pub struct SchemaTables {
    pub contracts: ContractTable,
    pub lookups: EventLookup,
}

/// Reads every `*.json` ABI under `dir`, keyed by file stem.
pub fn load_abis(dir: &Path) -> Result<HashMap<String, JsonAbi>> {
    let mut abis = HashMap::new();
    let entries = fs::read_dir(dir).with_context(|| format!("read abi dir {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let text =
            fs::read_to_string(&path).with_context(|| format!("read abi {}", path.display()))?;
        let abi: JsonAbi = serde_json::from_str(&text)
            .with_context(|| format!("parse abi {}", path.display()))?;
        abis.insert(stem.to_string(), abi);
    }
    Ok(abis)
}

/// Builds the contract table for every configured `(address, abi)` pair and
/// the `AnyContract` lookup for the listed event names.
pub fn build_tables(
    abis: &HashMap<String, JsonAbi>,
    contracts: &[(Address, String)],
    event_names: &[String],
) -> Result<SchemaTables> {
    let mut tables = SchemaTables::default();
    for (address, abi_name) in contracts {
        let abi = abis
            .get(abi_name)
            .with_context(|| format!("no abi file named {abi_name} for contract {address}"))?;
        let entry = tables.contracts.entry(*address).or_default();
        for event in abi.events() {
            let schema = EventSchema::new(event.clone());
            if event_names.contains(&event.name) {
                tables
                    .lookups
                    .entry(schema.signature)
                    .or_default()
                    .insert(schema.topic_count, schema.clone());
            }
            entry.insert(schema.signature, schema);
        }
    }
    Ok(tables)
}
