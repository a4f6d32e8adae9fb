//! Wire decoding for the event-ingestion pool: topic grammar, the
//! msgpack `EventBatch` envelope, and the tagged event records inside it.

use kvindex_common::{IndexerError, Result};
use rmpv::Value;

/// A parsed wire message: topic-derived producer/model plus the raw
/// payload. Decoding the payload into an [`EventBatch`] happens in the
/// worker that owns this message's shard, not the subscriber, so a
/// malformed payload never blocks routing.
#[derive(Debug, Clone)]
pub struct Message {
    pub pod_identifier: String,
    pub model_name: String,
    pub seq: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct EventBatch {
    pub ts: f64,
    pub events: Vec<EventRecord>,
    pub data_parallel_rank: Option<i64>,
}

#[derive(Debug, Clone)]
pub enum EventRecord {
    BlockStored {
        block_hashes: Vec<u64>,
        token_ids: Vec<u32>,
        block_size: i64,
    },
    BlockRemoved {
        block_hashes: Vec<u64>,
    },
    AllBlocksCleared,
}

/// Validates and splits `kv@<pod_identifier>@<model_name>` against the
/// configured topic filter prefix. Returns `None` for anything that
/// doesn't match the three-part grammar.
pub fn parse_topic(topic: &str, filter_prefix: &str) -> Option<(String, String)> {
    if !topic.starts_with(filter_prefix) {
        return None;
    }
    let parts: Vec<&str> = topic.split('@').collect();
    if parts.len() != 3 || parts[0] != "kv" || parts[1].is_empty() || parts[2].is_empty() {
        return None;
    }
    Some((parts[1].to_string(), parts[2].to_string()))
}

pub fn decode_seq(frame: &[u8]) -> Result<u64> {
    if frame.len() != 8 {
        return Err(IndexerError::DecodeMalformed(format!(
            "seq frame must be 8 bytes, got {}",
            frame.len()
        )));
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(frame);
    Ok(u64::from_be_bytes(bytes))
}

pub fn decode_batch(payload: &[u8]) -> Result<EventBatch> {
    let value: Value = rmpv::decode::read_value(&mut &payload[..])
        .map_err(|e| IndexerError::DecodeMalformed(format!("payload not msgpack: {e}")))?;
    let map = value
        .as_map()
        .ok_or_else(|| IndexerError::DecodeMalformed("EventBatch must be a map".into()))?;

    let mut ts = 0.0;
    let mut events_value: Option<&Value> = None;
    let mut data_parallel_rank = None;
    for (k, v) in map {
        match k.as_str() {
            Some("ts") => ts = v.as_f64().unwrap_or(0.0),
            Some("events") => events_value = Some(v),
            Some("data_parallel_rank") => data_parallel_rank = v.as_i64(),
            _ => {}
        }
    }

    let events = match events_value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| decode_event_record(item).ok())
            .collect(),
        _ => Vec::new(),
    };

    Ok(EventBatch {
        ts,
        events,
        data_parallel_rank,
    })
}

fn decode_event_record(value: &Value) -> Result<EventRecord> {
    let array = value
        .as_array()
        .ok_or_else(|| IndexerError::DecodeMalformed("event record must be an array".into()))?;
    let tag = array
        .first()
        .and_then(|v| v.as_str())
        .ok_or_else(|| IndexerError::DecodeMalformed("event record missing tag".into()))?;

    match (tag, array.len()) {
        ("AllBlocksCleared", 1) => Ok(EventRecord::AllBlocksCleared),
        ("BlockRemoved", 2) => Ok(EventRecord::BlockRemoved {
            block_hashes: decode_u64_array(&array[1])?,
        }),
        // current: [tag, block_hashes, parent_block_hash?, token_ids, block_size, lora_id?]
        ("BlockStored", 6) => Ok(EventRecord::BlockStored {
            block_hashes: decode_u64_array(&array[1])?,
            token_ids: decode_u32_array(&array[3])?,
            block_size: array[4].as_i64().unwrap_or(0),
        }),
        // legacy: [tag, block_hashes, parent?, tokens, block_size]
        ("BlockStored", 5) => Ok(EventRecord::BlockStored {
            block_hashes: decode_u64_array(&array[1])?,
            token_ids: decode_u32_array(&array[3])?,
            block_size: array[4].as_i64().unwrap_or(0),
        }),
        (other, n) => Err(IndexerError::DecodeMalformed(format!(
            "unrecognized event tag {other:?} with {n} fields"
        ))),
    }
}

fn decode_u64_array(value: &Value) -> Result<Vec<u64>> {
    value
        .as_array()
        .ok_or_else(|| IndexerError::DecodeMalformed("expected array of u64".into()))?
        .iter()
        .map(|v| {
            v.as_u64()
                .ok_or_else(|| IndexerError::DecodeMalformed("expected u64".into()))
        })
        .collect()
}

fn decode_u32_array(value: &Value) -> Result<Vec<u32>> {
    value
        .as_array()
        .ok_or_else(|| IndexerError::DecodeMalformed("expected array of u32".into()))?
        .iter()
        .map(|v| {
            v.as_u64()
                .map(|n| n as u32)
                .ok_or_else(|| IndexerError::DecodeMalformed("expected u32".into()))
        })
        .collect()
}
