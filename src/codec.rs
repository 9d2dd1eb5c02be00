use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use uuid::Uuid;

use crate::models::{Event, Platform};

/// Wire field names shared by every stream message.
pub const F_EVENT_ID: &str = "event_id";
pub const F_PLATFORM: &str = "platform";
pub const F_EVENT_TYPE: &str = "event_type";
pub const F_TIMESTAMP: &str = "timestamp";
pub const F_SESSION: &str = "external_session_id";
pub const F_WORKSPACE: &str = "workspace_hash";
pub const F_ENQUEUED_AT: &str = "enqueued_at";
pub const F_PAYLOAD: &str = "payload";
pub const F_METADATA: &str = "metadata";

/// zlib-compress a JSON value at the default level.
///
/// Single-shot encode with no header variance, so equal inputs always
/// produce equal bytes; tests hash these.
pub fn compress_json(value: &serde_json::Value) -> Result<Vec<u8>> {
    let raw = serde_json::to_vec(value).context("serializing payload")?;
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&raw).context("compressing payload")?;
    encoder.finish().context("finalizing zlib stream")
}

pub fn decompress_json(bytes: &[u8]) -> Result<serde_json::Value> {
    let mut decoder = ZlibDecoder::new(bytes);
    let mut raw = Vec::new();
    decoder
        .read_to_end(&mut raw)
        .context("decompressing payload")?;
    serde_json::from_slice(&raw).context("parsing decompressed payload")
}

fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("bad timestamp '{s}'"))
}

/// Encode an event into the field-flat stream wire form.
///
/// The payload field holds the raw zlib blob; everything else is UTF-8 text.
pub fn encode_wire(event: &Event) -> Result<Vec<(String, Vec<u8>)>> {
    let mut fields = vec![
        (F_EVENT_ID.into(), event.event_id.to_string().into_bytes()),
        (F_PLATFORM.into(), event.platform.as_str().as_bytes().to_vec()),
        (F_EVENT_TYPE.into(), event.event_type.as_bytes().to_vec()),
        (F_TIMESTAMP.into(), fmt_ts(&event.timestamp).into_bytes()),
        (
            F_SESSION.into(),
            event.external_session_id.as_bytes().to_vec(),
        ),
        (F_PAYLOAD.into(), compress_json(&event.payload)?),
    ];
    if let Some(ws) = &event.workspace_hash {
        fields.push((F_WORKSPACE.into(), ws.as_bytes().to_vec()));
    }
    if let Some(at) = &event.enqueued_at {
        fields.push((F_ENQUEUED_AT.into(), fmt_ts(at).into_bytes()));
    }
    if !event.metadata.is_null() {
        fields.push((
            F_METADATA.into(),
            serde_json::to_vec(&event.metadata).context("serializing metadata")?,
        ));
    }
    Ok(fields)
}

/// Decode the stream wire form back into a canonical event.
///
/// Scalar projections are re-derived from the payload, so wire messages never
/// carry projections that could drift out of sync with it.
pub fn decode_wire(fields: &[(String, Vec<u8>)]) -> Result<Event> {
    let get = |key: &str| -> Option<&[u8]> {
        fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    };
    let text = |key: &str| -> Result<String> {
        let bytes = get(key).with_context(|| format!("missing wire field '{key}'"))?;
        String::from_utf8(bytes.to_vec()).with_context(|| format!("field '{key}' is not UTF-8"))
    };

    let platform_str = text(F_PLATFORM)?;
    let platform = Platform::parse(&platform_str)
        .with_context(|| format!("unknown platform '{platform_str}'"))?;
    let payload =
        decompress_json(get(F_PAYLOAD).context("missing wire field 'payload'")?)?;

    let mut event = Event {
        event_id: Uuid::parse_str(&text(F_EVENT_ID)?).context("bad event_id")?,
        platform,
        event_type: text(F_EVENT_TYPE)?,
        timestamp: parse_ts(&text(F_TIMESTAMP)?)?,
        external_session_id: text(F_SESSION)?,
        workspace_hash: get(F_WORKSPACE)
            .map(|b| String::from_utf8_lossy(b).into_owned()),
        enqueued_at: match get(F_ENQUEUED_AT) {
            Some(b) => Some(parse_ts(&String::from_utf8_lossy(b))?),
            None => None,
        },
        payload,
        metadata: match get(F_METADATA) {
            Some(b) => serde_json::from_slice(b).context("parsing metadata")?,
            None => serde_json::Value::Null,
        },
        claude: Default::default(),
        cursor: Default::default(),
    };
    event.refresh_projections();
    Ok(event)
}

/// Serialize the full envelope for the `event_data` BLOB column.
pub fn encode_row_blob(event: &Event) -> Result<Vec<u8>> {
    let envelope = serde_json::to_value(event).context("serializing envelope")?;
    compress_json(&envelope)
}

/// Decode an `event_data` BLOB back into the envelope JSON.
pub fn decode_row_blob(bytes: &[u8]) -> Result<serde_json::Value> {
    decompress_json(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Event;
    use serde_json::json;

    fn sample_event() -> Event {
        let mut e = Event::new(
            Platform::Cursor,
            "generation",
            "curs_1700000000_ab12",
            json!({
                "generationUUID": "a",
                "unixMs": 1700000000000i64,
                "type": "composer",
                "textDescription": "refactor the batcher"
            }),
        );
        e.workspace_hash = Some("0123456789abcdef".into());
        e.enqueued_at = Some(e.timestamp);
        e.metadata = json!({"source": "test"});
        e
    }

    #[test]
    fn compression_round_trips() {
        let value = json!({"k": "v", "nested": {"n": [1, 2, 3]}});
        let packed = compress_json(&value).unwrap();
        assert_eq!(decompress_json(&packed).unwrap(), value);
    }

    #[test]
    fn compression_is_deterministic() {
        let value = json!({"a": 1, "b": "two"});
        assert_eq!(
            compress_json(&value).unwrap(),
            compress_json(&value).unwrap()
        );
    }

    #[test]
    fn compression_shrinks_repetitive_payloads() {
        let value = json!({"text": "tokens ".repeat(400)});
        let packed = compress_json(&value).unwrap();
        let raw_len = serde_json::to_vec(&value).unwrap().len();
        assert!(packed.len() * 5 < raw_len, "{} vs {raw_len}", packed.len());
    }

    #[test]
    fn wire_round_trip_is_payload_exact() {
        let event = sample_event();
        let fields = encode_wire(&event).unwrap();
        let back = decode_wire(&fields).unwrap();
        assert_eq!(back.event_id, event.event_id);
        assert_eq!(back.platform, event.platform);
        assert_eq!(back.event_type, event.event_type);
        assert_eq!(back.external_session_id, event.external_session_id);
        assert_eq!(back.workspace_hash, event.workspace_hash);
        assert_eq!(back.payload, event.payload);
        assert_eq!(back.metadata, event.metadata);
        // ms-precision survives the text form
        assert_eq!(
            back.timestamp.timestamp_millis(),
            event.timestamp.timestamp_millis()
        );
    }

    #[test]
    fn wire_decode_rederives_projections() {
        let event = sample_event();
        let fields = encode_wire(&event).unwrap();
        let back = decode_wire(&fields).unwrap();
        assert_eq!(back.cursor.generation_uuid.as_deref(), Some("a"));
    }

    #[test]
    fn wire_decode_missing_field_errors() {
        let event = sample_event();
        let fields: Vec<_> = encode_wire(&event)
            .unwrap()
            .into_iter()
            .filter(|(k, _)| k != F_PAYLOAD)
            .collect();
        assert!(decode_wire(&fields).is_err());
    }

    #[test]
    fn wire_optional_fields_may_be_absent() {
        let mut event = sample_event();
        event.workspace_hash = None;
        event.enqueued_at = None;
        event.metadata = serde_json::Value::Null;
        let back = decode_wire(&encode_wire(&event).unwrap()).unwrap();
        assert!(back.workspace_hash.is_none());
        assert!(back.enqueued_at.is_none());
        assert!(back.metadata.is_null());
    }

    #[test]
    fn row_blob_round_trips_envelope() {
        let event = sample_event();
        let blob = encode_row_blob(&event).unwrap();
        let envelope = decode_row_blob(&blob).unwrap();
        assert_eq!(envelope["event_id"], event.event_id.to_string());
        assert_eq!(envelope["payload"], event.payload);
        assert_eq!(envelope["generation_uuid"], "a");
    }
}
