use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::CodecError;

pub const SPEC_VERSION: &str = "1.0";

/// The canonical, CloudEvents-aligned wire envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub source: String,
    pub specversion: String,
    #[serde(rename = "type")]
    pub type_id: String,
    pub time: DateTime<Utc>,
    pub data: Value,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// Transport wrapper the codec peeled off on the way to the canonical envelope.
///
/// Kept distinct from `Envelope::metadata` (publisher-supplied trace hints) because
/// it describes something the *transport* did, not something the publisher said.
#[derive(Debug, Clone, PartialEq)]
pub enum WrapperMetadata {
    None,
    Sns {
        topic_arn: String,
        sns_message_id: Option<String>,
    },
    EventBridge {
        source: String,
        detail_type: String,
        time: Option<String>,
        resources: Vec<String>,
    },
}

impl Default for WrapperMetadata {
    fn default() -> Self {
        WrapperMetadata::None
    }
}

/// An envelope after unwrapping, still carrying its payload as an opaque JSON value.
///
/// Deserializing `data` into a concrete payload type is the registry/dispatch
/// layer's job (it knows the type from the registered handler), not the codec's.
#[derive(Debug, Clone)]
pub struct DecodedEnvelope {
    pub id: String,
    pub source: String,
    pub type_id: String,
    pub time: DateTime<Utc>,
    pub data: Value,
    pub metadata: HashMap<String, Value>,
    /// Outermost transport wrapper detected, if any.
    pub wrapper: WrapperMetadata,
}

/// Wraps `payload` in a canonical envelope ready to hand to a publisher.
pub fn encode<T: Serialize>(payload: &T, type_id: &str, source: &str) -> Result<Envelope, CodecError> {
    let data = serde_json::to_value(payload)?;
    Ok(Envelope {
        id: uuid::Uuid::new_v4().to_string(),
        source: source.to_string(),
        specversion: SPEC_VERSION.to_string(),
        type_id: type_id.to_string(),
        time: Utc::now(),
        data,
        metadata: HashMap::new(),
    })
}

/// Parses a raw SQS message body, unwrapping SNS and EventBridge transport
/// envelopes if present, down to the canonical envelope.
pub fn decode(raw: &[u8]) -> Result<DecodedEnvelope, CodecError> {
    let mut body: Value = serde_json::from_slice(raw)?;
    let mut wrapper = WrapperMetadata::None;

    loop {
        if let Some(unwrapped) = try_unwrap_sns(&body)? {
            if matches!(wrapper, WrapperMetadata::None) {
                wrapper = unwrapped.1;
            }
            trace!("unwrapped SNS transport envelope");
            body = unwrapped.0;
            continue;
        }
        if let Some(unwrapped) = try_unwrap_event_bridge(&body)? {
            if matches!(wrapper, WrapperMetadata::None) {
                wrapper = unwrapped.1;
            }
            trace!("unwrapped EventBridge transport envelope");
            body = unwrapped.0;
            continue;
        }
        break;
    }

    let obj = body
        .as_object()
        .ok_or(CodecError::MalformedEnvelope("<root>"))?;

    let id = obj
        .get("id")
        .and_then(Value::as_str)
        .ok_or(CodecError::MalformedEnvelope("id"))?
        .to_string();
    let source = obj
        .get("source")
        .and_then(Value::as_str)
        .ok_or(CodecError::MalformedEnvelope("source"))?
        .to_string();
    let specversion = obj
        .get("specversion")
        .and_then(Value::as_str)
        .ok_or(CodecError::MalformedEnvelope("specversion"))?
        .to_string();
    if specversion != SPEC_VERSION {
        return Err(CodecError::UnsupportedSpecVersion(specversion));
    }
    let type_id = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or(CodecError::MalformedEnvelope("type"))?
        .to_string();
    let time_raw = obj
        .get("time")
        .and_then(Value::as_str)
        .ok_or(CodecError::MalformedEnvelope("time"))?;
    let time = DateTime::parse_from_rfc3339(time_raw)
        .map_err(|_| CodecError::MalformedEnvelope("time"))?
        .with_timezone(&Utc);
    let data = obj
        .get("data")
        .cloned()
        .ok_or(CodecError::MalformedEnvelope("data"))?;
    let metadata = obj
        .get("metadata")
        .and_then(Value::as_object)
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();

    debug!(envelope_id = %id, type_id = %type_id, "decoded envelope");

    Ok(DecodedEnvelope {
        id,
        source,
        type_id,
        time,
        data,
        metadata,
        wrapper,
    })
}

/// Detects `{Type:"Notification", TopicArn, Message}` and returns the inner
/// body (parsed from the `Message` string) plus the SNS wrapper metadata.
fn try_unwrap_sns(body: &Value) -> Result<Option<(Value, WrapperMetadata)>, CodecError> {
    let obj = match body.as_object() {
        Some(o) => o,
        None => return Ok(None),
    };
    let is_notification = obj.get("Type").and_then(Value::as_str) == Some("Notification");
    let topic_arn = obj.get("TopicArn").and_then(Value::as_str);
    let message = obj.get("Message").and_then(Value::as_str);
    let (topic_arn, message) = match (is_notification, topic_arn, message) {
        (true, Some(t), Some(m)) => (t.to_string(), m),
        _ => return Ok(None),
    };

    let inner: Value = serde_json::from_str(message)?;
    let sns_message_id = obj.get("MessageId").and_then(Value::as_str).map(str::to_string);
    Ok(Some((
        inner,
        WrapperMetadata::Sns {
            topic_arn,
            sns_message_id,
        },
    )))
}

/// Detects `{detail, detail-type, source, time}` and returns `detail` as the
/// inner body plus EventBridge wrapper metadata.
fn try_unwrap_event_bridge(body: &Value) -> Result<Option<(Value, WrapperMetadata)>, CodecError> {
    let obj = match body.as_object() {
        Some(o) => o,
        None => return Ok(None),
    };
    let detail = obj.get("detail");
    let detail_type = obj.get("detail-type").and_then(Value::as_str);
    let source = obj.get("source").and_then(Value::as_str);
    let has_time = obj.contains_key("time");
    let (detail, detail_type, source) = match (detail, detail_type, source, has_time) {
        (Some(d), Some(dt), Some(s), true) => (d, dt, s),
        _ => return Ok(None),
    };

    let inner = match detail {
        Value::String(s) => serde_json::from_str(s)?,
        other => other.clone(),
    };
    let time = obj.get("time").and_then(Value::as_str).map(str::to_string);
    let resources = obj
        .get("resources")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default();

    Ok(Some((
        inner,
        WrapperMetadata::EventBridge {
            source: source.to_string(),
            detail_type: detail_type.to_string(),
            time,
            resources,
        },
    )))
}
