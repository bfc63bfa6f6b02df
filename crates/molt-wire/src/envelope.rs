//! Request/response envelope types and codec negotiation.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use thiserror::Error;

/// Reserved entry name for the explicit cancel frame.
pub const CANCEL_ENTRY: &str = "__cancel__";
/// Reserved entry name for the minimal liveness check.
pub const HEALTH_ENTRY: &str = "health";

/// Payload/result encoding declared on a request or manifest entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    Msgpack,
    Json,
    /// Reserved; accepted in manifests/requests but not yet implemented.
    ArrowIpc,
}

impl Codec {
    pub fn as_str(self) -> &'static str {
        match self {
            Codec::Msgpack => "msgpack",
            Codec::Json => "json",
            Codec::ArrowIpc => "arrow_ipc",
        }
    }

    pub fn parse(value: &str) -> Option<Codec> {
        match value {
            "msgpack" => Some(Codec::Msgpack),
            "json" => Some(Codec::Json),
            "arrow_ipc" => Some(Codec::ArrowIpc),
            _ => None,
        }
    }
}

/// Which wire encoding a request frame actually arrived on. Tracked
/// separately from the envelope's declared `codec` (which names the
/// *payload* encoding) so the worker can reply using the same transport
/// encoding the client used.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WireCodec {
    Msgpack,
    Json,
}

/// Terminal (or `Busy`, which is reached without ever becoming non-terminal)
/// status of a request.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    InvalidInput,
    Busy,
    Timeout,
    Cancelled,
    InternalError,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Ok => "Ok",
            Status::InvalidInput => "InvalidInput",
            Status::Busy => "Busy",
            Status::Timeout => "Timeout",
            Status::Cancelled => "Cancelled",
            Status::InternalError => "InternalError",
        }
    }
}

/// A request envelope as transported over one frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub request_id: u64,
    pub entry: String,
    #[serde(default)]
    pub timeout_ms: u32,
    pub codec: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<ByteBuf>,
    /// JSON-only convenience fallback for human-authored test requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_b64: Option<String>,
}

impl RequestEnvelope {
    /// Resolves the opaque payload bytes regardless of which field carried them.
    pub fn payload_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        if let Some(payload) = &self.payload {
            return Ok(payload.clone().into_vec());
        }
        if let Some(encoded) = &self.payload_b64 {
            return BASE64
                .decode(encoded)
                .map_err(|err| EnvelopeError::InvalidBase64Payload(err.to_string()));
        }
        Ok(Vec::new())
    }
}

/// A single metrics value. Most entries (`queue_us`, `pool_in_flight`, ...)
/// are counts; the DB-specific entries (`db_alias`, `db_tag`,
/// `db_result_format`) are short labels, so the map can't be a flat
/// `HashMap<String, u64>` once DB metrics are attached.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    U64(u64),
    Str(String),
}

impl From<u64> for MetricValue {
    fn from(value: u64) -> Self {
        MetricValue::U64(value)
    }
}

impl From<String> for MetricValue {
    fn from(value: String) -> Self {
        MetricValue::Str(value)
    }
}

/// A response envelope as transported over one frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub request_id: u64,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<ByteBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<HashMap<String, MetricValue>>,
}

impl ResponseEnvelope {
    pub fn ok(request_id: u64, payload: Vec<u8>, metrics: HashMap<String, MetricValue>) -> Self {
        Self {
            request_id,
            status: Status::Ok,
            payload: Some(ByteBuf::from(payload)),
            error: None,
            metrics: Some(metrics),
        }
    }

    pub fn error(
        request_id: u64,
        status: Status,
        message: impl Into<String>,
        metrics: Option<HashMap<String, MetricValue>>,
    ) -> Self {
        debug_assert!(status != Status::Ok, "use ResponseEnvelope::ok for Ok responses");
        Self {
            request_id,
            status,
            payload: None,
            error: Some(message.into()),
            metrics,
        }
    }
}

/// JSON wire shape for a response: payload travels base64-encoded since JSON
/// has no native bytes type.
#[derive(Serialize, Deserialize)]
struct ResponseEnvelopeJson {
    request_id: u64,
    status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_b64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metrics: Option<HashMap<String, MetricValue>>,
}

/// Payload for the reserved `__cancel__` entry.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CancelRequest {
    pub request_id: u64,
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("invalid base64 payload: {0}")]
    InvalidBase64Payload(String),
    #[error("failed to decode request envelope: {0}")]
    DecodeRequest(String),
    #[error("failed to encode response envelope: {0}")]
    EncodeResponse(String),
    #[error("failed to decode payload with codec '{codec}': {source}")]
    DecodePayload { codec: String, source: String },
    #[error("failed to encode payload with codec '{codec}': {source}")]
    EncodePayload { codec: String, source: String },
    #[error("unsupported payload codec '{0}'")]
    UnsupportedCodec(String),
    #[error("failed to encode request envelope: {0}")]
    EncodeRequest(String),
    #[error("failed to decode response envelope: {0}")]
    DecodeResponse(String),
}

/// Decodes a raw frame into a request envelope, trying MsgPack then JSON —
/// the frame itself doesn't carry a codec tag, only the envelope's `codec`
/// field names the *payload* encoding, so the transport encoding is sniffed.
pub fn decode_request_frame(bytes: &[u8]) -> Result<(RequestEnvelope, WireCodec), EnvelopeError> {
    if let Ok(envelope) = rmp_serde::from_slice::<RequestEnvelope>(bytes) {
        return Ok((envelope, WireCodec::Msgpack));
    }
    let envelope = serde_json::from_slice::<RequestEnvelope>(bytes)
        .map_err(|err| EnvelopeError::DecodeRequest(err.to_string()))?;
    Ok((envelope, WireCodec::Json))
}

/// Encodes a response envelope back onto the wire using the codec the
/// request arrived on.
pub fn encode_response_frame(
    response: &ResponseEnvelope,
    wire: WireCodec,
) -> Result<Vec<u8>, EnvelopeError> {
    match wire {
        WireCodec::Msgpack => rmp_serde::to_vec_named(response)
            .map_err(|err| EnvelopeError::EncodeResponse(err.to_string())),
        WireCodec::Json => {
            let payload_b64 = response
                .payload
                .as_ref()
                .map(|payload| BASE64.encode(payload.as_ref()));
            let json = ResponseEnvelopeJson {
                request_id: response.request_id,
                status: response.status,
                payload_b64,
                error: response.error.clone(),
                metrics: response.metrics.clone(),
            };
            serde_json::to_vec(&json).map_err(|err| EnvelopeError::EncodeResponse(err.to_string()))
        }
    }
}

/// Encodes a request envelope for the wire (client side): msgpack carries
/// the payload as raw bytes; JSON carries it base64 in `payload_b64` since
/// JSON has no native bytes type (mirrors [`encode_response_frame`]'s JSON
/// handling). Callers building a JSON request should leave `payload` unset
/// and put the encoded bytes in `payload_b64` themselves, or call this with
/// `payload` set and let it get base64'd automatically.
pub fn encode_request_frame(request: &RequestEnvelope, wire: WireCodec) -> Result<Vec<u8>, EnvelopeError> {
    match wire {
        WireCodec::Msgpack => {
            rmp_serde::to_vec_named(request).map_err(|err| EnvelopeError::EncodeRequest(err.to_string()))
        }
        WireCodec::Json => {
            let payload_b64 = request
                .payload
                .as_ref()
                .map(|payload| BASE64.encode(payload.as_ref()))
                .or_else(|| request.payload_b64.clone());
            let json = serde_json::json!({
                "request_id": request.request_id,
                "entry": request.entry,
                "timeout_ms": request.timeout_ms,
                "codec": request.codec,
                "payload_b64": payload_b64,
            });
            serde_json::to_vec(&json).map_err(|err| EnvelopeError::EncodeRequest(err.to_string()))
        }
    }
}

/// Decodes a raw frame into a response envelope (client side), sniffing
/// MsgPack then JSON the same way [`decode_request_frame`] does.
pub fn decode_response_frame(bytes: &[u8]) -> Result<ResponseEnvelope, EnvelopeError> {
    if let Ok(response) = rmp_serde::from_slice::<ResponseEnvelope>(bytes) {
        return Ok(response);
    }
    let json: ResponseEnvelopeJson =
        serde_json::from_slice(bytes).map_err(|err| EnvelopeError::DecodeResponse(err.to_string()))?;
    let payload = json
        .payload_b64
        .map(|encoded| {
            BASE64
                .decode(encoded)
                .map_err(|err| EnvelopeError::InvalidBase64Payload(err.to_string()))
        })
        .transpose()?
        .map(ByteBuf::from);
    Ok(ResponseEnvelope {
        request_id: json.request_id,
        status: json.status,
        payload,
        error: json.error,
        metrics: json.metrics,
    })
}

/// Decodes a handler payload using the codec named on the request.
pub fn decode_payload<T: for<'de> Deserialize<'de>>(
    payload: &[u8],
    codec: &str,
) -> Result<T, EnvelopeError> {
    match codec {
        "msgpack" => rmp_serde::from_slice(payload).map_err(|err| EnvelopeError::DecodePayload {
            codec: codec.to_string(),
            source: err.to_string(),
        }),
        "json" => serde_json::from_slice(payload).map_err(|err| EnvelopeError::DecodePayload {
            codec: codec.to_string(),
            source: err.to_string(),
        }),
        other => Err(EnvelopeError::UnsupportedCodec(other.to_string())),
    }
}

/// Encodes a handler result using the codec named on the entry/request.
pub fn encode_payload<T: Serialize>(value: &T, codec: &str) -> Result<Vec<u8>, EnvelopeError> {
    match codec {
        "msgpack" => rmp_serde::to_vec_named(value).map_err(|err| EnvelopeError::EncodePayload {
            codec: codec.to_string(),
            source: err.to_string(),
        }),
        "json" => serde_json::to_vec(value).map_err(|err| EnvelopeError::EncodePayload {
            codec: codec.to_string(),
            source: err.to_string(),
        }),
        other => Err(EnvelopeError::UnsupportedCodec(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize as _;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Sample {
        value: i64,
    }

    #[test]
    fn request_round_trips_through_msgpack() {
        let envelope = RequestEnvelope {
            request_id: 1,
            entry: "health".into(),
            timeout_ms: 1000,
            codec: "msgpack".into(),
            payload: Some(ByteBuf::from(encode_payload(&Sample { value: 7 }, "msgpack").unwrap())),
            payload_b64: None,
        };
        let bytes = rmp_serde::to_vec_named(&envelope).unwrap();
        let (decoded, wire) = decode_request_frame(&bytes).unwrap();
        assert_eq!(decoded.request_id, 1);
        assert!(matches!(wire, WireCodec::Msgpack));
        let sample: Sample = decode_payload(&decoded.payload_bytes().unwrap(), "msgpack").unwrap();
        assert_eq!(sample, Sample { value: 7 });
    }

    #[test]
    fn request_round_trips_through_json_with_b64_payload() {
        let payload = encode_payload(&Sample { value: 9 }, "json").unwrap();
        let json = serde_json::json!({
            "request_id": 2,
            "entry": "compute",
            "timeout_ms": 0,
            "codec": "json",
            "payload_b64": BASE64.encode(&payload),
        });
        let bytes = serde_json::to_vec(&json).unwrap();
        let (decoded, wire) = decode_request_frame(&bytes).unwrap();
        assert!(matches!(wire, WireCodec::Json));
        let sample: Sample = decode_payload(&decoded.payload_bytes().unwrap(), "json").unwrap();
        assert_eq!(sample, Sample { value: 9 });
    }

    #[test]
    fn response_round_trips_through_json() {
        let mut metrics = HashMap::new();
        metrics.insert("queue_us".to_string(), MetricValue::U64(5));
        let response = ResponseEnvelope::ok(42, b"abc".to_vec(), metrics);
        let bytes = encode_response_frame(&response, WireCodec::Json).unwrap();
        let decoded: ResponseEnvelopeJson = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.request_id, 42);
        assert!(matches!(decoded.status, Status::Ok));
        let payload = BASE64.decode(decoded.payload_b64.unwrap()).unwrap();
        assert_eq!(payload, b"abc");
    }

    #[test]
    fn unsupported_codec_is_rejected() {
        let err = encode_payload(&Sample { value: 1 }, "arrow_ipc").unwrap_err();
        assert!(matches!(err, EnvelopeError::UnsupportedCodec(_)));
    }

    #[test]
    fn client_request_round_trips_through_msgpack() {
        let request = RequestEnvelope {
            request_id: 11,
            entry: "health".into(),
            timeout_ms: 500,
            codec: "msgpack".into(),
            payload: Some(ByteBuf::from(encode_payload(&Sample { value: 3 }, "msgpack").unwrap())),
            payload_b64: None,
        };
        let bytes = encode_request_frame(&request, WireCodec::Msgpack).unwrap();
        let (decoded, wire) = decode_request_frame(&bytes).unwrap();
        assert_eq!(decoded.request_id, 11);
        assert!(matches!(wire, WireCodec::Msgpack));
        let sample: Sample = decode_payload(&decoded.payload_bytes().unwrap(), "msgpack").unwrap();
        assert_eq!(sample, Sample { value: 3 });
    }

    #[test]
    fn client_request_round_trips_through_json() {
        let request = RequestEnvelope {
            request_id: 12,
            entry: "compute".into(),
            timeout_ms: 500,
            codec: "json".into(),
            payload: Some(ByteBuf::from(encode_payload(&Sample { value: 4 }, "json").unwrap())),
            payload_b64: None,
        };
        let bytes = encode_request_frame(&request, WireCodec::Json).unwrap();
        let (decoded, wire) = decode_request_frame(&bytes).unwrap();
        assert_eq!(decoded.request_id, 12);
        assert!(matches!(wire, WireCodec::Json));
        let sample: Sample = decode_payload(&decoded.payload_bytes().unwrap(), "json").unwrap();
        assert_eq!(sample, Sample { value: 4 });
    }

    #[test]
    fn client_decodes_response_from_either_wire() {
        let mut metrics = HashMap::new();
        metrics.insert("queue_us".to_string(), MetricValue::U64(1));
        let response = ResponseEnvelope::ok(5, b"xyz".to_vec(), metrics);

        let msgpack_bytes = encode_response_frame(&response, WireCodec::Msgpack).unwrap();
        let decoded = decode_response_frame(&msgpack_bytes).unwrap();
        assert_eq!(decoded.request_id, 5);
        assert_eq!(decoded.payload.unwrap().into_vec(), b"xyz".to_vec());

        let json_bytes = encode_response_frame(&response, WireCodec::Json).unwrap();
        let decoded = decode_response_frame(&json_bytes).unwrap();
        assert_eq!(decoded.request_id, 5);
        assert_eq!(decoded.payload.unwrap().into_vec(), b"xyz".to_vec());
    }
}
