//! Shared wire protocol for the Molt worker and offload client: framing and
//! envelope (de)serialization/codec negotiation. The export manifest lives
//! in `molt-worker::registry` since it is worker-side policy, not wire
//! format.

pub mod envelope;
pub mod frame;

pub use envelope::{
    decode_payload, decode_request_frame, decode_response_frame, encode_payload,
    encode_request_frame, encode_response_frame, CancelRequest, Codec, EnvelopeError, MetricValue,
    RequestEnvelope, ResponseEnvelope, Status, WireCodec, CANCEL_ENTRY, HEALTH_ENTRY,
};
pub use frame::{read_frame, read_frame_async, write_frame, write_frame_async, FrameError, DEFAULT_MAX_FRAME_BYTES};
