//! Frame encoding and decoding.
//!
//! A frame is `'-'`, the base64 encoding of a JSON envelope, then `'.'`:
//!
//! ```text
//! -eyJkYXRhIjpudWxsLCJtZXRhZGF0YSI6eyJldmVudFR5cGUiOiJwaW5nIn19.
//!  base64({"data":null,"metadata":{"eventType":"ping"}})
//! ```
//!
//! The payload is base64 encoded on its own before it is placed in `data`.
//! The standard base64 alphabet (`A-Z a-z 0-9 + / =`) contains neither
//! delimiter, so frame bodies never need escaping.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::types::{EventSockError, MalformedFrame, Packet, FRAME_END, FRAME_START};

/// JSON document carried inside a frame body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Base64 encoded payload, `null` when the packet has none.
    pub data: Option<String>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(rename = "eventType")]
    pub event_type: String,
}

impl Envelope {
    pub fn new(event_type: &str, payload: Option<&[u8]>) -> Self {
        Self {
            data: payload.map(|p| STANDARD.encode(p)),
            metadata: Metadata {
                event_type: event_type.to_string(),
            },
        }
    }
}

/// Encode a packet into a complete frame, delimiters included.
pub fn encode_frame(event_type: &str, payload: Option<&[u8]>) -> Result<Bytes, EventSockError> {
    let mut buf = BytesMut::new();
    encode_frame_into(event_type, payload, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a packet and append the frame to `dst`.
pub fn encode_frame_into(
    event_type: &str,
    payload: Option<&[u8]>,
    dst: &mut BytesMut,
) -> Result<(), EventSockError> {
    let json = serde_json::to_vec(&Envelope::new(event_type, payload))?;

    let body_len = base64::encoded_len(json.len(), true).unwrap_or_default();
    dst.reserve(body_len + 2);
    dst.put_u8(FRAME_START);
    dst.put_slice(STANDARD.encode(&json).as_bytes());
    dst.put_u8(FRAME_END);
    Ok(())
}

/// Decode one frame body (the bytes between the delimiters) into a packet.
pub fn decode_frame(body: &[u8]) -> Result<Packet, MalformedFrame> {
    let json = STANDARD.decode(body).map_err(|_| MalformedFrame::Encoding)?;
    let envelope: Envelope =
        serde_json::from_slice(&json).map_err(|_| MalformedFrame::Envelope)?;

    let payload = match envelope.data {
        Some(data) => Some(Bytes::from(
            STANDARD.decode(data).map_err(|_| MalformedFrame::Payload)?,
        )),
        None => None,
    };

    Ok(Packet {
        event_type: envelope.metadata.event_type,
        payload,
    })
}
