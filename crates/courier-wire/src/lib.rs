// Wire protocol for talking to a courier routing server.
//
// Messages are a tagged union (`Envelope`) carried in length-prefixed frames.
// Payload bytes are opaque to this crate and travel base64-encoded inside the
// JSON body; the routing server never interprets them either.
use base64::Engine;
use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

pub const MAGIC: u32 = 0x43555231; // "CUR1"
pub const VERSION: u16 = 1;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid magic number")]
    InvalidMagic,
    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),
    #[error("frame too large")]
    FrameTooLarge,
    #[error("incomplete frame")]
    Incomplete,
    #[error("failed to serialize message")]
    Serialize(serde_json::Error),
    #[error("failed to deserialize message")]
    Deserialize(serde_json::Error),
}

/// The three long-lived stream kinds a client holds toward the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Command,
    Query,
    QueryUpdate,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Command => "command",
            MessageKind::Query => "query",
            MessageKind::QueryUpdate => "query_update",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    pub version: u16,
    pub kind: u16,
    pub length: u32,
}

impl FrameHeader {
    pub const LEN: usize = 12;

    pub fn new(kind: u16, length: u32) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            kind,
            length,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        // Network byte order throughout for portability.
        buf.extend_from_slice(&self.magic.to_be_bytes());
        buf.extend_from_slice(&self.version.to_be_bytes());
        buf.extend_from_slice(&self.kind.to_be_bytes());
        buf.extend_from_slice(&self.length.to_be_bytes());
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        // Validate the header before trusting the declared length.
        if buf.remaining() < Self::LEN {
            return Err(Error::Incomplete);
        }
        let magic = buf.get_u32();
        if magic != MAGIC {
            return Err(Error::InvalidMagic);
        }
        let version = buf.get_u16();
        if version != VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let kind = buf.get_u16();
        let length = buf.get_u32();
        Ok(Self {
            magic,
            version,
            kind,
            length,
        })
    }
}

/// Frame containing a header and payload.
///
/// ```
/// use bytes::Bytes;
/// use courier_wire::Frame;
///
/// let frame = Frame::new(0, Bytes::from_static(b"hello")).expect("frame");
/// let encoded = frame.encode();
/// let decoded = Frame::decode(encoded).expect("decode");
/// assert_eq!(decoded.payload, Bytes::from_static(b"hello"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: u16, payload: Bytes) -> Result<Self> {
        if payload.len() > u32::MAX as usize {
            return Err(Error::FrameTooLarge);
        }
        Ok(Self {
            header: FrameHeader::new(kind, payload.len() as u32),
            payload,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FrameHeader::LEN + self.payload.len());
        self.header.encode(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(input: Bytes) -> Result<Self> {
        if input.len() < FrameHeader::LEN {
            return Err(Error::Incomplete);
        }
        let header = FrameHeader::decode(input.slice(0..FrameHeader::LEN))?;
        let length = header.length as usize;
        if input.len() < FrameHeader::LEN + length {
            return Err(Error::Incomplete);
        }
        let payload = input.slice(FrameHeader::LEN..FrameHeader::LEN + length);
        Ok(Self { header, payload })
    }
}

/// Remote error details carried in failure responses and exceptional
/// update completions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

/// V1 protocol messages for all three stream kinds.
///
/// ```
/// use courier_wire::Envelope;
///
/// let message = Envelope::FlowControl { permits: 500 };
/// let frame = message.encode().expect("encode");
/// let decoded = Envelope::decode(frame).expect("decode");
/// assert_eq!(message, decoded);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    // Announce one more local handler for `name`; `handler_count` is the
    // total after this registration so the server can weigh routing.
    Subscribe {
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        result_name: Option<String>,
        component_id: String,
        handler_count: u32,
        correlation_id: String,
    },
    // Withdraw a handler registration; same fields as Subscribe.
    Unsubscribe {
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        result_name: Option<String>,
        component_id: String,
        handler_count: u32,
        correlation_id: String,
    },
    // Grant the server budget to route `permits` more data items to us.
    FlowControl {
        permits: u64,
    },
    // A routed request the server wants this client to execute.
    Request {
        id: String,
        name: String,
        priority: i64,
        #[serde(with = "base64_bytes")]
        payload: Bytes,
    },
    // One result for a request; carries either a payload or an error.
    Response {
        request_id: String,
        #[serde(with = "base64_option_bytes")]
        payload: Option<Bytes>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorInfo>,
    },
    // No further responses will follow for `request_id`.
    ResponseComplete {
        request_id: String,
    },
    // Open a live subscription query; updates arrive as UpdateEvent.
    SubscriptionRequest {
        subscription_id: String,
        name: String,
        #[serde(with = "base64_bytes")]
        payload: Bytes,
    },
    // Stop a live subscription query; best-effort, not acknowledged.
    SubscriptionCancel {
        subscription_id: String,
    },
    // Incremental update pushed for a live subscription query.
    UpdateEvent {
        subscription_id: String,
        #[serde(with = "base64_bytes")]
        payload: Bytes,
    },
    // The server closed the update stream for this subscription normally.
    UpdateComplete {
        subscription_id: String,
    },
    // The server closed the update stream with an error.
    UpdateCompleteExceptionally {
        subscription_id: String,
        error: ErrorInfo,
    },
}

impl Envelope {
    pub fn encode(&self) -> Result<Frame> {
        let payload = serde_json::to_vec(self).map_err(Error::Serialize)?;
        Frame::new(0, Bytes::from(payload))
    }

    pub fn decode(frame: Frame) -> Result<Self> {
        serde_json::from_slice(&frame.payload).map_err(Error::Deserialize)
    }

    /// Successful response, with or without a result payload.
    pub fn response_ok(request_id: impl Into<String>, payload: Option<Bytes>) -> Self {
        Envelope::Response {
            request_id: request_id.into(),
            payload,
            error: None,
        }
    }

    /// Failure response carrying a remote error code and message.
    pub fn response_error(
        request_id: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Envelope::Response {
            request_id: request_id.into(),
            payload: None,
            error: Some(ErrorInfo {
                code: code.into(),
                message: message.into(),
            }),
        }
    }
}

mod base64_bytes {
    use super::*;
    use serde::de::Error;

    // Encode Bytes as a base64 string for JSON payloads.
    pub fn serialize<S>(value: &Bytes, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let encoded = base64::engine::general_purpose::STANDARD.encode(value);
        serializer.serialize_str(&encoded)
    }

    // Decode a base64 string into Bytes.
    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Bytes, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(D::Error::custom)?;
        Ok(Bytes::from(decoded))
    }
}

mod base64_option_bytes {
    use super::*;
    use serde::de::Error;

    // Encode Option<Bytes> as a nullable base64 string.
    pub fn serialize<S>(
        value: &Option<Bytes>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match value {
            Some(bytes) => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
                serializer.serialize_some(&encoded)
            }
            None => serializer.serialize_none(),
        }
    }

    // Decode an optional base64 string into Option<Bytes>.
    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Option<Bytes>, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let encoded = Option::<String>::deserialize(deserializer)?;
        match encoded {
            Some(value) => base64::engine::general_purpose::STANDARD
                .decode(value.as_bytes())
                .map(|decoded| Some(Bytes::from(decoded)))
                .map_err(D::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        // Encoding then decoding should preserve header and payload.
        let frame = Frame::new(0, Bytes::from_static(b"hello")).expect("frame");
        let encoded = frame.encode();
        let decoded = Frame::decode(encoded).expect("decode");
        assert_eq!(decoded.payload, Bytes::from_static(b"hello"));
    }

    #[test]
    fn decode_rejects_invalid_magic() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&0xDEADBEEFu32.to_be_bytes());
        buf.extend_from_slice(&VERSION.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        let err = FrameHeader::decode(buf.freeze()).expect_err("invalid magic");
        assert!(matches!(err, Error::InvalidMagic));
    }

    #[test]
    fn decode_rejects_unsupported_version() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&MAGIC.to_be_bytes());
        buf.extend_from_slice(&0xFFFFu16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        let err = FrameHeader::decode(buf.freeze()).expect_err("unsupported version");
        assert!(matches!(err, Error::UnsupportedVersion(0xFFFF)));
    }

    #[test]
    fn decode_rejects_incomplete_payload() {
        let header = FrameHeader {
            magic: MAGIC,
            version: VERSION,
            kind: 0,
            length: 5,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        buf.extend_from_slice(b"hi");
        let err = Frame::decode(buf.freeze()).expect_err("incomplete payload");
        assert!(matches!(err, Error::Incomplete));
    }

    #[test]
    fn subscribe_round_trip() {
        let message = Envelope::Subscribe {
            name: "place-order".to_string(),
            result_name: None,
            component_id: "orders-service".to_string(),
            handler_count: 2,
            correlation_id: "c-1".to_string(),
        };
        let frame = message.encode().expect("encode");
        let decoded = Envelope::decode(frame).expect("decode");
        assert_eq!(message, decoded);
    }

    #[test]
    fn request_payload_survives_base64() {
        let message = Envelope::Request {
            id: "r-1".to_string(),
            name: "find-order".to_string(),
            priority: 10,
            payload: Bytes::from_static(b"\x00\x01binary\xFF"),
        };
        let frame = message.encode().expect("encode");
        let decoded = Envelope::decode(frame).expect("decode");
        assert_eq!(message, decoded);
    }

    #[test]
    fn response_error_carries_code_and_message() {
        let message = Envelope::response_error("r-2", "COURIER-4002", "no handler");
        let frame = message.encode().expect("encode");
        match Envelope::decode(frame).expect("decode") {
            Envelope::Response {
                request_id,
                payload,
                error: Some(error),
            } => {
                assert_eq!(request_id, "r-2");
                assert!(payload.is_none());
                assert_eq!(error.code, "COURIER-4002");
                assert_eq!(error.message, "no handler");
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn response_without_payload_omits_error_field() {
        let message = Envelope::response_ok("r-3", None);
        let frame = message.encode().expect("encode");
        let text = String::from_utf8(frame.payload.to_vec()).expect("utf8");
        assert!(!text.contains("error"));
    }
}
