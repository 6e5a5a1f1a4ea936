//! Wire framing for client-bound frames.
//!
//! A frame is a 4-byte big-endian length prefix, a 4-byte frame header and
//! an rkyv-encoded envelope. The payload offset stays 8-byte aligned so the
//! archived envelope can be accessed in place on the receiving side.

use bytes::Bytes;
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

use crate::message::{Message, MessageKind};
use crate::{GatewayError, Result};

pub const LENGTH_PREFIX_LEN: usize = 4;
pub const CLIENT_HEADER_LEN: usize = 4; // kind(1) + pad(3)
pub const CLIENT_FRAME_HEADER_LEN: usize = LENGTH_PREFIX_LEN + CLIENT_HEADER_LEN;

pub fn write_client_frame_header(
    kind: MessageKind,
    payload_len: usize,
) -> [u8; CLIENT_FRAME_HEADER_LEN] {
    let total_size = CLIENT_HEADER_LEN + payload_len;
    let mut header = [0u8; CLIENT_FRAME_HEADER_LEN];
    header[..4].copy_from_slice(&(total_size as u32).to_be_bytes());
    header[4] = kind as u8;
    header[5] = 0;
    header[6] = 0;
    header[7] = 0;
    header
}

/// Envelope as it crosses the wire. Identities travel in display form; the
/// body is opaque.
#[derive(Archive, RkyvSerialize, RkyvDeserialize, Debug, Clone, PartialEq)]
pub struct WireEnvelope {
    pub kind: u8,
    pub id: u64,
    pub sender: String,
    pub target: String,
    pub sending_silo: Option<String>,
    pub target_silo: Option<String>,
    pub rejection: Option<WireRejection>,
    pub body: Vec<u8>,
}

#[derive(Archive, RkyvSerialize, RkyvDeserialize, Debug, Clone, PartialEq)]
pub struct WireRejection {
    pub kind: u8,
    pub reason: String,
}

impl WireEnvelope {
    fn from_message(message: &Message) -> Self {
        Self {
            kind: message.kind as u8,
            id: message.id,
            sender: message.sender.to_string(),
            target: message.target.to_string(),
            sending_silo: message.sending_silo.map(|s| s.to_string()),
            target_silo: message.target_silo.map(|s| s.to_string()),
            rejection: message.rejection.as_ref().map(|r| WireRejection {
                kind: r.kind as u8,
                reason: r.reason.clone(),
            }),
            body: message.body.to_vec(),
        }
    }
}

/// A serialized frame ready for the socket: ordered buffers, the first
/// `header_len` bytes of which are framing.
#[derive(Debug, Clone)]
pub struct SerializedFrame {
    pub buffers: Vec<Bytes>,
    pub header_len: usize,
}

impl SerializedFrame {
    pub fn total_len(&self) -> usize {
        self.buffers.iter().map(|b| b.len()).sum()
    }
}

/// Serializer seam between the gateway and the wire format.
pub trait MessageSerializer: Send + Sync {
    fn serialize(&self, message: &Message) -> Result<SerializedFrame>;

    /// Serialize a batch; failures are reported per message so the caller
    /// can drop the poisoned ones and still send the rest.
    fn serialize_batch(&self, messages: &[Message]) -> Vec<Result<SerializedFrame>> {
        messages.iter().map(|m| self.serialize(m)).collect()
    }
}

/// Default codec: rkyv envelope behind the client frame header.
#[derive(Debug, Clone)]
pub struct EnvelopeSerializer {
    max_frame_size: usize,
}

impl EnvelopeSerializer {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for EnvelopeSerializer {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MAX_FRAME_SIZE)
    }
}

impl MessageSerializer for EnvelopeSerializer {
    fn serialize(&self, message: &Message) -> Result<SerializedFrame> {
        let envelope = WireEnvelope::from_message(message);
        let payload = rkyv::to_bytes::<rkyv::rancor::Error>(&envelope)?;

        let size = CLIENT_FRAME_HEADER_LEN + payload.len();
        if size > self.max_frame_size {
            return Err(GatewayError::MessageTooLarge {
                size,
                max: self.max_frame_size,
            });
        }

        let header = write_client_frame_header(message.kind, payload.len());
        Ok(SerializedFrame {
            buffers: vec![
                Bytes::copy_from_slice(&header),
                Bytes::copy_from_slice(&payload),
            ],
            header_len: CLIENT_FRAME_HEADER_LEN,
        })
    }
}

/// Decode one frame produced by [`EnvelopeSerializer`]. Used by the client
/// side of the wire and by tests observing sent bytes.
pub fn decode_client_frame(frame: &[u8]) -> Result<(MessageKind, WireEnvelope)> {
    if frame.len() < CLIENT_FRAME_HEADER_LEN {
        return Err(GatewayError::Network(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "frame shorter than header",
        )));
    }
    let mut len_bytes = [0u8; LENGTH_PREFIX_LEN];
    len_bytes.copy_from_slice(&frame[..LENGTH_PREFIX_LEN]);
    let total = u32::from_be_bytes(len_bytes) as usize;
    if frame.len() < LENGTH_PREFIX_LEN + total {
        return Err(GatewayError::Network(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "frame shorter than its length prefix",
        )));
    }
    let kind = MessageKind::from_byte(frame[4]).ok_or_else(|| {
        GatewayError::Network(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unknown frame kind {}", frame[4]),
        ))
    })?;

    // Copy into an aligned buffer; the slice offset inside `frame` carries
    // no alignment guarantee.
    let payload = &frame[CLIENT_FRAME_HEADER_LEN..LENGTH_PREFIX_LEN + total];
    let mut aligned = rkyv::util::AlignedVec::<16>::new();
    aligned.extend_from_slice(payload);
    let envelope = rkyv::from_bytes::<WireEnvelope, rkyv::rancor::Error>(&aligned)?;
    Ok((kind, envelope))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ActorId, RejectionKind};
    use crate::{ClientId, SiloAddress};

    const ALIGNMENT: usize = 8;

    fn is_aligned(offset: usize) -> bool {
        offset % ALIGNMENT == 0
    }

    fn sample_message() -> Message {
        let client = ClientId::new("c1");
        Message::request(
            ActorId::grain(9),
            ActorId::client_object(client, 3),
            Bytes::from_static(b"hello"),
        )
        .with_sending_silo(SiloAddress::new("10.0.0.1:4000".parse().unwrap(), 1))
    }

    #[test]
    fn client_payload_offset_aligned_with_length_prefix() {
        assert!(is_aligned(LENGTH_PREFIX_LEN + CLIENT_HEADER_LEN));
    }

    #[test]
    fn write_client_frame_header_sets_length_and_pad() {
        let payload_len = 11;
        let header = write_client_frame_header(MessageKind::Request, payload_len);
        let total = (CLIENT_HEADER_LEN + payload_len) as u32;
        assert_eq!(u32::from_be_bytes(header[0..4].try_into().unwrap()), total);
        assert_eq!(header[4], MessageKind::Request as u8);
        assert_eq!(&header[5..8], &[0u8; 3]);
    }

    #[test]
    fn serialize_then_decode_preserves_envelope() {
        let message = sample_message();
        let frame = EnvelopeSerializer::default()
            .serialize(&message)
            .expect("serialize");
        assert_eq!(frame.header_len, CLIENT_FRAME_HEADER_LEN);

        let bytes: Vec<u8> = frame.buffers.concat();
        let (kind, envelope) = decode_client_frame(&bytes).expect("decode");
        assert_eq!(kind, MessageKind::Request);
        assert_eq!(envelope.id, message.id);
        assert_eq!(envelope.sender, "grain-9");
        assert_eq!(envelope.target, "obs-c1-3");
        assert_eq!(envelope.sending_silo.as_deref(), Some("S10.0.0.1:4000:1"));
        assert_eq!(envelope.target_silo, None);
        assert_eq!(envelope.body, b"hello");
    }

    #[test]
    fn serialize_carries_rejection() {
        let rejection = sample_message().to_rejection(RejectionKind::Unrecoverable, "no route");
        let frame = EnvelopeSerializer::default()
            .serialize(&rejection)
            .expect("serialize");
        let bytes: Vec<u8> = frame.buffers.concat();
        let (kind, envelope) = decode_client_frame(&bytes).expect("decode");
        assert_eq!(kind, MessageKind::Response);
        let wire_rejection = envelope.rejection.expect("rejection");
        assert_eq!(wire_rejection.kind, RejectionKind::Unrecoverable as u8);
        assert_eq!(wire_rejection.reason, "no route");
    }

    #[test]
    fn oversized_message_is_a_serialization_failure() {
        let serializer = EnvelopeSerializer::new(64);
        let mut message = sample_message();
        message.body = Bytes::from(vec![0u8; 1024]);
        let err = serializer.serialize(&message).unwrap_err();
        assert!(err.is_serialization_failure());
    }

    #[test]
    fn decode_rejects_truncated_frames() {
        let message = sample_message();
        let frame = EnvelopeSerializer::default()
            .serialize(&message)
            .expect("serialize");
        let bytes: Vec<u8> = frame.buffers.concat();
        assert!(decode_client_frame(&bytes[..6]).is_err());
        assert!(decode_client_frame(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn batch_serialization_reports_per_message_errors() {
        let serializer = EnvelopeSerializer::new(512);
        let good = sample_message();
        let mut bad = sample_message();
        bad.body = Bytes::from(vec![0u8; 4096]);

        let results = serializer.serialize_batch(&[good, bad]);
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(results[1].as_ref().unwrap_err().is_serialization_failure());
    }
}
