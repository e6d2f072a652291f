//! Probe payload structure and wire codec.
//!
//! The payload is a fixed 96-byte record exchanged in both directions:
//! the requester sends it as a REQUEST, the responder fills in its own
//! observations and returns it as a RESPONSE. All multi-byte fields are
//! serialized in network byte order.
//!
//! Wire format:
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                             Magic                             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    Version    |     Type      |             Port              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | TTL requester | TTL seen      | TTL responder | IP version    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |        Extended Length        |            MBZ                |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Sequence Number                        |
//! |                        Sequence Length                        |
//! |                     Address (low, high)                       |
//! |                 Requester Key / Responder Key                 |
//! |          4 x 64-bit timestamps (mono/real, sent/recv)         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol family identifier; foreign datagrams never match it.
pub const MAGIC: u32 = 0x5052_4F42; // "PROB"

/// Compiled payload format version. No backward compatibility is
/// attempted: a mismatch rejects the datagram.
pub const FORMAT_VERSION: u8 = 1;

/// Mandatory payload size in bytes. Both ends know this constant.
pub const PAYLOAD_SIZE: usize = 96;

/// Direction of a probe payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Probe emitted by the requester.
    Request,
    /// Answer emitted by the responder.
    Response,
}

impl MessageType {
    /// Wire encoding of the message type.
    pub const fn wire(self) -> u8 {
        match self {
            MessageType::Request => 1,
            MessageType::Response => 2,
        }
    }

    /// Parses the wire encoding back into a type.
    pub const fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(MessageType::Request),
            2 => Some(MessageType::Response),
            _ => None,
        }
    }
}

/// Validation errors, in check order. The first failing check wins and
/// no further checks run.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadError {
    /// Datagram length differs from the mandatory payload size.
    #[error("payload size {0} differs from mandatory {PAYLOAD_SIZE} bytes")]
    SizeMismatch(usize),

    /// Magic constant does not identify this protocol family.
    #[error("bad magic 0x{0:08x}")]
    BadMagic(u32),

    /// Format version differs from the compiled version.
    #[error("unsupported format version {0}")]
    BadVersion(u8),

    /// Message type is unknown or not the expected direction.
    #[error("unexpected message type {0}")]
    BadType(u8),
}

/// The probe payload in host byte order.
///
/// `message_type` is kept as the raw wire byte so that an invalid type
/// survives decoding and is rejected by [`verify`] in its defined
/// position, after the magic and version checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbePayload {
    /// Protocol family constant, see [`MAGIC`].
    pub magic: u32,
    /// Payload format version, see [`FORMAT_VERSION`].
    pub format_version: u8,
    /// Raw message type byte, see [`MessageType`].
    pub message_type: u8,
    /// UDP port the requester is using (informational).
    pub port: u16,
    /// TTL/Hop-Limit configured on the requester's socket.
    pub ttl_sent_by_requester: u8,
    /// TTL/Hop-Limit the responder observed on the incoming probe.
    pub ttl_seen_by_responder: u8,
    /// TTL/Hop-Limit configured on the responder's socket.
    pub ttl_sent_by_responder: u8,
    /// 4 or 6; disambiguates the address halves.
    pub ip_version: u8,
    /// Declared total payload size; written as [`PAYLOAD_SIZE`].
    pub extended_length: u16,
    /// Position of this probe within the round sequence.
    pub sequence_number: u64,
    /// Total number of rounds in the sequence.
    pub sequence_length: u64,
    /// Low half of the target address.
    pub address_low: u64,
    /// High half of the target address (zero for IPv4).
    pub address_high: u64,
    /// Caller-chosen (or random) requester identifier; responders may
    /// filter on it.
    pub requester_key: u64,
    /// Locally configured responder identifier signing the response.
    pub responder_key: u64,
    /// Steady-clock nanoseconds at requester departure.
    pub monotonic_time_sent: u64,
    /// Wall-clock nanoseconds at requester departure.
    pub real_time_sent: u64,
    /// Steady-clock nanoseconds at responder arrival.
    pub monotonic_time_received: u64,
    /// Wall-clock nanoseconds at responder arrival.
    pub real_time_received: u64,
}

impl ProbePayload {
    /// Serializes the payload to its 96-byte network byte order form.
    pub fn to_bytes(&self) -> [u8; PAYLOAD_SIZE] {
        let mut buf = [0u8; PAYLOAD_SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_be_bytes());
        buf[4] = self.format_version;
        buf[5] = self.message_type;
        buf[6..8].copy_from_slice(&self.port.to_be_bytes());
        buf[8] = self.ttl_sent_by_requester;
        buf[9] = self.ttl_seen_by_responder;
        buf[10] = self.ttl_sent_by_responder;
        buf[11] = self.ip_version;
        buf[12..14].copy_from_slice(&self.extended_length.to_be_bytes());
        // bytes 14..16 are MBZ padding
        buf[16..24].copy_from_slice(&self.sequence_number.to_be_bytes());
        buf[24..32].copy_from_slice(&self.sequence_length.to_be_bytes());
        buf[32..40].copy_from_slice(&self.address_low.to_be_bytes());
        buf[40..48].copy_from_slice(&self.address_high.to_be_bytes());
        buf[48..56].copy_from_slice(&self.requester_key.to_be_bytes());
        buf[56..64].copy_from_slice(&self.responder_key.to_be_bytes());
        buf[64..72].copy_from_slice(&self.monotonic_time_sent.to_be_bytes());
        buf[72..80].copy_from_slice(&self.real_time_sent.to_be_bytes());
        buf[80..88].copy_from_slice(&self.monotonic_time_received.to_be_bytes());
        buf[88..96].copy_from_slice(&self.real_time_received.to_be_bytes());
        buf
    }

    /// Deserializes a payload from network byte order.
    ///
    /// # Errors
    /// Returns `PayloadError::SizeMismatch` if the buffer is smaller
    /// than the mandatory size.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, PayloadError> {
        if buf.len() < PAYLOAD_SIZE {
            return Err(PayloadError::SizeMismatch(buf.len()));
        }
        Ok(Self {
            magic: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            format_version: buf[4],
            message_type: buf[5],
            port: u16::from_be_bytes(buf[6..8].try_into().unwrap()),
            ttl_sent_by_requester: buf[8],
            ttl_seen_by_responder: buf[9],
            ttl_sent_by_responder: buf[10],
            ip_version: buf[11],
            extended_length: u16::from_be_bytes(buf[12..14].try_into().unwrap()),
            sequence_number: u64::from_be_bytes(buf[16..24].try_into().unwrap()),
            sequence_length: u64::from_be_bytes(buf[24..32].try_into().unwrap()),
            address_low: u64::from_be_bytes(buf[32..40].try_into().unwrap()),
            address_high: u64::from_be_bytes(buf[40..48].try_into().unwrap()),
            requester_key: u64::from_be_bytes(buf[48..56].try_into().unwrap()),
            responder_key: u64::from_be_bytes(buf[56..64].try_into().unwrap()),
            monotonic_time_sent: u64::from_be_bytes(buf[64..72].try_into().unwrap()),
            real_time_sent: u64::from_be_bytes(buf[72..80].try_into().unwrap()),
            monotonic_time_received: u64::from_be_bytes(buf[80..88].try_into().unwrap()),
            real_time_received: u64::from_be_bytes(buf[88..96].try_into().unwrap()),
        })
    }
}

/// Validates an inbound datagram and decodes it on success.
///
/// Checks run in fixed order and short-circuit on the first failure:
/// exact byte length, magic, format version, message type. The caller
/// maps each [`PayloadError`] kind to its own statistics counter; this
/// function itself has no side effects.
pub fn verify(buf: &[u8], expected: MessageType) -> Result<ProbePayload, PayloadError> {
    if buf.len() != PAYLOAD_SIZE {
        return Err(PayloadError::SizeMismatch(buf.len()));
    }
    let payload = ProbePayload::from_bytes(buf)?;
    if payload.magic != MAGIC {
        return Err(PayloadError::BadMagic(payload.magic));
    }
    if payload.format_version != FORMAT_VERSION {
        return Err(PayloadError::BadVersion(payload.format_version));
    }
    if payload.message_type != expected.wire() {
        return Err(PayloadError::BadType(payload.message_type));
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload() -> ProbePayload {
        ProbePayload {
            magic: MAGIC,
            format_version: FORMAT_VERSION,
            message_type: MessageType::Request.wire(),
            port: 7373,
            ttl_sent_by_requester: 64,
            ttl_seen_by_responder: 57,
            ttl_sent_by_responder: 64,
            ip_version: 4,
            extended_length: PAYLOAD_SIZE as u16,
            sequence_number: 3,
            sequence_length: 10,
            address_low: 0x0100_007f,
            address_high: 0,
            requester_key: 0xDEAD_BEEF_CAFE_BABE,
            responder_key: 42,
            monotonic_time_sent: 1_000_000,
            real_time_sent: 1_700_000_000_000_000_000,
            monotonic_time_received: 0,
            real_time_received: 0,
        }
    }

    #[test]
    fn test_round_trip_preserves_all_fields() {
        let payload = sample_payload();
        let restored = ProbePayload::from_bytes(&payload.to_bytes()).unwrap();
        assert_eq!(payload, restored);
    }

    #[test]
    fn test_serialized_size() {
        assert_eq!(sample_payload().to_bytes().len(), PAYLOAD_SIZE);
    }

    #[test]
    fn test_magic_big_endian_at_offset_zero() {
        let bytes = sample_payload().to_bytes();
        assert_eq!(&bytes[0..4], &[0x50, 0x52, 0x4F, 0x42]);
    }

    #[test]
    fn test_sequence_number_big_endian() {
        let mut payload = sample_payload();
        payload.sequence_number = 0x0102_0304_0506_0708;
        let bytes = payload.to_bytes();
        assert_eq!(
            &bytes[16..24],
            &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]
        );
    }

    #[test]
    fn test_padding_bytes_are_zero() {
        let bytes = sample_payload().to_bytes();
        assert_eq!(&bytes[14..16], &[0, 0]);
    }

    #[test]
    fn test_timestamps_at_tail_offsets() {
        let mut payload = sample_payload();
        payload.real_time_received = 0xAABB_CCDD_EEFF_0011;
        let bytes = payload.to_bytes();
        assert_eq!(
            &bytes[88..96],
            &[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x00, 0x11]
        );
    }

    #[test]
    fn test_verify_accepts_well_formed_request() {
        let bytes = sample_payload().to_bytes();
        let payload = verify(&bytes, MessageType::Request).unwrap();
        assert_eq!(payload.sequence_number, 3);
        assert_eq!(payload.sequence_length, 10);
    }

    #[test]
    fn test_verify_rejects_short_datagram_first() {
        // A short buffer with garbage everywhere must fail the size
        // check, not any later one.
        let bytes = [0xFFu8; PAYLOAD_SIZE - 1];
        assert_eq!(
            verify(&bytes, MessageType::Request),
            Err(PayloadError::SizeMismatch(PAYLOAD_SIZE - 1))
        );
    }

    #[test]
    fn test_verify_rejects_oversized_datagram() {
        let mut bytes = sample_payload().to_bytes().to_vec();
        bytes.push(0);
        assert_eq!(
            verify(&bytes, MessageType::Request),
            Err(PayloadError::SizeMismatch(PAYLOAD_SIZE + 1))
        );
    }

    #[test]
    fn test_verify_rejects_bad_magic_before_version() {
        let mut payload = sample_payload();
        payload.magic = 0x1234_5678;
        payload.format_version = 99; // also wrong, but magic wins
        assert_eq!(
            verify(&payload.to_bytes(), MessageType::Request),
            Err(PayloadError::BadMagic(0x1234_5678))
        );
    }

    #[test]
    fn test_verify_rejects_bad_version_before_type() {
        let mut payload = sample_payload();
        payload.format_version = 99;
        payload.message_type = 0xEE; // also wrong, but version wins
        assert_eq!(
            verify(&payload.to_bytes(), MessageType::Request),
            Err(PayloadError::BadVersion(99))
        );
    }

    #[test]
    fn test_verify_rejects_unexpected_type() {
        let payload = sample_payload();
        assert_eq!(
            verify(&payload.to_bytes(), MessageType::Response),
            Err(PayloadError::BadType(MessageType::Request.wire()))
        );
    }

    #[test]
    fn test_message_type_wire_round_trip() {
        for mt in [MessageType::Request, MessageType::Response] {
            assert_eq!(MessageType::from_wire(mt.wire()), Some(mt));
        }
        assert_eq!(MessageType::from_wire(0), None);
        assert_eq!(MessageType::from_wire(3), None);
    }

    #[test]
    fn test_key_boundary_values_round_trip() {
        for key in [0u64, 1, u64::MAX / 2, u64::MAX] {
            let mut payload = sample_payload();
            payload.requester_key = key;
            payload.responder_key = key;
            let restored = ProbePayload::from_bytes(&payload.to_bytes()).unwrap();
            assert_eq!(restored.requester_key, key);
            assert_eq!(restored.responder_key, key);
        }
    }
}
