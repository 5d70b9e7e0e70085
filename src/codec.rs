//! Wire codec: length-prefixed, HMAC-authenticated frames
//!
//! ```text
//! ┌────────────┬─────────────────┬──────────────────────────────────────────────┐
//! │   Length   │  HMAC-SHA256    │  Body                                        │
//! │  (4 bytes) │  (32 bytes,     │  dst_id(4) src_id(4) handle(8) reply_to(8)   │
//! │  BE u32    │  when keyed)    │  data(rest)                                  │
//! └────────────┴─────────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! The length counts everything after itself. All integers are big-endian.
//! The MAC covers the body only; the length is implicitly covered because a
//! wrong length shifts the body.

use crate::error::StreamError;
use crate::protocol::{ContextId, Handle, Message};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

/// Size of the length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Size of the MAC when authentication is enabled
pub const MAC_SIZE: usize = 32;

/// Fixed part of the body preceding the payload
pub const BODY_HEADER_SIZE: usize = 4 + 4 + 8 + 8;

/// Default maximum frame size (16MB to prevent memory exhaustion)
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Key size for frame authentication
pub const KEY_SIZE: usize = 32;

/// Shared secret authenticating one stream's frames
#[derive(Clone, PartialEq, Eq)]
pub struct AuthKey([u8; KEY_SIZE]);

impl AuthKey {
    /// Generate a fresh random key
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Hex form, used to pass the key through the bootstrap preamble
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != KEY_SIZE * 2 || !s.is_ascii() {
            return None;
        }
        let mut bytes = [0u8; KEY_SIZE];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Self(bytes))
    }
}

impl fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthKey(..)")
    }
}

/// Encodes and decodes frames for one stream
#[derive(Debug, Clone)]
pub struct Codec {
    key: Option<AuthKey>,
    max_frame_size: u32,
}

impl Codec {
    pub fn new(key: AuthKey) -> Self {
        Self {
            key: Some(key),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// A codec that neither writes nor checks MACs
    pub fn unauthenticated() -> Self {
        Self {
            key: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(mut self, max_frame_size: u32) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn is_authenticated(&self) -> bool {
        self.key.is_some()
    }

    fn mac_size(&self) -> usize {
        if self.key.is_some() {
            MAC_SIZE
        } else {
            0
        }
    }

    fn new_mac(key: &AuthKey) -> Result<HmacSha256, StreamError> {
        <HmacSha256 as Mac>::new_from_slice(key.as_bytes())
            .map_err(|e| StreamError::CorruptMessage(format!("invalid key: {}", e)))
    }

    /// Encode a message into a complete frame
    pub fn encode(&self, msg: &Message) -> Result<Vec<u8>, StreamError> {
        let frame_len = self.mac_size() + BODY_HEADER_SIZE + msg.data.len();
        if frame_len > self.max_frame_size as usize {
            return Err(StreamError::CorruptMessage(format!(
                "message too large: {} bytes (max {})",
                frame_len, self.max_frame_size
            )));
        }

        let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + frame_len);
        frame.extend_from_slice(&(frame_len as u32).to_be_bytes());

        // Reserve the MAC slot; it is filled once the body is written.
        let mac_start = frame.len();
        frame.resize(mac_start + self.mac_size(), 0);

        let body_start = frame.len();
        frame.extend_from_slice(&msg.dst_id.to_be_bytes());
        frame.extend_from_slice(&msg.src_id.to_be_bytes());
        frame.extend_from_slice(&msg.handle.to_be_bytes());
        frame.extend_from_slice(&msg.reply_to.to_be_bytes());
        frame.extend_from_slice(&msg.data);

        if let Some(key) = &self.key {
            let mut mac = Self::new_mac(key)?;
            mac.update(&frame[body_start..]);
            let tag = mac.finalize().into_bytes();
            frame[mac_start..body_start].copy_from_slice(&tag);
        }

        Ok(frame)
    }

    /// Try to decode one frame from the front of `buffer`
    ///
    /// Returns `Ok(None)` when more bytes are needed, or the message and
    /// the number of bytes it consumed.
    pub fn decode(&self, buffer: &[u8]) -> Result<Option<(Message, usize)>, StreamError> {
        if buffer.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let mut len_bytes = [0u8; LENGTH_PREFIX_SIZE];
        len_bytes.copy_from_slice(&buffer[..LENGTH_PREFIX_SIZE]);
        let frame_len = u32::from_be_bytes(len_bytes);

        // Validate length before waiting for the rest of the frame
        let min_len = self.mac_size() + BODY_HEADER_SIZE;
        if (frame_len as usize) < min_len {
            return Err(StreamError::CorruptMessage(format!(
                "frame length {} shorter than minimum {}",
                frame_len, min_len
            )));
        }
        if frame_len > self.max_frame_size {
            return Err(StreamError::CorruptMessage(format!(
                "frame length {} exceeds maximum {}",
                frame_len, self.max_frame_size
            )));
        }

        let total = LENGTH_PREFIX_SIZE + frame_len as usize;
        if buffer.len() < total {
            return Ok(None);
        }

        let frame = &buffer[LENGTH_PREFIX_SIZE..total];
        let (tag, body) = frame.split_at(self.mac_size());

        if let Some(key) = &self.key {
            let mut mac = Self::new_mac(key)?;
            mac.update(body);
            mac.verify_slice(tag)
                .map_err(|_| StreamError::CorruptMessage("MAC verification failed".to_string()))?;
        }

        let msg = Message {
            dst_id: read_u32(&body[0..4]),
            src_id: read_u32(&body[4..8]),
            handle: read_u64(&body[8..16]),
            reply_to: read_u64(&body[16..24]),
            data: body[BODY_HEADER_SIZE..].to_vec(),
        };

        Ok(Some((msg, total)))
    }
}

fn read_u32(bytes: &[u8]) -> ContextId {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_be_bytes(buf)
}

fn read_u64(bytes: &[u8]) -> Handle {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_be_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CALL_FUNCTION, IS_DEAD};

    fn sample() -> Message {
        Message::new(3, 0, CALL_FUNCTION, b"payload bytes".to_vec()).with_reply_to(1001)
    }

    #[test]
    fn test_round_trip_authenticated() {
        let codec = Codec::new(AuthKey::generate());
        let frame = codec.encode(&sample()).unwrap();
        let (decoded, consumed) = codec.decode(&frame).unwrap().unwrap();
        assert_eq!(decoded, sample());
        assert_eq!(consumed, frame.len());
    }

    #[test]
    fn test_round_trip_unauthenticated() {
        let codec = Codec::unauthenticated();
        let msg = Message::dead(1, 2, 5000);
        let frame = codec.encode(&msg).unwrap();
        assert_eq!(frame.len(), LENGTH_PREFIX_SIZE + BODY_HEADER_SIZE);
        let (decoded, _) = codec.decode(&frame).unwrap().unwrap();
        assert_eq!(decoded.reply_to, IS_DEAD);
    }

    #[test]
    fn test_length_prefix_is_big_endian() {
        let codec = Codec::unauthenticated();
        let frame = codec.encode(&Message::new(0, 0, 1, vec![0xAB; 3])).unwrap();
        assert_eq!(&frame[..4], &[0, 0, 0, (BODY_HEADER_SIZE + 3) as u8]);
    }

    #[test]
    fn test_partial_frame_needs_more() {
        let codec = Codec::new(AuthKey::generate());
        let frame = codec.encode(&sample()).unwrap();
        for cut in [0, 1, 3, 4, 20, frame.len() - 1] {
            assert!(codec.decode(&frame[..cut]).unwrap().is_none(), "cut at {}", cut);
        }
    }

    #[test]
    fn test_two_frames_back_to_back() {
        let codec = Codec::new(AuthKey::generate());
        let mut buffer = codec.encode(&sample()).unwrap();
        let second = Message::new(3, 0, 2000, vec![9; 100]);
        buffer.extend(codec.encode(&second).unwrap());

        let (first, used) = codec.decode(&buffer).unwrap().unwrap();
        assert_eq!(first, sample());
        let (next, rest) = codec.decode(&buffer[used..]).unwrap().unwrap();
        assert_eq!(next, second);
        assert_eq!(used + rest, buffer.len());
    }

    #[test]
    fn test_any_flipped_byte_is_rejected() {
        let codec = Codec::new(AuthKey::generate());
        let frame = codec.encode(&sample()).unwrap();
        // Every byte after the length prefix is covered by the MAC
        for i in LENGTH_PREFIX_SIZE..frame.len() {
            let mut corrupted = frame.clone();
            corrupted[i] ^= 0x01;
            match codec.decode(&corrupted) {
                Err(StreamError::CorruptMessage(_)) => {}
                other => panic!("byte {} not rejected: {:?}", i, other.map(|o| o.is_some())),
            }
        }
    }

    #[test]
    fn test_wrong_key_is_rejected() {
        let frame = Codec::new(AuthKey::generate()).encode(&sample()).unwrap();
        let result = Codec::new(AuthKey::generate()).decode(&frame);
        assert!(matches!(result, Err(StreamError::CorruptMessage(_))));
    }

    #[test]
    fn test_inconsistent_length_is_rejected() {
        let codec = Codec::new(AuthKey::generate());
        let short = 10u32.to_be_bytes();
        assert!(matches!(codec.decode(&short), Err(StreamError::CorruptMessage(_))));

        let huge = (DEFAULT_MAX_FRAME_SIZE + 1).to_be_bytes();
        assert!(matches!(codec.decode(&huge), Err(StreamError::CorruptMessage(_))));
    }

    #[test]
    fn test_encode_rejects_oversized() {
        let codec = Codec::unauthenticated().with_max_frame_size(64);
        let msg = Message::new(0, 0, 1, vec![0; 64]);
        assert!(codec.encode(&msg).is_err());
    }

    #[test]
    fn test_key_hex() {
        let key = AuthKey::generate();
        let hex = key.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(AuthKey::from_hex(&hex), Some(key));
        assert_eq!(AuthKey::from_hex("zz"), None);
        assert_eq!(format!("{:?}", AuthKey::from_bytes([7; 32])), "AuthKey(..)");
    }
}
