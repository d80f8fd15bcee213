//! Integrity-checked value codec
//!
//! When no shared back-end cache exists, bulk values travel peer to
//! peer. They are framed with an HMAC so a corrupted or forged frame
//! is rejected before deserialization is trusted:
//!
//! ```text
//! frame = hex(payload_len as u32 LE)  -- 8 chars
//!       || hex(hmac(key, payload))    -- 2 * digest_size chars
//!       || payload                    -- bincode bytes
//! ```
//!
//! A MAC mismatch on load is a fatal [`CacheError::Integrity`];
//! framing problems (truncation, trailing garbage, bad hex) are
//! [`CacheError::Codec`].

use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha1::Sha1;
use sha2::Sha256;

use crate::error::{CacheError, CacheResult};

/// Digest backing the frame MAC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumAlgorithm {
    /// HMAC-SHA256 (default)
    #[default]
    Sha256,
    /// HMAC-SHA1, for wire compatibility with older peers
    Sha1,
}

impl ChecksumAlgorithm {
    fn digest_size(self) -> usize {
        match self {
            ChecksumAlgorithm::Sha256 => 32,
            ChecksumAlgorithm::Sha1 => 20,
        }
    }
}

const LEN_HEX: usize = 8;

/// HMAC-framed codec for peer-to-peer value transfer
#[derive(Clone)]
pub struct SecureCodec {
    key: Vec<u8>,
    algorithm: ChecksumAlgorithm,
}

impl SecureCodec {
    /// Codec with the default digest
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self::with_algorithm(key, ChecksumAlgorithm::default())
    }

    /// Codec with an explicit digest choice
    pub fn with_algorithm(key: impl Into<Vec<u8>>, algorithm: ChecksumAlgorithm) -> Self {
        Self {
            key: key.into(),
            algorithm,
        }
    }

    fn mac_hex(&self, payload: &[u8]) -> CacheResult<String> {
        Ok(match self.algorithm {
            ChecksumAlgorithm::Sha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(&self.key)
                    .map_err(|e| CacheError::Codec(e.to_string()))?;
                mac.update(payload);
                hex::encode(mac.finalize().into_bytes())
            }
            ChecksumAlgorithm::Sha1 => {
                let mut mac = Hmac::<Sha1>::new_from_slice(&self.key)
                    .map_err(|e| CacheError::Codec(e.to_string()))?;
                mac.update(payload);
                hex::encode(mac.finalize().into_bytes())
            }
        })
    }

    /// Serialize `value` into one integrity-checked frame.
    pub fn dump<T: Serialize>(&self, value: &T) -> CacheResult<Vec<u8>> {
        let payload = bincode::serialize(value).map_err(|e| CacheError::Codec(e.to_string()))?;
        let len = u32::try_from(payload.len())
            .map_err(|_| CacheError::Codec("payload exceeds u32 length".to_string()))?;

        let mut frame =
            Vec::with_capacity(LEN_HEX + self.algorithm.digest_size() * 2 + payload.len());
        frame.extend_from_slice(hex::encode(len.to_le_bytes()).as_bytes());
        frame.extend_from_slice(self.mac_hex(&payload)?.as_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Decode one frame, verifying the MAC before trusting the
    /// payload.
    pub fn load<T: DeserializeOwned>(&self, frame: &[u8]) -> CacheResult<T> {
        let mac_hex_len = self.algorithm.digest_size() * 2;
        if frame.len() < LEN_HEX + mac_hex_len {
            return Err(CacheError::Codec("truncated frame header".to_string()));
        }

        let len_bytes = hex::decode(&frame[..LEN_HEX])
            .map_err(|e| CacheError::Codec(format!("bad length field: {e}")))?;
        let declared = u32::from_le_bytes(
            len_bytes
                .as_slice()
                .try_into()
                .map_err(|_| CacheError::Codec("bad length field".to_string()))?,
        ) as usize;

        let payload = &frame[LEN_HEX + mac_hex_len..];
        if payload.len() != declared {
            return Err(CacheError::Codec(format!(
                "frame length mismatch: declared {declared}, got {}",
                payload.len()
            )));
        }

        let claimed = &frame[LEN_HEX..LEN_HEX + mac_hex_len];
        let expected = self.mac_hex(payload)?;
        if claimed != expected.as_bytes() {
            return Err(CacheError::Integrity("MAC mismatch".to_string()));
        }

        bincode::deserialize(payload).map_err(|e| CacheError::Codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_round_trip() {
        let codec = SecureCodec::new(b"secret".to_vec());
        let value = ("hello".to_string(), vec![1u32, 2, 3]);
        let frame = codec.dump(&value).unwrap();
        let back: (String, Vec<u32>) = codec.load(&frame).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_sha1_round_trip() {
        let codec = SecureCodec::with_algorithm(b"secret".to_vec(), ChecksumAlgorithm::Sha1);
        let frame = codec.dump(&42u64).unwrap();
        assert_eq!(codec.load::<u64>(&frame).unwrap(), 42);
    }

    #[test]
    fn test_tampered_payload_is_integrity_error() {
        let codec = SecureCodec::new(b"secret".to_vec());
        let mut frame = codec.dump(&"payload".to_string()).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        assert!(matches!(
            codec.load::<String>(&frame),
            Err(CacheError::Integrity(_))
        ));
    }

    #[test]
    fn test_wrong_key_is_integrity_error() {
        let writer = SecureCodec::new(b"alpha".to_vec());
        let reader = SecureCodec::new(b"bravo".to_vec());
        let frame = writer.dump(&1u8).unwrap();
        assert!(matches!(
            reader.load::<u8>(&frame),
            Err(CacheError::Integrity(_))
        ));
    }

    #[test]
    fn test_truncated_frame_is_codec_error() {
        let codec = SecureCodec::new(b"secret".to_vec());
        let frame = codec.dump(&12345u64).unwrap();
        assert!(matches!(
            codec.load::<u64>(&frame[..10]),
            Err(CacheError::Codec(_))
        ));
    }

    #[test]
    fn test_length_mismatch_is_codec_error() {
        let codec = SecureCodec::new(b"secret".to_vec());
        let mut frame = codec.dump(&7u8).unwrap();
        frame.extend_from_slice(b"trailing");
        assert!(matches!(
            codec.load::<u8>(&frame),
            Err(CacheError::Codec(_))
        ));
    }

    #[test]
    fn test_digests_are_not_interchangeable() {
        let sha256 = SecureCodec::new(b"k".to_vec());
        let sha1 = SecureCodec::with_algorithm(b"k".to_vec(), ChecksumAlgorithm::Sha1);
        let frame = sha256.dump(&1u8).unwrap();
        assert!(sha1.load::<u8>(&frame).is_err());
    }

    proptest! {
        #[test]
        fn prop_round_trip_identity(value in proptest::collection::vec(any::<u8>(), 0..512)) {
            let codec = SecureCodec::new(b"prop-key".to_vec());
            let frame = codec.dump(&value).unwrap();
            let back: Vec<u8> = codec.load(&frame).unwrap();
            prop_assert_eq!(back, value);
        }

        #[test]
        fn prop_bit_flips_never_pass(value in proptest::collection::vec(any::<u8>(), 1..128), pos_seed: usize, bit in 0u8..8) {
            let codec = SecureCodec::new(b"prop-key".to_vec());
            let mut frame = codec.dump(&value).unwrap();
            let pos = pos_seed % frame.len();
            frame[pos] ^= 1 << bit;
            // A flip in the length field breaks framing, in the MAC
            // field breaks the comparison, in the payload breaks the
            // MAC itself. No single-bit corruption may decode.
            prop_assert!(codec.load::<Vec<u8>>(&frame).is_err());
        }
    }
}
