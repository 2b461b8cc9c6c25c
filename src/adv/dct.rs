//! The DCT advertisement.
//!
//! A compact BLE format for devices advertising over an L2CAP PSM. The
//! 7-bit dedup value and the 16-bit PSM are packed across the first four
//! bytes:
//!
//! ```text
//! b0: VVVDDDDD   version (3) | dedup bits 7..3
//! b1: DDDPPPPP   dedup bits 2..0 | psm bits 15..11
//! b2: PPPPPPPP   psm bits 10..3
//! b3: PPPRRRRR   psm bits 2..0 | reserved
//! ```
//!
//! followed by a 2-byte service-ID hash, a 4-byte device token and the
//! UTF-8 device name, truncated on a code-point boundary to at most 7
//! bytes. The endpoint ID is not carried: both sides derive it from
//! `(dedup, device_name)`.

use sha2::{Digest, Sha256};

use crate::bytes::{encode_to_vec, ByteReader, ByteWriter, FromBytes, ToBytes};
use crate::utils::HexSlice;
use crate::Error;
use core::fmt;

const VERSION: u8 = 1;
/// Longest device name the fixed-size advertisement can carry.
pub const MAX_DEVICE_NAME_LENGTH: usize = 7;
/// DCT service-ID hashes are shorter than the v1 3-byte form. Deliberately
/// not unified.
pub const SERVICE_ID_HASH_LENGTH: usize = 2;
/// Byte length of the device token.
pub const DEVICE_TOKEN_LENGTH: usize = 4;

const ENDPOINT_ID_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// A decoded DCT advertisement.
#[derive(Clone, PartialEq, Eq)]
pub struct DctAdvertisement {
    pub dedup: u8,
    pub psm: u16,
    pub service_id_hash: [u8; SERVICE_ID_HASH_LENGTH],
    pub device_token: [u8; DEVICE_TOKEN_LENGTH],
    pub device_name: String,
    /// Whether `device_name` was cut down to fit the name field.
    pub is_device_name_truncated: bool,
}

impl DctAdvertisement {
    /// Builds an advertisement, truncating `device_name` to fit.
    pub fn new(service_id: &str, device_name: &str, psm: u16, dedup: u8) -> Result<Self, Error> {
        if service_id.is_empty() || device_name.is_empty() {
            return Err(Error::InvalidValue);
        }
        if psm == 0 || dedup & 0x80 != 0 {
            return Err(Error::InvalidValue);
        }

        let truncated = truncate_utf8(device_name, MAX_DEVICE_NAME_LENGTH);
        Ok(DctAdvertisement {
            dedup,
            psm,
            service_id_hash: compute_service_id_hash(service_id),
            device_token: generate_device_token(truncated),
            device_name: truncated.to_owned(),
            is_device_name_truncated: truncated.len() != device_name.len(),
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        encode_to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        Self::from_bytes(&mut ByteReader::new(bytes))
    }

    /// The endpoint ID both sides derive from this advertisement.
    pub fn endpoint_id(&self) -> Option<String> {
        generate_endpoint_id(self.dedup, &self.device_name)
    }
}

impl ToBytes for DctAdvertisement {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        if self.dedup & 0x80 != 0 || self.psm == 0 {
            return Err(Error::InvalidValue);
        }
        let name = self.device_name.as_bytes();
        if name.is_empty() || name.len() > MAX_DEVICE_NAME_LENGTH {
            return Err(Error::InvalidLength);
        }

        writer.write_u8(VERSION << 5 | self.dedup >> 3);
        writer.write_u8((self.dedup & 0x7) << 5 | (self.psm >> 11) as u8);
        writer.write_u8((self.psm >> 3) as u8);
        writer.write_u8(((self.psm & 0x7) as u8) << 5);
        writer.write_slice(&self.service_id_hash);
        writer.write_slice(&self.device_token);
        writer.write_slice(name);
        Ok(())
    }
}

impl<'a> FromBytes<'a> for DctAdvertisement {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let b0 = bytes.read_u8()?;
        if b0 >> 5 != VERSION {
            return Err(Error::InvalidValue);
        }
        if b0 & 0x10 != 0 {
            // The dedup high bit must be zero.
            return Err(Error::InvalidValue);
        }
        let b1 = bytes.read_u8()?;
        let b2 = bytes.read_u8()?;
        let b3 = bytes.read_u8()?;
        let dedup = (b0 & 0x1f) << 3 | b1 >> 5;
        let psm = u16::from(b1 & 0x1f) << 11 | u16::from(b2) << 3 | u16::from(b3 >> 5);
        if psm == 0 {
            return Err(Error::InvalidValue);
        }

        let service_id_hash = bytes.read_array::<SERVICE_ID_HASH_LENGTH>()?;
        let device_token = bytes.read_array::<DEVICE_TOKEN_LENGTH>()?;
        let name_bytes = bytes.read_rest();
        if name_bytes.is_empty() || name_bytes.len() > MAX_DEVICE_NAME_LENGTH {
            return Err(Error::InvalidLength);
        }
        let device_name =
            core::str::from_utf8(name_bytes).map_err(|_| Error::InvalidUtf8)?;

        Ok(DctAdvertisement {
            dedup,
            psm,
            service_id_hash,
            device_token,
            device_name: device_name.to_owned(),
            is_device_name_truncated: false,
        })
    }
}

impl fmt::Debug for DctAdvertisement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DctAdvertisement")
            .field("dedup", &self.dedup)
            .field("psm", &self.psm)
            .field("service_id_hash", &HexSlice(&self.service_id_hash))
            .field("device_token", &HexSlice(&self.device_token))
            .field("device_name", &self.device_name)
            .finish()
    }
}

/// First two bytes of SHA-256 over the service ID.
pub fn compute_service_id_hash(service_id: &str) -> [u8; SERVICE_ID_HASH_LENGTH] {
    let digest = Sha256::digest(service_id.as_bytes());
    [digest[0], digest[1]]
}

/// First four bytes of SHA-256 over the device name.
pub fn generate_device_token(device_name: &str) -> [u8; DEVICE_TOKEN_LENGTH] {
    let digest = Sha256::digest(device_name.as_bytes());
    let mut token = [0; DEVICE_TOKEN_LENGTH];
    token.copy_from_slice(&digest[..DEVICE_TOKEN_LENGTH]);
    token
}

/// Derives the 4-character endpoint ID from `(dedup, device_name)`.
///
/// Base-32 over the first 24 bits of `SHA-256(dedup || device_name)`;
/// `None` when dedup has its high bit set or the name is empty.
pub fn generate_endpoint_id(dedup: u8, device_name: &str) -> Option<String> {
    if dedup & 0x80 != 0 || device_name.is_empty() {
        return None;
    }

    let mut hasher = Sha256::new();
    hasher.update([dedup]);
    hasher.update(device_name.as_bytes());
    let digest = hasher.finalize();

    let bits =
        u32::from(digest[0]) << 16 | u32::from(digest[1]) << 8 | u32::from(digest[2]);
    let id: String = (0..4)
        .map(|i| ENDPOINT_ID_ALPHABET[(bits >> (19 - 5 * i) & 0x1f) as usize] as char)
        .collect();
    Some(id)
}

/// Cuts a string down to at most `max` bytes on a char boundary.
fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_roundtrip() {
        let adv = DctAdvertisement::new("service_id", "device", 0x1234, 0x01).unwrap();
        assert_eq!(adv.psm, 0x1234);
        assert_eq!(adv.service_id_hash, [0x96, 0x77]);
        assert_eq!(adv.device_name, "device");
        assert!(!adv.is_device_name_truncated);

        let bytes = adv.encode().unwrap();
        let parsed = DctAdvertisement::decode(&bytes).unwrap();
        assert_eq!(parsed.dedup, adv.dedup);
        assert_eq!(parsed.psm, adv.psm);
        assert_eq!(parsed.service_id_hash, adv.service_id_hash);
        assert_eq!(parsed.device_token, adv.device_token);
        assert_eq!(parsed.device_name, adv.device_name);
    }

    #[test]
    fn create_rejects_invalid_parameters() {
        assert!(DctAdvertisement::new("service_id", "", 0x1234, 0x01).is_err());
        assert!(DctAdvertisement::new("", "device", 0x1234, 0x01).is_err());
        assert!(DctAdvertisement::new("service_id", "device", 0, 0x01).is_err());
        assert!(DctAdvertisement::new("service_id", "device", 0x1234, 0x81).is_err());
    }

    #[test]
    fn device_name_truncation() {
        // 9 ASCII chars fit 7.
        let adv = DctAdvertisement::new("service_id", "abcdefghi", 0x1234, 0x01).unwrap();
        assert_eq!(adv.device_name, "abcdefg");
        assert!(adv.is_device_name_truncated);

        // 2-byte code points: three fit (6 bytes), the emoji does not.
        let adv = DctAdvertisement::new("service_id", "éñö😀", 0x1234, 0x01).unwrap();
        assert_eq!(adv.device_name, "éñö");

        // A 4-byte emoji first: it plus one 2-byte char fit.
        let adv = DctAdvertisement::new("service_id", "😀éñö", 0x1234, 0x01).unwrap();
        assert_eq!(adv.device_name, "😀é");

        // Two emoji: only the first fits.
        let adv = DctAdvertisement::new("service_id", "😀🪴", 0x1234, 0x01).unwrap();
        assert_eq!(adv.device_name, "😀");
    }

    #[test]
    fn psm_packing_covers_the_full_range() {
        for psm in [1u16, 0x00c0, 0x1234, 0x7fff, 0xffff] {
            let adv = DctAdvertisement::new("svc", "dev", psm, 0x7f).unwrap();
            let parsed = DctAdvertisement::decode(&adv.encode().unwrap()).unwrap();
            assert_eq!(parsed.psm, psm);
            assert_eq!(parsed.dedup, 0x7f);
        }
    }

    #[test]
    fn decode_rejects_malformed() {
        // Wrong version.
        assert!(DctAdvertisement::decode(&[0x70, 0x01]).is_err());
        let good = DctAdvertisement::new("svc", "dev", 0x00c0, 0x01)
            .unwrap()
            .encode()
            .unwrap();
        for len in 0..11 {
            assert!(DctAdvertisement::decode(&good[..len]).is_err());
        }
        // Dedup high bit.
        let mut bad = good.clone();
        bad[0] |= 0x10;
        assert!(DctAdvertisement::decode(&bad).is_err());
        // Invalid UTF-8 name.
        let mut bad = good;
        let last = bad.len() - 1;
        bad[last] = 0xff;
        assert!(DctAdvertisement::decode(&bad).is_err());
    }

    #[test]
    fn endpoint_id_derivation() {
        let id = generate_endpoint_id(0x01, "device").unwrap();
        assert_eq!(id.len(), 4);
        assert!(id.bytes().all(|b| ENDPOINT_ID_ALPHABET.contains(&b)));
        assert_eq!(id, generate_endpoint_id(0x01, "device").unwrap());
        assert_ne!(id, generate_endpoint_id(0x02, "device").unwrap());

        assert_eq!(generate_endpoint_id(0x01, ""), None);
        assert_eq!(generate_endpoint_id(0xff, "device"), None);
    }

    #[test]
    fn device_token_is_name_hash_prefix() {
        let token = generate_device_token("testdev");
        assert_eq!(token, generate_device_token("testdev"));
        assert_ne!(token, generate_device_token("testdev2"));
    }
}
