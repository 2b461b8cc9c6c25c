//! The BLE v2 advertisement, its header, and the service-ID bloom filter.
//!
//! A v2 advertiser packs one advertisement per "slot" and publishes a
//! base64-wrapped header describing the slots: a 10-byte bloom filter over
//! the advertised service IDs plus a 4-byte hash of the advertisement set,
//! so a scanner can skip a GATT read when nothing it cares about changed.

use base64::prelude::{Engine, BASE64_STANDARD};
use sha2::{Digest, Sha256};

use crate::bytes::{encode_to_vec, ByteReader, ByteWriter, FromBytes, ToBytes};
use crate::utils::HexSlice;
use crate::Error;
use core::fmt;

/// Raw byte length of an encoded header.
pub const HEADER_LENGTH: usize = 15;
/// Byte length of the bloom filter inside the header.
pub const BLOOM_FILTER_LENGTH: usize = 10;
/// Byte length of the advertisement hash inside the header.
pub const ADVERTISEMENT_HASH_LENGTH: usize = 4;

const HEADER_VERSION: u8 = 2;
const VERSION_BITMASK: u8 = 0xe0;
const NUM_SLOTS_BITMASK: u8 = 0x1f;

wire_enum! {
    /// Version of a v2 advertisement body.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum Version(u8) {
        V1 = 1,
        V2 = 2,
    }
}

wire_enum! {
    /// Socket protocol version the advertiser speaks over GATT.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum SocketVersion(u8) {
        V1 = 1,
        V2 = 2,
    }
}

/// A fixed-width bloom filter over service IDs.
///
/// Ten bytes, four probes per entry. False positives only make a scanner do
/// a redundant read, never miss a service.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct BloomFilter {
    bits: [u8; BLOOM_FILTER_LENGTH],
}

impl BloomFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores a filter from its raw bytes.
    pub fn from_bytes(bits: [u8; BLOOM_FILTER_LENGTH]) -> Self {
        BloomFilter { bits }
    }

    pub fn as_bytes(&self) -> &[u8; BLOOM_FILTER_LENGTH] {
        &self.bits
    }

    fn positions(entry: &[u8]) -> [usize; 4] {
        let digest = Sha256::digest(entry);
        let mut positions = [0; 4];
        for (i, slot) in positions.iter_mut().enumerate() {
            let probe = u32::from_be_bytes([
                digest[4 * i],
                digest[4 * i + 1],
                digest[4 * i + 2],
                digest[4 * i + 3],
            ]);
            *slot = probe as usize % (BLOOM_FILTER_LENGTH * 8);
        }
        positions
    }

    /// Adds a service ID to the filter.
    pub fn add(&mut self, service_id: &str) {
        for pos in Self::positions(service_id.as_bytes()) {
            self.bits[pos / 8] |= 1 << (pos % 8);
        }
    }

    /// Whether the filter may contain `service_id`.
    pub fn possibly_contains(&self, service_id: &str) -> bool {
        Self::positions(service_id.as_bytes())
            .iter()
            .all(|pos| self.bits[pos / 8] & 1 << (pos % 8) != 0)
    }
}

impl fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BloomFilter({:?})", HexSlice(&self.bits))
    }
}

/// The base64-wrapped v2 advertisement header.
#[derive(Clone, PartialEq, Eq)]
pub struct BleAdvertisementHeader {
    pub num_slots: u8,
    pub service_id_bloom_filter: BloomFilter,
    pub advertisement_hash: [u8; ADVERTISEMENT_HASH_LENGTH],
}

impl BleAdvertisementHeader {
    /// Encodes into the base64 text form carried in the advertising packet.
    pub fn encode(&self) -> Result<String, Error> {
        if self.num_slots & !NUM_SLOTS_BITMASK != 0 {
            return Err(Error::InvalidValue);
        }
        let mut bytes = Vec::with_capacity(HEADER_LENGTH);
        bytes.push(HEADER_VERSION << 5 | self.num_slots);
        bytes.extend_from_slice(self.service_id_bloom_filter.as_bytes());
        bytes.extend_from_slice(&self.advertisement_hash);
        Ok(BASE64_STANDARD.encode(bytes))
    }

    /// Decodes the base64 text form. Bytes beyond the fixed 15 are
    /// tolerated.
    pub fn decode(text: &str) -> Result<Self, Error> {
        let bytes = BASE64_STANDARD
            .decode(text)
            .map_err(|_| Error::InvalidValue)?;
        if bytes.len() < HEADER_LENGTH {
            return Err(Error::InvalidLength);
        }
        if bytes[0] & VERSION_BITMASK != HEADER_VERSION << 5 {
            return Err(Error::InvalidValue);
        }

        let mut reader = ByteReader::new(&bytes[1..]);
        let bloom = reader.read_array::<BLOOM_FILTER_LENGTH>()?;
        let advertisement_hash = reader.read_array::<ADVERTISEMENT_HASH_LENGTH>()?;

        Ok(BleAdvertisementHeader {
            num_slots: bytes[0] & NUM_SLOTS_BITMASK,
            service_id_bloom_filter: BloomFilter::from_bytes(bloom),
            advertisement_hash,
        })
    }
}

impl fmt::Debug for BleAdvertisementHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BleAdvertisementHeader")
            .field("num_slots", &self.num_slots)
            .field("bloom", &self.service_id_bloom_filter)
            .field("advertisement_hash", &HexSlice(&self.advertisement_hash))
            .finish()
    }
}

/// A BLE v2 advertisement body.
///
/// Wire layout: `VVVSSSRR | service_id_hash (3) | data_size:u32be | data`.
#[derive(Clone, PartialEq, Eq)]
pub struct BleV2Advertisement {
    pub version: Version,
    pub socket_version: SocketVersion,
    pub service_id_hash: [u8; 3],
    pub data: Vec<u8>,
}

impl BleV2Advertisement {
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        encode_to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        Self::from_bytes(&mut ByteReader::new(bytes))
    }
}

impl ToBytes for BleV2Advertisement {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        if self.data.len() > u32::MAX as usize {
            return Err(Error::InvalidLength);
        }
        writer.write_u8(self.version.as_raw() << 5 | self.socket_version.as_raw() << 2);
        writer.write_slice(&self.service_id_hash);
        writer.write_u32_be(self.data.len() as u32);
        writer.write_slice(&self.data);
        Ok(())
    }
}

impl<'a> FromBytes<'a> for BleV2Advertisement {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let first = bytes.read_u8()?;
        let version = Version::from_raw(first >> 5).ok_or(Error::InvalidValue)?;
        let socket_version = SocketVersion::from_raw(first >> 2 & 0x7).ok_or(Error::InvalidValue)?;
        let service_id_hash = bytes.read_array::<3>()?;
        let data_size = bytes.read_u32_be()? as usize;
        let data = bytes.read_slice(data_size)?.to_vec();
        Ok(BleV2Advertisement {
            version,
            socket_version,
            service_id_hash,
            data,
        })
    }
}

impl fmt::Debug for BleV2Advertisement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BleV2Advertisement")
            .field("version", &self.version)
            .field("socket_version", &self.socket_version)
            .field("service_id_hash", &HexSlice(&self.service_id_hash))
            .field("data", &HexSlice(&self.data))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bloom_filter_membership() {
        let mut filter = BloomFilter::new();
        assert!(!filter.possibly_contains("svc"));
        filter.add("svc");
        assert!(filter.possibly_contains("svc"));
        // A fresh id is overwhelmingly likely to miss in an 80-bit filter
        // with a single entry.
        assert!(!filter.possibly_contains("another service id"));
    }

    #[test]
    fn header_roundtrip() {
        let mut bloom = BloomFilter::new();
        bloom.add("svc");
        let header = BleAdvertisementHeader {
            num_slots: 3,
            service_id_bloom_filter: bloom,
            advertisement_hash: [1, 2, 3, 4],
        };
        let text = header.encode().unwrap();
        assert_eq!(BleAdvertisementHeader::decode(&text).unwrap(), header);
    }

    #[test]
    fn header_tolerates_extra_bytes() {
        let header = BleAdvertisementHeader {
            num_slots: 1,
            service_id_bloom_filter: BloomFilter::new(),
            advertisement_hash: [9, 9, 9, 9],
        };
        let mut raw = BASE64_STANDARD.decode(header.encode().unwrap()).unwrap();
        raw.extend_from_slice(b"future");
        let text = BASE64_STANDARD.encode(raw);
        assert_eq!(BleAdvertisementHeader::decode(&text).unwrap(), header);
    }

    #[test]
    fn header_rejects_wrong_version_and_short_input() {
        let header = BleAdvertisementHeader {
            num_slots: 1,
            service_id_bloom_filter: BloomFilter::new(),
            advertisement_hash: [0; 4],
        };
        let mut raw = BASE64_STANDARD.decode(header.encode().unwrap()).unwrap();
        raw[0] = 1 << 5;
        assert!(BleAdvertisementHeader::decode(&BASE64_STANDARD.encode(&raw)).is_err());
        assert!(BleAdvertisementHeader::decode(&BASE64_STANDARD.encode(&raw[..14])).is_err());
        assert!(BleAdvertisementHeader::decode("!!not base64!!").is_err());
    }

    #[test]
    fn v2_advertisement_roundtrip() {
        let adv = BleV2Advertisement {
            version: Version::V2,
            socket_version: SocketVersion::V2,
            service_id_hash: [7, 8, 9],
            data: b"slot data".to_vec(),
        };
        let bytes = adv.encode().unwrap();
        assert_eq!(BleV2Advertisement::decode(&bytes).unwrap(), adv);
        for len in 0..bytes.len() {
            assert!(BleV2Advertisement::decode(&bytes[..len]).is_err());
        }
    }

    #[test]
    fn v2_advertisement_rejects_bad_versions() {
        let adv = BleV2Advertisement {
            version: Version::V1,
            socket_version: SocketVersion::V1,
            service_id_hash: [0; 3],
            data: vec![],
        };
        let mut bytes = adv.encode().unwrap();
        bytes[0] = 7 << 5 | 1 << 2;
        assert!(BleV2Advertisement::decode(&bytes).is_err());
        bytes[0] = 1 << 5;
        assert!(BleV2Advertisement::decode(&bytes).is_err());
    }
}
