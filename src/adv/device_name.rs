//! The Bluetooth Classic device name advertisement.
//!
//! Bluetooth Classic discovery can only surface a device name string, so the
//! whole advertisement is base64-wrapped into it:
//!
//! ```text
//! VVVPPPPP | endpoint_id (4) | service_id_hash (3) | reserved (7) | len (1) | endpoint_name (len)
//! ```
//!
//! The frame is at most 147 bytes (16 + a 131-byte name).

use base64::prelude::{Engine, BASE64_STANDARD};

use crate::adv::{Pcp, MAX_ENDPOINT_NAME_LENGTH, SERVICE_ID_HASH_LENGTH};
use crate::bytes::ByteReader;
use crate::utils::HexSlice;
use crate::{Error, ENDPOINT_ID_LENGTH};
use core::fmt;

const VERSION: u8 = 1;
const RESERVED_LENGTH: usize = 7;
/// Frame size with an empty endpoint name.
pub const MIN_DEVICE_NAME_BYTES: usize = 16;
/// Frame size with a maximal endpoint name.
pub const MAX_DEVICE_NAME_BYTES: usize = MIN_DEVICE_NAME_BYTES + MAX_ENDPOINT_NAME_LENGTH;

/// An advertisement carried in a Bluetooth Classic device name.
#[derive(Clone, PartialEq, Eq)]
pub struct BluetoothDeviceName {
    pub pcp: Pcp,
    pub endpoint_id: String,
    pub service_id_hash: [u8; SERVICE_ID_HASH_LENGTH],
    pub endpoint_name: Vec<u8>,
}

impl BluetoothDeviceName {
    pub fn new(
        pcp: Pcp,
        endpoint_id: &str,
        service_id_hash: [u8; SERVICE_ID_HASH_LENGTH],
        endpoint_name: &[u8],
    ) -> Self {
        BluetoothDeviceName {
            pcp,
            endpoint_id: endpoint_id.to_owned(),
            service_id_hash,
            endpoint_name: endpoint_name.to_owned(),
        }
    }

    /// Encodes into the base64 device-name string.
    ///
    /// An over-long endpoint name is truncated rather than rejected; the
    /// radio field this ends up in leaves no room to signal an error.
    pub fn encode(&self) -> Result<String, Error> {
        if self.endpoint_id.len() != ENDPOINT_ID_LENGTH {
            return Err(Error::InvalidLength);
        }

        let name = if self.endpoint_name.len() > MAX_ENDPOINT_NAME_LENGTH {
            &self.endpoint_name[..MAX_ENDPOINT_NAME_LENGTH]
        } else {
            &self.endpoint_name[..]
        };

        let mut out = Vec::with_capacity(MIN_DEVICE_NAME_BYTES + name.len());
        out.push(VERSION << 5 | self.pcp.as_raw() & 0x1f);
        out.extend_from_slice(self.endpoint_id.as_bytes());
        out.extend_from_slice(&self.service_id_hash);
        out.extend_from_slice(&[0; RESERVED_LENGTH]);
        out.push(name.len() as u8);
        out.extend_from_slice(name);
        Ok(BASE64_STANDARD.encode(out))
    }

    /// Decodes a base64 device-name string.
    pub fn decode(text: &str) -> Result<Self, Error> {
        let bytes = BASE64_STANDARD
            .decode(text)
            .map_err(|_| Error::InvalidValue)?;
        if bytes.len() < MIN_DEVICE_NAME_BYTES || bytes.len() > MAX_DEVICE_NAME_BYTES {
            return Err(Error::InvalidLength);
        }

        let mut reader = ByteReader::new(&bytes);
        let version_and_pcp = reader.read_u8()?;
        if version_and_pcp >> 5 != VERSION {
            return Err(Error::InvalidValue);
        }
        let pcp = Pcp::from_raw(version_and_pcp & 0x1f).ok_or(Error::InvalidValue)?;
        let endpoint_id = String::from_utf8(reader.read_slice(ENDPOINT_ID_LENGTH)?.to_vec())
            .map_err(|_| Error::InvalidValue)?;
        let service_id_hash = reader.read_array::<SERVICE_ID_HASH_LENGTH>()?;
        reader.skip(RESERVED_LENGTH)?;

        let name_len = usize::from(reader.read_u8()?);
        // A stated length longer than what is present fails; extra bytes
        // after the name are tolerated.
        let endpoint_name = reader.read_slice(name_len)?.to_vec();

        Ok(BluetoothDeviceName {
            pcp,
            endpoint_id,
            service_id_hash,
            endpoint_name,
        })
    }
}

impl fmt::Debug for BluetoothDeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BluetoothDeviceName")
            .field("pcp", &self.pcp)
            .field("endpoint_id", &self.endpoint_id)
            .field("service_id_hash", &HexSlice(&self.service_id_hash))
            .field("endpoint_name", &HexSlice(&self.endpoint_name))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adv::service_id_hash;

    fn sample(name_len: usize) -> BluetoothDeviceName {
        BluetoothDeviceName::new(
            Pcp::P2pStar,
            "WXYZ",
            service_id_hash("svc"),
            &vec![0x62; name_len],
        )
    }

    #[test]
    fn roundtrip() {
        for name_len in [0usize, 1, 64, 131] {
            let name = sample(name_len);
            let text = name.encode().unwrap();
            assert_eq!(BluetoothDeviceName::decode(&text).unwrap(), name);
        }
    }

    #[test]
    fn over_long_name_truncated_on_encode() {
        let name = sample(200);
        let decoded = BluetoothDeviceName::decode(&name.encode().unwrap()).unwrap();
        assert_eq!(decoded.endpoint_name.len(), MAX_ENDPOINT_NAME_LENGTH);
    }

    #[test]
    fn length_bounds_enforced() {
        let raw = BASE64_STANDARD.decode(sample(0).encode().unwrap()).unwrap();
        assert!(BluetoothDeviceName::decode(&BASE64_STANDARD.encode(&raw[..15])).is_err());
        let mut long = raw.clone();
        long.resize(MAX_DEVICE_NAME_BYTES + 1, 0);
        assert!(BluetoothDeviceName::decode(&BASE64_STANDARD.encode(&long)).is_err());
        assert!(BluetoothDeviceName::decode("@@@").is_err());
    }

    #[test]
    fn stated_name_length_mismatch() {
        let mut raw = BASE64_STANDARD.decode(sample(4).encode().unwrap()).unwrap();
        // Claim more name bytes than exist: rejected.
        raw[15] = 10;
        assert!(BluetoothDeviceName::decode(&BASE64_STANDARD.encode(&raw)).is_err());
        // Claim fewer: tolerated, surplus ignored.
        raw[15] = 2;
        let decoded = BluetoothDeviceName::decode(&BASE64_STANDARD.encode(&raw)).unwrap();
        assert_eq!(decoded.endpoint_name.len(), 2);
    }
}
