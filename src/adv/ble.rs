//! The BLE v1 advertisement.
//!
//! Wire layout, 15..=146 bytes:
//!
//! ```text
//! VVVPPPPP | service_id_hash (3) | endpoint_id (4) | len (1) | endpoint_info (len) | mac (6)
//! ```
//!
//! `VVV` is the version (always 1), `PPPPP` the PCP. An all-zero MAC means
//! "no Bluetooth MAC known". Trailing bytes after the MAC are ignored so
//! that future versions can append fields.

use crate::adv::{Pcp, MAX_ENDPOINT_NAME_LENGTH, SERVICE_ID_HASH_LENGTH};
use crate::bytes::{encode_to_vec, ByteReader, ByteWriter, FromBytes, ToBytes};
use crate::mac_address::MacAddress;
use crate::utils::HexSlice;
use crate::{Error, ENDPOINT_ID_LENGTH};
use core::fmt;

const VERSION: u8 = 1;
const VERSION_BITMASK: u8 = 0xe0;
const PCP_BITMASK: u8 = 0x1f;

/// A decoded BLE v1 advertisement.
#[derive(Clone, PartialEq, Eq)]
pub struct BleAdvertisement {
    pub pcp: Pcp,
    pub service_id_hash: [u8; SERVICE_ID_HASH_LENGTH],
    pub endpoint_id: String,
    pub endpoint_info: Vec<u8>,
    /// `None` when the advertiser has no Bluetooth MAC to share.
    pub bluetooth_mac: Option<MacAddress>,
}

impl BleAdvertisement {
    pub fn new(
        pcp: Pcp,
        service_id_hash: [u8; SERVICE_ID_HASH_LENGTH],
        endpoint_id: &str,
        endpoint_info: &[u8],
        bluetooth_mac: Option<MacAddress>,
    ) -> Self {
        BleAdvertisement {
            pcp,
            service_id_hash,
            endpoint_id: endpoint_id.to_owned(),
            endpoint_info: endpoint_info.to_owned(),
            bluetooth_mac,
        }
    }

    /// Encodes into the on-air byte form.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        encode_to_vec(self)
    }

    /// Decodes the on-air byte form, tolerating trailing bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        Self::from_bytes(&mut ByteReader::new(bytes))
    }
}

impl ToBytes for BleAdvertisement {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        if self.endpoint_id.len() != ENDPOINT_ID_LENGTH {
            return Err(Error::InvalidLength);
        }
        if self.endpoint_info.len() > MAX_ENDPOINT_NAME_LENGTH {
            return Err(Error::InvalidLength);
        }

        writer.write_u8(VERSION << 5 | self.pcp.as_raw() & PCP_BITMASK);
        writer.write_slice(&self.service_id_hash);
        writer.write_slice(self.endpoint_id.as_bytes());
        writer.write_u8(self.endpoint_info.len() as u8);
        writer.write_slice(&self.endpoint_info);
        match &self.bluetooth_mac {
            Some(mac) => writer.write_slice(mac.as_bytes()),
            None => writer.write_slice(&[0; 6]),
        }
        Ok(())
    }
}

impl<'a> FromBytes<'a> for BleAdvertisement {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let version_and_pcp = bytes.read_u8()?;
        if version_and_pcp >> 5 != VERSION {
            return Err(Error::InvalidValue);
        }
        let pcp = Pcp::from_raw(version_and_pcp & PCP_BITMASK).ok_or(Error::InvalidValue)?;

        let service_id_hash = bytes.read_array::<SERVICE_ID_HASH_LENGTH>()?;
        let endpoint_id = String::from_utf8(bytes.read_slice(ENDPOINT_ID_LENGTH)?.to_vec())
            .map_err(|_| Error::InvalidValue)?;

        let info_len = usize::from(bytes.read_u8()?);
        if info_len > MAX_ENDPOINT_NAME_LENGTH {
            return Err(Error::InvalidLength);
        }
        // A stated length longer than what is actually present runs the
        // reader out of bytes here or at the MAC and fails; surplus bytes
        // after the MAC are tolerated.
        let endpoint_info = bytes.read_slice(info_len)?.to_vec();

        let mac = MacAddress::from_bytes(bytes.read_array::<6>()?);
        let bluetooth_mac = if mac.is_unset() { None } else { Some(mac) };

        Ok(BleAdvertisement {
            pcp,
            service_id_hash,
            endpoint_id,
            endpoint_info,
            bluetooth_mac,
        })
    }
}

impl fmt::Debug for BleAdvertisement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BleAdvertisement")
            .field("pcp", &self.pcp)
            .field("service_id_hash", &HexSlice(&self.service_id_hash))
            .field("endpoint_id", &self.endpoint_id)
            .field("endpoint_info", &HexSlice(&self.endpoint_info))
            .field("bluetooth_mac", &self.bluetooth_mac)
            .finish()
    }
}
