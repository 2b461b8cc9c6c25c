//! The Wi-Fi LAN service info.
//!
//! mDNS service registrations carry a textual instance name, so like the
//! Bluetooth device name this format is base64-wrapped. It is the smallest
//! of the v1 formats: just the version/PCP byte, the endpoint ID and the
//! service-ID hash.

use base64::prelude::{Engine, BASE64_STANDARD};

use crate::adv::{Pcp, SERVICE_ID_HASH_LENGTH};
use crate::bytes::ByteReader;
use crate::utils::HexSlice;
use crate::{Error, ENDPOINT_ID_LENGTH};
use core::fmt;

const VERSION: u8 = 1;
/// Raw frame size.
pub const SERVICE_INFO_BYTES: usize = 1 + ENDPOINT_ID_LENGTH + SERVICE_ID_HASH_LENGTH;

/// An advertisement carried in an mDNS service-instance name.
#[derive(Clone, PartialEq, Eq)]
pub struct WifiLanServiceInfo {
    pub pcp: Pcp,
    pub endpoint_id: String,
    pub service_id_hash: [u8; SERVICE_ID_HASH_LENGTH],
}

impl WifiLanServiceInfo {
    pub fn new(pcp: Pcp, endpoint_id: &str, service_id_hash: [u8; SERVICE_ID_HASH_LENGTH]) -> Self {
        WifiLanServiceInfo {
            pcp,
            endpoint_id: endpoint_id.to_owned(),
            service_id_hash,
        }
    }

    pub fn encode(&self) -> Result<String, Error> {
        if self.endpoint_id.len() != ENDPOINT_ID_LENGTH {
            return Err(Error::InvalidLength);
        }
        let mut out = Vec::with_capacity(SERVICE_INFO_BYTES);
        out.push(VERSION << 5 | self.pcp.as_raw() & 0x1f);
        out.extend_from_slice(self.endpoint_id.as_bytes());
        out.extend_from_slice(&self.service_id_hash);
        Ok(BASE64_STANDARD.encode(out))
    }

    pub fn decode(text: &str) -> Result<Self, Error> {
        let bytes = BASE64_STANDARD
            .decode(text)
            .map_err(|_| Error::InvalidValue)?;
        if bytes.len() < SERVICE_INFO_BYTES {
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

        Ok(WifiLanServiceInfo {
            pcp,
            endpoint_id,
            service_id_hash,
        })
    }
}

impl fmt::Debug for WifiLanServiceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WifiLanServiceInfo")
            .field("pcp", &self.pcp)
            .field("endpoint_id", &self.endpoint_id)
            .field("service_id_hash", &HexSlice(&self.service_id_hash))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adv::service_id_hash;

    #[test]
    fn roundtrip() {
        let info = WifiLanServiceInfo::new(Pcp::P2pPointToPoint, "QRST", service_id_hash("svc"));
        let text = info.encode().unwrap();
        assert_eq!(WifiLanServiceInfo::decode(&text).unwrap(), info);
    }

    #[test]
    fn rejects_malformed() {
        let info = WifiLanServiceInfo::new(Pcp::P2pCluster, "QRST", service_id_hash("svc"));
        let raw = BASE64_STANDARD.decode(info.encode().unwrap()).unwrap();
        assert!(WifiLanServiceInfo::decode(&BASE64_STANDARD.encode(&raw[..7])).is_err());
        let mut bad = raw;
        bad[0] = 3 << 5 | 1;
        assert!(WifiLanServiceInfo::decode(&BASE64_STANDARD.encode(&bad)).is_err());
        assert!(WifiLanServiceInfo::decode("not-base64!").is_err());
    }
}
