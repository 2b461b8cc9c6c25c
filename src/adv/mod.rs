//! Advertisement codecs.
//!
//! These are the bit-exact on-air formats a device broadcasts so that peers
//! scanning the same service can find it: the raw BLE advertisements (v1 and
//! v2), the DCT advertisement, and the two formats smuggled through textual
//! radio fields (the Bluetooth device name and the Wi-Fi LAN service info).
//!
//! Every codec decodes totally: malformed input yields an [`Error`], never a
//! panic, and a few formats deliberately tolerate trailing bytes so newer
//! peers can extend them.
//!
//! [`Error`]: ../enum.Error.html

use sha2::{Digest, Sha256};

pub mod ble;
pub mod ble_v2;
pub mod dct;
pub mod device_name;
pub mod wifi_lan;

/// Length of the service-ID hash carried by BLE v1 advertisements, Bluetooth
/// device names and Wi-Fi LAN service info.
pub const SERVICE_ID_HASH_LENGTH: usize = 3;

/// Longest endpoint name (endpoint info) any v1 format carries.
pub const MAX_ENDPOINT_NAME_LENGTH: usize = 131;

wire_enum! {
    /// The pre-connection protocol variant an advertiser runs.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub enum Pcp(u8) {
        P2pCluster = 1,
        P2pStar = 2,
        P2pPointToPoint = 3,
    }
}

/// Hashes a service ID down to the 3 bytes the v1 formats carry.
pub fn service_id_hash(service_id: &str) -> [u8; SERVICE_ID_HASH_LENGTH] {
    let digest = Sha256::digest(service_id.as_bytes());
    let mut hash = [0; SERVICE_ID_HASH_LENGTH];
    hash.copy_from_slice(&digest[..SERVICE_ID_HASH_LENGTH]);
    hash
}
