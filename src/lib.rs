//! A peer-to-peer connections runtime.
//!
//! Two devices discover each other over one or more short-range mediums
//! (Bluetooth Classic, BLE, Wi-Fi LAN, Wi-Fi Hotspot, Wi-Fi Direct, WebRTC),
//! negotiate an encrypted framed session, exchange typed payloads (bytes,
//! streams, files), and can migrate a live session to a higher-bandwidth
//! medium without tearing it down.
//!
//! # Using the runtime
//!
//! The runtime is medium-agnostic: every radio is a driver implementing
//! [`MediumDriver`], which hands back uniformly-shaped [`Socket`]s. The crate
//! ships an in-process [`medium::fake`] hub that pairs advertisers with
//! discoverers, which is what the integration tests run on.
//!
//! Construct a [`Core`] with a set of drivers, then drive it through the
//! per-client API: advertise, discover, request a connection, accept it on
//! both sides, and send payloads. See `tests/end_to_end.rs` for complete
//! two-client sessions.
//!
//! [`MediumDriver`]: medium/trait.MediumDriver.html
//! [`Socket`]: medium/trait.Socket.html
//! [`medium::fake`]: medium/fake/index.html
//! [`Core`]: core/struct.Core.html

#[macro_use]
mod utils;
pub mod adv;
pub mod base85;
pub mod bytes;
pub mod channel;
pub mod client;
pub mod core;
mod error;
pub mod frame;
pub mod handshake;
pub mod mac_address;
pub mod medium;
pub mod payload;
pub mod runtime;
mod status;

pub mod bwu;
pub mod endpoint_manager;
pub mod pcp;

pub use self::error::Error;
pub use self::status::Status;

/// Upper bound on a single framed read; anything larger is treated as stream
/// corruption.
pub const MAX_ALLOWED_READ_BYTES: usize = 4 * 1024 * 1024;

/// Length of an endpoint ID, in bytes. Always four printable ASCII characters.
pub const ENDPOINT_ID_LENGTH: usize = 4;
