//! The medium driver interface.
//!
//! Every radio backend implements [`MediumDriver`]: advertising, discovery,
//! accepting connections, and dialing a discovered peer. The runtime above
//! never touches radio specifics; it only sees uniformly-shaped [`Socket`]s
//! whose blocking streams it wraps into endpoint channels.
//!
//! The crate ships one driver, the in-process [`fake`] hub used by tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::core::{AdvertisingOptions, DiscoveryOptions};
use crate::frame::UpgradeCredentials;
use crate::Status;
use core::fmt;

pub mod fake;

/// A physical transport.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Medium {
    Unknown,
    Bluetooth,
    WifiHotspot,
    Ble,
    WifiLan,
    WifiDirect,
    WebRtc,
}

impl Medium {
    /// Converts from the wire value; unassigned values collapse to
    /// `Unknown`.
    pub fn from_raw(value: u64) -> Medium {
        match value {
            2 => Medium::Bluetooth,
            3 => Medium::WifiHotspot,
            4 => Medium::Ble,
            5 => Medium::WifiLan,
            8 => Medium::WifiDirect,
            9 => Medium::WebRtc,
            _ => Medium::Unknown,
        }
    }

    pub fn as_raw(&self) -> u64 {
        match self {
            Medium::Unknown => 0,
            Medium::Bluetooth => 2,
            Medium::WifiHotspot => 3,
            Medium::Ble => 4,
            Medium::WifiLan => 5,
            Medium::WifiDirect => 8,
            Medium::WebRtc => 9,
        }
    }

    /// The error status reported when this medium fails.
    pub fn error_status(&self) -> Status {
        match self {
            Medium::Bluetooth => Status::BluetoothError,
            Medium::Ble => Status::BleError,
            Medium::WifiLan => Status::WifiLanError,
            _ => Status::Error,
        }
    }
}

/// Failure of a raw stream operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoError;

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("stream I/O failure")
    }
}

impl std::error::Error for IoError {}

/// Blocking byte source of a socket.
pub trait InputStream: Send {
    /// Reads at most `limit` bytes, blocking until some data is available.
    /// An empty result means end of stream; a closed socket yields
    /// `IoError`.
    fn read(&mut self, limit: usize) -> Result<Vec<u8>, IoError>;
}

/// Blocking byte sink of a socket.
pub trait OutputStream: Send {
    fn write(&mut self, data: &[u8]) -> Result<(), IoError>;
    fn flush(&mut self) -> Result<(), IoError>;
}

/// Closes a socket out-of-band: both of its streams start failing with
/// `IoError` and any blocked read is woken.
pub type ShutdownHandle = Arc<dyn Fn() + Send + Sync>;

/// The split parts of a connected socket.
pub struct SocketIo {
    pub input: Box<dyn InputStream>,
    pub output: Box<dyn OutputStream>,
    pub shutdown: ShutdownHandle,
}

/// A connected medium socket.
pub trait Socket: Send {
    /// Medium this socket runs on.
    fn medium(&self) -> Medium;
    /// Debug identity of the remote end.
    fn remote(&self) -> String;
    /// Consumes the socket, handing out its independently-owned streams.
    fn split(self: Box<Self>) -> SocketIo;
}

/// A single-writer, multi-reader cancellation signal. Setting it is
/// one-way.
#[derive(Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A discovered remote advertiser.
#[derive(Debug, Clone)]
pub struct DiscoveredPeer {
    /// Opaque handle the driver accepts in `connect`.
    pub handle: String,
    /// The raw advertisement the peer broadcast.
    pub advertisement: Vec<u8>,
    pub medium: Medium,
}

/// Callbacks a driver fires while discovery runs.
pub trait DiscoveryHandler: Send + Sync {
    fn on_peer_found(&self, peer: DiscoveredPeer);
    fn on_peer_lost(&self, handle: &str);
}

/// Callback invoked with each accepted incoming socket. Drivers call it
/// from their own accept threads.
pub type AcceptHandler = Arc<dyn Fn(Box<dyn Socket>) + Send + Sync>;

/// The uniform capability set every medium implements.
pub trait MediumDriver: Send + Sync {
    fn medium(&self) -> Medium;

    fn start_advertising(
        &self,
        service_id: &str,
        advertisement: &[u8],
        options: &AdvertisingOptions,
    ) -> Result<(), Status>;
    fn stop_advertising(&self, service_id: &str);

    fn start_discovery(
        &self,
        service_id: &str,
        options: &DiscoveryOptions,
        handler: Arc<dyn DiscoveryHandler>,
    ) -> Result<(), Status>;
    fn stop_discovery(&self, service_id: &str);

    fn start_accepting_connections(
        &self,
        service_id: &str,
        handler: AcceptHandler,
    ) -> Result<(), Status>;
    fn stop_accepting_connections(&self, service_id: &str);

    /// Dials a peer previously surfaced through discovery.
    fn connect(
        &self,
        handle: &str,
        service_id: &str,
        cancel: &CancellationFlag,
    ) -> Result<Box<dyn Socket>, Status>;

    /// Starts hosting an inbound bandwidth-upgrade path, returning the
    /// credentials the peer needs to dial it.
    fn host_upgrade(
        &self,
        service_id: &str,
        handler: AcceptHandler,
    ) -> Result<UpgradeCredentials, Status>;
    fn stop_hosting_upgrade(&self, service_id: &str);

    /// Dials an upgrade path advertised by the peer.
    fn connect_upgrade(
        &self,
        service_id: &str,
        credentials: &UpgradeCredentials,
        cancel: &CancellationFlag,
    ) -> Result<Box<dyn Socket>, Status>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn medium_raw_roundtrip() {
        for medium in [
            Medium::Bluetooth,
            Medium::WifiHotspot,
            Medium::Ble,
            Medium::WifiLan,
            Medium::WifiDirect,
            Medium::WebRtc,
        ] {
            assert_eq!(Medium::from_raw(medium.as_raw()), medium);
        }
        assert_eq!(Medium::from_raw(0), Medium::Unknown);
        assert_eq!(Medium::from_raw(77), Medium::Unknown);
    }

    #[test]
    fn cancellation_is_one_way() {
        let flag = CancellationFlag::new();
        assert!(!flag.is_cancelled());
        let alias = flag.clone();
        alias.cancel();
        assert!(flag.is_cancelled());
    }
}
