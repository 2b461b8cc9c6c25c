use thiserror::Error;

/// Result statuses surfaced through the public API.
///
/// Every public operation reports exactly one of these; `Ok(())` stands in
/// for the wire-level `Success`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum Status {
    #[error("operation failed")]
    Error,
    #[error("API call out of order")]
    OutOfOrderApiCall,
    #[error("a conflicting strategy is already active")]
    AlreadyHaveActiveStrategy,
    #[error("already advertising")]
    AlreadyAdvertising,
    #[error("already discovering")]
    AlreadyDiscovering,
    #[error("already connected to endpoint")]
    AlreadyConnectedToEndpoint,
    #[error("not connected to endpoint")]
    NotConnectedToEndpoint,
    #[error("endpoint unknown")]
    EndpointUnknown,
    #[error("endpoint channel I/O failed")]
    EndpointIoError,
    #[error("bluetooth medium failure")]
    BluetoothError,
    #[error("ble medium failure")]
    BleError,
    #[error("wifi lan medium failure")]
    WifiLanError,
    #[error("payload unknown")]
    PayloadUnknown,
    #[error("connection rejected")]
    ConnectionRejected,
    #[error("authentication failure")]
    Authentication,
    /// Reserved so that peers built against a newer taxonomy do not break us.
    #[doc(hidden)]
    #[error("unrecognized status")]
    NextValue,
}
