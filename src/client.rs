//! Per-client connection registry.
//!
//! One [`Client`] is one logical participant: its lazily-generated local
//! endpoint ID, at most one advertising session, at most one discovery
//! session, and the per-endpoint connection state everything else keys off.
//! All state lives behind a single lock; accessors hand out snapshots so no
//! caller ever holds the lock across a callback or a blocking operation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bitflags::bitflags;
use log::debug;
use parking_lot::Mutex;
use rand::Rng;

use crate::channel::EndpointChannel;
use crate::core::{
    AdvertisingOptions, ConnectionListener, DiscoveryListener, DiscoveryOptions, PayloadListener,
};
use crate::medium::{CancellationFlag, Medium};
use crate::{Status, ENDPOINT_ID_LENGTH};

const ENDPOINT_ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

bitflags! {
    /// Both sides' accept/reject decisions, tracked independently.
    pub struct ConnectionStatus: u8 {
        const LOCAL_ACCEPTED  = 1 << 0;
        const LOCAL_REJECTED  = 1 << 1;
        const REMOTE_ACCEPTED = 1 << 2;
        const REMOTE_REJECTED = 1 << 3;
        const CONNECTED       = 1 << 4;
    }
}

impl ConnectionStatus {
    pub fn local_decided(&self) -> bool {
        self.intersects(ConnectionStatus::LOCAL_ACCEPTED | ConnectionStatus::LOCAL_REJECTED)
    }

    pub fn remote_decided(&self) -> bool {
        self.intersects(ConnectionStatus::REMOTE_ACCEPTED | ConnectionStatus::REMOTE_REJECTED)
    }

    pub fn both_decided(&self) -> bool {
        self.local_decided() && self.remote_decided()
    }

    pub fn both_accepted(&self) -> bool {
        self.contains(ConnectionStatus::LOCAL_ACCEPTED | ConnectionStatus::REMOTE_ACCEPTED)
    }

    pub fn any_rejected(&self) -> bool {
        self.intersects(ConnectionStatus::LOCAL_REJECTED | ConnectionStatus::REMOTE_REJECTED)
    }

    pub fn is_connected(&self) -> bool {
        self.contains(ConnectionStatus::CONNECTED)
    }
}

/// State of one endpoint relationship.
pub struct Connection {
    pub is_incoming: bool,
    pub status: ConnectionStatus,
    pub connection_listener: Arc<ConnectionListener>,
    pub payload_listener: Option<Arc<PayloadListener>>,
    pub auth_token: String,
    pub medium: Medium,
    pub endpoint_info: Vec<u8>,
}

/// A remote advertiser surfaced by discovery.
#[derive(Clone)]
pub struct DiscoveredEndpoint {
    pub endpoint_info: Vec<u8>,
    pub medium: Medium,
    pub handle: String,
    pub service_id: String,
}

/// An in-flight outgoing connection attempt, tracked for simultaneous-
/// connect arbitration.
pub struct PendingAttempt {
    pub nonce: i32,
    pub channel: Arc<EndpointChannel>,
    pub cancel: CancellationFlag,
    pub yielded: bool,
}

/// What to do with an incoming connection request given local state.
#[derive(Debug, PartialEq, Eq)]
pub enum IncomingDecision {
    /// No conflicting attempt (or ours yielded); take the incoming one.
    Proceed,
    /// Our outgoing attempt wins; drop the incoming socket.
    RejectIncoming,
}

struct AdvertisingState {
    service_id: String,
    endpoint_info: Vec<u8>,
    listener: Arc<ConnectionListener>,
    #[allow(dead_code)]
    options: AdvertisingOptions,
}

struct DiscoveryState {
    service_id: String,
    listener: Arc<DiscoveryListener>,
    #[allow(dead_code)]
    options: DiscoveryOptions,
}

#[derive(Default)]
struct ClientInner {
    local_endpoint_id: Option<String>,
    advertising: Option<AdvertisingState>,
    discovery: Option<DiscoveryState>,
    connections: HashMap<String, Connection>,
    discovered: HashMap<String, DiscoveredEndpoint>,
    /// Endpoint IDs already reported found, to suppress duplicate
    /// callbacks across overlapping scans.
    seen_endpoint_ids: HashSet<String>,
    pending_outgoing: HashMap<String, PendingAttempt>,
}

/// Process-wide logical identity plus its registry.
#[derive(Default)]
pub struct Client {
    inner: Mutex<ClientInner>,
}

impl Client {
    pub fn new() -> Arc<Client> {
        Arc::new(Client::default())
    }

    /// The 4-character local endpoint ID, generated on first use.
    pub fn local_endpoint_id(&self) -> String {
        let mut inner = self.inner.lock();
        inner
            .local_endpoint_id
            .get_or_insert_with(|| {
                let mut rng = rand::thread_rng();
                (0..ENDPOINT_ID_LENGTH)
                    .map(|_| {
                        ENDPOINT_ID_ALPHABET[rng.gen_range(0..ENDPOINT_ID_ALPHABET.len())] as char
                    })
                    .collect()
            })
            .clone()
    }

    // Advertising.

    pub fn started_advertising(
        &self,
        service_id: &str,
        endpoint_info: &[u8],
        listener: Arc<ConnectionListener>,
        options: AdvertisingOptions,
    ) -> Result<(), Status> {
        let mut inner = self.inner.lock();
        if inner.advertising.is_some() {
            return Err(Status::AlreadyAdvertising);
        }
        inner.advertising = Some(AdvertisingState {
            service_id: service_id.to_owned(),
            endpoint_info: endpoint_info.to_owned(),
            listener,
            options,
        });
        Ok(())
    }

    pub fn stopped_advertising(&self) -> bool {
        self.inner.lock().advertising.take().is_some()
    }

    pub fn is_advertising(&self) -> bool {
        self.inner.lock().advertising.is_some()
    }

    pub fn advertising_service_id(&self) -> Option<String> {
        self.inner
            .lock()
            .advertising
            .as_ref()
            .map(|a| a.service_id.clone())
    }

    pub fn advertising_listener(&self) -> Option<Arc<ConnectionListener>> {
        self.inner
            .lock()
            .advertising
            .as_ref()
            .map(|a| a.listener.clone())
    }

    pub fn advertising_endpoint_info(&self) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .advertising
            .as_ref()
            .map(|a| a.endpoint_info.clone())
    }

    // Discovery.

    pub fn started_discovery(
        &self,
        service_id: &str,
        listener: Arc<DiscoveryListener>,
        options: DiscoveryOptions,
    ) -> Result<(), Status> {
        let mut inner = self.inner.lock();
        if inner.discovery.is_some() {
            return Err(Status::AlreadyDiscovering);
        }
        inner.discovery = Some(DiscoveryState {
            service_id: service_id.to_owned(),
            listener,
            options,
        });
        Ok(())
    }

    pub fn stopped_discovery(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.discovered.clear();
        inner.discovery.take().is_some()
    }

    pub fn is_discovering(&self) -> bool {
        self.inner.lock().discovery.is_some()
    }

    pub fn discovery_service_id(&self) -> Option<String> {
        self.inner
            .lock()
            .discovery
            .as_ref()
            .map(|d| d.service_id.clone())
    }

    pub fn discovery_listener(&self) -> Option<Arc<DiscoveryListener>> {
        self.inner
            .lock()
            .discovery
            .as_ref()
            .map(|d| d.listener.clone())
    }

    /// Records a found endpoint. Returns false when the find must be
    /// suppressed (duplicate, or our own ID echoed back).
    pub fn on_endpoint_found(&self, endpoint_id: &str, endpoint: DiscoveredEndpoint) -> bool {
        let mut inner = self.inner.lock();
        if let Some(local) = &inner.local_endpoint_id {
            if local == endpoint_id {
                debug!("ignoring discovery of our own endpoint id");
                return false;
            }
        }
        let first_sighting = inner.seen_endpoint_ids.insert(endpoint_id.to_owned());
        // The first medium to surface an endpoint keeps it; later scans on
        // other mediums only refresh nothing.
        inner
            .discovered
            .entry(endpoint_id.to_owned())
            .or_insert(endpoint);
        first_sighting
    }

    /// Forgets a lost endpoint. Returns whether it was known.
    pub fn on_endpoint_lost(&self, endpoint_id: &str) -> bool {
        let mut inner = self.inner.lock();
        inner.seen_endpoint_ids.remove(endpoint_id);
        inner.discovered.remove(endpoint_id).is_some()
    }

    pub fn discovered_endpoint(&self, endpoint_id: &str) -> Option<DiscoveredEndpoint> {
        self.inner.lock().discovered.get(endpoint_id).cloned()
    }

    /// Reverse lookup from a medium-level handle to the endpoint ID it was
    /// discovered under.
    pub fn endpoint_id_for_handle(&self, handle: &str) -> Option<String> {
        self.inner
            .lock()
            .discovered
            .iter()
            .find(|(_, endpoint)| endpoint.handle == handle)
            .map(|(id, _)| id.clone())
    }

    // Connections.

    pub fn add_connection(&self, endpoint_id: &str, connection: Connection) -> Result<(), Status> {
        let mut inner = self.inner.lock();
        if inner.connections.contains_key(endpoint_id) {
            return Err(Status::AlreadyConnectedToEndpoint);
        }
        inner.connections.insert(endpoint_id.to_owned(), connection);
        Ok(())
    }

    pub fn has_connection(&self, endpoint_id: &str) -> bool {
        self.inner.lock().connections.contains_key(endpoint_id)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().connections.len()
    }

    pub fn outgoing_connection_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.pending_outgoing.len()
            + inner
                .connections
                .values()
                .filter(|c| !c.is_incoming)
                .count()
    }

    pub fn connection_status(&self, endpoint_id: &str) -> Option<ConnectionStatus> {
        self.inner
            .lock()
            .connections
            .get(endpoint_id)
            .map(|c| c.status)
    }

    pub fn connection_medium(&self, endpoint_id: &str) -> Option<Medium> {
        self.inner
            .lock()
            .connections
            .get(endpoint_id)
            .map(|c| c.medium)
    }

    pub fn set_connection_medium(&self, endpoint_id: &str, medium: Medium) {
        if let Some(connection) = self.inner.lock().connections.get_mut(endpoint_id) {
            connection.medium = medium;
        }
    }

    pub fn is_connected_to(&self, endpoint_id: &str) -> bool {
        self.connection_status(endpoint_id)
            .map(|s| s.is_connected())
            .unwrap_or(false)
    }

    pub fn connected_endpoints(&self) -> Vec<String> {
        self.inner
            .lock()
            .connections
            .iter()
            .filter(|(_, c)| c.status.is_connected())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn all_connection_endpoints(&self) -> Vec<String> {
        self.inner.lock().connections.keys().cloned().collect()
    }

    /// Records the local accept and the payload listener that will receive
    /// this endpoint's payloads.
    pub fn local_accepted(
        &self,
        endpoint_id: &str,
        payload_listener: Arc<PayloadListener>,
    ) -> Result<ConnectionStatus, Status> {
        let mut inner = self.inner.lock();
        let connection = inner
            .connections
            .get_mut(endpoint_id)
            .ok_or(Status::EndpointUnknown)?;
        if connection.status.local_decided() || connection.status.is_connected() {
            return Err(Status::OutOfOrderApiCall);
        }
        connection.status |= ConnectionStatus::LOCAL_ACCEPTED;
        connection.payload_listener = Some(payload_listener);
        Ok(connection.status)
    }

    pub fn local_rejected(&self, endpoint_id: &str) -> Result<ConnectionStatus, Status> {
        let mut inner = self.inner.lock();
        let connection = inner
            .connections
            .get_mut(endpoint_id)
            .ok_or(Status::EndpointUnknown)?;
        if connection.status.local_decided() || connection.status.is_connected() {
            return Err(Status::OutOfOrderApiCall);
        }
        connection.status |= ConnectionStatus::LOCAL_REJECTED;
        Ok(connection.status)
    }

    pub fn remote_decided(
        &self,
        endpoint_id: &str,
        accepted: bool,
    ) -> Result<ConnectionStatus, Status> {
        let mut inner = self.inner.lock();
        let connection = inner
            .connections
            .get_mut(endpoint_id)
            .ok_or(Status::EndpointUnknown)?;
        connection.status |= if accepted {
            ConnectionStatus::REMOTE_ACCEPTED
        } else {
            ConnectionStatus::REMOTE_REJECTED
        };
        Ok(connection.status)
    }

    /// Marks the connection fully established, returning its listener.
    pub fn set_connected(&self, endpoint_id: &str) -> Result<Arc<ConnectionListener>, Status> {
        let mut inner = self.inner.lock();
        let connection = inner
            .connections
            .get_mut(endpoint_id)
            .ok_or(Status::EndpointUnknown)?;
        connection.status |= ConnectionStatus::CONNECTED;
        Ok(connection.connection_listener.clone())
    }

    pub fn connection_listener(&self, endpoint_id: &str) -> Option<Arc<ConnectionListener>> {
        self.inner
            .lock()
            .connections
            .get(endpoint_id)
            .map(|c| c.connection_listener.clone())
    }

    /// The payload listener, available only once connected; payloads are
    /// never delivered earlier.
    pub fn payload_listener(&self, endpoint_id: &str) -> Option<Arc<PayloadListener>> {
        self.inner
            .lock()
            .connections
            .get(endpoint_id)
            .filter(|c| c.status.is_connected())
            .and_then(|c| c.payload_listener.clone())
    }

    pub fn remove_connection(&self, endpoint_id: &str) -> Option<Connection> {
        self.inner.lock().connections.remove(endpoint_id)
    }

    // Simultaneous-connect arbitration.

    pub fn register_pending_outgoing(
        &self,
        endpoint_id: &str,
        nonce: i32,
        channel: Arc<EndpointChannel>,
        cancel: CancellationFlag,
    ) -> Result<(), Status> {
        let mut inner = self.inner.lock();
        if inner.connections.contains_key(endpoint_id) {
            return Err(Status::AlreadyConnectedToEndpoint);
        }
        if inner.pending_outgoing.contains_key(endpoint_id) {
            return Err(Status::OutOfOrderApiCall);
        }
        inner.pending_outgoing.insert(
            endpoint_id.to_owned(),
            PendingAttempt {
                nonce,
                channel,
                cancel,
                yielded: false,
            },
        );
        Ok(())
    }

    pub fn take_pending_outgoing(&self, endpoint_id: &str) -> Option<PendingAttempt> {
        self.inner.lock().pending_outgoing.remove(endpoint_id)
    }

    pub fn pending_outgoing_yielded(&self, endpoint_id: &str) -> bool {
        self.inner
            .lock()
            .pending_outgoing
            .get(endpoint_id)
            .map(|p| p.yielded)
            .unwrap_or(false)
    }

    /// Decides between a conflicting outgoing attempt and an incoming
    /// request from the same endpoint. The smaller nonce yields; equal
    /// nonces cancel both.
    pub fn arbitrate_incoming(&self, endpoint_id: &str, peer_nonce: i32) -> IncomingDecision {
        let mut inner = self.inner.lock();
        let attempt = match inner.pending_outgoing.get_mut(endpoint_id) {
            Some(attempt) if !attempt.yielded => attempt,
            _ => return IncomingDecision::Proceed,
        };

        if attempt.nonce < peer_nonce {
            debug!(
                "yielding outgoing attempt to {} (nonce {} < {})",
                endpoint_id, attempt.nonce, peer_nonce
            );
            attempt.yielded = true;
            attempt.cancel.cancel();
            attempt.channel.close();
            IncomingDecision::Proceed
        } else if attempt.nonce > peer_nonce {
            IncomingDecision::RejectIncoming
        } else {
            // A true tie: drop both attempts and let the clients retry.
            // Not marked as yielded, so the outgoing caller sees a failure
            // rather than a win by the incoming side.
            attempt.cancel.cancel();
            attempt.channel.close();
            IncomingDecision::RejectIncoming
        }
    }

    /// Clears every piece of state, cancelling in-flight work. Returns the
    /// endpoint IDs that still had connections.
    pub fn reset(&self) -> Vec<String> {
        let mut inner = self.inner.lock();
        inner.advertising = None;
        inner.discovery = None;
        inner.discovered.clear();
        inner.seen_endpoint_ids.clear();
        for attempt in inner.pending_outgoing.values() {
            attempt.cancel.cancel();
            attempt.channel.close();
        }
        inner.pending_outgoing.clear();
        let endpoints: Vec<String> = inner.connections.keys().cloned().collect();
        inner.connections.clear();
        endpoints
    }
}
