//! The pre-connection protocol handler.
//!
//! One handler per PCP variant drives the control plane: advertise,
//! discover, request, authenticate, accept or reject, disconnect. Public
//! operations post onto one serial executor per client, so there is a
//! single linearizable "PCP thread"; incoming sockets are processed on the
//! medium's accept thread and meet the PCP thread only at the client
//! registry lock.
//!
//! Connection establishment is symmetric once a socket exists: run the key
//! exchange, enable encryption, exchange CONNECTION_REQUEST frames, then
//! let both sides' accept/reject decisions race to completion through
//! CONNECTION_RESPONSE frames.

use std::sync::Arc;

use log::{debug, info, warn};
use rand::Rng;
use uuid::Uuid;

use crate::adv::ble::BleAdvertisement;
use crate::adv::{service_id_hash, Pcp};
use crate::channel::EndpointChannel;
use crate::client::{Client, Connection, ConnectionStatus, DiscoveredEndpoint, IncomingDecision};
use crate::core::{
    AdvertisingOptions, ConnectionInfo, ConnectionListener, ConnectionOptions, DiscoveryListener,
    DiscoveryOptions, PayloadListener,
};
use crate::endpoint_manager::{EndpointManager, FrameProcessor};
use crate::frame::{ConnectionRequest, OfflineFrame, V1Frame};
use crate::handshake;
use crate::medium::{
    CancellationFlag, DiscoveredPeer, DiscoveryHandler, Medium, MediumDriver, Socket,
};
use crate::runtime::{CountDownLatch, SerialExecutor};
use crate::Status;

/// Wire status accompanying a rejecting CONNECTION_RESPONSE.
const RESPONSE_REJECTED: i32 = 1;
/// Wire status accompanying an accepting CONNECTION_RESPONSE.
const RESPONSE_ACCEPTED: i32 = 0;

/// Control plane for one client under one PCP variant.
pub struct PcpHandler {
    pcp: Pcp,
    client: Arc<Client>,
    endpoint_manager: Arc<EndpointManager>,
    mediums: Vec<Arc<dyn MediumDriver>>,
    executor: SerialExecutor,
}

impl PcpHandler {
    pub fn new(
        pcp: Pcp,
        client: Arc<Client>,
        endpoint_manager: Arc<EndpointManager>,
        mediums: Vec<Arc<dyn MediumDriver>>,
    ) -> Arc<PcpHandler> {
        Arc::new(PcpHandler {
            pcp,
            client,
            endpoint_manager,
            mediums,
            executor: SerialExecutor::new("pcp"),
        })
    }

    pub fn pcp(&self) -> Pcp {
        self.pcp
    }

    fn driver_for(&self, medium: Medium) -> Option<Arc<dyn MediumDriver>> {
        self.mediums.iter().find(|d| d.medium() == medium).cloned()
    }

    fn supported_mediums(&self) -> Vec<Medium> {
        self.mediums.iter().map(|d| d.medium()).collect()
    }

    // Advertising.

    pub fn start_advertising(
        self: &Arc<Self>,
        service_id: &str,
        endpoint_info: &[u8],
        options: AdvertisingOptions,
        listener: ConnectionListener,
    ) -> Result<(), Status> {
        let handler = self.clone();
        let service_id = service_id.to_owned();
        let endpoint_info = endpoint_info.to_owned();
        self.executor.run_and_wait(move || {
            handler
                .client
                .started_advertising(&service_id, &endpoint_info, Arc::new(listener), options.clone())?;

            let local_endpoint_id = handler.client.local_endpoint_id();
            let advertisement = BleAdvertisement::new(
                handler.pcp,
                service_id_hash(&service_id),
                &local_endpoint_id,
                &endpoint_info,
                None,
            )
            .encode()
            .map_err(|_| Status::Error)?;

            let mut last_error = Status::Error;
            let mut started = 0;
            for driver in &handler.mediums {
                let accept = {
                    let handler = handler.clone();
                    let service_id = service_id.clone();
                    Arc::new(move |socket: Box<dyn Socket>| {
                        handler.on_incoming_socket(socket, &service_id);
                    })
                };
                if let Err(err) = driver.start_accepting_connections(&service_id, accept) {
                    last_error = err;
                    continue;
                }
                match driver.start_advertising(&service_id, &advertisement, &options) {
                    Ok(()) => started += 1,
                    Err(err) => {
                        driver.stop_accepting_connections(&service_id);
                        last_error = err;
                    }
                }
            }

            if started == 0 {
                handler.client.stopped_advertising();
                return Err(last_error);
            }
            info!(
                "advertising {} as {} on {} mediums",
                service_id, local_endpoint_id, started
            );
            Ok(())
        })
    }

    pub fn stop_advertising(self: &Arc<Self>) -> Result<(), Status> {
        let handler = self.clone();
        self.executor.run_and_wait(move || {
            if let Some(service_id) = handler.client.advertising_service_id() {
                for driver in &handler.mediums {
                    driver.stop_advertising(&service_id);
                    driver.stop_accepting_connections(&service_id);
                }
                handler.client.stopped_advertising();
            }
            Ok(())
        })
    }

    // Discovery.

    pub fn start_discovery(
        self: &Arc<Self>,
        service_id: &str,
        options: DiscoveryOptions,
        listener: DiscoveryListener,
    ) -> Result<(), Status> {
        let handler = self.clone();
        let service_id = service_id.to_owned();
        self.executor.run_and_wait(move || {
            handler
                .client
                .started_discovery(&service_id, Arc::new(listener), options.clone())?;

            let watcher = Arc::new(PeerWatcher {
                handler: handler.clone(),
                service_id: service_id.clone(),
            });

            let mut last_error = Status::Error;
            let mut started = 0;
            for driver in &handler.mediums {
                match driver.start_discovery(&service_id, &options, watcher.clone()) {
                    Ok(()) => started += 1,
                    Err(err) => last_error = err,
                }
            }
            if started == 0 {
                handler.client.stopped_discovery();
                return Err(last_error);
            }
            debug!("discovering {} on {} mediums", service_id, started);
            Ok(())
        })
    }

    pub fn stop_discovery(self: &Arc<Self>) -> Result<(), Status> {
        let handler = self.clone();
        self.executor.run_and_wait(move || {
            if let Some(service_id) = handler.client.discovery_service_id() {
                for driver in &handler.mediums {
                    driver.stop_discovery(&service_id);
                }
                handler.client.stopped_discovery();
            }
            Ok(())
        })
    }

    // Connection establishment, outgoing.

    pub fn request_connection(
        self: &Arc<Self>,
        endpoint_id: &str,
        endpoint_info: &[u8],
        _options: ConnectionOptions,
        listener: ConnectionListener,
    ) -> Result<(), Status> {
        let handler = self.clone();
        let endpoint_id = endpoint_id.to_owned();
        let endpoint_info = endpoint_info.to_owned();
        self.executor.run_and_wait(move || {
            if !handler.client.is_discovering() {
                return Err(Status::OutOfOrderApiCall);
            }
            if handler.client.has_connection(&endpoint_id) {
                return Err(Status::AlreadyConnectedToEndpoint);
            }
            handler.check_outgoing_allowed()?;

            let discovered = handler
                .client
                .discovered_endpoint(&endpoint_id)
                .ok_or(Status::EndpointUnknown)?;
            let driver = handler
                .driver_for(discovered.medium)
                .ok_or(Status::EndpointUnknown)?;

            let cancel = CancellationFlag::new();
            let socket = driver
                .connect(&discovered.handle, &discovered.service_id, &cancel)
                .map_err(|_| discovered.medium.error_status())?;
            let channel = EndpointChannel::from_socket(
                &format!("{}-{}", endpoint_id, Uuid::new_v4()),
                socket,
            );

            let nonce: i32 = rand::thread_rng().gen();
            if let Err(err) =
                handler
                    .client
                    .register_pending_outgoing(&endpoint_id, nonce, channel.clone(), cancel)
            {
                channel.close();
                return Err(err);
            }

            match handler.establish_outgoing(&endpoint_id, &endpoint_info, nonce, &channel, listener)
            {
                Ok(()) => Ok(()),
                Err(err) => {
                    // A lost simultaneous-connect race is not a failure:
                    // the incoming side of the same relationship won.
                    if handler.client.pending_outgoing_yielded(&endpoint_id) {
                        handler.client.take_pending_outgoing(&endpoint_id);
                        debug!("outgoing attempt to {} yielded to incoming", endpoint_id);
                        return Ok(());
                    }
                    handler.client.take_pending_outgoing(&endpoint_id);
                    channel.close();
                    Err(err)
                }
            }
        })
    }

    fn establish_outgoing(
        &self,
        endpoint_id: &str,
        endpoint_info: &[u8],
        nonce: i32,
        channel: &Arc<EndpointChannel>,
        listener: ConnectionListener,
    ) -> Result<(), Status> {
        let result = handshake::initiate(channel)?;
        channel.enable_encryption(result.context.clone());

        let local_endpoint_id = self.client.local_endpoint_id();
        channel
            .write_frame(&OfflineFrame::for_connection_request(
                &local_endpoint_id,
                endpoint_info,
                nonce,
                &self.supported_mediums(),
            ))
            .map_err(|_| Status::EndpointIoError)?;

        let peer_request = read_connection_request(channel)?;
        if peer_request.endpoint_id != endpoint_id {
            warn!(
                "peer introduced itself as {} but was discovered as {}",
                peer_request.endpoint_id, endpoint_id
            );
            return Err(Status::Error);
        }

        self.client.take_pending_outgoing(endpoint_id);
        self.client.add_connection(
            endpoint_id,
            Connection {
                is_incoming: false,
                status: ConnectionStatus::empty(),
                connection_listener: Arc::new(listener),
                payload_listener: None,
                auth_token: result.auth_token.clone(),
                medium: channel.medium(),
                endpoint_info: peer_request.endpoint_info.clone(),
            },
        )?;
        if let Err(err) = self
            .endpoint_manager
            .register_endpoint(&self.client, endpoint_id, channel.clone())
        {
            self.client.remove_connection(endpoint_id);
            return Err(err);
        }

        if let Some(listener) = self.client.connection_listener(endpoint_id) {
            (listener.initiated)(
                endpoint_id,
                &ConnectionInfo {
                    auth_token: result.auth_token,
                    is_incoming: false,
                    endpoint_info: peer_request.endpoint_info,
                },
            );
        }
        Ok(())
    }

    // Connection establishment, incoming. Runs on the medium's accept
    // thread.

    fn on_incoming_socket(&self, socket: Box<dyn Socket>, service_id: &str) {
        let medium = socket.medium();
        let channel =
            EndpointChannel::from_socket(&format!("incoming-{}", Uuid::new_v4()), socket);

        let result = match handshake::respond(&channel) {
            Ok(result) => result,
            Err(_) => {
                warn!("incoming connection on {} failed authentication", service_id);
                channel.close();
                return;
            }
        };
        channel.enable_encryption(result.context.clone());

        let peer_request = match read_connection_request(&channel) {
            Ok(request) => request,
            Err(_) => {
                channel.close();
                return;
            }
        };
        let peer_id = peer_request.endpoint_id.clone();

        if peer_id == self.client.local_endpoint_id() {
            debug!("ignoring connection from our own endpoint id");
            channel.close();
            return;
        }

        match self.client.arbitrate_incoming(&peer_id, peer_request.nonce) {
            IncomingDecision::Proceed => {}
            IncomingDecision::RejectIncoming => {
                debug!("dropping incoming from {} (outgoing attempt wins)", peer_id);
                channel.close();
                return;
            }
        }

        if !self.check_incoming_allowed() {
            info!("refusing incoming connection from {} under {:?}", peer_id, self.pcp);
            channel.close();
            return;
        }

        let listener = self
            .client
            .advertising_listener()
            .unwrap_or_else(|| Arc::new(ConnectionListener::default()));
        if self
            .client
            .add_connection(
                &peer_id,
                Connection {
                    is_incoming: true,
                    status: ConnectionStatus::empty(),
                    connection_listener: listener,
                    payload_listener: None,
                    auth_token: result.auth_token.clone(),
                    medium,
                    endpoint_info: peer_request.endpoint_info.clone(),
                },
            )
            .is_err()
        {
            channel.close();
            return;
        }

        let our_nonce: i32 = rand::thread_rng().gen();
        let our_info = self.client.advertising_endpoint_info().unwrap_or_default();
        let local_endpoint_id = self.client.local_endpoint_id();
        if channel
            .write_frame(&OfflineFrame::for_connection_request(
                &local_endpoint_id,
                &our_info,
                our_nonce,
                &self.supported_mediums(),
            ))
            .is_err()
        {
            self.client.remove_connection(&peer_id);
            channel.close();
            return;
        }

        if self
            .endpoint_manager
            .register_endpoint(&self.client, &peer_id, channel.clone())
            .is_err()
        {
            self.client.remove_connection(&peer_id);
            channel.close();
            return;
        }

        if let Some(listener) = self.client.connection_listener(&peer_id) {
            (listener.initiated)(
                &peer_id,
                &ConnectionInfo {
                    auth_token: result.auth_token,
                    is_incoming: true,
                    endpoint_info: peer_request.endpoint_info,
                },
            );
        }
    }

    // Local decisions.

    pub fn accept_connection(
        self: &Arc<Self>,
        endpoint_id: &str,
        payload_listener: PayloadListener,
    ) -> Result<(), Status> {
        let handler = self.clone();
        let endpoint_id = endpoint_id.to_owned();
        self.executor.run_and_wait(move || {
            let status = handler
                .client
                .local_accepted(&endpoint_id, Arc::new(payload_listener))?;
            handler.send_response(&endpoint_id, RESPONSE_ACCEPTED)?;
            handler.evaluate_connection(&endpoint_id, status);
            Ok(())
        })
    }

    pub fn reject_connection(self: &Arc<Self>, endpoint_id: &str) -> Result<(), Status> {
        let handler = self.clone();
        let endpoint_id = endpoint_id.to_owned();
        self.executor.run_and_wait(move || {
            let status = handler.client.local_rejected(&endpoint_id)?;
            handler.send_response(&endpoint_id, RESPONSE_REJECTED)?;
            handler.evaluate_connection(&endpoint_id, status);
            Ok(())
        })
    }

    fn send_response(&self, endpoint_id: &str, status: i32) -> Result<(), Status> {
        let channel = self
            .endpoint_manager
            .channel_for(endpoint_id)
            .ok_or(Status::EndpointUnknown)?;
        channel
            .write_frame(&OfflineFrame::for_connection_response(status))
            .map_err(|_| Status::EndpointIoError)
    }

    /// Advances the endpoint once decisions land: a single rejection is
    /// terminal immediately; both acceptances connect.
    fn evaluate_connection(&self, endpoint_id: &str, status: ConnectionStatus) {
        if status.any_rejected() {
            let connection = self.client.remove_connection(endpoint_id);
            // Rejection is terminal; close the channel without a
            // disconnect callback.
            self.endpoint_manager.unregister_endpoint_async(endpoint_id);
            if let Some(connection) = connection {
                info!("{} rejected", endpoint_id);
                (connection.connection_listener.rejected)(endpoint_id, Status::ConnectionRejected);
            }
            return;
        }

        if status.both_decided() && status.both_accepted() {
            if let Ok(listener) = self.client.set_connected(endpoint_id) {
                info!("{} connected", endpoint_id);
                (listener.accepted)(endpoint_id);
            }
        }
    }

    // Teardown.

    pub fn disconnect(self: &Arc<Self>, endpoint_id: &str) -> Result<(), Status> {
        let handler = self.clone();
        let endpoint_id = endpoint_id.to_owned();
        self.executor.run_and_wait(move || {
            if !handler.client.has_connection(&endpoint_id) {
                return Err(Status::NotConnectedToEndpoint);
            }
            handler.endpoint_manager.unregister_endpoint(&endpoint_id);
            handler.client.remove_connection(&endpoint_id);
            Ok(())
        })
    }

    /// Stops everything: advertising, discovery, all endpoints.
    pub fn stop_all(self: &Arc<Self>) -> Result<(), Status> {
        let _ = self.stop_advertising();
        let _ = self.stop_discovery();
        let handler = self.clone();
        self.executor.run_and_wait(move || {
            for endpoint_id in handler.client.all_connection_endpoints() {
                handler.endpoint_manager.unregister_endpoint(&endpoint_id);
            }
            handler.client.reset();
            Ok(())
        })
    }

    // PCP cardinality rules.

    fn check_outgoing_allowed(&self) -> Result<(), Status> {
        match self.pcp {
            Pcp::P2pPointToPoint => {
                if self.client.connection_count() > 0 || self.client.outgoing_connection_count() > 0
                {
                    return Err(Status::OutOfOrderApiCall);
                }
            }
            Pcp::P2pStar => {
                if !self.client.is_advertising() && self.client.outgoing_connection_count() > 0 {
                    return Err(Status::OutOfOrderApiCall);
                }
            }
            Pcp::P2pCluster => {}
        }
        Ok(())
    }

    fn check_incoming_allowed(&self) -> bool {
        match self.pcp {
            Pcp::P2pPointToPoint => self.client.connection_count() == 0,
            Pcp::P2pStar | Pcp::P2pCluster => true,
        }
    }
}

/// Translates raw medium discovery events into client-level endpoint
/// events.
struct PeerWatcher {
    handler: Arc<PcpHandler>,
    service_id: String,
}

impl DiscoveryHandler for PeerWatcher {
    fn on_peer_found(&self, peer: DiscoveredPeer) {
        let advertisement = match BleAdvertisement::decode(&peer.advertisement) {
            Ok(advertisement) => advertisement,
            Err(err) => {
                debug!("undecodable advertisement: {}", err);
                return;
            }
        };
        if advertisement.service_id_hash != service_id_hash(&self.service_id) {
            return;
        }
        if advertisement.pcp != self.handler.pcp {
            debug!(
                "ignoring advertisement with foreign pcp {:?}",
                advertisement.pcp
            );
            return;
        }

        let endpoint_id = advertisement.endpoint_id.clone();
        let fresh = self.handler.client.on_endpoint_found(
            &endpoint_id,
            DiscoveredEndpoint {
                endpoint_info: advertisement.endpoint_info.clone(),
                medium: peer.medium,
                handle: peer.handle,
                service_id: self.service_id.clone(),
            },
        );
        if fresh {
            if let Some(listener) = self.handler.client.discovery_listener() {
                (listener.endpoint_found)(
                    &endpoint_id,
                    &advertisement.endpoint_info,
                    &self.service_id,
                );
            }
        }
    }

    fn on_peer_lost(&self, handle: &str) {
        let endpoint_id = match self.handler.client.endpoint_id_for_handle(handle) {
            Some(endpoint_id) => endpoint_id,
            None => return,
        };
        if self.handler.client.on_endpoint_lost(&endpoint_id) {
            if let Some(listener) = self.handler.client.discovery_listener() {
                (listener.endpoint_lost)(&endpoint_id);
            }
        }
    }
}

fn read_connection_request(channel: &EndpointChannel) -> Result<ConnectionRequest, Status> {
    let frame = channel.read_frame().map_err(|_| Status::Error)?;
    let OfflineFrame::V1(v1) = frame;
    match v1 {
        V1Frame::ConnectionRequest(request) => Ok(request),
        other => {
            warn!(
                "expected CONNECTION_REQUEST, got {:?}",
                other.frame_type()
            );
            Err(Status::Error)
        }
    }
}

impl FrameProcessor for PcpHandler {
    fn on_incoming_frame(
        &self,
        frame: OfflineFrame,
        endpoint_id: &str,
        client: &Arc<Client>,
        _medium: Medium,
    ) {
        let OfflineFrame::V1(v1) = frame;
        match v1 {
            V1Frame::ConnectionResponse(response) => {
                let accepted = response.status == RESPONSE_ACCEPTED;
                match client.remote_decided(endpoint_id, accepted) {
                    Ok(status) => self.evaluate_connection(endpoint_id, status),
                    Err(_) => debug!("response for unknown endpoint {}", endpoint_id),
                }
            }
            V1Frame::ConnectionRequest(_) => {
                // Requests are consumed during establishment; one here
                // means the peer is confused. Ignore it.
                debug!("unexpected CONNECTION_REQUEST from {}", endpoint_id);
            }
            _ => {}
        }
    }

    fn on_endpoint_disconnect(&self, client: &Arc<Client>, endpoint_id: &str, barrier: &CountDownLatch) {
        client.remove_connection(endpoint_id);
        barrier.count_down();
    }
}
