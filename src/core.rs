//! The per-client public API.
//!
//! A [`Core`] wires one [`Client`] to the endpoint, payload and bandwidth
//! upgrade managers over a set of medium drivers, and exposes the dozen
//! operations a platform binding needs: advertise, discover, request,
//! accept/reject, send/cancel payloads, disconnect, upgrade.
//!
//! Every operation returns its [`Status`] synchronously; asynchronous
//! events (found endpoints, connection lifecycle, payloads, progress)
//! arrive through the listener structs registered with the corresponding
//! start call. Listener callbacks fire on runtime worker threads and must
//! not block for long.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::adv::Pcp;
use crate::bwu::BwuManager;
use crate::client::Client;
use crate::endpoint_manager::{EndpointManager, FrameProcessor};
use crate::frame::FrameType;
use crate::medium::{Medium, MediumDriver};
use crate::payload::manager::PayloadManager;
use crate::payload::{Payload, PayloadId, PayloadProgress};
use crate::pcp::PcpHandler;
use crate::Status;

/// Connection topology, the public face of the PCP variants.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Strategy {
    /// Any-to-any, M-to-N.
    P2pCluster,
    /// One hub, many spokes.
    P2pStar,
    /// Exactly one connection at a time.
    P2pPointToPoint,
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::P2pCluster
    }
}

impl Strategy {
    pub(crate) fn pcp(self) -> Pcp {
        match self {
            Strategy::P2pCluster => Pcp::P2pCluster,
            Strategy::P2pStar => Pcp::P2pStar,
            Strategy::P2pPointToPoint => Pcp::P2pPointToPoint,
        }
    }
}

/// Coarse distance of a discovered endpoint, when the medium can tell.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DistanceInfo {
    Unknown,
    VeryClose,
    Close,
    Far,
}

#[derive(Clone, Default)]
pub struct AdvertisingOptions {
    pub strategy: Strategy,
    /// Upgrade new connections to a faster medium automatically.
    pub auto_upgrade_bandwidth: bool,
}

#[derive(Clone, Default)]
pub struct DiscoveryOptions {
    pub strategy: Strategy,
}

#[derive(Clone, Default)]
pub struct ConnectionOptions {
    pub auto_upgrade_bandwidth: bool,
}

/// What `initiated` learns about the new connection.
pub struct ConnectionInfo {
    /// 4-digit token both users can compare out-of-band.
    pub auth_token: String,
    pub is_incoming: bool,
    /// The peer's endpoint info bytes.
    pub endpoint_info: Vec<u8>,
}

/// Lifecycle callbacks for connections. Unset callbacks default to no-ops.
pub struct ConnectionListener {
    pub initiated: Box<dyn Fn(&str, &ConnectionInfo) + Send + Sync>,
    pub accepted: Box<dyn Fn(&str) + Send + Sync>,
    pub rejected: Box<dyn Fn(&str, Status) + Send + Sync>,
    pub disconnected: Box<dyn Fn(&str) + Send + Sync>,
    pub bandwidth_changed: Box<dyn Fn(&str, Medium) + Send + Sync>,
}

impl Default for ConnectionListener {
    fn default() -> Self {
        ConnectionListener {
            initiated: Box::new(|_, _| {}),
            accepted: Box::new(|_| {}),
            rejected: Box::new(|_, _| {}),
            disconnected: Box::new(|_| {}),
            bandwidth_changed: Box::new(|_, _| {}),
        }
    }
}

/// Discovery callbacks.
pub struct DiscoveryListener {
    /// `(endpoint_id, endpoint_info, service_id)`.
    pub endpoint_found: Box<dyn Fn(&str, &[u8], &str) + Send + Sync>,
    pub endpoint_lost: Box<dyn Fn(&str) + Send + Sync>,
    pub endpoint_distance_changed: Box<dyn Fn(&str, DistanceInfo) + Send + Sync>,
}

impl Default for DiscoveryListener {
    fn default() -> Self {
        DiscoveryListener {
            endpoint_found: Box::new(|_, _, _| {}),
            endpoint_lost: Box::new(|_| {}),
            endpoint_distance_changed: Box::new(|_, _| {}),
        }
    }
}

/// Payload delivery callbacks, registered with `accept_connection`.
pub struct PayloadListener {
    pub payload: Box<dyn Fn(&str, Payload) + Send + Sync>,
    pub payload_progress: Box<dyn Fn(&str, &PayloadProgress) + Send + Sync>,
}

impl Default for PayloadListener {
    fn default() -> Self {
        PayloadListener {
            payload: Box::new(|_, _| {}),
            payload_progress: Box::new(|_, _| {}),
        }
    }
}

/// One client's connections runtime.
pub struct Core {
    client: Arc<Client>,
    endpoint_manager: Arc<EndpointManager>,
    payload_manager: Arc<PayloadManager>,
    bwu_manager: Arc<BwuManager>,
    mediums: Vec<Arc<dyn MediumDriver>>,
    handler: Mutex<Option<(Strategy, Arc<PcpHandler>)>>,
}

impl Core {
    /// Builds a runtime over the given medium drivers.
    pub fn new(mediums: Vec<Arc<dyn MediumDriver>>) -> Core {
        let client = Client::new();
        let endpoint_manager = EndpointManager::new();
        let payload_manager = PayloadManager::new(endpoint_manager.clone());
        let bwu_manager = BwuManager::new(
            client.clone(),
            endpoint_manager.clone(),
            mediums.clone(),
        );

        let payload_dyn: Arc<dyn FrameProcessor> = payload_manager.clone();
        let payload_weak: Weak<dyn FrameProcessor> = Arc::downgrade(&payload_dyn);
        endpoint_manager.register_frame_processor(FrameType::PayloadTransfer, payload_weak);
        let bwu_dyn: Arc<dyn FrameProcessor> = bwu_manager.clone();
        let bwu_weak: Weak<dyn FrameProcessor> = Arc::downgrade(&bwu_dyn);
        endpoint_manager
            .register_frame_processor(FrameType::BandwidthUpgradeNegotiation, bwu_weak);

        Core {
            client,
            endpoint_manager,
            payload_manager,
            bwu_manager,
            mediums,
            handler: Mutex::new(None),
        }
    }

    /// The local endpoint ID other devices will see.
    pub fn local_endpoint_id(&self) -> String {
        self.client.local_endpoint_id()
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    /// Resolves (or creates) the PCP handler for `strategy`. Mixing
    /// strategies without a `stop_all_endpoints` in between is refused.
    fn handler_for(&self, strategy: Strategy) -> Result<Arc<PcpHandler>, Status> {
        let mut slot = self.handler.lock();
        if let Some((active, handler)) = &*slot {
            return if *active == strategy {
                Ok(handler.clone())
            } else {
                Err(Status::AlreadyHaveActiveStrategy)
            };
        }

        let handler = PcpHandler::new(
            strategy.pcp(),
            self.client.clone(),
            self.endpoint_manager.clone(),
            self.mediums.clone(),
        );
        let handler_dyn: Arc<dyn FrameProcessor> = handler.clone();
        let weak: Weak<dyn FrameProcessor> = Arc::downgrade(&handler_dyn);
        self.endpoint_manager
            .register_frame_processor(FrameType::ConnectionRequest, weak.clone());
        self.endpoint_manager
            .register_frame_processor(FrameType::ConnectionResponse, weak);
        *slot = Some((strategy, handler.clone()));
        Ok(handler)
    }

    fn current_handler(&self) -> Result<Arc<PcpHandler>, Status> {
        self.handler
            .lock()
            .as_ref()
            .map(|(_, handler)| handler.clone())
            .ok_or(Status::OutOfOrderApiCall)
    }

    pub fn start_advertising(
        &self,
        service_id: &str,
        endpoint_info: &[u8],
        options: AdvertisingOptions,
        listener: ConnectionListener,
    ) -> Result<(), Status> {
        let handler = self.handler_for(options.strategy)?;
        handler.start_advertising(service_id, endpoint_info, options, listener)
    }

    pub fn stop_advertising(&self) -> Result<(), Status> {
        match self.current_handler() {
            Ok(handler) => handler.stop_advertising(),
            Err(_) => Ok(()),
        }
    }

    pub fn start_discovery(
        &self,
        service_id: &str,
        options: DiscoveryOptions,
        listener: DiscoveryListener,
    ) -> Result<(), Status> {
        let handler = self.handler_for(options.strategy)?;
        handler.start_discovery(service_id, options, listener)
    }

    pub fn stop_discovery(&self) -> Result<(), Status> {
        match self.current_handler() {
            Ok(handler) => handler.stop_discovery(),
            Err(_) => Ok(()),
        }
    }

    pub fn request_connection(
        &self,
        endpoint_id: &str,
        endpoint_info: &[u8],
        options: ConnectionOptions,
        listener: ConnectionListener,
    ) -> Result<(), Status> {
        self.current_handler()?
            .request_connection(endpoint_id, endpoint_info, options, listener)
    }

    pub fn accept_connection(
        &self,
        endpoint_id: &str,
        payload_listener: PayloadListener,
    ) -> Result<(), Status> {
        self.current_handler()?
            .accept_connection(endpoint_id, payload_listener)
    }

    pub fn reject_connection(&self, endpoint_id: &str) -> Result<(), Status> {
        self.current_handler()?.reject_connection(endpoint_id)
    }

    pub fn send_payload(&self, endpoint_ids: &[String], payload: Payload) -> Result<(), Status> {
        self.payload_manager
            .send_payload(&self.client, payload, endpoint_ids)
    }

    pub fn cancel_payload(&self, payload_id: PayloadId) -> Result<(), Status> {
        self.payload_manager.cancel_payload(&self.client, payload_id)
    }

    pub fn disconnect_from_endpoint(&self, endpoint_id: &str) -> Result<(), Status> {
        match self.current_handler() {
            Ok(handler) => handler.disconnect(endpoint_id),
            Err(_) => Err(Status::NotConnectedToEndpoint),
        }
    }

    /// Tears down everything this client has going: advertising,
    /// discovery, and every connection. The strategy lock is released, so
    /// the next start call may pick a different one.
    pub fn stop_all_endpoints(&self) -> Result<(), Status> {
        let handler = self.handler.lock().take();
        if let Some((_, handler)) = handler {
            handler.stop_all()?;
        } else {
            self.client.reset();
        }
        Ok(())
    }

    pub fn initiate_bandwidth_upgrade(&self, endpoint_id: &str) -> Result<(), Status> {
        self.bwu_manager.initiate(endpoint_id)
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        let _ = self.stop_all_endpoints();
    }
}
