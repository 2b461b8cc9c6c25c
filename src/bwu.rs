//! The bandwidth upgrade manager.
//!
//! Moves a live session from its current medium to a higher-throughput one
//! without touching payload state. The side with the resource to host (the
//! initiator) opens an upgrade path and advertises its credentials over the
//! existing channel; the peer dials the new medium, introduces itself, and
//! the two sides drain and retire the old channel:
//!
//! 1. `UPGRADE_PATH_AVAILABLE` on the old channel, with credentials.
//! 2. The peer connects on the new medium and sends `CLIENT_INTRODUCTION`
//!    in the clear on the new channel; the established encryption context
//!    carries over on both sides.
//! 3. The host sends `LAST_WRITE_TO_PRIOR_CHANNEL` on the old channel and
//!    swaps its channel reference.
//! 4. The peer answers `SAFE_TO_CLOSE_PRIOR_CHANNEL` on the new channel,
//!    swaps, and closes its old half.
//! 5. The host closes the old channel when the confirmation arrives.
//!
//! Any failure produces `UPGRADE_FAILURE` on the still-intact old channel;
//! the initiator then retries on the next medium in priority order.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::channel::EndpointChannel;
use crate::client::Client;
use crate::endpoint_manager::{EndpointManager, FrameProcessor};
use crate::frame::{BandwidthUpgrade, OfflineFrame, UpgradePathInfo, V1Frame};
use crate::medium::{CancellationFlag, Medium, MediumDriver, Socket};
use crate::runtime::{CountDownLatch, SerialExecutor};
use crate::Status;

/// Mediums in descending bandwidth order; the first available wins.
pub const UPGRADE_PRIORITY: [Medium; 6] = [
    Medium::WebRtc,
    Medium::WifiLan,
    Medium::WifiHotspot,
    Medium::WifiDirect,
    Medium::Bluetooth,
    Medium::Ble,
];

/// How long the LAST_WRITE handler waits for the new channel to appear
/// before declaring the upgrade dead.
const NEW_CHANNEL_WAIT: Duration = Duration::from_secs(2);
const NEW_CHANNEL_POLL: Duration = Duration::from_millis(10);

struct UpgradeState {
    medium: Medium,
    is_initiator: bool,
    /// The dialed/accepted replacement channel, encryption already carried
    /// over.
    new_channel: Option<Arc<EndpointChannel>>,
    /// Host side: the superseded channel, closed once the peer confirms.
    prior_channel: Option<Arc<EndpointChannel>>,
    /// Mediums already tried for this endpoint, for failure retries.
    attempted: Vec<Medium>,
}

/// Negotiates medium upgrades for live endpoints.
pub struct BwuManager {
    client: Arc<Client>,
    endpoint_manager: Arc<EndpointManager>,
    mediums: Vec<Arc<dyn MediumDriver>>,
    executor: SerialExecutor,
    state: Mutex<HashMap<String, UpgradeState>>,
    self_ref: std::sync::Weak<BwuManager>,
}

impl BwuManager {
    pub fn new(
        client: Arc<Client>,
        endpoint_manager: Arc<EndpointManager>,
        mediums: Vec<Arc<dyn MediumDriver>>,
    ) -> Arc<BwuManager> {
        Arc::new_cyclic(|self_ref| BwuManager {
            client,
            endpoint_manager,
            mediums,
            executor: SerialExecutor::new("bwu"),
            state: Mutex::new(HashMap::new()),
            self_ref: self_ref.clone(),
        })
    }

    fn self_handle(&self) -> Arc<BwuManager> {
        self.self_ref
            .upgrade()
            .expect("manager used after teardown")
    }

    fn driver_for(&self, medium: Medium) -> Option<Arc<dyn MediumDriver>> {
        self.mediums.iter().find(|d| d.medium() == medium).cloned()
    }

    fn upgrade_service_id(&self, endpoint_id: &str) -> String {
        format!("upgrade/{}/{}", self.client.local_endpoint_id(), endpoint_id)
    }

    /// Starts an upgrade for a connected endpoint. One upgrade at a time
    /// per endpoint.
    pub fn initiate(self: &Arc<Self>, endpoint_id: &str) -> Result<(), Status> {
        let manager = self.clone();
        let endpoint_id = endpoint_id.to_owned();
        self.executor
            .run_and_wait(move || manager.initiate_on_executor(&endpoint_id, &[]))
    }

    fn initiate_on_executor(
        self: &Arc<Self>,
        endpoint_id: &str,
        exclude: &[Medium],
    ) -> Result<(), Status> {
        if !self.client.is_connected_to(endpoint_id) {
            return Err(Status::NotConnectedToEndpoint);
        }
        if self.state.lock().contains_key(endpoint_id) {
            debug!("upgrade already in progress for {}", endpoint_id);
            return Err(Status::Error);
        }

        let current = self
            .client
            .connection_medium(endpoint_id)
            .unwrap_or(Medium::Unknown);
        let medium = UPGRADE_PRIORITY
            .iter()
            .copied()
            .find(|m| *m != current && !exclude.contains(m) && self.driver_for(*m).is_some())
            .ok_or(Status::Error)?;
        let driver = self.driver_for(medium).ok_or(Status::Error)?;

        let accept = {
            let manager = self.clone();
            let endpoint_id = endpoint_id.to_owned();
            Arc::new(move |socket: Box<dyn Socket>| {
                manager.on_incoming_upgrade_socket(socket, &endpoint_id);
            })
        };
        let credentials = driver.host_upgrade(&self.upgrade_service_id(endpoint_id), accept)?;

        let old_channel = self
            .endpoint_manager
            .channel_for(endpoint_id)
            .ok_or(Status::NotConnectedToEndpoint)?;

        let mut attempted = exclude.to_vec();
        attempted.push(medium);
        self.state.lock().insert(
            endpoint_id.to_owned(),
            UpgradeState {
                medium,
                is_initiator: true,
                new_channel: None,
                prior_channel: None,
                attempted,
            },
        );

        let frame = OfflineFrame::for_bwu_path_available(UpgradePathInfo {
            medium,
            credentials: Some(credentials),
        });
        if old_channel.write_frame(&frame).is_err() {
            self.state.lock().remove(endpoint_id);
            return Err(Status::EndpointIoError);
        }
        info!("offered {} an upgrade to {:?}", endpoint_id, medium);
        Ok(())
    }

    /// Host side: an inbound socket on the upgrade path. Runs on the
    /// medium's accept thread.
    fn on_incoming_upgrade_socket(self: &Arc<Self>, socket: Box<dyn Socket>, endpoint_id: &str) {
        let medium = socket.medium();
        let new_channel =
            EndpointChannel::from_socket(&format!("upgrade-{}", Uuid::new_v4()), socket);

        // The introduction arrives in the clear before either side carries
        // the encryption context over.
        let introduced = match new_channel.read_frame() {
            Ok(OfflineFrame::V1(V1Frame::BandwidthUpgrade(BandwidthUpgrade::ClientIntroduction {
                endpoint_id,
            }))) => endpoint_id,
            _ => {
                warn!("upgrade socket did not introduce itself");
                new_channel.close();
                return;
            }
        };
        if introduced != endpoint_id {
            warn!(
                "upgrade socket introduced as {}, expected {}",
                introduced, endpoint_id
            );
            new_channel.close();
            self.fail_upgrade(endpoint_id, medium);
            return;
        }

        let old_channel = match self.endpoint_manager.channel_for(endpoint_id) {
            Some(channel) => channel,
            None => {
                new_channel.close();
                self.state.lock().remove(endpoint_id);
                return;
            }
        };
        if let Some(context) = old_channel.encryption_context() {
            new_channel.enable_encryption(context);
        }

        {
            let mut state = self.state.lock();
            match state.get_mut(endpoint_id) {
                Some(upgrade) => {
                    upgrade.new_channel = Some(new_channel.clone());
                    upgrade.prior_channel = Some(old_channel.clone());
                }
                None => {
                    drop(state);
                    new_channel.close();
                    return;
                }
            }
        }

        // Drain the old channel: our last write goes out on it, then the
        // replacement takes its place under the reader-pause lock. The
        // reader blocked on the old channel resolves once the peer closes
        // its half and recognizes the swap.
        if old_channel
            .write_frame(&OfflineFrame::for_bwu_last_write())
            .is_err()
        {
            new_channel.close();
            self.fail_upgrade(endpoint_id, medium);
            return;
        }
        self.endpoint_manager
            .replace_channel(endpoint_id, new_channel);
    }

    /// Sends UPGRADE_FAILURE over the still-active channel and clears
    /// state.
    fn fail_upgrade(&self, endpoint_id: &str, medium: Medium) {
        self.state.lock().remove(endpoint_id);
        if let Some(channel) = self.endpoint_manager.channel_for(endpoint_id) {
            let _ = channel.write_frame(&OfflineFrame::for_bwu_failure(UpgradePathInfo {
                medium,
                credentials: None,
            }));
        }
    }

    /// Peer side: dial the offered path. Runs on the BWU executor so the
    /// reader thread is never blocked on a connect.
    fn handle_path_available(self: &Arc<Self>, endpoint_id: &str, info: UpgradePathInfo) {
        if self.state.lock().contains_key(endpoint_id) {
            debug!("ignoring upgrade offer for busy endpoint {}", endpoint_id);
            return;
        }
        let old_channel = match self.endpoint_manager.channel_for(endpoint_id) {
            Some(channel) => channel,
            None => return,
        };

        let result = (|| -> Result<Arc<EndpointChannel>, Status> {
            let driver = self.driver_for(info.medium).ok_or(Status::Error)?;
            let credentials = info.credentials.as_ref().ok_or(Status::Error)?;
            let socket = driver.connect_upgrade(
                &self.upgrade_service_id(endpoint_id),
                credentials,
                &CancellationFlag::new(),
            )?;
            let new_channel =
                EndpointChannel::from_socket(&format!("upgrade-{}", Uuid::new_v4()), socket);

            let local_endpoint_id = self.client.local_endpoint_id();
            new_channel
                .write_frame(&OfflineFrame::for_bwu_introduction(&local_endpoint_id))
                .map_err(|_| Status::EndpointIoError)?;
            if let Some(context) = old_channel.encryption_context() {
                new_channel.enable_encryption(context);
            }
            Ok(new_channel)
        })();

        match result {
            Ok(new_channel) => {
                self.state.lock().insert(
                    endpoint_id.to_owned(),
                    UpgradeState {
                        medium: info.medium,
                        is_initiator: false,
                        new_channel: Some(new_channel),
                        prior_channel: None,
                        attempted: Vec::new(),
                    },
                );
            }
            Err(_) => {
                warn!(
                    "could not reach {:?} upgrade path for {}",
                    info.medium, endpoint_id
                );
                let _ = old_channel.write_frame(&OfflineFrame::for_bwu_failure(UpgradePathInfo {
                    medium: info.medium,
                    credentials: None,
                }));
            }
        }
    }

    /// Peer side: the old channel is drained. Runs inline on the reader
    /// thread, which makes "no frame is read from the old channel after
    /// LAST_WRITE" structural.
    fn handle_last_write(&self, endpoint_id: &str) {
        let (new_channel, medium) = {
            // The dialing job stores the channel moments after the host
            // learns of the introduction; allow for that gap.
            let deadline = std::time::Instant::now() + NEW_CHANNEL_WAIT;
            loop {
                {
                    let state = self.state.lock();
                    match state.get(endpoint_id) {
                        Some(upgrade) => {
                            if let Some(channel) = &upgrade.new_channel {
                                break (channel.clone(), upgrade.medium);
                            }
                        }
                        None => {
                            debug!("LAST_WRITE without an upgrade in flight for {}", endpoint_id);
                            return;
                        }
                    }
                }
                if std::time::Instant::now() > deadline {
                    warn!("new channel never materialized for {}", endpoint_id);
                    self.state.lock().remove(endpoint_id);
                    return;
                }
                thread::sleep(NEW_CHANNEL_POLL);
            }
        };

        if new_channel
            .write_frame(&OfflineFrame::for_bwu_safe_to_close())
            .is_err()
        {
            self.state.lock().remove(endpoint_id);
            return;
        }
        if let Some(old) = self
            .endpoint_manager
            .replace_channel(endpoint_id, new_channel)
        {
            old.close();
        }
        self.complete_upgrade(endpoint_id, medium);
    }

    /// Host side: the peer confirmed on the new channel; the old one can
    /// go.
    fn handle_safe_to_close(&self, endpoint_id: &str) {
        let (prior, medium) = {
            let mut state = self.state.lock();
            match state.get_mut(endpoint_id) {
                Some(upgrade) => (upgrade.prior_channel.take(), upgrade.medium),
                None => return,
            }
        };
        if let Some(prior) = prior {
            prior.close();
        }
        self.complete_upgrade(endpoint_id, medium);
    }

    fn handle_upgrade_failure(self: &Arc<Self>, endpoint_id: &str, info: UpgradePathInfo) {
        warn!(
            "{} reported upgrade failure on {:?}",
            endpoint_id, info.medium
        );
        let attempted = match self.state.lock().remove(endpoint_id) {
            Some(upgrade) if upgrade.is_initiator => upgrade.attempted,
            _ => return,
        };
        // Try the next medium down the priority list.
        let manager = self.clone();
        let endpoint_id = endpoint_id.to_owned();
        self.executor.execute(move || {
            if let Err(err) = manager.initiate_on_executor(&endpoint_id, &attempted) {
                debug!("no further upgrade paths for {}: {}", endpoint_id, err);
            }
        });
    }

    fn complete_upgrade(&self, endpoint_id: &str, medium: Medium) {
        if let Some(upgrade) = self.state.lock().remove(endpoint_id) {
            if upgrade.is_initiator {
                if let Some(driver) = self.driver_for(upgrade.medium) {
                    driver.stop_hosting_upgrade(&self.upgrade_service_id(endpoint_id));
                }
            }
        }
        self.client.set_connection_medium(endpoint_id, medium);
        info!("{} now on {:?}", endpoint_id, medium);
        if let Some(listener) = self.client.connection_listener(endpoint_id) {
            (listener.bandwidth_changed)(endpoint_id, medium);
        }
    }
}

impl FrameProcessor for BwuManager {
    fn on_incoming_frame(
        &self,
        frame: OfflineFrame,
        endpoint_id: &str,
        _client: &Arc<Client>,
        _medium: Medium,
    ) {
        let OfflineFrame::V1(v1) = frame;
        let event = match v1 {
            V1Frame::BandwidthUpgrade(event) => event,
            _ => return,
        };

        // `self` is owned by the core behind an Arc; clone a handle for
        // the executor-bound paths.
        match event {
            BandwidthUpgrade::UpgradePathAvailable(info) => {
                let manager = self.self_handle();
                let endpoint_id = endpoint_id.to_owned();
                self.executor
                    .execute(move || manager.handle_path_available(&endpoint_id, info));
            }
            BandwidthUpgrade::LastWriteToPriorChannel => self.handle_last_write(endpoint_id),
            BandwidthUpgrade::SafeToClosePriorChannel => self.handle_safe_to_close(endpoint_id),
            BandwidthUpgrade::ClientIntroduction { .. } => {
                // Introductions belong on fresh upgrade sockets, not on
                // established channels.
                debug!("stray CLIENT_INTRODUCTION from {}", endpoint_id);
            }
            BandwidthUpgrade::UpgradeFailure(info) => {
                let manager = self.self_handle();
                let endpoint_id = endpoint_id.to_owned();
                self.executor
                    .execute(move || manager.handle_upgrade_failure(&endpoint_id, info));
            }
        }
    }

    fn on_endpoint_disconnect(&self, _client: &Arc<Client>, endpoint_id: &str, barrier: &CountDownLatch) {
        if let Some(upgrade) = self.state.lock().remove(endpoint_id) {
            if let Some(channel) = upgrade.new_channel {
                channel.close();
            }
        }
        barrier.count_down();
    }
}
