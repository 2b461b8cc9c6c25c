//! An in-process medium hub.
//!
//! The hub plays the role of the radio environment: drivers created from
//! the same hub see each other's advertisements, and `connect` produces a
//! cross-wired pair of in-memory sockets, with the acceptor's half handed
//! to its accept callback on a dedicated thread. One hub instance is one
//! "room" of devices; tests create a hub, then one driver per (device,
//! medium).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::core::{AdvertisingOptions, DiscoveryOptions};
use crate::frame::UpgradeCredentials;
use crate::medium::{
    AcceptHandler, CancellationFlag, DiscoveredPeer, DiscoveryHandler, InputStream, IoError,
    Medium, MediumDriver, OutputStream, Socket, SocketIo,
};
use crate::Status;

enum PipeMsg {
    Data(Vec<u8>),
    Eof,
}

struct FakePipeIn {
    rx: Receiver<PipeMsg>,
    pending: Vec<u8>,
    self_closed: Arc<AtomicBool>,
    eof: bool,
}

impl InputStream for FakePipeIn {
    fn read(&mut self, limit: usize) -> Result<Vec<u8>, IoError> {
        loop {
            if self.self_closed.load(Ordering::SeqCst) {
                return Err(IoError);
            }
            if !self.pending.is_empty() {
                let take = self.pending.len().min(limit.max(1));
                let rest = self.pending.split_off(take);
                let head = std::mem::replace(&mut self.pending, rest);
                return Ok(head);
            }
            if self.eof {
                return Ok(Vec::new());
            }
            match self.rx.recv() {
                Ok(PipeMsg::Data(data)) => self.pending = data,
                Ok(PipeMsg::Eof) | Err(_) => self.eof = true,
            }
        }
    }
}

struct FakePipeOut {
    tx: Sender<PipeMsg>,
    self_closed: Arc<AtomicBool>,
    peer_closed: Arc<AtomicBool>,
}

impl OutputStream for FakePipeOut {
    fn write(&mut self, data: &[u8]) -> Result<(), IoError> {
        if self.self_closed.load(Ordering::SeqCst) || self.peer_closed.load(Ordering::SeqCst) {
            return Err(IoError);
        }
        self.tx
            .send(PipeMsg::Data(data.to_vec()))
            .map_err(|_| IoError)
    }

    fn flush(&mut self) -> Result<(), IoError> {
        Ok(())
    }
}

struct FakeSocket {
    medium: Medium,
    remote: String,
    io: SocketIo,
}

impl Socket for FakeSocket {
    fn medium(&self) -> Medium {
        self.medium
    }

    fn remote(&self) -> String {
        self.remote.clone()
    }

    fn split(self: Box<Self>) -> SocketIo {
        self.io
    }
}

/// Builds a cross-wired pair of in-memory sockets.
pub fn socket_pair(medium: Medium, name_a: &str, name_b: &str) -> (Box<dyn Socket>, Box<dyn Socket>) {
    let (a_to_b_tx, a_to_b_rx) = unbounded();
    let (b_to_a_tx, b_to_a_rx) = unbounded();
    let a_closed = Arc::new(AtomicBool::new(false));
    let b_closed = Arc::new(AtomicBool::new(false));

    let make = |rx: Receiver<PipeMsg>,
                tx: Sender<PipeMsg>,
                wake: Sender<PipeMsg>,
                self_closed: Arc<AtomicBool>,
                peer_closed: Arc<AtomicBool>,
                remote: &str| {
        let shutdown_closed = self_closed.clone();
        let shutdown_peer_tx = tx.clone();
        let io = SocketIo {
            input: Box::new(FakePipeIn {
                rx,
                pending: Vec::new(),
                self_closed: self_closed.clone(),
                eof: false,
            }),
            output: Box::new(FakePipeOut {
                tx,
                self_closed,
                peer_closed,
            }),
            shutdown: Arc::new(move || {
                shutdown_closed.store(true, Ordering::SeqCst);
                // Wake a blocked local read and signal EOF to the peer. The
                // sends are best-effort; a dropped receiver means that side
                // is already gone.
                let _ = wake.send(PipeMsg::Eof);
                let _ = shutdown_peer_tx.send(PipeMsg::Eof);
            }),
        };
        Box::new(FakeSocket {
            medium,
            remote: remote.to_owned(),
            io,
        }) as Box<dyn Socket>
    };

    let socket_a = make(
        b_to_a_rx,
        a_to_b_tx.clone(),
        b_to_a_tx.clone(),
        a_closed.clone(),
        b_closed.clone(),
        name_b,
    );
    let socket_b = make(
        a_to_b_rx,
        b_to_a_tx,
        a_to_b_tx,
        b_closed,
        a_closed,
        name_a,
    );
    (socket_a, socket_b)
}

struct Advertiser {
    handle: String,
    advertisement: Vec<u8>,
}

struct Discoverer {
    medium: Medium,
    service_id: String,
    instance: String,
    handler: Arc<dyn DiscoveryHandler>,
}

#[derive(Default)]
struct HubState {
    /// Keyed by (medium, service_id, instance).
    advertisers: HashMap<(Medium, String, String), Advertiser>,
    /// Keyed by the advertiser handle.
    acceptors: HashMap<String, AcceptHandler>,
    discoverers: Vec<Discoverer>,
    /// Keyed by the token embedded in the upgrade credentials.
    upgrade_hosts: HashMap<String, AcceptHandler>,
}

/// The shared radio environment.
#[derive(Default)]
pub struct FakeHub {
    state: Mutex<HubState>,
    upgrade_counter: AtomicU64,
}

impl FakeHub {
    pub fn new() -> Arc<FakeHub> {
        Arc::new(FakeHub::default())
    }

    /// Creates a driver for one device ("instance") on one medium.
    pub fn create_driver(
        hub: &Arc<FakeHub>,
        medium: Medium,
        instance: &str,
    ) -> Arc<dyn MediumDriver> {
        Arc::new(FakeMediumDriver {
            hub: hub.clone(),
            medium,
            instance: instance.to_owned(),
        })
    }

    fn handle_for(medium: Medium, service_id: &str, instance: &str) -> String {
        format!("{}/{}/{}", medium.as_raw(), service_id, instance)
    }
}

/// One device's presence on one medium.
pub struct FakeMediumDriver {
    hub: Arc<FakeHub>,
    medium: Medium,
    instance: String,
}

impl MediumDriver for FakeMediumDriver {
    fn medium(&self) -> Medium {
        self.medium
    }

    fn start_advertising(
        &self,
        service_id: &str,
        advertisement: &[u8],
        _options: &AdvertisingOptions,
    ) -> Result<(), Status> {
        let handle = FakeHub::handle_for(self.medium, service_id, &self.instance);
        let peer = DiscoveredPeer {
            handle: handle.clone(),
            advertisement: advertisement.to_vec(),
            medium: self.medium,
        };

        let watchers: Vec<Arc<dyn DiscoveryHandler>> = {
            let mut state = self.hub.state.lock();
            let key = (self.medium, service_id.to_owned(), self.instance.clone());
            if state.advertisers.contains_key(&key) {
                return Err(Status::AlreadyAdvertising);
            }
            state.advertisers.insert(
                key,
                Advertiser {
                    handle,
                    advertisement: advertisement.to_vec(),
                },
            );
            state
                .discoverers
                .iter()
                .filter(|d| {
                    d.medium == self.medium
                        && d.service_id == service_id
                        && d.instance != self.instance
                })
                .map(|d| d.handler.clone())
                .collect()
        };

        for handler in watchers {
            handler.on_peer_found(peer.clone());
        }
        Ok(())
    }

    fn stop_advertising(&self, service_id: &str) {
        let (handle, watchers) = {
            let mut state = self.hub.state.lock();
            let key = (self.medium, service_id.to_owned(), self.instance.clone());
            let handle = match state.advertisers.remove(&key) {
                Some(adv) => adv.handle,
                None => return,
            };
            let watchers: Vec<Arc<dyn DiscoveryHandler>> = state
                .discoverers
                .iter()
                .filter(|d| {
                    d.medium == self.medium
                        && d.service_id == service_id
                        && d.instance != self.instance
                })
                .map(|d| d.handler.clone())
                .collect();
            (handle, watchers)
        };

        for handler in watchers {
            handler.on_peer_lost(&handle);
        }
    }

    fn start_discovery(
        &self,
        service_id: &str,
        _options: &DiscoveryOptions,
        handler: Arc<dyn DiscoveryHandler>,
    ) -> Result<(), Status> {
        let existing: Vec<DiscoveredPeer> = {
            let mut state = self.hub.state.lock();
            if state
                .discoverers
                .iter()
                .any(|d| d.medium == self.medium && d.service_id == service_id && d.instance == self.instance)
            {
                return Err(Status::AlreadyDiscovering);
            }
            state.discoverers.push(Discoverer {
                medium: self.medium,
                service_id: service_id.to_owned(),
                instance: self.instance.clone(),
                handler: handler.clone(),
            });
            state
                .advertisers
                .iter()
                .filter(|((medium, svc, instance), _)| {
                    *medium == self.medium
                        && svc.as_str() == service_id
                        && instance.as_str() != self.instance
                })
                .map(|(_, adv)| DiscoveredPeer {
                    handle: adv.handle.clone(),
                    advertisement: adv.advertisement.clone(),
                    medium: self.medium,
                })
                .collect()
        };

        for peer in existing {
            handler.on_peer_found(peer);
        }
        Ok(())
    }

    fn stop_discovery(&self, service_id: &str) {
        let mut state = self.hub.state.lock();
        state.discoverers.retain(|d| {
            !(d.medium == self.medium && d.service_id == service_id && d.instance == self.instance)
        });
    }

    fn start_accepting_connections(
        &self,
        service_id: &str,
        handler: AcceptHandler,
    ) -> Result<(), Status> {
        let handle = FakeHub::handle_for(self.medium, service_id, &self.instance);
        self.hub.state.lock().acceptors.insert(handle, handler);
        Ok(())
    }

    fn stop_accepting_connections(&self, service_id: &str) {
        let handle = FakeHub::handle_for(self.medium, service_id, &self.instance);
        self.hub.state.lock().acceptors.remove(&handle);
    }

    fn connect(
        &self,
        handle: &str,
        _service_id: &str,
        cancel: &CancellationFlag,
    ) -> Result<Box<dyn Socket>, Status> {
        if cancel.is_cancelled() {
            return Err(Status::Error);
        }
        let acceptor = self
            .hub
            .state
            .lock()
            .acceptors
            .get(handle)
            .cloned()
            .ok_or_else(|| self.medium.error_status())?;

        let (local, remote) = socket_pair(self.medium, &self.instance, handle);
        thread::Builder::new()
            .name("fake-accept".into())
            .spawn(move || acceptor(remote))
            .map_err(|_| Status::Error)?;
        Ok(local)
    }

    fn host_upgrade(
        &self,
        _service_id: &str,
        handler: AcceptHandler,
    ) -> Result<UpgradeCredentials, Status> {
        let token = self.hub.upgrade_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.hub
            .state
            .lock()
            .upgrade_hosts
            .insert(token.to_string(), handler);

        Ok(match self.medium {
            Medium::WifiLan => UpgradeCredentials::WifiLan {
                ip_address: format!("10.0.0.{}", token % 250 + 1),
                port: token as i32,
            },
            Medium::WifiHotspot | Medium::WifiDirect => UpgradeCredentials::WifiHotspot {
                ssid: format!("DIRECT-{}", self.instance),
                password: "fake-hotspot-pw".into(),
                port: token as i32,
            },
            Medium::Bluetooth | Medium::Ble => UpgradeCredentials::Bluetooth {
                service_name: token.to_string(),
                mac_address: "00:11:22:33:44:55".into(),
            },
            Medium::WebRtc => UpgradeCredentials::WebRtc {
                peer_id: token.to_string(),
            },
            Medium::Unknown => return Err(Status::Error),
        })
    }

    fn stop_hosting_upgrade(&self, _service_id: &str) {
        // Host entries are keyed by token and die with the hub.
    }

    fn connect_upgrade(
        &self,
        _service_id: &str,
        credentials: &UpgradeCredentials,
        cancel: &CancellationFlag,
    ) -> Result<Box<dyn Socket>, Status> {
        if cancel.is_cancelled() {
            return Err(Status::Error);
        }
        let token = match credentials {
            UpgradeCredentials::WifiLan { port, .. } => port.to_string(),
            UpgradeCredentials::WifiHotspot { port, .. } => port.to_string(),
            UpgradeCredentials::Bluetooth { service_name, .. } => service_name.clone(),
            UpgradeCredentials::WebRtc { peer_id } => peer_id.clone(),
        };
        let acceptor = self
            .hub
            .state
            .lock()
            .upgrade_hosts
            .get(&token)
            .cloned()
            .ok_or_else(|| self.medium.error_status())?;

        let (local, remote) = socket_pair(self.medium, &self.instance, &token);
        thread::Builder::new()
            .name("fake-upgrade-accept".into())
            .spawn(move || acceptor(remote))
            .map_err(|_| Status::Error)?;
        Ok(local)
    }
}
