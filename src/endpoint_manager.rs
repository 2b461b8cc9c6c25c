//! The endpoint manager.
//!
//! Owns the per-endpoint machinery once the PCP handler hands over an
//! authenticated channel: a dedicated reader worker that demultiplexes
//! incoming frames to the registered [`FrameProcessor`]s, and a keep-alive
//! worker that pings the peer every five seconds and tears the endpoint
//! down when nothing was read for thirty.
//!
//! Teardown comes in two flavors with one difference: `unregister_endpoint`
//! is the client's own request and stays silent, `discard_endpoint` is
//! self-initiated (I/O failure, watchdog) and fires the `disconnected`
//! callback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Sender};
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::channel::EndpointChannel;
use crate::client::Client;
use crate::frame::{
    ControlMessage, FrameType, OfflineFrame, PayloadChunk, PayloadHeader,
};
use crate::medium::Medium;
use crate::runtime::{CountDownLatch, SerialExecutor};
use crate::Status;

pub const KEEP_ALIVE_WRITE_INTERVAL: Duration = Duration::from_millis(5000);
pub const KEEP_ALIVE_READ_TIMEOUT: Duration = Duration::from_millis(30_000);
/// How long frame processors get to handle a disconnect before they are
/// abandoned.
pub const PROCESS_DISCONNECTION_TIMEOUT: Duration = Duration::from_millis(2000);
/// How long worker termination may take during teardown.
pub const DISCONNECT_DRAIN_GRACE: Duration = Duration::from_millis(5000);
pub const MAX_CONCURRENT_ENDPOINTS: usize = 50;

/// A consumer of incoming frames of one type, and of endpoint-disconnect
/// events.
pub trait FrameProcessor: Send + Sync {
    /// Called from the endpoint's reader worker for every incoming frame of
    /// a registered type.
    fn on_incoming_frame(
        &self,
        frame: OfflineFrame,
        endpoint_id: &str,
        client: &Arc<Client>,
        medium: Medium,
    );

    /// Called on endpoint teardown, in parallel across processors.
    /// Implementations must count the barrier down when done.
    fn on_endpoint_disconnect(&self, client: &Arc<Client>, endpoint_id: &str, barrier: &CountDownLatch);
}

struct EndpointSlot {
    endpoint_id: String,
    client: Arc<Client>,
    /// Current channel. This mutex doubles as the reader-pause lock a
    /// bandwidth upgrade swaps the channel under.
    channel: Mutex<Arc<EndpointChannel>>,
    /// Both workers count this down on exit.
    barrier: Arc<CountDownLatch>,
    shutdown: Arc<AtomicBool>,
    keep_alive_stop: Sender<()>,
}

impl EndpointSlot {
    fn current_channel(&self) -> Arc<EndpointChannel> {
        self.channel.lock().clone()
    }
}

/// Manages all registered endpoints and their workers.
pub struct EndpointManager {
    endpoints: Mutex<HashMap<String, Arc<EndpointSlot>>>,
    processors: Mutex<HashMap<FrameType, Weak<dyn FrameProcessor>>>,
    serial: SerialExecutor,
}

impl EndpointManager {
    pub fn new() -> Arc<EndpointManager> {
        Arc::new(EndpointManager {
            endpoints: Mutex::new(HashMap::new()),
            processors: Mutex::new(HashMap::new()),
            serial: SerialExecutor::new("endpoint-manager"),
        })
    }

    /// Registers the processor receiving frames of `frame_type`. Held
    /// weakly; the managers own each other through the core, not through
    /// this table.
    pub fn register_frame_processor(
        &self,
        frame_type: FrameType,
        processor: Weak<dyn FrameProcessor>,
    ) {
        self.processors.lock().insert(frame_type, processor);
    }

    /// Starts reader and keep-alive workers for a connected endpoint.
    /// Blocks until any prior workers for the same endpoint terminated.
    pub fn register_endpoint(
        self: &Arc<Self>,
        client: &Arc<Client>,
        endpoint_id: &str,
        channel: Arc<EndpointChannel>,
    ) -> Result<(), Status> {
        let manager = self.clone();
        let client = client.clone();
        let endpoint_id = endpoint_id.to_owned();
        self.serial.run_and_wait(move || {
            manager.remove_endpoint_on_serial(&endpoint_id, false);

            if manager.endpoints.lock().len() >= MAX_CONCURRENT_ENDPOINTS {
                warn!("endpoint limit reached, refusing {}", endpoint_id);
                return Err(Status::Error);
            }

            let (stop_tx, stop_rx) = bounded::<()>(1);
            let slot = Arc::new(EndpointSlot {
                endpoint_id: endpoint_id.clone(),
                client,
                channel: Mutex::new(channel),
                barrier: CountDownLatch::new(2),
                shutdown: Arc::new(AtomicBool::new(false)),
                keep_alive_stop: stop_tx,
            });
            manager
                .endpoints
                .lock()
                .insert(endpoint_id.clone(), slot.clone());

            {
                let manager = manager.clone();
                let slot = slot.clone();
                thread::Builder::new()
                    .name(format!("reader-{}", endpoint_id))
                    .spawn(move || manager.reader_loop(slot))
                    .map_err(|_| Status::Error)?;
            }
            {
                let manager = manager.clone();
                let slot = slot.clone();
                thread::Builder::new()
                    .name(format!("keep-alive-{}", endpoint_id))
                    .spawn(move || manager.keep_alive_loop(slot, stop_rx))
                    .map_err(|_| Status::Error)?;
            }
            info!("registered endpoint {}", endpoint_id);
            Ok(())
        })
    }

    /// Client-requested teardown; does not fire `disconnected`. Blocks
    /// until the workers terminated.
    pub fn unregister_endpoint(self: &Arc<Self>, endpoint_id: &str) {
        let manager = self.clone();
        let endpoint_id = endpoint_id.to_owned();
        self.serial.run_and_wait(move || {
            manager.remove_endpoint_on_serial(&endpoint_id, false);
        });
    }

    /// Like [`unregister_endpoint`](Self::unregister_endpoint), but posted
    /// instead of awaited; safe to call from a reader worker's own
    /// dispatch.
    pub fn unregister_endpoint_async(self: &Arc<Self>, endpoint_id: &str) {
        let manager = self.clone();
        let endpoint_id = endpoint_id.to_owned();
        self.serial.execute(move || {
            manager.remove_endpoint_on_serial(&endpoint_id, false);
        });
    }

    /// Self-initiated teardown; fires `disconnected`. Never blocks the
    /// caller: the work is posted to the manager's serial executor.
    pub fn discard_endpoint(self: &Arc<Self>, endpoint_id: &str) {
        let manager = self.clone();
        let endpoint_id = endpoint_id.to_owned();
        self.serial.execute(move || {
            manager.remove_endpoint_on_serial(&endpoint_id, true);
        });
    }

    /// The channel currently carrying `endpoint_id`.
    pub fn channel_for(&self, endpoint_id: &str) -> Option<Arc<EndpointChannel>> {
        self.endpoints
            .lock()
            .get(endpoint_id)
            .map(|slot| slot.current_channel())
    }

    /// Swaps in a replacement channel under the reader-pause lock,
    /// returning the prior one. The reader worker picks the new channel up
    /// on its next iteration; a read already blocked on the old channel
    /// resolves when that channel closes and is recognized as migration,
    /// not disconnection.
    pub fn replace_channel(
        &self,
        endpoint_id: &str,
        new_channel: Arc<EndpointChannel>,
    ) -> Option<Arc<EndpointChannel>> {
        let slot = self.endpoints.lock().get(endpoint_id).cloned()?;
        let mut channel = slot.channel.lock();
        let old = std::mem::replace(&mut *channel, new_channel);
        Some(old)
    }

    /// Writes a DATA transfer frame to every listed endpoint, returning the
    /// endpoints the write failed for.
    pub fn send_payload_chunk(
        self: &Arc<Self>,
        header: &PayloadHeader,
        chunk: PayloadChunk,
        endpoint_ids: &[String],
    ) -> Vec<String> {
        let frame = OfflineFrame::for_data_payload_transfer(header.clone(), chunk);
        self.send_transfer_frame(&frame, endpoint_ids)
    }

    /// Writes a CONTROL transfer frame to every listed endpoint.
    pub fn send_control_message(
        self: &Arc<Self>,
        header: &PayloadHeader,
        control: ControlMessage,
        endpoint_ids: &[String],
    ) -> Vec<String> {
        let frame = OfflineFrame::for_control_payload_transfer(header.clone(), control);
        self.send_transfer_frame(&frame, endpoint_ids)
    }

    fn send_transfer_frame(
        self: &Arc<Self>,
        frame: &OfflineFrame,
        endpoint_ids: &[String],
    ) -> Vec<String> {
        let mut failed = Vec::new();
        for endpoint_id in endpoint_ids {
            match self.channel_for(endpoint_id) {
                Some(channel) => {
                    if channel.write_frame(frame).is_err() {
                        warn!("payload write to {} failed", endpoint_id);
                        failed.push(endpoint_id.clone());
                        self.discard_endpoint(endpoint_id);
                    }
                }
                None => failed.push(endpoint_id.clone()),
            }
        }
        failed
    }

    /// Must run on the serial executor.
    fn remove_endpoint_on_serial(&self, endpoint_id: &str, notify: bool) {
        let slot = match self.endpoints.lock().remove(endpoint_id) {
            Some(slot) => slot,
            None => return,
        };
        debug!("removing endpoint {} (notify={})", endpoint_id, notify);

        // Capture what the disconnect callback needs before the processors
        // scrub the registry.
        let listener = slot.client.connection_listener(endpoint_id);

        slot.shutdown.store(true, Ordering::SeqCst);
        let _ = slot.keep_alive_stop.send(());
        slot.current_channel().close();
        if !slot.barrier.wait_timeout(DISCONNECT_DRAIN_GRACE) {
            warn!("workers for {} did not drain in time", endpoint_id);
        }

        let processors: Vec<Arc<dyn FrameProcessor>> = self
            .processors
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        let latch = CountDownLatch::new(processors.len());
        for processor in processors {
            let client = slot.client.clone();
            let endpoint_id = endpoint_id.to_owned();
            let thread_latch = latch.clone();
            let fallback_latch = latch.clone();
            let spawned = thread::Builder::new()
                .name("disconnect-processor".into())
                .spawn(move || processor.on_endpoint_disconnect(&client, &endpoint_id, &thread_latch));
            if spawned.is_err() {
                fallback_latch.count_down();
            }
        }
        if !latch.wait_timeout(PROCESS_DISCONNECTION_TIMEOUT) {
            warn!("a frame processor ignored the disconnect of {}", endpoint_id);
        }

        if notify {
            if let Some(listener) = listener {
                (listener.disconnected)(endpoint_id);
            }
        }
    }

    fn reader_loop(self: Arc<Self>, slot: Arc<EndpointSlot>) {
        loop {
            if slot.shutdown.load(Ordering::SeqCst) {
                break;
            }
            let channel = slot.current_channel();
            match channel.read() {
                Ok(bytes) => match OfflineFrame::decode(&bytes) {
                    Ok(frame) => self.dispatch_frame(frame, &slot, channel.medium()),
                    Err(err) => {
                        warn!("{}: undecodable frame: {}", slot.endpoint_id, err);
                        self.discard_endpoint(&slot.endpoint_id);
                        break;
                    }
                },
                Err(_) => {
                    if slot.shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    let current = slot.current_channel();
                    if !Arc::ptr_eq(&current, &channel) {
                        // The channel migrated mid-read (bandwidth
                        // upgrade); keep reading from the new one.
                        continue;
                    }
                    debug!("{}: read failed, discarding endpoint", slot.endpoint_id);
                    self.discard_endpoint(&slot.endpoint_id);
                    break;
                }
            }
        }
        slot.barrier.count_down();
    }

    fn dispatch_frame(&self, frame: OfflineFrame, slot: &EndpointSlot, medium: Medium) {
        let frame_type = frame.frame_type();
        if frame_type == FrameType::KeepAlive {
            // Its whole effect is the channel's last-read timestamp.
            return;
        }
        let processor = self
            .processors
            .lock()
            .get(&frame_type)
            .and_then(Weak::upgrade);
        match processor {
            Some(processor) => {
                processor.on_incoming_frame(frame, &slot.endpoint_id, &slot.client, medium)
            }
            None => warn!("no processor registered for {:?}", frame_type),
        }
    }

    fn keep_alive_loop(
        self: Arc<Self>,
        slot: Arc<EndpointSlot>,
        stop: crossbeam_channel::Receiver<()>,
    ) {
        loop {
            match stop.recv_timeout(KEEP_ALIVE_WRITE_INTERVAL) {
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                _ => break,
            }
            let channel = slot.current_channel();
            if channel.write_frame(&OfflineFrame::for_keep_alive()).is_err() {
                if !slot.shutdown.load(Ordering::SeqCst) {
                    self.discard_endpoint(&slot.endpoint_id);
                }
                break;
            }
            if channel.last_read_age() > KEEP_ALIVE_READ_TIMEOUT {
                info!("{}: keep-alive watchdog expired", slot.endpoint_id);
                self.discard_endpoint(&slot.endpoint_id);
                break;
            }
        }
        slot.barrier.count_down();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Connection, ConnectionStatus};
    use crate::core::ConnectionListener;
    use crate::medium::fake::socket_pair;
    use crossbeam_channel::unbounded;
    use std::time::Duration;

    struct RecordingProcessor {
        frames: crossbeam_channel::Sender<(FrameType, String)>,
        disconnects: crossbeam_channel::Sender<String>,
    }

    impl FrameProcessor for RecordingProcessor {
        fn on_incoming_frame(
            &self,
            frame: OfflineFrame,
            endpoint_id: &str,
            _client: &Arc<Client>,
            _medium: Medium,
        ) {
            let _ = self
                .frames
                .send((frame.frame_type(), endpoint_id.to_owned()));
        }

        fn on_endpoint_disconnect(
            &self,
            _client: &Arc<Client>,
            endpoint_id: &str,
            barrier: &CountDownLatch,
        ) {
            let _ = self.disconnects.send(endpoint_id.to_owned());
            barrier.count_down();
        }
    }

    fn client_with_connection(
        endpoint_id: &str,
    ) -> (Arc<Client>, crossbeam_channel::Receiver<String>) {
        let client = Client::new();
        let (tx, rx) = unbounded();
        let listener = ConnectionListener {
            disconnected: Box::new(move |id| {
                let _ = tx.send(id.to_owned());
            }),
            ..Default::default()
        };
        client
            .add_connection(
                endpoint_id,
                Connection {
                    is_incoming: false,
                    status: ConnectionStatus::CONNECTED,
                    connection_listener: Arc::new(listener),
                    payload_listener: None,
                    auth_token: "0000".into(),
                    medium: Medium::Bluetooth,
                    endpoint_info: vec![],
                },
            )
            .unwrap();
        (client, rx)
    }

    #[test]
    fn dispatches_frames_by_registered_type() {
        let manager = EndpointManager::new();
        let (frames_tx, frames_rx) = unbounded();
        let (disc_tx, _disc_rx) = unbounded();
        let processor = Arc::new(RecordingProcessor {
            frames: frames_tx,
            disconnects: disc_tx,
        });
        let processor_dyn: Arc<dyn FrameProcessor> = processor.clone();
        let weak: Weak<dyn FrameProcessor> = Arc::downgrade(&processor_dyn);
        manager.register_frame_processor(FrameType::ConnectionResponse, weak);

        let (client, _disconnected) = client_with_connection("WXYZ");
        let (socket, peer_socket) = socket_pair(Medium::Bluetooth, "local", "peer");
        let channel = EndpointChannel::from_socket("local", socket);
        let peer = EndpointChannel::from_socket("peer", peer_socket);
        manager.register_endpoint(&client, "WXYZ", channel).unwrap();

        peer.write_frame(&OfflineFrame::for_connection_response(0))
            .unwrap();
        let (frame_type, endpoint_id) = frames_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(frame_type, FrameType::ConnectionResponse);
        assert_eq!(endpoint_id, "WXYZ");

        // KeepAlive frames are consumed silently.
        peer.write_frame(&OfflineFrame::for_keep_alive()).unwrap();
        assert!(frames_rx.recv_timeout(Duration::from_millis(300)).is_err());

        manager.unregister_endpoint("WXYZ");
    }

    #[test]
    fn unregister_is_silent_discard_is_not() {
        let manager = EndpointManager::new();
        let (client, disconnected) = client_with_connection("ABCD");
        let (socket, peer_socket) = socket_pair(Medium::Bluetooth, "local", "peer");
        let channel = EndpointChannel::from_socket("local", socket);
        let _peer = EndpointChannel::from_socket("peer", peer_socket);
        manager.register_endpoint(&client, "ABCD", channel).unwrap();

        manager.unregister_endpoint("ABCD");
        assert!(disconnected.recv_timeout(Duration::from_millis(300)).is_err());

        // Register again, then kill the peer side: the reader notices and
        // the disconnect callback fires.
        let (client, disconnected) = client_with_connection("ABCD");
        let (socket, peer_socket) = socket_pair(Medium::Bluetooth, "local", "peer");
        let channel = EndpointChannel::from_socket("local", socket);
        let peer = EndpointChannel::from_socket("peer", peer_socket);
        manager.register_endpoint(&client, "ABCD", channel).unwrap();

        peer.close();
        assert_eq!(
            disconnected.recv_timeout(Duration::from_secs(5)).unwrap(),
            "ABCD"
        );
    }

    #[test]
    fn processors_are_notified_of_disconnects() {
        let manager = EndpointManager::new();
        let (frames_tx, _frames_rx) = unbounded();
        let (disc_tx, disc_rx) = unbounded();
        let processor = Arc::new(RecordingProcessor {
            frames: frames_tx,
            disconnects: disc_tx,
        });
        let processor_dyn: Arc<dyn FrameProcessor> = processor.clone();
        let weak: Weak<dyn FrameProcessor> = Arc::downgrade(&processor_dyn);
        manager.register_frame_processor(FrameType::PayloadTransfer, weak);

        let (client, _disconnected) = client_with_connection("EFGH");
        let (socket, peer_socket) = socket_pair(Medium::Bluetooth, "local", "peer");
        let channel = EndpointChannel::from_socket("local", socket);
        let _peer = EndpointChannel::from_socket("peer", peer_socket);
        manager.register_endpoint(&client, "EFGH", channel).unwrap();

        manager.unregister_endpoint("EFGH");
        assert_eq!(
            disc_rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            "EFGH"
        );
    }

    #[test]
    fn send_reports_unknown_endpoints_as_failed() {
        let manager = EndpointManager::new();
        let header = PayloadHeader {
            id: 1,
            payload_type: crate::frame::PayloadType::Bytes,
            total_size: 0,
            file_name: None,
            parent_folder: None,
        };
        let failed = manager.send_payload_chunk(
            &header,
            PayloadChunk {
                flags: crate::frame::ChunkFlags::LAST_CHUNK,
                offset: 0,
                body: vec![],
            },
            &["GONE".to_owned()],
        );
        assert_eq!(failed, vec!["GONE".to_owned()]);
    }

    #[test]
    fn replace_channel_returns_prior() {
        let manager = EndpointManager::new();
        let (client, _disconnected) = client_with_connection("IJKL");
        let (socket, peer_socket) = socket_pair(Medium::Bluetooth, "local", "peer");
        let channel = EndpointChannel::from_socket("first", socket);
        let _peer = EndpointChannel::from_socket("peer", peer_socket);
        manager
            .register_endpoint(&client, "IJKL", channel.clone())
            .unwrap();

        let (socket2, peer_socket2) = socket_pair(Medium::WifiLan, "local", "peer");
        let replacement = EndpointChannel::from_socket("second", socket2);
        let _peer2 = EndpointChannel::from_socket("peer2", peer_socket2);

        let prior = manager
            .replace_channel("IJKL", replacement.clone())
            .unwrap();
        assert!(Arc::ptr_eq(&prior, &channel));
        assert!(Arc::ptr_eq(
            &manager.channel_for("IJKL").unwrap(),
            &replacement
        ));
        manager.unregister_endpoint("IJKL");
    }
}
