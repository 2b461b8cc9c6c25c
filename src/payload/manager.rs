//! The payload manager.
//!
//! Outgoing payloads are fragmented into DATA frames on one of three
//! dedicated writer executors, one per payload type, so a slow file send
//! never head-of-line-blocks small byte messages. Incoming DATA frames are
//! reassembled per `(endpoint, payload id)`, with the payload handed to the
//! client on the first chunk so streams and files can be consumed while
//! data is still arriving.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::client::Client;
use crate::endpoint_manager::{EndpointManager, FrameProcessor};
use crate::frame::{
    ChunkFlags, ControlEvent, ControlMessage, OfflineFrame, PayloadChunk, PayloadHeader,
    PayloadTransfer, PayloadType, V1Frame,
};
use crate::medium::Medium;
use crate::payload::{
    pipe, sanitize_file_name, InternalPayload, Payload, PayloadContent, PayloadId,
    PayloadProgress, PayloadStatus, CHUNK_SIZE,
};
use crate::runtime::{CountDownLatch, SerialExecutor};
use crate::Status;

struct OutgoingEntry {
    client: Arc<Client>,
    header: PayloadHeader,
    internal: Mutex<InternalPayload>,
    endpoints: Mutex<HashSet<String>>,
    /// Set by a local `cancel_payload`; the writer loop notices, notifies
    /// the peers and winds the transfer down.
    canceled: AtomicBool,
    initial_offset: i64,
}

struct IncomingEntry {
    /// `None` for bytes payloads, whose single chunk needs no sink.
    internal: Option<InternalPayload>,
    total_size: i64,
    received: i64,
}

/// Fragmentation, reassembly, progress and cancellation of payloads.
pub struct PayloadManager {
    endpoint_manager: Arc<EndpointManager>,
    bytes_executor: SerialExecutor,
    stream_executor: SerialExecutor,
    file_executor: SerialExecutor,
    outgoing: Mutex<HashMap<PayloadId, Arc<OutgoingEntry>>>,
    incoming: Mutex<HashMap<(String, PayloadId), IncomingEntry>>,
}

impl PayloadManager {
    pub fn new(endpoint_manager: Arc<EndpointManager>) -> Arc<PayloadManager> {
        Arc::new(PayloadManager {
            endpoint_manager,
            bytes_executor: SerialExecutor::new("payload-bytes"),
            stream_executor: SerialExecutor::new("payload-stream"),
            file_executor: SerialExecutor::new("payload-file"),
            outgoing: Mutex::new(HashMap::new()),
            incoming: Mutex::new(HashMap::new()),
        })
    }

    fn executor_for(&self, payload_type: PayloadType) -> &SerialExecutor {
        match payload_type {
            PayloadType::Bytes => &self.bytes_executor,
            PayloadType::Stream => &self.stream_executor,
            PayloadType::File => &self.file_executor,
        }
    }

    /// Queues `payload` for delivery to `endpoint_ids`.
    pub fn send_payload(
        self: &Arc<Self>,
        client: &Arc<Client>,
        payload: Payload,
        endpoint_ids: &[String],
    ) -> Result<(), Status> {
        if payload.id() == 0 || endpoint_ids.is_empty() {
            return Err(Status::Error);
        }
        for endpoint_id in endpoint_ids {
            if !client.is_connected_to(endpoint_id) {
                return Err(Status::NotConnectedToEndpoint);
            }
        }

        let payload_id = payload.id();
        let payload_type = payload.payload_type();
        let initial_offset = payload.offset();
        let file_name = match payload.content() {
            PayloadContent::File { path, .. } => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned()),
            _ => None,
        };
        let internal =
            InternalPayload::new_outgoing(payload.into_content()).map_err(|_| Status::Error)?;

        let header = PayloadHeader {
            id: payload_id,
            payload_type,
            total_size: internal.total_size(),
            file_name,
            parent_folder: None,
        };
        let entry = Arc::new(OutgoingEntry {
            client: client.clone(),
            header,
            internal: Mutex::new(internal),
            endpoints: Mutex::new(endpoint_ids.iter().cloned().collect()),
            canceled: AtomicBool::new(false),
            initial_offset,
        });

        {
            let mut outgoing = self.outgoing.lock();
            if outgoing.contains_key(&payload_id) {
                return Err(Status::Error);
            }
            outgoing.insert(payload_id, entry.clone());
        }

        let manager = self.clone();
        self.executor_for(payload_type)
            .execute(move || manager.run_send_loop(entry));
        Ok(())
    }

    /// Cancels a payload by ID, whichever direction it is flowing.
    pub fn cancel_payload(
        &self,
        client: &Arc<Client>,
        payload_id: PayloadId,
    ) -> Result<(), Status> {
        if let Some(entry) = self.outgoing.lock().get(&payload_id).cloned() {
            entry.canceled.store(true, Ordering::SeqCst);
            return Ok(());
        }

        let keys: Vec<(String, PayloadId)> = self
            .incoming
            .lock()
            .keys()
            .filter(|(_, id)| *id == payload_id)
            .cloned()
            .collect();
        if keys.is_empty() {
            return Err(Status::PayloadUnknown);
        }
        for (endpoint_id, _) in keys {
            self.abort_incoming(client, &endpoint_id, payload_id, PayloadStatus::Canceled, true);
        }
        Ok(())
    }

    fn run_send_loop(&self, entry: Arc<OutgoingEntry>) {
        let payload_id = entry.header.id;
        let total_size = entry.header.total_size;
        let mut offset = entry.initial_offset;

        if offset > 0 && entry.internal.lock().skip_to_offset(offset).is_err() {
            self.fail_outgoing(&entry, "source does not support the resume offset");
            return;
        }

        loop {
            if entry.canceled.load(Ordering::SeqCst) {
                let endpoints = snapshot(&entry.endpoints);
                self.endpoint_manager.send_control_message(
                    &entry.header,
                    ControlMessage {
                        event: ControlEvent::PayloadCanceled,
                        offset,
                    },
                    &endpoints,
                );
                entry.internal.lock().close();
                for endpoint_id in &endpoints {
                    self.notify_progress(
                        &entry.client,
                        endpoint_id,
                        payload_id,
                        PayloadStatus::Canceled,
                        total_size,
                        offset,
                    );
                }
                self.outgoing.lock().remove(&payload_id);
                return;
            }

            let chunk = match entry.internal.lock().next_chunk(CHUNK_SIZE) {
                Ok(chunk) => chunk,
                Err(_) => {
                    self.fail_outgoing(&entry, "source read failed");
                    return;
                }
            };

            let endpoints = snapshot(&entry.endpoints);
            if endpoints.is_empty() {
                // Every destination dropped out (failure or remote
                // cancel); nothing left to do.
                entry.internal.lock().close();
                self.outgoing.lock().remove(&payload_id);
                return;
            }

            let flags = if chunk.last {
                ChunkFlags::LAST_CHUNK
            } else {
                ChunkFlags::empty()
            };
            let body_len = chunk.body.len() as i64;
            let failed = self.endpoint_manager.send_payload_chunk(
                &entry.header,
                PayloadChunk {
                    flags,
                    offset,
                    body: chunk.body,
                },
                &endpoints,
            );
            for endpoint_id in &failed {
                entry.endpoints.lock().remove(endpoint_id);
                self.notify_progress(
                    &entry.client,
                    endpoint_id,
                    payload_id,
                    PayloadStatus::Failure,
                    total_size,
                    offset,
                );
            }

            offset += body_len;
            let remaining = snapshot(&entry.endpoints);
            if remaining.is_empty() {
                entry.internal.lock().close();
                self.outgoing.lock().remove(&payload_id);
                return;
            }

            let status = if chunk.last {
                PayloadStatus::Success
            } else {
                PayloadStatus::InProgress
            };
            for endpoint_id in &remaining {
                self.notify_progress(
                    &entry.client,
                    endpoint_id,
                    payload_id,
                    status,
                    total_size,
                    offset,
                );
            }

            if chunk.last {
                entry.internal.lock().close();
                self.outgoing.lock().remove(&payload_id);
                return;
            }
        }
    }

    fn fail_outgoing(&self, entry: &Arc<OutgoingEntry>, reason: &str) {
        warn!("payload {} failed: {}", entry.header.id, reason);
        let endpoints = snapshot(&entry.endpoints);
        entry.internal.lock().close();
        for endpoint_id in &endpoints {
            self.notify_progress(
                &entry.client,
                endpoint_id,
                entry.header.id,
                PayloadStatus::Failure,
                entry.header.total_size,
                0,
            );
        }
        self.outgoing.lock().remove(&entry.header.id);
    }

    fn notify_progress(
        &self,
        client: &Arc<Client>,
        endpoint_id: &str,
        payload_id: PayloadId,
        status: PayloadStatus,
        total_size: i64,
        bytes_transferred: i64,
    ) {
        if let Some(listener) = client.payload_listener(endpoint_id) {
            (listener.payload_progress)(
                endpoint_id,
                &PayloadProgress {
                    payload_id,
                    status,
                    total_size,
                    bytes_transferred,
                },
            );
        }
    }

    fn process_data_frame(
        &self,
        header: PayloadHeader,
        chunk: PayloadChunk,
        endpoint_id: &str,
        client: &Arc<Client>,
    ) {
        let key = (endpoint_id.to_owned(), header.id);
        let is_last = chunk.flags.contains(ChunkFlags::LAST_CHUNK);
        let first_chunk = !self.incoming.lock().contains_key(&key);

        if first_chunk {
            let (internal, payload) = match self.new_incoming(&header, &chunk) {
                Ok(pair) => pair,
                Err(_) => {
                    warn!("cannot accept payload {} from {}", header.id, endpoint_id);
                    self.notify_progress(
                        client,
                        endpoint_id,
                        header.id,
                        PayloadStatus::Failure,
                        header.total_size,
                        0,
                    );
                    return;
                }
            };
            self.incoming.lock().insert(
                key.clone(),
                IncomingEntry {
                    internal,
                    total_size: header.total_size,
                    received: 0,
                },
            );
            // Hand the payload over before any data lands so the client
            // can consume a stream or file while it arrives.
            match client.payload_listener(endpoint_id) {
                Some(listener) => (listener.payload)(endpoint_id, payload),
                None => {
                    debug!("no payload listener for {}; dropping payload", endpoint_id);
                    self.incoming.lock().remove(&key);
                    return;
                }
            }
        }

        let mut incoming = self.incoming.lock();
        let entry = match incoming.get_mut(&key) {
            Some(entry) => entry,
            None => return,
        };

        let attach_result = match &mut entry.internal {
            Some(internal) => internal.attach_chunk(&chunk.body),
            None => Ok(()),
        };
        if attach_result.is_err() {
            drop(incoming);
            self.abort_incoming(client, endpoint_id, header.id, PayloadStatus::Failure, false);
            return;
        }
        entry.received = chunk.offset + chunk.body.len() as i64;
        let received = entry.received;
        let total_size = entry.total_size;

        if is_last || (chunk.body.is_empty() && !first_chunk) {
            if let Some(internal) = &mut entry.internal {
                // Make sure the sink is closed even when the final chunk
                // carried data.
                let _ = internal.attach_chunk(&[]);
            }
            incoming.remove(&key);
            drop(incoming);
            self.notify_progress(
                client,
                endpoint_id,
                header.id,
                PayloadStatus::Success,
                total_size,
                received,
            );
        } else {
            drop(incoming);
            self.notify_progress(
                client,
                endpoint_id,
                header.id,
                PayloadStatus::InProgress,
                total_size,
                received,
            );
        }
    }

    /// Builds the internal sink and the client-facing payload for the
    /// first chunk of an incoming payload.
    fn new_incoming(
        &self,
        header: &PayloadHeader,
        chunk: &PayloadChunk,
    ) -> Result<(Option<InternalPayload>, Payload), Status> {
        match header.payload_type {
            PayloadType::Bytes => Ok((
                None,
                Payload::new_incoming(header.id, PayloadContent::Bytes(chunk.body.clone())),
            )),
            PayloadType::Stream => {
                let (writer, reader) = pipe();
                Ok((
                    Some(InternalPayload::IncomingStream {
                        writer: Some(writer),
                    }),
                    Payload::new_incoming(header.id, PayloadContent::Stream(Box::new(reader))),
                ))
            }
            PayloadType::File => {
                let path = incoming_file_path(header);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).map_err(|_| Status::Error)?;
                }
                let file = fs::File::create(&path).map_err(|_| Status::Error)?;
                Ok((
                    Some(InternalPayload::IncomingFile {
                        file: Some(file),
                        path: path.clone(),
                        total_size: header.total_size,
                    }),
                    Payload::new_incoming(
                        header.id,
                        PayloadContent::File {
                            path,
                            size: header.total_size,
                        },
                    ),
                ))
            }
        }
    }

    fn process_control_frame(
        &self,
        header: PayloadHeader,
        control: ControlMessage,
        endpoint_id: &str,
        client: &Arc<Client>,
    ) {
        match control.event {
            ControlEvent::PayloadCanceled => {
                // Either an incoming transfer the peer stopped sending, or
                // an outgoing transfer the peer stopped wanting.
                let had_incoming = self
                    .incoming
                    .lock()
                    .contains_key(&(endpoint_id.to_owned(), header.id));
                if had_incoming {
                    self.abort_incoming(
                        client,
                        endpoint_id,
                        header.id,
                        PayloadStatus::Canceled,
                        false,
                    );
                    return;
                }
                if let Some(entry) = self.outgoing.lock().get(&header.id).cloned() {
                    entry.endpoints.lock().remove(endpoint_id);
                    self.notify_progress(
                        client,
                        endpoint_id,
                        header.id,
                        PayloadStatus::Canceled,
                        entry.header.total_size,
                        control.offset,
                    );
                }
            }
            ControlEvent::PayloadReceivedAck => {
                // Reserved; nothing consumes it yet.
            }
            ControlEvent::PayloadError => {
                if let Some(entry) = self.outgoing.lock().get(&header.id).cloned() {
                    entry.endpoints.lock().remove(endpoint_id);
                    self.notify_progress(
                        client,
                        endpoint_id,
                        header.id,
                        PayloadStatus::Failure,
                        entry.header.total_size,
                        control.offset,
                    );
                }
            }
        }
    }

    /// Closes and removes one incoming entry, optionally telling the peer.
    fn abort_incoming(
        &self,
        client: &Arc<Client>,
        endpoint_id: &str,
        payload_id: PayloadId,
        status: PayloadStatus,
        notify_peer: bool,
    ) {
        let entry = self
            .incoming
            .lock()
            .remove(&(endpoint_id.to_owned(), payload_id));
        let mut entry = match entry {
            Some(entry) => entry,
            None => return,
        };
        if let Some(internal) = &mut entry.internal {
            internal.close();
        }

        if notify_peer {
            let header = PayloadHeader {
                id: payload_id,
                payload_type: PayloadType::Bytes,
                total_size: entry.total_size,
                file_name: None,
                parent_folder: None,
            };
            self.endpoint_manager.send_control_message(
                &header,
                ControlMessage {
                    event: ControlEvent::PayloadCanceled,
                    offset: entry.received,
                },
                &[endpoint_id.to_owned()],
            );
        }
        self.notify_progress(
            client,
            endpoint_id,
            payload_id,
            status,
            entry.total_size,
            entry.received,
        );
    }
}

fn snapshot(endpoints: &Mutex<HashSet<String>>) -> Vec<String> {
    endpoints.lock().iter().cloned().collect()
}

/// Destination path for an incoming file payload.
fn incoming_file_path(header: &PayloadHeader) -> PathBuf {
    let folder = header
        .parent_folder
        .as_deref()
        .map(|f| f.replace("..", ""))
        .filter(|f| !f.is_empty());
    let name = header
        .file_name
        .as_deref()
        .map(sanitize_file_name)
        .filter(|n| !n.is_empty());

    match (folder, name) {
        (Some(folder), Some(name)) => PathBuf::from(folder).join(name),
        (Some(folder), None) => PathBuf::from(folder).join(header.id.to_string()),
        (None, Some(name)) => std::env::temp_dir().join(name),
        (None, None) => std::env::temp_dir().join(format!("payload_{}", header.id)),
    }
}

impl FrameProcessor for PayloadManager {
    fn on_incoming_frame(
        &self,
        frame: OfflineFrame,
        endpoint_id: &str,
        client: &Arc<Client>,
        _medium: Medium,
    ) {
        let OfflineFrame::V1(v1) = frame;
        let transfer = match v1 {
            V1Frame::PayloadTransfer(transfer) => transfer,
            _ => return,
        };
        match transfer {
            PayloadTransfer::Data { header, chunk } => {
                self.process_data_frame(header, chunk, endpoint_id, client)
            }
            PayloadTransfer::Control { header, control } => {
                self.process_control_frame(header, control, endpoint_id, client)
            }
        }
    }

    fn on_endpoint_disconnect(
        &self,
        client: &Arc<Client>,
        endpoint_id: &str,
        barrier: &CountDownLatch,
    ) {
        let outgoing: Vec<Arc<OutgoingEntry>> = self.outgoing.lock().values().cloned().collect();
        for entry in outgoing {
            if entry.endpoints.lock().remove(endpoint_id) {
                self.notify_progress(
                    client,
                    endpoint_id,
                    entry.header.id,
                    PayloadStatus::Failure,
                    entry.header.total_size,
                    0,
                );
            }
        }

        let keys: Vec<(String, PayloadId)> = self
            .incoming
            .lock()
            .keys()
            .filter(|(id, _)| id == endpoint_id)
            .cloned()
            .collect();
        for (_, payload_id) in keys {
            if let Some(mut entry) = self
                .incoming
                .lock()
                .remove(&(endpoint_id.to_owned(), payload_id))
            {
                if let Some(internal) = &mut entry.internal {
                    internal.close();
                }
            }
        }
        barrier.count_down();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ConnectionListener, PayloadListener};
    use crate::client::{Connection, ConnectionStatus};
    use crate::endpoint_manager::FrameProcessor;
    use crate::medium::InputStream;
    use crossbeam_channel::{unbounded, Receiver};
    use std::time::Duration;

    const PEER: &str = "WXYZ";

    fn connected_client() -> (
        Arc<Client>,
        Receiver<(String, Payload)>,
        Receiver<PayloadProgress>,
    ) {
        let client = Client::new();
        let (payload_tx, payload_rx) = unbounded();
        let (progress_tx, progress_rx) = unbounded();
        let listener = PayloadListener {
            payload: Box::new(move |id, payload| {
                let _ = payload_tx.send((id.to_owned(), payload));
            }),
            payload_progress: Box::new(move |_, progress| {
                let _ = progress_tx.send(progress.clone());
            }),
        };
        client
            .add_connection(
                PEER,
                Connection {
                    is_incoming: true,
                    status: ConnectionStatus::empty(),
                    connection_listener: Arc::new(ConnectionListener::default()),
                    payload_listener: None,
                    auth_token: "0000".into(),
                    medium: Medium::Ble,
                    endpoint_info: vec![],
                },
            )
            .unwrap();
        client.local_accepted(PEER, Arc::new(listener)).unwrap();
        client.remote_decided(PEER, true).unwrap();
        client.set_connected(PEER).unwrap();
        (client, payload_rx, progress_rx)
    }

    fn manager() -> Arc<PayloadManager> {
        PayloadManager::new(crate::endpoint_manager::EndpointManager::new())
    }

    fn data_frame(
        id: PayloadId,
        payload_type: PayloadType,
        total_size: i64,
        file_name: Option<&str>,
        offset: i64,
        body: &[u8],
        last: bool,
    ) -> OfflineFrame {
        OfflineFrame::for_data_payload_transfer(
            PayloadHeader {
                id,
                payload_type,
                total_size,
                file_name: file_name.map(|n| n.to_owned()),
                parent_folder: None,
            },
            PayloadChunk {
                flags: if last {
                    ChunkFlags::LAST_CHUNK
                } else {
                    ChunkFlags::empty()
                },
                offset,
                body: body.to_vec(),
            },
        )
    }

    #[test]
    fn incoming_bytes_arrive_as_one_frame() {
        let manager = manager();
        let (client, payload_rx, progress_rx) = connected_client();

        manager.on_incoming_frame(
            data_frame(1, PayloadType::Bytes, 2, None, 0, b"hi", true),
            PEER,
            &client,
            Medium::Ble,
        );

        let (from, payload) = payload_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(from, PEER);
        assert_eq!(payload.as_bytes(), Some(&b"hi"[..]));

        let progress = progress_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(progress.status, PayloadStatus::Success);
        assert_eq!(progress.total_size, 2);
        assert_eq!(progress.bytes_transferred, 2);
    }

    #[test]
    fn incoming_stream_reassembles_in_offset_order() {
        let manager = manager();
        let (client, payload_rx, progress_rx) = connected_client();

        manager.on_incoming_frame(
            data_frame(5, PayloadType::Stream, -1, None, 0, b"abc", false),
            PEER,
            &client,
            Medium::Ble,
        );
        let (_, payload) = payload_rx.recv_timeout(Duration::from_secs(1)).unwrap();

        manager.on_incoming_frame(
            data_frame(5, PayloadType::Stream, -1, None, 3, b"def", false),
            PEER,
            &client,
            Medium::Ble,
        );
        manager.on_incoming_frame(
            data_frame(5, PayloadType::Stream, -1, None, 6, b"", true),
            PEER,
            &client,
            Medium::Ble,
        );

        let mut stream = match payload.into_content() {
            PayloadContent::Stream(stream) => stream,
            _ => panic!("expected stream"),
        };
        let mut collected = Vec::new();
        loop {
            let piece = stream.read(16).unwrap();
            if piece.is_empty() {
                break;
            }
            collected.extend_from_slice(&piece);
        }
        assert_eq!(collected, b"abcdef".to_vec());

        let statuses: Vec<PayloadStatus> = (0..3)
            .map(|_| progress_rx.recv_timeout(Duration::from_secs(1)).unwrap().status)
            .collect();
        assert_eq!(
            statuses,
            vec![
                PayloadStatus::InProgress,
                PayloadStatus::InProgress,
                PayloadStatus::Success
            ]
        );
    }

    #[test]
    fn incoming_file_name_is_sanitized() {
        let manager = manager();
        let (client, payload_rx, progress_rx) = connected_client();

        manager.on_incoming_frame(
            data_frame(
                9,
                PayloadType::File,
                4,
                Some("../../escape_attempt.bin"),
                0,
                b"data",
                false,
            ),
            PEER,
            &client,
            Medium::Ble,
        );
        manager.on_incoming_frame(
            data_frame(9, PayloadType::File, 4, Some("../../escape_attempt.bin"), 4, b"", true),
            PEER,
            &client,
            Medium::Ble,
        );

        let (_, payload) = payload_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        let path = match payload.into_content() {
            PayloadContent::File { path, .. } => path,
            _ => panic!("expected file"),
        };
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "escape_attempt.bin"
        );
        assert!(path.starts_with(std::env::temp_dir()));

        // Drain to the Success event, then check the bytes on disk.
        loop {
            let progress = progress_rx.recv_timeout(Duration::from_secs(1)).unwrap();
            if progress.status == PayloadStatus::Success {
                break;
            }
        }
        assert_eq!(fs::read(&path).unwrap(), b"data".to_vec());
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn peer_cancel_aborts_incoming_transfer() {
        let manager = manager();
        let (client, payload_rx, progress_rx) = connected_client();

        manager.on_incoming_frame(
            data_frame(13, PayloadType::Stream, -1, None, 0, b"partial", false),
            PEER,
            &client,
            Medium::Ble,
        );
        payload_rx.recv_timeout(Duration::from_secs(1)).unwrap();

        manager.on_incoming_frame(
            OfflineFrame::for_control_payload_transfer(
                PayloadHeader {
                    id: 13,
                    payload_type: PayloadType::Stream,
                    total_size: -1,
                    file_name: None,
                    parent_folder: None,
                },
                ControlMessage {
                    event: ControlEvent::PayloadCanceled,
                    offset: 7,
                },
            ),
            PEER,
            &client,
            Medium::Ble,
        );

        let mut saw_canceled = false;
        while let Ok(progress) = progress_rx.recv_timeout(Duration::from_millis(500)) {
            if progress.payload_id == 13 && progress.status == PayloadStatus::Canceled {
                saw_canceled = true;
                break;
            }
        }
        assert!(saw_canceled);
        // The entry is gone, so a local cancel no longer finds it.
        assert_eq!(
            manager.cancel_payload(&client, 13).unwrap_err(),
            Status::PayloadUnknown
        );
    }

    #[test]
    fn cancel_unknown_payload_is_reported() {
        let manager = manager();
        let (client, _payload_rx, _progress_rx) = connected_client();
        assert_eq!(
            manager.cancel_payload(&client, 4242).unwrap_err(),
            Status::PayloadUnknown
        );
    }

    #[test]
    fn send_to_unconnected_endpoint_is_refused() {
        let manager = manager();
        let client = Client::new();
        assert_eq!(
            manager
                .send_payload(
                    &client,
                    Payload::from_bytes(1, b"x".to_vec()),
                    &["QRST".to_owned()],
                )
                .unwrap_err(),
            Status::NotConnectedToEndpoint
        );
        let (client, _p, _g) = connected_client();
        assert_eq!(
            manager
                .send_payload(&client, Payload::from_bytes(0, b"x".to_vec()), &[PEER.to_owned()])
                .unwrap_err(),
            Status::Error
        );
    }
}
