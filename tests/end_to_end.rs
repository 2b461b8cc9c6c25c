//! Two-client sessions over the in-process medium hub.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};

use nearlink::core::{
    AdvertisingOptions, ConnectionListener, ConnectionOptions, Core, DiscoveryListener,
    DiscoveryOptions, PayloadListener, Strategy,
};
use nearlink::medium::fake::FakeHub;
use nearlink::medium::{InputStream, Medium};
use nearlink::payload::{pipe, Payload, PayloadContent, PayloadProgress, PayloadStatus};
use nearlink::Status;

const TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
enum Event {
    Found(String),
    Initiated {
        endpoint_id: String,
        auth_token: String,
        is_incoming: bool,
    },
    Accepted(String),
    Rejected(String, Status),
    Disconnected(String),
    BandwidthChanged(String, Medium),
    Progress(String, PayloadProgress),
}

struct Device {
    core: Core,
    events: Receiver<Event>,
    payloads: Receiver<(String, Payload)>,
    event_tx: Sender<Event>,
    payload_tx: Sender<(String, Payload)>,
}

impl Device {
    fn new(hub: &Arc<FakeHub>, name: &str, mediums: &[Medium]) -> Device {
        let drivers = mediums
            .iter()
            .map(|medium| FakeHub::create_driver(hub, *medium, name))
            .collect();
        let (event_tx, events) = unbounded();
        let (payload_tx, payloads) = unbounded();
        Device {
            core: Core::new(drivers),
            events,
            payloads,
            event_tx,
            payload_tx,
        }
    }

    fn conn_listener(&self) -> ConnectionListener {
        let initiated = self.event_tx.clone();
        let accepted = self.event_tx.clone();
        let rejected = self.event_tx.clone();
        let disconnected = self.event_tx.clone();
        let bandwidth = self.event_tx.clone();
        ConnectionListener {
            initiated: Box::new(move |id, info| {
                let _ = initiated.send(Event::Initiated {
                    endpoint_id: id.to_owned(),
                    auth_token: info.auth_token.clone(),
                    is_incoming: info.is_incoming,
                });
            }),
            accepted: Box::new(move |id| {
                let _ = accepted.send(Event::Accepted(id.to_owned()));
            }),
            rejected: Box::new(move |id, status| {
                let _ = rejected.send(Event::Rejected(id.to_owned(), status));
            }),
            disconnected: Box::new(move |id| {
                let _ = disconnected.send(Event::Disconnected(id.to_owned()));
            }),
            bandwidth_changed: Box::new(move |id, medium| {
                let _ = bandwidth.send(Event::BandwidthChanged(id.to_owned(), medium));
            }),
        }
    }

    fn discovery_listener(&self) -> DiscoveryListener {
        let found = self.event_tx.clone();
        DiscoveryListener {
            endpoint_found: Box::new(move |id, _info, _service| {
                let _ = found.send(Event::Found(id.to_owned()));
            }),
            ..Default::default()
        }
    }

    fn payload_listener(&self) -> PayloadListener {
        let payload_tx = self.payload_tx.clone();
        let progress_tx = self.event_tx.clone();
        PayloadListener {
            payload: Box::new(move |id, payload| {
                let _ = payload_tx.send((id.to_owned(), payload));
            }),
            payload_progress: Box::new(move |id, progress| {
                let _ = progress_tx.send(Event::Progress(id.to_owned(), progress.clone()));
            }),
        }
    }

    fn wait_for<F>(&self, what: &str, pred: F) -> Event
    where
        F: Fn(&Event) -> bool,
    {
        loop {
            let event = self
                .events
                .recv_timeout(TIMEOUT)
                .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
            if pred(&event) {
                return event;
            }
        }
    }

    fn wait_payload(&self) -> (String, Payload) {
        self.payloads
            .recv_timeout(TIMEOUT)
            .expect("timed out waiting for payload")
    }
}

/// A advertises, B discovers and requests, both accept.
fn connect_pair(a: &Device, b: &Device, service_id: &str, strategy: Strategy) -> (String, String) {
    let a_id = a.core.local_endpoint_id();
    let b_id = b.core.local_endpoint_id();

    a.core
        .start_advertising(
            service_id,
            b"device-a",
            AdvertisingOptions {
                strategy,
                ..Default::default()
            },
            a.conn_listener(),
        )
        .unwrap();
    b.core
        .start_discovery(service_id, DiscoveryOptions { strategy }, b.discovery_listener())
        .unwrap();

    b.wait_for("endpoint found", |e| matches!(e, Event::Found(id) if *id == a_id));
    b.core
        .request_connection(&a_id, b"device-b", ConnectionOptions::default(), b.conn_listener())
        .unwrap();

    b.wait_for("initiated on requester", |e| {
        matches!(e, Event::Initiated { endpoint_id, is_incoming, .. }
            if *endpoint_id == a_id && !*is_incoming)
    });
    a.wait_for("initiated on advertiser", |e| {
        matches!(e, Event::Initiated { endpoint_id, is_incoming, .. }
            if *endpoint_id == b_id && *is_incoming)
    });

    b.core.accept_connection(&a_id, b.payload_listener()).unwrap();
    a.core.accept_connection(&b_id, a.payload_listener()).unwrap();

    a.wait_for("accepted on a", |e| matches!(e, Event::Accepted(id) if *id == b_id));
    b.wait_for("accepted on b", |e| matches!(e, Event::Accepted(id) if *id == a_id));

    (a_id, b_id)
}

#[test]
fn bytes_message_end_to_end() {
    let hub = FakeHub::new();
    let a = Device::new(&hub, "a", &[Medium::Ble]);
    let b = Device::new(&hub, "b", &[Medium::Ble]);

    let a_id = a.core.local_endpoint_id();
    let b_id = b.core.local_endpoint_id();

    a.core
        .start_advertising(
            "hello",
            b"A",
            AdvertisingOptions::default(),
            a.conn_listener(),
        )
        .unwrap();
    b.core
        .start_discovery("hello", DiscoveryOptions::default(), b.discovery_listener())
        .unwrap();
    b.wait_for("found", |e| matches!(e, Event::Found(id) if *id == a_id));

    b.core
        .request_connection(&a_id, b"B", ConnectionOptions::default(), b.conn_listener())
        .unwrap();

    // Both sides must present the user the same authentication token.
    let b_token = match b.wait_for("initiated", |e| matches!(e, Event::Initiated { .. })) {
        Event::Initiated { auth_token, .. } => auth_token,
        _ => unreachable!(),
    };
    let a_token = match a.wait_for("initiated", |e| matches!(e, Event::Initiated { .. })) {
        Event::Initiated { auth_token, .. } => auth_token,
        _ => unreachable!(),
    };
    assert_eq!(a_token, b_token);
    assert_eq!(a_token.len(), 4);

    b.core.accept_connection(&a_id, b.payload_listener()).unwrap();
    a.core.accept_connection(&b_id, a.payload_listener()).unwrap();
    a.wait_for("accepted", |e| matches!(e, Event::Accepted(_)));
    b.wait_for("accepted", |e| matches!(e, Event::Accepted(_)));

    a.core
        .send_payload(&[b_id.clone()], Payload::from_bytes(1, b"hi".to_vec()))
        .unwrap();

    let (from, payload) = b.wait_payload();
    assert_eq!(from, a_id);
    assert_eq!(payload.id(), 1);
    assert_eq!(payload.as_bytes(), Some(&[0x68u8, 0x69][..]));

    b.wait_for("receive success", |e| {
        matches!(e, Event::Progress(_, progress)
            if progress.payload_id == 1
                && progress.status == PayloadStatus::Success
                && progress.total_size == 2
                && progress.bytes_transferred == 2)
    });
    a.wait_for("send success", |e| {
        matches!(e, Event::Progress(_, progress)
            if progress.payload_id == 1 && progress.status == PayloadStatus::Success)
    });
}

#[test]
fn large_file_transfer_chunks_and_reassembles() {
    let hub = FakeHub::new();
    let a = Device::new(&hub, "a", &[Medium::Bluetooth]);
    let b = Device::new(&hub, "b", &[Medium::Bluetooth]);
    let (_a_id, b_id) = connect_pair(&a, &b, "files", Strategy::P2pCluster);

    let src_dir = std::env::temp_dir().join("nearlink_e2e_file_src");
    fs::create_dir_all(&src_dir).unwrap();
    let src = src_dir.join("e2e_source_200k.bin");
    let data: Vec<u8> = (0..200_000u32).map(|i| (i * 31 % 251) as u8).collect();
    fs::write(&src, &data).unwrap();

    a.core
        .send_payload(&[b_id], Payload::from_file(2, src.clone()))
        .unwrap();

    let (_, payload) = b.wait_payload();
    let dest = match payload.into_content() {
        PayloadContent::File { path, size } => {
            assert_eq!(size, 200_000);
            path
        }
        _ => panic!("expected a file payload"),
    };

    // Three full chunks, one 3392-byte tail, then the empty final chunk.
    let mut in_progress = 0;
    loop {
        match b.wait_for("file progress", |e| matches!(e, Event::Progress(_, p) if p.payload_id == 2))
        {
            Event::Progress(_, progress) => match progress.status {
                PayloadStatus::InProgress => {
                    in_progress += 1;
                    assert!(progress.bytes_transferred <= 200_000);
                }
                PayloadStatus::Success => {
                    assert_eq!(progress.bytes_transferred, 200_000);
                    break;
                }
                other => panic!("unexpected status {:?}", other),
            },
            _ => unreachable!(),
        }
    }
    assert_eq!(in_progress, 4);

    let received = fs::read(&dest).unwrap();
    assert_eq!(received.len(), 200_000);
    assert_eq!(received, data);
    fs::remove_file(src).unwrap();
    fs::remove_file(dest).unwrap();
}

#[test]
fn bandwidth_upgrade_to_wifi_lan() {
    let hub = FakeHub::new();
    let a = Device::new(&hub, "a", &[Medium::Bluetooth, Medium::WifiLan]);
    let b = Device::new(&hub, "b", &[Medium::Bluetooth, Medium::WifiLan]);
    let (a_id, b_id) = connect_pair(&a, &b, "upgrade", Strategy::P2pCluster);

    assert_eq!(
        a.core.client().connection_medium(&b_id),
        Some(Medium::Bluetooth)
    );

    a.core.initiate_bandwidth_upgrade(&b_id).unwrap();

    a.wait_for("bandwidth changed on a", |e| {
        matches!(e, Event::BandwidthChanged(id, Medium::WifiLan) if *id == b_id)
    });
    b.wait_for("bandwidth changed on b", |e| {
        matches!(e, Event::BandwidthChanged(id, Medium::WifiLan) if *id == a_id)
    });
    assert_eq!(
        a.core.client().connection_medium(&b_id),
        Some(Medium::WifiLan)
    );
    assert_eq!(
        b.core.client().connection_medium(&a_id),
        Some(Medium::WifiLan)
    );

    // Payloads traverse the new channel transparently.
    a.core
        .send_payload(&[b_id], Payload::from_bytes(3, b"post-upgrade".to_vec()))
        .unwrap();
    let (_, payload) = b.wait_payload();
    assert_eq!(payload.as_bytes(), Some(&b"post-upgrade"[..]));
}

#[test]
fn cancel_mid_stream() {
    let hub = FakeHub::new();
    let a = Device::new(&hub, "a", &[Medium::WifiLan]);
    let b = Device::new(&hub, "b", &[Medium::WifiLan]);
    let (_a_id, b_id) = connect_pair(&a, &b, "streams", Strategy::P2pCluster);

    let (writer, reader) = pipe();
    a.core
        .send_payload(&[b_id], Payload::from_stream(77, Box::new(reader)))
        .unwrap();

    let chunk = vec![0xabu8; 64 * 1024];
    for _ in 0..3 {
        writer.write(&chunk).unwrap();
    }

    let (_, payload) = b.wait_payload();
    assert_eq!(payload.id(), 77);

    // Let a couple of chunks land before cancelling.
    b.wait_for("some stream progress", |e| {
        matches!(e, Event::Progress(_, p)
            if p.payload_id == 77
                && p.status == PayloadStatus::InProgress
                && p.bytes_transferred >= 2 * 64 * 1024)
    });
    b.core.cancel_payload(77).unwrap();

    b.wait_for("cancelled on receiver", |e| {
        matches!(e, Event::Progress(_, p)
            if p.payload_id == 77 && p.status == PayloadStatus::Canceled)
    });
    a.wait_for("cancelled on sender", |e| {
        matches!(e, Event::Progress(_, p)
            if p.payload_id == 77 && p.status == PayloadStatus::Canceled)
    });

    // The receiver's stream ends instead of hanging.
    let mut stream = match payload.into_content() {
        PayloadContent::Stream(stream) => stream,
        _ => panic!("expected a stream payload"),
    };
    loop {
        match stream.read(64 * 1024) {
            Ok(bytes) if bytes.is_empty() => break,
            Ok(_) => {}
            Err(_) => break,
        }
    }
    drop(writer);
}

#[test]
fn reject_path_is_terminal() {
    let hub = FakeHub::new();
    let a = Device::new(&hub, "a", &[Medium::Ble]);
    let b = Device::new(&hub, "b", &[Medium::Ble]);
    let a_id = a.core.local_endpoint_id();
    let b_id = b.core.local_endpoint_id();

    a.core
        .start_advertising("svc", b"A", AdvertisingOptions::default(), a.conn_listener())
        .unwrap();
    b.core
        .start_discovery("svc", DiscoveryOptions::default(), b.discovery_listener())
        .unwrap();
    b.wait_for("found", |e| matches!(e, Event::Found(id) if *id == a_id));
    b.core
        .request_connection(&a_id, b"B", ConnectionOptions::default(), b.conn_listener())
        .unwrap();
    a.wait_for("initiated", |e| matches!(e, Event::Initiated { .. }));

    a.core.reject_connection(&b_id).unwrap();

    a.wait_for("rejected on a", |e| {
        matches!(e, Event::Rejected(id, Status::ConnectionRejected) if *id == b_id)
    });
    b.wait_for("rejected on b", |e| {
        matches!(e, Event::Rejected(id, Status::ConnectionRejected) if *id == a_id)
    });
    assert!(!a.core.client().is_connected_to(&b_id));
    assert!(!b.core.client().is_connected_to(&a_id));
}

#[test]
fn point_to_point_allows_only_one_connection() {
    let hub = FakeHub::new();
    let a = Device::new(&hub, "a", &[Medium::Bluetooth]);
    let b = Device::new(&hub, "b", &[Medium::Bluetooth]);
    let c = Device::new(&hub, "c", &[Medium::Bluetooth]);
    let strategy = Strategy::P2pPointToPoint;

    let (a_id, _b_id) = connect_pair(&a, &b, "ptp", strategy);

    // A third device also advertises the service.
    c.core
        .start_advertising("ptp", b"C", AdvertisingOptions { strategy, ..Default::default() }, c.conn_listener())
        .unwrap();
    let c_id = c.core.local_endpoint_id();
    b.wait_for("found c", |e| matches!(e, Event::Found(id) if *id == c_id));

    // The connected requester may not open a second relationship.
    assert_eq!(
        b.core
            .request_connection(&c_id, b"B", ConnectionOptions::default(), b.conn_listener())
            .unwrap_err(),
        Status::OutOfOrderApiCall
    );
    // And re-requesting the existing peer is a duplicate.
    assert_eq!(
        b.core
            .request_connection(&a_id, b"B", ConnectionOptions::default(), b.conn_listener())
            .unwrap_err(),
        Status::AlreadyConnectedToEndpoint
    );
}

#[test]
fn stop_all_endpoints_clears_state() {
    let hub = FakeHub::new();
    let a = Device::new(&hub, "a", &[Medium::WifiLan]);
    let b = Device::new(&hub, "b", &[Medium::WifiLan]);
    let (a_id, b_id) = connect_pair(&a, &b, "teardown", Strategy::P2pCluster);

    a.core.stop_all_endpoints().unwrap();

    assert!(!a.core.client().is_advertising());
    assert!(!a.core.client().is_connected_to(&b_id));
    assert_eq!(
        a.core
            .send_payload(&[b_id], Payload::from_bytes(9, b"late".to_vec()))
            .unwrap_err(),
        Status::NotConnectedToEndpoint
    );

    // The peer notices the vanished endpoint on its own.
    b.wait_for("disconnected on b", |e| {
        matches!(e, Event::Disconnected(id) if *id == a_id)
    });

    // A fresh start with a different strategy is legal now.
    a.core
        .start_advertising(
            "fresh",
            b"A",
            AdvertisingOptions {
                strategy: Strategy::P2pStar,
                ..Default::default()
            },
            a.conn_listener(),
        )
        .unwrap();
}

#[test]
fn duplicate_and_conflicting_starts() {
    let hub = FakeHub::new();
    let a = Device::new(&hub, "a", &[Medium::Ble]);

    a.core
        .start_advertising("svc", b"A", AdvertisingOptions::default(), a.conn_listener())
        .unwrap();
    assert_eq!(
        a.core
            .start_advertising("svc", b"A", AdvertisingOptions::default(), a.conn_listener())
            .unwrap_err(),
        Status::AlreadyAdvertising
    );
    assert_eq!(
        a.core
            .start_discovery(
                "svc",
                DiscoveryOptions {
                    strategy: Strategy::P2pStar,
                },
                a.discovery_listener(),
            )
            .unwrap_err(),
        Status::AlreadyHaveActiveStrategy
    );

    a.core
        .start_discovery("svc", DiscoveryOptions::default(), a.discovery_listener())
        .unwrap();
    assert_eq!(
        a.core
            .start_discovery("svc", DiscoveryOptions::default(), a.discovery_listener())
            .unwrap_err(),
        Status::AlreadyDiscovering
    );

    // Stop-then-start behaves like a fresh start.
    a.core.stop_advertising().unwrap();
    a.core
        .start_advertising("svc", b"A", AdvertisingOptions::default(), a.conn_listener())
        .unwrap();
}

#[test]
#[ignore = "exercises the 30 second keep-alive watchdog in real time"]
fn keep_alive_watchdog_disconnects_silent_peer() {
    use nearlink::channel::EndpointChannel;
    use nearlink::client::{Client, Connection, ConnectionStatus};
    use nearlink::endpoint_manager::EndpointManager;
    use nearlink::medium::fake::socket_pair;

    let (socket, peer_socket) = socket_pair(Medium::Bluetooth, "a", "b");
    let channel = EndpointChannel::from_socket("watchdog", socket);
    let peer = EndpointChannel::from_socket("peer", peer_socket);

    let (tx, rx) = unbounded();
    let client = Client::new();
    let listener = ConnectionListener {
        disconnected: Box::new(move |id| {
            let _ = tx.send(id.to_owned());
        }),
        ..Default::default()
    };
    client
        .add_connection(
            "WXYZ",
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

    let manager = EndpointManager::new();
    manager.register_endpoint(&client, "WXYZ", channel).unwrap();

    // The peer reads (so its side stays quiet but healthy) and never
    // writes; our watchdog must fire at ~30s.
    std::thread::spawn(move || while peer.read().is_ok() {});

    let disconnected = rx.recv_timeout(Duration::from_secs(40)).unwrap();
    assert_eq!(disconnected, "WXYZ");
}
