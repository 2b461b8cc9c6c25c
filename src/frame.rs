//! The OfflineFrame codec.
//!
//! Every message on an endpoint channel is one OfflineFrame: an outer
//! version plus a V1 subframe whose type tag selects one of five messages
//! (connection request/response, payload transfer, bandwidth upgrade
//! negotiation, keep-alive). The wire encoding is protobuf-compatible so
//! that peers running other implementations of the protocol interoperate;
//! unknown fields from newer peers are skipped, not rejected.

use bitflags::bitflags;

use crate::bytes::{ByteReader, ByteWriter, WireType};
use crate::medium::Medium;
use crate::Error;

wire_enum! {
    /// Type tag of a V1 subframe.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub enum FrameType(u64) {
        ConnectionRequest = 1,
        ConnectionResponse = 2,
        PayloadTransfer = 3,
        BandwidthUpgradeNegotiation = 4,
        KeepAlive = 5,
    }
}

wire_enum! {
    /// Payload content kind.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub enum PayloadType(u64) {
        Bytes = 1,
        File = 2,
        Stream = 3,
    }
}

wire_enum! {
    /// Event carried by a payload-transfer CONTROL frame.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum ControlEvent(u64) {
        PayloadError = 1,
        PayloadCanceled = 2,
        PayloadReceivedAck = 3,
    }
}

bitflags! {
    /// Flag bits of a payload chunk.
    pub struct ChunkFlags: u32 {
        const LAST_CHUNK = 1;
    }
}

/// Fields of a CONNECTION_REQUEST subframe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub endpoint_id: String,
    pub endpoint_info: Vec<u8>,
    pub nonce: i32,
    pub mediums: Vec<Medium>,
}

/// Fields of a CONNECTION_RESPONSE subframe. Status zero accepts, anything
/// else rejects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionResponse {
    pub status: i32,
}

/// Per-payload metadata repeated on every transfer frame of that payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadHeader {
    pub id: i64,
    pub payload_type: PayloadType,
    /// Total byte count, or -1 when unknown (streams).
    pub total_size: i64,
    pub file_name: Option<String>,
    pub parent_folder: Option<String>,
}

/// One chunk of payload data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadChunk {
    pub flags: ChunkFlags,
    pub offset: i64,
    pub body: Vec<u8>,
}

/// A payload-level control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub event: ControlEvent,
    pub offset: i64,
}

/// A PAYLOAD_TRANSFER subframe, either data or control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadTransfer {
    Data {
        header: PayloadHeader,
        chunk: PayloadChunk,
    },
    Control {
        header: PayloadHeader,
        control: ControlMessage,
    },
}

impl PayloadTransfer {
    pub fn header(&self) -> &PayloadHeader {
        match self {
            PayloadTransfer::Data { header, .. } => header,
            PayloadTransfer::Control { header, .. } => header,
        }
    }
}

/// Connection credentials for the medium a session is upgrading to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeCredentials {
    WifiHotspot {
        ssid: String,
        password: String,
        port: i32,
    },
    WifiLan {
        ip_address: String,
        port: i32,
    },
    Bluetooth {
        service_name: String,
        mac_address: String,
    },
    WebRtc {
        peer_id: String,
    },
}

/// The medium + credentials block of an upgrade negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradePathInfo {
    pub medium: Medium,
    pub credentials: Option<UpgradeCredentials>,
}

/// A BANDWIDTH_UPGRADE_NEGOTIATION subframe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BandwidthUpgrade {
    UpgradePathAvailable(UpgradePathInfo),
    LastWriteToPriorChannel,
    SafeToClosePriorChannel,
    ClientIntroduction { endpoint_id: String },
    UpgradeFailure(UpgradePathInfo),
}

/// A V1 subframe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum V1Frame {
    ConnectionRequest(ConnectionRequest),
    ConnectionResponse(ConnectionResponse),
    PayloadTransfer(PayloadTransfer),
    BandwidthUpgrade(BandwidthUpgrade),
    KeepAlive,
}

impl V1Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            V1Frame::ConnectionRequest(_) => FrameType::ConnectionRequest,
            V1Frame::ConnectionResponse(_) => FrameType::ConnectionResponse,
            V1Frame::PayloadTransfer(_) => FrameType::PayloadTransfer,
            V1Frame::BandwidthUpgrade(_) => FrameType::BandwidthUpgradeNegotiation,
            V1Frame::KeepAlive => FrameType::KeepAlive,
        }
    }
}

/// A complete frame as sent over an endpoint channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfflineFrame {
    V1(V1Frame),
}

// Field numbers, straight from the wire schema.
mod fields {
    pub mod offline_frame {
        pub const VERSION: u32 = 1;
        pub const V1: u32 = 2;
    }
    pub mod v1_frame {
        pub const TYPE: u32 = 1;
        pub const CONNECTION_REQUEST: u32 = 2;
        pub const CONNECTION_RESPONSE: u32 = 3;
        pub const PAYLOAD_TRANSFER: u32 = 4;
        pub const BANDWIDTH_UPGRADE_NEGOTIATION: u32 = 5;
        pub const KEEP_ALIVE: u32 = 6;
    }
    pub mod connection_request {
        pub const ENDPOINT_ID: u32 = 1;
        pub const ENDPOINT_NAME: u32 = 2;
        pub const NONCE: u32 = 4;
        pub const MEDIUMS: u32 = 5;
        pub const ENDPOINT_INFO: u32 = 6;
    }
    pub mod connection_response {
        pub const STATUS: u32 = 1;
    }
    pub mod payload_transfer {
        pub const PACKET_TYPE: u32 = 1;
        pub const PAYLOAD_HEADER: u32 = 2;
        pub const PAYLOAD_CHUNK: u32 = 3;
        pub const CONTROL_MESSAGE: u32 = 4;

        pub const PACKET_DATA: u64 = 1;
        pub const PACKET_CONTROL: u64 = 2;
    }
    pub mod payload_header {
        pub const ID: u32 = 1;
        pub const TYPE: u32 = 2;
        pub const TOTAL_SIZE: u32 = 3;
        pub const FILE_NAME: u32 = 5;
        pub const PARENT_FOLDER: u32 = 6;
    }
    pub mod payload_chunk {
        pub const FLAGS: u32 = 1;
        pub const OFFSET: u32 = 2;
        pub const BODY: u32 = 3;
    }
    pub mod control_message {
        pub const EVENT: u32 = 1;
        pub const OFFSET: u32 = 2;
    }
    pub mod bandwidth_upgrade {
        pub const EVENT_TYPE: u32 = 1;
        pub const UPGRADE_PATH_INFO: u32 = 2;
        pub const CLIENT_INTRODUCTION: u32 = 3;

        pub const EVENT_UPGRADE_PATH_AVAILABLE: u64 = 1;
        pub const EVENT_LAST_WRITE: u64 = 2;
        pub const EVENT_SAFE_TO_CLOSE: u64 = 3;
        pub const EVENT_CLIENT_INTRODUCTION: u64 = 4;
        pub const EVENT_UPGRADE_FAILURE: u64 = 5;
    }
    pub mod upgrade_path_info {
        pub const MEDIUM: u32 = 1;
        pub const WIFI_HOTSPOT_CREDENTIALS: u32 = 2;
        pub const WIFI_LAN_SOCKET: u32 = 3;
        pub const BLUETOOTH_CREDENTIALS: u32 = 4;
        pub const WEB_RTC_CREDENTIALS: u32 = 6;
    }
    pub mod wifi_hotspot_credentials {
        pub const SSID: u32 = 1;
        pub const PASSWORD: u32 = 2;
        pub const PORT: u32 = 3;
    }
    pub mod wifi_lan_socket {
        pub const IP_ADDRESS: u32 = 1;
        pub const WIFI_PORT: u32 = 2;
    }
    pub mod bluetooth_credentials {
        pub const SERVICE_NAME: u32 = 1;
        pub const MAC_ADDRESS: u32 = 2;
    }
    pub mod web_rtc_credentials {
        pub const PEER_ID: u32 = 1;
    }
    pub mod client_introduction {
        pub const ENDPOINT_ID: u32 = 1;
    }
}

const OFFLINE_FRAME_VERSION_V1: u64 = 1;

impl OfflineFrame {
    /// Serializes the frame.
    pub fn encode(&self) -> Vec<u8> {
        let OfflineFrame::V1(v1) = self;
        let mut out = Vec::new();
        let mut w = ByteWriter::new(&mut out);
        w.write_varint_field(fields::offline_frame::VERSION, OFFLINE_FRAME_VERSION_V1);
        w.write_message_field(fields::offline_frame::V1, &encode_v1(v1));
        out
    }

    /// Parses a frame, skipping unknown fields.
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let mut reader = ByteReader::new(bytes);
        let mut version = 0;
        let mut v1_body = None;
        while !reader.is_empty() {
            let (field, wire_type) = reader.read_tag()?;
            match field {
                fields::offline_frame::VERSION if wire_type == WireType::Varint => {
                    version = reader.read_varint()?;
                }
                fields::offline_frame::V1 if wire_type == WireType::LengthDelimited => {
                    v1_body = Some(reader.read_length_delimited()?);
                }
                _ => reader.skip_field(wire_type)?,
            }
        }
        if version != OFFLINE_FRAME_VERSION_V1 {
            return Err(Error::InvalidValue);
        }
        let body = v1_body.ok_or(Error::InvalidValue)?;
        Ok(OfflineFrame::V1(decode_v1(body)?))
    }

    pub fn frame_type(&self) -> FrameType {
        let OfflineFrame::V1(v1) = self;
        v1.frame_type()
    }

    // Builders for each frame the runtime sends.

    pub fn for_connection_request(
        endpoint_id: &str,
        endpoint_info: &[u8],
        nonce: i32,
        mediums: &[Medium],
    ) -> Self {
        OfflineFrame::V1(V1Frame::ConnectionRequest(ConnectionRequest {
            endpoint_id: endpoint_id.to_owned(),
            endpoint_info: endpoint_info.to_owned(),
            nonce,
            mediums: mediums.to_vec(),
        }))
    }

    pub fn for_connection_response(status: i32) -> Self {
        OfflineFrame::V1(V1Frame::ConnectionResponse(ConnectionResponse { status }))
    }

    pub fn for_data_payload_transfer(header: PayloadHeader, chunk: PayloadChunk) -> Self {
        OfflineFrame::V1(V1Frame::PayloadTransfer(PayloadTransfer::Data {
            header,
            chunk,
        }))
    }

    pub fn for_control_payload_transfer(header: PayloadHeader, control: ControlMessage) -> Self {
        OfflineFrame::V1(V1Frame::PayloadTransfer(PayloadTransfer::Control {
            header,
            control,
        }))
    }

    pub fn for_bwu_path_available(info: UpgradePathInfo) -> Self {
        OfflineFrame::V1(V1Frame::BandwidthUpgrade(
            BandwidthUpgrade::UpgradePathAvailable(info),
        ))
    }

    pub fn for_bwu_last_write() -> Self {
        OfflineFrame::V1(V1Frame::BandwidthUpgrade(
            BandwidthUpgrade::LastWriteToPriorChannel,
        ))
    }

    pub fn for_bwu_safe_to_close() -> Self {
        OfflineFrame::V1(V1Frame::BandwidthUpgrade(
            BandwidthUpgrade::SafeToClosePriorChannel,
        ))
    }

    pub fn for_bwu_introduction(endpoint_id: &str) -> Self {
        OfflineFrame::V1(V1Frame::BandwidthUpgrade(
            BandwidthUpgrade::ClientIntroduction {
                endpoint_id: endpoint_id.to_owned(),
            },
        ))
    }

    pub fn for_bwu_failure(info: UpgradePathInfo) -> Self {
        OfflineFrame::V1(V1Frame::BandwidthUpgrade(BandwidthUpgrade::UpgradeFailure(
            info,
        )))
    }

    pub fn for_keep_alive() -> Self {
        OfflineFrame::V1(V1Frame::KeepAlive)
    }
}

fn encode_v1(v1: &V1Frame) -> Vec<u8> {
    use fields::v1_frame as f;
    let mut out = Vec::new();
    let mut w = ByteWriter::new(&mut out);
    w.write_varint_field(f::TYPE, v1.frame_type().as_raw());
    match v1 {
        V1Frame::ConnectionRequest(req) => {
            w.write_message_field(f::CONNECTION_REQUEST, &encode_connection_request(req))
        }
        V1Frame::ConnectionResponse(resp) => {
            w.write_message_field(f::CONNECTION_RESPONSE, &encode_connection_response(resp))
        }
        V1Frame::PayloadTransfer(transfer) => {
            w.write_message_field(f::PAYLOAD_TRANSFER, &encode_payload_transfer(transfer))
        }
        V1Frame::BandwidthUpgrade(bwu) => w.write_message_field(
            f::BANDWIDTH_UPGRADE_NEGOTIATION,
            &encode_bandwidth_upgrade(bwu),
        ),
        V1Frame::KeepAlive => w.write_message_field(f::KEEP_ALIVE, &[]),
    }
    out
}

fn decode_v1(body: &[u8]) -> Result<V1Frame, Error> {
    use fields::v1_frame as f;
    let mut reader = ByteReader::new(body);
    let mut frame_type = None;
    let mut request = None;
    let mut response = None;
    let mut transfer = None;
    let mut bwu = None;
    let mut keep_alive = false;

    while !reader.is_empty() {
        let (field, wire_type) = reader.read_tag()?;
        match (field, wire_type) {
            (f::TYPE, WireType::Varint) => {
                frame_type = Some(reader.read_varint()?);
            }
            (f::CONNECTION_REQUEST, WireType::LengthDelimited) => {
                request = Some(decode_connection_request(reader.read_length_delimited()?)?);
            }
            (f::CONNECTION_RESPONSE, WireType::LengthDelimited) => {
                response = Some(decode_connection_response(reader.read_length_delimited()?)?);
            }
            (f::PAYLOAD_TRANSFER, WireType::LengthDelimited) => {
                transfer = Some(decode_payload_transfer(reader.read_length_delimited()?)?);
            }
            (f::BANDWIDTH_UPGRADE_NEGOTIATION, WireType::LengthDelimited) => {
                bwu = Some(decode_bandwidth_upgrade(reader.read_length_delimited()?)?);
            }
            (f::KEEP_ALIVE, WireType::LengthDelimited) => {
                reader.read_length_delimited()?;
                keep_alive = true;
            }
            _ => reader.skip_field(wire_type)?,
        }
    }

    let frame_type =
        FrameType::from_raw(frame_type.ok_or(Error::InvalidValue)?).ok_or(Error::InvalidValue)?;
    match frame_type {
        FrameType::ConnectionRequest => request
            .map(V1Frame::ConnectionRequest)
            .ok_or(Error::InvalidValue),
        FrameType::ConnectionResponse => response
            .map(V1Frame::ConnectionResponse)
            .ok_or(Error::InvalidValue),
        FrameType::PayloadTransfer => transfer
            .map(V1Frame::PayloadTransfer)
            .ok_or(Error::InvalidValue),
        FrameType::BandwidthUpgradeNegotiation => {
            bwu.map(V1Frame::BandwidthUpgrade).ok_or(Error::InvalidValue)
        }
        FrameType::KeepAlive => {
            if keep_alive {
                Ok(V1Frame::KeepAlive)
            } else {
                Err(Error::InvalidValue)
            }
        }
    }
}

fn encode_connection_request(req: &ConnectionRequest) -> Vec<u8> {
    use fields::connection_request as f;
    let mut out = Vec::new();
    let mut w = ByteWriter::new(&mut out);
    w.write_bytes_field(f::ENDPOINT_ID, req.endpoint_id.as_bytes());
    // Legacy peers read the info bytes out of the name field.
    w.write_bytes_field(f::ENDPOINT_NAME, &req.endpoint_info);
    w.write_int_field(f::NONCE, i64::from(req.nonce));
    for medium in &req.mediums {
        w.write_tag(f::MEDIUMS, WireType::Varint);
        w.write_varint(medium.as_raw());
    }
    w.write_bytes_field(f::ENDPOINT_INFO, &req.endpoint_info);
    out
}

fn decode_connection_request(body: &[u8]) -> Result<ConnectionRequest, Error> {
    use fields::connection_request as f;
    let mut reader = ByteReader::new(body);
    let mut endpoint_id = String::new();
    let mut endpoint_name = Vec::new();
    let mut endpoint_info = Vec::new();
    let mut nonce = 0;
    let mut mediums = Vec::new();

    while !reader.is_empty() {
        let (field, wire_type) = reader.read_tag()?;
        match (field, wire_type) {
            (f::ENDPOINT_ID, WireType::LengthDelimited) => {
                endpoint_id = String::from_utf8(reader.read_length_delimited()?.to_vec())
                    .map_err(|_| Error::InvalidUtf8)?;
            }
            (f::ENDPOINT_NAME, WireType::LengthDelimited) => {
                endpoint_name = reader.read_length_delimited()?.to_vec();
            }
            (f::NONCE, WireType::Varint) => {
                nonce = reader.read_varint()? as i32;
            }
            (f::MEDIUMS, WireType::Varint) => {
                mediums.push(Medium::from_raw(reader.read_varint()?));
            }
            (f::MEDIUMS, WireType::LengthDelimited) => {
                // Packed encoding from newer peers.
                let mut packed = ByteReader::new(reader.read_length_delimited()?);
                while !packed.is_empty() {
                    mediums.push(Medium::from_raw(packed.read_varint()?));
                }
            }
            (f::ENDPOINT_INFO, WireType::LengthDelimited) => {
                endpoint_info = reader.read_length_delimited()?.to_vec();
            }
            _ => reader.skip_field(wire_type)?,
        }
    }

    if endpoint_info.is_empty() {
        endpoint_info = endpoint_name;
    }
    Ok(ConnectionRequest {
        endpoint_id,
        endpoint_info,
        nonce,
        mediums,
    })
}

fn encode_connection_response(resp: &ConnectionResponse) -> Vec<u8> {
    let mut out = Vec::new();
    ByteWriter::new(&mut out)
        .write_int_field(fields::connection_response::STATUS, i64::from(resp.status));
    out
}

fn decode_connection_response(body: &[u8]) -> Result<ConnectionResponse, Error> {
    let mut reader = ByteReader::new(body);
    let mut status = 0;
    while !reader.is_empty() {
        let (field, wire_type) = reader.read_tag()?;
        match (field, wire_type) {
            (fields::connection_response::STATUS, WireType::Varint) => {
                status = reader.read_varint()? as i32;
            }
            _ => reader.skip_field(wire_type)?,
        }
    }
    Ok(ConnectionResponse { status })
}

fn encode_payload_header(header: &PayloadHeader) -> Vec<u8> {
    use fields::payload_header as f;
    let mut out = Vec::new();
    let mut w = ByteWriter::new(&mut out);
    w.write_int_field(f::ID, header.id);
    w.write_varint_field(f::TYPE, header.payload_type.as_raw());
    w.write_int_field(f::TOTAL_SIZE, header.total_size);
    if let Some(name) = &header.file_name {
        w.write_bytes_field(f::FILE_NAME, name.as_bytes());
    }
    if let Some(folder) = &header.parent_folder {
        w.write_bytes_field(f::PARENT_FOLDER, folder.as_bytes());
    }
    out
}

fn decode_payload_header(body: &[u8]) -> Result<PayloadHeader, Error> {
    use fields::payload_header as f;
    let mut reader = ByteReader::new(body);
    let mut id = 0;
    let mut payload_type = None;
    let mut total_size = 0;
    let mut file_name = None;
    let mut parent_folder = None;

    while !reader.is_empty() {
        let (field, wire_type) = reader.read_tag()?;
        match (field, wire_type) {
            (f::ID, WireType::Varint) => id = reader.read_varint()? as i64,
            (f::TYPE, WireType::Varint) => {
                payload_type =
                    Some(PayloadType::from_raw(reader.read_varint()?).ok_or(Error::InvalidValue)?);
            }
            (f::TOTAL_SIZE, WireType::Varint) => total_size = reader.read_varint()? as i64,
            (f::FILE_NAME, WireType::LengthDelimited) => {
                file_name = Some(
                    String::from_utf8(reader.read_length_delimited()?.to_vec())
                        .map_err(|_| Error::InvalidUtf8)?,
                );
            }
            (f::PARENT_FOLDER, WireType::LengthDelimited) => {
                parent_folder = Some(
                    String::from_utf8(reader.read_length_delimited()?.to_vec())
                        .map_err(|_| Error::InvalidUtf8)?,
                );
            }
            _ => reader.skip_field(wire_type)?,
        }
    }

    Ok(PayloadHeader {
        id,
        payload_type: payload_type.ok_or(Error::InvalidValue)?,
        total_size,
        file_name,
        parent_folder,
    })
}

fn encode_payload_chunk(chunk: &PayloadChunk) -> Vec<u8> {
    use fields::payload_chunk as f;
    let mut out = Vec::new();
    let mut w = ByteWriter::new(&mut out);
    w.write_varint_field(f::FLAGS, u64::from(chunk.flags.bits()));
    w.write_int_field(f::OFFSET, chunk.offset);
    w.write_bytes_field(f::BODY, &chunk.body);
    out
}

fn decode_payload_chunk(body: &[u8]) -> Result<PayloadChunk, Error> {
    use fields::payload_chunk as f;
    let mut reader = ByteReader::new(body);
    let mut flags = ChunkFlags::empty();
    let mut offset = 0;
    let mut chunk_body = Vec::new();

    while !reader.is_empty() {
        let (field, wire_type) = reader.read_tag()?;
        match (field, wire_type) {
            (f::FLAGS, WireType::Varint) => {
                flags = ChunkFlags::from_bits_truncate(reader.read_varint()? as u32);
            }
            (f::OFFSET, WireType::Varint) => offset = reader.read_varint()? as i64,
            (f::BODY, WireType::LengthDelimited) => {
                chunk_body = reader.read_length_delimited()?.to_vec();
            }
            _ => reader.skip_field(wire_type)?,
        }
    }

    Ok(PayloadChunk {
        flags,
        offset,
        body: chunk_body,
    })
}

fn encode_control_message(control: &ControlMessage) -> Vec<u8> {
    use fields::control_message as f;
    let mut out = Vec::new();
    let mut w = ByteWriter::new(&mut out);
    w.write_varint_field(f::EVENT, control.event.as_raw());
    w.write_int_field(f::OFFSET, control.offset);
    out
}

fn decode_control_message(body: &[u8]) -> Result<ControlMessage, Error> {
    use fields::control_message as f;
    let mut reader = ByteReader::new(body);
    let mut event = None;
    let mut offset = 0;

    while !reader.is_empty() {
        let (field, wire_type) = reader.read_tag()?;
        match (field, wire_type) {
            (f::EVENT, WireType::Varint) => {
                event =
                    Some(ControlEvent::from_raw(reader.read_varint()?).ok_or(Error::InvalidValue)?);
            }
            (f::OFFSET, WireType::Varint) => offset = reader.read_varint()? as i64,
            _ => reader.skip_field(wire_type)?,
        }
    }

    Ok(ControlMessage {
        event: event.ok_or(Error::InvalidValue)?,
        offset,
    })
}

fn encode_payload_transfer(transfer: &PayloadTransfer) -> Vec<u8> {
    use fields::payload_transfer as f;
    let mut out = Vec::new();
    let mut w = ByteWriter::new(&mut out);
    match transfer {
        PayloadTransfer::Data { header, chunk } => {
            w.write_varint_field(f::PACKET_TYPE, f::PACKET_DATA);
            w.write_message_field(f::PAYLOAD_HEADER, &encode_payload_header(header));
            w.write_message_field(f::PAYLOAD_CHUNK, &encode_payload_chunk(chunk));
        }
        PayloadTransfer::Control { header, control } => {
            w.write_varint_field(f::PACKET_TYPE, f::PACKET_CONTROL);
            w.write_message_field(f::PAYLOAD_HEADER, &encode_payload_header(header));
            w.write_message_field(f::CONTROL_MESSAGE, &encode_control_message(control));
        }
    }
    out
}

fn decode_payload_transfer(body: &[u8]) -> Result<PayloadTransfer, Error> {
    use fields::payload_transfer as f;
    let mut reader = ByteReader::new(body);
    let mut packet_type = 0;
    let mut header = None;
    let mut chunk = None;
    let mut control = None;

    while !reader.is_empty() {
        let (field, wire_type) = reader.read_tag()?;
        match (field, wire_type) {
            (f::PACKET_TYPE, WireType::Varint) => packet_type = reader.read_varint()?,
            (f::PAYLOAD_HEADER, WireType::LengthDelimited) => {
                header = Some(decode_payload_header(reader.read_length_delimited()?)?);
            }
            (f::PAYLOAD_CHUNK, WireType::LengthDelimited) => {
                chunk = Some(decode_payload_chunk(reader.read_length_delimited()?)?);
            }
            (f::CONTROL_MESSAGE, WireType::LengthDelimited) => {
                control = Some(decode_control_message(reader.read_length_delimited()?)?);
            }
            _ => reader.skip_field(wire_type)?,
        }
    }

    let header = header.ok_or(Error::InvalidValue)?;
    match packet_type {
        f::PACKET_DATA => Ok(PayloadTransfer::Data {
            header,
            chunk: chunk.ok_or(Error::InvalidValue)?,
        }),
        f::PACKET_CONTROL => Ok(PayloadTransfer::Control {
            header,
            control: control.ok_or(Error::InvalidValue)?,
        }),
        _ => Err(Error::InvalidValue),
    }
}

fn encode_upgrade_path_info(info: &UpgradePathInfo) -> Vec<u8> {
    use fields::upgrade_path_info as f;
    let mut out = Vec::new();
    let mut w = ByteWriter::new(&mut out);
    w.write_varint_field(f::MEDIUM, info.medium.as_raw());
    match &info.credentials {
        Some(UpgradeCredentials::WifiHotspot {
            ssid,
            password,
            port,
        }) => {
            let mut body = Vec::new();
            let mut bw = ByteWriter::new(&mut body);
            bw.write_bytes_field(fields::wifi_hotspot_credentials::SSID, ssid.as_bytes());
            bw.write_bytes_field(
                fields::wifi_hotspot_credentials::PASSWORD,
                password.as_bytes(),
            );
            bw.write_int_field(fields::wifi_hotspot_credentials::PORT, i64::from(*port));
            w.write_message_field(f::WIFI_HOTSPOT_CREDENTIALS, &body);
        }
        Some(UpgradeCredentials::WifiLan { ip_address, port }) => {
            let mut body = Vec::new();
            let mut bw = ByteWriter::new(&mut body);
            bw.write_bytes_field(fields::wifi_lan_socket::IP_ADDRESS, ip_address.as_bytes());
            bw.write_int_field(fields::wifi_lan_socket::WIFI_PORT, i64::from(*port));
            w.write_message_field(f::WIFI_LAN_SOCKET, &body);
        }
        Some(UpgradeCredentials::Bluetooth {
            service_name,
            mac_address,
        }) => {
            let mut body = Vec::new();
            let mut bw = ByteWriter::new(&mut body);
            bw.write_bytes_field(
                fields::bluetooth_credentials::SERVICE_NAME,
                service_name.as_bytes(),
            );
            bw.write_bytes_field(
                fields::bluetooth_credentials::MAC_ADDRESS,
                mac_address.as_bytes(),
            );
            w.write_message_field(f::BLUETOOTH_CREDENTIALS, &body);
        }
        Some(UpgradeCredentials::WebRtc { peer_id }) => {
            let mut body = Vec::new();
            ByteWriter::new(&mut body)
                .write_bytes_field(fields::web_rtc_credentials::PEER_ID, peer_id.as_bytes());
            w.write_message_field(f::WEB_RTC_CREDENTIALS, &body);
        }
        None => {}
    }
    out
}

fn decode_string_field(reader: &mut ByteReader<'_>) -> Result<String, Error> {
    String::from_utf8(reader.read_length_delimited()?.to_vec()).map_err(|_| Error::InvalidUtf8)
}

fn decode_upgrade_path_info(body: &[u8]) -> Result<UpgradePathInfo, Error> {
    use fields::upgrade_path_info as f;
    let mut reader = ByteReader::new(body);
    let mut medium = Medium::Unknown;
    let mut credentials = None;

    while !reader.is_empty() {
        let (field, wire_type) = reader.read_tag()?;
        match (field, wire_type) {
            (f::MEDIUM, WireType::Varint) => medium = Medium::from_raw(reader.read_varint()?),
            (f::WIFI_HOTSPOT_CREDENTIALS, WireType::LengthDelimited) => {
                let mut inner = ByteReader::new(reader.read_length_delimited()?);
                let mut ssid = String::new();
                let mut password = String::new();
                let mut port = 0;
                while !inner.is_empty() {
                    let (field, wire_type) = inner.read_tag()?;
                    match (field, wire_type) {
                        (fields::wifi_hotspot_credentials::SSID, WireType::LengthDelimited) => {
                            ssid = decode_string_field(&mut inner)?;
                        }
                        (fields::wifi_hotspot_credentials::PASSWORD, WireType::LengthDelimited) => {
                            password = decode_string_field(&mut inner)?;
                        }
                        (fields::wifi_hotspot_credentials::PORT, WireType::Varint) => {
                            port = inner.read_varint()? as i32;
                        }
                        _ => inner.skip_field(wire_type)?,
                    }
                }
                credentials = Some(UpgradeCredentials::WifiHotspot {
                    ssid,
                    password,
                    port,
                });
            }
            (f::WIFI_LAN_SOCKET, WireType::LengthDelimited) => {
                let mut inner = ByteReader::new(reader.read_length_delimited()?);
                let mut ip_address = String::new();
                let mut port = 0;
                while !inner.is_empty() {
                    let (field, wire_type) = inner.read_tag()?;
                    match (field, wire_type) {
                        (fields::wifi_lan_socket::IP_ADDRESS, WireType::LengthDelimited) => {
                            ip_address = decode_string_field(&mut inner)?;
                        }
                        (fields::wifi_lan_socket::WIFI_PORT, WireType::Varint) => {
                            port = inner.read_varint()? as i32;
                        }
                        _ => inner.skip_field(wire_type)?,
                    }
                }
                credentials = Some(UpgradeCredentials::WifiLan { ip_address, port });
            }
            (f::BLUETOOTH_CREDENTIALS, WireType::LengthDelimited) => {
                let mut inner = ByteReader::new(reader.read_length_delimited()?);
                let mut service_name = String::new();
                let mut mac_address = String::new();
                while !inner.is_empty() {
                    let (field, wire_type) = inner.read_tag()?;
                    match (field, wire_type) {
                        (fields::bluetooth_credentials::SERVICE_NAME, WireType::LengthDelimited) => {
                            service_name = decode_string_field(&mut inner)?;
                        }
                        (fields::bluetooth_credentials::MAC_ADDRESS, WireType::LengthDelimited) => {
                            mac_address = decode_string_field(&mut inner)?;
                        }
                        _ => inner.skip_field(wire_type)?,
                    }
                }
                credentials = Some(UpgradeCredentials::Bluetooth {
                    service_name,
                    mac_address,
                });
            }
            (f::WEB_RTC_CREDENTIALS, WireType::LengthDelimited) => {
                let mut inner = ByteReader::new(reader.read_length_delimited()?);
                let mut peer_id = String::new();
                while !inner.is_empty() {
                    let (field, wire_type) = inner.read_tag()?;
                    match (field, wire_type) {
                        (fields::web_rtc_credentials::PEER_ID, WireType::LengthDelimited) => {
                            peer_id = decode_string_field(&mut inner)?;
                        }
                        _ => inner.skip_field(wire_type)?,
                    }
                }
                credentials = Some(UpgradeCredentials::WebRtc { peer_id });
            }
            _ => reader.skip_field(wire_type)?,
        }
    }

    Ok(UpgradePathInfo {
        medium,
        credentials,
    })
}

fn encode_bandwidth_upgrade(bwu: &BandwidthUpgrade) -> Vec<u8> {
    use fields::bandwidth_upgrade as f;
    let mut out = Vec::new();
    let mut w = ByteWriter::new(&mut out);
    match bwu {
        BandwidthUpgrade::UpgradePathAvailable(info) => {
            w.write_varint_field(f::EVENT_TYPE, f::EVENT_UPGRADE_PATH_AVAILABLE);
            w.write_message_field(f::UPGRADE_PATH_INFO, &encode_upgrade_path_info(info));
        }
        BandwidthUpgrade::LastWriteToPriorChannel => {
            w.write_varint_field(f::EVENT_TYPE, f::EVENT_LAST_WRITE);
        }
        BandwidthUpgrade::SafeToClosePriorChannel => {
            w.write_varint_field(f::EVENT_TYPE, f::EVENT_SAFE_TO_CLOSE);
        }
        BandwidthUpgrade::ClientIntroduction { endpoint_id } => {
            w.write_varint_field(f::EVENT_TYPE, f::EVENT_CLIENT_INTRODUCTION);
            let mut body = Vec::new();
            ByteWriter::new(&mut body)
                .write_bytes_field(fields::client_introduction::ENDPOINT_ID, endpoint_id.as_bytes());
            w.write_message_field(f::CLIENT_INTRODUCTION, &body);
        }
        BandwidthUpgrade::UpgradeFailure(info) => {
            w.write_varint_field(f::EVENT_TYPE, f::EVENT_UPGRADE_FAILURE);
            w.write_message_field(f::UPGRADE_PATH_INFO, &encode_upgrade_path_info(info));
        }
    }
    out
}

fn decode_bandwidth_upgrade(body: &[u8]) -> Result<BandwidthUpgrade, Error> {
    use fields::bandwidth_upgrade as f;
    let mut reader = ByteReader::new(body);
    let mut event = None;
    let mut path_info = None;
    let mut introduction_endpoint_id = None;

    while !reader.is_empty() {
        let (field, wire_type) = reader.read_tag()?;
        match (field, wire_type) {
            (f::EVENT_TYPE, WireType::Varint) => event = Some(reader.read_varint()?),
            (f::UPGRADE_PATH_INFO, WireType::LengthDelimited) => {
                path_info = Some(decode_upgrade_path_info(reader.read_length_delimited()?)?);
            }
            (f::CLIENT_INTRODUCTION, WireType::LengthDelimited) => {
                let mut inner = ByteReader::new(reader.read_length_delimited()?);
                while !inner.is_empty() {
                    let (field, wire_type) = inner.read_tag()?;
                    match (field, wire_type) {
                        (fields::client_introduction::ENDPOINT_ID, WireType::LengthDelimited) => {
                            introduction_endpoint_id = Some(decode_string_field(&mut inner)?);
                        }
                        _ => inner.skip_field(wire_type)?,
                    }
                }
            }
            _ => reader.skip_field(wire_type)?,
        }
    }

    match event.ok_or(Error::InvalidValue)? {
        f::EVENT_UPGRADE_PATH_AVAILABLE => Ok(BandwidthUpgrade::UpgradePathAvailable(
            path_info.ok_or(Error::InvalidValue)?,
        )),
        f::EVENT_LAST_WRITE => Ok(BandwidthUpgrade::LastWriteToPriorChannel),
        f::EVENT_SAFE_TO_CLOSE => Ok(BandwidthUpgrade::SafeToClosePriorChannel),
        f::EVENT_CLIENT_INTRODUCTION => Ok(BandwidthUpgrade::ClientIntroduction {
            endpoint_id: introduction_endpoint_id.ok_or(Error::InvalidValue)?,
        }),
        f::EVENT_UPGRADE_FAILURE => Ok(BandwidthUpgrade::UpgradeFailure(
            path_info.ok_or(Error::InvalidValue)?,
        )),
        _ => Err(Error::InvalidValue),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: OfflineFrame) {
        let bytes = frame.encode();
        assert_eq!(OfflineFrame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn connection_request_roundtrip() {
        roundtrip(OfflineFrame::for_connection_request(
            "ABCD",
            b"endpoint info",
            0x7ead_beef_u32 as i32,
            &[Medium::Bluetooth, Medium::WifiLan],
        ));
    }

    #[test]
    fn connection_response_roundtrip() {
        roundtrip(OfflineFrame::for_connection_response(0));
        roundtrip(OfflineFrame::for_connection_response(13));
    }

    #[test]
    fn data_payload_roundtrip() {
        roundtrip(OfflineFrame::for_data_payload_transfer(
            PayloadHeader {
                id: 0x1122_3344_5566,
                payload_type: PayloadType::File,
                total_size: 200_000,
                file_name: Some("photo.jpg".into()),
                parent_folder: Some("downloads".into()),
            },
            PayloadChunk {
                flags: ChunkFlags::empty(),
                offset: 65536,
                body: vec![7; 512],
            },
        ));
    }

    #[test]
    fn final_chunk_roundtrip() {
        roundtrip(OfflineFrame::for_data_payload_transfer(
            PayloadHeader {
                id: 5,
                payload_type: PayloadType::Stream,
                total_size: -1,
                file_name: None,
                parent_folder: None,
            },
            PayloadChunk {
                flags: ChunkFlags::LAST_CHUNK,
                offset: 1024,
                body: vec![],
            },
        ));
    }

    #[test]
    fn multi_gigabyte_sizes_roundtrip() {
        let total_size = 5 * 1024 * 1024 * 1024 + 3;
        let offset = total_size - 65536;
        assert!(offset > i64::from(u32::MAX));
        roundtrip(OfflineFrame::for_data_payload_transfer(
            PayloadHeader {
                id: 11,
                payload_type: PayloadType::File,
                total_size,
                file_name: Some("huge.bin".into()),
                parent_folder: None,
            },
            PayloadChunk {
                flags: ChunkFlags::empty(),
                offset,
                body: vec![0; 16],
            },
        ));
    }

    #[test]
    fn control_payload_roundtrip() {
        roundtrip(OfflineFrame::for_control_payload_transfer(
            PayloadHeader {
                id: -9,
                payload_type: PayloadType::Bytes,
                total_size: 2,
                file_name: None,
                parent_folder: None,
            },
            ControlMessage {
                event: ControlEvent::PayloadCanceled,
                offset: 5 * 1024 * 1024,
            },
        ));
    }

    #[test]
    fn bwu_roundtrips() {
        roundtrip(OfflineFrame::for_bwu_path_available(UpgradePathInfo {
            medium: Medium::WifiLan,
            credentials: Some(UpgradeCredentials::WifiLan {
                ip_address: "192.168.1.37".into(),
                port: 41523,
            }),
        }));
        roundtrip(OfflineFrame::for_bwu_path_available(UpgradePathInfo {
            medium: Medium::WifiHotspot,
            credentials: Some(UpgradeCredentials::WifiHotspot {
                ssid: "DIRECT-xy".into(),
                password: "sekrit".into(),
                port: 9,
            }),
        }));
        roundtrip(OfflineFrame::for_bwu_path_available(UpgradePathInfo {
            medium: Medium::Bluetooth,
            credentials: Some(UpgradeCredentials::Bluetooth {
                service_name: "svc".into(),
                mac_address: "AB:CD:EF:01:23:45".into(),
            }),
        }));
        roundtrip(OfflineFrame::for_bwu_path_available(UpgradePathInfo {
            medium: Medium::WebRtc,
            credentials: Some(UpgradeCredentials::WebRtc {
                peer_id: "peer-27".into(),
            }),
        }));
        roundtrip(OfflineFrame::for_bwu_last_write());
        roundtrip(OfflineFrame::for_bwu_safe_to_close());
        roundtrip(OfflineFrame::for_bwu_introduction("WXYZ"));
        roundtrip(OfflineFrame::for_bwu_failure(UpgradePathInfo {
            medium: Medium::WifiLan,
            credentials: None,
        }));
    }

    #[test]
    fn keep_alive_roundtrip() {
        let frame = OfflineFrame::for_keep_alive();
        assert_eq!(frame.frame_type(), FrameType::KeepAlive);
        roundtrip(frame);
    }

    #[test]
    fn unknown_fields_are_skipped() {
        let mut bytes = OfflineFrame::for_connection_response(0).encode();
        // Append field 200, varint 1 at the top level.
        let mut w = ByteWriter::new(&mut bytes);
        w.write_tag(200, WireType::Varint);
        w.write_varint(1);
        assert_eq!(
            OfflineFrame::decode(&bytes).unwrap(),
            OfflineFrame::for_connection_response(0)
        );
    }

    #[test]
    fn truncations_never_panic() {
        let bytes = OfflineFrame::for_connection_request(
            "ABCD",
            b"info",
            42,
            &[Medium::Ble],
        )
        .encode();
        for len in 0..bytes.len() {
            // Some prefixes happen to decode (protobuf is self-delimiting
            // only via the outer length); they must simply not panic.
            let _ = OfflineFrame::decode(&bytes[..len]);
        }
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(OfflineFrame::decode(&[]).is_err());
        assert!(OfflineFrame::decode(&[0xff; 32]).is_err());
        // Unknown frame type tag.
        let mut body = Vec::new();
        let mut w = ByteWriter::new(&mut body);
        w.write_varint_field(1, 99);
        let mut outer = Vec::new();
        let mut ow = ByteWriter::new(&mut outer);
        ow.write_varint_field(1, 1);
        ow.write_message_field(2, &body);
        assert_eq!(OfflineFrame::decode(&outer), Err(Error::InvalidValue));
    }
}
