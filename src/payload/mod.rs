//! Payloads and their transfer-side internals.
//!
//! A [`Payload`] is what clients hand to `send_payload` and what the
//! [`PayloadListener`] delivers on the receiving side: bytes, a readable
//! stream, or a file. The transfer machinery works on [`InternalPayload`]s,
//! one tagged variant per direction and kind, which reduce every payload to
//! two operations: detach the next outgoing chunk, or attach the next
//! incoming one.
//!
//! [`PayloadListener`]: ../core/struct.PayloadListener.html

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::warn;

use crate::frame::PayloadType;
use crate::medium::{InputStream, IoError};

pub mod manager;

/// Sender-chosen payload identifier: non-zero, unique per sender.
pub type PayloadId = i64;

/// Bytes read per outgoing stream/file chunk.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Reading half of an in-memory pipe; incoming stream payloads hand this to
/// the client while chunks are still arriving.
pub struct PipeReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    eof: bool,
}

impl InputStream for PipeReader {
    fn read(&mut self, limit: usize) -> Result<Vec<u8>, IoError> {
        loop {
            if !self.pending.is_empty() {
                let take = self.pending.len().min(limit.max(1));
                let rest = self.pending.split_off(take);
                return Ok(std::mem::replace(&mut self.pending, rest));
            }
            if self.eof {
                return Ok(Vec::new());
            }
            match self.rx.recv() {
                Ok(chunk) => self.pending = chunk,
                Err(_) => self.eof = true,
            }
        }
    }
}

/// Writing half of an in-memory pipe. Dropping it ends the reader's stream.
pub struct PipeWriter {
    tx: Sender<Vec<u8>>,
}

impl PipeWriter {
    pub fn write(&self, chunk: &[u8]) -> Result<(), IoError> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.tx.send(chunk.to_vec()).map_err(|_| IoError)
    }
}

/// Creates an in-memory pipe.
pub fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = unbounded();
    (
        PipeWriter { tx },
        PipeReader {
            rx,
            pending: Vec::new(),
            eof: false,
        },
    )
}

/// Content of a payload, by kind.
pub enum PayloadContent {
    Bytes(Vec<u8>),
    /// A readable stream. Outgoing: supplied by the sender, drained in
    /// chunks. Incoming: a pipe fed by the receiver as chunks arrive.
    Stream(Box<dyn InputStream>),
    /// A file on disk. Outgoing: the source. Incoming: the destination,
    /// complete once `Success` progress was reported.
    File { path: PathBuf, size: i64 },
}

/// A typed unit of data exchanged between endpoints.
pub struct Payload {
    id: PayloadId,
    /// Resume offset: outgoing stream/file payloads skip this many bytes
    /// before the first chunk.
    offset: i64,
    content: PayloadContent,
}

impl Payload {
    pub fn from_bytes(id: PayloadId, bytes: Vec<u8>) -> Payload {
        Payload {
            id,
            offset: 0,
            content: PayloadContent::Bytes(bytes),
        }
    }

    pub fn from_stream(id: PayloadId, stream: Box<dyn InputStream>) -> Payload {
        Payload {
            id,
            offset: 0,
            content: PayloadContent::Stream(stream),
        }
    }

    pub fn from_file(id: PayloadId, path: PathBuf) -> Payload {
        Payload {
            id,
            offset: 0,
            content: PayloadContent::File { path, size: -1 },
        }
    }

    pub(crate) fn new_incoming(id: PayloadId, content: PayloadContent) -> Payload {
        Payload {
            id,
            offset: 0,
            content,
        }
    }

    pub fn id(&self) -> PayloadId {
        self.id
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Sets the resume offset for an outgoing stream or file payload.
    pub fn set_offset(&mut self, offset: i64) {
        self.offset = offset;
    }

    pub fn payload_type(&self) -> PayloadType {
        match &self.content {
            PayloadContent::Bytes(_) => PayloadType::Bytes,
            PayloadContent::Stream(_) => PayloadType::Stream,
            PayloadContent::File { .. } => PayloadType::File,
        }
    }

    pub fn content(&self) -> &PayloadContent {
        &self.content
    }

    /// Consumes the payload, returning its content.
    pub fn into_content(self) -> PayloadContent {
        self.content
    }

    /// Borrows the byte content, if this is a bytes payload.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.content {
            PayloadContent::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// Transfer status reported through progress callbacks.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PayloadStatus {
    InProgress,
    Success,
    Failure,
    Canceled,
}

/// Progress of one payload on one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadProgress {
    pub payload_id: PayloadId,
    pub status: PayloadStatus,
    /// Declared total size; -1 when unknown (streams).
    pub total_size: i64,
    pub bytes_transferred: i64,
}

/// One chunk detached from an outgoing payload.
pub struct OutgoingChunk {
    pub body: Vec<u8>,
    pub last: bool,
}

/// The transfer-side realization of a payload.
///
/// The deep class hierarchy of other implementations collapses into one
/// tagged union with four live arms per direction.
pub enum InternalPayload {
    OutgoingBytes {
        data: Option<Vec<u8>>,
        total_size: i64,
    },
    OutgoingStream {
        stream: Box<dyn InputStream>,
    },
    OutgoingFile {
        file: fs::File,
        total_size: i64,
    },
    IncomingStream {
        writer: Option<PipeWriter>,
    },
    IncomingFile {
        file: Option<fs::File>,
        path: PathBuf,
        total_size: i64,
    },
}

impl InternalPayload {
    /// Wraps an outgoing client payload. Fails when a file source cannot be
    /// opened.
    pub fn new_outgoing(content: PayloadContent) -> Result<InternalPayload, IoError> {
        Ok(match content {
            PayloadContent::Bytes(bytes) => InternalPayload::OutgoingBytes {
                total_size: bytes.len() as i64,
                data: Some(bytes),
            },
            PayloadContent::Stream(stream) => InternalPayload::OutgoingStream { stream },
            PayloadContent::File { path, .. } => {
                let file = fs::File::open(&path).map_err(|_| IoError)?;
                let total_size = file.metadata().map_err(|_| IoError)?.len() as i64;
                InternalPayload::OutgoingFile { file, total_size }
            }
        })
    }

    pub fn payload_type(&self) -> PayloadType {
        match self {
            InternalPayload::OutgoingBytes { .. } => PayloadType::Bytes,
            InternalPayload::OutgoingStream { .. } | InternalPayload::IncomingStream { .. } => {
                PayloadType::Stream
            }
            InternalPayload::OutgoingFile { .. } | InternalPayload::IncomingFile { .. } => {
                PayloadType::File
            }
        }
    }

    /// Declared total size; -1 for streams.
    pub fn total_size(&self) -> i64 {
        match self {
            InternalPayload::OutgoingBytes { total_size, .. } => *total_size,
            InternalPayload::OutgoingStream { .. } | InternalPayload::IncomingStream { .. } => -1,
            InternalPayload::OutgoingFile { total_size, .. } => *total_size,
            InternalPayload::IncomingFile { total_size, .. } => *total_size,
        }
    }

    /// Detaches the next outgoing chunk of at most `chunk_size` bytes.
    pub fn next_chunk(&mut self, chunk_size: usize) -> Result<OutgoingChunk, IoError> {
        match self {
            InternalPayload::OutgoingBytes { data, .. } => match data.take() {
                Some(bytes) => Ok(OutgoingChunk {
                    body: bytes,
                    last: true,
                }),
                None => Ok(OutgoingChunk {
                    body: Vec::new(),
                    last: true,
                }),
            },
            InternalPayload::OutgoingStream { stream } => {
                let body = stream.read(chunk_size)?;
                let last = body.is_empty();
                Ok(OutgoingChunk { body, last })
            }
            InternalPayload::OutgoingFile { file, .. } => {
                let mut buffer = vec![0u8; chunk_size];
                let n = file.read(&mut buffer).map_err(|_| IoError)?;
                buffer.truncate(n);
                Ok(OutgoingChunk {
                    body: buffer,
                    last: n == 0,
                })
            }
            _ => Err(IoError),
        }
    }

    /// Attaches one incoming chunk; an empty chunk finishes the payload.
    pub fn attach_chunk(&mut self, chunk: &[u8]) -> Result<(), IoError> {
        match self {
            InternalPayload::IncomingStream { writer } => {
                if chunk.is_empty() {
                    writer.take();
                    Ok(())
                } else {
                    writer.as_ref().ok_or(IoError)?.write(chunk)
                }
            }
            InternalPayload::IncomingFile { file, .. } => {
                if chunk.is_empty() {
                    file.take();
                    Ok(())
                } else {
                    file.as_mut().ok_or(IoError)?.write_all(chunk).map_err(|_| IoError)
                }
            }
            _ => Err(IoError),
        }
    }

    /// Advances an outgoing source to `offset` before the first chunk.
    pub fn skip_to_offset(&mut self, offset: i64) -> Result<(), IoError> {
        if offset <= 0 {
            return Ok(());
        }
        match self {
            InternalPayload::OutgoingFile { file, .. } => {
                file.seek(SeekFrom::Start(offset as u64)).map_err(|_| IoError)?;
                Ok(())
            }
            InternalPayload::OutgoingStream { stream } => {
                let mut remaining = offset as usize;
                while remaining > 0 {
                    let skipped = stream.read(remaining.min(CHUNK_SIZE))?;
                    if skipped.is_empty() {
                        return Err(IoError);
                    }
                    remaining -= skipped.len();
                }
                Ok(())
            }
            _ => Err(IoError),
        }
    }

    /// Releases the underlying source or sink.
    pub fn close(&mut self) {
        match self {
            InternalPayload::OutgoingBytes { data, .. } => {
                data.take();
            }
            InternalPayload::OutgoingStream { .. } => {}
            InternalPayload::OutgoingFile { .. } => {}
            InternalPayload::IncomingStream { writer } => {
                writer.take();
            }
            InternalPayload::IncomingFile { file, path, .. } => {
                if file.take().is_some() {
                    warn!("incoming file {:?} closed before completion", path);
                }
            }
        }
    }
}

/// Strips path separators and parent-directory jumps out of a remote-chosen
/// file name.
pub fn sanitize_file_name(name: &str) -> String {
    let mut cleaned: String = name
        .chars()
        .filter(|c| *c != '/' && *c != '\\')
        .collect();
    while cleaned.contains("..") {
        cleaned = cleaned.replace("..", "");
    }
    cleaned
}
