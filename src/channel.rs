//! The endpoint channel.
//!
//! Wraps one medium socket into a frame-oriented duplex pipe: every frame
//! on the wire is a big-endian `i32` length followed by that many bytes.
//! Reads and writes are serialized by two independent locks so one side
//! never blocks the other; encryption, the pause flag and the last-read
//! timestamp each have their own lock and none of them is ever held across
//! a blocking stream operation.
//!
//! `close` deliberately does not take the reader or writer lock: an
//! in-progress read or write is terminated by shutting the underlying
//! socket down and surfaces as an `Io` error to its caller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};
use log::{trace, warn};
use parking_lot::{Condvar, Mutex};

use crate::frame::{FrameType, OfflineFrame};
use crate::handshake::EncryptionContext;
use crate::medium::{InputStream, Medium, OutputStream, ShutdownHandle, Socket};
use crate::MAX_ALLOWED_READ_BYTES;
use core::fmt;

/// Errors produced by channel reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    /// The underlying stream failed or the peer violated framing limits.
    Io,
    /// The bytes arrived but did not decrypt or parse as a frame.
    InvalidProtocolBuffer,
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChannelError::Io => "channel I/O failure",
            ChannelError::InvalidProtocolBuffer => "undecodable frame",
        })
    }
}

impl std::error::Error for ChannelError {}

/// A length-prefixed, optionally-encrypted, pausable duplex byte channel
/// over one medium socket.
pub struct EndpointChannel {
    name: String,
    medium: Medium,
    reader: Mutex<Box<dyn InputStream>>,
    writer: Mutex<Box<dyn OutputStream>>,
    crypto: Mutex<Option<Arc<EncryptionContext>>>,
    paused: Mutex<bool>,
    pause_cond: Condvar,
    last_read: Mutex<Instant>,
    closed: AtomicBool,
    shutdown: ShutdownHandle,
}

impl EndpointChannel {
    /// Wraps a freshly-connected socket. The channel starts out plaintext.
    pub fn from_socket(name: &str, socket: Box<dyn Socket>) -> Arc<EndpointChannel> {
        let medium = socket.medium();
        let io = socket.split();
        Arc::new(EndpointChannel {
            name: name.to_owned(),
            medium,
            reader: Mutex::new(io.input),
            writer: Mutex::new(io.output),
            crypto: Mutex::new(None),
            paused: Mutex::new(false),
            pause_cond: Condvar::new(),
            last_read: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
            shutdown: io.shutdown,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn medium(&self) -> Medium {
        self.medium
    }

    /// Reads one frame's raw bytes, decrypting when encryption is enabled.
    pub fn read(&self) -> Result<Vec<u8>, ChannelError> {
        let raw = {
            let mut reader = self.reader.lock();
            let header = read_exactly(reader.as_mut(), 4)?;
            let length = BigEndian::read_i32(&header);
            if length < 0 || length as usize > MAX_ALLOWED_READ_BYTES {
                warn!("{}: oversized frame of {} bytes", self.name, length);
                return Err(ChannelError::Io);
            }
            read_exactly(reader.as_mut(), length as usize)?
        };

        let result = {
            let crypto = self.crypto.lock();
            match crypto.as_ref() {
                Some(context) => match context.decode_from_peer(&raw) {
                    Some(plaintext) => plaintext,
                    None => {
                        // A protocol race lets the peer send a KeepAlive
                        // before it has enabled encryption on its side.
                        // Accept exactly that frame in plaintext; anything
                        // else is corruption.
                        match OfflineFrame::decode(&raw) {
                            Ok(frame) if frame.frame_type() == FrameType::KeepAlive => raw,
                            _ => return Err(ChannelError::InvalidProtocolBuffer),
                        }
                    }
                },
                None => raw,
            }
        };

        *self.last_read.lock() = Instant::now();
        Ok(result)
    }

    /// Reads and parses one frame.
    pub fn read_frame(&self) -> Result<OfflineFrame, ChannelError> {
        let bytes = self.read()?;
        OfflineFrame::decode(&bytes).map_err(|_| ChannelError::InvalidProtocolBuffer)
    }

    /// Writes one frame's raw bytes, encrypting when encryption is enabled.
    /// Blocks while the channel is paused.
    pub fn write(&self, data: &[u8]) -> Result<(), ChannelError> {
        {
            let mut paused = self.paused.lock();
            while *paused {
                self.pause_cond.wait(&mut paused);
            }
        }

        let ciphertext;
        let to_write: &[u8] = {
            let crypto = self.crypto.lock();
            match crypto.as_ref() {
                Some(context) => {
                    ciphertext = context.encode_to_peer(data);
                    &ciphertext
                }
                None => data,
            }
        };

        let mut writer = self.writer.lock();
        let mut header = [0u8; 4];
        BigEndian::write_i32(&mut header, to_write.len() as i32);
        writer.write(&header).map_err(|_| ChannelError::Io)?;
        writer.write(to_write).map_err(|_| ChannelError::Io)?;
        writer.flush().map_err(|_| ChannelError::Io)?;
        trace!("{}: wrote {} bytes", self.name, to_write.len());
        Ok(())
    }

    /// Serializes and writes one frame.
    pub fn write_frame(&self, frame: &OfflineFrame) -> Result<(), ChannelError> {
        self.write(&frame.encode())
    }

    /// Atomically installs the duplex AEAD context. Everything written
    /// afterwards is encrypted; everything read is expected to be.
    pub fn enable_encryption(&self, context: Arc<EncryptionContext>) {
        *self.crypto.lock() = Some(context);
    }

    pub fn is_encrypted(&self) -> bool {
        self.crypto.lock().is_some()
    }

    /// The installed AEAD context, if any. A bandwidth upgrade carries it
    /// over to the replacement channel.
    pub fn encryption_context(&self) -> Option<Arc<EncryptionContext>> {
        self.crypto.lock().clone()
    }

    /// Makes subsequent writes block until [`resume`](Self::resume).
    pub fn pause(&self) {
        *self.paused.lock() = true;
    }

    /// Wakes writers blocked by [`pause`](Self::pause).
    pub fn resume(&self) {
        let mut paused = self.paused.lock();
        *paused = false;
        self.pause_cond.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.lock()
    }

    /// Instant of the last successful read.
    pub fn last_read_timestamp(&self) -> Instant {
        *self.last_read.lock()
    }

    /// Time since the last successful read.
    pub fn last_read_age(&self) -> Duration {
        self.last_read.lock().elapsed()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Closes the channel: unblocks paused writers, then shuts the socket
    /// down so in-progress reads and writes terminate with `Io`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.resume();
        (self.shutdown)();
        trace!("{}: closed", self.name);
    }
}

impl fmt::Debug for EndpointChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointChannel")
            .field("name", &self.name)
            .field("medium", &self.medium)
            .field("encrypted", &self.is_encrypted())
            .finish()
    }
}

fn read_exactly(stream: &mut dyn InputStream, size: usize) -> Result<Vec<u8>, ChannelError> {
    let mut buffer = Vec::with_capacity(size);
    while buffer.len() < size {
        let chunk = stream
            .read(size - buffer.len())
            .map_err(|_| ChannelError::Io)?;
        if chunk.is_empty() {
            // EOF mid-frame.
            return Err(ChannelError::Io);
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer)
}
