use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::{
    marker::PhantomData,
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::envelope::CallId;

#[cfg(test)]
#[path = "./net.test.rs"]
mod tests;

/// Protocol version for wire format
pub const CURRENT_PROTOCOL_VERSION: u16 = 1;

/// Size of the big-endian length prefix in front of every frame body
pub const LENGTH_PREFIX: usize = 8;

/// Largest frame body a reader will accept before giving up on the stream
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Error types for wire format operations
#[derive(thiserror::Error, Debug)]
pub enum NetError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::error::EncodeError),

    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] bincode::error::DecodeError),

    #[error("Insufficient data: expected {expected} bytes, got {actual}")]
    InsufficientData { expected: usize, actual: usize },

    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolVersionMismatch { expected: u16, actual: u16 },

    #[error("Frame of {0} bytes exceeds the maximum frame length")]
    FrameTooLarge(usize),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
}

/// Frame header with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    /// Protocol version for future compatibility
    pub protocol_version: u16,
    /// Timestamp in UTC milliseconds
    pub timestamp: u64,
}

impl Header {
    pub fn new() -> Self {
        Header {
            protocol_version: CURRENT_PROTOCOL_VERSION,
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        }
    }
}

impl Default for Header {
    fn default() -> Self {
        Self::new()
    }
}

/// Acknowledgement written back by a receiver once an envelope has been
/// accepted onto its inbound queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub call_id: Option<CallId>,
}

/// Enum for payload result with success or failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload<T> {
    /// Successfully decoded payload
    Ok(T),
    /// Failed to decode with reason
    UnknownFailure(String),
}

impl<T> Payload<T> {
    /// Returns true if the payload is Ok
    pub fn is_ok(&self) -> bool {
        matches!(self, Payload::Ok(_))
    }

    /// Returns the inner value if Ok, or None if failure
    pub fn ok(self) -> Option<T> {
        match self {
            Payload::Ok(value) => Some(value),
            Payload::UnknownFailure(_) => None,
        }
    }

    /// Returns the failure reason if UnknownFailure, or None if Ok
    pub fn failure_reason(&self) -> Option<&String> {
        match self {
            Payload::Ok(_) => None,
            Payload::UnknownFailure(reason) => Some(reason),
        }
    }
}

/// Top-level frame that gets encoded/decoded from the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame<T> {
    pub header: Header,
    /// Typed payload
    pub payload: Payload<T>,
}

impl<T> Frame<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Create a new frame with a failure payload
    pub fn failure(reason: impl Into<String>) -> Self {
        Frame {
            header: Header::new(),
            payload: Payload::UnknownFailure(reason.into()),
        }
    }

    /// Create a new frame with a successful payload
    pub fn ok(value: T) -> Self {
        Frame {
            header: Header::new(),
            payload: Payload::Ok(value),
        }
    }

    /// Returns true if the payload is Ok
    pub fn is_ok(&self) -> bool {
        self.payload.is_ok()
    }

    /// Encode the frame to bytes, length prefix included
    pub fn encode(&self) -> Result<Bytes, NetError> {
        let config = bincode::config::standard();
        let mut buffer = BytesMut::new().writer();

        bincode::serde::encode_into_std_write(self, &mut buffer, config)?;

        let buffer = buffer.into_inner();
        let mut final_buffer = BytesMut::with_capacity(LENGTH_PREFIX + buffer.len());

        // Length in network byte order (big-endian)
        final_buffer.put_u64(buffer.len() as u64);
        final_buffer.extend_from_slice(&buffer);

        Ok(final_buffer.freeze())
    }

    /// Decode a frame body (without its length prefix)
    pub fn decode(bytes: Bytes) -> Result<Self, NetError> {
        let config = bincode::config::standard();

        let frame: Frame<T> = match bincode::serde::decode_from_slice(&bytes, config) {
            Ok((frame, _)) => frame,
            Err(err) => return Err(NetError::DeserializationError(err)),
        };

        if frame.header.protocol_version != CURRENT_PROTOCOL_VERSION {
            return Err(NetError::ProtocolVersionMismatch {
                expected: CURRENT_PROTOCOL_VERSION,
                actual: frame.header.protocol_version,
            });
        }

        Ok(frame)
    }

    /// Decode a single self-contained frame, such as one multicast datagram.
    pub fn decode_datagram(datagram: &[u8]) -> Result<Self, NetError> {
        let mut parser = FrameParser::<T>::new();
        parser.extend(datagram);
        match parser.parse()? {
            Some(frame) => Ok(frame),
            None => Err(NetError::InsufficientData {
                expected: parser.wanted(),
                actual: datagram.len(),
            }),
        }
    }
}

/// Incremental frame parser for processing incoming data
pub struct FrameParser<T>
where
    T: Serialize + for<'de> Deserialize<'de>,
{
    state: ReaderState,
    buffer: BytesMut,
    _phantom: PhantomData<T>,
}

enum ReaderState {
    ReadingLength,
    ReadingData(usize),
}

impl<T> FrameParser<T>
where
    T: Serialize + for<'de> Deserialize<'de>,
{
    pub fn new() -> Self {
        FrameParser {
            state: ReaderState::ReadingLength,
            buffer: BytesMut::new(),
            _phantom: PhantomData,
        }
    }

    /// Add data to the reader buffer
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Total bytes needed to finish the frame currently being read
    fn wanted(&self) -> usize {
        match self.state {
            ReaderState::ReadingLength => LENGTH_PREFIX,
            ReaderState::ReadingData(length) => LENGTH_PREFIX + length,
        }
    }

    /// Try to parse a complete frame from the buffer
    pub fn parse(&mut self) -> Result<Option<Frame<T>>, NetError> {
        loop {
            match &self.state {
                ReaderState::ReadingLength => {
                    if self.buffer.len() < LENGTH_PREFIX {
                        return Ok(None);
                    }

                    let length = (&self.buffer[0..LENGTH_PREFIX]).get_u64() as usize;
                    if length > MAX_FRAME_LEN {
                        return Err(NetError::FrameTooLarge(length));
                    }
                    self.buffer.advance(LENGTH_PREFIX);
                    self.state = ReaderState::ReadingData(length);
                }

                ReaderState::ReadingData(length) => {
                    if self.buffer.len() < *length {
                        return Ok(None);
                    }

                    let frame_data = self.buffer.split_to(*length).freeze();
                    self.state = ReaderState::ReadingLength;

                    return Frame::decode(frame_data).map(Some);
                }
            }
        }
    }
}

impl<T> Default for FrameParser<T>
where
    T: Serialize + for<'de> Deserialize<'de>,
{
    fn default() -> Self {
        Self::new()
    }
}

/// A stream for reading frames of type T
pub struct FrameReader<T>
where
    T: Serialize + DeserializeOwned,
{
    inner: Box<dyn AsyncRead + Send + Unpin>,
    reader: FrameParser<T>,
}

impl<T> FrameReader<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(stream: Box<dyn AsyncRead + Send + Unpin>) -> Self {
        FrameReader {
            inner: stream,
            reader: FrameParser::new(),
        }
    }

    /// Read the next frame from the stream, `None` on a clean end of stream
    pub async fn read_frame(&mut self) -> Result<Option<Frame<T>>, NetError> {
        if let Some(frame) = self.reader.parse()? {
            return Ok(Some(frame));
        }

        let mut buffer = [0u8; 1024];
        loop {
            match self.inner.read(&mut buffer).await {
                Ok(0) => return Ok(None),
                Ok(n) => {
                    self.reader.extend(&buffer[..n]);
                    if let Some(frame) = self.reader.parse()? {
                        return Ok(Some(frame));
                    }
                }
                Err(e) => {
                    return Err(NetError::InvalidFrame(format!("Read error: {}", e)));
                }
            }
        }
    }
}

/// A stream for writing frames of type T
pub struct FrameWriter<T>
where
    T: Serialize + DeserializeOwned,
{
    inner: Box<dyn AsyncWrite + Send + Unpin>,
    _phantom: PhantomData<T>,
}

impl<T> FrameWriter<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(stream: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
        FrameWriter {
            inner: stream,
            _phantom: PhantomData,
        }
    }

    pub async fn write_frame(&mut self, frame: &Frame<T>) -> Result<(), NetError> {
        let encoded = frame.encode()?;
        self.write_encoded(&encoded).await
    }

    /// Write bytes that were already produced by [`Frame::encode`]
    pub async fn write_encoded(&mut self, encoded: &[u8]) -> Result<(), NetError> {
        self.inner
            .write_all(encoded)
            .await
            .map_err(|e| NetError::InvalidFrame(format!("Write error: {}", e)))?;
        self.inner
            .flush()
            .await
            .map_err(|e| NetError::InvalidFrame(format!("Flush error: {}", e)))?;
        Ok(())
    }

    /// Shut down the write half so the peer observes end of stream
    pub async fn close(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}
