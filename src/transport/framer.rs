//! Frame encoding, the receive loop and connection teardown.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex};
use zeroize::{Zeroize, Zeroizing};

use super::{AsyncStream, BoxedStream};
use crate::error::{DecodeError, Result, TransportError};

/// Terminator appended to every outgoing frame.
const FRAME_TERMINATOR: char = '\n';

/// Encode one payload for the wire: base64 followed by the terminator.
pub fn encode_frame(text: &str) -> String {
    let mut frame = STANDARD.encode(text.as_bytes());
    frame.push(FRAME_TERMINATOR);
    frame
}

/// Decode one frame (terminator already stripped) back to its payload.
pub fn decode_frame(frame: &[u8]) -> std::result::Result<String, DecodeError> {
    let bytes = STANDARD.decode(frame)?;
    Ok(String::from_utf8(bytes)?)
}

/// Decode a received frame, then wipe it. The payload is wiped on drop.
fn decode_and_wipe(frame: &mut Vec<u8>) -> std::result::Result<Zeroizing<String>, DecodeError> {
    let payload = decode_frame(frame).map(Zeroizing::new);
    frame.zeroize();
    payload
}

fn is_terminator(byte: u8) -> bool {
    byte == b'\n' || byte == b'\r'
}

fn classify_io(err: io::Error) -> TransportError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted => TransportError::Disconnected,
        _ => TransportError::Io(err),
    }
}

/// One-shot "flow completed" signal shared by a connection and its handler.
///
/// The receive loop checks it at frame boundaries and wakes on it while
/// waiting for the first byte of the next frame.
#[derive(Debug, Clone)]
pub struct FlowSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for FlowSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowSignal {
    /// Create an uncompleted signal
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Mark the flow completed. Returns `true` only for the first call.
    pub fn complete(&self) -> bool {
        self.tx.send_if_modified(|done| {
            if *done {
                false
            } else {
                *done = true;
                true
            }
        })
    }

    /// Whether [`complete`](Self::complete) has been called
    pub fn is_completed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the flow is completed.
    pub async fn completed(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|done| *done).await;
    }
}

/// Serialized writer for one connection. Cheap to clone.
#[derive(Clone)]
pub struct FrameSender {
    writer: Arc<Mutex<Option<WriteHalf<BoxedStream>>>>,
}

impl FrameSender {
    fn new(writer: WriteHalf<BoxedStream>) -> Self {
        Self {
            writer: Arc::new(Mutex::new(Some(writer))),
        }
    }

    /// Send one text payload as a single atomic frame write.
    pub async fn send(&self, text: &str) -> Result<()> {
        let frame = encode_frame(text);
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::Aborted)?;
        writer.write_all(frame.as_bytes()).await.map_err(classify_io)?;
        writer.flush().await.map_err(classify_io)?;
        tracing::debug!(bytes = frame.len(), "Frame sent");
        Ok(())
    }

    /// Serialize `message` to JSON and send it.
    pub async fn send_message<T: Serialize + Sync>(&self, message: &T) -> Result<()> {
        let json = serde_json::to_string(message)?;
        self.send(&json).await
    }

    /// Shut down and release the write half.
    ///
    /// Returns `true` the first time; later calls are no-ops returning `false`.
    pub async fn close(&self) -> bool {
        let Some(mut writer) = self.writer.lock().await.take() else {
            return false;
        };
        if let Err(e) = writer.shutdown().await {
            tracing::debug!("Shutdown after close: {}", e);
        }
        true
    }

    /// Whether the write half has been released
    pub async fn is_closed(&self) -> bool {
        self.writer.lock().await.is_none()
    }
}

/// Consumer of decoded frames.
#[async_trait]
pub trait FrameHandler: Send {
    /// Handle one decoded payload.
    ///
    /// Recoverable errors (see [`ProximityError::is_recoverable`]) drop the
    /// frame; any other error ends the receive loop.
    ///
    /// [`ProximityError::is_recoverable`]: crate::ProximityError::is_recoverable
    async fn handle_frame(&mut self, payload: &str) -> Result<()>;
}

struct FrameReader {
    reader: BufReader<ReadHalf<BoxedStream>>,
    buf: Vec<u8>,
    max_frame_len: usize,
    discarding: bool,
}

impl FrameReader {
    async fn next_byte(&mut self, flow: &FlowSignal) -> Option<io::Result<u8>> {
        if !self.buf.is_empty() || self.discarding {
            return Some(self.reader.read_u8().await);
        }
        tokio::select! {
            biased;
            () = flow.completed() => None,
            byte = self.reader.read_u8() => Some(byte),
        }
    }

    async fn run<H: FrameHandler + ?Sized>(&mut self, handler: &mut H, flow: &FlowSignal) -> Result<()> {
        loop {
            if flow.is_completed() {
                return Ok(());
            }
            let Some(byte) = self.next_byte(flow).await else {
                return Ok(());
            };
            let byte = byte.map_err(classify_io)?;

            if !is_terminator(byte) {
                if self.discarding {
                    continue;
                }
                if self.buf.len() >= self.max_frame_len {
                    tracing::warn!(
                        "{}",
                        DecodeError::FrameTooLarge {
                            len: self.buf.len() + 1,
                            max: self.max_frame_len,
                        }
                    );
                    self.buf.zeroize();
                    self.buf = Vec::new();
                    self.discarding = true;
                    continue;
                }
                self.buf.push(byte);
                continue;
            }

            if self.discarding {
                self.discarding = false;
                continue;
            }
            if self.buf.is_empty() {
                continue;
            }

            let mut frame = std::mem::take(&mut self.buf);
            let bytes = frame.len();
            let result = match decode_and_wipe(&mut frame) {
                Ok(payload) => {
                    tracing::debug!(bytes, "Frame received");
                    handler.handle_frame(&payload).await
                }
                Err(e) => Err(e.into()),
            };

            match result {
                Ok(()) => {}
                Err(e) if e.is_recoverable() => tracing::warn!("Dropped frame: {}", e),
                Err(e) => return Err(e),
            }
        }
    }
}

/// An open connection whose receive loop has not started yet.
pub struct Connection {
    reader: FrameReader,
    sender: FrameSender,
    flow: FlowSignal,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("flow", &self.flow)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Take ownership of a connected stream.
    pub fn new<S: AsyncStream + 'static>(stream: S, max_frame_len: usize) -> Self {
        let boxed: BoxedStream = Box::new(stream);
        let (read_half, write_half) = tokio::io::split(boxed);
        Self {
            reader: FrameReader {
                reader: BufReader::new(read_half),
                buf: Vec::new(),
                max_frame_len,
                discarding: false,
            },
            sender: FrameSender::new(write_half),
            flow: FlowSignal::new(),
        }
    }

    /// Writer handle for this connection
    pub fn sender(&self) -> FrameSender {
        self.sender.clone()
    }

    /// Completion signal for this connection
    pub fn flow(&self) -> FlowSignal {
        self.flow.clone()
    }

    /// Run the receive loop until the flow completes or the stream fails, then
    /// tear the connection down.
    pub async fn run<H: FrameHandler + ?Sized>(self, handler: &mut H) -> Result<()> {
        let Connection {
            mut reader,
            sender,
            flow,
        } = self;

        let result = reader.run(handler, &flow).await;
        match &result {
            Ok(()) => tracing::debug!("Receive loop finished"),
            Err(e) => tracing::warn!("Receive loop ended: {}", e),
        }

        flow.complete();
        sender.close().await;
        drop(reader);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProximityError;
    use tokio::io::duplex;

    #[derive(Default)]
    struct Collect {
        frames: Vec<String>,
        stop_after: Option<usize>,
        flow: Option<FlowSignal>,
    }

    #[async_trait]
    impl FrameHandler for Collect {
        async fn handle_frame(&mut self, payload: &str) -> Result<()> {
            self.frames.push(payload.to_string());
            if self.stop_after == Some(self.frames.len()) {
                if let Some(flow) = &self.flow {
                    flow.complete();
                }
            }
            Ok(())
        }
    }

    #[test]
    fn test_encode_frame() {
        assert_eq!(encode_frame("hi"), "aGk=\n");
        assert_eq!(decode_frame(b"aGk=").unwrap(), "hi");
        assert!(matches!(decode_frame(b"***"), Err(DecodeError::Base64(_))));
        assert!(matches!(decode_frame(b"/w=="), Err(DecodeError::Utf8(_))));
    }

    #[test]
    fn test_received_frame_wiped() {
        let mut frame = b"aGk=".to_vec();
        let payload = decode_and_wipe(&mut frame).unwrap();
        assert_eq!(payload.as_str(), "hi");
        assert!(frame.is_empty());

        let mut frame = b"***".to_vec();
        assert!(decode_and_wipe(&mut frame).is_err());
        assert!(frame.is_empty());
    }

    #[test]
    fn test_flow_signal_once() {
        let flow = FlowSignal::new();
        assert!(!flow.is_completed());
        assert!(flow.complete());
        assert!(!flow.complete());
        assert!(flow.clone().is_completed());
    }

    #[tokio::test]
    async fn test_crlf_and_bad_frames_skipped() {
        let (local, mut remote) = duplex(1024);
        let connection = Connection::new(local, 1024);

        remote.write_all(b"aGk=\r\n***\n\rb2s=\n").await.unwrap();
        drop(remote);

        let mut handler = Collect::default();
        let err = connection.run(&mut handler).await.unwrap_err();
        assert_eq!(handler.frames, vec!["hi", "ok"]);
        assert!(matches!(err, ProximityError::Transport(TransportError::Disconnected)));
    }

    #[tokio::test]
    async fn test_frames_across_scripted_reads() {
        let stream = tokio_test::io::Builder::new()
            .read(b"aG")
            .wait(std::time::Duration::from_millis(5))
            .read(b"k=\nb2")
            .read(b"s=\r")
            .build();
        let connection = Connection::new(stream, 1024);

        let mut handler = Collect::default();
        let err = connection.run(&mut handler).await.unwrap_err();
        assert_eq!(handler.frames, vec!["hi", "ok"]);
        assert!(matches!(err, ProximityError::Transport(TransportError::Disconnected)));
    }

    #[tokio::test]
    async fn test_sender_single_write_per_frame() {
        let stream = tokio_test::io::Builder::new()
            .write(b"aGk=\n")
            .write(b"b2s=\n")
            .build();
        let connection = Connection::new(stream, 1024);
        let sender = connection.sender();

        sender.send("hi").await.unwrap();
        sender.send("ok").await.unwrap();
        drop(connection);
        assert!(sender.close().await);
    }

    #[tokio::test]
    async fn test_oversized_frame_discarded() {
        let (local, mut remote) = duplex(1024);
        let connection = Connection::new(local, 8);

        remote.write_all(b"QUFBQUFBQUFBQUFB\naGk=\n").await.unwrap();
        drop(remote);

        let mut handler = Collect::default();
        let _ = connection.run(&mut handler).await;
        assert_eq!(handler.frames, vec!["hi"]);
    }

    #[tokio::test]
    async fn test_send_and_close() {
        let (local, mut remote) = duplex(1024);
        let connection = Connection::new(local, 1024);
        let sender = connection.sender();

        sender.send("hi").await.unwrap();
        let mut buf = [0u8; 5];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"aGk=\n");

        assert!(sender.close().await);
        assert!(!sender.close().await);
        assert!(sender.is_closed().await);
        assert!(matches!(
            sender.send("late").await,
            Err(ProximityError::Transport(TransportError::Aborted))
        ));
    }

    #[tokio::test]
    async fn test_flow_completed_mid_stream() {
        let (local, mut remote) = duplex(1024);
        let connection = Connection::new(local, 1024);
        let sender = connection.sender();

        remote.write_all(b"aGk=\nb2s=\n").await.unwrap();

        let mut handler = Collect {
            stop_after: Some(1),
            flow: Some(connection.flow()),
            ..Collect::default()
        };
        connection.run(&mut handler).await.unwrap();
        assert_eq!(handler.frames, vec!["hi"]);
        assert!(sender.is_closed().await);
    }

    #[tokio::test]
    async fn test_completed_flow_wakes_idle_loop() {
        let (local, _remote) = duplex(1024);
        let connection = Connection::new(local, 1024);
        let flow = connection.flow();

        let task = tokio::spawn(async move {
            let mut handler = Collect::default();
            connection.run(&mut handler).await
        });
        tokio::task::yield_now().await;
        flow.complete();
        task.await.unwrap().unwrap();
    }
}
