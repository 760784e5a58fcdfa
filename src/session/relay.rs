//! Data relays between the pty and the connection
//!
//! Each relay reads from one side and reports what it got over its own
//! channel: any number of `Data` events followed by at most one `Stopped`.
//! Relays never retry after a failed read.
//!
//! Input for the pty is written by a dedicated thread so that a child which
//! stops reading its terminal never blocks the session's task.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, trace};

use crate::pty::PtyError;

/// Capacity of each relay's event channel
pub const RELAY_CHANNEL_CAPACITY: usize = 64;

/// Most input bytes allowed to wait for the pty writer
pub const MAX_PENDING_INPUT: usize = 4 * 1024 * 1024;

/// Why a relay, or the forwarding between relays, stopped
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("PTY closed")]
    PtyClosed,

    #[error("PTY read failed: {0}")]
    PtyRead(#[source] io::Error),

    #[error("PTY write failed: {0}")]
    PtyWrite(#[source] PtyError),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Connection read failed: {0}")]
    ConnectionRead(#[from] WsError),

    #[error("Connection send failed: {0}")]
    ConnectionSend(String),

    #[error("Unexpected {0} message from peer")]
    ProtocolViolation(&'static str),

    #[error("PTY input backlog exceeds {0} bytes")]
    InputBacklog(usize),
}

/// Event reported by a relay
#[derive(Debug)]
pub enum RelayEvent<T> {
    /// Payload to forward to the other side
    Data(T),
    /// The relay hit its terminal condition and exited
    Stopped(RelayError),
}

/// Start the pty → connection relay on a dedicated thread
///
/// Every successful read becomes exactly one `Data` event holding the text
/// decoded from the bytes actually read.
pub fn spawn_outbound(
    mut reader: Box<dyn Read + Send>,
    buffer_size: usize,
) -> io::Result<mpsc::Receiver<RelayEvent<String>>> {
    let (tx, rx) = mpsc::channel(RELAY_CHANNEL_CAPACITY);

    std::thread::Builder::new()
        .name("pty-reader".to_string())
        .spawn(move || {
            let mut buffer = vec![0u8; buffer_size];
            let mut decoder = Utf8Decoder::default();

            let reason = loop {
                match reader.read(&mut buffer) {
                    Ok(0) => break RelayError::PtyClosed,
                    Ok(n) => {
                        trace!("Read {} bytes from PTY", n);
                        let text = decoder.decode(&buffer[..n]);
                        if tx.blocking_send(RelayEvent::Data(text)).is_err() {
                            // Session no longer listening
                            return;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => break RelayError::PtyRead(e),
                }
            };

            if decoder.has_pending() {
                debug!("Dropping incomplete UTF-8 sequence at end of PTY output");
            }
            let _ = tx.blocking_send(RelayEvent::Stopped(reason));
        })?;

    Ok(rx)
}

/// Queue of input for the pty writer thread
///
/// Queuing never blocks. A failed write is reported through [`PtyInput::failed`]
/// and ends the writer thread.
pub struct PtyInput {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    pending: Arc<AtomicUsize>,
    errors: mpsc::Receiver<PtyError>,
}

impl PtyInput {
    /// Queue `data` for the pty
    pub fn send(&self, data: Vec<u8>) -> Result<(), RelayError> {
        let len = data.len();
        let pending = self.pending.fetch_add(len, Ordering::SeqCst) + len;
        if pending > MAX_PENDING_INPUT {
            self.pending.fetch_sub(len, Ordering::SeqCst);
            return Err(RelayError::InputBacklog(MAX_PENDING_INPUT));
        }

        self.tx
            .send(data)
            .map_err(|_| RelayError::PtyWrite(PtyError::Closed))
    }

    /// Wait for the writer thread to report a failed write
    ///
    /// Cancel safe. Never completes if the writer exits without a failure.
    pub async fn failed(&mut self) -> PtyError {
        match self.errors.recv().await {
            Some(e) => e,
            None => std::future::pending().await,
        }
    }

    /// Bytes queued but not yet handed to the pty
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

/// Start the connection → pty writer on a dedicated thread
///
/// The thread exits once the returned [`PtyInput`] is dropped or a write
/// fails, closing its end of the pty.
pub fn spawn_pty_writer(mut writer: Box<dyn Write + Send>) -> io::Result<PtyInput> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (error_tx, errors) = mpsc::channel(1);
    let pending = Arc::new(AtomicUsize::new(0));
    let queued = Arc::clone(&pending);

    std::thread::Builder::new()
        .name("pty-writer".to_string())
        .spawn(move || {
            while let Some(data) = rx.blocking_recv() {
                queued.fetch_sub(data.len(), Ordering::SeqCst);
                let result = writer.write_all(&data).and_then(|_| writer.flush());
                if let Err(e) = result {
                    let _ = error_tx.blocking_send(PtyError::WriteFailed(e.to_string()));
                    return;
                }
                trace!("Wrote {} bytes to PTY", data.len());
            }
            debug!("PTY writer finished");
        })?;

    Ok(PtyInput {
        tx,
        pending,
        errors,
    })
}

/// Start the connection → pty relay as a task
pub fn spawn_inbound<S>(mut stream: S) -> (mpsc::Receiver<RelayEvent<Vec<u8>>>, JoinHandle<()>)
where
    S: Stream<Item = Result<Message, WsError>> + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(RELAY_CHANNEL_CAPACITY);

    let handle = tokio::spawn(async move {
        let reason = loop {
            let message = match stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => break RelayError::ConnectionRead(e),
                None => break RelayError::ConnectionClosed,
            };

            match classify(message) {
                Ok(Some(input)) => {
                    if tx.send(RelayEvent::Data(input)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => {}
                Err(reason) => break reason,
            }
        };

        let _ = tx.send(RelayEvent::Stopped(reason)).await;
    });

    (rx, handle)
}

/// Decide what an inbound message means for the pty
///
/// Text payloads are pty input, pings and pongs are the transport's business,
/// a close ends the session and anything else is a protocol violation.
fn classify(message: Message) -> Result<Option<Vec<u8>>, RelayError> {
    match message {
        Message::Text(text) => Ok(Some(text.into_bytes())),
        Message::Ping(_) | Message::Pong(_) => Ok(None),
        Message::Close(_) => Err(RelayError::ConnectionClosed),
        Message::Binary(_) => Err(RelayError::ProtocolViolation("binary")),
        Message::Frame(_) => Err(RelayError::ProtocolViolation("raw frame")),
    }
}

/// Incremental UTF-8 decoder for chunked pty output
///
/// A sequence split across two reads is held back until the rest arrives;
/// bytes that can never form valid UTF-8 become U+FFFD.
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        let mut text = String::with_capacity(self.pending.len());
        let mut start = 0;

        while start < self.pending.len() {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(valid) => {
                    text.push_str(valid);
                    start = self.pending.len();
                }
                Err(e) => {
                    let end = start + e.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&self.pending[start..end]));
                    match e.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            start = end + len;
                        }
                        None => {
                            start = end;
                            break;
                        }
                    }
                }
            }
        }

        self.pending.drain(..start);
        text
    }

    fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::io::Cursor;
    use std::time::Duration;
    use tokio::time::timeout;

    /// Reader that hands out its chunks one read at a time, then fails
    struct ChunkedReader {
        chunks: Vec<Vec<u8>>,
    }

    impl Read for ChunkedReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.chunks.is_empty() {
                return Err(io::Error::other("EIO"));
            }
            let chunk = self.chunks.remove(0);
            buf[..chunk.len()].copy_from_slice(&chunk);
            Ok(chunk.len())
        }
    }

    async fn collect<T>(mut rx: mpsc::Receiver<RelayEvent<T>>) -> (Vec<T>, RelayError) {
        let mut data = Vec::new();
        loop {
            match timeout(Duration::from_secs(5), rx.recv()).await.unwrap() {
                Some(RelayEvent::Data(item)) => data.push(item),
                Some(RelayEvent::Stopped(reason)) => return (data, reason),
                None => panic!("relay exited without stopping"),
            }
        }
    }

    #[test]
    fn test_decoder_plain_ascii() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(b"hello"), "hello");
        assert!(!decoder.has_pending());
    }

    #[test]
    fn test_decoder_split_sequence() {
        let snowman = "☃".as_bytes();
        let mut decoder = Utf8Decoder::default();

        assert_eq!(decoder.decode(&[b'a', snowman[0]]), "a");
        assert!(decoder.has_pending());
        assert_eq!(decoder.decode(&snowman[1..]), "☃");
        assert!(!decoder.has_pending());
    }

    #[test]
    fn test_decoder_invalid_bytes() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(b"a\xffb"), "a\u{FFFD}b");
        assert!(!decoder.has_pending());
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            classify(Message::Text("ls\n".to_string())).unwrap(),
            Some(b"ls\n".to_vec())
        );
        assert_eq!(classify(Message::Ping(vec![1])).unwrap(), None);
        assert!(matches!(
            classify(Message::Binary(vec![1, 2])),
            Err(RelayError::ProtocolViolation("binary"))
        ));
        assert!(matches!(
            classify(Message::Close(None)),
            Err(RelayError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_outbound_one_event_per_read() {
        let reader = ChunkedReader {
            chunks: vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()],
        };
        let rx = spawn_outbound(Box::new(reader), 512).unwrap();

        let (data, reason) = collect(rx).await;
        assert_eq!(data, vec!["first", "second", "third"]);
        assert!(matches!(reason, RelayError::PtyRead(_)));
    }

    #[tokio::test]
    async fn test_outbound_trims_to_read_length() {
        let reader = Cursor::new(vec![b'x'; 700]);
        let rx = spawn_outbound(Box::new(reader), 512).unwrap();

        let (data, reason) = collect(rx).await;
        assert_eq!(data.len(), 2);
        assert_eq!(data[0].len(), 512);
        assert_eq!(data[1].len(), 188);
        assert!(data[1].bytes().all(|b| b == b'x'));
        assert!(matches!(reason, RelayError::PtyClosed));
    }

    /// Writer that records everything into a shared buffer
    #[derive(Clone, Default)]
    struct SharedWriter(Arc<std::sync::Mutex<Vec<u8>>>);

    impl Write for SharedWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Writer whose every write fails
    struct BrokenWriter;

    impl Write for BrokenWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::other("EIO"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Writer that blocks until its release channel is dropped
    struct StalledWriter(std::sync::mpsc::Receiver<()>);

    impl Write for StalledWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            let _ = self.0.recv();
            Err(io::Error::other("released"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_pty_writer_writes_in_order() {
        let written = SharedWriter::default();
        let input = spawn_pty_writer(Box::new(written.clone())).unwrap();

        input.send(b"echo 1\n".to_vec()).unwrap();
        input.send(b"echo 2\n".to_vec()).unwrap();
        drop(input);

        timeout(Duration::from_secs(5), async {
            while written.0.lock().unwrap().len() < 14 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(written.0.lock().unwrap().as_slice(), b"echo 1\necho 2\n");
    }

    #[tokio::test]
    async fn test_pty_writer_reports_failure() {
        let mut input = spawn_pty_writer(Box::new(BrokenWriter)).unwrap();
        input.send(b"x".to_vec()).unwrap();

        let error = timeout(Duration::from_secs(5), input.failed()).await.unwrap();
        assert!(matches!(error, PtyError::WriteFailed(_)));
    }

    #[tokio::test]
    async fn test_pty_writer_stalled_does_not_block_sender() {
        let (release, stalled) = std::sync::mpsc::channel();
        let input = spawn_pty_writer(Box::new(StalledWriter(stalled))).unwrap();

        for _ in 0..512 {
            input.send(vec![b'a'; 1024]).unwrap();
        }
        assert!(input.pending() >= 511 * 1024);

        let overflow = input.send(vec![b'a'; MAX_PENDING_INPUT]);
        assert!(matches!(overflow, Err(RelayError::InputBacklog(_))));
        drop(release);
    }

    #[tokio::test]
    async fn test_inbound_forwards_text_in_order() {
        let messages: Vec<Result<Message, WsError>> = vec![
            Ok(Message::Text("echo 1\n".to_string())),
            Ok(Message::Pong(vec![])),
            Ok(Message::Text("echo 2\n".to_string())),
        ];
        let (rx, handle) = spawn_inbound(stream::iter(messages));

        let (data, reason) = collect(rx).await;
        assert_eq!(data, vec![b"echo 1\n".to_vec(), b"echo 2\n".to_vec()]);
        assert!(matches!(reason, RelayError::ConnectionClosed));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_inbound_stops_on_binary() {
        let messages: Vec<Result<Message, WsError>> = vec![
            Ok(Message::Text("a".to_string())),
            Ok(Message::Binary(vec![0xde, 0xad])),
            Ok(Message::Text("never forwarded".to_string())),
        ];
        let (rx, handle) = spawn_inbound(stream::iter(messages));

        let (data, reason) = collect(rx).await;
        assert_eq!(data, vec![b"a".to_vec()]);
        assert!(matches!(reason, RelayError::ProtocolViolation("binary")));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_inbound_reports_read_error() {
        let messages: Vec<Result<Message, WsError>> = vec![Err(WsError::ConnectionClosed)];
        let (rx, _handle) = spawn_inbound(stream::iter(messages));

        let (data, reason) = collect(rx).await;
        assert!(data.is_empty());
        assert!(matches!(reason, RelayError::ConnectionRead(_)));
    }
}
