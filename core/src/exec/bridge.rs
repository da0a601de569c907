//! Byte copies between WebSocket connections and file descriptors.
//!
//! Each primitive spawns its own tasks and hands back a oneshot receiver
//! that fires once when that direction has fully completed. Descriptor
//! reads and writes run on blocking threads; a bounded channel between
//! the blocking side and the socket side preserves byte order within a
//! direction. I/O errors end the affected direction and are logged at
//! debug; they never tear down the session from in here.

use std::io;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use futures::SinkExt;
use futures::StreamExt;
use futures::stream::SplitSink;
use futures::stream::SplitStream;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::ReadBuf;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

/// Transport bound for attach connections: UNIX socket, TCP, or an
/// in-memory duplex in tests.
pub trait AttachIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AttachIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Concrete stream over a boxed transport. `WebSocketStream` wants a
/// type implementing the tokio IO traits directly, so the boxed trait
/// object stays an implementation detail behind these forwarders.
pub struct AttachStream {
    inner: Box<dyn AttachIo>,
}

impl AttachStream {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            inner: Box::new(stream),
        }
    }
}

impl AsyncRead for AttachStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for AttachStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_shutdown(cx)
    }
}

pub type WsConn = WebSocketStream<AttachStream>;

const READ_CHUNK_SIZE: usize = 8_192;

/// Matches the channel size the websocket transport uses elsewhere in
/// the daemon.
const CHANNEL_CAPACITY: usize = 128;

/// How long a blocking loop sleeps after `WouldBlock` on a non-blocking
/// descriptor before polling again.
const NONBLOCKING_RETRY: Duration = Duration::from_millis(5);

/// Copies binary frames from `ws` into `dst` until the peer closes,
/// errors out, or sends a zero-length payload (logical EOF for stdin).
///
/// `dst` is dropped once the direction completes; for a pipe write end
/// that close is what delivers EOF to the child's stdin.
pub(crate) fn recv_stream<W>(
    dst: W,
    mut ws: SplitStream<WsConn>,
) -> (oneshot::Receiver<()>, AbortHandle)
where
    W: Write + Send + 'static,
{
    let (done_tx, done_rx) = oneshot::channel();
    let (chunk_tx, chunk_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_CAPACITY);
    let writer = tokio::task::spawn_blocking(move || write_chunks(dst, chunk_rx));

    let handle = tokio::spawn(async move {
        while let Some(message) = ws.next().await {
            match message {
                Ok(Message::Binary(payload)) => {
                    if payload.is_empty() {
                        break;
                    }
                    if chunk_tx.send(payload.to_vec()).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    debug!("websocket receive error: {err}");
                    break;
                }
            }
        }
        drop(chunk_tx);
        let _ = writer.await;
        let _ = done_tx.send(());
    });

    (done_rx, handle.abort_handle())
}

/// Streams chunks read from `src` as binary frames on `ws`, then sends a
/// close frame once `src` reaches EOF or fails.
///
/// `stop` makes the reader give up at its next poll; it is used for
/// descriptors shared with the opposite direction (PTY masters), which
/// the caller must have switched to non-blocking mode.
pub(crate) fn send_stream<R>(
    mut ws: SplitSink<WsConn, Message>,
    src: R,
    stop: Option<Arc<AtomicBool>>,
) -> oneshot::Receiver<()>
where
    R: Read + Send + 'static,
{
    let (done_tx, done_rx) = oneshot::channel();
    let (chunk_tx, mut chunk_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_CAPACITY);
    tokio::task::spawn_blocking(move || read_chunks(src, chunk_tx, stop));

    tokio::spawn(async move {
        while let Some(chunk) = chunk_rx.recv().await {
            if let Err(err) = ws.send(Message::Binary(chunk.into())).await {
                debug!("websocket send error: {err}");
                break;
            }
        }
        if let Err(err) = ws.send(Message::Close(None)).await {
            debug!("websocket close error: {err}");
        }
        let _ = done_tx.send(());
    });

    done_rx
}

pub(crate) struct MirrorHandles {
    pub send_done: oneshot::Receiver<()>,
    pub recv_abort: AbortHandle,
}

/// Runs both directions over a single PTY master: frames from the socket
/// are written through `write_half`, bytes read from `read_half` are
/// framed back out.
///
/// When the socket side ends, the reader is stopped as well, so that
/// every master descriptor closes and the subordinate side observes
/// EOF/HUP. The caller must have switched the master to non-blocking
/// mode. `write_half` is typically an `Arc<File>` shared with a weak
/// resize handle; the master closes when both halves have let go.
pub(crate) fn mirror<R, W>(ws: WsConn, read_half: R, write_half: W) -> MirrorHandles
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    let stop = Arc::new(AtomicBool::new(false));
    let (sink, stream) = ws.split();

    let send_done = send_stream(sink, read_half, Some(Arc::clone(&stop)));
    let (recv_done, recv_abort) = recv_stream(write_half, stream);

    tokio::spawn(async move {
        let _ = recv_done.await;
        stop.store(true, Ordering::Release);
    });

    MirrorHandles {
        send_done,
        recv_abort,
    }
}

fn write_chunks<W: Write>(mut dst: W, mut chunk_rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(chunk) = chunk_rx.blocking_recv() {
        if let Err(err) = write_all_retrying(&mut dst, &chunk) {
            debug!("descriptor write error: {err}");
            break;
        }
    }
}

fn write_all_retrying<W: Write>(dst: &mut W, mut buf: &[u8]) -> std::io::Result<()> {
    while !buf.is_empty() {
        match dst.write(buf) {
            Ok(0) => return Err(ErrorKind::WriteZero.into()),
            Ok(n) => buf = &buf[n..],
            Err(ref err) if err.kind() == ErrorKind::Interrupted => {}
            Err(ref err) if err.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(NONBLOCKING_RETRY);
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

fn read_chunks<R: Read>(mut src: R, chunk_tx: mpsc::Sender<Vec<u8>>, stop: Option<Arc<AtomicBool>>) {
    let mut buf = [0u8; READ_CHUNK_SIZE];
    loop {
        if let Some(stop) = &stop {
            if stop.load(Ordering::Acquire) {
                break;
            }
        }
        match src.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if chunk_tx.blocking_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(ref err) if err.kind() == ErrorKind::Interrupted => {}
            Err(ref err) if err.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(NONBLOCKING_RETRY);
            }
            Err(err) => {
                debug!("descriptor read error: {err}");
                break;
            }
        }
    }
}
