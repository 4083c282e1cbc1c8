//! Switchable reader and peer-disconnect detection.
//!
//! The serving loop always reads through a `SwitchReader`. Asking for a
//! close notification swaps the live source for the read end of an in-memory
//! pipe and moves the original source into a copy task:
//!
//! ```text
//! before:  BufReader → SwitchReader → socket
//! after:   BufReader → SwitchReader → PipeReader ◀── copy task ◀── socket
//!                                                       │
//!                                                       └─ on EOF/error/close:
//!                                                          fire PeerGone once
//! ```
//!
//! Bytes already sitting in the `BufReader` stay where they are, and the
//! pipe forwards both data and the terminal error, so the loop observes the
//! same stream it would have seen without the swap.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll, Waker};

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::{mpsc, watch};

/// Boxed read source.
pub type DynReader = Box<dyn AsyncRead + Send + Unpin>;

/// Chunks in flight between the copy task and the pipe reader.
const PIPE_CAPACITY: usize = 16;

const COPY_CHUNK: usize = 8 * 1024;

struct SwitchState {
    reader: DynReader,
    /// Waker of the last pending read, so a switch can re-poll it.
    waker: Option<Waker>,
}

/// A reader whose source can be replaced while reads are in progress.
#[derive(Clone)]
pub struct SwitchReader {
    state: Arc<Mutex<SwitchState>>,
}

impl SwitchReader {
    pub fn new(reader: DynReader) -> Self {
        Self {
            state: Arc::new(Mutex::new(SwitchState { reader, waker: None })),
        }
    }

    /// Install `reader` as the live source and return the previous one.
    ///
    /// A read parked on the old source is woken so it polls the new one.
    pub fn switch(&self, reader: DynReader) -> DynReader {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = std::mem::replace(&mut state.reader, reader);
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
        previous
    }
}

impl AsyncRead for SwitchReader {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match Pin::new(&mut state.reader).poll_read(cx, buf) {
            Poll::Pending => {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
            ready => {
                state.waker = None;
                ready
            }
        }
    }
}

/// Read end of the in-memory pipe.
pub struct PipeReader {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    chunk: Bytes,
}

/// Write end of the in-memory pipe. Dropping it is EOF for the reader.
pub struct PipeWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

/// Create a connected pipe.
pub fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(PIPE_CAPACITY);
    (
        PipeWriter { tx },
        PipeReader {
            rx,
            chunk: Bytes::new(),
        },
    )
}

impl PipeWriter {
    /// Forward a chunk. Fails when the reader is gone.
    pub async fn send(&self, chunk: Bytes) -> io::Result<()> {
        self.tx
            .send(Ok(chunk))
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }

    /// Close the pipe with `error`; the reader sees it after draining data.
    pub async fn close_with_error(self, error: io::Error) {
        let _ = self.tx.send(Err(error)).await;
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        loop {
            if !self.chunk.is_empty() {
                let n = self.chunk.len().min(buf.remaining());
                buf.put_slice(&self.chunk[..n]);
                self.chunk.advance(n);
                return Poll::Ready(Ok(()));
            }
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(Ok(chunk))) => self.chunk = chunk,
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e)),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Copy `source` into `pipe` until EOF, a read error, or local close.
async fn copy_into_pipe(mut source: DynReader, pipe: PipeWriter, mut closed: watch::Receiver<bool>) {
    loop {
        let mut buf = BytesMut::with_capacity(COPY_CHUNK);
        tokio::select! {
            res = source.read_buf(&mut buf) => match res {
                Ok(0) => return,
                Ok(_) => {
                    if pipe.send(buf.freeze()).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    pipe.close_with_error(e).await;
                    return;
                }
            },
            _ = wait_closed(&mut closed) => return,
        }
    }
}

/// Resolve once the local close signal is set or its sender is dropped.
pub(crate) async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

struct NotifyState {
    /// Present once detection has started.
    tx: Option<watch::Sender<bool>>,
    /// Latch: the notification has fired.
    gone: bool,
}

/// Per-connection peer-disconnect detector.
pub struct CloseNotifier {
    state: Arc<Mutex<NotifyState>>,
    switch: SwitchReader,
    closed: watch::Receiver<bool>,
}

impl CloseNotifier {
    /// `closed` is the connection's local close signal.
    pub fn new(switch: SwitchReader, closed: watch::Receiver<bool>) -> Self {
        Self {
            state: Arc::new(Mutex::new(NotifyState { tx: None, gone: false })),
            switch,
            closed,
        }
    }

    /// Subscribe to the peer-gone notification, starting detection on the
    /// first call. Must be called from within a tokio runtime.
    pub fn subscribe(&self) -> PeerGone {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = state.tx.get_or_insert_with(|| {
            let (writer, reader) = pipe();
            let source = self.switch.switch(Box::new(reader));
            let closed = self.closed.clone();
            let notify = Arc::clone(&self.state);
            // Holding the state lock here keeps `fire` from running before
            // the sender is installed.
            tokio::spawn(async move {
                copy_into_pipe(source, writer, closed).await;
                fire(&notify);
            });
            watch::channel(false).0
        });
        PeerGone { rx: tx.subscribe() }
    }

    /// Fire the notification if detection is running. Safe to call
    /// repeatedly and concurrently; only the first call has an effect.
    pub fn notify_gone(&self) {
        fire(&self.state);
    }

    /// True once the notification has fired.
    pub fn is_gone(&self) -> bool {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).gone
    }
}

fn fire(state: &Mutex<NotifyState>) {
    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
    if state.gone {
        return;
    }
    if let Some(tx) = &state.tx {
        tx.send_replace(true);
        state.gone = true;
        tracing::trace!("Peer gone notification fired");
    }
}

/// Handle that resolves when the peer has gone away.
#[derive(Debug, Clone)]
pub struct PeerGone {
    rx: watch::Receiver<bool>,
}

impl PeerGone {
    /// Wait for the notification. Also returns if the connection was dropped.
    pub async fn notified(&mut self) {
        let _ = self.rx.wait_for(|gone| *gone).await;
    }

    /// Non-blocking check.
    pub fn is_gone(&self) -> bool {
        *self.rx.borrow()
    }

    /// True if the notification changed since last observed.
    pub fn has_changed(&self) -> bool {
        self.rx.has_changed().unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn pipe_forwards_data_then_eof() {
        let (writer, mut reader) = pipe();
        tokio::spawn(async move {
            writer.send(Bytes::from_static(b"hello ")).await.unwrap();
            writer.send(Bytes::from_static(b"world")).await.unwrap();
        });
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn pipe_forwards_error() {
        let (writer, mut reader) = pipe();
        writer.close_with_error(io::ErrorKind::ConnectionReset.into()).await;
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn switch_preserves_buffered_and_pending_bytes() {
        let (mut peer, local) = tokio::io::duplex(64);
        let switch = SwitchReader::new(Box::new(local));
        let (_closed_tx, closed_rx) = watch::channel(false);
        let notifier = CloseNotifier::new(switch.clone(), closed_rx);
        let mut reader = BufReader::new(switch);

        peer.write_all(b"abc").await.unwrap();
        let mut first = [0u8; 1];
        reader.read_exact(&mut first).await.unwrap();
        assert_eq!(&first, b"a");

        let gone = notifier.subscribe();
        assert!(!gone.is_gone());

        peer.write_all(b"defgh").await.unwrap();
        drop(peer);

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"bcdefgh");
    }

    #[tokio::test]
    async fn read_parked_before_switch_is_woken() {
        let (mut peer, local) = tokio::io::duplex(64);
        let switch = SwitchReader::new(Box::new(local));
        let (_closed_tx, closed_rx) = watch::channel(false);
        let notifier = CloseNotifier::new(switch.clone(), closed_rx);

        let read = tokio::spawn(async move {
            let mut reader = BufReader::new(switch);
            let mut buf = [0u8; 4];
            reader.read_exact(&mut buf).await.map(|_| buf)
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let _gone = notifier.subscribe();
        peer.write_all(b"ping").await.unwrap();

        let buf = tokio::time::timeout(Duration::from_secs(2), read)
            .await
            .expect("read should complete")
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn fires_once_on_peer_eof() {
        let (peer, local) = tokio::io::duplex(64);
        let switch = SwitchReader::new(Box::new(local));
        let (_closed_tx, closed_rx) = watch::channel(false);
        let notifier = CloseNotifier::new(switch, closed_rx);

        let mut gone = notifier.subscribe();
        assert!(!notifier.is_gone());

        drop(peer);
        tokio::time::timeout(Duration::from_secs(2), gone.notified()).await.unwrap();
        assert!(gone.is_gone());
        assert!(notifier.is_gone());
    }

    #[tokio::test]
    async fn does_not_fire_while_stream_is_live() {
        let (mut peer, local) = tokio::io::duplex(64);
        let switch = SwitchReader::new(Box::new(local));
        let (_closed_tx, closed_rx) = watch::channel(false);
        let notifier = CloseNotifier::new(switch.clone(), closed_rx);
        let mut reader = BufReader::new(switch);

        let gone = notifier.subscribe();
        for _ in 0..5 {
            peer.write_all(b"x").await.unwrap();
            let mut b = [0u8; 1];
            reader.read_exact(&mut b).await.unwrap();
        }
        assert!(!gone.is_gone());
        assert!(!notifier.is_gone());
    }

    #[tokio::test]
    async fn concurrent_notify_fires_exactly_once() {
        let (_peer, local) = tokio::io::duplex(64);
        let switch = SwitchReader::new(Box::new(local));
        let (_closed_tx, closed_rx) = watch::channel(false);
        let notifier = Arc::new(CloseNotifier::new(switch, closed_rx));

        let mut gone = notifier.subscribe();
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let n = Arc::clone(&notifier);
            tasks.push(tokio::spawn(async move { n.notify_gone() }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        gone.notified().await;
        gone.rx.borrow_and_update();
        notifier.notify_gone();
        assert!(!gone.has_changed());
        assert!(notifier.is_gone());
    }

    #[tokio::test]
    async fn notify_before_subscribe_is_noop() {
        let (_peer, local) = tokio::io::duplex(64);
        let (_closed_tx, closed_rx) = watch::channel(false);
        let notifier = CloseNotifier::new(SwitchReader::new(Box::new(local)), closed_rx);
        notifier.notify_gone();
        assert!(!notifier.is_gone());
    }

    #[tokio::test]
    async fn local_close_fires_notification() {
        let (_peer, local) = tokio::io::duplex(64);
        let (closed_tx, closed_rx) = watch::channel(false);
        let notifier = CloseNotifier::new(SwitchReader::new(Box::new(local)), closed_rx);

        let mut gone = notifier.subscribe();
        closed_tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(2), gone.notified()).await.unwrap();
        assert!(notifier.is_gone());
    }
}
