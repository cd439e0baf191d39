//! Client side of a fileserver connection.
//!
//! A [`Connection`] owns two background tasks: a writer draining the
//! outbound queues into the framed stream and a reader routing inbound
//! envelopes to the [`Call`] they belong to. Calls are registered before
//! their `Open` is sent so no reply can arrive for an unknown id.
//!
//! `Open` and `Cancel` travel on an unbounded control queue that the writer
//! always serves first. A call's data is only queued after its `Open`, and
//! a `Cancel` can never be refused by a full data queue.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use protocol::messages::{CallId, Envelope, Message};
use protocol::{inbound, CallKind, CallReceiver, CallSender, EnvelopeCodec, ProtocolError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument, Span};

/// Capacity of the queue feeding the connection writer.
const OUTBOUND_DEPTH: usize = 64;

/// Routing table shared by the reader task and the calls.
#[derive(Default)]
struct Routes {
    calls: HashMap<CallId, mpsc::Sender<Message>>,
    closed: bool,
}

type SharedRoutes = Arc<Mutex<Routes>>;

fn lock(routes: &SharedRoutes) -> MutexGuard<'_, Routes> {
    routes.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A multiplexed connection to a fileserver.
///
/// Dropping the connection stops its reader; calls still open on it then
/// fail with a closed connection.
pub struct Connection {
    out_tx: mpsc::Sender<Envelope>,
    control: mpsc::UnboundedSender<Envelope>,
    routes: SharedRoutes,
    next_id: AtomicU64,
    stop: CancellationToken,
}

impl Connection {
    /// Connect to `addr`, giving up after `timeout`.
    pub async fn connect(addr: &str, timeout: Duration, span: Span) -> io::Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connection timed out"))??;
        stream.set_nodelay(true)?;
        debug!(parent: &span, addr, "Connected");
        Ok(Self::new(stream, span))
    }

    /// Run the connection over an established stream.
    pub fn new<T>(stream: T, span: Span) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_DEPTH);
        let (control, control_rx) = mpsc::unbounded_channel();
        let routes = SharedRoutes::default();
        let stop = CancellationToken::new();

        tokio::spawn(
            write_frames(
                FramedWrite::new(write_half, EnvelopeCodec::new()),
                control_rx,
                out_rx,
            )
            .instrument(span.clone()),
        );
        tokio::spawn(
            read_frames(
                FramedRead::new(read_half, EnvelopeCodec::new()),
                routes.clone(),
                stop.clone(),
            )
            .instrument(span),
        );

        Self {
            out_tx,
            control,
            routes,
            next_id: AtomicU64::new(1),
            stop,
        }
    }

    /// Open a new call.
    pub async fn open(&self, kind: CallKind) -> protocol::Result<Call> {
        let call_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (route, receiver) = inbound();
        {
            let mut routes = lock(&self.routes);
            if routes.closed {
                return Err(ProtocolError::ConnectionClosed(
                    "connection is closed".to_string(),
                ));
            }
            routes.calls.insert(call_id, route);
        }

        let mut call = Call {
            sender: CallSender::new(call_id, self.out_tx.clone(), CancellationToken::new()),
            receiver,
            control: self.control.clone(),
            routes: self.routes.clone(),
            opened: false,
        };

        debug!(call_id, kind = kind.name(), "Opening call");
        self.control
            .send(Envelope::new(call_id, Message::Open(kind)))
            .map_err(|_| ProtocolError::ConnectionClosed("writer stopped".to_string()))?;

        call.opened = true;
        Ok(call)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// One open call.
///
/// Dropping a call that has not seen its terminal message cancels it on the
/// server.
pub struct Call {
    sender: CallSender,
    receiver: CallReceiver,
    control: mpsc::UnboundedSender<Envelope>,
    routes: SharedRoutes,
    opened: bool,
}

impl Call {
    /// Id of this call on its connection.
    pub fn id(&self) -> CallId {
        self.sender.call_id()
    }

    /// Sending half of the call.
    pub fn sender(&self) -> &CallSender {
        &self.sender
    }

    /// Receive the next message from the server.
    ///
    /// See [`CallReceiver::recv`].
    pub async fn recv(&mut self) -> protocol::Result<Option<Message>> {
        self.receiver.recv().await
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        let call_id = self.sender.call_id();
        lock(&self.routes).calls.remove(&call_id);
        self.sender.cancellation().cancel();

        if self.opened && !self.receiver.is_finished() {
            debug!(call_id, "Cancelling unfinished call");
            if self
                .control
                .send(Envelope::new(call_id, Message::cancel()))
                .is_err()
            {
                debug!(call_id, "Writer stopped before cancel");
            }
        }
    }
}

async fn write_frames<W>(
    mut sink: FramedWrite<W, EnvelopeCodec>,
    mut control_rx: mpsc::UnboundedReceiver<Envelope>,
    mut out_rx: mpsc::Receiver<Envelope>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let envelope = tokio::select! {
            biased;
            Some(envelope) = control_rx.recv() => envelope,
            Some(envelope) = out_rx.recv() => envelope,
            else => break,
        };
        if let Err(e) = sink.send(envelope).await {
            warn!(error = %e, "Error writing to server");
            return;
        }
    }
    if let Err(e) = sink.close().await {
        debug!(error = %e, "Error closing connection");
    }
}

async fn read_frames<R>(
    mut frames: FramedRead<R, EnvelopeCodec>,
    routes: SharedRoutes,
    stop: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let envelope = tokio::select! {
            _ = stop.cancelled() => break,
            frame = frames.next() => match frame {
                Some(Ok(envelope)) => envelope,
                Some(Err(e)) => {
                    warn!(error = %e, "Closing connection after bad frame");
                    break;
                }
                None => {
                    debug!("Server closed connection");
                    break;
                }
            },
        };

        let call_id = envelope.call_id;
        let terminal = matches!(
            envelope.payload,
            Message::End(_) | Message::Error(_) | Message::Cancel(_)
        );
        let route = {
            let mut routes = lock(&routes);
            if terminal {
                routes.calls.remove(&call_id)
            } else {
                routes.calls.get(&call_id).cloned()
            }
        };
        let Some(route) = route else {
            debug!(call_id, kind = envelope.payload.kind(), "Message for unknown call");
            continue;
        };
        if route.send(envelope.payload).await.is_err() {
            debug!(call_id, "Call is no longer reading");
        }
    }

    let mut routes = lock(&routes);
    routes.closed = true;
    routes.calls.clear();
}
