//! Per-connection driver.
//!
//! One driver task owns each accepted connection. It reads envelopes from
//! the peer, opens a task per call, routes follow-up messages to the call
//! they belong to and writes everything the calls produce back to the peer.
//! The call table lives on the driver task only.
//!
//! # Lifecycle
//!
//! - The peer must send its first frame within the connect timeout. A
//!   shutdown during that wait closes the connection right away.
//! - Peer EOF or a bad frame cancels every open call.
//! - On shutdown new calls are refused with `Unavailable` while open calls
//!   run to completion; the driver exits once none are left.
//!
//! A call whose inbound queue is full pauses reading from the peer until it
//! takes the message. Outbound frames keep flowing meanwhile.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use protocol::messages::{CallId, Envelope, ErrorCode, ErrorMessage, Message};
use protocol::{inbound, CallKind, CallSender, EnvelopeCodec, ProtocolError};
use storage::FileStore;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::{Id as TaskId, JoinError, JoinSet};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument, Span};

use crate::router::CallRouter;

/// Capacity of the queue feeding the connection writer.
const OUTBOUND_DEPTH: usize = 64;

/// Delivery of a message to a call whose queue was full.
type PendingRoute = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Outcome of handling one inbound envelope.
enum Routed {
    Done,
    /// Write this straight back to the peer.
    Reply(Envelope),
    /// Stop reading until this delivery completes.
    Blocked(PendingRoute),
}

/// A call that is still running.
struct ActiveCall {
    inbound: mpsc::Sender<Message>,
    cancel: CancellationToken,
}

/// Drives one client connection.
pub struct Connection<S> {
    router: CallRouter<S>,
    peer: SocketAddr,
    connect_timeout: Duration,
    shutdown: CancellationToken,
    span: Span,
}

impl<S: FileStore> Connection<S> {
    /// Create a driver for a connection from `peer`.
    ///
    /// `shutdown` switches the connection into draining mode.
    pub fn new(
        router: CallRouter<S>,
        peer: SocketAddr,
        connect_timeout: Duration,
        shutdown: CancellationToken,
        span: Span,
    ) -> Self {
        Self {
            router,
            peer,
            connect_timeout,
            shutdown,
            span,
        }
    }

    /// Serve the connection until the peer leaves or shutdown drains it.
    pub async fn run<T>(self, stream: T) -> protocol::Result<()>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let span = self.span.clone();
        self.drive(stream).instrument(span).await
    }

    async fn drive<T>(self, stream: T) -> protocol::Result<()>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut frames = FramedRead::new(read_half, EnvelopeCodec::new());
        let mut sink = FramedWrite::new(write_half, EnvelopeCodec::new());
        let (out_tx, mut out_rx) = mpsc::channel(OUTBOUND_DEPTH);

        let mut table = CallTable {
            router: self.router,
            peer: self.peer,
            out_tx,
            calls: HashMap::new(),
            tasks: JoinSet::new(),
            task_calls: HashMap::new(),
            aborted: CancellationToken::new(),
            draining: false,
        };

        let first = tokio::select! {
            _ = self.shutdown.cancelled() => {
                debug!("Shutting down before the first request");
                return Ok(());
            }
            first = tokio::time::timeout(self.connect_timeout, frames.next()) => match first {
                Err(_) => {
                    warn!(timeout = ?self.connect_timeout, "No request within connect timeout");
                    return Err(ProtocolError::Timeout(
                        "no request within connect timeout".to_string(),
                    ));
                }
                Ok(None) => {
                    debug!("Peer closed connection before sending a request");
                    return Ok(());
                }
                Ok(Some(frame)) => frame?,
            },
        };

        let mut pending: Option<PendingRoute> = None;
        match table.on_envelope(first) {
            Routed::Done => {}
            Routed::Reply(reply) => sink.send(reply).await?,
            Routed::Blocked(route) => pending = Some(route),
        }

        let mut reading = true;
        let mut outcome = Ok(());
        loop {
            tokio::select! {
                frame = frames.next(), if reading && pending.is_none() => match frame {
                    Some(Ok(envelope)) => match table.on_envelope(envelope) {
                        Routed::Done => {}
                        Routed::Reply(reply) => sink.send(reply).await?,
                        Routed::Blocked(route) => pending = Some(route),
                    },
                    Some(Err(e)) => {
                        warn!(error = %e, "Closing connection after bad frame");
                        table.abort_all();
                        reading = false;
                        outcome = Err(e);
                    }
                    None => {
                        debug!("Peer closed connection");
                        table.abort_all();
                        reading = false;
                    }
                },
                _ = async {
                    if let Some(route) = pending.as_mut() {
                        route.await;
                    }
                }, if pending.is_some() => {
                    pending = None;
                }
                Some(envelope) = out_rx.recv() => {
                    if let Err(e) = sink.send(envelope).await {
                        warn!(error = %e, "Error writing to peer");
                        table.abort_all();
                        return Err(e);
                    }
                }
                Some(joined) = table.tasks.join_next_with_id() => {
                    if let Some(reply) = table.on_call_finished(joined) {
                        sink.send(reply).await?;
                    }
                }
                _ = self.shutdown.cancelled(), if !table.draining => {
                    info!(open_calls = table.calls.len(), "Draining connection");
                    table.draining = true;
                }
                else => break,
            }

            if (!reading || table.draining) && table.tasks.is_empty() {
                break;
            }
        }

        drop(pending);
        drop(table);
        while let Ok(envelope) = out_rx.try_recv() {
            sink.feed(envelope).await?;
        }
        sink.close().await?;

        debug!("Connection closed");
        outcome
    }
}

/// Calls of one connection, owned by its driver task.
struct CallTable<S> {
    router: CallRouter<S>,
    peer: SocketAddr,
    out_tx: mpsc::Sender<Envelope>,
    calls: HashMap<CallId, ActiveCall>,
    tasks: JoinSet<CallId>,
    task_calls: HashMap<TaskId, CallId>,
    aborted: CancellationToken,
    draining: bool,
}

impl<S: FileStore> CallTable<S> {
    /// Handle one inbound envelope.
    fn on_envelope(&mut self, envelope: Envelope) -> Routed {
        let call_id = envelope.call_id;
        match envelope.payload {
            Message::Open(kind) => match self.open(call_id, kind) {
                Some(reply) => Routed::Reply(reply),
                None => Routed::Done,
            },
            Message::Cancel(_) => {
                if let Some(call) = self.calls.remove(&call_id) {
                    debug!(call_id, "Client cancelled call");
                    call.cancel.cancel();
                    let _ = call.inbound.try_send(Message::cancel());
                }
                Routed::Done
            }
            message => {
                let Some(call) = self.calls.get(&call_id) else {
                    debug!(call_id, kind = message.kind(), "Message for unknown call");
                    return Routed::Done;
                };
                match call.inbound.try_send(message) {
                    Ok(()) => Routed::Done,
                    Err(TrySendError::Closed(_)) => {
                        debug!(call_id, "Call is no longer reading");
                        Routed::Done
                    }
                    Err(TrySendError::Full(message)) => {
                        let route = call.inbound.clone();
                        let cancel = call.cancel.clone();
                        Routed::Blocked(Box::pin(async move {
                            tokio::select! {
                                _ = cancel.cancelled() => {}
                                routed = route.send(message) => {
                                    if routed.is_err() {
                                        debug!(call_id, "Call is no longer reading");
                                    }
                                }
                            }
                        }))
                    }
                }
            }
        }
    }

    fn open(&mut self, call_id: CallId, kind: CallKind) -> Option<Envelope> {
        if self.calls.contains_key(&call_id) {
            warn!(call_id, "Call id already in use");
            return Some(error_reply(
                call_id,
                ErrorCode::InvalidRequest,
                "call id already in use",
            ));
        }
        if self.draining {
            debug!(call_id, "Refusing call during shutdown");
            return Some(error_reply(
                call_id,
                ErrorCode::Unavailable,
                "server is shutting down",
            ));
        }

        let (route, rx) = inbound();
        let cancel = self.aborted.child_token();
        let tx = CallSender::new(call_id, self.out_tx.clone(), cancel.clone());
        let router = self.router.clone();
        let span = router.service().call_span(call_id, &kind, self.peer);

        let handle = self.tasks.spawn(
            async move {
                let _ = router.dispatch(kind, rx, tx).await;
                call_id
            }
            .instrument(span),
        );
        self.task_calls.insert(handle.id(), call_id);
        self.calls.insert(
            call_id,
            ActiveCall {
                inbound: route,
                cancel,
            },
        );
        None
    }

    fn on_call_finished(
        &mut self,
        joined: Result<(TaskId, CallId), JoinError>,
    ) -> Option<Envelope> {
        match joined {
            Ok((task_id, call_id)) => {
                self.task_calls.remove(&task_id);
                self.calls.remove(&call_id);
                None
            }
            Err(e) => {
                let call_id = self.task_calls.remove(&e.id())?;
                self.calls.remove(&call_id);
                if e.is_cancelled() {
                    return None;
                }
                warn!(call_id, error = %e, "Call handler failed");
                Some(error_reply(call_id, ErrorCode::Internal, "call handler failed"))
            }
        }
    }

    /// Cancel every open call and stop routing to them.
    fn abort_all(&mut self) {
        if !self.calls.is_empty() {
            debug!(open_calls = self.calls.len(), "Cancelling open calls");
        }
        self.aborted.cancel();
        self.calls.clear();
    }
}

fn error_reply(call_id: CallId, code: ErrorCode, message: &str) -> Envelope {
    Envelope::new(call_id, Message::Error(ErrorMessage::new(code, message)))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use protocol::messages::{
        DownloadRequest, FileChunk, ListRequest, TransferHeader, TransferResult, UploadMessage,
        UploadRequest,
    };
    use rand::Rng;
    use storage::{LocalStore, Walk};
    use tempfile::TempDir;
    use tokio::fs::File;
    use tokio::io::DuplexStream;
    use tokio::sync::Notify;

    use super::*;
    use crate::files::FileService;

    type ClientIo = (
        FramedRead<tokio::io::ReadHalf<DuplexStream>, EnvelopeCodec>,
        FramedWrite<tokio::io::WriteHalf<DuplexStream>, EnvelopeCodec>,
    );

    fn start(
        temp: &TempDir,
        shutdown: CancellationToken,
    ) -> (ClientIo, tokio::task::JoinHandle<protocol::Result<()>>) {
        start_with(Arc::new(LocalStore::new(temp.path())), shutdown)
    }

    fn start_with<S: FileStore>(
        store: Arc<S>,
        shutdown: CancellationToken,
    ) -> (ClientIo, tokio::task::JoinHandle<protocol::Result<()>>) {
        let router = CallRouter::new(FileService::with_defaults(store));
        let (client, server) = tokio::io::duplex(64 * 1024);
        let connection = Connection::new(
            router,
            "127.0.0.1:4000".parse().unwrap(),
            Duration::from_secs(5),
            shutdown,
            Span::none(),
        );
        let handle = tokio::spawn(connection.run(server));
        let (r, w) = tokio::io::split(client);
        (
            (
                FramedRead::new(r, EnvelopeCodec::new()),
                FramedWrite::new(w, EnvelopeCodec::new()),
            ),
            handle,
        )
    }

    async fn next_for(io: &mut ClientIo, call_id: CallId) -> Message {
        loop {
            let envelope = io.0.next().await.unwrap().unwrap();
            if envelope.call_id == call_id {
                return envelope.payload;
            }
        }
    }

    #[tokio::test]
    async fn test_download_over_connection() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("f.txt"), b"file body").unwrap();
        let (mut io, handle) = start(&temp, CancellationToken::new());

        io.1.send(Envelope::new(
            1,
            Message::Open(CallKind::Download(DownloadRequest {
                filename: "f.txt".to_string(),
            })),
        ))
        .await
        .unwrap();

        assert_eq!(
            next_for(&mut io, 1).await,
            Message::Chunk(FileChunk::new(b"file body".to_vec()))
        );
        assert_eq!(next_for(&mut io, 1).await, Message::end());

        drop(io);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_calls_are_multiplexed() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a"), b"a").unwrap();
        let (mut io, _handle) = start(&temp, CancellationToken::new());

        io.1.send(Envelope::new(7, Message::Open(CallKind::Upload(UploadRequest {}))))
            .await
            .unwrap();
        io.1.send(Envelope::new(8, Message::Open(CallKind::ListFiles(ListRequest {}))))
            .await
            .unwrap();

        assert!(matches!(next_for(&mut io, 8).await, Message::Entry(_)));
        assert_eq!(next_for(&mut io, 8).await, Message::end());

        io.1.send(Envelope::new(
            7,
            Message::Upload(UploadMessage::Header(TransferHeader {
                filename: "b".to_string(),
            })),
        ))
        .await
        .unwrap();
        io.1.send(Envelope::new(7, Message::end())).await.unwrap();

        assert_eq!(
            next_for(&mut io, 7).await,
            Message::UploadResult(TransferResult { size: 0 })
        );
        assert_eq!(next_for(&mut io, 7).await, Message::end());
    }

    #[tokio::test]
    async fn test_duplicate_call_id_rejected() {
        let temp = TempDir::new().unwrap();
        let (mut io, _handle) = start(&temp, CancellationToken::new());

        let open = Envelope::new(3, Message::Open(CallKind::Upload(UploadRequest {})));
        io.1.send(open.clone()).await.unwrap();
        io.1.send(open).await.unwrap();

        match next_for(&mut io, 3).await {
            Message::Error(err) => assert_eq!(err.code, ErrorCode::InvalidRequest),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_removes_partial_upload() {
        let temp = TempDir::new().unwrap();
        let (mut io, _handle) = start(&temp, CancellationToken::new());

        io.1.send(Envelope::new(1, Message::Open(CallKind::Upload(UploadRequest {}))))
            .await
            .unwrap();
        io.1.send(Envelope::new(
            1,
            Message::Upload(UploadMessage::Header(TransferHeader {
                filename: "half.bin".to_string(),
            })),
        ))
        .await
        .unwrap();
        io.1.send(Envelope::new(
            1,
            Message::Upload(UploadMessage::Chunk(FileChunk::new(vec![1u8; 100]))),
        ))
        .await
        .unwrap();
        io.1.send(Envelope::new(1, Message::cancel())).await.unwrap();

        // A follow-up call proves the connection kept serving; the upload
        // task has cleaned up once the listing no longer shows the file.
        let mut listed = Vec::new();
        for call_id in 2..50 {
            io.1.send(Envelope::new(
                call_id,
                Message::Open(CallKind::ListFiles(ListRequest {})),
            ))
            .await
            .unwrap();
            listed.clear();
            loop {
                match next_for(&mut io, call_id).await {
                    Message::Entry(entry) => listed.push(entry.filename),
                    Message::End(_) => break,
                    other => panic!("unexpected {:?}", other),
                }
            }
            if listed.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(listed.is_empty());
        assert!(!temp.path().join("half.bin").exists());
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_calls_and_drains() {
        let temp = TempDir::new().unwrap();
        let shutdown = CancellationToken::new();
        let (mut io, handle) = start(&temp, shutdown.clone());

        io.1.send(Envelope::new(1, Message::Open(CallKind::Upload(UploadRequest {}))))
            .await
            .unwrap();
        io.1.send(Envelope::new(
            1,
            Message::Upload(UploadMessage::Header(TransferHeader {
                filename: "late.txt".to_string(),
            })),
        ))
        .await
        .unwrap();

        shutdown.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;

        io.1.send(Envelope::new(2, Message::Open(CallKind::ListFiles(ListRequest {}))))
            .await
            .unwrap();
        match next_for(&mut io, 2).await {
            Message::Error(err) => assert_eq!(err.code, ErrorCode::Unavailable),
            other => panic!("expected unavailable, got {:?}", other),
        }

        io.1.send(Envelope::new(
            1,
            Message::Upload(UploadMessage::Chunk(FileChunk::new(b"done".to_vec()))),
        ))
        .await
        .unwrap();
        io.1.send(Envelope::new(1, Message::end())).await.unwrap();

        assert_eq!(
            next_for(&mut io, 1).await,
            Message::UploadResult(TransferResult { size: 4 })
        );
        assert_eq!(next_for(&mut io, 1).await, Message::end());

        handle.await.unwrap().unwrap();
        assert_eq!(std::fs::read(temp.path().join("late.txt")).unwrap(), b"done");
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let temp = TempDir::new().unwrap();
        let router = CallRouter::new(FileService::with_defaults(Arc::new(LocalStore::new(
            temp.path(),
        ))));
        let (_client, server) = tokio::io::duplex(1024);
        let connection = Connection::new(
            router,
            "127.0.0.1:4000".parse().unwrap(),
            Duration::from_millis(20),
            CancellationToken::new(),
            Span::none(),
        );

        let err = connection.run(server).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_shutdown_closes_connection_awaiting_first_request() {
        let temp = TempDir::new().unwrap();
        let shutdown = CancellationToken::new();
        let (_io, handle) = start(&temp, shutdown.clone());

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();

        // The connect timeout is five seconds; shutdown must not wait for it.
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("connection kept running after shutdown");
        result.unwrap().unwrap();
    }

    /// Store whose `create` waits until the test opens the gate.
    struct GatedStore {
        inner: LocalStore,
        gate: Arc<Notify>,
    }

    impl FileStore for GatedStore {
        type Reader = File;
        type Writer = File;

        async fn open(&self, name: &str) -> std::io::Result<File> {
            self.inner.open(name).await
        }

        async fn create(&self, name: &str) -> std::io::Result<File> {
            self.gate.notified().await;
            self.inner.create(name).await
        }

        async fn remove(&self, name: &str) -> std::io::Result<()> {
            self.inner.remove(name).await
        }

        fn walk(&self) -> Walk {
            self.inner.walk()
        }
    }

    #[tokio::test]
    async fn test_stalled_upload_does_not_block_other_calls() {
        let temp = TempDir::new().unwrap();
        let mut body = vec![0u8; 300 * 1024];
        rand::thread_rng().fill(&mut body[..]);
        std::fs::write(temp.path().join("big.bin"), &body).unwrap();

        let gate = Arc::new(Notify::new());
        let store = Arc::new(GatedStore {
            inner: LocalStore::new(temp.path()),
            gate: gate.clone(),
        });
        let (mut io, _handle) = start_with(store, CancellationToken::new());

        io.1.send(Envelope::new(
            1,
            Message::Open(CallKind::Download(DownloadRequest {
                filename: "big.bin".to_string(),
            })),
        ))
        .await
        .unwrap();
        io.1.send(Envelope::new(2, Message::Open(CallKind::Upload(UploadRequest {}))))
            .await
            .unwrap();
        io.1.send(Envelope::new(
            2,
            Message::Upload(UploadMessage::Header(TransferHeader {
                filename: "slow.bin".to_string(),
            })),
        ))
        .await
        .unwrap();
        // More chunks than the upload's queue holds while it waits on create.
        for _ in 0..40 {
            io.1.send(Envelope::new(
                2,
                Message::Upload(UploadMessage::Chunk(FileChunk::new(vec![5u8; 16]))),
            ))
            .await
            .unwrap();
        }

        let downloaded = tokio::time::timeout(Duration::from_secs(5), async {
            let mut downloaded = Vec::new();
            loop {
                match next_for(&mut io, 1).await {
                    Message::Chunk(chunk) => downloaded.extend_from_slice(&chunk.data),
                    Message::End(_) => break downloaded,
                    other => panic!("unexpected {:?}", other),
                }
            }
        })
        .await
        .expect("download stalled behind the blocked upload");
        assert_eq!(downloaded, body);

        gate.notify_one();
        io.1.send(Envelope::new(2, Message::end())).await.unwrap();
        assert_eq!(
            next_for(&mut io, 2).await,
            Message::UploadResult(TransferResult { size: 40 * 16 })
        );
        assert_eq!(next_for(&mut io, 2).await, Message::end());
    }

    #[tokio::test]
    async fn test_peer_disconnect_removes_partial_upload() {
        let temp = TempDir::new().unwrap();
        let (mut io, handle) = start(&temp, CancellationToken::new());

        io.1.send(Envelope::new(1, Message::Open(CallKind::Upload(UploadRequest {}))))
            .await
            .unwrap();
        io.1.send(Envelope::new(
            1,
            Message::Upload(UploadMessage::Header(TransferHeader {
                filename: "cut.bin".to_string(),
            })),
        ))
        .await
        .unwrap();
        io.1.send(Envelope::new(
            1,
            Message::Upload(UploadMessage::Chunk(FileChunk::new(vec![0u8; 10]))),
        ))
        .await
        .unwrap();

        drop(io);
        handle.await.unwrap().unwrap();
        assert!(!temp.path().join("cut.bin").exists());
    }
}
