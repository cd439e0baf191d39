//! TCP listener wiring the file service to incoming connections.
//!
//! [`FileServer`] accepts connections until its shutdown token fires, then
//! stops accepting and gives open calls up to the configured shutdown
//! timeout to finish.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use storage::{FileStore, LocalStore};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn, Instrument, Span};

use crate::config::{Config, ServerConfig};
use crate::connection::Connection;
use crate::files::FileService;
use crate::router::CallRouter;

/// Pause after a failed accept, so exhausted descriptors do not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// The fileserver daemon.
pub struct FileServer<S = LocalStore> {
    config: ServerConfig,
    router: CallRouter<S>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    span: Span,
}

impl FileServer<LocalStore> {
    /// Create a server for the configured root directory.
    pub fn new(config: &Config) -> Self {
        let span = tracing::info_span!("server", root = %config.server.root.display());
        Self::with_store(config, Arc::new(LocalStore::new(&config.server.root)), span)
    }
}

impl<S: FileStore> FileServer<S> {
    /// Create a server over a custom store. Connection and call spans are
    /// created below `span`.
    pub fn with_store(config: &Config, store: Arc<S>, span: Span) -> Self {
        let service = FileService::new(store, config.transfer.chunk_size, span.clone());
        Self {
            config: config.server.clone(),
            router: CallRouter::new(service),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            span,
        }
    }

    /// Returns the shutdown token. Cancelling it stops [`FileServer::serve`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> io::Result<TcpListener> {
        TcpListener::bind(self.config.bind_address()).await
    }

    /// Accept connections on `listener` until shutdown, then drain.
    pub async fn serve(self, listener: TcpListener) -> io::Result<()> {
        let span = self.span.clone();
        self.accept_loop(listener).instrument(span).await
    }

    async fn accept_loop(self, listener: TcpListener) -> io::Result<()> {
        info!(addr = %listener.local_addr()?, "Server listening");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_connection(stream, peer),
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        drop(listener);
        self.tracker.close();
        info!(
            connections = self.tracker.len(),
            "Stopped accepting connections, draining"
        );

        let timeout = self.config.shutdown_timeout();
        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_err() {
            warn!(
                connections = self.tracker.len(),
                timeout = ?timeout,
                "Shutdown timeout elapsed with calls still running"
            );
        }
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream, peer: std::net::SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Could not disable Nagle");
        }

        let span = tracing::info_span!(parent: &self.span, "connection", peer = %peer);
        let connection = Connection::new(
            self.router.clone(),
            peer,
            self.config.connect_timeout(),
            self.shutdown.clone(),
            span.clone(),
        );

        self.tracker.spawn(
            async move {
                debug!("Connection accepted");
                if let Err(e) = connection.run(stream).await {
                    warn!(error = %e, "Connection ended with error");
                }
            }
            .instrument(span),
        );
    }
}

#[cfg(test)]
mod tests {
    use futures_util::{SinkExt, StreamExt};
    use protocol::messages::{ListRequest, Message};
    use protocol::{CallKind, Envelope, EnvelopeCodec};
    use tempfile::TempDir;
    use tokio_util::codec::Framed;

    use super::*;

    fn test_config(temp: &TempDir) -> Config {
        let mut config = Config::default();
        config.server.addr = "127.0.0.1".to_string();
        config.server.port = 0;
        config.server.root = temp.path().to_path_buf();
        config.server.shutdown_timeout_secs = 2;
        config
    }

    #[tokio::test]
    async fn test_serve_lists_and_shuts_down() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("one.txt"), b"1").unwrap();

        let server = FileServer::new(&test_config(&temp));
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = server.shutdown_token();
        let serving = tokio::spawn(server.serve(listener));

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(stream, EnvelopeCodec::new());
        framed
            .send(Envelope::new(
                1,
                Message::Open(CallKind::ListFiles(ListRequest {})),
            ))
            .await
            .unwrap();

        match framed.next().await.unwrap().unwrap().payload {
            Message::Entry(entry) => assert_eq!(entry.filename, "one.txt"),
            other => panic!("expected entry, got {:?}", other),
        }
        assert_eq!(framed.next().await.unwrap().unwrap().payload, Message::end());

        shutdown.cancel();
        serving.await.unwrap().unwrap();
        assert!(framed.next().await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_not_held_by_idle_connection() {
        let temp = TempDir::new().unwrap();
        let mut config = test_config(&temp);
        config.server.shutdown_timeout_secs = 10;
        let server = FileServer::new(&config);
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = server.shutdown_token();
        let serving = tokio::spawn(server.serve(listener));

        let _idle = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), serving)
            .await
            .expect("idle connection held up shutdown")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_without_connections() {
        let temp = TempDir::new().unwrap();
        let server = FileServer::new(&test_config(&temp));
        let listener = server.bind().await.unwrap();
        let shutdown = server.shutdown_token();

        shutdown.cancel();
        server.serve(listener).await.unwrap();
    }
}
