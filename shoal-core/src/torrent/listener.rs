//! Inbound peer connections: handshakes and piece requests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;

use super::piece_store::PieceStore;
use super::{ContentId, PieceIndex, TorrentError};
use super::protocol::{Connection, ErrorCode, PeerRequest, PeerResponse};
use crate::config::ShoalConfig;

/// Serves pieces from a [`PieceStore`] to connecting peers.
pub struct PeerListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    store: Arc<dyn PieceStore>,
    connection_limit: Arc<Semaphore>,
    idle_timeout: Duration,
    io_timeout: Duration,
    max_frame_len: usize,
}

impl PeerListener {
    /// Binds the listening socket.
    ///
    /// # Errors
    /// - `TorrentError::Io` - If the address cannot be bound
    pub async fn bind(
        address: SocketAddr,
        store: Arc<dyn PieceStore>,
        config: &ShoalConfig,
    ) -> Result<Self, TorrentError> {
        let listener = TcpListener::bind(address).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!("Peer listening on {local_addr}");

        Ok(Self {
            listener,
            local_addr,
            store,
            connection_limit: Arc::new(Semaphore::new(config.peer.max_inbound_connections)),
            idle_timeout: config.peer.idle_timeout,
            io_timeout: config.peer.io_timeout,
            max_frame_len: config.peer.max_frame_len,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts peers until `shutdown` becomes `true` or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = self.listener.accept() => {
                    let (stream, address) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::error!("Failed to accept peer connection: {e}");
                            continue;
                        }
                    };

                    let Ok(permit) = Arc::clone(&self.connection_limit).try_acquire_owned()
                    else {
                        tracing::warn!("Inbound peer limit reached, dropping {address}");
                        continue;
                    };

                    let connection = Connection::from_stream(
                        stream,
                        address,
                        self.io_timeout,
                        self.max_frame_len,
                    );
                    let store = Arc::clone(&self.store);
                    let idle_timeout = self.idle_timeout;
                    let mut connection_shutdown = shutdown.clone();

                    tokio::spawn(async move {
                        tokio::select! {
                            _ = serve_peer(store.as_ref(), connection, idle_timeout) => {}
                            _ = connection_shutdown.changed() => {}
                        }
                        drop(permit);
                    });
                }
            }
        }
        tracing::info!("Peer listener on {} stopped", self.local_addr);
    }

    /// Runs the listener on a background task.
    pub fn spawn(self) -> ListenerHandle {
        let (shutdown, receiver) = watch::channel(false);
        let local_addr = self.local_addr;
        let task = tokio::spawn(self.run(receiver));
        ListenerHandle {
            local_addr,
            shutdown,
            task,
        }
    }
}

/// Control handle for a spawned listener.
pub struct ListenerHandle {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting, closes open connections and waits for the accept loop.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!("Listener task ended abnormally: {e}");
        }
    }
}

async fn serve_peer(store: &dyn PieceStore, mut connection: Connection, idle_timeout: Duration) {
    let address = connection.peer_address();
    tracing::debug!("Peer connection from {address}");

    loop {
        let value = match connection.receive_within(idle_timeout, "idle wait").await {
            Ok(value) => value,
            Err(TorrentError::ConnectionClosed) => return,
            Err(e) => {
                tracing::debug!("Dropping peer connection from {address}: {e}");
                return;
            }
        };

        let response = match PeerRequest::from_value(&value) {
            Ok(request) => respond(store, request).await,
            Err(e) => {
                tracing::warn!("Rejected message from {address}: {e}");
                PeerResponse::error(ErrorCode::for_error(&e), e.to_string())
            }
        };

        if let Err(e) = connection.send(&response.to_value()).await {
            tracing::debug!("Failed to answer {address}: {e}");
            return;
        }
    }
}

async fn respond(store: &dyn PieceStore, request: PeerRequest) -> PeerResponse {
    match request {
        PeerRequest::Handshake => PeerResponse::HandshakeAck,
        PeerRequest::RequestPiece { content_id, index } => {
            match read_piece(store, content_id, index).await {
                Ok(data) => {
                    tracing::debug!("Serving piece {index} of {content_id} ({} bytes)", data.len());
                    PeerResponse::Piece { index, data }
                }
                Err(
                    e @ (TorrentError::ContentNotFound { .. }
                    | TorrentError::InvalidPieceIndex { .. }),
                ) => PeerResponse::error(ErrorCode::for_error(&e), e.to_string()),
                Err(e) => {
                    tracing::warn!("Failed to read piece {index} of {content_id}: {e}");
                    PeerResponse::error(ErrorCode::NotFound, e.to_string())
                }
            }
        }
    }
}

/// Checks the request against what the store holds before touching piece data.
async fn read_piece(
    store: &dyn PieceStore,
    content_id: ContentId,
    index: PieceIndex,
) -> Result<Bytes, TorrentError> {
    if !store.has_content(content_id) {
        return Err(TorrentError::ContentNotFound { content_id });
    }
    let count = store.piece_count(content_id)?;
    if index.as_u32() >= count {
        return Err(TorrentError::InvalidPieceIndex { index, count });
    }
    store.piece_data(content_id, index).await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::codec::Value;

    /// Serves `count` eight-byte pieces of a single content id.
    struct FixedStore {
        content_id: ContentId,
        count: u32,
        reads: AtomicUsize,
    }

    #[async_trait]
    impl PieceStore for FixedStore {
        async fn piece_data(
            &self,
            content_id: ContentId,
            index: PieceIndex,
        ) -> Result<Bytes, TorrentError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if content_id != self.content_id {
                return Err(TorrentError::ContentNotFound { content_id });
            }
            if index.as_u32() >= self.count {
                return Err(TorrentError::InvalidPieceIndex {
                    index,
                    count: self.count,
                });
            }
            Ok(Bytes::from(vec![index.as_u32() as u8; 8]))
        }

        fn has_content(&self, content_id: ContentId) -> bool {
            content_id == self.content_id
        }

        fn piece_count(&self, _content_id: ContentId) -> Result<u32, TorrentError> {
            Ok(self.count)
        }
    }

    async fn spawn_listener(content_id: ContentId) -> (ListenerHandle, Arc<FixedStore>) {
        let store = Arc::new(FixedStore {
            content_id,
            count: 2,
            reads: AtomicUsize::new(0),
        });
        let listener = PeerListener::bind(
            "127.0.0.1:0".parse().unwrap(),
            store.clone(),
            &ShoalConfig::for_testing(),
        )
        .await
        .unwrap()
        .spawn();
        (listener, store)
    }

    async fn exchange(connection: &mut Connection, request: &Value) -> PeerResponse {
        PeerResponse::from_value(&connection.request(request).await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_serves_handshake_and_pieces() {
        let content_id = ContentId::new([5u8; 20]);
        let (listener, store) = spawn_listener(content_id).await;
        let mut connection = Connection::connect(
            listener.local_addr(),
            Duration::from_secs(1),
            Duration::from_secs(2),
            1 << 20,
        )
        .await
        .unwrap();

        assert_eq!(
            exchange(&mut connection, &PeerRequest::Handshake.to_value()).await,
            PeerResponse::HandshakeAck
        );

        let request = PeerRequest::RequestPiece {
            content_id,
            index: PieceIndex::new(1),
        };
        assert_eq!(
            exchange(&mut connection, &request.to_value()).await,
            PeerResponse::Piece {
                index: PieceIndex::new(1),
                data: Bytes::from(vec![1u8; 8]),
            }
        );
        assert_eq!(store.reads.load(Ordering::SeqCst), 1);

        listener.shutdown().await;
    }

    #[tokio::test]
    async fn test_error_responses_keep_connection_open() {
        let content_id = ContentId::new([5u8; 20]);
        let (listener, store) = spawn_listener(content_id).await;
        let mut connection = Connection::connect(
            listener.local_addr(),
            Duration::from_secs(1),
            Duration::from_secs(2),
            1 << 20,
        )
        .await
        .unwrap();

        let missing = PeerRequest::RequestPiece {
            content_id: ContentId::new([6u8; 20]),
            index: PieceIndex::new(0),
        };
        assert!(matches!(
            exchange(&mut connection, &missing.to_value()).await,
            PeerResponse::Error {
                code: ErrorCode::NotFound,
                ..
            }
        ));

        let out_of_range = PeerRequest::RequestPiece {
            content_id,
            index: PieceIndex::new(2),
        };
        assert!(matches!(
            exchange(&mut connection, &out_of_range.to_value()).await,
            PeerResponse::Error {
                code: ErrorCode::InvalidIndex,
                ..
            }
        ));

        let unknown = Value::map([("type", Value::from("choke"))]);
        assert!(matches!(
            exchange(&mut connection, &unknown).await,
            PeerResponse::Error {
                code: ErrorCode::UnknownRequestType,
                ..
            }
        ));

        assert_eq!(
            exchange(&mut connection, &PeerRequest::Handshake.to_value()).await,
            PeerResponse::HandshakeAck
        );
        // Unknown content and bad indices are answered without reading piece data.
        assert_eq!(store.reads.load(Ordering::SeqCst), 0);

        listener.shutdown().await;
    }
}
