//! TCP tracker server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;

use super::swarm::SwarmRegistry;
use crate::config::ShoalConfig;
use crate::torrent::TorrentError;
use crate::torrent::protocol::{Connection, TrackerRequest, TrackerResponse};

/// Tracker service bound to a listening socket.
pub struct TrackerServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    registry: Arc<SwarmRegistry>,
    connection_limit: Arc<Semaphore>,
    idle_timeout: Duration,
    io_timeout: Duration,
    max_frame_len: usize,
}

impl TrackerServer {
    /// Binds the tracker socket.
    ///
    /// # Errors
    /// - `TorrentError::Io` - If the address cannot be bound
    pub async fn bind(address: SocketAddr, config: &ShoalConfig) -> Result<Self, TorrentError> {
        let listener = TcpListener::bind(address).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!("Tracker listening on {local_addr}");

        Ok(Self {
            listener,
            local_addr,
            registry: Arc::new(SwarmRegistry::new()),
            connection_limit: Arc::new(Semaphore::new(config.tracker.max_connections)),
            idle_timeout: config.tracker.idle_timeout,
            io_timeout: config.peer.io_timeout,
            max_frame_len: config.peer.max_frame_len,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> Arc<SwarmRegistry> {
        Arc::clone(&self.registry)
    }

    /// Serves connections until `shutdown` becomes `true` or its sender is dropped.
    ///
    /// Open connections are closed when the shutdown signal fires.
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
                            tracing::error!("Tracker failed to accept connection: {e}");
                            continue;
                        }
                    };

                    let Ok(permit) = Arc::clone(&self.connection_limit).try_acquire_owned() else {
                        tracing::warn!("Tracker at connection limit, dropping {address}");
                        continue;
                    };

                    let connection = Connection::from_stream(
                        stream,
                        address,
                        self.io_timeout,
                        self.max_frame_len,
                    );
                    let registry = Arc::clone(&self.registry);
                    let idle_timeout = self.idle_timeout;
                    let mut connection_shutdown = shutdown.clone();

                    tokio::spawn(async move {
                        tokio::select! {
                            _ = serve_connection(&registry, connection, idle_timeout) => {}
                            _ = connection_shutdown.changed() => {}
                        }
                        drop(permit);
                    });
                }
            }
        }
        tracing::info!("Tracker on {} stopped", self.local_addr);
    }

    /// Runs the server on a background task.
    pub fn spawn(self) -> TrackerHandle {
        let (shutdown, receiver) = watch::channel(false);
        let local_addr = self.local_addr;
        let registry = self.registry();
        let task = tokio::spawn(self.run(receiver));

        TrackerHandle {
            local_addr,
            registry,
            shutdown,
            task,
        }
    }
}

/// Control handle for a spawned tracker.
pub struct TrackerHandle {
    local_addr: SocketAddr,
    registry: Arc<SwarmRegistry>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TrackerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &SwarmRegistry {
        &self.registry
    }

    /// Signals shutdown and waits for the accept loop to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!("Tracker task ended abnormally: {e}");
        }
    }
}

/// Request/response loop for one client; returns when the connection ends.
async fn serve_connection(
    registry: &SwarmRegistry,
    mut connection: Connection,
    idle_timeout: Duration,
) {
    let address = connection.peer_address();
    tracing::debug!("Tracker connection from {address}");

    loop {
        let value = match connection.receive_within(idle_timeout, "idle wait").await {
            Ok(value) => value,
            Err(TorrentError::ConnectionClosed) => {
                tracing::debug!("Tracker connection from {address} closed");
                return;
            }
            Err(e) => {
                tracing::debug!("Dropping tracker connection from {address}: {e}");
                return;
            }
        };

        let response = match TrackerRequest::from_value(&value) {
            Ok(request) => handle_request(registry, request),
            Err(e) => {
                tracing::warn!("Rejected request from {address}: {e}");
                TrackerResponse::error(&e)
            }
        };

        if let Err(e) = connection.send(&response.to_value()).await {
            tracing::debug!("Failed to answer {address}: {e}");
            return;
        }
    }
}

fn handle_request(registry: &SwarmRegistry, request: TrackerRequest) -> TrackerResponse {
    match request {
        TrackerRequest::Announce(announce) => match registry.announce(&announce) {
            Ok(peers) => TrackerResponse::Peers(peers),
            Err(e) => {
                tracing::warn!(
                    "Rejected {} announce from {}: {e}",
                    announce.event,
                    announce.peer
                );
                TrackerResponse::error(&e)
            }
        },
        TrackerRequest::ListSwarms => TrackerResponse::Swarms(registry.list_swarms()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Value;

    async fn spawn_tracker() -> TrackerHandle {
        let config = ShoalConfig::for_testing();
        TrackerServer::bind("127.0.0.1:0".parse().unwrap(), &config)
            .await
            .unwrap()
            .spawn()
    }

    async fn connect(address: SocketAddr) -> Connection {
        Connection::connect(
            address,
            Duration::from_secs(1),
            Duration::from_secs(2),
            1 << 20,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_unknown_request_keeps_connection_open() {
        let tracker = spawn_tracker().await;
        let mut connection = connect(tracker.local_addr()).await;

        let response = connection
            .request(&Value::map([("type", Value::from("scrape"))]))
            .await
            .unwrap();
        assert_eq!(
            response.get(b"code").and_then(Value::as_str),
            Some("unknown_request_type")
        );

        let response = connection
            .request(&TrackerRequest::ListSwarms.to_value())
            .await
            .unwrap();
        assert_eq!(
            TrackerResponse::from_value(&response).unwrap(),
            TrackerResponse::Swarms(vec![])
        );

        tracker.shutdown().await;
    }

    #[tokio::test]
    async fn test_malformed_request_reports_error() {
        let tracker = spawn_tracker().await;
        let mut connection = connect(tracker.local_addr()).await;

        let response = connection
            .request(&Value::map([("type", Value::from("announce"))]))
            .await
            .unwrap();
        assert_eq!(
            response.get(b"code").and_then(Value::as_str),
            Some("malformed_request")
        );

        tracker.shutdown().await;
    }

    #[tokio::test]
    async fn test_bind_conflict_is_startup_error() {
        let tracker = spawn_tracker().await;
        let config = ShoalConfig::for_testing();

        assert!(matches!(
            TrackerServer::bind(tracker.local_addr(), &config).await,
            Err(TorrentError::Io(_))
        ));

        tracker.shutdown().await;
    }
}
