//! Length-prefixed frames over async streams.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::BufMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use super::super::TorrentError;
use crate::codec::{self, Value};

/// Reads one frame and decodes its payload.
///
/// # Errors
/// - `TorrentError::ConnectionClosed` - If the stream ends before a full frame arrives
/// - `TorrentError::FrameTooLarge` - If the announced length exceeds `max_len`
/// - `TorrentError::Codec` - If the payload is not one canonical value
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Value, TorrentError>
where
    R: AsyncRead + Unpin,
{
    let mut length_buf = [0u8; 4];
    read_exact_or_closed(reader, &mut length_buf).await?;

    let len = u32::from_be_bytes(length_buf) as usize;
    if len > max_len {
        return Err(TorrentError::FrameTooLarge { len, max: max_len });
    }

    let mut payload = vec![0u8; len];
    read_exact_or_closed(reader, &mut payload).await?;
    Ok(codec::decode(&payload)?)
}

/// Encodes a value and writes it as one frame.
///
/// # Errors
/// - `TorrentError::FrameTooLarge` - If the encoding does not fit a `u32` length
/// - `TorrentError::Io` - If the write fails
pub async fn write_frame<W>(writer: &mut W, value: &Value) -> Result<(), TorrentError>
where
    W: AsyncWrite + Unpin,
{
    let payload = value.encode();
    let len = u32::try_from(payload.len()).map_err(|_| TorrentError::FrameTooLarge {
        len: payload.len(),
        max: u32::MAX as usize,
    })?;

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.put_u32(len);
    frame.put_slice(&payload);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_exact_or_closed<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), TorrentError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(TorrentError::ConnectionClosed)
        }
        Err(e) => Err(e.into()),
    }
}

/// A TCP connection exchanging frames under explicit timeouts.
pub struct Connection {
    stream: TcpStream,
    address: SocketAddr,
    io_timeout: Duration,
    max_frame_len: usize,
}

impl Connection {
    /// Connects to `address`, bounded by `connect_timeout`.
    ///
    /// # Errors
    /// - `TorrentError::Timeout` - If the connect does not finish in time
    /// - `TorrentError::PeerUnreachable` - If the connect is refused or fails
    pub async fn connect(
        address: SocketAddr,
        connect_timeout: Duration,
        io_timeout: Duration,
        max_frame_len: usize,
    ) -> Result<Self, TorrentError> {
        let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(address)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(TorrentError::PeerUnreachable {
                    address,
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(TorrentError::Timeout {
                    operation: "connect",
                    address,
                });
            }
        };
        // Small request/response frames; latency matters more than batching.
        stream.set_nodelay(true)?;

        Ok(Self::from_stream(stream, address, io_timeout, max_frame_len))
    }

    /// Wraps an accepted stream.
    pub fn from_stream(
        stream: TcpStream,
        address: SocketAddr,
        io_timeout: Duration,
        max_frame_len: usize,
    ) -> Self {
        Self {
            stream,
            address,
            io_timeout,
            max_frame_len,
        }
    }

    pub fn peer_address(&self) -> SocketAddr {
        self.address
    }

    /// # Errors
    /// - `TorrentError::Timeout` - If the write does not finish within the I/O timeout
    /// - `TorrentError::Io` - If the write fails
    pub async fn send(&mut self, value: &Value) -> Result<(), TorrentError> {
        tokio::time::timeout(self.io_timeout, write_frame(&mut self.stream, value))
            .await
            .map_err(|_| TorrentError::Timeout {
                operation: "send",
                address: self.address,
            })?
    }

    /// Receives one frame within the I/O timeout.
    ///
    /// # Errors
    /// - `TorrentError::Timeout` - If no complete frame arrives in time
    /// - Any error from [`read_frame`]
    pub async fn receive(&mut self) -> Result<Value, TorrentError> {
        self.receive_within(self.io_timeout, "receive").await
    }

    /// Receives one frame, waiting at most `wait`.
    ///
    /// # Errors
    /// - `TorrentError::Timeout` - If no complete frame arrives in time
    /// - Any error from [`read_frame`]
    pub async fn receive_within(
        &mut self,
        wait: Duration,
        operation: &'static str,
    ) -> Result<Value, TorrentError> {
        tokio::time::timeout(wait, read_frame(&mut self.stream, self.max_frame_len))
            .await
            .map_err(|_| TorrentError::Timeout {
                operation,
                address: self.address,
            })?
    }

    /// Sends a request and waits for its response.
    ///
    /// # Errors
    /// - Any error from [`Connection::send`] or [`Connection::receive`]
    pub async fn request(&mut self, value: &Value) -> Result<Value, TorrentError> {
        self.send(value).await?;
        self.receive().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_round_trip_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let value = Value::map([("type", Value::from("handshake"))]);

        write_frame(&mut client, &value).await.unwrap();
        let received = read_frame(&mut server, 1024).await.unwrap();
        assert_eq!(received, value);
    }

    #[tokio::test]
    async fn test_frame_has_length_prefix() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, &Value::Integer(5)).await.unwrap();
        drop(client);

        let mut raw = Vec::new();
        server.read_to_end(&mut raw).await.unwrap();
        assert_eq!(raw, b"\x00\x00\x00\x03i5e");
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&10_000u32.to_be_bytes()).await.unwrap();

        assert!(matches!(
            read_frame(&mut server, 1024).await,
            Err(TorrentError::FrameTooLarge {
                len: 10_000,
                max: 1024
            })
        ));
    }

    #[tokio::test]
    async fn test_truncated_frame_reports_closed() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&[0, 0, 0, 9, b'i']).await.unwrap();
        drop(client);

        assert!(matches!(
            read_frame(&mut server, 1024).await,
            Err(TorrentError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_non_canonical_payload_is_codec_error() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&[0, 0, 0, 3, b'i', b'x', b'e']).await.unwrap();

        assert!(matches!(
            read_frame(&mut server, 1024).await,
            Err(TorrentError::Codec(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_refused_is_unreachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let result = Connection::connect(
            address,
            Duration::from_secs(1),
            Duration::from_secs(1),
            1024,
        )
        .await;
        assert!(matches!(
            result,
            Err(TorrentError::PeerUnreachable { .. }) | Err(TorrentError::Timeout { .. })
        ));
    }
}
