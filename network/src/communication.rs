use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use storage::{Codec, Compression};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::timeout;

use crate::{Message, NetworkError, Result};

/// Pause after a failed accept, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Messages tagged with another group are dropped on receipt.
    pub group: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub retry_count: u32,
    pub retry_backoff: Duration,
    pub compression: Compression,
    pub max_frame_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            group: "default".to_string(),
            connect_timeout: Duration::from_secs(3),
            read_timeout: Duration::from_secs(3),
            write_timeout: Duration::from_secs(3),
            retry_count: 3,
            retry_backoff: Duration::from_millis(100),
            compression: Compression::Zlib,
            max_frame_size: 64 * 1024 * 1024,
        }
    }
}

/// One framed TCP stream. Frames are a big-endian `u32` length followed by
/// the encoded message.
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    codec: Codec,
    config: TransportConfig,
}

impl Connection {
    fn new(stream: TcpStream, peer: SocketAddr, config: TransportConfig) -> Self {
        Self {
            stream,
            peer,
            codec: Codec::new(config.compression),
            config,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub async fn send(&mut self, message: &Message) -> Result<()> {
        let body = self.codec.encode(message)?;
        if body.len() > self.config.max_frame_size {
            return Err(NetworkError::FrameTooLarge(body.len()));
        }

        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);

        match timeout(self.config.write_timeout, self.stream.write_all(&frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(NetworkError::Timeout(format!("write to {}", self.peer))),
        }
    }

    /// Reads the next message, or `None` once the peer has closed the stream.
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        let mut len_buf = [0u8; 4];
        match timeout(self.config.read_timeout, self.stream.read_exact(&mut len_buf)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(NetworkError::Timeout(format!("read from {}", self.peer))),
        }

        let length = u32::from_be_bytes(len_buf) as usize;
        if length > self.config.max_frame_size {
            return Err(NetworkError::FrameTooLarge(length));
        }

        let mut body = BytesMut::zeroed(length);
        match timeout(self.config.read_timeout, self.stream.read_exact(&mut body)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(NetworkError::Timeout(format!("read from {}", self.peer))),
        }

        let mut message: Message = self.codec.decode(&body)?;
        // The sender's view of its own address is not trusted.
        message.info.ip = self.peer.ip();
        Ok(Some(message))
    }

    /// Sends `message` and waits for a single reply.
    pub async fn call(&mut self, message: &Message) -> Result<Message> {
        self.send(message).await?;
        self.recv().await?.ok_or_else(|| {
            NetworkError::ConnectionFailed(format!("{} closed before replying", self.peer))
        })
    }
}

/// Outbound side: opens connections with retry and timeouts.
#[derive(Debug, Clone)]
pub struct Transport {
    config: TransportConfig,
}

impl Transport {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub async fn connect_once(&self, addr: SocketAddr) -> Result<Connection> {
        match timeout(self.config.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(Connection::new(stream, addr, self.config.clone()))
            }
            Ok(Err(e)) => Err(NetworkError::ConnectionFailed(format!("{}: {}", addr, e))),
            Err(_) => Err(NetworkError::Timeout(format!("connect to {}", addr))),
        }
    }

    pub async fn connect(&self, addr: SocketAddr) -> Result<Connection> {
        let attempts = self.config.retry_count.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.connect_once(addr).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    tracing::trace!("Connect attempt {}/{} to {} failed: {}", attempt, attempts, addr, e);
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.config.retry_backoff).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| NetworkError::ConnectionFailed(addr.to_string())))
    }

    /// One-shot request/response on a fresh connection.
    pub async fn request(&self, addr: SocketAddr, message: &Message) -> Result<Message> {
        let mut conn = self.connect(addr).await?;
        conn.call(message).await
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handles one inbound message. The handler may reply on `conn`, or keep
    /// using it for a multi-message exchange.
    async fn handle(&self, conn: &mut Connection, message: Message) -> Result<()>;
}

/// Inbound side: accepts connections and feeds each message to a handler.
pub struct Listener {
    listener: TcpListener,
    config: TransportConfig,
}

impl Listener {
    pub async fn bind(addr: SocketAddr, config: TransportConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, config })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Runs the accept loop. Connection tasks live in a `JoinSet`, so dropping
    /// this future also tears down every open connection.
    pub async fn serve(&self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let mut connections = JoinSet::new();

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("Failed to accept connection: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!("Failed to set nodelay for {}: {}", peer, e);
            }

            while connections.try_join_next().is_some() {}

            let conn = Connection::new(stream, peer, self.config.clone());
            let handler = handler.clone();
            connections.spawn(async move {
                Self::handle_connection(conn, handler).await;
            });
        }
    }

    async fn handle_connection(mut conn: Connection, handler: Arc<dyn MessageHandler>) {
        loop {
            let message = match conn.recv().await {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(NetworkError::Timeout(_)) => break,
                Err(e) => {
                    tracing::debug!("Dropping connection from {}: {}", conn.peer, e);
                    break;
                }
            };

            if message.info.group != conn.config.group {
                tracing::debug!(
                    "Ignoring message from group {} (peer {})",
                    message.info.group,
                    conn.peer
                );
                break;
            }

            if let Err(e) = handler.handle(&mut conn, message).await {
                tracing::debug!("Handler failed for {}: {}", conn.peer, e);
                break;
            }
        }
    }
}
