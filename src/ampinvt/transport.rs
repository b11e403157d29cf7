use crate::prelude::*;
use crate::error::TransportError;

use {
    async_trait::async_trait,
    net2::TcpStreamExt,
    std::time::Duration,
    tokio::io::{AsyncReadExt, AsyncWriteExt},
    tokio::net::TcpStream,
};

const SETTLE_DELAY_MS: u64 = 100; // after raw connect, before first frame
const FLUSH_READ_TIMEOUT_MS: u64 = 10;
const TCP_KEEPALIVE_SECS: u64 = 60;

/// The one seam between the arbitrator and the wire. The production
/// implementation is [`Gateway`]; tests substitute a double.
#[async_trait]
pub trait BusTransport: Send {
    /// One request/response pair: send the frame, then read exactly
    /// `reply_len` bytes. The caller must hold the bus for the whole call.
    async fn exchange(&mut self, request: &[u8], reply_len: usize)
        -> Result<Vec<u8>, TransportError>;

    fn disconnect(&mut self);
}

/// A single TCP stream to the RS485 gateway. Never retries on its own:
/// every failure closes the stream and is reported upward, so the next
/// operation reconnects from a clean slate.
pub struct Gateway {
    host: String,
    port: u16,
    connect_timeout: Duration,
    read_timeout: Duration,
    stream: Option<TcpStream>,
}

impl Gateway {
    pub fn new(host: String, port: u16, connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            host,
            port,
            connect_timeout,
            read_timeout,
            stream: None,
        }
    }

    pub fn from_config(gateway: &config::Gateway) -> Self {
        Self::new(
            gateway.host().to_string(),
            gateway.port(),
            gateway.connect_timeout(),
            gateway.read_timeout(),
        )
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub async fn connect(&mut self) -> Result<(), TransportError> {
        self.close();

        let stream = match tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(TransportError::Connect {
                    host: self.host.clone(),
                    port: self.port,
                    source,
                })
            }
            Err(_) => {
                return Err(TransportError::ConnectTimeout {
                    host: self.host.clone(),
                    port: self.port,
                    timeout: self.connect_timeout,
                })
            }
        };

        let std_stream = stream.into_std().map_err(|source| TransportError::Connect {
            host: self.host.clone(),
            port: self.port,
            source,
        })?;
        if let Err(e) = std_stream.set_keepalive(Some(Duration::from_secs(TCP_KEEPALIVE_SECS))) {
            warn!("failed to set TCP keepalive: {}", e);
        }
        let stream = TcpStream::from_std(std_stream).map_err(|source| TransportError::Connect {
            host: self.host.clone(),
            port: self.port,
            source,
        })?;

        // Nagle would sit on our 8-byte requests and stretch bus-hold time
        if let Err(e) = stream.set_nodelay(true) {
            warn!("failed to set TCP_NODELAY: {}", e);
        }

        self.stream = Some(stream);

        // let the gateway's serial side settle before the first frame
        tokio::time::sleep(Duration::from_millis(SETTLE_DELAY_MS)).await;

        info!("gateway {}:{} connected", self.host, self.port);
        Ok(())
    }

    pub fn close(&mut self) {
        self.stream = None;
    }

    /// Best-effort drain of anything already sitting in the receive buffer.
    /// A previous timed-out exchange can leave a late response behind, and a
    /// stale fragment glued onto the next reply corrupts it.
    async fn flush_pending(&mut self) {
        let mut peer_closed = false;

        if let Some(stream) = self.stream.as_mut() {
            let mut scratch = [0u8; 256];
            let mut drained = 0usize;

            while let Ok(read) = tokio::time::timeout(
                Duration::from_millis(FLUSH_READ_TIMEOUT_MS),
                stream.read(&mut scratch),
            )
            .await
            {
                match read {
                    Ok(0) | Err(_) => {
                        peer_closed = true;
                        break;
                    }
                    Ok(n) => drained += n,
                }
            }

            if drained > 0 {
                debug!("flushed {} stale bytes before send", drained);
            }
        }

        if peer_closed {
            self.close();
        }
    }

    pub async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.stream.is_none() {
            self.connect().await?;
        }

        self.flush_pending().await;

        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        if let Err(e) = stream.write_all(bytes).await {
            self.close();
            return Err(TransportError::Write(e));
        }

        Ok(())
    }

    /// Reads until exactly `len` bytes have arrived or the read timeout
    /// elapses. A short read just keeps accumulating; a timeout discards
    /// whatever partial data arrived - a half frame is worse than no frame.
    pub async fn receive_exact(&mut self, len: usize) -> Result<Vec<u8>, TransportError> {
        let deadline = tokio::time::Instant::now() + self.read_timeout;
        let mut buf = vec![0u8; len];
        let mut filled = 0usize;

        while filled < len {
            let stream = match self.stream.as_mut() {
                Some(stream) => stream,
                None => return Err(TransportError::NotConnected),
            };

            match tokio::time::timeout_at(deadline, stream.read(&mut buf[filled..])).await {
                Ok(Ok(0)) => {
                    self.close();
                    return Err(TransportError::PeerClosed);
                }
                Ok(Ok(n)) => filled += n,
                Ok(Err(e)) => {
                    self.close();
                    return Err(TransportError::Read(e));
                }
                Err(_) => {
                    self.close();
                    return Err(TransportError::ReadTimeout {
                        want: len,
                        got: filled,
                    });
                }
            }
        }

        Ok(buf)
    }
}

#[async_trait]
impl BusTransport for Gateway {
    async fn exchange(
        &mut self,
        request: &[u8],
        reply_len: usize,
    ) -> Result<Vec<u8>, TransportError> {
        self.send(request).await?;
        self.receive_exact(reply_len).await
    }

    fn disconnect(&mut self) {
        self.close();
    }
}
