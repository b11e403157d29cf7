use std::time::Duration;
use thiserror::Error;

/// Failures at the TCP/gateway layer. Every variant leaves the connection
/// closed so the next operation starts from a clean reconnect.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {host}:{port} failed: {source}")]
    Connect {
        host: String,
        port: u16,
        source: std::io::Error,
    },

    #[error("connect to {host}:{port} timed out after {timeout:?}")]
    ConnectTimeout {
        host: String,
        port: u16,
        timeout: Duration,
    },

    #[error("not connected")]
    NotConnected,

    #[error("write failed: {0}")]
    Write(#[source] std::io::Error),

    #[error("read failed: {0}")]
    Read(#[source] std::io::Error),

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("timed out with {got} of {want} bytes")]
    ReadTimeout { want: usize, got: usize },
}

/// A response that cannot be trusted. Wrong length or bad checksum both
/// discard the whole frame; nothing is ever decoded from a partial match.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("bad response length: got {got}, want {want}")]
    Length { want: usize, got: usize },

    #[error("checksum mismatch: computed {computed:#04x}, frame carries {found:#04x}")]
    Checksum { computed: u8, found: u8 },
}
