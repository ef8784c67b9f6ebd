//! Transport session: one live byte-stream connection to one endpoint.
//!
//! A session is never reused across reconnects; the connection driver always
//! constructs a fresh session for each attempt.

use crate::error::{ClientError, Result};
use crate::server_pool::ServerUrl;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// A live connection to a single broker endpoint
#[derive(Debug)]
pub(crate) struct Session {
    stream: TcpStream,
    open: bool,
}

impl Session {
    /// Open a byte-stream connection to `url` within `deadline`
    pub async fn connect(url: &ServerUrl, deadline: std::time::Duration) -> Result<Self> {
        let addr = url.addr();
        let stream = tokio::time::timeout(deadline, TcpStream::connect(&addr))
            .await
            .map_err(|_| ClientError::transport(format!("connect to {addr} timed out")))?
            .map_err(|e| ClientError::transport(format!("connect to {addr} failed: {e}")))?;
        let _ = stream.set_nodelay(true);
        debug!(server = %addr, "transport session established");
        Ok(Self { stream, open: true })
    }

    /// Read available bytes into `buf`; returns 0 on EOF
    pub async fn read_into(&mut self, buf: &mut BytesMut) -> Result<usize> {
        let n = self.stream.read_buf(buf).await?;
        Ok(n)
    }

    /// Write all of `bytes`, retrying partial writes
    pub async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    /// Close the session; idempotent
    pub async fn shutdown(&mut self) {
        if self.open {
            self.open = false;
            let _ = self.stream.shutdown().await;
            debug!("transport session closed");
        }
    }
}
