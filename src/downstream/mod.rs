use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tracing::warn;

use crate::proto::MAX_LINE_LENGTH;

/// Packs relayed lines into newline-joined datagrams toward the
/// downstream collector, never exceeding the classic statsd datagram
/// budget.
pub struct UdpForwarder {
    socket: UdpSocket,
    pending: Vec<u8>,
}

impl UdpForwarder {
    pub async fn connect(endpoint: &str) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("binding forwarder socket")?;
        socket
            .connect(endpoint)
            .await
            .with_context(|| format!("connecting to downstream {endpoint}"))?;

        Ok(Self {
            socket,
            pending: Vec::with_capacity(MAX_LINE_LENGTH),
        })
    }

    /// Queues one line, sending the pending datagram first when the line
    /// would not fit alongside it.
    pub async fn push(&mut self, line: &[u8]) -> Result<()> {
        if line.is_empty() {
            return Ok(());
        }
        if line.len() > MAX_LINE_LENGTH {
            warn!(len = line.len(), "dropping oversized line");
            return Ok(());
        }

        if !self.pending.is_empty() && self.pending.len() + 1 + line.len() > MAX_LINE_LENGTH {
            self.flush().await?;
        }
        if !self.pending.is_empty() {
            self.pending.push(b'\n');
        }
        self.pending.extend_from_slice(line);
        Ok(())
    }

    /// Sends the pending datagram, if any. The buffer is surrendered even
    /// when the send fails; the transport is lossy by design.
    pub async fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let sent = self.socket.send(&self.pending).await;
        self.pending.clear();
        sent.context("sending datagram downstream")?;
        Ok(())
    }

    /// Bytes currently waiting for the next datagram.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
