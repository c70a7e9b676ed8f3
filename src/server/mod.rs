use std::io::ErrorKind;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use memchr::memchr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::stats::Scope;

/// Statsd ingest listeners. Every complete line is trimmed of its
/// newline and handed to the relay task over the line channel.
pub struct IngestServer {
    cfg: ServerConfig,
    stats: Scope,
}

impl IngestServer {
    pub fn new(cfg: ServerConfig, stats: Scope) -> Self {
        Self { cfg, stats }
    }

    /// Binds the configured listeners and spawns their tasks.
    pub async fn start(
        &self,
        lines: mpsc::Sender<Bytes>,
        cancel: CancellationToken,
    ) -> Result<()> {
        if !self.cfg.udp_bind.is_empty() {
            let socket = UdpSocket::bind(&self.cfg.udp_bind)
                .await
                .with_context(|| format!("binding udp listener on {}", self.cfg.udp_bind))?;
            info!(addr = %self.cfg.udp_bind, "statsd udp server running");

            let stats = self.stats.scope("udp");
            let incoming_bytes = stats.counter("incoming_bytes")?;
            let processed_lines = stats.counter("lines")?;
            let dropped_lines = stats.counter("dropped_lines")?;
            let tx = lines.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                udp_worker(socket, tx, incoming_bytes, processed_lines, dropped_lines, cancel)
                    .await;
            });
        }

        if !self.cfg.tcp_bind.is_empty() {
            let listener = TcpListener::bind(&self.cfg.tcp_bind)
                .await
                .with_context(|| format!("binding tcp listener on {}", self.cfg.tcp_bind))?;
            info!(addr = %self.cfg.tcp_bind, "statsd tcp server running");

            let stats = self.stats.scope("tcp");
            let cfg = self.cfg.clone();
            tokio::spawn(async move {
                tcp_worker(listener, cfg, stats, lines, cancel).await;
            });
        }

        Ok(())
    }
}

/// Splits complete `\n`-terminated lines out of `buf`, tolerating `\r\n`.
/// Whatever trails the last newline stays in the buffer.
fn drain_lines(buf: &mut BytesMut) -> Vec<Bytes> {
    let mut out = Vec::new();
    while let Some(newline) = memchr(b'\n', buf) {
        let mut line = buf.split_to(newline + 1);
        if line.len() >= 2 && line[line.len() - 2] == b'\r' {
            line.truncate(line.len() - 2);
        } else {
            line.truncate(line.len() - 1);
        }
        if !line.is_empty() {
            out.push(line.freeze());
        }
    }
    out
}

async fn udp_worker(
    socket: UdpSocket,
    tx: mpsc::Sender<Bytes>,
    incoming_bytes: crate::stats::Counter,
    processed_lines: crate::stats::Counter,
    dropped_lines: crate::stats::Counter,
    cancel: CancellationToken,
) {
    let mut raw = vec![0u8; 65536];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut raw) => match result {
                Ok((size, _remote)) => {
                    incoming_bytes.inc_by(size as f64);
                    let mut buf = BytesMut::from(&raw[..size]);
                    let mut batch = drain_lines(&mut buf);
                    // A datagram tail without a newline is still a line.
                    if !buf.is_empty() {
                        batch.push(buf.freeze());
                    }
                    processed_lines.inc_by(batch.len() as f64);
                    for line in batch {
                        // The transport is lossy; prefer dropping to
                        // stalling the socket when the relay lags.
                        if tx.try_send(line).is_err() {
                            dropped_lines.inc();
                        }
                    }
                }
                Err(e) => warn!(error = %e, "udp receive error"),
            }
        }
    }
    info!("statsd udp server stopped");
}

async fn tcp_worker(
    listener: TcpListener,
    cfg: ServerConfig,
    stats: Scope,
    lines: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
) {
    let accepts = match stats.counter("accepts") {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "tcp stats unavailable");
            return;
        }
    };
    let accept_failures = stats.counter("accept_failures").ok();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("statsd tcp server stopped");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    debug!(%peer, "accepted connection");
                    accepts.inc();
                    let conn_stats = stats.scope("connections");
                    let tx = lines.clone();
                    let cancel = cancel.clone();
                    let read_buffer = cfg.read_buffer;
                    let read_timeout = cfg.tcp_read_timeout;
                    tokio::spawn(async move {
                        client_handler(conn_stats, socket, tx, cancel, read_buffer, read_timeout)
                            .await;
                    });
                }
                Err(e) => {
                    if let Some(failures) = &accept_failures {
                        failures.inc();
                    }
                    info!(error = %e, "accept error");
                }
            }
        }
    }
}

async fn client_handler(
    stats: Scope,
    mut socket: TcpStream,
    tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    read_buffer: usize,
    read_timeout: Duration,
) {
    let peer = format!("{:?}", socket.peer_addr());
    let incoming_bytes = stats.counter("incoming_bytes").ok();
    let processed_lines = stats.counter("lines").ok();
    let disconnects = stats.counter("disconnects").ok();

    let mut buf = BytesMut::with_capacity(read_buffer);

    loop {
        if buf.remaining_mut() < read_buffer {
            buf.reserve(read_buffer);
        }
        let result = tokio::select! {
            r = timeout(read_timeout, socket.read_buf(&mut buf)) => {
                match r {
                    Err(_elapsed) => Err(std::io::Error::new(ErrorKind::TimedOut, "read timeout")),
                    Ok(Err(e)) => Err(e),
                    Ok(Ok(n)) => Ok(n),
                }
            },
            _ = cancel.cancelled() => Err(std::io::Error::new(ErrorKind::Other, "shutting down")),
        };

        match result {
            Ok(0) => {
                // EOF: everything buffered is final, newline or not.
                let mut batch = drain_lines(&mut buf);
                if !buf.is_empty() {
                    batch.push(buf.split().freeze());
                }
                if let Some(c) = &processed_lines {
                    c.inc_by(batch.len() as f64);
                }
                for line in batch {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                debug!(peer = %peer, "closing reader");
                break;
            }
            Ok(n) => {
                if let Some(c) = &incoming_bytes {
                    c.inc_by(n as f64);
                }
                let batch = drain_lines(&mut buf);
                if let Some(c) = &processed_lines {
                    c.inc_by(batch.len() as f64);
                }
                for line in batch {
                    if tx.send(line).await.is_err() {
                        debug!(peer = %peer, "relay channel closed");
                        return;
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::Other => {
                let _ = timeout(
                    Duration::from_secs(1),
                    socket.write_all(b"server closing due to shutdown, goodbye\n"),
                )
                .await;
                break;
            }
            Err(e) if e.kind() == ErrorKind::TimedOut => {
                debug!(peer = %peer, "read timeout, closing");
                break;
            }
            Err(e) => {
                debug!(error = %e, peer = %peer, "socket error");
                break;
            }
        }
    }
    if let Some(c) = &disconnects {
        c.inc();
    }
}
