use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use bytes::BytesMut;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::events::{EventSink, SessionEvent};

const DATA_CHUNK_SIZE: usize = 64 * 1024;

/// The host/port shape inside a `227 Entering Passive Mode (...)` reply.
///  Servers disagree wildly on the surrounding text, so only the six
///  comma-separated numbers are matched.
static PASV_SHAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([-\d]+,[-\d]+,[-\d]+,[-\d]+),([-\d]+),([-\d]+)").expect("valid literal regex")
});

/// Extracts the data endpoint from a PASV reply text.
pub(crate) fn parse_pasv_reply(text: &str) -> anyhow::Result<(String, u16)> {
    let caps = PASV_SHAPE
        .captures(text)
        .ok_or_else(|| anyhow!("Bad passive host/port combination"))?;
    let host = caps[1].replace(',', ".");
    let p1 = caps[2]
        .parse::<i64>()
        .map_err(|_| anyhow!("Bad passive host/port combination"))?;
    let p2 = caps[3]
        .parse::<i64>()
        .map_err(|_| anyhow!("Bad passive host/port combination"))?;
    let port = ((p1 & 255) * 256 + (p2 & 255)) as u16;
    Ok((host, port))
}

/// Claim on the session's single passive transfer slot, released on drop so
///  every exit path (including errors before the transfer command) frees it.
#[derive(Debug)]
pub struct PasvGuard {
    active: Arc<AtomicBool>,
}

impl PasvGuard {
    pub(crate) fn try_acquire(active: &Arc<AtomicBool>) -> anyhow::Result<PasvGuard> {
        if active.swap(true, Ordering::SeqCst) {
            bail!("passive data connection already in progress");
        }
        Ok(PasvGuard {
            active: active.clone(),
        })
    }
}

impl Drop for PasvGuard {
    fn drop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

/// An ephemeral passive-mode data connection.
///
/// All traffic is bounded by the session's idle timeout: a stalled socket is
///  shut down, reported via [`SessionEvent::Timeout`] and the pending
///  operation fails. The transfer as a whole completes when this connection
///  reaches EOF / is finished, never on the control connection's terminal
///  reply.
#[derive(Debug)]
pub struct DataConnection {
    stream: TcpStream,
    idle_timeout: Duration,
    events: EventSink,
    _guard: PasvGuard,
}

impl DataConnection {
    pub(crate) async fn open(
        host: &str,
        port: u16,
        idle_timeout: Duration,
        events: EventSink,
        guard: PasvGuard,
    ) -> anyhow::Result<DataConnection> {
        debug!("opening passive data connection to {}:{}", host, port);
        let stream = match TcpStream::connect((host, port)).await {
            Ok(stream) => stream,
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                return Err(anyhow::Error::new(e).context(
                    "data connection refused - probably trying a PASV operation while one is in progress",
                ));
            }
            Err(e) => {
                return Err(anyhow::Error::new(e))
                    .with_context(|| format!("cannot open data connection to {}:{}", host, port));
            }
        };
        Ok(DataConnection {
            stream,
            idle_timeout,
            events,
            _guard: guard,
        })
    }

    /// Reads one chunk, appending to `buf`; 0 means EOF (transfer done).
    pub async fn read_chunk(&mut self, buf: &mut BytesMut) -> anyhow::Result<usize> {
        match tokio::time::timeout(self.idle_timeout, self.stream.read_buf(buf)).await {
            Err(_elapsed) => Err(self.on_idle_timeout().await),
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => Err(e).context("error reading from the data connection"),
        }
    }

    pub async fn write_chunk(&mut self, data: &[u8]) -> anyhow::Result<()> {
        match tokio::time::timeout(self.idle_timeout, self.stream.write_all(data)).await {
            Err(_elapsed) => Err(self.on_idle_timeout().await),
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e).context("error writing to the data connection"),
        }
    }

    async fn on_idle_timeout(&mut self) -> anyhow::Error {
        warn!(
            "passive data connection idle for {:?}, ending it",
            self.idle_timeout
        );
        let _ = self.stream.shutdown().await;
        self.events.emit(SessionEvent::Timeout);
        anyhow!("Passive socket timeout")
    }

    /// Drains the connection until the server closes it.
    pub async fn read_to_end(mut self) -> anyhow::Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(DATA_CHUNK_SIZE);
        loop {
            if self.read_chunk(&mut buf).await? == 0 {
                return Ok(buf.to_vec());
            }
        }
    }

    pub async fn read_to_string_lossy(self) -> anyhow::Result<String> {
        let bytes = self.read_to_end().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Ends the write side; for uploads this is what makes the server see
    ///  EOF and emit its terminal reply.
    pub async fn finish(mut self) -> anyhow::Result<()> {
        self.stream
            .shutdown()
            .await
            .context("error closing the data connection")?;
        Ok(())
    }
}
