use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::events::{EventSink, SessionEvent};
use crate::protocol::parser::ResponseParser;
use crate::protocol::response::Response;

const READ_BUFFER_SIZE: usize = 8 * 1024;
const RESPONSE_QUEUE_SIZE: usize = 32;

/// Owns the TCP control connection: a writer handle for framed command
///  lines, and a spawned read loop that pipes socket bytes through a fresh
///  [`ResponseParser`] into the returned channel. Writer and response stream
///  are deliberately two separate objects - the dispatcher consumes the
///  stream, everything else only ever writes.
pub struct ControlChannel {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    open: Arc<AtomicBool>,
    read_task: JoinHandle<()>,
}

impl ControlChannel {
    pub async fn connect(
        host: &str,
        port: u16,
        idle_timeout: Duration,
        events: EventSink,
    ) -> anyhow::Result<(ControlChannel, tokio::sync::mpsc::Receiver<Response>)> {
        let stream = TcpStream::connect((host, port))
            .await
            .with_context(|| format!("cannot connect to {}:{}", host, port))?;
        debug!("control connection established to {}:{}", host, port);

        let (read_half, write_half) = stream.into_split();
        let open = Arc::new(AtomicBool::new(true));
        let (tx, rx) = tokio::sync::mpsc::channel(RESPONSE_QUEUE_SIZE);

        let read_task = tokio::spawn(read_loop(
            read_half,
            idle_timeout,
            events.clone(),
            tx,
            open.clone(),
        ));
        events.emit(SessionEvent::Connect);

        Ok((
            ControlChannel {
                writer: tokio::sync::Mutex::new(write_half),
                open,
                read_task,
            },
            rx,
        ))
    }

    /// Writes `line` followed by CRLF. An empty line is a no-op.
    pub async fn send(&self, line: &str) -> anyhow::Result<()> {
        if line.is_empty() {
            return Ok(());
        }
        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .context("error writing to the control connection")?;
        writer
            .write_all(b"\r\n")
            .await
            .context("error writing to the control connection")?;
        writer
            .flush()
            .await
            .context("error flushing the control connection")?;
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.read_task.is_finished()
    }

    /// Tears the connection down: the read loop (and with it the parser
    ///  instance) is terminated, the write half is shut down.
    pub async fn shutdown(self) {
        self.read_task.abort();
        self.open.store(false, Ordering::SeqCst);
        let mut writer = self.writer.into_inner();
        let _ = writer.shutdown().await;
    }
}

async fn read_loop(
    mut read_half: OwnedReadHalf,
    idle_timeout: Duration,
    events: EventSink,
    responses: tokio::sync::mpsc::Sender<Response>,
    open: Arc<AtomicBool>,
) {
    let mut parser = ResponseParser::new();
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

    loop {
        match tokio::time::timeout(idle_timeout, read_half.read_buf(&mut buf)).await {
            Err(_elapsed) => {
                // the server owns the idle policy - report, don't close
                debug!("control connection idle for {:?}", idle_timeout);
                events.emit(SessionEvent::Timeout);
            }
            Ok(Ok(0)) => {
                debug!("control connection closed by the server");
                break;
            }
            Ok(Ok(_)) => {
                let parsed = parser.feed(&buf);
                buf.clear();
                for response in parsed {
                    trace!("received response: {} {:?}", response.code, response.text);
                    events.emit(SessionEvent::Data(response.clone()));
                    if responses.send(response).await.is_err() {
                        // dispatcher is gone, nothing left to pair replies with
                        open.store(false, Ordering::SeqCst);
                        return;
                    }
                }
            }
            Ok(Err(e)) => {
                warn!("control connection error: {}", e);
                events.emit(SessionEvent::Error(e.to_string()));
                break;
            }
        }
    }
    open.store(false, Ordering::SeqCst);
}
