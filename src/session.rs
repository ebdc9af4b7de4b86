use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context};
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use unicode_normalization::UnicodeNormalization;

use crate::config::SessionConfig;
use crate::data::{parse_pasv_reply, DataConnection};
use crate::dispatch::Dispatcher;
use crate::error::ReplyError;
use crate::events::{
    EventSink, ListenerId, ProgressData, SessionEvent, SessionEventListener,
    SessionEventNotifier, TransferAction,
};
use crate::listing::{FileEntry, ListingParser};
use crate::protocol::command::MarkExpectation;
use crate::protocol::response::Response;

const TRANSFER_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TransferType {
    Ascii,
    Image,
}

impl TransferType {
    pub fn code(&self) -> char {
        match self {
            TransferType::Ascii => 'A',
            TransferType::Image => 'I',
        }
    }
}

/// What an upload reads from.
pub enum PutSource {
    Bytes(Vec<u8>),
    /// a local file; it is stat'ed before any protocol traffic happens
    Path(PathBuf),
    /// an arbitrary stream; `size` is optional metadata that only feeds
    ///  progress reporting
    Reader {
        reader: Box<dyn AsyncRead + Send + Unpin>,
        size: Option<u64>,
    },
}

impl From<Vec<u8>> for PutSource {
    fn from(bytes: Vec<u8>) -> Self {
        PutSource::Bytes(bytes)
    }
}

impl From<PathBuf> for PutSource {
    fn from(path: PathBuf) -> Self {
        PutSource::Path(path)
    }
}

/// A long-lived FTP session: one control connection, a serialized command
///  queue, and an ephemeral passive data connection per transfer.
///
/// All operations funnel through [`Session::raw`]-style command execution;
///  the first user-visible command transparently probes server features and
///  logs in. Completion callbacks of the original callback-based design are
///  futures here; every operation resolves exactly once.
pub struct Session {
    config: Arc<SessionConfig>,
    dispatcher: Dispatcher,
    listing_parser: Arc<dyn ListingParser>,
    notifier: Arc<SessionEventNotifier>,
    events: EventSink,
    keep_alive: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Eagerly opens the control connection. Authentication happens on
    ///  demand with the first command.
    pub async fn connect(
        config: SessionConfig,
        listing_parser: Arc<dyn ListingParser>,
    ) -> anyhow::Result<Session> {
        config.validate()?;
        let config = Arc::new(config);

        let (event_tx, event_rx) = mpsc::channel(config.event_queue_size);
        let notifier = Arc::new(SessionEventNotifier::new());
        {
            let notifier = notifier.clone();
            tokio::spawn(async move { notifier.run_loop(event_rx).await });
        }
        let events = EventSink::new(event_tx);

        let dispatcher = Dispatcher::new(config.clone(), events.clone());
        dispatcher.ensure_connected().await?;

        Ok(Session {
            config,
            dispatcher,
            listing_parser,
            notifier,
            events,
            keep_alive: Mutex::new(None),
        })
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionEventListener>) -> ListenerId {
        self.notifier.add_listener(listener)
    }

    pub fn try_remove_listener(&self, id: ListenerId) -> anyhow::Result<()> {
        self.notifier.try_remove_listener(id)
    }

    /// Sends an arbitrary command; `cmd` and `args` are joined with spaces.
    pub async fn raw(&self, cmd: &str, args: &[&str]) -> anyhow::Result<Response> {
        let line = std::iter::once(cmd)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        let line = line.trim();
        if line.is_empty() {
            bail!("empty command");
        }
        self.dispatcher.execute(line, None).await
    }

    /// Explicit authentication; normally unnecessary since every operation
    ///  authenticates on demand.
    pub async fn auth(&self) -> anyhow::Result<()> {
        self.dispatcher.authenticate().await
    }

    pub fn has_feat(&self, feature: &str) -> bool {
        self.dispatcher.has_feat(feature)
    }

    /// The server's lowercased `SYST` reply, once probed.
    pub fn system(&self) -> Option<String> {
        self.dispatcher.system()
    }

    pub async fn set_type(&self, transfer_type: TransferType) -> anyhow::Result<()> {
        if self.dispatcher.transfer_type() == Some(transfer_type) {
            trace!("transfer type {:?} already set", transfer_type);
            return Ok(());
        }
        self.dispatcher
            .execute(&format!("TYPE {}", transfer_type.code()), None)
            .await?;
        self.dispatcher.set_transfer_type(transfer_type);
        Ok(())
    }

    /// Raw `LIST` output as text; the transfer is complete when the data
    ///  connection closes.
    pub async fn list(&self, path: Option<&str>) -> anyhow::Result<String> {
        let data = self.open_data_channel().await?;
        let line = match path {
            Some(path) if !path.is_empty() => format!("LIST {}", path),
            _ => "LIST".to_string(),
        };
        self.dispatcher
            .execute(&line, Some(MarkExpectation::transfer()))
            .await?;
        data.read_to_string_lossy().await
    }

    /// Starts a download and hands the data connection to the caller once
    ///  the server has accepted the transfer.
    pub async fn get(&self, remote: &str) -> anyhow::Result<DataConnection> {
        let data = self.open_data_channel().await?;
        self.dispatcher
            .execute(&format!("RETR {}", remote), Some(MarkExpectation::transfer()))
            .await?;
        Ok(data)
    }

    /// Downloads `remote` into a local file, emitting progress events.
    ///  Returns the number of bytes retrieved.
    pub async fn get_to_file(&self, remote: &str, local: impl AsRef<Path>) -> anyhow::Result<u64> {
        let mut data = self.get(remote).await?;
        let mut file = tokio::fs::File::create(local.as_ref())
            .await
            .with_context(|| format!("cannot create local file {}", local.as_ref().display()))?;

        let mut transferred = 0u64;
        let mut buf = BytesMut::with_capacity(TRANSFER_CHUNK_SIZE);
        loop {
            buf.clear();
            let n = data.read_chunk(&mut buf).await?;
            if n == 0 {
                break;
            }
            file.write_all(&buf)
                .await
                .context("error writing local file")?;
            transferred += n as u64;
            self.events.emit(SessionEvent::Progress(ProgressData {
                filename: remote.to_string(),
                action: TransferAction::Get,
                total: None,
                transferred,
            }));
        }
        file.flush().await.context("error flushing local file")?;
        debug!("retrieved {} ({} bytes)", remote, transferred);
        Ok(transferred)
    }

    /// Uploads to `to`, emitting progress events. Returns the number of
    ///  bytes stored.
    pub async fn put(&self, source: PutSource, to: &str) -> anyhow::Result<u64> {
        // stage the source first so local errors precede any wire traffic
        let (mut reader, total) = stage_put_source(source).await?;

        let mut data = self.open_data_channel().await?;
        self.dispatcher
            .execute(&format!("STOR {}", to), Some(MarkExpectation::transfer()))
            .await?;

        let mut transferred = 0u64;
        let mut buf = BytesMut::with_capacity(TRANSFER_CHUNK_SIZE);
        loop {
            buf.clear();
            let n = reader
                .read_buf(&mut buf)
                .await
                .context("error reading upload source")?;
            if n == 0 {
                break;
            }
            data.write_chunk(&buf).await?;
            transferred += n as u64;
            self.events.emit(SessionEvent::Progress(ProgressData {
                filename: to.to_string(),
                action: TransferAction::Put,
                total,
                transferred,
            }));
        }
        data.finish().await?;
        debug!("stored {} ({} bytes)", to, transferred);
        Ok(transferred)
    }

    /// Structured directory listing with NFC-normalized names.
    ///
    /// Tries `STAT` first (one round trip, no data connection); servers that
    ///  answer it with 500/502 - or Hummingbird, which mangles it - flip the
    ///  session to `LIST` for good.
    pub async fn ls(&self, path: &str) -> anyhow::Result<Vec<FileEntry>> {
        if self.dispatcher.use_list() {
            return self.ls_via_list(path).await;
        }

        let stat = self.raw("STAT", &[path]).await;
        let unsupported = match &stat {
            Err(e) => matches!(
                e.downcast_ref::<ReplyError>(),
                Some(reply) if reply.code == 500 || reply.code == 502
            ),
            Ok(_) => false,
        };
        let hummingbird = self
            .dispatcher
            .system()
            .is_some_and(|s| s.contains("hummingbird"));
        if unsupported || hummingbird {
            debug!("server cannot STAT listings, falling back to LIST");
            self.dispatcher.set_use_list();
            return self.ls_via_list(path).await;
        }

        let reply = stat?;
        Ok(self.normalized_entries(&reply.text))
    }

    async fn ls_via_list(&self, path: &str) -> anyhow::Result<Vec<FileEntry>> {
        let text = self.list(Some(path)).await?;
        Ok(self.normalized_entries(&text))
    }

    fn normalized_entries(&self, text: &str) -> Vec<FileEntry> {
        let mut entries = self.listing_parser.parse_entries(text);
        for entry in &mut entries {
            entry.name = entry.name.nfc().collect();
        }
        entries
    }

    pub async fn rename(&self, from: &str, to: &str) -> anyhow::Result<()> {
        self.dispatcher
            .execute(&format!("RNFR {}", from), None)
            .await?;
        self.dispatcher
            .execute(&format!("RNTO {}", to), None)
            .await?;
        Ok(())
    }

    /// Starts (or replaces) a recurring `NOOP` to keep the control
    ///  connection from idling out server-side.
    pub fn keep_alive(&self, interval: Option<Duration>) {
        let interval = interval.unwrap_or(self.config.keep_alive_interval);
        let dispatcher = self.dispatcher.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // the first tick fires immediately
            loop {
                ticker.tick().await;
                if let Err(e) = dispatcher.execute("NOOP", None).await {
                    debug!("keep-alive NOOP failed: {:#}", e);
                }
            }
        });
        if let Some(previous) = self.keep_alive.lock().unwrap().replace(handle) {
            previous.abort();
        }
    }

    /// Tears the session down: stops the keep-alive timer, closes sockets,
    ///  fails pending commands, forgets features and login state. The
    ///  session object stays usable - the next command reconnects.
    pub async fn destroy(&self) {
        if let Some(timer) = self.keep_alive.lock().unwrap().take() {
            timer.abort();
        }
        self.dispatcher.shutdown().await;
    }

    /// A fresh `PASV` + data socket for one transfer.
    async fn open_data_channel(&self) -> anyhow::Result<DataConnection> {
        let guard = self.dispatcher.acquire_passive_slot()?;
        let reply = self.dispatcher.execute("PASV", None).await?;
        let (host, port) = parse_pasv_reply(&reply.text)?;
        DataConnection::open(&host, port, self.config.timeout, self.events.clone(), guard).await
    }
}

async fn stage_put_source(
    source: PutSource,
) -> anyhow::Result<(Box<dyn AsyncRead + Send + Unpin>, Option<u64>)> {
    match source {
        PutSource::Bytes(bytes) => {
            let len = bytes.len() as u64;
            Ok((Box::new(std::io::Cursor::new(bytes)), Some(len)))
        }
        PutSource::Path(path) => {
            let metadata = match tokio::fs::metadata(&path).await {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    bail!("Local file doesn't exist.")
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("cannot stat local file {}", path.display()))
                }
            };
            if metadata.is_dir() {
                bail!("Local path cannot be a directory");
            }
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("cannot open local file {}", path.display()))?;
            Ok((Box::new(file), Some(metadata.len())))
        }
        PutSource::Reader { reader, size } => Ok((reader, size)),
    }
}
