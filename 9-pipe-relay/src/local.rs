//! Unix-domain-socket channel used by the binary.
//!
//! Each peer connection gets a reader task that splits the byte stream into
//! newline-delimited messages and parks them in a per-peer inbox, so
//! readability checks never touch the socket. Data arrival is signalled with
//! [`Notify`] rather than polled.
//!
//! Closing the channel cancels writes that are stuck on a peer which stopped
//! reading; they fail with [`io::ErrorKind::BrokenPipe`].

use std::{
    collections::{BTreeMap, VecDeque},
    io,
    os::unix::fs::FileTypeExt,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{
        UnixListener, UnixStream,
        unix::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::{Mutex, Notify, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::channel::{Connector, DuplexChannel, PeerId, UPSTREAM};

/// Largest message a peer may send or receive, excluding the line break.
pub const MAX_MESSAGE_BYTES: usize = 4096;

/// Maps an endpoint name to its socket path. Names that already look like a
/// path are used as-is; bare names live in the temp directory.
pub fn endpoint_path(name: &str) -> PathBuf {
    if name.contains('/') || name.contains(std::path::MAIN_SEPARATOR) {
        PathBuf::from(name)
    } else {
        std::env::temp_dir().join(format!("{name}.pipe"))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalSocket;

impl LocalSocket {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for LocalSocket {
    type Channel = LocalChannel;

    async fn bind(&self, name: &str) -> io::Result<LocalChannel> {
        let path = endpoint_path(name);
        clear_stale_socket(&path).await?;
        let listener = UnixListener::bind(&path)?;
        info!(path = %path.display(), "accepting peers");

        let shared = Arc::new(Shared::new());
        let accept = tokio::spawn(accept_peers(listener, Arc::clone(&shared)));
        shared.track(accept).await;

        Ok(LocalChannel {
            shared,
            socket_path: Some(path),
        })
    }

    async fn connect(&self, name: &str) -> io::Result<LocalChannel> {
        let path = endpoint_path(name);
        let stream = UnixStream::connect(&path).await.map_err(|err| {
            io::Error::new(
                err.kind(),
                format!("failed to connect to {}: {err}", path.display()),
            )
        })?;
        info!(path = %path.display(), "connected to relay endpoint");

        let shared = Arc::new(Shared::new());
        shared.attach(UPSTREAM, stream).await;

        Ok(LocalChannel {
            shared,
            socket_path: None,
        })
    }
}

/// Removes a socket file left behind by a dead server. Anything that is not a
/// socket is left alone.
async fn clear_stale_socket(path: &Path) -> io::Result<()> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    if !metadata.file_type().is_socket() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a socket", path.display()),
        ));
    }
    if UnixStream::connect(path).await.is_ok() {
        return Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("{} already has a listener", path.display()),
        ));
    }
    debug!(path = %path.display(), "removing stale socket file");
    tokio::fs::remove_file(path).await
}

pub struct LocalChannel {
    shared: Arc<Shared>,
    socket_path: Option<PathBuf>,
}

struct Shared {
    peers: Mutex<BTreeMap<PeerId, Arc<PeerLink>>>,
    data_ready: Notify,
    closed: watch::Sender<bool>,
    next_peer: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct PeerLink {
    inbox: Mutex<VecDeque<String>>,
    readable: Notify,
    open: AtomicBool,
    writer: Mutex<OwnedWriteHalf>,
}

impl Shared {
    fn new() -> Self {
        Self {
            peers: Mutex::new(BTreeMap::new()),
            data_ready: Notify::new(),
            closed: watch::Sender::new(false),
            // Accepted peers never collide with UPSTREAM.
            next_peer: AtomicU64::new(UPSTREAM + 1),
            tasks: Mutex::new(Vec::new()),
        }
    }

    async fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }

    async fn attach(self: &Arc<Self>, id: PeerId, stream: UnixStream) {
        let (reader, writer) = stream.into_split();
        let link = Arc::new(PeerLink {
            inbox: Mutex::new(VecDeque::new()),
            readable: Notify::new(),
            open: AtomicBool::new(true),
            writer: Mutex::new(writer),
        });
        self.peers.lock().await.insert(id, Arc::clone(&link));

        let pump = tokio::spawn(pump_messages(reader, link, Arc::clone(self)));
        self.track(pump).await;
    }

    async fn link(&self, peer: PeerId) -> io::Result<Arc<PeerLink>> {
        self.peers.lock().await.get(&peer).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotConnected,
                format!("peer {peer} is not connected"),
            )
        })
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once `close` has been called.
    async fn closing(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

fn channel_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "channel is closed")
}

fn oversized(len: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("message of {len} bytes exceeds the {MAX_MESSAGE_BYTES} byte limit"),
    )
}

impl PeerLink {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn has_pending(&self) -> bool {
        !self.inbox.lock().await.is_empty()
    }
}

async fn accept_peers(listener: UnixListener, shared: Arc<Shared>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let id = shared.next_peer.fetch_add(1, Ordering::Relaxed);
                info!(peer = id, "peer connected");
                shared.attach(id, stream).await;
            }
            Err(err) => warn!(error = %err, "failed to accept peer"),
        }
    }
}

async fn pump_messages(reader: OwnedReadHalf, link: Arc<PeerLink>, shared: Arc<Shared>) {
    let mut reader = BufReader::new(reader);
    loop {
        match next_message(&mut reader).await {
            Ok(Some(line)) => {
                if line.is_empty() {
                    continue;
                }
                link.inbox.lock().await.push_back(line);
                link.readable.notify_one();
                shared.data_ready.notify_one();
            }
            Ok(None) => break,
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                warn!(error = %err, "dropping peer that sent an unreadable message");
                break;
            }
            Err(err) => {
                debug!(error = %err, "peer stream failed");
                break;
            }
        }
    }

    link.open.store(false, Ordering::Release);
    link.readable.notify_one();
    shared.data_ready.notify_one();
}

/// Reads one line, never buffering more than [`MAX_MESSAGE_BYTES`] plus the
/// line break. A final line without a break still counts.
async fn next_message(reader: &mut BufReader<OwnedReadHalf>) -> io::Result<Option<String>> {
    let mut buf = Vec::new();
    let read = reader
        .take(MAX_MESSAGE_BYTES as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await?;
    if read == 0 {
        return Ok(None);
    }

    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    } else if buf.len() > MAX_MESSAGE_BYTES {
        return Err(oversized(buf.len()));
    }

    String::from_utf8(buf)
        .map(Some)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

#[async_trait]
impl DuplexChannel for LocalChannel {
    async fn peers(&self) -> Vec<PeerId> {
        let mut peers = self.shared.peers.lock().await;

        let mut dead = Vec::new();
        for (id, link) in peers.iter() {
            if !link.is_open() && !link.has_pending().await {
                dead.push(*id);
            }
        }
        for id in dead {
            debug!(peer = id, "dropping disconnected peer");
            peers.remove(&id);
        }

        peers.keys().copied().collect()
    }

    async fn wait_for_data(&self) -> io::Result<()> {
        loop {
            let notified = self.shared.data_ready.notified();
            if self.shared.is_closed() {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "channel is closed",
                ));
            }

            let links: Vec<_> = self.shared.peers.lock().await.values().cloned().collect();
            for link in links {
                if link.has_pending().await {
                    return Ok(());
                }
            }

            notified.await;
        }
    }

    async fn can_read(&self, peer: PeerId) -> bool {
        match self.shared.link(peer).await {
            Ok(link) => link.has_pending().await,
            Err(_) => false,
        }
    }

    async fn is_open(&self, peer: PeerId) -> bool {
        match self.shared.link(peer).await {
            Ok(link) => link.is_open(),
            Err(_) => false,
        }
    }

    async fn read(&self, peer: PeerId) -> io::Result<Option<String>> {
        let link = self.shared.link(peer).await?;
        loop {
            let notified = link.readable.notified();
            if let Some(message) = link.inbox.lock().await.pop_front() {
                return Ok(Some(message));
            }
            if !link.is_open() || self.shared.is_closed() {
                return Ok(None);
            }
            notified.await;
        }
    }

    async fn write(&self, peer: PeerId, message: &str) -> io::Result<()> {
        if message.contains('\n') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "messages must not contain line breaks",
            ));
        }
        if message.len() > MAX_MESSAGE_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                oversized(message.len()).to_string(),
            ));
        }

        let link = self.shared.link(peer).await?;
        if !link.is_open() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("peer {peer} hung up"),
            ));
        }

        let mut framed = String::with_capacity(message.len() + 1);
        framed.push_str(message);
        framed.push('\n');

        // A peer that stops reading would otherwise hold the write forever.
        select! {
            result = async {
                let mut writer = link.writer.lock().await;
                writer.write_all(framed.as_bytes()).await?;
                writer.flush().await
            } => result,
            _ = self.shared.closing() => Err(channel_closed()),
        }
    }

    async fn close(&self) -> io::Result<()> {
        self.shared.closed.send_replace(true);

        for task in self.shared.tasks.lock().await.drain(..) {
            task.abort();
        }

        let peers = std::mem::take(&mut *self.shared.peers.lock().await);
        for (id, link) in peers {
            link.open.store(false, Ordering::Release);
            link.readable.notify_one();
            // A busy writer belongs to a write that is being cancelled; the
            // stream shuts down when that write drops the link.
            let Ok(mut writer) = link.writer.try_lock() else {
                debug!(peer = id, "peer writer busy, leaving it to the cancelled write");
                continue;
            };
            if let Err(err) = writer.shutdown().await {
                debug!(peer = id, error = %err, "failed to shut down peer writer");
            }
        }

        self.shared.data_ready.notify_waiters();
        self.shared.data_ready.notify_one();

        if let Some(path) = &self.socket_path {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }
}

impl Drop for LocalChannel {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.shared.tasks.try_lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}
