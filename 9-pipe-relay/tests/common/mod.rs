#![allow(dead_code)]

use std::{
    collections::VecDeque,
    io,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use pipe_relay::channel::{Connector, DuplexChannel, PeerId};
use tokio::{io::AsyncWrite, time::timeout};

/// Something observable that happened on a scripted channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Write { peer: PeerId, payload: String },
    Emit(String),
}

/// In-memory channel whose peers, inbound traffic, and failures are set up by
/// the test. Clones share state, so a test can keep one to inspect what a
/// session did with the other.
#[derive(Clone, Default)]
pub struct Scripted {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    peers: Vec<ScriptedPeer>,
    events: Vec<Event>,
    opened: Vec<String>,
    stalled_writes: usize,
    closed: bool,
}

struct ScriptedPeer {
    id: PeerId,
    inbound: VecDeque<io::Result<String>>,
    fail_writes: bool,
    stall_writes: bool,
    hung_up: bool,
}

impl Scripted {
    pub fn with_peers(ids: &[PeerId]) -> Self {
        let scripted = Self::default();
        for id in ids {
            scripted.add_peer(*id);
        }
        scripted
    }

    pub fn add_peer(&self, id: PeerId) {
        self.state.lock().unwrap().peers.push(ScriptedPeer {
            id,
            inbound: VecDeque::new(),
            fail_writes: false,
            stall_writes: false,
            hung_up: false,
        });
    }

    pub fn queue_inbound(&self, peer: PeerId, message: &str) {
        self.with_peer(peer, |p| p.inbound.push_back(Ok(message.to_string())));
    }

    pub fn queue_read_error(&self, peer: PeerId) {
        self.with_peer(peer, |p| {
            p.inbound
                .push_back(Err(io::Error::new(io::ErrorKind::Other, "scripted read failure")))
        });
    }

    pub fn set_fail_writes(&self, peer: PeerId, fail: bool) {
        self.with_peer(peer, |p| p.fail_writes = fail);
    }

    /// Writes to `peer` block until the channel is closed, like a peer that
    /// stopped reading.
    pub fn set_stall_writes(&self, peer: PeerId, stall: bool) {
        self.with_peer(peer, |p| p.stall_writes = stall);
    }

    pub fn hang_up(&self, peer: PeerId) {
        self.with_peer(peer, |p| p.hung_up = true);
    }

    pub fn record_emit(&self, line: String) {
        self.state.lock().unwrap().events.push(Event::Emit(line));
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn writes(&self) -> Vec<(PeerId, String)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Write { peer, payload } => Some((peer, payload)),
                Event::Emit(_) => None,
            })
            .collect()
    }

    pub fn opened(&self) -> Vec<String> {
        self.state.lock().unwrap().opened.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Polls until at least `count` writes were recorded.
    pub async fn wait_for_writes(&self, count: usize) -> Vec<(PeerId, String)> {
        timeout(Duration::from_secs(5), async {
            loop {
                let writes = self.writes();
                if writes.len() >= count {
                    return writes;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("expected {count} writes, saw {:?}", self.writes()))
    }

    /// Polls until at least `count` writes are blocked on a stalled peer.
    pub async fn wait_for_stalled_writes(&self, count: usize) {
        timeout(Duration::from_secs(5), async {
            while self.state.lock().unwrap().stalled_writes < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("expected {count} stalled writes"))
    }

    /// Output sink that records into this channel's event log.
    pub fn sink(&self) -> EventSink {
        EventSink {
            channel: self.clone(),
        }
    }

    fn with_peer(&self, peer: PeerId, update: impl FnOnce(&mut ScriptedPeer)) {
        let mut state = self.state.lock().unwrap();
        let peer = state
            .peers
            .iter_mut()
            .find(|p| p.id == peer)
            .unwrap_or_else(|| panic!("no scripted peer {peer}"));
        update(peer);
    }

    fn begin_stalled_write(&self, peer: PeerId) -> bool {
        let mut state = self.state.lock().unwrap();
        let stalls = state.peers.iter().any(|p| p.id == peer && p.stall_writes);
        if stalls {
            state.stalled_writes += 1;
        }
        stalls
    }

    fn open(&self, name: &str) -> Self {
        self.state.lock().unwrap().opened.push(name.to_string());
        self.clone()
    }
}

#[async_trait]
impl Connector for Scripted {
    type Channel = Scripted;

    async fn bind(&self, name: &str) -> io::Result<Scripted> {
        Ok(self.open(name))
    }

    async fn connect(&self, name: &str) -> io::Result<Scripted> {
        Ok(self.open(name))
    }
}

#[async_trait]
impl DuplexChannel for Scripted {
    async fn peers(&self) -> Vec<PeerId> {
        self.state
            .lock()
            .unwrap()
            .peers
            .iter()
            .filter(|p| !(p.hung_up && p.inbound.is_empty()))
            .map(|p| p.id)
            .collect()
    }

    async fn wait_for_data(&self) -> io::Result<()> {
        loop {
            {
                let state = self.state.lock().unwrap();
                if state.closed {
                    return Err(io::Error::new(io::ErrorKind::NotConnected, "closed"));
                }
                if state.peers.iter().any(|p| !p.inbound.is_empty()) {
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn can_read(&self, peer: PeerId) -> bool {
        self.state
            .lock()
            .unwrap()
            .peers
            .iter()
            .any(|p| p.id == peer && !p.inbound.is_empty())
    }

    async fn is_open(&self, peer: PeerId) -> bool {
        self.state
            .lock()
            .unwrap()
            .peers
            .iter()
            .any(|p| p.id == peer && !p.hung_up)
    }

    async fn read(&self, peer: PeerId) -> io::Result<Option<String>> {
        let mut state = self.state.lock().unwrap();
        let peer = state.peers.iter_mut().find(|p| p.id == peer);
        match peer.and_then(|p| p.inbound.pop_front()) {
            Some(result) => result.map(Some),
            None => Ok(None),
        }
    }

    async fn write(&self, peer: PeerId, message: &str) -> io::Result<()> {
        if self.begin_stalled_write(peer) {
            while !self.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed mid-write"));
        }

        let mut state = self.state.lock().unwrap();
        let failing = state
            .peers
            .iter()
            .any(|p| p.id == peer && p.fail_writes);
        if failing {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "scripted write failure"));
        }
        state.events.push(Event::Write {
            peer,
            payload: message.to_string(),
        });
        Ok(())
    }

    async fn close(&self) -> io::Result<()> {
        self.state.lock().unwrap().closed = true;
        Ok(())
    }
}

pub struct EventSink {
    channel: Scripted,
}

impl AsyncWrite for EventSink {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.channel
            .record_emit(String::from_utf8_lossy(buf).into_owned());
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
