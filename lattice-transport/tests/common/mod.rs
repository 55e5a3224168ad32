//! In-memory transport and consensus stubs shared by the integration
//! tests. The transport keeps a process-wide registry of listeners keyed
//! by address; dialing hands the listener one half of a paired client.
//! Closing either half unblocks both, like a real stream transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use lattice_transport::{
    AuthToken, CacheStore, Client, Frame, Listener, MokaStore, NetworkMessage, NodeId, PeerHost,
    SyncHandle, Transport, TransportConfig, MSG_AUTHENTICATION, PROTOCOL_VERSION,
};

// ── In-memory transport ──────────────────────────────────────────

type ListenerMap = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Arc<dyn Client>>>>>;

pub struct MemoryNet {
    listeners: ListenerMap,
    dials: Arc<AtomicU64>,
}

impl MemoryNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            listeners: Arc::new(Mutex::new(HashMap::new())),
            dials: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(MemoryTransport {
            listeners: self.listeners.clone(),
            dials: self.dials.clone(),
        })
    }

    pub fn has_listener(&self, addr: &str) -> bool {
        self.listeners.lock().contains_key(addr)
    }
}

struct MemoryTransport {
    listeners: ListenerMap,
    dials: Arc<AtomicU64>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut listeners = self.listeners.lock();
        if listeners.contains_key(addr) {
            bail!("address in use: {addr}");
        }
        listeners.insert(addr.to_string(), tx);
        Ok(Box::new(MemoryListener {
            addr: addr.to_string(),
            rx,
            listeners: self.listeners.clone(),
        }))
    }

    async fn dial(&self, addr: &str) -> Result<Arc<dyn Client>> {
        let dial_id = self.dials.fetch_add(1, Ordering::Relaxed);
        let (dialer, accepted) = MemoryClient::pair(format!("mem:dialer:{dial_id}"), addr.to_string());
        let tx = self
            .listeners
            .lock()
            .get(addr)
            .cloned()
            .ok_or_else(|| anyhow!("connection refused: {addr}"))?;
        tx.send(accepted).map_err(|_| anyhow!("listener closed: {addr}"))?;
        Ok(dialer)
    }
}

struct MemoryListener {
    addr: String,
    rx: mpsc::UnboundedReceiver<Arc<dyn Client>>,
    listeners: ListenerMap,
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&mut self) -> Result<Arc<dyn Client>> {
        self.rx.recv().await.ok_or_else(|| anyhow!("listener closed"))
    }

    async fn close(&mut self) {
        self.listeners.lock().remove(&self.addr);
        self.rx.close();
    }
}

struct MemoryClient {
    remote: String,
    tx: mpsc::UnboundedSender<Frame>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
    /// Shared by both halves: closing one end unblocks both.
    closed: CancellationToken,
}

impl MemoryClient {
    fn pair(dialer_addr: String, listen_addr: String) -> (Arc<dyn Client>, Arc<dyn Client>) {
        let (to_listener, from_dialer) = mpsc::unbounded_channel();
        let (to_dialer, from_listener) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        let dialer: Arc<dyn Client> = Arc::new(Self {
            remote: listen_addr,
            tx: to_listener,
            rx: tokio::sync::Mutex::new(from_listener),
            closed: closed.clone(),
        });
        let accepted: Arc<dyn Client> = Arc::new(Self {
            remote: dialer_addr,
            tx: to_dialer,
            rx: tokio::sync::Mutex::new(from_dialer),
            closed,
        });
        (dialer, accepted)
    }
}

#[async_trait]
impl Client for MemoryClient {
    async fn send(&self, payload: &[u8]) -> Result<()> {
        if self.closed.is_cancelled() {
            bail!("connection closed");
        }
        self.tx
            .send(Frame {
                version: PROTOCOL_VERSION,
                payload: payload.to_vec(),
            })
            .map_err(|_| anyhow!("connection closed"))
    }

    async fn receive(&self) -> Result<Frame> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => bail!("connection closed"),
            frame = rx.recv() => frame.ok_or_else(|| anyhow!("connection closed")),
        }
    }

    fn remote_addr(&self) -> String {
        self.remote.clone()
    }

    async fn close(&self, _reason: &str) {
        self.closed.cancel();
    }
}

// ── Consensus stub ───────────────────────────────────────────────

/// Records everything the core hands it. Authentication bodies are the
/// 32-byte peer id followed by the relayer flag.
pub struct TestHandle {
    id: NodeId,
    is_relayer: bool,
    store: Arc<MokaStore>,
    pub delivered: Mutex<Vec<(NodeId, NetworkMessage)>>,
    pub synced: Mutex<Vec<(NodeId, Vec<u8>)>>,
}

impl TestHandle {
    pub fn new(id: NodeId, is_relayer: bool) -> Arc<Self> {
        Arc::new(Self {
            id,
            is_relayer,
            store: Arc::new(MokaStore::new(4096)),
            delivered: Mutex::new(Vec::new()),
            synced: Mutex::new(Vec::new()),
        })
    }

    pub fn delivered_len(&self) -> usize {
        self.delivered.lock().len()
    }
}

/// Build the auth payload a [`TestHandle`] host would send for `id`.
pub fn auth_payload(id: NodeId, is_relayer: bool) -> Vec<u8> {
    let mut out = vec![MSG_AUTHENTICATION];
    out.extend_from_slice(id.as_bytes());
    out.push(is_relayer as u8);
    out
}

#[async_trait]
impl SyncHandle for TestHandle {
    async fn build_authentication_message(&self, _remote: NodeId) -> Result<Vec<u8>> {
        Ok(auth_payload(self.id, self.is_relayer))
    }

    async fn authenticate_as(&self, _local: NodeId, body: &[u8], _timeout: Duration) -> Result<AuthToken> {
        if body.len() != 33 {
            bail!("auth body must be 33 bytes, got {}", body.len());
        }
        Ok(AuthToken {
            peer_id: NodeId::try_from_slice(&body[..32])?,
            is_relayer: body[32] == 1,
            credential: body.to_vec(),
        })
    }

    async fn handle_peer_message(&self, from: NodeId, msg: NetworkMessage) -> Result<()> {
        self.delivered.lock().push((from, msg));
        Ok(())
    }

    async fn sync_to_neighbor(&self, peer: NodeId, data: Vec<u8>) -> Result<()> {
        self.synced.lock().push((peer, data));
        Ok(())
    }

    fn cache_store(&self) -> Arc<dyn CacheStore> {
        self.store.clone()
    }
}

// ── Harness helpers ──────────────────────────────────────────────

pub struct TestNode {
    pub host: Arc<PeerHost>,
    pub handle: Arc<TestHandle>,
}

pub fn node_id(byte: u8) -> NodeId {
    NodeId::from_bytes([byte; 32])
}

/// Start a host with a short round gap and wait for its listener.
pub async fn spawn_host(net: &Arc<MemoryNet>, byte: u8, port: u16, is_relayer: bool) -> TestNode {
    let id = node_id(byte);
    let addr = format!("127.0.0.1:{port}");
    let handle = TestHandle::new(id, is_relayer);
    let config = TransportConfig {
        snapshot_round_gap: Duration::from_millis(150),
        handshake_timeout: Duration::from_secs(3),
        max_incoming_streams: 4,
    };
    let host = PeerHost::new(config, id, addr.clone(), is_relayer, net.transport(), handle.clone());
    tokio::spawn(host.clone().listen_consumers());
    wait_until(|| net.has_listener(&addr), "listener to bind").await;
    TestNode { host, handle }
}

/// Supervise an outbound relayer session from `from` to `to` and wait for
/// both sides to see it.
pub async fn connect(from: &TestNode, to: &TestNode) {
    tokio::spawn(from.host.clone().connect_relayer(to.host.id(), to.host.addr().to_string()));
    let (from_host, to_host) = (from.host.clone(), to.host.clone());
    wait_until(
        move || from_host.neighbor(to_host.id()).is_some() && to_host.neighbor(from_host.id()).is_some(),
        "session on both sides",
    )
    .await;
}

/// Poll until `cond` holds, failing the test after 10 s.
pub async fn wait_until(cond: impl Fn() -> bool, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}
