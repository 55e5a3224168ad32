//! The peer host.
//!
//! One [`PeerHost`] per node. It accepts inbound consumer sessions, keeps
//! supervised outbound sessions to configured relayers, broadcasts its
//! consumer list so remote hosts can discover which relayers serve which
//! destinations, and tears everything down without leaking a task.
//!
//! Per live session the host drives four tasks:
//! - the send loop (priority-batched ring drain → transport),
//! - the receive reader (transport → bounded channel, drop-to-close),
//! - the receive handler (channel → routing),
//! - the sync loop (sync ring → consensus callback).
//!
//! Lifecycle discipline: every path that opens a transport client closes
//! it on exit; rings are disposed exactly once, by
//! [`PeerSession::disconnect`]; the listener and all receive waits are
//! bound to the host's cancellation token so teardown never leaves a task
//! parked in `accept` or `receive`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::auth;
use crate::cache::DedupCache;
use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::handle::SyncHandle;
use crate::identity::NodeId;
use crate::message::{build_consumers_message, parse_network_message, peer_scoped_key};
use crate::metrics::{MetricEntry, MetricPool};
use crate::neighbors::{NeighborMap, RelayersMap};
use crate::peer::{PeerSession, RING_CAPACITY};
use crate::ring::{ChanMsg, Priority};
use crate::transport::{validate_address, Client, Transport};

/// Batch caps for one send-loop iteration: high-priority messages first,
/// then normal traffic up to the combined cap.
pub(crate) const HIGH_BATCH: usize = 16;
pub(crate) const TOTAL_BATCH: usize = 32;

/// Idle sleep between empty ring drains.
pub(crate) const IDLE_POLL: Duration = Duration::from_millis(300);

/// Receive pipeline depth. A peer that keeps it full has a stuck handler
/// and is treated as failed.
const RECEIVE_QUEUE: usize = 1024;

/// The top-level transport object: identity, neighbor tables, dedup plane
/// and the task lifecycle around them.
pub struct PeerHost {
    pub(crate) id: NodeId,
    pub(crate) addr: String,
    pub(crate) is_relayer: bool,
    pub(crate) config: TransportConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) handle: Arc<dyn SyncHandle>,
    /// Inbound-authenticated sessions.
    pub(crate) consumers: NeighborMap,
    /// Outbound sessions to configured relayers.
    pub(crate) relayers: NeighborMap,
    /// Which remote relayers serve which destinations. Present only when
    /// this host relays itself or keeps outbound relayer sessions.
    pub(crate) remote_relayers: OnceLock<RelayersMap>,
    pub(crate) dedup: Arc<DedupCache>,
    pub(crate) metrics: MetricPool,
    /// The host as a pseudo-peer: its rings exist for accounting and are
    /// disposed during teardown like any session's.
    pub(crate) me: Arc<PeerSession>,
    closing: AtomicBool,
    pub(crate) cancel: CancellationToken,
}

impl PeerHost {
    pub fn new(
        config: TransportConfig,
        id: NodeId,
        addr: impl Into<String>,
        is_relayer: bool,
        transport: Arc<dyn Transport>,
        handle: Arc<dyn SyncHandle>,
    ) -> Arc<Self> {
        let addr = addr.into();
        let dedup = Arc::new(DedupCache::new(handle.cache_store()));
        let ring_capacity = if is_relayer {
            RING_CAPACITY * config.max_incoming_streams
        } else {
            RING_CAPACITY
        };
        let me = PeerSession::new(id, addr.clone(), is_relayer, ring_capacity, dedup.clone());
        let host = Arc::new(Self {
            id,
            addr,
            is_relayer,
            config,
            transport,
            handle,
            consumers: NeighborMap::new(),
            relayers: NeighborMap::new(),
            remote_relayers: OnceLock::new(),
            dedup,
            metrics: MetricPool::new(),
            me,
            closing: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });
        if host.is_relayer {
            host.remote_relayers.get_or_init(RelayersMap::new);
        }
        host
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_relayer(&self) -> bool {
        self.is_relayer
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Relaxed)
    }

    /// Per-type sent/received counters.
    pub fn metric(&self) -> std::collections::HashMap<u8, MetricEntry> {
        self.metrics.snapshot()
    }

    /// The relay discovery table, when this host participates in relay
    /// discovery at all.
    pub fn remote_relayers(&self) -> Option<&RelayersMap> {
        self.remote_relayers.get()
    }

    /// A direct session for `id`, from either table.
    pub fn neighbor(&self, id: NodeId) -> Option<Arc<PeerSession>> {
        self.relayers.get(id).or_else(|| self.consumers.get(id))
    }

    /// Snapshot of every live session. A node that is both a consumer and
    /// a relayer contributes one session from each table.
    pub fn neighbors(&self) -> Vec<Arc<PeerSession>> {
        let mut all = self.relayers.slice();
        all.extend(self.consumers.slice());
        all
    }

    /// Hand `data` to a neighbor's sync plane.
    pub fn offer_sync_to_peer(&self, peer: NodeId, data: Vec<u8>) -> Result<(), TransportError> {
        let session = self.neighbor(peer).ok_or(TransportError::UnknownPeer(peer))?;
        if session.offer_sync(data)? {
            Ok(())
        } else {
            Err(TransportError::QueueFull(peer))
        }
    }

    /// Build a session for an authenticated peer. Relayer sessions get
    /// larger rings to absorb the transport's stream fan-in.
    pub(crate) fn new_session(&self, id: NodeId, addr: String, is_relayer: bool) -> Arc<PeerSession> {
        let capacity = if is_relayer {
            RING_CAPACITY * self.config.max_incoming_streams
        } else {
            RING_CAPACITY
        };
        PeerSession::new(id, addr, is_relayer, capacity, self.dedup.clone())
    }

    // ── Inbound: listener and consumer sessions ─────────────────────

    /// Bind the local listener and accept consumer sessions until
    /// teardown. Also drives the periodic consumer-list broadcast.
    pub async fn listen_consumers(self: Arc<Self>) -> Result<(), TransportError> {
        let mut listener = self.transport.listen(&self.addr).await?;
        tracing::info!(id = %self.id, addr = %self.addr, "listening for consumers");

        let broadcaster = tokio::spawn(self.clone().loop_broadcast_consumers());

        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break,
                res = listener.accept() => res,
            };
            match accepted {
                Ok(client) => {
                    let host = self.clone();
                    tokio::spawn(async move { host.handle_inbound(client).await });
                }
                Err(e) => {
                    if self.is_closing() {
                        break;
                    }
                    tracing::warn!(addr = %self.addr, "accept failed: {e}");
                    tokio::time::sleep(IDLE_POLL).await;
                }
            }
        }

        listener.close().await;
        let _ = broadcaster.await;
        tracing::info!(id = %self.id, addr = %self.addr, "listener closed");
        Ok(())
    }

    async fn handle_inbound(self: Arc<Self>, client: Arc<dyn Client>) {
        let peer = match auth::authenticate_inbound(&self, &client).await {
            Ok(peer) => peer,
            Err(e) => {
                tracing::warn!(addr = %client.remote_addr(), "inbound handshake failed: {e}");
                client.close("authentication failed").await;
                return;
            }
        };
        let id = peer.id();

        // A reconnecting peer replaces its previous session.
        if let Some(old) = self.consumers.remove(id) {
            tracing::info!(peer = %id, "replacing existing consumer session");
            old.disconnect().await;
        }
        if !self.consumers.put(id, peer.clone()) {
            panic!("duplicate consumer session for {id}");
        }
        tracing::info!(peer = %id, addr = %peer.addr(), relayer = peer.is_relayer(), "consumer session established");

        self.clone().run_session_loops(peer.clone(), client).await;

        self.consumers.remove_if(id, &peer);
        peer.disconnect().await;
        tracing::info!(peer = %id, "consumer session closed");
    }

    // ── Outbound: supervised relayer sessions ───────────────────────

    /// Keep one authenticated session to the relayer at `addr`, retrying
    /// after `snapshot_round_gap` whenever the link drops. Returns only
    /// at teardown.
    ///
    /// Panics when a session for `remote` already exists: a second
    /// supervisor for the same relayer is a caller bug.
    pub async fn connect_relayer(self: Arc<Self>, remote: NodeId, addr: impl Into<String>) -> Result<(), TransportError> {
        let addr = addr.into();
        validate_address(&addr)?;
        if remote == self.id {
            panic!("cannot relay through ourselves");
        }
        // Keeping any outbound relayer means participating in relay
        // discovery, even on a non-relayer host.
        self.remote_relayers.get_or_init(RelayersMap::new);

        loop {
            if self.is_closing() {
                return Ok(());
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.snapshot_round_gap) => {}
            }
            if self.is_closing() {
                return Ok(());
            }
            if self.relayers.get(remote).is_some() {
                panic!("relayer session already exists for {remote}");
            }

            let peer = self.new_session(remote, addr.clone(), true);
            if let Err(e) = self.clone().connect_relayer_once(&peer, &addr).await {
                tracing::warn!(relayer = %remote, addr = %addr, "relayer link failed: {e}");
            }
            self.relayers.remove_if(remote, &peer);
            peer.disconnect().await;
            tracing::debug!(relayer = %remote, "relayer session closed, will retry");
        }
    }

    async fn connect_relayer_once(self: Arc<Self>, peer: &Arc<PeerSession>, addr: &str) -> Result<(), TransportError> {
        let client = auth::authenticate_outbound(&self, peer.id(), addr).await?;
        if !self.relayers.put(peer.id(), peer.clone()) {
            panic!("duplicate relayer session for {}", peer.id());
        }
        tracing::info!(relayer = %peer.id(), addr, "relayer session established");
        self.run_session_loops(peer.clone(), client).await;
        Ok(())
    }

    // ── Session loops ───────────────────────────────────────────────

    /// Drive one session to completion: spawn the sync and receive tasks,
    /// run the send loop inline, then join the receive side. The `ops`
    /// guard is held across all of it, so `disconnect` observes the whole
    /// lifecycle, not just the sender.
    async fn run_session_loops(self: Arc<Self>, peer: Arc<PeerSession>, client: Arc<dyn Client>) {
        let _ops = peer.ops.guard();
        let link = CancellationToken::new();

        let sync_task = tokio::spawn(self.clone().loop_sync_to_neighbor(peer.clone()));
        let recv_task = tokio::spawn({
            let host = self.clone();
            let peer = peer.clone();
            let client = client.clone();
            let link = link.clone();
            async move {
                host.loop_receive_message(peer, client).await;
                link.cancel();
            }
        });

        self.loop_sending_stream(&peer, &client, &link).await;
        let _ = recv_task.await;
        // The sync loop exits through ring disposal in disconnect() and
        // reports through the stn signal.
        drop(sync_task);
    }

    /// Single-threaded per session: drain a priority-biased batch, push it
    /// through the transport, record fingerprints, idle briefly when
    /// there is nothing to do.
    async fn loop_sending_stream(&self, peer: &Arc<PeerSession>, client: &Arc<dyn Client>, link: &CancellationToken) {
        'run: loop {
            if self.is_closing() || peer.is_closing() || link.is_cancelled() {
                break;
            }
            let batch = match self.gather_batch(peer) {
                Ok(batch) => batch,
                Err(_) => break, // rings disposed: session is going away
            };
            if batch.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(IDLE_POLL) => {}
                    _ = link.cancelled() => break,
                }
                continue;
            }
            for msg in batch {
                if let Err(e) = client.send(&msg.data).await {
                    tracing::debug!(peer = %peer.id(), "send failed: {e}");
                    break 'run;
                }
                if let Some(key) = msg.key {
                    peer.dedup.store(&key);
                }
            }
        }
        client.close("peer send loop ended").await;
    }

    /// One drain: up to [`HIGH_BATCH`] high-priority messages, then normal
    /// traffic up to [`TOTAL_BATCH`] combined. Messages whose fingerprint
    /// is already in the dedup window are dropped here.
    pub(crate) fn gather_batch(&self, peer: &PeerSession) -> Result<Vec<ChanMsg>, TransportError> {
        let mut batch = Vec::new();
        while batch.len() < HIGH_BATCH {
            match peer.high.poll()? {
                Some(msg) if dedup_hit(peer, &msg) => {}
                Some(msg) => batch.push(msg),
                None => break,
            }
        }
        while batch.len() < TOTAL_BATCH {
            match peer.normal.poll()? {
                Some(msg) if dedup_hit(peer, &msg) => {}
                Some(msg) => batch.push(msg),
                None => break,
            }
        }
        Ok(batch)
    }

    /// Receive pipeline: a reader pushing parsed frames into a bounded
    /// channel and a handler draining it into the routing layer. A full
    /// channel, a parse error, or a handler error closes the session.
    async fn loop_receive_message(self: Arc<Self>, peer: Arc<PeerSession>, client: Arc<dyn Client>) {
        let (tx, mut rx) = mpsc::channel(RECEIVE_QUEUE);

        let reader = tokio::spawn({
            let host = self.clone();
            let client = client.clone();
            let peer_id = peer.id();
            async move {
                loop {
                    let frame = tokio::select! {
                        _ = host.cancel.cancelled() => break,
                        received = client.receive() => match received {
                            Ok(frame) => frame,
                            Err(e) => {
                                tracing::debug!(peer = %peer_id, "receive ended: {e}");
                                break;
                            }
                        },
                    };
                    let msg = match parse_network_message(frame.version, &frame.payload) {
                        Ok(msg) => msg,
                        Err(e) => {
                            tracing::warn!(peer = %peer_id, "dropping peer on bad frame: {e}");
                            break;
                        }
                    };
                    host.metrics.incr_received(msg.mtype);
                    if tx.try_send(msg).is_err() {
                        tracing::warn!(peer = %peer_id, "receive queue full, dropping peer");
                        break;
                    }
                }
                client.close("receive reader ended").await;
            }
        });

        while let Some(msg) = rx.recv().await {
            if let Err(e) = self.route_peer_message(peer.id(), msg).await {
                tracing::warn!(peer = %peer.id(), "message handler failed: {e}");
                break;
            }
        }
        client.close("receive handler ended").await;
        let _ = reader.await;
    }

    /// Drain a neighbor's sync ring into the consensus layer.
    async fn loop_sync_to_neighbor(self: Arc<Self>, peer: Arc<PeerSession>) {
        let _stn = peer.stn.guard();
        loop {
            if self.is_closing() || peer.is_closing() {
                break;
            }
            match peer.sync.poll() {
                Ok(Some(msg)) => {
                    if let Err(e) = self.handle.sync_to_neighbor(peer.id(), msg.data).await {
                        tracing::debug!(peer = %peer.id(), "sync handler failed: {e}");
                        break;
                    }
                }
                Ok(None) => tokio::time::sleep(IDLE_POLL).await,
                Err(_) => break,
            }
        }
    }

    /// Tell every relayer-flagged neighbor which consumers we serve, once
    /// per round. Keyed per peer so redundant links dedup themselves.
    async fn loop_broadcast_consumers(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.snapshot_round_gap);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if self.is_closing() {
                break;
            }
            let ids: Vec<NodeId> = self.consumers.slice().iter().map(|s| s.id()).collect();
            if ids.is_empty() {
                continue;
            }
            let payload = build_consumers_message(&ids);
            for peer in self.neighbors() {
                if !peer.is_relayer() {
                    continue;
                }
                let key = peer_scoped_key(&payload, peer.id());
                match peer.offer(Priority::Normal, ChanMsg::new(Some(key), payload.clone())) {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!(peer = %peer.id(), "consumer broadcast dropped: queue full");
                    }
                    Err(_) => {}
                }
            }
        }
    }

    // ── Teardown ────────────────────────────────────────────────────

    /// Stop everything: cancel pending accepts and receives, dispose the
    /// host's own rings, then disconnect every neighbor concurrently and
    /// wait for all of their tasks to report completion.
    pub async fn teardown(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(id = %self.id, "tearing down transport");
        self.cancel.cancel();
        self.me.disconnect().await;

        let mut join = JoinSet::new();
        for peer in self.neighbors() {
            join.spawn(async move { peer.disconnect().await });
        }
        while join.join_next().await.is_some() {}
        tracing::info!(id = %self.id, "transport torn down");
    }
}

/// The send loop checks fingerprints against the session's dedup handle,
/// which every session shares with its host.
fn dedup_hit(peer: &PeerSession, msg: &ChanMsg) -> bool {
    msg.key
        .as_ref()
        .is_some_and(|key| peer.dedup.contains(key, crate::dispatch::DEDUP_TTL))
}
