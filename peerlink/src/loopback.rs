//! In-process session transport
//!
//! [`LoopbackNetwork`] connects any number of [`LoopbackTransport`]s living
//! in the same process. Connections and calls are delivered over channels
//! immediately, which makes it suitable for demos and tests. The transport
//! also exposes hooks to simulate disconnects and failing reconnects.

use crate::transport::{CallEvent, CallHandle, SessionTransport, TransportEvent};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use peerlink_core::{ConnectionEvent, DataConnection, PeerIdentity, PeerLinkError, PeerLinkResult};
use peerlink_media::{MediaStream, MediaTrack, TrackKind};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

fn unavailable(remote: &PeerIdentity) -> PeerLinkError {
    PeerLinkError::Remote {
        kind: "peer-unavailable".to_string(),
        message: format!("Could not connect to peer {}", remote),
    }
}

#[derive(Debug)]
struct Node {
    events: mpsc::UnboundedSender<TransportEvent>,
    open: AtomicBool,
    calls: Mutex<Vec<Arc<LoopbackCall>>>,
    connections: Mutex<Vec<Arc<LoopbackConnection>>>,
}

/// Registry of loopback transports that can reach each other
#[derive(Debug, Clone, Default)]
pub struct LoopbackNetwork {
    nodes: Arc<DashMap<String, Arc<Node>>>,
}

impl LoopbackNetwork {
    /// Empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport on this network.
    ///
    /// The transport registers under `id` when opened, or under a random
    /// identity when `id` is `None`.
    pub fn transport(&self, id: Option<&str>) -> Arc<LoopbackTransport> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(LoopbackTransport {
            network: self.clone(),
            requested: id.map(PeerIdentity::new),
            identity: Mutex::new(None),
            node: Arc::new(Node {
                events: tx,
                open: AtomicBool::new(false),
                calls: Mutex::new(Vec::new()),
                connections: Mutex::new(Vec::new()),
            }),
            events: Mutex::new(Some(rx)),
            failing_reconnects: AtomicU32::new(0),
            reconnect_attempts: AtomicU32::new(0),
        })
    }

    /// Number of registered transports
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no transport is registered
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn reachable(&self, remote: &PeerIdentity) -> PeerLinkResult<Arc<Node>> {
        self.nodes
            .get(remote.as_str())
            .map(|entry| entry.value().clone())
            .filter(|node| node.open.load(Ordering::SeqCst))
            .ok_or_else(|| unavailable(remote))
    }
}

/// Transport endpoint on a [`LoopbackNetwork`]
#[derive(Debug)]
pub struct LoopbackTransport {
    network: LoopbackNetwork,
    requested: Option<PeerIdentity>,
    identity: Mutex<Option<PeerIdentity>>,
    node: Arc<Node>,
    events: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    failing_reconnects: AtomicU32,
    reconnect_attempts: AtomicU32,
}

impl LoopbackTransport {
    /// Every call this transport placed or received
    pub fn calls(&self) -> Vec<Arc<LoopbackCall>> {
        self.node.calls.lock().clone()
    }

    /// Every data connection this transport opened or accepted
    pub fn connections(&self) -> Vec<Arc<LoopbackConnection>> {
        self.node.connections.lock().clone()
    }

    /// Simulate losing the signalling connection
    pub fn trigger_disconnect(&self) {
        info!("Loopback transport disconnecting");
        self.node.open.store(false, Ordering::SeqCst);
        let _ = self.node.events.send(TransportEvent::Disconnected);
    }

    /// Simulate a transport level error
    pub fn trigger_error(&self, kind: &str, message: &str) {
        let _ = self.node.events.send(TransportEvent::Error {
            kind: kind.to_string(),
            message: message.to_string(),
        });
    }

    /// Make the next `count` reconnect attempts fail
    pub fn fail_reconnects(&self, count: u32) {
        self.failing_reconnects.store(count, Ordering::SeqCst);
    }

    /// Reconnect attempts made so far
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    fn local(&self) -> PeerLinkResult<PeerIdentity> {
        if !self.node.open.load(Ordering::SeqCst) {
            return Err(PeerLinkError::NoTransport);
        }
        self.identity.lock().clone().ok_or(PeerLinkError::NoTransport)
    }
}

#[async_trait]
impl SessionTransport for LoopbackTransport {
    async fn open(&self) -> PeerLinkResult<PeerIdentity> {
        if let Some(id) = self.identity.lock().clone() {
            self.node.open.store(true, Ordering::SeqCst);
            return Ok(id);
        }

        let id = self.requested.clone().unwrap_or_else(PeerIdentity::generate);
        if self.network.nodes.contains_key(id.as_str()) {
            return Err(PeerLinkError::Remote {
                kind: "unavailable-id".to_string(),
                message: format!("ID \"{}\" is taken", id),
            });
        }

        self.network
            .nodes
            .insert(id.as_str().to_string(), self.node.clone());
        self.node.open.store(true, Ordering::SeqCst);
        *self.identity.lock() = Some(id.clone());
        info!("Loopback transport open as {}", id);
        Ok(id)
    }

    fn identity(&self) -> Option<PeerIdentity> {
        self.identity.lock().clone()
    }

    fn is_open(&self) -> bool {
        self.node.open.load(Ordering::SeqCst)
    }

    async fn reconnect(&self) -> PeerLinkResult<()> {
        if self.identity.lock().is_none() {
            return Err(PeerLinkError::NoTransport);
        }
        self.reconnect_attempts.fetch_add(1, Ordering::SeqCst);

        let failing = self.failing_reconnects.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_reconnects.store(failing - 1, Ordering::SeqCst);
            return Err(PeerLinkError::Remote {
                kind: "network".to_string(),
                message: "Lost connection to server".to_string(),
            });
        }

        self.node.open.store(true, Ordering::SeqCst);
        debug!("Loopback transport reconnected");
        Ok(())
    }

    async fn connect(&self, remote: &PeerIdentity) -> PeerLinkResult<Arc<dyn DataConnection>> {
        let local = self.local()?;
        let node = self.network.reachable(remote)?;

        let (ours, theirs) = LoopbackConnection::pair(local, remote.clone());
        self.node.connections.lock().push(ours.clone());
        node.connections.lock().push(theirs.clone());
        node.events
            .send(TransportEvent::IncomingConnection(theirs))
            .map_err(|_| unavailable(remote))?;

        debug!("Loopback connection to {} opened", remote);
        Ok(ours)
    }

    async fn call(&self, remote: &PeerIdentity, stream: &MediaStream) -> PeerLinkResult<Arc<dyn CallHandle>> {
        let local = self.local()?;
        let node = self.network.reachable(remote)?;

        let (caller, callee) = LoopbackCall::pair(local, remote.clone(), stream.clone());
        self.node.calls.lock().push(caller.clone());
        node.calls.lock().push(callee.clone());
        node.events
            .send(TransportEvent::IncomingCall(callee))
            .map_err(|_| unavailable(remote))?;

        debug!("Loopback call {} to {} placed", caller.id, remote);
        Ok(caller)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events.lock().take()
    }

    async fn destroy(&self) {
        self.node.open.store(false, Ordering::SeqCst);
        if let Some(id) = self.identity.lock().take() {
            self.network.nodes.remove(id.as_str());
        }

        let calls = std::mem::take(&mut *self.node.calls.lock());
        for call in calls {
            call.close().await;
        }
        let connections = std::mem::take(&mut *self.node.connections.lock());
        for connection in connections {
            connection.close().await;
        }
        info!("Loopback transport destroyed");
    }
}

/// One end of a loopback data connection
#[derive(Debug)]
pub struct LoopbackConnection {
    peer: PeerIdentity,
    open: Arc<AtomicBool>,
    own: mpsc::UnboundedSender<ConnectionEvent>,
    remote: mpsc::UnboundedSender<ConnectionEvent>,
    events: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
}

impl LoopbackConnection {
    fn pair(local: PeerIdentity, remote: PeerIdentity) -> (Arc<Self>, Arc<Self>) {
        let open = Arc::new(AtomicBool::new(true));
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();

        let _ = a_tx.send(ConnectionEvent::Open);
        let _ = b_tx.send(ConnectionEvent::Open);

        let ours = Arc::new(Self {
            peer: remote,
            open: open.clone(),
            own: a_tx.clone(),
            remote: b_tx.clone(),
            events: Mutex::new(Some(a_rx)),
        });
        let theirs = Arc::new(Self {
            peer: local,
            open,
            own: b_tx,
            remote: a_tx,
            events: Mutex::new(Some(b_rx)),
        });
        (ours, theirs)
    }
}

#[async_trait]
impl DataConnection for LoopbackConnection {
    fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send(&self, payload: Bytes) -> PeerLinkResult<()> {
        if !self.is_open() {
            return Err(PeerLinkError::NoConnection);
        }
        self.remote
            .send(ConnectionEvent::Data(payload))
            .map_err(|_| PeerLinkError::NoConnection)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.events.lock().take()
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.own.send(ConnectionEvent::Close);
            let _ = self.remote.send(ConnectionEvent::Close);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Caller,
    Callee,
}

#[derive(Debug)]
struct CallShared {
    closed: AtomicBool,
    offered: MediaStream,
}

/// One end of a loopback media call
#[derive(Debug)]
pub struct LoopbackCall {
    id: String,
    peer: PeerIdentity,
    role: Role,
    shared: Arc<CallShared>,
    own: mpsc::UnboundedSender<CallEvent>,
    remote: mpsc::UnboundedSender<CallEvent>,
    events: Mutex<Option<mpsc::UnboundedReceiver<CallEvent>>>,
    sent: Mutex<Vec<MediaTrack>>,
    reject_replace: AtomicBool,
}

impl LoopbackCall {
    fn pair(caller: PeerIdentity, callee: PeerIdentity, offered: MediaStream) -> (Arc<Self>, Arc<Self>) {
        let id = format!("call-{}", uuid::Uuid::new_v4());
        let shared = Arc::new(CallShared {
            closed: AtomicBool::new(false),
            offered: offered.clone(),
        });
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();

        let outgoing = Arc::new(Self {
            id: id.clone(),
            peer: callee,
            role: Role::Caller,
            shared: shared.clone(),
            own: a_tx.clone(),
            remote: b_tx.clone(),
            events: Mutex::new(Some(a_rx)),
            sent: Mutex::new(offered.tracks().to_vec()),
            reject_replace: AtomicBool::new(false),
        });
        let incoming = Arc::new(Self {
            id,
            peer: caller,
            role: Role::Callee,
            shared,
            own: b_tx,
            remote: a_tx,
            events: Mutex::new(Some(b_rx)),
            sent: Mutex::new(Vec::new()),
            reject_replace: AtomicBool::new(false),
        });
        (outgoing, incoming)
    }

    /// Tracks currently sent to the other party
    pub fn sent_tracks(&self) -> Vec<MediaTrack> {
        self.sent.lock().clone()
    }

    /// Whether either side closed the call
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Make every following `replace_track` fail, as a broken sender would
    pub fn reject_track_replacement(&self, reject: bool) {
        self.reject_replace.store(reject, Ordering::SeqCst);
    }

    /// Simulate a negotiation failure reported to both ends
    pub fn fail(&self, kind: &str, message: &str) {
        let event = CallEvent::Error {
            kind: kind.to_string(),
            message: message.to_string(),
        };
        let _ = self.own.send(event.clone());
        let _ = self.remote.send(event);
    }
}

#[async_trait]
impl CallHandle for LoopbackCall {
    fn id(&self) -> &str {
        &self.id
    }

    fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    async fn answer(&self, stream: &MediaStream) -> PeerLinkResult<()> {
        if self.role != Role::Callee {
            return Err(PeerLinkError::Remote {
                kind: "negotiation-failed".to_string(),
                message: "Only the called party can answer".to_string(),
            });
        }
        if self.is_closed() {
            return Err(PeerLinkError::Remote {
                kind: "call-closed".to_string(),
                message: format!("Call {} is already closed", self.id),
            });
        }

        *self.sent.lock() = stream.tracks().to_vec();
        let _ = self.remote.send(CallEvent::Stream(stream.clone()));
        let _ = self.own.send(CallEvent::Stream(self.shared.offered.clone()));
        debug!("Loopback call {} answered", self.id);
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<CallEvent>> {
        self.events.lock().take()
    }

    async fn replace_track(&self, kind: TrackKind, track: &MediaTrack) -> PeerLinkResult<bool> {
        if self.reject_replace.load(Ordering::SeqCst) {
            return Err(PeerLinkError::Remote {
                kind: "sender-failed".to_string(),
                message: format!("Call {} could not replace its {} track", self.id, kind),
            });
        }
        let mut sent = self.sent.lock();
        match sent.iter_mut().find(|t| t.kind() == kind) {
            Some(slot) => {
                *slot = track.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            let _ = self.remote.send(CallEvent::Close);
            debug!("Loopback call {} closed", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_assigns_identity() {
        let network = LoopbackNetwork::new();
        let named = network.transport(Some("alice"));
        let random = network.transport(None);

        assert_eq!(named.open().await.unwrap(), PeerIdentity::new("alice"));
        assert!(!random.open().await.unwrap().as_str().is_empty());
        assert_eq!(network.len(), 2);

        let duplicate = network.transport(Some("alice"));
        assert!(duplicate.open().await.is_err());
    }

    #[tokio::test]
    async fn test_connection_pair_exchanges_data() {
        let network = LoopbackNetwork::new();
        let alice = network.transport(Some("alice"));
        let bob = network.transport(Some("bob"));
        alice.open().await.unwrap();
        bob.open().await.unwrap();
        let mut bob_events = bob.take_events().unwrap();

        let ours = alice.connect(&PeerIdentity::new("bob")).await.unwrap();
        let theirs = match bob_events.recv().await.unwrap() {
            TransportEvent::IncomingConnection(c) => c,
            other => panic!("Expected IncomingConnection, got {:?}", other),
        };
        assert_eq!(theirs.peer().as_str(), "alice");

        let mut their_events = theirs.take_events().unwrap();
        assert_eq!(their_events.recv().await, Some(ConnectionEvent::Open));

        ours.send(Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(
            their_events.recv().await,
            Some(ConnectionEvent::Data(Bytes::from_static(b"hello")))
        );

        ours.close().await;
        assert_eq!(their_events.recv().await, Some(ConnectionEvent::Close));
        assert!(matches!(
            ours.send(Bytes::new()).await,
            Err(PeerLinkError::NoConnection)
        ));
    }

    #[tokio::test]
    async fn test_unknown_peer_unavailable() {
        let network = LoopbackNetwork::new();
        let alice = network.transport(Some("alice"));
        alice.open().await.unwrap();

        match alice.connect(&PeerIdentity::new("nobody")).await {
            Err(PeerLinkError::Remote { kind, .. }) => assert_eq!(kind, "peer-unavailable"),
            other => panic!("Expected peer-unavailable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_call_answer_delivers_streams() {
        let network = LoopbackNetwork::new();
        let alice = network.transport(Some("alice"));
        let bob = network.transport(Some("bob"));
        alice.open().await.unwrap();
        bob.open().await.unwrap();
        let mut bob_events = bob.take_events().unwrap();

        let offer = MediaStream::new(vec![MediaTrack::audio("alice mic")]);
        let answer = MediaStream::new(vec![MediaTrack::audio("bob mic")]);

        let outgoing = alice.call(&PeerIdentity::new("bob"), &offer).await.unwrap();
        let incoming = match bob_events.recv().await.unwrap() {
            TransportEvent::IncomingCall(c) => c,
            other => panic!("Expected IncomingCall, got {:?}", other),
        };
        assert_eq!(incoming.id(), outgoing.id());

        let mut caller_events = outgoing.take_events().unwrap();
        let mut callee_events = incoming.take_events().unwrap();
        assert!(outgoing.answer(&offer).await.is_err());
        incoming.answer(&answer).await.unwrap();

        match caller_events.recv().await.unwrap() {
            CallEvent::Stream(s) => assert!(s.same_tracks(&answer)),
            other => panic!("Expected Stream, got {:?}", other),
        }
        match callee_events.recv().await.unwrap() {
            CallEvent::Stream(s) => assert!(s.same_tracks(&offer)),
            other => panic!("Expected Stream, got {:?}", other),
        }

        outgoing.close().await;
        assert!(matches!(callee_events.recv().await, Some(CallEvent::Close)));
    }

    #[tokio::test]
    async fn test_replace_track_reports_missing_sender() {
        let network = LoopbackNetwork::new();
        let alice = network.transport(Some("alice"));
        let bob = network.transport(Some("bob"));
        alice.open().await.unwrap();
        bob.open().await.unwrap();

        let offer = MediaStream::new(vec![MediaTrack::audio("mic")]);
        let call = alice.call(&PeerIdentity::new("bob"), &offer).await.unwrap();

        let audio = MediaTrack::audio("other mic");
        assert!(call.replace_track(TrackKind::Audio, &audio).await.unwrap());
        let video = MediaTrack::video("screen", Default::default());
        assert!(!call.replace_track(TrackKind::Video, &video).await.unwrap());

        let sent = alice.calls()[0].sent_tracks();
        assert!(sent[0].same_track(&audio));
    }

    #[tokio::test]
    async fn test_rejected_replacement_keeps_sent_track() {
        let network = LoopbackNetwork::new();
        let alice = network.transport(Some("alice"));
        let bob = network.transport(Some("bob"));
        alice.open().await.unwrap();
        bob.open().await.unwrap();

        let mic = MediaTrack::audio("mic");
        let offer = MediaStream::new(vec![mic.clone()]);
        let call = alice.call(&PeerIdentity::new("bob"), &offer).await.unwrap();
        alice.calls()[0].reject_track_replacement(true);

        let other = MediaTrack::audio("other mic");
        assert!(call.replace_track(TrackKind::Audio, &other).await.is_err());
        assert!(alice.calls()[0].sent_tracks()[0].same_track(&mic));
    }

    #[tokio::test]
    async fn test_reconnect_failures() {
        let network = LoopbackNetwork::new();
        let alice = network.transport(Some("alice"));
        alice.open().await.unwrap();
        let mut events = alice.take_events().unwrap();

        alice.trigger_disconnect();
        assert!(matches!(events.recv().await, Some(TransportEvent::Disconnected)));
        assert!(!alice.is_open());

        alice.fail_reconnects(1);
        assert!(alice.reconnect().await.is_err());
        assert!(alice.reconnect().await.is_ok());
        assert!(alice.is_open());
        assert_eq!(alice.reconnect_attempts(), 2);
    }
}
