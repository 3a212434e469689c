//! Peer link: transport lifecycle and the data connection
//!
//! The session keeps at most one data connection. Every adopted connection
//! gets a new generation so events from a replaced connection are ignored.

use crate::event::Event;
use crate::session::{Session, Signal};
use crate::transport::TransportEvent;
use peerlink_core::{AppMessage, ConnectionEvent, DataConnection, PeerIdentity, PeerLinkError, PeerLinkResult};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
pub(crate) struct PeerState {
    pub(crate) connection: Option<Arc<dyn DataConnection>>,
    pub(crate) remote: Option<PeerIdentity>,
    pub(crate) generation: u64,
    pub(crate) reconnecting: Option<CancellationToken>,
}

impl Session {
    /// Open the transport, record the assigned identity and preload backgrounds
    pub async fn start(&self) -> PeerLinkResult<PeerIdentity> {
        let id = self.inner.transport.open().await?;
        if let Some(requested) = self.inner.config.peer_id.as_deref() {
            if requested != id.as_str() {
                warn!("Transport assigned {} instead of requested {}", id, requested);
            }
        }
        *self.inner.identity.lock() = Some(id.clone());

        if let Some(events) = self.inner.transport.take_events() {
            self.forward_transport(events);
        }

        let failures = self.inner.library.preload(&self.inner.config.background_paths).await;
        for failure in failures {
            self.emit(Event::Warning {
                message: failure.to_string(),
            });
        }

        info!("🚀 Session open as {}", id);
        self.emit(Event::PeerOpened { id: id.clone() });
        Ok(id)
    }

    fn forward_transport(&self, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        let signals = self.inner.signals.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => {
                            if signals.send(Signal::Transport(event)).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });
    }

    /// Remote peer of the open data connection
    pub fn connected_peer(&self) -> Option<PeerIdentity> {
        self.inner.peer.lock().remote.clone()
    }

    /// Whether a data connection is open
    pub fn is_connected(&self) -> bool {
        self.inner
            .peer
            .lock()
            .connection
            .as_ref()
            .is_some_and(|c| c.is_open())
    }

    /// Open a data connection to `remote`.
    ///
    /// The remote becomes the connected peer once the connection reports open.
    pub async fn connect(&self, remote: impl Into<PeerIdentity>) -> PeerLinkResult<()> {
        let remote = remote.into();
        if !self.inner.transport.is_open() {
            return Err(PeerLinkError::NoTransport);
        }
        if remote.as_str().is_empty() {
            return Err(PeerLinkError::NoRemote);
        }

        info!("🔗 Connecting to {}", remote);
        let connection = self.inner.transport.connect(&remote).await?;
        self.adopt_connection(connection);
        Ok(())
    }

    /// Close the data connection and forget the connected peer
    pub async fn disconnect(&self) {
        let (connection, remote) = {
            let mut peer = self.inner.peer.lock();
            peer.generation += 1;
            (peer.connection.take(), peer.remote.take())
        };
        if let Some(connection) = connection {
            connection.close().await;
        }
        if let Some(remote) = remote {
            info!("🔌 Disconnected from {}", remote);
            self.emit(Event::PeerDisconnected { remote });
        }
    }

    /// Send a JSON payload to the connected peer
    pub async fn send_data(&self, body: serde_json::Value) -> PeerLinkResult<()> {
        self.send_message(&AppMessage::Data { body }).await
    }

    pub(crate) async fn send_message(&self, message: &AppMessage) -> PeerLinkResult<()> {
        let connection = self
            .inner
            .peer
            .lock()
            .connection
            .clone()
            .filter(|c| c.is_open())
            .ok_or(PeerLinkError::NoConnection)?;
        connection.send(message.encode()?).await
    }

    fn adopt_connection(&self, connection: Arc<dyn DataConnection>) {
        let events = connection.take_events();
        let (generation, previous) = {
            let mut peer = self.inner.peer.lock();
            peer.generation += 1;
            (peer.generation, peer.connection.replace(connection))
        };
        if let Some(previous) = previous {
            debug!("Replacing data connection to {}", previous.peer());
            tokio::spawn(async move { previous.close().await });
        }

        let Some(mut events) = events else {
            warn!("Data connection events were already taken");
            return;
        };
        let signals = self.inner.signals.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => {
                            if signals.send(Signal::Connection { generation, event }).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });
    }

    pub(crate) async fn handle_connection_event(&self, generation: u64, event: ConnectionEvent) {
        let connection = {
            let peer = self.inner.peer.lock();
            if peer.generation != generation {
                return;
            }
            peer.connection.clone()
        };
        let Some(connection) = connection else {
            return;
        };

        match event {
            ConnectionEvent::Open => {
                let remote = connection.peer().clone();
                self.inner.peer.lock().remote = Some(remote.clone());
                info!("🔗 Connected to {}", remote);
                self.emit(Event::PeerConnected { remote });
            }
            ConnectionEvent::Data(payload) => match AppMessage::decode(&payload) {
                Ok(AppMessage::KeepAlive { timestamp }) => {
                    debug!("Keep-alive from {} at {}", connection.peer(), timestamp);
                }
                Ok(AppMessage::Data { body }) => {
                    self.emit(Event::DataReceived {
                        from: connection.peer().clone(),
                        payload: body,
                    });
                }
                Err(e) => warn!("Ignoring message from {}: {}", connection.peer(), e),
            },
            ConnectionEvent::Close => {
                let remote = {
                    let mut peer = self.inner.peer.lock();
                    peer.connection = None;
                    peer.remote.take()
                };
                if let Some(remote) = remote {
                    info!("🔌 Connection to {} closed", remote);
                    self.emit(Event::PeerDisconnected { remote });
                }
            }
            ConnectionEvent::Error { kind, message } => {
                warn!("Data connection error ({}): {}", kind, message);
                self.emit(Event::Warning {
                    message: format!("Connection error {}: {}", kind, message),
                });
            }
        }
    }

    pub(crate) async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::IncomingConnection(connection) => {
                debug!("Incoming connection from {}", connection.peer());
                self.adopt_connection(connection);
            }
            TransportEvent::IncomingCall(handle) => self.spawn_accept(handle),
            TransportEvent::Disconnected => self.spawn_reconnect(),
            TransportEvent::Error { kind, message } => {
                warn!("Transport error ({}): {}", kind, message);
                self.emit(Event::Warning {
                    message: format!("Transport error {}: {}", kind, message),
                });
            }
        }
    }

    fn spawn_reconnect(&self) {
        let token = {
            let mut peer = self.inner.peer.lock();
            if peer.reconnecting.is_some() {
                debug!("Reconnect already in progress");
                return;
            }
            let token = self.inner.shutdown.child_token();
            peer.reconnecting = Some(token.clone());
            token
        };

        warn!("📡 Transport disconnected, reconnecting");
        let session = self.clone();
        tokio::spawn(async move {
            let transport = session.inner.transport.clone();
            let result = session
                .inner
                .config
                .reconnect
                .run(&token, |attempt| {
                    session.emit(Event::TransportReconnecting { attempt });
                    let transport = transport.clone();
                    async move { transport.reconnect().await }
                })
                .await;
            session.inner.peer.lock().reconnecting = None;

            match result {
                Ok(()) => {
                    info!("📡 Transport reconnected");
                    session.emit(Event::TransportReconnected);
                }
                Err(PeerLinkError::Cancelled { .. }) => debug!("Reconnect cancelled"),
                Err(e) => {
                    error!("Transport could not be recovered: {}", e);
                    session.emit(Event::TransportFailed { error: e });
                }
            }
        });
    }

    pub(crate) fn stop_reconnect(&self) {
        if let Some(token) = self.inner.peer.lock().reconnecting.take() {
            token.cancel();
        }
    }
}
