//! Tests for the data-connection seam, application messages and reconnect policy
//!
//! A channel-backed connection stands in for a real transport so the
//! message flow can be checked end to end.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use peerlink_core::*;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct ChannelConnection {
    peer: PeerIdentity,
    open: Arc<AtomicBool>,
    remote: mpsc::UnboundedSender<ConnectionEvent>,
    events: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
}

fn connected_pair() -> (ChannelConnection, ChannelConnection) {
    let open = Arc::new(AtomicBool::new(true));
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        ChannelConnection {
            peer: PeerIdentity::new("bob"),
            open: open.clone(),
            remote: b_tx,
            events: Mutex::new(Some(a_rx)),
        },
        ChannelConnection {
            peer: PeerIdentity::new("alice"),
            open,
            remote: a_tx,
            events: Mutex::new(Some(b_rx)),
        },
    )
}

#[async_trait]
impl DataConnection for ChannelConnection {
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
            let _ = self.remote.send(ConnectionEvent::Close);
        }
    }
}

// ============================================================================
// Data connection
// ============================================================================

#[tokio::test]
async fn test_messages_cross_the_connection() {
    let (alice, bob) = connected_pair();
    let mut bob_events = bob.take_events().unwrap();
    assert!(bob.take_events().is_none());

    let chat = AppMessage::Data {
        body: json!({"chat": "hello"}),
    };
    alice.send(chat.encode().unwrap()).await.unwrap();
    alice
        .send(AppMessage::KeepAlive { timestamp: unix_millis() }.encode().unwrap())
        .await
        .unwrap();

    let received: Vec<AppMessage> = [bob_events.recv().await, bob_events.recv().await]
        .into_iter()
        .map(|event| match event {
            Some(ConnectionEvent::Data(payload)) => AppMessage::decode(&payload).unwrap(),
            other => panic!("Expected data, got {:?}", other),
        })
        .collect();

    assert_eq!(received[0], chat);
    assert!(received[1].is_keep_alive());
}

#[tokio::test]
async fn test_closed_connection_rejects_sends() {
    let (alice, bob) = connected_pair();
    let mut bob_events = bob.take_events().unwrap();

    alice.close().await;
    assert_eq!(bob_events.recv().await, Some(ConnectionEvent::Close));
    assert!(!bob.is_open());

    let err = alice.send(Bytes::from_static(b"{}")).await.unwrap_err();
    assert_eq!(err, PeerLinkError::NoConnection);
    assert_eq!(err.class(), ErrorClass::Precondition);
    assert!(!err.is_recoverable());
}

// ============================================================================
// Reconnect policy
// ============================================================================

#[test]
fn test_reconnect_policy_from_json() {
    let policy: ReconnectPolicy =
        serde_json::from_str(r#"{"max_attempts": 3, "jitter": false}"#).unwrap();
    assert_eq!(policy.max_attempts, 3);
    assert_eq!(policy.min_delay_ms, 100);
    assert_eq!(policy.max_delay_ms, 2_000);
    tokio_test::assert_ok!(policy.validate());

    let broken: ReconnectPolicy =
        serde_json::from_str(r#"{"min_delay_ms": 500, "max_delay_ms": 100}"#).unwrap();
    tokio_test::assert_err!(broken.validate());
}

#[tokio::test(start_paused = true)]
async fn test_disabled_policy_gives_up_immediately() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let result: PeerLinkResult<()> = ReconnectPolicy::disabled()
        .run(&CancellationToken::new(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;

    assert_eq!(result, Err(PeerLinkError::ReconnectExhausted { attempts: 0 }));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_backoff() {
    let cancel = CancellationToken::new();
    let policy = ReconnectPolicy {
        min_delay_ms: 1_000,
        max_delay_ms: 1_000,
        max_attempts: 5,
        jitter: false,
    };

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(1_500)).await;
        trigger.cancel();
    });

    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let result: PeerLinkResult<()> = policy
        .run(&cancel, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                Err(PeerLinkError::Remote {
                    kind: "network".to_string(),
                    message: "down".to_string(),
                })
            }
        })
        .await;

    assert!(matches!(result, Err(PeerLinkError::Cancelled { .. })));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}
