//! pairlink integration test harness.
//!
//! Every test builds two connection managers on a shared loopback network
//! and signal hub, so nothing here touches a real network. Set `RUST_LOG`
//! to see the library's tracing output:
//!
//!   RUST_LOG=pairlink_services=debug cargo test --test integration

use std::future::Future;
use std::sync::{Arc, Once};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;

use pairlink_core::config::PairlinkConfig;
use pairlink_services::loopback::{LoopbackNetwork, LoopbackSignalHub};
use pairlink_services::{names, ConnectionManager, ManagerEvent, PeerId, PeerSession, SessionEvent};

mod lifecycle;
mod sessions;
mod transfer;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const ALICE: &str = "alice";
pub const BOB: &str = "bob";

/// Upper bound for any single wait in these tests.
pub const WAIT: Duration = Duration::from_secs(5);

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Fail instead of hanging when something never happens.
pub async fn within<T>(what: &str, fut: impl Future<Output = T>) -> Result<T> {
    tokio::time::timeout(WAIT, fut)
        .await
        .with_context(|| format!("timed out waiting for {what}"))
}

pub fn session_events(session: &PeerSession, event: &str) -> mpsc::UnboundedReceiver<SessionEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    session.on(event, move |e| {
        let _ = tx.send(e);
    });
    rx
}

pub fn manager_events(manager: &ConnectionManager, event: &str) -> mpsc::UnboundedReceiver<ManagerEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    manager.on(event, move |e| {
        let _ = tx.send(e);
    });
    rx
}

/// Accept every inbound request.
pub fn accept_all(manager: &ConnectionManager) {
    manager.on(names::CONNECTION_REQUEST, |event| {
        if let ManagerEvent::ConnectionRequest(request) = event {
            tokio::spawn(async move {
                let _ = request.accept().await;
            });
        }
    });
}

/// Two managers in the same room on a shared loopback network.
pub struct Room {
    pub network: LoopbackNetwork,
    pub alice: ConnectionManager,
    pub bob: ConnectionManager,
}

impl Room {
    pub async fn join(config: PairlinkConfig) -> Result<Self> {
        init_tracing();
        let hub = LoopbackSignalHub::new();
        let network = LoopbackNetwork::new();
        let manager = |id: &str| {
            ConnectionManager::new(
                Arc::new(hub.signaler_with_id(PeerId::from(id))),
                Arc::new(network.transport()),
                config.clone(),
            )
        };
        let alice = manager(ALICE);
        let bob = manager(BOB);
        alice.connect_to_room().await?;
        bob.connect_to_room().await?;
        Ok(Self { network, alice, bob })
    }

    /// Alice offers, Bob accepts. Returns (Alice's session, Bob's session).
    pub async fn connect(&self) -> Result<(PeerSession, PeerSession)> {
        accept_all(&self.bob);
        let mut at_alice = manager_events(&self.alice, names::CONNECTED);
        let mut at_bob = manager_events(&self.bob, names::CONNECTED);

        self.alice.connect_to_peer(&PeerId::from(BOB)).await?;

        let alice_session = connected_session(within("alice to connect", at_alice.recv()).await?)?;
        let bob_session = connected_session(within("bob to connect", at_bob.recv()).await?)?;
        Ok((alice_session, bob_session))
    }
}

pub fn connected_session(event: Option<ManagerEvent>) -> Result<PeerSession> {
    match event {
        Some(ManagerEvent::Connected(session)) => Ok(session),
        other => bail!("expected a connected event, got {other:?}"),
    }
}
