use std::time::Duration;

use anyhow::{bail, Result};

use pairlink_core::config::PairlinkConfig;
use pairlink_services::{names, ManagerEvent, NegotiationError, PeerId};

use crate::*;

#[tokio::test]
async fn room_membership_is_visible_to_both_sides() -> Result<()> {
    let room = Room::join(PairlinkConfig::default()).await?;
    assert_eq!(room.alice.local_id(), Some(&PeerId::from(ALICE)));
    assert_eq!(room.alice.get_room_peers().await?, vec![PeerId::from(BOB)]);
    assert_eq!(room.bob.get_room_peers().await?, vec![PeerId::from(ALICE)]);
    Ok(())
}

#[tokio::test]
async fn duplicate_connects_are_refused() -> Result<()> {
    let room = Room::join(PairlinkConfig::default()).await?;
    accept_all(&room.bob);
    let mut connected = manager_events(&room.alice, names::CONNECTED);

    room.alice.connect_to_peer(&PeerId::from(BOB)).await?;
    assert!(matches!(
        room.alice.connect_to_peer(&PeerId::from(BOB)).await,
        Err(NegotiationError::AlreadyPending(_))
    ));

    connected_session(within("connection", connected.recv()).await?)?;
    assert!(matches!(
        room.alice.connect_to_peer(&PeerId::from(BOB)).await,
        Err(NegotiationError::AlreadyConnected(_))
    ));
    Ok(())
}

#[tokio::test]
async fn rejected_request_fails_the_offerer() -> Result<()> {
    let room = Room::join(PairlinkConfig::default()).await?;
    let mut requests = manager_events(&room.bob, names::CONNECTION_REQUEST);
    let mut failed = manager_events(&room.alice, names::CONNECTION_FAILED);
    let mut connected = manager_events(&room.alice, names::CONNECTED);

    room.alice.connect_to_peer(&PeerId::from(BOB)).await?;
    let request = match within("connection request", requests.recv()).await? {
        Some(ManagerEvent::ConnectionRequest(request)) => request,
        other => bail!("unexpected event {other:?}"),
    };
    assert_eq!(request.remote_id(), &PeerId::from(ALICE));
    request.reject().await?;

    match within("connection failure", failed.recv()).await? {
        Some(ManagerEvent::ConnectionFailed(peer)) => assert_eq!(peer, PeerId::from(BOB)),
        other => bail!("unexpected event {other:?}"),
    }
    assert!(!room.alice.is_pending(&PeerId::from(BOB)));
    assert!(connected.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn offers_are_rejected_when_nobody_is_listening() -> Result<()> {
    let room = Room::join(PairlinkConfig::default()).await?;
    let mut failed = manager_events(&room.alice, names::CONNECTION_FAILED);

    room.alice.connect_to_peer(&PeerId::from(BOB)).await?;
    within("connection failure", failed.recv()).await?;
    assert!(room.bob.sessions().is_empty());
    Ok(())
}

#[tokio::test]
async fn transport_failure_surfaces_on_both_sides() -> Result<()> {
    let room = Room::join(PairlinkConfig::default()).await?;
    room.network.refuse_links(true);
    accept_all(&room.bob);
    let mut alice_failed = manager_events(&room.alice, names::CONNECTION_FAILED);
    let mut bob_failed = manager_events(&room.bob, names::CONNECTION_FAILED);
    let mut connected = manager_events(&room.alice, names::CONNECTED);

    room.alice.connect_to_peer(&PeerId::from(BOB)).await?;
    within("alice's failure", alice_failed.recv()).await?;
    within("bob's failure", bob_failed.recv()).await?;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(alice_failed.try_recv().is_err());
    assert!(connected.try_recv().is_err());

    // a failed peer can be retried once the network recovers
    room.network.refuse_links(false);
    room.alice.connect_to_peer(&PeerId::from(BOB)).await?;
    connected_session(within("retried connection", connected.recv()).await?)?;
    Ok(())
}

#[tokio::test]
async fn reconnecting_after_close_starts_a_fresh_session() -> Result<()> {
    let room = Room::join(PairlinkConfig::default()).await?;
    let (first, at_bob) = room.connect().await?;
    let mut bob_closed = session_events(&at_bob, names::CONNECTION_CLOSED);

    first.close().await;
    within("bob's close", bob_closed.recv()).await?;

    let (second, _) = room.connect().await?;
    assert!(first.is_closed());
    assert!(!second.is_closed());
    assert_eq!(room.alice.sessions().len(), 1);
    Ok(())
}

#[tokio::test]
async fn closed_manager_refuses_work() -> Result<()> {
    let room = Room::join(PairlinkConfig::default()).await?;
    room.alice.close().await;
    assert!(matches!(
        room.alice.connect_to_peer(&PeerId::from(BOB)).await,
        Err(NegotiationError::Closed)
    ));
    assert!(room.bob.get_room_peers().await?.is_empty());
    Ok(())
}
