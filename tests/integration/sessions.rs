use std::time::Duration;

use anyhow::{bail, Result};
use serde_json::json;

use pairlink_core::config::PairlinkConfig;
use pairlink_services::{names, PeerId, SessionEvent};

use crate::*;

#[tokio::test]
async fn connecting_yields_one_session_per_side() -> Result<()> {
    let room = Room::join(PairlinkConfig::default()).await?;
    let mut extra_alice = manager_events(&room.alice, names::CONNECTED);
    let (at_alice, at_bob) = room.connect().await?;

    assert_eq!(at_alice.remote_id(), &PeerId::from(BOB));
    assert_eq!(at_bob.remote_id(), &PeerId::from(ALICE));

    // the listener registered before connecting saw exactly one event too
    within("alice's extra listener", extra_alice.recv()).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(extra_alice.try_recv().is_err());
    assert!(room.network.candidates_applied() > 0);
    assert_eq!(room.alice.sessions().len(), 1);
    assert_eq!(room.bob.sessions().len(), 1);
    Ok(())
}

#[tokio::test]
async fn custom_events_flow_both_ways_in_order() -> Result<()> {
    let room = Room::join(PairlinkConfig::default()).await?;
    let (at_alice, at_bob) = room.connect().await?;
    let mut to_bob = session_events(&at_bob, "chat");
    let mut to_alice = session_events(&at_alice, "chat");

    for n in 0..20 {
        at_alice.emit("chat", vec![json!(n), json!({"from": ALICE})]).await?;
    }
    at_bob.emit("chat", vec![json!("hi alice")]).await?;

    for n in 0..20 {
        match within("chat from alice", to_bob.recv()).await? {
            Some(SessionEvent::Custom { event, args }) => {
                assert_eq!(event, "chat");
                assert_eq!(args, vec![json!(n), json!({"from": ALICE})]);
            }
            other => bail!("unexpected event {other:?}"),
        }
    }
    match within("chat from bob", to_alice.recv()).await? {
        Some(SessionEvent::Custom { args, .. }) => assert_eq!(args, vec![json!("hi alice")]),
        other => bail!("unexpected event {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn once_and_off_limit_delivery() -> Result<()> {
    let room = Room::join(PairlinkConfig::default()).await?;
    let (at_alice, at_bob) = room.connect().await?;

    let (tx, mut once) = tokio::sync::mpsc::unbounded_channel();
    at_bob.once("ping", move |_| {
        let _ = tx.send(());
    });
    let (tx, mut removed) = tokio::sync::mpsc::unbounded_channel();
    let id = at_bob.on("ping", move |_| {
        let _ = tx.send(());
    });
    assert!(at_bob.off("ping", id));
    assert!(!at_bob.off("ping", id));
    let mut kept = session_events(&at_bob, "ping");

    at_alice.emit("ping", vec![]).await?;
    at_alice.emit("ping", vec![]).await?;
    within("first ping", kept.recv()).await?;
    within("second ping", kept.recv()).await?;

    assert!(once.try_recv().is_ok());
    assert!(once.try_recv().is_err());
    assert!(removed.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn reserved_names_cannot_be_emitted() -> Result<()> {
    let room = Room::join(PairlinkConfig::default()).await?;
    let (at_alice, _at_bob) = room.connect().await?;

    for name in [names::DATA, names::FILE, names::FILE_STREAM, names::CONNECTION_CLOSED] {
        assert!(at_alice.emit(name, vec![]).await.is_err(), "{name} was accepted");
    }
    Ok(())
}

#[tokio::test]
async fn close_notifies_both_sides_exactly_once() -> Result<()> {
    let room = Room::join(PairlinkConfig::default()).await?;
    let (at_alice, at_bob) = room.connect().await?;
    let mut alice_closed = session_events(&at_alice, names::CONNECTION_CLOSED);
    let mut bob_closed = session_events(&at_bob, names::CONNECTION_CLOSED);

    at_alice.close().await;
    at_alice.close().await;

    within("alice's close", alice_closed.recv()).await?;
    within("bob's close", bob_closed.recv()).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(alice_closed.try_recv().is_err());
    assert!(bob_closed.try_recv().is_err());

    assert!(at_bob.is_closed());
    assert!(at_alice.emit("late", vec![]).await.is_err());
    assert!(room.alice.session(&PeerId::from(BOB)).is_none());
    assert!(room.bob.session(&PeerId::from(ALICE)).is_none());
    Ok(())
}

#[tokio::test]
async fn closing_the_manager_closes_remote_sessions() -> Result<()> {
    let room = Room::join(PairlinkConfig::default()).await?;
    let (_at_alice, at_bob) = room.connect().await?;
    let mut bob_closed = session_events(&at_bob, names::CONNECTION_CLOSED);

    room.alice.close().await;
    within("bob's close", bob_closed.recv()).await?;
    assert!(room.bob.get_room_peers().await?.is_empty());
    Ok(())
}
