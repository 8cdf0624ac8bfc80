use anyhow::{bail, Result};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::json;

use pairlink_core::config::PairlinkConfig;
use pairlink_core::BinaryChunker;
use pairlink_services::{names, OutgoingFile, SessionEvent};

use crate::*;

fn tiny_frames() -> PairlinkConfig {
    let mut config = PairlinkConfig::default();
    // one payload byte per frame
    config.chunker.max_frame_size = 22;
    config
}

#[tokio::test]
async fn one_byte_frames_reassemble() -> Result<()> {
    let config = tiny_frames();
    let (chunker, _timeouts) = BinaryChunker::new(&config.chunker)?;
    let frames: Vec<Bytes> = chunker.chunk(Bytes::from_static(b"hello!"), None)?.collect();
    assert_eq!(frames.len(), 7);

    let room = Room::join(config).await?;
    let (at_alice, at_bob) = room.connect().await?;
    let mut data = session_events(&at_bob, names::DATA);

    at_alice.send_raw(Bytes::from_static(b"hello!"), None).await?;
    match within("reassembled data", data.recv()).await? {
        Some(SessionEvent::Data { metadata, data }) => {
            assert_eq!(metadata, None);
            assert_eq!(&data[..], b"hello!");
        }
        other => bail!("unexpected event {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn large_payload_keeps_its_metadata() -> Result<()> {
    let room = Room::join(PairlinkConfig::default()).await?;
    let (at_alice, at_bob) = room.connect().await?;
    let mut data = session_events(&at_bob, names::DATA);

    let payload: Bytes = (0..200_000u32).map(|i| (i % 253) as u8).collect::<Vec<_>>().into();
    at_alice
        .send_raw(payload.clone(), Some(&json!({"checksum": "none", "part": 1})))
        .await?;

    match within("large payload", data.recv()).await? {
        Some(SessionEvent::Data { metadata, data }) => {
            assert_eq!(metadata, Some(json!({"checksum": "none", "part": 1})));
            assert_eq!(data, payload);
        }
        other => bail!("unexpected event {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn files_arrive_whole_without_stream_listeners() -> Result<()> {
    let room = Room::join(PairlinkConfig::default()).await?;
    let (at_alice, at_bob) = room.connect().await?;
    let mut files = session_events(&at_bob, names::FILE);

    let file = OutgoingFile::new("report.csv", "text/csv", &b"a,b\n1,2\n"[..]);
    at_alice.send_file(&file).await?;

    match within("file", files.recv()).await? {
        Some(SessionEvent::File(received)) => {
            assert_eq!(received.name(), "report.csv");
            assert_eq!(received.metadata.mime_type, "text/csv");
            assert_eq!(received.metadata.size, 8);
            assert_eq!(&received.data[..], b"a,b\n1,2\n");
        }
        other => bail!("unexpected event {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn file_streams_can_be_teed() -> Result<()> {
    let room = Room::join(tiny_frames()).await?;
    let (at_alice, at_bob) = room.connect().await?;
    let mut streams = session_events(&at_bob, names::FILE_STREAM);
    let mut files = session_events(&at_bob, names::FILE);

    let body = Bytes::from_static(b"streamed one byte at a time");
    at_alice
        .send_file(&OutgoingFile::new("slow.txt", "text/plain", body.clone()))
        .await?;

    let stream = match within("file stream", streams.recv()).await? {
        Some(SessionEvent::FileStream { metadata, stream }) => {
            assert_eq!(metadata.name, "slow.txt");
            stream
        }
        other => bail!("unexpected event {other:?}"),
    };
    for copy in stream.tee(2) {
        assert_eq!(within("teed copy", copy.read_to_end()).await??, body);
    }
    assert!(files.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn live_streams_are_reassembled_in_order() -> Result<()> {
    let room = Room::join(PairlinkConfig::default()).await?;
    let (at_alice, at_bob) = room.connect().await?;
    let mut data = session_events(&at_bob, names::DATA);

    let parts: Vec<Result<Bytes, std::io::Error>> = (0..50u8)
        .map(|n| Ok(Bytes::from(vec![n; 1000])))
        .collect();
    at_alice
        .send_stream(futures::stream::iter(parts), Some(&json!({"live": true})))
        .await?;

    match within("streamed data", data.recv()).await? {
        Some(SessionEvent::Data { metadata, data }) => {
            assert_eq!(metadata, Some(json!({"live": true})));
            assert_eq!(data.len(), 50_000);
            assert!(data.chunks(1000).enumerate().all(|(n, part)| part.iter().all(|b| *b == n as u8)));
        }
        other => bail!("unexpected event {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn incoming_file_stream_yields_chunks_as_they_arrive() -> Result<()> {
    let room = Room::join(PairlinkConfig::default()).await?;
    let (at_alice, at_bob) = room.connect().await?;
    let mut streams = session_events(&at_bob, names::FILE_STREAM);

    let body: Bytes = (0..100_000u32).map(|i| (i % 97) as u8).collect::<Vec<_>>().into();
    at_alice
        .send_file(&OutgoingFile::new("chunks.bin", "application/octet-stream", body.clone()))
        .await?;

    let mut stream = match within("file stream", streams.recv()).await? {
        Some(SessionEvent::FileStream { stream, .. }) => stream,
        other => bail!("unexpected event {other:?}"),
    };
    let mut received = Vec::new();
    let mut pieces = 0;
    while let Some(piece) = within("next chunk", stream.next()).await? {
        received.extend_from_slice(&piece?);
        pieces += 1;
    }
    assert!(pieces > 1);
    assert_eq!(Bytes::from(received), body);
    Ok(())
}
