use std::time::Duration;

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use shoal_client::{ClientConnection, ClientError};
use shoal_protocol::{Opcode, PacketCodec, PacketReader, PacketWriter, Status, PROTOCOL_VERSION_CURRENT};
use tokio::net::TcpListener;
use tokio_util::codec::Framed;

/// Accepts one connection, reads `expect` requests, then answers them in reverse order.
async fn reversing_peer(expect: usize) -> Result<(String, tokio::task::JoinHandle<Result<Vec<i32>>>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();
    let peer = tokio::spawn(async move {
        let (stream, _) = listener.accept().await?;
        let mut frames = Framed::new(stream, PacketCodec);
        let mut seen = Vec::new();
        while seen.len() < expect {
            let Some(frame) = frames.next().await else {
                anyhow::bail!("client hung up early");
            };
            let mut request = PacketReader::new(frame?, PROTOCOL_VERSION_CURRENT);
            let packet_id = request.read_i32()?;
            let opcode = Opcode::try_from(request.read_i32()?)?;
            let _session_id = request.read_i32()?;
            if opcode.expects_response() {
                seen.push(packet_id);
            }
        }
        for packet_id in seen.iter().rev() {
            let mut out = if *packet_id % 2 == 0 {
                let mut out = PacketWriter::response(PROTOCOL_VERSION_CURRENT, *packet_id, Status::Error);
                out.write_i32(50000)
                    .write_str("50000")
                    .write_str("even packets fail")
                    .write_str("Sql")
                    .write_str("");
                out
            } else {
                PacketWriter::response(PROTOCOL_VERSION_CURRENT, *packet_id, Status::Ok)
            };
            out.write_i32(*packet_id);
            frames.send(out.finish()).await?;
        }
        anyhow::Ok(seen)
    });
    Ok((addr, peer))
}

#[tokio::test]
async fn responses_are_matched_by_packet_id() -> Result<()> {
    let (addr, peer) = reversing_peer(3).await?;
    let conn = ClientConnection::connect(&addr).await?;

    let first = conn.start(Opcode::ResultFetchRows, 1, |out| {
        out.write_i32(10).write_i32(1);
    })?;
    // Fire-and-forget requests use ids but expect nothing back.
    conn.send(Opcode::ResultClose, 1, |out| {
        out.write_i32(10);
    })?;
    let third = conn.start(Opcode::ResultFetchRows, 1, |out| {
        out.write_i32(11).write_i32(1);
    })?;
    let fourth = conn.start(Opcode::ResultFetchRows, 1, |out| {
        out.write_i32(12).write_i32(1);
    })?;
    assert_eq!(
        (first.packet_id(), third.packet_id(), fourth.packet_id()),
        (1, 3, 4)
    );

    let mut first_body = first.wait().await?;
    assert_eq!(first_body.read_i32()?, 1);
    let mut third_body = third.wait().await?;
    assert_eq!(third_body.read_i32()?, 3);
    match fourth.wait().await {
        Err(ClientError::Server { code, message, .. }) => {
            assert_eq!(code, 50000);
            assert_eq!(message, "even packets fail");
        }
        other => anyhow::bail!("unexpected {:?}", other.map(|_| ())),
    }

    assert_eq!(peer.await??, vec![1, 3, 4]);
    Ok(())
}

#[tokio::test]
async fn pending_requests_fail_when_the_peer_goes_away() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();
    let peer = tokio::spawn(async move {
        let (stream, _) = listener.accept().await?;
        let mut frames = Framed::new(stream, PacketCodec);
        frames.next().await;
        anyhow::Ok(())
    });

    let conn = ClientConnection::connect(&addr).await?;
    let mut pending = conn.start(Opcode::ResultFetchRows, 1, |out| {
        out.write_i32(1).write_i32(1);
    })?;
    peer.await??;

    let outcome = pending.wait_timeout(Duration::from_secs(5)).await;
    assert!(matches!(outcome, Err(ClientError::Closed)));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(conn.is_closed());
    assert!(matches!(
        conn.start(Opcode::ResultFetchRows, 1, |_| {}),
        Err(ClientError::Closed)
    ));
    Ok(())
}
