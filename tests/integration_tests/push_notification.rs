// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;

use reliable_tcp_rs::{
    cfg::config::{ClientConfig, ServerConfig},
    client::client::ReliableClient,
    packet::codec::Packet,
    server::server::ReliableServer,
};
use serial_test::serial;
use tokio::{
    io::AsyncWriteExt,
    net::TcpListener,
    sync::mpsc,
    time::{Duration, sleep, timeout},
};

use crate::integration_tests::common::{
    PUSH_BODY, free_port, init_test_logging, read_frame,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn publish_reaches_a_subscribed_client_exactly_once() -> Result<()> {
    init_test_logging();
    let port = free_port();
    let server = Arc::new(ReliableServer::new(port, ServerConfig::default()));
    assert!(server.start().await);

    let client = ReliableClient::new(ClientConfig::default());
    assert!(client.start("127.0.0.1", port).await);

    let (tx, mut rx) = mpsc::unbounded_channel();
    client.subscribe_notification(2, move |packet| {
        let _ = tx.send(packet);
    });

    // give the session a moment to come up before fanning out
    sleep(Duration::from_millis(700)).await;
    assert!(server.publish_notification(2, PUSH_BODY).await);

    let packet = timeout(Duration::from_secs(3), rx.recv())
        .await
        .context("push not delivered")?
        .context("subscription dropped")?;
    assert!(packet.is_push());
    assert_eq!(packet.cmd(), 2);
    assert_eq!(packet.body(), PUSH_BODY);

    // the ACK stops retransmission and dedup guards the rest: nothing more
    // arrives even past the resend interval
    let extra = timeout(Duration::from_secs(4), rx.recv()).await;
    assert!(extra.is_err(), "push delivered more than once");

    client.stop().await;
    server.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn unsubscribed_cmds_are_dropped_silently() -> Result<()> {
    init_test_logging();
    let port = free_port();
    let server = Arc::new(ReliableServer::new(port, ServerConfig::default()));
    assert!(server.start().await);

    let client = ReliableClient::new(ClientConfig::default());
    assert!(client.start("127.0.0.1", port).await);

    let (tx, mut rx) = mpsc::unbounded_channel();
    client.subscribe_notification(2, move |packet| {
        let _ = tx.send(packet);
    });

    sleep(Duration::from_millis(700)).await;

    // cmd 5 has no subscription; cmd 2 does
    assert!(server.publish_notification(5, b"nobody listens").await);
    assert!(server.publish_notification(2, PUSH_BODY).await);

    let packet = timeout(Duration::from_secs(3), rx.recv())
        .await
        .context("push not delivered")?
        .context("subscription dropped")?;
    assert_eq!(packet.cmd(), 2);

    client.stop().await;
    server.stop().await;
    Ok(())
}

/// Drive the client from a hand-rolled peer so the same `(cmd, seq)` can be
/// pushed repeatedly: the client must ACK every copy but deliver only one.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn duplicate_pushes_are_acked_but_delivered_once() -> Result<()> {
    init_test_logging();
    let port = free_port();
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;

    let client = ReliableClient::new(ClientConfig::default());
    assert!(client.start("127.0.0.1", port).await);

    let (tx, mut rx) = mpsc::unbounded_channel();
    client.subscribe_notification(2, move |packet| {
        let _ = tx.send(packet);
    });

    let (mut peer, _) = listener.accept().await?;
    sleep(Duration::from_millis(200)).await;

    let push = Packet::build(2, 7, true, Bytes::from_static(PUSH_BODY))?;
    for _ in 0..3 {
        peer.write_all(&push.frame()).await?;
    }

    let delivered = timeout(Duration::from_secs(3), rx.recv())
        .await
        .context("push not delivered")?
        .context("subscription dropped")?;
    assert_eq!(delivered.seq(), 7);
    assert_eq!(delivered.body(), PUSH_BODY);

    let extra = timeout(Duration::from_secs(1), rx.recv()).await;
    assert!(extra.is_err(), "duplicate push was delivered");

    // every copy is ACKed, duplicates included
    let mut buf = BytesMut::new();
    let mut acks = 0;
    while acks < 3 {
        let frame = timeout(Duration::from_secs(3), read_frame(&mut peer, &mut buf))
            .await
            .context("missing push ack")??;
        if frame.cmd() == 0 {
            // heartbeat noise
            continue;
        }
        assert!(frame.is_push());
        assert_eq!(frame.cmd(), 2);
        assert_eq!(frame.seq(), 7);
        assert_eq!(frame.body_len(), 0);
        acks += 1;
    }

    client.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn unsubscribe_stops_delivery() -> Result<()> {
    init_test_logging();
    let port = free_port();
    let server = Arc::new(ReliableServer::new(port, ServerConfig::default()));
    assert!(server.start().await);

    let client = ReliableClient::new(ClientConfig::default());
    assert!(client.start("127.0.0.1", port).await);

    let (tx, mut rx) = mpsc::unbounded_channel();
    client.subscribe_notification(2, move |packet| {
        let _ = tx.send(packet);
    });

    sleep(Duration::from_millis(700)).await;
    assert!(server.publish_notification(2, PUSH_BODY).await);
    timeout(Duration::from_secs(3), rx.recv())
        .await
        .context("first push not delivered")?
        .context("subscription dropped")?;

    client.unsubscribe_notification(2);
    sleep(Duration::from_millis(200)).await;

    assert!(server.publish_notification(2, PUSH_BODY).await);
    let extra = timeout(Duration::from_secs(2), rx.recv()).await;
    assert!(extra.is_err(), "push delivered after unsubscribe");

    client.stop().await;
    server.stop().await;
    Ok(())
}
