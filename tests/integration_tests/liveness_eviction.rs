// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::{Context, Result};
use reliable_tcp_rs::{client::client::ReliableClient, server::server::ReliableServer};
use serial_test::serial;
use tokio::{
    sync::mpsc,
    time::{Duration, sleep, timeout},
};

use crate::integration_tests::common::{
    free_port, impatient_server_config, init_test_logging, silent_client_config,
};

/// With client heartbeats disabled, the server's sweep forgets the session
/// once it goes quiet, and responses to it start failing.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn silent_sessions_are_evicted() -> Result<()> {
    init_test_logging();
    let port = free_port();
    let server = Arc::new(ReliableServer::new(port, impatient_server_config()));
    assert!(server.start().await);

    let (sid_tx, mut sid_rx) = mpsc::unbounded_channel();
    let responder = Arc::clone(&server);
    server.register_req_processor(1, move |session_id, packet| {
        let _ = sid_tx.send(session_id);
        let server = Arc::clone(&responder);
        tokio::spawn(async move {
            server
                .send_rsp_for_req(session_id, packet.cmd(), packet.seq(), b"ok")
                .await;
        });
    });

    let client = ReliableClient::new(silent_client_config());
    assert!(client.start("127.0.0.1", port).await);

    let rsp = timeout(Duration::from_secs(5), client.send_req(1, b"hi", None))
        .await
        .context("no response in time")??;
    assert_eq!(rsp.body(), b"ok".as_slice());

    let session_id = timeout(Duration::from_secs(1), sid_rx.recv())
        .await
        .context("processor never saw the request")?
        .context("channel closed")?;

    // the session is alive right now: unsolicited responses still go out
    assert!(server.send_rsp_for_req(session_id, 1, 9999, b"ping").await);

    // no heartbeats, no traffic: past the threshold the sweep removes it
    sleep(Duration::from_secs(6)).await;
    assert!(
        !server.send_rsp_for_req(session_id, 1, 9999, b"ping").await,
        "evicted session still accepts responses"
    );

    client.stop().await;
    server.stop().await;
    Ok(())
}

/// Heartbeats alone keep an otherwise idle session alive.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn heartbeats_keep_an_idle_session_alive() -> Result<()> {
    init_test_logging();
    let port = free_port();
    let server = Arc::new(ReliableServer::new(port, impatient_server_config()));
    assert!(server.start().await);

    let (sid_tx, mut sid_rx) = mpsc::unbounded_channel();
    let responder = Arc::clone(&server);
    server.register_req_processor(1, move |session_id, packet| {
        let _ = sid_tx.send(session_id);
        let server = Arc::clone(&responder);
        tokio::spawn(async move {
            server
                .send_rsp_for_req(session_id, packet.cmd(), packet.seq(), b"ok")
                .await;
        });
    });

    // heartbeat every second: well inside the 3-second threshold
    let mut cfg = silent_client_config();
    cfg.heartbeat_interval_seconds = 1;
    let client = ReliableClient::new(cfg);
    assert!(client.start("127.0.0.1", port).await);

    timeout(Duration::from_secs(5), client.send_req(1, b"hi", None))
        .await
        .context("no response in time")??;
    let session_id = timeout(Duration::from_secs(1), sid_rx.recv())
        .await
        .context("processor never saw the request")?
        .context("channel closed")?;

    // idle twice as long as the eviction threshold
    sleep(Duration::from_secs(6)).await;
    assert!(
        server.send_rsp_for_req(session_id, 1, 9999, b"ping").await,
        "heartbeating session was evicted"
    );

    client.stop().await;
    server.stop().await;
    Ok(())
}
