// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{net::TcpListener as StdTcpListener, sync::Arc};

use anyhow::{Context, Result, ensure};
use bytes::{Buf, BytesMut};
use once_cell::sync::Lazy;
use reliable_tcp_rs::{
    cfg::{
        config::{ClientConfig, ServerConfig},
        logger::init_logger,
    },
    packet::codec::Packet,
    server::server::ReliableServer,
};
use tokio::{io::AsyncReadExt, net::TcpStream};
use tracing_appender::non_blocking::WorkerGuard;

static TEST_LOGGER: Lazy<Option<WorkerGuard>> = Lazy::new(|| init_logger("warn").ok());

/// Install the tracing subscriber once for the whole test binary.
pub fn init_test_logging() {
    Lazy::force(&TEST_LOGGER);
}

pub const REQ_BODY: &[u8] = b"hello from client";
pub const RSP_BODY: &[u8] = b"world from server";
pub const PUSH_BODY: &[u8] = b"push from server";

/// Grab a port the OS considers free right now. The integration tests run
/// serially, so the window for anything else to steal it is tiny.
pub fn free_port() -> u16 {
    let probe =
        StdTcpListener::bind(("127.0.0.1", 0)).expect("failed to bind probe socket");
    let port = probe
        .local_addr()
        .expect("probe socket has no local addr")
        .port();
    drop(probe);
    port
}

/// Client tuned for test time: quick reconnects, everything else stock.
pub fn fast_client_config() -> ClientConfig {
    ClientConfig {
        reconnect_interval_seconds: 2,
        ..ClientConfig::default()
    }
}

/// Client that never proves liveness, for eviction tests.
pub fn silent_client_config() -> ClientConfig {
    ClientConfig {
        heartbeat_interval_seconds: 0,
        reconnect_interval_seconds: 60,
        ..ClientConfig::default()
    }
}

/// Server that gives up on silent sessions quickly.
pub fn impatient_server_config() -> ServerConfig {
    ServerConfig {
        max_heartbeat_interval_seconds: 3,
        ..ServerConfig::default()
    }
}

/// Started server answering cmd 1 with [`RSP_BODY`].
pub async fn spawn_echo_server(port: u16, cfg: ServerConfig) -> Arc<ReliableServer> {
    let server = Arc::new(ReliableServer::new(port, cfg));
    assert!(server.start().await, "server failed to start on {port}");

    let responder = Arc::clone(&server);
    server.register_req_processor(1, move |session_id, packet| {
        let server = Arc::clone(&responder);
        tokio::spawn(async move {
            server
                .send_rsp_for_req(session_id, packet.cmd(), packet.seq(), RSP_BODY)
                .await;
        });
    });

    server
}

/// Read one frame off a raw socket, buffering partial reads.
pub async fn read_frame(stream: &mut TcpStream, buf: &mut BytesMut) -> Result<Packet> {
    loop {
        let (packet, consumed) = Packet::parse(&buf[..]);
        buf.advance(consumed);
        if let Some(packet) = packet {
            return Ok(packet);
        }

        let n = stream.read_buf(buf).await.context("raw peer read failed")?;
        ensure!(n > 0, "peer closed while a frame was expected");
    }
}
