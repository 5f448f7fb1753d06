// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use reliable_tcp_rs::{
    cfg::{config::Config, logger::init_logger},
    client::client::ReliableClient,
    server::server::ReliableServer,
    timer::TimerService,
};
use tracing::info;

const DEMO_PORT: u16 = 8090;
const CLIENT_COUNT: u32 = 3;

const REQ_BODY: &[u8] = b"hello from client";
const RSP_BODY: &[u8] = b"world from server";
const PUSH_BODY: &[u8] = b"push from server";

/// Loopback demo: a server answering cmd 1 and publishing cmd 2 every
/// second, against a handful of clients requesting cmd 1 every second.
#[tokio::main]
async fn main() -> Result<()> {
    let _logger = init_logger("info")?;
    let cfg = Config::default();

    let server = Arc::new(ReliableServer::new(DEMO_PORT, cfg.server.clone()));
    if !server.start().await {
        bail!("server start failed");
    }

    let responder = Arc::clone(&server);
    server.register_req_processor(1, move |session_id, packet| {
        let msg = String::from_utf8_lossy(&packet.body()).into_owned();
        info!(
            session_id,
            cmd = packet.cmd(),
            seq = packet.seq(),
            %msg,
            "server recv req from client"
        );

        let server = Arc::clone(&responder);
        tokio::spawn(async move {
            server
                .send_rsp_for_req(session_id, packet.cmd(), packet.seq(), RSP_BODY)
                .await;
        });
    });

    let demo_timer = TimerService::new();
    let mut clients = Vec::new();

    for client_index in 0..CLIENT_COUNT {
        let client = Arc::new(ReliableClient::new(cfg.client.clone()));
        if !client.start("127.0.0.1", DEMO_PORT).await {
            bail!("client start failed");
        }

        client.subscribe_notification(2, move |packet| {
            let msg = String::from_utf8_lossy(&packet.body()).into_owned();
            info!(
                client_index,
                cmd = packet.cmd(),
                seq = packet.seq(),
                %msg,
                "client recv push from server"
            );
        });

        let requester = Arc::clone(&client);
        demo_timer.start_timer(
            move || {
                requester.send_req_async(1, REQ_BODY, None, move |send_id, result, packet| {
                    if result != 0 {
                        info!(send_id, "req timed out or failed");
                        return;
                    }
                    let msg = String::from_utf8_lossy(&packet.body()).into_owned();
                    info!(send_id, seq = packet.seq(), %msg, "client recv rsp from server");
                });
            },
            1,
            1,
        );

        clients.push(client);
    }

    let publisher = Arc::clone(&server);
    demo_timer.start_timer(
        move || {
            let server = Arc::clone(&publisher);
            tokio::spawn(async move {
                server.publish_notification(2, PUSH_BODY).await;
            });
        },
        1,
        1,
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");

    for client in &clients {
        client.stop().await;
    }
    server.stop().await;

    Ok(())
}
