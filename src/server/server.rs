// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::HashMap,
    net::{Ipv4Addr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::Bytes;
use tokio::{
    net::{TcpListener, TcpSocket, TcpStream},
    sync::{mpsc, oneshot},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::config::ServerConfig,
    packet::codec::{HEARTBEAT_CMD, Packet},
    server::session::{self, SessionHandle},
    timer::TimerService,
};

const CHECK_INTERVAL_SECONDS: u32 = 1;

/// Handler for inbound requests, keyed by cmd. Runs on the server's event
/// loop with `(session_id, packet)`; reply by spawning a task that calls
/// [`ReliableServer::send_rsp_for_req`].
pub type ReqProcessor = Arc<dyn Fn(u32, Packet) + Send + Sync>;

enum ServerCmd {
    Start {
        reply: oneshot::Sender<bool>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    RegisterProcessor {
        cmd: u32,
        processor: ReqProcessor,
    },
    UnregisterProcessor {
        cmd: u32,
    },
    SendRsp {
        session_id: u32,
        cmd: u32,
        seq: u32,
        body: Bytes,
        reply: oneshot::Sender<bool>,
    },
    Publish {
        cmd: u32,
        body: Bytes,
        reply: oneshot::Sender<bool>,
    },
    Inbound {
        session_id: u32,
        packet: Packet,
    },
    Tick,
}

/// TCP server counterpart of [`ReliableClient`](crate::client::client::ReliableClient).
///
/// Accepts connections into per-socket sessions, routes inbound requests to
/// registered processors, answers them on demand, and fans pushes out to
/// every live session with per-session retransmission until ACKed. Sessions
/// that stop sending anything (including heartbeats) for too long are
/// evicted by a periodic sweep.
///
/// All state lives on a dedicated event-loop task; handle methods post
/// commands to it and are safe to call from anywhere. Dropping the handle
/// tears everything down.
pub struct ReliableServer {
    cmd_tx: mpsc::UnboundedSender<ServerCmd>,
    started: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl ReliableServer {
    /// Spawn the server event loop. Nothing is bound until
    /// [`start`](Self::start). Must be called from within a tokio runtime.
    pub fn new(port: u16, cfg: ServerConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let started = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();

        let actor = ServerActor {
            cfg,
            port,
            cmd_tx: cmd_tx.clone(),
            started: Arc::clone(&started),
            timer: TimerService::new(),
            check_timer_id: 0,
            listener: None,
            sessions: HashMap::new(),
            processors: HashMap::new(),
            cur_session_id: 0,
            cur_seq: 0,
        };
        tokio::spawn(actor.run(cmd_rx, shutdown.clone()));

        Self {
            cmd_tx,
            started,
            shutdown,
        }
    }

    /// Bind the port (with `reuse_address`), start accepting and arm the
    /// liveness sweep. Idempotent after the first success; false when the
    /// port cannot be bound.
    pub async fn start(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(ServerCmd::Start { reply }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Close the listener and every session, dropping all state. Idempotent.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(ServerCmd::Stop { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Route requests carrying `cmd` to `processor`. cmd 0 is reserved for
    /// heartbeats and is refused.
    pub fn register_req_processor(
        &self,
        cmd: u32,
        processor: impl Fn(u32, Packet) + Send + Sync + 'static,
    ) {
        let _ = self.cmd_tx.send(ServerCmd::RegisterProcessor {
            cmd,
            processor: Arc::new(processor),
        });
    }

    pub fn unregister_req_processor(&self, cmd: u32) {
        let _ = self.cmd_tx.send(ServerCmd::UnregisterProcessor { cmd });
    }

    /// Answer a request on its session, echoing the request's `(cmd, seq)`.
    /// False when the body does not fit a frame or the session is gone.
    /// Responses are written once and never retransmitted.
    pub async fn send_rsp_for_req(
        &self,
        session_id: u32,
        cmd: u32,
        seq: u32,
        body: &[u8],
    ) -> bool {
        let (reply, rx) = oneshot::channel();
        let cmd = ServerCmd::SendRsp {
            session_id,
            cmd,
            seq,
            body: Bytes::copy_from_slice(body),
            reply,
        };
        if self.cmd_tx.send(cmd).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Push one notification, under a single freshly-allocated sequence
    /// number, to every current session. Delivery is best effort per
    /// session, with retransmission until ACKed or the retry budget runs
    /// out. False only when the body does not fit a frame.
    pub async fn publish_notification(&self, cmd: u32, body: &[u8]) -> bool {
        let (reply, rx) = oneshot::channel();
        let cmd = ServerCmd::Publish {
            cmd,
            body: Bytes::copy_from_slice(body),
            reply,
        };
        if self.cmd_tx.send(cmd).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }
}

impl Drop for ReliableServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct SessionInfo {
    session: SessionHandle,
    last_recv: Instant,
}

struct ServerActor {
    cfg: ServerConfig,
    port: u16,
    cmd_tx: mpsc::UnboundedSender<ServerCmd>,
    started: Arc<AtomicBool>,
    timer: TimerService,
    check_timer_id: u32,
    listener: Option<TcpListener>,
    sessions: HashMap<u32, SessionInfo>,
    processors: HashMap<u32, ReqProcessor>,
    cur_session_id: u32,
    cur_seq: u32,
}

async fn accept_next(
    listener: &mut Option<TcpListener>,
) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener.as_mut() {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

impl ServerActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<ServerCmd>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    self.handle_cmd(cmd);
                }
                accepted = accept_next(&mut self.listener) => {
                    match accepted {
                        Ok((stream, peer)) => self.add_new_session(stream, peer),
                        Err(err) => debug!("accept failed: {err}"),
                    }
                }
            }
        }
        self.stop_impl();
    }

    fn handle_cmd(&mut self, cmd: ServerCmd) {
        match cmd {
            ServerCmd::Start { reply } => {
                let _ = reply.send(self.start_impl());
            }
            ServerCmd::Stop { reply } => {
                self.stop_impl();
                let _ = reply.send(());
            }
            ServerCmd::RegisterProcessor { cmd, processor } => {
                if cmd == HEARTBEAT_CMD {
                    warn!("cmd 0 is reserved for heartbeats, processor ignored");
                } else {
                    self.processors.insert(cmd, processor);
                }
            }
            ServerCmd::UnregisterProcessor { cmd } => {
                self.processors.remove(&cmd);
            }
            ServerCmd::SendRsp {
                session_id,
                cmd,
                seq,
                body,
                reply,
            } => {
                let _ = reply.send(self.send_rsp_impl(session_id, cmd, seq, body));
            }
            ServerCmd::Publish { cmd, body, reply } => {
                let _ = reply.send(self.publish_impl(cmd, body));
            }
            ServerCmd::Inbound { session_id, packet } => {
                self.dispatch_packet(session_id, packet);
            }
            ServerCmd::Tick => self.on_periodic_check(),
        }
    }

    fn start_impl(&mut self) -> bool {
        if self.started.load(Ordering::Acquire) {
            return true;
        }

        match self.bind_listener() {
            Ok(listener) => self.listener = Some(listener),
            Err(err) => {
                warn!("failed to bind port {}: {err}", self.port);
                return false;
            }
        }
        self.started.store(true, Ordering::Release);

        let cmd_tx = self.cmd_tx.clone();
        self.check_timer_id = self.timer.start_timer(
            move || {
                let _ = cmd_tx.send(ServerCmd::Tick);
            },
            CHECK_INTERVAL_SECONDS,
            CHECK_INTERVAL_SECONDS,
        );
        self.check_timer_id != 0
    }

    fn bind_listener(&self) -> std::io::Result<TcpListener> {
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port)))?;
        socket.listen(1024)
    }

    fn stop_impl(&mut self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }

        debug!("server closing");
        self.timer.stop_timer(self.check_timer_id);
        self.check_timer_id = 0;

        self.listener = None;
        // dropping the handles cancels every session actor
        self.sessions.clear();
        self.processors.clear();
    }

    fn add_new_session(&mut self, stream: TcpStream, peer: SocketAddr) {
        self.cur_session_id = self.cur_session_id.wrapping_add(1);
        let session_id = self.cur_session_id;

        let cmd_tx = self.cmd_tx.clone();
        let session = session::spawn(
            session_id,
            stream,
            &self.cfg,
            Box::new(move |session_id, packet| {
                let _ = cmd_tx.send(ServerCmd::Inbound { session_id, packet });
            }),
        );

        debug!(session_id, %peer, "accepted new session");
        self.sessions.insert(
            session_id,
            SessionInfo {
                session,
                last_recv: Instant::now(),
            },
        );
    }

    /// Any frame from a session proves it alive; heartbeats carry nothing
    /// else. Push frames are ACKs the session already consumed, so only
    /// requests go looking for a processor.
    fn dispatch_packet(&mut self, session_id: u32, packet: Packet) {
        if let Some(info) = self.sessions.get_mut(&session_id) {
            info.last_recv = Instant::now();
        }

        if packet.is_push() {
            return;
        }

        let Some(processor) = self.processors.get(&packet.cmd()) else {
            debug!(cmd = packet.cmd(), "no processor registered, request dropped");
            return;
        };
        processor(session_id, packet);
    }

    fn send_rsp_impl(
        &mut self,
        session_id: u32,
        cmd: u32,
        seq: u32,
        body: Bytes,
    ) -> bool {
        let Ok(packet) = Packet::build(cmd, seq, false, body) else {
            return false;
        };
        let Some(info) = self.sessions.get(&session_id) else {
            return false;
        };
        info.session.send_packet(packet);
        true
    }

    fn publish_impl(&mut self, cmd: u32, body: Bytes) -> bool {
        self.cur_seq = self.cur_seq.wrapping_add(1);
        let Ok(packet) = Packet::build(cmd, self.cur_seq, true, body) else {
            return false;
        };

        for info in self.sessions.values() {
            info.session.send_packet(packet.clone());
        }
        true
    }

    fn on_periodic_check(&mut self) {
        let now = Instant::now();
        let threshold = self.cfg.max_heartbeat_interval_seconds;
        self.sessions.retain(|session_id, info| {
            let keep = now.duration_since(info.last_recv).as_secs() < threshold;
            if !keep {
                debug!(session_id = *session_id, "session went silent, removing it");
            }
            keep
        });
    }
}
