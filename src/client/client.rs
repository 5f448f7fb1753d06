// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
};

use anyhow::{Result, anyhow, ensure};
use bytes::{Buf, Bytes, BytesMut};
use tokio::{
    net::{TcpStream, tcp::OwnedReadHalf},
    sync::{mpsc, oneshot},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::config::ClientConfig,
    client::common::{
        NotificationCallback, PendingRequest, SEND_RESULT_OK, SEND_RESULT_TIMEOUT,
        SendCallback, SendOpt,
    },
    net::{read_some, spawn_frame_writer},
    packet::{codec::Packet, tracker::RecentPacketTracker},
    timer::TimerService,
};

const CHECK_INTERVAL_SECONDS: u32 = 1;

enum ClientCmd {
    Start {
        host: String,
        port: u16,
        reply: oneshot::Sender<bool>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    SendReq {
        packet: Packet,
        send_id: u32,
        opt: SendOpt,
        callback: SendCallback,
    },
    SendCancel {
        send_id: u32,
    },
    Subscribe {
        cmd: u32,
        callback: NotificationCallback,
    },
    Unsubscribe {
        cmd: u32,
    },
    Tick,
    ConnectFinished {
        attempt: u32,
        result: std::io::Result<TcpStream>,
    },
    WriteFailed {
        attempt: u32,
    },
}

/// TCP client that keeps requests alive across timeouts and reconnects.
///
/// All state lives on a dedicated event-loop task; the handle only posts
/// commands to it, so every method is safe to call from any task or thread.
/// Dropping the handle tears the event loop down.
///
/// Outbound requests are retried per their [`SendOpt`] until a response
/// echoes their `(cmd, seq)`, the retry budget runs out, or they are
/// cancelled. Inbound pushes are ACKed immediately, deduplicated over a
/// 60-second window, and dispatched to the per-cmd subscription, if any.
pub struct ReliableClient {
    cmd_tx: mpsc::UnboundedSender<ClientCmd>,
    started: Arc<AtomicBool>,
    cur_seq: Arc<AtomicU32>,
    cur_send_id: AtomicU32,
    shutdown: CancellationToken,
}

impl ReliableClient {
    /// Spawn the client event loop. Must be called from within a tokio
    /// runtime.
    pub fn new(cfg: ClientConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let started = Arc::new(AtomicBool::new(false));
        let cur_seq = Arc::new(AtomicU32::new(0));
        let shutdown = CancellationToken::new();

        let actor = ClientActor::new(
            cfg,
            cmd_tx.clone(),
            Arc::clone(&started),
            Arc::clone(&cur_seq),
        );
        tokio::spawn(actor.run(cmd_rx, shutdown.clone()));

        Self {
            cmd_tx,
            started,
            cur_seq,
            cur_send_id: AtomicU32::new(0),
            shutdown,
        }
    }

    /// Record the endpoint, kick off the first connect and arm the periodic
    /// check. Idempotent after the first success.
    pub async fn start(&self, host: impl Into<String>, port: u16) -> bool {
        let (reply, rx) = oneshot::channel();
        let cmd = ClientCmd::Start {
            host: host.into(),
            port,
            reply,
        };
        if self.cmd_tx.send(cmd).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Close the connection and drop all pending work. Requests in flight are
    /// discarded without firing their callbacks. Idempotent.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(ClientCmd::Stop { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Queue a request for delivery. Returns the send id to cancel with, or
    /// 0 when the body does not fit a frame. The callback fires exactly once
    /// unless the request is cancelled or the client is stopped first.
    pub fn send_req_async(
        &self,
        cmd: u32,
        body: &[u8],
        opt: Option<SendOpt>,
        callback: impl FnOnce(u32, i32, Packet) + Send + 'static,
    ) -> u32 {
        let seq = self.cur_seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let Ok(packet) = Packet::build(cmd, seq, false, Bytes::copy_from_slice(body))
        else {
            warn!(cmd, "request body does not fit a frame");
            return 0;
        };

        let send_id = self
            .cur_send_id
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1);

        let _ = self.cmd_tx.send(ClientCmd::SendReq {
            packet,
            send_id,
            opt: opt.unwrap_or_default(),
            callback: Box::new(callback),
        });

        send_id
    }

    /// Awaitable wrapper over [`send_req_async`](Self::send_req_async):
    /// resolves to the response packet or an error on timeout/teardown.
    pub async fn send_req(
        &self,
        cmd: u32,
        body: &[u8],
        opt: Option<SendOpt>,
    ) -> Result<Packet> {
        let (tx, rx) = oneshot::channel();
        let send_id = self.send_req_async(cmd, body, opt, move |_, result, packet| {
            let _ = tx.send((result, packet));
        });
        ensure!(send_id != 0, "request body does not fit a frame");

        let (result, packet) = rx
            .await
            .map_err(|_| anyhow!("request dropped before completion"))?;
        ensure!(
            result == SEND_RESULT_OK,
            "request went unanswered after every retry"
        );
        Ok(packet)
    }

    /// Forget a queued request. Its callback will not fire.
    pub fn send_cancel(&self, send_id: u32) {
        let _ = self.cmd_tx.send(ClientCmd::SendCancel { send_id });
    }

    /// Route pushes carrying `cmd` to `callback`. One handler per cmd; a
    /// second subscription replaces the first.
    pub fn subscribe_notification(
        &self,
        cmd: u32,
        callback: impl Fn(Packet) + Send + Sync + 'static,
    ) {
        let _ = self.cmd_tx.send(ClientCmd::Subscribe {
            cmd,
            callback: Arc::new(callback),
        });
    }

    pub fn unsubscribe_notification(&self, cmd: u32) {
        let _ = self.cmd_tx.send(ClientCmd::Unsubscribe { cmd });
    }
}

impl Drop for ReliableClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectState {
    Disconnected,
    Connecting,
    Connected,
}

struct ClientActor {
    cfg: ClientConfig,
    cmd_tx: mpsc::UnboundedSender<ClientCmd>,
    started: Arc<AtomicBool>,
    cur_seq: Arc<AtomicU32>,
    timer: TimerService,
    check_timer_id: u32,
    host: String,
    port: u16,
    connect_state: ConnectState,
    connect_attempt: u32,
    reader: Option<OwnedReadHalf>,
    writer_tx: Option<mpsc::UnboundedSender<Bytes>>,
    read_buf: BytesMut,
    pending: Vec<PendingRequest>,
    notifications: HashMap<u32, NotificationCallback>,
    tracker: RecentPacketTracker,
    last_connect: Instant,
    last_heartbeat: Instant,
}

impl ClientActor {
    fn new(
        cfg: ClientConfig,
        cmd_tx: mpsc::UnboundedSender<ClientCmd>,
        started: Arc<AtomicBool>,
        cur_seq: Arc<AtomicU32>,
    ) -> Self {
        let read_buf = BytesMut::with_capacity(cfg.read_buffer_capacity);
        Self {
            cfg,
            cmd_tx,
            started,
            cur_seq,
            timer: TimerService::new(),
            check_timer_id: 0,
            host: String::new(),
            port: 0,
            connect_state: ConnectState::Disconnected,
            connect_attempt: 0,
            reader: None,
            writer_tx: None,
            read_buf,
            pending: Vec::new(),
            notifications: HashMap::new(),
            tracker: RecentPacketTracker::new(),
            last_connect: Instant::now(),
            last_heartbeat: Instant::now(),
        }
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<ClientCmd>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    self.handle_cmd(cmd);
                }
                read = read_some(&mut self.reader, &mut self.read_buf) => {
                    self.on_read(read);
                }
            }
        }
        self.stop_impl();
    }

    fn handle_cmd(&mut self, cmd: ClientCmd) {
        match cmd {
            ClientCmd::Start { host, port, reply } => {
                let _ = reply.send(self.start_impl(host, port));
            }
            ClientCmd::Stop { reply } => {
                self.stop_impl();
                let _ = reply.send(());
            }
            ClientCmd::SendReq {
                packet,
                send_id,
                opt,
                callback,
            } => self.send_req_impl(packet, send_id, opt, callback),
            ClientCmd::SendCancel { send_id } => self.send_cancel_impl(send_id),
            ClientCmd::Subscribe { cmd, callback } => {
                self.notifications.insert(cmd, callback);
            }
            ClientCmd::Unsubscribe { cmd } => {
                self.notifications.remove(&cmd);
            }
            ClientCmd::Tick => self.on_periodic_check(),
            ClientCmd::ConnectFinished { attempt, result } => {
                self.on_connect_finished(attempt, result);
            }
            ClientCmd::WriteFailed { attempt } => {
                if attempt == self.connect_attempt {
                    self.do_close();
                }
            }
        }
    }

    fn start_impl(&mut self, host: String, port: u16) -> bool {
        if self.started.load(Ordering::Acquire) {
            return true;
        }
        self.started.store(true, Ordering::Release);
        self.host = host;
        self.port = port;

        self.do_connect();
        let cmd_tx = self.cmd_tx.clone();
        self.check_timer_id = self.timer.start_timer(
            move || {
                let _ = cmd_tx.send(ClientCmd::Tick);
            },
            CHECK_INTERVAL_SECONDS,
            CHECK_INTERVAL_SECONDS,
        );
        self.check_timer_id != 0
    }

    fn stop_impl(&mut self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }

        self.timer.stop_timer(self.check_timer_id);
        self.check_timer_id = 0;

        self.do_close();

        // pending callbacks are dropped unfired: at-most-once on shutdown
        self.read_buf.clear();
        self.pending.clear();
        self.notifications.clear();
        self.tracker.clear();
    }

    fn do_connect(&mut self) {
        if !self.started.load(Ordering::Acquire) {
            return;
        }

        self.last_connect = Instant::now();
        self.connect_state = ConnectState::Connecting;
        self.connect_attempt = self.connect_attempt.wrapping_add(1);

        let attempt = self.connect_attempt;
        let host = self.host.clone();
        let port = self.port;
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let result = TcpStream::connect((host.as_str(), port)).await;
            let _ = cmd_tx.send(ClientCmd::ConnectFinished { attempt, result });
        });
    }

    fn on_connect_finished(
        &mut self,
        attempt: u32,
        result: std::io::Result<TcpStream>,
    ) {
        if attempt != self.connect_attempt
            || self.connect_state != ConnectState::Connecting
            || !self.started.load(Ordering::Acquire)
        {
            // a connect outcome from before a stop() or a newer attempt
            return;
        }

        let stream = match result {
            Ok(stream) => stream,
            Err(err) => {
                debug!("connect to {}:{} failed: {err}", self.host, self.port);
                self.connect_state = ConnectState::Disconnected;
                return;
            }
        };

        if let Err(err) = stream.set_nodelay(true) {
            debug!("set_nodelay failed: {err}");
        }

        let (read_half, write_half) = stream.into_split();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let cmd_tx = self.cmd_tx.clone();
        spawn_frame_writer(write_half, writer_rx, move || {
            let _ = cmd_tx.send(ClientCmd::WriteFailed { attempt });
        });

        self.reader = Some(read_half);
        self.writer_tx = Some(writer_tx);
        self.connect_state = ConnectState::Connected;
        debug!("connected to {}:{}", self.host, self.port);
    }

    fn do_close(&mut self) {
        if self.connect_state == ConnectState::Disconnected {
            return;
        }
        debug!("client closing connection");
        self.reader = None;
        self.writer_tx = None;
        self.connect_state = ConnectState::Disconnected;
    }

    fn on_read(&mut self, read: std::io::Result<usize>) {
        match read {
            Ok(0) => {
                debug!("connection closed by peer");
                self.do_close();
            }
            Ok(_) => self.process_packets(),
            Err(err) => {
                debug!("socket read failed: {err}");
                self.do_close();
            }
        }
    }

    fn process_packets(&mut self) {
        loop {
            let (packet, consumed) = Packet::parse(&self.read_buf);
            self.read_buf.advance(consumed);
            let Some(packet) = packet else { break };

            debug!(cmd = packet.cmd(), seq = packet.seq(), "client recv packet");
            if packet.is_push() {
                self.process_push_packet(packet);
            } else {
                self.process_response_packet(packet);
            }
        }
    }

    fn process_response_packet(&mut self, packet: Packet) {
        let Some(index) = self.pending.iter().position(|entry| {
            entry.packet.cmd() == packet.cmd() && entry.packet.seq() == packet.seq()
        }) else {
            return;
        };
        let entry = self.pending.remove(index);
        (entry.callback)(entry.send_id, SEND_RESULT_OK, packet);
    }

    fn process_push_packet(&mut self, packet: Packet) {
        self.ack_push_packet(&packet);

        let duplicate = self.tracker.observe(packet.cmd(), packet.seq());
        if duplicate {
            debug!(cmd = packet.cmd(), seq = packet.seq(), "duplicate push dropped");
            return;
        }

        if let Some(callback) = self.notifications.get(&packet.cmd()) {
            callback(packet);
        }
    }

    fn ack_push_packet(&mut self, packet: &Packet) {
        if self.connect_state != ConnectState::Connected {
            return;
        }
        self.write_frame(Packet::push_ack(packet.cmd(), packet.seq()).frame());
    }

    fn on_periodic_check(&mut self) {
        let now = Instant::now();
        self.do_reconnect_check(now);
        self.do_resender_check(now);
        self.do_heartbeat_check(now);
    }

    fn do_reconnect_check(&mut self, now: Instant) {
        if self.connect_state != ConnectState::Disconnected {
            return;
        }
        if now.duration_since(self.last_connect).as_secs()
            < self.cfg.reconnect_interval_seconds
        {
            return;
        }
        self.do_connect();
    }

    fn do_resender_check(&mut self, now: Instant) {
        let mut index = 0;
        while index < self.pending.len() {
            let waited = now.duration_since(self.pending[index].last_send).as_secs();
            if waited < self.pending[index].opt.interval_seconds {
                index += 1;
                continue;
            }

            if self.pending[index].cur_tries >= self.pending[index].opt.tries {
                let entry = self.pending.remove(index);
                debug!(send_id = entry.send_id, "request used up its retry budget");
                (entry.callback)(entry.send_id, SEND_RESULT_TIMEOUT, entry.packet);
                continue;
            }

            let frame = {
                let entry = &mut self.pending[index];
                entry.cur_tries += 1;
                entry.last_send = now;
                entry.packet.frame()
            };
            self.write_frame(frame);
            index += 1;
        }
    }

    fn do_heartbeat_check(&mut self, now: Instant) {
        let interval = self.cfg.heartbeat_interval_seconds;
        if interval == 0 {
            return;
        }
        if now.duration_since(self.last_heartbeat).as_secs() < interval {
            return;
        }
        if self.connect_state != ConnectState::Connected {
            return;
        }

        let seq = self.cur_seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        self.write_frame(Packet::heartbeat(seq).frame());
        self.last_heartbeat = now;
    }

    fn send_req_impl(
        &mut self,
        packet: Packet,
        send_id: u32,
        opt: SendOpt,
        callback: SendCallback,
    ) {
        let frame = packet.frame();
        self.pending.push(PendingRequest {
            send_id,
            packet,
            opt,
            cur_tries: 1,
            last_send: Instant::now(),
            callback,
        });
        self.write_frame(frame);
    }

    fn send_cancel_impl(&mut self, send_id: u32) {
        if let Some(index) = self
            .pending
            .iter()
            .position(|entry| entry.send_id == send_id)
        {
            // dropped without firing the callback
            self.pending.remove(index);
        }
    }

    fn write_frame(&self, frame: Bytes) {
        if self.connect_state != ConnectState::Connected {
            return;
        }
        if let Some(writer_tx) = &self.writer_tx {
            let _ = writer_tx.send(frame);
        }
    }
}
