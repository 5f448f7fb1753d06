// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::{Buf, Bytes, BytesMut};
use tokio::{
    net::{TcpStream, tcp::OwnedReadHalf},
    sync::mpsc,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    cfg::config::ServerConfig,
    net::{read_some, spawn_frame_writer},
    packet::{codec::Packet, tracker::RecentPacketTracker},
    timer::TimerService,
};

const CHECK_INTERVAL_SECONDS: u32 = 1;

/// Callback a session uses to hand parsed inbound frames to its server.
pub(crate) type ReceivePacketCallback = Box<dyn Fn(u32, Packet) + Send>;

enum SessionCmd {
    SendPacket(Packet),
    Tick,
}

/// Owning handle kept in the server's registry. Dropping it cancels the
/// session's event loop and closes the socket.
pub(crate) struct SessionHandle {
    cmd_tx: mpsc::UnboundedSender<SessionCmd>,
    cancel: CancellationToken,
}

impl SessionHandle {
    /// Queue a frame for this session. Pushes are retried until ACKed;
    /// responses go out once.
    pub(crate) fn send_packet(&self, packet: Packet) {
        let _ = self.cmd_tx.send(SessionCmd::SendPacket(packet));
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Wrap one accepted socket in its own event loop.
pub(crate) fn spawn(
    session_id: u32,
    stream: TcpStream,
    cfg: &ServerConfig,
    receive_packet_callback: ReceivePacketCallback,
) -> SessionHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    if let Err(err) = stream.set_nodelay(true) {
        debug!(session_id, "set_nodelay failed: {err}");
    }
    let (read_half, write_half) = stream.into_split();
    let (writer_tx, writer_rx) = mpsc::unbounded_channel();
    // write errors are not reported back: retransmission is timer-driven and
    // the liveness sweep prunes dead sessions
    spawn_frame_writer(write_half, writer_rx, || {});

    let actor = SessionActor {
        session_id,
        resend_tries: cfg.resend_tries,
        resend_interval_seconds: cfg.resend_interval_seconds,
        receive_packet_callback,
        reader: Some(read_half),
        writer_tx,
        read_buf: BytesMut::with_capacity(cfg.read_buffer_capacity),
        pending: Vec::new(),
        tracker: RecentPacketTracker::new(),
        timer: TimerService::new(),
        check_timer_id: 0,
        cmd_tx: cmd_tx.clone(),
    };
    tokio::spawn(actor.run(cmd_rx, cancel.clone()));

    SessionHandle { cmd_tx, cancel }
}

struct PendingPush {
    packet: Packet,
    cur_tries: u32,
    last_send: Instant,
}

struct SessionActor {
    session_id: u32,
    resend_tries: u32,
    resend_interval_seconds: u64,
    receive_packet_callback: ReceivePacketCallback,
    reader: Option<OwnedReadHalf>,
    writer_tx: mpsc::UnboundedSender<Bytes>,
    read_buf: BytesMut,
    pending: Vec<PendingPush>,
    tracker: RecentPacketTracker,
    timer: TimerService,
    check_timer_id: u32,
    cmd_tx: mpsc::UnboundedSender<SessionCmd>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<SessionCmd>,
        cancel: CancellationToken,
    ) {
        let cmd_tx = self.cmd_tx.clone();
        self.check_timer_id = self.timer.start_timer(
            move || {
                let _ = cmd_tx.send(SessionCmd::Tick);
            },
            CHECK_INTERVAL_SECONDS,
            CHECK_INTERVAL_SECONDS,
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(SessionCmd::SendPacket(packet)) => {
                            self.send_packet_impl(packet);
                        }
                        Some(SessionCmd::Tick) => self.on_periodic_check(),
                        None => break,
                    }
                }
                read = read_some(&mut self.reader, &mut self.read_buf) => {
                    self.on_read(read);
                }
            }
        }
        self.do_stop();
    }

    fn do_stop(&mut self) {
        debug!(session_id = self.session_id, "session closing");
        self.timer.stop_timer(self.check_timer_id);
        self.check_timer_id = 0;
        self.reader = None;
        self.read_buf.clear();
        self.pending.clear();
        self.tracker.clear();
    }

    fn send_packet_impl(&mut self, packet: Packet) {
        if packet.is_push() {
            self.pending.push(PendingPush {
                packet: packet.clone(),
                cur_tries: 1,
                last_send: Instant::now(),
            });
        }
        self.write_frame(packet.frame());
    }

    fn on_read(&mut self, read: std::io::Result<usize>) {
        match read {
            Ok(0) => {
                debug!(session_id = self.session_id, "connection closed by peer");
                self.reader = None;
            }
            Ok(_) => self.process_packets(),
            Err(err) => {
                // stop reading; the server's liveness sweep prunes us later
                debug!(session_id = self.session_id, "socket read failed: {err}");
                self.reader = None;
            }
        }
    }

    fn process_packets(&mut self) {
        loop {
            let (packet, consumed) = Packet::parse(&self.read_buf);
            self.read_buf.advance(consumed);
            let Some(packet) = packet else { break };

            debug!(
                session_id = self.session_id,
                cmd = packet.cmd(),
                seq = packet.seq(),
                "server recv packet"
            );
            if packet.is_push() {
                self.process_push_packet(packet);
            } else {
                self.process_request_packet(packet);
            }
        }
    }

    fn process_request_packet(&mut self, packet: Packet) {
        let duplicate = self.tracker.observe(packet.cmd(), packet.seq());
        if duplicate {
            debug!(
                session_id = self.session_id,
                cmd = packet.cmd(),
                seq = packet.seq(),
                "duplicate request dropped"
            );
            return;
        }
        (self.receive_packet_callback)(self.session_id, packet);
    }

    /// An inbound push frame is the client ACKing one of our pushes (or a
    /// heartbeat, which matches nothing). The server still sees it so the
    /// session's liveness gets refreshed.
    fn process_push_packet(&mut self, packet: Packet) {
        if let Some(index) = self.pending.iter().position(|entry| {
            entry.packet.cmd() == packet.cmd() && entry.packet.seq() == packet.seq()
        }) {
            self.pending.remove(index);
        }
        (self.receive_packet_callback)(self.session_id, packet);
    }

    fn on_periodic_check(&mut self) {
        let now = Instant::now();
        let mut index = 0;
        while index < self.pending.len() {
            let waited = now.duration_since(self.pending[index].last_send).as_secs();
            if waited < self.resend_interval_seconds {
                index += 1;
                continue;
            }

            if self.pending[index].cur_tries >= self.resend_tries {
                // never ACKed; give up silently
                self.pending.remove(index);
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

    fn write_frame(&self, frame: Bytes) {
        // a dead writer task just means the send is dropped
        let _ = self.writer_tx.send(frame);
    }
}
