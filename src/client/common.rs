// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use tokio::time::Instant;

use crate::packet::codec::Packet;

/// Result code handed to a send callback when a matching response arrived.
pub const SEND_RESULT_OK: i32 = 0;
/// Result code handed to a send callback when every attempt went unanswered.
pub const SEND_RESULT_TIMEOUT: i32 = -1;

/// Retry policy for one request: how many times to write it and how long to
/// wait between writes.
#[derive(Debug, Clone, Copy)]
pub struct SendOpt {
    pub tries: u32,
    pub interval_seconds: u64,
}

impl Default for SendOpt {
    fn default() -> Self {
        Self {
            tries: 3,
            interval_seconds: 3,
        }
    }
}

/// Completion callback for one request. Invoked at most once, on the
/// client's event loop, with `(send_id, result, packet)` — the response
/// packet on success, the original request on retry exhaustion.
pub type SendCallback = Box<dyn FnOnce(u32, i32, Packet) + Send>;

/// Handler for pushes on a subscribed cmd. Runs on the client's event loop;
/// spawn a task for anything that needs to await.
pub type NotificationCallback = Arc<dyn Fn(Packet) + Send + Sync>;

pub(crate) struct PendingRequest {
    pub send_id: u32,
    pub packet: Packet,
    pub opt: SendOpt,
    pub cur_tries: u32,
    pub last_send: Instant,
    pub callback: SendCallback,
}
